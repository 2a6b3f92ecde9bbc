//! Sample metadata tables and row predicates.
//!
//! Tables are read with every cell kept as text; predicates such as
//! `country == 'Ghana' and year >= 2017` compare numerically when both sides parse as numbers
//! and as strings otherwise.

use std::cmp::Ordering;
use std::io;
use std::path::Path;

use log::debug;

use crate::error::{Result, ScanError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct SampleTable {
    columns: Vec<String>,
    rows: Vec<Vec<String>>,
}

/// Cell texts that stand for a missing value in tabular metadata.
const MISSING_CELLS: [&str; 10] = ["", "NA", "N/A", "n/a", "NaN", "nan", "<NA>", "None", "null", "NULL"];

/// True when a metadata cell holds no value.
pub fn is_missing(cell: &str) -> bool {
    MISSING_CELLS.contains(&cell.trim())
}

fn delimiter_for(path: &Path) -> u8 {
    match path.extension().and_then(|e| e.to_str()) {
        Some("tsv") | Some("txt") => b'\t',
        _ => b',',
    }
}

impl SampleTable {
    pub fn new(columns: Vec<String>, rows: Vec<Vec<String>>) -> Result<Self> {
        if let Some((i, row)) = rows.iter().enumerate().find(|(_, r)| r.len() != columns.len()) {
            return Err(ScanError::shape(format!(
                "table row {} has {} cells, header has {} columns",
                i,
                row.len(),
                columns.len()
            )));
        }
        Ok(Self { columns, rows })
    }

    /// Reads a delimited table; `.tsv`/`.txt` files are tab separated, anything else is CSV.
    pub fn read(path: &Path) -> Result<Self> {
        let file = std::fs::File::open(path)?;
        let table = Self::from_reader(file, delimiter_for(path))?;
        debug!(
            "Loaded sample table {} ({} rows, {} columns)",
            path.display(),
            table.n_rows(),
            table.columns.len()
        );
        Ok(table)
    }

    pub fn from_reader<R: io::Read>(reader: R, delimiter: u8) -> Result<Self> {
        let mut reader = csv::ReaderBuilder::new()
            .delimiter(delimiter)
            .has_headers(true)
            .from_reader(reader);
        let columns = reader.headers()?.iter().map(String::from).collect();
        let mut rows = Vec::new();
        for record in reader.records() {
            rows.push(record?.iter().map(String::from).collect());
        }
        Self::new(columns, rows)
    }

    pub fn write_csv<W: io::Write>(&self, writer: W) -> Result<()> {
        let mut writer = csv::Writer::from_writer(writer);
        writer.write_record(&self.columns)?;
        for row in &self.rows {
            writer.write_record(row)?;
        }
        writer.flush()?;
        Ok(())
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn n_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn row(&self, index: usize) -> &[String] {
        &self.rows[index]
    }

    pub fn column_index(&self, name: &str) -> Result<usize> {
        self.columns
            .iter()
            .position(|c| c == name)
            .ok_or_else(|| ScanError::invalid(format!("no column named '{}' in sample table", name)))
    }

    pub fn column(&self, name: &str) -> Result<Vec<&str>> {
        let idx = self.column_index(name)?;
        Ok(self.rows.iter().map(|r| r[idx].as_str()).collect())
    }

    pub fn filter_rows(&self, mask: &[bool]) -> Result<Self> {
        if mask.len() != self.rows.len() {
            return Err(ScanError::shape(format!(
                "row mask has length {}, table has {} rows",
                mask.len(),
                self.rows.len()
            )));
        }
        let rows = self
            .rows
            .iter()
            .zip(mask)
            .filter_map(|(r, &keep)| keep.then(|| r.clone()))
            .collect();
        Ok(Self {
            columns: self.columns.clone(),
            rows,
        })
    }

    /// Appends a column, replacing any existing column of the same name.
    pub fn with_column(&self, name: &str, values: Vec<String>) -> Result<Self> {
        if values.len() != self.rows.len() {
            return Err(ScanError::shape(format!(
                "column '{}' has {} values, table has {} rows",
                name,
                values.len(),
                self.rows.len()
            )));
        }
        let mut out = self.clone();
        match out.columns.iter().position(|c| c == name) {
            Some(idx) => {
                for (row, v) in out.rows.iter_mut().zip(values) {
                    row[idx] = v;
                }
            }
            None => {
                out.columns.push(name.to_string());
                for (row, v) in out.rows.iter_mut().zip(values) {
                    row.push(v);
                }
            }
        }
        Ok(out)
    }

    /// Evaluates a parsed query against one row.
    pub fn evaluate(&self, query: &SampleQuery, row: usize) -> Result<bool> {
        query.expr.eval(self, row)
    }

    /// Row mask for a query; unknown columns fail before any row is evaluated.
    pub fn mask(&self, query: &SampleQuery) -> Result<Vec<bool>> {
        for column in query.expr.columns() {
            self.column_index(column)?;
        }
        (0..self.n_rows()).map(|r| self.evaluate(query, r)).collect()
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum CmpOp {
    Eq,
    Ne,
    Lt,
    Le,
    Gt,
    Ge,
}

impl CmpOp {
    fn holds(self, ord: Ordering) -> bool {
        match self {
            CmpOp::Eq => ord == Ordering::Equal,
            CmpOp::Ne => ord != Ordering::Equal,
            CmpOp::Lt => ord == Ordering::Less,
            CmpOp::Le => ord != Ordering::Greater,
            CmpOp::Gt => ord == Ordering::Greater,
            CmpOp::Ge => ord != Ordering::Less,
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Expr {
    Or(Box<Expr>, Box<Expr>),
    And(Box<Expr>, Box<Expr>),
    Not(Box<Expr>),
    Cmp(String, CmpOp, String),
    In(String, Vec<String>),
}

fn compare(cell: &str, literal: &str) -> Ordering {
    match (cell.trim().parse::<f64>(), literal.parse::<f64>()) {
        (Ok(a), Ok(b)) => a.partial_cmp(&b).unwrap_or(Ordering::Equal),
        _ => cell.cmp(literal),
    }
}

impl Expr {
    fn eval(&self, table: &SampleTable, row: usize) -> Result<bool> {
        Ok(match self {
            Expr::Or(a, b) => a.eval(table, row)? || b.eval(table, row)?,
            Expr::And(a, b) => a.eval(table, row)? && b.eval(table, row)?,
            Expr::Not(a) => !a.eval(table, row)?,
            Expr::Cmp(col, op, lit) => {
                let cell = &table.row(row)[table.column_index(col)?];
                op.holds(compare(cell, lit))
            }
            Expr::In(col, lits) => {
                let cell = &table.row(row)[table.column_index(col)?];
                lits.iter().any(|lit| compare(cell, lit) == Ordering::Equal)
            }
        })
    }

    fn columns(&self) -> Vec<&str> {
        match self {
            Expr::Or(a, b) | Expr::And(a, b) => {
                let mut cols = a.columns();
                cols.extend(b.columns());
                cols
            }
            Expr::Not(a) => a.columns(),
            Expr::Cmp(col, _, _) | Expr::In(col, _) => vec![col.as_str()],
        }
    }
}

#[derive(Clone, Debug, PartialEq)]
enum Token {
    Ident(String),
    Literal(String),
    Op(CmpOp),
    And,
    Or,
    Not,
    In,
    LParen,
    RParen,
    LBracket,
    RBracket,
    Comma,
}

fn tokenize(src: &str) -> Result<Vec<Token>> {
    let chars: Vec<char> = src.chars().collect();
    let mut tokens = Vec::new();
    let mut i = 0;
    let err = |msg: String| ScanError::invalid(format!("sample query '{}': {}", src, msg));

    while i < chars.len() {
        let c = chars[i];
        match c {
            _ if c.is_whitespace() => i += 1,
            '(' => {
                tokens.push(Token::LParen);
                i += 1;
            }
            ')' => {
                tokens.push(Token::RParen);
                i += 1;
            }
            '[' => {
                tokens.push(Token::LBracket);
                i += 1;
            }
            ']' => {
                tokens.push(Token::RBracket);
                i += 1;
            }
            ',' => {
                tokens.push(Token::Comma);
                i += 1;
            }
            '&' => {
                tokens.push(Token::And);
                i += 1;
            }
            '|' => {
                tokens.push(Token::Or);
                i += 1;
            }
            '=' | '!' | '<' | '>' => {
                let next = chars.get(i + 1).copied();
                let (op, width) = match (c, next) {
                    ('=', Some('=')) => (CmpOp::Eq, 2),
                    ('!', Some('=')) => (CmpOp::Ne, 2),
                    ('<', Some('=')) => (CmpOp::Le, 2),
                    ('>', Some('=')) => (CmpOp::Ge, 2),
                    ('<', _) => (CmpOp::Lt, 1),
                    ('>', _) => (CmpOp::Gt, 1),
                    _ => return Err(err(format!("unexpected '{}' at {}", c, i))),
                };
                tokens.push(Token::Op(op));
                i += width;
            }
            '\'' | '"' => {
                let end = chars[i + 1..]
                    .iter()
                    .position(|&x| x == c)
                    .ok_or_else(|| err(format!("unterminated string starting at {}", i)))?;
                tokens.push(Token::Literal(chars[i + 1..i + 1 + end].iter().collect()));
                i += end + 2;
            }
            _ if c.is_ascii_digit() || c == '-' || c == '.' => {
                let start = i;
                i += 1;
                while i < chars.len() && (chars[i].is_ascii_alphanumeric() || chars[i] == '.' || chars[i] == '-') {
                    i += 1;
                }
                let text: String = chars[start..i].iter().collect();
                if text.parse::<f64>().is_err() {
                    return Err(err(format!("bad number '{}'", text)));
                }
                tokens.push(Token::Literal(text));
            }
            _ if c.is_alphabetic() || c == '_' || c == '`' => {
                let (start, quoted) = if c == '`' { (i + 1, true) } else { (i, false) };
                i = start;
                while i < chars.len()
                    && (if quoted { chars[i] != '`' } else { chars[i].is_alphanumeric() || chars[i] == '_' || chars[i] == '.' })
                {
                    i += 1;
                }
                let word: String = chars[start..i].iter().collect();
                if quoted {
                    i += 1;
                    tokens.push(Token::Ident(word));
                    continue;
                }
                tokens.push(match word.as_str() {
                    "and" => Token::And,
                    "or" => Token::Or,
                    "not" => Token::Not,
                    "in" => Token::In,
                    "True" | "true" => Token::Literal("True".to_string()),
                    "False" | "false" => Token::Literal("False".to_string()),
                    _ => Token::Ident(word),
                });
            }
            _ => return Err(err(format!("unexpected '{}' at {}", c, i))),
        }
    }
    Ok(tokens)
}

struct Parser<'a> {
    src: &'a str,
    tokens: Vec<Token>,
    pos: usize,
}

impl<'a> Parser<'a> {
    fn err(&self, msg: &str) -> ScanError {
        ScanError::invalid(format!("sample query '{}': {}", self.src, msg))
    }

    fn peek(&self) -> Option<&Token> {
        self.tokens.get(self.pos)
    }

    fn next(&mut self) -> Option<Token> {
        let tok = self.tokens.get(self.pos).cloned();
        self.pos += 1;
        tok
    }

    fn expect(&mut self, want: Token) -> Result<()> {
        match self.next() {
            Some(t) if t == want => Ok(()),
            other => Err(self.err(&format!("expected {:?}, found {:?}", want, other))),
        }
    }

    fn or_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.and_expr()?;
        while self.peek() == Some(&Token::Or) {
            self.pos += 1;
            lhs = Expr::Or(Box::new(lhs), Box::new(self.and_expr()?));
        }
        Ok(lhs)
    }

    fn and_expr(&mut self) -> Result<Expr> {
        let mut lhs = self.unary()?;
        while self.peek() == Some(&Token::And) {
            self.pos += 1;
            lhs = Expr::And(Box::new(lhs), Box::new(self.unary()?));
        }
        Ok(lhs)
    }

    fn unary(&mut self) -> Result<Expr> {
        match self.next() {
            Some(Token::Not) => Ok(Expr::Not(Box::new(self.unary()?))),
            Some(Token::LParen) => {
                let inner = self.or_expr()?;
                self.expect(Token::RParen)?;
                Ok(inner)
            }
            Some(Token::Ident(col)) => match self.next() {
                Some(Token::Op(op)) => match self.next() {
                    Some(Token::Literal(lit)) => Ok(Expr::Cmp(col, op, lit)),
                    other => Err(self.err(&format!("expected a literal after {:?}, found {:?}", op, other))),
                },
                Some(Token::In) => {
                    self.expect(Token::LBracket)?;
                    let mut values = Vec::new();
                    loop {
                        match self.next() {
                            Some(Token::Literal(lit)) => values.push(lit),
                            Some(Token::RBracket) if values.is_empty() => break,
                            other => return Err(self.err(&format!("expected a list item, found {:?}", other))),
                        }
                        match self.next() {
                            Some(Token::Comma) => continue,
                            Some(Token::RBracket) => break,
                            other => return Err(self.err(&format!("expected ',' or ']', found {:?}", other))),
                        }
                    }
                    Ok(Expr::In(col, values))
                }
                other => Err(self.err(&format!("expected a comparison after '{}', found {:?}", col, other))),
            },
            other => Err(self.err(&format!("unexpected token {:?}", other))),
        }
    }
}

/// A parsed sample-selection predicate.
#[derive(Clone, Debug, PartialEq)]
pub struct SampleQuery {
    source: String,
    expr: Expr,
}

impl SampleQuery {
    pub fn parse(src: &str) -> Result<Self> {
        let mut parser = Parser {
            src,
            tokens: tokenize(src)?,
            pos: 0,
        };
        let expr = parser.or_expr()?;
        if parser.pos != parser.tokens.len() {
            return Err(parser.err("trailing tokens"));
        }
        Ok(Self {
            source: src.to_string(),
            expr,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn table() -> SampleTable {
        let text = "sample_id,country,location,year,phenotype,species\n\
                    s1,Ghana,Obuasi,2017,alive,gambiae\n\
                    s2,Ghana,Obuasi,2017,dead,gambiae\n\
                    s3,Mali,Bamako,2012,alive,coluzzii\n\
                    s4,Ghana,Madina,2018,dead,coluzzii\n";
        SampleTable::from_reader(text.as_bytes(), b',').unwrap()
    }

    fn mask(q: &str) -> Vec<bool> {
        table().mask(&SampleQuery::parse(q).unwrap()).unwrap()
    }

    #[test]
    fn test_string_and_numeric_comparisons() {
        assert_eq!(mask("country == 'Ghana'"), vec![true, true, false, true]);
        assert_eq!(mask("year >= 2017"), vec![true, true, false, true]);
        assert_eq!(mask("year > 2017.5"), vec![false, false, false, true]);
        assert_eq!(mask("country != \"Ghana\""), vec![false, false, true, false]);
    }

    #[test]
    fn test_boolean_combinators() {
        assert_eq!(mask("country == 'Ghana' and phenotype == 'dead'"), vec![false, true, false, true]);
        assert_eq!(mask("location == 'Bamako' | year == 2018"), vec![false, false, true, true]);
        assert_eq!(mask("not (country == 'Ghana' & year == 2017)"), vec![false, false, true, true]);
        assert_eq!(mask("species in ['coluzzii', 'arabiensis']"), vec![false, false, true, true]);
    }

    #[test]
    fn test_and_binds_tighter_than_or() {
        assert_eq!(
            mask("country == 'Mali' or country == 'Ghana' and year == 2018"),
            vec![false, false, true, true]
        );
    }

    #[test]
    fn test_bad_queries() {
        assert!(SampleQuery::parse("country = 'Ghana'").is_err());
        assert!(SampleQuery::parse("country == 'Ghana").is_err());
        assert!(SampleQuery::parse("country == 'Ghana' year").is_err());
        let q = SampleQuery::parse("continent == 'Africa'").unwrap();
        assert!(matches!(table().mask(&q), Err(ScanError::InvalidParameter(_))));
    }

    #[test]
    fn test_with_column_and_roundtrip() {
        let t = table()
            .with_column("PC1", vec!["0.5".into(), "-1".into(), "2".into(), "0".into()])
            .unwrap();
        assert_eq!(t.columns().last().map(String::as_str), Some("PC1"));
        let mut buf = Vec::new();
        t.write_csv(&mut buf).unwrap();
        let back = SampleTable::from_reader(buf.as_slice(), b',').unwrap();
        assert_eq!(back, t);
        assert!(table().with_column("PC1", vec![]).is_err());
    }

    #[test]
    fn test_missing_cells() {
        for cell in ["", "  ", "NA", "NaN", "nan", "None"] {
            assert!(is_missing(cell), "{:?}", cell);
        }
        assert!(!is_missing("alive"));
        assert!(!is_missing("0"));
    }

    #[test]
    fn test_filter_rows() {
        let t = table().filter_rows(&[false, true, true, false]).unwrap();
        assert_eq!(t.column("sample_id").unwrap(), vec!["s2", "s3"]);
    }
}
