//! Reading and writing one-dimensional `f64` arrays in the numpy npy format.
//!
//! Only what the explained-variance artifact needs is supported: little-endian `<f8`,
//! C order, shape `(n,)`. Format versions 1.0 to 3.0 are read; 1.0 is written.

use std::io::{self, Read};

/// The npy magic number.
pub(crate) const MAGIC: [u8; 6] = *b"\x93NUMPY";

const ALIGN: usize = 64;

fn invalid(msg: impl Into<String>) -> io::Error {
    io::Error::new(io::ErrorKind::InvalidData, msg.into())
}

fn header_dict(len: usize) -> String {
    format!("{{'descr': '<f8', 'fortran_order': False, 'shape': ({},), }}", len)
}

/// Writes `values` as a 1-D `<f8` array.
pub fn write_vector<W>(writer: &mut W, values: &[f64]) -> io::Result<()>
where
    W: io::Write,
{
    let mut dict = header_dict(values.len());
    // magic + version + u16 length + dict + newline must be a multiple of ALIGN
    let unpadded = MAGIC.len() + 2 + 2 + dict.len() + 1;
    let padding = (ALIGN - unpadded % ALIGN) % ALIGN;
    dict.extend(std::iter::repeat(' ').take(padding));
    dict.push('\n');

    let header_len = u16::try_from(dict.len()).map_err(|_| invalid("npy header too long"))?;
    writer.write_all(&MAGIC)?;
    writer.write_all(&[1, 0])?;
    writer.write_all(&header_len.to_le_bytes())?;
    writer.write_all(dict.as_bytes())?;
    for v in values {
        writer.write_all(&v.to_le_bytes())?;
    }
    Ok(())
}

/// Value of `key` in a python-literal header dict, up to the next top-level comma.
fn dict_value<'a>(dict: &'a str, key: &str) -> io::Result<&'a str> {
    let quoted = format!("'{}'", key);
    let start = dict
        .find(&quoted)
        .ok_or_else(|| invalid(format!("npy header lacks '{}'", key)))?
        + quoted.len();
    let rest = dict[start..].trim_start();
    let rest = rest
        .strip_prefix(':')
        .ok_or_else(|| invalid("malformed npy header"))?
        .trim_start();
    let end = if rest.starts_with('(') {
        rest.find(')').map(|i| i + 1)
    } else {
        rest.find([',', '}'])
    }
    .ok_or_else(|| invalid("malformed npy header"))?;
    Ok(rest[..end].trim())
}

fn parse_shape(shape: &str) -> io::Result<usize> {
    let inner = shape
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .ok_or_else(|| invalid(format!("bad npy shape {}", shape)))?;
    let dims: Vec<&str> = inner.split(',').map(str::trim).filter(|s| !s.is_empty()).collect();
    match dims.as_slice() {
        [n] => n.parse().map_err(|_| invalid(format!("bad npy shape {}", shape))),
        _ => Err(invalid(format!("expected a 1-D npy array, found shape {}", shape))),
    }
}

/// Reads a 1-D `<f8` array written by [`write_vector`] or `numpy.save`.
pub fn read_vector<R>(reader: &mut R) -> io::Result<Vec<f64>>
where
    R: io::Read,
{
    let mut magic = [0u8; 6];
    reader.read_exact(&mut magic)?;
    if magic != MAGIC {
        return Err(invalid("missing npy magic"));
    }
    let mut version = [0u8; 2];
    reader.read_exact(&mut version)?;
    let header_len = match version[0] {
        1 => {
            let mut buf = [0u8; 2];
            reader.read_exact(&mut buf)?;
            u16::from_le_bytes(buf) as usize
        }
        2 | 3 => {
            let mut buf = [0u8; 4];
            reader.read_exact(&mut buf)?;
            u32::from_le_bytes(buf) as usize
        }
        v => return Err(invalid(format!("unsupported npy version {}.{}", v, version[1]))),
    };
    let mut dict = Vec::new();
    (&mut *reader).take(header_len as u64).read_to_end(&mut dict)?;
    if dict.len() != header_len {
        return Err(invalid("npy header is truncated"));
    }
    let dict = String::from_utf8(dict).map_err(|_| invalid("npy header is not text"))?;

    let descr = dict_value(&dict, "descr")?;
    if descr != "'<f8'" {
        return Err(invalid(format!("unsupported npy dtype {}", descr)));
    }
    if dict_value(&dict, "fortran_order")? != "False" {
        return Err(invalid("Fortran order not supported when reading npy"));
    }
    let len = parse_shape(dict_value(&dict, "shape")?)?;

    // The shape is untrusted; size the body from what is actually on disk.
    let expected = len
        .checked_mul(8)
        .ok_or_else(|| invalid(format!("npy shape ({},) is too large", len)))?;
    let mut body = Vec::new();
    reader.read_to_end(&mut body)?;
    if body.len() != expected {
        return Err(invalid(format!(
            "npy shape ({},) needs {} data bytes, found {}",
            len,
            expected,
            body.len()
        )));
    }
    Ok(body
        .chunks_exact(8)
        .map(|c| f64::from_le_bytes([c[0], c[1], c[2], c[3], c[4], c[5], c[6], c[7]]))
        .collect())
}
