use crate::error::Error;
use crate::error::Result;
use byteorder::LE;
use byteorder::ReadBytesExt;
use byteorder::WriteBytesExt;

/// An opaque robot configuration.
///
/// The policy core never inspects a configuration; it only clones them,
/// hands them to the caller's cluster predicate, and moves their bytes
/// through the persisted format. `encode` appends the configuration's bytes
/// to the buffer and returns the count written; `decode` reads one back
/// starting at `at` and returns it with the count consumed.
pub trait Config: Clone + std::fmt::Debug + PartialEq + Send + Sync {
    fn encode(&self, buf: &mut Vec<u8>) -> u64;
    fn decode(buf: &[u8], at: u64) -> Result<(Self, u64)>;
}

/// scalar configuration, enough for one-dimensional tasks and for tests
impl Config for f64 {
    fn encode(&self, buf: &mut Vec<u8>) -> u64 {
        put_f64(buf, *self)
    }
    fn decode(buf: &[u8], at: u64) -> Result<(Self, u64)> {
        get_f64(buf, at)
    }
}

pub(crate) fn put_u8(buf: &mut Vec<u8>, value: u8) -> u64 {
    buf.write_u8(value).expect("writes to a vec cannot fail");
    1
}

pub(crate) fn put_u32(buf: &mut Vec<u8>, value: u32) -> u64 {
    buf.write_u32::<LE>(value).expect("writes to a vec cannot fail");
    4
}

pub(crate) fn put_u64(buf: &mut Vec<u8>, value: u64) -> u64 {
    buf.write_u64::<LE>(value).expect("writes to a vec cannot fail");
    8
}

pub(crate) fn put_i64(buf: &mut Vec<u8>, value: i64) -> u64 {
    buf.write_i64::<LE>(value).expect("writes to a vec cannot fail");
    8
}

pub(crate) fn put_f64(buf: &mut Vec<u8>, value: f64) -> u64 {
    buf.write_f64::<LE>(value).expect("writes to a vec cannot fail");
    8
}

pub(crate) fn get_u8(buf: &[u8], at: u64) -> Result<(u8, u64)> {
    let mut rest = rest(buf, at)?;
    let value = rest.read_u8().map_err(|_| truncated("u8"))?;
    Ok((value, 1))
}

pub(crate) fn get_u32(buf: &[u8], at: u64) -> Result<(u32, u64)> {
    let mut rest = rest(buf, at)?;
    let value = rest.read_u32::<LE>().map_err(|_| truncated("u32"))?;
    Ok((value, 4))
}

pub(crate) fn get_u64(buf: &[u8], at: u64) -> Result<(u64, u64)> {
    let mut rest = rest(buf, at)?;
    let value = rest.read_u64::<LE>().map_err(|_| truncated("u64"))?;
    Ok((value, 8))
}

pub(crate) fn get_i64(buf: &[u8], at: u64) -> Result<(i64, u64)> {
    let mut rest = rest(buf, at)?;
    let value = rest.read_i64::<LE>().map_err(|_| truncated("i64"))?;
    Ok((value, 8))
}

pub(crate) fn get_f64(buf: &[u8], at: u64) -> Result<(f64, u64)> {
    let mut rest = rest(buf, at)?;
    let value = rest.read_f64::<LE>().map_err(|_| truncated("f64"))?;
    Ok((value, 8))
}

/// length-prefixed sequence
pub(crate) fn put_seq<T>(
    buf: &mut Vec<u8>,
    items: &[T],
    encode: impl Fn(&T, &mut Vec<u8>) -> u64,
) -> u64 {
    let mut written = put_u64(buf, items.len() as u64);
    for item in items {
        written += encode(item, buf);
    }
    written
}

pub(crate) fn get_seq<T>(
    buf: &[u8],
    at: u64,
    decode: impl Fn(&[u8], u64) -> Result<(T, u64)>,
) -> Result<(Vec<T>, u64)> {
    let (count, mut consumed) = get_u64(buf, at)?;
    let mut items = Vec::new();
    for _ in 0..count {
        let (item, read) = decode(buf, at + consumed)?;
        items.push(item);
        consumed += read;
    }
    Ok((items, consumed))
}

fn rest(buf: &[u8], at: u64) -> Result<&[u8]> {
    let start = usize::try_from(at)
        .map_err(|_| Error::Malformed(format!("offset ({}) does not fit in memory", at)))?;
    buf.get(start..)
        .ok_or_else(|| Error::Malformed(format!("offset ({}) past end of buffer", start)))
}

fn truncated(what: &str) -> Error {
    Error::Malformed(format!("buffer truncated reading {}", what))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scalar_config_roundtrip() {
        let mut buf = Vec::new();
        let written = 42.5f64.encode(&mut buf);
        assert_eq!(written, 8);
        let (value, read) = f64::decode(&buf, 0).unwrap();
        assert_eq!(value, 42.5);
        assert_eq!(read, 8);
    }

    #[test]
    fn sequence_roundtrip() {
        let mut buf = Vec::new();
        let items = vec![1.0f64, 2.0, 3.0];
        let written = put_seq(&mut buf, &items, |x, b| x.encode(b));
        assert_eq!(written, 8 + 24);
        let (decoded, read) = get_seq(&buf, 0, f64::decode).unwrap();
        assert_eq!(decoded, items);
        assert_eq!(read, written);
    }

    #[test]
    fn truncated_buffer_is_malformed() {
        let buf = vec![0u8; 4];
        assert!(matches!(f64::decode(&buf, 0), Err(Error::Malformed(_))));
        assert!(matches!(get_u64(&buf, 16), Err(Error::Malformed(_))));
    }
}
