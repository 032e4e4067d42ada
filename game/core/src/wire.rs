//! Helpers for the variable length fields of the manual packet codecs.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use courier::net::support::{ErrorType, NetworkError, NetworkResult, SizedRead, SizedWrite};

/// Encoded size of a length prefixed string.
#[inline]
pub fn string_size(value: &str) -> usize {
    1 + value.len()
}

/// Writes a string prefixed by its length as a single byte. Strings longer than `max` bytes are
/// rejected rather than truncated.
#[inline]
pub fn write_string<W: SizedWrite>(stream: &mut W, value: &str, max: usize) -> NetworkResult<()> {
    if value.len() > max || value.len() > u8::max_value() as usize {
        return Err(NetworkError::Fatal(ErrorType::InvalidField("string length")));
    }

    if stream.free_capacity() < string_size(value) {
        return Err(NetworkError::Wait);
    }

    stream.write_u8(value.len() as u8)?;
    stream.write_all(value.as_bytes())?;
    Ok(())
}

#[inline]
pub fn read_string<R: SizedRead>(stream: &mut R, max: usize) -> NetworkResult<String> {
    let len = stream.read_u8()? as usize;

    if len > max {
        return Err(NetworkError::Fatal(ErrorType::InvalidField("string length")));
    }

    if stream.remaining_data() < len {
        return Err(NetworkError::Fatal(ErrorType::Truncated));
    }

    let mut bytes = vec![0; len];
    stream.read_exact(&mut bytes)?;

    String::from_utf8(bytes).map_err(|_| NetworkError::Fatal(ErrorType::InvalidField("utf-8")))
}

/// Encoded size of a length prefixed byte block.
#[inline]
pub fn bytes_size(value: &[u8]) -> usize {
    2 + value.len()
}

#[inline]
pub fn write_bytes<W: SizedWrite>(stream: &mut W, value: &[u8], max: usize) -> NetworkResult<()> {
    if value.len() > max || value.len() > u16::max_value() as usize {
        return Err(NetworkError::Fatal(ErrorType::InvalidField("block length")));
    }

    if stream.free_capacity() < bytes_size(value) {
        return Err(NetworkError::Wait);
    }

    stream.write_u16::<BigEndian>(value.len() as u16)?;
    stream.write_all(value)?;
    Ok(())
}

#[inline]
pub fn read_bytes<R: SizedRead>(stream: &mut R, max: usize) -> NetworkResult<Vec<u8>> {
    let len = stream.read_u16::<BigEndian>()? as usize;

    if len > max {
        return Err(NetworkError::Fatal(ErrorType::InvalidField("block length")));
    }

    if stream.remaining_data() < len {
        return Err(NetworkError::Fatal(ErrorType::Truncated));
    }

    let mut bytes = vec![0; len];
    stream.read_exact(&mut bytes)?;
    Ok(bytes)
}

#[inline]
pub fn write_bool<W: SizedWrite>(stream: &mut W, value: bool) -> NetworkResult<()> {
    stream.write_u8(value as u8)?;
    Ok(())
}

#[inline]
pub fn read_bool<R: SizedRead>(stream: &mut R) -> NetworkResult<bool> {
    match stream.read_u8()? {
        0 => Ok(false),
        1 => Ok(true),
        _ => Err(NetworkError::Fatal(ErrorType::InvalidField("bool"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_string_roundtrip() {
        let mut buffer = [0u8; 16];
        write_string(&mut Cursor::new(&mut buffer[..]), "tanya", 12).unwrap();

        assert_eq!(&buffer[..6], &[5, b't', b'a', b'n', b'y', b'a']);
        assert_eq!(read_string(&mut Cursor::new(&buffer[..]), 12).unwrap(), "tanya");
    }

    #[test]
    fn test_string_limits() {
        let mut buffer = [0u8; 4];

        assert_eq!(
            write_string(&mut Cursor::new(&mut buffer[..]), "much too long", 4).unwrap_err(),
            NetworkError::Fatal(ErrorType::InvalidField("string length"))
        );
        assert_eq!(
            write_string(&mut Cursor::new(&mut buffer[..]), "four", 12).unwrap_err(),
            NetworkError::Wait
        );
        assert_eq!(
            read_string(&mut Cursor::new(&[9u8, b'a'][..]), 12).unwrap_err(),
            NetworkError::Fatal(ErrorType::Truncated)
        );
        assert_eq!(
            read_string(&mut Cursor::new(&[2u8, 0xff, 0xfe][..]), 12).unwrap_err(),
            NetworkError::Fatal(ErrorType::InvalidField("utf-8"))
        );
    }

    #[test]
    fn test_bool() {
        assert_eq!(read_bool(&mut Cursor::new(&[2u8][..])).unwrap_err(), NetworkError::Fatal(ErrorType::InvalidField("bool")));
        assert!(read_bool(&mut Cursor::new(&[1u8][..])).unwrap());
    }
}
