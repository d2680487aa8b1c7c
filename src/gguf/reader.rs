//! Primitive little-endian readers over a byte cursor
//!
//! Every multi-byte quantity in a GGUF container is little-endian. These
//! helpers convert truncation into `LoadError::Parse` with the name of the
//! field being read, so a corrupt file reports where it broke.

use std::io::{Cursor, Read};

use crate::error::LoadError;

fn read_exact(cursor: &mut Cursor<&[u8]>, buf: &mut [u8], what: &str) -> Result<(), LoadError> {
    cursor.read_exact(buf).map_err(|_| LoadError::Parse {
        reason: format!("truncated while reading {what}"),
    })
}

/// Read a `u8`
pub fn read_u8(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<u8, LoadError> {
    let mut buf = [0u8; 1];
    read_exact(cursor, &mut buf, what)?;
    Ok(buf[0])
}

/// Read an `i8`
pub fn read_i8(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<i8, LoadError> {
    Ok(read_u8(cursor, what)? as i8)
}

/// Read a little-endian `u16`
pub fn read_u16(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<u16, LoadError> {
    let mut buf = [0u8; 2];
    read_exact(cursor, &mut buf, what)?;
    Ok(u16::from_le_bytes(buf))
}

/// Read a little-endian `i16`
pub fn read_i16(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<i16, LoadError> {
    let mut buf = [0u8; 2];
    read_exact(cursor, &mut buf, what)?;
    Ok(i16::from_le_bytes(buf))
}

/// Read a little-endian `u32`
pub fn read_u32(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<u32, LoadError> {
    let mut buf = [0u8; 4];
    read_exact(cursor, &mut buf, what)?;
    Ok(u32::from_le_bytes(buf))
}

/// Read a little-endian `i32`
pub fn read_i32(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<i32, LoadError> {
    let mut buf = [0u8; 4];
    read_exact(cursor, &mut buf, what)?;
    Ok(i32::from_le_bytes(buf))
}

/// Read a little-endian `f32`
pub fn read_f32(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<f32, LoadError> {
    let mut buf = [0u8; 4];
    read_exact(cursor, &mut buf, what)?;
    Ok(f32::from_le_bytes(buf))
}

/// Read a little-endian `u64`
pub fn read_u64(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<u64, LoadError> {
    let mut buf = [0u8; 8];
    read_exact(cursor, &mut buf, what)?;
    Ok(u64::from_le_bytes(buf))
}

/// Read a little-endian `i64`
pub fn read_i64(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<i64, LoadError> {
    let mut buf = [0u8; 8];
    read_exact(cursor, &mut buf, what)?;
    Ok(i64::from_le_bytes(buf))
}

/// Read a little-endian `f64`
pub fn read_f64(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<f64, LoadError> {
    let mut buf = [0u8; 8];
    read_exact(cursor, &mut buf, what)?;
    Ok(f64::from_le_bytes(buf))
}

/// Read a bool stored as one byte
pub fn read_bool(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<bool, LoadError> {
    Ok(read_u8(cursor, what)? != 0)
}

/// Read a string: u64 byte length followed by UTF-8 bytes
pub fn read_string(cursor: &mut Cursor<&[u8]>, what: &str) -> Result<String, LoadError> {
    let len_u64 = read_u64(cursor, what)?;
    let len = usize::try_from(len_u64).map_err(|_| LoadError::Parse {
        reason: format!("string length {len_u64} for {what} exceeds usize"),
    })?;
    let remaining = cursor.get_ref().len() - cursor.position() as usize;
    if len > remaining {
        return Err(LoadError::Parse {
            reason: format!("string length {len} for {what} exceeds remaining {remaining} bytes"),
        });
    }
    let mut bytes = vec![0u8; len];
    read_exact(cursor, &mut bytes, what)?;
    String::from_utf8(bytes).map_err(|_| LoadError::Parse {
        reason: format!("{what} is not valid UTF-8"),
    })
}
