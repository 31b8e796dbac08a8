/*
src/wire.rs

Every TCP message in the transfer protocol is a plain sequence of these
primitives: big-endian u32/u64, length-prefixed UTF-8 strings, and raw byte
blocks. There are no delimiters and no self-describing types, so a read that
hits EOF mid-frame fails the whole connection.
*/

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io::{self, Read, Write};

/// Wire form of `-1` in a u32 field.
pub const NONE_U32: u32 = u32::MAX;

/// Wire form of `-1` in a u64 field.
pub const NONE_U64: u64 = u64::MAX;

pub fn write_u32<W: Write>(w: &mut W, v: u32) -> io::Result<()> {
    w.write_u32::<BigEndian>(v)
}

pub fn read_u32<R: Read>(r: &mut R) -> io::Result<u32> {
    r.read_u32::<BigEndian>()
}

pub fn write_u64<W: Write>(w: &mut W, v: u64) -> io::Result<()> {
    w.write_u64::<BigEndian>(v)
}

pub fn read_u64<R: Read>(r: &mut R) -> io::Result<u64> {
    r.read_u64::<BigEndian>()
}

/// Writes a string as a u16 length prefix followed by its UTF-8 bytes.
pub fn write_string<W: Write>(w: &mut W, s: &str) -> io::Result<()> {
    let bytes = s.as_bytes();
    if bytes.len() > u16::MAX as usize {
        return Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            "string too long for u16 length prefix",
        ));
    }
    w.write_u16::<BigEndian>(bytes.len() as u16)?;
    w.write_all(bytes)
}

pub fn read_string<R: Read>(r: &mut R) -> io::Result<String> {
    let len = r.read_u16::<BigEndian>()? as usize;
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    String::from_utf8(buf)
        .map_err(|_| io::Error::new(io::ErrorKind::InvalidData, "string is not valid UTF-8"))
}

/// Reads exactly `len` raw bytes.
pub fn read_blob<R: Read>(r: &mut R, len: usize) -> io::Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    r.read_exact(&mut buf)?;
    Ok(buf)
}
