//! Little-endian primitives shared by the codec layer and the storage engine.

use crate::Result;
use std::io::{Read, Write};

pub fn read_u64<U: Read>(reader: &mut U) -> Result<u64> {
    let mut buf = [0; 8];
    reader.read_exact(&mut buf)?;
    Ok(u64::from_le_bytes(buf))
}

pub fn read_u32<U: Read>(reader: &mut U) -> Result<u32> {
    let mut buf = [0; 4];
    reader.read_exact(&mut buf)?;
    Ok(u32::from_le_bytes(buf))
}

pub fn read_u16<U: Read>(reader: &mut U) -> Result<u16> {
    let mut buf = [0; 2];
    reader.read_exact(&mut buf)?;
    Ok(u16::from_le_bytes(buf))
}

pub fn read_u8<U: Read>(reader: &mut U) -> Result<u8> {
    let mut buf = [0; 1];
    reader.read_exact(&mut buf)?;
    Ok(buf[0])
}

pub fn read_usize<U: Read>(reader: &mut U) -> Result<usize> {
    Ok(read_u64(reader)? as usize)
}

pub fn read_bytes<U: Read>(reader: &mut U, len: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf)?;
    Ok(buf)
}

pub fn write_u64<W: Write>(writer: &mut W, v: u64) -> Result<()> {
    writer.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub fn write_u32<W: Write>(writer: &mut W, v: u32) -> Result<()> {
    writer.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub fn write_u16<W: Write>(writer: &mut W, v: u16) -> Result<()> {
    writer.write_all(&v.to_le_bytes())?;
    Ok(())
}

pub fn write_u8<W: Write>(writer: &mut W, v: u8) -> Result<()> {
    writer.write_all(&[v])?;
    Ok(())
}

pub fn write_usize<W: Write>(writer: &mut W, v: usize) -> Result<()> {
    write_u64(writer, v as u64)
}

pub fn read_string<U: Read>(reader: &mut U, len: usize) -> Result<String> {
    let bytes = read_bytes(reader, len)?;
    Ok(String::from_utf8(bytes)?)
}

pub fn write_string<W: Write>(writer: &mut W, s: &str) -> Result<()> {
    write_usize(writer, s.len())?;
    writer.write_all(s.as_bytes())?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn roundtrip_u64() {
        let mut buf = Vec::new();
        write_u64(&mut buf, 0x0123_4567_89ab_cdef).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_u64(&mut cursor).unwrap(), 0x0123_4567_89ab_cdef);
    }

    #[test]
    fn roundtrip_string() {
        let mut buf = Vec::new();
        write_string(&mut buf, "hello pallas").unwrap();
        let mut cursor = Cursor::new(buf);
        let len = read_usize(&mut cursor).unwrap();
        assert_eq!(read_string(&mut cursor, len).unwrap(), "hello pallas");
    }
}
