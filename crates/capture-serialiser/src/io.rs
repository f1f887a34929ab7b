use std::io::{Read, Write};

use crate::error::{Result, SerialiserError};

pub trait WriteLeExt: Write {
    fn write_u8(&mut self, v: u8) -> Result<()> {
        self.write_all(&[v])?;
        Ok(())
    }

    fn write_u16_le(&mut self, v: u16) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u32_le(&mut self, v: u32) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_u64_le(&mut self, v: u64) -> Result<()> {
        self.write_all(&v.to_le_bytes())?;
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.write_all(bytes)?;
        Ok(())
    }

    fn write_string_u32(&mut self, s: &str) -> Result<()> {
        let len: u32 = s.len().try_into().map_err(|_| SerialiserError::CountOverflow {
            count: s.len() as u64,
        })?;
        self.write_u32_le(len)?;
        self.write_bytes(s.as_bytes())
    }
}

impl<T: Write + ?Sized> WriteLeExt for T {}

pub trait ReadLeExt: Read {
    fn read_u8(&mut self) -> Result<u8> {
        let mut buf = [0u8; 1];
        self.read_exact(&mut buf)?;
        Ok(buf[0])
    }

    fn read_u16_le(&mut self) -> Result<u16> {
        let mut buf = [0u8; 2];
        self.read_exact(&mut buf)?;
        Ok(u16::from_le_bytes(buf))
    }

    fn read_u32_le(&mut self) -> Result<u32> {
        let mut buf = [0u8; 4];
        self.read_exact(&mut buf)?;
        Ok(u32::from_le_bytes(buf))
    }

    fn read_u64_le(&mut self) -> Result<u64> {
        let mut buf = [0u8; 8];
        self.read_exact(&mut buf)?;
        Ok(u64::from_le_bytes(buf))
    }

    fn read_exact_vec(&mut self, len: usize) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        buf.try_reserve_exact(len)
            .map_err(|_| SerialiserError::OutOfMemory { len })?;
        buf.resize(len, 0);
        self.read_exact(&mut buf)?;
        Ok(buf)
    }

    /// Reads a `u32`-prefixed UTF-8 string, rejecting lengths above `max_len` before allocating.
    fn read_string_u32(&mut self, max_len: usize) -> Result<String> {
        let len = self.read_u32_le()? as usize;
        if len > max_len {
            return Err(SerialiserError::Corrupt("string too long"));
        }
        let bytes = self.read_exact_vec(len)?;
        Ok(String::from_utf8(bytes)?)
    }
}

impl<T: Read + ?Sized> ReadLeExt for T {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn read_exact_vec_allocation_failure_returns_error() {
        let mut cursor = Cursor::new(Vec::new());
        let err = cursor.read_exact_vec(usize::MAX).unwrap_err();
        assert!(matches!(err, SerialiserError::OutOfMemory { .. }));
    }

    #[test]
    fn string_length_is_bounded_before_allocation() {
        let mut bytes = Vec::new();
        bytes.write_u32_le(1000).unwrap();
        let err = Cursor::new(bytes).read_string_u32(16).unwrap_err();
        assert!(matches!(err, SerialiserError::Corrupt(_)));
    }

    #[test]
    fn strings_roundtrip() {
        let mut bytes = Vec::new();
        bytes.write_string_u32("capture/records").unwrap();
        let s = Cursor::new(bytes).read_string_u32(64).unwrap();
        assert_eq!(s, "capture/records");
    }
}
