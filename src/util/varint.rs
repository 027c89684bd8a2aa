//! Variable-length integer encoding utilities.
//!
//! Posting streams store doc deltas, frequencies and positions as VInts: seven
//! payload bits per byte, low-order group first, with the high bit set on every
//! byte except the last.

use crate::error::{IrisError, Result};

/// A sequential byte destination.
pub trait ByteSink {
    fn write_byte(&mut self, b: u8) -> Result<()>;

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        for &b in bytes {
            self.write_byte(b)?;
        }
        Ok(())
    }
}

/// A sequential byte source.
///
/// Reading past the end is a caller bug, so `read_byte` is infallible.
pub trait ByteSource {
    fn read_byte(&mut self) -> u8;
}

impl ByteSink for Vec<u8> {
    fn write_byte(&mut self, b: u8) -> Result<()> {
        self.push(b);
        Ok(())
    }

    fn write_bytes(&mut self, bytes: &[u8]) -> Result<()> {
        self.extend_from_slice(bytes);
        Ok(())
    }
}

/// Write a u32 using variable-length encoding.
pub fn write_vu32<S: ByteSink + ?Sized>(sink: &mut S, value: u32) -> Result<()> {
    let mut val = value;
    while val & !0x7F != 0 {
        sink.write_byte(((val & 0x7F) as u8) | 0x80)?;
        val >>= 7;
    }
    sink.write_byte(val as u8)
}

/// Read a u32 written by [`write_vu32`].
pub fn read_vu32<S: ByteSource + ?Sized>(source: &mut S) -> Result<u32> {
    let mut result = 0u32;
    let mut shift = 0;

    loop {
        if shift > 28 {
            return Err(IrisError::index("VarInt overflow"));
        }

        let byte = source.read_byte();
        result |= ((byte & 0x7F) as u32) << shift;

        if (byte & 0x80) == 0 {
            return Ok(result);
        }

        shift += 7;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct SliceSource<'a> {
        bytes: &'a [u8],
        pos: usize,
    }

    impl ByteSource for SliceSource<'_> {
        fn read_byte(&mut self) -> u8 {
            let b = self.bytes[self.pos];
            self.pos += 1;
            b
        }
    }

    #[test]
    fn test_vu32_values() {
        let test_values = [0u32, 1, 127, 128, 255, 256, 16383, 16384, u32::MAX];

        for &value in &test_values {
            let mut out = Vec::new();
            write_vu32(&mut out, value).unwrap();

            let mut source = SliceSource { bytes: &out, pos: 0 };
            assert_eq!(read_vu32(&mut source).unwrap(), value);
            assert_eq!(source.pos, out.len());
        }
    }

    #[test]
    fn test_encoding_layout() {
        let mut out = Vec::new();
        write_vu32(&mut out, 127).unwrap();
        assert_eq!(out, vec![0x7F]);

        out.clear();
        write_vu32(&mut out, 300).unwrap();
        assert_eq!(out, vec![0xAC, 0x02]);

        out.clear();
        write_vu32(&mut out, u32::MAX).unwrap();
        assert_eq!(out.len(), 5);
    }

    #[test]
    fn test_overflow() {
        let overflow_data = vec![0xFF; 8];
        let mut source = SliceSource {
            bytes: &overflow_data,
            pos: 0,
        };
        assert!(read_vu32(&mut source).is_err());
    }
}
