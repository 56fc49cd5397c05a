//! Bounds-checked read cursor for packet decoding.
//!
//! Every decode path goes through this so that a truncated file surfaces as
//! `DecodeError::Truncated` instead of a panic.

use crate::core::error::DecodeError;

/// Forward-only reader over a byte slice.
#[derive(Debug)]
pub struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    /// Wrap a slice.
    pub fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    /// Bytes not yet consumed.
    pub fn remaining(&self) -> usize {
        self.data.len() - self.pos
    }

    /// True once every byte has been consumed.
    pub fn at_end(&self) -> bool {
        self.pos == self.data.len()
    }

    /// Consume exactly `len` bytes.
    pub fn take(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if len > self.remaining() {
            return Err(DecodeError::Truncated {
                needed: len - self.remaining(),
                available: self.remaining(),
            });
        }
        let out = &self.data[self.pos..self.pos + len];
        self.pos += len;
        Ok(out)
    }

    /// Consume a fixed-size array.
    pub fn take_array<const N: usize>(&mut self) -> Result<[u8; N], DecodeError> {
        let slice = self.take(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(slice);
        Ok(out)
    }

    /// Consume a little-endian u16.
    pub fn take_u16(&mut self) -> Result<u16, DecodeError> {
        Ok(u16::from_le_bytes(self.take_array()?))
    }

    /// Consume a little-endian u32.
    pub fn take_u32(&mut self) -> Result<u32, DecodeError> {
        Ok(u32::from_le_bytes(self.take_array()?))
    }

    /// Consume a little-endian u64.
    pub fn take_u64(&mut self) -> Result<u64, DecodeError> {
        Ok(u64::from_le_bytes(self.take_array()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_take_sequence() {
        let data = [1u8, 2, 3, 4, 5];
        let mut cursor = Cursor::new(&data);

        assert_eq!(cursor.take(2).unwrap(), &[1, 2]);
        assert_eq!(cursor.remaining(), 3);
        assert_eq!(cursor.take(3).unwrap(), &[3, 4, 5]);
        assert!(cursor.at_end());
    }

    #[test]
    fn test_take_past_end() {
        let data = [1u8, 2, 3];
        let mut cursor = Cursor::new(&data);

        cursor.take(2).unwrap();
        let err = cursor.take(5).unwrap_err();
        assert_eq!(
            err,
            DecodeError::Truncated {
                needed: 4,
                available: 1
            }
        );
    }

    #[test]
    fn test_take_integers() {
        let mut data = Vec::new();
        data.extend_from_slice(&0xBEEFu16.to_le_bytes());
        data.extend_from_slice(&0xDEAD_BEEFu32.to_le_bytes());
        data.extend_from_slice(&0x0123_4567_89AB_CDEFu64.to_le_bytes());

        let mut cursor = Cursor::new(&data);
        assert_eq!(cursor.take_u16().unwrap(), 0xBEEF);
        assert_eq!(cursor.take_u32().unwrap(), 0xDEAD_BEEF);
        assert_eq!(cursor.take_u64().unwrap(), 0x0123_4567_89AB_CDEF);
        assert!(cursor.at_end());
    }

    #[test]
    fn test_empty_take_zero() {
        let mut cursor = Cursor::new(&[]);
        assert_eq!(cursor.take(0).unwrap(), &[] as &[u8]);
        assert!(cursor.at_end());
    }
}
