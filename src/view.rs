//! Bounds-checked binary reader over a fixed byte region.

use std::borrow::Cow;

use crate::error::{Error, Result};

/// Byte order used to decode multi-byte fields.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[cfg_attr(feature = "cli", derive(clap::ValueEnum))]
pub enum Endian {
    /// ZIP and APK Signing Block fields are little-endian.
    #[default]
    Little,
    Big,
}

impl Endian {
    /// Encode a `u16` in this byte order.
    pub fn u16_bytes(self, value: u16) -> [u8; 2] {
        match self {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        }
    }

    /// Encode a `u32` in this byte order.
    pub fn u32_bytes(self, value: u32) -> [u8; 4] {
        match self {
            Endian::Little => value.to_le_bytes(),
            Endian::Big => value.to_be_bytes(),
        }
    }
}

/// Read-only view over a byte region.
///
/// Every accessor checks `offset + width <= len` without overflowing and fails
/// with [`Error::OutOfRange`] otherwise. Offsets are always relative to the
/// start of the view.
#[derive(Debug, Clone, Copy)]
pub struct ByteView<'a> {
    bytes: &'a [u8],
    endian: Endian,
}

impl<'a> ByteView<'a> {
    pub fn new(bytes: &'a [u8], endian: Endian) -> Self {
        Self { bytes, endian }
    }

    /// Little-endian view, the layout of every ZIP and Signing Block field.
    pub fn le(bytes: &'a [u8]) -> Self {
        Self::new(bytes, Endian::Little)
    }

    pub fn len(&self) -> u64 {
        self.bytes.len() as u64
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn endian(&self) -> Endian {
        self.endian
    }

    /// The whole underlying region.
    pub fn as_bytes(&self) -> &'a [u8] {
        self.bytes
    }

    /// Borrow `width` raw bytes at `offset`.
    pub fn bytes(&self, offset: u64, width: u64) -> Result<&'a [u8]> {
        let len = self.len();
        let end = offset
            .checked_add(width)
            .filter(|&end| end <= len)
            .ok_or(Error::OutOfRange { offset, width, len })?;
        Ok(&self.bytes[offset as usize..end as usize])
    }

    /// Sub-view over `[start, end)`, keeping the byte order.
    pub fn slice(&self, start: u64, end: u64) -> Result<ByteView<'a>> {
        let width = end.checked_sub(start).ok_or(Error::OutOfRange {
            offset: start,
            width: 0,
            len: self.len(),
        })?;
        Ok(ByteView::new(self.bytes(start, width)?, self.endian))
    }

    /// Fixed-length text span; invalid UTF-8 is replaced rather than rejected.
    pub fn chars(&self, offset: u64, width: u64) -> Result<Cow<'a, str>> {
        Ok(String::from_utf8_lossy(self.bytes(offset, width)?))
    }

    fn array<const N: usize>(&self, offset: u64) -> Result<[u8; N]> {
        let mut out = [0u8; N];
        out.copy_from_slice(self.bytes(offset, N as u64)?);
        Ok(out)
    }

    pub fn u8(&self, offset: u64) -> Result<u8> {
        Ok(self.array::<1>(offset)?[0])
    }

    pub fn u16(&self, offset: u64) -> Result<u16> {
        let buf = self.array(offset)?;
        Ok(match self.endian {
            Endian::Little => u16::from_le_bytes(buf),
            Endian::Big => u16::from_be_bytes(buf),
        })
    }

    pub fn u32(&self, offset: u64) -> Result<u32> {
        let buf = self.array(offset)?;
        Ok(match self.endian {
            Endian::Little => u32::from_le_bytes(buf),
            Endian::Big => u32::from_be_bytes(buf),
        })
    }

    pub fn u64(&self, offset: u64) -> Result<u64> {
        let buf = self.array(offset)?;
        Ok(match self.endian {
            Endian::Little => u64::from_le_bytes(buf),
            Endian::Big => u64::from_be_bytes(buf),
        })
    }

    pub fn i16(&self, offset: u64) -> Result<i16> {
        let buf = self.array(offset)?;
        Ok(match self.endian {
            Endian::Little => i16::from_le_bytes(buf),
            Endian::Big => i16::from_be_bytes(buf),
        })
    }

    pub fn i32(&self, offset: u64) -> Result<i32> {
        let buf = self.array(offset)?;
        Ok(match self.endian {
            Endian::Little => i32::from_le_bytes(buf),
            Endian::Big => i32::from_be_bytes(buf),
        })
    }

    pub fn i64(&self, offset: u64) -> Result<i64> {
        let buf = self.array(offset)?;
        Ok(match self.endian {
            Endian::Little => i64::from_le_bytes(buf),
            Endian::Big => i64::from_be_bytes(buf),
        })
    }

    /// Offset of the last occurrence of `needle` starting at or after `from`.
    pub fn rfind(&self, needle: &[u8], from: u64) -> Option<u64> {
        if needle.is_empty() || from >= self.len() {
            return None;
        }
        self.bytes[from as usize..]
            .windows(needle.len())
            .rposition(|window| window == needle)
            .map(|pos| from + pos as u64)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_both_byte_orders() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let le = ByteView::le(&data);
        let be = ByteView::new(&data, Endian::Big);

        assert_eq!(le.u16(0).unwrap(), 0x0201);
        assert_eq!(be.u16(0).unwrap(), 0x0102);
        assert_eq!(le.u32(4).unwrap(), 0x0807_0605);
        assert_eq!(be.u64(0).unwrap(), 0x0102_0304_0506_0708);
    }

    #[test]
    fn signed_reads_do_not_reinterpret_width() {
        let data = [0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0xff, 0x7f];
        let view = ByteView::le(&data);

        assert_eq!(view.i16(0).unwrap(), -1);
        assert_eq!(view.i32(0).unwrap(), -1);
        assert_eq!(view.i64(0).unwrap(), i64::MAX);
        assert_eq!(view.u64(0).unwrap(), i64::MAX as u64);
    }

    #[test]
    fn out_of_range_reports_offset_and_width() {
        let data = [0u8; 6];
        let view = ByteView::le(&data);

        assert!(view.u32(2).is_ok());
        match view.u32(3) {
            Err(Error::OutOfRange { offset, width, len }) => {
                assert_eq!((offset, width, len), (3, 4, 6));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(view.bytes(u64::MAX, 2), Err(Error::OutOfRange { .. })));
        assert!(view.bytes(6, 0).unwrap().is_empty());
    }

    #[test]
    fn chars_and_slices() {
        let data = b"xxAPK Sig Block 42yy";
        let view = ByteView::le(data);

        assert_eq!(view.chars(2, 16).unwrap(), "APK Sig Block 42");
        let inner = view.slice(2, 18).unwrap();
        assert_eq!(inner.len(), 16);
        assert_eq!(inner.u8(0).unwrap(), b'A');
        assert!(view.slice(5, 4).is_err());
    }

    #[test]
    fn rfind_returns_last_match() {
        let data = b"abcXYabcXYab";
        let view = ByteView::le(data);

        assert_eq!(view.rfind(b"XY", 0), Some(8));
        assert_eq!(view.rfind(b"XY", 9), None);
        assert_eq!(view.rfind(b"abc", 1), Some(5));
        assert_eq!(view.rfind(b"zz", 0), None);
    }
}
