use std::{convert::TryInto, fmt};

use bytes::{Buf, BufMut};
use thiserror::Error;

use crate::coding::{self, Codec, UnexpectedEnd};

/// An integer less than 2^62
///
/// Values of this type are suitable for encoding as QUIC variable-length
/// integers: the top two bits of the first byte select a 1, 2, 4, or 8 byte
/// big-endian encoding, and the encoder always picks the smallest form that
/// fits.
#[derive(Default, Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct VarInt(pub(crate) u64);

impl VarInt {
    /// The largest representable value
    pub const MAX: Self = Self((1 << 62) - 1);

    /// Construct a `VarInt` infallibly
    pub const fn from_u32(x: u32) -> Self {
        Self(x as u64)
    }

    /// Succeeds iff `x` < 2^62
    pub fn from_u64(x: u64) -> Result<Self, VarIntBoundsExceeded> {
        if x < 2u64.pow(62) {
            Ok(Self(x))
        } else {
            Err(VarIntBoundsExceeded)
        }
    }

    /// Create a VarInt without ensuring it's in range
    ///
    /// # Safety
    ///
    /// `x` must be less than 2^62.
    pub const unsafe fn from_u64_unchecked(x: u64) -> Self {
        Self(x)
    }

    /// Extract the integer value
    pub const fn into_inner(self) -> u64 {
        self.0
    }

    /// Compute the number of bytes needed to encode this value
    pub const fn size(self) -> usize {
        let x = self.0;
        if x < 2u64.pow(6) {
            1
        } else if x < 2u64.pow(14) {
            2
        } else if x < 2u64.pow(30) {
            4
        } else if x < 2u64.pow(62) {
            8
        } else {
            unreachable!()
        }
    }

    /// Saturating addition that stays within the representable range
    pub fn saturating_add(self, rhs: impl Into<Self>) -> Self {
        let x = self.0.saturating_add(rhs.into().0);
        if x > Self::MAX.0 {
            Self::MAX
        } else {
            Self(x)
        }
    }
}

impl From<VarInt> for u64 {
    fn from(x: VarInt) -> Self {
        x.0
    }
}

impl From<u8> for VarInt {
    fn from(x: u8) -> Self {
        Self(x.into())
    }
}

impl From<u16> for VarInt {
    fn from(x: u16) -> Self {
        Self(x.into())
    }
}

impl From<u32> for VarInt {
    fn from(x: u32) -> Self {
        Self(x.into())
    }
}

impl TryFrom<u64> for VarInt {
    type Error = VarIntBoundsExceeded;
    fn try_from(x: u64) -> Result<Self, Self::Error> {
        Self::from_u64(x)
    }
}

impl TryFrom<usize> for VarInt {
    type Error = VarIntBoundsExceeded;
    fn try_from(x: usize) -> Result<Self, Self::Error> {
        Self::try_from(x as u64)
    }
}

impl fmt::Display for VarInt {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Error returned when constructing a `VarInt` from a value >= 2^62
#[derive(Debug, Copy, Clone, Eq, PartialEq, Error)]
#[error("value too large for varint encoding")]
pub struct VarIntBoundsExceeded;

impl Codec for VarInt {
    fn decode<B: Buf>(r: &mut B) -> coding::Result<Self> {
        if !r.has_remaining() {
            return Err(UnexpectedEnd);
        }
        let mut buf = [0; 8];
        buf[0] = r.get_u8();
        let tag = buf[0] >> 6;
        buf[0] &= 0b0011_1111;
        let x = match tag {
            0b00 => u64::from(buf[0]),
            0b01 => {
                if r.remaining() < 1 {
                    return Err(UnexpectedEnd);
                }
                r.copy_to_slice(&mut buf[1..2]);
                u64::from(u16::from_be_bytes(buf[..2].try_into().unwrap()))
            }
            0b10 => {
                if r.remaining() < 3 {
                    return Err(UnexpectedEnd);
                }
                r.copy_to_slice(&mut buf[1..4]);
                u64::from(u32::from_be_bytes(buf[..4].try_into().unwrap()))
            }
            0b11 => {
                if r.remaining() < 7 {
                    return Err(UnexpectedEnd);
                }
                r.copy_to_slice(&mut buf[1..8]);
                u64::from_be_bytes(buf)
            }
            _ => unreachable!(),
        };
        Ok(Self(x))
    }

    fn encode<B: BufMut>(&self, w: &mut B) {
        let x = self.0;
        if x < 2u64.pow(6) {
            w.put_u8(x as u8);
        } else if x < 2u64.pow(14) {
            w.put_u16(0b01 << 14 | x as u16);
        } else if x < 2u64.pow(30) {
            w.put_u32(0b10 << 30 | x as u32);
        } else if x < 2u64.pow(62) {
            w.put_u64(0b11 << 62 | x);
        } else {
            unreachable!("malformed VarInt");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coding::{BufExt, BufMutExt};

    fn roundtrip(x: u64) -> usize {
        let mut buf = Vec::new();
        buf.write_var(x);
        let len = buf.len();
        let mut read = std::io::Cursor::new(buf);
        assert_eq!(read.get_var().unwrap(), x);
        assert_eq!(read.remaining(), 0);
        len
    }

    #[test]
    fn minimal_encodings() {
        // Boundary values of each encoding width
        assert_eq!(roundtrip(0), 1);
        assert_eq!(roundtrip(62), 1);
        assert_eq!(roundtrip(63), 1);
        assert_eq!(roundtrip(64), 2);
        assert_eq!(roundtrip(16382), 2);
        assert_eq!(roundtrip(16383), 2);
        assert_eq!(roundtrip(16384), 4);
        assert_eq!(roundtrip(2u64.pow(30) - 1), 4);
        assert_eq!(roundtrip(2u64.pow(30)), 8);
        assert_eq!(roundtrip(2u64.pow(62) - 1), 8);
    }

    #[test]
    fn size_matches_encoding() {
        for &x in &[0, 63, 64, 16383, 16384, 2u64.pow(30) - 1, 2u64.pow(30), VarInt::MAX.0] {
            assert_eq!(VarInt::from_u64(x).unwrap().size(), roundtrip(x));
        }
    }

    #[test]
    fn bounds() {
        assert!(VarInt::from_u64(2u64.pow(62)).is_err());
        assert!(VarInt::from_u64(u64::MAX).is_err());
        assert_eq!(VarInt::from_u64(2u64.pow(62) - 1).unwrap(), VarInt::MAX);
    }

    #[test]
    fn truncated_input() {
        for &x in &[64u64, 16384, 2u64.pow(30)] {
            let mut buf = Vec::new();
            buf.write_var(x);
            for cut in 1..buf.len() {
                let mut read = std::io::Cursor::new(&buf[..cut]);
                assert_eq!(VarInt::decode(&mut read), Err(UnexpectedEnd));
            }
        }
    }

    #[test]
    fn non_minimal_decodes() {
        // Decoders accept non-minimal encodings; 1 encoded in two bytes
        let buf = [0b0100_0000u8, 0x01];
        let mut read = std::io::Cursor::new(&buf[..]);
        assert_eq!(read.get_var().unwrap(), 1);
    }
}
