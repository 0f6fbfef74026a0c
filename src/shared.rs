use std::fmt;

use bytes::{Buf, BufMut};
use rand::RngCore;

use crate::coding::{self, BufExt, UnexpectedEnd};
use crate::MAX_CID_SIZE;

/// Protocol-level identifier for a connection.
///
/// An opaque 0–20 byte value carried in every packet; datagrams are routed to
/// sessions by their destination connection id. Mainly useful for debug
/// output; immutable once constructed.
#[derive(Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct ConnectionId {
    /// length of CID
    len: u8,
    /// CID in byte array
    bytes: [u8; MAX_CID_SIZE],
}

impl ConnectionId {
    /// Construct cid from byte array
    ///
    /// Panics if `bytes.len() > MAX_CID_SIZE`.
    pub fn new(bytes: &[u8]) -> Self {
        debug_assert!(bytes.len() <= MAX_CID_SIZE);
        let mut res = Self {
            len: bytes.len() as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        res.bytes[..bytes.len()].copy_from_slice(bytes);
        res
    }

    /// Generate a random cid of the given length
    pub fn random<R: RngCore>(rng: &mut R, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        rng.fill_bytes(&mut res.bytes[..len]);
        res
    }

    /// Decode from long header format
    pub(crate) fn decode_long<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        let len = buf.get::<u8>()? as usize;
        if len > MAX_CID_SIZE || buf.remaining() < len {
            return Err(UnexpectedEnd);
        }
        let cid = Self::from_buf(buf, len);
        Ok(cid)
    }

    /// Encode in long header format
    pub(crate) fn encode_long<B: BufMut>(&self, buf: &mut B) {
        buf.put_u8(self.len() as u8);
        buf.put_slice(self);
    }

    /// Constructs cid by reading `len` bytes from a `Buf`
    ///
    /// Callers need to assure that `buf.remaining() >= len`
    pub(crate) fn from_buf<B: Buf>(buf: &mut B, len: usize) -> Self {
        debug_assert!(len <= MAX_CID_SIZE);
        let mut res = Self {
            len: len as u8,
            bytes: [0; MAX_CID_SIZE],
        };
        buf.copy_to_slice(&mut res[..len]);
        res
    }
}

impl ::std::ops::Deref for ConnectionId {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.bytes[0..self.len as usize]
    }
}

impl ::std::ops::DerefMut for ConnectionId {
    fn deref_mut(&mut self) -> &mut [u8] {
        &mut self.bytes[0..self.len as usize]
    }
}

impl fmt::Debug for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.bytes[0..self.len as usize].fmt(f)
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.iter() {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cid_round_trip() {
        let cid = ConnectionId::new(&[0xde, 0xad, 0xbe, 0xef, 0x42]);
        let mut buf = Vec::new();
        cid.encode_long(&mut buf);
        assert_eq!(buf.len(), 6);
        let decoded = ConnectionId::decode_long(&mut std::io::Cursor::new(buf)).unwrap();
        assert_eq!(decoded, cid);
        assert_eq!(&*decoded, &[0xde, 0xad, 0xbe, 0xef, 0x42]);
    }

    #[test]
    fn display_hex() {
        let cid = ConnectionId::new(&[0x01, 0xab]);
        assert_eq!(cid.to_string(), "01ab");
    }
}
