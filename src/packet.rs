use std::{cmp::Ordering, io, ops::Range};

use bytes::{Buf, BufMut, Bytes, BytesMut};
use thiserror::Error;

use crate::{
    coding::{self, BufExt, BufMutExt},
    shared::ConnectionId,
    VERSION,
};

/// A partially decoded packet header
///
/// Parsing stops after the invariant header (everything up to, but excluding,
/// the packet number): the packet number cannot be reconstructed without the
/// receiving packet-number space's largest received value, which lives with
/// the session. The endpoint uses this stage to extract the destination cid
/// and route the datagram; the session finishes the decode.
#[derive(Debug)]
pub(crate) struct PartialDecode {
    plain_header: PlainHeader,
    buf: io::Cursor<BytesMut>,
}

impl PartialDecode {
    /// Begin decoding a packet from the front of `bytes`
    ///
    /// If the datagram contains additional coalesced packets after this one,
    /// they are split off and returned for separate processing.
    pub(crate) fn new(
        bytes: BytesMut,
        local_cid_len: usize,
    ) -> Result<(Self, Option<BytesMut>), PacketDecodeError> {
        let mut buf = io::Cursor::new(bytes);
        let plain_header = PlainHeader::decode(&mut buf, local_cid_len)?;
        let dgram_len = buf.get_ref().len();
        let packet_len = plain_header
            .payload_len()
            .map(|len| (buf.position() + len) as usize)
            .unwrap_or(dgram_len);
        match dgram_len.cmp(&packet_len) {
            Ordering::Equal => Ok((Self { plain_header, buf }, None)),
            Ordering::Less => Err(PacketDecodeError::InvalidHeader(
                "packet too short to contain payload length",
            )),
            Ordering::Greater => {
                let rest = Some(buf.get_mut().split_off(packet_len));
                Ok((Self { plain_header, buf }, rest))
            }
        }
    }

    pub(crate) fn is_initial(&self) -> bool {
        matches!(self.plain_header, PlainHeader::Initial { .. })
    }

    pub(crate) fn space(&self) -> Option<SpaceId> {
        use PlainHeader::*;
        match self.plain_header {
            Initial { .. } => Some(SpaceId::Initial),
            Long {
                ty: LongType::Handshake,
                ..
            } => Some(SpaceId::Handshake),
            Long {
                ty: LongType::ZeroRtt,
                ..
            } => Some(SpaceId::Data),
            Short { .. } => Some(SpaceId::Data),
            Retry { .. } => None,
        }
    }

    pub(crate) fn dst_cid(&self) -> ConnectionId {
        self.plain_header.dst_cid()
    }

    /// Finish decoding: read the packet number and expose the frame payload
    pub(crate) fn finish(self) -> Result<Packet, PacketDecodeError> {
        use PlainHeader::*;
        let Self {
            plain_header,
            mut buf,
        } = self;

        if let Retry {
            dst_cid,
            src_cid,
            token_pos,
        } = plain_header
        {
            let header_len = buf.get_ref().len();
            let bytes: BytesMut = buf.into_inner();
            let header_data = bytes.freeze();
            let token = header_data.slice(token_pos.start..token_pos.end);
            return Ok(Packet {
                header: Header::Retry {
                    dst_cid,
                    src_cid,
                    token,
                },
                header_data: header_data.slice(..header_len),
                payload: BytesMut::new(),
            });
        }

        let first = buf.get_ref()[0];
        let number = PacketNumber::decode(PacketNumber::decode_len(first), &mut buf)?;
        let header = match plain_header {
            Initial {
                dst_cid,
                src_cid,
                token_pos,
                ..
            } => {
                let header_len = buf.position() as usize;
                let mut bytes = buf.into_inner();
                let header_data = bytes.split_to(header_len).freeze();
                let token = header_data.slice(token_pos.start..token_pos.end);
                return Ok(Packet {
                    header: Header::Initial {
                        dst_cid,
                        src_cid,
                        token,
                        number,
                    },
                    header_data,
                    payload: bytes,
                });
            }
            Long {
                ty,
                dst_cid,
                src_cid,
                ..
            } => Header::Long {
                ty,
                dst_cid,
                src_cid,
                number,
            },
            Short { first, dst_cid } => Header::Short {
                spin: first & SPIN_BIT != 0,
                key_phase: first & KEY_PHASE_BIT != 0,
                dst_cid,
                number,
            },
            Retry { .. } => unreachable!(),
        };

        let header_len = buf.position() as usize;
        let mut bytes = buf.into_inner();
        Ok(Packet {
            header,
            header_data: bytes.split_to(header_len).freeze(),
            payload: bytes,
        })
    }
}

pub(crate) struct Packet {
    pub(crate) header: Header,
    pub(crate) header_data: Bytes,
    pub(crate) payload: BytesMut,
}

impl Packet {
    pub(crate) fn reserved_bits_valid(&self) -> bool {
        let mask = match self.header {
            Header::Short { .. } => SHORT_RESERVED_BITS,
            _ => LONG_RESERVED_BITS,
        };
        self.header_data[0] & mask == 0
    }
}

#[derive(Debug, Clone)]
pub(crate) enum Header {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
        number: PacketNumber,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        number: PacketNumber,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token: Bytes,
    },
    Short {
        spin: bool,
        key_phase: bool,
        dst_cid: ConnectionId,
        number: PacketNumber,
    },
}

impl Header {
    pub(crate) fn encode(&self, w: &mut Vec<u8>) -> PartialEncode {
        use Header::*;
        let start = w.len();
        match *self {
            Initial {
                ref dst_cid,
                ref src_cid,
                ref token,
                number,
            } => {
                w.write(u8::from(LongHeaderType::Initial) | number.tag());
                w.write(VERSION);
                dst_cid.encode_long(w);
                src_cid.encode_long(w);
                w.write_var(token.len() as u64);
                w.put_slice(token);
                w.write::<u16>(0); // payload length placeholder; see `PartialEncode::finish`
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: Some((number.len(), true)),
                }
            }
            Long {
                ty,
                ref dst_cid,
                ref src_cid,
                number,
            } => {
                w.write(u8::from(LongHeaderType::Standard(ty)) | number.tag());
                w.write(VERSION);
                dst_cid.encode_long(w);
                src_cid.encode_long(w);
                w.write::<u16>(0); // payload length placeholder; see `PartialEncode::finish`
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: Some((number.len(), true)),
                }
            }
            Retry {
                ref dst_cid,
                ref src_cid,
                ref token,
            } => {
                w.write(u8::from(LongHeaderType::Retry));
                w.write(VERSION);
                dst_cid.encode_long(w);
                src_cid.encode_long(w);
                w.put_slice(token);
                // Integrity tag; computing it requires keys outside this core
                w.put_slice(&[0; RETRY_TAG_SIZE]);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: None,
                }
            }
            Short {
                spin,
                key_phase,
                ref dst_cid,
                number,
            } => {
                w.write(
                    FIXED_BIT
                        | if key_phase { KEY_PHASE_BIT } else { 0 }
                        | if spin { SPIN_BIT } else { 0 }
                        | number.tag(),
                );
                w.put_slice(dst_cid);
                number.encode(w);
                PartialEncode {
                    start,
                    header_len: w.len() - start,
                    pn: Some((number.len(), false)),
                }
            }
        }
    }

    pub(crate) fn number(&self) -> Option<PacketNumber> {
        use Header::*;
        Some(match *self {
            Initial { number, .. } => number,
            Long { number, .. } => number,
            Short { number, .. } => number,
            Retry { .. } => return None,
        })
    }
}

pub(crate) struct PartialEncode {
    pub(crate) start: usize,
    pub(crate) header_len: usize,
    // Packet number length, payload length needed
    pn: Option<(usize, bool)>,
}

impl PartialEncode {
    /// Backfill the long-header payload length once the packet is complete
    ///
    /// `buf` must contain the full serialized packet starting at `start`.
    pub(crate) fn finish(self, buf: &mut [u8]) {
        let Self {
            start,
            header_len,
            pn,
        } = self;
        let (pn_len, write_len) = match pn {
            Some(x) => x,
            None => return,
        };
        if !write_len {
            return;
        }
        let len = buf.len() - start - header_len + pn_len;
        assert!(len < 2usize.pow(14)); // fits the reserved two-byte encoding
        let pn_pos = start + header_len - pn_len;
        let mut slice = &mut buf[pn_pos - 2..pn_pos];
        slice.put_u16(len as u16 | 0b01 << 14);
    }
}

#[derive(Debug)]
pub(crate) enum PlainHeader {
    Initial {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token_pos: Range<usize>,
        len: u64,
    },
    Long {
        ty: LongType,
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        len: u64,
    },
    Retry {
        dst_cid: ConnectionId,
        src_cid: ConnectionId,
        token_pos: Range<usize>,
    },
    Short {
        first: u8,
        dst_cid: ConnectionId,
    },
}

impl PlainHeader {
    fn dst_cid(&self) -> ConnectionId {
        use PlainHeader::*;
        match self {
            Initial { dst_cid, .. } => *dst_cid,
            Long { dst_cid, .. } => *dst_cid,
            Retry { dst_cid, .. } => *dst_cid,
            Short { dst_cid, .. } => *dst_cid,
        }
    }

    fn payload_len(&self) -> Option<u64> {
        use PlainHeader::*;
        match self {
            Initial { len, .. } | Long { len, .. } => Some(*len),
            _ => None,
        }
    }

    fn decode(
        buf: &mut io::Cursor<BytesMut>,
        local_cid_len: usize,
    ) -> Result<Self, PacketDecodeError> {
        let first = buf.get::<u8>()?;
        if first & LONG_HEADER_FORM == 0 {
            if first & FIXED_BIT == 0 {
                return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
            }
            if buf.remaining() < local_cid_len {
                return Err(PacketDecodeError::InvalidHeader(
                    "destination connection ID longer than packet",
                ));
            }
            let dst_cid = ConnectionId::from_buf(buf, local_cid_len);
            Ok(Self::Short { first, dst_cid })
        } else {
            let version = buf.get::<u32>()?;
            let dst_cid = ConnectionId::decode_long(buf)?;
            let src_cid = ConnectionId::decode_long(buf)?;

            if version != VERSION {
                return Err(PacketDecodeError::UnsupportedVersion {
                    src: src_cid,
                    destination: dst_cid,
                });
            }

            match LongHeaderType::from_byte(first)? {
                LongHeaderType::Initial => {
                    let token_len = buf.get_var()? as usize;
                    if token_len > buf.remaining() {
                        return Err(PacketDecodeError::InvalidHeader(
                            "token longer than packet",
                        ));
                    }
                    let token_start = buf.position() as usize;
                    buf.advance(token_len);

                    let len = buf.get_var()?;
                    Ok(Self::Initial {
                        dst_cid,
                        src_cid,
                        token_pos: token_start..token_start + token_len,
                        len,
                    })
                }
                LongHeaderType::Retry => {
                    let token_start = buf.position() as usize;
                    let remaining = buf.remaining();
                    if remaining < RETRY_TAG_SIZE {
                        return Err(PacketDecodeError::InvalidHeader(
                            "retry packet missing integrity tag",
                        ));
                    }
                    let token_len = remaining - RETRY_TAG_SIZE;
                    buf.advance(remaining);
                    Ok(Self::Retry {
                        dst_cid,
                        src_cid,
                        token_pos: token_start..token_start + token_len,
                    })
                }
                LongHeaderType::Standard(ty) => Ok(Self::Long {
                    ty,
                    dst_cid,
                    src_cid,
                    len: buf.get_var()?,
                }),
            }
        }
    }
}

/// An encoded packet number
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum PacketNumber {
    U8(u8),
    U16(u16),
    U24(u32),
    U32(u32),
}

impl PacketNumber {
    /// Truncate `n` to the smallest length that the peer can reconstruct given
    /// the largest packet number it has acknowledged
    pub(crate) fn new(n: u64, largest_acked: u64) -> Self {
        let range = (n - largest_acked) * 2;
        if range < 1 << 8 {
            Self::U8(n as u8)
        } else if range < 1 << 16 {
            Self::U16(n as u16)
        } else if range < 1 << 24 {
            Self::U24(n as u32)
        } else if range < 1 << 32 {
            Self::U32(n as u32)
        } else {
            panic!("packet number too large to encode")
        }
    }

    pub(crate) fn len(self) -> usize {
        use PacketNumber::*;
        match self {
            U8(_) => 1,
            U16(_) => 2,
            U24(_) => 3,
            U32(_) => 4,
        }
    }

    pub(crate) fn encode<W: BufMut>(self, w: &mut W) {
        use PacketNumber::*;
        match self {
            U8(x) => w.write(x),
            U16(x) => w.write(x),
            U24(x) => w.put_uint(u64::from(x), 3),
            U32(x) => w.write(x),
        }
    }

    pub(crate) fn decode<R: Buf>(len: usize, r: &mut R) -> Result<Self, PacketDecodeError> {
        use PacketNumber::*;
        if r.remaining() < len {
            return Err(PacketDecodeError::InvalidHeader("packet number truncated"));
        }
        Ok(match len {
            1 => U8(r.get()?),
            2 => U16(r.get()?),
            3 => U24(r.get_uint(3) as u32),
            4 => U32(r.get()?),
            _ => unreachable!(),
        })
    }

    pub(crate) fn decode_len(tag: u8) -> usize {
        1 + (tag & 0x03) as usize
    }

    fn tag(self) -> u8 {
        use PacketNumber::*;
        match self {
            U8(_) => 0b00,
            U16(_) => 0b01,
            U24(_) => 0b10,
            U32(_) => 0b11,
        }
    }

    /// Lift a truncated packet number to the nearest value to `expected`
    /// within the representable window (RFC 9000 Appendix A)
    pub(crate) fn expand(self, expected: u64) -> u64 {
        use PacketNumber::*;
        let truncated = match self {
            U8(x) => u64::from(x),
            U16(x) => u64::from(x),
            U24(x) => u64::from(x),
            U32(x) => u64::from(x),
        };
        let nbits = self.len() * 8;
        let win = 1 << nbits;
        let hwin = win / 2;
        let mask = win - 1;
        // The incoming packet number should be greater than `expected - hwin`
        // and less than or equal to `expected + hwin`; stripping the trailing
        // bits of `expected` and substituting `truncated` may land outside
        // that window, so correct by one full window if it does.
        let candidate = (expected & !mask) | truncated;
        if expected.checked_sub(hwin).map_or(false, |x| candidate <= x) {
            candidate + win
        } else if candidate > expected + hwin && candidate > win {
            candidate - win
        } else {
            candidate
        }
    }
}

/// Long packet type including non-uniform cases
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LongHeaderType {
    Initial,
    Retry,
    Standard(LongType),
}

impl LongHeaderType {
    fn from_byte(b: u8) -> Result<Self, PacketDecodeError> {
        use self::{LongHeaderType::*, LongType::*};
        if b & FIXED_BIT == 0 {
            return Err(PacketDecodeError::InvalidHeader("fixed bit unset"));
        }
        debug_assert!(b & LONG_HEADER_FORM != 0, "not a long packet");
        Ok(match (b & 0x30) >> 4 {
            0x0 => Initial,
            0x1 => Standard(ZeroRtt),
            0x2 => Standard(Handshake),
            0x3 => Retry,
            _ => unreachable!(),
        })
    }
}

impl From<LongHeaderType> for u8 {
    fn from(ty: LongHeaderType) -> Self {
        use self::{LongHeaderType::*, LongType::*};
        match ty {
            Initial => LONG_HEADER_FORM | FIXED_BIT,
            Standard(ZeroRtt) => LONG_HEADER_FORM | FIXED_BIT | (0x1 << 4),
            Standard(Handshake) => LONG_HEADER_FORM | FIXED_BIT | (0x2 << 4),
            Retry => LONG_HEADER_FORM | FIXED_BIT | (0x3 << 4),
        }
    }
}

/// Long packet types with uniform header structure
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub(crate) enum LongType {
    Handshake,
    ZeroRtt,
}

#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum PacketDecodeError {
    #[error("unsupported version")]
    UnsupportedVersion {
        src: ConnectionId,
        destination: ConnectionId,
    },
    #[error("invalid header: {0}")]
    InvalidHeader(&'static str),
}

impl From<coding::UnexpectedEnd> for PacketDecodeError {
    fn from(_: coding::UnexpectedEnd) -> Self {
        Self::InvalidHeader("unexpected end of packet")
    }
}

pub(crate) const LONG_HEADER_FORM: u8 = 0x80;
const FIXED_BIT: u8 = 0x40;
pub(crate) const SPIN_BIT: u8 = 0x20;
const SHORT_RESERVED_BITS: u8 = 0x18;
const LONG_RESERVED_BITS: u8 = 0x0c;
const KEY_PHASE_BIT: u8 = 0x04;
pub(crate) const RETRY_TAG_SIZE: usize = 16;

/// Packet number space identifiers
///
/// One independent packet number sequence exists per encryption level. The
/// handshake space is carried for structural completeness; without a TLS
/// layer nothing sends in it.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum SpaceId {
    /// Unprotected packets, used to announce a connection
    Initial = 0,
    Handshake = 1,
    /// Application data space
    Data = 2,
}

impl SpaceId {
    pub fn iter() -> impl Iterator<Item = Self> {
        [Self::Initial, Self::Handshake, Self::Data].iter().cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use hex_literal::hex;
    use std::io;

    fn check_pn(typed: PacketNumber, encoded: &[u8]) {
        let mut buf = Vec::new();
        typed.encode(&mut buf);
        assert_eq!(&buf[..], encoded);
        let decoded = PacketNumber::decode(typed.len(), &mut io::Cursor::new(&buf)).unwrap();
        assert_eq!(typed, decoded);
    }

    #[test]
    fn roundtrip_packet_numbers() {
        check_pn(PacketNumber::U8(0x7f), &hex!("7f"));
        check_pn(PacketNumber::U16(0x80), &hex!("0080"));
        check_pn(PacketNumber::U16(0x3fff), &hex!("3fff"));
        check_pn(PacketNumber::U32(0x0000_4000), &hex!("00004000"));
        check_pn(PacketNumber::U32(0xffff_ffff), &hex!("ffffffff"));
    }

    #[test]
    fn pn_encode() {
        check_pn(PacketNumber::new(0x10, 0), &hex!("10"));
        check_pn(PacketNumber::new(0x100, 0), &hex!("0100"));
        check_pn(PacketNumber::new(0x10000, 0), &hex!("010000"));
    }

    #[test]
    fn pn_expand_roundtrip() {
        for expected in 0..1024 {
            for actual in expected..1024 {
                assert_eq!(actual, PacketNumber::new(actual, expected).expand(expected));
            }
        }
    }

    #[test]
    fn short_header_roundtrip() {
        let dcid = ConnectionId::new(&hex!("06b858ec6f80452b"));
        let header = Header::Short {
            spin: false,
            key_phase: false,
            dst_cid: dcid,
            number: PacketNumber::U16(0x1234),
        };
        let mut buf = Vec::new();
        let partial = header.encode(&mut buf);
        buf.extend_from_slice(b"payload");
        partial.finish(&mut buf);

        let (decode, rest) = PartialDecode::new(buf.as_slice().into(), dcid.len()).unwrap();
        assert!(rest.is_none());
        let packet = decode.finish().unwrap();
        assert!(packet.reserved_bits_valid());
        match packet.header {
            Header::Short {
                dst_cid, number, ..
            } => {
                assert_eq!(dst_cid, dcid);
                assert_eq!(number, PacketNumber::U16(0x1234));
            }
            _ => panic!("wrong header kind"),
        }
        assert_eq!(&packet.payload[..], b"payload");
    }

    #[test]
    fn initial_header_roundtrip() {
        let dcid = ConnectionId::new(&hex!("deadbeef"));
        let scid = ConnectionId::new(&hex!("c0ffee"));
        let header = Header::Initial {
            dst_cid: dcid,
            src_cid: scid,
            token: Bytes::from_static(b"tok"),
            number: PacketNumber::U8(7),
        };
        let mut buf = Vec::new();
        let partial = header.encode(&mut buf);
        buf.extend_from_slice(&[0u8; 32]);
        partial.finish(&mut buf);

        let (decode, rest) = PartialDecode::new(buf.as_slice().into(), dcid.len()).unwrap();
        assert!(rest.is_none());
        assert!(decode.is_initial());
        assert_eq!(decode.space(), Some(SpaceId::Initial));
        let packet = decode.finish().unwrap();
        match packet.header {
            Header::Initial {
                dst_cid,
                src_cid,
                token,
                number,
            } => {
                assert_eq!(dst_cid, dcid);
                assert_eq!(src_cid, scid);
                assert_eq!(&token[..], b"tok");
                assert_eq!(number, PacketNumber::U8(7));
            }
            _ => panic!("wrong header kind"),
        }
        assert_eq!(packet.payload.len(), 32);
    }

    #[test]
    fn coalesced_datagram_splits() {
        let dcid = ConnectionId::new(&hex!("deadbeef"));
        let scid = ConnectionId::new(&hex!("c0ffee"));
        let header = Header::Initial {
            dst_cid: dcid,
            src_cid: scid,
            token: Bytes::new(),
            number: PacketNumber::U8(0),
        };
        let mut buf = Vec::new();
        let partial = header.encode(&mut buf);
        buf.extend_from_slice(&[0u8; 8]);
        partial.finish(&mut buf);
        let first_len = buf.len();
        buf.extend_from_slice(&[0x40, 1, 2, 3]); // trailing short packet

        let (decode, rest) = PartialDecode::new(buf.as_slice().into(), 4).unwrap();
        assert_eq!(rest.as_ref().map(|r| r.len()), Some(4));
        let packet = decode.finish().unwrap();
        assert_eq!(packet.header_data.len() + packet.payload.len(), first_len);
    }

    #[test]
    fn rejects_unfixed_short() {
        // Fixed bit unset in a short header
        let buf = [0x00u8, 1, 2, 3, 4, 5];
        assert!(matches!(
            PartialDecode::new(buf.as_slice().into(), 4),
            Err(PacketDecodeError::InvalidHeader("fixed bit unset"))
        ));
    }

    #[test]
    fn rejects_bad_version() {
        let mut buf = Vec::new();
        buf.push(LONG_HEADER_FORM | FIXED_BIT);
        buf.extend_from_slice(&0xff00_001du32.to_be_bytes());
        buf.push(0);
        buf.push(0);
        assert!(matches!(
            PartialDecode::new(buf.as_slice().into(), 0),
            Err(PacketDecodeError::UnsupportedVersion { .. })
        ));
    }
}
