//! A user-space QUIC v1 transport core.
//!
//! This crate implements the hard center of QUIC: the wire codec
//! (variable-length integers, long/short packet headers, all frame kinds),
//! multiplexed streams with per-stream and connection-level flow control,
//! packet-number-based loss detection with PTO probing, ACK scheduling, and
//! pluggable congestion control (CUBIC and BBR).
//!
//! Cryptographic handshakes, version negotiation, and retry-token validation
//! are out of scope; CRYPTO frames are carried as an opaque data pipe.
//!
//! The entry points are [`QuicServer`] and [`QuicClient`]. Each accepted or
//! connected [`Session`] runs a cooperative loop on its own tokio task,
//! multiplexing any number of [`Stream`]s over one UDP socket pair.

use std::fmt;
use std::time::Duration;

use bytes::{Buf, BufMut};

mod coding;
mod range_set;
mod shared;
mod varint;

pub use crate::shared::ConnectionId;
pub use crate::varint::{VarInt, VarIntBoundsExceeded};

mod packet;
pub use crate::packet::{PacketDecodeError, SpaceId};

mod frame;
pub use crate::frame::{ApplicationClose, ConnectionClose, FrameType};

mod assembler;
mod flow;
mod recovery;
pub use crate::recovery::RttEstimator;
mod spaces;

pub mod congestion;

mod transport_error;
pub use crate::transport_error::{Error as TransportError, TransportErrorCode};

mod config;
pub use crate::config::{EndpointConfig, TransportConfig};

mod streams;
pub use crate::streams::{ReadError, Stream, WriteError};

mod session;
pub use crate::session::{ConnectionError, Session, SessionStats};

mod endpoint;
pub use crate::endpoint::{ConnectError, QuicClient, QuicServer};

/// The QUIC protocol version implemented
pub const VERSION: u32 = 0x0000_0001;

/// Whether an endpoint was the initiator of a connection
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Side {
    /// The initiator of a connection
    Client = 0,
    /// The acceptor of a connection
    Server = 1,
}

impl Side {
    #[inline]
    pub fn is_client(self) -> bool {
        self == Self::Client
    }

    #[inline]
    pub fn is_server(self) -> bool {
        self == Self::Server
    }
}

impl std::ops::Not for Side {
    type Output = Self;
    fn not(self) -> Self {
        match self {
            Self::Client => Self::Server,
            Self::Server => Self::Client,
        }
    }
}

/// Whether a stream communicates data in both directions or only from the initiator
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Dir {
    /// Data flows in both directions
    Bi = 0,
    /// Data flows only from the stream's initiator
    Uni = 1,
}

impl Dir {
    fn iter() -> impl Iterator<Item = Self> {
        [Self::Bi, Self::Uni].iter().cloned()
    }
}

impl fmt::Display for Dir {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use Dir::*;
        f.pad(match *self {
            Bi => "bidirectional",
            Uni => "unidirectional",
        })
    }
}

/// Identifier for a stream within a particular connection
///
/// The low two bits encode the initiating side and directionality.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub struct StreamId(pub(crate) u64);

impl fmt::Display for StreamId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let initiator = match self.initiator() {
            Side::Client => "client",
            Side::Server => "server",
        };
        write!(f, "{} {} stream {}", initiator, self.dir(), self.index())
    }
}

impl StreamId {
    pub(crate) fn new(initiator: Side, dir: Dir, index: u64) -> Self {
        Self(index << 2 | (dir as u64) << 1 | initiator as u64)
    }

    /// Which side of a connection initiated the stream
    pub fn initiator(self) -> Side {
        if self.0 & 0x1 == 0 {
            Side::Client
        } else {
            Side::Server
        }
    }

    /// Which directions data flows in
    pub fn dir(self) -> Dir {
        if self.0 & 0x2 == 0 {
            Dir::Bi
        } else {
            Dir::Uni
        }
    }

    /// Distinguishes streams of the same initiator and directionality
    pub fn index(self) -> u64 {
        self.0 >> 2
    }
}

impl From<StreamId> for VarInt {
    fn from(x: StreamId) -> Self {
        unsafe { Self::from_u64_unchecked(x.0) }
    }
}

impl coding::Codec for StreamId {
    fn decode<B: Buf>(buf: &mut B) -> coding::Result<Self> {
        VarInt::decode(buf).map(|x| Self(x.into_inner()))
    }
    fn encode<B: BufMut>(&self, buf: &mut B) {
        VarInt::from_u64(self.0).unwrap().encode(buf)
    }
}

//
// Useful internal constants
//

/// The maximum amount of CIDs we are willing to store
pub(crate) const MAX_CID_SIZE: usize = 20;
pub(crate) const RESET_TOKEN_SIZE: usize = 16;
/// Initial packets must be padded to at least this many bytes
pub(crate) const MIN_INITIAL_SIZE: usize = 1200;
/// The smallest interval loss detection timers operate on
pub(crate) const TIMER_GRANULARITY: Duration = Duration::from_millis(1);
