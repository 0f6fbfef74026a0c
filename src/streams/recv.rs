use std::time::Instant;

use thiserror::Error;
use tracing::debug;

use crate::{
    assembler::Assembler,
    flow::StreamRecvWindow,
    frame,
    transport_error::Error as TransportError,
    VarInt,
};

/// The receiving half of a stream
#[derive(Debug)]
pub(super) struct Recv {
    state: RecvState,
    assembler: Assembler,
    pub(super) flow: StreamRecvWindow,
    /// Error code the application canceled reading with, if any
    stopped: Option<VarInt>,
    pub(super) shutdown: bool,
}

impl Recv {
    pub(super) fn new(window: u64, now: Instant) -> Self {
        Self {
            state: RecvState::default(),
            assembler: Assembler::new(),
            flow: StreamRecvWindow::new(window, now),
            stopped: None,
            shutdown: false,
        }
    }

    /// Buffer a received STREAM frame
    ///
    /// `payload_len` is the size of the datagram the frame was carved from.
    /// Returns the connection-level flow credit the frame consumed.
    pub(super) fn ingest(
        &mut self,
        frame: frame::Stream,
        payload_len: usize,
    ) -> Result<u64, TransportError> {
        let end = frame.offset + frame.data.len() as u64;
        if end >= 2u64.pow(62) {
            return Err(TransportError::FLOW_CONTROL_ERROR(
                "maximum stream offset too large",
            ));
        }

        let new_bytes = self.flow.update_highest_received(end, frame.fin)?;

        if frame.fin {
            if self.stopped.is_some() {
                // Stopped streams don't need the data, just the final size
                self.state = RecvState::Closed;
            } else if let RecvState::Recv { ref mut size } = self.state {
                *size = Some(end);
            }
        }

        if self.stopped.is_none() {
            self.assembler.insert(frame.offset, frame.data, payload_len);
        }

        Ok(new_bytes)
    }

    /// Copy reassembled bytes into `buf`
    pub(super) fn read(&mut self, buf: &mut [u8]) -> ReadOutcome {
        if self.shutdown {
            return ReadOutcome::Err(ReadError::Shutdown);
        }
        if self.stopped.is_some() {
            return ReadOutcome::Err(ReadError::Stopped);
        }
        let mut n = 0;
        while n < buf.len() {
            match self.assembler.read(buf.len() - n) {
                Some(chunk) => {
                    buf[n..n + chunk.bytes.len()].copy_from_slice(&chunk.bytes);
                    n += chunk.bytes.len();
                }
                None => break,
            }
        }
        if n > 0 {
            self.flow.add_bytes_read(n as u64);
            return ReadOutcome::Read(n);
        }
        match self.state {
            RecvState::ResetRecvd { error_code, .. } => {
                self.state = RecvState::Closed;
                ReadOutcome::Err(ReadError::Reset(error_code))
            }
            RecvState::Closed => ReadOutcome::Err(ReadError::Finished),
            RecvState::Recv { size } => {
                if size == Some(self.assembler.bytes_read()) {
                    self.state = RecvState::Closed;
                    ReadOutcome::Err(ReadError::Finished)
                } else {
                    ReadOutcome::Blocked
                }
            }
        }
    }

    /// Whether buffered data or a terminal condition would let `read` return
    /// without waiting
    pub(super) fn is_readable(&self) -> bool {
        if self.shutdown || self.stopped.is_some() {
            return true;
        }
        if self.assembler.has_readable() {
            return true;
        }
        match self.state {
            RecvState::ResetRecvd { .. } | RecvState::Closed => true,
            RecvState::Recv { size } => size == Some(self.assembler.bytes_read()),
        }
    }

    /// Handle RESET_STREAM; returns the connection credit consumed, or `None`
    /// if the reset was redundant
    pub(super) fn reset(
        &mut self,
        error_code: VarInt,
        final_offset: VarInt,
    ) -> Result<Option<u64>, TransportError> {
        // The final size must be consistent with everything seen so far
        if let Some(known) = self.flow.final_offset() {
            if known != final_offset.into_inner() {
                return Err(TransportError::FINAL_SIZE_ERROR("inconsistent value"));
            }
        } else if self.flow.highest_received() > final_offset.into_inner() {
            return Err(TransportError::FINAL_SIZE_ERROR("lower than high water mark"));
        }
        let new_bytes = self
            .flow
            .update_highest_received(final_offset.into_inner(), true)?;

        if matches!(self.state, RecvState::ResetRecvd { .. } | RecvState::Closed) {
            return Ok(None);
        }
        debug!(code = %error_code, "stream reset by peer");
        self.state = RecvState::ResetRecvd { error_code };
        // Nuke the buffers so future reads fail fast and never issue
        // flow-control credit twice
        self.assembler.clear();
        Ok(Some(new_bytes))
    }

    /// Abandon reading; returns the connection credit to release for data we
    /// will never deliver
    pub(super) fn stop(&mut self, error_code: VarInt) -> Option<u64> {
        if self.stopped.is_some() {
            return None;
        }
        self.stopped = Some(error_code);
        let unread = self
            .flow
            .highest_received()
            .saturating_sub(self.assembler.bytes_read());
        self.assembler.clear();
        Some(unread)
    }

    pub(super) fn stop_reason(&self) -> Option<VarInt> {
        self.stopped
    }

    /// No more data expected from the peer
    pub(super) fn is_finished(&self) -> bool {
        !matches!(self.state, RecvState::Recv { .. })
    }

    /// All data delivered or the reset observed
    pub(super) fn is_closed(&self) -> bool {
        self.state == RecvState::Closed
    }
}

/// Result of a single non-blocking read attempt
#[derive(Debug)]
pub(super) enum ReadOutcome {
    Read(usize),
    Blocked,
    Err(ReadError),
}

/// Errors triggered when reading from a receive stream
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum ReadError {
    /// The stream finished and every byte was delivered
    #[error("stream finished")]
    Finished,
    /// The peer abandoned transmitting data on this stream
    ///
    /// Carries an application-defined error code.
    #[error("reset by peer: code {0}")]
    Reset(VarInt),
    /// Reading was canceled locally
    #[error("read canceled")]
    Stopped,
    /// The connection was shut down
    #[error("connection shut down")]
    Shutdown,
    /// The provided deadline elapsed before data arrived
    #[error("timed out")]
    TimedOut,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum RecvState {
    Recv { size: Option<u64> },
    ResetRecvd { error_code: VarInt },
    Closed,
}

impl Default for RecvState {
    fn default() -> Self {
        Self::Recv { size: None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use crate::StreamId;

    fn stream_frame(offset: u64, data: &'static [u8], fin: bool) -> frame::Stream {
        frame::Stream {
            id: StreamId(0),
            offset,
            fin,
            data: Bytes::from_static(data),
        }
    }

    fn recv() -> Recv {
        Recv::new(1 << 20, Instant::now())
    }

    #[test]
    fn in_order_read_to_eof() {
        let mut r = recv();
        assert_eq!(r.ingest(stream_frame(0, b"\x48\x49", true), 2).unwrap(), 2);
        let mut buf = [0u8; 16];
        assert_matches!(r.read(&mut buf), ReadOutcome::Read(2));
        assert_eq!(&buf[..2], b"\x48\x49");
        assert_matches!(r.read(&mut buf), ReadOutcome::Err(ReadError::Finished));
        assert!(r.is_closed());
    }

    #[test]
    fn out_of_order_reassembly() {
        // Tail arrives first; everything is delivered in offset order once
        // the head shows up, and only previously-unseen bytes consume credit.
        let mut r = recv();
        assert_eq!(r.ingest(stream_frame(5, b"DEF", false), 3).unwrap(), 8);
        let mut buf = [0u8; 16];
        assert_matches!(r.read(&mut buf), ReadOutcome::Blocked);
        // The head overlaps nothing; its bytes were already counted up to 8
        assert_eq!(r.ingest(stream_frame(0, b"ABCDE", false), 5).unwrap(), 0);
        assert_matches!(r.read(&mut buf), ReadOutcome::Read(8));
        assert_eq!(&buf[..8], b"ABCDEDEF");
    }

    #[test]
    fn duplicate_consumes_no_credit() {
        let mut r = recv();
        assert_eq!(r.ingest(stream_frame(0, b"abc", false), 3).unwrap(), 3);
        assert_eq!(r.ingest(stream_frame(0, b"abc", false), 3).unwrap(), 0);
    }

    #[test]
    fn data_after_fin_rejected() {
        let mut r = recv();
        r.ingest(stream_frame(0, b"ab", true), 2).unwrap();
        assert!(r.ingest(stream_frame(2, b"c", false), 1).is_err());
    }

    #[test]
    fn reset_surfaces_after_drain() {
        let mut r = recv();
        r.ingest(stream_frame(0, b"ab", false), 2).unwrap();
        r.reset(VarInt(42), VarInt(2)).unwrap();
        let mut buf = [0u8; 4];
        // Buffers were discarded by the reset
        assert_matches!(r.read(&mut buf), ReadOutcome::Err(ReadError::Reset(VarInt(42))));
        // Observing the reset closes the stream
        assert_matches!(r.read(&mut buf), ReadOutcome::Err(ReadError::Finished));
    }

    #[test]
    fn reset_final_size_conflict() {
        let mut r = recv();
        r.ingest(stream_frame(0, b"abcd", false), 4).unwrap();
        assert!(r.reset(VarInt(0), VarInt(2)).is_err());
    }

    #[test]
    fn stop_releases_credit() {
        let mut r = recv();
        r.ingest(stream_frame(0, b"abcd", false), 4).unwrap();
        assert_eq!(r.stop(VarInt(0)), Some(4));
        assert_eq!(r.stop(VarInt(0)), None);
        let mut buf = [0u8; 4];
        assert_matches!(r.read(&mut buf), ReadOutcome::Err(ReadError::Stopped));
    }
}
