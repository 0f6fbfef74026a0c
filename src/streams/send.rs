use std::{collections::VecDeque, ops::Range};

use bytes::{Buf, Bytes, BytesMut};
use thiserror::Error;

use crate::{flow::SendWindow, frame, range_set::RangeSet, VarInt};

/// The sending half of a stream
#[derive(Debug)]
pub(super) struct Send {
    pub(super) state: SendState,
    pub(super) pending: SendBuffer,
    pub(super) flow: SendWindow,
    /// Whether a frame containing a FIN bit must be transmitted, even if we
    /// don't have any new data
    pub(super) fin_pending: bool,
    /// The reason the peer wants us to stop, if `STOP_SENDING` was received
    pub(super) stop_reason: Option<VarInt>,
    /// Session torn down; every operation returns `Shutdown`
    pub(super) shutdown: bool,
    /// Unacknowledged bytes buffered before `write` blocks
    buffer_limit: u64,
}

impl Send {
    pub(super) fn new(max_data: u64, buffer_limit: u64) -> Self {
        Self {
            state: SendState::Ready,
            pending: SendBuffer::new(),
            flow: SendWindow::new(max_data),
            fin_pending: false,
            stop_reason: None,
            shutdown: false,
            buffer_limit,
        }
    }

    /// Buffer as much of `data` as backpressure allows
    ///
    /// Returns the number of bytes accepted; zero means the caller must wait
    /// for the buffer to drain.
    pub(super) fn write(&mut self, data: &[u8]) -> Result<usize, WriteError> {
        if self.shutdown {
            return Err(WriteError::Shutdown);
        }
        if let Some(error_code) = self.stop_reason {
            return Err(WriteError::Stopped(error_code));
        }
        if self.state != SendState::Ready {
            return Err(WriteError::ClosedStream);
        }
        let budget = self.buffer_limit.saturating_sub(self.pending.unacked());
        let n = (budget as usize).min(data.len());
        if n > 0 {
            self.pending.write(Bytes::copy_from_slice(&data[..n]));
        }
        Ok(n)
    }

    pub(super) fn finish(&mut self) -> Result<(), WriteError> {
        if self.shutdown {
            return Err(WriteError::Shutdown);
        }
        if let Some(error_code) = self.stop_reason {
            return Err(WriteError::Stopped(error_code));
        }
        if self.state == SendState::Ready {
            self.state = SendState::DataSent {
                finish_acked: false,
            };
            self.fin_pending = true;
            Ok(())
        } else {
            Err(WriteError::ClosedStream)
        }
    }

    /// Update stream state due to a reset sent by the local application
    ///
    /// Returns the final offset to declare, or `None` if the stream was
    /// already reset.
    pub(super) fn reset(&mut self) -> Option<u64> {
        use SendState::*;
        if let DataSent { .. } | Ready = self.state {
            self.state = ResetSent;
            self.fin_pending = false;
            self.pending.clear_retransmits();
            Some(self.pending.offset())
        } else {
            None
        }
    }

    /// Handle STOP_SENDING
    ///
    /// Returns true if the stream was stopped due to this frame, and false
    /// if it had been stopped before
    pub(super) fn try_stop(&mut self, error_code: VarInt) -> bool {
        if self.stop_reason.is_none() {
            self.stop_reason = Some(error_code);
            true
        } else {
            false
        }
    }

    /// Returns whether the stream has been finished and all data has been
    /// acknowledged by the peer
    pub(super) fn ack(&mut self, frame: frame::StreamMeta) -> bool {
        self.pending.ack(frame.offsets);
        match self.state {
            SendState::DataSent {
                ref mut finish_acked,
            } => {
                *finish_acked |= frame.fin;
                *finish_acked && self.pending.is_fully_acked()
            }
            _ => false,
        }
    }

    /// Re-queue the byte range of a lost frame for retransmission at its
    /// original offsets
    pub(super) fn on_lost(&mut self, frame: frame::StreamMeta) {
        if self.state == SendState::ResetSent {
            return;
        }
        if !frame.offsets.is_empty() {
            self.pending.retransmit(frame.offsets);
        }
        if frame.fin {
            if let SendState::DataSent { finish_acked: false } = self.state {
                self.fin_pending = true;
            }
        }
    }

    /// Handle increase to stream-level flow control limit
    ///
    /// Returns whether the stream was unblocked
    pub(super) fn increase_max_data(&mut self, offset: u64) -> bool {
        if self.state != SendState::Ready && !matches!(self.state, SendState::DataSent { .. }) {
            return false;
        }
        self.flow.increase_max_data(offset)
    }

    /// Produce the next STREAM frame for this stream, at most `max_len`
    /// encoded payload bytes past the stream id
    ///
    /// `conn_budget` is the connection-level flow credit remaining for the
    /// packet under construction; new data (but not retransmission) draws it
    /// down. The returned offsets never retreat across calls.
    pub(super) fn pop_frame(&mut self, max_len: usize, conn_budget: &mut u64) -> PopResult {
        let mut out = PopResult::default();
        if self.state == SendState::ResetSent || self.shutdown {
            return out;
        }
        if max_len < 16 {
            // Not enough room for worst-case metadata; try again next packet
            out.has_more = self.is_pending();
            return out;
        }

        let stream_budget = self.flow.window_size().min(*conn_budget);
        let unsent_before = self.pending.unsent_offset();
        let (range, encode_length) = self.pending.poll_transmit(max_len, stream_budget);
        let new_bytes = self.pending.unsent_offset() - unsent_before;
        if new_bytes > 0 {
            self.flow.add_bytes_sent(new_bytes);
            *conn_budget -= new_bytes;
        }

        // Whether this frame ends at the current end of stream and a FIN is
        // owed there
        let fin = self.fin_pending && range.end == self.pending.offset();
        if fin {
            self.fin_pending = false;
        }

        if range.is_empty() && !fin {
            if self.pending.has_data_beyond(range.start) && self.flow.window_size() == 0 {
                // Data exists but the stream window refused it; connection
                // window stalls are reported by the session instead
                out.blocked = self.flow.take_newly_blocked();
            }
            out.has_more = false;
            return out;
        }

        let mut data = BytesMut::with_capacity((range.end - range.start) as usize);
        let mut cursor = range.start;
        while cursor < range.end {
            let chunk = self.pending.get(cursor..range.end);
            debug_assert!(!chunk.is_empty(), "send buffer hole");
            data.extend_from_slice(chunk);
            cursor += chunk.len() as u64;
        }

        out.frame = Some(PoppedFrame {
            meta: frame::StreamMeta {
                id: crate::StreamId(0), // filled in by the caller
                offsets: range,
                fin,
            },
            data: data.freeze(),
            encode_length,
        });
        out.has_more = self.is_pending()
            && (self.pending.has_retransmits()
                || self.fin_pending
                || self.flow.window_size() > 0);
        if self.pending.has_unsent_new_data() && self.flow.window_size() == 0 {
            // This frame exhausted the stream window with data left behind
            out.blocked = self.flow.take_newly_blocked();
        }
        out
    }

    /// Whether any frame is waiting to go out
    pub(super) fn is_pending(&self) -> bool {
        self.pending.has_unsent_data() || self.fin_pending
    }

    /// Bytes buffered but not yet acknowledged
    pub(super) fn buffered(&self) -> u64 {
        self.pending.unacked()
    }

    pub(super) fn can_buffer(&self) -> bool {
        self.state == SendState::Ready
            && self.stop_reason.is_none()
            && !self.shutdown
            && self.pending.unacked() < self.buffer_limit
    }
}

/// A frame produced by [`Send::pop_frame`]
pub(crate) struct PoppedFrame {
    pub(crate) meta: frame::StreamMeta,
    pub(crate) data: Bytes,
    /// Whether the frame must carry an explicit length; the final frame of a
    /// packet extends to its end instead
    pub(crate) encode_length: bool,
}

#[derive(Default)]
pub(crate) struct PopResult {
    pub(crate) frame: Option<PoppedFrame>,
    /// Stream window exhausted at this offset, not yet reported
    pub(crate) blocked: Option<u64>,
    /// More frames could be produced right away
    pub(crate) has_more: bool,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(super) enum SendState {
    /// Sending new data
    Ready,
    /// Stream was finished; now sending retransmits only
    DataSent { finish_acked: bool },
    /// Sent RESET
    ResetSent,
}

/// Errors triggered while writing to a send stream
#[derive(Debug, Error, Clone, Eq, PartialEq)]
pub enum WriteError {
    /// The peer is no longer accepting data on this stream
    ///
    /// Carries an application-defined error code.
    #[error("sending stopped by peer: code {0}")]
    Stopped(VarInt),
    /// The stream has already been finished or reset
    #[error("closed stream")]
    ClosedStream,
    /// The connection was shut down
    #[error("connection shut down")]
    Shutdown,
    /// The provided deadline elapsed before the write could complete
    #[error("timed out")]
    TimedOut,
}

/// Buffer of outgoing retransmittable stream data
#[derive(Default, Debug)]
pub(super) struct SendBuffer {
    /// Data queued by the application but not yet acknowledged. May or may
    /// not have been sent.
    unacked_segments: VecDeque<Bytes>,
    /// Total size of `unacked_segments`
    unacked_len: usize,
    /// The first offset that hasn't been written by the application, i.e. the
    /// offset past the end of `unacked_segments`
    offset: u64,
    /// The first offset that hasn't been sent
    ///
    /// Always lies in (offset - unacked.len())..offset
    unsent: u64,
    /// Acknowledged ranges which couldn't be discarded yet as they don't
    /// include the earliest offset in `unacked_segments`
    acks: RangeSet,
    /// Previously transmitted ranges deemed lost
    retransmits: RangeSet,
}

impl SendBuffer {
    pub(super) fn new() -> Self {
        Self::default()
    }

    /// Append application data to the end of the stream
    pub(super) fn write(&mut self, data: Bytes) {
        self.unacked_len += data.len();
        self.offset += data.len() as u64;
        self.unacked_segments.push_back(data);
    }

    /// Discard a range of acknowledged stream data
    pub(super) fn ack(&mut self, mut range: Range<u64>) {
        // Clamp the range to data which is still tracked
        let base_offset = self.offset - self.unacked_len as u64;
        range.start = base_offset.max(range.start);
        range.end = base_offset.max(range.end);
        if range.is_empty() {
            return;
        }

        self.acks.insert(range);

        while self.acks.min() == Some(self.offset - self.unacked_len as u64) {
            let prefix = self.acks.pop_min().unwrap();
            let mut to_advance = (prefix.end - prefix.start) as usize;

            self.unacked_len -= to_advance;
            while to_advance > 0 {
                let front = self
                    .unacked_segments
                    .front_mut()
                    .expect("missing buffered data");

                if front.len() <= to_advance {
                    to_advance -= front.len();
                    self.unacked_segments.pop_front();

                    if self.unacked_segments.len() * 4 < self.unacked_segments.capacity() {
                        self.unacked_segments.shrink_to_fit();
                    }
                } else {
                    front.advance(to_advance);
                    to_advance = 0;
                }
            }
        }
    }

    /// Pick the range the next STREAM frame will carry and account for its
    /// transmission
    ///
    /// Lost ranges go out first; they are exempt from the `max_new_data`
    /// flow-control limit because their bytes were charged against the
    /// windows when first sent. New data past the unsent cursor respects it.
    ///
    /// `max_len` covers both the payload and the frame's offset and length
    /// metadata; callers must leave room for the worst case (8 + 8 bytes).
    /// The second return value says whether the frame needs an explicit
    /// length, which only the final frame of a packet may omit.
    pub(super) fn poll_transmit(&mut self, max_len: usize, max_new_data: u64) -> (Range<u64>, bool) {
        debug_assert!(max_len >= 8 + 8);
        let (start, limit, is_retransmit) = match self.retransmits.pop_min() {
            Some(range) => (range.start, range.end, true),
            None => (
                self.unsent,
                self.offset.min(self.unsent.saturating_add(max_new_data)),
                false,
            ),
        };
        let (len, encode_length) = frame_payload_budget(start, limit - start, max_len);
        let end = start + len;
        if is_retransmit {
            if end < limit {
                // The tail that didn't fit stays queued for the next packet
                self.retransmits.insert(end..limit);
            }
        } else {
            self.unsent = end;
        }
        (start..end, encode_length)
    }

    /// Bytes stored for `offsets`, possibly a prefix
    ///
    /// The buffer keeps data in the segments the application wrote, so one
    /// lookup yields at most one segment's worth; callers advance the start
    /// offset and call again until the range is exhausted.
    pub(super) fn get(&self, offsets: Range<u64>) -> &[u8] {
        let mut segment_start = self.offset - self.unacked_len as u64;
        for segment in self.unacked_segments.iter() {
            let segment_end = segment_start + segment.len() as u64;
            if offsets.start >= segment_start && offsets.start < segment_end {
                let head = (offsets.start - segment_start) as usize;
                let tail = (offsets.end - segment_start) as usize;
                return &segment[head..tail.min(segment.len())];
            }
            segment_start = segment_end;
        }
        &[]
    }

    /// Queue a range of sent but unacknowledged data to be retransmitted
    pub(super) fn retransmit(&mut self, mut range: Range<u64>) {
        debug_assert!(range.end <= self.unsent, "unsent data can't be lost");
        // A competing copy may have been acknowledged already
        let base_offset = self.offset - self.unacked_len as u64;
        if range.end <= base_offset {
            return;
        }
        range.start = range.start.max(base_offset);
        self.retransmits.insert(range);
    }

    pub(super) fn clear_retransmits(&mut self) {
        self.retransmits = RangeSet::new();
    }

    /// First stream offset unwritten by the application, i.e. the offset that
    /// the next write will begin at
    pub(super) fn offset(&self) -> u64 {
        self.offset
    }

    /// First offset that has never been transmitted
    pub(super) fn unsent_offset(&self) -> u64 {
        self.unsent
    }

    /// Whether all sent data has been acknowledged
    pub(super) fn is_fully_acked(&self) -> bool {
        self.unacked_len == 0
    }

    /// Whether there's data to send
    ///
    /// There may be sent unacknowledged data even when this is false.
    pub(super) fn has_unsent_data(&self) -> bool {
        self.unsent != self.offset || !self.retransmits.is_empty()
    }

    pub(super) fn has_retransmits(&self) -> bool {
        !self.retransmits.is_empty()
    }

    /// Whether never-transmitted data is buffered
    pub(super) fn has_unsent_new_data(&self) -> bool {
        self.unsent != self.offset
    }

    /// Whether unsent data exists at or beyond `offset`
    pub(super) fn has_data_beyond(&self, offset: u64) -> bool {
        self.offset > offset
    }

    /// Compute the amount of data that hasn't been acknowledged
    pub(super) fn unacked(&self) -> u64 {
        self.unacked_len as u64 - self.acks.iter().map(|x| x.end - x.start).sum::<u64>()
    }
}

/// How many payload bytes fit in `max_len` once the frame's offset (and, if
/// the data won't reach the end of the packet, an explicit length field) are
/// accounted for
///
/// Returns the payload byte count and whether a length field is required.
fn frame_payload_budget(offset: u64, available: u64, mut max_len: usize) -> (u64, bool) {
    // Offset zero is implied by the frame type and costs nothing
    if offset != 0 {
        max_len -= VarInt::from_u64(offset).unwrap().size();
    }
    let mut encode_length = false;
    if available < max_len as u64 {
        encode_length = true;
        max_len -= 8;
    }
    (available.min(max_len as u64), encode_length)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn explicit_length_reserved_when_data_fits() {
        let mut buf = SendBuffer::new();
        buf.write(Bytes::from_static(&[0x5a; 24]));
        // 24 buffered bytes against a 30-byte budget: the frame won't reach
        // the packet's end, so 8 bytes are set aside for the length field
        // and 22 payload bytes fit
        assert_eq!(buf.poll_transmit(30, u64::MAX), (0..22, true));
        // The remainder is shorter than its budget too
        assert_eq!(buf.poll_transmit(30, u64::MAX), (22..24, true));
        // Nothing left: an empty range at the cursor
        assert_eq!(buf.poll_transmit(30, u64::MAX), (24..24, true));
    }

    #[test]
    fn length_omitted_when_filling_packet() {
        let mut buf = SendBuffer::new();
        buf.write(Bytes::from_static(&[0x5a; 64]));
        // More data than budget: the frame runs to the packet's end and
        // needs no length field
        assert_eq!(buf.poll_transmit(30, u64::MAX), (0..30, false));
        // Offset 30 costs one varint byte out of the next budget
        assert_eq!(buf.poll_transmit(30, u64::MAX), (30..59, false));
        assert_eq!(buf.poll_transmit(64, u64::MAX), (59..64, true));
    }

    #[test]
    fn offset_encoding_reserved_at_varint_boundaries() {
        let mut buf = SendBuffer::new();
        // Over 1 GiB of buffered data without allocating: every segment
        // references the same static block
        let chunk = Bytes::from_static(&[0; 1024 * 1024]);
        for _ in 0..1025 {
            buf.write(chunk.clone());
        }

        // Offset 0 is implied and costs nothing
        assert_eq!(buf.poll_transmit(16, u64::MAX), (0..16, false));
        // One-byte offsets
        assert_eq!(buf.poll_transmit(17, u64::MAX), (16..32, false));
        assert_eq!(buf.poll_transmit(33, u64::MAX), (32..64, false));
        // Two-byte offsets start at 64
        assert_eq!(buf.poll_transmit(18, u64::MAX), (64..80, false));
        assert_eq!(buf.poll_transmit(16306, u64::MAX), (80..16384, false));
        // Four-byte offsets start at 16384
        assert_eq!(buf.poll_transmit(20, u64::MAX), (16384..16400, false));
        const GIB: u64 = 1 << 30;
        assert_eq!(
            buf.poll_transmit((GIB - 16400) as usize + 4, u64::MAX),
            (16400..GIB, false)
        );
        // Eight-byte offsets start at 2^30
        assert_eq!(buf.poll_transmit(24, u64::MAX), (GIB..GIB + 16, false));

        // Retransmission at a large offset reserves the same metadata and
        // ignores an exhausted flow window
        buf.retransmit(GIB..GIB + 16);
        assert_eq!(buf.poll_transmit(24, 0), (GIB..GIB + 16, false));
        // New data at the same offset is still flow-gated
        assert_eq!(buf.poll_transmit(24, 0), (GIB + 16..GIB + 16, true));
    }

    #[test]
    fn flow_limited_transmit() {
        let mut buf = SendBuffer::new();
        buf.write(Bytes::from_static(&[0; 2048]));
        // Window allows 1024 bytes only
        assert_eq!(buf.poll_transmit(2048, 1024), (0..1024, true));
        // Window exhausted: empty range at the unsent cursor
        assert_eq!(buf.poll_transmit(2048, 0), (1024..1024, true));
        // Window opens back up
        assert_eq!(buf.poll_transmit(2048, u64::MAX), (1024..2048, true));
    }

    #[test]
    fn get_walks_segment_boundaries() {
        let mut buf = SendBuffer::new();
        buf.write(Bytes::from_static(b"quic"));
        buf.write(Bytes::from_static(b"k bro"));
        buf.write(Bytes::from_static(b"wn fox"));
        assert_eq!(buf.poll_transmit(32, u64::MAX), (0..15, true));
        // Lookups stop at each segment edge
        assert_eq!(buf.get(0..15), b"quic");
        assert_eq!(buf.get(4..15), b"k bro");
        assert_eq!(buf.get(9..15), b"wn fox");
        assert_eq!(buf.get(11..13), b" f");
        // Acks out of order drain nothing until the prefix is contiguous
        buf.ack(9..15);
        assert_eq!(buf.unacked(), 9);
        assert_eq!(buf.get(0..4), b"quic");
        buf.ack(0..9);
        assert!(buf.is_fully_acked());
    }

    #[test]
    fn retransmit_before_new_data() {
        let mut buf = SendBuffer::new();
        buf.write(Bytes::from_static(&[7; 48]));
        assert_eq!(buf.poll_transmit(16, u64::MAX), (0..16, false));
        assert_eq!(buf.poll_transmit(17, u64::MAX), (16..32, false));
        // The first frame is lost; it goes out again ahead of anything new
        buf.retransmit(0..16);
        assert_eq!(buf.poll_transmit(16, u64::MAX), (0..16, false));
        assert_eq!(buf.poll_transmit(17, u64::MAX), (32..48, false));
        // A lost span wider than one frame keeps its tail queued
        buf.retransmit(16..48);
        assert_eq!(buf.poll_transmit(17, u64::MAX), (16..32, false));
        assert_eq!(buf.poll_transmit(17, u64::MAX), (32..48, false));
    }

    #[test]
    fn retransmit_not_flow_limited() {
        let mut buf = SendBuffer::new();
        buf.write(Bytes::from_static(&[0; 64]));
        assert_eq!(buf.poll_transmit(128, 64), (0..64, true));
        buf.retransmit(0..64);
        // Retransmission proceeds with zero window credit
        assert_eq!(buf.poll_transmit(128, 0), (0..64, true));
    }

    #[test]
    fn send_half_write_and_pop() {
        let mut send = Send::new(1024, 2048);
        assert_eq!(send.write(b"hello world").unwrap(), 11);
        let mut conn = u64::MAX;
        let res = send.pop_frame(1200, &mut conn);
        let frame = res.frame.unwrap();
        assert_eq!(frame.meta.offsets, 0..11);
        assert!(!frame.meta.fin);
        assert_eq!(&frame.data[..], b"hello world");
        assert!(!res.has_more);
    }

    #[test]
    fn fin_without_data() {
        let mut send = Send::new(1024, 2048);
        send.write(b"x").unwrap();
        let mut conn = u64::MAX;
        let first = send.pop_frame(1200, &mut conn).frame.unwrap();
        assert!(!first.meta.fin);
        send.finish().unwrap();
        let res = send.pop_frame(1200, &mut conn);
        let frame = res.frame.unwrap();
        assert!(frame.meta.fin);
        assert!(frame.meta.offsets.is_empty());
    }

    #[test]
    fn stream_blocked_reported_once() {
        let mut send = Send::new(4, 2048);
        send.write(b"abcdef").unwrap();
        let mut conn = u64::MAX;
        // The frame that exhausts the window also reports the stall
        let res = send.pop_frame(1200, &mut conn);
        assert_eq!(res.frame.unwrap().meta.offsets, 0..4);
        assert_eq!(res.blocked, Some(4));
        assert!(!res.has_more);
        // Not reported again for the same limit
        let res = send.pop_frame(1200, &mut conn);
        assert!(res.frame.is_none());
        assert_eq!(res.blocked, None);
        // Raising the limit lets the rest flow
        assert!(send.increase_max_data(16));
        let res = send.pop_frame(1200, &mut conn);
        assert_eq!(res.frame.unwrap().meta.offsets, 4..6);
    }

    #[test]
    fn lost_fin_requeued() {
        let mut send = Send::new(1024, 2048);
        send.write(b"hi").unwrap();
        send.finish().unwrap();
        let mut conn = u64::MAX;
        let frame = send.pop_frame(1200, &mut conn).frame.unwrap();
        assert!(frame.meta.fin);
        send.on_lost(frame.meta.clone());
        let again = send.pop_frame(1200, &mut conn).frame.unwrap();
        assert_eq!(again.meta.offsets, frame.meta.offsets);
        assert!(again.meta.fin);
    }

    #[test]
    fn completed_when_fin_acked() {
        let mut send = Send::new(1024, 2048);
        send.write(b"hi").unwrap();
        send.finish().unwrap();
        let mut conn = u64::MAX;
        let frame = send.pop_frame(1200, &mut conn).frame.unwrap();
        assert!(send.ack(frame.meta));
    }

    #[test]
    fn write_after_finish_fails() {
        let mut send = Send::new(1024, 2048);
        send.finish().unwrap();
        assert_eq!(send.write(b"nope"), Err(WriteError::ClosedStream));
    }

    #[test]
    fn backpressure_budget() {
        let mut send = Send::new(u64::MAX, 8);
        assert_eq!(send.write(b"0123456789").unwrap(), 8);
        assert!(!send.can_buffer());
        // Acking frees space
        let mut conn = u64::MAX;
        let frame = send.pop_frame(1200, &mut conn).frame.unwrap();
        send.ack(frame.meta);
        assert!(send.can_buffer());
    }
}
