//! Stream-level and connection-level flow control windows.
//!
//! Both levels share one contract: the send half tracks bytes sent against
//! the peer-advertised limit and reports the first moment it becomes blocked
//! at a given offset; the receive half tracks delivered bytes against the
//! locally-advertised limit and decides when a window update is worth
//! transmitting.

use std::time::{Duration, Instant};

use crate::transport_error::Error as TransportError;

/// How long a receive window may sit un-readvertised before a read triggers
/// an update regardless of how little the window moved
const WINDOW_UPDATE_TIME_THRESHOLD: Duration = Duration::from_millis(500);

/// Send-direction window, used for a single stream or for the connection
#[derive(Debug)]
pub(crate) struct SendWindow {
    /// Highest offset the peer allows us to send up to
    max_data: u64,
    /// Bytes of payload handed to packets so far
    bytes_sent: u64,
    /// Offset at which we last reported being blocked, to suppress duplicate
    /// *_BLOCKED emissions for the same limit
    blocked_at: Option<u64>,
}

impl SendWindow {
    pub(crate) fn new(initial_max_data: u64) -> Self {
        Self {
            max_data: initial_max_data,
            bytes_sent: 0,
            blocked_at: None,
        }
    }

    pub(crate) fn add_bytes_sent(&mut self, n: u64) {
        self.bytes_sent += n;
        debug_assert!(self.bytes_sent <= self.max_data);
    }

    /// Bytes we may still send under the current limit
    pub(crate) fn window_size(&self) -> u64 {
        self.max_data.saturating_sub(self.bytes_sent)
    }

    pub(crate) fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    /// Raise the limit from a MAX_DATA / MAX_STREAM_DATA frame
    ///
    /// Returns whether the window was previously exhausted, i.e. a waiter may
    /// now make progress.
    pub(crate) fn increase_max_data(&mut self, offset: u64) -> bool {
        if offset <= self.max_data {
            return false;
        }
        let was_blocked = self.window_size() == 0;
        self.max_data = offset;
        was_blocked
    }

    /// The blocked offset, if the window is exhausted and this limit has not
    /// been reported yet
    pub(crate) fn take_newly_blocked(&mut self) -> Option<u64> {
        if self.window_size() != 0 || self.blocked_at == Some(self.max_data) {
            return None;
        }
        self.blocked_at = Some(self.max_data);
        Some(self.max_data)
    }
}

/// Receive-direction window for a single stream
#[derive(Debug)]
pub(crate) struct StreamRecvWindow {
    /// Bytes delivered to the application in order
    bytes_read: u64,
    /// Highest end offset seen in any STREAM frame
    highest_received: u64,
    /// Total stream length, pinned by FIN or RESET_STREAM
    final_offset: Option<u64>,
    /// Absolute limit last advertised to the peer
    sent_max_data: u64,
    /// Size of the window we maintain ahead of the read cursor
    window: u64,
    last_update: Instant,
}

impl StreamRecvWindow {
    pub(crate) fn new(window: u64, now: Instant) -> Self {
        Self {
            bytes_read: 0,
            highest_received: 0,
            final_offset: None,
            sent_max_data: window,
            window,
            last_update: now,
        }
    }

    pub(crate) fn bytes_read(&self) -> u64 {
        self.bytes_read
    }

    pub(crate) fn highest_received(&self) -> u64 {
        self.highest_received
    }

    pub(crate) fn final_offset(&self) -> Option<u64> {
        self.final_offset
    }

    /// Account for a STREAM frame covering up to `end`; `fin` pins the final
    /// offset there.
    ///
    /// Returns the number of previously unseen bytes, i.e. the amount of
    /// connection-level credit the frame consumed. The highest received
    /// offset never retreats.
    pub(crate) fn update_highest_received(
        &mut self,
        end: u64,
        fin: bool,
    ) -> Result<u64, TransportError> {
        if let Some(final_offset) = self.final_offset {
            if end > final_offset || (fin && end != final_offset) {
                return Err(TransportError::FINAL_SIZE_ERROR(
                    "stream data past declared final size",
                ));
            }
        }
        if end > self.sent_max_data {
            return Err(TransportError::FLOW_CONTROL_ERROR(
                "stream offset beyond advertised window",
            ));
        }
        if fin {
            // A shrinking or conflicting final size was rejected above
            if self.final_offset.is_none() && end < self.highest_received {
                return Err(TransportError::FINAL_SIZE_ERROR(
                    "final size below received data",
                ));
            }
            self.final_offset = Some(end);
        }
        let new_bytes = end.saturating_sub(self.highest_received);
        self.highest_received = self.highest_received.max(end);
        Ok(new_bytes)
    }

    /// Account for the application consuming `n` contiguous bytes
    pub(crate) fn add_bytes_read(&mut self, n: u64) {
        self.bytes_read += n;
    }

    /// The absolute window to put in a MAX_STREAM_DATA frame right now
    ///
    /// Recomputed at frame-composition time so a retransmitted update always
    /// carries the freshest value.
    pub(crate) fn announce(&mut self) -> u64 {
        let value = self.bytes_read + self.window;
        self.sent_max_data = self.sent_max_data.max(value);
        value
    }

    /// The absolute window to announce in MAX_STREAM_DATA, if an announcement
    /// is currently worthwhile
    ///
    /// An update is sent when the receivable range has shrunk by at least half
    /// the window, or when the window has not been readvertised for a while.
    /// Once the final size is known no further updates are useful.
    pub(crate) fn get_window_update(&mut self, now: Instant) -> Option<u64> {
        if self.final_offset.is_some() {
            return None;
        }
        let new_max = self.bytes_read + self.window;
        if new_max <= self.sent_max_data {
            return None;
        }
        let significant = new_max - self.sent_max_data >= self.window / 2;
        let stale = now.saturating_duration_since(self.last_update) >= WINDOW_UPDATE_TIME_THRESHOLD
            && new_max > self.sent_max_data;
        if !significant && !stale {
            return None;
        }
        self.sent_max_data = new_max;
        self.last_update = now;
        Some(new_max)
    }
}

/// Receive-direction window for the whole connection
///
/// Aggregates credit consumed by every stream; the per-frame increments are
/// computed by the stream windows so overlapping retransmissions are never
/// double counted.
#[derive(Debug)]
pub(crate) struct ConnRecvWindow {
    /// Sum of previously-unseen bytes across all streams
    received: u64,
    /// Sum of bytes consumed by the application across all streams
    bytes_read: u64,
    sent_max_data: u64,
    window: u64,
    last_update: Instant,
}

impl ConnRecvWindow {
    pub(crate) fn new(window: u64, now: Instant) -> Self {
        Self {
            received: 0,
            bytes_read: 0,
            sent_max_data: window,
            window,
            last_update: now,
        }
    }

    /// Consume `new_bytes` of connection-level credit
    pub(crate) fn on_received(&mut self, new_bytes: u64) -> Result<(), TransportError> {
        self.received += new_bytes;
        if self.received > self.sent_max_data {
            return Err(TransportError::FLOW_CONTROL_ERROR(
                "connection data beyond advertised window",
            ));
        }
        Ok(())
    }

    pub(crate) fn add_bytes_read(&mut self, n: u64) {
        self.bytes_read += n;
    }

    /// The absolute window to put in a MAX_DATA frame right now
    pub(crate) fn announce(&mut self) -> u64 {
        let value = self.bytes_read + self.window;
        self.sent_max_data = self.sent_max_data.max(value);
        value
    }

    /// The absolute window to announce in MAX_DATA, if worthwhile
    pub(crate) fn get_window_update(&mut self, now: Instant) -> Option<u64> {
        let new_max = self.bytes_read + self.window;
        if new_max <= self.sent_max_data {
            return None;
        }
        let significant = new_max - self.sent_max_data >= self.window / 2;
        let stale =
            now.saturating_duration_since(self.last_update) >= WINDOW_UPDATE_TIME_THRESHOLD;
        if !significant && !stale {
            return None;
        }
        self.sent_max_data = new_max;
        self.last_update = now;
        Some(new_max)
    }
}
