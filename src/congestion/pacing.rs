//! Pacing of packet transmissions.

use std::time::{Duration, Instant};

use tracing::warn;

/// A simple token-bucket pacer. The bucket starts full and has an adjustable
/// capacity. Once the bucket is empty, further transmission is blocked. The
/// bucket refills at a rate slightly faster than one congestion window per
/// RTT.
#[derive(Debug)]
pub(super) struct Pacer {
    capacity: u64,
    tokens: u64,
    prev: Instant,
}

impl Pacer {
    pub(super) fn new(capacity: u64, now: Instant) -> Self {
        Self {
            capacity,
            tokens: capacity,
            prev: now,
        }
    }

    /// Record that a packet has been transmitted.
    pub(super) fn on_transmit(&mut self, packet_length: u64) {
        self.tokens = self.tokens.saturating_sub(packet_length)
    }

    /// Reset the bucket size, e.g. after the congestion window changed
    /// substantially
    pub(super) fn set_capacity(&mut self, capacity: u64) {
        self.capacity = capacity;
        self.tokens = self.tokens.min(capacity);
    }

    /// Return how long we need to wait before sending a packet.
    ///
    /// If we can send a packet right away, this returns `None`. Otherwise,
    /// returns `Some(d)`, where `d` is the time before this function should
    /// be called again.
    ///
    /// The 5/4 ratio used here comes from the suggestion that N = 1.25 in the
    /// draft IETF RFC for QUIC.
    pub(super) fn delay(
        &mut self,
        smoothed_rtt: Duration,
        mtu: u64,
        window: u64,
        now: Instant,
    ) -> Option<Instant> {
        debug_assert_ne!(
            window, 0,
            "zero-sized congestion control window is nonsense"
        );

        // if we can already send a packet, there is no need for delay
        if self.tokens >= mtu {
            return None;
        }

        // we disable pacing for extremely large windows
        if window > u32::MAX.into() {
            return None;
        }

        let time_elapsed = now.checked_duration_since(self.prev).unwrap_or_else(|| {
            warn!("received a timestamp earlier than a previous recorded time, ignoring");
            Default::default()
        });

        if smoothed_rtt.as_nanos() == 0 {
            return None;
        }

        let elapsed_rtts = time_elapsed.as_secs_f64() / smoothed_rtt.as_secs_f64();
        let new_tokens = window as f64 * 1.25 * elapsed_rtts;
        self.tokens = self
            .tokens
            .saturating_add(new_tokens as _)
            .min(self.capacity);
        self.prev = now;

        // if we can already send a packet, there is no need for delay
        if self.tokens >= mtu {
            return None;
        }

        let unscaled_delay = smoothed_rtt
            .checked_mul((mtu.max(self.capacity) - self.tokens) as _)
            .unwrap_or_else(|| Duration::new(u64::MAX, 999_999_999))
            / (window as u32);

        // divisions come before multiplications to prevent overflow
        // this is the time at which the pacing window becomes empty
        Some(self.prev + (unscaled_delay / 5) * 4)
    }
}
