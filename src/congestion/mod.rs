//! Logic for controlling the rate at which data is sent.

use std::any::Any;
use std::sync::Arc;
use std::time::Instant;

use crate::recovery::RttEstimator;

mod bbr;
mod cubic;
mod pacing;

pub use bbr::{Bbr, BbrConfig};
pub use cubic::{Cubic, CubicConfig};

/// One packet confirmed delivered by an ACK frame
#[derive(Debug, Copy, Clone)]
pub struct Acked {
    /// Packet number
    pub pn: u64,
    /// Bytes counted against congestion control, zero for non-eliciting packets
    pub bytes: u64,
    /// When the packet left the sender
    pub time_sent: Instant,
}

/// One packet declared lost
#[derive(Debug, Copy, Clone)]
pub struct Lost {
    /// Packet number
    pub pn: u64,
    /// Bytes counted against congestion control
    pub bytes: u64,
    /// When the packet left the sender
    pub time_sent: Instant,
}

/// Common interface for different congestion controllers
///
/// The session invokes these hooks from its loss-recovery path; algorithm
/// internals are opaque to the rest of the core. Implementations must honour
/// `can_send` and the pacing budget.
pub trait Controller: Send {
    /// A packet was just transmitted
    fn on_packet_sent(
        &mut self,
        now: Instant,
        bytes_in_flight: u64,
        pn: u64,
        bytes: u64,
        is_ack_eliciting: bool,
    );

    /// A single packet's delivery was confirmed
    #[allow(unused_variables)]
    fn on_packet_acked(
        &mut self,
        now: Instant,
        packet: &Acked,
        prior_in_flight: u64,
        rtt: &RttEstimator,
    ) {
    }

    /// A single packet was deemed lost
    #[allow(unused_variables)]
    fn on_packet_lost(&mut self, packet: &Lost, prior_in_flight: u64) {}

    /// An ACK frame was fully processed
    ///
    /// The default forwards to the per-packet hooks; batch-oriented
    /// controllers (BBR) replace it wholesale.
    #[allow(clippy::too_many_arguments)]
    fn on_cong_event(
        &mut self,
        now: Instant,
        prior_in_flight: u64,
        in_flight: u64,
        acked: &[Acked],
        lost: &[Lost],
        bytes_acked: u64,
        rtt: &RttEstimator,
    ) {
        let _ = (in_flight, bytes_acked);
        for packet in acked {
            self.on_packet_acked(now, packet, prior_in_flight, rtt);
        }
        for packet in lost {
            self.on_packet_lost(packet, prior_in_flight);
        }
    }

    /// Whether congestion control permits sending new data now
    fn can_send(&self, bytes_in_flight: u64) -> bool {
        bytes_in_flight < self.window()
    }

    /// Whether the pacer will release a packet right away
    ///
    /// When this returns `false`, [`Controller::time_until_send`] gives the
    /// instant at which it is worth asking again. ACK-only packets are exempt
    /// from pacing.
    fn has_pacing_budget(&mut self, now: Instant) -> bool;

    /// When the pacing budget is expected to allow the next send
    fn time_until_send(&self) -> Option<Instant>;

    /// Give the controller a chance to leave slow start early
    ///
    /// Invoked whenever a fresh RTT sample is taken.
    fn maybe_exit_slow_start(&mut self) {}

    /// The known MTU for the current network path has been updated
    fn set_max_datagram_size(&mut self, bytes: u64);

    /// Number of ack-eliciting bytes that may be in flight
    fn window(&self) -> u64;

    /// Initial congestion window
    fn initial_window(&self) -> u64;

    /// Returns Self for use in down-casting to extract implementation details
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
}

/// Constructs controllers on demand
pub trait ControllerFactory: Send + Sync {
    /// Construct a fresh `Controller`
    fn build(self: Arc<Self>, now: Instant, current_mtu: u64) -> Box<dyn Controller>;
}

const BASE_DATAGRAM_SIZE: u64 = 1200;

/// Recommended initial window: `min(10 * mtu, max(2 * mtu, 14720))`
pub(crate) fn initial_window(max_datagram_size: u64) -> u64 {
    14720.clamp(2 * max_datagram_size, 10 * max_datagram_size)
}
