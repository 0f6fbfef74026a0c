use std::any::Any;
use std::cmp;
use std::sync::Arc;
use std::time::{Duration, Instant};

use super::pacing::Pacer;
use super::{Acked, Controller, ControllerFactory, Lost, BASE_DATAGRAM_SIZE};
use crate::recovery::RttEstimator;

/// CUBIC Constants.
///
/// These are recommended value in RFC8312.
const BETA_CUBIC: f64 = 0.7;

const C: f64 = 0.4;

/// CUBIC State Variables.
///
/// We need to keep those variables across the connection.
/// k, w_max are described in the RFC.
#[derive(Debug, Default, Clone)]
struct State {
    k: f64,

    w_max: f64,

    // Store cwnd increment during congestion avoidance.
    cwnd_inc: u64,
}

/// CUBIC Functions.
///
/// Note that these calculations are based on a count of cwnd as bytes,
/// not packets.
/// Unit of t (duration) and RTT are based on seconds (f64).
impl State {
    // K = cbrt(w_max * (1 - beta_cubic) / C) (Eq. 2)
    fn cubic_k(&self, max_datagram_size: u64) -> f64 {
        let w_max = self.w_max / max_datagram_size as f64;
        (w_max * (1.0 - BETA_CUBIC) / C).cbrt()
    }

    // W_cubic(t) = C * (t - K)^3 + w_max (Eq. 1)
    fn w_cubic(&self, t: Duration, max_datagram_size: u64) -> f64 {
        let w_max = self.w_max / max_datagram_size as f64;

        (C * (t.as_secs_f64() - self.k).powi(3) + w_max) * max_datagram_size as f64
    }

    // W_est(t) = w_max * beta_cubic + 3 * (1 - beta_cubic) / (1 + beta_cubic) *
    // (t / RTT) (Eq. 4)
    fn w_est(&self, t: Duration, rtt: Duration, max_datagram_size: u64) -> f64 {
        let w_max = self.w_max / max_datagram_size as f64;
        (w_max * BETA_CUBIC
            + 3.0 * (1.0 - BETA_CUBIC) / (1.0 + BETA_CUBIC) * t.as_secs_f64() / rtt.as_secs_f64())
            * max_datagram_size as f64
    }
}

/// The RFC8312 congestion controller, as widely used for TCP
#[derive(Debug)]
pub struct Cubic {
    config: Arc<CubicConfig>,
    max_datagram_size: u64,
    /// Maximum number of bytes in flight that may be sent.
    window: u64,
    /// Slow start threshold in bytes. When the congestion window is below
    /// ssthresh, the mode is slow start and the window grows by the number of
    /// bytes acknowledged.
    ssthresh: u64,
    /// The time when QUIC first detects a loss, causing it to enter recovery.
    /// When a packet sent after this time is acknowledged, QUIC exits
    /// recovery.
    recovery_start_time: Option<Instant>,
    cubic_state: State,
    pacer: Pacer,
    /// Most recent smoothed RTT handed to the pacer
    latest_rtt: Duration,
    next_send_time: Option<Instant>,
}

impl Cubic {
    /// Construct a state using the given `config` and current time `now`
    pub fn new(config: Arc<CubicConfig>, now: Instant, current_mtu: u64) -> Self {
        let window = config.initial_window;
        Self {
            config,
            max_datagram_size: current_mtu,
            window,
            ssthresh: u64::MAX,
            recovery_start_time: None,
            cubic_state: Default::default(),
            pacer: Pacer::new(window, now),
            latest_rtt: Duration::ZERO,
            next_send_time: None,
        }
    }

    fn minimum_window(&self) -> u64 {
        2 * self.max_datagram_size
    }
}

impl Controller for Cubic {
    fn on_packet_sent(
        &mut self,
        _now: Instant,
        _bytes_in_flight: u64,
        _pn: u64,
        bytes: u64,
        is_ack_eliciting: bool,
    ) {
        if is_ack_eliciting {
            self.pacer.on_transmit(bytes);
        }
    }

    fn on_packet_acked(
        &mut self,
        now: Instant,
        packet: &Acked,
        _prior_in_flight: u64,
        rtt: &RttEstimator,
    ) {
        if packet.bytes == 0 {
            return;
        }
        self.latest_rtt = rtt.get();
        if self
            .recovery_start_time
            .map(|recovery_start_time| packet.time_sent <= recovery_start_time)
            .unwrap_or(false)
        {
            return;
        }

        if self.window < self.ssthresh {
            // Slow start
            self.window += packet.bytes;
        } else {
            // Congestion avoidance.
            let ca_start_time = match self.recovery_start_time {
                Some(t) => t,
                None => {
                    // When we come here without a congestion event triggered,
                    // initialize congestion_recovery_start_time, w_max and k.
                    self.recovery_start_time = Some(now);
                    self.cubic_state.w_max = self.window as f64;
                    self.cubic_state.k = 0.0;
                    now
                }
            };

            let t = now - ca_start_time;

            // w_cubic(t + rtt)
            let w_cubic = self
                .cubic_state
                .w_cubic(t + rtt.get(), self.max_datagram_size);

            // w_est(t)
            let w_est = self.cubic_state.w_est(t, rtt.get(), self.max_datagram_size);

            let mut cubic_cwnd = self.window;

            if w_cubic < w_est {
                // TCP friendly region.
                cubic_cwnd = cmp::max(cubic_cwnd, w_est as u64);
            } else if cubic_cwnd < w_cubic as u64 {
                // Concave region or convex region use same increment.
                let cubic_inc = (w_cubic - cubic_cwnd as f64) / cubic_cwnd as f64
                    * self.max_datagram_size as f64;

                cubic_cwnd += cubic_inc as u64;
            }

            // Update the increment and increase cwnd by MSS.
            self.cubic_state.cwnd_inc += cubic_cwnd - self.window;

            // cwnd_inc can be more than 1 MSS in the late stage of max
            // probing, but RFC9002 §7.3.3 limits the increase of cwnd to
            // 1 max_datagram_size per cwnd acknowledged.
            if self.cubic_state.cwnd_inc >= self.max_datagram_size {
                self.window += self.max_datagram_size;
                self.cubic_state.cwnd_inc = 0;
            }
        }
        self.pacer.set_capacity(self.window);
    }

    fn on_packet_lost(&mut self, packet: &Lost, _prior_in_flight: u64) {
        if self
            .recovery_start_time
            .map(|recovery_start_time| packet.time_sent <= recovery_start_time)
            .unwrap_or(false)
        {
            return;
        }

        self.recovery_start_time = Some(packet.time_sent);

        // Fast convergence
        if (self.window as f64) < self.cubic_state.w_max {
            self.cubic_state.w_max = self.window as f64 * (1.0 + BETA_CUBIC) / 2.0;
        } else {
            self.cubic_state.w_max = self.window as f64;
        }

        self.ssthresh = cmp::max(
            (self.cubic_state.w_max * BETA_CUBIC) as u64,
            self.minimum_window(),
        );
        self.window = self.ssthresh;
        self.cubic_state.k = self.cubic_state.cubic_k(self.max_datagram_size);

        self.cubic_state.cwnd_inc = (self.cubic_state.cwnd_inc as f64 * BETA_CUBIC) as u64;
        self.pacer.set_capacity(self.window);
    }

    fn has_pacing_budget(&mut self, now: Instant) -> bool {
        if self.latest_rtt.is_zero() {
            // No samples yet; the initial window bounds the burst instead
            self.next_send_time = None;
            return true;
        }
        self.next_send_time =
            self.pacer
                .delay(self.latest_rtt, self.max_datagram_size, self.window, now);
        self.next_send_time.is_none()
    }

    fn time_until_send(&self) -> Option<Instant> {
        self.next_send_time
    }

    fn set_max_datagram_size(&mut self, bytes: u64) {
        self.max_datagram_size = bytes;
    }

    fn window(&self) -> u64 {
        self.window
    }

    fn initial_window(&self) -> u64 {
        self.config.initial_window
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Configuration for the `Cubic` congestion controller
#[derive(Debug, Clone)]
pub struct CubicConfig {
    initial_window: u64,
}

impl CubicConfig {
    /// Default limit on the amount of outstanding data in bytes.
    ///
    /// Recommended value: `min(10 * max_datagram_size, max(2 * max_datagram_size, 14720))`
    pub fn initial_window(&mut self, value: u64) -> &mut Self {
        self.initial_window = value;
        self
    }
}

impl Default for CubicConfig {
    fn default() -> Self {
        Self {
            initial_window: super::initial_window(BASE_DATAGRAM_SIZE),
        }
    }
}

impl ControllerFactory for CubicConfig {
    fn build(self: Arc<Self>, now: Instant, current_mtu: u64) -> Box<dyn Controller> {
        Box::new(Cubic::new(self, now, current_mtu))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctrl() -> Cubic {
        Cubic::new(Arc::new(CubicConfig::default()), Instant::now(), 1200)
    }

    fn acked(pn: u64, bytes: u64, time_sent: Instant) -> Acked {
        Acked {
            pn,
            bytes,
            time_sent,
        }
    }

    #[test]
    fn slow_start_grows_by_acked_bytes() {
        let mut c = ctrl();
        let now = Instant::now();
        let rtt = RttEstimator::new(Duration::from_millis(100));
        let w0 = c.window();
        c.on_packet_acked(now, &acked(0, 1200, now), w0, &rtt);
        assert_eq!(c.window(), w0 + 1200);
    }

    #[test]
    fn loss_shrinks_window() {
        let mut c = ctrl();
        let now = Instant::now();
        let w0 = c.window();
        c.on_packet_lost(
            &Lost {
                pn: 0,
                bytes: 1200,
                time_sent: now,
            },
            w0,
        );
        assert!(c.window() < w0);
        assert!(c.window() >= c.minimum_window());
    }

    #[test]
    fn acks_in_recovery_ignored() {
        let mut c = ctrl();
        let now = Instant::now();
        let rtt = RttEstimator::new(Duration::from_millis(100));
        c.on_packet_lost(
            &Lost {
                pn: 1,
                bytes: 1200,
                time_sent: now,
            },
            c.window(),
        );
        let w = c.window();
        // A packet sent before recovery began must not grow the window
        c.on_packet_acked(now + Duration::from_millis(1), &acked(0, 1200, now), w, &rtt);
        assert_eq!(c.window(), w);
    }

    #[test]
    fn pacing_budget_initially_available() {
        let mut c = ctrl();
        assert!(c.has_pacing_budget(Instant::now()));
    }
}
