//! BBR congestion control.
//!
//! Model-based rather than loss-based: the controller continuously estimates
//! the bottleneck bandwidth and the round-trip floor, paces at a gain-scaled
//! multiple of the estimated bandwidth, and caps in-flight data near the
//! estimated bandwidth-delay product. Follows the BBR draft
//! <https://datatracker.ietf.org/doc/html/draft-cardwell-iccrg-bbr-congestion-control>.

use std::any::Any;
use std::collections::VecDeque;
use std::sync::Arc;
use std::time::{Duration, Instant};

use rand::{Rng, SeedableRng};

use super::{Acked, Controller, ControllerFactory, Lost, BASE_DATAGRAM_SIZE};
use crate::recovery::RttEstimator;

/// Pacing gain while searching for the bandwidth ceiling, 2/ln 2: enough to
/// double the delivery rate each round while the pipe is filling
const STARTUP_GAIN: f32 = 2.885;
/// Inverse of the startup gain, used to bleed off the queue startup built
const DRAIN_GAIN: f32 = 1.0 / STARTUP_GAIN;
/// Window gain while cruising
const CRUISE_CWND_GAIN: f32 = 2.0;
/// Pacing-gain rotation while cruising: one probing phase, one draining
/// phase, six at the estimate
const CYCLE_GAINS: [f32; 8] = [1.25, 0.75, 1.0, 1.0, 1.0, 1.0, 1.0, 1.0];
/// Growth factor the bandwidth estimate must show for startup to keep going
const BW_GROWTH_TARGET: f64 = 1.25;
/// Rounds without that growth before startup concludes the pipe is full
const STARTUP_STALL_ROUNDS: u64 = 3;
/// How long in-flight data is held at the floor while re-measuring the RTT
const PROBE_RTT_DURATION: Duration = Duration::from_millis(200);
/// Age at which the RTT floor is considered stale and must be re-measured
const MIN_RTT_WINDOW: Duration = Duration::from_secs(10);
/// Window gain while re-measuring the RTT floor
const PROBE_RTT_GAIN: f32 = 0.75;
/// Cap on the configured initial window, in packets
const MAX_INITIAL_WINDOW_PACKETS: u64 = 200;
/// Rounds a bandwidth sample stays eligible in the max filter
const BW_FILTER_ROUNDS: u64 = 10;

/// What the controller is currently using the network for
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum Mode {
    /// Ramping up to find the bandwidth ceiling
    Startup,
    /// Bleeding off the queue startup left behind
    Drain,
    /// Cruising, with periodic bandwidth probes
    ProbeBw,
    /// Briefly holding in-flight data at the floor to re-measure the RTT
    ProbeRtt,
}

#[derive(Debug, Clone)]
pub struct Bbr {
    config: Arc<BbrConfig>,
    mtu: u64,
    min_window: u64,
    init_window: u64,
    mode: Mode,
    pacing_gain: f32,
    cwnd_gain: f32,
    cwnd: u64,
    rate: DeliveryRate,
    excess: ExcessAcked,
    rounds: RoundClock,
    recovery: Recovery,
    /// Startup progress: last round's estimate and how long it has stagnated
    full_bw_reached: bool,
    bw_last_round: u64,
    stalled_rounds: u64,
    /// Probe-bw cycle position and when the current phase began
    cycle_phase: u8,
    phase_began: Option<Instant>,
    /// RTT floor, when it was last refreshed, and when the current probe may
    /// end
    min_rtt: Duration,
    min_rtt_taken: Option<Instant>,
    probe_rtt_done_at: Option<Instant>,
    acked_total: u64,
    prev_in_flight: u64,
    /// Pacing bucket fed from `pacing_rate`
    pacing_rate: u64,
    pacing_tokens: u64,
    pacing_refilled: Option<Instant>,
    next_send_time: Option<Instant>,
    rng: rand::rngs::StdRng,
}

impl Bbr {
    pub fn new(config: Arc<BbrConfig>, current_mtu: u64) -> Self {
        let init_window = config.initial_window;
        Self {
            config,
            mtu: current_mtu,
            min_window: 4 * current_mtu,
            init_window,
            mode: Mode::Startup,
            pacing_gain: STARTUP_GAIN,
            cwnd_gain: STARTUP_GAIN,
            cwnd: init_window,
            rate: DeliveryRate::default(),
            excess: ExcessAcked::default(),
            rounds: RoundClock::default(),
            recovery: Recovery::default(),
            full_bw_reached: false,
            bw_last_round: 0,
            stalled_rounds: 0,
            cycle_phase: 0,
            phase_began: None,
            min_rtt: Duration::ZERO,
            min_rtt_taken: None,
            probe_rtt_done_at: None,
            acked_total: 0,
            prev_in_flight: 0,
            pacing_rate: 0,
            pacing_tokens: init_window,
            pacing_refilled: None,
            next_send_time: None,
            rng: rand::rngs::StdRng::from_entropy(),
        }
    }

    /// One pass of the mode machine, run once per processed ACK frame
    fn step(&mut self, now: Instant, in_flight: u64, round_start: bool) {
        match self.mode {
            Mode::Startup => {
                if round_start && !self.full_bw_reached {
                    self.note_bw_growth();
                }
                if self.full_bw_reached {
                    self.enter_drain();
                }
            }
            Mode::Drain => {
                if in_flight <= self.target_window(1.0) {
                    self.enter_probe_bw(now);
                }
            }
            Mode::ProbeBw => self.advance_cycle(now, in_flight),
            Mode::ProbeRtt => self.step_probe_rtt(now, in_flight, round_start),
        }
        // A stale RTT floor forces a measurement pass regardless of mode
        if self.mode != Mode::ProbeRtt && self.min_rtt_stale(now) {
            self.enter_probe_rtt(now);
        }
    }

    fn enter_startup(&mut self) {
        self.mode = Mode::Startup;
        self.pacing_gain = STARTUP_GAIN;
        self.cwnd_gain = STARTUP_GAIN;
    }

    fn enter_drain(&mut self) {
        self.mode = Mode::Drain;
        self.pacing_gain = DRAIN_GAIN;
        self.cwnd_gain = STARTUP_GAIN;
    }

    fn enter_probe_bw(&mut self, now: Instant) {
        self.mode = Mode::ProbeBw;
        self.cwnd_gain = CRUISE_CWND_GAIN;
        // Start anywhere in the cycle except the drain slot, so a probe phase
        // is always followed by its matching drain
        let mut phase = self.rng.gen_range(0..CYCLE_GAINS.len() as u8 - 1);
        if phase >= 1 {
            phase += 1;
        }
        self.cycle_phase = phase;
        self.phase_began = Some(now);
        self.pacing_gain = CYCLE_GAINS[phase as usize];
    }

    fn enter_probe_rtt(&mut self, now: Instant) {
        self.mode = Mode::ProbeRtt;
        self.pacing_gain = 1.0;
        self.probe_rtt_done_at = None;
        self.min_rtt_taken = Some(now);
    }

    /// Startup exits once the estimate stops growing for a few rounds
    fn note_bw_growth(&mut self) {
        let bw = self.rate.estimate();
        if bw as f64 >= self.bw_last_round as f64 * BW_GROWTH_TARGET {
            self.bw_last_round = bw;
            self.stalled_rounds = 0;
            self.excess.reset_max();
            return;
        }
        self.stalled_rounds += 1;
        if self.stalled_rounds >= STARTUP_STALL_ROUNDS || self.recovery.in_recovery() {
            self.full_bw_reached = true;
        }
    }

    /// Rotate the probe-bw gain cycle, normally once per RTT floor
    fn advance_cycle(&mut self, now: Instant, in_flight: u64) {
        let mut rotate = self
            .phase_began
            .map_or(false, |began| now.duration_since(began) > self.min_rtt);
        if self.pacing_gain > 1.0
            && self.recovery.lost_bytes == 0
            && self.prev_in_flight < self.target_window(self.pacing_gain)
        {
            // The probe never actually filled the pipe to its target; keep
            // pushing unless loss said the queue cannot take it
            rotate = false;
        } else if self.pacing_gain < 1.0 && in_flight <= self.target_window(1.0) {
            // The queue built while probing has drained; no need to sit out
            // the rest of the phase
            rotate = true;
        }
        if !rotate {
            return;
        }
        self.cycle_phase = (self.cycle_phase + 1) % CYCLE_GAINS.len() as u8;
        self.phase_began = Some(now);
        let next = CYCLE_GAINS[self.cycle_phase as usize];
        if self.pacing_gain < 1.0 && next == 1.0 && in_flight > self.target_window(1.0) {
            // Still draining; hold the low gain until the target is reached
            return;
        }
        self.pacing_gain = next;
    }

    fn step_probe_rtt(&mut self, now: Instant, in_flight: u64, round_start: bool) {
        match self.probe_rtt_done_at {
            None => {
                // The measurement clock starts only once in-flight data has
                // actually dropped to the probe level
                if in_flight < self.probe_rtt_window() + self.mtu {
                    self.probe_rtt_done_at = Some(now + PROBE_RTT_DURATION);
                }
            }
            Some(done_at) => {
                if round_start && now >= done_at {
                    if self.full_bw_reached {
                        self.enter_probe_bw(now);
                    } else {
                        self.enter_startup();
                    }
                }
            }
        }
    }

    fn min_rtt_stale(&self, now: Instant) -> bool {
        self.min_rtt_taken
            .map_or(true, |at| now.saturating_duration_since(at) > MIN_RTT_WINDOW)
    }

    /// The window implied by the bandwidth-delay product at `gain`
    fn target_window(&self, gain: f32) -> u64 {
        let bdp = (self.rate.estimate() as u128 * self.min_rtt.as_micros()) / 1_000_000;
        let scaled = (gain as f64 * bdp as f64) as u64;
        if scaled == 0 {
            // Nothing measured yet
            return self.init_window;
        }
        scaled.max(self.min_window)
    }

    fn probe_rtt_window(&self) -> u64 {
        self.target_window(PROBE_RTT_GAIN)
    }

    fn update_pacing_rate(&mut self) {
        let bw = self.rate.estimate();
        if bw == 0 {
            return;
        }
        if self.pacing_rate == 0 {
            // First estimate: pace the configured window across the RTT floor
            if !self.min_rtt.is_zero() {
                self.pacing_rate = bytes_per_second(self.init_window, self.min_rtt).unwrap_or(0);
            }
            return;
        }
        let target = (bw as f64 * self.pacing_gain as f64) as u64;
        if self.full_bw_reached || self.pacing_rate < target {
            // Only a full pipe justifies slowing down
            self.pacing_rate = target;
        }
    }

    fn update_window(&mut self, bytes_acked: u64, excess: u64, in_flight: u64) {
        if self.mode != Mode::ProbeRtt {
            // Pad the BDP target with measured ack clumping (or, before the
            // pipe is known full, the latest overshoot) so bursty ack
            // arrival doesn't idle the sender
            let pad = if self.full_bw_reached {
                self.excess.max()
            } else {
                excess
            };
            let target = self.target_window(self.cwnd_gain) + pad;
            if self.full_bw_reached {
                // Approach the target one acked batch at a time
                self.cwnd = target.min(self.cwnd + bytes_acked);
            } else if self.cwnd < target || self.acked_total < self.init_window {
                // Never shrink while still searching for the ceiling
                self.cwnd += bytes_acked;
            }
            self.cwnd = self.cwnd.max(self.min_window);
        }
        self.recovery
            .update_window(bytes_acked, in_flight, self.min_window, self.mtu);
    }
}

impl Controller for Bbr {
    fn on_packet_sent(
        &mut self,
        now: Instant,
        _bytes_in_flight: u64,
        pn: u64,
        bytes: u64,
        is_ack_eliciting: bool,
    ) {
        if !is_ack_eliciting {
            return;
        }
        self.rounds.on_sent(pn);
        self.rate.on_sent(now, bytes);
        self.pacing_tokens = self.pacing_tokens.saturating_sub(bytes);
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
        self.rate.on_acked(now, packet.bytes, self.rounds.count);
        self.acked_total += packet.bytes;
        if self.min_rtt_stale(now) || self.min_rtt > rtt.min() {
            self.min_rtt = rtt.min();
        }
    }

    fn on_cong_event(
        &mut self,
        now: Instant,
        prior_in_flight: u64,
        in_flight: u64,
        acked: &[Acked],
        lost: &[Lost],
        _bytes_acked: u64,
        rtt: &RttEstimator,
    ) {
        for packet in acked {
            self.on_packet_acked(now, packet, prior_in_flight, rtt);
        }
        for packet in lost {
            self.recovery.on_lost(packet.bytes);
        }

        let newly_acked = self.rate.newly_acked();
        let excess = self
            .excess
            .update(newly_acked, now, self.rounds.count, self.rate.estimate());
        self.rate.end_window();

        let largest = acked.iter().map(|packet| packet.pn).max();
        let round_start = self.rounds.on_ack_batch(largest, newly_acked > 0);

        if self
            .recovery
            .advance(round_start, self.rounds.largest_sent, self.rounds.largest_acked)
        {
            // Conservation is meant to last a whole round; restart the clock
            self.rounds.extend_round();
        }

        self.step(now, in_flight, round_start);

        self.update_pacing_rate();
        self.update_window(newly_acked, excess, in_flight);

        self.prev_in_flight = in_flight;
        self.recovery.end_ack_batch();
    }

    fn has_pacing_budget(&mut self, now: Instant) -> bool {
        if self.pacing_rate == 0 {
            // No rate estimate yet; the congestion window bounds the burst
            self.next_send_time = None;
            return true;
        }
        if let Some(prev) = self.pacing_refilled {
            let elapsed = now.saturating_duration_since(prev);
            let refill = (self.pacing_rate as f64 * elapsed.as_secs_f64()) as u64;
            // Cap the bucket at a quarter window to bound burstiness
            self.pacing_tokens =
                (self.pacing_tokens + refill).min(self.window() / 4 + self.mtu);
        }
        self.pacing_refilled = Some(now);
        if self.pacing_tokens >= self.mtu {
            self.next_send_time = None;
            return true;
        }
        let deficit = self.mtu - self.pacing_tokens;
        let wait = Duration::from_secs_f64(deficit as f64 / self.pacing_rate as f64);
        self.next_send_time = Some(now + wait);
        false
    }

    fn time_until_send(&self) -> Option<Instant> {
        self.next_send_time
    }

    fn maybe_exit_slow_start(&mut self) {
        // Startup is BBR's slow-start analogue; leave it as soon as the
        // bandwidth filter stops growing
        if self.mode == Mode::Startup && self.full_bw_reached {
            self.enter_drain();
        }
    }

    fn set_max_datagram_size(&mut self, bytes: u64) {
        self.mtu = bytes;
        self.min_window = 4 * bytes;
        self.init_window = self.config.initial_window.max(self.min_window);
        self.cwnd = self.cwnd.max(self.min_window);
    }

    fn window(&self) -> u64 {
        match self.mode {
            Mode::ProbeRtt => self.probe_rtt_window(),
            // During recovery in-flight data additionally respects the
            // recovery window, except in startup where growth wins
            _ if self.recovery.in_recovery() && self.mode != Mode::Startup => {
                self.cwnd.min(self.recovery.window)
            }
            _ => self.cwnd,
        }
    }

    fn initial_window(&self) -> u64 {
        self.config.initial_window
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// Configuration for the [`Bbr`] congestion controller
#[derive(Debug, Clone)]
pub struct BbrConfig {
    initial_window: u64,
}

impl BbrConfig {
    /// Default limit on the amount of outstanding data in bytes.
    pub fn initial_window(&mut self, value: u64) -> &mut Self {
        self.initial_window = value;
        self
    }
}

impl Default for BbrConfig {
    fn default() -> Self {
        Self {
            initial_window: MAX_INITIAL_WINDOW_PACKETS * BASE_DATAGRAM_SIZE,
        }
    }
}

impl ControllerFactory for BbrConfig {
    fn build(self: Arc<Self>, _now: Instant, current_mtu: u64) -> Box<dyn Controller> {
        Box::new(Bbr::new(self, current_mtu))
    }
}

/// Round trips counted in packet numbers: a round ends when the packet that
/// was the latest send at its start is acknowledged
#[derive(Debug, Clone, Default)]
struct RoundClock {
    count: u64,
    round_end_pn: u64,
    largest_sent: u64,
    largest_acked: u64,
}

impl RoundClock {
    fn on_sent(&mut self, pn: u64) {
        self.largest_sent = self.largest_sent.max(pn);
    }

    /// Note a batch of acknowledgements; returns whether a round ended
    ///
    /// `advance` is false for batches that confirmed no new in-flight bytes,
    /// which must not tick the clock.
    fn on_ack_batch(&mut self, largest: Option<u64>, advance: bool) -> bool {
        if let Some(largest) = largest {
            self.largest_acked = self.largest_acked.max(largest);
        }
        if advance && self.largest_acked > self.round_end_pn {
            self.round_end_pn = self.largest_sent;
            self.count += 1;
            return true;
        }
        false
    }

    /// Stretch the current round to end at the latest send
    fn extend_round(&mut self) {
        self.round_end_pn = self.largest_sent;
    }
}

/// Loss response: how in-flight data is limited while losses are fresh
#[derive(Debug, Clone, Copy, Default, Eq, PartialEq)]
enum RecoveryPhase {
    #[default]
    None,
    /// One extra byte in flight per byte acknowledged
    Conservation,
    /// Two extra bytes in flight per byte acknowledged
    Growth,
}

#[derive(Debug, Clone, Default)]
struct Recovery {
    phase: RecoveryPhase,
    window: u64,
    /// Acknowledgements past this packet with no further loss end recovery
    exit_pn: u64,
    /// Bytes lost in the ACK batch being processed
    lost_bytes: u64,
}

impl Recovery {
    fn on_lost(&mut self, bytes: u64) {
        self.lost_bytes += bytes;
    }

    fn in_recovery(&self) -> bool {
        self.phase != RecoveryPhase::None
    }

    /// Advance the phase machine for one ACK batch
    ///
    /// Returns whether conservation was just entered, in which case the
    /// caller restarts its round clock so the phase lasts a full round.
    fn advance(&mut self, round_start: bool, largest_sent: u64, largest_acked: u64) -> bool {
        if self.lost_bytes > 0 {
            self.exit_pn = largest_sent;
        }
        match self.phase {
            RecoveryPhase::None if self.lost_bytes > 0 => {
                self.phase = RecoveryPhase::Conservation;
                // Sized on the next update_window call
                self.window = 0;
                return true;
            }
            RecoveryPhase::Conservation | RecoveryPhase::Growth => {
                if self.phase == RecoveryPhase::Conservation && round_start {
                    self.phase = RecoveryPhase::Growth;
                }
                if self.lost_bytes == 0 && largest_acked > self.exit_pn {
                    self.phase = RecoveryPhase::None;
                }
            }
            RecoveryPhase::None => {}
        }
        false
    }

    fn update_window(&mut self, bytes_acked: u64, in_flight: u64, min_window: u64, mtu: u64) {
        if self.phase == RecoveryPhase::None {
            return;
        }
        if self.window == 0 {
            self.window = min_window.max(in_flight + bytes_acked);
            return;
        }
        // Losses shrink the window; growth additionally releases the bytes
        // just acknowledged
        self.window = if self.window >= self.lost_bytes {
            self.window - self.lost_bytes
        } else {
            mtu
        };
        if self.phase == RecoveryPhase::Growth {
            self.window += bytes_acked;
        }
        // Always leave room to answer what just arrived
        self.window = self.window.max(in_flight + bytes_acked).max(min_window);
    }

    fn end_ack_batch(&mut self) {
        self.lost_bytes = 0;
    }
}

/// Delivery-rate estimation
///
/// Each acknowledgement yields a sample: the slower of the recent send rate
/// and the recent ack rate, so a clump of stretched acks cannot inflate the
/// estimate. Samples feed a windowed max filter over rounds.
#[derive(Debug, Clone, Default)]
struct DeliveryRate {
    sent: Tally,
    acked: Tally,
    max_filter: WindowedMax,
    acked_at_window: u64,
}

impl DeliveryRate {
    fn on_sent(&mut self, now: Instant, bytes: u64) {
        self.sent.record(bytes, now);
    }

    fn on_acked(&mut self, now: Instant, bytes: u64, round: u64) {
        self.acked.record(bytes, now);
        let ack_rate = match self.acked.rate() {
            Some(rate) => rate,
            // A single ack carries no interval to measure over
            None => return,
        };
        let sample = match self.sent.rate() {
            Some(send_rate) => send_rate.min(ack_rate),
            // Sends collapsed onto one timestamp; only the ack side bounds
            None => ack_rate,
        };
        self.max_filter.update(round, sample);
    }

    /// Bytes acknowledged since `end_window` was last called
    fn newly_acked(&self) -> u64 {
        self.acked.total - self.acked_at_window
    }

    fn end_window(&mut self) {
        self.acked_at_window = self.acked.total;
    }

    fn estimate(&self) -> u64 {
        self.max_filter.get()
    }
}

/// A running byte total with timestamps of its two most recent increments
#[derive(Debug, Clone, Default)]
struct Tally {
    total: u64,
    latest: Option<(u64, Instant)>,
    prev: Option<(u64, Instant)>,
}

impl Tally {
    fn record(&mut self, bytes: u64, now: Instant) {
        self.total += bytes;
        self.prev = self.latest.take();
        self.latest = Some((self.total, now));
    }

    /// Rate across the two most recent increments, in bytes per second
    fn rate(&self) -> Option<u64> {
        let (latest_total, latest_at) = self.latest?;
        let (prev_total, prev_at) = self.prev?;
        bytes_per_second(
            latest_total - prev_total,
            latest_at.saturating_duration_since(prev_at),
        )
    }
}

fn bytes_per_second(bytes: u64, interval: Duration) -> Option<u64> {
    let nanos = interval.as_nanos();
    if nanos == 0 {
        return None;
    }
    Some((bytes as u128 * 1_000_000_000 / nanos) as u64)
}

/// Ack clumping: how far bytes acknowledged in the current epoch run ahead
/// of what the bandwidth estimate says should have arrived
///
/// The running maximum of that overshoot pads the congestion window once the
/// pipe is known full, so bursty ack delivery doesn't starve the sender.
#[derive(Debug, Clone, Default)]
struct ExcessAcked {
    epoch_began: Option<Instant>,
    epoch_bytes: u64,
    max_filter: WindowedMax,
}

impl ExcessAcked {
    fn update(&mut self, newly_acked: u64, now: Instant, round: u64, bw: u64) -> u64 {
        let expected = match self.epoch_began {
            Some(began) => {
                (bw as u128 * now.saturating_duration_since(began).as_micros() / 1_000_000) as u64
            }
            None => 0,
        };
        if self.epoch_bytes <= expected {
            // Arrival has fallen back to the estimated rate; measure a fresh
            // epoch from here
            self.epoch_began = Some(now);
            self.epoch_bytes = newly_acked;
            return 0;
        }
        self.epoch_bytes += newly_acked;
        let excess = self.epoch_bytes - expected;
        self.max_filter.update(round, excess);
        excess
    }

    fn max(&self) -> u64 {
        self.max_filter.get()
    }

    fn reset_max(&mut self) {
        self.max_filter.reset();
    }
}

/// Running maximum over a sliding window of rounds
///
/// A monotonic deque: entries are kept in decreasing value order, each
/// remembering the round it was sampled in. New samples evict dominated
/// entries from the back; expired rounds fall off the front. The front is
/// therefore always the exact maximum of the retained window.
#[derive(Debug, Clone, Default)]
struct WindowedMax {
    samples: VecDeque<(u64, u64)>,
}

impl WindowedMax {
    fn update(&mut self, round: u64, value: u64) {
        while self
            .samples
            .back()
            .map_or(false, |&(_, existing)| existing <= value)
        {
            self.samples.pop_back();
        }
        self.samples.push_back((round, value));
        while self
            .samples
            .front()
            .map_or(false, |&(sampled, _)| round - sampled > BW_FILTER_ROUNDS)
        {
            self.samples.pop_front();
        }
    }

    fn get(&self) -> u64 {
        self.samples.front().map_or(0, |&(_, value)| value)
    }

    fn reset(&mut self) {
        self.samples.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctrl() -> Bbr {
        Bbr::new(Arc::new(BbrConfig::default()), 1200)
    }

    #[test]
    fn startup_window_grows_on_acks() {
        let mut bbr = ctrl();
        let t0 = Instant::now();
        let rtt = {
            let mut r = RttEstimator::new(Duration::from_millis(100));
            r.update(Duration::ZERO, Duration::from_millis(100));
            r
        };
        let w0 = bbr.window();
        bbr.on_packet_sent(t0, 0, 1, 1200, true);
        let acked = [Acked {
            pn: 1,
            bytes: 1200,
            time_sent: t0,
        }];
        bbr.on_cong_event(
            t0 + Duration::from_millis(100),
            1200,
            0,
            &acked,
            &[],
            1200,
            &rtt,
        );
        assert!(bbr.window() >= w0);
    }

    #[test]
    fn pacing_initially_unlimited() {
        let mut bbr = ctrl();
        assert!(bbr.has_pacing_budget(Instant::now()));
        assert_eq!(bbr.time_until_send(), None);
    }

    #[test]
    fn startup_exits_after_bandwidth_stalls() {
        let mut bbr = ctrl();
        // Pretend a healthy estimate was seen; with no further growth the
        // stall counter runs out and startup concludes the pipe is full
        bbr.bw_last_round = 1_000_000;
        for _ in 0..STARTUP_STALL_ROUNDS {
            bbr.note_bw_growth();
        }
        assert!(bbr.full_bw_reached);
        bbr.maybe_exit_slow_start();
        assert_eq!(bbr.mode, Mode::Drain);
    }

    #[test]
    fn loss_enters_conservation_then_exits() {
        let mut recovery = Recovery::default();
        recovery.on_lost(1200);
        // Entering conservation asks the caller to restart its round clock
        assert!(recovery.advance(false, 10, 5));
        assert!(recovery.in_recovery());
        recovery.update_window(0, 2400, 4800, 1200);
        assert!(recovery.window >= 4800);
        recovery.end_ack_batch();
        // A loss-free batch acknowledging past the exit point leaves recovery
        assert!(!recovery.advance(true, 12, 11));
        assert!(!recovery.in_recovery());
    }

    #[test]
    fn windowed_max_expires_old_samples() {
        let mut filter = WindowedMax::default();
        filter.update(0, 100);
        filter.update(1, 200);
        assert_eq!(filter.get(), 200);
        filter.update(2, 50);
        assert_eq!(filter.get(), 200);
        // The old maximum ages out of the round window
        for round in 3..=(2 + BW_FILTER_ROUNDS + 1) {
            filter.update(round, 50);
        }
        assert_eq!(filter.get(), 50);
    }

    #[test]
    fn rate_units() {
        assert_eq!(
            bytes_per_second(1000, Duration::from_millis(100)),
            Some(10_000)
        );
        assert_eq!(bytes_per_second(1000, Duration::ZERO), None);
    }

    #[test]
    fn round_clock_ticks_on_ack_past_round_end() {
        let mut rounds = RoundClock::default();
        rounds.on_sent(5);
        assert!(rounds.on_ack_batch(Some(3), true));
        assert_eq!(rounds.count, 1);
        // Acks within the same round don't tick
        assert!(!rounds.on_ack_batch(Some(4), true));
        // Nor do batches confirming nothing new, whatever they ack
        rounds.on_sent(9);
        assert!(!rounds.on_ack_batch(Some(7), false));
        assert!(rounds.on_ack_batch(Some(7), true));
        assert_eq!(rounds.count, 2);
    }
}
