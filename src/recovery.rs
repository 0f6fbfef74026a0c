//! RTT estimation, ACK processing, loss detection and probe timeouts.

use std::{cmp, time::Duration, time::Instant};

use tracing::trace;

use crate::{
    congestion::{Acked, Controller, Lost},
    frame,
    packet::SpaceId,
    spaces::{PacketSpace, Retransmits, SentPacket},
    TIMER_GRANULARITY,
};

/// Discard in-flight state and stop sending when the history grows past this
/// many tracked packets; a well-behaved peer never gets close
const MAX_TRACKED_PACKETS: u64 = 4096 * 1024;

/// Maximum reordering in packet numbers before one is considered lost
const PACKET_THRESHOLD: u64 = 3;

/// RTT estimation for a network path
#[derive(Copy, Clone, Debug)]
pub struct RttEstimator {
    /// The most recent RTT measurement made when receiving an ack for a
    /// previously unacked packet
    latest: Duration,
    /// The smoothed RTT of the connection, computed as described in RFC6298
    smoothed: Option<Duration>,
    /// The RTT variance, computed as described in RFC6298
    var: Duration,
    /// The minimum RTT seen in the connection, ignoring ack delay
    min: Duration,
}

impl RttEstimator {
    pub(crate) fn new(initial_rtt: Duration) -> Self {
        Self {
            latest: initial_rtt,
            smoothed: None,
            var: initial_rtt / 2,
            min: initial_rtt,
        }
    }

    /// The current best RTT estimation
    pub fn get(&self) -> Duration {
        self.smoothed.unwrap_or(self.latest)
    }

    /// Conservative estimate of RTT
    ///
    /// Takes the maximum of smoothed and latest RTT, as recommended in 6.1.2
    /// of the recovery spec (draft 29).
    pub fn conservative(&self) -> Duration {
        self.get().max(self.latest)
    }

    /// Minimum RTT registered so far for this estimator
    pub fn min(&self) -> Duration {
        self.min
    }

    /// PTO computed as described in RFC9002#6.2.1
    pub(crate) fn pto_base(&self) -> Duration {
        self.get() + cmp::max(4 * self.var, TIMER_GRANULARITY)
    }

    pub(crate) fn update(&mut self, ack_delay: Duration, rtt: Duration) {
        self.latest = rtt;
        // min_rtt ignores ack delay.
        self.min = cmp::min(self.min, self.latest);
        // Based on RFC6298.
        if let Some(smoothed) = self.smoothed {
            let adjusted_rtt = if self.min + ack_delay <= self.latest {
                self.latest - ack_delay
            } else {
                self.latest
            };
            let var_sample = if smoothed > adjusted_rtt {
                smoothed - adjusted_rtt
            } else {
                adjusted_rtt - smoothed
            };
            self.var = (3 * self.var + var_sample) / 4;
            self.smoothed = Some((7 * smoothed + adjusted_rtt) / 8);
        } else {
            self.smoothed = Some(self.latest);
            self.var = self.latest / 2;
            self.min = self.latest;
        }
    }
}

/// What to do next, as constrained by loss recovery and congestion control
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub(crate) enum SendMode {
    /// Nothing may be sent; the sent-packet history is out of bounds
    None,
    /// Only probe packets should be sent
    Pto,
    /// Congestion control forbids new data; ACKs may still flow
    AckOnly,
    /// Anything goes
    Any,
}

/// Stream-layer consequences of an ACK or a loss-detection event
///
/// The session applies these after the handler returns: acked metadata frees
/// send-buffer space, lost metadata re-queues the same byte ranges, and
/// `requeue` restores control-frame state.
#[derive(Default)]
pub(crate) struct AckEffects {
    pub(crate) acked_streams: Vec<frame::StreamMeta>,
    pub(crate) lost_streams: Vec<frame::StreamMeta>,
    pub(crate) requeue: Retransmits,
}

impl AckEffects {
    pub(crate) fn is_empty(&self) -> bool {
        self.acked_streams.is_empty() && self.lost_streams.is_empty() && self.requeue.is_empty()
    }
}

/// Tracks sent packets across all packet-number spaces and decides what was
/// delivered, what was lost, and when to probe
pub(crate) struct SentPacketHandler {
    spaces: [PacketSpace; 3],
    rtt: RttEstimator,
    congestion: Box<dyn Controller>,
    /// Sum of the sizes of all in-flight ack-eliciting packets
    bytes_in_flight: u64,
    bytes_sent: u64,
    bytes_received: u64,
    pto_count: u32,
    /// Loss-detection alarm; earliest of the per-space loss times and the PTO
    alarm: Option<Instant>,
    max_ack_delay: Duration,
}

impl SentPacketHandler {
    pub(crate) fn new(
        now: Instant,
        initial_rtt: Duration,
        max_ack_delay: Duration,
        congestion: Box<dyn Controller>,
    ) -> Self {
        Self {
            spaces: [
                PacketSpace::new(now),
                PacketSpace::new(now),
                PacketSpace::new(now),
            ],
            rtt: RttEstimator::new(initial_rtt),
            congestion,
            bytes_in_flight: 0,
            bytes_sent: 0,
            bytes_received: 0,
            pto_count: 0,
            alarm: None,
            max_ack_delay,
        }
    }

    pub(crate) fn space(&self, id: SpaceId) -> &PacketSpace {
        &self.spaces[id as usize]
    }

    pub(crate) fn space_mut(&mut self, id: SpaceId) -> &mut PacketSpace {
        &mut self.spaces[id as usize]
    }

    pub(crate) fn rtt(&self) -> &RttEstimator {
        &self.rtt
    }

    pub(crate) fn congestion(&self) -> &dyn Controller {
        &*self.congestion
    }

    pub(crate) fn bytes_in_flight(&self) -> u64 {
        self.bytes_in_flight
    }

    pub(crate) fn bytes_sent(&self) -> u64 {
        self.bytes_sent
    }

    pub(crate) fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub(crate) fn pto_count(&self) -> u32 {
        self.pto_count
    }

    pub(crate) fn on_datagram_received(&mut self, len: u64) {
        self.bytes_received += len;
    }

    /// Account for a freshly transmitted packet
    pub(crate) fn on_packet_sent(
        &mut self,
        space_id: SpaceId,
        pn: u64,
        packet: SentPacket,
        now: Instant,
    ) {
        self.bytes_sent += u64::from(packet.size);
        let ack_eliciting = packet.ack_eliciting;
        let size = u64::from(packet.size);
        if ack_eliciting {
            self.spaces[space_id as usize].time_of_last_ack_eliciting_packet = Some(now);
            self.bytes_in_flight += size;
        }
        self.congestion.on_packet_sent(
            now,
            self.bytes_in_flight,
            pn,
            size,
            ack_eliciting,
        );
        self.spaces[space_id as usize].sent(pn, packet);
        if ack_eliciting {
            self.set_loss_detection_timer(now);
        }
    }

    /// Process a received ACK frame
    ///
    /// Returns the stream-layer effects; the caller owns applying them.
    pub(crate) fn on_ack_received(
        &mut self,
        space_id: SpaceId,
        ack: &frame::Ack,
        now: Instant,
    ) -> Result<AckEffects, crate::TransportError> {
        let space = &mut self.spaces[space_id as usize];
        if space.largest_sent().map_or(true, |l| ack.largest > l) {
            return Err(crate::TransportError::PROTOCOL_VIOLATION(
                "ACK for packet never sent",
            ));
        }
        space.largest_acked_packet = Some(
            space
                .largest_acked_packet
                .map_or(ack.largest, |old| old.max(ack.largest)),
        );

        // Collect newly acked packets, walking the ranges largest-first
        let mut newly_acked = Vec::new();
        for range in ack.iter() {
            let pns = space
                .sent_packets
                .range(range)
                .map(|(&pn, _)| pn)
                .collect::<Vec<_>>();
            for pn in pns {
                let packet = space.sent_packets.remove(&pn).unwrap();
                newly_acked.push((pn, packet));
            }
        }
        if newly_acked.is_empty() {
            return Ok(AckEffects::default());
        }
        newly_acked.sort_by_key(|&(pn, _)| pn);

        // Take an RTT sample from the largest acked packet, if it is newly
        // acked and was ack-eliciting
        if let Some((pn, packet)) = newly_acked.last() {
            if *pn == ack.largest && packet.ack_eliciting {
                let ack_delay = cmp::min(Duration::from_micros(ack.delay), self.max_ack_delay);
                self.rtt
                    .update(ack_delay, now.saturating_duration_since(packet.time_sent));
                self.congestion.maybe_exit_slow_start();
            }
        }

        let prior_in_flight = self.bytes_in_flight;
        let mut effects = AckEffects::default();
        let mut acked = Vec::with_capacity(newly_acked.len());
        let mut bytes_acked = 0;
        for (pn, mut packet) in newly_acked {
            let counted = packet.ack_eliciting;
            let size = u64::from(packet.size);
            if counted {
                self.bytes_in_flight -= size;
                self.spaces[space_id as usize].in_flight -= size;
                bytes_acked += size;
            }
            // The peer has seen our ACK ranges from this packet; stop
            // re-declaring them
            self.spaces[space_id as usize]
                .pending_acks
                .subtract(&packet.acks);
            effects
                .acked_streams
                .extend(packet.stream_frames.drain(..));
            acked.push(Acked {
                pn,
                bytes: if counted { size } else { 0 },
                time_sent: packet.time_sent,
            });
        }

        let lost = self.detect_lost_packets(space_id, now, &mut effects);

        self.congestion.on_cong_event(
            now,
            prior_in_flight,
            self.bytes_in_flight,
            &acked,
            &lost,
            bytes_acked,
            &self.rtt,
        );

        self.pto_count = 0;
        self.spaces[space_id as usize].loss_probes = 0;
        self.set_loss_detection_timer(now);
        Ok(effects)
    }

    /// Declare lost any packet sent long enough ago or reordered past the
    /// packet threshold; returns what congestion control should hear about
    fn detect_lost_packets(
        &mut self,
        space_id: SpaceId,
        now: Instant,
        effects: &mut AckEffects,
    ) -> Vec<Lost> {
        let space = &mut self.spaces[space_id as usize];
        space.loss_time = None;
        let largest_acked = match space.largest_acked_packet {
            Some(x) => x,
            None => return Vec::new(),
        };

        let loss_delay = cmp::max(
            cmp::max(self.rtt.latest, self.rtt.get()).mul_f64(9.0 / 8.0),
            TIMER_GRANULARITY,
        );
        let lost_send_time = now.checked_sub(loss_delay);

        let mut lost_pns = Vec::new();
        for (&pn, packet) in space.sent_packets.range(..=largest_acked) {
            let timed_out = lost_send_time.map_or(false, |cutoff| packet.time_sent <= cutoff);
            if timed_out || pn + PACKET_THRESHOLD <= largest_acked {
                lost_pns.push(pn);
            } else {
                // Not yet lost by time; note when it would be
                let when = packet.time_sent + loss_delay;
                space.loss_time = Some(space.loss_time.map_or(when, |t| t.min(when)));
            }
        }

        let mut lost = Vec::with_capacity(lost_pns.len());
        for pn in lost_pns {
            let mut packet = space.sent_packets.remove(&pn).unwrap();
            trace!(pn, "packet lost");
            let size = u64::from(packet.size);
            if packet.ack_eliciting {
                self.bytes_in_flight -= size;
                space.in_flight -= size;
            }
            effects.requeue |= packet.retransmits.take();
            effects.lost_streams.extend(packet.stream_frames.drain(..));
            lost.push(Lost {
                pn,
                bytes: if packet.ack_eliciting { size } else { 0 },
                time_sent: packet.time_sent,
            });
        }
        lost
    }

    /// Handle expiry of the loss-detection alarm
    ///
    /// Either declares time-threshold losses, or escalates to a probe
    /// timeout: two probe packets are scheduled and the backoff doubles.
    pub(crate) fn on_loss_detection_timeout(&mut self, now: Instant) -> AckEffects {
        let mut effects = AckEffects::default();
        if let Some((space_id, loss_time)) = self.earliest_loss_time() {
            if loss_time > now {
                // Spurious wake; the alarm stands
                return effects;
            }
            let prior_in_flight = self.bytes_in_flight;
            let lost = self.detect_lost_packets(space_id, now, &mut effects);
            if !lost.is_empty() {
                self.congestion.on_cong_event(
                    now,
                    prior_in_flight,
                    self.bytes_in_flight,
                    &[],
                    &lost,
                    0,
                    &self.rtt,
                );
            }
            self.set_loss_detection_timer(now);
            return effects;
        }

        if let Some(space_id) = self.pto_space() {
            self.pto_count += 1;
            self.spaces[space_id as usize].loss_probes =
                self.spaces[space_id as usize].loss_probes.saturating_add(2);
            trace!(pto_count = self.pto_count, ?space_id, "PTO fired");
            self.set_loss_detection_timer(now);
        }
        effects
    }

    /// Queue data for a tail loss probe packet in `space_id`
    ///
    /// Probes retransmit the oldest in-flight data rather than waiting for it
    /// to be declared lost; if nothing is in flight a bare PING forces an ACK.
    pub(crate) fn queue_probe(&mut self, space_id: SpaceId, effects: &mut AckEffects) {
        let space = &mut self.spaces[space_id as usize];
        if space.loss_probes == 0 {
            return;
        }
        space.loss_probes -= 1;

        for packet in space.sent_packets.values_mut() {
            if !packet.retransmits.is_empty() || !packet.stream_frames.is_empty() {
                // Remove retransmitted data from the old packet so we don't
                // end up retransmitting it *again* even if the copy we're
                // sending now gets acknowledged.
                effects.requeue |= packet.retransmits.take();
                effects.lost_streams.extend(packet.stream_frames.drain(..));
                return;
            }
        }

        // Nothing to retransmit; make something up
        space.ping_pending = true;
    }

    fn earliest_loss_time(&self) -> Option<(SpaceId, Instant)> {
        SpaceId::iter()
            .filter_map(|id| self.spaces[id as usize].loss_time.map(|t| (id, t)))
            .min_by_key(|&(_, t)| t)
    }

    /// The space a PTO probe should target: the one with the oldest
    /// outstanding ack-eliciting packet
    fn pto_space(&self) -> Option<SpaceId> {
        SpaceId::iter()
            .filter(|&id| self.spaces[id as usize].has_in_flight())
            .min_by_key(|&id| self.spaces[id as usize].time_of_last_ack_eliciting_packet)
    }

    fn set_loss_detection_timer(&mut self, _now: Instant) {
        if let Some((_, loss_time)) = self.earliest_loss_time() {
            self.alarm = Some(loss_time);
            return;
        }
        let space_id = match self.pto_space() {
            Some(id) => id,
            None => {
                self.alarm = None;
                return;
            }
        };
        let space = &self.spaces[space_id as usize];
        let pto = (self.rtt.pto_base() + self.max_ack_delay) * 2u32.pow(self.pto_count);
        let base = space
            .time_of_last_ack_eliciting_packet
            .expect("in-flight space must have sent ack-eliciting data");
        self.alarm = Some(base + pto);
    }

    pub(crate) fn loss_detection_timeout(&self) -> Option<Instant> {
        self.alarm
    }

    /// How the session may use the wire right now
    pub(crate) fn send_mode(&self) -> SendMode {
        let tracked: u64 = self
            .spaces
            .iter()
            .map(|s| s.sent_packets.len() as u64)
            .sum();
        if tracked > MAX_TRACKED_PACKETS {
            return SendMode::None;
        }
        if self.spaces.iter().any(|s| s.loss_probes > 0) {
            return SendMode::Pto;
        }
        if !self.congestion.can_send(self.bytes_in_flight) {
            return SendMode::AckOnly;
        }
        SendMode::Any
    }

    pub(crate) fn has_pacing_budget(&mut self, now: Instant) -> bool {
        self.congestion.has_pacing_budget(now)
    }

    pub(crate) fn time_until_send(&self) -> Option<Instant> {
        self.congestion.time_until_send()
    }

    pub(crate) fn set_max_datagram_size(&mut self, bytes: u64) {
        self.congestion.set_max_datagram_size(bytes);
    }

    /// Abandon every in-flight packet, e.g. on connection teardown
    pub(crate) fn abandon_all(&mut self) {
        for space in &mut self.spaces {
            space.sent_packets.clear();
            space.loss_time = None;
            space.loss_probes = 0;
            space.in_flight = 0;
        }
        self.bytes_in_flight = 0;
        self.alarm = None;
    }

    #[cfg(test)]
    fn in_flight_matches_history(&self) -> bool {
        let sum: u64 = self
            .spaces
            .iter()
            .flat_map(|s| s.sent_packets.values())
            .filter(|p| p.ack_eliciting)
            .map(|p| u64::from(p.size))
            .sum();
        sum == self.bytes_in_flight
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::congestion::{ControllerFactory, CubicConfig};
    use crate::range_set::RangeSet;
    use bytes::Bytes;
    use std::sync::Arc;

    const MAX_ACK_DELAY: Duration = Duration::from_millis(25);
    const INITIAL_RTT: Duration = Duration::from_millis(100);

    fn handler(now: Instant) -> SentPacketHandler {
        let congestion = Arc::new(CubicConfig::default()).build(now, 1200);
        SentPacketHandler::new(now, INITIAL_RTT, MAX_ACK_DELAY, congestion)
    }

    fn stream_meta(offset: u64, len: u64) -> frame::StreamMeta {
        frame::StreamMeta {
            id: crate::StreamId(0),
            offsets: offset..offset + len,
            fin: false,
        }
    }

    fn send(h: &mut SentPacketHandler, pn: u64, size: u16, now: Instant) {
        let space = h.space_mut(SpaceId::Data);
        let got = space.get_tx_number();
        assert_eq!(got, pn);
        let mut packet = SentPacket::new(now, size, true);
        packet.stream_frames.push(stream_meta(pn * 100, 2));
        h.on_packet_sent(SpaceId::Data, pn, packet, now);
    }

    fn ack_frame(largest: u64, delay: u64, pns: &[u64]) -> frame::Ack {
        let mut ranges = RangeSet::new();
        for &pn in pns {
            ranges.insert_one(pn);
        }
        let mut buf = Vec::new();
        // Reuse the wire codec to produce `additional` exactly as a peer would
        frame::Ack::encode(delay, &ranges, None, &mut buf);
        match frame::Iter::new(Bytes::from(buf)).unwrap().next() {
            Some(Ok(frame::Frame::Ack(ack))) => {
                assert_eq!(ack.largest, largest);
                ack
            }
            _ => unreachable!(),
        }
    }

    #[test]
    fn ack_removes_from_flight() {
        let now = Instant::now();
        let mut h = handler(now);
        send(&mut h, 0, 1000, now);
        send(&mut h, 1, 1000, now);
        assert_eq!(h.bytes_in_flight(), 2000);
        assert!(h.in_flight_matches_history());

        let later = now + Duration::from_millis(50);
        let effects = h
            .on_ack_received(SpaceId::Data, &ack_frame(1, 0, &[0, 1]), later)
            .unwrap();
        assert_eq!(h.bytes_in_flight(), 0);
        assert!(h.in_flight_matches_history());
        assert_eq!(effects.acked_streams.len(), 2);
        assert!(effects.lost_streams.is_empty());
        // RTT sample taken from the largest acked packet
        assert_eq!(h.rtt().get(), Duration::from_millis(50));
    }

    #[test]
    fn ack_for_unsent_rejected() {
        let now = Instant::now();
        let mut h = handler(now);
        send(&mut h, 0, 1000, now);
        assert!(h
            .on_ack_received(SpaceId::Data, &ack_frame(5, 0, &[5]), now)
            .is_err());
    }

    #[test]
    fn single_packet_loss_by_time_threshold() {
        // Packets 1, 2, 3 sent; peer acks {3} and {1}; packet 2 survives the
        // packet threshold but is declared lost when the reordering timer
        // expires, and its stream frames are re-queued at the same offsets.
        let now = Instant::now();
        let mut h = handler(now);
        for pn in 0..4u64 {
            send(&mut h, pn, 500, now);
        }
        let later = now + Duration::from_millis(100);
        let effects = h
            .on_ack_received(SpaceId::Data, &ack_frame(3, 1000, &[0, 1, 3]), later)
            .unwrap();
        assert!(effects.lost_streams.is_empty());
        assert_eq!(h.bytes_in_flight(), 500);
        assert!(h.in_flight_matches_history());
        // The time-threshold alarm is armed for packet 2
        let alarm = h.loss_detection_timeout().unwrap();
        assert!(alarm > later);

        let effects = h.on_loss_detection_timeout(alarm);
        assert_eq!(effects.lost_streams.len(), 1);
        assert_eq!(effects.lost_streams[0].offsets, 200..202);
        assert_eq!(h.bytes_in_flight(), 0);
        assert!(h.in_flight_matches_history());
    }

    #[test]
    fn loss_by_packet_threshold() {
        let now = Instant::now();
        let mut h = handler(now);
        for pn in 0..5u64 {
            send(&mut h, pn, 500, now);
        }
        let later = now + Duration::from_millis(10);
        // Ack only packet 4: packets 0 and 1 trail by >= 3
        let effects = h
            .on_ack_received(SpaceId::Data, &ack_frame(4, 0, &[4]), later)
            .unwrap();
        let lost_offsets: Vec<_> = effects.lost_streams.iter().map(|m| m.offsets.start).collect();
        assert_eq!(lost_offsets, vec![0, 100]);
        assert!(h.in_flight_matches_history());
    }

    #[test]
    fn pto_schedules_probes() {
        // A single unacked packet: at PTO the timer fires, no loss time is
        // set, two probes are scheduled and probe data comes from the
        // unacked packet's frames.
        let now = Instant::now();
        let mut h = handler(now);
        send(&mut h, 0, 500, now);
        assert_eq!(h.pto_count(), 0);

        let alarm = h.loss_detection_timeout().unwrap();
        assert_eq!(alarm, now + (h.rtt().pto_base() + MAX_ACK_DELAY));

        let effects = h.on_loss_detection_timeout(alarm);
        assert!(effects.is_empty());
        assert_eq!(h.pto_count(), 1);
        assert_eq!(h.space(SpaceId::Data).loss_probes, 2);
        assert_eq!(h.send_mode(), SendMode::Pto);

        // The first probe carries the unacked packet's stream data
        let mut effects = AckEffects::default();
        h.queue_probe(SpaceId::Data, &mut effects);
        assert_eq!(effects.lost_streams.len(), 1);
        assert_eq!(effects.lost_streams[0].offsets, 0..2);
        // The second finds nothing left and falls back to a PING
        let mut effects = AckEffects::default();
        h.queue_probe(SpaceId::Data, &mut effects);
        assert!(effects.lost_streams.is_empty());
        assert!(h.space(SpaceId::Data).ping_pending);
        assert_eq!(h.space(SpaceId::Data).loss_probes, 0);

        // The packet is still in flight, and the next PTO doubles
        assert!(h.bytes_in_flight() > 0);
        let next_alarm = h.loss_detection_timeout().unwrap();
        assert_eq!(
            next_alarm,
            now + (h.rtt().pto_base() + MAX_ACK_DELAY) * 2
        );
    }

    #[test]
    fn ack_resets_pto_backoff() {
        let now = Instant::now();
        let mut h = handler(now);
        send(&mut h, 0, 500, now);
        let alarm = h.loss_detection_timeout().unwrap();
        h.on_loss_detection_timeout(alarm);
        assert_eq!(h.pto_count(), 1);

        let effects = h
            .on_ack_received(SpaceId::Data, &ack_frame(0, 0, &[0]), alarm)
            .unwrap();
        assert_eq!(effects.acked_streams.len(), 1);
        assert_eq!(h.pto_count(), 0);
        assert_eq!(h.send_mode(), SendMode::Any);
        assert_eq!(h.loss_detection_timeout(), None);
    }

    #[test]
    fn duplicate_ack_is_noop() {
        let now = Instant::now();
        let mut h = handler(now);
        send(&mut h, 0, 500, now);
        h.on_ack_received(SpaceId::Data, &ack_frame(0, 0, &[0]), now)
            .unwrap();
        let effects = h
            .on_ack_received(SpaceId::Data, &ack_frame(0, 0, &[0]), now)
            .unwrap();
        assert!(effects.is_empty());
        assert!(h.in_flight_matches_history());
    }

    #[test]
    fn congestion_blocks_new_data() {
        let now = Instant::now();
        let mut h = handler(now);
        let window = h.congestion().window();
        let mut pn = 0;
        while h.bytes_in_flight() + 1200 <= window {
            send(&mut h, pn, 1200, now);
            pn += 1;
        }
        assert_eq!(h.send_mode(), SendMode::AckOnly);
    }
}
