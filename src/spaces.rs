use std::{collections::BTreeMap, mem, time::Duration, time::Instant};

use rustc_hash::FxHashSet;

use crate::{frame, range_set::RangeSet, StreamId};

/// Per-packet-number-space session state
///
/// One instance exists per encryption level; the Data space is the
/// operational one, the Initial space carries connection announcement and its
/// acknowledgements, and the Handshake space is structural only.
pub(crate) struct PacketSpace {
    /// Highest received packet number, used to expand truncated numbers
    pub(crate) rx_packet: u64,
    /// Packet numbers to acknowledge and when to do so
    pub(crate) pending_acks: PendingAcks,

    /// The packet number of the next packet that will be sent, if any
    next_packet_number: u64,
    /// The largest packet number the remote peer acknowledged in an ACK frame
    pub(crate) largest_acked_packet: Option<u64>,
    /// Transmitted but not acked
    // A BTreeMap so ACK processing and loss detection can query by range
    pub(crate) sent_packets: BTreeMap<u64, SentPacket>,

    /// The time the most recently sent ack-eliciting packet was sent
    pub(crate) time_of_last_ack_eliciting_packet: Option<Instant>,
    /// The time at which the earliest sent packet in this space will be
    /// considered lost based on exceeding the reordering window in time
    pub(crate) loss_time: Option<Instant>,
    /// Number of tail loss probes to send
    pub(crate) loss_probes: u32,
    pub(crate) ping_pending: bool,
    /// Bytes in flight counted against congestion control from this space
    pub(crate) in_flight: u64,
}

impl PacketSpace {
    pub(crate) fn new(now: Instant) -> Self {
        Self {
            rx_packet: 0,
            pending_acks: PendingAcks::new(now),
            next_packet_number: 0,
            largest_acked_packet: None,
            sent_packets: BTreeMap::new(),
            time_of_last_ack_eliciting_packet: None,
            loss_time: None,
            loss_probes: 0,
            ping_pending: false,
            in_flight: 0,
        }
    }

    /// Allocate the next outgoing packet number; strictly increasing, never
    /// reused
    pub(crate) fn get_tx_number(&mut self) -> u64 {
        // TODO: Handle packet number overflow gracefully
        assert!(self.next_packet_number < 2u64.pow(62));
        let x = self.next_packet_number;
        self.next_packet_number += 1;
        x
    }

    pub(crate) fn largest_sent(&self) -> Option<u64> {
        self.next_packet_number.checked_sub(1)
    }

    pub(crate) fn sent(&mut self, number: u64, packet: SentPacket) {
        if packet.ack_eliciting {
            self.in_flight += u64::from(packet.size);
        }
        self.sent_packets.insert(number, packet);
    }

    pub(crate) fn has_in_flight(&self) -> bool {
        self.in_flight != 0
    }
}

/// Ensures we can always fit all our ACKs in a single minimum-MTU packet with
/// room to spare, and bounds the memory a gappy peer can pin
const MAX_ACK_RANGES: usize = 64;

/// Received-packet history and ACK scheduling for one packet-number space
///
/// Tracks which packet numbers have been seen as a merged interval set,
/// detects duplicates and filled gaps, and decides when an ACK frame is
/// worth sending: immediately for the first ack-eliciting packet, after the
/// configured ack-eliciting threshold, on evidence of reordering, or when the
/// delayed-ACK alarm fires.
pub(crate) struct PendingAcks {
    /// Non-overlapping, non-adjacent received ranges, oldest discarded beyond
    /// `MAX_ACK_RANGES`
    ranges: RangeSet,
    /// Packets below this are treated as duplicates on arrival
    deleted_below: u64,
    largest_observed: u64,
    largest_observed_received_time: Instant,
    /// Ack-eliciting packets received since the last ACK frame was produced
    ack_eliciting_since_last_ack: u32,
    /// Delayed-ACK alarm, armed by the first unacknowledged ack-eliciting
    /// packet that did not trigger an immediate ACK
    alarm: Option<Instant>,
    /// An ACK frame should be produced at the next opportunity
    queued: bool,
    /// Whether any new packet arrived since the last ACK frame
    dirty: bool,
    /// Largest acknowledged and ranges of the last ACK frame produced
    last_ack: Option<(u64, RangeSet)>,
}

impl PendingAcks {
    fn new(now: Instant) -> Self {
        Self {
            ranges: RangeSet::new(),
            deleted_below: 0,
            largest_observed: 0,
            largest_observed_received_time: now,
            ack_eliciting_since_last_ack: 0,
            alarm: None,
            queued: false,
            dirty: false,
            last_ack: None,
        }
    }

    /// Record a received packet
    ///
    /// Returns whether the packet number was new; duplicates must not be
    /// processed further.
    pub(crate) fn received_packet(
        &mut self,
        pn: u64,
        now: Instant,
        ack_eliciting: bool,
        threshold: u32,
        max_ack_delay: Duration,
    ) -> bool {
        if pn < self.deleted_below {
            return false;
        }
        let was_missing = self.is_missing(pn);
        if !self.ranges.insert_one(pn) {
            return false;
        }
        if self.ranges.len() > MAX_ACK_RANGES {
            let dropped = self.ranges.pop_min().unwrap();
            self.deleted_below = self.deleted_below.max(dropped.end);
        }
        if pn >= self.largest_observed {
            self.largest_observed = pn;
            self.largest_observed_received_time = now;
        }
        self.dirty = true;
        if ack_eliciting {
            self.maybe_queue_ack(now, was_missing, threshold, max_ack_delay);
        }
        true
    }

    /// Whether `pn` lies in a gap below the largest observed packet
    fn is_missing(&self, pn: u64) -> bool {
        pn < self.largest_observed && !self.ranges.contains(pn)
    }

    fn maybe_queue_ack(
        &mut self,
        now: Instant,
        was_missing: bool,
        threshold: u32,
        max_ack_delay: Duration,
    ) {
        self.ack_eliciting_since_last_ack += 1;
        if self.last_ack.is_none() {
            // Queue the very first ACK immediately to seed the peer's RTT
            self.queued = true;
        } else if was_missing {
            // The packet filled a gap; tell the peer promptly
            self.queued = true;
        } else if self.ack_eliciting_since_last_ack >= threshold {
            self.queued = true;
        } else if self.has_new_missing_packets() {
            self.queued = true;
        } else if self.alarm.is_none() {
            self.alarm = Some(now + max_ack_delay);
        }
    }

    /// A new missing-packet pattern: the highest range is a lone packet past
    /// the largest previously acknowledged
    fn has_new_missing_packets(&self) -> bool {
        let (last_largest, _) = match &self.last_ack {
            Some(x) => x,
            None => return false,
        };
        match self.ranges.iter().next_back() {
            Some(highest) => {
                highest.end - highest.start == 1 && highest.start > last_largest + 1
            }
            None => false,
        }
    }

    /// Produce the contents of an ACK frame if one is due
    ///
    /// With `only_if_queued` the frame is withheld unless an immediate ACK was
    /// queued or the delayed-ACK alarm expired; packets that carry other
    /// frames anyway pass `false` to piggyback whatever new information
    /// exists.
    pub(crate) fn get_ack(&mut self, now: Instant, only_if_queued: bool) -> Option<AckContents> {
        if !self.dirty || self.ranges.is_empty() {
            return None;
        }
        if only_if_queued && !self.queued && !self.alarm.map_or(false, |t| t <= now) {
            return None;
        }
        let delay = now.saturating_duration_since(self.largest_observed_received_time);
        self.last_ack = Some((self.largest_observed, self.ranges.clone()));
        self.queued = false;
        self.alarm = None;
        self.ack_eliciting_since_last_ack = 0;
        self.dirty = false;
        Some(AckContents {
            ranges: self.ranges.clone(),
            delay,
        })
    }

    pub(crate) fn alarm(&self) -> Option<Instant> {
        self.alarm
    }

    /// Forget ranges the peer has confirmed receiving, keeping future ACK
    /// frames small
    pub(crate) fn subtract(&mut self, acks: &RangeSet) {
        self.ranges.subtract(acks);
        if self.ranges.is_empty() {
            self.dirty = false;
            self.queued = false;
            self.alarm = None;
        }
    }

    /// Drop history below `pn`, truncating a straddling range
    pub(crate) fn delete_below(&mut self, pn: u64) {
        self.ranges.remove_below(pn);
        self.deleted_below = self.deleted_below.max(pn);
    }

    #[cfg(test)]
    pub(crate) fn ranges(&self) -> &RangeSet {
        &self.ranges
    }
}

/// What an ACK frame will carry
pub(crate) struct AckContents {
    pub(crate) ranges: RangeSet,
    pub(crate) delay: Duration,
}

/// Record of a sent, possibly ack-eliciting packet
#[derive(Debug, Clone)]
pub(crate) struct SentPacket {
    /// The time the packet was sent
    pub(crate) time_sent: Instant,
    /// The number of bytes sent in the packet, not including UDP or IP
    /// overhead, but including QUIC framing overhead
    pub(crate) size: u16,
    /// Whether an acknowledgement is expected directly in response to this
    /// packet; only such packets count toward bytes in flight
    pub(crate) ack_eliciting: bool,
    /// Ranges the ACK frame in this packet (if any) acknowledged
    pub(crate) acks: RangeSet,
    /// Control data to retransmit if the packet is lost; cleared on loss
    pub(crate) retransmits: Retransmits,
    /// Metadata for stream frames in the packet; the data itself stays with
    /// the stream send buffers
    pub(crate) stream_frames: frame::StreamMetaVec,
}

impl SentPacket {
    pub(crate) fn new(time_sent: Instant, size: u16, ack_eliciting: bool) -> Self {
        Self {
            time_sent,
            size,
            ack_eliciting,
            acks: RangeSet::new(),
            retransmits: Retransmits::default(),
            stream_frames: frame::StreamMetaVec::new(),
        }
    }
}

/// Retransmittable control state queued for transmission
///
/// Flags and sets rather than a frame list: losing two packets that both
/// carried MAX_DATA must yield one fresh MAX_DATA, not two stale ones.
#[derive(Debug, Default, Clone)]
pub(crate) struct Retransmits {
    pub(crate) max_data: bool,
    pub(crate) max_stream_id: [bool; 2],
    pub(crate) max_stream_data: FxHashSet<StreamId>,
    pub(crate) reset_stream: Vec<frame::ResetStream>,
    pub(crate) stop_sending: Vec<frame::StopSending>,
    pub(crate) handshake_done: bool,
    pub(crate) ping: bool,
}

impl Retransmits {
    pub(crate) fn is_empty(&self) -> bool {
        !self.max_data
            && !self.max_stream_id.iter().any(|&x| x)
            && self.max_stream_data.is_empty()
            && self.reset_stream.is_empty()
            && self.stop_sending.is_empty()
            && !self.handshake_done
            && !self.ping
    }

    pub(crate) fn take(&mut self) -> Self {
        mem::take(self)
    }
}

impl ::std::ops::BitOrAssign for Retransmits {
    fn bitor_assign(&mut self, rhs: Self) {
        self.max_data |= rhs.max_data;
        for dir in 0..2 {
            self.max_stream_id[dir] |= rhs.max_stream_id[dir];
        }
        self.max_stream_data.extend(&rhs.max_stream_data);
        self.reset_stream.extend_from_slice(&rhs.reset_stream);
        self.stop_sending.extend_from_slice(&rhs.stop_sending);
        self.handshake_done |= rhs.handshake_done;
        self.ping |= rhs.ping;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const THRESHOLD: u32 = 2;
    const MAX_ACK_DELAY: Duration = Duration::from_millis(25);

    fn recv(acks: &mut PendingAcks, pn: u64, now: Instant) -> bool {
        acks.received_packet(pn, now, true, THRESHOLD, MAX_ACK_DELAY)
    }

    #[test]
    fn first_packet_queues_immediately() {
        let now = Instant::now();
        let mut acks = PendingAcks::new(now);
        assert!(recv(&mut acks, 0, now));
        // No ACK has ever been produced, so one is queued at once
        assert!(acks.get_ack(now, true).is_some());
        // And nothing further until new information arrives
        assert!(acks.get_ack(now, true).is_none());
        assert!(acks.get_ack(now, false).is_none());
    }

    #[test]
    fn threshold_queues() {
        let now = Instant::now();
        let mut acks = PendingAcks::new(now);
        recv(&mut acks, 0, now);
        acks.get_ack(now, true).unwrap();

        recv(&mut acks, 1, now);
        // One eliciting packet: delayed, alarm armed
        assert!(acks.get_ack(now, true).is_none());
        assert_eq!(acks.alarm(), Some(now + MAX_ACK_DELAY));
        recv(&mut acks, 2, now);
        // Second eliciting packet hits the threshold
        let ack = acks.get_ack(now, true).unwrap();
        assert_eq!(ack.ranges.max(), Some(2));
    }

    #[test]
    fn alarm_expiry_releases_ack() {
        let now = Instant::now();
        let mut acks = PendingAcks::new(now);
        recv(&mut acks, 0, now);
        acks.get_ack(now, true).unwrap();

        recv(&mut acks, 1, now);
        assert!(acks.get_ack(now, true).is_none());
        let later = now + MAX_ACK_DELAY;
        assert!(acks.get_ack(later, true).is_some());
    }

    #[test]
    fn gap_fill_queues_immediately() {
        let now = Instant::now();
        let mut acks = PendingAcks::new(now);
        recv(&mut acks, 0, now);
        acks.get_ack(now, true).unwrap();
        recv(&mut acks, 2, now);
        acks.get_ack(now, false).unwrap();
        // Packet 1 fills the gap below largest observed
        recv(&mut acks, 1, now);
        assert!(acks.get_ack(now, true).is_some());
    }

    #[test]
    fn new_missing_pattern_queues() {
        let now = Instant::now();
        let mut acks = PendingAcks::new(now);
        recv(&mut acks, 0, now);
        acks.get_ack(now, true).unwrap();
        // Jump past an unseen packet: highest range is a lone pn beyond
        // last_ack.largest + 1
        recv(&mut acks, 2, now);
        assert!(acks.get_ack(now, true).is_some());
    }

    #[test]
    fn duplicates_detected() {
        let now = Instant::now();
        let mut acks = PendingAcks::new(now);
        assert!(recv(&mut acks, 5, now));
        assert!(!recv(&mut acks, 5, now));
        acks.delete_below(6);
        assert!(!recv(&mut acks, 3, now));
    }

    #[test]
    fn range_cap() {
        let now = Instant::now();
        let mut acks = PendingAcks::new(now);
        // Only even packet numbers: every insert is a fresh range
        for pn in 0..=(2 * MAX_ACK_RANGES as u64 + 2) {
            if pn % 2 == 0 {
                recv(&mut acks, pn, now);
            }
        }
        assert!(acks.ranges().len() <= MAX_ACK_RANGES);
        // The oldest range was discarded, and packets below it now count as
        // duplicates
        assert!(!recv(&mut acks, 0, now));
    }

    #[test]
    fn subtract_clears() {
        let now = Instant::now();
        let mut acks = PendingAcks::new(now);
        recv(&mut acks, 0, now);
        recv(&mut acks, 1, now);
        let ack = acks.get_ack(now, false).unwrap();
        acks.subtract(&ack.ranges);
        assert!(acks.ranges().is_empty());
    }

    #[test]
    fn tx_numbers_strictly_increase() {
        let mut space = PacketSpace::new(Instant::now());
        let a = space.get_tx_number();
        let b = space.get_tx_number();
        let c = space.get_tx_number();
        assert!(a < b && b < c);
        assert_eq!(space.largest_sent(), Some(c));
    }
}
