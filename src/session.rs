//! Sessions: one QUIC connection, its run loop, and packet assembly.

use std::{
    collections::VecDeque,
    mem,
    net::SocketAddr,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Mutex, Weak,
    },
    time::{Duration, Instant},
};

use bytes::{Bytes, BytesMut};
use rustc_hash::FxHashSet;
use thiserror::Error;
use tokio::sync::Notify;
use tracing::{debug, debug_span, trace, warn, Instrument};

use crate::{
    config::TransportConfig,
    flow::{ConnRecvWindow, SendWindow},
    frame::{self, ApplicationClose, Close, ConnectionClose, Frame, FrameStruct},
    packet::{Header, PacketNumber, PartialDecode, SpaceId},
    recovery::{AckEffects, SendMode, SentPacketHandler},
    shared::ConnectionId,
    spaces::SentPacket,
    streams::{ControlFrame, Stream, StreamSender, StreamsState},
    transport_error::Error as TransportError,
    Dir, Side, StreamId, VarInt, MIN_INITIAL_SIZE,
};

/// Idle tick of the session loop; bounds how stale any timer can be observed
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_millis(30);

/// Per-iteration bound on packets composed before yielding to inbound
/// processing
const MAX_PACKETS_PER_WAKE: u32 = 4;

/// A QUIC connection
///
/// Cheap to clone; all clones refer to the same connection. The connection
/// dies when [`Session::close`] is called, the peer closes, or its endpoint
/// is dropped.
#[derive(Clone)]
pub struct Session {
    shared: Arc<SessionShared>,
}

impl Session {
    pub(crate) fn new(shared: Arc<SessionShared>) -> Self {
        Self { shared }
    }

    /// The connection id datagrams are routed by
    pub fn connection_id(&self) -> ConnectionId {
        self.shared.cid
    }

    /// The peer's UDP address
    pub fn remote_addr(&self) -> SocketAddr {
        self.shared.remote
    }

    /// Whether the connection is neither closed nor closing
    pub fn is_alive(&self) -> bool {
        self.shared.alive.load(Ordering::Acquire)
    }

    /// Open a new locally-initiated bidirectional stream
    ///
    /// Waits while the peer's stream limit is exhausted; a STREAMS_BLOCKED
    /// frame announces the stall, and a MAX_STREAMS grant releases it.
    pub async fn open_stream(&self) -> Result<Stream, ConnectionError> {
        loop {
            let notified = self.shared.open_notify.notified();
            if let Some(err) = self.shared.error() {
                return Err(err);
            }
            {
                let mut state = self.shared.state.lock().unwrap();
                match state.streams.open(Instant::now()) {
                    crate::streams::OpenResult::Opened(stream) => {
                        drop(state);
                        return Ok(Stream::new(stream));
                    }
                    crate::streams::OpenResult::Blocked(announce) => {
                        if let Some(limit) = announce {
                            state.fifo.push_back(OneShot::StreamsBlocked {
                                dir: Dir::Bi,
                                limit,
                            });
                            drop(state);
                            self.shared.notify.notify_one();
                        }
                    }
                }
            }
            notified.await;
        }
    }

    /// Accept the next peer-initiated stream
    ///
    /// Waits until the peer opens one; fails once the connection is closed.
    pub async fn accept_stream(&self) -> Result<Stream, ConnectionError> {
        loop {
            let notified = self.shared.accept_notify.notified();
            {
                let mut state = self.shared.state.lock().unwrap();
                if let Some((stream, granted)) = state.streams.accept() {
                    if granted {
                        state.pending.max_stream_id[Dir::Bi as usize] = true;
                    }
                    drop(state);
                    self.shared.notify.notify_one();
                    return Ok(Stream::new(stream));
                }
            }
            if let Some(err) = self.shared.error() {
                return Err(err);
            }
            notified.await;
        }
    }

    /// Close the connection, telling the peer why
    ///
    /// Blocked reads and writes wake with `Shutdown`; one CONNECTION_CLOSE
    /// is transmitted on a best-effort basis.
    pub fn close(&self, error_code: VarInt, reason: &[u8]) {
        self.shared.initiate_close(
            Close::Application(ApplicationClose {
                error_code,
                reason: Bytes::copy_from_slice(reason),
            }),
            ConnectionError::LocallyClosed,
        );
    }

    /// Counters for diagnostics
    pub fn stats(&self) -> SessionStats {
        let state = self.shared.state.lock().unwrap();
        SessionStats {
            bytes_sent: state.recovery.bytes_sent(),
            bytes_received: state.recovery.bytes_received(),
            bytes_in_flight: state.recovery.bytes_in_flight(),
            rtt: state.recovery.rtt().get(),
            pto_count: state.recovery.pto_count(),
            congestion_window: state.recovery.congestion().window(),
        }
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("cid", &self.shared.cid)
            .field("remote", &self.shared.remote)
            .finish()
    }
}

/// Transport-level statistics for one session
#[derive(Debug, Clone)]
pub struct SessionStats {
    pub bytes_sent: u64,
    pub bytes_received: u64,
    pub bytes_in_flight: u64,
    pub rtt: Duration,
    pub pto_count: u32,
    pub congestion_window: u64,
}

/// Why a connection ended
#[derive(Debug, Error, Clone)]
pub enum ConnectionError {
    /// The peer violated the protocol and we closed on it
    #[error("transport error: {0}")]
    TransportError(#[from] TransportError),
    /// The peer closed with a transport-level error
    #[error("closed by peer: {0}")]
    ConnectionClosed(ConnectionClose),
    /// The peer closed at the application's request
    #[error("closed by peer application: {0}")]
    ApplicationClosed(ApplicationClose),
    /// The connection was closed locally
    #[error("closed locally")]
    LocallyClosed,
    /// The underlying socket failed
    #[error("I/O error")]
    IoError,
}

/// One-shot control frames, transmitted once and never retransmitted
#[derive(Debug)]
enum OneShot {
    DataBlocked { offset: u64 },
    StreamDataBlocked { id: StreamId, offset: u64 },
    StreamsBlocked { dir: Dir, limit: u64 },
    PathResponse(u64),
}

/// Mutable connection state, guarded by one lock and mutated to completion
/// between suspension points
pub(crate) struct State {
    /// Datagrams delivered by the endpoint driver, drained by the run loop
    inbound: VecDeque<BytesMut>,
    pub(crate) recovery: SentPacketHandler,
    pub(crate) streams: StreamsState,
    /// Connection-level send window (peer's advertised MAX_DATA)
    conn_send: SendWindow,
    /// Connection-level receive window we advertise
    conn_recv: ConnRecvWindow,
    /// Retransmittable control state awaiting transmission
    pub(crate) pending: crate::spaces::Retransmits,
    /// One-shot control frames, FIFO
    fifo: VecDeque<OneShot>,
    /// Streams with data to send: insertion-ordered id queue, deduplicated
    active_set: FxHashSet<StreamId>,
    active_queue: VecDeque<StreamId>,
    /// Set when the pacer refused a send; the run loop wakes then
    pacing_deadline: Option<Instant>,
    /// CONNECTION_CLOSE waiting to be transmitted
    close: Option<Close>,
    /// Terminal error, set exactly once
    error: Option<ConnectionError>,
}

pub(crate) struct SessionShared {
    side: Side,
    cid: ConnectionId,
    remote: SocketAddr,
    socket: Arc<tokio::net::UdpSocket>,
    config: Arc<TransportConfig>,
    pub(crate) state: Mutex<State>,
    /// Combined session event: datagram arrival, write demand, timers
    notify: Notify,
    accept_notify: Notify,
    open_notify: Notify,
    established_notify: Notify,
    alive: AtomicBool,
    /// Client: the server has answered; connect() may return
    established: AtomicBool,
}

impl SessionShared {
    pub(crate) fn new(
        side: Side,
        cid: ConnectionId,
        remote: SocketAddr,
        socket: Arc<tokio::net::UdpSocket>,
        config: Arc<TransportConfig>,
    ) -> Arc<Self> {
        let now = Instant::now();
        Arc::new_cyclic(|weak: &Weak<Self>| {
            let congestion = config
                .congestion_controller_factory
                .clone()
                .build(now, config.max_udp_payload_size);
            let recovery = SentPacketHandler::new(
                now,
                config.initial_rtt,
                config.max_ack_delay,
                congestion,
            );
            let streams = StreamsState::new(
                side,
                weak.clone() as Weak<dyn StreamSender>,
                config.max_concurrent_bidi_streams,
                config.stream_receive_window,
                config.send_buffer_size,
            );
            Self {
                side,
                cid,
                remote,
                socket,
                state: Mutex::new(State {
                    inbound: VecDeque::new(),
                    recovery,
                    streams,
                    conn_send: SendWindow::new(config.receive_window),
                    conn_recv: ConnRecvWindow::new(config.receive_window, now),
                    pending: Default::default(),
                    fifo: VecDeque::new(),
                    active_set: FxHashSet::default(),
                    active_queue: VecDeque::new(),
                    pacing_deadline: None,
                    close: None,
                    error: None,
                }),
                config,
                notify: Notify::new(),
                accept_notify: Notify::new(),
                open_notify: Notify::new(),
                established_notify: Notify::new(),
                alive: AtomicBool::new(true),
                established: AtomicBool::new(false),
            }
        })
    }

    pub(crate) fn cid(&self) -> ConnectionId {
        self.cid
    }

    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    fn error(&self) -> Option<ConnectionError> {
        if self.is_alive() {
            return None;
        }
        let state = self.state.lock().unwrap();
        Some(state.error.clone().unwrap_or(ConnectionError::LocallyClosed))
    }

    /// Hand a freshly received datagram to the session; the read signal
    pub(crate) fn enqueue_datagram(&self, datagram: BytesMut) {
        {
            let mut state = self.state.lock().unwrap();
            state.inbound.push_back(datagram);
        }
        self.notify.notify_one();
    }

    /// Queue the server's HANDSHAKE_DONE announcement
    pub(crate) fn queue_handshake_done(&self) {
        let mut state = self.state.lock().unwrap();
        state.pending.handshake_done = true;
        drop(state);
        self.notify.notify_one();
    }

    /// Queue the client's connection announcement: an Initial-space PING,
    /// padded out on the wire and retransmitted via PTO until answered
    pub(crate) fn queue_connect(&self) {
        let mut state = self.state.lock().unwrap();
        state.recovery.space_mut(SpaceId::Initial).ping_pending = true;
        drop(state);
        self.notify.notify_one();
    }

    /// Wait for the server's first answer
    pub(crate) async fn wait_established(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.established.load(Ordering::Acquire) {
                return true;
            }
            if !self.is_alive() {
                return false;
            }
            let notified = self.established_notify.notified();
            if self.established.load(Ordering::Acquire) {
                return true;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return false;
            }
        }
    }

    fn initiate_close(&self, close: Close, error: ConnectionError) {
        {
            let mut state = self.state.lock().unwrap();
            if state.close.is_some() || state.error.is_some() {
                return;
            }
            state.close = Some(close);
            state.error = Some(error);
        }
        self.notify.notify_one();
    }

    /// The session's cooperative run loop; one task per session
    pub(crate) async fn run(self: Arc<Self>) {
        let span = debug_span!("session", cid = %self.cid, side = ?self.side);
        self.run_inner().instrument(span).await;
    }

    async fn run_inner(self: &Arc<Self>) {
        debug!(remote = %self.remote, "session started");

        while self.is_alive() {
            // Arm a single wake for the earliest of the ACK alarm, the
            // loss-detection timeout, the pacing deadline, and the idle tick
            let deadline = self.next_deadline();
            tokio::select! {
                _ = self.notify.notified() => {}
                _ = tokio::time::sleep_until(deadline.into()) => {}
            }

            // Drain inbound datagrams
            let datagrams = {
                let mut state = self.state.lock().unwrap();
                mem::take(&mut state.inbound)
            };
            for datagram in datagrams {
                self.handle_datagram(datagram);
            }

            // Loss-detection timeout
            let now = Instant::now();
            {
                let mut state = self.state.lock().unwrap();
                if state
                    .recovery
                    .loss_detection_timeout()
                    .map_or(false, |t| t <= now)
                {
                    let effects = state.recovery.on_loss_detection_timeout(now);
                    apply_effects(&mut state, effects);
                }
            }

            self.send_packets().await;
        }

        self.teardown();
        debug!("session finished");
    }

    fn next_deadline(&self) -> Instant {
        let now = Instant::now();
        let mut deadline = now + KEEP_ALIVE_INTERVAL;
        let state = self.state.lock().unwrap();
        for space_id in SpaceId::iter() {
            if let Some(alarm) = state.recovery.space(space_id).pending_acks.alarm() {
                deadline = deadline.min(alarm);
            }
        }
        if let Some(alarm) = state.recovery.loss_detection_timeout() {
            deadline = deadline.min(alarm);
        }
        if let Some(pacing) = state.pacing_deadline {
            deadline = deadline.min(pacing);
        }
        deadline.max(now)
    }

    /// Break every wait and drop per-stream state; idempotent
    fn teardown(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if state.error.is_none() {
                state.error = Some(ConnectionError::LocallyClosed);
            }
            state.streams.shutdown_all();
            state.recovery.abandon_all();
            state.active_set.clear();
            state.active_queue.clear();
            state.fifo.clear();
        }
        self.alive.store(false, Ordering::Release);
        self.accept_notify.notify_waiters();
        self.open_notify.notify_waiters();
        self.established_notify.notify_waiters();
        self.accept_notify.notify_one();
        self.open_notify.notify_one();
        self.established_notify.notify_one();
    }

    /// Parse one datagram, which may hold several coalesced packets
    fn handle_datagram(&self, datagram: BytesMut) {
        let len = datagram.len() as u64;
        {
            let mut state = self.state.lock().unwrap();
            state.recovery.on_datagram_received(len);
        }
        let mut remaining = Some(datagram);
        while let Some(data) = remaining.take() {
            let (partial, rest) = match PartialDecode::new(data, self.cid.len()) {
                Ok(x) => x,
                Err(e) => {
                    debug!(error = %e, "dropping undecodable datagram");
                    return;
                }
            };
            remaining = rest;
            let space_id = match partial.space() {
                Some(x) => x,
                None => {
                    debug!("dropping retry packet");
                    continue;
                }
            };
            let packet = match partial.finish() {
                Ok(x) => x,
                Err(e) => {
                    debug!(error = %e, "dropping malformed packet");
                    continue;
                }
            };
            if !packet.reserved_bits_valid() {
                debug!("dropping packet with invalid reserved bits");
                continue;
            }
            if let Err(e) = self.handle_packet(space_id, packet) {
                debug!(error = %e, "connection-fatal packet");
                self.initiate_close(e.clone().into(), ConnectionError::TransportError(e));
                return;
            }
        }
    }

    /// Decode the packet number, parse every frame, then dispatch
    ///
    /// Wire-level failures drop the packet before any frame takes effect;
    /// semantic failures bubble up and close the connection.
    fn handle_packet(
        &self,
        space_id: SpaceId,
        packet: crate::packet::Packet,
    ) -> Result<(), TransportError> {
        let now = Instant::now();
        let payload_len = packet.payload.len();
        let number = match packet.header.number() {
            Some(x) => x,
            None => return Ok(()),
        };

        // Parse everything first so a corrupt packet is dropped whole
        let mut frames = Vec::new();
        let mut iter = frame::Iter::new(packet.payload.freeze())?;
        for result in &mut iter {
            match result {
                Ok(frame) => frames.push(frame),
                Err(err) => {
                    debug!(reason = err.reason, "dropping packet with malformed frame");
                    return Ok(());
                }
            }
        }
        let ack_eliciting = frame::has_ack_eliciting(&frames);

        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let pn = {
            let space = state.recovery.space_mut(space_id);
            let pn = number.expand(space.rx_packet.wrapping_add(1));
            let is_new = space.pending_acks.received_packet(
                pn,
                now,
                ack_eliciting,
                self.config.ack_eliciting_threshold,
                self.config.max_ack_delay,
            );
            if !is_new {
                trace!(pn, "duplicate packet");
                return Ok(());
            }
            space.rx_packet = space.rx_packet.max(pn);
            pn
        };
        trace!(pn, count = frames.len(), "processing packet");

        if self.side.is_client() && space_id == SpaceId::Data {
            self.mark_established();
        }

        for frame in frames {
            self.dispatch_frame(state, space_id, frame, payload_len, now)?;
        }
        Ok(())
    }

    fn mark_established(&self) {
        if !self.established.swap(true, Ordering::AcqRel) {
            self.established_notify.notify_waiters();
            self.established_notify.notify_one();
        }
    }

    fn dispatch_frame(
        &self,
        state: &mut State,
        space_id: SpaceId,
        frame: Frame,
        payload_len: usize,
        now: Instant,
    ) -> Result<(), TransportError> {
        trace!(ty = %frame.ty(), "handling frame");
        match frame {
            Frame::Padding | Frame::Ping => {}
            Frame::Stream(f) => {
                let stream = match state.streams.incoming(f.id, now)? {
                    Some(x) => x,
                    None => return Ok(()),
                };
                let credit = stream.handle_stream_frame(f, payload_len)?;
                state.conn_recv.on_received(credit)?;
                if state.streams.has_incoming() {
                    self.accept_notify.notify_one();
                }
            }
            Frame::Crypto(f) => {
                // No handshake layer is wired up; the data pipe ends here
                trace!(offset = f.offset, len = f.data.len(), "discarding crypto frame");
            }
            Frame::Ack(ack) => {
                let effects = state.recovery.on_ack_received(space_id, &ack, now)?;
                apply_effects(state, effects);
            }
            Frame::MaxData(limit) => {
                if state.conn_send.increase_max_data(limit.into_inner()) {
                    // Streams stalled on the connection window retry now
                    self.notify.notify_one();
                }
            }
            Frame::MaxStreamData { id, offset } => {
                if let Some(stream) = state.streams.get(id) {
                    if stream.handle_max_stream_data(offset) {
                        mark_active(state, id);
                    }
                }
            }
            Frame::MaxStreams { dir, count } => {
                if state.streams.on_max_streams(dir, count) {
                    self.open_notify.notify_waiters();
                    self.open_notify.notify_one();
                }
            }
            Frame::DataBlocked { offset } => {
                trace!(offset, "peer reports DATA_BLOCKED");
                state.pending.max_data = true;
            }
            Frame::StreamDataBlocked { id, offset } => {
                trace!(%id, offset, "peer reports STREAM_DATA_BLOCKED");
                if state.streams.get(id).is_some() {
                    state.pending.max_stream_data.insert(id);
                }
            }
            Frame::StreamsBlocked { dir, limit } => {
                trace!(%dir, limit, "peer reports STREAMS_BLOCKED");
                state.pending.max_stream_id[dir as usize] = true;
            }
            Frame::StopSending(f) => {
                if let Some(stream) = state.streams.get(f.id) {
                    if let Some(reset) = stream.handle_stop_sending(f.error_code) {
                        state.pending.reset_stream.push(reset);
                    }
                }
            }
            Frame::ResetStream(f) => {
                let stream = match state.streams.incoming(f.id, now)? {
                    Some(x) => x,
                    None => return Ok(()),
                };
                if let Some(credit) = stream.handle_rst_stream_frame(&f)? {
                    state.conn_recv.on_received(credit)?;
                }
                if state.streams.has_incoming() {
                    self.accept_notify.notify_one();
                }
            }
            Frame::PathChallenge(token) => {
                state.fifo.push_back(OneShot::PathResponse(token));
            }
            Frame::PathResponse(token) => {
                trace!(token, "ignoring unsolicited PATH_RESPONSE");
            }
            Frame::NewConnectionId(f) => {
                trace!(sequence = f.sequence, "ignoring NEW_CONNECTION_ID");
            }
            Frame::RetireConnectionId { sequence } => {
                trace!(sequence, "ignoring RETIRE_CONNECTION_ID");
            }
            Frame::NewToken(_) => {
                trace!("ignoring NEW_TOKEN");
            }
            Frame::HandshakeDone => {
                if self.side.is_client() {
                    self.mark_established();
                }
            }
            Frame::Close(close) => {
                debug!("connection closed by peer");
                let error = match close {
                    Close::Connection(c) => ConnectionError::ConnectionClosed(c),
                    Close::Application(c) => ConnectionError::ApplicationClosed(c),
                };
                state.error = Some(error);
                state.close = None;
                self.alive.store(false, Ordering::Release);
            }
        }
        Ok(())
    }

    /// Produce and transmit packets until nothing is sendable, fairness or
    /// pacing says stop, or the iteration bound is hit
    async fn send_packets(self: &Arc<Self>) {
        // A queued CONNECTION_CLOSE preempts everything else
        if let Some(buf) = self.compose_close() {
            if let Err(e) = self.socket.send_to(&buf, self.remote).await {
                warn!(error = %e, "failed to send CONNECTION_CLOSE");
            }
            self.alive.store(false, Ordering::Release);
            return;
        }

        let mut count = 0u32;
        let mut sent_any = false;
        loop {
            let composed = self.compose_next_datagram(sent_any);
            let buf = match composed {
                Some(x) => x,
                None => break,
            };
            if let Err(e) = self.socket.send_to(&buf, self.remote).await {
                warn!(error = %e, "socket send failed");
                self.initiate_close(
                    Close::Connection(TransportError::INTERNAL_ERROR("socket failure").into()),
                    ConnectionError::IoError,
                );
                return;
            }
            sent_any = true;
            count += 1;
            let inbound_waiting = {
                let state = self.state.lock().unwrap();
                !state.inbound.is_empty()
            };
            // Yield to freshly arrived datagrams for fairness
            if inbound_waiting || count >= MAX_PACKETS_PER_WAKE {
                self.notify.notify_one();
                break;
            }
        }
    }

    fn compose_close(&self) -> Option<Vec<u8>> {
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        let close = state.close.take()?;
        let space = state.recovery.space_mut(SpaceId::Data);
        let pn = space.get_tx_number();
        let number = PacketNumber::new(pn, space.largest_acked_packet.unwrap_or(0));
        let header = Header::Short {
            spin: false,
            key_phase: false,
            dst_cid: self.cid,
            number,
        };
        let mut buf = Vec::with_capacity(128);
        let partial = header.encode(&mut buf);
        let remaining = self.config.max_udp_payload_size as usize - buf.len();
        close.encode(&mut buf, remaining);
        partial.finish(&mut buf);
        Some(buf)
    }

    /// Compose the next outgoing datagram, if anything is ready to go
    ///
    /// Priority within a packet: ACK, then retransmittable control state,
    /// then one-shot control frames, then stream data round-robin across the
    /// active streams.
    fn compose_next_datagram(&self, sent_any: bool) -> Option<Vec<u8>> {
        let now = Instant::now();
        let mut state = self.state.lock().unwrap();
        let state = &mut *state;
        if !self.is_alive() || state.close.is_some() || !state.inbound.is_empty() {
            return None;
        }

        let mut mode = state.recovery.send_mode();
        if mode == SendMode::None {
            return None;
        }
        if mode == SendMode::Any && !state.recovery.has_pacing_budget(now) {
            // Defer new data but keep acknowledging
            state.pacing_deadline =
                Some(state.recovery.time_until_send().unwrap_or(now + Duration::from_millis(1)));
            if sent_any {
                return None;
            }
            mode = SendMode::AckOnly;
        } else {
            state.pacing_deadline = None;
        }

        // The Initial space speaks first when it has anything to say
        if let Some(buf) = self.compose_initial(state, mode, now) {
            return Some(buf);
        }
        self.compose_data(state, mode, now)
    }

    /// Initial-space packets carry only connection announcement (PING) and
    /// acknowledgements, padded to the anti-amplification minimum
    fn compose_initial(&self, state: &mut State, mode: SendMode, now: Instant) -> Option<Vec<u8>> {
        if mode == SendMode::Pto {
            let mut effects = AckEffects::default();
            state.recovery.queue_probe(SpaceId::Initial, &mut effects);
            apply_effects(state, effects);
        }
        let space = state.recovery.space_mut(SpaceId::Initial);
        let ping = mem::take(&mut space.ping_pending);
        let ack = space.pending_acks.get_ack(now, !ping);
        if !ping && ack.is_none() {
            return None;
        }

        let mut payload = Vec::with_capacity(MIN_INITIAL_SIZE);
        let mut sent = SentPacket::new(now, 0, ping);
        if let Some(ack) = &ack {
            frame::Ack::encode(ack.delay.as_micros() as u64, &ack.ranges, None, &mut payload);
            sent.acks = ack.ranges.clone();
        }
        if ping {
            payload.push(0x01);
        }

        let pn = space.get_tx_number();
        let number = PacketNumber::new(pn, space.largest_acked_packet.unwrap_or(0));
        let header = Header::Initial {
            dst_cid: self.cid,
            src_cid: self.cid,
            token: Bytes::new(),
            number,
        };
        let mut buf = Vec::with_capacity(MIN_INITIAL_SIZE);
        let partial = header.encode(&mut buf);
        buf.extend_from_slice(&payload);
        // Initial packets are padded to thwart amplification attacks
        if buf.len() < MIN_INITIAL_SIZE {
            buf.resize(MIN_INITIAL_SIZE, 0);
        }
        partial.finish(&mut buf);

        sent.size = buf.len() as u16;
        state.recovery.on_packet_sent(SpaceId::Initial, pn, sent, now);
        trace!(pn, len = buf.len(), "sent initial packet");
        Some(buf)
    }

    fn compose_data(&self, state: &mut State, mode: SendMode, now: Instant) -> Option<Vec<u8>> {
        // Report a newly exhausted connection window before composing
        if let Some(offset) = state.conn_send.take_newly_blocked() {
            state.fifo.push_back(OneShot::DataBlocked { offset });
        }

        if mode == SendMode::Pto {
            let mut effects = AckEffects::default();
            state.recovery.queue_probe(SpaceId::Data, &mut effects);
            apply_effects(state, effects);
        }

        let header_overhead = 1 + self.cid.len() + 4;
        let max_payload = self.config.max_udp_payload_size as usize - header_overhead;
        let mut payload = Vec::with_capacity(max_payload);
        let mut sent = SentPacket::new(now, 0, false);

        let allow_data = mode == SendMode::Any || mode == SendMode::Pto;
        let has_data = allow_data
            && (!state.pending.is_empty()
                || !state.fifo.is_empty()
                || state.recovery.space(SpaceId::Data).ping_pending
                || !state.active_queue.is_empty());

        // Whole-frame priority for acknowledgements
        let space = state.recovery.space_mut(SpaceId::Data);
        if let Some(ack) = space.pending_acks.get_ack(now, !has_data) {
            frame::Ack::encode(ack.delay.as_micros() as u64, &ack.ranges, None, &mut payload);
            sent.acks = ack.ranges;
        }

        if allow_data {
            if mem::take(&mut space.ping_pending) {
                payload.push(0x01);
                sent.ack_eliciting = true;
            }
            self.populate_control(state, &mut payload, &mut sent, max_payload);
            self.populate_stream_frames(state, &mut payload, &mut sent, max_payload);
        }

        if payload.is_empty() {
            return None;
        }

        let space = state.recovery.space_mut(SpaceId::Data);
        let pn = space.get_tx_number();
        let number = PacketNumber::new(pn, space.largest_acked_packet.unwrap_or(0));
        let header = Header::Short {
            spin: false,
            key_phase: false,
            dst_cid: self.cid,
            number,
        };
        let mut buf = Vec::with_capacity(self.config.max_udp_payload_size as usize);
        let partial = header.encode(&mut buf);
        buf.extend_from_slice(&payload);
        partial.finish(&mut buf);

        sent.size = buf.len() as u16;
        trace!(
            pn,
            len = buf.len(),
            eliciting = sent.ack_eliciting,
            "sent packet"
        );
        state.recovery.on_packet_sent(SpaceId::Data, pn, sent, now);
        Some(buf)
    }

    /// Append pending control frames while they fit
    fn populate_control(
        &self,
        state: &mut State,
        payload: &mut Vec<u8>,
        sent: &mut SentPacket,
        max_payload: usize,
    ) {
        use crate::coding::BufMutExt;

        // HANDSHAKE_DONE
        if state.pending.handshake_done && max_payload - payload.len() >= 1 {
            state.pending.handshake_done = false;
            payload.write_var(0x1e);
            sent.retransmits.handshake_done = true;
            sent.ack_eliciting = true;
        }

        // PING
        if mem::take(&mut state.pending.ping) && max_payload - payload.len() >= 1 {
            payload.push(0x01);
            sent.ack_eliciting = true;
        }

        // MAX_DATA
        if state.pending.max_data && max_payload - payload.len() >= 9 {
            state.pending.max_data = false;
            let value = state.conn_recv.announce();
            payload.write_var(0x10);
            payload.write_var(value);
            sent.retransmits.max_data = true;
            sent.ack_eliciting = true;
        }

        // MAX_STREAM_DATA
        let ids = state
            .pending
            .max_stream_data
            .iter()
            .copied()
            .collect::<Vec<_>>();
        for id in ids {
            if max_payload - payload.len() < 17 {
                break;
            }
            state.pending.max_stream_data.remove(&id);
            let stream = match state.streams.get(id) {
                Some(x) => x,
                None => continue,
            };
            let value = stream.max_stream_data_to_announce();
            payload.write_var(0x11);
            payload.write_var(id.0);
            payload.write_var(value);
            sent.retransmits.max_stream_data.insert(id);
            sent.ack_eliciting = true;
        }

        // MAX_STREAMS
        for dir in Dir::iter() {
            if state.pending.max_stream_id[dir as usize] && max_payload - payload.len() >= 9 {
                state.pending.max_stream_id[dir as usize] = false;
                let count = state.streams.max_streams_value(dir);
                payload.write_var(match dir {
                    Dir::Bi => 0x12,
                    Dir::Uni => 0x13,
                });
                payload.write_var(count);
                sent.retransmits.max_stream_id[dir as usize] = true;
                sent.ack_eliciting = true;
            }
        }

        // RESET_STREAM
        while !state.pending.reset_stream.is_empty() {
            if max_payload - payload.len() < frame::ResetStream::SIZE_BOUND {
                break;
            }
            let frame = state.pending.reset_stream.pop().unwrap();
            frame.encode(payload);
            sent.retransmits.reset_stream.push(frame);
            sent.ack_eliciting = true;
        }

        // STOP_SENDING
        while !state.pending.stop_sending.is_empty() {
            if max_payload - payload.len() < frame::StopSending::SIZE_BOUND {
                break;
            }
            let frame = state.pending.stop_sending.pop().unwrap();
            frame.encode(payload);
            sent.retransmits.stop_sending.push(frame);
            sent.ack_eliciting = true;
        }

        // One-shot frames, FIFO; never retransmitted
        while let Some(oneshot) = state.fifo.front() {
            let required = match oneshot {
                OneShot::DataBlocked { .. } => 9,
                OneShot::StreamDataBlocked { .. } => 17,
                OneShot::StreamsBlocked { .. } => 9,
                OneShot::PathResponse(_) => 9,
            };
            if max_payload - payload.len() < required {
                break;
            }
            match state.fifo.pop_front().unwrap() {
                OneShot::DataBlocked { offset } => {
                    payload.write_var(0x14);
                    payload.write_var(offset);
                }
                OneShot::StreamDataBlocked { id, offset } => {
                    payload.write_var(0x15);
                    payload.write_var(id.0);
                    payload.write_var(offset);
                }
                OneShot::StreamsBlocked { dir, limit } => {
                    payload.write_var(match dir {
                        Dir::Bi => 0x16,
                        Dir::Uni => 0x17,
                    });
                    payload.write_var(limit);
                }
                OneShot::PathResponse(token) => {
                    use crate::coding::Codec;
                    payload.write_var(0x1b);
                    token.encode(payload);
                }
            }
            sent.ack_eliciting = true;
        }
    }

    /// Round-robin across active streams, appending STREAM frames
    fn populate_stream_frames(
        &self,
        state: &mut State,
        payload: &mut Vec<u8>,
        sent: &mut SentPacket,
        max_payload: usize,
    ) {
        let initial_budget = state.conn_send.window_size();
        let mut conn_budget = initial_budget;
        let rounds = state.active_queue.len();
        for _ in 0..rounds {
            let id = match state.active_queue.pop_front() {
                Some(x) => x,
                None => break,
            };
            if !state.active_set.contains(&id) {
                continue;
            }
            let stream = match state.streams.get(id) {
                Some(x) => x,
                None => {
                    state.active_set.remove(&id);
                    continue;
                }
            };
            let remaining = max_payload - payload.len();
            let id_size = VarInt::from_u64(id.0).unwrap().size();
            if remaining < 1 + id_size + 16 {
                // Not enough room for a useful frame; retry next packet
                state.active_queue.push_front(id);
                break;
            }
            let result = stream.pop_frame(remaining - 1 - id_size, &mut conn_budget);
            if let Some(offset) = result.blocked {
                state
                    .fifo
                    .push_back(OneShot::StreamDataBlocked { id, offset });
            }
            if let Some(popped) = result.frame {
                popped.meta.encode(popped.encode_length, payload);
                payload.extend_from_slice(&popped.data);
                sent.stream_frames.push(popped.meta);
                sent.ack_eliciting = true;
            }
            if result.has_more {
                state.active_queue.push_back(id);
            } else {
                state.active_set.remove(&id);
            }
        }
        let used = initial_budget - conn_budget;
        if used > 0 {
            state.conn_send.add_bytes_sent(used);
        }
    }
}

/// Put a stream in the send rotation, deduplicated
fn mark_active(state: &mut State, id: StreamId) {
    if state.active_set.insert(id) {
        state.active_queue.push_back(id);
    }
}

/// Apply the stream-layer consequences of an ACK or loss event
fn apply_effects(state: &mut State, effects: AckEffects) {
    for meta in effects.acked_streams {
        let id = meta.id;
        if let Some(stream) = state.streams.get(id) {
            if stream.ack_meta(meta) {
                state.streams.remove(id);
                state.active_set.remove(&id);
            }
        }
    }
    for meta in effects.lost_streams {
        let id = meta.id;
        if let Some(stream) = state.streams.get(id) {
            if stream.lost_meta(meta) {
                mark_active(state, id);
            }
        }
    }
    state.pending |= effects.requeue;
}

impl StreamSender for SessionShared {
    fn on_has_stream_data(&self, id: StreamId) {
        {
            let mut state = self.state.lock().unwrap();
            mark_active(&mut state, id);
        }
        self.notify.notify_one();
    }

    fn on_stream_completed(&self, id: StreamId) {
        let mut state = self.state.lock().unwrap();
        state.streams.remove(id);
        state.active_set.remove(&id);
    }

    fn queue_control_frame(&self, frame: ControlFrame) {
        {
            let mut state = self.state.lock().unwrap();
            match frame {
                ControlFrame::ResetStream(f) => state.pending.reset_stream.push(f),
                ControlFrame::StopSending(f) => state.pending.stop_sending.push(f),
                ControlFrame::MaxStreamData(id) => {
                    state.pending.max_stream_data.insert(id);
                }
                ControlFrame::DataRead(n) => {
                    state.conn_recv.add_bytes_read(n);
                    if state.conn_recv.get_window_update(Instant::now()).is_some() {
                        state.pending.max_data = true;
                    }
                }
            }
        }
        self.notify.notify_one();
    }
}
