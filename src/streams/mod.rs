//! Stream multiplexing: application-facing handles and the per-session
//! stream directory.

use std::{
    collections::VecDeque,
    sync::{Arc, Mutex, Weak},
    time::{Duration, Instant},
};

use rustc_hash::FxHashMap;
use tokio::sync::Notify;
use tracing::debug;

use crate::{
    frame,
    transport_error::Error as TransportError,
    Dir, Side, StreamId, VarInt,
};

mod recv;
mod send;

pub use recv::ReadError;
pub use send::WriteError;

use recv::{ReadOutcome, Recv};
use send::Send;
pub(crate) use send::PopResult;

/// The narrow capability a stream uses to reach its session
///
/// Held weakly so a dropped session breaks the session ↔ stream cycle; a
/// stream whose session is gone simply stops waking anyone.
pub(crate) trait StreamSender: std::marker::Send + Sync {
    /// The stream has data or a FIN ready; put it in the send rotation
    fn on_has_stream_data(&self, id: StreamId);
    /// Both halves of the stream reached a terminal state
    fn on_stream_completed(&self, id: StreamId);
    /// Queue connection-level control state for transmission
    fn queue_control_frame(&self, frame: ControlFrame);
}

/// Control state a stream can ask its session to transmit or account
pub(crate) enum ControlFrame {
    ResetStream(frame::ResetStream),
    StopSending(frame::StopSending),
    /// Re-advertise this stream's receive window (MAX_STREAM_DATA)
    MaxStreamData(StreamId),
    /// The application consumed n bytes; feeds the connection-level window
    /// and possibly a MAX_DATA update
    DataRead(u64),
}

/// One bidirectional stream: an ordered, reliable byte stream in each
/// direction, multiplexed onto the connection
///
/// Handles are cheap to clone and share state. Dropping every handle does not
/// cancel the stream; buffered data is still delivered and retransmitted.
#[derive(Clone)]
pub struct Stream {
    shared: Arc<StreamShared>,
}

impl Stream {
    pub(crate) fn new(shared: Arc<StreamShared>) -> Self {
        Self { shared }
    }

    /// The stream's identifier
    pub fn id(&self) -> StreamId {
        self.shared.id
    }

    /// Read reassembled bytes into `buf`, waiting until at least one byte (or
    /// a terminal condition) is available
    ///
    /// Bytes are delivered in strict stream order. Returns
    /// [`ReadError::Finished`] once every byte up to the stream's final
    /// offset has been read.
    pub async fn read(&self, buf: &mut [u8]) -> Result<usize, ReadError> {
        if buf.is_empty() {
            return Ok(0);
        }
        loop {
            let outcome = {
                let mut recv = self.shared.recv.lock().unwrap();
                recv.read(buf)
            };
            match outcome {
                ReadOutcome::Read(n) => {
                    self.shared.after_read(n as u64);
                    return Ok(n);
                }
                ReadOutcome::Err(e) => return Err(e),
                ReadOutcome::Blocked => self.shared.read_notify.notified().await,
            }
        }
    }

    /// [`Stream::read`] with a deadline
    pub async fn read_timeout(
        &self,
        buf: &mut [u8],
        deadline: Duration,
    ) -> Result<usize, ReadError> {
        tokio::time::timeout(deadline, self.read(buf))
            .await
            .unwrap_or(Err(ReadError::TimedOut))
    }

    /// Write bytes to the stream, waiting for buffer space as needed
    ///
    /// Yields the number of bytes written, which may be less than
    /// `data.len()` if the stream's write buffer fills; [`Stream::write_all`]
    /// loops until everything is accepted.
    pub async fn write(&self, data: &[u8]) -> Result<usize, WriteError> {
        if data.is_empty() {
            return Ok(0);
        }
        loop {
            let n = {
                let mut send = self.shared.send.lock().unwrap();
                send.write(data)?
            };
            if n > 0 {
                self.shared.wake_session();
                return Ok(n);
            }
            self.shared.write_notify.notified().await;
        }
    }

    /// Write an entire buffer to the stream
    pub async fn write_all(&self, mut data: &[u8]) -> Result<(), WriteError> {
        while !data.is_empty() {
            let n = self.write(data).await?;
            data = &data[n..];
        }
        Ok(())
    }

    /// [`Stream::write_all`] with a deadline covering the whole buffer
    pub async fn write_all_timeout(
        &self,
        data: &[u8],
        deadline: Duration,
    ) -> Result<(), WriteError> {
        tokio::time::timeout(deadline, self.write_all(data))
            .await
            .unwrap_or(Err(WriteError::TimedOut))
    }

    /// Finish the sending half; the next packet from this stream carries a FIN
    ///
    /// Buffered data is still delivered and retransmitted until acknowledged.
    pub fn close(&self) -> Result<(), WriteError> {
        {
            let mut send = self.shared.send.lock().unwrap();
            send.finish()?;
        }
        self.shared.wake_session();
        Ok(())
    }

    /// Abandon the sending half, discarding buffered and in-flight data
    ///
    /// The peer is told via RESET_STREAM with `error_code`.
    pub fn cancel_write(&self, error_code: VarInt) {
        let final_offset = {
            let mut send = self.shared.send.lock().unwrap();
            send.reset()
        };
        if let Some(final_offset) = final_offset {
            self.shared
                .queue_control(ControlFrame::ResetStream(frame::ResetStream {
                    id: self.shared.id,
                    error_code,
                    final_offset: VarInt::from_u64(final_offset).unwrap(),
                }));
        }
        self.shared.write_notify.notify_one();
        self.shared.maybe_completed();
    }

    /// Abandon the receiving half, discarding buffered data
    ///
    /// The peer is told via STOP_SENDING with `error_code`; flow-control
    /// credit for undelivered bytes is released.
    pub fn cancel_read(&self, error_code: VarInt) {
        let released = {
            let mut recv = self.shared.recv.lock().unwrap();
            recv.stop(error_code)
        };
        if released.is_some() {
            self.shared
                .queue_control(ControlFrame::StopSending(frame::StopSending {
                    id: self.shared.id,
                    error_code,
                }));
            if let Some(credit) = released.filter(|&n| n > 0) {
                self.shared.queue_control(ControlFrame::DataRead(credit));
            }
        }
        self.shared.read_notify.notify_one();
        self.shared.maybe_completed();
    }

    /// Tear the stream down locally without telling the peer anything
    ///
    /// Every blocked read and write wakes once and returns `Shutdown`.
    pub fn close_for_shutdown(&self) {
        self.shared.shutdown();
    }
}

impl std::fmt::Debug for Stream {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").field("id", &self.shared.id).finish()
    }
}

/// State shared between application handles and the session
pub(crate) struct StreamShared {
    id: StreamId,
    send: Mutex<Send>,
    recv: Mutex<Recv>,
    read_notify: Notify,
    write_notify: Notify,
    sender: Weak<dyn StreamSender>,
}

impl StreamShared {
    fn new(
        id: StreamId,
        sender: Weak<dyn StreamSender>,
        send_window: u64,
        recv_window: u64,
        buffer_limit: u64,
        now: Instant,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            send: Mutex::new(Send::new(send_window, buffer_limit)),
            recv: Mutex::new(Recv::new(recv_window, now)),
            read_notify: Notify::new(),
            write_notify: Notify::new(),
            sender,
        })
    }

    pub(crate) fn id(&self) -> StreamId {
        self.id
    }

    fn wake_session(&self) {
        if let Some(sender) = self.sender.upgrade() {
            sender.on_has_stream_data(self.id);
        }
    }

    fn queue_control(&self, frame: ControlFrame) {
        if let Some(sender) = self.sender.upgrade() {
            sender.queue_control_frame(frame);
        }
    }

    /// Flow-control follow-up once the application consumed `n` bytes
    fn after_read(&self, n: u64) {
        self.queue_control(ControlFrame::DataRead(n));
        let update = {
            let mut recv = self.recv.lock().unwrap();
            recv.flow.get_window_update(Instant::now())
        };
        if update.is_some() {
            self.queue_control(ControlFrame::MaxStreamData(self.id));
        }
        self.maybe_completed();
    }

    /// The absolute receive window to advertise right now
    pub(crate) fn max_stream_data_to_announce(&self) -> u64 {
        self.recv.lock().unwrap().flow.announce()
    }

    // Inbound frame handling, called by the session with the session lock held

    pub(crate) fn handle_stream_frame(
        &self,
        frame: frame::Stream,
        payload_len: usize,
    ) -> Result<u64, TransportError> {
        let credit = {
            let mut recv = self.recv.lock().unwrap();
            let credit = recv.ingest(frame, payload_len)?;
            if recv.is_readable() {
                self.read_notify.notify_one();
            }
            credit
        };
        Ok(credit)
    }

    pub(crate) fn handle_rst_stream_frame(
        &self,
        frame: &frame::ResetStream,
    ) -> Result<Option<u64>, TransportError> {
        let credit = {
            let mut recv = self.recv.lock().unwrap();
            recv.reset(frame.error_code, frame.final_offset)?
        };
        self.read_notify.notify_one();
        Ok(credit)
    }

    /// STOP_SENDING: abandon transmission and answer with RESET_STREAM
    pub(crate) fn handle_stop_sending(&self, error_code: VarInt) -> Option<frame::ResetStream> {
        let reset = {
            let mut send = self.send.lock().unwrap();
            if !send.try_stop(error_code) {
                return None;
            }
            send.reset().map(|final_offset| frame::ResetStream {
                id: self.id,
                error_code,
                final_offset: VarInt::from_u64(final_offset).unwrap(),
            })
        };
        self.write_notify.notify_one();
        reset
    }

    /// Returns whether the stream now has sendable data
    pub(crate) fn handle_max_stream_data(&self, offset: u64) -> bool {
        let mut send = self.send.lock().unwrap();
        let unblocked = send.increase_max_data(offset);
        let pending = send.is_pending();
        drop(send);
        if unblocked {
            self.write_notify.notify_one();
        }
        unblocked && pending
    }

    pub(crate) fn pop_frame(&self, max_len: usize, conn_budget: &mut u64) -> PopResult {
        let mut result = self.send.lock().unwrap().pop_frame(max_len, conn_budget);
        if let Some(frame) = &mut result.frame {
            frame.meta.id = self.id;
        }
        result
    }

    /// Apply the acknowledgement of one STREAM frame
    ///
    /// Returns whether the whole stream just reached its terminal state.
    /// Runs in session context; the caller removes completed streams itself.
    pub(crate) fn ack_meta(&self, meta: frame::StreamMeta) -> bool {
        {
            let mut send = self.send.lock().unwrap();
            send.ack(meta);
            if send.can_buffer() {
                self.write_notify.notify_one();
            }
        }
        self.send_done() && self.recv_done()
    }

    /// Re-queue a lost STREAM frame's range; returns whether the stream has
    /// data to send again
    pub(crate) fn lost_meta(&self, meta: frame::StreamMeta) -> bool {
        let mut send = self.send.lock().unwrap();
        send.on_lost(meta);
        send.is_pending()
    }

    pub(crate) fn shutdown(&self) {
        {
            let mut send = self.send.lock().unwrap();
            send.shutdown = true;
        }
        {
            let mut recv = self.recv.lock().unwrap();
            recv.shutdown = true;
        }
        self.read_notify.notify_one();
        self.write_notify.notify_one();
    }

    fn send_done(&self) -> bool {
        use send::SendState::*;
        let send = self.send.lock().unwrap();
        match send.state {
            DataSent { finish_acked } => finish_acked && send.pending.is_fully_acked(),
            ResetSent => true,
            Ready => false,
        }
    }

    fn recv_done(&self) -> bool {
        let recv = self.recv.lock().unwrap();
        recv.is_closed() || recv.stop_reason().is_some()
    }

    /// Notify the session when both halves reached a terminal state
    fn maybe_completed(&self) {
        if self.send_done() && self.recv_done() {
            if let Some(sender) = self.sender.upgrade() {
                sender.on_stream_completed(self.id);
            }
        }
    }
}

/// Outcome of attempting to open a locally-initiated stream
pub(crate) enum OpenResult {
    Opened(Arc<StreamShared>),
    /// The peer's stream limit is exhausted; carries the limit to announce in
    /// STREAMS_BLOCKED if it has not been reported yet
    Blocked(Option<u64>),
}

/// Directory of every live stream on a session
///
/// Allocates outgoing stream ids, materialises incoming streams (including
/// any gap streams below the highest id seen), and enforces stream-count
/// limits in both directions.
pub(crate) struct StreamsState {
    side: Side,
    sender: Weak<dyn StreamSender>,
    streams: FxHashMap<StreamId, Arc<StreamShared>>,
    /// Index of the next locally-initiated bidi stream
    next_outgoing: u64,
    /// Peer-granted count limit for locally-initiated bidi streams
    max_outgoing: u64,
    /// Limit last announced in STREAMS_BLOCKED, to emit it once per threshold
    streams_blocked_at: Option<u64>,
    /// Index one past the highest peer-initiated stream materialised
    next_incoming: u64,
    /// Count limit we granted the peer
    max_incoming: u64,
    accept_queue: VecDeque<Arc<StreamShared>>,
    stream_receive_window: u64,
    /// Assumed peer stream window; symmetric configuration stands in for
    /// transport parameters
    initial_send_window: u64,
    send_buffer_size: u64,
}

impl StreamsState {
    pub(crate) fn new(
        side: Side,
        sender: Weak<dyn StreamSender>,
        max_concurrent_bidi: u64,
        stream_receive_window: u64,
        send_buffer_size: u64,
    ) -> Self {
        Self {
            side,
            sender,
            streams: FxHashMap::default(),
            next_outgoing: 0,
            max_outgoing: max_concurrent_bidi,
            streams_blocked_at: None,
            next_incoming: 0,
            max_incoming: max_concurrent_bidi,
            accept_queue: VecDeque::new(),
            stream_receive_window,
            initial_send_window: stream_receive_window,
            send_buffer_size,
        }
    }

    fn insert(&mut self, id: StreamId, now: Instant) -> Arc<StreamShared> {
        let stream = StreamShared::new(
            id,
            self.sender.clone(),
            self.initial_send_window,
            self.stream_receive_window,
            self.send_buffer_size,
            now,
        );
        self.streams.insert(id, stream.clone());
        stream
    }

    /// Open the next locally-initiated bidirectional stream
    pub(crate) fn open(&mut self, now: Instant) -> OpenResult {
        if self.next_outgoing >= self.max_outgoing {
            let announce = if self.streams_blocked_at != Some(self.max_outgoing) {
                self.streams_blocked_at = Some(self.max_outgoing);
                Some(self.max_outgoing)
            } else {
                None
            };
            return OpenResult::Blocked(announce);
        }
        let id = StreamId::new(self.side, Dir::Bi, self.next_outgoing);
        self.next_outgoing += 1;
        OpenResult::Opened(self.insert(id, now))
    }

    pub(crate) fn get(&self, id: StreamId) -> Option<Arc<StreamShared>> {
        self.streams.get(&id).cloned()
    }

    /// Resolve the stream an inbound frame refers to, materialising
    /// peer-initiated streams as needed
    ///
    /// `Ok(None)` means the frame refers to a stream that already finished
    /// and should be ignored.
    pub(crate) fn incoming(
        &mut self,
        id: StreamId,
        now: Instant,
    ) -> Result<Option<Arc<StreamShared>>, TransportError> {
        if id.dir() == Dir::Uni {
            // Wire support exists, but nothing here opens them
            debug!(%id, "dropping frame for unidirectional stream");
            return Ok(None);
        }
        if id.initiator() == self.side {
            // Our own stream; it must have been opened at some point
            if id.index() >= self.next_outgoing {
                return Err(TransportError::STREAM_STATE_ERROR(
                    "frame for a stream we never opened",
                ));
            }
            return Ok(self.get(id));
        }
        if id.index() < self.next_incoming {
            return Ok(self.get(id));
        }
        if id.index() >= self.max_incoming {
            return Err(TransportError::STREAM_LIMIT_ERROR(
                "peer exceeded stream limit",
            ));
        }
        // Materialise every stream up to and including this id, so ids are
        // accepted in order even when first contact is out of order
        let mut opened = None;
        for index in self.next_incoming..=id.index() {
            let gap_id = StreamId::new(!self.side, Dir::Bi, index);
            let stream = self.insert(gap_id, now);
            self.accept_queue.push_back(stream.clone());
            opened = Some(stream);
        }
        self.next_incoming = id.index() + 1;
        Ok(opened)
    }

    /// Take the lowest-numbered stream waiting to be accepted
    ///
    /// The returned flag is whether accepting it granted the peer fresh
    /// MAX_STREAMS credit that should be transmitted.
    pub(crate) fn accept(&mut self) -> Option<(Arc<StreamShared>, bool)> {
        let stream = self.accept_queue.pop_front()?;
        self.max_incoming += 1;
        Some((stream, true))
    }

    pub(crate) fn has_incoming(&self) -> bool {
        !self.accept_queue.is_empty()
    }

    /// Raise the peer's grant of our stream allowance
    ///
    /// Returns whether an open had been blocked on the old limit.
    pub(crate) fn on_max_streams(&mut self, dir: Dir, count: u64) -> bool {
        if dir != Dir::Bi {
            return false;
        }
        let was_blocked = self.next_outgoing >= self.max_outgoing;
        if count > self.max_outgoing {
            self.max_outgoing = count;
            return was_blocked;
        }
        false
    }

    /// The MAX_STREAMS value to advertise for `dir`
    pub(crate) fn max_streams_value(&self, dir: Dir) -> u64 {
        match dir {
            Dir::Bi => self.max_incoming,
            Dir::Uni => 0,
        }
    }

    pub(crate) fn remove(&mut self, id: StreamId) {
        self.streams.remove(&id);
    }

    /// Wake every blocked reader and writer with `Shutdown` and drop all
    /// stream state
    pub(crate) fn shutdown_all(&mut self) {
        for stream in self.streams.values() {
            stream.shutdown();
        }
        self.streams.clear();
        self.accept_queue.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSender;
    impl StreamSender for NullSender {
        fn on_has_stream_data(&self, _: StreamId) {}
        fn on_stream_completed(&self, _: StreamId) {}
        fn queue_control_frame(&self, _: ControlFrame) {}
    }

    fn state(side: Side) -> (StreamsState, Arc<NullSender>) {
        let sender = Arc::new(NullSender);
        let weak = Arc::downgrade(&sender) as Weak<dyn StreamSender>;
        (StreamsState::new(side, weak, 4, 1 << 20, 1252), sender)
    }

    #[test]
    fn outgoing_ids_respect_role_bits() {
        let now = Instant::now();
        let (mut client, _keep) = state(Side::Client);
        let first = match client.open(now) {
            OpenResult::Opened(s) => s.id(),
            _ => panic!("open failed"),
        };
        assert_eq!(first, StreamId(0));
        let second = match client.open(now) {
            OpenResult::Opened(s) => s.id(),
            _ => panic!("open failed"),
        };
        assert_eq!(second, StreamId(4));

        let (mut server, _keep) = state(Side::Server);
        let first = match server.open(now) {
            OpenResult::Opened(s) => s.id(),
            _ => panic!("open failed"),
        };
        assert_eq!(first, StreamId(1));
    }

    #[test]
    fn open_blocks_at_limit_and_reports_once() {
        let now = Instant::now();
        let (mut s, _keep) = state(Side::Client);
        for _ in 0..4 {
            assert!(matches!(s.open(now), OpenResult::Opened(_)));
        }
        match s.open(now) {
            OpenResult::Blocked(announce) => assert_eq!(announce, Some(4)),
            _ => panic!("expected blocked"),
        }
        match s.open(now) {
            OpenResult::Blocked(announce) => assert_eq!(announce, None),
            _ => panic!("expected blocked"),
        }
        // MAX_STREAMS unblocks
        assert!(s.on_max_streams(Dir::Bi, 8));
        assert!(matches!(s.open(now), OpenResult::Opened(_)));
    }

    #[test]
    fn incoming_materialises_gaps() {
        let now = Instant::now();
        let (mut server, _keep) = state(Side::Server);
        // First contact is stream index 2; indexes 0 and 1 materialise too
        let id = StreamId::new(Side::Client, Dir::Bi, 2);
        let stream = server.incoming(id, now).unwrap().unwrap();
        assert_eq!(stream.id(), id);
        let mut accepted = Vec::new();
        while let Some((s, _)) = server.accept() {
            accepted.push(s.id().index());
        }
        assert_eq!(accepted, vec![0, 1, 2]);
        // Accepting granted credit
        assert_eq!(server.max_streams_value(Dir::Bi), 7);
    }

    #[test]
    fn incoming_limit_enforced() {
        let now = Instant::now();
        let (mut server, _keep) = state(Side::Server);
        let id = StreamId::new(Side::Client, Dir::Bi, 4);
        assert!(server.incoming(id, now).is_err());
    }

    #[test]
    fn frame_for_unopened_local_stream_rejected() {
        let now = Instant::now();
        let (mut client, _keep) = state(Side::Client);
        let id = StreamId::new(Side::Client, Dir::Bi, 0);
        assert!(client.incoming(id, now).is_err());
    }
}
