use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::congestion::{ControllerFactory, CubicConfig};

/// Parameters governing the core protocol logic of a connection
///
/// Because no transport-parameter exchange takes place, both endpoints assume
/// the peer's initial flow-control limits equal their own configured limits;
/// window-update frames take over from there. Deploy matching configurations
/// on both sides.
#[derive(Clone)]
pub struct TransportConfig {
    pub(crate) ack_eliciting_threshold: u32,
    pub(crate) max_ack_delay: Duration,
    pub(crate) initial_rtt: Duration,
    pub(crate) max_udp_payload_size: u64,
    pub(crate) stream_receive_window: u64,
    pub(crate) receive_window: u64,
    pub(crate) send_buffer_size: u64,
    pub(crate) max_concurrent_bidi_streams: u64,
    pub(crate) handshake_timeout: Duration,
    pub(crate) congestion_controller_factory: Arc<dyn ControllerFactory>,
}

impl TransportConfig {
    /// Number of ack-eliciting packets received before an ACK is sent without
    /// waiting for the delayed-ACK alarm
    pub fn ack_eliciting_threshold(&mut self, value: u32) -> &mut Self {
        self.ack_eliciting_threshold = value.max(1);
        self
    }

    /// Maximum time to hold back an ACK for an ack-eliciting packet
    pub fn max_ack_delay(&mut self, value: Duration) -> &mut Self {
        self.max_ack_delay = value;
        self
    }

    /// RTT assumed before any samples are taken
    pub fn initial_rtt(&mut self, value: Duration) -> &mut Self {
        self.initial_rtt = value;
        self
    }

    /// UDP payload budget per outgoing datagram, QUIC framing included
    pub fn max_udp_payload_size(&mut self, value: u64) -> &mut Self {
        self.max_udp_payload_size = value;
        self
    }

    /// Maximum number of bytes the peer may transmit on any one stream before
    /// a window update, ours or assumed theirs
    pub fn stream_receive_window(&mut self, value: u64) -> &mut Self {
        self.stream_receive_window = value;
        self
    }

    /// Maximum number of bytes the peer may transmit across all streams of a
    /// connection before a window update
    pub fn receive_window(&mut self, value: u64) -> &mut Self {
        self.receive_window = value;
        self
    }

    /// Unacknowledged data a stream buffers before `write` applies
    /// backpressure; roughly one datagram by default
    pub fn send_buffer_size(&mut self, value: u64) -> &mut Self {
        self.send_buffer_size = value.max(1);
        self
    }

    /// Maximum number of concurrently open bidirectional streams the peer may
    /// initiate
    pub fn max_concurrent_bidi_streams(&mut self, value: u64) -> &mut Self {
        self.max_concurrent_bidi_streams = value;
        self
    }

    /// How long a client waits for the server's first response
    pub fn handshake_timeout(&mut self, value: Duration) -> &mut Self {
        self.handshake_timeout = value;
        self
    }

    /// How to construct the congestion controller for new sessions
    ///
    /// CUBIC by default; swap in [`crate::congestion::BbrConfig`] for BBR.
    pub fn congestion_controller_factory(
        &mut self,
        factory: Arc<dyn ControllerFactory>,
    ) -> &mut Self {
        self.congestion_controller_factory = factory;
        self
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ack_eliciting_threshold: 2,
            max_ack_delay: Duration::from_millis(25),
            initial_rtt: Duration::from_millis(333),
            max_udp_payload_size: 1252,
            stream_receive_window: 1024 * 1024,
            receive_window: 1536 * 1024,
            send_buffer_size: 1252,
            max_concurrent_bidi_streams: 100,
            handshake_timeout: Duration::from_secs(5),
            congestion_controller_factory: Arc::new(CubicConfig::default()),
        }
    }
}

impl fmt::Debug for TransportConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransportConfig")
            .field("ack_eliciting_threshold", &self.ack_eliciting_threshold)
            .field("max_ack_delay", &self.max_ack_delay)
            .field("initial_rtt", &self.initial_rtt)
            .field("max_udp_payload_size", &self.max_udp_payload_size)
            .field("stream_receive_window", &self.stream_receive_window)
            .field("receive_window", &self.receive_window)
            .field("send_buffer_size", &self.send_buffer_size)
            .field(
                "max_concurrent_bidi_streams",
                &self.max_concurrent_bidi_streams,
            )
            .field("handshake_timeout", &self.handshake_timeout)
            .finish_non_exhaustive()
    }
}

/// Global configuration for an endpoint socket
#[derive(Debug, Clone)]
pub struct EndpointConfig {
    pub(crate) cid_len: usize,
}

impl EndpointConfig {
    /// Length of locally-issued connection ids; short-header packets are
    /// routed by reading exactly this many bytes
    pub fn cid_len(&mut self, value: usize) -> &mut Self {
        assert!(value <= crate::MAX_CID_SIZE);
        self.cid_len = value;
        self
    }
}

impl Default for EndpointConfig {
    fn default() -> Self {
        Self { cid_len: 8 }
    }
}
