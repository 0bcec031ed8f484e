//! Capability boundary around the real-time transport engine
//!
//! A [`PeerTransport`] is one point-to-point link to a remote peer. The
//! session layer never touches the engine directly: it calls these methods
//! from a per-peer worker and consumes [`TransportEvent`]s from a channel.

mod rtc;

pub use rtc::{WebRtcTransport, WebRtcTransportFactory};

use anyhow::Result;
use async_trait::async_trait;
use meshcall_media::{LocalTrack, RemoteTrack};
use meshcall_protocol::{IceCandidate, PeerId, SessionDescription, TransportConfig};
use std::fmt;
use std::sync::Arc;
use tokio::sync::mpsc;

/// Channel for transport callbacks of one peer
pub type TransportEventSender = mpsc::UnboundedSender<TransportEvent>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl ConnectionState {
    /// States after which the link is torn down
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected | ConnectionState::Failed | ConnectionState::Closed
        )
    }
}

/// Which side opened a data channel
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelOrigin {
    Local,
    Remote,
}

/// Callbacks raised by a transport
pub enum TransportEvent {
    /// Locally gathered candidate to forward to the peer
    Candidate(IceCandidate),
    Track(RemoteTrack),
    NegotiationNeeded,
    ConnectionState(ConnectionState),
    /// A data channel opened by the remote side
    DataChannel(Arc<dyn DataChannel>),
    ChannelOpen { origin: ChannelOrigin },
    ChannelClosed { origin: ChannelOrigin },
    /// Text received on any data channel of this link
    ChannelMessage(String),
}

impl fmt::Debug for TransportEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportEvent::Candidate(c) => f.debug_tuple("Candidate").field(&c.candidate).finish(),
            TransportEvent::Track(t) => f.debug_tuple("Track").field(t).finish(),
            TransportEvent::NegotiationNeeded => f.write_str("NegotiationNeeded"),
            TransportEvent::ConnectionState(s) => f.debug_tuple("ConnectionState").field(s).finish(),
            TransportEvent::DataChannel(c) => f.debug_tuple("DataChannel").field(&c.label()).finish(),
            TransportEvent::ChannelOpen { origin } => {
                f.debug_struct("ChannelOpen").field("origin", origin).finish()
            }
            TransportEvent::ChannelClosed { origin } => {
                f.debug_struct("ChannelClosed").field("origin", origin).finish()
            }
            TransportEvent::ChannelMessage(text) => {
                f.debug_tuple("ChannelMessage").field(&text.len()).finish()
            }
        }
    }
}

/// Ordered, reliable text channel riding on a transport
#[async_trait]
pub trait DataChannel: Send + Sync + fmt::Debug {
    fn label(&self) -> String;

    fn is_open(&self) -> bool;

    async fn send_text(&self, text: String) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// One negotiated link to a remote peer
#[async_trait]
pub trait PeerTransport: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;

    async fn create_answer(&self) -> Result<SessionDescription>;

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;

    async fn has_remote_description(&self) -> bool;

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>>;

    async fn add_track(&self, track: &LocalTrack) -> Result<()>;

    /// Detach every local track sender
    async fn remove_tracks(&self) -> Result<()>;

    async fn close(&self) -> Result<()>;
}

/// Produces one transport per remote peer
#[async_trait]
pub trait TransportFactory: Send + Sync {
    async fn create(
        &self,
        peer: &PeerId,
        config: &TransportConfig,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>>;
}
