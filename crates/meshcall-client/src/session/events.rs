use meshcall_media::{AggregateStream, LocalStream, LocalStreamState, MediaKind};
use meshcall_protocol::{PeerId, SessionDescription};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Result, SessionError};
use crate::relay::RelayEvent;
use crate::transport::{ConnectionState, DataChannel, TransportEvent};

/// Notifications delivered to the application
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// The relay accepted the join and assigned our id
    Joined { id: PeerId, peers: Vec<PeerId> },
    /// Another participant entered the room
    PeerJoined(PeerId),
    PeerConnected(PeerId),
    /// Raised once per session; the peer is gone from the registry
    PeerDisconnected {
        peer: PeerId,
        reason: DisconnectReason,
    },
    /// A peer's inbound tracks formed a complete stream
    MediaStream {
        peer: PeerId,
        stream: AggregateStream,
    },
    /// Application payload received over a data channel
    PeerData { peer: PeerId, data: Value },
    /// Plain text relayed by the relay itself
    RelayText(String),
    RelayClosed,
    Left,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    ConnectionState(ConnectionState),
    TrackEnded(String),
    /// The peer announced it is going away
    RemoteClosed,
    ChannelClosed,
    TransportUnavailable(String),
}

/// Negotiation role of a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Initiator,
    Responder,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    OfferSent,
    AnswerSent,
    Connected,
    Closed,
}

impl PeerState {
    pub fn is_negotiating(self) -> bool {
        matches!(self, PeerState::OfferSent | PeerState::AnswerSent)
    }
}

/// Registry entry as seen from outside the loop
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerSummary {
    pub id: PeerId,
    pub role: Role,
    pub state: PeerState,
    pub generation: u64,
    pub channel_open: bool,
    pub has_stream: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControllerState {
    Disconnected,
    Connecting,
    Joined,
    Leaving,
}

#[derive(Debug, Clone)]
pub struct SessionStatus {
    pub state: ControllerState,
    pub own_id: Option<PeerId>,
    pub peers: Vec<PeerSummary>,
    pub local: Option<LocalStreamState>,
}

/// Everything the session loop reacts to
pub(crate) enum LoopEvent {
    Relay(RelayEvent),
    Peer {
        peer: PeerId,
        generation: u64,
        event: PeerEvent,
    },
    Command(Command),
}

/// Results and callbacks of one peer session
pub(crate) enum PeerEvent {
    Transport(TransportEvent),
    LocalDescription(SessionDescription),
    RemoteApplied,
    ChannelCreated(Arc<dyn DataChannel>),
    NegotiationFailed(SessionError),
    TransportUnavailable(SessionError),
    CandidateGraceElapsed,
    TrackEnded(String),
}

pub(crate) enum Command {
    Publish(LocalStream),
    Unpublish,
    Toggle(MediaKind, oneshot::Sender<Result<bool>>),
    SendToAll(Value, oneshot::Sender<usize>),
    Leave(oneshot::Sender<()>),
    Status(oneshot::Sender<SessionStatus>),
}

/// Handle a peer session's helpers use to report back to the loop
#[derive(Clone)]
pub(crate) struct PeerLink {
    peer: PeerId,
    generation: u64,
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl PeerLink {
    pub(crate) fn new(peer: PeerId, generation: u64, tx: mpsc::UnboundedSender<LoopEvent>) -> Self {
        Self {
            peer,
            generation,
            tx,
        }
    }

    pub(crate) fn peer(&self) -> &PeerId {
        &self.peer
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// Returns false once the loop has stopped
    pub(crate) fn post(&self, event: PeerEvent) -> bool {
        self.tx
            .send(LoopEvent::Peer {
                peer: self.peer.clone(),
                generation: self.generation,
                event,
            })
            .is_ok()
    }
}
