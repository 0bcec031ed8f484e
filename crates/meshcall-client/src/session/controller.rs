//! The session loop: owns the registry and reacts to relay traffic,
//! transport callbacks and application commands one at a time

use meshcall_media::{LocalStream, MediaError, MediaKind};
use meshcall_protocol::{
    ClientMessage, IceCandidate, PeerId, PeerMessage, RelayMessage, Roster, SdpKind,
    SessionDescription, Signal, TransportConfig,
};
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::mpsc;

use super::events::{
    Command, ControllerState, DisconnectReason, LoopEvent, PeerEvent, PeerLink, PeerState, Role,
    SessionEvent, SessionStatus,
};
use super::peer::{PeerSession, PeerSetup};
use super::registry::PeerRegistry;
use crate::config::{SessionOptions, channel_label};
use crate::error::Result;
use crate::relay::{LeaveBeacon, RelayEvent};
use crate::transport::{ConnectionState, TransportEvent, TransportFactory};

/// Outbound side of the loop: relay commands and application events
struct Outbox {
    relay: Option<mpsc::UnboundedSender<ClientMessage>>,
    events: mpsc::UnboundedSender<SessionEvent>,
}

impl Outbox {
    fn relay(&self, message: ClientMessage) {
        match &self.relay {
            Some(tx) => {
                if tx.send(message).is_err() {
                    tracing::warn!("Relay link is closed, dropping command");
                }
            }
            None => tracing::debug!("No relay link, dropping command"),
        }
    }

    fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event);
    }
}

pub(crate) struct SessionController {
    options: SessionOptions,
    state: ControllerState,
    own_id: Option<PeerId>,
    transport_config: TransportConfig,
    registry: PeerRegistry,
    local: Option<LocalStream>,
    factory: Arc<dyn TransportFactory>,
    beacon: Arc<dyn LeaveBeacon>,
    out: Outbox,
    loop_tx: mpsc::WeakUnboundedSender<LoopEvent>,
    left: bool,
}

impl SessionController {
    pub(crate) fn new(
        options: SessionOptions,
        factory: Arc<dyn TransportFactory>,
        beacon: Arc<dyn LeaveBeacon>,
        relay: mpsc::UnboundedSender<ClientMessage>,
        events: mpsc::UnboundedSender<SessionEvent>,
        loop_tx: mpsc::WeakUnboundedSender<LoopEvent>,
    ) -> Self {
        Self {
            options,
            state: ControllerState::Disconnected,
            own_id: None,
            transport_config: TransportConfig::default(),
            registry: PeerRegistry::new(),
            local: None,
            factory,
            beacon,
            out: Outbox {
                relay: Some(relay),
                events,
            },
            loop_tx,
            left: false,
        }
    }

    /// Ask the relay to admit us to the room
    pub(crate) fn begin_join(&mut self) {
        tracing::info!("Joining room {}", self.options.room);
        self.state = ControllerState::Connecting;
        self.out.relay(ClientMessage::join(self.options.room.clone()));
    }

    pub(crate) async fn run(mut self, mut rx: mpsc::UnboundedReceiver<LoopEvent>) {
        while let Some(event) = rx.recv().await {
            self.handle(event);
        }
        tracing::debug!("Session loop for room {} finished", self.options.room);
    }

    fn handle(&mut self, event: LoopEvent) {
        match event {
            LoopEvent::Relay(event) => self.on_relay_event(event),
            LoopEvent::Peer {
                peer,
                generation,
                event,
            } => self.on_peer_event(peer, generation, event),
            LoopEvent::Command(command) => self.on_command(command),
        }
    }

    fn on_relay_event(&mut self, event: RelayEvent) {
        match event {
            RelayEvent::Message(_) if self.left => {
                tracing::debug!("Dropping relay message received after leaving");
            }
            RelayEvent::Message(text) => match RelayMessage::parse(&text) {
                Ok(message) => self.on_relay_message(message),
                Err(e) => tracing::warn!("Dropping malformed relay message: {}", e),
            },
            RelayEvent::Error(e) => tracing::warn!("Relay link error: {}", e),
            RelayEvent::Closed => {
                self.out.relay = None;
                if !self.left {
                    tracing::info!("Relay link closed");
                    self.state = ControllerState::Disconnected;
                    self.out.emit(SessionEvent::RelayClosed);
                }
            }
        }
    }

    fn on_relay_message(&mut self, message: RelayMessage) {
        match message {
            RelayMessage::Roster(roster) => self.on_roster(roster),
            RelayMessage::Joined(peer) => {
                tracing::info!("{} joined room {}", peer.id, self.options.room);
                self.out.emit(SessionEvent::PeerJoined(peer.id));
            }
            RelayMessage::Offer { sender, offer } => self.on_offer(sender, offer),
            RelayMessage::Answer { sender, answer } => self.on_answer(sender, answer),
            RelayMessage::Candidate {
                sender,
                candidate: None,
            } => {
                tracing::debug!("End of candidates from {}", sender);
            }
            RelayMessage::Candidate {
                sender,
                candidate: Some(candidate),
            } => self.on_candidate(sender, candidate),
            RelayMessage::Text(text) => self.out.emit(SessionEvent::RelayText(text)),
        }
    }

    fn on_roster(&mut self, roster: Roster) {
        let own_id = match &self.own_id {
            Some(id) if *id != roster.me.id => {
                tracing::warn!("Relay reassigned our id to {}, keeping {}", roster.me.id, id);
                id.clone()
            }
            Some(id) => id.clone(),
            None => {
                tracing::info!("Joined room {} as {}", self.options.room, roster.me.id);
                self.own_id = Some(roster.me.id.clone());
                roster.me.id
            }
        };

        self.transport_config = roster.token;
        self.state = ControllerState::Joined;

        let peers: Vec<PeerId> = roster.peers.into_iter().filter(|p| *p != own_id).collect();
        self.out.emit(SessionEvent::Joined {
            id: own_id,
            peers: peers.clone(),
        });

        for peer in &peers {
            if self.registry.contains(peer) {
                tracing::debug!("Session for {} already exists", peer);
                continue;
            }
            self.ensure_session(peer, Role::Initiator);
        }
    }

    fn on_offer(&mut self, sender: PeerId, offer: SessionDescription) {
        let Some(session) = self.ensure_session(&sender, Role::Responder) else {
            return;
        };

        if session.has_local_offer() {
            tracing::warn!("Ignoring offer from {} while our own offer is outstanding", sender);
            return;
        }
        match session.state() {
            PeerState::Connected => tracing::info!("Renegotiation offer from {}", sender),
            PeerState::AnswerSent => tracing::debug!("Repeated offer from {}", sender),
            _ => tracing::debug!("Offer from {}", sender),
        }
        session.accept_offer(offer);
    }

    fn on_answer(&mut self, sender: PeerId, answer: SessionDescription) {
        let Some(session) = self.registry.get_mut(&sender) else {
            tracing::debug!("Answer from {} without a session, ignoring", sender);
            return;
        };
        if !session.apply_answer(answer) {
            tracing::debug!("Answer from {} not expected, ignoring", sender);
        }
    }

    fn on_candidate(&mut self, sender: PeerId, candidate: IceCandidate) {
        if let Some(session) = self.ensure_session(&sender, Role::Responder) {
            session.add_candidate(candidate);
        }
    }

    /// Existing session for `peer`, or a new one in `role`
    fn ensure_session(&mut self, peer: &PeerId, role: Role) -> Option<&mut PeerSession> {
        if self.own_id.as_ref() == Some(peer) {
            tracing::warn!("Ignoring signaling that carries our own id {}", peer);
            return None;
        }

        let loop_tx = &self.loop_tx;
        let factory = &self.factory;
        let config = &self.transport_config;
        let local = &self.local;
        let options = &self.options;

        self.registry.get_or_open(peer, |generation| {
            let Some(tx) = loop_tx.upgrade() else {
                tracing::debug!("Session loop is shutting down, not opening {}", peer);
                return None;
            };
            let setup = PeerSetup {
                factory: factory.clone(),
                config: config.clone(),
                tracks: local.as_ref().map(|s| s.tracks().to_vec()).unwrap_or_default(),
                channel_label: channel_label(peer),
                op_timeout: options.op_timeout,
                candidate_grace: options.candidate_grace,
            };
            Some(PeerSession::open(
                PeerLink::new(peer.clone(), generation, tx),
                role,
                setup,
            ))
        })
    }

    fn on_peer_event(&mut self, peer: PeerId, generation: u64, event: PeerEvent) {
        let Some(session) = self.registry.current_mut(&peer, generation) else {
            tracing::debug!("Dropping event for stale session {} (generation {})", peer, generation);
            return;
        };

        let teardown = match event {
            PeerEvent::LocalDescription(desc) => {
                let kind = desc.kind;
                let signal = match kind {
                    SdpKind::Offer => {
                        session.offer_sent();
                        Signal::Offer(desc)
                    }
                    SdpKind::Answer => {
                        session.answer_sent();
                        Signal::Answer(desc)
                    }
                    other => {
                        tracing::warn!("Not forwarding {} description to {}", other, peer);
                        return;
                    }
                };
                tracing::debug!("Sending {} to {}", kind, peer);
                self.out.relay(ClientMessage::signal(peer.clone(), signal));
                None
            }
            PeerEvent::RemoteApplied => {
                session.on_remote_applied();
                None
            }
            PeerEvent::ChannelCreated(channel) => {
                session.set_local_channel(channel);
                None
            }
            PeerEvent::NegotiationFailed(e) => {
                tracing::warn!("Negotiation with {} failed: {}", peer, e);
                session.on_negotiation_failed();
                None
            }
            PeerEvent::TransportUnavailable(e) => {
                Some(DisconnectReason::TransportUnavailable(e.to_string()))
            }
            PeerEvent::CandidateGraceElapsed => {
                session.on_candidate_grace();
                None
            }
            PeerEvent::TrackEnded(track_id) => session
                .has_track(&track_id)
                .then(|| DisconnectReason::TrackEnded(track_id)),
            PeerEvent::Transport(event) => Self::on_transport_event(session, &self.out, event),
        };

        if let Some(reason) = teardown {
            self.teardown(&peer, reason);
        }
    }

    /// Returns the reason to tear the session down, if the event calls for it
    fn on_transport_event(
        session: &mut PeerSession,
        out: &Outbox,
        event: TransportEvent,
    ) -> Option<DisconnectReason> {
        let peer = session.peer().clone();
        match event {
            TransportEvent::Candidate(candidate) => {
                out.relay(ClientMessage::signal(peer, Signal::Candidate(candidate)));
                None
            }
            TransportEvent::Track(track) => {
                if let Some(stream) = session.on_track(track) {
                    tracing::info!("Stream from {} ready with {} tracks", peer, stream.len());
                    out.emit(SessionEvent::MediaStream { peer, stream });
                }
                None
            }
            TransportEvent::NegotiationNeeded => {
                if !session.on_negotiation_needed() {
                    tracing::debug!("Deferring renegotiation with {}", peer);
                }
                None
            }
            TransportEvent::ConnectionState(state) if state.is_terminal() => {
                Some(DisconnectReason::ConnectionState(state))
            }
            TransportEvent::ConnectionState(ConnectionState::Connected) => {
                if session.state() != PeerState::Connected {
                    tracing::info!("Connected to {}", peer);
                    session.on_connected();
                    out.emit(SessionEvent::PeerConnected(peer));
                }
                None
            }
            TransportEvent::ConnectionState(state) => {
                tracing::debug!("Connection to {} is {:?}", peer, state);
                None
            }
            TransportEvent::DataChannel(channel) => {
                session.set_remote_channel(channel);
                None
            }
            TransportEvent::ChannelOpen { origin } => {
                tracing::info!("Data channel with {} open ({:?})", peer, origin);
                None
            }
            TransportEvent::ChannelClosed { origin } => {
                if session.has_open_channel() {
                    tracing::debug!("{:?} data channel with {} closed", origin, peer);
                    None
                } else {
                    Some(DisconnectReason::ChannelClosed)
                }
            }
            TransportEvent::ChannelMessage(text) => match PeerMessage::parse(&text) {
                Ok(PeerMessage::Data { msg }) => {
                    out.emit(SessionEvent::PeerData { peer, data: msg });
                    None
                }
                Ok(PeerMessage::State { sender, .. }) => {
                    if sender != peer {
                        tracing::debug!("Close notice on {}'s channel names {}", peer, sender);
                    }
                    Some(DisconnectReason::RemoteClosed)
                }
                Err(e) => {
                    tracing::warn!("Dropping malformed message from {}: {}", peer, e);
                    None
                }
            },
        }
    }

    fn teardown(&mut self, peer: &PeerId, reason: DisconnectReason) {
        let Some(session) = self.registry.remove(peer) else {
            return;
        };
        tracing::info!("Peer {} disconnected: {:?}", peer, reason);
        session.close();
        self.out.emit(SessionEvent::PeerDisconnected {
            peer: peer.clone(),
            reason,
        });
    }

    fn on_command(&mut self, command: Command) {
        match command {
            Command::Publish(stream) => self.publish(stream),
            Command::Unpublish => self.unpublish(),
            Command::Toggle(kind, reply) => {
                let _ = reply.send(self.toggle(kind));
            }
            Command::SendToAll(payload, reply) => {
                let _ = reply.send(self.send_to_all(payload));
            }
            Command::Leave(reply) => {
                self.leave();
                let _ = reply.send(());
            }
            Command::Status(reply) => {
                let _ = reply.send(self.status());
            }
        }
    }

    fn publish(&mut self, stream: LocalStream) {
        let replaced = self.local.replace(stream.clone()).is_some();
        for session in self.registry.iter() {
            if replaced {
                session.unpublish();
            }
            session.publish(stream.tracks().to_vec());
        }
        tracing::info!(
            "Publishing {} local tracks to {} peers",
            stream.tracks().len(),
            self.registry.len()
        );
    }

    fn unpublish(&mut self) {
        let Some(local) = self.local.take() else {
            tracing::debug!("Nothing published");
            return;
        };

        if let Some(own_id) = &self.own_id {
            match PeerMessage::closed(own_id.clone()).to_text() {
                Ok(text) => {
                    for session in self.registry.iter() {
                        session.send(text.clone());
                    }
                }
                Err(e) => tracing::warn!("Failed to encode close notice: {}", e),
            }
        }

        local.stop();
        for session in self.registry.iter() {
            session.unpublish();
        }
        tracing::info!("Unpublished local stream {}", local.id());
    }

    fn toggle(&self, kind: MediaKind) -> Result<bool> {
        let local = self.local.as_ref().ok_or(MediaError::NoLocalStream)?;
        Ok(local.toggle(kind)?)
    }

    fn send_to_all(&self, payload: Value) -> usize {
        let text = match (PeerMessage::Data { msg: payload }).to_text() {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!("Failed to encode message: {}", e);
                return 0;
            }
        };

        let sent = self
            .registry
            .iter()
            .filter(|session| session.send(text.clone()))
            .count();
        tracing::debug!("Sent message to {} of {} peers", sent, self.registry.len());
        sent
    }

    fn leave(&mut self) {
        if self.left {
            tracing::debug!("Already left room {}", self.options.room);
            return;
        }
        self.left = true;
        self.state = ControllerState::Leaving;
        tracing::info!("Leaving room {}", self.options.room);

        if let Some(local) = self.local.take() {
            local.stop();
        }
        for session in self.registry.drain() {
            session.unpublish();
            session.close();
        }

        if let Some(own_id) = &self.own_id {
            self.beacon.notify(&self.options.api_url, own_id);
        }
        self.out.relay = None;
        self.state = ControllerState::Disconnected;
        self.out.emit(SessionEvent::Left);
    }

    fn status(&self) -> SessionStatus {
        SessionStatus {
            state: self.state,
            own_id: self.own_id.clone(),
            peers: self.registry.summaries(),
            local: self.local.as_ref().map(LocalStream::state),
        }
    }
}
