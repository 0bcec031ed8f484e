//! One remote participant: negotiation state on the loop side, transport
//! operations on a serial worker task

use meshcall_media::{AggregateStream, LocalTrack, RemoteTrack};
use meshcall_protocol::{IceCandidate, PeerId, SessionDescription, TransportConfig};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::candidates::{Admission, IceCandidateQueue};
use super::events::{PeerEvent, PeerLink, PeerState, PeerSummary, Role};
use super::tracks::TrackAggregator;
use crate::transport::{DataChannel, PeerTransport, TransportFactory};

/// Operations executed against the transport, strictly in order
pub(crate) enum TransportOp {
    /// Create and apply a local offer
    Offer,
    /// Apply a remote offer, then create and apply the answer
    Answer(SessionDescription),
    /// Apply a remote answer
    ApplyRemote(SessionDescription),
    AddCandidate(IceCandidate),
    /// Report whether a remote description is already in place
    ProbeRemote,
    OpenChannel(String),
    AddTracks(Vec<LocalTrack>),
    RemoveTracks,
    Send {
        channel: Arc<dyn DataChannel>,
        text: String,
    },
    Close {
        channels: Vec<Arc<dyn DataChannel>>,
    },
}

/// What a new session needs to bring up its transport
pub(crate) struct PeerSetup {
    pub factory: Arc<dyn TransportFactory>,
    pub config: TransportConfig,
    pub tracks: Vec<LocalTrack>,
    pub channel_label: String,
    pub op_timeout: Duration,
    pub candidate_grace: Duration,
}

pub(crate) struct PeerSession {
    link: PeerLink,
    role: Role,
    state: PeerState,
    ops: mpsc::UnboundedSender<TransportOp>,
    candidates: IceCandidateQueue,
    tracks: TrackAggregator,
    local_channel: Option<Arc<dyn DataChannel>>,
    remote_channel: Option<Arc<dyn DataChannel>>,
    /// An offer is queued on the worker but has not reached the peer yet
    offer_pending: bool,
    /// Our offer is out and its answer has not been applied yet
    awaiting_answer: bool,
    renegotiation_pending: bool,
    candidate_grace: Duration,
    /// End-hook watchers of inbound tracks, aborted on close
    track_watchers: Vec<JoinHandle<()>>,
}

impl PeerSession {
    /// Spawn the worker, attach local tracks and, as initiator, open the
    /// data channel and start the offer
    pub(crate) fn open(link: PeerLink, role: Role, setup: PeerSetup) -> Self {
        let (ops_tx, ops_rx) = mpsc::unbounded_channel();

        let worker = SessionWorker {
            link: link.clone(),
            factory: setup.factory,
            config: setup.config,
            op_timeout: setup.op_timeout,
            ops: ops_rx,
        };
        tokio::spawn(worker.run());

        let mut session = Self {
            link,
            role,
            state: PeerState::New,
            ops: ops_tx,
            candidates: IceCandidateQueue::new(),
            tracks: TrackAggregator::new(),
            local_channel: None,
            remote_channel: None,
            offer_pending: false,
            awaiting_answer: false,
            renegotiation_pending: false,
            candidate_grace: setup.candidate_grace,
            track_watchers: Vec::new(),
        };

        if !setup.tracks.is_empty() {
            session.submit(TransportOp::AddTracks(setup.tracks));
        }
        if role == Role::Initiator {
            session.submit(TransportOp::OpenChannel(setup.channel_label));
            session.submit_offer();
        }

        tracing::info!(
            "Opened {:?} session for {} (generation {})",
            role,
            session.peer(),
            session.generation()
        );
        session
    }

    fn submit(&self, op: TransportOp) {
        if self.ops.send(op).is_err() {
            tracing::warn!("Worker for {} is gone, dropping operation", self.peer());
        }
    }

    fn submit_offer(&mut self) {
        self.offer_pending = true;
        self.submit(TransportOp::Offer);
    }

    pub(crate) fn peer(&self) -> &PeerId {
        self.link.peer()
    }

    pub(crate) fn generation(&self) -> u64 {
        self.link.generation()
    }

    pub(crate) fn state(&self) -> PeerState {
        self.state
    }

    /// True from the moment an offer is queued until its answer is applied
    pub(crate) fn has_local_offer(&self) -> bool {
        self.offer_pending || self.awaiting_answer
    }

    pub(crate) fn summary(&self) -> PeerSummary {
        PeerSummary {
            id: self.peer().clone(),
            role: self.role,
            state: self.state,
            generation: self.generation(),
            channel_open: self.open_channel().is_some(),
            has_stream: self.tracks.stream().is_some(),
        }
    }

    /// Our local description went out to the peer
    pub(crate) fn offer_sent(&mut self) {
        self.offer_pending = false;
        self.awaiting_answer = true;
        if self.state != PeerState::Connected {
            self.state = PeerState::OfferSent;
        }
    }

    pub(crate) fn answer_sent(&mut self) {
        if self.state != PeerState::Connected {
            self.state = PeerState::AnswerSent;
        }
    }

    /// A create or apply step failed on the worker. A queued offer that
    /// never went out no longer blocks inbound offers.
    pub(crate) fn on_negotiation_failed(&mut self) {
        self.offer_pending = false;
    }

    pub(crate) fn accept_offer(&mut self, offer: SessionDescription) {
        self.submit(TransportOp::Answer(offer));
    }

    /// Apply the answer to our outstanding offer. Returns false when no
    /// answer is expected for the current round.
    pub(crate) fn apply_answer(&mut self, answer: SessionDescription) -> bool {
        if !self.awaiting_answer {
            return false;
        }
        self.awaiting_answer = false;
        self.submit(TransportOp::ApplyRemote(answer));
        true
    }

    pub(crate) fn add_candidate(&mut self, candidate: IceCandidate) {
        match self.candidates.admit(candidate) {
            Admission::Apply(candidate) => self.submit(TransportOp::AddCandidate(candidate)),
            Admission::Queued { first } => {
                tracing::debug!(
                    "Queued candidate for {} until its remote description is set ({} pending)",
                    self.peer(),
                    self.candidates.len()
                );
                if first {
                    self.arm_candidate_grace();
                }
            }
        }
    }

    fn arm_candidate_grace(&self) {
        let link = self.link.clone();
        let grace = self.candidate_grace;
        tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            link.post(PeerEvent::CandidateGraceElapsed);
        });
    }

    pub(crate) fn on_candidate_grace(&self) {
        if !self.candidates.is_drained() && !self.candidates.is_empty() {
            self.submit(TransportOp::ProbeRemote);
        }
    }

    /// The transport holds a remote description; release queued candidates
    pub(crate) fn on_remote_applied(&mut self) {
        if let Some(backlog) = self.candidates.drain() {
            if !backlog.is_empty() {
                tracing::debug!("Applying {} queued candidates for {}", backlog.len(), self.peer());
            }
            for candidate in backlog {
                self.submit(TransportOp::AddCandidate(candidate));
            }
        }
        if self.renegotiation_pending && self.state == PeerState::Connected && !self.has_local_offer() {
            self.on_negotiation_needed();
        }
    }

    /// Renegotiation request from the transport. Served immediately once
    /// connected and idle, otherwise remembered.
    pub(crate) fn on_negotiation_needed(&mut self) -> bool {
        if self.state == PeerState::Connected && !self.has_local_offer() {
            self.renegotiation_pending = false;
            self.submit_offer();
            true
        } else {
            self.renegotiation_pending = true;
            false
        }
    }

    pub(crate) fn on_connected(&mut self) {
        self.state = PeerState::Connected;
        if self.renegotiation_pending {
            tracing::debug!("Serving deferred renegotiation for {}", self.peer());
            self.on_negotiation_needed();
        }
    }

    /// Collect an inbound track; returns the aggregate stream when it
    /// becomes complete
    pub(crate) fn on_track(&mut self, track: RemoteTrack) -> Option<AggregateStream> {
        let mut ended = track.subscribe_ended();
        let link = self.link.clone();
        let track_id = track.id().to_string();
        let watcher = tokio::spawn(async move {
            if ended.wait_for(|ended| *ended).await.is_ok() {
                link.post(PeerEvent::TrackEnded(track_id));
            }
        });
        self.track_watchers.retain(|w| !w.is_finished());
        self.track_watchers.push(watcher);

        self.tracks.push(track)
    }

    pub(crate) fn has_track(&self, track_id: &str) -> bool {
        self.tracks.contains(track_id)
    }

    pub(crate) fn set_local_channel(&mut self, channel: Arc<dyn DataChannel>) {
        self.local_channel = Some(channel);
    }

    pub(crate) fn set_remote_channel(&mut self, channel: Arc<dyn DataChannel>) {
        self.remote_channel = Some(channel);
    }

    /// The channel used for sending: ours if open, else the peer's
    fn open_channel(&self) -> Option<&Arc<dyn DataChannel>> {
        self.local_channel
            .iter()
            .chain(self.remote_channel.iter())
            .find(|channel| channel.is_open())
    }

    pub(crate) fn has_open_channel(&self) -> bool {
        self.open_channel().is_some()
    }

    /// Queue `text` on the open channel; false if there is none
    pub(crate) fn send(&self, text: String) -> bool {
        match self.open_channel() {
            Some(channel) => {
                self.submit(TransportOp::Send {
                    channel: channel.clone(),
                    text,
                });
                true
            }
            None => false,
        }
    }

    pub(crate) fn publish(&self, tracks: Vec<LocalTrack>) {
        self.submit(TransportOp::AddTracks(tracks));
    }

    pub(crate) fn unpublish(&self) {
        self.submit(TransportOp::RemoveTracks);
    }

    /// Close channels and transport after every queued operation. Consumes
    /// the session; the worker exits once done.
    pub(crate) fn close(mut self) {
        self.state = PeerState::Closed;
        for watcher in self.track_watchers.drain(..) {
            watcher.abort();
        }
        let channels = self
            .local_channel
            .take()
            .into_iter()
            .chain(self.remote_channel.take())
            .collect();
        self.submit(TransportOp::Close { channels });
        tracing::info!("Closed session for {} (generation {})", self.peer(), self.generation());
    }
}

/// Owns the transport of one session and executes its operations in order
struct SessionWorker {
    link: PeerLink,
    factory: Arc<dyn TransportFactory>,
    config: TransportConfig,
    op_timeout: Duration,
    ops: mpsc::UnboundedReceiver<TransportOp>,
}

impl SessionWorker {
    async fn run(mut self) {
        let (events_tx, mut events_rx) = mpsc::unbounded_channel();
        let transport = match self.factory.create(self.link.peer(), &self.config, events_tx).await {
            Ok(transport) => transport,
            Err(e) => {
                tracing::error!("Failed to create transport for {}: {}", self.link.peer(), e);
                self.link.post(PeerEvent::TransportUnavailable(e.into()));
                return;
            }
        };

        let forward_link = self.link.clone();
        let forwarder = tokio::spawn(async move {
            while let Some(event) = events_rx.recv().await {
                if !forward_link.post(PeerEvent::Transport(event)) {
                    break;
                }
            }
        });

        let mut closed = false;
        while let Some(op) = self.ops.recv().await {
            if let TransportOp::Close { channels } = op {
                self.close(transport.as_ref(), channels).await;
                closed = true;
                break;
            }
            self.execute(transport.as_ref(), op).await;
        }

        if !closed {
            self.close(transport.as_ref(), Vec::new()).await;
        }
        forwarder.abort();
        tracing::debug!("Worker for {} finished", self.link.peer());
    }

    async fn execute(&self, transport: &dyn PeerTransport, op: TransportOp) {
        let peer = self.link.peer();
        match op {
            TransportOp::Offer => match self.offer(transport).await {
                Ok(offer) => {
                    self.link.post(PeerEvent::LocalDescription(offer));
                }
                Err(e) => {
                    tracing::warn!("Offer for {} failed: {}", peer, e);
                    self.link.post(PeerEvent::NegotiationFailed(e.into()));
                }
            },
            TransportOp::Answer(offer) => match self.answer(transport, offer).await {
                Ok(answer) => {
                    self.link.post(PeerEvent::LocalDescription(answer));
                }
                Err(e) => {
                    tracing::warn!("Answer for {} failed: {}", peer, e);
                    self.link.post(PeerEvent::NegotiationFailed(e.into()));
                }
            },
            TransportOp::ApplyRemote(answer) => {
                match self.bounded(transport.set_remote_description(answer)).await {
                    Ok(()) => {
                        self.link.post(PeerEvent::RemoteApplied);
                    }
                    Err(e) => {
                        tracing::warn!("Applying answer from {} failed: {}", peer, e);
                        self.link.post(PeerEvent::NegotiationFailed(e.into()));
                    }
                }
            }
            TransportOp::AddCandidate(candidate) => {
                if let Err(e) = self.bounded(transport.add_ice_candidate(candidate)).await {
                    tracing::warn!("Failed to add candidate from {}: {}", peer, e);
                }
            }
            TransportOp::ProbeRemote => {
                if transport.has_remote_description().await {
                    tracing::debug!("Remote description for {} found by grace check", peer);
                    self.link.post(PeerEvent::RemoteApplied);
                }
            }
            TransportOp::OpenChannel(label) => {
                match self.bounded(transport.create_data_channel(&label)).await {
                    Ok(channel) => {
                        self.link.post(PeerEvent::ChannelCreated(channel));
                    }
                    Err(e) => tracing::error!("Failed to open data channel to {}: {}", peer, e),
                }
            }
            TransportOp::AddTracks(tracks) => {
                for track in &tracks {
                    if let Err(e) = self.bounded(transport.add_track(track)).await {
                        tracing::error!("Failed to add {} track for {}: {}", track.kind(), peer, e);
                    }
                }
            }
            TransportOp::RemoveTracks => {
                if let Err(e) = self.bounded(transport.remove_tracks()).await {
                    tracing::warn!("Failed to remove tracks for {}: {}", peer, e);
                }
            }
            TransportOp::Send { channel, text } => {
                if let Err(e) = self.bounded(channel.send_text(text)).await {
                    tracing::warn!("Failed to send on {}: {}", channel.label(), e);
                }
            }
            TransportOp::Close { .. } => {}
        }
    }

    async fn offer(&self, transport: &dyn PeerTransport) -> anyhow::Result<SessionDescription> {
        let offer = self.bounded(transport.create_offer()).await?;
        self.bounded(transport.set_local_description(offer.clone())).await?;
        Ok(offer)
    }

    async fn answer(
        &self,
        transport: &dyn PeerTransport,
        offer: SessionDescription,
    ) -> anyhow::Result<SessionDescription> {
        self.bounded(transport.set_remote_description(offer)).await?;
        self.link.post(PeerEvent::RemoteApplied);

        let answer = self.bounded(transport.create_answer()).await?;
        self.bounded(transport.set_local_description(answer.clone())).await?;
        Ok(answer)
    }

    async fn close(&self, transport: &dyn PeerTransport, channels: Vec<Arc<dyn DataChannel>>) {
        for channel in channels {
            if let Err(e) = self.bounded(channel.close()).await {
                tracing::debug!("Closing {} failed: {}", channel.label(), e);
            }
        }
        if let Err(e) = self.bounded(transport.close()).await {
            tracing::warn!("Closing transport for {} failed: {}", self.link.peer(), e);
        }
    }

    async fn bounded<T>(&self, fut: impl Future<Output = anyhow::Result<T>>) -> anyhow::Result<T> {
        match tokio::time::timeout(self.op_timeout, fut).await {
            Ok(result) => result,
            Err(_) => anyhow::bail!("transport operation timed out after {:?}", self.op_timeout),
        }
    }
}
