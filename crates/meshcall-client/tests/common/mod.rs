//! Scripted transport and relay used by the integration tests

#![allow(dead_code)]

use async_trait::async_trait;
use meshcall_client::protocol::{
    ClientMessage, IceCandidate, PeerId, SdpKind, SessionDescription, Signal, TransportConfig,
};
use meshcall_client::relay::{LeaveBeacon, RelayEnd, RelayLink};
use meshcall_client::transport::{
    ChannelOrigin, DataChannel, PeerTransport, TransportEvent, TransportEventSender,
    TransportFactory,
};
use meshcall_client::{PeerSummary, Session, SessionEvent, SessionOptions};
use meshcall_client::media::LocalTrack;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{mpsc, Notify};
use tokio::time::{timeout, Instant};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

pub const WAIT: Duration = Duration::from_secs(2);

pub fn init_tracing() {
    let _ = tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meshcall_client=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_test_writer())
        .try_init();
}

/// Transport operation as observed by the scripted transport
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreateOffer,
    CreateAnswer,
    SetLocal(SdpKind),
    SetRemote(SdpKind, String),
    AddCandidate(String),
    OpenChannel(String),
    AddTrack(String),
    RemoveTracks,
    Close,
}

#[derive(Debug)]
pub struct MockChannel {
    label: String,
    open: AtomicBool,
    closed: AtomicBool,
    sent: Mutex<Vec<String>>,
}

impl MockChannel {
    fn new(label: &str) -> Self {
        Self {
            label: label.to_string(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        }
    }

    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DataChannel for MockChannel {
    fn label(&self) -> String {
        self.label.clone()
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn send_text(&self, text: String) -> anyhow::Result<()> {
        if !self.is_open() {
            anyhow::bail!("channel {} is not open", self.label);
        }
        self.sent.lock().unwrap().push(text);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.open.store(false, Ordering::SeqCst);
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }
}

pub struct MockTransport {
    peer: PeerId,
    events: TransportEventSender,
    calls: Mutex<Vec<Call>>,
    remote: Mutex<Option<SessionDescription>>,
    channels: Mutex<Vec<Arc<MockChannel>>>,
    answer_gate: Option<Arc<Notify>>,
    script: Script,
    serial: AtomicUsize,
}

impl MockTransport {
    fn record(&self, call: Call) {
        self.calls.lock().unwrap().push(call);
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().unwrap().clone()
    }

    pub fn count(&self, matches: impl Fn(&Call) -> bool) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| matches(c)).count()
    }

    pub fn has(&self, call: &Call) -> bool {
        self.calls.lock().unwrap().contains(call)
    }

    /// Raise a transport callback as the engine would
    pub fn emit(&self, event: TransportEvent) {
        let _ = self.events.send(event);
    }

    pub fn channel(&self) -> Option<Arc<MockChannel>> {
        self.channels.lock().unwrap().first().cloned()
    }

    pub fn open_channel(&self) {
        let channel = self.channel().expect("no channel created");
        channel.open.store(true, Ordering::SeqCst);
        self.emit(TransportEvent::ChannelOpen {
            origin: ChannelOrigin::Local,
        });
    }
}

#[async_trait]
impl PeerTransport for MockTransport {
    async fn create_offer(&self) -> anyhow::Result<SessionDescription> {
        self.record(Call::CreateOffer);
        if self.script.stall_offers {
            std::future::pending::<()>().await;
        }
        let n = self.serial.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::offer(format!("offer-{}-{}", self.peer, n)))
    }

    async fn create_answer(&self) -> anyhow::Result<SessionDescription> {
        self.record(Call::CreateAnswer);
        if let Some(gate) = &self.answer_gate {
            gate.notified().await;
        }
        let n = self.serial.fetch_add(1, Ordering::SeqCst);
        Ok(SessionDescription::answer(format!("answer-{}-{}", self.peer, n)))
    }

    async fn set_local_description(&self, desc: SessionDescription) -> anyhow::Result<()> {
        self.record(Call::SetLocal(desc.kind));
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> anyhow::Result<()> {
        self.record(Call::SetRemote(desc.kind, desc.sdp.clone()));
        if self.script.reject_remote {
            anyhow::bail!("remote description rejected");
        }
        *self.remote.lock().unwrap() = Some(desc);
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.remote.lock().unwrap().is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> anyhow::Result<()> {
        self.record(Call::AddCandidate(candidate.candidate));
        if self.remote.lock().unwrap().is_none() {
            anyhow::bail!("remote description not set");
        }
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> anyhow::Result<Arc<dyn DataChannel>> {
        self.record(Call::OpenChannel(label.to_string()));
        let channel = Arc::new(MockChannel::new(label));
        self.channels.lock().unwrap().push(channel.clone());
        let channel: Arc<dyn DataChannel> = channel;
        Ok(channel)
    }

    async fn add_track(&self, track: &LocalTrack) -> anyhow::Result<()> {
        self.record(Call::AddTrack(track.id().to_string()));
        Ok(())
    }

    async fn remove_tracks(&self) -> anyhow::Result<()> {
        self.record(Call::RemoveTracks);
        Ok(())
    }

    async fn close(&self) -> anyhow::Result<()> {
        self.record(Call::Close);
        Ok(())
    }
}

/// Misbehaviour switched on for every transport a factory creates
#[derive(Debug, Clone, Copy, Default)]
pub struct Script {
    /// `create` fails
    pub fail_create: bool,
    /// `create_offer` never completes
    pub stall_offers: bool,
    /// `set_remote_description` is rejected
    pub reject_remote: bool,
    /// Transports start out holding a remote description
    pub preset_remote: bool,
}

/// Hands out scripted transports and remembers every one it created
#[derive(Default)]
pub struct MockFactory {
    transports: Mutex<HashMap<PeerId, Vec<Arc<MockTransport>>>>,
    attempts: AtomicUsize,
    answer_gate: Option<Arc<Notify>>,
    script: Script,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Answers block until `gate` is notified
    pub fn with_answer_gate(gate: Arc<Notify>) -> Arc<Self> {
        Arc::new(Self {
            answer_gate: Some(gate),
            ..Default::default()
        })
    }

    pub fn scripted(script: Script) -> Arc<Self> {
        Arc::new(Self {
            script,
            ..Default::default()
        })
    }

    /// Calls to `create`, including failed ones
    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }

    /// Most recent transport created for `peer`
    pub fn transport(&self, peer: &str) -> Option<Arc<MockTransport>> {
        self.transports
            .lock()
            .unwrap()
            .get(&PeerId::from(peer))
            .and_then(|all| all.last().cloned())
    }

    pub fn created(&self, peer: &str) -> usize {
        self.transports
            .lock()
            .unwrap()
            .get(&PeerId::from(peer))
            .map_or(0, Vec::len)
    }
}

#[async_trait]
impl TransportFactory for MockFactory {
    async fn create(
        &self,
        peer: &PeerId,
        _config: &TransportConfig,
        events: TransportEventSender,
    ) -> anyhow::Result<Arc<dyn PeerTransport>> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        if self.script.fail_create {
            anyhow::bail!("no transport for {}", peer);
        }
        let remote = self
            .script
            .preset_remote
            .then(|| SessionDescription::offer(format!("preset-{}", peer)));
        let transport = Arc::new(MockTransport {
            peer: peer.clone(),
            events,
            calls: Mutex::new(Vec::new()),
            remote: Mutex::new(remote),
            channels: Mutex::new(Vec::new()),
            answer_gate: self.answer_gate.clone(),
            script: self.script,
            serial: AtomicUsize::new(0),
        });
        self.transports
            .lock()
            .unwrap()
            .entry(peer.clone())
            .or_default()
            .push(transport.clone());
        let transport: Arc<dyn PeerTransport> = transport;
        Ok(transport)
    }
}

#[derive(Default)]
pub struct RecordingBeacon {
    notices: Mutex<Vec<(String, PeerId)>>,
}

impl RecordingBeacon {
    pub fn notices(&self) -> Vec<(String, PeerId)> {
        self.notices.lock().unwrap().clone()
    }
}

impl LeaveBeacon for RecordingBeacon {
    fn notify(&self, api_url: &str, connection_id: &PeerId) {
        self.notices
            .lock()
            .unwrap()
            .push((api_url.to_string(), connection_id.clone()));
    }
}

pub fn options() -> SessionOptions {
    SessionOptions::new("lobby", "ws://relay.invalid", "http://api.invalid")
        .with_candidate_grace(Duration::from_millis(20))
}

/// A session wired to an in-memory relay and scripted transports
pub struct Harness {
    pub session: Session,
    pub events: mpsc::UnboundedReceiver<SessionEvent>,
    pub relay: RelayEnd,
    pub factory: Arc<MockFactory>,
    pub beacon: Arc<RecordingBeacon>,
}

impl Harness {
    pub fn start(factory: Arc<MockFactory>) -> Self {
        Self::start_with(factory, options())
    }

    pub fn start_with(factory: Arc<MockFactory>, options: SessionOptions) -> Self {
        init_tracing();
        let beacon = Arc::new(RecordingBeacon::default());
        let (link, relay) = RelayLink::pair();
        let (session, events) = Session::start(options, factory.clone(), beacon.clone(), link);
        Self {
            session,
            events,
            relay,
            factory,
            beacon,
        }
    }

    /// Start and consume the join command
    pub async fn joined(factory: Arc<MockFactory>, me: &str, peers: &[&str]) -> Self {
        Self::joined_with(factory, options(), me, peers).await
    }

    pub async fn joined_with(
        factory: Arc<MockFactory>,
        options: SessionOptions,
        me: &str,
        peers: &[&str],
    ) -> Self {
        let mut harness = Self::start_with(factory, options);
        assert_eq!(harness.next_command().await, ClientMessage::join("lobby"));
        harness.roster(me, peers);
        harness
    }

    pub fn deliver(&self, value: Value) {
        assert!(self.relay.deliver(value.to_string()), "session loop is gone");
    }

    pub fn roster(&self, me: &str, peers: &[&str]) {
        self.deliver(json!({"me": {"id": me}, "token": {"iceServers": []}, "peers": peers}));
    }

    pub fn offer_from(&self, sender: &str, sdp: &str) {
        self.deliver(json!({"sender": sender, "offer": {"type": "offer", "sdp": sdp}}));
    }

    pub fn answer_from(&self, sender: &str, sdp: &str) {
        self.deliver(json!({"sender": sender, "answer": {"type": "answer", "sdp": sdp}}));
    }

    pub fn candidate_from(&self, sender: &str, candidate: &str) {
        self.deliver(json!({
            "sender": sender,
            "candidate": {"candidate": candidate, "sdpMid": "0", "sdpMLineIndex": 0}
        }));
    }

    pub async fn next_command(&mut self) -> ClientMessage {
        timeout(WAIT, self.relay.commands.recv())
            .await
            .expect("timed out waiting for a relay command")
            .expect("relay link closed")
    }

    /// Next signaling command, skipping anything else
    pub async fn expect_signal(&mut self) -> (PeerId, Signal) {
        loop {
            if let ClientMessage::Message { message } = self.next_command().await {
                return (message.to, message.signal);
            }
        }
    }

    /// Signaling commands already queued for the relay
    pub fn queued_signals(&mut self) -> Vec<(PeerId, Signal)> {
        let mut signals = Vec::new();
        while let Ok(command) = self.relay.commands.try_recv() {
            if let ClientMessage::Message { message } = command {
                signals.push((message.to, message.signal));
            }
        }
        signals
    }

    /// Next event matching `wanted`, discarding the ones before it
    pub async fn expect_event(&mut self, wanted: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        let deadline = Instant::now() + WAIT;
        loop {
            let event = tokio::time::timeout_at(deadline, self.events.recv())
                .await
                .expect("timed out waiting for a session event")
                .expect("event stream ended");
            if wanted(&event) {
                return event;
            }
        }
    }

    /// Let in-flight work reach the loop and get processed
    pub async fn settle(&self) {
        self.session.status().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        self.session.status().await.unwrap();
    }

    /// Events emitted so far, after settling
    pub async fn drain_events(&mut self) -> Vec<SessionEvent> {
        self.settle().await;
        let mut events = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            events.push(event);
        }
        events
    }

    pub async fn transport(&self, peer: &str) -> Arc<MockTransport> {
        let factory = self.factory.clone();
        eventually(|| factory.transport(peer)).await
    }

    pub async fn wait_for_peers(&self, wanted: impl Fn(&[PeerSummary]) -> bool) -> Vec<PeerSummary> {
        let deadline = Instant::now() + WAIT;
        loop {
            let peers = self.session.peers().await.unwrap();
            if wanted(&peers) {
                return peers;
            }
            assert!(Instant::now() < deadline, "peers never matched: {:?}", peers);
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Poll `probe` until it yields a value
pub async fn eventually<T>(mut probe: impl FnMut() -> Option<T>) -> T {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(value) = probe() {
            return value;
        }
        assert!(Instant::now() < deadline, "condition not reached in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
