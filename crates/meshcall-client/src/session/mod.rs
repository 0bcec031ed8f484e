//! Room session orchestration
//!
//! [`Session`] is a cheap handle onto a single loop task that owns every
//! peer session of the room. All state changes happen on that task, in the
//! order their causes arrive.

mod candidates;
mod controller;
mod events;
mod peer;
mod registry;
mod tracks;

pub use candidates::{Admission, IceCandidateQueue};
pub use events::{
    ControllerState, DisconnectReason, PeerState, PeerSummary, Role, SessionEvent, SessionStatus,
};
pub use tracks::{PAIR_SIZE, TrackAggregator};

use meshcall_media::{LocalStream, MediaKind};
use meshcall_protocol::PeerId;
use serde_json::Value;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};

use crate::config::SessionOptions;
use crate::error::{Result, SessionError};
use crate::relay::{HttpLeaveBeacon, LeaveBeacon, RelayEvent, RelayLink};
use crate::transport::{TransportFactory, WebRtcTransportFactory};
use controller::SessionController;
use events::{Command, LoopEvent};

/// Handle to a joined room
#[derive(Clone)]
pub struct Session {
    tx: mpsc::UnboundedSender<LoopEvent>,
}

impl Session {
    /// Join over WebSocket with the webrtc-rs transport and the HTTP
    /// leave beacon
    pub async fn join(options: SessionOptions) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        let factory = WebRtcTransportFactory::new()?;
        let beacon = HttpLeaveBeacon::new(options.beacon_timeout);
        Self::join_with(options, Arc::new(factory), Arc::new(beacon)).await
    }

    /// Join over WebSocket with custom transport and beacon
    pub async fn join_with(
        options: SessionOptions,
        factory: Arc<dyn TransportFactory>,
        beacon: Arc<dyn LeaveBeacon>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<SessionEvent>)> {
        let link = RelayLink::connect(&options.relay_url).await?;
        Ok(Self::start(options, factory, beacon, link))
    }

    /// Run a session over an already open relay link. The join command is
    /// sent immediately.
    pub fn start(
        options: SessionOptions,
        factory: Arc<dyn TransportFactory>,
        beacon: Arc<dyn LeaveBeacon>,
        link: RelayLink,
    ) -> (Self, mpsc::UnboundedReceiver<SessionEvent>) {
        let (loop_tx, loop_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (outbound, mut inbound) = link.into_parts();

        let mut controller = SessionController::new(
            options,
            factory,
            beacon,
            outbound,
            events_tx,
            loop_tx.downgrade(),
        );
        controller.begin_join();

        let relay_tx = loop_tx.clone();
        tokio::spawn(async move {
            let mut closed = false;
            while let Some(event) = inbound.recv().await {
                closed = event == RelayEvent::Closed;
                if relay_tx.send(LoopEvent::Relay(event)).is_err() || closed {
                    break;
                }
            }
            if !closed {
                let _ = relay_tx.send(LoopEvent::Relay(RelayEvent::Closed));
            }
        });

        tokio::spawn(controller.run(loop_rx));

        (Self { tx: loop_tx }, events_rx)
    }

    fn command(&self, command: Command) -> Result<()> {
        self.tx
            .send(LoopEvent::Command(command))
            .map_err(|_| SessionError::Closed)
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> Result<T> {
        let (reply, response) = oneshot::channel();
        self.command(make(reply))?;
        response.await.map_err(|_| SessionError::Closed)
    }

    /// Attach a local stream to every current and future peer
    pub fn publish(&self, stream: LocalStream) -> Result<()> {
        self.command(Command::Publish(stream))
    }

    /// Tell peers we are withdrawing, stop local tracks and detach them
    pub fn unpublish(&self) -> Result<()> {
        self.command(Command::Unpublish)
    }

    /// Returns the new enabled state of the audio tracks
    pub async fn toggle_audio(&self) -> Result<bool> {
        self.request(|reply| Command::Toggle(MediaKind::Audio, reply)).await?
    }

    pub async fn toggle_video(&self) -> Result<bool> {
        self.request(|reply| Command::Toggle(MediaKind::Video, reply)).await?
    }

    /// Send `payload` on every open data channel. Returns how many peers it
    /// was queued for.
    pub async fn send_to_all(&self, payload: Value) -> Result<usize> {
        self.request(|reply| Command::SendToAll(payload, reply)).await
    }

    /// Tear down every peer and close the relay link. Calling it again is a
    /// no-op.
    pub async fn leave(&self) -> Result<()> {
        self.request(Command::Leave).await
    }

    pub async fn status(&self) -> Result<SessionStatus> {
        self.request(Command::Status).await
    }

    /// Id assigned by the relay, once the roster arrived
    pub async fn connection_id(&self) -> Result<Option<PeerId>> {
        Ok(self.status().await?.own_id)
    }

    pub async fn peers(&self) -> Result<Vec<PeerSummary>> {
        Ok(self.status().await?.peers)
    }
}
