//! webrtc-rs implementation of the transport seam

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use meshcall_media::{LocalTrack, RemoteTrack};
use meshcall_protocol::{IceCandidate, PeerId, SdpKind, SessionDescription, TransportConfig};
use std::fmt;
use std::sync::Arc;
use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::{APIBuilder, API};
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::RTCIceCandidateInit;
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::sdp_type::RTCSdpType;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;
use webrtc::track::track_local::TrackLocal;

use super::{
    ChannelOrigin, ConnectionState, DataChannel, PeerTransport, TransportEvent,
    TransportEventSender, TransportFactory,
};

/// Builds peer connections sharing one media engine setup
pub struct WebRtcTransportFactory {
    api: Arc<API>,
}

impl WebRtcTransportFactory {
    pub fn new() -> Result<Self> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs()?;

        let registry = register_default_interceptors(Registry::new(), &mut media_engine)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        Ok(Self { api: Arc::new(api) })
    }
}

#[async_trait]
impl TransportFactory for WebRtcTransportFactory {
    async fn create(
        &self,
        peer: &PeerId,
        config: &TransportConfig,
        events: TransportEventSender,
    ) -> Result<Arc<dyn PeerTransport>> {
        let ice_servers: Vec<RTCIceServer> = config
            .ice_servers
            .iter()
            .map(|server| RTCIceServer {
                urls: server.urls.clone(),
                username: server.username.clone().unwrap_or_default(),
                credential: server.credential.clone().unwrap_or_default(),
                ..Default::default()
            })
            .collect();

        let rtc_config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        let pc = Arc::new(self.api.new_peer_connection(rtc_config).await?);
        tracing::debug!("Created peer connection for {}", peer);

        Ok(Arc::new(WebRtcTransport::wire(peer.clone(), pc, events)))
    }
}

/// One `RTCPeerConnection` with its callbacks routed to a [`TransportEventSender`]
pub struct WebRtcTransport {
    peer: PeerId,
    pc: Arc<RTCPeerConnection>,
    events: TransportEventSender,
}

impl WebRtcTransport {
    fn wire(peer: PeerId, pc: Arc<RTCPeerConnection>, events: TransportEventSender) -> Self {
        let tx = events.clone();
        pc.on_ice_candidate(Box::new(move |candidate| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(candidate) = candidate {
                    match candidate.to_json() {
                        Ok(json) => {
                            let _ = tx.send(TransportEvent::Candidate(IceCandidate {
                                candidate: json.candidate,
                                sdp_mid: json.sdp_mid,
                                sdp_mline_index: json.sdp_mline_index,
                                username_fragment: json.username_fragment,
                            }));
                        }
                        Err(e) => tracing::warn!("Failed to serialize local candidate: {}", e),
                    }
                }
            })
        }));

        let tx = events.clone();
        let track_peer = peer.clone();
        pc.on_track(Box::new(move |track, _receiver, _transceiver| {
            tracing::info!(
                "Remote track from {}: id {}, stream {}, kind {:?}",
                track_peer,
                track.id(),
                track.stream_id(),
                track.kind()
            );
            let tx = tx.clone();
            Box::pin(async move {
                match RemoteTrack::from_rtc(track) {
                    Some(remote) => {
                        let _ = tx.send(TransportEvent::Track(remote));
                    }
                    None => tracing::warn!("Ignoring remote track of unknown kind"),
                }
            })
        }));

        let tx = events.clone();
        pc.on_negotiation_needed(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::NegotiationNeeded);
            })
        }));

        let tx = events.clone();
        pc.on_peer_connection_state_change(Box::new(move |state: RTCPeerConnectionState| {
            let tx = tx.clone();
            Box::pin(async move {
                if let Some(state) = connection_state(state) {
                    let _ = tx.send(TransportEvent::ConnectionState(state));
                }
            })
        }));

        let tx = events.clone();
        pc.on_data_channel(Box::new(move |channel: Arc<RTCDataChannel>| {
            let tx = tx.clone();
            Box::pin(async move {
                tracing::debug!("Remote opened data channel {}", channel.label());
                let handle = RtcDataChannel::wire(channel, ChannelOrigin::Remote, tx.clone());
                let _ = tx.send(TransportEvent::DataChannel(handle));
            })
        }));

        Self { peer, pc, events }
    }
}

#[async_trait]
impl PeerTransport for WebRtcTransport {
    async fn create_offer(&self) -> Result<SessionDescription> {
        let offer = self.pc.create_offer(None).await?;
        from_rtc(offer)
    }

    async fn create_answer(&self) -> Result<SessionDescription> {
        let answer = self.pc.create_answer(None).await?;
        from_rtc(answer)
    }

    async fn set_local_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_local_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()> {
        self.pc.set_remote_description(to_rtc(desc)?).await?;
        Ok(())
    }

    async fn has_remote_description(&self) -> bool {
        self.pc.remote_description().await.is_some()
    }

    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()> {
        let init = RTCIceCandidateInit {
            candidate: candidate.candidate,
            sdp_mid: candidate.sdp_mid,
            sdp_mline_index: candidate.sdp_mline_index,
            username_fragment: candidate.username_fragment,
        };
        self.pc.add_ice_candidate(init).await?;
        Ok(())
    }

    async fn create_data_channel(&self, label: &str) -> Result<Arc<dyn DataChannel>> {
        let channel = self.pc.create_data_channel(label, None).await?;
        Ok(RtcDataChannel::wire(channel, ChannelOrigin::Local, self.events.clone()))
    }

    async fn add_track(&self, track: &LocalTrack) -> Result<()> {
        let rtc_track: Arc<dyn TrackLocal + Send + Sync> = track.rtc_track();
        let sender = self.pc.add_track(rtc_track).await?;

        // RTCP has to be drained for interceptors to work
        tokio::spawn(async move {
            let mut rtcp_buf = vec![0u8; 1500];
            while sender.read(&mut rtcp_buf).await.is_ok() {}
        });

        tracing::debug!("Added local {} track {} for {}", track.kind(), track.id(), self.peer);
        Ok(())
    }

    async fn remove_tracks(&self) -> Result<()> {
        for sender in self.pc.get_senders().await {
            if sender.track().await.is_some() {
                self.pc.remove_track(&sender).await?;
            }
        }
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.pc.close().await?;
        tracing::debug!("Closed peer connection for {}", self.peer);
        Ok(())
    }
}

/// Data channel handle with its callbacks routed to the transport's events
pub struct RtcDataChannel {
    inner: Arc<RTCDataChannel>,
}

impl RtcDataChannel {
    fn wire(
        channel: Arc<RTCDataChannel>,
        origin: ChannelOrigin,
        events: TransportEventSender,
    ) -> Arc<dyn DataChannel> {
        let tx = events.clone();
        channel.on_open(Box::new(move || {
            Box::pin(async move {
                let _ = tx.send(TransportEvent::ChannelOpen { origin });
            })
        }));

        let tx = events.clone();
        channel.on_close(Box::new(move || {
            let tx = tx.clone();
            Box::pin(async move {
                let _ = tx.send(TransportEvent::ChannelClosed { origin });
            })
        }));

        let tx = events;
        channel.on_message(Box::new(move |msg: DataChannelMessage| {
            let tx = tx.clone();
            Box::pin(async move {
                match String::from_utf8(msg.data.to_vec()) {
                    Ok(text) => {
                        let _ = tx.send(TransportEvent::ChannelMessage(text));
                    }
                    Err(_) => tracing::warn!("Dropping non-UTF-8 data channel message"),
                }
            })
        }));

        Arc::new(Self { inner: channel })
    }
}

impl fmt::Debug for RtcDataChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RtcDataChannel")
            .field("label", &self.inner.label())
            .field("state", &self.inner.ready_state())
            .finish()
    }
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    fn label(&self) -> String {
        self.inner.label().to_string()
    }

    fn is_open(&self) -> bool {
        self.inner.ready_state() == RTCDataChannelState::Open
    }

    async fn send_text(&self, text: String) -> Result<()> {
        self.inner.send_text(text).await?;
        Ok(())
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await?;
        Ok(())
    }
}

fn connection_state(state: RTCPeerConnectionState) -> Option<ConnectionState> {
    match state {
        RTCPeerConnectionState::New => Some(ConnectionState::New),
        RTCPeerConnectionState::Connecting => Some(ConnectionState::Connecting),
        RTCPeerConnectionState::Connected => Some(ConnectionState::Connected),
        RTCPeerConnectionState::Disconnected => Some(ConnectionState::Disconnected),
        RTCPeerConnectionState::Failed => Some(ConnectionState::Failed),
        RTCPeerConnectionState::Closed => Some(ConnectionState::Closed),
        _ => None,
    }
}

fn from_rtc(desc: RTCSessionDescription) -> Result<SessionDescription> {
    let kind = match desc.sdp_type {
        RTCSdpType::Offer => SdpKind::Offer,
        RTCSdpType::Answer => SdpKind::Answer,
        RTCSdpType::Pranswer => SdpKind::Pranswer,
        RTCSdpType::Rollback => SdpKind::Rollback,
        other => return Err(anyhow!("Unsupported description type {:?}", other)),
    };
    Ok(SessionDescription {
        kind,
        sdp: desc.sdp,
    })
}

fn to_rtc(desc: SessionDescription) -> Result<RTCSessionDescription> {
    let rtc = match desc.kind {
        SdpKind::Offer => RTCSessionDescription::offer(desc.sdp)?,
        SdpKind::Answer => RTCSessionDescription::answer(desc.sdp)?,
        SdpKind::Pranswer => RTCSessionDescription::pranswer(desc.sdp)?,
        SdpKind::Rollback => return Err(anyhow!("Rollback descriptions are not supported")),
    };
    Ok(rtc)
}
