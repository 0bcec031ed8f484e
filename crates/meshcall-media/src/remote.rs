//! Inbound tracks and the composite stream built from them

use std::fmt;
use std::sync::Arc;

use tokio::sync::watch;
use webrtc::rtp::packet::Packet;
use webrtc::track::track_remote::TrackRemote;

use crate::codec::MediaKind;
use crate::error::{MediaError, Result};

/// A track received from a remote peer.
///
/// Every clone shares one end signal: once any holder calls [`end`](Self::end)
/// (or [`read_rtp`](Self::read_rtp) observes the source closing) all
/// subscribers are told. Teardown of the peer connection itself is reported
/// separately through its connection state.
#[derive(Clone)]
pub struct RemoteTrack {
    id: String,
    kind: MediaKind,
    stream_id: String,
    source: Option<Arc<TrackRemote>>,
    ended: Arc<watch::Sender<bool>>,
}

impl RemoteTrack {
    /// A track without a transport behind it
    pub fn new(id: impl Into<String>, kind: MediaKind, stream_id: impl Into<String>) -> Self {
        let (ended, _) = watch::channel(false);
        Self {
            id: id.into(),
            kind,
            stream_id: stream_id.into(),
            source: None,
            ended: Arc::new(ended),
        }
    }

    /// Wrap a track surfaced by the WebRTC engine; `None` for tracks of
    /// unspecified kind
    pub fn from_rtc(track: Arc<TrackRemote>) -> Option<Self> {
        let kind = MediaKind::from_codec_type(track.kind())?;
        let mut remote = Self::new(track.id(), kind, track.stream_id());
        remote.source = Some(track);
        Some(remote)
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn kind(&self) -> MediaKind {
        self.kind
    }

    pub fn stream_id(&self) -> &str {
        &self.stream_id
    }

    /// The engine's track, for handing to a decoder.
    ///
    /// Reads made directly on it bypass the end hook: a closed source is only
    /// noticed by [`read_rtp`](Self::read_rtp). Consumers reading here must
    /// call [`end`](Self::end) themselves when the source closes.
    pub fn rtc_track(&self) -> Option<&Arc<TrackRemote>> {
        self.source.as_ref()
    }

    pub fn is_ended(&self) -> bool {
        *self.ended.borrow()
    }

    /// Mark the track as ended; only the first call has an effect
    pub fn end(&self) {
        if !self.ended.send_replace(true) {
            tracing::debug!("Remote {} track {} ended", self.kind, self.id);
        }
    }

    /// Receiver that flips to `true` when the track ends
    pub fn subscribe_ended(&self) -> watch::Receiver<bool> {
        self.ended.subscribe()
    }

    /// Read the next RTP packet. A closed source ends the track.
    pub async fn read_rtp(&self) -> Result<Packet> {
        if self.is_ended() {
            return Err(MediaError::TrackEnded(self.id.clone()));
        }
        let source = self
            .source
            .as_ref()
            .ok_or_else(|| MediaError::Detached(self.id.clone()))?;

        match source.read_rtp().await {
            Ok((packet, _attributes)) => Ok(packet),
            Err(e) => {
                let error_msg = e.to_string();
                if error_msg.contains("closed") || error_msg.contains("RTPReceiver must not be nil") {
                    self.end();
                    return Err(MediaError::TrackEnded(self.id.clone()));
                }
                Err(e.into())
            }
        }
    }
}

impl fmt::Debug for RemoteTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RemoteTrack")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("stream_id", &self.stream_id)
            .field("ended", &self.is_ended())
            .finish()
    }
}

/// Composite stream of one peer's inbound tracks
#[derive(Debug, Clone, Default)]
pub struct AggregateStream {
    tracks: Vec<RemoteTrack>,
}

impl AggregateStream {
    pub fn new(tracks: Vec<RemoteTrack>) -> Self {
        Self { tracks }
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub fn push(&mut self, track: RemoteTrack) {
        self.tracks.push(track);
    }

    pub fn audio(&self) -> impl Iterator<Item = &RemoteTrack> {
        self.tracks.iter().filter(|t| t.kind() == MediaKind::Audio)
    }

    pub fn video(&self) -> impl Iterator<Item = &RemoteTrack> {
        self.tracks.iter().filter(|t| t.kind() == MediaKind::Video)
    }

    pub fn len(&self) -> usize {
        self.tracks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tracks.is_empty()
    }
}
