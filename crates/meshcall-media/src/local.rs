//! Locally published tracks
//!
//! Capture pipelines live outside this crate; they push encoded samples into
//! a [`LocalTrack`], which drops them while the track is disabled or stopped.

use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use uuid::Uuid;
use webrtc::media::Sample;
use webrtc::rtp_transceiver::rtp_codec::RTCRtpCodecCapability;
use webrtc::track::track_local::TrackLocal;
use webrtc::track::track_local::track_local_static_sample::TrackLocalStaticSample;

use crate::codec::MediaKind;
use crate::error::{MediaError, Result};

struct LocalTrackInner {
    kind: MediaKind,
    rtc: Arc<TrackLocalStaticSample>,
    enabled: AtomicBool,
    live: AtomicBool,
}

/// A local capture track that can be attached to any number of transports
#[derive(Clone)]
pub struct LocalTrack {
    inner: Arc<LocalTrackInner>,
}

impl LocalTrack {
    /// Create a track using the default codec for `kind`
    pub fn new(kind: MediaKind, id: impl Into<String>, stream_id: impl Into<String>) -> Self {
        Self::with_codec(kind, kind.default_capability(), id, stream_id)
    }

    pub fn with_codec(
        kind: MediaKind,
        codec: RTCRtpCodecCapability,
        id: impl Into<String>,
        stream_id: impl Into<String>,
    ) -> Self {
        let rtc = Arc::new(TrackLocalStaticSample::new(codec, id.into(), stream_id.into()));
        Self {
            inner: Arc::new(LocalTrackInner {
                kind,
                rtc,
                enabled: AtomicBool::new(true),
                live: AtomicBool::new(true),
            }),
        }
    }

    pub fn id(&self) -> &str {
        self.inner.rtc.id()
    }

    pub fn stream_id(&self) -> &str {
        self.inner.rtc.stream_id()
    }

    pub fn kind(&self) -> MediaKind {
        self.inner.kind
    }

    pub fn is_enabled(&self) -> bool {
        self.inner.enabled.load(Ordering::SeqCst)
    }

    pub fn set_enabled(&self, enabled: bool) {
        self.inner.enabled.store(enabled, Ordering::SeqCst);
    }

    pub fn is_live(&self) -> bool {
        self.inner.live.load(Ordering::SeqCst)
    }

    /// Stop the track permanently. Samples written afterwards are rejected.
    pub fn stop(&self) {
        if self.inner.live.swap(false, Ordering::SeqCst) {
            tracing::debug!("Stopped local {} track {}", self.kind(), self.id());
        }
    }

    /// Track handed to the transport engine
    pub fn rtc_track(&self) -> Arc<TrackLocalStaticSample> {
        self.inner.rtc.clone()
    }

    /// Write an encoded sample. Returns `Ok(false)` when the sample was
    /// dropped because the track is disabled.
    pub async fn write_sample(&self, sample: &Sample) -> Result<bool> {
        if !self.is_live() {
            return Err(MediaError::TrackStopped(self.id().to_string()));
        }
        if !self.is_enabled() {
            return Ok(false);
        }
        self.inner.rtc.write_sample(sample).await?;
        Ok(true)
    }
}

impl fmt::Debug for LocalTrack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LocalTrack")
            .field("id", &self.id())
            .field("kind", &self.kind())
            .field("enabled", &self.is_enabled())
            .field("live", &self.is_live())
            .finish()
    }
}

/// Enabled flags per kind; `None` when the stream carries no track of that kind
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LocalStreamState {
    pub audio_enabled: Option<bool>,
    pub video_enabled: Option<bool>,
    pub track_count: usize,
}

/// The set of local tracks published to every peer
#[derive(Debug, Clone)]
pub struct LocalStream {
    id: String,
    tracks: Vec<LocalTrack>,
}

impl LocalStream {
    pub fn new(tracks: Vec<LocalTrack>) -> Self {
        let id = tracks
            .first()
            .map(|t| t.stream_id().to_string())
            .unwrap_or_else(|| Uuid::new_v4().to_string());
        Self { id, tracks }
    }

    /// One audio and one video track sharing a fresh stream id
    pub fn audio_video() -> Self {
        let stream_id = Uuid::new_v4().to_string();
        Self {
            tracks: vec![
                LocalTrack::new(MediaKind::Audio, "audio", stream_id.clone()),
                LocalTrack::new(MediaKind::Video, "video", stream_id.clone()),
            ],
            id: stream_id,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn tracks(&self) -> &[LocalTrack] {
        &self.tracks
    }

    pub fn tracks_of(&self, kind: MediaKind) -> impl Iterator<Item = &LocalTrack> {
        self.tracks.iter().filter(move |t| t.kind() == kind)
    }

    pub fn audio_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks_of(MediaKind::Audio)
    }

    pub fn video_tracks(&self) -> impl Iterator<Item = &LocalTrack> {
        self.tracks_of(MediaKind::Video)
    }

    /// Flip every track of `kind` and return the new enabled state.
    ///
    /// Tracks of the same kind are kept in step: if any of them is enabled
    /// they are all disabled, otherwise they are all enabled.
    pub fn toggle(&self, kind: MediaKind) -> Result<bool> {
        let tracks: Vec<&LocalTrack> = self.tracks_of(kind).collect();
        if tracks.is_empty() {
            return Err(MediaError::NoTrack(kind));
        }

        let enabled = !tracks.iter().any(|t| t.is_enabled());
        for track in tracks {
            track.set_enabled(enabled);
        }
        tracing::info!("Local {} {}", kind, if enabled { "enabled" } else { "disabled" });
        Ok(enabled)
    }

    pub fn stop(&self) {
        for track in &self.tracks {
            track.stop();
        }
    }

    pub fn state(&self) -> LocalStreamState {
        let kind_state = |kind| {
            let mut tracks = self.tracks_of(kind).peekable();
            tracks.peek()?;
            Some(tracks.any(|t| t.is_enabled()))
        };

        LocalStreamState {
            audio_enabled: kind_state(MediaKind::Audio),
            video_enabled: kind_state(MediaKind::Video),
            track_count: self.tracks.len(),
        }
    }
}
