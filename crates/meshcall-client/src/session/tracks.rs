use meshcall_media::{AggregateStream, RemoteTrack};

/// Number of tracks that make up a complete audio/video pair
pub const PAIR_SIZE: usize = 2;

/// Collects one peer's inbound tracks and assembles the aggregate stream
/// once a pair is present.
#[derive(Debug, Default)]
pub struct TrackAggregator {
    tracks: Vec<RemoteTrack>,
    stream: Option<AggregateStream>,
}

impl TrackAggregator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a track. Returns the aggregate stream exactly once, on the call
    /// that brings the collection to [`PAIR_SIZE`].
    pub fn push(&mut self, track: RemoteTrack) -> Option<AggregateStream> {
        if self.contains(track.id()) {
            tracing::debug!("Track {} already collected", track.id());
            return None;
        }
        self.tracks.push(track.clone());

        match &mut self.stream {
            Some(stream) => {
                stream.push(track);
                None
            }
            None if self.tracks.len() >= PAIR_SIZE => {
                let stream = AggregateStream::new(self.tracks.clone());
                self.stream = Some(stream.clone());
                Some(stream)
            }
            None => None,
        }
    }

    pub fn contains(&self, track_id: &str) -> bool {
        self.tracks.iter().any(|t| t.id() == track_id)
    }

    pub fn tracks(&self) -> &[RemoteTrack] {
        &self.tracks
    }

    pub fn stream(&self) -> Option<&AggregateStream> {
        self.stream.as_ref()
    }
}
