use thiserror::Error;

use crate::codec::MediaKind;

#[derive(Error, Debug)]
pub enum MediaError {
    #[error("No local stream attached")]
    NoLocalStream,

    #[error("Local stream has no {0} track")]
    NoTrack(MediaKind),

    #[error("Track {0} has been stopped")]
    TrackStopped(String),

    #[error("Track {0} is not backed by a transport")]
    Detached(String),

    #[error("Track {0} has ended")]
    TrackEnded(String),

    #[error("WebRTC error: {0}")]
    Rtc(#[from] webrtc::Error),
}

pub type Result<T> = std::result::Result<T, MediaError>;
