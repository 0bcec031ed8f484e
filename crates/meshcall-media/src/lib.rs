//! Media handles for meshcall
//!
//! This crate models the media side of a session without doing any capture
//! or decoding itself:
//! - Local tracks with per-kind enable toggles
//! - Remote tracks carrying an end signal
//! - Aggregate streams assembled from a peer's inbound tracks

pub mod codec;
pub mod error;
pub mod local;
pub mod remote;

pub use codec::MediaKind;
pub use error::MediaError;
pub use local::{LocalStream, LocalStreamState, LocalTrack};
pub use remote::{AggregateStream, RemoteTrack};
