//! meshcall client library
//!
//! Orchestrates a full mesh of WebRTC links between the participants of a
//! room. Signaling goes through a relay; each remote participant gets its
//! own peer session with an independent negotiation state machine.

pub mod config;
pub mod error;
pub mod relay;
pub mod session;
pub mod transport;

pub use config::SessionOptions;
pub use error::{Result, SessionError};
pub use session::{
    ControllerState, DisconnectReason, PeerState, PeerSummary, Role, Session, SessionEvent,
    SessionStatus,
};

pub use meshcall_media as media;
pub use meshcall_protocol as protocol;
