//! Wire definitions shared by meshcall participants
//!
//! Covers the commands a participant sends to the relay, the messages the
//! relay delivers back, and the messages peers exchange over data channels.

pub mod error;
pub mod messages;
pub mod types;

pub use error::ProtocolError;
pub use messages::*;
pub use types::*;
