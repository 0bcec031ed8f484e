//! Connection to the signaling relay and the out-of-band leave notice

mod beacon;
mod websocket;

pub use beacon::{HttpLeaveBeacon, LeaveBeacon};
pub use websocket::{RelayEnd, RelayEvent, RelayLink};
