use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ProtocolError;
use crate::types::{IceCandidate, PeerId, PeerRef, RoomRef, SessionDescription, TransportConfig};

/// Commands sent from a participant to the relay
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Join a room; the relay answers with a roster
    Join { room: RoomRef },

    /// Signaling payload the relay forwards to `message.to`
    Message { message: SignalEnvelope },
}

impl ClientMessage {
    pub fn join(room: impl Into<String>) -> Self {
        ClientMessage::Join {
            room: RoomRef { name: room.into() },
        }
    }

    pub fn signal(to: PeerId, signal: Signal) -> Self {
        ClientMessage::Message {
            message: SignalEnvelope { signal, to },
        }
    }
}

/// `{<kind>: <payload>, to}` body of an outbound signaling command
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalEnvelope {
    #[serde(flatten)]
    pub signal: Signal,
    pub to: PeerId,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Signal {
    Offer(SessionDescription),
    Answer(SessionDescription),
    Candidate(IceCandidate),
}

/// Roster delivered once the relay has accepted a join
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Roster {
    pub me: PeerRef,
    #[serde(default)]
    pub token: TransportConfig,
    #[serde(default)]
    pub peers: Vec<PeerId>,
}

/// Messages delivered by the relay
#[derive(Debug, Clone, PartialEq)]
pub enum RelayMessage {
    /// Own id, transport configuration and the peers already in the room
    Roster(Roster),

    /// Another participant joined the room
    Joined(PeerRef),

    /// Offer relayed from `sender`
    Offer {
        sender: PeerId,
        offer: SessionDescription,
    },

    /// Answer relayed from `sender`
    Answer {
        sender: PeerId,
        answer: SessionDescription,
    },

    /// Candidate relayed from `sender`; `None` marks the end of gathering
    Candidate {
        sender: PeerId,
        candidate: Option<IceCandidate>,
    },

    /// Plain text relayed outside of any data channel
    Text(String),
}

impl RelayMessage {
    /// Classify one relay text frame.
    ///
    /// Shapes are told apart by their distinguishing key, checked in the
    /// order offer, answer, candidate, me, joined, message.
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let Value::Object(mut map) = value else {
            return Err(ProtocolError::NotAnObject);
        };

        if let Some(offer) = take(&mut map, "offer") {
            return Ok(RelayMessage::Offer {
                sender: sender(&mut map)?,
                offer: serde_json::from_value(offer)?,
            });
        }

        if let Some(answer) = take(&mut map, "answer") {
            return Ok(RelayMessage::Answer {
                sender: sender(&mut map)?,
                answer: serde_json::from_value(answer)?,
            });
        }

        if let Some(candidate) = map.remove("candidate") {
            let candidate = match candidate {
                Value::Null => None,
                other => Some(serde_json::from_value(other)?),
            };
            return Ok(RelayMessage::Candidate {
                sender: sender(&mut map)?,
                candidate,
            });
        }

        if map.get("me").is_some_and(|me| !me.is_null()) {
            return Ok(RelayMessage::Roster(serde_json::from_value(Value::Object(map))?));
        }

        if let Some(joined) = take(&mut map, "joined") {
            return Ok(RelayMessage::Joined(serde_json::from_value(joined)?));
        }

        if let Some(message) = take(&mut map, "message") {
            return match message {
                Value::String(text) => Ok(RelayMessage::Text(text)),
                _ => Err(ProtocolError::InvalidField("message")),
            };
        }

        Err(ProtocolError::UnknownShape(map.keys().cloned().collect()))
    }

    /// Peer the message originates from, for signaling messages
    pub fn sender(&self) -> Option<&PeerId> {
        match self {
            RelayMessage::Offer { sender, .. }
            | RelayMessage::Answer { sender, .. }
            | RelayMessage::Candidate { sender, .. } => Some(sender),
            _ => None,
        }
    }
}

fn take(map: &mut Map<String, Value>, key: &str) -> Option<Value> {
    map.remove(key).filter(|value| !value.is_null())
}

fn sender(map: &mut Map<String, Value>) -> Result<PeerId, ProtocolError> {
    match take(map, "sender") {
        Some(Value::String(id)) => Ok(PeerId::new(id)),
        Some(_) => Err(ProtocolError::InvalidField("sender")),
        None => Err(ProtocolError::MissingField("sender")),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChannelState {
    Closed,
}

/// Messages exchanged directly between peers over the data channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PeerMessage {
    /// The sender withdrew its media and is going away
    State { state: ChannelState, sender: PeerId },

    /// Application payload
    Data { msg: Value },
}

impl PeerMessage {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        Ok(serde_json::from_str(text)?)
    }

    pub fn closed(sender: PeerId) -> Self {
        PeerMessage::State {
            state: ChannelState::Closed,
            sender,
        }
    }

    pub fn to_text(&self) -> Result<String, ProtocolError> {
        Ok(serde_json::to_string(self)?)
    }
}
