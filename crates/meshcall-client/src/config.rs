use serde::Deserialize;
use std::time::Duration;

use crate::error::Result;

const DEFAULT_CANDIDATE_GRACE_MS: u64 = 250;
const DEFAULT_OP_TIMEOUT_MS: u64 = 10_000;
const DEFAULT_BEACON_TIMEOUT_MS: u64 = 3_000;

/// Prefix of the data channel label; the remote peer id is appended
pub const CHANNEL_LABEL_PREFIX: &str = "textMessageChannel";

/// Settings for one room session
#[derive(Debug, Clone)]
pub struct SessionOptions {
    pub room: String,
    pub relay_url: String,
    /// Base url of the HTTP api receiving the leave beacon
    pub api_url: String,
    /// Fallback delay after which queued candidates re-check the transport's
    /// remote description
    pub candidate_grace: Duration,
    /// Upper bound for a single transport operation
    pub op_timeout: Duration,
    pub beacon_timeout: Duration,
}

#[derive(Debug, Deserialize)]
struct RawOptions {
    room: String,
    relay_url: String,
    api_url: String,
    candidate_grace_ms: u64,
    op_timeout_ms: u64,
    beacon_timeout_ms: u64,
}

impl SessionOptions {
    pub fn new(
        room: impl Into<String>,
        relay_url: impl Into<String>,
        api_url: impl Into<String>,
    ) -> Self {
        Self {
            room: room.into(),
            relay_url: relay_url.into(),
            api_url: api_url.into(),
            candidate_grace: Duration::from_millis(DEFAULT_CANDIDATE_GRACE_MS),
            op_timeout: Duration::from_millis(DEFAULT_OP_TIMEOUT_MS),
            beacon_timeout: Duration::from_millis(DEFAULT_BEACON_TIMEOUT_MS),
        }
    }

    /// Load from `MESHCALL_ROOM`, `MESHCALL_RELAY_URL`, `MESHCALL_API_URL`
    /// and the optional `MESHCALL_*_MS` timing overrides
    pub fn from_env() -> Result<Self> {
        let source = config::Config::builder()
            .add_source(config::Environment::with_prefix("MESHCALL"))
            .build()?;
        Self::from_config(source)
    }

    /// Read options from an already assembled configuration
    pub fn from_config(source: config::Config) -> Result<Self> {
        let source = config::Config::builder()
            .set_default("candidate_grace_ms", DEFAULT_CANDIDATE_GRACE_MS)?
            .set_default("op_timeout_ms", DEFAULT_OP_TIMEOUT_MS)?
            .set_default("beacon_timeout_ms", DEFAULT_BEACON_TIMEOUT_MS)?
            .add_source(source)
            .build()?;
        let raw: RawOptions = source.try_deserialize()?;

        Ok(Self {
            room: raw.room,
            relay_url: raw.relay_url,
            api_url: raw.api_url,
            candidate_grace: Duration::from_millis(raw.candidate_grace_ms),
            op_timeout: Duration::from_millis(raw.op_timeout_ms),
            beacon_timeout: Duration::from_millis(raw.beacon_timeout_ms),
        })
    }

    pub fn with_candidate_grace(mut self, grace: Duration) -> Self {
        self.candidate_grace = grace;
        self
    }

    pub fn with_op_timeout(mut self, timeout: Duration) -> Self {
        self.op_timeout = timeout;
        self
    }

    pub fn with_beacon_timeout(mut self, timeout: Duration) -> Self {
        self.beacon_timeout = timeout;
        self
    }
}

/// Label of the data channel opened towards `peer`
pub fn channel_label(peer: &meshcall_protocol::PeerId) -> String {
    format!("{}{}", CHANNEL_LABEL_PREFIX, peer)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;

    #[test]
    fn test_defaults() {
        let options = SessionOptions::new("lobby", "ws://relay", "http://api");
        assert_eq!(options.candidate_grace, Duration::from_millis(250));
        assert_eq!(options.op_timeout, Duration::from_secs(10));
        assert_eq!(options.beacon_timeout, Duration::from_secs(3));
    }

    #[test]
    fn test_from_config_applies_defaults_and_overrides() {
        let source = config::Config::builder()
            .set_override("room", "lobby")
            .unwrap()
            .set_override("relay_url", "ws://relay")
            .unwrap()
            .set_override("api_url", "http://api")
            .unwrap()
            .set_override("candidate_grace_ms", 40)
            .unwrap()
            .build()
            .unwrap();

        let options = SessionOptions::from_config(source).unwrap();
        assert_eq!(options.room, "lobby");
        assert_eq!(options.candidate_grace, Duration::from_millis(40));
        assert_eq!(options.op_timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_from_config_requires_room() {
        let source = config::Config::builder()
            .set_override("relay_url", "ws://relay")
            .unwrap()
            .set_override("api_url", "http://api")
            .unwrap()
            .build()
            .unwrap();

        assert!(matches!(
            SessionOptions::from_config(source),
            Err(SessionError::Config(_))
        ));
    }

    #[test]
    fn test_channel_label() {
        assert_eq!(channel_label(&"B".into()), "textMessageChannelB");
    }
}
