use meshcall_media::MediaError;
use meshcall_protocol::ProtocolError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("Relay connection failed: {0}")]
    Connection(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("Malformed message: {0}")]
    Protocol(#[from] ProtocolError),

    #[error("Negotiation failed: {0}")]
    Negotiation(#[from] anyhow::Error),

    #[error("Media error: {0}")]
    Media(#[from] MediaError),

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Session has shut down")]
    Closed,
}

pub type Result<T> = std::result::Result<T, SessionError>;
