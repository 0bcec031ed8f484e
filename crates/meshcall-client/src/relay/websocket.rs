use futures_util::{SinkExt, StreamExt};
use meshcall_protocol::ClientMessage;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use crate::error::Result;

/// What the relay side of the link reports
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelayEvent {
    /// One text frame, unparsed
    Message(String),
    Error(String),
    /// The link is gone; no further events follow
    Closed,
}

/// Duplex link to the relay: commands go out, events come in.
///
/// Dropping the outbound half closes the underlying socket.
pub struct RelayLink {
    outbound: mpsc::UnboundedSender<ClientMessage>,
    inbound: mpsc::UnboundedReceiver<RelayEvent>,
}

impl RelayLink {
    /// Open a WebSocket to the relay. Fails if the relay is unreachable;
    /// there is no retry.
    pub async fn connect(url: &str) -> Result<Self> {
        let (ws_stream, _) = connect_async(url).await?;
        tracing::info!("Connected to relay at {}", url);

        let (mut write, mut read) = ws_stream.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<ClientMessage>();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        // Outgoing commands
        tokio::spawn(async move {
            while let Some(msg) = rx.recv().await {
                let json = match serde_json::to_string(&msg) {
                    Ok(j) => j,
                    Err(e) => {
                        tracing::error!("Failed to serialize relay command: {}", e);
                        continue;
                    }
                };

                if write.send(Message::Text(json.into())).await.is_err() {
                    tracing::error!("Failed to send relay command");
                    break;
                }
            }

            tracing::debug!("Relay sender dropped, closing socket");
            let _ = write.send(Message::Close(None)).await;
        });

        // Incoming frames
        tokio::spawn(async move {
            while let Some(result) = read.next().await {
                match result {
                    Ok(Message::Text(text)) => {
                        if event_tx.send(RelayEvent::Message(text.as_str().to_owned())).is_err() {
                            break;
                        }
                    }
                    Ok(Message::Close(_)) => {
                        tracing::info!("Relay closed the connection");
                        break;
                    }
                    Ok(Message::Binary(data)) => {
                        tracing::debug!("Ignoring {} byte binary frame from relay", data.len());
                    }
                    Err(e) => {
                        tracing::error!("Relay socket error: {}", e);
                        let _ = event_tx.send(RelayEvent::Error(e.to_string()));
                        break;
                    }
                    _ => {}
                }
            }

            let _ = event_tx.send(RelayEvent::Closed);
        });

        Ok(Self {
            outbound: tx,
            inbound: event_rx,
        })
    }

    /// In-memory link; the returned [`RelayEnd`] plays the relay
    pub fn pair() -> (Self, RelayEnd) {
        let (outbound, commands) = mpsc::unbounded_channel();
        let (events, inbound) = mpsc::unbounded_channel();
        (
            Self { outbound, inbound },
            RelayEnd { commands, events },
        )
    }

    pub fn into_parts(
        self,
    ) -> (
        mpsc::UnboundedSender<ClientMessage>,
        mpsc::UnboundedReceiver<RelayEvent>,
    ) {
        (self.outbound, self.inbound)
    }
}

/// Relay side of an in-memory [`RelayLink`]
pub struct RelayEnd {
    pub commands: mpsc::UnboundedReceiver<ClientMessage>,
    pub events: mpsc::UnboundedSender<RelayEvent>,
}

impl RelayEnd {
    /// Deliver one text frame to the client
    pub fn deliver(&self, text: impl Into<String>) -> bool {
        self.events.send(RelayEvent::Message(text.into())).is_ok()
    }

    pub fn close(&self) -> bool {
        self.events.send(RelayEvent::Closed).is_ok()
    }
}
