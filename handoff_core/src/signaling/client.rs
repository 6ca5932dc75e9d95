//! Peer side of the signaling connection.

use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};

use super::messages::{ClientMessage, ServerMessage};
use crate::code::Code;
use crate::error::{HandoffError, Result};

/// Queue depth between the socket tasks and the session driver
const QUEUE_DEPTH: usize = 64;

/// WebSocket connection to the signaling server.
///
/// Dropping the client closes the socket, which the server treats the same
/// as an explicit `leave`.
pub struct SignalingClient {
    outbound: mpsc::Sender<ClientMessage>,
    inbound: mpsc::Receiver<ServerMessage>,
    reader: JoinHandle<()>,
}

impl SignalingClient {
    /// Connect to a signaling server, e.g. `ws://127.0.0.1:3030/ws` or a `wss://` URL
    pub async fn connect(url: &str) -> Result<Self> {
        // wss:// goes through rustls; pin the same provider the QUIC side uses
        let _ = rustls::crypto::ring::default_provider().install_default();
        let (ws_stream, _) = connect_async(url)
            .await
            .map_err(|e| HandoffError::Signaling(format!("cannot reach {}: {}", url, e)))?;
        let (mut write, mut read) = ws_stream.split();
        tracing::debug!("Signaling connection established to {}", url);

        let (outbound_tx, mut outbound_rx) = mpsc::channel::<ClientMessage>(QUEUE_DEPTH);
        let (inbound_tx, inbound_rx) = mpsc::channel::<ServerMessage>(QUEUE_DEPTH);

        tokio::spawn(async move {
            while let Some(msg) = outbound_rx.recv().await {
                if let Err(e) = write.send(Message::Text(msg.to_json().into())).await {
                    tracing::warn!("Signaling write failed: {}", e);
                    return;
                }
            }
            // Sender side dropped: close the socket so the server releases the room
            let _ = write.send(Message::Close(None)).await;
        });

        let reader = tokio::spawn(async move {
            while let Some(frame) = read.next().await {
                match frame {
                    Ok(Message::Text(text)) => match serde_json::from_str::<ServerMessage>(text.as_str()) {
                        Ok(msg) => {
                            if inbound_tx.send(msg).await.is_err() {
                                break;
                            }
                        }
                        Err(e) => tracing::warn!("Ignoring malformed signaling frame: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        tracing::warn!("Signaling read failed: {}", e);
                        break;
                    }
                }
            }
        });

        Ok(Self {
            outbound: outbound_tx,
            inbound: inbound_rx,
            reader,
        })
    }

    pub async fn send(&self, msg: ClientMessage) -> Result<()> {
        self.outbound
            .send(msg)
            .await
            .map_err(|_| HandoffError::Signaling("signaling connection closed".to_string()))
    }

    /// Next server message; `None` once the connection is gone.
    pub async fn recv(&mut self) -> Option<ServerMessage> {
        loop {
            match self.inbound.recv().await? {
                ServerMessage::Pong => continue,
                msg => return Some(msg),
            }
        }
    }

    /// Open a room and return its code and lifetime in seconds.
    pub async fn create_room(&mut self) -> Result<(Code, u64)> {
        self.send(ClientMessage::CreateRoom).await?;
        match self.recv().await {
            Some(ServerMessage::RoomCreated {
                code,
                expires_in_secs,
            }) => Ok((code, expires_in_secs)),
            Some(ServerMessage::Error { message }) => Err(HandoffError::Signaling(message)),
            Some(other) => Err(HandoffError::Protocol(format!(
                "expected room_created, got {:?}",
                other
            ))),
            None => Err(HandoffError::Signaling(
                "connection closed before room was created".to_string(),
            )),
        }
    }

    /// Attach to a room as the receiver.
    pub async fn join_room(&mut self, code: &Code) -> Result<()> {
        self.send(ClientMessage::JoinRoom { code: code.clone() }).await?;
        match self.recv().await {
            Some(ServerMessage::Joined { .. }) => Ok(()),
            Some(ServerMessage::JoinRejected { reason }) => Err(reason.into()),
            Some(ServerMessage::Error { message }) => Err(HandoffError::Signaling(message)),
            Some(other) => Err(HandoffError::Protocol(format!(
                "expected joined, got {:?}",
                other
            ))),
            None => Err(HandoffError::Signaling(
                "connection closed before join completed".to_string(),
            )),
        }
    }

    /// Wait until a receiver attaches to the room this client owns.
    pub async fn wait_for_peer(&mut self) -> Result<()> {
        loop {
            match self.recv().await {
                Some(ServerMessage::PeerJoined) => return Ok(()),
                Some(ServerMessage::PeerDisconnected { reason }) => {
                    return Err(HandoffError::PeerDisconnected(reason));
                }
                Some(ServerMessage::RoomExpired) => return Err(HandoffError::RoomExpired),
                Some(ServerMessage::Error { message }) => {
                    return Err(HandoffError::Signaling(message));
                }
                Some(other) => {
                    tracing::debug!("Ignoring {:?} while waiting for receiver", other);
                }
                None => {
                    return Err(HandoffError::Signaling(
                        "signaling connection closed".to_string(),
                    ));
                }
            }
        }
    }

    pub async fn relay(&self, payload: String) -> Result<()> {
        self.send(ClientMessage::Relay { payload }).await
    }

    /// Terminate the room; the other peer is told why.
    pub async fn leave(&self, reason: impl Into<String>) -> Result<()> {
        self.send(ClientMessage::Leave {
            reason: reason.into(),
        })
        .await
    }
}

impl Drop for SignalingClient {
    fn drop(&mut self) {
        self.reader.abort();
    }
}
