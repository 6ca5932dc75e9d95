//! Signaling wire messages (JSON text frames).

use serde::{Deserialize, Serialize};

use crate::code::Code;

/// Messages from a peer to the signaling server
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Open a room as the sending side
    CreateRoom,
    /// Attach to an existing room as the receiving side
    JoinRoom { code: Code },
    /// Opaque handshake data for the other peer
    Relay { payload: String },
    /// Terminate the room
    Leave { reason: String },
    Ping,
}

/// Messages from the signaling server to a peer
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Room opened; share the code with the receiver
    RoomCreated { code: Code, expires_in_secs: u64 },
    /// Receiver attached successfully
    Joined { code: Code },
    /// Sent to the room owner once a receiver attached
    PeerJoined,
    JoinRejected { reason: JoinRejectReason },
    /// Opaque handshake data from the other peer
    Relay { payload: String },
    PeerDisconnected { reason: String },
    /// Sent to the room owner when no receiver joined in time
    RoomExpired,
    Error { message: String },
    Pong,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JoinRejectReason {
    NotFound,
    AlreadyClaimed,
    Expired,
}

impl ServerMessage {
    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn error(message: impl Into<String>) -> Self {
        ServerMessage::Error {
            message: message.into(),
        }
    }
}

impl ClientMessage {
    /// Serialize to a JSON text frame
    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }
}
