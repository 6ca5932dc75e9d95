use serde::{Deserialize, Serialize};
use std::net::SocketAddr;

/// Handshake messages carried inside signaling `relay` payloads.
///
/// The signaling server forwards these as opaque strings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum HandshakeSignal {
    /// Session description from the listening side
    Offer {
        version: u32,
        /// BLAKE3 fingerprint of the listener's certificate
        fingerprint: String,
        /// One-time token the dialer must present on the channel
        token: String,
    },
    Answer { version: u32 },
    Candidate { addr: SocketAddr },
    EndOfCandidates,
    /// The sending side gave up on the handshake
    Failed { reason: String },
}

impl HandshakeSignal {
    pub fn to_payload(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn from_payload(payload: &str) -> serde_json::Result<Self> {
        serde_json::from_str(payload)
    }
}

/// First frame on a freshly dialed channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Hello {
    pub token: String,
}
