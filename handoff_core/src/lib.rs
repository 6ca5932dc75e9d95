//! Core of the handoff file-transfer protocol.
//!
//! A sender gets a short code from the signaling server, the receiver joins
//! with it, the two peers negotiate a direct QUIC channel through the server,
//! and files move over that channel in acknowledged chunks.

use serde::{Deserialize, Serialize};

pub mod ack;
pub mod channel;
pub mod code;
pub mod config;
pub mod error;
pub mod handshake;
pub mod peer;
pub mod session;
pub mod signaling;
pub mod transfer;

pub use ack::{AckStatus, AckTracker, FileAckState};
pub use channel::{ChannelMsg, ConnectionHandle};
pub use code::{Code, CodeGenerator};
pub use config::PeerConfig;
pub use error::{HandoffError, Result};
pub use handshake::{HandshakeCoordinator, HandshakeFailure, HandshakeRole, HandshakeState};
pub use peer::{SessionReport, receive_files, send_files};
pub use session::{Role, SessionState, SessionStateMachine, SessionTrigger};
pub use transfer::{FileDescriptor, TransferEngine};

/// Reports from a running session to whoever drives it (UI, CLI, tests)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum SessionEvent {
    StateChanged(SessionState),
    /// Sender: share this code with the receiver
    CodeIssued { code: String, expires_in_secs: u64 },
    /// Receiver: answer through the decision channel
    ManifestReceived {
        files: Vec<FileDescriptor>,
        total_size: u64,
    },
    TransferProgress {
        file_index: usize,
        file_name: String,
        bytes_done: u64,
        total_bytes: u64,
        speed: String,
        is_sending: bool,
    },
    /// Receiver: file written and checksum verified
    FileVerified { file_index: usize, path: String },
    /// Sender: the receiver confirmed the file
    FileAcknowledged { file_index: usize },
    FileFailed { file_index: usize, reason: String },
    Error(HandoffError),
}
