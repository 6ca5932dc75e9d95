//! Error taxonomy shared by both peers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::code::CodeError;
use crate::handshake::HandshakeFailure;
use crate::signaling::messages::JoinRejectReason;

pub type Result<T> = std::result::Result<T, HandoffError>;

/// Terminal and file-scoped failures reported to the user.
///
/// Values are cloneable so the same failure can be stored in the session
/// state, sent to the other peer, and returned to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum HandoffError {
    #[error("no room is open for this code")]
    CodeNotFound,
    #[error("another receiver already joined this room")]
    RoomAlreadyClaimed,
    #[error("the code has expired")]
    RoomExpired,
    #[error("connection setup timed out")]
    HandshakeTimeout,
    #[error("no direct connection possible between peers")]
    HandshakeIncompatible,
    #[error("peer disconnected: {0}")]
    PeerDisconnected(String),
    #[error("checksum mismatch for files {files:?}")]
    ChecksumMismatch { files: Vec<usize> },
    #[error("receiver declined the transfer")]
    UserRejected,
    #[error("transfer cancelled")]
    UserCancelled,
    #[error("invalid code: {0}")]
    InvalidCode(String),
    #[error("signaling error: {0}")]
    Signaling(String),
    #[error("protocol error: {0}")]
    Protocol(String),
    #[error("io error: {0}")]
    Io(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

impl From<std::io::Error> for HandoffError {
    fn from(e: std::io::Error) -> Self {
        HandoffError::Io(e.to_string())
    }
}

impl From<CodeError> for HandoffError {
    fn from(e: CodeError) -> Self {
        HandoffError::InvalidCode(e.to_string())
    }
}

impl From<JoinRejectReason> for HandoffError {
    fn from(reason: JoinRejectReason) -> Self {
        match reason {
            JoinRejectReason::NotFound => HandoffError::CodeNotFound,
            JoinRejectReason::AlreadyClaimed => HandoffError::RoomAlreadyClaimed,
            JoinRejectReason::Expired => HandoffError::RoomExpired,
        }
    }
}

impl From<HandshakeFailure> for HandoffError {
    fn from(failure: HandshakeFailure) -> Self {
        match failure {
            HandshakeFailure::Timeout => HandoffError::HandshakeTimeout,
            HandshakeFailure::IncompatibleNetwork(_) => HandoffError::HandshakeIncompatible,
            HandshakeFailure::PeerDisconnected(reason) => HandoffError::PeerDisconnected(reason),
        }
    }
}

impl HandoffError {
    /// Whether the error ends the session (as opposed to a single file or join attempt).
    pub fn is_session_terminal(&self) -> bool {
        !matches!(
            self,
            HandoffError::CodeNotFound
                | HandoffError::RoomAlreadyClaimed
                | HandoffError::RoomExpired
                | HandoffError::InvalidCode(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_join_rejections_map_to_taxonomy() {
        assert_eq!(
            HandoffError::from(JoinRejectReason::NotFound),
            HandoffError::CodeNotFound
        );
        assert_eq!(
            HandoffError::from(JoinRejectReason::AlreadyClaimed),
            HandoffError::RoomAlreadyClaimed
        );
        assert_eq!(
            HandoffError::from(JoinRejectReason::Expired),
            HandoffError::RoomExpired
        );
    }

    #[test]
    fn test_join_errors_do_not_end_a_session() {
        assert!(!HandoffError::RoomExpired.is_session_terminal());
        assert!(!HandoffError::RoomAlreadyClaimed.is_session_terminal());
        assert!(HandoffError::HandshakeTimeout.is_session_terminal());
        assert!(HandoffError::PeerDisconnected("gone".into()).is_session_terminal());
    }
}
