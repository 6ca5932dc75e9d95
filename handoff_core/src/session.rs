//! Lifecycle of one transfer session, as seen by one peer.
//!
//! Each peer owns its own machine. The two converge only through the
//! messages they exchange; nothing here is shared across peers.

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::HandoffError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Role {
    Sender,
    Receiver,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum SessionState {
    Idle,
    /// Sender only: a code is waiting for a receiver
    CodeIssued,
    Connecting,
    Connected,
    /// Sender: manifest sent, waiting for the receiver's answer
    AwaitingAcceptance,
    /// Receiver: manifest received, waiting for the local user
    AwaitingDecision,
    Transferring,
    Completed,
    Failed(HandoffError),
    Cancelled,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionState::Completed | SessionState::Failed(_) | SessionState::Cancelled
        )
    }
}

/// Events that move a session forward
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionTrigger {
    /// Sender picked files and the server issued a code
    CodeIssued,
    /// Sender heard that a receiver joined its room
    ReceiverJoined,
    /// Receiver's join was accepted by the server
    Joined,
    HandshakeSucceeded,
    ManifestSent,
    ManifestReceived,
    /// Sender: the receiver accepted. Receiver: the local user accepted.
    Accepted,
    /// The receiver declined the manifest
    Rejected,
    AllAcknowledged,
    /// Local user cancelled
    Cancel,
    Fail(HandoffError),
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{trigger:?} is not valid for a {role:?} in state {state:?}")]
pub struct InvalidTransition {
    pub role: Role,
    pub state: SessionState,
    pub trigger: SessionTrigger,
}

impl From<InvalidTransition> for HandoffError {
    fn from(e: InvalidTransition) -> Self {
        HandoffError::Protocol(e.to_string())
    }
}

pub struct SessionStateMachine {
    session_id: Uuid,
    role: Role,
    state_tx: watch::Sender<SessionState>,
}

impl SessionStateMachine {
    pub fn new(role: Role) -> Self {
        let (state_tx, _) = watch::channel(SessionState::Idle);
        Self {
            session_id: Uuid::new_v4(),
            role,
            state_tx,
        }
    }

    pub fn session_id(&self) -> Uuid {
        self.session_id
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn state(&self) -> SessionState {
        self.state_tx.borrow().clone()
    }

    pub fn is_terminal(&self) -> bool {
        self.state_tx.borrow().is_terminal()
    }

    /// Observe every state change
    pub fn subscribe(&self) -> watch::Receiver<SessionState> {
        self.state_tx.subscribe()
    }

    /// Apply a trigger and return the resulting state.
    pub fn fire(&self, trigger: SessionTrigger) -> Result<SessionState, InvalidTransition> {
        let current = self.state();
        let next = self.next_state(&current, &trigger).ok_or_else(|| InvalidTransition {
            role: self.role,
            state: current.clone(),
            trigger: trigger.clone(),
        })?;

        if next != current {
            tracing::debug!(
                "Session {} ({:?}): {:?} -> {:?}",
                self.session_id,
                self.role,
                current,
                next
            );
            self.state_tx.send_replace(next.clone());
        }
        Ok(next)
    }

    fn next_state(&self, current: &SessionState, trigger: &SessionTrigger) -> Option<SessionState> {
        use SessionState as S;
        use SessionTrigger as T;

        if current.is_terminal() {
            return None;
        }

        match (self.role, current, trigger) {
            // A failed join attempt is not the end of a session that never started
            (_, S::Idle, T::Fail(e)) if !e.is_session_terminal() => Some(S::Idle),
            (_, _, T::Fail(e)) => Some(S::Failed(e.clone())),
            (_, _, T::Cancel) => Some(S::Failed(HandoffError::UserCancelled)),

            (Role::Sender, S::Idle, T::CodeIssued) => Some(S::CodeIssued),
            (Role::Sender, S::CodeIssued, T::ReceiverJoined) => Some(S::Connecting),
            (Role::Receiver, S::Idle, T::Joined) => Some(S::Connecting),

            (_, S::Connecting, T::HandshakeSucceeded) => Some(S::Connected),

            (Role::Sender, S::Connected, T::ManifestSent) => Some(S::AwaitingAcceptance),
            (Role::Sender, S::AwaitingAcceptance, T::Accepted) => Some(S::Transferring),
            (Role::Sender, S::AwaitingAcceptance, T::Rejected) => Some(S::Cancelled),

            (Role::Receiver, S::Connected, T::ManifestReceived) => Some(S::AwaitingDecision),
            (Role::Receiver, S::AwaitingDecision, T::Accepted) => Some(S::Transferring),
            (Role::Receiver, S::AwaitingDecision, T::Rejected) => Some(S::Cancelled),

            (_, S::Transferring, T::AllAcknowledged) => Some(S::Completed),
            _ => None,
        }
    }
}
