//! Peer drivers: run a whole session, from code to completion, for one side.
//!
//! Both drivers report through an `mpsc::Sender<SessionEvent>` and stop at the
//! first terminal state. They never retry; a new attempt is a new session.

pub mod receive;
pub mod send;

use std::future::Future;

use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use receive::receive_files;
pub use send::send_files;

use crate::SessionEvent;
use crate::channel::{ChannelMsg, ChannelSender};
use crate::error::{HandoffError, Result};
use crate::session::{Role, SessionState, SessionStateMachine, SessionTrigger};
use crate::transfer::FileDescriptor;

/// Outcome of one session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionReport {
    pub session_id: Uuid,
    pub role: Role,
    pub state: SessionState,
    pub files: Vec<FileDescriptor>,
    /// First error the session hit, including join errors that left it `Idle`
    pub error: Option<HandoffError>,
}

impl SessionReport {
    pub fn is_completed(&self) -> bool {
        self.state == SessionState::Completed
    }
}

/// A session's state machine together with the event stream it reports to.
pub(crate) struct SessionContext {
    machine: SessionStateMachine,
    events: mpsc::Sender<SessionEvent>,
    error: Option<HandoffError>,
}

impl SessionContext {
    pub(crate) fn new(role: Role, events: mpsc::Sender<SessionEvent>) -> Self {
        let machine = SessionStateMachine::new(role);
        tracing::info!("Session {} started as {:?}", machine.session_id(), role);
        Self {
            machine,
            events,
            error: None,
        }
    }

    pub(crate) fn events(&self) -> &mpsc::Sender<SessionEvent> {
        &self.events
    }

    pub(crate) async fn emit(&self, event: SessionEvent) {
        let _ = self.events.send(event).await;
    }

    pub(crate) async fn advance(&mut self, trigger: SessionTrigger) -> Result<()> {
        let before = self.machine.state();
        let after = self.machine.fire(trigger)?;
        if after != before {
            self.emit(SessionEvent::StateChanged(after)).await;
        }
        Ok(())
    }

    /// Record a failure and move to the state it implies.
    pub(crate) async fn fail(&mut self, error: HandoffError) {
        tracing::warn!("Session {} failed: {}", self.machine.session_id(), error);
        if self.error.is_none() {
            self.error = Some(error.clone());
        }
        self.emit(SessionEvent::Error(error.clone())).await;

        let trigger = match error {
            HandoffError::UserCancelled => SessionTrigger::Cancel,
            other => SessionTrigger::Fail(other),
        };
        if let Err(e) = self.advance(trigger).await {
            tracing::debug!("Failure not applied: {}", e);
        }
    }

    /// Remember an outcome that is not a failure of this session (e.g. a reject).
    pub(crate) fn note(&mut self, error: HandoffError) {
        self.error.get_or_insert(error);
    }

    pub(crate) fn report(self, files: Vec<FileDescriptor>) -> SessionReport {
        let state = self.machine.state();
        tracing::info!(
            "Session {} finished in {:?}",
            self.machine.session_id(),
            state
        );
        SessionReport {
            session_id: self.machine.session_id(),
            role: self.machine.role(),
            state,
            files,
            error: self.error,
        }
    }
}

/// Run `fut` unless the user cancels first.
pub(crate) async fn until_cancelled<T>(
    cancel: &CancellationToken,
    fut: impl Future<Output = Result<T>>,
) -> Result<T> {
    tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HandoffError::UserCancelled),
        result = fut => result,
    }
}

/// Best effort: the peer may already be gone.
pub(crate) fn send_cancel(tx: &ChannelSender, reason: &str) {
    let _ = tx.send(ChannelMsg::Cancel {
        reason: reason.to_string(),
    });
}

/// Abort because the peer misbehaved. Returns the error this side ends with.
pub(crate) fn abort_protocol(tx: &ChannelSender, reason: impl Into<String>) -> HandoffError {
    let reason = reason.into();
    tracing::warn!("Protocol violation: {}", reason);
    let _ = tx.send(ChannelMsg::ProtocolError {
        reason: reason.clone(),
    });
    HandoffError::Protocol(reason)
}
