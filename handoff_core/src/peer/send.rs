use std::path::PathBuf;

use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::{SessionContext, SessionReport, abort_protocol, send_cancel, until_cancelled};
use crate::SessionEvent;
use crate::ack::{AckTracker, FileAckState, wait_settled};
use crate::channel::{ChannelClosed, ChannelMsg, ChannelReceiver, ChannelSender};
use crate::config::PeerConfig;
use crate::error::{HandoffError, Result};
use crate::handshake::{HandshakeCoordinator, HandshakeRole};
use crate::session::{Role, SessionTrigger};
use crate::signaling::SignalingClient;
use crate::transfer::{FileDescriptor, build_manifest, select_files};

/// Offer `paths` to whoever joins with the issued code.
///
/// The code is published as [`SessionEvent::CodeIssued`]. Cancelling `cancel`
/// at any point tells the other side and ends the session as
/// `Failed(UserCancelled)`.
pub async fn send_files(
    config: &PeerConfig,
    paths: Vec<PathBuf>,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) -> SessionReport {
    let mut ctx = SessionContext::new(Role::Sender, events);
    let mut files = Vec::new();
    if let Err(e) = run_sender(config, &paths, &mut ctx, &mut files, &cancel).await {
        ctx.fail(e).await;
    }
    ctx.report(files)
}

async fn run_sender(
    config: &PeerConfig,
    paths: &[PathBuf],
    ctx: &mut SessionContext,
    files: &mut Vec<FileDescriptor>,
    cancel: &CancellationToken,
) -> Result<()> {
    config
        .validate()
        .map_err(|e| HandoffError::Config(e.to_string()))?;
    let engine = config.transfer_engine();

    *files = until_cancelled(cancel, async {
        select_files(paths, engine.chunk_size)
            .await
            .map_err(|e| HandoffError::Io(e.to_string()))
    })
    .await?;

    let mut signaling = until_cancelled(cancel, SignalingClient::connect(&config.signaling_url)).await?;
    let mut handshake = HandshakeCoordinator::new(HandshakeRole::Offerer, config.handshake_options());
    handshake.begin();

    let (code, expires_in_secs) = until_cancelled(cancel, signaling.create_room()).await?;
    ctx.advance(SessionTrigger::CodeIssued).await?;
    ctx.emit(SessionEvent::CodeIssued {
        code: code.display_form(),
        expires_in_secs,
    })
    .await;
    tracing::info!("Room {} open for {}s", code, expires_in_secs);

    if let Err(e) = until_cancelled(cancel, signaling.wait_for_peer()).await {
        let _ = signaling.leave(e.to_string()).await;
        return Err(e);
    }
    ctx.advance(SessionTrigger::ReceiverJoined).await?;
    handshake.room_paired();

    let negotiated = tokio::select! {
        biased;
        _ = cancel.cancelled() => Err(HandoffError::UserCancelled),
        result = handshake.negotiate(&mut signaling) => result.map_err(HandoffError::from),
    };
    let connection = match negotiated {
        Ok(connection) => connection,
        Err(e) => {
            let _ = signaling.leave(e.to_string()).await;
            return Err(e);
        }
    };
    // The room is no longer needed once the direct channel exists
    drop(signaling);
    ctx.advance(SessionTrigger::HandshakeSucceeded).await?;

    let (tx, mut rx) = connection.split();
    tx.send(ChannelMsg::Manifest(build_manifest(files, engine.chunk_size)))?;
    ctx.advance(SessionTrigger::ManifestSent).await?;

    match await_answer(&tx, &mut rx, cancel).await? {
        Answer::Accepted => ctx.advance(SessionTrigger::Accepted).await?,
        Answer::Declined(reason) => {
            tracing::info!("Receiver declined: {}", reason);
            ctx.note(HandoffError::UserRejected);
            return ctx.advance(SessionTrigger::Rejected).await;
        }
    }

    let mut tracker = AckTracker::new(files.iter().map(|f| f.size));
    let mut status = tracker.subscribe();
    let mut producer = {
        let tx = tx.clone();
        let files = files.clone();
        let events = ctx.events().clone();
        tokio::spawn(async move { engine.stream_files(&tx, &files, &events).await })
    };
    let mut producer_done = false;

    let outcome: Result<()> = loop {
        tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                send_cancel(&tx, "cancelled by sender");
                break Err(HandoffError::UserCancelled);
            }
            true = wait_settled(&mut status) => break Ok(()),
            joined = &mut producer, if !producer_done => {
                producer_done = true;
                match joined {
                    Ok(Ok(())) => {}
                    // The receive side reports the closed channel
                    Ok(Err(e)) if e.downcast_ref::<ChannelClosed>().is_some() => {}
                    Ok(Err(e)) => {
                        send_cancel(&tx, "sender could not read a file");
                        break Err(HandoffError::Io(e.to_string()));
                    }
                    Err(e) => break Err(HandoffError::Io(e.to_string())),
                }
            }
            msg = rx.recv() => match msg {
                Some(ChannelMsg::FileAck { file_index }) => match tracker.acknowledge(file_index) {
                    Ok(true) => {
                        files[file_index].bytes_acknowledged = files[file_index].size;
                        tracing::info!("{} acknowledged by receiver", files[file_index].name);
                        ctx.emit(SessionEvent::FileAcknowledged { file_index }).await;
                    }
                    Ok(false) => tracing::debug!("Repeated ack for file {}", file_index),
                    Err(e) => break Err(abort_protocol(&tx, e.to_string())),
                },
                Some(ChannelMsg::FileFailed { file_index, reason }) => match tracker.fail(file_index, &reason) {
                    Ok(true) => {
                        tracing::warn!("Receiver failed file {}: {}", file_index, reason);
                        ctx.emit(SessionEvent::FileFailed { file_index, reason }).await;
                    }
                    Ok(false) => {}
                    Err(e) => break Err(abort_protocol(&tx, e.to_string())),
                },
                Some(ChannelMsg::Cancel { reason }) => break Err(HandoffError::PeerDisconnected(reason)),
                Some(ChannelMsg::ProtocolError { reason }) => break Err(HandoffError::Protocol(reason)),
                Some(other) => tracing::warn!("Ignoring unexpected {} during transfer", other.kind()),
                None => break Err(ChannelClosed.into()),
            }
        }
    };
    producer.abort();

    if let Err(e) = outcome {
        for file_index in tracker.incomplete_files() {
            if tracker.state(file_index) == Some(&FileAckState::Pending) {
                ctx.emit(SessionEvent::FileFailed {
                    file_index,
                    reason: "not acknowledged before the session ended".to_string(),
                })
                .await;
            }
        }
        return Err(e);
    }

    if tracker.is_complete() {
        ctx.advance(SessionTrigger::AllAcknowledged).await
    } else {
        Err(HandoffError::ChecksumMismatch {
            files: tracker.incomplete_files(),
        })
    }
}

/// The receiver's verdict on the manifest
#[derive(Debug, PartialEq)]
enum Answer {
    Accepted,
    Declined(String),
}

async fn await_answer(
    tx: &ChannelSender,
    rx: &mut ChannelReceiver,
    cancel: &CancellationToken,
) -> Result<Answer> {
    let msg = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            send_cancel(tx, "cancelled by sender");
            return Err(HandoffError::UserCancelled);
        }
        msg = rx.recv() => msg,
    };
    match msg {
        Some(ChannelMsg::Accept) => Ok(Answer::Accepted),
        Some(ChannelMsg::Reject { reason }) => Ok(Answer::Declined(reason)),
        Some(ChannelMsg::Cancel { reason }) => Err(HandoffError::PeerDisconnected(reason)),
        Some(ChannelMsg::ProtocolError { reason }) => Err(HandoffError::Protocol(reason)),
        Some(other) => Err(abort_protocol(
            tx,
            format!("expected accept or reject, got {}", other.kind()),
        )),
        None => Err(ChannelClosed.into()),
    }
}
