use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use super::{SessionContext, SessionReport, abort_protocol, send_cancel, until_cancelled};
use crate::SessionEvent;
use crate::ack::{AckTracker, FileAckState, wait_settled};
use crate::channel::{ChannelClosed, ChannelMsg, ChannelReceiver, ChannelSender, Chunk, Manifest};
use crate::code::Code;
use crate::config::PeerConfig;
use crate::error::{HandoffError, Result};
use crate::handshake::{HandshakeCoordinator, HandshakeRole};
use crate::session::{Role, SessionTrigger};
use crate::signaling::SignalingClient;
use crate::transfer::utils::ProgressReporter;
use crate::transfer::{ChunkOutcome, FileAssembler, FileDescriptor, prepare_assemblers, validate_manifest};

/// Join the room behind `code` and receive whatever the sender offers.
///
/// After [`SessionEvent::ManifestReceived`] the driver waits on `decision`:
/// `true` accepts, `false` (or dropping the sender) declines. Join errors
/// such as an expired code leave the session `Idle`.
pub async fn receive_files(
    config: &PeerConfig,
    code: &str,
    decision: oneshot::Receiver<bool>,
    events: mpsc::Sender<SessionEvent>,
    cancel: CancellationToken,
) -> SessionReport {
    let mut ctx = SessionContext::new(Role::Receiver, events);
    let mut files = Vec::new();
    if let Err(e) = run_receiver(config, code, decision, &mut ctx, &mut files, &cancel).await {
        ctx.fail(e).await;
    }
    ctx.report(files)
}

async fn run_receiver(
    config: &PeerConfig,
    code: &str,
    decision: oneshot::Receiver<bool>,
    ctx: &mut SessionContext,
    files: &mut Vec<FileDescriptor>,
    cancel: &CancellationToken,
) -> Result<()> {
    config
        .validate()
        .map_err(|e| HandoffError::Config(e.to_string()))?;
    let code = Code::parse(code)?;

    let mut signaling = until_cancelled(cancel, SignalingClient::connect(&config.signaling_url)).await?;
    let mut handshake = HandshakeCoordinator::new(HandshakeRole::Answerer, config.handshake_options());
    handshake.begin();

    until_cancelled(cancel, signaling.join_room(&code)).await?;
    tracing::info!("Joined room {}", code);
    ctx.advance(SessionTrigger::Joined).await?;
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
    drop(signaling);
    ctx.advance(SessionTrigger::HandshakeSucceeded).await?;

    let (tx, mut rx) = connection.split();
    let manifest = recv_manifest(&tx, &mut rx, cancel).await?;

    *files = manifest
        .files
        .iter()
        .map(|entry| FileDescriptor::from_entry(entry, manifest.chunk_size))
        .collect();
    ctx.advance(SessionTrigger::ManifestReceived).await?;
    ctx.emit(SessionEvent::ManifestReceived {
        files: files.clone(),
        total_size: manifest.total_size,
    })
    .await;

    let accepted = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            send_cancel(&tx, "cancelled by receiver");
            return Err(HandoffError::UserCancelled);
        }
        msg = rx.recv() => match msg {
            Some(ChannelMsg::Cancel { reason }) => return Err(HandoffError::PeerDisconnected(reason)),
            Some(ChannelMsg::ProtocolError { reason }) => return Err(HandoffError::Protocol(reason)),
            Some(other) => {
                return Err(abort_protocol(&tx, format!("unexpected {} before accepting", other.kind())));
            }
            None => return Err(ChannelClosed.into()),
        },
        answer = decision => answer.unwrap_or(false),
    };

    if !accepted {
        tracing::info!("Declined {} file(s)", files.len());
        let _ = tx.send(ChannelMsg::Reject {
            reason: "declined by receiver".to_string(),
        });
        return ctx.advance(SessionTrigger::Rejected).await;
    }

    let mut assemblers = match prepare_assemblers(&manifest, &config.download_dir).await {
        Ok(assemblers) => assemblers,
        Err(e) => {
            send_cancel(&tx, "receiver cannot store the files");
            return Err(HandoffError::Io(e.to_string()));
        }
    };
    for (file, assembler) in files.iter_mut().zip(&assemblers) {
        file.path = Some(assembler.path().to_path_buf());
    }

    tx.send(ChannelMsg::Accept)?;
    ctx.advance(SessionTrigger::Accepted).await?;

    let outcome = receive_chunks(ctx, files, &mut assemblers, &tx, &mut rx, cancel).await;

    // Anything not verified is partial or corrupt
    for assembler in &mut assemblers {
        assembler.discard().await;
    }
    outcome
}

/// Wait for the sender's manifest and check it before anything is shown to the user.
pub(super) async fn recv_manifest(
    tx: &ChannelSender,
    rx: &mut ChannelReceiver,
    cancel: &CancellationToken,
) -> Result<Manifest> {
    let msg = tokio::select! {
        biased;
        _ = cancel.cancelled() => {
            send_cancel(tx, "cancelled by receiver");
            return Err(HandoffError::UserCancelled);
        }
        msg = rx.recv() => msg,
    };
    let manifest = match msg {
        Some(ChannelMsg::Manifest(manifest)) => manifest,
        Some(ChannelMsg::Cancel { reason }) => return Err(HandoffError::PeerDisconnected(reason)),
        Some(ChannelMsg::ProtocolError { reason }) => return Err(HandoffError::Protocol(reason)),
        Some(other) => {
            return Err(abort_protocol(tx, format!("expected manifest, got {}", other.kind())));
        }
        None => return Err(ChannelClosed.into()),
    };
    if let Err(e) = validate_manifest(&manifest) {
        return Err(abort_protocol(tx, format!("invalid manifest: {}", e)));
    }
    Ok(manifest)
}

async fn receive_chunks(
    ctx: &mut SessionContext,
    files: &mut [FileDescriptor],
    assemblers: &mut [FileAssembler],
    tx: &ChannelSender,
    rx: &mut ChannelReceiver,
    cancel: &CancellationToken,
) -> Result<()> {
    let mut tracker = AckTracker::new(files.iter().map(|f| f.size));
    let mut status = tracker.subscribe();
    let mut reporters: Vec<ProgressReporter> = files
        .iter()
        .enumerate()
        .map(|(i, f)| ProgressReporter::new(ctx.events().clone(), i, &f.name, f.size, false))
        .collect();

    loop {
        let msg = tokio::select! {
            biased;
            _ = cancel.cancelled() => {
                send_cancel(tx, "cancelled by receiver");
                return Err(HandoffError::UserCancelled);
            }
            true = wait_settled(&mut status) => break,
            msg = rx.recv() => msg,
        };

        let chunk = match msg {
            Some(ChannelMsg::Chunk(chunk)) => chunk,
            Some(ChannelMsg::Cancel { reason }) => return Err(HandoffError::PeerDisconnected(reason)),
            Some(ChannelMsg::ProtocolError { reason }) => return Err(HandoffError::Protocol(reason)),
            Some(other) => {
                tracing::warn!("Ignoring unexpected {} during transfer", other.kind());
                continue;
            }
            None => {
                tracing::warn!(
                    "Channel closed with files {:?} incomplete",
                    tracker.incomplete_files()
                );
                return Err(ChannelClosed.into());
            }
        };

        let index = chunk.file_index;
        if index >= assemblers.len() {
            return Err(abort_protocol(tx, format!("chunk for unknown file {}", index)));
        }
        if tracker.state(index) != Some(&FileAckState::Pending) {
            tracing::debug!("Ignoring chunk for settled file {}", index);
            continue;
        }

        if let Err(reason) = write_chunk(&mut assemblers[index], &chunk, &mut tracker, &mut files[index]).await {
            return Err(abort_protocol(tx, reason));
        }
        reporters[index].report(files[index].bytes_acknowledged).await;

        if assemblers[index].is_complete() {
            settle_file(ctx, index, &mut assemblers[index], &mut tracker, &mut files[index], tx).await?;
        }
    }

    if tracker.is_complete() {
        ctx.advance(SessionTrigger::AllAcknowledged).await
    } else {
        Err(HandoffError::ChecksumMismatch {
            files: tracker.incomplete_files(),
        })
    }
}

async fn write_chunk(
    assembler: &mut FileAssembler,
    chunk: &Chunk,
    tracker: &mut AckTracker,
    file: &mut FileDescriptor,
) -> std::result::Result<(), String> {
    match assembler.write_chunk(chunk).await {
        Ok(ChunkOutcome::Written { bytes_received }) => {
            file.bytes_acknowledged = tracker
                .record_progress(assembler.index(), bytes_received)
                .map_err(|e| e.to_string())?;
            Ok(())
        }
        Ok(ChunkOutcome::Duplicate) => {
            tracing::debug!(
                "Duplicate chunk at {} for file {}",
                chunk.offset,
                chunk.file_index
            );
            Ok(())
        }
        Err(e) => Err(e.to_string()),
    }
}

/// Verify a fully received file and tell the sender how it went.
async fn settle_file(
    ctx: &SessionContext,
    index: usize,
    assembler: &mut FileAssembler,
    tracker: &mut AckTracker,
    file: &mut FileDescriptor,
    tx: &ChannelSender,
) -> Result<()> {
    let verdict = match assembler.finish().await {
        Ok(true) => Ok(()),
        Ok(false) => Err("checksum mismatch".to_string()),
        Err(e) => Err(format!("verification failed: {}", e)),
    };

    match verdict {
        Ok(()) => {
            tracker
                .acknowledge(index)
                .map_err(|e| HandoffError::Protocol(e.to_string()))?;
            file.bytes_acknowledged = file.size;
            tx.send(ChannelMsg::FileAck { file_index: index })?;
            tracing::info!("Received {} ({} bytes)", file.name, file.size);
            ctx.emit(SessionEvent::FileVerified {
                file_index: index,
                path: assembler.path().display().to_string(),
            })
            .await;
        }
        Err(reason) => {
            tracker
                .fail(index, reason.clone())
                .map_err(|e| HandoffError::Protocol(e.to_string()))?;
            assembler.discard().await;
            tx.send(ChannelMsg::FileFailed {
                file_index: index,
                reason: reason.clone(),
            })?;
            ctx.emit(SessionEvent::FileFailed {
                file_index: index,
                reason,
            })
            .await;
        }
    }
    Ok(())
}
