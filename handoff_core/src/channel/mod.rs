//! Direct peer-to-peer channel.
//!
//! A `ConnectionHandle` is what the handshake hands to the session: an ordered,
//! reliable message pipe to the other peer. Two transports back it, a QUIC
//! bidirectional stream and an in-memory pair used by tests.

pub mod flow;
pub mod frame;

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub use flow::BufferedAmount;
pub use frame::{ChannelMsg, Chunk, Manifest, ManifestEntry};

use crate::error::HandoffError;
use frame::{read_frame, write_frame};

/// Inbound messages queued ahead of the session driver
const INBOUND_DEPTH: usize = 64;

/// How long a finished writer waits for the peer to drain the stream
const FLUSH_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("direct channel closed")]
pub struct ChannelClosed;

impl From<ChannelClosed> for HandoffError {
    fn from(_: ChannelClosed) -> Self {
        HandoffError::PeerDisconnected("direct channel closed".to_string())
    }
}

/// Ordered message pipe to the other peer
pub struct ConnectionHandle {
    sender: ChannelSender,
    receiver: ChannelReceiver,
}

/// Sending half. Cloneable so control messages can be sent while chunks are pumped.
#[derive(Clone)]
pub struct ChannelSender {
    outbound: mpsc::UnboundedSender<ChannelMsg>,
    buffered: Arc<BufferedAmount>,
    closed: CancellationToken,
}

pub struct ChannelReceiver {
    inbound: mpsc::Receiver<ChannelMsg>,
}

impl ConnectionHandle {
    pub fn split(self) -> (ChannelSender, ChannelReceiver) {
        (self.sender, self.receiver)
    }

    pub fn sender(&self) -> &ChannelSender {
        &self.sender
    }

    /// Two connected handles in one process.
    ///
    /// `queue_depth` bounds how many messages sit in each delivery queue, so a
    /// slow reader produces back-pressure the same way a real transport does.
    pub fn memory_pair(queue_depth: usize) -> (ConnectionHandle, ConnectionHandle) {
        let (a_out_tx, a_out_rx) = mpsc::unbounded_channel();
        let (b_out_tx, b_out_rx) = mpsc::unbounded_channel();
        let (a_in_tx, a_in_rx) = mpsc::channel(queue_depth.max(1));
        let (b_in_tx, b_in_rx) = mpsc::channel(queue_depth.max(1));

        let a_sender = ChannelSender::new(a_out_tx);
        let b_sender = ChannelSender::new(b_out_tx);

        spawn_memory_pump(a_out_rx, b_in_tx, a_sender.buffered.clone(), a_sender.closed.clone());
        spawn_memory_pump(b_out_rx, a_in_tx, b_sender.buffered.clone(), b_sender.closed.clone());

        (
            ConnectionHandle {
                sender: a_sender,
                receiver: ChannelReceiver { inbound: a_in_rx },
            },
            ConnectionHandle {
                sender: b_sender,
                receiver: ChannelReceiver { inbound: b_in_rx },
            },
        )
    }

    /// Wrap an established QUIC connection and its first bidirectional stream.
    pub(crate) fn over_quic(
        endpoint: quinn::Endpoint,
        connection: quinn::Connection,
        send: quinn::SendStream,
        recv: quinn::RecvStream,
    ) -> ConnectionHandle {
        let (out_tx, out_rx) = mpsc::unbounded_channel();
        let (in_tx, in_rx) = mpsc::channel(INBOUND_DEPTH);
        let sender = ChannelSender::new(out_tx);

        tokio::spawn(quic_writer(
            endpoint,
            connection,
            send,
            out_rx,
            sender.buffered.clone(),
            sender.closed.clone(),
        ));
        tokio::spawn(quic_reader(recv, in_tx, sender.closed.clone()));

        ConnectionHandle {
            sender,
            receiver: ChannelReceiver { inbound: in_rx },
        }
    }
}

impl ChannelSender {
    fn new(outbound: mpsc::UnboundedSender<ChannelMsg>) -> Self {
        Self {
            outbound,
            buffered: Arc::new(BufferedAmount::new()),
            closed: CancellationToken::new(),
        }
    }

    /// Queue a message; never blocks. Chunk producers must pair this with
    /// [`ChannelSender::wait_for_credit`].
    pub fn send(&self, msg: ChannelMsg) -> Result<(), ChannelClosed> {
        if self.closed.is_cancelled() {
            return Err(ChannelClosed);
        }
        let cost = msg.wire_cost();
        self.buffered.add(cost);
        if self.outbound.send(msg).is_err() {
            self.buffered.release(cost);
            return Err(ChannelClosed);
        }
        Ok(())
    }

    /// Suspend until the outstanding buffered bytes are at most `low_water`.
    pub async fn wait_for_credit(&self, low_water: u64) -> Result<(), ChannelClosed> {
        tokio::select! {
            _ = self.buffered.wait_at_most(low_water) => Ok(()),
            _ = self.closed.cancelled() => Err(ChannelClosed),
        }
    }

    /// Bytes handed to the channel and not yet written by the transport
    pub fn buffered_amount(&self) -> u64 {
        self.buffered.get()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Resolves once the transport under this channel is gone.
    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

impl ChannelReceiver {
    /// Next message; `None` once the peer is gone.
    pub async fn recv(&mut self) -> Option<ChannelMsg> {
        self.inbound.recv().await
    }
}

fn spawn_memory_pump(
    mut outbound: mpsc::UnboundedReceiver<ChannelMsg>,
    peer_inbound: mpsc::Sender<ChannelMsg>,
    buffered: Arc<BufferedAmount>,
    closed: CancellationToken,
) {
    tokio::spawn(async move {
        while let Some(msg) = outbound.recv().await {
            let cost = msg.wire_cost();
            if peer_inbound.send(msg).await.is_err() {
                break;
            }
            buffered.release(cost);
        }
        closed.cancel();
    });
}

async fn quic_writer(
    endpoint: quinn::Endpoint,
    connection: quinn::Connection,
    mut send: quinn::SendStream,
    mut outbound: mpsc::UnboundedReceiver<ChannelMsg>,
    buffered: Arc<BufferedAmount>,
    closed: CancellationToken,
) {
    let mut clean = true;
    loop {
        tokio::select! {
            msg = outbound.recv() => {
                let Some(msg) = msg else { break };
                let cost = msg.wire_cost();
                if let Err(e) = write_frame(&mut send, &msg).await {
                    tracing::warn!("Direct channel write failed: {}", e);
                    clean = false;
                    break;
                }
                buffered.release(cost);
            }
            _ = closed.cancelled() => {
                clean = false;
                break;
            }
        }
    }
    closed.cancel();

    if clean {
        let _ = send.finish();
        let _ = tokio::time::timeout(FLUSH_TIMEOUT, send.stopped()).await;
    }
    connection.close(0u32.into(), b"done");
    tracing::debug!("Direct channel to {} closed", connection.remote_address());
    drop(endpoint);
}

async fn quic_reader(
    mut recv: quinn::RecvStream,
    inbound: mpsc::Sender<ChannelMsg>,
    closed: CancellationToken,
) {
    loop {
        match read_frame::<_, ChannelMsg>(&mut recv).await {
            Ok(Some(msg)) => {
                if inbound.send(msg).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::debug!("Direct channel read ended: {}", e);
                break;
            }
        }
    }
    closed.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chunk(len: usize) -> ChannelMsg {
        ChannelMsg::Chunk(Chunk {
            file_index: 0,
            offset: 0,
            bytes: vec![0u8; len],
            is_last: false,
        })
    }

    #[tokio::test]
    async fn test_memory_pair_preserves_order() {
        let (a, b) = ConnectionHandle::memory_pair(4);
        let (a_tx, _a_rx) = a.split();
        let (_b_tx, mut b_rx) = b.split();

        a_tx.send(ChannelMsg::Accept).unwrap();
        a_tx.send(ChannelMsg::FileAck { file_index: 3 }).unwrap();

        assert_eq!(b_rx.recv().await, Some(ChannelMsg::Accept));
        assert_eq!(b_rx.recv().await, Some(ChannelMsg::FileAck { file_index: 3 }));
    }

    #[tokio::test]
    async fn test_buffered_amount_tracks_undelivered_chunks() {
        // One slot: the pump holds one message while another waits in the queue
        let (a, b) = ConnectionHandle::memory_pair(1);
        let (a_tx, _a_rx) = a.split();
        let (_b_tx, mut b_rx) = b.split();

        for _ in 0..4 {
            a_tx.send(chunk(1000)).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(a_tx.buffered_amount() >= 2000);

        for _ in 0..4 {
            b_rx.recv().await.unwrap();
        }
        a_tx.wait_for_credit(0).await.unwrap();
        assert_eq!(a_tx.buffered_amount(), 0);
    }

    #[tokio::test]
    async fn test_dropping_a_peer_closes_the_other_side() {
        let (a, b) = ConnectionHandle::memory_pair(4);
        let (a_tx, mut a_rx) = a.split();
        drop(b);

        assert_eq!(a_rx.recv().await, None);

        // A producer waiting for credit is released instead of hanging
        a_tx.send(chunk(10)).ok();
        let result = tokio::time::timeout(Duration::from_secs(1), a_tx.wait_for_credit(0)).await;
        assert!(result.is_ok());
        assert!(a_tx.is_closed() || a_tx.buffered_amount() == 0);
    }
}
