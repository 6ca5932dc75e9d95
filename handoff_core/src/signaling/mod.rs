//! Signaling: the wire messages exchanged with the rendezvous server and the
//! peer-side client that speaks them.

pub mod client;
pub mod messages;

use std::future::Future;

pub use client::SignalingClient;
pub use messages::{ClientMessage, JoinRejectReason, ServerMessage};

use crate::error::Result;

/// The part of a signaling connection the handshake needs: send an opaque
/// payload to the other peer, and read what the server delivers.
pub trait SignalPipe: Send {
    fn relay(&self, payload: String) -> impl Future<Output = Result<()>> + Send;

    /// Next server message; `None` once the connection is gone.
    fn recv(&mut self) -> impl Future<Output = Option<ServerMessage>> + Send;
}

impl SignalPipe for SignalingClient {
    async fn relay(&self, payload: String) -> Result<()> {
        SignalingClient::relay(self, payload).await
    }

    async fn recv(&mut self) -> Option<ServerMessage> {
        SignalingClient::recv(self).await
    }
}
