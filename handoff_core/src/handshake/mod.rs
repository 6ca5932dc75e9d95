//! Handshake coordination: turn a paired room into a direct channel.
//!
//! The sending peer is the offerer. It opens a QUIC listener, relays an offer
//! (protocol version, certificate fingerprint, one-time token) and its host
//! candidates. The receiving peer answers, dials the candidates, and presents
//! the token on the first stream.
//!
//! The offer travels through the signaling server as plain JSON. Pinning the
//! fingerprint keeps the channel private from anyone between the peers, but a
//! signaling server that rewrote the offer could substitute its own certificate.

pub mod quic;
pub mod signal;

use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::time::Duration;

use futures_util::StreamExt;
use futures_util::stream::FuturesUnordered;
use thiserror::Error;

use crate::channel::ConnectionHandle;
use crate::channel::frame::{read_frame, write_frame};
use crate::signaling::{ServerMessage, SignalPipe};
pub use signal::{HandshakeSignal, Hello};

/// Bumped whenever the channel protocol changes incompatibly
pub const PROTOCOL_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum HandshakeFailure {
    #[error("handshake timed out")]
    Timeout,
    #[error("incompatible network: {0}")]
    IncompatibleNetwork(String),
    #[error("peer disconnected: {0}")]
    PeerDisconnected(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeRole {
    /// Listens and publishes candidates (the sender)
    Offerer,
    /// Dials the published candidates (the receiver)
    Answerer,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandshakeState {
    Idle,
    AwaitingRoom,
    ExchangingOffers,
    ExchangingCandidates,
    Connected,
    Failed(HandshakeFailure),
}

#[derive(Debug, Clone)]
pub struct HandshakeOptions {
    /// Where the offerer's listener binds
    pub bind_addr: SocketAddr,
    /// Deadline for the whole exchange
    pub timeout: Duration,
    /// Deadline for each dial attempt and for the token check
    pub connect_timeout: Duration,
}

impl Default for HandshakeOptions {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            timeout: Duration::from_secs(30),
            connect_timeout: Duration::from_secs(5),
        }
    }
}

type HandshakeResult<T> = std::result::Result<T, HandshakeFailure>;

pub struct HandshakeCoordinator {
    role: HandshakeRole,
    state: HandshakeState,
    options: HandshakeOptions,
}

impl HandshakeCoordinator {
    pub fn new(role: HandshakeRole, options: HandshakeOptions) -> Self {
        Self {
            role,
            state: HandshakeState::Idle,
            options,
        }
    }

    pub fn role(&self) -> HandshakeRole {
        self.role
    }

    pub fn state(&self) -> &HandshakeState {
        &self.state
    }

    /// The peer asked the server for (or to join) a room.
    pub fn begin(&mut self) {
        if self.state == HandshakeState::Idle {
            self.state = HandshakeState::AwaitingRoom;
        }
    }

    /// Both peers are attached to the room.
    pub fn room_paired(&mut self) {
        if matches!(self.state, HandshakeState::Idle | HandshakeState::AwaitingRoom) {
            self.state = HandshakeState::ExchangingOffers;
        }
    }

    /// Exchange offers and candidates through `signaling` until a direct
    /// channel is open. Failures are not retried.
    pub async fn negotiate<S: SignalPipe>(
        &mut self,
        signaling: &mut S,
    ) -> HandshakeResult<ConnectionHandle> {
        if matches!(
            self.state,
            HandshakeState::Connected | HandshakeState::Failed(_)
        ) {
            return Err(HandshakeFailure::IncompatibleNetwork(
                "handshake already finished".to_string(),
            ));
        }
        self.room_paired();

        let deadline = self.options.timeout;
        let result = match tokio::time::timeout(deadline, self.exchange(signaling)).await {
            Ok(result) => result,
            Err(_) => Err(HandshakeFailure::Timeout),
        };

        match result {
            Ok(handle) => {
                tracing::info!("Direct channel established ({:?})", self.role);
                self.state = HandshakeState::Connected;
                Ok(handle)
            }
            Err(failure) => {
                tracing::warn!("Handshake failed ({:?}): {}", self.role, failure);
                if !matches!(failure, HandshakeFailure::PeerDisconnected(_)) {
                    let notice = HandshakeSignal::Failed {
                        reason: failure.to_string(),
                    };
                    let _ = signaling.relay(notice.to_payload()).await;
                }
                self.state = HandshakeState::Failed(failure.clone());
                Err(failure)
            }
        }
    }

    async fn exchange<S: SignalPipe>(
        &mut self,
        signaling: &mut S,
    ) -> HandshakeResult<ConnectionHandle> {
        match self.role {
            HandshakeRole::Offerer => self.offer(signaling).await,
            HandshakeRole::Answerer => self.answer(signaling).await,
        }
    }

    async fn offer<S: SignalPipe>(&mut self, signaling: &mut S) -> HandshakeResult<ConnectionHandle> {
        let (endpoint, fingerprint) = quic::make_server_endpoint(self.options.bind_addr)
            .map_err(|e| HandshakeFailure::IncompatibleNetwork(format!("cannot listen: {}", e)))?;
        let port = endpoint
            .local_addr()
            .map_err(|e| HandshakeFailure::IncompatibleNetwork(e.to_string()))?
            .port();
        let token = uuid::Uuid::new_v4().simple().to_string();

        send_signal(
            signaling,
            HandshakeSignal::Offer {
                version: PROTOCOL_VERSION,
                fingerprint,
                token: token.clone(),
            },
        )
        .await?;

        loop {
            match next_signal(signaling).await? {
                HandshakeSignal::Answer { version } if version == PROTOCOL_VERSION => break,
                HandshakeSignal::Answer { version } => {
                    return Err(HandshakeFailure::IncompatibleNetwork(format!(
                        "peer speaks protocol {}, expected {}",
                        version, PROTOCOL_VERSION
                    )));
                }
                other => tracing::debug!("Ignoring {:?} while awaiting answer", other),
            }
        }

        self.state = HandshakeState::ExchangingCandidates;
        for addr in quic::gather_host_candidates(port) {
            send_signal(signaling, HandshakeSignal::Candidate { addr }).await?;
        }
        send_signal(signaling, HandshakeSignal::EndOfCandidates).await?;

        let connect_timeout = self.options.connect_timeout;
        let (connection, send, recv) = loop {
            // The dialer drops its signaling socket right after the hello, so
            // a pending connection must win over the disconnect notice
            tokio::select! {
                biased;
                incoming = endpoint.accept() => {
                    let Some(incoming) = incoming else {
                        return Err(HandshakeFailure::IncompatibleNetwork("listener closed".to_string()));
                    };
                    match accept_hello(incoming, &token, connect_timeout).await {
                        Ok(accepted) => break accepted,
                        Err(e) => tracing::warn!("Rejected direct connection attempt: {}", e),
                    }
                }
                signal = next_signal(signaling) => {
                    let signal = signal?;
                    tracing::debug!("Ignoring {:?} while awaiting the dialer", signal);
                }
            }
        };

        tracing::debug!("Accepted direct channel from {}", connection.remote_address());
        Ok(ConnectionHandle::over_quic(endpoint, connection, send, recv))
    }

    async fn answer<S: SignalPipe>(&mut self, signaling: &mut S) -> HandshakeResult<ConnectionHandle> {
        let (fingerprint, token) = loop {
            match next_signal(signaling).await? {
                HandshakeSignal::Offer {
                    version,
                    fingerprint,
                    token,
                } => {
                    if version != PROTOCOL_VERSION {
                        return Err(HandshakeFailure::IncompatibleNetwork(format!(
                            "peer speaks protocol {}, expected {}",
                            version, PROTOCOL_VERSION
                        )));
                    }
                    break (fingerprint, token);
                }
                other => tracing::debug!("Ignoring {:?} while awaiting offer", other),
            }
        };

        send_signal(
            signaling,
            HandshakeSignal::Answer {
                version: PROTOCOL_VERSION,
            },
        )
        .await?;

        self.state = HandshakeState::ExchangingCandidates;
        let mut candidates = Vec::new();
        loop {
            match next_signal(signaling).await? {
                HandshakeSignal::Candidate { addr } => candidates.push(addr),
                HandshakeSignal::EndOfCandidates => break,
                other => tracing::debug!("Ignoring {:?} while collecting candidates", other),
            }
        }
        tracing::debug!("Dialing {} candidate(s)", candidates.len());

        let endpoint = quic::make_client_endpoint(&fingerprint)
            .map_err(|e| HandshakeFailure::IncompatibleNetwork(format!("cannot dial: {}", e)))?;
        let connection = dial_first(&endpoint, &candidates, self.options.connect_timeout)
            .await
            .ok_or_else(|| {
                HandshakeFailure::IncompatibleNetwork("no candidate was reachable".to_string())
            })?;

        let (mut send, recv) = connection
            .open_bi()
            .await
            .map_err(|e| HandshakeFailure::IncompatibleNetwork(e.to_string()))?;
        write_frame(&mut send, &Hello { token })
            .await
            .map_err(|e| HandshakeFailure::IncompatibleNetwork(e.to_string()))?;

        tracing::debug!("Dialed direct channel to {}", connection.remote_address());
        Ok(ConnectionHandle::over_quic(endpoint, connection, send, recv))
    }
}

async fn send_signal<S: SignalPipe>(signaling: &S, signal: HandshakeSignal) -> HandshakeResult<()> {
    signaling
        .relay(signal.to_payload())
        .await
        .map_err(|e| HandshakeFailure::PeerDisconnected(e.to_string()))
}

/// Next handshake message from the other peer.
async fn next_signal<S: SignalPipe>(signaling: &mut S) -> HandshakeResult<HandshakeSignal> {
    loop {
        match signaling.recv().await {
            Some(ServerMessage::Relay { payload }) => match HandshakeSignal::from_payload(&payload) {
                Ok(HandshakeSignal::Failed { reason }) => {
                    return Err(HandshakeFailure::IncompatibleNetwork(reason));
                }
                Ok(signal) => return Ok(signal),
                Err(e) => tracing::warn!("Ignoring unreadable handshake payload: {}", e),
            },
            Some(ServerMessage::PeerDisconnected { reason }) => {
                return Err(HandshakeFailure::PeerDisconnected(reason));
            }
            Some(ServerMessage::Error { message }) => {
                return Err(HandshakeFailure::PeerDisconnected(message));
            }
            Some(other) => tracing::debug!("Ignoring {:?} during handshake", other),
            None => {
                return Err(HandshakeFailure::PeerDisconnected(
                    "signaling connection lost".to_string(),
                ));
            }
        }
    }
}

async fn accept_hello(
    incoming: quinn::Incoming,
    token: &str,
    wait: Duration,
) -> anyhow::Result<(quinn::Connection, quinn::SendStream, quinn::RecvStream)> {
    let accept = async {
        let connection = incoming.await?;
        let (send, mut recv) = connection.accept_bi().await?;
        match read_frame::<_, Hello>(&mut recv).await? {
            Some(hello) if hello.token == token => Ok((connection, send, recv)),
            _ => {
                connection.close(1u32.into(), b"bad token");
                anyhow::bail!("wrong session token from {}", connection.remote_address())
            }
        }
    };
    tokio::time::timeout(wait, accept).await?
}

async fn dial_candidate(
    endpoint: &quinn::Endpoint,
    addr: SocketAddr,
    wait: Duration,
) -> anyhow::Result<quinn::Connection> {
    let connecting = endpoint.connect(addr, quic::SERVER_NAME)?;
    Ok(tokio::time::timeout(wait, connecting).await??)
}

/// Dial every candidate at once; the first completed connection wins.
async fn dial_first(
    endpoint: &quinn::Endpoint,
    candidates: &[SocketAddr],
    wait: Duration,
) -> Option<quinn::Connection> {
    let mut attempts: FuturesUnordered<_> = candidates
        .iter()
        .map(|&addr| async move { (addr, dial_candidate(endpoint, addr, wait).await) })
        .collect();

    while let Some((addr, result)) = attempts.next().await {
        match result {
            Ok(connection) => return Some(connection),
            Err(e) => tracing::debug!("Candidate {} unreachable: {}", addr, e),
        }
    }
    None
}
