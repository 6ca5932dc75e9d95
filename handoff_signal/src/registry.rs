//! Room registry: the only state the signaling server shares between peers.
//!
//! The outer table lock is held only to look up, insert or remove a room.
//! Everything that happens inside a room runs under that room's own mutex,
//! so traffic in one room never waits on another.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use handoff_core::code::{Code, CodeError, CodeGenerator};
use handoff_core::signaling::{JoinRejectReason, ServerMessage};
use thiserror::Error;
use tokio::sync::{Mutex, RwLock, mpsc};
use uuid::Uuid;

use crate::config::SignalConfig;

/// Relays an owner may send before anyone has joined
const MAX_PARKED_RELAYS: usize = 16;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SignalError {
    #[error("no room with that code")]
    NotFound,
    #[error("room already has a receiver")]
    AlreadyClaimed,
    #[error("room expired")]
    Expired,
    #[error("the other peer is gone")]
    PeerGone,
    #[error("too many open rooms")]
    Capacity,
    #[error("connection already belongs to a room")]
    AlreadyAttached,
    #[error(transparent)]
    Code(#[from] CodeError),
}

impl SignalError {
    /// The wire reason for errors that end a join attempt
    pub fn join_reject_reason(&self) -> Option<JoinRejectReason> {
        match self {
            SignalError::NotFound => Some(JoinRejectReason::NotFound),
            SignalError::AlreadyClaimed => Some(JoinRejectReason::AlreadyClaimed),
            SignalError::Expired => Some(JoinRejectReason::Expired),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoomState {
    WaitingForReceiver,
    Pairing,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Side {
    Owner,
    Receiver,
}

/// One connected peer as the registry sees it: an id and its outbound queue.
#[derive(Debug, Clone)]
pub struct PeerLink {
    pub id: Uuid,
    pub tx: mpsc::Sender<ServerMessage>,
}

impl PeerLink {
    pub fn new(tx: mpsc::Sender<ServerMessage>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }
}

/// Proof that a connection is attached to a room on one side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RoomHandle {
    pub code: Code,
    pub side: Side,
    pub peer_id: Uuid,
}

struct Room {
    created_at: Instant,
    state: RoomState,
    owner: PeerLink,
    receiver: Option<PeerLink>,
    /// Offer data the owner relayed before the receiver attached
    parked: Vec<String>,
}

impl Room {
    fn is_member(&self, handle: &RoomHandle) -> bool {
        match handle.side {
            Side::Owner => self.owner.id == handle.peer_id,
            Side::Receiver => self
                .receiver
                .as_ref()
                .is_some_and(|r| r.id == handle.peer_id),
        }
    }

    fn counterpart(&self, side: Side) -> Option<&PeerLink> {
        match side {
            Side::Owner => self.receiver.as_ref(),
            Side::Receiver => Some(&self.owner),
        }
    }
}

#[derive(Default)]
struct Tables {
    rooms: HashMap<Code, Arc<Mutex<Room>>>,
    /// Codes of reaped rooms, kept for one more idle window
    tombstones: HashMap<Code, Instant>,
}

pub struct RoomRegistry {
    tables: RwLock<Tables>,
    generator: CodeGenerator,
    idle_timeout: Duration,
    relay_timeout: Duration,
    max_rooms: usize,
}

impl RoomRegistry {
    pub fn new(config: &SignalConfig) -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
            generator: CodeGenerator::new(),
            idle_timeout: config.idle_timeout,
            relay_timeout: config.relay_timeout,
            max_rooms: config.max_rooms,
        }
    }

    pub fn idle_timeout(&self) -> Duration {
        self.idle_timeout
    }

    /// Open a room owned by `owner`, waiting for a receiver.
    pub async fn create_room(&self, owner: PeerLink) -> Result<RoomHandle, SignalError> {
        let mut tables = self.tables.write().await;
        if tables.rooms.len() >= self.max_rooms {
            tracing::warn!("Refusing new room: {} rooms open", tables.rooms.len());
            return Err(SignalError::Capacity);
        }

        let code = self.generator.generate(|candidate| {
            tables.rooms.contains_key(candidate) || tables.tombstones.contains_key(candidate)
        })?;
        let handle = RoomHandle {
            code: code.clone(),
            side: Side::Owner,
            peer_id: owner.id,
        };
        tables.rooms.insert(
            code.clone(),
            Arc::new(Mutex::new(Room {
                created_at: Instant::now(),
                state: RoomState::WaitingForReceiver,
                owner,
                receiver: None,
                parked: Vec::new(),
            })),
        );
        tracing::info!("Room {} created ({} open)", code, tables.rooms.len());
        Ok(handle)
    }

    /// Attach `receiver` to the room behind `code`.
    ///
    /// Exactly one caller wins a given room. Failed attempts leave the room
    /// untouched for its legitimate receiver.
    pub async fn join_room(&self, code: &Code, receiver: PeerLink) -> Result<RoomHandle, SignalError> {
        let room = {
            let tables = self.tables.read().await;
            match tables.rooms.get(code) {
                Some(room) => room.clone(),
                None if tables.tombstones.contains_key(code) => return Err(SignalError::Expired),
                None => return Err(SignalError::NotFound),
            }
        };

        let mut room = room.lock().await;
        let expired = room.created_at.elapsed() >= self.idle_timeout;
        match room.state {
            RoomState::Pairing => return Err(SignalError::AlreadyClaimed),
            RoomState::Closed if expired => return Err(SignalError::Expired),
            RoomState::Closed => return Err(SignalError::NotFound),
            RoomState::WaitingForReceiver if expired => return Err(SignalError::Expired),
            RoomState::WaitingForReceiver => {}
        }

        room.state = RoomState::Pairing;
        room.receiver = Some(receiver.clone());
        let handle = RoomHandle {
            code: code.clone(),
            side: Side::Receiver,
            peer_id: receiver.id,
        };
        tracing::info!("Room {} paired", code);

        // Still under the room lock, so nothing the owner relays next can overtake these
        self.deliver(&receiver.tx, ServerMessage::Joined { code: code.clone() })
            .await;
        for payload in std::mem::take(&mut room.parked) {
            self.deliver(&receiver.tx, ServerMessage::Relay { payload })
                .await;
        }
        if !self.deliver(&room.owner.tx, ServerMessage::PeerJoined).await {
            tracing::warn!("Owner of room {} is unreachable", code);
        }
        Ok(handle)
    }

    /// Forward an opaque payload to the other peer in the room.
    pub async fn relay(&self, handle: &RoomHandle, payload: String) -> Result<(), SignalError> {
        let room = self.lookup(&handle.code).await.ok_or(SignalError::PeerGone)?;
        let target = {
            let mut room = room.lock().await;
            if room.state == RoomState::Closed || !room.is_member(handle) {
                return Err(SignalError::PeerGone);
            }
            match room.counterpart(handle.side) {
                Some(peer) => peer.tx.clone(),
                None => {
                    if room.parked.len() >= MAX_PARKED_RELAYS {
                        return Err(SignalError::PeerGone);
                    }
                    tracing::debug!("Parking relay for room {} until a receiver joins", handle.code);
                    room.parked.push(payload);
                    return Ok(());
                }
            }
        };

        target
            .send_timeout(ServerMessage::Relay { payload }, self.relay_timeout)
            .await
            .map_err(|_| SignalError::PeerGone)
    }

    /// Close the room and tell the other peer why. Returns false when the
    /// handle no longer refers to a live room.
    pub async fn leave(&self, handle: &RoomHandle, reason: &str) -> bool {
        let Some(room) = self.lookup(&handle.code).await else {
            return false;
        };
        let other = {
            let mut guard = room.lock().await;
            if guard.state == RoomState::Closed || !guard.is_member(handle) {
                return false;
            }
            guard.state = RoomState::Closed;
            guard.parked.clear();
            guard.counterpart(handle.side).map(|peer| peer.tx.clone())
        };

        {
            let mut tables = self.tables.write().await;
            if tables
                .rooms
                .get(&handle.code)
                .is_some_and(|current| Arc::ptr_eq(current, &room))
            {
                tables.rooms.remove(&handle.code);
            }
        }
        tracing::info!("Room {} closed by {:?}: {}", handle.code, handle.side, reason);

        if let Some(tx) = other {
            self.deliver(
                &tx,
                ServerMessage::PeerDisconnected {
                    reason: reason.to_string(),
                },
            )
            .await;
        }
        true
    }

    /// Close rooms nobody joined within the idle window. Returns how many.
    pub async fn reap_expired(&self) -> usize {
        let snapshot: Vec<(Code, Arc<Mutex<Room>>)> = {
            let tables = self.tables.read().await;
            tables
                .rooms
                .iter()
                .map(|(code, room)| (code.clone(), room.clone()))
                .collect()
        };

        let mut expired = Vec::new();
        for (code, room) in snapshot {
            let owner = {
                let mut room = room.lock().await;
                if room.state != RoomState::WaitingForReceiver
                    || room.created_at.elapsed() < self.idle_timeout
                {
                    continue;
                }
                room.state = RoomState::Closed;
                room.parked.clear();
                room.owner.tx.clone()
            };
            self.deliver(&owner, ServerMessage::RoomExpired).await;
            expired.push((code, room));
        }

        let now = Instant::now();
        let mut tables = self.tables.write().await;
        for (code, room) in &expired {
            if tables
                .rooms
                .get(code)
                .is_some_and(|current| Arc::ptr_eq(current, room))
            {
                tables.rooms.remove(code);
            }
            tables.tombstones.insert(code.clone(), now);
        }
        let idle = self.idle_timeout;
        tables.tombstones.retain(|_, at| now.duration_since(*at) < idle);

        if !expired.is_empty() {
            tracing::info!("Reaped {} idle room(s)", expired.len());
        }
        expired.len()
    }

    /// Whether `handle` still belongs to a live room
    pub async fn is_attached(&self, handle: &RoomHandle) -> bool {
        let Some(room) = self.lookup(&handle.code).await else {
            return false;
        };
        let guard = room.lock().await;
        guard.state != RoomState::Closed && guard.is_member(handle)
    }

    pub async fn room_count(&self) -> usize {
        self.tables.read().await.rooms.len()
    }

    pub async fn room_state(&self, code: &Code) -> Option<RoomState> {
        let room = self.lookup(code).await?;
        let state = room.lock().await.state;
        Some(state)
    }

    /// Drop every room, telling attached peers the server is going away.
    pub async fn clear(&self) {
        let rooms: Vec<Arc<Mutex<Room>>> = {
            let mut tables = self.tables.write().await;
            tables.tombstones.clear();
            tables.rooms.drain().map(|(_, room)| room).collect()
        };
        for room in &rooms {
            let mut room = room.lock().await;
            room.state = RoomState::Closed;
            let notice = ServerMessage::PeerDisconnected {
                reason: "signaling server shutting down".to_string(),
            };
            let _ = room.owner.tx.try_send(notice.clone());
            if let Some(receiver) = &room.receiver {
                let _ = receiver.tx.try_send(notice);
            }
        }
        if !rooms.is_empty() {
            tracing::info!("Cleared {} room(s)", rooms.len());
        }
    }

    async fn lookup(&self, code: &Code) -> Option<Arc<Mutex<Room>>> {
        self.tables.read().await.rooms.get(code).cloned()
    }

    async fn deliver(&self, tx: &mpsc::Sender<ServerMessage>, msg: ServerMessage) -> bool {
        tx.send_timeout(msg, self.relay_timeout).await.is_ok()
    }
}
