//! Rendezvous server for handoff peers.
//!
//! Issues room codes, pairs exactly one receiver with each sender and relays
//! opaque handshake data between them. File bytes never pass through here.

pub mod config;
pub mod registry;
pub mod server;

pub use config::SignalConfig;
pub use registry::{RoomRegistry, RoomState, SignalError};
pub use server::SignalServer;
