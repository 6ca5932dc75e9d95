//! Chunked, flow-controlled file transfer over an established channel.
//!
//! - `sender`: file selection, manifest, chunk emission under credit
//! - `receiver`: manifest validation and offset-based reassembly
//! - `hash`: BLAKE3 file digests
//! - `utils`: name sanitizing, destination paths, progress

pub mod constants;
pub mod hash;
pub mod receiver;
pub mod sender;
pub mod utils;

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::channel::ManifestEntry;
use constants::{DEFAULT_CHUNK_SIZE, DEFAULT_LOW_WATER_MARK};

pub use receiver::{ChunkOutcome, FileAssembler, prepare_assemblers, validate_manifest};
pub use sender::{build_manifest, select_files};

/// A file taking part in a session, as each peer sees it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileDescriptor {
    pub name: String,
    pub size: u64,
    /// BLAKE3 hex digest, computed once when the sender selected the file
    pub checksum: String,
    pub chunk_count: u64,
    /// Never decreases and never exceeds `size`
    pub bytes_acknowledged: u64,
    /// Local path: the source on the sender, the destination on the receiver
    #[serde(skip)]
    pub path: Option<PathBuf>,
}

impl FileDescriptor {
    pub fn from_entry(entry: &ManifestEntry, chunk_size: u32) -> Self {
        Self {
            name: entry.name.clone(),
            size: entry.size,
            checksum: entry.checksum.clone(),
            chunk_count: chunk_count(entry.size, chunk_size),
            bytes_acknowledged: 0,
            path: None,
        }
    }

    pub fn manifest_entry(&self) -> ManifestEntry {
        ManifestEntry {
            name: self.name.clone(),
            size: self.size,
            checksum: self.checksum.clone(),
        }
    }
}

/// Number of chunks a file of `size` bytes is sent in; an empty file still
/// takes one (empty, final) chunk.
pub fn chunk_count(size: u64, chunk_size: u32) -> u64 {
    if size == 0 {
        1
    } else {
        size.div_ceil(u64::from(chunk_size.max(1)))
    }
}

/// Chunking and flow-control parameters for one session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferEngine {
    pub chunk_size: u32,
    /// Emission pauses while more than this many bytes are buffered
    pub low_water_mark: u64,
}

impl Default for TransferEngine {
    fn default() -> Self {
        Self {
            chunk_size: DEFAULT_CHUNK_SIZE,
            low_water_mark: DEFAULT_LOW_WATER_MARK,
        }
    }
}
