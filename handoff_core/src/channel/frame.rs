use anyhow::{Result, bail};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Upper bound on a single encoded frame (4 MiB)
pub const MAX_FRAME_LEN: usize = 4 * 1024 * 1024;

/// One entry of the transfer manifest
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub name: String,
    pub size: u64,
    /// BLAKE3 hex digest computed when the file was selected
    pub checksum: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub files: Vec<ManifestEntry>,
    pub total_size: u64,
    pub chunk_size: u32,
}

/// A slice of one file's bytes
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub file_index: usize,
    pub offset: u64,
    pub bytes: Vec<u8>,
    pub is_last: bool,
}

/// Messages on the direct peer-to-peer channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChannelMsg {
    Manifest(Manifest),
    Accept,
    Reject { reason: String },
    Chunk(Chunk),
    /// File fully received and its checksum verified
    FileAck { file_index: usize },
    /// File received but failed verification
    FileFailed { file_index: usize, reason: String },
    Cancel { reason: String },
    /// The peer broke the protocol; the session ends as a protocol failure
    ProtocolError { reason: String },
}

impl ChannelMsg {
    /// Bytes this message counts against the sender's flow-control budget.
    pub fn wire_cost(&self) -> u64 {
        match self {
            ChannelMsg::Chunk(chunk) => chunk.bytes.len() as u64,
            _ => 0,
        }
    }

    /// Short name for logs; chunk payloads are too large to print.
    pub fn kind(&self) -> &'static str {
        match self {
            ChannelMsg::Manifest(_) => "manifest",
            ChannelMsg::Accept => "accept",
            ChannelMsg::Reject { .. } => "reject",
            ChannelMsg::Chunk(_) => "chunk",
            ChannelMsg::FileAck { .. } => "file_ack",
            ChannelMsg::FileFailed { .. } => "file_failed",
            ChannelMsg::Cancel { .. } => "cancel",
            ChannelMsg::ProtocolError { .. } => "protocol_error",
        }
    }
}

/// Write one length-prefixed frame (4-byte big-endian length + bincode body).
pub async fn write_frame<W, T>(writer: &mut W, msg: &T) -> Result<()>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = bincode::serialize(msg)?;
    if body.len() > MAX_FRAME_LEN {
        bail!("frame of {} bytes exceeds limit of {}", body.len(), MAX_FRAME_LEN);
    }
    let len = (body.len() as u32).to_be_bytes();
    writer.write_all(&len).await?;
    writer.write_all(&body).await?;
    Ok(())
}

/// Read one frame; `Ok(None)` on a clean end of stream.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf).await {
        Ok(_) => {}
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    }
    let len = u32::from_be_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        bail!("peer announced frame of {} bytes, limit is {}", len, MAX_FRAME_LEN);
    }

    let mut buf = vec![0u8; len];
    reader.read_exact(&mut buf).await?;
    Ok(Some(bincode::deserialize(&buf)?))
}
