use anyhow::{Context, Result, anyhow, bail};
use std::collections::BTreeMap;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::fs::File;
use tokio::io::{AsyncSeekExt, AsyncWriteExt};

use super::constants::{MAX_CHUNK_SIZE, MAX_MANIFEST_FILES};
use super::hash::compute_file_hash;
use super::utils::{open_secure_file, sanitize_file_name, unique_destination, validate_transfer_info};
use crate::channel::{Chunk, Manifest, ManifestEntry};

/// Check a manifest against the receiver's limits before asking the user.
pub fn validate_manifest(manifest: &Manifest) -> Result<()> {
    if manifest.files.is_empty() {
        bail!("manifest lists no files");
    }
    if manifest.files.len() > MAX_MANIFEST_FILES {
        bail!(
            "manifest lists {} files, max {}",
            manifest.files.len(),
            MAX_MANIFEST_FILES
        );
    }
    if manifest.chunk_size == 0 || manifest.chunk_size > MAX_CHUNK_SIZE {
        bail!("unsupported chunk size {}", manifest.chunk_size);
    }

    let mut total = 0u64;
    for entry in &manifest.files {
        validate_transfer_info(&entry.name, entry.size)?;
        if entry.checksum.len() != 64 || !entry.checksum.chars().all(|c| c.is_ascii_hexdigit()) {
            bail!("{} carries a malformed checksum", entry.name);
        }
        total = total
            .checked_add(entry.size)
            .ok_or_else(|| anyhow!("manifest total size overflows"))?;
    }
    if total != manifest.total_size {
        bail!(
            "manifest total {} does not match its files ({})",
            manifest.total_size,
            total
        );
    }
    Ok(())
}

/// Create one destination file per manifest entry under `download_dir`.
pub async fn prepare_assemblers(
    manifest: &Manifest,
    download_dir: &Path,
) -> Result<Vec<FileAssembler>> {
    tokio::fs::create_dir_all(download_dir)
        .await
        .with_context(|| format!("cannot create {}", download_dir.display()))?;

    let mut assemblers = Vec::with_capacity(manifest.files.len());
    for (index, entry) in manifest.files.iter().enumerate() {
        let name = sanitize_file_name(&entry.name);
        let path = unique_destination(download_dir, &name).await;
        match FileAssembler::create(index, entry, path).await {
            Ok(assembler) => assemblers.push(assembler),
            Err(e) => {
                for mut created in assemblers {
                    created.discard().await;
                }
                return Err(e);
            }
        }
    }
    Ok(assemblers)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChunkOutcome {
    Written { bytes_received: u64 },
    /// Bytes already present; nothing written
    Duplicate,
}

/// Rebuilds one file from chunks delivered in any order.
///
/// Each chunk is written at its own offset, so no reorder buffer is kept;
/// only the set of byte ranges already present is tracked.
#[derive(Debug)]
pub struct FileAssembler {
    index: usize,
    expected_size: u64,
    checksum: String,
    path: PathBuf,
    file: Option<File>,
    /// Received ranges, start -> end (exclusive), adjacent ranges merged
    ranges: BTreeMap<u64, u64>,
    bytes_received: u64,
    saw_last: bool,
    verified: bool,
}

impl FileAssembler {
    pub async fn create(index: usize, entry: &ManifestEntry, path: PathBuf) -> Result<Self> {
        let file = open_secure_file(&path, entry.size)
            .await
            .with_context(|| format!("cannot create {}", path.display()))?;
        tracing::debug!("Receiving {} into {}", entry.name, path.display());

        Ok(Self {
            index,
            expected_size: entry.size,
            checksum: entry.checksum.clone(),
            path,
            file: Some(file),
            ranges: BTreeMap::new(),
            bytes_received: 0,
            saw_last: false,
            verified: false,
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn bytes_received(&self) -> u64 {
        self.bytes_received
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Every byte of the file is present
    pub fn is_complete(&self) -> bool {
        self.bytes_received == self.expected_size && (self.expected_size > 0 || self.saw_last)
    }

    pub async fn write_chunk(&mut self, chunk: &Chunk) -> Result<ChunkOutcome> {
        let len = chunk.bytes.len() as u64;
        let end = chunk
            .offset
            .checked_add(len)
            .ok_or_else(|| anyhow!("chunk offset overflows"))?;
        if end > self.expected_size {
            bail!(
                "chunk {}..{} overruns file {} of {} bytes",
                chunk.offset,
                end,
                self.index,
                self.expected_size
            );
        }
        if chunk.is_last && end != self.expected_size {
            bail!("final chunk of file {} ends at {}", self.index, end);
        }

        if len == 0 {
            self.saw_last |= chunk.is_last;
            return Ok(ChunkOutcome::Written {
                bytes_received: self.bytes_received,
            });
        }

        if let Some((_, &prev_end)) = self.ranges.range(..=chunk.offset).next_back() {
            if prev_end >= end {
                return Ok(ChunkOutcome::Duplicate);
            }
            if prev_end > chunk.offset {
                bail!("chunk at {} overlaps received data", chunk.offset);
            }
        }
        if let Some((&next_start, _)) = self.ranges.range(chunk.offset..).next() {
            if next_start < end {
                bail!("chunk at {} overlaps received data", chunk.offset);
            }
        }

        let file = self
            .file
            .as_mut()
            .ok_or_else(|| anyhow!("file {} is already closed", self.index))?;
        file.seek(SeekFrom::Start(chunk.offset)).await?;
        file.write_all(&chunk.bytes).await?;

        self.insert_range(chunk.offset, end);
        self.bytes_received += len;
        self.saw_last |= chunk.is_last;
        Ok(ChunkOutcome::Written {
            bytes_received: self.bytes_received,
        })
    }

    fn insert_range(&mut self, start: u64, end: u64) {
        let mut merged_start = start;
        let mut merged_end = end;
        if let Some((&prev_start, &prev_end)) = self.ranges.range(..start).next_back() {
            if prev_end == start {
                merged_start = prev_start;
            }
        }
        if let Some(next_end) = self.ranges.remove(&end) {
            merged_end = next_end;
        }
        self.ranges.insert(merged_start, merged_end);
    }

    /// Flush to disk and compare the digest with the manifest.
    pub async fn finish(&mut self) -> Result<bool> {
        if let Some(mut file) = self.file.take() {
            file.flush().await?;
            file.sync_all().await?;
        }
        let digest = compute_file_hash(&self.path).await?;
        self.verified = digest == self.checksum;
        if !self.verified {
            tracing::warn!(
                "Checksum mismatch for {}: expected {}, got {}",
                self.path.display(),
                self.checksum,
                digest
            );
        }
        Ok(self.verified)
    }

    /// Close the file and delete it unless it was verified.
    pub async fn discard(&mut self) {
        self.file.take();
        if !self.verified {
            if let Err(e) = tokio::fs::remove_file(&self.path).await {
                tracing::debug!("Could not remove {}: {}", self.path.display(), e);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry_for(data: &[u8]) -> ManifestEntry {
        ManifestEntry {
            name: "data.bin".to_string(),
            size: data.len() as u64,
            checksum: blake3::hash(data).to_hex().to_string(),
        }
    }

    fn chunks_of(data: &[u8], size: usize) -> Vec<Chunk> {
        let mut chunks: Vec<Chunk> = data
            .chunks(size)
            .enumerate()
            .map(|(i, bytes)| Chunk {
                file_index: 0,
                offset: (i * size) as u64,
                bytes: bytes.to_vec(),
                is_last: false,
            })
            .collect();
        if let Some(last) = chunks.last_mut() {
            last.is_last = true;
        }
        chunks
    }

    #[tokio::test]
    async fn test_duplicate_chunk_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![9u8; 100];
        let mut assembler = FileAssembler::create(0, &entry_for(&data), dir.path().join("f"))
            .await
            .unwrap();
        let chunks = chunks_of(&data, 40);

        assembler.write_chunk(&chunks[0]).await.unwrap();
        assert_eq!(
            assembler.write_chunk(&chunks[0]).await.unwrap(),
            ChunkOutcome::Duplicate
        );
        assert_eq!(assembler.bytes_received(), 40);
    }

    #[tokio::test]
    async fn test_chunk_past_declared_size_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let data = vec![1u8; 10];
        let mut assembler = FileAssembler::create(0, &entry_for(&data), dir.path().join("f"))
            .await
            .unwrap();
        let bad = Chunk {
            file_index: 0,
            offset: 8,
            bytes: vec![0u8; 4],
            is_last: true,
        };
        assert!(assembler.write_chunk(&bad).await.is_err());
    }

    #[tokio::test]
    async fn test_checksum_mismatch_is_detected_and_discarded() {
        let dir = tempfile::tempdir().unwrap();
        let data = b"original content".to_vec();
        let path = dir.path().join("f");
        let mut assembler = FileAssembler::create(0, &entry_for(&data), path.clone())
            .await
            .unwrap();

        let mut tampered = data.clone();
        tampered[0] ^= 0xff;
        for chunk in chunks_of(&tampered, 5) {
            assembler.write_chunk(&chunk).await.unwrap();
        }
        assert!(assembler.is_complete());
        assert!(!assembler.finish().await.unwrap());

        assembler.discard().await;
        assert!(!path.exists());
    }

    #[tokio::test]
    async fn test_empty_file_completes_on_final_chunk() {
        let dir = tempfile::tempdir().unwrap();
        let mut assembler = FileAssembler::create(0, &entry_for(&[]), dir.path().join("e"))
            .await
            .unwrap();
        assert!(!assembler.is_complete());
        assembler
            .write_chunk(&Chunk {
                file_index: 0,
                offset: 0,
                bytes: Vec::new(),
                is_last: true,
            })
            .await
            .unwrap();
        assert!(assembler.is_complete());
        assert!(assembler.finish().await.unwrap());
    }

    #[test]
    fn test_manifest_validation() {
        let good = Manifest {
            files: vec![entry_for(b"abc")],
            total_size: 3,
            chunk_size: 65536,
        };
        assert!(validate_manifest(&good).is_ok());

        let mut wrong_total = good.clone();
        wrong_total.total_size = 4;
        assert!(validate_manifest(&wrong_total).is_err());

        let mut bad_checksum = good.clone();
        bad_checksum.files[0].checksum = "zz".to_string();
        assert!(validate_manifest(&bad_checksum).is_err());

        let mut huge_chunks = good;
        huge_chunks.chunk_size = MAX_CHUNK_SIZE + 1;
        assert!(validate_manifest(&huge_chunks).is_err());
    }

    #[tokio::test]
    async fn test_same_names_get_distinct_destinations() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = Manifest {
            files: vec![entry_for(b"one"), entry_for(b"two")],
            total_size: 6,
            chunk_size: 1024,
        };
        let assemblers = prepare_assemblers(&manifest, dir.path()).await.unwrap();
        assert_eq!(assemblers[0].path(), dir.path().join("data.bin"));
        assert_eq!(assemblers[1].path(), dir.path().join("data (1).bin"));
    }
}
