use anyhow::{Context, Result, bail};
use std::path::PathBuf;
use tokio::fs::File;
use tokio::io::AsyncReadExt;
use tokio::sync::mpsc;

use super::constants::MAX_MANIFEST_FILES;
use super::hash::compute_file_hash;
use super::utils::{ProgressReporter, validate_transfer_info};
use super::{FileDescriptor, TransferEngine, chunk_count};
use crate::SessionEvent;
use crate::channel::{ChannelMsg, ChannelSender, Chunk, Manifest};

/// Describe the files the user picked, computing each checksum now so the
/// receiver verifies against the content as it was at selection time.
pub async fn select_files(paths: &[PathBuf], chunk_size: u32) -> Result<Vec<FileDescriptor>> {
    if paths.is_empty() {
        bail!("no files selected");
    }
    if paths.len() > MAX_MANIFEST_FILES {
        bail!(
            "too many files selected ({}, max {})",
            paths.len(),
            MAX_MANIFEST_FILES
        );
    }

    let mut files = Vec::with_capacity(paths.len());
    for path in paths {
        let metadata = tokio::fs::metadata(path)
            .await
            .with_context(|| format!("cannot read {}", path.display()))?;
        if !metadata.is_file() {
            bail!("{} is not a regular file", path.display());
        }

        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "unknown_file".to_string());
        let size = metadata.len();
        validate_transfer_info(&name, size)?;

        let checksum = compute_file_hash(path).await?;
        tracing::debug!("Selected {} ({} bytes, blake3 {})", name, size, checksum);

        files.push(FileDescriptor {
            name,
            size,
            checksum,
            chunk_count: chunk_count(size, chunk_size),
            bytes_acknowledged: 0,
            path: Some(path.clone()),
        });
    }
    Ok(files)
}

pub fn build_manifest(files: &[FileDescriptor], chunk_size: u32) -> Manifest {
    Manifest {
        files: files.iter().map(FileDescriptor::manifest_entry).collect(),
        total_size: files.iter().map(|f| f.size).sum(),
        chunk_size,
    }
}

impl TransferEngine {
    /// Emit every file's chunks in selection order.
    ///
    /// Later files start while earlier ones still wait for their ack; only the
    /// channel's credit limits how far ahead emission runs.
    pub async fn stream_files(
        &self,
        tx: &ChannelSender,
        files: &[FileDescriptor],
        events: &mpsc::Sender<SessionEvent>,
    ) -> Result<()> {
        for (index, file) in files.iter().enumerate() {
            self.stream_file(tx, index, file, events).await?;
        }
        tracing::debug!("All chunks handed to the channel");
        Ok(())
    }

    async fn stream_file(
        &self,
        tx: &ChannelSender,
        index: usize,
        descriptor: &FileDescriptor,
        events: &mpsc::Sender<SessionEvent>,
    ) -> Result<()> {
        let path = descriptor
            .path
            .as_ref()
            .with_context(|| format!("{} has no source path", descriptor.name))?;
        let mut file = File::open(path)
            .await
            .with_context(|| format!("cannot open {}", path.display()))?;
        let mut reporter =
            ProgressReporter::new(events.clone(), index, &descriptor.name, descriptor.size, true);

        let mut offset = 0u64;
        loop {
            tx.wait_for_credit(self.low_water_mark).await?;

            let len = (descriptor.size - offset).min(u64::from(self.chunk_size)) as usize;
            let mut bytes = vec![0u8; len];
            file.read_exact(&mut bytes)
                .await
                .with_context(|| format!("{} changed while sending", descriptor.name))?;

            let is_last = offset + len as u64 >= descriptor.size;
            tx.send(ChannelMsg::Chunk(Chunk {
                file_index: index,
                offset,
                bytes,
                is_last,
            }))?;
            offset += len as u64;
            reporter.report(offset).await;

            if is_last {
                return Ok(());
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ConnectionHandle;

    async fn write_file(dir: &std::path::Path, name: &str, len: usize) -> PathBuf {
        let path = dir.join(name);
        let data: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        tokio::fs::write(&path, data).await.unwrap();
        path
    }

    #[tokio::test]
    async fn test_select_files_records_checksums() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(dir.path(), "a.bin", 1000).await;
        let files = select_files(&[a.clone()], 256).await.unwrap();

        assert_eq!(files[0].name, "a.bin");
        assert_eq!(files[0].size, 1000);
        assert_eq!(files[0].chunk_count, 4);
        assert_eq!(files[0].checksum, compute_file_hash(&a).await.unwrap());

        let manifest = build_manifest(&files, 256);
        assert_eq!(manifest.total_size, 1000);
        assert_eq!(manifest.files[0].name, "a.bin");
    }

    #[tokio::test]
    async fn test_select_files_rejects_directories_and_empty_selection() {
        let dir = tempfile::tempdir().unwrap();
        assert!(select_files(&[], 256).await.is_err());
        assert!(select_files(&[dir.path().to_path_buf()], 256).await.is_err());
    }

    #[tokio::test]
    async fn test_chunks_are_ordered_per_file() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(dir.path(), "a.bin", 1000).await;
        let b = write_file(dir.path(), "empty.bin", 0).await;
        let files = select_files(&[a, b], 300).await.unwrap();

        let (local, remote) = ConnectionHandle::memory_pair(64);
        let (tx, _rx) = local.split();
        let (_remote_tx, mut remote_rx) = remote.split();
        let (events_tx, _events_rx) = mpsc::channel(64);

        let engine = TransferEngine {
            chunk_size: 300,
            low_water_mark: 10_000,
        };
        engine.stream_files(&tx, &files, &events_tx).await.unwrap();

        let mut seen = Vec::new();
        for _ in 0..5 {
            match remote_rx.recv().await.unwrap() {
                ChannelMsg::Chunk(chunk) => seen.push((chunk.file_index, chunk.offset, chunk.bytes.len(), chunk.is_last)),
                other => panic!("unexpected {:?}", other),
            }
        }
        assert_eq!(
            seen,
            vec![
                (0, 0, 300, false),
                (0, 300, 300, false),
                (0, 600, 300, false),
                (0, 900, 100, true),
                (1, 0, 0, true),
            ]
        );
    }

    #[tokio::test]
    async fn test_emission_stalls_without_credit() {
        let dir = tempfile::tempdir().unwrap();
        let a = write_file(dir.path(), "a.bin", 64 * 1024).await;
        let files = select_files(&[a], 1024).await.unwrap();

        // Nobody reads the remote side, so buffered bytes can only drain
        // into the small delivery queue
        let (local, remote) = ConnectionHandle::memory_pair(2);
        let (tx, _rx) = local.split();
        let (events_tx, _events_rx) = mpsc::channel(1024);
        let engine = TransferEngine {
            chunk_size: 1024,
            low_water_mark: 4096,
        };

        let producer = {
            let tx = tx.clone();
            tokio::spawn(async move { engine.stream_files(&tx, &files, &events_tx).await })
        };
        tokio::time::sleep(std::time::Duration::from_millis(100)).await;

        assert!(!producer.is_finished());
        // At most one chunk beyond the mark is ever queued
        assert!(tx.buffered_amount() <= 4096 + 1024);
        producer.abort();
        drop(remote);
    }
}
