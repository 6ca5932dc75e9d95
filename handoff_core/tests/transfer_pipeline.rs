use std::path::{Path, PathBuf};

use handoff_core::SessionEvent;
use handoff_core::ack::{AckTracker, FileAckState};
use handoff_core::channel::{ChannelMsg, Chunk, ConnectionHandle};
use handoff_core::transfer::{
    ChunkOutcome, FileAssembler, TransferEngine, build_manifest, prepare_assemblers, select_files,
};
use tempfile::TempDir;
use tokio::sync::mpsc;

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn write_source(dir: &Path, name: &str, data: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, data).unwrap();
    path
}

/// Swallow progress events so producers never block on a full queue.
fn drained_events() -> mpsc::Sender<SessionEvent> {
    let (tx, mut rx) = mpsc::channel(64);
    tokio::spawn(async move { while rx.recv().await.is_some() {} });
    tx
}

fn chunks_of(index: usize, data: &[u8], chunk_size: usize) -> Vec<Chunk> {
    let mut chunks: Vec<Chunk> = data
        .chunks(chunk_size)
        .enumerate()
        .map(|(i, bytes)| Chunk {
            file_index: index,
            offset: (i * chunk_size) as u64,
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
async fn test_permuted_chunks_reassemble_identically() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let chunk_size = 16 * 1024;
    let data = pattern(13 * chunk_size + 777, 5);
    let path = write_source(source.path(), "shuffled.bin", &data);

    let files = select_files(&[path], chunk_size as u32).await.unwrap();
    let manifest = build_manifest(&files, chunk_size as u32);
    let mut assemblers = prepare_assemblers(&manifest, dest.path()).await.unwrap();
    let assembler = &mut assemblers[0];

    // 14 chunks visited in a fixed permutation (5 is coprime with 14)
    let chunks = chunks_of(0, &data, chunk_size);
    let n = chunks.len();
    for step in 0..n {
        let chunk = &chunks[(step * 5 + 3) % n];
        assert!(matches!(
            assembler.write_chunk(chunk).await.unwrap(),
            ChunkOutcome::Written { .. }
        ));
        if step == n / 2 {
            assert_eq!(
                assembler.write_chunk(chunk).await.unwrap(),
                ChunkOutcome::Duplicate
            );
        }
    }

    assert!(assembler.is_complete());
    assert!(assembler.finish().await.unwrap());
    let written = std::fs::read(assembler.path()).unwrap();
    assert_eq!(written, data);
}

#[tokio::test]
async fn test_stream_over_memory_pair_respects_credit() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let engine = TransferEngine {
        chunk_size: 8 * 1024,
        low_water_mark: 32 * 1024,
    };

    let first = pattern(300 * 1024 + 11, 1);
    let second = pattern(0, 2);
    let third = pattern(40 * 1024, 3);
    let paths = vec![
        write_source(source.path(), "first.bin", &first),
        write_source(source.path(), "empty.bin", &second),
        write_source(source.path(), "third.bin", &third),
    ];
    let files = select_files(&paths, engine.chunk_size).await.unwrap();
    let manifest = build_manifest(&files, engine.chunk_size);

    let (a, b) = ConnectionHandle::memory_pair(2);
    let (tx, _a_rx) = a.split();
    let (_b_tx, mut rx) = b.split();

    let producer = {
        let tx = tx.clone();
        let files = files.clone();
        let events = drained_events();
        tokio::spawn(async move { engine.stream_files(&tx, &files, &events).await })
    };

    let mut assemblers = prepare_assemblers(&manifest, dest.path()).await.unwrap();
    let mut tracker = AckTracker::new(files.iter().map(|f| f.size));
    let mut last_offset: Vec<Option<u64>> = vec![None; files.len()];
    let mut highest_file = 0;

    while !tracker.is_settled() {
        // Slow reader: the producer has to wait for credit
        tokio::task::yield_now().await;
        assert!(
            tx.buffered_amount() <= engine.low_water_mark + u64::from(engine.chunk_size),
            "buffered {} bytes",
            tx.buffered_amount()
        );

        let Some(ChannelMsg::Chunk(chunk)) = rx.recv().await else {
            panic!("expected a chunk");
        };
        let index = chunk.file_index;
        assert!(index >= highest_file, "files must be sent in selection order");
        highest_file = index;
        if let Some(prev) = last_offset[index] {
            assert!(chunk.offset > prev, "offsets must increase");
        }
        last_offset[index] = Some(chunk.offset);

        assemblers[index].write_chunk(&chunk).await.unwrap();
        if assemblers[index].is_complete() {
            assert!(assemblers[index].finish().await.unwrap());
            assert!(tracker.acknowledge(index).unwrap());
        }
    }

    producer.await.unwrap().unwrap();
    assert!(tracker.is_complete());
    assert_eq!(std::fs::read(assemblers[0].path()).unwrap(), first);
    assert_eq!(std::fs::read(assemblers[1].path()).unwrap(), second);
    assert_eq!(std::fs::read(assemblers[2].path()).unwrap(), third);
    assert_eq!(tx.buffered_amount(), 0);
}

#[tokio::test]
async fn test_corruption_fails_only_that_file() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let chunk_size = 4096;
    let good = pattern(10_000, 7);
    let bad = pattern(9_000, 8);
    let paths = vec![
        write_source(source.path(), "bad.bin", &bad),
        write_source(source.path(), "good.bin", &good),
    ];
    let files = select_files(&paths, chunk_size as u32).await.unwrap();
    let manifest = build_manifest(&files, chunk_size as u32);
    let mut assemblers = prepare_assemblers(&manifest, dest.path()).await.unwrap();
    let mut tracker = AckTracker::new(files.iter().map(|f| f.size));

    let mut bad_chunks = chunks_of(0, &bad, chunk_size);
    bad_chunks[1].bytes[17] ^= 0xFF;
    for chunk in bad_chunks.iter().chain(chunks_of(1, &good, chunk_size).iter()) {
        assemblers[chunk.file_index].write_chunk(chunk).await.unwrap();
    }

    for (index, assembler) in assemblers.iter_mut().enumerate() {
        assert!(assembler.is_complete());
        if assembler.finish().await.unwrap() {
            tracker.acknowledge(index).unwrap();
        } else {
            tracker.fail(index, "checksum mismatch").unwrap();
            assembler.discard().await;
        }
    }

    assert!(tracker.is_settled());
    assert!(!tracker.is_complete());
    assert_eq!(tracker.incomplete_files(), vec![0]);
    assert_eq!(tracker.state(1), Some(&FileAckState::Acknowledged));
    assert!(!assemblers[0].path().exists());
    assert_eq!(std::fs::read(assemblers[1].path()).unwrap(), good);
}

#[tokio::test]
async fn test_chunk_past_declared_size_is_rejected() {
    let source = TempDir::new().unwrap();
    let dest = TempDir::new().unwrap();
    let data = pattern(1000, 9);
    let path = write_source(source.path(), "small.bin", &data);
    let files = select_files(&[path], 512).await.unwrap();
    let manifest = build_manifest(&files, 512);
    let mut assemblers: Vec<FileAssembler> =
        prepare_assemblers(&manifest, dest.path()).await.unwrap();

    let overrun = Chunk {
        file_index: 0,
        offset: 900,
        bytes: vec![0u8; 200],
        is_last: true,
    };
    assert!(assemblers[0].write_chunk(&overrun).await.is_err());
    assert_eq!(assemblers[0].bytes_received(), 0);
}
