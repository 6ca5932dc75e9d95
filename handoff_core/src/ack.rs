//! Per-file acknowledgment bookkeeping.
//!
//! A file counts as delivered only once the receiver verified its checksum and
//! said so. The session completes when every file is delivered.

use serde::Serialize;
use thiserror::Error;
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum FileAckState {
    Pending,
    Acknowledged,
    Failed(String),
}

/// Aggregate view published to subscribers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AckStatus {
    pub total: usize,
    pub acknowledged: usize,
    pub failed: usize,
}

impl AckStatus {
    pub fn is_complete(&self) -> bool {
        self.acknowledged == self.total
    }

    /// No file is pending anymore
    pub fn is_settled(&self) -> bool {
        self.acknowledged + self.failed == self.total
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum AckError {
    #[error("file index {0} is not part of this session")]
    UnknownFile(usize),
}

#[derive(Debug)]
struct FileProgress {
    size: u64,
    bytes_acknowledged: u64,
    state: FileAckState,
}

#[derive(Debug)]
pub struct AckTracker {
    files: Vec<FileProgress>,
    status_tx: watch::Sender<AckStatus>,
}

impl AckTracker {
    /// One entry per file, in selection order.
    pub fn new(sizes: impl IntoIterator<Item = u64>) -> Self {
        let files: Vec<FileProgress> = sizes
            .into_iter()
            .map(|size| FileProgress {
                size,
                bytes_acknowledged: 0,
                state: FileAckState::Pending,
            })
            .collect();
        let (status_tx, _) = watch::channel(AckStatus {
            total: files.len(),
            ..AckStatus::default()
        });
        Self { files, status_tx }
    }

    fn file_mut(&mut self, index: usize) -> Result<&mut FileProgress, AckError> {
        self.files.get_mut(index).ok_or(AckError::UnknownFile(index))
    }

    /// Raise the byte count for a pending file. Never lowers it and never
    /// exceeds the file size.
    pub fn record_progress(&mut self, index: usize, bytes: u64) -> Result<u64, AckError> {
        let file = self.file_mut(index)?;
        if file.state == FileAckState::Pending {
            file.bytes_acknowledged = file.bytes_acknowledged.max(bytes.min(file.size));
        }
        Ok(file.bytes_acknowledged)
    }

    /// Mark a file delivered. Returns `false` if it already was settled.
    pub fn acknowledge(&mut self, index: usize) -> Result<bool, AckError> {
        let file = self.file_mut(index)?;
        if file.state != FileAckState::Pending {
            return Ok(false);
        }
        file.state = FileAckState::Acknowledged;
        file.bytes_acknowledged = file.size;
        self.publish();
        Ok(true)
    }

    /// Mark a file failed. Sibling files are unaffected.
    pub fn fail(&mut self, index: usize, reason: impl Into<String>) -> Result<bool, AckError> {
        let file = self.file_mut(index)?;
        if file.state != FileAckState::Pending {
            return Ok(false);
        }
        file.state = FileAckState::Failed(reason.into());
        self.publish();
        Ok(true)
    }

    pub fn state(&self, index: usize) -> Option<&FileAckState> {
        self.files.get(index).map(|f| &f.state)
    }

    pub fn bytes_acknowledged(&self, index: usize) -> Option<u64> {
        self.files.get(index).map(|f| f.bytes_acknowledged)
    }

    pub fn status(&self) -> AckStatus {
        *self.status_tx.borrow()
    }

    pub fn is_complete(&self) -> bool {
        self.status().is_complete()
    }

    pub fn is_settled(&self) -> bool {
        self.status().is_settled()
    }

    /// Indices of files that were not acknowledged, pending or failed
    pub fn incomplete_files(&self) -> Vec<usize> {
        self.files
            .iter()
            .enumerate()
            .filter(|(_, f)| f.state != FileAckState::Acknowledged)
            .map(|(i, _)| i)
            .collect()
    }

    pub fn subscribe(&self) -> watch::Receiver<AckStatus> {
        self.status_tx.subscribe()
    }

    fn publish(&self) {
        let status = AckStatus {
            total: self.files.len(),
            acknowledged: self
                .files
                .iter()
                .filter(|f| f.state == FileAckState::Acknowledged)
                .count(),
            failed: self
                .files
                .iter()
                .filter(|f| matches!(f.state, FileAckState::Failed(_)))
                .count(),
        };
        self.status_tx.send_replace(status);
    }
}

/// Resolve once no file is pending; `false` if the tracker was dropped first.
pub async fn wait_settled(status: &mut watch::Receiver<AckStatus>) -> bool {
    status.wait_for(AckStatus::is_settled).await.is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_complete_only_when_every_file_acknowledged() {
        let mut tracker = AckTracker::new([100, 10]);
        assert!(!tracker.is_complete());
        tracker.acknowledge(1).unwrap();
        assert!(!tracker.is_complete());
        tracker.acknowledge(0).unwrap();
        assert!(tracker.is_complete());
        assert_eq!(tracker.bytes_acknowledged(0), Some(100));
    }

    #[test]
    fn test_progress_is_monotone_and_clamped() {
        let mut tracker = AckTracker::new([1000]);
        assert_eq!(tracker.record_progress(0, 400).unwrap(), 400);
        assert_eq!(tracker.record_progress(0, 200).unwrap(), 400);
        assert_eq!(tracker.record_progress(0, 5000).unwrap(), 1000);
    }

    #[test]
    fn test_failure_is_file_scoped() {
        let mut tracker = AckTracker::new([10, 20, 30]);
        tracker.fail(1, "checksum mismatch").unwrap();
        tracker.acknowledge(0).unwrap();
        assert!(!tracker.is_settled());
        tracker.acknowledge(2).unwrap();
        assert!(tracker.is_settled());
        assert!(!tracker.is_complete());
        assert_eq!(tracker.incomplete_files(), vec![1]);
        // A late ack does not override the failure
        assert!(!tracker.acknowledge(1).unwrap());
    }

    #[test]
    fn test_unknown_index() {
        let mut tracker = AckTracker::new([1]);
        assert_eq!(tracker.acknowledge(7), Err(AckError::UnknownFile(7)));
    }

    #[tokio::test]
    async fn test_subscription_reports_completion() {
        let mut tracker = AckTracker::new([1, 2]);
        let mut rx = tracker.subscribe();
        tracker.acknowledge(0).unwrap();
        tracker.acknowledge(1).unwrap();
        rx.changed().await.unwrap();
        assert!(rx.borrow().is_complete());
    }

    #[tokio::test]
    async fn test_wait_settled_counts_failures() {
        let mut tracker = AckTracker::new([5, 5]);
        let mut rx = tracker.subscribe();
        let waiter = tokio::spawn(async move { wait_settled(&mut rx).await });

        tracker.acknowledge(0).unwrap();
        tokio::task::yield_now().await;
        assert!(!waiter.is_finished());

        tracker.fail(1, "checksum mismatch").unwrap();
        assert!(waiter.await.unwrap());
    }

    #[tokio::test]
    async fn test_wait_settled_gives_up_when_tracker_dropped() {
        let tracker = AckTracker::new([5]);
        let mut rx = tracker.subscribe();
        drop(tracker);
        assert!(!wait_settled(&mut rx).await);
    }
}
