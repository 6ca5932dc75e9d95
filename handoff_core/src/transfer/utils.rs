use crate::SessionEvent;
use crate::transfer::constants::{MAX_FILENAME_LENGTH, MAX_FILE_SIZE};
use anyhow::Result;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::fs::{File, OpenOptions};
use tokio::sync::mpsc;

/// Minimum gap between two progress events for the same file
const PROGRESS_INTERVAL: Duration = Duration::from_millis(100);

/// Validate file info against security limits (size and name length)
pub fn validate_transfer_info(file_name: &str, file_size: u64) -> Result<()> {
    if file_size > MAX_FILE_SIZE {
        return Err(anyhow::anyhow!(
            "File rejected: {} ({} GB) exceeds maximum allowed size of {} GB",
            file_name,
            file_size / (1024 * 1024 * 1024),
            MAX_FILE_SIZE / (1024 * 1024 * 1024)
        ));
    }

    if file_name.len() > MAX_FILENAME_LENGTH {
        return Err(anyhow::anyhow!(
            "File rejected: Filename too long ({} chars, max {})",
            file_name.len(),
            MAX_FILENAME_LENGTH
        ));
    }
    Ok(())
}

/// Create (or replace) a destination file with owner-only permissions on Unix.
/// The file is sized up front so chunks can be written at any offset.
pub async fn open_secure_file(path: &Path, size: u64) -> std::io::Result<File> {
    let mut options = OpenOptions::new();
    options.write(true).read(true).create(true).truncate(true);
    #[cfg(unix)]
    options.mode(0o600);

    let file = options.open(path).await?;
    file.set_len(size).await?;
    Ok(file)
}

/// Pick a path in `dir` for `file_name` that does not exist yet:
/// `report.pdf`, then `report (1).pdf`, `report (2).pdf`, ...
pub async fn unique_destination(dir: &Path, file_name: &str) -> PathBuf {
    let candidate = dir.join(file_name);
    if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
        return candidate;
    }

    let (stem, ext) = match file_name.rfind('.') {
        Some(idx) if idx > 0 => (&file_name[..idx], &file_name[idx..]),
        _ => (file_name, ""),
    };
    let mut n = 1u32;
    loop {
        let candidate = dir.join(format!("{} ({}){}", stem, n, ext));
        if !tokio::fs::try_exists(&candidate).await.unwrap_or(false) {
            return candidate;
        }
        n += 1;
    }
}

/// Format transfer speed from bytes and elapsed time
pub fn format_transfer_speed(bytes_transferred: u64, elapsed_secs: f64) -> String {
    if elapsed_secs <= 0.0 {
        return "Starting...".to_string();
    }

    let speed_bps = bytes_transferred as f64 / elapsed_secs;
    if speed_bps > 1_000_000.0 {
        format!("{:.2} MB/s", speed_bps / 1_000_000.0)
    } else if speed_bps > 1_000.0 {
        format!("{:.1} KB/s", speed_bps / 1_000.0)
    } else {
        format!("{:.0} B/s", speed_bps)
    }
}

/// Sanitize file name to prevent path traversal attacks and ensure safety
pub fn sanitize_file_name(file_name: &str) -> String {
    // Only the last path component counts, whichever separator the peer used
    let file_name = file_name
        .rsplit(['/', '\\'])
        .next()
        .unwrap_or("unknown_file");

    let mut clean_name: String = file_name.chars().filter(|c| !c.is_control()).collect();

    // Windows reserved device names, with or without an extension
    let reserved_names = [
        "CON", "PRN", "AUX", "NUL", "COM1", "COM2", "COM3", "COM4", "COM5", "COM6", "COM7",
        "COM8", "COM9", "LPT1", "LPT2", "LPT3", "LPT4", "LPT5", "LPT6", "LPT7", "LPT8", "LPT9",
    ];
    let device = clean_name.split('.').next().unwrap_or_default().trim();
    if reserved_names.iter().any(|r| device.eq_ignore_ascii_case(r)) {
        return "unknown_file".to_string();
    }

    if clean_name == ".." || clean_name == "." || clean_name.trim().is_empty() {
        return "unknown_file".to_string();
    }

    if clean_name.len() > MAX_FILENAME_LENGTH {
        let ext = clean_name
            .rfind('.')
            .map(|idx| clean_name[idx..].to_string())
            .filter(|ext| ext.len() < 20);
        let keep = MAX_FILENAME_LENGTH - ext.as_ref().map_or(0, |e| e.len());
        let base_end = ext
            .as_ref()
            .map_or(clean_name.len(), |e| clean_name.len() - e.len());

        let mut cutoff = keep.min(base_end);
        while !clean_name.is_char_boundary(cutoff) {
            cutoff -= 1;
        }
        let mut truncated = clean_name[..cutoff].to_string();
        if let Some(ext) = ext {
            truncated.push_str(&ext);
        }
        clean_name = truncated;
    }

    clean_name
}

/// Throttled progress events for one file
pub struct ProgressReporter {
    events: mpsc::Sender<SessionEvent>,
    file_index: usize,
    file_name: String,
    total_bytes: u64,
    is_sending: bool,
    started: Instant,
    last_report: Option<Instant>,
}

impl ProgressReporter {
    pub fn new(
        events: mpsc::Sender<SessionEvent>,
        file_index: usize,
        file_name: &str,
        total_bytes: u64,
        is_sending: bool,
    ) -> Self {
        Self {
            events,
            file_index,
            file_name: file_name.to_string(),
            total_bytes,
            is_sending,
            started: Instant::now(),
            last_report: None,
        }
    }

    /// Report progress; intermediate updates are rate limited, the final one never is.
    pub async fn report(&mut self, bytes_done: u64) {
        let finished = bytes_done >= self.total_bytes;
        if !finished
            && self
                .last_report
                .is_some_and(|last| last.elapsed() < PROGRESS_INTERVAL)
        {
            return;
        }
        self.last_report = Some(Instant::now());

        let elapsed = self.started.elapsed().as_secs_f64();
        let _ = self
            .events
            .send(SessionEvent::TransferProgress {
                file_index: self.file_index,
                file_name: self.file_name.clone(),
                bytes_done,
                total_bytes: self.total_bytes,
                speed: format_transfer_speed(bytes_done, elapsed),
                is_sending: self.is_sending,
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_transfer_info() {
        assert!(validate_transfer_info("valid.txt", 1024).is_ok());
        assert!(validate_transfer_info("huge.txt", MAX_FILE_SIZE + 1).is_err());

        let long_name = "a".repeat(MAX_FILENAME_LENGTH + 1);
        assert!(validate_transfer_info(&long_name, 1024).is_err());
    }

    #[test]
    fn test_sanitize_file_name_basic() {
        assert_eq!(sanitize_file_name("normal_file.txt"), "normal_file.txt");
        assert_eq!(sanitize_file_name("path/to/file.txt"), "file.txt");
        assert_eq!(sanitize_file_name("C:\\Windows\\evil.exe"), "evil.exe");
    }

    #[test]
    fn test_sanitize_file_name_traversal() {
        assert_eq!(sanitize_file_name("../../etc/passwd"), "passwd");
        assert_eq!(sanitize_file_name(".."), "unknown_file");
        assert_eq!(sanitize_file_name("dir/"), "unknown_file");
        assert_eq!(sanitize_file_name("bad\u{0}name\n.txt"), "badname.txt");
    }

    #[test]
    fn test_sanitize_file_name_reserved() {
        assert_eq!(sanitize_file_name("CON"), "unknown_file");
        assert_eq!(sanitize_file_name("lpt1.txt"), "unknown_file");
        assert_eq!(sanitize_file_name("console.txt"), "console.txt");
    }

    #[test]
    fn test_sanitize_file_name_truncation_keeps_extension() {
        let long = format!("{}.tar.gz", "é".repeat(300));
        let clean = sanitize_file_name(&long);
        assert!(clean.len() <= MAX_FILENAME_LENGTH);
        assert!(clean.ends_with(".gz"));
    }

    #[test]
    fn test_format_transfer_speed() {
        assert_eq!(format_transfer_speed(100, 0.0), "Starting...");
        assert_eq!(format_transfer_speed(500, 1.0), "500 B/s");
        assert_eq!(format_transfer_speed(2_500, 1.0), "2.5 KB/s");
        assert_eq!(format_transfer_speed(5_000_000, 2.0), "2.50 MB/s");
    }

    #[tokio::test]
    async fn test_unique_destination_appends_counter() {
        let dir = tempfile::tempdir().unwrap();
        let first = unique_destination(dir.path(), "report.pdf").await;
        assert_eq!(first, dir.path().join("report.pdf"));

        tokio::fs::write(&first, b"x").await.unwrap();
        let second = unique_destination(dir.path(), "report.pdf").await;
        assert_eq!(second, dir.path().join("report (1).pdf"));

        tokio::fs::write(&second, b"x").await.unwrap();
        let third = unique_destination(dir.path(), "report.pdf").await;
        assert_eq!(third, dir.path().join("report (2).pdf"));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_open_secure_file_is_owner_only_and_presized() {
        use std::os::unix::fs::PermissionsExt;

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("incoming.bin");
        let file = open_secure_file(&path, 4096).await.unwrap();
        drop(file);

        let meta = tokio::fs::metadata(&path).await.unwrap();
        assert_eq!(meta.len(), 4096);
        assert_eq!(meta.permissions().mode() & 0o777, 0o600);
    }
}
