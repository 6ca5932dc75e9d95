use anyhow::Result;
use blake3::Hasher;
use std::path::Path;
use tokio::fs::File;
use tokio::io::AsyncReadExt;

use super::constants::HASH_BUFFER_SIZE;

/// Compute the BLAKE3 hex digest of a file
pub async fn compute_file_hash(file_path: &Path) -> Result<String> {
    let mut file = File::open(file_path).await?;
    let mut hasher = Hasher::new();
    let mut buffer = vec![0u8; HASH_BUFFER_SIZE];

    loop {
        let n = file.read(&mut buffer).await?;
        if n == 0 {
            break;
        }
        hasher.update(&buffer[..n]);
    }

    Ok(hasher.finalize().to_hex().to_string())
}
