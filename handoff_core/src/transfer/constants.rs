/// Default chunk payload size (64 KiB)
pub const DEFAULT_CHUNK_SIZE: u32 = 64 * 1024;

/// Largest chunk size a manifest may announce (1 MiB)
pub const MAX_CHUNK_SIZE: u32 = 1024 * 1024;

/// Producers pause while more than this many bytes wait in the channel (1 MiB)
pub const DEFAULT_LOW_WATER_MARK: u64 = 1024 * 1024;

/// Read buffer used when hashing files (1 MiB)
pub const HASH_BUFFER_SIZE: usize = 1024 * 1024;

/// Maximum size accepted for a single file (100 GiB)
pub const MAX_FILE_SIZE: u64 = 100 * 1024 * 1024 * 1024;

/// Maximum file name length in bytes
pub const MAX_FILENAME_LENGTH: usize = 255;

/// Maximum number of files in one manifest
pub const MAX_MANIFEST_FILES: usize = 10_000;
