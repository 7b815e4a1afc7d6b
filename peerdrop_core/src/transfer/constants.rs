/// Size of one binary chunk frame (16 KiB)
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Largest file accepted for sharing (2 GiB). The whole file is held in memory.
pub const MAX_FILE_SIZE: u64 = 2 * 1024 * 1024 * 1024;

/// Most a receiver reserves up front; larger downloads grow with their chunks
pub const MAX_PREALLOCATION: u64 = 4 * 1024 * 1024;

/// Maximum length of a shared file name
pub const MAX_FILENAME_LENGTH: usize = 255;

/// MIME type used when the extension gives no hint
pub const DEFAULT_MIME_TYPE: &str = "application/octet-stream";
