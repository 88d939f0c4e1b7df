//! Error taxonomy for the on-demand transcoding cache.
//!
//! Mirrors `ferrex_core::error::MediaError`'s shape (a flat `thiserror` enum
//! with a crate-wide `Result` alias) but carries exactly the variants the
//! cache's producer/reader/registry paths can surface.

use std::path::PathBuf;

use thiserror::Error;

/// Errors the cache core can produce.
#[derive(Error, Debug)]
pub enum CacheError {
    /// Source file disappeared between `readdir` and `read`.
    #[error("source missing: {0}")]
    SourceMissing(PathBuf),

    /// Decoder rejected the source.
    #[error("source corrupt: {0}")]
    SourceCorrupt(String),

    /// No decoder/encoder pair exists for this key.
    #[error("unsupported codec for recipe {0}")]
    UnsupportedCodec(String),

    /// Buffer or disk could not grow to the requested capacity.
    #[error("out of space: {0}")]
    OutOfSpace(String),

    /// Generic persistent-store failure.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Producer hit `abort_threshold` with no attached readers.
    #[error("producer aborted after idle timeout")]
    AbortedIdle,

    /// Producer was interrupted by process shutdown.
    #[error("producer interrupted by shutdown")]
    ShutdownAborted,

    /// `GrowableBuffer::splice` invariant violated. Always a programmer
    /// error; callers should treat this as fatal rather than recoverable.
    #[error("invalid buffer region: {0}")]
    InvalidRegion(String),
}

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, CacheError>;

impl CacheError {
    /// True for errors that represent a producer-terminal failure (every
    /// taxonomy member except [`CacheError::InvalidRegion`], which is a fatal
    /// bug rather than a recoverable transcode failure; see SPEC_FULL.md §7).
    pub fn is_producer_terminal(&self) -> bool {
        !matches!(self, CacheError::InvalidRegion(_))
    }
}
