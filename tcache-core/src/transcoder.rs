//! `Transcoder`: the narrow, injected interface the core drives to turn a
//! source file into encoded bytes.
//!
//! Grounded on SPEC_FULL.md §4.2 directly. The trait is intentionally
//! sink-driven (the core owns the `GrowableBuffer`, the transcoder only
//! writes into it) so the core never depends on a concrete codec crate,
//! matching `ferrex_server::stream::transcoding::worker::WorkerPool`'s
//! separation between job orchestration and the ffmpeg subprocess it drives.

use std::path::Path;
use std::sync::Arc;
use std::time::SystemTime;

use async_trait::async_trait;

use crate::buffer::GrowableBuffer;
use crate::error::Result;

/// Outcome of a single `Transcoder::step` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// Bytes were written; the caller should call `step` again.
    Progress,
    /// The source is exhausted; the caller should call `finish`.
    EndOfStream,
}

/// Sink-driven encoder contract. The producer task in [`crate::entry`]
/// drives a `Transcoder` through `open_input` → `predict_size` →
/// `open_output` → repeated `step` → `finish`, never holding any lock while
/// inside these calls (SPEC_FULL.md §4.5 "producer task holds no locks while
/// calling into the `Transcoder`").
#[async_trait]
pub trait Transcoder: Send + Sync {
    /// Open `source_path` for reading. May fail with `SourceMissing`,
    /// `SourceCorrupt`, or `UnsupportedCodec`.
    async fn open_input(&mut self, source_path: &Path) -> Result<()>;

    /// Modified time of the source, valid after `open_input`.
    fn source_mtime(&self) -> SystemTime;

    /// Best estimate of the final encoded size. Must be a conservative
    /// *upper* bound per SPEC_FULL.md §9 Open Question 1 so that a reader
    /// caching `getattr` results only ever observes the size shrink (never
    /// grow) across the predicted→encoded transition. May be called after
    /// `open_input` and before any `step`.
    fn predict_size(&self) -> u64;

    /// Bind the sink this transcoder writes encoded bytes into. Takes
    /// shared ownership (rather than a borrow) so implementations may hold
    /// onto the buffer across the `step`/`finish` calls that follow,
    /// without a lifetime parameter on the trait itself.
    fn open_output(&mut self, buffer: Arc<GrowableBuffer>);

    /// Advance the encoder by one unit of work, writing zero or more bytes
    /// via the bound buffer's `append`/`splice`.
    async fn step(&mut self) -> Result<StepOutcome>;

    /// Flush encoder state and write the trailing tag at the agreed tail
    /// offset (`predicted_size` or later, whichever the concrete transcoder
    /// reserves as its tail region).
    async fn finish(&mut self) -> Result<()>;

    /// The fixed-size trailing tag blob for this recipe (e.g. the 128-byte
    /// ID3v1 tag for MP3), used to answer tail-reads before the full encode
    /// completes (SPEC_FULL.md §4.4).
    fn trailing_tag(&self) -> &[u8];
}
