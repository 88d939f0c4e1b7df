//! Deterministic `Transcoder` test double shared by the integration suite.
//!
//! Stands in for `tcache_fs::codec::ffmpeg::FfmpegTranscoder` so these tests
//! exercise the full producer/reader/registry machinery with no `ffmpeg`
//! subprocess: `step()` reads the real source file from disk and emits a
//! fixed-function transform of its bytes in fixed-size chunks, the same
//! shape as the real transcoder's "spawn once, stream stdout incrementally"
//! loop.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;

use tcache_core::buffer::GrowableBuffer;
use tcache_core::error::{CacheError, Result};
use tcache_core::key::CacheKey;
use tcache_core::registry::TranscoderFactory;
use tcache_core::transcoder::{StepOutcome, Transcoder};

/// Byte-for-byte deterministic "encode": increment every byte by one. Two
/// runs over the same source bytes always produce the same output; two
/// different sources almost always produce different output.
fn encode(source: &[u8]) -> Vec<u8> {
    source.iter().map(|b| b.wrapping_add(1)).collect()
}

/// Deterministic fixed-length tag derived from the source path alone, so it
/// is known in full before a single byte of the body has been produced
/// (mirrors `FfmpegTranscoder`'s ID3v1 tag being built in `open_input`).
fn tag_for(source_path: &Path, len: u64) -> Vec<u8> {
    let name = source_path.to_string_lossy();
    (0..len)
        .map(|i| name.as_bytes().get(i as usize % name.len().max(1)).copied().unwrap_or(b'T'))
        .collect()
}

/// Extra slack added on top of the exact encoded size so `predict_size`
/// stays a conservative upper bound, per SPEC_FULL.md §9 Open Question 1.
const PREDICT_SLACK: u64 = 4096;

pub struct ScriptedTranscoder {
    chunk_size: usize,
    step_delay: Option<Duration>,
    tag_len: Option<u64>,
    source_path: PathBuf,
    source_mtime: SystemTime,
    body: Vec<u8>,
    cursor: usize,
    tag: Vec<u8>,
    buffer: Option<Arc<GrowableBuffer>>,
}

impl ScriptedTranscoder {
    pub fn new(chunk_size: usize, step_delay: Option<Duration>, tag_len: Option<u64>) -> Self {
        Self {
            chunk_size,
            step_delay,
            tag_len,
            source_path: PathBuf::new(),
            source_mtime: SystemTime::UNIX_EPOCH,
            body: Vec::new(),
            cursor: 0,
            tag: Vec::new(),
            buffer: None,
        }
    }

    fn buffer(&self) -> &GrowableBuffer {
        self.buffer
            .as_deref()
            .expect("open_output must be called before step/finish")
    }
}

#[async_trait]
impl Transcoder for ScriptedTranscoder {
    async fn open_input(&mut self, source_path: &Path) -> Result<()> {
        if !source_path.exists() {
            return Err(CacheError::SourceMissing(source_path.to_path_buf()));
        }
        let raw = std::fs::read(source_path)?;
        self.source_mtime = std::fs::metadata(source_path)?.modified()?;
        self.source_path = source_path.to_path_buf();
        self.body = encode(&raw);
        // Known in full before any byte of the body is produced, exactly as
        // `FfmpegTranscoder` computes its ID3v1 tag in `open_input`; this is
        // what lets the tail-read shortcut serve it pre-transcode.
        self.tag = match self.tag_len {
            Some(len) => tag_for(&self.source_path, len),
            None => Vec::new(),
        };
        Ok(())
    }

    fn source_mtime(&self) -> SystemTime {
        self.source_mtime
    }

    fn predict_size(&self) -> u64 {
        self.body.len() as u64 + self.tag.len() as u64 + PREDICT_SLACK
    }

    fn open_output(&mut self, buffer: Arc<GrowableBuffer>) {
        self.buffer = Some(buffer);
    }

    async fn step(&mut self) -> Result<StepOutcome> {
        if let Some(delay) = self.step_delay {
            tokio::time::sleep(delay).await;
        }
        if self.cursor >= self.body.len() {
            return Ok(StepOutcome::EndOfStream);
        }
        let end = (self.cursor + self.chunk_size).min(self.body.len());
        self.buffer().append(&self.body[self.cursor..end])?;
        self.cursor = end;
        Ok(StepOutcome::Progress)
    }

    async fn finish(&mut self) -> Result<()> {
        if !self.tag.is_empty() {
            self.buffer().append(&self.tag)?;
        }
        Ok(())
    }

    fn trailing_tag(&self) -> &[u8] {
        &self.tag
    }
}

/// Builds one [`ScriptedTranscoder`] per key, counting how many times a
/// producer was actually spawned for it (used to assert the singleton
/// producer property, P4/scenario 1).
pub struct ScriptedFactory {
    pub chunk_size: usize,
    pub step_delay: Option<Duration>,
    pub spawn_count: Arc<AtomicUsize>,
}

impl ScriptedFactory {
    pub fn new(chunk_size: usize, step_delay: Option<Duration>) -> Self {
        Self {
            chunk_size,
            step_delay,
            spawn_count: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn spawn_count(&self) -> usize {
        self.spawn_count.load(Ordering::Acquire)
    }
}

impl TranscoderFactory for ScriptedFactory {
    fn build(&self, key: &CacheKey) -> Result<Box<dyn Transcoder>> {
        self.spawn_count.fetch_add(1, Ordering::AcqRel);
        Ok(Box::new(ScriptedTranscoder::new(
            self.chunk_size,
            self.step_delay,
            key.recipe.trailing_tag_len(),
        )))
    }
}

/// Compute what a synchronous, single-shot transcode of `source_bytes` would
/// produce for `key`, for comparison against the cache's actual output (P1).
pub fn reference_artifact(source_bytes: &[u8], key: &CacheKey) -> Vec<u8> {
    let mut out = encode(source_bytes);
    if let Some(tag_len) = key.recipe.trailing_tag_len() {
        out.extend(tag_for(&key.source_path, tag_len));
    }
    out
}
