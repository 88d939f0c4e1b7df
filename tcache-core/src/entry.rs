//! `CacheEntry`: the per-source unit of the cache, implementing the state
//! machine of SPEC_FULL.md §4.3.
//!
//! The producer-loop shape (spawn a task, drive it through repeated steps,
//! report terminal status back through shared state) follows
//! `ferrex_server::stream::transcoding::worker::WorkerPool::worker_loop`;
//! the `tokio::sync::Notify` broadcast that replaces the original's
//! `sleep(0)` busy-wait (`transcoding/segments.rs::wait_for_segment`) is the
//! substitution recorded as Open Question 3 in DESIGN.md.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use parking_lot::Mutex;
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant as TokioInstant;
use tracing::{debug, info, warn};

use crate::buffer::GrowableBuffer;
use crate::config::CoreConfig;
use crate::error::{CacheError, Result};
use crate::key::CacheKey;
use crate::transcoder::{StepOutcome, Transcoder};

/// Lifecycle states from SPEC_FULL.md §4.3.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lifecycle {
    Fresh,
    Opening,
    Producing,
    Suspended,
    Finished,
    Errored,
    Closing,
}

/// Mutex-protected metadata shared between the producer and readers. Kept
/// deliberately small: the byte payload itself lives lock-free in
/// `GrowableBuffer` (SPEC_FULL.md §4.3 "Reader synchronization").
struct SharedState {
    lifecycle: Lifecycle,
    created_at: SystemTime,
    accessed_at: SystemTime,
    /// Live readers plus one while the producer runs (SPEC_FULL.md §3).
    ref_count: u64,
}

/// The per-source cache unit: one `GrowableBuffer` + one bound `Transcoder`
/// + the metadata and synchronization primitives of SPEC_FULL.md §3/§4.3.
pub struct CacheEntry {
    pub key: CacheKey,
    pub buffer: Arc<GrowableBuffer>,
    state: Mutex<SharedState>,
    notify: Notify,
    pub(crate) predicted_size: AtomicU64,
    pub(crate) encoded_size: AtomicU64,
    source_mtime: Mutex<Option<SystemTime>>,
    pub(crate) trailing_tag: Mutex<Vec<u8>>,
    pub(crate) finished: AtomicBool,
    error: AtomicBool,
    shutting_down: Arc<AtomicBool>,
}

impl std::fmt::Debug for CacheEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("CacheEntry")
            .field("key", &self.key)
            .field("lifecycle", &state.lifecycle)
            .field("watermark", &self.buffer.watermark())
            .field("finished", &self.finished.load(Ordering::Acquire))
            .field("error", &self.error.load(Ordering::Acquire))
            .finish()
    }
}

impl CacheEntry {
    /// Construct a `Fresh` entry. The caller (the registry) is responsible
    /// for spawning the producer via [`spawn_producer`].
    pub fn new_fresh(key: CacheKey, buffer: GrowableBuffer, shutting_down: Arc<AtomicBool>) -> Arc<Self> {
        let now = SystemTime::now();
        Arc::new(Self {
            key,
            buffer: Arc::new(buffer),
            state: Mutex::new(SharedState {
                lifecycle: Lifecycle::Fresh,
                created_at: now,
                accessed_at: now,
                ref_count: 1,
            }),
            notify: Notify::new(),
            predicted_size: AtomicU64::new(0),
            encoded_size: AtomicU64::new(0),
            source_mtime: Mutex::new(None),
            trailing_tag: Mutex::new(Vec::new()),
            finished: AtomicBool::new(false),
            error: AtomicBool::new(false),
            shutting_down,
        })
    }

    /// Construct a `Finished` entry resurrected from disk (SPEC_FULL.md
    /// §4.6 hydration), with `watermark` already equal to `encoded_size`.
    pub fn new_hydrated(
        key: CacheKey,
        buffer: GrowableBuffer,
        encoded_size: u64,
        created_at: SystemTime,
        accessed_at: SystemTime,
        source_mtime: SystemTime,
        trailing_tag: Vec<u8>,
        shutting_down: Arc<AtomicBool>,
    ) -> Arc<Self> {
        Arc::new(Self {
            key,
            buffer: Arc::new(buffer),
            state: Mutex::new(SharedState {
                lifecycle: Lifecycle::Finished,
                created_at,
                accessed_at,
                ref_count: 1,
            }),
            notify: Notify::new(),
            predicted_size: AtomicU64::new(encoded_size),
            encoded_size: AtomicU64::new(encoded_size),
            source_mtime: Mutex::new(Some(source_mtime)),
            trailing_tag: Mutex::new(trailing_tag),
            finished: AtomicBool::new(true),
            error: AtomicBool::new(false),
            shutting_down,
        })
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.state.lock().lifecycle
    }

    pub fn created_at(&self) -> SystemTime {
        self.state.lock().created_at
    }

    pub fn accessed_at(&self) -> SystemTime {
        self.state.lock().accessed_at
    }

    pub fn touch(&self) {
        let mut state = self.state.lock();
        state.accessed_at = SystemTime::now();
        drop(state);
        // Wake a suspended producer so it re-observes a fresh `accessed_at`.
        self.notify.notify_waiters();
    }

    pub fn ref_count(&self) -> u64 {
        self.state.lock().ref_count
    }

    /// Increment the reference count; called by the registry on `open` and
    /// by a reader attaching to an in-flight producer.
    pub fn acquire(&self) {
        let mut state = self.state.lock();
        state.ref_count += 1;
    }

    /// Decrement the reference count, returning the post-decrement value.
    pub fn release(&self) -> u64 {
        let mut state = self.state.lock();
        state.ref_count = state.ref_count.saturating_sub(1);
        let remaining = state.ref_count;
        drop(state);
        if remaining <= 1 {
            // Wake the producer so it can re-evaluate the suspend predicate.
            self.notify.notify_waiters();
        }
        remaining
    }

    pub fn predicted_size(&self) -> u64 {
        self.predicted_size.load(Ordering::Acquire)
    }

    pub fn encoded_size(&self) -> u64 {
        self.encoded_size.load(Ordering::Acquire)
    }

    pub fn is_finished(&self) -> bool {
        self.finished.load(Ordering::Acquire)
    }

    pub fn is_errored(&self) -> bool {
        self.error.load(Ordering::Acquire)
    }

    pub fn source_mtime(&self) -> Option<SystemTime> {
        *self.source_mtime.lock()
    }

    pub fn trailing_tag(&self) -> Vec<u8> {
        self.trailing_tag.lock().clone()
    }

    /// Current best-known size for `getattr`-style queries: `encoded_size`
    /// once `Finished`, else `predicted_size` (SPEC_FULL.md §6).
    pub fn best_known_size(&self) -> u64 {
        if self.is_finished() {
            self.encoded_size()
        } else {
            self.predicted_size()
        }
    }

    /// Wait until `watermark >= target` or the entry reaches a terminal
    /// state. Returns once the predicate holds.
    pub async fn wait_for(&self, target: u64) {
        loop {
            if self.buffer.watermark() >= target || self.is_finished() || self.is_errored() {
                return;
            }
            let notified = self.notify.notified();
            // Re-check after registering to avoid a missed-wakeup race.
            if self.buffer.watermark() >= target || self.is_finished() || self.is_errored() {
                return;
            }
            notified.await;
        }
    }

    fn notify_progress(&self) {
        self.notify.notify_waiters();
    }

    fn transition(&self, to: Lifecycle) {
        let mut state = self.state.lock();
        debug!(from = ?state.lifecycle, to = ?to, "cache entry transition");
        state.lifecycle = to;
    }

    fn mark_finished(&self, encoded_size: u64) {
        self.encoded_size.store(encoded_size, Ordering::Release);
        self.finished.store(true, Ordering::Release);
        self.transition(Lifecycle::Finished);
        self.notify.notify_waiters();
    }

    fn mark_errored(&self) {
        self.error.store(true, Ordering::Release);
        self.transition(Lifecycle::Errored);
        self.notify.notify_waiters();
    }
}

/// RAII guard returned by the registry's `open`/reader attach paths:
/// increments `ref_count` on construction, decrements on drop. Mirrors the
/// "reference-counted shared state" re-architecture recorded in DESIGN.md
/// (no raw pointers, no owning map of non-`Arc` values).
pub struct EntryHandle {
    pub entry: Arc<CacheEntry>,
}

impl EntryHandle {
    /// Wrap an already-`acquire`d entry (caller bumped `ref_count`).
    pub fn new(entry: Arc<CacheEntry>) -> Self {
        Self { entry }
    }
}

impl Drop for EntryHandle {
    fn drop(&mut self) {
        self.entry.release();
    }
}

impl std::ops::Deref for EntryHandle {
    type Target = CacheEntry;
    fn deref(&self) -> &Self::Target {
        &self.entry
    }
}

/// Batch watermark-advance notifications to avoid a thundering herd: the
/// producer only broadcasts every `NOTIFY_BYTE_INTERVAL` bytes or on a state
/// transition (SPEC_FULL.md §9 design note).
const NOTIFY_BYTE_INTERVAL: u64 = 64 * 1024;

/// Spawn the producer task for a `Fresh` entry: `open_input` →
/// `predict_size` → `open_output` → repeated `step` → `finish`. Implements
/// every transition in SPEC_FULL.md §4.3.
///
/// `producer_limit`, when set, is the `max_producers` semaphore (SPEC_FULL.md
/// §5 "Bounded concurrency"): a permit is acquired before `open_input` and
/// held for the task's lifetime, so a producer above the cap waits here
/// (and any reader attached to it waits, as usual, in `wait_for`) before
/// consuming a production slot.
pub fn spawn_producer(
    entry: Arc<CacheEntry>,
    mut transcoder: Box<dyn Transcoder>,
    config: Arc<CoreConfig>,
    producer_limit: Option<Arc<Semaphore>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let _permit = match &producer_limit {
            Some(sem) => match sem.clone().acquire_owned().await {
                Ok(permit) => Some(permit),
                Err(_) => {
                    // Semaphore closed (process shutting down): treat as abort.
                    entry.mark_errored();
                    return;
                }
            },
            None => None,
        };

        entry.transition(Lifecycle::Opening);

        if let Err(err) = transcoder.open_input(&entry.key.source_path).await {
            warn!(source = %entry.key.source_path.display(), %err, "transcoder open_input failed");
            entry.mark_errored();
            return;
        }
        *entry.source_mtime.lock() = Some(transcoder.source_mtime());
        let predicted = transcoder.predict_size();
        entry.predicted_size.store(predicted, Ordering::Release);
        transcoder.open_output(entry.buffer.clone());
        if let Err(err) = entry.buffer.reserve(predicted) {
            warn!(%err, "failed to reserve predicted capacity");
            entry.mark_errored();
            return;
        }
        *entry.trailing_tag.lock() = transcoder.trailing_tag().to_vec();

        entry.transition(Lifecycle::Producing);

        let mut last_notify_at = 0u64;

        loop {
            if entry.shutting_down.load(Ordering::Acquire) {
                info!(source = %entry.key.source_path.display(), "producer interrupted by shutdown");
                entry.mark_errored();
                return;
            }

            // Suspend/abort predicate: only the producer holds a reference
            // (ref_count <= 1) and the entry has been idle past the
            // suspend threshold.
            let idle_for = {
                let state = entry.state.lock();
                if state.ref_count <= 1 {
                    SystemTime::now()
                        .duration_since(state.accessed_at)
                        .unwrap_or_default()
                } else {
                    Duration::ZERO
                }
            };

            if idle_for > config.suspend_threshold {
                if let Lifecycle::Suspended = entry.lifecycle() {
                    // already suspended
                } else {
                    entry.transition(Lifecycle::Suspended);
                }
                if !wait_for_resume_or_abort(&entry, &config).await {
                    info!(source = %entry.key.source_path.display(), "producer aborted after idle timeout");
                    entry.mark_errored();
                    return;
                }
                entry.transition(Lifecycle::Producing);
                continue;
            }

            match transcoder.step().await {
                Ok(StepOutcome::Progress) => {
                    let wm = entry.buffer.watermark();
                    if wm.saturating_sub(last_notify_at) >= NOTIFY_BYTE_INTERVAL {
                        entry.notify_progress();
                        last_notify_at = wm;
                    }
                }
                Ok(StepOutcome::EndOfStream) => {
                    if let Err(err) = transcoder.finish().await {
                        warn!(%err, "transcoder finish failed");
                        entry.mark_errored();
                        return;
                    }
                    let final_size = entry.buffer.watermark();
                    if let Err(err) = entry.buffer.finalize(final_size) {
                        warn!(%err, "buffer finalize failed");
                        entry.mark_errored();
                        return;
                    }
                    *entry.trailing_tag.lock() = transcoder.trailing_tag().to_vec();
                    entry.mark_finished(final_size);
                    info!(source = %entry.key.source_path.display(), bytes = final_size, "transcode finished");
                    return;
                }
                Err(err) => {
                    warn!(%err, "transcoder step failed");
                    entry.mark_errored();
                    return;
                }
            }
        }
    })
}

/// Sleep on the entry's notify with a 1-second wake granularity until either
/// a reader attaches (ref_count > 1, returns `true`) or the abort threshold
/// elapses (returns `false`). Mirrors SPEC_FULL.md §4.3's `Suspended`
/// transition.
async fn wait_for_resume_or_abort(entry: &CacheEntry, config: &CoreConfig) -> bool {
    loop {
        let (ref_count, idle_for) = {
            let state = entry.state.lock();
            (
                state.ref_count,
                SystemTime::now()
                    .duration_since(state.accessed_at)
                    .unwrap_or_default(),
            )
        };
        if ref_count > 1 {
            return true;
        }
        if idle_for > config.abort_threshold {
            return false;
        }
        if entry.shutting_down.load(Ordering::Acquire) {
            return false;
        }
        let wake_granularity = Duration::from_secs(1);
        let notified = entry.notify.notified();
        let deadline = TokioInstant::now() + wake_granularity;
        tokio::select! {
            _ = notified => {}
            _ = tokio::time::sleep_until(deadline) => {}
        }
    }
}
