//! `Cache`: the process-wide registry mapping a `CacheKey` to a
//! `CacheEntry`. Responsible for `open`/`close` (reference counting), index
//! persistence, eviction, and maintenance (SPEC_FULL.md §4.5/§4.6).
//!
//! The concurrent map follows
//! `ferrex_server::infra::cache::movie_batches_cache::MovieBatchesCache`'s
//! `DashMap<K, Arc<...>>` pattern rather than a `tokio::sync::RwLock<HashMap<..>>`:
//! both appear in the teacher, but `DashMap` avoids a single
//! registry-wide writer lock on every `ref_count` crossing, which matters
//! here given how much more write-heavy this registry is than the
//! teacher's request-scoped response cache.

use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::SystemTime;

use dashmap::DashMap;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

use crate::buffer::GrowableBuffer;
use crate::config::CoreConfig;
use crate::entry::{spawn_producer, CacheEntry, EntryHandle, Lifecycle};
use crate::error::Result;
use crate::eviction::{plan_eviction, DiskPressure, EvictionCandidate, EvictionDecision};
use crate::key::{key_id, CacheKey};
use crate::persistence::{persisted_paths, validate_pair, InfoRecord};
use crate::transcoder::Transcoder;

/// Factory the registry calls to build a fresh `Transcoder` for a key it
/// needs to (re)produce. Kept as a trait object so `tcache-core` never
/// depends on the concrete ffmpeg-wrapper implementations in `tcache-fs`.
pub trait TranscoderFactory: Send + Sync {
    fn build(&self, key: &CacheKey) -> Result<Box<dyn Transcoder>>;
}

/// The process-wide cache registry.
pub struct Cache {
    entries: DashMap<String, Arc<CacheEntry>>,
    config: Arc<CoreConfig>,
    factory: Arc<dyn TranscoderFactory>,
    shutting_down: Arc<AtomicBool>,
    /// `max_producers` cap (SPEC_FULL.md §5); `None` when the config value is
    /// 0 ("unbounded" per §6).
    producer_limit: Option<Arc<Semaphore>>,
}

impl std::fmt::Debug for Cache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cache")
            .field("entries", &self.entries.len())
            .finish()
    }
}

impl Cache {
    pub fn new(config: Arc<CoreConfig>, factory: Arc<dyn TranscoderFactory>) -> Self {
        let producer_limit = (config.max_producers > 0)
            .then(|| Arc::new(Semaphore::new(config.max_producers)));
        Self {
            entries: DashMap::new(),
            config,
            factory,
            shutting_down: Arc::new(AtomicBool::new(false)),
            producer_limit,
        }
    }

    pub fn shutting_down_flag(&self) -> Arc<AtomicBool> {
        self.shutting_down.clone()
    }

    pub fn request_shutdown(&self) {
        self.shutting_down.store(true, Ordering::Release);
    }

    fn artifact_path(&self, key: &CacheKey) -> std::path::PathBuf {
        let mount_id = self.config.mount_id();
        persisted_paths(&self.config.cache_root, &mount_id, &key.relative_cache_path()).artifact
    }

    fn info_path(&self, key: &CacheKey) -> std::path::PathBuf {
        let mount_id = self.config.mount_id();
        persisted_paths(&self.config.cache_root, &mount_id, &key.relative_cache_path()).info
    }

    /// `open(key)`: creates a new entry if none present, otherwise
    /// increments the reference count. Attempts to hydrate from disk if a
    /// matching artifact exists with a consistent `source_mtime`
    /// (SPEC_FULL.md §4.5). An `Errored` in-memory entry is discarded and
    /// re-attempted from scratch rather than reattached to (SPEC_FULL.md §5:
    /// "will be re-attempted on the next open").
    pub fn open(&self, key: CacheKey) -> Result<EntryHandle> {
        let id = key_id(&key);

        if let Some(entry) = self.entries.get(&id).map(|e| e.clone()) {
            if !entry.is_errored() {
                entry.acquire();
                return Ok(EntryHandle::new(entry));
            }
            debug!(id = %id, "discarding errored entry, respawning producer on open");
            self.entries.remove(&id);
        }

        // Not in memory: try hydration before spawning a fresh producer.
        if let Some(entry) = self.try_hydrate(&key)? {
            // `new_hydrated` starts at `ref_count == 1` as the baseline unit
            // (SPEC_FULL.md §3); this caller's handle is a reader on top of
            // that, so it must `acquire()` like the in-memory-hit path above.
            entry.acquire();
            self.entries.insert(id, entry.clone());
            return Ok(EntryHandle::new(entry));
        }

        let entry = self.spawn_fresh(key)?;
        // `new_fresh` likewise starts at `ref_count == 1` for the producer's
        // own baseline unit; this caller is the first reader on top of it.
        entry.acquire();
        self.entries.insert(id, entry.clone());
        Ok(EntryHandle::new(entry))
    }

    fn spawn_fresh(&self, key: CacheKey) -> Result<Arc<CacheEntry>> {
        // Eviction trigger (b), SPEC_FULL.md §4.6: run a budget check before
        // starting a new producer. The new entry's `predicted_size` is not
        // known yet at this point (it is only computed once the transcoder
        // has opened the source, inside the producer task itself), so this
        // synchronously reclaims space if the registry is already over
        // budget rather than pre-charging an unknown size.
        if !self.config.disable_cache {
            let disk = probe_disk_pressure(&self.config.cache_root);
            self.ensure_budget_for(0, &disk)?;
        }

        let path = self.artifact_path(&key);
        let buffer = if self.config.disable_cache {
            GrowableBuffer::in_memory()
        } else {
            GrowableBuffer::file_backed(&path)?
        };
        let entry = CacheEntry::new_fresh(key.clone(), buffer, self.shutting_down.clone());
        let transcoder = self.factory.build(&key)?;
        spawn_producer(entry.clone(), transcoder, self.config.clone(), self.producer_limit.clone());
        Ok(entry)
    }

    fn try_hydrate(&self, key: &CacheKey) -> Result<Option<Arc<CacheEntry>>> {
        let paths = persisted_paths(
            &self.config.cache_root,
            &self.config.mount_id(),
            &key.relative_cache_path(),
        );
        if !validate_pair(&paths)? {
            return Ok(None);
        }
        let info = match InfoRecord::read_from(&paths.info) {
            Ok(info) => info,
            Err(err) => {
                debug!(%err, "hydration failed to read info sidecar, treating as no cache");
                return Ok(None);
            }
        };
        if !info.finished {
            debug!("stale/unfinished artifact found on disk, discarding");
            let _ = std::fs::remove_file(&paths.artifact);
            let _ = std::fs::remove_file(&paths.info);
            return Ok(None);
        }
        let current_mtime = std::fs::metadata(&key.source_path).and_then(|m| m.modified());
        let fresh = match current_mtime {
            Ok(mtime) => mtime == info.source_mtime,
            Err(_) => false,
        };
        if !fresh {
            debug!(source = %key.source_path.display(), "source mtime mismatch, discarding stale artifact");
            let _ = std::fs::remove_file(&paths.artifact);
            let _ = std::fs::remove_file(&paths.info);
            return Ok(None);
        }

        let buffer = GrowableBuffer::resume_file_backed(&paths.artifact, info.encoded_size)?;
        info!(source = %key.source_path.display(), "hydrated finished cache entry from disk");
        Ok(Some(CacheEntry::new_hydrated(
            key.clone(),
            buffer,
            info.encoded_size,
            info.created_at,
            info.accessed_at,
            info.source_mtime,
            info.trailing_tag,
            self.shutting_down.clone(),
        )))
    }

    /// `close(entry, erase_cache)`: decrements the reference count; if it
    /// reaches zero and (`error` OR explicit erase OR cache disabled),
    /// deletes the entry and its on-disk artifacts.
    pub fn close(&self, handle: EntryHandle, erase_cache: bool) -> Result<()> {
        let entry = handle.entry.clone();
        let remaining = entry.release();
        // Prevent the `EntryHandle` drop from double-releasing.
        std::mem::forget(handle);

        if remaining > 0 {
            return Ok(());
        }

        let should_erase = entry.is_errored() || erase_cache || self.config.disable_cache;
        if should_erase {
            self.evict_one(&entry)?;
        } else if entry.is_finished() {
            self.persist_info(&entry)?;
        }
        Ok(())
    }

    fn persist_info(&self, entry: &CacheEntry) -> Result<()> {
        let info_path = self.info_path(&entry.key);
        let record = InfoRecord {
            encoded_size: entry.encoded_size(),
            finished: entry.is_finished(),
            error: entry.is_errored(),
            created_at: entry.created_at(),
            accessed_at: entry.accessed_at(),
            source_mtime: entry.source_mtime().unwrap_or(SystemTime::UNIX_EPOCH),
            trailing_tag: entry.trailing_tag(),
        };
        record.write_to(&info_path)
    }

    fn evict_one(&self, entry: &CacheEntry) -> Result<()> {
        let id = key_id(&entry.key);
        self.entries.remove(&id);
        let artifact = self.artifact_path(&entry.key);
        let info = self.info_path(&entry.key);
        let _ = std::fs::remove_file(&artifact);
        let _ = std::fs::remove_file(&info);
        Ok(())
    }

    /// `prune(budget)`: evaluate SPEC_FULL.md §4.6's eviction rules across
    /// every entry currently tracked and delete whatever the plan selects.
    pub fn prune(&self, disk: &DiskPressure) -> Result<Vec<EvictionDecision>> {
        let now = SystemTime::now();
        let mut candidates = Vec::new();
        for r in self.entries.iter() {
            let entry = r.value();
            let stale = match (entry.source_mtime(), std::fs::metadata(&entry.key.source_path).and_then(|m| m.modified())) {
                (Some(recorded), Ok(current)) => recorded != current,
                _ => false,
            };
            let on_disk_size = std::fs::metadata(self.artifact_path(&entry.key))
                .map(|m| m.len())
                .unwrap_or(0);
            candidates.push(EvictionCandidate {
                id: key_id(&entry.key),
                on_disk_size,
                created_at: entry.created_at(),
                accessed_at: entry.accessed_at(),
                ref_count: entry.ref_count().saturating_sub(1),
                stale,
            });
        }

        let decisions = plan_eviction(&candidates, &self.config, disk, now);
        for decision in &decisions {
            if let Some((_, entry)) = self.entries.remove(&decision.id) {
                let artifact = self.artifact_path(&entry.key);
                let info = self.info_path(&entry.key);
                if let Err(err) = std::fs::remove_file(&artifact) {
                    if err.kind() != std::io::ErrorKind::NotFound {
                        warn!(%err, "failed to remove evicted artifact");
                    }
                }
                let _ = std::fs::remove_file(&info);
                info!(id = %decision.id, reason = ?decision.reason, "evicted cache entry");
            }
        }
        Ok(decisions)
    }

    /// Synchronous pre-check before starting a new entry whose
    /// `predicted_size` would exceed the remaining budget (SPEC_FULL.md
    /// §4.6 eviction trigger (b)).
    pub fn ensure_budget_for(&self, additional: u64, disk: &DiskPressure) -> Result<()> {
        if self.config.max_cache_size == 0 {
            return Ok(());
        }
        let current: u64 = self
            .entries
            .iter()
            .map(|r| {
                std::fs::metadata(self.artifact_path(&r.key))
                    .map(|m| m.len())
                    .unwrap_or(0)
            })
            .sum();
        if current.saturating_add(additional) > self.config.max_cache_size {
            self.prune(disk)?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Used by tests and `tcachefs stats` to look up an in-memory entry
    /// without affecting its reference count.
    pub fn peek(&self, key: &CacheKey) -> Option<Arc<CacheEntry>> {
        self.entries.get(&key_id(key)).map(|e| e.clone())
    }

    pub fn lifecycle_of(&self, key: &CacheKey) -> Option<Lifecycle> {
        self.peek(key).map(|e| e.lifecycle())
    }
}

/// Real disk-space probe for the cache volume, used by the maintenance
/// leader and by `ensure_budget_for` call sites outside of tests.
pub fn probe_disk_pressure(cache_root: &Path) -> DiskPressure {
    #[cfg(unix)]
    {
        if let Ok(stat) = nix::sys::statvfs::statvfs(cache_root) {
            let free = stat.blocks_available() as u64 * stat.fragment_size() as u64;
            return DiskPressure { free_bytes: free };
        }
    }
    DiskPressure {
        free_bytes: u64::MAX,
    }
}
