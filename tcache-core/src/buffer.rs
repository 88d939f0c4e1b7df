//! `GrowableBuffer`: an append-only byte store with a monotonically
//! increasing high-water mark, optionally backed by a memory-mapped on-disk
//! file.
//!
//! Grounded on SPEC_FULL.md §4.1 directly; the mmap-backed variant follows
//! `vectordotdev-vector/lib/vector-buffers/src/variants/disk_v2/io.rs`'s use
//! of `memmap2::MmapMut` over a pre-sized file.

use std::fs::OpenOptions;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use memmap2::MmapMut;
use parking_lot::Mutex;

use crate::error::{CacheError, Result};

/// Backing medium for a [`GrowableBuffer`].
enum Backing {
    /// Plain `Vec<u8>`, used for disabled-cache or otherwise temporary
    /// entries that never need to survive a restart.
    Memory(Mutex<Vec<u8>>),
    /// A pre-sized sparse file mapped with `memmap2::MmapMut`. The mutex
    /// guards only resize operations (`reserve`/`finalize`); `append` and
    /// `read` index into the mapping directly once sized.
    File {
        path: PathBuf,
        map: Mutex<MmapMut>,
    },
}

/// Append-only, randomly-readable byte store with a single authorized
/// out-of-order "tail" region for splicing a trailing tag.
///
/// `watermark` is an `AtomicU64` so concurrent readers can observe it with
/// acquire semantics without taking any lock (SPEC_FULL.md §4.1,
/// §5 ordering guarantees).
pub struct GrowableBuffer {
    backing: Backing,
    watermark: AtomicU64,
    capacity: AtomicU64,
    finalized: AtomicU64, // 0 = not finalized, 1 = finalized (used as bool)
}

impl std::fmt::Debug for GrowableBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GrowableBuffer")
            .field("watermark", &self.watermark.load(Ordering::Acquire))
            .field("capacity", &self.capacity.load(Ordering::Acquire))
            .finish()
    }
}

impl GrowableBuffer {
    /// Construct an in-memory buffer (no disk persistence).
    pub fn in_memory() -> Self {
        Self {
            backing: Backing::Memory(Mutex::new(Vec::new())),
            watermark: AtomicU64::new(0),
            capacity: AtomicU64::new(0),
            finalized: AtomicU64::new(0),
        }
    }

    /// Construct a file-backed buffer over `path`, creating it if absent.
    /// The file starts at zero length; call [`reserve`](Self::reserve) to
    /// grow it before the first `append`.
    pub fn file_backed(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)?;
        let len = file.metadata()?.len();
        let map = if len == 0 {
            // memmap2 refuses to map a zero-length file; grow it to at least
            // one page before mapping, then reserve() will extend further.
            file.set_len(4096)?;
            unsafe { MmapMut::map_mut(&file)? }
        } else {
            unsafe { MmapMut::map_mut(&file)? }
        };
        let capacity = map.len() as u64;
        Ok(Self {
            backing: Backing::File {
                path,
                map: Mutex::new(map),
            },
            watermark: AtomicU64::new(0),
            capacity: AtomicU64::new(capacity),
            finalized: AtomicU64::new(0),
        })
    }

    /// Resume a file-backed buffer whose prior run already wrote
    /// `watermark` bytes (used when hydrating a `Finished` entry from disk;
    /// see SPEC_FULL.md §4.6).
    pub fn resume_file_backed(path: impl Into<PathBuf>, watermark: u64) -> Result<Self> {
        let buf = Self::file_backed(path)?;
        if watermark > buf.capacity.load(Ordering::Acquire) {
            return Err(CacheError::InvalidRegion(format!(
                "resumed watermark {watermark} exceeds mapped capacity"
            )));
        }
        buf.watermark.store(watermark, Ordering::Release);
        Ok(buf)
    }

    /// Current high-water mark; acquire-ordered so a reader that observes a
    /// value `W` may safely read bytes `[0, W)` (SPEC_FULL.md §4.1, I3).
    pub fn watermark(&self) -> u64 {
        self.watermark.load(Ordering::Acquire)
    }

    fn capacity(&self) -> u64 {
        self.capacity.load(Ordering::Acquire)
    }

    /// Pre-allocate/pre-grow to at least `capacity`. Does not change
    /// `watermark`.
    pub fn reserve(&self, capacity: u64) -> Result<()> {
        if capacity <= self.capacity() {
            return Ok(());
        }
        match &self.backing {
            Backing::Memory(buf) => {
                let mut buf = buf.lock();
                if (capacity as usize) > buf.capacity() {
                    buf.reserve((capacity as usize).saturating_sub(buf.len()));
                }
                self.capacity.store(capacity, Ordering::Release);
                Ok(())
            }
            Backing::File { path, map } => {
                let mut map_guard = map.lock();
                let file = OpenOptions::new().read(true).write(true).open(path)?;
                file.set_len(capacity).map_err(|e| {
                    CacheError::OutOfSpace(format!("failed to grow {}: {e}", path.display()))
                })?;
                let new_map = unsafe { MmapMut::map_mut(&file)? };
                *map_guard = new_map;
                self.capacity.store(capacity, Ordering::Release);
                Ok(())
            }
        }
    }

    /// Write `bytes` at the current watermark, advancing it by `bytes.len()`.
    pub fn append(&self, bytes: &[u8]) -> Result<()> {
        let start = self.watermark.load(Ordering::Acquire);
        let end = start
            .checked_add(bytes.len() as u64)
            .ok_or_else(|| CacheError::OutOfSpace("watermark overflow".into()))?;
        if end > self.capacity() {
            self.reserve(next_capacity(end))?;
        }
        self.write_at(start, bytes)?;
        // Release: publishes the bytes written above before any reader can
        // observe the new watermark value (SPEC_FULL.md §5 ordering).
        self.watermark.store(end, Ordering::Release);
        Ok(())
    }

    /// Write `bytes` at `at_offset`, which must lie at or beyond the current
    /// watermark (the single authorized out-of-order region, used solely for
    /// the trailing tag). Does not advance `watermark`.
    pub fn splice(&self, bytes: &[u8], at_offset: u64) -> Result<()> {
        let wm = self.watermark.load(Ordering::Acquire);
        if at_offset < wm {
            return Err(CacheError::InvalidRegion(format!(
                "splice at {at_offset} overlaps appended region (watermark={wm})"
            )));
        }
        let end = at_offset
            .checked_add(bytes.len() as u64)
            .ok_or_else(|| CacheError::OutOfSpace("splice offset overflow".into()))?;
        if end > self.capacity() {
            self.reserve(end)?;
        }
        self.write_at(at_offset, bytes)
    }

    fn write_at(&self, offset: u64, bytes: &[u8]) -> Result<()> {
        match &self.backing {
            Backing::Memory(buf) => {
                let mut buf = buf.lock();
                let end = offset as usize + bytes.len();
                if buf.len() < end {
                    buf.resize(end, 0);
                }
                buf[offset as usize..end].copy_from_slice(bytes);
                Ok(())
            }
            Backing::File { map, .. } => {
                let mut map = map.lock();
                let start = offset as usize;
                let end = start + bytes.len();
                if end > map.len() {
                    return Err(CacheError::OutOfSpace(
                        "write exceeds mapped region".into(),
                    ));
                }
                map[start..end].copy_from_slice(bytes);
                Ok(())
            }
        }
    }

    /// Copy up to `len` bytes starting at `at_offset` into `dst`, returning
    /// the actual count copied. Clamped to the current watermark.
    pub fn read(&self, dst: &mut [u8], at_offset: u64, len: usize) -> usize {
        let wm = self.watermark.load(Ordering::Acquire);
        if at_offset >= wm {
            return 0;
        }
        let avail = (wm - at_offset).min(len as u64).min(dst.len() as u64) as usize;
        if avail == 0 {
            return 0;
        }
        let start = at_offset as usize;
        match &self.backing {
            Backing::Memory(buf) => {
                let buf = buf.lock();
                dst[..avail].copy_from_slice(&buf[start..start + avail]);
            }
            Backing::File { map, .. } => {
                let map = map.lock();
                dst[..avail].copy_from_slice(&map[start..start + avail]);
            }
        }
        avail
    }

    /// Read an arbitrary region (including the spliced tail beyond
    /// `watermark`), used by the reader coordinator's tail-read shortcut
    /// where the precondition is already known to be satisfied by the
    /// caller (SPEC_FULL.md §4.4).
    pub fn read_raw(&self, dst: &mut [u8], at_offset: u64, len: usize) -> usize {
        let cap = self.capacity();
        if at_offset >= cap {
            return 0;
        }
        let avail = (cap - at_offset).min(len as u64).min(dst.len() as u64) as usize;
        let start = at_offset as usize;
        match &self.backing {
            Backing::Memory(buf) => {
                let buf = buf.lock();
                let real_avail = avail.min(buf.len().saturating_sub(start));
                dst[..real_avail].copy_from_slice(&buf[start..start + real_avail]);
                real_avail
            }
            Backing::File { map, .. } => {
                let map = map.lock();
                dst[..avail].copy_from_slice(&map[start..start + avail]);
                avail
            }
        }
    }

    /// Mark the buffer immutable at `encoded_size`, truncating any
    /// pre-reserved slack, and flush the backing store.
    pub fn finalize(&self, encoded_size: u64) -> Result<()> {
        match &self.backing {
            Backing::Memory(buf) => {
                let mut buf = buf.lock();
                buf.truncate(encoded_size as usize);
            }
            Backing::File { path, map } => {
                {
                    let map = map.lock();
                    map.flush()?;
                }
                let file = OpenOptions::new().read(true).write(true).open(path)?;
                file.set_len(encoded_size)?;
                let mut map = map.lock();
                *map = unsafe { MmapMut::map_mut(&file)? };
            }
        }
        self.capacity.store(encoded_size, Ordering::Release);
        self.finalized.store(1, Ordering::Release);
        Ok(())
    }

    pub fn is_finalized(&self) -> bool {
        self.finalized.load(Ordering::Acquire) == 1
    }

    pub fn backing_path(&self) -> Option<&Path> {
        match &self.backing {
            Backing::Memory(_) => None,
            Backing::File { path, .. } => Some(path),
        }
    }
}

/// Grows the requested capacity by 25% headroom to cut down on repeated
/// small `reserve` calls during streaming appends, similar in spirit to
/// `Vec`'s amortized growth.
fn next_capacity(required: u64) -> u64 {
    required + required / 4 + 4096
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn append_advances_watermark_and_is_readable() {
        let buf = GrowableBuffer::in_memory();
        buf.append(b"hello").unwrap();
        assert_eq!(buf.watermark(), 5);
        let mut out = [0u8; 5];
        assert_eq!(buf.read(&mut out, 0, 5), 5);
        assert_eq!(&out, b"hello");
    }

    #[test]
    fn read_past_watermark_returns_zero() {
        let buf = GrowableBuffer::in_memory();
        buf.append(b"ab").unwrap();
        let mut out = [0u8; 4];
        assert_eq!(buf.read(&mut out, 2, 4), 0);
    }

    #[test]
    fn read_truncates_to_watermark() {
        let buf = GrowableBuffer::in_memory();
        buf.append(b"abcdef").unwrap();
        let mut out = [0u8; 10];
        assert_eq!(buf.read(&mut out, 3, 10), 3);
        assert_eq!(&out[..3], b"def");
    }

    #[test]
    fn splice_before_watermark_is_rejected() {
        let buf = GrowableBuffer::in_memory();
        buf.append(b"abcdef").unwrap();
        let err = buf.splice(b"x", 2).unwrap_err();
        assert!(matches!(err, CacheError::InvalidRegion(_)));
    }

    #[test]
    fn splice_beyond_watermark_is_readable_via_raw() {
        let buf = GrowableBuffer::in_memory();
        buf.append(b"abc").unwrap();
        buf.splice(b"TAG", 100).unwrap();
        let mut out = [0u8; 3];
        // Not yet visible through the normal watermark-clamped read.
        assert_eq!(buf.read(&mut out, 100, 3), 0);
        assert_eq!(buf.read_raw(&mut out, 100, 3), 3);
        assert_eq!(&out, b"TAG");
    }

    #[test]
    fn file_backed_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.mp3");
        let buf = GrowableBuffer::file_backed(&path).unwrap();
        buf.append(b"streamed bytes").unwrap();
        buf.finalize(buf.watermark()).unwrap();
        drop(buf);

        let resumed = GrowableBuffer::resume_file_backed(&path, 14).unwrap();
        let mut out = [0u8; 14];
        assert_eq!(resumed.read(&mut out, 0, 14), 14);
        assert_eq!(&out, b"streamed bytes");
    }

    #[test]
    fn finalize_truncates_slack() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("artifact.mp3");
        let buf = GrowableBuffer::file_backed(&path).unwrap();
        buf.reserve(10_000).unwrap();
        buf.append(b"short").unwrap();
        buf.finalize(5).unwrap();
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 5);
    }
}
