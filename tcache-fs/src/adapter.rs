//! `VirtualView`: the reference, non-FUSE consumer of `tcache-core`.
//!
//! Implements exactly the three operations a FUSE `fuse_operations` table
//! would route through (`getattr`/`read`/`readdir`), against a real
//! directory tree, delegating byte-range reads to
//! `tcache_core::reader::ReaderCoordinator` (SPEC_FULL.md §6, §10.5). No
//! FUSE binding crate is introduced — see DESIGN.md Open Question 6.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tracing::debug;

use tcache_core::error::{CacheError, Result};
use tcache_core::key::{CacheKey, TargetRecipe};
use tcache_core::reader::ReaderCoordinator;
use tcache_core::registry::Cache;

/// Upper bound on how long `getattr` waits for a freshly-spawned producer's
/// `predict_size` probe before reporting size 0.
const GETATTR_PROBE_TIMEOUT: Duration = Duration::from_millis(500);
const GETATTR_POLL_INTERVAL: Duration = Duration::from_millis(10);

/// Result of a `getattr`-style query: the current best-known size and the
/// source file's mtime (SPEC_FULL.md §6).
#[derive(Debug, Clone, Copy)]
pub struct VirtualAttr {
    pub size: u64,
    pub mtime: SystemTime,
}

/// A directory entry as seen through the virtual view: the name readers see
/// (already extension-rewritten) and whether it is a directory.
#[derive(Debug, Clone)]
pub struct VirtualDirEntry {
    pub name: String,
    pub is_dir: bool,
}

/// Read-only, pass-through view of `source_root` in which every decodable
/// source file appears renamed to `recipe`'s target extension and is
/// transcoded on demand through `cache`.
pub struct VirtualView {
    source_root: PathBuf,
    cache: Arc<Cache>,
    recipe: TargetRecipe,
    /// Source extensions this view considers decodable; anything else passes
    /// through `readdir` unchanged and is never offered for transcoding.
    source_extensions: Vec<String>,
}

impl VirtualView {
    pub fn new(
        source_root: impl Into<PathBuf>,
        cache: Arc<Cache>,
        recipe: TargetRecipe,
        source_extensions: Vec<String>,
    ) -> Self {
        Self {
            source_root: source_root.into(),
            cache,
            recipe,
            source_extensions,
        }
    }

    fn is_decodable(&self, ext: &str) -> bool {
        self.source_extensions
            .iter()
            .any(|e| e.eq_ignore_ascii_case(ext))
    }

    /// Map a virtual relative path (carrying the target extension) back to
    /// the real source file it was rewritten from, trying every configured
    /// source extension in turn.
    fn resolve_source(&self, virtual_relative: &Path) -> Option<PathBuf> {
        let target_ext = self.recipe.format.extension();
        let stem_path = virtual_relative.with_extension("");
        if virtual_relative.extension().and_then(|e| e.to_str()) != Some(target_ext) {
            return None;
        }
        for ext in &self.source_extensions {
            let candidate = self.source_root.join(stem_path.with_extension(ext));
            if candidate.is_file() {
                return Some(candidate);
            }
        }
        None
    }

    fn key_for(&self, virtual_relative: &Path) -> Option<CacheKey> {
        self.resolve_source(virtual_relative)
            .map(|source| CacheKey::new(source, self.recipe.clone()))
    }

    /// `getattr(virtual_path)`: best known size, source mtime (SPEC_FULL.md §6).
    ///
    /// On a freshly-spawned producer, `predicted_size` is zero until the
    /// transcoder has opened the source and returned its own one-shot probe
    /// (SPEC_FULL.md §4.2 `predict_size`/§6 "one-shot probe of the
    /// `Transcoder` to compute one"). Rather than return that transient 0,
    /// this waits a short, bounded interval for the probe to land.
    pub async fn getattr(&self, virtual_relative: &Path) -> Result<VirtualAttr> {
        let key = self
            .key_for(virtual_relative)
            .ok_or_else(|| CacheError::SourceMissing(virtual_relative.to_path_buf()))?;
        let source_mtime = std::fs::metadata(&key.source_path)?.modified()?;

        let handle = self.cache.open(key)?;
        let deadline = tokio::time::Instant::now() + GETATTR_PROBE_TIMEOUT;
        while handle.best_known_size() == 0 && !handle.is_finished() && !handle.is_errored() {
            if tokio::time::Instant::now() >= deadline {
                debug!("predict_size probe did not land within the getattr timeout, reporting size 0");
                break;
            }
            tokio::time::sleep(GETATTR_POLL_INTERVAL).await;
        }
        let size = handle.best_known_size();
        self.cache.close(handle, false)?;

        Ok(VirtualAttr {
            size,
            mtime: source_mtime,
        })
    }

    /// `read(virtual_path, buf, offset, len)` (SPEC_FULL.md §4.4/§6).
    pub async fn read(&self, virtual_relative: &Path, dst: &mut [u8], offset: u64, len: usize) -> Result<usize> {
        let key = self
            .key_for(virtual_relative)
            .ok_or_else(|| CacheError::SourceMissing(virtual_relative.to_path_buf()))?;
        let handle = self.cache.open(key)?;
        let outcome = ReaderCoordinator::read(&handle, dst, offset, len).await;
        self.cache.close(handle, false)?;
        outcome.map(|o| o.bytes_copied)
    }

    /// `readdir`: names with decodable source extensions are rewritten to
    /// carry the target extension; everything else passes through unchanged
    /// (SPEC_FULL.md §6).
    pub fn readdir(&self, dir_relative: &Path) -> Result<Vec<VirtualDirEntry>> {
        let real_dir = self.source_root.join(dir_relative);
        let mut out = Vec::new();
        for entry in std::fs::read_dir(&real_dir)? {
            let entry = entry?;
            let file_type = entry.file_type()?;
            let name = entry.file_name().to_string_lossy().into_owned();

            if file_type.is_dir() {
                out.push(VirtualDirEntry { name, is_dir: true });
                continue;
            }

            let path = PathBuf::from(&name);
            let rewritten = match path.extension().and_then(|e| e.to_str()) {
                Some(ext) if self.is_decodable(ext) => {
                    let mut renamed = path.clone();
                    renamed.set_extension(self.recipe.format.extension());
                    renamed.to_string_lossy().into_owned()
                }
                _ => name,
            };
            out.push(VirtualDirEntry {
                name: rewritten,
                is_dir: false,
            });
        }
        debug!(dir = %real_dir.display(), count = out.len(), "listed virtual directory");
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tcache_core::config::CoreConfig;
    use tcache_core::error::Result as CoreResult;
    use tcache_core::key::{GainMode, TargetFormat};
    use tcache_core::registry::TranscoderFactory;
    use tcache_core::transcoder::{StepOutcome, Transcoder};

    struct NoopFactory;
    struct NoopTranscoder {
        buf: Option<Arc<tcache_core::buffer::GrowableBuffer>>,
    }

    #[async_trait::async_trait]
    impl Transcoder for NoopTranscoder {
        async fn open_input(&mut self, _source_path: &Path) -> CoreResult<()> {
            Ok(())
        }
        fn source_mtime(&self) -> SystemTime {
            SystemTime::UNIX_EPOCH
        }
        fn predict_size(&self) -> u64 {
            10
        }
        fn open_output(&mut self, buffer: Arc<tcache_core::buffer::GrowableBuffer>) {
            self.buf = Some(buffer);
        }
        async fn step(&mut self) -> CoreResult<StepOutcome> {
            if let Some(buf) = &self.buf {
                buf.append(b"0123456789")?;
            }
            Ok(StepOutcome::EndOfStream)
        }
        async fn finish(&mut self) -> CoreResult<()> {
            Ok(())
        }
        fn trailing_tag(&self) -> &[u8] {
            &[]
        }
    }

    impl TranscoderFactory for NoopFactory {
        fn build(&self, _key: &CacheKey) -> CoreResult<Box<dyn Transcoder>> {
            Ok(Box::new(NoopTranscoder { buf: None }))
        }
    }

    fn recipe() -> TargetRecipe {
        TargetRecipe {
            format: TargetFormat::Mp3,
            bitrate_kbps: Some(192),
            vbr: false,
            gain_mode: GainMode::Off,
            sample_rate_cap: None,
            quality: 2,
        }
    }

    #[tokio::test]
    async fn readdir_rewrites_decodable_extensions_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("song.flac"), b"fake flac").unwrap();
        std::fs::write(dir.path().join("cover.jpg"), b"fake jpg").unwrap();

        let mut config = CoreConfig::default();
        config.cache_root = dir.path().join("cache");
        let cache = Arc::new(Cache::new(Arc::new(config), Arc::new(NoopFactory)));
        let view = VirtualView::new(dir.path(), cache, recipe(), vec!["flac".into()]);

        let mut names: Vec<String> = view.readdir(Path::new("")).unwrap().into_iter().map(|e| e.name).collect();
        names.sort();
        assert_eq!(names, vec!["cover.jpg".to_string(), "song.mp3".to_string()]);
    }

    #[tokio::test]
    async fn read_through_view_drives_cache_and_returns_bytes() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("song.flac"), b"fake flac").unwrap();

        let mut config = CoreConfig::default();
        config.cache_root = dir.path().join("cache");
        let cache = Arc::new(Cache::new(Arc::new(config), Arc::new(NoopFactory)));
        let view = VirtualView::new(dir.path(), cache, recipe(), vec!["flac".into()]);

        let mut dst = [0u8; 10];
        let n = view.read(Path::new("song.mp3"), &mut dst, 0, 10).await.unwrap();
        assert_eq!(n, 10);
        assert_eq!(&dst, b"0123456789");
    }

    #[tokio::test]
    async fn getattr_reports_predicted_size_once_probe_lands() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("song.flac"), b"fake flac").unwrap();

        let mut config = CoreConfig::default();
        config.cache_root = dir.path().join("cache");
        let cache = Arc::new(Cache::new(Arc::new(config), Arc::new(NoopFactory)));
        let view = VirtualView::new(dir.path(), cache, recipe(), vec!["flac".into()]);

        let attr = view.getattr(Path::new("song.mp3")).await.unwrap();
        assert_eq!(attr.size, 10, "predict_size's result should be visible, not the transient 0");
    }
}
