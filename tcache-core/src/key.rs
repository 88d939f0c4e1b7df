//! Cache addressing: `(source_path, target_recipe)` pairs and the recipe
//! model itself.
//!
//! Mirrors `ferrex_server::transcoding::profiles::TranscodingProfile` (a
//! flat, serializable description of an encoder target) but narrowed to the
//! fields that change the output bytes, per SPEC_FULL.md §3.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

/// Output container/codec family a source can be transcoded to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TargetFormat {
    Mp3,
    Mp4,
}

impl TargetFormat {
    /// File extension used both for the rewritten virtual name and the
    /// on-disk artifact suffix.
    pub fn extension(&self) -> &'static str {
        match self {
            TargetFormat::Mp3 => "mp3",
            TargetFormat::Mp4 => "mp4",
        }
    }
}

/// Every parameter that would change the output bytes for a given source.
/// Two reads whose recipes compare equal must produce byte-identical
/// artifacts; see SPEC_FULL.md §3 ("CacheKey").
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TargetRecipe {
    pub format: TargetFormat,
    /// Constant bitrate in kbps, or `None` for VBR.
    pub bitrate_kbps: Option<u32>,
    pub vbr: bool,
    /// ReplayGain-style loudness normalization toggle.
    pub gain_mode: GainMode,
    /// Caps the output sample rate; `None` passes the source rate through.
    pub sample_rate_cap: Option<u32>,
    /// Encoder speed/quality tradeoff (codec-specific scale).
    pub quality: u8,
}

impl TargetRecipe {
    /// A stable string uniquely identifying this recipe, used both for the
    /// on-disk path component and as part of equality/hash in the registry.
    pub fn fingerprint(&self) -> String {
        format!(
            "{:?}-{}-{}-{:?}-{:?}-{}",
            self.format,
            self.bitrate_kbps.unwrap_or(0),
            self.vbr,
            self.gain_mode,
            self.sample_rate_cap,
            self.quality
        )
    }

    /// Fixed trailing-tag length for this recipe's format, or `None` if the
    /// format has no fixed trailing tag (see SPEC_FULL.md §4.4 tail-read
    /// shortcut).
    pub fn trailing_tag_len(&self) -> Option<u64> {
        match self.format {
            TargetFormat::Mp3 => Some(128),
            TargetFormat::Mp4 => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum GainMode {
    Off,
    Track,
    Album,
}

/// `(source_path, target_recipe)`: the cache's sole addressing unit.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheKey {
    pub source_path: PathBuf,
    pub recipe: TargetRecipe,
}

impl CacheKey {
    pub fn new(source_path: impl Into<PathBuf>, recipe: TargetRecipe) -> Self {
        Self {
            source_path: source_path.into(),
            recipe,
        }
    }

    /// Path (relative to a mount-specific cache root) at which this key's
    /// artifact and info sidecar live, per SPEC_FULL.md §6.
    pub fn relative_cache_path(&self) -> PathBuf {
        let mut path = self.source_path.clone();
        // Avoid collisions between identical relative paths under different
        // recipes by keying the directory on the recipe fingerprint.
        let mut components: Vec<_> = path
            .components()
            .map(|c| c.as_os_str().to_string_lossy().into_owned())
            .collect();
        if let Some(last) = components.last_mut() {
            *last = format!(
                "{}.{}",
                Path::new(last).file_stem().map(|s| s.to_string_lossy().into_owned()).unwrap_or_else(|| last.clone()),
                self.recipe.format.extension()
            );
        }
        path = components.into_iter().collect();
        PathBuf::from(self.recipe.fingerprint()).join(path)
    }
}

/// String form of a `CacheKey`, used as the `dashmap`/`HashMap` key in the
/// registry (the map is keyed by a plain hashable value rather than the
/// richer `CacheKey` struct, mirroring `ferrex_server::transcoding::queue`'s
/// `HashMap<String, TranscodingJob>`).
pub fn key_id(key: &CacheKey) -> String {
    format!("{}::{}", key.source_path.display(), key.recipe.fingerprint())
}
