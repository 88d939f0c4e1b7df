//! `(source extension, target recipe) -> Transcoder` resolution.
//!
//! Grounded on SPEC_FULL.md §9's factory design note: the core never
//! distinguishes codecs, so this is the one place that maps a source
//! extension plus a `TargetRecipe` onto a concrete `ffmpeg`-argument profile.
//! The profile names (`FlacToMp3`/`VorbisToMp3`/`ContainerToContainer`) exist
//! only as a classification used for the `UnsupportedCodec` check and for
//! diagnostics; all three share the single `FfmpegTranscoder` implementation,
//! the way `ferrex_server::stream::transcoding::worker::build_ffmpeg_command`
//! branches on format rather than maintaining one struct per codec pair.

use tcache_core::error::{CacheError, Result};
use tcache_core::key::{CacheKey, TargetFormat};
use tcache_core::registry::TranscoderFactory;
use tcache_core::transcoder::Transcoder;

use crate::codec::ffmpeg::FfmpegTranscoder;

/// Classification of a `(source extension, target format)` pair, used only
/// for the up-front `UnsupportedCodec` check; the encode itself is always
/// driven by the single `FfmpegTranscoder`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CodecProfile {
    FlacToMp3,
    VorbisToMp3,
    ContainerToContainer,
}

fn classify(source_ext: &str, target: TargetFormat) -> Option<CodecProfile> {
    let ext = source_ext.to_ascii_lowercase();
    match (ext.as_str(), target) {
        ("flac", TargetFormat::Mp3) => Some(CodecProfile::FlacToMp3),
        ("ogg" | "oga", TargetFormat::Mp3) => Some(CodecProfile::VorbisToMp3),
        ("mp4" | "mkv" | "mov" | "avi" | "webm" | "m4v" | "flac" | "ogg" | "oga" | "wav", TargetFormat::Mp4) => {
            Some(CodecProfile::ContainerToContainer)
        }
        _ => None,
    }
}

/// Builds `FfmpegTranscoder`s for every recipe this deployment supports.
/// Holds the resolved `ffmpeg`/`ffprobe` binary paths so every spawned
/// transcoder shares the same configured binaries.
#[derive(Debug, Clone)]
pub struct FfmpegTranscoderFactory {
    ffmpeg_path: String,
    ffprobe_path: String,
}

impl FfmpegTranscoderFactory {
    pub fn new(ffmpeg_path: impl Into<String>, ffprobe_path: impl Into<String>) -> Self {
        Self {
            ffmpeg_path: ffmpeg_path.into(),
            ffprobe_path: ffprobe_path.into(),
        }
    }
}

impl TranscoderFactory for FfmpegTranscoderFactory {
    fn build(&self, key: &CacheKey) -> Result<Box<dyn Transcoder>> {
        let source_ext = key
            .source_path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        let profile = classify(source_ext, key.recipe.format).ok_or_else(|| {
            CacheError::UnsupportedCodec(format!(
                "no transcoder for .{source_ext} -> {:?}",
                key.recipe.format
            ))
        })?;

        tracing::debug!(?profile, source_ext, recipe = ?key.recipe, "resolved transcoder profile");
        Ok(Box::new(FfmpegTranscoder::new(
            self.ffmpeg_path.clone(),
            self.ffprobe_path.clone(),
            key.recipe.clone(),
        )))
    }
}
