//! Concrete codec glue: thin wrappers over the external `ffmpeg`/`ffprobe`
//! binaries, and the factory that resolves a `CacheKey` to one of them
//! (SPEC_FULL.md §9 design note, §10.5).

pub mod factory;
pub mod ffmpeg;
pub mod id3v1;
