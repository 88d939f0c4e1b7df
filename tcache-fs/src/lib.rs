//! Reference binary-crate surface for the on-demand transcoding cache:
//! the ffmpeg-subprocess `Transcoder` implementations and their factory, and
//! the non-FUSE `VirtualView` adapter that exercises `tcache-core` exactly
//! as a real file-system binding would (SPEC_FULL.md §10.5).

pub mod adapter;
pub mod codec;

pub use adapter::VirtualView;
pub use codec::factory::FfmpegTranscoderFactory;
