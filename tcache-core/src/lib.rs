pub mod buffer;
pub mod config;
pub mod entry;
pub mod error;
pub mod eviction;
pub mod key;
pub mod leader;
pub mod persistence;
pub mod reader;
pub mod registry;
pub mod transcoder;

pub use buffer::GrowableBuffer;
pub use config::CoreConfig;
pub use entry::{CacheEntry, EntryHandle, Lifecycle};
pub use error::{CacheError, Result};
pub use eviction::{DiskPressure, EvictionCandidate, EvictionDecision, EvictionReason};
pub use key::{CacheKey, GainMode, TargetFormat, TargetRecipe};
pub use leader::MaintenanceLeader;
pub use reader::{ReadOutcome, ReaderCoordinator};
pub use registry::{probe_disk_pressure, Cache, TranscoderFactory};
pub use transcoder::{StepOutcome, Transcoder};
