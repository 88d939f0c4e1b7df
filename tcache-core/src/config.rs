//! `CoreConfig`: the subset of configuration the cache core itself reads
//! (SPEC_FULL.md §6 table). Everything else — FUSE mount options, CLI
//! subcommands, log level — belongs to `tcache-fs`.
//!
//! `Default` + `from_env` mirrors `ferrex_server::infra::config::Config::from_env`'s
//! `env::var(...).ok().and_then(|s| s.parse().ok()).unwrap_or(default)` idiom.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Configuration recognized by `tcache-core` (SPEC_FULL.md §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    /// Directory under which artifacts and info sidecars live.
    pub cache_root: PathBuf,
    /// Byte ceiling triggering LRU eviction; 0 = unlimited.
    pub max_cache_size: u64,
    /// Free-space floor on the cache volume.
    pub min_diskspace: u64,
    /// Wall-clock age at which an entry is unconditionally evicted.
    #[serde(with = "duration_secs")]
    pub expiry_age: Duration,
    /// Idle time before a producer suspends.
    #[serde(with = "duration_secs")]
    pub suspend_threshold: Duration,
    /// Idle time before a suspended producer is aborted.
    #[serde(with = "duration_secs")]
    pub abort_threshold: Duration,
    /// Cap on concurrent producer tasks; 0 = unlimited.
    pub max_producers: usize,
    /// If true, entries are always deleted on last close.
    pub disable_cache: bool,
}

impl Default for CoreConfig {
    fn default() -> Self {
        Self {
            cache_root: PathBuf::from("./cache"),
            max_cache_size: 0,
            min_diskspace: 0,
            expiry_age: Duration::from_secs(7 * 24 * 3600),
            suspend_threshold: Duration::from_secs(60),
            abort_threshold: Duration::from_secs(300),
            max_producers: 0,
            disable_cache: false,
        }
    }
}

impl CoreConfig {
    /// Load from `TCACHE_*`-prefixed environment variables, falling back to
    /// [`Default`] for anything unset or unparsable, after an initial
    /// `dotenvy::dotenv().ok()` (performed by the caller in `tcache-fs`, not
    /// here, so this crate never touches `.env` discovery on its own).
    pub fn from_env() -> Self {
        let default = Self::default();
        Self {
            cache_root: std::env::var("TCACHE_CACHE_ROOT")
                .ok()
                .map(PathBuf::from)
                .unwrap_or(default.cache_root),
            max_cache_size: env_parsed("TCACHE_MAX_CACHE_SIZE", default.max_cache_size),
            min_diskspace: env_parsed("TCACHE_MIN_DISKSPACE", default.min_diskspace),
            expiry_age: env_duration("TCACHE_EXPIRY_AGE", default.expiry_age),
            suspend_threshold: env_duration("TCACHE_SUSPEND_THRESHOLD", default.suspend_threshold),
            abort_threshold: env_duration("TCACHE_ABORT_THRESHOLD", default.abort_threshold),
            max_producers: env_parsed("TCACHE_MAX_PRODUCERS", default.max_producers),
            disable_cache: env_parsed("TCACHE_DISABLE_CACHE", default.disable_cache),
        }
    }

    /// Deterministic mount identifier derived from the canonicalized cache
    /// root, used both as a persisted-state path component (SPEC_FULL.md
    /// §6) and as the inter-process lock/pid-sidecar key (§4.7).
    pub fn mount_id(&self) -> String {
        let canonical = std::fs::canonicalize(&self.cache_root)
            .unwrap_or_else(|_| self.cache_root.clone());
        let digest = fnv1a(canonical.to_string_lossy().as_bytes());
        format!("{digest:016x}")
    }
}

fn env_parsed<T: std::str::FromStr>(key: &str, default: T) -> T {
    std::env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_duration(key: &str, default: Duration) -> Duration {
    std::env::var(key)
        .ok()
        .and_then(|s| humantime::parse_duration(&s).ok())
        .unwrap_or(default)
}

/// Serializes a `Duration` as whole seconds; the info sidecar and wire
/// formats elsewhere in the crate use fixed binary layouts, but this config
/// struct rides the same `serde_json` stack as the rest of the ambient
/// configuration surface, so durations need an explicit (de)serializer.
mod duration_secs {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        Ok(Duration::from_secs(u64::deserialize(d)?))
    }
}

/// Tiny dependency-free FNV-1a hash, used only to derive a stable
/// human-readable mount id; not a security boundary.
fn fnv1a(bytes: &[u8]) -> u64 {
    let mut hash: u64 = 0xcbf29ce484222325;
    for &b in bytes {
        hash ^= b as u64;
        hash = hash.wrapping_mul(0x100000001b3);
    }
    hash
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = CoreConfig::default();
        assert_eq!(cfg.max_cache_size, 0);
        assert!(!cfg.disable_cache);
    }

    #[test]
    fn mount_id_is_stable_for_same_root() {
        let cfg = CoreConfig {
            cache_root: PathBuf::from("/tmp/does-not-exist-tcache-test"),
            ..CoreConfig::default()
        };
        assert_eq!(cfg.mount_id(), cfg.mount_id());
    }
}
