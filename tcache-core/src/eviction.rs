//! Stale/expired/LRU pruning, per SPEC_FULL.md §4.6.
//!
//! The rule ordering (stale → expired → LRU-until-under-budget) and the
//! "skip anything still referenced" guard follow
//! `ferrex_server::transcoding::cache::CacheManager::cleanup` (age-first,
//! then size-triggered LRU) and `transcoding::segments::SegmentCache::evict_lru`
//! (sort-by-`last_accessed`, free until under budget).

use std::time::{Duration, SystemTime};

use crate::config::CoreConfig;

/// A prunable unit, decoupled from `CacheEntry`/`Arc` so the eviction
/// planner can be unit-tested without spinning up a whole registry.
#[derive(Debug, Clone, PartialEq)]
pub struct EvictionCandidate {
    pub id: String,
    pub on_disk_size: u64,
    pub created_at: SystemTime,
    pub accessed_at: SystemTime,
    pub ref_count: u64,
    /// `true` if the source file's current mtime no longer matches what was
    /// recorded at open time.
    pub stale: bool,
}

/// Why a candidate was selected for deletion; purely for logging/tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvictionReason {
    Stale,
    Expired,
    SizePressure,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EvictionDecision {
    pub id: String,
    pub reason: EvictionReason,
}

/// Free disk space on the cache volume, injected so the planner stays
/// testable; `tcache-fs` (or the registry) supplies the real value via
/// `fs2`-free `statvfs`-style probing at the call site.
pub struct DiskPressure {
    pub free_bytes: u64,
}

/// Evaluate every rule of SPEC_FULL.md §4.6 in order and return the set of
/// candidates to delete. Entries with `ref_count > 0` are never selected by
/// the LRU/size-pressure rule (rule 3), but stale/expired entries are
/// deleted unconditionally per the spec's rule ordering — ref-counting only
/// gates the LRU pass.
pub fn plan_eviction(
    candidates: &[EvictionCandidate],
    config: &CoreConfig,
    disk: &DiskPressure,
    now: SystemTime,
) -> Vec<EvictionDecision> {
    let mut decisions = Vec::new();
    let mut deleted: std::collections::HashSet<&str> = std::collections::HashSet::new();

    // Rule 1: stale entries.
    for c in candidates {
        if c.stale {
            decisions.push(EvictionDecision {
                id: c.id.clone(),
                reason: EvictionReason::Stale,
            });
            deleted.insert(&c.id);
        }
    }

    // Rule 2: expired entries (age against created_at).
    for c in candidates {
        if deleted.contains(c.id.as_str()) {
            continue;
        }
        let age = now.duration_since(c.created_at).unwrap_or(Duration::ZERO);
        if age > config.expiry_age {
            decisions.push(EvictionDecision {
                id: c.id.clone(),
                reason: EvictionReason::Expired,
            });
            deleted.insert(&c.id);
        }
    }

    // Rule 3: LRU-until-under-budget, skipping referenced entries.
    let mut remaining: Vec<&EvictionCandidate> = candidates
        .iter()
        .filter(|c| !deleted.contains(c.id.as_str()))
        .collect();
    remaining.sort_by_key(|c| c.accessed_at);

    let mut total_size: u64 = remaining.iter().map(|c| c.on_disk_size).sum();
    let mut free = disk.free_bytes;

    for c in remaining {
        let over_size_budget = config.max_cache_size > 0 && total_size > config.max_cache_size;
        let under_diskspace_floor = config.min_diskspace > 0 && free < config.min_diskspace;
        if !over_size_budget && !under_diskspace_floor {
            break;
        }
        if c.ref_count > 0 {
            continue;
        }
        decisions.push(EvictionDecision {
            id: c.id.clone(),
            reason: EvictionReason::SizePressure,
        });
        total_size = total_size.saturating_sub(c.on_disk_size);
        free = free.saturating_add(c.on_disk_size);
    }

    decisions
}
