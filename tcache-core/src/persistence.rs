//! Info-sidecar binary read/write: the fixed-layout record described in
//! SPEC_FULL.md §6, used to persist `CacheEntry` metadata across process
//! restarts.
//!
//! Grounded on the §6 binary layout directly. Unlike the rest of the
//! crate's configuration/diagnostics, which ride the teacher's `serde`
//! stack, the spec mandates a raw native-byte-order fixed record here, so
//! this module reads/writes plain `std::io` with no serde involvement.

use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use crate::error::Result;

/// On-disk sidecar record: `encoded_size: u64`, `finished: u8`, `error: u8`,
/// `created_at: i64`, `accessed_at: i64`, `source_mtime: i64`, then the
/// fixed-length `trailing_tag` blob, all in native byte order.
#[derive(Debug, Clone, PartialEq)]
pub struct InfoRecord {
    pub encoded_size: u64,
    pub finished: bool,
    pub error: bool,
    pub created_at: SystemTime,
    pub accessed_at: SystemTime,
    pub source_mtime: SystemTime,
    pub trailing_tag: Vec<u8>,
}

const HEADER_LEN: usize = 8 + 1 + 1 + 8 + 8 + 8;

impl InfoRecord {
    pub fn write_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut buf = Vec::with_capacity(HEADER_LEN + self.trailing_tag.len());
        buf.extend_from_slice(&self.encoded_size.to_ne_bytes());
        buf.push(self.finished as u8);
        buf.push(self.error as u8);
        buf.extend_from_slice(&to_epoch_secs(self.created_at).to_ne_bytes());
        buf.extend_from_slice(&to_epoch_secs(self.accessed_at).to_ne_bytes());
        buf.extend_from_slice(&to_epoch_secs(self.source_mtime).to_ne_bytes());
        buf.extend_from_slice(&self.trailing_tag);

        let tmp = path.with_extension("info.tmp");
        {
            let mut f = std::fs::File::create(&tmp)?;
            f.write_all(&buf)?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, path)?;
        Ok(())
    }

    pub fn read_from(path: &Path) -> Result<Self> {
        let mut f = std::fs::File::open(path)?;
        let mut buf = Vec::new();
        f.read_to_end(&mut buf)?;
        if buf.len() < HEADER_LEN {
            return Err(crate::error::CacheError::Io(std::io::Error::other(
                "info sidecar truncated",
            )));
        }
        let mut off = 0;
        let encoded_size = read_u64(&buf, &mut off);
        let finished = buf[off] != 0;
        off += 1;
        let error = buf[off] != 0;
        off += 1;
        let created_at = from_epoch_secs(read_i64(&buf, &mut off));
        let accessed_at = from_epoch_secs(read_i64(&buf, &mut off));
        let source_mtime = from_epoch_secs(read_i64(&buf, &mut off));
        let trailing_tag = buf[off..].to_vec();

        Ok(Self {
            encoded_size,
            finished,
            error,
            created_at,
            accessed_at,
            source_mtime,
            trailing_tag,
        })
    }
}

fn read_u64(buf: &[u8], off: &mut usize) -> u64 {
    let v = u64::from_ne_bytes(buf[*off..*off + 8].try_into().unwrap());
    *off += 8;
    v
}

fn read_i64(buf: &[u8], off: &mut usize) -> i64 {
    let v = i64::from_ne_bytes(buf[*off..*off + 8].try_into().unwrap());
    *off += 8;
    v
}

fn to_epoch_secs(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_secs() as i64,
        Err(e) => -(e.duration().as_secs() as i64),
    }
}

fn from_epoch_secs(secs: i64) -> SystemTime {
    if secs >= 0 {
        UNIX_EPOCH + Duration::from_secs(secs as u64)
    } else {
        UNIX_EPOCH - Duration::from_secs((-secs) as u64)
    }
}

/// Paths for a key's persisted artifact and sidecar, per SPEC_FULL.md §6:
/// `{cache_root}/{mount_id}/{relative_path}.{target_ext}[.info]`.
pub struct PersistedPaths {
    pub artifact: PathBuf,
    pub info: PathBuf,
}

pub fn persisted_paths(cache_root: &Path, mount_id: &str, relative: &Path) -> PersistedPaths {
    let artifact = cache_root.join(mount_id).join(relative);
    let info = {
        let mut p = artifact.clone().into_os_string();
        p.push(".info");
        PathBuf::from(p)
    };
    PersistedPaths { artifact, info }
}

/// Presence of one sidecar file without the other is corruption (SPEC_FULL.md
/// §6): both are deleted in that case. Returns `true` if a valid pair exists.
pub fn validate_pair(paths: &PersistedPaths) -> Result<bool> {
    let artifact_exists = paths.artifact.exists();
    let info_exists = paths.info.exists();
    match (artifact_exists, info_exists) {
        (true, true) => Ok(true),
        (false, false) => Ok(false),
        _ => {
            // Corruption: delete whichever half is present.
            if artifact_exists {
                std::fs::remove_file(&paths.artifact)?;
            }
            if info_exists {
                std::fs::remove_file(&paths.info)?;
            }
            Ok(false)
        }
    }
}
