//! Storage budget for the recording directory.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use anyhow::{Context, Result};

/// Extension of every clip the recorder writes.
pub const CLIP_EXTENSION: &str = "avi";

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ClipInfo {
    pub path: PathBuf,
    pub size: u64,
    pub modified: SystemTime,
}

#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct EvictionReport {
    pub deleted: Vec<PathBuf>,
    pub freed_bytes: u64,
    pub remaining_bytes: u64,
}

/// Clips in `dir`, oldest modification time first.
///
/// Only regular files with the clip extension count; anything else in the
/// directory is ignored.
pub fn list_clips(dir: &Path) -> Result<Vec<ClipInfo>> {
    let mut clips = Vec::new();
    for entry in fs::read_dir(dir).with_context(|| format!("read {}", dir.display()))? {
        let entry = entry?;
        let path = entry.path();
        let is_clip = path
            .extension()
            .and_then(|ext| ext.to_str())
            .is_some_and(|ext| ext.eq_ignore_ascii_case(CLIP_EXTENSION));
        if !is_clip {
            continue;
        }
        let meta = entry.metadata()?;
        if !meta.is_file() {
            continue;
        }
        clips.push(ClipInfo {
            path,
            size: meta.len(),
            modified: meta.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }
    clips.sort_by(|a, b| a.modified.cmp(&b.modified).then_with(|| a.path.cmp(&b.path)));
    Ok(clips)
}

/// Delete the oldest clips until the total size is within `max_bytes`.
///
/// Must only run while no clip is open. A clip that cannot be deleted is
/// logged and skipped.
pub fn enforce_storage_budget(dir: &Path, max_bytes: u64) -> Result<EvictionReport> {
    let clips = list_clips(dir)?;
    let mut total: u64 = clips.iter().map(|c| c.size).sum();
    let mut report = EvictionReport::default();

    for clip in clips {
        if total <= max_bytes {
            break;
        }
        match fs::remove_file(&clip.path) {
            Ok(()) => {
                log::info!(
                    "evicted clip {} ({} bytes) to stay under {} bytes",
                    clip.path.display(),
                    clip.size,
                    max_bytes
                );
                total -= clip.size;
                report.freed_bytes += clip.size;
                report.deleted.push(clip.path);
            }
            Err(e) => log::warn!("failed to evict clip {}: {}", clip.path.display(), e),
        }
    }
    report.remaining_bytes = total;
    Ok(report)
}
