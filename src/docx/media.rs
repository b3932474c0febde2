use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{info, warn};

pub const MEDIA_DIR: &str = "word/media";

#[derive(Clone, Debug, Default, Serialize)]
pub struct ImageReport {
    pub replaced: Vec<String>,
    pub skipped: Vec<String>,
}

/// Swap image payloads in `media_dir`, keeping each slot's file name.
///
/// Every failure is per-slot: a missing slot or an unreadable source is skipped with a
/// warning and the remaining slots are still processed.
pub fn replace_images(media_dir: &Path, replacements: &[(String, PathBuf)]) -> ImageReport {
    let mut report = ImageReport::default();
    if !media_dir.is_dir() {
        if !replacements.is_empty() {
            warn!(dir = %media_dir.display(), "template has no media folder; images left as-is");
        }
        return report;
    }
    for (slot, source) in replacements {
        match replace_one(media_dir, slot, source) {
            Ok(true) => {
                info!(slot = %slot, source = %source.display(), "replaced image");
                report.replaced.push(slot.clone());
            }
            Ok(false) => {
                warn!(slot = %slot, "image slot not found in template; skipped");
                report.skipped.push(slot.clone());
            }
            Err(e) => {
                warn!(
                    slot = %slot,
                    source = %source.display(),
                    error = %e,
                    "image replacement failed; skipped"
                );
                report.skipped.push(slot.clone());
            }
        }
    }
    report
}

fn replace_one(media_dir: &Path, slot: &str, source: &Path) -> std::io::Result<bool> {
    // Slot names are plain file names; anything with a path component is not a slot.
    if slot.is_empty() || slot.contains(['/', '\\']) || slot == ".." {
        return Ok(false);
    }
    let target = media_dir.join(slot);
    if !target.is_file() {
        return Ok(false);
    }
    let data = fs::read(source)?;
    fs::write(&target, data)?;
    Ok(true)
}
