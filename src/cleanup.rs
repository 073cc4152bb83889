use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

/// Files older than this are deleted by the periodic sweep.
const SWEEP_THRESHOLD: Duration = Duration::from_secs(10 * 60);

const IMAGE_EXTS: [&str; 8] = ["jpg", "jpeg", "png", "bmp", "gif", "webp", "tif", "tiff"];

/// Registry of local image directories that need periodic cleanup.
///
/// Uploads and the OCR stage register every directory they touch; the main
/// task sweeps the registry every 30 seconds so images that never made it
/// through an upload do not accumulate on the edge box.
#[derive(Clone)]
pub struct Cleanup {
    dirs: Arc<Mutex<BTreeSet<PathBuf>>>,
}

impl Cleanup {
    pub fn new() -> Cleanup {
        Cleanup {
            dirs: Arc::new(Mutex::new(BTreeSet::new())),
        }
    }

    /// Registers the parent directory of `file_path` for sweeping.
    pub fn register_path(&self, file_path: &Path) {
        let Some(parent) = file_path.parent() else {
            return;
        };
        if !parent.is_dir() {
            return;
        }
        if let Ok(mut dirs) = self.dirs.lock() {
            dirs.insert(parent.to_path_buf());
        }
    }

    /// Deletes one image file now. Returns whether a file was removed.
    pub fn remove_image(&self, file_path: &Path) -> bool {
        self.register_path(file_path);
        if !file_path.exists() {
            tracing::debug!(image = %file_path.display(), "image already gone");
            return false;
        }
        match std::fs::remove_file(file_path) {
            Ok(()) => {
                tracing::debug!(image = %file_path.display(), "image removed");
                true
            }
            Err(err) => {
                tracing::warn!(image = %file_path.display(), error = %err, "image removal failed");
                false
            }
        }
    }

    /// Sweeps every registered directory, deleting image files whose mtime is
    /// older than the threshold.
    pub fn sweep(&self) {
        let dirs: Vec<PathBuf> = match self.dirs.lock() {
            Ok(dirs) => dirs.iter().cloned().collect(),
            Err(_) => return,
        };
        if dirs.is_empty() {
            return;
        }

        let cutoff = SystemTime::now()
            .checked_sub(SWEEP_THRESHOLD)
            .unwrap_or(SystemTime::UNIX_EPOCH);
        let mut checked = 0usize;
        let mut deleted = 0usize;

        for dir in &dirs {
            let entries = match std::fs::read_dir(dir) {
                Ok(entries) => entries,
                Err(_) => continue,
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if !path.is_file() || !is_image(&path) {
                    continue;
                }
                checked += 1;
                let old_enough = entry
                    .metadata()
                    .and_then(|m| m.modified())
                    .map(|mtime| mtime < cutoff)
                    .unwrap_or(false);
                if old_enough && self.remove_image(&path) {
                    deleted += 1;
                }
            }
        }

        if checked > 0 || deleted > 0 {
            tracing::info!(dirs = dirs.len(), checked, deleted, "image sweep complete");
        }
    }
}

impl Default for Cleanup {
    fn default() -> Self {
        Cleanup::new()
    }
}

fn is_image(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .map(|ext| IMAGE_EXTS.contains(&ext.to_ascii_lowercase().as_str()))
        .unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remove_image_deletes_and_registers() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("77_a.jpg");
        std::fs::write(&file, b"jpeg").unwrap();

        let cleanup = Cleanup::new();
        assert!(cleanup.remove_image(&file));
        assert!(!file.exists());
        assert!(!cleanup.remove_image(&file));
    }

    #[test]
    fn sweep_keeps_fresh_files() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("fresh.jpg");
        std::fs::write(&file, b"jpeg").unwrap();

        let cleanup = Cleanup::new();
        cleanup.register_path(&file);
        cleanup.sweep();
        assert!(file.exists());
    }

    #[test]
    fn non_images_are_ignored() {
        assert!(is_image(Path::new("/tmp/a.JPG")));
        assert!(!is_image(Path::new("/tmp/a.txt")));
        assert!(!is_image(Path::new("/tmp/noext")));
    }
}
