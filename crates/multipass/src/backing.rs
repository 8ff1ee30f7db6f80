//! Backing locations for durable multi-pass data.
//!
//! An explicit location is created if needed and never removed. Without
//! one, a fresh temporary directory is used and deleted when the owning
//! object is released, unless `keep_backing_files` is set.

use std::path::{Path, PathBuf};

use tempfile::TempDir;
use tracing::{debug, info};
use vcs_common::{CodingResult, MultiPassConfig};

#[derive(Debug)]
enum Location {
    Explicit(PathBuf),
    Temporary(TempDir),
}

/// Directory holding an object's backing files.
#[derive(Debug)]
pub struct Backing {
    location: Location,
    keep: bool,
}

impl Backing {
    pub fn create(location: Option<&Path>, config: &MultiPassConfig, prefix: &str) -> CodingResult<Self> {
        let backing = match location {
            Some(path) => {
                std::fs::create_dir_all(path)?;
                Self {
                    location: Location::Explicit(path.to_path_buf()),
                    keep: true,
                }
            }
            None => {
                let parent = config
                    .backing_dir
                    .clone()
                    .unwrap_or_else(std::env::temp_dir);
                std::fs::create_dir_all(&parent)?;
                let dir = tempfile::Builder::new()
                    .prefix(prefix)
                    .keep(config.keep_backing_files)
                    .tempdir_in(&parent)?;
                Self {
                    location: Location::Temporary(dir),
                    keep: config.keep_backing_files,
                }
            }
        };
        info!(
            path = %backing.path().display(),
            temporary = !backing.keep,
            "Backing location ready"
        );
        Ok(backing)
    }

    pub fn path(&self) -> &Path {
        match &self.location {
            Location::Explicit(path) => path,
            Location::Temporary(dir) => dir.path(),
        }
    }

    /// Whether the directory is deleted when this value is dropped.
    pub fn is_temporary(&self) -> bool {
        !self.keep
    }
}

impl Drop for Backing {
    fn drop(&mut self) {
        if self.is_temporary() {
            debug!(path = %self.path().display(), "Removing temporary backing location");
        }
    }
}
