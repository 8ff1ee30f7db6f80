//! Runtime configuration for sessions and multi-pass storage.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::CodingResult;

/// Session-level settings that are not codec properties.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Give up on `complete_outstanding_work` after this long (no limit when unset).
    pub drain_timeout_ms: Option<u64>,
    /// Idle buffers kept by each pixel buffer pool.
    pub pool_max_idle: usize,
}

impl SessionConfig {
    pub fn drain_timeout(&self) -> Option<Duration> {
        self.drain_timeout_ms.map(Duration::from_millis)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            drain_timeout_ms: None,
            pool_max_idle: 8,
        }
    }
}

/// Where multi-pass storage and frame silos keep their files.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MultiPassConfig {
    /// Parent directory for temporary backing locations (system temp when unset).
    pub backing_dir: Option<PathBuf>,
    /// Keep temporary backing files after release, for debugging.
    pub keep_backing_files: bool,
}

/// Top-level configuration.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RuntimeConfig {
    pub session: SessionConfig,
    pub multipass: MultiPassConfig,
}

impl RuntimeConfig {
    pub fn from_json_file(path: &Path) -> CodingResult<Self> {
        let text = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&text)?)
    }
}
