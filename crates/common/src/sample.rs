//! Compressed samples and per-frame options.

use serde::{Deserialize, Serialize};

use crate::time::MediaTime;

/// One compressed frame as produced by an encoder or fed to a decoder.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct EncodedSample {
    pub data: Vec<u8>,
    /// Presentation timestamp.
    pub pts: MediaTime,
    /// Decode timestamp. Equal to `pts` unless the codec reorders.
    pub dts: MediaTime,
    pub duration: Option<MediaTime>,
    pub is_keyframe: bool,
}

impl EncodedSample {
    pub fn new(data: Vec<u8>, pts: MediaTime, is_keyframe: bool) -> Self {
        Self {
            data,
            pts,
            dts: pts,
            duration: None,
            is_keyframe,
        }
    }

    pub fn with_dts(mut self, dts: MediaTime) -> Self {
        self.dts = dts;
        self
    }

    pub fn with_duration(mut self, duration: MediaTime) -> Self {
        self.duration = Some(duration);
        self
    }

    pub fn size(&self) -> usize {
        self.data.len()
    }
}

/// Per-frame property overlay passed with `submit_frame`.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FrameProperties {
    /// Code this frame as a key frame regardless of the interval.
    pub force_key_frame: bool,
    /// Override the session quality for this frame only (0.0 to 1.0).
    pub quality: Option<f64>,
}
