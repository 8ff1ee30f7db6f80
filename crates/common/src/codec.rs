//! Video codec identifiers, codec descriptors and selection criteria.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Video codec identifier.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum VideoCodec {
    H264,
    Hevc,
    ProRes422,
    Av1,
    /// Run-length coded "Animation" codec.
    Animation,
}

impl VideoCodec {
    pub fn display_name(self) -> &'static str {
        match self {
            Self::H264 => "H.264/AVC",
            Self::Hevc => "H.265/HEVC",
            Self::ProRes422 => "Apple ProRes 422",
            Self::Av1 => "AV1",
            Self::Animation => "Animation (RLE)",
        }
    }

    /// Four-character code as stored in sample descriptions.
    pub fn fourcc(self) -> [u8; 4] {
        match self {
            Self::H264 => *b"avc1",
            Self::Hevc => *b"hvc1",
            Self::ProRes422 => *b"apcn",
            Self::Av1 => *b"av01",
            Self::Animation => *b"rle ",
        }
    }

    pub fn from_fourcc(code: [u8; 4]) -> Option<Self> {
        [
            Self::H264,
            Self::Hevc,
            Self::ProRes422,
            Self::Av1,
            Self::Animation,
        ]
        .into_iter()
        .find(|c| c.fourcc() == code)
    }
}

impl fmt::Display for VideoCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.display_name())
    }
}

/// Describes one codec implementation available to sessions.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecInfo {
    /// Unique reverse-DNS style identifier, e.g. `"vcs.software.animation"`.
    pub id: String,
    /// Human-readable name.
    pub name: String,
    pub codec: VideoCodec,
    pub hardware_accelerated: bool,
}

/// Criteria used to pick a codec implementation when creating a session.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CodecSelector {
    pub codec: VideoCodec,
    /// Restrict the search to one implementation.
    pub codec_id: Option<String>,
    /// Only accept hardware-accelerated implementations.
    pub require_hardware: bool,
}

impl CodecSelector {
    pub fn new(codec: VideoCodec) -> Self {
        Self {
            codec,
            codec_id: None,
            require_hardware: false,
        }
    }

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.codec_id = Some(id.into());
        self
    }

    pub fn hardware_only(mut self) -> Self {
        self.require_hardware = true;
        self
    }

    pub fn matches(&self, info: &CodecInfo) -> bool {
        info.codec == self.codec
            && self.codec_id.as_deref().map_or(true, |id| id == info.id)
            && (!self.require_hardware || info.hardware_accelerated)
    }
}

impl fmt::Display for CodecSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.codec)?;
        if let Some(id) = &self.codec_id {
            write!(f, " [{id}]")?;
        }
        if self.require_hardware {
            f.write_str(" (hardware)")?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn software() -> CodecInfo {
        CodecInfo {
            id: "vcs.software.animation".into(),
            name: "Animation".into(),
            codec: VideoCodec::Animation,
            hardware_accelerated: false,
        }
    }

    #[test]
    fn codec_display() {
        assert_eq!(VideoCodec::H264.display_name(), "H.264/AVC");
        assert_eq!(VideoCodec::Animation.to_string(), "Animation (RLE)");
    }

    #[test]
    fn fourcc_roundtrip() {
        assert_eq!(VideoCodec::from_fourcc(*b"rle "), Some(VideoCodec::Animation));
        assert_eq!(VideoCodec::from_fourcc(*b"xxxx"), None);
    }

    #[test]
    fn selector_matching() {
        let info = software();
        assert!(CodecSelector::new(VideoCodec::Animation).matches(&info));
        assert!(!CodecSelector::new(VideoCodec::H264).matches(&info));
        assert!(!CodecSelector::new(VideoCodec::Animation)
            .hardware_only()
            .matches(&info));
        assert!(CodecSelector::new(VideoCodec::Animation)
            .with_id("vcs.software.animation")
            .matches(&info));
        assert!(!CodecSelector::new(VideoCodec::Animation)
            .with_id("other")
            .matches(&info));
    }
}
