//! `vcs-codecs`: Built-in software codecs.
//!
//! Provides the run-length "Animation" codec (fourcc `rle `), a lossless
//! (or lightly quantized) intra/delta codec that needs no hardware. Sessions
//! use it as the default plugin for [`VideoCodec::Animation`], and its
//! option knobs (worker-thread completion, drop pattern, per-frame delay)
//! make it the test double for session behaviour.
//!
//! - [`rle`] -- PackBits-style byte run-length coding
//! - [`payload`] -- per-frame header framing and [`inspect_payload`]
//! - [`encoder`] -- [`AnimationEncoder`] with multi-pass rate control
//! - [`decoder`] -- [`AnimationDecoder`]

pub mod decoder;
pub mod encoder;
pub mod payload;
pub mod rle;
mod worker;

use vcs_common::{CodecInfo, VideoCodec};

pub use decoder::{AnimationDecoder, DecoderOptions};
pub use encoder::{AnimationEncoder, EncoderOptions, FrameStats};
pub use payload::{inspect_payload, PayloadHeader};

/// Registry identifier of the built-in Animation codec.
pub const ANIMATION_CODEC_ID: &str = "vcs.software.animation";

/// Descriptor of the built-in Animation codec.
pub fn animation_info() -> CodecInfo {
    CodecInfo {
        id: ANIMATION_CODEC_ID.to_string(),
        name: "Animation".to_string(),
        codec: VideoCodec::Animation,
        hardware_accelerated: false,
    }
}
