//! `vcs-common`: Shared types, traits, and errors for the video coding session runtime.
//!
//! This crate is the foundation that all other runtime crates depend on.
//! It defines the core abstractions:
//!
//! - **Time**: `MediaTime`, `TimeRange` (exact rational timestamps)
//! - **Buffers**: `ImageBuffer`, `PixelBufferPool`, `ImageFormat` and codec negotiation
//! - **Samples**: `EncodedSample`, `FrameProperties`
//! - **Properties**: `PropertyKey`, `PropertySpec`, `PropertyStore`
//! - **Codec traits**: `EncoderPlugin`, `DecoderPlugin`, `FrameEmitter`
//! - **Results**: `CompletionSink`, `FrameResult`, `InfoFlags`
//! - **Multi-pass**: `MultiPassStore` (implemented by `vcs-multipass`)
//! - **Errors**: `CodingError`, `Status`, `ErrorClass` (thiserror-based)
//! - **Config**: `RuntimeConfig`, `SessionConfig`, `MultiPassConfig`

pub mod buffer;
pub mod codec;
pub mod codec_traits;
pub mod color;
pub mod config;
pub mod error;
pub mod flags;
pub mod format;
pub mod pool;
pub mod property;
pub mod sample;
pub mod sink;
pub mod storage;
pub mod time;
pub mod types;

// Re-export commonly used items at crate root
pub use buffer::ImageBuffer;
pub use codec::{CodecInfo, CodecSelector, VideoCodec};
pub use codec_traits::{
    CompressedFrame, DecoderPlugin, Emitter, EncoderPlugin, FrameEmitter, SourceFrame,
};
pub use color::PixelFormat;
pub use config::{MultiPassConfig, RuntimeConfig, SessionConfig};
pub use error::{CodingError, CodingResult, ErrorClass, Status};
pub use flags::{DecodeFlags, InfoFlags, PassFlags};
pub use format::{BufferAttributes, Compatibility, FormatDescription, FormatRequest, ImageFormat};
pub use pool::{PixelBufferPool, PoolStats};
pub use property::{
    Access, Constraint, PropertyKey, PropertyMap, PropertySpec, PropertyStore, PropertyValue,
    ValueType,
};
pub use sample::{EncodedSample, FrameProperties};
pub use sink::{ChannelSink, CompletionSink, FrameResult, FrameStatus};
pub use storage::MultiPassStore;
pub use time::{ranges_contain, validate_time_ranges, MediaTime, TimeRange};
pub use types::{FrameId, FrameToken, Resolution};
