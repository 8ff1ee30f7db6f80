//! Codec plugin boundary.
//!
//! A codec plugs into a session through [`EncoderPlugin`] or
//! [`DecoderPlugin`]. The session hands each frame to the plugin together
//! with a [`FrameId`]; the plugin reports the outcome through the
//! [`FrameEmitter`] it received at start, either before the per-frame entry
//! point returns (synchronous completion) or later from any thread
//! (asynchronous completion).

use std::sync::Arc;

use crate::buffer::ImageBuffer;
use crate::codec::CodecInfo;
use crate::error::{CodingError, CodingResult};
use crate::flags::{DecodeFlags, PassFlags};
use crate::format::{BufferAttributes, FormatDescription, FormatRequest, ImageFormat};
use crate::pool::PixelBufferPool;
use crate::property::{PropertyKey, PropertySpec, PropertyValue};
use crate::sample::{EncodedSample, FrameProperties};
use crate::storage::MultiPassStore;
use crate::time::{MediaTime, TimeRange};
use crate::types::FrameId;

/// Completion path from a codec back to its session.
///
/// Must be called exactly once per frame, in decode order.
/// `Ok(None)` reports the frame as dropped.
pub trait FrameEmitter<T>: Send + Sync {
    fn emit(&self, frame: FrameId, result: CodingResult<Option<T>>);
}

pub type Emitter<T> = Arc<dyn FrameEmitter<T>>;

/// An uncompressed frame handed to an encoder.
#[derive(Clone, Debug)]
pub struct SourceFrame {
    pub id: FrameId,
    pub image: ImageBuffer,
    pub pts: MediaTime,
    pub duration: Option<MediaTime>,
    pub properties: FrameProperties,
}

/// A compressed frame handed to a decoder.
#[derive(Clone, Debug)]
pub struct CompressedFrame {
    pub id: FrameId,
    pub sample: EncodedSample,
    pub flags: DecodeFlags,
}

/// Video encoder plugin.
pub trait EncoderPlugin: Send {
    fn info(&self) -> CodecInfo;

    // -- Setup --

    /// Report the input buffer attributes supported for `request`.
    fn negotiate(&mut self, request: &FormatRequest) -> CodingResult<BufferAttributes>;

    fn property_specs(&self) -> Vec<PropertySpec>;

    /// Apply a validated property value; `None` restores the default.
    fn apply_property(&mut self, key: PropertyKey, value: Option<&PropertyValue>)
        -> CodingResult<()>;

    /// Start encoding images of `format`. Called once, before any frame.
    fn start(&mut self, format: &ImageFormat, emitter: Emitter<EncodedSample>)
        -> CodingResult<()>;

    fn prepare(&mut self) -> CodingResult<()> {
        Ok(())
    }

    // -- Per frame --

    fn encode_frame(&mut self, frame: SourceFrame) -> CodingResult<()>;

    /// Emit every frame with a presentation time up to `until` (all when
    /// `None`) before returning.
    fn complete_frames(&mut self, until: Option<MediaTime>) -> CodingResult<()>;

    /// Stop accepting work. Frames already accepted may still be emitted.
    fn invalidate(&mut self);

    /// Description of the stream produced so far.
    fn format_description(&self) -> Option<FormatDescription>;

    // -- Multi-pass --

    fn supports_multi_pass(&self) -> bool {
        false
    }

    fn begin_pass(
        &mut self,
        _flags: PassFlags,
        _storage: Arc<dyn MultiPassStore>,
    ) -> CodingResult<()> {
        Err(CodingError::InvalidParameter(format!(
            "{} does not support multi-pass encoding",
            self.info().name
        )))
    }

    /// Finish the current pass. Returns whether another pass is wanted.
    fn end_pass(&mut self) -> CodingResult<bool> {
        Ok(false)
    }

    fn time_ranges_for_next_pass(&self) -> Vec<TimeRange> {
        Vec::new()
    }
}

/// Video decoder plugin.
pub trait DecoderPlugin: Send {
    fn info(&self) -> CodecInfo;

    /// Report the output buffer attributes for a stream.
    fn negotiate(&mut self, description: &FormatDescription) -> CodingResult<BufferAttributes>;

    fn property_specs(&self) -> Vec<PropertySpec>;

    fn apply_property(&mut self, key: PropertyKey, value: Option<&PropertyValue>)
        -> CodingResult<()>;

    /// Start decoding into buffers taken from `output`.
    fn start(
        &mut self,
        description: &FormatDescription,
        output: PixelBufferPool,
        emitter: Emitter<ImageBuffer>,
    ) -> CodingResult<()>;

    fn decode_frame(&mut self, frame: CompressedFrame) -> CodingResult<()>;

    /// Whether a change to `description` can be absorbed without restarting.
    fn can_accept_format(&self, description: &FormatDescription) -> bool;

    fn accept_format(&mut self, description: &FormatDescription) -> CodingResult<()>;

    fn complete_frames(&mut self, until: Option<MediaTime>) -> CodingResult<()>;

    fn invalidate(&mut self);
}
