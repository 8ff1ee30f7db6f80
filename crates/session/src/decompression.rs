//! Decompression session: encoded samples in, images out.
//!
//! Samples must be submitted with strictly increasing decode timestamps.
//! Results are delivered in decode order unless a frame is submitted with
//! [`DecodeFlags::ENABLE_TEMPORAL_PROCESSING`], in which case the session
//! holds up to `TemporalReorderDepth` decoded frames and releases them in
//! display order.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace};

use vcs_common::{
    CodecInfo, CodecSelector, CodingError, CodingResult, Compatibility, CompletionSink,
    CompressedFrame, Constraint, DecodeFlags, DecoderPlugin, EncodedSample, FormatDescription,
    FrameEmitter, FrameId, FrameToken, ImageBuffer, ImageFormat, InfoFlags, MediaTime,
    PixelBufferPool, PropertyKey, PropertyMap, PropertySpec, PropertyStore, PropertyValue,
    SessionConfig, ValueType,
};

use crate::lifecycle::{Outcome, SessionCore, SessionState, SessionStats};
use crate::registry::CodecRegistry;
use crate::reorder::ReorderBuffer;

/// Default number of frames held back for temporal processing.
pub const DEFAULT_REORDER_DEPTH: i64 = 4;

fn session_specs() -> Vec<PropertySpec> {
    vec![
        PropertySpec::read_only(PropertyKey::NumberOfPendingFrames, ValueType::Int)
            .with_default(0i64),
        PropertySpec::read_only(PropertyKey::PixelBufferPoolIsShared, ValueType::Bool),
        PropertySpec::read_only(PropertyKey::DecoderId, ValueType::Str),
        PropertySpec::read_write(PropertyKey::TemporalReorderDepth, ValueType::Int)
            .with_default(DEFAULT_REORDER_DEPTH)
            .with_constraint(Constraint::IntRange { min: 0, max: 16 }),
        PropertySpec::read_write(PropertyKey::OutputPoolMinimumBufferCount, ValueType::Int)
            .with_default(0i64)
            .with_constraint(Constraint::IntRange { min: 0, max: 64 }),
    ]
}

fn is_session_key(key: PropertyKey) -> bool {
    matches!(
        key,
        PropertyKey::NumberOfPendingFrames
            | PropertyKey::PixelBufferPoolIsShared
            | PropertyKey::DecoderId
            | PropertyKey::TemporalReorderDepth
            | PropertyKey::OutputPoolMinimumBufferCount
    )
}

// ---------------------------------------------------------------------------
// Output path
// ---------------------------------------------------------------------------

/// Emitter handed to the decoder: copies into the caller's pool when the
/// layouts differ, applies temporal reordering, then delivers.
struct DecodeOutput {
    core: Arc<SessionCore<ImageBuffer>>,
    /// Caller-facing pool when decoded images must be copied.
    copy_pool: Option<PixelBufferPool>,
    reorder: Mutex<ReorderBuffer<CodingResult<Option<ImageBuffer>>>>,
}

impl DecodeOutput {
    fn stage(&self, result: CodingResult<Option<ImageBuffer>>) -> CodingResult<Option<ImageBuffer>> {
        match (result, &self.copy_pool) {
            (Ok(Some(decoded)), Some(pool)) => {
                let mut out = pool.acquire()?;
                decoded.copy_to(&mut out)?;
                self.core.record_copy();
                trace!(from = decoded.id(), to = out.id(), "Copied decoded image into caller pool");
                Ok(Some(out))
            }
            (result, _) => result,
        }
    }

    fn deliver(&self, id: FrameId, result: CodingResult<Option<ImageBuffer>>) {
        let flags = match &result {
            Ok(Some(image)) if image.is_exclusive() => InfoFlags::BUFFER_MODIFIABLE,
            _ => InfoFlags::NONE,
        };
        self.core.deliver(id, Outcome::from(result), flags);
    }

    /// Forget the temporal mark of a frame the decoder rejected and deliver
    /// everything held, so the failure reported next is not overtaken.
    fn abandon(&self, id: FrameId) {
        let mut reorder = self.reorder.lock();
        reorder.take_mark(id);
        for (held_id, result) in reorder.release(None) {
            self.deliver(held_id, result);
        }
    }

    /// Deliver held frames up to `until` (all when `None`).
    fn release(&self, until: Option<MediaTime>) {
        let mut reorder = self.reorder.lock();
        for (id, result) in reorder.release(until) {
            self.deliver(id, result);
        }
    }
}

impl FrameEmitter<ImageBuffer> for DecodeOutput {
    fn emit(&self, frame: FrameId, result: CodingResult<Option<ImageBuffer>>) {
        let result = self.stage(result);
        let mut reorder = self.reorder.lock();
        if reorder.take_mark(frame) {
            if let Some(pts) = self.core.frame_pts(frame) {
                for (id, held) in reorder.push(pts, frame, result) {
                    self.deliver(id, held);
                }
                return;
            }
        }
        // Frames outside temporal processing must not overtake held ones.
        for (id, held) in reorder.release(None) {
            self.deliver(id, held);
        }
        self.deliver(frame, result);
    }
}

// ---------------------------------------------------------------------------
// DecompressionSession
// ---------------------------------------------------------------------------

/// A session decoding one compressed stream.
pub struct DecompressionSession {
    core: Arc<SessionCore<ImageBuffer>>,
    output: Arc<DecodeOutput>,
    codec: Mutex<Box<dyn DecoderPlugin>>,
    info: CodecInfo,
    properties: Mutex<PropertyStore>,
    description: Mutex<FormatDescription>,
    output_pool: PixelBufferPool,
}

impl DecompressionSession {
    /// Create a session decoding `description`.
    ///
    /// `output_format` is the image layout the caller wants; `None` takes
    /// the decoder's preferred layout. A layout the decoder cannot write
    /// directly is served through a second pool and one copy per frame.
    pub fn create(
        registry: &CodecRegistry,
        selector: &CodecSelector,
        description: &FormatDescription,
        output_format: Option<ImageFormat>,
        properties: PropertyMap,
        config: &SessionConfig,
        sink: impl CompletionSink<ImageBuffer> + 'static,
    ) -> CodingResult<Self> {
        if selector.codec != description.codec {
            return Err(CodingError::UnsupportedFormat(format!(
                "selector asks for {}, stream is {}",
                selector.codec, description.codec
            )));
        }
        let (info, mut codec) = registry.create_decoder(selector)?;

        let attributes = codec.negotiate(description)?;
        let preferred = attributes.preferred_format(description.pixel_format);
        let output_format = output_format.unwrap_or(preferred);
        let output_pool = PixelBufferPool::new(output_format, config.pool_max_idle)?;
        let (codec_pool, copy_pool) = match attributes.compatibility(&output_format) {
            Compatibility::Shared => (output_pool.clone(), None),
            Compatibility::CopyRequired => (
                PixelBufferPool::new(preferred, config.pool_max_idle)?,
                Some(output_pool.clone()),
            ),
            Compatibility::Unsupported => {
                return Err(CodingError::UnsupportedFormat(format!(
                    "{} cannot decode {description} into {output_format}",
                    info.name
                )));
            }
        };
        let shared = copy_pool.is_none();

        let mut store =
            PropertyStore::new(session_specs().into_iter().chain(codec.property_specs()));
        store.publish(PropertyKey::DecoderId, PropertyValue::Str(info.id.clone()))?;
        store.publish(PropertyKey::PixelBufferPoolIsShared, PropertyValue::Bool(shared))?;
        store.set_many(properties.iter().map(|(k, v)| (*k, Some(v.clone()))))?;
        for key in properties.keys().copied().filter(|k| !is_session_key(*k)) {
            codec.apply_property(key, store.get(key)?.as_ref())?;
        }
        let depth = reorder_depth(&store)?;
        output_pool.preallocate(min_buffer_count(&store)?)?;

        let core = Arc::new(SessionCore::new("decompression", Arc::new(sink), config));
        let output = Arc::new(DecodeOutput {
            core: core.clone(),
            copy_pool,
            reorder: Mutex::new(ReorderBuffer::new(depth)),
        });
        codec.start(description, codec_pool, output.clone())?;

        info!(
            codec = %info.id,
            stream = %description,
            output = %output_format,
            shared_pool = shared,
            "Decompression session created"
        );

        Ok(Self {
            core,
            output,
            codec: Mutex::new(codec),
            info,
            properties: Mutex::new(store),
            description: Mutex::new(description.clone()),
            output_pool,
        })
    }

    pub fn codec_info(&self) -> &CodecInfo {
        &self.info
    }

    pub fn format_description(&self) -> CodingResult<FormatDescription> {
        self.core.check_usable()?;
        Ok(self.description.lock().clone())
    }

    /// The pool decoded images are delivered from.
    pub fn pixel_buffer_pool(&self) -> CodingResult<PixelBufferPool> {
        self.core.check_usable()?;
        Ok(self.output_pool.clone())
    }

    /// Submit one compressed sample.
    ///
    /// Without `ENABLE_ASYNCHRONOUS_DECOMPRESSION` the call returns only
    /// after the frame has been decoded.
    pub fn submit_frame(
        &self,
        sample: &EncodedSample,
        flags: DecodeFlags,
        token: FrameToken,
    ) -> CodingResult<InfoFlags> {
        let id = self
            .core
            .begin_submit(sample.dts, sample.pts, sample.duration, token)?;
        let temporal = flags.contains(DecodeFlags::ENABLE_TEMPORAL_PROCESSING);
        if temporal {
            self.output.reorder.lock().mark(id);
        }
        let frame = CompressedFrame {
            id,
            sample: sample.clone(),
            flags,
        };

        let result = {
            let mut codec = self.codec.lock();
            codec.decode_frame(frame).and_then(|()| {
                if flags.contains(DecodeFlags::ENABLE_ASYNCHRONOUS_DECOMPRESSION) {
                    Ok(())
                } else {
                    codec.complete_frames(Some(sample.pts))
                }
            })
        };
        if temporal && result.is_err() {
            self.output.abandon(id);
        }
        self.core.end_submit(id, result)
    }

    /// Block until every frame with a presentation time up to `until`
    /// (all frames when `None`) has been delivered, including frames held
    /// for temporal processing.
    pub fn complete_outstanding_work(&self, until: Option<MediaTime>) -> CodingResult<()> {
        self.core.check_usable()?;
        self.codec.lock().complete_frames(until)?;
        self.output.release(until);
        self.core.wait_for(until)
    }

    /// Whether the running decoder can absorb `description` without a new
    /// session.
    pub fn can_accept_format(&self, description: &FormatDescription) -> bool {
        self.core.check_usable().is_ok() && self.codec.lock().can_accept_format(description)
    }

    /// Switch to `description`, which must pass [`can_accept_format`].
    ///
    /// [`can_accept_format`]: Self::can_accept_format
    pub fn update_format(&self, description: &FormatDescription) -> CodingResult<()> {
        self.core.check_usable()?;
        let mut codec = self.codec.lock();
        if !codec.can_accept_format(description) {
            return Err(CodingError::FormatChangeNotSupported(format!(
                "{} cannot switch to {description}",
                self.info.name
            )));
        }
        codec.accept_format(description)?;
        *self.description.lock() = description.clone();
        info!(stream = %description, "Decompression format updated");
        Ok(())
    }

    // -- Properties --

    pub fn get_property(&self, key: PropertyKey) -> CodingResult<Option<PropertyValue>> {
        self.core.check_usable()?;
        let store = self.properties.lock();
        store.spec(key)?;
        match key {
            PropertyKey::NumberOfPendingFrames => {
                Ok(Some(PropertyValue::Int(self.core.pending_count() as i64)))
            }
            _ => store.get(key),
        }
    }

    pub fn set_property(&self, key: PropertyKey, value: Option<PropertyValue>) -> CodingResult<()> {
        self.set_properties([(key, value)])
    }

    /// Set several properties. Nothing changes unless all are accepted.
    pub fn set_properties(
        &self,
        entries: impl IntoIterator<Item = (PropertyKey, Option<PropertyValue>)>,
    ) -> CodingResult<()> {
        self.core.check_usable()?;
        let entries: Vec<_> = entries.into_iter().collect();
        let mut store = self.properties.lock();
        let mut next = store.clone();
        next.set_many(entries.iter().cloned())?;

        let mut codec = self.codec.lock();
        for (key, value) in entries.iter().filter(|(k, _)| !is_session_key(*k)) {
            let applied = match value {
                Some(_) => next.get(*key)?,
                None => None,
            };
            codec.apply_property(*key, applied.as_ref())?;
        }
        drop(codec);

        if entries.iter().any(|(k, _)| *k == PropertyKey::TemporalReorderDepth) {
            let depth = reorder_depth(&next)?;
            self.output.reorder.lock().set_depth(depth);
            debug!(depth, "Temporal reorder depth changed");
        }
        if entries
            .iter()
            .any(|(k, _)| *k == PropertyKey::OutputPoolMinimumBufferCount)
        {
            self.output_pool.preallocate(min_buffer_count(&next)?)?;
        }
        *store = next;
        Ok(())
    }

    pub fn copy_supported_properties(&self) -> CodingResult<Vec<PropertySpec>> {
        self.core.check_usable()?;
        Ok(self.properties.lock().supported())
    }

    pub fn copy_serializable_properties(&self) -> CodingResult<PropertyMap> {
        self.core.check_usable()?;
        Ok(self.properties.lock().serializable())
    }

    // -- Lifecycle --

    pub fn state(&self) -> SessionState {
        self.core.state()
    }

    pub fn stats(&self) -> SessionStats {
        self.core.stats()
    }

    /// Tear the session down. Frames already accepted may still be
    /// delivered; every later call fails with `InvalidSession`.
    pub fn invalidate(&self) {
        if !self.core.invalidate() {
            return;
        }
        self.codec.lock().invalidate();
        let held = self.output.reorder.lock().len();
        if held > 0 {
            debug!(held, "Releasing frames held for temporal processing");
            self.output.release(None);
        }
        self.output_pool.flush();
    }
}

impl Drop for DecompressionSession {
    fn drop(&mut self) {
        if self.core.state() != SessionState::Invalidated {
            info!(codec = %self.info.id, "Decompression session dropped without invalidate");
            self.invalidate();
        }
    }
}

impl std::fmt::Debug for DecompressionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DecompressionSession")
            .field("codec", &self.info.id)
            .field("stream", &*self.description.lock())
            .field("output", self.output_pool.format())
            .field("state", &self.core.state())
            .finish()
    }
}

fn reorder_depth(store: &PropertyStore) -> CodingResult<usize> {
    let depth = store
        .get(PropertyKey::TemporalReorderDepth)?
        .and_then(|v| v.as_int())
        .unwrap_or(DEFAULT_REORDER_DEPTH);
    Ok(usize::try_from(depth).unwrap_or(0))
}

fn min_buffer_count(store: &PropertyStore) -> CodingResult<usize> {
    let count = store
        .get(PropertyKey::OutputPoolMinimumBufferCount)?
        .and_then(|v| v.as_int())
        .unwrap_or(0);
    Ok(usize::try_from(count).unwrap_or(0))
}
