//! Compression session: images in, encoded samples out.
//!
//! Wraps an [`EncoderPlugin`] chosen through the [`CodecRegistry`],
//! negotiates the input buffer layout, owns the caller-facing pixel buffer
//! pool and drives the multi-pass state machine.

use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, info, trace, warn};

use vcs_common::{
    ranges_contain, CodecInfo, CodecSelector, CodingError, CodingResult, Compatibility,
    CompletionSink, EncodedSample, EncoderPlugin, FormatDescription, FormatRequest,
    FrameProperties, FrameToken, ImageBuffer, ImageFormat, InfoFlags, MediaTime,
    MultiPassStore, PassFlags, PixelBufferPool, PropertyKey, PropertyMap, PropertySpec,
    PropertyStore, PropertyValue, SessionConfig, SourceFrame, TimeRange, ValueType,
};

use crate::lifecycle::{SessionCore, SessionState, SessionStats};
use crate::registry::CodecRegistry;

/// Multi-pass progress of a compression session.
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum MultiPassState {
    /// No pass begun yet.
    Idle,
    InPass,
    BetweenPasses,
    /// No further pass will be run.
    Done,
}

struct MultiPassRun {
    state: MultiPassState,
    /// Ranges of the current pass. `None` means unrestricted.
    ranges: Option<Vec<TimeRange>>,
    passes: u32,
    final_pass: bool,
    storage: Option<Arc<dyn MultiPassStore>>,
}

impl MultiPassRun {
    /// Leave `InPass` after a failed `end_pass`.
    ///
    /// A pass the codec did not finish is not counted, so the next
    /// `begin_pass` repeats it with the same ranges.
    fn abort_pass(&mut self, codec_finished: bool, error: &CodingError) {
        if !codec_finished {
            self.passes = self.passes.saturating_sub(1);
        }
        self.state = if self.passes == 0 {
            MultiPassState::Idle
        } else {
            MultiPassState::BetweenPasses
        };
        self.final_pass = false;
        warn!(pass = self.passes, state = ?self.state, error = %error, "Pass aborted");
    }
}

fn session_specs() -> Vec<PropertySpec> {
    vec![
        PropertySpec::read_only(PropertyKey::NumberOfPendingFrames, ValueType::Int)
            .with_default(0i64),
        PropertySpec::read_only(PropertyKey::PixelBufferPoolIsShared, ValueType::Bool),
        PropertySpec::read_only(PropertyKey::EncoderId, ValueType::Str),
        PropertySpec::read_write(PropertyKey::MultiPassStorage, ValueType::Storage),
    ]
}

/// Keys handled by the session rather than forwarded to the codec.
fn is_session_key(key: PropertyKey) -> bool {
    matches!(
        key,
        PropertyKey::NumberOfPendingFrames
            | PropertyKey::PixelBufferPoolIsShared
            | PropertyKey::EncoderId
            | PropertyKey::MultiPassStorage
    )
}

// ---------------------------------------------------------------------------
// CompressionSession
// ---------------------------------------------------------------------------

/// A session encoding one sequence of frames.
///
/// Results reach the sink given at creation, one per submitted frame, in
/// decode order. Dropping the session without [`invalidate`] performs the
/// same teardown.
///
/// [`invalidate`]: CompressionSession::invalidate
pub struct CompressionSession {
    core: Arc<SessionCore<EncodedSample>>,
    codec: Mutex<Box<dyn EncoderPlugin>>,
    info: CodecInfo,
    properties: Mutex<PropertyStore>,
    source_format: ImageFormat,
    caller_pool: PixelBufferPool,
    /// Codec-side pool when the caller's layout must be copied.
    codec_pool: Option<PixelBufferPool>,
    prepared: Mutex<bool>,
    multipass: Mutex<MultiPassRun>,
}

impl CompressionSession {
    /// Create a session encoding images of `source_format`.
    ///
    /// Fails with `CodecNotFound` when no registered encoder matches
    /// `selector`, and with `UnsupportedFormat` when the encoder cannot take
    /// the source layout at all.
    pub fn create(
        registry: &CodecRegistry,
        selector: &CodecSelector,
        source_format: ImageFormat,
        properties: PropertyMap,
        config: &SessionConfig,
        sink: impl CompletionSink<EncodedSample> + 'static,
    ) -> CodingResult<Self> {
        let (info, mut codec) = registry.create_encoder(selector)?;

        let attributes = codec.negotiate(&FormatRequest {
            codec: selector.codec,
            resolution: source_format.resolution,
        })?;
        let compatibility = attributes.compatibility(&source_format);
        let caller_pool = PixelBufferPool::new(source_format, config.pool_max_idle)?;
        let codec_pool = match compatibility {
            Compatibility::Shared => None,
            Compatibility::CopyRequired => {
                let format = attributes.preferred_format(source_format.pixel_format);
                Some(PixelBufferPool::new(format, config.pool_max_idle)?)
            }
            Compatibility::Unsupported => {
                return Err(CodingError::UnsupportedFormat(format!(
                    "{} cannot encode {source_format}",
                    info.name
                )));
            }
        };
        let codec_format = codec_pool
            .as_ref()
            .map_or(source_format, |pool| *pool.format());

        let mut store =
            PropertyStore::new(session_specs().into_iter().chain(codec.property_specs()));
        store.publish(PropertyKey::EncoderId, PropertyValue::Str(info.id.clone()))?;
        store.publish(
            PropertyKey::PixelBufferPoolIsShared,
            PropertyValue::Bool(codec_pool.is_none()),
        )?;
        store.set_many(properties.iter().map(|(k, v)| (*k, Some(v.clone()))))?;
        for key in properties.keys().copied().filter(|k| !is_session_key(*k)) {
            codec.apply_property(key, store.get(key)?.as_ref())?;
        }
        let storage = properties
            .get(&PropertyKey::MultiPassStorage)
            .and_then(|v| v.as_storage().cloned());

        let core = Arc::new(SessionCore::new("compression", Arc::new(sink), config));
        codec.start(&codec_format, core.clone())?;

        info!(
            codec = %info.id,
            format = %source_format,
            shared_pool = codec_pool.is_none(),
            multi_pass = storage.is_some(),
            "Compression session created"
        );

        Ok(Self {
            core,
            codec: Mutex::new(codec),
            info,
            properties: Mutex::new(store),
            source_format,
            caller_pool,
            codec_pool,
            prepared: Mutex::new(false),
            multipass: Mutex::new(MultiPassRun {
                state: MultiPassState::Idle,
                ranges: None,
                passes: 0,
                final_pass: false,
                storage,
            }),
        })
    }

    pub fn codec_info(&self) -> &CodecInfo {
        &self.info
    }

    pub fn source_format(&self) -> &ImageFormat {
        &self.source_format
    }

    /// Pre-allocate codec and pool resources. Later calls do nothing.
    pub fn prepare(&self) -> CodingResult<()> {
        self.core.check_usable()?;
        let mut prepared = self.prepared.lock();
        if *prepared {
            return Ok(());
        }
        self.codec.lock().prepare()?;
        self.caller_pool.preallocate(2)?;
        if let Some(pool) = &self.codec_pool {
            pool.preallocate(2)?;
        }
        *prepared = true;
        debug!(codec = %self.info.id, "Compression session prepared");
        Ok(())
    }

    /// The pool callers should draw source images from.
    pub fn pixel_buffer_pool(&self) -> CodingResult<PixelBufferPool> {
        self.core.check_usable()?;
        Ok(self.caller_pool.clone())
    }

    /// Submit one frame.
    ///
    /// `pts` must exceed the previous frame's (since the start of the
    /// current pass). The returned flags describe the immediate outcome:
    /// `ASYNCHRONOUS` when the result will be delivered later.
    pub fn submit_frame(
        &self,
        image: &ImageBuffer,
        pts: MediaTime,
        duration: Option<MediaTime>,
        properties: Option<&FrameProperties>,
        token: FrameToken,
    ) -> CodingResult<InfoFlags> {
        self.core.check_usable()?;
        if image.format() != &self.source_format {
            return Err(CodingError::InvalidParameter(format!(
                "image is {}, session encodes {}",
                image.format(),
                self.source_format
            )));
        }
        self.check_pass_window(pts.validate()?)?;

        let id = self.core.begin_submit(pts, pts, duration, token)?;
        let image = match self.stage_image(image) {
            Ok(image) => image,
            Err(e) => return self.core.end_submit(id, Err(e)),
        };
        let frame = SourceFrame {
            id,
            image,
            pts,
            duration,
            properties: properties.cloned().unwrap_or_default(),
        };
        let result = self.codec.lock().encode_frame(frame);
        self.core.end_submit(id, result)
    }

    fn check_pass_window(&self, pts: MediaTime) -> CodingResult<()> {
        let run = self.multipass.lock();
        match run.state {
            MultiPassState::InPass => match &run.ranges {
                Some(ranges) if !ranges_contain(ranges, pts) => {
                    Err(CodingError::InvalidTimeRange(format!(
                        "{pts} is outside the ranges of pass {}",
                        run.passes
                    )))
                }
                _ => Ok(()),
            },
            _ if run.storage.is_some() => Err(CodingError::InvalidParameter(
                "multi-pass session: frames must be submitted inside a pass".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// The image the codec receives: the caller's buffer itself when pools
    /// are shared, otherwise a copy in the codec's layout.
    fn stage_image(&self, image: &ImageBuffer) -> CodingResult<ImageBuffer> {
        match &self.codec_pool {
            None => Ok(image.clone()),
            Some(pool) => {
                let mut staged = pool.acquire()?;
                image.copy_to(&mut staged)?;
                self.core.record_copy();
                trace!(from = image.id(), to = staged.id(), "Copied source image into codec pool");
                Ok(staged)
            }
        }
    }

    /// Block until every frame with a presentation time up to `until`
    /// (all frames when `None`) has been delivered.
    pub fn complete_outstanding_work(&self, until: Option<MediaTime>) -> CodingResult<()> {
        self.core.check_usable()?;
        self.codec.lock().complete_frames(until)?;
        self.core.wait_for(until)
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

    /// Set one property; `None` restores its default.
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
        let mut run = self.multipass.lock();
        let mut store = self.properties.lock();

        let mut next = store.clone();
        next.set_many(entries.iter().cloned())?;

        if entries.iter().any(|(k, _)| *k == PropertyKey::MultiPassStorage)
            && run.state == MultiPassState::InPass
        {
            return Err(CodingError::InvalidParameter(
                "multi-pass storage cannot change during a pass".to_string(),
            ));
        }

        let mut codec = self.codec.lock();
        for (key, value) in entries.iter().filter(|(k, _)| !is_session_key(*k)) {
            let applied = match value {
                Some(_) => next.get(*key)?,
                None => None,
            };
            codec.apply_property(*key, applied.as_ref())?;
        }
        drop(codec);

        if entries.iter().any(|(k, _)| *k == PropertyKey::MultiPassStorage) {
            run.storage = next
                .get(PropertyKey::MultiPassStorage)?
                .and_then(|v| v.as_storage().cloned());
            info!(attached = run.storage.is_some(), "Multi-pass storage changed");
        }
        *store = next;
        Ok(())
    }

    /// Schema of every supported property.
    pub fn copy_supported_properties(&self) -> CodingResult<Vec<PropertySpec>> {
        self.core.check_usable()?;
        Ok(self.properties.lock().supported())
    }

    /// Values that can be replayed on another session.
    pub fn copy_serializable_properties(&self) -> CodingResult<PropertyMap> {
        self.core.check_usable()?;
        Ok(self.properties.lock().serializable())
    }

    /// Description of the produced stream, once known.
    pub fn format_description(&self) -> CodingResult<Option<FormatDescription>> {
        self.core.check_usable()?;
        Ok(self.codec.lock().format_description())
    }

    // -- Multi-pass --

    pub fn multi_pass_state(&self) -> CodingResult<MultiPassState> {
        self.core.check_usable()?;
        Ok(self.multipass.lock().state)
    }

    /// Start a pass. Requires attached multi-pass storage.
    ///
    /// After the first pass, only frames inside
    /// [`time_ranges_for_next_pass`](Self::time_ranges_for_next_pass) may be
    /// submitted. The timestamp watermark restarts with every pass.
    pub fn begin_pass(&self, flags: PassFlags) -> CodingResult<()> {
        self.core.check_usable()?;
        let mut run = self.multipass.lock();
        let storage = run.storage.clone().ok_or_else(|| {
            CodingError::StorageInvalid("no multi-pass storage attached".to_string())
        })?;
        if storage.is_closed() {
            return Err(CodingError::StorageInvalid(
                "multi-pass storage has been closed".to_string(),
            ));
        }
        match run.state {
            MultiPassState::InPass => {
                return Err(CodingError::InvalidParameter(
                    "a pass is already in progress".to_string(),
                ))
            }
            MultiPassState::Done => {
                return Err(CodingError::InvalidParameter(
                    "multi-pass encoding has finished".to_string(),
                ))
            }
            MultiPassState::Idle | MultiPassState::BetweenPasses => {}
        }

        let mut codec = self.codec.lock();
        if !codec.supports_multi_pass() {
            return Err(CodingError::InvalidParameter(format!(
                "{} does not support multi-pass encoding",
                self.info.name
            )));
        }
        let ranges = (run.passes > 0).then(|| codec.time_ranges_for_next_pass());

        storage.begin_pass(ranges.as_deref())?;
        if let Err(e) = codec.begin_pass(flags, storage.clone()) {
            if let Err(end) = storage.end_pass() {
                warn!(error = %end, "Failed to close storage pass after codec refused it");
            }
            return Err(e);
        }
        drop(codec);

        self.core.reset_watermark();
        run.state = MultiPassState::InPass;
        run.passes += 1;
        run.final_pass = flags.contains(PassFlags::FINAL);
        info!(
            pass = run.passes,
            final_pass = run.final_pass,
            ranges = ranges.as_ref().map_or(0, |r| r.len()),
            "Pass started"
        );
        run.ranges = ranges;
        Ok(())
    }

    /// Finish the current pass after draining it. Returns whether the codec
    /// asks for another pass.
    pub fn end_pass(&self) -> CodingResult<bool> {
        self.core.check_usable()?;
        let mut run = self.multipass.lock();
        if run.state != MultiPassState::InPass {
            return Err(CodingError::InvalidParameter("no pass in progress".to_string()));
        }

        self.codec.lock().complete_frames(None)?;
        self.core.wait_for(None)?;

        // The codec gives up the pass even when it fails, so any error from
        // here on aborts the pass.
        let codec_result = self.codec.lock().end_pass();
        let storage_result = run.storage.as_ref().map_or(Ok(()), |s| s.end_pass());
        let wants_more = match (codec_result, storage_result) {
            (Ok(wants_more), Ok(())) => wants_more,
            (Err(e), storage_result) => {
                if let Err(end) = storage_result {
                    warn!(error = %end, "Failed to end storage pass");
                }
                run.abort_pass(false, &e);
                return Err(e);
            }
            (Ok(_), Err(e)) => {
                run.abort_pass(true, &e);
                return Err(e);
            }
        };
        let wants_more = wants_more && !run.final_pass;
        run.state = if run.final_pass {
            MultiPassState::Done
        } else {
            MultiPassState::BetweenPasses
        };
        info!(pass = run.passes, wants_more, state = ?run.state, "Pass finished");
        Ok(wants_more)
    }

    /// Time ranges the codec wants resubmitted in the next pass.
    pub fn time_ranges_for_next_pass(&self) -> CodingResult<Vec<TimeRange>> {
        self.core.check_usable()?;
        let run = self.multipass.lock();
        if run.state != MultiPassState::BetweenPasses {
            return Err(CodingError::InvalidParameter(format!(
                "time ranges are only available between passes (state {:?})",
                run.state
            )));
        }
        Ok(self.codec.lock().time_ranges_for_next_pass())
    }

    /// Accept the latest results and stop multi-pass encoding.
    pub fn finish_passes(&self) -> CodingResult<()> {
        self.core.check_usable()?;
        let mut run = self.multipass.lock();
        match run.state {
            MultiPassState::BetweenPasses => {
                run.state = MultiPassState::Done;
                info!(passes = run.passes, "Multi-pass encoding finished");
                Ok(())
            }
            MultiPassState::Done => Ok(()),
            other => Err(CodingError::InvalidParameter(format!(
                "cannot finish passes in state {other:?}"
            ))),
        }
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
        self.caller_pool.flush();
        if let Some(pool) = &self.codec_pool {
            pool.flush();
        }
    }
}

impl Drop for CompressionSession {
    fn drop(&mut self) {
        if self.core.state() != SessionState::Invalidated {
            info!(codec = %self.info.id, "Compression session dropped without invalidate");
            self.invalidate();
        }
    }
}

impl std::fmt::Debug for CompressionSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CompressionSession")
            .field("codec", &self.info.id)
            .field("source_format", &self.source_format)
            .field("shared_pool", &self.codec_pool.is_none())
            .field("state", &self.core.state())
            .field("multi_pass", &self.multipass.lock().state)
            .finish()
    }
}
