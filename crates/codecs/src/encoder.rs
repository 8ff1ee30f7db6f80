//! Software "Animation" encoder.
//!
//! Key frames are run-length coded pixels; every other frame is the
//! run-length coded XOR against the previous reconstructed frame. Quality
//! is expressed as a quantization step: the number of low bits cleared in
//! every byte before coding.
//!
//! # Multi-pass rate control
//!
//! Each pass records a [`FrameStats`] entry per frame in the attached
//! multi-pass storage. At the end of a pass, every group of pictures (key
//! frame up to the next key frame) containing a frame larger than the
//! per-frame budget (`AverageBitRate / 8 / ExpectedFrameRate` bytes) is
//! requested again, one quantization step coarser. Re-encoded groups start
//! with a key frame so they can replace the earlier pass's output wholesale.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use vcs_common::{
    BufferAttributes, CodecInfo, CodingError, CodingResult, Constraint, Emitter, EncodedSample,
    EncoderPlugin, FormatDescription, FormatRequest, ImageFormat, MediaTime, MultiPassStore,
    PassFlags, PixelFormat, PropertyKey, PropertySpec, PropertyValue, SourceFrame, TimeRange,
    ValueType, VideoCodec,
};

use crate::animation_info;
use crate::payload::{PayloadHeader, HEADER_LEN, VERSION};
use crate::rle;
use crate::worker::Worker;

/// Coarsest quantization step.
pub const MAX_QUALITY_STEP: u8 = 4;

/// Upper bound on encoding passes.
pub const MAX_PASSES: u8 = 4;

/// Map a 0.0..=1.0 quality to a quantization step.
pub fn quality_step(quality: f64) -> u8 {
    ((1.0 - quality.clamp(0.0, 1.0)) * MAX_QUALITY_STEP as f64).round() as u8
}

// ---------------------------------------------------------------------------
// Options and settings
// ---------------------------------------------------------------------------

/// Construction-time behaviour of the encoder.
#[derive(Clone, Debug)]
pub struct EncoderOptions {
    /// Complete frames on a worker thread instead of inside `encode_frame`.
    pub asynchronous: bool,
    /// Required input row stride alignment in bytes.
    pub row_alignment: usize,
    /// Drop every n-th frame received.
    pub drop_every: Option<u32>,
    /// Sleep this long before coding each frame.
    pub frame_delay: Option<Duration>,
}

impl Default for EncoderOptions {
    fn default() -> Self {
        Self {
            asynchronous: false,
            row_alignment: 16,
            drop_every: None,
            frame_delay: None,
        }
    }
}

#[derive(Clone, Debug)]
struct EncoderSettings {
    quality: f64,
    max_key_interval: u32,
    average_bit_rate: i64,
    expected_frame_rate: f64,
    real_time: bool,
}

impl Default for EncoderSettings {
    fn default() -> Self {
        Self {
            quality: 1.0,
            max_key_interval: 30,
            average_bit_rate: 0,
            expected_frame_rate: 30.0,
            real_time: false,
        }
    }
}

/// Per-frame record kept in multi-pass storage.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameStats {
    /// Coded size in bytes, header included.
    pub size: usize,
    pub quality_step: u8,
    pub keyframe: bool,
}

// ---------------------------------------------------------------------------
// Frame coding
// ---------------------------------------------------------------------------

struct FrameJob {
    frame: SourceFrame,
    quality_step: u8,
    force_key: bool,
    max_key_interval: u32,
    pass: u8,
    drop: bool,
    delay: Option<Duration>,
    storage: Option<Arc<dyn MultiPassStore>>,
}

#[derive(Default)]
struct StreamState {
    /// Reconstructed pixels of the last coded frame, rows packed.
    reference: Option<Vec<u8>>,
    /// Frames coded since (and including) the last key frame.
    frames_since_key: u32,
}

fn encode_one(
    state: &mut StreamState,
    format: &ImageFormat,
    job: &FrameJob,
) -> CodingResult<Option<EncodedSample>> {
    if let Some(delay) = job.delay {
        std::thread::sleep(delay);
    }
    if job.drop {
        return Ok(None);
    }

    let frame = &job.frame;
    if frame.image.format() != format {
        return Err(CodingError::InvalidParameter(format!(
            "frame {} is {}, encoder was started with {format}",
            frame.id,
            frame.image.format()
        )));
    }

    let mask = 0xFFu8 << job.quality_step.min(MAX_QUALITY_STEP);
    let mut pixels = Vec::with_capacity(format.row_bytes() * format.row_count());
    for row in 0..format.row_count() {
        pixels.extend(frame.image.row(row).iter().map(|b| b & mask));
    }

    let keyframe = job.force_key
        || state.frames_since_key >= job.max_key_interval
        || state.reference.as_ref().map_or(true, |r| r.len() != pixels.len());

    let mut body = Vec::new();
    match (&state.reference, keyframe) {
        (Some(reference), false) => {
            let delta: Vec<u8> = pixels.iter().zip(reference).map(|(a, b)| a ^ b).collect();
            rle::encode(&delta, &mut body);
        }
        _ => rle::encode(&pixels, &mut body),
    }

    let header = PayloadHeader {
        keyframe,
        pass: job.pass,
        quality_step: job.quality_step,
        pixel_format: format.pixel_format,
        resolution: format.resolution,
        body_len: u32::try_from(body.len()).map_err(|_| {
            CodingError::CodecMalfunction(format!("frame {} body too large", frame.id))
        })?,
    };
    let mut data = Vec::with_capacity(HEADER_LEN + body.len());
    header.write_to(&mut data)?;
    data.extend_from_slice(&body);

    if let Some(storage) = &job.storage {
        let stats = FrameStats {
            size: data.len(),
            quality_step: job.quality_step,
            keyframe,
        };
        storage.store(frame.pts, &serde_json::to_vec(&stats)?)?;
    }

    state.reference = Some(pixels);
    state.frames_since_key = if keyframe { 1 } else { state.frames_since_key + 1 };

    let mut sample = EncodedSample::new(data, frame.pts, keyframe);
    sample.duration = frame.duration;
    Ok(Some(sample))
}

// ---------------------------------------------------------------------------
// Multi-pass bookkeeping
// ---------------------------------------------------------------------------

struct PassContext {
    number: u8,
    final_pass: bool,
    storage: Arc<dyn MultiPassStore>,
    ranges: Vec<TimeRange>,
    /// Frames submitted in this pass: pts and duration.
    frames: Vec<(MediaTime, Option<MediaTime>)>,
    last_range: Option<usize>,
}

#[derive(Copy, Clone, Debug)]
struct TimelineEntry {
    duration: Option<MediaTime>,
    stats: FrameStats,
}

// ---------------------------------------------------------------------------
// AnimationEncoder
// ---------------------------------------------------------------------------

/// Run-length "Animation" encoder plugin.
pub struct AnimationEncoder {
    options: EncoderOptions,
    settings: EncoderSettings,
    format: Option<ImageFormat>,
    emitter: Option<Emitter<EncodedSample>>,
    stream: Arc<Mutex<StreamState>>,
    worker: Option<Worker<FrameJob>>,
    frames_received: u64,
    pass: Option<PassContext>,
    passes_completed: u8,
    timeline: BTreeMap<MediaTime, TimelineEntry>,
    next_ranges: Vec<TimeRange>,
    invalidated: bool,
}

impl AnimationEncoder {
    pub fn new() -> Self {
        Self::with_options(EncoderOptions::default())
    }

    pub fn with_options(options: EncoderOptions) -> Self {
        Self {
            options,
            settings: EncoderSettings::default(),
            format: None,
            emitter: None,
            stream: Arc::new(Mutex::new(StreamState::default())),
            worker: None,
            frames_received: 0,
            pass: None,
            passes_completed: 0,
            timeline: BTreeMap::new(),
            next_ranges: Vec::new(),
            invalidated: false,
        }
    }

    fn frame_budget(&self) -> Option<f64> {
        (self.settings.average_bit_rate > 0 && self.settings.expected_frame_rate > 0.0).then(|| {
            self.settings.average_bit_rate as f64 / 8.0 / self.settings.expected_frame_rate
        })
    }

    /// Ranges covering every group of pictures with an oversized frame that
    /// can still be coded coarser.
    fn oversized_ranges(&self, budget: f64) -> Vec<TimeRange> {
        let entries: Vec<(MediaTime, TimelineEntry)> =
            self.timeline.iter().map(|(pts, e)| (*pts, *e)).collect();

        let mut gop_starts: Vec<usize> = entries
            .iter()
            .enumerate()
            .filter(|(i, (_, e))| *i == 0 || e.stats.keyframe)
            .map(|(i, _)| i)
            .collect();
        gop_starts.push(entries.len());

        let default_duration = MediaTime::from_secs(1.0 / self.settings.expected_frame_rate);
        let mut ranges = Vec::new();
        for bounds in gop_starts.windows(2) {
            let (first, next) = (bounds[0], bounds[1]);
            let gop = &entries[first..next];
            let oversized = gop.iter().any(|(_, e)| {
                e.stats.size as f64 > budget && e.stats.quality_step < MAX_QUALITY_STEP
            });
            if !oversized {
                continue;
            }
            let start = gop[0].0;
            let end = match entries.get(next) {
                Some((next_pts, _)) => *next_pts,
                None => {
                    let (last_pts, last) = gop[gop.len() - 1];
                    last_pts + last.duration.unwrap_or(default_duration)
                }
            };
            ranges.push(TimeRange::from_bounds(start, end));
        }
        TimeRange::coalesce(ranges)
    }

    fn started(&self) -> CodingResult<(ImageFormat, Emitter<EncodedSample>)> {
        match (&self.format, &self.emitter) {
            (Some(format), Some(emitter)) => Ok((*format, emitter.clone())),
            _ => Err(CodingError::InvalidParameter(
                "encoder has not been started".to_string(),
            )),
        }
    }
}

impl Default for AnimationEncoder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AnimationEncoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnimationEncoder")
            .field("options", &self.options)
            .field("settings", &self.settings)
            .field("format", &self.format)
            .field("frames_received", &self.frames_received)
            .field("passes_completed", &self.passes_completed)
            .field("invalidated", &self.invalidated)
            .finish()
    }
}

impl EncoderPlugin for AnimationEncoder {
    fn info(&self) -> CodecInfo {
        animation_info()
    }

    fn negotiate(&mut self, request: &FormatRequest) -> CodingResult<BufferAttributes> {
        if request.codec != VideoCodec::Animation {
            return Err(CodingError::UnsupportedFormat(format!(
                "Animation encoder cannot produce {}",
                request.codec
            )));
        }
        if request.resolution.is_empty() {
            return Err(CodingError::UnsupportedFormat(format!(
                "empty resolution {}",
                request.resolution
            )));
        }
        Ok(BufferAttributes {
            resolution: request.resolution,
            pixel_formats: vec![
                PixelFormat::Bgra8,
                PixelFormat::Rgba8,
                PixelFormat::Nv12,
                PixelFormat::P010,
            ],
            row_alignment: self.options.row_alignment,
        })
    }

    fn property_specs(&self) -> Vec<PropertySpec> {
        vec![
            PropertySpec::read_write(PropertyKey::RealTime, ValueType::Bool).with_default(false),
            PropertySpec::read_write(PropertyKey::Quality, ValueType::Float)
                .with_default(1.0)
                .with_constraint(Constraint::FloatRange { min: 0.0, max: 1.0 }),
            PropertySpec::read_write(PropertyKey::MaxKeyFrameInterval, ValueType::Int)
                .with_default(30i64)
                .with_constraint(Constraint::IntRange { min: 1, max: 10_000 }),
            PropertySpec::read_write(PropertyKey::AverageBitRate, ValueType::Int)
                .with_default(0i64)
                .with_constraint(Constraint::IntRange {
                    min: 0,
                    max: 100_000_000_000,
                }),
            PropertySpec::read_write(PropertyKey::ExpectedFrameRate, ValueType::Float)
                .with_default(30.0)
                .with_constraint(Constraint::FloatRange {
                    min: 1.0,
                    max: 1000.0,
                }),
        ]
    }

    fn apply_property(
        &mut self,
        key: PropertyKey,
        value: Option<&PropertyValue>,
    ) -> CodingResult<()> {
        let defaults = EncoderSettings::default();
        match key {
            PropertyKey::RealTime => {
                self.settings.real_time = value.and_then(|v| v.as_bool()).unwrap_or(defaults.real_time);
            }
            PropertyKey::Quality => {
                self.settings.quality = value.and_then(|v| v.as_float()).unwrap_or(defaults.quality);
            }
            PropertyKey::MaxKeyFrameInterval => {
                self.settings.max_key_interval = value
                    .and_then(|v| v.as_int())
                    .and_then(|v| u32::try_from(v).ok())
                    .unwrap_or(defaults.max_key_interval);
            }
            PropertyKey::AverageBitRate => {
                self.settings.average_bit_rate = value
                    .and_then(|v| v.as_int())
                    .unwrap_or(defaults.average_bit_rate);
            }
            PropertyKey::ExpectedFrameRate => {
                self.settings.expected_frame_rate = value
                    .and_then(|v| v.as_float())
                    .unwrap_or(defaults.expected_frame_rate);
            }
            other => {
                return Err(CodingError::PropertyNotSupported {
                    key: other.to_string(),
                })
            }
        }
        debug!(property = %key, settings = ?self.settings, "Encoder property applied");
        Ok(())
    }

    fn start(&mut self, format: &ImageFormat, emitter: Emitter<EncodedSample>) -> CodingResult<()> {
        if self.format.is_some() {
            return Err(CodingError::InvalidParameter(
                "encoder already started".to_string(),
            ));
        }
        if !format.is_valid() {
            return Err(CodingError::UnsupportedFormat(format!("invalid input {format}")));
        }

        if self.options.asynchronous {
            let stream = self.stream.clone();
            let sink = emitter.clone();
            let fmt = *format;
            self.worker = Some(Worker::spawn("vcs-animation-enc", move |job: FrameJob| {
                let result = encode_one(&mut stream.lock(), &fmt, &job);
                sink.emit(job.frame.id, result);
            })?);
        }

        self.format = Some(*format);
        self.emitter = Some(emitter);
        info!(
            format = %format,
            asynchronous = self.options.asynchronous,
            real_time = self.settings.real_time,
            "Animation encoder started"
        );
        Ok(())
    }

    fn encode_frame(&mut self, frame: SourceFrame) -> CodingResult<()> {
        if self.invalidated {
            return Err(CodingError::InvalidSession);
        }
        let (format, emitter) = self.started()?;

        self.frames_received += 1;
        let drop = self
            .options
            .drop_every
            .is_some_and(|n| n > 0 && self.frames_received % n as u64 == 0);

        let quality = frame.properties.quality.unwrap_or(self.settings.quality);
        let mut step = quality_step(quality);
        let mut force_key = frame.properties.force_key_frame;
        let mut storage = None;
        let mut pass_number = 1;

        if let Some(pass) = self.pass.as_mut() {
            pass_number = pass.number;
            if pass.number > 1 {
                if let Some(bytes) = pass.storage.load(frame.pts)? {
                    let previous: FrameStats = serde_json::from_slice(&bytes)?;
                    step = step
                        .max(previous.quality_step.saturating_add(1))
                        .min(MAX_QUALITY_STEP);
                }
                let range = pass.ranges.iter().position(|r| r.contains(frame.pts));
                force_key |= range != pass.last_range;
                pass.last_range = range;
            }
            pass.frames.push((frame.pts, frame.duration));
            storage = Some(pass.storage.clone());
        }

        let job = FrameJob {
            frame,
            quality_step: step,
            force_key,
            max_key_interval: self.settings.max_key_interval.max(1),
            pass: pass_number,
            drop,
            delay: self.options.frame_delay,
            storage,
        };

        match &self.worker {
            Some(worker) => worker.submit(job),
            None => {
                let result = encode_one(&mut self.stream.lock(), &format, &job);
                emitter.emit(job.frame.id, result);
                Ok(())
            }
        }
    }

    fn complete_frames(&mut self, _until: Option<MediaTime>) -> CodingResult<()> {
        match &self.worker {
            Some(worker) if !self.invalidated => worker.flush(),
            _ => Ok(()),
        }
    }

    fn invalidate(&mut self) {
        self.invalidated = true;
        if let Some(worker) = self.worker.as_mut() {
            worker.detach();
        }
        debug!(frames = self.frames_received, "Animation encoder invalidated");
    }

    fn format_description(&self) -> Option<FormatDescription> {
        self.format.map(|format| FormatDescription {
            codec: VideoCodec::Animation,
            resolution: format.resolution,
            pixel_format: format.pixel_format,
            extradata: vec![VERSION],
        })
    }

    fn supports_multi_pass(&self) -> bool {
        true
    }

    fn begin_pass(&mut self, flags: PassFlags, storage: Arc<dyn MultiPassStore>) -> CodingResult<()> {
        if self.pass.is_some() {
            return Err(CodingError::InvalidParameter(
                "a pass is already in progress".to_string(),
            ));
        }
        let number = self.passes_completed + 1;
        *self.stream.lock() = StreamState::default();
        self.pass = Some(PassContext {
            number,
            final_pass: flags.contains(PassFlags::FINAL),
            storage,
            ranges: if number > 1 {
                self.next_ranges.clone()
            } else {
                Vec::new()
            },
            frames: Vec::new(),
            last_range: None,
        });
        info!(pass = number, final_pass = flags.contains(PassFlags::FINAL), "Encoder pass started");
        Ok(())
    }

    /// A failure drops the pass without counting it: the timeline and the
    /// ranges for the next pass stay as the last completed pass left them.
    fn end_pass(&mut self) -> CodingResult<bool> {
        let pass = self.pass.take().ok_or_else(|| {
            CodingError::InvalidParameter("no pass in progress".to_string())
        })?;
        if let Some(worker) = &self.worker {
            worker.flush()?;
        }

        let mut measured = Vec::with_capacity(pass.frames.len());
        for (pts, duration) in &pass.frames {
            if let Some(bytes) = pass.storage.load(*pts)? {
                let stats: FrameStats = serde_json::from_slice(&bytes)?;
                measured.push((
                    *pts,
                    TimelineEntry {
                        duration: *duration,
                        stats,
                    },
                ));
            }
        }
        self.timeline.extend(measured);
        self.passes_completed = pass.number;

        self.next_ranges = match self.frame_budget() {
            Some(budget) if !pass.final_pass && pass.number < MAX_PASSES => {
                self.oversized_ranges(budget)
            }
            _ => Vec::new(),
        };

        let total: usize = self.timeline.values().map(|e| e.stats.size).sum();
        info!(
            pass = pass.number,
            frames = pass.frames.len(),
            total_bytes = total,
            next_ranges = self.next_ranges.len(),
            "Encoder pass finished"
        );
        Ok(!self.next_ranges.is_empty())
    }

    fn time_ranges_for_next_pass(&self) -> Vec<TimeRange> {
        self.next_ranges.clone()
    }
}
