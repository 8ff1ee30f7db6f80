//! Software "Animation" decoder.

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tracing::{debug, info};

use vcs_common::buffer::copy_rows;
use vcs_common::{
    BufferAttributes, CodecInfo, CodingError, CodingResult, CompressedFrame, DecodeFlags,
    DecoderPlugin, Emitter, FormatDescription, ImageBuffer, PixelBufferPool, PropertyKey,
    PropertySpec, PropertyValue, ValueType, VideoCodec,
};

use crate::animation_info;
use crate::payload::{split_payload, VERSION};
use crate::rle;
use crate::worker::Worker;

/// Construction-time behaviour of the decoder.
#[derive(Clone, Debug)]
pub struct DecoderOptions {
    /// Complete frames on a worker thread when the caller allows it.
    pub asynchronous: bool,
    /// Output row stride alignment in bytes.
    pub row_alignment: usize,
    pub frame_delay: Option<Duration>,
}

impl Default for DecoderOptions {
    fn default() -> Self {
        Self {
            asynchronous: false,
            row_alignment: 16,
            frame_delay: None,
        }
    }
}

#[derive(Default)]
struct DecodeState {
    reference: Option<Vec<u8>>,
}

struct DecodeJob {
    frame: CompressedFrame,
    delay: Option<Duration>,
}

fn decode_one(
    state: &mut DecodeState,
    pool: &PixelBufferPool,
    job: &DecodeJob,
) -> CodingResult<Option<ImageBuffer>> {
    if let Some(delay) = job.delay {
        std::thread::sleep(delay);
    }

    let format = *pool.format();
    let (header, body) = split_payload(&job.frame.sample.data)?;
    if header.resolution != format.resolution || header.pixel_format != format.pixel_format {
        return Err(CodingError::CodecMalfunction(format!(
            "frame {} coded as {} {:?}, stream is {format}",
            job.frame.id, header.resolution, header.pixel_format
        )));
    }

    let decoded = rle::decode(body, format.row_bytes() * format.row_count())?;
    let pixels = if header.keyframe {
        decoded
    } else {
        match &state.reference {
            Some(reference) => decoded.iter().zip(reference).map(|(d, r)| d ^ r).collect(),
            None => {
                debug!(frame = %job.frame.id, "Delta frame without reference dropped");
                return Ok(None);
            }
        }
    };

    let mut buffer = pool.acquire()?;
    let out = buffer.data_mut().ok_or_else(|| {
        CodingError::AllocationFailed("pool returned a shared buffer".to_string())
    })?;
    copy_rows(&pixels, format.row_bytes(), out, format.bytes_per_row, &format);
    state.reference = Some(pixels);
    Ok(Some(buffer))
}

/// Run-length "Animation" decoder plugin.
pub struct AnimationDecoder {
    options: DecoderOptions,
    real_time: bool,
    description: Option<FormatDescription>,
    pool: Option<PixelBufferPool>,
    emitter: Option<Emitter<ImageBuffer>>,
    state: Arc<Mutex<DecodeState>>,
    worker: Option<Worker<DecodeJob>>,
    frames_received: u64,
    invalidated: bool,
}

impl AnimationDecoder {
    pub fn new() -> Self {
        Self::with_options(DecoderOptions::default())
    }

    pub fn with_options(options: DecoderOptions) -> Self {
        Self {
            options,
            real_time: false,
            description: None,
            pool: None,
            emitter: None,
            state: Arc::new(Mutex::new(DecodeState::default())),
            worker: None,
            frames_received: 0,
            invalidated: false,
        }
    }

    fn check_description(description: &FormatDescription) -> CodingResult<()> {
        if description.codec != VideoCodec::Animation {
            return Err(CodingError::UnsupportedFormat(format!(
                "Animation decoder cannot read {}",
                description.codec
            )));
        }
        if description.resolution.is_empty() {
            return Err(CodingError::UnsupportedFormat(format!(
                "empty resolution {}",
                description.resolution
            )));
        }
        match description.extradata.first() {
            None => Ok(()),
            Some(&VERSION) => Ok(()),
            Some(other) => Err(CodingError::UnsupportedFormat(format!(
                "payload version {other}"
            ))),
        }
    }
}

impl Default for AnimationDecoder {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for AnimationDecoder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AnimationDecoder")
            .field("options", &self.options)
            .field("description", &self.description)
            .field("frames_received", &self.frames_received)
            .field("invalidated", &self.invalidated)
            .finish()
    }
}

impl DecoderPlugin for AnimationDecoder {
    fn info(&self) -> CodecInfo {
        animation_info()
    }

    fn negotiate(&mut self, description: &FormatDescription) -> CodingResult<BufferAttributes> {
        Self::check_description(description)?;
        Ok(BufferAttributes {
            resolution: description.resolution,
            pixel_formats: vec![description.pixel_format],
            row_alignment: self.options.row_alignment,
        })
    }

    fn property_specs(&self) -> Vec<PropertySpec> {
        vec![PropertySpec::read_write(PropertyKey::RealTime, ValueType::Bool).with_default(false)]
    }

    fn apply_property(
        &mut self,
        key: PropertyKey,
        value: Option<&PropertyValue>,
    ) -> CodingResult<()> {
        match key {
            PropertyKey::RealTime => {
                self.real_time = value.and_then(|v| v.as_bool()).unwrap_or(false);
                Ok(())
            }
            other => Err(CodingError::PropertyNotSupported {
                key: other.to_string(),
            }),
        }
    }

    fn start(
        &mut self,
        description: &FormatDescription,
        output: PixelBufferPool,
        emitter: Emitter<ImageBuffer>,
    ) -> CodingResult<()> {
        if self.description.is_some() {
            return Err(CodingError::InvalidParameter(
                "decoder already started".to_string(),
            ));
        }
        Self::check_description(description)?;
        let format = *output.format();
        if format.resolution != description.resolution
            || format.pixel_format != description.pixel_format
        {
            return Err(CodingError::UnsupportedFormat(format!(
                "output pool {format} does not match stream {description}"
            )));
        }

        if self.options.asynchronous {
            let state = self.state.clone();
            let pool = output.clone();
            let sink = emitter.clone();
            self.worker = Some(Worker::spawn("vcs-animation-dec", move |job: DecodeJob| {
                let result = decode_one(&mut state.lock(), &pool, &job);
                sink.emit(job.frame.id, result);
            })?);
        }

        self.description = Some(description.clone());
        self.pool = Some(output);
        self.emitter = Some(emitter);
        info!(
            stream = %description,
            asynchronous = self.options.asynchronous,
            real_time = self.real_time,
            "Animation decoder started"
        );
        Ok(())
    }

    fn decode_frame(&mut self, frame: CompressedFrame) -> CodingResult<()> {
        if self.invalidated {
            return Err(CodingError::InvalidSession);
        }
        let (pool, emitter) = match (&self.pool, &self.emitter) {
            (Some(pool), Some(emitter)) => (pool.clone(), emitter.clone()),
            _ => {
                return Err(CodingError::InvalidParameter(
                    "decoder has not been started".to_string(),
                ))
            }
        };
        self.frames_received += 1;

        let job = DecodeJob {
            frame,
            delay: self.options.frame_delay,
        };
        let deferred = job
            .frame
            .flags
            .contains(DecodeFlags::ENABLE_ASYNCHRONOUS_DECOMPRESSION);

        match &self.worker {
            Some(worker) if deferred => worker.submit(job),
            worker => {
                // Frames still queued must complete first to keep decode order.
                if let Some(worker) = worker {
                    worker.flush()?;
                }
                let result = decode_one(&mut self.state.lock(), &pool, &job);
                emitter.emit(job.frame.id, result);
                Ok(())
            }
        }
    }

    fn can_accept_format(&self, description: &FormatDescription) -> bool {
        let Some(current) = &self.description else {
            return false;
        };
        Self::check_description(description).is_ok()
            && description.resolution == current.resolution
            && description.pixel_format == current.pixel_format
    }

    fn accept_format(&mut self, description: &FormatDescription) -> CodingResult<()> {
        if !self.can_accept_format(description) {
            return Err(CodingError::FormatChangeNotSupported(format!(
                "cannot switch to {description}"
            )));
        }
        debug!(stream = %description, "Decoder accepted format change");
        self.description = Some(description.clone());
        Ok(())
    }

    fn complete_frames(&mut self, _until: Option<vcs_common::MediaTime>) -> CodingResult<()> {
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
        debug!(frames = self.frames_received, "Animation decoder invalidated");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::encoder::AnimationEncoder;
    use vcs_common::{
        EncodedSample, EncoderPlugin, FrameEmitter, FrameId, FrameProperties, ImageFormat,
        MediaTime, PixelFormat, Resolution, SourceFrame,
    };

    struct Collect<T>(Mutex<Vec<(FrameId, CodingResult<Option<T>>)>>);

    impl<T> Default for Collect<T> {
        fn default() -> Self {
            Self(Mutex::new(Vec::new()))
        }
    }

    impl<T: Send> FrameEmitter<T> for Collect<T> {
        fn emit(&self, frame: FrameId, result: CodingResult<Option<T>>) {
            self.0.lock().push((frame, result));
        }
    }

    fn input_format() -> ImageFormat {
        ImageFormat::packed(Resolution::new(4, 2), PixelFormat::Bgra8)
    }

    /// Encode `frames` (each a fill pattern) and return the samples.
    fn encode(frames: &[Vec<u8>]) -> (FormatDescription, Vec<EncodedSample>) {
        let mut enc = AnimationEncoder::new();
        let sink = Arc::new(Collect::<EncodedSample>::default());
        enc.start(&input_format(), sink.clone()).unwrap();
        for (i, pixels) in frames.iter().enumerate() {
            enc.encode_frame(SourceFrame {
                id: FrameId(i as u64),
                image: ImageBuffer::from_vec(input_format(), pixels.clone()).unwrap(),
                pts: MediaTime::new(i as i64, 30),
                duration: None,
                properties: FrameProperties::default(),
            })
            .unwrap();
        }
        let samples = sink
            .0
            .lock()
            .drain(..)
            .map(|(_, r)| r.unwrap().unwrap())
            .collect();
        (enc.format_description().unwrap(), samples)
    }

    fn started_decoder(
        desc: &FormatDescription,
        options: DecoderOptions,
    ) -> (AnimationDecoder, Arc<Collect<ImageBuffer>>) {
        let mut dec = AnimationDecoder::with_options(options);
        let attrs = dec.negotiate(desc).unwrap();
        let pool = PixelBufferPool::new(attrs.preferred_format(desc.pixel_format), 4).unwrap();
        let sink = Arc::new(Collect::<ImageBuffer>::default());
        dec.start(desc, pool, sink.clone()).unwrap();
        (dec, sink)
    }

    fn compressed(id: u64, sample: EncodedSample, flags: DecodeFlags) -> CompressedFrame {
        CompressedFrame {
            id: FrameId(id),
            sample,
            flags,
        }
    }

    fn patterns() -> Vec<Vec<u8>> {
        let a: Vec<u8> = (0..32).collect();
        let mut b = a.clone();
        b[5] = 200;
        b[17] = 3;
        vec![a, b]
    }

    #[test]
    fn decodes_key_and_delta_frames() {
        let frames = patterns();
        let (desc, samples) = encode(&frames);
        let (mut dec, sink) = started_decoder(&desc, DecoderOptions::default());
        for (i, s) in samples.into_iter().enumerate() {
            dec.decode_frame(compressed(i as u64, s, DecodeFlags::NONE)).unwrap();
        }

        let out = sink.0.lock();
        assert_eq!(out.len(), 2);
        for (i, (_, result)) in out.iter().enumerate() {
            let image = result.as_ref().unwrap().as_ref().unwrap();
            // 16-byte rows happen to need no padding at this width.
            assert_eq!(image.data(), frames[i].as_slice());
        }
    }

    #[test]
    fn delta_without_reference_is_dropped() {
        let (desc, samples) = encode(&patterns());
        let (mut dec, sink) = started_decoder(&desc, DecoderOptions::default());
        dec.decode_frame(compressed(1, samples[1].clone(), DecodeFlags::NONE))
            .unwrap();
        assert!(sink.0.lock()[0].1.as_ref().unwrap().is_none());
    }

    #[test]
    fn output_is_exclusive_after_emit() {
        let (desc, samples) = encode(&patterns());
        let (mut dec, sink) = started_decoder(&desc, DecoderOptions::default());
        dec.decode_frame(compressed(0, samples[0].clone(), DecodeFlags::NONE))
            .unwrap();
        let (_, result) = sink.0.lock().pop().unwrap();
        assert!(result.unwrap().unwrap().is_exclusive());
    }

    #[test]
    fn asynchronous_decode_keeps_order() {
        let (desc, samples) = encode(&patterns());
        let (mut dec, sink) = started_decoder(
            &desc,
            DecoderOptions {
                asynchronous: true,
                frame_delay: Some(Duration::from_millis(5)),
                ..DecoderOptions::default()
            },
        );
        let flags = DecodeFlags::ENABLE_ASYNCHRONOUS_DECOMPRESSION;
        dec.decode_frame(compressed(0, samples[0].clone(), flags)).unwrap();
        // A synchronous frame waits for the queued one.
        dec.decode_frame(compressed(1, samples[1].clone(), DecodeFlags::NONE))
            .unwrap();
        dec.complete_frames(None).unwrap();
        let ids: Vec<FrameId> = sink.0.lock().iter().map(|(id, _)| *id).collect();
        assert_eq!(ids, vec![FrameId(0), FrameId(1)]);
    }

    #[test]
    fn format_changes() {
        let (desc, _) = encode(&patterns());
        let (mut dec, _sink) = started_decoder(&desc, DecoderOptions::default());

        let mut same_geometry = desc.clone();
        same_geometry.extradata.clear();
        assert!(dec.can_accept_format(&same_geometry));
        dec.accept_format(&same_geometry).unwrap();

        let mut bigger = desc.clone();
        bigger.resolution = Resolution::new(8, 8);
        assert!(!dec.can_accept_format(&bigger));
        assert!(matches!(
            dec.accept_format(&bigger),
            Err(CodingError::FormatChangeNotSupported(_))
        ));
    }

    #[test]
    fn negotiate_rejects_other_codecs() {
        let (mut desc, _) = encode(&patterns());
        desc.codec = VideoCodec::Hevc;
        assert!(matches!(
            AnimationDecoder::new().negotiate(&desc),
            Err(CodingError::UnsupportedFormat(_))
        ));
    }
}
