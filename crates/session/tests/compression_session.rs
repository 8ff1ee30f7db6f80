//! Integration tests for `CompressionSession` driven through the built-in
//! Animation encoder.

use std::time::Duration;

use crossbeam::channel::{self, Receiver};

use vcs_codecs::{animation_info, AnimationEncoder, EncoderOptions};
use vcs_common::{
    ChannelSink, CodecSelector, CodingError, EncodedSample, FrameProperties, FrameResult,
    FrameStatus, FrameToken, ImageBuffer, ImageFormat, InfoFlags, MediaTime, PixelFormat,
    PropertyKey, PropertyMap, PropertyValue, Resolution, SessionConfig, VideoCodec,
};
use vcs_session::{CodecRegistry, CompressionSession, SessionState};

// ---------------------------------------------------------------------------
// Helpers
// ---------------------------------------------------------------------------

fn t(v: i64) -> MediaTime {
    MediaTime::new(v, 30)
}

fn frame_duration() -> Option<MediaTime> {
    Some(t(1))
}

fn selector() -> CodecSelector {
    CodecSelector::new(VideoCodec::Animation)
}

/// 16x4 BGRA: 64-byte rows, aligned for the default encoder.
fn source_format() -> ImageFormat {
    ImageFormat::packed(Resolution::new(16, 4), PixelFormat::Bgra8)
}

fn image(format: ImageFormat, fill: u8) -> ImageBuffer {
    let size = format.byte_size().unwrap();
    ImageBuffer::from_vec(format, vec![fill; size]).unwrap()
}

fn registry_with(options: EncoderOptions) -> CodecRegistry {
    let mut registry = CodecRegistry::new();
    registry.register_encoder(animation_info(), move || {
        Box::new(AnimationEncoder::with_options(options.clone()))
    });
    registry
}

fn session_with(
    registry: &CodecRegistry,
    format: ImageFormat,
    properties: PropertyMap,
) -> (CompressionSession, Receiver<FrameResult<EncodedSample>>) {
    let (tx, rx) = channel::unbounded();
    let config = SessionConfig {
        drain_timeout_ms: Some(5_000),
        ..SessionConfig::default()
    };
    let session =
        CompressionSession::create(registry, &selector(), format, properties, &config, ChannelSink(tx))
            .unwrap();
    (session, rx)
}

fn session() -> (CompressionSession, Receiver<FrameResult<EncodedSample>>) {
    session_with(&CodecRegistry::with_builtins(), source_format(), PropertyMap::new())
}

// ---------------------------------------------------------------------------
// Submission and lifecycle
// ---------------------------------------------------------------------------

#[test]
fn two_frames_then_invalidate() {
    let (session, rx) = session();
    assert_eq!(session.state(), SessionState::Idle);

    let first = session
        .submit_frame(&image(source_format(), 10), t(0), frame_duration(), None, FrameToken(1))
        .unwrap();
    let second = session
        .submit_frame(&image(source_format(), 10), t(1), frame_duration(), None, FrameToken(2))
        .unwrap();
    // The synchronous encoder finishes inside submit_frame.
    assert!(!first.contains(InfoFlags::ASYNCHRONOUS));
    assert!(!second.contains(InfoFlags::ASYNCHRONOUS));
    session.complete_outstanding_work(None).unwrap();

    let results: Vec<_> = rx.try_iter().collect();
    assert_eq!(results.len(), 2);
    assert_eq!(results[0].token, FrameToken(1));
    assert_eq!(results[1].token, FrameToken(2));
    assert!(results.iter().all(|r| r.is_completed()));
    assert!(results[0].output.as_ref().unwrap().is_keyframe);
    assert_eq!(results[1].pts, t(1));
    assert_eq!(results[1].duration, frame_duration());

    session.invalidate();
    assert_eq!(session.state(), SessionState::Invalidated);
    assert!(matches!(
        session.submit_frame(&image(source_format(), 10), t(2), None, None, FrameToken(3)),
        Err(CodingError::InvalidSession)
    ));
    assert!(matches!(
        session.complete_outstanding_work(None),
        Err(CodingError::InvalidSession)
    ));
    assert!(matches!(
        session.pixel_buffer_pool(),
        Err(CodingError::InvalidSession)
    ));
    assert!(matches!(
        session.get_property(PropertyKey::Quality),
        Err(CodingError::InvalidSession)
    ));
    assert!(matches!(
        session.copy_supported_properties(),
        Err(CodingError::InvalidSession)
    ));
    assert!(matches!(
        session.copy_serializable_properties(),
        Err(CodingError::InvalidSession)
    ));
    assert!(matches!(
        session.format_description(),
        Err(CodingError::InvalidSession)
    ));
    assert!(matches!(
        session.multi_pass_state(),
        Err(CodingError::InvalidSession)
    ));
    // Invalidating twice is harmless.
    session.invalidate();
    assert!(rx.try_recv().is_err());
}

#[test]
fn non_increasing_timestamp_is_rejected_without_a_result() {
    let (session, rx) = session();
    session
        .submit_frame(&image(source_format(), 1), t(5), None, None, FrameToken(0))
        .unwrap();

    for pts in [t(5), t(4)] {
        let err = session
            .submit_frame(&image(source_format(), 1), pts, None, None, FrameToken(9))
            .unwrap_err();
        assert!(matches!(err, CodingError::InvalidTimestamp { .. }), "{err}");
    }
    // Same instant in another timescale is still not later.
    assert!(session
        .submit_frame(&image(source_format(), 1), MediaTime::new(10, 60), None, None, FrameToken(9))
        .is_err());

    session.complete_outstanding_work(None).unwrap();
    assert_eq!(rx.try_iter().count(), 1);
    assert_eq!(session.stats().frames_submitted, 1);
}

#[test]
fn wrong_image_format_is_rejected() {
    let (session, rx) = session();
    let other = ImageFormat::packed(Resolution::new(8, 4), PixelFormat::Bgra8);
    assert!(matches!(
        session.submit_frame(&image(other, 0), t(0), None, None, FrameToken(0)),
        Err(CodingError::InvalidParameter(_))
    ));
    assert_eq!(rx.try_iter().count(), 0);
    // A rejected frame does not advance the timestamp watermark.
    session
        .submit_frame(&image(source_format(), 0), t(0), None, None, FrameToken(1))
        .unwrap();
}

#[test]
fn zero_timescale_is_rejected() {
    let (session, rx) = session();
    let broken = MediaTime {
        value: 1,
        timescale: 0,
    };
    assert!(matches!(
        session.submit_frame(&image(source_format(), 0), broken, None, None, FrameToken(0)),
        Err(CodingError::InvalidParameter(_))
    ));
    assert!(matches!(
        session.submit_frame(&image(source_format(), 0), t(0), Some(broken), None, FrameToken(1)),
        Err(CodingError::InvalidParameter(_))
    ));
    assert_eq!(rx.try_iter().count(), 0);
    session
        .submit_frame(&image(source_format(), 0), t(0), None, None, FrameToken(2))
        .unwrap();
}

#[test]
fn unknown_codec_is_not_found() {
    let (tx, _rx) = channel::unbounded::<FrameResult<EncodedSample>>();
    let err = CompressionSession::create(
        &CodecRegistry::with_builtins(),
        &CodecSelector::new(VideoCodec::H264),
        source_format(),
        PropertyMap::new(),
        &SessionConfig::default(),
        ChannelSink(tx),
    )
    .unwrap_err();
    assert!(matches!(err, CodingError::CodecNotFound(_)));
}

#[test]
fn dropped_frames_are_reported() {
    let registry = registry_with(EncoderOptions {
        drop_every: Some(2),
        ..EncoderOptions::default()
    });
    let (session, rx) = session_with(&registry, source_format(), PropertyMap::new());
    for i in 0..4 {
        let flags = session
            .submit_frame(&image(source_format(), 3), t(i), None, None, FrameToken(i as u64))
            .unwrap();
        assert_eq!(flags.contains(InfoFlags::FRAME_DROPPED), i % 2 == 1);
    }
    session.complete_outstanding_work(None).unwrap();

    let results: Vec<_> = rx.try_iter().collect();
    assert_eq!(results.len(), 4);
    assert!(results[1].is_dropped());
    assert!(results[1].output.is_none());
    assert!(results[1].flags.contains(InfoFlags::FRAME_DROPPED));
    assert_eq!(session.stats().frames_dropped, 2);
    assert_eq!(session.stats().frames_completed, 2);
}

// ---------------------------------------------------------------------------
// Asynchronous completion
// ---------------------------------------------------------------------------

fn async_registry(delay_ms: u64) -> CodecRegistry {
    registry_with(EncoderOptions {
        asynchronous: true,
        frame_delay: Some(Duration::from_millis(delay_ms)),
        ..EncoderOptions::default()
    })
}

#[test]
fn complete_outstanding_work_drains_everything() {
    let (session, rx) = session_with(&async_registry(2), source_format(), PropertyMap::new());
    for i in 0..10 {
        let flags = session
            .submit_frame(&image(source_format(), i as u8), t(i), frame_duration(), None, FrameToken(i as u64))
            .unwrap();
        assert!(flags.contains(InfoFlags::ASYNCHRONOUS));
    }

    session.complete_outstanding_work(None).unwrap();
    assert_eq!(
        session.get_property(PropertyKey::NumberOfPendingFrames).unwrap(),
        Some(PropertyValue::Int(0))
    );

    let results: Vec<_> = rx.try_iter().collect();
    let tokens: Vec<u64> = results.iter().map(|r| r.token.0).collect();
    assert_eq!(tokens, (0..10).collect::<Vec<_>>());
    assert!(results.iter().all(|r| r.flags.contains(InfoFlags::ASYNCHRONOUS)));
    assert!(results.iter().all(|r| r.status == FrameStatus::Completed));
}

#[test]
fn complete_outstanding_work_until_time() {
    let (session, rx) = session_with(&async_registry(2), source_format(), PropertyMap::new());
    for i in 0..6 {
        session
            .submit_frame(&image(source_format(), 0), t(i), None, None, FrameToken(i as u64))
            .unwrap();
    }
    session.complete_outstanding_work(Some(t(2))).unwrap();
    let delivered: Vec<_> = rx.try_iter().map(|r| r.pts).collect();
    assert!(delivered.len() >= 3);
    assert!(delivered.contains(&t(2)));

    session.complete_outstanding_work(None).unwrap();
    assert_eq!(delivered.len() + rx.try_iter().count(), 6);
}

#[test]
fn invalidate_drains_in_flight_frames() {
    let (session, rx) = session_with(&async_registry(10), source_format(), PropertyMap::new());
    for i in 0..5 {
        session
            .submit_frame(&image(source_format(), 7), t(i), None, None, FrameToken(i as u64))
            .unwrap();
    }
    session.invalidate();

    let mut tokens = Vec::new();
    for _ in 0..5 {
        let result = rx.recv_timeout(Duration::from_secs(5)).unwrap();
        assert!(result.is_completed());
        tokens.push(result.token.0);
    }
    assert_eq!(tokens, vec![0, 1, 2, 3, 4]);
    assert!(rx.recv_timeout(Duration::from_millis(50)).is_err());
}

// ---------------------------------------------------------------------------
// Pixel buffer pools
// ---------------------------------------------------------------------------

#[test]
fn aligned_source_shares_the_pool() {
    let (session, rx) = session();
    assert_eq!(
        session.get_property(PropertyKey::PixelBufferPoolIsShared).unwrap(),
        Some(PropertyValue::Bool(true))
    );
    session.prepare().unwrap();
    session.prepare().unwrap();

    let pool = session.pixel_buffer_pool().unwrap();
    let mut ids = Vec::new();
    for i in 0..3 {
        let mut buffer = pool.acquire().unwrap();
        buffer.data_mut().unwrap().fill(i as u8 * 40);
        ids.push(buffer.id());
        session
            .submit_frame(&buffer, t(i), None, None, FrameToken(i as u64))
            .unwrap();
    }
    session.complete_outstanding_work(None).unwrap();

    assert_eq!(session.stats().buffer_copies, 0);
    assert_eq!(ids[0], ids[1]);
    assert_eq!(ids[1], ids[2]);
    assert_eq!(rx.try_iter().count(), 3);
}

#[test]
fn misaligned_source_is_copied() {
    let registry = registry_with(EncoderOptions {
        row_alignment: 64,
        ..EncoderOptions::default()
    });
    // 8 BGRA pixels: 32-byte rows, not a multiple of 64.
    let format = ImageFormat::packed(Resolution::new(8, 4), PixelFormat::Bgra8);
    let (session, rx) = session_with(&registry, format, PropertyMap::new());
    assert_eq!(
        session.get_property(PropertyKey::PixelBufferPoolIsShared).unwrap(),
        Some(PropertyValue::Bool(false))
    );

    let pool = session.pixel_buffer_pool().unwrap();
    assert_eq!(pool.format(), &format);
    let mut ids = Vec::new();
    for i in 0..3 {
        let mut buffer = pool.acquire().unwrap();
        buffer.data_mut().unwrap().fill(0x80);
        ids.push(buffer.id());
        session
            .submit_frame(&buffer, t(i), None, None, FrameToken(i as u64))
            .unwrap();
    }
    session.complete_outstanding_work(None).unwrap();

    assert_eq!(session.stats().buffer_copies, 3);
    assert!(ids.windows(2).all(|w| w[0] == w[1]));
    assert_eq!(pool.stats().allocated, 1);
    assert_eq!(pool.stats().reused, 2);

    let results: Vec<_> = rx.try_iter().collect();
    assert_eq!(results.len(), 3);
    assert!(results.iter().all(|r| r.is_completed()));
    let description = session.format_description().unwrap().unwrap();
    assert_eq!(description.resolution, Resolution::new(8, 4));
}

// ---------------------------------------------------------------------------
// Properties
// ---------------------------------------------------------------------------

#[test]
fn property_round_trip() {
    let (session, _rx) = session();
    assert_eq!(
        session.get_property(PropertyKey::Quality).unwrap(),
        Some(PropertyValue::Float(1.0))
    );
    session
        .set_property(PropertyKey::Quality, Some(PropertyValue::Float(0.5)))
        .unwrap();
    assert_eq!(
        session.get_property(PropertyKey::Quality).unwrap(),
        Some(PropertyValue::Float(0.5))
    );
    // Integers widen for float properties.
    session
        .set_property(PropertyKey::ExpectedFrameRate, Some(PropertyValue::Int(25)))
        .unwrap();
    assert_eq!(
        session.get_property(PropertyKey::ExpectedFrameRate).unwrap(),
        Some(PropertyValue::Float(25.0))
    );
    // Clearing restores the default.
    session.set_property(PropertyKey::Quality, None).unwrap();
    assert_eq!(
        session.get_property(PropertyKey::Quality).unwrap(),
        Some(PropertyValue::Float(1.0))
    );
    assert_eq!(
        session.get_property(PropertyKey::EncoderId).unwrap(),
        Some(PropertyValue::Str(animation_info().id))
    );
}

#[test]
fn read_only_and_unknown_properties() {
    let (session, _rx) = session();
    assert!(matches!(
        session.set_property(PropertyKey::NumberOfPendingFrames, Some(PropertyValue::Int(3))),
        Err(CodingError::PropertyReadOnly { .. })
    ));
    assert!(matches!(
        session.get_property(PropertyKey::TemporalReorderDepth),
        Err(CodingError::PropertyNotSupported { .. })
    ));
    assert!(matches!(
        session.set_property(PropertyKey::Quality, Some(PropertyValue::Float(2.0))),
        Err(CodingError::InvalidParameter(_))
    ));
    assert!(matches!(
        session.set_property(PropertyKey::Quality, Some(PropertyValue::Str("high".into()))),
        Err(CodingError::InvalidParameter(_))
    ));

    let specs = session.copy_supported_properties().unwrap();
    assert!(specs.iter().any(|s| s.key == PropertyKey::MultiPassStorage));
    assert!(specs
        .iter()
        .any(|s| s.key == PropertyKey::NumberOfPendingFrames && !s.is_writable()));
}

#[test]
fn set_properties_is_all_or_nothing() {
    let (session, _rx) = session();
    let err = session
        .set_properties([
            (PropertyKey::Quality, Some(PropertyValue::Float(0.25))),
            (PropertyKey::MaxKeyFrameInterval, Some(PropertyValue::Int(0))),
        ])
        .unwrap_err();
    assert!(matches!(err, CodingError::InvalidParameter(_)));
    assert_eq!(
        session.get_property(PropertyKey::Quality).unwrap(),
        Some(PropertyValue::Float(1.0))
    );
}

#[test]
fn serializable_properties_replay_on_a_new_session() {
    let (first, _rx) = session();
    first
        .set_properties([
            (PropertyKey::Quality, Some(PropertyValue::Float(0.75))),
            (PropertyKey::MaxKeyFrameInterval, Some(PropertyValue::Int(12))),
        ])
        .unwrap();
    let exported = first.copy_serializable_properties().unwrap();
    assert!(!exported.contains_key(&PropertyKey::NumberOfPendingFrames));
    assert!(!exported.contains_key(&PropertyKey::EncoderId));

    let (second, _rx2) = session_with(&CodecRegistry::with_builtins(), source_format(), exported);
    assert_eq!(
        second.get_property(PropertyKey::MaxKeyFrameInterval).unwrap(),
        Some(PropertyValue::Int(12))
    );
    assert_eq!(
        second.get_property(PropertyKey::Quality).unwrap(),
        Some(PropertyValue::Float(0.75))
    );
}

#[test]
fn per_frame_properties_force_key_frames() {
    let (session, rx) = session();
    let force = FrameProperties {
        force_key_frame: true,
        ..FrameProperties::default()
    };
    for i in 0..3 {
        let props = (i == 2).then_some(&force);
        session
            .submit_frame(&image(source_format(), 9), t(i), None, props, FrameToken(i as u64))
            .unwrap();
    }
    session.complete_outstanding_work(None).unwrap();
    let keys: Vec<bool> = rx
        .try_iter()
        .map(|r| r.output.unwrap().is_keyframe)
        .collect();
    assert_eq!(keys, vec![true, false, true]);
}
