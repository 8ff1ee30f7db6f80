//! `vcs-encode`: Multi-pass encode of a synthetic sequence.
//!
//! Encodes generated frames with the built-in Animation codec, re-encoding
//! whatever the codec flags as over budget, collects the output in a frame
//! silo and optionally decodes it back.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use clap::Parser;
use crossbeam::channel::{self, Receiver};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use vcs_codecs::{animation_info, inspect_payload, AnimationEncoder, EncoderOptions};
use vcs_common::{
    ranges_contain, ChannelSink, CodecSelector, DecodeFlags, EncodedSample, FormatDescription,
    FrameResult, FrameStatus, FrameToken, ImageFormat, MediaTime, MultiPassStore, PassFlags,
    PixelFormat, PropertyKey, PropertyMap, PropertyValue, Resolution, RuntimeConfig, TimeRange,
    VideoCodec,
};
use vcs_multipass::{FrameSilo, MultiPassStorage};
use vcs_session::{CodecRegistry, CompressionSession, DecompressionSession, MultiPassState};

mod synth;

use synth::FrameSource;

#[derive(Parser, Debug)]
#[command(
    name = "vcs-encode",
    version,
    about = "Multi-pass encode of a synthetic sequence into a frame silo"
)]
struct Cli {
    /// Number of frames to generate
    #[arg(short = 'n', long, default_value = "90")]
    frames: u32,

    /// Frame width in pixels
    #[arg(long, default_value = "64")]
    width: u32,

    /// Frame height in pixels
    #[arg(long, default_value = "36")]
    height: u32,

    /// Frames per second (also the timescale)
    #[arg(long, default_value = "30")]
    fps: u32,

    /// Target average bit rate in bits per second (0 = single pass)
    #[arg(short, long, default_value = "200000")]
    bitrate: i64,

    /// Upper bound on encoding passes
    #[arg(long, default_value = "3")]
    max_passes: u32,

    /// Complete frames on the codec's worker thread
    #[arg(long = "async")]
    asynchronous: bool,

    /// Seed for the noisy frames
    #[arg(long, default_value = "1")]
    seed: u64,

    /// Keep storage and silo files under this directory instead of a temporary one
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Keep temporary backing files after exit
    #[arg(long)]
    keep_backing: bool,

    /// Runtime configuration (JSON)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Decode the silo contents afterwards
    #[arg(long)]
    verify: bool,
}

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let cli = Cli::parse();
    if cli.frames == 0 || cli.fps == 0 {
        bail!("--frames and --fps must be positive");
    }
    if cli.max_passes == 0 {
        bail!("--max-passes must be at least 1");
    }

    let mut config = match &cli.config {
        Some(path) => RuntimeConfig::from_json_file(path)
            .with_context(|| format!("Failed to load config {}", path.display()))?,
        None => RuntimeConfig::default(),
    };
    config.multipass.keep_backing_files |= cli.keep_backing;

    let encoded = encode(&cli, &config)?;
    if cli.verify {
        verify(&cli, &config, &encoded)?;
    }
    encoded.silo.close().context("Failed to close frame silo")?;
    encoded.storage.close().context("Failed to close multi-pass storage")?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Encoding
// ---------------------------------------------------------------------------

struct Encoded {
    storage: Arc<MultiPassStorage>,
    silo: FrameSilo,
    format: ImageFormat,
    description: FormatDescription,
}

fn t(cli: &Cli, index: u32) -> MediaTime {
    MediaTime::new(i64::from(index), cli.fps)
}

fn registry(cli: &Cli) -> CodecRegistry {
    let mut registry = CodecRegistry::with_builtins();
    if cli.asynchronous {
        registry.register_encoder(animation_info(), || {
            Box::new(AnimationEncoder::with_options(EncoderOptions {
                asynchronous: true,
                ..EncoderOptions::default()
            }))
        });
    }
    registry
}

fn encode(cli: &Cli, config: &RuntimeConfig) -> Result<Encoded> {
    let format = ImageFormat::packed(Resolution::new(cli.width, cli.height), PixelFormat::Bgra8);
    let valid = TimeRange::new(t(cli, 0), t(cli, cli.frames));

    let storage = Arc::new(
        MultiPassStorage::create(
            cli.output.as_ref().map(|dir| dir.join("stats")).as_deref(),
            Some(valid),
            &config.multipass,
        )
        .context("Failed to create multi-pass storage")?,
    );
    let silo = FrameSilo::create(
        cli.output.as_ref().map(|dir| dir.join("silo")).as_deref(),
        Some(valid),
        &config.multipass,
    )
    .context("Failed to create frame silo")?;
    info!(storage = %storage.path().display(), silo = %silo.path().display(), "Backing created");

    let store: Arc<dyn MultiPassStore> = storage.clone();
    let mut properties = PropertyMap::new();
    properties.insert(PropertyKey::MultiPassStorage, PropertyValue::Storage(store));
    properties.insert(PropertyKey::AverageBitRate, PropertyValue::Int(cli.bitrate));
    properties.insert(PropertyKey::ExpectedFrameRate, PropertyValue::Float(f64::from(cli.fps)));
    properties.insert(PropertyKey::MaxKeyFrameInterval, PropertyValue::Int(i64::from(cli.fps)));

    let (tx, rx) = channel::unbounded();
    let session = CompressionSession::create(
        &registry(cli),
        &CodecSelector::new(VideoCodec::Animation),
        format,
        properties,
        &config.session,
        ChannelSink(tx),
    )
    .context("Failed to create compression session")?;
    session.prepare()?;

    let source = FrameSource::new(cli.seed, u64::from(cli.frames));
    let pool = session.pixel_buffer_pool()?;
    let mut ranges: Option<Vec<TimeRange>> = None;

    for pass in 1..=cli.max_passes {
        let flags = if pass == cli.max_passes {
            PassFlags::FINAL
        } else {
            PassFlags::NONE
        };
        session.begin_pass(flags)?;

        let mut submitted = 0u32;
        for index in 0..cli.frames {
            let pts = t(cli, index);
            if ranges.as_ref().is_some_and(|r| !ranges_contain(r, pts)) {
                continue;
            }
            let image = source.render(&pool, u64::from(index))?;
            session
                .submit_frame(&image, pts, Some(t(cli, 1)), None, FrameToken(u64::from(index)))
                .with_context(|| format!("Failed to submit frame {index} in pass {pass}"))?;
            submitted += 1;
        }
        session.complete_outstanding_work(None)?;
        let bytes = collect(&rx, &silo)?;
        let wants_more = session.end_pass()?;
        println!("pass {pass}: {submitted} frames, {bytes} bytes");

        if !wants_more {
            if session.multi_pass_state()? == MultiPassState::BetweenPasses {
                session.finish_passes()?;
            }
            break;
        }
        let next = session.time_ranges_for_next_pass()?;
        for range in &next {
            println!("  re-encode {range}");
        }
        silo.set_time_ranges_for_next_pass(&next)?;
        ranges = Some(next);
    }

    summarize(&silo)?;
    let description = session
        .format_description()?
        .context("Encoder did not describe its output")?;
    session.invalidate();
    Ok(Encoded {
        storage,
        silo,
        format,
        description,
    })
}

/// Move delivered samples into the silo. Returns the bytes added.
fn collect(rx: &Receiver<FrameResult<EncodedSample>>, silo: &FrameSilo) -> Result<usize> {
    let mut bytes = 0;
    for result in rx.try_iter() {
        match (result.status, result.output) {
            (FrameStatus::Completed, Some(sample)) => {
                bytes += sample.size();
                silo.add_sample(&sample)?;
            }
            (FrameStatus::Dropped, _) => warn!(token = %result.token, "Frame dropped"),
            (FrameStatus::Failed { status, reason }, _) => {
                bail!("frame {} failed ({status:?}): {reason}", result.token)
            }
            (FrameStatus::Completed, None) => {
                bail!("frame {} completed without output", result.token)
            }
        }
    }
    Ok(bytes)
}

fn summarize(silo: &FrameSilo) -> Result<()> {
    let mut per_pass = [0usize; 8];
    let mut total = 0usize;
    let mut keyframes = 0usize;
    silo.for_each_sample(None, |sample| -> Result<()> {
        let header = inspect_payload(&sample.data)?;
        per_pass[usize::from(header.pass).min(per_pass.len() - 1)] += 1;
        total += sample.size();
        keyframes += usize::from(sample.is_keyframe);
        Ok(())
    })?;
    println!(
        "output: {} frames, {total} bytes, {keyframes} key frames",
        silo.len()
    );
    for (pass, count) in per_pass.iter().enumerate().filter(|(_, c)| **c > 0) {
        println!("  {count} frames from pass {pass}");
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Verification
// ---------------------------------------------------------------------------

fn verify(cli: &Cli, config: &RuntimeConfig, encoded: &Encoded) -> Result<()> {
    let (tx, rx) = channel::unbounded();
    let session = DecompressionSession::create(
        &registry(cli),
        &CodecSelector::new(VideoCodec::Animation),
        &encoded.description,
        Some(encoded.format),
        PropertyMap::new(),
        &config.session,
        ChannelSink(tx),
    )
    .context("Failed to create decompression session")?;

    let mut token = 0u64;
    encoded.silo.for_each_sample(None, |sample| -> Result<()> {
        session.submit_frame(&sample, DecodeFlags::NONE, FrameToken(token))?;
        token += 1;
        Ok(())
    })?;
    session.complete_outstanding_work(None)?;

    let results: Vec<_> = rx.try_iter().collect();
    let decoded = results.iter().filter(|r| r.is_completed()).count();
    let stats = session.stats();
    println!(
        "verify: decoded {decoded}/{} frames, {} buffer copies",
        encoded.silo.len(),
        stats.buffer_copies
    );
    session.invalidate();
    if decoded != encoded.silo.len() {
        bail!("{} frames did not decode", encoded.silo.len() - decoded);
    }
    Ok(())
}
