use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::Parser;
use studio_recorder::media::{MediaTime, PixelBuffer, PixelFormat};
use studio_recorder::recorder::{AudioConfig, ContainerKind, PipelineOptions, VideoConfig};
use studio_recorder::source::{CaptureSample, FrameSink, FrameSource, LiveCaptureAdapter};
use studio_recorder::writer::{FfmpegWriterFactory, MemoryWriterFactory, WriterFactory};
use studio_recorder::{Recorder, SessionConfig};

const TONE_HZ: f64 = 440.0;

/**
    Record a synthetic test pattern and tone into a container file.
*/
#[derive(Parser)]
#[command(name = "studio-recorder")]
struct Cli {
    /// Output file. The extension follows the container.
    #[arg(short, long, default_value = "recording.mov")]
    output: PathBuf,

    /// Container format: mov or mp4.
    #[arg(short, long, default_value = "mov")]
    container: ContainerKind,

    /// Length of the recording in seconds.
    #[arg(short, long, default_value_t = 3)]
    seconds: u32,

    #[arg(long, default_value_t = 30)]
    fps: u32,

    #[arg(long, default_value_t = 640)]
    width: u32,

    #[arg(long, default_value_t = 360)]
    height: u32,

    /// Use the in-memory writer instead of FFmpeg.
    #[arg(long)]
    memory: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    studio_recorder::init_tracing();
    let cli = Cli::parse();
    if cli.fps == 0 || cli.width == 0 || cli.height == 0 {
        bail!("fps, width and height must be positive");
    }

    let factory: Arc<dyn WriterFactory> = if cli.memory {
        Arc::new(MemoryWriterFactory::new())
    } else {
        let ffmpeg = FfmpegWriterFactory::new();
        if !ffmpeg.is_available() {
            bail!("ffmpeg was not found on PATH; rerun with --memory to skip encoding");
        }
        Arc::new(ffmpeg)
    };

    let recorder = Recorder::spawn(factory, PipelineOptions::from_env());
    let audio = AudioConfig::default();
    let config = SessionConfig::new(cli.output.clone(), cli.container)
        .with_video(Some(VideoConfig {
            width: cli.width,
            height: cli.height,
            fps: cli.fps,
            ..VideoConfig::default()
        }))
        .with_audio(Some(audio.clone()));
    recorder
        .start(config)
        .await
        .context("failed to start recording")?;

    let sink: Arc<dyn FrameSink> = Arc::new(recorder.clone());
    let mut capture = LiveCaptureAdapter::new("synthetic", sink);
    capture.start().await?;

    let samples_per_frame = (audio.sample_rate / cli.fps).max(1) as usize;
    let mut ticker = tokio::time::interval(Duration::from_secs_f64(1.0 / cli.fps as f64));
    let total_frames = cli.seconds as i64 * cli.fps as i64;
    for index in 0..total_frames {
        ticker.tick().await;
        capture.on_sample(CaptureSample::Video {
            buffer: test_pattern(cli.width, cli.height, index),
            pts: MediaTime::new(index, cli.fps as i32),
        });
        let first_sample = index as usize * samples_per_frame;
        capture.on_sample(CaptureSample::Audio {
            samples: sine_tone(first_sample, samples_per_frame, audio.sample_rate, audio.channels),
            sample_rate: audio.sample_rate,
            channels: audio.channels,
            pts: MediaTime::new(first_sample as i64, audio.sample_rate as i32),
        });
    }
    capture.stop().await?;

    let output = recorder
        .stop_and_finalize()
        .await
        .context("failed to finalize recording")?;
    let metrics = recorder.metrics().await?;

    println!(
        "{}",
        serde_json::to_string_pretty(&serde_json::json!({
            "output": output,
            "metrics": metrics,
        }))?
    );
    Ok(())
}

/// BGRA color bars with a white bar sweeping across
fn test_pattern(width: u32, height: u32, index: i64) -> PixelBuffer {
    const BARS: [[u8; 4]; 6] = [
        [0, 0, 255, 255],
        [0, 255, 255, 255],
        [0, 255, 0, 255],
        [255, 255, 0, 255],
        [255, 0, 0, 255],
        [255, 0, 255, 255],
    ];
    let mut buffer = PixelBuffer::filled(width, height, PixelFormat::Bgra, 0);
    let sweep = (index as u64 * 4 % width as u64) as u32;
    for (i, pixel) in buffer.data.chunks_exact_mut(4).enumerate() {
        let x = i as u32 % width;
        let color = if x.abs_diff(sweep) < 4 {
            [255, 255, 255, 255]
        } else {
            BARS[(x * BARS.len() as u32 / width) as usize]
        };
        pixel.copy_from_slice(&color);
    }
    buffer
}

/// Interleaved sine samples starting at sample index `start`
fn sine_tone(start: usize, frames: usize, sample_rate: u32, channels: u16) -> Vec<f32> {
    let mut samples = Vec::with_capacity(frames * channels as usize);
    for n in start..start + frames {
        let t = n as f64 / sample_rate as f64;
        let value = (0.2 * (2.0 * std::f64::consts::PI * TONE_HZ * t).sin()) as f32;
        samples.extend(std::iter::repeat(value).take(channels as usize));
    }
    samples
}
