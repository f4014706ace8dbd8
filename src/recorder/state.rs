//! Recording state management
//!
//! Session configuration, the lifecycle phase machine, and the snapshots
//! handed to whoever polls the recorder.

use crate::media::{MediaTime, TrackKind};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

/// Container format of the output file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContainerKind {
    /// QuickTime movie
    Mov,
    /// MPEG-4 part 14
    Mp4,
}

impl ContainerKind {
    /// Uniform type identifier of the file
    pub fn file_type(&self) -> &'static str {
        match self {
            ContainerKind::Mov => "com.apple.quicktime-movie",
            ContainerKind::Mp4 => "public.mpeg-4",
        }
    }

    /// Get the file extension for this container
    pub fn extension(&self) -> &'static str {
        match self {
            ContainerKind::Mov => "mov",
            ContainerKind::Mp4 => "mp4",
        }
    }

    /// FFmpeg muxer name
    pub fn ffmpeg_format(&self) -> &'static str {
        match self {
            ContainerKind::Mov => "mov",
            ContainerKind::Mp4 => "mp4",
        }
    }

    /// Whether the index should be moved to the front of the file
    pub fn network_optimized(&self) -> bool {
        matches!(self, ContainerKind::Mp4)
    }
}

impl Default for ContainerKind {
    fn default() -> Self {
        Self::Mov
    }
}

impl std::str::FromStr for ContainerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "mov" | "quicktime" => Ok(ContainerKind::Mov),
            "mp4" | "mpeg4" => Ok(ContainerKind::Mp4),
            other => Err(format!("unknown container '{}', expected mov or mp4", other)),
        }
    }
}

/// Video codec requested for the video track
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VideoCodec {
    H264,
    Hevc,
    ProRes,
}

impl VideoCodec {
    /// Get the FFmpeg encoder for this codec
    pub fn ffmpeg_encoder(&self) -> &'static str {
        match self {
            VideoCodec::H264 => "libx264",
            VideoCodec::Hevc => "libx265",
            VideoCodec::ProRes => "prores_ks",
        }
    }
}

/// Requested video encoding parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct VideoConfig {
    pub width: u32,
    pub height: u32,
    pub fps: u32,
    /// Average bitrate in bits per second
    pub bitrate: u64,
    pub codec: VideoCodec,
    /// Allow B-frames
    pub allow_frame_reordering: bool,
}

impl Default for VideoConfig {
    fn default() -> Self {
        Self {
            width: 1920,
            height: 1080,
            fps: 30,
            bitrate: 10_000_000,
            codec: VideoCodec::H264,
            allow_frame_reordering: false,
        }
    }
}

/// Audio format identifier
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AudioFormat {
    Aac,
    Pcm,
}

impl AudioFormat {
    pub fn ffmpeg_encoder(&self) -> &'static str {
        match self {
            AudioFormat::Aac => "aac",
            AudioFormat::Pcm => "pcm_s16le",
        }
    }
}

/// Requested audio encoding parameters
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channels: u16,
    /// Bitrate in bits per second
    pub bitrate: u64,
    pub format_id: AudioFormat,
}

impl Default for AudioConfig {
    fn default() -> Self {
        Self {
            sample_rate: 48_000,
            channels: 2,
            bitrate: 128_000,
            format_id: AudioFormat::Aac,
        }
    }
}

/// Configuration for starting a recording
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionConfig {
    /// Output file
    pub target: PathBuf,

    #[serde(default)]
    pub container: ContainerKind,

    /// `None` declares an audio-only session
    #[serde(default = "default_video")]
    pub video: Option<VideoConfig>,

    #[serde(default = "default_audio")]
    pub audio: Option<AudioConfig>,
}

fn default_video() -> Option<VideoConfig> {
    Some(VideoConfig::default())
}

fn default_audio() -> Option<AudioConfig> {
    Some(AudioConfig::default())
}

impl SessionConfig {
    pub fn new(target: impl Into<PathBuf>, container: ContainerKind) -> Self {
        Self {
            target: target.into(),
            container,
            video: default_video(),
            audio: default_audio(),
        }
    }

    pub fn with_video(mut self, video: Option<VideoConfig>) -> Self {
        self.video = video;
        self
    }

    pub fn with_audio(mut self, audio: Option<AudioConfig>) -> Self {
        self.audio = audio;
        self
    }

    pub fn is_audio_only(&self) -> bool {
        self.video.is_none()
    }

    /// Target path with the container's extension
    pub fn output_path(&self) -> PathBuf {
        with_container_extension(&self.target, self.container)
    }
}

fn with_container_extension(target: &Path, container: ContainerKind) -> PathBuf {
    let matches = target
        .extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case(container.extension()));
    if matches {
        target.to_path_buf()
    } else {
        target.with_extension(container.extension())
    }
}

/// Tuning knobs for queues, polling, and finalize
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct PipelineOptions {
    /// Frames held per track before the oldest are dropped
    pub queue_capacity: usize,
    /// Producer events buffered ahead of the recorder task
    pub ingest_channel_capacity: usize,
    pub finalize_timeout: Duration,
    /// Sleep when the writer input is not ready
    pub not_ready_backoff: Duration,
    /// Sleep when a pass drained nothing
    pub idle_backoff: Duration,
    pub max_frames_per_pass: usize,
    pub event_channel_capacity: usize,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            queue_capacity: 240,
            ingest_channel_capacity: 1024,
            finalize_timeout: Duration::from_secs(10),
            not_ready_backoff: Duration::from_millis(1),
            idle_backoff: Duration::from_millis(5),
            max_frames_per_pass: 32,
            event_channel_capacity: 100,
        }
    }
}

impl PipelineOptions {
    /// Defaults with environment overrides applied
    pub fn from_env() -> Self {
        let mut options = Self::default();
        if let Some(capacity) = env_parse::<usize>("STUDIO_RECORDER_QUEUE_CAPACITY") {
            options.queue_capacity = capacity.max(1);
        }
        if let Some(ms) = env_parse::<u64>("STUDIO_RECORDER_FINALIZE_TIMEOUT_MS") {
            options.finalize_timeout = Duration::from_millis(ms);
        }
        options
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

/// Lifecycle phase of the recorder
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionPhase {
    /// No recording in progress
    Idle,
    /// Started, waiting for the first frame to create the writer
    Starting,
    /// Writer exists and frames are flowing
    Writing,
    /// Flushing queues and closing the container
    Finalizing,
    Completed,
    Cancelled,
    Failed,
}

impl SessionPhase {
    pub fn is_recording(&self) -> bool {
        matches!(self, SessionPhase::Starting | SessionPhase::Writing)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SessionPhase::Completed | SessionPhase::Cancelled | SessionPhase::Failed
        )
    }
}

impl Default for SessionPhase {
    fn default() -> Self {
        Self::Idle
    }
}

/// Progress information polled by the presentation layer
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressSnapshot {
    pub phase: SessionPhase,
    pub is_recording: bool,
    pub is_finalizing: bool,
    /// 0.0 until finalize, at most 0.99 while flushing, 1.0 once complete
    pub fraction: f64,
    pub video_queue_depth: usize,
    pub audio_queue_depth: usize,
    pub video_written: u64,
    pub audio_written: u64,
    pub session_id: Option<Uuid>,
    pub started_at: Option<DateTime<Utc>>,
}

impl ProgressSnapshot {
    pub fn idle() -> Self {
        Self {
            phase: SessionPhase::Idle,
            is_recording: false,
            is_finalizing: false,
            fraction: 0.0,
            video_queue_depth: 0,
            audio_queue_depth: 0,
            video_written: 0,
            audio_written: 0,
            session_id: None,
            started_at: None,
        }
    }
}

/// Result of a completed recording
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RecordingOutput {
    pub path: PathBuf,
    pub video_frames: u64,
    pub audio_frames: u64,
    pub duration_ms: f64,
}

/// Events emitted during recording
#[derive(Debug, Clone, PartialEq)]
pub enum RecorderEvent {
    Started,
    WriterCreated,
    TimeBaseEstablished(MediaTime),
    /// A track was added to an already running writer
    TrackAttached(TrackKind),
    /// The writer failed and was torn down for re-creation
    WriterRecovered,
    Finalizing,
    Completed(PathBuf),
    Cancelled,
    Failed(String),
}
