//! Container writer backends
//!
//! A `ContainerWriter` is the encoder object the session writer drives: it
//! owns the tracks, reports per-track readiness, and closes the container
//! asynchronously. Two backends ship with the crate:
//! - `ffmpeg`: encodes through the FFmpeg command line into a real file
//! - `memory`: records what it was given, for tests and dry runs

pub mod ffmpeg;
pub mod memory;

use crate::media::{AudioFrame, MediaTime, PixelBuffer, PixelFormat, TrackKind, VideoFrame};
use crate::recorder::state::{AudioConfig, AudioFormat, ContainerKind, VideoCodec, VideoConfig};
use crate::utils::error::WriterResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::Path;

pub use ffmpeg::{FfmpegWriter, FfmpegWriterFactory};
pub use memory::{MemoryRecording, MemoryWriter, MemoryWriterFactory};

/// Status reported by a writer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WriterStatus {
    /// Created, session not started yet
    Unknown,
    Writing,
    Completed,
    Failed,
    Cancelled,
}

/// Resolved settings for the video track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VideoTrackSettings {
    pub width: u32,
    pub height: u32,
    pub pixel_format: PixelFormat,
    pub fps: u32,
    pub bitrate: u64,
    pub codec: VideoCodec,
    pub allow_frame_reordering: bool,
}

impl VideoTrackSettings {
    /// Requested parameters, with geometry taken from the observed frame when there is one
    pub fn resolve(requested: Option<&VideoConfig>, observed: Option<&PixelBuffer>) -> Self {
        let requested = requested.cloned().unwrap_or_default();
        let (width, height, pixel_format) = match observed {
            Some(buffer) => (buffer.width, buffer.height, buffer.format),
            None => (requested.width, requested.height, PixelFormat::Bgra),
        };
        Self {
            width,
            height,
            pixel_format,
            fps: requested.fps.max(1),
            bitrate: requested.bitrate,
            codec: requested.codec,
            allow_frame_reordering: requested.allow_frame_reordering,
        }
    }
}

/// Resolved settings for the audio track
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AudioTrackSettings {
    pub sample_rate: u32,
    pub channels: u16,
    pub bitrate: u64,
    pub format: AudioFormat,
}

impl AudioTrackSettings {
    /// Requested parameters, with rate and layout taken from the observed buffer when there is one
    pub fn resolve(requested: Option<&AudioConfig>, observed: Option<&AudioFrame>) -> Self {
        let requested = requested.cloned().unwrap_or_default();
        let (sample_rate, channels) = match observed {
            Some(frame) if frame.sample_rate > 0 && frame.channels > 0 => {
                (frame.sample_rate, frame.channels)
            }
            _ => (requested.sample_rate, requested.channels),
        };
        Self {
            sample_rate,
            channels,
            bitrate: requested.bitrate,
            format: requested.format_id,
        }
    }
}

/// The encoder object for a single output container
#[async_trait]
pub trait ContainerWriter: Send {
    fn status(&self) -> WriterStatus;

    fn add_video_track(&mut self, settings: VideoTrackSettings) -> WriterResult<()>;

    fn add_audio_track(&mut self, settings: AudioTrackSettings) -> WriterResult<()>;

    fn has_track(&self, kind: TrackKind) -> bool;

    /// Begin writing; `at` is the session's time base
    fn start_session(&mut self, at: MediaTime) -> WriterResult<()>;

    /// Whether the track input can take another frame right now
    fn is_ready(&self, kind: TrackKind) -> bool;

    fn append_video(&mut self, frame: VideoFrame) -> WriterResult<()>;

    fn append_audio(&mut self, frame: AudioFrame) -> WriterResult<()>;

    /// No more data will be appended to this track
    fn mark_finished(&mut self, kind: TrackKind);

    /// Whether the writer stopped accepting data on any track
    fn is_stopped(&self) -> bool;

    /// Close the container, resolving to the writer's final status
    async fn finish(self: Box<Self>) -> WriterResult<WriterStatus>;

    /// Abandon the output; no valid file is left behind
    fn cancel(self: Box<Self>);
}

/// Creates writers for new sessions
pub trait WriterFactory: Send + Sync {
    fn create(
        &self,
        target: &Path,
        container: ContainerKind,
    ) -> WriterResult<Box<dyn ContainerWriter>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_video_settings_prefer_observed_geometry() {
        let requested = VideoConfig {
            width: 1920,
            height: 1080,
            fps: 60,
            ..VideoConfig::default()
        };
        let buffer = PixelBuffer::filled(1280, 720, PixelFormat::Rgba, 0);

        let settings = VideoTrackSettings::resolve(Some(&requested), Some(&buffer));
        assert_eq!((settings.width, settings.height), (1280, 720));
        assert_eq!(settings.pixel_format, PixelFormat::Rgba);
        assert_eq!(settings.fps, 60);

        let settings = VideoTrackSettings::resolve(Some(&requested), None);
        assert_eq!((settings.width, settings.height), (1920, 1080));
    }

    #[test]
    fn test_audio_settings_fall_back_to_requested() {
        let requested = AudioConfig {
            sample_rate: 44_100,
            channels: 1,
            ..AudioConfig::default()
        };
        let frame = AudioFrame::new(vec![0.0; 4], 48_000, 2, MediaTime::ZERO);

        let settings = AudioTrackSettings::resolve(Some(&requested), Some(&frame));
        assert_eq!((settings.sample_rate, settings.channels), (48_000, 2));

        let settings = AudioTrackSettings::resolve(Some(&requested), None);
        assert_eq!((settings.sample_rate, settings.channels), (44_100, 1));
        assert_eq!(settings.format, AudioFormat::Aac);
    }
}
