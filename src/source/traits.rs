//! Frame source trait definitions
//!
//! Sources normalize capture origins into `VideoFrame`/`AudioFrame` and hand
//! them to a `FrameSink`. They attach timestamps and nothing else: no
//! buffering, no backpressure, no writer access.

use crate::media::{AudioFrame, MediaTime, PixelBuffer, VideoFrame};
use crate::utils::error::SourceResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::time::Instant;

/// Consumer of normalized frames
///
/// Every method must return without waiting; it is called from real-time
/// capture callbacks.
pub trait FrameSink: Send + Sync {
    fn append_video(&self, frame: VideoFrame);

    fn append_audio(&self, frame: AudioFrame);

    /// Compositor-originated frame with an externally supplied pts
    fn append_pixel_buffer(&self, buffer: PixelBuffer, pts: MediaTime);
}

/// Where a source's frames come from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceKind {
    /// Push-based capture stream
    Live,
    /// Polled secondary video, e.g. a file being played back
    Playback,
    /// Rendered textures from a GPU compositor
    Compositor,
}

/// Lifecycle shared by every frame source
#[async_trait]
pub trait FrameSource: Send {
    /// Source identifier
    fn id(&self) -> &str;

    fn kind(&self) -> SourceKind;

    /// Begin forwarding frames
    async fn start(&mut self) -> SourceResult<()>;

    /// Stop forwarding frames
    async fn stop(&mut self) -> SourceResult<()>;

    fn is_running(&self) -> bool;

    /// Frames handed to the sink so far
    fn frames_forwarded(&self) -> u64;
}

/// Host clock shared by sources that stamp frames themselves
#[derive(Debug, Clone, Copy)]
pub struct HostClock {
    origin: Instant,
}

impl HostClock {
    pub fn new() -> Self {
        Self {
            origin: Instant::now(),
        }
    }

    pub fn starting_at(origin: Instant) -> Self {
        Self { origin }
    }

    /// Time since the clock's origin
    pub fn now(&self) -> MediaTime {
        MediaTime::from_duration(self.origin.elapsed())
    }
}

impl Default for HostClock {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;
    use parking_lot::Mutex;

    /// Sink that keeps everything it is given
    #[derive(Default)]
    pub struct CollectingSink {
        pub video: Mutex<Vec<VideoFrame>>,
        pub audio: Mutex<Vec<AudioFrame>>,
    }

    impl CollectingSink {
        pub fn video_pts(&self) -> Vec<MediaTime> {
            self.video.lock().iter().map(|f| f.pts).collect()
        }
    }

    impl FrameSink for CollectingSink {
        fn append_video(&self, frame: VideoFrame) {
            self.video.lock().push(frame);
        }

        fn append_audio(&self, frame: AudioFrame) {
            self.audio.lock().push(frame);
        }

        fn append_pixel_buffer(&self, buffer: PixelBuffer, pts: MediaTime) {
            self.append_video(VideoFrame::new(buffer, pts));
        }
    }
}
