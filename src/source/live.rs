//! Live capture adapter
//!
//! Receives sample buffers from a push-based capture stream and forwards
//! them with their native timestamps.

use super::traits::{FrameSink, FrameSource, SourceKind};
use crate::media::{AudioFrame, MediaTime, PixelBuffer, VideoFrame};
use crate::utils::error::{SourceError, SourceResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// One sample delivered by a capture callback
#[derive(Debug, Clone)]
pub enum CaptureSample {
    Video {
        buffer: PixelBuffer,
        pts: MediaTime,
    },
    Audio {
        samples: Vec<f32>,
        sample_rate: u32,
        channels: u16,
        pts: MediaTime,
    },
}

/// Forwards live capture samples to a sink
pub struct LiveCaptureAdapter {
    id: String,
    sink: Arc<dyn FrameSink>,
    is_running: Arc<AtomicBool>,
    forwarded: Arc<AtomicU64>,
    discarded: Arc<AtomicU64>,
}

impl LiveCaptureAdapter {
    pub fn new(id: impl Into<String>, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            id: id.into(),
            sink,
            is_running: Arc::new(AtomicBool::new(false)),
            forwarded: Arc::new(AtomicU64::new(0)),
            discarded: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Capture callback entry point. Samples arriving while stopped are ignored.
    pub fn on_sample(&self, sample: CaptureSample) {
        if !self.is_running.load(Ordering::SeqCst) {
            return;
        }
        match sample {
            CaptureSample::Video { buffer, pts } => {
                if !buffer.is_valid() {
                    self.discarded.fetch_add(1, Ordering::Relaxed);
                    tracing::debug!(
                        "{}: discarding {}x{} buffer with {} bytes",
                        self.id,
                        buffer.width,
                        buffer.height,
                        buffer.data.len()
                    );
                    return;
                }
                self.sink.append_video(VideoFrame::new(buffer, pts));
            }
            CaptureSample::Audio {
                samples,
                sample_rate,
                channels,
                pts,
            } => {
                if samples.is_empty() || channels == 0 {
                    self.discarded.fetch_add(1, Ordering::Relaxed);
                    return;
                }
                self.sink
                    .append_audio(AudioFrame::new(samples, sample_rate, channels, pts));
            }
        }
        self.forwarded.fetch_add(1, Ordering::Relaxed);
    }

    /// Malformed samples that were not forwarded
    pub fn discarded(&self) -> u64 {
        self.discarded.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl FrameSource for LiveCaptureAdapter {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Live
    }

    async fn start(&mut self) -> SourceResult<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(SourceError::AlreadyRunning);
        }
        tracing::info!("Live capture adapter {} started", self.id);
        Ok(())
    }

    async fn stop(&mut self) -> SourceResult<()> {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return Err(SourceError::NotRunning);
        }
        tracing::info!(
            "Live capture adapter {} stopped after {} samples",
            self.id,
            self.frames_forwarded()
        );
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    fn frames_forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::PixelFormat;
    use crate::source::traits::test_support::CollectingSink;

    fn video_sample(pts: i64) -> CaptureSample {
        CaptureSample::Video {
            buffer: PixelBuffer::filled(4, 4, PixelFormat::Bgra, 1),
            pts: MediaTime::new(pts, 600),
        }
    }

    #[tokio::test]
    async fn test_forwards_with_native_timestamps() {
        let sink = Arc::new(CollectingSink::default());
        let mut adapter = LiveCaptureAdapter::new("screen", sink.clone());
        adapter.start().await.unwrap();

        adapter.on_sample(video_sample(20));
        adapter.on_sample(CaptureSample::Audio {
            samples: vec![0.5; 8],
            sample_rate: 48_000,
            channels: 2,
            pts: MediaTime::new(21, 600),
        });

        assert_eq!(sink.video_pts(), vec![MediaTime::new(20, 600)]);
        let audio = sink.audio.lock();
        assert_eq!(audio.len(), 1);
        assert_eq!(audio[0].pts, MediaTime::new(21, 600));
        assert_eq!(audio[0].frame_count(), 4);
        assert_eq!(adapter.frames_forwarded(), 2);
    }

    #[tokio::test]
    async fn test_ignores_samples_while_stopped() {
        let sink = Arc::new(CollectingSink::default());
        let mut adapter = LiveCaptureAdapter::new("screen", sink.clone());
        adapter.on_sample(video_sample(1));
        assert!(sink.video.lock().is_empty());

        adapter.start().await.unwrap();
        assert!(matches!(
            adapter.start().await,
            Err(SourceError::AlreadyRunning)
        ));
        adapter.stop().await.unwrap();
        adapter.on_sample(video_sample(2));
        assert!(sink.video.lock().is_empty());
        assert!(matches!(adapter.stop().await, Err(SourceError::NotRunning)));
    }

    #[tokio::test]
    async fn test_discards_malformed_buffers() {
        let sink = Arc::new(CollectingSink::default());
        let mut adapter = LiveCaptureAdapter::new("screen", sink.clone());
        adapter.start().await.unwrap();

        adapter.on_sample(CaptureSample::Video {
            buffer: PixelBuffer::new(4, 4, PixelFormat::Bgra, vec![0; 3]),
            pts: MediaTime::new(1, 600),
        });
        assert!(sink.video.lock().is_empty());
        assert_eq!(adapter.discarded(), 1);
        assert_eq!(adapter.frames_forwarded(), 0);
    }
}
