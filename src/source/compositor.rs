//! Compositor adapter
//!
//! Rendered textures are converted into pixel buffers by an external
//! color-conversion collaborator, then handed on with the presentation time
//! the compositor supplies.

use super::traits::{FrameSink, FrameSource, SourceKind};
use crate::media::MediaTime;
use crate::media::PixelBuffer;
use crate::utils::error::{ConvertError, SourceError, SourceResult};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

/// Turns a rendered texture into CPU-side pixels
pub trait TextureConverter: Send + Sync {
    type Texture;

    fn convert(&self, texture: &Self::Texture) -> Result<PixelBuffer, ConvertError>;
}

pub struct CompositorAdapter<C: TextureConverter> {
    id: String,
    converter: C,
    sink: Arc<dyn FrameSink>,
    is_running: AtomicBool,
    forwarded: AtomicU64,
    conversion_failures: AtomicU64,
}

impl<C: TextureConverter> CompositorAdapter<C> {
    pub fn new(id: impl Into<String>, converter: C, sink: Arc<dyn FrameSink>) -> Self {
        Self {
            id: id.into(),
            converter,
            sink,
            is_running: AtomicBool::new(false),
            forwarded: AtomicU64::new(0),
            conversion_failures: AtomicU64::new(0),
        }
    }

    /// Convert a rendered texture and forward it at `pts`.
    ///
    /// Returns `Ok(false)` when the adapter is stopped and the texture was ignored.
    pub fn submit(&self, texture: &C::Texture, pts: MediaTime) -> Result<bool, ConvertError> {
        if !self.is_running.load(Ordering::SeqCst) {
            return Ok(false);
        }

        let buffer = self.converter.convert(texture).and_then(|buffer| {
            if buffer.is_valid() {
                Ok(buffer)
            } else {
                Err(ConvertError::Failed(format!(
                    "converter returned {} bytes for {}x{}",
                    buffer.data.len(),
                    buffer.width,
                    buffer.height
                )))
            }
        });
        let buffer = match buffer {
            Ok(buffer) => buffer,
            Err(e) => {
                self.conversion_failures.fetch_add(1, Ordering::Relaxed);
                tracing::debug!("{}: texture conversion failed: {}", self.id, e);
                return Err(e);
            }
        };

        self.sink.append_pixel_buffer(buffer, pts);
        self.forwarded.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    pub fn conversion_failures(&self) -> u64 {
        self.conversion_failures.load(Ordering::Relaxed)
    }
}

#[async_trait]
impl<C: TextureConverter> FrameSource for CompositorAdapter<C> {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Compositor
    }

    async fn start(&mut self) -> SourceResult<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(SourceError::AlreadyRunning);
        }
        Ok(())
    }

    async fn stop(&mut self) -> SourceResult<()> {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return Err(SourceError::NotRunning);
        }
        tracing::info!(
            "Compositor adapter {} stopped. Forwarded {} frames, {} conversion failures",
            self.id,
            self.frames_forwarded(),
            self.conversion_failures()
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
