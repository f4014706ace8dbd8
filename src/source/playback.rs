//! Playback adapter
//!
//! A secondary video (e.g. a file being played back) has no push callback,
//! so it is polled on a timer. Each tick maps the host clock into the item's
//! timeline, asks whether a new frame is available there, and forwards a copy
//! stamped with the host time so it lines up with live capture.

use super::traits::{FrameSink, FrameSource, HostClock, SourceKind};
use crate::media::{MediaTime, PixelBuffer};
use crate::utils::error::{SourceError, SourceResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;

/// A video output that must be polled for frames
pub trait PolledVideoSource: Send + 'static {
    /// Item time corresponding to `host` on the shared host clock
    fn item_time_for_host_time(&self, host: MediaTime) -> MediaTime;

    fn has_new_frame(&self, item_time: MediaTime) -> bool;

    /// Copy of the frame displayed at `item_time`
    fn copy_frame(&mut self, item_time: MediaTime) -> Option<PixelBuffer>;
}

/// Polls a `PolledVideoSource` and forwards its frames
pub struct PlaybackAdapter<P: PolledVideoSource> {
    id: String,
    source: Arc<Mutex<P>>,
    sink: Arc<dyn FrameSink>,
    clock: HostClock,
    poll_interval: Duration,
    is_running: Arc<AtomicBool>,
    forwarded: Arc<AtomicU64>,
    poll_handle: Option<JoinHandle<()>>,
}

impl<P: PolledVideoSource> PlaybackAdapter<P> {
    pub fn new(
        id: impl Into<String>,
        source: P,
        sink: Arc<dyn FrameSink>,
        clock: HostClock,
        fps: u32,
    ) -> Self {
        Self {
            id: id.into(),
            source: Arc::new(Mutex::new(source)),
            sink,
            clock,
            poll_interval: Duration::from_secs_f64(1.0 / fps.max(1) as f64),
            is_running: Arc::new(AtomicBool::new(false)),
            forwarded: Arc::new(AtomicU64::new(0)),
            poll_handle: None,
        }
    }
}

/// One poll: forward the frame at the item time for `host`, if there is a new one
fn poll_once<P: PolledVideoSource>(
    source: &Mutex<P>,
    sink: &dyn FrameSink,
    host: MediaTime,
    last_host: &mut Option<MediaTime>,
) -> bool {
    if last_host.is_some_and(|last| host <= last) {
        return false;
    }
    let buffer = {
        let mut source = source.lock();
        let item_time = source.item_time_for_host_time(host);
        if !source.has_new_frame(item_time) {
            return false;
        }
        source.copy_frame(item_time)
    };
    let Some(buffer) = buffer else {
        return false;
    };
    *last_host = Some(host);
    sink.append_pixel_buffer(buffer, host);
    true
}

#[async_trait]
impl<P: PolledVideoSource> FrameSource for PlaybackAdapter<P> {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> SourceKind {
        SourceKind::Playback
    }

    async fn start(&mut self) -> SourceResult<()> {
        if self.is_running.swap(true, Ordering::SeqCst) {
            return Err(SourceError::AlreadyRunning);
        }

        let is_running = self.is_running.clone();
        let source = self.source.clone();
        let sink = self.sink.clone();
        let clock = self.clock;
        let forwarded = self.forwarded.clone();
        let poll_interval = self.poll_interval;
        let id = self.id.clone();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(poll_interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            let mut last_host = None;
            while is_running.load(Ordering::SeqCst) {
                ticker.tick().await;
                if poll_once(&source, sink.as_ref(), clock.now(), &mut last_host) {
                    forwarded.fetch_add(1, Ordering::Relaxed);
                }
            }
            tracing::info!(
                "Playback adapter {} stopped. Forwarded {} frames",
                id,
                forwarded.load(Ordering::Relaxed)
            );
        });
        self.poll_handle = Some(handle);

        tracing::info!(
            "Playback adapter {} polling every {:?}",
            self.id,
            self.poll_interval
        );
        Ok(())
    }

    async fn stop(&mut self) -> SourceResult<()> {
        if !self.is_running.swap(false, Ordering::SeqCst) {
            return Err(SourceError::NotRunning);
        }
        if let Some(handle) = self.poll_handle.take() {
            let _ = handle.await;
        }
        Ok(())
    }

    fn is_running(&self) -> bool {
        self.is_running.load(Ordering::SeqCst)
    }

    fn frames_forwarded(&self) -> u64 {
        self.forwarded.load(Ordering::Relaxed)
    }
}

impl<P: PolledVideoSource> Drop for PlaybackAdapter<P> {
    fn drop(&mut self) {
        self.is_running.store(false, Ordering::SeqCst);
        if let Some(handle) = self.poll_handle.take() {
            handle.abort();
        }
    }
}
