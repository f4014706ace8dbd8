//! Studio Recorder - real-time audio/video ingestion and container muxing.
//!
//! Frames arrive from capture sources through non-blocking sinks, wait in
//! bounded per-track queues, and are drained into a container writer as the
//! encoder becomes ready. A single task owns the session; `Recorder` is the
//! handle the owning service talks to.

pub mod media;
pub mod recorder;
pub mod source;
pub mod utils;
pub mod writer;

pub use media::{AudioFrame, MediaTime, PixelBuffer, PixelFormat, TrackKind, VideoFrame};
pub use recorder::{
    ContainerKind, MetricsSnapshot, PipelineOptions, ProgressSnapshot, Recorder, RecorderEvent,
    RecordingOutput, SessionConfig,
};
pub use source::FrameSink;
pub use utils::error::{RecorderError, RecorderResult};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Install the global tracing subscriber. `RUST_LOG` overrides the default filter.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "studio_recorder=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
