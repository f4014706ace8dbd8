//! Recording pipeline
//!
//! - `queue`: bounded per-track ingest queues that drop the oldest frame
//! - `session`: the session writer state machine
//! - `drain`: per-track loops that feed the writer as it becomes ready
//! - `coordinator`: the task owning the session, and the `Recorder` handle

pub mod coordinator;
pub mod drain;
pub mod metrics;
pub mod queue;
pub mod session;
pub mod state;

pub use coordinator::Recorder;
pub use metrics::{DropReason, MetricsSnapshot, TrackCounters};
pub use state::{
    AudioConfig, AudioFormat, ContainerKind, PipelineOptions, ProgressSnapshot, RecorderEvent,
    RecordingOutput, SessionConfig, SessionPhase, VideoCodec, VideoConfig,
};
