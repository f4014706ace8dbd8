//! Session writer
//!
//! Owns everything a single recording mutates: the container writer, the
//! per-track ingest queues, the time base, and the metrics. It is plain,
//! synchronous state; the coordinator task is its only owner, which is what
//! serializes every operation on it.
//!
//! Lifecycle: `Idle -> Starting -> Writing -> Finalizing -> {Completed | Cancelled | Failed}`.
//! Reaching a terminal phase drops all per-session state; the next `start`
//! begins from there as it would from `Idle`.

use super::metrics::{DropReason, Metrics, MetricsSnapshot};
use super::queue::{IngestQueue, PushOutcome};
use super::state::{ProgressSnapshot, RecorderEvent, RecordingOutput, SessionConfig, SessionPhase};
use crate::media::{AudioFrame, MediaTime, TrackKind, VideoFrame};
use crate::recorder::state::PipelineOptions;
use crate::utils::error::{RecorderError, RecorderResult, WriterError};
use crate::writer::{
    AudioTrackSettings, ContainerWriter, VideoTrackSettings, WriterFactory, WriterStatus,
};
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::broadcast;
use uuid::Uuid;

/// A frame waiting in an ingest queue
#[derive(Debug)]
pub struct Queued<T> {
    pub frame: T,
    pub enqueued_at: Instant,
}

/// Who owns the container writer right now
pub enum WriterState {
    /// Waiting for the first frame (or for a re-creation after a failure)
    NotCreated,
    Writing(Box<dyn ContainerWriter>),
    /// Handed to the finalize task
    Finalizing,
    Closed,
}

impl WriterState {
    fn name(&self) -> &'static str {
        match self {
            WriterState::NotCreated => "not-created",
            WriterState::Writing(_) => "writing",
            WriterState::Finalizing => "finalizing",
            WriterState::Closed => "closed",
        }
    }
}

impl std::fmt::Debug for WriterState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

/// Frame used to materialize a writer
enum FirstFrame<'a> {
    Video(&'a VideoFrame),
    Audio(&'a AudioFrame),
}

impl FirstFrame<'_> {
    fn pts(&self) -> MediaTime {
        match self {
            FirstFrame::Video(frame) => frame.pts,
            FirstFrame::Audio(frame) => frame.pts,
        }
    }
}

/// Result of one drain pass over a track
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DrainPass {
    pub written: usize,
    /// The writer input reported not ready during the pass
    pub not_ready: bool,
    pub remaining: usize,
    pub keep_draining: bool,
}

impl DrainPass {
    fn stop() -> Self {
        Self {
            written: 0,
            not_ready: false,
            remaining: 0,
            keep_draining: false,
        }
    }
}

/// Answer to a finalize request
#[derive(Debug)]
pub enum FinalizeStart {
    /// This request moved the session into `Finalizing`
    Begun { generation: u64, deadline: Instant },
    /// A finalize is already running
    InProgress,
}

/// Answer to closing the writer after the flush
pub enum CloseOutcome {
    /// Finish this writer, then report back through `complete_finalize`
    Finish(Box<dyn ContainerWriter>),
    /// Nothing was written; the writer was cancelled and the session torn down
    NoFrames,
    /// The session could not be closed
    Failed(RecorderError),
}

#[derive(Debug, Clone, Copy)]
struct FinalizeProgress {
    pending_at_start: usize,
    written_at_start: u64,
    deadline: Instant,
}

struct Session {
    id: Uuid,
    started_at: DateTime<Utc>,
    config: SessionConfig,
    output: PathBuf,
    writer: WriterState,
    time_base: Option<MediaTime>,
    accepting_new_frames: bool,
    draining_enabled: bool,
    audio_fallback: bool,
    last_video_pts: Option<MediaTime>,
    last_written_pts: Option<MediaTime>,
    /// Frames held by the current writer; lifetime totals live in `Metrics`
    video_in_writer: u64,
    audio_in_writer: u64,
    video_queue: IngestQueue<Queued<VideoFrame>>,
    audio_queue: IngestQueue<Queued<AudioFrame>>,
    finalize: Option<FinalizeProgress>,
}

impl Session {
    /// Track whose first frame defines the time base
    fn timing_authority(&self) -> TrackKind {
        if self.config.is_audio_only() || self.audio_fallback {
            TrackKind::Audio
        } else {
            TrackKind::Video
        }
    }

    fn queue_len(&self, kind: TrackKind) -> usize {
        match kind {
            TrackKind::Video => self.video_queue.len(),
            TrackKind::Audio => self.audio_queue.len(),
        }
    }

    fn pending(&self) -> usize {
        self.video_queue.len() + self.audio_queue.len()
    }

    fn frames_in_writer(&self) -> u64 {
        self.video_in_writer + self.audio_in_writer
    }

    fn writer_has_track(&self, kind: TrackKind) -> bool {
        match &self.writer {
            WriterState::Writing(writer) => writer.has_track(kind),
            _ => false,
        }
    }
}

/// The recorder's single owner of session state
pub struct SessionWriter {
    factory: Arc<dyn WriterFactory>,
    options: PipelineOptions,
    events: broadcast::Sender<RecorderEvent>,
    phase: SessionPhase,
    session: Option<Session>,
    metrics: Metrics,
    generation: u64,
    last_failure: Option<RecorderError>,
}

impl SessionWriter {
    pub fn new(
        factory: Arc<dyn WriterFactory>,
        options: PipelineOptions,
        events: broadcast::Sender<RecorderEvent>,
    ) -> Self {
        Self {
            factory,
            options,
            events,
            phase: SessionPhase::Idle,
            session: None,
            metrics: Metrics::new(),
            generation: 0,
            last_failure: None,
        }
    }

    fn emit(&self, event: RecorderEvent) {
        let _ = self.events.send(event);
    }

    pub fn phase(&self) -> SessionPhase {
        self.phase
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn time_base(&self) -> Option<MediaTime> {
        self.session.as_ref().and_then(|s| s.time_base)
    }

    /// Start a session. Returns `false` when one is already active.
    pub fn start(&mut self, config: SessionConfig) -> RecorderResult<bool> {
        if self.session.is_some() {
            tracing::debug!("start ignored: a session is already active");
            return Ok(false);
        }

        let output = config.output_path();
        prepare_output_location(&output)?;

        self.generation += 1;
        self.metrics = Metrics::new();
        self.last_failure = None;
        let capacity = self.options.queue_capacity;
        let session = Session {
            id: Uuid::new_v4(),
            started_at: Utc::now(),
            config,
            output,
            writer: WriterState::NotCreated,
            time_base: None,
            accepting_new_frames: true,
            draining_enabled: true,
            audio_fallback: false,
            last_video_pts: None,
            last_written_pts: None,
            video_in_writer: 0,
            audio_in_writer: 0,
            video_queue: IngestQueue::new(capacity),
            audio_queue: IngestQueue::new(capacity),
            finalize: None,
        };

        tracing::info!(
            "Recording session {} starting: {:?} ({}, audio-only: {})",
            session.id,
            session.output,
            session.config.container.file_type(),
            session.config.is_audio_only()
        );
        self.session = Some(session);
        self.phase = SessionPhase::Starting;
        self.emit(RecorderEvent::Started);
        Ok(true)
    }

    /// Admit a video frame into the queue
    pub fn ingest_video(&mut self, frame: VideoFrame, received_at: Instant) {
        self.metrics.record_received(TrackKind::Video);
        let Some(session) = self.session.as_mut() else {
            self.metrics.record_dropped(TrackKind::Video, DropReason::NotAccepting);
            return;
        };
        if !session.accepting_new_frames {
            self.metrics.record_dropped(TrackKind::Video, DropReason::NotAccepting);
            return;
        }

        if let Some(last) = session.last_video_pts {
            if frame.pts <= last {
                tracing::warn!(
                    "Dropping out-of-order video frame: pts {} is not after {}",
                    frame.pts,
                    last
                );
                self.metrics.record_dropped(TrackKind::Video, DropReason::NonMonotonic);
                return;
            }
        }
        session.last_video_pts = Some(frame.pts);

        let outcome = session.video_queue.push(Queued {
            frame,
            enqueued_at: received_at,
        });
        self.note_push(TrackKind::Video, outcome);
        self.ensure_writer_for(TrackKind::Video);
    }

    /// Admit an audio frame into the queue
    pub fn ingest_audio(&mut self, frame: AudioFrame, received_at: Instant) {
        self.metrics.record_received(TrackKind::Audio);
        let Some(session) = self.session.as_mut() else {
            self.metrics.record_dropped(TrackKind::Audio, DropReason::NotAccepting);
            return;
        };
        if !session.accepting_new_frames {
            self.metrics.record_dropped(TrackKind::Audio, DropReason::NotAccepting);
            return;
        }

        let outcome = session.audio_queue.push(Queued {
            frame,
            enqueued_at: received_at,
        });
        self.note_push(TrackKind::Audio, outcome);
        self.ensure_writer_for(TrackKind::Audio);
    }

    fn note_push(&mut self, kind: TrackKind, outcome: PushOutcome) {
        match outcome {
            PushOutcome::Queued => {}
            PushOutcome::QueuedDroppingOldest => {
                tracing::debug!("{} queue full, dropped oldest frame", kind);
                self.metrics.record_dropped(kind, DropReason::QueueOverflow);
            }
            PushOutcome::Closed => {
                self.metrics.record_dropped(kind, DropReason::NotAccepting);
            }
        }
    }

    /// Create the writer or attach a missing track after a frame of `kind` was queued
    fn ensure_writer_for(&mut self, kind: TrackKind) {
        let Some(session) = self.session.as_ref() else {
            return;
        };
        let needs_writer = matches!(session.writer, WriterState::NotCreated)
            && kind == session.timing_authority();
        let needs_track =
            matches!(&session.writer, WriterState::Writing(writer) if !writer.has_track(kind));

        if needs_writer {
            self.materialize_from_queue(kind);
        } else if needs_track {
            self.attach_late_track(kind);
        }
    }

    fn materialize_from_queue(&mut self, kind: TrackKind) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        let result = match kind {
            TrackKind::Video => match session.video_queue.peek().map(|q| q.frame.clone()) {
                Some(first) => self.materialize(&mut session, FirstFrame::Video(&first)),
                None => Ok(()),
            },
            TrackKind::Audio => match session.audio_queue.peek().map(|q| q.frame.clone()) {
                Some(first) => self.materialize(&mut session, FirstFrame::Audio(&first)),
                None => Ok(()),
            },
        };
        self.session = Some(session);

        if let Err(e) = result {
            self.fail_setup(e);
        }
    }

    /// `Starting -> Writing`: create the writer, add tracks, establish the time base
    fn materialize(&mut self, session: &mut Session, first: FirstFrame<'_>) -> RecorderResult<()> {
        let mut writer = self
            .factory
            .create(&session.output, session.config.container)?;
        if let Err(e) = configure_writer(writer.as_mut(), session, &first) {
            writer.cancel();
            return Err(e);
        }

        let time_base = first.pts();
        tracing::info!(
            "Writer created for session {}; time base established at {}",
            session.id,
            time_base
        );
        session.writer = WriterState::Writing(writer);
        session.time_base = Some(time_base);
        if self.phase == SessionPhase::Starting {
            self.phase = SessionPhase::Writing;
        }
        self.emit(RecorderEvent::WriterCreated);
        self.emit(RecorderEvent::TimeBaseEstablished(time_base));
        Ok(())
    }

    /// Add a track to the running writer for frames that showed up late
    fn attach_late_track(&mut self, kind: TrackKind) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        let WriterState::Writing(writer) = &mut session.writer else {
            return;
        };
        if writer.is_stopped() {
            tracing::debug!("Not attaching {} track: writer already stopped", kind);
            return;
        }

        let result = match kind {
            TrackKind::Video => {
                let observed = session.video_queue.peek().map(|q| &q.frame.buffer);
                writer.add_video_track(VideoTrackSettings::resolve(
                    session.config.video.as_ref(),
                    observed,
                ))
            }
            TrackKind::Audio => {
                let observed = session.audio_queue.peek().map(|q| &q.frame);
                writer.add_audio_track(AudioTrackSettings::resolve(
                    session.config.audio.as_ref(),
                    observed,
                ))
            }
        };

        match result {
            Ok(()) => {
                tracing::info!("Attached {} track to running writer", kind);
                self.emit(RecorderEvent::TrackAttached(kind));
            }
            Err(e) => {
                tracing::warn!("Failed to attach late {} track: {}", kind, e);
            }
        }
    }

    /// Abort the session after a setup error
    fn fail_setup(&mut self, error: RecorderError) {
        tracing::error!("Recording setup failed: {}", error);
        self.emit(RecorderEvent::Failed(error.to_string()));
        if let Some(session) = self.session.as_mut() {
            if let WriterState::Writing(writer) =
                std::mem::replace(&mut session.writer, WriterState::Closed)
            {
                writer.cancel();
            }
        }
        self.terminate(SessionPhase::Failed);
        self.last_failure = Some(error);
    }

    /// Whether a drain loop for `kind` should be running
    pub fn drain_wanted(&self, kind: TrackKind) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        if !session.writer_has_track(kind) {
            return false;
        }
        if kind == TrackKind::Audio && session.time_base.is_none() {
            return false;
        }
        self.should_keep_draining(kind, Instant::now())
    }

    fn should_keep_draining(&self, kind: TrackKind, now: Instant) -> bool {
        let Some(session) = self.session.as_ref() else {
            return false;
        };
        if !session.draining_enabled {
            return false;
        }
        if let Some(finalize) = session.finalize {
            if now >= finalize.deadline {
                return false;
            }
        }
        session.accepting_new_frames || session.queue_len(kind) > 0
    }

    /// Move queued frames of `kind` into the writer while it reports ready
    pub fn drain_pass(&mut self, kind: TrackKind, generation: u64) -> DrainPass {
        let now = Instant::now();
        if generation != self.generation || !self.should_keep_draining(kind, now) {
            return DrainPass::stop();
        }

        // Re-create a writer torn down after a failure, from the next queued frame.
        let needs_writer = self.session.as_ref().is_some_and(|s| {
            matches!(s.writer, WriterState::NotCreated) && kind == s.timing_authority()
        });
        if needs_writer {
            self.materialize_from_queue(kind);
        }

        let mut written = 0;
        let mut not_ready = false;
        let mut recovered = false;
        let max = self.options.max_frames_per_pass.max(1);

        if let Some(session) = self.session.as_mut() {
            let gated = kind == TrackKind::Audio && session.time_base.is_none();
            if let (WriterState::Writing(writer), false) = (&mut session.writer, gated) {
                while written < max {
                    if !writer.is_ready(kind) {
                        not_ready = true;
                        break;
                    }
                    let Some((bytes, pts, enqueued_at, result)) = (match kind {
                        TrackKind::Video => session.video_queue.pop().map(|q| {
                            let bytes = q.frame.buffer.byte_len();
                            let pts = q.frame.pts;
                            (bytes, pts, q.enqueued_at, writer.append_video(q.frame))
                        }),
                        TrackKind::Audio => session.audio_queue.pop().map(|q| {
                            let bytes = q.frame.byte_len();
                            let pts = q.frame.pts;
                            (bytes, pts, q.enqueued_at, writer.append_audio(q.frame))
                        }),
                    }) else {
                        break;
                    };

                    match result {
                        Ok(()) => {
                            written += 1;
                            self.metrics
                                .record_written(kind, bytes, enqueued_at.elapsed());
                            match kind {
                                TrackKind::Video => session.video_in_writer += 1,
                                TrackKind::Audio => session.audio_in_writer += 1,
                            }
                            if kind == TrackKind::Video
                                || session.config.is_audio_only()
                                || session.audio_fallback
                            {
                                session.last_written_pts = Some(pts);
                            }
                        }
                        Err(e) => {
                            self.metrics.record_dropped(kind, DropReason::AppendFailed);
                            if writer.status() == WriterStatus::Failed {
                                tracing::error!(
                                    "Writer entered failed state on {} append ({}); recreating",
                                    kind,
                                    e
                                );
                                recovered = true;
                                break;
                            }
                            tracing::debug!("{} append failed: {}", kind, e);
                        }
                    }
                }
            } else {
                not_ready = true;
            }
        }

        if recovered {
            self.recover_writer();
        }

        let remaining = self
            .session
            .as_ref()
            .map_or(0, |session| session.queue_len(kind));
        DrainPass {
            written,
            not_ready,
            remaining,
            keep_draining: self.should_keep_draining(kind, Instant::now()),
        }
    }

    /// Tear down a failed writer, keeping queues and metrics for re-creation
    fn recover_writer(&mut self) {
        let Some(session) = self.session.as_mut() else {
            return;
        };
        if let WriterState::Writing(writer) =
            std::mem::replace(&mut session.writer, WriterState::NotCreated)
        {
            writer.cancel();
        }
        session.time_base = None;
        session.last_written_pts = None;
        session.video_in_writer = 0;
        session.audio_in_writer = 0;
        if self.phase == SessionPhase::Writing {
            self.phase = SessionPhase::Starting;
        }
        self.emit(RecorderEvent::WriterRecovered);
    }

    /// `Writing -> Finalizing`: stop admitting frames and start the grace period
    pub fn begin_finalize(&mut self) -> RecorderResult<FinalizeStart> {
        let generation = self.generation;
        let timeout = self.options.finalize_timeout;
        let Some(session) = self.session.as_mut() else {
            return Err(self.last_failure.take().unwrap_or(RecorderError::NotRecording));
        };
        if session.finalize.is_some() {
            return Ok(FinalizeStart::InProgress);
        }

        session.accepting_new_frames = false;
        session.video_queue.stop();
        session.audio_queue.stop();
        let deadline = Instant::now() + timeout;
        session.finalize = Some(FinalizeProgress {
            pending_at_start: session.pending(),
            written_at_start: self.metrics.snapshot(0).total_written(),
            deadline,
        });

        // Video never arrived but audio did: write the audio rather than lose it.
        let fallback = matches!(session.writer, WriterState::NotCreated)
            && !session.config.is_audio_only()
            && session.video_queue.is_empty()
            && !session.audio_queue.is_empty();
        tracing::info!(
            "Finalizing session {}: {} frames queued (video {}, audio {})",
            session.id,
            session.pending(),
            session.video_queue.len(),
            session.audio_queue.len()
        );
        self.phase = SessionPhase::Finalizing;
        self.emit(RecorderEvent::Finalizing);

        if fallback {
            tracing::warn!("No video received; falling back to an audio-only container");
            if let Some(session) = self.session.as_mut() {
                session.audio_fallback = true;
            }
            self.materialize_from_queue(TrackKind::Audio);
            if self.session.is_none() {
                return Err(self.last_failure.take().unwrap_or(RecorderError::NotRecording));
            }
        }

        Ok(FinalizeStart::Begun {
            generation,
            deadline,
        })
    }

    /// Whether every queue that can still be drained is empty
    pub fn flush_complete(&self) -> bool {
        let Some(session) = self.session.as_ref() else {
            return true;
        };
        match &session.writer {
            WriterState::Writing(writer) => [TrackKind::Video, TrackKind::Audio]
                .into_iter()
                .all(|kind| !writer.has_track(kind) || session.queue_len(kind) == 0),
            // Without a writer only the timing track can bring one back.
            _ => session.queue_len(session.timing_authority()) == 0,
        }
    }

    /// Mark the inputs finished and hand the writer out for closing
    pub fn close_writer(&mut self, generation: u64) -> CloseOutcome {
        if generation != self.generation {
            return CloseOutcome::Failed(RecorderError::Cancelled);
        }
        let Some(session) = self.session.as_mut() else {
            return CloseOutcome::Failed(RecorderError::NotRecording);
        };
        session.draining_enabled = false;
        let written = session.frames_in_writer();

        let left = session.pending();
        if left > 0 {
            tracing::warn!("Finalize flush ended with {} frames unwritten", left);
        }

        let writer = std::mem::replace(&mut session.writer, WriterState::Finalizing);
        if written == 0 {
            tracing::warn!("No frames were written; cancelling writer");
            if let WriterState::Writing(writer) = writer {
                writer.cancel();
            }
            self.terminate(SessionPhase::Cancelled);
            self.emit(RecorderEvent::Cancelled);
            return CloseOutcome::NoFrames;
        }

        match writer {
            WriterState::Writing(mut writer) => {
                writer.mark_finished(TrackKind::Video);
                writer.mark_finished(TrackKind::Audio);
                CloseOutcome::Finish(writer)
            }
            other => {
                tracing::error!("Cannot finalize: writer is {}", other.name());
                self.terminate(SessionPhase::Failed);
                CloseOutcome::Failed(RecorderError::FinalizeFailed(format!(
                    "writer was {} at close",
                    other.name()
                )))
            }
        }
    }

    /// `Finalizing -> Completed | Failed` once the writer finished closing
    pub fn complete_finalize(
        &mut self,
        generation: u64,
        result: Result<WriterStatus, WriterError>,
    ) -> RecorderResult<RecordingOutput> {
        if generation != self.generation || self.session.is_none() {
            return Err(RecorderError::Cancelled);
        }
        let (output, video_frames, audio_frames, duration_ms) = match self.session.as_ref() {
            Some(session) => (
                session.output.clone(),
                session.video_in_writer,
                session.audio_in_writer,
                session_duration_ms(session),
            ),
            None => return Err(RecorderError::Cancelled),
        };

        match result {
            Ok(WriterStatus::Completed) => {
                tracing::info!(
                    "Recording complete: {:?} ({} video, {} audio frames, {:.0}ms)",
                    output,
                    video_frames,
                    audio_frames,
                    duration_ms
                );
                self.terminate(SessionPhase::Completed);
                self.emit(RecorderEvent::Completed(output.clone()));
                Ok(RecordingOutput {
                    path: output,
                    video_frames,
                    audio_frames,
                    duration_ms,
                })
            }
            Ok(status) => {
                let message = format!("writer finished with status {:?}", status);
                tracing::error!("Finalize failed: {}", message);
                self.terminate(SessionPhase::Failed);
                self.emit(RecorderEvent::Failed(message.clone()));
                Err(RecorderError::FinalizeFailed(message))
            }
            Err(e) => {
                tracing::error!("Finalize failed: {}", e);
                self.terminate(SessionPhase::Failed);
                self.emit(RecorderEvent::Failed(e.to_string()));
                Err(RecorderError::FinalizeFailed(e.to_string()))
            }
        }
    }

    /// Abandon the session without finalizing
    pub fn cancel(&mut self) -> bool {
        let Some(session) = self.session.as_mut() else {
            return false;
        };
        if let WriterState::Writing(writer) =
            std::mem::replace(&mut session.writer, WriterState::Closed)
        {
            writer.cancel();
        }
        tracing::info!("Recording session {} cancelled", session.id);
        self.terminate(SessionPhase::Cancelled);
        self.emit(RecorderEvent::Cancelled);
        true
    }

    /// Record the terminal phase and drop all per-session state
    fn terminate(&mut self, phase: SessionPhase) {
        debug_assert!(phase.is_terminal());
        tracing::debug!("Session reached {:?}; resetting", phase);
        self.phase = phase;
        self.session = None;
        // A new generation invalidates any drain loop still holding the old one.
        self.generation += 1;
    }

    pub fn progress(&self) -> ProgressSnapshot {
        let Some(session) = self.session.as_ref() else {
            return ProgressSnapshot {
                phase: self.phase,
                fraction: if self.phase == SessionPhase::Completed { 1.0 } else { 0.0 },
                video_written: self.metrics.written(TrackKind::Video),
                audio_written: self.metrics.written(TrackKind::Audio),
                ..ProgressSnapshot::idle()
            };
        };

        let video_written = self.metrics.written(TrackKind::Video);
        let audio_written = self.metrics.written(TrackKind::Audio);
        let fraction = match session.finalize {
            None => 0.0,
            Some(finalize) => {
                let flushed = (video_written + audio_written)
                    .saturating_sub(finalize.written_at_start) as f64;
                if finalize.pending_at_start == 0 {
                    0.99
                } else {
                    (flushed / finalize.pending_at_start as f64).min(0.99)
                }
            }
        };

        ProgressSnapshot {
            phase: self.phase,
            is_recording: self.phase.is_recording(),
            is_finalizing: session.finalize.is_some(),
            fraction,
            video_queue_depth: session.video_queue.len(),
            audio_queue_depth: session.audio_queue.len(),
            video_written,
            audio_written,
            session_id: Some(session.id),
            started_at: Some(session.started_at),
        }
    }

    pub fn metrics(&self, ingest_overflow: u64) -> MetricsSnapshot {
        self.metrics.snapshot(ingest_overflow)
    }
}

/// Add the tracks the first frame calls for and start the writer's session
fn configure_writer(
    writer: &mut dyn ContainerWriter,
    session: &Session,
    first: &FirstFrame<'_>,
) -> RecorderResult<()> {
    // An audio-authority writer only gets a video track once video shows up.
    let observed_video = match first {
        FirstFrame::Video(frame) => Some(&frame.buffer),
        FirstFrame::Audio(_) => session.video_queue.peek().map(|q| &q.frame.buffer),
    };
    if observed_video.is_some() {
        let settings = VideoTrackSettings::resolve(session.config.video.as_ref(), observed_video);
        writer
            .add_video_track(settings)
            .map_err(|_| RecorderError::TrackSetup(TrackKind::Video))?;
    }

    let observed_audio = match first {
        FirstFrame::Audio(frame) => Some(*frame),
        FirstFrame::Video(_) => session.audio_queue.peek().map(|q| &q.frame),
    };
    if session.config.audio.is_some() || observed_audio.is_some() {
        let settings = AudioTrackSettings::resolve(session.config.audio.as_ref(), observed_audio);
        writer
            .add_audio_track(settings)
            .map_err(|_| RecorderError::TrackSetup(TrackKind::Audio))?;
    }

    writer.start_session(first.pts())?;
    if writer.status() != WriterStatus::Writing {
        return Err(RecorderError::Writer(WriterError::NotWriting));
    }
    Ok(())
}

fn session_duration_ms(session: &Session) -> f64 {
    match (session.time_base, session.last_written_pts) {
        (Some(base), Some(last)) => last.duration_since(base).as_secs_f64() * 1000.0,
        _ => 0.0,
    }
}

/// Create parent directories and clear any existing file at the target
fn prepare_output_location(output: &Path) -> RecorderResult<()> {
    if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(|e| {
            RecorderError::OutputLocation(format!("cannot create {:?}: {}", parent, e))
        })?;
    }
    if output.is_dir() {
        return Err(RecorderError::OutputLocation(format!(
            "{:?} is a directory",
            output
        )));
    }
    if output.exists() {
        std::fs::remove_file(output).map_err(|e| {
            RecorderError::OutputLocation(format!("cannot replace {:?}: {}", output, e))
        })?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::{PixelBuffer, PixelFormat};
    use crate::recorder::state::{AudioConfig, ContainerKind, VideoConfig};
    use crate::writer::MemoryWriterFactory;

    fn video(pts_ms: i64) -> VideoFrame {
        VideoFrame::new(
            PixelBuffer::filled(16, 8, PixelFormat::Bgra, 0),
            MediaTime::new(pts_ms, 1000),
        )
    }

    fn audio(pts_ms: i64) -> AudioFrame {
        AudioFrame::new(vec![0.0; 960], 48_000, 2, MediaTime::new(pts_ms, 1000))
    }

    fn writer_with(factory: &MemoryWriterFactory) -> (SessionWriter, broadcast::Receiver<RecorderEvent>) {
        let (events, rx) = broadcast::channel(64);
        let writer = SessionWriter::new(
            Arc::new(factory.clone()),
            PipelineOptions::default(),
            events,
        );
        (writer, rx)
    }

    fn av_config(dir: &Path) -> SessionConfig {
        SessionConfig::new(dir.join("take.mov"), ContainerKind::Mov)
            .with_video(Some(VideoConfig::default()))
            .with_audio(Some(AudioConfig::default()))
    }

    fn drain_all(writer: &mut SessionWriter) {
        let generation = writer.generation();
        for _ in 0..16 {
            writer.drain_pass(TrackKind::Video, generation);
            writer.drain_pass(TrackKind::Audio, generation);
        }
    }

    #[test]
    fn test_second_start_is_a_no_op() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let (mut writer, _rx) = writer_with(&factory);

        assert!(writer.start(av_config(dir.path())).unwrap());
        let generation = writer.generation();
        assert!(!writer.start(av_config(dir.path())).unwrap());
        assert_eq!(writer.generation(), generation);
        assert_eq!(writer.phase(), SessionPhase::Starting);
    }

    #[test]
    fn test_start_replaces_existing_file_and_creates_parents() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("nested/deeper/take.mov");
        std::fs::create_dir_all(target.parent().unwrap()).unwrap();
        std::fs::write(&target, b"stale").unwrap();

        let factory = MemoryWriterFactory::new();
        let (mut writer, _rx) = writer_with(&factory);
        writer
            .start(SessionConfig::new(target.clone(), ContainerKind::Mov))
            .unwrap();
        assert!(!target.exists());
    }

    #[test]
    fn test_writer_is_created_by_first_video_frame() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let (mut writer, mut rx) = writer_with(&factory);
        writer.start(av_config(dir.path())).unwrap();
        assert_eq!(factory.writers_created(), 0);

        writer.ingest_video(video(500), Instant::now());
        assert_eq!(factory.writers_created(), 1);
        assert_eq!(writer.phase(), SessionPhase::Writing);
        assert_eq!(writer.time_base(), Some(MediaTime::new(500, 1000)));

        let recording = factory.last_recording().unwrap();
        let track = recording.video_track.unwrap();
        assert_eq!((track.width, track.height), (16, 8));
        assert!(recording.audio_track.is_some());

        assert_eq!(rx.try_recv().unwrap(), RecorderEvent::Started);
        assert_eq!(rx.try_recv().unwrap(), RecorderEvent::WriterCreated);
        assert_eq!(
            rx.try_recv().unwrap(),
            RecorderEvent::TimeBaseEstablished(MediaTime::new(500, 1000))
        );
    }

    #[test]
    fn test_audio_waits_for_video_time_base() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let (mut writer, _rx) = writer_with(&factory);
        writer.start(av_config(dir.path())).unwrap();

        writer.ingest_audio(audio(0), Instant::now());
        assert_eq!(factory.writers_created(), 0);
        assert!(!writer.drain_wanted(TrackKind::Audio));
        let pass = writer.drain_pass(TrackKind::Audio, writer.generation());
        assert_eq!(pass.written, 0);
        assert_eq!(pass.remaining, 1);

        writer.ingest_video(video(10), Instant::now());
        assert!(writer.drain_wanted(TrackKind::Audio));
        drain_all(&mut writer);

        let recording = factory.last_recording().unwrap();
        assert_eq!(recording.video_pts.len(), 1);
        assert_eq!(recording.audio_pts.len(), 1);
    }

    #[test]
    fn test_non_monotonic_video_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let (mut writer, _rx) = writer_with(&factory);
        writer.start(av_config(dir.path())).unwrap();

        writer.ingest_video(video(100), Instant::now());
        writer.ingest_video(video(100), Instant::now());
        writer.ingest_video(video(50), Instant::now());
        writer.ingest_video(video(133), Instant::now());
        drain_all(&mut writer);

        let metrics = writer.metrics(0);
        assert_eq!(metrics.non_monotonic_drops, 2);
        assert_eq!(metrics.video.written, 2);
        let pts = factory.last_recording().unwrap().video_pts;
        assert_eq!(pts, vec![MediaTime::new(100, 1000), MediaTime::new(133, 1000)]);
    }

    #[cfg(unix)]
    #[test]
    fn test_frames_on_written_slots_count_as_drops() {
        use crate::writer::ffmpeg::stub_encoder;
        use crate::writer::FfmpegWriterFactory;

        let dir = tempfile::tempdir().unwrap();
        let factory = FfmpegWriterFactory::with_program(stub_encoder(dir.path(), "cat > /dev/null"));
        let (events, _rx) = broadcast::channel(64);
        let mut writer = SessionWriter::new(Arc::new(factory), PipelineOptions::default(), events);
        writer.start(av_config(dir.path()).with_audio(None)).unwrap();

        // 30 fps grid: 10, 45 and 80 ms land on slots already taken
        for pts in [0, 10, 33, 45, 67, 80] {
            writer.ingest_video(video(pts), Instant::now());
        }
        drain_all(&mut writer);

        let metrics = writer.metrics(0);
        assert_eq!(metrics.video.written, 3);
        assert_eq!(metrics.video.dropped, 3);
        assert_eq!(metrics.append_failures, 3);
        assert!(writer.cancel());
    }

    #[test]
    fn test_not_ready_writer_keeps_frames_queued() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let (mut writer, _rx) = writer_with(&factory);
        writer.start(av_config(dir.path())).unwrap();
        factory.set_ready(TrackKind::Video, false);

        writer.ingest_video(video(0), Instant::now());
        writer.ingest_video(video(33), Instant::now());
        let pass = writer.drain_pass(TrackKind::Video, writer.generation());
        assert!(pass.not_ready);
        assert_eq!(pass.written, 0);
        assert_eq!(pass.remaining, 2);
        assert!(pass.keep_draining);

        factory.set_ready(TrackKind::Video, true);
        let pass = writer.drain_pass(TrackKind::Video, writer.generation());
        assert_eq!(pass.written, 2);
        assert_eq!(pass.remaining, 0);
    }

    #[test]
    fn test_stale_generation_stops_drain() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let (mut writer, _rx) = writer_with(&factory);
        writer.start(av_config(dir.path())).unwrap();
        writer.ingest_video(video(0), Instant::now());

        let pass = writer.drain_pass(TrackKind::Video, writer.generation() + 1);
        assert_eq!(pass, DrainPass::stop());
    }

    #[test]
    fn test_failed_writer_is_recreated_from_next_frame() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let (mut writer, mut rx) = writer_with(&factory);
        writer.start(av_config(dir.path())).unwrap();

        factory.fail_after_appends(1);
        for pts in [0, 33, 66] {
            writer.ingest_video(video(pts), Instant::now());
        }
        drain_all(&mut writer);

        assert_eq!(factory.writers_created(), 2);
        let recordings = factory.recordings();
        assert_eq!(recordings[0].status, WriterStatus::Cancelled);
        assert_eq!(recordings[1].session_start, Some(MediaTime::new(66, 1000)));
        assert_eq!(recordings[1].video_pts, vec![MediaTime::new(66, 1000)]);
        assert_eq!(writer.metrics(0).append_failures, 1);

        let events: Vec<_> = std::iter::from_fn(|| rx.try_recv().ok()).collect();
        assert!(events.contains(&RecorderEvent::WriterRecovered));
    }

    #[test]
    fn test_frames_lost_with_failed_writer_leave_nothing_to_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let (mut writer, _rx) = writer_with(&factory);
        writer.start(av_config(dir.path()).with_audio(None)).unwrap();

        factory.fail_after_appends(1);
        writer.ingest_video(video(0), Instant::now());
        writer.ingest_video(video(33), Instant::now());
        drain_all(&mut writer);
        assert_eq!(writer.metrics(0).video.written, 1);
        assert_eq!(factory.writers_created(), 1);

        let FinalizeStart::Begun { generation, .. } = writer.begin_finalize().unwrap() else {
            panic!("finalize should begin");
        };
        assert!(matches!(writer.close_writer(generation), CloseOutcome::NoFrames));
        assert_eq!(writer.phase(), SessionPhase::Cancelled);
    }

    #[test]
    fn test_finalize_without_frames_cancels() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let (mut writer, _rx) = writer_with(&factory);
        writer.start(av_config(dir.path())).unwrap();

        let FinalizeStart::Begun { generation, .. } = writer.begin_finalize().unwrap() else {
            panic!("finalize should begin");
        };
        assert!(writer.flush_complete());
        assert!(matches!(writer.close_writer(generation), CloseOutcome::NoFrames));
        assert_eq!(writer.phase(), SessionPhase::Cancelled);
        assert!(matches!(
            writer.begin_finalize(),
            Err(RecorderError::NotRecording)
        ));
    }

    #[test]
    fn test_finalize_rejects_new_frames_and_reports_progress() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let (mut writer, _rx) = writer_with(&factory);
        writer.start(av_config(dir.path())).unwrap();
        factory.set_ready(TrackKind::Video, false);
        for pts in [0, 33, 66, 100] {
            writer.ingest_video(video(pts), Instant::now());
        }

        let FinalizeStart::Begun { generation, .. } = writer.begin_finalize().unwrap() else {
            panic!("finalize should begin");
        };
        assert!(matches!(
            writer.begin_finalize(),
            Ok(FinalizeStart::InProgress)
        ));
        writer.ingest_video(video(133), Instant::now());
        assert_eq!(writer.metrics(0).video.dropped, 1);

        let progress = writer.progress();
        assert!(progress.is_finalizing);
        assert!(!progress.is_recording);
        assert_eq!(progress.fraction, 0.0);

        factory.set_ready(TrackKind::Video, true);
        let pass = writer.drain_pass(TrackKind::Video, generation);
        assert_eq!(pass.written, 4);
        assert!(!pass.keep_draining);
        assert_eq!(writer.progress().fraction, 0.99);

        let CloseOutcome::Finish(mut closing) = writer.close_writer(generation) else {
            panic!("writer should be handed out");
        };
        assert!(closing.is_stopped());
        closing.mark_finished(TrackKind::Video);
        let output = writer
            .complete_finalize(generation, Ok(WriterStatus::Completed))
            .unwrap();
        closing.cancel();
        assert_eq!(output.video_frames, 4);
        assert!((output.duration_ms - 100.0).abs() < 1e-6);

        let progress = writer.progress();
        assert_eq!(progress.phase, SessionPhase::Completed);
        assert_eq!(progress.fraction, 1.0);
    }

    #[test]
    fn test_audio_only_fallback_when_video_never_arrives() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let (mut writer, _rx) = writer_with(&factory);
        writer.start(av_config(dir.path())).unwrap();
        writer.ingest_audio(audio(0), Instant::now());
        writer.ingest_audio(audio(20), Instant::now());

        let FinalizeStart::Begun { generation, .. } = writer.begin_finalize().unwrap() else {
            panic!("finalize should begin");
        };
        assert_eq!(factory.writers_created(), 1);
        let recording = factory.last_recording().unwrap();
        assert!(recording.video_track.is_none());
        assert!(recording.audio_track.is_some());

        writer.drain_pass(TrackKind::Audio, generation);
        assert!(writer.flush_complete());
        assert!(matches!(
            writer.close_writer(generation),
            CloseOutcome::Finish(_)
        ));
    }

    #[test]
    fn test_setup_failure_is_reported_by_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        factory.fail_create(true);
        let (mut writer, _rx) = writer_with(&factory);
        writer.start(av_config(dir.path())).unwrap();

        writer.ingest_video(video(0), Instant::now());
        assert_eq!(writer.phase(), SessionPhase::Failed);
        assert!(matches!(
            writer.begin_finalize(),
            Err(RecorderError::Writer(WriterError::Spawn(_)))
        ));
    }

    #[test]
    fn test_cancel_removes_session() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let (mut writer, _rx) = writer_with(&factory);
        writer.start(av_config(dir.path())).unwrap();
        writer.ingest_video(video(0), Instant::now());

        assert!(writer.cancel());
        assert!(!writer.cancel());
        assert_eq!(writer.phase(), SessionPhase::Cancelled);
        assert_eq!(
            factory.last_recording().unwrap().status,
            WriterStatus::Cancelled
        );
    }
}
