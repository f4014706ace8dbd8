//! Recording coordinator
//!
//! A single task owns the `SessionWriter`; the cloneable `Recorder` handle
//! talks to it over channels. Control calls are commands with a oneshot
//! reply. Frames travel on a separate bounded channel that producers feed
//! with `try_send`, so a capture callback never waits on the recorder.

use super::drain::{run_drain_loop, Backoff};
use super::metrics::MetricsSnapshot;
use super::session::{CloseOutcome, DrainPass, FinalizeStart, SessionWriter};
use super::state::{
    PipelineOptions, ProgressSnapshot, RecorderEvent, RecordingOutput, SessionConfig,
};
use crate::media::{AudioFrame, MediaTime, PixelBuffer, TrackKind, VideoFrame};
use crate::source::FrameSink;
use crate::utils::error::{RecorderError, RecorderResult, WriterError};
use crate::writer::{ContainerWriter, WriterFactory, WriterStatus};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{broadcast, mpsc, oneshot};
use tokio::task::JoinHandle;

const COMMAND_CHANNEL_CAPACITY: usize = 64;

/// Requests handled by the recorder task
pub(crate) enum Command {
    Start {
        config: SessionConfig,
        reply: oneshot::Sender<RecorderResult<()>>,
    },
    StopAndFinalize {
        reply: oneshot::Sender<RecorderResult<RecordingOutput>>,
    },
    Cancel {
        reply: oneshot::Sender<bool>,
    },
    Progress {
        reply: oneshot::Sender<ProgressSnapshot>,
    },
    Metrics {
        reply: oneshot::Sender<MetricsSnapshot>,
    },
    DrainPass {
        kind: TrackKind,
        generation: u64,
        reply: oneshot::Sender<DrainPass>,
    },
    FlushComplete {
        reply: oneshot::Sender<bool>,
    },
    CloseWriter {
        generation: u64,
        reply: oneshot::Sender<Option<Box<dyn ContainerWriter>>>,
    },
    CompleteFinalize {
        generation: u64,
        result: Result<WriterStatus, WriterError>,
    },
}

/// A frame on its way to the recorder task
enum Ingest {
    Video(VideoFrame, Instant),
    Audio(AudioFrame, Instant),
}

/// Handle to a running recorder
///
/// Clones share one recorder. Dropping the last handle cancels any session
/// still in progress.
#[derive(Clone)]
pub struct Recorder {
    commands: mpsc::Sender<Command>,
    frames: mpsc::Sender<Ingest>,
    events: broadcast::Sender<RecorderEvent>,
    ingest_overflow: Arc<AtomicU64>,
}

impl Recorder {
    /// Spawn the recorder task on the current tokio runtime
    pub fn spawn(factory: Arc<dyn WriterFactory>, options: PipelineOptions) -> Self {
        let (commands, commands_rx) = mpsc::channel(COMMAND_CHANNEL_CAPACITY);
        let (frames, frames_rx) = mpsc::channel(options.ingest_channel_capacity.max(1));
        let (events, _) = broadcast::channel(options.event_channel_capacity.max(1));
        let ingest_overflow = Arc::new(AtomicU64::new(0));

        let actor = RecorderActor {
            session: SessionWriter::new(factory, options.clone(), events.clone()),
            backoff: Backoff::from(&options),
            weak_commands: commands.downgrade(),
            commands: commands_rx,
            frames: frames_rx,
            frames_open: true,
            ingest_overflow: ingest_overflow.clone(),
            video_drain: None,
            audio_drain: None,
            finalize_task: None,
            waiters: Vec::new(),
        };
        tokio::spawn(actor.run());

        Self {
            commands,
            frames,
            events,
            ingest_overflow,
        }
    }

    async fn request<T>(&self, make: impl FnOnce(oneshot::Sender<T>) -> Command) -> RecorderResult<T> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(make(reply))
            .await
            .map_err(|_| RecorderError::ActorGone)?;
        rx.await.map_err(|_| RecorderError::ActorGone)
    }

    /// Begin a recording session. A second call while one is active is a no-op.
    pub async fn start(&self, config: SessionConfig) -> RecorderResult<()> {
        self.request(|reply| Command::Start { config, reply }).await?
    }

    /// Stop admitting frames, flush the queues, and close the container.
    ///
    /// Concurrent callers all receive the outcome of the same finalize.
    pub async fn stop_and_finalize(&self) -> RecorderResult<RecordingOutput> {
        self.request(|reply| Command::StopAndFinalize { reply }).await?
    }

    /// Abandon the session without producing a file. Returns whether one was active.
    pub async fn cancel(&self) -> RecorderResult<bool> {
        self.request(|reply| Command::Cancel { reply }).await
    }

    pub async fn progress(&self) -> RecorderResult<ProgressSnapshot> {
        self.request(|reply| Command::Progress { reply }).await
    }

    pub async fn metrics(&self) -> RecorderResult<MetricsSnapshot> {
        self.request(|reply| Command::Metrics { reply }).await
    }

    /// Subscribe to recording events
    pub fn subscribe(&self) -> broadcast::Receiver<RecorderEvent> {
        self.events.subscribe()
    }

    fn offer(&self, frame: Ingest) {
        match self.frames.try_send(frame) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.ingest_overflow.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                tracing::trace!("Recorder task gone; dropping frame");
            }
        }
    }
}

impl FrameSink for Recorder {
    fn append_video(&self, frame: VideoFrame) {
        self.offer(Ingest::Video(frame, Instant::now()));
    }

    fn append_audio(&self, frame: AudioFrame) {
        self.offer(Ingest::Audio(frame, Instant::now()));
    }

    fn append_pixel_buffer(&self, buffer: PixelBuffer, pts: MediaTime) {
        self.append_video(VideoFrame::new(buffer, pts));
    }
}

type FinalizeWaiter = oneshot::Sender<RecorderResult<RecordingOutput>>;

struct RecorderActor {
    session: SessionWriter,
    backoff: Backoff,
    weak_commands: mpsc::WeakSender<Command>,
    commands: mpsc::Receiver<Command>,
    frames: mpsc::Receiver<Ingest>,
    frames_open: bool,
    ingest_overflow: Arc<AtomicU64>,
    video_drain: Option<JoinHandle<()>>,
    audio_drain: Option<JoinHandle<()>>,
    finalize_task: Option<JoinHandle<()>>,
    waiters: Vec<FinalizeWaiter>,
}

impl RecorderActor {
    async fn run(mut self) {
        tracing::debug!("Recorder task started");
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(command) => self.handle_command(command),
                    None => break,
                },
                frame = self.frames.recv(), if self.frames_open => match frame {
                    Some(frame) => self.ingest(frame),
                    None => self.frames_open = false,
                },
            }
            self.ensure_drains();
        }
        self.shutdown();
    }

    fn ingest(&mut self, frame: Ingest) {
        match frame {
            Ingest::Video(frame, at) => self.session.ingest_video(frame, at),
            Ingest::Audio(frame, at) => self.session.ingest_audio(frame, at),
        }
    }

    /// Admit everything producers sent before the current command
    fn ingest_pending(&mut self) {
        while let Ok(frame) = self.frames.try_recv() {
            self.ingest(frame);
        }
    }

    fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { config, reply } => {
                self.ingest_pending();
                let result = self.session.start(config);
                if matches!(result, Ok(true)) {
                    self.ingest_overflow.store(0, Ordering::Relaxed);
                }
                let _ = reply.send(result.map(|_| ()));
            }
            Command::StopAndFinalize { reply } => {
                self.ingest_pending();
                self.begin_finalize(reply);
            }
            Command::Cancel { reply } => {
                self.ingest_pending();
                let cancelled = self.session.cancel();
                if let Some(task) = self.finalize_task.take() {
                    task.abort();
                }
                self.resolve_waiters(Err(RecorderError::Cancelled));
                let _ = reply.send(cancelled);
            }
            Command::Progress { reply } => {
                self.ingest_pending();
                let _ = reply.send(self.session.progress());
            }
            Command::Metrics { reply } => {
                self.ingest_pending();
                let overflow = self.ingest_overflow.load(Ordering::Relaxed);
                let _ = reply.send(self.session.metrics(overflow));
            }
            Command::DrainPass {
                kind,
                generation,
                reply,
            } => {
                let _ = reply.send(self.session.drain_pass(kind, generation));
            }
            Command::FlushComplete { reply } => {
                let _ = reply.send(self.session.flush_complete());
            }
            Command::CloseWriter { generation, reply } => {
                let writer = match self.session.close_writer(generation) {
                    CloseOutcome::Finish(writer) => Some(writer),
                    CloseOutcome::NoFrames => {
                        self.finalize_task = None;
                        self.resolve_waiters(Err(RecorderError::NoFramesReceived));
                        None
                    }
                    CloseOutcome::Failed(e) => {
                        self.finalize_task = None;
                        self.resolve_waiters(Err(e));
                        None
                    }
                };
                let _ = reply.send(writer);
            }
            Command::CompleteFinalize { generation, result } => {
                let outcome = self.session.complete_finalize(generation, result);
                self.finalize_task = None;
                self.resolve_waiters(outcome);
            }
        }
    }

    fn begin_finalize(&mut self, reply: FinalizeWaiter) {
        match self.session.begin_finalize() {
            Ok(FinalizeStart::Begun {
                generation,
                deadline,
            }) => {
                self.waiters.push(reply);
                let commands = self.weak_commands.clone();
                let poll = self.backoff.idle;
                self.finalize_task = Some(tokio::spawn(run_finalize(
                    commands, generation, deadline, poll,
                )));
            }
            Ok(FinalizeStart::InProgress) => self.waiters.push(reply),
            Err(e) => {
                let _ = reply.send(Err(e));
            }
        }
    }

    fn resolve_waiters(&mut self, result: RecorderResult<RecordingOutput>) {
        let waiters = std::mem::take(&mut self.waiters);
        if waiters.is_empty() {
            return;
        }
        tracing::debug!("Resolving {} finalize waiter(s)", waiters.len());
        for waiter in waiters {
            let _ = waiter.send(share_result(&result));
        }
    }

    /// Spawn drain loops for tracks that have work and no live loop
    fn ensure_drains(&mut self) {
        for kind in [TrackKind::Video, TrackKind::Audio] {
            let slot = match kind {
                TrackKind::Video => &mut self.video_drain,
                TrackKind::Audio => &mut self.audio_drain,
            };
            if slot.as_ref().is_some_and(|handle| !handle.is_finished()) {
                continue;
            }
            if !self.session.drain_wanted(kind) {
                continue;
            }
            let generation = self.session.generation();
            *slot = Some(tokio::spawn(run_drain_loop(
                kind,
                generation,
                self.weak_commands.clone(),
                self.backoff,
            )));
        }
    }

    fn shutdown(&mut self) {
        tracing::debug!("Recorder handles dropped; shutting down");
        if self.session.cancel() {
            tracing::info!("Cancelled recording left open at shutdown");
        }
        for handle in [
            self.video_drain.take(),
            self.audio_drain.take(),
            self.finalize_task.take(),
        ]
        .into_iter()
        .flatten()
        {
            handle.abort();
        }
        self.resolve_waiters(Err(RecorderError::Cancelled));
    }
}

/// Wait for the flush or the deadline, then close the writer
async fn run_finalize(
    commands: mpsc::WeakSender<Command>,
    generation: u64,
    deadline: Instant,
    poll: std::time::Duration,
) {
    loop {
        let Some(flushed) = send_command(&commands, |reply| Command::FlushComplete { reply }).await
        else {
            return;
        };
        if flushed {
            break;
        }
        if Instant::now() >= deadline {
            tracing::warn!("Finalize flush timed out; closing with frames unwritten");
            break;
        }
        tokio::time::sleep(poll).await;
    }

    let Some(writer) = send_command(&commands, |reply| Command::CloseWriter { generation, reply })
        .await
        .flatten()
    else {
        return;
    };

    let result = writer.finish().await;
    if let Some(tx) = commands.upgrade() {
        let _ = tx
            .send(Command::CompleteFinalize { generation, result })
            .await;
    }
}

async fn send_command<T>(
    commands: &mpsc::WeakSender<Command>,
    make: impl FnOnce(oneshot::Sender<T>) -> Command,
) -> Option<T> {
    let tx = commands.upgrade()?;
    let (reply, rx) = oneshot::channel();
    tx.send(make(reply)).await.ok()?;
    drop(tx);
    rx.await.ok()
}

/// Copy a finalize outcome for each waiter
fn share_result(result: &RecorderResult<RecordingOutput>) -> RecorderResult<RecordingOutput> {
    match result {
        Ok(output) => Ok(output.clone()),
        Err(RecorderError::NoFramesReceived) => Err(RecorderError::NoFramesReceived),
        Err(RecorderError::Cancelled) => Err(RecorderError::Cancelled),
        Err(RecorderError::NotRecording) => Err(RecorderError::NotRecording),
        Err(RecorderError::FinalizeFailed(message)) => {
            Err(RecorderError::FinalizeFailed(message.clone()))
        }
        Err(e) => Err(RecorderError::FinalizeFailed(e.to_string())),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::PixelFormat;
    use crate::recorder::state::{ContainerKind, SessionPhase};
    use crate::writer::MemoryWriterFactory;
    use std::path::Path;
    use std::time::Duration;

    fn spawn_with(factory: &MemoryWriterFactory, options: PipelineOptions) -> Recorder {
        Recorder::spawn(Arc::new(factory.clone()), options)
    }

    fn config(dir: &Path) -> SessionConfig {
        SessionConfig::new(dir.join("take.mov"), ContainerKind::Mov)
    }

    fn video(pts: i64) -> VideoFrame {
        VideoFrame::new(
            PixelBuffer::filled(32, 16, PixelFormat::Bgra, 7),
            MediaTime::new(pts, 30),
        )
    }

    fn audio(pts: i64) -> AudioFrame {
        AudioFrame::new(vec![0.1; 3200], 48_000, 2, MediaTime::new(pts, 48_000))
    }

    async fn wait_until(recorder: &Recorder, cond: impl Fn(&ProgressSnapshot) -> bool) {
        for _ in 0..400 {
            if cond(&recorder.progress().await.unwrap()) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("recorder never reached the expected state");
    }

    fn drain_events(rx: &mut broadcast::Receiver<RecorderEvent>) -> Vec<RecorderEvent> {
        std::iter::from_fn(|| rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn test_records_thirty_video_frames() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let recorder = spawn_with(&factory, PipelineOptions::default());
        let mut events = recorder.subscribe();

        recorder.start(config(dir.path())).await.unwrap();
        for pts in 0..30 {
            recorder.append_video(video(pts));
        }
        let output = recorder.stop_and_finalize().await.unwrap();

        assert_eq!(output.path, dir.path().join("take.mov"));
        assert_eq!(output.video_frames, 30);
        assert!((output.duration_ms - 29_000.0 / 30.0).abs() < 1e-3);

        let metrics = recorder.metrics().await.unwrap();
        assert_eq!(metrics.video.written, 30);
        assert_eq!(metrics.video.dropped, 0);

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&output.path).unwrap()).unwrap();
        assert_eq!(manifest["videoFrames"], 30);

        let events = drain_events(&mut events);
        assert_eq!(events.first(), Some(&RecorderEvent::Started));
        assert!(events.contains(&RecorderEvent::WriterCreated));
        assert!(events.contains(&RecorderEvent::TimeBaseEstablished(MediaTime::new(0, 30))));
        assert!(events.contains(&RecorderEvent::Finalizing));
        assert_eq!(events.last(), Some(&RecorderEvent::Completed(output.path)));

        let progress = recorder.progress().await.unwrap();
        assert_eq!(progress.phase, SessionPhase::Completed);
        assert_eq!(progress.fraction, 1.0);
    }

    #[tokio::test]
    async fn test_audio_is_held_until_video_arrives() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let recorder = spawn_with(&factory, PipelineOptions::default());
        recorder.start(config(dir.path())).await.unwrap();

        recorder.append_audio(audio(0));
        tokio::time::sleep(Duration::from_millis(20)).await;
        let progress = recorder.progress().await.unwrap();
        assert_eq!(progress.audio_queue_depth, 1);
        assert_eq!(progress.audio_written, 0);
        assert_eq!(factory.writers_created(), 0);

        recorder.append_video(video(1));
        wait_until(&recorder, |p| p.audio_written == 1 && p.video_written == 1).await;

        let output = recorder.stop_and_finalize().await.unwrap();
        assert_eq!((output.video_frames, output.audio_frames), (1, 1));
    }

    #[tokio::test]
    async fn test_out_of_order_video_is_dropped() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let recorder = spawn_with(&factory, PipelineOptions::default());
        recorder.start(config(dir.path())).await.unwrap();

        recorder.append_video(video(10));
        recorder.append_video(video(5));
        let output = recorder.stop_and_finalize().await.unwrap();

        assert_eq!(output.video_frames, 1);
        let metrics = recorder.metrics().await.unwrap();
        assert_eq!(metrics.video.dropped, 1);
        assert_eq!(metrics.non_monotonic_drops, 1);
        assert_eq!(
            factory.last_recording().unwrap().video_pts,
            vec![MediaTime::new(10, 30)]
        );
    }

    #[tokio::test]
    async fn test_stop_without_frames_reports_no_frames() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let recorder = spawn_with(&factory, PipelineOptions::default());
        let mut events = recorder.subscribe();
        recorder.start(config(dir.path())).await.unwrap();

        let result = recorder.stop_and_finalize().await;
        assert!(matches!(result, Err(RecorderError::NoFramesReceived)));
        assert!(!dir.path().join("take.mov").exists());
        assert!(drain_events(&mut events).contains(&RecorderEvent::Cancelled));

        assert!(matches!(
            recorder.stop_and_finalize().await,
            Err(RecorderError::NotRecording)
        ));
    }

    #[tokio::test]
    async fn test_second_start_keeps_first_configuration() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let recorder = spawn_with(&factory, PipelineOptions::default());

        recorder
            .start(SessionConfig::new(dir.path().join("first"), ContainerKind::Mp4))
            .await
            .unwrap();
        recorder
            .start(SessionConfig::new(dir.path().join("second"), ContainerKind::Mov))
            .await
            .unwrap();
        recorder.append_video(video(0));
        let output = recorder.stop_and_finalize().await.unwrap();

        assert_eq!(output.path, dir.path().join("first.mp4"));
        assert_eq!(factory.writers_created(), 1);
        assert_eq!(factory.last_recording().unwrap().container, ContainerKind::Mp4);
    }

    #[tokio::test]
    async fn test_concurrent_stops_share_one_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        factory.set_finish_delay(Duration::from_millis(50));
        let recorder = spawn_with(&factory, PipelineOptions::default());
        let other = recorder.clone();
        recorder.start(config(dir.path())).await.unwrap();
        for pts in 0..5 {
            recorder.append_video(video(pts));
        }

        let (first, second) = tokio::join!(recorder.stop_and_finalize(), other.stop_and_finalize());
        let (first, second) = (first.unwrap(), second.unwrap());
        assert_eq!(first.path, second.path);
        assert_eq!(first.video_frames, 5);
        assert_eq!(factory.writers_created(), 1);
    }

    #[tokio::test]
    async fn test_overflow_keeps_newest_frames() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        factory.set_ready(TrackKind::Video, false);
        let options = PipelineOptions {
            queue_capacity: 4,
            ..PipelineOptions::default()
        };
        let recorder = spawn_with(&factory, options);
        recorder.start(config(dir.path())).await.unwrap();

        for pts in 0..10 {
            recorder.append_video(video(pts));
        }
        let metrics = recorder.metrics().await.unwrap();
        assert_eq!(metrics.overflow_drops, 6);
        assert_eq!(metrics.video.dropped, 6);
        assert_eq!(recorder.progress().await.unwrap().video_queue_depth, 4);

        factory.set_ready(TrackKind::Video, true);
        let output = recorder.stop_and_finalize().await.unwrap();
        assert_eq!(output.video_frames, 4);
        let expected: Vec<_> = (6..10).map(|pts| MediaTime::new(pts, 30)).collect();
        assert_eq!(factory.last_recording().unwrap().video_pts, expected);
    }

    #[tokio::test]
    async fn test_full_ingest_channel_counts_overflow() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let options = PipelineOptions {
            ingest_channel_capacity: 1,
            ..PipelineOptions::default()
        };
        let recorder = spawn_with(&factory, options);
        recorder.start(config(dir.path())).await.unwrap();

        // Nothing yields in between, so the recorder task cannot empty the channel.
        for pts in 0..10 {
            recorder.append_video(video(pts));
        }
        let metrics = recorder.metrics().await.unwrap();
        assert_eq!(metrics.ingest_overflow, 9);
        assert_eq!(metrics.video.received, 1);
    }

    #[tokio::test]
    async fn test_ingest_overflow_resets_for_new_session() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let options = PipelineOptions {
            ingest_channel_capacity: 1,
            ..PipelineOptions::default()
        };
        let recorder = spawn_with(&factory, options);
        recorder.start(config(dir.path())).await.unwrap();
        for pts in 0..5 {
            recorder.append_video(video(pts));
        }
        assert_eq!(recorder.metrics().await.unwrap().ingest_overflow, 4);
        assert!(recorder.cancel().await.unwrap());

        recorder.start(config(dir.path())).await.unwrap();
        let metrics = recorder.metrics().await.unwrap();
        assert_eq!(metrics.ingest_overflow, 0);
        assert_eq!(metrics.video.received, 0);
    }

    #[tokio::test]
    async fn test_late_audio_track_is_attached() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let recorder = spawn_with(&factory, PipelineOptions::default());
        let mut events = recorder.subscribe();
        recorder
            .start(config(dir.path()).with_audio(None))
            .await
            .unwrap();

        recorder.append_video(video(0));
        recorder.append_audio(audio(0));
        recorder.append_video(video(1));
        let output = recorder.stop_and_finalize().await.unwrap();

        assert_eq!((output.video_frames, output.audio_frames), (2, 1));
        let recording = factory.last_recording().unwrap();
        assert_eq!(recording.late_tracks, vec![TrackKind::Audio]);
        assert!(drain_events(&mut events).contains(&RecorderEvent::TrackAttached(TrackKind::Audio)));
    }

    #[tokio::test]
    async fn test_audio_only_session() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let recorder = spawn_with(&factory, PipelineOptions::default());
        recorder
            .start(config(dir.path()).with_video(None))
            .await
            .unwrap();

        for i in 0..3 {
            recorder.append_audio(audio(i * 1600));
        }
        let output = recorder.stop_and_finalize().await.unwrap();

        assert_eq!((output.video_frames, output.audio_frames), (0, 3));
        let recording = factory.last_recording().unwrap();
        assert!(recording.video_track.is_none());
        assert_eq!(recording.session_start, Some(MediaTime::new(0, 48_000)));
    }

    #[tokio::test]
    async fn test_finalize_timeout_leaves_backlog_unwritten() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let options = PipelineOptions {
            finalize_timeout: Duration::from_millis(100),
            ..PipelineOptions::default()
        };
        let recorder = spawn_with(&factory, options);
        recorder.start(config(dir.path())).await.unwrap();

        for pts in 0..3 {
            recorder.append_video(video(pts));
        }
        wait_until(&recorder, |p| p.video_written == 3).await;
        factory.set_ready(TrackKind::Video, false);
        for pts in 3..6 {
            recorder.append_video(video(pts));
        }

        let started = Instant::now();
        let output = recorder.stop_and_finalize().await.unwrap();
        assert!(started.elapsed() < Duration::from_secs(5));
        assert_eq!(output.video_frames, 3);
    }

    #[tokio::test]
    async fn test_failed_finish_is_reported() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        factory.set_finish_status(WriterStatus::Failed);
        let recorder = spawn_with(&factory, PipelineOptions::default());
        let mut events = recorder.subscribe();
        recorder.start(config(dir.path())).await.unwrap();
        recorder.append_video(video(0));

        let result = recorder.stop_and_finalize().await;
        assert!(matches!(result, Err(RecorderError::FinalizeFailed(_))));
        assert!(drain_events(&mut events)
            .iter()
            .any(|event| matches!(event, RecorderEvent::Failed(_))));
        assert_eq!(recorder.progress().await.unwrap().phase, SessionPhase::Failed);
    }

    #[tokio::test]
    async fn test_cancel_discards_recording() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let recorder = spawn_with(&factory, PipelineOptions::default());
        let mut events = recorder.subscribe();
        recorder.start(config(dir.path())).await.unwrap();
        recorder.append_video(video(0));
        wait_until(&recorder, |p| p.video_written == 1).await;

        assert!(recorder.cancel().await.unwrap());
        assert!(!recorder.cancel().await.unwrap());
        assert_eq!(
            factory.last_recording().unwrap().status,
            WriterStatus::Cancelled
        );
        assert!(drain_events(&mut events).contains(&RecorderEvent::Cancelled));
        assert!(matches!(
            recorder.stop_and_finalize().await,
            Err(RecorderError::NotRecording)
        ));
    }

    #[tokio::test]
    async fn test_dropping_handles_cancels_session() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let recorder = spawn_with(&factory, PipelineOptions::default());
        recorder.start(config(dir.path())).await.unwrap();
        recorder.append_video(video(0));
        wait_until(&recorder, |p| p.video_written == 1).await;

        drop(recorder);
        for _ in 0..200 {
            if factory.last_recording().unwrap().status == WriterStatus::Cancelled {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("writer was not cancelled after the recorder was dropped");
    }

    #[tokio::test]
    async fn test_recorder_recovers_after_writer_failure() {
        let dir = tempfile::tempdir().unwrap();
        let factory = MemoryWriterFactory::new();
        let recorder = spawn_with(&factory, PipelineOptions::default());
        recorder.start(config(dir.path())).await.unwrap();

        recorder.append_video(video(0));
        wait_until(&recorder, |p| p.video_written == 1).await;
        factory.fail_after_appends(0);
        recorder.append_video(video(1));
        recorder.append_video(video(2));
        let output = recorder.stop_and_finalize().await.unwrap();

        assert_eq!(factory.writers_created(), 2);
        // Only what the surviving writer holds; the failed one was discarded.
        assert_eq!(output.video_frames, 1);
        assert_eq!(recorder.metrics().await.unwrap().video.written, 2);
        let recording = factory.last_recording().unwrap();
        assert_eq!(recording.session_start, Some(MediaTime::new(2, 30)));
        assert_eq!(recording.video_pts, vec![MediaTime::new(2, 30)]);
    }
}
