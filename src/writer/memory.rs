//! In-memory container writer
//!
//! Records every track, timestamp, and lifecycle call instead of encoding.
//! Readiness, append rejection, and the final status can be scripted through
//! the factory, which keeps a handle on everything its writers did.

use super::{AudioTrackSettings, ContainerWriter, VideoTrackSettings, WriterFactory, WriterStatus};
use crate::media::{AudioFrame, MediaTime, TrackKind, VideoFrame};
use crate::recorder::state::ContainerKind;
use crate::utils::error::{WriterError, WriterResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Everything one writer was asked to do
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryRecording {
    pub target: PathBuf,
    pub container: ContainerKind,
    pub video_track: Option<VideoTrackSettings>,
    pub audio_track: Option<AudioTrackSettings>,
    /// Tracks added after the session started
    pub late_tracks: Vec<TrackKind>,
    pub session_start: Option<MediaTime>,
    pub video_pts: Vec<MediaTime>,
    pub audio_pts: Vec<MediaTime>,
    pub finished_tracks: Vec<TrackKind>,
    pub status: WriterStatus,
}

impl MemoryRecording {
    fn new(target: &Path, container: ContainerKind) -> Self {
        Self {
            target: target.to_path_buf(),
            container,
            video_track: None,
            audio_track: None,
            late_tracks: Vec::new(),
            session_start: None,
            video_pts: Vec::new(),
            audio_pts: Vec::new(),
            finished_tracks: Vec::new(),
            status: WriterStatus::Unknown,
        }
    }
}

#[derive(Debug)]
struct Script {
    video_ready: bool,
    audio_ready: bool,
    reject_appends: usize,
    fail_after_appends: Option<usize>,
    finish_status: WriterStatus,
    finish_delay: Duration,
    fail_create: bool,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            video_ready: true,
            audio_ready: true,
            reject_appends: 0,
            fail_after_appends: None,
            finish_status: WriterStatus::Completed,
            finish_delay: Duration::ZERO,
            fail_create: false,
        }
    }
}

#[derive(Debug, Default)]
struct Shared {
    script: Script,
    recordings: Vec<MemoryRecording>,
    appends: usize,
}

/// Factory for `MemoryWriter`s sharing one script and log
#[derive(Debug, Clone, Default)]
pub struct MemoryWriterFactory {
    shared: Arc<Mutex<Shared>>,
}

impl MemoryWriterFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_ready(&self, kind: TrackKind, ready: bool) {
        let mut shared = self.shared.lock();
        match kind {
            TrackKind::Video => shared.script.video_ready = ready,
            TrackKind::Audio => shared.script.audio_ready = ready,
        }
    }

    /// Reject the next `count` appends without failing the writer
    pub fn reject_next_appends(&self, count: usize) {
        self.shared.lock().script.reject_appends = count;
    }

    /// Put the writer into the failed state once `count` appends succeeded
    pub fn fail_after_appends(&self, count: usize) {
        let mut shared = self.shared.lock();
        shared.script.fail_after_appends = Some(shared.appends + count);
    }

    pub fn set_finish_status(&self, status: WriterStatus) {
        self.shared.lock().script.finish_status = status;
    }

    pub fn set_finish_delay(&self, delay: Duration) {
        self.shared.lock().script.finish_delay = delay;
    }

    pub fn fail_create(&self, fail: bool) {
        self.shared.lock().script.fail_create = fail;
    }

    /// Copies of every recording made so far, oldest first
    pub fn recordings(&self) -> Vec<MemoryRecording> {
        self.shared.lock().recordings.clone()
    }

    pub fn last_recording(&self) -> Option<MemoryRecording> {
        self.shared.lock().recordings.last().cloned()
    }

    pub fn writers_created(&self) -> usize {
        self.shared.lock().recordings.len()
    }
}

impl WriterFactory for MemoryWriterFactory {
    fn create(
        &self,
        target: &Path,
        container: ContainerKind,
    ) -> WriterResult<Box<dyn ContainerWriter>> {
        let mut shared = self.shared.lock();
        if shared.script.fail_create {
            return Err(WriterError::Spawn("scripted create failure".to_string()));
        }
        shared.recordings.push(MemoryRecording::new(target, container));
        let index = shared.recordings.len() - 1;
        Ok(Box::new(MemoryWriter {
            shared: self.shared.clone(),
            index,
        }))
    }
}

/// Writer that logs into its factory's shared state
pub struct MemoryWriter {
    shared: Arc<Mutex<Shared>>,
    index: usize,
}

impl MemoryWriter {
    fn with_recording<R>(&self, f: impl FnOnce(&mut MemoryRecording) -> R) -> R {
        let mut shared = self.shared.lock();
        f(&mut shared.recordings[self.index])
    }

    fn check_append(&self, kind: TrackKind) -> WriterResult<()> {
        let mut shared = self.shared.lock();
        let index = self.index;
        let recording = &shared.recordings[index];
        if recording.status != WriterStatus::Writing {
            return Err(WriterError::NotWriting);
        }
        let has_track = match kind {
            TrackKind::Video => recording.video_track.is_some(),
            TrackKind::Audio => recording.audio_track.is_some(),
        };
        if !has_track {
            return Err(WriterError::MissingTrack(kind));
        }
        if recording.finished_tracks.contains(&kind) {
            return Err(WriterError::Rejected(format!("{kind} input already finished")));
        }
        if shared.script.reject_appends > 0 {
            shared.script.reject_appends -= 1;
            return Err(WriterError::Rejected("scripted rejection".to_string()));
        }
        if shared
            .script
            .fail_after_appends
            .is_some_and(|limit| shared.appends >= limit)
        {
            shared.script.fail_after_appends = None;
            shared.recordings[index].status = WriterStatus::Failed;
            return Err(WriterError::NotWriting);
        }
        shared.appends += 1;
        Ok(())
    }

    fn add_track(&mut self, kind: TrackKind, add: impl FnOnce(&mut MemoryRecording)) -> WriterResult<()> {
        self.with_recording(|recording| {
            if !recording.finished_tracks.is_empty() {
                return Err(WriterError::TrackAfterStop(kind));
            }
            if recording.status == WriterStatus::Writing {
                recording.late_tracks.push(kind);
            }
            add(recording);
            Ok(())
        })
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Manifest<'a> {
    container: ContainerKind,
    video_frames: usize,
    audio_frames: usize,
    session_start: Option<MediaTime>,
    late_tracks: &'a [TrackKind],
}

#[async_trait]
impl ContainerWriter for MemoryWriter {
    fn status(&self) -> WriterStatus {
        self.with_recording(|recording| recording.status)
    }

    fn add_video_track(&mut self, settings: VideoTrackSettings) -> WriterResult<()> {
        self.add_track(TrackKind::Video, |recording| {
            recording.video_track = Some(settings)
        })
    }

    fn add_audio_track(&mut self, settings: AudioTrackSettings) -> WriterResult<()> {
        self.add_track(TrackKind::Audio, |recording| {
            recording.audio_track = Some(settings)
        })
    }

    fn has_track(&self, kind: TrackKind) -> bool {
        self.with_recording(|recording| match kind {
            TrackKind::Video => recording.video_track.is_some(),
            TrackKind::Audio => recording.audio_track.is_some(),
        })
    }

    fn start_session(&mut self, at: MediaTime) -> WriterResult<()> {
        self.with_recording(|recording| {
            if recording.status != WriterStatus::Unknown {
                return Err(WriterError::NotWriting);
            }
            recording.session_start = Some(at);
            recording.status = WriterStatus::Writing;
            Ok(())
        })
    }

    fn is_ready(&self, kind: TrackKind) -> bool {
        let shared = self.shared.lock();
        let recording = &shared.recordings[self.index];
        if recording.status != WriterStatus::Writing || recording.finished_tracks.contains(&kind) {
            return false;
        }
        match kind {
            TrackKind::Video => shared.script.video_ready,
            TrackKind::Audio => shared.script.audio_ready,
        }
    }

    fn append_video(&mut self, frame: VideoFrame) -> WriterResult<()> {
        self.check_append(TrackKind::Video)?;
        self.with_recording(|recording| recording.video_pts.push(frame.pts));
        Ok(())
    }

    fn append_audio(&mut self, frame: AudioFrame) -> WriterResult<()> {
        self.check_append(TrackKind::Audio)?;
        self.with_recording(|recording| recording.audio_pts.push(frame.pts));
        Ok(())
    }

    fn mark_finished(&mut self, kind: TrackKind) {
        self.with_recording(|recording| {
            if !recording.finished_tracks.contains(&kind) {
                recording.finished_tracks.push(kind);
            }
        })
    }

    fn is_stopped(&self) -> bool {
        self.with_recording(|recording| !recording.finished_tracks.is_empty())
    }

    async fn finish(self: Box<Self>) -> WriterResult<WriterStatus> {
        let delay = self.shared.lock().script.finish_delay;
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let (status, target, manifest) = {
            let mut shared = self.shared.lock();
            let scripted = shared.script.finish_status;
            let recording = &mut shared.recordings[self.index];
            let status = if recording.status == WriterStatus::Writing {
                scripted
            } else {
                WriterStatus::Failed
            };
            recording.status = status;
            let manifest = serde_json::to_vec_pretty(&Manifest {
                container: recording.container,
                video_frames: recording.video_pts.len(),
                audio_frames: recording.audio_pts.len(),
                session_start: recording.session_start,
                late_tracks: &recording.late_tracks,
            })
            .map_err(|e| WriterError::Finish(e.to_string()))?;
            (status, recording.target.clone(), manifest)
        };

        if status == WriterStatus::Completed {
            tokio::fs::write(&target, manifest).await?;
        }
        Ok(status)
    }

    fn cancel(self: Box<Self>) {
        let target = self.with_recording(|recording| {
            recording.status = WriterStatus::Cancelled;
            recording.target.clone()
        });
        if target.exists() {
            if let Err(e) = std::fs::remove_file(&target) {
                tracing::warn!("Failed to remove cancelled output {:?}: {}", target, e);
            }
        }
    }
}
