//! FFmpeg-backed container writer
//!
//! Raw video frames are piped into an `ffmpeg` encoder process while audio
//! samples are spooled to a scratch PCM file. Closing the writer waits for
//! the encoder, then muxes both into the requested container.
//!
//! The encoder runs at the track's constant frame rate. Each frame lands on
//! the slot matching its pts relative to the time base; gaps are filled by
//! repeating the previous image and frames that land on an already written
//! slot are refused.

use super::{AudioTrackSettings, ContainerWriter, VideoTrackSettings, WriterFactory, WriterStatus};
use crate::media::{AudioFrame, MediaTime, TrackKind, VideoFrame};
use crate::recorder::state::ContainerKind;
use crate::utils::error::{WriterError, WriterResult};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStderr, ChildStdin, Command, Stdio};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::mpsc::{channel, Receiver, Sender};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::oneshot;
use tokio::time::Instant;

/// Frames allowed in flight between the recorder and the encoder thread
const PIPE_DEPTH: usize = 8;

/// Longest gap, in seconds, filled with repeated frames
const MAX_GAP_SECONDS: u64 = 10;

/// Default bound on each of the encoder wait and the mux when closing
const DEFAULT_FINISH_TIMEOUT: Duration = Duration::from_secs(30);

/// Wait for the writer thread after the encoder was killed
const KILL_GRACE: Duration = Duration::from_secs(2);

const ENCODER_POLL: Duration = Duration::from_millis(20);

/// Encoder log lines kept for error reports
const LOG_TAIL_LINES: usize = 20;
const LOG_LINE_MAX: usize = 1024;

const VIDEO_INTERMEDIATE: &str = "video.mkv";
const AUDIO_SPOOL: &str = "audio.f32le";

/// Maps presentation times onto a constant-rate frame grid
#[derive(Debug, Clone)]
pub struct SlotClock {
    origin: MediaTime,
    fps: u32,
    next_slot: u64,
    lead: f64,
}

/// Where a frame goes on the grid
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Repeat the previous image `pad` times, then write this one
    Write { pad: u64 },
    /// Slot already written
    Coalesce,
}

impl SlotClock {
    pub fn new(origin: MediaTime, fps: u32) -> Self {
        Self {
            origin,
            fps: fps.max(1),
            next_slot: 0,
            lead: 0.0,
        }
    }

    pub fn place(&mut self, pts: MediaTime) -> Placement {
        if self.next_slot == 0 {
            // The first frame opens the stream at slot zero; any distance from
            // the time base becomes a start offset applied at mux time.
            self.lead = pts.duration_since(self.origin).as_secs_f64();
            self.origin = pts;
            self.next_slot = 1;
            return Placement::Write { pad: 0 };
        }

        let offset = pts.duration_since(self.origin).as_secs_f64();
        let slot = (offset * self.fps as f64).round() as u64;
        if slot < self.next_slot {
            return Placement::Coalesce;
        }

        let max_pad = self.fps as u64 * MAX_GAP_SECONDS;
        let pad = (slot - self.next_slot).min(max_pad);
        self.next_slot = slot + 1;
        Placement::Write { pad }
    }

    pub fn slots_written(&self) -> u64 {
        self.next_slot
    }

    /// Seconds between the time base and the first frame
    pub fn lead(&self) -> f64 {
        self.lead
    }
}

/// Drop the samples of `frame` that play before `time_base`.
///
/// Returns where the remaining samples start and the samples themselves, or
/// `None` when the whole buffer ends before the time base.
fn trim_to_time_base(
    frame: &AudioFrame,
    time_base: MediaTime,
    sample_rate: u32,
) -> Option<(MediaTime, &[f32])> {
    let early = time_base.as_seconds() - frame.pts.as_seconds();
    if early <= 0.0 {
        return Some((frame.pts, frame.samples.as_slice()));
    }
    let channels = frame.channels.max(1) as usize;
    let skip = (early * sample_rate as f64).round() as usize * channels;
    if skip >= frame.samples.len() {
        return None;
    }
    Some((time_base, &frame.samples[skip..]))
}

/// Seconds from the time base to the first spooled audio sample
fn audio_start_offset(first_audio: Option<MediaTime>, time_base: Option<MediaTime>) -> f64 {
    match (first_audio, time_base) {
        (Some(first), Some(base)) => first.duration_since(base).as_secs_f64(),
        _ => 0.0,
    }
}

enum PipeCommand {
    Video { data: Vec<u8>, pad: u64 },
    Audio(Vec<u8>),
    /// Sinks for a track added after the session started
    Attach {
        video: Option<ChildStdin>,
        audio: Option<BufWriter<File>>,
    },
}

/// Arguments that quiet FFmpeg down to errors only
fn quiet_args() -> [String; 4] {
    [
        "-hide_banner".to_string(),
        "-nostats".to_string(),
        "-loglevel".to_string(),
        "error".to_string(),
    ]
}

/// Build the encoder arguments for the raw video pipe
pub fn encoder_args(settings: &VideoTrackSettings, output: &Path) -> Vec<String> {
    let mut args = vec!["-y".to_string()];
    args.extend(quiet_args());
    args.extend([
        "-f".to_string(),
        "rawvideo".to_string(),
        "-pixel_format".to_string(),
        settings.pixel_format.ffmpeg_name().to_string(),
        "-video_size".to_string(),
        format!("{}x{}", settings.width, settings.height),
        "-framerate".to_string(),
        settings.fps.to_string(),
        "-i".to_string(),
        "-".to_string(),
        "-c:v".to_string(),
        settings.codec.ffmpeg_encoder().to_string(),
        "-b:v".to_string(),
        settings.bitrate.to_string(),
        "-g".to_string(),
        (settings.fps * 2).to_string(),
        "-pix_fmt".to_string(),
        "yuv420p".to_string(),
    ]);

    if !settings.allow_frame_reordering {
        args.extend(["-bf".to_string(), "0".to_string()]);
    }

    args.push(output.to_string_lossy().to_string());
    args
}

/// Inputs available when muxing the final container
pub struct MuxInputs<'a> {
    pub video: Option<&'a Path>,
    pub audio: Option<(&'a Path, &'a AudioTrackSettings)>,
    /// Video start relative to the time base, in seconds
    pub video_offset: f64,
    /// Audio start relative to the time base, in seconds
    pub audio_offset: f64,
}

/// Build the arguments that mux the intermediate streams into the container
pub fn mux_args(inputs: &MuxInputs<'_>, container: ContainerKind, output: &Path) -> Vec<String> {
    let mut args = vec!["-y".to_string()];
    args.extend(quiet_args());
    let mut audio_index = 0;

    if let Some(video) = inputs.video {
        if inputs.video_offset > 0.0 {
            args.extend(["-itsoffset".to_string(), format!("{:.6}", inputs.video_offset)]);
        }
        args.extend(["-i".to_string(), video.to_string_lossy().to_string()]);
        audio_index = 1;
    }

    if let Some((audio, settings)) = inputs.audio {
        if inputs.audio_offset > 0.0 {
            args.extend(["-itsoffset".to_string(), format!("{:.6}", inputs.audio_offset)]);
        }
        args.extend([
            "-f".to_string(),
            "f32le".to_string(),
            "-ar".to_string(),
            settings.sample_rate.to_string(),
            "-ac".to_string(),
            settings.channels.to_string(),
            "-i".to_string(),
            audio.to_string_lossy().to_string(),
        ]);
    }

    if inputs.video.is_some() {
        args.extend([
            "-map".to_string(),
            "0:v".to_string(),
            "-c:v".to_string(),
            "copy".to_string(),
        ]);
    }

    if let Some((_, settings)) = inputs.audio {
        args.extend([
            "-map".to_string(),
            format!("{audio_index}:a"),
            "-c:a".to_string(),
            settings.format.ffmpeg_encoder().to_string(),
            "-b:a".to_string(),
            settings.bitrate.to_string(),
        ]);
    }

    if container.network_optimized() {
        args.extend(["-movflags".to_string(), "+faststart".to_string()]);
    }

    args.extend([
        "-f".to_string(),
        container.ffmpeg_format().to_string(),
        output.to_string_lossy().to_string(),
    ]);
    args
}

/// Check that `program -version` runs
fn program_available(program: &Path) -> bool {
    Command::new(program)
        .arg("-version")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}

/// Factory for `FfmpegWriter`s
#[derive(Debug, Clone)]
pub struct FfmpegWriterFactory {
    program: PathBuf,
    available: bool,
    finish_timeout: Duration,
}

impl FfmpegWriterFactory {
    /// Use the `ffmpeg` on PATH. Availability is checked once, here.
    pub fn new() -> Self {
        Self::with_program("ffmpeg")
    }

    pub fn with_program(program: impl Into<PathBuf>) -> Self {
        let program = program.into();
        let available = program_available(&program);
        if !available {
            tracing::warn!("FFmpeg not found at {:?}", program);
        }
        Self {
            program,
            available,
            finish_timeout: DEFAULT_FINISH_TIMEOUT,
        }
    }

    /// Bound the encoder wait and the mux when closing a writer
    pub fn with_finish_timeout(mut self, timeout: Duration) -> Self {
        self.finish_timeout = timeout;
        self
    }

    pub fn is_available(&self) -> bool {
        self.available
    }
}

impl Default for FfmpegWriterFactory {
    fn default() -> Self {
        Self::new()
    }
}

impl WriterFactory for FfmpegWriterFactory {
    fn create(
        &self,
        target: &Path,
        container: ContainerKind,
    ) -> WriterResult<Box<dyn ContainerWriter>> {
        if !self.available {
            return Err(WriterError::Spawn(
                "FFmpeg not found. Please install FFmpeg and add it to PATH.".to_string(),
            ));
        }
        Ok(Box::new(FfmpegWriter::new(
            target,
            container,
            self.program.clone(),
            self.finish_timeout,
        )?))
    }
}

/// Shared between the writer and its pipe thread
struct PipeState {
    status: Mutex<WriterStatus>,
    in_flight: AtomicUsize,
}

struct Pipe {
    tx: Sender<PipeCommand>,
    /// Resolved by the pipe thread once its sinks are flushed and closed
    done: oneshot::Receiver<std::io::Result<()>>,
}

type LogTail = Arc<Mutex<VecDeque<String>>>;

pub struct FfmpegWriter {
    program: PathBuf,
    finish_timeout: Duration,
    target: PathBuf,
    container: ContainerKind,
    scratch: TempDir,
    video: Option<VideoTrackSettings>,
    audio: Option<AudioTrackSettings>,
    clock: Option<SlotClock>,
    time_base: Option<MediaTime>,
    first_audio_pts: Option<MediaTime>,
    encoder: Option<Child>,
    encoder_log: LogTail,
    video_sink: Option<ChildStdin>,
    audio_sink: Option<BufWriter<File>>,
    pipe: Option<Pipe>,
    state: Arc<PipeState>,
    finished: Vec<TrackKind>,
}

impl FfmpegWriter {
    fn new(
        target: &Path,
        container: ContainerKind,
        program: PathBuf,
        finish_timeout: Duration,
    ) -> WriterResult<Self> {
        let parent = target
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let scratch = tempfile::Builder::new()
            .prefix(".studio-recorder-")
            .tempdir_in(parent)?;

        Ok(Self {
            program,
            finish_timeout,
            target: target.to_path_buf(),
            container,
            scratch,
            video: None,
            audio: None,
            clock: None,
            time_base: None,
            first_audio_pts: None,
            encoder: None,
            encoder_log: Arc::new(Mutex::new(VecDeque::new())),
            video_sink: None,
            audio_sink: None,
            pipe: None,
            state: Arc::new(PipeState {
                status: Mutex::new(WriterStatus::Unknown),
                in_flight: AtomicUsize::new(0),
            }),
            finished: Vec::new(),
        })
    }

    fn video_path(&self) -> PathBuf {
        self.scratch.path().join(VIDEO_INTERMEDIATE)
    }

    fn audio_path(&self) -> PathBuf {
        self.scratch.path().join(AUDIO_SPOOL)
    }

    fn set_status(&self, status: WriterStatus) {
        *self.state.status.lock() = status;
    }

    fn encoder_log_tail(&self) -> String {
        self.encoder_log
            .lock()
            .iter()
            .cloned()
            .collect::<Vec<_>>()
            .join("\n")
    }

    fn spawn_encoder(&mut self, settings: &VideoTrackSettings) -> WriterResult<()> {
        let args = encoder_args(settings, &self.video_path());
        tracing::info!(
            "Starting FFmpeg encoder: {}x{} @ {}fps ({})",
            settings.width,
            settings.height,
            settings.fps,
            settings.pixel_format.ffmpeg_name()
        );

        let mut process = Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| WriterError::Spawn(format!("Failed to start FFmpeg encoder: {}", e)))?;

        let stdin = match process.stdin.take() {
            Some(stdin) => stdin,
            None => {
                reap(process);
                return Err(WriterError::Spawn("Failed to capture FFmpeg stdin".to_string()));
            }
        };
        if let Some(stderr) = process.stderr.take() {
            drain_log(stderr, self.encoder_log.clone());
        }

        self.video_sink = Some(stdin);
        self.encoder = Some(process);
        Ok(())
    }

    fn open_audio_spool(&mut self) -> WriterResult<()> {
        let file = File::create(self.audio_path())?;
        self.audio_sink = Some(BufWriter::new(file));
        Ok(())
    }

    /// Hand the sinks to a dedicated thread so appends never block on the encoder
    fn start_pipe(&mut self) {
        let (tx, rx) = channel();
        let (done_tx, done) = oneshot::channel();
        let video = self.video_sink.take();
        let audio = self.audio_sink.take();
        let state = self.state.clone();
        let thread = std::thread::Builder::new()
            .name("ffmpeg-writer".to_string())
            .spawn(move || {
                let result = run_pipe(rx, video, audio, &state);
                let _ = done_tx.send(result);
            });

        match thread {
            Ok(_) => self.pipe = Some(Pipe { tx, done }),
            Err(e) => {
                tracing::error!("Failed to start writer thread: {}", e);
                self.set_status(WriterStatus::Failed);
            }
        }
    }

    /// Give sinks opened for a late track to the running pipe thread
    fn attach_sinks(&mut self) -> WriterResult<()> {
        let command = PipeCommand::Attach {
            video: self.video_sink.take(),
            audio: self.audio_sink.take(),
        };
        let pipe = self.pipe.as_ref().ok_or(WriterError::NotWriting)?;
        if pipe.tx.send(command).is_err() {
            self.set_status(WriterStatus::Failed);
            return Err(WriterError::NotWriting);
        }
        Ok(())
    }

    fn send(&self, kind: TrackKind, command: PipeCommand) -> WriterResult<()> {
        let pipe = self.pipe.as_ref().ok_or(WriterError::NotWriting)?;
        if self.state.in_flight.load(Ordering::SeqCst) >= PIPE_DEPTH {
            return Err(WriterError::NotReady(kind));
        }
        self.state.in_flight.fetch_add(1, Ordering::SeqCst);
        if pipe.tx.send(command).is_err() {
            self.state.in_flight.fetch_sub(1, Ordering::SeqCst);
            self.set_status(WriterStatus::Failed);
            return Err(WriterError::NotWriting);
        }
        Ok(())
    }

    fn ensure_writing(&self, kind: TrackKind) -> WriterResult<()> {
        if self.status() != WriterStatus::Writing {
            return Err(WriterError::NotWriting);
        }
        if self.finished.contains(&kind) {
            return Err(WriterError::Rejected(format!("{kind} input already finished")));
        }
        Ok(())
    }

    /// Close the pipe and wait for the writer thread to flush it
    async fn close_input(&mut self, deadline: Instant) -> bool {
        drop(self.video_sink.take());
        drop(self.audio_sink.take());
        let Some(Pipe { tx, mut done }) = self.pipe.take() else {
            return true;
        };
        drop(tx);

        let closed = tokio::time::timeout_at(deadline, &mut done).await;
        let result = match closed {
            Ok(result) => result,
            Err(_) => {
                tracing::warn!("FFmpeg encoder stopped taking input; killing it");
                if let Some(process) = self.encoder.as_mut() {
                    let _ = process.kill();
                }
                match tokio::time::timeout(KILL_GRACE, done).await {
                    Ok(result) => result,
                    Err(_) => {
                        tracing::error!("FFmpeg writer thread is stuck; abandoning it");
                        return false;
                    }
                }
            }
        };

        match result {
            Ok(Ok(())) => true,
            Ok(Err(_)) => false,
            Err(_) => {
                tracing::error!("FFmpeg writer thread exited without reporting");
                false
            }
        }
    }

    /// Wait for the encoder to exit, killing it at the deadline
    async fn wait_encoder(&mut self, deadline: Instant) -> bool {
        let Some(mut process) = self.encoder.take() else {
            return true;
        };
        loop {
            match process.try_wait() {
                Ok(Some(status)) if status.success() => return true,
                Ok(Some(status)) => {
                    tracing::warn!(
                        "FFmpeg encoder exited with status {}: {}",
                        status,
                        self.encoder_log_tail()
                    );
                    return false;
                }
                Ok(None) if Instant::now() >= deadline => {
                    tracing::warn!("FFmpeg encoder did not exit in time; killing it");
                    reap(process);
                    return false;
                }
                Ok(None) => tokio::time::sleep(ENCODER_POLL).await,
                Err(e) => {
                    tracing::error!("Failed to poll FFmpeg encoder: {}", e);
                    reap(process);
                    return false;
                }
            }
        }
    }
}

impl Drop for FfmpegWriter {
    fn drop(&mut self) {
        if let Some(process) = self.encoder.take() {
            reap(process);
        }
    }
}

/// Kill the process and collect its exit status off the caller's thread
fn reap(mut process: Child) {
    let _ = process.kill();
    let spawned = std::thread::Builder::new()
        .name("ffmpeg-reaper".to_string())
        .spawn(move || {
            let _ = process.wait();
        });
    if let Err(e) = spawned {
        tracing::warn!("Failed to reap FFmpeg process: {}", e);
    }
}

/// Read the encoder's log as it is written so the process never blocks on a full pipe
fn drain_log(stderr: ChildStderr, tail: LogTail) {
    let spawned = std::thread::Builder::new()
        .name("ffmpeg-log".to_string())
        .spawn(move || {
            let mut reader = BufReader::new(stderr);
            let mut line = Vec::new();
            loop {
                line.clear();
                match reader.read_until(b'\n', &mut line) {
                    Ok(0) | Err(_) => break,
                    Ok(_) => {
                        line.truncate(LOG_LINE_MAX);
                        let text = String::from_utf8_lossy(&line).trim_end().to_string();
                        if text.is_empty() {
                            continue;
                        }
                        tracing::debug!("ffmpeg: {}", text);
                        let mut tail = tail.lock();
                        if tail.len() == LOG_TAIL_LINES {
                            tail.pop_front();
                        }
                        tail.push_back(text);
                    }
                }
            }
        });
    if let Err(e) = spawned {
        tracing::warn!("Failed to start FFmpeg log reader: {}", e);
    }
}

fn run_pipe(
    rx: Receiver<PipeCommand>,
    mut video: Option<ChildStdin>,
    mut audio: Option<BufWriter<File>>,
    state: &PipeState,
) -> std::io::Result<()> {
    let mut last_frame: Option<Vec<u8>> = None;

    let result = (|| -> std::io::Result<()> {
        for command in rx.iter() {
            match command {
                PipeCommand::Video { data, pad } => {
                    let written = match video.as_mut() {
                        Some(stdin) => write_video(stdin, last_frame.as_deref(), &data, pad),
                        None => Ok(()),
                    };
                    state.in_flight.fetch_sub(1, Ordering::SeqCst);
                    written?;
                    last_frame = Some(data);
                }
                PipeCommand::Audio(bytes) => {
                    let written = match audio.as_mut() {
                        Some(file) => file.write_all(&bytes),
                        None => Ok(()),
                    };
                    state.in_flight.fetch_sub(1, Ordering::SeqCst);
                    written?;
                }
                PipeCommand::Attach {
                    video: new_video,
                    audio: new_audio,
                } => {
                    if new_video.is_some() {
                        video = new_video;
                    }
                    if new_audio.is_some() {
                        audio = new_audio;
                    }
                }
            }
        }
        if let Some(ref mut file) = audio {
            file.flush()?;
        }
        Ok(())
    })();

    if let Err(ref e) = result {
        tracing::error!("FFmpeg writer pipe failed: {}", e);
        *state.status.lock() = WriterStatus::Failed;
    }
    result
}

fn write_video(
    stdin: &mut ChildStdin,
    previous: Option<&[u8]>,
    data: &[u8],
    pad: u64,
) -> std::io::Result<()> {
    if let Some(previous) = previous {
        for _ in 0..pad {
            stdin.write_all(previous)?;
        }
    }
    stdin.write_all(data)
}

fn samples_to_bytes(samples: &[f32]) -> Vec<u8> {
    samples.iter().flat_map(|s| s.to_le_bytes()).collect()
}

#[async_trait]
impl ContainerWriter for FfmpegWriter {
    fn status(&self) -> WriterStatus {
        *self.state.status.lock()
    }

    fn add_video_track(&mut self, settings: VideoTrackSettings) -> WriterResult<()> {
        if !self.finished.is_empty() {
            return Err(WriterError::TrackAfterStop(TrackKind::Video));
        }
        if let Some(time_base) = self.time_base {
            self.spawn_encoder(&settings)?;
            self.clock = Some(SlotClock::new(time_base, settings.fps));
            self.video = Some(settings);
            return self.attach_sinks();
        }
        self.video = Some(settings);
        Ok(())
    }

    fn add_audio_track(&mut self, settings: AudioTrackSettings) -> WriterResult<()> {
        if !self.finished.is_empty() {
            return Err(WriterError::TrackAfterStop(TrackKind::Audio));
        }
        self.audio = Some(settings);
        if self.time_base.is_some() {
            self.open_audio_spool()?;
            return self.attach_sinks();
        }
        Ok(())
    }

    fn has_track(&self, kind: TrackKind) -> bool {
        match kind {
            TrackKind::Video => self.video.is_some(),
            TrackKind::Audio => self.audio.is_some(),
        }
    }

    fn start_session(&mut self, at: MediaTime) -> WriterResult<()> {
        if self.status() != WriterStatus::Unknown {
            return Err(WriterError::NotWriting);
        }
        if let Some(settings) = self.video.clone() {
            self.spawn_encoder(&settings)?;
            self.clock = Some(SlotClock::new(at, settings.fps));
        }
        if self.audio.is_some() {
            self.open_audio_spool()?;
        }
        self.time_base = Some(at);
        self.set_status(WriterStatus::Writing);
        self.start_pipe();
        Ok(())
    }

    fn is_ready(&self, kind: TrackKind) -> bool {
        self.status() == WriterStatus::Writing
            && self.pipe.is_some()
            && !self.finished.contains(&kind)
            && self.state.in_flight.load(Ordering::SeqCst) < PIPE_DEPTH
    }

    fn append_video(&mut self, frame: VideoFrame) -> WriterResult<()> {
        self.ensure_writing(TrackKind::Video)?;
        let settings = self
            .video
            .as_ref()
            .ok_or(WriterError::MissingTrack(TrackKind::Video))?;

        let expected = settings.pixel_format.frame_size(settings.width, settings.height);
        if frame.buffer.width != settings.width
            || frame.buffer.height != settings.height
            || frame.buffer.format != settings.pixel_format
            || frame.buffer.data.len() < expected
        {
            return Err(WriterError::Rejected(format!(
                "frame {}x{} does not match track {}x{}",
                frame.buffer.width, frame.buffer.height, settings.width, settings.height
            )));
        }

        let clock = self
            .clock
            .as_mut()
            .ok_or(WriterError::MissingTrack(TrackKind::Video))?;
        match clock.place(frame.pts) {
            Placement::Coalesce => Err(WriterError::Coalesced(frame.pts)),
            Placement::Write { pad } => {
                let mut data = frame.buffer.data;
                data.truncate(expected);
                self.send(TrackKind::Video, PipeCommand::Video { data, pad })
            }
        }
    }

    fn append_audio(&mut self, frame: AudioFrame) -> WriterResult<()> {
        self.ensure_writing(TrackKind::Audio)?;
        let track_rate = self
            .audio
            .as_ref()
            .map(|settings| settings.sample_rate)
            .ok_or(WriterError::MissingTrack(TrackKind::Audio))?;
        let time_base = self.time_base.ok_or(WriterError::NotWriting)?;
        let sample_rate = if frame.sample_rate > 0 {
            frame.sample_rate
        } else {
            track_rate
        };

        // Audio captured ahead of the first video frame is cut at the time base.
        let Some((start, samples)) = trim_to_time_base(&frame, time_base, sample_rate) else {
            return Err(WriterError::Rejected(format!(
                "audio at {} ends before the time base {}",
                frame.pts, time_base
            )));
        };
        self.send(TrackKind::Audio, PipeCommand::Audio(samples_to_bytes(samples)))?;
        if self.first_audio_pts.is_none() {
            self.first_audio_pts = Some(start);
        }
        Ok(())
    }

    fn mark_finished(&mut self, kind: TrackKind) {
        if !self.finished.contains(&kind) {
            self.finished.push(kind);
        }
    }

    fn is_stopped(&self) -> bool {
        !self.finished.is_empty()
    }

    async fn finish(mut self: Box<Self>) -> WriterResult<WriterStatus> {
        if self.status() != WriterStatus::Writing {
            self.cancel();
            return Ok(WriterStatus::Failed);
        }

        let deadline = Instant::now() + self.finish_timeout;
        let flushed = self.close_input(deadline).await;
        let encoded = self.wait_encoder(deadline).await;
        if !flushed || !encoded {
            self.set_status(WriterStatus::Failed);
            return Ok(WriterStatus::Failed);
        }

        let video_path = self.video_path();
        let audio_path = self.audio_path();
        let has_audio_data = self.audio.is_some()
            && std::fs::metadata(&audio_path).is_ok_and(|m| m.len() > 0);
        let inputs = MuxInputs {
            video: self.video.as_ref().map(|_| video_path.as_path()),
            audio: self
                .audio
                .as_ref()
                .filter(|_| has_audio_data)
                .map(|settings| (audio_path.as_path(), settings)),
            video_offset: self.clock.as_ref().map_or(0.0, SlotClock::lead),
            audio_offset: audio_start_offset(self.first_audio_pts, self.time_base),
        };
        let args = mux_args(&inputs, self.container, &self.target);
        tracing::info!("Muxing container: {:?}", args);

        let mux = tokio::process::Command::new(&self.program)
            .args(&args)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output();
        let output = match tokio::time::timeout(self.finish_timeout, mux).await {
            Ok(output) => {
                output.map_err(|e| WriterError::Finish(format!("Failed to run FFmpeg mux: {}", e)))?
            }
            Err(_) => {
                tracing::error!("FFmpeg mux did not finish within {:?}", self.finish_timeout);
                self.set_status(WriterStatus::Failed);
                return Ok(WriterStatus::Failed);
            }
        };

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            tracing::error!("FFmpeg mux failed: {}", stderr);
            self.set_status(WriterStatus::Failed);
            return Ok(WriterStatus::Failed);
        }

        if let Some(clock) = &self.clock {
            tracing::info!(
                "FFmpeg finished: {} video slots, output: {:?}",
                clock.slots_written(),
                self.target
            );
        }
        self.set_status(WriterStatus::Completed);
        Ok(WriterStatus::Completed)
    }

    fn cancel(mut self: Box<Self>) {
        self.set_status(WriterStatus::Cancelled);
        // Killing the encoder first unblocks a writer thread stuck on its stdin.
        if let Some(process) = self.encoder.take() {
            reap(process);
        }
        drop(self.video_sink.take());
        drop(self.pipe.take());
        if self.target.exists() {
            if let Err(e) = std::fs::remove_file(&self.target) {
                tracing::warn!("Failed to remove cancelled output {:?}: {}", self.target, e);
            }
        }
    }
}


/// Write an executable shell script standing in for `ffmpeg`
#[cfg(all(test, unix))]
pub(crate) fn stub_encoder(dir: &Path, body: &str) -> PathBuf {
    use std::os::unix::fs::PermissionsExt;

    let path = dir.join("ffmpeg-stub.sh");
    std::fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
    path
}
