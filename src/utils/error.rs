//! Error types and handling
//!
//! Common error types used across the recorder.

use crate::media::{MediaTime, TrackKind};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors raised by a container writer backend
#[derive(Error, Debug)]
pub enum WriterError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Failed to start encoder: {0}")]
    Spawn(String),

    #[error("Writer is not in the writing state")]
    NotWriting,

    #[error("{0} input is not ready for more data")]
    NotReady(TrackKind),

    #[error("{0} track was not added to the writer")]
    MissingTrack(TrackKind),

    #[error("Cannot add {0} track after the writer stopped accepting data")]
    TrackAfterStop(TrackKind),

    #[error("Frame rejected: {0}")]
    Rejected(String),

    #[error("Frame at {0} falls on an already written frame slot")]
    Coalesced(MediaTime),

    #[error("Finalize failed: {0}")]
    Finish(String),
}

/// Errors surfaced by the recorder's control interface
#[derive(Error, Debug)]
pub enum RecorderError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Output location unusable: {0}")]
    OutputLocation(String),

    #[error("Writer error: {0}")]
    Writer(#[from] WriterError),

    #[error("Failed to add {0} track")]
    TrackSetup(TrackKind),

    #[error("Not currently recording")]
    NotRecording,

    #[error("No frames were received before finalize")]
    NoFramesReceived,

    #[error("Finalize failed: {0}")]
    FinalizeFailed(String),

    #[error("Recording was cancelled")]
    Cancelled,

    #[error("Recorder task is no longer running")]
    ActorGone,
}

/// Errors from the compositor's texture conversion collaborator
#[derive(Error, Debug)]
pub enum ConvertError {
    #[error("Texture unavailable: {0}")]
    Unavailable(String),

    #[error("Conversion failed: {0}")]
    Failed(String),
}

/// Errors from a frame source's lifecycle
#[derive(Error, Debug)]
pub enum SourceError {
    #[error("Source is already running")]
    AlreadyRunning,

    #[error("Source is not running")]
    NotRunning,

    #[error("Source unavailable: {0}")]
    Unavailable(String),
}

/// Error response for a presentation layer
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub code: String,
    pub message: String,
}

impl From<RecorderError> for ErrorResponse {
    fn from(error: RecorderError) -> Self {
        let code = match &error {
            RecorderError::Io(_) => "IO_ERROR",
            RecorderError::OutputLocation(_) => "OUTPUT_LOCATION",
            RecorderError::Writer(_) => "WRITER_ERROR",
            RecorderError::TrackSetup(_) => "TRACK_SETUP",
            RecorderError::NotRecording => "NOT_RECORDING",
            RecorderError::NoFramesReceived => "NO_FRAMES_RECEIVED",
            RecorderError::FinalizeFailed(_) => "FINALIZE_FAILED",
            RecorderError::Cancelled => "CANCELLED",
            RecorderError::ActorGone => "RECORDER_GONE",
        };

        ErrorResponse {
            code: code.to_string(),
            message: error.to_string(),
        }
    }
}

/// Result type alias using RecorderError
pub type RecorderResult<T> = Result<T, RecorderError>;

/// Result type alias using WriterError
pub type WriterResult<T> = Result<T, WriterError>;

/// Result type alias using SourceError
pub type SourceResult<T> = Result<T, SourceError>;
