//! Media primitives
//!
//! Timestamps and the two frame kinds handled by the recorder.

pub mod frame;
pub mod time;

pub use frame::{AudioFrame, PixelBuffer, PixelFormat, TrackKind, VideoFrame};
pub use time::MediaTime;
