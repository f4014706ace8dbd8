//! Frame source adapters
//!
//! Three origins feed the recorder:
//! - `live`: a push-based capture stream with native timestamps
//! - `playback`: a polled video output timed from the host clock
//! - `compositor`: rendered textures converted to pixel buffers

pub mod compositor;
pub mod live;
pub mod playback;
pub mod traits;

pub use compositor::{CompositorAdapter, TextureConverter};
pub use live::{CaptureSample, LiveCaptureAdapter};
pub use playback::{PlaybackAdapter, PolledVideoSource};
pub use traits::{FrameSink, FrameSource, HostClock, SourceKind};
