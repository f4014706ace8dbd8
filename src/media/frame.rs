//! Frame types flowing through the recording pipeline

use super::time::MediaTime;
use serde::{Deserialize, Serialize};

/// Which track a frame belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Video,
    Audio,
}

impl TrackKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrackKind::Video => "video",
            TrackKind::Audio => "audio",
        }
    }
}

impl std::fmt::Display for TrackKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pixel layout of an image buffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Bgra,
    Rgba,
    /// Planar 4:2:0, Y plane followed by U and V
    Yuv420p,
}

impl PixelFormat {
    /// FFmpeg `-pixel_format` name
    pub fn ffmpeg_name(&self) -> &'static str {
        match self {
            PixelFormat::Bgra => "bgra",
            PixelFormat::Rgba => "rgba",
            PixelFormat::Yuv420p => "yuv420p",
        }
    }

    /// Size in bytes of one tightly packed image
    pub fn frame_size(&self, width: u32, height: u32) -> usize {
        let pixels = width as usize * height as usize;
        match self {
            PixelFormat::Bgra | PixelFormat::Rgba => pixels * 4,
            PixelFormat::Yuv420p => pixels + 2 * ((width as usize).div_ceil(2) * (height as usize).div_ceil(2)),
        }
    }
}

/// An owned, tightly packed image
#[derive(Debug, Clone)]
pub struct PixelBuffer {
    pub width: u32,
    pub height: u32,
    pub format: PixelFormat,
    pub data: Vec<u8>,
}

impl PixelBuffer {
    pub fn new(width: u32, height: u32, format: PixelFormat, data: Vec<u8>) -> Self {
        Self {
            width,
            height,
            format,
            data,
        }
    }

    /// A buffer filled with a single byte value
    pub fn filled(width: u32, height: u32, format: PixelFormat, value: u8) -> Self {
        let data = vec![value; format.frame_size(width, height)];
        Self::new(width, height, format, data)
    }

    /// Whether the data length matches the declared geometry
    pub fn is_valid(&self) -> bool {
        self.width > 0
            && self.height > 0
            && self.data.len() >= self.format.frame_size(self.width, self.height)
    }

    pub fn byte_len(&self) -> usize {
        self.data.len()
    }
}

/// A timestamped image
#[derive(Debug, Clone)]
pub struct VideoFrame {
    pub buffer: PixelBuffer,
    pub pts: MediaTime,
}

impl VideoFrame {
    pub fn new(buffer: PixelBuffer, pts: MediaTime) -> Self {
        Self { buffer, pts }
    }
}

/// A buffer of interleaved `f32` PCM samples carrying its own timestamp
#[derive(Debug, Clone)]
pub struct AudioFrame {
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    pub channels: u16,
    pub pts: MediaTime,
}

impl AudioFrame {
    pub fn new(samples: Vec<f32>, sample_rate: u32, channels: u16, pts: MediaTime) -> Self {
        Self {
            samples,
            sample_rate,
            channels,
            pts,
        }
    }

    /// Number of sample frames (samples per channel)
    pub fn frame_count(&self) -> usize {
        if self.channels == 0 {
            0
        } else {
            self.samples.len() / self.channels as usize
        }
    }

    pub fn duration(&self) -> MediaTime {
        MediaTime::new(self.frame_count() as i64, self.sample_rate as i32)
    }

    pub fn byte_len(&self) -> usize {
        self.samples.len() * std::mem::size_of::<f32>()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_size() {
        assert_eq!(PixelFormat::Bgra.frame_size(4, 2), 32);
        assert_eq!(PixelFormat::Yuv420p.frame_size(4, 2), 8 + 2 * 2);
        assert_eq!(PixelFormat::Yuv420p.frame_size(3, 3), 9 + 2 * 4);
    }

    #[test]
    fn test_pixel_buffer_validity() {
        assert!(PixelBuffer::filled(4, 4, PixelFormat::Rgba, 0).is_valid());
        assert!(!PixelBuffer::new(4, 4, PixelFormat::Rgba, vec![0; 10]).is_valid());
        assert!(!PixelBuffer::new(0, 4, PixelFormat::Rgba, vec![]).is_valid());
    }

    #[test]
    fn test_audio_frame_duration() {
        let frame = AudioFrame::new(vec![0.0; 960], 48_000, 2, MediaTime::ZERO);
        assert_eq!(frame.frame_count(), 480);
        assert_eq!(frame.duration(), MediaTime::new(1, 100));
        assert_eq!(frame.byte_len(), 3840);
    }
}
