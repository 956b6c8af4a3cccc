use std::fmt::{Display, Formatter};

use bytes::Bytes;
use serde::Deserialize;

use crate::pool::DeviceBuffer;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PixelFormat {
    Yuv420p,
    Nv12,
    Bgr24,
    Rgb24,
}

impl PixelFormat {
    pub fn planes(&self) -> usize {
        match self {
            PixelFormat::Yuv420p => 3,
            PixelFormat::Nv12 => 2,
            PixelFormat::Bgr24 | PixelFormat::Rgb24 => 1,
        }
    }

    /// Bytes in one row of `plane` for a picture `width` pixels wide.
    pub fn plane_row_bytes(&self, plane: usize, width: u32) -> usize {
        let width = width as usize;
        match (self, plane) {
            (PixelFormat::Yuv420p, 0) => width,
            (PixelFormat::Yuv420p, _) => width.div_ceil(2),
            (PixelFormat::Nv12, 0) => width,
            (PixelFormat::Nv12, _) => width.div_ceil(2) * 2,
            (PixelFormat::Bgr24 | PixelFormat::Rgb24, _) => width * 3,
        }
    }

    pub fn plane_rows(&self, plane: usize, height: u32) -> usize {
        let height = height as usize;
        match (self, plane) {
            (PixelFormat::Yuv420p | PixelFormat::Nv12, p) if p > 0 => height.div_ceil(2),
            _ => height,
        }
    }

    /// Tightly packed size of one picture, all planes back to back.
    pub fn frame_bytes(&self, width: u32, height: u32) -> usize {
        (0..self.planes())
            .map(|p| self.plane_row_bytes(p, width) * self.plane_rows(p, height))
            .sum()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SampleFormat {
    /// Interleaved signed 16-bit.
    S16,
    /// Planar signed 16-bit.
    S16p,
    /// Interleaved 32-bit float.
    Flt,
    /// Planar 32-bit float.
    Fltp,
}

impl SampleFormat {
    pub fn bytes_per_sample(&self) -> usize {
        match self {
            SampleFormat::S16 | SampleFormat::S16p => 2,
            SampleFormat::Flt | SampleFormat::Fltp => 4,
        }
    }

    pub fn is_planar(&self) -> bool {
        matches!(self, SampleFormat::S16p | SampleFormat::Fltp)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct VideoFormat {
    pub pixel: PixelFormat,
    pub width: u32,
    pub height: u32,
}

impl VideoFormat {
    pub fn frame_bytes(&self) -> usize {
        self.pixel.frame_bytes(self.width, self.height)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
pub struct AudioFormat {
    pub sample: SampleFormat,
    pub channels: u16,
    pub rate: u32,
}

impl AudioFormat {
    /// Bytes needed for `samples` samples per channel, all planes included.
    pub fn buffer_bytes(&self, samples: usize) -> usize {
        samples * self.sample.bytes_per_sample() * self.channels as usize
    }
}

impl Default for AudioFormat {
    fn default() -> Self {
        Self {
            sample: SampleFormat::S16,
            channels: 2,
            rate: 44100,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameFormat {
    Video(VideoFormat),
    Audio {
        format: AudioFormat,
        /// Samples per channel.
        samples: usize,
    },
}

impl FrameFormat {
    pub fn is_video(&self) -> bool {
        matches!(self, FrameFormat::Video(_))
    }

    /// Size of a tightly packed buffer holding one frame of this format.
    pub fn buffer_bytes(&self) -> usize {
        match self {
            FrameFormat::Video(v) => v.frame_bytes(),
            FrameFormat::Audio { format, samples } => format.buffer_bytes(*samples),
        }
    }
}

impl Display for FrameFormat {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            FrameFormat::Video(v) => write!(f, "{:?} {}x{}", v.pixel, v.width, v.height),
            FrameFormat::Audio { format, samples } => write!(
                f,
                "{:?} {}ch {}Hz x{}",
                format.sample, format.channels, format.rate, samples
            ),
        }
    }
}

/// Where a decoded frame's bytes live.
pub enum FrameData {
    Host(Bytes),
    /// Borrowed from a [`FramePool`](crate::pool::FramePool); must be released
    /// once the frame has been consumed.
    Device(DeviceBuffer),
}

/// A decoded picture or PCM buffer, planes packed back to back.
pub struct RawFrame {
    format: FrameFormat,
    data: FrameData,
    pts: Option<i64>,
}

impl RawFrame {
    pub fn host(format: FrameFormat, data: Bytes, pts: Option<i64>) -> Self {
        Self {
            format,
            data: FrameData::Host(data),
            pts,
        }
    }

    pub fn device(format: FrameFormat, buffer: DeviceBuffer, pts: Option<i64>) -> Self {
        Self {
            format,
            data: FrameData::Device(buffer),
            pts,
        }
    }

    pub fn format(&self) -> &FrameFormat {
        &self.format
    }

    pub fn pts(&self) -> Option<i64> {
        self.pts
    }

    pub fn is_device(&self) -> bool {
        matches!(self.data, FrameData::Device(_))
    }

    pub fn bytes(&self) -> &[u8] {
        match &self.data {
            FrameData::Host(b) => b,
            FrameData::Device(buf) => buf.data(),
        }
    }

    /// Ends the borrow: a device-backed frame hands its buffer back to the
    /// pool, a host frame is simply freed.
    pub fn release(self) {
        if let FrameData::Device(buffer) = self.data {
            drop(buffer);
        }
    }
}

impl Display for RawFrame {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "RawFrame {} data: {} pts: {:?} device: {}",
            self.format,
            self.bytes().len(),
            self.pts,
            self.is_device()
        )
    }
}

/// A frame in the format the consumer asked for. Ownership moves to whoever
/// receives it from the pipeline.
#[derive(Clone, Debug)]
pub struct ConvertedFrame {
    pub format: FrameFormat,
    pub data: Bytes,
    pub pts: Option<i64>,
}

impl ConvertedFrame {
    pub fn new(format: FrameFormat, data: Bytes, pts: Option<i64>) -> Self {
        Self { format, data, pts }
    }

    /// Re-wraps the converted bytes as host input for an encode pipeline.
    pub fn into_raw(self) -> RawFrame {
        RawFrame::host(self.format, self.data, self.pts)
    }

    pub fn samples(&self) -> Option<usize> {
        match self.format {
            FrameFormat::Audio { samples, .. } => Some(samples),
            FrameFormat::Video(_) => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{backend::BackendKind, device::DeviceContext, pool::FramePool};

    #[test]
    fn test_frame_bytes() {
        assert_eq!(PixelFormat::Yuv420p.frame_bytes(4, 4), 16 + 4 + 4);
        assert_eq!(PixelFormat::Nv12.frame_bytes(4, 4), 16 + 8);
        assert_eq!(PixelFormat::Bgr24.frame_bytes(4, 2), 24);
        // odd sizes round chroma up
        assert_eq!(PixelFormat::Yuv420p.frame_bytes(3, 3), 9 + 4 + 4);

        let audio = AudioFormat::default();
        assert_eq!(audio.buffer_bytes(1024), 4096);
    }

    #[test]
    fn test_release_returns_device_buffer() {
        let ctx = DeviceContext::new(BackendKind::Npu, 0);
        let pool = FramePool::new(&ctx, "frame", 64, 1).unwrap();
        let mut buffer = pool.acquire().unwrap();
        buffer.fill(&[7u8; 24]).unwrap();
        let format = FrameFormat::Video(VideoFormat {
            pixel: PixelFormat::Nv12,
            width: 4,
            height: 4,
        });
        let frame = RawFrame::device(format, buffer, Some(3));
        assert!(frame.is_device());
        assert_eq!(frame.bytes().len(), 24);
        assert_eq!(pool.stats().free, 0);

        frame.release();
        assert_eq!(pool.stats().free, 1);
    }

    #[test]
    fn test_converted_into_raw() {
        let format = FrameFormat::Audio {
            format: AudioFormat::default(),
            samples: 2,
        };
        let converted = ConvertedFrame::new(format, Bytes::from_static(&[0; 8]), Some(9));
        assert_eq!(converted.samples(), Some(2));
        let raw = converted.into_raw();
        assert!(!raw.is_device());
        assert_eq!(raw.pts(), Some(9));
        assert_eq!(raw.bytes().len(), 8);
    }
}
