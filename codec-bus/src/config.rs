use std::time::Duration;

use serde::Deserialize;

use crate::{
    backend::BackendKind,
    frame::{AudioFormat, PixelFormat},
    pool::DEFAULT_POOL_CAPACITY,
    queue::{DEFAULT_DROP_BOUND, DropPolicy},
    packet::VideoCodec,
};

/// Per-session settings shared by every pipeline the session opens.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Preferred backend; anything unavailable falls back to software.
    pub backend: BackendKind,
    pub device_id: i32,
    /// Device buffers per hardware decode pool.
    pub pool_capacity: usize,
    /// Encode-side video queues clear themselves above this depth. `null`
    /// keeps every frame.
    pub drop_bound: Option<usize>,
    pub poll_ms: u64,
    /// Pixel format handed to consumers of decoded video.
    pub video_output: PixelFormat,
    /// PCM format handed to consumers of decoded audio.
    pub audio_output: AudioFormat,
    pub video_codec: VideoCodec,
    pub video_bit_rate: usize,
    pub audio_bit_rate: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            backend: BackendKind::Software,
            device_id: 0,
            pool_capacity: DEFAULT_POOL_CAPACITY,
            drop_bound: Some(DEFAULT_DROP_BOUND),
            poll_ms: 100,
            video_output: PixelFormat::Bgr24,
            audio_output: AudioFormat::default(),
            video_codec: VideoCodec::H264,
            video_bit_rate: 4_000_000,
            audio_bit_rate: 128_000,
        }
    }
}

impl SessionConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }

    pub fn drop_policy(&self) -> DropPolicy {
        match self.drop_bound {
            Some(bound) => DropPolicy::ClearAbove(bound),
            None => DropPolicy::Never,
        }
    }
}
