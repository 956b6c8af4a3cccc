/// Registers FFmpeg components (format, device, etc.). Call once at startup
/// before opening any input or engine.
#[cfg(feature = "ffmpeg")]
pub fn init() -> anyhow::Result<()> {
    ffmpeg_next::init().map_err(|e| anyhow::anyhow!("ffmpeg_next init: {}", e))
}

pub mod annexb;
pub mod backend;
pub mod config;
pub mod converter;
pub mod device;
pub mod error;
pub mod fifo;
pub mod frame;
pub mod hw;
pub mod packet;
pub mod pipeline;
pub mod pool;
pub mod queue;
pub mod session;
pub mod source;
pub mod stage;
pub mod telemetry;

#[cfg(feature = "ffmpeg")]
pub mod decoder;
#[cfg(feature = "ffmpeg")]
pub mod encoder;
#[cfg(feature = "ffmpeg")]
pub mod factory;
#[cfg(feature = "ffmpeg")]
pub mod input;
#[cfg(feature = "ffmpeg")]
pub mod scaler;

pub use config::SessionConfig;
pub use error::{CodecError, Result};
