//! Media source contract.
//!
//! A source demuxes a file or stream into elementary-stream units and pushes
//! each one to a listener, tagged with its media kind. Stream parameters are
//! known once the source is opened, before the first unit arrives.

use tokio_util::sync::CancellationToken;

use crate::packet::{CompressedUnit, MediaKind, VideoCodec};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamInfo {
    Video {
        codec: VideoCodec,
        width: u32,
        height: u32,
        fps: u32,
    },
    Audio {
        channels: u16,
        sample_rate: u32,
        /// AAC audio object type, 2 for AAC-LC.
        profile: u8,
    },
}

impl StreamInfo {
    pub fn media(&self) -> MediaKind {
        match self {
            StreamInfo::Video { codec, .. } => MediaKind::Video(*codec),
            StreamInfo::Audio { .. } => MediaKind::Aac,
        }
    }

    pub fn is_video(&self) -> bool {
        matches!(self, StreamInfo::Video { .. })
    }
}

pub trait MediaListener: Send {
    fn on_unit(&mut self, unit: CompressedUnit);
}

impl<F> MediaListener for F
where
    F: FnMut(CompressedUnit) + Send,
{
    fn on_unit(&mut self, unit: CompressedUnit) {
        self(unit)
    }
}

pub trait MediaSource: Send {
    fn streams(&self) -> &[StreamInfo];

    fn video(&self) -> Option<StreamInfo> {
        self.streams().iter().copied().find(|s| s.is_video())
    }

    fn audio(&self) -> Option<StreamInfo> {
        self.streams().iter().copied().find(|s| !s.is_video())
    }

    /// Reads until end of input or until `cancel` fires, pushing every unit
    /// to `listener` in stream order.
    fn run(
        &mut self,
        listener: &mut dyn MediaListener,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()>;
}

/// Replays a fixed list of units. Handy for wiring checks without a demuxer.
pub struct MemorySource {
    streams: Vec<StreamInfo>,
    units: Vec<CompressedUnit>,
}

impl MemorySource {
    pub fn new(streams: Vec<StreamInfo>, units: Vec<CompressedUnit>) -> Self {
        Self { streams, units }
    }
}

impl MediaSource for MemorySource {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn run(
        &mut self,
        listener: &mut dyn MediaListener,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        for unit in self.units.drain(..) {
            if cancel.is_cancelled() {
                break;
            }
            listener.on_unit(unit);
        }
        Ok(())
    }
}
