//! Backend adapters.
//!
//! A backend wraps one decode, convert or encode engine behind the same
//! submit / retrieve / flush / close contract, so a stage thread can drive a
//! software codec, a GPU codec or an NPU codec without knowing which one it
//! holds. Which variant runs is decided once, when the pipeline is opened.

use std::{
    fmt::{Display, Formatter},
    str::FromStr,
    sync::Arc,
};

use serde::Deserialize;

use crate::{
    device::DeviceContext,
    error::{CodecError, Result},
    frame::{AudioFormat, ConvertedFrame, PixelFormat, RawFrame},
    packet::{CompressedUnit, VideoCodec},
    pool::FramePool,
    source::StreamInfo,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    #[default]
    Software,
    /// Discrete GPU codec block.
    Gpu,
    /// NPU / media ASIC.
    Npu,
}

impl BackendKind {
    pub fn is_hardware(&self) -> bool {
        !matches!(self, BackendKind::Software)
    }

    /// The variants to try, in order, when `self` is requested.
    pub fn fallback_chain(&self) -> Vec<BackendKind> {
        match self {
            BackendKind::Software => vec![BackendKind::Software],
            kind => vec![*kind, BackendKind::Software],
        }
    }
}

impl Display for BackendKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            BackendKind::Software => write!(f, "software"),
            BackendKind::Gpu => write!(f, "gpu"),
            BackendKind::Npu => write!(f, "npu"),
        }
    }
}

impl FromStr for BackendKind {
    type Err = CodecError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "software" | "sw" | "cpu" => Ok(BackendKind::Software),
            "gpu" | "cuda" => Ok(BackendKind::Gpu),
            "npu" | "asic" => Ok(BackendKind::Npu),
            other => Err(CodecError::BackendUnavailable(format!(
                "unknown backend kind: {}",
                other
            ))),
        }
    }
}

pub trait Backend: Send {
    type Input: Send;
    type Output: Send;

    fn kind(&self) -> BackendKind;

    fn name(&self) -> &str;

    /// Hands one unit of work to the engine. The engine may hold it, and
    /// earlier ones, internally before producing anything.
    fn submit(&mut self, input: Self::Input) -> Result<()>;

    /// Next ready output, or `None` once nothing more is available for what
    /// has been submitted so far.
    fn retrieve(&mut self) -> Result<Option<Self::Output>>;

    /// Tells the engine no more input follows, so it releases everything it
    /// still holds through `retrieve`.
    fn send_eof(&mut self) -> Result<()>;

    /// Releases engine state. Calling it again is a no-op.
    fn close(&mut self);

    /// Every output currently ready, in order.
    fn drain(&mut self) -> Drain<'_, Self>
    where
        Self: Sized,
    {
        Drain {
            backend: self,
            errors: 0,
            done: false,
        }
    }

    /// Signals end of stream and drains whatever the engine was holding.
    fn flush(&mut self) -> Result<Drain<'_, Self>>
    where
        Self: Sized,
    {
        self.send_eof()?;
        Ok(self.drain())
    }
}

impl<B: Backend + ?Sized> Backend for Box<B> {
    type Input = B::Input;
    type Output = B::Output;

    fn kind(&self) -> BackendKind {
        (**self).kind()
    }

    fn name(&self) -> &str {
        (**self).name()
    }

    fn submit(&mut self, input: Self::Input) -> Result<()> {
        (**self).submit(input)
    }

    fn retrieve(&mut self) -> Result<Option<Self::Output>> {
        (**self).retrieve()
    }

    fn send_eof(&mut self) -> Result<()> {
        (**self).send_eof()
    }

    fn close(&mut self) {
        (**self).close()
    }
}

/// Consecutive `retrieve` errors after which a drain gives up on the backend.
pub const MAX_DRAIN_ERRORS: usize = 8;

/// Lazy sequence of a backend's ready outputs. Ends at the first `None` from
/// `retrieve`. Errors are yielded and draining goes on, unless
/// `MAX_DRAIN_ERRORS` of them arrive in a row.
pub struct Drain<'a, B: Backend> {
    backend: &'a mut B,
    errors: usize,
    done: bool,
}

impl<B: Backend> Iterator for Drain<'_, B> {
    type Item = Result<B::Output>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.backend.retrieve() {
            Ok(Some(out)) => {
                self.errors = 0;
                Some(Ok(out))
            }
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.errors += 1;
                if self.errors >= MAX_DRAIN_ERRORS {
                    log::warn!(
                        "{} failed {} retrieves in a row, drain abandoned",
                        self.backend.name(),
                        self.errors
                    );
                    self.done = true;
                }
                Some(Err(e))
            }
        }
    }
}

pub type DecodeBackend = Box<dyn Backend<Input = CompressedUnit, Output = RawFrame>>;
pub type ConvertBackend = Box<dyn Backend<Input = RawFrame, Output = ConvertedFrame>>;
pub type EncodeBackend = Box<dyn Backend<Input = ConvertedFrame, Output = CompressedUnit>>;

/// What a converter must turn decoded frames into.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConvertTarget {
    Video {
        pixel: PixelFormat,
        /// Output size; `None` keeps the source size.
        size: Option<(u32, u32)>,
    },
    Audio(AudioFormat),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EncoderParams {
    Video {
        codec: VideoCodec,
        width: u32,
        height: u32,
        fps: u32,
        bit_rate: usize,
    },
    Audio {
        channels: u16,
        sample_rate: u32,
        bit_rate: usize,
    },
}

impl EncoderParams {
    pub fn is_video(&self) -> bool {
        matches!(self, EncoderParams::Video { .. })
    }
}

/// Opens engines of every kind. One implementation exists per engine family;
/// a factory answers `BackendUnavailable` for variants it cannot provide.
pub trait BackendFactory: Send + Sync {
    /// `pool` is present only for hardware variants of video decoders.
    fn open_decoder(
        &self,
        kind: BackendKind,
        stream: &StreamInfo,
        ctx: &Arc<DeviceContext>,
        pool: Option<FramePool>,
    ) -> Result<DecodeBackend>;

    fn open_converter(
        &self,
        kind: BackendKind,
        target: &ConvertTarget,
        ctx: &Arc<DeviceContext>,
    ) -> Result<ConvertBackend>;

    fn open_encoder(
        &self,
        kind: BackendKind,
        params: &EncoderParams,
        ctx: &Arc<DeviceContext>,
    ) -> Result<EncodeBackend>;
}

/// Tries each kind in `chain` until `open` succeeds.
///
/// `BackendUnavailable` moves on to the next kind; any other error aborts
/// the selection. Returns the last `BackendUnavailable` if nothing opened.
pub fn select_backend<T>(
    what: &str,
    chain: &[BackendKind],
    mut open: impl FnMut(BackendKind) -> Result<T>,
) -> Result<(BackendKind, T)> {
    let mut last = CodecError::BackendUnavailable(format!("{}: no backend candidates", what));
    for (i, kind) in chain.iter().enumerate() {
        match open(*kind) {
            Ok(backend) => {
                if i > 0 {
                    log::warn!("{}: fell back to {} backend", what, kind);
                } else {
                    log::info!("{}: using {} backend", what, kind);
                }
                return Ok((*kind, backend));
            }
            Err(e) if e.is_unavailable() => {
                log::warn!("{}: {} backend unavailable: {}", what, kind, e);
                last = e;
            }
            Err(e) => return Err(e),
        }
    }
    Err(last)
}
