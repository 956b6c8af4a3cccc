//! FFmpeg-backed engines behind the backend factory.
//!
//! Decoders and encoders pick the codec implementation matching the
//! requested kind. Format conversion only exists in software; hardware
//! converter requests answer `BackendUnavailable` so selection falls back.

use std::sync::Arc;

use crate::{
    backend::{
        BackendFactory, BackendKind, ConvertBackend, ConvertTarget, DecodeBackend, EncodeBackend,
        EncoderParams,
    },
    converter::{AudioConverter, VideoConverter},
    decoder::FfmpegDecoder,
    device::DeviceContext,
    encoder::FfmpegEncoder,
    error::{CodecError, Result},
    pool::FramePool,
    scaler::{SwrResampleEngine, SwsScaleEngine},
    source::StreamInfo,
};

#[derive(Debug, Default, Clone, Copy)]
pub struct FfmpegBackends;

impl BackendFactory for FfmpegBackends {
    fn open_decoder(
        &self,
        kind: BackendKind,
        stream: &StreamInfo,
        ctx: &Arc<DeviceContext>,
        pool: Option<FramePool>,
    ) -> Result<DecodeBackend> {
        Ok(Box::new(FfmpegDecoder::open(kind, stream, ctx, pool)?))
    }

    fn open_converter(
        &self,
        kind: BackendKind,
        target: &ConvertTarget,
        _ctx: &Arc<DeviceContext>,
    ) -> Result<ConvertBackend> {
        if kind.is_hardware() {
            return Err(CodecError::BackendUnavailable(format!(
                "no {} converter",
                kind
            )));
        }
        let backend: ConvertBackend = match *target {
            ConvertTarget::Video { pixel, size } => Box::new(VideoConverter::new(
                kind,
                SwsScaleEngine::default(),
                pixel,
                size,
            )),
            ConvertTarget::Audio(format) => Box::new(AudioConverter::new(
                kind,
                SwrResampleEngine::default(),
                format,
            )),
        };
        Ok(backend)
    }

    fn open_encoder(
        &self,
        kind: BackendKind,
        params: &EncoderParams,
        ctx: &Arc<DeviceContext>,
    ) -> Result<EncodeBackend> {
        Ok(Box::new(FfmpegEncoder::open(kind, params, ctx)?))
    }
}
