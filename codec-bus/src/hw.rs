//! Codec discovery per backend kind.
//!
//! Each kind maps to an ordered list of engine codec names; the first one
//! the engine library actually provides wins. An empty list means the kind
//! has no engine for that media, which surfaces as `BackendUnavailable`.

use crate::{
    backend::BackendKind,
    frame::{PixelFormat, SampleFormat},
    packet::{MediaKind, VideoCodec},
};

/// Sample layout the AAC encoders consume.
pub const ENCODER_SAMPLE_FORMAT: SampleFormat = SampleFormat::Fltp;

pub fn decoder_candidates(kind: BackendKind, media: MediaKind) -> &'static [&'static str] {
    match (kind, media) {
        (BackendKind::Software, MediaKind::Video(VideoCodec::H264)) => &["h264"],
        (BackendKind::Software, MediaKind::Video(VideoCodec::H265)) => &["hevc"],
        (BackendKind::Software, MediaKind::Aac) => &["aac"],
        (BackendKind::Gpu, MediaKind::Video(VideoCodec::H264)) => &["h264_cuvid"],
        (BackendKind::Gpu, MediaKind::Video(VideoCodec::H265)) => &["hevc_cuvid"],
        (BackendKind::Npu, MediaKind::Video(VideoCodec::H264)) => &["h264_rkmpp", "h264_v4l2m2m"],
        (BackendKind::Npu, MediaKind::Video(VideoCodec::H265)) => &["hevc_rkmpp", "hevc_v4l2m2m"],
        (_, MediaKind::Aac) => &[],
    }
}

pub fn encoder_candidates(kind: BackendKind, media: MediaKind) -> &'static [&'static str] {
    match (kind, media) {
        (BackendKind::Software, MediaKind::Video(VideoCodec::H264)) => &["libx264"],
        (BackendKind::Software, MediaKind::Video(VideoCodec::H265)) => &["libx265"],
        (BackendKind::Software, MediaKind::Aac) => &["aac"],
        (BackendKind::Gpu, MediaKind::Video(VideoCodec::H264)) => &["h264_nvenc"],
        (BackendKind::Gpu, MediaKind::Video(VideoCodec::H265)) => &["hevc_nvenc"],
        (BackendKind::Npu, MediaKind::Video(VideoCodec::H264)) => &["h264_rkmpp", "h264_v4l2m2m"],
        (BackendKind::Npu, MediaKind::Video(VideoCodec::H265)) => &["hevc_rkmpp", "hevc_v4l2m2m"],
        (_, MediaKind::Aac) => &[],
    }
}

/// Whether a codec name belongs to a hardware engine.
pub fn is_hardware_codec(name: &str) -> bool {
    ["cuvid", "nvenc", "rkmpp", "v4l2m2m", "vaapi", "qsv"]
        .iter()
        .any(|suffix| name.ends_with(suffix))
}

/// Pixel format the encoders of `kind` take as input. Hardware encoders
/// prefer NV12; software x264/x265 take planar 4:2:0.
pub fn encoder_pixel_format(kind: BackendKind) -> PixelFormat {
    if kind.is_hardware() {
        PixelFormat::Nv12
    } else {
        PixelFormat::Yuv420p
    }
}

/// Layout hardware decoders hand their pictures back in; sizes the pool.
pub fn device_pixel_format(_kind: BackendKind) -> PixelFormat {
    PixelFormat::Nv12
}

#[cfg(feature = "ffmpeg")]
pub fn find_decoder(kind: BackendKind, media: MediaKind) -> Option<(&'static str, ffmpeg_next::Codec)> {
    for name in decoder_candidates(kind, media) {
        if let Some(codec) = ffmpeg_next::decoder::find_by_name(name) {
            log::info!("found {} decoder: {}", kind, name);
            return Some((*name, codec));
        }
    }
    None
}

#[cfg(feature = "ffmpeg")]
pub fn find_encoder(kind: BackendKind, media: MediaKind) -> Option<(&'static str, ffmpeg_next::Codec)> {
    for name in encoder_candidates(kind, media) {
        if let Some(codec) = ffmpeg_next::encoder::find_by_name(name) {
            log::info!("found {} encoder: {}", kind, name);
            return Some((*name, codec));
        }
    }
    None
}
