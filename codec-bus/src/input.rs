use std::collections::HashMap;
use std::ffi::CString;
use std::path::Path;

use bytes::{Bytes, BytesMut};
use ffmpeg_next::{Dictionary, Rational, Rescale, codec::Id, media::Type};
use tokio_util::sync::CancellationToken;

use crate::{
    annexb::{self, AacConfig},
    packet::{CompressedUnit, MediaKind, VideoCodec},
    source::{MediaListener, MediaSource, StreamInfo},
};

/// Unit timestamps are handed out in milliseconds.
const UNIT_TIME_BASE: Rational = Rational(1, 1000);

/// How a track's packets are rewritten into elementary-stream units.
enum Framing {
    /// Already start-code delimited.
    AnnexB,
    /// Length-prefixed NAL units; parameter sets go in front of key frames.
    Avcc {
        length_size: usize,
        parameter_sets: Bytes,
    },
    Adts(AacConfig),
}

struct Track {
    kind: MediaKind,
    time_base: Rational,
    framing: Framing,
    units: u64,
}

impl Track {
    fn unit(&self, data: &[u8], is_key: bool) -> Bytes {
        match &self.framing {
            Framing::AnnexB => Bytes::copy_from_slice(data),
            Framing::Avcc {
                length_size,
                parameter_sets,
            } => {
                let nal = annexb::avcc_to_annexb(data, *length_size);
                if is_key && !parameter_sets.is_empty() {
                    let mut out = BytesMut::with_capacity(parameter_sets.len() + nal.len());
                    out.extend_from_slice(parameter_sets);
                    out.extend_from_slice(&nal);
                    out.freeze()
                } else {
                    nal
                }
            }
            Framing::Adts(config) => {
                if annexb::is_adts(data) {
                    Bytes::copy_from_slice(data)
                } else {
                    config.frame(data)
                }
            }
        }
    }
}

/// Reads extradata from codec parameters via the raw AVCodecParameters pointer.
fn extradata(params: &ffmpeg_next::codec::Parameters) -> &[u8] {
    unsafe {
        let p = params.as_ptr();
        if (*p).extradata.is_null() || (*p).extradata_size <= 0 {
            return &[];
        }
        std::slice::from_raw_parts((*p).extradata, (*p).extradata_size as usize)
    }
}

fn video_size(params: &ffmpeg_next::codec::Parameters) -> (u32, u32) {
    unsafe {
        let p = params.as_ptr();
        ((*p).width.max(0) as u32, (*p).height.max(0) as u32)
    }
}

fn audio_params(params: &ffmpeg_next::codec::Parameters) -> (u32, u16) {
    unsafe {
        let p = params.as_ptr();
        (
            (*p).sample_rate.max(0) as u32,
            (*p).ch_layout.nb_channels.max(0) as u16,
        )
    }
}

fn video_framing(codec: VideoCodec, extra: &[u8]) -> Framing {
    if !annexb::needs_annexb_conversion(extra) {
        return Framing::AnnexB;
    }
    let sets = match codec {
        VideoCodec::H264 => annexb::avcc_parameter_sets(extra),
        VideoCodec::H265 => annexb::hvcc_parameter_sets(extra),
    };
    match sets {
        Some(sets) => Framing::Avcc {
            length_size: sets.length_size,
            parameter_sets: sets.annexb,
        },
        None => {
            log::warn!("unreadable {:?} extradata, assuming 4-byte NAL lengths", codec);
            Framing::Avcc {
                length_size: 4,
                parameter_sets: Bytes::new(),
            }
        }
    }
}

/// File or stream source demuxed by FFmpeg. Only the first H.264/HEVC
/// video track and the first AAC track are delivered.
pub struct AvInput {
    url: String,
    inner: ffmpeg_next::format::context::Input,
    streams: Vec<StreamInfo>,
    tracks: HashMap<usize, Track>,
}

unsafe impl Send for AvInput {}

impl AvInput {
    /// Resolve input format by name (e.g. "flv", "mpegts") via FFmpeg's av_find_input_format.
    fn find_input_format(name: &str) -> anyhow::Result<ffmpeg_next::format::format::Input> {
        let cname = CString::new(name)
            .map_err(|e| anyhow::anyhow!("invalid format name {:?}: {}", name, e))?;
        let ptr = unsafe { ffmpeg_next::ffi::av_find_input_format(cname.as_ptr()) };
        if ptr.is_null() {
            return Err(anyhow::anyhow!("input format not found: {}", name));
        }
        Ok(unsafe { ffmpeg_next::format::format::Input::wrap(ptr as *mut _) })
    }

    pub fn new(
        url: &str,
        format: Option<&str>,
        options: Option<Dictionary>,
    ) -> anyhow::Result<Self> {
        use ffmpeg_next::format::format::Format;

        let path = Path::new(url);
        let input = match (format, options) {
            (Some(fmt_name), opts) => {
                let fmt = Self::find_input_format(fmt_name)?;
                let ctx = ffmpeg_next::format::open_with(
                    path,
                    &Format::Input(fmt),
                    opts.unwrap_or_default(),
                )?;
                ctx.input()
            }
            (None, Some(opts)) => ffmpeg_next::format::input_with_dictionary(path, opts)?,
            (None, None) => ffmpeg_next::format::input(path)?,
        };

        let mut streams = Vec::new();
        let mut tracks = HashMap::new();
        let mut has_video = false;
        let mut has_audio = false;
        for stream in input.streams() {
            let params = stream.parameters();
            match (params.medium(), params.id()) {
                (Type::Video, id @ (Id::H264 | Id::HEVC)) if !has_video => {
                    let codec = if id == Id::H264 {
                        VideoCodec::H264
                    } else {
                        VideoCodec::H265
                    };
                    let (width, height) = video_size(&params);
                    let rate = stream.avg_frame_rate();
                    let fps = if rate.numerator() > 0 && rate.denominator() > 0 {
                        (f64::from(rate).round() as u32).max(1)
                    } else {
                        25
                    };
                    streams.push(StreamInfo::Video {
                        codec,
                        width,
                        height,
                        fps,
                    });
                    tracks.insert(
                        stream.index(),
                        Track {
                            kind: MediaKind::Video(codec),
                            time_base: stream.time_base(),
                            framing: video_framing(codec, extradata(&params)),
                            units: 0,
                        },
                    );
                    has_video = true;
                }
                (Type::Audio, Id::AAC) if !has_audio => {
                    let (sample_rate, channels) = audio_params(&params);
                    let config = AacConfig::from_extradata(extradata(&params))
                        .or_else(|| AacConfig::new(sample_rate, channels));
                    let Some(config) = config else {
                        log::warn!(
                            "aac stream {} has no usable config ({} Hz), skipped",
                            stream.index(),
                            sample_rate
                        );
                        continue;
                    };
                    streams.push(StreamInfo::Audio {
                        channels,
                        sample_rate,
                        profile: config.object_type,
                    });
                    tracks.insert(
                        stream.index(),
                        Track {
                            kind: MediaKind::Aac,
                            time_base: stream.time_base(),
                            framing: Framing::Adts(config),
                            units: 0,
                        },
                    );
                    has_audio = true;
                }
                (medium, id) => {
                    log::debug!(
                        "stream {} ({:?} {:?}) not delivered",
                        stream.index(),
                        medium,
                        id
                    );
                }
            }
        }
        log::info!("input opened: {}, streams: {:?}", url, streams);

        Ok(Self {
            url: url.to_string(),
            inner: input,
            streams,
            tracks,
        })
    }
}

impl MediaSource for AvInput {
    fn streams(&self) -> &[StreamInfo] {
        &self.streams
    }

    fn run(
        &mut self,
        listener: &mut dyn MediaListener,
        cancel: &CancellationToken,
    ) -> anyhow::Result<()> {
        for (stream, packet) in self.inner.packets() {
            if cancel.is_cancelled() {
                log::info!("input {} cancelled", self.url);
                break;
            }
            let Some(track) = self.tracks.get_mut(&stream.index()) else {
                continue;
            };
            let Some(data) = packet.data() else {
                continue;
            };
            let data = track.unit(data, packet.is_key());
            if data.is_empty() {
                continue;
            }
            let pts = packet
                .pts()
                .map(|pts| pts.rescale(track.time_base, UNIT_TIME_BASE));
            track.units += 1;
            listener.on_unit(
                CompressedUnit::new(track.kind, data)
                    .with_pts(pts)
                    .with_key(packet.is_key()),
            );
        }

        for track in self.tracks.values() {
            log::info!("end of input {}: {} {} units", self.url, track.kind, track.units);
        }
        Ok(())
    }
}
