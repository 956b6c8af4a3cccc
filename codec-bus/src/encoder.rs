use std::{collections::VecDeque, sync::Arc};

use ffmpeg_next::{Dictionary, Rational, frame};

use crate::{
    annexb::AacConfig,
    backend::{Backend, BackendKind, EncoderParams},
    decoder::{open_error, pending},
    device::DeviceContext,
    error::{CodecError, Result},
    fifo::SampleFifo,
    frame::{AudioFormat, ConvertedFrame, FrameFormat, VideoFormat},
    hw,
    packet::{CompressedUnit, MediaKind, VideoCodec},
    scaler::{av_layout, av_pixel, av_sample, write_video},
};

enum EncoderType {
    Video {
        encoder: ffmpeg_next::codec::encoder::Video,
        format: VideoFormat,
        frame_index: i64,
    },
    Audio {
        encoder: ffmpeg_next::codec::encoder::Audio,
        format: AudioFormat,
        frame_size: usize,
        fifo: SampleFifo,
        adts: AacConfig,
        next_pts: i64,
    },
}

/// Low-latency defaults per engine family.
fn video_options(name: &str, codec: VideoCodec, ctx: &DeviceContext) -> Dictionary<'static> {
    let mut opts = Dictionary::new();
    if name.starts_with("libx26") {
        opts.set("preset", "ultrafast");
        opts.set("tune", "zerolatency");
        if codec == VideoCodec::H264 {
            opts.set("profile", "baseline");
        }
    } else if name.ends_with("_nvenc") {
        opts.set("preset", "p1");
        opts.set("tune", "ll");
        opts.set("gpu", &ctx.device_id().to_string());
    }
    opts
}

pub struct FfmpegEncoder {
    kind: BackendKind,
    name: String,
    media: MediaKind,
    inner: Option<EncoderType>,
    ready: VecDeque<CompressedUnit>,
}

unsafe impl Send for FfmpegEncoder {}

impl FfmpegEncoder {
    pub fn open(kind: BackendKind, params: &EncoderParams, ctx: &Arc<DeviceContext>) -> Result<Self> {
        let media = match params {
            EncoderParams::Video { codec, .. } => MediaKind::Video(*codec),
            EncoderParams::Audio { .. } => MediaKind::Aac,
        };
        let Some((name, codec)) = hw::find_encoder(kind, media) else {
            return Err(CodecError::BackendUnavailable(format!(
                "no {} encoder for {}",
                kind, media
            )));
        };
        let encoder_ctx = ffmpeg_next::codec::Context::new_with_codec(codec);

        let inner = match *params {
            EncoderParams::Video {
                codec: video_codec,
                width,
                height,
                fps,
                bit_rate,
            } => {
                let fps = fps.max(1);
                let format = VideoFormat {
                    pixel: hw::encoder_pixel_format(kind),
                    width,
                    height,
                };
                let mut encoder = encoder_ctx
                    .encoder()
                    .video()
                    .map_err(|e| open_error(kind, name, e))?;
                encoder.set_width(width);
                encoder.set_height(height);
                encoder.set_format(av_pixel(format.pixel));
                encoder.set_frame_rate(Some(Rational::new(fps as i32, 1)));
                encoder.set_time_base(Rational::new(1, fps as i32));
                encoder.set_gop(fps * 2);
                encoder.set_max_b_frames(0);
                encoder.set_bit_rate(bit_rate);
                let encoder = encoder
                    .open_with(video_options(name, video_codec, ctx))
                    .map_err(|e| open_error(kind, name, e))?;
                log::info!(
                    "encoder opened: {} ({}) {}x{}@{} {} bps",
                    name,
                    kind,
                    width,
                    height,
                    fps,
                    bit_rate
                );
                EncoderType::Video {
                    encoder,
                    format,
                    frame_index: 0,
                }
            }
            EncoderParams::Audio {
                channels,
                sample_rate,
                bit_rate,
            } => {
                let Some(adts) = AacConfig::new(sample_rate, channels) else {
                    return Err(CodecError::FatalBackendInit(format!(
                        "{}: no ADTS index for {} Hz",
                        name, sample_rate
                    )));
                };
                let format = AudioFormat {
                    sample: hw::ENCODER_SAMPLE_FORMAT,
                    channels,
                    rate: sample_rate,
                };
                let mut encoder = encoder_ctx
                    .encoder()
                    .audio()
                    .map_err(|e| open_error(kind, name, e))?;
                encoder.set_rate(sample_rate as i32);
                encoder.set_channel_layout(av_layout(channels));
                encoder.set_format(av_sample(format.sample));
                encoder.set_bit_rate(bit_rate);
                encoder.set_time_base(Rational::new(1, sample_rate as i32));
                let encoder = encoder
                    .open_with(Dictionary::new())
                    .map_err(|e| open_error(kind, name, e))?;
                let frame_size = match encoder.frame_size() {
                    0 => 1024,
                    n => n as usize,
                };
                log::info!(
                    "encoder opened: {} ({}) {}ch {}Hz {} bps, frame size {}",
                    name,
                    kind,
                    channels,
                    sample_rate,
                    bit_rate,
                    frame_size
                );
                EncoderType::Audio {
                    encoder,
                    format,
                    frame_size,
                    fifo: SampleFifo::new(format),
                    adts,
                    next_pts: 0,
                }
            }
        };

        Ok(Self {
            kind,
            name: name.to_string(),
            media,
            inner: Some(inner),
            ready: VecDeque::new(),
        })
    }

    /// Moves every packet the engine has ready into `ready`.
    fn collect(&mut self) -> Result<()> {
        let name = &self.name;
        let reject = |e: ffmpeg_next::Error| CodecError::EncodeRejected(format!("{}: {}", name, e));
        loop {
            let mut packet = ffmpeg_next::Packet::empty();
            let result = match self.inner.as_mut() {
                Some(EncoderType::Video { encoder, .. }) => encoder.receive_packet(&mut packet),
                Some(EncoderType::Audio { encoder, .. }) => encoder.receive_packet(&mut packet),
                None => return Ok(()),
            };
            if let Err(e) = result {
                return pending::<()>(e, reject).map(|_| ());
            }
            let Some(data) = packet.data() else {
                continue;
            };
            let unit = match self.inner.as_ref() {
                Some(EncoderType::Audio { adts, .. }) => {
                    CompressedUnit::new(MediaKind::Aac, adts.frame(data))
                }
                _ => CompressedUnit::copy_from(self.media, data),
            };
            self.ready
                .push_back(unit.with_pts(packet.pts()).with_key(packet.is_key()));
        }
    }

    fn send_audio(&mut self, data: Option<Vec<u8>>, samples: usize) -> Result<()> {
        let Some(EncoderType::Audio {
            encoder,
            format,
            next_pts,
            ..
        }) = self.inner.as_mut()
        else {
            return Err(CodecError::Closed);
        };
        let Some(data) = data else {
            return Ok(());
        };
        let mut frame = frame::Audio::new(av_sample(format.sample), samples, av_layout(format.channels));
        frame.set_rate(format.rate);
        let plane = samples * format.sample.bytes_per_sample();
        for ch in 0..format.channels as usize {
            frame.data_mut(ch)[..plane].copy_from_slice(&data[ch * plane..(ch + 1) * plane]);
        }
        frame.set_pts(Some(*next_pts));
        *next_pts += samples as i64;
        encoder
            .send_frame(&frame)
            .map_err(|e| CodecError::EncodeRejected(format!("{}: {}", self.name, e)))
    }
}

impl Backend for FfmpegEncoder {
    type Input = ConvertedFrame;
    type Output = CompressedUnit;

    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&mut self, input: ConvertedFrame) -> Result<()> {
        match (self.inner.as_mut(), input.format) {
            (
                Some(EncoderType::Video {
                    encoder,
                    format,
                    frame_index,
                }),
                FrameFormat::Video(got),
            ) => {
                if got != *format {
                    return Err(CodecError::EncodeRejected(format!(
                        "{}: expected {:?} {}x{}, got {:?} {}x{}",
                        self.name,
                        format.pixel,
                        format.width,
                        format.height,
                        got.pixel,
                        got.width,
                        got.height
                    )));
                }
                let mut frame = frame::Video::new(av_pixel(got.pixel), got.width, got.height);
                write_video(&mut frame, &got, &input.data)?;
                frame.set_pts(Some(*frame_index));
                *frame_index += 1;
                encoder
                    .send_frame(&frame)
                    .map_err(|e| CodecError::EncodeRejected(format!("{}: {}", self.name, e)))?;
            }
            (
                Some(EncoderType::Audio {
                    format,
                    frame_size,
                    fifo,
                    ..
                }),
                FrameFormat::Audio { format: got, samples },
            ) => {
                if got != *format {
                    return Err(CodecError::EncodeRejected(format!(
                        "{}: expected {:?}, got {:?}",
                        self.name, format, got
                    )));
                }
                fifo.push(&input.data, samples)?;
                let frame_size = *frame_size;
                loop {
                    let chunk = match self.inner.as_mut() {
                        Some(EncoderType::Audio { fifo, .. }) => fifo.pop(frame_size),
                        _ => None,
                    };
                    if chunk.is_none() {
                        break;
                    }
                    self.send_audio(chunk, frame_size)?;
                    self.collect()?;
                }
            }
            (None, _) => return Err(CodecError::Closed),
            (Some(_), got) => {
                return Err(CodecError::EncodeRejected(format!(
                    "{}: wrong media {}",
                    self.name, got
                )));
            }
        }
        self.collect()
    }

    fn retrieve(&mut self) -> Result<Option<CompressedUnit>> {
        if self.ready.is_empty() {
            self.collect()?;
        }
        Ok(self.ready.pop_front())
    }

    fn send_eof(&mut self) -> Result<()> {
        let rest = match self.inner.as_mut() {
            Some(EncoderType::Audio { fifo, .. }) => fifo.pop_rest(),
            Some(EncoderType::Video { .. }) => None,
            None => return Ok(()),
        };
        if let Some((data, samples)) = rest {
            self.send_audio(Some(data), samples)?;
            self.collect()?;
        }
        let result = match self.inner.as_mut() {
            Some(EncoderType::Video { encoder, .. }) => encoder.send_eof(),
            Some(EncoderType::Audio { encoder, .. }) => encoder.send_eof(),
            None => return Ok(()),
        };
        result.map_err(|e| CodecError::EncodeRejected(format!("{}: {}", self.name, e)))
    }

    fn close(&mut self) {
        if self.inner.take().is_some() {
            log::debug!(
                "encoder closed: {}, {} units unread",
                self.name,
                self.ready.len()
            );
        }
        self.ready.clear();
    }
}
