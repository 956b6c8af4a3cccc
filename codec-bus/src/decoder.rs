use std::sync::Arc;

use bytes::Bytes;
use ffmpeg_next::{Dictionary, Packet, frame};

use crate::{
    backend::{Backend, BackendKind},
    device::DeviceContext,
    error::{CodecError, Result},
    frame::{AudioFormat, FrameFormat, RawFrame, VideoFormat},
    hw,
    packet::CompressedUnit,
    pool::FramePool,
    scaler::{pixel_from_av, read_audio, read_video, sample_from_av},
    source::StreamInfo,
};

enum DecoderType {
    Video(ffmpeg_next::codec::decoder::Video),
    Audio(ffmpeg_next::codec::decoder::Audio),
}

/// Open failures of hardware variants leave room for the next kind;
/// a software engine that cannot open is fatal.
pub(crate) fn open_error(kind: BackendKind, name: &str, err: ffmpeg_next::Error) -> CodecError {
    if kind.is_hardware() {
        CodecError::BackendUnavailable(format!("{}: {}", name, err))
    } else {
        CodecError::FatalBackendInit(format!("{}: {}", name, err))
    }
}

/// `Ok(None)` for the "nothing yet" and "fully drained" answers.
pub(crate) fn pending<T>(
    err: ffmpeg_next::Error,
    reject: impl FnOnce(ffmpeg_next::Error) -> CodecError,
) -> Result<Option<T>> {
    match err {
        ffmpeg_next::Error::Eof => Ok(None),
        ffmpeg_next::Error::Other { errno } if errno == ffmpeg_next::util::error::EAGAIN => {
            Ok(None)
        }
        err => Err(reject(err)),
    }
}

pub struct FfmpegDecoder {
    kind: BackendKind,
    name: String,
    inner: Option<DecoderType>,
    pool: Option<FramePool>,
}

unsafe impl Send for FfmpegDecoder {}

impl FfmpegDecoder {
    pub fn open(
        kind: BackendKind,
        stream: &StreamInfo,
        ctx: &Arc<DeviceContext>,
        pool: Option<FramePool>,
    ) -> Result<Self> {
        let media = stream.media();
        let Some((name, codec)) = hw::find_decoder(kind, media) else {
            return Err(CodecError::BackendUnavailable(format!(
                "no {} decoder for {}",
                kind, media
            )));
        };

        let mut options = Dictionary::new();
        if kind == BackendKind::Gpu {
            options.set("gpu", &ctx.device_id().to_string());
        }
        let decoder_ctx = ffmpeg_next::codec::Context::new_with_codec(codec);
        let opened = decoder_ctx
            .decoder()
            .open_as_with(codec, options)
            .map_err(|e| open_error(kind, name, e))?;
        let inner = if stream.is_video() {
            DecoderType::Video(opened.video().map_err(|e| open_error(kind, name, e))?)
        } else {
            DecoderType::Audio(opened.audio().map_err(|e| open_error(kind, name, e))?)
        };

        log::info!(
            "decoder opened: {} ({}), pooled: {}",
            name,
            kind,
            pool.is_some()
        );
        Ok(Self {
            kind,
            name: name.to_string(),
            inner: Some(inner),
            pool,
        })
    }

    fn reject(&self) -> impl FnOnce(ffmpeg_next::Error) -> CodecError + '_ {
        move |e| CodecError::DecodeRejected(format!("{}: {}", self.name, e))
    }
}

/// Hardware surfaces are copied back to system memory first.
fn download(frame: &frame::Video) -> Result<frame::Video> {
    let mut sw = frame::Video::empty();
    let ret =
        unsafe { ffmpeg_next::ffi::av_hwframe_transfer_data(sw.as_mut_ptr(), frame.as_ptr(), 0) };
    if ret < 0 {
        return Err(CodecError::DecodeRejected(format!(
            "hwframe download: {}",
            ffmpeg_next::Error::from(ret)
        )));
    }
    sw.set_pts(frame.pts());
    Ok(sw)
}

fn picture(frame: &frame::Video, pool: Option<&FramePool>) -> Result<RawFrame> {
    let downloaded;
    let frame = if pixel_from_av(frame.format()).is_none()
        && unsafe { !(*frame.as_ptr()).hw_frames_ctx.is_null() }
    {
        downloaded = download(frame)?;
        &downloaded
    } else {
        frame
    };
    let Some(pixel) = pixel_from_av(frame.format()) else {
        return Err(CodecError::DecodeRejected(format!(
            "unsupported pixel format {:?}",
            frame.format()
        )));
    };
    let format = VideoFormat {
        pixel,
        width: frame.width(),
        height: frame.height(),
    };
    let len = format.frame_bytes();

    match pool {
        Some(pool) => {
            // blocks until a consumer releases a buffer or the pool closes
            let mut buffer = pool.acquire()?;
            if len > buffer.capacity() {
                return Err(CodecError::DecodeRejected(format!(
                    "picture of {} bytes exceeds pool block of {} bytes",
                    len,
                    buffer.capacity()
                )));
            }
            read_video(frame, &format, &mut buffer.data_mut()[..len]);
            buffer.set_len(len);
            Ok(RawFrame::device(FrameFormat::Video(format), buffer, frame.pts()))
        }
        None => {
            let mut data = vec![0u8; len];
            read_video(frame, &format, &mut data);
            Ok(RawFrame::host(
                FrameFormat::Video(format),
                Bytes::from(data),
                frame.pts(),
            ))
        }
    }
}

fn pcm(frame: &frame::Audio) -> Result<RawFrame> {
    let Some(sample) = sample_from_av(frame.format()) else {
        return Err(CodecError::DecodeRejected(format!(
            "unsupported sample format {:?}",
            frame.format()
        )));
    };
    let channels = unsafe { (*frame.as_ptr()).ch_layout.nb_channels };
    let format = AudioFormat {
        sample,
        channels: channels.max(1) as u16,
        rate: frame.rate(),
    };
    let samples = frame.samples();
    let data = read_audio(frame, &format, samples);
    Ok(RawFrame::host(
        FrameFormat::Audio { format, samples },
        Bytes::from(data),
        frame.pts(),
    ))
}

impl Backend for FfmpegDecoder {
    type Input = CompressedUnit;
    type Output = RawFrame;

    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn submit(&mut self, unit: CompressedUnit) -> Result<()> {
        let mut packet = Packet::copy(unit.data());
        packet.set_pts(unit.pts());
        let result = match self.inner.as_mut() {
            Some(DecoderType::Video(decoder)) => decoder.send_packet(&packet),
            Some(DecoderType::Audio(decoder)) => decoder.send_packet(&packet),
            None => return Err(CodecError::Closed),
        };
        result.map_err(self.reject())
    }

    fn retrieve(&mut self) -> Result<Option<RawFrame>> {
        let name = &self.name;
        let reject = |e: ffmpeg_next::Error| CodecError::DecodeRejected(format!("{}: {}", name, e));
        match self.inner.as_mut() {
            Some(DecoderType::Video(decoder)) => {
                let mut frame = frame::Video::empty();
                match decoder.receive_frame(&mut frame) {
                    Ok(()) => picture(&frame, self.pool.as_ref()).map(Some),
                    Err(e) => pending(e, reject),
                }
            }
            Some(DecoderType::Audio(decoder)) => {
                let mut frame = frame::Audio::empty();
                match decoder.receive_frame(&mut frame) {
                    Ok(()) => pcm(&frame).map(Some),
                    Err(e) => pending(e, reject),
                }
            }
            None => Ok(None),
        }
    }

    fn send_eof(&mut self) -> Result<()> {
        let result = match self.inner.as_mut() {
            Some(DecoderType::Video(decoder)) => decoder.send_eof(),
            Some(DecoderType::Audio(decoder)) => decoder.send_eof(),
            None => return Ok(()),
        };
        result.map_err(self.reject())
    }

    fn close(&mut self) {
        if self.inner.take().is_some() {
            log::debug!("decoder closed: {}", self.name);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::thread;
    use std::time::{Duration, Instant};

    use ffmpeg_next::format::Pixel;

    use super::*;
    use crate::frame::PixelFormat;
    use crate::scaler::write_video;

    #[test]
    fn test_picture_waits_for_pool_release() -> anyhow::Result<()> {
        ffmpeg_next::init()?;
        let format = VideoFormat {
            pixel: PixelFormat::Yuv420p,
            width: 4,
            height: 4,
        };
        let src: Vec<u8> = (0..format.frame_bytes()).map(|i| i as u8).collect();
        let mut frame = frame::Video::new(Pixel::YUV420P, 4, 4);
        write_video(&mut frame, &format, &src)?;

        let ctx = DeviceContext::new(BackendKind::Gpu, 0);
        let pool = FramePool::new(&ctx, "decode-wait", format.frame_bytes(), 1)?;
        let held = pool.acquire()?;
        // a consumer stalled well beyond a couple of seconds
        let consumer = thread::spawn(move || {
            thread::sleep(Duration::from_millis(2500));
            drop(held);
        });

        let start = Instant::now();
        let picture = picture(&frame, Some(&pool))?;
        assert!(start.elapsed() >= Duration::from_millis(2400));
        assert!(picture.is_device());
        assert_eq!(picture.bytes(), &src[..]);
        consumer.join().unwrap();
        Ok(())
    }

    #[test]
    fn test_picture_fails_once_pool_closes() -> anyhow::Result<()> {
        ffmpeg_next::init()?;
        let frame = frame::Video::new(Pixel::YUV420P, 4, 4);
        let ctx = DeviceContext::new(BackendKind::Gpu, 0);
        let pool = FramePool::new(&ctx, "decode-close", 64, 1)?;
        let _held = pool.acquire()?;
        let closer = pool.clone();
        let handle = thread::spawn(move || {
            thread::sleep(Duration::from_millis(200));
            closer.close();
        });
        assert!(matches!(picture(&frame, Some(&pool)), Err(CodecError::Closed)));
        handle.join().unwrap();
        Ok(())
    }
}
