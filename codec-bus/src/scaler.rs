//! FFmpeg conversion engines and frame layout glue.
//!
//! `swscale` and `swresample` contexts are rebuilt whenever the source layout
//! changes mid-stream; the packed buffers the pipelines pass around are copied
//! in and out of FFmpeg frames with their line strides honoured.

use ffmpeg_next::{
    ChannelLayout,
    format::{Pixel, Sample, sample::Type},
    frame,
    software::{resampling, scaling},
};

use crate::{
    converter::{ResampleEngine, ScaleEngine},
    error::{CodecError, Result},
    frame::{AudioFormat, PixelFormat, SampleFormat, VideoFormat},
};

pub(crate) fn av_pixel(pixel: PixelFormat) -> Pixel {
    match pixel {
        PixelFormat::Yuv420p => Pixel::YUV420P,
        PixelFormat::Nv12 => Pixel::NV12,
        PixelFormat::Bgr24 => Pixel::BGR24,
        PixelFormat::Rgb24 => Pixel::RGB24,
    }
}

pub(crate) fn pixel_from_av(pixel: Pixel) -> Option<PixelFormat> {
    match pixel {
        Pixel::YUV420P | Pixel::YUVJ420P => Some(PixelFormat::Yuv420p),
        Pixel::NV12 => Some(PixelFormat::Nv12),
        Pixel::BGR24 => Some(PixelFormat::Bgr24),
        Pixel::RGB24 => Some(PixelFormat::Rgb24),
        _ => None,
    }
}

pub(crate) fn av_sample(sample: SampleFormat) -> Sample {
    match sample {
        SampleFormat::S16 => Sample::I16(Type::Packed),
        SampleFormat::S16p => Sample::I16(Type::Planar),
        SampleFormat::Flt => Sample::F32(Type::Packed),
        SampleFormat::Fltp => Sample::F32(Type::Planar),
    }
}

pub(crate) fn sample_from_av(sample: Sample) -> Option<SampleFormat> {
    match sample {
        Sample::I16(Type::Packed) => Some(SampleFormat::S16),
        Sample::I16(Type::Planar) => Some(SampleFormat::S16p),
        Sample::F32(Type::Packed) => Some(SampleFormat::Flt),
        Sample::F32(Type::Planar) => Some(SampleFormat::Fltp),
        _ => None,
    }
}

pub(crate) fn av_layout(channels: u16) -> ChannelLayout {
    ChannelLayout::default(channels as i32)
}

/// Copies a tightly packed picture into `frame`.
pub(crate) fn write_video(frame: &mut frame::Video, format: &VideoFormat, src: &[u8]) -> Result<()> {
    if src.len() < format.frame_bytes() {
        return Err(CodecError::EncodeRejected(format!(
            "short picture: {} bytes for {:?} {}x{}",
            src.len(),
            format.pixel,
            format.width,
            format.height
        )));
    }
    let mut offset = 0;
    for plane in 0..format.pixel.planes() {
        let row = format.pixel.plane_row_bytes(plane, format.width);
        let rows = format.pixel.plane_rows(plane, format.height);
        let stride = frame.stride(plane);
        let data = frame.data_mut(plane);
        for r in 0..rows {
            data[r * stride..r * stride + row].copy_from_slice(&src[offset..offset + row]);
            offset += row;
        }
    }
    Ok(())
}

/// Copies `frame` into `dst` tightly packed. `dst` must hold
/// `format.frame_bytes()` bytes.
pub(crate) fn read_video(frame: &frame::Video, format: &VideoFormat, dst: &mut [u8]) {
    let mut offset = 0;
    for plane in 0..format.pixel.planes() {
        let row = format.pixel.plane_row_bytes(plane, format.width);
        let rows = format.pixel.plane_rows(plane, format.height);
        let stride = frame.stride(plane);
        let data = frame.data(plane);
        for r in 0..rows {
            dst[offset..offset + row].copy_from_slice(&data[r * stride..r * stride + row]);
            offset += row;
        }
    }
}

/// Copies `samples` samples per channel out of `frame`, planes back to back.
pub(crate) fn read_audio(frame: &frame::Audio, format: &AudioFormat, samples: usize) -> Vec<u8> {
    let bps = format.sample.bytes_per_sample();
    let mut out = Vec::with_capacity(format.buffer_bytes(samples));
    if format.sample.is_planar() {
        for ch in 0..format.channels as usize {
            out.extend_from_slice(&frame.data(ch)[..samples * bps]);
        }
    } else {
        out.extend_from_slice(&frame.data(0)[..samples * bps * format.channels as usize]);
    }
    out
}

fn write_audio(frame: &mut frame::Audio, format: &AudioFormat, src: &[u8], samples: usize) {
    let bps = format.sample.bytes_per_sample();
    if format.sample.is_planar() {
        let len = samples * bps;
        for ch in 0..format.channels as usize {
            frame.data_mut(ch)[..len].copy_from_slice(&src[ch * len..(ch + 1) * len]);
        }
    } else {
        let len = samples * bps * format.channels as usize;
        frame.data_mut(0)[..len].copy_from_slice(&src[..len]);
    }
}

/// Copies `written` samples per channel of `frame` into `dst` with planes
/// `capacity` samples apart.
fn spread_audio(
    frame: &frame::Audio,
    format: &AudioFormat,
    written: usize,
    dst: &mut [u8],
    capacity: usize,
) {
    let bps = format.sample.bytes_per_sample();
    if format.sample.is_planar() {
        let len = written * bps;
        let stride = capacity * bps;
        for ch in 0..format.channels as usize {
            dst[ch * stride..ch * stride + len].copy_from_slice(&frame.data(ch)[..len]);
        }
    } else {
        let len = written * bps * format.channels as usize;
        dst[..len].copy_from_slice(&frame.data(0)[..len]);
    }
}

#[derive(Default)]
pub struct SwsScaleEngine {
    context: Option<(VideoFormat, VideoFormat, scaling::Context)>,
}

unsafe impl Send for SwsScaleEngine {}

impl ScaleEngine for SwsScaleEngine {
    fn scale(
        &mut self,
        from: &VideoFormat,
        src: &[u8],
        to: &VideoFormat,
        dst: &mut [u8],
    ) -> Result<()> {
        let stale = !matches!(&self.context, Some((f, t, _)) if f == from && t == to);
        if stale {
            log::debug!(
                "scaler: {:?} {}x{} -> {:?} {}x{}",
                from.pixel,
                from.width,
                from.height,
                to.pixel,
                to.width,
                to.height
            );
            let context = scaling::Context::get(
                av_pixel(from.pixel),
                from.width,
                from.height,
                av_pixel(to.pixel),
                to.width,
                to.height,
                scaling::flag::Flags::BILINEAR,
            )
            .map_err(|e| CodecError::EncodeRejected(format!("scaler init: {}", e)))?;
            self.context = Some((*from, *to, context));
        }
        let Some((_, _, context)) = self.context.as_mut() else {
            return Err(CodecError::Closed);
        };

        let mut input = frame::Video::new(av_pixel(from.pixel), from.width, from.height);
        write_video(&mut input, from, src)?;
        let mut output = frame::Video::empty();
        context
            .run(&input, &mut output)
            .map_err(|e| CodecError::EncodeRejected(format!("scale: {}", e)))?;
        read_video(&output, to, dst);
        Ok(())
    }
}

#[derive(Default)]
pub struct SwrResampleEngine {
    context: Option<(AudioFormat, AudioFormat, resampling::Context)>,
}

unsafe impl Send for SwrResampleEngine {}

impl SwrResampleEngine {
    fn output_frame(to: &AudioFormat, capacity: usize) -> frame::Audio {
        let mut output = frame::Audio::new(av_sample(to.sample), capacity, av_layout(to.channels));
        output.set_rate(to.rate);
        output
    }
}

impl ResampleEngine for SwrResampleEngine {
    fn delay(&self) -> usize {
        self.context
            .as_ref()
            .and_then(|(_, _, c)| c.delay())
            .map(|d| d.input.max(0) as usize)
            .unwrap_or(0)
    }

    fn resample(
        &mut self,
        from: &AudioFormat,
        src: &[u8],
        samples: usize,
        to: &AudioFormat,
        dst: &mut [u8],
        capacity: usize,
    ) -> Result<usize> {
        let stale = !matches!(&self.context, Some((f, t, _)) if f == from && t == to);
        if stale {
            log::debug!("resampler: {:?} -> {:?}", from, to);
            let context = resampling::Context::get(
                av_sample(from.sample),
                av_layout(from.channels),
                from.rate,
                av_sample(to.sample),
                av_layout(to.channels),
                to.rate,
            )
            .map_err(|e| CodecError::EncodeRejected(format!("resampler init: {}", e)))?;
            self.context = Some((*from, *to, context));
        }
        let Some((_, _, context)) = self.context.as_mut() else {
            return Err(CodecError::Closed);
        };

        let mut input = frame::Audio::new(av_sample(from.sample), samples, av_layout(from.channels));
        input.set_rate(from.rate);
        write_audio(&mut input, from, src, samples);

        let mut output = Self::output_frame(to, capacity);
        context
            .run(&input, &mut output)
            .map_err(|e| CodecError::EncodeRejected(format!("resample: {}", e)))?;
        let written = output.samples().min(capacity);
        spread_audio(&output, to, written, dst, capacity);
        Ok(written)
    }

    fn drain(&mut self, to: &AudioFormat, dst: &mut [u8], capacity: usize) -> Result<usize> {
        let Some((_, _, context)) = self.context.as_mut() else {
            return Ok(0);
        };
        let mut output = Self::output_frame(to, capacity);
        context
            .flush(&mut output)
            .map_err(|e| CodecError::EncodeRejected(format!("resample flush: {}", e)))?;
        let written = output.samples().min(capacity);
        spread_audio(&output, to, written, dst, capacity);
        Ok(written)
    }
}
