//! Format-converter adapters.
//!
//! The pixel and sample conversion math lives in an engine behind
//! [`ScaleEngine`] / [`ResampleEngine`]; the adapters here turn an engine
//! into a [`Backend`] that takes decoded frames, releases them once
//! converted and hands back uniquely owned [`ConvertedFrame`]s.

use std::collections::VecDeque;

use bytes::Bytes;

use crate::{
    backend::{Backend, BackendKind},
    error::{CodecError, Result},
    frame::{AudioFormat, ConvertedFrame, FrameFormat, PixelFormat, RawFrame, VideoFormat},
};

pub trait ScaleEngine: Send {
    /// Converts one tightly packed picture `src` of layout `from` into `dst`,
    /// which is exactly `to.frame_bytes()` long.
    fn scale(&mut self, from: &VideoFormat, src: &[u8], to: &VideoFormat, dst: &mut [u8])
    -> Result<()>;
}

pub trait ResampleEngine: Send {
    /// Input samples per channel held inside the engine, at the input rate.
    fn delay(&self) -> usize;

    /// Converts `samples` samples per channel. Planar output planes are laid
    /// out `capacity` samples apart in `dst`. Returns samples written per
    /// channel, never more than `capacity`.
    fn resample(
        &mut self,
        from: &AudioFormat,
        src: &[u8],
        samples: usize,
        to: &AudioFormat,
        dst: &mut [u8],
        capacity: usize,
    ) -> Result<usize>;

    /// Emits whatever the engine still holds, same layout as `resample`.
    fn drain(&mut self, to: &AudioFormat, dst: &mut [u8], capacity: usize) -> Result<usize>;
}

fn rescale_up(samples: usize, from_rate: u32, to_rate: u32) -> usize {
    let from_rate = from_rate.max(1) as u64;
    ((samples as u64 * to_rate as u64).div_ceil(from_rate)) as usize
}

/// Output samples per channel to allocate for one conversion. The engine's
/// pending delay can push the real output past the nominal estimate, so the
/// larger of the two wins.
pub fn output_capacity(in_samples: usize, delay: usize, in_rate: u32, out_rate: u32) -> usize {
    let nominal = rescale_up(in_samples, in_rate, out_rate);
    let recomputed = rescale_up(delay + in_samples, in_rate, out_rate);
    nominal.max(recomputed)
}

/// Moves planes laid out `capacity` samples apart next to each other once
/// only `written` samples per plane are valid.
fn pack_planes(buf: &mut Vec<u8>, format: &AudioFormat, capacity: usize, written: usize) {
    let bps = format.sample.bytes_per_sample();
    if format.sample.is_planar() {
        let stride = capacity * bps;
        let len = written * bps;
        for ch in 1..format.channels as usize {
            buf.copy_within(ch * stride..ch * stride + len, ch * len);
        }
    }
    buf.truncate(format.buffer_bytes(written));
}

pub struct AudioConverter<E: ResampleEngine> {
    kind: BackendKind,
    engine: Option<E>,
    target: AudioFormat,
    /// Largest output allocation so far, in samples per channel.
    high_water: usize,
    /// Rate of the last submitted frame; sizes the drain at end of stream.
    in_rate: u32,
    next_pts: Option<i64>,
    pending: VecDeque<ConvertedFrame>,
}

impl<E: ResampleEngine> AudioConverter<E> {
    pub fn new(kind: BackendKind, engine: E, target: AudioFormat) -> Self {
        Self {
            kind,
            engine: Some(engine),
            target,
            high_water: 0,
            in_rate: target.rate,
            next_pts: None,
            pending: VecDeque::new(),
        }
    }

    pub fn target(&self) -> &AudioFormat {
        &self.target
    }

    pub fn high_water(&self) -> usize {
        self.high_water
    }
}

fn push_pcm(
    pending: &mut VecDeque<ConvertedFrame>,
    target: &AudioFormat,
    mut out: Vec<u8>,
    capacity: usize,
    written: usize,
    pts: Option<i64>,
) {
    if written == 0 {
        return;
    }
    pack_planes(&mut out, target, capacity, written);
    let format = FrameFormat::Audio {
        format: *target,
        samples: written,
    };
    pending.push_back(ConvertedFrame::new(format, Bytes::from(out), pts));
}

impl<E: ResampleEngine> Backend for AudioConverter<E> {
    type Input = RawFrame;
    type Output = ConvertedFrame;

    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn name(&self) -> &str {
        "resample"
    }

    fn submit(&mut self, frame: RawFrame) -> Result<()> {
        let Some(engine) = self.engine.as_mut() else {
            return Err(CodecError::Closed);
        };
        let FrameFormat::Audio { format, samples } = *frame.format() else {
            return Err(CodecError::EncodeRejected(format!(
                "resampler got a video frame: {}",
                frame.format()
            )));
        };

        let capacity = output_capacity(samples, engine.delay(), format.rate, self.target.rate);
        self.high_water = self.high_water.max(capacity);
        self.in_rate = format.rate;
        let mut out = vec![0u8; self.target.buffer_bytes(capacity)];
        let written = engine.resample(
            &format,
            frame.bytes(),
            samples,
            &self.target,
            &mut out,
            capacity,
        );
        let pts = frame.pts().or(self.next_pts);
        frame.release();
        let written = written?.min(capacity);

        self.next_pts = pts.map(|p| p + written as i64);
        push_pcm(&mut self.pending, &self.target, out, capacity, written, pts);
        Ok(())
    }

    fn retrieve(&mut self) -> Result<Option<ConvertedFrame>> {
        Ok(self.pending.pop_front())
    }

    fn send_eof(&mut self) -> Result<()> {
        let Some(engine) = self.engine.as_mut() else {
            return Ok(());
        };
        loop {
            let capacity =
                output_capacity(0, engine.delay(), self.in_rate, self.target.rate).max(1);
            let mut out = vec![0u8; self.target.buffer_bytes(capacity)];
            let written = engine.drain(&self.target, &mut out, capacity)?.min(capacity);
            let pts = self.next_pts;
            self.next_pts = pts.map(|p| p + written as i64);
            push_pcm(&mut self.pending, &self.target, out, capacity, written, pts);
            // a full buffer may mean more is left behind
            if written < capacity {
                return Ok(());
            }
        }
    }

    fn close(&mut self) {
        self.engine = None;
        self.pending.clear();
    }
}

pub struct VideoConverter<E: ScaleEngine> {
    kind: BackendKind,
    engine: Option<E>,
    pixel: PixelFormat,
    size: Option<(u32, u32)>,
    pending: Option<ConvertedFrame>,
}

impl<E: ScaleEngine> VideoConverter<E> {
    pub fn new(kind: BackendKind, engine: E, pixel: PixelFormat, size: Option<(u32, u32)>) -> Self {
        Self {
            kind,
            engine: Some(engine),
            pixel,
            size,
            pending: None,
        }
    }

    fn output_format(&self, from: &VideoFormat) -> VideoFormat {
        let (width, height) = self.size.unwrap_or((from.width, from.height));
        VideoFormat {
            pixel: self.pixel,
            width,
            height,
        }
    }
}

impl<E: ScaleEngine> Backend for VideoConverter<E> {
    type Input = RawFrame;
    type Output = ConvertedFrame;

    fn kind(&self) -> BackendKind {
        self.kind
    }

    fn name(&self) -> &str {
        "scale"
    }

    fn submit(&mut self, frame: RawFrame) -> Result<()> {
        if self.engine.is_none() {
            return Err(CodecError::Closed);
        }
        let FrameFormat::Video(from) = *frame.format() else {
            return Err(CodecError::EncodeRejected(format!(
                "scaler got an audio frame: {}",
                frame.format()
            )));
        };
        let to = self.output_format(&from);
        let pts = frame.pts();

        let data = if from == to {
            Bytes::copy_from_slice(frame.bytes())
        } else {
            let mut out = vec![0u8; to.frame_bytes()];
            let result = match self.engine.as_mut() {
                Some(engine) => engine.scale(&from, frame.bytes(), &to, &mut out),
                None => Err(CodecError::Closed),
            };
            if let Err(e) = result {
                frame.release();
                return Err(e);
            }
            Bytes::from(out)
        };
        frame.release();

        self.pending = Some(ConvertedFrame::new(FrameFormat::Video(to), data, pts));
        Ok(())
    }

    fn retrieve(&mut self) -> Result<Option<ConvertedFrame>> {
        Ok(self.pending.take())
    }

    fn send_eof(&mut self) -> Result<()> {
        Ok(())
    }

    fn close(&mut self) {
        self.engine = None;
        self.pending = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::frame::SampleFormat;

    /// Rate converter that holds back `lag` input samples on every call and
    /// releases all of them on drain. Writes sample index values.
    struct LaggingResampler {
        lag: usize,
        held: usize,
        in_rate: u32,
    }

    impl ResampleEngine for LaggingResampler {
        fn delay(&self) -> usize {
            self.held
        }

        fn resample(
            &mut self,
            from: &AudioFormat,
            _src: &[u8],
            samples: usize,
            to: &AudioFormat,
            dst: &mut [u8],
            capacity: usize,
        ) -> Result<usize> {
            self.in_rate = from.rate;
            let total = self.held + samples;
            self.held = self.lag.min(total);
            let n = rescale_up(total - self.held, from.rate, to.rate);
            if n > capacity {
                return Err(CodecError::EncodeRejected("output truncated".into()));
            }
            let bps = to.sample.bytes_per_sample();
            for ch in 0..to.channels as usize {
                for s in 0..n {
                    let at = (ch * capacity + s) * bps;
                    dst[at] = ch as u8 + 1;
                }
            }
            Ok(n)
        }

        fn drain(&mut self, to: &AudioFormat, _dst: &mut [u8], capacity: usize) -> Result<usize> {
            let n = rescale_up(self.held, self.in_rate, to.rate).min(capacity);
            self.held = 0;
            Ok(n)
        }
    }

    fn pcm(samples: usize, rate: u32) -> RawFrame {
        let format = AudioFormat {
            sample: SampleFormat::S16,
            channels: 2,
            rate,
        };
        RawFrame::host(
            FrameFormat::Audio { format, samples },
            Bytes::from(vec![0u8; format.buffer_bytes(samples)]),
            Some(0),
        )
    }

    #[test]
    fn test_output_capacity_accounts_for_delay() {
        assert_eq!(output_capacity(1024, 0, 48000, 44100), 941);
        assert_eq!(output_capacity(1024, 100, 48000, 44100), 1033);
        assert_eq!(output_capacity(1024, 0, 44100, 44100), 1024);
        assert_eq!(output_capacity(1, 0, 8000, 48000), 6);
    }

    #[test]
    fn test_resample_never_truncates() -> anyhow::Result<()> {
        let target = AudioFormat {
            sample: SampleFormat::Fltp,
            channels: 2,
            rate: 44100,
        };
        let engine = LaggingResampler {
            lag: 64,
            held: 0,
            in_rate: 0,
        };
        let mut conv = AudioConverter::new(BackendKind::Software, engine, target);

        // first call holds 64 back, the second releases them plus its own
        conv.submit(pcm(1024, 48000))?;
        conv.submit(pcm(1024, 48000))?;
        let frames: Vec<_> = conv.drain().collect::<Result<_>>()?;
        assert_eq!(frames.len(), 2);
        assert_eq!(frames[0].samples(), Some(882));
        assert_eq!(frames[1].samples(), Some(941));
        assert!(conv.high_water() >= 941);

        // planes packed back to back after truncation
        let f = &frames[1];
        assert_eq!(f.data.len(), 941 * 4 * 2);
        assert_eq!(f.data[0], 1);
        assert_eq!(f.data[941 * 4], 2);

        let tail: Vec<_> = conv.flush()?.collect::<Result<_>>()?;
        assert_eq!(tail.len(), 1);
        assert_eq!(tail[0].samples(), Some(59));
        Ok(())
    }

    #[test]
    fn test_close_rejects_further_input() {
        let mut conv = AudioConverter::new(
            BackendKind::Software,
            LaggingResampler {
                lag: 0,
                held: 0,
                in_rate: 0,
            },
            AudioFormat::default(),
        );
        conv.close();
        conv.close();
        assert!(matches!(conv.submit(pcm(10, 44100)), Err(CodecError::Closed)));
    }

    /// Fills the destination with a marker byte.
    struct Marker(u8);

    impl ScaleEngine for Marker {
        fn scale(
            &mut self,
            _from: &VideoFormat,
            _src: &[u8],
            _to: &VideoFormat,
            dst: &mut [u8],
        ) -> Result<()> {
            dst.fill(self.0);
            Ok(())
        }
    }

    fn picture(pixel: PixelFormat, width: u32, height: u32) -> RawFrame {
        let format = VideoFormat {
            pixel,
            width,
            height,
        };
        RawFrame::host(
            FrameFormat::Video(format),
            Bytes::from(vec![1u8; format.frame_bytes()]),
            Some(40),
        )
    }

    #[test]
    fn test_scale_to_target() -> anyhow::Result<()> {
        let mut conv = VideoConverter::new(BackendKind::Software, Marker(9), PixelFormat::Bgr24, None);
        conv.submit(picture(PixelFormat::Nv12, 4, 2))?;
        let out = conv.retrieve()?.unwrap();
        assert_eq!(out.data.len(), 4 * 2 * 3);
        assert!(out.data.iter().all(|b| *b == 9));
        assert_eq!(out.pts, Some(40));
        assert!(conv.retrieve()?.is_none());

        // same layout skips the engine
        conv.submit(picture(PixelFormat::Bgr24, 4, 2))?;
        let out = conv.retrieve()?.unwrap();
        assert!(out.data.iter().all(|b| *b == 1));
        Ok(())
    }

    #[test]
    fn test_scale_resizes_and_rejects_audio() {
        let mut conv = VideoConverter::new(
            BackendKind::Software,
            Marker(0),
            PixelFormat::Yuv420p,
            Some((8, 8)),
        );
        conv.submit(picture(PixelFormat::Nv12, 4, 4)).unwrap();
        let out = conv.retrieve().unwrap().unwrap();
        assert_eq!(out.data.len(), PixelFormat::Yuv420p.frame_bytes(8, 8));

        let err = conv.submit(pcm(16, 44100)).unwrap_err();
        assert!(matches!(err, CodecError::EncodeRejected(_)));
    }
}
