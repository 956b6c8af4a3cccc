//! Sample FIFO that re-chunks PCM into the fixed frame size AAC encoders
//! demand.

use crate::{
    error::{CodecError, Result},
    frame::AudioFormat,
};

pub struct SampleFifo {
    format: AudioFormat,
    /// One buffer per plane; a single interleaved buffer for packed layouts.
    planes: Vec<Vec<u8>>,
    samples: usize,
}

impl SampleFifo {
    pub fn new(format: AudioFormat) -> Self {
        let planes = if format.sample.is_planar() {
            format.channels.max(1) as usize
        } else {
            1
        };
        Self {
            format,
            planes: vec![Vec::new(); planes],
            samples: 0,
        }
    }

    pub fn format(&self) -> &AudioFormat {
        &self.format
    }

    /// Samples per channel queued.
    pub fn len(&self) -> usize {
        self.samples
    }

    pub fn is_empty(&self) -> bool {
        self.samples == 0
    }

    fn plane_bytes(&self, samples: usize) -> usize {
        samples * self.format.buffer_bytes(1) / self.planes.len()
    }

    /// Appends `samples` samples per channel, planes back to back in `data`.
    pub fn push(&mut self, data: &[u8], samples: usize) -> Result<()> {
        if data.len() != self.format.buffer_bytes(samples) {
            return Err(CodecError::EncodeRejected(format!(
                "pcm of {} bytes does not hold {} samples of {:?}",
                data.len(),
                samples,
                self.format
            )));
        }
        let len = self.plane_bytes(samples);
        for (i, plane) in self.planes.iter_mut().enumerate() {
            plane.extend_from_slice(&data[i * len..(i + 1) * len]);
        }
        self.samples += samples;
        Ok(())
    }

    /// Takes exactly `samples` samples per channel, or nothing if fewer are
    /// queued.
    pub fn pop(&mut self, samples: usize) -> Option<Vec<u8>> {
        if samples == 0 || self.samples < samples {
            return None;
        }
        let len = self.plane_bytes(samples);
        let mut out = Vec::with_capacity(len * self.planes.len());
        for plane in self.planes.iter_mut() {
            out.extend(plane.drain(..len));
        }
        self.samples -= samples;
        Some(out)
    }

    /// Takes whatever is left, with its length in samples per channel.
    pub fn pop_rest(&mut self) -> Option<(Vec<u8>, usize)> {
        let samples = self.samples;
        self.pop(samples).map(|data| (data, samples))
    }
}
