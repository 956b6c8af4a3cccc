//! Transcoding session.
//!
//! Per media type the session runs one decode pipeline feeding one encode
//! pipeline: video is decoded to the consumer pixel format and re-encoded,
//! audio is resampled to the consumer PCM format and re-encoded to AAC.
//! Audio and video are independent; nothing aligns them in time.

use std::sync::Arc;

use crate::{
    backend::{BackendFactory, EncoderParams},
    config::SessionConfig,
    device::DeviceContext,
    error::Result,
    frame::ConvertedFrame,
    packet::{CompressedUnit, MediaKind},
    pipeline::{DecodePipeline, EncodePipeline},
    source::StreamInfo,
};

/// Receives the session's output. Called from pipeline threads, so every
/// method must return promptly.
pub trait UnitSink: Send + Sync {
    fn on_video(&self, unit: CompressedUnit);

    fn on_audio(&self, unit: CompressedUnit);

    /// Sees each decoded picture, in the consumer format, before it is
    /// re-encoded.
    fn on_video_frame(&self, _frame: &ConvertedFrame) {}

    fn on_audio_frame(&self, _frame: &ConvertedFrame) {}
}

struct Chain {
    stream: StreamInfo,
    decode: DecodePipeline,
    encode: Arc<EncodePipeline>,
}

impl Chain {
    fn open(
        factory: &dyn BackendFactory,
        ctx: &Arc<DeviceContext>,
        config: &SessionConfig,
        stream: StreamInfo,
        sink: Arc<dyn UnitSink>,
    ) -> Result<Self> {
        let params = match stream {
            StreamInfo::Video {
                width, height, fps, ..
            } => EncoderParams::Video {
                codec: config.video_codec,
                width,
                height,
                fps,
                bit_rate: config.video_bit_rate,
            },
            StreamInfo::Audio { .. } => EncoderParams::Audio {
                channels: config.audio_output.channels,
                sample_rate: config.audio_output.rate,
                bit_rate: config.audio_bit_rate,
            },
        };
        let is_video = stream.is_video();

        let encode = Arc::new(EncodePipeline::open(factory, ctx, config, &params)?);
        let encoded_sink = sink.clone();
        encode.set_output_listener(move |unit: CompressedUnit| {
            if is_video {
                encoded_sink.on_video(unit);
            } else {
                encoded_sink.on_audio(unit);
            }
        });

        let decode = DecodePipeline::open(factory, ctx, config, &stream)?;
        let encoder = encode.clone();
        decode.set_output_listener(move |frame: ConvertedFrame| {
            if is_video {
                sink.on_video_frame(&frame);
            } else {
                sink.on_audio_frame(&frame);
            }
            if let Err(e) = encoder.ingest(frame.into_raw()) {
                log::debug!("encoder {} refused frame: {}", encoder.name(), e);
            }
        });

        Ok(Self {
            stream,
            decode,
            encode,
        })
    }

    fn log_stats(&self) {
        let ingest = self.decode.ingest_stats();
        let encode_in = self.encode.ingest_stats();
        let encode_mid = self.encode.middle_stats();
        log::info!(
            "{}: {} units in, {} frames decoded, {} units encoded, {} frames dropped, {} failures",
            self.stream.media(),
            ingest.pushed,
            self.decode.output_rate().total(),
            self.encode.output_rate().total(),
            encode_in.dropped + encode_mid.dropped,
            self.decode.failures() + self.encode.failures()
        );
    }
}

pub struct Session {
    video: Option<Chain>,
    audio: Option<Chain>,
}

impl Session {
    /// Opens a chain for the first video and the first audio stream in
    /// `streams`. Fails if any backend cannot be initialized at all.
    pub fn open(
        factory: &dyn BackendFactory,
        ctx: &Arc<DeviceContext>,
        config: &SessionConfig,
        streams: &[StreamInfo],
        sink: Arc<dyn UnitSink>,
    ) -> Result<Self> {
        let video = streams
            .iter()
            .find(|s| s.is_video())
            .map(|s| Chain::open(factory, ctx, config, *s, sink.clone()))
            .transpose()?;
        let audio = streams
            .iter()
            .find(|s| !s.is_video())
            .map(|s| Chain::open(factory, ctx, config, *s, sink.clone()))
            .transpose()?;
        log::info!(
            "session opened: video: {:?}, audio: {:?}",
            video.as_ref().map(|c| c.stream),
            audio.as_ref().map(|c| c.stream)
        );
        Ok(Self { video, audio })
    }

    /// Routes one unit to the decode pipeline for its media. Units of a
    /// media the session has no chain for are ignored.
    pub fn push(&self, unit: CompressedUnit) -> Result<()> {
        let chain = match unit.kind() {
            MediaKind::Video(_) => self.video.as_ref(),
            MediaKind::Aac => self.audio.as_ref(),
        };
        match chain {
            Some(chain) => chain.decode.ingest(unit),
            None => {
                log::trace!("no chain for {}, unit ignored", unit.kind());
                Ok(())
            }
        }
    }

    pub fn video_decoder(&self) -> Option<&DecodePipeline> {
        self.video.as_ref().map(|c| &c.decode)
    }

    pub fn audio_decoder(&self) -> Option<&DecodePipeline> {
        self.audio.as_ref().map(|c| &c.decode)
    }

    pub fn video_encoder(&self) -> Option<&EncodePipeline> {
        self.video.as_ref().map(|c| c.encode.as_ref())
    }

    pub fn audio_encoder(&self) -> Option<&EncodePipeline> {
        self.audio.as_ref().map(|c| c.encode.as_ref())
    }

    /// Stops both decode pipelines, then both encode pipelines, so every
    /// frame flushed out of a decoder still reaches its encoder.
    pub fn close(&self) {
        let chains: Vec<&Chain> = self.video.iter().chain(self.audio.iter()).collect();
        for chain in &chains {
            chain.decode.stop();
        }
        for chain in &chains {
            chain.encode.stop();
        }
        for chain in &chains {
            chain.log_stats();
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use bytes::Bytes;

    use crate::{
        backend::{
            Backend, BackendKind, ConvertBackend, ConvertTarget, DecodeBackend, EncodeBackend,
        },
        error::CodecError,
        frame::{AudioFormat, FrameFormat, PixelFormat, RawFrame, VideoFormat},
        packet::VideoCodec,
        pool::FramePool,
    };

    /// Moves bytes through unchanged; optionally holds one item back until
    /// end of stream.
    struct Relay<I, O> {
        held: Option<I>,
        ready: Vec<O>,
        lookahead: bool,
        map: fn(I) -> O,
    }

    impl<I: Send, O: Send> Relay<I, O> {
        fn new(lookahead: bool, map: fn(I) -> O) -> Self {
            Self {
                held: None,
                ready: Vec::new(),
                lookahead,
                map,
            }
        }
    }

    impl<I: Send, O: Send> Backend for Relay<I, O> {
        type Input = I;
        type Output = O;

        fn kind(&self) -> BackendKind {
            BackendKind::Software
        }

        fn name(&self) -> &str {
            "relay"
        }

        fn submit(&mut self, input: I) -> Result<()> {
            if self.lookahead {
                if let Some(prev) = self.held.replace(input) {
                    self.ready.push((self.map)(prev));
                }
            } else {
                self.ready.push((self.map)(input));
            }
            Ok(())
        }

        fn retrieve(&mut self) -> Result<Option<O>> {
            Ok(if self.ready.is_empty() {
                None
            } else {
                Some(self.ready.remove(0))
            })
        }

        fn send_eof(&mut self) -> Result<()> {
            if let Some(last) = self.held.take() {
                self.ready.push((self.map)(last));
            }
            Ok(())
        }

        fn close(&mut self) {}
    }

    fn decode(unit: CompressedUnit) -> RawFrame {
        let format = if unit.kind().is_video() {
            FrameFormat::Video(VideoFormat {
                pixel: PixelFormat::Yuv420p,
                width: 2,
                height: 2,
            })
        } else {
            FrameFormat::Audio {
                format: AudioFormat::default(),
                samples: 1,
            }
        };
        RawFrame::host(format, unit.into_data(), None)
    }

    fn convert(frame: RawFrame) -> ConvertedFrame {
        ConvertedFrame::new(
            *frame.format(),
            Bytes::copy_from_slice(frame.bytes()),
            frame.pts(),
        )
    }

    fn encode(frame: ConvertedFrame) -> CompressedUnit {
        let kind = if frame.format.is_video() {
            MediaKind::Video(VideoCodec::H264)
        } else {
            MediaKind::Aac
        };
        CompressedUnit::new(kind, frame.data)
    }

    struct RelayFactory;

    impl BackendFactory for RelayFactory {
        fn open_decoder(
            &self,
            _kind: BackendKind,
            _stream: &StreamInfo,
            _ctx: &Arc<DeviceContext>,
            _pool: Option<FramePool>,
        ) -> Result<DecodeBackend> {
            Ok(Box::new(Relay::new(true, decode)))
        }

        fn open_converter(
            &self,
            _kind: BackendKind,
            _target: &ConvertTarget,
            _ctx: &Arc<DeviceContext>,
        ) -> Result<ConvertBackend> {
            Ok(Box::new(Relay::new(false, convert)))
        }

        fn open_encoder(
            &self,
            _kind: BackendKind,
            params: &EncoderParams,
            _ctx: &Arc<DeviceContext>,
        ) -> Result<EncodeBackend> {
            if let EncoderParams::Audio { channels: 0, .. } = params {
                return Err(CodecError::FatalBackendInit("bad audio params".into()));
            }
            Ok(Box::new(Relay::new(true, encode)))
        }
    }

    #[derive(Default)]
    struct Recorder {
        video: Mutex<Vec<Bytes>>,
        audio: Mutex<Vec<Bytes>>,
        frames: Mutex<usize>,
    }

    impl UnitSink for Recorder {
        fn on_video(&self, unit: CompressedUnit) {
            self.video.lock().unwrap().push(unit.into_data());
        }

        fn on_audio(&self, unit: CompressedUnit) {
            self.audio.lock().unwrap().push(unit.into_data());
        }

        fn on_video_frame(&self, _frame: &ConvertedFrame) {
            *self.frames.lock().unwrap() += 1;
        }
    }

    fn streams() -> Vec<StreamInfo> {
        vec![
            StreamInfo::Video {
                codec: VideoCodec::H264,
                width: 2,
                height: 2,
                fps: 25,
            },
            StreamInfo::Audio {
                channels: 2,
                sample_rate: 44100,
                profile: 2,
            },
        ]
    }

    #[test]
    fn test_session_routes_and_flushes_everything() -> anyhow::Result<()> {
        let recorder = Arc::new(Recorder::default());
        let config = SessionConfig {
            poll_ms: 10,
            drop_bound: None,
            ..Default::default()
        };
        let session = Session::open(
            &RelayFactory,
            &DeviceContext::software(),
            &config,
            &streams(),
            recorder.clone(),
        )?;

        for i in 0..20u8 {
            session.push(CompressedUnit::copy_from(
                MediaKind::Video(VideoCodec::H264),
                &[i],
            ))?;
            if i % 2 == 0 {
                session.push(CompressedUnit::copy_from(MediaKind::Aac, &[100 + i]))?;
            }
        }
        session.close();

        // both the decoder and the encoder hold one item back until flushed
        let video = recorder.video.lock().unwrap();
        assert_eq!(video.len(), 20);
        assert!(video.iter().enumerate().all(|(i, b)| b[0] == i as u8));
        let audio = recorder.audio.lock().unwrap();
        assert_eq!(audio.len(), 10);
        assert_eq!(audio[0][0], 100);
        assert_eq!(*recorder.frames.lock().unwrap(), 20);

        assert!(matches!(
            session.push(CompressedUnit::copy_from(MediaKind::Aac, &[0])),
            Err(CodecError::Closed)
        ));
        Ok(())
    }

    #[test]
    fn test_video_only_session_ignores_audio() -> anyhow::Result<()> {
        let recorder = Arc::new(Recorder::default());
        let session = Session::open(
            &RelayFactory,
            &DeviceContext::software(),
            &SessionConfig::default(),
            &streams()[..1],
            recorder.clone(),
        )?;
        assert!(session.audio_decoder().is_none());
        session.push(CompressedUnit::copy_from(MediaKind::Aac, &[1]))?;
        session.push(CompressedUnit::copy_from(
            MediaKind::Video(VideoCodec::H264),
            &[2],
        ))?;
        drop(session);
        assert_eq!(recorder.video.lock().unwrap().len(), 1);
        assert!(recorder.audio.lock().unwrap().is_empty());
        Ok(())
    }

    #[test]
    fn test_open_fails_on_fatal_backend() {
        let recorder = Arc::new(Recorder::default());
        let config = SessionConfig {
            audio_output: AudioFormat {
                channels: 0,
                rate: 0,
                ..Default::default()
            },
            ..Default::default()
        };
        let result = Session::open(
            &RelayFactory,
            &DeviceContext::software(),
            &config,
            &streams(),
            recorder,
        );
        assert!(matches!(result, Err(CodecError::FatalBackendInit(_))));
    }
}
