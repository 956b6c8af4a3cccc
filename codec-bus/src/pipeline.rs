//! Two-stage pipelines.
//!
//! ```text
//! decode:  ingest(CompressedUnit) -> [decode] -> queue -> [convert] -> listener(ConvertedFrame)
//! encode:  ingest(RawFrame)       -> [convert] -> queue -> [encode] -> listener(CompressedUnit)
//! ```
//!
//! A pipeline owns both stage threads, the queue between them, both backends
//! and, for hardware decoders, the frame pool the two stages share. `stop`
//! (also run on drop) refuses further ingest, lets both stages drain and
//! flush, joins them, then closes the pool and both backends in that order.

use std::sync::{
    Arc, Mutex,
    atomic::{AtomicBool, AtomicU64, Ordering},
};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{
    backend::{Backend, BackendFactory, BackendKind, ConvertTarget, EncoderParams, select_backend},
    config::SessionConfig,
    device::DeviceContext,
    error::{CodecError, Result},
    frame::{AudioFormat, ConvertedFrame, RawFrame},
    hw,
    packet::{CompressedUnit, MediaKind},
    pool::{FramePool, PoolStats},
    queue::{DEFAULT_POLL_INTERVAL, DropPolicy, QueueStats, WorkQueue},
    source::StreamInfo,
    stage::{ListenerSlot, Stage, StageHandle, StageOutput, StageState, StageStatus},
    telemetry::RateHandle,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    /// Both stages run and ingest is accepted.
    Running,
    /// Ingest is refused; stages are finishing queued work and flushing.
    Draining,
    /// Threads joined, pool and backends released.
    Stopped,
}

#[derive(Debug, Clone, Copy)]
pub struct PipelineOptions {
    pub poll: Duration,
    pub ingest_policy: DropPolicy,
    pub middle_policy: DropPolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            poll: DEFAULT_POLL_INTERVAL,
            ingest_policy: DropPolicy::Never,
            middle_policy: DropPolicy::Never,
        }
    }
}

type FirstBackend<I, M> = Box<dyn Backend<Input = I, Output = M>>;
type SecondBackend<M, O> = Box<dyn Backend<Input = M, Output = O>>;

struct Stages<I: Send, M: Send, O: Send> {
    first: StageHandle<FirstBackend<I, M>>,
    second: StageHandle<SecondBackend<M, O>>,
}

pub struct StagePipeline<I, M, O>
where
    I: Send + 'static,
    M: Send + 'static,
    O: Send + 'static,
{
    name: String,
    kinds: (BackendKind, BackendKind),
    input: Arc<WorkQueue<I>>,
    middle: Arc<WorkQueue<M>>,
    listener: Arc<ListenerSlot<O>>,
    abort: CancellationToken,
    /// Held across the abort check and the push in `ingest`, and across the
    /// cancel in `stop`, so nothing lands in the queue after the first stage
    /// has drained it.
    ingest_gate: Mutex<()>,
    stages: Mutex<Stages<I, M, O>>,
    first_status: Arc<StageStatus>,
    second_status: Arc<StageStatus>,
    output_rate: RateHandle,
    failures: Arc<AtomicU64>,
    pool: Option<FramePool>,
    stopped: AtomicBool,
}

pub type DecodePipeline = StagePipeline<CompressedUnit, RawFrame, ConvertedFrame>;
pub type EncodePipeline = StagePipeline<RawFrame, ConvertedFrame, CompressedUnit>;

impl<I, M, O> StagePipeline<I, M, O>
where
    I: Send + 'static,
    M: Send + 'static,
    O: Send + 'static,
{
    /// Starts both stage threads around already-opened backends.
    pub fn start(
        name: &str,
        first: FirstBackend<I, M>,
        second: SecondBackend<M, O>,
        pool: Option<FramePool>,
        options: PipelineOptions,
    ) -> Result<Self> {
        let kinds = (first.kind(), second.kind());
        let input = Arc::new(WorkQueue::new(&format!("{}-in", name), options.ingest_policy));
        let middle = Arc::new(WorkQueue::new(&format!("{}-mid", name), options.middle_policy));
        let listener = Arc::new(ListenerSlot::new());
        let abort = CancellationToken::new();
        let failures = Arc::new(AtomicU64::new(0));

        let mut first = Stage {
            name: format!("{}-{}", name, first.name()),
            backend: first,
            input: input.clone(),
            output: StageOutput::Queue(middle.clone()),
            abort: abort.clone(),
            upstream: None,
            poll: options.poll,
            failures: failures.clone(),
        }
        .spawn()?;

        let second = Stage {
            name: format!("{}-{}", name, second.name()),
            backend: second,
            input: middle.clone(),
            output: StageOutput::Listener(listener.clone()),
            abort: abort.clone(),
            upstream: Some(first.status()),
            poll: options.poll,
            failures: failures.clone(),
        }
        .spawn();
        let second = match second {
            Ok(second) => second,
            Err(e) => {
                abort.cancel();
                if let Some(mut backend) = first.join() {
                    backend.close();
                }
                if let Some(pool) = &pool {
                    pool.close();
                }
                return Err(e);
            }
        };

        log::info!(
            "pipeline {} running: {} -> {}, pool: {}",
            name,
            kinds.0,
            kinds.1,
            pool.as_ref().map(|p| p.capacity()).unwrap_or(0)
        );

        Ok(Self {
            name: name.to_string(),
            kinds,
            input,
            middle,
            listener,
            abort,
            ingest_gate: Mutex::new(()),
            first_status: first.status(),
            second_status: second.status(),
            output_rate: second.rate(),
            stages: Mutex::new(Stages { first, second }),
            failures,
            pool,
            stopped: AtomicBool::new(false),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Kinds of the first and second stage backends actually running.
    pub fn backend_kinds(&self) -> (BackendKind, BackendKind) {
        self.kinds
    }

    /// Queues one item for the first stage. Safe from any thread; fails with
    /// `Closed` once `stop` has begun.
    pub fn ingest(&self, item: I) -> Result<()> {
        let _gate = self.ingest_gate.lock().unwrap_or_else(|e| e.into_inner());
        if self.abort.is_cancelled() {
            return Err(CodecError::Closed);
        }
        self.input.push(item);
        Ok(())
    }

    /// Registers the terminal consumer. It runs on the second stage's thread,
    /// once per output; a slow callback backs up the middle queue. The
    /// callback may register its own replacement.
    pub fn set_output_listener<F>(&self, callback: F)
    where
        F: FnMut(O) + Send + 'static,
    {
        self.listener.set(Box::new(callback));
    }

    pub fn state(&self) -> PipelineState {
        if self.stopped.load(Ordering::Acquire) {
            PipelineState::Stopped
        } else if self.abort.is_cancelled() {
            PipelineState::Draining
        } else {
            PipelineState::Running
        }
    }

    pub fn stage_states(&self) -> (StageState, StageState) {
        (self.first_status.get(), self.second_status.get())
    }

    pub fn ingest_stats(&self) -> QueueStats {
        self.input.stats()
    }

    pub fn middle_stats(&self) -> QueueStats {
        self.middle.stats()
    }

    /// Drop policies of the ingest and middle queues.
    pub fn drop_policies(&self) -> (DropPolicy, DropPolicy) {
        (self.input.policy(), self.middle.policy())
    }

    pub fn pool_stats(&self) -> Option<PoolStats> {
        self.pool.as_ref().map(|p| p.stats())
    }

    pub fn output_rate(&self) -> RateHandle {
        self.output_rate.clone()
    }

    /// Items skipped because a backend rejected them.
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::Relaxed)
    }

    /// Outputs produced while no listener was registered.
    pub fn unclaimed(&self) -> u64 {
        self.listener.unclaimed()
    }

    /// Drains, flushes and joins both stages, then releases the pool and the
    /// backends. Returns once everything ingested so far has reached the
    /// listener. Later calls return immediately.
    ///
    /// Must not be called from the output listener.
    pub fn stop(&self) {
        let mut stages = self.stages.lock().unwrap_or_else(|e| e.into_inner());
        if self.stopped.load(Ordering::Acquire) {
            return;
        }
        {
            let _gate = self.ingest_gate.lock().unwrap_or_else(|e| e.into_inner());
            self.abort.cancel();
        }
        log::info!("pipeline {} draining", self.name);

        let first = stages.first.join();
        let second = stages.second.join();
        // only left behind if a stage died
        drop(self.input.take_all());
        drop(self.middle.take_all());

        if let Some(pool) = &self.pool {
            pool.close();
        }
        if let Some(mut backend) = first {
            backend.close();
        }
        if let Some(mut backend) = second {
            backend.close();
        }
        self.stopped.store(true, Ordering::Release);

        let ingest = self.input.stats();
        let middle = self.middle.stats();
        log::info!(
            "pipeline {} stopped: ingested {}, dropped {}/{}, failures {}, emitted {}",
            self.name,
            ingest.pushed,
            ingest.dropped,
            middle.dropped,
            self.failures(),
            self.output_rate.total()
        );
    }
}

impl<I, M, O> Drop for StagePipeline<I, M, O>
where
    I: Send + 'static,
    M: Send + 'static,
    O: Send + 'static,
{
    fn drop(&mut self) {
        self.stop();
    }
}

impl DecodePipeline {
    /// Opens a decoder and a converter for `stream`, falling back to
    /// software for whichever the configured backend cannot provide. Hardware
    /// video decoders get a pool of `pool_capacity` device buffers.
    pub fn open(
        factory: &dyn BackendFactory,
        ctx: &Arc<DeviceContext>,
        config: &SessionConfig,
        stream: &StreamInfo,
    ) -> Result<Self> {
        let media = stream.media();
        let chain = config.backend.fallback_chain();

        let mut pool = None;
        let (_, decoder) = select_backend(&format!("{} decoder", media), &chain, |kind| {
            let candidate = match stream {
                StreamInfo::Video { width, height, .. } if kind.is_hardware() => {
                    let block = hw::device_pixel_format(kind).frame_bytes(*width, *height);
                    // no room on the device leaves software as the way out
                    let pool = FramePool::new(
                        ctx,
                        &format!("decode-{}", media),
                        block,
                        config.pool_capacity,
                    )
                    .map_err(|e| match e {
                        CodecError::ResourceExhausted(m) => CodecError::BackendUnavailable(m),
                        e => e,
                    })?;
                    Some(pool)
                }
                _ => None,
            };
            let decoder = factory.open_decoder(kind, stream, ctx, candidate.clone())?;
            pool = candidate;
            Ok(decoder)
        })?;

        let target = match stream {
            StreamInfo::Video { .. } => ConvertTarget::Video {
                pixel: config.video_output,
                size: None,
            },
            StreamInfo::Audio { .. } => ConvertTarget::Audio(config.audio_output),
        };
        let (_, converter) = select_backend(&format!("{} converter", media), &chain, |kind| {
            factory.open_converter(kind, &target, ctx)
        })?;

        let options = PipelineOptions {
            poll: config.poll_interval(),
            ..Default::default()
        };
        Self::start(&format!("decode-{}", media), decoder, converter, pool, options)
    }
}

impl EncodePipeline {
    /// Opens an encoder for `params` and a converter producing the layout
    /// that encoder consumes. Video queues use the configured drop policy.
    pub fn open(
        factory: &dyn BackendFactory,
        ctx: &Arc<DeviceContext>,
        config: &SessionConfig,
        params: &EncoderParams,
    ) -> Result<Self> {
        let chain = config.backend.fallback_chain();
        let label = match params {
            EncoderParams::Video { codec, .. } => MediaKind::Video(*codec).to_string(),
            EncoderParams::Audio { .. } => "aac".to_string(),
        };

        let (kind, encoder) = select_backend(&format!("{} encoder", label), &chain, |kind| {
            factory.open_encoder(kind, params, ctx)
        })?;

        let target = match *params {
            EncoderParams::Video { width, height, .. } => ConvertTarget::Video {
                pixel: hw::encoder_pixel_format(kind),
                size: Some((width, height)),
            },
            EncoderParams::Audio {
                channels,
                sample_rate,
                ..
            } => ConvertTarget::Audio(AudioFormat {
                sample: hw::ENCODER_SAMPLE_FORMAT,
                channels,
                rate: sample_rate,
            }),
        };
        let (_, converter) = select_backend(&format!("{} converter", label), &chain, |kind| {
            factory.open_converter(kind, &target, ctx)
        })?;

        let policy = if params.is_video() {
            config.drop_policy()
        } else {
            DropPolicy::Never
        };
        let options = PipelineOptions {
            poll: config.poll_interval(),
            ingest_policy: policy,
            middle_policy: policy,
        };
        Self::start(&format!("encode-{}", label), converter, encoder, None, options)
    }
}

#[cfg(test)]
#[path = "pipeline_test.rs"]
mod pipeline_test;
