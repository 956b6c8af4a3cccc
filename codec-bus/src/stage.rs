//! One worker thread bound to one backend.
//!
//! The thread pops its input queue with a timeout, feeds every item through
//! the backend and forwards each output downstream. On abort it keeps
//! draining: first whatever is left in its input queue, then one flush of the
//! backend, and only then reports `Stopped`.

use std::sync::{
    Arc, Mutex, MutexGuard,
    atomic::{AtomicU8, AtomicU64, Ordering},
};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use crate::{
    backend::Backend,
    error::{CodecError, Result},
    queue::WorkQueue,
    telemetry::{RateHandle, RateMeter},
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StageState {
    Idle = 0,
    Running = 1,
    Draining = 2,
    Stopped = 3,
}

#[derive(Default)]
pub(crate) struct StageStatus(AtomicU8);

impl StageStatus {
    pub(crate) fn get(&self) -> StageState {
        match self.0.load(Ordering::Acquire) {
            0 => StageState::Idle,
            1 => StageState::Running,
            2 => StageState::Draining,
            _ => StageState::Stopped,
        }
    }

    fn set(&self, state: StageState) {
        self.0.store(state as u8, Ordering::Release);
    }
}

/// Marks the stage stopped when the thread leaves `run`, unwinding included,
/// so a downstream stage never waits on a dead upstream.
struct StoppedOnExit(Arc<StageStatus>);

impl Drop for StoppedOnExit {
    fn drop(&mut self) {
        self.0.set(StageState::Stopped);
    }
}

type Callback<O> = Box<dyn FnMut(O) + Send>;

/// Terminal consumer of a pipeline. Outputs produced while no callback is
/// registered are dropped.
pub(crate) struct ListenerSlot<O> {
    callback: Mutex<Option<Callback<O>>>,
    unclaimed: AtomicU64,
}

impl<O> ListenerSlot<O> {
    pub(crate) fn new() -> Self {
        Self {
            callback: Mutex::new(None),
            unclaimed: AtomicU64::new(0),
        }
    }

    pub(crate) fn set(&self, callback: Callback<O>) {
        *self.lock() = Some(callback);
    }

    fn lock(&self) -> MutexGuard<'_, Option<Callback<O>>> {
        self.callback.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Runs the callback outside the lock, so it may replace itself. A
    /// callback registered meanwhile wins over the one being run.
    fn emit(&self, item: O) {
        let Some(mut cb) = self.lock().take() else {
            self.unclaimed.fetch_add(1, Ordering::Relaxed);
            return;
        };
        cb(item);
        let mut slot = self.lock();
        if slot.is_none() {
            *slot = Some(cb);
        }
    }

    pub(crate) fn unclaimed(&self) -> u64 {
        self.unclaimed.load(Ordering::Relaxed)
    }
}

pub(crate) enum StageOutput<O> {
    Queue(Arc<WorkQueue<O>>),
    Listener(Arc<ListenerSlot<O>>),
}

impl<O> StageOutput<O> {
    fn send(&self, item: O) {
        match self {
            StageOutput::Queue(queue) => queue.push(item),
            StageOutput::Listener(slot) => slot.emit(item),
        }
    }
}

pub(crate) struct Stage<B: Backend> {
    pub(crate) name: String,
    pub(crate) backend: B,
    pub(crate) input: Arc<WorkQueue<B::Input>>,
    pub(crate) output: StageOutput<B::Output>,
    pub(crate) abort: CancellationToken,
    /// Stage feeding `input`; this stage may only finish once it has stopped.
    pub(crate) upstream: Option<Arc<StageStatus>>,
    pub(crate) poll: Duration,
    pub(crate) failures: Arc<AtomicU64>,
}

impl<B> Stage<B>
where
    B: Backend + 'static,
    B::Input: 'static,
    B::Output: 'static,
{
    pub(crate) fn spawn(self) -> Result<StageHandle<B>> {
        let name = self.name.clone();
        let status = Arc::new(StageStatus::default());
        let meter = RateMeter::new(&name);
        let rate = meter.handle();
        let thread_status = status.clone();
        let join = thread::Builder::new()
            .name(name.clone())
            .spawn(move || self.run(thread_status, meter))
            .map_err(|e| CodecError::FatalBackendInit(format!("spawn {}: {}", name, e)))?;
        Ok(StageHandle {
            name,
            status,
            rate,
            join: Some(join),
        })
    }

    fn run(mut self, status: Arc<StageStatus>, mut meter: RateMeter) -> B {
        let _guard = StoppedOnExit(status.clone());
        status.set(StageState::Running);
        log::info!(
            "stage {} started, {} backend {}",
            self.name,
            self.backend.kind(),
            self.backend.name()
        );

        loop {
            if self.abort.is_cancelled() && self.upstream_stopped() {
                break;
            }
            if let Some(item) = self.input.pop_timeout(self.poll) {
                self.process(item, &mut meter);
            }
        }

        status.set(StageState::Draining);
        let mut drained = 0usize;
        while let Some(item) = self.input.try_pop() {
            self.process(item, &mut meter);
            drained += 1;
        }

        match self.backend.flush() {
            Ok(outputs) => {
                for out in outputs {
                    match out {
                        Ok(out) => {
                            self.output.send(out);
                            meter.tick();
                        }
                        Err(e) => {
                            self.failures.fetch_add(1, Ordering::Relaxed);
                            log::warn!("stage {} flush output error: {}", self.name, e);
                        }
                    }
                }
            }
            Err(e) => log::warn!("stage {} flush error: {}", self.name, e),
        }

        log::info!(
            "stage {} stopped, drained {} queued items, {} emitted in total",
            self.name,
            drained,
            meter.handle().total()
        );
        self.backend
    }

    fn upstream_stopped(&self) -> bool {
        self.upstream
            .as_ref()
            .map(|s| s.get() == StageState::Stopped)
            .unwrap_or(true)
    }

    fn process(&mut self, item: B::Input, meter: &mut RateMeter) {
        if let Err(e) = self.backend.submit(item) {
            self.failures.fetch_add(1, Ordering::Relaxed);
            log::warn!("stage {} skipped one item: {}", self.name, e);
        }
        for out in self.backend.drain() {
            match out {
                Ok(out) => {
                    self.output.send(out);
                    meter.tick();
                }
                Err(e) => {
                    self.failures.fetch_add(1, Ordering::Relaxed);
                    log::warn!("stage {} retrieve error: {}", self.name, e);
                }
            }
        }
    }
}

pub(crate) struct StageHandle<B> {
    name: String,
    status: Arc<StageStatus>,
    rate: RateHandle,
    join: Option<JoinHandle<B>>,
}

impl<B> StageHandle<B> {
    pub(crate) fn status(&self) -> Arc<StageStatus> {
        self.status.clone()
    }

    pub(crate) fn rate(&self) -> RateHandle {
        self.rate.clone()
    }

    /// Waits for the thread and hands back its backend. Returns `None` if the
    /// stage was already joined, panicked, or is the calling thread.
    pub(crate) fn join(&mut self) -> Option<B> {
        let join = self.join.take()?;
        if join.thread().id() == thread::current().id() {
            log::error!("stage {} asked to join itself, detaching", self.name);
            return None;
        }
        match join.join() {
            Ok(backend) => Some(backend),
            Err(_) => {
                log::error!("stage {} panicked", self.name);
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_listener_may_replace_itself() {
        let slot: Arc<ListenerSlot<u32>> = Arc::new(ListenerSlot::new());
        let seen = Arc::new(Mutex::new(Vec::new()));

        let (inner_slot, inner_seen) = (Arc::downgrade(&slot), seen.clone());
        slot.set(Box::new(move |n| {
            inner_seen.lock().unwrap().push(("first", n));
            if let Some(slot) = inner_slot.upgrade() {
                let later = inner_seen.clone();
                slot.set(Box::new(move |n| later.lock().unwrap().push(("second", n))));
            }
        }));

        slot.emit(1);
        slot.emit(2);
        assert_eq!(*seen.lock().unwrap(), vec![("first", 1), ("second", 2)]);
        assert_eq!(slot.unclaimed(), 0);
    }

    #[test]
    fn test_unclaimed_without_listener() {
        let slot: ListenerSlot<u32> = ListenerSlot::new();
        slot.emit(7);
        slot.emit(8);
        assert_eq!(slot.unclaimed(), 2);
    }
}
