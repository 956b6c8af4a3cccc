use std::sync::{
    Arc,
    atomic::{AtomicU64, Ordering},
};
use std::time::{Duration, Instant};

pub const RATE_WINDOW: Duration = Duration::from_secs(1);

/// Rolling frame-rate counter, sampled by the thread that emits frames.
pub struct RateMeter {
    name: String,
    window: Duration,
    window_start: Instant,
    frames: u64,
    total: Arc<AtomicU64>,
    last_rate: Arc<AtomicU64>,
}

/// Read side of a [`RateMeter`], safe to poll from any thread.
#[derive(Clone, Debug, Default)]
pub struct RateHandle {
    total: Arc<AtomicU64>,
    last_rate: Arc<AtomicU64>,
}

impl RateHandle {
    /// Frames per second measured over the last completed window.
    pub fn rate(&self) -> u64 {
        self.last_rate.load(Ordering::Relaxed)
    }

    pub fn total(&self) -> u64 {
        self.total.load(Ordering::Relaxed)
    }
}

impl RateMeter {
    pub fn new(name: &str) -> Self {
        Self::with_window(name, RATE_WINDOW, Instant::now())
    }

    pub fn with_window(name: &str, window: Duration, start: Instant) -> Self {
        Self {
            name: name.to_string(),
            window,
            window_start: start,
            frames: 0,
            total: Arc::new(AtomicU64::new(0)),
            last_rate: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn handle(&self) -> RateHandle {
        RateHandle {
            total: self.total.clone(),
            last_rate: self.last_rate.clone(),
        }
    }

    pub fn tick(&mut self) -> Option<u64> {
        self.tick_at(Instant::now())
    }

    /// Counts one frame. Once the window has elapsed, publishes
    /// `frames * 1000 / window_ms`, starts a new window and returns the rate.
    pub fn tick_at(&mut self, now: Instant) -> Option<u64> {
        self.frames += 1;
        self.total.fetch_add(1, Ordering::Relaxed);
        let elapsed = now.saturating_duration_since(self.window_start);
        if elapsed < self.window {
            return None;
        }
        let window_ms = (elapsed.as_millis() as u64).max(1);
        let rate = self.frames * 1000 / window_ms;
        self.last_rate.store(rate, Ordering::Relaxed);
        log::debug!("{} rate: {} fps", self.name, rate);
        self.frames = 0;
        self.window_start = now;
        Some(rate)
    }
}
