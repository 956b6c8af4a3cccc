//! Fixed-capacity pool of device buffers.
//!
//! Hardware decoders write each output picture into a pooled block instead of
//! allocating device memory per frame. A block is always either free in the
//! pool or checked out by exactly one [`DeviceBuffer`]; the pool never grows,
//! so an exhausted pool makes `acquire` wait for the convert stage to release.

use std::sync::{Arc, Condvar, Mutex};
use std::time::{Duration, Instant};

use crate::{
    device::DeviceContext,
    error::{CodecError, Result},
};

pub const DEFAULT_POOL_CAPACITY: usize = 10;

/// `acquire` sleeps in slices of this length and re-checks for close.
const ACQUIRE_POLL: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolStats {
    pub capacity: usize,
    pub free: usize,
    pub checked_out: usize,
    /// Acquisitions that had to wait for a release.
    pub waits: u64,
}

struct Block {
    id: usize,
    mem: Box<[u8]>,
}

struct PoolState {
    free: Vec<Block>,
    checked_out: usize,
    closed: bool,
    waits: u64,
}

struct PoolInner {
    name: String,
    capacity: usize,
    block_size: usize,
    ctx: Arc<DeviceContext>,
    state: Mutex<PoolState>,
    available: Condvar,
}

impl PoolInner {
    fn lock(&self) -> std::sync::MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn give_back(&self, block: Block) {
        let mut state = self.lock();
        state.checked_out -= 1;
        state.free.push(block);
        drop(state);
        self.available.notify_one();
    }
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(|e| e.into_inner());
        for block in state.free.drain(..) {
            self.ctx.free_block(block.mem.len());
        }
    }
}

/// Shared handle to one pool; clones refer to the same blocks.
#[derive(Clone)]
pub struct FramePool {
    inner: Arc<PoolInner>,
}

impl FramePool {
    /// Allocates all `capacity` blocks up front from `ctx`.
    pub fn new(
        ctx: &Arc<DeviceContext>,
        name: &str,
        block_size: usize,
        capacity: usize,
    ) -> Result<Self> {
        if capacity == 0 || block_size == 0 {
            return Err(CodecError::FatalBackendInit(format!(
                "pool {}: invalid geometry {} x {} bytes",
                name, capacity, block_size
            )));
        }
        let mut free = Vec::with_capacity(capacity);
        for id in 0..capacity {
            match ctx.alloc_block(block_size) {
                Ok(mem) => free.push(Block { id, mem }),
                Err(e) => {
                    for block in free.drain(..) {
                        ctx.free_block(block.mem.len());
                    }
                    return Err(e);
                }
            }
        }
        log::debug!(
            "pool {} ready: {} blocks of {} bytes on device {}",
            name,
            capacity,
            block_size,
            ctx.device_id()
        );
        Ok(Self {
            inner: Arc::new(PoolInner {
                name: name.to_string(),
                capacity,
                block_size,
                ctx: ctx.clone(),
                state: Mutex::new(PoolState {
                    free,
                    checked_out: 0,
                    closed: false,
                    waits: 0,
                }),
                available: Condvar::new(),
            }),
        })
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    pub fn capacity(&self) -> usize {
        self.inner.capacity
    }

    pub fn block_size(&self) -> usize {
        self.inner.block_size
    }

    /// Checks out a free block, waiting for a release while the pool is
    /// exhausted. Fails with `Closed` once the pool has been closed.
    pub fn acquire(&self) -> Result<DeviceBuffer> {
        self.acquire_until(None)
    }

    /// Like [`acquire`](Self::acquire) but gives up with `ResourceExhausted`
    /// after `timeout`.
    pub fn acquire_timeout(&self, timeout: Duration) -> Result<DeviceBuffer> {
        self.acquire_until(Some(Instant::now() + timeout))
    }

    pub fn try_acquire(&self) -> Option<DeviceBuffer> {
        let mut state = self.inner.lock();
        if state.closed {
            return None;
        }
        self.checkout(&mut state)
    }

    fn acquire_until(&self, deadline: Option<Instant>) -> Result<DeviceBuffer> {
        let mut state = self.inner.lock();
        let mut waited = false;
        loop {
            if state.closed {
                return Err(CodecError::Closed);
            }
            if let Some(buffer) = self.checkout(&mut state) {
                return Ok(buffer);
            }
            if !waited {
                waited = true;
                state.waits += 1;
            }
            let slice = match deadline {
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        return Err(CodecError::ResourceExhausted(format!(
                            "pool {}: all {} buffers checked out",
                            self.inner.name, self.inner.capacity
                        )));
                    }
                    remaining.min(ACQUIRE_POLL)
                }
                None => ACQUIRE_POLL,
            };
            let (guard, _) = self
                .inner
                .available
                .wait_timeout(state, slice)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }
    }

    fn checkout(&self, state: &mut PoolState) -> Option<DeviceBuffer> {
        let block = state.free.pop()?;
        state.checked_out += 1;
        Some(DeviceBuffer {
            block: Some(block),
            len: 0,
            pool: self.inner.clone(),
        })
    }

    /// Explicitly returns a checked-out buffer.
    pub fn release(&self, buffer: DeviceBuffer) {
        debug_assert!(
            Arc::ptr_eq(&self.inner, &buffer.pool),
            "buffer released to a foreign pool"
        );
        drop(buffer);
    }

    pub fn stats(&self) -> PoolStats {
        let state = self.inner.lock();
        PoolStats {
            capacity: self.inner.capacity,
            free: state.free.len(),
            checked_out: state.checked_out,
            waits: state.waits,
        }
    }

    /// Stops handing out buffers and wakes every waiter. Outstanding buffers
    /// still return to the free list when released. Idempotent.
    pub fn close(&self) {
        let mut state = self.inner.lock();
        if state.closed {
            return;
        }
        state.closed = true;
        let checked_out = state.checked_out;
        drop(state);
        self.inner.available.notify_all();
        log::debug!(
            "pool {} closed, {} buffers still checked out",
            self.inner.name,
            checked_out
        );
    }

    pub fn is_closed(&self) -> bool {
        self.inner.lock().closed
    }
}

impl std::fmt::Debug for FramePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FramePool")
            .field("name", &self.inner.name)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A checked-out pool block. Returns to its pool on [`FramePool::release`] or
/// when dropped, whichever comes first.
pub struct DeviceBuffer {
    block: Option<Block>,
    len: usize,
    pool: Arc<PoolInner>,
}

impl DeviceBuffer {
    pub fn id(&self) -> usize {
        self.block.as_ref().map(|b| b.id).unwrap_or(usize::MAX)
    }

    pub fn capacity(&self) -> usize {
        self.block.as_ref().map(|b| b.mem.len()).unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// # Panics
    ///
    /// Panics if `len > capacity()`.
    pub fn set_len(&mut self, len: usize) {
        assert!(len <= self.capacity(), "length exceeds buffer capacity");
        self.len = len;
    }

    pub fn data(&self) -> &[u8] {
        match &self.block {
            Some(block) => &block.mem[..self.len],
            None => &[],
        }
    }

    /// The whole block, regardless of the valid length.
    pub fn data_mut(&mut self) -> &mut [u8] {
        match &mut self.block {
            Some(block) => &mut block.mem[..],
            None => &mut [],
        }
    }

    /// Copies `src` to the start of the block and sets the valid length.
    pub fn fill(&mut self, src: &[u8]) -> Result<()> {
        if src.len() > self.capacity() {
            return Err(CodecError::ResourceExhausted(format!(
                "frame of {} bytes exceeds pool block of {} bytes",
                src.len(),
                self.capacity()
            )));
        }
        self.data_mut()[..src.len()].copy_from_slice(src);
        self.len = src.len();
        Ok(())
    }
}

impl Drop for DeviceBuffer {
    fn drop(&mut self) {
        if let Some(block) = self.block.take() {
            self.pool.give_back(block);
        }
    }
}

impl std::fmt::Debug for DeviceBuffer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceBuffer")
            .field("id", &self.id())
            .field("len", &self.len)
            .field("capacity", &self.capacity())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::BackendKind;
    use std::collections::HashSet;
    use std::thread;

    fn pool(capacity: usize) -> FramePool {
        let ctx = DeviceContext::new(BackendKind::Npu, 0);
        FramePool::new(&ctx, "test", 16, capacity).unwrap()
    }

    fn assert_invariant(pool: &FramePool) {
        let stats = pool.stats();
        assert_eq!(stats.free + stats.checked_out, stats.capacity);
    }

    #[test]
    fn test_acquire_release() {
        let pool = pool(2);
        let a = pool.acquire().unwrap();
        let b = pool.acquire().unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.stats().checked_out, 2);
        assert!(pool.try_acquire().is_none());
        assert_invariant(&pool);

        pool.release(a);
        assert_eq!(pool.stats().free, 1);
        drop(b);
        assert_eq!(pool.stats().free, 2);
        assert_invariant(&pool);
    }

    #[test]
    fn test_fill_and_overflow() {
        let pool = pool(1);
        let mut buf = pool.acquire().unwrap();
        buf.fill(&[1, 2, 3]).unwrap();
        assert_eq!(buf.data(), &[1, 2, 3]);
        let err = buf.fill(&[0u8; 17]).unwrap_err();
        assert!(matches!(err, CodecError::ResourceExhausted(_)));
    }

    #[test]
    fn test_acquire_timeout_when_exhausted() {
        let pool = pool(1);
        let _held = pool.acquire().unwrap();
        let err = pool.acquire_timeout(Duration::from_millis(30)).unwrap_err();
        assert!(matches!(err, CodecError::ResourceExhausted(_)));
        assert_eq!(pool.stats().waits, 1);
    }

    #[test]
    fn test_blocked_acquire_wakes_on_release() {
        let pool = pool(1);
        let held = pool.acquire().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|b| b.id()))
        };
        thread::sleep(Duration::from_millis(20));
        let id = held.id();
        drop(held);
        assert_eq!(waiter.join().unwrap().unwrap(), id);
    }

    #[test]
    fn test_close_wakes_waiters_and_is_idempotent() {
        let pool = pool(1);
        let held = pool.acquire().unwrap();
        let waiter = {
            let pool = pool.clone();
            thread::spawn(move || pool.acquire().map(|_| ()))
        };
        thread::sleep(Duration::from_millis(20));
        pool.close();
        pool.close();
        assert!(matches!(waiter.join().unwrap(), Err(CodecError::Closed)));

        drop(held);
        assert_invariant(&pool);
        assert!(pool.try_acquire().is_none());
    }

    #[test]
    fn test_concurrent_checkouts_never_alias() {
        let pool = pool(4);
        let seen = Arc::new(Mutex::new(HashSet::new()));
        let handles: Vec<_> = (0..8)
            .map(|_| {
                let pool = pool.clone();
                let seen = seen.clone();
                thread::spawn(move || {
                    for _ in 0..50 {
                        let buf = pool.acquire().unwrap();
                        assert!(seen.lock().unwrap().insert(buf.id()));
                        assert_invariant(&pool);
                        seen.lock().unwrap().remove(&buf.id());
                        drop(buf);
                    }
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap();
        }
        assert_eq!(pool.stats().free, 4);
    }

    #[test]
    fn test_memory_returned_to_context() {
        let ctx = DeviceContext::new(BackendKind::Gpu, 0);
        let pool = FramePool::new(&ctx, "acct", 32, 3).unwrap();
        assert_eq!(ctx.allocated_bytes(), 96);
        let buf = pool.acquire().unwrap();
        drop(pool);
        assert_eq!(ctx.allocated_bytes(), 96);
        drop(buf);
        assert_eq!(ctx.allocated_bytes(), 0);
    }
}
