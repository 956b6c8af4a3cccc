//! Accelerator device context.
//!
//! One context is created at process start and handed by reference to every
//! pipeline and backend factory. It names the device the hardware variants
//! run on and accounts for every block of device memory the frame pools hold.

use std::sync::{
    Arc,
    atomic::{AtomicUsize, Ordering},
};

use crate::{
    backend::BackendKind,
    error::{CodecError, Result},
};

pub struct DeviceContext {
    kind: BackendKind,
    device_id: i32,
    memory_limit: Option<usize>,
    allocated: AtomicUsize,
}

impl DeviceContext {
    pub fn new(kind: BackendKind, device_id: i32) -> Arc<Self> {
        Self::with_memory_limit(kind, device_id, None)
    }

    /// Context for hosts without an accelerator; pools allocate host memory.
    pub fn software() -> Arc<Self> {
        Self::new(BackendKind::Software, 0)
    }

    pub fn with_memory_limit(
        kind: BackendKind,
        device_id: i32,
        memory_limit: Option<usize>,
    ) -> Arc<Self> {
        log::info!(
            "device context created: kind: {}, device_id: {}, memory_limit: {:?}",
            kind,
            device_id,
            memory_limit
        );
        Arc::new(Self {
            kind,
            device_id,
            memory_limit,
            allocated: AtomicUsize::new(0),
        })
    }

    pub fn kind(&self) -> BackendKind {
        self.kind
    }

    pub fn device_id(&self) -> i32 {
        self.device_id
    }

    /// Bytes currently held by frame pools created on this context.
    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    pub(crate) fn alloc_block(&self, size: usize) -> Result<Box<[u8]>> {
        let mut current = self.allocated.load(Ordering::Acquire);
        loop {
            let next = current + size;
            if let Some(limit) = self.memory_limit {
                if next > limit {
                    return Err(CodecError::ResourceExhausted(format!(
                        "device {} memory limit {} reached",
                        self.device_id, limit
                    )));
                }
            }
            match self.allocated.compare_exchange_weak(
                current,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => break,
                Err(actual) => current = actual,
            }
        }
        Ok(vec![0u8; size].into_boxed_slice())
    }

    pub(crate) fn free_block(&self, size: usize) {
        self.allocated.fetch_sub(size, Ordering::AcqRel);
    }
}

impl std::fmt::Debug for DeviceContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceContext")
            .field("kind", &self.kind)
            .field("device_id", &self.device_id)
            .field("allocated", &self.allocated_bytes())
            .finish()
    }
}
