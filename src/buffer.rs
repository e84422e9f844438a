//! Image buffer pools.
//!
//! Pools sit on top of a [`BufferAllocator`] and hand out [`PooledBuffer`]s.
//! A pooled buffer keeps a weak reference to its pool and goes back to it on
//! [`PooledBuffer::release`] (or drop). Buffers outliving their pool are
//! simply freed.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BufferError {
    #[error("Buffer pool '{pool}' exhausted ({capacity} buffers in use)")]
    Exhausted { pool: String, capacity: usize },

    #[error("Invalid buffer spec: {0}")]
    InvalidSpec(String),

    #[error("Allocation failed: {0}")]
    Allocation(String),
}

/// Pixel layout of an image buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImageFormat {
    #[default]
    Yuv420,
    Yuy2,
    Raw10,
    Rgba8888,
    /// Opaque byte stream, e.g. encoded JPEG.
    Blob,
}

impl ImageFormat {
    pub fn bits_per_pixel(self) -> u64 {
        match self {
            ImageFormat::Yuv420 => 12,
            ImageFormat::Yuy2 => 16,
            ImageFormat::Raw10 => 10,
            ImageFormat::Rgba8888 => 32,
            ImageFormat::Blob => 8,
        }
    }
}

/// Allocation request for one buffer.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct BufferSpec {
    pub name: String,
    pub format: ImageFormat,
    pub width: u32,
    pub height: u32,
    /// Physically contiguous memory requested.
    pub continuous: bool,
}

impl BufferSpec {
    pub fn new(name: impl Into<String>, format: ImageFormat, width: u32, height: u32) -> Self {
        Self {
            name: name.into(),
            format,
            width,
            height,
            continuous: false,
        }
    }

    pub fn continuous(mut self, continuous: bool) -> Self {
        self.continuous = continuous;
        self
    }

    pub fn byte_len(&self) -> usize {
        let bits = u64::from(self.width) * u64::from(self.height) * self.format.bits_per_pixel();
        bits.div_ceil(8) as usize
    }

    pub fn validate(&self) -> Result<(), BufferError> {
        if self.name.is_empty() {
            return Err(BufferError::InvalidSpec("buffer name is empty".into()));
        }
        if self.width == 0 || self.height == 0 {
            return Err(BufferError::InvalidSpec(format!(
                "'{}' has zero size {}x{}",
                self.name, self.width, self.height
            )));
        }
        Ok(())
    }
}

impl fmt::Display for BufferSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} {:?} {}x{}{}",
            self.name,
            self.format,
            self.width,
            self.height,
            if self.continuous { " (continuous)" } else { "" }
        )
    }
}

/// Opaque image memory produced by an allocator.
#[derive(Debug, Default)]
pub struct ImageBuffer {
    pub id: u64,
    pub spec: BufferSpec,
    pub data: Vec<u8>,
}

impl ImageBuffer {
    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Source of raw image memory.
#[cfg_attr(test, mockall::automock)]
pub trait BufferAllocator: Send + Sync {
    fn allocate(&self, spec: &BufferSpec) -> Result<ImageBuffer, BufferError>;
    fn deallocate(&self, buffer: ImageBuffer);
}

/// Allocator backed by the process heap.
#[derive(Debug, Default)]
pub struct HeapAllocator {
    next_id: AtomicU64,
    live: AtomicUsize,
}

impl HeapAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Buffers allocated and not yet deallocated.
    pub fn live(&self) -> usize {
        self.live.load(Ordering::Relaxed)
    }
}

impl BufferAllocator for HeapAllocator {
    fn allocate(&self, spec: &BufferSpec) -> Result<ImageBuffer, BufferError> {
        spec.validate()?;
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        self.live.fetch_add(1, Ordering::Relaxed);
        tracing::trace!("Allocated buffer #{} ({})", id, spec);
        Ok(ImageBuffer {
            id,
            spec: spec.clone(),
            data: vec![0; spec.byte_len()],
        })
    }

    fn deallocate(&self, buffer: ImageBuffer) {
        self.live.fetch_sub(1, Ordering::Relaxed);
        tracing::trace!("Freed buffer #{} ({})", buffer.id, buffer.spec.name);
    }
}

struct PoolState {
    free: Vec<ImageBuffer>,
    outstanding: usize,
}

/// Fixed-capacity pool of identically shaped buffers.
pub struct BufferPool {
    spec: BufferSpec,
    capacity: usize,
    allocator: Arc<dyn BufferAllocator>,
    state: Mutex<PoolState>,
}

impl BufferPool {
    /// Buffers are allocated lazily, up to `capacity` at a time.
    pub fn new(
        spec: BufferSpec,
        capacity: usize,
        allocator: Arc<dyn BufferAllocator>,
    ) -> Result<Arc<Self>, BufferError> {
        spec.validate()?;
        if capacity == 0 {
            return Err(BufferError::InvalidSpec(format!(
                "pool '{}' has zero capacity",
                spec.name
            )));
        }
        tracing::debug!("Buffer pool '{}' created: {} x {}", spec.name, capacity, spec);
        Ok(Arc::new(Self {
            spec,
            capacity,
            allocator,
            state: Mutex::new(PoolState {
                free: Vec::with_capacity(capacity),
                outstanding: 0,
            }),
        }))
    }

    pub fn name(&self) -> &str {
        &self.spec.name
    }

    pub fn spec(&self) -> &BufferSpec {
        &self.spec
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn outstanding(&self) -> usize {
        self.lock().outstanding
    }

    /// Buffers that can be acquired right now without exceeding capacity.
    pub fn available(&self) -> usize {
        self.capacity - self.lock().outstanding
    }

    pub fn acquire(self: &Arc<Self>) -> Result<PooledBuffer, BufferError> {
        let mut state = self.lock();
        if state.outstanding >= self.capacity {
            return Err(BufferError::Exhausted {
                pool: self.spec.name.clone(),
                capacity: self.capacity,
            });
        }

        let buffer = match state.free.pop() {
            Some(buffer) => buffer,
            None => self.allocator.allocate(&self.spec)?,
        };
        state.outstanding += 1;

        Ok(PooledBuffer {
            buffer,
            pool: Arc::downgrade(self),
            allocator: Arc::clone(&self.allocator),
        })
    }

    pub fn release(&self, buffer: PooledBuffer) {
        buffer.release();
    }

    fn give_back(&self, buffer: ImageBuffer) {
        let mut state = self.lock();
        state.outstanding = state.outstanding.saturating_sub(1);
        state.free.push(buffer);
    }
}

impl Drop for BufferPool {
    fn drop(&mut self) {
        let state = self.state.get_mut().unwrap_or_else(PoisonError::into_inner);
        if state.outstanding > 0 {
            tracing::warn!(
                "Buffer pool '{}' dropped with {} buffers still in use",
                self.spec.name,
                state.outstanding
            );
        }
        for buffer in state.free.drain(..) {
            self.allocator.deallocate(buffer);
        }
    }
}

impl fmt::Debug for BufferPool {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("BufferPool")
            .field("spec", &self.spec)
            .field("capacity", &self.capacity)
            .field("outstanding", &self.outstanding())
            .finish()
    }
}

/// Buffer on loan from a [`BufferPool`]. If the pool is gone by the time the
/// buffer is dropped, the memory goes straight back to the allocator.
pub struct PooledBuffer {
    buffer: ImageBuffer,
    pool: Weak<BufferPool>,
    allocator: Arc<dyn BufferAllocator>,
}

impl PooledBuffer {
    pub fn pool_name(&self) -> &str {
        &self.buffer.spec.name
    }

    /// Hand the buffer back to its pool.
    pub fn release(self) {
        drop(self);
    }
}

impl Deref for PooledBuffer {
    type Target = ImageBuffer;

    fn deref(&self) -> &ImageBuffer {
        &self.buffer
    }
}

impl DerefMut for PooledBuffer {
    fn deref_mut(&mut self) -> &mut ImageBuffer {
        &mut self.buffer
    }
}

impl fmt::Debug for PooledBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PooledBuffer(#{} from '{}')", self.buffer.id, self.buffer.spec.name)
    }
}

impl Drop for PooledBuffer {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        match self.pool.upgrade() {
            Some(pool) => pool.give_back(buffer),
            None => {
                tracing::debug!("Buffer #{} outlived pool '{}'", buffer.id, buffer.spec.name);
                self.allocator.deallocate(buffer);
            }
        }
    }
}
