//! Recycling pool for transient working buffers
//!
//! Nodes that dispatch device work often need per-sample temporaries sized to
//! the waveform. Allocating those every cycle churns device memory, so freed
//! buffers go back to a free list keyed by element type and purpose, device
//! mirror included, ready for the next node that asks for the same kind.
//!
//! The only eviction is [`ScratchPool::clear`], which the device triggers
//! through the memory-pressure hook. Buffers currently lent out are never in a
//! free list and are therefore never evicted.

use super::buffer::{AcceleratorBuffer, SampleType};
use super::device::{Device, MemoryPressureHandler, MemoryPressureLevel, MemoryType};
use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tracing::{debug, error, info};

/// What a scratch buffer is used for. Buffers are only reused within a purpose.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScratchPurpose {
    Samples,
    Offsets,
    Durations,
    Indexes,
    PrefixSum,
    Reduction,
    Named(&'static str),
}

type PoolKey = (TypeId, ScratchPurpose);
type FreeList = Vec<Box<dyn Any + Send>>;

/// Pool of reusable [`AcceleratorBuffer`]s
pub struct ScratchPool {
    device: Option<Arc<Device>>,
    free_lists: Mutex<HashMap<PoolKey, FreeList>>,
    created: AtomicUsize,
    evicted: AtomicUsize,
}

impl ScratchPool {
    /// Create a pool. Buffers it creates are attached to `device` if given.
    pub fn new(device: Option<Arc<Device>>) -> Self {
        Self {
            device,
            free_lists: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
            evicted: AtomicUsize::new(0),
        }
    }

    /// Take a buffer from the free list for `purpose`, or create one
    pub fn allocate<T: SampleType>(&self, purpose: ScratchPurpose) -> AcceleratorBuffer<T> {
        let key = (TypeId::of::<T>(), purpose);
        let recycled = self
            .free_lists
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get_mut(&key)
            .and_then(Vec::pop);

        if let Some(boxed) = recycled {
            match boxed.downcast::<AcceleratorBuffer<T>>() {
                Ok(buffer) => return *buffer,
                Err(_) => {
                    error!("Scratch list for {:?} held a buffer of another type", purpose);
                    self.evicted.fetch_add(1, Ordering::Relaxed);
                }
            }
        }

        let created = self.created.fetch_add(1, Ordering::Relaxed) + 1;
        debug!(
            "Scratch pool creating {:?} buffer of {} ({} created)",
            purpose,
            std::any::type_name::<T>(),
            created
        );
        match &self.device {
            Some(device) => AcceleratorBuffer::on_device(Arc::clone(device)),
            None => AcceleratorBuffer::new(),
        }
    }

    /// Return a buffer to the free list for `purpose`
    pub fn free<T: SampleType>(&self, buffer: AcceleratorBuffer<T>, purpose: ScratchPurpose) {
        let key = (TypeId::of::<T>(), purpose);
        self.free_lists
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .entry(key)
            .or_default()
            .push(Box::new(buffer));
    }

    /// Borrow a buffer for the current scope; it is freed back on drop
    pub fn scoped<T: SampleType>(&self, purpose: ScratchPurpose) -> ScratchBuffer<'_, T> {
        ScratchBuffer {
            pool: self,
            purpose,
            buffer: self.allocate(purpose),
        }
    }

    /// Drop every free buffer. Returns the number of buffers released.
    pub fn clear(&self) -> usize {
        let drained: Vec<FreeList> = {
            let mut lists = self.free_lists.lock().unwrap_or_else(PoisonError::into_inner);
            std::mem::take(&mut *lists).into_values().collect()
        };
        // Buffers are dropped here, outside the pool lock; dropping releases
        // device reservations.
        let count: usize = drained.iter().map(Vec::len).sum();
        drop(drained);

        self.evicted.fetch_add(count, Ordering::Relaxed);
        if count > 0 {
            info!("Scratch pool released {} buffers", count);
        }
        count
    }

    /// Buffers ever created by this pool
    pub fn created_count(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }

    /// Buffers created and not yet evicted, whether free or lent out
    pub fn live_count(&self) -> usize {
        self.created_count()
            .saturating_sub(self.evicted.load(Ordering::Relaxed))
    }

    /// Buffers sitting in free lists
    pub fn free_count(&self) -> usize {
        self.free_lists
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .map(Vec::len)
            .sum()
    }

    /// Free buffers of element type `T` for `purpose`
    pub fn free_count_for<T: SampleType>(&self, purpose: ScratchPurpose) -> usize {
        self.free_lists
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&(TypeId::of::<T>(), purpose))
            .map_or(0, Vec::len)
    }
}

impl MemoryPressureHandler for ScratchPool {
    fn on_memory_pressure(
        &self,
        level: MemoryPressureLevel,
        memory_type: MemoryType,
        requested_size: usize,
    ) -> bool {
        debug!(
            "Scratch pool handling {:?} {:?} pressure ({} bytes requested)",
            level, memory_type, requested_size
        );
        self.clear() > 0
    }
}

/// Scratch buffer lent from a [`ScratchPool`] for the enclosing scope
pub struct ScratchBuffer<'p, T: SampleType> {
    pool: &'p ScratchPool,
    purpose: ScratchPurpose,
    buffer: AcceleratorBuffer<T>,
}

impl<T: SampleType> ScratchBuffer<'_, T> {
    pub fn purpose(&self) -> ScratchPurpose {
        self.purpose
    }
}

impl<T: SampleType> Deref for ScratchBuffer<'_, T> {
    type Target = AcceleratorBuffer<T>;

    fn deref(&self) -> &AcceleratorBuffer<T> {
        &self.buffer
    }
}

impl<T: SampleType> DerefMut for ScratchBuffer<'_, T> {
    fn deref_mut(&mut self) -> &mut AcceleratorBuffer<T> {
        &mut self.buffer
    }
}

impl<T: SampleType> Drop for ScratchBuffer<'_, T> {
    fn drop(&mut self) {
        let buffer = std::mem::take(&mut self.buffer);
        self.pool.free(buffer, self.purpose);
    }
}
