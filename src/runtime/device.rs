//! Accelerator device model
//!
//! The device owns a memory budget that every device-side buffer allocation is
//! charged against. Work is recorded into a [`CommandBuffer`] and executed by
//! [`Queue::submit_and_block`], which returns only once every dispatch has run.
//!
//! When a reservation does not fit, the device raises a memory-pressure
//! notification so registered handlers (the scratch pool) can release cached
//! buffers, then retries once.

use super::errors::BufferError;
use super::scratch::ScratchPool;
use crate::config::DeviceConfig;
use std::fmt;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use tracing::{debug, info, trace, warn};

/// Severity of a memory-pressure notification
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryPressureLevel {
    /// Allocation still possible, but caches should shrink
    Soft,
    /// An allocation failed and will be retried after this notification
    Hard,
}

/// Memory domain that is under pressure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MemoryType {
    Host,
    Device,
}

/// Receiver of memory-pressure notifications
pub trait MemoryPressureHandler: Send + Sync {
    /// Release what can be released. Returns true if any memory was freed.
    fn on_memory_pressure(
        &self,
        level: MemoryPressureLevel,
        memory_type: MemoryType,
        requested_size: usize,
    ) -> bool;
}

/// Accelerator device with a fixed memory budget
pub struct Device {
    name: String,
    capacity: usize,
    allocated: AtomicUsize,
    handlers: Mutex<Vec<Weak<dyn MemoryPressureHandler>>>,
}

impl Device {
    /// Create a device with `capacity` bytes of memory
    pub fn new(name: impl Into<String>, capacity: usize) -> Arc<Self> {
        let name = name.into();
        info!("Device '{}' created with {} bytes", name, capacity);
        Arc::new(Self {
            name,
            capacity,
            allocated: AtomicUsize::new(0),
            handlers: Mutex::new(Vec::new()),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn capacity_bytes(&self) -> usize {
        self.capacity
    }

    pub fn allocated_bytes(&self) -> usize {
        self.allocated.load(Ordering::Acquire)
    }

    pub fn available_bytes(&self) -> usize {
        self.capacity.saturating_sub(self.allocated_bytes())
    }

    /// Register a handler for memory-pressure notifications.
    ///
    /// Handlers are held weakly; dropped handlers are pruned on the next notification.
    pub fn register_pressure_handler(&self, handler: Weak<dyn MemoryPressureHandler>) {
        self.handlers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(handler);
    }

    /// Notify every live handler. Returns true if any handler freed memory.
    pub fn notify_memory_pressure(
        &self,
        level: MemoryPressureLevel,
        memory_type: MemoryType,
        requested_size: usize,
    ) -> bool {
        // Upgrade under the lock, call outside it: handlers drop buffers, which
        // release reservations back into this device.
        let live: Vec<Arc<dyn MemoryPressureHandler>> = {
            let mut handlers = self.handlers.lock().unwrap_or_else(PoisonError::into_inner);
            handlers.retain(|weak| weak.strong_count() > 0);
            handlers.iter().filter_map(Weak::upgrade).collect()
        };

        debug!(
            "Memory pressure on '{}': {:?} {:?}, {} bytes requested, {} handlers",
            self.name,
            level,
            memory_type,
            requested_size,
            live.len()
        );

        let mut freed = false;
        for handler in live {
            freed |= handler.on_memory_pressure(level, memory_type, requested_size);
        }
        freed
    }

    /// Charge `bytes` against the device budget.
    ///
    /// On exhaustion a hard pressure notification is raised and the
    /// reservation retried once before giving up.
    pub fn reserve(self: &Arc<Self>, bytes: usize) -> Result<DeviceReservation, BufferError> {
        if self.try_reserve(bytes) {
            return Ok(DeviceReservation::new(Arc::clone(self), bytes));
        }

        warn!(
            "Device '{}' cannot fit {} bytes ({} of {} in use), requesting eviction",
            self.name,
            bytes,
            self.allocated_bytes(),
            self.capacity
        );
        self.notify_memory_pressure(MemoryPressureLevel::Hard, MemoryType::Device, bytes);

        if self.try_reserve(bytes) {
            return Ok(DeviceReservation::new(Arc::clone(self), bytes));
        }

        Err(BufferError::OutOfDeviceMemory {
            device: self.name.clone(),
            requested: bytes,
            available: self.available_bytes(),
        })
    }

    fn try_reserve(&self, bytes: usize) -> bool {
        self.allocated
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                current
                    .checked_add(bytes)
                    .filter(|&total| total <= self.capacity)
            })
            .is_ok()
    }

    fn release(&self, bytes: usize) {
        self.allocated.fetch_sub(bytes, Ordering::AcqRel);
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Device")
            .field("name", &self.name)
            .field("capacity", &self.capacity)
            .field("allocated", &self.allocated_bytes())
            .finish()
    }
}

/// A block of device memory charged to a [`Device`]; released on drop
#[derive(Debug)]
pub struct DeviceReservation {
    device: Arc<Device>,
    bytes: usize,
}

impl DeviceReservation {
    fn new(device: Arc<Device>, bytes: usize) -> Self {
        trace!("Reserved {} bytes on '{}'", bytes, device.name);
        Self { device, bytes }
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }
}

impl Drop for DeviceReservation {
    fn drop(&mut self) {
        self.device.release(self.bytes);
    }
}

struct Dispatch<'a> {
    name: &'static str,
    kernel: Box<dyn FnOnce() + 'a>,
}

/// Recorded device work, executed by [`Queue::submit_and_block`]
///
/// Kernels borrow device slices for the lifetime of the command buffer, so
/// the borrow checker guarantees no buffer is touched from the host while a
/// recorded dispatch still refers to it.
#[derive(Default)]
pub struct CommandBuffer<'a> {
    dispatches: Vec<Dispatch<'a>>,
}

impl<'a> CommandBuffer<'a> {
    pub fn new() -> Self {
        Self {
            dispatches: Vec::new(),
        }
    }

    /// Record a compute dispatch
    pub fn dispatch(&mut self, name: &'static str, kernel: impl FnOnce() + 'a) {
        self.dispatches.push(Dispatch {
            name,
            kernel: Box::new(kernel),
        });
    }

    pub fn len(&self) -> usize {
        self.dispatches.len()
    }

    pub fn is_empty(&self) -> bool {
        self.dispatches.is_empty()
    }
}

/// Device queue. Submissions are serialized and synchronous.
pub struct Queue {
    name: String,
    submit_lock: Mutex<()>,
    submissions: AtomicU64,
    dispatches: AtomicU64,
}

impl Queue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            submit_lock: Mutex::new(()),
            submissions: AtomicU64::new(0),
            dispatches: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Execute every recorded dispatch and wait for completion
    pub fn submit_and_block(&self, commands: CommandBuffer<'_>) {
        let _lock = self.submit_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let count = commands.len();
        for dispatch in commands.dispatches {
            trace!("[{}] dispatch {}", self.name, dispatch.name);
            (dispatch.kernel)();
        }
        self.submissions.fetch_add(1, Ordering::Relaxed);
        self.dispatches.fetch_add(count as u64, Ordering::Relaxed);
    }

    /// Number of command buffers submitted so far
    pub fn submissions(&self) -> u64 {
        self.submissions.load(Ordering::Relaxed)
    }

    /// Number of dispatches executed so far
    pub fn dispatches(&self) -> u64 {
        self.dispatches.load(Ordering::Relaxed)
    }
}

/// Device, queue and scratch pool shared by every node of an executor
pub struct Accelerator {
    device: Arc<Device>,
    queue: Queue,
    scratch: Arc<ScratchPool>,
}

impl Accelerator {
    /// Create a device with `memory_bytes` of memory and its scratch pool.
    ///
    /// The pool is registered as a memory-pressure handler on the device.
    pub fn new(name: impl Into<String>, memory_bytes: usize) -> Self {
        let name = name.into();
        let device = Device::new(name.clone(), memory_bytes);
        let scratch = Arc::new(ScratchPool::new(Some(Arc::clone(&device))));
        device.register_pressure_handler(Arc::downgrade(&scratch) as Weak<dyn MemoryPressureHandler>);
        Self {
            device,
            queue: Queue::new(format!("{} queue", name)),
            scratch,
        }
    }

    pub fn from_config(config: &DeviceConfig) -> Self {
        Self::new(config.name.clone(), config.memory_bytes)
    }

    pub fn device(&self) -> &Arc<Device> {
        &self.device
    }

    pub fn queue(&self) -> &Queue {
        &self.queue
    }

    pub fn scratch(&self) -> &ScratchPool {
        &self.scratch
    }
}

impl Default for Accelerator {
    fn default() -> Self {
        Self::from_config(&DeviceConfig::default())
    }
}
