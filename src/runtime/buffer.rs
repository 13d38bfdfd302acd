//! Dual-residency sample storage
//!
//! [`AcceleratorBuffer`] keeps a host copy of its elements and, when attached to
//! a [`Device`], an optional device mirror. Each side is either current or
//! stale:
//!
//! - `mark_modified_from_cpu()` / `mark_modified_from_gpu()` make one side
//!   authoritative and the other stale. No data moves at that point.
//! - `prepare_for_cpu_access()` / `prepare_for_gpu_access()` copy from the
//!   authoritative side only when the requested side is stale, so calling them
//!   repeatedly costs nothing.
//!
//! Host mutators (`resize`, `push`, `as_mut_slice`, ...) operate on the host
//! copy. The writer calls `mark_modified_from_cpu()` when done.

use super::device::{Device, DeviceReservation};
use super::errors::BufferError;
use std::fmt;
use std::sync::Arc;
use tracing::trace;

/// Element types that can live in an [`AcceleratorBuffer`]
pub trait SampleType: Copy + Default + Send + Sync + 'static {}

impl<T: Copy + Default + Send + Sync + 'static> SampleType for T {}

/// Side of a buffer that holds the newest data
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Residency {
    /// Both copies agree (or there is no device mirror and the host is current)
    Synced,
    /// Host copy is newest; device copy is stale
    Cpu,
    /// Device copy is newest; host copy is stale
    Gpu,
}

/// Number of copies performed in each direction
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub host_to_device: u64,
    pub device_to_host: u64,
}

struct DeviceMirror<T> {
    data: Vec<T>,
    _reservation: DeviceReservation,
}

/// Sample array with a host copy and an optional accelerator mirror
pub struct AcceleratorBuffer<T> {
    host: Vec<T>,
    mirror: Option<DeviceMirror<T>>,
    device: Option<Arc<Device>>,
    cpu_current: bool,
    gpu_current: bool,
    stats: TransferStats,
}

impl<T: SampleType> AcceleratorBuffer<T> {
    /// Create a host-only buffer
    pub fn new() -> Self {
        Self {
            host: Vec::new(),
            mirror: None,
            device: None,
            cpu_current: true,
            gpu_current: false,
            stats: TransferStats::default(),
        }
    }

    /// Create a buffer that can be mirrored onto `device`
    pub fn on_device(device: Arc<Device>) -> Self {
        Self {
            device: Some(device),
            ..Self::new()
        }
    }

    /// Host-only buffer initialized from a slice
    pub fn from_slice(values: &[T]) -> Self {
        let mut buffer = Self::new();
        buffer.host.extend_from_slice(values);
        buffer
    }

    /// Attach `device` if the buffer was created host-only
    pub fn ensure_device(&mut self, device: &Arc<Device>) {
        if self.device.is_none() {
            self.device = Some(Arc::clone(device));
        }
    }

    pub fn device(&self) -> Option<&Arc<Device>> {
        self.device.as_ref()
    }

    pub fn len(&self) -> usize {
        self.host.len()
    }

    pub fn is_empty(&self) -> bool {
        self.host.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.host.capacity()
    }

    /// Which side currently holds the newest data
    pub fn residency(&self) -> Residency {
        match (self.cpu_current, self.gpu_current) {
            (true, false) if self.mirror.is_some() => Residency::Cpu,
            (false, true) => Residency::Gpu,
            _ => Residency::Synced,
        }
    }

    pub fn is_cpu_current(&self) -> bool {
        self.cpu_current
    }

    pub fn is_gpu_current(&self) -> bool {
        self.gpu_current
    }

    pub fn transfer_stats(&self) -> TransferStats {
        self.stats
    }

    /// Bytes currently held in device memory by this buffer
    pub fn device_bytes(&self) -> usize {
        self.mirror.as_ref().map_or(0, |m| m.data.len() * size_of::<T>())
    }

    /// Make the host copy current, pulling from the device if it is stale
    pub fn prepare_for_cpu_access(&mut self) {
        if self.cpu_current {
            return;
        }
        if let Some(mirror) = &self.mirror {
            self.host.clear();
            self.host.extend_from_slice(&mirror.data);
            self.stats.device_to_host += 1;
            trace!("Buffer pulled {} elements from device", self.host.len());
        }
        self.cpu_current = true;
    }

    /// Make the device copy current, allocating the mirror and pushing host
    /// data if needed
    pub fn prepare_for_gpu_access(&mut self) -> Result<(), BufferError> {
        let device = Arc::clone(self.device.as_ref().ok_or(BufferError::NoDevice)?);

        let mirror_fits = self
            .mirror
            .as_ref()
            .is_some_and(|m| m.data.len() == self.host.len());
        if !mirror_fits {
            if !self.cpu_current {
                // The mirror holds the only current data but has the wrong
                // shape; that can't happen through the public API.
                self.prepare_for_cpu_access();
            }
            // Release the old block before charging the new one
            self.mirror = None;
            self.gpu_current = false;
            let reservation = device.reserve(self.host.len() * size_of::<T>())?;
            self.mirror = Some(DeviceMirror {
                data: vec![T::default(); self.host.len()],
                _reservation: reservation,
            });
        }

        if !self.gpu_current {
            if let Some(mirror) = &mut self.mirror {
                mirror.data.copy_from_slice(&self.host);
                self.stats.host_to_device += 1;
                trace!("Buffer pushed {} elements to device", self.host.len());
            }
            self.gpu_current = true;
        }
        Ok(())
    }

    /// Host copy now holds the newest data
    pub fn mark_modified_from_cpu(&mut self) {
        self.cpu_current = true;
        self.gpu_current = false;
    }

    /// Device copy now holds the newest data
    pub fn mark_modified_from_gpu(&mut self) {
        if self.mirror.is_none() {
            return;
        }
        self.gpu_current = true;
        self.cpu_current = false;
    }

    /// Drop the device mirror, pulling its data back first if it is the only
    /// current copy
    pub fn free_device_memory(&mut self) {
        self.prepare_for_cpu_access();
        self.mirror = None;
        self.gpu_current = false;
    }

    /// Resize the host copy. Authority moves to the host.
    pub fn resize(&mut self, len: usize) {
        self.prepare_for_cpu_access();
        self.host.resize(len, T::default());
        self.mark_modified_from_cpu();
    }

    pub fn reserve(&mut self, additional: usize) {
        self.host.reserve(additional);
    }

    /// Remove all elements. Authority moves to the host.
    pub fn clear(&mut self) {
        self.host.clear();
        self.mark_modified_from_cpu();
    }

    pub fn push(&mut self, value: T) {
        self.prepare_for_cpu_access();
        self.host.push(value);
        self.mark_modified_from_cpu();
    }

    pub fn extend_from_slice(&mut self, values: &[T]) {
        self.prepare_for_cpu_access();
        self.host.extend_from_slice(values);
        self.mark_modified_from_cpu();
    }

    /// Replace the contents with a copy of `other`'s current data.
    ///
    /// Reads the device mirror directly when that side is authoritative, so
    /// `other` needs no staging.
    pub fn copy_from(&mut self, other: &AcceleratorBuffer<T>) {
        self.host.clear();
        self.host.extend_from_slice(other.current_data());
        self.mark_modified_from_cpu();
    }

    /// Whichever copy is authoritative
    fn current_data(&self) -> &[T] {
        match (&self.mirror, self.cpu_current) {
            (Some(mirror), false) => mirror.data.as_slice(),
            _ => self.host.as_slice(),
        }
    }

    /// Host view. Only meaningful after `prepare_for_cpu_access()`.
    pub fn as_slice(&self) -> &[T] {
        &self.host
    }

    /// Mutable host view. Call `mark_modified_from_cpu()` after writing.
    pub fn as_mut_slice(&mut self) -> &mut [T] {
        &mut self.host
    }

    pub fn get(&self, index: usize) -> Option<T> {
        self.host.get(index).copied()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, T> {
        self.host.iter()
    }

    /// Device view, if a mirror exists
    pub fn device_slice(&self) -> Option<&[T]> {
        self.mirror.as_ref().map(|m| m.data.as_slice())
    }

    /// Mutable device view. Call `mark_modified_from_gpu()` after the
    /// submission that writes it has completed.
    pub fn device_slice_mut(&mut self) -> Option<&mut [T]> {
        self.mirror.as_mut().map(|m| m.data.as_mut_slice())
    }
}

impl<T: SampleType> Default for AcceleratorBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: SampleType> Clone for AcceleratorBuffer<T> {
    /// Clones the current data into a host-resident buffer on the same device
    fn clone(&self) -> Self {
        Self {
            host: self.current_data().to_vec(),
            mirror: None,
            device: self.device.clone(),
            cpu_current: true,
            gpu_current: false,
            stats: TransferStats::default(),
        }
    }
}

impl<T> std::ops::Index<usize> for AcceleratorBuffer<T> {
    type Output = T;

    fn index(&self, index: usize) -> &T {
        &self.host[index]
    }
}

impl<T> std::ops::IndexMut<usize> for AcceleratorBuffer<T> {
    fn index_mut(&mut self, index: usize) -> &mut T {
        &mut self.host[index]
    }
}

impl<T: SampleType + fmt::Debug> fmt::Debug for AcceleratorBuffer<T> {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AcceleratorBuffer")
            .field("len", &self.host.len())
            .field("residency", &self.residency())
            .field("device_bytes", &self.device_bytes())
            .finish()
    }
}
