//! Devices and per-thread device memory accounting.
//!
//! Every [`Storage`](crate::storage::Storage) holds a [`MemoryReservation`]
//! for its bytes. Reservations are returned to the allocator as soon as the
//! storage is dropped, so device budgets track live data exactly.
//!
//! The accelerator device is host-backed: its buffers live in host memory,
//! but it has its own byte budget, its own kernel registrations, and data only
//! moves between devices through explicit transfers.

use crate::error::TensorError;
use std::cell::RefCell;
use std::collections::HashMap;
use std::fmt;

/// A compute device.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default)]
pub enum Device {
    #[default]
    Cpu,
    Accelerator(usize),
}

/// Device kind, the granularity at which kernels are registered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum DeviceKind {
    Cpu,
    Accelerator,
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Device::Cpu => write!(f, "cpu"),
            Device::Accelerator(ordinal) => write!(f, "accel:{ordinal}"),
        }
    }
}

impl fmt::Debug for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Device[{}]", self)
    }
}

impl Device {
    pub fn kind(&self) -> DeviceKind {
        match self {
            Device::Cpu => DeviceKind::Cpu,
            Device::Accelerator(_) => DeviceKind::Accelerator,
        }
    }

    pub fn is_cpu(&self) -> bool {
        matches!(self, Device::Cpu)
    }

    pub fn is_accelerator(&self) -> bool {
        matches!(self, Device::Accelerator(_))
    }
}

/// Memory usage of one device on the current thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct MemoryStats {
    /// Bytes currently reserved by live storages.
    pub in_use: usize,
    /// Highest `in_use` observed since the limits were last configured.
    pub peak: usize,
    /// Byte budget, `None` if unlimited.
    pub limit: Option<usize>,
}

#[derive(Debug)]
struct DeviceAllocator {
    cpu_limit: Option<usize>,
    accelerator_limit: Option<usize>,
    accelerator_count: usize,
    stats: HashMap<Device, MemoryStats>,
}

impl DeviceAllocator {
    fn new() -> Self {
        Self {
            cpu_limit: None,
            accelerator_limit: None,
            accelerator_count: 1,
            stats: HashMap::new(),
        }
    }

    fn limit_for(&self, device: Device) -> Option<usize> {
        match device {
            Device::Cpu => self.cpu_limit,
            Device::Accelerator(_) => self.accelerator_limit,
        }
    }

    fn reserve(&mut self, device: Device, bytes: usize) -> Result<(), TensorError> {
        if let Device::Accelerator(ordinal) = device {
            if ordinal >= self.accelerator_count {
                return Err(TensorError::UnknownDevice {
                    device,
                    available: self.accelerator_count,
                });
            }
        }

        let limit = self.limit_for(device);
        let stats = self.stats.entry(device).or_default();
        stats.limit = limit;

        if let Some(limit) = limit {
            if stats.in_use.saturating_add(bytes) > limit {
                return Err(TensorError::AllocationFailed {
                    device,
                    requested: bytes,
                    in_use: stats.in_use,
                    limit,
                });
            }
        }

        stats.in_use = stats.in_use.saturating_add(bytes);
        stats.peak = stats.peak.max(stats.in_use);
        Ok(())
    }

    fn release(&mut self, device: Device, bytes: usize) {
        if let Some(stats) = self.stats.get_mut(&device) {
            stats.in_use = stats.in_use.saturating_sub(bytes);
        }
    }
}

thread_local! {
    static ALLOCATOR: RefCell<DeviceAllocator> = RefCell::new(DeviceAllocator::new());
}

/// Bytes reserved on a device; returned to the allocator on drop.
#[derive(Debug)]
pub struct MemoryReservation {
    device: Device,
    bytes: usize,
}

impl MemoryReservation {
    pub fn device(&self) -> Device {
        self.device
    }

    pub fn bytes(&self) -> usize {
        self.bytes
    }
}

impl Drop for MemoryReservation {
    fn drop(&mut self) {
        // The allocator may already be gone during thread teardown.
        let _ = ALLOCATOR.try_with(|a| a.borrow_mut().release(self.device, self.bytes));
    }
}

/// Reserve `bytes` on `device` for the current thread.
///
/// # Errors
/// - `AllocationFailed` if the device budget would be exceeded.
/// - `UnknownDevice` if the accelerator ordinal is not configured.
pub fn reserve(device: Device, bytes: usize) -> Result<MemoryReservation, TensorError> {
    ALLOCATOR.with(|a| a.borrow_mut().reserve(device, bytes))?;
    log::debug!("reserved {bytes} bytes on {device}");
    Ok(MemoryReservation { device, bytes })
}

/// `AllocationFailed` for `requested` bytes, with the device's current usage.
pub(crate) fn allocation_failed(device: Device, requested: usize) -> TensorError {
    let stats = memory_stats(device);
    TensorError::AllocationFailed {
        device,
        requested,
        in_use: stats.in_use,
        limit: stats.limit.unwrap_or(usize::MAX),
    }
}

/// Memory statistics for `device` on the current thread.
pub fn memory_stats(device: Device) -> MemoryStats {
    ALLOCATOR.with(|a| {
        let a = a.borrow();
        let mut stats = a.stats.get(&device).copied().unwrap_or_default();
        stats.limit = a.limit_for(device);
        stats
    })
}

/// Number of accelerators configured on the current thread.
pub fn accelerator_count() -> usize {
    ALLOCATOR.with(|a| a.borrow().accelerator_count)
}

/// Apply device limits to the current thread. Resets peak statistics.
pub(crate) fn configure(
    cpu_limit: Option<usize>,
    accelerator_limit: Option<usize>,
    accelerator_count: usize,
) {
    ALLOCATOR.with(|a| {
        let mut a = a.borrow_mut();
        a.cpu_limit = cpu_limit;
        a.accelerator_limit = accelerator_limit;
        a.accelerator_count = accelerator_count;
        for stats in a.stats.values_mut() {
            stats.peak = stats.in_use;
        }
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_display() {
        assert_eq!(Device::Cpu.to_string(), "cpu");
        assert_eq!(Device::Accelerator(1).to_string(), "accel:1");
        assert_eq!(format!("{:?}", Device::Cpu), "Device[cpu]");
    }

    #[test]
    fn test_device_kind() {
        assert_eq!(Device::Cpu.kind(), DeviceKind::Cpu);
        assert_eq!(Device::Accelerator(3).kind(), DeviceKind::Accelerator);
    }

    #[test]
    fn test_reservation_released_on_drop() {
        configure(None, None, 1);
        let before = memory_stats(Device::Cpu).in_use;
        let r = reserve(Device::Cpu, 64).unwrap();
        assert_eq!(memory_stats(Device::Cpu).in_use, before + 64);
        drop(r);
        assert_eq!(memory_stats(Device::Cpu).in_use, before);
    }

    #[test]
    fn test_limit_enforced() {
        configure(None, Some(100), 1);
        let dev = Device::Accelerator(0);
        let r = reserve(dev, 80).unwrap();
        let err = reserve(dev, 40).unwrap_err();
        assert!(matches!(err, TensorError::AllocationFailed { .. }));
        drop(r);
        assert!(reserve(dev, 40).is_ok());
        configure(None, None, 1);
    }

    #[test]
    fn test_unknown_accelerator() {
        configure(None, None, 1);
        let err = reserve(Device::Accelerator(5), 8).unwrap_err();
        assert!(matches!(err, TensorError::UnknownDevice { .. }));
    }
}
