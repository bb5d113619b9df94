//! Reference-counted device storage.
//!
//! ```text
//! Storage (Rc)
//! ├── Buffer           - typed contiguous elements
//! ├── MemoryReservation - device bytes, released on drop
//! └── pins             - saved-for-backward claims blocking in-place writes
//! ```
//!
//! Tensors and views share one `Storage` by cloning the handle. The buffer
//! is freed, and its device bytes released, when the last handle drops.

mod buffer;

pub use buffer::Buffer;

use crate::device::{self, Device, MemoryReservation};
use crate::dtype::DType;
use crate::error::TensorError;
use crate::scalar::Element;
use std::cell::{Cell, RefCell};
use std::rc::Rc;
use std::sync::atomic::{AtomicUsize, Ordering};

/// Unique identifier for a storage allocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StorageId(usize);

static STORAGE_COUNTER: AtomicUsize = AtomicUsize::new(1);

#[derive(Debug)]
struct StorageInner {
    id: StorageId,
    dtype: DType,
    device: Device,
    len: usize,
    buffer: RefCell<Buffer>,
    pins: Cell<usize>,
    version: Cell<u64>,
    _reservation: MemoryReservation,
}

/// Shared handle to a typed buffer on a device.
#[derive(Debug, Clone)]
pub struct Storage {
    inner: Rc<StorageInner>,
}

impl Storage {
    /// Allocate a zero-initialized storage of `count` elements.
    ///
    /// # Errors
    /// `AllocationFailed` if the device budget is exhausted, the byte size
    /// overflows or the host cannot provide the memory;
    /// `UnknownDevice` for an unconfigured accelerator.
    pub fn allocate(count: usize, dtype: DType, device: Device) -> Result<Self, TensorError> {
        Self::allocate_full(count, 0.0, dtype, device)
    }

    /// Allocate `count` elements set to `value`.
    pub fn allocate_full(
        count: usize,
        value: f64,
        dtype: DType,
        device: Device,
    ) -> Result<Self, TensorError> {
        let bytes = count
            .checked_mul(dtype.size_in_bytes())
            .ok_or_else(|| device::allocation_failed(device, usize::MAX))?;
        let reservation = device::reserve(device, bytes)?;
        let buffer = Buffer::try_full(dtype, count, value)
            .map_err(|_| device::allocation_failed(device, bytes))?;
        Ok(Self::with_reservation(buffer, device, reservation))
    }

    /// Take ownership of an existing buffer, reserving its bytes on `device`.
    pub fn from_buffer(buffer: Buffer, device: Device) -> Result<Self, TensorError> {
        let reservation = device::reserve(device, buffer.nbytes())?;
        Ok(Self::with_reservation(buffer, device, reservation))
    }

    pub(crate) fn with_reservation(
        buffer: Buffer,
        device: Device,
        reservation: MemoryReservation,
    ) -> Self {
        let id = StorageId(STORAGE_COUNTER.fetch_add(1, Ordering::Relaxed));
        Self {
            inner: Rc::new(StorageInner {
                id,
                dtype: buffer.dtype(),
                device,
                len: buffer.len(),
                buffer: RefCell::new(buffer),
                pins: Cell::new(0),
                version: Cell::new(0),
                _reservation: reservation,
            }),
        }
    }

    pub fn id(&self) -> StorageId {
        self.inner.id
    }

    pub fn dtype(&self) -> DType {
        self.inner.dtype
    }

    pub fn device(&self) -> Device {
        self.inner.device
    }

    /// Number of elements.
    pub fn len(&self) -> usize {
        self.inner.len
    }

    pub fn is_empty(&self) -> bool {
        self.inner.len == 0
    }

    pub fn nbytes(&self) -> usize {
        self.inner.len * self.inner.dtype.size_in_bytes()
    }

    /// Number of live handles (tensors, views, saved tensors) to this storage.
    pub fn ref_count(&self) -> usize {
        Rc::strong_count(&self.inner)
    }

    /// Number of in-place writes performed so far.
    pub fn version(&self) -> u64 {
        self.inner.version.get()
    }

    /// Number of pending backward nodes that saved this storage.
    pub fn pin_count(&self) -> usize {
        self.inner.pins.get()
    }

    /// Check if both handles refer to the same allocation.
    pub fn shares_with(&self, other: &Storage) -> bool {
        Rc::ptr_eq(&self.inner, &other.inner)
    }

    /// Read one element by flat offset.
    pub fn read<T: Element>(&self, offset: usize) -> Result<T, TensorError> {
        self.with_slice(|data: &[T]| data.get(offset).copied())?
            .ok_or(TensorError::IndexOutOfBounds {
                index: offset,
                dim_size: self.len(),
            })
    }

    /// Write one element by flat offset.
    ///
    /// # Errors
    /// `StoragePinned` while a pending backward node needs the current values.
    pub fn write<T: Element>(&self, offset: usize, value: T) -> Result<(), TensorError> {
        let len = self.len();
        self.with_slice_mut(|data: &mut [T]| match data.get_mut(offset) {
            Some(slot) => {
                *slot = value;
                Ok(())
            }
            None => Err(TensorError::IndexOutOfBounds {
                index: offset,
                dim_size: len,
            }),
        })?
    }

    /// Run `f` on the typed contents.
    pub fn with_slice<T: Element, R>(&self, f: impl FnOnce(&[T]) -> R) -> Result<R, TensorError> {
        let buffer = self.inner.buffer.borrow();
        let data = buffer.as_slice::<T>().ok_or(TensorError::DTypeMismatch {
            expected: T::DTYPE,
            actual: self.dtype(),
        })?;
        Ok(f(data))
    }

    /// Run `f` on the mutable typed contents.
    ///
    /// # Errors
    /// `StoragePinned` while pinned, `DTypeMismatch` for the wrong `T`.
    pub fn with_slice_mut<T: Element, R>(
        &self,
        f: impl FnOnce(&mut [T]) -> R,
    ) -> Result<R, TensorError> {
        self.check_writable()?;
        let mut buffer = self.inner.buffer.borrow_mut();
        let actual = buffer.dtype();
        let data = buffer.as_mut_slice::<T>().ok_or(TensorError::DTypeMismatch {
            expected: T::DTYPE,
            actual,
        })?;
        let result = f(data);
        self.bump_version();
        Ok(result)
    }

    /// Copy the elements at `positions` into a new buffer.
    pub(crate) fn gather(&self, positions: &[usize]) -> Buffer {
        self.inner.buffer.borrow().gather(positions)
    }

    /// Write `src` element `i` to `positions[i]`.
    pub(crate) fn scatter(&self, positions: &[usize], src: &Buffer) -> Result<(), TensorError> {
        self.check_writable()?;
        if !self.inner.buffer.borrow_mut().scatter(positions, src) {
            return Err(TensorError::DTypeMismatch {
                expected: self.dtype(),
                actual: src.dtype(),
            });
        }
        self.bump_version();
        Ok(())
    }

    /// Clone of the whole buffer.
    pub(crate) fn snapshot(&self) -> Buffer {
        self.inner.buffer.borrow().clone()
    }

    pub(crate) fn pin(&self) -> StoragePin {
        self.inner.pins.set(self.inner.pins.get() + 1);
        StoragePin {
            storage: self.clone(),
        }
    }

    fn check_writable(&self) -> Result<(), TensorError> {
        match self.inner.pins.get() {
            0 => Ok(()),
            pins => Err(TensorError::StoragePinned { pins }),
        }
    }

    fn bump_version(&self) {
        self.inner.version.set(self.inner.version.get() + 1);
    }
}

/// Claim on a storage's current values, held by saved tensors.
#[derive(Debug)]
pub(crate) struct StoragePin {
    storage: Storage,
}

impl Drop for StoragePin {
    fn drop(&mut self) {
        let pins = &self.storage.inner.pins;
        pins.set(pins.get().saturating_sub(1));
    }
}
