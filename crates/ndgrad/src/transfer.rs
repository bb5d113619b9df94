//! Asynchronous device transfer.
//!
//! ```text
//! to_device(device)
//!     → reserve bytes on the target device   (fails fast)
//!     → snapshot the source storage
//!     → worker thread gathers the view into a contiguous buffer,
//!       signals over a channel
//! Transfer::wait()
//!     → receive buffer, wrap as tensor, record ToDevice on the tape
//! ```
//!
//! Tensors are `!Send`, so only the raw [`Buffer`] and the source
//! [`Layout`] cross threads. The snapshot fixes the transferred values at the
//! time of the call; later writes to the source are not seen.

use crate::autodiff::{GradFn, record};
use crate::device::{self, Device, MemoryReservation};
use crate::dispatch::OpKind;
use crate::error::TensorError;
use crate::layout::Layout;
use crate::storage::{Buffer, Storage};
use crate::tensor::Tensor;
use std::sync::mpsc::{self, Receiver, TryRecvError};
use std::thread;

/// Handle to an in-flight copy of a tensor to another device.
#[derive(Debug)]
pub struct Transfer {
    source: Tensor,
    device: Device,
    state: TransferState,
}

#[derive(Debug)]
enum TransferState {
    /// Source already on the target device.
    Done,
    Pending {
        receiver: Receiver<Buffer>,
        reservation: MemoryReservation,
        received: Option<Buffer>,
    },
}

impl Tensor {
    /// Start copying this tensor to `device`.
    ///
    /// # Errors
    /// - `AllocationFailed` if the target device budget is exhausted.
    /// - `UnknownDevice` for an unconfigured accelerator.
    /// - `TransferFailed` if no worker thread could be started.
    pub fn to_device(&self, device: Device) -> Result<Transfer, TensorError> {
        if self.device() == device {
            return Ok(Transfer {
                source: self.clone(),
                device,
                state: TransferState::Done,
            });
        }

        let bytes = self
            .numel()
            .checked_mul(self.dtype().size_in_bytes())
            .ok_or_else(|| device::allocation_failed(device, usize::MAX))?;
        let reservation = device::reserve(device, bytes)?;
        let snapshot = self.storage().snapshot();
        let layout = self.layout().clone();
        let (sender, receiver) = mpsc::channel();
        thread::Builder::new()
            .name("ndgrad-transfer".to_string())
            .spawn(move || {
                let staged = gather_contiguous(snapshot, &layout);
                // The receiver is gone if the handle was dropped.
                let _ = sender.send(staged);
            })
            .map_err(|err| TensorError::TransferFailed {
                device,
                message: err.to_string(),
            })?;
        self.mark_used();
        log::debug!(
            "transfer of {} from {} to {device} started",
            self.id(),
            self.device()
        );

        Ok(Transfer {
            source: self.clone(),
            device,
            state: TransferState::Pending {
                receiver,
                reservation,
                received: None,
            },
        })
    }
}

/// Elements of `layout` in row-major order, reusing `source` when the
/// layout already covers it densely.
fn gather_contiguous(source: Buffer, layout: &Layout) -> Buffer {
    if layout.is_contiguous() && layout.offset() == 0 && layout.numel() == source.len() {
        return source;
    }
    source.gather(&layout.positions())
}

impl Transfer {
    /// Target device.
    pub fn device(&self) -> Device {
        self.device
    }

    /// Check, without blocking, whether the copy finished.
    pub fn is_complete(&mut self) -> bool {
        match &mut self.state {
            TransferState::Done => true,
            TransferState::Pending {
                receiver, received, ..
            } => {
                if received.is_some() {
                    return true;
                }
                match receiver.try_recv() {
                    Ok(buffer) => {
                        *received = Some(buffer);
                        true
                    }
                    // A vanished worker is reported by `wait`.
                    Err(TryRecvError::Disconnected) => true,
                    Err(TryRecvError::Empty) => false,
                }
            }
        }
    }

    /// Block until the copy finished and return the tensor on the target
    /// device.
    ///
    /// If the source tracks gradients the result does too; its gradient is
    /// copied back to the source device.
    pub fn wait(self) -> Result<Tensor, TensorError> {
        let (receiver, reservation, received) = match self.state {
            TransferState::Done => return Ok(self.source),
            TransferState::Pending {
                receiver,
                reservation,
                received,
            } => (receiver, reservation, received),
        };
        let buffer = match received {
            Some(buffer) => buffer,
            None => receiver.recv().map_err(|err| TensorError::TransferFailed {
                device: self.device,
                message: err.to_string(),
            })?,
        };

        let storage = Storage::with_reservation(buffer, self.device, reservation);
        let out = Tensor::from_storage(storage, Layout::contiguous(self.source.shape()))?;
        let source_device = self.source.device();
        record(OpKind::ToDevice, &[&self.source], &out, || {
            Box::new(ToDeviceBackward {
                device: source_device,
            })
        });
        log::debug!("transfer of {} to {} complete", self.source.id(), self.device);
        Ok(out)
    }
}

/// Gradient flows back to the source device unchanged.
#[derive(Debug)]
struct ToDeviceBackward {
    device: Device,
}

impl GradFn for ToDeviceBackward {
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
        Ok(vec![Some(grad_output.to_device(self.device)?.wait()?)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::DType;
    use crate::device::memory_stats;

    #[test]
    fn test_same_device_is_immediate() {
        let t = Tensor::ones(&[2], DType::F32, Device::Cpu).unwrap();
        let mut transfer = t.to_device(Device::Cpu).unwrap();
        assert!(transfer.is_complete());
        assert_eq!(transfer.wait().unwrap().id(), t.id());
    }

    #[test]
    fn test_roundtrip_values() {
        let t = Tensor::from_vec(vec![1.0f64, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
        let tt = t.t().unwrap();
        let accel = tt.to_device(Device::Accelerator(0)).unwrap().wait().unwrap();
        assert_eq!(accel.device(), Device::Accelerator(0));
        assert!(accel.is_contiguous());
        assert_eq!(accel.to_vec::<f64>().unwrap(), vec![1.0, 3.0, 2.0, 4.0]);
    }

    #[test]
    fn test_reserves_eagerly() {
        let dev = Device::Accelerator(0);
        let before = memory_stats(dev).in_use;
        let t = Tensor::zeros(&[16], DType::F64, Device::Cpu).unwrap();
        let transfer = t.to_device(dev).unwrap();
        assert_eq!(memory_stats(dev).in_use, before + 128);
        let moved = transfer.wait().unwrap();
        assert_eq!(memory_stats(dev).in_use, before + 128);
        drop(moved);
        assert_eq!(memory_stats(dev).in_use, before);
    }

    #[test]
    fn test_gradient_returns_to_source_device() {
        let x = Tensor::ones(&[3], DType::F64, Device::Cpu)
            .unwrap()
            .requires_grad_(true)
            .unwrap();
        let y = x.to_device(Device::Accelerator(0)).unwrap().wait().unwrap();
        assert!(!y.is_leaf());
        let loss = crate::operations::sum(&y).unwrap();
        loss.backward().unwrap();
        let g = x.grad().unwrap();
        assert_eq!(g.device(), Device::Cpu);
        assert_eq!(g.to_vec::<f64>().unwrap(), vec![1.0; 3]);
    }

    #[test]
    fn test_transfer_sees_values_at_call_time() {
        let base = Tensor::from_vec(vec![1.0f32, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
        let column = base.view_with_offset(&[2], &[3], 1).unwrap();
        let transfer = column.to_device(Device::Accelerator(0)).unwrap();
        base.fill_(0.0).unwrap();
        let moved = transfer.wait().unwrap();
        assert_eq!(moved.to_vec::<f32>().unwrap(), vec![2.0, 5.0]);
    }

    #[test]
    fn test_gather_contiguous() {
        let source = Buffer::from_vec(vec![1i64, 2, 3, 4, 5, 6]);
        let dense = Layout::contiguous(&[2, 3]);
        assert_eq!(gather_contiguous(source.clone(), &dense), source);

        let transposed = dense.permute(&[1, 0]).unwrap();
        assert_eq!(
            gather_contiguous(source.clone(), &transposed),
            Buffer::from_vec(vec![1i64, 4, 2, 5, 3, 6])
        );
        let tail = Layout::new(&[2], &[1], 4).unwrap();
        assert_eq!(gather_contiguous(source, &tail), Buffer::from_vec(vec![5i64, 6]));
    }
}
