//! Saved tensor for backward pass.

use crate::storage::StoragePin;
use crate::tensor::Tensor;
use std::rc::Rc;

/// Tensor values captured during the forward pass.
///
/// Holds a detached handle, so the saved value never carries autograd
/// history, plus a pin on its storage: while any `SavedTensor` is alive the
/// storage rejects in-place writes. Uses `Rc` for cheap cloning within the
/// single-threaded tape.
#[derive(Debug, Clone)]
pub struct SavedTensor {
    inner: Rc<SavedInner>,
}

#[derive(Debug)]
struct SavedInner {
    tensor: Tensor,
    _pin: StoragePin,
}

impl SavedTensor {
    pub fn new(tensor: &Tensor) -> Self {
        let detached = tensor.detach();
        let pin = detached.storage().pin();
        Self {
            inner: Rc::new(SavedInner {
                tensor: detached,
                _pin: pin,
            }),
        }
    }

    /// Get the saved values.
    pub fn get(&self) -> &Tensor {
        &self.inner.tensor
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::TensorError;
    use crate::{DType, Device};

    #[test]
    fn test_saved_tensor_pins_until_dropped() {
        let t = Tensor::ones(&[2], DType::F64, Device::Cpu).unwrap();
        let saved = SavedTensor::new(&t);
        let clone = saved.clone();
        assert_eq!(t.storage().pin_count(), 1);
        assert!(matches!(
            t.fill_(0.0),
            Err(TensorError::StoragePinned { .. })
        ));

        drop(saved);
        assert_eq!(t.storage().pin_count(), 1);
        drop(clone);
        assert_eq!(t.storage().pin_count(), 0);
        t.fill_(0.0).unwrap();
    }

    #[test]
    fn test_saved_tensor_is_detached() {
        let t = Tensor::ones(&[2], DType::F64, Device::Cpu)
            .unwrap()
            .requires_grad_(true)
            .unwrap();
        let saved = SavedTensor::new(&t);
        assert!(!saved.get().requires_grad());
        assert!(saved.get().shares_storage_with(&t));
    }
}
