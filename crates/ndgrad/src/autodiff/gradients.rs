//! Gradient storage container.

use crate::dispatch::{OpAttrs, OpKind, dispatch_one};
use crate::error::TensorError;
use crate::tensor::{Tensor, TensorId};
use std::collections::HashMap;

/// Container for accumulated gradients.
///
/// Stores gradients keyed by tensor identity, summing contributions from
/// tensors that feed several consumers.
#[derive(Debug, Default)]
pub struct Gradients {
    grads: HashMap<TensorId, Tensor>,
}

impl Gradients {
    /// Create empty gradient container.
    pub fn new() -> Self {
        Self::default()
    }

    /// Accumulate gradient for a tensor.
    ///
    /// If a gradient already exists, adds to it (for multiple paths).
    pub fn accumulate(&mut self, id: TensorId, grad: Tensor) -> Result<(), TensorError> {
        let summed = match self.grads.get(&id) {
            Some(existing) => sum_gradients(existing, &grad)?,
            None => grad,
        };
        self.grads.insert(id, summed);
        Ok(())
    }

    /// Get gradient for a tensor.
    pub fn get(&self, id: TensorId) -> Option<&Tensor> {
        self.grads.get(&id)
    }

    /// Remove and return gradient (for passing to backward functions).
    pub fn remove(&mut self, id: TensorId) -> Option<Tensor> {
        self.grads.remove(&id)
    }

    /// Check if gradient exists for tensor.
    pub fn contains(&self, id: TensorId) -> bool {
        self.grads.contains_key(&id)
    }

    /// Number of stored gradients.
    pub fn len(&self) -> usize {
        self.grads.len()
    }

    /// Check if no gradients stored.
    pub fn is_empty(&self) -> bool {
        self.grads.is_empty()
    }

    /// Iterate over all gradients.
    pub fn iter(&self) -> impl Iterator<Item = (&TensorId, &Tensor)> {
        self.grads.iter()
    }
}

/// Element-wise sum of two gradients, without recording.
pub(crate) fn sum_gradients(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    dispatch_one(OpKind::Add, &[a, b], &OpAttrs::None)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn test_accumulate_sums() {
        let a = Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
        let id = a.id();
        let mut grads = Gradients::new();
        grads
            .accumulate(id, Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap())
            .unwrap();
        grads
            .accumulate(id, Tensor::from_vec(vec![3.0, 4.0], &[2]).unwrap())
            .unwrap();

        let g = grads.get(id).unwrap().to_vec::<f64>().unwrap();
        assert_relative_eq!(g[0], 4.0);
        assert_relative_eq!(g[1], 6.0);
        assert_eq!(grads.len(), 1);
    }

    #[test]
    fn test_accumulate_shape_mismatch() {
        let id = Tensor::scalar(0.0f64).unwrap().id();
        let mut grads = Gradients::new();
        grads
            .accumulate(id, Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap())
            .unwrap();
        assert!(
            grads
                .accumulate(id, Tensor::from_vec(vec![1.0], &[1]).unwrap())
                .is_err()
        );
    }

    #[test]
    fn test_remove() {
        let id = Tensor::scalar(0.0f64).unwrap().id();
        let mut grads = Gradients::new();
        grads.accumulate(id, Tensor::scalar(1.0f64).unwrap()).unwrap();
        assert!(grads.contains(id));
        assert!(grads.remove(id).is_some());
        assert!(grads.is_empty());
    }
}
