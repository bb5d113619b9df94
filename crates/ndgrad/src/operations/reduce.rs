//! Full reductions.

use super::elementwise::mul_scalar;
use crate::autodiff::{GradFn, record};
use crate::dispatch::{OpAttrs, OpKind, dispatch_one};
use crate::error::TensorError;
use crate::tensor::Tensor;

/// Sum of all elements as a 0-dimensional tensor.
pub fn sum(x: &Tensor) -> Result<Tensor, TensorError> {
    let out = dispatch_one(OpKind::Sum, &[x], &OpAttrs::None)?;
    record(OpKind::Sum, &[x], &out, || {
        Box::new(SumBackward {
            input_shape: x.shape().to_vec(),
        })
    });
    Ok(out)
}

#[derive(Debug)]
struct SumBackward {
    input_shape: Vec<usize>,
}

impl GradFn for SumBackward {
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
        let attrs = OpAttrs::Expand {
            shape: self.input_shape.clone(),
        };
        Ok(vec![Some(dispatch_one(OpKind::Expand, &[grad_output], &attrs)?)])
    }
}

/// Mean of all elements as a 0-dimensional tensor.
pub fn mean(x: &Tensor) -> Result<Tensor, TensorError> {
    if x.numel() == 0 {
        return Err(TensorError::invalid_argument("mean of an empty tensor"));
    }
    mul_scalar(&sum(x)?, 1.0 / x.numel() as f64)
}
