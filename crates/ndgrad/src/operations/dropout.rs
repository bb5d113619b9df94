//! Dropout.
//!
//! `feature_dims` selects the mask granularity: with `0` every element is
//! dropped independently; with `k > 0` one draw is shared by all elements of
//! each index into the leading `k` dimensions (whole channels).

use super::elementwise::mul;
use crate::autodiff::{GradFn, SavedTensor, record};
use crate::dispatch::{OpAttrs, OpKind, dispatch};
use crate::error::TensorError;
use crate::tensor::Tensor;

fn check_probability(p: f64) -> Result<(), TensorError> {
    if !(0.0..=1.0).contains(&p) {
        return Err(TensorError::invalid_argument(format!(
            "dropout probability has to be between 0 and 1, but got {p}"
        )));
    }
    Ok(())
}

/// Zero elements with probability `p` and scale the rest by `1 / (1 - p)`.
///
/// Returns `x` itself when not training or when `p == 0`.
pub fn dropout(x: &Tensor, p: f64, training: bool) -> Result<Tensor, TensorError> {
    feature_dropout(x, p, training, 0)
}

/// Dropout with a mask shared across the trailing dimensions.
///
/// # Errors
/// `InvalidArgument` if `p` is outside `[0, 1]`.
pub fn feature_dropout(
    x: &Tensor,
    p: f64,
    training: bool,
    feature_dims: usize,
) -> Result<Tensor, TensorError> {
    check_probability(p)?;
    if !training || p == 0.0 {
        return Ok(x.clone());
    }

    let attrs = OpAttrs::Dropout { p, feature_dims };
    let mut outputs = dispatch(OpKind::Dropout, &[x], &attrs)?.into_iter();
    let (Some(out), Some(mask)) = (outputs.next(), outputs.next()) else {
        return Err(TensorError::invalid_argument("dropout kernel must return output and mask"));
    };
    record(OpKind::Dropout, &[x], &out, || {
        Box::new(DropoutBackward {
            saved_mask: SavedTensor::new(&mask),
        })
    });
    Ok(out)
}

/// Gradient is the scaled keep mask.
#[derive(Debug)]
struct DropoutBackward {
    saved_mask: SavedTensor,
}

impl GradFn for DropoutBackward {
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
        Ok(vec![Some(mul(grad_output, self.saved_mask.get())?)])
    }
}

/// Channel dropout for `(N, C, H, W)` or unbatched `(C, H, W)` input.
pub fn dropout2d(x: &Tensor, p: f64, training: bool) -> Result<Tensor, TensorError> {
    let feature_dims = match x.ndim() {
        4 => 2,
        3 => 1,
        ndim => {
            log::warn!(
                "dropout2d expects 3-D or 4-D input, got {ndim}-D; \
                 dropping along the first dimension"
            );
            1
        }
    };
    feature_dropout(x, p, training, feature_dims)
}

/// Channel dropout for `(N, C, D, H, W)` or unbatched `(C, D, H, W)` input.
///
/// # Example
///
/// ```
/// use ndgrad::{DType, Device, Tensor};
/// use ndgrad::operations::dropout3d;
///
/// let x = Tensor::ones(&[2, 3, 2, 2, 2], DType::F32, Device::Cpu).unwrap();
/// let y = dropout3d(&x, 0.5, true).unwrap();
/// let v = y.to_vec::<f32>().unwrap();
/// // Each (n, c) channel of 8 elements is either all zero or all 2.
/// for channel in v.chunks(8) {
///     assert!(channel.iter().all(|&e| e == channel[0]));
/// }
/// ```
pub fn dropout3d(x: &Tensor, p: f64, training: bool) -> Result<Tensor, TensorError> {
    let feature_dims = match x.ndim() {
        5 => 2,
        4 => 1,
        ndim => {
            log::warn!(
                "dropout3d expects 4-D or 5-D input, got {ndim}-D; \
                 dropping along the first dimension"
            );
            1
        }
    };
    feature_dropout(x, p, training, feature_dims)
}
