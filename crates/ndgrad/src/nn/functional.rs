//! Functional forms of the layers.
//!
//! With `inplace = true` the result is written back into `input` (through its
//! layout, so every aliasing view sees it) and `input` itself is returned.
//! The result is computed before anything is written: a failed call leaves
//! `input` untouched.

use crate::error::TensorError;
use crate::operations;
use crate::tensor::Tensor;

fn apply<F>(input: &Tensor, inplace: bool, op: F) -> Result<Tensor, TensorError>
where
    F: FnOnce(&Tensor) -> Result<Tensor, TensorError>,
{
    if !inplace {
        return op(input);
    }
    input.check_inplace()?;
    let out = op(input)?;
    if out.id() != input.id() {
        input.copy_(&out)?;
    }
    Ok(input.clone())
}

pub fn relu(input: &Tensor, inplace: bool) -> Result<Tensor, TensorError> {
    apply(input, inplace, operations::relu)
}

pub fn leaky_relu(input: &Tensor, negative_slope: f64, inplace: bool) -> Result<Tensor, TensorError> {
    apply(input, inplace, |x| operations::leaky_relu(x, negative_slope))
}

/// Randomized leaky ReLU.
///
/// # Errors
/// - `InvalidArgument` unless `lower <= upper`, both finite.
/// - `InPlaceOnTracked` / `StoragePinned` for a rejected in-place write.
///
/// # Example
///
/// ```
/// use ndgrad::Tensor;
/// use ndgrad::nn::functional::rrelu;
///
/// let x = Tensor::from_vec(vec![-1.0, 3.0], &[2]).unwrap();
/// let y = rrelu(&x, 0.5, 0.5, true, true).unwrap();
/// assert_eq!(y.id(), x.id());
/// assert_eq!(x.to_vec::<f64>().unwrap(), vec![-0.5, 3.0]);
/// ```
pub fn rrelu(
    input: &Tensor,
    lower: f64,
    upper: f64,
    training: bool,
    inplace: bool,
) -> Result<Tensor, TensorError> {
    apply(input, inplace, |x| operations::rrelu(x, lower, upper, training))
}

pub fn dropout(input: &Tensor, p: f64, training: bool, inplace: bool) -> Result<Tensor, TensorError> {
    apply(input, inplace, |x| operations::dropout(x, p, training))
}

pub fn dropout2d(input: &Tensor, p: f64, training: bool, inplace: bool) -> Result<Tensor, TensorError> {
    apply(input, inplace, |x| operations::dropout2d(x, p, training))
}

/// Zero whole 3-D channels with probability `p`.
///
/// # Errors
/// - `InvalidArgument` if `p` is outside `[0, 1]`.
/// - `InPlaceOnTracked` / `StoragePinned` for a rejected in-place write.
pub fn dropout3d(input: &Tensor, p: f64, training: bool, inplace: bool) -> Result<Tensor, TensorError> {
    apply(input, inplace, |x| operations::dropout3d(x, p, training))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::{NoGradGuard, SavedTensor};
    use crate::random::manual_seed;
    use crate::{DType, Device};

    #[test]
    fn test_inplace_visible_through_views() {
        let base = Tensor::from_vec(vec![-1.0, 2.0, -3.0, 4.0], &[4]).unwrap();
        let evens = base.view(&[2], &[2]).unwrap();
        let out = relu(&evens, true).unwrap();
        assert_eq!(out.id(), evens.id());
        assert_eq!(base.to_vec::<f64>().unwrap(), vec![0.0, 2.0, 0.0, 4.0]);
    }

    #[test]
    fn test_inplace_rejected_on_tracked() {
        let x = Tensor::from_vec(vec![-1.0, 1.0], &[2])
            .unwrap()
            .requires_grad_(true)
            .unwrap();
        assert!(matches!(
            rrelu(&x, 0.1, 0.2, true, true),
            Err(TensorError::InPlaceOnTracked { .. })
        ));
        assert_eq!(x.to_vec::<f64>().unwrap(), vec![-1.0, 1.0]);

        let _guard = NoGradGuard::new();
        rrelu(&x, 0.5, 0.5, true, true).unwrap();
        assert_eq!(x.to_vec::<f64>().unwrap(), vec![-0.5, 1.0]);
    }

    #[test]
    fn test_inplace_rejected_while_pinned() {
        let x = Tensor::ones(&[1, 1, 2, 2, 2], DType::F64, Device::Cpu).unwrap();
        let saved = SavedTensor::new(&x);
        manual_seed(3);
        let err = dropout3d(&x, 1.0, true, true).unwrap_err();
        assert!(matches!(err, TensorError::StoragePinned { .. }));
        assert_eq!(x.to_vec::<f64>().unwrap(), vec![1.0; 8]);
        drop(saved);
        dropout3d(&x, 1.0, true, true).unwrap();
        assert_eq!(x.to_vec::<f64>().unwrap(), vec![0.0; 8]);
    }

    #[test]
    fn test_eval_inplace_is_identity() {
        let x = Tensor::from_vec(vec![1.0f32, 2.0], &[2]).unwrap();
        let y = dropout(&x, 0.5, false, true).unwrap();
        assert_eq!(y.id(), x.id());
        assert_eq!(x.to_vec::<f32>().unwrap(), vec![1.0, 2.0]);
    }
}
