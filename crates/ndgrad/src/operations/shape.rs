//! Views and layout changes.
//!
//! Views share storage with their source: writes through one are visible
//! through the other. Only [`contiguous`] on a strided input copies.

use crate::autodiff::{GradFn, record};
use crate::dispatch::{OpAttrs, OpKind, dispatch_one};
use crate::error::TensorError;
use crate::layout::{Layout, compute_strides, numel};
use crate::tensor::Tensor;

fn view_of(x: &Tensor, layout: Layout) -> Result<Tensor, TensorError> {
    let out = Tensor::from_storage(x.storage().clone(), layout)?;
    x.mark_used();
    Ok(out)
}

/// View `x`'s storage through an arbitrary layout.
///
/// The gradient of a view is summed back onto the source elements it reads,
/// so overlapping views (zero strides) accumulate correctly.
///
/// # Errors
/// `ViewOutOfBounds` if `layout` addresses elements past the storage end.
pub fn as_strided(x: &Tensor, layout: Layout) -> Result<Tensor, TensorError> {
    let out = view_of(x, layout.clone())?;
    record(OpKind::AsStrided, &[x], &out, || {
        Box::new(AsStridedBackward {
            source: x.layout().clone(),
            view: layout,
            storage_len: x.storage().len(),
        })
    });
    Ok(out)
}

#[derive(Debug)]
struct AsStridedBackward {
    source: Layout,
    view: Layout,
    storage_len: usize,
}

impl GradFn for AsStridedBackward {
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
        let attrs = OpAttrs::Restride {
            source: self.source.clone(),
            view: self.view.clone(),
            storage_len: self.storage_len,
        };
        Ok(vec![Some(dispatch_one(OpKind::Restride, &[grad_output], &attrs)?)])
    }
}

/// Reshape to `shape`. Shares storage when `x` is contiguous, copies first
/// otherwise.
///
/// # Errors
/// `ShapeMismatch` if the element counts differ.
pub fn reshape(x: &Tensor, shape: &[usize]) -> Result<Tensor, TensorError> {
    if numel(shape) != x.numel() {
        return Err(TensorError::ShapeMismatch {
            expected: x.numel(),
            actual: numel(shape),
        });
    }
    if !x.is_contiguous() {
        return reshape(&contiguous(x)?, shape);
    }

    let layout = Layout::new(shape, &compute_strides(shape), x.offset())?;
    let out = view_of(x, layout)?;
    record(OpKind::Reshape, &[x], &out, || {
        Box::new(ReshapeBackward {
            input_shape: x.shape().to_vec(),
        })
    });
    Ok(out)
}

#[derive(Debug)]
struct ReshapeBackward {
    input_shape: Vec<usize>,
}

impl GradFn for ReshapeBackward {
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
        Ok(vec![Some(reshape(grad_output, &self.input_shape)?)])
    }
}

/// Permute dimensions without copying.
///
/// # Example
///
/// ```
/// use ndgrad::Tensor;
/// use ndgrad::operations::permute;
///
/// let t = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]).unwrap();
/// let p = permute(&t, &[1, 0]).unwrap();
/// assert_eq!(p.shape(), &[3, 2]);
/// assert_eq!(p.get::<f64>(&[2, 1]).unwrap(), 6.0);
/// assert!(p.shares_storage_with(&t));
/// ```
pub fn permute(x: &Tensor, perm: &[usize]) -> Result<Tensor, TensorError> {
    let layout = x.layout().permute(perm)?;
    let out = view_of(x, layout)?;
    record(OpKind::Permute, &[x], &out, || {
        let mut inverse = vec![0; perm.len()];
        for (i, &p) in perm.iter().enumerate() {
            inverse[p] = i;
        }
        Box::new(PermuteBackward { inverse })
    });
    Ok(out)
}

#[derive(Debug)]
struct PermuteBackward {
    inverse: Vec<usize>,
}

impl GradFn for PermuteBackward {
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
        Ok(vec![Some(permute(grad_output, &self.inverse)?)])
    }
}

/// Transpose a matrix without copying.
///
/// # Errors
/// `RankMismatch` unless `x` is 2-D.
pub fn transpose(x: &Tensor) -> Result<Tensor, TensorError> {
    if x.ndim() != 2 {
        return Err(TensorError::RankMismatch {
            expected: 2,
            actual: x.ndim(),
        });
    }
    permute(x, &[1, 0])
}

/// Contiguous tensor with the same values. Returns `x` if it already is.
pub fn contiguous(x: &Tensor) -> Result<Tensor, TensorError> {
    if x.is_contiguous() {
        return Ok(x.clone());
    }
    let out = dispatch_one(OpKind::Copy, &[x], &OpAttrs::None)?;
    record(OpKind::Copy, &[x], &out, || Box::new(CopyBackward));
    Ok(out)
}

#[derive(Debug)]
struct CopyBackward;

impl GradFn for CopyBackward {
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
        Ok(vec![Some(grad_output.clone())])
    }
}
