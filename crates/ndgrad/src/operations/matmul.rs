//! Matrix multiplication.

use super::shape::transpose;
use crate::autodiff::{GradFn, SavedTensor, record};
use crate::dispatch::{OpAttrs, OpKind, dispatch_one};
use crate::error::TensorError;
use crate::tensor::Tensor;

/// Product of two matrices: `C[i,k] = sum_j A[i,j] * B[j,k]`.
///
/// # Errors
/// `RankMismatch` for non-2-D inputs, `IncompatibleShapes` if the inner
/// dimensions differ.
///
/// # Example
///
/// ```
/// use ndgrad::Tensor;
/// use ndgrad::operations::matmul;
///
/// let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]).unwrap();
/// let b = Tensor::from_vec(vec![5.0, 6.0], &[2, 1]).unwrap();
/// let c = matmul(&a, &b).unwrap();
/// assert_eq!(c.shape(), &[2, 1]);
/// assert_eq!(c.to_vec::<f64>().unwrap(), vec![17.0, 39.0]);
/// ```
pub fn matmul(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    let out = dispatch_one(OpKind::Matmul, &[a, b], &OpAttrs::None)?;
    record(OpKind::Matmul, &[a, b], &out, || {
        Box::new(MatmulBackward {
            saved_a: SavedTensor::new(a),
            saved_b: SavedTensor::new(b),
            needs: [a.requires_grad(), b.requires_grad()],
        })
    });
    Ok(out)
}

/// Backward function for matrix multiplication.
///
/// `dA = dC @ B^T`, `dB = A^T @ dC`.
#[derive(Debug)]
struct MatmulBackward {
    saved_a: SavedTensor,
    saved_b: SavedTensor,
    needs: [bool; 2],
}

impl GradFn for MatmulBackward {
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
        let grad_a = if self.needs[0] {
            Some(matmul(grad_output, &transpose(self.saved_b.get())?)?)
        } else {
            None
        };
        let grad_b = if self.needs[1] {
            Some(matmul(&transpose(self.saved_a.get())?, grad_output)?)
        } else {
            None
        };
        Ok(vec![grad_a, grad_b])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::backward;
    use crate::operations::sum;

    #[test]
    fn test_matmul_gradients() {
        let a = Tensor::from_vec(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3])
            .unwrap()
            .requires_grad_(true)
            .unwrap();
        let b = Tensor::from_vec(vec![1.0, 2.0, 3.0], &[3, 1])
            .unwrap()
            .requires_grad_(true)
            .unwrap();
        let c = matmul(&a, &b).unwrap();
        backward(&sum(&c).unwrap(), None).unwrap();

        // dA[i,j] = B[j], dB[j] = sum_i A[i,j]
        assert_eq!(
            a.grad().unwrap().to_vec::<f64>().unwrap(),
            vec![1.0, 2.0, 3.0, 1.0, 2.0, 3.0]
        );
        assert_eq!(b.grad().unwrap().to_vec::<f64>().unwrap(), vec![5.0, 7.0, 9.0]);
    }

    #[test]
    fn test_matmul_inner_mismatch() {
        let a = Tensor::from_vec(vec![1.0; 6], &[2, 3]).unwrap();
        let b = Tensor::from_vec(vec![1.0; 4], &[2, 2]).unwrap();
        assert!(matches!(
            matmul(&a, &b),
            Err(TensorError::IncompatibleShapes { .. })
        ));
    }
}
