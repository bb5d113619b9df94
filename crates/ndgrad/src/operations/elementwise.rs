//! Element-wise arithmetic.
//!
//! Binary operations require operands of identical shape and dtype; there
//! is no broadcasting and no implicit promotion.

use crate::autodiff::{GradFn, SavedTensor, record};
use crate::dispatch::{OpAttrs, OpKind, dispatch_one};
use crate::error::TensorError;
use crate::tensor::Tensor;

/// Element-wise sum.
///
/// # Example
///
/// ```
/// use ndgrad::Tensor;
/// use ndgrad::operations::add;
///
/// let a = Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
/// let b = Tensor::from_vec(vec![10.0, 20.0], &[2]).unwrap();
/// assert_eq!(add(&a, &b).unwrap().to_vec::<f64>().unwrap(), vec![11.0, 22.0]);
/// ```
pub fn add(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    let out = dispatch_one(OpKind::Add, &[a, b], &OpAttrs::None)?;
    record(OpKind::Add, &[a, b], &out, || Box::new(AddBackward));
    Ok(out)
}

#[derive(Debug)]
struct AddBackward;

impl GradFn for AddBackward {
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
        Ok(vec![Some(grad_output.clone()), Some(grad_output.clone())])
    }
}

/// Element-wise difference.
pub fn sub(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    let out = dispatch_one(OpKind::Sub, &[a, b], &OpAttrs::None)?;
    record(OpKind::Sub, &[a, b], &out, || {
        Box::new(SubBackward {
            needs_rhs: b.requires_grad(),
        })
    });
    Ok(out)
}

#[derive(Debug)]
struct SubBackward {
    needs_rhs: bool,
}

impl GradFn for SubBackward {
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
        let grad_rhs = if self.needs_rhs {
            Some(neg(grad_output)?)
        } else {
            None
        };
        Ok(vec![Some(grad_output.clone()), grad_rhs])
    }
}

/// Element-wise product.
pub fn mul(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    let out = dispatch_one(OpKind::Mul, &[a, b], &OpAttrs::None)?;
    record(OpKind::Mul, &[a, b], &out, || {
        Box::new(MulBackward {
            saved_lhs: SavedTensor::new(a),
            saved_rhs: SavedTensor::new(b),
            needs: [a.requires_grad(), b.requires_grad()],
        })
    });
    Ok(out)
}

/// Backward function for element-wise product.
#[derive(Debug)]
struct MulBackward {
    saved_lhs: SavedTensor,
    saved_rhs: SavedTensor,
    needs: [bool; 2],
}

impl GradFn for MulBackward {
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
        let grad_lhs = if self.needs[0] {
            Some(mul(grad_output, self.saved_rhs.get())?)
        } else {
            None
        };
        let grad_rhs = if self.needs[1] {
            Some(mul(grad_output, self.saved_lhs.get())?)
        } else {
            None
        };
        Ok(vec![grad_lhs, grad_rhs])
    }
}

/// Element-wise quotient.
pub fn div(a: &Tensor, b: &Tensor) -> Result<Tensor, TensorError> {
    let out = dispatch_one(OpKind::Div, &[a, b], &OpAttrs::None)?;
    record(OpKind::Div, &[a, b], &out, || {
        Box::new(DivBackward {
            saved_lhs: SavedTensor::new(a),
            saved_rhs: SavedTensor::new(b),
            needs: [a.requires_grad(), b.requires_grad()],
        })
    });
    Ok(out)
}

#[derive(Debug)]
struct DivBackward {
    saved_lhs: SavedTensor,
    saved_rhs: SavedTensor,
    needs: [bool; 2],
}

impl GradFn for DivBackward {
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
        let (a, b) = (self.saved_lhs.get(), self.saved_rhs.get());
        let grad_lhs = if self.needs[0] {
            Some(div(grad_output, b)?)
        } else {
            None
        };
        // d(a/b)/db = -a / b^2
        let grad_rhs = if self.needs[1] {
            let quotient = div(&div(a, b)?, b)?;
            Some(neg(&mul(grad_output, &quotient)?)?)
        } else {
            None
        };
        Ok(vec![grad_lhs, grad_rhs])
    }
}

/// Element-wise negation.
pub fn neg(x: &Tensor) -> Result<Tensor, TensorError> {
    let out = dispatch_one(OpKind::Neg, &[x], &OpAttrs::None)?;
    record(OpKind::Neg, &[x], &out, || Box::new(NegBackward));
    Ok(out)
}

#[derive(Debug)]
struct NegBackward;

impl GradFn for NegBackward {
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
        Ok(vec![Some(neg(grad_output)?)])
    }
}

/// Element-wise natural exponential.
pub fn exp(x: &Tensor) -> Result<Tensor, TensorError> {
    let out = dispatch_one(OpKind::Exp, &[x], &OpAttrs::None)?;
    record(OpKind::Exp, &[x], &out, || {
        Box::new(ExpBackward {
            saved_output: SavedTensor::new(&out),
        })
    });
    Ok(out)
}

#[derive(Debug)]
struct ExpBackward {
    saved_output: SavedTensor,
}

impl GradFn for ExpBackward {
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
        Ok(vec![Some(mul(grad_output, self.saved_output.get())?)])
    }
}

/// Element-wise natural logarithm.
pub fn log(x: &Tensor) -> Result<Tensor, TensorError> {
    let out = dispatch_one(OpKind::Log, &[x], &OpAttrs::None)?;
    record(OpKind::Log, &[x], &out, || {
        Box::new(LogBackward {
            saved_input: SavedTensor::new(x),
        })
    });
    Ok(out)
}

#[derive(Debug)]
struct LogBackward {
    saved_input: SavedTensor,
}

impl GradFn for LogBackward {
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
        Ok(vec![Some(div(grad_output, self.saved_input.get())?)])
    }
}

/// Add a constant to every element.
pub fn add_scalar(x: &Tensor, value: f64) -> Result<Tensor, TensorError> {
    let out = dispatch_one(OpKind::AddScalar, &[x], &OpAttrs::Scalar(value))?;
    record(OpKind::AddScalar, &[x], &out, || Box::new(AddScalarBackward));
    Ok(out)
}

#[derive(Debug)]
struct AddScalarBackward;

impl GradFn for AddScalarBackward {
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
        Ok(vec![Some(grad_output.clone())])
    }
}

/// Multiply every element by a constant.
pub fn mul_scalar(x: &Tensor, value: f64) -> Result<Tensor, TensorError> {
    let out = dispatch_one(OpKind::MulScalar, &[x], &OpAttrs::Scalar(value))?;
    record(OpKind::MulScalar, &[x], &out, || {
        Box::new(MulScalarBackward { value })
    });
    Ok(out)
}

#[derive(Debug)]
struct MulScalarBackward {
    value: f64,
}

impl GradFn for MulScalarBackward {
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
        Ok(vec![Some(mul_scalar(grad_output, self.value)?)])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::autodiff::backward;
    use crate::operations::sum;
    use approx::assert_relative_eq;

    fn leaf(data: Vec<f64>) -> Tensor {
        let n = data.len();
        Tensor::from_vec(data, &[n])
            .unwrap()
            .requires_grad_(true)
            .unwrap()
    }

    #[test]
    fn test_untracked_inputs_create_no_node() {
        let a = Tensor::from_vec(vec![1.0, 2.0], &[2]).unwrap();
        let c = mul(&a, &a).unwrap();
        assert!(c.is_leaf());
        assert!(!c.requires_grad());
    }

    #[test]
    fn test_mul_saves_and_pins() {
        let a = leaf(vec![1.0, 2.0]);
        let b = Tensor::from_vec(vec![3.0, 4.0], &[2]).unwrap();
        let c = mul(&a, &b).unwrap();
        assert!(!c.is_leaf());
        assert_eq!(b.storage().pin_count(), 1);
        assert!(matches!(
            b.fill_(0.0),
            Err(TensorError::StoragePinned { .. })
        ));

        backward(&sum(&c).unwrap(), None).unwrap();
        // Executed nodes drop their saved tensors.
        assert_eq!(b.storage().pin_count(), 0);
        assert_eq!(a.grad().unwrap().to_vec::<f64>().unwrap(), vec![3.0, 4.0]);
    }

    #[test]
    fn test_div_gradients() {
        let a = leaf(vec![1.0, 6.0]);
        let b = leaf(vec![2.0, 3.0]);
        backward(&sum(&div(&a, &b).unwrap()).unwrap(), None).unwrap();

        let ga = a.grad().unwrap().to_vec::<f64>().unwrap();
        let gb = b.grad().unwrap().to_vec::<f64>().unwrap();
        assert_relative_eq!(ga[0], 0.5);
        assert_relative_eq!(ga[1], 1.0 / 3.0);
        assert_relative_eq!(gb[0], -0.25);
        assert_relative_eq!(gb[1], -6.0 / 9.0);
    }

    #[test]
    fn test_sub_and_scalars() {
        let a = leaf(vec![1.0, 2.0]);
        let y = sub(&mul_scalar(&a, 3.0).unwrap(), &add_scalar(&a, 1.0).unwrap()).unwrap();
        assert_eq!(y.to_vec::<f64>().unwrap(), vec![1.0, 3.0]);
        backward(&sum(&y).unwrap(), None).unwrap();
        assert_eq!(a.grad().unwrap().to_vec::<f64>().unwrap(), vec![2.0, 2.0]);
    }

    #[test]
    fn test_exp_log_roundtrip_gradient() {
        let a = leaf(vec![0.5, 1.5]);
        let y = log(&exp(&a).unwrap()).unwrap();
        backward(&sum(&y).unwrap(), None).unwrap();
        for g in a.grad().unwrap().to_vec::<f64>().unwrap() {
            assert_relative_eq!(g, 1.0, epsilon = 1e-12);
        }
    }
}
