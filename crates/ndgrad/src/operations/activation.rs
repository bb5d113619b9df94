//! Activation functions.

use super::elementwise::mul;
use crate::autodiff::{GradFn, SavedTensor, record};
use crate::dispatch::{OpAttrs, OpKind, dispatch, dispatch_one};
use crate::error::TensorError;
use crate::tensor::Tensor;

/// `max(x, 0)`.
pub fn relu(x: &Tensor) -> Result<Tensor, TensorError> {
    let out = dispatch_one(OpKind::Relu, &[x], &OpAttrs::None)?;
    record(OpKind::Relu, &[x], &out, || {
        Box::new(LeakyReluBackward {
            saved_input: SavedTensor::new(x),
            negative_slope: 0.0,
        })
    });
    Ok(out)
}

/// `x` for positive inputs, `negative_slope * x` otherwise.
pub fn leaky_relu(x: &Tensor, negative_slope: f64) -> Result<Tensor, TensorError> {
    let attrs = OpAttrs::LeakyRelu { negative_slope };
    let out = dispatch_one(OpKind::LeakyRelu, &[x], &attrs)?;
    record(OpKind::LeakyRelu, &[x], &out, || {
        Box::new(LeakyReluBackward {
            saved_input: SavedTensor::new(x),
            negative_slope,
        })
    });
    Ok(out)
}

/// Backward function shared by relu and leaky_relu.
#[derive(Debug)]
struct LeakyReluBackward {
    saved_input: SavedTensor,
    negative_slope: f64,
}

impl GradFn for LeakyReluBackward {
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
        let attrs = OpAttrs::LeakyRelu {
            negative_slope: self.negative_slope,
        };
        let grad = dispatch_one(
            OpKind::LeakyReluBackward,
            &[grad_output, self.saved_input.get()],
            &attrs,
        )?;
        Ok(vec![Some(grad)])
    }
}

/// Logistic sigmoid `1 / (1 + exp(-x))`.
pub fn sigmoid(x: &Tensor) -> Result<Tensor, TensorError> {
    let out = dispatch_one(OpKind::Sigmoid, &[x], &OpAttrs::None)?;
    record(OpKind::Sigmoid, &[x], &out, || {
        Box::new(SigmoidBackward {
            saved_output: SavedTensor::new(&out),
        })
    });
    Ok(out)
}

#[derive(Debug)]
struct SigmoidBackward {
    saved_output: SavedTensor,
}

impl GradFn for SigmoidBackward {
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
        let grad = dispatch_one(
            OpKind::SigmoidBackward,
            &[grad_output, self.saved_output.get()],
            &OpAttrs::None,
        )?;
        Ok(vec![Some(grad)])
    }
}

/// Hyperbolic tangent.
pub fn tanh(x: &Tensor) -> Result<Tensor, TensorError> {
    let out = dispatch_one(OpKind::Tanh, &[x], &OpAttrs::None)?;
    record(OpKind::Tanh, &[x], &out, || {
        Box::new(TanhBackward {
            saved_output: SavedTensor::new(&out),
        })
    });
    Ok(out)
}

#[derive(Debug)]
struct TanhBackward {
    saved_output: SavedTensor,
}

impl GradFn for TanhBackward {
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
        let grad = dispatch_one(
            OpKind::TanhBackward,
            &[grad_output, self.saved_output.get()],
            &OpAttrs::None,
        )?;
        Ok(vec![Some(grad)])
    }
}

/// Randomized leaky ReLU.
///
/// In training mode every negative element is scaled by its own slope drawn
/// from `U(lower, upper)`; in evaluation mode by `(lower + upper) / 2`.
///
/// # Errors
/// `InvalidArgument` unless `lower` and `upper` are finite with
/// `lower <= upper`.
///
/// # Example
///
/// ```
/// use ndgrad::Tensor;
/// use ndgrad::operations::rrelu;
///
/// let x = Tensor::from_vec(vec![-4.0, 2.0], &[2]).unwrap();
/// let y = rrelu(&x, 0.25, 0.75, false).unwrap();
/// assert_eq!(y.to_vec::<f64>().unwrap(), vec![-2.0, 2.0]);
/// ```
pub fn rrelu(x: &Tensor, lower: f64, upper: f64, training: bool) -> Result<Tensor, TensorError> {
    if !lower.is_finite() || !upper.is_finite() || lower > upper {
        return Err(TensorError::invalid_argument(format!(
            "rrelu bounds must be finite with lower <= upper, got lower={lower}, upper={upper}"
        )));
    }
    let attrs = OpAttrs::RRelu {
        lower,
        upper,
        training,
    };
    let mut outputs = dispatch(OpKind::RRelu, &[x], &attrs)?.into_iter();
    let (Some(out), Some(noise)) = (outputs.next(), outputs.next()) else {
        return Err(TensorError::invalid_argument("rrelu kernel must return output and noise"));
    };
    record(OpKind::RRelu, &[x], &out, || {
        Box::new(RReluBackward {
            saved_noise: SavedTensor::new(&noise),
        })
    });
    Ok(out)
}

/// Gradient is the sampled slope per element.
#[derive(Debug)]
struct RReluBackward {
    saved_noise: SavedTensor,
}

impl GradFn for RReluBackward {
    fn backward(&self, grad_output: &Tensor) -> Result<Vec<Option<Tensor>>, TensorError> {
        Ok(vec![Some(mul(grad_output, self.saved_noise.get())?)])
    }
}
