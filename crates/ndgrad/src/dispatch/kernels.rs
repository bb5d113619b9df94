//! Built-in kernels.
//!
//! The accelerator is host-backed, so both device kinds share these
//! implementations; they are registered separately so that either device can
//! be given its own kernels later. Outputs are always contiguous and live on
//! the inputs' device.

use super::{KernelFn, KernelKey, KernelRegistry, OpAttrs, OpKind};
use crate::device::DeviceKind;
use crate::dtype::DType;
use crate::error::TensorError;
use crate::layout::numel;
use crate::random::with_rng;
use crate::scalar::{Element, Scalar};
use crate::tensor::Tensor;
use rand::Rng;

type KernelResult = Result<Vec<Tensor>, TensorError>;

pub(super) fn register_defaults(registry: &mut KernelRegistry) {
    register_float(registry, OpKind::Add, 2, add::<f32>, add::<f64>);
    register_float(registry, OpKind::Sub, 2, sub::<f32>, sub::<f64>);
    register_float(registry, OpKind::Mul, 2, mul::<f32>, mul::<f64>);
    register_float(registry, OpKind::Div, 2, div::<f32>, div::<f64>);
    register_float(registry, OpKind::Neg, 1, neg::<f32>, neg::<f64>);
    register_float(registry, OpKind::Exp, 1, exp::<f32>, exp::<f64>);
    register_float(registry, OpKind::Log, 1, log::<f32>, log::<f64>);
    register_float(registry, OpKind::Tanh, 1, tanh::<f32>, tanh::<f64>);
    register_float(registry, OpKind::Sigmoid, 1, sigmoid::<f32>, sigmoid::<f64>);
    register_float(registry, OpKind::Relu, 1, relu::<f32>, relu::<f64>);
    register_float(registry, OpKind::LeakyRelu, 1, leaky_relu::<f32>, leaky_relu::<f64>);
    register_float(registry, OpKind::RRelu, 1, rrelu::<f32>, rrelu::<f64>);
    register_float(registry, OpKind::Dropout, 1, dropout::<f32>, dropout::<f64>);
    register_float(registry, OpKind::AddScalar, 1, add_scalar::<f32>, add_scalar::<f64>);
    register_float(registry, OpKind::MulScalar, 1, mul_scalar::<f32>, mul_scalar::<f64>);
    register_float(registry, OpKind::Sum, 1, sum::<f32>, sum::<f64>);
    register_float(registry, OpKind::Matmul, 2, matmul::<f32>, matmul::<f64>);
    register_float(registry, OpKind::Expand, 1, expand::<f32>, expand::<f64>);
    register_float(
        registry,
        OpKind::TanhBackward,
        2,
        tanh_backward::<f32>,
        tanh_backward::<f64>,
    );
    register_float(
        registry,
        OpKind::SigmoidBackward,
        2,
        sigmoid_backward::<f32>,
        sigmoid_backward::<f64>,
    );
    register_float(
        registry,
        OpKind::LeakyReluBackward,
        2,
        leaky_relu_backward::<f32>,
        leaky_relu_backward::<f64>,
    );
    register_float(registry, OpKind::Restride, 1, restride::<f32>, restride::<f64>);

    // Copies move raw elements and work for every dtype.
    for dtype in [DType::F32, DType::F64, DType::I64] {
        for kind in [DeviceKind::Cpu, DeviceKind::Accelerator] {
            registry.register(KernelKey::new(OpKind::Copy, &[dtype], &[kind]), copy);
        }
    }
}

fn register_float(
    registry: &mut KernelRegistry,
    op: OpKind,
    arity: usize,
    f32_kernel: KernelFn,
    f64_kernel: KernelFn,
) {
    for kind in [DeviceKind::Cpu, DeviceKind::Accelerator] {
        let devices = vec![kind; arity];
        registry.register(KernelKey::new(op, &vec![DType::F32; arity], &devices), f32_kernel);
        registry.register(KernelKey::new(op, &vec![DType::F64; arity], &devices), f64_kernel);
    }
}

// ----------------------------------------------------------------------
// Helpers
// ----------------------------------------------------------------------

#[inline]
fn cast<T: Scalar>(value: f64) -> T {
    <T as Element>::from_f64(value)
}

fn input<'a>(op: OpKind, inputs: &[&'a Tensor], index: usize) -> Result<&'a Tensor, TensorError> {
    inputs.get(index).copied().ok_or_else(|| {
        TensorError::invalid_argument(format!(
            "{op} expects at least {} input(s), got {}",
            index + 1,
            inputs.len()
        ))
    })
}

fn check_same_shape(op: OpKind, a: &Tensor, b: &Tensor) -> Result<(), TensorError> {
    if a.shape() != b.shape() {
        return Err(TensorError::IncompatibleShapes {
            op: op.to_string(),
            lhs: a.shape().to_vec(),
            rhs: b.shape().to_vec(),
        });
    }
    Ok(())
}

fn scalar_attr(op: OpKind, attrs: &OpAttrs) -> Result<f64, TensorError> {
    match attrs {
        OpAttrs::Scalar(value) => Ok(*value),
        other => Err(TensorError::invalid_argument(format!(
            "{op} expects a scalar attribute, got {other:?}"
        ))),
    }
}

fn output<T: Scalar>(data: Vec<T>, like: &Tensor) -> Result<Tensor, TensorError> {
    Tensor::from_vec_on(data, like.shape(), like.device())
}

fn map_unary<T: Scalar>(
    op: OpKind,
    inputs: &[&Tensor],
    f: impl Fn(T) -> T,
) -> KernelResult {
    let x = input(op, inputs, 0)?;
    let data: Vec<T> = x.to_vec::<T>()?.into_iter().map(f).collect();
    Ok(vec![output(data, x)?])
}

fn zip_binary<T: Scalar>(
    op: OpKind,
    inputs: &[&Tensor],
    f: impl Fn(T, T) -> T,
) -> KernelResult {
    let a = input(op, inputs, 0)?;
    let b = input(op, inputs, 1)?;
    check_same_shape(op, a, b)?;
    let data: Vec<T> = a
        .to_vec::<T>()?
        .into_iter()
        .zip(b.to_vec::<T>()?)
        .map(|(x, y)| f(x, y))
        .collect();
    Ok(vec![output(data, a)?])
}

// ----------------------------------------------------------------------
// Element-wise
// ----------------------------------------------------------------------

fn add<T: Scalar>(inputs: &[&Tensor], _attrs: &OpAttrs) -> KernelResult {
    zip_binary::<T>(OpKind::Add, inputs, |a, b| a + b)
}

fn sub<T: Scalar>(inputs: &[&Tensor], _attrs: &OpAttrs) -> KernelResult {
    zip_binary::<T>(OpKind::Sub, inputs, |a, b| a - b)
}

fn mul<T: Scalar>(inputs: &[&Tensor], _attrs: &OpAttrs) -> KernelResult {
    zip_binary::<T>(OpKind::Mul, inputs, |a, b| a * b)
}

fn div<T: Scalar>(inputs: &[&Tensor], _attrs: &OpAttrs) -> KernelResult {
    zip_binary::<T>(OpKind::Div, inputs, |a, b| a / b)
}

fn neg<T: Scalar>(inputs: &[&Tensor], _attrs: &OpAttrs) -> KernelResult {
    map_unary::<T>(OpKind::Neg, inputs, |x| -x)
}

fn exp<T: Scalar>(inputs: &[&Tensor], _attrs: &OpAttrs) -> KernelResult {
    map_unary::<T>(OpKind::Exp, inputs, |x| x.exp())
}

fn log<T: Scalar>(inputs: &[&Tensor], _attrs: &OpAttrs) -> KernelResult {
    map_unary::<T>(OpKind::Log, inputs, |x| x.ln())
}

fn tanh<T: Scalar>(inputs: &[&Tensor], _attrs: &OpAttrs) -> KernelResult {
    map_unary::<T>(OpKind::Tanh, inputs, |x| x.tanh())
}

fn sigmoid<T: Scalar>(inputs: &[&Tensor], _attrs: &OpAttrs) -> KernelResult {
    map_unary::<T>(OpKind::Sigmoid, inputs, |x| T::one() / (T::one() + (-x).exp()))
}

fn relu<T: Scalar>(inputs: &[&Tensor], _attrs: &OpAttrs) -> KernelResult {
    map_unary::<T>(OpKind::Relu, inputs, |x| if x > T::zero() { x } else { T::zero() })
}

fn leaky_relu<T: Scalar>(inputs: &[&Tensor], attrs: &OpAttrs) -> KernelResult {
    let OpAttrs::LeakyRelu { negative_slope } = attrs else {
        return Err(TensorError::invalid_argument("leaky_relu expects a negative slope"));
    };
    let slope: T = cast(*negative_slope);
    map_unary::<T>(OpKind::LeakyRelu, inputs, |x| if x > T::zero() { x } else { x * slope })
}

fn add_scalar<T: Scalar>(inputs: &[&Tensor], attrs: &OpAttrs) -> KernelResult {
    let value: T = cast(scalar_attr(OpKind::AddScalar, attrs)?);
    map_unary::<T>(OpKind::AddScalar, inputs, |x| x + value)
}

fn mul_scalar<T: Scalar>(inputs: &[&Tensor], attrs: &OpAttrs) -> KernelResult {
    let value: T = cast(scalar_attr(OpKind::MulScalar, attrs)?);
    map_unary::<T>(OpKind::MulScalar, inputs, |x| x * value)
}

// ----------------------------------------------------------------------
// Stochastic
// ----------------------------------------------------------------------

/// Returns `[output, noise]` where `noise` holds the slope applied to each
/// element (1 for non-negative inputs).
fn rrelu<T: Scalar>(inputs: &[&Tensor], attrs: &OpAttrs) -> KernelResult {
    let OpAttrs::RRelu {
        lower,
        upper,
        training,
    } = *attrs
    else {
        return Err(TensorError::invalid_argument("rrelu expects lower/upper bounds"));
    };
    let x = input(OpKind::RRelu, inputs, 0)?;
    let data: Vec<T> = x.to_vec()?;

    let noise: Vec<T> = if training {
        with_rng(|rng| {
            data.iter()
                .map(|&v| {
                    if v >= T::zero() {
                        T::one()
                    } else {
                        cast(lower + (upper - lower) * rng.random::<f64>())
                    }
                })
                .collect()
        })
    } else {
        let slope: T = cast((lower + upper) / 2.0);
        data.iter()
            .map(|&v| if v >= T::zero() { T::one() } else { slope })
            .collect()
    };

    let out: Vec<T> = data.iter().zip(noise.iter()).map(|(&v, &a)| v * a).collect();
    Ok(vec![output(out, x)?, output(noise, x)?])
}

/// Returns `[output, mask]`. The mask is already scaled by `1 / (1 - p)`.
fn dropout<T: Scalar>(inputs: &[&Tensor], attrs: &OpAttrs) -> KernelResult {
    let OpAttrs::Dropout { p, feature_dims } = *attrs else {
        return Err(TensorError::invalid_argument("dropout expects a probability"));
    };
    if !(0.0..=1.0).contains(&p) {
        return Err(TensorError::invalid_argument(format!(
            "dropout probability has to be between 0 and 1, but got {p}"
        )));
    }
    let x = input(OpKind::Dropout, inputs, 0)?;
    let data: Vec<T> = x.to_vec()?;

    let group_size = if feature_dims == 0 {
        1
    } else {
        numel(&x.shape()[feature_dims.min(x.ndim())..])
    };
    let groups = if group_size == 0 { 0 } else { data.len() / group_size };
    let scale: T = if p < 1.0 { cast(1.0 / (1.0 - p)) } else { T::zero() };

    let keep: Vec<T> = with_rng(|rng| {
        (0..groups)
            .map(|_| {
                if rng.random_bool(1.0 - p) {
                    scale
                } else {
                    T::zero()
                }
            })
            .collect()
    });
    let mask: Vec<T> = (0..data.len()).map(|i| keep[i / group_size]).collect();
    let out: Vec<T> = data.iter().zip(mask.iter()).map(|(&v, &m)| v * m).collect();
    Ok(vec![output(out, x)?, output(mask, x)?])
}

// ----------------------------------------------------------------------
// Reductions and linear algebra
// ----------------------------------------------------------------------

fn sum<T: Scalar>(inputs: &[&Tensor], _attrs: &OpAttrs) -> KernelResult {
    let x = input(OpKind::Sum, inputs, 0)?;
    let total = x.to_vec::<T>()?.into_iter().fold(T::zero(), |acc, v| acc + v);
    Ok(vec![Tensor::from_vec_on(vec![total], &[], x.device())?])
}

fn matmul<T: Scalar>(inputs: &[&Tensor], _attrs: &OpAttrs) -> KernelResult {
    let a = input(OpKind::Matmul, inputs, 0)?;
    let b = input(OpKind::Matmul, inputs, 1)?;
    for t in [a, b] {
        if t.ndim() != 2 {
            return Err(TensorError::RankMismatch {
                expected: 2,
                actual: t.ndim(),
            });
        }
    }
    let (m, k) = (a.shape()[0], a.shape()[1]);
    let n = b.shape()[1];
    if b.shape()[0] != k {
        return Err(TensorError::IncompatibleShapes {
            op: OpKind::Matmul.to_string(),
            lhs: a.shape().to_vec(),
            rhs: b.shape().to_vec(),
        });
    }

    let lhs: Vec<T> = a.to_vec()?;
    let rhs: Vec<T> = b.to_vec()?;
    let mut out = vec![T::zero(); m * n];
    for i in 0..m {
        for p in 0..k {
            let aip = lhs[i * k + p];
            for j in 0..n {
                out[i * n + j] = out[i * n + j] + aip * rhs[p * n + j];
            }
        }
    }
    Ok(vec![Tensor::from_vec_on(out, &[m, n], a.device())?])
}

// ----------------------------------------------------------------------
// Data movement
// ----------------------------------------------------------------------

fn copy(inputs: &[&Tensor], _attrs: &OpAttrs) -> KernelResult {
    let x = input(OpKind::Copy, inputs, 0)?;
    Ok(vec![Tensor::from_buffer(x.to_buffer(), x.shape(), x.device())?])
}

/// Broadcast a single-element tensor to `shape`.
fn expand<T: Scalar>(inputs: &[&Tensor], attrs: &OpAttrs) -> KernelResult {
    let OpAttrs::Expand { shape } = attrs else {
        return Err(TensorError::invalid_argument("expand expects a target shape"));
    };
    let x = input(OpKind::Expand, inputs, 0)?;
    if x.numel() != 1 {
        return Err(TensorError::ShapeMismatch {
            expected: 1,
            actual: x.numel(),
        });
    }
    let value: T = x.item()?;
    Ok(vec![Tensor::from_vec_on(vec![value; numel(shape)], shape, x.device())?])
}

/// Sum a gradient of a strided view back into the layout of its source.
fn restride<T: Scalar>(inputs: &[&Tensor], attrs: &OpAttrs) -> KernelResult {
    let OpAttrs::Restride {
        source,
        view,
        storage_len,
    } = attrs
    else {
        return Err(TensorError::invalid_argument("restride expects source and view layouts"));
    };
    let grad = input(OpKind::Restride, inputs, 0)?;
    if grad.shape() != view.shape() {
        return Err(TensorError::IncompatibleShapes {
            op: OpKind::Restride.to_string(),
            lhs: view.shape().to_vec(),
            rhs: grad.shape().to_vec(),
        });
    }
    let (Some(view_len), Some(source_len)) = (view.required_len(), source.required_len()) else {
        return Err(TensorError::ViewOutOfBounds {
            required: usize::MAX,
            capacity: *storage_len,
        });
    };
    let capacity = (*storage_len).max(view_len).max(source_len);
    let mut acc = vec![T::zero(); capacity];
    for (g, pos) in grad.to_vec::<T>()?.into_iter().zip(view.positions()) {
        acc[pos] = acc[pos] + g;
    }
    let out: Vec<T> = source.positions().into_iter().map(|pos| acc[pos]).collect();
    Ok(vec![Tensor::from_vec_on(out, source.shape(), grad.device())?])
}

// ----------------------------------------------------------------------
// Activation derivatives
// ----------------------------------------------------------------------

/// `grad * (1 - y^2)` from the saved tanh output `y`.
fn tanh_backward<T: Scalar>(inputs: &[&Tensor], _attrs: &OpAttrs) -> KernelResult {
    zip_binary::<T>(OpKind::TanhBackward, inputs, |g, y| g * (T::one() - y * y))
}

/// `grad * y * (1 - y)` from the saved sigmoid output `y`.
fn sigmoid_backward<T: Scalar>(inputs: &[&Tensor], _attrs: &OpAttrs) -> KernelResult {
    zip_binary::<T>(OpKind::SigmoidBackward, inputs, |g, y| g * y * (T::one() - y))
}

fn leaky_relu_backward<T: Scalar>(inputs: &[&Tensor], attrs: &OpAttrs) -> KernelResult {
    let OpAttrs::LeakyRelu { negative_slope } = attrs else {
        return Err(TensorError::invalid_argument("leaky_relu_backward expects a negative slope"));
    };
    let slope: T = cast(*negative_slope);
    zip_binary::<T>(OpKind::LeakyReluBackward, inputs, |g, x| {
        if x > T::zero() { g } else { g * slope }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::layout::Layout;
    use approx::assert_relative_eq;

    fn t(data: Vec<f64>, shape: &[usize]) -> Tensor {
        Tensor::from_vec(data, shape).unwrap()
    }

    #[test]
    fn test_add_shape_mismatch() {
        let a = t(vec![1.0, 2.0], &[2]);
        let b = t(vec![1.0, 2.0, 3.0], &[3]);
        assert!(matches!(
            add::<f64>(&[&a, &b], &OpAttrs::None),
            Err(TensorError::IncompatibleShapes { .. })
        ));
    }

    #[test]
    fn test_strided_inputs_read_logically() {
        let a = t(vec![1.0, 2.0, 3.0, 4.0], &[2, 2]);
        let at = a.view(&[2, 2], &[1, 2]).unwrap();
        let out = &add::<f64>(&[&at, &a], &OpAttrs::None).unwrap()[0];
        assert_eq!(out.to_vec::<f64>().unwrap(), vec![2.0, 5.0, 5.0, 8.0]);
    }

    #[test]
    fn test_matmul() {
        let a = t(vec![1.0, 2.0, 3.0, 4.0, 5.0, 6.0], &[2, 3]);
        let b = t(vec![1.0, 0.0, 0.0, 1.0, 1.0, 1.0], &[3, 2]);
        let out = &matmul::<f64>(&[&a, &b], &OpAttrs::None).unwrap()[0];
        assert_eq!(out.shape(), &[2, 2]);
        assert_eq!(out.to_vec::<f64>().unwrap(), vec![4.0, 5.0, 10.0, 11.0]);
    }

    #[test]
    fn test_sigmoid_values() {
        let x = t(vec![0.0, 2.0], &[2]);
        let y = sigmoid::<f64>(&[&x], &OpAttrs::None).unwrap()[0]
            .to_vec::<f64>()
            .unwrap();
        assert_relative_eq!(y[0], 0.5);
        assert_relative_eq!(y[1], 1.0 / (1.0 + (-2.0f64).exp()), epsilon = 1e-12);
    }

    #[test]
    fn test_rrelu_eval_uses_mean_slope() {
        let x = t(vec![-2.0, 3.0], &[2]);
        let attrs = OpAttrs::RRelu {
            lower: 0.1,
            upper: 0.3,
            training: false,
        };
        let out = rrelu::<f64>(&[&x], &attrs).unwrap();
        let y = out[0].to_vec::<f64>().unwrap();
        assert_relative_eq!(y[0], -0.4, epsilon = 1e-12);
        assert_relative_eq!(y[1], 3.0);
    }

    #[test]
    fn test_dropout_feature_mask_shared() {
        let x = Tensor::ones(&[4, 3, 5], DType::F64, crate::Device::Cpu).unwrap();
        let attrs = OpAttrs::Dropout {
            p: 0.5,
            feature_dims: 1,
        };
        let out = dropout::<f64>(&[&x], &attrs).unwrap();
        let mask = out[1].to_vec::<f64>().unwrap();
        for channel in mask.chunks(15) {
            assert!(channel.iter().all(|&m| m == channel[0]));
            assert!(channel[0] == 0.0 || channel[0] == 2.0);
        }
    }

    #[test]
    fn test_restride_accumulates_overlaps() {
        // A stride-0 view reads element 1 three times.
        let source = Layout::contiguous(&[3]);
        let view = Layout::new(&[3], &[0], 1).unwrap();
        let grad = t(vec![1.0, 2.0, 3.0], &[3]);
        let attrs = OpAttrs::Restride {
            source,
            view,
            storage_len: 3,
        };
        let out = &restride::<f64>(&[&grad], &attrs).unwrap()[0];
        assert_eq!(out.to_vec::<f64>().unwrap(), vec![0.0, 6.0, 0.0]);
    }

    #[test]
    fn test_copy_integers() {
        let x = Tensor::from_vec(vec![1i64, 2, 3, 4], &[2, 2]).unwrap();
        let xt = x.view(&[2, 2], &[1, 2]).unwrap();
        let out = &copy(&[&xt], &OpAttrs::None).unwrap()[0];
        assert!(out.is_contiguous());
        assert_eq!(out.to_vec::<i64>().unwrap(), vec![1, 3, 2, 4]);
    }
}
