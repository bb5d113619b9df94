//! Integration tests for operator dispatch.

use ndgrad::dispatch::{KernelKey, OpAttrs, OpKind, dispatch, has_kernel, register_kernel, select};
use ndgrad::operations::{add, exp, relu};
use ndgrad::{DType, Device, DeviceKind, ErrorKind, Tensor, TensorError};
use rstest::rstest;

#[rstest]
#[case(OpKind::Add, 2)]
#[case(OpKind::Mul, 2)]
#[case(OpKind::Matmul, 2)]
#[case(OpKind::Exp, 1)]
#[case(OpKind::RRelu, 1)]
#[case(OpKind::Dropout, 1)]
#[case(OpKind::Sum, 1)]
fn test_float_kernels_registered(#[case] op: OpKind, #[case] arity: usize) {
    for dtype in [DType::F32, DType::F64] {
        for kind in [DeviceKind::Cpu, DeviceKind::Accelerator] {
            let key = KernelKey::new(op, &vec![dtype; arity], &vec![kind; arity]);
            assert!(has_kernel(&key), "missing {op} for {dtype} on {kind:?}");
        }
    }
}

#[test]
fn test_miss_is_unsupported_operation() {
    let x = Tensor::from_vec(vec![1i64, -2, 3], &[3]).unwrap();
    let err = relu(&x).unwrap_err();
    assert_eq!(err.kind(), ErrorKind::UnsupportedOperation);
    match err {
        TensorError::UnsupportedOperation { op, dtypes, devices } => {
            assert_eq!(op, "relu");
            assert_eq!(dtypes, vec![DType::I64]);
            assert_eq!(devices, vec![Device::Cpu]);
        }
        other => panic!("unexpected error {other:?}"),
    }
}

#[test]
fn test_no_implicit_promotion() {
    let a = Tensor::from_vec(vec![1.0f32, 2.0], &[2]).unwrap();
    let b = Tensor::from_vec(vec![1.0f64, 2.0], &[2]).unwrap();
    assert_eq!(add(&a, &b).unwrap_err().kind(), ErrorKind::UnsupportedOperation);
}

#[test]
fn test_select_is_pure() {
    let key = KernelKey::new(OpKind::Exp, &[DType::F64], &[DeviceKind::Cpu]);
    let first = select(&key, &[Device::Cpu]).unwrap();
    let second = select(&key, &[Device::Cpu]).unwrap();
    assert!(std::ptr::fn_addr_eq(first, second));

    let miss = KernelKey::new(OpKind::Exp, &[DType::I64], &[DeviceKind::Cpu]);
    assert!(select(&miss, &[Device::Cpu]).is_err());
}

#[test]
fn test_accelerator_results_stay_on_device() {
    let x = Tensor::from_vec_on(vec![0.0f32, 1.0], &[2], Device::Accelerator(0)).unwrap();
    let y = exp(&x).unwrap();
    assert_eq!(y.device(), Device::Accelerator(0));
    assert_eq!(y.to_vec::<f32>().unwrap(), vec![1.0, 1.0f32.exp()]);
}

#[test]
fn test_custom_kernel_for_new_dtype() {
    fn negate_i64(inputs: &[&Tensor], _: &OpAttrs) -> Result<Vec<Tensor>, TensorError> {
        let data: Vec<i64> = inputs[0].to_vec()?;
        let out = data.into_iter().map(|v| -v).collect();
        Ok(vec![Tensor::from_vec(out, inputs[0].shape())?])
    }

    let op = OpKind::Custom("negate_i64_integration");
    let key = KernelKey::new(op, &[DType::I64], &[DeviceKind::Cpu]);
    assert!(!has_kernel(&key));
    register_kernel(key.clone(), negate_i64);
    assert!(has_kernel(&key));

    let x = Tensor::from_vec(vec![1i64, -2], &[2]).unwrap();
    let y = dispatch(op, &[&x], &OpAttrs::None).unwrap();
    assert_eq!(y[0].to_vec::<i64>().unwrap(), vec![-1, 2]);
}
