//! C API for ndgrad
//!
//! This crate exposes the ndgrad layers and a minimal tensor surface through a
//! C-compatible interface.
//!
//! Conventions:
//! - Constructors and forward functions return an owned handle, or null on
//!   error. Every handle must be released with the matching `_release`.
//! - Failures leave a status code and message in a thread-local error slot
//!   (`ndg_last_error_code`, `ndg_last_error_message`). Every call clears the
//!   slot on entry.
//! - Panics never cross the boundary; they are reported as
//!   `NDG_INTERNAL_ERROR`.
//!
//! All extern "C" functions are inherently unsafe as they work with raw pointers
//! from foreign code. The `#[unsafe(no_mangle)]` attribute marks the entire
//! function signature as unsafe at the FFI boundary.

#![allow(clippy::not_unsafe_ptr_arg_deref)]
#![allow(non_camel_case_types)]

use libc::{c_char, c_double, c_float, c_int, size_t};
use ndgrad::nn::{
    Dropout, Dropout2d, Dropout3d, LeakyReLU, Module, RReLU, ReLU, functional,
};
use ndgrad::operations;
use ndgrad::{DType, Device, ErrorKind, Tensor, TensorError};
use std::cell::RefCell;
use std::ffi::CString;
use std::panic::{AssertUnwindSafe, catch_unwind};
use std::ptr;

// Status codes
pub type StatusCode = c_int;

pub const NDG_SUCCESS: StatusCode = 0;
pub const NDG_INVALID_ARGUMENT: StatusCode = -1;
pub const NDG_SHAPE_ERROR: StatusCode = -2;
pub const NDG_STATE_ERROR: StatusCode = -3;
pub const NDG_UNSUPPORTED_OPERATION: StatusCode = -4;
pub const NDG_GRAPH_ERROR: StatusCode = -5;
pub const NDG_ALLOCATION_ERROR: StatusCode = -6;
pub const NDG_INTERNAL_ERROR: StatusCode = -7;

// Element type codes
pub const NDG_DTYPE_F32: c_int = 0;
pub const NDG_DTYPE_F64: c_int = 1;
pub const NDG_DTYPE_I64: c_int = 2;

fn status_for(kind: ErrorKind) -> StatusCode {
    match kind {
        ErrorKind::InvalidArgument => NDG_INVALID_ARGUMENT,
        ErrorKind::Shape => NDG_SHAPE_ERROR,
        ErrorKind::State => NDG_STATE_ERROR,
        ErrorKind::UnsupportedOperation => NDG_UNSUPPORTED_OPERATION,
        ErrorKind::Graph => NDG_GRAPH_ERROR,
        ErrorKind::Allocation => NDG_ALLOCATION_ERROR,
    }
}

fn dtype_code(dtype: DType) -> c_int {
    match dtype {
        DType::F32 => NDG_DTYPE_F32,
        DType::F64 => NDG_DTYPE_F64,
        DType::I64 => NDG_DTYPE_I64,
    }
}

fn dtype_from_code(code: c_int) -> Result<DType, TensorError> {
    match code {
        NDG_DTYPE_F32 => Ok(DType::F32),
        NDG_DTYPE_F64 => Ok(DType::F64),
        NDG_DTYPE_I64 => Ok(DType::I64),
        other => Err(invalid(format!("unknown dtype code {other}"))),
    }
}

fn invalid(message: impl Into<String>) -> TensorError {
    TensorError::InvalidArgument {
        message: message.into(),
    }
}

// ============================================================================
// Error slot
// ============================================================================

struct LastError {
    code: StatusCode,
    message: CString,
}

thread_local! {
    static LAST_ERROR: RefCell<Option<LastError>> = const { RefCell::new(None) };
}

fn set_last_error(code: StatusCode, message: String) {
    log::debug!("ndgrad-capi error {code}: {message}");
    let message = CString::new(message.replace('\0', " ")).unwrap_or_default();
    LAST_ERROR.with(|slot| *slot.borrow_mut() = Some(LastError { code, message }));
}

fn clear_last_error() {
    LAST_ERROR.with(|slot| *slot.borrow_mut() = None);
}

/// Run `f`, converting errors and panics into the error slot and `on_error`.
fn guard<R>(on_error: R, f: impl FnOnce() -> Result<R, TensorError>) -> R {
    clear_last_error();
    match catch_unwind(AssertUnwindSafe(f)) {
        Ok(Ok(value)) => value,
        Ok(Err(err)) => {
            set_last_error(status_for(err.kind()), err.to_string());
            on_error
        }
        Err(_) => {
            set_last_error(NDG_INTERNAL_ERROR, "panic inside ndgrad".to_string());
            on_error
        }
    }
}

/// Status code of the last failed call on this thread, or `NDG_SUCCESS`.
#[unsafe(no_mangle)]
pub extern "C" fn ndg_last_error_code() -> StatusCode {
    LAST_ERROR.with(|slot| slot.borrow().as_ref().map_or(NDG_SUCCESS, |e| e.code))
}

/// Message of the last failed call on this thread, or null.
///
/// # Safety
/// The returned pointer is valid until the next ndgrad call on this thread.
#[unsafe(no_mangle)]
pub extern "C" fn ndg_last_error_message() -> *const c_char {
    LAST_ERROR.with(|slot| {
        slot.borrow()
            .as_ref()
            .map_or(ptr::null(), |e| e.message.as_ptr())
    })
}

// ============================================================================
// Handles
// ============================================================================

/// Opaque tensor handle
pub struct ndg_tensor {
    inner: Tensor,
}

impl ndg_tensor {
    fn into_raw(tensor: Tensor) -> *mut ndg_tensor {
        Box::into_raw(Box::new(ndg_tensor { inner: tensor }))
    }
}

/// Opaque module handle
pub struct ndg_module {
    inner: Box<dyn Module>,
    name: CString,
}

impl ndg_module {
    fn into_raw(module: Box<dyn Module>) -> *mut ndg_module {
        let name = CString::new(module.name()).unwrap_or_default();
        Box::into_raw(Box::new(ndg_module {
            inner: module,
            name,
        }))
    }
}

fn tensor_ref<'a>(tensor: *const ndg_tensor) -> Result<&'a Tensor, TensorError> {
    if tensor.is_null() {
        return Err(invalid("null tensor handle"));
    }
    Ok(unsafe { &(*tensor).inner })
}

fn module_ref<'a>(module: *const ndg_module) -> Result<&'a ndg_module, TensorError> {
    if module.is_null() {
        return Err(invalid("null module handle"));
    }
    Ok(unsafe { &*module })
}

fn shape_slice<'a>(shape: *const size_t, ndim: size_t) -> Result<&'a [usize], TensorError> {
    if ndim == 0 {
        return Ok(&[]);
    }
    if shape.is_null() {
        return Err(invalid("null shape pointer"));
    }
    Ok(unsafe { std::slice::from_raw_parts(shape, ndim) })
}

// ============================================================================
// Tensor functions
// ============================================================================

/// Seed the random generator of the calling thread.
#[unsafe(no_mangle)]
pub extern "C" fn ndg_manual_seed(seed: u64) {
    ndgrad::manual_seed(seed);
}

/// Create a CPU tensor from row-major f32 data.
///
/// # Arguments
/// * `data` - Pointer to `len` elements
/// * `shape` - Pointer to `ndim` dimensions
///
/// # Returns
/// Pointer to new tensor, or null on error
#[unsafe(no_mangle)]
pub extern "C" fn ndg_tensor_from_data_f32(
    data: *const c_float,
    len: size_t,
    shape: *const size_t,
    ndim: size_t,
) -> *mut ndg_tensor {
    guard(ptr::null_mut(), || {
        if data.is_null() && len > 0 {
            return Err(invalid("null data pointer"));
        }
        let values = if len == 0 {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(data, len) }.to_vec()
        };
        let tensor = Tensor::from_vec(values, shape_slice(shape, ndim)?)?;
        Ok(ndg_tensor::into_raw(tensor))
    })
}

/// Create a CPU tensor from row-major f64 data.
#[unsafe(no_mangle)]
pub extern "C" fn ndg_tensor_from_data_f64(
    data: *const c_double,
    len: size_t,
    shape: *const size_t,
    ndim: size_t,
) -> *mut ndg_tensor {
    guard(ptr::null_mut(), || {
        if data.is_null() && len > 0 {
            return Err(invalid("null data pointer"));
        }
        let values = if len == 0 {
            Vec::new()
        } else {
            unsafe { std::slice::from_raw_parts(data, len) }.to_vec()
        };
        let tensor = Tensor::from_vec(values, shape_slice(shape, ndim)?)?;
        Ok(ndg_tensor::into_raw(tensor))
    })
}

/// Create a zero-filled CPU tensor of the given dtype code.
#[unsafe(no_mangle)]
pub extern "C" fn ndg_tensor_zeros(
    shape: *const size_t,
    ndim: size_t,
    dtype: c_int,
) -> *mut ndg_tensor {
    guard(ptr::null_mut(), || {
        let tensor = Tensor::zeros(shape_slice(shape, ndim)?, dtype_from_code(dtype)?, Device::Cpu)?;
        Ok(ndg_tensor::into_raw(tensor))
    })
}

/// Release (free) a tensor handle.
#[unsafe(no_mangle)]
pub extern "C" fn ndg_tensor_release(tensor: *mut ndg_tensor) {
    if !tensor.is_null() {
        unsafe {
            let _ = Box::from_raw(tensor);
        }
    }
}

/// Get the number of dimensions (0 for a null handle).
#[unsafe(no_mangle)]
pub extern "C" fn ndg_tensor_ndim(tensor: *const ndg_tensor) -> size_t {
    guard(0, || Ok(tensor_ref(tensor)?.ndim()))
}

/// Get the total number of elements (0 for a null handle).
#[unsafe(no_mangle)]
pub extern "C" fn ndg_tensor_numel(tensor: *const ndg_tensor) -> size_t {
    guard(0, || Ok(tensor_ref(tensor)?.numel()))
}

/// Get the shape.
///
/// # Arguments
/// * `out` - Output array with space for `ndim` elements
#[unsafe(no_mangle)]
pub extern "C" fn ndg_tensor_shape(tensor: *const ndg_tensor, out: *mut size_t) -> StatusCode {
    guard((), || {
        let t = tensor_ref(tensor)?;
        if out.is_null() && t.ndim() > 0 {
            return Err(invalid("null output pointer"));
        }
        for (i, &dim) in t.shape().iter().enumerate() {
            unsafe { *out.add(i) = dim };
        }
        Ok(())
    });
    ndg_last_error_code()
}

/// Get the dtype code, or -1 for a null handle.
#[unsafe(no_mangle)]
pub extern "C" fn ndg_tensor_dtype(tensor: *const ndg_tensor) -> c_int {
    guard(-1, || Ok(dtype_code(tensor_ref(tensor)?.dtype())))
}

/// Copy all elements, converted to f64, into `out` (row-major).
///
/// # Arguments
/// * `len` - Capacity of `out`; must equal the element count
#[unsafe(no_mangle)]
pub extern "C" fn ndg_tensor_copy_to_f64(
    tensor: *const ndg_tensor,
    out: *mut c_double,
    len: size_t,
) -> StatusCode {
    guard((), || {
        let t = tensor_ref(tensor)?;
        if len != t.numel() {
            return Err(TensorError::ShapeMismatch {
                expected: t.numel(),
                actual: len,
            });
        }
        if out.is_null() && len > 0 {
            return Err(invalid("null output pointer"));
        }
        for (i, value) in t.to_f64_vec().into_iter().enumerate() {
            unsafe { *out.add(i) = value };
        }
        Ok(())
    });
    ndg_last_error_code()
}

/// Enable or disable gradient tracking on a leaf tensor.
#[unsafe(no_mangle)]
pub extern "C" fn ndg_tensor_set_requires_grad(
    tensor: *const ndg_tensor,
    requires_grad: bool,
) -> StatusCode {
    guard((), || tensor_ref(tensor)?.set_requires_grad(requires_grad));
    ndg_last_error_code()
}

#[unsafe(no_mangle)]
pub extern "C" fn ndg_tensor_requires_grad(tensor: *const ndg_tensor) -> bool {
    guard(false, || Ok(tensor_ref(tensor)?.requires_grad()))
}

/// Gradient accumulated in a leaf, or null if none has been computed.
///
/// A null return with `ndg_last_error_code() == NDG_SUCCESS` means "no
/// gradient yet".
#[unsafe(no_mangle)]
pub extern "C" fn ndg_tensor_grad(tensor: *const ndg_tensor) -> *mut ndg_tensor {
    guard(ptr::null_mut(), || {
        Ok(tensor_ref(tensor)?
            .grad()
            .map_or(ptr::null_mut(), ndg_tensor::into_raw))
    })
}

/// Sum of all elements as a 0-dimensional tensor.
#[unsafe(no_mangle)]
pub extern "C" fn ndg_tensor_sum(tensor: *const ndg_tensor) -> *mut ndg_tensor {
    guard(ptr::null_mut(), || {
        Ok(ndg_tensor::into_raw(operations::sum(tensor_ref(tensor)?)?))
    })
}

/// Run backward from a single-element tensor.
#[unsafe(no_mangle)]
pub extern "C" fn ndg_tensor_backward(tensor: *const ndg_tensor) -> StatusCode {
    guard((), || tensor_ref(tensor)?.backward());
    ndg_last_error_code()
}

// ============================================================================
// Module constructors
// ============================================================================

fn construct(make: impl FnOnce() -> Result<Box<dyn Module>, TensorError>) -> *mut ndg_module {
    guard(ptr::null_mut(), || Ok(ndg_module::into_raw(make()?)))
}

#[unsafe(no_mangle)]
pub extern "C" fn ndg_relu_ctor(inplace: bool) -> *mut ndg_module {
    construct(|| Ok(Box::new(ReLU::new(inplace))))
}

#[unsafe(no_mangle)]
pub extern "C" fn ndg_leaky_relu_ctor(negative_slope: c_double, inplace: bool) -> *mut ndg_module {
    construct(|| Ok(Box::new(LeakyReLU::new(negative_slope, inplace))))
}

/// Randomized leaky ReLU. Null if `lower > upper` or a bound is not finite.
#[unsafe(no_mangle)]
pub extern "C" fn ndg_rrelu_ctor(lower: c_double, upper: c_double, inplace: bool) -> *mut ndg_module {
    construct(|| Ok(Box::new(RReLU::new(lower, upper, inplace)?)))
}

#[unsafe(no_mangle)]
pub extern "C" fn ndg_dropout_ctor(p: c_double, inplace: bool) -> *mut ndg_module {
    construct(|| Ok(Box::new(Dropout::new(p, inplace)?)))
}

#[unsafe(no_mangle)]
pub extern "C" fn ndg_dropout2d_ctor(p: c_double, inplace: bool) -> *mut ndg_module {
    construct(|| Ok(Box::new(Dropout2d::new(p, inplace)?)))
}

/// Channel dropout for 5-D input. Null if `p` is outside `[0, 1]`.
#[unsafe(no_mangle)]
pub extern "C" fn ndg_dropout3d_ctor(p: c_double, inplace: bool) -> *mut ndg_module {
    construct(|| Ok(Box::new(Dropout3d::new(p, inplace)?)))
}

// ============================================================================
// Module functions
// ============================================================================

fn forward_checked(
    module: *const ndg_module,
    tensor: *const ndg_tensor,
    expected: Option<&str>,
) -> *mut ndg_tensor {
    guard(ptr::null_mut(), || {
        let module = module_ref(module)?;
        if let Some(expected) = expected.filter(|&name| module.inner.name() != name) {
            return Err(invalid(format!(
                "expected a {expected} module, got {}",
                module.inner.name()
            )));
        }
        let out = module.inner.forward(tensor_ref(tensor)?)?;
        Ok(ndg_tensor::into_raw(out))
    })
}

/// Apply any module.
#[unsafe(no_mangle)]
pub extern "C" fn ndg_module_forward(
    module: *const ndg_module,
    tensor: *const ndg_tensor,
) -> *mut ndg_tensor {
    forward_checked(module, tensor, None)
}

/// Apply an RReLU module. Fails for any other module type.
#[unsafe(no_mangle)]
pub extern "C" fn ndg_rrelu_forward(
    module: *const ndg_module,
    tensor: *const ndg_tensor,
) -> *mut ndg_tensor {
    forward_checked(module, tensor, Some("RReLU"))
}

/// Apply a Dropout3d module. Fails for any other module type.
#[unsafe(no_mangle)]
pub extern "C" fn ndg_dropout3d_forward(
    module: *const ndg_module,
    tensor: *const ndg_tensor,
) -> *mut ndg_tensor {
    forward_checked(module, tensor, Some("Dropout3d"))
}

/// New module handle with the same configuration in training or evaluation
/// mode. The original handle is unchanged.
#[unsafe(no_mangle)]
pub extern "C" fn ndg_module_train(module: *const ndg_module, training: bool) -> *mut ndg_module {
    guard(ptr::null_mut(), || {
        Ok(ndg_module::into_raw(module_ref(module)?.inner.with_training(training)))
    })
}

/// Module type name as a NUL-terminated string owned by the handle.
#[unsafe(no_mangle)]
pub extern "C" fn ndg_module_name(module: *const ndg_module) -> *const c_char {
    guard(ptr::null(), || Ok(module_ref(module)?.name.as_ptr()))
}

/// Release (free) a module handle.
#[unsafe(no_mangle)]
pub extern "C" fn ndg_module_release(module: *mut ndg_module) {
    if !module.is_null() {
        unsafe {
            let _ = Box::from_raw(module);
        }
    }
}

// ============================================================================
// Functional forms
// ============================================================================

/// Randomized leaky ReLU. With `inplace` the result is written into `input`
/// and a new handle to `input` is returned.
#[unsafe(no_mangle)]
pub extern "C" fn ndg_rrelu(
    input: *const ndg_tensor,
    lower: c_double,
    upper: c_double,
    training: bool,
    inplace: bool,
) -> *mut ndg_tensor {
    guard(ptr::null_mut(), || {
        let out = functional::rrelu(tensor_ref(input)?, lower, upper, training, inplace)?;
        Ok(ndg_tensor::into_raw(out))
    })
}

/// Channel dropout for 5-D input.
#[unsafe(no_mangle)]
pub extern "C" fn ndg_dropout3d(
    input: *const ndg_tensor,
    p: c_double,
    training: bool,
    inplace: bool,
) -> *mut ndg_tensor {
    guard(ptr::null_mut(), || {
        let out = functional::dropout3d(tensor_ref(input)?, p, training, inplace)?;
        Ok(ndg_tensor::into_raw(out))
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::ffi::CStr;

    fn from_f64(data: &[f64], shape: &[usize]) -> *mut ndg_tensor {
        let t = ndg_tensor_from_data_f64(data.as_ptr(), data.len(), shape.as_ptr(), shape.len());
        assert!(!t.is_null());
        t
    }

    fn values(tensor: *const ndg_tensor) -> Vec<f64> {
        let mut out = vec![0.0; ndg_tensor_numel(tensor)];
        assert_eq!(
            ndg_tensor_copy_to_f64(tensor, out.as_mut_ptr(), out.len()),
            NDG_SUCCESS
        );
        out
    }

    #[test]
    fn test_tensor_zeros() {
        let shape = [2usize, 3usize];
        let tensor = ndg_tensor_zeros(shape.as_ptr(), 2, NDG_DTYPE_F32);
        assert!(!tensor.is_null());
        assert_eq!(ndg_tensor_ndim(tensor), 2);
        assert_eq!(ndg_tensor_numel(tensor), 6);
        assert_eq!(ndg_tensor_dtype(tensor), NDG_DTYPE_F32);

        let mut out_shape = [0usize; 2];
        assert_eq!(ndg_tensor_shape(tensor, out_shape.as_mut_ptr()), NDG_SUCCESS);
        assert_eq!(out_shape, [2, 3]);

        ndg_tensor_release(tensor);
    }

    #[test]
    fn test_shape_mismatch_sets_error_slot() {
        let data = [1.0f64, 2.0, 3.0];
        let shape = [2usize, 2];
        let t = ndg_tensor_from_data_f64(data.as_ptr(), data.len(), shape.as_ptr(), 2);
        assert!(t.is_null());
        assert_eq!(ndg_last_error_code(), NDG_SHAPE_ERROR);
        assert!(!ndg_last_error_message().is_null());

        // Next call clears the slot.
        let ok = from_f64(&data, &[3]);
        assert_eq!(ndg_last_error_code(), NDG_SUCCESS);
        assert!(ndg_last_error_message().is_null());
        ndg_tensor_release(ok);
    }

    #[test]
    fn test_null_handles() {
        assert_eq!(ndg_tensor_ndim(ptr::null()), 0);
        assert_eq!(ndg_last_error_code(), NDG_INVALID_ARGUMENT);
        assert!(ndg_module_forward(ptr::null(), ptr::null()).is_null());
        assert_eq!(ndg_tensor_backward(ptr::null()), NDG_INVALID_ARGUMENT);
        ndg_tensor_release(ptr::null_mut());
        ndg_module_release(ptr::null_mut());
    }

    #[test]
    fn test_rrelu_ctor_validates() {
        assert!(ndg_rrelu_ctor(0.5, 0.1, false).is_null());
        assert_eq!(ndg_last_error_code(), NDG_INVALID_ARGUMENT);
        let message = unsafe { CStr::from_ptr(ndg_last_error_message()) };
        assert!(message.to_string_lossy().contains("lower"));

        let module = ndg_rrelu_ctor(1.0 / 8.0, 1.0 / 3.0, false);
        assert!(!module.is_null());
        let name = unsafe { CStr::from_ptr(ndg_module_name(module)) };
        assert_eq!(name.to_str().unwrap(), "RReLU");
        ndg_module_release(module);
    }

    #[test]
    fn test_rrelu_forward_eval() {
        let module = ndg_rrelu_ctor(0.2, 0.4, false);
        let eval = ndg_module_train(module, false);
        let x = from_f64(&[-1.0, 2.0], &[2]);

        let y = ndg_rrelu_forward(eval, x);
        assert!(!y.is_null());
        let v = values(y);
        assert!((v[0] + 0.3).abs() < 1e-12);
        assert_eq!(v[1], 2.0);

        // Wrong module type.
        let dropout = ndg_dropout3d_ctor(0.5, false);
        assert!(ndg_rrelu_forward(dropout, x).is_null());
        assert_eq!(ndg_last_error_code(), NDG_INVALID_ARGUMENT);

        for t in [x, y] {
            ndg_tensor_release(t);
        }
        for m in [module, eval, dropout] {
            ndg_module_release(m);
        }
    }

    #[test]
    fn test_dropout3d_forward_channels() {
        ndg_manual_seed(7);
        let shape = [2usize, 4, 2, 2, 2];
        let x = ndg_tensor_zeros(shape.as_ptr(), 5, NDG_DTYPE_F64);
        let ones = ndg_tensor_from_data_f64([1.0f64; 64].as_ptr(), 64, shape.as_ptr(), 5);
        assert!(!x.is_null() && !ones.is_null());

        let module = ndg_dropout3d_ctor(0.5, false);
        let y = ndg_dropout3d_forward(module, ones);
        assert!(!y.is_null());
        for channel in values(y).chunks(8) {
            assert!(channel.iter().all(|&v| v == channel[0]));
            assert!(channel[0] == 0.0 || channel[0] == 2.0);
        }

        for t in [x, ones, y] {
            ndg_tensor_release(t);
        }
        ndg_module_release(module);
    }

    #[test]
    fn test_dropout3d_rejects_probability() {
        assert!(ndg_dropout3d_ctor(1.5, false).is_null());
        assert_eq!(ndg_last_error_code(), NDG_INVALID_ARGUMENT);
        let x = from_f64(&[1.0; 8], &[1, 1, 2, 2, 2]);
        assert!(ndg_dropout3d(x, -0.5, true, false).is_null());
        assert_eq!(ndg_last_error_code(), NDG_INVALID_ARGUMENT);
        ndg_tensor_release(x);
    }

    #[test]
    fn test_functional_inplace() {
        let x = from_f64(&[-2.0, 3.0], &[2]);
        let y = ndg_rrelu(x, 0.5, 0.5, true, true);
        assert!(!y.is_null());
        assert_eq!(values(x), vec![-1.0, 3.0]);
        assert_eq!(values(y), vec![-1.0, 3.0]);
        ndg_tensor_release(y);
        ndg_tensor_release(x);
    }

    #[test]
    fn test_inplace_on_tracked_is_state_error() {
        let x = from_f64(&[-2.0, 3.0], &[2]);
        assert_eq!(ndg_tensor_set_requires_grad(x, true), NDG_SUCCESS);
        assert!(ndg_rrelu(x, 0.1, 0.2, true, true).is_null());
        assert_eq!(ndg_last_error_code(), NDG_STATE_ERROR);
        ndg_tensor_release(x);
    }

    #[test]
    fn test_backward_through_module() {
        let x = from_f64(&[-2.0, 3.0], &[2]);
        assert_eq!(ndg_tensor_set_requires_grad(x, true), NDG_SUCCESS);
        assert!(ndg_tensor_requires_grad(x));
        assert!(ndg_tensor_grad(x).is_null());
        assert_eq!(ndg_last_error_code(), NDG_SUCCESS);

        let module = ndg_leaky_relu_ctor(0.1, false);
        let y = ndg_module_forward(module, x);
        let loss = ndg_tensor_sum(y);
        assert_eq!(ndg_tensor_ndim(loss), 0);
        assert_eq!(ndg_tensor_backward(loss), NDG_SUCCESS);

        let grad = ndg_tensor_grad(x);
        assert!(!grad.is_null());
        let g = values(grad);
        assert!((g[0] - 0.1).abs() < 1e-12);
        assert_eq!(g[1], 1.0);

        // Second backward without retention fails.
        assert_eq!(ndg_tensor_backward(loss), NDG_GRAPH_ERROR);

        for t in [x, y, loss, grad] {
            ndg_tensor_release(t);
        }
        ndg_module_release(module);
    }
}
