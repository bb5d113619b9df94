//! Random tensor construction and the per-thread generator.
//!
//! Every random draw in the crate (random constructors, rrelu slopes, dropout
//! masks) goes through the thread-local generator, so [`manual_seed`] makes a
//! whole thread's computation reproducible.

use rand::distr::StandardUniform;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rand_distr::StandardNormal;
use std::cell::RefCell;

use crate::device::{self, Device};
use crate::dtype::DType;
use crate::error::TensorError;
use crate::layout::numel;
use crate::storage::Buffer;
use crate::tensor::Tensor;

thread_local! {
    static RNG: RefCell<StdRng> = RefCell::new(StdRng::from_os_rng());
}

/// Reseed the current thread's generator.
///
/// # Example
///
/// ```
/// use ndgrad::{DType, Device, Tensor};
/// use ndgrad::random::manual_seed;
///
/// manual_seed(42);
/// let a = Tensor::rand(&[2, 3], DType::F64, Device::Cpu).unwrap();
/// manual_seed(42);
/// let b = Tensor::rand(&[2, 3], DType::F64, Device::Cpu).unwrap();
/// assert_eq!(a.to_vec::<f64>().unwrap(), b.to_vec::<f64>().unwrap());
/// ```
pub fn manual_seed(seed: u64) {
    log::debug!("seeding thread generator with {seed}");
    RNG.with(|rng| *rng.borrow_mut() = StdRng::seed_from_u64(seed));
}

/// Run `f` with the current thread's generator.
pub fn with_rng<R>(f: impl FnOnce(&mut StdRng) -> R) -> R {
    RNG.with(|rng| f(&mut rng.borrow_mut()))
}

/// Sample `len` values with `sample`, stored as `dtype`.
fn sample_buffer(
    dtype: DType,
    device: Device,
    len: usize,
    mut sample: impl FnMut(&mut StdRng) -> f64,
) -> Result<Buffer, TensorError> {
    if dtype == DType::I64 {
        return Err(TensorError::UnsupportedOperation {
            op: "random".to_string(),
            dtypes: vec![dtype],
            devices: vec![device],
        });
    }
    let mut buffer = Buffer::try_full(dtype, len, 0.0).map_err(|_| {
        device::allocation_failed(device, len.saturating_mul(dtype.size_in_bytes()))
    })?;
    with_rng(|rng| match &mut buffer {
        Buffer::F64(data) => data.iter_mut().for_each(|v| *v = sample(rng)),
        Buffer::F32(data) => data.iter_mut().for_each(|v| *v = sample(rng) as f32),
        Buffer::I64(_) => {}
    });
    Ok(buffer)
}

impl Tensor {
    /// Create a tensor with uniform random values in [0, 1).
    ///
    /// # Example
    ///
    /// ```
    /// use ndgrad::{DType, Device, Tensor};
    ///
    /// let t = Tensor::rand(&[2, 3], DType::F64, Device::Cpu).unwrap();
    /// assert_eq!(t.shape(), &[2, 3]);
    /// assert!(t.to_vec::<f64>().unwrap().iter().all(|&v| (0.0..1.0).contains(&v)));
    /// ```
    pub fn rand(shape: &[usize], dtype: DType, device: Device) -> Result<Self, TensorError> {
        let buffer = sample_buffer(dtype, device, numel(shape), |rng| {
            rng.sample(StandardUniform)
        })?;
        Self::from_buffer(buffer, shape, device)
    }

    /// Create a tensor with standard normal random values.
    pub fn randn(shape: &[usize], dtype: DType, device: Device) -> Result<Self, TensorError> {
        let buffer = sample_buffer(dtype, device, numel(shape), |rng| {
            rng.sample(StandardNormal)
        })?;
        Self::from_buffer(buffer, shape, device)
    }
}
