//! Activation layers.

use super::Module;
use super::functional;
use crate::error::TensorError;
use crate::operations;
use crate::tensor::Tensor;

#[derive(Debug, Clone, Copy, Default)]
pub struct ReLU {
    pub inplace: bool,
}

impl ReLU {
    pub fn new(inplace: bool) -> Self {
        Self { inplace }
    }
}

impl Module for ReLU {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TensorError> {
        functional::relu(input, self.inplace)
    }

    fn name(&self) -> &'static str {
        "ReLU"
    }

    fn with_training(&self, _training: bool) -> Box<dyn Module> {
        Box::new(*self)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct LeakyReLU {
    pub negative_slope: f64,
    pub inplace: bool,
}

impl LeakyReLU {
    pub fn new(negative_slope: f64, inplace: bool) -> Self {
        Self {
            negative_slope,
            inplace,
        }
    }
}

impl Default for LeakyReLU {
    fn default() -> Self {
        Self::new(0.01, false)
    }
}

impl Module for LeakyReLU {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TensorError> {
        functional::leaky_relu(input, self.negative_slope, self.inplace)
    }

    fn name(&self) -> &'static str {
        "LeakyReLU"
    }

    fn with_training(&self, _training: bool) -> Box<dyn Module> {
        Box::new(*self)
    }
}

/// Randomized leaky ReLU.
///
/// In training mode each negative element gets its own slope drawn from
/// `U(lower, upper)`; in evaluation mode the slope is `(lower + upper) / 2`.
/// New layers start in training mode.
#[derive(Debug, Clone, Copy)]
pub struct RReLU {
    lower: f64,
    upper: f64,
    inplace: bool,
    training: bool,
}

impl RReLU {
    pub const DEFAULT_LOWER: f64 = 1.0 / 8.0;
    pub const DEFAULT_UPPER: f64 = 1.0 / 3.0;

    /// # Errors
    /// `InvalidArgument` unless `lower` and `upper` are finite with
    /// `lower <= upper`.
    pub fn new(lower: f64, upper: f64, inplace: bool) -> Result<Self, TensorError> {
        if !lower.is_finite() || !upper.is_finite() || lower > upper {
            return Err(TensorError::invalid_argument(format!(
                "rrelu bounds must be finite with lower <= upper, got lower={lower}, upper={upper}"
            )));
        }
        Ok(Self {
            lower,
            upper,
            inplace,
            training: true,
        })
    }

    pub fn lower(&self) -> f64 {
        self.lower
    }

    pub fn upper(&self) -> f64 {
        self.upper
    }

    pub fn inplace(&self) -> bool {
        self.inplace
    }

    pub fn is_training(&self) -> bool {
        self.training
    }

    pub fn train(self, training: bool) -> Self {
        Self { training, ..self }
    }
}

impl Default for RReLU {
    fn default() -> Self {
        Self {
            lower: Self::DEFAULT_LOWER,
            upper: Self::DEFAULT_UPPER,
            inplace: false,
            training: true,
        }
    }
}

impl Module for RReLU {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TensorError> {
        functional::rrelu(input, self.lower, self.upper, self.training, self.inplace)
    }

    fn name(&self) -> &'static str {
        "RReLU"
    }

    fn with_training(&self, training: bool) -> Box<dyn Module> {
        Box::new(self.train(training))
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Sigmoid;

impl Module for Sigmoid {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TensorError> {
        operations::sigmoid(input)
    }

    fn name(&self) -> &'static str {
        "Sigmoid"
    }

    fn with_training(&self, _training: bool) -> Box<dyn Module> {
        Box::new(*self)
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct Tanh;

impl Module for Tanh {
    fn forward(&self, input: &Tensor) -> Result<Tensor, TensorError> {
        operations::tanh(input)
    }

    fn name(&self) -> &'static str {
        "Tanh"
    }

    fn with_training(&self, _training: bool) -> Box<dyn Module> {
        Box::new(*self)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::random::manual_seed;
    use approx::assert_relative_eq;

    #[test]
    fn test_rrelu_defaults() {
        let layer = RReLU::default();
        assert_relative_eq!(layer.lower(), 0.125);
        assert_relative_eq!(layer.upper(), 1.0 / 3.0);
        assert!(layer.is_training());
        assert!(!layer.inplace());
        assert_eq!(layer.name(), "RReLU");
    }

    #[test]
    fn test_rrelu_rejects_bounds() {
        assert!(RReLU::new(0.5, 0.1, false).is_err());
        assert!(RReLU::new(f64::NAN, 0.1, false).is_err());
        assert!(RReLU::new(0.2, 0.2, false).is_ok());
    }

    #[test]
    fn test_rrelu_train_returns_copy() {
        let layer = RReLU::new(0.1, 0.3, false).unwrap();
        let eval = layer.train(false);
        assert!(layer.is_training());
        assert!(!eval.is_training());

        let x = Tensor::from_vec(vec![-10.0, 5.0], &[2]).unwrap();
        let y = eval.forward(&x).unwrap().to_vec::<f64>().unwrap();
        assert_relative_eq!(y[0], -2.0);
        assert_relative_eq!(y[1], 5.0);
    }

    #[test]
    fn test_rrelu_training_slopes_in_range() {
        manual_seed(11);
        let layer = RReLU::new(0.1, 0.3, false).unwrap();
        let x = Tensor::full(&[256], -1.0, crate::DType::F64, crate::Device::Cpu).unwrap();
        let y = layer.forward(&x).unwrap().to_vec::<f64>().unwrap();
        assert!(y.iter().all(|&v| (-0.3..=-0.1).contains(&v)));
        assert!(y.iter().any(|&v| v != y[0]));
    }

    #[test]
    fn test_leaky_relu_default_slope() {
        let x = Tensor::from_vec(vec![-100.0, 1.0], &[2]).unwrap();
        let y = LeakyReLU::default().forward(&x).unwrap();
        assert_eq!(y.to_vec::<f64>().unwrap(), vec![-1.0, 1.0]);
    }

    #[test]
    fn test_stateless_names() {
        let layers: Vec<Box<dyn Module>> = vec![
            Box::new(ReLU::default()),
            Box::new(LeakyReLU::default()),
            Box::new(Sigmoid),
            Box::new(Tanh),
        ];
        let names: Vec<_> = layers.iter().map(|l| l.with_training(false).name()).collect();
        assert_eq!(names, ["ReLU", "LeakyReLU", "Sigmoid", "Tanh"]);
    }
}
