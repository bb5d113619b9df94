//! Dropout layers. New layers start in training mode.

use super::Module;
use super::functional;
use crate::error::TensorError;
use crate::tensor::Tensor;

fn check_probability(p: f64) -> Result<(), TensorError> {
    if !(0.0..=1.0).contains(&p) {
        return Err(TensorError::invalid_argument(format!(
            "dropout probability has to be between 0 and 1, but got {p}"
        )));
    }
    Ok(())
}

macro_rules! dropout_layer {
    ($(#[$doc:meta])* $name:ident, $label:literal, $func:path) => {
        $(#[$doc])*
        #[derive(Debug, Clone, Copy)]
        pub struct $name {
            p: f64,
            inplace: bool,
            training: bool,
        }

        impl $name {
            /// # Errors
            /// `InvalidArgument` if `p` is outside `[0, 1]`.
            pub fn new(p: f64, inplace: bool) -> Result<Self, TensorError> {
                check_probability(p)?;
                Ok(Self {
                    p,
                    inplace,
                    training: true,
                })
            }

            /// Probability of an element (or channel) being zeroed.
            pub fn p(&self) -> f64 {
                self.p
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

        impl Default for $name {
            fn default() -> Self {
                Self {
                    p: 0.5,
                    inplace: false,
                    training: true,
                }
            }
        }

        impl Module for $name {
            fn forward(&self, input: &Tensor) -> Result<Tensor, TensorError> {
                $func(input, self.p, self.training, self.inplace)
            }

            fn name(&self) -> &'static str {
                $label
            }

            fn with_training(&self, training: bool) -> Box<dyn Module> {
                Box::new(self.train(training))
            }
        }
    };
}

dropout_layer!(
    /// Element-wise dropout.
    Dropout,
    "Dropout",
    functional::dropout
);

dropout_layer!(
    /// Zeroes whole 2-D channels of `(N, C, H, W)` or `(C, H, W)` input.
    Dropout2d,
    "Dropout2d",
    functional::dropout2d
);

dropout_layer!(
    /// Zeroes whole 3-D channels of `(N, C, D, H, W)` or `(C, D, H, W)` input.
    Dropout3d,
    "Dropout3d",
    functional::dropout3d
);
