//! Loss gradient kernels and the name-indexed registry that resolves them.
//!
//! Each loss is a *gradient* kernel: it writes `dL/dy_pred` directly rather
//! than a scalar, since that is the only quantity backpropagation needs
//! (scalar loss values, when wanted for reporting, live in the metrics
//! registry — see `crate::metrics`).

/// Numerical floor used by `mean_absolute_percentage_error` to avoid
/// dividing by a target that is exactly (or nearly) zero.
const MAPE_EPSILON: f32 = 1e-7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Loss {
    MeanSquaredError,
    MeanAbsoluteError,
    MeanAbsolutePercentageError,
    /// Binary cross-entropy, fused with a sigmoid output layer.
    BinaryCrossEntropy,
    /// Categorical cross-entropy, fused with a softmax output layer.
    CategoricalCrossEntropy,
}

impl Loss {
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "mean_squared_error" | "mse" => Some(Loss::MeanSquaredError),
            "mean_absolute_error" | "mae" => Some(Loss::MeanAbsoluteError),
            "mean_absolute_percentage_error" | "mape" => Some(Loss::MeanAbsolutePercentageError),
            "binary_crossentropy" => Some(Loss::BinaryCrossEntropy),
            "categorical_crossentropy" => Some(Loss::CategoricalCrossEntropy),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Loss::MeanSquaredError => "mean_squared_error",
            Loss::MeanAbsoluteError => "mean_absolute_error",
            Loss::MeanAbsolutePercentageError => "mean_absolute_percentage_error",
            Loss::BinaryCrossEntropy => "binary_crossentropy",
            Loss::CategoricalCrossEntropy => "categorical_crossentropy",
        }
    }

    /// The output activation this loss is fused with, if any. When
    /// `Network::set_loss` sees this activation on the last layer it
    /// rewrites that layer's activation-derivative to a no-op, because the
    /// gradient written here already encodes the composed derivative.
    pub fn fused_activation(&self) -> Option<&'static str> {
        match self {
            Loss::BinaryCrossEntropy => Some("sigmoid"),
            Loss::CategoricalCrossEntropy => Some("softmax"),
            _ => None,
        }
    }

    /// Writes `dL/dy_pred` into `out`.
    pub fn gradient(&self, y_pred: &[f32], y_true: &[f32], out: &mut [f32]) {
        debug_assert_eq!(y_pred.len(), y_true.len());
        debug_assert_eq!(y_pred.len(), out.len());
        let n = y_pred.len() as f32;
        match self {
            Loss::MeanSquaredError => {
                for ((o, &p), &t) in out.iter_mut().zip(y_pred).zip(y_true) {
                    *o = 2.0 * (p - t) / n;
                }
            }
            Loss::MeanAbsoluteError => {
                for ((o, &p), &t) in out.iter_mut().zip(y_pred).zip(y_true) {
                    *o = (p - t).signum() / n;
                }
            }
            Loss::MeanAbsolutePercentageError => {
                for ((o, &p), &t) in out.iter_mut().zip(y_pred).zip(y_true) {
                    let denom = t.abs().max(MAPE_EPSILON) * n;
                    *o = 100.0 * (p - t).signum() / denom;
                }
            }
            Loss::BinaryCrossEntropy => {
                // Fused with sigmoid: (y_pred - y_true) / n.
                for ((o, &p), &t) in out.iter_mut().zip(y_pred).zip(y_true) {
                    *o = (p - t) / n;
                }
            }
            Loss::CategoricalCrossEntropy => {
                // Fused with softmax: y_pred - y_true, no averaging factor.
                for ((o, &p), &t) in out.iter_mut().zip(y_pred).zip(y_true) {
                    *o = p - t;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn categorical_crossentropy_gradient_has_no_averaging_factor() {
        let y_pred = vec![0.7f32, 0.3];
        let y_true = vec![1.0f32, 0.0];
        let mut out = vec![0.0f32; 2];
        Loss::CategoricalCrossEntropy.gradient(&y_pred, &y_true, &mut out);
        assert_eq!(out, vec![-0.3, 0.3]);
    }

    #[test]
    fn mse_gradient_matches_definition() {
        let y_pred = vec![1.0f32, 2.0];
        let y_true = vec![0.0f32, 0.0];
        let mut out = vec![0.0f32; 2];
        Loss::MeanSquaredError.gradient(&y_pred, &y_true, &mut out);
        assert_eq!(out, vec![1.0, 2.0]);
    }

    #[test]
    fn name_round_trips() {
        for loss in [
            Loss::MeanSquaredError,
            Loss::MeanAbsoluteError,
            Loss::MeanAbsolutePercentageError,
            Loss::BinaryCrossEntropy,
            Loss::CategoricalCrossEntropy,
        ] {
            assert_eq!(Loss::by_name(loss.name()), Some(loss));
        }
    }
}
