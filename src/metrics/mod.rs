//! Scalar metrics for reporting. Never used for backpropagation — only the
//! loss registry's gradient kernels drive training (see `crate::loss`).

const METRIC_EPSILON: f32 = 1e-7;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Metric {
    MeanSquaredError,
    MeanAbsoluteError,
    MeanAbsolutePercentageError,
    BinaryCrossEntropy,
    CategoricalCrossEntropy,
}

impl Metric {
    pub fn by_name(name: &str) -> Option<Self> {
        match name {
            "mean_squared_error" | "mse" => Some(Metric::MeanSquaredError),
            "mean_absolute_error" | "mae" => Some(Metric::MeanAbsoluteError),
            "mean_absolute_percentage_error" | "mape" => Some(Metric::MeanAbsolutePercentageError),
            "binary_crossentropy" => Some(Metric::BinaryCrossEntropy),
            "categorical_crossentropy" => Some(Metric::CategoricalCrossEntropy),
            _ => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Metric::MeanSquaredError => "mean_squared_error",
            Metric::MeanAbsoluteError => "mean_absolute_error",
            Metric::MeanAbsolutePercentageError => "mean_absolute_percentage_error",
            Metric::BinaryCrossEntropy => "binary_crossentropy",
            Metric::CategoricalCrossEntropy => "categorical_crossentropy",
        }
    }

    /// Reduces one sample's `(y_pred, y_true)` pair to a scalar score.
    /// Callers average this over a dataset themselves.
    pub fn compute(&self, y_pred: &[f32], y_true: &[f32]) -> f32 {
        debug_assert_eq!(y_pred.len(), y_true.len());
        let n = y_pred.len() as f32;
        match self {
            Metric::MeanSquaredError => {
                let sum: f32 = y_pred.iter().zip(y_true).map(|(&p, &t)| (p - t) * (p - t)).sum();
                sum / n
            }
            Metric::MeanAbsoluteError => {
                let sum: f32 = y_pred.iter().zip(y_true).map(|(&p, &t)| (t - p).abs()).sum();
                sum / n
            }
            Metric::MeanAbsolutePercentageError => {
                let sum: f32 = y_pred
                    .iter()
                    .zip(y_true)
                    .map(|(&p, &t)| ((t - p) / t.abs().max(METRIC_EPSILON)).abs())
                    .sum();
                100.0 * sum / n
            }
            Metric::BinaryCrossEntropy => {
                let sum: f32 = y_pred
                    .iter()
                    .zip(y_true)
                    .map(|(&p, &t)| {
                        let clipped = p.clamp(METRIC_EPSILON, 1.0 - METRIC_EPSILON);
                        t * clipped.ln() + (1.0 - t) * (1.0 - clipped).ln()
                    })
                    .sum();
                -sum / n
            }
            Metric::CategoricalCrossEntropy => {
                let sum: f32 = y_pred
                    .iter()
                    .zip(y_true)
                    .map(|(&p, &t)| {
                        let clipped = p.clamp(METRIC_EPSILON, 1.0 - METRIC_EPSILON);
                        t * clipped.ln()
                    })
                    .sum();
                -sum / n
            }
        }
    }
}

/// Name-indexed lookup table over the built-in metrics.
#[derive(Default, Clone)]
pub struct MetricRegistry;

impl MetricRegistry {
    pub fn new() -> Self {
        Self
    }

    pub fn by_name(&self, name: &str) -> Option<Metric> {
        Metric::by_name(name)
    }
}
