//! Activation functions and the registry that maps names to them.
//!
//! Each activation is applied in place to produce the post-activation value
//! `a` from the pre-activation value `z`; its derivative multiplies an
//! incoming gradient in place by the Jacobian diagonal, expressed in terms
//! of `a` wherever that is cheaper than recomputing from `z` (matching the
//! original C engine's convention).

use std::ffi::c_uint;
use std::sync::Arc;

use libloading::{Library, Symbol};

use crate::errors::{GPError, GPResult};

/// C ABI signature a dynamically-loaded activation's `apply` symbol must have.
pub type RawApplyFn = unsafe extern "C" fn(c_uint, *mut f32);
/// C ABI signature a dynamically-loaded activation's `<symbol>_derivative` must have.
pub type RawDerivativeFn = unsafe extern "C" fn(c_uint, *const f32, *mut f32);

/// A named activation: an `apply` and a `derivative` kernel.
#[derive(Clone)]
pub enum Activation {
    Linear,
    Relu,
    Sigmoid,
    Tanh,
    Softmax,
    Softplus,
    Softsign,
    HardSigmoid,
    Exponential,
    /// Resolved from a shared object via `register_dynamic`. The `Library`
    /// is kept alive by the registry (via `Arc`) so the symbols stay valid
    /// for as long as any `Activation` value referencing them is alive.
    Dynamic {
        name: Arc<str>,
        apply: RawApplyFn,
        derivative: Option<RawDerivativeFn>,
        _library: Arc<Library>,
    },
}

impl Activation {
    /// Applies the activation in place: `z` becomes `a = f(z)`.
    pub fn apply(&self, z: &mut [f32]) {
        match self {
            Activation::Linear => {}
            Activation::Relu => {
                for v in z.iter_mut() {
                    if *v < 0.0 {
                        *v = 0.0;
                    }
                }
            }
            Activation::Sigmoid => {
                for v in z.iter_mut() {
                    *v = 1.0 / (1.0 + (-*v).exp());
                }
            }
            Activation::Tanh => {
                for v in z.iter_mut() {
                    *v = v.tanh();
                }
            }
            Activation::Softmax => softmax(z),
            Activation::Softplus => {
                for v in z.iter_mut() {
                    *v = (1.0 + v.exp()).ln();
                }
            }
            Activation::Softsign => {
                for v in z.iter_mut() {
                    *v = *v / (1.0 + v.abs());
                }
            }
            Activation::HardSigmoid => {
                for v in z.iter_mut() {
                    *v = if *v <= -2.5 {
                        0.0
                    } else if *v >= 2.5 {
                        1.0
                    } else {
                        0.2 * *v + 0.5
                    };
                }
            }
            Activation::Exponential => {
                for v in z.iter_mut() {
                    *v = v.exp();
                }
            }
            Activation::Dynamic { apply, .. } => {
                // Safety: `apply` was resolved from the named library at
                // registration time and matches `RawApplyFn`'s signature by
                // the dynamic-activation contract (SPEC_FULL.md §4.2).
                unsafe { apply(z.len() as c_uint, z.as_mut_ptr()) };
            }
        }
    }

    /// Multiplies `d` in place by `f'(z)`, expressed in terms of the
    /// post-activation value `a`.
    pub fn derivative(&self, a: &[f32], d: &mut [f32]) {
        debug_assert_eq!(a.len(), d.len());
        match self {
            Activation::Linear | Activation::Softmax => {
                // No-op: softmax's derivative is only ever used fused with
                // categorical cross-entropy, where it is replaced outright.
            }
            Activation::Relu => {
                for (di, &ai) in d.iter_mut().zip(a.iter()) {
                    if ai <= 0.0 {
                        *di = 0.0;
                    }
                }
            }
            Activation::Sigmoid => {
                for (di, &ai) in d.iter_mut().zip(a.iter()) {
                    *di *= ai * (1.0 - ai);
                }
            }
            Activation::Tanh => {
                for (di, &ai) in d.iter_mut().zip(a.iter()) {
                    *di *= 1.0 - ai * ai;
                }
            }
            Activation::Softplus => {
                for (di, &ai) in d.iter_mut().zip(a.iter()) {
                    *di *= 1.0 - (-ai).exp();
                }
            }
            Activation::Softsign => {
                for (di, &ai) in d.iter_mut().zip(a.iter()) {
                    let t = 1.0 - ai.abs();
                    *di *= t * t;
                }
            }
            Activation::HardSigmoid => {
                for (di, &ai) in d.iter_mut().zip(a.iter()) {
                    *di *= if ai > 0.0 && ai < 1.0 { 0.2 } else { 0.0 };
                }
            }
            Activation::Exponential => {
                for (di, &ai) in d.iter_mut().zip(a.iter()) {
                    *di *= ai;
                }
            }
            Activation::Dynamic { derivative, .. } => {
                if let Some(derivative) = derivative {
                    // Safety: same contract as `apply` above.
                    unsafe { derivative(a.len() as c_uint, a.as_ptr(), d.as_mut_ptr()) };
                }
            }
        }
    }

    /// Canonical name this activation was registered under.
    pub fn name(&self) -> &str {
        match self {
            Activation::Linear => "linear",
            Activation::Relu => "relu",
            Activation::Sigmoid => "sigmoid",
            Activation::Tanh => "tanh",
            Activation::Softmax => "softmax",
            Activation::Softplus => "softplus",
            Activation::Softsign => "softsign",
            Activation::HardSigmoid => "hard_sigmoid",
            Activation::Exponential => "exponential",
            Activation::Dynamic { name, .. } => name,
        }
    }
}

/// Numerically stable softmax: subtract the row max, exponentiate, normalize.
fn softmax(z: &mut [f32]) {
    let max = z.iter().copied().fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for v in z.iter_mut() {
        *v = (*v - max).exp();
        sum += *v;
    }
    for v in z.iter_mut() {
        *v /= sum;
    }
}

/// Name-indexed lookup table of activations, including dynamically loaded ones.
///
/// Unlike the original C engine, the registry is an explicit value the
/// caller owns (no process-wide global), so `register_dynamic`'s `Library`
/// handles are released precisely when the registry is dropped.
#[derive(Clone, Default)]
pub struct ActivationRegistry {
    dynamic: Vec<Activation>,
}

impl ActivationRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Resolves a built-in by name, or a previously `register_dynamic`'d
    /// entry. Returns `None` if `name` is not recognized (the caller falls
    /// back to `linear` with a warning, per SPEC_FULL.md §4.4).
    pub fn by_name(&self, name: &str) -> Option<Activation> {
        match name {
            "linear" => Some(Activation::Linear),
            "relu" => Some(Activation::Relu),
            "sigmoid" => Some(Activation::Sigmoid),
            "tanh" => Some(Activation::Tanh),
            "softmax" => Some(Activation::Softmax),
            "softplus" => Some(Activation::Softplus),
            "softsign" => Some(Activation::Softsign),
            "hard_sigmoid" => Some(Activation::HardSigmoid),
            "exponential" => Some(Activation::Exponential),
            other => self.dynamic.iter().find(|a| a.name() == other).cloned(),
        }
    }

    /// Loads `symbol` (apply) and `symbol_derivative` (derivative, optional)
    /// from the shared library at `library_path`, and registers both under
    /// the name `"{symbol}@{library_path}"` as used by `by_name`.
    ///
    /// # Safety
    /// The caller must ensure the named symbols actually have the
    /// [`RawApplyFn`]/[`RawDerivativeFn`] signatures; calling into a
    /// mismatched symbol is undefined behavior.
    pub unsafe fn register_dynamic(&mut self, symbol: &str, library_path: &str) -> GPResult<Activation> {
        let library = Library::new(library_path).map_err(|e| GPError::DynamicActivation {
            symbol: symbol.to_string(),
            library: library_path.to_string(),
            reason: e.to_string(),
        })?;
        let library = Arc::new(library);

        let apply_symbol: Symbol<RawApplyFn> =
            library.get(symbol.as_bytes()).map_err(|e| GPError::DynamicActivation {
                symbol: symbol.to_string(),
                library: library_path.to_string(),
                reason: e.to_string(),
            })?;
        let apply: RawApplyFn = *apply_symbol;

        let derivative_symbol = format!("{symbol}_derivative");
        let derivative: Option<RawDerivativeFn> = match library.get::<RawDerivativeFn>(derivative_symbol.as_bytes()) {
            Ok(sym) => Some(*sym),
            Err(_) => {
                tracing::warn!(
                    symbol = %symbol,
                    library = %library_path,
                    "activation derivative not resolved for dynamically loaded activation; backprop through this layer will not update upstream gradients correctly"
                );
                None
            }
        };

        let name: Arc<str> = Arc::from(format!("{symbol}@{library_path}"));
        let activation = Activation::Dynamic {
            name,
            apply,
            derivative,
            _library: library,
        };
        self.dynamic.push(activation.clone());
        Ok(activation)
    }

    /// Inverse of `by_name`: the name `a` was looked up or registered under.
    pub fn name_of(&self, a: &Activation) -> &str {
        a.name()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn softmax_sums_to_one_and_is_in_unit_interval() {
        let mut z = vec![1.0f32, 2.0, 3.0];
        Activation::Softmax.apply(&mut z);
        let sum: f32 = z.iter().sum();
        assert!((sum - 1.0).abs() < 1e-5);
        assert!(z.iter().all(|&v| v > 0.0 && v < 1.0));
        assert!((z[0] - 0.09003).abs() < 1e-5);
        assert!((z[1] - 0.24473).abs() < 1e-5);
        assert!((z[2] - 0.66524).abs() < 1e-5);
    }

    #[test]
    fn relu_derivative_zeroes_negative_activations() {
        let a = vec![0.0f32, 2.0];
        let mut d = vec![1.0f32, 1.0];
        Activation::Relu.derivative(&a, &mut d);
        assert_eq!(d, vec![0.0, 1.0]);
    }

    #[test]
    fn hard_sigmoid_is_piecewise() {
        let mut z = vec![-3.0f32, 0.0, 3.0];
        Activation::HardSigmoid.apply(&mut z);
        assert_eq!(z, vec![0.0, 0.5, 1.0]);
    }

    #[test]
    fn name_round_trips_for_every_builtin() {
        let registry = ActivationRegistry::new();
        for name in [
            "linear",
            "relu",
            "sigmoid",
            "tanh",
            "softmax",
            "softplus",
            "softsign",
            "hard_sigmoid",
            "exponential",
        ] {
            let act = registry.by_name(name).expect("builtin should resolve");
            assert_eq!(registry.name_of(&act), name);
        }
    }

    #[test]
    fn unknown_name_resolves_to_none() {
        let registry = ActivationRegistry::new();
        assert!(registry.by_name("not_a_real_activation").is_none());
    }
}
