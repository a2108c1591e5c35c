//! The `Layer`/`Network` core: construction, initialization, forward
//! inference (single-sample and batched), and single-sample backpropagation.
//!
//! Save/load lives in [`crate::network::npy`].

pub mod npy;

use rand::Rng;
use rand_distr::{Distribution, Uniform};

use crate::activations::{Activation, ActivationRegistry};
use crate::aligned::AlignedBuffer;
use crate::errors::{GPError, GPResult};
use crate::kernels;
use crate::loss::Loss;

/// One fully-connected layer: `y = f(Wᵀx + b)`.
///
/// `weight` is `n_in x n_out` row-major, `bias` is length `n_out`; both live
/// in SIMD-aligned storage (§3 of the spec this crate implements).
pub struct Layer {
    pub n_in: usize,
    pub n_out: usize,
    pub weight: AlignedBuffer,
    pub bias: AlignedBuffer,
    pub activation: Activation,
}

impl Layer {
    fn new(n_in: usize, n_out: usize, activation: Activation) -> GPResult<Self> {
        if n_in == 0 || n_out == 0 {
            return Err(GPError::InvalidDimensions { n_in, n_out });
        }
        Ok(Self {
            n_in,
            n_out,
            weight: AlignedBuffer::zeros(n_in * n_out),
            bias: AlignedBuffer::zeros(n_out),
            activation,
        })
    }

    fn n_parameters(&self) -> usize {
        self.n_out + self.n_in * self.n_out
    }
}

/// An ordered stack of [`Layer`]s plus the loss used for training.
///
/// Exclusively owns all parameter storage; `layer[i].n_out ==
/// layer[i+1].n_in` is maintained as an invariant by `create`.
pub struct Network {
    pub layers: Vec<Layer>,
    loss: Option<Loss>,
    /// Set by `set_loss` when the loss is fused with the last layer's actual
    /// activation (binary cross-entropy+sigmoid, categorical cross-entropy+
    /// softmax); `backpropagation` then skips that layer's activation
    /// derivative, since the loss gradient already encodes it.
    fused_output: bool,
}

/// A Marsaglia polar-method standard-normal generator, bootstrapped from a
/// uniform `rand::Rng`. Kept as an explicit value rather than the original
/// engine's function-local static, so two networks initialized concurrently
/// never share state (§9 REDESIGN FLAGS: no global mutable state).
struct PolarNormal {
    spare: Option<f32>,
}

impl PolarNormal {
    fn new() -> Self {
        Self { spare: None }
    }

    fn sample(&mut self, rng: &mut impl Rng) -> f32 {
        if let Some(v) = self.spare.take() {
            return v;
        }
        let between = Uniform::new(-1.0f32, 1.0f32);
        loop {
            let u = between.sample(rng);
            let v = between.sample(rng);
            let s = u * u + v * v;
            if s < 1.0 && s > 0.0 {
                let fac = (-2.0 * s.ln() / s).sqrt();
                self.spare = Some(v * fac);
                return u * fac;
            }
        }
    }
}

impl Network {
    /// Builds a network from `n_layers+1` sizes and `n_layers` activation
    /// names. Unrecognized names fall back to `linear` with a warning;
    /// sizes that are `0` abort construction.
    pub fn create(sizes: &[usize], activation_names: &[&str], registry: &ActivationRegistry) -> GPResult<Self> {
        if sizes.len() < 2 {
            return Err(GPError::InvalidDimensions {
                n_in: sizes.first().copied().unwrap_or(0),
                n_out: 0,
            });
        }
        if activation_names.len() != sizes.len() - 1 {
            return Err(GPError::ShapeMismatch {
                layer: activation_names.len(),
                expected: sizes.len() - 1,
                found: activation_names.len(),
            });
        }

        let mut layers = Vec::with_capacity(sizes.len() - 1);
        for (i, name) in activation_names.iter().enumerate() {
            let activation = registry.by_name(name).unwrap_or_else(|| {
                tracing::warn!(layer = i, requested = %name, "unrecognized activation, falling back to linear");
                Activation::Linear
            });
            layers.push(Layer::new(sizes[i], sizes[i + 1], activation)?);
        }
        Ok(Self {
            layers,
            loss: None,
            fused_output: false,
        })
    }

    /// Random-initializes every layer's weights; biases are always zeroed.
    ///
    /// `initializer` is one of `"xavier"`, `"kaiming"`, or `"auto"` (picks
    /// xavier for sigmoid/tanh/softmax/hard_sigmoid/softsign, kaiming for
    /// relu/softplus, else standard-normal with a warning — mirroring the
    /// original engine's per-activation fallback table).
    pub fn initialize(&mut self, initializer: &str, rng: &mut impl Rng) {
        let mut normal = PolarNormal::new();
        for layer in self.layers.iter_mut() {
            let chosen = if initializer == "auto" {
                match layer.activation.name() {
                    "sigmoid" | "tanh" | "softmax" | "hard_sigmoid" | "softsign" => "xavier",
                    "relu" | "softplus" => "kaiming",
                    other => {
                        tracing::warn!(activation = %other, "no default initializer for this activation, using standard normal");
                        "standard_normal"
                    }
                }
            } else {
                initializer
            };

            match chosen {
                "xavier" => {
                    let bound = (6.0 / (layer.n_in + layer.n_out) as f32).sqrt();
                    let dist = Uniform::new(-bound, bound);
                    for w in layer.weight.as_mut_slice().iter_mut() {
                        *w = dist.sample(rng);
                    }
                }
                "kaiming" => {
                    let sigma = (2.0 / layer.n_in as f32).sqrt();
                    for w in layer.weight.as_mut_slice().iter_mut() {
                        *w = sigma * normal.sample(rng);
                    }
                }
                _ => {
                    for w in layer.weight.as_mut_slice().iter_mut() {
                        *w = normal.sample(rng);
                    }
                }
            }
            layer.bias.as_mut_slice().fill(0.0);
        }
    }

    /// Resolves `name` as the training loss. When it is fused with an
    /// activation (binary cross-entropy + sigmoid, categorical
    /// cross-entropy + softmax) and the last layer already uses that
    /// activation, the last layer's activation-derivative becomes a no-op
    /// (the loss gradient already encodes the composed derivative). A
    /// mismatch between the fused pair and the actual last-layer activation
    /// is only ever a warning, never a hard error.
    pub fn set_loss(&mut self, name: &str) -> GPResult<()> {
        let loss = Loss::by_name(name).ok_or_else(|| GPError::UnknownLoss(name.to_string()))?;
        self.fused_output = false;
        if let Some(expected_activation) = loss.fused_activation() {
            match self.layers.last() {
                Some(last) if last.activation.name() == expected_activation => {
                    self.fused_output = true;
                }
                Some(last) => {
                    tracing::warn!(
                        loss = %name,
                        expected_activation,
                        found_activation = %last.activation.name(),
                        "loss is normally fused with a different output activation"
                    );
                }
                None => {}
            }
        }
        self.loss = Some(loss);
        Ok(())
    }

    pub fn loss(&self) -> Option<Loss> {
        self.loss
    }

    pub fn n_layers(&self) -> usize {
        self.layers.len()
    }

    pub fn input_size(&self) -> usize {
        self.layers.first().map(|l| l.n_in).unwrap_or(0)
    }

    pub fn output_size(&self) -> usize {
        self.layers.last().map(|l| l.n_out).unwrap_or(0)
    }

    /// `Σ_i (n_in_i + 1) * n_out_i` — the flat parameter-vector length `P`.
    pub fn total_n_parameters(&self) -> usize {
        self.layers.iter().map(Layer::n_parameters).sum()
    }

    /// Flattens every layer's parameters into one buffer, bias block then
    /// weight block per layer, in forward order — the layout shared by
    /// [`Network::update`] and the save/load format.
    pub fn get_parameters(&self) -> Vec<f32> {
        let mut out = Vec::with_capacity(self.total_n_parameters());
        for layer in &self.layers {
            out.extend_from_slice(layer.bias.as_slice());
            out.extend_from_slice(layer.weight.as_slice());
        }
        out
    }

    /// Adds `delta` (same layout as [`Network::get_parameters`]) into every
    /// layer's parameters in place.
    pub fn update(&mut self, delta: &[f32]) -> GPResult<()> {
        let expected = self.total_n_parameters();
        if delta.len() != expected {
            return Err(GPError::BufferLengthMismatch {
                expected,
                found: delta.len(),
            });
        }
        let mut offset = 0;
        for layer in self.layers.iter_mut() {
            let n_out = layer.n_out;
            kernels::accumulate(layer.bias.as_mut_slice(), &delta[offset..offset + n_out]);
            offset += n_out;
            let n_w = layer.n_in * n_out;
            kernels::accumulate(layer.weight.as_mut_slice(), &delta[offset..offset + n_w]);
            offset += n_w;
        }
        Ok(())
    }

    /// Single-sample forward pass. Returns the network's output (length
    /// `output_size()`).
    pub fn predict(&self, input: &[f32]) -> GPResult<Vec<f32>> {
        if input.len() != self.input_size() {
            return Err(GPError::ShapeMismatch {
                layer: 0,
                expected: self.input_size(),
                found: input.len(),
            });
        }
        let mut activation = input.to_vec();
        for layer in &self.layers {
            let mut z = vec![0.0f32; layer.n_out];
            kernels::vector_matrix_multiply(
                layer.weight.as_slice(),
                layer.bias.as_slice(),
                &activation,
                &mut z,
                layer.n_in,
                layer.n_out,
            );
            layer.activation.apply(&mut z);
            activation = z;
        }
        Ok(activation)
    }

    /// Batched forward pass for `batch_size` samples laid out row-major in
    /// `inputs` (`batch_size * input_size()` elements). Returns a row-major
    /// `batch_size * output_size()` buffer.
    ///
    /// Uses `ndarray`'s 2D GEMM per layer rather than per-sample kernel
    /// calls — the batched analogue of §4.6, with no stack-workspace size
    /// threshold to clamp against since every workspace here is heap
    /// allocated.
    pub fn predict_batch(&self, inputs: &[f32], batch_size: usize) -> GPResult<Vec<f32>> {
        if batch_size == 0 {
            return Err(GPError::InvalidBatchSize);
        }
        let input_size = self.input_size();
        if inputs.len() != batch_size * input_size {
            return Err(GPError::BufferLengthMismatch {
                expected: batch_size * input_size,
                found: inputs.len(),
            });
        }

        use ndarray::Array2;
        let mut activation = Array2::from_shape_vec((batch_size, input_size), inputs.to_vec())
            .expect("shape checked above");

        for layer in &self.layers {
            let w = Array2::from_shape_vec((layer.n_in, layer.n_out), layer.weight.as_slice().to_vec())
                .expect("layer weight shape is fixed at construction");
            let mut z = activation.dot(&w);
            for mut row in z.rows_mut() {
                for (zi, &bi) in row.iter_mut().zip(layer.bias.as_slice()) {
                    *zi += bi;
                }
                let slice = row.as_slice_mut().expect("row is contiguous");
                layer.activation.apply(slice);
            }
            activation = z;
        }
        Ok(activation.into_raw_vec())
    }

    /// Single-sample backpropagation. Writes `∂L/∂θ` (bias-then-weight per
    /// layer, same layout as [`Network::get_parameters`]) into `grad_out`,
    /// which must already be the right length; it is fully overwritten, not
    /// accumulated into.
    ///
    /// Requires [`Network::set_loss`] to have been called.
    pub fn backpropagation(&self, input: &[f32], target: &[f32], grad_out: &mut [f32]) -> GPResult<()> {
        let loss = self.loss.ok_or_else(|| GPError::UnknownLoss("(none set)".to_string()))?;
        if input.len() != self.input_size() {
            return Err(GPError::ShapeMismatch {
                layer: 0,
                expected: self.input_size(),
                found: input.len(),
            });
        }
        if target.len() != self.output_size() {
            return Err(GPError::ShapeMismatch {
                layer: self.layers.len(),
                expected: self.output_size(),
                found: target.len(),
            });
        }
        let expected_grad_len = self.total_n_parameters();
        if grad_out.len() != expected_grad_len {
            return Err(GPError::BufferLengthMismatch {
                expected: expected_grad_len,
                found: grad_out.len(),
            });
        }

        // Forward pass, keeping every layer's post-activation vector
        // (activations[0] is the input; activations[i+1] is layer i's output).
        let mut activations = Vec::with_capacity(self.layers.len() + 1);
        activations.push(input.to_vec());
        for layer in &self.layers {
            let prev = activations.last().expect("just pushed the input");
            let mut z = vec![0.0f32; layer.n_out];
            kernels::vector_matrix_multiply(
                layer.weight.as_slice(),
                layer.bias.as_slice(),
                prev,
                &mut z,
                layer.n_in,
                layer.n_out,
            );
            layer.activation.apply(&mut z);
            activations.push(z);
        }

        let n_layers = self.layers.len();
        let mut delta = vec![0.0f32; self.output_size()];
        loss.gradient(&activations[n_layers], target, &mut delta);

        // Offsets of each layer's bias/weight block within grad_out, forward order.
        let mut offsets = Vec::with_capacity(n_layers);
        let mut cursor = 0;
        for layer in &self.layers {
            let bias_off = cursor;
            cursor += layer.n_out;
            let weight_off = cursor;
            cursor += layer.n_in * layer.n_out;
            offsets.push((bias_off, weight_off));
        }

        for i in (0..n_layers).rev() {
            let layer = &self.layers[i];
            if i < n_layers - 1 {
                let next = &self.layers[i + 1];
                let mut propagated = vec![0.0f32; layer.n_out];
                kernels::matrix_vector_multiply(next.weight.as_slice(), &delta, &mut propagated, layer.n_out, next.n_out);
                delta = propagated;
            }
            let is_fused_output_layer = i == n_layers - 1 && self.fused_output;
            if !is_fused_output_layer {
                layer.activation.derivative(&activations[i + 1], &mut delta);
            }

            let (bias_off, weight_off) = offsets[i];
            grad_out[bias_off..bias_off + layer.n_out].copy_from_slice(&delta);
            let weight_slice = &mut grad_out[weight_off..weight_off + layer.n_in * layer.n_out];
            kernels::vector_vector_outer(&activations[i], &delta, weight_slice, layer.n_in, layer.n_out);
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn registry() -> ActivationRegistry {
        ActivationRegistry::new()
    }

    #[test]
    fn create_rejects_zero_size() {
        let reg = registry();
        let err = Network::create(&[2, 0, 1], &["relu", "linear"], &reg).unwrap_err();
        assert!(matches!(err, GPError::InvalidDimensions { .. }));
    }

    #[test]
    fn total_n_parameters_matches_layer_sizes() {
        let reg = registry();
        let net = Network::create(&[3, 4, 2], &["relu", "linear"], &reg).unwrap();
        // layer0: 3*4 + 4 = 16, layer1: 4*2 + 2 = 10
        assert_eq!(net.total_n_parameters(), 26);
    }

    #[test]
    fn get_parameters_and_update_round_trip_layout() {
        let reg = registry();
        let mut net = Network::create(&[2, 2], &["linear"], &reg).unwrap();
        let params = net.get_parameters();
        assert_eq!(params, vec![0.0; net.total_n_parameters()]);
        let delta = vec![1.0; net.total_n_parameters()];
        net.update(&delta).unwrap();
        assert_eq!(net.get_parameters(), delta);
    }

    #[test]
    fn kaiming_initialization_has_expected_variance() {
        let reg = registry();
        let mut net = Network::create(&[1000, 1], &["relu"], &reg).unwrap();
        let mut rng = StdRng::seed_from_u64(42);
        net.initialize("kaiming", &mut rng);
        let w = net.layers[0].weight.as_slice();
        let mean: f32 = w.iter().sum::<f32>() / w.len() as f32;
        let var: f32 = w.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / w.len() as f32;
        let expected_var = 2.0 / 1000.0;
        assert!((var - expected_var).abs() / expected_var < 0.25);
    }

    #[test]
    fn predict_matches_manual_linear_computation() {
        let reg = registry();
        let mut net = Network::create(&[2, 1], &["linear"], &reg).unwrap();
        net.layers[0].weight.as_mut_slice().copy_from_slice(&[1.0, 2.0]);
        net.layers[0].bias.as_mut_slice().copy_from_slice(&[0.5]);
        let out = net.predict(&[3.0, 4.0]).unwrap();
        assert_eq!(out, vec![0.5 + 3.0 * 1.0 + 4.0 * 2.0]);
    }

    #[test]
    fn predict_batch_matches_single_sample_predict() {
        let reg = registry();
        let mut net = Network::create(&[2, 3, 1], &["relu", "sigmoid"], &reg).unwrap();
        let mut rng = StdRng::seed_from_u64(7);
        net.initialize("auto", &mut rng);

        let samples = [[1.0f32, -1.0], [0.5, 0.5]];
        let flat: Vec<f32> = samples.iter().flatten().copied().collect();
        let batched = net.predict_batch(&flat, 2).unwrap();

        for (i, sample) in samples.iter().enumerate() {
            let single = net.predict(sample).unwrap();
            assert!((batched[i] - single[0]).abs() < 1e-5);
        }
    }

    #[test]
    fn backpropagation_rejects_wrong_target_length() {
        let reg = registry();
        let mut net = Network::create(&[2, 2], &["linear"], &reg).unwrap();
        net.set_loss("mean_squared_error").unwrap();
        let mut grad = vec![0.0; net.total_n_parameters()];
        let err = net.backpropagation(&[1.0, 1.0], &[0.0, 0.0, 0.0], &mut grad).unwrap_err();
        assert!(matches!(err, GPError::ShapeMismatch { .. }));
    }

    #[test]
    fn backpropagation_produces_finite_gradient_for_every_parameter() {
        let reg = registry();
        let mut net = Network::create(&[3, 4, 2], &["relu", "softmax"], &reg).unwrap();
        let mut rng = StdRng::seed_from_u64(1);
        net.initialize("auto", &mut rng);
        net.set_loss("categorical_crossentropy").unwrap();

        let mut grad = vec![0.0; net.total_n_parameters()];
        net.backpropagation(&[0.2, -0.1, 0.5], &[1.0, 0.0], &mut grad).unwrap();
        assert!(grad.iter().all(|g| g.is_finite()));
        assert!(grad.iter().any(|&g| g != 0.0));
    }

    #[test]
    fn fused_loss_disables_last_layer_derivative() {
        let reg = registry();
        let mut net = Network::create(&[2, 2], &["softmax"], &reg).unwrap();
        net.set_loss("categorical_crossentropy").unwrap();
        // Softmax's own derivative is already a no-op, so this mainly
        // documents that set_loss does not error on the matching pair.
        assert_eq!(net.loss().unwrap(), Loss::CategoricalCrossEntropy);
    }

    #[test]
    fn fused_binary_crossentropy_sigmoid_skips_the_sigmoid_derivative() {
        // Unlike softmax, sigmoid's own derivative is NOT a no-op, so this
        // test actually exercises the fusion: the bias gradient for a
        // single-layer network must equal (y_pred - y_true) / n exactly,
        // not that times a(1-a) (the sigmoid derivative would additionally
        // apply if `backpropagation` failed to skip it).
        let reg = registry();
        let mut net = Network::create(&[2, 2], &["sigmoid"], &reg).unwrap();
        net.set_loss("binary_crossentropy").unwrap();

        let input = [1.0f32, -1.0];
        let target = [0.0f32, 1.0];
        let pred = net.predict(&input).unwrap();

        let mut grad = vec![0.0f32; net.total_n_parameters()];
        net.backpropagation(&input, &target, &mut grad).unwrap();

        // Bias block is the first n_out entries of the flattened layout.
        let expected: Vec<f32> = pred.iter().zip(target.iter()).map(|(&p, &t)| (p - t) / 2.0).collect();
        for (g, e) in grad[..2].iter().zip(expected.iter()) {
            assert!((g - e).abs() < 1e-6, "got {g}, expected {e}");
        }
    }
}
