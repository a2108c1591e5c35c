//! The optimizer framework: shared epoch-driving plumbing ([`OptimizerBase`])
//! plus the four concrete update rules (SGD, AdaGrad, RMSProp, Adam/AdamW).
//!
//! Every variant embeds an [`OptimizerBase`] by value and implements
//! [`Optimizer`]; [`Optimizer::run_epoch`] is a single default method shared
//! by all four, so a variant only has to supply the two hooks that actually
//! differ: [`Optimizer::pre_step`] (SGD/RMSProp's Nesterov look-ahead) and
//! [`Optimizer::apply_gradient`] (the update rule itself, §4.9).

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use rayon::prelude::*;

use crate::aligned::AlignedBuffer;
use crate::kernels;
use crate::metrics::Metric;
use crate::network::Network;

/// AdaGrad/RMSProp's epsilon, kept outside the square root per SPEC_FULL.md
/// §9 — this departs from some textbook forms but the testable properties
/// depend on this exact placement.
const ADAGRAD_EPSILON: f32 = 1e-7;
const ADAM_EPSILON: f32 = 1e-8;

/// Shared construction-time configuration for every optimizer variant.
#[derive(Clone)]
pub struct OptimizerConfig {
    pub batch_size: usize,
    pub shuffle: bool,
    pub metrics: Vec<Metric>,
    /// Fixed seed for the shuffle PRNG. `None` seeds from entropy, matching
    /// "reseeded" in §4.8; a fixed seed makes scenario 6 (deterministic
    /// rerun with `shuffle=false`) reproducible end to end.
    pub seed: Option<u64>,
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self {
            batch_size: 32,
            shuffle: true,
            metrics: Vec::new(),
            seed: None,
        }
    }
}

/// Per-epoch metric results: the first `n_metrics` slots are training-set
/// averages; if a validation set was supplied, the next `n_metrics` slots
/// are its averages (§4.8 step 3-4).
#[derive(Debug, Clone)]
pub struct EpochResults {
    values: Vec<f32>,
    n_metrics: usize,
    has_validation: bool,
}

impl EpochResults {
    pub(crate) fn new(n_metrics: usize, has_validation: bool) -> Self {
        let len = if has_validation { n_metrics * 2 } else { n_metrics };
        Self {
            values: vec![0.0; len],
            n_metrics,
            has_validation,
        }
    }

    pub(crate) fn set_train(&mut self, i: usize, value: f32) {
        self.values[i] = value;
    }

    pub(crate) fn set_validation(&mut self, i: usize, value: f32) {
        self.values[self.n_metrics + i] = value;
    }

    pub fn train(&self, i: usize) -> f32 {
        self.values[i]
    }

    pub fn validation(&self, i: usize) -> Option<f32> {
        if self.has_validation {
            Some(self.values[self.n_metrics + i])
        } else {
            None
        }
    }

    pub fn has_validation(&self) -> bool {
        self.has_validation
    }

    pub fn n_metrics(&self) -> usize {
        self.n_metrics
    }

    pub fn as_slice(&self) -> &[f32] {
        &self.values
    }
}

/// A dataset slice used by [`Optimizer::run_epoch`]: row-major
/// samples/targets plus the sample count.
pub struct Dataset<'a> {
    pub x: &'a [f32],
    pub y: &'a [f32],
    pub n: usize,
}

impl<'a> Dataset<'a> {
    pub fn new(x: &'a [f32], y: &'a [f32], n: usize) -> Self {
        Self { x, y, n }
    }
}

/// Plumbing shared by every optimizer variant: the network being trained,
/// minibatch configuration, the shuffle pivot, and the progress hook.
pub struct OptimizerBase {
    network: Network,
    batch_size: usize,
    shuffle: bool,
    metrics: Vec<Metric>,
    seed: Option<u64>,
    progress: Option<Box<dyn FnMut(usize, usize) + Send>>,
    pivot: Vec<usize>,
    rng: StdRng,
}

impl OptimizerBase {
    /// Allocates the shared state. Panics if `config.batch_size == 0` — a
    /// programmer error, per SPEC_FULL.md §7, not a recoverable condition.
    pub fn new(network: Network, config: OptimizerConfig) -> Self {
        assert!(config.batch_size >= 1, "batch size must be >= 1");
        let rng = Self::seeded_rng(config.seed);
        Self {
            network,
            batch_size: config.batch_size,
            shuffle: config.shuffle,
            metrics: config.metrics,
            seed: config.seed,
            progress: None,
            pivot: Vec::new(),
            rng,
        }
    }

    fn seeded_rng(seed: Option<u64>) -> StdRng {
        match seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        }
    }

    pub fn network(&self) -> &Network {
        &self.network
    }

    pub fn network_mut(&mut self) -> &mut Network {
        &mut self.network
    }

    pub fn into_network(self) -> Network {
        self.network
    }

    pub fn metrics(&self) -> &[Metric] {
        &self.metrics
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn set_progress(&mut self, f: impl FnMut(usize, usize) + Send + 'static) {
        self.progress = Some(Box::new(f));
    }

    /// Resizes and reseeds the pivot whenever `n_train` changes, per §4.8.
    fn ensure_pivot(&mut self, n_train: usize) {
        if self.pivot.len() != n_train {
            self.pivot = (0..n_train).collect();
            self.rng = Self::seeded_rng(self.seed);
        }
    }

    /// Fisher-Yates, descending `i`, swap `pivot[i] <-> pivot[rand %
    /// (i+1)]` — an exact permutation of `0..n_train-1`.
    fn shuffle_pivot(&mut self) {
        let n = self.pivot.len();
        for i in (1..n).rev() {
            let j = self.rng.gen_range(0..=i);
            self.pivot.swap(i, j);
        }
    }

    /// Computes the batch-averaged gradient over `min(batch_size, n_train -
    /// start)` samples starting at pivot position `start`. Per-sample
    /// backpropagation runs across the `rayon` global pool, each task
    /// folding into its own [`AlignedBuffer`], reduced into one sum before
    /// dividing by the batch length (§4.8, §5).
    fn accumulate_minibatch_gradient(&self, x: &[f32], y: &[f32], start: usize, batch_len: usize) -> AlignedBuffer {
        let input_size = self.network.input_size();
        let output_size = self.network.output_size();
        let p = self.network.total_n_parameters();
        let indices = &self.pivot[start..start + batch_len];

        let mut sum = indices
            .par_iter()
            .fold(
                || AlignedBuffer::zeros(p),
                |mut acc, &idx| {
                    let sample = &x[idx * input_size..(idx + 1) * input_size];
                    let target = &y[idx * output_size..(idx + 1) * output_size];
                    let mut grad = AlignedBuffer::zeros(p);
                    self.network
                        .backpropagation(sample, target, grad.as_mut_slice())
                        .expect("run_epoch validates dataset shapes before calling this");
                    kernels::accumulate(acc.as_mut_slice(), grad.as_slice());
                    acc
                },
            )
            .reduce(
                || AlignedBuffer::zeros(p),
                |mut a, b| {
                    kernels::accumulate(a.as_mut_slice(), b.as_slice());
                    a
                },
            );

        kernels::divide_by_scalar(sum.as_mut_slice(), batch_len as f32);
        sum
    }

    /// Averages every configured metric over `(x, y)` (`n` samples) into
    /// `results`'s training or validation half.
    fn evaluate(&self, x: &[f32], y: &[f32], n: usize, results: &mut EpochResults, validation: bool) {
        if n == 0 || self.metrics.is_empty() {
            return;
        }
        let input_size = self.network.input_size();
        let output_size = self.network.output_size();
        let mut sums = vec![0.0f32; self.metrics.len()];
        for i in 0..n {
            let sample = &x[i * input_size..(i + 1) * input_size];
            let target = &y[i * output_size..(i + 1) * output_size];
            let pred = self
                .network
                .predict(sample)
                .expect("run_epoch validates dataset shapes before calling this");
            for (m, metric) in self.metrics.iter().enumerate() {
                sums[m] += metric.compute(&pred, target);
            }
        }
        for (m, sum) in sums.into_iter().enumerate() {
            let avg = sum / n as f32;
            if validation {
                results.set_validation(m, avg);
            } else {
                results.set_train(m, avg);
            }
        }
    }
}

/// Implemented by every concrete optimizer variant. [`Optimizer::run_epoch`]
/// is the shared epoch driver (§4.8); [`Optimizer::pre_step`] and
/// [`Optimizer::apply_gradient`] are the only variant-specific hooks (§4.9).
pub trait Optimizer {
    fn base(&self) -> &OptimizerBase;
    fn base_mut(&mut self) -> &mut OptimizerBase;

    /// Runs once per minibatch, before the gradient is computed. SGD/RMSProp
    /// use this for the Nesterov look-ahead (momentum-scale velocity, and
    /// when Nesterov is enabled, apply it to the parameters as an interim
    /// update); every other variant leaves this a no-op.
    fn pre_step(&mut self) {}

    /// Runs once per minibatch with the batch-averaged gradient; applies
    /// the variant's update rule to the network's parameters.
    fn apply_gradient(&mut self, grad: &[f32]);

    fn n_metrics(&self) -> usize {
        self.base().metrics.len()
    }

    /// The shared epoch driver (§4.8): shuffle (if enabled), sweep every
    /// minibatch through `pre_step`/gradient-accumulation/`apply_gradient`,
    /// then evaluate on the training set and, if given, the validation set.
    fn run_epoch(&mut self, train: Dataset<'_>, valid: Option<Dataset<'_>>) -> EpochResults {
        self.base_mut().ensure_pivot(train.n);
        if self.base().shuffle {
            self.base_mut().shuffle_pivot();
        }

        let batch_size = self.base().batch_size;
        let mut i = 0;
        while i < train.n {
            let batch_len = (train.n - i).min(batch_size);
            self.pre_step();
            let grad = self.base().accumulate_minibatch_gradient(train.x, train.y, i, batch_len);
            self.apply_gradient(grad.as_slice());
            i += batch_len;
            if let Some(progress) = self.base_mut().progress.as_mut() {
                progress(i, train.n);
            }
        }

        let n_metrics = self.n_metrics();
        let mut results = EpochResults::new(n_metrics, valid.is_some());
        self.base().evaluate(train.x, train.y, train.n, &mut results, false);
        if let Some(valid) = valid {
            self.base().evaluate(valid.x, valid.y, valid.n, &mut results, true);
        }
        results
    }
}

/// Blanket bridge so callbacks can observe any optimizer variant through one
/// object-safe trait, without the callback module depending on the concrete
/// variant type.
pub trait OptimizerInfo {
    fn network(&self) -> &Network;
    fn n_metrics(&self) -> usize;
    fn metric_name(&self, i: usize) -> &str;
}

impl<T: Optimizer> OptimizerInfo for T {
    fn network(&self) -> &Network {
        self.base().network()
    }

    fn n_metrics(&self) -> usize {
        self.base().metrics.len()
    }

    fn metric_name(&self, i: usize) -> &str {
        self.base().metrics[i].name()
    }
}

/// `η ← η/(1+d·t)`, evaluated with the iteration counter *before* it is
/// incremented for this step (so the first step's rate is unscaled).
fn decayed_lr(lr: f32, decay: f32, iteration: u64) -> f32 {
    lr / (1.0 + decay * iteration as f32)
}

/// SGD with optional momentum, Nesterov acceleration, and time-based decay.
pub struct SgdOptimizer {
    base: OptimizerBase,
    lr: f32,
    decay: f32,
    momentum: f32,
    nesterov: bool,
    iteration: u64,
    velocity: AlignedBuffer,
}

impl SgdOptimizer {
    pub fn new(network: Network, config: OptimizerConfig, lr: f32) -> Self {
        let p = network.total_n_parameters();
        Self {
            base: OptimizerBase::new(network, config),
            lr,
            decay: 0.0,
            momentum: 0.0,
            nesterov: false,
            iteration: 0,
            velocity: AlignedBuffer::zeros(p),
        }
    }

    pub fn with_decay(mut self, decay: f32) -> Self {
        self.decay = decay;
        self
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_nesterov(mut self, nesterov: bool) -> Self {
        self.nesterov = nesterov;
        self
    }
}

impl Optimizer for SgdOptimizer {
    fn base(&self) -> &OptimizerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OptimizerBase {
        &mut self.base
    }

    fn pre_step(&mut self) {
        if self.momentum > 0.0 {
            kernels::scale(self.velocity.as_mut_slice(), self.momentum);
            if self.nesterov {
                self.base
                    .network_mut()
                    .update(self.velocity.as_slice())
                    .expect("velocity is parameter-sized by construction");
            }
        }
    }

    fn apply_gradient(&mut self, grad: &[f32]) {
        let lr = decayed_lr(self.lr, self.decay, self.iteration);
        self.iteration += 1;

        let mut delta: Vec<f32> = grad.to_vec();
        kernels::scale(&mut delta, -lr);

        if self.momentum > 0.0 {
            kernels::accumulate(self.velocity.as_mut_slice(), &delta);
            if self.nesterov {
                self.base
                    .network_mut()
                    .update(&delta)
                    .expect("delta is parameter-sized by construction");
            } else {
                self.base
                    .network_mut()
                    .update(self.velocity.as_slice())
                    .expect("velocity is parameter-sized by construction");
            }
        } else {
            self.base
                .network_mut()
                .update(&delta)
                .expect("delta is parameter-sized by construction");
        }
    }
}

/// AdaGrad: per-parameter learning rate scaled by the inverse root of the
/// running sum of squared gradients.
pub struct AdaGradOptimizer {
    base: OptimizerBase,
    lr: f32,
    decay: f32,
    iteration: u64,
    r: AlignedBuffer,
}

impl AdaGradOptimizer {
    pub fn new(network: Network, config: OptimizerConfig, lr: f32) -> Self {
        let p = network.total_n_parameters();
        Self {
            base: OptimizerBase::new(network, config),
            lr,
            decay: 0.0,
            iteration: 0,
            r: AlignedBuffer::zeros(p),
        }
    }

    pub fn with_decay(mut self, decay: f32) -> Self {
        self.decay = decay;
        self
    }
}

impl Optimizer for AdaGradOptimizer {
    fn base(&self) -> &OptimizerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OptimizerBase {
        &mut self.base
    }

    fn apply_gradient(&mut self, grad: &[f32]) {
        let lr = decayed_lr(self.lr, self.decay, self.iteration);
        self.iteration += 1;

        let mut g_sq = vec![0.0f32; grad.len()];
        kernels::square_elements(&mut g_sq, grad);
        kernels::accumulate(self.r.as_mut_slice(), &g_sq);

        let delta: Vec<f32> = grad
            .iter()
            .zip(self.r.as_slice())
            .map(|(&g, &r)| -lr * g / (ADAGRAD_EPSILON + r.sqrt()))
            .collect();
        self.base
            .network_mut()
            .update(&delta)
            .expect("delta is parameter-sized by construction");
    }
}

/// RMSProp: AdaGrad's update rule over an exponentially-decayed second
/// moment instead of an unbounded running sum, with the same optional
/// momentum/Nesterov wrap as [`SgdOptimizer`].
pub struct RmsPropOptimizer {
    base: OptimizerBase,
    lr: f32,
    decay: f32,
    momentum: f32,
    nesterov: bool,
    rho: f32,
    iteration: u64,
    velocity: AlignedBuffer,
    r: AlignedBuffer,
}

impl RmsPropOptimizer {
    pub fn new(network: Network, config: OptimizerConfig, lr: f32) -> Self {
        let p = network.total_n_parameters();
        Self {
            base: OptimizerBase::new(network, config),
            lr,
            decay: 0.0,
            momentum: 0.0,
            nesterov: false,
            rho: 0.9,
            iteration: 0,
            velocity: AlignedBuffer::zeros(p),
            r: AlignedBuffer::zeros(p),
        }
    }

    pub fn with_decay(mut self, decay: f32) -> Self {
        self.decay = decay;
        self
    }

    pub fn with_momentum(mut self, momentum: f32) -> Self {
        self.momentum = momentum;
        self
    }

    pub fn with_nesterov(mut self, nesterov: bool) -> Self {
        self.nesterov = nesterov;
        self
    }

    pub fn with_rho(mut self, rho: f32) -> Self {
        self.rho = rho;
        self
    }
}

impl Optimizer for RmsPropOptimizer {
    fn base(&self) -> &OptimizerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OptimizerBase {
        &mut self.base
    }

    fn pre_step(&mut self) {
        if self.momentum > 0.0 {
            kernels::scale(self.velocity.as_mut_slice(), self.momentum);
            if self.nesterov {
                self.base
                    .network_mut()
                    .update(self.velocity.as_slice())
                    .expect("velocity is parameter-sized by construction");
            }
        }
    }

    fn apply_gradient(&mut self, grad: &[f32]) {
        let lr = decayed_lr(self.lr, self.decay, self.iteration);
        self.iteration += 1;

        let mut g_sq = vec![0.0f32; grad.len()];
        kernels::square_elements(&mut g_sq, grad);
        kernels::saxpby(self.r.as_mut_slice(), 1.0 - self.rho, &g_sq, self.rho);

        let delta: Vec<f32> = grad
            .iter()
            .zip(self.r.as_slice())
            .map(|(&g, &r)| -lr * g / (ADAGRAD_EPSILON + r.sqrt()))
            .collect();

        if self.momentum > 0.0 {
            kernels::accumulate(self.velocity.as_mut_slice(), &delta);
            if self.nesterov {
                self.base
                    .network_mut()
                    .update(&delta)
                    .expect("delta is parameter-sized by construction");
            } else {
                self.base
                    .network_mut()
                    .update(self.velocity.as_slice())
                    .expect("velocity is parameter-sized by construction");
            }
        } else {
            self.base
                .network_mut()
                .update(&delta)
                .expect("delta is parameter-sized by construction");
        }
    }
}

/// Adam, or AdamW when `weight_decay > 0` (decoupled weight decay is the
/// only difference — plain Adam is AdamW with `weight_decay == 0.0`).
pub struct AdamOptimizer {
    base: OptimizerBase,
    lr: f32,
    beta1: f32,
    beta2: f32,
    weight_decay: f32,
    s: AlignedBuffer,
    r: AlignedBuffer,
    beta1_t: f32,
    beta2_t: f32,
}

impl AdamOptimizer {
    pub fn new(network: Network, config: OptimizerConfig, lr: f32) -> Self {
        let p = network.total_n_parameters();
        Self {
            base: OptimizerBase::new(network, config),
            lr,
            beta1: 0.9,
            beta2: 0.999,
            weight_decay: 0.0,
            s: AlignedBuffer::zeros(p),
            r: AlignedBuffer::zeros(p),
            beta1_t: 1.0,
            beta2_t: 1.0,
        }
    }

    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    /// Setting `weight_decay > 0` is what makes this AdamW.
    pub fn with_weight_decay(mut self, weight_decay: f32) -> Self {
        self.weight_decay = weight_decay;
        self
    }
}

impl Optimizer for AdamOptimizer {
    fn base(&self) -> &OptimizerBase {
        &self.base
    }

    fn base_mut(&mut self) -> &mut OptimizerBase {
        &mut self.base
    }

    fn apply_gradient(&mut self, grad: &[f32]) {
        let mut g_sq = vec![0.0f32; grad.len()];
        kernels::square_elements(&mut g_sq, grad);

        let beta1 = self.beta1;
        let beta2 = self.beta2;
        let s = self.s.as_mut_slice();
        let r = self.r.as_mut_slice();
        // s and r depend only on the (read-only) gradient and write disjoint
        // buffers, so the two moment updates run as independent tasks (§5).
        rayon::join(
            || kernels::saxpby(s, 1.0 - beta1, grad, beta1),
            || kernels::saxpby(r, 1.0 - beta2, &g_sq, beta2),
        );

        self.beta1_t *= self.beta1;
        self.beta2_t *= self.beta2;

        let mut delta: Vec<f32> = self
            .s
            .as_slice()
            .iter()
            .zip(self.r.as_slice())
            .map(|(&s, &r)| {
                let s_hat = s / (1.0 - self.beta1_t);
                let r_hat = r / (1.0 - self.beta2_t);
                -self.lr * s_hat / (r_hat.sqrt() + ADAM_EPSILON)
            })
            .collect();

        if self.weight_decay > 0.0 {
            let theta = self.base.network().get_parameters();
            for (d, t) in delta.iter_mut().zip(theta.iter()) {
                *d -= self.weight_decay * t;
            }
        }

        self.base
            .network_mut()
            .update(&delta)
            .expect("delta is parameter-sized by construction");
    }
}
