//! Trains a tiny network on XOR and prints the loss every 500 epochs.
//!
//! Run with `cargo run --example xor`.

use rand::rngs::StdRng;
use rand::SeedableRng;
use simd_neuralnet::activations::ActivationRegistry;
use simd_neuralnet::metrics::Metric;
use simd_neuralnet::network::Network;
use simd_neuralnet::optim::{Dataset, Optimizer, OptimizerConfig, SgdOptimizer};

fn main() {
    tracing_subscriber::fmt::init();

    let registry = ActivationRegistry::new();
    let mut net = Network::create(&[2, 4, 1], &["tanh", "sigmoid"], &registry).expect("valid topology");
    let mut rng = StdRng::seed_from_u64(0);
    net.initialize("auto", &mut rng);
    net.set_loss("binary_crossentropy").expect("binary_crossentropy is a known loss");

    let config = OptimizerConfig {
        batch_size: 4,
        shuffle: false,
        metrics: vec![Metric::MeanSquaredError],
        seed: Some(0),
    };
    let mut opt = SgdOptimizer::new(net, config, 0.5).with_momentum(0.9);

    let x = [0.0f32, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0];
    let y = [0.0f32, 1.0, 1.0, 0.0];

    for epoch in 1..=5000 {
        let results = opt.run_epoch(Dataset::new(&x, &y, 4), None);
        if epoch % 500 == 0 {
            println!("epoch {epoch}: mse={:.6}", results.train(0));
        }
    }

    let net = opt.base().network();
    for row in 0..4 {
        let input = &x[row * 2..row * 2 + 2];
        let pred = net.predict(input).expect("trained network accepts this input shape");
        println!("{:?} -> {:.4} (target {})", input, pred[0], y[row]);
    }
}
