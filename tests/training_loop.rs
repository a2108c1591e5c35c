//! End-to-end training loop: optimizer + callbacks wired together, the way
//! a caller of this crate actually uses it.

use rand::rngs::StdRng;
use rand::SeedableRng;
use simd_neuralnet::activations::ActivationRegistry;
use simd_neuralnet::callbacks::{Callback, Direction, EarlyStopping, Logger, ModelCheckpoint};
use simd_neuralnet::metrics::Metric;
use simd_neuralnet::network::Network;
use simd_neuralnet::optim::{Dataset, Optimizer, OptimizerConfig, SgdOptimizer};

fn xor_dataset() -> ([f32; 8], [f32; 4]) {
    // (0,0)->0 (0,1)->1 (1,0)->1 (1,1)->0
    ([0.0, 0.0, 0.0, 1.0, 1.0, 0.0, 1.0, 1.0], [0.0, 1.0, 1.0, 0.0])
}

#[test]
fn xor_training_drives_loss_down_over_many_epochs() {
    let registry = ActivationRegistry::new();
    let mut net = Network::create(&[2, 4, 1], &["tanh", "sigmoid"], &registry).unwrap();
    let mut rng = StdRng::seed_from_u64(21);
    net.initialize("auto", &mut rng);
    net.set_loss("binary_crossentropy").unwrap();

    let config = OptimizerConfig {
        batch_size: 4,
        shuffle: false,
        metrics: vec![Metric::MeanSquaredError],
        seed: Some(21),
    };
    let mut opt = SgdOptimizer::new(net, config, 0.5).with_momentum(0.9);

    let (x, y) = xor_dataset();
    let first = opt.run_epoch(Dataset::new(&x, &y, 4), None).train(0);
    for _ in 0..500 {
        opt.run_epoch(Dataset::new(&x, &y, 4), None);
    }
    let last = opt.run_epoch(Dataset::new(&x, &y, 4), None).train(0);

    assert!(last < first, "expected XOR training loss to decrease: {first} -> {last}");
    assert!(last < 0.1, "expected XOR to be nearly solved after 500 epochs, got mse={last}");
}

#[test]
fn callbacks_observe_every_epoch_and_checkpoint_tracks_the_best_model() {
    let dir = tempfile::tempdir().unwrap();
    let log_path = dir.path().join("train.log");
    let checkpoint_path = dir.path().join("best.zip");

    let registry = ActivationRegistry::new();
    let mut net = Network::create(&[2, 4, 1], &["tanh", "sigmoid"], &registry).unwrap();
    let mut rng = StdRng::seed_from_u64(8);
    net.initialize("auto", &mut rng);
    net.set_loss("binary_crossentropy").unwrap();

    let config = OptimizerConfig {
        batch_size: 4,
        shuffle: false,
        metrics: vec![Metric::MeanSquaredError],
        seed: Some(8),
    };
    let mut opt = SgdOptimizer::new(net, config, 0.5);

    let mut logger = Logger::with_file(&log_path);
    let mut checkpoint = ModelCheckpoint::new(&checkpoint_path, Some(0), Direction::Lower);
    let mut early_stop = EarlyStopping::new(Some(0), Direction::Lower, 10);

    let (x, y) = xor_dataset();
    for _ in 0..20 {
        let results = opt.run_epoch(Dataset::new(&x, &y, 4), None);
        logger.on_epoch_end(&opt, &results);
        checkpoint.on_epoch_end(&opt, &results);
        early_stop.on_epoch_end(&opt, &results);
        if early_stop.should_stop() {
            break;
        }
    }

    let log_contents = std::fs::read_to_string(&log_path).unwrap();
    assert!(log_contents.contains("Epoch 20:") || early_stop.should_stop());
    assert!(checkpoint_path.exists(), "checkpoint should have saved at least once");

    // The checkpoint must be loadable and produce finite output.
    let loaded = Network::load(&checkpoint_path, &registry).unwrap();
    let out = loaded.predict(&[1.0, 0.0]).unwrap();
    assert!(out[0].is_finite());
}
