//! Numerical laws from SPEC_FULL.md §8 that cut across modules: gradient
//! checking against finite differences, and the flatten/unflatten identity.

use rand::rngs::StdRng;
use rand::SeedableRng;
use simd_neuralnet::activations::ActivationRegistry;
use simd_neuralnet::network::Network;

fn total_loss(net: &Network, x: &[f32], y: &[f32]) -> f32 {
    let pred = net.predict(x).unwrap();
    pred.iter().zip(y).map(|(p, t)| (p - t) * (p - t)).sum::<f32>() / pred.len() as f32
}

#[test]
fn backprop_gradient_matches_finite_difference() {
    let registry = ActivationRegistry::new();
    let mut net = Network::create(&[3, 4, 2], &["tanh", "sigmoid"], &registry).unwrap();
    let mut rng = StdRng::seed_from_u64(5);
    net.initialize("xavier", &mut rng);
    net.set_loss("mean_squared_error").unwrap();

    let x = [0.3f32, -0.2, 0.7];
    let y = [1.0f32, 0.0];

    let mut analytic = vec![0.0f32; net.total_n_parameters()];
    net.backpropagation(&x, &y, &mut analytic).unwrap();

    let delta = 1e-4f32;
    let base_params = net.get_parameters();
    for k in 0..base_params.len() {
        let mut bump = vec![0.0f32; base_params.len()];
        bump[k] = delta;

        let mut plus = Network::create(&[3, 4, 2], &["tanh", "sigmoid"], &registry).unwrap();
        plus.update(&base_params).unwrap();
        plus.update(&bump).unwrap();
        plus.set_loss("mean_squared_error").unwrap();
        let loss_plus = total_loss(&plus, &x, &y);

        let mut base = Network::create(&[3, 4, 2], &["tanh", "sigmoid"], &registry).unwrap();
        base.update(&base_params).unwrap();
        base.set_loss("mean_squared_error").unwrap();
        let loss_base = total_loss(&base, &x, &y);

        let numeric = (loss_plus - loss_base) / delta;
        assert!(
            (analytic[k] - numeric).abs() <= 1e-2,
            "param {k}: analytic={}, numeric={}",
            analytic[k],
            numeric
        );
    }
}

#[test]
fn flatten_then_negated_update_zeroes_parameters() {
    let registry = ActivationRegistry::new();
    let mut net = Network::create(&[2, 3, 1], &["relu", "linear"], &registry).unwrap();
    let mut rng = StdRng::seed_from_u64(13);
    net.initialize("auto", &mut rng);

    let params = net.get_parameters();
    let negated: Vec<f32> = params.iter().map(|&p| -p).collect();
    net.update(&negated).unwrap();

    assert!(net.get_parameters().iter().all(|&p| p == 0.0));
}
