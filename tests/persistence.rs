//! Save/load integration coverage beyond the inline unit tests in
//! `network::npy`: a full zip round trip through a temp directory, plus the
//! registry's dynamic-activation-loading failure path (SPEC_FULL.md §8
//! scenario 5 and §7's load-time error handling).

use rand::rngs::StdRng;
use rand::SeedableRng;
use simd_neuralnet::activations::ActivationRegistry;
use simd_neuralnet::network::Network;
use simd_neuralnet::GPError;

#[test]
fn save_then_load_reproduces_predictions_bit_for_bit() {
    let registry = ActivationRegistry::new();
    let mut net = Network::create(&[8, 4, 2], &["relu", "sigmoid"], &registry).unwrap();
    let mut rng = StdRng::seed_from_u64(99);
    net.initialize("auto", &mut rng);

    let ones = vec![1.0f32; 8];
    let before = net.predict(&ones).unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.zip");
    net.save(&path).unwrap();

    let loaded = Network::load(&path, &registry).unwrap();
    let after = loaded.predict(&ones).unwrap();

    assert_eq!(before, after);
    assert_eq!(net.get_parameters(), loaded.get_parameters());
}

#[test]
fn loading_a_missing_archive_reports_an_io_error() {
    let registry = ActivationRegistry::new();
    let err = Network::load("/nonexistent/path/to/model.zip", &registry).unwrap_err();
    assert!(matches!(err, GPError::Io { .. }));
}

#[test]
fn registering_a_dynamic_activation_from_a_missing_library_fails_cleanly() {
    let mut registry = ActivationRegistry::new();
    let err = unsafe { registry.register_dynamic("my_custom_activation", "/nonexistent/libcustom.so") }.unwrap_err();
    assert!(matches!(err, GPError::DynamicActivation { .. }));
}
