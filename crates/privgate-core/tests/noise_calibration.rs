// Copyright (c) 2026 Privgate Contributors
// SPDX-License-Identifier: Apache-2.0

use privgate_core::noise::add_noise_with_rng;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;

const TRIALS: usize = 100_000;

fn sample_mean_var(xs: &[f64]) -> (f64, f64) {
    let n = xs.len() as f64;
    let mean = xs.iter().sum::<f64>() / n;
    let var = xs.iter().map(|x| (x - mean) * (x - mean)).sum::<f64>() / n;
    (mean, var)
}

/// At sensitivity=1, epsilon=1 the mechanism draws Laplace(0, 1):
/// mean 0, variance 2 * scale^2 = 2.
#[test]
fn repeated_draws_approximate_laplace_unit_scale() {
    let mut rng = ChaCha8Rng::seed_from_u64(0xCA11B_A5E);
    let draws: Vec<f64> = (0..TRIALS)
        .map(|_| add_noise_with_rng(&[0.0], 1.0, 1.0, &mut rng).expect("draw")[0])
        .collect();

    let (mean, var) = sample_mean_var(&draws);
    assert!(mean.abs() < 0.05, "mean = {mean}");
    assert!((var - 2.0).abs() < 0.1, "variance = {var}");
}

/// Variance scales as 2 * (sensitivity / epsilon)^2.
#[test]
fn variance_tracks_the_calibrated_scale() {
    let sensitivity = 2.0;
    let epsilon = 0.5;
    let scale = sensitivity / epsilon;
    let mut rng = ChaCha8Rng::seed_from_u64(7);
    let draws: Vec<f64> = (0..TRIALS)
        .map(|_| add_noise_with_rng(&[0.0], sensitivity, epsilon, &mut rng).expect("draw")[0])
        .collect();

    let (mean, var) = sample_mean_var(&draws);
    let expected_var = 2.0 * scale * scale;
    assert!(mean.abs() < 0.05 * scale, "mean = {mean}");
    assert!(
        (var - expected_var).abs() < 0.05 * expected_var,
        "variance = {var}, expected ~{expected_var}"
    );
}

/// Smaller epsilon means stronger privacy and wider noise.
#[test]
fn noise_spread_grows_as_epsilon_shrinks() {
    let mut rng = ChaCha8Rng::seed_from_u64(11);
    let tight: Vec<f64> = (0..10_000)
        .map(|_| add_noise_with_rng(&[0.0], 1.0, 2.0, &mut rng).expect("draw")[0])
        .collect();
    let loose: Vec<f64> = (0..10_000)
        .map(|_| add_noise_with_rng(&[0.0], 1.0, 0.25, &mut rng).expect("draw")[0])
        .collect();

    let (_, tight_var) = sample_mean_var(&tight);
    let (_, loose_var) = sample_mean_var(&loose);
    assert!(loose_var > tight_var * 10.0);
}
