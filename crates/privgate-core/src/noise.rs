// Copyright (c) 2026 Privgate Contributors
// SPDX-License-Identifier: Apache-2.0

use crate::error::{MediationError, MediationResult};
use rand::rngs::OsRng;
use rand::Rng;

/// Validate calibration parameters. Rejection happens here, before any
/// budget reservation is attempted, so an invalid query never spends.
pub fn laplace_scale(sensitivity: f64, epsilon: f64) -> MediationResult<f64> {
    if !sensitivity.is_finite() || sensitivity <= 0.0 {
        return Err(MediationError::InvalidArgument(
            "sensitivity must be finite and > 0".to_string(),
        ));
    }
    if !epsilon.is_finite() || epsilon <= 0.0 {
        return Err(MediationError::InvalidArgument(
            "epsilon must be finite and > 0".to_string(),
        ));
    }
    Ok(sensitivity / epsilon)
}

/// Laplace mechanism: add noise drawn from Laplace(0, sensitivity/epsilon)
/// independently to each element. The production draw comes from the
/// operating-system CSPRNG; predictable noise would defeat the privacy
/// guarantee. Stateless and side-effect-free beyond randomness; the ledger
/// is never touched here.
pub fn add_noise(values: &[f64], sensitivity: f64, epsilon: f64) -> MediationResult<Vec<f64>> {
    add_noise_with_rng(values, sensitivity, epsilon, &mut OsRng)
}

/// Same mechanism with an injected random source, for seeded test draws.
pub fn add_noise_with_rng<R: Rng + ?Sized>(
    values: &[f64],
    sensitivity: f64,
    epsilon: f64,
    rng: &mut R,
) -> MediationResult<Vec<f64>> {
    let scale = laplace_scale(sensitivity, epsilon)?;
    if let Some(bad) = values.iter().find(|v| !v.is_finite()) {
        return Err(MediationError::InvalidArgument(format!(
            "query values must be finite, got {bad}"
        )));
    }
    Ok(values
        .iter()
        .map(|value| value + laplace_sample(rng, scale))
        .collect())
}

/// Inverse-CDF sampling from a uniform draw u in (-0.5, 0.5).
fn laplace_sample<R: Rng + ?Sized>(rng: &mut R, scale: f64) -> f64 {
    let u: f64 = rng.gen_range(-0.5f64..0.5f64);
    if u == 0.0 {
        0.0
    } else {
        -scale * u.signum() * (1.0 - 2.0 * u.abs()).ln()
    }
}
