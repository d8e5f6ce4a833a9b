//! Noise generation for sensor simulation.
//!
//! Pure, deterministic noise generators used by the camera model:
//! - Shot noise (Poisson photon/electron statistics, Gaussian above a
//!   crossover for numerical efficiency)
//! - Read noise (zero-mean Gaussian from readout electronics)
//! - Dark current (temperature-dependent thermal charge with its own shot
//!   noise)
//!
//! Generation is row-chunk parallel: each chunk derives its own seed from
//! the caller's seed plus the chunk index, so results are bit-identical
//! regardless of how rayon schedules the chunks.

pub mod seed;

pub use seed::{hash_seeds, splitmix64};

use ndarray::{Array2, Axis};
use rand::rngs::StdRng;
use rand::SeedableRng;
use rand_distr::{Distribution, Normal, Poisson};
use rayon::prelude::*;

/// Expected-count threshold above which shot noise switches from an exact
/// Poisson draw to the Gaussian approximation N(λ, √λ). At λ = 25 the two
/// distributions agree to well under a percent, so the transition is
/// statistically continuous.
pub const POISSON_GAUSSIAN_CROSSOVER_E: f64 = 25.0;

/// Reference temperature for the dark-current rate specification (°C).
pub const REFERENCE_TEMP_C: f64 = 25.0;

/// Dark current doubles for every this many degrees Celsius.
pub const DARK_CURRENT_DOUBLING_C: f64 = 6.0;

/// Rows per parallel generation chunk.
const ROW_CHUNK: usize = 64;

/// Draw one counting-statistics realization for an expected value.
///
/// Exact Poisson below [`POISSON_GAUSSIAN_CROSSOVER_E`], Gaussian above,
/// clamped non-negative. Non-positive expectations realize as zero counts.
fn sample_counts(expected: f64, rng: &mut StdRng) -> f64 {
    if expected <= 0.0 {
        return 0.0;
    }
    if expected < POISSON_GAUSSIAN_CROSSOVER_E {
        let poisson =
            Poisson::new(expected).expect("Poisson parameter is positive and finite here");
        poisson.sample(rng)
    } else {
        let normal = Normal::new(expected, expected.sqrt())
            .expect("Gaussian parameters are positive and finite here");
        normal.sample(rng).max(0.0)
    }
}

/// Realize shot noise over a field of expected electron counts.
///
/// Each pixel is drawn from a Poisson-like distribution with mean equal to
/// the expected count at that pixel. Rows are processed in parallel chunks,
/// each chunk seeded from `hash_seeds([seed, chunk_index])`.
pub fn shot_noise(expected: &Array2<f64>, seed: u64) -> Array2<f64> {
    let mut realized = expected.clone();
    realized
        .axis_chunks_iter_mut(Axis(0), ROW_CHUNK)
        .into_par_iter()
        .enumerate()
        .for_each(|(chunk_idx, mut chunk)| {
            let mut rng = StdRng::seed_from_u64(hash_seeds(&[seed, chunk_idx as u64]));
            for value in chunk.iter_mut() {
                *value = sample_counts(*value, &mut rng);
            }
        });
    realized
}

/// Generate a zero-mean Gaussian read-noise field.
///
/// Read noise is independent of signal level and exposure time. A
/// non-positive `sigma_e` yields a zero field.
pub fn read_noise(seed: u64, sigma_e: f64, shape: (usize, usize)) -> Array2<f64> {
    let mut field = Array2::<f64>::zeros(shape);
    if sigma_e <= 0.0 {
        return field;
    }
    let normal = Normal::new(0.0, sigma_e).expect("sigma is positive and finite here");
    field
        .axis_chunks_iter_mut(Axis(0), ROW_CHUNK)
        .into_par_iter()
        .enumerate()
        .for_each(|(chunk_idx, mut chunk)| {
            let mut rng = StdRng::seed_from_u64(hash_seeds(&[seed, chunk_idx as u64]));
            for value in chunk.iter_mut() {
                *value = normal.sample(&mut rng);
            }
        });
    field
}

/// Expected dark-current charge per pixel for an exposure.
///
/// Scales linearly with exposure duration and doubles every
/// [`DARK_CURRENT_DOUBLING_C`] degrees above [`REFERENCE_TEMP_C`].
pub fn dark_current_expectation(rate_e_per_s: f64, exposure_s: f64, temperature_c: f64) -> f64 {
    let temp_factor = 2.0_f64.powf((temperature_c - REFERENCE_TEMP_C) / DARK_CURRENT_DOUBLING_C);
    rate_e_per_s * temp_factor * exposure_s
}

/// Generate a dark-current charge field, including its shot noise.
pub fn dark_current(
    rate_e_per_s: f64,
    exposure_s: f64,
    temperature_c: f64,
    seed: u64,
    shape: (usize, usize),
) -> Array2<f64> {
    let expected = dark_current_expectation(rate_e_per_s, exposure_s, temperature_c);
    if expected <= 0.0 {
        return Array2::zeros(shape);
    }
    shot_noise(&Array2::from_elem(shape, expected), seed)
}
