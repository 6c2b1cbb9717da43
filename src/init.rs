//! Weight initialization and random sampling helpers.

use ndarray::{Array1, Array2};
use rand::Rng;

/// Uniform matrix in `[-init_weight, init_weight]`
pub fn uniform_matrix<R: Rng>(
    rng: &mut R,
    rows: usize,
    cols: usize,
    init_weight: f32,
) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| {
        rng.random_range(-init_weight..=init_weight)
    })
}

/// Uniform vector in `[-init_weight, init_weight]`
pub fn uniform_vector<R: Rng>(rng: &mut R, len: usize, init_weight: f32) -> Array1<f32> {
    Array1::from_shape_fn(len, |_| rng.random_range(-init_weight..=init_weight))
}

/// One draw from the standard normal via the Box-Muller transform
pub fn standard_normal<R: Rng>(rng: &mut R) -> f32 {
    let u1: f64 = rng.random::<f64>().max(1e-10);
    let u2: f64 = rng.random::<f64>();
    ((-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos()) as f32
}

/// Matrix of independent standard-normal draws
pub fn standard_normal_matrix<R: Rng>(rng: &mut R, rows: usize, cols: usize) -> Array2<f32> {
    Array2::from_shape_fn((rows, cols), |_| standard_normal(rng))
}
