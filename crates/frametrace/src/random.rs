//! Process-wide random state behind the `randn` and `manual_seed` builtins.
//!
//! The generator is a seeded `ChaCha8Rng` so runs are reproducible. Its state
//! can be captured and restored, which the frame converter does around every
//! conversion so that compiling never perturbs the user's random stream.

use std::sync::LazyLock;

use parking_lot::{Mutex, MutexGuard};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::tensor::{DType, Tensor};

const DEFAULT_SEED: u64 = 0x5eed;

static RNG: LazyLock<Mutex<ChaCha8Rng>> = LazyLock::new(|| Mutex::new(ChaCha8Rng::seed_from_u64(DEFAULT_SEED)));

/// A captured generator state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RngState(ChaCha8Rng);

fn rng() -> MutexGuard<'static, ChaCha8Rng> {
    RNG.lock()
}

/// Reseeds the process generator.
pub fn manual_seed(seed: u64) {
    *rng() = ChaCha8Rng::seed_from_u64(seed);
}

#[must_use]
pub fn get_rng_state() -> RngState {
    RngState(rng().clone())
}

pub fn set_rng_state(state: &RngState) {
    *rng() = state.0.clone();
}

/// Samples a standard-normal tensor of the given shape (Box-Muller).
#[must_use]
pub fn randn(shape: &[usize]) -> Tensor {
    let numel: usize = shape.iter().product();
    let mut rng = rng();
    let data = (0..numel)
        .map(|_| {
            let u1: f64 = rng.r#gen::<f64>().max(f64::MIN_POSITIVE);
            let u2: f64 = rng.r#gen();
            (-2.0 * u1.ln()).sqrt() * (std::f64::consts::TAU * u2).cos()
        })
        .collect();
    Tensor::from_data(DType::Float32, shape, data)
}

/// Restores the random state when dropped.
///
/// Held for the duration of a frame conversion.
#[derive(Debug)]
pub struct PreserveRngState {
    saved: RngState,
}

impl PreserveRngState {
    #[must_use]
    pub fn new() -> Self {
        Self { saved: get_rng_state() }
    }
}

impl Default for PreserveRngState {
    fn default() -> Self {
        Self::new()
    }
}

impl Drop for PreserveRngState {
    fn drop(&mut self) {
        set_rng_state(&self.saved);
    }
}
