//! Two-phase, sharding-aware parameter initialization.
//!
//! Phase one is shape-only: [`Weights::abstract_spec`] and [`Weights::shardings`] describe every
//! parameter and its placement without touching values. Phase two materializes values, either
//! straight into each device's shard (`low_memory`) or in full followed by a redistribution.
//!
//! Both phases draw element `i` of a parameter from the same position of the same counter-based
//! stream, so the two paths agree bit for bit.

use super::weights::{Initializer, ParamSpec, Weights};
use crate::config::Config;
use crate::distributed::{NamedSharding, ShardedTensor};
use crate::error::Result;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use tracing::{debug, info, instrument};

/// Ratio between the standard deviation of a unit normal truncated to [-2, 2] and 1.
const TRUNCATED_NORMAL_STDDEV: f64 = 0.879_625_661_034_239_78;

/// Stream words reserved per element. Each rejection-sampling attempt uses four.
const WORDS_PER_ELEMENT: u128 = 32;

/// Derives a per-parameter key from the run seed and the parameter's path.
pub fn fold_in(seed: u64, path: &str) -> u64 {
    // FNV-1a over the path, mixed with the seed.
    let mut hash: u64 = 0xcbf2_9ce4_8422_2325 ^ seed;
    for byte in path.bytes() {
        hash ^= byte as u64;
        hash = hash.wrapping_mul(0x0100_0000_01b3);
    }
    hash
}

/// A standard normal truncated to [-2, 2], drawn from element `index` of stream `key`.
fn truncated_normal(key: u64, index: usize) -> f64 {
    let mut rng = ChaCha8Rng::seed_from_u64(key);
    rng.set_word_pos(index as u128 * WORDS_PER_ELEMENT);
    loop {
        // Box-Muller; u1 in (0, 1] keeps the log finite.
        let u1 = 1.0 - rng.random::<f64>();
        let u2 = rng.random::<f64>();
        let z = (-2.0 * u1.ln()).sqrt() * (2.0 * std::f64::consts::PI * u2).cos();
        if (-2.0..=2.0).contains(&z) {
            return z;
        }
    }
}

impl ParamSpec {
    /// The initial value of flat element `index`, before dtype rounding.
    pub fn initial_value(&self, key: u64, index: usize) -> f32 {
        match &self.init {
            Initializer::Ones => 1.0,
            Initializer::HeNormal { in_axes } => {
                let fan_in: usize = in_axes.iter().map(|&a| self.shape[a]).product();
                let stddev = (2.0 / fan_in as f64).sqrt() / TRUNCATED_NORMAL_STDDEV;
                (truncated_normal(key, index) * stddev) as f32
            }
        }
    }

    /// Materializes this parameter directly into its shards.
    pub fn materialize_sharded(&self, key: u64, sharding: NamedSharding) -> Result<ShardedTensor> {
        ShardedTensor::from_fn(
            self.shape.clone(),
            self.axes.clone(),
            sharding,
            self.dtype,
            |i| self.initial_value(key, i),
        )
    }

    /// Materializes the full parameter on the host, then splits it.
    pub fn materialize_full(&self, key: u64, sharding: NamedSharding) -> Result<ShardedTensor> {
        let full: Vec<f32> = (0..self.size())
            .into_par_iter()
            .map(|i| self.initial_value(key, i))
            .collect();
        ShardedTensor::from_data(self.shape.clone(), &full, self.axes.clone(), sharding, self.dtype)
    }
}

/// Initializes every parameter onto the config's mesh.
///
/// With `low_memory`, no device ever allocates more than its own shard of a parameter.
#[instrument(skip(cfg), fields(layers = cfg.num_layers, devices = cfg.mesh.size()))]
pub fn init(cfg: &Config, seed: u64, low_memory: bool) -> Result<Weights<ShardedTensor>> {
    cfg.validate()?;
    let spec = Weights::abstract_spec(cfg);
    let shardings = spec.shardings(cfg)?;

    let weights = spec.try_zip_map(&shardings, |path, param, sharding| {
        debug!(
            path,
            shape = ?param.shape,
            sharding = %sharding.spec(),
            "initializing parameter"
        );
        let key = fold_in(seed, path);
        if low_memory {
            param.materialize_sharded(key, sharding.clone())
        } else {
            param.materialize_full(key, sharding.clone())
        }
    })?;

    info!(
        params = spec.num_params(),
        dtype = cfg.weight_dtype.name(),
        "initialized weights"
    );
    Ok(weights)
}
