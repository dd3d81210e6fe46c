//! Key/value cache for incremental decoding.
//!
//! Per layer, keys and values are stored as `[B, H_kv, L, D]` sharded tensors over
//! `(batch, key_heads, sequence, key_dim)`, with `L = max_seq_len`. `lengths[b]` counts the
//! positions of row `b` holding valid entries; anything at or past it is zeroed by the next update
//! that touches the row.

use crate::config::Config;
use crate::distributed::{logical_to_sharding, LogicalAxis, NamedSharding, ShardedTensor};
use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorError};
use rayon::prelude::*;
use tracing::debug;

/// The cache for every layer of one decoding session.
#[derive(Debug, Clone, PartialEq)]
pub struct KvCache {
    pub k: Vec<ShardedTensor>,
    pub v: Vec<ShardedTensor>,
    /// Valid positions per batch row.
    pub lengths: Vec<usize>,
}

impl KvCache {
    /// Index of the time axis in each per-layer tensor.
    pub const fn time_axis() -> usize {
        2
    }

    pub fn shape(cfg: &Config, batch: usize) -> [usize; 4] {
        [batch, cfg.key_heads, cfg.max_seq_len, cfg.key_dim]
    }

    pub fn logical_axes() -> [LogicalAxis; 4] {
        [
            LogicalAxis::Batch,
            LogicalAxis::KeyHeads,
            LogicalAxis::Sequence,
            LogicalAxis::KeyDim,
        ]
    }

    /// Placement of each per-layer tensor.
    pub fn shardings(cfg: &Config, batch: usize) -> Result<NamedSharding> {
        logical_to_sharding(
            &Self::logical_axes(),
            &Self::shape(cfg, batch),
            &cfg.rules,
            &cfg.mesh,
        )
    }

    /// An empty cache, zeroed, with every length at 0.
    pub fn init(cfg: &Config, batch: usize) -> Result<Self> {
        let sharding = Self::shardings(cfg, batch)?;
        let layer = ShardedTensor::zeros(
            Self::shape(cfg, batch).to_vec(),
            Self::logical_axes().to_vec(),
            sharding,
            cfg.activation_dtype,
        )?;
        debug!(
            batch,
            layers = cfg.num_layers,
            sharding = %layer.sharding().spec(),
            "allocated kv cache"
        );
        Ok(Self {
            k: vec![layer.clone(); cfg.num_layers],
            v: vec![layer; cfg.num_layers],
            lengths: vec![0; batch],
        })
    }

    pub fn batch_size(&self) -> usize {
        self.lengths.len()
    }

    pub fn num_layers(&self) -> usize {
        self.k.len()
    }

    /// Capacity of every row.
    pub fn max_len(&self) -> usize {
        self.k
            .first()
            .map_or(0, |k| k.shape()[Self::time_axis()])
    }

    /// Forgets row `row`. Its stale entries are zeroed by the next update.
    pub fn reset_row(&mut self, row: usize) -> Result<()> {
        let batch = self.batch_size();
        let len = self.lengths.get_mut(row).ok_or(TensorError::IndexOutOfBounds {
            index: vec![row],
            shape: vec![batch],
        })?;
        *len = 0;
        Ok(())
    }

    /// Checks that a chunk of `chunk_len` positions fits every row that has valid tokens in it.
    pub(crate) fn check_capacity(&self, valid: &[usize], chunk_len: usize) -> Result<()> {
        let max = self.max_len();
        for (row, (&len, &n)) in self.lengths.iter().zip(valid).enumerate() {
            if n > 0 && len + chunk_len > max {
                return Err(Error::SequenceOverflow {
                    row,
                    end: len + chunk_len,
                    max,
                });
            }
        }
        Ok(())
    }

    /// Rotary start position of each row: its length, or 0 for rows this chunk does not touch.
    pub(crate) fn positions(&self, valid: &[usize]) -> Vec<usize> {
        self.lengths
            .iter()
            .zip(valid)
            .map(|(&len, &n)| if n > 0 { len } else { 0 })
            .collect()
    }

    /// `[B, L]` key segment ids after this chunk: 1 below `lengths + valid`, 0 elsewhere.
    pub(crate) fn key_segments(&self, valid: &[usize]) -> Result<Tensor<i32, 2>> {
        let max = self.max_len();
        let ends: Vec<usize> = self.lengths.iter().zip(valid).map(|(l, n)| l + n).collect();
        Ok(Tensor::new(
            ends.iter()
                .flat_map(|&end| (0..max).map(move |pos| i32::from(pos < end)))
                .collect(),
            [self.batch_size(), max],
        )?)
    }

    /// Writes one layer's new keys and values and returns the full cached tensors.
    ///
    /// `new_k`/`new_v` are `[B, H_kv, T, D]`. Row `b` lands at positions `lengths[b]..` of each
    /// device's shard; positions at or past `lengths[b] + valid[b]` are then zeroed. Rows with no
    /// valid tokens are left as they are.
    pub(crate) fn update_layer(
        &mut self,
        layer: usize,
        new_k: &Tensor<f32, 4>,
        new_v: &Tensor<f32, 4>,
        valid: &[usize],
    ) -> Result<(Tensor<f32, 4>, Tensor<f32, 4>)> {
        let lengths = self.lengths.clone();
        let cache_k = self
            .k
            .get_mut(layer)
            .ok_or_else(|| Error::Config(format!("the cache has no layer {layer}")))?;
        write_chunk(cache_k, new_k, &lengths, valid)?;
        let cache_v = &mut self.v[layer];
        write_chunk(cache_v, new_v, &lengths, valid)?;
        Ok((self.k[layer].gather()?, self.v[layer].gather()?))
    }

    /// Advances every row by its count of valid tokens.
    pub(crate) fn advance(&mut self, valid: &[usize]) {
        for (len, n) in self.lengths.iter_mut().zip(valid) {
            *len += n;
        }
    }
}

/// Per-device dynamic update of one cached tensor.
fn write_chunk(
    cache: &mut ShardedTensor,
    new: &Tensor<f32, 4>,
    lengths: &[usize],
    valid: &[usize],
) -> Result<()> {
    let [b, h, t, d] = *new.shape();
    let shape = cache.shape().to_vec();
    if shape[0] != b || shape[1] != h || shape[3] != d {
        return Err(TensorError::ShapeMismatch {
            expected: shape,
            got: new.shape().to_vec(),
        }
        .into());
    }
    let ranges = (0..cache.sharding().num_devices())
        .map(|device| cache.shard_ranges(device))
        .collect::<Result<Vec<_>>>()?;
    let dtype = cache.dtype();
    let src = new.data();

    cache
        .shards_mut()
        .par_iter_mut()
        .zip(ranges.par_iter())
        .for_each(|(shard, r)| {
            let (nh, nl, nd) = (r[1].len(), r[2].len(), r[3].len());
            for (lb, gb) in r[0].clone().enumerate() {
                if valid[gb] == 0 {
                    continue;
                }
                let start = lengths[gb];
                let end = start + valid[gb];
                for (lh, gh) in r[1].clone().enumerate() {
                    for (lp, gp) in r[2].clone().enumerate() {
                        let dst = ((lb * nh + lh) * nl + lp) * nd;
                        let row = &mut shard[dst..dst + nd];
                        if gp < end {
                            if gp >= start {
                                let s = ((gb * h + gh) * t + (gp - start)) * d;
                                for (o, &x) in row.iter_mut().zip(&src[s + r[3].start..s + r[3].end]) {
                                    *o = dtype.round(x);
                                }
                            }
                        } else {
                            row.iter_mut().for_each(|x| *x = 0.0);
                        }
                    }
                }
            }
        });
    Ok(())
}
