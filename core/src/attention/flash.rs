//! Blockwise ("flash") attention for training.
//!
//! The forward pass streams over key blocks of [`BLOCK_K`] positions, keeping a running max `m`,
//! normalizer `l` and unnormalized output per query row. Only `lse = m + ln(l)` is saved. The
//! backward pass recomputes each probability as `exp(s - lse)` and uses
//! `D = rowsum(dO * O)` in place of the row sums of `dP * P`.
//!
//! [`sharded_attention`] runs the kernel per device over that device's block of batch rows and
//! heads, as resolved from the sharding rules.

use super::{allowed, check_heads, scale, MASK_VALUE};
use crate::config::Config;
use crate::distributed::{logical_to_sharding, LogicalAxis};
use crate::error::{Error, Result};
use crate::precision::DType;
use crate::tensor::{Tensor, TensorError};
use rayon::prelude::*;
use std::ops::Range;

/// Keys processed per online-softmax step.
pub const BLOCK_K: usize = 128;

/// Segment ids and causality for one kernel call.
#[derive(Debug, Clone, Copy)]
pub struct KernelMask<'a> {
    /// `[B, T]`
    pub q_segment_ids: &'a Tensor<i32, 2>,
    /// `[B, S]`
    pub kv_segment_ids: &'a Tensor<i32, 2>,
    pub causal: bool,
}

#[inline]
fn dot(a: &[f32], b: &[f32]) -> f32 {
    a.iter().zip(b).map(|(x, y)| x * y).sum()
}

/// Forward pass for one query head over one key/value head.
#[allow(clippy::too_many_arguments)]
fn forward_head(
    q_head: &[f32],
    k_head: &[f32],
    v_head: &[f32],
    q_seg: &[i32],
    k_seg: &[i32],
    causal: bool,
    d: usize,
    out: &mut [f32],
    lse: &mut [f32],
) {
    let s_len = k_seg.len();
    let scale = scale(d);
    let mut scores = vec![0.0f32; BLOCK_K];
    let mut acc = vec![0.0f32; d];

    for (t, (out_row, lse_t)) in out.chunks_mut(d).zip(lse.iter_mut()).enumerate() {
        let q_row = &q_head[t * d..(t + 1) * d];
        let mut m = f32::NEG_INFINITY;
        let mut l = 0.0f32;
        acc.iter_mut().for_each(|a| *a = 0.0);

        for start in (0..s_len).step_by(BLOCK_K) {
            let end = (start + BLOCK_K).min(s_len);
            let block = &mut scores[..end - start];
            let mut block_max = f32::NEG_INFINITY;
            for (j, score) in block.iter_mut().enumerate() {
                let pos = start + j;
                *score = if allowed(q_seg[t], k_seg[pos], t, pos, causal) {
                    dot(q_row, &k_head[pos * d..(pos + 1) * d]) * scale
                } else {
                    MASK_VALUE
                };
                block_max = block_max.max(*score);
            }

            let m_new = m.max(block_max);
            let correction = (m - m_new).exp();
            l *= correction;
            acc.iter_mut().for_each(|a| *a *= correction);
            for (j, &score) in block.iter().enumerate() {
                let p = (score - m_new).exp();
                l += p;
                let v_row = &v_head[(start + j) * d..(start + j + 1) * d];
                acc.iter_mut().zip(v_row).for_each(|(a, v)| *a += p * v);
            }
            m = m_new;
        }

        let inv = 1.0 / l;
        out_row.iter_mut().zip(&acc).for_each(|(o, a)| *o = a * inv);
        *lse_t = m + l.ln();
    }
}

/// Backward pass for one query head, accumulating into its key/value head's gradients.
#[allow(clippy::too_many_arguments)]
fn backward_head(
    q_head: &[f32],
    k_head: &[f32],
    v_head: &[f32],
    o_head: &[f32],
    do_head: &[f32],
    lse: &[f32],
    q_seg: &[i32],
    k_seg: &[i32],
    causal: bool,
    d: usize,
    dq_head: &mut [f32],
    dk_head: &mut [f32],
    dv_head: &mut [f32],
) {
    let s_len = k_seg.len();
    let scale = scale(d);

    for t in 0..lse.len() {
        let q_row = &q_head[t * d..(t + 1) * d];
        let do_row = &do_head[t * d..(t + 1) * d];
        let delta = dot(do_row, &o_head[t * d..(t + 1) * d]);
        let dq_row = &mut dq_head[t * d..(t + 1) * d];
        // With every key masked the sentinel swamps ln(S) in f32, so the saved lse cannot
        // recover the uniform row.
        let uniform = (lse[t] <= MASK_VALUE / 2.0).then(|| 1.0 / s_len as f32);

        for pos in 0..s_len {
            let k_row = &k_head[pos * d..(pos + 1) * d];
            let v_row = &v_head[pos * d..(pos + 1) * d];
            let score = if allowed(q_seg[t], k_seg[pos], t, pos, causal) {
                dot(q_row, k_row) * scale
            } else {
                MASK_VALUE
            };
            let p = uniform.unwrap_or_else(|| (score - lse[t]).exp());
            if p == 0.0 {
                continue;
            }
            let dp = dot(do_row, v_row);
            let ds = p * (dp - delta) * scale;
            for i in 0..d {
                dv_head[pos * d + i] += p * do_row[i];
                dq_row[i] += ds * k_row[i];
                dk_head[pos * d + i] += ds * q_row[i];
            }
        }
    }
}

fn check_mask(mask: &KernelMask<'_>, b: usize, t: usize, s: usize) -> Result<()> {
    if mask.q_segment_ids.shape() != &[b, t] || mask.kv_segment_ids.shape() != &[b, s] {
        return Err(TensorError::ShapeMismatch {
            expected: vec![b, t, s],
            got: [
                mask.q_segment_ids.shape().as_slice(),
                mask.kv_segment_ids.shape().as_slice(),
            ]
            .concat(),
        }
        .into());
    }
    Ok(())
}

/// Flash attention over the whole batch on one device.
///
/// Returns the output rounded to `dtype` and the `[B, H_q, T]` log-sum-exp.
pub fn flash_attention(
    q: &Tensor<f32, 4>,
    k: &Tensor<f32, 4>,
    v: &Tensor<f32, 4>,
    mask: KernelMask<'_>,
    dtype: DType,
) -> Result<(Tensor<f32, 4>, Tensor<f32, 3>)> {
    let [b, h_q, _, _] = *q.shape();
    let block = KernelBlock {
        batches: 0..b,
        kv_heads: 0..h_q / check_heads(q, k, v)?,
    };
    let (out, lse) = block.forward(q, k, v, mask, dtype)?;
    Ok((Tensor::new(out, *q.shape())?, Tensor::new(lse, [b, h_q, q.shape()[2]])?))
}

/// Gradients of [`flash_attention`] with respect to `q`, `k` and `v`.
pub fn flash_attention_backward(
    q: &Tensor<f32, 4>,
    k: &Tensor<f32, 4>,
    v: &Tensor<f32, 4>,
    out: &Tensor<f32, 4>,
    lse: &Tensor<f32, 3>,
    d_out: &Tensor<f32, 4>,
    mask: KernelMask<'_>,
) -> Result<(Tensor<f32, 4>, Tensor<f32, 4>, Tensor<f32, 4>)> {
    let n_rep = check_heads(q, k, v)?;
    let block = KernelBlock {
        batches: 0..q.shape()[0],
        kv_heads: 0..q.shape()[1] / n_rep,
    };
    let mut grads = [
        Tensor::zeros(*q.shape()),
        Tensor::zeros(*k.shape()),
        Tensor::zeros(*k.shape()),
    ];
    block.backward(q, k, v, out, lse, d_out, mask, &mut grads)?;
    let [dq, dk, dv] = grads;
    Ok((dq, dk, dv))
}

/// The batch rows and key/value heads one device computes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KernelBlock {
    pub batches: Range<usize>,
    pub kv_heads: Range<usize>,
}

impl KernelBlock {
    /// Forward over this block: local output `[nb, nh_q, T, D]` and log-sum-exp `[nb, nh_q, T]`.
    fn forward(
        &self,
        q: &Tensor<f32, 4>,
        k: &Tensor<f32, 4>,
        v: &Tensor<f32, 4>,
        mask: KernelMask<'_>,
        dtype: DType,
    ) -> Result<(Vec<f32>, Vec<f32>)> {
        let n_rep = check_heads(q, k, v)?;
        let [b, h_q, t, d] = *q.shape();
        let [_, h_kv, s, _] = *k.shape();
        check_mask(&mask, b, t, s)?;

        let groups = self.batches.len() * self.kv_heads.len();
        let mut out = vec![0.0; groups * n_rep * t * d];
        let mut lse = vec![0.0; groups * n_rep * t];
        if t == 0 || d == 0 || s == 0 {
            return Ok((out, lse));
        }

        out.par_chunks_mut(n_rep * t * d)
            .zip(lse.par_chunks_mut(n_rep * t))
            .enumerate()
            .for_each(|(g, (out_group, lse_group))| {
                let batch = self.batches.start + g / self.kv_heads.len();
                let kv_head = self.kv_heads.start + g % self.kv_heads.len();
                let kv = (batch * h_kv + kv_head) * s * d;
                let q_seg = &mask.q_segment_ids.data()[batch * t..(batch + 1) * t];
                let k_seg = &mask.kv_segment_ids.data()[batch * s..(batch + 1) * s];
                for r in 0..n_rep {
                    let bh = batch * h_q + kv_head * n_rep + r;
                    forward_head(
                        &q.data()[bh * t * d..(bh + 1) * t * d],
                        &k.data()[kv..kv + s * d],
                        &v.data()[kv..kv + s * d],
                        q_seg,
                        k_seg,
                        mask.causal,
                        d,
                        &mut out_group[r * t * d..(r + 1) * t * d],
                        &mut lse_group[r * t..(r + 1) * t],
                    );
                }
                dtype.round_slice(out_group);
            });
        Ok((out, lse))
    }

    /// Backward over this block, writing into the global gradient buffers `[dq, dk, dv]`.
    ///
    /// Blocks of different devices own disjoint rows of every gradient.
    #[allow(clippy::too_many_arguments)]
    fn backward(
        &self,
        q: &Tensor<f32, 4>,
        k: &Tensor<f32, 4>,
        v: &Tensor<f32, 4>,
        out: &Tensor<f32, 4>,
        lse: &Tensor<f32, 3>,
        d_out: &Tensor<f32, 4>,
        mask: KernelMask<'_>,
        grads: &mut [Tensor<f32, 4>; 3],
    ) -> Result<()> {
        let n_rep = check_heads(q, k, v)?;
        let [b, h_q, t, d] = *q.shape();
        let [_, h_kv, s, _] = *k.shape();
        check_mask(&mask, b, t, s)?;
        if out.shape() != q.shape() || d_out.shape() != q.shape() || lse.shape() != &[b, h_q, t] {
            return Err(TensorError::ShapeMismatch {
                expected: q.shape().to_vec(),
                got: d_out.shape().to_vec(),
            }
            .into());
        }
        if t == 0 || d == 0 || s == 0 {
            return Ok(());
        }

        let [dq, dk, dv] = grads;
        dq.data_mut()
            .par_chunks_mut(n_rep * t * d)
            .zip(dk.data_mut().par_chunks_mut(s * d))
            .zip(dv.data_mut().par_chunks_mut(s * d))
            .enumerate()
            .filter(|(group, _)| {
                self.batches.contains(&(group / h_kv)) && self.kv_heads.contains(&(group % h_kv))
            })
            .for_each(|(group, ((dq_group, dk_head), dv_head))| {
                let batch = group / h_kv;
                let kv = group * s * d;
                let q_seg = &mask.q_segment_ids.data()[batch * t..(batch + 1) * t];
                let k_seg = &mask.kv_segment_ids.data()[batch * s..(batch + 1) * s];
                for r in 0..n_rep {
                    let bh = group * n_rep + r;
                    let rows = bh * t * d..(bh + 1) * t * d;
                    backward_head(
                        &q.data()[rows.clone()],
                        &k.data()[kv..kv + s * d],
                        &v.data()[kv..kv + s * d],
                        &out.data()[rows.clone()],
                        &d_out.data()[rows],
                        &lse.data()[bh * t..(bh + 1) * t],
                        q_seg,
                        k_seg,
                        mask.causal,
                        d,
                        &mut dq_group[r * t * d..(r + 1) * t * d],
                        dk_head,
                        dv_head,
                    );
                }
            });
        Ok(())
    }
}

/// Splits `[B, H_q, T, D]` attention into one block per device.
///
/// The batch and query-head axes follow the sharding rules; the sequence and key_dim axes must be
/// replicated, and each device's head range must cover whole key/value groups.
pub fn device_blocks(cfg: &Config, batch: usize, seq_len: usize) -> Result<Vec<KernelBlock>> {
    let axes = [
        LogicalAxis::Batch,
        LogicalAxis::QueryHeads,
        LogicalAxis::Sequence,
        LogicalAxis::KeyDim,
    ];
    let shape = [batch, cfg.query_heads, seq_len, cfg.key_dim];
    let sharding = logical_to_sharding(&axes, &shape, &cfg.rules, &cfg.mesh)?;
    if let Some(dim @ (2 | 3)) = sharding.sharded_dim() {
        return Err(Error::Config(format!(
            "the attention kernel needs `{}` unsharded",
            axes[dim]
        )));
    }

    let n_rep = cfg.group_size();
    (0..sharding.num_devices())
        .map(|device| {
            let ranges = sharding.shard_ranges(device, &shape)?;
            let heads = &ranges[1];
            if heads.start % n_rep != 0 || heads.end % n_rep != 0 {
                return Err(Error::Config(format!(
                    "query heads {heads:?} split a group of {n_rep} heads sharing a key/value head"
                )));
            }
            Ok(KernelBlock {
                batches: ranges[0].clone(),
                kv_heads: heads.start / n_rep..heads.end / n_rep,
            })
        })
        .collect()
}

/// Flash attention with each device computing its own block, like a shard map.
///
/// A replicated mesh computes the same block on every device; only device 0's copy is kept.
pub fn sharded_attention(
    q: &Tensor<f32, 4>,
    k: &Tensor<f32, 4>,
    v: &Tensor<f32, 4>,
    mask: KernelMask<'_>,
    cfg: &Config,
) -> Result<(Tensor<f32, 4>, Tensor<f32, 3>)> {
    let [b, h_q, t, d] = *q.shape();
    let mut blocks = device_blocks(cfg, b, t)?;
    blocks.dedup();
    let n_rep = check_heads(q, k, v)?;

    let results = blocks
        .par_iter()
        .map(|block| block.forward(q, k, v, mask, cfg.activation_dtype))
        .collect::<Result<Vec<_>>>()?;

    let mut out = Tensor::zeros([b, h_q, t, d]);
    let mut lse = Tensor::zeros([b, h_q, t]);
    for (block, (local_out, local_lse)) in blocks.iter().zip(results) {
        let heads = block.kv_heads.len() * n_rep;
        for (i, batch) in block.batches.clone().enumerate() {
            let first = batch * h_q + block.kv_heads.start * n_rep;
            let src = i * heads;
            out.data_mut()[first * t * d..(first + heads) * t * d]
                .copy_from_slice(&local_out[src * t * d..(src + heads) * t * d]);
            lse.data_mut()[first * t..(first + heads) * t]
                .copy_from_slice(&local_lse[src * t..(src + heads) * t]);
        }
    }
    Ok((out, lse))
}

/// Gradients of [`sharded_attention`], each device handling the block it computed.
#[allow(clippy::too_many_arguments)]
pub fn sharded_attention_backward(
    q: &Tensor<f32, 4>,
    k: &Tensor<f32, 4>,
    v: &Tensor<f32, 4>,
    out: &Tensor<f32, 4>,
    lse: &Tensor<f32, 3>,
    d_out: &Tensor<f32, 4>,
    mask: KernelMask<'_>,
    cfg: &Config,
) -> Result<(Tensor<f32, 4>, Tensor<f32, 4>, Tensor<f32, 4>)> {
    let mut blocks = device_blocks(cfg, q.shape()[0], q.shape()[2])?;
    blocks.dedup();
    let mut grads = [
        Tensor::zeros(*q.shape()),
        Tensor::zeros(*k.shape()),
        Tensor::zeros(*k.shape()),
    ];
    for block in &blocks {
        block.backward(q, k, v, out, lse, d_out, mask, &mut grads)?;
    }
    let [dq, dk, dv] = grads;
    Ok((dq, dk, dv))
}
