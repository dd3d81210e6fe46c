//! # Attention
//!
//! Two implementations of masked scaled dot-product attention over `[B, H, T, D]` heads:
//!
//! - [`reference`]: materializes the full `[T, S]` score matrix per head. Works with or without a
//!   KV cache and keeps the probabilities for its backward pass.
//! - [`flash`]: blockwise online softmax that never holds more than one key block of scores.
//!   Training only; its backward pass recomputes probabilities from the saved log-sum-exp.
//!
//! Both take the same masking inputs. Segment id 0 is padding and attends to nothing; otherwise a
//! query may attend to a key in the same segment, and under `causal` only to keys at or before its
//! absolute position. Disallowed logits are replaced by [`MASK_VALUE`] rather than `-inf`, so a
//! row with nothing to attend to degrades to a uniform average instead of NaN.
//!
//! Grouped-query attention: query head `h` reads key/value head `h / (H_q / H_kv)`.

pub mod flash;
pub mod reference;

use crate::error::{Error, Result};
use crate::tensor::{Tensor, TensorError};

/// Logit assigned to masked positions.
pub const MASK_VALUE: f32 = -1e30;

/// Softmax temperature: `key_dim^-0.5`.
pub fn scale(key_dim: usize) -> f32 {
    (key_dim as f32).powf(-0.5)
}

/// Whether a query at absolute position `q_pos` in segment `q_seg` may see a key at `k_pos` in
/// segment `k_seg`.
#[inline]
pub fn allowed(q_seg: i32, k_seg: i32, q_pos: usize, k_pos: usize, causal: bool) -> bool {
    q_seg != 0 && q_seg == k_seg && (!causal || q_pos >= k_pos)
}

/// A dense `[B, T, S]` attention mask.
#[derive(Debug, Clone, PartialEq)]
pub struct AttentionMask {
    batch: usize,
    q_len: usize,
    k_len: usize,
    allowed: Vec<bool>,
}

impl AttentionMask {
    /// Builds the mask from per-position segment ids.
    ///
    /// `q_offset[b]` is the absolute position of row `b`'s first query: the prior cache length
    /// when decoding, zero otherwise.
    pub fn new(
        q_segment_ids: &Tensor<i32, 2>,
        k_segment_ids: &Tensor<i32, 2>,
        q_offset: &[usize],
        causal: bool,
    ) -> Result<Self> {
        let [batch, q_len] = *q_segment_ids.shape();
        let [k_batch, k_len] = *k_segment_ids.shape();
        if k_batch != batch || q_offset.len() != batch {
            return Err(TensorError::ShapeMismatch {
                expected: vec![batch],
                got: vec![k_batch, q_offset.len()],
            }
            .into());
        }
        let qs = q_segment_ids.data();
        let ks = k_segment_ids.data();
        let mut allowed_mask = Vec::with_capacity(batch * q_len * k_len);
        for b in 0..batch {
            for t in 0..q_len {
                let q = qs[b * q_len + t];
                for s in 0..k_len {
                    allowed_mask.push(allowed(q, ks[b * k_len + s], q_offset[b] + t, s, causal));
                }
            }
        }
        Ok(Self {
            batch,
            q_len,
            k_len,
            allowed: allowed_mask,
        })
    }

    /// Every query sees every key.
    pub fn unmasked(batch: usize, q_len: usize, k_len: usize) -> Self {
        Self {
            batch,
            q_len,
            k_len,
            allowed: vec![true; batch * q_len * k_len],
        }
    }

    pub fn shape(&self) -> [usize; 3] {
        [self.batch, self.q_len, self.k_len]
    }

    /// The `[T, S]` block of row `b`.
    pub fn row(&self, b: usize) -> &[bool] {
        let n = self.q_len * self.k_len;
        &self.allowed[b * n..(b + 1) * n]
    }
}

/// What one implementation keeps from its forward pass for the backward pass.
#[derive(Debug, Clone)]
pub enum AttentionResidual {
    /// `[B, H_q, T, S]` probabilities.
    Probs(Tensor<f32, 4>),
    /// `[B, H_q, T]` per-row log-sum-exp.
    LogSumExp(Tensor<f32, 3>),
}

/// Checks q/k/v agree and returns the number of query heads per key/value head.
pub(crate) fn check_heads(
    q: &Tensor<f32, 4>,
    k: &Tensor<f32, 4>,
    v: &Tensor<f32, 4>,
) -> Result<usize> {
    let [b, hq, _, d] = *q.shape();
    let [kb, hk, _, kd] = *k.shape();
    if k.shape() != v.shape() || kb != b || kd != d {
        return Err(TensorError::ShapeMismatch {
            expected: vec![b, hk, k.shape()[2], d],
            got: v.shape().to_vec(),
        }
        .into());
    }
    if hk == 0 || hq % hk != 0 {
        return Err(Error::Config(format!(
            "{hq} query heads cannot be grouped over {hk} key/value heads"
        )));
    }
    Ok(hq / hk)
}
