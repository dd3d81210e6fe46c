//! One optimizer step: forward with a tape, masked cross-entropy, backward, Adam.

use crate::config::Config;
use crate::distributed::{logical_to_sharding, LogicalAxis, NamedSharding, ShardedTensor};
use crate::error::{Error, Result};
use crate::loss::cross_entropy_loss;
use crate::model::{backward, forward_with_tape, Weights};
use crate::optim::{Adam, AdamState, CosineDecay, LRScheduler};
use crate::tensor::{Tensor, TensorError};
use tracing::{debug, instrument};

/// Next-token training inputs.
#[derive(Debug, Clone, PartialEq)]
pub struct Batch {
    /// `[B, T]` input token ids.
    pub x: Tensor<i32, 2>,
    /// `[B, T]`; 0 is padding, other values separate packed sequences.
    pub segment_ids: Tensor<i32, 2>,
    /// `[B, T]` target token ids.
    pub y: Tensor<i32, 2>,
}

impl Batch {
    pub fn new(x: Tensor<i32, 2>, segment_ids: Tensor<i32, 2>, y: Tensor<i32, 2>) -> Result<Self> {
        if segment_ids.shape() != x.shape() || y.shape() != x.shape() {
            return Err(TensorError::ShapeMismatch {
                expected: x.shape().to_vec(),
                got: y.shape().to_vec(),
            }
            .into());
        }
        Ok(Self { x, segment_ids, y })
    }

    /// `[B, T]`
    pub fn shape(&self) -> [usize; 2] {
        *self.x.shape()
    }
}

/// Where each input array of a step lives.
#[derive(Debug, Clone, PartialEq)]
pub struct InputShardings {
    pub x: NamedSharding,
    pub segment_ids: NamedSharding,
    pub y: NamedSharding,
}

/// Shardings of a `[batch, seq]` step's inputs over `(batch, sequence)`.
///
/// Fails with `Error::IndivisibleAxis` when the batch does not split over the mesh.
pub fn input_shardings(cfg: &Config, batch: usize, seq: usize) -> Result<InputShardings> {
    let sharding = logical_to_sharding(
        &[LogicalAxis::Batch, LogicalAxis::Sequence],
        &[batch, seq],
        &cfg.rules,
        &cfg.mesh,
    )?;
    Ok(InputShardings {
        x: sharding.clone(),
        segment_ids: sharding.clone(),
        y: sharding,
    })
}

/// What one step reports.
#[derive(Debug, Clone)]
pub struct StepMetrics {
    pub loss: f32,
    pub accuracy: f32,
    pub lr: f32,
    /// L2 norm of each parameter's gradient.
    pub grad_norms: Weights<f32>,
    /// `[B, T]`, zero at padding.
    pub per_token_loss: Tensor<f32, 2>,
}

impl StepMetrics {
    /// Global gradient norm over every parameter.
    pub fn grad_norm(&self) -> f32 {
        self.grad_norms
            .leaves()
            .into_iter()
            .map(|(_, n)| n * n)
            .sum::<f32>()
            .sqrt()
    }
}

/// Runs one training step at the zero-based index `step`.
///
/// `weights` and `opt_state` are only modified once the loss and every gradient have been
/// computed, so a failed step leaves both untouched.
#[instrument(skip_all, fields(step = step))]
pub fn update_step(
    weights: &mut Weights<ShardedTensor>,
    batch: &Batch,
    opt_state: &mut AdamState,
    step: usize,
    cfg: &Config,
) -> Result<StepMetrics> {
    let [b, t] = batch.shape();
    input_shardings(cfg, b, t)?;
    if batch.segment_ids.data().iter().all(|&s| s == 0) {
        return Err(Error::NoValidTokens);
    }

    let (logits, tape) = forward_with_tape(&batch.x, &batch.segment_ids, weights, cfg)?;
    let out = cross_entropy_loss(&logits, &batch.y, &batch.segment_ids)?;
    let grads = backward(&tape, &out.dlogits, weights, cfg)?;
    drop(tape);

    let lr = CosineDecay::from_config(cfg).get_lr(step);
    let grad_norms = grads.l2_norms();
    Adam::default().update(weights, &grads, opt_state, step, lr)?;

    debug!(loss = out.loss, accuracy = out.accuracy, lr, "train step");
    Ok(StepMetrics {
        loss: out.loss,
        accuracy: out.accuracy,
        lr,
        grad_norms,
        per_token_loss: out.per_token_loss,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::{create_mesh, HostDevices, Mesh};
    use crate::model::init;

    fn micro(mesh: Mesh) -> Config {
        Config::tiny(mesh)
            .with_dims(16, 2, 4, 2, 1, 8, 32, 16)
            .with_attn_kernel(false)
            .with_schedule(1e-2, 1e-3, 2, 100)
    }

    fn batch(b: usize) -> Batch {
        let x = Tensor::from_fn([b, 8], |i| (i % 32) as i32);
        let y = Tensor::from_fn([b, 8], |i| ((i + 1) % 32) as i32);
        Batch::new(x, Tensor::ones([b, 8]), y).unwrap()
    }

    #[test]
    fn test_step_reports_and_updates() {
        let cfg = micro(Mesh::single_host());
        let mut weights = init(&cfg, 0, true).unwrap();
        let before = weights.clone();
        let mut state = AdamState::init(&weights);

        let metrics = update_step(&mut weights, &batch(2), &mut state, 1, &cfg).unwrap();
        assert_eq!(metrics.lr, 5e-3);
        assert!(metrics.loss.is_finite() && metrics.loss > 0.0);
        assert!(metrics.grad_norm() > 0.0);
        assert_eq!(metrics.per_token_loss.shape(), &[2, 8]);
        assert_ne!(weights, before);
    }

    #[test]
    fn test_all_padding_leaves_state_untouched() {
        let cfg = micro(Mesh::single_host());
        let mut weights = init(&cfg, 0, true).unwrap();
        let before = weights.clone();
        let mut state = AdamState::init(&weights);
        let mut empty = batch(2);
        empty.segment_ids = Tensor::zeros([2, 8]);

        let err = update_step(&mut weights, &empty, &mut state, 0, &cfg);
        assert!(matches!(err, Err(Error::NoValidTokens)));
        assert_eq!(weights, before);
        assert_eq!(state, AdamState::init(&before));
    }

    #[test]
    fn test_batch_must_split_over_mesh() {
        let mesh = create_mesh(&HostDevices::new(2)).unwrap();
        let cfg = micro(mesh);
        assert!(input_shardings(&cfg, 4, 8).is_ok());
        assert!(matches!(
            input_shardings(&cfg, 3, 8),
            Err(Error::IndivisibleAxis {
                axis: LogicalAxis::Batch,
                ..
            })
        ));
    }
}
