//! Learning rate schedules.

use crate::config::Config;
use std::f32::consts::PI;

/// A learning rate as a function of the zero-based step.
pub trait LRScheduler {
    fn get_lr(&self, step: usize) -> f32;
}

/// Cosine Decay with Warmup.
///
/// Increases LR linearly from 0 to `max_lr` over `warmup_steps`, then follows half a cosine down
/// to `min_lr` at `total_steps`, and stays there.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CosineDecay {
    pub max_lr: f32,
    pub min_lr: f32,
    pub warmup_steps: usize,
    pub total_steps: usize,
}

impl CosineDecay {
    pub fn new(max_lr: f32, warmup_steps: usize, total_steps: usize) -> Self {
        Self {
            max_lr,
            min_lr: 0.0,
            warmup_steps,
            total_steps,
        }
    }

    pub fn with_min_lr(mut self, min_lr: f32) -> Self {
        self.min_lr = min_lr;
        self
    }

    /// The schedule described by the optimizer fields of `cfg`.
    pub fn from_config(cfg: &Config) -> Self {
        Self::new(cfg.max_lr, cfg.warmup_steps, cfg.total_steps).with_min_lr(cfg.min_lr)
    }
}

impl LRScheduler for CosineDecay {
    fn get_lr(&self, step: usize) -> f32 {
        if step < self.warmup_steps {
            self.max_lr * (step as f32 / self.warmup_steps as f32)
        } else if step < self.total_steps {
            let decay_steps = self.total_steps - self.warmup_steps;
            let progress = (step - self.warmup_steps) as f32 / decay_steps as f32;
            let cosine_decay = 0.5 * (1.0 + (progress * PI).cos());
            self.min_lr + (self.max_lr - self.min_lr) * cosine_decay
        } else {
            self.min_lr
        }
    }
}
