use crate::distributed::ShardedTensor;
use crate::error::{Error, Result};
use crate::model::Weights;
use crate::precision::DType;
use rayon::prelude::*;

/// First and second moments, one pair per parameter, placed exactly like the parameters.
#[derive(Debug, Clone, PartialEq)]
pub struct AdamState {
    pub m: Weights<ShardedTensor>,
    pub v: Weights<ShardedTensor>,
}

impl AdamState {
    /// Zero moments, stored in f32 whatever the weight dtype.
    pub fn init(weights: &Weights<ShardedTensor>) -> Self {
        let zeros = weights.map(|p| p.zeros_like(DType::F32));
        Self {
            m: zeros.clone(),
            v: zeros,
        }
    }
}

/// Adam optimizer, without weight decay.
///
/// # Formula
///
/// $$
/// \begin{aligned}
/// & m_t = \beta_1 m_{t-1} + (1 - \beta_1) g_t \\
/// & v_t = \beta_2 v_{t-1} + (1 - \beta_2) g_t^2 \\
/// & \hat{m}_t = m_t / (1 - \beta_1^{t+1}) \\
/// & \hat{v}_t = v_t / (1 - \beta_2^{t+1}) \\
/// & \theta_t = \theta_{t-1} - \eta \hat{m}_t / (\sqrt{\hat{v}_t} + \epsilon)
/// \end{aligned}
/// $$
///
/// `t` is the zero-based step index.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Adam {
    pub beta1: f32,
    pub beta2: f32,
    pub epsilon: f32,
}

impl Default for Adam {
    fn default() -> Self {
        Self {
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-8,
        }
    }
}

impl Adam {
    pub fn with_betas(mut self, beta1: f32, beta2: f32) -> Self {
        self.beta1 = beta1;
        self.beta2 = beta2;
        self
    }

    pub fn with_epsilon(mut self, epsilon: f32) -> Self {
        self.epsilon = epsilon;
        self
    }

    /// `1 - beta^(step + 1)` for both moments, with the power taken in f64.
    fn bias_corrections(&self, step: usize) -> (f32, f32) {
        let t = step as f64 + 1.0;
        let correct = |beta: f32| (1.0 - f64::from(beta).powf(t)) as f32;
        (correct(self.beta1), correct(self.beta2))
    }

    /// Applies one update to every parameter, shard by shard.
    ///
    /// Parameters are re-rounded to their storage dtype afterwards.
    pub fn update(
        &self,
        weights: &mut Weights<ShardedTensor>,
        grads: &Weights<ShardedTensor>,
        state: &mut AdamState,
        step: usize,
        lr: f32,
    ) -> Result<()> {
        let (bias1, bias2) = self.bias_corrections(step);
        let (b1, b2, eps) = (self.beta1, self.beta2, self.epsilon);

        let params = weights.leaves_mut();
        let grads = grads.leaves();
        let ms = state.m.leaves_mut();
        let vs = state.v.leaves_mut();
        if params.len() != grads.len() || params.len() != ms.len() || params.len() != vs.len() {
            return Err(Error::Config(
                "optimizer state does not match the parameter tree".to_string(),
            ));
        }

        for (((param, (path, grad)), m), v) in params.into_iter().zip(grads).zip(ms).zip(vs) {
            if param.shape() != grad.shape() || param.sharding() != grad.sharding() {
                return Err(Error::Config(format!(
                    "gradient for {path} does not match its parameter's layout"
                )));
            }
            let dtype = param.dtype();
            param
                .shards_mut()
                .par_iter_mut()
                .zip(grad.shards().par_iter())
                .zip(m.shards_mut().par_iter_mut())
                .zip(v.shards_mut().par_iter_mut())
                .for_each(|(((p, g), m), v)| {
                    for i in 0..p.len() {
                        m[i] = b1 * m[i] + (1.0 - b1) * g[i];
                        v[i] = b2 * v[i] + (1.0 - b2) * g[i] * g[i];
                        let m_hat = m[i] / bias1;
                        let v_hat = v[i] / bias2;
                        p[i] = dtype.round(p[i] - lr * m_hat / (v_hat.sqrt() + eps));
                    }
                });
        }
        Ok(())
    }
}
