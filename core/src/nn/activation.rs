//! Activation functions.
//!
//! The feed-forward sublayer uses the tanh approximation of GELU:
//!
//! $$ \text{GELU}(x) \approx 0.5 x (1 + \tanh[\sqrt{2/\pi} (x + 0.044715 x^3)]) $$

use crate::tensor::Tensor;

const SQRT_2_OVER_PI: f32 = 0.797_884_6;
const GELU_COEF: f32 = 0.044715;

/// GELU, tanh approximation.
#[inline]
pub fn gelu(x: f32) -> f32 {
    let inner = SQRT_2_OVER_PI * (x + GELU_COEF * x * x * x);
    0.5 * x * (1.0 + inner.tanh())
}

/// Derivative of [`gelu`] at `x`.
#[inline]
pub fn gelu_grad(x: f32) -> f32 {
    let inner = SQRT_2_OVER_PI * (x + GELU_COEF * x * x * x);
    let t = inner.tanh();
    0.5 * (1.0 + t) + 0.5 * x * (1.0 - t * t) * SQRT_2_OVER_PI * (1.0 + 3.0 * GELU_COEF * x * x)
}

/// Element-wise GELU activations.
pub struct Activation;

impl Activation {
    pub fn gelu<const RANK: usize>(x: &Tensor<f32, RANK>) -> Tensor<f32, RANK> {
        x.map(gelu)
    }

    /// Multiplies `dy` by the GELU derivative at the pre-activation `x`.
    pub fn gelu_backward<const RANK: usize>(
        x: &Tensor<f32, RANK>,
        dy: &Tensor<f32, RANK>,
    ) -> crate::tensor::Result<Tensor<f32, RANK>> {
        &x.map(gelu_grad) * dy
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gelu_value() {
        assert!(gelu(0.0).abs() < 1e-6);
        // gelu(1) is approximately 0.8412 under the tanh approximation.
        assert!((gelu(1.0) - 0.8412).abs() < 1e-3);
        assert!(gelu(-10.0).abs() < 1e-4);
    }

    #[test]
    fn test_gelu_grad_matches_finite_differences() {
        for &x in &[-3.0f32, -1.0, -0.1, 0.0, 0.4, 2.5] {
            let h = 1e-3;
            let numeric = (gelu(x + h) - gelu(x - h)) / (2.0 * h);
            assert!((numeric - gelu_grad(x)).abs() < 1e-3, "x = {x}");
        }
    }

    #[test]
    fn test_tensor_backward() {
        let x = Tensor::<f32, 1>::new(vec![0.0, 1.0], [2]).unwrap();
        let dy = Tensor::<f32, 1>::new(vec![2.0, 2.0], [2]).unwrap();
        let dx = Activation::gelu_backward(&x, &dy).unwrap();
        assert!((dx.data()[0] - 1.0).abs() < 1e-6);
    }
}
