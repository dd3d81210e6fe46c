//! CPU compute kernels for `minformer`.
//!
//! Every dense contraction in the model (projections, feed-forward, attention scores in the
//! reference path and all weight gradients) bottoms out in [`sgemm`], which wraps the
//! `matrixmultiply` packed GEMM. Buffers are row-major and contiguous; transposition is expressed
//! through strides rather than copies.

use thiserror::Error;

pub mod cpu_gemm;

pub use cpu_gemm::{sgemm, Transpose};

#[derive(Error, Debug)]
pub enum KernelError {
    #[error("Shape mismatch: expected {expected:?}, got {got:?}")]
    ShapeMismatch {
        expected: Vec<usize>,
        got: Vec<usize>,
    },
}

pub type Result<T> = std::result::Result<T, KernelError>;
