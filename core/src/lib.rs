//! # minformer
//!
//! A minimal decoder-only transformer whose parameters, activations and KV cache are sharded over
//! a one-dimensional device mesh. Runs on host CPU devices; every "device" owns its own buffers
//! and per-device work is spread over the rayon pool.
//!
//! ## Modules
//!
//! - [`mod@tensor`]: row-major N-dimensional tensors.
//! - [`distributed`]: device mesh, logical-axis sharding rules and sharded tensors.
//! - [`nn`]: RMSNorm, rotary embeddings, projections, GELU and embedding lookup.
//! - [`attention`]: reference attention and the blockwise flash kernel.
//! - [`model`]: the parameter tree, initialization, forward and backward.
//! - [`cache`]: the KV cache for incremental decoding.
//! - [`train`], [`loss`], [`optim`]: the training step.
//! - [`sampling`]: prompt ingestion and token-by-token generation.
//! - [`checkpoint`]: safetensors checkpoints with retention.
//!
//! ## Example
//!
//! ```rust
//! use minformer::{create_mesh, init, forward, Config, HostDevices};
//! use minformer::tensor::Tensor;
//!
//! let mesh = create_mesh(&HostDevices::new(2)).unwrap();
//! let cfg = Config::tiny(mesh).with_attn_kernel(false);
//! let weights = init(&cfg, 0, true).unwrap();
//!
//! let tokens = Tensor::<i32, 2>::from_fn([2, 8], |i| i as i32);
//! let segment_ids = Tensor::<i32, 2>::ones([2, 8]);
//! let logits = forward(&tokens, &segment_ids, &weights, &cfg, None).unwrap();
//! assert_eq!(logits.shape(), &[2, 8, cfg.vocab_size]);
//! ```

/// Macro for creating a Tensor with compile-time shape checking.
///
/// # Examples
///
/// ```rust
/// use minformer::tensor;
/// use minformer::tensor::Tensor;
///
/// // Works
/// let t: Tensor<f32, 2> = tensor!([1.0, 2.0, 3.0, 4.0], [2, 2]);
///
/// // Fails to compile:
/// // let t = tensor!([1.0, 2.0, 3.0], [2, 2]);
/// ```
#[macro_export]
macro_rules! tensor {
    ($data:expr, $shape:expr) => {{
        // Constants to force compile-time evaluation
        const DATA_LEN: usize = (&$data as &[_]).len();
        const SHAPE: [usize; (&$shape as &[_]).len()] = $shape;
        const EXPECTED_SIZE: usize = {
            let mut size = 1;
            let mut i = 0;
            while i < (&SHAPE as &[_]).len() {
                size *= SHAPE[i];
                i += 1;
            }
            size
        };

        // This assertion triggers a compile-time error if false
        const _: () = assert!(
            DATA_LEN == EXPECTED_SIZE,
            "Shape mismatch: data length does not match shape product"
        );

        // Safe to unwrap because we checked at compile time
        $crate::tensor::Tensor::new($data.to_vec(), $shape).unwrap()
    }};
}

pub mod attention;
pub mod cache;
pub mod checkpoint;
pub mod config;
pub mod distributed;
pub mod error;
pub mod loss;
pub mod model;
pub mod nn;
pub mod optim;
pub mod precision;
pub mod sampling;
pub mod tensor;
pub mod train;

pub use cache::KvCache;
pub use checkpoint::CheckpointManager;
pub use config::Config;
pub use distributed::{create_mesh, HostDevices, Mesh, ShardedTensor, ShardingRules};
pub use error::{Error, Result};
pub use model::{backward, forward, forward_with_tape, init, Weights};
pub use optim::AdamState;
pub use precision::DType;
pub use sampling::{sample_from_prompt, SamplingOptions};
pub use tensor::{Tensor, TensorError};
pub use train::{update_step, Batch, StepMetrics};
