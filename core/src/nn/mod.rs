//! Dense building blocks of one transformer block, each with its backward pass.

pub mod activation;
pub mod embedding;
pub mod linear;
pub mod norm;
pub mod rope;

pub use activation::Activation;
pub use embedding::{embed, embed_backward};
pub use norm::{rms_norm, rms_norm_backward};
pub use rope::RopeTables;
