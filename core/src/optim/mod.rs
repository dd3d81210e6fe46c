//! Adam with a warmup-then-cosine learning rate.

pub mod adam;
pub mod scheduler;

pub use adam::{Adam, AdamState};
pub use scheduler::{CosineDecay, LRScheduler};
