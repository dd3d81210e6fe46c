//! # Model
//!
//! A decoder-only transformer: token embedding, a stack of pre-norm blocks (grouped-query
//! attention with rotary positions, then a GELU feed-forward), and an untied output projection.
//!
//! - [`weights`]: the parameter tree and its abstract description.
//! - [`init`](mod@init): two-phase initialization onto a mesh.
//! - [`forward`](mod@forward): inference with an optional KV cache, and the recording variant used in
//!   training.
//! - [`backward`](mod@backward): gradients from a recorded tape.

pub mod backward;
pub mod forward;
pub mod init;
pub mod weights;

pub use backward::backward;
pub use forward::{forward, forward_with_tape, Tape};
pub use init::init;
pub use weights::{DenseLayer, Initializer, Layer, ParamSpec, Weights};
