//! # Sharding
//!
//! Every parameter, activation and cache tensor is declared over named [`LogicalAxis`] values.
//! A [`ShardingRules`] table maps each logical axis to a mesh axis (split) or to nothing
//! (replicated), and [`logical_to_sharding`] binds the result to a concrete [`Mesh`].
//!
//! Tensors placed on the mesh are [`ShardedTensor`]s: one host buffer per device. Layers are
//! gathered in full just before they are used and dropped right after, so at most one layer's
//! weights are ever resident unsharded:
//!
//! 1. `gather`: all-gather the layer from every device.
//! 2. compute with the full weights.
//! 3. drop the gathered copy, keeping only the shards.
//!
//! Gradients come back the other way through [`ShardedTensor::scatter_like`].

pub mod mesh;
pub mod sharded;
pub mod sharding;

pub use mesh::{create_mesh, Device, DeviceProvider, HostDevices, Mesh, Platform, MESH_AXIS};
pub use sharded::ShardedTensor;
pub use sharding::{logical_to_sharding, LogicalAxis, NamedSharding, PartitionSpec, ShardingRules};

use crate::error::Result;

/// Parameters stored split across the mesh and gathered in full only while they are used.
///
/// Dropping the gathered value is the discard step; nothing else holds the full copy.
pub trait Shardable {
    type Full;

    /// All-gathers every parameter.
    fn gather(&self) -> Result<Self::Full>;
}
