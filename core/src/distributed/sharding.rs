use super::mesh::Mesh;
use crate::error::{Error, Result};
use crate::tensor::TensorError;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::ops::Range;
use std::str::FromStr;

/// The named axes every tensor in the model is declared over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalAxis {
    Batch,
    Sequence,
    DModel,
    QueryHeads,
    KeyHeads,
    KeyDim,
    Ffw,
    Vocab,
}

impl LogicalAxis {
    pub const ALL: [LogicalAxis; 8] = [
        LogicalAxis::Batch,
        LogicalAxis::Sequence,
        LogicalAxis::DModel,
        LogicalAxis::QueryHeads,
        LogicalAxis::KeyHeads,
        LogicalAxis::KeyDim,
        LogicalAxis::Ffw,
        LogicalAxis::Vocab,
    ];

    pub fn name(self) -> &'static str {
        match self {
            LogicalAxis::Batch => "batch",
            LogicalAxis::Sequence => "sequence",
            LogicalAxis::DModel => "d_model",
            LogicalAxis::QueryHeads => "query_heads",
            LogicalAxis::KeyHeads => "key_heads",
            LogicalAxis::KeyDim => "key_dim",
            LogicalAxis::Ffw => "ffw",
            LogicalAxis::Vocab => "vocab",
        }
    }
}

impl fmt::Display for LogicalAxis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for LogicalAxis {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        LogicalAxis::ALL
            .into_iter()
            .find(|axis| axis.name() == s)
            .ok_or_else(|| Error::UnknownLogicalAxis(s.to_string()))
    }
}

/// Maps each logical axis to a physical mesh axis, or to `None` for replication.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShardingRules {
    pub batch: Option<String>,
    pub sequence: Option<String>,
    pub d_model: Option<String>,
    pub query_heads: Option<String>,
    pub key_heads: Option<String>,
    pub key_dim: Option<String>,
    pub ffw: Option<String>,
    pub vocab: Option<String>,
}

impl ShardingRules {
    /// Fully sharded data parallelism: the batch and every parameter's `d_model` axis are split
    /// over `axis`.
    pub fn fsdp(axis: &str) -> Self {
        Self {
            batch: Some(axis.to_string()),
            d_model: Some(axis.to_string()),
            ..Self::default()
        }
    }

    /// Tensor parallelism: heads and the feed-forward hidden axis are split over `axis`.
    pub fn model_parallel(axis: &str) -> Self {
        Self {
            query_heads: Some(axis.to_string()),
            key_heads: Some(axis.to_string()),
            ffw: Some(axis.to_string()),
            ..Self::default()
        }
    }

    /// The mesh axis `axis` is sharded over, if any.
    pub fn get(&self, axis: LogicalAxis) -> Option<&str> {
        let slot = match axis {
            LogicalAxis::Batch => &self.batch,
            LogicalAxis::Sequence => &self.sequence,
            LogicalAxis::DModel => &self.d_model,
            LogicalAxis::QueryHeads => &self.query_heads,
            LogicalAxis::KeyHeads => &self.key_heads,
            LogicalAxis::KeyDim => &self.key_dim,
            LogicalAxis::Ffw => &self.ffw,
            LogicalAxis::Vocab => &self.vocab,
        };
        slot.as_deref()
    }

    /// Resolves a tensor's logical axes to a partition spec, one entry per axis.
    pub fn resolve(&self, axes: &[LogicalAxis]) -> PartitionSpec {
        PartitionSpec(
            axes.iter()
                .map(|axis| self.get(*axis).map(str::to_string))
                .collect(),
        )
    }

    /// Checks that every mesh axis named by the rules exists on `mesh`.
    pub fn validate(&self, mesh: &Mesh) -> Result<()> {
        for axis in LogicalAxis::ALL {
            if let Some(name) = self.get(axis) {
                if mesh.axis_size(name).is_none() {
                    return Err(Error::UnknownMeshAxis(name.to_string()));
                }
            }
        }
        Ok(())
    }
}

/// Per-dimension placement: `Some(mesh_axis)` splits the dimension, `None` replicates it.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PartitionSpec(pub Vec<Option<String>>);

impl PartitionSpec {
    pub fn replicated(rank: usize) -> Self {
        Self(vec![None; rank])
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn get(&self, dim: usize) -> Option<&str> {
        self.0.get(dim).and_then(|a| a.as_deref())
    }
}

impl fmt::Display for PartitionSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("P(")?;
        for (i, entry) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            match entry {
                Some(axis) => f.write_str(axis)?,
                None => f.write_str("None")?,
            }
        }
        f.write_str(")")
    }
}

/// A partition spec bound to a concrete mesh.
///
/// On a one-dimensional mesh at most one dimension of a tensor can be split; every other
/// dimension is held in full by every device.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamedSharding {
    mesh: Mesh,
    spec: PartitionSpec,
    sharded_dim: Option<usize>,
}

impl NamedSharding {
    /// Binds `spec` to `mesh`.
    ///
    /// # Errors
    ///
    /// Fails if the spec names an axis the mesh does not have, or splits two dimensions over the
    /// same mesh axis.
    pub fn new(mesh: Mesh, spec: PartitionSpec) -> Result<Self> {
        let mut sharded_dim = None;
        for (dim, entry) in spec.0.iter().enumerate() {
            let Some(name) = entry else { continue };
            if mesh.axis_size(name).is_none() {
                return Err(Error::UnknownMeshAxis(name.clone()));
            }
            if sharded_dim.is_some() {
                return Err(Error::Config(format!(
                    "{spec} splits more than one dimension over mesh axis `{name}`"
                )));
            }
            sharded_dim = Some(dim);
        }
        Ok(Self {
            mesh,
            spec,
            sharded_dim,
        })
    }

    /// Every device holds the whole tensor.
    pub fn replicated(mesh: Mesh, rank: usize) -> Self {
        Self {
            mesh,
            spec: PartitionSpec::replicated(rank),
            sharded_dim: None,
        }
    }

    pub fn mesh(&self) -> &Mesh {
        &self.mesh
    }

    pub fn spec(&self) -> &PartitionSpec {
        &self.spec
    }

    pub fn num_devices(&self) -> usize {
        self.mesh.size()
    }

    /// The dimension split across devices, if any.
    pub fn sharded_dim(&self) -> Option<usize> {
        self.sharded_dim
    }

    /// Whether every device holds a full copy.
    pub fn is_replicated(&self) -> bool {
        self.sharded_dim.is_none() || self.mesh.size() == 1
    }

    /// Per-dimension index ranges that `device` holds of a tensor with `global_shape`.
    ///
    /// # Errors
    ///
    /// Fails if the rank differs from the spec or the split dimension is not divisible.
    pub fn shard_ranges(&self, device: usize, global_shape: &[usize]) -> Result<Vec<Range<usize>>> {
        if global_shape.len() != self.spec.len() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![self.spec.len()],
                got: vec![global_shape.len()],
            }
            .into());
        }
        let mut ranges: Vec<Range<usize>> = global_shape.iter().map(|&n| 0..n).collect();
        if let Some(dim) = self.sharded_dim {
            let n = self.mesh.size();
            let size = global_shape[dim];
            if size % n != 0 {
                return Err(Error::Config(format!(
                    "dimension {dim} of size {size} does not split over {n} devices"
                )));
            }
            let chunk = size / n;
            ranges[dim] = device * chunk..(device + 1) * chunk;
        }
        Ok(ranges)
    }

    /// Shape of one device's shard.
    pub fn shard_shape(&self, global_shape: &[usize]) -> Result<Vec<usize>> {
        Ok(self
            .shard_ranges(0, global_shape)?
            .into_iter()
            .map(|r| r.len())
            .collect())
    }
}

/// Resolves a tensor's logical axes through `rules` into a sharding on `mesh`.
///
/// Errors name the logical axis at fault: a size that does not split evenly, or two logical axes
/// of one tensor resolving to the same mesh axis.
pub fn logical_to_sharding(
    axes: &[LogicalAxis],
    shape: &[usize],
    rules: &ShardingRules,
    mesh: &Mesh,
) -> Result<NamedSharding> {
    if axes.len() != shape.len() {
        return Err(TensorError::ShapeMismatch {
            expected: vec![axes.len()],
            got: shape.to_vec(),
        }
        .into());
    }

    let spec = rules.resolve(axes);
    let mut claimed: Option<(LogicalAxis, &str)> = None;
    for (dim, &axis) in axes.iter().enumerate() {
        let Some(mesh_axis) = spec.get(dim) else {
            continue;
        };
        let devices = mesh
            .axis_size(mesh_axis)
            .ok_or_else(|| Error::UnknownMeshAxis(mesh_axis.to_string()))?;
        if shape[dim] % devices != 0 {
            return Err(Error::IndivisibleAxis {
                axis,
                size: shape[dim],
                mesh_axis: mesh_axis.to_string(),
                devices,
            });
        }
        if let Some((first, claimed_axis)) = claimed {
            if claimed_axis == mesh_axis {
                return Err(Error::DuplicateMeshAxis {
                    mesh_axis: mesh_axis.to_string(),
                    first,
                    second: axis,
                });
            }
        }
        claimed = Some((axis, mesh_axis));
    }

    NamedSharding::new(mesh.clone(), spec)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::distributed::mesh::{create_mesh, HostDevices};

    #[test]
    fn test_presets() {
        let fsdp = ShardingRules::fsdp("x");
        assert_eq!(fsdp.get(LogicalAxis::Batch), Some("x"));
        assert_eq!(fsdp.get(LogicalAxis::DModel), Some("x"));
        assert_eq!(fsdp.get(LogicalAxis::Ffw), None);

        let mp = ShardingRules::model_parallel("x");
        for axis in [
            LogicalAxis::QueryHeads,
            LogicalAxis::KeyHeads,
            LogicalAxis::Ffw,
        ] {
            assert_eq!(mp.get(axis), Some("x"));
        }
        assert_eq!(mp.get(LogicalAxis::Batch), None);
        assert_eq!(mp.get(LogicalAxis::Vocab), None);
    }

    #[test]
    fn test_resolve() {
        let rules = ShardingRules::fsdp("x");
        let spec = rules.resolve(&[LogicalAxis::DModel, LogicalAxis::QueryHeads, LogicalAxis::KeyDim]);
        assert_eq!(spec.to_string(), "P(x, None, None)");
    }

    #[test]
    fn test_parse_logical_axis() {
        assert_eq!("key_heads".parse::<LogicalAxis>().unwrap(), LogicalAxis::KeyHeads);
        assert!(matches!(
            "heads".parse::<LogicalAxis>(),
            Err(Error::UnknownLogicalAxis(name)) if name == "heads"
        ));
    }

    #[test]
    fn test_validate_unknown_mesh_axis() {
        let mesh = Mesh::single_host();
        assert!(ShardingRules::fsdp("x").validate(&mesh).is_ok());
        assert!(matches!(
            ShardingRules::fsdp("y").validate(&mesh),
            Err(Error::UnknownMeshAxis(_))
        ));
    }

    #[test]
    fn test_shard_ranges() {
        let mesh = create_mesh(&HostDevices::new(4)).unwrap();
        let sharding = logical_to_sharding(
            &[LogicalAxis::DModel, LogicalAxis::Ffw],
            &[8, 3],
            &ShardingRules::fsdp("x"),
            &mesh,
        )
        .unwrap();
        assert_eq!(sharding.sharded_dim(), Some(0));
        assert_eq!(sharding.shard_ranges(2, &[8, 3]).unwrap(), vec![4..6, 0..3]);
        assert_eq!(sharding.shard_shape(&[8, 3]).unwrap(), vec![2, 3]);
    }

    #[test]
    fn test_indivisible_axis_names_logical_axis() {
        let mesh = create_mesh(&HostDevices::new(4)).unwrap();
        let err = logical_to_sharding(
            &[LogicalAxis::Ffw, LogicalAxis::DModel],
            &[6, 8],
            &ShardingRules::model_parallel("x"),
            &mesh,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::IndivisibleAxis {
                axis: LogicalAxis::Ffw,
                size: 6,
                ..
            }
        ));
    }

    #[test]
    fn test_duplicate_mesh_axis() {
        let mesh = create_mesh(&HostDevices::new(2)).unwrap();
        let err = logical_to_sharding(
            &[LogicalAxis::Batch, LogicalAxis::Sequence, LogicalAxis::DModel],
            &[2, 4, 8],
            &ShardingRules::fsdp("x"),
            &mesh,
        )
        .unwrap_err();
        assert!(matches!(
            err,
            Error::DuplicateMeshAxis {
                first: LogicalAxis::Batch,
                second: LogicalAxis::DModel,
                ..
            }
        ));
    }
}
