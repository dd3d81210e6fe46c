use super::sharding::{LogicalAxis, NamedSharding};
use crate::error::{Error, Result};
use crate::precision::DType;
use crate::tensor::{Tensor, TensorError};
use rayon::prelude::*;
use std::ops::Range;

/// Values split across the devices of a mesh.
///
/// One buffer per device, in mesh order. A dimension named by the sharding is cut into equal
/// contiguous blocks; every other dimension is held in full. A replicated tensor keeps an
/// identical full copy per device.
#[derive(Debug, Clone, PartialEq)]
pub struct ShardedTensor {
    shape: Vec<usize>,
    axes: Vec<LogicalAxis>,
    dtype: DType,
    sharding: NamedSharding,
    shards: Vec<Vec<f32>>,
}

/// How a flat index inside one shard maps back into the global tensor.
#[derive(Debug, Clone, Copy)]
struct BlockLayout {
    /// Elements of one block row in the global tensor (`len(dim) * inner`).
    global_row: usize,
    /// Elements of one block row held by a shard (`chunk * inner`).
    shard_row: usize,
}

impl BlockLayout {
    fn new(shape: &[usize], sharding: &NamedSharding) -> Self {
        match sharding.sharded_dim() {
            Some(dim) => {
                let inner: usize = shape[dim + 1..].iter().product();
                let chunk = shape[dim] / sharding.num_devices();
                Self {
                    global_row: shape[dim] * inner,
                    shard_row: chunk * inner,
                }
            }
            None => {
                let size: usize = shape.iter().product();
                Self {
                    global_row: size,
                    shard_row: size,
                }
            }
        }
    }

    #[inline]
    fn global_index(&self, device: usize, local: usize, replicated: bool) -> usize {
        if replicated || self.shard_row == 0 {
            return local;
        }
        let row = local / self.shard_row;
        let col = local % self.shard_row;
        row * self.global_row + device * self.shard_row + col
    }
}

impl ShardedTensor {
    fn check_layout(shape: &[usize], axes: &[LogicalAxis], sharding: &NamedSharding) -> Result<()> {
        if axes.len() != shape.len() {
            return Err(TensorError::ShapeMismatch {
                expected: vec![axes.len()],
                got: shape.to_vec(),
            }
            .into());
        }
        // Surfaces indivisible dimensions before any buffer is built.
        sharding.shard_shape(shape)?;
        Ok(())
    }

    /// Builds every device's shard directly from a generator over global flat indices.
    ///
    /// No buffer larger than one shard is ever allocated, which is what the low-memory init path
    /// relies on.
    pub fn from_fn<F>(
        shape: Vec<usize>,
        axes: Vec<LogicalAxis>,
        sharding: NamedSharding,
        dtype: DType,
        f: F,
    ) -> Result<Self>
    where
        F: Fn(usize) -> f32 + Sync,
    {
        Self::check_layout(&shape, &axes, &sharding)?;
        let layout = BlockLayout::new(&shape, &sharding);
        let shard_len: usize = sharding.shard_shape(&shape)?.iter().product();
        let replicated = sharding.is_replicated();

        let shards = (0..sharding.num_devices())
            .into_par_iter()
            .map(|device| {
                (0..shard_len)
                    .into_par_iter()
                    .map(|local| dtype.round(f(layout.global_index(device, local, replicated))))
                    .collect()
            })
            .collect();

        Ok(Self {
            shape,
            axes,
            dtype,
            sharding,
            shards,
        })
    }

    /// Splits a full host buffer onto the mesh.
    pub fn from_data(
        shape: Vec<usize>,
        data: &[f32],
        axes: Vec<LogicalAxis>,
        sharding: NamedSharding,
        dtype: DType,
    ) -> Result<Self> {
        let size: usize = shape.iter().product();
        if data.len() != size {
            return Err(TensorError::ShapeMismatch {
                expected: shape.clone(),
                got: vec![data.len()],
            }
            .into());
        }
        Self::from_fn(shape, axes, sharding, dtype, |i| data[i])
    }

    /// Places a full tensor onto the mesh.
    pub fn distribute<const RANK: usize>(
        tensor: &Tensor<f32, RANK>,
        axes: Vec<LogicalAxis>,
        sharding: NamedSharding,
        dtype: DType,
    ) -> Result<Self> {
        Self::from_data(tensor.shape().to_vec(), tensor.data(), axes, sharding, dtype)
    }

    pub fn zeros(
        shape: Vec<usize>,
        axes: Vec<LogicalAxis>,
        sharding: NamedSharding,
        dtype: DType,
    ) -> Result<Self> {
        Self::check_layout(&shape, &axes, &sharding)?;
        let shard_len: usize = sharding.shard_shape(&shape)?.iter().product();
        let shards = vec![vec![0.0; shard_len]; sharding.num_devices()];
        Ok(Self {
            shape,
            axes,
            dtype,
            sharding,
            shards,
        })
    }

    /// Zeros with this tensor's shape and placement, stored at `dtype`.
    pub fn zeros_like(&self, dtype: DType) -> Self {
        Self {
            shape: self.shape.clone(),
            axes: self.axes.clone(),
            dtype,
            sharding: self.sharding.clone(),
            shards: self.shards.iter().map(|s| vec![0.0; s.len()]).collect(),
        }
    }

    /// Splits `data` with this tensor's shape and placement (a reduce-scatter of a full
    /// gradient, for instance).
    pub fn scatter_like(&self, data: &[f32], dtype: DType) -> Result<Self> {
        Self::from_data(
            self.shape.clone(),
            data,
            self.axes.clone(),
            self.sharding.clone(),
            dtype,
        )
    }

    /// Assembles the full buffer from every device's shard (an all-gather).
    pub fn gather_vec(&self) -> Vec<f32> {
        if self.sharding.is_replicated() {
            return self.shards[0].clone();
        }
        let layout = BlockLayout::new(&self.shape, &self.sharding);
        let size: usize = self.shape.iter().product();
        let mut out = vec![0.0; size];
        if layout.shard_row == 0 {
            return out;
        }
        out.par_chunks_mut(layout.global_row)
            .enumerate()
            .for_each(|(row, block)| {
                for (device, shard) in self.shards.iter().enumerate() {
                    let src = &shard[row * layout.shard_row..(row + 1) * layout.shard_row];
                    block[device * layout.shard_row..(device + 1) * layout.shard_row]
                        .copy_from_slice(src);
                }
            });
        out
    }

    /// Gathers into a tensor of the declared rank.
    pub fn gather<const RANK: usize>(&self) -> Result<Tensor<f32, RANK>> {
        let shape: [usize; RANK] =
            self.shape
                .clone()
                .try_into()
                .map_err(|shape: Vec<usize>| TensorError::ShapeMismatch {
                    expected: vec![RANK],
                    got: shape,
                })?;
        Ok(Tensor::new(self.gather_vec(), shape)?)
    }

    /// Sum of squares over the logical tensor, counting replicated copies once.
    pub fn sum_squares(&self) -> f64 {
        let distinct: &[Vec<f32>] = if self.sharding.is_replicated() {
            &self.shards[..1]
        } else {
            &self.shards
        };
        distinct
            .par_iter()
            .map(|s| s.iter().map(|&x| (x as f64) * (x as f64)).sum::<f64>())
            .sum()
    }

    /// L2 norm over the logical tensor.
    pub fn l2_norm(&self) -> f32 {
        self.sum_squares().sqrt() as f32
    }

    /// Index ranges held by `device`.
    pub fn shard_ranges(&self, device: usize) -> Result<Vec<Range<usize>>> {
        self.sharding.shard_ranges(device, &self.shape)
    }

    /// Checks that this tensor has `expected` as its global shape.
    pub fn expect_shape(&self, expected: &[usize]) -> Result<()> {
        for (dim, (&got, &want)) in self.shape.iter().zip(expected).enumerate() {
            if got != want {
                return Err(Error::AxisSize {
                    axis: self.axes[dim],
                    expected: want,
                    got,
                });
            }
        }
        if self.shape.len() != expected.len() {
            return Err(TensorError::ShapeMismatch {
                expected: expected.to_vec(),
                got: self.shape.clone(),
            }
            .into());
        }
        Ok(())
    }

    pub fn shape(&self) -> &[usize] {
        &self.shape
    }

    pub fn axes(&self) -> &[LogicalAxis] {
        &self.axes
    }

    pub fn dtype(&self) -> DType {
        self.dtype
    }

    pub fn sharding(&self) -> &NamedSharding {
        &self.sharding
    }

    pub fn shards(&self) -> &[Vec<f32>] {
        &self.shards
    }

    /// Per-device buffers. Callers keep replicated copies identical.
    pub fn shards_mut(&mut self) -> &mut [Vec<f32>] {
        &mut self.shards
    }

    pub fn size(&self) -> usize {
        self.shape.iter().product()
    }
}
