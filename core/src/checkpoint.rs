//! Checkpointing of weights and optimizer state in the `safetensors` format.
//!
//! Each saved step is a directory `<root>/<step>/` holding a single `state.safetensors` file:
//!
//! - `weights.<path>` at the parameter's storage dtype (F32 or BF16);
//! - `opt_state.m.<path>` and `opt_state.v.<path>` in F32;
//! - metadata with the step and the JSON of the config that produced it.
//!
//! Tensors are stored gathered, so a checkpoint does not depend on the mesh it was written from
//! and can be restored onto any other.

use crate::config::Config;
use crate::distributed::{NamedSharding, ShardedTensor};
use crate::error::{Error, Result};
use crate::model::{ParamSpec, Weights};
use crate::optim::AdamState;
use crate::precision::DType;
use half::bf16;
use safetensors::tensor::TensorView;
use safetensors::{Dtype, SafeTensors};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::thread::JoinHandle;
use tracing::{debug, info, warn};

/// Steps kept on disk unless configured otherwise.
pub const DEFAULT_MAX_TO_KEEP: usize = 3;

const STATE_FILE: &str = "state.safetensors";

/// One gathered tensor, ready to be written.
struct Entry {
    name: String,
    dtype: Dtype,
    shape: Vec<usize>,
    bytes: Vec<u8>,
}

impl Entry {
    fn new(name: String, tensor: &ShardedTensor, dtype: DType) -> Self {
        let values = tensor.gather_vec();
        let (dtype, bytes) = match dtype {
            DType::F32 => (
                Dtype::F32,
                values.iter().flat_map(|x| x.to_le_bytes()).collect(),
            ),
            DType::Bf16 => (
                Dtype::BF16,
                values
                    .iter()
                    .flat_map(|&x| bf16::from_f32(x).to_le_bytes())
                    .collect(),
            ),
        };
        Self {
            name,
            dtype,
            shape: tensor.shape().to_vec(),
            bytes,
        }
    }
}

fn decode(view: &TensorView<'_>, name: &str) -> Result<Vec<f32>> {
    let data = view.data();
    match view.dtype() {
        Dtype::F32 => Ok(data
            .chunks_exact(4)
            .map(|b| f32::from_le_bytes([b[0], b[1], b[2], b[3]]))
            .collect()),
        Dtype::BF16 => Ok(data
            .chunks_exact(2)
            .map(|b| bf16::from_le_bytes([b[0], b[1]]).to_f32())
            .collect()),
        other => Err(Error::Checkpoint(format!(
            "tensor `{name}` has unsupported dtype {other:?}"
        ))),
    }
}

/// Step numbers with a complete checkpoint under `dir`, oldest first.
fn list_steps(dir: &Path) -> Result<Vec<u64>> {
    if !dir.exists() {
        return Ok(Vec::new());
    }
    let mut steps = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let step = path
            .file_name()
            .and_then(|n| n.to_str())
            .and_then(|n| n.parse::<u64>().ok());
        if let Some(step) = step {
            if path.join(STATE_FILE).is_file() {
                steps.push(step);
            }
        }
    }
    steps.sort_unstable();
    Ok(steps)
}

/// Deletes the oldest steps until at most `max_to_keep` remain.
fn prune(dir: &Path, max_to_keep: usize) -> Result<()> {
    let steps = list_steps(dir)?;
    let excess = steps.len().saturating_sub(max_to_keep);
    for step in &steps[..excess] {
        fs::remove_dir_all(dir.join(step.to_string()))?;
        debug!(step, "pruned checkpoint");
    }
    Ok(())
}

fn write_step(
    dir: &Path,
    step: u64,
    entries: Vec<Entry>,
    metadata: HashMap<String, String>,
) -> Result<()> {
    let views = entries
        .iter()
        .map(|e| -> Result<_> {
            Ok((e.name.as_str(), TensorView::new(e.dtype, e.shape.clone(), &e.bytes)?))
        })
        .collect::<Result<Vec<_>>>()?;
    let bytes = safetensors::serialize(
        views.iter().map(|(name, view)| (*name, view)),
        &Some(metadata),
    )?;

    // Written next to its final location and renamed, so a step directory is either complete or
    // absent.
    let tmp = dir.join(format!("tmp-{step}"));
    if tmp.exists() {
        fs::remove_dir_all(&tmp)?;
    }
    fs::create_dir_all(&tmp)?;
    fs::write(tmp.join(STATE_FILE), &bytes)?;
    let target = dir.join(step.to_string());
    if target.exists() {
        fs::remove_dir_all(&target)?;
    }
    fs::rename(&tmp, &target)?;
    Ok(())
}

/// Saves and restores `{weights, opt_state}` under one directory, one subdirectory per step.
///
/// Saving gathers every tensor on the calling thread and hands the write to a background thread;
/// [`CheckpointManager::wait_until_finished`] blocks until it is on disk.
#[derive(Debug)]
pub struct CheckpointManager {
    dir: PathBuf,
    max_to_keep: usize,
    pending: Option<JoinHandle<Result<()>>>,
}

impl CheckpointManager {
    /// Opens (creating if needed) a checkpoint directory.
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self {
            dir,
            max_to_keep: DEFAULT_MAX_TO_KEEP,
            pending: None,
        })
    }

    /// Deletes everything under `dir` and opens it empty.
    pub fn create_empty(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        if dir.exists() {
            warn!(dir = %dir.display(), "erasing checkpoint directory");
            fs::remove_dir_all(&dir)?;
        }
        Self::new(dir)
    }

    pub fn with_max_to_keep(mut self, max_to_keep: usize) -> Self {
        self.max_to_keep = max_to_keep.max(1);
        self
    }

    pub fn directory(&self) -> &Path {
        &self.dir
    }

    pub fn max_to_keep(&self) -> usize {
        self.max_to_keep
    }

    /// Every saved step, oldest first.
    pub fn all_steps(&self) -> Result<Vec<u64>> {
        list_steps(&self.dir)
    }

    pub fn latest_step(&self) -> Result<Option<u64>> {
        Ok(self.all_steps()?.last().copied())
    }

    /// Starts writing `step`. Any previous save is finished first.
    ///
    /// Once the write completes, steps beyond the newest `max_to_keep` are deleted.
    pub fn save(
        &mut self,
        step: u64,
        weights: &Weights<ShardedTensor>,
        opt_state: &AdamState,
        cfg: &Config,
    ) -> Result<()> {
        self.wait_until_finished()?;

        let mut entries = Vec::new();
        for (path, tensor) in weights.leaves() {
            entries.push(Entry::new(format!("weights.{path}"), tensor, tensor.dtype()));
        }
        for (prefix, moments) in [("m", &opt_state.m), ("v", &opt_state.v)] {
            for (path, tensor) in moments.leaves() {
                entries.push(Entry::new(format!("opt_state.{prefix}.{path}"), tensor, DType::F32));
            }
        }
        let metadata = HashMap::from([
            ("step".to_string(), step.to_string()),
            ("config".to_string(), cfg.to_json()?),
        ]);
        let bytes: usize = entries.iter().map(|e| e.bytes.len()).sum();

        let dir = self.dir.clone();
        let max_to_keep = self.max_to_keep;
        self.pending = Some(std::thread::spawn(move || {
            write_step(&dir, step, entries, metadata)?;
            prune(&dir, max_to_keep)
        }));
        info!(step, bytes, dir = %self.dir.display(), "saving checkpoint");
        Ok(())
    }

    /// Blocks until the last [`CheckpointManager::save`] is on disk.
    pub fn wait_until_finished(&mut self) -> Result<()> {
        match self.pending.take() {
            Some(handle) => handle
                .join()
                .map_err(|_| Error::Checkpoint("checkpoint writer panicked".to_string()))?,
            None => Ok(()),
        }
    }

    fn resolve_step(&self, step: Option<u64>) -> Result<u64> {
        match step {
            Some(step) => Ok(step),
            None => self.latest_step()?.ok_or_else(|| {
                Error::Checkpoint(format!("no checkpoint found in {}", self.dir.display()))
            }),
        }
    }

    fn read_step(&self, step: u64) -> Result<Vec<u8>> {
        let path = self.dir.join(step.to_string()).join(STATE_FILE);
        if !path.is_file() {
            return Err(Error::Checkpoint(format!("no checkpoint for step {step}")));
        }
        Ok(fs::read(path)?)
    }

    /// The config a step was saved with, bound to a single host device.
    pub fn restore_config(&mut self, step: Option<u64>) -> Result<Config> {
        self.wait_until_finished()?;
        let step = self.resolve_step(step)?;
        let bytes = self.read_step(step)?;
        let (_, header) = SafeTensors::read_metadata(&bytes)?;
        let json = header
            .metadata()
            .as_ref()
            .and_then(|m| m.get("config"))
            .ok_or_else(|| Error::Checkpoint(format!("step {step} has no config metadata")))?;
        Config::from_json(json)
    }

    /// Restores `step` (or the latest one) onto the mesh and rules of `cfg`.
    ///
    /// `template` fixes the expected shapes and logical axes; every stored tensor is checked
    /// against it and resharded to its target placement.
    pub fn restore(
        &mut self,
        step: Option<u64>,
        template: &Weights<ParamSpec>,
        cfg: &Config,
    ) -> Result<(Weights<ShardedTensor>, AdamState)> {
        self.wait_until_finished()?;
        let step = self.resolve_step(step)?;
        let bytes = self.read_step(step)?;
        let tensors = SafeTensors::deserialize(&bytes)?;
        let shardings = template.shardings(cfg)?;

        let load = |name: String,
                    spec: &ParamSpec,
                    sharding: &NamedSharding,
                    dtype: DType|
         -> Result<ShardedTensor> {
            let view = tensors.tensor(&name)?;
            if view.shape() != spec.shape.as_slice() {
                return Err(Error::Checkpoint(format!(
                    "tensor `{name}` has shape {:?}, expected {:?}",
                    view.shape(),
                    spec.shape
                )));
            }
            let data = decode(&view, &name)?;
            ShardedTensor::from_data(spec.shape.clone(), &data, spec.axes.clone(), sharding.clone(), dtype)
        };

        let weights = template.try_zip_map(&shardings, |path, spec, sharding| {
            load(format!("weights.{path}"), spec, sharding, spec.dtype)
        })?;
        let m = template.try_zip_map(&shardings, |path, spec, sharding| {
            load(format!("opt_state.m.{path}"), spec, sharding, DType::F32)
        })?;
        let v = template.try_zip_map(&shardings, |path, spec, sharding| {
            load(format!("opt_state.v.{path}"), spec, sharding, DType::F32)
        })?;

        info!(step, devices = cfg.mesh.size(), "restored checkpoint");
        Ok((weights, AdamState { m, v }))
    }
}

impl Drop for CheckpointManager {
    fn drop(&mut self) {
        if let Err(err) = self.wait_until_finished() {
            warn!(error = %err, "checkpoint write failed");
        }
    }
}
