//! Restores the latest checkpoint (or initializes fresh weights) and generates from a prompt.

use minformer::checkpoint::CheckpointManager;
use minformer::{
    create_mesh, init, sample_from_prompt, Config, HostDevices, KvCache, SamplingOptions, Weights,
};
use tracing::info;

const DEVICES: usize = 4;
const BATCH: usize = 4;
const CHECKPOINT_DIR: &str = "/tmp/minformer_checkpoints";

fn main() -> minformer::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mesh = create_mesh(&HostDevices::new(DEVICES))?;
    let mut checkpoints = CheckpointManager::new(CHECKPOINT_DIR)?;

    let (cfg, weights) = match checkpoints.latest_step()? {
        Some(step) => {
            let cfg = checkpoints
                .restore_config(Some(step))?
                .with_mesh(mesh)
                .with_attn_kernel(false);
            let (weights, _) =
                checkpoints.restore(Some(step), &Weights::abstract_spec(&cfg), &cfg)?;
            info!(step, "sampling from checkpoint");
            (cfg, weights)
        }
        None => {
            let cfg = Config::tiny(mesh).with_attn_kernel(false);
            info!("no checkpoint found, sampling from fresh weights");
            let weights = init(&cfg, 0, true)?;
            (cfg, weights)
        }
    };

    let mut cache = KvCache::init(&cfg, BATCH)?;
    let prompt = [10, 11, 12, 13, 14];

    let greedy = sample_from_prompt(
        &prompt,
        &weights,
        &mut cache,
        &cfg,
        0,
        16,
        SamplingOptions::default(),
    )?;
    info!(?prompt, tokens = ?greedy, "greedy");

    let sampled = sample_from_prompt(
        &prompt,
        &weights,
        &mut cache,
        &cfg,
        1,
        16,
        SamplingOptions::sampled(0.8, 7),
    )?;
    info!(?prompt, tokens = ?sampled, lengths = ?cache.lengths, "sampled");
    Ok(())
}
