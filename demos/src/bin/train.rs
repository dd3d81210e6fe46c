//! Trains the tiny config on a synthetic next-token task and checkpoints periodically.
//!
//! Each row packs two sequences that count upwards modulo the vocabulary from a random start,
//! followed by padding, so the loss should fall quickly.

use minformer::checkpoint::CheckpointManager;
use minformer::tensor::Tensor;
use minformer::{create_mesh, init, update_step, AdamState, Batch, Config, HostDevices};
use rand::Rng;
use tracing::info;

const DEVICES: usize = 4;
const BATCH: usize = 8;
const SEQ_LEN: usize = 64;
const STEPS: usize = 200;
const CHECKPOINT_EVERY: usize = 50;
const CHECKPOINT_DIR: &str = "/tmp/minformer_checkpoints";

fn synthetic_batch<R: Rng>(rng: &mut R, vocab: usize) -> minformer::Result<Batch> {
    let mut x = Vec::with_capacity(BATCH * SEQ_LEN);
    let mut y = Vec::with_capacity(BATCH * SEQ_LEN);
    let mut segments = Vec::with_capacity(BATCH * SEQ_LEN);
    for _ in 0..BATCH {
        let split = rng.random_range(SEQ_LEN / 4..SEQ_LEN / 2);
        let used = rng.random_range(3 * SEQ_LEN / 4..=SEQ_LEN);
        let mut token = rng.random_range(0..vocab);
        for pos in 0..SEQ_LEN {
            if pos == split {
                token = rng.random_range(0..vocab);
            }
            let segment = match pos {
                p if p >= used => 0,
                p if p < split => 1,
                _ => 2,
            };
            x.push(token as i32);
            y.push(((token + 1) % vocab) as i32);
            segments.push(segment);
            token = (token + 1) % vocab;
        }
    }
    Batch::new(
        Tensor::new(x, [BATCH, SEQ_LEN])?,
        Tensor::new(segments, [BATCH, SEQ_LEN])?,
        Tensor::new(y, [BATCH, SEQ_LEN])?,
    )
}

fn main() -> minformer::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let mesh = create_mesh(&HostDevices::new(DEVICES))?;
    let cfg = Config::tiny(mesh).with_schedule(3e-4, 1e-5, 50, 10_000);
    cfg.validate()?;

    let mut weights = init(&cfg, 0, true)?;
    let mut opt_state = AdamState::init(&weights);
    let mut checkpoints = CheckpointManager::create_empty(CHECKPOINT_DIR)?;
    let mut rng = rand::rng();

    for step in 0..STEPS {
        let batch = synthetic_batch(&mut rng, cfg.vocab_size)?;
        let metrics = update_step(&mut weights, &batch, &mut opt_state, step, &cfg)?;
        if step % 10 == 0 {
            info!(
                step,
                loss = metrics.loss,
                accuracy = metrics.accuracy,
                lr = metrics.lr,
                grad_norm = metrics.grad_norm(),
                "train"
            );
        }
        if (step + 1) % CHECKPOINT_EVERY == 0 {
            checkpoints.save(step as u64 + 1, &weights, &opt_state, &cfg)?;
            checkpoints.wait_until_finished()?;
        }
    }

    info!(steps = ?checkpoints.all_steps()?, "done");
    Ok(())
}
