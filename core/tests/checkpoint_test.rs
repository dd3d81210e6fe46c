use minformer::distributed::MESH_AXIS;
use minformer::{
    create_mesh, forward, init, update_step, AdamState, Batch, CheckpointManager, Config,
    HostDevices, Mesh, ShardingRules, Tensor, Weights,
};
use tempfile::tempdir;

fn micro(mesh: Mesh) -> Config {
    Config::tiny(mesh)
        .with_dims(16, 2, 4, 4, 1, 8, 32, 16)
        .with_schedule(1e-3, 1e-4, 0, 100)
}

fn batch() -> Batch {
    let x = Tensor::<i32, 2>::from_fn([2, 8], |i| (i * 5 % 32) as i32);
    let y = x.map(|t| (t + 1) % 32);
    Batch::new(x, Tensor::ones([2, 8]), y).unwrap()
}

#[test]
fn test_resume_after_training() {
    let dir = tempdir().unwrap();
    let cfg = micro(create_mesh(&HostDevices::new(2)).unwrap());
    let mut weights = init(&cfg, 0, true).unwrap();
    let mut opt_state = AdamState::init(&weights);
    let batch = batch();
    for step in 0..3 {
        update_step(&mut weights, &batch, &mut opt_state, step, &cfg).unwrap();
    }

    let mut manager = CheckpointManager::new(dir.path()).unwrap();
    manager.save(3, &weights, &opt_state, &cfg).unwrap();
    manager.wait_until_finished().unwrap();
    assert_eq!(manager.latest_step().unwrap(), Some(3));

    let mut reopened = CheckpointManager::new(dir.path()).unwrap();
    let restored_cfg = reopened.restore_config(None).unwrap();
    assert_eq!(restored_cfg.d_model, cfg.d_model);
    assert_eq!(restored_cfg.rules, cfg.rules);
    let (mut restored, mut restored_opt) = reopened
        .restore(None, &Weights::abstract_spec(&cfg), &cfg)
        .unwrap();
    assert_eq!(restored, weights);
    assert_eq!(restored_opt.m, opt_state.m);
    assert_eq!(restored_opt.v, opt_state.v);

    // Continuing from the checkpoint matches continuing in memory.
    let a = update_step(&mut weights, &batch, &mut opt_state, 3, &cfg).unwrap();
    let b = update_step(&mut restored, &batch, &mut restored_opt, 3, &cfg).unwrap();
    assert_eq!(a.loss, b.loss);
    assert_eq!(weights, restored);
}

#[test]
fn test_keeps_newest_steps() {
    let dir = tempdir().unwrap();
    let cfg = micro(Mesh::single_host());
    let weights = init(&cfg, 0, true).unwrap();
    let opt_state = AdamState::init(&weights);

    let mut manager = CheckpointManager::create_empty(dir.path())
        .unwrap()
        .with_max_to_keep(2);
    for step in [5, 10, 15, 20] {
        manager.save(step, &weights, &opt_state, &cfg).unwrap();
    }
    manager.wait_until_finished().unwrap();
    assert_eq!(manager.all_steps().unwrap(), vec![15, 20]);
    assert!(!dir.path().join("5").exists());

    // A fresh manager over the same directory starts empty.
    let manager = CheckpointManager::create_empty(dir.path()).unwrap();
    assert_eq!(manager.latest_step().unwrap(), None);
}

#[test]
fn test_restore_onto_larger_mesh() {
    let dir = tempdir().unwrap();
    let single = micro(Mesh::single_host());
    let weights = init(&single, 11, true).unwrap();
    let opt_state = AdamState::init(&weights);

    let mut manager = CheckpointManager::new(dir.path()).unwrap();
    manager.save(1, &weights, &opt_state, &single).unwrap();
    manager.wait_until_finished().unwrap();

    let wide = micro(create_mesh(&HostDevices::new(4)).unwrap())
        .with_rules(ShardingRules::model_parallel(MESH_AXIS));
    let (resharded, _) = manager
        .restore(Some(1), &Weights::abstract_spec(&wide), &wide)
        .unwrap();
    assert_eq!(resharded.layers[0].q.sharding().num_devices(), 4);

    let tokens = Tensor::<i32, 2>::from_fn([1, 8], |i| (i * 3 % 32) as i32);
    let seg = Tensor::<i32, 2>::ones([1, 8]);
    let before = forward(&tokens, &seg, &weights, &single, None).unwrap();
    let after = forward(&tokens, &seg, &resharded, &wide, None).unwrap();
    assert!(before.max_abs_diff(&after).unwrap() < 1e-5);
}

#[test]
fn test_missing_step_is_an_error() {
    let dir = tempdir().unwrap();
    let cfg = micro(Mesh::single_host());
    let mut manager = CheckpointManager::new(dir.path()).unwrap();
    assert!(manager.restore_config(None).is_err());
    assert!(manager
        .restore(Some(7), &Weights::abstract_spec(&cfg), &cfg)
        .is_err());
}
