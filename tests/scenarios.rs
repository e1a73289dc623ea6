use fragbench::{
  BASELINE_SEED, Baseline, Config, DEFAULT_OPS, MAX_SZ, MIN_SZ, Mode, NullSampler, POOLED_SEED, Pool,
  Pooled, Report, SizeGen, Strategy, pool_capacity, run_all,
};

#[test]
fn full_run_sizes_the_pool_and_serves_everything() {
  assert_eq!(pool_capacity(DEFAULT_OPS), 256_000_000);

  let result = Pooled::new(POOLED_SEED).run(DEFAULT_OPS, &mut NullSampler);
  assert_eq!(result.stats.served, DEFAULT_OPS);
  assert_eq!(result.stats.requests, DEFAULT_OPS);
  assert!(result.stats.bytes_granted < pool_capacity(DEFAULT_OPS));
  assert!(!result.stopped_early());
}

#[test]
fn request_landing_on_the_pool_end_is_rejected() {
  let total = DEFAULT_OPS;
  let mut pool = Pool::with_capacity(pool_capacity(total));

  let served = (0..total).take_while(|_| pool.claim(MAX_SZ).is_some()).count();

  assert_eq!(served, total - 1);
  assert_eq!(pool.offset(), (total - 1) * MAX_SZ);
  assert!(pool.offset() <= pool.capacity());
}

#[test]
fn worst_case_sizes_stop_the_pool_early() {
  // A pool sized for 4 requests at MAX_SZ only fits 3 of them.
  let mut pool = Pool::with_capacity(pool_capacity(4));
  let mut granted = 0;
  let mut served = 0;
  for _ in 0..4 {
    if pool.claim(MAX_SZ).is_none() {
      break;
    }
    served += 1;
    granted += MAX_SZ;
  }
  assert!(served < 4);
  assert!(granted <= pool.capacity());
}

#[test]
fn pooled_run_stops_early_and_stays_within_the_pool() {
  let result = Pooled::new(51).run(1, &mut NullSampler);

  assert!(result.stopped_early());
  assert!(result.stats.served < result.total);
  assert_eq!(result.stats.requests, 1);
  assert!(result.stats.bytes_granted <= pool_capacity(1));
}

#[test]
fn fixed_seed_replays_the_same_sizes() {
  let first: Vec<usize> = SizeGen::new(BASELINE_SEED).take(10_000).collect();
  let second: Vec<usize> = SizeGen::new(BASELINE_SEED).take(10_000).collect();
  assert_eq!(first, second);
  assert!(first.iter().all(|size| (MIN_SZ..=MAX_SZ).contains(size)));

  let other: Vec<usize> = SizeGen::new(POOLED_SEED).take(10_000).collect();
  assert_ne!(first, other);
}

#[test]
fn fixed_seed_replays_the_same_baseline_run() {
  let a = Baseline::new(BASELINE_SEED).run(20_000, &mut NullSampler);
  let b = Baseline::new(BASELINE_SEED).run(20_000, &mut NullSampler);
  assert_eq!(a.stats, b.stats);
}

#[test]
fn short_baseline_runs_never_evict() {
  for total in 0..=12 {
    let result = Baseline::new(BASELINE_SEED).run(total, &mut NullSampler);
    assert_eq!(result.stats.evictions, 0, "total = {total}");
    assert_eq!(result.stats.max_live, total);
    assert_eq!(result.stats.releases, total);
  }

  let result = Baseline::new(BASELINE_SEED).run(13, &mut NullSampler);
  assert_eq!(result.stats.evictions, 1);
  assert_eq!(result.stats.live(), 0);
}

#[test]
fn driver_runs_baseline_then_pooled() {
  let config = Config {
    ops: 2_000,
    sample_rss: false,
    ..Config::default()
  };

  let results = run_all(&config, &mut NullSampler);
  let modes: Vec<Mode> = results.iter().map(|r| r.mode).collect();
  assert_eq!(modes, vec![Mode::Baseline, Mode::Pooled]);
  assert!(results.iter().all(|r| r.total == 2_000 && r.peak_rss == 0));

  let text = Report::new(config.ops, results).to_string();
  assert!(text.contains("ops = 2000"));
  assert!(text.lines().any(|line| line.starts_with("baseline ")));
  assert!(text.lines().any(|line| line.starts_with("pooled ")));
}
