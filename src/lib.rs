//! Fragmentation vs. pooled allocation benchmark.
//!
//! Two strategies serve the same synthetic stream of small requests:
//!
//! - [`Baseline`] allocates every request individually and frees a random
//!   earlier block every third step, which churns the global allocator.
//! - [`Pooled`] reserves one region up front and bump-allocates inside it.
//!
//! Each run samples resident memory after every request through a
//! [`MemorySampler`] and reports elapsed time and peak RSS.

use core::{fmt, mem::MaybeUninit, ptr, time::Duration};
use std::time::Instant;

use rand::{
  Rng, SeedableRng,
  distributions::{Distribution, Uniform},
  rngs::SmallRng,
};
use tracing::{debug, info};

pub mod config;

pub use config::{Config, ConfigError};

// =============================================================================
// Constants
// =============================================================================

/// Smallest request size in bytes.
pub const MIN_SZ: usize = 8;
/// Largest request size in bytes.
pub const MAX_SZ: usize = 256;

/// Requests per strategy when nothing else is configured.
pub const DEFAULT_OPS: usize = 1_000_000;

pub const BASELINE_SEED: u64 = 42;
pub const POOLED_SEED: u64 = 43;

/// Eviction starts only after this many steps.
const EVICT_AFTER: usize = 10;
/// Eviction period, in steps.
const EVICT_EVERY: usize = 3;

const BYTES_PER_MIB: f64 = (1024 * 1024) as f64;

const _: () = assert!(MIN_SZ >= 1);
const _: () = assert!(MIN_SZ <= MAX_SZ);
const _: () = assert!(EVICT_EVERY > 0);

// =============================================================================
// Types
// =============================================================================

/// Allocation strategy under measurement.
#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum Mode {
  Baseline,
  Pooled,
}

impl Mode {
  pub const fn as_str(self) -> &'static str {
    match self {
      Mode::Baseline => "baseline",
      Mode::Pooled => "pooled",
    }
  }
}

impl fmt::Display for Mode {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.pad(self.as_str())
  }
}

/// Allocation counters for one run. Passed by value, never shared.
#[derive(Clone, Copy, PartialEq, Eq, Debug, Default)]
pub struct AllocStats {
  /// Requests drawn from the size generator, including a refused one.
  pub requests: usize,
  /// Requests that were granted memory.
  pub served: usize,
  /// Calls into the allocator.
  pub alloc_calls: usize,
  /// Random evictions performed inside the measured loop.
  pub evictions: usize,
  /// Individual frees, evictions and final cleanup together.
  pub releases: usize,
  /// Sum of granted sizes.
  pub bytes_granted: usize,
  /// Largest number of simultaneously live allocations.
  pub max_live: usize,
}

impl AllocStats {
  /// Allocations not yet given back.
  pub fn live(&self) -> usize {
    self.alloc_calls.saturating_sub(self.releases)
  }
}

/// Outcome of one strategy run.
#[derive(Clone, Copy, PartialEq, Debug)]
pub struct RunResult {
  pub mode: Mode,
  /// Requests the run was asked to serve.
  pub total: usize,
  pub elapsed: Duration,
  /// RSS sampled right before the loop started.
  pub first_rss: u64,
  pub peak_rss: u64,
  pub stats: AllocStats,
}

impl RunResult {
  pub fn secs(&self) -> f64 {
    self.elapsed.as_secs_f64()
  }

  pub fn peak_mib(&self) -> f64 {
    bytes_to_mib(self.peak_rss)
  }

  /// True when the run gave up before serving every request.
  pub fn stopped_early(&self) -> bool {
    self.stats.served < self.total
  }
}

// =============================================================================
// Platform
// =============================================================================

/// Source of the process's current resident set size.
///
/// Implementations must be cheap enough to call after every request and must
/// not allocate, or they would show up in the numbers they report. A failed or
/// unsupported query returns 0.
pub trait MemorySampler {
  fn sample(&mut self) -> u64;

  fn name(&self) -> &'static str;
}

/// Always reports 0. Used where no RSS query exists, or to measure the loop
/// without sampling.
#[derive(Clone, Copy, Debug, Default)]
pub struct NullSampler;

impl MemorySampler for NullSampler {
  #[inline(always)]
  fn sample(&mut self) -> u64 {
    0
  }

  fn name(&self) -> &'static str {
    "null"
  }
}

/// Reads resident pages from `/proc/self/statm`.
///
/// The file stays open and is re-read with a positioned read into a stack
/// buffer, so sampling does not touch the heap.
#[cfg(all(target_os = "linux", feature = "statm"))]
pub struct StatmSampler {
  file: std::fs::File,
  page_size: u64,
}

#[cfg(all(target_os = "linux", feature = "statm"))]
impl StatmSampler {
  pub fn open() -> Option<Self> {
    let page_size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    if page_size <= 0 {
      return None;
    }

    let file = std::fs::File::open("/proc/self/statm").ok()?;
    Some(Self {
      file,
      page_size: page_size as u64,
    })
  }

  fn resident_pages(&self) -> Option<u64> {
    use std::os::unix::fs::FileExt;

    let mut buf = [0u8; 128];
    let len = self.file.read_at(&mut buf, 0).ok()?;
    parse_statm_resident(&buf[..len])
  }
}

#[cfg(all(target_os = "linux", feature = "statm"))]
impl MemorySampler for StatmSampler {
  #[inline]
  fn sample(&mut self) -> u64 {
    self
      .resident_pages()
      .map_or(0, |pages| pages.saturating_mul(self.page_size))
  }

  fn name(&self) -> &'static str {
    "statm"
  }
}

/// Second field of a statm line ("size resident shared text lib data dt").
#[cfg_attr(not(all(target_os = "linux", feature = "statm")), allow(dead_code))]
fn parse_statm_resident(line: &[u8]) -> Option<u64> {
  core::str::from_utf8(line)
    .ok()?
    .split_ascii_whitespace()
    .nth(1)?
    .parse()
    .ok()
}

/// Current RSS from `task_info(MACH_TASK_BASIC_INFO)`.
#[cfg(target_vendor = "apple")]
#[derive(Clone, Copy, Debug, Default)]
pub struct MachSampler;

#[cfg(target_vendor = "apple")]
impl MemorySampler for MachSampler {
  #[allow(deprecated)]
  fn sample(&mut self) -> u64 {
    let mut info = MaybeUninit::<libc::mach_task_basic_info>::zeroed();
    let mut count = (core::mem::size_of::<libc::mach_task_basic_info>()
      / core::mem::size_of::<libc::natural_t>()) as libc::mach_msg_type_number_t;
    let kr = unsafe {
      libc::task_info(
        libc::mach_task_self(),
        libc::MACH_TASK_BASIC_INFO,
        info.as_mut_ptr().cast(),
        &mut count,
      )
    };
    if kr != libc::KERN_SUCCESS {
      return 0;
    }
    unsafe { info.assume_init() }.resident_size
  }

  fn name(&self) -> &'static str {
    "mach"
  }
}

/// Best current-RSS sampler for this platform. Falls back to [`NullSampler`]
/// where no current-RSS query exists.
pub fn platform_sampler() -> Box<dyn MemorySampler> {
  #[cfg(all(target_os = "linux", feature = "statm"))]
  {
    if let Some(sampler) = StatmSampler::open() {
      return Box::new(sampler);
    }
  }

  #[cfg(target_vendor = "apple")]
  let fallback: Box<dyn MemorySampler> = Box::new(MachSampler);
  #[cfg(not(target_vendor = "apple"))]
  let fallback: Box<dyn MemorySampler> = Box::new(NullSampler);
  fallback
}

/// First sample of a run plus the running maximum.
#[derive(Clone, Copy, Debug)]
pub struct PeakTracker {
  first: u64,
  peak: u64,
}

impl PeakTracker {
  pub fn start(sampler: &mut dyn MemorySampler) -> Self {
    let first = sampler.sample();
    Self { first, peak: first }
  }

  #[inline(always)]
  pub fn observe(&mut self, sampler: &mut dyn MemorySampler) {
    self.peak = self.peak.max(sampler.sample());
  }

  pub fn first(&self) -> u64 {
    self.first
  }

  pub fn peak(&self) -> u64 {
    self.peak
  }
}

// =============================================================================
// Size Generator
// =============================================================================

/// Seeded, reproducible stream of request sizes in `[MIN_SZ, MAX_SZ]`.
pub struct SizeGen {
  rng: SmallRng,
  sizes: Uniform<usize>,
}

impl SizeGen {
  pub fn new(seed: u64) -> Self {
    Self {
      rng: SmallRng::seed_from_u64(seed),
      sizes: Uniform::new_inclusive(MIN_SZ, MAX_SZ),
    }
  }

  #[inline(always)]
  pub fn next_size(&mut self) -> usize {
    self.sizes.sample(&mut self.rng)
  }

  /// Picks an index below `len`. The draw spans `0..bound` and is then
  /// reduced, so the victim depends on the run length as well as the seed.
  #[inline]
  pub fn victim(&mut self, bound: usize, len: usize) -> usize {
    debug_assert!(len > 0, "victim: no live blocks");
    self.rng.gen_range(0..bound.max(1)) % len
  }
}

impl Iterator for SizeGen {
  type Item = usize;

  fn next(&mut self) -> Option<usize> {
    Some(self.next_size())
  }
}

// =============================================================================
// Touch
// =============================================================================

/// Writes the first and last byte of `region` so its pages are committed.
#[inline(always)]
fn touch(region: &mut [MaybeUninit<u8>]) {
  let len = region.len();
  if len == 0 {
    return;
  }
  let base = region.as_mut_ptr().cast::<u8>();
  // Volatile: nothing reads these bytes back.
  unsafe {
    ptr::write_volatile(base, len as u8);
    ptr::write_volatile(base.add(len - 1), (len >> 1) as u8);
  }
}

// =============================================================================
// Baseline
// =============================================================================

/// One individually allocated block. Freed on drop.
struct Block(Box<[MaybeUninit<u8>]>);

impl Block {
  /// Allocation failure aborts through `handle_alloc_error`.
  #[inline(always)]
  fn new(size: usize) -> Self {
    let mut bytes = Box::<[u8]>::new_uninit_slice(size);
    touch(&mut bytes);
    Self(bytes)
  }

  fn len(&self) -> usize {
    self.0.len()
  }
}

/// Unordered set of outstanding blocks.
pub struct LiveBlocks {
  blocks: Vec<Block>,
}

impl LiveBlocks {
  pub fn with_capacity(capacity: usize) -> Self {
    Self {
      blocks: Vec::with_capacity(capacity),
    }
  }

  /// Allocates and touches a block of `size` bytes.
  #[inline(always)]
  pub fn insert(&mut self, size: usize) {
    self.blocks.push(Block::new(size));
  }

  /// Frees the block at `idx` in O(1) by moving the last block into its slot.
  /// Returns the freed size.
  #[inline]
  pub fn evict(&mut self, idx: usize) -> usize {
    self.blocks.swap_remove(idx).len()
  }

  /// Frees every block. Returns how many were freed.
  pub fn release_all(&mut self) -> usize {
    let count = self.blocks.len();
    self.blocks.clear();
    count
  }

  pub fn len(&self) -> usize {
    self.blocks.len()
  }

  pub fn is_empty(&self) -> bool {
    self.blocks.is_empty()
  }
}

/// Whether the baseline loop evicts a random block at `step`.
#[inline(always)]
pub const fn evicts_at(step: usize) -> bool {
  step > EVICT_AFTER && step % EVICT_EVERY == 0
}

/// Individually allocated blocks with random eviction.
pub struct Baseline {
  sizes: SizeGen,
}

impl Baseline {
  pub fn new(seed: u64) -> Self {
    Self {
      sizes: SizeGen::new(seed),
    }
  }
}

// =============================================================================
// Pooled
// =============================================================================

/// Fixed region with a monotonic bump cursor.
pub struct Pool {
  bytes: Box<[MaybeUninit<u8>]>,
  offset: usize,
}

impl Pool {
  /// Reserves `capacity` bytes in one allocation and zero-fills them, so
  /// every page of the pool is committed before the first claim.
  pub fn with_capacity(capacity: usize) -> Self {
    let mut bytes = Box::<[u8]>::new_uninit_slice(capacity);
    unsafe { ptr::write_bytes(bytes.as_mut_ptr(), 0, capacity) };
    Self { bytes, offset: 0 }
  }

  pub fn capacity(&self) -> usize {
    self.bytes.len()
  }

  pub fn offset(&self) -> usize {
    self.offset
  }

  /// Grants `size` bytes only if `offset + size < capacity`. A refused claim
  /// leaves the cursor where it was.
  #[inline(always)]
  pub fn claim(&mut self, size: usize) -> Option<&mut [MaybeUninit<u8>]> {
    let start = self.offset;
    let end = start.checked_add(size)?;
    if end >= self.bytes.len() {
      return None;
    }
    self.offset = end;
    Some(&mut self.bytes[start..end])
  }
}

/// Pessimistic pool size for `total` requests, so the pool never grows.
pub const fn pool_capacity(total: usize) -> usize {
  total.saturating_mul(MAX_SZ)
}

/// Bump allocation inside one up-front region.
pub struct Pooled {
  sizes: SizeGen,
}

impl Pooled {
  pub fn new(seed: u64) -> Self {
    Self {
      sizes: SizeGen::new(seed),
    }
  }
}

// =============================================================================
// Strategy
// =============================================================================

/// A measured allocation strategy.
pub trait Strategy {
  fn mode(&self) -> Mode;

  /// Serves up to `total` requests, sampling RSS after each one.
  fn run(&mut self, total: usize, sampler: &mut dyn MemorySampler) -> RunResult;
}

impl Strategy for Baseline {
  fn mode(&self) -> Mode {
    Mode::Baseline
  }

  fn run(&mut self, total: usize, sampler: &mut dyn MemorySampler) -> RunResult {
    let mut live = LiveBlocks::with_capacity(total);
    let mut stats = AllocStats::default();
    let mut peak = PeakTracker::start(sampler);

    debug!(mode = %self.mode(), total, sampler = sampler.name(), "run starting");
    let started = Instant::now();

    for step in 0..total {
      let size = self.sizes.next_size();
      live.insert(size);
      stats.requests += 1;
      stats.served += 1;
      stats.alloc_calls += 1;
      stats.bytes_granted += size;
      stats.max_live = stats.max_live.max(live.len());

      if evicts_at(step) {
        let victim = self.sizes.victim(total, live.len());
        live.evict(victim);
        stats.evictions += 1;
        stats.releases += 1;
      }
      debug_assert!(stats.releases <= stats.alloc_calls, "baseline: freed more than allocated");

      peak.observe(sampler);
    }

    let elapsed = started.elapsed();

    stats.releases += live.release_all();
    debug_assert!(live.is_empty());
    debug_assert_eq!(stats.live(), 0, "baseline: blocks leaked past cleanup");

    debug!(
      mode = %self.mode(),
      secs = elapsed.as_secs_f64(),
      peak_rss = peak.peak(),
      evictions = stats.evictions,
      "run finished"
    );

    RunResult {
      mode: self.mode(),
      total,
      elapsed,
      first_rss: peak.first(),
      peak_rss: peak.peak(),
      stats,
    }
  }
}

impl Strategy for Pooled {
  fn mode(&self) -> Mode {
    Mode::Pooled
  }

  fn run(&mut self, total: usize, sampler: &mut dyn MemorySampler) -> RunResult {
    let mut pool = Pool::with_capacity(pool_capacity(total));
    let mut stats = AllocStats {
      alloc_calls: usize::from(pool.capacity() > 0),
      ..AllocStats::default()
    };
    stats.max_live = stats.alloc_calls;
    let mut peak = PeakTracker::start(sampler);

    debug!(
      mode = %self.mode(),
      total,
      capacity = pool.capacity(),
      sampler = sampler.name(),
      "run starting"
    );
    let started = Instant::now();

    for _ in 0..total {
      let size = self.sizes.next_size();
      stats.requests += 1;
      let Some(region) = pool.claim(size) else {
        break;
      };
      touch(region);
      stats.served += 1;
      stats.bytes_granted += size;

      peak.observe(sampler);
    }

    let elapsed = started.elapsed();
    debug_assert_eq!(pool.offset(), stats.bytes_granted);

    if stats.served < total {
      debug!(
        served = stats.served,
        total,
        offset = pool.offset(),
        capacity = pool.capacity(),
        "pool exhausted, remaining requests skipped"
      );
    }
    debug!(
      mode = %self.mode(),
      secs = elapsed.as_secs_f64(),
      peak_rss = peak.peak(),
      "run finished"
    );

    // The whole pool goes back in one call.
    drop(pool);
    stats.releases = stats.alloc_calls;

    RunResult {
      mode: self.mode(),
      total,
      elapsed,
      first_rss: peak.first(),
      peak_rss: peak.peak(),
      stats,
    }
  }
}

// =============================================================================
// Driver
// =============================================================================

/// Runs baseline, then pooled, one after the other with the same sampler.
pub fn run_all(config: &Config, sampler: &mut dyn MemorySampler) -> Vec<RunResult> {
  let mut strategies: [Box<dyn Strategy>; 2] = [
    Box::new(Baseline::new(config.baseline_seed)),
    Box::new(Pooled::new(config.pooled_seed)),
  ];

  let results: Vec<RunResult> = strategies
    .iter_mut()
    .map(|strategy| strategy.run(config.ops, sampler))
    .collect();

  for result in results.iter().filter(|r| r.stopped_early()) {
    info!(
      mode = %result.mode,
      served = result.stats.served,
      requested = result.total,
      "run stopped early, throughput is not directly comparable"
    );
  }

  results
}

// =============================================================================
// Report
// =============================================================================

/// Fixed-column results table.
pub struct Report {
  ops: usize,
  rows: Vec<RunResult>,
}

impl Report {
  pub fn new(ops: usize, rows: impl IntoIterator<Item = RunResult>) -> Self {
    Self {
      ops,
      rows: rows.into_iter().collect(),
    }
  }
}

impl fmt::Display for Report {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    writeln!(f)?;
    writeln!(f, "=== Allocation-intensive benchmark ===")?;
    writeln!(f, "ops = {}", self.ops)?;
    writeln!(f)?;
    writeln!(f, "{:<13} {:>10} {:>15}", "mode", "time [s]", "peak RSS [MiB]")?;
    writeln!(f, "{:-<13} {:-<10} {:-<15}", "", "", "")?;
    for row in &self.rows {
      writeln!(f, "{:<13} {:>10.4} {:>15.2}", row.mode, row.secs(), row.peak_mib())?;
    }
    Ok(())
  }
}

// =============================================================================
// Utils
// =============================================================================

#[inline]
pub fn bytes_to_mib(bytes: u64) -> f64 {
  bytes as f64 / BYTES_PER_MIB
}
