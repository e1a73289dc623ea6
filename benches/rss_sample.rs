use criterion::{Criterion, Throughput, black_box, criterion_group, criterion_main};
use fragbench::{MemorySampler, NullSampler};

#[cfg(target_vendor = "apple")]
use fragbench::MachSampler;
#[cfg(all(target_os = "linux", feature = "statm"))]
use fragbench::StatmSampler;

/// Every sampler the current target can build.
fn samplers() -> Vec<(&'static str, Box<dyn MemorySampler>)> {
  let mut samplers: Vec<(&'static str, Box<dyn MemorySampler>)> = vec![("null", Box::new(NullSampler))];

  #[cfg(target_vendor = "apple")]
  samplers.push(("mach", Box::new(MachSampler)));

  #[cfg(all(target_os = "linux", feature = "statm"))]
  {
    if let Some(statm) = StatmSampler::open() {
      samplers.push(("statm", Box::new(statm)));
    }
  }

  samplers
}

fn bench_rss_sample(c: &mut Criterion) {
  let mut group = c.benchmark_group("rss_sample");
  group.throughput(Throughput::Elements(1));
  for (name, mut sampler) in samplers() {
    group.bench_function(name, |b| b.iter(|| black_box(sampler.sample())));
  }
  group.finish();
}

fn bench_rss_sample_batch(c: &mut Criterion) {
  let mut group = c.benchmark_group("rss_sample_batch");

  const ITERATIONS: u64 = 1000;
  group.throughput(Throughput::Elements(ITERATIONS));

  for (name, mut sampler) in samplers() {
    group.bench_function(format!("{name}_x1000"), |b| {
      b.iter(|| {
        let mut peak = 0u64;
        for _ in 0..ITERATIONS {
          peak = peak.max(sampler.sample());
        }
        black_box(peak)
      })
    });
  }

  group.finish();
}

criterion_group!(benches, bench_rss_sample, bench_rss_sample_batch);
criterion_main!(benches);
