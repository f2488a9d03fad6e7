//! Fingerprinting and estimation algebra benchmarks.
//!
//! Run with: `cargo bench -p hc-calc --bench calc_bench`

use std::hint::black_box;
use std::sync::Arc;

use criterion::{BenchmarkId, Criterion, criterion_group, criterion_main};
use hc_calc::{Calculation, Fingerprint};
use hc_core::{Estimation, Histogram};
use hc_data::{Binning, Patch, Process, Projection, Region, RegionVariation};

fn projection(n_files: usize) -> Projection {
    let files: Vec<String> = (0..n_files).map(|i| format!("mc16_13TeV.{i:06}.root")).collect();
    let process = Process::new("ttbar", files)
        .patched(Patch::Define { field: "ht".into(), expression: "jet1_pt + jet2_pt".into() });
    let region = Region::new("njet >= 4 && nbjet >= 2", "weight_mc * weight_pileup")
        .varied(RegionVariation::Reweighted { weight: "weight_btag_up".into() });
    Projection::new(Arc::new(process), Arc::new(region))
}

fn bench_fingerprint(c: &mut Criterion) {
    let mut group = c.benchmark_group("fingerprint");
    let calc = Calculation::histogram("ht", Binning::uniform(0.0, 2000.0, 40));
    for n_files in [1usize, 100, 1000] {
        let p = projection(n_files);
        group.bench_with_input(BenchmarkId::from_parameter(n_files), &p, |b, p| {
            b.iter(|| Fingerprint::of(black_box(&calc), black_box(p)).unwrap())
        });
    }
    group.finish();
}

fn histogram(n: usize, offset: f64) -> Estimation {
    let edges: Vec<f64> = (0..=n).map(|i| i as f64).collect();
    let contents: Vec<f64> = (0..n).map(|i| 10.0 + offset + (i as f64 * 0.37) % 5.0).collect();
    let variances = contents.clone();
    Histogram::new(edges, contents, variances).unwrap().into()
}

fn bench_algebra(c: &mut Criterion) {
    let mut group = c.benchmark_group("algebra");
    for n in [10usize, 100, 1000] {
        let a = histogram(n, 1.0);
        let b = histogram(n, 2.0);
        let stack: Vec<Estimation> = (0..20).map(|i| histogram(n, i as f64)).collect();
        group.bench_with_input(BenchmarkId::new("ratio", n), &n, |bench, _| {
            bench.iter(|| black_box(&a).ratio(black_box(&b)).unwrap())
        });
        group.bench_with_input(BenchmarkId::new("sum20", n), &n, |bench, _| {
            bench.iter(|| Estimation::sum(black_box(&stack)).unwrap())
        });
    }
    group.finish();
}

criterion_group!(benches, bench_fingerprint, bench_algebra);
criterion_main!(benches);
