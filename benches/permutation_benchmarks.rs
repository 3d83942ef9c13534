//! Benchmarks for kernel maps and the permutation null

use std::sync::Arc;

use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

use ale_subtraction::permutation::{generate_null, partition_difference, RandomPartitions};
use ale_subtraction::{
    Aggregation, Dataset, Grid, Group, KernelConfig, NullDistribution, NullRepresentation, Partition,
    Study, Subtraction, SubtractionConfig,
};

/// Synthetic dataset: studies with three foci spread along the x axis.
fn generate_dataset(group: Group, n_studies: usize, offset: f64) -> Dataset {
    let grid = Grid::isotropic([40, 24, 24], 2.0).unwrap();
    let studies = (0..n_studies)
        .map(|i| {
            let x = offset + (i % 7) as f64;
            let foci = vec![[x, 10.0, 12.0], [x + 2.0, 14.0, 10.0], [x + 4.0, 12.0, 14.0]];
            Study::new(format!("{group}{i}"), foci, 12 + (i as u32 % 20), group)
        })
        .collect();
    Dataset::new(grid, studies)
}

fn bench_study_maps(c: &mut Criterion) {
    let mut group = c.benchmark_group("study_maps");

    for kernel in [KernelConfig::Ale { fwhm: None }, KernelConfig::Mkda { radius: 10.0, value: 1.0 }] {
        let config = SubtractionConfig { kernel: kernel.clone(), ..SubtractionConfig::default() };
        let sub = Subtraction::new(config).unwrap();
        let a = generate_dataset(Group::A, 20, 8.0);
        let b = generate_dataset(Group::B, 20, 20.0);

        group.bench_with_input(BenchmarkId::from_parameter(&kernel), &kernel, |bench, _| {
            bench.iter(|| black_box(sub.study_maps(black_box(&a), black_box(&b)).unwrap()));
        });
    }

    group.finish();
}

fn bench_partition_difference(c: &mut Criterion) {
    let mut group = c.benchmark_group("partition_difference");
    let sub = Subtraction::new(SubtractionConfig::default()).unwrap();

    for n in [10, 40, 80].iter() {
        let a = generate_dataset(Group::A, *n / 2, 8.0);
        let b = generate_dataset(Group::B, *n / 2, 20.0);
        let pool = sub.study_maps(&a, &b).unwrap();
        let partition = Partition::observed(n / 2, n / 2);

        group.bench_with_input(BenchmarkId::from_parameter(n), n, |bench, _| {
            bench.iter(|| {
                let diff = partition_difference(&pool, black_box(&partition), &Aggregation::ProbabilisticUnion);
                black_box(diff)
            });
        });
    }

    group.finish();
}

fn bench_null_representations(c: &mut Criterion) {
    let mut group = c.benchmark_group("null_generation");
    group.sample_size(10);

    let sub = Subtraction::new(SubtractionConfig::default()).unwrap();
    let a = generate_dataset(Group::A, 15, 8.0);
    let b = generate_dataset(Group::B, 15, 20.0);
    let pool = sub.study_maps(&a, &b).unwrap();
    let rule = Aggregation::ProbabilisticUnion;
    let observed = partition_difference(&pool, &Partition::observed(15, 15), &rule).unwrap();
    let observed: Arc<[f64]> = Arc::from(observed);
    let partitions = RandomPartitions::new(15, 15, 200, 20252025);

    for repr in [
        NullRepresentation::Exceedance,
        NullRepresentation::Histogram { bins: 100 },
        NullRepresentation::Full,
    ] {
        let prototype = NullDistribution::empty(repr, Arc::clone(&observed), 1.0).unwrap();
        group.bench_with_input(BenchmarkId::from_parameter(format!("{repr:?}")), &repr, |bench, _| {
            bench.iter(|| black_box(generate_null(&pool, 15, &partitions, &rule, &prototype).unwrap()));
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_study_maps,
    bench_partition_difference,
    bench_null_representations,
);
criterion_main!(benches);
