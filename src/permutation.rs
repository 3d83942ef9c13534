//! Permutation null generator.
//!
//! Under the null hypothesis group membership carries no information, so
//! every split of the pooled studies into groups of the original sizes is
//! equally likely. For each split we aggregate both pseudo-groups, take their
//! difference and record it into the per-voxel null distribution.
//!
//! Each iteration is a pure function of its index: partition `i` is drawn
//! from an RNG seeded with `seed + i`, so the output is identical no matter
//! how rayon schedules the work.

use std::ops::Range;
use std::time::Instant;

use itertools::Itertools;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_xorshift::XorShiftRng;
use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::difference::difference;
use crate::error::{Result, SubtractionError};
use crate::estimator::Aggregator;
use crate::null::NullDistribution;

/// One relabelling of the pooled studies.
///
/// `in_first[i]` is true when pooled study `i` is assigned to pseudo-group A.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Partition {
    in_first: Vec<bool>,
}

impl Partition {
    /// Partition of `n` studies with the given indices in pseudo-group A.
    pub fn from_first(n: usize, first: &[usize]) -> Self {
        let mut in_first = vec![false; n];
        for &i in first {
            in_first[i] = true;
        }
        Self { in_first }
    }

    /// The original labelling: the first `n_first` pooled studies are A.
    pub fn observed(n_first: usize, n_second: usize) -> Self {
        let mut in_first = vec![true; n_first];
        in_first.resize(n_first + n_second, false);
        Self { in_first }
    }

    /// Same split with the labels exchanged.
    #[must_use]
    pub fn complement(&self) -> Self {
        Self { in_first: self.in_first.iter().map(|b| !b).collect() }
    }

    pub fn len(&self) -> usize {
        self.in_first.len()
    }

    pub fn is_empty(&self) -> bool {
        self.in_first.is_empty()
    }

    /// Size of pseudo-group A.
    pub fn first_len(&self) -> usize {
        self.in_first.iter().filter(|&&b| b).count()
    }

    pub fn is_first(&self, i: usize) -> bool {
        self.in_first[i]
    }

    /// Split `pool` into (pseudo-group A, pseudo-group B) maps, both in pool
    /// order.
    pub fn split<'a>(&self, pool: &'a [Vec<f64>]) -> (Vec<&'a [f64]>, Vec<&'a [f64]>) {
        let mut first = Vec::with_capacity(pool.len());
        let mut second = Vec::with_capacity(pool.len());
        for (map, &is_first) in pool.iter().zip(&self.in_first) {
            if is_first {
                first.push(map.as_slice());
            } else {
                second.push(map.as_slice());
            }
        }
        (first, second)
    }
}

/// A finite, indexable sequence of partitions.
pub trait PartitionSource: Sync {
    /// Number of partitions (permutations) to evaluate.
    fn len(&self) -> usize;

    /// Partition for iteration `iteration`; must be deterministic.
    fn partition(&self, iteration: usize) -> Partition;

    /// True when every distinct partition appears exactly once.
    fn is_exhaustive(&self) -> bool {
        false
    }
}

/// Monte Carlo partitions: independent uniform draws, repeats allowed.
#[derive(Clone, Debug)]
pub struct RandomPartitions {
    n: usize,
    n_first: usize,
    n_iterations: usize,
    seed: u64,
}

impl RandomPartitions {
    pub fn new(n_first: usize, n_second: usize, n_iterations: usize, seed: u64) -> Self {
        Self {
            n: n_first + n_second,
            n_first,
            n_iterations,
            seed,
        }
    }
}

impl PartitionSource for RandomPartitions {
    fn len(&self) -> usize {
        self.n_iterations
    }

    fn partition(&self, iteration: usize) -> Partition {
        let mut rng = XorShiftRng::seed_from_u64(self.seed.wrapping_add(iteration as u64));
        let mut indices: Vec<usize> = (0..self.n).collect();
        // In-place Fisher-Yates; the first n_first indices form group A.
        indices.shuffle(&mut rng);
        Partition::from_first(self.n, &indices[..self.n_first])
    }
}

/// Every split of the pool, each exactly once, in lexicographic order.
#[derive(Clone, Debug)]
pub struct ExhaustivePartitions {
    partitions: Vec<Partition>,
}

impl ExhaustivePartitions {
    pub fn new(n_first: usize, n_second: usize) -> Self {
        let n = n_first + n_second;
        let partitions = (0..n)
            .combinations(n_first)
            .map(|first| Partition::from_first(n, &first))
            .collect();
        Self { partitions }
    }
}

impl PartitionSource for ExhaustivePartitions {
    fn len(&self) -> usize {
        self.partitions.len()
    }

    fn partition(&self, iteration: usize) -> Partition {
        self.partitions[iteration].clone()
    }

    fn is_exhaustive(&self) -> bool {
        true
    }
}

/// How partitions are chosen.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PartitionStrategy {
    /// Enumerate every split when there are no more of them than requested
    /// permutations, otherwise sample.
    #[default]
    Auto,
    /// Always draw i.i.d. random splits.
    Sample,
}

/// `n choose k`, saturating at `u64::MAX`.
pub fn n_choose_k(n: usize, k: usize) -> u64 {
    if k > n {
        return 0;
    }
    let k = k.min(n - k);
    let mut acc: u128 = 1;
    for i in 0..k {
        acc = acc * (n - i) as u128 / (i + 1) as u128;
        if acc > u64::MAX as u128 {
            return u64::MAX;
        }
    }
    acc as u64
}

/// Pick the partition source for a run.
pub fn plan_partitions(
    strategy: PartitionStrategy,
    n_first: usize,
    n_second: usize,
    n_permutations: usize,
    seed: u64,
) -> Box<dyn PartitionSource> {
    let distinct = n_choose_k(n_first + n_second, n_first);
    match strategy {
        PartitionStrategy::Auto if distinct <= n_permutations as u64 => {
            info!(
                distinct,
                requested = n_permutations,
                "Enumerating all partitions instead of sampling"
            );
            Box::new(ExhaustivePartitions::new(n_first, n_second))
        }
        _ => Box::new(RandomPartitions::new(n_first, n_second, n_permutations, seed)),
    }
}

/* ---------------------------------------------------------------------------
 *  Null generation
 * ---------------------------------------------------------------------------
 * Iterations are cut into one contiguous chunk per rayon worker. Each chunk
 * folds sequentially into its own accumulator and the accumulators are then
 * merged in chunk order, so at most `workers` accumulators are alive at once:
 * peak null memory is `min(K, workers) x accumulator size`. Any failed
 * iteration aborts the run.
 */

/// Split `0..len` into at most `workers` contiguous, near-equal ranges.
pub(crate) fn chunk_ranges(len: usize, workers: usize) -> Vec<Range<usize>> {
    let chunk = len.div_ceil(workers.max(1)).max(1);
    (0..len)
        .step_by(chunk)
        .map(|start| start..(start + chunk).min(len))
        .collect()
}

/// Difference map for one partition of the pool.
pub fn partition_difference(
    pool: &[Vec<f64>],
    partition: &Partition,
    aggregator: &dyn Aggregator,
) -> Result<Vec<f64>> {
    if partition.len() != pool.len() {
        return Err(SubtractionError::ShapeMismatch {
            what: "partition and study pool",
            left: partition.len().to_string(),
            right: pool.len().to_string(),
        });
    }
    let n_voxels = pool.first().map_or(0, Vec::len);
    let (first, second) = partition.split(pool);
    let group_a = aggregator.aggregate(&first, n_voxels);
    let group_b = aggregator.aggregate(&second, n_voxels);
    difference(&group_a, &group_b)
}

/// Accumulate the null distribution over every partition in `partitions`.
///
/// `prototype` is an empty accumulator that fixes the representation.
///
/// # Errors
///
/// `InsufficientData` if `n_first` is zero or covers the whole pool;
/// `InvalidConfig` if a partition has the wrong group size or there are no
/// partitions; any error from the difference engine.
pub fn generate_null(
    pool: &[Vec<f64>],
    n_first: usize,
    partitions: &dyn PartitionSource,
    aggregator: &dyn Aggregator,
    prototype: &NullDistribution,
) -> Result<NullDistribution> {
    let n_second = pool.len().saturating_sub(n_first);
    if n_first == 0 || n_second == 0 {
        let (group, available) = if n_first == 0 {
            (crate::dataset::Group::A, n_first)
        } else {
            (crate::dataset::Group::B, n_second)
        };
        return Err(SubtractionError::InsufficientData { group, available, required: 1 });
    }
    if partitions.len() == 0 {
        return Err(SubtractionError::invalid_config("at least one permutation is required"));
    }

    let start = Instant::now();
    debug!(
        studies = pool.len(),
        n_first,
        iterations = partitions.len(),
        "Generating permutation null"
    );

    let chunks = chunk_ranges(partitions.len(), rayon::current_num_threads());
    let null = chunks
        .into_par_iter()
        .map(|mut range| {
            range.try_fold(prototype.empty_like(), |mut acc, iteration| {
                let partition = partitions.partition(iteration);
                if partition.first_len() != n_first {
                    return Err(SubtractionError::invalid_config(format!(
                        "partition {iteration} assigns {} studies to group A, expected {n_first}",
                        partition.first_len()
                    )));
                }
                let diff = partition_difference(pool, &partition, aggregator)?;
                acc.record(&diff)?;
                Ok(acc)
            })
        })
        .try_reduce_with(|a, b| a.merge(b))
        .unwrap_or_else(|| Ok(prototype.empty_like()))?;

    debug!(
        samples = null.n_samples(),
        elapsed_ms = start.elapsed().as_millis() as u64,
        "Permutation null complete"
    );
    Ok(null)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::estimator::Aggregation;
    use crate::null::NullRepresentation;

    fn prototype(observed: &[f64]) -> NullDistribution {
        NullDistribution::empty(NullRepresentation::Full, Arc::from(observed.to_vec()), 1.0).unwrap()
    }

    #[test]
    fn test_n_choose_k() {
        assert_eq!(n_choose_k(10, 5), 252);
        assert_eq!(n_choose_k(4, 2), 6);
        assert_eq!(n_choose_k(5, 0), 1);
        assert_eq!(n_choose_k(3, 4), 0);
        assert_eq!(n_choose_k(200, 100), u64::MAX);
    }

    #[test]
    fn test_chunk_ranges_cover_iterations_once() {
        for (len, workers) in [(10, 4), (3, 8), (252, 1), (1000, 7), (0, 4)] {
            let ranges = chunk_ranges(len, workers);
            assert!(ranges.len() <= workers, "{len} iterations over {workers} workers");
            let flat: Vec<usize> = ranges.into_iter().flatten().collect();
            assert_eq!(flat, (0..len).collect::<Vec<_>>());
        }
    }

    #[test]
    fn test_accumulators_bounded_by_workers() {
        let pool: Vec<Vec<f64>> = (0..6).map(|i| vec![i as f64 / 10.0; 3]).collect();
        let source = RandomPartitions::new(3, 3, 500, 5);
        let null = rayon::ThreadPoolBuilder::new()
            .num_threads(3)
            .build()
            .unwrap()
            .install(|| {
                assert_eq!(chunk_ranges(source.len(), rayon::current_num_threads()).len(), 3);
                generate_null(&pool, 3, &source, &Aggregation::DensitySum, &prototype(&[0.0; 3])).unwrap()
            });
        assert_eq!(null.n_samples(), 500);
    }

    #[test]
    fn test_random_partitions_sizes_and_determinism() {
        let source = RandomPartitions::new(3, 5, 50, 7);
        for i in 0..source.len() {
            let p = source.partition(i);
            assert_eq!(p.len(), 8);
            assert_eq!(p.first_len(), 3);
            assert_eq!(p, source.partition(i));
        }
        let other_seed = RandomPartitions::new(3, 5, 50, 8);
        assert!((0..50).any(|i| source.partition(i) != other_seed.partition(i)));
    }

    #[test]
    fn test_exhaustive_partitions_are_distinct() {
        let source = ExhaustivePartitions::new(2, 2);
        assert_eq!(source.len(), 6);
        assert!(source.is_exhaustive());
        let all: Vec<Partition> = (0..6).map(|i| source.partition(i)).collect();
        for (i, a) in all.iter().enumerate() {
            assert_eq!(a.first_len(), 2);
            assert!(all[i + 1..].iter().all(|b| b != a));
        }
        assert_eq!(all[0], Partition::observed(2, 2));
    }

    #[test]
    fn test_plan_partitions() {
        let exhaustive = plan_partitions(PartitionStrategy::Auto, 5, 5, 10_000, 1);
        assert!(exhaustive.is_exhaustive());
        assert_eq!(exhaustive.len(), 252);

        let sampled = plan_partitions(PartitionStrategy::Auto, 5, 5, 100, 1);
        assert!(!sampled.is_exhaustive());
        assert_eq!(sampled.len(), 100);

        let forced = plan_partitions(PartitionStrategy::Sample, 2, 2, 1_000, 1);
        assert!(!forced.is_exhaustive());
        assert_eq!(forced.len(), 1_000);
    }

    #[test]
    fn test_partition_difference_and_complement() {
        let pool = vec![vec![0.5, 0.0], vec![0.5, 0.0], vec![0.0, 0.2], vec![0.0, 0.0]];
        let p = Partition::observed(2, 2);
        let rule = Aggregation::ProbabilisticUnion;
        let d = partition_difference(&pool, &p, &rule).unwrap();
        assert!((d[0] - 0.75).abs() < 1e-12);
        assert!((d[1] + 0.2).abs() < 1e-12);

        let swapped = partition_difference(&pool, &p.complement(), &rule).unwrap();
        assert_eq!(swapped, d.iter().map(|v| -v).collect::<Vec<_>>());
    }

    #[test]
    fn test_generate_null_is_deterministic_across_thread_pools() {
        let pool: Vec<Vec<f64>> = (0..8)
            .map(|i| (0..5).map(|v| ((i * 7 + v * 3) % 10) as f64 / 10.0).collect())
            .collect();
        let observed = vec![0.0; 5];
        let source = RandomPartitions::new(4, 4, 200, 99);
        let rule = Aggregation::ProbabilisticUnion;

        let run = |threads: usize| {
            rayon::ThreadPoolBuilder::new()
                .num_threads(threads)
                .build()
                .unwrap()
                .install(|| generate_null(&pool, 4, &source, &rule, &prototype(&observed)).unwrap())
        };
        let one = run(1);
        let four = run(4);
        assert_eq!(one.n_samples(), 200);
        let crate::null::NullStore::Full(a) = one.store() else { panic!() };
        let crate::null::NullStore::Full(b) = four.store() else { panic!() };
        for i in 0..200 {
            assert_eq!(a.iteration(i), b.iteration(i));
        }
    }

    #[test]
    fn test_generate_null_rejects_empty_group() {
        let pool = vec![vec![0.1], vec![0.2]];
        let source = RandomPartitions::new(0, 2, 10, 1);
        let err = generate_null(&pool, 0, &source, &Aggregation::DensitySum, &prototype(&[0.0]));
        assert!(matches!(err, Err(SubtractionError::InsufficientData { .. })));

        let err = generate_null(&pool, 2, &source, &Aggregation::DensitySum, &prototype(&[0.0]));
        assert!(matches!(
            err,
            Err(SubtractionError::InsufficientData { group: crate::dataset::Group::B, .. })
        ));
    }

    struct Lopsided;

    impl PartitionSource for Lopsided {
        fn len(&self) -> usize {
            4
        }

        fn partition(&self, iteration: usize) -> Partition {
            if iteration == 3 {
                Partition::observed(1, 2)
            } else {
                Partition::observed(2, 1)
            }
        }
    }

    #[test]
    fn test_bad_partition_aborts_run() {
        let pool = vec![vec![0.1], vec![0.2], vec![0.3]];
        let err = generate_null(&pool, 2, &Lopsided, &Aggregation::DensitySum, &prototype(&[0.0]));
        assert!(matches!(err, Err(SubtractionError::InvalidConfig { .. })));
    }
}
