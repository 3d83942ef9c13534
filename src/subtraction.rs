//! Subtraction analysis: the end-to-end pipeline.
//!
//! 1. Validate inputs (both groups non-empty, same grid) before any work.
//! 2. Compute every study's kernel map once, in parallel.
//! 3. Aggregate each group and take the observed difference.
//! 4. Build the permutation null from the cached maps.
//! 5. Convert observed + null into p and z maps.

use std::sync::Arc;
use std::time::Instant;

use rayon::prelude::*;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::dataset::{Dataset, Group};
use crate::error::{Result, SubtractionError};
use crate::estimator::{Aggregation, Aggregator};
use crate::kernel::{KernelConfig, KernelTransformer};
use crate::null::{NullDistribution, NullRepresentation};
use crate::permutation::{generate_null, partition_difference, plan_partitions, Partition, PartitionStrategy};
use crate::result::{RunMetadata, SubtractionResult};
use crate::significance::significance_maps;

/// Permutations run when none are requested explicitly.
pub const DEFAULT_N_PERMUTATIONS: usize = 10_000;

/// Seed used when the caller does not supply one, so unseeded runs are still
/// reproducible.
pub const DEFAULT_SEED: u64 = 20252025;

/// Everything that controls a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SubtractionConfig {
    pub kernel: KernelConfig,
    /// `None` picks the rule conventionally paired with the kernel
    pub aggregation: Option<Aggregation>,
    pub n_permutations: usize,
    pub seed: Option<u64>,
    pub null_representation: NullRepresentation,
    pub partition_strategy: PartitionStrategy,
    /// Upper edge of the histogram; derived from the data when `None`
    pub histogram_bound: Option<f64>,
}

impl Default for SubtractionConfig {
    fn default() -> Self {
        Self {
            kernel: KernelConfig::default(),
            aggregation: None,
            n_permutations: DEFAULT_N_PERMUTATIONS,
            seed: None,
            null_representation: NullRepresentation::default(),
            partition_strategy: PartitionStrategy::default(),
            histogram_bound: None,
        }
    }
}

impl SubtractionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.n_permutations == 0 {
            return Err(SubtractionError::invalid_config("n_permutations must be at least 1"));
        }
        self.null_representation.validate()?;
        if let Some(bound) = self.histogram_bound {
            if !(bound.is_finite() && bound > 0.0) {
                return Err(SubtractionError::invalid_config(format!(
                    "histogram bound must be positive, got {bound}"
                )));
            }
        }
        Ok(())
    }
}

/// A configured subtraction estimator.
pub struct Subtraction {
    config: SubtractionConfig,
    kernel: Box<dyn KernelTransformer>,
    aggregator: Box<dyn Aggregator>,
}

impl Subtraction {
    /// Estimator using the built-in collaborators named by `config`.
    pub fn new(config: SubtractionConfig) -> Result<Self> {
        config.validate()?;
        let kernel = config.kernel.build()?;
        let aggregation = config.aggregation.unwrap_or_else(|| config.kernel.default_aggregation());
        Ok(Self { config, kernel, aggregator: Box::new(aggregation) })
    }

    /// Estimator with caller-supplied kernel and aggregation rule.
    pub fn with_collaborators(
        config: SubtractionConfig,
        kernel: Box<dyn KernelTransformer>,
        aggregator: Box<dyn Aggregator>,
    ) -> Result<Self> {
        config.validate()?;
        Ok(Self { config, kernel, aggregator })
    }

    pub fn config(&self) -> &SubtractionConfig {
        &self.config
    }

    /// Kernel map for every study of `a` followed by every study of `b`.
    pub fn study_maps(&self, a: &Dataset, b: &Dataset) -> Result<Vec<Vec<f64>>> {
        let grid = a.grid();
        a.studies()
            .par_iter()
            .chain(b.studies().par_iter())
            .map(|study| self.kernel.transform(study, grid))
            .collect()
    }

    /// Compare `a` against `b`; positive differences mean stronger
    /// convergence in `a`.
    ///
    /// # Errors
    ///
    /// `InsufficientData` if either dataset is empty, `ShapeMismatch` if the
    /// grids differ, and any kernel failure.
    pub fn fit(&self, a: &Dataset, b: &Dataset) -> Result<SubtractionResult> {
        for (group, dataset) in [(Group::A, a), (Group::B, b)] {
            if dataset.is_empty() {
                return Err(SubtractionError::InsufficientData {
                    group,
                    available: 0,
                    required: 1,
                });
            }
            let mislabelled = dataset.studies().iter().filter(|s| s.group() != group).count();
            if mislabelled > 0 {
                warn!(%group, mislabelled, "Studies tagged with the other group; using dataset position");
            }
        }
        a.grid().ensure_compatible(b.grid())?;

        let (n_a, n_b) = (a.len(), b.len());
        let grid = a.grid();
        let start = Instant::now();
        info!(
            studies_a = n_a,
            studies_b = n_b,
            foci_a = a.n_foci(),
            foci_b = b.n_foci(),
            voxels = grid.n_voxels(),
            kernel = %self.kernel.describe(),
            "Starting subtraction analysis"
        );

        let pool = self.study_maps(a, b)?;
        debug!(maps = pool.len(), "Cached per-study kernel maps");

        let observed = partition_difference(&pool, &Partition::observed(n_a, n_b), self.aggregator.as_ref())?;

        let seed = self.config.seed.unwrap_or(DEFAULT_SEED);
        let partitions = plan_partitions(
            self.config.partition_strategy,
            n_a,
            n_b,
            self.config.n_permutations,
            seed,
        );
        let bound = self
            .config
            .histogram_bound
            .unwrap_or_else(|| self.aggregator.difference_bound(&pool));
        let observed_shared: Arc<[f64]> = Arc::from(observed.as_slice());
        let prototype = NullDistribution::empty(self.config.null_representation, observed_shared, bound)?;

        let null = generate_null(&pool, n_a, partitions.as_ref(), self.aggregator.as_ref(), &prototype)?;
        let significance = significance_maps(&observed, &null)?;

        info!(
            permutations = null.n_samples(),
            exhaustive = partitions.is_exhaustive(),
            degenerate_voxels = significance.n_degenerate,
            elapsed_ms = start.elapsed().as_millis() as u64,
            "Subtraction analysis complete"
        );

        let metadata = RunMetadata {
            n_studies_a: n_a,
            n_studies_b: n_b,
            n_permutations_requested: self.config.n_permutations,
            n_permutations: null.n_samples(),
            exhaustive: partitions.is_exhaustive(),
            seed,
            kernel: self.config.kernel.clone(),
            kernel_description: self.kernel.describe(),
            aggregation: self.aggregator.describe(),
            null_representation: null.representation(),
            n_voxels: grid.n_voxels(),
            n_degenerate_voxels: significance.n_degenerate,
        };
        SubtractionResult::new(grid.clone(), observed, significance.z, significance.p, metadata)
    }
}

/// One-call entry point with default null representation and partition
/// strategy.
pub fn run_subtraction(
    dataset_a: &Dataset,
    dataset_b: &Dataset,
    kernel_config: &KernelConfig,
    n_permutations: usize,
    seed: Option<u64>,
) -> Result<SubtractionResult> {
    let config = SubtractionConfig {
        kernel: kernel_config.clone(),
        n_permutations,
        seed,
        ..SubtractionConfig::default()
    };
    Subtraction::new(config)?.fit(dataset_a, dataset_b)
}
