//! Single-group estimators: per-study maps to one group convergence map.
//!
//! The permutation generator relies on the rule being invariant to the order
//! in which studies are supplied, since a relabelling only changes set
//! membership.

use serde::{Deserialize, Serialize};

/// Combines the per-study maps of one group into a group map.
pub trait Aggregator: Send + Sync {
    /// Group map over `n_voxels` voxels. Every slice in `maps` has length
    /// `n_voxels`.
    fn aggregate(&self, maps: &[&[f64]], n_voxels: usize) -> Vec<f64>;

    /// Upper bound on `|group_a - group_b|` for any partition of `pool`.
    fn difference_bound(&self, pool: &[Vec<f64>]) -> f64;

    /// Name recorded in run metadata.
    fn describe(&self) -> String;
}

/// Built-in aggregation rules.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Aggregation {
    /// ALE: `1 - Π(1 - mᵢ)`, the probability that at least one study's
    /// modelled activation is present at the voxel.
    #[default]
    ProbabilisticUnion,
    /// Density: `Σ mᵢ`.
    DensitySum,
}

impl Aggregator for Aggregation {
    fn aggregate(&self, maps: &[&[f64]], n_voxels: usize) -> Vec<f64> {
        match self {
            Aggregation::ProbabilisticUnion => {
                let mut miss = vec![1.0; n_voxels];
                for map in maps {
                    debug_assert_eq!(map.len(), n_voxels);
                    for (m, &v) in miss.iter_mut().zip(map.iter()) {
                        *m *= 1.0 - v;
                    }
                }
                miss.into_iter().map(|m| 1.0 - m).collect()
            }
            Aggregation::DensitySum => {
                let mut sum = vec![0.0; n_voxels];
                for map in maps {
                    debug_assert_eq!(map.len(), n_voxels);
                    for (s, &v) in sum.iter_mut().zip(map.iter()) {
                        *s += v;
                    }
                }
                sum
            }
        }
    }

    fn difference_bound(&self, pool: &[Vec<f64>]) -> f64 {
        match self {
            Aggregation::ProbabilisticUnion => 1.0,
            Aggregation::DensitySum => pool
                .iter()
                .map(|m| m.iter().copied().fold(0.0_f64, f64::max))
                .sum::<f64>()
                .max(f64::MIN_POSITIVE),
        }
    }

    fn describe(&self) -> String {
        match self {
            Aggregation::ProbabilisticUnion => "probabilistic_union".into(),
            Aggregation::DensitySum => "density_sum".into(),
        }
    }
}
