//! Per-voxel null distributions of the group difference.
//!
//! Three representations are supported, chosen by [`NullRepresentation`]:
//!
//! * **Exceedance**: one counter per voxel of permutation values with
//!   `|null| >= |observed|`. This is all the add-one p-value needs and uses
//!   memory independent of the permutation count.
//! * **Histogram**: fixed-resolution histogram of `|null|` per voxel over
//!   `[0, bound]`. Supports any observed value after the fact.
//! * **Full**: every permutation value, `K x voxels`.
//!
//! All three track per-voxel minimum and maximum so zero-spread voxels can be
//! recognised. Accumulators merge by element-wise addition (counts,
//! histograms, min/max) or by concatenation in iteration order (full), so
//! the result does not depend on how iterations were split across workers.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SubtractionError};

/// Absolute slack, scaled by `max(1, |observed|)`, when comparing a
/// permutation value against the observed one.
pub const TIE_TOLERANCE: f64 = 1e-12;

/// Default histogram resolution.
pub const DEFAULT_HISTOGRAM_BINS: usize = 1_000;

/// How the null distribution is stored.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum NullRepresentation {
    #[default]
    Exceedance,
    Histogram { bins: usize },
    Full,
}

impl NullRepresentation {
    pub fn validate(&self) -> Result<()> {
        match self {
            NullRepresentation::Histogram { bins: 0 } => {
                Err(SubtractionError::invalid_config("histogram needs at least one bin"))
            }
            _ => Ok(()),
        }
    }
}

/// Smallest `|null|` still counted as at least as extreme as `observed`.
#[inline]
fn tie_threshold(observed: f64) -> f64 {
    let magnitude = observed.abs();
    (magnitude - TIE_TOLERANCE * magnitude.max(1.0)).max(0.0)
}

#[inline]
pub(crate) fn exceeds(null_value: f64, observed: f64) -> bool {
    null_value.abs() >= tie_threshold(observed)
}

/* ---------------------------------------------------------------------------
 *  Spread tracking
 * ---------------------------------------------------------------------------
 */

/// Running per-voxel minimum and maximum.
#[derive(Clone, Debug)]
struct Spread {
    min: Vec<f64>,
    max: Vec<f64>,
}

impl Spread {
    fn new(n_voxels: usize) -> Self {
        Self {
            min: vec![f64::INFINITY; n_voxels],
            max: vec![f64::NEG_INFINITY; n_voxels],
        }
    }

    fn record(&mut self, values: &[f64]) {
        for ((lo, hi), &v) in self.min.iter_mut().zip(self.max.iter_mut()).zip(values) {
            *lo = lo.min(v);
            *hi = hi.max(v);
        }
    }

    fn merge(&mut self, other: &Spread) {
        for (lo, &o) in self.min.iter_mut().zip(&other.min) {
            *lo = lo.min(o);
        }
        for (hi, &o) in self.max.iter_mut().zip(&other.max) {
            *hi = hi.max(o);
        }
    }

    fn is_degenerate(&self, voxel: usize) -> bool {
        self.max[voxel] <= self.min[voxel]
    }
}

/* ---------------------------------------------------------------------------
 *  Representations
 * ---------------------------------------------------------------------------
 */

#[derive(Clone, Debug)]
pub struct ExceedanceCounts {
    observed: Arc<[f64]>,
    counts: Vec<u64>,
}

#[derive(Clone, Debug)]
pub struct AbsHistogram {
    bins: usize,
    bound: f64,
    /// voxel-major: `counts[voxel * bins + bin]`
    counts: Vec<u32>,
}

impl AbsHistogram {
    #[inline]
    fn bin_of(&self, value: f64) -> usize {
        let scaled = value.abs() / self.bound * self.bins as f64;
        (scaled as usize).min(self.bins - 1)
    }

    /// Counts for one voxel, lowest bin first.
    pub fn voxel_counts(&self, voxel: usize) -> &[u32] {
        &self.counts[voxel * self.bins..(voxel + 1) * self.bins]
    }
}

#[derive(Clone, Debug)]
pub struct FullNull {
    n_voxels: usize,
    /// permutation-major: `values[iteration * n_voxels + voxel]`
    values: Vec<f64>,
}

impl FullNull {
    /// All permutation values for one voxel in iteration order.
    pub fn voxel_values(&self, voxel: usize) -> impl Iterator<Item = f64> + '_ {
        self.values.iter().skip(voxel).step_by(self.n_voxels).copied()
    }

    /// Difference map of one permutation.
    pub fn iteration(&self, iteration: usize) -> &[f64] {
        &self.values[iteration * self.n_voxels..(iteration + 1) * self.n_voxels]
    }
}

#[derive(Clone, Debug)]
pub enum NullStore {
    Exceedance(ExceedanceCounts),
    Histogram(AbsHistogram),
    Full(FullNull),
}

/// Accumulated null distribution for every voxel.
#[derive(Clone, Debug)]
pub struct NullDistribution {
    n_voxels: usize,
    n_samples: usize,
    spread: Spread,
    store: NullStore,
}

impl NullDistribution {
    /// Empty accumulator.
    ///
    /// `observed` is only consulted by the exceedance representation;
    /// `bound` only by the histogram (upper edge of the last bin).
    pub fn empty(
        representation: NullRepresentation,
        observed: Arc<[f64]>,
        bound: f64,
    ) -> Result<Self> {
        representation.validate()?;
        let n_voxels = observed.len();
        let store = match representation {
            NullRepresentation::Exceedance => NullStore::Exceedance(ExceedanceCounts {
                counts: vec![0; n_voxels],
                observed,
            }),
            NullRepresentation::Histogram { bins } => {
                if !(bound.is_finite() && bound > 0.0) {
                    return Err(SubtractionError::invalid_config(format!(
                        "histogram bound must be positive, got {bound}"
                    )));
                }
                NullStore::Histogram(AbsHistogram {
                    bins,
                    bound,
                    counts: vec![0; n_voxels * bins],
                })
            }
            NullRepresentation::Full => NullStore::Full(FullNull {
                n_voxels,
                values: Vec::new(),
            }),
        };
        Ok(Self {
            n_voxels,
            n_samples: 0,
            spread: Spread::new(n_voxels),
            store,
        })
    }

    /// Fresh accumulator with the same configuration.
    pub fn empty_like(&self) -> Self {
        let store = match &self.store {
            NullStore::Exceedance(e) => NullStore::Exceedance(ExceedanceCounts {
                observed: Arc::clone(&e.observed),
                counts: vec![0; self.n_voxels],
            }),
            NullStore::Histogram(h) => NullStore::Histogram(AbsHistogram {
                bins: h.bins,
                bound: h.bound,
                counts: vec![0; self.n_voxels * h.bins],
            }),
            NullStore::Full(_) => NullStore::Full(FullNull {
                n_voxels: self.n_voxels,
                values: Vec::new(),
            }),
        };
        Self {
            n_voxels: self.n_voxels,
            n_samples: 0,
            spread: Spread::new(self.n_voxels),
            store,
        }
    }

    /// Add one permutation's difference map.
    pub fn record(&mut self, difference: &[f64]) -> Result<()> {
        if difference.len() != self.n_voxels {
            return Err(SubtractionError::ShapeMismatch {
                what: "permutation difference map",
                left: difference.len().to_string(),
                right: self.n_voxels.to_string(),
            });
        }
        self.spread.record(difference);
        match &mut self.store {
            NullStore::Exceedance(e) => {
                for ((count, &obs), &d) in e.counts.iter_mut().zip(e.observed.iter()).zip(difference) {
                    if exceeds(d, obs) {
                        *count += 1;
                    }
                }
            }
            NullStore::Histogram(h) => {
                let bins = h.bins;
                for (voxel, &d) in difference.iter().enumerate() {
                    let bin = h.bin_of(d);
                    h.counts[voxel * bins + bin] += 1;
                }
            }
            NullStore::Full(f) => f.values.extend_from_slice(difference),
        }
        self.n_samples += 1;
        Ok(())
    }

    /// Combine two partial accumulations; `other` holds later iterations.
    pub fn merge(mut self, other: NullDistribution) -> Result<Self> {
        if self.n_voxels != other.n_voxels {
            return Err(SubtractionError::ShapeMismatch {
                what: "null distributions",
                left: self.n_voxels.to_string(),
                right: other.n_voxels.to_string(),
            });
        }
        self.spread.merge(&other.spread);
        match (&mut self.store, other.store) {
            (NullStore::Exceedance(a), NullStore::Exceedance(b)) => {
                for (x, y) in a.counts.iter_mut().zip(b.counts) {
                    *x += y;
                }
            }
            (NullStore::Histogram(a), NullStore::Histogram(b)) if a.bins == b.bins => {
                for (x, y) in a.counts.iter_mut().zip(b.counts) {
                    *x += y;
                }
            }
            (NullStore::Full(a), NullStore::Full(b)) => a.values.extend(b.values),
            _ => {
                return Err(SubtractionError::invalid_config(
                    "cannot merge null distributions of different representations",
                ))
            }
        }
        self.n_samples += other.n_samples;
        Ok(self)
    }

    /// Number of permutation maps recorded.
    pub fn n_samples(&self) -> usize {
        self.n_samples
    }

    pub fn n_voxels(&self) -> usize {
        self.n_voxels
    }

    pub fn store(&self) -> &NullStore {
        &self.store
    }

    pub fn representation(&self) -> NullRepresentation {
        match &self.store {
            NullStore::Exceedance(_) => NullRepresentation::Exceedance,
            NullStore::Histogram(h) => NullRepresentation::Histogram { bins: h.bins },
            NullStore::Full(_) => NullRepresentation::Full,
        }
    }

    /// True when every recorded value at `voxel` is identical.
    pub fn is_degenerate(&self, voxel: usize) -> bool {
        self.n_samples == 0 || self.spread.is_degenerate(voxel)
    }

    /// Smallest and largest permutation value at `voxel`.
    pub fn range(&self, voxel: usize) -> (f64, f64) {
        (self.spread.min[voxel], self.spread.max[voxel])
    }

    /// Number of permutation values at `voxel` at least as extreme as
    /// `observed` in absolute value.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if this is an exceedance counter built for a
    /// different observed value.
    pub fn exceedances(&self, voxel: usize, observed: f64) -> Result<usize> {
        match &self.store {
            NullStore::Exceedance(e) => {
                if e.observed[voxel].to_bits() != observed.to_bits() {
                    return Err(SubtractionError::invalid_config(format!(
                        "exceedance counts at voxel {voxel} were built for observed value {}, not {observed}",
                        e.observed[voxel]
                    )));
                }
                Ok(e.counts[voxel] as usize)
            }
            NullStore::Histogram(h) => {
                // Start at the bin of the tie threshold so values the exact
                // stores count as ties are never missed across a bin edge.
                let from = h.bin_of(tie_threshold(observed));
                Ok(h.voxel_counts(voxel)[from..].iter().map(|&c| c as usize).sum())
            }
            NullStore::Full(f) => Ok(f.voxel_values(voxel).filter(|&v| exceeds(v, observed)).count()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn observed(values: &[f64]) -> Arc<[f64]> {
        Arc::from(values.to_vec())
    }

    fn fill(repr: NullRepresentation, obs: &[f64], rows: &[[f64; 2]]) -> NullDistribution {
        let mut null = NullDistribution::empty(repr, observed(obs), 1.0).unwrap();
        for row in rows {
            null.record(row).unwrap();
        }
        null
    }

    const ROWS: [[f64; 2]; 4] = [[0.1, 0.0], [-0.5, 0.0], [0.32, 0.0], [0.45, 0.0]];

    #[test]
    fn test_representations_agree() {
        let obs = [0.3, 0.0];
        for repr in [
            NullRepresentation::Exceedance,
            NullRepresentation::Histogram { bins: 100 },
            NullRepresentation::Full,
        ] {
            let null = fill(repr, &obs, &ROWS);
            assert_eq!(null.n_samples(), 4);
            assert_eq!(null.exceedances(0, 0.3).unwrap(), 3, "{repr:?}");
            assert!(!null.is_degenerate(0));
            assert!(null.is_degenerate(1));
            assert_eq!(null.range(0), (-0.5, 0.45));
        }
    }

    #[test]
    fn test_merge_matches_single_pass() {
        let obs = [0.3, 0.0];
        for repr in [
            NullRepresentation::Exceedance,
            NullRepresentation::Histogram { bins: 10 },
            NullRepresentation::Full,
        ] {
            let whole = fill(repr, &obs, &ROWS);
            let left = fill(repr, &obs, &ROWS[..1]);
            let right = fill(repr, &obs, &ROWS[1..]);
            let merged = left.merge(right).unwrap();
            assert_eq!(merged.n_samples(), whole.n_samples());
            assert_eq!(merged.exceedances(0, 0.3).unwrap(), whole.exceedances(0, 0.3).unwrap());
            assert_eq!(merged.range(0), whole.range(0));
        }
    }

    #[test]
    fn test_full_keeps_iteration_order() {
        let obs = [0.0, 0.0];
        let left = fill(NullRepresentation::Full, &obs, &ROWS[..2]);
        let right = fill(NullRepresentation::Full, &obs, &ROWS[2..]);
        let merged = left.merge(right).unwrap();
        let NullStore::Full(full) = merged.store() else { panic!("expected full store") };
        let column: Vec<f64> = full.voxel_values(0).collect();
        assert_eq!(column, vec![0.1, -0.5, 0.32, 0.45]);
        assert_eq!(full.iteration(2), &[0.32, 0.0]);
    }

    #[test]
    fn test_histogram_is_conservative() {
        let obs = [0.35, 0.0];
        let hist = fill(NullRepresentation::Histogram { bins: 10 }, &obs, &ROWS);
        let exact = fill(NullRepresentation::Full, &obs, &ROWS);
        // 0.32 and 0.35 share a bin, so the histogram also counts 0.32.
        assert_eq!(exact.exceedances(0, 0.35).unwrap(), 2);
        assert_eq!(hist.exceedances(0, 0.35).unwrap(), 3);
    }

    #[test]
    fn test_histogram_counts_ties_below_bin_edge() {
        // 0.3 falls in bin 3 of 10; a few ulps below it falls in bin 2.
        let tie = 0.299_999_999_999_999_73;
        let obs = [0.3, 0.0];
        let rows = [[tie, 0.0], [0.05, 0.0]];
        let hist = fill(NullRepresentation::Histogram { bins: 10 }, &obs, &rows);
        let exact = fill(NullRepresentation::Full, &obs, &rows);
        assert_eq!(exact.exceedances(0, 0.3).unwrap(), 1);
        assert_eq!(hist.exceedances(0, 0.3).unwrap(), 1);
    }

    #[test]
    fn test_exceedance_rejects_other_observed() {
        let null = fill(NullRepresentation::Exceedance, &[0.3, 0.0], &ROWS);
        assert!(matches!(
            null.exceedances(0, 0.2),
            Err(SubtractionError::InvalidConfig { .. })
        ));
    }

    #[test]
    fn test_record_shape_mismatch() {
        let mut null =
            NullDistribution::empty(NullRepresentation::Full, observed(&[0.0, 0.0]), 1.0).unwrap();
        assert!(matches!(
            null.record(&[0.0]),
            Err(SubtractionError::ShapeMismatch { .. })
        ));
    }

    #[test]
    fn test_invalid_histogram() {
        let obs = observed(&[0.0]);
        assert!(NullDistribution::empty(NullRepresentation::Histogram { bins: 0 }, obs.clone(), 1.0).is_err());
        assert!(NullDistribution::empty(NullRepresentation::Histogram { bins: 4 }, obs, 0.0).is_err());
    }

    #[test]
    fn test_mixed_merge_rejected() {
        let obs = [0.0, 0.0];
        let a = fill(NullRepresentation::Full, &obs, &ROWS);
        let b = fill(NullRepresentation::Exceedance, &obs, &ROWS);
        assert!(a.merge(b).is_err());
    }
}
