//! Voxel-wise significance: observed difference + null → p and z maps.
//!
//! Each voxel is handled on its own. The p-value is two-sided with an add-one
//! correction, so it never reaches zero:
//!
//! ```text
//! p = (1 + #{ |null| >= |observed| }) / (K + 1)
//! z = sign(observed) * Φ⁻¹(1 - p/2)
//! ```
//!
//! A voxel whose null distribution has zero spread gets `p = 1`, `z = 0`.

use rayon::prelude::*;
use tracing::debug;

use crate::error::{Result, SubtractionError};
use crate::math::two_sided_z;
use crate::null::NullDistribution;

/// p and z for one voxel.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct VoxelSignificance {
    pub p: f64,
    pub z: f64,
}

impl VoxelSignificance {
    pub const NULL: VoxelSignificance = VoxelSignificance { p: 1.0, z: 0.0 };
}

/// Significance from an exceedance count out of `n_samples` permutations.
pub fn voxel_significance(observed: f64, exceedances: usize, n_samples: usize) -> Result<VoxelSignificance> {
    let p = ((exceedances + 1) as f64 / (n_samples + 1) as f64).min(1.0);
    Ok(VoxelSignificance { p, z: two_sided_z(p, observed)? })
}

/// p and z maps for a whole run.
#[derive(Clone, Debug)]
pub struct SignificanceMaps {
    pub p: Vec<f64>,
    pub z: Vec<f64>,
    /// Voxels resolved by the zero-spread rule.
    pub n_degenerate: usize,
}

/// Apply the calculator to every voxel.
///
/// # Errors
///
/// `ShapeMismatch` if `observed` and `null` cover different voxel counts;
/// `InvalidConfig` if `null` is an exceedance counter for another map.
pub fn significance_maps(observed: &[f64], null: &NullDistribution) -> Result<SignificanceMaps> {
    if observed.len() != null.n_voxels() {
        return Err(SubtractionError::ShapeMismatch {
            what: "observed map and null distribution",
            left: observed.len().to_string(),
            right: null.n_voxels().to_string(),
        });
    }

    let per_voxel: Vec<(VoxelSignificance, bool)> = observed
        .par_iter()
        .enumerate()
        .map(|(voxel, &obs)| {
            if null.is_degenerate(voxel) {
                return Ok((VoxelSignificance::NULL, true));
            }
            let count = null.exceedances(voxel, obs)?;
            Ok((voxel_significance(obs, count, null.n_samples())?, false))
        })
        .collect::<Result<_>>()?;

    let n_degenerate = per_voxel.iter().filter(|(_, d)| *d).count();
    debug!(voxels = observed.len(), n_degenerate, "Computed voxel-wise significance");

    let (p, z) = per_voxel.into_iter().map(|(s, _)| (s.p, s.z)).unzip();
    Ok(SignificanceMaps { p, z, n_degenerate })
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::null::NullRepresentation;

    #[test]
    fn test_add_one_bounds() {
        let best = voxel_significance(0.4, 0, 999).unwrap();
        assert_eq!(best.p, 1.0 / 1000.0);
        assert!(best.z > 3.0);

        let worst = voxel_significance(0.4, 999, 999).unwrap();
        assert_eq!(worst.p, 1.0);
        assert_eq!(worst.z, 0.0);
    }

    #[test]
    fn test_sign_follows_observed() {
        let pos = voxel_significance(0.2, 9, 199).unwrap();
        let neg = voxel_significance(-0.2, 9, 199).unwrap();
        assert_eq!(pos.p, neg.p);
        assert!(pos.z > 0.0);
        assert_eq!(neg.z, -pos.z);
        assert!((pos.z - 1.959_963_984_540_054).abs() < 1e-9);
    }

    #[test]
    fn test_degenerate_voxel() {
        let observed = [0.3, 0.0];
        let mut null =
            NullDistribution::empty(NullRepresentation::Full, Arc::from(observed.to_vec()), 1.0).unwrap();
        for row in [[0.1, 0.2], [-0.5, 0.2], [0.3, 0.2]] {
            null.record(&row).unwrap();
        }
        let maps = significance_maps(&observed, &null).unwrap();
        assert_eq!(maps.n_degenerate, 1);
        assert_eq!(maps.p[1], 1.0);
        assert_eq!(maps.z[1], 0.0);
        // 0.5 and 0.3 reach |0.3|: (2 + 1) / (3 + 1)
        assert_eq!(maps.p[0], 0.75);
    }

    #[test]
    fn test_length_mismatch() {
        let null =
            NullDistribution::empty(NullRepresentation::Full, Arc::from(vec![0.0; 3]), 1.0).unwrap();
        assert!(matches!(
            significance_maps(&[0.0; 2], &null),
            Err(SubtractionError::ShapeMismatch { .. })
        ));
    }
}
