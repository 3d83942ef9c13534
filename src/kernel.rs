//! Kernel transformers: study foci to per-study modelled-activation maps.
//!
//! Each transformer is a pure function of one study and the grid. The
//! resulting map depends only on the study's own foci, never on its group,
//! which is what lets the permutation generator compute it once and reuse it
//! for every relabelling.
//!
//! Both built-in kernels place a stencil at every focus and keep the
//! voxel-wise maximum across foci of the same study.

use std::f64::consts::{LN_2, PI};
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::dataset::Study;
use crate::error::{Result, SubtractionError};
use crate::estimator::Aggregation;
use crate::grid::Grid;

/// Between-template spatial uncertainty in millimetres.
const TEMPLATE_UNCERTAINTY_MM: f64 = 5.7;

/// Between-subject spatial uncertainty in millimetres, before scaling by √n.
const SUBJECT_UNCERTAINTY_MM: f64 = 11.6;

/// Gaussian support, in standard deviations, kept around each focus.
const TRUNCATION_SIGMAS: f64 = 3.0;

/// Converts one study into a dense map over the grid's masked voxels.
pub trait KernelTransformer: Send + Sync {
    /// Modelled-activation map for `study`, one value per in-mask voxel.
    fn transform(&self, study: &Study, grid: &Grid) -> Result<Vec<f64>>;

    /// Short human readable description for run metadata.
    fn describe(&self) -> String;
}

/// Serializable kernel choice.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum KernelConfig {
    /// Gaussian ALE kernel. A `None` FWHM is derived from each study's
    /// sample size.
    Ale {
        #[serde(default)]
        fwhm: Option<f64>,
    },
    /// Binary sphere kernel of `radius` millimetres.
    Mkda { radius: f64, value: f64 },
}

impl Default for KernelConfig {
    fn default() -> Self {
        KernelConfig::Ale { fwhm: None }
    }
}

impl KernelConfig {
    /// Instantiate the transformer, validating parameters.
    pub fn build(&self) -> Result<Box<dyn KernelTransformer>> {
        match *self {
            KernelConfig::Ale { fwhm } => Ok(Box::new(AleKernel::new(fwhm)?)),
            KernelConfig::Mkda { radius, value } => Ok(Box::new(MkdaKernel::new(radius, value)?)),
        }
    }

    /// Aggregation rule conventionally paired with this kernel.
    pub fn default_aggregation(&self) -> Aggregation {
        match self {
            KernelConfig::Ale { .. } => Aggregation::ProbabilisticUnion,
            KernelConfig::Mkda { .. } => Aggregation::DensitySum,
        }
    }
}

impl fmt::Display for KernelConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KernelConfig::Ale { fwhm: Some(w) } => write!(f, "ALE (fwhm={w} mm)"),
            KernelConfig::Ale { fwhm: None } => write!(f, "ALE (sample-size fwhm)"),
            KernelConfig::Mkda { radius, value } => write!(f, "MKDA (r={radius} mm, value={value})"),
        }
    }
}

/* ---------------------------------------------------------------------------
 *  Stencils
 * ---------------------------------------------------------------------------
 * A stencil is a list of (voxel offset, value) pairs centred on a focus.
 * Applying it writes max(existing, value) into every in-mask voxel it covers.
 */
struct Stencil {
    entries: Vec<([i64; 3], f64)>,
}

impl Stencil {
    /// Truncated 3D Gaussian normalised to unit sum.
    fn gaussian(sigma_mm: f64, voxel_size: [f64; 3]) -> Self {
        let sigma = voxel_size.map(|v| sigma_mm / v);
        let radius = sigma.map(|s| (TRUNCATION_SIGMAS * s).ceil().max(1.0) as i64);

        let mut entries = Vec::new();
        for di in -radius[0]..=radius[0] {
            for dj in -radius[1]..=radius[1] {
                for dk in -radius[2]..=radius[2] {
                    let q = (di as f64 / sigma[0]).powi(2)
                        + (dj as f64 / sigma[1]).powi(2)
                        + (dk as f64 / sigma[2]).powi(2);
                    entries.push(([di, dj, dk], (-0.5 * q).exp()));
                }
            }
        }

        let total: f64 = entries.iter().map(|(_, v)| v).sum();
        for (_, v) in entries.iter_mut() {
            *v /= total;
        }
        Self { entries }
    }

    /// Binary sphere of `radius_mm` filled with `value`.
    fn sphere(radius_mm: f64, value: f64, voxel_size: [f64; 3]) -> Self {
        let reach = voxel_size.map(|v| (radius_mm / v).floor() as i64);
        let r_squared = radius_mm * radius_mm;

        let mut entries = Vec::new();
        for di in -reach[0]..=reach[0] {
            for dj in -reach[1]..=reach[1] {
                for dk in -reach[2]..=reach[2] {
                    let dist_sq = (di as f64 * voxel_size[0]).powi(2)
                        + (dj as f64 * voxel_size[1]).powi(2)
                        + (dk as f64 * voxel_size[2]).powi(2);
                    if dist_sq <= r_squared {
                        entries.push(([di, dj, dk], value));
                    }
                }
            }
        }
        Self { entries }
    }

    fn apply(&self, foci: &[[i64; 3]], grid: &Grid) -> Vec<f64> {
        let mut map = vec![0.0; grid.n_voxels()];
        for focus in foci {
            for (offset, value) in &self.entries {
                let ijk = [focus[0] + offset[0], focus[1] + offset[1], focus[2] + offset[2]];
                let Some(flat) = grid.flat_index(ijk) else { continue };
                if let Some(pos) = grid.masked_position(flat) {
                    if *value > map[pos] {
                        map[pos] = *value;
                    }
                }
            }
        }
        map
    }
}

/* ---------------------------------------------------------------------------
 *  ALE kernel
 * ---------------------------------------------------------------------------
 */

/// Gaussian kernel whose width reflects spatial uncertainty.
#[derive(Clone, Debug)]
pub struct AleKernel {
    fwhm: Option<f64>,
}

impl AleKernel {
    pub fn new(fwhm: Option<f64>) -> Result<Self> {
        if let Some(w) = fwhm {
            if !(w.is_finite() && w > 0.0) {
                return Err(SubtractionError::invalid_config(format!(
                    "ALE kernel fwhm must be positive, got {w}"
                )));
            }
        }
        Ok(Self { fwhm })
    }

    /// FWHM in millimetres for a study of `sample_size` subjects.
    ///
    /// Combines template and subject uncertainty in quadrature; the subject
    /// term shrinks with √n.
    pub fn sample_size_fwhm(sample_size: u32) -> f64 {
        let to_fwhm = (8.0 * LN_2).sqrt() / (2.0 * (2.0 / PI).sqrt());
        let templates = TEMPLATE_UNCERTAINTY_MM * to_fwhm;
        let subjects = SUBJECT_UNCERTAINTY_MM * to_fwhm / f64::from(sample_size).sqrt();
        (templates.powi(2) + subjects.powi(2)).sqrt()
    }

    fn fwhm_for(&self, study: &Study) -> Result<f64> {
        match self.fwhm {
            Some(w) => Ok(w),
            None if study.sample_size() == 0 => Err(SubtractionError::invalid_config(format!(
                "study '{}' has sample size 0; set a fixed fwhm",
                study.id()
            ))),
            None => Ok(Self::sample_size_fwhm(study.sample_size())),
        }
    }
}

impl KernelTransformer for AleKernel {
    fn transform(&self, study: &Study, grid: &Grid) -> Result<Vec<f64>> {
        let foci = study.voxel_foci(grid)?;
        let sigma_mm = self.fwhm_for(study)? / (8.0 * LN_2).sqrt();
        let stencil = Stencil::gaussian(sigma_mm, grid.voxel_size());
        Ok(stencil.apply(&foci, grid))
    }

    fn describe(&self) -> String {
        KernelConfig::Ale { fwhm: self.fwhm }.to_string()
    }
}

/* ---------------------------------------------------------------------------
 *  MKDA kernel
 * ---------------------------------------------------------------------------
 */

/// Binary sphere kernel.
#[derive(Clone, Debug)]
pub struct MkdaKernel {
    radius: f64,
    value: f64,
}

impl MkdaKernel {
    pub fn new(radius: f64, value: f64) -> Result<Self> {
        if !(radius.is_finite() && radius > 0.0) {
            return Err(SubtractionError::invalid_config(format!(
                "MKDA radius must be positive, got {radius}"
            )));
        }
        if !(value.is_finite() && value > 0.0) {
            return Err(SubtractionError::invalid_config(format!(
                "MKDA value must be positive, got {value}"
            )));
        }
        Ok(Self { radius, value })
    }
}

impl KernelTransformer for MkdaKernel {
    fn transform(&self, study: &Study, grid: &Grid) -> Result<Vec<f64>> {
        let foci = study.voxel_foci(grid)?;
        let stencil = Stencil::sphere(self.radius, self.value, grid.voxel_size());
        Ok(stencil.apply(&foci, grid))
    }

    fn describe(&self) -> String {
        KernelConfig::Mkda { radius: self.radius, value: self.value }.to_string()
    }
}
