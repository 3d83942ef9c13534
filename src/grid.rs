//! Voxel grid and analysis mask.
//!
//! A [`Grid`] describes the 3D array every map lives on: its shape, the
//! voxel-to-world affine and the set of in-mask voxels. Maps handled by the
//! rest of the crate are dense vectors over the *masked* voxels only, in
//! ascending flat-index order. Flat indices use C order (last axis fastest):
//! `index = i * ny * nz + j * nz + k`.

use nalgebra::{Matrix4, Vector4};
use serde::{Deserialize, Serialize};

use crate::error::{Result, SubtractionError};

/// Absolute tolerance when comparing two affines.
const AFFINE_TOLERANCE: f64 = 1e-6;

/// Serialised form of a [`Grid`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct GridSpec {
    /// Array dimensions
    pub shape: [usize; 3],
    /// Voxel-to-world transform, row major
    pub affine: [[f64; 4]; 4],
    /// Flat indices of in-mask voxels; `None` means every voxel
    #[serde(default)]
    pub mask: Option<Vec<usize>>,
}

/// A validated voxel grid with its mask.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "GridSpec", into = "GridSpec")]
pub struct Grid {
    shape: [usize; 3],
    affine: Matrix4<f64>,
    /// World-to-voxel transform
    inverse: Matrix4<f64>,
    /// Sorted flat indices of in-mask voxels
    mask: Vec<usize>,
    /// Flat index -> position in `mask`
    lookup: Vec<Option<usize>>,
}

impl Grid {
    /// Build a grid, validating the mask and the affine.
    ///
    /// # Errors
    ///
    /// `InvalidConfig` if a dimension is zero, the voxel count overflows, the
    /// affine is singular, or a mask index falls outside the grid.
    pub fn new(
        shape: [usize; 3],
        affine: [[f64; 4]; 4],
        mask: Option<Vec<usize>>,
    ) -> Result<Self> {
        if shape.iter().any(|&d| d == 0) {
            return Err(SubtractionError::invalid_config(format!(
                "grid shape {shape:?} has a zero dimension"
            )));
        }
        let total = shape[0]
            .checked_mul(shape[1])
            .and_then(|n| n.checked_mul(shape[2]))
            .ok_or_else(|| {
                SubtractionError::invalid_config(format!("grid shape {shape:?} has too many voxels"))
            })?;

        let affine = Matrix4::from_fn(|r, c| affine[r][c]);
        let inverse = affine
            .try_inverse()
            .filter(|m| m.iter().all(|v| v.is_finite()))
            .ok_or_else(|| SubtractionError::invalid_config("grid affine is not invertible"))?;

        let mut mask = mask.unwrap_or_else(|| (0..total).collect());
        mask.sort_unstable();
        mask.dedup();
        if let Some(&last) = mask.last() {
            if last >= total {
                return Err(SubtractionError::invalid_config(format!(
                    "mask index {last} outside grid of {total} voxels"
                )));
            }
        }
        if mask.is_empty() {
            return Err(SubtractionError::invalid_config("mask contains no voxels"));
        }

        let mut lookup = vec![None; total];
        for (pos, &flat) in mask.iter().enumerate() {
            lookup[flat] = Some(pos);
        }

        Ok(Self { shape, affine, inverse, mask, lookup })
    }

    /// Unmasked grid with an axis-aligned affine and isotropic voxels.
    pub fn isotropic(shape: [usize; 3], voxel_size: f64) -> Result<Self> {
        let affine = [
            [voxel_size, 0.0, 0.0, 0.0],
            [0.0, voxel_size, 0.0, 0.0],
            [0.0, 0.0, voxel_size, 0.0],
            [0.0, 0.0, 0.0, 1.0],
        ];
        Self::new(shape, affine, None)
    }

    #[inline]
    pub fn shape(&self) -> [usize; 3] {
        self.shape
    }

    /// Voxel-to-world affine as row-major arrays.
    pub fn affine(&self) -> [[f64; 4]; 4] {
        [0, 1, 2, 3].map(|r| [0, 1, 2, 3].map(|c| self.affine[(r, c)]))
    }

    /// Number of in-mask voxels (the length of every map).
    #[inline]
    pub fn n_voxels(&self) -> usize {
        self.mask.len()
    }

    /// Number of voxels in the full 3D array.
    #[inline]
    pub fn n_total(&self) -> usize {
        self.shape[0] * self.shape[1] * self.shape[2]
    }

    /// Sorted flat indices of in-mask voxels.
    pub fn mask_indices(&self) -> &[usize] {
        &self.mask
    }

    /// Flat C-order index of `(i, j, k)`, or `None` outside the grid.
    pub fn flat_index(&self, ijk: [i64; 3]) -> Option<usize> {
        let [nx, ny, nz] = self.shape;
        let in_bounds = ijk
            .iter()
            .zip(self.shape.iter())
            .all(|(&c, &n)| c >= 0 && (c as usize) < n);
        if !in_bounds {
            return None;
        }
        let [i, j, k] = ijk.map(|c| c as usize);
        debug_assert!(i < nx);
        Some(i * ny * nz + j * nz + k)
    }

    /// Inverse of [`Grid::flat_index`].
    pub fn unflatten(&self, flat: usize) -> [usize; 3] {
        let [_, ny, nz] = self.shape;
        [flat / (ny * nz), (flat / nz) % ny, flat % nz]
    }

    /// Position of a flat index within masked maps.
    #[inline]
    pub fn masked_position(&self, flat: usize) -> Option<usize> {
        self.lookup.get(flat).copied().flatten()
    }

    /// Voxel edge lengths in world units (column norms of the affine).
    pub fn voxel_size(&self) -> [f64; 3] {
        [0, 1, 2].map(|c| self.affine.fixed_view::<3, 1>(0, c).norm())
    }

    /// World coordinates of a voxel centre.
    pub fn voxel_to_world(&self, ijk: [f64; 3]) -> [f64; 3] {
        apply(&self.affine, ijk)
    }

    /// Continuous voxel coordinates of a world-space point.
    pub fn world_to_voxel(&self, xyz: [f64; 3]) -> [f64; 3] {
        apply(&self.inverse, xyz)
    }

    /// Fail with `ShapeMismatch` unless both grids describe the same voxels.
    pub fn ensure_compatible(&self, other: &Grid) -> Result<()> {
        if self.shape != other.shape {
            return Err(SubtractionError::ShapeMismatch {
                what: "grid shape",
                left: format!("{:?}", self.shape),
                right: format!("{:?}", other.shape),
            });
        }
        if (self.affine - other.affine).amax() > AFFINE_TOLERANCE {
            return Err(SubtractionError::ShapeMismatch {
                what: "grid affine",
                left: format!("{:?}", self.affine()),
                right: format!("{:?}", other.affine()),
            });
        }
        if self.mask != other.mask {
            return Err(SubtractionError::ShapeMismatch {
                what: "grid mask",
                left: format!("{} voxels", self.mask.len()),
                right: format!("{} voxels", other.mask.len()),
            });
        }
        Ok(())
    }

    /// Scatter a masked map into the full 3D array (zeros outside the mask).
    pub fn unmask(&self, values: &[f64]) -> Result<Vec<f64>> {
        if values.len() != self.mask.len() {
            return Err(SubtractionError::ShapeMismatch {
                what: "masked map",
                left: values.len().to_string(),
                right: self.mask.len().to_string(),
            });
        }
        let mut full = vec![0.0; self.n_total()];
        for (&flat, &v) in self.mask.iter().zip(values) {
            full[flat] = v;
        }
        Ok(full)
    }
}

impl TryFrom<GridSpec> for Grid {
    type Error = SubtractionError;

    fn try_from(spec: GridSpec) -> Result<Self> {
        Grid::new(spec.shape, spec.affine, spec.mask)
    }
}

impl From<Grid> for GridSpec {
    fn from(grid: Grid) -> Self {
        let full = grid.mask.len() == grid.n_total();
        GridSpec {
            shape: grid.shape,
            affine: grid.affine(),
            mask: if full { None } else { Some(grid.mask) },
        }
    }
}

impl PartialEq for Grid {
    fn eq(&self, other: &Self) -> bool {
        self.ensure_compatible(other).is_ok()
    }
}

/// Apply a homogeneous transform to a 3D point.
fn apply(m: &Matrix4<f64>, p: [f64; 3]) -> [f64; 3] {
    let out = m * Vector4::new(p[0], p[1], p[2], 1.0);
    [out.x, out.y, out.z]
}
