//! Result container for a subtraction run.
//!
//! Holds the observed difference, z and p maps over the masked voxels plus
//! the metadata needed to reproduce the run. Nothing here is mutable after
//! construction, so a result can be shared freely across threads.

use std::fmt;
use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;
use std::str::FromStr;

use float_ord::FloatOrd;
use serde::{Deserialize, Serialize};

use crate::error::{Result, SubtractionError};
use crate::grid::Grid;
use crate::kernel::KernelConfig;
use crate::null::NullRepresentation;

/// Names of the maps a result exposes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MapKind {
    /// Observed group A minus group B
    Difference,
    /// Signed z-statistic
    ZStatistic,
    /// Two-sided uncorrected p-value
    PValue,
}

impl MapKind {
    pub const ALL: [MapKind; 3] = [MapKind::Difference, MapKind::ZStatistic, MapKind::PValue];

    /// Canonical map name.
    pub fn name(self) -> &'static str {
        match self {
            MapKind::Difference => "stat_desc-group1MinusGroup2",
            MapKind::ZStatistic => "z_desc-group1MinusGroup2",
            MapKind::PValue => "p_desc-group1MinusGroup2",
        }
    }
}

impl fmt::Display for MapKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for MapKind {
    type Err = SubtractionError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "stat_desc-group1MinusGroup2" | "difference" | "stat" => Ok(MapKind::Difference),
            "z_desc-group1MinusGroup2" | "z" => Ok(MapKind::ZStatistic),
            "p_desc-group1MinusGroup2" | "p" => Ok(MapKind::PValue),
            other => Err(SubtractionError::invalid_config(format!("unknown map name '{other}'"))),
        }
    }
}

/// Provenance of a run.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RunMetadata {
    pub n_studies_a: usize,
    pub n_studies_b: usize,
    /// Permutations asked for
    pub n_permutations_requested: usize,
    /// Permutations actually evaluated (smaller when enumerated exhaustively)
    pub n_permutations: usize,
    pub exhaustive: bool,
    pub seed: u64,
    pub kernel: KernelConfig,
    pub kernel_description: String,
    pub aggregation: String,
    pub null_representation: NullRepresentation,
    pub n_voxels: usize,
    pub n_degenerate_voxels: usize,
}

/// A map scattered back into the full 3D grid.
#[derive(Clone, Debug)]
pub struct VoxelImage {
    pub shape: [usize; 3],
    pub affine: [[f64; 4]; 4],
    /// C-order values, zero outside the mask
    pub data: Vec<f64>,
}

impl VoxelImage {
    /// Value at voxel `(i, j, k)`.
    pub fn value_at(&self, i: usize, j: usize, k: usize) -> Option<f64> {
        let [nx, ny, nz] = self.shape;
        if i >= nx || j >= ny || k >= nz {
            return None;
        }
        self.data.get(i * ny * nz + j * nz + k).copied()
    }

    /// World coordinates of voxel `(i, j, k)`.
    pub fn world_coordinates(&self, i: usize, j: usize, k: usize) -> [f64; 3] {
        let a = &self.affine;
        let v = [i as f64, j as f64, k as f64];
        [0, 1, 2].map(|r| a[r][0] * v[0] + a[r][1] * v[1] + a[r][2] * v[2] + a[r][3])
    }
}

/// One voxel of the result, for reporting.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct Peak {
    pub voxel: [usize; 3],
    pub world: [f64; 3],
    pub difference: f64,
    pub z: f64,
    pub p: f64,
}

/// Immutable output of [`crate::Subtraction::fit`].
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct SubtractionResult {
    grid: Grid,
    difference: Vec<f64>,
    z: Vec<f64>,
    p: Vec<f64>,
    metadata: RunMetadata,
}

impl SubtractionResult {
    /// # Errors
    ///
    /// `ShapeMismatch` if any map does not cover the grid's masked voxels.
    pub fn new(
        grid: Grid,
        difference: Vec<f64>,
        z: Vec<f64>,
        p: Vec<f64>,
        metadata: RunMetadata,
    ) -> Result<Self> {
        for (kind, map) in [
            (MapKind::Difference, &difference),
            (MapKind::ZStatistic, &z),
            (MapKind::PValue, &p),
        ] {
            if map.len() != grid.n_voxels() {
                return Err(SubtractionError::ShapeMismatch {
                    what: "result map",
                    left: format!("{kind}: {}", map.len()),
                    right: grid.n_voxels().to_string(),
                });
            }
        }
        Ok(Self { grid, difference, z, p, metadata })
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn metadata(&self) -> &RunMetadata {
        &self.metadata
    }

    /// Masked values of one map.
    pub fn map(&self, kind: MapKind) -> &[f64] {
        match kind {
            MapKind::Difference => &self.difference,
            MapKind::ZStatistic => &self.z,
            MapKind::PValue => &self.p,
        }
    }

    /// Masked values of a map looked up by name.
    pub fn get_map(&self, name: &str) -> Option<&[f64]> {
        name.parse().ok().map(|kind| self.map(kind))
    }

    /// A map as a full 3D image with the grid affine.
    pub fn image(&self, kind: MapKind) -> Result<VoxelImage> {
        Ok(VoxelImage {
            shape: self.grid.shape(),
            affine: self.grid.affine(),
            data: self.grid.unmask(self.map(kind))?,
        })
    }

    pub fn get_image(&self, name: &str) -> Option<VoxelImage> {
        name.parse().ok().and_then(|kind| self.image(kind).ok())
    }

    /// The `n` voxels with the largest `|z|`, strongest first.
    pub fn peaks(&self, n: usize) -> Vec<Peak> {
        let mut order: Vec<usize> = (0..self.z.len()).collect();
        order.sort_by_key(|&v| {
            std::cmp::Reverse((FloatOrd(self.z[v].abs()), FloatOrd(self.difference[v].abs())))
        });
        order
            .into_iter()
            .take(n)
            .map(|v| {
                let flat = self.grid.mask_indices()[v];
                let voxel = self.grid.unflatten(flat);
                Peak {
                    voxel,
                    world: self.grid.voxel_to_world(voxel.map(|c| c as f64)),
                    difference: self.difference[v],
                    z: self.z[v],
                    p: self.p[v],
                }
            })
            .collect()
    }

    /// Write the result as JSON.
    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let io_err = |source: std::io::Error| SubtractionError::Io { path: path.to_path_buf(), source };
        let file = File::create(path).map_err(io_err)?;
        let mut writer = BufWriter::new(file);
        serde_json::to_writer(&mut writer, self)?;
        writer.flush().map_err(io_err)?;
        Ok(())
    }

    /// Read a result written by [`SubtractionResult::to_json_file`].
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let file = File::open(path).map_err(|source| SubtractionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let result: SubtractionResult = serde_json::from_reader(std::io::BufReader::new(file))?;
        Self::new(result.grid, result.difference, result.z, result.p, result.metadata)
    }
}
