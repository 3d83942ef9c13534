//! Studies, group labels and datasets.
//!
//! A [`Study`] is immutable once built. The group it belongs to is a plain
//! tag; pooling two datasets for permutation never changes a study, it only
//! changes which pseudo-group an index is assigned to.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::{Result, SubtractionError};
use crate::grid::Grid;

/// Which side of the contrast a study was reported in.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Group {
    A,
    B,
}

impl fmt::Display for Group {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Group::A => write!(f, "A"),
            Group::B => write!(f, "B"),
        }
    }
}

/// Coordinate system the foci of a study are expressed in.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CoordinateSpace {
    /// Continuous voxel indices
    #[default]
    Voxel,
    /// World (e.g. MNI millimetre) coordinates, mapped through the grid affine
    World,
}

/// One experiment: its reported foci and sample size.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Study {
    id: String,
    foci: Vec<[f64; 3]>,
    space: CoordinateSpace,
    sample_size: u32,
    group: Group,
}

impl Study {
    /// Study with foci in voxel coordinates.
    pub fn new(id: impl Into<String>, foci: Vec<[f64; 3]>, sample_size: u32, group: Group) -> Self {
        Self {
            id: id.into(),
            foci,
            space: CoordinateSpace::Voxel,
            sample_size,
            group,
        }
    }

    /// Same study with foci interpreted in `space`.
    #[must_use]
    pub fn in_space(mut self, space: CoordinateSpace) -> Self {
        self.space = space;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn foci(&self) -> &[[f64; 3]] {
        &self.foci
    }

    pub fn space(&self) -> CoordinateSpace {
        self.space
    }

    pub fn sample_size(&self) -> u32 {
        self.sample_size
    }

    pub fn group(&self) -> Group {
        self.group
    }

    /// Copy of this study tagged with another group.
    #[must_use]
    pub fn with_group(&self, group: Group) -> Self {
        Self { group, ..self.clone() }
    }

    /// Foci rounded to the nearest voxel of `grid`.
    ///
    /// # Errors
    ///
    /// `FocusOutOfBounds` when a focus lands outside the grid.
    pub fn voxel_foci(&self, grid: &Grid) -> Result<Vec<[i64; 3]>> {
        self.foci
            .iter()
            .map(|&focus| {
                let continuous = match self.space {
                    CoordinateSpace::Voxel => focus,
                    CoordinateSpace::World => grid.world_to_voxel(focus),
                };
                let ijk = continuous.map(|c| c.round() as i64);
                match grid.flat_index(ijk) {
                    Some(_) => Ok(ijk),
                    None => Err(SubtractionError::FocusOutOfBounds {
                        study: self.id.clone(),
                        focus: ijk,
                        shape: grid.shape(),
                    }),
                }
            })
            .collect()
    }
}

/// An ordered collection of studies sharing one voxel grid.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Dataset {
    grid: Grid,
    studies: Vec<Study>,
}

impl Dataset {
    pub fn new(grid: Grid, studies: Vec<Study>) -> Self {
        Self { grid, studies }
    }

    pub fn grid(&self) -> &Grid {
        &self.grid
    }

    pub fn studies(&self) -> &[Study] {
        &self.studies
    }

    pub fn len(&self) -> usize {
        self.studies.len()
    }

    pub fn is_empty(&self) -> bool {
        self.studies.is_empty()
    }

    /// Copy of the dataset with every study tagged `group`.
    #[must_use]
    pub fn labelled(&self, group: Group) -> Self {
        Self {
            grid: self.grid.clone(),
            studies: self.studies.iter().map(|s| s.with_group(group)).collect(),
        }
    }

    /// Total number of foci across studies.
    pub fn n_foci(&self) -> usize {
        self.studies.iter().map(|s| s.foci.len()).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_group_display() {
        assert_eq!(Group::A.to_string(), "A");
        assert_eq!(Group::B.to_string(), "B");
    }

    #[test]
    fn test_voxel_foci_rounding() {
        let grid = Grid::isotropic([10, 10, 10], 2.0).unwrap();
        let study = Study::new("s1", vec![[1.4, 2.6, 9.0]], 20, Group::A);
        assert_eq!(study.voxel_foci(&grid).unwrap(), vec![[1, 3, 9]]);
    }

    #[test]
    fn test_world_foci() {
        let grid = Grid::isotropic([10, 10, 10], 2.0).unwrap();
        let study = Study::new("s1", vec![[4.0, 8.2, 0.0]], 20, Group::A)
            .in_space(CoordinateSpace::World);
        assert_eq!(study.voxel_foci(&grid).unwrap(), vec![[2, 4, 0]]);
    }

    #[test]
    fn test_focus_out_of_bounds() {
        let grid = Grid::isotropic([4, 4, 4], 2.0).unwrap();
        let study = Study::new("far", vec![[0.0, 0.0, 4.0]], 10, Group::B);
        let err = study.voxel_foci(&grid).unwrap_err();
        assert!(matches!(err, SubtractionError::FocusOutOfBounds { focus: [0, 0, 4], .. }));
    }

    #[test]
    fn test_labelled_does_not_mutate() {
        let grid = Grid::isotropic([4, 4, 4], 2.0).unwrap();
        let ds = Dataset::new(grid, vec![Study::new("s", vec![[1.0; 3]], 12, Group::A)]);
        let relabelled = ds.labelled(Group::B);
        assert_eq!(ds.studies()[0].group(), Group::A);
        assert_eq!(relabelled.studies()[0].group(), Group::B);
        assert_eq!(relabelled.n_foci(), 1);
    }
}
