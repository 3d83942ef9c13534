//! JSON dataset loader.
//!
//! ```json
//! {
//!   "space": { "shape": [91, 109, 91], "affine": [[-2,0,0,90], ...], "mask": null },
//!   "studies": [
//!     { "id": "smith2010", "sample_size": 21, "space": "world", "foci": [[-40, 22, 8]] }
//!   ]
//! }
//! ```
//!
//! The group label is supplied by the caller rather than the file, so the
//! same file can be used on either side of a contrast.

use std::fs::File;
use std::io::BufReader;
use std::path::Path;

use serde::Deserialize;
use tracing::debug;

use crate::dataset::{CoordinateSpace, Dataset, Group, Study};
use crate::error::{Result, SubtractionError};
use crate::grid::Grid;

#[derive(Deserialize)]
struct DatasetFile {
    space: Grid,
    studies: Vec<StudyRecord>,
}

#[derive(Deserialize)]
struct StudyRecord {
    id: String,
    sample_size: u32,
    #[serde(default)]
    space: CoordinateSpace,
    foci: Vec<[f64; 3]>,
}

impl Dataset {
    /// Parse a dataset from a JSON string, tagging every study with `group`.
    pub fn from_json_str(json: &str, group: Group) -> Result<Self> {
        let file: DatasetFile = serde_json::from_str(json)?;
        Ok(file.into_dataset(group))
    }

    /// Load a dataset file, tagging every study with `group`.
    pub fn from_json_file(path: impl AsRef<Path>, group: Group) -> Result<Self> {
        let path = path.as_ref();
        let handle = File::open(path).map_err(|source| SubtractionError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        let file: DatasetFile = serde_json::from_reader(BufReader::new(handle))?;
        let dataset = file.into_dataset(group);
        debug!(
            path = %path.display(),
            %group,
            studies = dataset.len(),
            foci = dataset.n_foci(),
            "Loaded dataset"
        );
        Ok(dataset)
    }
}

impl DatasetFile {
    fn into_dataset(self, group: Group) -> Dataset {
        let studies = self
            .studies
            .into_iter()
            .map(|r| Study::new(r.id, r.foci, r.sample_size, group).in_space(r.space))
            .collect();
        Dataset::new(self.space, studies)
    }
}
