//! Error types for subtraction analysis.
//!
//! Every fallible operation in the crate returns [`SubtractionError`]. Voxels
//! with a degenerate null distribution are not errors; they are resolved
//! locally by the significance calculator.

use std::path::PathBuf;

use thiserror::Error;

use crate::dataset::Group;

/// Crate-wide result alias.
pub type Result<T> = std::result::Result<T, SubtractionError>;

/// Failures surfaced by the subtraction pipeline.
#[derive(Error, Debug)]
pub enum SubtractionError {
    /// Two maps or grids that must line up do not.
    #[error("Shape mismatch: {what} ({left} vs {right})")]
    ShapeMismatch {
        /// Which pair of objects disagreed
        what: &'static str,
        /// Size or description of the left-hand side
        left: String,
        /// Size or description of the right-hand side
        right: String,
    },

    /// A group has no studies, so no partition of its size exists.
    #[error("Insufficient data: group {group} has {available} studies, need at least {required}")]
    InsufficientData {
        /// Offending group
        group: Group,
        /// Number of studies supplied
        available: usize,
        /// Minimum number of studies
        required: usize,
    },

    /// A configuration value is out of range.
    #[error("Invalid configuration: {reason}")]
    InvalidConfig {
        /// What was wrong
        reason: String,
    },

    /// A focus maps to a voxel outside the grid.
    #[error("Focus {focus:?} of study '{study}' lies outside grid {shape:?}")]
    FocusOutOfBounds {
        /// Study identifier
        study: String,
        /// Focus in voxel coordinates
        focus: [i64; 3],
        /// Grid shape
        shape: [usize; 3],
    },

    /// Reading or writing a file failed.
    #[error("I/O error on {path}: {source}")]
    Io {
        /// File involved
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },

    /// A dataset or result file could not be (de)serialised.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl SubtractionError {
    /// Shorthand for [`SubtractionError::InvalidConfig`].
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig { reason: reason.into() }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_insufficient_data_message() {
        let err = SubtractionError::InsufficientData {
            group: Group::B,
            available: 0,
            required: 1,
        };
        assert_eq!(
            err.to_string(),
            "Insufficient data: group B has 0 studies, need at least 1"
        );
    }

    #[test]
    fn test_shape_mismatch_message() {
        let err = SubtractionError::ShapeMismatch {
            what: "group maps",
            left: "10".into(),
            right: "12".into(),
        };
        assert!(err.to_string().contains("group maps (10 vs 12)"));
    }
}
