//! Group difference engine.

use crate::error::{Result, SubtractionError};

/// Voxel-wise `group_a - group_b`.
///
/// # Errors
///
/// `ShapeMismatch` when the maps cover different numbers of voxels.
pub fn difference(group_a: &[f64], group_b: &[f64]) -> Result<Vec<f64>> {
    if group_a.len() != group_b.len() {
        return Err(SubtractionError::ShapeMismatch {
            what: "group maps",
            left: group_a.len().to_string(),
            right: group_b.len().to_string(),
        });
    }
    Ok(group_a.iter().zip(group_b).map(|(a, b)| a - b).collect())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_difference() {
        let d = difference(&[0.5, 0.1, 0.0], &[0.25, 0.3, 0.0]).unwrap();
        assert_eq!(d, vec![0.25, 0.1 - 0.3, 0.0]);
    }

    #[test]
    fn test_difference_is_antisymmetric() {
        let a = [0.9, 0.2];
        let b = [0.1, 0.4];
        let ab = difference(&a, &b).unwrap();
        let ba = difference(&b, &a).unwrap();
        assert!(ab.iter().zip(&ba).all(|(x, y)| *x == -*y));
    }

    #[test]
    fn test_shape_mismatch() {
        let err = difference(&[0.0; 3], &[0.0; 4]).unwrap_err();
        assert!(matches!(err, SubtractionError::ShapeMismatch { what: "group maps", .. }));
    }
}
