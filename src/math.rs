//! Normal distribution helpers for converting p-values to z-scores.

use statrs::distribution::{ContinuousCDF, Normal};

use crate::error::{Result, SubtractionError};

fn standard_normal() -> Result<Normal> {
    Normal::new(0.0, 1.0)
        .map_err(|e| SubtractionError::invalid_config(format!("standard normal: {e}")))
}

/// Signed z-score for a two-sided p-value: `Φ⁻¹(1 - p/2)` carrying the sign
/// of `direction`. A zero direction gives zero.
///
/// # Errors
///
/// `InvalidConfig` if `p` lies outside `(0, 1]`.
pub fn two_sided_z(p: f64, direction: f64) -> Result<f64> {
    if !(p > 0.0 && p <= 1.0) {
        return Err(SubtractionError::invalid_config(format!(
            "p-value must lie in (0, 1], got {p}"
        )));
    }
    if direction == 0.0 || p == 1.0 {
        return Ok(0.0);
    }
    // -Φ⁻¹(p/2) keeps precision for small p.
    let magnitude = -standard_normal()?.inverse_cdf(p / 2.0);
    Ok(magnitude.copysign(direction))
}

#[cfg(test)]
mod tests {
    use super::*;

    const Z_975: f64 = 1.959_963_984_540_054;

    #[test]
    fn test_known_values() {
        assert!((two_sided_z(0.05, 0.3).unwrap() - Z_975).abs() < 1e-9);
        assert!((two_sided_z(0.05, -0.3).unwrap() + Z_975).abs() < 1e-9);
        assert!((two_sided_z(2e-10, 1.0).unwrap() - 6.361_340_902_404_056).abs() < 1e-6);
        assert!((two_sided_z(0.3173105078629141, 1.0).unwrap() - 1.0).abs() < 1e-8);
    }

    #[test]
    fn test_zero_cases() {
        assert_eq!(two_sided_z(1.0, 0.5).unwrap(), 0.0);
        assert_eq!(two_sided_z(0.01, 0.0).unwrap(), 0.0);
    }

    #[test]
    fn test_out_of_range_p() {
        assert!(matches!(two_sided_z(0.0, 1.0), Err(SubtractionError::InvalidConfig { .. })));
        assert!(two_sided_z(1.5, 1.0).is_err());
        assert!(two_sided_z(f64::NAN, 1.0).is_err());
    }
}
