//! Field validation utilities.

use crate::types::{Error, Result};

/// Validate that a string is not empty.
pub fn validate_non_empty(s: &str, field: &str) -> Result<()> {
    if s.trim().is_empty() {
        return Err(Error::validation(format!("{} cannot be empty", field)));
    }
    Ok(())
}

/// Validate that a score or weight lies in [0, 1].
pub fn validate_unit_interval(value: f64, field: &str) -> Result<()> {
    if !(0.0..=1.0).contains(&value) {
        return Err(Error::validation(format!(
            "{} must be within [0, 1], got {}",
            field, value
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_non_empty() {
        assert!(validate_non_empty("x", "field").is_ok());
        assert!(validate_non_empty(" ", "field").is_err());
    }

    #[test]
    fn test_unit_interval() {
        assert!(validate_unit_interval(0.0, "w").is_ok());
        assert!(validate_unit_interval(1.0, "w").is_ok());
        assert!(validate_unit_interval(-0.1, "w").is_err());
        assert!(validate_unit_interval(f64::NAN, "w").is_err());
    }
}
