//! Small validators shared by the configuration checks.
use std::ops::RangeInclusive;

/// Validates if a given value is within a specified numeric range.
///
/// # Arguments
///
/// * `value` - The value to validate.
/// * `range` - The inclusive range to validate against.
///
/// # Returns
///
/// * `Ok(())` if the value is within the range.
/// * `Err(&'static str)` if the value is outside the range.
pub fn is_in_range<T: PartialOrd>(value: T, range: RangeInclusive<T>) -> Result<(), &'static str> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err("Value is outside the specified range")
    }
}

/// Validates if a given string is not empty.
///
/// # Arguments
///
/// * `value` - The string to validate.
///
/// # Returns
///
/// * `Ok(())` if the string is not empty.
/// * `Err(&'static str)` if the string is empty.
pub fn is_not_empty(value: &str) -> Result<(), &'static str> {
    if !value.trim().is_empty() {
        Ok(())
    } else {
        Err("Value cannot be empty")
    }
}

/// Validates that a period or rate is a finite, strictly positive number.
pub fn is_positive(value: f64) -> Result<(), &'static str> {
    if value.is_finite() && value > 0.0 {
        Ok(())
    } else {
        Err("Value must be a positive number")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn range_bounds_are_inclusive() {
        assert!(is_in_range(1, 1..=14).is_ok());
        assert!(is_in_range(14, 1..=14).is_ok());
        assert!(is_in_range(0, 1..=14).is_err());
        assert!(is_in_range(15, 1..=14).is_err());
    }

    #[test]
    fn blank_strings_are_empty() {
        assert!(is_not_empty("/dev/ttyUSB0").is_ok());
        assert!(is_not_empty("   ").is_err());
    }

    #[test]
    fn positive_rejects_nan_and_zero() {
        assert!(is_positive(0.5).is_ok());
        assert!(is_positive(0.0).is_err());
        assert!(is_positive(-1.0).is_err());
        assert!(is_positive(f64::NAN).is_err());
    }
}
