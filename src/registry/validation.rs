//! Shared validation helpers for method params.
//!
//! Centralizes the semantic checks (names, vectors, colors, frame ranges) so
//! every method reports them as `VALIDATION_FAILED` with consistent messages.

use crate::error::AppError;

/// Most frames a single animation job may render.
pub const MAX_ANIMATION_FRAMES: i64 = 100_000;

/// Validate that a name is non-empty after trimming.
pub fn validate_name(value: &str, field: &str) -> Result<(), AppError> {
    if value.trim().is_empty() {
        return Err(AppError::validation(format!("{field} must not be empty")));
    }
    Ok(())
}

/// Validate that every component of an optional vector is finite.
pub fn validate_finite_vec3(value: Option<[f64; 3]>, field: &str) -> Result<(), AppError> {
    match value {
        Some(v) if v.iter().any(|c| !c.is_finite()) => {
            Err(AppError::validation(format!("{field} components must be finite")))
        }
        _ => Ok(()),
    }
}

/// Validate an RGBA color: four finite channels in [0.0, 1.0].
pub fn validate_base_color(color: [f64; 4]) -> Result<(), AppError> {
    if color.iter().any(|c| !c.is_finite() || !(0.0..=1.0).contains(c)) {
        return Err(AppError::validation(format!(
            "baseColor channels must be between 0.0 and 1.0, got {color:?}"
        )));
    }
    Ok(())
}

/// Validate an inclusive frame range and its step.
pub fn validate_frame_range(start: i64, end: i64, step: u32) -> Result<(), AppError> {
    if start > end {
        return Err(AppError::validation(format!(
            "frameStart ({start}) must not be after frameEnd ({end})"
        )));
    }
    if step == 0 {
        return Err(AppError::validation("frameStep must be at least 1"));
    }
    let count = (i128::from(end) - i128::from(start)) / i128::from(step) + 1;
    if count > i128::from(MAX_ANIMATION_FRAMES) {
        return Err(AppError::validation(format!(
            "frame range covers {count} frames, limit is {MAX_ANIMATION_FRAMES}"
        )));
    }
    Ok(())
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::error::ErrorCode;

    #[test]
    fn test_frame_range_bounds() {
        assert!(validate_frame_range(1, 1, 1).is_ok());
        assert!(validate_frame_range(-5, 5, 2).is_ok());
        assert_eq!(
            validate_frame_range(3, 1, 1).unwrap_err().code(),
            ErrorCode::ValidationFailed
        );
        assert!(validate_frame_range(1, 10, 0).is_err());
        assert!(validate_frame_range(0, MAX_ANIMATION_FRAMES, 1).is_err());
        assert_eq!(
            validate_frame_range(i64::MIN, i64::MAX, 1).unwrap_err().code(),
            ErrorCode::ValidationFailed
        );
        assert!(validate_frame_range(i64::MIN, i64::MAX, u32::MAX).is_err());
        assert!(validate_frame_range(i64::MAX - 1, i64::MAX, 1).is_ok());
    }

    #[test]
    fn test_color_and_names() {
        assert!(validate_base_color([0.0, 0.5, 1.0, 1.0]).is_ok());
        assert!(validate_base_color([1.2, 0.0, 0.0, 1.0]).is_err());
        assert!(validate_name("  ", "name").is_err());
        assert!(validate_name("Cube", "name").is_ok());
    }
}
