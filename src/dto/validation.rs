//! Validation helpers for DTOs.

use validator::ValidationError;

use crate::state::identity::Role;

/// Longest accepted device identifier.
pub const MAX_DEVICE_ID_LEN: usize = 64;

/// Validates that a device id is non-empty, at most [`MAX_DEVICE_ID_LEN`]
/// characters, and free of whitespace and control characters.
///
/// # Examples
///
/// ```ignore
/// validate_device_id("4f9c2a1e-ipad") // Ok
/// validate_device_id("")              // Err - empty
/// validate_device_id("bench ipad")    // Err - whitespace
/// ```
pub fn validate_device_id(id: &str) -> Result<(), ValidationError> {
    if id.is_empty() || id.chars().count() > MAX_DEVICE_ID_LEN {
        let mut err = ValidationError::new("device_id_length");
        err.message = Some(
            format!(
                "Device ID must be between 1 and {MAX_DEVICE_ID_LEN} characters (got {})",
                id.chars().count()
            )
            .into(),
        );
        return Err(err);
    }

    if id.chars().any(|c| c.is_whitespace() || c.is_control()) {
        let mut err = ValidationError::new("device_id_format");
        err.message = Some("Device ID must not contain whitespace or control characters".into());
        return Err(err);
    }

    Ok(())
}

/// Only controllers and recorders can be paired.
pub fn validate_pairing_role(role: &Role) -> Result<(), ValidationError> {
    match role {
        Role::Controller | Role::Recorder => Ok(()),
        other => {
            let mut err = ValidationError::new("pairing_role");
            err.message = Some(format!("cannot pair a device as {other}").into());
            Err(err)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_validate_device_id_valid() {
        assert!(validate_device_id("4f9c2a1e-0b7d-4c55-9a0e-2f6d1c3b8e77").is_ok());
        assert!(validate_device_id("a").is_ok());
    }

    #[test]
    fn test_validate_device_id_invalid_length() {
        assert!(validate_device_id("").is_err());
        assert!(validate_device_id(&"x".repeat(MAX_DEVICE_ID_LEN + 1)).is_err());
    }

    #[test]
    fn test_validate_device_id_invalid_format() {
        assert!(validate_device_id("bench ipad").is_err());
        assert!(validate_device_id("tab\tbed").is_err());
    }

    #[test]
    fn test_validate_pairing_role() {
        assert!(validate_pairing_role(&Role::Controller).is_ok());
        assert!(validate_pairing_role(&Role::Recorder).is_ok());
        assert!(validate_pairing_role(&Role::Viewer).is_err());
        assert!(validate_pairing_role(&Role::None).is_err());
    }
}
