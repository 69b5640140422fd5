//! Input validation for identifiers and message bodies.
//!
//! Room and user ids become segments of sled keys (`room:user`), so anything
//! that could split or smear a key is rejected up front.

/// Identifier and body validation errors with helpful messages
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("{field} is too long (maximum {max} bytes)")]
    TooLong { field: &'static str, max: usize },

    #[error("{field} contains a key separator or control character")]
    InvalidCharacters { field: &'static str },
}

pub const MAX_ID_BYTES: usize = 64;
pub const KEY_SEPARATOR: char = ':';

/// Validate a room or user identifier for use as a key segment.
pub fn validate_id(field: &'static str, id: &str) -> Result<(), ValidationError> {
    if id.trim().is_empty() {
        return Err(ValidationError::Empty { field });
    }
    if id.len() > MAX_ID_BYTES {
        return Err(ValidationError::TooLong {
            field,
            max: MAX_ID_BYTES,
        });
    }
    if id.chars().any(|c| c == KEY_SEPARATOR || c.is_control()) {
        return Err(ValidationError::InvalidCharacters { field });
    }
    Ok(())
}

/// Validate a message body against the configured byte limit.
pub fn validate_body(body: &str, max_bytes: usize) -> Result<(), ValidationError> {
    if body.trim().is_empty() {
        return Err(ValidationError::Empty { field: "body" });
    }
    if body.len() > max_bytes {
        return Err(ValidationError::TooLong {
            field: "body",
            max: max_bytes,
        });
    }
    Ok(())
}
