use thiserror::Error;

/// Malformed or unsafe input.
///
/// Validation errors are raised before any resource (worktree slot, rate
/// limit token, database row) is touched and are never retried.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("Invalid {field} '{value}': must match ^[A-Za-z0-9_-]{{1,64}}$")]
    InvalidIdentifier { field: &'static str, value: String },

    #[error("{field} must be within [{min}, {max}], got {value}")]
    OutOfRange {
        field: &'static str,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("{field} is too large: {size} exceeds the limit of {max}")]
    TooLarge {
        field: &'static str,
        size: usize,
        max: usize,
    },

    #[error("Invalid path in {field}: {path}")]
    InvalidPath { field: &'static str, path: String },

    #[error("{field} must not be empty")]
    Empty { field: &'static str },

    #[error("Invalid {field}: {message}")]
    Invalid { field: &'static str, message: String },
}

impl ValidationError {
    /// Name of the offending input field.
    pub fn field(&self) -> &'static str {
        match self {
            Self::InvalidIdentifier { field, .. }
            | Self::OutOfRange { field, .. }
            | Self::TooLarge { field, .. }
            | Self::InvalidPath { field, .. }
            | Self::Empty { field }
            | Self::Invalid { field, .. } => field,
        }
    }
}
