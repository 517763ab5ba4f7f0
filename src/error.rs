use thiserror::Error;

/// Errors arising from parsing response lines.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum WireError {
    #[error("expected `{tag}=<value>`, got {line:?}")]
    UnexpectedTag { tag: &'static str, line: String },

    #[error("{field} value {value:?} is not an integer")]
    NotInteger { field: &'static str, value: String },

    #[error("{field} value {value} out of range")]
    OutOfRange { field: &'static str, value: i64 },

    #[error("invalid error code token {token:?}")]
    InvalidCode { token: String },
}

impl WireError {
    pub(crate) fn unexpected_tag(tag: &'static str, line: &str) -> Self {
        Self::UnexpectedTag { tag, line: line.to_string() }
    }
}

pub type Result<T> = std::result::Result<T, WireError>;
