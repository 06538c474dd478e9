use std::path::PathBuf;
use thiserror::Error;

pub type MattingResult<T> = Result<T, MattingError>;

/// Failures surfaced by the matting pipeline and its session store
#[derive(Debug, Error)]
pub enum MattingError {
    /// Bad client input; rejected before any pipeline work
    #[error("Validation failed: {0}")]
    Validation(String),

    #[error("Session not found: {0}")]
    NotFound(String),

    /// A frame could not be read or decoded
    #[error("Failed to decode frame {index}: {message}")]
    Decode { index: usize, message: String },

    #[error("Model failure: {0}")]
    Model(String),

    #[error("Request cancelled")]
    Cancelled,

    #[error("Request timed out after {0} seconds")]
    Timeout(u64),

    #[error("IO error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Internal error: {0}")]
    Unexpected(String),
}

/// Response status tag carried by every service reply
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Status {
    Success,
    Fail,
    NotFound,
}

impl MattingError {
    pub fn validation(message: impl Into<String>) -> Self {
        Self::Validation(message.into())
    }

    pub fn decode(index: usize, message: impl std::fmt::Display) -> Self {
        Self::Decode {
            index,
            message: message.to_string(),
        }
    }

    pub fn model(message: impl std::fmt::Display) -> Self {
        Self::Model(message.to_string())
    }

    pub fn unexpected(message: impl std::fmt::Display) -> Self {
        Self::Unexpected(message.to_string())
    }

    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::Io {
            path: path.into(),
            source,
        }
    }

    pub fn status(&self) -> Status {
        match self {
            Self::NotFound(_) => Status::NotFound,
            _ => Status::Fail,
        }
    }

    /// Message safe to hand back to a client
    ///
    /// Internal failures are collapsed into a generic message; the detail is
    /// only logged.
    pub fn public_message(&self) -> String {
        match self {
            Self::Validation(_)
            | Self::NotFound(_)
            | Self::Decode { .. }
            | Self::Cancelled
            | Self::Timeout(_) => self.to_string(),
            Self::Model(_) | Self::Io { .. } | Self::Unexpected(_) => {
                "Unexpected error".to_string()
            }
        }
    }
}

impl From<ort::Error> for MattingError {
    fn from(err: ort::Error) -> Self {
        Self::Model(err.to_string())
    }
}

impl From<ndarray::ShapeError> for MattingError {
    fn from(err: ndarray::ShapeError) -> Self {
        Self::Model(format!("tensor shape mismatch: {err}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn internal_details_are_not_leaked() {
        let err = MattingError::Unexpected("disk layout corrupted at /srv/x".into());
        assert_eq!(err.public_message(), "Unexpected error");
        assert_eq!(err.status(), Status::Fail);
    }

    #[test]
    fn not_found_has_its_own_status() {
        let err = MattingError::NotFound("abc".into());
        assert_eq!(err.status(), Status::NotFound);
        assert!(err.public_message().contains("abc"));
    }

    #[test]
    fn status_serializes_kebab_case() {
        let json = serde_json::to_string(&Status::NotFound).unwrap();
        assert_eq!(json, "\"not-found\"");
    }
}
