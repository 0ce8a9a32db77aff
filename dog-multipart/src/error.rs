use thiserror::Error;

use crate::observability::Operation;

/// Result type for multipart upload operations
pub type MultipartResult<T> = Result<T, MultipartError>;

/// Errors that can occur while turning a byte stream into a multipart upload
#[derive(Error, Debug)]
pub enum MultipartError {
    #[error("Size limit exceeded: {reason}")]
    SizeLimitExceeded { reason: String },

    #[error("Staging I/O error: {source}")]
    StagingIo {
        #[from]
        source: std::io::Error,
    },

    #[error("Transient backend error during {operation}: {message}")]
    BackendTransient { operation: Operation, message: String },

    #[error("Permanent backend error during {operation}: {message}")]
    BackendPermanent { operation: Operation, message: String },

    #[error("Upload session canceled")]
    SessionCanceled,

    #[error("Object not found: {key}")]
    NotFound { key: String },

    #[error("Invalid configuration: {message}")]
    InvalidConfig { message: String },

    #[error("Invalid request: {message}")]
    Invalid { message: String },

    #[error("Serialization error: {source}")]
    Serialization {
        #[from]
        source: serde_json::Error,
    },
}

impl MultipartError {
    /// Create a size limit error
    pub fn size_limit<S: Into<String>>(reason: S) -> Self {
        Self::SizeLimitExceeded {
            reason: reason.into(),
        }
    }

    /// Create an invalid request error
    pub fn invalid<S: Into<String>>(message: S) -> Self {
        Self::Invalid {
            message: message.into(),
        }
    }

    /// Create an invalid configuration error
    pub fn invalid_config<S: Into<String>>(message: S) -> Self {
        Self::InvalidConfig {
            message: message.into(),
        }
    }

    /// Create a not found error
    pub fn not_found<S: Into<String>>(key: S) -> Self {
        Self::NotFound { key: key.into() }
    }

    /// Whether the failure may succeed if the same request is sent again
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::BackendTransient { .. })
    }
}

/// Classification of a failed backend call
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackendErrorKind {
    /// Network blip, throttling, 5xx
    Transient,
    /// Auth, malformed request, missing upload
    Permanent,
    /// The addressed object does not exist
    NotFound,
}

/// Error reported by an [`ObjectBackend`](crate::backend::ObjectBackend) call
#[derive(Error, Debug, Clone)]
#[error("{kind:?} failure in {operation}: {message}")]
pub struct BackendError {
    pub kind: BackendErrorKind,
    pub operation: Operation,
    pub message: String,
}

impl BackendError {
    pub fn new<S: Into<String>>(kind: BackendErrorKind, operation: Operation, message: S) -> Self {
        Self {
            kind,
            operation,
            message: message.into(),
        }
    }

    pub fn transient<S: Into<String>>(operation: Operation, message: S) -> Self {
        Self::new(BackendErrorKind::Transient, operation, message)
    }

    pub fn permanent<S: Into<String>>(operation: Operation, message: S) -> Self {
        Self::new(BackendErrorKind::Permanent, operation, message)
    }

    pub fn not_found<S: Into<String>>(operation: Operation, key: S) -> Self {
        Self::new(BackendErrorKind::NotFound, operation, key)
    }

    pub fn is_retryable(&self) -> bool {
        self.kind == BackendErrorKind::Transient
    }
}

impl From<BackendError> for MultipartError {
    fn from(err: BackendError) -> Self {
        match err.kind {
            BackendErrorKind::Transient => Self::BackendTransient {
                operation: err.operation,
                message: err.message,
            },
            BackendErrorKind::Permanent => Self::BackendPermanent {
                operation: err.operation,
                message: err.message,
            },
            BackendErrorKind::NotFound => Self::NotFound { key: err.message },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backend_errors_map_to_session_kinds() {
        let transient: MultipartError =
            BackendError::transient(Operation::UploadPart, "throttled").into();
        assert!(transient.is_retryable());
        assert!(matches!(
            transient,
            MultipartError::BackendTransient { operation: Operation::UploadPart, .. }
        ));

        let permanent: MultipartError =
            BackendError::permanent(Operation::CreateMultipartUpload, "access denied").into();
        assert!(!permanent.is_retryable());

        let missing: MultipartError =
            BackendError::not_found(Operation::HeadObject, "uploads/abc").into();
        assert!(matches!(missing, MultipartError::NotFound { key } if key == "uploads/abc"));
    }
}
