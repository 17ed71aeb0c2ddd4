use hyper::StatusCode;
use thiserror::Error;

/// Failure taxonomy exposed to HTTP callers.
///
/// Internal detail (worker stderr, io errors) is logged where the failure is
/// observed; the messages below are the only text that reaches a caller.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error("encryption key must be at least 8 characters")]
    InvalidKey,
    #[error("missing required header: {0}")]
    MissingHeader(&'static str),
    #[error("invalid request: {0}")]
    InvalidRequest(&'static str),
    #[error("only image files are allowed")]
    UnsupportedMediaType,
    #[error("file exceeds the upload size limit")]
    PayloadTooLarge,
    #[error("image not found")]
    NotFound,
    #[error("no such route")]
    UnknownRoute,
    #[error("encryption failed")]
    CipherFailure,
    #[error("cipher operation timed out")]
    CipherTimeout,
    #[error("decryption failed")]
    DecryptionFailed,
    #[error("internal server error")]
    Internal(anyhow::Error),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            Self::InvalidKey
            | Self::MissingHeader(_)
            | Self::InvalidRequest(_)
            | Self::UnsupportedMediaType => StatusCode::BAD_REQUEST,
            Self::PayloadTooLarge => StatusCode::PAYLOAD_TOO_LARGE,
            Self::NotFound | Self::UnknownRoute => StatusCode::NOT_FOUND,
            Self::CipherFailure
            | Self::CipherTimeout
            | Self::DecryptionFailed
            | Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_mapping() {
        assert_eq!(ApiError::InvalidKey.status(), StatusCode::BAD_REQUEST);
        assert_eq!(
            ApiError::PayloadTooLarge.status(),
            StatusCode::PAYLOAD_TOO_LARGE
        );
        assert_eq!(ApiError::NotFound.status(), StatusCode::NOT_FOUND);
        assert_eq!(
            ApiError::CipherTimeout.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
        assert_eq!(
            ApiError::DecryptionFailed.status(),
            StatusCode::INTERNAL_SERVER_ERROR
        );
    }
}
