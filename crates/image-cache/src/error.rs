//! Error types for the download path.
//!
//! These never escape the public facade: every caller-visible operation
//! resolves failures to an [`ImageSource::Remote`](crate::ImageSource)
//! fallback instead.

use std::fmt;

#[derive(Debug)]
pub enum FetchError {
    /// Transport-level failure, including timeouts.
    Http(Box<reqwest::Error>),
    /// Non-success HTTP status; treated identically to a transport error.
    Status(u16),
    /// Saving the downloaded content to local storage failed.
    Io(Box<std::io::Error>),
}

impl fmt::Display for FetchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FetchError::Http(err) => write!(f, "HTTP error: {}", err),
            FetchError::Status(code) => write!(f, "Unexpected status: {}", code),
            FetchError::Io(err) => write!(f, "IO error: {}", err),
        }
    }
}

impl std::error::Error for FetchError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            FetchError::Http(err) => Some(err.as_ref()),
            FetchError::Io(err) => Some(err.as_ref()),
            _ => None,
        }
    }
}

impl From<reqwest::Error> for FetchError {
    fn from(err: reqwest::Error) -> Self {
        FetchError::Http(Box::new(err))
    }
}

impl From<std::io::Error> for FetchError {
    fn from(err: std::io::Error) -> Self {
        FetchError::Io(Box::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_error_display() {
        let err = FetchError::Status(404);
        assert_eq!(format!("{}", err), "Unexpected status: 404");
    }

    #[test]
    fn test_io_error_display() {
        let err = FetchError::from(std::io::Error::new(
            std::io::ErrorKind::PermissionDenied,
            "denied",
        ));
        assert!(format!("{}", err).contains("denied"));
    }

    #[test]
    fn test_error_is_debug() {
        let err = FetchError::Status(500);
        assert!(format!("{:?}", err).contains("Status"));
    }
}
