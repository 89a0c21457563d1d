//! The error taxonomy shared by every backend, the job engine, and the
//! client/daemon bridge.
//!
//! Short-lived native errors (e.g. `EINTR`) are retried locally inside a
//! backend and never surface here. I/O errors propagate unchanged; they
//! are not wrapped into [`Error::Internal`]. Protocol framing errors on the
//! client/daemon bridge are the one case that *is* folded into
//! [`Error::Internal`], after logging, per the propagation policy.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid uri: {0}")]
    InvalidUri(String),
    #[error("invalid open mode")]
    InvalidOpenMode,
    #[error("bad parameters: {0}")]
    BadParameters(String),

    #[error("not found")]
    NotFound,
    #[error("file exists")]
    FileExists,
    #[error("is a directory")]
    IsDirectory,
    #[error("not a directory")]
    NotADirectory,
    #[error("directory not empty")]
    DirectoryNotEmpty,
    #[error("too many levels of symbolic links")]
    Loop,

    #[error("access denied")]
    AccessDenied,
    #[error("read-only filesystem")]
    ReadOnly,
    #[error("login failed")]
    LoginFailed,
    #[error("name too long")]
    NameTooLong,

    #[error("no space left on device")]
    NoSpace,
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("end of file")]
    Eof,
    #[error("interrupted")]
    Interrupted,
    #[error("operation not supported")]
    NotSupported,
    #[error("not the same filesystem")]
    NotSameFilesystem,

    #[error("cancelled")]
    Cancelled,
    #[error("internal error: {0}")]
    Internal(String),
    #[error("{0}")]
    Generic(String),

    #[error("service not available")]
    ServiceNotAvailable,
    #[error("invalid hostname")]
    InvalidHostname,
    #[error("host not found")]
    HostNotFound,
}

impl From<vfs_uri::UriError> for Error {
    fn from(e: vfs_uri::UriError) -> Self {
        match e {
            vfs_uri::UriError::InvalidUri(msg) => Error::InvalidUri(msg),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// `true` for errors a caller could plausibly retry (as opposed to a
    /// structural mistake like `BadParameters`).
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::Io(_) | Error::ServiceNotAvailable | Error::Interrupted
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn io_error_converts_via_from() {
        let io_err = std::io::Error::new(std::io::ErrorKind::NotFound, "nope");
        let err: Error = io_err.into();
        assert!(matches!(err, Error::Io(_)));
    }

    #[test]
    fn uri_error_converts() {
        let uri_err = vfs_uri::UriError::InvalidUri("bad".into());
        let err: Error = uri_err.into();
        assert!(matches!(err, Error::InvalidUri(_)));
    }

    #[test]
    fn retryable_classification() {
        assert!(Error::ServiceNotAvailable.is_retryable());
        assert!(!Error::BadParameters("x".into()).is_retryable());
    }
}
