//! Error types for the watch engine
//!
//! Uses `thiserror`; every error that originates in an OS call carries the
//! raw OS error code so host bindings can attach `errno` and a symbolic
//! name to whatever they surface.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// Result type alias for watch-engine operations
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced synchronously by `watch` and session setup.
///
/// Anomalies detected on the background notification thread are never
/// surfaced through this type; they are dropped or end the loop (see the
/// crate docs on delivery policy).
#[derive(Error, Debug)]
pub enum Error {
    /// The OS notification primitive could not be allocated. Recorded once
    /// at source construction; every subsequent watch attempt on the same
    /// source fails fast with the recorded code.
    #[error("unable to initialize the platform notification source (os error {errno})")]
    Init { errno: i32 },

    /// The OS rejected the watch registration: missing path, insufficient
    /// permissions, or watch/descriptor-limit exhaustion.
    #[error("unable to watch `{}` (os error {errno})", .path.display())]
    Watch { path: PathBuf, errno: i32 },

    /// Directory required. Windows directory-change notification only
    /// accepts directories; file-level watching is emulated above this
    /// engine.
    #[error("`{}` is not a directory", .path.display())]
    NotADirectory { path: PathBuf },

    /// `watch` was called before a callback was registered.
    #[error("no callback registered; call set_callback before watch")]
    NoCallback,
}

impl Error {
    /// The originating OS error code, if there is one.
    pub fn os_error_code(&self) -> Option<i32> {
        match self {
            Error::Init { errno } | Error::Watch { errno, .. } => Some(*errno),
            _ => None,
        }
    }

    /// The originating OS error as an [`io::Error`], for callers that want
    /// the platform's message text or an [`io::ErrorKind`].
    pub fn as_io_error(&self) -> Option<io::Error> {
        self.os_error_code().map(io::Error::from_raw_os_error)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display_init() {
        let err = Error::Init { errno: 24 };
        assert_eq!(
            err.to_string(),
            "unable to initialize the platform notification source (os error 24)"
        );
    }

    #[test]
    fn test_error_display_watch() {
        let err = Error::Watch {
            path: PathBuf::from("/no/such/path"),
            errno: 2,
        };
        assert_eq!(err.to_string(), "unable to watch `/no/such/path` (os error 2)");
    }

    #[test]
    fn test_error_display_no_callback() {
        let err = Error::NoCallback;
        assert_eq!(
            err.to_string(),
            "no callback registered; call set_callback before watch"
        );
    }

    #[test]
    fn test_os_error_code_accessors() {
        let err = Error::Watch {
            path: PathBuf::from("x"),
            errno: 2,
        };
        assert_eq!(err.os_error_code(), Some(2));
        assert_eq!(
            err.as_io_error().map(|e| e.kind()),
            Some(io::ErrorKind::NotFound)
        );
        assert_eq!(Error::NoCallback.os_error_code(), None);
    }
}
