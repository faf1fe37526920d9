//! Error handling for daemonlib.
//!
//! All fallible operations in this crate return [`Result`]. The error kinds
//! mirror the conditions the core actually produces: non-blocking FIFO and
//! writer operations report [`ErrorKind::WouldBlock`], writes to a shut-down
//! FIFO report [`ErrorKind::BrokenPipe`], and so on. Operating-system errors
//! that do not map onto a more specific kind surface as [`ErrorKind::Io`]
//! with the underlying error attached as a source.
//!
//! Synchronization primitive failures are deliberately *not* represented
//! here: a failing mutex, condition variable or thread operation indicates a
//! broken invariant in the threading layer and aborts the process (see
//! [`crate::sync`]).

use std::fmt;

/// Result type alias for daemonlib operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Categorizes every error produced by the core.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ErrorKind {
    /// A non-blocking operation could not proceed without blocking.
    WouldBlock,
    /// A write was attempted on a FIFO that has been shut down.
    BrokenPipe,
    /// A non-blocking FIFO write was larger than the FIFO capacity.
    TooBig,
    /// A required file (typically a configuration file) does not exist.
    NotFound,
    /// An unrecoverable read or write error on a handle or sink.
    Io,
    /// An allocation failed; the operation was unwound cleanly.
    OutOfMemory,
}

impl ErrorKind {
    /// Stable string form of the kind, for diagnostics.
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::WouldBlock => "would-block",
            Self::BrokenPipe => "broken-pipe",
            Self::TooBig => "too-big",
            Self::NotFound => "not-found",
            Self::Io => "io",
            Self::OutOfMemory => "oom",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The error type used throughout daemonlib.
#[derive(Debug)]
pub struct Error {
    kind: ErrorKind,
    message: String,
    source: Option<Box<dyn std::error::Error + Send + Sync + 'static>>,
}

impl Error {
    /// Create an error with an explicit kind and message.
    #[must_use]
    pub fn new<S: Into<String>>(kind: ErrorKind, message: S) -> Self {
        Self {
            kind,
            message: message.into(),
            source: None,
        }
    }

    /// Create an error with an explicit kind, message and source error.
    #[must_use]
    pub fn with_source<S, E>(kind: ErrorKind, message: S, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self {
            kind,
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// A non-blocking operation would have blocked.
    #[must_use]
    pub fn would_block<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::WouldBlock, message)
    }

    /// A write hit a shut-down FIFO.
    #[must_use]
    pub fn broken_pipe<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::BrokenPipe, message)
    }

    /// A non-blocking write exceeded the FIFO capacity.
    #[must_use]
    pub fn too_big<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::TooBig, message)
    }

    /// A required file is missing.
    #[must_use]
    pub fn not_found<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::NotFound, message)
    }

    /// An unrecoverable I/O error.
    #[must_use]
    pub fn io<S: Into<String>>(message: S) -> Self {
        Self::new(ErrorKind::Io, message)
    }

    /// An unrecoverable I/O error with the underlying error attached.
    #[must_use]
    pub fn io_with_source<S, E>(message: S, source: E) -> Self
    where
        S: Into<String>,
        E: std::error::Error + Send + Sync + 'static,
    {
        Self::with_source(ErrorKind::Io, message, source)
    }

    /// The kind of this error.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The human-readable message of this error.
    #[must_use]
    pub fn message(&self) -> &str {
        &self.message
    }

    /// True if a retry after readiness could succeed.
    #[must_use]
    pub const fn is_would_block(&self) -> bool {
        matches!(self.kind, ErrorKind::WouldBlock)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({})", self.message, self.kind)
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source
            .as_deref()
            .map(|s| s as &(dyn std::error::Error + 'static))
    }
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        let kind = match err.kind() {
            std::io::ErrorKind::WouldBlock => ErrorKind::WouldBlock,
            std::io::ErrorKind::BrokenPipe => ErrorKind::BrokenPipe,
            std::io::ErrorKind::NotFound => ErrorKind::NotFound,
            std::io::ErrorKind::OutOfMemory => ErrorKind::OutOfMemory,
            _ => ErrorKind::Io,
        };

        Self::with_source(kind, err.to_string(), err)
    }
}

#[cfg(unix)]
impl From<nix::errno::Errno> for Error {
    fn from(errno: nix::errno::Errno) -> Self {
        let kind = match errno {
            nix::errno::Errno::EWOULDBLOCK => ErrorKind::WouldBlock,
            nix::errno::Errno::EPIPE => ErrorKind::BrokenPipe,
            nix::errno::Errno::E2BIG => ErrorKind::TooBig,
            nix::errno::Errno::ENOENT => ErrorKind::NotFound,
            nix::errno::Errno::ENOMEM => ErrorKind::OutOfMemory,
            _ => ErrorKind::Io,
        };

        Self::with_source(kind, errno.desc(), errno)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_mapping_from_io_error() {
        let err: Error = std::io::Error::from(std::io::ErrorKind::WouldBlock).into();
        assert_eq!(err.kind(), ErrorKind::WouldBlock);
        assert!(err.is_would_block());

        let err: Error = std::io::Error::from(std::io::ErrorKind::NotFound).into();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_display_includes_kind() {
        let err = Error::too_big("write of 9 bytes exceeds capacity of 7 bytes");
        let formatted = err.to_string();
        assert!(formatted.contains("too-big"));
        assert!(formatted.contains("9 bytes"));
    }

    #[test]
    fn test_source_chain() {
        let inner = std::io::Error::from(std::io::ErrorKind::PermissionDenied);
        let err = Error::io_with_source("could not write to sink", inner);
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(std::error::Error::source(&err).is_some());
    }
}
