//! Error handling utils.
//!
//! Poseidon sorts errors by origin rather than by type name, matching the
//! taxonomy of the runtime core: system errors, protocol errors, timeouts,
//! resource errors, and wrapped failures surfaced through [`fiber::Future`](crate::fiber::Future).

use std::fmt;
use std::io;

use crate::websocket::CloseStatus;

/// A specialized [`Result`] type for the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// What kind of deadline was missed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutKind {
    /// A fiber was resumed anyway after `fail_timeout` because its watched
    /// future never became ready.
    FiberFail,
    /// A socket `connect()` did not complete in time.
    Connect,
    /// A socket read did not produce data in time.
    Read,
    /// A socket write did not drain in time.
    Write,
}

impl fmt::Display for TimeoutKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TimeoutKind::FiberFail => "fiber fail_timeout elapsed",
            TimeoutKind::Connect => "connect timeout",
            TimeoutKind::Read => "read timeout",
            TimeoutKind::Write => "write timeout",
        };
        f.write_str(s)
    }
}

/// Represents all error cases for all routines of the crate.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    #[error("system error: {0}")]
    System(#[from] io::Error),

    #[error("protocol error ({status:?}): {description}")]
    Protocol {
        status: CloseStatus,
        description: String,
    },

    #[error("{0}")]
    Timeout(TimeoutKind),

    #[error("resource error: {0}")]
    Resource(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("tls error: {0}")]
    Tls(#[from] openssl::error::ErrorStack),

    #[error("deflate error: {0}")]
    Deflate(#[from] flate2::CompressError),

    #[error("inflate error: {0}")]
    Inflate(#[from] flate2::DecompressError),
}

impl Error {
    /// Builds a [`Error::Protocol`] carrying the WebSocket close status that
    /// should be sent for this failure.
    pub fn protocol(status: CloseStatus, description: impl Into<String>) -> Self {
        Error::Protocol {
            status,
            description: description.into(),
        }
    }
}
