use std::fmt;
use std::io;

use thiserror::Error;

/// Types of errors that can occur while switching privileges
#[derive(PartialEq, Eq, Copy, Clone, Debug)]
#[non_exhaustive]
pub enum ErrorKind {
    /// Invalid or malformed configuration
    Config,
    /// The capability query mechanism itself failed
    CapabilityQuery,
    /// Narrowing the capability sets failed, or a required capability is missing
    CapabilityReduction,
    /// A UID/GID system call failed mid-transition
    IdentityTransition,
    /// `chdir()`/`chroot()`/`fchdir()` failed
    Confinement,
    /// The controller was driven out of order, or is in the failed state
    Lifecycle,
}

impl ErrorKind {
    fn description(self) -> &'static str {
        match self {
            ErrorKind::Config => "configuration error",
            ErrorKind::CapabilityQuery => "capability query failed",
            ErrorKind::CapabilityReduction => "capability reduction failed",
            ErrorKind::IdentityTransition => "identity transition failed",
            ErrorKind::Confinement => "root confinement failed",
            ErrorKind::Lifecycle => "lifecycle error",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.description())
    }
}

/// Internal representation of privilege switching errors
#[derive(Debug, Error)]
enum ErrorRepr {
    /// Error from the nix crate, with the call that produced it
    #[error("{context}: {source}")]
    FromNix {
        context: String,
        #[source]
        source: nix::Error,
    },
    /// I/O error, with the call that produced it
    #[error("{context}: {source}")]
    FromIo {
        context: String,
        #[source]
        source: io::Error,
    },
    /// Error with a description only
    #[error("{0}")]
    WithDescription(String),
}

/// Error type for privilege switching operations
#[derive(Debug, Error)]
#[error("{kind}: {repr}")]
pub struct PrivSwapError {
    kind: ErrorKind,
    #[source]
    repr: ErrorRepr,
}

impl PrivSwapError {
    /// Error with a description only
    pub fn new<T: Into<String>>(kind: ErrorKind, description: T) -> Self {
        PrivSwapError {
            kind,
            repr: ErrorRepr::WithDescription(description.into()),
        }
    }

    /// Wrap a failed system call, naming the call in `context` (e.g. `chroot(/srv)`)
    pub fn sys<T: Into<String>>(kind: ErrorKind, context: T, source: nix::Error) -> Self {
        PrivSwapError {
            kind,
            repr: ErrorRepr::FromNix {
                context: context.into(),
                source,
            },
        }
    }

    /// Wrap an I/O error, naming the call in `context`
    pub fn io<T: Into<String>>(kind: ErrorKind, context: T, source: io::Error) -> Self {
        PrivSwapError {
            kind,
            repr: ErrorRepr::FromIo {
                context: context.into(),
                source,
            },
        }
    }

    /// The kind of failure
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// The underlying OS error number, when the error came from a system call
    pub fn errno(&self) -> Option<i32> {
        match self.repr {
            ErrorRepr::FromNix { source, .. } => Some(source as i32),
            ErrorRepr::FromIo { ref source, .. } => source.raw_os_error(),
            ErrorRepr::WithDescription(_) => None,
        }
    }
}

impl From<nix::Error> for PrivSwapError {
    fn from(e: nix::Error) -> PrivSwapError {
        PrivSwapError::sys(ErrorKind::IdentityTransition, "system call", e)
    }
}

impl From<io::Error> for PrivSwapError {
    fn from(e: io::Error) -> PrivSwapError {
        PrivSwapError::io(ErrorKind::Confinement, "I/O", e)
    }
}

impl From<(ErrorKind, &'static str)> for PrivSwapError {
    fn from((kind, description): (ErrorKind, &'static str)) -> PrivSwapError {
        PrivSwapError::new(kind, description)
    }
}

pub type Result<T> = std::result::Result<T, PrivSwapError>;
