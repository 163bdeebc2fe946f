//! Unified error type.

use std::fmt;

/// The error type returned by stunt's fallible operations.
///
/// Scripted outcomes (404, 405, 408, 500, etc.) are expressed as HTTP
/// responses, not as `Error`s. This type surfaces infrastructure failures:
/// binding the listener or starting the fixture twice.
#[derive(Debug)]
pub enum Error {
    /// Binding or accepting on the listener socket failed.
    Io(std::io::Error),
    /// `start` was called on a fixture that is already running.
    AlreadyStarted,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Io(e) => write!(f, "io: {e}"),
            Self::AlreadyStarted => write!(f, "server fixture is already running"),
        }
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Io(e) => Some(e),
            Self::AlreadyStarted => None,
        }
    }
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e)
    }
}
