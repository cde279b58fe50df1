//! Error handling for this crate
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A Result containing a SystemError with its accompanying source
pub type TypedResult<T> = Result<T, TypedError>;

/// Category of a fatal or recoverable simulation error
///
/// The category decides where an error surfaces: configuration and resource
/// errors stop the run before the first frame, `FrameTimeout` aborts a running
/// simulation, while signal and protocol errors are converted into
/// client-facing messages on the control channel.
#[derive(Error, Debug, Serialize, Deserialize, Clone, Copy, PartialEq, Eq)]
pub enum SystemError {
    #[error("Configuration rejected")]
    Config,
    #[error("IPC resource error")]
    Resource,
    #[error("Workers failed to complete a frame in time")]
    FrameTimeout,
    #[error("Unknown signal")]
    SignalNotFound,
    #[error("Control protocol error")]
    Protocol,
    #[error("Client connection closed")]
    ClientDisconnect,
    #[error("Unrecoverable error")]
    Panic,
}

/// Combination of a SystemError with an anyhow error
#[derive(Error, Debug)]
#[error("{err}: {source:#}")]
pub struct TypedError {
    err: SystemError,
    source: anyhow::Error,
}

impl TypedError {
    /// Creates a new TypedError
    pub fn new(err: SystemError, source: anyhow::Error) -> Self {
        Self { err, source }
    }

    /// Creates a TypedError from a plain message ([`problem!`] expands to
    /// this, so callers need no anyhow dependency of their own)
    pub fn msg(err: SystemError, message: String) -> Self {
        Self {
            err,
            source: anyhow::Error::msg(message),
        }
    }

    /// Returns the SystemError of this TypedError
    pub fn err(&self) -> SystemError {
        self.err
    }

    /// Returns the anyhow error of this TypedError
    pub fn source(&self) -> &anyhow::Error {
        &self.source
    }
}

/// Converts a Result into one of our own Result types
pub trait ResultExt<T> {
    /// Converts a Result to a TypedResult
    fn typ(self, err: SystemError) -> TypedResult<T>;
}

impl<T, E: Into<anyhow::Error>> ResultExt<T> for Result<T, E> {
    fn typ(self, err: SystemError) -> TypedResult<T> {
        self.map_err(|e| TypedError {
            err,
            source: e.into(),
        })
    }
}

/// Shorthand for constructing a `TypedError` from a format string
#[macro_export]
macro_rules! problem {
    ($err:ident, $($tail:tt)*) => {
        $crate::error::TypedError::msg(
            $crate::error::SystemError::$err,
            ::std::format!($($tail)*),
        )
    };
}
