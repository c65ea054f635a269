//! Error types for the registry sync engine
//!
//! Most operations talk to a remote agent on behalf of many independent
//! items (services, checks, handlers). Per-item failures must not abort the
//! remaining items, so the fallible entry points accumulate into a
//! [`MultiError`] and report everything at once.

use std::fmt;

use thiserror::Error;

/// Result type alias for sync operations
pub type Result<T> = std::result::Result<T, Error>;

/// Core error type for the registry sync engine
#[derive(Error, Debug)]
pub enum Error {
    /// Remote agent rejected or failed a call
    #[error("agent error: {0}")]
    Agent(String),

    /// Authentication with the remote agent failed
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Delegated check construction or execution errors
    #[error("check error: {0}")]
    Check(String),

    /// Configuration errors
    #[error("configuration error: {0}")]
    Config(String),

    /// A producer-supplied service or check definition was invalid
    #[error("invalid service definition: {0}")]
    InvalidService(String),

    /// A periodic handler failed
    #[error("periodic handler {name}: {message}")]
    Handler {
        /// Handler name as registered
        name: String,
        /// Error message
        message: String,
    },

    /// HTTP transport errors
    #[error("HTTP error: {0}")]
    Http(String),

    /// JSON serialization/deserialization errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Several independent failures from one operation
    #[error("{0}")]
    Multiple(MultiError),

    /// Generic error with context
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Create an agent error
    pub fn agent(msg: impl Into<String>) -> Self {
        Self::Agent(msg.into())
    }

    /// Create an authentication error
    pub fn auth(msg: impl Into<String>) -> Self {
        Self::Authentication(msg.into())
    }

    /// Create a check error
    pub fn check(msg: impl Into<String>) -> Self {
        Self::Check(msg.into())
    }

    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid service definition error
    pub fn invalid_service(msg: impl Into<String>) -> Self {
        Self::InvalidService(msg.into())
    }

    /// Create a periodic handler error
    pub fn handler(name: impl Into<String>, err: &Error) -> Self {
        Self::Handler {
            name: name.into(),
            message: err.to_string(),
        }
    }

    /// Create an HTTP error
    pub fn http(msg: impl Into<String>) -> Self {
        Self::Http(msg.into())
    }
}

/// Accumulator for per-item failures.
///
/// Collects errors across a multi-item operation and converts back to a
/// `Result` at the end: empty means `Ok(())`, a single error is returned
/// as-is, anything more is wrapped in [`Error::Multiple`].
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {
    /// Create an empty accumulator
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failure
    pub fn push(&mut self, err: Error) {
        self.errors.push(err);
    }

    /// Whether any failure was recorded
    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    /// Number of recorded failures
    pub fn len(&self) -> usize {
        self.errors.len()
    }

    /// Access the recorded failures
    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// Collapse into a `Result`
    pub fn into_result(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(Error::Multiple(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred: ", self.errors.len())?;
        for (i, err) in self.errors.iter().enumerate() {
            if i > 0 {
                write!(f, "; ")?;
            }
            write!(f, "{}", err)?;
        }
        Ok(())
    }
}
