//! Carried-error types and error handling strategy.
//!
//! Two kinds of failure exist around a deferred and only one of them lives
//! here. *Carried* errors are ordinary values: they flow down the chain,
//! select the error-path link at each step, and are recoverable by any
//! downstream error link. *Programming* errors (completing twice, chaining
//! a deferred to itself, overflowing the chain, resuming a deferred that is
//! not paused) are contract violations and panic at the offending call
//! site; nothing in this module represents them.

use core::fmt;
use std::sync::Arc;

/// The kind of a carried error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Raised by user code: a failing link or an explicit error completion.
    User,
    /// A join gave up before the deferred settled.
    Timeout,
    /// At least one deferred in a group failed.
    Group,
    /// A typed handle observed a value of a different type.
    TypeMismatch,
}

/// The error value carried along a deferred's error path.
///
/// Whatever a link raises is wrapped in (or already is) one of these; the
/// next error-path link receives it and may recover by returning a plain
/// value, which reverts flow to the success path.
#[derive(Debug, Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Arc<dyn std::error::Error + Send + Sync>>,
}

impl Error {
    /// Creates a new error with the given kind.
    #[must_use]
    pub const fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
        }
    }

    /// Creates a user error carrying a message. The everyday constructor
    /// for raising out of a callback.
    #[must_use]
    pub fn user(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::User).with_context(message)
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the context message, if any.
    #[must_use]
    pub fn message(&self) -> &str {
        self.context.as_deref().unwrap_or("")
    }

    /// Returns true if this error is a join timeout.
    #[must_use]
    pub const fn is_timeout(&self) -> bool {
        matches!(self.kind, ErrorKind::Timeout)
    }

    /// Adds context text to the error.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Adds a source error to the chain.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + Send + Sync + 'static) -> Self {
        self.source = Some(Arc::new(source));
        self
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self.kind)?;
        if let Some(context) = &self.context {
            write!(f, ": {context}")?;
        }
        Ok(())
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_ref().map(|e| e.as_ref() as _)
    }
}

/// A specialized Result for operations that settle with a carried error.
pub type Result<T> = core::result::Result<T, Error>;
