//! Error types for the runtime.
//!
//! Errors are explicit and typed. An [`Error`] carries a kind, optional
//! deterministic context text, an optional source, and the list of
//! *suppressed* errors that were observed while the primary error was
//! already in flight (cleanup failures, concurrent sibling failures).
//! The suppressed list is how teardown reports everything it saw without
//! ever replacing the error that started the collapse.

use core::fmt;
use std::rc::Rc;

/// The kind of a runtime error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// Admission into a scope that is closing or closed.
    ScopeClosed,
    /// Misuse of the runtime: double `next` waiters, `provide` outside a
    /// resource body, claiming an outcome twice.
    Protocol,
    /// An error raised while a cleanup was running.
    Cleanup,
    /// The runtime was driven but can never settle (no ready work, no
    /// timers) or exceeded its step guard.
    Deadlock,
    /// A demanded value turned out to be a halted frame.
    Halted,
    /// Runtime bug.
    Internal,
    /// Error raised by user code.
    User,
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::ScopeClosed => write!(f, "scope closed"),
            Self::Protocol => write!(f, "protocol violation"),
            Self::Cleanup => write!(f, "cleanup failed"),
            Self::Deadlock => write!(f, "deadlock"),
            Self::Halted => write!(f, "halted"),
            Self::Internal => write!(f, "internal error"),
            Self::User => write!(f, "error"),
        }
    }
}

/// The error type used throughout the runtime.
#[derive(Clone)]
pub struct Error {
    kind: ErrorKind,
    context: Option<String>,
    source: Option<Rc<dyn std::error::Error + 'static>>,
    suppressed: Vec<Error>,
}

impl Error {
    /// Creates an error with the given kind and no context.
    #[must_use]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            context: None,
            source: None,
            suppressed: Vec::new(),
        }
    }

    /// Creates a user error from a message.
    #[must_use]
    pub fn msg(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::User).with_context(message)
    }

    /// Wraps a user error value.
    #[must_use]
    pub fn user(source: impl std::error::Error + 'static) -> Self {
        Self::new(ErrorKind::User).with_source(source)
    }

    /// Creates a scope-closed admission error.
    #[must_use]
    pub fn scope_closed() -> Self {
        Self::new(ErrorKind::ScopeClosed)
    }

    /// Creates a protocol-violation error with context.
    #[must_use]
    pub fn protocol(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Protocol).with_context(message)
    }

    /// Adds context text.
    #[must_use]
    pub fn with_context(mut self, context: impl Into<String>) -> Self {
        self.context = Some(context.into());
        self
    }

    /// Adds a source error.
    #[must_use]
    pub fn with_source(mut self, source: impl std::error::Error + 'static) -> Self {
        self.source = Some(Rc::new(source));
        self
    }

    /// Returns the error kind.
    #[must_use]
    pub const fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns the context text, if any.
    #[must_use]
    pub fn context(&self) -> Option<&str> {
        self.context.as_deref()
    }

    /// Attaches an error observed while this one was already in flight.
    pub fn push_suppressed(&mut self, error: Error) {
        self.suppressed.push(error);
    }

    /// Errors suppressed behind this one, oldest first.
    #[must_use]
    pub fn suppressed(&self) -> &[Error] {
        &self.suppressed
    }

    /// Returns true if this error reports a closed scope.
    #[must_use]
    pub const fn is_scope_closed(&self) -> bool {
        matches!(self.kind, ErrorKind::ScopeClosed)
    }
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.context, &self.source) {
            (Some(ctx), _) => write!(f, "{}: {ctx}", self.kind)?,
            (None, Some(src)) => write!(f, "{src}")?,
            (None, None) => write!(f, "{}", self.kind)?,
        }
        if !self.suppressed.is_empty() {
            write!(f, " (+{} suppressed)", self.suppressed.len())?;
        }
        Ok(())
    }
}

impl fmt::Debug for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Error")
            .field("kind", &self.kind)
            .field("context", &self.context)
            .field("source", &self.source.as_ref().map(|s| s.to_string()))
            .field("suppressed", &self.suppressed)
            .finish()
    }
}

impl std::error::Error for Error {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.source.as_deref()
    }
}

/// Result alias for runtime operations.
pub type Result<T, E = Error> = std::result::Result<T, E>;
