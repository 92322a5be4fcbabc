//! App error surfacing plumbing.

use std::fmt::Display;

use derive_more::Display;
use tracerr::{Trace, Traced};

use crate::platform;

/// Error which may be caused by a failure inside the underlying platform
/// media stack.
///
/// Implemented by hand for every module error enum, since the cause chain is
/// a plain [`platform::Error`] here and doesn't warrant a derive.
pub trait Caused {
    /// Returns name of this error.
    fn name(&self) -> &'static str;

    /// Returns the [`platform::Error`] if it is the cause.
    fn cause(self) -> Option<platform::Error>;
}

/// Error surfaced to the embedder of this engine.
///
/// Carries a human readable name and message of the concrete error along
/// with the [`Trace`] of the propagation path it travelled.
#[derive(Clone, Debug, Display)]
#[display(fmt = "{}: {}\n{}", name, message, trace)]
pub struct EngineError {
    name: &'static str,
    message: String,
    trace: Trace,
    cause: Option<platform::Error>,
}

impl EngineError {
    /// Returns name of this error.
    #[inline]
    #[must_use]
    pub fn name(&self) -> &'static str {
        self.name
    }

    /// Returns message of this error.
    #[inline]
    #[must_use]
    pub fn message(&self) -> String {
        self.message.clone()
    }

    /// Returns the propagation path of this error.
    #[inline]
    #[must_use]
    pub fn trace(&self) -> String {
        self.trace.to_string()
    }

    /// Returns the underlying platform error if it is the cause.
    #[inline]
    #[must_use]
    pub fn cause(&self) -> Option<platform::Error> {
        self.cause.clone()
    }

    /// Prints this error with [`log::error!`].
    pub fn print(&self) {
        log::error!("{}", self);
    }
}

impl<E: Caused + Display> From<(E, Trace)> for EngineError {
    fn from((err, trace): (E, Trace)) -> Self {
        Self {
            name: err.name(),
            message: err.to_string(),
            trace,
            cause: err.cause(),
        }
    }
}

impl<E: Caused + Display> From<Traced<E>> for EngineError {
    fn from(traced: Traced<E>) -> Self {
        Self::from(traced.into_parts())
    }
}

/// Occurs if the referenced engine object was disposed.
#[derive(Clone, Copy, Debug, Display)]
#[display(fmt = "Handler is in detached state")]
pub struct HandlerDetachedError;

impl Caused for HandlerDetachedError {
    fn name(&self) -> &'static str {
        "HandlerDetachedError"
    }

    fn cause(self) -> Option<platform::Error> {
        None
    }
}
