//! Type-erased values travelling through a callback chain.
//!
//! The chain itself is monomorphic: every link maps one [`Payload`] to the
//! next, and the typed API in [`crate::deferred`] wraps user closures in
//! adapters that downcast on the way in and re-erase on the way out. A
//! payload is one of three things:
//!
//! - a success value (consumed by the next success link),
//! - a carried [`Error`] (consumed by the next error link),
//! - another deferred (parks the chain until it settles).
//!
//! Which variant a callback produced is decided statically by the
//! [`IntoStep`](crate::IntoStep) conversion at registration time, so the
//! core never has to inspect concrete types.

use core::fmt;
use std::any::Any;
use std::sync::Arc;

use crate::deferred::Core;
use crate::error::Error;

/// Bound for values that can travel through a callback chain.
///
/// Blanket-implemented; never implement it by hand. A chain value must be
/// `Send` (it crosses to whichever thread drains the chain), `Clone` (a
/// settled result can reach several observers: the chain itself, joiners,
/// chained deferreds, group slots) and `Debug` (it feeds the debug-level
/// diagnostics).
pub trait Carry: Send + Clone + fmt::Debug + 'static {}

impl<T: Send + Clone + fmt::Debug + 'static> Carry for T {}

/// Object-safe view of a [`Carry`] value held by a chain.
pub(crate) trait ErasedValue: Any + Send {
    fn clone_boxed(&self) -> Box<dyn ErasedValue>;
    fn as_any(&self) -> &dyn Any;
    fn into_any(self: Box<Self>) -> Box<dyn Any>;
    fn fmt_value(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result;
}

impl<T: Carry> ErasedValue for T {
    fn clone_boxed(&self) -> Box<dyn ErasedValue> {
        Box::new(self.clone())
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn into_any(self: Box<Self>) -> Box<dyn Any> {
        self
    }

    fn fmt_value(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

impl Clone for Box<dyn ErasedValue> {
    fn clone(&self) -> Self {
        self.clone_boxed()
    }
}

/// The result currently flowing through a chain.
#[derive(Clone)]
pub(crate) enum Payload {
    /// A success value; the next success link consumes it.
    Value(Box<dyn ErasedValue>),
    /// A carried error; the next error link consumes it.
    Failure(Error),
    /// A nested deferred; the chain parks until it settles.
    Nested(Arc<Core>),
}

impl Payload {
    pub(crate) fn value<T: Carry>(value: T) -> Self {
        Self::Value(Box::new(value))
    }

    pub(crate) fn is_failure(&self) -> bool {
        matches!(self, Self::Failure(_))
    }

    /// Recovers the concrete value, handing the payload back on a miss.
    pub(crate) fn downcast<T: Carry>(self) -> Result<T, Self> {
        match self {
            Self::Value(boxed) if boxed.as_any().is::<T>() => {
                match boxed.into_any().downcast::<T>() {
                    Ok(value) => Ok(*value),
                    Err(_) => unreachable!("type checked right before the downcast"),
                }
            }
            other => Err(other),
        }
    }
}

impl fmt::Debug for Payload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => value.fmt_value(f),
            Self::Failure(error) => write!(f, "{error}"),
            Self::Nested(core) => write!(f, "Deferred@{:p}", Arc::as_ptr(core)),
        }
    }
}
