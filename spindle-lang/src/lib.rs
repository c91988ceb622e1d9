//! An actor-oriented scripting virtual machine.
//!
//! Programs are compiled into [`Exemplar`](exemplar::Exemplar)s, one per
//! machine type. An [`Engine`](engine::Engine) instantiates machines as
//! [`Fiber`](fiber::Fiber)s, runs them until they wait on a time or event
//! condition, and resumes them from its scheduler as time advances.

use std::fmt::{self, Display};

macro_rules! impl_from {
    ($on:ty, $from:ty, $variant:ident) => {
        impl From<$from> for $on {
            fn from(value: $from) -> Self {
                Self::$variant(value.into())
            }
        }
    };
}

#[cfg(feature = "tracing")]
#[macro_use]
extern crate tracing;
#[cfg(not(feature = "tracing"))]
#[macro_use]
mod mock_tracing;

pub mod engine;
pub mod exemplar;
pub mod fiber;
pub mod machine;
pub mod runtime;
pub mod scheduler;

#[cfg(test)]
mod tests;

use exemplar::ExemplarError;
use fiber::{ExecutionError, Fault};
use scheduler::SchedulerError;

/// Summarizes an error's kind.
pub trait ErrorKind {
    /// Returns the summary of the error being raised.
    fn kind(&self) -> &'static str;
}

/// An error raised by an engine.
#[derive(Debug, Clone, PartialEq)]
pub enum Error {
    /// A machine's exemplar failed validation.
    Exemplar(ExemplarError),
    /// A fiber faulted while running.
    Execution(ExecutionError),
    /// The scheduler rejected an operation.
    Scheduler(SchedulerError),
    /// An operation failed outside of a running fiber.
    Fault(Fault),
}

impl_from!(Error, ExemplarError, Exemplar);
impl_from!(Error, ExecutionError, Execution);
impl_from!(Error, SchedulerError, Scheduler);
impl_from!(Error, Fault, Fault);

impl ErrorKind for Error {
    fn kind(&self) -> &'static str {
        match self {
            Error::Exemplar(err) => err.kind(),
            Error::Execution(err) => err.fault.kind(),
            Error::Scheduler(err) => err.kind(),
            Error::Fault(fault) => fault.kind(),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Error::Exemplar(err) => Display::fmt(err, f),
            Error::Execution(err) => Display::fmt(err, f),
            Error::Scheduler(err) => Display::fmt(err, f),
            Error::Fault(fault) => Display::fmt(fault, f),
        }
    }
}

impl std::error::Error for Error {}
