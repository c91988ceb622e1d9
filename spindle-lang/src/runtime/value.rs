//! The polymorphic runtime value stored in every [`ValuePool`] slot.
//!
//! [`ValuePool`]: crate::runtime::pool::ValuePool

use std::fmt::{self, Display};

use crate::fiber::FiberId;
use crate::runtime::pool::Handle;
use crate::runtime::symbol::Symbol;

/// A runtime value.
///
/// Values that contain [`Handle`]s own a strong reference to each of them.
/// Values intentionally do not implement `Clone`: duplicating a value must go
/// through [`ValuePool::retain_value`] so that nested handles are retained,
/// and dropping one must go through [`ValuePool::release_value`].
///
/// [`ValuePool::retain_value`]: crate::runtime::pool::ValuePool::retain_value
/// [`ValuePool::release_value`]: crate::runtime::pool::ValuePool::release_value
#[derive(Debug, PartialEq)]
pub enum Value {
    /// The absence of a value.
    Nil,
    /// A signed 64-bit integer.
    Int(i64),
    /// A 64-bit floating point number.
    Real(f64),
    /// An immutable string.
    String(Symbol),
    /// An ordered list of pool-resident values.
    Array(Vec<Handle>),
    /// A strong reference to a fiber's canonical slot.
    Fiber(Handle),
    /// The payload of a fiber's canonical slot.
    Instance(FiberId),
    /// A table of native functions, usable as a call receiver.
    Library(Symbol),
    /// A wake condition for a continuation.
    Condition(Condition),
}

impl Value {
    /// Returns the kind of this value.
    #[must_use]
    pub const fn kind(&self) -> ValueKind {
        match self {
            Value::Nil => ValueKind::Nil,
            Value::Int(_) => ValueKind::Int,
            Value::Real(_) => ValueKind::Real,
            Value::String(_) => ValueKind::String,
            Value::Array(_) => ValueKind::Array,
            Value::Fiber(_) | Value::Instance(_) => ValueKind::Fiber,
            Value::Library(_) => ValueKind::Library,
            Value::Condition(_) => ValueKind::Condition,
        }
    }

    /// Returns this value as a float if it is numeric.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Int(value) => Some(*value as f64),
            Value::Real(value) => Some(*value),
            _ => None,
        }
    }

    /// Returns this value as an integer if it is an integer, or a real with
    /// no fractional component.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(value) => Some(*value),
            Value::Real(value) if value.fract() == 0.0 => Some(*value as i64),
            _ => None,
        }
    }

    /// Returns this value as an index.
    #[must_use]
    pub fn as_usize(&self) -> Option<usize> {
        self.as_i64().and_then(|value| usize::try_from(value).ok())
    }

    /// Returns the contained string, if this is a string.
    #[must_use]
    pub fn as_symbol(&self) -> Option<&Symbol> {
        match self {
            Value::String(value) => Some(value),
            _ => None,
        }
    }

    /// Returns the contained condition, if this is a condition.
    #[must_use]
    pub fn as_condition(&self) -> Option<&Condition> {
        match self {
            Value::Condition(condition) => Some(condition),
            _ => None,
        }
    }

    /// Returns true if this value holds no nested handles.
    #[must_use]
    pub fn is_plain(&self) -> bool {
        !matches!(self, Value::Array(_) | Value::Fiber(_) | Value::Instance(_))
    }
}

impl From<i64> for Value {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Real(value)
    }
}

impl From<Symbol> for Value {
    fn from(value: Symbol) -> Self {
        Self::String(value)
    }
}

impl From<&'_ str> for Value {
    fn from(value: &'_ str) -> Self {
        Self::String(Symbol::from(value))
    }
}

impl From<Condition> for Value {
    fn from(value: Condition) -> Self {
        Self::Condition(value)
    }
}

/// The kind of a [`Value`], used by native function signatures.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum ValueKind {
    /// [`Value::Nil`]
    Nil,
    /// [`Value::Int`]
    Int,
    /// [`Value::Real`]
    Real,
    /// [`Value::String`]
    String,
    /// [`Value::Array`]
    Array,
    /// [`Value::Fiber`] or [`Value::Instance`]
    Fiber,
    /// [`Value::Library`]
    Library,
    /// [`Value::Condition`]
    Condition,
}

impl Display for ValueKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            ValueKind::Nil => "nil",
            ValueKind::Int => "int",
            ValueKind::Real => "real",
            ValueKind::String => "string",
            ValueKind::Array => "array",
            ValueKind::Fiber => "fiber",
            ValueKind::Library => "library",
            ValueKind::Condition => "condition",
        })
    }
}

/// A condition that a continuation waits for.
#[derive(Debug, Clone, PartialEq)]
pub enum Condition {
    /// Wakes once `delay` seconds have elapsed, then every `interval` seconds
    /// while `recurrence` allows.
    Time {
        /// Seconds until the first firing.
        delay: f64,
        /// `0` fires once, `n > 0` re-arms `n` more times, `-1` forever.
        recurrence: i64,
        /// Seconds between re-armed firings.
        interval: f64,
    },
    /// Wakes when an event with a matching discriminator is posted to the
    /// named event list.
    Event {
        /// The continuation list the event is posted to.
        list: Symbol,
        /// The event discriminator to match, e.g. `down`.
        discriminator: Symbol,
        /// `0` fires once, `n > 0` re-arms `n` more times, `-1` forever.
        recurrence: i64,
    },
}

impl Condition {
    /// Returns a condition that fires once after `delay` seconds.
    #[must_use]
    pub const fn after(delay: f64) -> Self {
        Self::Time {
            delay,
            recurrence: 0,
            interval: 0.,
        }
    }

    /// Returns a condition that fires every `interval` seconds until
    /// cancelled.
    #[must_use]
    pub const fn every(interval: f64) -> Self {
        Self::Time {
            delay: interval,
            recurrence: -1,
            interval,
        }
    }

    /// Returns a condition that fires every `interval` seconds, `repeats + 1`
    /// times in total.
    #[must_use]
    pub const fn recur(interval: f64, repeats: i64) -> Self {
        Self::Time {
            delay: interval,
            recurrence: repeats,
            interval,
        }
    }

    /// Returns a condition that fires once when `discriminator` is posted to
    /// `list`.
    #[must_use]
    pub fn event(list: impl Into<Symbol>, discriminator: impl Into<Symbol>) -> Self {
        Self::Event {
            list: list.into(),
            discriminator: discriminator.into(),
            recurrence: 0,
        }
    }

    /// Returns this condition with its recurrence replaced.
    #[must_use]
    pub fn with_recurrence(mut self, new_recurrence: i64) -> Self {
        match &mut self {
            Condition::Time { recurrence, .. } | Condition::Event { recurrence, .. } => {
                *recurrence = new_recurrence;
            }
        }
        self
    }

    /// Returns the recurrence of this condition.
    #[must_use]
    pub const fn recurrence(&self) -> i64 {
        match self {
            Condition::Time { recurrence, .. } | Condition::Event { recurrence, .. } => *recurrence,
        }
    }
}
