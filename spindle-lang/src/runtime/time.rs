//! The `time` library, which produces time-keyed wake conditions.

use crate::fiber::Fault;
use crate::runtime::native::Library;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::{Condition, Value};

fn seconds(value: &Value) -> Result<f64, Fault> {
    let seconds = value.as_f64().ok_or(Fault::ExpectedNumber)?;
    if seconds.is_finite() && seconds >= 0. {
        Ok(seconds)
    } else {
        Err(Fault::UnexpectedArgument)
    }
}

/// Returns the `time` library.
///
/// - `time.after(seconds)` fires once.
/// - `time.every(seconds)` fires repeatedly until cancelled.
/// - `time.recur(seconds, repeats)` fires `repeats + 1` times.
/// - `time.now()` returns the engine's clock.
#[must_use]
pub fn library() -> Library {
    Library::new(Symbol::time_symbol())
        .with_fn("after", "n", "c", |_context, args| {
            Ok(vec![Value::Condition(Condition::after(seconds(&args[0])?))])
        })
        .with_fn("every", "n", "c", |_context, args| {
            let interval = seconds(&args[0])?;
            if interval <= 0. {
                return Err(Fault::UnexpectedArgument);
            }
            Ok(vec![Value::Condition(Condition::every(interval))])
        })
        .with_fn("recur", "ni", "c", |_context, args| {
            let interval = seconds(&args[0])?;
            let repeats = args[1].as_i64().ok_or(Fault::ExpectedInteger)?;
            if repeats < -1 {
                return Err(Fault::UnexpectedArgument);
            }
            Ok(vec![Value::Condition(Condition::recur(interval, repeats))])
        })
        .with_fn("now", "", "r", |context, _args| {
            Ok(vec![Value::Real(context.now())])
        })
}
