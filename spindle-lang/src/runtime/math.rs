//! The `math` library.

use crate::fiber::Fault;
use crate::runtime::native::Library;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::Value;

fn number(value: &Value) -> Result<f64, Fault> {
    value.as_f64().ok_or(Fault::ExpectedNumber)
}

fn extreme(args: &[Value], keep_lhs: impl Fn(f64, f64) -> bool) -> Result<Vec<Value>, Fault> {
    let mut best = &args[0];
    for candidate in &args[1..] {
        if !keep_lhs(number(best)?, number(candidate)?) {
            best = candidate;
        }
    }
    Ok(vec![match best {
        Value::Int(value) => Value::Int(*value),
        other => Value::Real(number(other)?),
    }])
}

/// Floors `value`, rejecting values with no integer counterpart.
#[allow(clippy::cast_possible_truncation, clippy::cast_precision_loss)]
fn floor(value: f64) -> Result<i64, Fault> {
    let floored = value.floor();
    if floored.is_finite() && floored >= i64::MIN as f64 && floored < i64::MAX as f64 {
        Ok(floored as i64)
    } else {
        Err(Fault::UnexpectedArgument)
    }
}

/// Returns the `math` library.
#[must_use]
pub fn library() -> Library {
    Library::new(Symbol::math_symbol())
        .with_fn("abs", "n", "n", |_context, args| {
            Ok(vec![match &args[0] {
                Value::Int(value) => Value::Int(value.wrapping_abs()),
                other => Value::Real(number(other)?.abs()),
            }])
        })
        .with_fn("min", "nn*", "n", |_context, args| extreme(args, |a, b| a <= b))
        .with_fn("max", "nn*", "n", |_context, args| extreme(args, |a, b| a >= b))
        .with_fn("floor", "n", "i", |_context, args| {
            Ok(vec![match &args[0] {
                Value::Int(value) => Value::Int(*value),
                other => Value::Int(floor(number(other)?)?),
            }])
        })
        .with_fn("sqrt", "n", "r", |_context, args| {
            Ok(vec![Value::Real(number(&args[0])?.sqrt())])
        })
}
