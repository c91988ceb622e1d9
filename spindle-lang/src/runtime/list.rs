//! Methods callable on arrays and strings.
//!
//! These are resolved when a call's receiver is an array or string value,
//! e.g. `items.len()` or `items.push(4)`.

use crate::fiber::Fault;
use crate::runtime::native::{Library, NativeContext};
use crate::runtime::pool::Handle;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::Value;

fn receiver_elements<'a>(context: &'a NativeContext<'_>) -> Result<&'a [Handle], Fault> {
    match context.receiver_value()? {
        Value::Array(elements) => Ok(elements),
        _ => Err(Fault::ExpectedArray),
    }
}

fn count(len: usize) -> Result<Value, Fault> {
    i64::try_from(len)
        .map(Value::Int)
        .map_err(|_| Fault::OutOfBounds)
}

/// Returns the methods of array values: `len()`, `get(index)` and
/// `push(value)`.
#[must_use]
pub fn array_methods() -> Library {
    Library::new("array")
        .with_fn(Symbol::len_symbol(), "", "i", |context, _args| {
            Ok(vec![count(receiver_elements(context)?.len())?])
        })
        .with_fn(
            [Symbol::get_symbol(), &Symbol::from("nth")],
            "i",
            "?",
            |context, args| {
                let index = args[0].as_usize().ok_or(Fault::OutOfBounds)?;
                let element = *receiver_elements(context)?
                    .get(index)
                    .ok_or(Fault::OutOfBounds)?;
                Ok(vec![context.pool_mut().copy_of(element)?])
            },
        )
        .with_fn(Symbol::push_symbol(), "?", "", |context, args| {
            let receiver = context.receiver().ok_or(Fault::NotAFunction)?;
            if !matches!(context.pool().get(receiver)?, Value::Array(_)) {
                return Err(Fault::ExpectedArray);
            }
            let pool = context.pool_mut();
            let value = pool.retain_value(&args[0])?;
            let element = pool.alloc_temporary(value)?;
            match pool.get_mut(receiver) {
                Ok(Value::Array(elements)) => {
                    elements.push(element);
                    Ok(Vec::new())
                }
                _ => {
                    pool.release_strong(element)?;
                    Err(Fault::ExpectedArray)
                }
            }
        })
}

/// Returns the methods of string values: `len()`.
#[must_use]
pub fn string_methods() -> Library {
    Library::new("string").with_fn(Symbol::len_symbol(), "", "i", |context, _args| {
        match context.receiver_value()? {
            Value::String(value) => Ok(vec![count(value.chars().count())?]),
            _ => Err(Fault::ExpectedString),
        }
    })
}
