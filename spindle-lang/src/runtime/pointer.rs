//! The `pointer` library, which produces conditions matched against events
//! posted to the `pointer` continuation list.

use crate::fiber::Fault;
use crate::runtime::native::Library;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::{Condition, Value};

fn event(discriminator: &Symbol, recurrence: i64) -> Vec<Value> {
    vec![Value::Condition(
        Condition::event(Symbol::pointer_symbol(), discriminator).with_recurrence(recurrence),
    )]
}

/// Returns the `pointer` library.
///
/// `pointer.down()`, `pointer.up()`, `pointer.move()` and `pointer.drag()`
/// fire once on the next matching event. `pointer.every(name)` fires on
/// every event named `name` until cancelled.
#[must_use]
pub fn library() -> Library {
    let mut library = Library::new(Symbol::pointer_symbol());
    for discriminator in [
        Symbol::down_symbol(),
        Symbol::up_symbol(),
        Symbol::move_symbol(),
        Symbol::drag_symbol(),
    ] {
        library = library.with_fn(discriminator, "", "c", move |_context, _args| {
            Ok(event(discriminator, 0))
        });
    }
    library.with_fn("every", "s", "c", |_context, args| {
        let discriminator = args[0].as_symbol().ok_or(Fault::ExpectedString)?;
        Ok(event(discriminator, -1))
    })
}
