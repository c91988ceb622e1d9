//! The `io` library.

use crate::runtime::native::Library;
use crate::runtime::symbol::Symbol;

/// Returns the `io` library.
///
/// `io.print(values...)` writes its arguments, separated by spaces, as one
/// line of the engine's output.
#[must_use]
pub fn library() -> Library {
    Library::new(Symbol::io_symbol()).with_fn("print", "?*", "", |context, args| {
        let mut line = String::new();
        for (index, value) in args.iter().enumerate() {
            if index > 0 {
                line.push(' ');
            }
            line.push_str(&context.pool().display(value));
        }
        context.print(&line);
        Ok(Vec::new())
    })
}
