//! Native functions and the registry they are resolved from.

use std::fmt::{self, Debug};
use std::sync::Arc;

use ahash::AHashMap;
use kempt::Map;

use crate::engine::EngineState;
use crate::fiber::{Fault, FiberId};
use crate::runtime::pool::{Handle, ValuePool};
use crate::runtime::symbol::{Symbol, SymbolList};
use crate::runtime::value::{Value, ValueKind};
use crate::runtime::{io, list, math, pointer, time};

/// The body of a [`NativeFunction`].
pub type NativeBody =
    dyn Fn(&mut NativeContext<'_>, &[Value]) -> Result<Vec<Value>, Fault> + Send + Sync;

/// A function implemented in Rust and callable from bytecode.
#[derive(Clone)]
pub struct NativeFunction {
    name: Symbol,
    args: Signature,
    results: Signature,
    body: Arc<NativeBody>,
}

impl NativeFunction {
    /// Returns a new native function.
    ///
    /// `args` and `results` are [`Signature`] strings.
    ///
    /// # Panics
    ///
    /// Panics if either signature is invalid.
    pub fn new<F>(name: impl Into<Symbol>, args: &str, results: &str, body: F) -> Self
    where
        F: Fn(&mut NativeContext<'_>, &[Value]) -> Result<Vec<Value>, Fault>
            + Send
            + Sync
            + 'static,
    {
        Self {
            name: name.into(),
            args: Signature::new(args),
            results: Signature::new(results),
            body: Arc::new(body),
        }
    }

    /// Returns the name of this function.
    #[must_use]
    pub const fn name(&self) -> &Symbol {
        &self.name
    }

    /// Returns the argument signature.
    #[must_use]
    pub const fn args(&self) -> &Signature {
        &self.args
    }

    /// Returns the result signature.
    #[must_use]
    pub const fn results(&self) -> &Signature {
        &self.results
    }

    /// Checks `args` against this function's signature, invokes it, and
    /// checks the returned values.
    pub fn invoke(
        &self,
        context: &mut NativeContext<'_>,
        args: &[Value],
    ) -> Result<Vec<Value>, Fault> {
        self.args.check(args)?;
        let results = (self.body)(context, args)?;
        if let Err(fault) = self.results.check(&results) {
            error!(function = %self.name, "native function returned unexpected results");
            context.pool_mut().release_values(results);
            return Err(fault);
        }
        Ok(results)
    }
}

impl Debug for NativeFunction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NativeFunction")
            .field("name", &self.name)
            .field("args", &self.args)
            .field("results", &self.results)
            .finish_non_exhaustive()
    }
}

/// The accepted kinds of a list of values.
///
/// Signatures are written as strings of type codes:
///
/// | Code | Accepts |
/// |------|---------|
/// | `i` | int |
/// | `r` | real |
/// | `n` | int or real |
/// | `s` | string |
/// | `a` | array |
/// | `f` | fiber |
/// | `c` | condition |
/// | `?` | anything |
///
/// A trailing `*` allows the preceding code to repeat zero or more times.
#[derive(Debug, Clone, Eq, PartialEq)]
pub struct Signature {
    codes: Vec<TypeCode>,
    variadic: bool,
}

impl Signature {
    /// Parses a signature.
    ///
    /// # Panics
    ///
    /// Panics if `signature` contains an unknown code, or a `*` that is not
    /// the last character or that has no code before it.
    #[must_use]
    pub fn new(signature: &str) -> Self {
        let mut codes = Vec::with_capacity(signature.len());
        let mut variadic = false;
        for (index, ch) in signature.char_indices() {
            if ch == '*' {
                assert!(
                    index + 1 == signature.len() && !codes.is_empty(),
                    "misplaced * in signature {signature:?}"
                );
                variadic = true;
            } else {
                let code = TypeCode::from_char(ch)
                    .unwrap_or_else(|| panic!("invalid type code {ch:?} in {signature:?}"));
                codes.push(code);
            }
        }
        Self { codes, variadic }
    }

    /// Returns true if `count` values satisfy this signature's length.
    #[must_use]
    pub fn accepts_count(&self, count: usize) -> bool {
        if self.variadic {
            count + 1 >= self.codes.len()
        } else {
            count == self.codes.len()
        }
    }

    /// Checks the count and kinds of `values`.
    ///
    /// # Errors
    ///
    /// Returns [`Fault::IncorrectNumberOfArguments`] if the count does not
    /// match, or [`Fault::UnexpectedArgument`] if a value has the wrong kind.
    pub fn check(&self, values: &[Value]) -> Result<(), Fault> {
        if !self.accepts_count(values.len()) {
            return Err(Fault::IncorrectNumberOfArguments);
        }
        for (index, value) in values.iter().enumerate() {
            let code = self
                .codes
                .get(index)
                .or_else(|| self.codes.last())
                .ok_or(Fault::IncorrectNumberOfArguments)?;
            if !code.accepts(value.kind()) {
                return Err(Fault::UnexpectedArgument);
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq)]
enum TypeCode {
    Int,
    Real,
    Number,
    String,
    Array,
    Fiber,
    Condition,
    Any,
}

impl TypeCode {
    fn from_char(ch: char) -> Option<Self> {
        Some(match ch {
            'i' => Self::Int,
            'r' => Self::Real,
            'n' => Self::Number,
            's' => Self::String,
            'a' => Self::Array,
            'f' => Self::Fiber,
            'c' => Self::Condition,
            '?' => Self::Any,
            _ => return None,
        })
    }

    fn accepts(self, kind: ValueKind) -> bool {
        match self {
            TypeCode::Int => kind == ValueKind::Int,
            TypeCode::Real => kind == ValueKind::Real,
            TypeCode::Number => matches!(kind, ValueKind::Int | ValueKind::Real),
            TypeCode::String => kind == ValueKind::String,
            TypeCode::Array => kind == ValueKind::Array,
            TypeCode::Fiber => kind == ValueKind::Fiber,
            TypeCode::Condition => kind == ValueKind::Condition,
            TypeCode::Any => true,
        }
    }
}

/// A named table of native functions.
#[derive(Debug, Clone)]
pub struct Library {
    name: Symbol,
    functions: AHashMap<Symbol, Arc<NativeFunction>>,
}

impl Library {
    /// Returns an empty library.
    #[must_use]
    pub fn new(name: impl Into<Symbol>) -> Self {
        Self {
            name: name.into(),
            functions: AHashMap::new(),
        }
    }

    /// Returns the library's name.
    #[must_use]
    pub const fn name(&self) -> &Symbol {
        &self.name
    }

    /// Adds a function registered under every name in `names`.
    ///
    /// # Panics
    ///
    /// Panics if either signature is invalid.
    #[must_use]
    pub fn with_fn<F>(mut self, names: impl SymbolList, args: &str, results: &str, body: F) -> Self
    where
        F: Fn(&mut NativeContext<'_>, &[Value]) -> Result<Vec<Value>, Fault>
            + Send
            + Sync
            + 'static,
    {
        let body: Arc<NativeBody> = Arc::new(body);
        for name in names.into_symbols() {
            self.insert(NativeFunction {
                name,
                args: Signature::new(args),
                results: Signature::new(results),
                body: body.clone(),
            });
        }
        self
    }

    /// Adds `function`, replacing any function with the same name.
    pub fn insert(&mut self, function: NativeFunction) {
        self.functions
            .insert(function.name.clone(), Arc::new(function));
    }

    /// Returns the function named `name`.
    #[must_use]
    pub fn function(&self, name: &str) -> Option<&Arc<NativeFunction>> {
        self.functions.get(name)
    }

    /// Returns the number of functions in this library.
    #[must_use]
    pub fn len(&self) -> usize {
        self.functions.len()
    }

    /// Returns true if this library has no functions.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.functions.is_empty()
    }
}

/// The native functions available to an engine.
///
/// Each engine owns its own registry, so different engines may load
/// different libraries.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    libraries: AHashMap<Symbol, Library>,
    functions: AHashMap<Symbol, Arc<NativeFunction>>,
    methods: Map<ValueKind, Library>,
}

impl Registry {
    /// Returns an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns a registry containing the built-in libraries: `io`, `time`,
    /// `pointer`, `math`, and the array and string methods.
    #[must_use]
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register_library(io::library());
        registry.register_library(time::library());
        registry.register_library(pointer::library());
        registry.register_library(math::library());
        registry.register_methods(ValueKind::Array, list::array_methods());
        registry.register_methods(ValueKind::String, list::string_methods());
        registry
    }

    /// Adds `library`, replacing any library with the same name.
    pub fn register_library(&mut self, library: Library) {
        self.libraries.insert(library.name.clone(), library);
    }

    /// Adds a top-level function.
    pub fn register_function(&mut self, function: NativeFunction) {
        self.functions
            .insert(function.name.clone(), Arc::new(function));
    }

    /// Adds methods callable on values of `kind`.
    pub fn register_methods(&mut self, kind: ValueKind, methods: Library) {
        self.methods.insert(kind, methods);
    }

    /// Returns the library named `name`.
    #[must_use]
    pub fn library(&self, name: &str) -> Option<&Library> {
        self.libraries.get(name)
    }

    /// Returns the top-level function named `name`.
    #[must_use]
    pub fn function(&self, name: &str) -> Option<&Arc<NativeFunction>> {
        self.functions.get(name)
    }

    /// Returns the method named `name` for values of `kind`.
    #[must_use]
    pub fn method(&self, kind: ValueKind, name: &str) -> Option<&Arc<NativeFunction>> {
        self.methods.get(&kind)?.function(name)
    }
}

/// The access a [`NativeFunction`] has to the engine while it runs.
pub struct NativeContext<'a> {
    state: &'a mut EngineState,
    fiber: FiberId,
    receiver: Option<Handle>,
}

impl<'a> NativeContext<'a> {
    pub(crate) fn new(state: &'a mut EngineState, fiber: FiberId, receiver: Option<Handle>) -> Self {
        Self {
            state,
            fiber,
            receiver,
        }
    }

    /// Returns the fiber making the call.
    #[must_use]
    pub const fn fiber(&self) -> FiberId {
        self.fiber
    }

    /// Returns the engine's current time, in seconds.
    #[must_use]
    pub fn now(&self) -> f64 {
        self.state.now()
    }

    /// Returns the handle of the value the function was called on.
    #[must_use]
    pub const fn receiver(&self) -> Option<Handle> {
        self.receiver
    }

    /// Returns the value the function was called on.
    ///
    /// # Errors
    ///
    /// Returns [`Fault::NotAFunction`] if the function was not called as a
    /// method.
    pub fn receiver_value(&self) -> Result<&Value, Fault> {
        let receiver = self.receiver.ok_or(Fault::NotAFunction)?;
        self.state.pool().get(receiver)
    }

    /// Returns the value pool.
    #[must_use]
    pub fn pool(&self) -> &ValuePool {
        self.state.pool()
    }

    /// Returns exclusive access to the value pool.
    pub fn pool_mut(&mut self) -> &mut ValuePool {
        self.state.pool_mut()
    }

    /// Writes `line` to the engine's output.
    pub fn print(&mut self, line: &str) {
        self.state.output().print(line);
    }

    /// Returns the engine state.
    pub fn state(&mut self) -> &mut EngineState {
        self.state
    }
}
