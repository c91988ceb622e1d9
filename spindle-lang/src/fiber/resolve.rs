//! Name resolution for call sites.
//!
//! A dotted name such as `counter.count` is resolved one segment at a time.
//! Each segment is searched for in order:
//!
//! 1. `main`, the first fiber launched by the host (first segment only).
//! 2. The shared variables of the calling fiber's machine (first segment
//!    only).
//! 3. The instance variables of the receiver fiber.
//! 4. Functions bound to the receiver: a library's functions, or the methods
//!    of an array or string.
//! 5. Globals.
//! 6. Libraries and top-level functions in the engine's registry.
//!
//! The receiver of the first segment is the calling fiber. The receiver of
//! each later segment is whatever the previous segment resolved to.

use std::sync::Arc;

use crate::engine::EngineState;
use crate::fiber::{Fault, FiberId};
use crate::runtime::native::NativeFunction;
use crate::runtime::pool::{Handle, OwnerKey, ValuePool, VarKey, WeakHandle};
use crate::runtime::symbol::Symbol;
use crate::runtime::value::Value;

/// The result of resolving a name.
///
/// Handles held by a `Resolved` are strong references owned by it.
#[derive(Debug)]
pub(crate) enum Resolved {
    Value(Handle),
    Function {
        function: Arc<NativeFunction>,
        receiver: Option<Handle>,
    },
    Library(Symbol),
}

impl Resolved {
    pub(crate) fn release(self, pool: &mut ValuePool) {
        match self {
            Resolved::Value(handle)
            | Resolved::Function {
                receiver: Some(handle),
                ..
            } => {
                let _ = pool.release_strong(handle);
            }
            Resolved::Function { receiver: None, .. } | Resolved::Library(_) => {}
        }
    }
}

/// A memoized resolution. Values are held weakly so that the cache never
/// keeps a dropped variable alive.
#[derive(Debug)]
pub(crate) enum CachedTarget {
    Value(WeakHandle),
    Function {
        function: Arc<NativeFunction>,
        receiver: Option<WeakHandle>,
    },
    Library(Symbol),
}

impl CachedTarget {
    pub(crate) fn downgrade(resolved: &Resolved, pool: &mut ValuePool) -> Result<Self, Fault> {
        Ok(match resolved {
            Resolved::Value(handle) => CachedTarget::Value(pool.downgrade(*handle)?),
            Resolved::Function { function, receiver } => CachedTarget::Function {
                function: function.clone(),
                receiver: receiver.map(|receiver| pool.downgrade(receiver)).transpose()?,
            },
            Resolved::Library(name) => CachedTarget::Library(name.clone()),
        })
    }

    /// Returns the cached resolution with new strong references, or `None` if
    /// a referenced value has been dropped.
    pub(crate) fn upgrade(&self, pool: &mut ValuePool) -> Option<Resolved> {
        Some(match self {
            CachedTarget::Value(weak) => Resolved::Value(pool.upgrade(*weak)?),
            CachedTarget::Function { function, receiver } => Resolved::Function {
                function: function.clone(),
                receiver: match receiver {
                    Some(weak) => Some(pool.upgrade(*weak)?),
                    None => None,
                },
            },
            CachedTarget::Library(name) => Resolved::Library(name.clone()),
        })
    }

    pub(crate) fn release(self, pool: &mut ValuePool) {
        match self {
            CachedTarget::Value(weak)
            | CachedTarget::Function {
                receiver: Some(weak),
                ..
            } => {
                let _ = pool.release_weak(weak.handle());
            }
            CachedTarget::Function { receiver: None, .. } | CachedTarget::Library(_) => {}
        }
    }
}

enum Receiver {
    Fiber(FiberId),
    Slot(Handle),
    Library(Symbol),
}

/// Resolves `name` on behalf of `fiber`.
///
/// When `receiver` is provided, it is a strong reference that this function
/// takes ownership of, and the first segment is searched on it instead of on
/// the calling fiber.
pub(crate) fn resolve(
    state: &mut EngineState,
    fiber: FiberId,
    name: &Symbol,
    receiver: Option<Handle>,
) -> Result<Resolved, Fault> {
    state.resolution_searches += 1;
    trace!(%name, "resolving");

    let mut current = receiver.map(Resolved::Value);
    let explicit_receiver = current.is_some();
    for segment in name.segments() {
        let first = current.is_none() && !explicit_receiver;
        let receiver = match current.take() {
            None => Receiver::Fiber(fiber),
            Some(resolved) => receiver_of(&mut state.pool, resolved)
                .ok_or_else(|| Fault::UnknownIdentifier(name.clone()))?,
        };
        let found = search(state, fiber, &receiver, segment, first);
        if let Receiver::Slot(handle) = receiver {
            let _ = state.pool.release_strong(handle);
        }
        current = Some(found?.ok_or_else(|| Fault::UnknownIdentifier(name.clone()))?);
    }
    current.ok_or_else(|| Fault::UnknownIdentifier(name.clone()))
}

/// Converts the result of one segment into the receiver of the next.
fn receiver_of(pool: &mut ValuePool, resolved: Resolved) -> Option<Receiver> {
    match resolved {
        Resolved::Value(handle) => {
            let receiver = match pool.get(handle) {
                Ok(Value::Instance(id)) => Some(Receiver::Fiber(*id)),
                Ok(Value::Fiber(canonical)) => match pool.get(*canonical) {
                    Ok(Value::Instance(id)) => Some(Receiver::Fiber(*id)),
                    _ => None,
                },
                Ok(Value::Library(library)) => Some(Receiver::Library(library.clone())),
                Ok(_) => return Some(Receiver::Slot(handle)),
                Err(_) => None,
            };
            let _ = pool.release_strong(handle);
            receiver
        }
        Resolved::Library(library) => Some(Receiver::Library(library)),
        function @ Resolved::Function { .. } => {
            function.release(pool);
            None
        }
    }
}

fn retained(pool: &mut ValuePool, handle: Handle) -> Result<Resolved, Fault> {
    pool.add_strong(handle)?;
    Ok(Resolved::Value(handle))
}

fn search(
    state: &mut EngineState,
    fiber: FiberId,
    receiver: &Receiver,
    segment: &str,
    first: bool,
) -> Result<Option<Resolved>, Fault> {
    if first {
        if Symbol::main_symbol() == segment {
            if let Some(canonical) = state
                .main
                .and_then(|main| state.fibers.get(main.0))
                .and_then(|main| main.canonical)
            {
                return retained(&mut state.pool, canonical).map(Some);
            }
        }

        let machine = state
            .fibers
            .get(fiber.0)
            .ok_or(Fault::FiberDestroyed)?
            .machine
            .clone();
        if let Some(shared) = state
            .pool
            .lookup(&OwnerKey::Machine(machine), VarKey::Name(segment))
        {
            return retained(&mut state.pool, shared).map(Some);
        }
    }

    match receiver {
        Receiver::Fiber(id) => {
            if let Some(variable) = state
                .pool
                .lookup(&OwnerKey::Fiber(*id), VarKey::Name(segment))
            {
                return retained(&mut state.pool, variable).map(Some);
            }
        }
        Receiver::Library(library) => {
            if let Some(function) = state
                .registry
                .library(library)
                .and_then(|library| library.function(segment))
            {
                return Ok(Some(Resolved::Function {
                    function: function.clone(),
                    receiver: None,
                }));
            }
        }
        Receiver::Slot(handle) => {
            let kind = state.pool.get(*handle)?.kind();
            if let Some(method) = state.registry.method(kind, segment) {
                let function = method.clone();
                state.pool.add_strong(*handle)?;
                return Ok(Some(Resolved::Function {
                    function,
                    receiver: Some(*handle),
                }));
            }
        }
    }

    if let Some(global) = state.pool.lookup(&OwnerKey::Global, VarKey::Name(segment)) {
        return retained(&mut state.pool, global).map(Some);
    }

    if state.registry.library(segment).is_some() {
        return Ok(Some(Resolved::Library(Symbol::from(segment))));
    }
    Ok(state
        .registry
        .function(segment)
        .map(|function| Resolved::Function {
            function: function.clone(),
            receiver: None,
        }))
}
