//! The reference-counted arena that backs every variable, stack entry, and
//! call argument.
//!
//! Each slot carries a strong and a weak count. The slot's value is dropped
//! when the strong count reaches zero, while the slot itself is only freed
//! once both counts are zero. Slots are stored in a generational arena, so a
//! [`Handle`] to a freed slot can never observe a value placed into a
//! recycled index.

use std::fmt::Write;

use alot::{LotId, Lots};
use kempt::Map;

use crate::fiber::{Fault, FiberId};
use crate::runtime::symbol::Symbol;
use crate::runtime::value::Value;

/// A reference to a [`ValuePool`] slot.
///
/// Handles are plain identifiers: whether a handle represents a strong
/// reference is decided by the code holding it.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct Handle(LotId);

/// A non-owning reference to a [`ValuePool`] slot.
///
/// Created by [`ValuePool::downgrade`] and released with
/// [`ValuePool::release_weak`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct WeakHandle(Handle);

impl WeakHandle {
    /// Returns the underlying handle without upgrading it.
    #[must_use]
    pub const fn handle(self) -> Handle {
        self.0
    }
}

/// The owner of a named variable.
#[derive(Debug, Clone, Eq, PartialEq, Ord, PartialOrd)]
pub enum OwnerKey {
    /// Engine-wide globals.
    Global,
    /// Shared variables of the named machine type.
    Machine(Symbol),
    /// Instance variables of one fiber.
    Fiber(FiberId),
    /// Unnamed values, such as operand stack entries.
    Temporary,
}

/// A key used to look up a named variable.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum VarKey<'a> {
    /// The variable's declaration index.
    Index(usize),
    /// The variable's name.
    Name(&'a str),
}

impl<'a> VarKey<'a> {
    /// Returns the key described by `value`: an integer is an index and a
    /// string is a name.
    pub fn from_value(value: &'a Value) -> Result<Self, Fault> {
        match value {
            Value::String(name) => Ok(VarKey::Name(name)),
            other => other
                .as_usize()
                .map(VarKey::Index)
                .ok_or(Fault::UnknownVariable),
        }
    }
}

#[derive(Debug)]
struct Slot {
    value: Option<Value>,
    owner: OwnerKey,
    strong: usize,
    weak: usize,
}

/// The arena holding every runtime [`Value`].
pub struct ValuePool {
    slots: Lots<Slot>,
    capacity: Option<usize>,
    directory: Map<OwnerKey, Vec<(Symbol, Handle)>>,
    orphaned: Vec<FiberId>,
}

impl ValuePool {
    /// Returns a growable pool.
    #[must_use]
    pub fn new() -> Self {
        Self {
            slots: Lots::new(),
            capacity: None,
            directory: Map::new(),
            orphaned: Vec::new(),
        }
    }

    /// Returns a pool that refuses to allocate more than `capacity` slots.
    #[must_use]
    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            capacity: Some(capacity),
            ..Self::new()
        }
    }

    /// Returns the number of occupied slots, including slots whose value has
    /// been dropped but that still have weak holders.
    #[must_use]
    pub fn len(&self) -> usize {
        self.slots.len()
    }

    /// Returns true if no slots are occupied.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Allocates a slot holding `value` with a strong count of one.
    ///
    /// # Errors
    ///
    /// Returns [`Fault::PoolExhausted`] if the pool is at capacity. `value` is
    /// released in that case.
    pub fn alloc(&mut self, owner: OwnerKey, value: Value) -> Result<Handle, Fault> {
        if self
            .capacity
            .map_or(false, |capacity| self.slots.len() >= capacity)
        {
            self.release_value(value);
            return Err(Fault::PoolExhausted);
        }
        Ok(Handle(self.slots.push(Slot {
            value: Some(value),
            owner,
            strong: 1,
            weak: 0,
        })))
    }

    /// Allocates a temporary slot holding `value`.
    pub fn alloc_temporary(&mut self, value: Value) -> Result<Handle, Fault> {
        self.alloc(OwnerKey::Temporary, value)
    }

    /// Adds a strong reference to `handle`.
    pub fn add_strong(&mut self, handle: Handle) -> Result<(), Fault> {
        match self.slots.get_mut(handle.0) {
            Some(slot) if slot.value.is_some() => {
                slot.strong += 1;
                Ok(())
            }
            _ => Err(Fault::ValueFreed),
        }
    }

    /// Adds a weak reference to `handle`.
    pub fn add_weak(&mut self, handle: Handle) -> Result<(), Fault> {
        let slot = self.slots.get_mut(handle.0).ok_or(Fault::ValueFreed)?;
        slot.weak += 1;
        Ok(())
    }

    /// Returns a new weak reference to `handle`.
    pub fn downgrade(&mut self, handle: Handle) -> Result<WeakHandle, Fault> {
        self.add_weak(handle)?;
        Ok(WeakHandle(handle))
    }

    /// Returns a new strong reference to the slot referenced by `weak` if its
    /// value has not been dropped.
    pub fn upgrade(&mut self, weak: WeakHandle) -> Option<Handle> {
        self.add_strong(weak.0).ok().map(|()| weak.0)
    }

    /// Releases a strong reference to `handle`.
    ///
    /// When the strong count reaches zero the value is dropped, releasing any
    /// handles it contains. The slot is freed once no weak references remain.
    pub fn release_strong(&mut self, handle: Handle) -> Result<(), Fault> {
        let dropped = self.decrement_strong(handle)?;
        if let Some(value) = dropped {
            self.release_value(value);
        }
        Ok(())
    }

    /// Releases a weak reference to `handle`.
    pub fn release_weak(&mut self, handle: Handle) -> Result<(), Fault> {
        let slot = self.slots.get_mut(handle.0).ok_or(Fault::ValueFreed)?;
        if slot.weak == 0 {
            return Err(Fault::ValueFreed);
        }
        slot.weak -= 1;
        if slot.weak == 0 && slot.strong == 0 {
            self.slots.remove(handle.0);
        }
        Ok(())
    }

    fn decrement_strong(&mut self, handle: Handle) -> Result<Option<Value>, Fault> {
        let slot = self.slots.get_mut(handle.0).ok_or(Fault::ValueFreed)?;
        if slot.strong == 0 {
            return Err(Fault::ValueFreed);
        }
        slot.strong -= 1;
        if slot.strong > 0 {
            return Ok(None);
        }
        let value = slot.value.take();
        if slot.weak == 0 {
            self.slots.remove(handle.0);
        }
        Ok(value)
    }

    /// Releases every handle contained in `value`.
    ///
    /// Nested values are released iteratively, so deeply nested arrays cannot
    /// overflow the native stack.
    pub fn release_value(&mut self, value: Value) {
        let mut pending = vec![value];
        while let Some(value) = pending.pop() {
            match value {
                Value::Array(handles) => {
                    for handle in handles {
                        self.release_nested(handle, &mut pending);
                    }
                }
                Value::Fiber(handle) => self.release_nested(handle, &mut pending),
                Value::Instance(fiber) => {
                    trace!(?fiber, "fiber orphaned");
                    self.orphaned.push(fiber);
                }
                _ => {}
            }
        }
    }

    /// Releases every value in `values`.
    pub fn release_values(&mut self, values: impl IntoIterator<Item = Value>) {
        for value in values {
            self.release_value(value);
        }
    }

    fn release_nested(&mut self, handle: Handle, pending: &mut Vec<Value>) {
        match self.decrement_strong(handle) {
            Ok(Some(value)) => pending.push(value),
            Ok(None) => {}
            Err(_) => {
                warn!(?handle, "nested handle already released");
            }
        }
    }

    /// Returns a copy of `value`, retaining every handle it contains.
    pub fn retain_value(&mut self, value: &Value) -> Result<Value, Fault> {
        let copy = shallow_copy(value)?;
        self.retain_nested(&copy)?;
        Ok(copy)
    }

    /// Returns a copy of the value stored in `handle`.
    ///
    /// Copying a fiber's canonical slot yields a [`Value::Fiber`] referencing
    /// that slot.
    pub fn copy_of(&mut self, handle: Handle) -> Result<Value, Fault> {
        let copy = match self.get(handle)? {
            Value::Instance(_) => Value::Fiber(handle),
            other => shallow_copy(other)?,
        };
        self.retain_nested(&copy)?;
        Ok(copy)
    }

    fn retain_nested(&mut self, value: &Value) -> Result<(), Fault> {
        let handles = match value {
            Value::Array(handles) => handles.as_slice(),
            Value::Fiber(handle) => std::slice::from_ref(handle),
            _ => return Ok(()),
        };
        for (index, handle) in handles.iter().enumerate() {
            if let Err(err) = self.add_strong(*handle) {
                for retained in &handles[..index] {
                    let _ = self.release_strong(*retained);
                }
                return Err(err);
            }
        }
        Ok(())
    }

    /// Returns the value stored in `handle`.
    ///
    /// # Errors
    ///
    /// Returns [`Fault::ValueFreed`] if the slot's value has been dropped or
    /// the slot was recycled.
    pub fn get(&self, handle: Handle) -> Result<&Value, Fault> {
        self.slots
            .get(handle.0)
            .and_then(|slot| slot.value.as_ref())
            .ok_or(Fault::ValueFreed)
    }

    /// Returns exclusive access to the value stored in `handle`.
    pub fn get_mut(&mut self, handle: Handle) -> Result<&mut Value, Fault> {
        self.slots
            .get_mut(handle.0)
            .and_then(|slot| slot.value.as_mut())
            .ok_or(Fault::ValueFreed)
    }

    /// Returns the value a weak handle refers to, if it has not been dropped.
    #[must_use]
    pub fn get_weak(&self, weak: WeakHandle) -> Option<&Value> {
        self.get(weak.0).ok()
    }

    /// Replaces the value stored in `handle`, releasing the previous value.
    pub fn set(&mut self, handle: Handle, value: Value) -> Result<(), Fault> {
        match self.get_mut(handle) {
            Ok(slot) => {
                let previous = std::mem::replace(slot, value);
                self.release_value(previous);
                Ok(())
            }
            Err(err) => {
                self.release_value(value);
                Err(err)
            }
        }
    }

    /// Returns the owner recorded when `handle` was allocated.
    #[must_use]
    pub fn owner(&self, handle: Handle) -> Option<&OwnerKey> {
        self.slots.get(handle.0).map(|slot| &slot.owner)
    }

    /// Returns the `(strong, weak)` counts of `handle`, or `None` if its slot
    /// has been freed.
    #[must_use]
    pub fn counts(&self, handle: Handle) -> Option<(usize, usize)> {
        self.slots
            .get(handle.0)
            .map(|slot| (slot.strong, slot.weak))
    }

    /// Allocates a named variable owned by `owner`.
    ///
    /// The directory holds the variable's strong reference until
    /// [`release_owner`](Self::release_owner) is called. Variables are
    /// indexed in declaration order.
    pub fn declare(
        &mut self,
        owner: OwnerKey,
        name: impl Into<Symbol>,
        value: Value,
    ) -> Result<Handle, Fault> {
        let handle = self.alloc(owner.clone(), value)?;
        self.directory
            .entry(owner)
            .or_default()
            .push((name.into(), handle));
        Ok(handle)
    }

    /// Looks up a variable declared by `owner`.
    ///
    /// The returned handle is borrowed from the directory. Callers that keep
    /// it must add their own reference.
    #[must_use]
    pub fn lookup(&self, owner: &OwnerKey, key: VarKey<'_>) -> Option<Handle> {
        let variables = self.directory.get(owner)?;
        match key {
            VarKey::Index(index) => variables.get(index).map(|(_, handle)| *handle),
            VarKey::Name(name) => variables
                .iter()
                .find(|(variable, _)| variable == name)
                .map(|(_, handle)| *handle),
        }
    }

    /// Returns the names of the variables declared by `owner`, in declaration
    /// order.
    pub fn variables(&self, owner: &OwnerKey) -> impl Iterator<Item = &Symbol> + '_ {
        self.directory
            .get(owner)
            .into_iter()
            .flat_map(|variables| variables.iter().map(|(name, _)| name))
    }

    /// Releases every variable declared by `owner`.
    pub fn release_owner(&mut self, owner: &OwnerKey) {
        let Some(field) = self.directory.remove(owner) else {
            return;
        };
        let (_, variables) = field.into_parts();
        for (name, handle) in variables {
            if self.release_strong(handle).is_err() {
                warn!(%name, "variable released twice");
            }
        }
    }

    /// Returns the fibers whose canonical slot was dropped since the last
    /// call.
    pub fn take_orphaned_fibers(&mut self) -> Vec<FiberId> {
        std::mem::take(&mut self.orphaned)
    }

    /// Formats `value` for display, following array elements through the
    /// pool.
    #[must_use]
    pub fn display(&self, value: &Value) -> String {
        let mut out = String::new();
        self.write_value(value, &mut out, 0);
        out
    }

    fn write_value(&self, value: &Value, out: &mut String, depth: usize) {
        match value {
            Value::Nil => out.push_str("nil"),
            Value::Int(value) => {
                let _ = write!(out, "{value}");
            }
            Value::Real(value) => {
                let _ = write!(out, "{value}");
            }
            Value::String(value) => out.push_str(value),
            Value::Array(handles) => {
                out.push('[');
                for (index, handle) in handles.iter().enumerate() {
                    if index > 0 {
                        out.push_str(", ");
                    }
                    match self.get(*handle) {
                        Ok(_) if depth > 16 => out.push_str("..."),
                        Ok(element) => self.write_value(element, out, depth + 1),
                        Err(_) => out.push_str("<freed>"),
                    }
                }
                out.push(']');
            }
            Value::Fiber(_) | Value::Instance(_) => out.push_str("<fiber>"),
            Value::Library(name) => {
                let _ = write!(out, "<library {name}>");
            }
            Value::Condition(_) => out.push_str("<condition>"),
        }
    }
}

/// Copies `value` without touching any reference counts.
fn shallow_copy(value: &Value) -> Result<Value, Fault> {
    Ok(match value {
        Value::Nil => Value::Nil,
        Value::Int(value) => Value::Int(*value),
        Value::Real(value) => Value::Real(*value),
        Value::String(value) => Value::String(value.clone()),
        Value::Array(handles) => Value::Array(handles.clone()),
        Value::Fiber(handle) => Value::Fiber(*handle),
        // The canonical slot payload is never duplicated; copies refer to the
        // slot instead.
        Value::Instance(_) => return Err(Fault::ExpectedFiber),
        Value::Library(name) => Value::Library(name.clone()),
        Value::Condition(condition) => Value::Condition(condition.clone()),
    })
}

impl Default for ValuePool {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ValuePool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ValuePool")
            .field("slots", &self.slots.len())
            .field("capacity", &self.capacity)
            .field("directory", &self.directory)
            .field("orphaned", &self.orphaned)
            .finish()
    }
}

#[cfg(test)]
mod tests;
