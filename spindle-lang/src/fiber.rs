//! Fibers, the running instances of machines, and the bytecode interpreter
//! that executes them.

use std::fmt::{self, Display};
use std::sync::Arc;

use ahash::AHashMap;
use alot::LotId;

use crate::engine::EngineState;
use crate::exemplar::opcode::{split, Opcode};
use crate::exemplar::Exemplar;
use crate::fiber::resolve::{CachedTarget, Resolved};
use crate::runtime::native::NativeContext;
use crate::runtime::pool::{Handle, OwnerKey, VarKey};
use crate::runtime::symbol::Symbol;
use crate::runtime::value::{Condition, Value};
use crate::scheduler::{ContinuationId, SchedulerError};
use crate::ErrorKind;

pub(crate) mod resolve;

/// The identifier of a [`Fiber`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct FiberId(pub(crate) LotId);

/// One running instance of a machine.
#[derive(Debug)]
pub struct Fiber {
    pub(crate) machine: Symbol,
    pub(crate) exemplar: Arc<Exemplar>,
    pub(crate) canonical: Option<Handle>,
    pub(crate) state: usize,
    pub(crate) stack: Vec<Option<Handle>>,
    pub(crate) receivers: Vec<Handle>,
    pub(crate) arguments: Vec<Handle>,
    pub(crate) cache: AHashMap<u32, CachedTarget>,
    pub(crate) suspended_pc: Option<usize>,
}

impl Fiber {
    pub(crate) fn new(machine: Symbol, exemplar: Arc<Exemplar>) -> Self {
        Self {
            machine,
            exemplar,
            canonical: None,
            state: 0,
            stack: Vec::new(),
            receivers: Vec::new(),
            arguments: Vec::new(),
            cache: AHashMap::new(),
            suspended_pc: None,
        }
    }

    /// Returns the name of this fiber's machine type.
    #[must_use]
    pub const fn machine(&self) -> &Symbol {
        &self.machine
    }

    /// Returns the exemplar this fiber executes.
    #[must_use]
    pub fn exemplar(&self) -> &Exemplar {
        &self.exemplar
    }

    /// Returns the index of the state this fiber most recently entered.
    #[must_use]
    pub const fn state(&self) -> usize {
        self.state
    }

    /// Returns the number of entries on the operand stack, including
    /// argument list markers.
    #[must_use]
    pub fn stack_depth(&self) -> usize {
        self.stack.len()
    }

    /// Returns the address a host [`resume`](crate::engine::Engine::resume)
    /// continues from, if this fiber stopped at a suspend instruction.
    #[must_use]
    pub const fn suspended_pc(&self) -> Option<usize> {
        self.suspended_pc
    }

    /// Returns the number of call sites whose resolution is cached.
    #[must_use]
    pub fn cached_resolutions(&self) -> usize {
        self.cache.len()
    }

    pub(crate) fn canonical(&self) -> Result<Handle, Fault> {
        self.canonical.ok_or(Fault::FiberDestroyed)
    }
}

/// The elements a `ForEach` loop iterates over.
enum Generator {
    /// Retained elements of an array.
    Elements(std::vec::IntoIter<Handle>),
    /// The integers `0..n`.
    Count(std::ops::Range<i64>),
}

/// How a call to [`Interpreter::run`] ended.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum RunEnd {
    /// The end of a state was reached.
    StateEnd,
    /// The end of a nested body was reached.
    SubStateEnd,
    /// The fiber suspended.
    Suspended,
}

#[derive(Clone, Copy, Debug)]
struct Budget(usize);

impl Budget {
    const DISABLED: usize = usize::MAX;

    fn new(steps: Option<usize>) -> Self {
        Self(steps.map_or(Self::DISABLED, |steps| steps.min(Self::DISABLED - 1)))
    }

    fn charge(&mut self) -> Result<(), Fault> {
        if self.0 != Self::DISABLED {
            self.0 = self.0.checked_sub(1).ok_or(Fault::NoBudget)?;
        }
        Ok(())
    }
}

/// Executes one fiber's bytecode.
pub(crate) struct Interpreter<'a> {
    state: &'a mut EngineState,
    fiber: FiberId,
    machine: Symbol,
    exemplar: Arc<Exemplar>,
    canonical: Handle,
    continuation: Option<ContinuationId>,
    frame: Vec<Handle>,
    depth: usize,
    loops: usize,
    unwinding_to: Option<usize>,
    budget: Budget,
    pc: usize,
}

impl<'a> Interpreter<'a> {
    /// Prepares to run `fiber`, with the fiber's launch arguments as the
    /// local frame.
    pub(crate) fn new(
        state: &'a mut EngineState,
        fiber: FiberId,
        continuation: Option<ContinuationId>,
        depth: usize,
    ) -> Result<Self, Fault> {
        let running = state.fibers.get(fiber.0).ok_or(Fault::FiberDestroyed)?;
        let machine = running.machine.clone();
        let exemplar = running.exemplar.clone();
        let canonical = running.canonical()?;
        let frame = running.arguments.clone();
        // The interpreter keeps the fiber alive even if a goto releases every
        // continuation that referenced it.
        state.pool.add_strong(canonical)?;
        for (index, handle) in frame.iter().enumerate() {
            if let Err(fault) = state.pool.add_strong(*handle) {
                for retained in &frame[..index] {
                    let _ = state.pool.release_strong(*retained);
                }
                let _ = state.pool.release_strong(canonical);
                return Err(fault);
            }
        }
        let budget = Budget::new(state.config.step_budget);
        Ok(Self {
            state,
            fiber,
            machine,
            exemplar,
            canonical,
            continuation,
            frame,
            depth,
            loops: 0,
            unwinding_to: None,
            budget,
            pc: 0,
        })
    }

    /// Returns the address of the instruction executed most recently.
    pub(crate) const fn pc(&self) -> usize {
        self.pc
    }

    /// Releases the references held for the duration of the run.
    pub(crate) fn finish(self) {
        let pool = &mut self.state.pool;
        for handle in self.frame {
            let _ = pool.release_strong(handle);
        }
        let _ = pool.release_strong(self.canonical);
    }

    fn fiber_mut(&mut self) -> Result<&mut Fiber, Fault> {
        self.state
            .fibers
            .get_mut(self.fiber.0)
            .ok_or(Fault::FiberDestroyed)
    }

    fn operand(&self, pc: usize) -> Result<u64, Fault> {
        self.exemplar
            .bytecode()
            .get(pc + 1)
            .copied()
            .ok_or(Fault::InvalidInstructionAddress)
    }

    fn address(&self, pc: usize) -> Result<usize, Fault> {
        usize::try_from(self.operand(pc)?).map_err(|_| Fault::InvalidInstructionAddress)
    }

    fn string(&self, inline: u64) -> Result<Symbol, Fault> {
        u32::try_from(inline)
            .ok()
            .and_then(|index| self.exemplar.string(index))
            .map(Symbol::from)
            .ok_or(Fault::OutOfBounds)
    }

    fn push(&mut self, handle: Handle) -> Result<(), Fault> {
        self.fiber_mut()?.stack.push(Some(handle));
        Ok(())
    }

    fn push_value(&mut self, value: Value) -> Result<(), Fault> {
        let handle = self.state.pool.alloc_temporary(value)?;
        if let Err(fault) = self.push(handle) {
            let _ = self.state.pool.release_strong(handle);
            return Err(fault);
        }
        Ok(())
    }

    fn pop(&mut self) -> Result<Handle, Fault> {
        let stack = &mut self.fiber_mut()?.stack;
        match stack.pop() {
            Some(Some(handle)) => Ok(handle),
            Some(None) => {
                stack.push(None);
                Err(Fault::StackUnderflow)
            }
            None => Err(Fault::StackUnderflow),
        }
    }

    fn release(&mut self, handle: Handle) {
        if self.state.pool.release_strong(handle).is_err() {
            warn!(?handle, "stack entry released twice");
        }
    }

    fn release_all(&mut self, handles: impl IntoIterator<Item = Handle>) {
        for handle in handles {
            self.release(handle);
        }
    }

    /// Pops the top of the stack and returns a copy of its value.
    fn pop_value(&mut self) -> Result<Value, Fault> {
        let handle = self.pop()?;
        let value = self.state.pool.copy_of(handle);
        self.release(handle);
        value
    }

    fn pop_number(&mut self) -> Result<f64, Fault> {
        let handle = self.pop()?;
        let number = self
            .state
            .pool
            .get(handle)
            .and_then(|value| value.as_f64().ok_or(Fault::ExpectedNumber));
        self.release(handle);
        number
    }

    fn pop_condition(&mut self) -> Result<Condition, Fault> {
        let handle = self.pop()?;
        let condition = self.state.pool.get(handle).and_then(|value| {
            value
                .as_condition()
                .cloned()
                .ok_or(Fault::ExpectedCondition)
        });
        self.release(handle);
        condition
    }

    fn pop_symbol(&mut self) -> Result<Symbol, Fault> {
        let handle = self.pop()?;
        let symbol = self
            .state
            .pool
            .get(handle)
            .and_then(|value| value.as_symbol().cloned().ok_or(Fault::ExpectedString));
        self.release(handle);
        symbol
    }

    /// Pops an argument array, returning the handles of its elements.
    fn pop_arguments(&mut self) -> Result<Vec<Handle>, Fault> {
        match self.pop_value()? {
            Value::Array(elements) => Ok(elements),
            Value::Nil => Ok(Vec::new()),
            other => {
                self.state.pool.release_value(other);
                Err(Fault::ExpectedArray)
            }
        }
    }

    fn nested<R>(&mut self, run: impl FnOnce(&mut Self) -> R) -> Result<R, Fault> {
        if self.depth >= self.state.config.max_depth {
            return Err(Fault::StackOverflow);
        }
        self.depth += 1;
        let result = run(self);
        self.depth -= 1;
        Ok(result)
    }

    /// Executes instructions starting at `pc` until the end of a state, the
    /// end of a nested body, or a suspension.
    pub(crate) fn run(&mut self, mut pc: usize) -> Result<RunEnd, Fault> {
        loop {
            self.pc = pc;
            let word = *self
                .exemplar
                .bytecode()
                .get(pc)
                .ok_or(Fault::InvalidInstructionAddress)?;
            let (code, inline) = split(word);
            let opcode = Opcode::try_from(code).map_err(Fault::InvalidOpcode)?;
            self.budget.charge()?;
            trace!(pc, %opcode, inline, "step");

            match opcode {
                Opcode::Nop => {}
                Opcode::PushNil => self.push_value(Value::Nil)?,
                Opcode::PushConstant => {
                    let value = i64::from_ne_bytes(self.operand(pc)?.to_ne_bytes());
                    self.push_value(Value::Int(value))?;
                }
                Opcode::PushFloatConstant => {
                    let value = f64::from_bits(self.operand(pc)?);
                    self.push_value(Value::Real(value))?;
                }
                Opcode::PushString => {
                    let value = self.string(inline)?;
                    self.push_value(Value::String(value))?;
                }
                Opcode::Pop => {
                    let handle = self.pop()?;
                    self.release(handle);
                }
                Opcode::Dup => {
                    let top = self
                        .fiber_mut()?
                        .stack
                        .last()
                        .copied()
                        .flatten()
                        .ok_or(Fault::StackUnderflow)?;
                    self.state.pool.add_strong(top)?;
                    self.push(top)?;
                }
                Opcode::GetSelfVar => self.get_variable(OwnerKey::Fiber(self.fiber))?,
                Opcode::GetSharedVar => self.get_variable(self.shared_owner())?,
                Opcode::GetGlobalVar => self.get_variable(OwnerKey::Global)?,
                Opcode::SetSelfVar => self.set_variable(OwnerKey::Fiber(self.fiber))?,
                Opcode::SetSharedVar => self.set_variable(self.shared_owner())?,
                Opcode::SetGlobalVar => self.set_variable(OwnerKey::Global)?,
                Opcode::GetFrameVar => {
                    let handle = usize::try_from(inline)
                        .ok()
                        .and_then(|index| self.frame.get(index))
                        .copied()
                        .ok_or(Fault::UnknownVariable)?;
                    self.state.pool.add_strong(handle)?;
                    self.push(handle)?;
                }
                Opcode::ParamsStart => self.fiber_mut()?.stack.push(None),
                Opcode::ParamsEnd => self.collect_params()?,
                Opcode::CallFunction => {
                    let index = u32::try_from(inline).map_err(|_| Fault::OutOfBounds)?;
                    let args = self.pop()?;
                    match self.resolve_cached(index) {
                        Ok(resolved) => self.invoke(resolved, args)?,
                        Err(fault) => {
                            self.release(args);
                            return Err(fault);
                        }
                    }
                }
                Opcode::DotChain => {
                    let receiver = self.pop()?;
                    self.fiber_mut()?.receivers.push(receiver);
                }
                Opcode::DynamicCallLibFunction => {
                    let name = self.string(inline)?;
                    let args = self.pop()?;
                    let Some(receiver) = self.fiber_mut()?.receivers.pop() else {
                        self.release(args);
                        return Err(Fault::StackUnderflow);
                    };
                    match resolve::resolve(self.state, self.fiber, &name, Some(receiver)) {
                        Ok(resolved) => self.invoke(resolved, args)?,
                        Err(fault) => {
                            self.release(args);
                            return Err(fault);
                        }
                    }
                }
                Opcode::IfEq
                | Opcode::IfEq0
                | Opcode::IfNotEq0
                | Opcode::IfLt0
                | Opcode::IfGt0
                | Opcode::IfLte0
                | Opcode::IfGte0 => {
                    if self.test(opcode)? {
                        // Skip the goto to the else branch.
                        pc += 3;
                    } else {
                        pc += 1;
                    }
                    continue;
                }
                Opcode::OpAdd
                | Opcode::OpSub
                | Opcode::OpMul
                | Opcode::OpDiv
                | Opcode::OpModulus => {
                    let rhs = self.pop_value()?;
                    let lhs = match self.pop_value() {
                        Ok(lhs) => lhs,
                        Err(fault) => {
                            self.state.pool.release_value(rhs);
                            return Err(fault);
                        }
                    };
                    let result = binary(opcode, &lhs, &rhs);
                    self.state.pool.release_value(lhs);
                    self.state.pool.release_value(rhs);
                    self.push_value(result?)?;
                }
                Opcode::OpNegate => {
                    let value = self.pop_value()?;
                    let result = match &value {
                        Value::Int(value) => Ok(Value::Int(value.wrapping_neg())),
                        Value::Real(value) => Ok(Value::Real(-value)),
                        _ => Err(Fault::ExpectedNumber),
                    };
                    self.state.pool.release_value(value);
                    self.push_value(result?)?;
                }
                Opcode::GotoState => {
                    let entry = self.goto_state()?;
                    if self.loops > 0 {
                        // Leave every enclosing loop body before entering the
                        // new state.
                        self.unwinding_to = Some(entry);
                        return Ok(RunEnd::SubStateEnd);
                    }
                    pc = entry;
                    continue;
                }
                Opcode::GotoAddr => {
                    pc = self.address(pc)?;
                    continue;
                }
                Opcode::ForEach => {
                    let end = self.address(pc)?;
                    if let Some(end) = self.for_each(pc + 2)? {
                        return Ok(end);
                    }
                    pc = match self.unwinding_to {
                        Some(_) if self.loops > 0 => return Ok(RunEnd::SubStateEnd),
                        Some(entry) => {
                            self.unwinding_to = None;
                            entry
                        }
                        None => end,
                    };
                    continue;
                }
                Opcode::On => {
                    let body = self.address(pc)?;
                    let condition = self.pop_condition()?;
                    self.register(&condition, body)?;
                }
                Opcode::Wait => {
                    if self.loops > 0 {
                        return Err(Fault::SuspendInLoop);
                    }
                    let condition = self.pop_condition()?;
                    self.register(&condition, pc + 1)?;
                    return Ok(RunEnd::Suspended);
                }
                Opcode::StateEnd => return Ok(RunEnd::StateEnd),
                Opcode::SubStateEnd => return Ok(RunEnd::SubStateEnd),
                Opcode::StateSuspend => {
                    if self.loops > 0 {
                        return Err(Fault::SuspendInLoop);
                    }
                    self.fiber_mut()?.suspended_pc = Some(pc + 1);
                    return Ok(RunEnd::Suspended);
                }
                Opcode::LaunchMachine => self.launch()?,
            }

            pc += 1 + opcode.operand_words();
        }
    }

    /// Shared variables belong to the name the machine was loaded under,
    /// which may differ from the name recorded in its image.
    fn shared_owner(&self) -> OwnerKey {
        OwnerKey::Machine(self.machine.clone())
    }

    fn get_variable(&mut self, owner: OwnerKey) -> Result<(), Fault> {
        let key = self.pop()?;
        let pool = &self.state.pool;
        let found = pool
            .get(key)
            .and_then(VarKey::from_value)
            .map(|key| pool.lookup(&owner, key));
        self.release(key);
        let handle = found?.ok_or(Fault::UnknownVariable)?;
        self.state.pool.add_strong(handle)?;
        self.push(handle)
    }

    fn set_variable(&mut self, owner: OwnerKey) -> Result<(), Fault> {
        let key = self.pop()?;
        let value = match self.pop() {
            Ok(value) => value,
            Err(fault) => {
                self.release(key);
                return Err(fault);
            }
        };
        let result = self.assign(&owner, key, value);
        self.release(key);
        self.release(value);
        result
    }

    fn assign(&mut self, owner: &OwnerKey, key: Handle, value: Handle) -> Result<(), Fault> {
        let pool = &mut self.state.pool;
        let (target, name) = {
            let key = pool.get(key)?;
            let var_key = VarKey::from_value(key)?;
            (pool.lookup(owner, var_key), key.as_symbol().cloned())
        };
        let copy = pool.copy_of(value)?;
        match (target, name) {
            (Some(target), _) => pool.set(target, copy),
            // Globals are declared on first assignment.
            (None, Some(name)) if *owner == OwnerKey::Global => {
                debug!(%name, "global declared");
                pool.declare(OwnerKey::Global, name, copy).map(|_| ())
            }
            (None, _) => {
                pool.release_value(copy);
                Err(Fault::UnknownVariable)
            }
        }
    }

    fn collect_params(&mut self) -> Result<(), Fault> {
        let stack = &mut self.fiber_mut()?.stack;
        let start = stack
            .iter()
            .rposition(Option::is_none)
            .ok_or(Fault::StackUnderflow)?;
        let params = stack.drain(start..).skip(1).flatten().collect::<Vec<_>>();
        self.push_value(Value::Array(params))
    }

    fn test(&mut self, opcode: Opcode) -> Result<bool, Fault> {
        let value = self.pop_number()?;
        #[allow(clippy::float_cmp)]
        let result = match opcode {
            Opcode::IfEq => {
                let lhs = self.pop_number()?;
                lhs == value
            }
            Opcode::IfEq0 => value == 0.,
            Opcode::IfNotEq0 => value != 0.,
            Opcode::IfLt0 => value < 0.,
            Opcode::IfGt0 => value > 0.,
            Opcode::IfLte0 => value <= 0.,
            Opcode::IfGte0 => value >= 0.,
            _ => return Err(Fault::InvalidOpcode(opcode as u16)),
        };
        Ok(result)
    }

    fn goto_state(&mut self) -> Result<usize, Fault> {
        let handle = self.pop()?;
        let index = self.state.pool.get(handle).map(|key| match key {
            Value::String(name) => self.exemplar.state_index(name),
            other => other.as_usize(),
        });
        self.release(handle);
        let index = index?.ok_or(Fault::UnknownState)?;
        let address = self
            .exemplar
            .state_address(index)
            .ok_or(Fault::UnknownState)?;

        let cancelled = self.state.scheduler.cancel_fiber(self.fiber);
        debug!(fiber = ?self.fiber, state = index, cancelled = cancelled.len(), "state transition");
        self.release_all(cancelled);
        self.continuation = None;
        let fiber = self.fiber_mut()?;
        fiber.state = index;
        fiber.suspended_pc = None;
        Ok(address)
    }

    /// Runs the loop body at `body` once per element of the generator on top
    /// of the stack. Returns the end condition if the loop ended the state.
    ///
    /// A state transition inside the body stops the loop and leaves
    /// `unwinding_to` set for the caller.
    fn for_each(&mut self, body: usize) -> Result<Option<RunEnd>, Fault> {
        let generator = self.pop()?;
        let elements = self.generator(generator);
        self.release(generator);

        let mut elements = elements?;
        let mut outcome = Ok(None);
        while let Some(element) = self.next_element(&mut elements) {
            let element = match element {
                Ok(element) => element,
                Err(fault) => {
                    outcome = Err(fault);
                    break;
                }
            };
            let outer = std::mem::replace(&mut self.frame, vec![element]);
            self.loops += 1;
            let result = self.nested(|this| this.run(body));
            self.loops -= 1;
            let inner = std::mem::replace(&mut self.frame, outer);
            self.release_all(inner);
            match result.and_then(|result| result) {
                Ok(RunEnd::SubStateEnd) if self.unwinding_to.is_some() => break,
                Ok(RunEnd::SubStateEnd) => {}
                Ok(RunEnd::StateEnd) => {
                    outcome = Ok(Some(RunEnd::StateEnd));
                    break;
                }
                Ok(RunEnd::Suspended) => {
                    outcome = Err(Fault::SuspendInLoop);
                    break;
                }
                Err(fault) => {
                    outcome = Err(fault);
                    break;
                }
            }
        }
        if let Generator::Elements(remaining) = elements {
            self.release_all(remaining);
        }
        outcome
    }

    fn generator(&mut self, generator: Handle) -> Result<Generator, Fault> {
        let pool = &mut self.state.pool;
        match pool.get(generator)? {
            Value::Array(elements) => {
                let elements = elements.clone();
                for (index, element) in elements.iter().enumerate() {
                    if let Err(fault) = pool.add_strong(*element) {
                        for retained in &elements[..index] {
                            let _ = pool.release_strong(*retained);
                        }
                        return Err(fault);
                    }
                }
                Ok(Generator::Elements(elements.into_iter()))
            }
            Value::Int(count) => Ok(Generator::Count(0..(*count).max(0))),
            _ => Err(Fault::ExpectedArray),
        }
    }

    /// Returns a strong reference to the next element, allocating counted
    /// elements one at a time.
    fn next_element(&mut self, generator: &mut Generator) -> Option<Result<Handle, Fault>> {
        match generator {
            Generator::Elements(elements) => elements.next().map(Ok),
            Generator::Count(range) => range
                .next()
                .map(|index| self.state.pool.alloc_temporary(Value::Int(index))),
        }
    }

    fn register(&mut self, condition: &Condition, pc: usize) -> Result<ContinuationId, Fault> {
        self.state.pool.add_strong(self.canonical)?;
        let now = self.state.now;
        match self.state.scheduler.register(
            self.continuation,
            self.fiber,
            self.canonical,
            condition,
            pc,
            now,
        ) {
            Ok(id) => Ok(id),
            Err(err) => {
                self.release(self.canonical);
                Err(Fault::from(err))
            }
        }
    }

    fn launch(&mut self) -> Result<(), Fault> {
        let name = self.pop_symbol()?;
        let arguments = self.pop_arguments()?;
        if self.depth >= self.state.config.max_depth {
            self.release_all(arguments);
            return Err(Fault::StackOverflow);
        }
        match self.state.launch_fiber(&name, arguments, self.depth + 1) {
            Ok((_, handle)) => self.push_value(Value::Fiber(handle)),
            Err(crate::Error::Execution(err)) => {
                debug!(%err, "launched machine faulted");
                self.push_value(Value::Nil)
            }
            Err(crate::Error::Fault(fault)) => Err(fault),
            Err(err) => {
                error!(%name, %err, "machine could not be instantiated");
                Err(Fault::InvalidMachine(name))
            }
        }
    }

    fn resolve_cached(&mut self, index: u32) -> Result<Resolved, Fault> {
        if let Some(resolved) = self.cached(index) {
            return Ok(resolved);
        }
        let name = self.string(u64::from(index))?;
        let resolved = resolve::resolve(self.state, self.fiber, &name, None)?;
        self.remember(index, &resolved)?;
        Ok(resolved)
    }

    fn cached(&mut self, index: u32) -> Option<Resolved> {
        let state = &mut *self.state;
        let fiber = state.fibers.get_mut(self.fiber.0)?;
        let resolved = fiber.cache.get(&index)?.upgrade(&mut state.pool);
        if resolved.is_none() {
            if let Some(stale) = fiber.cache.remove(&index) {
                trace!(index, "cached resolution is stale");
                stale.release(&mut state.pool);
            }
        }
        resolved
    }

    fn remember(&mut self, index: u32, resolved: &Resolved) -> Result<(), Fault> {
        let state = &mut *self.state;
        let target = CachedTarget::downgrade(resolved, &mut state.pool)?;
        let fiber = state
            .fibers
            .get_mut(self.fiber.0)
            .ok_or(Fault::FiberDestroyed)?;
        if let Some(previous) = fiber.cache.insert(index, target) {
            previous.release(&mut state.pool);
        }
        Ok(())
    }

    fn invoke(&mut self, resolved: Resolved, args: Handle) -> Result<(), Fault> {
        let arguments = match self.state.pool.copy_of(args) {
            Ok(Value::Array(arguments)) => Ok(arguments),
            Ok(other) => {
                self.state.pool.release_value(other);
                Err(Fault::ExpectedArray)
            }
            Err(fault) => Err(fault),
        };
        self.release(args);
        let arguments = match arguments {
            Ok(arguments) => arguments,
            Err(fault) => {
                resolved.release(&mut self.state.pool);
                return Err(fault);
            }
        };

        match resolved {
            Resolved::Value(handle) => {
                if arguments.is_empty() {
                    self.push(handle)
                } else {
                    self.release_all(arguments);
                    self.release(handle);
                    Err(Fault::NotAFunction)
                }
            }
            Resolved::Library(_) => {
                self.release_all(arguments);
                Err(Fault::NotAFunction)
            }
            Resolved::Function { function, receiver } => {
                let mut values = Vec::with_capacity(arguments.len());
                let mut copied = Ok(());
                for argument in &arguments {
                    match self.state.pool.copy_of(*argument) {
                        Ok(value) => values.push(value),
                        Err(fault) => {
                            copied = Err(fault);
                            break;
                        }
                    }
                }
                self.release_all(arguments);
                let results = copied.and_then(|()| {
                    let mut context = NativeContext::new(self.state, self.fiber, receiver);
                    function.invoke(&mut context, &values)
                });
                self.state.pool.release_values(values);
                if let Some(receiver) = receiver {
                    self.release(receiver);
                }
                for result in results? {
                    self.push_value(result)?;
                }
                Ok(())
            }
        }
    }
}

fn binary(opcode: Opcode, lhs: &Value, rhs: &Value) -> Result<Value, Fault> {
    match (lhs, rhs) {
        (Value::Int(lhs), Value::Int(rhs)) => {
            let (lhs, rhs) = (*lhs, *rhs);
            Ok(Value::Int(match opcode {
                Opcode::OpAdd => lhs.wrapping_add(rhs),
                Opcode::OpSub => lhs.wrapping_sub(rhs),
                Opcode::OpMul => lhs.wrapping_mul(rhs),
                Opcode::OpDiv if rhs == 0 => return Err(Fault::DivideByZero),
                Opcode::OpDiv => lhs.wrapping_div(rhs),
                Opcode::OpModulus if rhs == 0 => return Err(Fault::DivideByZero),
                Opcode::OpModulus => lhs.wrapping_rem(rhs),
                _ => return Err(Fault::InvalidOpcode(opcode as u16)),
            }))
        }
        (Value::String(lhs), Value::String(rhs)) if opcode == Opcode::OpAdd => {
            Ok(Value::String(Symbol::from(format!("{lhs}{rhs}"))))
        }
        _ => {
            let lhs = lhs.as_f64().ok_or(Fault::ExpectedNumber)?;
            let rhs = rhs.as_f64().ok_or(Fault::ExpectedNumber)?;
            Ok(Value::Real(match opcode {
                Opcode::OpAdd => lhs + rhs,
                Opcode::OpSub => lhs - rhs,
                Opcode::OpMul => lhs * rhs,
                Opcode::OpDiv => lhs / rhs,
                Opcode::OpModulus => lhs % rhs,
                _ => return Err(Fault::InvalidOpcode(opcode as u16)),
            }))
        }
    }
}

/// An error raised while executing a fiber.
///
/// A fault aborts the fiber's current run, and the engine tears the fiber
/// down. Other fibers are unaffected.
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Fault {
    /// A value was popped from an empty stack, or from beneath an argument
    /// list marker.
    StackUnderflow,
    /// Nested runs exceeded the configured maximum depth.
    StackOverflow,
    /// An operation expected an int or real.
    ExpectedNumber,
    /// An operation expected an int.
    ExpectedInteger,
    /// An operation expected a string.
    ExpectedString,
    /// An operation expected an array.
    ExpectedArray,
    /// An operation expected a wake condition.
    ExpectedCondition,
    /// An operation expected a fiber.
    ExpectedFiber,
    /// A name could not be resolved.
    UnknownIdentifier(Symbol),
    /// A variable key did not name a declared variable.
    UnknownVariable,
    /// A state key did not name a state of the machine.
    UnknownState,
    /// No exemplar exists for the named machine.
    UnknownMachine(Symbol),
    /// The named machine's exemplar failed validation.
    InvalidMachine(Symbol),
    /// A value that is not a function was called with arguments.
    NotAFunction,
    /// A function was called with the wrong number of arguments, or
    /// returned the wrong number of results.
    IncorrectNumberOfArguments,
    /// A function was called with an argument of the wrong kind.
    UnexpectedArgument,
    /// An integer was divided by zero.
    DivideByZero,
    /// An instruction word did not contain a known opcode.
    InvalidOpcode(u16),
    /// Execution reached an address outside of the bytecode.
    InvalidInstructionAddress,
    /// The value pool is at capacity.
    PoolExhausted,
    /// A handle referred to a value that has been dropped.
    ValueFreed,
    /// The fiber no longer exists.
    FiberDestroyed,
    /// A loop body attempted to suspend.
    SuspendInLoop,
    /// The fiber was resumed without being suspended.
    NotSuspended,
    /// The step budget for this run was exhausted.
    NoBudget,
    /// A condition referred to an unknown continuation list.
    UnknownList(Symbol),
    /// An index was outside of the bounds of a collection.
    OutOfBounds,
}

impl From<SchedulerError> for Fault {
    fn from(err: SchedulerError) -> Self {
        match err {
            SchedulerError::UnknownList(list) | SchedulerError::EventsUnsupported(list) => {
                Fault::UnknownList(list)
            }
            SchedulerError::UnknownFiber(_) | SchedulerError::UnknownContinuation => {
                Fault::FiberDestroyed
            }
        }
    }
}

impl ErrorKind for Fault {
    fn kind(&self) -> &'static str {
        match self {
            Fault::StackUnderflow => "underflow",
            Fault::StackOverflow => "overflow",
            Fault::ExpectedNumber => "expected_number",
            Fault::ExpectedInteger => "expected_integer",
            Fault::ExpectedString => "expected_string",
            Fault::ExpectedArray => "expected_array",
            Fault::ExpectedCondition => "expected_condition",
            Fault::ExpectedFiber => "expected_fiber",
            Fault::UnknownIdentifier(_) => "undefined",
            Fault::UnknownVariable => "unknown_variable",
            Fault::UnknownState => "unknown_state",
            Fault::UnknownMachine(_) => "unknown_machine",
            Fault::InvalidMachine(_) => "invalid_machine",
            Fault::NotAFunction => "not_invokable",
            Fault::IncorrectNumberOfArguments => "args",
            Fault::UnexpectedArgument => "unexpected_argument",
            Fault::DivideByZero => "divided_by_zero",
            Fault::InvalidOpcode(_) => "invalid_opcode",
            Fault::InvalidInstructionAddress => "invalid_instruction",
            Fault::PoolExhausted => "out_of_memory",
            Fault::ValueFreed => "out_of_scope",
            Fault::FiberDestroyed => "fiber_destroyed",
            Fault::SuspendInLoop => "suspend_in_loop",
            Fault::NotSuspended => "not_suspended",
            Fault::NoBudget => "no_budget",
            Fault::UnknownList(_) => "unknown_list",
            Fault::OutOfBounds => "out_of_bounds",
        }
    }
}

impl Display for Fault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Fault::UnknownIdentifier(name) => write!(f, "unknown identifier {name}"),
            Fault::UnknownMachine(name) => write!(f, "unknown machine {name}"),
            Fault::InvalidMachine(name) => write!(f, "machine {name} failed validation"),
            Fault::InvalidOpcode(opcode) => write!(f, "invalid opcode {opcode}"),
            Fault::UnknownList(list) => write!(f, "unknown continuation list {list}"),
            other => f.write_str(other.kind()),
        }
    }
}

impl std::error::Error for Fault {}

/// A [`Fault`] annotated with where it happened.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutionError {
    /// The machine type of the faulting fiber.
    pub machine: Symbol,
    /// The faulting fiber.
    pub fiber: FiberId,
    /// The address of the failing instruction.
    pub pc: usize,
    /// What went wrong.
    pub fault: Fault,
}

impl Display for ExecutionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} ({:?}) faulted at pc {}: {}",
            self.machine, self.fiber, self.pc, self.fault
        )
    }
}

impl std::error::Error for ExecutionError {}
