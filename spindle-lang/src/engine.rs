//! The engine: machine types, fibers, globals, and the scheduler that
//! resumes them.

use std::ops::{Deref, DerefMut};
use std::sync::Arc;

use alot::Lots;
use kempt::Map;
use parking_lot::{Mutex, MutexGuard};

use crate::fiber::{ExecutionError, Fault, Fiber, FiberId, Interpreter, RunEnd};
use crate::machine::{ExemplarSource, MachineCache};
use crate::runtime::native::{Library, NativeFunction, Registry};
use crate::runtime::pool::{Handle, OwnerKey, ValuePool, VarKey};
use crate::runtime::symbol::Symbol;
use crate::runtime::value::{Condition, Value};
use crate::scheduler::{ContinuationId, Scheduler, SchedulerError};
use crate::Error;

/// Where `io.print` writes.
#[derive(Debug, Clone, Default)]
pub enum Output {
    /// Lines are written to standard output.
    #[default]
    Stdout,
    /// Lines are collected in a shared buffer.
    Captured(Arc<Mutex<Vec<String>>>),
}

impl Output {
    /// Returns an output that collects lines in memory.
    #[must_use]
    pub fn captured() -> Self {
        Self::Captured(Arc::default())
    }

    /// Writes one line.
    pub fn print(&self, line: &str) {
        match self {
            Output::Stdout => println!("{line}"),
            Output::Captured(lines) => lines.lock().push(line.to_string()),
        }
    }

    /// Returns a copy of the captured lines. Always empty for
    /// [`Output::Stdout`].
    #[must_use]
    pub fn lines(&self) -> Vec<String> {
        match self {
            Output::Stdout => Vec::new(),
            Output::Captured(lines) => lines.lock().clone(),
        }
    }
}

/// Settings for an [`Engine`].
#[derive(Debug, Clone)]
#[non_exhaustive]
pub struct EngineConfig {
    /// The maximum number of value pool slots, or `None` for a growable
    /// pool.
    pub pool_capacity: Option<usize>,
    /// The maximum nesting of loop bodies and machine launches.
    pub max_depth: usize,
    /// The maximum number of instructions a single run may execute, or
    /// `None` for no limit.
    pub step_budget: Option<usize>,
    /// Where `io.print` writes.
    pub output: Output,
    /// The event-keyed continuation lists to create in addition to `time`.
    pub event_lists: Vec<Symbol>,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            pool_capacity: None,
            max_depth: 64,
            step_budget: None,
            output: Output::Stdout,
            event_lists: vec![Symbol::pointer_symbol().clone()],
        }
    }
}

impl EngineConfig {
    /// Limits the value pool to `capacity` slots.
    #[must_use]
    pub fn with_pool_capacity(mut self, capacity: usize) -> Self {
        self.pool_capacity = Some(capacity);
        self
    }

    /// Sets the maximum nesting depth.
    #[must_use]
    pub fn with_max_depth(mut self, depth: usize) -> Self {
        self.max_depth = depth;
        self
    }

    /// Limits every run to `steps` instructions.
    #[must_use]
    pub fn with_step_budget(mut self, steps: usize) -> Self {
        self.step_budget = Some(steps);
        self
    }

    /// Sets where `io.print` writes.
    #[must_use]
    pub fn with_output(mut self, output: Output) -> Self {
        self.output = output;
        self
    }

    /// Adds an event-keyed continuation list named `list`.
    #[must_use]
    pub fn with_event_list(mut self, list: impl Into<Symbol>) -> Self {
        self.event_lists.push(list.into());
        self
    }
}

/// A handle to an engine.
///
/// Clones refer to the same engine. The engine is destroyed when the last
/// handle is dropped.
#[derive(Debug, Clone)]
pub struct Engine(Arc<Mutex<EngineState>>);

impl Engine {
    /// Returns an engine that loads machines from `source`, using the
    /// default configuration.
    pub fn new(source: impl ExemplarSource + 'static) -> Self {
        Self::with_config(source, EngineConfig::default())
    }

    /// Returns an engine that loads machines from `source`.
    pub fn with_config(source: impl ExemplarSource + 'static, config: EngineConfig) -> Self {
        Self(Arc::new(Mutex::new(EngineState::new(source, config))))
    }

    /// Returns exclusive access to the engine's state.
    #[must_use]
    pub fn context(&self) -> EngineContext<'_> {
        EngineContext(self.0.lock())
    }

    /// Launches the machine named `name`. See [`EngineState::launch`].
    pub fn launch(&self, name: impl Into<Symbol>) -> Result<FiberId, Error> {
        self.context().launch(name)
    }

    /// Advances time by `dt` seconds. See [`EngineState::update`].
    pub fn update(&self, dt: f64) -> bool {
        self.context().update(dt)
    }

    /// Queues an event. See [`EngineState::post_event`].
    pub fn post_event(
        &self,
        list: impl Into<Symbol>,
        discriminator: impl Into<Symbol>,
    ) -> Result<(), SchedulerError> {
        self.context().post_event(list, discriminator)
    }

    /// Resumes a suspended fiber. See [`EngineState::resume`].
    pub fn resume(&self, fiber: FiberId) -> Result<RunEnd, Error> {
        self.context().resume(fiber)
    }
}

/// Exclusive access to an [`Engine`]'s state.
pub struct EngineContext<'a>(MutexGuard<'a, EngineState>);

impl Deref for EngineContext<'_> {
    type Target = EngineState;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl DerefMut for EngineContext<'_> {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.0
    }
}

/// The state of an [`Engine`].
pub struct EngineState {
    pub(crate) config: EngineConfig,
    pub(crate) pool: ValuePool,
    pub(crate) registry: Registry,
    pub(crate) machines: MachineCache,
    pub(crate) fibers: Lots<Fiber>,
    pub(crate) scheduler: Scheduler,
    pub(crate) main: Option<FiberId>,
    pub(crate) roots: Map<FiberId, Handle>,
    pub(crate) now: f64,
    pub(crate) resolution_searches: usize,
    pub(crate) faults: Vec<ExecutionError>,
}

impl EngineState {
    /// Returns a new engine state with the built-in libraries registered.
    pub fn new(source: impl ExemplarSource + 'static, config: EngineConfig) -> Self {
        let pool = config
            .pool_capacity
            .map_or_else(ValuePool::new, ValuePool::with_capacity);
        let scheduler = Scheduler::new(&config.event_lists);
        Self {
            config,
            pool,
            registry: Registry::with_builtins(),
            machines: MachineCache::new(source),
            fibers: Lots::new(),
            scheduler,
            main: None,
            roots: Map::new(),
            now: 0.,
            resolution_searches: 0,
            faults: Vec::new(),
        }
    }

    /// Returns the engine's configuration.
    #[must_use]
    pub const fn config(&self) -> &EngineConfig {
        &self.config
    }

    /// Returns the total time elapsed through [`update`](Self::update), in
    /// seconds.
    #[must_use]
    pub const fn now(&self) -> f64 {
        self.now
    }

    /// Returns the value pool.
    #[must_use]
    pub const fn pool(&self) -> &ValuePool {
        &self.pool
    }

    /// Returns exclusive access to the value pool.
    pub fn pool_mut(&mut self) -> &mut ValuePool {
        &mut self.pool
    }

    /// Returns the number of occupied value pool slots.
    #[must_use]
    pub fn pool_len(&self) -> usize {
        self.pool.len()
    }

    /// Returns the native function registry.
    #[must_use]
    pub const fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Returns the scheduler.
    #[must_use]
    pub const fn scheduler(&self) -> &Scheduler {
        &self.scheduler
    }

    /// Returns the machine types loaded so far.
    #[must_use]
    pub const fn machines(&self) -> &MachineCache {
        &self.machines
    }

    /// Returns where `io.print` writes.
    #[must_use]
    pub const fn output(&self) -> &Output {
        &self.config.output
    }

    /// Returns the first fiber launched by the host.
    #[must_use]
    pub const fn main(&self) -> Option<FiberId> {
        self.main
    }

    /// Returns the fiber `id`, if it still exists.
    #[must_use]
    pub fn fiber(&self, id: FiberId) -> Option<&Fiber> {
        self.fibers.get(id.0)
    }

    /// Returns the number of live fibers.
    #[must_use]
    pub fn fiber_count(&self) -> usize {
        self.fibers.len()
    }

    /// Returns the number of name-resolution searches performed.
    #[must_use]
    pub const fn resolution_searches(&self) -> usize {
        self.resolution_searches
    }

    /// Returns the number of continuations waiting to fire.
    #[must_use]
    pub fn pending_continuations(&self) -> usize {
        self.scheduler.len()
    }

    /// Returns every fault raised by a fiber so far.
    #[must_use]
    pub fn faults(&self) -> &[ExecutionError] {
        &self.faults
    }

    /// Removes and returns the recorded faults.
    pub fn take_faults(&mut self) -> Vec<ExecutionError> {
        std::mem::take(&mut self.faults)
    }

    /// Adds a native library.
    pub fn register_library(&mut self, library: Library) {
        self.registry.register_library(library);
    }

    /// Adds a top-level native function.
    pub fn register_function(&mut self, function: NativeFunction) {
        self.registry.register_function(function);
    }

    /// Declares or replaces the global variable `name`.
    pub fn declare_global(&mut self, name: impl Into<Symbol>, value: Value) -> Result<(), Fault> {
        let name = name.into();
        match self.pool.lookup(&OwnerKey::Global, VarKey::Name(&name)) {
            Some(existing) => self.pool.set(existing, value),
            None => self.pool.declare(OwnerKey::Global, name, value).map(|_| ()),
        }
    }

    /// Returns the value of the global variable `name`.
    #[must_use]
    pub fn global_variable(&self, name: &str) -> Option<&Value> {
        self.variable(&OwnerKey::Global, name)
    }

    /// Returns the value of the shared variable `name` of `machine`.
    #[must_use]
    pub fn shared_variable(&self, machine: impl Into<Symbol>, name: &str) -> Option<&Value> {
        self.variable(&OwnerKey::Machine(machine.into()), name)
    }

    /// Returns the value of the instance variable `name` of `fiber`.
    #[must_use]
    pub fn instance_variable(&self, fiber: FiberId, name: &str) -> Option<&Value> {
        self.variable(&OwnerKey::Fiber(fiber), name)
    }

    fn variable(&self, owner: &OwnerKey, name: &str) -> Option<&Value> {
        let handle = self.pool.lookup(owner, VarKey::Name(name))?;
        self.pool.get(handle).ok()
    }

    /// Launches the machine named `name` and runs its entry state.
    ///
    /// The engine keeps the fiber alive until it faults. The first fiber
    /// launched becomes `main`.
    pub fn launch(&mut self, name: impl Into<Symbol>) -> Result<FiberId, Error> {
        let name = name.into();
        let (fiber, handle) = self.launch_fiber(&name, Vec::new(), 0)?;
        info!(machine = %name, ?fiber, "launched");
        if self.fibers.get(fiber.0).is_some() {
            self.roots.insert(fiber, handle);
            if self.main.is_none() {
                self.main = Some(fiber);
            }
        } else {
            let _ = self.pool.release_strong(handle);
        }
        self.reap();
        Ok(fiber)
    }

    /// Instantiates `name` and runs its entry state with `arguments` as its
    /// frame.
    ///
    /// Returns the fiber and a strong reference to its canonical slot.
    /// `arguments` are strong references that the fiber takes ownership of.
    pub(crate) fn launch_fiber(
        &mut self,
        name: &Symbol,
        arguments: Vec<Handle>,
        depth: usize,
    ) -> Result<(FiberId, Handle), Error> {
        let fiber = match self.machines.instantiate(name, &mut self.pool) {
            Ok(fiber) => fiber,
            Err(err) => {
                for argument in arguments {
                    let _ = self.pool.release_strong(argument);
                }
                return Err(err);
            }
        };
        let exemplar = fiber.exemplar.clone();
        let id = FiberId(self.fibers.push(fiber));
        if let Some(fiber) = self.fibers.get_mut(id.0) {
            fiber.arguments = arguments;
        }

        let handle = match self.materialize(id, &exemplar) {
            Ok(handle) => handle,
            Err(err) => {
                self.teardown(id);
                return Err(err);
            }
        };
        debug!(machine = %name, fiber = ?id, depth, "fiber created");

        let Some(entry) = exemplar.entry_address() else {
            self.teardown(id);
            let _ = self.pool.release_strong(handle);
            return Err(Error::Fault(Fault::UnknownState));
        };
        if let Err(err) = self.run_fiber(id, entry, None, depth) {
            let _ = self.pool.release_strong(handle);
            return Err(Error::Execution(err));
        }
        Ok((id, handle))
    }

    /// Allocates the canonical slot and instance variables of a new fiber.
    fn materialize(
        &mut self,
        id: FiberId,
        exemplar: &crate::exemplar::Exemplar,
    ) -> Result<Handle, Error> {
        let canonical = self.pool.alloc(OwnerKey::Fiber(id), Value::Instance(id))?;
        if let Some(fiber) = self.fibers.get_mut(id.0) {
            fiber.canonical = Some(canonical);
        }
        for descriptor in exemplar.locals() {
            let declared = exemplar
                .describe(descriptor)
                .map_err(Error::from)
                .and_then(|(name, ty)| {
                    self.pool
                        .declare(OwnerKey::Fiber(id), name, ty.initial_value())
                        .map_err(Error::from)
                });
            if let Err(err) = declared {
                let _ = self.pool.release_strong(canonical);
                return Err(err);
            }
        }
        Ok(canonical)
    }

    /// Runs `fiber` from `pc`. A fault tears the fiber down and is recorded.
    pub(crate) fn run_fiber(
        &mut self,
        fiber: FiberId,
        pc: usize,
        continuation: Option<ContinuationId>,
        depth: usize,
    ) -> Result<RunEnd, ExecutionError> {
        let (result, failed_at) = match Interpreter::new(self, fiber, continuation, depth) {
            Ok(mut interpreter) => {
                let result = interpreter.run(pc);
                let failed_at = interpreter.pc();
                interpreter.finish();
                (result, failed_at)
            }
            Err(fault) => (Err(fault), pc),
        };
        result.map_err(|fault| self.fault(fiber, failed_at, fault))
    }

    fn fault(&mut self, fiber: FiberId, pc: usize, fault: Fault) -> ExecutionError {
        let machine = self
            .fibers
            .get(fiber.0)
            .map_or_else(|| Symbol::empty().clone(), |fiber| fiber.machine.clone());
        let err = ExecutionError {
            machine,
            fiber,
            pc,
            fault,
        };
        error!(machine = %err.machine, fiber = ?fiber, pc, fault = %err.fault, "fiber faulted");
        self.faults.push(err.clone());
        self.teardown(fiber);
        warn!(?fiber, "fiber torn down");
        err
    }

    /// Cancels a fiber's continuations and releases everything it holds.
    pub(crate) fn teardown(&mut self, fiber: FiberId) {
        let Some(removed) = self.fibers.remove(fiber.0) else {
            return;
        };
        for handle in self.scheduler.cancel_fiber(fiber) {
            let _ = self.pool.release_strong(handle);
        }
        for handle in removed
            .stack
            .into_iter()
            .flatten()
            .chain(removed.receivers)
            .chain(removed.arguments)
        {
            let _ = self.pool.release_strong(handle);
        }
        for (_, cached) in removed.cache {
            cached.release(&mut self.pool);
        }
        self.pool.release_owner(&OwnerKey::Fiber(fiber));
        if let Some(root) = self.roots.remove(&fiber) {
            let (_, root) = root.into_parts();
            let _ = self.pool.release_strong(root);
        }
        if self.main == Some(fiber) {
            self.main = None;
        }
    }

    /// Tears down every fiber that is no longer referenced.
    fn reap(&mut self) {
        loop {
            let orphaned = self.pool.take_orphaned_fibers();
            if orphaned.is_empty() {
                break;
            }
            for fiber in orphaned {
                if self.fibers.get(fiber.0).is_some() {
                    debug!(?fiber, "fiber unreferenced");
                    self.teardown(fiber);
                }
            }
        }
    }

    /// Advances time by `dt` seconds and runs every continuation that
    /// became ready.
    ///
    /// Continuations registered while this update runs are not considered
    /// until the next update. Returns true while any continuation is
    /// pending.
    pub fn update(&mut self, dt: f64) -> bool {
        self.now += dt;
        let ready = self.scheduler.take_ready(self.now);
        for id in ready {
            // An earlier continuation may have cancelled this one.
            let Some(continuation) = self.scheduler.get(id) else {
                continue;
            };
            let (fiber, pc) = (continuation.fiber(), continuation.pc());
            if self.fibers.get(fiber.0).is_none() {
                for handle in self.scheduler.cancel(id) {
                    let _ = self.pool.release_strong(handle);
                }
                continue;
            }
            debug!(?id, ?fiber, pc, "continuation fired");
            if self.run_fiber(fiber, pc, Some(id), 0).is_ok() {
                if let Ok(Some(handle)) = self.scheduler.rearm_or_retire(id) {
                    let _ = self.pool.release_strong(handle);
                }
            }
            self.reap();
        }
        self.reap();
        !self.scheduler.is_empty()
    }

    /// Queues an event on the event-keyed list `list`. Matching
    /// continuations fire during the next [`update`](Self::update).
    pub fn post_event(
        &mut self,
        list: impl Into<Symbol>,
        discriminator: impl Into<Symbol>,
    ) -> Result<(), SchedulerError> {
        let list = list.into();
        let discriminator = discriminator.into();
        debug!(%list, %discriminator, "event posted");
        self.scheduler.post(&list, discriminator)
    }

    /// Resumes `fiber` from the instruction after the `StateSuspend` it
    /// stopped at.
    pub fn resume(&mut self, fiber: FiberId) -> Result<RunEnd, Error> {
        let suspended = self
            .fibers
            .get_mut(fiber.0)
            .ok_or(SchedulerError::UnknownFiber(fiber))?;
        let pc = suspended.suspended_pc.take().ok_or(Fault::NotSuspended)?;
        let result = self.run_fiber(fiber, pc, None, 0);
        self.reap();
        Ok(result?)
    }

    /// Registers a continuation for `fiber` that wakes when `condition` is
    /// met and resumes at `pc`.
    pub fn register_continuation(
        &mut self,
        parent: Option<ContinuationId>,
        fiber: FiberId,
        condition: &Condition,
        pc: usize,
    ) -> Result<ContinuationId, SchedulerError> {
        let handle = self.retain_fiber(fiber)?;
        let now = self.now;
        self.scheduler
            .register(parent, fiber, handle, condition, pc, now)
            .inspect_err(|_| {
                let _ = self.pool.release_strong(handle);
            })
    }

    /// Registers a continuation for `fiber` in the `time` list.
    pub fn register_ordered_continuation(
        &mut self,
        parent: Option<ContinuationId>,
        fiber: FiberId,
        expiry: f64,
        pc: usize,
        recurrence: i64,
        recurrence_delta: f64,
    ) -> Result<ContinuationId, SchedulerError> {
        let handle = self.retain_fiber(fiber)?;
        Ok(self.scheduler.register_ordered(
            parent,
            fiber,
            handle,
            expiry,
            pc,
            recurrence,
            recurrence_delta,
        ))
    }

    fn retain_fiber(&mut self, fiber: FiberId) -> Result<Handle, SchedulerError> {
        let canonical = self
            .fibers
            .get(fiber.0)
            .and_then(|fiber| fiber.canonical)
            .ok_or(SchedulerError::UnknownFiber(fiber))?;
        self.pool
            .add_strong(canonical)
            .map_err(|_| SchedulerError::UnknownFiber(fiber))?;
        Ok(canonical)
    }

    /// Cancels a continuation and everything registered beneath it.
    pub fn cancel_continuation(&mut self, id: ContinuationId) -> Result<(), SchedulerError> {
        if self.scheduler.get(id).is_none() {
            return Err(SchedulerError::UnknownContinuation);
        }
        for handle in self.scheduler.cancel(id) {
            let _ = self.pool.release_strong(handle);
        }
        self.reap();
        Ok(())
    }
}

impl std::fmt::Debug for EngineState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineState")
            .field("config", &self.config)
            .field("pool", &self.pool)
            .field("machines", &self.machines)
            .field("fibers", &self.fibers.len())
            .field("scheduler", &self.scheduler)
            .field("main", &self.main)
            .field("now", &self.now)
            .field("faults", &self.faults)
            .finish_non_exhaustive()
    }
}
