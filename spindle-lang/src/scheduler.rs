//! The continuation scheduler.
//!
//! A [`Continuation`] records a suspended fiber, the address to resume it at,
//! and the condition that wakes it. Continuations are stored in named
//! [`ContinuationList`]s that the engine polls once per tick: the `time` list
//! orders continuations by expiry, while event lists match continuations
//! against posted event discriminators.

use std::collections::VecDeque;
use std::fmt::{self, Debug, Display};

use alot::{LotId, Lots};
use kempt::{Map, Set};

use crate::fiber::FiberId;
use crate::runtime::pool::Handle;
use crate::runtime::symbol::Symbol;
use crate::runtime::value::Condition;

/// The identifier of a registered [`Continuation`].
#[derive(Debug, Clone, Copy, Eq, PartialEq, Ord, PartialOrd)]
pub struct ContinuationId(LotId);

/// What wakes a continuation.
#[derive(Debug, Clone, PartialEq)]
pub enum Wake {
    /// Wakes once the engine clock reaches this time.
    At(f64),
    /// Wakes when this discriminator is posted to the continuation's list.
    On(Symbol),
}

/// A suspended resume point.
#[derive(Debug)]
pub struct Continuation {
    fiber: FiberId,
    fiber_handle: Handle,
    parent: Option<ContinuationId>,
    children: Vec<ContinuationId>,
    pc: usize,
    wake: Wake,
    recurrence: i64,
    recurrence_delta: f64,
    list: Symbol,
}

impl Continuation {
    /// Returns the fiber this continuation resumes.
    #[must_use]
    pub const fn fiber(&self) -> FiberId {
        self.fiber
    }

    /// Returns the strong reference this continuation holds on its fiber's
    /// canonical slot.
    #[must_use]
    pub const fn fiber_handle(&self) -> Handle {
        self.fiber_handle
    }

    /// Returns the continuation that was running when this one was
    /// registered.
    #[must_use]
    pub const fn parent(&self) -> Option<ContinuationId> {
        self.parent
    }

    /// Returns the continuations registered while this one was running.
    #[must_use]
    pub fn children(&self) -> &[ContinuationId] {
        &self.children
    }

    /// Returns the address execution resumes at.
    #[must_use]
    pub const fn pc(&self) -> usize {
        self.pc
    }

    /// Returns the wake condition.
    #[must_use]
    pub const fn wake(&self) -> &Wake {
        &self.wake
    }

    /// Returns the remaining recurrence: `0` fires once more, `n > 0` re-arms
    /// `n` more times, and `-1` re-arms forever.
    #[must_use]
    pub const fn recurrence(&self) -> i64 {
        self.recurrence
    }

    /// Returns the amount added to the expiry when a time-keyed continuation
    /// is re-armed.
    #[must_use]
    pub const fn recurrence_delta(&self) -> f64 {
        self.recurrence_delta
    }

    /// Returns the name of the list this continuation is registered in.
    #[must_use]
    pub const fn list(&self) -> &Symbol {
        &self.list
    }
}

/// A named collection of continuations polled together.
pub trait ContinuationList: Debug + Send {
    /// Returns the name of this list.
    fn name(&self) -> &Symbol;

    /// Adds a continuation to this list.
    fn insert(&mut self, id: ContinuationId, continuation: &Continuation);

    /// Removes a continuation from this list, if present.
    fn remove(&mut self, id: ContinuationId);

    /// Queues an event to be matched during the next
    /// [`take_ready`](Self::take_ready).
    fn post(&mut self, discriminator: Symbol) -> Result<(), SchedulerError>;

    /// Removes and returns every continuation that is ready to fire, in
    /// firing order.
    ///
    /// Continuations inserted after this call returns are not considered
    /// until the following tick.
    fn take_ready(&mut self, now: f64, tick: u64) -> Vec<ContinuationId>;

    /// Returns the number of continuations waiting in this list.
    fn len(&self) -> usize;

    /// Returns true if no continuations are waiting in this list.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[derive(Debug, Clone, Copy)]
struct TimeEntry {
    expiry: f64,
    id: ContinuationId,
}

/// Continuations ordered by expiry.
///
/// Continuations with equal expiries fire in the order they were inserted.
#[derive(Debug)]
pub struct TimeList {
    name: Symbol,
    queue: Vec<TimeEntry>,
}

impl TimeList {
    /// Returns an empty list named `time`.
    #[must_use]
    pub fn new() -> Self {
        Self {
            name: Symbol::time_symbol().clone(),
            queue: Vec::new(),
        }
    }

    /// Returns the earliest pending expiry.
    #[must_use]
    pub fn next_expiry(&self) -> Option<f64> {
        self.queue.first().map(|entry| entry.expiry)
    }
}

impl Default for TimeList {
    fn default() -> Self {
        Self::new()
    }
}

impl ContinuationList for TimeList {
    fn name(&self) -> &Symbol {
        &self.name
    }

    fn insert(&mut self, id: ContinuationId, continuation: &Continuation) {
        let Wake::At(expiry) = continuation.wake else {
            warn!(?id, "event continuation inserted into time list");
            return;
        };
        let index = self.queue.partition_point(|entry| entry.expiry <= expiry);
        self.queue.insert(index, TimeEntry { expiry, id });
    }

    fn remove(&mut self, id: ContinuationId) {
        self.queue.retain(|entry| entry.id != id);
    }

    fn post(&mut self, _discriminator: Symbol) -> Result<(), SchedulerError> {
        Err(SchedulerError::EventsUnsupported(self.name.clone()))
    }

    fn take_ready(&mut self, now: f64, _tick: u64) -> Vec<ContinuationId> {
        let ready = self.queue.partition_point(|entry| entry.expiry <= now);
        self.queue.drain(..ready).map(|entry| entry.id).collect()
    }

    fn len(&self) -> usize {
        self.queue.len()
    }
}

#[derive(Debug, Clone)]
struct Waiting {
    discriminator: Symbol,
    id: ContinuationId,
    armed: u64,
}

/// Continuations matched against posted events.
///
/// Only continuations armed before the current tick can be woken, so a
/// continuation registered while an event is being dispatched never observes
/// that same event.
#[derive(Debug)]
pub struct EventList {
    name: Symbol,
    waiting: Vec<Waiting>,
    events: VecDeque<Symbol>,
    tick: u64,
}

impl EventList {
    /// Returns an empty event list.
    #[must_use]
    pub fn new(name: impl Into<Symbol>) -> Self {
        Self {
            name: name.into(),
            waiting: Vec::new(),
            events: VecDeque::new(),
            tick: 0,
        }
    }

    /// Returns the number of events waiting to be matched.
    #[must_use]
    pub fn queued_events(&self) -> usize {
        self.events.len()
    }
}

impl ContinuationList for EventList {
    fn name(&self) -> &Symbol {
        &self.name
    }

    fn insert(&mut self, id: ContinuationId, continuation: &Continuation) {
        let Wake::On(discriminator) = &continuation.wake else {
            warn!(?id, list = %self.name, "time continuation inserted into event list");
            return;
        };
        self.waiting.push(Waiting {
            discriminator: discriminator.clone(),
            id,
            armed: self.tick,
        });
    }

    fn remove(&mut self, id: ContinuationId) {
        self.waiting.retain(|waiting| waiting.id != id);
    }

    fn post(&mut self, discriminator: Symbol) -> Result<(), SchedulerError> {
        self.events.push_back(discriminator);
        Ok(())
    }

    fn take_ready(&mut self, _now: f64, tick: u64) -> Vec<ContinuationId> {
        let mut ready = Vec::new();
        while let Some(event) = self.events.pop_front() {
            let mut index = 0;
            while index < self.waiting.len() {
                let waiting = &self.waiting[index];
                if waiting.armed < tick && waiting.discriminator == event {
                    ready.push(self.waiting.remove(index).id);
                } else {
                    index += 1;
                }
            }
        }
        self.tick = tick;
        ready
    }

    fn len(&self) -> usize {
        self.waiting.len()
    }
}

/// Owns every continuation and the lists they wait in.
pub struct Scheduler {
    continuations: Lots<Continuation>,
    lists: Map<Symbol, Box<dyn ContinuationList>>,
    owned: Map<FiberId, Set<ContinuationId>>,
    tick: u64,
}

impl Scheduler {
    /// Returns a scheduler with a `time` list and one [`EventList`] per name
    /// in `event_lists`.
    #[must_use]
    pub fn new(event_lists: &[Symbol]) -> Self {
        let mut scheduler = Self {
            continuations: Lots::new(),
            lists: Map::new(),
            owned: Map::new(),
            tick: 0,
        };
        scheduler.add_list(Box::new(TimeList::new()));
        for name in event_lists {
            scheduler.add_list(Box::new(EventList::new(name)));
        }
        scheduler
    }

    /// Adds `list`, replacing any list with the same name.
    pub fn add_list(&mut self, list: Box<dyn ContinuationList>) {
        self.lists.insert(list.name().clone(), list);
    }

    /// Returns the list named `name`.
    #[must_use]
    pub fn list(&self, name: &Symbol) -> Option<&dyn ContinuationList> {
        self.lists.get(name).map(|list| &**list)
    }

    /// Returns the number of ticks taken so far.
    #[must_use]
    pub const fn tick(&self) -> u64 {
        self.tick
    }

    /// Returns the continuation `id`, if it has not fired or been cancelled.
    #[must_use]
    pub fn get(&self, id: ContinuationId) -> Option<&Continuation> {
        self.continuations.get(id.0)
    }

    /// Returns the number of registered continuations.
    #[must_use]
    pub fn len(&self) -> usize {
        self.continuations.len()
    }

    /// Returns true if no continuations are registered.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.continuations.is_empty()
    }

    /// Returns the number of continuations registered for `fiber`.
    #[must_use]
    pub fn pending_for(&self, fiber: FiberId) -> usize {
        self.owned.get(&fiber).map_or(0, |owned| owned.len())
    }

    /// Registers a continuation that wakes when `condition` is met.
    ///
    /// `fiber_handle` is a strong reference that the continuation takes
    /// ownership of.
    pub fn register(
        &mut self,
        parent: Option<ContinuationId>,
        fiber: FiberId,
        fiber_handle: Handle,
        condition: &Condition,
        pc: usize,
        now: f64,
    ) -> Result<ContinuationId, SchedulerError> {
        match condition {
            Condition::Time {
                delay,
                recurrence,
                interval,
            } => Ok(self.register_ordered(
                parent,
                fiber,
                fiber_handle,
                now + delay,
                pc,
                *recurrence,
                *interval,
            )),
            Condition::Event {
                list,
                discriminator,
                recurrence,
            } => self.register_event(
                parent,
                fiber,
                fiber_handle,
                list,
                discriminator.clone(),
                pc,
                *recurrence,
            ),
        }
    }

    /// Registers a continuation in the `time` list.
    #[allow(clippy::too_many_arguments)]
    pub fn register_ordered(
        &mut self,
        parent: Option<ContinuationId>,
        fiber: FiberId,
        fiber_handle: Handle,
        expiry: f64,
        pc: usize,
        recurrence: i64,
        recurrence_delta: f64,
    ) -> ContinuationId {
        self.insert(Continuation {
            fiber,
            fiber_handle,
            parent,
            children: Vec::new(),
            pc,
            wake: Wake::At(expiry),
            recurrence,
            recurrence_delta,
            list: Symbol::time_symbol().clone(),
        })
    }

    /// Registers a continuation in the event list `list`.
    #[allow(clippy::too_many_arguments)]
    pub fn register_event(
        &mut self,
        parent: Option<ContinuationId>,
        fiber: FiberId,
        fiber_handle: Handle,
        list: &Symbol,
        discriminator: Symbol,
        pc: usize,
        recurrence: i64,
    ) -> Result<ContinuationId, SchedulerError> {
        if self.lists.get(list).is_none() {
            return Err(SchedulerError::UnknownList(list.clone()));
        }
        Ok(self.insert(Continuation {
            fiber,
            fiber_handle,
            parent,
            children: Vec::new(),
            pc,
            wake: Wake::On(discriminator),
            recurrence,
            recurrence_delta: 0.,
            list: list.clone(),
        }))
    }

    fn insert(&mut self, continuation: Continuation) -> ContinuationId {
        let fiber = continuation.fiber;
        let parent = continuation.parent;
        let list = continuation.list.clone();
        let id = ContinuationId(self.continuations.push(continuation));
        if let (Some(list), Some(continuation)) =
            (self.lists.get_mut(&list), self.continuations.get(id.0))
        {
            list.insert(id, continuation);
            debug!(?id, ?fiber, list = %list.name(), wake = ?continuation.wake, "continuation registered");
        }
        if let Some(parent) = parent.and_then(|parent| self.continuations.get_mut(parent.0)) {
            parent.children.push(id);
        }
        self.owned.entry(fiber).or_default().insert(id);
        id
    }

    /// Queues an event on the list named `list`.
    pub fn post(&mut self, list: &Symbol, discriminator: Symbol) -> Result<(), SchedulerError> {
        self.lists
            .get_mut(list)
            .ok_or_else(|| SchedulerError::UnknownList(list.clone()))?
            .post(discriminator)
    }

    /// Advances the tick and returns every continuation ready to fire at
    /// `now`, list by list.
    pub fn take_ready(&mut self, now: f64) -> Vec<ContinuationId> {
        self.tick += 1;
        let tick = self.tick;
        let mut ready = Vec::new();
        for (_, list) in self.lists.iter_mut() {
            ready.extend(list.take_ready(now, tick));
        }
        ready
    }

    /// Re-arms a continuation that just fired, or retires it if its
    /// recurrence is exhausted.
    ///
    /// Returns the fiber handle the continuation held if it was retired.
    pub fn rearm_or_retire(&mut self, id: ContinuationId) -> Result<Option<Handle>, SchedulerError> {
        let continuation = self
            .continuations
            .get_mut(id.0)
            .ok_or(SchedulerError::UnknownContinuation)?;
        match continuation.recurrence {
            0 => return Ok(self.retire(id)),
            n if n > 0 => continuation.recurrence -= 1,
            _ => {}
        }
        if let Wake::At(expiry) = &mut continuation.wake {
            *expiry += continuation.recurrence_delta;
        }
        debug!(?id, recurrence = continuation.recurrence, wake = ?continuation.wake, "continuation re-armed");
        if let Some(list) = self.lists.get_mut(&continuation.list) {
            list.insert(id, continuation);
        }
        Ok(None)
    }

    /// Removes a continuation that fired for the last time. Its children
    /// remain registered.
    fn retire(&mut self, id: ContinuationId) -> Option<Handle> {
        let continuation = self.detach(id)?;
        for child in &continuation.children {
            if let Some(child) = self.continuations.get_mut(child.0) {
                child.parent = None;
            }
        }
        debug!(?id, "continuation retired");
        Some(continuation.fiber_handle)
    }

    fn detach(&mut self, id: ContinuationId) -> Option<Continuation> {
        let continuation = self.continuations.remove(id.0)?;
        if let Some(list) = self.lists.get_mut(&continuation.list) {
            list.remove(id);
        }
        if let Some(parent) = continuation
            .parent
            .and_then(|parent| self.continuations.get_mut(parent.0))
        {
            parent.children.retain(|child| *child != id);
        }
        if let Some(owned) = self.owned.get_mut(&continuation.fiber) {
            owned.remove(&id);
            if owned.is_empty() {
                self.owned.remove(&continuation.fiber);
            }
        }
        Some(continuation)
    }

    /// Cancels `id` and, recursively, every continuation registered beneath
    /// it.
    ///
    /// Returns the fiber handles the cancelled continuations held. The
    /// caller is responsible for releasing them.
    pub fn cancel(&mut self, id: ContinuationId) -> Vec<Handle> {
        let mut released = Vec::new();
        let mut pending = vec![id];
        while let Some(id) = pending.pop() {
            if let Some(continuation) = self.detach(id) {
                debug!(?id, fiber = ?continuation.fiber, "continuation cancelled");
                pending.extend(continuation.children);
                released.push(continuation.fiber_handle);
            }
        }
        released
    }

    /// Cancels every continuation registered for `fiber`, in every list.
    pub fn cancel_fiber(&mut self, fiber: FiberId) -> Vec<Handle> {
        let Some(field) = self.owned.remove(&fiber) else {
            return Vec::new();
        };
        let (_, mut owned) = field.into_parts();
        let mut released = Vec::new();
        for id in owned.drain() {
            released.extend(self.cancel(id));
        }
        released
    }
}

impl Debug for Scheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Scheduler")
            .field("continuations", &self.continuations.len())
            .field("lists", &self.lists)
            .field("tick", &self.tick)
            .finish_non_exhaustive()
    }
}

/// An error raised by the [`Scheduler`].
#[derive(Debug, Clone, PartialEq)]
pub enum SchedulerError {
    /// A continuation was registered for a fiber that does not exist.
    UnknownFiber(FiberId),
    /// No continuation list has this name.
    UnknownList(Symbol),
    /// The continuation has already fired or been cancelled.
    UnknownContinuation,
    /// Events were posted to a list that does not accept them.
    EventsUnsupported(Symbol),
}

impl Display for SchedulerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedulerError::UnknownFiber(fiber) => write!(f, "unknown fiber {fiber:?}"),
            SchedulerError::UnknownList(list) => write!(f, "unknown continuation list {list}"),
            SchedulerError::UnknownContinuation => f.write_str("unknown continuation"),
            SchedulerError::EventsUnsupported(list) => {
                write!(f, "continuation list {list} does not accept events")
            }
        }
    }
}

impl std::error::Error for SchedulerError {}

impl crate::ErrorKind for SchedulerError {
    fn kind(&self) -> &'static str {
        match self {
            SchedulerError::UnknownFiber(_) => "unknown_fiber",
            SchedulerError::UnknownList(_) => "unknown_list",
            SchedulerError::UnknownContinuation => "unknown_continuation",
            SchedulerError::EventsUnsupported(_) => "events_unsupported",
        }
    }
}
