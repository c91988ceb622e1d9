//! Loading machine types and creating fibers from them.

use std::sync::Arc;

use kempt::Map;

use crate::exemplar::Exemplar;
use crate::fiber::Fiber;
use crate::runtime::pool::{OwnerKey, ValuePool, WeakHandle};
use crate::runtime::symbol::Symbol;
use crate::Error;

/// A source of machine images, looked up by machine name.
pub trait ExemplarSource: Send {
    /// Returns the image of the machine named `name`, if one exists.
    fn exemplar(&self, name: &Symbol) -> Option<Exemplar>;
}

impl<F> ExemplarSource for F
where
    F: Fn(&Symbol) -> Option<Exemplar> + Send,
{
    fn exemplar(&self, name: &Symbol) -> Option<Exemplar> {
        self(name)
    }
}

/// An in-memory collection of machine images.
#[derive(Debug, Clone, Default)]
pub struct Programs(Map<Symbol, Exemplar>);

impl Programs {
    /// Returns an empty collection.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds `exemplar` under its own name and returns self.
    #[must_use]
    pub fn with(mut self, exemplar: Exemplar) -> Self {
        self.insert(exemplar);
        self
    }

    /// Adds `exemplar` under its own name, replacing any previous image.
    pub fn insert(&mut self, exemplar: Exemplar) {
        self.0.insert(exemplar.name().clone(), exemplar);
    }
}

impl ExemplarSource for Programs {
    fn exemplar(&self, name: &Symbol) -> Option<Exemplar> {
        self.0.get(name).cloned()
    }
}

/// A machine type that has been loaded into an engine.
#[derive(Debug)]
pub struct MachineEntry {
    name: Symbol,
    exemplar: Arc<Exemplar>,
    shared: Vec<WeakHandle>,
}

impl MachineEntry {
    /// Returns the machine's name.
    #[must_use]
    pub const fn name(&self) -> &Symbol {
        &self.name
    }

    /// Returns the engine's private copy of the machine's image.
    #[must_use]
    pub fn exemplar(&self) -> &Exemplar {
        &self.exemplar
    }

    /// Returns the slots of the machine's shared variables, in declaration
    /// order.
    #[must_use]
    pub fn shared(&self) -> &[WeakHandle] {
        &self.shared
    }
}

/// The machine types an engine has loaded, keyed by name.
pub struct MachineCache {
    source: Box<dyn ExemplarSource>,
    entries: Map<Symbol, MachineEntry>,
}

impl MachineCache {
    /// Returns an empty cache that loads images from `source`.
    pub fn new(source: impl ExemplarSource + 'static) -> Self {
        Self {
            source: Box::new(source),
            entries: Map::new(),
        }
    }

    /// Returns the entry for `name` if it has been loaded.
    #[must_use]
    pub fn get(&self, name: &Symbol) -> Option<&MachineEntry> {
        self.entries.get(name)
    }

    /// Returns the number of loaded machine types.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no machine types have been loaded.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Returns a new fiber of the machine type `name`.
    ///
    /// The first time a name is instantiated its image is fetched from the
    /// source, validated, and stored, and its shared variables are declared
    /// in `pool`. The returned fiber has no canonical slot or instance
    /// variables yet.
    pub fn instantiate(&mut self, name: &Symbol, pool: &mut ValuePool) -> Result<Fiber, Error> {
        let entry = self.load(name, pool)?;
        Ok(Fiber::new(entry.name.clone(), entry.exemplar.clone()))
    }

    fn load(&mut self, name: &Symbol, pool: &mut ValuePool) -> Result<&MachineEntry, Error> {
        if self.entries.get(name).is_none() {
            let exemplar = self
                .source
                .exemplar(name)
                .ok_or_else(|| crate::fiber::Fault::UnknownMachine(name.clone()))?;
            exemplar.validate()?;

            let owner = OwnerKey::Machine(name.clone());
            let mut shared = Vec::with_capacity(exemplar.shared().len());
            if let Err(err) = declare_shared(&exemplar, &owner, pool, &mut shared) {
                for weak in shared {
                    let _ = pool.release_weak(weak.handle());
                }
                pool.release_owner(&owner);
                return Err(err);
            }
            info!(machine = %name, shared = shared.len(), "machine loaded");
            self.entries.insert(
                name.clone(),
                MachineEntry {
                    name: name.clone(),
                    exemplar: Arc::new(exemplar),
                    shared,
                },
            );
        }
        self.entries
            .get(name)
            .ok_or_else(|| crate::fiber::Fault::UnknownMachine(name.clone()).into())
    }
}

fn declare_shared(
    exemplar: &Exemplar,
    owner: &OwnerKey,
    pool: &mut ValuePool,
    shared: &mut Vec<WeakHandle>,
) -> Result<(), Error> {
    for descriptor in exemplar.shared() {
        let (variable, ty) = exemplar.describe(descriptor)?;
        let handle = pool.declare(owner.clone(), variable, ty.initial_value())?;
        shared.push(pool.downgrade(handle)?);
    }
    Ok(())
}

impl std::fmt::Debug for MachineCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MachineCache")
            .field("entries", &self.entries)
            .finish_non_exhaustive()
    }
}
