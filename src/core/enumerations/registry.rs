use std::{collections::HashMap, sync::Arc};

use erased_serde::Serialize;

use super::{
    enumeration::{Enumeration, Lifecycle, UpdateReport},
    error::ErrorKind,
    traits::EntityProvider,
    types::PalResult,
};
use crate::{config::enumerations::EnumerationsConfig, core::log::LogRegistry};

/// Object-safe view of an [`Enumeration`], so enumerations of different
/// instance types can be driven uniformly by the executor.
pub trait DynEnumeration: Send {
    /// Name the enumeration was registered under.
    fn name(&self) -> &'static str;

    fn lifecycle(&self) -> Lifecycle;

    fn init(&mut self) -> PalResult<()>;

    fn update(&mut self, update_instances: bool) -> PalResult<UpdateReport>;

    fn clean_up(&mut self);

    /// Number of per-item instances.
    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn has_total(&self) -> bool;

    /// Owned, serialisable snapshot of the current state.
    fn snapshot(&self) -> Box<dyn Serialize + Send + Sync>;
}

impl<P> DynEnumeration for Enumeration<P>
where
    P: EntityProvider,
{
    fn name(&self) -> &'static str {
        P::NAME
    }

    fn lifecycle(&self) -> Lifecycle {
        Enumeration::lifecycle(self)
    }

    fn init(&mut self) -> PalResult<()> {
        Enumeration::init(self)
    }

    fn update(&mut self, update_instances: bool) -> PalResult<UpdateReport> {
        Enumeration::update(self, update_instances)
    }

    fn clean_up(&mut self) {
        Enumeration::clean_up(self)
    }

    fn len(&self) -> usize {
        Enumeration::len(self)
    }

    fn has_total(&self) -> bool {
        self.total_instance().is_some()
    }

    fn snapshot(&self) -> Box<dyn Serialize + Send + Sync> {
        Box::new(Enumeration::snapshot(self))
    }
}

/// Everything a factory needs to build an enumeration with its Linux
/// dependency objects.
#[derive(Debug, Clone)]
pub struct EnumerationContext {
    pub logs: Arc<LogRegistry>,
    pub config: Arc<EnumerationsConfig>,
}

impl EnumerationContext {
    pub fn new(logs: Arc<LogRegistry>, config: Arc<EnumerationsConfig>) -> Self {
        Self { logs, config }
    }
}

/// Builds a fresh, uninitialised enumeration.
pub type EnumerationFactory = fn(&EnumerationContext) -> Box<dyn DynEnumeration>;

/// Metadata for one enumeration, submitted to the `inventory` collection.
pub struct EnumerationMeta {
    pub name: &'static str,
    pub factory: EnumerationFactory,
}

// Tell the `inventory` crate to collect all submitted `EnumerationMeta` values.
inventory::collect!(EnumerationMeta);

/// Factories of every enumeration compiled into this build.
///
/// Constructed explicitly by the caller; each `build` returns a new,
/// exclusively owned enumeration.
pub struct EnumerationRegistry {
    factories: HashMap<&'static str, EnumerationFactory>,
}

impl EnumerationRegistry {
    /// Collects every submitted [`EnumerationMeta`].
    pub fn new() -> Self {
        let factories = inventory::iter::<EnumerationMeta>
            .into_iter()
            .map(|meta| (meta.name, meta.factory))
            .collect();
        EnumerationRegistry { factories }
    }

    pub fn get(&self, name: &str) -> PalResult<EnumerationFactory> {
        self.factories
            .get(name)
            .copied()
            .ok_or_else(|| ErrorKind::EnumerationNotFound(name.to_string()).into())
    }

    /// Builds the enumeration registered as `name`.
    pub fn build(&self, name: &str, ctx: &EnumerationContext) -> PalResult<Box<dyn DynEnumeration>> {
        let factory = self.get(name)?;
        Ok(factory(ctx))
    }

    /// Registered names, sorted.
    pub fn list_names(&self) -> Vec<&'static str> {
        let mut names: Vec<_> = self.factories.keys().copied().collect();
        names.sort_unstable();
        names
    }

    pub fn contains(&self, name: &str) -> bool {
        self.factories.contains_key(name)
    }

    pub fn len(&self) -> usize {
        self.factories.len()
    }

    pub fn is_empty(&self) -> bool {
        self.factories.is_empty()
    }
}

impl Default for EnumerationRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Registers an enumeration factory with the inventory at compile time.
///
/// ```ignore
/// register_enumeration!("memory", |ctx| {
///     Box::new(Enumeration::new(MemoryProvider::new(deps), &ctx.logs))
/// });
/// ```
#[macro_export]
macro_rules! register_enumeration {
    ($name:expr, $factory:expr) => {
        inventory::submit! {
            $crate::core::enumerations::registry::EnumerationMeta {
                name: $name,
                factory: $factory,
            }
        }
    };
}
