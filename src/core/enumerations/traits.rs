use super::{
    instance::EntityInstance,
    policy::{DefaultFailurePolicy, FailurePolicy},
    types::{EntityInstanceId, PalResult},
};

/// A real-world object reported by a provider's discovery query.
#[derive(Debug, Clone, PartialEq)]
pub struct Observed<O> {
    pub id: EntityInstanceId,
    pub observation: O,
}

impl<O> Observed<O> {
    pub fn new(id: impl Into<EntityInstanceId>, observation: O) -> Self {
        Self {
            id: id.into(),
            observation,
        }
    }
}

/// The platform-specific half of an enumeration.
///
/// A provider owns the injected dependency objects and knows how to list the
/// current real-world objects and build instances for them. The generic
/// [`Enumeration`](super::enumeration::Enumeration) drives it through the
/// lifecycle and owns every instance it creates.
pub trait EntityProvider: Send + 'static {
    type Instance: EntityInstance;

    /// Per-object data delivered by [`EntityProvider::discover`].
    type Observation: Send;

    /// Short name, also the last segment of the log module path.
    const NAME: &'static str;

    /// Prepares the dependency objects. A failure aborts `init`.
    fn init(&mut self) -> PalResult<()> {
        Ok(())
    }

    /// Builds the total instance, called once during `init`.
    fn total_instance(&mut self) -> PalResult<Option<Self::Instance>> {
        Ok(None)
    }

    /// Lists the objects currently present.
    ///
    /// `Ok(None)` means fixed membership and skips reconciliation. An error
    /// means the membership source is unreachable and is fatal to the pass.
    fn discover(&mut self) -> PalResult<Option<Vec<Observed<Self::Observation>>>> {
        Ok(None)
    }

    /// Builds the instance for a newly discovered object.
    ///
    /// `Ok(None)` filters the object out of the enumeration.
    fn create(
        &mut self,
        _observed: Observed<Self::Observation>,
    ) -> PalResult<Option<Self::Instance>> {
        Ok(None)
    }

    /// Hands fresh discovery data to an instance that is still present.
    fn refresh(&mut self, _instance: &mut Self::Instance, _observation: Self::Observation) {}

    /// Whether `init` runs one instance refresh pass to seed data.
    fn seed_on_init(&self) -> bool {
        false
    }

    fn failure_policy(&self) -> Box<dyn FailurePolicy> {
        Box::new(DefaultFailurePolicy)
    }

    /// Releases dependency resources. Called once from `clean_up`.
    fn clean_up(&mut self) {}
}
