//! The generic collection and lifecycle engine.
//!
//! An [`Enumeration`] owns an ordered, id-keyed set of instances plus an
//! optional total instance and drives them through
//! `Uninitialized -> Initialized -> CleanedUp`. Each `update` first reconciles
//! membership against the provider's discovery query and then refreshes every
//! live instance, isolating per-instance failures according to the
//! enumeration's [`FailurePolicy`].

use std::{
    any::Any,
    fmt,
    ops::Index,
    panic::{self, AssertUnwindSafe},
};

use indexmap::{map::Values, map::ValuesMut, IndexMap};
use serde::Serialize;

use super::{
    error::{ErrorKind, PalError},
    instance::EntityInstance,
    policy::{FailureClass, FailurePolicy},
    traits::{EntityProvider, Observed},
    types::{EntityInstanceId, PalResult},
};
use crate::core::log::{LogHandle, LogRegistry, LogSuppressor, Severity};

/// Unexpected failures logged at warning per enumeration before dropping to trace.
pub const REPORTED_FAILURE_LIMIT: usize = 10;

/// Lifecycle of an enumeration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Lifecycle {
    Uninitialized,
    Initialized,
    CleanedUp,
}

/// What one `update` call changed.
#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct UpdateReport {
    /// Ids added by reconciliation, in insertion order.
    pub added: Vec<EntityInstanceId>,
    /// Ids removed by reconciliation.
    pub removed: Vec<EntityInstanceId>,
    /// Instances whose update succeeded.
    pub refreshed: usize,
    /// Instances whose update failed with an expected failure.
    pub skipped: Vec<EntityInstanceId>,
    /// Instances whose update failed unexpectedly and now carry the failure.
    pub failed: Vec<EntityInstanceId>,
}

impl UpdateReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Serialisable view of one instance.
#[derive(Debug, Clone, Serialize)]
pub struct InstanceSnapshot<F> {
    pub id: EntityInstanceId,
    pub is_total: bool,
    /// The last update failed unexpectedly; `facts` may be outdated.
    pub stale: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub facts: F,
}

impl<F: Clone> InstanceSnapshot<F> {
    fn of<I: EntityInstance<Facts = F>>(instance: &I) -> Self {
        let stale = instance.has_unexpected_error();
        Self {
            id: instance.id().to_string(),
            is_total: instance.is_total(),
            stale,
            error: stale.then(|| instance.unexpected_error_text().to_string()),
            facts: instance.facts().clone(),
        }
    }
}

/// Serialisable view of a whole enumeration.
#[derive(Debug, Clone, Serialize)]
pub struct EnumerationSnapshot<F> {
    pub enumeration: &'static str,
    pub total: Option<InstanceSnapshot<F>>,
    pub instances: Vec<InstanceSnapshot<F>>,
}

/// Logs instance failures: the first occurrence per instance at warning, up to
/// [`REPORTED_FAILURE_LIMIT`] warnings per enumeration, everything else at trace.
struct FailureLog {
    log: LogHandle,
    suppressor: LogSuppressor,
    reported: usize,
}

impl FailureLog {
    fn new(log: LogHandle) -> Self {
        Self {
            log,
            suppressor: LogSuppressor::new(Severity::Warning, Severity::Trace),
            reported: 0,
        }
    }

    fn unexpected(&mut self, phase: &str, id: &str, err: &PalError) {
        let mut severity = self.suppressor.severity(&suppression_key(phase, id));
        if severity >= Severity::Warning {
            if self.reported >= REPORTED_FAILURE_LIMIT {
                severity = Severity::Trace;
            } else {
                self.reported += 1;
            }
        }
        self.log.log(
            severity,
            format_args!(
                "{} of instance '{}' failed: {}; {}",
                phase,
                display_id(id),
                err,
                err.where_()
            ),
        );
    }

    fn expected(&self, phase: &str, id: &str, err: &PalError) {
        self.log.trace(format_args!(
            "{} of instance '{}' skipped: {}",
            phase,
            display_id(id),
            err
        ));
    }

    fn recovered(&self, phase: &str, id: &str) {
        self.suppressor.reset(&suppression_key(phase, id));
        self.log
            .info(format_args!("instance '{}' recovered", display_id(id)));
    }
}

fn suppression_key(phase: &str, id: &str) -> String {
    format!("{}:{}", phase, id)
}

fn display_id(id: &str) -> &str {
    if id.is_empty() {
        "<total>"
    } else {
        id
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

/// Runs one instance update with a clean side channel, containing panics.
fn run_update<I: EntityInstance>(instance: &mut I) -> PalResult<()> {
    instance.reset_unexpected_error();
    match panic::catch_unwind(AssertUnwindSafe(|| instance.update())) {
        Ok(result) => result,
        Err(payload) => Err(PalError::new(ErrorKind::InstancePanicked(panic_message(
            payload.as_ref(),
        )))),
    }
}

/// Updates one instance and applies the failure policy.
///
/// Only a fatal failure is returned.
fn refresh_one<I: EntityInstance>(
    instance: &mut I,
    policy: &dyn FailurePolicy,
    failures: &mut FailureLog,
    report: &mut UpdateReport,
) -> PalResult<()> {
    let had_failure = instance.has_unexpected_error();
    let err = match run_update(instance) {
        Ok(()) => {
            if had_failure {
                failures.recovered("update", instance.id());
            }
            report.refreshed += 1;
            return Ok(());
        }
        Err(err) => err,
    };

    let id = instance.id().to_string();
    match policy.classify(&id, &err) {
        FailureClass::Fatal => {
            failures.log.error(format_args!(
                "update of instance '{}' failed fatally: {}",
                display_id(&id),
                err
            ));
            instance.set_unexpected_error(&err);
            Err(err)
        }
        FailureClass::Expected => {
            failures.expected("update", &id, &err);
            report.skipped.push(id);
            Ok(())
        }
        FailureClass::Unexpected => {
            instance.set_unexpected_error(&err);
            failures.unexpected("update", &id, &err);
            report.failed.push(id);
            Ok(())
        }
    }
}

/// Generic enumeration over the instances built by provider `P`.
pub struct Enumeration<P: EntityProvider> {
    provider: P,
    instances: IndexMap<EntityInstanceId, P::Instance>,
    total: Option<P::Instance>,
    lifecycle: Lifecycle,
    policy: Box<dyn FailurePolicy>,
    failures: FailureLog,
}

impl<P: EntityProvider> Enumeration<P> {
    /// Wraps `provider`, taking its log handle from `logs`.
    pub fn new(provider: P, logs: &LogRegistry) -> Self {
        let policy = provider.failure_policy();
        Self {
            provider,
            instances: IndexMap::new(),
            total: None,
            lifecycle: Lifecycle::Uninitialized,
            policy,
            failures: FailureLog::new(logs.for_enumeration(P::NAME)),
        }
    }

    pub fn name(&self) -> &'static str {
        P::NAME
    }

    pub fn lifecycle(&self) -> Lifecycle {
        self.lifecycle
    }

    pub fn provider(&self) -> &P {
        &self.provider
    }

    pub fn provider_mut(&mut self) -> &mut P {
        &mut self.provider
    }

    pub fn log(&self) -> &LogHandle {
        &self.failures.log
    }

    /// Replaces the provider's default failure policy.
    pub fn set_failure_policy(&mut self, policy: impl FailurePolicy + 'static) {
        self.policy = Box::new(policy);
    }

    /// Populates the initial member set and the total instance.
    ///
    /// On failure everything built so far is cleaned up and dropped and the
    /// enumeration stays uninitialised.
    pub fn init(&mut self) -> PalResult<()> {
        match self.lifecycle {
            Lifecycle::Uninitialized => {}
            Lifecycle::Initialized => return Err(self.violation("init called twice")),
            Lifecycle::CleanedUp => return Err(self.violation("init called after clean_up")),
        }

        if let Err(err) = self.try_init() {
            self.failures
                .log
                .error(format_args!("init failed: {}; {}", err, err.where_()));
            self.discard_instances();
            return Err(err);
        }

        self.lifecycle = Lifecycle::Initialized;
        self.failures.log.trace(format_args!(
            "initialized with {} instances, total: {}",
            self.instances.len(),
            self.total.is_some()
        ));
        Ok(())
    }

    fn try_init(&mut self) -> PalResult<()> {
        self.provider.init()?;
        if let Some(total) = self.provider.total_instance()? {
            self.set_total_instance(total)?;
        }
        self.reconcile()?;
        if self.provider.seed_on_init() {
            let mut report = UpdateReport::default();
            self.refresh_instances(&mut report)?;
        }
        Ok(())
    }

    /// Reconciles membership, then refreshes every live instance and the total
    /// when `update_instances` is set.
    ///
    /// Instance failures are recorded on the instance; only fatal failures
    /// (unreachable membership source, or a failure the policy marks fatal)
    /// are returned.
    pub fn update(&mut self, update_instances: bool) -> PalResult<UpdateReport> {
        self.ensure_initialized("update")?;

        let mut report = self.reconcile()?;
        if update_instances {
            self.refresh_instances(&mut report)?;
        }

        if !report.added.is_empty() || !report.removed.is_empty() {
            self.failures.log.trace(format_args!(
                "membership changed: +{:?} -{:?}",
                report.added, report.removed
            ));
        }
        Ok(report)
    }

    /// Cleans up every instance including the total, clears the collection
    /// and releases the provider's resources. Further calls are no-ops.
    pub fn clean_up(&mut self) {
        if self.lifecycle == Lifecycle::CleanedUp {
            self.failures.log.trace("clean_up called again, ignoring");
            return;
        }
        self.discard_instances();
        self.provider.clean_up();
        self.lifecycle = Lifecycle::CleanedUp;
    }

    /// Applies the provider's discovery result to the collection.
    ///
    /// Discovery and construction of new instances run before anything is
    /// mutated, so a fatal failure leaves the collection as it was.
    fn reconcile(&mut self) -> PalResult<UpdateReport> {
        let mut report = UpdateReport::default();
        let Some(observed) = self.provider.discover()? else {
            return Ok(report);
        };

        let mut current: IndexMap<EntityInstanceId, P::Observation> =
            IndexMap::with_capacity(observed.len());
        for Observed { id, observation } in observed {
            if id.is_empty() {
                self.failures
                    .log
                    .warning("discovery reported an object without id, skipping");
                continue;
            }
            if current.contains_key(&id) {
                self.failures
                    .log
                    .hysterical(format_args!("duplicate discovery of '{}' ignored", id));
                continue;
            }
            current.insert(id, observation);
        }

        let vanished: Vec<EntityInstanceId> = self
            .instances
            .keys()
            .filter(|id| !current.contains_key(*id))
            .cloned()
            .collect();

        let mut fresh: Vec<P::Instance> = Vec::new();
        let mut still_present = Vec::new();
        for (id, observation) in current {
            if self.instances.contains_key(&id) {
                still_present.push((id, observation));
                continue;
            }
            match self.create_instance(id, observation) {
                Ok(Some(instance)) => fresh.push(instance),
                Ok(None) => {}
                Err(err) => {
                    for mut instance in fresh {
                        instance.clean_up();
                    }
                    return Err(err);
                }
            }
        }

        for id in vanished {
            if let Some(mut instance) = self.instances.shift_remove(&id) {
                instance.clean_up();
                report.removed.push(id);
            }
        }

        for (id, observation) in still_present {
            if let Some(instance) = self.instances.get_mut(&id) {
                self.provider.refresh(instance, observation);
            }
        }

        for instance in fresh {
            let id = instance.id().to_string();
            self.instances.insert(id.clone(), instance);
            report.added.push(id);
        }

        Ok(report)
    }

    fn create_instance(
        &mut self,
        id: EntityInstanceId,
        observation: P::Observation,
    ) -> PalResult<Option<P::Instance>> {
        let created = self.provider.create(Observed {
            id: id.clone(),
            observation,
        });
        match created {
            Ok(Some(mut instance)) => {
                if instance.is_total() || instance.id() != id {
                    instance.clean_up();
                    return Err(PalError::new(ErrorKind::InvalidState(format!(
                        "provider built instance '{}' (total: {}) for discovered object '{}'",
                        instance.id(),
                        instance.is_total(),
                        id
                    ))));
                }
                Ok(Some(instance))
            }
            Ok(None) => {
                self.failures
                    .log
                    .hysterical(format_args!("'{}' filtered out", id));
                Ok(None)
            }
            Err(err) => match self.policy.classify(&id, &err) {
                FailureClass::Fatal => Err(err),
                FailureClass::Expected => {
                    self.failures.expected("creation", &id, &err);
                    Ok(None)
                }
                FailureClass::Unexpected => {
                    self.failures.unexpected("creation", &id, &err);
                    Ok(None)
                }
            },
        }
    }

    fn refresh_instances(&mut self, report: &mut UpdateReport) -> PalResult<()> {
        for instance in self.instances.values_mut() {
            refresh_one(instance, self.policy.as_ref(), &mut self.failures, report)?;
        }
        if let Some(total) = self.total.as_mut() {
            refresh_one(total, self.policy.as_ref(), &mut self.failures, report)?;
        }
        Ok(())
    }

    fn discard_instances(&mut self) {
        for instance in self.instances.values_mut() {
            instance.clean_up();
        }
        self.instances.clear();
        if let Some(mut total) = self.total.take() {
            total.clean_up();
        }
    }

    #[track_caller]
    fn ensure_initialized(&self, operation: &str) -> PalResult<()> {
        match self.lifecycle {
            Lifecycle::Initialized => Ok(()),
            Lifecycle::Uninitialized => {
                Err(self.violation(&format!("{} called before init", operation)))
            }
            Lifecycle::CleanedUp => {
                Err(self.violation(&format!("{} called after clean_up", operation)))
            }
        }
    }

    #[track_caller]
    fn violation(&self, message: &str) -> PalError {
        self.failures.log.error(message);
        PalError::new(ErrorKind::InvalidState(message.to_string()))
    }

    pub fn total_instance(&self) -> Option<&P::Instance> {
        self.total.as_ref()
    }

    pub fn total_instance_mut(&mut self) -> Option<&mut P::Instance> {
        self.total.as_mut()
    }

    /// Number of per-item instances. The total is not counted.
    pub fn len(&self) -> usize {
        self.instances.len()
    }

    pub fn is_empty(&self) -> bool {
        self.instances.is_empty()
    }

    /// Per-item instance at `index` in insertion order.
    pub fn get(&self, index: usize) -> PalResult<&P::Instance> {
        let size = self.instances.len();
        self.instances
            .get_index(index)
            .map(|(_, instance)| instance)
            .ok_or_else(|| ErrorKind::IllegalIndex { index, size }.into())
    }

    pub fn get_mut(&mut self, index: usize) -> PalResult<&mut P::Instance> {
        let size = self.instances.len();
        self.instances
            .get_index_mut(index)
            .map(|(_, instance)| instance)
            .ok_or_else(|| ErrorKind::IllegalIndex { index, size }.into())
    }

    pub fn get_by_id(&self, id: &str) -> Option<&P::Instance> {
        self.instances.get(id)
    }

    pub fn get_by_id_mut(&mut self, id: &str) -> Option<&mut P::Instance> {
        self.instances.get_mut(id)
    }

    pub fn position(&self, id: &str) -> Option<usize> {
        self.instances.get_index_of(id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.instances.contains_key(id)
    }

    /// Per-item instances in insertion order. Never yields the total.
    pub fn iter(&self) -> Values<'_, EntityInstanceId, P::Instance> {
        self.instances.values()
    }

    pub fn iter_mut(&mut self) -> ValuesMut<'_, EntityInstanceId, P::Instance> {
        self.instances.values_mut()
    }

    pub fn instance_ids(&self) -> impl Iterator<Item = &str> + '_ {
        self.instances.keys().map(String::as_str)
    }

    /// Adds a per-item instance outside of reconciliation.
    pub fn add_instance(&mut self, instance: P::Instance) -> PalResult<()> {
        if self.lifecycle == Lifecycle::CleanedUp {
            return Err(self.violation("add_instance called after clean_up"));
        }
        if instance.is_total() {
            return Err(ErrorKind::InvalidState(
                "total instance passed to add_instance".to_string(),
            )
            .into());
        }
        if instance.id().is_empty() {
            return Err(ErrorKind::InvalidState(
                "per-item instance with empty id".to_string(),
            )
            .into());
        }
        if self.instances.contains_key(instance.id()) {
            return Err(ErrorKind::DuplicateInstance(instance.id().to_string()).into());
        }
        self.instances.insert(instance.id().to_string(), instance);
        Ok(())
    }

    /// Installs the total instance, cleaning up any previous one.
    pub fn set_total_instance(&mut self, instance: P::Instance) -> PalResult<()> {
        if self.lifecycle == Lifecycle::CleanedUp {
            return Err(self.violation("set_total_instance called after clean_up"));
        }
        if !instance.is_total() {
            return Err(ErrorKind::InvalidState(format!(
                "instance '{}' is not a total instance",
                instance.id()
            ))
            .into());
        }
        if let Some(mut previous) = self.total.replace(instance) {
            previous.clean_up();
        }
        Ok(())
    }

    /// Removes and cleans up the instance with `id`.
    pub fn remove_instance_by_id(&mut self, id: &str) -> PalResult<()> {
        let mut instance = self
            .instances
            .shift_remove(id)
            .ok_or_else(|| PalError::new(ErrorKind::InstanceNotFound(id.to_string())))?;
        instance.clean_up();
        Ok(())
    }

    /// Updates the single instance with `id`, applying the failure policy.
    ///
    /// Returns whether the update succeeded.
    pub fn update_instance(&mut self, id: &str) -> PalResult<bool> {
        self.ensure_initialized("update_instance")?;
        let instance = self
            .instances
            .get_mut(id)
            .ok_or_else(|| PalError::new(ErrorKind::InstanceNotFound(id.to_string())))?;
        let mut report = UpdateReport::default();
        refresh_one(instance, self.policy.as_ref(), &mut self.failures, &mut report)?;
        Ok(report.refreshed == 1)
    }

    /// Updates the instance at `index`, applying the failure policy.
    pub fn update_instance_at(&mut self, index: usize) -> PalResult<bool> {
        self.ensure_initialized("update_instance_at")?;
        let size = self.instances.len();
        let (_, instance) = self
            .instances
            .get_index_mut(index)
            .ok_or_else(|| PalError::new(ErrorKind::IllegalIndex { index, size }))?;
        let mut report = UpdateReport::default();
        refresh_one(instance, self.policy.as_ref(), &mut self.failures, &mut report)?;
        Ok(report.refreshed == 1)
    }

    pub fn snapshot(&self) -> EnumerationSnapshot<<P::Instance as EntityInstance>::Facts> {
        EnumerationSnapshot {
            enumeration: P::NAME,
            total: self.total.as_ref().map(InstanceSnapshot::of),
            instances: self.instances.values().map(InstanceSnapshot::of).collect(),
        }
    }
}

impl<P: EntityProvider> Index<usize> for Enumeration<P> {
    type Output = P::Instance;

    /// Panics when `index` is out of range; use [`Enumeration::get`] to check.
    fn index(&self, index: usize) -> &Self::Output {
        match self.instances.get_index(index) {
            Some((_, instance)) => instance,
            None => panic!(
                "index {} out of range for enumeration '{}' of {} instances",
                index,
                P::NAME,
                self.instances.len()
            ),
        }
    }
}

impl<'a, P: EntityProvider> IntoIterator for &'a Enumeration<P> {
    type Item = &'a P::Instance;
    type IntoIter = Values<'a, EntityInstanceId, P::Instance>;

    fn into_iter(self) -> Self::IntoIter {
        self.iter()
    }
}

impl<P: EntityProvider> fmt::Debug for Enumeration<P> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Enumeration")
            .field("name", &P::NAME)
            .field("lifecycle", &self.lifecycle)
            .field("instances", &self.instances.keys().collect::<Vec<_>>())
            .field("total", &self.total.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        collections::{HashMap, HashSet},
        sync::{Arc, Mutex, PoisonError},
    };

    use tracing_test::traced_test;

    use super::*;
    use crate::core::enumerations::{instance::InstanceState, policy::ExpectedKinds};

    #[derive(Default)]
    struct Source {
        members: Option<Vec<&'static str>>,
        with_total: bool,
        value: u64,
        failing: HashSet<String>,
        missing: HashSet<String>,
        panicking: HashSet<String>,
        create_failing: HashSet<String>,
        created: u64,
        updates: HashMap<String, usize>,
        cleanups: HashMap<String, usize>,
        provider_cleanups: usize,
    }

    type Shared = Arc<Mutex<Source>>;

    fn lock(source: &Shared) -> std::sync::MutexGuard<'_, Source> {
        source.lock().unwrap_or_else(PoisonError::into_inner)
    }

    #[derive(Debug, Clone, Serialize, PartialEq)]
    struct Facts {
        value: u64,
        generation: u64,
    }

    struct Sensor {
        state: InstanceState,
        facts: Facts,
        source: Shared,
    }

    impl EntityInstance for Sensor {
        type Facts = Facts;

        fn state(&self) -> &InstanceState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut InstanceState {
            &mut self.state
        }

        fn facts(&self) -> &Facts {
            &self.facts
        }

        fn update(&mut self) -> PalResult<()> {
            let id = self.state.id().to_string();
            let mut source = lock(&self.source);
            *source.updates.entry(id.clone()).or_default() += 1;
            if source.panicking.contains(&id) {
                drop(source);
                panic!("{} panicked", id);
            }
            if source.missing.contains(&id) {
                return Err(ErrorKind::PathNotFound { path: id }.into());
            }
            if source.failing.contains(&id) {
                return Err(ErrorKind::Other(format!("{} exploded", id)).into());
            }
            self.facts.value = source.value;
            Ok(())
        }

        fn clean_up(&mut self) {
            let mut source = lock(&self.source);
            *source
                .cleanups
                .entry(self.state.id().to_string())
                .or_default() += 1;
        }
    }

    struct Provider {
        source: Shared,
        seed: bool,
    }

    impl Provider {
        fn sensor(&self, state: InstanceState) -> Sensor {
            let mut source = lock(&self.source);
            source.created += 1;
            Sensor {
                state,
                facts: Facts {
                    value: 0,
                    generation: source.created,
                },
                source: self.source.clone(),
            }
        }
    }

    impl EntityProvider for Provider {
        type Instance = Sensor;
        type Observation = ();
        const NAME: &'static str = "sensors";

        fn total_instance(&mut self) -> PalResult<Option<Sensor>> {
            let with_total = lock(&self.source).with_total;
            Ok(with_total.then(|| self.sensor(InstanceState::total())))
        }

        fn discover(&mut self) -> PalResult<Option<Vec<Observed<()>>>> {
            match &lock(&self.source).members {
                Some(members) => Ok(Some(
                    members.iter().map(|id| Observed::new(*id, ())).collect(),
                )),
                None => Err(ErrorKind::Other("membership source unreachable".into()).into()),
            }
        }

        fn create(&mut self, observed: Observed<()>) -> PalResult<Option<Sensor>> {
            if lock(&self.source).create_failing.contains(&observed.id) {
                return Err(ErrorKind::Other(format!("cannot open {}", observed.id)).into());
            }
            Ok(Some(self.sensor(InstanceState::new(observed.id))))
        }

        fn seed_on_init(&self) -> bool {
            self.seed
        }

        fn clean_up(&mut self) {
            lock(&self.source).provider_cleanups += 1;
        }
    }

    fn setup(members: &[&'static str], with_total: bool) -> (Enumeration<Provider>, Shared) {
        let source = Arc::new(Mutex::new(Source {
            members: Some(members.to_vec()),
            with_total,
            value: 1,
            ..Default::default()
        }));
        let provider = Provider {
            source: source.clone(),
            seed: false,
        };
        (Enumeration::new(provider, &LogRegistry::new()), source)
    }

    fn ids(enumeration: &Enumeration<Provider>) -> Vec<&str> {
        enumeration.instance_ids().collect()
    }

    fn generation(enumeration: &Enumeration<Provider>, id: &str) -> u64 {
        enumeration.get_by_id(id).unwrap().facts.generation
    }

    #[test]
    fn init_then_clean_up_never_updates() {
        let (mut e, source) = setup(&["a", "b"], true);
        e.init().unwrap();
        assert_eq!(e.len(), 2);
        e.clean_up();

        assert!(e.is_empty());
        assert!(e.total_instance().is_none());
        let source = lock(&source);
        assert!(source.updates.is_empty());
        assert_eq!(source.cleanups.get("a"), Some(&1));
        assert_eq!(source.cleanups.get("b"), Some(&1));
        assert_eq!(source.cleanups.get(""), Some(&1));
        assert_eq!(source.provider_cleanups, 1);
    }

    #[test]
    fn seeded_init_updates_once() {
        let source = Arc::new(Mutex::new(Source {
            members: Some(vec!["a"]),
            with_total: true,
            value: 7,
            ..Default::default()
        }));
        let provider = Provider {
            source: source.clone(),
            seed: true,
        };
        let mut e = Enumeration::new(provider, &LogRegistry::new());
        e.init().unwrap();

        assert_eq!(e[0].facts.value, 7);
        assert_eq!(e.total_instance().unwrap().facts.value, 7);
        assert_eq!(lock(&source).updates.get("a"), Some(&1));
    }

    #[test]
    fn reconciliation_keeps_survivors_and_replaces_vanished() {
        let (mut e, source) = setup(&["a", "b"], false);
        e.init().unwrap();
        let b_generation = generation(&e, "b");

        lock(&source).members = Some(vec!["b", "c"]);
        let report = e.update(true).unwrap();

        assert_eq!(ids(&e), vec!["b", "c"]);
        assert_eq!(report.added, vec!["c".to_string()]);
        assert_eq!(report.removed, vec!["a".to_string()]);
        assert_eq!(report.refreshed, 2);
        assert_eq!(generation(&e, "b"), b_generation);

        let source = lock(&source);
        assert_eq!(source.cleanups.get("a"), Some(&1));
        assert_eq!(source.cleanups.get("b"), None);
        assert_eq!(source.updates.get("c"), Some(&1));
        assert_eq!(source.updates.get("a"), None);
    }

    #[test]
    fn membership_only_update_preserves_error_flags() {
        let (mut e, source) = setup(&["a", "b"], false);
        e.init().unwrap();

        lock(&source).failing.insert("b".into());
        e.update(true).unwrap();
        assert!(e.get_by_id("b").unwrap().has_unexpected_error());

        lock(&source).members = Some(vec!["b", "c"]);
        e.update(false).unwrap();

        let b = e.get_by_id("b").unwrap();
        assert!(b.has_unexpected_error());
        assert!(b.unexpected_error_text().contains("b exploded"));
        assert_eq!(lock(&source).updates.get("c"), None);
        assert_eq!(e.get_by_id("c").unwrap().facts.value, 0);
    }

    #[test]
    fn one_failing_instance_does_not_stop_siblings() {
        let (mut e, source) = setup(&["a", "b", "c", "d"], false);
        e.init().unwrap();
        {
            let mut source = lock(&source);
            source.failing.insert("c".into());
            source.value = 42;
        }

        let report = e.update(true).unwrap();
        assert_eq!(report.refreshed, 3);
        assert_eq!(report.failed, vec!["c".to_string()]);
        assert!(!report.is_clean());

        for instance in &e {
            if instance.id() == "c" {
                assert!(instance.has_unexpected_error());
                assert!(instance.unexpected_error_text().contains("c exploded"));
                assert_eq!(instance.facts.value, 0);
            } else {
                assert!(!instance.has_unexpected_error());
                assert_eq!(instance.facts.value, 42);
            }
        }
    }

    #[test]
    fn recovered_instance_clears_its_flag() {
        let (mut e, source) = setup(&["a"], false);
        e.init().unwrap();
        lock(&source).failing.insert("a".into());
        e.update(true).unwrap();
        assert!(e[0].has_unexpected_error());

        lock(&source).failing.clear();
        let report = e.update(true).unwrap();
        assert!(report.is_clean());
        assert!(!e[0].has_unexpected_error());
    }

    #[test]
    fn panicking_instance_is_contained() {
        let (mut e, source) = setup(&["a", "b"], false);
        e.init().unwrap();
        lock(&source).panicking.insert("a".into());

        let report = e.update(true).unwrap();
        assert_eq!(report.failed, vec!["a".to_string()]);
        assert!(e[0].unexpected_error_text().contains("a panicked"));
        assert_eq!(e[1].facts.value, 1);
    }

    #[test]
    fn discovery_failure_propagates_and_keeps_state() {
        let (mut e, source) = setup(&["a", "b"], false);
        e.init().unwrap();
        lock(&source).value = 5;
        e.update(true).unwrap();

        {
            let mut source = lock(&source);
            source.members = None;
            source.value = 99;
        }
        let err = e.update(true).unwrap_err();
        assert!(err.to_string().contains("membership source unreachable"));
        assert_eq!(ids(&e), vec!["a", "b"]);
        assert!(e.iter().all(|i| i.facts.value == 5));
        assert!(lock(&source).cleanups.is_empty());
    }

    #[test]
    fn fatal_creation_failure_leaves_collection_untouched() {
        let (mut e, source) = setup(&["a"], false);
        e.init().unwrap();
        e.set_failure_policy(|_: &str, _: &PalError| FailureClass::Fatal);

        {
            let mut source = lock(&source);
            source.members = Some(vec!["b", "c"]);
            source.create_failing.insert("c".into());
        }
        assert!(e.update(true).is_err());
        assert_eq!(ids(&e), vec!["a"]);
        let source = lock(&source);
        assert_eq!(source.cleanups.get("a"), None);
        assert_eq!(source.cleanups.get("b"), Some(&1));
    }

    #[test]
    #[traced_test]
    fn unexpected_creation_failure_skips_object() {
        let (mut e, source) = setup(&["a", "b"], false);
        lock(&source).create_failing.insert("b".into());
        e.init().unwrap();

        assert_eq!(ids(&e), vec!["a"]);
        assert!(logs_contain("creation of instance 'b' failed"));

        lock(&source).create_failing.clear();
        let report = e.update(false).unwrap();
        assert_eq!(report.added, vec!["b".to_string()]);
    }

    #[test]
    fn fatal_update_policy_propagates() {
        let (mut e, source) = setup(&["a", "b"], false);
        e.init().unwrap();
        e.set_failure_policy(|id: &str, _: &PalError| {
            if id == "a" {
                FailureClass::Fatal
            } else {
                FailureClass::Unexpected
            }
        });
        lock(&source).failing.insert("a".into());

        let err = e.update(true).unwrap_err();
        assert!(err.to_string().contains("a exploded"));
        assert_eq!(lock(&source).updates.get("b"), None);
    }

    #[test]
    fn expected_failures_leave_flag_clear() {
        let (mut e, source) = setup(&["a", "b"], false);
        e.init().unwrap();
        e.set_failure_policy(ExpectedKinds);
        lock(&source).missing.insert("a".into());

        let report = e.update(true).unwrap();
        assert_eq!(report.skipped, vec!["a".to_string()]);
        assert!(report.failed.is_empty());
        assert!(!e[0].has_unexpected_error());
    }

    #[test]
    fn total_is_never_iterated() {
        let (mut e, _source) = setup(&["a"], true);
        e.init().unwrap();

        let total = e.total_instance().unwrap();
        assert!(total.is_total());
        assert_eq!(total.id(), "");
        assert_eq!(e.len(), 1);
        assert!(e.iter().all(|i| !i.is_total()));

        let (mut e, _source) = setup(&["a"], false);
        e.init().unwrap();
        assert!(e.total_instance().is_none());
    }

    #[test]
    fn failing_total_is_flagged_and_reported() {
        let (mut e, source) = setup(&["a"], true);
        e.init().unwrap();

        lock(&source).failing.insert(String::new());
        let report = e.update(true).unwrap();
        assert_eq!(report.failed, vec![String::new()]);
        assert_eq!(report.refreshed, 1);
        assert!(!e[0].has_unexpected_error());
        let total = e.total_instance().unwrap();
        assert!(total.has_unexpected_error());
        assert!(total.unexpected_error_text().contains("exploded"));

        lock(&source).failing.clear();
        let report = e.update(true).unwrap();
        assert!(report.failed.is_empty());
        assert_eq!(report.refreshed, 2);
        assert!(!e.total_instance().unwrap().has_unexpected_error());
    }

    #[test]
    fn total_only_enumeration_updates_total() {
        let source = Arc::new(Mutex::new(Source {
            members: None,
            with_total: true,
            value: 3,
            ..Default::default()
        }));

        struct TotalOnly(Provider);
        impl EntityProvider for TotalOnly {
            type Instance = Sensor;
            type Observation = ();
            const NAME: &'static str = "total-only";

            fn total_instance(&mut self) -> PalResult<Option<Sensor>> {
                self.0.total_instance()
            }
        }

        let mut e = Enumeration::new(
            TotalOnly(Provider {
                source: source.clone(),
                seed: false,
            }),
            &LogRegistry::new(),
        );
        e.init().unwrap();
        let report = e.update(true).unwrap();
        assert_eq!(report.refreshed, 1);
        assert!(e.is_empty());
        assert_eq!(e.total_instance().unwrap().facts.value, 3);
    }

    #[test]
    fn positional_access_reports_illegal_index() {
        let (mut e, _source) = setup(&["a", "b"], false);
        e.init().unwrap();

        assert_eq!(e.get(1).unwrap().id(), "b");
        assert_eq!(e.position("b"), Some(1));
        let Err(err) = e.get(2) else {
            panic!("index 2 of 2 should be rejected");
        };
        assert!(matches!(
            err.kind(),
            ErrorKind::IllegalIndex { index: 2, size: 2 }
        ));
    }

    #[test]
    #[should_panic(expected = "out of range")]
    fn index_operator_panics_out_of_range() {
        let (mut e, _source) = setup(&["a"], false);
        e.init().unwrap();
        let _ = &e[5];
    }

    #[test]
    #[traced_test]
    fn lifecycle_violations_are_contained() {
        let (mut e, _source) = setup(&["a"], false);
        let err = e.update(true).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InvalidState(_)));
        assert!(logs_contain("update called before init"));

        e.init().unwrap();
        assert!(e.init().is_err());

        e.clean_up();
        e.clean_up();
        assert_eq!(e.lifecycle(), Lifecycle::CleanedUp);
        assert!(e.update(true).is_err());
        assert!(e.init().is_err());
        assert!(e.update_instance("a").is_err());
    }

    #[test]
    fn failed_init_rolls_back() {
        let (mut e, source) = setup(&["a"], true);
        lock(&source).members = None;

        assert!(e.init().is_err());
        assert_eq!(e.lifecycle(), Lifecycle::Uninitialized);
        assert!(e.total_instance().is_none());
        assert_eq!(lock(&source).cleanups.get(""), Some(&1));

        lock(&source).members = Some(vec!["a"]);
        e.init().unwrap();
        assert_eq!(e.len(), 1);
    }

    #[test]
    fn manual_membership_operations() {
        let (mut e, source) = setup(&[], false);
        e.init().unwrap();

        let sensor = e.provider().sensor(InstanceState::new("x"));
        e.add_instance(sensor).unwrap();
        let duplicate = e.provider().sensor(InstanceState::new("x"));
        let err = e.add_instance(duplicate).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::DuplicateInstance(_)));

        let total = e.provider().sensor(InstanceState::total());
        assert!(e.add_instance(total).is_err());

        assert!(e.update_instance("x").unwrap());
        assert!(e.update_instance_at(0).unwrap());
        assert_eq!(lock(&source).updates.get("x"), Some(&2));

        e.remove_instance_by_id("x").unwrap();
        assert!(e.is_empty());
        assert_eq!(lock(&source).cleanups.get("x"), Some(&1));
        assert!(matches!(
            e.remove_instance_by_id("x").unwrap_err().kind(),
            ErrorKind::InstanceNotFound(_)
        ));
    }

    #[test]
    #[traced_test]
    fn warnings_drop_to_trace_after_limit() {
        let members: Vec<&'static str> = vec![
            "i0", "i1", "i2", "i3", "i4", "i5", "i6", "i7", "i8", "i9", "i10", "i11",
        ];
        let (mut e, source) = setup(&members, false);
        e.init().unwrap();
        {
            let mut source = lock(&source);
            for id in &members {
                source.failing.insert(id.to_string());
            }
        }
        let report = e.update(true).unwrap();
        assert_eq!(report.failed.len(), 12);
        assert_eq!(e.failures.reported, REPORTED_FAILURE_LIMIT);
        assert!(logs_contain("update of instance 'i0' failed"));
    }

    #[test]
    fn snapshot_flags_stale_instances() {
        let (mut e, source) = setup(&["a", "b"], true);
        e.init().unwrap();
        lock(&source).failing.insert("b".into());
        e.update(true).unwrap();

        let json = serde_json::to_value(e.snapshot()).unwrap();
        assert_eq!(json["enumeration"], "sensors");
        assert_eq!(json["total"]["is_total"], true);
        assert_eq!(json["instances"][0]["stale"], false);
        assert!(json["instances"][0].get("error").is_none());
        assert_eq!(json["instances"][1]["stale"], true);
        assert!(json["instances"][1]["error"]
            .as_str()
            .unwrap()
            .contains("b exploded"));
    }
}
