//! Periodic enumeration driver.
//!
//! The `Executor` owns the enabled enumerations, initialises them once,
//! then updates each of them every `collection_interval` seconds and hands
//! their snapshots to a [`Publisher`].

use std::{
    io::{self, Write},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use erased_serde::Serialize;
use tokio::time::{sleep, Duration, Instant};
use tracing::{debug, error, info, warn};

use super::enumerations::{enumeration::UpdateReport, registry::DynEnumeration, types::PalResult};
use crate::config::enumerations::EnumerationsConfig;

/// Destination for enumeration snapshots.
#[async_trait::async_trait]
pub trait Publisher: Send + Sync {
    async fn publish(
        &self,
        enumeration: &str,
        data: &(dyn Serialize + Send + Sync),
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>>;
}

/// Writes one JSON document per snapshot, newline separated.
pub struct JsonLinesPublisher<W> {
    writer: Mutex<W>,
}

impl<W: Write + Send> JsonLinesPublisher<W> {
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    pub fn into_inner(self) -> W {
        self.writer.into_inner().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Publishes to standard output.
pub type StdoutPublisher = JsonLinesPublisher<io::Stdout>;

impl Default for StdoutPublisher {
    fn default() -> Self {
        Self::new(io::stdout())
    }
}

#[async_trait::async_trait]
impl<W: Write + Send + 'static> Publisher for JsonLinesPublisher<W> {
    async fn publish(
        &self,
        _enumeration: &str,
        data: &(dyn Serialize + Send + Sync),
    ) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
        let line = serde_json::to_string(data)?;
        let mut writer = self.writer.lock().unwrap_or_else(PoisonError::into_inner);
        writeln!(writer, "{}", line)?;
        writer.flush()?;
        Ok(())
    }
}

/// One driven enumeration.
///
/// The enumeration stays owned here while an update runs on the blocking
/// pool, so cancelling a tick never loses it.
struct Slot {
    name: &'static str,
    enumeration: Arc<Mutex<Box<dyn DynEnumeration>>>,
}

impl Slot {
    fn new(enumeration: Box<dyn DynEnumeration>) -> Self {
        Self {
            name: enumeration.name(),
            enumeration: Arc::new(Mutex::new(enumeration)),
        }
    }

    /// Waits for any in-flight update. A poisoned lock is recovered.
    fn lock(&self) -> MutexGuard<'_, Box<dyn DynEnumeration>> {
        self.enumeration.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

type Snapshot = Box<dyn Serialize + Send + Sync>;

/// Runs one update pass and captures the resulting state.
fn update_and_snapshot(
    shared: &Mutex<Box<dyn DynEnumeration>>,
) -> PalResult<(UpdateReport, Snapshot)> {
    let mut enumeration = shared.lock().unwrap_or_else(PoisonError::into_inner);
    let report = enumeration.update(true)?;
    let snapshot = enumeration.snapshot();
    Ok((report, snapshot))
}

/// Drives a set of enumerations through their lifecycle.
pub struct Executor {
    publisher: Arc<dyn Publisher>,
    interval: Duration,
    slots: Vec<Slot>,
}

impl Executor {
    pub fn new(
        publisher: Arc<dyn Publisher>,
        config: &EnumerationsConfig,
        enumerations: Vec<Box<dyn DynEnumeration>>,
    ) -> Self {
        Self {
            publisher,
            interval: Duration::from_secs(config.collection_interval),
            slots: enumerations.into_iter().map(Slot::new).collect(),
        }
    }

    /// Names of the enumerations still being driven.
    pub fn names(&self) -> Vec<&'static str> {
        self.slots.iter().map(|slot| slot.name).collect()
    }

    /// Initialises every enumeration. Those that fail are logged and dropped.
    ///
    /// Returns the number of enumerations left.
    pub fn init_all(&mut self) -> usize {
        self.slots.retain(|slot| {
            let mut enumeration = slot.lock();
            match enumeration.init() {
                Ok(()) => {
                    info!(
                        "Enumeration '{}' initialized ({} instances{})",
                        slot.name,
                        enumeration.len(),
                        if enumeration.has_total() { " + total" } else { "" }
                    );
                    true
                }
                Err(e) => {
                    error!("Enumeration '{}' failed to initialize: {}", slot.name, e);
                    false
                }
            }
        });
        self.slots.len()
    }

    /// Updates every enumeration and publishes the snapshots.
    ///
    /// Updates run on the blocking pool, one task per enumeration. An
    /// enumeration whose update fails fatally or panics is not published
    /// this round but stays registered.
    /// Returns the number of snapshots published.
    pub async fn tick(&mut self) -> usize {
        let tasks: Vec<_> = self
            .slots
            .iter()
            .map(|slot| {
                let shared = Arc::clone(&slot.enumeration);
                let task = tokio::task::spawn_blocking(move || update_and_snapshot(&shared));
                (slot.name, task)
            })
            .collect();

        let mut published = 0;
        for (name, task) in tasks {
            let result = match task.await {
                Ok(result) => result,
                Err(e) => {
                    error!("Enumeration '{}' panicked during update: {}", name, e);
                    continue;
                }
            };
            match result {
                Ok((report, snapshot)) => {
                    debug!(
                        "Updated '{}': +{} -{} refreshed {} skipped {} failed {}",
                        name,
                        report.added.len(),
                        report.removed.len(),
                        report.refreshed,
                        report.skipped.len(),
                        report.failed.len()
                    );
                    match self.publisher.publish(name, &*snapshot).await {
                        Ok(()) => published += 1,
                        Err(e) => error!("Publish failed for '{}': {}", name, e),
                    }
                }
                Err(e) => error!("Update of '{}' failed: {}", name, e),
            }
        }
        published
    }

    /// Runs `tick` every interval until the future is dropped.
    pub async fn run(&mut self) {
        if self.slots.is_empty() {
            warn!("No enumerations to drive");
        }
        info!(
            "Enumeration updates started (interval: {}s)",
            self.interval.as_secs()
        );

        loop {
            let start = Instant::now();
            self.tick().await;

            let elapsed = start.elapsed();
            if elapsed < self.interval {
                sleep(self.interval - elapsed).await;
            } else {
                warn!(
                    "Update pass took {:?}, longer than the {}s interval",
                    elapsed,
                    self.interval.as_secs()
                );
            }
        }
    }

    /// Cleans up every enumeration.
    ///
    /// Blocks until updates left running by a cancelled tick have finished.
    pub fn shutdown(&mut self) {
        for slot in &self.slots {
            slot.lock().clean_up();
            debug!("Enumeration '{}' cleaned up", slot.name);
        }
    }
}
