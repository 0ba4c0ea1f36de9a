//! Named log handles for enumerations.
//!
//! Handles are acquired by dotted module path (`blazebee.pal.memory`) from an
//! explicitly constructed [`LogRegistry`] and emit `tracing` events tagged with
//! that path. Logging through a handle never fails.

use std::{
    collections::{HashMap, HashSet},
    fmt,
    sync::{Arc, Mutex, PoisonError},
};

use serde::{Deserialize, Serialize};

/// Root of every module path handed out by [`LogRegistry::for_enumeration`].
pub const MODULE_ROOT: &str = "blazebee.pal";

/// Log severity, least to most severe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Severity {
    /// Finer than trace, for per-line parsing chatter.
    Hysterical,
    Trace,
    Info,
    Warning,
    Error,
}

impl fmt::Display for Severity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Severity::Hysterical => "hysterical",
            Severity::Trace => "trace",
            Severity::Info => "info",
            Severity::Warning => "warning",
            Severity::Error => "error",
        };
        f.write_str(s)
    }
}

/// A named log handle. Cloning is cheap.
#[derive(Debug, Clone)]
pub struct LogHandle {
    module: Arc<str>,
}

impl LogHandle {
    fn new(module: &str) -> Self {
        Self {
            module: Arc::from(module),
        }
    }

    pub fn module(&self) -> &str {
        &self.module
    }

    pub fn log(&self, severity: Severity, message: impl fmt::Display) {
        let module = &*self.module;
        match severity {
            Severity::Hysterical => tracing::trace!(module, hysterical = true, "{}", message),
            Severity::Trace => tracing::trace!(module, "{}", message),
            Severity::Info => tracing::info!(module, "{}", message),
            Severity::Warning => tracing::warn!(module, "{}", message),
            Severity::Error => tracing::error!(module, "{}", message),
        }
    }

    pub fn hysterical(&self, message: impl fmt::Display) {
        self.log(Severity::Hysterical, message);
    }

    pub fn trace(&self, message: impl fmt::Display) {
        self.log(Severity::Trace, message);
    }

    pub fn info(&self, message: impl fmt::Display) {
        self.log(Severity::Info, message);
    }

    pub fn warning(&self, message: impl fmt::Display) {
        self.log(Severity::Warning, message);
    }

    pub fn error(&self, message: impl fmt::Display) {
        self.log(Severity::Error, message);
    }
}

/// Thread-safe cache of log handles keyed by module path.
#[derive(Debug, Default)]
pub struct LogRegistry {
    handles: Mutex<HashMap<String, LogHandle>>,
}

impl LogRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the handle for `module`, creating it on first use.
    pub fn handle(&self, module: &str) -> LogHandle {
        let mut handles = self.handles.lock().unwrap_or_else(PoisonError::into_inner);
        handles
            .entry(module.to_string())
            .or_insert_with(|| LogHandle::new(module))
            .clone()
    }

    /// Handle for `blazebee.pal.<name>`.
    pub fn for_enumeration(&self, name: &str) -> LogHandle {
        self.handle(&format!("{}.{}", MODULE_ROOT, name))
    }

    pub fn len(&self) -> usize {
        self.handles
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Logs the first occurrence of a key loudly and later ones quietly.
#[derive(Debug)]
pub struct LogSuppressor {
    initial: Severity,
    drop_to: Severity,
    seen: Mutex<HashSet<String>>,
}

impl LogSuppressor {
    pub fn new(initial: Severity, drop_to: Severity) -> Self {
        Self {
            initial,
            drop_to,
            seen: Mutex::new(HashSet::new()),
        }
    }

    /// Severity to use for this occurrence of `key`.
    pub fn severity(&self, key: &str) -> Severity {
        let mut seen = self.seen.lock().unwrap_or_else(PoisonError::into_inner);
        if seen.insert(key.to_string()) {
            self.initial
        } else {
            self.drop_to
        }
    }

    /// Forgets `key` so its next occurrence is logged at the initial severity again.
    pub fn reset(&self, key: &str) {
        self.seen
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }
}
