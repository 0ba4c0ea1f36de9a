//! Classification of instance-level failures.

use super::error::{ErrorKind, PalError};

/// How a failure raised while creating or updating one instance is treated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    /// Known data gap. Logged at trace, the instance flag stays clear.
    Expected,
    /// Recorded on the instance and logged at warning.
    Unexpected,
    /// Aborts the pass and propagates to the caller.
    Fatal,
}

/// Decides the [`FailureClass`] of a failure attributable to instance `id`.
pub trait FailurePolicy: Send + Sync {
    fn classify(&self, id: &str, err: &PalError) -> FailureClass;
}

/// Every instance failure is unexpected.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultFailurePolicy;

impl FailurePolicy for DefaultFailurePolicy {
    fn classify(&self, _id: &str, _err: &PalError) -> FailureClass {
        FailureClass::Unexpected
    }
}

/// Vanished paths and missing fields are expected, everything else unexpected.
///
/// Suits objects that can disappear between discovery and update.
#[derive(Debug, Default, Clone, Copy)]
pub struct ExpectedKinds;

impl FailurePolicy for ExpectedKinds {
    fn classify(&self, _id: &str, err: &PalError) -> FailureClass {
        match err.kind() {
            ErrorKind::PathNotFound { .. } | ErrorKind::MissingField { .. } => {
                FailureClass::Expected
            }
            _ => FailureClass::Unexpected,
        }
    }
}

impl<F> FailurePolicy for F
where
    F: Fn(&str, &PalError) -> FailureClass + Send + Sync,
{
    fn classify(&self, id: &str, err: &PalError) -> FailureClass {
        self(id, err)
    }
}
