use std::{error::Error as StdError, fmt, panic::Location};

use thiserror::Error;

/// The kinds of failure raised by enumerations, instances and their dependency objects.
/// Uses `thiserror` for `Display`/`Error` derivation with context-rich messages.
#[derive(Error, Debug)]
pub enum ErrorKind {
    /// Failed to read a file from the host.
    /// Includes the file path and the underlying I/O error for debugging.
    #[error("Failed to read file {path}")]
    FileRead {
        path: String,
        #[source]
        source: std::io::Error,
    },

    /// A required file or directory path does not exist.
    #[error("Path not found: {path}")]
    PathNotFound { path: String },

    /// Encountered a parsing error while extracting a value.
    #[error("Failed to parse {metric} from {location}: {reason}")]
    ParseError {
        metric: String,
        location: String,
        reason: String,
    },

    /// A required field was not present in the source data.
    #[error("Missing required field: {field} in {location}")]
    MissingField { field: String, location: String },

    /// Data was found but did not conform to the expected format.
    #[error("Invalid format in {location}: {reason}")]
    InvalidFormat { location: String, reason: String },

    /// A low-level system call (e.g. statvfs) failed.
    #[error("System call failed: {syscall} - {reason}")]
    SystemCall { syscall: String, reason: String },

    /// Positional access beyond the per-item collection.
    #[error("Illegal index {index}, enumeration holds {size} instances")]
    IllegalIndex { index: usize, size: usize },

    /// No instance is registered under the requested id.
    #[error("Instance not found: {0}")]
    InstanceNotFound(String),

    /// An instance with the same id is already held.
    #[error("Duplicate instance id: {0}")]
    DuplicateInstance(String),

    /// A lifecycle call arrived in the wrong state, or an instance broke an invariant.
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// A configuration file could not be used.
    #[error("Invalid configuration file {path}: {reason}")]
    InvalidConfiguration { path: String, reason: String },

    /// An instance update panicked and the panic was contained.
    #[error("Instance update panicked: {0}")]
    InstancePanicked(String),

    /// Tried to build an enumeration by name, but it was not registered.
    #[error("Enumeration not found for: {0}")]
    EnumerationNotFound(String),

    /// The operation is not available on this platform or build.
    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// A catch-all for miscellaneous errors. Prefer a specific variant.
    #[error("Other error: {0}")]
    Other(String),
}

/// Error carrying a description and the source location that raised it.
///
/// Built from an [`ErrorKind`] either explicitly with [`PalError::new`] or
/// implicitly through `?`; both record the caller's location.
pub struct PalError {
    kind: ErrorKind,
    location: &'static Location<'static>,
}

impl PalError {
    #[track_caller]
    pub fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            location: Location::caller(),
        }
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.kind
    }

    pub fn into_kind(self) -> ErrorKind {
        self.kind
    }

    /// Source location where the error was raised.
    pub fn location(&self) -> &'static Location<'static> {
        self.location
    }

    /// `file:line` of [`PalError::location`].
    pub fn where_(&self) -> String {
        format!("{}:{}", self.location.file(), self.location.line())
    }
}

impl From<ErrorKind> for PalError {
    #[track_caller]
    fn from(kind: ErrorKind) -> Self {
        PalError::new(kind)
    }
}

impl fmt::Display for PalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.kind, f)
    }
}

impl fmt::Debug for PalError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PalError")
            .field("kind", &self.kind)
            .field("location", &self.where_())
            .finish()
    }
}

impl StdError for PalError {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.kind.source()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::enumerations::types::PalResult;

    fn fails() -> PalResult<()> {
        Err(ErrorKind::Other("boom".into()))?
    }

    #[test]
    fn display_uses_kind_message() {
        let err = PalError::new(ErrorKind::IllegalIndex { index: 4, size: 2 });
        assert_eq!(err.to_string(), "Illegal index 4, enumeration holds 2 instances");
    }

    #[test]
    fn location_points_at_this_file() {
        let err = PalError::new(ErrorKind::Other("x".into()));
        assert!(err.location().file().ends_with("error.rs"));
        assert!(err.where_().contains("error.rs:"));
    }

    #[test]
    fn question_mark_conversion_records_location() {
        let err = fails().unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::Other(m) if m == "boom"));
        assert!(err.location().file().ends_with("error.rs"));
    }

    #[test]
    fn source_is_forwarded_from_kind() {
        let err = PalError::new(ErrorKind::FileRead {
            path: "/proc/meminfo".into(),
            source: std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        });
        assert!(err.source().is_some());
        assert_eq!(err.to_string(), "Failed to read file /proc/meminfo");
    }
}
