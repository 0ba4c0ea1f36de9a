use super::error::PalError;

/// A convenient type alias for results returned by enumerations and their
/// dependency objects.
///
/// Every fallible operation in the framework (reading host files, parsing,
/// lifecycle calls, positional access) reports a `PalError`, which carries
/// both the failure kind and the source location that raised it.
pub type PalResult<T> = std::result::Result<T, PalError>;

/// Identifier of an instance within its enumeration's namespace.
///
/// Stable across updates for the same real-world object and used as the join
/// key during reconciliation. Empty only for a total instance.
pub type EntityInstanceId = String;
