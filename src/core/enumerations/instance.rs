//! The per-object half of the framework.
//!
//! An instance represents one discovered real-world object (a disk, an
//! interface, "the" BIOS). It owns an identifier, a total flag fixed at
//! construction and the unexpected-failure side channel filled in by the
//! owning enumeration when an update pass fails for this object.

use serde::Serialize;

use super::{error::PalError, types::PalResult};

/// Identity and failure bookkeeping shared by every instance type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstanceState {
    id: String,
    total: bool,
    unexpected: Option<String>,
}

impl InstanceState {
    /// State for a per-item instance.
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            total: false,
            unexpected: None,
        }
    }

    /// State for the total instance. Its id is empty.
    pub fn total() -> Self {
        Self::total_with_id("")
    }

    /// State for a total instance that carries an explicit id.
    pub fn total_with_id(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            total: true,
            unexpected: None,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_total(&self) -> bool {
        self.total
    }

    /// Records `err` as `"<description>; <file>:<line>"`.
    pub fn set_unexpected_error(&mut self, err: &PalError) {
        self.unexpected = Some(format!("{}; {}", err, err.where_()));
    }

    pub fn reset_unexpected_error(&mut self) {
        self.unexpected = None;
    }

    pub fn has_unexpected_error(&self) -> bool {
        self.unexpected.is_some()
    }

    /// Empty when no failure is recorded.
    pub fn unexpected_error_text(&self) -> &str {
        self.unexpected.as_deref().unwrap_or("")
    }
}

/// One discovered object tracked by an [`Enumeration`](super::enumeration::Enumeration).
///
/// Accessors are cheap and side-effect free; all expensive work happens in
/// [`EntityInstance::update`].
pub trait EntityInstance: Send + 'static {
    /// Serialisable facts exposed in snapshots.
    type Facts: Serialize + Clone + Send + Sync + 'static;

    fn state(&self) -> &InstanceState;

    fn state_mut(&mut self) -> &mut InstanceState;

    fn facts(&self) -> &Self::Facts;

    /// Refreshes the cached facts from the data source.
    ///
    /// Instances fed entirely by their enumeration's discovery data keep the
    /// default no-op.
    fn update(&mut self) -> PalResult<()> {
        Ok(())
    }

    /// Releases resources acquired during construction or update.
    /// Must be idempotent.
    fn clean_up(&mut self) {}

    fn id(&self) -> &str {
        self.state().id()
    }

    fn is_total(&self) -> bool {
        self.state().is_total()
    }

    fn set_unexpected_error(&mut self, err: &PalError) {
        self.state_mut().set_unexpected_error(err);
    }

    fn reset_unexpected_error(&mut self) {
        self.state_mut().reset_unexpected_error();
    }

    fn has_unexpected_error(&self) -> bool {
        self.state().has_unexpected_error()
    }

    fn unexpected_error_text(&self) -> &str {
        self.state().unexpected_error_text()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::enumerations::error::ErrorKind;

    struct Sensor {
        state: InstanceState,
    }

    impl EntityInstance for Sensor {
        type Facts = ();

        fn state(&self) -> &InstanceState {
            &self.state
        }

        fn state_mut(&mut self) -> &mut InstanceState {
            &mut self.state
        }

        fn facts(&self) -> &() {
            &()
        }
    }

    #[test]
    fn per_item_state_is_not_total() {
        let sensor = Sensor {
            state: InstanceState::new("eth0"),
        };
        assert_eq!(sensor.id(), "eth0");
        assert!(!sensor.is_total());
        assert!(!sensor.has_unexpected_error());
        assert_eq!(sensor.unexpected_error_text(), "");
    }

    #[test]
    fn total_state_has_empty_id() {
        let state = InstanceState::total();
        assert!(state.is_total());
        assert_eq!(state.id(), "");
    }

    #[test]
    fn unexpected_error_text_contains_description_and_location() {
        let mut sensor = Sensor {
            state: InstanceState::new("sda"),
        };
        let err = PalError::new(ErrorKind::Other("disk went away".into()));
        sensor.set_unexpected_error(&err);

        assert!(sensor.has_unexpected_error());
        let text = sensor.unexpected_error_text();
        assert!(text.starts_with("Other error: disk went away; "));
        assert!(text.contains("instance.rs:"));

        sensor.reset_unexpected_error();
        assert!(!sensor.has_unexpected_error());
        assert_eq!(sensor.unexpected_error_text(), "");
    }

    #[test]
    fn default_update_and_clean_up_are_noops() {
        let mut sensor = Sensor {
            state: InstanceState::new("x"),
        };
        assert!(sensor.update().is_ok());
        sensor.clean_up();
        sensor.clean_up();
        assert_eq!(sensor.id(), "x");
    }
}
