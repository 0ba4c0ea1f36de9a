//! Entity enumeration framework and the Linux enumerators built on it.
//!
//! [`enumeration::Enumeration`] is the generic engine: it owns the instances
//! a provider creates, reconciles them against each discovery pass and
//! isolates per-instance failures. Each enumerator module pairs a dependency
//! trait (the injected data source) with an [`traits::EntityProvider`].

pub mod enumeration;
pub mod error;
pub mod hostfs;
pub mod instance;
pub mod policy;
pub mod registry;
pub mod traits;
pub mod types;

pub mod bios;
pub mod computer_system;
pub mod cpu_properties;
pub mod logical_disk;
pub mod memory;
pub mod netroute;
pub mod network;
pub mod os;
pub mod physical_disk;
pub mod software;
