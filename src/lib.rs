//! blazebee-pal — platform abstraction layer for host inventory.
//!
//! Discovers facts about the machine (BIOS, memory, operating system, CPUs,
//! disks, network interfaces, routes, installed software) and keeps them
//! current through a uniform enumeration lifecycle: `init`, repeated
//! `update`, `clean_up`.
//!
//! ## Modules
//!
//! * `config` — TOML configuration with `validator` rules.
//! * `core` — the enumeration engine, the concrete Linux enumerators, named
//!   log handles and the executor that updates and publishes snapshots.
//! * `logger` — `tracing` subscriber setup (console and journald).
//!
//! ## Features
//!
//! Each enumerator is gated by an `enumeration-*` feature. The `minimal`,
//! `standard` and `large` features select common sets.

pub mod config;
pub mod core;
pub mod logger;
