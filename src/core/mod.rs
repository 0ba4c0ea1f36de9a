//! Runtime components: the enumeration framework, log handles and the
//! periodic executor.

pub mod enumerations;
pub mod executor;
pub mod log;
