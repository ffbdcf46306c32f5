//! CLI command implementations.

pub mod dump_log;
pub mod inspect;
pub mod scan;
pub mod verify;
