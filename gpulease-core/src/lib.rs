//! # gpulease-core
//!
//! Arbitration kernel for one shared accelerator.
//! Provides an exclusive FIFO lease, a phased and crash-safe handoff
//! protocol between the inference and training services, and a
//! debounced primary/standby health watchdog.

pub mod client;
pub mod collaborators;
pub mod error;
pub mod events;
pub mod handoff;
pub mod infrastructure;
#[path = "infrastructure_in_memory.rs"]
pub mod infrastructure_in_memory;
#[cfg(feature = "sqlite")]
#[path = "infrastructure_sqlite.rs"]
pub mod infrastructure_sqlite;
pub mod recovery;
pub mod registry;
pub mod types;
pub mod watchdog;

pub use error::{Error, Result};

#[cfg(test)]
mod mock;
#[cfg(test)]
mod registry_test;
