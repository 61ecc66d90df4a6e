//! Domain Layer
//!
//! Entities, value objects, ports and pure services of the sync engine.
//! Nothing in here performs I/O.

pub mod entities;
pub mod errors;
pub mod ports;
pub mod services;
pub mod value_objects;

pub use errors::{StorageError, SyncError};
