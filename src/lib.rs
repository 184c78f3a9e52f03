//! Rivernode library.
//!
//! Exposes the internal modules for integration testing and reuse.

pub mod callbacks;
pub mod config;
pub mod disk;
pub mod node_store;
pub mod processing;
pub mod processor;
pub mod sqlite_persistence;
pub mod storage;
pub mod system;
pub mod task;
pub mod task_form;
pub mod water_level;

pub use node_store::{NodeStore, SqliteNodeStore};
pub use processor::LocalTaskProcessor;
