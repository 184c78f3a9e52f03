//! Durable node state: device facts, operating settings, water level time
//! series, task forms, video records, and the callback backlog.

mod models;
mod schema;
mod store;

pub use models::*;
pub use store::{NodeStore, SqliteNodeStore};
