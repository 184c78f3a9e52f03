//! Versioned SQLite schema infrastructure.
//!
//! Tables are declared as consts, created from the declaration, and validated
//! against the live database on every open. The schema version is tracked in
//! `PRAGMA user_version`, offset by [`BASE_DB_VERSION`] so that a database
//! created by an unrelated program is never mistaken for one of ours.

mod versioned_schema;

pub use versioned_schema::{Column, SqlType, Table, VersionedSchema, BASE_DB_VERSION};
