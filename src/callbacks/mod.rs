//! Callbacks reported to the remote platform after task execution.
//!
//! A callback names a delivery strategy (how its HTTP body is built), an
//! endpoint suffix and the files it draws from. Callbacks are serializable
//! so that failed deliveries can be parked in the durable backlog and
//! retried later without the task that produced them.

mod client;

pub use client::{read_discharge_results, CallbackClient, DeliveryError};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use crate::storage::Storage;
use crate::task::FileSpec;

/// Strategy keys a task form may reference.
pub const KNOWN_STRATEGIES: &[&str] = &["discharge", "video"];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum RequestMethod {
    #[default]
    #[serde(rename = "POST")]
    Post,
    #[serde(rename = "PATCH")]
    Patch,
}

/// A fully materialized callback, bound to the bucket its files live in.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Callback {
    pub func_name: String,
    #[serde(default)]
    pub request_type: RequestMethod,
    pub endpoint: String,
    pub timestamp: DateTime<Utc>,
    /// Bucket the referenced files live in. Files are resolved against the
    /// permanent bucket rather than the task scratch dir, so a parked
    /// callback stays deliverable after the scratch dir is gone.
    pub storage: Option<Storage>,
    #[serde(default)]
    pub file: Option<FileSpec>,
    #[serde(default)]
    pub files_to_send: HashMap<String, FileSpec>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, serde_json::Value>,
}
