//! Building a concrete task instance from a template.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use uuid::Uuid;

use super::template::{FileSpec, TaskTemplate};
use crate::callbacks::Callback;
use crate::storage::Storage;

/// Key under which the incoming video is bound into the task inputs.
pub const VIDEO_INPUT_KEY: &str = "videofile";

/// Timestamp format substituted into `{}` placeholders in remote names.
const REMOTE_NAME_TS_FMT: &str = "%Y%m%dT%H%M%S";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Subtask {
    pub name: String,
    pub kwargs: serde_json::Map<String, Value>,
    pub input_files: HashMap<String, FileSpec>,
    pub output_files: HashMap<String, FileSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Task {
    pub id: Uuid,
    pub timestamp: DateTime<Utc>,
    pub water_level: f64,
    pub storage: Storage,
    pub input_files: HashMap<String, FileSpec>,
    pub output_files: HashMap<String, FileSpec>,
    pub subtasks: Vec<Subtask>,
    pub callbacks: Vec<Callback>,
}

fn substitute_timestamp(spec: &FileSpec, timestamp: &DateTime<Utc>) -> FileSpec {
    let stamp = timestamp.format(REMOTE_NAME_TS_FMT).to_string();
    FileSpec {
        remote_name: spec
            .remote_name
            .as_ref()
            .map(|name| name.replace("{}", &stamp)),
        tmp_name: spec.tmp_name.clone(),
    }
}

/// Build a task instance for one video.
///
/// The template is never mutated: everything is cloned, the video file is
/// bound under [`VIDEO_INPUT_KEY`], `{}` placeholders in output remote names
/// are replaced with the video timestamp, subtask file keys that overlap the
/// task-level maps are rebound to the task's concrete files, the resolved
/// water level and relative output dir are injected into the first subtask's
/// kwargs, and callbacks are materialized with their files bound.
pub fn build_task(
    template: &TaskTemplate,
    id: Uuid,
    timestamp: DateTime<Utc>,
    water_level: f64,
    video_file_name: &str,
    storage: Storage,
) -> Task {
    let mut input_files: HashMap<String, FileSpec> = template
        .input_files
        .iter()
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    input_files.insert(
        VIDEO_INPUT_KEY.to_string(),
        FileSpec {
            remote_name: Some(video_file_name.to_string()),
            tmp_name: video_file_name.to_string(),
        },
    );

    let output_files: HashMap<String, FileSpec> = template
        .output_files
        .iter()
        .map(|(k, v)| (k.clone(), substitute_timestamp(v, &timestamp)))
        .collect();

    let mut subtasks: Vec<Subtask> = template
        .subtasks
        .iter()
        .map(|s| {
            let sub_inputs = s
                .input_files
                .iter()
                .map(|(k, v)| {
                    let spec = input_files.get(k).cloned().unwrap_or_else(|| v.clone());
                    (k.clone(), spec)
                })
                .collect();
            let sub_outputs = s
                .output_files
                .iter()
                .map(|(k, v)| {
                    let spec = output_files
                        .get(k)
                        .cloned()
                        .unwrap_or_else(|| substitute_timestamp(v, &timestamp));
                    (k.clone(), spec)
                })
                .collect();
            Subtask {
                name: s.name.clone(),
                kwargs: s.kwargs.clone(),
                input_files: sub_inputs,
                output_files: sub_outputs,
            }
        })
        .collect();

    if let Some(first) = subtasks.first_mut() {
        first
            .kwargs
            .insert("h_a".to_string(), Value::from(water_level));
        first
            .kwargs
            .insert("output".to_string(), Value::from("output"));
    }

    // All output keys visible to callbacks, task-level entries winning.
    let mut callback_outputs: HashMap<&str, &FileSpec> = HashMap::new();
    for subtask in &subtasks {
        for (k, v) in &subtask.output_files {
            callback_outputs.insert(k.as_str(), v);
        }
    }
    for (k, v) in &output_files {
        callback_outputs.insert(k.as_str(), v);
    }

    let callbacks: Vec<Callback> = template
        .callbacks
        .iter()
        .map(|c| Callback {
            func_name: c.func_name.clone(),
            request_type: c.request_type,
            endpoint: c.endpoint.clone(),
            timestamp,
            storage: Some(storage.clone()),
            file: c
                .file
                .as_deref()
                .and_then(|key| callback_outputs.get(key).map(|f| (*f).clone())),
            files_to_send: c
                .files_to_send
                .iter()
                .filter_map(|key| {
                    callback_outputs
                        .get(key.as_str())
                        .map(|f| (key.clone(), (*f).clone()))
                })
                .collect(),
            kwargs: c.kwargs.clone(),
        })
        .collect();

    Task {
        id,
        timestamp,
        water_level,
        storage,
        input_files,
        output_files,
        subtasks,
        callbacks,
    }
}
