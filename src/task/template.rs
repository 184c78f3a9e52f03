//! Task templates as carried by task forms.
//!
//! Validation is parsing: a form body that deserializes into a [`TaskTemplate`]
//! and passes the reference checks below is a valid form. All operation and
//! strategy names are resolved here, fail-fast, never during execution.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use thiserror::Error;

use crate::callbacks::{RequestMethod, KNOWN_STRATEGIES};
use crate::processing::OpRegistry;

#[derive(Debug, Error)]
pub enum TemplateError {
    #[error("task body does not parse: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("task template has no subtasks")]
    NoSubtasks,

    #[error("subtask references unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("callback references unknown strategy '{0}'")]
    UnknownStrategy(String),

    #[error("callback '{callback}' references unknown output file key '{key}'")]
    UnknownFileKey { callback: String, key: String },
}

/// Location and naming of a file involved in a task.
///
/// `tmp_name` is the name within the task scratch dir; `remote_name` is the
/// name within the permanent bucket. A missing or empty `remote_name` means
/// the file is never uploaded.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileSpec {
    #[serde(default)]
    pub remote_name: Option<String>,
    pub tmp_name: String,
}

impl FileSpec {
    /// The upload target name, if the file should be uploaded at all.
    pub fn effective_remote(&self) -> Option<&str> {
        match self.remote_name.as_deref() {
            Some("") | None => None,
            Some(name) => Some(name),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SubtaskTemplate {
    pub name: String,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, Value>,
    #[serde(default)]
    pub input_files: HashMap<String, FileSpec>,
    #[serde(default)]
    pub output_files: HashMap<String, FileSpec>,
}

/// Callback as declared in a template: files are referenced by output key
/// and only bound to concrete [`FileSpec`]s when a task instance is built.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackTemplate {
    pub func_name: String,
    #[serde(default)]
    pub request_type: RequestMethod,
    pub endpoint: String,
    #[serde(default)]
    pub file: Option<String>,
    #[serde(default)]
    pub files_to_send: Vec<String>,
    #[serde(default)]
    pub kwargs: serde_json::Map<String, Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskTemplate {
    #[serde(default)]
    pub input_files: HashMap<String, FileSpec>,
    #[serde(default)]
    pub output_files: HashMap<String, FileSpec>,
    pub subtasks: Vec<SubtaskTemplate>,
    #[serde(default)]
    pub callbacks: Vec<CallbackTemplate>,
}

impl TaskTemplate {
    pub fn from_value(body: &Value, registry: &OpRegistry) -> Result<Self, TemplateError> {
        let template: TaskTemplate = serde_json::from_value(body.clone())?;
        template.validate(registry)?;
        Ok(template)
    }

    fn validate(&self, registry: &OpRegistry) -> Result<(), TemplateError> {
        if self.subtasks.is_empty() {
            return Err(TemplateError::NoSubtasks);
        }

        for subtask in &self.subtasks {
            if !registry.contains(&subtask.name) {
                return Err(TemplateError::UnknownOperation(subtask.name.clone()));
            }
        }

        let known_keys: Vec<&str> = self
            .output_files
            .keys()
            .map(|k| k.as_str())
            .chain(
                self.subtasks
                    .iter()
                    .flat_map(|s| s.output_files.keys().map(|k| k.as_str())),
            )
            .collect();

        for callback in &self.callbacks {
            if !KNOWN_STRATEGIES.contains(&callback.func_name.as_str()) {
                return Err(TemplateError::UnknownStrategy(callback.func_name.clone()));
            }
            for key in callback
                .file
                .iter()
                .chain(callback.files_to_send.iter())
            {
                if !known_keys.contains(&key.as_str()) {
                    return Err(TemplateError::UnknownFileKey {
                        callback: callback.func_name.clone(),
                        key: key.clone(),
                    });
                }
            }
        }

        Ok(())
    }
}
