//! Sequential task execution against a scratch directory.

use std::collections::HashMap;
use std::path::Path;
use thiserror::Error;
use tracing::{debug, info};

use super::builder::Task;
use super::template::FileSpec;
use crate::processing::{OpContext, OpRegistry, ProcessingError};
use std::sync::Arc;

#[derive(Debug, Error)]
pub enum ExecutionError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Processing(#[from] ProcessingError),

    #[error("storage error: {0}")]
    Storage(#[source] anyhow::Error),

    #[error("subtask '{subtask}' did not produce declared output '{tmp_name}'")]
    MissingOutput { subtask: String, tmp_name: String },
}

/// Executes tasks: stages inputs into the scratch dir, runs the subtasks in
/// declared order, uploads outputs with non-empty remote names. Any failure
/// fails the whole task.
pub struct TaskExecutor {
    registry: Arc<OpRegistry>,
}

impl TaskExecutor {
    pub fn new(registry: Arc<OpRegistry>) -> Self {
        Self { registry }
    }

    pub async fn execute(&self, task: &Task, scratch: &Path) -> Result<(), ExecutionError> {
        tokio::fs::create_dir_all(scratch).await?;

        self.stage_inputs(&task.input_files, task, scratch)?;

        for subtask in &task.subtasks {
            // Subtask-only inputs still need staging; overlapping keys were
            // rebound to the task-level files staged above.
            let extra_inputs: HashMap<String, FileSpec> = subtask
                .input_files
                .iter()
                .filter(|(k, _)| !task.input_files.contains_key(*k))
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect();
            self.stage_inputs(&extra_inputs, task, scratch)?;

            let op = self.registry.resolve(&subtask.name)?;
            debug!("Executing subtask '{}' for task {}", subtask.name, task.id);
            op.run(OpContext {
                kwargs: &subtask.kwargs,
                input_files: &subtask.input_files,
                output_files: &subtask.output_files,
                work_dir: scratch,
            })
            .await?;

            for (key, file) in &subtask.output_files {
                if task.output_files.contains_key(key) {
                    continue;
                }
                self.upload_output(&subtask.name, file, task, scratch)?;
            }
        }

        for file in task.output_files.values() {
            self.upload_output("task", file, task, scratch)?;
        }

        info!(
            "Task {} completed, {} subtask(s) executed",
            task.id,
            task.subtasks.len()
        );
        Ok(())
    }

    fn stage_inputs(
        &self,
        files: &HashMap<String, FileSpec>,
        task: &Task,
        scratch: &Path,
    ) -> Result<(), ExecutionError> {
        for file in files.values() {
            if let Some(remote) = file.effective_remote() {
                task.storage
                    .download_file(remote, &scratch.join(&file.tmp_name), true)
                    .map_err(ExecutionError::Storage)?;
            }
        }
        Ok(())
    }

    fn upload_output(
        &self,
        producer: &str,
        file: &FileSpec,
        task: &Task,
        scratch: &Path,
    ) -> Result<(), ExecutionError> {
        let Some(remote) = file.effective_remote() else {
            return Ok(());
        };
        let local = scratch.join(&file.tmp_name);
        if !local.exists() {
            return Err(ExecutionError::MissingOutput {
                subtask: producer.to_string(),
                tmp_name: file.tmp_name.clone(),
            });
        }
        task.storage
            .upload(&local, remote)
            .map_err(ExecutionError::Storage)?;
        Ok(())
    }
}
