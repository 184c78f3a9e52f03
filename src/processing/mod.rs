//! Registry of named processing operations.
//!
//! The velocimetry engine is an external collaborator: each operation a task
//! form may reference must be registered here by name before any form naming
//! it can be accepted. The production operation shells out to the engine
//! command; tests register lightweight operations in its place.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use thiserror::Error;
use tokio::process::Command;
use tracing::debug;

use crate::task::FileSpec;

#[derive(Debug, Error)]
pub enum ProcessingError {
    #[error("unknown operation '{0}'")]
    UnknownOperation(String),

    #[error("operation '{op}' failed: {stderr}")]
    OperationFailed { op: String, stderr: String },

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("invalid parameters: {0}")]
    InvalidParameters(String),
}

/// Everything an operation needs for one run, resolved to the task scratch dir.
pub struct OpContext<'a> {
    pub kwargs: &'a serde_json::Map<String, Value>,
    pub input_files: &'a HashMap<String, FileSpec>,
    pub output_files: &'a HashMap<String, FileSpec>,
    pub work_dir: &'a Path,
}

impl OpContext<'_> {
    pub fn input_path(&self, key: &str) -> Option<PathBuf> {
        self.input_files
            .get(key)
            .map(|f| self.work_dir.join(&f.tmp_name))
    }

    pub fn output_path(&self, key: &str) -> Option<PathBuf> {
        self.output_files
            .get(key)
            .map(|f| self.work_dir.join(&f.tmp_name))
    }
}

#[async_trait]
pub trait ProcessingOp: Send + Sync {
    async fn run(&self, ctx: OpContext<'_>) -> Result<(), ProcessingError>;
}

/// Operation that invokes the engine command with a JSON parameter file.
///
/// The engine is called as
/// `<program> <op> --params <work_dir>/<op>_params.json --workdir <work_dir>`
/// where the parameter file carries kwargs plus resolved input/output paths.
pub struct CommandOp {
    program: String,
    op_name: String,
}

impl CommandOp {
    pub fn new(program: impl Into<String>, op_name: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            op_name: op_name.into(),
        }
    }
}

#[async_trait]
impl ProcessingOp for CommandOp {
    async fn run(&self, ctx: OpContext<'_>) -> Result<(), ProcessingError> {
        let resolve = |files: &HashMap<String, FileSpec>| -> serde_json::Map<String, Value> {
            files
                .iter()
                .map(|(k, f)| {
                    (
                        k.clone(),
                        Value::String(ctx.work_dir.join(&f.tmp_name).to_string_lossy().into_owned()),
                    )
                })
                .collect()
        };

        let params = serde_json::json!({
            "kwargs": ctx.kwargs,
            "input_files": resolve(ctx.input_files),
            "output_files": resolve(ctx.output_files),
        });

        let params_path = ctx.work_dir.join(format!("{}_params.json", self.op_name));
        tokio::fs::write(&params_path, params.to_string()).await?;

        debug!("Running engine operation '{}'", self.op_name);
        let output = Command::new(&self.program)
            .arg(&self.op_name)
            .arg("--params")
            .arg(&params_path)
            .arg("--workdir")
            .arg(ctx.work_dir)
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .output()
            .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(ProcessingError::OperationFailed {
                op: self.op_name.clone(),
                stderr,
            });
        }
        Ok(())
    }
}

/// Named operation registry. Operation names are resolved here fail-fast
/// when a task form is validated, never during execution.
#[derive(Default, Clone)]
pub struct OpRegistry {
    ops: HashMap<String, Arc<dyn ProcessingOp>>,
}

impl OpRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry whose operations all shell out to `program`.
    pub fn with_engine(program: &str, op_names: &[String]) -> Self {
        let mut registry = Self::new();
        for name in op_names {
            registry.register(name.clone(), Arc::new(CommandOp::new(program, name.clone())));
        }
        registry
    }

    pub fn register(&mut self, name: impl Into<String>, op: Arc<dyn ProcessingOp>) {
        self.ops.insert(name.into(), op);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.ops.contains_key(name)
    }

    pub fn resolve(&self, name: &str) -> Result<Arc<dyn ProcessingOp>, ProcessingError> {
        self.ops
            .get(name)
            .cloned()
            .ok_or_else(|| ProcessingError::UnknownOperation(name.to_string()))
    }

    pub fn op_names(&self) -> Vec<&str> {
        self.ops.keys().map(|s| s.as_str()).collect()
    }
}
