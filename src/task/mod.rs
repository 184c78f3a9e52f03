//! Task model: immutable templates parsed from task forms, per-video task
//! instances built from them, and sequential execution.

mod builder;
mod executor;
mod template;

pub use builder::{build_task, Subtask, Task};
pub use executor::{ExecutionError, TaskExecutor};
pub use template::{
    CallbackTemplate, FileSpec, SubtaskTemplate, TaskTemplate, TemplateError,
};

#[cfg(test)]
pub(crate) use template::test_fixtures;
