use std::path::PathBuf;

use thiserror::Error;

use crate::stages::koji::TaskState;

#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Invalid parameter: {0}")]
    Usage(String),

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error("Failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("Command `{command}` failed with exit code {code}")]
    CommandFailed {
        command: String,
        code: i32,
        stderr: String,
    },

    #[error("Command `{command}` timed out after {seconds}s")]
    Timeout { command: String, seconds: u64 },

    #[error("{0}")]
    Stage(String),

    #[error("Koji task {task_id} finished as {state}")]
    TaskFailed { task_id: u64, state: TaskState },

    #[error("Koji task {task_id} did not finish within {seconds}s")]
    TaskTimeout { task_id: u64, seconds: u64 },

    #[error("Polling koji task {task_id} failed: {source}")]
    TaskPoll {
        task_id: u64,
        #[source]
        source: Box<PipelineError>,
    },

    #[error("Malformed result document {}: {reason}", path.display())]
    MalformedResults { path: PathBuf, reason: String },

    #[error("No result documents to merge")]
    NoResults,

    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("JSON serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl PipelineError {
    /// Process exit code for this error.
    ///
    /// A failing external command hands its own exit status through; every
    /// other failure (including usage errors) exits with 1.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::CommandFailed { code, .. } if *code > 0 => *code,
            _ => 1,
        }
    }

    /// Koji task the error refers to, if any.
    pub fn task_id(&self) -> Option<u64> {
        match self {
            Self::TaskFailed { task_id, .. }
            | Self::TaskTimeout { task_id, .. }
            | Self::TaskPoll { task_id, .. } => Some(*task_id),
            _ => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, PipelineError>;
