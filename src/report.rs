use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::{Map, Value};

use crate::error::{PipelineError, Result};

/// Machine-readable outcome of one stage run, written to `<logs>/<stage>.json`.
///
/// Keys are emitted in sorted order so that downstream jobs can diff reports.
#[derive(Debug, Clone)]
pub struct StageReport {
    pub status: i32,
    pub log: PathBuf,
    pub error_reason: Option<String>,
    pub finished_at: DateTime<Utc>,
    fields: Map<String, Value>,
}

impl StageReport {
    pub fn success(log: impl Into<PathBuf>) -> Self {
        Self {
            status: 0,
            log: log.into(),
            error_reason: None,
            finished_at: Utc::now(),
            fields: Map::new(),
        }
    }

    pub fn failure(log: impl Into<PathBuf>, error: &PipelineError) -> Self {
        let mut report = Self {
            status: error.exit_code(),
            log: log.into(),
            error_reason: Some(error.to_string()),
            finished_at: Utc::now(),
            fields: Map::new(),
        };
        if let Some(task_id) = error.task_id() {
            report = report.with("task_id", task_id);
        }
        report
    }

    #[must_use]
    pub fn with(mut self, key: &str, value: impl Serialize) -> Self {
        let value = serde_json::to_value(value).unwrap_or(Value::Null);
        self.fields.insert(key.to_string(), value);
        self
    }

    /// Records `key` as null unless the stage already reported it.
    #[must_use]
    pub fn with_default_null(mut self, key: &str) -> Self {
        self.fields.entry(key.to_string()).or_insert(Value::Null);
        self
    }

    #[must_use]
    pub fn with_status(mut self, status: i32) -> Self {
        self.status = status;
        self
    }

    pub fn to_json(&self) -> Value {
        let mut map = self.fields.clone();
        map.insert("status".to_string(), Value::from(self.status));
        map.insert(
            "log".to_string(),
            Value::from(self.log.to_string_lossy().into_owned()),
        );
        map.insert(
            "finished_at".to_string(),
            Value::from(self.finished_at.to_rfc3339()),
        );
        if let Some(reason) = &self.error_reason {
            map.insert("error_reason".to_string(), Value::from(reason.clone()));
        }
        Value::Object(map)
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(&self.to_json())?;
        std::fs::write(path, json + "\n")?;
        Ok(())
    }
}
