//! `results.yml` documents written by test playbooks.

use std::path::Path;

use indexmap::IndexMap;
use log::warn;
use serde::{Deserialize, Serialize};
use serde_yaml::Value;

use crate::error::{PipelineError, Result};

pub const PASS: &str = "pass";
pub const FAIL: &str = "fail";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TestResult {
    pub test: String,
    pub result: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<Vec<String>>,
    /// Keys this crate does not interpret, kept as written
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl TestResult {
    pub fn new(test: impl Into<String>, passed: bool, logs: Vec<String>) -> Self {
        Self {
            test: test.into(),
            result: if passed { PASS } else { FAIL }.to_string(),
            logs: Some(logs),
            extra: IndexMap::new(),
        }
    }

    pub fn passed(&self) -> bool {
        self.result == PASS
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultsDocument {
    pub results: Vec<TestResult>,
    #[serde(flatten)]
    pub extra: IndexMap<String, Value>,
}

impl ResultsDocument {
    pub fn load(path: &Path) -> Result<Self> {
        let malformed = |reason: String| PipelineError::MalformedResults {
            path: path.to_path_buf(),
            reason,
        };
        let contents = std::fs::read_to_string(path).map_err(|e| malformed(e.to_string()))?;
        serde_yaml::from_str(&contents).map_err(|e| malformed(e.to_string()))
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, serde_yaml::to_string(self)?)?;
        Ok(())
    }

    pub fn failures(&self) -> usize {
        self.results.iter().filter(|r| !r.passed()).count()
    }

    /// Appends the results of `other`, loaded from `source`.
    ///
    /// Top-level keys already present win; the keys dropped from `other`
    /// are logged and returned.
    pub fn append(&mut self, other: ResultsDocument, source: &Path) -> Vec<String> {
        self.results.extend(other.results);
        let mut dropped = Vec::new();
        for (key, value) in other.extra {
            if self.extra.contains_key(&key) {
                warn!(
                    "Ignoring top-level key {key:?} from {}: already set by an earlier document",
                    source.display()
                );
                dropped.push(key);
            } else {
                self.extra.insert(key, value);
            }
        }
        dropped
    }

    /// Makes test names and log paths relative to the parent of `dir`.
    #[must_use]
    pub fn prefixed(mut self, dir: &str) -> Self {
        for result in &mut self.results {
            result.test = format!("{dir}/{}", result.test);
            if let Some(logs) = &mut result.logs {
                for log in logs.iter_mut() {
                    *log = format!("{dir}/{log}");
                }
            }
        }
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const RESULTS: &str = "results:\n- test: smoke\n  result: pass\n  logs:\n  - smoke.log\n  duration: 12\n- test: upgrade\n  result: fail\nsummary: one failure\n";

    #[test]
    fn test_load_keeps_unknown_keys() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.yml");
        std::fs::write(&path, RESULTS).unwrap();

        let doc = ResultsDocument::load(&path).unwrap();
        assert_eq!(doc.results.len(), 2);
        assert_eq!(doc.results[0].logs.as_deref(), Some(&["smoke.log".to_string()][..]));
        assert_eq!(doc.results[0].extra["duration"], Value::from(12));
        assert_eq!(doc.extra["summary"], Value::from("one failure"));
        assert_eq!(doc.failures(), 1);

        doc.save(&path).unwrap();
        let saved = std::fs::read_to_string(&path).unwrap();
        assert!(saved.contains("duration: 12"));
        assert!(saved.contains("summary: one failure"));
    }

    #[test]
    fn test_load_malformed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("results.yml");
        std::fs::write(&path, "results:\n- result: pass\n").unwrap();
        assert!(matches!(
            ResultsDocument::load(&path),
            Err(PipelineError::MalformedResults { .. })
        ));

        std::fs::write(&path, "just a string").unwrap();
        assert!(ResultsDocument::load(&path).is_err());

        let missing = ResultsDocument::load(&dir.path().join("missing.yml")).unwrap_err();
        assert!(missing.to_string().contains("missing.yml"));
    }

    #[test]
    fn test_append_and_prefix() {
        let mut first = ResultsDocument {
            results: vec![TestResult::new("a", true, vec!["a.log".into()])],
            extra: IndexMap::from([("summary".to_string(), Value::from("first"))]),
        };
        let second = ResultsDocument {
            results: vec![TestResult::new("b", false, vec![])],
            extra: IndexMap::from([
                ("summary".to_string(), Value::from("second")),
                ("run".to_string(), Value::from(2)),
            ]),
        };

        let source = Path::new("fedora-33/results.yml");
        let dropped = first.append(second.prefixed("fedora-33"), source);
        assert_eq!(dropped, ["summary"]);
        let names: Vec<_> = first.results.iter().map(|r| r.test.as_str()).collect();
        assert_eq!(names, ["a", "fedora-33/b"]);
        assert_eq!(first.extra["summary"], Value::from("first"));
        assert_eq!(first.extra["run"], Value::from(2));

        let prefixed = first.prefixed("x");
        assert_eq!(prefixed.results[0].logs.as_deref(), Some(&["x/a.log".to_string()][..]));
    }

    #[test]
    fn test_synthesized_result() {
        let result = TestResult::new("tests", false, vec!["/artifacts".into()]);
        assert_eq!(result.result, "fail");
        let yaml = serde_yaml::to_string(&ResultsDocument {
            results: vec![result],
            extra: IndexMap::new(),
        })
        .unwrap();
        assert!(yaml.contains("test: tests"));
        assert!(yaml.contains("- /artifacts"));
    }
}
