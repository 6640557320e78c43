use std::path::PathBuf;

use log::{debug, error, info};

use crate::error::{PipelineError, Result};
use crate::output::xunit;
use crate::stages::results::ResultsDocument;

const RESULTS_FILE: &str = "results.yml";

/// Where the documents to merge come from.
#[derive(Debug, Clone)]
pub enum MergeInput {
    /// Every subdirectory holds a `results.yml`; names and logs get the
    /// subdirectory as prefix.
    Directory(PathBuf),
    /// Documents merged in the given order, unchanged.
    Files(Vec<PathBuf>),
}

/// One document to merge, with the prefix applied to its entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeSource {
    pub path: PathBuf,
    pub prefix: Option<String>,
}

#[derive(Debug)]
pub struct MergeOutcome {
    pub document: ResultsDocument,
    pub merged: usize,
    pub malformed: Vec<PipelineError>,
}

impl MergeInput {
    /// Lists the documents in merge order.
    pub fn sources(&self) -> Result<Vec<MergeSource>> {
        let sources: Vec<MergeSource> = match self {
            Self::Files(files) => files
                .iter()
                .map(|path| MergeSource {
                    path: path.clone(),
                    prefix: None,
                })
                .collect(),
            Self::Directory(base) => {
                let mut dirs = Vec::new();
                for entry in std::fs::read_dir(base)? {
                    let entry = entry?;
                    if !entry.file_type()?.is_dir() {
                        debug!("skip {} as it is not a directory", entry.path().display());
                        continue;
                    }
                    dirs.push(entry.file_name().to_string_lossy().into_owned());
                }
                dirs.sort();
                dirs.into_iter()
                    .map(|dir| MergeSource {
                        path: base.join(&dir).join(RESULTS_FILE),
                        prefix: Some(dir),
                    })
                    .collect()
            }
        };
        if sources.is_empty() {
            return Err(PipelineError::NoResults);
        }
        Ok(sources)
    }

    /// Default base for log links in the xUnit document.
    pub fn logs_base(&self) -> String {
        match self {
            Self::Directory(base) => base.to_string_lossy().into_owned(),
            Self::Files(files) => files
                .first()
                .and_then(|f| f.parent())
                .map(|p| p.to_string_lossy().into_owned())
                .unwrap_or_default(),
        }
    }
}

/// Concatenates the documents of `input` in order.
///
/// A document that is missing or malformed is reported and skipped; the
/// others are still merged.
pub fn merge(input: &MergeInput) -> Result<MergeOutcome> {
    let sources = input.sources()?;
    info!("Merging {} result documents", sources.len());

    let mut document = ResultsDocument::default();
    let mut merged = 0;
    let mut malformed = Vec::new();
    for source in sources {
        debug!("loading {}", source.path.display());
        match ResultsDocument::load(&source.path) {
            Ok(loaded) => {
                let loaded = match &source.prefix {
                    Some(prefix) => loaded.prefixed(prefix),
                    None => loaded,
                };
                document.append(loaded, &source.path);
                merged += 1;
            }
            Err(e) => {
                error!("{e}");
                malformed.push(e);
            }
        }
    }
    Ok(MergeOutcome {
        document,
        merged,
        malformed,
    })
}

/// Where merged results are written.
#[derive(Debug, Clone)]
pub struct MergeTargets {
    pub output: PathBuf,
    pub xunit: Option<PathBuf>,
    /// Base URL of log links in the xUnit document
    pub base_logs_url: Option<String>,
}

/// Merges, writes the merged document and optional xUnit report, then
/// fails if any input document was malformed.
pub fn merge_results(input: &MergeInput, targets: &MergeTargets) -> Result<MergeOutcome> {
    let outcome = merge(input)?;

    outcome.document.save(&targets.output)?;
    info!("Merged results saved to {}", targets.output.display());

    if let Some(xunit_file) = &targets.xunit {
        let base = targets
            .base_logs_url
            .clone()
            .unwrap_or_else(|| input.logs_base());
        info!("Creating xunit file with test results");
        xunit::save(&outcome.document.results, &base, xunit_file)?;
        info!("xunit saved to {}", xunit_file.display());
    }

    if !outcome.malformed.is_empty() {
        return Err(PipelineError::Stage(format!(
            "{} of {} result documents could not be merged",
            outcome.malformed.len(),
            outcome.malformed.len() + outcome.merged
        )));
    }
    Ok(outcome)
}
