//! Pipeline stages.
//!
//! Each stage is a one-shot batch operation driven through a
//! [`CommandRunner`](crate::process::CommandRunner). Stages share no state;
//! they hand work to each other only through files and exit codes.

pub mod build;
pub mod checkout;
pub mod customize;
pub mod koji;
pub mod merge;
pub mod playbook;
pub mod provision;
pub mod resize;
pub mod results;

use std::path::{Path, PathBuf};

use crate::error::Result;

/// Lists the files in `dir` whose name satisfies `matches`, sorted by name.
pub(crate) fn sorted_files<F>(dir: &Path, matches: F) -> Result<Vec<PathBuf>>
where
    F: Fn(&str) -> bool,
{
    let mut files = Vec::new();
    for entry in std::fs::read_dir(dir)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if entry.file_name().to_str().is_some_and(&matches) {
            files.push(entry.path());
        }
    }
    files.sort();
    Ok(files)
}
