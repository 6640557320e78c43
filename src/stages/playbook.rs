use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, error, info, warn};

use crate::config::{PlaybookConfig, ProvisionConfig};
use crate::error::{PipelineError, Result};
use crate::process::{CommandRunner, Invocation};
use crate::stages::provision::{vm_logs, Provisioner};
use crate::stages::results::{ResultsDocument, TestResult};

pub const INVENTORY_FILE: &str = "pipeline_inventory.yaml";
const RESULTS_FILE: &str = "results.yml";
const RESULTS_BACKUP: &str = "results.yml.bak";
const RESULTS_REJECTED: &str = "results.yml.malformed";
const TEST_LOG: &str = "test.log";

#[derive(Debug, Clone)]
pub struct PlaybookRequest {
    pub image: PathBuf,
    pub artifacts: PathBuf,
    pub playbook: PathBuf,
    /// `key=value` pairs handed to ansible as extra variables
    pub extra_vars: Vec<String>,
    pub check_result: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlaybookOutcome {
    pub status: i32,
    pub inventory: PathBuf,
    pub guest_log: PathBuf,
    pub qemu_log: PathBuf,
}

pub struct PlaybookRunner<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    provision: &'a ProvisionConfig,
    config: &'a PlaybookConfig,
}

impl<'a, R: CommandRunner + ?Sized> PlaybookRunner<'a, R> {
    pub fn new(runner: &'a R, provision: &'a ProvisionConfig, config: &'a PlaybookConfig) -> Self {
        Self {
            runner,
            provision,
            config,
        }
    }

    /// Provisions a VM from the image and runs the playbook against it.
    ///
    /// The returned status is the playbook's effective status: its exit
    /// code, raised to 1 by a timeout or, when checking results, by a
    /// missing `test.log` or any result other than `pass`.
    pub async fn run(&self, request: &PlaybookRequest) -> Result<PlaybookOutcome> {
        if let Some(var) = request.extra_vars.iter().find(|var| !var.contains('=')) {
            return Err(PipelineError::Usage(format!(
                "Extra variable {var:?} is not in key=value format"
            )));
        }
        if !request.playbook.is_file() {
            return Err(PipelineError::Usage(format!(
                "Playbook {} doesn't exist",
                request.playbook.display()
            )));
        }

        let artifacts = &request.artifacts;
        tokio::fs::create_dir_all(artifacts).await?;
        let inventory = artifacts.join(INVENTORY_FILE);
        let (guest_log, qemu_log) = vm_logs(&request.image, artifacts);

        Provisioner::new(self.runner, self.provision)
            .provision(&request.image, artifacts, &inventory)
            .await?;

        let results = artifacts.join(RESULTS_FILE);
        let backup = artifacts.join(RESULTS_BACKUP);
        if results.is_file() {
            debug!("backing up {}", results.display());
            tokio::fs::rename(&results, &backup).await?;
        }

        let status = self
            .run_playbook(&inventory, &request.playbook, &request.extra_vars, artifacts)
            .await?;
        let checked = if request.check_result {
            self.check_results(artifacts, &request.playbook, status)
        } else {
            Ok(status)
        };
        // The backup goes back even when the new document is unusable
        restore_previous_results(&results, &backup)?;
        let status = checked?;

        if status != 0 {
            self.sync_artifacts(&inventory, artifacts).await?;
        }

        Ok(PlaybookOutcome {
            status,
            inventory,
            guest_log,
            qemu_log,
        })
    }

    async fn run_playbook(
        &self,
        inventory: &Path,
        playbook: &Path,
        extra_vars: &[String],
        artifacts: &Path,
    ) -> Result<i32> {
        let mut invocation = Invocation::new("ansible-playbook")
            .arg("--inventory")
            .path_arg(inventory)
            .args(["--tags", self.config.tags.as_str()]);
        for var in extra_vars {
            invocation = invocation.arg("-e").arg(var.as_str());
        }
        let invocation = invocation
            .path_arg(playbook)
            .env("TEST_ARTIFACTS", artifacts.to_string_lossy())
            .timeout(Duration::from_secs(self.config.timeout_secs));

        info!("Running playbook {}", playbook.display());
        debug!("TEST_ARTIFACTS = {}", artifacts.display());
        let status = match self.runner.run(&invocation).await {
            Ok(output) => {
                if !output.stdout.trim().is_empty() {
                    info!("{}", output.stdout.trim_end());
                }
                if !output.stderr.trim().is_empty() {
                    warn!("{}", output.stderr.trim_end());
                }
                output.code.unwrap_or(1)
            }
            Err(PipelineError::Timeout { .. }) => {
                error!("Playbook has been running for too long. Aborting it.");
                1
            }
            Err(e) => return Err(e),
        };
        debug!("Playbook {} finished with {status}", playbook.display());
        Ok(status)
    }

    /// Applies the standard test interface rules to the playbook status.
    fn check_results(&self, artifacts: &Path, playbook: &Path, status: i32) -> Result<i32> {
        let mut status = status;
        if !artifacts.join(TEST_LOG).is_file() {
            error!("Playbook finished without creating {TEST_LOG}");
            status = 1;
        }

        let results_file = artifacts.join(RESULTS_FILE);
        if !results_file.is_file() {
            debug!("playbook didn't create {RESULTS_FILE}, creating one...");
            let test = playbook
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default();
            ResultsDocument {
                results: vec![TestResult::new(
                    test,
                    status == 0,
                    vec![artifacts.to_string_lossy().into_owned()],
                )],
                ..ResultsDocument::default()
            }
            .save(&results_file)?;
        }

        debug!("parsing {RESULTS_FILE}");
        let document = ResultsDocument::load(&results_file)?;
        for result in document.results.iter().filter(|r| !r.passed()) {
            debug!(
                "{} has result {}, setting whole playbook as failed",
                result.test, result.result
            );
            status = 1;
        }
        Ok(status)
    }

    /// Runs the artifact sync playbook so logs are fetched even when the
    /// test playbook stopped before doing it.
    async fn sync_artifacts(&self, inventory: &Path, artifacts: &Path) -> Result<()> {
        let playbook = &self.config.sync_artifacts_playbook;
        if !playbook.is_file() {
            debug!("{} not found, skipping artifact sync", playbook.display());
            return Ok(());
        }
        let status = self.run_playbook(inventory, playbook, &[], artifacts).await?;
        if status != 0 {
            warn!("Syncing artifacts finished with {status}");
        }
        Ok(())
    }
}

/// Adds the results saved before the run after the new ones.
///
/// A new document that can't be parsed is moved to `results.yml.malformed`
/// and the saved results take its place.
fn restore_previous_results(results: &Path, backup: &Path) -> Result<()> {
    if !backup.is_file() {
        return Ok(());
    }
    if !results.is_file() {
        std::fs::rename(backup, results)?;
        return Ok(());
    }
    debug!("merging results");
    let mut current = match ResultsDocument::load(results) {
        Ok(document) => document,
        Err(e) => {
            let rejected = results.with_file_name(RESULTS_REJECTED);
            warn!("{e}; moving it to {}", rejected.display());
            std::fs::rename(results, &rejected)?;
            std::fs::rename(backup, results)?;
            return Ok(());
        }
    };
    current.append(ResultsDocument::load(backup)?, backup);
    current.save(results)?;
    std::fs::remove_file(backup)?;
    Ok(())
}
