use std::path::{Path, PathBuf};

use log::info;

use crate::config::KojiConfig;
use crate::error::{PipelineError, Result};
use crate::fedora::{is_rawhide_branch, ReleaseInfoClient};
use crate::process::{run_checked, CommandRunner, Invocation};
use crate::stages::koji::KojiClient;
use crate::stages::sorted_files;

/// Koji build target and the dist tag the source RPM is built with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildTarget {
    pub target: String,
    pub dist: String,
}

impl BuildTarget {
    /// Maps a dist-git branch to its build target.
    ///
    /// Rawhide branches build for `rawhide` with the dist tag of the release
    /// rawhide will become; any other branch names both.
    pub async fn for_branch(branch: &str, releases: &ReleaseInfoClient) -> Result<Self> {
        if is_rawhide_branch(branch) {
            let dist = releases.rawhide_dist().await.map_err(|e| {
                PipelineError::Stage(format!(
                    "Couldn't figure out fedora release number for {branch} branch: {e}"
                ))
            })?;
            return Ok(Self {
                target: "rawhide".to_string(),
                dist,
            });
        }
        Ok(Self {
            target: branch.to_string(),
            dist: branch.to_string(),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BuildOutcome {
    pub task_id: u64,
    pub task_url: String,
    pub srpm: PathBuf,
}

pub struct ScratchBuilder<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    koji: KojiClient<'a, R>,
}

impl<'a, R: CommandRunner + ?Sized> ScratchBuilder<'a, R> {
    pub fn new(runner: &'a R, config: &'a KojiConfig) -> Self {
        Self {
            runner,
            koji: KojiClient::new(runner, config),
        }
    }

    /// Runs `fedpkg srpm` in `checkout` and returns the produced source RPM.
    pub async fn build_srpm(&self, checkout: &Path, dist: &str) -> Result<PathBuf> {
        info!("Building src.rpm for {dist}");
        run_checked(
            self.runner,
            &Invocation::new("fedpkg")
                .args(["--release", dist, "srpm"])
                .current_dir(checkout),
        )
        .await?;

        sorted_files(checkout, |name| name.ends_with(".src.rpm"))?
            .into_iter()
            .next()
            .ok_or_else(|| PipelineError::Stage("Couldn't find src.rpm file".into()))
    }

    /// Builds the source RPM, submits it as a scratch build and waits for
    /// the task to finish.
    pub async fn scratch_build(&self, checkout: &Path, target: &BuildTarget) -> Result<BuildOutcome> {
        let srpm = self.build_srpm(checkout, &target.dist).await?;
        let task_id = self.koji.submit_scratch_build(&target.target, &srpm).await?;
        self.koji.wait_for_task(task_id).await?;
        Ok(BuildOutcome {
            task_id,
            task_url: self.koji.task_url(task_id),
            srpm,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::{exit, ok, ScriptedRunner};
    use crate::stages::koji::TaskState;

    fn config() -> KojiConfig {
        KojiConfig {
            submit_retries: 1,
            retry_delay_secs: 0,
            ..KojiConfig::default()
        }
    }

    /// Makes `fedpkg srpm` drop a source RPM into its working directory.
    fn fake_fedpkg(runner: &ScriptedRunner) {
        runner.respond_with("fedpkg", ok(""), |invocation| {
            let dir = invocation.cwd.clone().unwrap();
            std::fs::write(dir.join("bash-5.0.17-2.fc34.src.rpm"), "").unwrap();
        });
    }

    #[tokio::test]
    async fn test_rawhide_branch_target() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fedora-release.spec")
            .with_status(200)
            .with_body("%define dist_version 34\n")
            .create_async()
            .await;
        let releases =
            ReleaseInfoClient::new(&format!("{}/fedora-release.spec", server.url()), 1).unwrap();

        let target = BuildTarget::for_branch("master", &releases).await.unwrap();
        assert_eq!(
            target,
            BuildTarget {
                target: "rawhide".into(),
                dist: "f34".into()
            }
        );

        let target = BuildTarget::for_branch("f33", &releases).await.unwrap();
        assert_eq!(target.target, "f33");
        assert_eq!(target.dist, "f33");
    }

    #[tokio::test]
    async fn test_build_srpm_picks_first_sorted() {
        let checkout = tempfile::tempdir().unwrap();
        std::fs::write(checkout.path().join("bash-5.1.src.rpm"), "").unwrap();
        std::fs::write(checkout.path().join("bash-5.0.src.rpm"), "").unwrap();
        std::fs::write(checkout.path().join("bash.spec"), "").unwrap();
        let runner = ScriptedRunner::new();
        let config = config();

        let srpm = ScratchBuilder::new(&runner, &config)
            .build_srpm(checkout.path(), "f33")
            .await
            .unwrap();
        assert_eq!(srpm, checkout.path().join("bash-5.0.src.rpm"));
        assert_eq!(runner.command_lines(), vec!["fedpkg --release f33 srpm"]);
    }

    #[tokio::test]
    async fn test_build_srpm_without_output_fails() {
        let checkout = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        let config = config();

        let err = ScratchBuilder::new(&runner, &config)
            .build_srpm(checkout.path(), "f33")
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Couldn't find src.rpm"));
    }

    #[tokio::test]
    async fn test_scratch_build_success() {
        let checkout = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        fake_fedpkg(&runner);
        runner
            .respond("build --scratch", vec![ok("Created task: 4242\n")])
            .respond("taskinfo 4242", vec![ok("State: closed\n")]);
        let config = config();

        let outcome = ScratchBuilder::new(&runner, &config)
            .scratch_build(
                checkout.path(),
                &BuildTarget {
                    target: "rawhide".into(),
                    dist: "f34".into(),
                },
            )
            .await
            .unwrap();

        assert_eq!(outcome.task_id, 4242);
        assert_eq!(
            outcome.task_url,
            "https://koji.fedoraproject.org/koji/taskinfo?taskID=4242"
        );
        assert!(runner.count("fedpkg --release f34 srpm") == 1);
        assert!(runner.count("--arch-override=x86_64 rawhide") == 1);
    }

    #[tokio::test]
    async fn test_scratch_build_failure_keeps_task_id() {
        let checkout = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        fake_fedpkg(&runner);
        runner
            .respond("build --scratch", vec![ok("Created task: 99\n")])
            .respond("taskinfo 99", vec![ok("State: canceled\n")]);
        let config = config();

        let err = ScratchBuilder::new(&runner, &config)
            .scratch_build(
                checkout.path(),
                &BuildTarget {
                    target: "f33".into(),
                    dist: "f33".into(),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            PipelineError::TaskFailed {
                task_id: 99,
                state: TaskState::Canceled
            }
        ));
        assert_eq!(err.task_id(), Some(99));
    }

    #[tokio::test(start_paused = true)]
    async fn test_scratch_build_poll_failure_keeps_task_id() {
        let checkout = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        fake_fedpkg(&runner);
        runner
            .respond("build --scratch", vec![ok("Created task: 77\n")])
            .respond("taskinfo 77", vec![exit(1, "hub unreachable")]);
        let config = config();

        let err = ScratchBuilder::new(&runner, &config)
            .scratch_build(
                checkout.path(),
                &BuildTarget {
                    target: "f33".into(),
                    dist: "f33".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.task_id(), Some(77));
        assert!(matches!(err, PipelineError::TaskPoll { task_id: 77, .. }));
    }

    #[tokio::test]
    async fn test_fedpkg_failure_passes_exit_code() {
        let checkout = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        runner.respond("fedpkg", vec![exit(2, "Could not execute srpm")]);
        let config = config();

        let err = ScratchBuilder::new(&runner, &config)
            .scratch_build(
                checkout.path(),
                &BuildTarget {
                    target: "f33".into(),
                    dist: "f33".into(),
                },
            )
            .await
            .unwrap_err();
        assert_eq!(err.exit_code(), 2);
        assert_eq!(runner.count("koji"), 0);
    }
}
