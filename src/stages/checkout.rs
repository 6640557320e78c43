use std::path::{Path, PathBuf};

use log::{debug, info};
use regex::Regex;

use crate::config::GitConfig;
use crate::error::{PipelineError, Result};
use crate::process::{run_checked, with_retries, CommandRunner, Invocation};
use crate::stages::sorted_files;

/// What to check out and where.
#[derive(Debug, Clone)]
pub struct CheckoutRequest {
    pub git_url: String,
    pub namespace: String,
    pub repo: String,
    pub branch: String,
    pub pr: Option<u64>,
    /// Directory the repository is cloned into (as `<workdir>/<repo>`)
    pub workdir: PathBuf,
}

impl CheckoutRequest {
    pub fn url(&self) -> String {
        repo_url(&self.git_url, &self.namespace, &self.repo)
    }

    pub fn checkout_dir(&self) -> PathBuf {
        self.workdir.join(&self.repo)
    }
}

pub fn repo_url(git_url: &str, namespace: &str, repo: &str) -> String {
    format!("{}/{namespace}/{repo}.git", git_url.trim_end_matches('/'))
}

/// Whether `ansible-playbook --list-tags` output shows a task carrying `tag` or `always`.
pub fn lists_tag(list_tags_output: &str, tag: &str) -> bool {
    let pattern = format!(r"^\s+TASK TAGS: \[.*\b({}|always)\b.*\]", regex::escape(tag));
    let Ok(re) = Regex::new(&pattern) else {
        return false;
    };
    list_tags_output.lines().any(|line| re.is_match(line))
}

pub struct RepoCheckout<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    config: &'a GitConfig,
}

impl<'a, R: CommandRunner + ?Sized> RepoCheckout<'a, R> {
    pub fn new(runner: &'a R, config: &'a GitConfig) -> Self {
        Self { runner, config }
    }

    fn git(&self) -> Invocation {
        Invocation::new("git").timeout(self.config.command_timeout())
    }

    /// Clones the repository, checks out the branch and merges the pull
    /// request when one is given. Returns the checkout directory.
    pub async fn checkout(&self, request: &CheckoutRequest) -> Result<PathBuf> {
        let url = request.url();
        let dir = request.checkout_dir();

        info!("Cloning {url}");
        let clone = self.git()
            .args(["clone", url.as_str()])
            .path_arg(&dir);
        let (target, clone) = (&dir, &clone);
        with_retries(self.config.retry_policy(), &format!("Cloning {url}"), || async move {
            remove_dir_if_exists(target).await?;
            run_checked(self.runner, clone).await
        })
        .await
        .map_err(|e| PipelineError::Stage(format!("Couldn't clone {url}: {e}")))?;

        info!("Checkout {}", request.branch);
        run_checked(
            self.runner,
            &self.git()
                .args(["checkout", request.branch.as_str()])
                .current_dir(&dir),
        )
        .await?;

        if let Some(pr) = request.pr {
            self.merge_pull_request(&dir, pr, &request.branch).await?;
        }
        Ok(dir)
    }

    async fn merge_pull_request(&self, dir: &Path, pr: u64, branch: &str) -> Result<()> {
        info!("Fetching PR {pr}");
        let fetch = self.git()
            .args(["fetch", "-fu", "origin"])
            .arg(format!("refs/pull/{pr}/head:pr"))
            .current_dir(dir);
        with_retries(self.config.retry_policy(), &format!("Fetching PR {pr}"), || {
            run_checked(self.runner, &fetch)
        })
        .await
        .map_err(|e| PipelineError::Stage(format!("Couldn't fetch PR {pr}: {e}")))?;

        info!("Merging PR {pr} to {branch}");
        let merge = self.git()
            .arg("-c")
            .arg(format!("user.name={}", self.config.merge_user_name))
            .arg("-c")
            .arg(format!("user.email={}", self.config.merge_user_email))
            .args(["merge", "pr", "-m", self.config.merge_message.as_str()])
            .current_dir(dir);
        run_checked(self.runner, &merge)
            .await
            .map_err(|e| match e {
                PipelineError::CommandFailed { command, code, stderr } => {
                    PipelineError::CommandFailed {
                        command: format!("{command} (merging PR {pr})"),
                        code,
                        stderr,
                    }
                }
                other => other,
            })?;
        Ok(())
    }

    /// Test playbooks (`tests*.yml`) of a checkout that run under `tag`.
    ///
    /// Playbooks live in `tests/`, or at the repository root for the `tests`
    /// namespace. Names are returned sorted.
    pub async fn test_playbooks(&self, dir: &Path, namespace: &str, tag: &str) -> Result<Vec<String>> {
        let tests_dir = if namespace == "tests" {
            dir.to_path_buf()
        } else {
            dir.join("tests")
        };
        if !tests_dir.is_dir() {
            debug!("There is no tests directory");
            return Ok(Vec::new());
        }

        let candidates = sorted_files(&tests_dir, |name| {
            name.starts_with("tests") && name.ends_with(".yml")
        })?;

        let mut playbooks = Vec::new();
        for playbook in candidates {
            debug!("Checking if playbook {} has {tag} tag", playbook.display());
            let output = run_checked(
                self.runner,
                &Invocation::new("ansible-playbook")
                    .args(["--tags", tag, "--list-tags"])
                    .path_arg(&playbook)
                    .timeout(self.config.command_timeout()),
            )
            .await?;
            if lists_tag(&output.stdout, tag) {
                if let Some(name) = playbook.file_name().and_then(|n| n.to_str()) {
                    playbooks.push(name.to_string());
                }
            } else {
                debug!("playbook {} has NOT {tag} tag", playbook.display());
            }
        }
        debug!("Test playbooks are: {}", playbooks.join(","));
        Ok(playbooks)
    }
}

async fn remove_dir_if_exists(dir: &Path) -> Result<()> {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}
