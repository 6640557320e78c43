use std::fmt;
use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use log::{debug, info, warn};
use regex::Regex;
use tokio::time::Instant;

use crate::config::KojiConfig;
use crate::error::{PipelineError, Result};
use crate::process::{run_checked, with_retries, CommandRunner, Invocation};

/// Koji task states as printed by `koji taskinfo`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Free,
    Open,
    Closed,
    Canceled,
    Assigned,
    Failed,
}

impl TaskState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Closed | Self::Canceled | Self::Failed)
    }

    pub fn is_success(self) -> bool {
        self == Self::Closed
    }
}

impl FromStr for TaskState {
    type Err = PipelineError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "free" => Ok(Self::Free),
            "open" => Ok(Self::Open),
            "closed" => Ok(Self::Closed),
            "canceled" | "cancelled" => Ok(Self::Canceled),
            "assigned" => Ok(Self::Assigned),
            "failed" => Ok(Self::Failed),
            other => Err(PipelineError::Stage(format!("Unknown koji task state {other}"))),
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Free => "free",
            Self::Open => "open",
            Self::Closed => "closed",
            Self::Canceled => "canceled",
            Self::Assigned => "assigned",
            Self::Failed => "failed",
        };
        f.write_str(name)
    }
}

/// The parts of `koji taskinfo` output the pipeline cares about.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskInfo {
    pub state: TaskState,
    pub scratch: bool,
}

impl TaskInfo {
    pub fn parse(output: &str) -> Result<Self> {
        let state = output
            .lines()
            .find_map(|line| line.trim().strip_prefix("State:"))
            .ok_or_else(|| PipelineError::Stage("koji taskinfo output has no State".into()))?
            .parse()?;
        let scratch = output
            .lines()
            .any(|line| line.trim().eq_ignore_ascii_case("scratch: true"));
        Ok(Self { state, scratch })
    }
}

/// Extracts the task id from `koji build` output (`Created task: 123`).
pub fn parse_created_task(output: &str) -> Option<u64> {
    let re = Regex::new(r"Created task:\s*(\d+)").ok()?;
    re.captures(output).and_then(|caps| caps[1].parse().ok())
}

/// Web page of a task.
pub fn task_url(web_url: &str, task_id: u64) -> String {
    format!("{}/taskinfo?taskID={task_id}", web_url.trim_end_matches('/'))
}

/// Thin client over the `koji` command line tool.
pub struct KojiClient<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    config: &'a KojiConfig,
}

impl<'a, R: CommandRunner + ?Sized> KojiClient<'a, R> {
    pub fn new(runner: &'a R, config: &'a KojiConfig) -> Self {
        Self { runner, config }
    }

    fn command(&self) -> Invocation {
        let mut invocation = Invocation::new("koji")
            .arg(format!("--server={}", self.config.hub_url))
            .arg(format!("--weburl={}", self.config.web_url));
        if let Some(keytab) = &self.config.keytab {
            invocation = invocation
                .arg("--authtype=kerberos")
                .arg(format!("--keytab={}", keytab.display()));
            if let Some(principal) = &self.config.principal {
                invocation = invocation.arg(format!("--principal={principal}"));
            }
        }
        invocation.args(self.config.extra_args.iter().cloned())
    }

    pub fn task_url(&self, task_id: u64) -> String {
        task_url(&self.config.web_url, task_id)
    }

    /// Uploads `srpm` and starts a scratch build for `target`, returning the task id.
    ///
    /// A failed attempt that still printed `Created task:` is not retried:
    /// the hub accepted the build, and another upload would start a second one.
    pub async fn submit_scratch_build(&self, target: &str, srpm: &Path) -> Result<u64> {
        let invocation = self
            .command()
            .args(["build", "--scratch", "--nowait"])
            .arg(format!("--arch-override={}", self.config.arch_override))
            .arg(target)
            .path_arg(srpm)
            .timeout(self.config.command_timeout());

        info!("Building scratch build of {} for {target}", srpm.display());
        let (runner, invocation) = (self.runner, &invocation);
        let task_id = with_retries(
            self.config.submit_policy(),
            &format!("Uploading {}", srpm.display()),
            || async move {
                let output = runner.run(invocation).await?;
                let created = parse_created_task(&output.stdout);
                match created {
                    Some(task_id) if !output.success() => {
                        warn!(
                            "{} exited with status {} after creating task {task_id}",
                            invocation.command_line(),
                            output.code.unwrap_or(-1)
                        );
                        Ok(Some(task_id))
                    }
                    _ if output.success() => Ok(created),
                    _ => Err(PipelineError::CommandFailed {
                        command: invocation.command_line(),
                        code: output.code.unwrap_or(-1),
                        stderr: output.stderr,
                    }),
                }
            },
        )
        .await?
        .ok_or_else(|| {
            PipelineError::Stage("Failed building scratch build: no task id in koji output".into())
        })?;

        info!("Created task {task_id}: {}", self.task_url(task_id));
        Ok(task_id)
    }

    pub async fn task_info(&self, task_id: u64) -> Result<TaskInfo> {
        self.query_task(task_id, self.config.command_timeout()).await
    }

    async fn query_task(&self, task_id: u64, limit: Duration) -> Result<TaskInfo> {
        let invocation = self
            .command()
            .arg("taskinfo")
            .arg(task_id.to_string())
            .timeout(limit);
        let output = run_checked(self.runner, &invocation).await?;
        TaskInfo::parse(&output.stdout)
    }

    /// Polls the task until it reaches a terminal state.
    ///
    /// Returns the final state on success; a failed or canceled task and a
    /// task still running after the build timeout are errors. Failed polls
    /// are retried until `poll_failures` of them happen in a row. Every
    /// error returned here carries the task id.
    pub async fn wait_for_task(&self, task_id: u64) -> Result<TaskState> {
        let timeout = self.config.build_timeout();
        let deadline = Instant::now() + timeout;
        let timed_out = || PipelineError::TaskTimeout {
            task_id,
            seconds: timeout.as_secs(),
        };

        let mut failures = 0;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return Err(timed_out());
            }

            match self
                .query_task(task_id, remaining.min(self.config.command_timeout()))
                .await
            {
                Ok(info) => {
                    failures = 0;
                    let state = info.state;
                    debug!("task {task_id} is {state}");
                    if state.is_terminal() {
                        if state.is_success() {
                            info!("task completed successfully");
                            return Ok(state);
                        }
                        info!("task {task_id} is {state}");
                        return Err(PipelineError::TaskFailed { task_id, state });
                    }
                }
                Err(e) => {
                    failures += 1;
                    if failures > self.config.poll_failures {
                        return Err(PipelineError::TaskPoll {
                            task_id,
                            source: Box::new(e),
                        });
                    }
                    warn!(
                        "Polling task {task_id} failed ({failures}/{}): {e}",
                        self.config.poll_failures
                    );
                }
            }

            if Instant::now() + self.config.poll_interval() > deadline {
                return Err(timed_out());
            }
            tokio::time::sleep(self.config.poll_interval()).await;
        }
    }

    /// Downloads the RPMs produced by a task into `dest`.
    pub async fn download_task(&self, task_id: u64, dest: &Path) -> Result<()> {
        let info = self.task_info(task_id).await?;
        let arches = self
            .config
            .download_arches
            .iter()
            .map(|arch| format!("--arch={arch}"));

        let invocation = if info.scratch {
            self.command()
                .arg("download-task")
                .args(arches)
                .arg(task_id.to_string())
        } else {
            self.command()
                .arg("download-build")
                .args(arches)
                .args(["--debuginfo", "--task-id"])
                .arg(task_id.to_string())
        };

        info!("Downloading rpms from {task_id}");
        let invocation = invocation
            .current_dir(dest)
            .timeout(self.config.command_timeout());
        run_checked(self.runner, &invocation)
            .await
            .map_err(|e| PipelineError::Stage(format!("Couldn't download task rpms: {e}")))?;
        Ok(())
    }
}
