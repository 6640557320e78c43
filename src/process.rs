//! External command execution.
//!
//! Every stage is a sequence of invocations of system tools. They all go
//! through [`CommandRunner`] so that a stage can be driven by a scripted
//! runner in tests.

use std::future::Future;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use log::{debug, error, warn};
use tokio::process::Command;

use crate::error::{PipelineError, Result};

/// A single external command, fully described before it runs.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: String,
    pub args: Vec<String>,
    pub cwd: Option<PathBuf>,
    pub env: Vec<(String, String)>,
    pub timeout: Option<Duration>,
}

impl Invocation {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            cwd: None,
            env: Vec::new(),
            timeout: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn path_arg(self, path: &Path) -> Self {
        self.arg(path.to_string_lossy().into_owned())
    }

    #[must_use]
    pub fn current_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Shell-like rendering used in logs and error messages.
    pub fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    /// Exit code, `None` when the process was killed by a signal
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.code == Some(0)
    }
}

#[async_trait]
pub trait CommandRunner: Send + Sync {
    /// Runs the invocation to completion and captures its output.
    ///
    /// A nonzero exit status is not an error at this level; failing to start
    /// the program or exceeding the invocation timeout is.
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput>;
}

/// Runs commands on the host with `tokio::process`.
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemRunner;

#[async_trait]
impl CommandRunner for SystemRunner {
    async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
        let mut command = Command::new(&invocation.program);
        command
            .args(&invocation.args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &invocation.cwd {
            command.current_dir(cwd);
        }
        for (key, value) in &invocation.env {
            command.env(key, value);
        }

        let child = command.spawn().map_err(|source| PipelineError::Spawn {
            program: invocation.program.clone(),
            source,
        })?;

        let output = match invocation.timeout {
            Some(limit) => tokio::time::timeout(limit, child.wait_with_output())
                .await
                .map_err(|_| PipelineError::Timeout {
                    command: invocation.command_line(),
                    seconds: limit.as_secs(),
                })??,
            None => child.wait_with_output().await?,
        };

        Ok(CommandOutput {
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }
}

/// Runs a command and turns a nonzero exit status into an error.
pub async fn run_checked<R>(runner: &R, invocation: &Invocation) -> Result<CommandOutput>
where
    R: CommandRunner + ?Sized,
{
    debug!("Running {}", invocation.command_line());
    let output = runner.run(invocation).await?;

    if output.success() {
        log_captured(&output);
        return Ok(output);
    }

    error!(
        "{} exited with {}",
        invocation.command_line(),
        output
            .code
            .map_or_else(|| "a signal".to_string(), |code| format!("status {code}"))
    );
    if !output.stderr.trim().is_empty() {
        error!("{}", output.stderr.trim_end());
    }
    if !output.stdout.trim().is_empty() {
        debug!("{}", output.stdout.trim_end());
    }

    Err(PipelineError::CommandFailed {
        command: invocation.command_line(),
        code: output.code.unwrap_or(-1),
        stderr: output.stderr,
    })
}

fn log_captured(output: &CommandOutput) {
    if !output.stderr.trim().is_empty() {
        debug!("{}", output.stderr.trim_end());
    }
    if !output.stdout.trim().is_empty() {
        debug!("{}", output.stdout.trim_end());
    }
}

/// Bounded retry with a fixed delay between attempts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total number of attempts, including the first one
    pub attempts: u32,
    pub delay: Duration,
}

impl RetryPolicy {
    pub fn new(attempts: u32, delay: Duration) -> Self {
        Self {
            attempts: attempts.max(1),
            delay,
        }
    }
}

/// Retries `operation` according to `policy`, returning the last error once
/// the attempts are exhausted.
pub async fn with_retries<T, F, Fut>(policy: RetryPolicy, what: &str, mut operation: F) -> Result<T>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut attempt = 1;
    loop {
        match operation().await {
            Ok(value) => return Ok(value),
            Err(e) if attempt < policy.attempts => {
                attempt += 1;
                warn!(
                    "{what} failed ({e}), retrying in {}s ({attempt}/{})...",
                    policy.delay.as_secs(),
                    policy.attempts
                );
                tokio::time::sleep(policy.delay).await;
            }
            Err(e) => return Err(e),
        }
    }
}

#[cfg(test)]
pub mod testing {
    //! Scripted runner used by stage tests.

    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    type Hook = Box<dyn Fn(&Invocation) + Send + Sync>;

    struct Rule {
        matcher: String,
        responses: VecDeque<Result<CommandOutput>>,
        hook: Option<Hook>,
    }

    /// Answers invocations whose command line contains a registered pattern.
    ///
    /// Rules are checked in registration order; each queued response is used
    /// once, the last one repeats. Unmatched commands succeed with no output.
    #[derive(Default)]
    pub struct ScriptedRunner {
        rules: Mutex<Vec<Rule>>,
        calls: Mutex<Vec<Invocation>>,
    }

    pub fn ok(stdout: &str) -> Result<CommandOutput> {
        Ok(CommandOutput {
            code: Some(0),
            stdout: stdout.to_string(),
            stderr: String::new(),
        })
    }

    pub fn exit(code: i32, stderr: &str) -> Result<CommandOutput> {
        Ok(CommandOutput {
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.to_string(),
        })
    }

    impl ScriptedRunner {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn respond(&self, matcher: &str, responses: Vec<Result<CommandOutput>>) -> &Self {
            self.rules.lock().unwrap().push(Rule {
                matcher: matcher.to_string(),
                responses: responses.into(),
                hook: None,
            });
            self
        }

        /// Like [`respond`](Self::respond), also running `hook` on every match
        /// (used to fake the files a tool would produce).
        pub fn respond_with<F>(&self, matcher: &str, response: Result<CommandOutput>, hook: F) -> &Self
        where
            F: Fn(&Invocation) + Send + Sync + 'static,
        {
            self.rules.lock().unwrap().push(Rule {
                matcher: matcher.to_string(),
                responses: VecDeque::from([response]),
                hook: Some(Box::new(hook)),
            });
            self
        }

        pub fn calls(&self) -> Vec<Invocation> {
            self.calls.lock().unwrap().clone()
        }

        pub fn command_lines(&self) -> Vec<String> {
            self.calls().iter().map(Invocation::command_line).collect()
        }

        pub fn count(&self, pattern: &str) -> usize {
            self.command_lines()
                .iter()
                .filter(|line| line.contains(pattern))
                .count()
        }
    }

    fn clone_response(response: &Result<CommandOutput>) -> Result<CommandOutput> {
        match response {
            Ok(output) => Ok(output.clone()),
            Err(PipelineError::Timeout { command, seconds }) => Err(PipelineError::Timeout {
                command: command.clone(),
                seconds: *seconds,
            }),
            Err(e) => Err(PipelineError::Stage(e.to_string())),
        }
    }

    #[async_trait]
    impl CommandRunner for ScriptedRunner {
        async fn run(&self, invocation: &Invocation) -> Result<CommandOutput> {
            self.calls.lock().unwrap().push(invocation.clone());
            let line = invocation.command_line();
            let mut rules = self.rules.lock().unwrap();
            for rule in rules.iter_mut() {
                if !line.contains(&rule.matcher) {
                    continue;
                }
                if let Some(hook) = &rule.hook {
                    hook(invocation);
                }
                let response = if rule.responses.len() > 1 {
                    rule.responses.pop_front()
                } else {
                    rule.responses.front().map(clone_response)
                };
                return response.unwrap_or_else(|| ok(""));
            }
            ok("")
        }
    }
}
