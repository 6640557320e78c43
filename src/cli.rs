use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use log::{error, info};
use std::path::{Path, PathBuf};

use crate::config::Config;
use crate::error::PipelineError;
use crate::fedora::{Release, ReleaseInfoClient};
use crate::logging;
use crate::output::{print_results_summary, print_stage_summary};
use crate::process::SystemRunner;
use crate::report::StageReport;
use crate::stages::build::{BuildTarget, ScratchBuilder};
use crate::stages::checkout::{CheckoutRequest, RepoCheckout};
use crate::stages::customize::{ImagePreparer, PrepareRequest};
use crate::stages::koji;
use crate::stages::merge::{merge_results, MergeInput, MergeTargets};
use crate::stages::playbook::{PlaybookRequest, PlaybookRunner};
use crate::stages::provision::{vm_logs, Provisioner};
use crate::stages::resize::{ImageResizer, ResizeRequest, SizeDelta};

#[derive(Parser)]
#[command(name = "distgit-ci")]
#[command(author, version, about = "Fedora dist-git CI pipeline stages", long_about = None)]
pub struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable debug logging
    #[arg(short, long, global = true, default_value_t = false)]
    verbose: bool,

    /// Configuration file (TOML, JSON or YAML)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,
}

/// Koji credentials and extra client arguments.
#[derive(Args, Debug, Clone)]
struct KojiArgs {
    /// Kerberos keytab used to authenticate to Koji
    #[arg(long, env = "KOJI_KEYTAB")]
    keytab: Option<PathBuf>,

    /// Kerberos principal matching the keytab
    #[arg(long)]
    principal: Option<String>,

    /// Extra global arguments for the koji client, whitespace separated
    #[arg(long, env = "KOJI_PARAMS", allow_hyphen_values = true)]
    koji_params: Option<String>,
}

/// Source repository selection shared by checkout and build-pr.
#[derive(Args, Debug, Clone)]
struct RepoArgs {
    /// Repository name, e.g. "bash"
    #[arg(long)]
    repo: String,

    /// dist-git base URL
    #[arg(long)]
    git_url: Option<String>,

    /// Repository namespace
    #[arg(long)]
    namespace: Option<String>,

    /// Pull request to merge on top of the branch
    #[arg(long)]
    pr: Option<u64>,

    /// Directory the repository is cloned into
    #[arg(long, default_value = ".")]
    workdir: PathBuf,

    /// Directory for the stage log and result document
    #[arg(long, default_value = ".")]
    logs: PathBuf,
}

#[derive(Subcommand)]
enum Commands {
    /// Grow a qcow2 image and its largest partition
    Resize {
        #[arg(long)]
        image: PathBuf,

        /// Space to add, e.g. "+10G"
        #[arg(long)]
        size: SizeDelta,

        /// Partition to expand instead of the largest one
        #[arg(long)]
        partition: Option<String>,

        #[arg(long, default_value = ".")]
        logs: PathBuf,
    },

    /// Download a Fedora base image and customize it with task repositories
    PrepareImage {
        /// "rawhide" or "fNN"
        #[arg(long)]
        release: Release,

        /// Koji task whose packages are installed
        #[arg(long = "task-id")]
        task_ids: Vec<u64>,

        /// Koji task only made available as a repository
        #[arg(long = "additional-task-id")]
        additional_task_ids: Vec<u64>,

        #[arg(long, default_value = ".")]
        artifacts: PathBuf,

        /// Install the packages of the --task-id tasks
        #[arg(long, default_value_t = false)]
        install_rpms: bool,

        /// Skip the system upgrade
        #[arg(long, default_value_t = false)]
        no_sys_update: bool,

        #[command(flatten)]
        koji: KojiArgs,
    },

    /// Clone a dist-git repository and list its test playbooks
    Checkout {
        #[command(flatten)]
        repo: RepoArgs,

        #[arg(long)]
        branch: Option<String>,
    },

    /// Check out a branch (and pull request) and scratch build it in Koji
    BuildPr {
        #[command(flatten)]
        repo: RepoArgs,

        #[arg(long)]
        branch: String,

        #[command(flatten)]
        koji: KojiArgs,
    },

    /// Scratch build an existing checkout in Koji
    CreateBuild {
        /// Checked out repository
        #[arg(long)]
        repo: PathBuf,

        /// Dist tag passed to fedpkg, e.g. "f33"
        #[arg(long)]
        dist_ver: String,

        /// Koji build target
        #[arg(long)]
        release: String,

        #[arg(long, default_value = ".")]
        logs: PathBuf,

        #[command(flatten)]
        koji: KojiArgs,
    },

    /// Boot a VM from an image and save its ansible inventory
    Provision {
        #[arg(long)]
        image: PathBuf,

        /// Inventory file to write
        #[arg(long)]
        output: PathBuf,

        /// Directory receiving the VM logs (defaults to --logs)
        #[arg(long)]
        artifacts: Option<PathBuf>,

        #[arg(long, default_value = ".")]
        logs: PathBuf,
    },

    /// Provision a VM and run a test playbook against it
    RunPlaybook {
        #[arg(long)]
        image: PathBuf,

        #[arg(long)]
        artifacts: PathBuf,

        #[arg(long)]
        playbook: PathBuf,

        /// Extra variable as key=value
        #[arg(long = "extra-vars")]
        extra_vars: Vec<String>,

        /// Don't inspect test.log and results.yml
        #[arg(long, default_value_t = false)]
        no_check_result: bool,
    },

    /// Merge result documents into one, optionally rendering xUnit
    MergeResults {
        /// Directory whose subdirectories each hold a results.yml
        #[arg(long, conflicts_with = "files", required_unless_present = "files")]
        results_path: Option<PathBuf>,

        /// Result documents merged in order
        files: Vec<PathBuf>,

        #[arg(long)]
        output: PathBuf,

        #[arg(long)]
        xunit_file: Option<PathBuf>,

        /// Base URL of log links in the xUnit document
        #[arg(long)]
        base_logs_url: Option<String>,

        #[arg(long, default_value = ".")]
        logs: PathBuf,
    },
}

/// One stage run: owns the log file and writes `<stage>.json` at the end.
struct StageRun {
    name: &'static str,
    dir: PathBuf,
    /// Keys present in the report even when the stage fails early
    keys: &'static [&'static str],
    koji_web_url: Option<String>,
}

impl StageRun {
    fn start(name: &'static str, dir: &Path, verbose: bool, keys: &'static [&'static str]) -> Result<Self> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("Failed to create directory: {}", dir.display()))?;
        let run = Self {
            name,
            dir: dir.to_path_buf(),
            keys,
            koji_web_url: None,
        };
        logging::init(verbose, Some(&run.log_file()))?;
        info!("Starting {name}");
        Ok(run)
    }

    fn with_task_links(mut self, web_url: &str) -> Self {
        self.koji_web_url = Some(web_url.to_string());
        self
    }

    fn log_file(&self) -> PathBuf {
        self.dir.join(format!("{}.log", self.name))
    }

    fn report_file(&self) -> PathBuf {
        self.dir.join(format!("{}.json", self.name))
    }

    /// Writes the stage report and turns the outcome into an exit status.
    fn finish(&self, outcome: std::result::Result<StageReport, PipelineError>) -> Result<i32> {
        let (report, failure) = match outcome {
            Ok(report) => (report, None),
            Err(e) => {
                error!("{e}");
                let mut report = StageReport::failure(self.log_file(), &e);
                if let (Some(web_url), Some(task_id)) = (&self.koji_web_url, e.task_id()) {
                    report = report.with("task_url", koji::task_url(web_url, task_id));
                }
                (report, Some(e))
            }
        };
        let report = self
            .keys
            .iter()
            .fold(report, |report, key| report.with_default_null(key));

        report
            .write(&self.report_file())
            .with_context(|| format!("Failed to write {}", self.report_file().display()))?;
        info!("Stage result saved to {}", self.report_file().display());
        print_stage_summary(self.name, &report);

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(report.status),
        }
    }
}

impl KojiArgs {
    fn apply(&self, config: &mut Config) {
        if let Some(keytab) = &self.keytab {
            config.koji.keytab = Some(keytab.clone());
        }
        if let Some(principal) = &self.principal {
            config.koji.principal = Some(principal.clone());
        }
        if let Some(params) = &self.koji_params {
            config
                .koji
                .extra_args
                .extend(params.split_whitespace().map(str::to_string));
        }
    }
}

impl RepoArgs {
    fn request(&self, config: &Config, branch: Option<&str>) -> CheckoutRequest {
        CheckoutRequest {
            git_url: self.git_url.clone().unwrap_or_else(|| config.git.base_url.clone()),
            namespace: self
                .namespace
                .clone()
                .unwrap_or_else(|| config.git.namespace.clone()),
            repo: self.repo.clone(),
            branch: branch.map_or_else(|| config.git.branch.clone(), str::to_string),
            pr: self.pr,
            workdir: self.workdir.clone(),
        }
    }
}

fn release_info(config: &Config) -> crate::error::Result<ReleaseInfoClient> {
    ReleaseInfoClient::new(&config.image.release_spec_url, config.image.query_retries)
}

async fn resize_image(
    config: &Config,
    log: PathBuf,
    request: ResizeRequest,
) -> crate::error::Result<StageReport> {
    let outcome = ImageResizer::new(&SystemRunner, &config.image)
        .resize(&request)
        .await?;
    Ok(StageReport::success(log)
        .with("image", &outcome.image)
        .with("partition", &outcome.partition)
        .with("original_size", outcome.original_size)
        .with("final_size", outcome.final_size))
}

async fn prepare_image(
    config: &Config,
    log: PathBuf,
    request: PrepareRequest,
) -> crate::error::Result<StageReport> {
    let releases = release_info(config)?;
    let image = ImagePreparer::new(&SystemRunner, &config.image, &config.koji)
        .prepare(&request, &releases)
        .await?;
    Ok(StageReport::success(log)
        .with("image", &image)
        .with("release", request.release.to_string())
        .with("artifacts", &request.artifacts))
}

async fn checkout_repo(
    config: &Config,
    log: PathBuf,
    request: CheckoutRequest,
) -> crate::error::Result<StageReport> {
    let checkout = RepoCheckout::new(&SystemRunner, &config.git);
    let dir = checkout.checkout(&request).await?;
    let playbooks = checkout
        .test_playbooks(&dir, &request.namespace, &config.playbook.tags)
        .await?;
    if playbooks.is_empty() {
        info!("No test playbooks found in {}", dir.display());
    }
    Ok(StageReport::success(log)
        .with("repo_dir", &dir)
        .with("has_tests", !playbooks.is_empty())
        .with("test_playbooks", playbooks))
}

async fn build_pr(
    config: &Config,
    log: PathBuf,
    request: CheckoutRequest,
) -> crate::error::Result<StageReport> {
    let dir = RepoCheckout::new(&SystemRunner, &config.git)
        .checkout(&request)
        .await?;
    let target = BuildTarget::for_branch(&request.branch, &release_info(config)?).await?;
    info!("Building {} for {} ({})", request.repo, target.target, target.dist);
    let outcome = ScratchBuilder::new(&SystemRunner, &config.koji)
        .scratch_build(&dir, &target)
        .await?;
    Ok(StageReport::success(log)
        .with("task_id", outcome.task_id)
        .with("task_url", &outcome.task_url)
        .with("srpm", &outcome.srpm)
        .with("target", &target.target))
}

async fn create_build(
    config: &Config,
    log: PathBuf,
    repo: &Path,
    target: BuildTarget,
) -> crate::error::Result<StageReport> {
    if !repo.is_dir() {
        return Err(PipelineError::Usage(format!(
            "{} is not a directory",
            repo.display()
        )));
    }
    let outcome = ScratchBuilder::new(&SystemRunner, &config.koji)
        .scratch_build(repo, &target)
        .await?;
    Ok(StageReport::success(log)
        .with("task_id", outcome.task_id)
        .with("task_url", &outcome.task_url)
        .with("srpm", &outcome.srpm)
        .with("target", &target.target))
}

async fn provision_vm(
    config: &Config,
    log: PathBuf,
    image: &Path,
    artifacts: &Path,
    output: &Path,
) -> crate::error::Result<StageReport> {
    Provisioner::new(&SystemRunner, &config.provision)
        .provision(image, artifacts, output)
        .await?;
    let (guest_log, qemu_log) = vm_logs(image, artifacts);
    Ok(StageReport::success(log)
        .with("inventory", output)
        .with("guest_log", guest_log)
        .with("qemu_log", qemu_log))
}

async fn run_playbook(
    config: &Config,
    log: PathBuf,
    request: PlaybookRequest,
) -> crate::error::Result<StageReport> {
    let outcome = PlaybookRunner::new(&SystemRunner, &config.provision, &config.playbook)
        .run(&request)
        .await?;
    Ok(StageReport::success(log)
        .with_status(outcome.status)
        .with("artifacts", &request.artifacts)
        .with("inventory", &outcome.inventory)
        .with("guest_log", &outcome.guest_log)
        .with("qemu_log", &outcome.qemu_log))
}

fn merge(
    log: PathBuf,
    input: &MergeInput,
    targets: &MergeTargets,
) -> crate::error::Result<StageReport> {
    let outcome = merge_results(input, targets)?;
    print_results_summary(&outcome.document);
    Ok(StageReport::success(log)
        .with("output_file", &targets.output)
        .with("xunit_file", &targets.xunit)
        .with("tests", outcome.document.results.len())
        .with("failures", outcome.document.failures()))
}

impl Cli {
    fn load_config(&self) -> Result<Config> {
        Config::load(self.config.as_deref())
    }

    /// Runs the selected stage and returns the process exit status.
    pub async fn execute(&self) -> Result<i32> {
        let mut config = self.load_config()?;

        match &self.command {
            Commands::Resize {
                image,
                size,
                partition,
                logs,
            } => {
                let run = StageRun::start("resize-image", logs, self.verbose, &["image"])?;
                let request = ResizeRequest {
                    image: image.clone(),
                    delta: *size,
                    partition: partition.clone(),
                };
                run.finish(resize_image(&config, run.log_file(), request).await)
            }
            Commands::PrepareImage {
                release,
                task_ids,
                additional_task_ids,
                artifacts,
                install_rpms,
                no_sys_update,
                koji,
            } => {
                koji.apply(&mut config);
                let run = StageRun::start("prepare-image", artifacts, self.verbose, &["image"])?;
                let request = PrepareRequest {
                    release: *release,
                    task_ids: task_ids.clone(),
                    additional_task_ids: additional_task_ids.clone(),
                    artifacts: artifacts.clone(),
                    install_rpms: *install_rpms,
                    sys_update: !*no_sys_update,
                };
                run.finish(prepare_image(&config, run.log_file(), request).await)
            }
            Commands::Checkout { repo, branch } => {
                let run = StageRun::start(
                    "checkout-repo",
                    &repo.logs,
                    self.verbose,
                    &["test_playbooks", "has_tests"],
                )?;
                let request = repo.request(&config, branch.as_deref());
                run.finish(checkout_repo(&config, run.log_file(), request).await)
            }
            Commands::BuildPr { repo, branch, koji } => {
                koji.apply(&mut config);
                let run = StageRun::start("build-pr", &repo.logs, self.verbose, &["task_id", "task_url"])?
                    .with_task_links(&config.koji.web_url);
                let request = repo.request(&config, Some(branch));
                run.finish(build_pr(&config, run.log_file(), request).await)
            }
            Commands::CreateBuild {
                repo,
                dist_ver,
                release,
                logs,
                koji,
            } => {
                koji.apply(&mut config);
                let run = StageRun::start("create-build", logs, self.verbose, &["task_id", "task_url"])?
                    .with_task_links(&config.koji.web_url);
                let target = BuildTarget {
                    target: release.clone(),
                    dist: dist_ver.clone(),
                };
                run.finish(create_build(&config, run.log_file(), repo, target).await)
            }
            Commands::Provision {
                image,
                output,
                artifacts,
                logs,
            } => {
                let run = StageRun::start(
                    "provision",
                    logs,
                    self.verbose,
                    &["inventory", "guest_log", "qemu_log"],
                )?;
                let artifacts = artifacts.as_deref().unwrap_or(logs.as_path());
                run.finish(provision_vm(&config, run.log_file(), image, artifacts, output).await)
            }
            Commands::RunPlaybook {
                image,
                artifacts,
                playbook,
                extra_vars,
                no_check_result,
            } => {
                let run = StageRun::start(
                    "run-playbook",
                    artifacts,
                    self.verbose,
                    &["inventory", "guest_log", "qemu_log"],
                )?;
                let request = PlaybookRequest {
                    image: image.clone(),
                    artifacts: artifacts.clone(),
                    playbook: playbook.clone(),
                    extra_vars: extra_vars.clone(),
                    check_result: !*no_check_result,
                };
                run.finish(run_playbook(&config, run.log_file(), request).await)
            }
            Commands::MergeResults {
                results_path,
                files,
                output,
                xunit_file,
                base_logs_url,
                logs,
            } => {
                let run = StageRun::start(
                    "merge-results",
                    logs,
                    self.verbose,
                    &["output_file", "xunit_file"],
                )?;
                let input = match results_path {
                    Some(dir) => MergeInput::Directory(dir.clone()),
                    None => MergeInput::Files(files.clone()),
                };
                let targets = MergeTargets {
                    output: output.clone(),
                    xunit: xunit_file.clone(),
                    base_logs_url: base_logs_url.clone(),
                };
                run.finish(merge(run.log_file(), &input, &targets))
            }
        }
    }
}
