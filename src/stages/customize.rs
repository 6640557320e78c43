//! Prepares a Fedora cloud image for testing a set of Koji tasks.
//!
//! The RPMs of every task become a local repository that is copied into the
//! guest together with a repo file pointing at the latest buildroot. Package
//! selection queries `dnf` inside the guest through `guestfish`, so packages
//! conflicting with installed ones or with each other are left out.

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};

use crate::config::{ImageConfig, KojiConfig};
use crate::error::{PipelineError, Result};
use crate::fedora::{Release, ReleaseInfoClient};
use crate::process::{run_checked, with_retries, CommandRunner, Invocation, RetryPolicy};
use crate::stages::koji::KojiClient;

const GUEST_REPO_DIR: &str = "/etc/yum.repos.d";

const INSTALLED_CONFLICTS_QUERY: &str = "dnf repoquery -q --conflict `rpm -qa --qf '%{NAME} '`";
const INSTALLED_CONFLICTS_ATTEMPTS: u32 = 5;

#[derive(Debug, Clone)]
pub struct PrepareRequest {
    pub release: Release,
    /// Tasks whose packages are installed with `install_rpms`
    pub task_ids: Vec<u64>,
    /// Tasks only made available as repositories
    pub additional_task_ids: Vec<u64>,
    pub artifacts: PathBuf,
    pub install_rpms: bool,
    pub sys_update: bool,
}

impl PrepareRequest {
    fn repo_task_ids(&self) -> impl Iterator<Item = u64> + '_ {
        self.task_ids
            .iter()
            .chain(&self.additional_task_ids)
            .copied()
    }
}

/// Repo file enabling the latest buildroot repository of `dist`.
pub fn latest_repo_file(dist: &str) -> String {
    format!(
        "[koji-{dist}-build]\n\
         name=koji-{dist}-build\n\
         baseurl=https://kojipkgs.fedoraproject.org/repos/{dist}-build/latest/x86_64/\n\
         enabled=1\n\
         gpgcheck=0\n"
    )
}

/// Repo file for a task repository copied to `guest_repo_path`.
pub fn task_repo_file(name: &str, guest_repo_path: &str) -> String {
    format!(
        "[test-{name}]\n\
         name=test-{name}\n\
         baseurl=file://{guest_repo_path}/{name}\n\
         priority=0\n\
         enabled=1\n\
         gpgcheck=0\n"
    )
}

/// Installable package names from `dnf repoquery --qf %{ARCH}:%{NAME}` output, sorted.
///
/// Source packages and debuginfo/debugsource packages are left out.
pub fn parse_repo_packages(output: &str) -> Vec<String> {
    let mut names: Vec<String> = output
        .lines()
        .map(str::trim)
        .filter(|line| !line.starts_with("src"))
        .map(|line| line.rsplit_once(':').map_or(line, |(_, name)| name))
        .filter(|name| {
            !name.is_empty() && !name.ends_with("-debuginfo") && !name.ends_with("-debugsource")
        })
        .map(str::to_string)
        .collect();
    names.sort();
    names.dedup();
    names
}

fn query_lines(output: &str) -> impl Iterator<Item = &str> {
    output.lines().map(str::trim).filter(|line| !line.is_empty())
}

/// A task package together with the task packages providing what it conflicts with.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub name: String,
    pub conflicts_with: Vec<String>,
}

/// Picks the packages to install, in candidate order.
///
/// A candidate is skipped when one of the packages it conflicts with was
/// already picked, or when it conflicts with a package installed in the guest.
pub fn select_packages(candidates: &[Candidate], installed_conflicts: &[String]) -> Vec<String> {
    let mut selected: Vec<String> = Vec::new();
    for candidate in candidates {
        if let Some(picked) = candidate
            .conflicts_with
            .iter()
            .find(|name| selected.contains(name))
        {
            info!("will not install {} as it conflicts with {picked}.", candidate.name);
            continue;
        }
        if installed_conflicts.contains(&candidate.name) {
            info!(
                "will not install {} as it conflicts with an installed package.",
                candidate.name
            );
            continue;
        }
        selected.push(candidate.name.clone());
    }
    selected
}

pub struct ImagePreparer<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    image: &'a ImageConfig,
    koji: KojiClient<'a, R>,
}

impl<'a, R: CommandRunner + ?Sized> ImagePreparer<'a, R> {
    pub fn new(runner: &'a R, image: &'a ImageConfig, koji: &'a KojiConfig) -> Self {
        Self {
            runner,
            image,
            koji: KojiClient::new(runner, koji),
        }
    }

    /// Downloads the RPMs of `task_id` and turns them into a repository.
    ///
    /// An existing repository directory is assumed complete and reused.
    pub async fn task_repo(&self, artifacts: &Path, task_id: u64) -> Result<PathBuf> {
        let repo = artifacts.join("task_repos").join(task_id.to_string());
        if repo.is_dir() {
            info!(
                "{} already exists, assume rpms are already downloaded. Skipping...",
                repo.display()
            );
        } else {
            tokio::fs::create_dir_all(&repo).await?;
            self.koji.download_task(task_id, &repo).await?;
        }

        debug!("Creating repo for {}", repo.display());
        run_checked(
            self.runner,
            &Invocation::new("createrepo").arg(".").current_dir(&repo),
        )
        .await
        .map_err(|e| PipelineError::Stage(format!("Couldn't create repo: {e}")))?;
        Ok(repo)
    }

    /// Downloads the base image of `release` into `artifacts`, unless present.
    pub async fn download_image(&self, release: Release, artifacts: &Path) -> Result<PathBuf> {
        let url = release.image_url(&self.image.base_url);
        let file_name = url
            .rsplit('/')
            .next()
            .filter(|name| !name.is_empty())
            .ok_or_else(|| PipelineError::Stage(format!("Invalid image URL {url}")))?;
        let image = artifacts.join(file_name);
        if image.is_file() {
            info!("{} already exists, no need to download.", image.display());
            return Ok(image);
        }

        info!("Downloading {url}");
        let curl = Invocation::new("curl")
            .args([
                "--fail",
                "--connect-timeout",
                "5",
                "--retry",
                "10",
                "--retry-delay",
                "0",
                "--retry-max-time",
                "60",
                "-C",
                "-",
                "-L",
                "-k",
                "-O",
            ])
            .arg(url.as_str())
            .current_dir(artifacts);
        if let Err(e) = run_checked(self.runner, &curl).await {
            if image.is_file() {
                debug!("removing partial qcow2 {}", image.display());
                tokio::fs::remove_file(&image).await?;
            }
            return Err(PipelineError::Stage(format!("Couldn't download qcow2: {e}")));
        }
        debug!("qcow2 is available on {}", image.display());
        Ok(image)
    }

    pub async fn verify_image(&self, image: &Path) -> Result<()> {
        if !image.is_file() {
            return Err(PipelineError::Stage(format!("{} doesn't exist", image.display())));
        }
        info!("Verifying {}", image.display());
        run_checked(self.runner, &Invocation::new("qemu-img").arg("check").path_arg(image))
            .await
            .map_err(|e| PipelineError::Stage(format!("Couldn't verify qcow2 image: {e}")))?;
        Ok(())
    }

    fn virt_customize(&self, image: &Path) -> Invocation {
        Invocation::new("virt-customize")
            .env("LIBGUESTFS_BACKEND", &self.image.libguestfs_backend)
            .arg("-a")
            .path_arg(image)
            .arg("--memsize")
            .arg(self.image.memsize_mb.to_string())
            .arg("--network")
    }

    /// Repository setup: release tweaks, repo files and task repositories.
    fn setup_invocation(
        &self,
        release: Release,
        image: &Path,
        latest_repo: &Path,
        task_repos: &[(PathBuf, PathBuf)],
    ) -> Invocation {
        let mut invocation = match release {
            Release::Rawhide => self.virt_customize(image).args([
                "--run-command",
                "sed -i s/gpgcheck=.*/gpgcheck=0/ /etc/yum.repos.d/*.repo",
            ]),
            Release::Numbered(_) => self.virt_customize(image).args([
                "--run-command",
                "dnf config-manager --set-enable updates-testing updates-testing-debuginfo",
            ]),
        };

        invocation = invocation
            .arg("--copy-in")
            .arg(format!("{}:{GUEST_REPO_DIR}", latest_repo.display()));

        if !task_repos.is_empty() {
            invocation = invocation.args(["--mkdir", self.image.guest_repo_path.as_str()]);
        }
        for (repo, repo_file) in task_repos {
            invocation = invocation
                .arg("--copy-in")
                .arg(format!("{}:{}", repo.display(), self.image.guest_repo_path))
                .arg("--copy-in")
                .arg(format!("{}:{GUEST_REPO_DIR}", repo_file.display()));
        }
        invocation
    }

    /// Runs a shell command inside the guest and returns its output.
    async fn guest_sh(&self, image: &Path, command: &str) -> Result<String> {
        let invocation = Invocation::new("guestfish")
            .env("LIBGUESTFS_BACKEND", &self.image.libguestfs_backend)
            .arg("--network")
            .arg("-m")
            .arg(self.image.memsize_mb.to_string())
            .arg("-a")
            .path_arg(image)
            .args(["-i", "sh"])
            .arg(command);
        Ok(run_checked(self.runner, &invocation).await?.stdout)
    }

    async fn whatprovides(
        &self,
        image: &Path,
        repo_query: &str,
        capability: &str,
    ) -> Result<Vec<String>> {
        let query = format!(
            "dnf repoquery -q --qf \"%{{NAME}}\" {repo_query} --whatprovides \"{capability}\""
        );
        let output = self.guest_sh(image, &query).await?;
        Ok(query_lines(&output).map(str::to_string).collect())
    }

    /// Packages of `task_id` that can be installed into the guest.
    async fn select_task_packages(&self, image: &Path, task_id: u64) -> Result<Vec<String>> {
        let repo_query = format!(
            "--disablerepo=* --enablerepo={task_id} --repofrompath={task_id},{}/{task_id}",
            self.image.guest_repo_path
        );

        debug!("Getting conflict of already installed packages");
        let installed_caps = with_retries(
            RetryPolicy::new(INSTALLED_CONFLICTS_ATTEMPTS, Duration::ZERO),
            "Querying conflicts of installed packages",
            move || self.guest_sh(image, INSTALLED_CONFLICTS_QUERY),
        )
        .await
        .map_err(|e| {
            PipelineError::Stage(format!("Could not query conflict of installed packages: {e}"))
        })?;

        let mut installed_conflicts = Vec::new();
        for capability in query_lines(&installed_caps) {
            let providers = self
                .whatprovides(image, &repo_query, capability)
                .await
                .map_err(|e| {
                    PipelineError::Stage(format!(
                        "Failed to get what packages from repo conflicts with installed packages: {e}"
                    ))
                })?;
            installed_conflicts.extend(providers);
        }

        debug!("Querying rpms provided by {task_id}");
        let all = self
            .guest_sh(
                image,
                &format!("dnf repoquery -q {repo_query} --all --qf=\"%{{ARCH}}:%{{NAME}}\""),
            )
            .await
            .map_err(|e| {
                PipelineError::Stage(format!("Failed to get list of packages from task repo: {e}"))
            })?;
        let names = parse_repo_packages(&all);
        if names.is_empty() {
            return Err(PipelineError::Stage(format!(
                "Couldn't find any package to install from task {task_id}"
            )));
        }

        let mut candidates = Vec::with_capacity(names.len());
        for name in names {
            debug!("Querying what conflicts with {name} from {task_id}");
            let caps = self
                .guest_sh(image, &format!("dnf repoquery -q {repo_query} --conflict {name}"))
                .await?;
            let mut conflicts_with = Vec::new();
            for capability in query_lines(&caps) {
                conflicts_with.extend(self.whatprovides(image, &repo_query, capability).await?);
            }
            candidates.push(Candidate {
                name,
                conflicts_with,
            });
        }

        let selected = select_packages(&candidates, &installed_conflicts);
        if selected.is_empty() {
            return Err(PipelineError::Stage(format!(
                "There is no suitable rpm to be installed from task {task_id}"
            )));
        }
        Ok(selected)
    }

    /// Runs the whole preparation and returns the ready image.
    pub async fn prepare(
        &self,
        request: &PrepareRequest,
        releases: &ReleaseInfoClient,
    ) -> Result<PathBuf> {
        let artifacts = &request.artifacts;
        tokio::fs::create_dir_all(artifacts).await?;

        let mut task_repos = Vec::new();
        for task_id in request.repo_task_ids() {
            let repo = self.task_repo(artifacts, task_id).await?;
            let repo_file = artifacts.join(format!("test-{task_id}.repo"));
            tokio::fs::write(
                &repo_file,
                task_repo_file(&task_id.to_string(), &self.image.guest_repo_path),
            )
            .await?;
            task_repos.push((repo, repo_file));
        }

        let image = self.download_image(request.release, artifacts).await?;
        self.verify_image(&image).await?;

        let dist = releases.dist_for(request.release).await?;
        let latest_repo = artifacts.join("koji-latest.repo");
        tokio::fs::write(&latest_repo, latest_repo_file(&dist)).await?;

        info!("Going to prepare {}", image.display());
        let setup = self.setup_invocation(request.release, &image, &latest_repo, &task_repos);
        run_checked(self.runner, &setup).await?;

        if request.install_rpms {
            for &task_id in &request.task_ids {
                info!("Going to install rpms from {task_id}");
                let packages = self.select_task_packages(&image, task_id).await?.join(" ");
                self.guest_sh(
                    &image,
                    &format!("dnf install -y --best --allowerasing --nogpgcheck {packages}"),
                )
                .await
                .map_err(|e| PipelineError::Stage(format!("Couldn't install {packages}: {e}")))?;
            }
        }

        let mut finish = self.virt_customize(&image);
        if request.sys_update {
            finish = finish.args(["--run-command", "dnf upgrade -y"]);
        }
        run_checked(self.runner, &finish.arg("--selinux-relabel")).await?;

        info!("{} is Ready", image.display());
        Ok(image)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process::testing::{exit, ok, ScriptedRunner};

    const TASKINFO_SCRATCH: &str = "Task: 101\nOptions:\n  scratch: True\nState: closed\n";

    fn request(artifacts: &Path, release: Release) -> PrepareRequest {
        PrepareRequest {
            release,
            task_ids: vec![101],
            additional_task_ids: vec![202],
            artifacts: artifacts.to_path_buf(),
            install_rpms: true,
            sys_update: true,
        }
    }

    /// Makes downloads create the files the real tools would.
    fn fake_downloads(runner: &ScriptedRunner) {
        runner
            .respond("taskinfo", vec![ok(TASKINFO_SCRATCH)])
            .respond_with("download-task", ok(""), |invocation| {
                let dir = invocation.cwd.clone().unwrap();
                for rpm in [
                    "bash-5.0.17-2.fc33.x86_64.rpm",
                    "bash-doc-5.0.17-2.fc33.noarch.rpm",
                    "bash-5.0.17-2.fc33.src.rpm",
                    "bash-debuginfo-5.0.17-2.fc33.x86_64.rpm",
                    "bash-debugsource-5.0.17-2.fc33.x86_64.rpm",
                ] {
                    std::fs::write(dir.join(rpm), "").unwrap();
                }
            })
            .respond_with("curl", ok(""), |invocation| {
                let dir = invocation.cwd.clone().unwrap();
                let name = invocation.args.last().unwrap().rsplit('/').next().unwrap();
                std::fs::write(dir.join(name), "QFI").unwrap();
            });
    }

    const TASK_PACKAGES: &str = "x86_64:bash\nnoarch:bash-doc\nsrc:bash\nx86_64:bash-debuginfo\nx86_64:bash-debugsource\n";

    fn candidate(name: &str, conflicts_with: &[&str]) -> Candidate {
        Candidate {
            name: name.to_string(),
            conflicts_with: conflicts_with.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_parse_repo_packages() {
        let output = "noarch:python3-foo\nx86_64:foo\ni686:foo\nsrc:foo\nx86_64:foo-debuginfo\nx86_64:foo-debugsource\n\n";
        assert_eq!(parse_repo_packages(output), vec!["foo", "python3-foo"]);
        assert!(parse_repo_packages("src:foo\n").is_empty());
    }

    #[test]
    fn test_select_packages_skips_conflicts() {
        let candidates = vec![
            candidate("foo-common", &[]),
            candidate("python2-foo", &["python3-foo"]),
            candidate("python3-foo", &["python2-foo"]),
            candidate("foo-legacy", &[]),
        ];
        let installed_conflicts = vec!["foo-legacy".to_string()];

        assert_eq!(
            select_packages(&candidates, &installed_conflicts),
            vec!["foo-common", "python2-foo"]
        );
        assert!(select_packages(&[candidate("foo-legacy", &[])], &installed_conflicts).is_empty());
    }

    #[test]
    fn test_repo_files() {
        let latest = latest_repo_file("f34");
        assert!(latest.starts_with("[koji-f34-build]\n"));
        assert!(latest
            .contains("baseurl=https://kojipkgs.fedoraproject.org/repos/f34-build/latest/x86_64/\n"));

        let task = task_repo_file("101", "/opt/task_repos");
        assert!(task.contains("[test-101]\n"));
        assert!(task.contains("baseurl=file:///opt/task_repos/101\n"));
        assert!(task.contains("priority=0\n"));
    }

    #[tokio::test]
    async fn test_existing_task_repo_is_not_downloaded_again() {
        let artifacts = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(artifacts.path().join("task_repos/101")).unwrap();
        let runner = ScriptedRunner::new();
        let (image, koji) = (ImageConfig::default(), KojiConfig::default());

        let repo = ImagePreparer::new(&runner, &image, &koji)
            .task_repo(artifacts.path(), 101)
            .await
            .unwrap();

        assert_eq!(repo, artifacts.path().join("task_repos/101"));
        assert_eq!(runner.command_lines(), vec!["createrepo ."]);
    }

    #[tokio::test]
    async fn test_failed_download_removes_partial_image() {
        let artifacts = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        runner.respond_with("curl", exit(28, "timeout"), |invocation| {
            let dir = invocation.cwd.clone().unwrap();
            std::fs::write(dir.join("Fedora-33.qcow2"), "partial").unwrap();
        });
        let (image, koji) = (ImageConfig::default(), KojiConfig::default());

        let err = ImagePreparer::new(&runner, &image, &koji)
            .download_image(Release::Numbered(33), artifacts.path())
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Couldn't download qcow2"));
        assert!(!artifacts.path().join("Fedora-33.qcow2").exists());
    }

    #[tokio::test]
    async fn test_existing_image_is_reused() {
        let artifacts = tempfile::tempdir().unwrap();
        std::fs::write(artifacts.path().join("Fedora-Rawhide.qcow2"), "QFI").unwrap();
        let runner = ScriptedRunner::new();
        let (image, koji) = (ImageConfig::default(), KojiConfig::default());

        let path = ImagePreparer::new(&runner, &image, &koji)
            .download_image(Release::Rawhide, artifacts.path())
            .await
            .unwrap();
        assert_eq!(path, artifacts.path().join("Fedora-Rawhide.qcow2"));
        assert!(runner.calls().is_empty());
    }

    #[tokio::test]
    async fn test_prepare_numbered_release() {
        let artifacts = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        fake_downloads(&runner);
        let (image_config, koji) = (ImageConfig::default(), KojiConfig::default());
        let releases = ReleaseInfoClient::new("http://127.0.0.1:9/unused.spec", 1).unwrap();

        runner.respond("--all --qf", vec![ok(TASK_PACKAGES)]);

        let image = ImagePreparer::new(&runner, &image_config, &koji)
            .prepare(&request(artifacts.path(), Release::Numbered(33)), &releases)
            .await
            .unwrap();

        assert_eq!(image, artifacts.path().join("Fedora-33.qcow2"));
        assert_eq!(runner.count("download-task"), 2);
        assert_eq!(runner.count("createrepo ."), 2);
        assert!(runner.command_lines().iter().any(|line| line.contains(
            "/fedora-f33-image-test/lastSuccessfulBuild/artifact/Fedora-33.qcow2"
        )));

        let latest = std::fs::read_to_string(artifacts.path().join("koji-latest.repo")).unwrap();
        assert!(latest.contains("[koji-f33-build]"));
        assert!(artifacts.path().join("test-101.repo").is_file());
        assert!(artifacts.path().join("test-202.repo").is_file());

        let customize: Vec<_> = runner
            .calls()
            .into_iter()
            .filter(|call| call.program == "virt-customize")
            .collect();
        assert_eq!(customize.len(), 2);
        let setup = customize[0].command_line();
        assert!(setup.contains("--set-enable updates-testing updates-testing-debuginfo"));
        assert!(setup.contains("--mkdir /opt/task_repos"));
        assert!(customize[0]
            .env
            .contains(&("LIBGUESTFS_BACKEND".to_string(), "direct".to_string())));
        assert_eq!(customize[0].args.iter().filter(|a| *a == "--copy-in").count(), 5);

        // Only the installed task contributes packages, queried inside the guest
        assert_eq!(runner.count("--all --qf"), 1);
        assert_eq!(runner.count("--enablerepo=202"), 0);
        let install = runner
            .command_lines()
            .into_iter()
            .find(|line| line.contains("dnf install"))
            .unwrap();
        assert!(install.starts_with("guestfish --network"));
        assert!(install.ends_with("dnf install -y --best --allowerasing --nogpgcheck bash bash-doc"));

        let finish = customize[1].command_line();
        assert!(finish.contains("dnf upgrade -y"));
        assert!(finish.ends_with("--selinux-relabel"));
    }

    #[tokio::test]
    async fn test_conflicting_task_packages_are_skipped() {
        let runner = ScriptedRunner::new();
        runner
            .respond("rpm -qa", vec![ok("foo-legacy\n")])
            .respond("--whatprovides \"foo-legacy\"", vec![ok("foo-common\n")])
            .respond("--whatprovides \"python2-foo\"", vec![ok("python2-foo\n")])
            .respond("--conflict python3-foo", vec![ok("python2-foo\n")])
            .respond(
                "--all --qf",
                vec![ok("noarch:foo-common\nx86_64:python2-foo\nx86_64:python3-foo\n")],
            );
        let (image_config, koji) = (ImageConfig::default(), KojiConfig::default());

        let packages = ImagePreparer::new(&runner, &image_config, &koji)
            .select_task_packages(Path::new("/var/lib/Fedora-33.qcow2"), 101)
            .await
            .unwrap();

        assert_eq!(packages, vec!["python2-foo"]);
        assert!(runner.command_lines().iter().any(|line| line.contains(
            "--disablerepo=* --enablerepo=101 --repofrompath=101,/opt/task_repos/101 --conflict python3-foo"
        )));
    }

    #[tokio::test]
    async fn test_no_suitable_task_package_fails() {
        let runner = ScriptedRunner::new();
        runner
            .respond("rpm -qa", vec![exit(1, "appliance not ready"), ok("foo-legacy\n")])
            .respond("--whatprovides \"foo-legacy\"", vec![ok("foo-legacy\n")])
            .respond("--all --qf", vec![ok("noarch:foo-legacy\n")]);
        let (image_config, koji) = (ImageConfig::default(), KojiConfig::default());

        let err = ImagePreparer::new(&runner, &image_config, &koji)
            .select_task_packages(Path::new("/var/lib/Fedora-33.qcow2"), 101)
            .await
            .unwrap_err();

        assert!(err
            .to_string()
            .contains("There is no suitable rpm to be installed from task 101"));
        assert_eq!(runner.count("rpm -qa"), 2);
    }

    #[tokio::test]
    async fn test_prepare_rawhide_without_update() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/fedora-release.spec")
            .with_status(200)
            .with_body("%define dist_version 34\n")
            .create_async()
            .await;
        let releases =
            ReleaseInfoClient::new(&format!("{}/fedora-release.spec", server.url()), 1).unwrap();

        let artifacts = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::new();
        fake_downloads(&runner);
        let (image_config, koji) = (ImageConfig::default(), KojiConfig::default());
        let mut request = request(artifacts.path(), Release::Rawhide);
        request.install_rpms = false;
        request.sys_update = false;

        ImagePreparer::new(&runner, &image_config, &koji)
            .prepare(&request, &releases)
            .await
            .unwrap();

        let latest = std::fs::read_to_string(artifacts.path().join("koji-latest.repo")).unwrap();
        assert!(latest.contains("[koji-f34-build]"));
        let line = runner
            .command_lines()
            .into_iter()
            .find(|line| line.starts_with("virt-customize"))
            .unwrap();
        assert!(line.contains("sed -i s/gpgcheck=.*/gpgcheck=0/"));
        assert!(!line.contains("dnf install"));
        assert!(!line.contains("dnf upgrade"));
    }

    #[tokio::test]
    async fn test_prepare_fails_without_installable_packages() {
        let artifacts = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(artifacts.path().join("task_repos/101")).unwrap();
        std::fs::write(artifacts.path().join("Fedora-33.qcow2"), "QFI").unwrap();
        let runner = ScriptedRunner::new();
        runner.respond("--all --qf", vec![ok("src:bash\nx86_64:bash-debuginfo\n")]);
        let (image_config, koji) = (ImageConfig::default(), KojiConfig::default());
        let releases = ReleaseInfoClient::new("http://127.0.0.1:9/unused.spec", 1).unwrap();
        let mut request = request(artifacts.path(), Release::Numbered(33));
        request.additional_task_ids.clear();

        let err = ImagePreparer::new(&runner, &image_config, &koji)
            .prepare(&request, &releases)
            .await
            .unwrap_err();
        assert!(err
            .to_string()
            .contains("Couldn't find any package to install from task 101"));
        assert_eq!(runner.count("--selinux-relabel"), 0);
        assert_eq!(runner.count("dnf install"), 0);
    }
}
