use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::process::RetryPolicy;

/// Configuration file structure for distgit-ci.
///
/// Every constant the pipeline stages rely on (service URLs, retry counts,
/// timeouts, tool paths) lives here so that nothing is read from the ambient
/// environment once the CLI has been parsed.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Config {
    /// Source repository settings
    #[serde(default)]
    pub git: GitConfig,

    /// Koji build service settings
    #[serde(default)]
    pub koji: KojiConfig,

    /// Disk image settings
    #[serde(default)]
    pub image: ImageConfig,

    /// VM provisioning settings
    #[serde(default)]
    pub provision: ProvisionConfig,

    /// Test playbook settings
    #[serde(default)]
    pub playbook: PlaybookConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct GitConfig {
    /// dist-git base URL
    pub base_url: String,

    /// Repository namespace (e.g., "rpms", "tests")
    pub namespace: String,

    /// Branch checked out when none is given
    pub branch: String,

    /// Attempts for clone and pull request fetch
    pub retries: u32,

    /// Delay between attempts
    pub retry_delay_secs: u64,

    /// Seconds any single git command may run
    pub command_timeout_secs: u64,

    /// Committer name used for pull request merges
    pub merge_user_name: String,

    /// Committer email used for pull request merges
    pub merge_user_email: String,

    /// Merge commit message
    pub merge_message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct KojiConfig {
    /// Hub XML-RPC endpoint
    pub hub_url: String,

    /// Web UI base, used for task links
    pub web_url: String,

    /// Kerberos keytab used for authentication
    pub keytab: Option<PathBuf>,

    /// Kerberos principal matching the keytab
    pub principal: Option<String>,

    /// Extra global arguments for every koji invocation
    pub extra_args: Vec<String>,

    /// Architecture scratch builds are restricted to
    pub arch_override: String,

    /// Architectures fetched when downloading task RPMs
    pub download_arches: Vec<String>,

    /// Seconds between task state polls
    pub poll_interval_secs: u64,

    /// Seconds after which a running build is treated as failed
    pub build_timeout_secs: u64,

    /// Attempts for build submission
    pub submit_retries: u32,

    /// Delay between submission attempts
    pub retry_delay_secs: u64,

    /// Consecutive failed `taskinfo` polls tolerated while waiting
    pub poll_failures: u32,

    /// Seconds any single koji command may run
    pub command_timeout_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ImageConfig {
    /// Value of LIBGUESTFS_BACKEND for libguestfs tools
    pub libguestfs_backend: String,

    /// Base URL of the image build jobs
    pub base_url: String,

    /// fedora-release spec file used to discover the rawhide version
    pub release_spec_url: String,

    /// Directory inside the guest receiving task repositories
    pub guest_repo_path: String,

    /// Appliance memory for virt-customize
    pub memsize_mb: u32,

    /// Attempts for HTTP queries
    pub query_retries: u32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct ProvisionConfig {
    /// Dynamic inventory generator for qcow2 subjects
    pub inventory_script: PathBuf,

    /// Inventory in the working directory that replaces the default script
    pub local_inventory: PathBuf,

    /// Emulator binary killed before provisioning
    pub qemu_binary: String,

    /// Provisioning attempts
    pub retries: u32,

    /// Delay between attempts
    pub retry_delay_secs: u64,

    /// Seconds to wait after the VM is up
    pub settle_secs: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct PlaybookConfig {
    /// Seconds after which a running playbook is aborted
    pub timeout_secs: u64,

    /// Tags passed to ansible-playbook
    pub tags: String,

    /// Playbook run after a failure to pull artifacts off the VM
    pub sync_artifacts_playbook: PathBuf,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            base_url: "https://src.fedoraproject.org".to_string(),
            namespace: "rpms".to_string(),
            branch: "master".to_string(),
            retries: 5,
            retry_delay_secs: 10,
            command_timeout_secs: 30 * 60,
            merge_user_name: "Fedora CI".to_string(),
            merge_user_email: "ci@lists.fedoraproject.org".to_string(),
            merge_message: "Fedora CI pipeline".to_string(),
        }
    }
}

impl Default for KojiConfig {
    fn default() -> Self {
        Self {
            hub_url: "https://koji.fedoraproject.org/kojihub".to_string(),
            web_url: "https://koji.fedoraproject.org/koji".to_string(),
            keytab: None,
            principal: None,
            extra_args: Vec::new(),
            arch_override: "x86_64".to_string(),
            download_arches: vec![
                "x86_64".to_string(),
                "src".to_string(),
                "noarch".to_string(),
            ],
            poll_interval_secs: 10,
            build_timeout_secs: 6 * 60 * 60,
            submit_retries: 5,
            retry_delay_secs: 10,
            poll_failures: 5,
            command_timeout_secs: 30 * 60,
        }
    }
}

impl Default for ImageConfig {
    fn default() -> Self {
        Self {
            libguestfs_backend: "direct".to_string(),
            base_url: "https://jenkins-continuous-infra.apps.ci.centos.org/job".to_string(),
            release_spec_url:
                "https://src.fedoraproject.org/rpms/fedora-release/raw/master/f/fedora-release.spec"
                    .to_string(),
            guest_repo_path: "/opt/task_repos".to_string(),
            memsize_mb: 4096,
            query_retries: 10,
        }
    }
}

impl Default for ProvisionConfig {
    fn default() -> Self {
        Self {
            inventory_script: PathBuf::from(
                "/usr/share/ansible/inventory/standard-inventory-qcow2",
            ),
            local_inventory: PathBuf::from("inventory"),
            qemu_binary: "/usr/bin/qemu-system-x86_64".to_string(),
            retries: 5,
            retry_delay_secs: 0,
            settle_secs: 5,
        }
    }
}

impl Default for PlaybookConfig {
    fn default() -> Self {
        Self {
            timeout_secs: 4 * 60 * 60,
            tags: "classic".to_string(),
            sync_artifacts_playbook: PathBuf::from("/tmp/sync-artifacts.yml"),
        }
    }
}

impl GitConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, Duration::from_secs(self.retry_delay_secs))
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl KojiConfig {
    pub fn submit_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.submit_retries, Duration::from_secs(self.retry_delay_secs))
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn build_timeout(&self) -> Duration {
        Duration::from_secs(self.build_timeout_secs)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

impl ProvisionConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(self.retries, Duration::from_secs(self.retry_delay_secs))
    }
}

impl Config {
    /// Load configuration from a file.
    ///
    /// Searches for configuration files in this order:
    /// 1. Specified path
    /// 2. ./distgit-ci.toml, ./distgit-ci.json, ./distgit-ci.yaml, ./distgit-ci.yml
    /// 3. `<user config dir>/distgit-ci/config.toml`
    ///
    /// Returns default configuration if no file is found. An explicitly
    /// specified path that cannot be read is an error.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load_from_path(path);
        }

        let candidates = [
            "distgit-ci.toml",
            "distgit-ci.json",
            "distgit-ci.yaml",
            "distgit-ci.yml",
        ];

        for candidate in &candidates {
            let path = Path::new(candidate);
            if path.exists() {
                return Self::load_from_path(path);
            }
        }

        if let Some(user_config) =
            dirs::config_dir().map(|dir| dir.join("distgit-ci").join("config.toml"))
        {
            if user_config.exists() {
                return Self::load_from_path(&user_config);
            }
        }

        Ok(Self::default())
    }

    /// Load configuration from a specific file path.
    fn load_from_path(path: &Path) -> Result<Self> {
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let extension = path.extension().and_then(|ext| ext.to_str()).unwrap_or("");

        match extension {
            "toml" => toml::from_str(&contents)
                .with_context(|| format!("Failed to parse TOML config: {}", path.display())),
            "json" => serde_json::from_str(&contents)
                .with_context(|| format!("Failed to parse JSON config: {}", path.display())),
            "yaml" | "yml" => serde_yaml::from_str(&contents)
                .with_context(|| format!("Failed to parse YAML config: {}", path.display())),
            _ => toml::from_str(&contents)
                .or_else(|_| serde_json::from_str(&contents))
                .or_else(|_| serde_yaml::from_str(&contents))
                .with_context(|| format!("Failed to parse config file: {}", path.display())),
        }
    }
}
