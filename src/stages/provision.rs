use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info};
use serde_yaml::Value;

use crate::config::ProvisionConfig;
use crate::error::{PipelineError, Result};
use crate::process::{run_checked, with_retries, CommandRunner, Invocation};

/// Parses `ansible-inventory --list --yaml` output, requiring a
/// provisioned `localhost` group.
pub fn parse_inventory(output: &str) -> Result<Value> {
    let inventory: Value = serde_yaml::from_str(output)?;
    inventory
        .get("all")
        .and_then(|all| all.get("children"))
        .and_then(|children| children.get("localhost"))
        .ok_or_else(|| PipelineError::Stage("Invalid inventory: no all.children.localhost".into()))?;
    Ok(inventory)
}

/// Log files the qcow2 inventory writes for `image` into `artifacts`.
pub fn vm_logs(image: &Path, artifacts: &Path) -> (PathBuf, PathBuf) {
    let name = image
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    (
        artifacts.join(format!("{name}.guest.log")),
        artifacts.join(format!("{name}.qemu.log")),
    )
}

pub struct Provisioner<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    config: &'a ProvisionConfig,
}

impl<'a, R: CommandRunner + ?Sized> Provisioner<'a, R> {
    pub fn new(runner: &'a R, config: &'a ProvisionConfig) -> Self {
        Self { runner, config }
    }

    /// A local inventory in the working directory replaces the default generator.
    pub fn inventory_source(&self) -> &Path {
        if self.config.local_inventory.is_file() {
            self.config.local_inventory.as_path()
        } else {
            self.config.inventory_script.as_path()
        }
    }

    async fn kill_stale_vm(&self) {
        let kill = Invocation::new("killall").arg(self.config.qemu_binary.as_str());
        match self.runner.run(&kill).await {
            Ok(output) if output.success() => debug!("killed stale {}", self.config.qemu_binary),
            Ok(_) => {}
            Err(e) => debug!("killall: {e}"),
        }
    }

    async fn attempt(&self, invocation: &Invocation) -> Result<Value> {
        self.kill_stale_vm().await;
        let output = run_checked(self.runner, invocation).await?;
        parse_inventory(&output.stdout)
    }

    /// Boots a VM from `image` and saves its inventory to `output`.
    pub async fn provision(&self, image: &Path, artifacts: &Path, output: &Path) -> Result<Value> {
        if !image.is_file() {
            return Err(PipelineError::Usage(format!("{} doesn't exist", image.display())));
        }
        info!("Provisioning {}", image.display());

        let invocation = Invocation::new("ansible-inventory")
            .arg(format!("--inventory={}", self.inventory_source().display()))
            .args(["--list", "--yaml"])
            .env("TEST_DEBUG", "1")
            .env("TEST_SUBJECTS", image.to_string_lossy())
            .env("TEST_ARTIFACTS", artifacts.to_string_lossy());

        let invocation = &invocation;
        let inventory = with_retries(
            self.config.retry_policy(),
            &format!("Provisioning {}", image.display()),
            || async move { self.attempt(invocation).await },
        )
        .await
        .map_err(|e| PipelineError::Stage(format!("Couldn't provision {}: {e}", image.display())))?;

        if let Some(parent) = output.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(output, serde_yaml::to_string(&inventory)?).await?;

        // Give the inventory script time to print everything about the VM
        tokio::time::sleep(Duration::from_secs(self.config.settle_secs)).await;

        info!("VM is up");
        debug!("Ansible inventory saved on {}", output.display());
        Ok(inventory)
    }
}
