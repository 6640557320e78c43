//! Grows a qcow2 image and the filesystem inside it.
//!
//! Steps, each aborting the stage on failure:
//! 1. Resolve the partition to expand (explicit, or the largest filesystem)
//! 2. Grow the container with `qemu-img resize`
//! 3. Copy the grown image aside to `orig_<name>`
//! 4. `virt-resize --expand` from the copy back into the image
//! 5. `qemu-img check`, then drop the copy
//! 6. Recompress to `compressed_<name>`, check it, rename over the image
//! 7. Re-read the virtual size and compare against the requested growth
//!
//! A failure after step 3 leaves `orig_<name>` in place.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use log::{debug, info};
use serde::Deserialize;

use crate::config::ImageConfig;
use crate::error::{PipelineError, Result};
use crate::output::StepProgress;
use crate::process::{run_checked, CommandRunner, Invocation};

const RESIZE_STEPS: u64 = 7;

/// Amount of space added to an image, in bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SizeDelta(u64);

impl SizeDelta {
    pub fn bytes(self) -> u64 {
        self.0
    }
}

impl FromStr for SizeDelta {
    type Err = PipelineError;

    /// Parses `[+]<N>[K|M|G|T][B|iB]`, units being binary multiples.
    fn from_str(s: &str) -> Result<Self> {
        let invalid = || PipelineError::Usage(format!("Invalid size {s:?}"));

        let text = s.trim();
        let text = text.strip_prefix('+').unwrap_or(text);
        let digits_end = text
            .find(|c: char| !c.is_ascii_digit())
            .unwrap_or(text.len());
        let (number, unit) = text.split_at(digits_end);
        let number: u64 = number.parse().map_err(|_| invalid())?;

        let unit = unit.trim().to_ascii_uppercase();
        let unit = unit
            .strip_suffix("IB")
            .or_else(|| unit.strip_suffix('B'))
            .unwrap_or(unit.as_str());
        let shift = match unit {
            "" => 0,
            "K" => 10,
            "M" => 20,
            "G" => 30,
            "T" => 40,
            _ => return Err(invalid()),
        };

        let bytes = number.checked_shl(shift).filter(|b| b >> shift == number).ok_or_else(invalid)?;
        if bytes == 0 {
            return Err(PipelineError::Usage(format!("Size {s:?} must be positive")));
        }
        Ok(Self(bytes))
    }
}

impl fmt::Display for SizeDelta {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "+{}", self.0)
    }
}

/// A filesystem as listed by `virt-filesystems`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Filesystem {
    pub name: String,
    pub size: u64,
}

impl Filesystem {
    /// Whether the filesystem sits directly on a partition (`/dev/sda1`),
    /// as opposed to a whole disk or a logical volume.
    pub fn is_on_partition(&self) -> bool {
        let Some(device) = self.name.strip_prefix("/dev/") else {
            return false;
        };
        !device.is_empty()
            && !device.contains('/')
            && device.ends_with(|c: char| c.is_ascii_digit())
    }
}

/// Parses `virt-filesystems --filesystems --long --bytes --csv` output.
pub fn parse_filesystems(csv: &str) -> Result<Vec<Filesystem>> {
    let mut lines = csv.lines().filter(|line| !line.trim().is_empty());
    let header: Vec<String> = lines
        .next()
        .map(split_csv_line)
        .ok_or_else(|| PipelineError::Stage("virt-filesystems printed nothing".into()))?;

    let column = |name: &str| {
        header
            .iter()
            .position(|h| h.eq_ignore_ascii_case(name))
            .ok_or_else(|| PipelineError::Stage(format!("virt-filesystems output has no {name} column")))
    };
    let name_column = column("Name")?;
    let size_column = column("Size")?;

    let mut filesystems = Vec::new();
    for line in lines {
        let fields = split_csv_line(line);
        let (Some(name), Some(size)) = (fields.get(name_column), fields.get(size_column)) else {
            debug!("skipping short virt-filesystems line {line:?}");
            continue;
        };
        let Ok(size) = size.parse() else {
            debug!("skipping {name}: size {size:?} is not a number");
            continue;
        };
        filesystems.push(Filesystem {
            name: name.clone(),
            size,
        });
    }
    Ok(filesystems)
}

fn split_csv_line(line: &str) -> Vec<String> {
    line.split(',')
        .map(|field| field.trim().trim_matches('"').to_string())
        .collect()
}

/// Picks the partition holding the largest filesystem; the first listed wins a tie.
pub fn largest_partition(filesystems: &[Filesystem]) -> Option<&Filesystem> {
    filesystems
        .iter()
        .filter(|fs| fs.is_on_partition())
        .fold(None, |best: Option<&Filesystem>, fs| match best {
            Some(current) if current.size >= fs.size => Some(current),
            _ => Some(fs),
        })
}

#[derive(Debug, Clone)]
pub struct ResizeRequest {
    pub image: PathBuf,
    pub delta: SizeDelta,
    pub partition: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResizeOutcome {
    pub image: PathBuf,
    pub partition: String,
    pub original_size: u64,
    pub final_size: u64,
}

#[derive(Deserialize)]
struct ImageInfo {
    #[serde(rename = "virtual-size")]
    virtual_size: u64,
}

fn sibling(image: &Path, prefix: &str) -> Result<PathBuf> {
    let name = image
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| PipelineError::Usage(format!("Invalid image path {}", image.display())))?;
    Ok(image.with_file_name(format!("{prefix}{name}")))
}

pub struct ImageResizer<'a, R: CommandRunner + ?Sized> {
    runner: &'a R,
    config: &'a ImageConfig,
}

impl<'a, R: CommandRunner + ?Sized> ImageResizer<'a, R> {
    pub fn new(runner: &'a R, config: &'a ImageConfig) -> Self {
        Self { runner, config }
    }

    fn guestfs_tool(&self, program: &str) -> Invocation {
        Invocation::new(program).env("LIBGUESTFS_BACKEND", &self.config.libguestfs_backend)
    }

    pub async fn virtual_size(&self, image: &Path) -> Result<u64> {
        let invocation = Invocation::new("qemu-img")
            .args(["info", "--output=json"])
            .path_arg(image);
        let output = run_checked(self.runner, &invocation).await?;
        let info: ImageInfo = serde_json::from_str(&output.stdout)?;
        Ok(info.virtual_size)
    }

    pub async fn check(&self, image: &Path) -> Result<()> {
        info!("Verifying {}", image.display());
        run_checked(self.runner, &Invocation::new("qemu-img").arg("check").path_arg(image)).await?;
        Ok(())
    }

    pub async fn list_filesystems(&self, image: &Path) -> Result<Vec<Filesystem>> {
        let invocation = self
            .guestfs_tool("virt-filesystems")
            .args(["--filesystems", "--long", "--bytes", "--csv", "-a"])
            .path_arg(image);
        let output = run_checked(self.runner, &invocation).await?;
        parse_filesystems(&output.stdout)
    }

    async fn resolve_partition(&self, request: &ResizeRequest) -> Result<String> {
        if let Some(partition) = &request.partition {
            return Ok(partition.clone());
        }
        let filesystems = self.list_filesystems(&request.image).await?;
        let largest = largest_partition(&filesystems).ok_or_else(|| {
            PipelineError::Stage(format!(
                "Couldn't find a partition to expand in {}",
                request.image.display()
            ))
        })?;
        info!("Largest filesystem is {} ({} bytes)", largest.name, largest.size);
        Ok(largest.name.clone())
    }

    pub async fn resize(&self, request: &ResizeRequest) -> Result<ResizeOutcome> {
        let image = &request.image;
        if !image.is_file() {
            return Err(PipelineError::Usage(format!("{} doesn't exist", image.display())));
        }
        let orig = sibling(image, "orig_")?;
        let compressed = sibling(image, "compressed_")?;

        let mut progress = StepProgress::start("Resize", RESIZE_STEPS);

        progress.step("Selecting partition");
        let partition = self.resolve_partition(request).await?;
        let original_size = self.virtual_size(image).await?;

        progress.step(format!("Growing image by {} bytes", request.delta.bytes()));
        info!("Resizing {} by {} bytes", image.display(), request.delta.bytes());
        run_checked(
            self.runner,
            &Invocation::new("qemu-img")
                .arg("resize")
                .path_arg(image)
                .arg(request.delta.to_string()),
        )
        .await?;

        progress.step(format!("Copying to {}", orig.display()));
        tokio::fs::copy(image, &orig).await?;

        progress.step(format!("Expanding {partition}"));
        info!("Expanding {partition}");
        run_checked(
            self.runner,
            &self
                .guestfs_tool("virt-resize")
                .args(["--expand", partition.as_str()])
                .path_arg(&orig)
                .path_arg(image),
        )
        .await?;

        progress.step("Checking image");
        self.check(image).await?;
        tokio::fs::remove_file(&orig).await?;

        progress.step("Compressing image");
        info!("Compressing {}", image.display());
        run_checked(
            self.runner,
            &Invocation::new("qemu-img")
                .args(["convert", "-c", "-O", "qcow2"])
                .path_arg(image)
                .path_arg(&compressed),
        )
        .await?;
        self.check(&compressed).await?;
        tokio::fs::rename(&compressed, image).await?;

        progress.step("Verifying size");
        let final_size = self.virtual_size(image).await?;
        let expected = original_size.saturating_add(request.delta.bytes());
        if final_size < expected {
            return Err(PipelineError::Stage(format!(
                "{} is {final_size} bytes, expected at least {expected}",
                image.display()
            )));
        }

        progress.finish();
        info!("{} resized to {final_size} bytes", image.display());
        Ok(ResizeOutcome {
            image: image.clone(),
            partition,
            original_size,
            final_size,
        })
    }
}
