//! Compressed root filesystem image creation.
//!
//! Wraps mksquashfs. The staged root is compressed with the volatile
//! trees excluded by wildcard, so the mount point directories themselves
//! survive into the image (the booted system needs them) while their
//! contents do not.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

use crate::error::BuildError;
use crate::process::{self, Cmd};

/// Top-level directories whose contents never belong in the image:
/// process info, device nodes, runtime state, temporary files, and mount
/// scaffolding.
pub const EXCLUDED_TOP_DIRS: &[&str] = &["proc", "sys", "dev", "run", "tmp", "mnt"];

#[derive(Debug, Clone)]
pub struct SquashfsOptions {
    pub compression: String,
    pub block_size: String,
}

/// Compress `source` into a squashfs image at `output`, excluding the
/// contents of the named top-level directories.
pub fn create_squashfs(
    source: &Path,
    excludes: &[&str],
    output: &Path,
    options: &SquashfsOptions,
) -> Result<()> {
    if !source.is_dir() {
        bail!(
            "squashfs source '{}' does not exist or is not a directory",
            source.display()
        );
    }

    if !process::exists("mksquashfs") {
        bail!("mksquashfs not found. Install squashfs-tools.");
    }

    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating output directory '{}'", parent.display()))?;
    }
    if output.exists() {
        fs::remove_file(output)
            .with_context(|| format!("removing stale squashfs '{}'", output.display()))?;
    }

    println!(
        "  Compressing root filesystem ({} compression, {} blocks)...",
        options.compression, options.block_size
    );

    let mut cmd = Cmd::new("mksquashfs")
        .arg_path(source)
        .arg_path(output)
        .args(["-comp", options.compression.as_str()])
        .args(["-b", options.block_size.as_str()])
        .arg("-noappend")
        .arg("-wildcards")
        .arg("-e");
    for dir in excludes {
        cmd = cmd.arg(format!("{}/*", dir));
    }
    cmd.error_msg("mksquashfs failed. Install squashfs-tools.")
        .run_interactive()?;

    let size = fs::metadata(output)
        .with_context(|| format!("reading squashfs metadata '{}'", output.display()))?
        .len();
    println!("  Root image: {} MB", size / 1024 / 1024);
    Ok(())
}

/// Reject an artifact below the configured floor. A squashfs under the
/// floor almost always means the staging tree was empty or truncated.
pub fn verify_min_size(path: &Path, floor_mb: u64) -> Result<u64> {
    let actual = fs::metadata(path)
        .with_context(|| format!("reading artifact metadata '{}'", path.display()))?
        .len();
    let floor = floor_mb * 1024 * 1024;
    if actual < floor {
        return Err(BuildError::ArtifactSize { actual, floor }.into());
    }
    Ok(actual)
}
