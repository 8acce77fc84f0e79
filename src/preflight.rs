//! Preflight checks run before the pipeline touches anything.
//!
//! Validates that the host can actually perform a build: effective root,
//! required tools on PATH, and the input assets the configuration points
//! at. Failing here is cheap; failing halfway through a chroot build is
//! not.

use anyhow::{bail, Result};

use crate::config::{BaseSource, BuildConfig};
use crate::process;

/// Host tools every build needs, as (command, package) pairs.
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[
    ("mount", "util-linux"),
    ("umount", "util-linux"),
    ("chroot", "coreutils"),
    ("dd", "coreutils"),
    ("mksquashfs", "squashfs-tools"),
    ("xorriso", "xorriso"),
    ("grub-mkstandalone", "grub-common"),
    ("mkfs.fat", "dosfstools"),
    ("mmd", "mtools"),
    ("mcopy", "mtools"),
    ("mkfs.ext4", "e2fsprogs"),
    ("debugfs", "e2fsprogs"),
];

/// Tools required by the configured build, including base-source extras.
pub fn required_tools_for(config: &BuildConfig) -> Vec<(&'static str, &'static str)> {
    let mut tools = REQUIRED_TOOLS.to_vec();
    if let BaseSource::Debootstrap { .. } = config.base {
        tools.push(("debootstrap", "debootstrap"));
    }
    tools
}

/// Check that every (command, package) pair resolves on PATH, reporting
/// all missing tools at once.
pub fn check_required_tools(tools: &[(&str, &str)]) -> Result<()> {
    let mut missing = Vec::new();

    for (tool, package) in tools {
        if !process::exists(tool) {
            missing.push((*tool, *package));
        }
    }

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(tool, package)| format!("  {} (install: {})", tool, package))
            .collect::<Vec<_>>()
            .join("\n");
        bail!("Missing required host tools:\n{}", msg);
    }

    Ok(())
}

/// Mounting and chrooting are root-only operations.
pub fn ensure_root() -> Result<()> {
    let euid = unsafe { libc::geteuid() };
    if euid != 0 {
        bail!("this command must run as root (current euid is {})", euid);
    }
    Ok(())
}

/// Full preflight for a configured build: privileges, tools, and input
/// assets.
pub fn verify(config: &BuildConfig) -> Result<()> {
    ensure_root()?;
    check_required_tools(&required_tools_for(config))?;

    if let BaseSource::Tarball { path } = &config.base {
        process::ensure_exists(path, "base rootfs archive")?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_check_required_tools_success() {
        // These exist on any Unix system.
        let tools = &[("ls", "coreutils"), ("cat", "coreutils")];
        assert!(check_required_tools(tools).is_ok());
    }

    #[test]
    fn test_check_required_tools_failure_lists_packages() {
        let tools = &[("nonexistent_command_xyz", "fake-package")];
        let err = check_required_tools(tools).unwrap_err();
        assert!(err.to_string().contains("fake-package"));
    }

    #[test]
    fn test_debootstrap_only_required_for_debootstrap_source() {
        let debootstrap_config = test_config(BaseSource::Debootstrap {
            suite: "bookworm".to_string(),
            mirror: "http://deb.debian.org/debian".to_string(),
        });
        assert!(required_tools_for(&debootstrap_config)
            .iter()
            .any(|(tool, _)| *tool == "debootstrap"));

        let tarball_config = test_config(BaseSource::Tarball {
            path: "/srv/base.tar.zst".into(),
        });
        assert!(!required_tools_for(&tarball_config)
            .iter()
            .any(|(tool, _)| *tool == "debootstrap"));
    }

    fn test_config(base: BaseSource) -> BuildConfig {
        BuildConfig {
            image_name: "demo".to_string(),
            volume_label: "DEMO".to_string(),
            destination: "/out/demo.iso".into(),
            workspace_dir: "/tmp/work".into(),
            base,
            packages: vec![],
            no_install_recommends: true,
            update_index_first: true,
            squashfs_compression: "zstd".to_string(),
            squashfs_block_size: "1M".to_string(),
            min_squashfs_mb: 100,
            persistence_size_mb: 1024,
            persistence_label: "persistence".to_string(),
        }
    }
}
