//! Package provisioning inside the staged root.
//!
//! The pipeline does not know how software gets installed; it hands the
//! package list to a [`Provisioner`] while the chroot mounts are up. The
//! shipped binding drives apt-get, but the seam exists precisely so other
//! distributions (or test fakes) can slot in.

use anyhow::Result;

use crate::process::Cmd;
use crate::workspace::WorkingRoot;

#[derive(Debug, Clone)]
pub struct InstallOptions {
    /// Skip recommended packages to keep the image lean.
    pub no_install_recommends: bool,
    /// Refresh the package index before installing.
    pub update_index_first: bool,
}

pub trait Provisioner {
    /// Install packages into the root. Runs with the chroot mounts
    /// established; an empty package list is a no-op, not an error.
    fn install_packages(
        &self,
        root: &WorkingRoot,
        packages: &[String],
        options: &InstallOptions,
    ) -> Result<()>;
}

/// apt-get driven provisioner for Debian-family roots.
pub struct AptProvisioner;

impl Provisioner for AptProvisioner {
    fn install_packages(
        &self,
        root: &WorkingRoot,
        packages: &[String],
        options: &InstallOptions,
    ) -> Result<()> {
        if packages.is_empty() {
            println!("  No packages requested, skipping provisioning");
            return Ok(());
        }

        if options.update_index_first {
            println!("  Updating package index...");
            run_apt(root, &["update".to_string()])?;
        }

        println!("  Installing {} package(s)...", packages.len());
        run_apt(root, &install_args(packages, options))?;
        Ok(())
    }
}

fn install_args(packages: &[String], options: &InstallOptions) -> Vec<String> {
    let mut args = vec!["install".to_string(), "-y".to_string()];
    if options.no_install_recommends {
        args.push("--no-install-recommends".to_string());
    }
    args.extend(packages.iter().cloned());
    args
}

fn run_apt(root: &WorkingRoot, apt_args: &[String]) -> Result<()> {
    Cmd::new("chroot")
        .arg_path(root.path())
        .arg("apt-get")
        .args(apt_args)
        .env_clear()
        .env("PATH", "/usr/sbin:/usr/bin:/sbin:/bin")
        .env("HOME", "/root")
        .env("DEBIAN_FRONTEND", "noninteractive")
        .env("LC_ALL", "C")
        .error_msg(format!("apt-get {} failed in chroot", apt_args.join(" ")))
        .run_interactive()
}
