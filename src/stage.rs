//! Stage model and execution against the working root.
//!
//! A stage is a named unit of work with an optional precondition and a
//! declarative action. The fixed stage plan lives in `pipeline::plan`;
//! this module knows how to run one stage. Chroot-based actions assume
//! the controller already established the chroot mounts.

use anyhow::{bail, Result};
use std::path::PathBuf;

use crate::config::BaseSource;
use crate::process::Cmd;
use crate::provision::{InstallOptions, Provisioner};
use crate::workspace::{self, WorkingRoot};

/// Check that must hold before a stage may run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StagePrecondition {
    /// The working root directory exists (Reset ran).
    RootExists,
    /// The working root contains a staged base system.
    PopulatedRoot,
}

/// What a stage does.
#[derive(Debug, Clone)]
pub enum StageAction {
    /// Stage the base system into the root (debootstrap or tarball).
    Base(BaseSource),
    /// Run shell command lines inside the chroot, in order.
    Chroot(Vec<String>),
    /// Install the package set through the provisioner.
    Provision {
        packages: Vec<String>,
        options: InstallOptions,
    },
    /// Create the persistence volume image in the scratch directory.
    Persistence { size_mb: u64, label: String },
}

#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub precondition: Option<StagePrecondition>,
    pub action: StageAction,
    /// Whether the action modifies the working root.
    pub destructive: bool,
}

impl Stage {
    /// Whether this stage runs commands inside the chroot and therefore
    /// needs the pseudo-filesystem mounts up.
    pub fn needs_chroot(&self) -> bool {
        matches!(
            self.action,
            StageAction::Chroot(_) | StageAction::Provision { .. }
        )
    }
}

/// Executes a single stage. The pipeline controller owns ordering,
/// mounts, and error wrapping; implementations only perform the action.
pub trait StageRunner {
    fn run(&self, stage: &Stage, root: &WorkingRoot) -> Result<()>;
}

/// Real runner executing stages against the host.
pub struct HostStageRunner {
    provisioner: Box<dyn Provisioner>,
    scratch_dir: PathBuf,
}

impl HostStageRunner {
    pub fn new(provisioner: Box<dyn Provisioner>, scratch_dir: PathBuf) -> Self {
        HostStageRunner {
            provisioner,
            scratch_dir,
        }
    }
}

impl StageRunner for HostStageRunner {
    fn run(&self, stage: &Stage, root: &WorkingRoot) -> Result<()> {
        if let Some(precondition) = &stage.precondition {
            check_precondition(precondition, root)?;
        }

        match &stage.action {
            StageAction::Base(source) => stage_base(source, root),
            StageAction::Chroot(commands) => {
                for command in commands {
                    run_in_chroot(root, command)?;
                }
                Ok(())
            }
            StageAction::Provision { packages, options } => {
                self.provisioner.install_packages(root, packages, options)
            }
            StageAction::Persistence { size_mb, label } => {
                let image = crate::artifact::persistence::create_persistence_image(
                    &self.scratch_dir,
                    *size_mb,
                    label,
                )?;
                println!("  Persistence volume ready at {}", image.display());
                Ok(())
            }
        }
    }
}

pub fn check_precondition(precondition: &StagePrecondition, root: &WorkingRoot) -> Result<()> {
    match precondition {
        StagePrecondition::RootExists => {
            if !root.path().is_dir() {
                bail!(
                    "precondition not met: working root '{}' does not exist",
                    root.path().display()
                );
            }
        }
        StagePrecondition::PopulatedRoot => {
            if !root.join("etc").is_dir() {
                bail!(
                    "precondition not met: working root '{}' has no staged base system",
                    root.path().display()
                );
            }
        }
    }
    Ok(())
}

fn stage_base(source: &BaseSource, root: &WorkingRoot) -> Result<()> {
    match source {
        BaseSource::Debootstrap { suite, mirror } => {
            println!("  Bootstrapping '{}' base system...", suite);
            Cmd::new("debootstrap")
                .arg("--arch=amd64")
                .arg(suite)
                .arg_path(root.path())
                .arg(mirror)
                .error_msg("debootstrap failed. Install debootstrap.")
                .run_interactive()
        }
        BaseSource::Tarball { path } => {
            println!("  Unpacking base system from {}...", path.display());
            crate::process::ensure_exists(path, "base rootfs archive")?;
            workspace::unpack_base_tarball(path, root.path())
        }
    }
}

fn run_in_chroot(root: &WorkingRoot, command: &str) -> Result<()> {
    println!("  [chroot] {}", command);
    Cmd::new("chroot")
        .arg_path(root.path())
        .args(["sh", "-c", command])
        .env_clear()
        .env("PATH", "/usr/sbin:/usr/bin:/sbin:/bin")
        .env("HOME", "/root")
        .env("DEBIAN_FRONTEND", "noninteractive")
        .env("LC_ALL", "C")
        .error_msg(format!("chroot command failed: {}", command))
        .run_interactive()
}
