//! Mount tracking for the staged root.
//!
//! Chroot stages need `/dev`, `/dev/pts`, `/proc`, and `/sys` mounted
//! inside the working root. Every mount established through the tracker is
//! recorded in order, and `unwind_all` tears the set down in strict
//! reverse order so a nested mount never outlives its parent. The tracker
//! also sweeps the live mount table for leftovers of a previous, possibly
//! crashed run before the pipeline does anything destructive.
//!
//! The [`Mounter`] trait isolates the privileged mount(8)/umount(8) calls
//! so the unwind logic is testable without root.

use anyhow::{Context, Result};
use std::cmp::Reverse;
use std::fs;
use std::path::{Path, PathBuf};

use crate::error::BuildError;
use crate::process::Cmd;
use crate::workspace::WorkingRoot;

/// One mount inside the working root.
#[derive(Debug, Clone)]
pub struct MountPoint {
    /// Absolute mount target, always under the working root.
    pub target: PathBuf,
    /// Bind source path, or the filesystem name for pseudo-filesystems.
    pub source: String,
    /// Filesystem type for pseudo-filesystem mounts; `None` for binds.
    pub fstype: Option<String>,
    pub bind: bool,
}

impl MountPoint {
    /// Bind-mount a host path into the working root.
    pub fn bind(source: &str, target: PathBuf) -> Self {
        MountPoint {
            target,
            source: source.to_string(),
            fstype: None,
            bind: true,
        }
    }

    /// Mount a kernel pseudo-filesystem (proc, sysfs, devpts).
    pub fn pseudo(fstype: &str, target: PathBuf) -> Self {
        MountPoint {
            target,
            source: fstype.to_string(),
            fstype: Some(fstype.to_string()),
            bind: false,
        }
    }

    fn describe(&self) -> String {
        if self.bind {
            format!("bind {} at {}", self.source, self.target.display())
        } else {
            format!("{} at {}", self.source, self.target.display())
        }
    }
}

/// The pseudo-filesystem set every chroot stage needs, in mount order.
/// `/dev` comes first because `/dev/pts` nests inside it.
pub fn chroot_mounts(root: &WorkingRoot) -> Vec<MountPoint> {
    vec![
        MountPoint::bind("/dev", root.join("dev")),
        MountPoint::pseudo("devpts", root.join("dev/pts")),
        MountPoint::pseudo("proc", root.join("proc")),
        MountPoint::pseudo("sysfs", root.join("sys")),
    ]
}

/// Privileged mount operations, separated out so the tracker logic can be
/// exercised with a fake in tests.
pub trait Mounter {
    fn mount(&self, mount: &MountPoint) -> Result<()>;
    /// Unmount a target. With `force`, detach lazily even when busy.
    fn unmount(&self, target: &Path, force: bool) -> Result<()>;
    /// All live mount targets strictly below `root`, in table order.
    fn mounts_under(&self, root: &Path) -> Result<Vec<PathBuf>>;
}

/// Real mounter shelling out to mount(8)/umount(8) and reading
/// `/proc/self/mounts`.
pub struct HostMounter;

impl Mounter for HostMounter {
    fn mount(&self, mount: &MountPoint) -> Result<()> {
        fs::create_dir_all(&mount.target).with_context(|| {
            format!("creating mount target '{}'", mount.target.display())
        })?;

        let cmd = if mount.bind {
            Cmd::new("mount").arg("--bind").arg(&mount.source)
        } else {
            let fstype = mount
                .fstype
                .as_deref()
                .ok_or_else(|| anyhow::anyhow!("non-bind mount '{}' has no fstype", mount.target.display()))?;
            Cmd::new("mount").args(["-t", fstype]).arg(&mount.source)
        };

        cmd.arg_path(&mount.target)
            .error_msg(format!("mount failed for '{}'", mount.target.display()))
            .run()?;
        Ok(())
    }

    fn unmount(&self, target: &Path, force: bool) -> Result<()> {
        let cmd = if force {
            // Lazy+force detach: the kernel finishes the unmount once the
            // last open handle goes away.
            Cmd::new("umount").args(["-l", "-f"])
        } else {
            Cmd::new("umount")
        };
        cmd.arg_path(target)
            .error_msg(format!("umount failed for '{}'", target.display()))
            .run()?;
        Ok(())
    }

    fn mounts_under(&self, root: &Path) -> Result<Vec<PathBuf>> {
        let table = fs::read_to_string("/proc/self/mounts")
            .context("reading /proc/self/mounts")?;
        Ok(parse_mounts_under(&table, root))
    }
}

/// Outcome of one `unwind_all` pass.
#[derive(Debug, Default)]
pub struct UnwindReport {
    /// Targets successfully unmounted, in unwind order.
    pub unmounted: Vec<PathBuf>,
    /// Subset of `unmounted` that needed the forced fallback.
    pub forced: Vec<PathBuf>,
    /// Residue found in the live mount table (not registered this run).
    pub swept: Vec<PathBuf>,
    /// Targets still mounted after everything. Must be empty before any
    /// destructive filesystem step.
    pub residual: Vec<PathBuf>,
}

impl UnwindReport {
    pub fn is_clean(&self) -> bool {
        self.residual.is_empty()
    }
}

/// Ordered record of every mount established under the working root.
pub struct MountTracker {
    root: PathBuf,
    mounter: Box<dyn Mounter>,
    mounted: Vec<MountPoint>,
}

impl MountTracker {
    pub fn new(root: PathBuf, mounter: Box<dyn Mounter>) -> Self {
        MountTracker {
            root,
            mounter,
            mounted: Vec::new(),
        }
    }

    /// Number of currently tracked mounts.
    pub fn tracked(&self) -> usize {
        self.mounted.len()
    }

    /// Perform the mount and record it. The mount point is only recorded
    /// when the mount succeeded, so unwind never touches targets that were
    /// never established.
    pub fn register(&mut self, mount: MountPoint) -> Result<()> {
        if !mount.target.starts_with(&self.root) {
            return Err(BuildError::Mount {
                target: mount.target.clone(),
                detail: format!("target escapes working root '{}'", self.root.display()),
            }
            .into());
        }

        println!("  Mounting {}", mount.describe());
        self.mounter.mount(&mount).map_err(|err| BuildError::Mount {
            target: mount.target.clone(),
            detail: format!("{:#}", err),
        })?;
        self.mounted.push(mount);
        Ok(())
    }

    /// Tear down every tracked mount in reverse registration order, then
    /// sweep the live mount table for leftovers under the root (deepest
    /// first). Individual failures are warned and retried with the forced
    /// fallback; the pass never aborts early. Safe to call repeatedly; a
    /// second call only re-runs the sweep.
    ///
    /// Errors only when the live mount table itself cannot be read, which
    /// means a clean state cannot be verified.
    pub fn unwind_all(&mut self) -> Result<UnwindReport> {
        let mut report = UnwindReport::default();

        while let Some(mount) = self.mounted.pop() {
            self.unmount_with_fallback(&mount.target, &mut report);
        }

        let mut leftover = self.mounter.mounts_under(&self.root)?;
        // Deepest paths first so nested residue comes down before its parent.
        leftover.sort_by_key(|path| Reverse((path.components().count(), path.clone())));
        for target in leftover {
            println!("  Sweeping leftover mount {}", target.display());
            report.swept.push(target.clone());
            self.unmount_with_fallback(&target, &mut report);
        }

        report.residual = self.mounter.mounts_under(&self.root)?;
        for target in &report.residual {
            eprintln!("  [WARN] still mounted: {}", target.display());
        }
        Ok(report)
    }

    fn unmount_with_fallback(&self, target: &Path, report: &mut UnwindReport) {
        match self.mounter.unmount(target, false) {
            Ok(()) => report.unmounted.push(target.to_path_buf()),
            Err(err) => {
                eprintln!(
                    "  [WARN] unmount {} failed ({:#}), retrying with lazy detach",
                    target.display(),
                    err
                );
                match self.mounter.unmount(target, true) {
                    Ok(()) => {
                        report.unmounted.push(target.to_path_buf());
                        report.forced.push(target.to_path_buf());
                    }
                    Err(err) => {
                        // Leave it for the residual scan to report.
                        eprintln!(
                            "  [WARN] forced unmount {} failed: {:#}",
                            target.display(),
                            err
                        );
                    }
                }
            }
        }
    }
}

/// Parse mount targets strictly below `root` out of `/proc/self/mounts`
/// content. The mount point is the second whitespace-separated field;
/// special characters are octal-escaped (`\040` for space).
fn parse_mounts_under(table: &str, root: &Path) -> Vec<PathBuf> {
    let mut out = Vec::new();
    for line in table.lines() {
        let Some(raw) = line.split_whitespace().nth(1) else {
            continue;
        };
        let path = decode_mount_path(raw);
        if path.starts_with(root) && path != root {
            out.push(path);
        }
    }
    out
}

fn decode_mount_path(raw: &str) -> PathBuf {
    use std::os::unix::ffi::OsStringExt;

    let bytes = raw.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'\\' && i + 3 < bytes.len() {
            let digits = [bytes[i + 1], bytes[i + 2], bytes[i + 3]];
            if digits.iter().all(|digit| (b'0'..=b'7').contains(digit)) {
                let value = digits
                    .iter()
                    .fold(0u32, |acc, digit| acc * 8 + u32::from(digit - b'0'));
                if value <= 0xFF {
                    out.push(value as u8);
                    i += 4;
                    continue;
                }
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    PathBuf::from(std::ffi::OsString::from_vec(out))
}
