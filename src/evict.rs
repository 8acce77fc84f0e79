//! Eviction of processes keeping the working tree busy.
//!
//! A crashed provisioning run can leave daemons started inside the chroot
//! (apt workers, dbus, gpg agents) with open handles under the working
//! root. Those keep unmounts busy and make tree deletion fail, so Reset
//! terminates them before touching the filesystem.

use anyhow::Result;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Grace period between SIGTERM and the SIGKILL escalation.
const TERM_GRACE: Duration = Duration::from_millis(500);

/// Finds and terminates processes holding files open under a path.
pub trait Evictor {
    /// Returns the number of processes signalled.
    fn evict(&self, path: &Path) -> Result<usize>;
}

/// Real evictor scanning `/proc/<pid>/{cwd,root,exe,fd/*}` links.
pub struct ProcEvictor;

impl Evictor for ProcEvictor {
    fn evict(&self, path: &Path) -> Result<usize> {
        let holders = match find_holders(path) {
            Ok(holders) => holders,
            Err(err) => {
                // No /proc means nothing to scan. Unmount and deletion
                // attempts will surface any real holders.
                eprintln!("  [WARN] cannot scan /proc ({:#}), skipping eviction", err);
                return Ok(0);
            }
        };

        if holders.is_empty() {
            return Ok(0);
        }

        println!(
            "  Evicting {} process(es) holding {}",
            holders.len(),
            path.display()
        );
        for &pid in &holders {
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }

        std::thread::sleep(TERM_GRACE);
        for &pid in &holders {
            if is_alive(pid) {
                eprintln!("  [WARN] pid {} survived SIGTERM, sending SIGKILL", pid);
                unsafe {
                    libc::kill(pid as i32, libc::SIGKILL);
                }
            }
        }

        Ok(holders.len())
    }
}

/// All PIDs (except our own) with cwd, root, exe, or an open fd under `path`.
fn find_holders(path: &Path) -> Result<Vec<u32>> {
    let own_pid = std::process::id();
    let mut holders = Vec::new();

    for entry in fs::read_dir("/proc")? {
        let entry = entry?;
        let Some(pid) = entry
            .file_name()
            .to_str()
            .and_then(|name| name.parse::<u32>().ok())
        else {
            continue;
        };
        if pid == own_pid {
            continue;
        }
        if holds_path(pid, path) {
            holders.push(pid);
        }
    }

    Ok(holders)
}

fn holds_path(pid: u32, path: &Path) -> bool {
    let proc_dir = PathBuf::from(format!("/proc/{}", pid));

    for link in ["cwd", "root", "exe"] {
        if link_under(&proc_dir.join(link), path) {
            return true;
        }
    }

    // Unreadable fd dirs (permissions, or the process exited mid-scan)
    // simply mean no evidence of a holder.
    let Ok(fds) = fs::read_dir(proc_dir.join("fd")) else {
        return false;
    };
    for fd in fds.flatten() {
        if link_under(&fd.path(), path) {
            return true;
        }
    }

    false
}

fn link_under(link: &Path, path: &Path) -> bool {
    match fs::read_link(link) {
        Ok(target) => target.starts_with(path),
        Err(_) => false,
    }
}

fn is_alive(pid: u32) -> bool {
    unsafe { libc::kill(pid as i32, 0) == 0 }
}
