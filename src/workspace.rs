//! Exclusive build workspace.
//!
//! A workspace directory owns everything a run touches on the host: the
//! staged root tree, intermediate artifacts, and the run report. Exactly
//! one controller may operate on a workspace at a time; an advisory file
//! lock enforces that across processes.

use anyhow::{bail, Context, Result};
use fs2::FileExt;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};

/// Lock file name inside the workspace directory.
pub const LOCK_FILE: &str = ".liveforge.lock";

const ROOT_DIR: &str = "root";
const SCRATCH_DIR: &str = "scratch";
const REPORT_FILE: &str = "report.json";

/// The staged root filesystem tree of one run.
///
/// Owned by the pipeline controller; stages and the assembler borrow it.
/// Dropping the handle does not delete the tree (a successful run leaves
/// the staging tree in place for inspection).
#[derive(Debug, Clone)]
pub struct WorkingRoot {
    path: PathBuf,
}

impl WorkingRoot {
    pub fn new(path: PathBuf) -> Self {
        WorkingRoot { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Resolve a path relative to the root. `rel` must not be absolute.
    pub fn join(&self, rel: &str) -> PathBuf {
        self.path.join(rel.trim_start_matches('/'))
    }
}

/// An acquired workspace. The embedded lock file handle keeps the
/// exclusive lock for the lifetime of the value.
pub struct Workspace {
    dir: PathBuf,
    _lock: File,
}

impl Workspace {
    /// Create the workspace directory if needed and take the exclusive
    /// lock. Fails fast when another process holds the workspace.
    pub fn acquire(dir: &Path) -> Result<Workspace> {
        fs::create_dir_all(dir)
            .with_context(|| format!("creating workspace directory '{}'", dir.display()))?;

        let lock_path = dir.join(LOCK_FILE);

        // Do not unlink "stale" lock files. Unlinking a still-locked file
        // can let a second process create a new file at the same path and
        // take a separate exclusive lock, defeating mutual exclusion.
        let lock_file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(&lock_path)
            .with_context(|| format!("creating lock file '{}'", lock_path.display()))?;

        if lock_file.try_lock_exclusive().is_err() {
            drop(lock_file);
            bail!(
                "workspace '{}' is locked by another liveforge process",
                dir.display()
            );
        }

        Ok(Workspace {
            dir: dir.to_path_buf(),
            _lock: lock_file,
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Location of the staged root tree.
    pub fn root_dir(&self) -> PathBuf {
        self.dir.join(ROOT_DIR)
    }

    /// Scratch area for intermediate artifacts (squashfs, ISO tree, ...).
    pub fn scratch_dir(&self) -> PathBuf {
        self.dir.join(SCRATCH_DIR)
    }

    pub fn report_path(&self) -> PathBuf {
        self.dir.join(REPORT_FILE)
    }
}

/// Atomically move a file by renaming, with fallback to copy+delete when
/// source and destination sit on different filesystems.
pub fn atomic_move(src: &Path, dst: &Path) -> Result<()> {
    match fs::rename(src, dst) {
        Ok(()) => Ok(()),
        Err(_) => {
            fs::copy(src, dst)
                .with_context(|| format!("copying {} to {}", src.display(), dst.display()))?;
            fs::remove_file(src)
                .with_context(|| format!("removing {}", src.display()))?;
            Ok(())
        }
    }
}

/// Unpack a base rootfs archive (`.tar` or `.tar.zst`) into `dest`.
///
/// Permissions and ownership from the archive are preserved; the caller
/// runs as root, so device nodes and setuid bits survive.
pub fn unpack_base_tarball(archive: &Path, dest: &Path) -> Result<()> {
    let file = File::open(archive)
        .with_context(|| format!("opening base archive '{}'", archive.display()))?;

    let name = archive
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("");

    if name.ends_with(".tar.zst") || name.ends_with(".tzst") {
        let decoder = zstd::stream::Decoder::new(file)
            .with_context(|| format!("reading zstd stream from '{}'", archive.display()))?;
        unpack_tar(tar::Archive::new(decoder), archive, dest)
    } else if name.ends_with(".tar") {
        unpack_tar(tar::Archive::new(file), archive, dest)
    } else {
        bail!(
            "unsupported base archive '{}' (expected .tar or .tar.zst)",
            archive.display()
        );
    }
}

fn unpack_tar<R: std::io::Read>(
    mut archive: tar::Archive<R>,
    source: &Path,
    dest: &Path,
) -> Result<()> {
    archive.set_preserve_permissions(true);
    archive.set_preserve_ownerships(true);
    archive
        .unpack(dest)
        .with_context(|| format!("unpacking '{}' into '{}'", source.display(), dest.display()))?;
    Ok(())
}
