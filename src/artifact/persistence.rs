//! Persistence volume image.
//!
//! A fixed-size ext4 image labeled for live-boot persistence discovery.
//! The booted system overlays its writable state onto this volume; the
//! build only creates and labels it, then ships it in the artifact tree.
//! The volume is created once during the persistence stage and never
//! touched again by later stages.

use anyhow::{Context, Result};
use std::fs::{self, File};
use std::path::{Path, PathBuf};

use crate::process::Cmd;

const IMAGE_NAME: &str = "persistence.img";

/// Create the persistence image under `scratch_dir` and return its path.
///
/// The image is sparse, so a 1 GB volume costs almost nothing on disk
/// until the live system writes into it.
pub fn create_persistence_image(
    scratch_dir: &Path,
    size_mb: u64,
    label: &str,
) -> Result<PathBuf> {
    fs::create_dir_all(scratch_dir)
        .with_context(|| format!("creating scratch directory '{}'", scratch_dir.display()))?;
    let image = scratch_dir.join(IMAGE_NAME);
    if image.exists() {
        fs::remove_file(&image)
            .with_context(|| format!("removing stale persistence image '{}'", image.display()))?;
    }

    println!(
        "  Creating {} MB persistence volume (label '{}')...",
        size_mb, label
    );

    let file = File::create(&image)
        .with_context(|| format!("creating persistence image '{}'", image.display()))?;
    file.set_len(size_mb * 1024 * 1024)
        .with_context(|| format!("sizing persistence image '{}'", image.display()))?;
    drop(file);

    Cmd::new("mkfs.ext4")
        .args(["-q", "-F", "-L", label])
        .arg_path(&image)
        .error_msg("mkfs.ext4 failed. Install e2fsprogs.")
        .run()?;

    write_persistence_conf(&image, scratch_dir)?;
    Ok(image)
}

/// live-boot only activates a persistence volume that carries a
/// `persistence.conf`. debugfs writes the file into the unmounted image,
/// no loop device required.
fn write_persistence_conf(image: &Path, scratch_dir: &Path) -> Result<()> {
    let conf = scratch_dir.join("persistence.conf");
    fs::write(&conf, "/ union\n")
        .with_context(|| format!("writing '{}'", conf.display()))?;

    Cmd::new("debugfs")
        .args(["-w", "-R"])
        .arg(format!("write {} persistence.conf", conf.display()))
        .arg_path(image)
        .error_msg("debugfs failed to write persistence.conf. Install e2fsprogs.")
        .run()?;

    let _ = fs::remove_file(&conf);
    Ok(())
}
