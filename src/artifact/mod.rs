//! Artifact assembly: from a clean, unmounted root to a bootable ISO.
//!
//! The assembler only ever sees a root whose mounts are verified gone.
//! It builds the ISO tree in the scratch directory; publishing the
//! finished ISO to its destination is the pipeline's job.

pub mod bootloader;
pub mod iso;
pub mod kernel;
pub mod manifest;
pub mod persistence;
pub mod squashfs;

use anyhow::{Context, Result};
use std::fs;
use std::path::{Path, PathBuf};

use crate::config::BuildConfig;
use crate::workspace::WorkingRoot;

use self::squashfs::SquashfsOptions;

/// Name live-boot expects for the compressed root.
const SQUASHFS_NAME: &str = "filesystem.squashfs";
/// Persistence volume location inside the tree.
const PERSISTENCE_TREE_PATH: &str = "live/persistence";

/// Everything a finished build hands back to the caller.
#[derive(Debug, Clone)]
pub struct BuildArtifact {
    pub squashfs: PathBuf,
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub iso: PathBuf,
}

/// Turns a staged root into a bootable artifact. Separated behind a
/// trait so pipeline tests can observe whether assembly was (not)
/// reached without any of the image tooling installed.
pub trait Assembler {
    fn assemble(
        &self,
        root: &WorkingRoot,
        scratch_dir: &Path,
        config: &BuildConfig,
    ) -> Result<BuildArtifact>;
}

/// Real assembler driving mksquashfs, GRUB, and xorriso.
pub struct HostAssembler;

impl Assembler for HostAssembler {
    fn assemble(
        &self,
        root: &WorkingRoot,
        scratch_dir: &Path,
        config: &BuildConfig,
    ) -> Result<BuildArtifact> {
        let tree = scratch_dir.join("iso");
        setup_tree(&tree)?;

        println!("  [1/6] Compressing root filesystem");
        let squashfs_path = tree.join("live").join(SQUASHFS_NAME);
        squashfs::create_squashfs(
            root.path(),
            squashfs::EXCLUDED_TOP_DIRS,
            &squashfs_path,
            &SquashfsOptions {
                compression: config.squashfs_compression.clone(),
                block_size: config.squashfs_block_size.clone(),
            },
        )?;

        println!("  [2/6] Verifying artifact size");
        squashfs::verify_min_size(&squashfs_path, config.min_squashfs_mb)?;

        println!("  [3/6] Selecting kernel and initrd");
        let pair = kernel::select_newest_kernel(&root.join("boot"))?;
        let kernel_path = tree.join("boot/vmlinuz");
        let initrd_path = tree.join("boot/initrd.img");
        fs::copy(&pair.kernel, &kernel_path)
            .with_context(|| format!("copying kernel '{}'", pair.kernel.display()))?;
        fs::copy(&pair.initrd, &initrd_path)
            .with_context(|| format!("copying initrd '{}'", pair.initrd.display()))?;

        println!("  [4/6] Installing bootloader");
        let boot_images = bootloader::install_bootloader(
            &tree,
            scratch_dir,
            &config.image_name,
            &config.volume_label,
        )?;

        println!("  [5/6] Writing persistence volume, manifest, and checksums");
        place_persistence_volume(scratch_dir, &tree)?;
        let packages = manifest::read_installed_packages(root.path())?;
        manifest::write_manifest(&tree, &config.image_name, &pair.version, &packages)?;
        manifest::write_checksum_index(&tree)?;

        println!("  [6/6] Assembling ISO");
        let iso_path = scratch_dir.join(format!("{}.iso", config.image_name));
        iso::assemble_iso(&tree, &boot_images, &config.volume_label, &iso_path)?;

        Ok(BuildArtifact {
            squashfs: squashfs_path,
            kernel: kernel_path,
            initrd: initrd_path,
            iso: iso_path,
        })
    }
}

/// Fresh ISO tree with the standard layout: boot/ for loader bits,
/// live/ for the root image and persistence volume.
fn setup_tree(tree: &Path) -> Result<()> {
    if tree.exists() {
        fs::remove_dir_all(tree)
            .with_context(|| format!("removing stale ISO tree '{}'", tree.display()))?;
    }
    fs::create_dir_all(tree.join("boot"))?;
    fs::create_dir_all(tree.join("live"))?;
    Ok(())
}

/// The persistence stage leaves its image in the scratch directory; move
/// it to its shipping location inside the tree.
fn place_persistence_volume(scratch_dir: &Path, tree: &Path) -> Result<()> {
    let image = scratch_dir.join("persistence.img");
    crate::process::ensure_exists(&image, "persistence volume image")?;
    crate::workspace::atomic_move(&image, &tree.join(PERSISTENCE_TREE_PATH))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_setup_tree_replaces_stale_content() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("iso");
        fs::create_dir_all(tree.join("junk")).unwrap();
        fs::write(tree.join("junk/old.bin"), "x").unwrap();

        setup_tree(&tree).unwrap();

        assert!(!tree.join("junk").exists());
        assert!(tree.join("boot").is_dir());
        assert!(tree.join("live").is_dir());
    }

    #[test]
    fn test_place_persistence_volume_requires_image() {
        let temp = TempDir::new().unwrap();
        let tree = temp.path().join("iso");
        fs::create_dir_all(tree.join("live")).unwrap();

        let err = place_persistence_volume(temp.path(), &tree).unwrap_err();
        assert!(err.to_string().contains("persistence volume image"));

        fs::write(temp.path().join("persistence.img"), "ext4-bytes").unwrap();
        place_persistence_volume(temp.path(), &tree).unwrap();
        assert!(tree.join("live/persistence").is_file());
    }
}
