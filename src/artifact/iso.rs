//! Hybrid BIOS+EFI ISO assembly.
//!
//! Drives xorriso in mkisofs emulation. The BIOS path boots through the
//! El Torito image, the EFI path through the alternative boot entry
//! pointing at the FAT image, and `-isohybrid-gpt-basdat` makes the same
//! file bootable when written raw to a USB stick.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

use crate::artifact::bootloader::BootImages;
use crate::process::Cmd;

/// Offset of the mountable partition in 2 KB blocks. 16 is the smallest
/// value xorriso accepts.
const PARTITION_OFFSET: u32 = 16;

/// Assemble the ISO from a finished tree.
pub fn assemble_iso(
    tree: &Path,
    boot: &BootImages,
    volume_label: &str,
    output: &Path,
) -> Result<()> {
    if !tree.is_dir() {
        bail!("ISO tree '{}' does not exist", tree.display());
    }
    for image in [&boot.bios_image, &boot.efi_image] {
        if !tree.join(image).is_file() {
            bail!("boot image '{}' missing from ISO tree", image);
        }
    }
    if let Some(parent) = output.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("creating output directory '{}'", parent.display()))?;
    }

    println!("  Assembling hybrid ISO (label {})...", volume_label);

    Cmd::new("xorriso")
        .args(["-as", "mkisofs", "-o"])
        .arg_path(output)
        .args(["-V", volume_label])
        .args(["-R", "-J", "-joliet-long"])
        .arg("-partition_offset")
        .arg(PARTITION_OFFSET.to_string())
        .arg("-b")
        .arg(&boot.bios_image)
        .args(["-no-emul-boot", "-boot-load-size", "4", "-boot-info-table"])
        .arg("-eltorito-alt-boot")
        .arg("-e")
        .arg(&boot.efi_image)
        .args(["-no-emul-boot", "-isohybrid-gpt-basdat"])
        .arg_path(tree)
        .error_msg("xorriso failed. Install xorriso.")
        .run()?;

    let size = fs::metadata(output)
        .with_context(|| format!("reading ISO metadata '{}'", output.display()))?
        .len();
    println!("  ISO image: {} MB", size / 1024 / 1024);
    Ok(())
}
