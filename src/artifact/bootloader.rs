//! Bootloader configuration and boot image generation.
//!
//! Produces everything the ISO needs to boot on both firmware families:
//! the GRUB menu configuration, a BIOS El Torito image (grub core +
//! cdboot prefix), and a standalone EFI loader wrapped in a FAT image.
//! Both loaders embed a small early config that locates the medium by
//! volume label and chains to the shared `boot/grub/grub.cfg`.

use anyhow::{bail, Context, Result};
use std::fs;
use std::path::Path;

use crate::process::Cmd;

/// FAT image size for the EFI system partition area.
const EFIBOOT_SIZE_MB: u32 = 16;

/// Where Debian-family hosts keep the GRUB platform files.
const GRUB_BIOS_DIR: &str = "/usr/lib/grub/i386-pc";
const GRUB_EFI_DIR: &str = "/usr/lib/grub/x86_64-efi";

/// Boot image locations inside the ISO tree, as xorriso wants them
/// (relative paths).
#[derive(Debug, Clone)]
pub struct BootImages {
    pub bios_image: String,
    pub efi_image: String,
}

/// Render the boot menu. Three entries, one kernel: normal persistent
/// boot, a fully ephemeral session, and a recovery entry with graphics
/// acceleration off.
pub fn render_grub_config(image_name: &str, volume_label: &str) -> String {
    format!(
        r#"set default=0
set timeout=5

search --no-floppy --label --set=root {label}

menuentry "{name} (persistent)" {{
    linux /boot/vmlinuz boot=live components persistence quiet splash
    initrd /boot/initrd.img
}}

menuentry "{name} (ephemeral, no persistence)" {{
    linux /boot/vmlinuz boot=live components nopersistence quiet splash
    initrd /boot/initrd.img
}}

menuentry "{name} (recovery mode)" {{
    linux /boot/vmlinuz boot=live components persistence nomodeset single
    initrd /boot/initrd.img
}}
"#,
        name = image_name,
        label = volume_label
    )
}

/// Early config embedded into both standalone loaders: find the medium
/// by label, then hand over to the menu config on it.
fn render_embedded_config(volume_label: &str) -> String {
    format!(
        r#"search --no-floppy --label --set=root {label}
set prefix=($root)/boot/grub
configfile $prefix/grub.cfg
"#,
        label = volume_label
    )
}

/// Write the menu config and build both boot images inside `tree`.
///
/// Returns the tree-relative image paths for the ISO assembler.
pub fn install_bootloader(
    tree: &Path,
    scratch_dir: &Path,
    image_name: &str,
    volume_label: &str,
) -> Result<BootImages> {
    let grub_dir = tree.join("boot/grub");
    fs::create_dir_all(&grub_dir)
        .with_context(|| format!("creating '{}'", grub_dir.display()))?;

    let menu_config = render_grub_config(image_name, volume_label);
    fs::write(grub_dir.join("grub.cfg"), menu_config)
        .context("writing boot/grub/grub.cfg")?;

    let embedded_path = scratch_dir.join("grub-early.cfg");
    fs::write(&embedded_path, render_embedded_config(volume_label))
        .context("writing early grub config")?;

    println!("  Building BIOS boot image...");
    let bios_image = grub_dir.join("bios.img");
    build_bios_image(&embedded_path, scratch_dir, &bios_image)?;

    println!("  Building EFI boot image...");
    let efi_image = grub_dir.join("efiboot.img");
    build_efi_image(&embedded_path, scratch_dir, &efi_image)?;

    Ok(BootImages {
        bios_image: "boot/grub/bios.img".to_string(),
        efi_image: "boot/grub/efiboot.img".to_string(),
    })
}

/// El Torito BIOS image: cdboot.img prefix followed by a standalone
/// GRUB core built for i386-pc.
fn build_bios_image(embedded_config: &Path, scratch_dir: &Path, output: &Path) -> Result<()> {
    let cdboot = Path::new(GRUB_BIOS_DIR).join("cdboot.img");
    if !cdboot.is_file() {
        bail!(
            "'{}' not found. Install grub-pc-bin.",
            cdboot.display()
        );
    }

    let core = scratch_dir.join("grub-core-bios.img");
    grub_mkstandalone("i386-pc", embedded_config, &core)?;

    let mut image = fs::read(&cdboot)
        .with_context(|| format!("reading '{}'", cdboot.display()))?;
    let core_bytes =
        fs::read(&core).with_context(|| format!("reading '{}'", core.display()))?;
    image.extend_from_slice(&core_bytes);
    fs::write(output, image)
        .with_context(|| format!("writing BIOS boot image '{}'", output.display()))?;
    Ok(())
}

/// Standalone EFI loader placed at EFI/BOOT/BOOTX64.EFI inside a FAT
/// image, so firmware finds it on the El Torito alternative boot entry.
fn build_efi_image(embedded_config: &Path, scratch_dir: &Path, output: &Path) -> Result<()> {
    if !Path::new(GRUB_EFI_DIR).is_dir() {
        bail!(
            "'{}' not found. Install grub-efi-amd64-bin.",
            GRUB_EFI_DIR
        );
    }

    let loader = scratch_dir.join("BOOTX64.EFI");
    grub_mkstandalone("x86_64-efi", embedded_config, &loader)?;

    create_fat_image(output, EFIBOOT_SIZE_MB)?;
    fat_mkdir(output, "::EFI")?;
    fat_mkdir(output, "::EFI/BOOT")?;
    fat_copy(output, &loader, "::EFI/BOOT/")?;
    Ok(())
}

/// Build a self-contained loader with the early config baked into its
/// memdisk. grub-mkstandalone embeds every module by default; locales
/// and fonts are trimmed to keep the images small.
fn grub_mkstandalone(format: &str, embedded_config: &Path, output: &Path) -> Result<()> {
    Cmd::new("grub-mkstandalone")
        .args(["-O", format])
        .arg("-o")
        .arg_path(output)
        .args(["--locales=", "--fonts=", "--themes="])
        .arg(format!("boot/grub/grub.cfg={}", embedded_config.display()))
        .error_msg("grub-mkstandalone failed. Install grub-common.")
        .run()?;
    Ok(())
}

/// Create an empty FAT16 image with dd + mkfs.fat.
fn create_fat_image(output: &Path, size_mb: u32) -> Result<()> {
    Cmd::new("dd")
        .arg("if=/dev/zero")
        .arg(format!("of={}", output.display()))
        .arg("bs=1M")
        .arg(format!("count={}", size_mb))
        .error_msg("dd failed to create the EFI FAT image")
        .run()?;

    Cmd::new("mkfs.fat")
        .args(["-F", "16"])
        .arg_path(output)
        .error_msg("mkfs.fat failed. Install dosfstools.")
        .run()?;

    Ok(())
}

fn fat_mkdir(fat_image: &Path, dir: &str) -> Result<()> {
    Cmd::new("mmd")
        .arg("-i")
        .arg_path(fat_image)
        .arg(dir)
        .error_msg(format!("mmd failed to create {} directory", dir))
        .run()?;
    Ok(())
}

fn fat_copy(fat_image: &Path, src: &Path, dst: &str) -> Result<()> {
    Cmd::new("mcopy")
        .arg("-i")
        .arg_path(fat_image)
        .arg_path(src)
        .arg(dst)
        .error_msg(format!("mcopy failed to copy {}", src.display()))
        .run()?;
    Ok(())
}
