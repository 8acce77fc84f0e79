//! Package manifest and checksum index for the artifact tree.
//!
//! The manifest answers "what exactly is in this image" without booting
//! it: package list read straight from the staged dpkg database, selected
//! kernel, and build time. The checksum index covers every file shipped
//! in the ISO tree so media corruption is detectable offline with
//! `sha256sum -c`.

use anyhow::{Context, Result};
use serde::Serialize;
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};
use walkdir::WalkDir;

const DPKG_STATUS: &str = "var/lib/dpkg/status";
const MANIFEST_NAME: &str = "manifest.json";
const INDEX_NAME: &str = "sha256sums.txt";

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct PackageEntry {
    pub name: String,
    pub version: String,
}

#[derive(Debug, Serialize)]
struct Manifest<'a> {
    image: &'a str,
    created_unix: u64,
    kernel: &'a str,
    package_count: usize,
    packages: &'a [PackageEntry],
}

/// Read the installed package set from the staged root's dpkg database.
///
/// A root without a dpkg database (custom tarball bases) degrades to an
/// empty list with a warning instead of failing the build.
pub fn read_installed_packages(root: &Path) -> Result<Vec<PackageEntry>> {
    let status_path = root.join(DPKG_STATUS);
    if !status_path.is_file() {
        eprintln!(
            "  [WARN] no dpkg database at '{}', manifest will list no packages",
            status_path.display()
        );
        return Ok(Vec::new());
    }

    let content = fs::read_to_string(&status_path)
        .with_context(|| format!("reading '{}'", status_path.display()))?;
    Ok(parse_dpkg_status(&content))
}

/// Extract (package, version) pairs for installed packages from a dpkg
/// status file. Stanzas are blank-line separated.
fn parse_dpkg_status(content: &str) -> Vec<PackageEntry> {
    let mut packages = Vec::new();

    for stanza in content.split("\n\n") {
        let mut name = None;
        let mut version = None;
        let mut installed = false;
        for line in stanza.lines() {
            if let Some(value) = line.strip_prefix("Package: ") {
                name = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("Version: ") {
                version = Some(value.trim().to_string());
            } else if let Some(value) = line.strip_prefix("Status: ") {
                installed = value.trim().ends_with(" installed");
            }
        }
        if let (Some(name), Some(version), true) = (name, version, installed) {
            packages.push(PackageEntry { name, version });
        }
    }

    packages.sort_by(|a, b| a.name.cmp(&b.name));
    packages
}

/// Write `manifest.json` at the tree root.
pub fn write_manifest(
    tree: &Path,
    image_name: &str,
    kernel_version: &str,
    packages: &[PackageEntry],
) -> Result<()> {
    let manifest = Manifest {
        image: image_name,
        created_unix: SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|elapsed| elapsed.as_secs())
            .unwrap_or(0),
        kernel: kernel_version,
        package_count: packages.len(),
        packages,
    };

    let path = tree.join(MANIFEST_NAME);
    let json = serde_json::to_string_pretty(&manifest).context("serializing manifest")?;
    fs::write(&path, json).with_context(|| format!("writing '{}'", path.display()))?;
    println!("  Manifest lists {} package(s)", packages.len());
    Ok(())
}

/// Write `sha256sums.txt` covering every file in the tree (except the
/// index itself), in `sha256sum -c` format with tree-relative paths.
/// Returns the number of indexed files.
pub fn write_checksum_index(tree: &Path) -> Result<usize> {
    let index_path = tree.join(INDEX_NAME);

    let mut files = Vec::new();
    for entry in WalkDir::new(tree).sort_by_file_name() {
        let entry = entry.context("walking ISO tree")?;
        if !entry.file_type().is_file() || entry.path() == index_path {
            continue;
        }
        files.push(entry.path().to_path_buf());
    }

    let mut index = File::create(&index_path)
        .with_context(|| format!("creating '{}'", index_path.display()))?;
    for file in &files {
        let hash = sha256_file(file)?;
        let rel = file.strip_prefix(tree).unwrap_or(file);
        writeln!(index, "{}  {}", hash, rel.display())
            .with_context(|| format!("writing '{}'", index_path.display()))?;
    }

    println!("  Checksum index covers {} file(s)", files.len());
    Ok(files.len())
}

/// Write `<iso>.sha256` next to the published artifact, with just the
/// filename so `sha256sum -c` works from the download directory.
pub fn write_checksum_sidecar(iso: &Path) -> Result<PathBuf> {
    let hash = sha256_file(iso)?;
    let filename = iso
        .file_name()
        .and_then(|name| name.to_str())
        .unwrap_or("image.iso");

    let sidecar = iso.with_extension("iso.sha256");
    fs::write(&sidecar, format!("{}  {}\n", hash, filename))
        .with_context(|| format!("writing '{}'", sidecar.display()))?;
    Ok(sidecar)
}

pub(crate) fn sha256_file(path: &Path) -> Result<String> {
    let file =
        File::open(path).with_context(|| format!("opening '{}'", path.display()))?;
    let mut reader = BufReader::new(file);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = reader.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}
