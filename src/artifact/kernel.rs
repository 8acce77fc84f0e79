//! Kernel and initrd selection from the staged root.
//!
//! The provisioner may leave several kernel versions under `/boot` (a
//! metapackage upgrade mid-build, or a base tarball that already carried
//! one). The image boots exactly one, so we pick the newest by version
//! ordering. Plain string comparison gets this wrong ("5.9" would beat
//! "5.10"), hence the numeric-aware comparison below.

use anyhow::{bail, Context, Result};
use std::cmp::Ordering;
use std::fs;
use std::path::{Path, PathBuf};

const KERNEL_PREFIX: &str = "vmlinuz-";

/// Kernel image and matching initrd, both inside the staged root.
#[derive(Debug, Clone)]
pub struct KernelPair {
    pub kernel: PathBuf,
    pub initrd: PathBuf,
    pub version: String,
}

/// Pick the newest kernel under `boot_dir` and resolve its initrd.
pub fn select_newest_kernel(boot_dir: &Path) -> Result<KernelPair> {
    let mut versions = Vec::new();
    let entries = fs::read_dir(boot_dir)
        .with_context(|| format!("reading boot directory '{}'", boot_dir.display()))?;
    for entry in entries {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if let Some(version) = name.strip_prefix(KERNEL_PREFIX) {
            versions.push(version.to_string());
        }
    }

    if versions.is_empty() {
        bail!(
            "no kernel images found under '{}' (expected vmlinuz-<version>)",
            boot_dir.display()
        );
    }

    versions.sort_by(|a, b| compare_versions(a, b));
    let version = versions.pop().unwrap_or_default();
    let kernel = boot_dir.join(format!("{}{}", KERNEL_PREFIX, version));
    let initrd = find_initrd(boot_dir, &version)?;

    println!("  Selected kernel {} (of {} found)", version, versions.len() + 1);
    Ok(KernelPair {
        kernel,
        initrd,
        version,
    })
}

fn find_initrd(boot_dir: &Path, version: &str) -> Result<PathBuf> {
    // Debian naming first, then the initramfs-tools-free spelling.
    let candidates = [
        boot_dir.join(format!("initrd.img-{}", version)),
        boot_dir.join(format!("initramfs-{}.img", version)),
    ];
    for candidate in &candidates {
        if candidate.is_file() {
            return Ok(candidate.clone());
        }
    }
    bail!(
        "kernel {} has no matching initrd under '{}' (looked for initrd.img-{} and initramfs-{}.img)",
        version,
        boot_dir.display(),
        version,
        version
    );
}

/// Compare two version strings chunk-wise: runs of digits compare
/// numerically, everything else byte-wise. A longer version with equal
/// prefix sorts newer ("5.10.0-2" > "5.10.0").
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let mut left = chunks(a).into_iter();
    let mut right = chunks(b).into_iter();
    loop {
        match (left.next(), right.next()) {
            (None, None) => return Ordering::Equal,
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(x), Some(y)) => match (x, y) {
                (Chunk::Num(x), Chunk::Num(y)) => match x.cmp(&y) {
                    Ordering::Equal => continue,
                    other => return other,
                },
                (Chunk::Text(x), Chunk::Text(y)) => match x.cmp(&y) {
                    Ordering::Equal => continue,
                    other => return other,
                },
                // A numeric component outranks a textual one at the same
                // position ("5.10" > "5.experimental").
                (Chunk::Num(_), Chunk::Text(_)) => return Ordering::Greater,
                (Chunk::Text(_), Chunk::Num(_)) => return Ordering::Less,
            },
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum Chunk {
    Num(u64),
    Text(String),
}

fn chunks(version: &str) -> Vec<Chunk> {
    let mut out = Vec::new();
    let mut digits = String::new();
    let mut text = String::new();

    for ch in version.chars() {
        if ch.is_ascii_digit() {
            if !text.is_empty() {
                out.push(Chunk::Text(std::mem::take(&mut text)));
            }
            digits.push(ch);
        } else if ch == '.' || ch == '-' || ch == '_' {
            flush(&mut out, &mut digits, &mut text);
        } else {
            if !digits.is_empty() {
                out.push(Chunk::Num(digits.parse().unwrap_or(u64::MAX)));
                digits.clear();
            }
            text.push(ch);
        }
    }
    flush(&mut out, &mut digits, &mut text);
    out
}

fn flush(out: &mut Vec<Chunk>, digits: &mut String, text: &mut String) {
    if !digits.is_empty() {
        out.push(Chunk::Num(digits.parse().unwrap_or(u64::MAX)));
        digits.clear();
    }
    if !text.is_empty() {
        out.push(Chunk::Text(std::mem::take(text)));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn touch(dir: &Path, name: &str) {
        fs::write(dir.join(name), "").unwrap();
    }

    #[test]
    fn test_newest_of_three() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "vmlinuz-5.10.0");
        touch(temp.path(), "vmlinuz-5.15.0");
        touch(temp.path(), "vmlinuz-5.4.0");
        touch(temp.path(), "initrd.img-5.15.0");

        let pair = select_newest_kernel(temp.path()).unwrap();
        assert_eq!(pair.version, "5.15.0");
        assert!(pair.kernel.ends_with("vmlinuz-5.15.0"));
        assert!(pair.initrd.ends_with("initrd.img-5.15.0"));
    }

    #[test]
    fn test_numeric_beats_lexical() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "vmlinuz-5.9.0");
        touch(temp.path(), "vmlinuz-5.10.0");
        touch(temp.path(), "initrd.img-5.10.0");

        let pair = select_newest_kernel(temp.path()).unwrap();
        assert_eq!(pair.version, "5.10.0");
    }

    #[test]
    fn test_debian_revision_suffixes() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "vmlinuz-6.1.0-9-amd64");
        touch(temp.path(), "vmlinuz-6.1.0-21-amd64");
        touch(temp.path(), "initrd.img-6.1.0-21-amd64");

        let pair = select_newest_kernel(temp.path()).unwrap();
        assert_eq!(pair.version, "6.1.0-21-amd64");
    }

    #[test]
    fn test_alternate_initrd_naming() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "vmlinuz-6.6.8");
        touch(temp.path(), "initramfs-6.6.8.img");

        let pair = select_newest_kernel(temp.path()).unwrap();
        assert!(pair.initrd.ends_with("initramfs-6.6.8.img"));
    }

    #[test]
    fn test_missing_initrd_is_an_error() {
        let temp = TempDir::new().unwrap();
        touch(temp.path(), "vmlinuz-6.6.8");

        let err = select_newest_kernel(temp.path()).unwrap_err();
        assert!(err.to_string().contains("no matching initrd"));
    }

    #[test]
    fn test_empty_boot_dir_is_an_error() {
        let temp = TempDir::new().unwrap();
        let err = select_newest_kernel(temp.path()).unwrap_err();
        assert!(err.to_string().contains("no kernel images"));
    }

    #[test]
    fn test_compare_versions_table() {
        use Ordering::*;
        let cases = [
            ("5.10.0", "5.9.0", Greater),
            ("5.10.0", "5.10.0", Equal),
            ("5.4.0", "5.15.0", Less),
            ("5.10.0-2", "5.10.0", Greater),
            ("6.1.0-21-amd64", "6.1.0-9-amd64", Greater),
            ("5.10", "5.experimental", Greater),
        ];
        for (a, b, expected) in cases {
            assert_eq!(compare_versions(a, b), expected, "{} vs {}", a, b);
        }
    }
}
