//! Build configuration loaded from a TOML file.
//!
//! The on-disk format is strict (`deny_unknown_fields`) so a typo in a
//! config key fails the run instead of silently falling back to a default.
//! Loading resolves optional sections into a fully-populated [`BuildConfig`]
//! that the rest of the pipeline consumes without re-checking.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};

/// Resolved configuration for one build run.
#[derive(Debug, Clone)]
pub struct BuildConfig {
    /// Human-readable image name, used in boot menu titles and the manifest.
    pub image_name: String,
    /// ISO9660 volume label.
    pub volume_label: String,
    /// Absolute path of the single output ISO. A pre-existing file here is
    /// deleted before publishing.
    pub destination: PathBuf,
    /// Scratch workspace holding the staged root and intermediate artifacts.
    pub workspace_dir: PathBuf,
    pub base: BaseSource,
    /// Packages installed into the staged root by the provisioning stage.
    pub packages: Vec<String>,
    pub no_install_recommends: bool,
    pub update_index_first: bool,
    pub squashfs_compression: String,
    pub squashfs_block_size: String,
    /// Reject the compressed root image below this size.
    pub min_squashfs_mb: u64,
    pub persistence_size_mb: u64,
    pub persistence_label: String,
}

/// Where the base system for the staged root comes from.
#[derive(Debug, Clone)]
pub enum BaseSource {
    /// Bootstrap a fresh base system with debootstrap(8).
    Debootstrap { suite: String, mirror: String },
    /// Unpack a cached base rootfs archive (`.tar` or `.tar.zst`).
    Tarball { path: PathBuf },
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BuildToml {
    image: ImageToml,
    workspace: Option<WorkspaceToml>,
    base: BaseToml,
    packages: Option<PackagesToml>,
    artifact: Option<ArtifactToml>,
    persistence: Option<PersistenceToml>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ImageToml {
    name: String,
    label: Option<String>,
    destination: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct WorkspaceToml {
    dir: String,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct BaseToml {
    source: String,
    suite: Option<String>,
    mirror: Option<String>,
    tarball: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PackagesToml {
    install: Option<Vec<String>>,
    no_install_recommends: Option<bool>,
    update_index_first: Option<bool>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct ArtifactToml {
    squashfs_compression: Option<String>,
    squashfs_block_size: Option<String>,
    min_squashfs_mb: Option<u64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct PersistenceToml {
    size_mb: Option<u64>,
    label: Option<String>,
}

const DEFAULT_SUITE: &str = "bookworm";
const DEFAULT_MIRROR: &str = "http://deb.debian.org/debian";
const DEFAULT_COMPRESSION: &str = "zstd";
const DEFAULT_BLOCK_SIZE: &str = "1M";
const DEFAULT_MIN_SQUASHFS_MB: u64 = 100;
// The persistence volume ships inside the ISO at full size.
const DEFAULT_PERSISTENCE_MB: u64 = 256;
const DEFAULT_PERSISTENCE_LABEL: &str = "persistence";

/// Default workspace location (~/.cache/liveforge/work).
pub fn default_workspace_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("liveforge")
        .join("work")
}

impl BuildConfig {
    pub fn load(config_path: &Path) -> Result<BuildConfig> {
        let config_bytes = fs::read_to_string(config_path)
            .with_context(|| format!("reading build config '{}'", config_path.display()))?;
        let parsed: BuildToml = toml::from_str(&config_bytes)
            .with_context(|| format!("parsing build config '{}'", config_path.display()))?;

        BuildConfig::from_toml(parsed, config_path)
    }

    fn from_toml(parsed: BuildToml, config_path: &Path) -> Result<BuildConfig> {
        let image_name = parsed.image.name.trim().to_string();
        if image_name.is_empty() {
            bail!(
                "invalid build config '{}': image.name must not be empty",
                config_path.display()
            );
        }

        let volume_label = match parsed.image.label {
            Some(label) => label.trim().to_string(),
            None => image_name.to_ascii_uppercase().replace([' ', '-'], "_"),
        };
        if volume_label.is_empty() || volume_label.len() > 32 {
            bail!(
                "invalid build config '{}': image.label must be 1-32 characters",
                config_path.display()
            );
        }

        let destination = PathBuf::from(&parsed.image.destination);
        if !destination.is_absolute() {
            bail!(
                "invalid build config '{}': image.destination must be an absolute path (got '{}')",
                config_path.display(),
                destination.display()
            );
        }

        let workspace_dir = match parsed.workspace {
            Some(workspace) => PathBuf::from(workspace.dir),
            None => default_workspace_dir(),
        };
        if !workspace_dir.is_absolute() {
            bail!(
                "invalid build config '{}': workspace.dir must be an absolute path (got '{}')",
                config_path.display(),
                workspace_dir.display()
            );
        }

        let base = match parsed.base.source.trim().to_ascii_lowercase().as_str() {
            "debootstrap" => BaseSource::Debootstrap {
                suite: parsed
                    .base
                    .suite
                    .unwrap_or_else(|| DEFAULT_SUITE.to_string()),
                mirror: parsed
                    .base
                    .mirror
                    .unwrap_or_else(|| DEFAULT_MIRROR.to_string()),
            },
            "tarball" => {
                let tarball = parsed.base.tarball.as_deref().unwrap_or("").trim().to_string();
                if tarball.is_empty() {
                    bail!(
                        "invalid build config '{}': base.tarball is required when base.source = 'tarball'",
                        config_path.display()
                    );
                }
                BaseSource::Tarball {
                    path: PathBuf::from(tarball),
                }
            }
            other => bail!(
                "invalid build config '{}': unsupported base.source '{}' (expected 'debootstrap' or 'tarball')",
                config_path.display(),
                other
            ),
        };

        let packages_toml = parsed.packages;
        let mut packages = packages_toml
            .as_ref()
            .and_then(|section| section.install.clone())
            .unwrap_or_default()
            .into_iter()
            .map(|package| package.trim().to_string())
            .filter(|package| !package.is_empty())
            .collect::<Vec<_>>();
        let mut seen = std::collections::HashSet::new();
        packages.retain(|package| seen.insert(package.clone()));

        let artifact = parsed.artifact.unwrap_or(ArtifactToml {
            squashfs_compression: None,
            squashfs_block_size: None,
            min_squashfs_mb: None,
        });

        let persistence = parsed.persistence.unwrap_or(PersistenceToml {
            size_mb: None,
            label: None,
        });

        let persistence_size_mb = persistence.size_mb.unwrap_or(DEFAULT_PERSISTENCE_MB);
        if persistence_size_mb == 0 {
            bail!(
                "invalid build config '{}': persistence.size_mb must be greater than zero",
                config_path.display()
            );
        }

        Ok(BuildConfig {
            image_name,
            volume_label,
            destination,
            workspace_dir,
            base,
            packages,
            no_install_recommends: packages_toml
                .as_ref()
                .and_then(|section| section.no_install_recommends)
                .unwrap_or(true),
            update_index_first: packages_toml
                .as_ref()
                .and_then(|section| section.update_index_first)
                .unwrap_or(true),
            squashfs_compression: artifact
                .squashfs_compression
                .unwrap_or_else(|| DEFAULT_COMPRESSION.to_string()),
            squashfs_block_size: artifact
                .squashfs_block_size
                .unwrap_or_else(|| DEFAULT_BLOCK_SIZE.to_string()),
            min_squashfs_mb: artifact.min_squashfs_mb.unwrap_or(DEFAULT_MIN_SQUASHFS_MB),
            persistence_size_mb,
            persistence_label: persistence
                .label
                .unwrap_or_else(|| DEFAULT_PERSISTENCE_LABEL.to_string()),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use tempfile::TempDir;

    fn write_config(temp: &TempDir, body: &str) -> PathBuf {
        let path = temp.path().join("liveforge.toml");
        fs::write(&path, body).unwrap();
        path
    }

    #[test]
    fn test_minimal_config_resolves_defaults() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            &temp,
            r#"
[image]
name = "demo"
destination = "/out/demo.iso"

[base]
source = "debootstrap"
"#,
        );

        let config = BuildConfig::load(&path).unwrap();
        assert_eq!(config.image_name, "demo");
        assert_eq!(config.volume_label, "DEMO");
        assert_eq!(config.squashfs_compression, "zstd");
        assert_eq!(config.min_squashfs_mb, 100);
        assert!(config.no_install_recommends);
        assert!(config.update_index_first);
        assert_eq!(config.persistence_size_mb, 256);
        match config.base {
            BaseSource::Debootstrap { suite, .. } => assert_eq!(suite, "bookworm"),
            other => panic!("unexpected base source: {:?}", other),
        }
    }

    #[test]
    fn test_unknown_key_rejected() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            &temp,
            r#"
[image]
name = "demo"
destination = "/out/demo.iso"
typo_key = true

[base]
source = "debootstrap"
"#,
        );

        assert!(BuildConfig::load(&path).is_err());
    }

    #[test]
    fn test_relative_destination_rejected() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            &temp,
            r#"
[image]
name = "demo"
destination = "out/demo.iso"

[base]
source = "debootstrap"
"#,
        );

        let err = BuildConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("absolute path"));
    }

    #[test]
    fn test_tarball_source_requires_path() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            &temp,
            r#"
[image]
name = "demo"
destination = "/out/demo.iso"

[base]
source = "tarball"
"#,
        );

        let err = BuildConfig::load(&path).unwrap_err();
        assert!(err.to_string().contains("base.tarball"));
    }

    #[test]
    fn test_full_config() {
        let temp = TempDir::new().unwrap();
        let path = write_config(
            &temp,
            r#"
[image]
name = "demo"
label = "DEMO_LIVE"
destination = "/out/demo.iso"

[workspace]
dir = "/var/tmp/demo-work"

[base]
source = "tarball"
tarball = "/srv/base.tar.zst"

[packages]
install = ["linux-image-amd64", "live-boot", "", "live-boot"]
no_install_recommends = false
update_index_first = false

[artifact]
squashfs_compression = "xz"
squashfs_block_size = "256K"
min_squashfs_mb = 10

[persistence]
size_mb = 512
label = "home-rw"
"#,
        );

        let config = BuildConfig::load(&path).unwrap();
        assert_eq!(config.volume_label, "DEMO_LIVE");
        assert_eq!(config.workspace_dir, PathBuf::from("/var/tmp/demo-work"));
        assert_eq!(config.packages, vec!["linux-image-amd64", "live-boot"]);
        assert!(!config.no_install_recommends);
        assert!(!config.update_index_first);
        assert_eq!(config.squashfs_compression, "xz");
        assert_eq!(config.min_squashfs_mb, 10);
        assert_eq!(config.persistence_label, "home-rw");
        match config.base {
            BaseSource::Tarball { path } => {
                assert_eq!(path, PathBuf::from("/srv/base.tar.zst"))
            }
            other => panic!("unexpected base source: {:?}", other),
        }
    }
}
