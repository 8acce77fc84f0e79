use std::path::Path;

use anyhow::{bail, Result};
use liveforge::config::{BaseSource, BuildConfig};
use liveforge::pipeline::{self, Pipeline};
use liveforge::preflight;

const DEFAULT_CONFIG: &str = "build.toml";

fn usage() -> &'static str {
    "Usage:\n  liveforge build [--config <path>]\n  liveforge check [--config <path>]\n  liveforge clean [--config <path>]\n  liveforge config [--config <path>]"
}

fn main() -> Result<()> {
    let args: Vec<String> = std::env::args().skip(1).collect();

    match args.as_slice() {
        [command] => dispatch(command, Path::new(DEFAULT_CONFIG)),
        [command, flag, path] if flag == "--config" => dispatch(command, Path::new(path)),
        _ => bail!(usage()),
    }
}

fn dispatch(command: &str, config_path: &Path) -> Result<()> {
    match command {
        "build" => build(config_path),
        "check" => check(config_path),
        "clean" => clean(config_path),
        "config" => show_config(config_path),
        _ => bail!(usage()),
    }
}

fn build(config_path: &Path) -> Result<()> {
    let config = BuildConfig::load(config_path)?;
    println!("=== liveforge: building {} ===", config.image_name);

    pipeline::install_cancel_handler();
    let mut pipeline = Pipeline::new(config)?;
    let artifact = pipeline.run()?;

    println!("=== Build complete ===");
    println!("  {}", artifact.iso.display());
    Ok(())
}

fn check(config_path: &Path) -> Result<()> {
    let config = BuildConfig::load(config_path)?;
    preflight::verify(&config)?;
    println!("Environment OK for building '{}'", config.image_name);
    Ok(())
}

fn clean(config_path: &Path) -> Result<()> {
    let config = BuildConfig::load(config_path)?;
    preflight::ensure_root()?;
    let mut pipeline = Pipeline::new(config)?;
    pipeline.clean()
}

fn show_config(config_path: &Path) -> Result<()> {
    let config = BuildConfig::load(config_path)?;
    println!("image:        {}", config.image_name);
    println!("volume label: {}", config.volume_label);
    println!("destination:  {}", config.destination.display());
    println!("workspace:    {}", config.workspace_dir.display());
    match &config.base {
        BaseSource::Debootstrap { suite, mirror } => {
            println!("base:         debootstrap {} ({})", suite, mirror);
        }
        BaseSource::Tarball { path } => {
            println!("base:         tarball {}", path.display());
        }
    }
    println!("packages:     {}", config.packages.len());
    println!(
        "squashfs:     {} compression, {} blocks, {} MiB floor",
        config.squashfs_compression, config.squashfs_block_size, config.min_squashfs_mb
    );
    println!(
        "persistence:  {} MiB, label '{}'",
        config.persistence_size_mb, config.persistence_label
    );
    Ok(())
}
