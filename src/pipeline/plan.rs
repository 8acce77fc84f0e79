//! The fixed stage plan for a live image build.
//!
//! Stages are declared up front from the configuration and never change
//! once the pipeline starts. Order matters: each stage assumes every
//! earlier one completed.

use crate::config::BuildConfig;
use crate::provision::InstallOptions;
use crate::stage::{Stage, StageAction, StagePrecondition};

pub fn build_plan(config: &BuildConfig) -> Vec<Stage> {
    vec![
        Stage {
            name: "base".to_string(),
            precondition: Some(StagePrecondition::RootExists),
            action: StageAction::Base(config.base.clone()),
            destructive: true,
        },
        Stage {
            name: "provision".to_string(),
            precondition: Some(StagePrecondition::PopulatedRoot),
            action: StageAction::Provision {
                packages: config.packages.clone(),
                options: InstallOptions {
                    no_install_recommends: config.no_install_recommends,
                    update_index_first: config.update_index_first,
                },
            },
            destructive: true,
        },
        Stage {
            name: "configure".to_string(),
            precondition: Some(StagePrecondition::PopulatedRoot),
            action: StageAction::Chroot(configure_commands(config)),
            destructive: true,
        },
        Stage {
            name: "persistence".to_string(),
            precondition: Some(StagePrecondition::PopulatedRoot),
            action: StageAction::Persistence {
                size_mb: config.persistence_size_mb,
                label: config.persistence_label.clone(),
            },
            // Writes only to the scratch directory, never into the root.
            destructive: false,
        },
    ]
}

/// In-chroot setup for a bootable live session: hostname, an unprivileged
/// login user, and a regenerated initrd so live-boot hooks are present.
fn configure_commands(config: &BuildConfig) -> Vec<String> {
    let hostname = hostname_for(&config.image_name);
    vec![
        format!("echo '{}' > /etc/hostname", hostname),
        format!("echo '127.0.1.1 {}' >> /etc/hosts", hostname),
        "id -u live >/dev/null 2>&1 || useradd --create-home --shell /bin/bash live"
            .to_string(),
        "echo 'live:live' | chpasswd".to_string(),
        "if command -v update-initramfs >/dev/null; then update-initramfs -u -k all; fi"
            .to_string(),
    ]
}

/// Derive a valid hostname from the image name: lowercase, alphanumerics
/// and hyphens only, no leading or trailing hyphen.
fn hostname_for(image_name: &str) -> String {
    let mapped: String = image_name
        .to_lowercase()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
        .collect();
    let trimmed = mapped.trim_matches('-');
    if trimmed.is_empty() {
        "liveforge".to_string()
    } else {
        trimmed.to_string()
    }
}
