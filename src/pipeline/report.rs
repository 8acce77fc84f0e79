//! Run report persisted into the workspace.
//!
//! Every run writes `report.json` on the way out, success or failure, so
//! an operator can see after the fact which stage a build died in without
//! scrolling terminal output.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::Path;
use time::OffsetDateTime;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StageOutcome {
    pub name: String,
    pub status: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunReport {
    pub image: String,
    pub status: String,
    pub created_at_utc: String,
    pub finished_at_utc: Option<String>,
    pub stages: Vec<StageOutcome>,
    pub artifact: Option<String>,
    pub error: Option<String>,
}

impl RunReport {
    pub fn begin(image: &str) -> RunReport {
        RunReport {
            image: image.to_string(),
            status: "running".to_string(),
            created_at_utc: now_utc_compact(),
            finished_at_utc: None,
            stages: Vec::new(),
            artifact: None,
            error: None,
        }
    }

    pub fn record_stage(&mut self, name: &str, succeeded: bool) {
        self.stages.push(StageOutcome {
            name: name.to_string(),
            status: if succeeded { "success" } else { "failed" }.to_string(),
        });
    }

    pub fn finish_success(&mut self, artifact: &Path) {
        self.status = "success".to_string();
        self.finished_at_utc = Some(now_utc_compact());
        self.artifact = Some(artifact.display().to_string());
    }

    pub fn finish_failure(&mut self, error: &anyhow::Error) {
        self.status = "failed".to_string();
        self.finished_at_utc = Some(now_utc_compact());
        self.error = Some(format!("{:#}", error));
    }

    pub fn write(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self).context("serializing run report")?;
        fs::write(path, json)
            .with_context(|| format!("writing run report '{}'", path.display()))?;
        Ok(())
    }
}

pub fn now_utc_compact() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}{:02}{:02}T{:02}{:02}{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}
