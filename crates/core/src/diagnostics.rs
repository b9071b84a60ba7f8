use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};

use crate::doctor::DoctorInfo;
use crate::report::RunReport;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsBundle {
    pub generated_at: String,
    pub source_report_path: Option<String>,
    pub report: Option<RunReport>,
    pub doctor: DoctorInfo,
    pub environment: DiagnosticsEnvironment,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiagnosticsEnvironment {
    pub os: String,
    pub arch: String,
    pub current_dir: Option<String>,
    pub config_path: Option<String>,
    pub app_version: String,
}

pub fn build_diagnostics_bundle(
    report: Option<&RunReport>,
    source_report_path: Option<&Path>,
    doctor: DoctorInfo,
) -> DiagnosticsBundle {
    DiagnosticsBundle {
        generated_at: Utc::now().to_rfc3339_opts(SecondsFormat::Secs, true),
        source_report_path: source_report_path.map(|path| path.to_string_lossy().to_string()),
        report: report.cloned(),
        environment: DiagnosticsEnvironment {
            os: doctor.os.clone(),
            arch: doctor.arch.clone(),
            current_dir: doctor.current_dir.clone(),
            config_path: doctor.config_path.clone(),
            app_version: env!("CARGO_PKG_VERSION").to_string(),
        },
        doctor,
    }
}

pub fn write_diagnostics_bundle(
    bundle: &DiagnosticsBundle,
    output_path: impl AsRef<Path>,
) -> Result<()> {
    let path = output_path.as_ref();
    let payload =
        serde_json::to_string_pretty(bundle).context("failed to serialize diagnostics bundle")?;
    fs::write(path, payload)
        .with_context(|| format!("failed to write diagnostics bundle to {}", path.display()))?;
    Ok(())
}
