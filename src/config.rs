use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, ensure};
use serde::Deserialize;

use crate::error::Error;
use crate::scan::ScanOptions;
use crate::settings::SettingDefaults;

/// Runtime configuration loaded from YAML. Every key is optional.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct Configuration {
    /// Directory holding the store. Defaults to a per-user location.
    pub working_dir: Option<PathBuf>,
    /// Candidate filters and batching for directory scans.
    pub scan: ScanOptions,
    /// How many on-disk candidates the degraded selection path samples from.
    pub fallback_sample_size: usize,
    /// Optional deterministic seed for random photo selection.
    pub selection_seed: Option<u64>,
    /// Values written to the store the first time a setting is read.
    pub defaults: DefaultSettings,
}

impl Configuration {
    /// # Errors
    /// [`Error::Io`] if the file cannot be read, [`Error::Config`] if it is not
    /// a valid configuration.
    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self, Error> {
        let s = std::fs::read_to_string(path)?;
        Ok(serde_yaml::from_str(&s)?)
    }

    /// Validate runtime invariants that cannot be expressed via serde defaults alone.
    pub fn validated(self) -> Result<Self> {
        ensure!(
            !self.scan.extensions.is_empty(),
            "scan.extensions must list at least one extension"
        );
        ensure!(self.scan.batch_size > 0, "scan.batch-size must be greater than zero");
        ensure!(
            self.fallback_sample_size > 0,
            "fallback-sample-size must be greater than zero"
        );
        ensure!(
            self.defaults.duration >= Duration::from_secs(1),
            "defaults.duration must be at least one second"
        );
        Ok(self)
    }

    /// The configured working directory, or the per-user default.
    pub fn resolve_working_dir(&self) -> Result<PathBuf> {
        match &self.working_dir {
            Some(dir) => Ok(dir.clone()),
            None => default_working_dir().context("cannot determine a per-user working directory"),
        }
    }
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            working_dir: None,
            scan: ScanOptions::default(),
            fallback_sample_size: 10,
            selection_seed: None,
            defaults: DefaultSettings::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "kebab-case", default)]
pub struct DefaultSettings {
    /// Library root on first run. Defaults to the home directory.
    pub source_dir: Option<PathBuf>,
    /// Time each photo stays on screen.
    #[serde(with = "humantime_serde")]
    pub duration: Duration,
    pub show_path: bool,
}

impl DefaultSettings {
    pub fn resolve(&self) -> SettingDefaults {
        let source_dir = self
            .source_dir
            .clone()
            .or_else(dirs::home_dir)
            .unwrap_or_else(|| PathBuf::from("."));
        SettingDefaults {
            source_dir: crate::photo::absolute_string(&source_dir),
            duration_secs: i64::try_from(self.duration.as_secs()).unwrap_or(i64::MAX),
            show_path: self.show_path,
        }
    }
}

impl Default for DefaultSettings {
    fn default() -> Self {
        Self {
            source_dir: None,
            duration: Duration::from_secs(30),
            show_path: true,
        }
    }
}

#[cfg(windows)]
fn default_working_dir() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("Polaroid"))
}

#[cfg(not(windows))]
fn default_working_dir() -> Option<PathBuf> {
    dirs::home_dir().map(|d| d.join(".polaroid"))
}
