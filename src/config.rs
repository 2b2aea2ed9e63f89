use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use toml;

pub const DEFAULT_CONFIG_FILE: &str = "globe_observer.toml";

#[derive(Deserialize, Serialize, Clone, Debug, Default)]
#[serde(default)]
pub struct Config {
    pub drive: DriveConfig,
    pub earth_engine: EarthEngineConfig,
    pub polling: PollingConfig,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct DriveConfig {
    /// OAuth client secrets of an installed application
    pub credentials: PathBuf,
    pub token_cache: PathBuf,
    pub download_dir: PathBuf,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct EarthEngineConfig {
    /// File holding the refresh token written by `earthengine authenticate`
    pub credentials: PathBuf,
    pub project: String,
    pub export_folder: String,
    pub scratch_folder: String,
    pub name_pattern: String,
    pub date_format: String,
    pub scale: f64,
    pub cloud_coverage: f64,
    pub max_pixels: f64,
}

#[derive(Deserialize, Serialize, Clone, Debug)]
#[serde(default)]
pub struct PollingConfig {
    pub initial_interval_ms: u64,
    pub max_interval_ms: u64,
    pub multiplier: f64,
    pub timeout_secs: Option<u64>,
}

impl Default for DriveConfig {
    fn default() -> Self {
        Self {
            credentials: PathBuf::from("credentials.json"),
            token_cache: PathBuf::from("token.json"),
            download_dir: PathBuf::from("results/"),
        }
    }
}

impl Default for EarthEngineConfig {
    fn default() -> Self {
        Self {
            credentials: PathBuf::from("gee_credentials.json"),
            project: "earthengine-legacy".to_string(),
            export_folder: "GLOBE_OBSERVER_COLLECTIONS".to_string(),
            scratch_folder: "TMP_GO_FOLDER".to_string(),
            name_pattern: "gee_image_{satellite_name}_{polygon_name}_{system_date}".to_string(),
            date_format: "%Y-%m-%d".to_string(),
            scale: 10.0,
            cloud_coverage: 5.0,
            max_pixels: 1e13,
        }
    }
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            initial_interval_ms: 2_000,
            max_interval_ms: 60_000,
            multiplier: 2.0,
            timeout_secs: None,
        }
    }
}

impl PollingConfig {
    pub fn initial_interval(&self) -> Duration {
        Duration::from_millis(self.initial_interval_ms)
    }

    pub fn max_interval(&self) -> Duration {
        Duration::from_millis(self.max_interval_ms.max(self.initial_interval_ms))
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout_secs.map(Duration::from_secs)
    }

    pub fn validate(&self) -> Result<()> {
        if self.initial_interval_ms == 0 {
            bail!("polling.initial_interval_ms must be positive");
        }
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            bail!(
                "polling.multiplier must be a finite number >= 1, got {}",
                self.multiplier
            );
        }
        Ok(())
    }
}

impl Config {
    pub fn read<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = fs::read_to_string(path)
            .with_context(|| format!("Unable to read config {}", path.display()))?;
        let config: Self = toml::from_str(&content)?;
        config
            .polling
            .validate()
            .with_context(|| format!("Invalid config {}", path.display()))?;
        Ok(config)
    }

    /// Reads `path` when given, else the default config file if it exists, else the defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::read(path),
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::read(DEFAULT_CONFIG_FILE),
            None => Ok(Self::default()),
        }
    }

    pub fn write<P: AsRef<Path>>(self: &Self, path: P) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;
        Ok(())
    }

    pub fn from_template(table: &toml::Table) -> Self {
        let config: Self = toml::from_str(&table.to_string()).expect("Error serializing template");
        config
    }
}

#[cfg(test)]
pub(crate) fn config_toml() -> toml::Table {
    toml::toml! {
        [drive]
        credentials = "secrets/client.json"
        download_dir = "downloads/"

        [earth_engine]
        project = "ee-globe-observer"
        scale = 30.0
        cloud_coverage = 20.0

        [polling]
        initial_interval_ms = 500
        timeout_secs = 600
    }
}
