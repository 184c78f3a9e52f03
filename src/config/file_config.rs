use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
pub struct FileConfig {
    // Core settings (can override CLI)
    pub db_dir: Option<String>,
    pub callback_timeout_sec: Option<u64>,
    pub max_workers: Option<usize>,
    pub service_name: Option<String>,

    pub engine: Option<EngineConfig>,

    // First-boot seeds. Each section is written to the node database only
    // when the corresponding table is still empty.
    pub settings: Option<SettingsConfig>,
    pub disk_management: Option<DiskManagementConfig>,
    pub water_level: Option<WaterLevelConfig>,
    pub callback_url: Option<CallbackUrlConfig>,
}

/// The external processing engine and the operations it offers.
#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct EngineConfig {
    pub program: Option<String>,
    pub operations: Vec<String>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct SettingsConfig {
    pub parse_dates_from_file: Option<bool>,
    pub video_file_fmt: Option<String>,
    pub allowed_dt: Option<f64>,
    pub shutdown_after_task: Option<bool>,
    pub reboot_after: Option<f64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct DiskManagementConfig {
    pub home_folder: Option<String>,
    pub min_free_space: Option<f64>,
    pub critical_space: Option<f64>,
    pub frequency: Option<u64>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct WaterLevelConfig {
    pub datetime_fmt: Option<String>,
    pub file_template: Option<String>,
    pub frequency: Option<f64>,
    /// "python" or "bash".
    pub script_type: Option<String>,
    pub script: Option<String>,
    pub optical: Option<bool>,
}

#[derive(Debug, Deserialize, Default, Clone)]
#[serde(default)]
pub struct CallbackUrlConfig {
    pub url: Option<String>,
    pub token_refresh_endpoint: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {:?}", path))?;
        toml::from_str(&content).with_context(|| format!("Failed to parse config file: {:?}", path))
    }
}
