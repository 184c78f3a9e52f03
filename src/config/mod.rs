mod file_config;

pub use file_config::{
    CallbackUrlConfig, DiskManagementConfig, EngineConfig, FileConfig, SettingsConfig,
    WaterLevelConfig,
};

use crate::node_store::{
    CallbackUrl, DiskManagement, ScriptType, Settings, WaterLevelSettings,
};
use anyhow::{bail, Result};
use std::path::PathBuf;

/// CLI arguments that can be used for config resolution.
/// This struct mirrors the CLI arguments that can be overridden by TOML config.
#[derive(Debug, Clone)]
pub struct CliConfig {
    pub db_dir: Option<PathBuf>,
    pub engine_program: Option<String>,
    pub callback_timeout_sec: u64,
    pub max_workers: usize,
    pub service_name: String,
}

impl Default for CliConfig {
    fn default() -> Self {
        Self {
            db_dir: None,
            engine_program: None,
            callback_timeout_sec: 30,
            max_workers: 1,
            service_name: "rivernode.service".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub db_dir: PathBuf,
    pub engine_program: String,
    pub engine_operations: Vec<String>,
    pub callback_timeout_sec: u64,
    pub max_workers: usize,
    pub service_name: String,

    // First-boot seeds, applied only to empty tables.
    pub seed_settings: Option<Settings>,
    pub seed_disk_management: Option<DiskManagement>,
    pub seed_water_level: Option<WaterLevelSettings>,
    pub seed_callback_url: Option<CallbackUrl>,
}

impl AppConfig {
    /// Resolve configuration from CLI arguments and optional TOML file config.
    /// TOML values override CLI values where present.
    pub fn resolve(cli: &CliConfig, file_config: Option<FileConfig>) -> Result<Self> {
        let file = file_config.unwrap_or_default();

        let db_dir = file
            .db_dir
            .map(PathBuf::from)
            .or_else(|| cli.db_dir.clone())
            .ok_or_else(|| {
                anyhow::anyhow!("db_dir must be specified via --db-dir or in config file")
            })?;
        if !db_dir.exists() {
            bail!("Database directory does not exist: {:?}", db_dir);
        }
        if !db_dir.is_dir() {
            bail!("db_dir is not a directory: {:?}", db_dir);
        }

        let engine_file = file.engine.unwrap_or_default();
        let engine_program = engine_file
            .program
            .or_else(|| cli.engine_program.clone())
            .unwrap_or_else(|| "openrivercam".to_string());
        let engine_operations = if engine_file.operations.is_empty() {
            vec!["velocimetry".to_string()]
        } else {
            engine_file.operations
        };

        let callback_timeout_sec = file.callback_timeout_sec.unwrap_or(cli.callback_timeout_sec);
        let max_workers = file.max_workers.unwrap_or(cli.max_workers);
        if max_workers == 0 {
            bail!("max_workers must be at least 1");
        }
        let service_name = file.service_name.unwrap_or_else(|| cli.service_name.clone());

        let seed_settings = file.settings.map(|s| Settings {
            parse_dates_from_file: s.parse_dates_from_file.unwrap_or(true),
            video_file_fmt: s
                .video_file_fmt
                .unwrap_or_else(|| "video_{%Y%m%dT%H%M%S}.mp4".to_string()),
            allowed_dt: s.allowed_dt.unwrap_or(1800.0),
            shutdown_after_task: s.shutdown_after_task.unwrap_or(false),
            reboot_after: s.reboot_after.unwrap_or(0.0),
        });

        let seed_disk_management = match file.disk_management {
            None => None,
            Some(d) => {
                let Some(home_folder) = d.home_folder else {
                    bail!("disk_management section requires home_folder");
                };
                Some(DiskManagement {
                    home_folder: PathBuf::from(home_folder),
                    min_free_space: d.min_free_space.unwrap_or(2.0),
                    critical_space: d.critical_space.unwrap_or(1.0),
                    frequency: d.frequency.unwrap_or(3600),
                })
            }
        };

        let seed_water_level = match file.water_level {
            None => None,
            Some(w) => {
                let script_type = match w.script_type.as_deref() {
                    None | Some("bash") => ScriptType::Bash,
                    Some("python") => ScriptType::Python,
                    Some(other) => bail!("unknown water level script_type '{}'", other),
                };
                Some(WaterLevelSettings {
                    datetime_fmt: w
                        .datetime_fmt
                        .unwrap_or_else(|| "%Y-%m-%dT%H:%M:%SZ".to_string()),
                    file_template: w
                        .file_template
                        .unwrap_or_else(|| "wl_{%Y%m%d}.txt".to_string()),
                    frequency: w.frequency.unwrap_or(600.0),
                    script_type,
                    script: w.script.unwrap_or_default(),
                    optical: w.optical.unwrap_or(false),
                })
            }
        };

        let seed_callback_url = match file.callback_url {
            None => None,
            Some(c) => {
                let Some(url) = c.url else {
                    bail!("callback_url section requires url");
                };
                Some(CallbackUrl {
                    url,
                    token_refresh_endpoint: c.token_refresh_endpoint,
                    access_token: c.access_token,
                    refresh_token: c.refresh_token,
                    expires_at: None,
                })
            }
        };

        Ok(Self {
            db_dir,
            engine_program,
            engine_operations,
            callback_timeout_sec,
            max_workers,
            service_name,
            seed_settings,
            seed_disk_management,
            seed_water_level,
            seed_callback_url,
        })
    }

    pub fn node_db_path(&self) -> PathBuf {
        self.db_dir.join("rivernode.db")
    }
}
