//! Durable node state models and their write-time validation.

use anyhow::{anyhow, bail, Result};
use chrono::{DateTime, NaiveDate, NaiveDateTime, NaiveTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::OnceLock;
use uuid::Uuid;

/// Parse a timestamp string with a strftime-style format.
///
/// Date-only formats (e.g. `%Y%m%d`) resolve to midnight.
pub fn parse_with_fmt(s: &str, fmt: &str) -> Result<DateTime<Utc>> {
    if let Ok(dt) = NaiveDateTime::parse_from_str(s, fmt) {
        return Ok(dt.and_utc());
    }
    let date = NaiveDate::parse_from_str(s, fmt)
        .map_err(|e| anyhow!("cannot parse '{}' with format '{}': {}", s, fmt, e))?;
    Ok(NaiveDateTime::new(date, NaiveTime::MIN).and_utc())
}

/// A filename template with a single strftime pattern in braces,
/// e.g. `video_{%Y%m%dT%H%M%S}.mp4`.
#[derive(Debug, Clone)]
pub struct FilenameTemplate {
    prefix: String,
    fmt: String,
    suffix: String,
}

impl FilenameTemplate {
    pub fn parse(template: &str) -> Result<Self> {
        let open = template.find('{');
        let close = template.rfind('}');
        let (open, close) = match (open, close) {
            (Some(o), Some(c)) if o < c => (o, c),
            _ => bail!("template '{}' must contain one {{fmt}} placeholder", template),
        };
        let fmt = &template[open + 1..close];
        if fmt.is_empty() || fmt.contains('{') || template[close + 1..].contains('}') {
            bail!("template '{}' must contain exactly one {{fmt}} placeholder", template);
        }
        Ok(Self {
            prefix: template[..open].to_string(),
            fmt: fmt.to_string(),
            suffix: template[close + 1..].to_string(),
        })
    }

    pub fn render(&self, timestamp: &DateTime<Utc>) -> String {
        format!(
            "{}{}{}",
            self.prefix,
            timestamp.format(&self.fmt),
            self.suffix
        )
    }

    pub fn extract(&self, filename: &str) -> Result<DateTime<Utc>> {
        let stripped = filename
            .strip_prefix(&self.prefix)
            .and_then(|s| s.strip_suffix(&self.suffix))
            .ok_or_else(|| {
                anyhow!(
                    "filename '{}' does not match template '{}{{{}}}{}'",
                    filename,
                    self.prefix,
                    self.fmt,
                    self.suffix
                )
            })?;
        parse_with_fmt(stripped, &self.fmt)
    }

    /// A template is usable only if a rendered name parses back to the
    /// same instant (at the resolution of the format).
    pub fn validate_round_trip(&self) -> Result<()> {
        let now = Utc::now();
        let rendered = self.render(&now);
        let recovered = self.extract(&rendered)?;
        let rerendered = self.render(&recovered);
        if rendered != rerendered {
            bail!("template does not round-trip: '{}' vs '{}'", rendered, rerendered);
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceStatus {
    Healthy,
    LowVoltage,
    LowStorage,
    CriticalStorage,
}

impl DeviceStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            DeviceStatus::Healthy => "HEALTHY",
            DeviceStatus::LowVoltage => "LOW_VOLTAGE",
            DeviceStatus::LowStorage => "LOW_STORAGE",
            DeviceStatus::CriticalStorage => "CRITICAL_STORAGE",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "HEALTHY" => Some(DeviceStatus::Healthy),
            "LOW_VOLTAGE" => Some(DeviceStatus::LowVoltage),
            "LOW_STORAGE" => Some(DeviceStatus::LowStorage),
            "CRITICAL_STORAGE" => Some(DeviceStatus::CriticalStorage),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceFormStatus {
    NoForm,
    ValidForm,
    InvalidForm,
    BrokenForm,
}

impl DeviceFormStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            DeviceFormStatus::NoForm => "NOFORM",
            DeviceFormStatus::ValidForm => "VALID_FORM",
            DeviceFormStatus::InvalidForm => "INVALID_FORM",
            DeviceFormStatus::BrokenForm => "BROKEN_FORM",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "NOFORM" => Some(DeviceFormStatus::NoForm),
            "VALID_FORM" => Some(DeviceFormStatus::ValidForm),
            "INVALID_FORM" => Some(DeviceFormStatus::InvalidForm),
            "BROKEN_FORM" => Some(DeviceFormStatus::BrokenForm),
            _ => None,
        }
    }
}

/// The device record, created on first boot from hardware facts.
#[derive(Debug, Clone)]
pub struct Device {
    pub id: Uuid,
    pub name: String,
    pub operating_system: String,
    pub processor: String,
    pub memory_gb: f64,
    pub version: String,
    pub status: DeviceStatus,
    pub form_status: DeviceFormStatus,
    pub message: Option<String>,
}

impl Device {
    /// JSON blob sent along with task form requests.
    pub fn info_json(&self) -> serde_json::Value {
        serde_json::json!({
            "id": self.id,
            "name": self.name,
            "operating_system": self.operating_system,
            "processor": self.processor,
            "memory": self.memory_gb,
            "version": self.version,
            "status": self.status.as_db_str(),
            "form_status": self.form_status.as_db_str(),
        })
    }
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub parse_dates_from_file: bool,
    pub video_file_fmt: String,
    pub allowed_dt: f64,
    pub shutdown_after_task: bool,
    /// Seconds of uptime after which a reboot is requested. 0 disables.
    pub reboot_after: f64,
}

impl Settings {
    pub fn validate(&self) -> Result<()> {
        FilenameTemplate::parse(&self.video_file_fmt)?.validate_round_trip()?;
        if self.allowed_dt < 0.0 {
            bail!("allowed_dt must not be negative, got {}", self.allowed_dt);
        }
        if self.reboot_after < 0.0 {
            bail!("reboot_after must not be negative, got {}", self.reboot_after);
        }
        Ok(())
    }

    pub fn video_template(&self) -> Result<FilenameTemplate> {
        FilenameTemplate::parse(&self.video_file_fmt)
    }
}

/// Folder layout and thresholds for the managed home folder.
#[derive(Debug, Clone)]
pub struct DiskManagement {
    pub home_folder: PathBuf,
    /// Purging starts below this many GB of free space.
    pub min_free_space: f64,
    /// The service stops below this many GB of free space.
    pub critical_space: f64,
    /// Seconds between disk checks.
    pub frequency: u64,
}

impl DiskManagement {
    pub fn validate(&self) -> Result<()> {
        if self.critical_space > self.min_free_space {
            bail!(
                "critical_space ({}) must not exceed min_free_space ({})",
                self.critical_space,
                self.min_free_space
            );
        }
        if self.frequency == 0 {
            bail!("disk check frequency must be positive");
        }
        Ok(())
    }

    pub fn incoming_path(&self) -> PathBuf {
        self.home_folder.join("incoming")
    }

    pub fn failed_path(&self) -> PathBuf {
        self.home_folder.join("failed")
    }

    pub fn success_path(&self) -> PathBuf {
        self.home_folder.join("success")
    }

    pub fn results_path(&self) -> PathBuf {
        self.home_folder.join("results")
    }

    pub fn water_level_path(&self) -> PathBuf {
        self.home_folder.join("water_level")
    }

    pub fn log_path(&self) -> PathBuf {
        self.home_folder.join("log")
    }

    pub fn tmp_path(&self) -> PathBuf {
        self.home_folder.join("tmp")
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ScriptType {
    Python,
    Bash,
}

impl ScriptType {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            ScriptType::Python => "PYTHON",
            ScriptType::Bash => "BASH",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "PYTHON" => Some(ScriptType::Python),
            "BASH" => Some(ScriptType::Bash),
            _ => None,
        }
    }
}

fn dangerous_script_patterns() -> &'static [Regex] {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        [
            r"rm\s+(-\w+\s+)*/",
            r"\bmkfs",
            r"\bdd\s+if=",
            r">\s*/dev/sd",
            r"\bsudo\b",
            r"\bshutdown\b",
            r"\breboot\b",
            r"\bsystemctl\b",
            r":\(\)\s*\{",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

#[derive(Debug, Clone)]
pub struct WaterLevelSettings {
    pub datetime_fmt: String,
    /// File name template for flat-file lookups, e.g. `wl_{%Y%m%d}.txt`.
    /// A name without braces is treated as a literal file name.
    pub file_template: String,
    /// Seconds between script runs, in (0, 86400].
    pub frequency: f64,
    pub script_type: ScriptType,
    pub script: String,
    pub optical: bool,
}

impl WaterLevelSettings {
    pub fn validate(&self) -> Result<()> {
        let now = Utc::now();
        let rendered = now.format(&self.datetime_fmt).to_string();
        let recovered = parse_with_fmt(&rendered, &self.datetime_fmt)?;
        if recovered.format(&self.datetime_fmt).to_string() != rendered {
            bail!("datetime_fmt '{}' does not round-trip", self.datetime_fmt);
        }
        if self.file_template.contains('{') {
            FilenameTemplate::parse(&self.file_template)?.validate_round_trip()?;
        }
        if self.frequency <= 0.0 || self.frequency > 86400.0 {
            bail!(
                "frequency must be in (0, 86400] seconds, got {}",
                self.frequency
            );
        }
        if !self.script.is_empty() {
            for pattern in dangerous_script_patterns() {
                if let Some(found) = pattern.find(&self.script) {
                    bail!(
                        "script rejected, contains forbidden construct '{}'",
                        found.as_str()
                    );
                }
            }
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct WaterLevelReading {
    pub timestamp: DateTime<Utc>,
    pub level: f64,
}

/// Discharge figures attached to a reading after task execution.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DischargeFigures {
    pub q_05: Option<f64>,
    pub q_25: Option<f64>,
    pub q_50: Option<f64>,
    pub q_75: Option<f64>,
    pub q_95: Option<f64>,
    pub fraction_velocimetry: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskFormStatus {
    New,
    Rejected,
    Accepted,
    Candidate,
    Ancient,
    Broken,
}

impl TaskFormStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            TaskFormStatus::New => "NEW",
            TaskFormStatus::Rejected => "REJECTED",
            TaskFormStatus::Accepted => "ACCEPTED",
            TaskFormStatus::Candidate => "CANDIDATE",
            TaskFormStatus::Ancient => "ANCIENT",
            TaskFormStatus::Broken => "BROKEN",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(TaskFormStatus::New),
            "REJECTED" => Some(TaskFormStatus::Rejected),
            "ACCEPTED" => Some(TaskFormStatus::Accepted),
            "CANDIDATE" => Some(TaskFormStatus::Candidate),
            "ANCIENT" => Some(TaskFormStatus::Ancient),
            "BROKEN" => Some(TaskFormStatus::Broken),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct TaskForm {
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub status: TaskFormStatus,
    pub task_body: serde_json::Value,
    pub message: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoStatus {
    New,
    Queue,
    Task,
    Done,
    Error,
}

impl VideoStatus {
    pub fn as_db_str(&self) -> &'static str {
        match self {
            VideoStatus::New => "NEW",
            VideoStatus::Queue => "QUEUE",
            VideoStatus::Task => "TASK",
            VideoStatus::Done => "DONE",
            VideoStatus::Error => "ERROR",
        }
    }

    pub fn from_db_str(s: &str) -> Option<Self> {
        match s {
            "NEW" => Some(VideoStatus::New),
            "QUEUE" => Some(VideoStatus::Queue),
            "TASK" => Some(VideoStatus::Task),
            "DONE" => Some(VideoStatus::Done),
            "ERROR" => Some(VideoStatus::Error),
            _ => None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct VideoRecord {
    pub id: i64,
    pub timestamp: DateTime<Utc>,
    pub status: VideoStatus,
    pub file_name: String,
    pub image_name: Option<String>,
    pub water_level: Option<f64>,
    pub sync_status: bool,
}

/// Remote platform endpoint plus its token state.
#[derive(Debug, Clone)]
pub struct CallbackUrl {
    pub url: String,
    pub token_refresh_endpoint: Option<String>,
    pub access_token: Option<String>,
    pub refresh_token: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl CallbackUrl {
    /// A token is considered expired slightly early so an in-flight request
    /// cannot race the expiry.
    pub fn token_expired(&self, now: DateTime<Utc>) -> bool {
        match self.expires_at {
            Some(expires_at) => now + chrono::Duration::seconds(30) >= expires_at,
            None => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_filename_template_round_trip() {
        let template = FilenameTemplate::parse("video_{%Y%m%dT%H%M%S}.mp4").unwrap();
        let ts = Utc.with_ymd_and_hms(2023, 6, 15, 10, 30, 0).unwrap();
        let name = template.render(&ts);
        assert_eq!(name, "video_20230615T103000.mp4");
        assert_eq!(template.extract(&name).unwrap(), ts);
    }

    #[test]
    fn test_filename_template_rejects_mismatched_name() {
        let template = FilenameTemplate::parse("video_{%Y%m%dT%H%M%S}.mp4").unwrap();
        assert!(template.extract("other_20230615T103000.mp4").is_err());
        assert!(template.extract("video_20230615T103000.mkv").is_err());
        assert!(template.extract("video_garbage.mp4").is_err());
    }

    #[test]
    fn test_filename_template_requires_single_placeholder() {
        assert!(FilenameTemplate::parse("no_placeholder.mp4").is_err());
        assert!(FilenameTemplate::parse("two_{%Y}_{%m}.mp4").is_err());
        assert!(FilenameTemplate::parse("empty_{}.mp4").is_err());
    }

    #[test]
    fn test_parse_with_fmt_date_only_resolves_to_midnight() {
        let parsed = parse_with_fmt("20230615", "%Y%m%d").unwrap();
        assert_eq!(parsed, Utc.with_ymd_and_hms(2023, 6, 15, 0, 0, 0).unwrap());
    }

    #[test]
    fn test_settings_validation() {
        let mut settings = Settings {
            parse_dates_from_file: true,
            video_file_fmt: "video_{%Y%m%dT%H%M%S}.mp4".to_string(),
            allowed_dt: 1800.0,
            shutdown_after_task: false,
            reboot_after: 0.0,
        };
        settings.validate().unwrap();

        settings.video_file_fmt = "video.mp4".to_string();
        assert!(settings.validate().is_err());

        settings.video_file_fmt = "video_{%Y%m%dT%H%M%S}.mp4".to_string();
        settings.allowed_dt = -1.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_water_level_settings_frequency_bounds() {
        let mut settings = WaterLevelSettings {
            datetime_fmt: "%Y-%m-%dT%H:%M:%SZ".to_string(),
            file_template: "wl_{%Y%m%d}.txt".to_string(),
            frequency: 600.0,
            script_type: ScriptType::Bash,
            script: String::new(),
            optical: false,
        };
        settings.validate().unwrap();

        settings.frequency = 0.0;
        assert!(settings.validate().is_err());
        settings.frequency = 86401.0;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_water_level_settings_script_scan() {
        let mut settings = WaterLevelSettings {
            datetime_fmt: "%Y-%m-%dT%H:%M:%SZ".to_string(),
            file_template: "wl.txt".to_string(),
            frequency: 600.0,
            script_type: ScriptType::Bash,
            script: "echo \"$(date -u +%Y-%m-%dT%H:%M:%SZ),1.23\"".to_string(),
            optical: false,
        };
        settings.validate().unwrap();

        for bad in [
            "rm -rf / --no-preserve-root",
            "sudo cat /etc/shadow",
            "dd if=/dev/zero of=/dev/sda",
            "shutdown -h now",
        ] {
            settings.script = bad.to_string();
            assert!(settings.validate().is_err(), "accepted: {}", bad);
        }
    }

    #[test]
    fn test_disk_management_validation() {
        let dm = DiskManagement {
            home_folder: PathBuf::from("/home/rivernode"),
            min_free_space: 2.0,
            critical_space: 1.0,
            frequency: 3600,
        };
        dm.validate().unwrap();
        assert_eq!(dm.incoming_path(), PathBuf::from("/home/rivernode/incoming"));

        let bad = DiskManagement {
            critical_space: 3.0,
            ..dm
        };
        assert!(bad.validate().is_err());
    }

    #[test]
    fn test_token_expiry_window() {
        let now = Utc.with_ymd_and_hms(2023, 6, 15, 10, 0, 0).unwrap();
        let mut url = CallbackUrl {
            url: "http://example.com".to_string(),
            token_refresh_endpoint: None,
            access_token: Some("token".to_string()),
            refresh_token: None,
            expires_at: Some(now + chrono::Duration::seconds(300)),
        };
        assert!(!url.token_expired(now));

        url.expires_at = Some(now + chrono::Duration::seconds(10));
        assert!(url.token_expired(now));

        url.expires_at = None;
        assert!(!url.token_expired(now));
    }
}
