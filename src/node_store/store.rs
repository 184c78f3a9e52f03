use super::models::*;
use super::schema::NODE_VERSIONED_SCHEMAS;
use crate::sqlite_persistence::BASE_DB_VERSION;
use anyhow::{anyhow, bail, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::info;
use uuid::Uuid;

/// Storage operations for all durable node state.
pub trait NodeStore: Send + Sync {
    // === Device ===

    fn get_device(&self) -> Result<Option<Device>>;
    fn save_device(&self, device: &Device) -> Result<()>;
    fn set_device_status(&self, status: DeviceStatus) -> Result<()>;
    fn set_device_form_status(&self, status: DeviceFormStatus) -> Result<()>;
    fn set_device_message(&self, message: Option<&str>) -> Result<()>;

    // === Operating settings ===

    fn get_settings(&self) -> Result<Option<Settings>>;
    /// Persist settings. Rejected if validation fails.
    fn save_settings(&self, settings: &Settings) -> Result<()>;
    fn get_disk_management(&self) -> Result<Option<DiskManagement>>;
    fn save_disk_management(&self, dm: &DiskManagement) -> Result<()>;
    fn get_water_level_settings(&self) -> Result<Option<WaterLevelSettings>>;
    fn save_water_level_settings(&self, settings: &WaterLevelSettings) -> Result<()>;

    // === Water level time series ===

    /// Insert a reading. A reading for an already known timestamp is a no-op.
    fn insert_reading(&self, reading: &WaterLevelReading) -> Result<()>;
    /// The reading closest in time to `timestamp`. Ties go to the earlier one.
    fn nearest_reading(&self, timestamp: DateTime<Utc>) -> Result<Option<WaterLevelReading>>;
    fn set_discharge_figures(
        &self,
        timestamp: DateTime<Utc>,
        figures: &DischargeFigures,
    ) -> Result<()>;

    // === Task forms ===

    fn insert_task_form(&self, form: &TaskForm) -> Result<()>;
    /// Most recently created form with the given status, if any.
    fn get_form_by_status(&self, status: TaskFormStatus) -> Result<Option<TaskForm>>;
    fn set_form_status(
        &self,
        id: Uuid,
        status: TaskFormStatus,
        message: Option<&str>,
    ) -> Result<()>;
    fn count_forms_with_status(&self, status: TaskFormStatus) -> Result<usize>;

    // === Video records ===

    fn insert_video(&self, timestamp: DateTime<Utc>, file_name: &str) -> Result<i64>;
    fn get_video(&self, id: i64) -> Result<Option<VideoRecord>>;
    fn set_video_status(&self, id: i64, status: VideoStatus) -> Result<()>;
    fn set_video_water_level(&self, id: i64, level: f64) -> Result<()>;
    fn set_video_image(&self, id: i64, image_name: &str) -> Result<()>;
    fn set_video_sync_status(&self, id: i64, synced: bool) -> Result<()>;

    // === Callback backlog ===

    fn push_pending_callback(&self, body: &str) -> Result<i64>;
    /// All backlog entries, oldest first.
    fn pending_callbacks(&self) -> Result<Vec<(i64, String)>>;
    fn delete_pending_callback(&self, id: i64) -> Result<()>;

    // === Callback URL and token state ===

    fn get_callback_url(&self) -> Result<Option<CallbackUrl>>;
    fn save_callback_url(&self, url: &CallbackUrl) -> Result<()>;
    fn update_tokens(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()>;
}

/// SQLite-backed node store.
pub struct SqliteNodeStore {
    conn: Arc<Mutex<Connection>>,
}

fn ts_to_db(ts: DateTime<Utc>) -> i64 {
    ts.timestamp()
}

fn ts_from_db(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0).ok_or_else(|| anyhow!("invalid timestamp {}", secs))
}

impl SqliteNodeStore {
    /// Open an existing database or create a new one with the current schema.
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = if db_path.as_ref().exists() {
            Connection::open(&db_path)?
        } else {
            let conn = Connection::open(&db_path)?;
            NODE_VERSIONED_SCHEMAS
                .last()
                .context("No schemas defined")?
                .create(&conn)?;
            info!("Created new node database at {:?}", db_path.as_ref());
            conn
        };

        let db_version = conn
            .query_row("PRAGMA user_version;", [], |row| row.get::<usize, i64>(0))
            .context("Failed to read database version")?
            - BASE_DB_VERSION as i64;

        if db_version < 0 {
            bail!(
                "Node database version marker {} is not one of ours",
                db_version + BASE_DB_VERSION as i64
            );
        }
        let version = db_version as usize;

        let schema_count = NODE_VERSIONED_SCHEMAS.len();
        if version >= schema_count {
            bail!(
                "Node database version {} is too new (max supported: {})",
                version,
                schema_count - 1
            );
        }

        NODE_VERSIONED_SCHEMAS
            .get(version)
            .context("Failed to get schema")?
            .validate(&conn)?;

        Self::migrate_if_needed(&conn, version)?;

        Ok(SqliteNodeStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Create an in-memory store for testing.
    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        NODE_VERSIONED_SCHEMAS
            .last()
            .context("No schemas defined")?
            .create(&conn)?;
        Ok(SqliteNodeStore {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    fn migrate_if_needed(conn: &Connection, current_version: usize) -> Result<()> {
        let target_version = NODE_VERSIONED_SCHEMAS.len() - 1;
        if current_version >= target_version {
            return Ok(());
        }

        info!(
            "Migrating node database from version {} to {}",
            current_version, target_version
        );
        for schema in NODE_VERSIONED_SCHEMAS.iter().skip(current_version + 1) {
            if let Some(migration_fn) = schema.migration {
                info!("Running node database migration to version {}", schema.version);
                migration_fn(conn)?;
            }
        }
        conn.execute(
            &format!("PRAGMA user_version = {}", BASE_DB_VERSION + target_version),
            [],
        )?;
        Ok(())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn row_to_video(row: &rusqlite::Row) -> rusqlite::Result<(i64, i64, String, String, Option<String>, Option<f64>, bool)> {
        Ok((
            row.get("id")?,
            row.get("timestamp")?,
            row.get("status")?,
            row.get("file_name")?,
            row.get("image_name")?,
            row.get("water_level")?,
            row.get::<_, i64>("sync_status")? != 0,
        ))
    }

    fn row_to_form(row: &rusqlite::Row) -> rusqlite::Result<(String, i64, String, String, Option<String>)> {
        Ok((
            row.get("id")?,
            row.get("created_at")?,
            row.get("status")?,
            row.get("task_body")?,
            row.get("message")?,
        ))
    }
}

impl NodeStore for SqliteNodeStore {
    fn get_device(&self) -> Result<Option<Device>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, name, operating_system, processor, memory_gb, version, status, form_status, message
                 FROM device LIMIT 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, String>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, Option<String>>(8)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((id, name, os, processor, memory_gb, version, status, form_status, message)) => {
                Ok(Some(Device {
                    id: Uuid::parse_str(&id).context("invalid device id")?,
                    name,
                    operating_system: os,
                    processor,
                    memory_gb,
                    version,
                    status: DeviceStatus::from_db_str(&status)
                        .ok_or_else(|| anyhow!("unknown device status '{}'", status))?,
                    form_status: DeviceFormStatus::from_db_str(&form_status)
                        .ok_or_else(|| anyhow!("unknown device form status '{}'", form_status))?,
                    message,
                }))
            }
        }
    }

    fn save_device(&self, device: &Device) -> Result<()> {
        let conn = self.lock();
        conn.execute("DELETE FROM device", [])?;
        conn.execute(
            "INSERT INTO device (id, name, operating_system, processor, memory_gb, version, status, form_status, message)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
            params![
                device.id.to_string(),
                device.name,
                device.operating_system,
                device.processor,
                device.memory_gb,
                device.version,
                device.status.as_db_str(),
                device.form_status.as_db_str(),
                device.message,
            ],
        )?;
        Ok(())
    }

    fn set_device_status(&self, status: DeviceStatus) -> Result<()> {
        self.lock()
            .execute("UPDATE device SET status = ?1", params![status.as_db_str()])?;
        Ok(())
    }

    fn set_device_form_status(&self, status: DeviceFormStatus) -> Result<()> {
        self.lock().execute(
            "UPDATE device SET form_status = ?1",
            params![status.as_db_str()],
        )?;
        Ok(())
    }

    fn set_device_message(&self, message: Option<&str>) -> Result<()> {
        self.lock()
            .execute("UPDATE device SET message = ?1", params![message])?;
        Ok(())
    }

    fn get_settings(&self) -> Result<Option<Settings>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT parse_dates_from_file, video_file_fmt, allowed_dt, shutdown_after_task, reboot_after
             FROM settings WHERE id = 1",
            [],
            |row| {
                Ok(Settings {
                    parse_dates_from_file: row.get::<_, i64>(0)? != 0,
                    video_file_fmt: row.get(1)?,
                    allowed_dt: row.get(2)?,
                    shutdown_after_task: row.get::<_, i64>(3)? != 0,
                    reboot_after: row.get(4)?,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    fn save_settings(&self, settings: &Settings) -> Result<()> {
        settings.validate()?;
        self.lock().execute(
            "INSERT OR REPLACE INTO settings (id, parse_dates_from_file, video_file_fmt, allowed_dt, shutdown_after_task, reboot_after)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)",
            params![
                settings.parse_dates_from_file as i64,
                settings.video_file_fmt,
                settings.allowed_dt,
                settings.shutdown_after_task as i64,
                settings.reboot_after,
            ],
        )?;
        Ok(())
    }

    fn get_disk_management(&self) -> Result<Option<DiskManagement>> {
        let conn = self.lock();
        conn.query_row(
            "SELECT home_folder, min_free_space, critical_space, frequency FROM disk_management WHERE id = 1",
            [],
            |row| {
                Ok(DiskManagement {
                    home_folder: PathBuf::from(row.get::<_, String>(0)?),
                    min_free_space: row.get(1)?,
                    critical_space: row.get(2)?,
                    frequency: row.get::<_, i64>(3)? as u64,
                })
            },
        )
        .optional()
        .map_err(Into::into)
    }

    fn save_disk_management(&self, dm: &DiskManagement) -> Result<()> {
        dm.validate()?;
        self.lock().execute(
            "INSERT OR REPLACE INTO disk_management (id, home_folder, min_free_space, critical_space, frequency)
             VALUES (1, ?1, ?2, ?3, ?4)",
            params![
                dm.home_folder.to_string_lossy(),
                dm.min_free_space,
                dm.critical_space,
                dm.frequency as i64,
            ],
        )?;
        Ok(())
    }

    fn get_water_level_settings(&self) -> Result<Option<WaterLevelSettings>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT datetime_fmt, file_template, frequency, script_type, script, optical
                 FROM water_level_settings WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)? != 0,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((datetime_fmt, file_template, frequency, script_type, script, optical)) => {
                Ok(Some(WaterLevelSettings {
                    datetime_fmt,
                    file_template,
                    frequency,
                    script_type: ScriptType::from_db_str(&script_type)
                        .ok_or_else(|| anyhow!("unknown script type '{}'", script_type))?,
                    script,
                    optical,
                }))
            }
        }
    }

    fn save_water_level_settings(&self, settings: &WaterLevelSettings) -> Result<()> {
        settings.validate()?;
        self.lock().execute(
            "INSERT OR REPLACE INTO water_level_settings (id, datetime_fmt, file_template, frequency, script_type, script, optical)
             VALUES (1, ?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                settings.datetime_fmt,
                settings.file_template,
                settings.frequency,
                settings.script_type.as_db_str(),
                settings.script,
                settings.optical as i64,
            ],
        )?;
        Ok(())
    }

    fn insert_reading(&self, reading: &WaterLevelReading) -> Result<()> {
        self.lock().execute(
            "INSERT OR IGNORE INTO water_level_readings (timestamp, level) VALUES (?1, ?2)",
            params![ts_to_db(reading.timestamp), reading.level],
        )?;
        Ok(())
    }

    fn nearest_reading(&self, timestamp: DateTime<Utc>) -> Result<Option<WaterLevelReading>> {
        let conn = self.lock();
        let ts = ts_to_db(timestamp);
        let before: Option<(i64, f64)> = conn
            .query_row(
                "SELECT timestamp, level FROM water_level_readings WHERE timestamp <= ?1
                 ORDER BY timestamp DESC LIMIT 1",
                params![ts],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let after: Option<(i64, f64)> = conn
            .query_row(
                "SELECT timestamp, level FROM water_level_readings WHERE timestamp > ?1
                 ORDER BY timestamp ASC LIMIT 1",
                params![ts],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;

        let nearest = match (before, after) {
            (None, None) => None,
            (Some(b), None) => Some(b),
            (None, Some(a)) => Some(a),
            (Some(b), Some(a)) => {
                // Ties go to the earlier reading.
                if (ts - b.0) <= (a.0 - ts) {
                    Some(b)
                } else {
                    Some(a)
                }
            }
        };

        match nearest {
            None => Ok(None),
            Some((secs, level)) => Ok(Some(WaterLevelReading {
                timestamp: ts_from_db(secs)?,
                level,
            })),
        }
    }

    fn set_discharge_figures(
        &self,
        timestamp: DateTime<Utc>,
        figures: &DischargeFigures,
    ) -> Result<()> {
        self.lock().execute(
            "UPDATE water_level_readings
             SET q_05 = ?2, q_25 = ?3, q_50 = ?4, q_75 = ?5, q_95 = ?6, fraction_velocimetry = ?7
             WHERE timestamp = ?1",
            params![
                ts_to_db(timestamp),
                figures.q_05,
                figures.q_25,
                figures.q_50,
                figures.q_75,
                figures.q_95,
                figures.fraction_velocimetry,
            ],
        )?;
        Ok(())
    }

    fn insert_task_form(&self, form: &TaskForm) -> Result<()> {
        self.lock().execute(
            "INSERT INTO task_forms (id, created_at, status, task_body, message)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                form.id.to_string(),
                ts_to_db(form.created_at),
                form.status.as_db_str(),
                form.task_body.to_string(),
                form.message,
            ],
        )?;
        Ok(())
    }

    fn get_form_by_status(&self, status: TaskFormStatus) -> Result<Option<TaskForm>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, created_at, status, task_body, message FROM task_forms
                 WHERE status = ?1 ORDER BY created_at DESC LIMIT 1",
                params![status.as_db_str()],
                Self::row_to_form,
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((id, created_at, status, task_body, message)) => Ok(Some(TaskForm {
                id: Uuid::parse_str(&id).context("invalid task form id")?,
                created_at: ts_from_db(created_at)?,
                status: TaskFormStatus::from_db_str(&status)
                    .ok_or_else(|| anyhow!("unknown task form status '{}'", status))?,
                task_body: serde_json::from_str(&task_body).context("invalid task body")?,
                message,
            })),
        }
    }

    fn set_form_status(
        &self,
        id: Uuid,
        status: TaskFormStatus,
        message: Option<&str>,
    ) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE task_forms SET status = ?2, message = COALESCE(?3, message) WHERE id = ?1",
            params![id.to_string(), status.as_db_str(), message],
        )?;
        if changed == 0 {
            bail!("task form {} not found", id);
        }
        Ok(())
    }

    fn count_forms_with_status(&self, status: TaskFormStatus) -> Result<usize> {
        let count: i64 = self.lock().query_row(
            "SELECT COUNT(*) FROM task_forms WHERE status = ?1",
            params![status.as_db_str()],
            |row| row.get(0),
        )?;
        Ok(count as usize)
    }

    fn insert_video(&self, timestamp: DateTime<Utc>, file_name: &str) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO videos (timestamp, status, file_name) VALUES (?1, ?2, ?3)",
            params![
                ts_to_db(timestamp),
                VideoStatus::New.as_db_str(),
                file_name
            ],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn get_video(&self, id: i64) -> Result<Option<VideoRecord>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT id, timestamp, status, file_name, image_name, water_level, sync_status
                 FROM videos WHERE id = ?1",
                params![id],
                Self::row_to_video,
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((id, timestamp, status, file_name, image_name, water_level, sync_status)) => {
                Ok(Some(VideoRecord {
                    id,
                    timestamp: ts_from_db(timestamp)?,
                    status: VideoStatus::from_db_str(&status)
                        .ok_or_else(|| anyhow!("unknown video status '{}'", status))?,
                    file_name,
                    image_name,
                    water_level,
                    sync_status,
                }))
            }
        }
    }

    fn set_video_status(&self, id: i64, status: VideoStatus) -> Result<()> {
        self.lock().execute(
            "UPDATE videos SET status = ?2 WHERE id = ?1",
            params![id, status.as_db_str()],
        )?;
        Ok(())
    }

    fn set_video_water_level(&self, id: i64, level: f64) -> Result<()> {
        self.lock().execute(
            "UPDATE videos SET water_level = ?2 WHERE id = ?1",
            params![id, level],
        )?;
        Ok(())
    }

    fn set_video_image(&self, id: i64, image_name: &str) -> Result<()> {
        self.lock().execute(
            "UPDATE videos SET image_name = ?2 WHERE id = ?1",
            params![id, image_name],
        )?;
        Ok(())
    }

    fn set_video_sync_status(&self, id: i64, synced: bool) -> Result<()> {
        self.lock().execute(
            "UPDATE videos SET sync_status = ?2 WHERE id = ?1",
            params![id, synced as i64],
        )?;
        Ok(())
    }

    fn push_pending_callback(&self, body: &str) -> Result<i64> {
        let conn = self.lock();
        conn.execute(
            "INSERT INTO pending_callbacks (created_at, body) VALUES (?1, ?2)",
            params![Utc::now().timestamp(), body],
        )?;
        Ok(conn.last_insert_rowid())
    }

    fn pending_callbacks(&self) -> Result<Vec<(i64, String)>> {
        let conn = self.lock();
        let mut stmt = conn.prepare(
            "SELECT id, body FROM pending_callbacks ORDER BY created_at ASC, id ASC",
        )?;
        let rows = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<std::result::Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    fn delete_pending_callback(&self, id: i64) -> Result<()> {
        self.lock()
            .execute("DELETE FROM pending_callbacks WHERE id = ?1", params![id])?;
        Ok(())
    }

    fn get_callback_url(&self) -> Result<Option<CallbackUrl>> {
        let conn = self.lock();
        let row = conn
            .query_row(
                "SELECT url, token_refresh_endpoint, access_token, refresh_token, expires_at
                 FROM callback_url WHERE id = 1",
                [],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, Option<String>>(1)?,
                        row.get::<_, Option<String>>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<i64>>(4)?,
                    ))
                },
            )
            .optional()?;

        match row {
            None => Ok(None),
            Some((url, token_refresh_endpoint, access_token, refresh_token, expires_at)) => {
                Ok(Some(CallbackUrl {
                    url,
                    token_refresh_endpoint,
                    access_token,
                    refresh_token,
                    expires_at: expires_at.map(ts_from_db).transpose()?,
                }))
            }
        }
    }

    fn save_callback_url(&self, url: &CallbackUrl) -> Result<()> {
        self.lock().execute(
            "INSERT OR REPLACE INTO callback_url (id, url, token_refresh_endpoint, access_token, refresh_token, expires_at)
             VALUES (1, ?1, ?2, ?3, ?4, ?5)",
            params![
                url.url,
                url.token_refresh_endpoint,
                url.access_token,
                url.refresh_token,
                url.expires_at.map(ts_to_db),
            ],
        )?;
        Ok(())
    }

    fn update_tokens(
        &self,
        access_token: &str,
        refresh_token: Option<&str>,
        expires_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let changed = self.lock().execute(
            "UPDATE callback_url
             SET access_token = ?1,
                 refresh_token = COALESCE(?2, refresh_token),
                 expires_at = ?3
             WHERE id = 1",
            params![access_token, refresh_token, expires_at.map(ts_to_db)],
        )?;
        if changed == 0 {
            bail!("no callback URL configured");
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn make_store() -> SqliteNodeStore {
        SqliteNodeStore::in_memory().unwrap()
    }

    fn ts(h: u32, m: u32, s: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 6, 15, h, m, s).unwrap()
    }

    #[test]
    fn test_new_creates_and_reopens_database() {
        let dir = tempfile::TempDir::new().unwrap();
        let db_path = dir.path().join("rivernode.db");

        let store = SqliteNodeStore::new(&db_path).unwrap();
        store
            .insert_reading(&WaterLevelReading {
                timestamp: ts(10, 0, 0),
                level: 1.2,
            })
            .unwrap();
        drop(store);

        let store = SqliteNodeStore::new(&db_path).unwrap();
        let reading = store.nearest_reading(ts(10, 0, 0)).unwrap().unwrap();
        assert_eq!(reading.level, 1.2);
    }

    #[test]
    fn test_device_roundtrip_and_updates() {
        let store = make_store();
        assert!(store.get_device().unwrap().is_none());

        let device = Device {
            id: Uuid::new_v4(),
            name: "gauge-01".to_string(),
            operating_system: "Linux 6.1".to_string(),
            processor: "Cortex-A72".to_string(),
            memory_gb: 3.8,
            version: "0.3.0".to_string(),
            status: DeviceStatus::Healthy,
            form_status: DeviceFormStatus::NoForm,
            message: None,
        };
        store.save_device(&device).unwrap();

        store.set_device_status(DeviceStatus::LowStorage).unwrap();
        store
            .set_device_form_status(DeviceFormStatus::ValidForm)
            .unwrap();
        store.set_device_message(Some("purged 3 files")).unwrap();

        let loaded = store.get_device().unwrap().unwrap();
        assert_eq!(loaded.id, device.id);
        assert_eq!(loaded.status, DeviceStatus::LowStorage);
        assert_eq!(loaded.form_status, DeviceFormStatus::ValidForm);
        assert_eq!(loaded.message.as_deref(), Some("purged 3 files"));
    }

    #[test]
    fn test_save_settings_rejects_invalid_template() {
        let store = make_store();
        let settings = Settings {
            parse_dates_from_file: true,
            video_file_fmt: "no_placeholder.mp4".to_string(),
            allowed_dt: 1800.0,
            shutdown_after_task: false,
            reboot_after: 0.0,
        };
        assert!(store.save_settings(&settings).is_err());
        assert!(store.get_settings().unwrap().is_none());
    }

    #[test]
    fn test_settings_roundtrip() {
        let store = make_store();
        let settings = Settings {
            parse_dates_from_file: true,
            video_file_fmt: "video_{%Y%m%dT%H%M%S}.mp4".to_string(),
            allowed_dt: 1800.0,
            shutdown_after_task: true,
            reboot_after: 86400.0,
        };
        store.save_settings(&settings).unwrap();
        let loaded = store.get_settings().unwrap().unwrap();
        assert!(loaded.parse_dates_from_file);
        assert!(loaded.shutdown_after_task);
        assert_eq!(loaded.allowed_dt, 1800.0);
        assert_eq!(loaded.reboot_after, 86400.0);
    }

    #[test]
    fn test_insert_reading_is_idempotent_per_timestamp() {
        let store = make_store();
        let reading = WaterLevelReading {
            timestamp: ts(10, 0, 0),
            level: 1.5,
        };
        store.insert_reading(&reading).unwrap();
        store
            .insert_reading(&WaterLevelReading {
                timestamp: ts(10, 0, 0),
                level: 9.9,
            })
            .unwrap();

        let loaded = store.nearest_reading(ts(10, 0, 0)).unwrap().unwrap();
        assert_eq!(loaded.level, 1.5);
    }

    #[test]
    fn test_nearest_reading_picks_closer_neighbor() {
        let store = make_store();
        store
            .insert_reading(&WaterLevelReading {
                timestamp: ts(10, 0, 0),
                level: 1.0,
            })
            .unwrap();
        store
            .insert_reading(&WaterLevelReading {
                timestamp: ts(11, 0, 0),
                level: 2.0,
            })
            .unwrap();

        let nearest = store.nearest_reading(ts(10, 10, 0)).unwrap().unwrap();
        assert_eq!(nearest.level, 1.0);
        let nearest = store.nearest_reading(ts(10, 50, 0)).unwrap().unwrap();
        assert_eq!(nearest.level, 2.0);
    }

    #[test]
    fn test_nearest_reading_tie_goes_to_earlier() {
        let store = make_store();
        store
            .insert_reading(&WaterLevelReading {
                timestamp: ts(10, 0, 0),
                level: 1.0,
            })
            .unwrap();
        store
            .insert_reading(&WaterLevelReading {
                timestamp: ts(11, 0, 0),
                level: 2.0,
            })
            .unwrap();

        let nearest = store.nearest_reading(ts(10, 30, 0)).unwrap().unwrap();
        assert_eq!(nearest.level, 1.0);
    }

    #[test]
    fn test_nearest_reading_empty_series() {
        let store = make_store();
        assert!(store.nearest_reading(ts(10, 0, 0)).unwrap().is_none());
    }

    #[test]
    fn test_discharge_figures_update() {
        let store = make_store();
        store
            .insert_reading(&WaterLevelReading {
                timestamp: ts(10, 0, 0),
                level: 1.0,
            })
            .unwrap();
        store
            .set_discharge_figures(
                ts(10, 0, 0),
                &DischargeFigures {
                    q_50: Some(3.4),
                    fraction_velocimetry: Some(0.82),
                    ..Default::default()
                },
            )
            .unwrap();
    }

    #[test]
    fn test_task_form_status_transitions() {
        let store = make_store();
        let form = TaskForm {
            id: Uuid::new_v4(),
            created_at: ts(9, 0, 0),
            status: TaskFormStatus::Candidate,
            task_body: serde_json::json!({"subtasks": []}),
            message: None,
        };
        store.insert_task_form(&form).unwrap();

        assert!(store
            .get_form_by_status(TaskFormStatus::Candidate)
            .unwrap()
            .is_some());

        store
            .set_form_status(form.id, TaskFormStatus::Accepted, None)
            .unwrap();
        assert!(store
            .get_form_by_status(TaskFormStatus::Candidate)
            .unwrap()
            .is_none());
        let accepted = store
            .get_form_by_status(TaskFormStatus::Accepted)
            .unwrap()
            .unwrap();
        assert_eq!(accepted.id, form.id);

        assert_eq!(
            store
                .count_forms_with_status(TaskFormStatus::Accepted)
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_set_form_status_unknown_id_fails() {
        let store = make_store();
        assert!(store
            .set_form_status(Uuid::new_v4(), TaskFormStatus::Broken, None)
            .is_err());
    }

    #[test]
    fn test_video_lifecycle() {
        let store = make_store();
        let id = store.insert_video(ts(10, 0, 0), "video_20230615T100000.mp4").unwrap();

        let video = store.get_video(id).unwrap().unwrap();
        assert_eq!(video.status, VideoStatus::New);
        assert!(!video.sync_status);

        store.set_video_status(id, VideoStatus::Task).unwrap();
        store.set_video_water_level(id, 1.87).unwrap();
        store.set_video_status(id, VideoStatus::Done).unwrap();
        store.set_video_sync_status(id, true).unwrap();

        let video = store.get_video(id).unwrap().unwrap();
        assert_eq!(video.status, VideoStatus::Done);
        assert_eq!(video.water_level, Some(1.87));
        assert!(video.sync_status);
    }

    #[test]
    fn test_pending_callbacks_fifo() {
        let store = make_store();
        let first = store.push_pending_callback("{\"n\":1}").unwrap();
        let _second = store.push_pending_callback("{\"n\":2}").unwrap();

        let pending = store.pending_callbacks().unwrap();
        assert_eq!(pending.len(), 2);
        assert_eq!(pending[0].1, "{\"n\":1}");
        assert_eq!(pending[1].1, "{\"n\":2}");

        store.delete_pending_callback(first).unwrap();
        let pending = store.pending_callbacks().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].1, "{\"n\":2}");
    }

    #[test]
    fn test_callback_url_token_updates() {
        let store = make_store();
        assert!(store.update_tokens("t", None, None).is_err());

        store
            .save_callback_url(&CallbackUrl {
                url: "http://platform.example.com".to_string(),
                token_refresh_endpoint: Some("/api/token/refresh/".to_string()),
                access_token: None,
                refresh_token: Some("refresh-1".to_string()),
                expires_at: None,
            })
            .unwrap();

        let expires = ts(12, 0, 0);
        store
            .update_tokens("access-1", Some("refresh-2"), Some(expires))
            .unwrap();

        let loaded = store.get_callback_url().unwrap().unwrap();
        assert_eq!(loaded.access_token.as_deref(), Some("access-1"));
        assert_eq!(loaded.refresh_token.as_deref(), Some("refresh-2"));
        assert_eq!(loaded.expires_at, Some(expires));

        // Refresh token is kept when the refresh response omits it.
        store.update_tokens("access-2", None, Some(expires)).unwrap();
        let loaded = store.get_callback_url().unwrap().unwrap();
        assert_eq!(loaded.refresh_token.as_deref(), Some("refresh-2"));
    }
}
