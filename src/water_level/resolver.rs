use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, info};

use crate::node_store::{
    parse_with_fmt, FilenameTemplate, NodeStore, WaterLevelReading, WaterLevelSettings,
};

#[derive(Debug, Error)]
pub enum WaterLevelError {
    #[error("no water level data available")]
    Empty,

    #[error("nearest water level at {nearest} is {dt:.0}s from the video, allowed {allowed:.0}s")]
    OutsideWindow {
        nearest: DateTime<Utc>,
        dt: f64,
        allowed: f64,
    },

    #[error("water level file {0:?} not found")]
    FileMissing(PathBuf),

    #[error("cannot parse water level file {path:?}: {reason}")]
    FileParse { path: PathBuf, reason: String },

    #[error("water level script failed: {0}")]
    Script(String),

    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Resolves the water level for a video timestamp.
pub struct WaterLevelResolver {
    store: Arc<dyn NodeStore>,
    /// Directory flat water level files are dropped in.
    file_dir: PathBuf,
}

impl WaterLevelResolver {
    pub fn new(store: Arc<dyn NodeStore>, file_dir: PathBuf) -> Self {
        Self { store, file_dir }
    }

    /// Resolve the level nearest to `timestamp`.
    ///
    /// The local time series is consulted first (nearest neighbor, ties to
    /// the earlier reading). When it has nothing, or its nearest reading is
    /// farther away than `allowed_dt`, the flat file named by the configured
    /// template is parsed instead and the resolved value is persisted into
    /// the series for reuse. The window bounds the file row as well.
    pub fn resolve(
        &self,
        timestamp: DateTime<Utc>,
        allowed_dt: Option<f64>,
    ) -> Result<f64, WaterLevelError> {
        match self.resolve_from_series(timestamp, allowed_dt) {
            Ok(level) => return Ok(level),
            Err(e @ WaterLevelError::Store(_)) => return Err(e),
            Err(e) => {
                debug!("Series lookup failed ({}), trying the flat file", e);
            }
        }

        let settings = self
            .store
            .get_water_level_settings()
            .map_err(WaterLevelError::Store)?
            .ok_or(WaterLevelError::Empty)?;
        let reading = self.resolve_from_file(timestamp, &settings)?;
        self.store
            .insert_reading(&reading)
            .map_err(WaterLevelError::Store)?;
        info!(
            "Water level {} at {} recovered from file, persisted to series",
            reading.level, reading.timestamp
        );
        check_window(timestamp, &reading, allowed_dt)?;
        Ok(reading.level)
    }

    fn resolve_from_series(
        &self,
        timestamp: DateTime<Utc>,
        allowed_dt: Option<f64>,
    ) -> Result<f64, WaterLevelError> {
        let reading = self
            .store
            .nearest_reading(timestamp)
            .map_err(WaterLevelError::Store)?
            .ok_or(WaterLevelError::Empty)?;
        check_window(timestamp, &reading, allowed_dt)?;
        Ok(reading.level)
    }

    /// Flat file lookup.
    ///
    /// The file is a whitespace separated two-column table (timestamp in the
    /// configured datetime format, then level), sorted ascending. The row at
    /// the clamped insertion index of the video timestamp is taken as-is; in
    /// the middle of the table that is the first row at or after the video,
    /// even when the row before is closer. Kept that way for compatibility
    /// with level files produced for existing deployments.
    fn resolve_from_file(
        &self,
        timestamp: DateTime<Utc>,
        settings: &WaterLevelSettings,
    ) -> Result<WaterLevelReading, WaterLevelError> {
        let file_name = if settings.file_template.contains('{') {
            let template = FilenameTemplate::parse(&settings.file_template)
                .map_err(WaterLevelError::Store)?;
            template.render(&timestamp)
        } else {
            settings.file_template.clone()
        };
        let path = self.file_dir.join(file_name);
        if !path.exists() {
            return Err(WaterLevelError::FileMissing(path));
        }

        let rows = parse_level_file(&path, &settings.datetime_fmt)?;
        let idx = rows
            .partition_point(|(t, _)| *t < timestamp)
            .min(rows.len() - 1);
        let (ts, level) = rows[idx];
        debug!("Water level file {:?} row {} selected for {}", path, idx, timestamp);
        Ok(WaterLevelReading {
            timestamp: ts,
            level,
        })
    }
}

fn check_window(
    timestamp: DateTime<Utc>,
    reading: &WaterLevelReading,
    allowed_dt: Option<f64>,
) -> Result<(), WaterLevelError> {
    if let Some(allowed) = allowed_dt {
        let dt = (timestamp - reading.timestamp).num_seconds().abs() as f64;
        if dt > allowed {
            return Err(WaterLevelError::OutsideWindow {
                nearest: reading.timestamp,
                dt,
                allowed,
            });
        }
    }
    Ok(())
}

fn parse_level_file(
    path: &Path,
    datetime_fmt: &str,
) -> Result<Vec<(DateTime<Utc>, f64)>, WaterLevelError> {
    let content = std::fs::read_to_string(path)?;
    let mut rows = Vec::new();
    for (line_no, line) in content.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let (ts_part, level_part) =
            line.rsplit_once(char::is_whitespace)
                .ok_or_else(|| WaterLevelError::FileParse {
                    path: path.to_path_buf(),
                    reason: format!("line {} has no level column", line_no + 1),
                })?;
        let ts = parse_with_fmt(ts_part.trim(), datetime_fmt).map_err(|e| {
            WaterLevelError::FileParse {
                path: path.to_path_buf(),
                reason: format!("line {}: {}", line_no + 1, e),
            }
        })?;
        let level: f64 = level_part
            .trim()
            .parse()
            .map_err(|e| WaterLevelError::FileParse {
                path: path.to_path_buf(),
                reason: format!("line {}: {}", line_no + 1, e),
            })?;
        rows.push((ts, level));
    }
    if rows.is_empty() {
        return Err(WaterLevelError::FileParse {
            path: path.to_path_buf(),
            reason: "file has no rows".to_string(),
        });
    }
    Ok(rows)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_store::{ScriptType, SqliteNodeStore};
    use chrono::TimeZone;
    use tempfile::TempDir;

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 6, 15, h, m, 0).unwrap()
    }

    fn make_resolver(dir: &TempDir) -> (Arc<SqliteNodeStore>, WaterLevelResolver) {
        let store = Arc::new(SqliteNodeStore::in_memory().unwrap());
        store
            .save_water_level_settings(&WaterLevelSettings {
                datetime_fmt: "%Y-%m-%dT%H:%M:%SZ".to_string(),
                file_template: "wl_{%Y%m%d}.txt".to_string(),
                frequency: 600.0,
                script_type: ScriptType::Bash,
                script: String::new(),
                optical: false,
            })
            .unwrap();
        let resolver = WaterLevelResolver::new(store.clone(), dir.path().to_path_buf());
        (store, resolver)
    }

    fn write_level_file(dir: &TempDir) {
        std::fs::write(
            dir.path().join("wl_20230615.txt"),
            "2023-06-15T09:00:00Z 1.0\n2023-06-15T10:00:00Z 2.0\n2023-06-15T12:00:00Z 3.0\n",
        )
        .unwrap();
    }

    #[test]
    fn test_db_reading_preferred_over_file() {
        let dir = TempDir::new().unwrap();
        let (store, resolver) = make_resolver(&dir);
        write_level_file(&dir);
        store
            .insert_reading(&WaterLevelReading {
                timestamp: ts(10, 5),
                level: 9.0,
            })
            .unwrap();

        let level = resolver.resolve(ts(10, 0), None).unwrap();
        assert_eq!(level, 9.0);
    }

    #[test]
    fn test_empty_series_and_missing_file() {
        let dir = TempDir::new().unwrap();
        let (_store, resolver) = make_resolver(&dir);

        let result = resolver.resolve(ts(10, 0), None);
        assert!(matches!(result, Err(WaterLevelError::FileMissing(_))));
    }

    #[test]
    fn test_empty_series_no_settings() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(SqliteNodeStore::in_memory().unwrap());
        let resolver = WaterLevelResolver::new(store, dir.path().to_path_buf());

        let result = resolver.resolve(ts(10, 0), None);
        assert!(matches!(result, Err(WaterLevelError::Empty)));
    }

    #[test]
    fn test_file_fallback_takes_row_at_or_after() {
        let dir = TempDir::new().unwrap();
        let (_store, resolver) = make_resolver(&dir);
        write_level_file(&dir);

        // 10:30 sits between the 10:00 and 12:00 rows. The 10:00 row is
        // closer, but the insertion index selects the 12:00 row.
        let level = resolver.resolve(ts(10, 30), None).unwrap();
        assert_eq!(level, 3.0);
    }

    #[test]
    fn test_file_fallback_clamps_at_edges() {
        let dir = TempDir::new().unwrap();
        let (_, resolver) = make_resolver(&dir);
        write_level_file(&dir);

        let level = resolver.resolve(ts(8, 0), None).unwrap();
        assert_eq!(level, 1.0);

        let dir2 = TempDir::new().unwrap();
        let (_, resolver2) = make_resolver(&dir2);
        write_level_file(&dir2);
        let level = resolver2.resolve(ts(23, 0), None).unwrap();
        assert_eq!(level, 3.0);
    }

    #[test]
    fn test_file_resolved_level_persisted_to_series() {
        let dir = TempDir::new().unwrap();
        let (store, resolver) = make_resolver(&dir);
        write_level_file(&dir);

        resolver.resolve(ts(9, 10), None).unwrap();
        let reading = store.nearest_reading(ts(9, 0)).unwrap().unwrap();
        assert_eq!(reading.level, 2.0);
        assert_eq!(reading.timestamp, ts(10, 0));
    }

    #[test]
    fn test_allowed_dt_enforced() {
        let dir = TempDir::new().unwrap();
        let (store, resolver) = make_resolver(&dir);
        store
            .insert_reading(&WaterLevelReading {
                timestamp: ts(8, 0),
                level: 1.0,
            })
            .unwrap();

        // Two hours away, one hour allowed, and no flat file to try instead.
        let result = resolver.resolve(ts(10, 0), Some(3600.0));
        assert!(matches!(result, Err(WaterLevelError::FileMissing(_))));

        let level = resolver.resolve(ts(10, 0), Some(3600.0 * 3.0)).unwrap();
        assert_eq!(level, 1.0);
    }

    #[test]
    fn test_out_of_window_reading_falls_back_to_file() {
        let dir = TempDir::new().unwrap();
        let (store, resolver) = make_resolver(&dir);
        std::fs::write(
            dir.path().join("wl_20230615.txt"),
            "2023-06-15T10:00:00Z 2.5\n",
        )
        .unwrap();
        store
            .insert_reading(&WaterLevelReading {
                timestamp: ts(5, 30),
                level: 1.0,
            })
            .unwrap();

        // The series reading is five hours away with one hour allowed; the
        // 10:00 file row is in the window and wins.
        let level = resolver.resolve(ts(10, 30), Some(3600.0)).unwrap();
        assert_eq!(level, 2.5);
        // The file row was persisted into the series.
        let reading = store.nearest_reading(ts(10, 0)).unwrap().unwrap();
        assert_eq!(reading.level, 2.5);
        assert_eq!(reading.timestamp, ts(10, 0));
    }

    #[test]
    fn test_file_fallback_row_outside_window_rejected() {
        let dir = TempDir::new().unwrap();
        let (store, resolver) = make_resolver(&dir);
        write_level_file(&dir);
        store
            .insert_reading(&WaterLevelReading {
                timestamp: ts(5, 30),
                level: 1.0,
            })
            .unwrap();

        // The clamped index picks the 12:00 row for 10:30, still outside the
        // one hour window.
        let result = resolver.resolve(ts(10, 30), Some(3600.0));
        assert!(matches!(result, Err(WaterLevelError::OutsideWindow { .. })));
    }

    #[test]
    fn test_literal_file_template() {
        let dir = TempDir::new().unwrap();
        let (store, resolver) = make_resolver(&dir);
        store
            .save_water_level_settings(&WaterLevelSettings {
                datetime_fmt: "%Y-%m-%dT%H:%M:%SZ".to_string(),
                file_template: "levels.txt".to_string(),
                frequency: 600.0,
                script_type: ScriptType::Bash,
                script: String::new(),
                optical: false,
            })
            .unwrap();
        std::fs::write(dir.path().join("levels.txt"), "2023-06-15T10:00:00Z 4.2\n").unwrap();

        let level = resolver.resolve(ts(10, 0), None).unwrap();
        assert_eq!(level, 4.2);
    }

    #[test]
    fn test_malformed_file_rejected() {
        let dir = TempDir::new().unwrap();
        let (_, resolver) = make_resolver(&dir);
        std::fs::write(dir.path().join("wl_20230615.txt"), "garbage\n").unwrap();

        let result = resolver.resolve(ts(10, 0), None);
        assert!(matches!(result, Err(WaterLevelError::FileParse { .. })));
    }
}
