//! Site-specific water level script runner and its periodic ingest loop.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;
use tokio::process::Command;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::resolver::WaterLevelError;
use crate::node_store::{parse_with_fmt, NodeStore, ScriptType, WaterLevelReading};

/// The last stdout line of a water level script must be
/// `<timestamp in this format>,<level>`.
pub const SCRIPT_OUTPUT_FMT: &str = "%Y-%m-%dT%H:%M:%SZ";

/// Interval used while no runnable script is configured.
const IDLE_POLL_SECS: u64 = 60;

/// Run the configured script once and parse a reading from its output.
pub async fn run_water_level_script(
    script: &str,
    script_type: ScriptType,
) -> Result<WaterLevelReading, WaterLevelError> {
    let script_file = tempfile::NamedTempFile::new()?;
    tokio::fs::write(script_file.path(), script).await?;

    let interpreter = match script_type {
        ScriptType::Python => "python3",
        ScriptType::Bash => "bash",
    };
    let output = Command::new(interpreter)
        .arg(script_file.path())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        return Err(WaterLevelError::Script(stderr));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    let last_line = stdout
        .lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .ok_or_else(|| WaterLevelError::Script("script produced no output".to_string()))?
        .trim();

    let (ts_part, level_part) = last_line.split_once(',').ok_or_else(|| {
        WaterLevelError::Script(format!("cannot parse script output line '{}'", last_line))
    })?;
    let timestamp = parse_with_fmt(ts_part.trim(), SCRIPT_OUTPUT_FMT)
        .map_err(|e| WaterLevelError::Script(format!("bad timestamp: {}", e)))?;
    let level: f64 = level_part
        .trim()
        .parse()
        .map_err(|e| WaterLevelError::Script(format!("bad level: {}", e)))?;

    debug!("Water level script reported {} at {}", level, timestamp);
    Ok(WaterLevelReading { timestamp, level })
}

/// Periodic script-based ingestion. Reads the settings every cycle so that a
/// new form of operating configuration takes effect without a restart. Runs
/// until cancelled; a failing script logs and waits for the next cycle.
pub async fn run_water_level_ingest(store: Arc<dyn NodeStore>, cancel: CancellationToken) {
    info!("Water level ingest loop started");
    loop {
        let sleep_secs = match ingest_once(&store).await {
            Ok(Some(frequency)) => frequency,
            Ok(None) => IDLE_POLL_SECS,
            Err(e) => {
                warn!("Water level ingest cycle failed: {}", e);
                IDLE_POLL_SECS
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => {
                info!("Water level ingest loop stopped");
                return;
            }
            _ = tokio::time::sleep(Duration::from_secs(sleep_secs)) => {}
        }
    }
}

/// Returns the configured frequency when a script ran, `None` when there is
/// nothing to run.
async fn ingest_once(store: &Arc<dyn NodeStore>) -> anyhow::Result<Option<u64>> {
    let Some(settings) = store.get_water_level_settings()? else {
        return Ok(None);
    };
    if settings.script.is_empty() {
        return Ok(None);
    }

    match run_water_level_script(&settings.script, settings.script_type).await {
        Ok(reading) => {
            store.insert_reading(&reading)?;
            debug!("Ingested water level {} at {}", reading.level, reading.timestamp);
        }
        Err(e) => warn!("Water level script run failed: {}", e),
    }
    Ok(Some(settings.frequency.max(1.0) as u64))
}
