//! The processing supervisor: watches the incoming folder, runs one task per
//! video, and keeps the device healthy around that (disk purging, task form
//! refresh, reboot and shutdown policies).

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::callbacks::{read_discharge_results, CallbackClient};
use crate::disk;
use crate::node_store::{DeviceStatus, DiskManagement, NodeStore, Settings, VideoStatus};
use crate::processing::OpRegistry;
use crate::storage::Storage;
use crate::system::SystemControl;
use crate::task::{build_task, TaskExecutor};
use crate::task_form::TaskFormManager;
use crate::water_level::WaterLevelResolver;

/// Seconds between incoming folder scans.
const POLL_INTERVAL_SECS: u64 = 5;

/// Seconds between task form refreshes during housekeeping.
const FORM_REFRESH_SECS: u64 = 300;

/// Minimum seconds between two reboot requests.
const MIN_REBOOT_SPACING_SECS: u64 = 3600;

/// A file whose size still changes within this window is considered to be
/// mid-upload and is left for the next scan.
const STABILITY_WAIT_MS: u64 = 500;

pub struct ProcessorConfig {
    /// The systemd unit to disable when storage goes critical.
    pub service_name: String,
    pub max_workers: usize,
}

impl Default for ProcessorConfig {
    fn default() -> Self {
        Self {
            service_name: "rivernode.service".to_string(),
            max_workers: 1,
        }
    }
}

pub struct LocalTaskProcessor {
    store: Arc<dyn NodeStore>,
    executor: TaskExecutor,
    client: Arc<CallbackClient>,
    forms: Arc<TaskFormManager>,
    system: Arc<dyn SystemControl>,
    config: ProcessorConfig,
    semaphore: Arc<Semaphore>,
    in_flight: Mutex<HashSet<PathBuf>>,
    active: AtomicUsize,
    reboot_due: AtomicBool,
    last_reboot: Mutex<Option<Instant>>,
    last_form_refresh: Mutex<Option<Instant>>,
    last_disk_check: Mutex<Option<Instant>>,
    started: Instant,
}

impl LocalTaskProcessor {
    pub fn new(
        store: Arc<dyn NodeStore>,
        registry: Arc<OpRegistry>,
        client: Arc<CallbackClient>,
        forms: Arc<TaskFormManager>,
        system: Arc<dyn SystemControl>,
        config: ProcessorConfig,
    ) -> Self {
        let cores = std::thread::available_parallelism()
            .map(|n| n.get())
            .unwrap_or(1);
        let workers = config.max_workers.clamp(1, cores);
        Self {
            store,
            executor: TaskExecutor::new(registry),
            client,
            forms,
            system,
            config,
            semaphore: Arc::new(Semaphore::new(workers)),
            in_flight: Mutex::new(HashSet::new()),
            active: AtomicUsize::new(0),
            reboot_due: AtomicBool::new(false),
            last_reboot: Mutex::new(None),
            last_form_refresh: Mutex::new(None),
            last_disk_check: Mutex::new(None),
            started: Instant::now(),
        }
    }

    /// Main loop. Returns when cancelled or when the node can no longer
    /// operate (home folder gone, storage critically full).
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) -> Result<()> {
        info!("Processor started");
        loop {
            if let Err(e) = self.cycle().await {
                error!("Processor stopping: {:#}", e);
                return Err(e);
            }
            tokio::select! {
                _ = cancel.cancelled() => {
                    info!("Processor stopped");
                    return Ok(());
                }
                _ = tokio::time::sleep(Duration::from_secs(POLL_INTERVAL_SECS)) => {}
            }
        }
    }

    async fn cycle(self: &Arc<Self>) -> Result<()> {
        let dm = self
            .store
            .get_disk_management()?
            .context("no disk management configured")?;
        if !dm.home_folder.exists() {
            bail!("home folder {:?} does not exist", dm.home_folder);
        }
        ensure_layout(&dm)?;

        if elapsed_at_least(&self.last_form_refresh, FORM_REFRESH_SECS) {
            self.forms.refresh().await;
        }
        if elapsed_at_least(&self.last_disk_check, dm.frequency) {
            self.check_disk(&dm).await?;
        }

        let settings = self.store.get_settings()?;
        if let Some(settings) = &settings {
            if settings.reboot_after > 0.0
                && self.started.elapsed().as_secs_f64() > settings.reboot_after
            {
                self.reboot_due.store(true, Ordering::SeqCst);
            }
        }
        self.reboot_if_idle().await?;

        let extension = settings.as_ref().and_then(|s| {
            Path::new(&s.video_file_fmt)
                .extension()
                .map(|ext| ext.to_string_lossy().to_ascii_lowercase())
        });
        self.scan_incoming(&dm, extension.as_deref());
        Ok(())
    }

    /// Free space check with escalating purges. Raw video trees go first,
    /// results last. A node still below critical space after that cannot
    /// safely keep writing; the service is stopped.
    async fn check_disk(&self, dm: &DiskManagement) -> Result<()> {
        let mut measure = || disk::free_space_gb(&dm.home_folder);
        let free = measure()?;
        if free >= dm.min_free_space {
            return Ok(());
        }

        warn!(
            "Free space {:.2} GB below minimum {:.2} GB, purging",
            free, dm.min_free_space
        );
        let reached = disk::purge(
            &[dm.failed_path(), dm.success_path()],
            free,
            dm.min_free_space,
            &mut measure,
        )?;
        if !reached {
            let free = measure()?;
            if !disk::purge(&[dm.results_path()], free, dm.min_free_space, &mut measure)? {
                let free = measure()?;
                if free < dm.critical_space {
                    self.store.set_device_status(DeviceStatus::CriticalStorage)?;
                    self.store
                        .set_device_message(Some("storage critically full"))?;
                    self.system.stop_service(&self.config.service_name).await?;
                    bail!(
                        "free space {:.2} GB below critical threshold {:.2} GB",
                        free,
                        dm.critical_space
                    );
                }
                self.store.set_device_status(DeviceStatus::LowStorage)?;
                return Ok(());
            }
        }
        self.store.set_device_status(DeviceStatus::Healthy)?;
        Ok(())
    }

    /// Issue a requested reboot, but only while no task is running and no
    /// reboot was issued within the last hour.
    async fn reboot_if_idle(&self) -> Result<()> {
        if !self.reboot_due.load(Ordering::SeqCst) {
            return Ok(());
        }
        if self.active.load(Ordering::SeqCst) > 0 {
            return Ok(());
        }
        {
            let last = self.last_reboot.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(last) = *last {
                if last.elapsed().as_secs() < MIN_REBOOT_SPACING_SECS {
                    return Ok(());
                }
            }
        }
        info!("Uptime policy reached, requesting reboot");
        self.reboot_due.store(false, Ordering::SeqCst);
        *self.last_reboot.lock().unwrap_or_else(|e| e.into_inner()) = Some(Instant::now());
        self.system.reboot().await
    }

    /// Submit every stable-looking video under the incoming tree. Files with
    /// a different extension than the configured video template are ignored.
    fn scan_incoming(self: &Arc<Self>, dm: &DiskManagement, extension: Option<&str>) {
        for path in disk::scan_folder(&dm.incoming_path()) {
            if let Some(wanted) = extension {
                let matches = path
                    .extension()
                    .map(|ext| ext.to_string_lossy().eq_ignore_ascii_case(wanted))
                    .unwrap_or(false);
                if !matches {
                    continue;
                }
            }
            {
                let mut in_flight = self.in_flight.lock().unwrap_or_else(|e| e.into_inner());
                if !in_flight.insert(path.clone()) {
                    continue;
                }
            }
            let this = self.clone();
            let dm = dm.clone();
            tokio::spawn(async move {
                let _permit = match this.semaphore.clone().acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                if let Err(e) = this.process_file(&path, &dm).await {
                    error!("Processing {:?} failed: {:#}", path, e);
                }
                this.in_flight
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .remove(&path);
            });
        }
    }

    /// The full pipeline for one incoming video. Failures at any stage land
    /// the raw video in `failed/<date>/` with the video record marked ERROR;
    /// this method only errors for infrastructure problems.
    pub async fn process_file(&self, path: &Path, dm: &DiskManagement) -> Result<()> {
        if !file_is_stable(path).await? {
            debug!("File {:?} still growing, leaving for next scan", path);
            self.in_flight
                .lock()
                .unwrap_or_else(|e| e.into_inner())
                .remove(path);
            return Ok(());
        }

        self.active.fetch_add(1, Ordering::SeqCst);
        let result = self.process_stable_file(path, dm).await;
        self.active.fetch_sub(1, Ordering::SeqCst);

        let settings = self.store.get_settings()?;
        if let Some(settings) = &settings {
            if settings.shutdown_after_task {
                info!("Shutdown-after-task enabled, shutting down");
                self.system.shutdown().await?;
            }
        }
        self.reboot_if_idle().await?;
        result
    }

    async fn process_stable_file(&self, path: &Path, dm: &DiskManagement) -> Result<()> {
        self.forms.refresh().await;

        let file_name = path
            .file_name()
            .and_then(|n| n.to_str())
            .context("incoming file has no usable name")?
            .to_string();
        let settings = self.store.get_settings()?.context("no settings configured")?;
        let timestamp = match video_timestamp(path, &file_name, &settings) {
            Ok(ts) => ts,
            Err(e) => {
                let message = format!("cannot timestamp video {}: {}", file_name, e);
                warn!("{}", message);
                // No video record exists yet; park the file by its mtime so
                // the scanner does not retry it forever.
                move_to_dated(path, &dm.failed_path(), file_mtime(path)?)?;
                self.store.set_device_message(Some(&message))?;
                return Ok(());
            }
        };

        let Some((_, template)) = self.forms.active_template()? else {
            warn!("No usable task form, leaving {:?} in incoming", file_name);
            return Ok(());
        };

        let video_id = self.store.insert_video(timestamp, &file_name)?;
        self.store.set_video_status(video_id, VideoStatus::Queue)?;
        info!("Video {} ({}) queued", video_id, file_name);

        let storage = Storage::new(
            dm.results_path(),
            Storage::video_bucket_name(video_id, &timestamp),
        );
        storage
            .upload_move(path, &file_name)
            .context("cannot relocate video into results bucket")?;

        let resolver = WaterLevelResolver::new(self.store.clone(), dm.water_level_path());
        let water_level = match resolver.resolve(timestamp, Some(settings.allowed_dt)) {
            Ok(level) => level,
            Err(e) => {
                let message = format!("no water level for video {}: {}", file_name, e);
                warn!("{}", message);
                self.fail_video(video_id, &storage, &file_name, timestamp, dm, &message)?;
                return Ok(());
            }
        };
        self.store.set_video_water_level(video_id, water_level)?;
        self.store.set_video_status(video_id, VideoStatus::Task)?;

        let task = build_task(
            &template,
            Uuid::new_v4(),
            timestamp,
            water_level,
            &file_name,
            storage.clone(),
        );
        let scratch = dm.tmp_path().join(task.id.to_string());
        let outcome = self.executor.execute(&task, &scratch).await;
        if scratch.exists() {
            if let Err(e) = std::fs::remove_dir_all(&scratch) {
                warn!("Could not remove scratch dir {:?}: {}", scratch, e);
            }
        }

        match outcome {
            Err(e) => {
                let message = format!("task for video {} failed: {}", file_name, e);
                warn!("{}", message);
                self.fail_video(video_id, &storage, &file_name, timestamp, dm, &message)?;
                Ok(())
            }
            Ok(()) => {
                self.record_discharge(&task, timestamp);
                self.record_image(video_id, &task);
                move_to_dated(
                    &storage.local_path(&file_name),
                    &dm.success_path(),
                    timestamp,
                )?;
                self.store.set_video_status(video_id, VideoStatus::Done)?;
                self.store.set_device_message(None)?;
                self.forms.promote_candidate()?;

                let all_delivered = self.client.deliver_all(&task.callbacks).await?;
                self.store.set_video_sync_status(video_id, all_delivered)?;
                if all_delivered {
                    let flushed = self.client.flush_backlog().await?;
                    if flushed > 0 {
                        info!("Flushed {} parked callback(s)", flushed);
                    }
                }
                info!("Video {} ({}) done", video_id, file_name);
                Ok(())
            }
        }
    }

    /// Attach discharge figures from the results file to the water level
    /// series. Best effort; delivery reads the file again on its own.
    fn record_discharge(&self, task: &crate::task::Task, timestamp: DateTime<Utc>) {
        for callback in &task.callbacks {
            if callback.func_name != "discharge" {
                continue;
            }
            let Some(remote) = callback.file.as_ref().and_then(|f| f.effective_remote()) else {
                continue;
            };
            match read_discharge_results(&task.storage.local_path(remote)) {
                Ok((_, figures)) => {
                    if let Err(e) = self.store.set_discharge_figures(timestamp, &figures) {
                        warn!("Could not store discharge figures: {}", e);
                    }
                }
                Err(e) => warn!("Could not read discharge results: {}", e),
            }
        }
    }

    /// Link a snapshot image to the video record when the task produced one.
    fn record_image(&self, video_id: i64, task: &crate::task::Task) {
        let image = task.output_files.values().find_map(|spec| {
            let remote = spec.effective_remote()?;
            let lower = remote.to_ascii_lowercase();
            if lower.ends_with(".jpg") || lower.ends_with(".jpeg") || lower.ends_with(".png") {
                Some(remote.to_string())
            } else {
                None
            }
        });
        if let Some(image) = image {
            if task.storage.local_path(&image).exists() {
                if let Err(e) = self.store.set_video_image(video_id, &image) {
                    warn!("Could not record image for video {}: {}", video_id, e);
                }
            }
        }
    }

    fn fail_video(
        &self,
        video_id: i64,
        storage: &Storage,
        file_name: &str,
        timestamp: DateTime<Utc>,
        dm: &DiskManagement,
        message: &str,
    ) -> Result<()> {
        move_to_dated(&storage.local_path(file_name), &dm.failed_path(), timestamp)?;
        if let Err(e) = storage.delete() {
            warn!("Could not remove bucket {:?}: {}", storage.bucket(), e);
        }
        self.store.set_video_status(video_id, VideoStatus::Error)?;
        self.store.set_device_message(Some(message))?;
        Ok(())
    }
}

fn ensure_layout(dm: &DiskManagement) -> Result<()> {
    for dir in [
        dm.incoming_path(),
        dm.failed_path(),
        dm.success_path(),
        dm.results_path(),
        dm.water_level_path(),
        dm.log_path(),
        dm.tmp_path(),
    ] {
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("cannot create folder {:?}", dir))?;
    }
    Ok(())
}

/// True when at least `secs` passed since the stored instant, updating it.
fn elapsed_at_least(slot: &Mutex<Option<Instant>>, secs: u64) -> bool {
    let mut slot = slot.lock().unwrap_or_else(|e| e.into_inner());
    let due = match *slot {
        None => true,
        Some(last) => last.elapsed().as_secs() >= secs,
    };
    if due {
        *slot = Some(Instant::now());
    }
    due
}

async fn file_is_stable(path: &Path) -> Result<bool> {
    let before = std::fs::metadata(path)?.len();
    tokio::time::sleep(Duration::from_millis(STABILITY_WAIT_MS)).await;
    let after = std::fs::metadata(path)?.len();
    Ok(before == after && after > 0)
}

fn video_timestamp(path: &Path, file_name: &str, settings: &Settings) -> Result<DateTime<Utc>> {
    if settings.parse_dates_from_file {
        return settings.video_template()?.extract(file_name);
    }
    file_mtime(path)
}

fn file_mtime(path: &Path) -> Result<DateTime<Utc>> {
    let mtime = std::fs::metadata(path)?.modified()?;
    Ok(DateTime::<Utc>::from(mtime))
}

fn move_to_dated(src: &Path, dest_root: &Path, timestamp: DateTime<Utc>) -> Result<()> {
    let dir = dest_root.join(timestamp.format("%Y%m%d").to_string());
    std::fs::create_dir_all(&dir)?;
    let target = dir.join(src.file_name().context("source file has no name")?);
    if std::fs::rename(src, &target).is_err() {
        std::fs::copy(src, &target)
            .with_context(|| format!("cannot move {:?} to {:?}", src, target))?;
        std::fs::remove_file(src)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::node_store::{
        Device, DeviceFormStatus, ScriptType, SqliteNodeStore, TaskFormStatus, WaterLevelReading,
        WaterLevelSettings,
    };
    use crate::processing::{OpContext, ProcessingError, ProcessingOp};
    use crate::system::RecordingSystemControl;
    use crate::task::test_fixtures::sample_task_body;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use tempfile::TempDir;

    struct FakeEngineOp;

    #[async_trait]
    impl ProcessingOp for FakeEngineOp {
        async fn run(&self, ctx: OpContext<'_>) -> Result<(), ProcessingError> {
            for key in ctx.output_files.keys() {
                let path = ctx.output_path(key).unwrap();
                if let Some(parent) = path.parent() {
                    tokio::fs::create_dir_all(parent).await?;
                }
                tokio::fs::write(&path, br#"{"h": 1.87, "q_50": 3.4}"#).await?;
            }
            Ok(())
        }
    }

    struct Harness {
        home: TempDir,
        store: Arc<SqliteNodeStore>,
        system: Arc<RecordingSystemControl>,
        processor: Arc<LocalTaskProcessor>,
    }

    fn ts(h: u32, m: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2023, 6, 15, h, m, 0).unwrap()
    }

    fn make_harness() -> Harness {
        let home = TempDir::new().unwrap();
        let store = Arc::new(SqliteNodeStore::in_memory().unwrap());
        store
            .save_device(&Device {
                id: Uuid::new_v4(),
                name: "node".to_string(),
                operating_system: "linux".to_string(),
                processor: "arm".to_string(),
                memory_gb: 4.0,
                version: "0.3.0".to_string(),
                status: DeviceStatus::Healthy,
                form_status: DeviceFormStatus::NoForm,
                message: None,
            })
            .unwrap();
        store
            .save_settings(&Settings {
                parse_dates_from_file: true,
                video_file_fmt: "video_{%Y%m%dT%H%M%S}.mp4".to_string(),
                allowed_dt: 3600.0,
                shutdown_after_task: false,
                reboot_after: 0.0,
            })
            .unwrap();
        store
            .save_disk_management(&DiskManagement {
                home_folder: home.path().to_path_buf(),
                min_free_space: 0.0,
                critical_space: 0.0,
                frequency: 3600,
            })
            .unwrap();
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

        let mut registry = OpRegistry::new();
        registry.register("velocimetry", Arc::new(FakeEngineOp));
        let registry = Arc::new(registry);
        let client = Arc::new(CallbackClient::new(store.clone(), 2).unwrap());
        let forms = Arc::new(
            TaskFormManager::new(
                store.clone(),
                client.clone(),
                registry.clone(),
                home.path().to_path_buf(),
                2,
            )
            .unwrap(),
        );
        let system = Arc::new(RecordingSystemControl::default());
        let processor = Arc::new(LocalTaskProcessor::new(
            store.clone(),
            registry,
            client,
            forms.clone(),
            system.clone(),
            ProcessorConfig::default(),
        ));
        forms
            .ingest_body(Uuid::new_v4(), sample_task_body())
            .unwrap();
        Harness {
            home,
            store,
            system,
            processor,
        }
    }

    fn dm(h: &Harness) -> DiskManagement {
        h.store.get_disk_management().unwrap().unwrap()
    }

    fn drop_video(h: &Harness) -> PathBuf {
        let dm = dm(h);
        ensure_layout(&dm).unwrap();
        let path = dm.incoming_path().join("video_20230615T103000.mp4");
        std::fs::write(&path, b"frames").unwrap();
        path
    }

    #[tokio::test]
    async fn test_scan_picks_up_nested_videos_only() {
        let h = make_harness();
        let dm = dm(&h);
        ensure_layout(&dm).unwrap();
        let nested = dm.incoming_path().join("cam1");
        std::fs::create_dir_all(&nested).unwrap();
        let video = nested.join("video_20230615T103000.mp4");
        std::fs::write(&video, b"frames").unwrap();
        std::fs::write(dm.incoming_path().join("notes.txt"), b"not a video").unwrap();

        h.processor.scan_incoming(&dm, Some("mp4"));

        // Tracked synchronously at submission; spawned pipelines have not run
        // yet because nothing has been awaited.
        let in_flight = h
            .processor
            .in_flight
            .lock()
            .unwrap_or_else(|e| e.into_inner());
        assert_eq!(in_flight.len(), 1);
        assert!(in_flight.contains(&video));
    }

    #[tokio::test]
    async fn test_happy_path_video_done_and_archived() {
        let h = make_harness();
        h.store
            .insert_reading(&WaterLevelReading {
                timestamp: ts(10, 25),
                level: 1.87,
            })
            .unwrap();
        let path = drop_video(&h);

        h.processor.process_file(&path, &dm(&h)).await.unwrap();

        let video = h.store.get_video(1).unwrap().unwrap();
        assert_eq!(video.status, VideoStatus::Done);
        assert_eq!(video.water_level, Some(1.87));
        // No callback URL is configured, so delivery parked in the backlog.
        assert!(!video.sync_status);
        assert_eq!(h.store.pending_callbacks().unwrap().len(), 1);

        let archived = dm(&h)
            .success_path()
            .join("20230615")
            .join("video_20230615T103000.mp4");
        assert!(archived.exists());
        assert!(!path.exists());

        // First success promotes the candidate form.
        assert_eq!(
            h.store
                .count_forms_with_status(TaskFormStatus::Accepted)
                .unwrap(),
            1
        );
        // Discharge figures reached the series.
        let reading = h.store.nearest_reading(ts(10, 25)).unwrap().unwrap();
        assert_eq!(reading.level, 1.87);
    }

    #[tokio::test]
    async fn test_missing_water_level_fails_video() {
        let h = make_harness();
        let path = drop_video(&h);

        h.processor.process_file(&path, &dm(&h)).await.unwrap();

        let video = h.store.get_video(1).unwrap().unwrap();
        assert_eq!(video.status, VideoStatus::Error);
        let failed = dm(&h)
            .failed_path()
            .join("20230615")
            .join("video_20230615T103000.mp4");
        assert!(failed.exists());

        let device = h.store.get_device().unwrap().unwrap();
        assert!(device.message.unwrap().contains("water level"));
        // Still a candidate; a failed task must not promote the form.
        assert_eq!(
            h.store
                .count_forms_with_status(TaskFormStatus::Candidate)
                .unwrap(),
            1
        );
    }

    #[tokio::test]
    async fn test_template_mismatch_moves_file_to_failed() {
        let h = make_harness();
        let dm = dm(&h);
        ensure_layout(&dm).unwrap();
        let path = dm.incoming_path().join("other_20230615T103000.mp4");
        std::fs::write(&path, b"frames").unwrap();
        let mtime: DateTime<Utc> = std::fs::metadata(&path).unwrap().modified().unwrap().into();

        h.processor.process_file(&path, &dm).await.unwrap();

        // No record, no processing; the file is parked under its mtime date.
        assert!(h.store.get_video(1).unwrap().is_none());
        assert!(!path.exists());
        let parked = dm
            .failed_path()
            .join(mtime.format("%Y%m%d").to_string())
            .join("other_20230615T103000.mp4");
        assert!(parked.exists());
        let device = h.store.get_device().unwrap().unwrap();
        assert!(device.message.unwrap().contains("does not match"));
    }

    #[tokio::test]
    async fn test_no_form_leaves_file_in_incoming() {
        let h = make_harness();
        // Demote the candidate so no usable form remains.
        let form = h
            .store
            .get_form_by_status(TaskFormStatus::Candidate)
            .unwrap()
            .unwrap();
        h.store
            .set_form_status(form.id, TaskFormStatus::Ancient, None)
            .unwrap();
        let path = drop_video(&h);

        h.processor.process_file(&path, &dm(&h)).await.unwrap();
        assert!(path.exists());
    }

    #[tokio::test]
    async fn test_shutdown_after_task() {
        let h = make_harness();
        h.store
            .save_settings(&Settings {
                parse_dates_from_file: true,
                video_file_fmt: "video_{%Y%m%dT%H%M%S}.mp4".to_string(),
                allowed_dt: 3600.0,
                shutdown_after_task: true,
                reboot_after: 0.0,
            })
            .unwrap();
        h.store
            .insert_reading(&WaterLevelReading {
                timestamp: ts(10, 25),
                level: 1.87,
            })
            .unwrap();
        let path = drop_video(&h);

        h.processor.process_file(&path, &dm(&h)).await.unwrap();
        assert_eq!(h.system.recorded(), vec!["shutdown".to_string()]);
    }

    #[tokio::test]
    async fn test_reboot_waits_for_idle_and_spacing() {
        let h = make_harness();
        h.processor.reboot_due.store(true, Ordering::SeqCst);

        h.processor.active.fetch_add(1, Ordering::SeqCst);
        h.processor.reboot_if_idle().await.unwrap();
        assert!(h.system.recorded().is_empty());

        h.processor.active.fetch_sub(1, Ordering::SeqCst);
        h.processor.reboot_if_idle().await.unwrap();
        assert_eq!(h.system.recorded(), vec!["reboot".to_string()]);

        // A second request within the spacing window is ignored.
        h.processor.reboot_due.store(true, Ordering::SeqCst);
        h.processor.reboot_if_idle().await.unwrap();
        assert_eq!(h.system.recorded(), vec!["reboot".to_string()]);
    }

    #[tokio::test]
    async fn test_critical_storage_stops_service() {
        let h = make_harness();
        h.store
            .save_disk_management(&DiskManagement {
                home_folder: h.home.path().to_path_buf(),
                // Thresholds no real disk satisfies.
                min_free_space: 1e9,
                critical_space: 1e9,
                frequency: 3600,
            })
            .unwrap();

        let result = h.processor.check_disk(&dm(&h)).await;
        assert!(result.is_err());
        assert_eq!(
            h.system.recorded(),
            vec!["stop_service rivernode.service".to_string()]
        );
        let device = h.store.get_device().unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::CriticalStorage);
    }

    #[tokio::test]
    async fn test_purge_recovers_below_minimum() {
        let h = make_harness();
        // Plenty of real free space; a tiny minimum keeps the node healthy.
        h.processor.check_disk(&dm(&h)).await.unwrap();
        let device = h.store.get_device().unwrap().unwrap();
        assert_eq!(device.status, DeviceStatus::Healthy);
    }
}
