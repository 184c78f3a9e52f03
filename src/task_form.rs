//! Task form lifecycle.
//!
//! Forms arrive from the platform or as a file dropped in the home folder.
//! A form that parses becomes the CANDIDATE; the candidate is promoted to
//! ACCEPTED after its first successful task. Superseded forms become ANCIENT,
//! unparseable ones REJECTED, and an accepted form that stops parsing (for
//! instance after the engine's operation set changed) BROKEN.

use anyhow::{Context, Result};
use reqwest::StatusCode;
use serde_json::Value;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

use crate::callbacks::CallbackClient;
use crate::node_store::{DeviceFormStatus, NodeStore, TaskForm, TaskFormStatus};
use crate::processing::OpRegistry;
use crate::task::TaskTemplate;

/// File name watched for locally dropped forms.
pub const LOCAL_FORM_FILE: &str = "task_form.json";

pub struct TaskFormManager {
    store: Arc<dyn NodeStore>,
    client: Arc<CallbackClient>,
    http: reqwest::Client,
    registry: Arc<OpRegistry>,
    home_folder: PathBuf,
}

impl TaskFormManager {
    pub fn new(
        store: Arc<dyn NodeStore>,
        client: Arc<CallbackClient>,
        registry: Arc<OpRegistry>,
        home_folder: PathBuf,
        timeout_secs: u64,
    ) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            store,
            client,
            http,
            registry,
            home_folder,
        })
    }

    /// Pick up new forms from the local drop file and the platform. Neither
    /// source failing is fatal; the active form stays in place.
    pub async fn refresh(&self) {
        match self.ingest_local_file() {
            Ok(true) => info!("Ingested locally dropped task form"),
            Ok(false) => {}
            Err(e) => warn!("Local task form ingestion failed: {}", e),
        }
        if let Err(e) = self.poll_remote().await {
            warn!("Remote task form poll failed: {}", e);
        }
    }

    /// Read and remove the local drop file, if present. The file is removed
    /// even when it does not parse, so a bad file cannot be retried forever.
    pub fn ingest_local_file(&self) -> Result<bool> {
        let path = self.home_folder.join(LOCAL_FORM_FILE);
        if !path.exists() {
            return Ok(false);
        }
        let raw = std::fs::read_to_string(&path);
        std::fs::remove_file(&path)
            .with_context(|| format!("cannot remove ingested form file {:?}", path))?;
        let body: Value = serde_json::from_str(&raw?)
            .with_context(|| format!("form file {:?} is not valid JSON", path))?;
        self.ingest_body(Uuid::new_v4(), body)?;
        Ok(true)
    }

    /// Ask the platform for a new form. 204 means none is waiting; a 200
    /// carries the form, which is acknowledged back with its verdict.
    async fn poll_remote(&self) -> Result<()> {
        let Some(device) = self.store.get_device()? else {
            return Ok(());
        };
        if self.store.get_callback_url()?.is_none() {
            return Ok(());
        }
        let token = self.client.access_token().await?;
        let base = self
            .store
            .get_callback_url()?
            .map(|u| u.url.trim_end_matches('/').to_string())
            .unwrap_or_default();

        let url = format!("{}/api/device/{}/task_form/", base, device.id);
        let mut request = self.http.get(&url).json(&device.info_json());
        if let Some(token) = &token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?;
        match response.status() {
            StatusCode::NO_CONTENT => return Ok(()),
            StatusCode::OK => {}
            status => anyhow::bail!("task form endpoint responded with {}", status),
        }

        let body: Value = response.json().await?;
        let form_id = body
            .get("id")
            .and_then(Value::as_str)
            .and_then(|s| Uuid::parse_str(s).ok())
            .unwrap_or_else(Uuid::new_v4);
        let task_body = body.get("task_body").cloned().unwrap_or(body);

        let status = self.ingest_body(form_id, task_body)?;
        let verdict = match status {
            TaskFormStatus::Candidate => "accepted",
            _ => "rejected",
        };
        let ack_url = format!("{}/api/device/{}/task_form/{}/", base, device.id, form_id);
        let mut ack = self
            .http
            .patch(&ack_url)
            .json(&serde_json::json!({"status": verdict}));
        if let Some(token) = &token {
            ack = ack.bearer_auth(token);
        }
        if let Err(e) = ack.send().await {
            // The verdict is already durable locally; the platform will see
            // it again on the next poll cycle.
            warn!("Task form acknowledgement failed: {}", e);
        }
        Ok(())
    }

    /// Store a form and validate it. A form that parses supersedes the
    /// current candidate; one that does not is kept as REJECTED with the
    /// parse error as its message.
    pub fn ingest_body(&self, id: Uuid, body: Value) -> Result<TaskFormStatus> {
        self.store.insert_task_form(&TaskForm {
            id,
            created_at: chrono::Utc::now(),
            status: TaskFormStatus::New,
            task_body: body.clone(),
            message: None,
        })?;

        match TaskTemplate::from_value(&body, &self.registry) {
            Ok(_) => {
                while let Some(old) = self.store.get_form_by_status(TaskFormStatus::Candidate)? {
                    self.store
                        .set_form_status(old.id, TaskFormStatus::Ancient, None)?;
                }
                self.store
                    .set_form_status(id, TaskFormStatus::Candidate, None)?;
                info!("Task form {} accepted as candidate", id);
                Ok(TaskFormStatus::Candidate)
            }
            Err(e) => {
                let message = e.to_string();
                self.store
                    .set_form_status(id, TaskFormStatus::Rejected, Some(&message))?;
                self.store
                    .set_device_form_status(DeviceFormStatus::InvalidForm)?;
                warn!("Task form {} rejected: {}", id, message);
                Ok(TaskFormStatus::Rejected)
            }
        }
    }

    /// The form tasks should currently be built from: the candidate if one
    /// exists, otherwise the accepted form. A stored form that no longer
    /// parses is marked BROKEN and the next best form is tried.
    pub fn active_template(&self) -> Result<Option<(TaskForm, TaskTemplate)>> {
        loop {
            let form = match self.store.get_form_by_status(TaskFormStatus::Candidate)? {
                Some(form) => form,
                None => match self.store.get_form_by_status(TaskFormStatus::Accepted)? {
                    Some(form) => form,
                    None => return Ok(None),
                },
            };
            match TaskTemplate::from_value(&form.task_body, &self.registry) {
                Ok(template) => return Ok(Some((form, template))),
                Err(e) => {
                    warn!("Stored task form {} no longer parses: {}", form.id, e);
                    self.store.set_form_status(
                        form.id,
                        TaskFormStatus::Broken,
                        Some(&e.to_string()),
                    )?;
                    self.store
                        .set_device_form_status(DeviceFormStatus::BrokenForm)?;
                }
            }
        }
    }

    /// Promote the candidate to ACCEPTED after it produced its first
    /// successful task. The previously accepted form becomes ANCIENT.
    pub fn promote_candidate(&self) -> Result<bool> {
        let Some(candidate) = self.store.get_form_by_status(TaskFormStatus::Candidate)? else {
            return Ok(false);
        };
        while let Some(old) = self.store.get_form_by_status(TaskFormStatus::Accepted)? {
            self.store
                .set_form_status(old.id, TaskFormStatus::Ancient, None)?;
        }
        self.store
            .set_form_status(candidate.id, TaskFormStatus::Accepted, None)?;
        self.store
            .set_device_form_status(DeviceFormStatus::ValidForm)?;
        info!("Task form {} promoted to accepted", candidate.id);
        Ok(true)
    }
}
