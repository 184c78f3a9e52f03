//! Delivery of callbacks to the remote platform, with a durable backlog.

use reqwest::{Client, StatusCode};
use serde_json::{Map, Value};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tracing::{info, warn};

use super::{Callback, RequestMethod};
use crate::node_store::{DischargeFigures, NodeStore};

#[derive(Debug, Error)]
pub enum DeliveryError {
    #[error("no callback URL configured")]
    NotConfigured,

    #[error("callback has no deliverable file: {0}")]
    MissingFile(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("server responded with status {0}")]
    Status(StatusCode),

    #[error("token refresh failed: {0}")]
    TokenRefresh(String),

    #[error("invalid callback payload: {0}")]
    Payload(String),

    #[error("store error: {0}")]
    Store(#[source] anyhow::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Read the discharge figures from an engine results file.
///
/// Missing keys come back as `None`; the platform receives them as nulls
/// rather than the whole delivery failing.
pub fn read_discharge_results(path: &Path) -> Result<(Option<f64>, DischargeFigures), DeliveryError> {
    let raw = std::fs::read_to_string(path)?;
    let value: Value = serde_json::from_str(&raw)
        .map_err(|e| DeliveryError::Payload(format!("results file does not parse: {}", e)))?;
    let get = |key: &str| value.get(key).and_then(Value::as_f64);
    Ok((
        get("h"),
        DischargeFigures {
            q_05: get("q_05"),
            q_25: get("q_25"),
            q_50: get("q_50"),
            q_75: get("q_75"),
            q_95: get("q_95"),
            fraction_velocimetry: get("fraction_velocimetry"),
        },
    ))
}

/// HTTP client for callback delivery and token refresh.
///
/// Token state lives in the store so a refreshed token survives restarts and
/// is shared with the task form poller.
pub struct CallbackClient {
    client: Client,
    store: Arc<dyn NodeStore>,
}

impl CallbackClient {
    pub fn new(store: Arc<dyn NodeStore>, timeout_secs: u64) -> anyhow::Result<Self> {
        let client = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { client, store })
    }

    /// Deliver a batch of callbacks. A failed callback is parked in the
    /// backlog and its siblings are still attempted. Returns whether every
    /// callback in the batch went through.
    pub async fn deliver_all(&self, callbacks: &[Callback]) -> anyhow::Result<bool> {
        let mut all_delivered = true;
        for callback in callbacks {
            match self.deliver_one(callback).await {
                Ok(()) => {}
                Err(e) => {
                    warn!(
                        "Callback '{}' to '{}' failed, parking in backlog: {}",
                        callback.func_name, callback.endpoint, e
                    );
                    let body = serde_json::to_string(callback)?;
                    self.store.push_pending_callback(&body)?;
                    all_delivered = false;
                }
            }
        }
        Ok(all_delivered)
    }

    /// Retry parked callbacks oldest first, stopping at the first failure.
    /// An entry is deleted only after a confirmed 2xx. Returns the number of
    /// entries delivered.
    pub async fn flush_backlog(&self) -> anyhow::Result<usize> {
        let pending = self.store.pending_callbacks()?;
        let mut delivered = 0;
        for (id, body) in pending {
            let callback: Callback = match serde_json::from_str(&body) {
                Ok(callback) => callback,
                Err(e) => {
                    // An unparseable entry can never be delivered; drop it so
                    // it does not wedge the queue forever.
                    warn!("Dropping unparseable backlog entry {}: {}", id, e);
                    self.store.delete_pending_callback(id)?;
                    continue;
                }
            };
            match self.deliver_one(&callback).await {
                Ok(()) => {
                    self.store.delete_pending_callback(id)?;
                    delivered += 1;
                }
                Err(e) => {
                    info!("Backlog flush stopped at entry {}: {}", id, e);
                    break;
                }
            }
        }
        Ok(delivered)
    }

    pub async fn deliver_one(&self, callback: &Callback) -> Result<(), DeliveryError> {
        let callback_url = self
            .store
            .get_callback_url()
            .map_err(DeliveryError::Store)?
            .ok_or(DeliveryError::NotConfigured)?;
        let token = self.access_token().await?;

        let url = format!(
            "{}{}",
            callback_url.url.trim_end_matches('/'),
            callback.endpoint
        );
        let mut request = match callback.request_type {
            RequestMethod::Post => self.client.post(&url),
            RequestMethod::Patch => self.client.patch(&url),
        };
        if let Some(token) = &token {
            request = request.bearer_auth(token);
        }

        let request = if callback.files_to_send.is_empty() {
            request.json(&self.json_body(callback)?)
        } else {
            request.multipart(self.multipart_body(callback)?)
        };

        let response = request.send().await?;
        match response.status() {
            StatusCode::OK | StatusCode::CREATED => Ok(()),
            status => Err(DeliveryError::Status(status)),
        }
    }

    /// Return a valid access token, refreshing it first if it is about to
    /// expire. Refreshing is idempotent: an unexpired token is returned as-is
    /// without a network call, and refreshed tokens are persisted immediately.
    pub async fn access_token(&self) -> Result<Option<String>, DeliveryError> {
        let callback_url = self
            .store
            .get_callback_url()
            .map_err(DeliveryError::Store)?
            .ok_or(DeliveryError::NotConfigured)?;

        let now = chrono::Utc::now();
        if !callback_url.token_expired(now) {
            return Ok(callback_url.access_token);
        }

        let (endpoint, refresh_token) = match (
            &callback_url.token_refresh_endpoint,
            &callback_url.refresh_token,
        ) {
            (Some(endpoint), Some(refresh_token)) => (endpoint, refresh_token),
            _ => {
                return Err(DeliveryError::TokenRefresh(
                    "token expired and no refresh endpoint configured".to_string(),
                ))
            }
        };

        let url = format!("{}{}", callback_url.url.trim_end_matches('/'), endpoint);
        let response = self
            .client
            .post(&url)
            .json(&serde_json::json!({"refresh": refresh_token}))
            .send()
            .await?;
        if !response.status().is_success() {
            return Err(DeliveryError::TokenRefresh(format!(
                "refresh endpoint responded with {}",
                response.status()
            )));
        }

        #[derive(serde::Deserialize)]
        struct TokenResponse {
            access: String,
            refresh: Option<String>,
            expires_in: Option<i64>,
        }
        let tokens: TokenResponse = response.json().await?;
        let expires_at = tokens
            .expires_in
            .map(|secs| now + chrono::Duration::seconds(secs));
        self.store
            .update_tokens(&tokens.access, tokens.refresh.as_deref(), expires_at)
            .map_err(DeliveryError::Store)?;
        info!("Refreshed platform access token");
        Ok(Some(tokens.access))
    }

    fn json_body(&self, callback: &Callback) -> Result<Value, DeliveryError> {
        let mut body = Map::new();
        body.insert(
            "timestamp".to_string(),
            Value::String(callback.timestamp.to_rfc3339()),
        );

        if callback.func_name == "discharge" {
            let file = callback
                .file
                .as_ref()
                .ok_or_else(|| DeliveryError::MissingFile("discharge".to_string()))?;
            let remote = file
                .effective_remote()
                .ok_or_else(|| DeliveryError::MissingFile(file.tmp_name.clone()))?;
            let storage = callback
                .storage
                .as_ref()
                .ok_or_else(|| DeliveryError::Payload("callback has no storage".to_string()))?;
            let (h, figures) = read_discharge_results(&storage.local_path(remote))?;
            let to_value = |v: Option<f64>| v.map(Value::from).unwrap_or(Value::Null);
            body.insert("h".to_string(), to_value(h));
            body.insert("q_05".to_string(), to_value(figures.q_05));
            body.insert("q_25".to_string(), to_value(figures.q_25));
            body.insert("q_50".to_string(), to_value(figures.q_50));
            body.insert("q_75".to_string(), to_value(figures.q_75));
            body.insert("q_95".to_string(), to_value(figures.q_95));
            body.insert(
                "fraction_velocimetry".to_string(),
                to_value(figures.fraction_velocimetry),
            );
        }

        for (key, value) in &callback.kwargs {
            body.insert(key.clone(), value.clone());
        }
        Ok(Value::Object(body))
    }

    fn multipart_body(&self, callback: &Callback) -> Result<reqwest::multipart::Form, DeliveryError> {
        let storage = callback
            .storage
            .as_ref()
            .ok_or_else(|| DeliveryError::Payload("callback has no storage".to_string()))?;

        let mut form = reqwest::multipart::Form::new()
            .text("timestamp", callback.timestamp.to_rfc3339());
        for (key, value) in &callback.kwargs {
            let text = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            form = form.text(key.clone(), text);
        }
        for (field, file) in &callback.files_to_send {
            let remote = file
                .effective_remote()
                .ok_or_else(|| DeliveryError::MissingFile(file.tmp_name.clone()))?;
            let bytes = std::fs::read(storage.local_path(remote))?;
            let part = reqwest::multipart::Part::bytes(bytes).file_name(remote.to_string());
            form = form.part(field.clone(), part);
        }
        Ok(form)
    }
}
