//! Host power and service control.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use tracing::{info, warn};

/// Host-level actions the processor may take. Behind a trait so tests can
/// observe requested actions without touching the machine.
#[async_trait]
pub trait SystemControl: Send + Sync {
    async fn reboot(&self) -> Result<()>;
    async fn shutdown(&self) -> Result<()>;
    /// Disable and stop the given systemd service, normally our own.
    async fn stop_service(&self, service: &str) -> Result<()>;
}

pub struct OsSystemControl;

async fn run(program: &str, args: &[&str]) -> Result<()> {
    let status = tokio::process::Command::new(program)
        .args(args)
        .status()
        .await
        .with_context(|| format!("failed to spawn {}", program))?;
    if !status.success() {
        bail!("{} {:?} exited with {}", program, args, status);
    }
    Ok(())
}

#[async_trait]
impl SystemControl for OsSystemControl {
    async fn reboot(&self) -> Result<()> {
        info!("Issuing system reboot");
        run("reboot", &[]).await
    }

    async fn shutdown(&self) -> Result<()> {
        info!("Issuing system shutdown");
        run("shutdown", &["-h", "now"]).await
    }

    async fn stop_service(&self, service: &str) -> Result<()> {
        warn!("Disabling and stopping service {}", service);
        run("systemctl", &["disable", service]).await?;
        run("systemctl", &["stop", service]).await
    }
}

/// Records requested actions instead of performing them.
#[derive(Default)]
pub struct RecordingSystemControl {
    pub actions: std::sync::Mutex<Vec<String>>,
}

impl RecordingSystemControl {
    fn record(&self, action: String) {
        self.actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(action);
    }

    pub fn recorded(&self) -> Vec<String> {
        self.actions
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

#[async_trait]
impl SystemControl for RecordingSystemControl {
    async fn reboot(&self) -> Result<()> {
        self.record("reboot".to_string());
        Ok(())
    }

    async fn shutdown(&self) -> Result<()> {
        self.record("shutdown".to_string());
        Ok(())
    }

    async fn stop_service(&self, service: &str) -> Result<()> {
        self.record(format!("stop_service {}", service));
        Ok(())
    }
}
