use anyhow::{Context, Result};
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, level_filters::LevelFilter, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use rivernode::callbacks::CallbackClient;
use rivernode::config::{AppConfig, CliConfig, FileConfig};
use rivernode::node_store::{Device, DeviceFormStatus, DeviceStatus};
use rivernode::processing::OpRegistry;
use rivernode::processor::{LocalTaskProcessor, ProcessorConfig};
use rivernode::system::OsSystemControl;
use rivernode::task_form::TaskFormManager;
use rivernode::water_level::run_water_level_ingest;
use rivernode::{NodeStore, SqliteNodeStore};

fn parse_path(s: &str) -> Result<PathBuf> {
    let path_buf = PathBuf::from(s);
    let original_path = match path_buf.canonicalize() {
        Ok(path) => path,
        Err(msg) => {
            if msg.kind() == std::io::ErrorKind::NotFound {
                path_buf
            } else {
                return Err(msg).with_context(|| format!("Error resolving path: {}", s));
            }
        }
    };
    if original_path.is_absolute() {
        return Ok(original_path);
    }
    let cwd = std::env::current_dir()?;
    Ok(cwd.join(original_path))
}

#[derive(Parser, Debug)]
struct CliArgs {
    /// Directory holding the node's SQLite database.
    #[clap(long, value_parser = parse_path)]
    pub db_dir: Option<PathBuf>,

    /// Path to a TOML config file. TOML values override CLI values.
    #[clap(long, value_parser = parse_path)]
    pub config: Option<PathBuf>,

    /// Processing engine executable.
    #[clap(long)]
    pub engine: Option<String>,

    /// Maximum number of videos processed concurrently (capped at the CPU count).
    #[clap(long, default_value_t = 1)]
    pub max_workers: usize,

    /// Timeout in seconds for callback and token requests.
    #[clap(long, default_value_t = 30)]
    pub callback_timeout_sec: u64,

    /// Systemd unit to disable when storage goes critical.
    #[clap(long, default_value = "rivernode.service")]
    pub service_name: String,
}

/// Create the device record on first boot from hardware facts.
fn ensure_device(store: &Arc<SqliteNodeStore>) -> Result<()> {
    if store.get_device()?.is_some() {
        return Ok(());
    }
    let mut system = sysinfo::System::new();
    system.refresh_cpu();
    system.refresh_memory();
    let processor = system
        .cpus()
        .first()
        .map(|cpu| cpu.brand().to_string())
        .unwrap_or_else(|| "unknown".to_string());
    let device = Device {
        id: Uuid::new_v4(),
        name: sysinfo::System::host_name().unwrap_or_else(|| "rivernode".to_string()),
        operating_system: sysinfo::System::long_os_version()
            .unwrap_or_else(|| "unknown".to_string()),
        processor,
        memory_gb: system.total_memory() as f64 / (1024.0 * 1024.0 * 1024.0),
        version: env!("CARGO_PKG_VERSION").to_string(),
        status: DeviceStatus::Healthy,
        form_status: DeviceFormStatus::NoForm,
        message: None,
    };
    info!("Registering new device {} ({})", device.name, device.id);
    store.save_device(&device)
}

/// Write config file seeds into tables that are still empty.
fn apply_seeds(store: &Arc<SqliteNodeStore>, config: &AppConfig) -> Result<()> {
    if let Some(settings) = &config.seed_settings {
        if store.get_settings()?.is_none() {
            info!("Seeding operating settings from config file");
            store.save_settings(settings)?;
        }
    }
    if let Some(dm) = &config.seed_disk_management {
        if store.get_disk_management()?.is_none() {
            info!("Seeding disk management from config file");
            store.save_disk_management(dm)?;
        }
    }
    if let Some(wl) = &config.seed_water_level {
        if store.get_water_level_settings()?.is_none() {
            info!("Seeding water level settings from config file");
            store.save_water_level_settings(wl)?;
        }
    }
    if let Some(url) = &config.seed_callback_url {
        if store.get_callback_url()?.is_none() {
            info!("Seeding callback URL {}", url.url);
            store.save_callback_url(url)?;
        }
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli_args = CliArgs::parse();

    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            EnvFilter::builder()
                .with_default_directive(LevelFilter::INFO.into())
                .with_env_var("LOG_LEVEL")
                .from_env_lossy(),
        )
        .try_init()
        .unwrap();

    let file_config = match &cli_args.config {
        Some(path) => Some(FileConfig::load(path)?),
        None => None,
    };
    let cli_config = CliConfig {
        db_dir: cli_args.db_dir,
        engine_program: cli_args.engine,
        callback_timeout_sec: cli_args.callback_timeout_sec,
        max_workers: cli_args.max_workers,
        service_name: cli_args.service_name,
    };
    let config = AppConfig::resolve(&cli_config, file_config)?;

    info!("Opening node database at {:?}...", config.node_db_path());
    let store = Arc::new(SqliteNodeStore::new(config.node_db_path())?);
    ensure_device(&store)?;
    apply_seeds(&store, &config)?;

    let store: Arc<dyn NodeStore> = store;
    let registry = Arc::new(OpRegistry::with_engine(
        &config.engine_program,
        &config.engine_operations,
    ));
    info!(
        "Engine '{}' provides operations: {:?}",
        config.engine_program,
        registry.op_names()
    );

    let client = Arc::new(CallbackClient::new(
        store.clone(),
        config.callback_timeout_sec,
    )?);
    let home_folder = store
        .get_disk_management()?
        .context("no disk management configured; seed it via the config file")?
        .home_folder;
    let forms = Arc::new(TaskFormManager::new(
        store.clone(),
        client.clone(),
        registry.clone(),
        home_folder,
        config.callback_timeout_sec,
    )?);

    let processor = Arc::new(LocalTaskProcessor::new(
        store.clone(),
        registry,
        client,
        forms,
        Arc::new(OsSystemControl),
        ProcessorConfig {
            service_name: config.service_name.clone(),
            max_workers: config.max_workers,
        },
    ));

    let cancel = tokio_util::sync::CancellationToken::new();
    let ingest = tokio::spawn(run_water_level_ingest(store.clone(), cancel.child_token()));
    let processor_task = tokio::spawn(processor.run(cancel.child_token()));

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutdown signal received");
        }
        result = processor_task => {
            // The processor only returns on its own for fatal conditions.
            match result {
                Ok(outcome) => outcome?,
                Err(e) => warn!("Processor task aborted: {}", e),
            }
        }
    }
    cancel.cancel();
    let _ = ingest.await;
    Ok(())
}
