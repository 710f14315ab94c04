use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::info;

use trapper_sender::logging::init_logging;
use trapper_sender::provisioning::ItemCatalog;
use trapper_sender::tasks::{CpuUsageTask, RamUsageTask, ThreadUsageTask};
use trapper_sender::{SenderConfig, TrapperClient, TrapperTask};

const CONFIG_FILE: &str = "trapper-sender.json";
const ITEMS_FILE: &str = "items-creation.json";
const INTERVAL: Duration = Duration::from_secs(5);

#[tokio::main]
async fn main() -> Result<()> {
    let config_path = std::env::args().nth(1).unwrap_or_else(|| CONFIG_FILE.to_string());
    let mut config = SenderConfig::load_or_create(&config_path)
        .with_context(|| format!("failed to prepare configuration at {config_path}"))?;
    if config.host_name.trim().is_empty() {
        config.host_name = sysinfo::System::host_name().unwrap_or_else(|| "trapper-agent".to_string());
    }

    let _guard = init_logging(&config)?;
    info!(server = %config.server_address, port = config.port, host = %config.host_name, "Starting trapper sender");

    let tasks: Vec<Arc<dyn TrapperTask>> = vec![
        Arc::new(RamUsageTask::new()?),
        Arc::new(CpuUsageTask::new()?),
        Arc::new(ThreadUsageTask::new()?),
    ];

    let mut catalog = ItemCatalog::new();
    for task in &tasks {
        catalog.add_items(task.create_trapper_items());
    }
    // Failures are logged by the catalog; the agent still runs without the export.
    let _ = catalog.save_to_file(ITEMS_FILE);

    let mut client = TrapperClient::new(config).context("invalid sender configuration")?;
    for task in tasks {
        client.scheduler_mut().add_task(task, INTERVAL)?;
    }
    client.scheduler_mut().start()?;

    info!("Press Ctrl-C to stop...");
    tokio::signal::ctrl_c().await.context("failed to listen for Ctrl-C")?;

    client.scheduler_mut().stop().await;
    Ok(())
}
