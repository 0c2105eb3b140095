use std::time::Duration;

use netsched::config::ServerConfig;
use netsched::services::{Collaborators, ServiceContainer};
use netsched::{logging, panic_hook};
use tracing::{info, warn};

const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::load()?;

    let (logging_config, _guard) = logging::init_logging(&config.logging.dir)?;
    if let Some(filter) = &config.logging.filter
        && let Err(e) = logging_config.set_filter(filter)
    {
        warn!(filter = %filter, error = %e, "Ignoring invalid log filter");
    }
    panic_hook::install(&config.logging.dir);

    info!(version = env!("CARGO_PKG_VERSION"), "netsched starting");

    let container = ServiceContainer::new(config, Collaborators::standalone())?;
    logging_config.start_retention_cleanup(container.cancellation_token());
    container.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutdown requested");

    let pollers = container.show_pollers();
    info!("Active pollers at shutdown:\n{pollers}");
    container.shutdown_with_timeout(SHUTDOWN_TIMEOUT).await?;

    info!("netsched stopped");
    Ok(())
}
