use anyhow::Result;
use std::path::PathBuf;
use std::time::Duration;
use tracing::{info, warn};

use crate::core::config::CoreConfig;
use crate::core::runtime::Runtime;
use crate::core::terminal;
use crate::interfaces::web::{ApiServer, ApiServerConfig};
use crate::logging;

pub async fn run_server(
    data_dir: PathBuf,
    config: CoreConfig,
    api_host: String,
    api_port: u16,
) -> Result<()> {
    let log_tx = logging::init(config.tracing_level());
    info!("Starting conductor (data dir {})", data_dir.display());

    let runtime = Runtime::open(&data_dir, config).await?;

    // Nothing runs yet, so every leftover execution directory is an orphan.
    match runtime.generator.sweep_orphans(Duration::ZERO) {
        Ok(0) => {}
        Ok(n) => warn!("Removed {} execution directories left by a previous run", n),
        Err(e) => warn!("Startup sweep failed: {}", e),
    }

    let mut lifecycle = runtime.start_lifecycle().await?;

    terminal::print_banner();
    terminal::print_link("API", &format!("http://{}:{}/api", api_host, api_port));
    terminal::print_status("Data", &data_dir.display().to_string());
    if runtime.config.api.token.is_none() {
        terminal::print_warn("No [api].token set: the API only accepts loopback binds.");
    }
    terminal::print_info("Press Ctrl+C to stop.");
    println!();

    let grace = runtime.config.execution.grace_period() + Duration::from_secs(5);
    let server = ApiServer::new(ApiServerConfig {
        runtime: runtime.clone(),
        log_tx,
        api_host,
        api_port,
    });
    let served = server
        .serve(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!("Cannot listen for Ctrl+C: {}", e);
                std::future::pending::<()>().await;
            }
        })
        .await;

    runtime.supervisor.shutdown(grace).await;
    lifecycle.shutdown().await?;
    served?;
    terminal::print_goodbye();
    Ok(())
}
