pub mod codec;
pub mod config;
pub mod device;
pub mod gesture;
pub mod service;

use color_eyre::eyre::{eyre, Result};
use tracing::{error, info, Level};
use tracing_subscriber::FmtSubscriber;

use crate::config::Config;
use crate::device::DeviceMonitor;
use crate::service::GestureService;

#[tokio::main]
async fn main() -> Result<()> {
    setup()?;

    let config_path = Config::default_path()?;
    let config = Config::load(&config_path)
        .map_err(|e| eyre!("failed to load config from {}: {}", config_path.display(), e))?;

    info!("starting device monitor");
    let monitor = DeviceMonitor::new();
    monitor.start()?;

    let service = GestureService::new(config, monitor.clone());
    service
        .start()
        .await
        .map_err(|e| eyre!("failed to start gesture service: {}", e))?;

    info!("gesturepad running, press Ctrl-C to stop");
    tokio::signal::ctrl_c().await?;

    info!("shutting down");
    if let Err(e) = service.stop().await {
        error!("error stopping gesture service: {}", e);
    }
    monitor.stop();

    Ok(())
}

fn setup() -> Result<()> {
    if std::env::var("RUST_LIB_BACKTRACE").is_err() {
        std::env::set_var("RUST_LIB_BACKTRACE", "0")
    }
    color_eyre::install()?;
    if std::env::var("RUST_LOG").is_err() {
        std::env::set_var("RUST_LOG", "info")
    }
    setup_logging_env();
    Ok(())
}

fn setup_logging_env() {
    FmtSubscriber::builder()
        .with_max_level(Level::INFO)
        .with_target(false)
        .with_thread_ids(true)
        .with_file(true)
        .with_line_number(true)
        .pretty()
        .init();
}
