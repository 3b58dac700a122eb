use anyhow::Result;
use tracing::{info, warn};

use open_microgrid_controller::app::AppState;
use open_microgrid_controller::config::Config;
use open_microgrid_controller::telemetry;

#[tokio::main]
async fn main() -> Result<()> {
    telemetry::init_tracing();

    let config = Config::load()?;
    let app_state = AppState::new(config).await?;

    info!("starting Open Microgrid Controller");
    app_state.spawn_tasks();

    telemetry::shutdown_signal().await;
    app_state.shutdown();

    warn!("shutdown complete");
    Ok(())
}
