use std::sync::Arc;

use narthex_core::App;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    utils::init_tracing();

    // The config directory holds service.toml and hosts.toml; both are
    // watched for changes while running.
    let config_dir = std::env::args().nth(1).unwrap_or_else(|| "config".to_string());
    tracing::info!(target: "narthex", %config_dir, "Starting gateway");

    let app = Arc::new(App::new(config_dir)?);
    app.run().await
}
