use tracing_subscriber::{EnvFilter, fmt};
use tracing::info;

use coursegate::config::GateConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))?;
    fmt().with_env_filter(filter).init();

    let config = GateConfig::from_env()?;

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    info!(
        target: "coursegate",
        "coursegate starting: RUST_LOG='{}', http_port={}, admin_session_ttl={}s, sweep_interval={}s, break_glass={}",
        rust_log,
        config.http_port,
        config.privileged_token_ttl.as_secs(),
        config.sweep_interval.as_secs(),
        config.break_glass.is_some()
    );

    coursegate::server::run(config).await
}
