use tracing_subscriber::{fmt, EnvFilter};
use tracing::info;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Init logging
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new("info"))
        .unwrap();
    fmt().with_env_filter(filter).init();

    // Startup banner at info level so something always prints at default verbosity
    let rust_log = std::env::var("RUST_LOG").unwrap_or_else(|_| "<unset>".to_string());
    let cfg = groupgate::server::Config::from_env();
    info!(
        target: "groupgate",
        "groupgate starting: RUST_LOG='{}', policy={:?}, socket='{}'",
        rust_log,
        cfg.policy_path,
        cfg.socket_path.display()
    );

    groupgate::server::run_with_config(cfg).await
}
