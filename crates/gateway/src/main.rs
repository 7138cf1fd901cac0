use anyhow::Context;
use collabornest_gateway::config::LogFormat;
use collabornest_gateway::{serve, shutdown_signal, Gateway, GatewayConfig};
use tokio::net::TcpListener;
use tracing::warn;
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = GatewayConfig::from_env();
    init_tracing(&config);

    if config.is_dev_jwt_secret() {
        warn!("using the development JWT secret; set COLLABORNEST_GATEWAY_JWT_SECRET in production");
    }

    let listen_addr = config.listen_addr;
    let gateway = Gateway::new(config)?;
    let listener = TcpListener::bind(listen_addr)
        .await
        .with_context(|| format!("failed to bind gateway listener on {listen_addr}"))?;

    serve(listener, gateway, shutdown_signal()).await
}

fn init_tracing(config: &GatewayConfig) {
    let filter = EnvFilter::try_new(&config.log_filter).unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match config.log_format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}
