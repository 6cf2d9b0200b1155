use anyhow::{Context, Result};
use clap::Parser;
use tracing_subscriber::EnvFilter;

mod cli;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = cli::Cli::parse();

    let mut config = if args.config.exists() {
        modelgate_common::GatewayConfig::load(&args.config)
            .with_context(|| format!("load config {}", args.config.display()))?
    } else {
        tracing::warn!(path = %args.config.display(), "config file not found, starting with defaults");
        modelgate_common::GatewayConfig::default()
    };
    if let Some(host) = args.host {
        config.host = Some(host);
    }
    if let Some(port) = args.port {
        config.port = Some(port);
    }

    let bind = format!("{}:{}", config.host(), config.port());
    let config_path = args.config.exists().then(|| args.config.clone());
    let gateway = modelgate_core::bootstrap(config, config_path.clone()).await?;

    let app = modelgate_router::proxy_router(gateway.engine.clone(), gateway.config.clone())
        .merge(modelgate_router::management_router(
            modelgate_router::ManagementState {
                config: gateway.config.clone(),
                conductor: gateway.conductor.clone(),
                config_path,
            },
        ));

    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("bind {bind}"))?;
    tracing::info!(%bind, "modelgate listening");
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<std::net::SocketAddr>(),
    )
    .await?;
    Ok(())
}
