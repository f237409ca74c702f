use anyhow::{Context, Result};
use clap::Parser;
use rtmp_stream::{
    create_router, AppState, CaptureConfig, Config, LoopbackFactory, MethodCallHandler,
    NatsClient, SessionRegistry,
};
use std::sync::Arc;
use tracing::{info, warn};

/// Camera capture, recording and RTMP streaming control server
#[derive(Debug, Parser)]
#[command(name = "rtmp-stream", version)]
struct Args {
    /// Configuration file (extension optional)
    #[arg(long, default_value = "config/rtmp-stream")]
    config: String,

    /// Address to bind, overrides service.http.bind
    #[arg(long)]
    bind: Option<String>,

    /// Port to listen on, overrides service.http.port
    #[arg(long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "rtmp_stream=debug,tower_http=info".into()),
        )
        .init();

    let args = Args::parse();
    let cfg = Config::load(&args.config)?;

    info!("{} v{}", cfg.service.name, env!("CARGO_PKG_VERSION"));

    let defaults = cfg.stream.session_config(CaptureConfig::default());
    let mut registry = SessionRegistry::new(Arc::new(LoopbackFactory::paced()), defaults);

    if let Some(url) = &cfg.events.nats_url {
        match NatsClient::connect(url).await {
            Ok(client) => registry = registry.with_relay(client),
            Err(e) => warn!("Session events will not be relayed: {:#}", e),
        }
    }

    let registry = Arc::new(registry);
    let output_dir = cfg.recording.output_dir();
    info!("Recordings go to {}", output_dir.display());

    let methods = MethodCallHandler::new(Arc::clone(&registry)).with_output_dir(output_dir);
    let app = create_router(AppState::new(methods));

    let bind = args.bind.unwrap_or(cfg.service.http.bind);
    let port = args.port.unwrap_or(cfg.service.http.port);
    let listener = tokio::net::TcpListener::bind((bind.as_str(), port))
        .await
        .with_context(|| format!("Failed to bind {}:{}", bind, port))?;

    info!("HTTP server listening on {}:{}", bind, port);

    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutting down");
        })
        .await?;

    registry.dispose_all().await;
    Ok(())
}
