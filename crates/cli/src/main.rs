use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use hls2rtsp::ingest::{HlsIngest, Ingest};
use hls2rtsp::{Bridge, BridgeOptions, Config, Server, ServerConfig};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(
    name = "hls2rtsp",
    version,
    about = "Republish HLS live streams over RTSP"
)]
struct Args {
    /// Path to the YAML configuration file
    #[arg(long, short, default_value = "config.yaml")]
    config: String,
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    let config = match Config::load(&args.config) {
        Ok(config) => config,
        Err(e) => {
            tracing::error!(path = %args.config, error = %e, "failed to load config");
            return ExitCode::FAILURE;
        }
    };

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        streams = config.streams.len(),
        "hls2rtsp starting"
    );

    let mut server = Server::with_config(
        &config.listen_addr(),
        ServerConfig {
            public_host: config.server.public_host.clone(),
            auth: config.credentials(),
            ..ServerConfig::default()
        },
    );
    if let Err(e) = server.start() {
        tracing::error!(addr = %config.listen_addr(), error = %e, "failed to start RTSP server");
        return ExitCode::FAILURE;
    }

    let ingest: Arc<dyn Ingest> = match HlsIngest::new() {
        Ok(ingest) => Arc::new(ingest),
        Err(e) => {
            tracing::error!(error = %e, "failed to build HTTP client");
            server.stop();
            return ExitCode::FAILURE;
        }
    };

    let options = BridgeOptions {
        reconnect_delay: config.reconnect_delay,
        metrics_interval: config.metrics.enabled.then_some(config.metrics.interval),
    };

    let mut bridges = Vec::with_capacity(config.streams.len());
    for (name, stream) in &config.streams {
        let mut bridge = Bridge::new(
            name,
            &stream.url,
            server.mounts(),
            ingest.clone(),
            options.clone(),
        );
        bridge.start();
        bridges.push(bridge);

        tracing::info!(stream = %name, url = %playback_url(&config, name), "stream configured");
    }

    tracing::info!("hls2rtsp running, press Ctrl+C to stop");
    shutdown_signal().await;
    tracing::info!("shutting down");

    for bridge in &mut bridges {
        bridge.close().await;
    }
    server.stop();

    ExitCode::SUCCESS
}

fn playback_url(config: &Config, name: &str) -> String {
    let port = config.server.port;
    match config.credentials() {
        Some(creds) => format!(
            "rtsp://{}:{}@localhost:{}/{}",
            creds.username, creds.password, port, name
        ),
        None => format!("rtsp://localhost:{}/{}", port, name),
    }
}

/// Resolve on Ctrl-C, or SIGTERM on Unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %e, "failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
