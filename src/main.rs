use std::time::Duration;

use clap::Parser;
use config::Config;
use serde::Deserialize;
use tracing::info;
use vodhls::{
    create_app,
    metrics::MonitoringConfig,
    reaper::spawn_reaper,
    resolver::{self, ResolverConfig},
    service::TranscodeService,
    settings::{HlsMode, TranscodeConfig},
};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// Path to configuration file
    #[arg(long, default_value = "config.toml")]
    config: String,

    /// Playlist mode (overrides config)
    #[arg(long)]
    hls_mode: Option<HlsMode>,

    /// Hardware acceleration: auto, cpu, qsv, vaapi, nvenc, videotoolbox (overrides config)
    #[arg(long)]
    hw_accel: Option<String>,
}

#[derive(Debug, Deserialize)]
struct Settings {
    #[serde(default)]
    server: ServerConfig,
    #[serde(default)]
    transcode: TranscodeConfig,
    #[serde(default)]
    resolver: ResolverConfig,
    #[serde(default)]
    monitoring: MonitoringConfig,
}

#[derive(Debug, Deserialize)]
struct ServerConfig {
    #[serde(default = "default_host")]
    host: String,
    #[serde(default = "default_port")]
    port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8096
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let args = Args::parse();

    // File is optional; VODHLS__TRANSCODE__MAX_CONCURRENT_TASKS=4 style overrides win.
    let settings = Config::builder()
        .add_source(config::File::with_name(&args.config).required(false))
        .add_source(config::Environment::with_prefix("VODHLS").separator("__"))
        .build()?;
    let mut settings: Settings = settings.try_deserialize()?;

    if let Some(mode) = args.hls_mode {
        settings.transcode.hls_mode = mode;
    }
    if let Some(accel) = args.hw_accel {
        settings.transcode.hw_accel = accel;
    }
    info!("Configuration loaded from {}: {:?}", args.config, settings);

    tokio::fs::create_dir_all(&settings.transcode.work_dir).await?;

    let resolver = resolver::from_config(&settings.resolver)?;
    let cleanup_interval = Duration::from_secs(settings.transcode.cleanup_interval_secs.max(1));
    let service = TranscodeService::new(settings.transcode, resolver);
    let registry = service.registry().clone();
    let reaper = spawn_reaper(registry.clone(), cleanup_interval);

    let app = create_app(service, settings.monitoring);

    let addr = format!("{}:{}", settings.server.host, settings.server.port);
    info!("Listening on http://{}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown requested");
        })
        .await?;

    reaper.abort();
    registry.shutdown().await;
    Ok(())
}
