use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use iptv_gateway::{
    config::Settings,
    database::Database,
    services::{
        catalog_sync::CatalogSyncService, geo_bypass::GeoBypassService,
        health_worker::HealthWorker, stream_proxy::StreamProxyService,
        transcoder::TranscoderManager,
    },
    web::{AppState, WebServer},
};

#[derive(Parser)]
#[command(name = "iptv-gateway")]
#[command(version)]
#[command(about = "A self-hosted IPTV gateway with catalog sync, health probing and an HLS proxy")]
#[command(long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "config.toml")]
    config: String,

    /// Listening IP address
    #[arg(short = 'H', long, value_name = "IP")]
    host: Option<String>,

    /// Listening port
    #[arg(short, long, value_name = "PORT")]
    port: Option<u16>,

    /// Database path (overrides config file)
    #[arg(short = 'd', long, value_name = "PATH")]
    database: Option<String>,

    /// Log level
    #[arg(short = 'v', long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_filter = format!("iptv_gateway={},tower_http=info", cli.log_level);
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| log_filter.into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting IPTV gateway v{}", env!("CARGO_PKG_VERSION"));

    let mut settings = Settings::load(&cli.config)?;
    if let Some(host) = cli.host {
        settings.host = host;
    }
    if let Some(port) = cli.port {
        settings.port = port;
    }
    if let Some(database) = cli.database {
        settings.database_path = database;
    }

    info!("Using database: {}", settings.database_path);
    let db = Database::connect(&settings.database_path).await?;
    db.initialize().await?;

    let geo = Arc::new(GeoBypassService::new()?);
    let transcoder = Arc::new(TranscoderManager::new(settings.transcode_dir()));
    let proxy = Arc::new(StreamProxyService::new(
        db.clone(),
        Arc::clone(&geo),
        Arc::clone(&transcoder),
    )?);
    let sync = Arc::new(CatalogSyncService::new(db.clone(), settings.clone())?);
    let health_worker = Arc::new(HealthWorker::new(db.clone(), settings.data_dir())?);

    // Sweep transcode directories left behind by a previous run.
    transcoder.cleanup_stale_transcodes(0).await;

    // Populate an empty store in the background so startup stays fast.
    if db.count_channels().await? == 0 {
        info!("Store is empty, syncing catalogs from upstream");
        let sync = Arc::clone(&sync);
        tokio::spawn(async move {
            match sync.sync_all().await {
                Ok(summary) => info!("Initial catalog sync complete: {:?}", summary),
                Err(e) => error!("Initial catalog sync failed: {}", e),
            }
        });
    }

    health_worker.start().await;

    if settings.sync_interval_hours > 0 {
        let sync = Arc::clone(&sync);
        let db = db.clone();
        let interval_hours = settings.sync_interval_hours;
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(interval_hours * 3600));
            ticker.tick().await; // the first tick fires immediately
            loop {
                ticker.tick().await;
                if let Err(e) = db.clear_expired().await {
                    error!("Cache expiry sweep failed: {}", e);
                }
                match sync.sync_all().await {
                    Ok(summary) => info!("Periodic catalog sync complete: {:?}", summary),
                    Err(e) => error!("Periodic catalog sync failed: {}", e),
                }
            }
        });
    }

    {
        let transcoder = Arc::clone(&transcoder);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(Duration::from_secs(60));
            ticker.tick().await;
            loop {
                ticker.tick().await;
                transcoder.cleanup_stale_transcodes(5).await;
            }
        });
    }

    let state = AppState {
        db,
        settings: settings.clone(),
        sync,
        proxy,
        transcoder: Arc::clone(&transcoder),
        health_worker: Arc::clone(&health_worker),
    };
    let server = WebServer::new(state)?;
    info!("Starting web server on {}:{}", server.host(), server.port());

    let shutdown = {
        let health_worker = Arc::clone(&health_worker);
        let transcoder = Arc::clone(&transcoder);
        async move {
            let _ = tokio::signal::ctrl_c().await;
            info!("Shutdown signal received");
            health_worker.stop().await;
            transcoder.shutdown().await;
        }
    };
    server.serve(shutdown).await?;

    Ok(())
}
