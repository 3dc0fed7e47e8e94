//! Web layer: the REST surface over the store, the proxy and the workers.
//!
//! Handlers are thin; they validate parameters, delegate to the service
//! layer and map errors through [`crate::errors::AppError`].

use anyhow::Result;
use axum::http::HeaderValue;
use axum::routing::{delete, get, post};
use axum::Router;
use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::config::Settings;
use crate::database::Database;
use crate::services::catalog_sync::CatalogSyncService;
use crate::services::health_worker::HealthWorker;
use crate::services::stream_proxy::StreamProxyService;
use crate::services::transcoder::TranscoderManager;

pub mod channels;
pub mod epg;
pub mod streams;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub settings: Settings,
    pub sync: Arc<CatalogSyncService>,
    pub proxy: Arc<StreamProxyService>,
    pub transcoder: Arc<TranscoderManager>,
    pub health_worker: Arc<HealthWorker>,
}

pub struct WebServer {
    app: Router,
    addr: SocketAddr,
}

impl WebServer {
    pub fn new(state: AppState) -> Result<Self> {
        let addr: SocketAddr =
            format!("{}:{}", state.settings.host, state.settings.port).parse()?;
        let app = Self::create_router(state);
        Ok(Self { app, addr })
    }

    pub fn create_router(state: AppState) -> Router {
        let cors = cors_layer(&state.settings);

        Router::new()
            .route("/api/health", get(channels::health_check))
            .route("/api/stats", get(channels::get_stats))
            // channel discovery
            .route("/api/channels", get(channels::list_channels))
            .route("/api/channels/:id", get(channels::get_channel))
            .route("/api/categories", get(channels::list_categories))
            .route("/api/countries", get(channels::list_countries))
            .route("/api/languages", get(channels::list_languages))
            .route("/api/regions", get(channels::list_regions))
            .route("/api/providers", get(channels::list_providers))
            .route("/api/sync", post(channels::trigger_sync))
            // streaming proxy + health observability
            .route("/api/streams/stats", get(streams::get_stream_stats))
            .route("/api/streams/health-updates", get(streams::get_health_updates))
            .route("/api/streams/health-stats", get(streams::get_health_stats))
            .route("/api/streams/health-worker", get(streams::get_health_worker))
            .route("/api/streams/import/m3u", post(streams::import_m3u))
            .route("/api/streams/:id/play.m3u8", get(streams::play_manifest))
            .route("/api/streams/:id/segment/:encoded", get(streams::proxy_segment))
            .route("/api/streams/:id/local/:filename", get(streams::serve_transcode_file))
            .route("/api/streams/:id/status", get(streams::stream_status))
            // EPG
            .route("/api/epg/stats", get(epg::get_epg_stats))
            .route("/api/epg/channel/:id", get(epg::get_channel_epg))
            .route("/api/epg/now/playing", get(epg::get_now_playing))
            .route("/api/epg/timeline", get(epg::get_timeline))
            .route("/api/epg/import", post(epg::import_epg))
            .route("/api/epg/clear", delete(epg::clear_epg))
            .layer(TraceLayer::new_for_http())
            .layer(cors)
            .with_state(state)
    }

    pub async fn serve<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = tokio::net::TcpListener::bind(&self.addr).await?;
        axum::serve(listener, self.app)
            .with_graceful_shutdown(shutdown)
            .await?;
        Ok(())
    }

    pub fn host(&self) -> String {
        self.addr.ip().to_string()
    }

    pub fn port(&self) -> u16 {
        self.addr.port()
    }
}

fn cors_layer(settings: &Settings) -> CorsLayer {
    if settings.cors_origins.iter().any(|origin| origin == "*") {
        CorsLayer::new()
            .allow_origin(Any)
            .allow_methods(Any)
            .allow_headers(Any)
    } else {
        let origins: Vec<HeaderValue> = settings
            .cors_origins
            .iter()
            .filter_map(|origin| origin.parse().ok())
            .collect();
        CorsLayer::new()
            .allow_origin(AllowOrigin::list(origins))
            .allow_methods(Any)
            .allow_headers(Any)
    }
}
