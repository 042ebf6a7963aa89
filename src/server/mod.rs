pub mod api;
pub mod dtos;
pub mod error;
pub mod services;

use std::sync::Arc;
use std::time::Instant;

use anyhow::Context;
use axum::http::HeaderValue;
use axum::routing::get;
use axum::{Extension, Router, ServiceExt, extract::Request};
use once_cell::sync::Lazy;
use tower::Layer;
use tower_http::cors::{self, CorsLayer};
use tower_http::normalize_path::NormalizePathLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::AppConfig;
use crate::server::api::download_controller::DownloadController;
use crate::server::api::health_controller::health_endpoint;
use crate::server::api::pdf_controller::PdfController;
use crate::server::api::playlist_controller::PlaylistController;
use crate::server::api::segment_controller::SegmentController;
use crate::server::services::relay_services::RelayServices;

pub use error::{AppResult, Error};

static START_TIME: Lazy<Instant> = Lazy::new(Instant::now);

pub fn get_uptime_seconds() -> u64 {
    START_TIME.elapsed().as_secs()
}

pub fn get_app_version() -> &'static str {
    env!("CARGO_PKG_VERSION")
}

pub struct ApplicationServer;

impl ApplicationServer {
    pub async fn serve(config: Arc<AppConfig>) -> anyhow::Result<()> {
        // pin the uptime clock to server start, not first health call
        Lazy::force(&START_TIME);

        let port = config.port;
        let cors = Self::cors_layer(&config)?;
        let services = RelayServices::new(config)?;

        let router = Router::new()
            .route("/health", get(health_endpoint))
            .nest("/proxy", PlaylistController::app())
            .nest("/segment", SegmentController::app())
            .nest("/pdf", PdfController::app())
            .nest("/api", DownloadController::app())
            .layer(Extension(services))
            .layer(cors)
            .layer(TraceLayer::new_for_http());

        // trailing-slash normalization has to wrap the router to run before routing
        let app = NormalizePathLayer::trim_trailing_slash().layer(router);

        let listener = tokio::net::TcpListener::bind(("0.0.0.0", port))
            .await
            .context("failed to bind relay port")?;

        info!("relay listening on port {}", port);

        axum::serve(listener, ServiceExt::<Request>::into_make_service(app))
            .await
            .context("relay server crashed")?;

        Ok(())
    }

    fn cors_layer(config: &AppConfig) -> anyhow::Result<CorsLayer> {
        // * allows everything, otherwise a comma separated origin list
        let layer = if config.cors_origin.trim() == "*" {
            CorsLayer::new()
                .allow_origin(cors::Any)
                .allow_methods(cors::Any)
                .allow_headers(cors::Any)
        } else {
            let origins = config
                .cors_origin
                .split(',')
                .map(|origin| {
                    origin
                        .trim()
                        .parse::<HeaderValue>()
                        .context("invalid cors origin")
                })
                .collect::<anyhow::Result<Vec<_>>>()?;

            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(cors::Any)
                .allow_headers(cors::Any)
        };

        Ok(layer)
    }
}
