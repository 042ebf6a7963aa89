use axum::{
    Extension, Json, Router,
    extract::Query,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tracing::info;

use crate::server::api::parse_target_url;
use crate::server::error::{AppResult, Error};
use crate::server::services::download_services::DownloadHandle;
use crate::server::services::playlist_services::VariantStream;
use crate::server::services::relay_services::RelayServices;

#[derive(Deserialize)]
struct DownloadQuery {
    url: Option<String>,
}

pub struct DownloadController;

impl DownloadController {
    pub fn app() -> Router {
        Router::new()
            .route("/download", get(Self::download_get))
            .route("/variants", get(Self::variants_get))
    }

    /// full-playlist crawl: resolve the best variant, pull every segment with
    /// bounded concurrency and hand back one combined file. Any permanently
    /// failed segment fails the whole request
    async fn download_get(
        Extension(services): Extension<RelayServices>,
        Query(params): Query<DownloadQuery>,
    ) -> AppResult<Response> {
        let raw = params
            .url
            .ok_or_else(|| Error::BadRequest("Missing url parameter".to_string()))?;
        let target_url = parse_target_url(&raw)?;

        let segments = services.playlists.segments_for_best(&target_url).await?;
        info!("download requested: {} segments from {}", segments.len(), target_url);

        let outcome = services
            .downloads
            .download_all(segments, DownloadHandle::new())
            .await?;

        let filename = format!("relay_{}.ts", nanoid::nanoid!(8));

        let mut headers = HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            "video/mp2t".parse().expect("Static header value should parse"),
        );
        headers.insert(
            header::CONTENT_DISPOSITION,
            format!("attachment; filename=\"{}\"", filename)
                .parse()
                .expect("Generated filename should parse"),
        );
        headers.insert(
            header::CONTENT_LENGTH,
            outcome
                .data
                .len()
                .to_string()
                .parse()
                .expect("Content length should parse"),
        );

        Ok((StatusCode::OK, headers, outcome.data).into_response())
    }

    /// quality grid data: variants of a master playlist, tallest first
    async fn variants_get(
        Extension(services): Extension<RelayServices>,
        Query(params): Query<DownloadQuery>,
    ) -> AppResult<Json<Vec<VariantStream>>> {
        let raw = params
            .url
            .ok_or_else(|| Error::BadRequest("Missing url parameter".to_string()))?;
        let target_url = parse_target_url(&raw)?;

        let variants = services.playlists.variants_for(&target_url).await?;
        Ok(Json(variants))
    }
}
