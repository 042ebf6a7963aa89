use axum::{
    Extension, Router,
    extract::Query,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tracing::debug;

use crate::server::api::{parse_target_url, relay_response};
use crate::server::error::{AppResult, Error};
use crate::server::services::relay_services::RelayServices;

#[derive(Deserialize)]
struct SegmentQuery {
    url: Option<String>,
    // legacy split form, base + file joined server-side
    base: Option<String>,
    file: Option<String>,
}

pub struct SegmentController;

impl SegmentController {
    pub fn app() -> Router {
        Router::new().route("/", get(Self::segment_get).options(Self::segment_options))
    }

    /// segment relay. Streams the upstream body straight through - status
    /// unchanged, headers verbatim, no buffering so multi-MB segments never
    /// pile up in memory. Retry on truncation is the player's job, not ours
    async fn segment_get(
        Extension(services): Extension<RelayServices>,
        Query(params): Query<SegmentQuery>,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        let target_url = match (params.url, params.base, params.file) {
            (Some(url), _, _) => parse_target_url(&url)?,
            (None, Some(base), Some(file)) => {
                let base = parse_target_url(&base)?;
                base.join(&file).map_err(|_| {
                    Error::BadRequest("Invalid base/file combination".to_string())
                })?
            }
            _ => return Err(Error::BadRequest("Missing url parameter".to_string())),
        };

        let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
        debug!("relaying segment: {} (range: {:?})", target_url, range);

        let upstream = services
            .upstream
            .fetch_stream(target_url.as_str(), range, None)
            .await?;

        Ok(relay_response(upstream, "video/mp2t"))
    }

    async fn segment_options() -> impl IntoResponse {
        StatusCode::NO_CONTENT
    }
}
