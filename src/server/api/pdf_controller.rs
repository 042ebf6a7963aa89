use axum::{
    Extension, Router,
    extract::Query,
    http::{HeaderMap, HeaderValue, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};
use serde::Deserialize;
use tracing::{debug, error};
use url::Url;

use crate::server::api::{parse_target_url, relay_response};
use crate::server::error::{AppResult, Error};
use crate::server::services::relay_services::RelayServices;

// pdf.js and friends fetch byte ranges on demand instead of the whole file,
// so Range must flow upstream and Content-Range back
const PDF_ACCEPT: &str = "application/pdf,application/octet-stream,*/*";

#[derive(Deserialize)]
struct PdfQuery {
    url: Option<String>,
    // "1" forces an attachment download instead of inline viewing
    dl: Option<String>,
}

pub struct PdfController;

impl PdfController {
    pub fn app() -> Router {
        Router::new().route("/", get(Self::pdf_get).options(Self::pdf_options))
    }

    async fn pdf_get(
        Extension(services): Extension<RelayServices>,
        Query(params): Query<PdfQuery>,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        let raw = params
            .url
            .ok_or_else(|| Error::BadRequest("Missing url parameter".to_string()))?;
        let target_url = parse_target_url(&raw)?;

        let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
        let accept = headers
            .get(header::ACCEPT)
            .and_then(|v| v.to_str().ok())
            .or(Some(PDF_ACCEPT));

        debug!("relaying pdf: {} (range: {:?})", target_url, range);

        let upstream = services
            .upstream
            .fetch_stream(target_url.as_str(), range, accept)
            .await?;

        let mut response = relay_response(upstream, "application/pdf");

        let disposition = if params.dl.as_deref() == Some("1") {
            format!(
                "attachment; filename=\"{}\"",
                Self::download_filename(&target_url)
            )
        } else {
            "inline".to_string()
        };

        match HeaderValue::from_str(&disposition) {
            Ok(value) => {
                response
                    .headers_mut()
                    .insert(header::CONTENT_DISPOSITION, value);
            }
            Err(e) => {
                // filename came out unrepresentable, serve without disposition
                error!("invalid content-disposition: {}", e);
            }
        }

        Ok(response)
    }

    async fn pdf_options() -> impl IntoResponse {
        StatusCode::NO_CONTENT
    }

    /// last path segment of the target when it looks like a filename,
    /// otherwise a generated one
    fn download_filename(url: &Url) -> String {
        url.path_segments()
            .and_then(|mut segments| segments.next_back().map(|s| s.to_string()))
            .filter(|name| name.to_ascii_lowercase().ends_with(".pdf"))
            .unwrap_or_else(|| format!("document-{}.pdf", nanoid::nanoid!(8)))
    }
}
