pub mod download_controller;
pub mod health_controller;
pub mod pdf_controller;
pub mod playlist_controller;
pub mod segment_controller;

use axum::body::Body;
use axum::http::{HeaderValue, StatusCode, header};
use axum::response::Response;
use tracing::error;
use url::Url;

use crate::server::error::{AppResult, Error};

// headers the relay platform manages itself and must never copy from upstream
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// validate a relay target before any upstream i/o. Axum's Query extractor
/// already percent-decoded the parameter, so this only parses and gates the
/// scheme
pub(crate) fn parse_target_url(raw: &str) -> AppResult<Url> {
    if !raw.starts_with("http://") && !raw.starts_with("https://") {
        return Err(Error::BadRequest("Invalid URL format".to_string()));
    }

    Url::parse(raw).map_err(|e| {
        error!("failed to parse target url: {}", e);
        Error::BadRequest("Invalid URL format".to_string())
    })
}

/// turn an open upstream response into the client response: status unchanged,
/// headers verbatim minus hop-by-hop framing, body streamed chunk by chunk so
/// memory stays flat no matter the segment size. Backpressure falls out of
/// the piped stream - a slow client pauses the upstream read
pub(crate) fn relay_response(
    upstream: reqwest::Response,
    default_content_type: &'static str,
) -> Response {
    let status = upstream.status();

    let mut builder = Response::builder().status(status);

    let mut saw_content_type = false;
    for (name, value) in upstream.headers() {
        if HOP_BY_HOP.contains(&name.as_str()) {
            continue;
        }
        if name == &header::CONTENT_TYPE {
            saw_content_type = true;
        }
        builder = builder.header(name, value);
    }

    if !saw_content_type {
        builder = builder.header(
            header::CONTENT_TYPE,
            HeaderValue::from_static(default_content_type),
        );
    }

    builder
        .body(Body::from_stream(upstream.bytes_stream()))
        .unwrap_or_else(|e| {
            // only reachable with a malformed upstream header set
            error!("failed to build relay response: {}", e);
            Response::builder()
                .status(StatusCode::INTERNAL_SERVER_ERROR)
                .body(Body::from("relay response error"))
                .expect("static fallback response should build")
        })
}
