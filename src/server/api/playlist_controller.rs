use std::io::Write;

use axum::{
    Extension, Router,
    extract::Query,
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
    routing::get,
};

use flate2::{Compression, write::GzEncoder};
use serde::Deserialize;
use tracing::{debug, error};

use crate::server::api::{parse_target_url, relay_response};
use crate::server::error::{AppResult, Error};
use crate::server::services::playlist_services::{HLS_CONTENT_TYPE, RewriteOutcome};
use crate::server::services::relay_services::RelayServices;

/// Supported compression encodings for rewritten playlist bodies.
/// Apple HLS clients send "gzip, deflate" or "identity" and it must be respected
#[derive(Debug, Clone, Copy, PartialEq)]
enum ContentEncoding {
    Zstd,
    Gzip,
    None,
}

impl ContentEncoding {
    fn from_accept_encoding(accept_encoding: Option<&str>) -> Self {
        match accept_encoding {
            Some(v) => {
                // don't compress if client explicitly requests identity-only
                if v == "identity" || v.starts_with("identity,") {
                    return Self::None;
                }
                // prefer zstd if supported (better compression), fallback to gzip
                if v.contains("zstd") {
                    Self::Zstd
                } else if v.contains("gzip") {
                    Self::Gzip
                } else {
                    Self::None
                }
            }
            None => Self::None,
        }
    }

    fn as_header_value(&self) -> Option<&'static str> {
        match self {
            Self::Zstd => Some("zstd"),
            Self::Gzip => Some("gzip"),
            Self::None => None,
        }
    }

    fn compress(&self, data: &[u8]) -> Result<Vec<u8>, std::io::Error> {
        match self {
            Self::Zstd => zstd::encode_all(data, 3),
            Self::Gzip => {
                let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
                encoder.write_all(data)?;
                encoder.finish()
            }
            Self::None => Ok(data.to_vec()),
        }
    }
}

#[derive(Deserialize)]
struct ProxyQuery {
    url: Option<String>,
    // "true" picks the maximum-bandwidth variant of a master playlist
    full: Option<String>,
}

pub struct PlaylistController;

impl PlaylistController {
    pub fn app() -> Router {
        Router::new().route("/", get(Self::proxy_get).options(Self::proxy_options))
    }

    /// playlist relay. Fetches the target, rewrites every media/variant URI
    /// into proxy form, or falls back to a streamed byte relay when the
    /// target turns out not to be a playlist at all
    async fn proxy_get(
        Extension(services): Extension<RelayServices>,
        Query(params): Query<ProxyQuery>,
        headers: HeaderMap,
    ) -> AppResult<Response> {
        let raw = params
            .url
            .ok_or_else(|| Error::BadRequest("Missing url parameter".to_string()))?;
        let target_url = parse_target_url(&raw)?;

        let wants_best = params.full.as_deref() == Some("true");
        debug!("proxying playlist (full={}): {}", wants_best, target_url);

        match services
            .playlists
            .rewrite_for_client(&target_url, wants_best)
            .await?
        {
            RewriteOutcome::Playlist(text) => Self::build_playlist_response(&text, &headers),
            RewriteOutcome::NotPlaylist => {
                // raw media behind the playlist endpoint, stream it through
                let range = headers.get(header::RANGE).and_then(|v| v.to_str().ok());
                let upstream = services
                    .upstream
                    .fetch_stream(target_url.as_str(), range, None)
                    .await?;
                Ok(relay_response(upstream, "application/octet-stream"))
            }
        }
    }

    async fn proxy_options() -> impl IntoResponse {
        StatusCode::NO_CONTENT
    }

    /// rewritten playlist response with proper headers and optional compression
    fn build_playlist_response(processed_body: &str, headers: &HeaderMap) -> AppResult<Response> {
        let encoding = ContentEncoding::from_accept_encoding(
            headers
                .get(header::ACCEPT_ENCODING)
                .and_then(|v| v.to_str().ok()),
        );

        let mut response_headers = HeaderMap::new();
        response_headers.insert(
            header::CONTENT_TYPE,
            HLS_CONTENT_TYPE
                .parse()
                .expect("Static header value should parse"),
        );
        response_headers.insert(
            header::CACHE_CONTROL,
            "no-cache"
                .parse()
                .expect("Static header value should parse"),
        );

        let response_body: Vec<u8> = if encoding != ContentEncoding::None {
            let compressed_body = encoding.compress(processed_body.as_bytes()).map_err(|e| {
                error!("Failed to compress response with {:?}: {}", encoding, e);
                Error::InternalServerErrorWithContext("Failed to compress response".to_string())
            })?;
            debug!(
                "compressed playlist with {:?} from {} to {} bytes",
                encoding,
                processed_body.len(),
                compressed_body.len()
            );
            if let Some(enc_header) = encoding.as_header_value() {
                response_headers.insert(
                    header::CONTENT_ENCODING,
                    enc_header
                        .parse()
                        .expect("Static header value should parse"),
                );
            }
            compressed_body
        } else {
            processed_body.as_bytes().to_vec()
        };

        response_headers.insert(
            header::CONTENT_LENGTH,
            response_body
                .len()
                .to_string()
                .parse()
                .expect("Content length should parse"),
        );

        Ok((StatusCode::OK, response_headers, response_body).into_response())
    }
}
