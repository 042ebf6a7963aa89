use std::sync::Arc;
use std::time::Duration;

use axum::http::header;
use tracing::{debug, error};

use crate::config::AppConfig;
use crate::server::error::{AppResult, Error};

const DESKTOP_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";

pub type DynUpstreamService = Arc<dyn UpstreamServiceTrait + Send + Sync>;

/// buffered text response, used for playlists
pub struct UpstreamText {
    pub status: u16,
    pub content_type: String,
    pub body: String,
}

#[async_trait::async_trait]
pub trait UpstreamServiceTrait {
    /// fetch and fully buffer a text body. Fails on non-2xx.
    async fn fetch_text(&self, url: &str) -> AppResult<UpstreamText>;

    /// fetch in streaming mode and hand back the open response so the caller
    /// can relay status, headers and body without buffering. Optional Range
    /// and Accept headers are merged over the fixed bundle.
    async fn fetch_stream(
        &self,
        url: &str,
        range: Option<&str>,
        accept: Option<&str>,
    ) -> AppResult<reqwest::Response>;

    /// fetch and fully buffer a binary body, used by the segment downloader.
    async fn fetch_bytes(&self, url: &str) -> AppResult<bytes::Bytes>;
}

pub struct UpstreamService {
    http: reqwest::Client,
    origin: String,
    referer: String,
}

impl UpstreamService {
    pub fn new(config: &AppConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.upstream_timeout_secs))
            .redirect(reqwest::redirect::Policy::limited(
                config.upstream_max_redirects,
            ))
            .build()?;

        // origins check the trailing slash on Referer, keep it
        let origin = config.upstream_origin.trim_end_matches('/').to_string();
        let referer = format!("{}/", origin);

        Ok(Self {
            http,
            origin,
            referer,
        })
    }

    /// the fixed spoofed bundle every upstream request carries so the origin
    /// believes the fetch comes from its own player page
    fn spoofed(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        builder
            .header(header::REFERER, &self.referer)
            .header(header::ORIGIN, &self.origin)
            .header(header::USER_AGENT, DESKTOP_USER_AGENT)
            .header(header::CONNECTION, "keep-alive")
    }
}

#[async_trait::async_trait]
impl UpstreamServiceTrait for UpstreamService {
    async fn fetch_text(&self, url: &str) -> AppResult<UpstreamText> {
        debug!("upstream text fetch: {}", url);

        let response = self
            .spoofed(self.http.get(url))
            .header(header::ACCEPT, "*/*")
            .send()
            .await
            .map_err(|e| {
                error!("upstream request failed: {} - {}", url, e);
                Error::from_upstream(e)
            })?;

        let status = response.status();
        if !status.is_success() {
            error!("upstream returned {} for {}", status, url);
            return Err(Error::UpstreamFetch {
                status: Some(status.as_u16()),
                message: format!("upstream returned {}", status),
            });
        }

        let content_type = response
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .unwrap_or("")
            .to_string();

        let body = response.text().await.map_err(|e| {
            error!("failed to read upstream body: {}", e);
            Error::from_upstream(e)
        })?;

        debug!("upstream text fetch ok: {} chars", body.len());

        Ok(UpstreamText {
            status: status.as_u16(),
            content_type,
            body,
        })
    }

    async fn fetch_stream(
        &self,
        url: &str,
        range: Option<&str>,
        accept: Option<&str>,
    ) -> AppResult<reqwest::Response> {
        debug!("upstream stream fetch: {} (range: {:?})", url, range);

        let mut builder = self
            .spoofed(self.http.get(url))
            .header(header::ACCEPT, accept.unwrap_or("*/*"));

        // pass the client's Range through untouched so the origin can answer 206
        if let Some(range) = range {
            builder = builder.header(header::RANGE, range);
        }

        let response = builder.send().await.map_err(|e| {
            error!("upstream request failed: {} - {}", url, e);
            Error::from_upstream(e)
        })?;

        Ok(response)
    }

    async fn fetch_bytes(&self, url: &str) -> AppResult<bytes::Bytes> {
        let response = self
            .spoofed(self.http.get(url))
            .header(header::ACCEPT, "*/*")
            .send()
            .await
            .map_err(Error::from_upstream)?;

        let status = response.status();
        if !status.is_success() {
            return Err(Error::UpstreamFetch {
                status: Some(status.as_u16()),
                message: format!("upstream returned {}", status),
            });
        }

        response.bytes().await.map_err(Error::from_upstream)
    }
}
