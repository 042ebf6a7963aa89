use std::sync::Arc;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::Serialize;
use tracing::{debug, error, info};
use url::Url;

use crate::server::error::AppResult;
use crate::server::services::upstream_services::DynUpstreamService;

/// every rewritten URI points back here, the proxy endpoint sniffs whether the
/// target is another playlist or raw media
pub const PROXY_PREFIX: &str = "/proxy?url=";

pub const HLS_CONTENT_TYPE: &str = "application/vnd.apple.mpegurl";

static BANDWIDTH_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"BANDWIDTH=(\d+)").unwrap());
static RESOLUTION_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"RESOLUTION=(\d+)x(\d+)").unwrap());
static CODECS_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r#"CODECS="([^"]+)""#).unwrap());
static FRAME_RATE_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"FRAME-RATE=([\d.]+)").unwrap());
static EXTINF_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"EXTINF:([\d.]+)").unwrap());

/// one quality option from a master playlist. Attributes are permissive,
/// missing bandwidth is 0 and missing resolution stays 0x0 rather than
/// failing the parse
#[derive(Serialize, Clone, Debug)]
pub struct VariantStream {
    pub bandwidth: u64,
    pub resolution_width: u32,
    pub resolution_height: u32,
    pub codecs: Option<String>,
    pub frame_rate: Option<f64>,
    pub name: String,
    pub url: String,
}

/// one media segment from a media playlist, index matches playlist order
#[derive(Clone, Debug)]
pub struct Segment {
    pub index: usize,
    pub absolute_url: String,
    pub duration_seconds: f64,
    pub encryption_key_tag: Option<String>,
}

/// resolve a playlist line to an absolute url. Already-absolute lines are
/// used as-is, everything else joins against the playlist's own url
pub fn resolve_line(line: &str, base: &Url) -> Option<String> {
    if line.starts_with("http://") || line.starts_with("https://") {
        return Some(line.to_string());
    }

    match base.join(line) {
        Ok(resolved) => Some(resolved.to_string()),
        Err(e) => {
            error!("failed to resolve playlist line: {} - {}", line, e);
            None
        }
    }
}

pub fn proxy_url_for(absolute: &str) -> String {
    format!("{}{}", PROXY_PREFIX, urlencoding::encode(absolute))
}

/// inverse of proxy_url_for, used by the round-trip tests
pub fn decode_proxy_url(proxy_line: &str) -> Option<String> {
    proxy_line
        .strip_prefix(PROXY_PREFIX)
        .and_then(|enc| urlencoding::decode(enc).ok())
        .map(|s| s.to_string())
}

/// rewrite every media/variant URI of a playlist into same-origin proxy form.
///
/// tag, comment and blank lines pass through byte-identical - HLS is order
/// sensitive and STREAM-INF/EXTINF/KEY tags must stay adjacent to their URI
/// line. Absolute URIs are wrapped too, a raw origin url reaching the client
/// would bypass the relay and trip the origin's referer check. Lines already
/// in proxy form pass through so a rewritten playlist can't be double-wrapped
pub fn rewrite_playlist(raw: &str, base: &Url) -> String {
    let lines: Vec<String> = raw
        .lines()
        .map(|line| {
            let trimmed = line.trim();

            if trimmed.is_empty() || trimmed.starts_with('#') {
                return line.to_string();
            }

            if trimmed.starts_with(PROXY_PREFIX) {
                return line.to_string();
            }

            match resolve_line(trimmed, base) {
                Some(absolute) => proxy_url_for(&absolute),
                // unresolvable URI lines pass through, the parse stays permissive
                None => line.to_string(),
            }
        })
        .collect();

    lines.join("\n")
}

/// scan a master playlist for STREAM-INF variants, in playlist order.
/// The URI is the next non-tag non-blank line after each STREAM-INF tag
pub fn parse_variants(text: &str, base: &Url) -> Vec<VariantStream> {
    let lines: Vec<&str> = text.lines().collect();
    let mut variants = Vec::new();

    let mut i = 0;
    while i < lines.len() {
        let line = lines[i].trim();

        if line.starts_with("#EXT-X-STREAM-INF") {
            let bandwidth = BANDWIDTH_RE
                .captures(line)
                .and_then(|c| c[1].parse().ok())
                .unwrap_or(0);

            let (width, height) = RESOLUTION_RE
                .captures(line)
                .map(|c| {
                    (
                        c[1].parse().unwrap_or(0),
                        c[2].parse().unwrap_or(0),
                    )
                })
                .unwrap_or((0, 0));

            let codecs = CODECS_RE.captures(line).map(|c| c[1].to_string());
            let frame_rate = FRAME_RATE_RE.captures(line).and_then(|c| c[1].parse().ok());

            // the URI is the next line that is neither a tag nor blank
            let mut j = i + 1;
            while j < lines.len()
                && (lines[j].trim().starts_with('#') || lines[j].trim().is_empty())
            {
                j += 1;
            }

            if j < lines.len() {
                if let Some(url) = resolve_line(lines[j].trim(), base) {
                    let name = if height > 0 {
                        format!("{}p", height)
                    } else {
                        "auto".to_string()
                    };

                    variants.push(VariantStream {
                        bandwidth,
                        resolution_width: width,
                        resolution_height: height,
                        codecs,
                        frame_rate,
                        name,
                        url,
                    });
                }
                i = j;
            }
        }

        i += 1;
    }

    variants
}

/// display ordering: tallest resolution first, bandwidth breaks ties
pub fn sorted_for_display(mut variants: Vec<VariantStream>) -> Vec<VariantStream> {
    variants.sort_by(|a, b| {
        b.resolution_height
            .cmp(&a.resolution_height)
            .then(b.bandwidth.cmp(&a.bandwidth))
    });
    variants
}

/// strict maximum bandwidth, first-seen wins ties so selection is
/// deterministic across runs
pub fn best_variant(variants: &[VariantStream]) -> Option<&VariantStream> {
    let mut best: Option<&VariantStream> = None;
    for variant in variants {
        match best {
            Some(current) if variant.bandwidth <= current.bandwidth => {}
            _ => best = Some(variant),
        }
    }
    best
}

/// build segments in playlist order. An EXTINF duration and any pending
/// EXT-X-KEY tag attach to the next URI line, then the accumulator resets
pub fn parse_segments(text: &str, base: &Url) -> Vec<Segment> {
    let mut segments = Vec::new();
    let mut pending_duration = 0.0;
    let mut pending_key: Option<String> = None;

    for line in text.lines() {
        let line = line.trim();

        if line.starts_with("#EXTINF") {
            pending_duration = EXTINF_RE
                .captures(line)
                .and_then(|c| c[1].parse().ok())
                .unwrap_or(0.0);
        } else if line.starts_with("#EXT-X-KEY") {
            pending_key = Some(line.to_string());
        } else if line.starts_with('#') || line.is_empty() {
            // other tags don't touch the accumulator
        } else if let Some(absolute_url) = resolve_line(line, base) {
            segments.push(Segment {
                index: segments.len(),
                absolute_url,
                duration_seconds: pending_duration,
                encryption_key_tag: pending_key.take(),
            });
            pending_duration = 0.0;
        }
    }

    segments
}

/// playlist detection for the sniffing proxy endpoint
pub fn looks_like_playlist(content_type: &str, body: &str, url: &Url) -> bool {
    content_type.contains("mpegurl")
        || content_type.contains("m3u8")
        || body.starts_with("#EXTM3U")
        || url.path().ends_with(".m3u8")
}

pub enum RewriteOutcome {
    /// rewritten playlist text, ready to send as application/vnd.apple.mpegurl
    Playlist(String),
    /// the target wasn't a playlist, relay it as a byte stream instead
    NotPlaylist,
}

pub type DynPlaylistService = Arc<dyn PlaylistServiceTrait + Send + Sync>;

#[async_trait::async_trait]
pub trait PlaylistServiceTrait {
    /// fetch a playlist and rewrite it for the client. When `wants_best` is
    /// set and the target is a master playlist, the maximum-bandwidth variant
    /// is fetched and rewritten instead so the client never sees the master
    async fn rewrite_for_client(&self, url: &Url, wants_best: bool) -> AppResult<RewriteOutcome>;

    /// quality variants of a master playlist in display order. A media
    /// playlist simply has none
    async fn variants_for(&self, url: &Url) -> AppResult<Vec<VariantStream>>;

    /// media segments behind a url, auto-selecting the best variant when the
    /// target turns out to be a master playlist
    async fn segments_for_best(&self, url: &Url) -> AppResult<Vec<Segment>>;
}

pub struct PlaylistService {
    upstream: DynUpstreamService,
}

impl PlaylistService {
    pub fn new(upstream: DynUpstreamService) -> Self {
        Self { upstream }
    }

    /// fetch the best variant's media playlist, falling back to the given
    /// text when there are no STREAM-INF tags (already a media playlist)
    async fn resolve_media_playlist(
        &self,
        text: String,
        base: &Url,
    ) -> AppResult<(String, Url)> {
        let variants = parse_variants(&text, base);

        let Some(best) = best_variant(&variants) else {
            return Ok((text, base.clone()));
        };

        info!(
            "selected variant: {} ({} bps) for {}",
            best.name, best.bandwidth, base
        );

        let media = self.upstream.fetch_text(&best.url).await?;
        let media_base = Url::parse(&best.url).map_err(|e| {
            crate::server::error::Error::InternalServerErrorWithContext(format!(
                "variant url unparseable: {}",
                e
            ))
        })?;

        Ok((media.body, media_base))
    }
}

#[async_trait::async_trait]
impl PlaylistServiceTrait for PlaylistService {
    async fn rewrite_for_client(&self, url: &Url, wants_best: bool) -> AppResult<RewriteOutcome> {
        let fetched = self.upstream.fetch_text(url.as_str()).await?;

        if !looks_like_playlist(&fetched.content_type, &fetched.body, url) {
            debug!("not a playlist ({}), relaying bytes: {}", fetched.content_type, url);
            return Ok(RewriteOutcome::NotPlaylist);
        }

        let (text, base) = if wants_best {
            self.resolve_media_playlist(fetched.body, url).await?
        } else {
            (fetched.body, url.clone())
        };

        Ok(RewriteOutcome::Playlist(rewrite_playlist(&text, &base)))
    }

    async fn variants_for(&self, url: &Url) -> AppResult<Vec<VariantStream>> {
        let fetched = self.upstream.fetch_text(url.as_str()).await?;
        Ok(sorted_for_display(parse_variants(&fetched.body, url)))
    }

    async fn segments_for_best(&self, url: &Url) -> AppResult<Vec<Segment>> {
        let fetched = self.upstream.fetch_text(url.as_str()).await?;
        let (text, base) = self.resolve_media_playlist(fetched.body, url).await?;
        Ok(parse_segments(&text, &base))
    }
}
