use std::sync::Arc;

use tracing::info;

use crate::config::AppConfig;
use crate::server::services::download_services::{
    DownloadOptions, DownloadService, UpstreamSegmentFetcher,
};
use crate::server::services::playlist_services::PlaylistService;
use crate::server::services::upstream_services::UpstreamService;

use super::{DynDownloadService, DynPlaylistService, DynUpstreamService};

/// relay services - no database, no cache, everything request scoped.
/// One shared outbound client with the spoofed header bundle, the playlist
/// and download services layer on top of it
#[derive(Clone)]
pub struct RelayServices {
    pub upstream: DynUpstreamService,
    pub playlists: DynPlaylistService,
    pub downloads: DynDownloadService,
    pub config: Arc<AppConfig>,
}

impl RelayServices {
    pub fn new(config: Arc<AppConfig>) -> anyhow::Result<Self> {
        info!("starting relay services...");

        let upstream =
            Arc::new(UpstreamService::new(&config)?) as DynUpstreamService;

        info!("upstream client ok, starting remaining services...");

        let playlists =
            Arc::new(PlaylistService::new(upstream.clone())) as DynPlaylistService;

        let fetcher = Arc::new(UpstreamSegmentFetcher::new(upstream.clone()));
        let downloads = Arc::new(DownloadService::new(
            fetcher,
            DownloadOptions::from_config(&config),
        )) as DynDownloadService;

        Ok(Self {
            upstream,
            playlists,
            downloads,
            config,
        })
    }
}
