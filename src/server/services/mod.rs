pub mod download_services;
pub mod playlist_services;
pub mod relay_services;
pub mod upstream_services;

pub use download_services::{DynDownloadService, DynSegmentFetcher};
pub use playlist_services::DynPlaylistService;
pub use upstream_services::DynUpstreamService;
