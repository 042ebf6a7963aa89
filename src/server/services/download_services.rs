use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use bytes::Bytes;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use crate::config::AppConfig;
use crate::server::error::{AppResult, Error};
use crate::server::services::playlist_services::Segment;
use crate::server::services::upstream_services::DynUpstreamService;

pub type DynSegmentFetcher = Arc<dyn SegmentFetcher + Send + Sync>;

/// per-segment byte fetch, split out so tests can inject doubles with
/// scripted failures and delays
#[async_trait::async_trait]
pub trait SegmentFetcher {
    async fn fetch(&self, url: &str) -> AppResult<Bytes>;
}

/// production fetcher, rides the upstream client with the spoofed bundle
pub struct UpstreamSegmentFetcher {
    upstream: DynUpstreamService,
}

impl UpstreamSegmentFetcher {
    pub fn new(upstream: DynUpstreamService) -> Self {
        Self { upstream }
    }
}

#[async_trait::async_trait]
impl SegmentFetcher for UpstreamSegmentFetcher {
    async fn fetch(&self, url: &str) -> AppResult<Bytes> {
        self.upstream.fetch_bytes(url).await
    }
}

#[derive(Clone)]
pub struct DownloadOptions {
    /// simultaneous in-flight segment fetches
    pub concurrency: usize,
    /// attempts per segment before it counts as permanently failed
    pub retry_budget: u32,
    /// sleep between attempts is attempt * backoff_base
    pub backoff_base: Duration,
}

impl DownloadOptions {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            concurrency: config.download_concurrency,
            retry_budget: config.download_retry_budget,
            backoff_base: Duration::from_secs(2),
        }
    }
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            concurrency: 5,
            retry_budget: 3,
            backoff_base: Duration::from_secs(2),
        }
    }
}

/// cancellation flag checked before each dispatch and between retries.
/// A started fetch is left to finish, nothing new is launched after cancel
#[derive(Clone, Default)]
pub struct DownloadHandle {
    cancelled: Arc<AtomicBool>,
}

impl DownloadHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Relaxed);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Relaxed)
    }
}

/// aggregate progress after each terminal segment outcome
#[derive(Clone, Debug)]
pub struct DownloadProgress {
    pub completed: usize,
    pub total: usize,
    pub total_bytes: usize,
    pub bytes_per_second: f64,
    pub eta_seconds: f64,
}

impl DownloadProgress {
    fn compute(completed: usize, total: usize, total_bytes: usize, started: Instant) -> Self {
        let elapsed = started.elapsed().as_secs_f64().max(0.001);
        let bytes_per_second = total_bytes as f64 / elapsed;

        // remaining work estimated from the average completed segment size
        let eta_seconds = if completed > 0 && bytes_per_second > 0.0 {
            let avg = total_bytes as f64 / completed as f64;
            (total - completed) as f64 * avg / bytes_per_second
        } else {
            0.0
        };

        Self {
            completed,
            total,
            total_bytes,
            bytes_per_second,
            eta_seconds,
        }
    }
}

pub struct DownloadOutcome {
    /// successful payloads concatenated in original segment index order
    pub data: Vec<u8>,
    pub segment_count: usize,
    pub total_bytes: usize,
}

pub type DynDownloadService = Arc<dyn DownloadServiceTrait + Send + Sync>;

#[async_trait::async_trait]
pub trait DownloadServiceTrait {
    /// fetch every segment with bounded concurrency and per-segment retries,
    /// then reassemble in index order. Any permanently failed segment fails
    /// the whole session - no partial blobs
    async fn download_all(
        &self,
        segments: Vec<Segment>,
        handle: DownloadHandle,
    ) -> AppResult<DownloadOutcome>;
}

pub struct DownloadService {
    fetcher: DynSegmentFetcher,
    options: DownloadOptions,
}

impl DownloadService {
    pub fn new(fetcher: DynSegmentFetcher, options: DownloadOptions) -> Self {
        Self { fetcher, options }
    }

    /// one segment's lifecycle: Downloading -> Completed, or
    /// Failed-Retrying -> Downloading until the budget runs out
    async fn fetch_with_retries(
        fetcher: DynSegmentFetcher,
        segment: &Segment,
        retry_budget: u32,
        backoff_base: Duration,
        handle: &DownloadHandle,
    ) -> AppResult<Bytes> {
        let mut attempt = 1;
        loop {
            if handle.is_cancelled() {
                return Err(Error::DownloadFailed("download cancelled".to_string()));
            }

            match fetcher.fetch(&segment.absolute_url).await {
                Ok(bytes) => {
                    debug!(
                        "segment {} downloaded ({} bytes, attempt {})",
                        segment.index,
                        bytes.len(),
                        attempt
                    );
                    return Ok(bytes);
                }
                Err(e) if attempt < retry_budget => {
                    warn!(
                        "segment {} attempt {}/{} failed: {}",
                        segment.index, attempt, retry_budget, e
                    );
                    tokio::time::sleep(backoff_base * attempt).await;
                    attempt += 1;
                }
                Err(e) => {
                    error!(
                        "segment {} permanently failed after {} attempts: {}",
                        segment.index, retry_budget, e
                    );
                    return Err(e);
                }
            }
        }
    }
}

#[async_trait::async_trait]
impl DownloadServiceTrait for DownloadService {
    async fn download_all(
        &self,
        segments: Vec<Segment>,
        handle: DownloadHandle,
    ) -> AppResult<DownloadOutcome> {
        if segments.is_empty() {
            return Err(Error::DownloadFailed("playlist has no segments".to_string()));
        }

        let total = segments.len();
        let started = Instant::now();

        info!(
            "downloading {} segments ({} concurrent, {} attempts each)",
            total, self.options.concurrency, self.options.retry_budget
        );

        let semaphore = Arc::new(Semaphore::new(self.options.concurrency));
        let mut join_set = JoinSet::new();

        // spawn a task per segment - all queue immediately, the semaphore
        // gates the actual in-flight fetches
        for segment in segments {
            let fetcher = self.fetcher.clone();
            let sem = semaphore.clone();
            let handle = handle.clone();
            let retry_budget = self.options.retry_budget;
            let backoff_base = self.options.backoff_base;

            join_set.spawn(async move {
                let _permit = sem.acquire().await.expect("semaphore closed");
                let result = Self::fetch_with_retries(
                    fetcher,
                    &segment,
                    retry_budget,
                    backoff_base,
                    &handle,
                )
                .await;
                (segment.index, result)
            });
        }

        // completion order is arbitrary, payloads land keyed by index
        let mut payloads: Vec<Option<Bytes>> = vec![None; total];
        let mut completed = 0usize;
        let mut total_bytes = 0usize;
        let mut first_failure: Option<Error> = None;

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, Ok(bytes))) => {
                    total_bytes += bytes.len();
                    completed += 1;
                    payloads[index] = Some(bytes);

                    let progress =
                        DownloadProgress::compute(completed, total, total_bytes, started);
                    debug!(
                        "progress: {}/{} segments, {} bytes, {:.0} B/s, eta {:.1}s",
                        progress.completed,
                        progress.total,
                        progress.total_bytes,
                        progress.bytes_per_second,
                        progress.eta_seconds
                    );
                }
                Ok((index, Err(e))) => {
                    // sibling fetches are left alone, the session still fails
                    if first_failure.is_none() {
                        first_failure = Some(Error::DownloadFailed(format!(
                            "segment {} failed: {}",
                            index, e
                        )));
                    }
                }
                Err(e) => {
                    error!("segment task panicked: {}", e);
                    if first_failure.is_none() {
                        first_failure =
                            Some(Error::InternalServerErrorWithContext(e.to_string()));
                    }
                }
            }
        }

        if let Some(failure) = first_failure {
            return Err(failure);
        }

        // strict index order, never completion order
        let mut data = Vec::with_capacity(total_bytes);
        for payload in payloads.into_iter().flatten() {
            data.extend_from_slice(&payload);
        }

        info!(
            "download complete: {} segments, {} bytes in {:.1}s",
            total,
            total_bytes,
            started.elapsed().as_secs_f64()
        );

        Ok(DownloadOutcome {
            data,
            segment_count: total,
            total_bytes,
        })
    }
}
