// downloader pool properties: concurrency ceiling, retry budget, ordering
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use bytes::Bytes;

use relay::server::error::{AppResult, Error};
use relay::server::services::download_services::{
    DownloadHandle, DownloadOptions, DownloadService, DownloadServiceTrait, SegmentFetcher,
};
use relay::server::services::playlist_services::Segment;

fn make_segments(count: usize) -> Vec<Segment> {
    (0..count)
        .map(|index| Segment {
            index,
            absolute_url: format!("https://cdn.example.com/video/seg{}.ts", index),
            duration_seconds: 10.0,
            encryption_key_tag: None,
        })
        .collect()
}

fn fast_options(concurrency: usize, retry_budget: u32) -> DownloadOptions {
    DownloadOptions {
        concurrency,
        retry_budget,
        backoff_base: Duration::from_millis(5),
    }
}

fn upstream_error() -> Error {
    Error::UpstreamFetch {
        status: Some(500),
        message: "simulated upstream failure".to_string(),
    }
}

fn payload_for(url: &str) -> Bytes {
    // payload carries the segment number so assembly order is checkable
    let index: u8 = url
        .rsplit("seg")
        .next()
        .and_then(|s| s.trim_end_matches(".ts").parse().ok())
        .unwrap_or(255);
    Bytes::from(vec![index; 4])
}

/// succeeds immediately but records how many fetches were in flight at once
struct ConcurrencyTrackingFetcher {
    current: AtomicUsize,
    max_seen: AtomicUsize,
}

#[async_trait::async_trait]
impl SegmentFetcher for ConcurrencyTrackingFetcher {
    async fn fetch(&self, url: &str) -> AppResult<Bytes> {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_seen.fetch_max(now, Ordering::SeqCst);

        // hold the slot long enough for the pool to saturate
        tokio::time::sleep(Duration::from_millis(20)).await;

        self.current.fetch_sub(1, Ordering::SeqCst);
        Ok(payload_for(url))
    }
}

/// completes later segments first so assembly order differs from completion order
struct ReversedDelayFetcher {
    total: usize,
}

#[async_trait::async_trait]
impl SegmentFetcher for ReversedDelayFetcher {
    async fn fetch(&self, url: &str) -> AppResult<Bytes> {
        let payload = payload_for(url);
        let index = payload[0] as usize;
        let delay = (self.total - index) as u64 * 10;
        tokio::time::sleep(Duration::from_millis(delay)).await;
        Ok(payload)
    }
}

/// fails a fixed number of times per url before succeeding, counting attempts
struct FlakyFetcher {
    failures_before_success: u32,
    attempts: Mutex<HashMap<String, u32>>,
}

impl FlakyFetcher {
    fn new(failures_before_success: u32) -> Self {
        Self {
            failures_before_success,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    fn attempts_for(&self, url: &str) -> u32 {
        *self.attempts.lock().unwrap().get(url).unwrap_or(&0)
    }
}

#[async_trait::async_trait]
impl SegmentFetcher for FlakyFetcher {
    async fn fetch(&self, url: &str) -> AppResult<Bytes> {
        let attempt = {
            let mut attempts = self.attempts.lock().unwrap();
            let entry = attempts.entry(url.to_string()).or_insert(0);
            *entry += 1;
            *entry
        };

        if attempt <= self.failures_before_success {
            return Err(upstream_error());
        }

        Ok(payload_for(url))
    }
}

#[tokio::test]
async fn test_in_flight_fetches_never_exceed_limit() {
    let fetcher = Arc::new(ConcurrencyTrackingFetcher {
        current: AtomicUsize::new(0),
        max_seen: AtomicUsize::new(0),
    });
    let service = DownloadService::new(fetcher.clone(), fast_options(3, 1));

    let outcome = service
        .download_all(make_segments(12), DownloadHandle::new())
        .await
        .expect("download should succeed");

    assert_eq!(outcome.segment_count, 12);
    assert!(
        fetcher.max_seen.load(Ordering::SeqCst) <= 3,
        "saw {} concurrent fetches",
        fetcher.max_seen.load(Ordering::SeqCst)
    );
}

#[tokio::test]
async fn test_assembly_is_in_index_order_not_completion_order() {
    let total = 6;
    let fetcher = Arc::new(ReversedDelayFetcher { total });
    let service = DownloadService::new(fetcher, fast_options(total, 1));

    let outcome = service
        .download_all(make_segments(total), DownloadHandle::new())
        .await
        .expect("download should succeed");

    // each payload is 4 bytes of its segment number, so the combined blob
    // must read 0,0,0,0,1,1,1,1,... despite reversed completion
    let expected: Vec<u8> = (0..total as u8).flat_map(|i| vec![i; 4]).collect();
    assert_eq!(outcome.data, expected);
    assert_eq!(outcome.total_bytes, total * 4);
}

#[tokio::test]
async fn test_segment_recovers_within_retry_budget() {
    // fails twice, succeeds on the third and final attempt
    let fetcher = Arc::new(FlakyFetcher::new(2));
    let service = DownloadService::new(fetcher.clone(), fast_options(2, 3));

    let outcome = service
        .download_all(make_segments(1), DownloadHandle::new())
        .await
        .expect("third attempt should succeed");

    // counted exactly once with the correct byte size, not three times
    assert_eq!(outcome.total_bytes, 4);
    assert_eq!(outcome.data, vec![0u8; 4]);
    assert_eq!(
        fetcher.attempts_for("https://cdn.example.com/video/seg0.ts"),
        3
    );
}

#[tokio::test]
async fn test_exhausted_retry_budget_fails_the_session() {
    let fetcher = Arc::new(FlakyFetcher::new(3));
    let service = DownloadService::new(fetcher.clone(), fast_options(2, 3));

    let result = service
        .download_all(make_segments(2), DownloadHandle::new())
        .await;

    assert!(matches!(result, Err(Error::DownloadFailed(_))));

    // the budget is respected, no further attempts after exhaustion
    assert_eq!(
        fetcher.attempts_for("https://cdn.example.com/video/seg0.ts"),
        3
    );
    assert_eq!(
        fetcher.attempts_for("https://cdn.example.com/video/seg1.ts"),
        3
    );
}

#[tokio::test]
async fn test_empty_playlist_is_rejected() {
    let fetcher = Arc::new(FlakyFetcher::new(0));
    let service = DownloadService::new(fetcher, fast_options(2, 1));

    let result = service.download_all(Vec::new(), DownloadHandle::new()).await;
    assert!(matches!(result, Err(Error::DownloadFailed(_))));
}

#[tokio::test]
async fn test_cancelled_session_stops_dispatching() {
    let fetcher = Arc::new(FlakyFetcher::new(0));
    let service = DownloadService::new(fetcher.clone(), fast_options(1, 3));

    let handle = DownloadHandle::new();
    handle.cancel();

    let result = service.download_all(make_segments(4), handle).await;
    assert!(matches!(result, Err(Error::DownloadFailed(_))));

    // nothing was fetched after the cancel
    assert_eq!(
        fetcher.attempts_for("https://cdn.example.com/video/seg0.ts"),
        0
    );
}
