use std::fmt;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde_json::Value;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::archive::Archive;
use crate::error::FetchError;
use crate::feed::{FeedClient, FeedResponse};
use crate::model::ArchiveRef;
use crate::settings::Settings;

/// Bounds for one fetch pass.
#[derive(Debug, Clone)]
pub struct FetchOptions {
    pub start_url: String,
    pub max_pages: usize,
    pub page_delay: Duration,
    pub request_timeout: Duration,
}

impl FetchOptions {
    pub fn from_settings(settings: &Settings) -> anyhow::Result<Self> {
        let start_url = first_page_url(&settings.feed_url, settings.per_page())
            .with_context(|| format!("Invalid feed URL {:?}", settings.feed_url))?;
        Ok(FetchOptions {
            start_url,
            max_pages: settings.max_pages,
            page_delay: settings.page_delay(),
            request_timeout: settings.request_timeout(),
        })
    }
}

/// Why the fetch loop ended. Only the failure variants imply data was left behind.
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    Exhausted,
    PageLimit,
    EmptyPage,
    RateLimited { reset_at: Option<DateTime<Utc>> },
    Upstream { status: u16 },
    Transient(String),
    Storage(String),
    Cancelled,
}

impl fmt::Display for StopReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StopReason::Exhausted => write!(f, "exhausted"),
            StopReason::PageLimit => write!(f, "page_limit"),
            StopReason::EmptyPage => write!(f, "empty_page"),
            StopReason::RateLimited { reset_at: Some(t) } => {
                write!(f, "rate_limited(reset {})", t.to_rfc3339())
            }
            StopReason::RateLimited { reset_at: None } => write!(f, "rate_limited"),
            StopReason::Upstream { status } => write!(f, "upstream_{}", status),
            StopReason::Transient(msg) => write!(f, "transient({})", msg),
            StopReason::Storage(msg) => write!(f, "storage({})", msg),
            StopReason::Cancelled => write!(f, "cancelled"),
        }
    }
}

pub struct FetchReport {
    pub pages: Vec<ArchiveRef>,
    pub stop: StopReason,
}

enum PageOutcome {
    Stored { page: ArchiveRef, records: usize, next: Option<String> },
    Stop(StopReason),
}

/// Follow the feed's `next` links, archiving each page before asking for the next.
///
/// Never fails: whatever was archived before a problem is returned with the reason.
pub async fn fetch_pages<F: FeedClient>(
    feed: &F,
    archive: &Archive,
    opts: &FetchOptions,
    cancel: &CancellationToken,
) -> FetchReport {
    let mut pages = Vec::new();
    let mut next = Some(opts.start_url.clone());

    let stop = loop {
        let Some(url) = next.take() else {
            break StopReason::Exhausted;
        };
        if pages.len() >= opts.max_pages {
            break StopReason::PageLimit;
        }
        if cancel.is_cancelled() {
            break StopReason::Cancelled;
        }
        if !pages.is_empty() && !opts.page_delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => break StopReason::Cancelled,
                _ = tokio::time::sleep(opts.page_delay) => {}
            }
        }

        info!(page = pages.len() + 1, url = %url, "Fetching feed page");
        match fetch_one(feed, archive, &url, opts.request_timeout).await {
            PageOutcome::Stored { page, records, next: n } => {
                info!(page = pages.len() + 1, key = %page.key, records, "Stored raw page");
                pages.push(page);
                next = n;
            }
            PageOutcome::Stop(reason) => break reason,
        }
    };

    info!(pages = pages.len(), stop = %stop, "Fetch finished");
    FetchReport { pages, stop }
}

async fn fetch_one<F: FeedClient>(
    feed: &F,
    archive: &Archive,
    url: &str,
    timeout: Duration,
) -> PageOutcome {
    let response = match tokio::time::timeout(timeout, feed.get(url)).await {
        Ok(Ok(r)) => r,
        Ok(Err(e)) => return PageOutcome::Stop(stop_for(e)),
        Err(_) => return PageOutcome::Stop(stop_for(FetchError::Timeout(timeout))),
    };

    if let Err(e) = check_status(&response) {
        return PageOutcome::Stop(stop_for(e));
    }

    // Blank body, including 204: end of feed.
    if response.body.trim().is_empty() {
        info!(status = response.status, "Feed returned an empty body");
        return PageOutcome::Stop(StopReason::EmptyPage);
    }

    let records: Vec<Value> = match serde_json::from_str(&response.body) {
        Ok(r) => r,
        Err(source) => {
            return PageOutcome::Stop(stop_for(FetchError::MalformedBody {
                status: response.status,
                source,
            }))
        }
    };
    if records.is_empty() {
        info!("Feed returned an empty page");
        return PageOutcome::Stop(StopReason::EmptyPage);
    }

    match archive.store(Utc::now(), &response.body) {
        Ok(page) => PageOutcome::Stored {
            page,
            records: records.len(),
            next: response.next_url(),
        },
        Err(e) => {
            error!(url = %url, "Failed to archive page: {}", e);
            PageOutcome::Stop(StopReason::Storage(e.to_string()))
        }
    }
}

fn check_status(response: &FeedResponse) -> Result<(), FetchError> {
    if response.is_rate_limited() {
        return Err(FetchError::RateLimited {
            reset_at: response.reset_at(),
        });
    }
    if !response.is_success() {
        return Err(FetchError::Upstream {
            status: response.status,
            body: response.body.clone(),
        });
    }
    Ok(())
}

/// Log a request failure and map it to the loop's stop reason.
fn stop_for(err: FetchError) -> StopReason {
    match err {
        FetchError::RateLimited { reset_at } => {
            warn!(reset_at = ?reset_at, "Feed quota exhausted, ending fetch early");
            StopReason::RateLimited { reset_at }
        }
        FetchError::Upstream { status, body } => {
            error!(status, body = %body, "Feed request failed");
            StopReason::Upstream { status }
        }
        FetchError::MalformedBody { status, source } => {
            error!(status, "Feed returned a non-array body: {}", source);
            StopReason::Upstream { status }
        }
        e @ (FetchError::Transient(_) | FetchError::Timeout(_)) => {
            warn!("Feed request aborted: {}", e);
            StopReason::Transient(e.to_string())
        }
    }
}

/// The feed URL with `per_page` set, replacing any value already present.
fn first_page_url(feed_url: &str, per_page: u32) -> anyhow::Result<String> {
    let mut url = Url::parse(feed_url)?;
    let kept: Vec<(String, String)> = url
        .query_pairs()
        .filter(|(k, _)| *k != "per_page")
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect();
    url.query_pairs_mut()
        .clear()
        .extend_pairs(kept)
        .append_pair("per_page", &per_page.to_string());
    Ok(url.into())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::collections::VecDeque;
    use std::sync::Mutex;

    /// Replays canned responses in order; always-next when the script runs dry.
    pub(crate) struct ScriptedFeed {
        script: Mutex<VecDeque<Result<FeedResponse, FetchError>>>,
        pub requested: Mutex<Vec<String>>,
        endless: bool,
    }

    impl ScriptedFeed {
        pub(crate) fn new(script: Vec<Result<FeedResponse, FetchError>>) -> Self {
            ScriptedFeed {
                script: Mutex::new(script.into()),
                requested: Mutex::new(Vec::new()),
                endless: false,
            }
        }

        pub(crate) fn endless() -> Self {
            ScriptedFeed {
                endless: true,
                ..Self::new(Vec::new())
            }
        }

        pub(crate) fn calls(&self) -> usize {
            self.requested.lock().unwrap().len()
        }
    }

    impl FeedClient for ScriptedFeed {
        async fn get(&self, url: &str) -> Result<FeedResponse, FetchError> {
            let n = {
                let mut requested = self.requested.lock().unwrap();
                requested.push(url.to_string());
                requested.len()
            };
            match self.script.lock().unwrap().pop_front() {
                Some(r) => r,
                None if self.endless => Ok(page(n, &format!("e{}", n), true)),
                None => Err(FetchError::Transient("script exhausted".into())),
            }
        }
    }

    pub(crate) fn event_json(id: &str, kind: &str, repo: &str, created_at: &str) -> String {
        format!(
            r#"{{"id":"{id}","type":"{kind}","actor":{{"id":1,"login":"octo"}},"repo":{{"id":7,"name":"{repo}"}},"public":true,"created_at":"{created_at}","payload":{{}}}}"#
        )
    }

    /// A 200 page holding one PullRequestEvent.
    pub(crate) fn page(n: usize, id: &str, has_next: bool) -> FeedResponse {
        FeedResponse {
            status: 200,
            link: has_next.then(|| {
                format!(r#"<https://feed.test/events?per_page=100&page={}>; rel="next""#, n + 1)
            }),
            body: format!(
                "[{}]",
                event_json(id, "PullRequestEvent", "acme/widgets", "2024-05-01T12:00:00Z")
            ),
            ..Default::default()
        }
    }

    pub(crate) fn rate_limited() -> FeedResponse {
        FeedResponse {
            status: 403,
            rate_remaining: Some(0),
            rate_reset: Some(1_714_567_890),
            body: r#"{"message":"API rate limit exceeded"}"#.into(),
            ..Default::default()
        }
    }

    pub(crate) fn opts(max_pages: usize) -> FetchOptions {
        FetchOptions {
            start_url: first_page_url("https://feed.test/events", 100).unwrap(),
            max_pages,
            page_delay: Duration::ZERO,
            request_timeout: Duration::from_secs(5),
        }
    }

    #[tokio::test]
    async fn stops_at_page_limit() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(dir.path()).unwrap();
        let feed = ScriptedFeed::endless();

        let report = fetch_pages(&feed, &archive, &opts(4), &CancellationToken::new()).await;

        assert_eq!(report.pages.len(), 4);
        assert_eq!(report.stop, StopReason::PageLimit);
        assert_eq!(feed.calls(), 4);
        assert_eq!(archive.list().unwrap().len(), 4);
    }

    #[tokio::test]
    async fn follows_next_links_until_absent() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(dir.path()).unwrap();
        let feed = ScriptedFeed::new(vec![Ok(page(1, "a", true)), Ok(page(2, "b", false))]);

        let report = fetch_pages(&feed, &archive, &opts(10), &CancellationToken::new()).await;

        assert_eq!(report.pages.len(), 2);
        assert_eq!(report.stop, StopReason::Exhausted);
        let requested = feed.requested.lock().unwrap();
        assert_eq!(requested[0], "https://feed.test/events?per_page=100");
        assert_eq!(requested[1], "https://feed.test/events?per_page=100&page=2");
    }

    #[tokio::test]
    async fn rate_limit_on_second_page_keeps_first() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(dir.path()).unwrap();
        let feed = ScriptedFeed::new(vec![Ok(page(1, "a", true)), Ok(rate_limited())]);

        let report = fetch_pages(&feed, &archive, &opts(5), &CancellationToken::new()).await;

        assert_eq!(report.pages.len(), 1);
        assert!(matches!(report.stop, StopReason::RateLimited { reset_at: Some(t) } if t.timestamp() == 1_714_567_890));
        assert_eq!(feed.calls(), 2);
    }

    #[tokio::test]
    async fn empty_page_ends_cleanly() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(dir.path()).unwrap();
        let empty = FeedResponse {
            status: 200,
            link: Some(r#"<https://feed.test/events?page=3>; rel="next""#.into()),
            body: "[]".into(),
            ..Default::default()
        };
        let feed = ScriptedFeed::new(vec![Ok(page(1, "a", true)), Ok(empty)]);

        let report = fetch_pages(&feed, &archive, &opts(5), &CancellationToken::new()).await;

        assert_eq!(report.pages.len(), 1);
        assert_eq!(report.stop, StopReason::EmptyPage);
        assert_eq!(archive.list().unwrap().len(), 1);
    }

    #[tokio::test]
    async fn server_error_and_network_failure_stop_the_loop() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(dir.path()).unwrap();
        let broken = FeedResponse {
            status: 502,
            body: "bad gateway".into(),
            ..Default::default()
        };
        let feed = ScriptedFeed::new(vec![Ok(page(1, "a", true)), Ok(broken)]);
        let report = fetch_pages(&feed, &archive, &opts(5), &CancellationToken::new()).await;
        assert_eq!(report.pages.len(), 1);
        assert_eq!(report.stop, StopReason::Upstream { status: 502 });

        let feed = ScriptedFeed::new(vec![Err(FetchError::Transient("connection reset".into()))]);
        let report = fetch_pages(&feed, &archive, &opts(5), &CancellationToken::new()).await;
        assert!(report.pages.is_empty());
        assert!(matches!(report.stop, StopReason::Transient(_)));
    }

    #[tokio::test]
    async fn non_array_body_is_not_archived() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(dir.path()).unwrap();
        let odd = FeedResponse {
            status: 200,
            body: r#"{"message":"hello"}"#.into(),
            ..Default::default()
        };
        let feed = ScriptedFeed::new(vec![Ok(odd)]);
        let report = fetch_pages(&feed, &archive, &opts(5), &CancellationToken::new()).await;
        assert!(report.pages.is_empty());
        assert_eq!(report.stop, StopReason::Upstream { status: 200 });
        assert_eq!(archive.list().unwrap().len(), 0);

        let garbled = FeedResponse {
            status: 203,
            body: "<html>".into(),
            ..Default::default()
        };
        let feed = ScriptedFeed::new(vec![Ok(garbled)]);
        let report = fetch_pages(&feed, &archive, &opts(5), &CancellationToken::new()).await;
        assert_eq!(report.stop, StopReason::Upstream { status: 203 });
    }

    #[tokio::test]
    async fn blank_body_is_end_of_feed() {
        for (status, body) in [(200, ""), (200, " \n"), (204, "")] {
            let dir = tempfile::tempdir().unwrap();
            let archive = Archive::open(dir.path()).unwrap();
            let blank = FeedResponse {
                status,
                body: body.into(),
                ..Default::default()
            };
            let feed = ScriptedFeed::new(vec![Ok(page(1, "a", true)), Ok(blank)]);

            let report = fetch_pages(&feed, &archive, &opts(5), &CancellationToken::new()).await;

            assert_eq!(report.stop, StopReason::EmptyPage, "status {} body {:?}", status, body);
            assert_eq!(report.pages.len(), 1);
            assert_eq!(archive.list().unwrap().len(), 1);
        }
    }

    /// Deletes the archive directory just before the given call number.
    struct ArchiveVanishes {
        inner: ScriptedFeed,
        dir: std::path::PathBuf,
        on_call: usize,
    }

    impl FeedClient for ArchiveVanishes {
        async fn get(&self, url: &str) -> Result<FeedResponse, FetchError> {
            if self.inner.calls() + 1 == self.on_call {
                std::fs::remove_dir_all(&self.dir).unwrap();
            }
            self.inner.get(url).await
        }
    }

    #[tokio::test]
    async fn archive_failure_stops_with_pages_so_far() {
        let dir = tempfile::tempdir().unwrap();
        let raw = dir.path().join("raw");
        let archive = Archive::open(&raw).unwrap();
        let feed = ArchiveVanishes {
            inner: ScriptedFeed::endless(),
            dir: raw.clone(),
            on_call: 3,
        };

        let report = fetch_pages(&feed, &archive, &opts(10), &CancellationToken::new()).await;

        assert_eq!(report.pages.len(), 2);
        assert!(matches!(report.stop, StopReason::Storage(_)), "got {:?}", report.stop);
        assert_eq!(feed.inner.calls(), 3);
        assert!(!raw.exists());
    }

    struct StalledFeed;

    impl FeedClient for StalledFeed {
        async fn get(&self, _url: &str) -> Result<FeedResponse, FetchError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(FeedResponse::default())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn slow_request_times_out() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(dir.path()).unwrap();
        let report = fetch_pages(&StalledFeed, &archive, &opts(5), &CancellationToken::new()).await;
        assert!(report.pages.is_empty());
        assert!(matches!(report.stop, StopReason::Transient(ref m) if m.contains("timed out")));
    }

    #[tokio::test]
    async fn cancelled_before_start() {
        let dir = tempfile::tempdir().unwrap();
        let archive = Archive::open(dir.path()).unwrap();
        let feed = ScriptedFeed::endless();
        let cancel = CancellationToken::new();
        cancel.cancel();

        let report = fetch_pages(&feed, &archive, &opts(5), &cancel).await;
        assert!(report.pages.is_empty());
        assert_eq!(report.stop, StopReason::Cancelled);
        assert_eq!(feed.calls(), 0);
    }

    #[test]
    fn per_page_replaces_existing_param() {
        let url = first_page_url("https://feed.test/events?per_page=5&x=1", 100).unwrap();
        assert_eq!(url, "https://feed.test/events?x=1&per_page=100");
    }
}
