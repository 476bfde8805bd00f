use std::sync::LazyLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use regex::Regex;
use reqwest::header::{HeaderMap, HeaderValue, ACCEPT, AUTHORIZATION, LINK, RETRY_AFTER, USER_AGENT};
use tracing::{info, warn};

use crate::error::FetchError;

const USER_AGENT_VALUE: &str = "event-harvester";
const ACCEPT_VALUE: &str = "application/vnd.github+json";

static LINK_PART_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"^\s*<([^>]*)>\s*;(.*)$"#).unwrap());
static REL_NEXT_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r#"(?i)\brel\s*=\s*"?([^";]*)"?"#).unwrap());

/// What the fetcher needs from one upstream response.
#[derive(Debug, Clone, Default)]
pub struct FeedResponse {
    pub status: u16,
    pub link: Option<String>,
    pub rate_remaining: Option<u64>,
    pub rate_reset: Option<i64>,
    pub retry_after: Option<u64>,
    pub body: String,
}

impl FeedResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// 429, or a 403 that carries quota metadata.
    pub fn is_rate_limited(&self) -> bool {
        match self.status {
            429 => true,
            403 => self.rate_remaining == Some(0) || self.retry_after.is_some(),
            _ => false,
        }
    }

    pub fn reset_at(&self) -> Option<DateTime<Utc>> {
        self.rate_reset.and_then(|secs| DateTime::from_timestamp(secs, 0))
    }

    pub fn next_url(&self) -> Option<String> {
        self.link.as_deref().and_then(parse_next_link)
    }
}

/// Transport seam between the fetch loop and the network.
pub trait FeedClient {
    async fn get(&self, url: &str) -> Result<FeedResponse, FetchError>;
}

/// reqwest-backed client for the live feed.
pub struct HttpFeed {
    client: reqwest::Client,
}

impl HttpFeed {
    pub fn new(token: Option<&str>, timeout: Duration) -> anyhow::Result<Self> {
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static(ACCEPT_VALUE));
        headers.insert(USER_AGENT, HeaderValue::from_static(USER_AGENT_VALUE));
        match token {
            Some(t) => {
                let mut value = HeaderValue::from_str(&format!("Bearer {}", t))?;
                value.set_sensitive(true);
                headers.insert(AUTHORIZATION, value);
                info!("Using bearer token for feed requests");
            }
            None => warn!(
                "No feed token configured; upstream rate limits will be much lower. \
                 Set GITHUB_TOKEN or HARVESTER_TOKEN to raise them."
            ),
        }

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(timeout)
            .build()?;
        Ok(HttpFeed { client })
    }
}

impl FeedClient for HttpFeed {
    async fn get(&self, url: &str) -> Result<FeedResponse, FetchError> {
        let response = self.client.get(url).send().await.map_err(transport_error)?;
        let status = response.status().as_u16();
        let headers = response.headers();
        let link = header_str(headers, LINK.as_str()).map(str::to_string);
        let rate_remaining = header_str(headers, "x-ratelimit-remaining").and_then(|v| v.parse().ok());
        let rate_reset = header_str(headers, "x-ratelimit-reset").and_then(|v| v.parse().ok());
        let retry_after = header_str(headers, RETRY_AFTER.as_str()).and_then(|v| v.parse().ok());
        let body = response.text().await.map_err(transport_error)?;

        Ok(FeedResponse {
            status,
            link,
            rate_remaining,
            rate_reset,
            retry_after,
            body,
        })
    }
}

fn header_str<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok()).map(str::trim)
}

fn transport_error(e: reqwest::Error) -> FetchError {
    FetchError::Transient(e.to_string())
}

/// Pull the `rel="next"` target out of a comma-separated Link header.
pub fn parse_next_link(header: &str) -> Option<String> {
    header.split(',').find_map(|part| {
        let caps = LINK_PART_RE.captures(part)?;
        let url = caps.get(1)?.as_str().trim();
        let params = caps.get(2)?.as_str();
        let is_next = REL_NEXT_RE.captures_iter(params).any(|rel| {
            rel.get(1)
                .is_some_and(|r| r.as_str().split_whitespace().any(|t| t.eq_ignore_ascii_case("next")))
        });
        (is_next && !url.is_empty()).then(|| url.to_string())
    })
}
