//! Document fetching.

use std::time::Duration;

use async_trait::async_trait;
use citeflow_shared::{CiteflowError, Result, SamplerConfig};
use reqwest::header::LOCATION;
use reqwest::{Client, StatusCode};
use tracing::debug;
use url::Url;

/// Result class of one fetch attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    Ok,
    BlockedByRobots,
    RateLimited,
    HttpError(u16),
    /// A 3xx pointing at another document. Not followed by the fetcher; the
    /// target has to pass the same checks as any other URL.
    Redirect(Url),
    TransportError(String),
    TooShort,
}

/// Content plus outcome. `content` is only set for [`FetchOutcome::Ok`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchResponse {
    pub outcome: FetchOutcome,
    pub content: Option<String>,
}

impl FetchResponse {
    pub fn ok(content: impl Into<String>) -> Self {
        Self {
            outcome: FetchOutcome::Ok,
            content: Some(content.into()),
        }
    }

    pub fn failed(outcome: FetchOutcome) -> Self {
        Self {
            outcome,
            content: None,
        }
    }
}

/// Fetches documents and robots.txt files.
#[async_trait]
pub trait DocumentFetcher: Send + Sync {
    async fn fetch(&self, url: &Url, timeout: Duration) -> FetchResponse;

    /// The robots.txt body for `origin`, or `None` if there is none
    /// (missing, error status, or unreachable). `None` allows everything.
    async fn fetch_robots(&self, origin: &Url, timeout: Duration) -> Option<String>;
}

/// reqwest-backed fetcher.
pub struct HttpFetcher {
    client: Client,
    min_content_length: usize,
}

impl HttpFetcher {
    pub fn new(config: &SamplerConfig) -> Result<Self> {
        let client = Client::builder()
            .user_agent(config.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::none())
            .timeout(config.request_timeout)
            .build()
            .map_err(|e| CiteflowError::Network(format!("failed to build HTTP client: {e}")))?;

        Ok(Self {
            client,
            min_content_length: config.min_content_length,
        })
    }
}

#[async_trait]
impl DocumentFetcher for HttpFetcher {
    async fn fetch(&self, url: &Url, timeout: Duration) -> FetchResponse {
        debug!(%url, "fetching document");

        let response = match self.client.get(url.as_str()).timeout(timeout).send().await {
            Ok(r) => r,
            Err(e) => return FetchResponse::failed(FetchOutcome::TransportError(e.to_string())),
        };

        let status = response.status();
        if status == StatusCode::TOO_MANY_REQUESTS {
            return FetchResponse::failed(FetchOutcome::RateLimited);
        }
        if status.is_redirection() {
            let target = response
                .headers()
                .get(LOCATION)
                .and_then(|v| v.to_str().ok())
                .and_then(|location| url.join(location).ok());
            return match target {
                Some(target) => FetchResponse::failed(FetchOutcome::Redirect(target)),
                None => FetchResponse::failed(FetchOutcome::HttpError(status.as_u16())),
            };
        }
        if !status.is_success() {
            return FetchResponse::failed(FetchOutcome::HttpError(status.as_u16()));
        }

        let body = match response.text().await {
            Ok(b) => b,
            Err(e) => {
                return FetchResponse::failed(FetchOutcome::TransportError(format!(
                    "body read failed: {e}"
                )));
            }
        };

        if body.trim().len() < self.min_content_length {
            return FetchResponse::failed(FetchOutcome::TooShort);
        }
        FetchResponse::ok(body)
    }

    async fn fetch_robots(&self, origin: &Url, timeout: Duration) -> Option<String> {
        let robots_url = origin.join("/robots.txt").ok()?;
        match self.client.get(robots_url.as_str()).timeout(timeout).send().await {
            Ok(response) if response.status().is_success() => response.text().await.ok(),
            Ok(_) => None,
            Err(e) => {
                debug!(url = %robots_url, error = %e, "robots.txt unreachable");
                None
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn fetcher(min_len: usize) -> HttpFetcher {
        let config = SamplerConfig {
            min_content_length: min_len,
            ..SamplerConfig::default()
        };
        HttpFetcher::new(&config).unwrap()
    }

    async fn serve(server: &MockServer, at: &str, response: ResponseTemplate) {
        Mock::given(method("GET"))
            .and(path(at))
            .respond_with(response)
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn maps_statuses_to_outcomes() {
        let server = MockServer::start().await;
        serve(&server, "/ok", ResponseTemplate::new(200).set_body_string("x".repeat(64))).await;
        serve(&server, "/short", ResponseTemplate::new(200).set_body_string("tiny")).await;
        serve(&server, "/busy", ResponseTemplate::new(429)).await;
        serve(&server, "/gone", ResponseTemplate::new(404)).await;
        serve(&server, "/boom", ResponseTemplate::new(503)).await;

        let f = fetcher(32);
        let base = Url::parse(&server.uri()).unwrap();
        let timeout = Duration::from_secs(5);

        let ok = f.fetch(&base.join("/ok").unwrap(), timeout).await;
        assert_eq!(ok.outcome, FetchOutcome::Ok);
        assert_eq!(ok.content.map(|c| c.len()), Some(64));

        let short = f.fetch(&base.join("/short").unwrap(), timeout).await;
        assert_eq!(short.outcome, FetchOutcome::TooShort);
        assert!(short.content.is_none());

        let busy = f.fetch(&base.join("/busy").unwrap(), timeout).await;
        assert_eq!(busy.outcome, FetchOutcome::RateLimited);

        let gone = f.fetch(&base.join("/gone").unwrap(), timeout).await;
        assert_eq!(gone.outcome, FetchOutcome::HttpError(404));

        let boom = f.fetch(&base.join("/boom").unwrap(), timeout).await;
        assert_eq!(boom.outcome, FetchOutcome::HttpError(503));
    }

    #[tokio::test]
    async fn slow_response_is_transport_error() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/slow",
            ResponseTemplate::new(200)
                .set_body_string("x".repeat(64))
                .set_delay(Duration::from_secs(2)),
        )
        .await;

        let base = Url::parse(&server.uri()).unwrap();
        let response = fetcher(1)
            .fetch(&base.join("/slow").unwrap(), Duration::from_millis(100))
            .await;
        assert!(matches!(response.outcome, FetchOutcome::TransportError(_)));
    }

    #[tokio::test]
    async fn robots_body_or_none() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/robots.txt",
            ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /\n"),
        )
        .await;

        let origin = Url::parse(&server.uri()).unwrap();
        let body = fetcher(1).fetch_robots(&origin, Duration::from_secs(5)).await;
        assert!(body.unwrap().contains("Disallow: /"));

        let empty = MockServer::start().await;
        let origin = Url::parse(&empty.uri()).unwrap();
        assert!(fetcher(1).fetch_robots(&origin, Duration::from_secs(5)).await.is_none());
    }

    #[tokio::test]
    async fn redirect_is_reported_not_followed() {
        let server = MockServer::start().await;
        serve(
            &server,
            "/moved",
            ResponseTemplate::new(302).insert_header("Location", "/landing"),
        )
        .await;
        serve(&server, "/bare", ResponseTemplate::new(301)).await;
        Mock::given(method("GET"))
            .and(path("/landing"))
            .respond_with(ResponseTemplate::new(200).set_body_string("x".repeat(64)))
            .expect(0)
            .mount(&server)
            .await;

        let base = Url::parse(&server.uri()).unwrap();
        let moved = fetcher(1)
            .fetch(&base.join("/moved").unwrap(), Duration::from_secs(5))
            .await;
        assert_eq!(
            moved.outcome,
            FetchOutcome::Redirect(base.join("/landing").unwrap())
        );
        assert!(moved.content.is_none());

        let bare = fetcher(1)
            .fetch(&base.join("/bare").unwrap(), Duration::from_secs(5))
            .await;
        assert_eq!(bare.outcome, FetchOutcome::HttpError(301));
    }

    #[tokio::test]
    async fn unreachable_host_is_transport_error() {
        let url = Url::parse("http://127.0.0.1:9/").unwrap();
        let response = fetcher(1).fetch(&url, Duration::from_millis(500)).await;
        assert!(matches!(response.outcome, FetchOutcome::TransportError(_)));
    }
}
