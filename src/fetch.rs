//! HTTP retrieval with manual redirect following so both the first and the
//! final header blocks stay observable.

use crate::error::Result;
use crate::types::{BasicAuth, Endpoint, FetchFailure, FetchOutcome};
use async_trait::async_trait;
use reqwest::header::LOCATION;
use reqwest::Client;
use std::time::Duration;
use url::Url;

const MAX_REDIRECTS: usize = 5;

#[async_trait]
pub trait Fetcher: Send + Sync {
    fn name(&self) -> &'static str;

    async fn fetch(
        &self,
        endpoint: Endpoint,
        url: &str,
        auth: Option<&BasicAuth>,
    ) -> std::result::Result<FetchOutcome, FetchFailure>;
}

pub struct HttpFetcher {
    client: Client,
}

impl HttpFetcher {
    pub fn new(timeout_secs: u64) -> Result<Self> {
        // redirects are followed by hand, one hop per request
        let client = Client::builder()
            .redirect(reqwest::redirect::Policy::none())
            .gzip(true)
            .brotli(true)
            .deflate(true)
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self { client })
    }
}

fn classify(e: reqwest::Error) -> FetchFailure {
    if e.is_timeout() || e.is_connect() {
        FetchFailure::retryable(e.to_string())
    } else {
        FetchFailure::terminal(e.to_string())
    }
}

fn header_block(version: reqwest::Version, status: reqwest::StatusCode, resp: &reqwest::Response) -> String {
    let mut block = format!("{:?} {}", version, status);
    for (name, value) in resp.headers() {
        block.push_str("\r\n");
        block.push_str(name.as_str());
        block.push_str(": ");
        block.push_str(value.to_str().unwrap_or(""));
    }
    block
}

#[async_trait]
impl Fetcher for HttpFetcher {
    fn name(&self) -> &'static str {
        "reqwest"
    }

    async fn fetch(
        &self,
        endpoint: Endpoint,
        url: &str,
        auth: Option<&BasicAuth>,
    ) -> std::result::Result<FetchOutcome, FetchFailure> {
        let mut current = url.to_string();
        let mut blocks: Vec<String> = Vec::new();

        for hop in 0..=MAX_REDIRECTS {
            let parsed = Url::parse(&current)
                .map_err(|e| FetchFailure::terminal(format!("invalid url {current}: {e}")))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                return Err(FetchFailure::terminal(format!(
                    "unsupported scheme '{}' for {current}",
                    parsed.scheme()
                )));
            }

            let mut request = self.client.get(parsed.clone());
            if let Some(a) = auth {
                request = request.basic_auth(&a.username, Some(&a.password));
            }
            let resp = request.send().await.map_err(classify)?;

            let version = resp.version();
            let status = resp.status();
            blocks.push(header_block(version, status, &resp));

            if status.is_redirection() && hop < MAX_REDIRECTS {
                if let Some(location) =
                    resp.headers().get(LOCATION).and_then(|v| v.to_str().ok())
                {
                    current = parsed
                        .join(location)
                        .map_err(|e| {
                            FetchFailure::terminal(format!("bad redirect '{location}': {e}"))
                        })?
                        .to_string();
                    continue;
                }
            }

            let status_line = format!("{:?} {}", version, status);
            let body = resp.text().await.map_err(classify)?;
            let first_headers = blocks.first().cloned().unwrap_or_default();
            let last_headers = blocks.last().cloned().unwrap_or_default();
            return Ok(FetchOutcome {
                endpoint,
                url: current,
                status_line,
                first_headers,
                last_headers,
                body,
                http_code: status.as_u16(),
            });
        }

        // ≤5 hops each re-entered the redirect arm; treat as terminal
        Err(FetchFailure::terminal(format!("too many redirects for {url}")))
    }
}
