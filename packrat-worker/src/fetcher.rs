//! One-shot GET fetcher over reqwest.
//!
//! Follows redirects, applies split connect/read timeouts, and captures
//! headers, cookies, body text, status code and the final post-redirect URL.
//! No Content-Type filtering and no truncation here; both belong to the
//! processing service.

use std::collections::BTreeMap;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::redirect::Policy;

use packrat::{FetchError, FetchResult, UrlFetcher};

const REDIRECT_LIMIT: usize = 10;

/// Reqwest-backed [`UrlFetcher`].
pub struct ReqwestFetcher {
    client: reqwest::Client,
}

impl ReqwestFetcher {
    pub fn new(
        connect_timeout: Duration,
        read_timeout: Duration,
        user_agent: &str,
    ) -> Result<Self, reqwest::Error> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(connect_timeout)
            .read_timeout(read_timeout)
            .redirect(Policy::limited(REDIRECT_LIMIT));
        if !user_agent.is_empty() {
            builder = builder.user_agent(user_agent.to_owned());
        }
        Ok(Self { client: builder.build()? })
    }

    fn classify(err: reqwest::Error, url: &str) -> FetchError {
        if err.is_timeout() {
            FetchError::Timeout(format!("timeout while fetching {url}"))
        } else if err.is_builder() {
            FetchError::InvalidUrl(err.to_string())
        } else {
            FetchError::Request(format!("http fetch failed for {url}: {err}"))
        }
    }
}

#[async_trait]
impl UrlFetcher for ReqwestFetcher {
    async fn fetch(&self, url: &str) -> Result<FetchResult, FetchError> {
        let response =
            self.client.get(url).send().await.map_err(|err| Self::classify(err, url))?;

        let status = response.status();
        if status.is_client_error() || status.is_server_error() {
            return Err(FetchError::Request(format!(
                "http status {} for {url}",
                status.as_u16()
            )));
        }

        let final_url = response.url().to_string();
        let headers: BTreeMap<String, String> = response
            .headers()
            .iter()
            .map(|(name, value)| {
                (name.as_str().to_owned(), String::from_utf8_lossy(value.as_bytes()).into_owned())
            })
            .collect();
        let cookies: BTreeMap<String, String> = response
            .cookies()
            .map(|cookie| (cookie.name().to_owned(), cookie.value().to_owned()))
            .collect();

        let page_source =
            response.text().await.map_err(|err| Self::classify(err, url))?;

        Ok(FetchResult {
            headers,
            cookies,
            page_source,
            status_code: status.as_u16(),
            final_url,
            additional_details: None,
        })
    }

    async fn close(&self) {
        // reqwest clients release their pool on drop; nothing to flush.
    }
}
