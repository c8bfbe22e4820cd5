//! Feed source over an authenticated HTTP API
//!
//! `GET {base_url}/feeds/{feed_id}?limit={n}&cursor={token}` returning
//! `{ "items": [...], "next_cursor": "...", "has_more": true }`.

use reqwest::{Client, StatusCode, Url};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use crate::error::{FeedError, Result};
use crate::protocol::{FeedItem, Page, PageRequest, PageSource};

/// Error body returned by the feed API on 4xx/5xx
#[derive(Debug, Default, Deserialize)]
struct ErrorBody {
    #[serde(default)]
    code: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Clone)]
pub struct HttpPageSource {
    client: Client,
    base_url: Url,
    bearer_token: Option<String>,
}

impl std::fmt::Debug for HttpPageSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpPageSource")
            .field("base_url", &self.base_url.as_str())
            .field("authenticated", &self.bearer_token.is_some())
            .finish()
    }
}

impl HttpPageSource {
    pub fn new(base_url: &str, timeout: Duration) -> Result<Self> {
        let base_url = Url::parse(base_url)
            .map_err(|e| FeedError::Config(format!("invalid feed base url {}: {}", base_url, e)))?;
        if base_url.cannot_be_a_base() {
            return Err(FeedError::Config(format!(
                "feed base url {} cannot carry a path",
                base_url
            )));
        }

        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| FeedError::Config(format!("failed to build HTTP client: {}", e)))?;

        Ok(Self {
            client,
            base_url,
            bearer_token: None,
        })
    }

    /// Attach the session token supplied by the host application
    pub fn with_bearer_token(mut self, token: impl Into<String>) -> Self {
        self.bearer_token = Some(token.into());
        self
    }

    fn page_url(&self, request: &PageRequest) -> Result<Url> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| FeedError::Config("feed base url cannot carry a path".to_string()))?
            .pop_if_empty()
            .push("feeds")
            .push(request.feed.as_str());

        {
            let mut query = url.query_pairs_mut();
            query.append_pair("limit", &request.limit.to_string());
            if let Some(cursor) = &request.cursor {
                query.append_pair("cursor", cursor.as_str());
            }
        }
        Ok(url)
    }
}

/// Map a non-success response to the feed error taxonomy
fn classify_failure(status: StatusCode, body: &str) -> FeedError {
    let parsed: ErrorBody = serde_json::from_str(body).unwrap_or_default();
    let message = parsed
        .message
        .clone()
        .unwrap_or_else(|| format!("HTTP {}", status.as_u16()));

    if status == StatusCode::GONE || parsed.code.as_deref() == Some("invalid_cursor") {
        return FeedError::InvalidCursor(message);
    }

    if status.is_server_error()
        || status == StatusCode::REQUEST_TIMEOUT
        || status == StatusCode::TOO_MANY_REQUESTS
    {
        return FeedError::SourceUnavailable {
            status: Some(status.as_u16()),
            message,
        };
    }

    FeedError::BadRequest(format!("HTTP {}: {}", status.as_u16(), message))
}

#[async_trait::async_trait]
impl<T> PageSource<T> for HttpPageSource
where
    T: FeedItem + DeserializeOwned,
{
    async fn fetch_page(&self, request: &PageRequest) -> Result<Page<T>> {
        let url = self.page_url(request)?;
        debug!(feed = %request.feed, url = %url, "Requesting feed page");

        let mut builder = self.client.get(url);
        if let Some(token) = &self.bearer_token {
            builder = builder.bearer_auth(token);
        }

        let response = builder.send().await?;
        let status = response.status();

        if status.is_success() {
            let page = response.json::<Page<T>>().await?;
            if page.len() > request.limit as usize {
                warn!(feed = %request.feed, items = page.len(), limit = request.limit, "Feed page larger than requested");
                return Err(FeedError::MalformedPage(format!(
                    "page holds {} items, limit was {}",
                    page.len(),
                    request.limit
                )));
            }
            debug!(feed = %request.feed, items = page.len(), has_more = page.has_more(), "Received feed page");
            return Ok(page);
        }

        let body = response.text().await.unwrap_or_default();
        let error = classify_failure(status, &body);
        warn!(feed = %request.feed, status = status.as_u16(), error = %error, "Feed page request failed");
        Err(error)
    }
}
