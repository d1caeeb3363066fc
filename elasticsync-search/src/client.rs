//! Elasticsearch REST client.
//!
//! Talks to `HEAD /<index>`, `PUT /<index>`, `PUT /<index>/_alias/<alias>`
//! and `POST /_bulk`. Credentials embedded in the endpoint URL are stripped
//! from it and sent as basic auth.

use crate::bulk::{BulkRequest, BulkResponse};
use crate::error::{SearchError, SearchResult};
use crate::index::SearchIndex;
use async_trait::async_trait;
use reqwest::{Client, RequestBuilder, StatusCode, Url};
use std::time::Duration;
use tracing::{debug, warn};

/// Per-request timeout of clients built with [`ElasticClient::new`]. Claim
/// timeouts must be longer so a slow bulk call cannot outlive its claim.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);
const NDJSON: &str = "application/x-ndjson";

#[derive(Clone)]
struct BasicAuth {
    username: String,
    password: Option<String>,
}

/// Elasticsearch client.
#[derive(Clone)]
pub struct ElasticClient {
    base_url: String,
    client: Client,
    auth: Option<BasicAuth>,
    request_timeout: Option<Duration>,
}

impl std::fmt::Debug for ElasticClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ElasticClient")
            .field("base_url", &self.base_url)
            .field("authenticated", &self.auth.is_some())
            .finish()
    }
}

impl ElasticClient {
    /// Creates a client for the cluster at `url`.
    pub fn new(url: &str) -> SearchResult<Self> {
        let client = Client::builder().timeout(REQUEST_TIMEOUT).build()?;
        let mut this = Self::with_client(url, client)?;
        this.request_timeout = Some(REQUEST_TIMEOUT);
        Ok(this)
    }

    /// Creates a client reusing an existing `reqwest::Client`. Its timeout is
    /// unknown to the engine unless set with [`Self::with_request_timeout`].
    pub fn with_client(url: &str, client: Client) -> SearchResult<Self> {
        let mut parsed = Url::parse(url).map_err(|e| SearchError::InvalidUrl(e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(SearchError::InvalidUrl(format!(
                "unsupported scheme {:?}",
                parsed.scheme()
            )));
        }

        let auth = if parsed.username().is_empty() {
            None
        } else {
            Some(BasicAuth {
                username: parsed.username().to_string(),
                password: parsed.password().map(str::to_string),
            })
        };
        // Setting empty credentials only fails for cannot-be-a-base URLs,
        // which the scheme check has already excluded.
        let _ = parsed.set_username("");
        let _ = parsed.set_password(None);

        Ok(Self {
            base_url: parsed.as_str().trim_end_matches('/').to_string(),
            client,
            auth,
            request_timeout: None,
        })
    }

    /// Records the timeout the underlying `reqwest::Client` was built with.
    pub fn with_request_timeout(mut self, timeout: Duration) -> Self {
        self.request_timeout = Some(timeout);
        self
    }

    /// The endpoint, without credentials.
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url, path.trim_start_matches('/'))
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        match &self.auth {
            Some(auth) => request.basic_auth(&auth.username, auth.password.as_deref()),
            None => request,
        }
    }

    fn provision_error(index: &str, reason: impl Into<String>) -> SearchError {
        SearchError::Provision {
            index: index.to_string(),
            reason: reason.into(),
        }
    }
}

#[async_trait]
impl SearchIndex for ElasticClient {
    fn request_timeout(&self) -> Option<Duration> {
        self.request_timeout
    }

    async fn index_exists(&self, index: &str) -> SearchResult<bool> {
        let response = self
            .authorize(self.client.head(self.url(index)))
            .send()
            .await
            .map_err(|e| Self::provision_error(index, format!("exists check failed: {e}")))?;

        match response.status() {
            StatusCode::OK => Ok(true),
            StatusCode::NOT_FOUND => Ok(false),
            status => Err(Self::provision_error(
                index,
                format!("exists check returned {status}"),
            )),
        }
    }

    async fn create_index(&self, index: &str) -> SearchResult<()> {
        let response = self
            .authorize(self.client.put(self.url(index)))
            .send()
            .await
            .map_err(|e| Self::provision_error(index, format!("create failed: {e}")))?;

        let status = response.status();
        if status.is_success() {
            debug!(index, "created index");
            return Ok(());
        }
        let body = response.text().await.unwrap_or_default();
        if status == StatusCode::BAD_REQUEST && body.contains("resource_already_exists_exception") {
            debug!(index, "index created concurrently");
            return Ok(());
        }
        Err(Self::provision_error(
            index,
            format!("create returned {status}: {body}"),
        ))
    }

    async fn put_alias(&self, index: &str, alias: &str) -> SearchResult<()> {
        let response = self
            .authorize(self.client.put(self.url(&format!("{index}/_alias/{alias}"))))
            .send()
            .await
            .map_err(|e| Self::provision_error(index, format!("alias {alias} failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(Self::provision_error(
                index,
                format!("alias {alias} returned {status}: {body}"),
            ));
        }
        debug!(index, alias, "alias updated");
        Ok(())
    }

    async fn bulk(&self, request: &BulkRequest) -> SearchResult<BulkResponse> {
        let body = request.to_ndjson()?;
        let response = self
            .authorize(self.client.post(self.url("_bulk")))
            .header(reqwest::header::CONTENT_TYPE, NDJSON)
            .body(body)
            .send()
            .await?;

        let status = response.status();
        let text = response.text().await?;
        if !status.is_success() {
            warn!(%status, "bulk request rejected");
            return Err(SearchError::Transport(format!("bulk returned {status}: {text}")));
        }

        let parsed = BulkResponse::parse(&text, request.len())?;
        debug!(
            actions = request.len(),
            failed = parsed.failure_count(),
            took = parsed.took,
            "bulk completed"
        );
        Ok(parsed)
    }
}
