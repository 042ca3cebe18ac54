//! Signal fetcher - authenticated, paginated, retrying retrieval of raw
//! signal payloads from the provider, plus a static-file mode for offline
//! operation.
//!
//! Pagination is implemented defensively to support the response shapes
//! the provider has been observed to return:
//! - a bare list (no pagination)
//! - an object with a `next` URL to follow verbatim
//! - an object with `page` / `total_pages` (or `pages`) counters
//! - a fallback heuristic: a "full" page (item count == page size) is
//!   assumed to have a successor. This can both under- and over-fetch on
//!   exact-boundary result sets; it is a known approximation.

use std::path::Path;
use std::time::Instant;

use reqwest::Client;
use serde_json::Value;
use tracing::{debug, warn};

use crate::config::{AuthMode, FetchConfig};
use crate::parser::{extract_items, parse_signals};
use crate::types::{FetchError, FetchMeta, Signal};

/// How the page loop continues after a response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NextPage {
    /// Follow this URL verbatim (not reconstructed from page numbers).
    Url(String),
    /// Request this page number on the configured URL.
    Page(u32),
    Done,
}

pub struct SignalFetcher {
    client: Client,
    config: FetchConfig,
}

impl SignalFetcher {
    pub fn new(config: FetchConfig) -> anyhow::Result<Self> {
        let client = Client::builder().timeout(config.timeout).build()?;
        Ok(Self { client, config })
    }

    /// Fetch every page of signals. A failure on any page, after retries,
    /// aborts the whole fetch; callers must treat that as "no update this
    /// cycle", never as zero signals.
    pub async fn fetch_all(&self) -> Result<(Vec<Signal>, FetchMeta), FetchError> {
        let configured_url = self
            .config
            .signals_url
            .as_deref()
            .ok_or(FetchError::MissingUrl)?;

        let start = Instant::now();
        let mut signals = Vec::new();
        let mut pages_fetched = 0u32;

        let mut url = configured_url.to_string();
        let mut page: Option<u32> = Some(1);

        while pages_fetched < self.config.max_pages {
            pages_fetched += 1;
            let payload = self.get_with_retries(&url, page).await?;

            let page_signals = parse_signals(&payload);
            debug!(
                page = pages_fetched,
                signals = page_signals.len(),
                "fetched signals page"
            );
            signals.extend(page_signals);

            match detect_next(&payload, self.config.page_size, page) {
                NextPage::Url(next_url) => {
                    url = next_url;
                    page = None;
                }
                NextPage::Page(next_page) => page = Some(next_page),
                NextPage::Done => break,
            }
        }

        let meta = FetchMeta {
            source: "api".to_string(),
            pages_fetched,
            signals_count: signals.len(),
            elapsed_seconds: start.elapsed().as_secs_f64(),
            path: None,
        };
        Ok((signals, meta))
    }

    /// Parse a local JSON file with the same tolerant parser as the API path.
    pub async fn load_from_file(&self, path: &Path) -> Result<(Vec<Signal>, FetchMeta), FetchError> {
        let start = Instant::now();
        let display = path.display().to_string();

        let contents = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| FetchError::File {
                path: display.clone(),
                source,
            })?;
        let payload: Value =
            serde_json::from_str(&contents).map_err(|source| FetchError::InvalidJson {
                path: display.clone(),
                source,
            })?;

        let signals = parse_signals(&payload);
        let meta = FetchMeta {
            source: "file".to_string(),
            pages_fetched: 1,
            signals_count: signals.len(),
            elapsed_seconds: start.elapsed().as_secs_f64(),
            path: Some(display),
        };
        Ok((signals, meta))
    }

    /// GET one page, retrying transport and non-2xx failures with
    /// exponential backoff. Every page is retried independently.
    async fn get_with_retries(&self, url: &str, page: Option<u32>) -> Result<Value, FetchError> {
        let attempts = self.config.max_retries.max(1);
        let mut last_error = String::new();

        for attempt in 1..=attempts {
            match self.get_once(url, page).await {
                Ok(payload) => return Ok(payload),
                Err(err) => {
                    last_error = err.to_string();
                    let backoff = self
                        .config
                        .base_backoff
                        .mul_f64(f64::from(1u32 << (attempt - 1).min(16)));
                    warn!(
                        attempt,
                        max_attempts = attempts,
                        backoff_secs = backoff.as_secs_f64(),
                        error = %err,
                        "signal fetch failed, backing off"
                    );
                    if attempt < attempts {
                        tokio::time::sleep(backoff).await;
                    }
                }
            }
        }

        Err(FetchError::RetriesExhausted {
            attempts,
            last_error,
        })
    }

    async fn get_once(&self, url: &str, page: Option<u32>) -> Result<Value, FetchError> {
        let request = self
            .apply_auth(self.client.get(url))
            .header("Accept", "application/json")
            .header("User-Agent", "automation-runner/0.1")
            .query(&self.page_query(page));

        let response = request.send().await.map_err(|source| FetchError::Transport {
            url: url.to_string(),
            source,
        })?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            let snippet: String = body.trim().chars().take(200).collect();
            return Err(FetchError::Status {
                url: url.to_string(),
                status: status.as_u16(),
                snippet,
            });
        }

        response.json().await.map_err(|source| FetchError::Transport {
            url: url.to_string(),
            source,
        })
    }

    pub(crate) fn apply_auth(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let Some(api_key) = self.config.api_key.as_deref().map(str::trim) else {
            return request;
        };
        if api_key.is_empty() {
            return request;
        }

        match self.config.auth_mode {
            AuthMode::Bearer => {
                // Accept either a raw token or a pre-prefixed "Bearer <token>".
                let value = if api_key.to_lowercase().starts_with("bearer ") {
                    api_key.to_string()
                } else {
                    format!("Bearer {api_key}")
                };
                request.header("Authorization", value)
            }
            AuthMode::XApiKey => request.header("X-API-KEY", api_key),
            AuthMode::Header => {
                let name = self.config.auth_header_name.trim();
                let name = if name.is_empty() { "Authorization" } else { name };
                request.header(
                    name.to_string(),
                    format!("{}{}", self.config.auth_header_prefix, api_key),
                )
            }
            // Query mode is handled in page_query().
            AuthMode::Query | AuthMode::None => request,
        }
    }

    pub(crate) fn page_query(&self, page: Option<u32>) -> Vec<(String, String)> {
        let mut params = vec![(
            self.config.page_size_param.clone(),
            self.config.page_size.to_string(),
        )];
        if let Some(page) = page {
            params.push((self.config.page_param.clone(), page.to_string()));
        }
        if self.config.auth_mode == AuthMode::Query {
            if let Some(api_key) = self.config.api_key.as_deref().map(str::trim) {
                if !api_key.is_empty() {
                    params.push((self.config.auth_query_param.clone(), api_key.to_string()));
                }
            }
        }
        params
    }
}

/// Decide whether another page should be requested, and how.
pub fn detect_next(payload: &Value, page_size: usize, current_page: Option<u32>) -> NextPage {
    // A bare list means no pagination.
    let Value::Object(map) = payload else {
        return NextPage::Done;
    };

    // "next" URL style.
    if let Some(next_url) = map.get("next").and_then(Value::as_str) {
        let next_url = next_url.trim();
        if !next_url.is_empty() {
            return NextPage::Url(next_url.to_string());
        }
    }

    // "page / total_pages" counter style.
    let page = integer(map.get("page"));
    let total_pages = integer(map.get("total_pages")).or_else(|| integer(map.get("pages")));
    if let (Some(page), Some(total_pages)) = (page, total_pages) {
        if page > 0 && page < total_pages {
            return NextPage::Page(page + 1);
        }
    }

    // Full-page heuristic: a page holding exactly the configured page size
    // may have a successor (known approximation for non-compliant APIs).
    if let Some(items) = extract_items(payload) {
        if items.len() >= page_size {
            return NextPage::Page(current_page.unwrap_or(1) + 1);
        }
    }

    NextPage::Done
}

fn integer(value: Option<&Value>) -> Option<u32> {
    let value = value?;
    if let Some(n) = value.as_u64() {
        return u32::try_from(n).ok();
    }
    value.as_str()?.trim().parse().ok()
}
