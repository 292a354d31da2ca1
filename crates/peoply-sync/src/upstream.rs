//! Upstream HTTP client for peoply.app: one-shot organization resolution and
//! the repeated incremental event fetch.

use reqwest::header::{ACCEPT, USER_AGENT};
use reqwest::Client;
use scraper::{ElementRef, Html, Selector};
use snafu::{OptionExt, ResultExt, Snafu};
use tokio::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Instant;
use crate::model::RawEventPayload;

const LOG_TARGET: &str = "sync::upstream";

const PEOPLY_BASE_URL: &str = "https://peoply.app";
const PEOPLY_API_BASE_URL: &str = "https://api.peoply.app";

/// Each attempt carries a 10-second total deadline; retries are the
/// scheduler's responsibility via the next tick, never this client's.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

const BROWSER_USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/120.0.0.0 Safari/537.36";
const BOT_USER_AGENT: &str = "peoply-sync-bot/0.1";

/// `NotATag` is the organization page missing the `__NEXT_DATA__` script node
/// entirely; `MetadataNotFound` is the node being present but empty.
#[derive(Debug, Snafu)]
pub enum UpstreamError {
    #[snafu(display("upstream responded with HTTP {status}"))]
    Http { status: u16 },
    #[snafu(display("transport error: {source}"))]
    Transport { source: reqwest::Error },
    #[snafu(display("request cancelled"))]
    Cancelled,
    #[snafu(display("request timed out after the 10-second deadline"))]
    Timeout,
    #[snafu(display("organization metadata script was present but empty"))]
    MetadataNotFound,
    #[snafu(display("organization page had no __NEXT_DATA__ script node"))]
    NotATag,
    #[snafu(display("organization metadata JSON did not match the expected schema: {details}"))]
    Schema { details: String },
    #[snafu(display("event payload JSON error: {source}"))]
    Json { source: serde_json::Error },
}

pub type UpstreamResult<T> = std::result::Result<T, UpstreamError>;

/// The upstream client component. A trait so tests can swap in scripted
/// responses (see [`crate::test_support`]) without touching the network.
#[async_trait::async_trait]
pub trait UpstreamClient: Send + Sync {
    async fn resolve_organization_id(&self, org_name: &str) -> UpstreamResult<String>;
    async fn fetch_events_since(
        &self,
        org_id: &str,
        watermark: Instant,
    ) -> UpstreamResult<Vec<RawEventPayload>>;
}

pub struct HttpUpstreamClient {
    client: Client,
    cancel: CancellationToken,
    org_base_url: String,
    api_base_url: String,
}

impl HttpUpstreamClient {
    pub fn new(cancel: CancellationToken) -> UpstreamResult<Self> {
        Self::with_base_urls(
            cancel,
            PEOPLY_BASE_URL.to_string(),
            PEOPLY_API_BASE_URL.to_string(),
        )
    }

    pub fn with_base_urls(
        cancel: CancellationToken,
        org_base_url: String,
        api_base_url: String,
    ) -> UpstreamResult<Self> {
        let client = Client::builder().build().context(TransportSnafu)?;
        Ok(Self {
            client,
            cancel,
            org_base_url,
            api_base_url,
        })
    }

    /// Races a request against the 10-second deadline and the shared
    /// cancellation token `stop()` trips.
    async fn send_with_timeout(
        &self,
        fut: impl std::future::Future<Output = reqwest::Result<reqwest::Response>>,
    ) -> UpstreamResult<reqwest::Response> {
        tokio::select! {
            () = self.cancel.cancelled() => CancelledSnafu.fail(),
            result = tokio::time::timeout(REQUEST_TIMEOUT, fut) => match result {
                Ok(inner) => inner.context(TransportSnafu),
                Err(_elapsed) => TimeoutSnafu.fail(),
            },
        }
    }

    fn script_text(element: &ElementRef<'_>) -> Option<String> {
        element.text().next().map(str::to_string)
    }

    fn script_text_fallback(element: &ElementRef<'_>) -> String {
        element.text().collect::<Vec<_>>().join("")
    }
}

#[async_trait::async_trait]
impl UpstreamClient for HttpUpstreamClient {
    /// Made exactly once per process lifetime, at startup; failure is fatal
    /// to the engine.
    async fn resolve_organization_id(&self, org_name: &str) -> UpstreamResult<String> {
        let url = format!("{}/orgs/{org_name}", self.org_base_url);
        info!(target: LOG_TARGET, %url, "resolving organization id");

        let response = self
            .send_with_timeout(
                self.client
                    .get(&url)
                    .header(USER_AGENT, BROWSER_USER_AGENT)
                    .send(),
            )
            .await?;

        if response.status().as_u16() >= 400 {
            return HttpSnafu {
                status: response.status().as_u16(),
            }
            .fail();
        }

        let html = response.text().await.context(TransportSnafu)?;
        let document = Html::parse_document(&html);
        let selector = Selector::parse(r#"script#__NEXT_DATA__[type="application/json"]"#)
            .expect("selector literal is valid CSS");

        let script = document.select(&selector).next().context(NotATagSnafu)?;

        let primary = Self::script_text(&script).filter(|text| !text.trim().is_empty());
        let value: serde_json::Value = match primary {
            Some(text) => match serde_json::from_str(&text) {
                Ok(value) => value,
                Err(_first_error) => {
                    // Sometimes the contents include stray whitespace; retry
                    // over the concatenated text nodes instead of failing
                    // outright.
                    let fallback = Self::script_text_fallback(&script);
                    serde_json::from_str(fallback.trim()).context(JsonSnafu)?
                }
            },
            None => return MetadataNotFoundSnafu.fail(),
        };

        let org_id = value
            .get("props")
            .and_then(|v| v.get("pageProps"))
            .and_then(|v| v.get("organization"))
            .and_then(|v| v.get("id"))
            .and_then(|v| v.as_str())
            .map(str::to_string)
            .context(SchemaSnafu {
                details: "props.pageProps.organization.id missing".to_string(),
            })?;

        info!(target: LOG_TARGET, organization = %org_name, %org_id, "resolved organization id");
        Ok(org_id)
    }

    async fn fetch_events_since(
        &self,
        org_id: &str,
        watermark: Instant,
    ) -> UpstreamResult<Vec<RawEventPayload>> {
        let url = format!(
            "{}/events?afterDate={}&organizationId={org_id}",
            self.api_base_url,
            watermark.format(),
        );
        debug!(target: LOG_TARGET, %url, "fetching events since watermark");

        let response = self
            .send_with_timeout(
                self.client
                    .get(&url)
                    .header(ACCEPT, "application/json")
                    .header(USER_AGENT, BOT_USER_AGENT)
                    .send(),
            )
            .await?;

        if response.status().as_u16() >= 400 {
            return HttpSnafu {
                status: response.status().as_u16(),
            }
            .fail();
        }

        let value: serde_json::Value = response.json().await.context(JsonSnafu)?;
        // No pagination assumed: upstream is observed to return the full
        // delta above the watermark, as either an array or a bare object.
        let items = match value {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        };

        let mut payloads = Vec::with_capacity(items.len());
        for item in items {
            match serde_json::from_value::<RawEventPayload>(item) {
                Ok(payload) => payloads.push(payload),
                Err(error) => {
                    warn!(target: LOG_TARGET, %error, "skipping unparseable event payload");
                }
            }
        }

        debug!(target: LOG_TARGET, count = payloads.len(), "fetched events");
        Ok(payloads)
    }
}

/// A scripted [`UpstreamClient`] for tests. Not `#[cfg(test)]` for the same
/// reason as [`crate::clock::fake`]: integration tests in `tests/` need it
/// from outside the crate.
#[doc(hidden)]
pub mod fake {
    use std::collections::VecDeque;
    use std::sync::Mutex;

    use super::*;

    pub enum ScriptedFetch {
        Ok(Vec<RawEventPayload>),
        Err(UpstreamError),
    }

    /// Returns a fixed organization id and a scripted sequence of
    /// `fetch_events_since` responses, one per call; once the script is
    /// exhausted further calls return an empty list.
    pub struct FakeUpstreamClient {
        org_id: String,
        fetches: Mutex<VecDeque<ScriptedFetch>>,
    }

    impl FakeUpstreamClient {
        pub fn new(org_id: impl Into<String>) -> Self {
            Self {
                org_id: org_id.into(),
                fetches: Mutex::new(VecDeque::new()),
            }
        }

        pub fn push_fetch_ok(&self, payloads: Vec<RawEventPayload>) {
            self.fetches
                .lock()
                .expect("lock poisoned")
                .push_back(ScriptedFetch::Ok(payloads));
        }

        pub fn push_fetch_err(&self, error: UpstreamError) {
            self.fetches
                .lock()
                .expect("lock poisoned")
                .push_back(ScriptedFetch::Err(error));
        }
    }

    #[async_trait::async_trait]
    impl UpstreamClient for FakeUpstreamClient {
        async fn resolve_organization_id(&self, _org_name: &str) -> UpstreamResult<String> {
            Ok(self.org_id.clone())
        }

        async fn fetch_events_since(
            &self,
            _org_id: &str,
            _watermark: Instant,
        ) -> UpstreamResult<Vec<RawEventPayload>> {
            let scripted = self.fetches.lock().expect("lock poisoned").pop_front();
            match scripted {
                Some(ScriptedFetch::Ok(payloads)) => Ok(payloads),
                Some(ScriptedFetch::Err(error)) => Err(error),
                None => Ok(Vec::new()),
            }
        }
    }
}
