//! Transport collaborators: the remote store behind each side of a sync.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use csync_core::{Fields, Kind, Side};
use reqwest::{Method, StatusCode};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tokio::sync::Mutex;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "csync-transport";

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("request to {endpoint} failed: {source}")]
    Request {
        endpoint: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} from {endpoint}: {body}")]
    HttpStatus {
        endpoint: String,
        status: u16,
        body: String,
    },
    #[error("invalid response from {endpoint}: {message}")]
    InvalidResponse { endpoint: String, message: String },
    #[error("{endpoint} rejected {target}")]
    Rejected { endpoint: String, target: String },
}

impl TransportError {
    pub fn endpoint(&self) -> &str {
        match self {
            TransportError::Request { endpoint, .. }
            | TransportError::HttpStatus { endpoint, .. }
            | TransportError::InvalidResponse { endpoint, .. }
            | TransportError::Rejected { endpoint, .. } => endpoint,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::HttpStatus { status, .. } => Some(*status),
            TransportError::Request { source, .. } => source.status().map(|s| s.as_u16()),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct TransportResponse {
    /// Id assigned or echoed by the remote store.
    pub id: Option<String>,
    pub body: JsonValue,
}

/// One remote collection. Raises on failure and never retries on the caller's behalf
/// beyond its own backoff policy.
#[async_trait]
pub trait Transport: Send + Sync {
    fn endpoint(&self) -> &str;

    async fn create_item(&self, core_data: &Fields) -> Result<TransportResponse, TransportError>;

    async fn upload_changes(
        &self,
        pkey: &str,
        changes: &Fields,
    ) -> Result<TransportResponse, TransportError>;

    async fn delete_item(&self, pkey: &str) -> Result<TransportResponse, TransportError>;
}

/// Hands out the transport for a side and kind, if that side is writable.
pub trait TransportFactory: Send + Sync {
    fn transport(&self, side: Side, kind: Kind) -> Option<Arc<dyn Transport>>;
}

#[derive(Clone, Default)]
pub struct TransportMap {
    routes: BTreeMap<(Side, Kind), Arc<dyn Transport>>,
}

impl TransportMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, side: Side, kind: Kind, transport: Arc<dyn Transport>) -> Self {
        self.insert(side, kind, transport);
        self
    }

    pub fn insert(&mut self, side: Side, kind: Kind, transport: Arc<dyn Transport>) {
        self.routes.insert((side, kind), transport);
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl fmt::Debug for TransportMap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_map()
            .entries(
                self.routes
                    .iter()
                    .map(|((side, kind), t)| (format!("{side}/{kind}"), t.endpoint().to_string())),
            )
            .finish()
    }
}

impl TransportFactory for TransportMap {
    fn transport(&self, side: Side, kind: Kind) -> Option<Arc<dyn Transport>> {
        self.routes.get(&(side, kind)).cloned()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

/// A POST that reached the server may already have created the item, so it
/// is only repeated when the server cannot have acted on it: a throttling
/// reply or a connection that never opened.
fn is_idempotent(method: &Method) -> bool {
    *method != Method::POST && *method != Method::PATCH
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RestConfig {
    pub base_url: String,
    pub api_key: Option<String>,
    pub http: HttpClientConfig,
}

pub fn resource_path(kind: Kind) -> &'static str {
    match kind {
        Kind::Image => "media",
        Kind::Category => "products/categories",
        Kind::Product => "products",
        Kind::Variation => "products/variations",
    }
}

fn build_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);
    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }
    builder.build().context("building reqwest client")
}

/// Slave-side REST transports for every kind, sharing one client.
pub fn rest_transports(config: &RestConfig) -> anyhow::Result<TransportMap> {
    let client = build_client(&config.http)?;
    let mut map = TransportMap::new();
    for kind in Kind::PHASE_ORDER {
        let transport = RestTransport::with_client(
            client.clone(),
            &config.base_url,
            resource_path(kind),
            config.api_key.clone(),
            config.http.backoff,
        );
        map.insert(Side::Slave, kind, Arc::new(transport));
    }
    Ok(map)
}

/// JSON-over-HTTP collection: POST to create, PUT to update, DELETE to remove.
#[derive(Debug, Clone)]
pub struct RestTransport {
    client: reqwest::Client,
    endpoint: String,
    api_key: Option<String>,
    backoff: BackoffPolicy,
}

impl RestTransport {
    pub fn new(
        config: &HttpClientConfig,
        base_url: &str,
        resource: &str,
        api_key: Option<String>,
    ) -> anyhow::Result<Self> {
        let client = build_client(config)?;
        Ok(Self::with_client(client, base_url, resource, api_key, config.backoff))
    }

    pub fn with_client(
        client: reqwest::Client,
        base_url: &str,
        resource: &str,
        api_key: Option<String>,
        backoff: BackoffPolicy,
    ) -> Self {
        Self {
            client,
            endpoint: format!(
                "{}/{}",
                base_url.trim_end_matches('/'),
                resource.trim_matches('/')
            ),
            api_key,
            backoff,
        }
    }

    async fn send(
        &self,
        method: Method,
        url: String,
        body: Option<JsonValue>,
    ) -> Result<TransportResponse, TransportError> {
        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let mut request = self.client.request(method.clone(), &url);
            if let Some(key) = &self.api_key {
                request = request.bearer_auth(key);
            }
            if let Some(body) = &body {
                request = request.json(body);
            }

            match request.send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if status.is_success() {
                        let bytes = resp.bytes().await.map_err(|source| TransportError::Request {
                            endpoint: self.endpoint.clone(),
                            source,
                        })?;
                        return self.parse_response(&bytes);
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && (is_idempotent(&method) || status == StatusCode::TOO_MANY_REQUESTS)
                        && attempt < self.backoff.max_retries
                    {
                        debug!(status = status.as_u16(), attempt, "retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    let body = resp.text().await.unwrap_or_default();
                    return Err(TransportError::HttpStatus {
                        endpoint: self.endpoint.clone(),
                        status: status.as_u16(),
                        body,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && (is_idempotent(&method) || err.is_connect())
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(TransportError::Request {
                        endpoint: self.endpoint.clone(),
                        source: err,
                    });
                }
            }
        }

        match last_request_error {
            Some(source) => Err(TransportError::Request {
                endpoint: self.endpoint.clone(),
                source,
            }),
            None => Err(TransportError::InvalidResponse {
                endpoint: self.endpoint.clone(),
                message: "retry budget exhausted".into(),
            }),
        }
    }

    fn parse_response(&self, bytes: &[u8]) -> Result<TransportResponse, TransportError> {
        if bytes.iter().all(u8::is_ascii_whitespace) {
            return Ok(TransportResponse {
                id: None,
                body: JsonValue::Null,
            });
        }
        let body: JsonValue =
            serde_json::from_slice(bytes).map_err(|err| TransportError::InvalidResponse {
                endpoint: self.endpoint.clone(),
                message: err.to_string(),
            })?;
        Ok(TransportResponse {
            id: response_id(&body),
            body,
        })
    }
}

fn response_id(body: &JsonValue) -> Option<String> {
    match body.get("id")? {
        JsonValue::String(s) if !s.trim().is_empty() => Some(s.clone()),
        JsonValue::Number(n) => Some(n.to_string()),
        _ => None,
    }
}

fn payload(fields: &Fields) -> JsonValue {
    serde_json::to_value(fields).unwrap_or(JsonValue::Null)
}

#[async_trait]
impl Transport for RestTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn create_item(&self, core_data: &Fields) -> Result<TransportResponse, TransportError> {
        let span = info_span!("transport_create", endpoint = %self.endpoint);
        self.send(Method::POST, self.endpoint.clone(), Some(payload(core_data)))
            .instrument(span)
            .await
    }

    async fn upload_changes(
        &self,
        pkey: &str,
        changes: &Fields,
    ) -> Result<TransportResponse, TransportError> {
        let span = info_span!("transport_upload", endpoint = %self.endpoint, pkey);
        let url = format!("{}/{}", self.endpoint, pkey);
        self.send(Method::PUT, url, Some(payload(changes)))
            .instrument(span)
            .await
    }

    async fn delete_item(&self, pkey: &str) -> Result<TransportResponse, TransportError> {
        let span = info_span!("transport_delete", endpoint = %self.endpoint, pkey);
        let url = format!("{}/{}?force=true", self.endpoint, pkey);
        self.send(Method::DELETE, url, None).instrument(span).await
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    Create,
    Upload,
    Delete,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RecordedCall {
    pub operation: Operation,
    pub pkey: Option<String>,
    pub payload: Fields,
    pub assigned_id: Option<String>,
}

#[derive(Debug)]
struct RecordingState {
    next_id: u64,
    calls: Vec<RecordedCall>,
    failing: BTreeSet<String>,
}

/// In-memory transport that records every call and assigns sequential ids.
#[derive(Debug)]
pub struct RecordingTransport {
    endpoint: String,
    state: Mutex<RecordingState>,
}

impl RecordingTransport {
    pub fn new(endpoint: impl Into<String>, first_id: u64) -> Self {
        Self {
            endpoint: endpoint.into(),
            state: Mutex::new(RecordingState {
                next_id: first_id,
                calls: Vec::new(),
                failing: BTreeSet::new(),
            }),
        }
    }

    /// Reject any call whose pkey or payload value equals `token`.
    pub fn failing_on(mut self, token: impl Into<String>) -> Self {
        self.state.get_mut().failing.insert(token.into());
        self
    }

    pub async fn calls(&self) -> Vec<RecordedCall> {
        self.state.lock().await.calls.clone()
    }

    async fn record(
        &self,
        operation: Operation,
        pkey: Option<&str>,
        payload: &Fields,
    ) -> Result<TransportResponse, TransportError> {
        let mut state = self.state.lock().await;
        let rejected = state.failing.iter().find(|token| {
            pkey == Some(token.as_str()) || payload.values().any(|v| v.render() == **token)
        });
        if let Some(token) = rejected {
            return Err(TransportError::Rejected {
                endpoint: self.endpoint.clone(),
                target: token.clone(),
            });
        }

        let assigned_id = match operation {
            Operation::Create => {
                let id = state.next_id.to_string();
                state.next_id += 1;
                Some(id)
            }
            Operation::Upload | Operation::Delete => pkey.map(ToString::to_string),
        };
        state.calls.push(RecordedCall {
            operation,
            pkey: pkey.map(ToString::to_string),
            payload: payload.clone(),
            assigned_id: assigned_id.clone(),
        });
        let body = match &assigned_id {
            Some(id) => serde_json::json!({ "id": id }),
            None => JsonValue::Null,
        };
        Ok(TransportResponse {
            id: assigned_id,
            body,
        })
    }
}

#[async_trait]
impl Transport for RecordingTransport {
    fn endpoint(&self) -> &str {
        &self.endpoint
    }

    async fn create_item(&self, core_data: &Fields) -> Result<TransportResponse, TransportError> {
        self.record(Operation::Create, None, core_data).await
    }

    async fn upload_changes(
        &self,
        pkey: &str,
        changes: &Fields,
    ) -> Result<TransportResponse, TransportError> {
        self.record(Operation::Upload, Some(pkey), changes).await
    }

    async fn delete_item(&self, pkey: &str) -> Result<TransportResponse, TransportError> {
        self.record(Operation::Delete, Some(pkey), &Fields::new()).await
    }
}
