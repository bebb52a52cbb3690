//! Rate-limited, fingerprinted HTTP client shared by all adapters.
//!
//! Every request goes through the same three steps:
//!
//! 1. wait for a token from the source's bucket ([`RateLimiter::acquire`]),
//! 2. sleep a uniform jitter ([`Jitter::wait`]),
//! 3. send with the source's current device headers and map the status.
//!
//! The client performs no retries. Failures come back as [`ScrapeError`]
//! values and the executor decides what to do with them.
//!
//! | Upstream answer | Result |
//! |-----------------|--------|
//! | 2xx with JSON body | `Ok(ApiResponse)` |
//! | 2xx with non-JSON body | `UpstreamSchemaChanged` |
//! | 401, 403 | `AuthFailed` |
//! | 404, 410 | `UpstreamSchemaChanged` |
//! | 429 | `RateLimited { retry_after }` from `Retry-After` |
//! | 5xx, anything else | `Transport` |
//! | timeout | `Timeout` |

use anyhow::{Context, Result};
use dashmap::DashMap;
use reqwest::header::RETRY_AFTER;
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use crate::config::Config;
use crate::error::ScrapeError;
use crate::fingerprint::DeviceFingerprint;
use crate::limiter::{Jitter, RateLimitProfile, RateLimiter};

pub use crate::config::HttpMethod;

#[derive(Debug, Clone, PartialEq)]
pub enum RequestBody {
    None,
    Json(Value),
    Form(Vec<(String, String)>),
}

/// One upstream call, relative to the source's base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
    pub method: HttpMethod,
    pub path: String,
    pub query: Vec<(String, String)>,
    pub body: RequestBody,
    pub bearer: Option<String>,
    pub jitter: bool,
}

impl ApiRequest {
    pub fn new(method: HttpMethod, path: impl Into<String>) -> Self {
        Self {
            method,
            path: path.into(),
            query: Vec::new(),
            body: RequestBody::None,
            bearer: None,
            jitter: true,
        }
    }

    pub fn get(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Get, path)
    }

    pub fn post(path: impl Into<String>) -> Self {
        Self::new(HttpMethod::Post, path)
    }

    pub fn query(mut self, key: &str, value: impl ToString) -> Self {
        self.query.push((key.to_string(), value.to_string()));
        self
    }

    pub fn json(mut self, body: Value) -> Self {
        self.body = RequestBody::Json(body);
        self
    }

    pub fn form(mut self, fields: &[(&str, &str)]) -> Self {
        self.body = RequestBody::Form(
            fields
                .iter()
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .collect(),
        );
        self
    }

    pub fn bearer(mut self, token: impl Into<String>) -> Self {
        self.bearer = Some(token.into());
        self
    }

    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
    pub status: u16,
    pub body: Value,
}

struct SourceEndpoint {
    base_url: String,
    headers: Vec<(String, String)>,
    fingerprint: RwLock<DeviceFingerprint>,
}

impl SourceEndpoint {
    fn fingerprint(&self) -> Result<DeviceFingerprint, ScrapeError> {
        self.fingerprint
            .read()
            .map(|fp| fp.clone())
            .map_err(|_| ScrapeError::Transport("fingerprint lock poisoned".into()))
    }
}

pub struct RateLimitedClient {
    http: reqwest::Client,
    limiter: RateLimiter,
    jitter: Jitter,
    endpoints: DashMap<String, Arc<SourceEndpoint>>,
}

impl RateLimitedClient {
    pub fn new(default_profile: RateLimitProfile, jitter: Jitter, timeout: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("Failed to build HTTP client")?;
        Ok(Self {
            http,
            limiter: RateLimiter::new(default_profile),
            jitter,
            endpoints: DashMap::new(),
        })
    }

    /// Build a client with every enabled source registered.
    pub fn from_config(config: &Config) -> Result<Self> {
        let client = Self::new(
            config.client.profile(),
            config.client.jitter(),
            config.client.timeout(),
        )?;
        for (name, source) in config.enabled_sources() {
            let app_name = source
                .app_name
                .clone()
                .unwrap_or_else(|| config.client.app_name.clone());
            client.register(
                name,
                &source.base_url,
                DeviceFingerprint::generate(&app_name, &source.app_version),
                &source.headers,
                source.profile(&config.client),
            );
        }
        Ok(client)
    }

    pub fn register(
        &self,
        source: &str,
        base_url: &str,
        fingerprint: DeviceFingerprint,
        headers: &BTreeMap<String, String>,
        profile: RateLimitProfile,
    ) {
        self.limiter.configure(source, profile);
        self.endpoints.insert(
            source.to_string(),
            Arc::new(SourceEndpoint {
                base_url: base_url.trim_end_matches('/').to_string(),
                headers: headers
                    .iter()
                    .map(|(k, v)| (k.clone(), v.clone()))
                    .collect(),
                fingerprint: RwLock::new(fingerprint),
            }),
        );
    }

    fn endpoint(&self, source: &str) -> Result<Arc<SourceEndpoint>, ScrapeError> {
        self.endpoints
            .get(source)
            .map(|e| e.value().clone())
            .ok_or_else(|| ScrapeError::UnknownSource(source.to_string()))
    }

    /// Present a new device for `source`. Called once per job.
    pub fn rotate_fingerprint(&self, source: &str) -> Result<(), ScrapeError> {
        let endpoint = self.endpoint(source)?;
        let mut fp = endpoint
            .fingerprint
            .write()
            .map_err(|_| ScrapeError::Transport("fingerprint lock poisoned".into()))?;
        fp.rotate();
        tracing::debug!(source, device = fp.device().model, "rotated device fingerprint");
        Ok(())
    }

    pub fn fingerprint(&self, source: &str) -> Result<DeviceFingerprint, ScrapeError> {
        self.endpoint(source)?.fingerprint()
    }

    pub async fn send(&self, source: &str, request: ApiRequest) -> Result<ApiResponse, ScrapeError> {
        let endpoint = self.endpoint(source)?;
        self.limiter.acquire(source).await;
        if request.jitter {
            self.jitter.wait().await;
        }

        let url = join_url(&endpoint.base_url, &request.path);
        let mut builder = match request.method {
            HttpMethod::Get => self.http.get(&url),
            HttpMethod::Post => self.http.post(&url),
        };
        for (name, value) in endpoint.fingerprint()?.headers() {
            builder = builder.header(name, value);
        }
        for (name, value) in &endpoint.headers {
            builder = builder.header(name.as_str(), value.as_str());
        }
        if let Some(token) = &request.bearer {
            builder = builder.bearer_auth(token);
        }
        if !request.query.is_empty() {
            builder = builder.query(&request.query);
        }
        builder = match &request.body {
            RequestBody::None => builder,
            RequestBody::Json(body) => builder.json(body),
            RequestBody::Form(fields) => builder.form(fields),
        };

        let response = builder.send().await.map_err(|e| {
            tracing::warn!(source, url = %url, error = %e, "request failed");
            ScrapeError::from(e)
        })?;
        let status = response.status().as_u16();
        let retry_after = response
            .headers()
            .get(RETRY_AFTER)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_retry_after);
        let text = response.text().await?;
        tracing::debug!(source, url = %url, status, "upstream response");
        map_response(status, retry_after, &text, &url)
    }
}

fn join_url(base: &str, path: &str) -> String {
    if path.starts_with("http://") || path.starts_with("https://") {
        return path.to_string();
    }
    format!("{}/{}", base.trim_end_matches('/'), path.trim_start_matches('/'))
}

/// `Retry-After` in delta-seconds form. HTTP-date values are ignored.
fn parse_retry_after(value: &str) -> Option<Duration> {
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

fn map_response(
    status: u16,
    retry_after: Option<Duration>,
    body: &str,
    url: &str,
) -> Result<ApiResponse, ScrapeError> {
    match status {
        200..=299 => {
            let body = if body.trim().is_empty() {
                Value::Null
            } else {
                serde_json::from_str(body).map_err(|e| {
                    ScrapeError::UpstreamSchemaChanged(format!("non-JSON body from {url}: {e}"))
                })?
            };
            Ok(ApiResponse { status, body })
        }
        401 | 403 => Err(ScrapeError::AuthFailed(format!("HTTP {status} from {url}"))),
        404 | 410 => Err(ScrapeError::UpstreamSchemaChanged(format!(
            "HTTP {status} from {url}"
        ))),
        429 => Err(ScrapeError::RateLimited { retry_after }),
        _ => Err(ScrapeError::Transport(format!("HTTP {status} from {url}"))),
    }
}
