//! GraphQL upstream client, cost estimation, batch building and rate limiting.

use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use reqwest::header::{HeaderMap, RETRY_AFTER};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info_span, warn, Instrument};

pub mod batch;
pub mod cost;
pub mod limiter;
pub mod parse;

pub use batch::{BatchBuilder, BatchItem, BatchLimits, ItemOutcome, QueryBatch, SubRequest};
pub use cost::{
    Connection, ConnectionWeight, CostError, CostEstimator, CostHints, CostTable, FetchShape,
    QueryShape,
};
pub use limiter::{RateLimitConfig, RateLimiter};
pub use parse::{CatalogPage, DetailRecord};

pub const CRATE_NAME: &str = "wikisync-upstream";

/// Failure taxonomy for one upstream request or one aliased item inside it.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum UpstreamError {
    #[error("rate limited by upstream (retry after {retry_after:?})")]
    RateLimited { retry_after: Option<Duration> },
    #[error("transient upstream failure: {0}")]
    Transient(String),
    #[error("permanent upstream failure: {0}")]
    Permanent(String),
}

impl UpstreamError {
    pub fn is_rate_limited(&self) -> bool {
        matches!(self, UpstreamError::RateLimited { .. })
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, UpstreamError::Transient(_))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphQlRequest {
    pub operation_name: String,
    pub query: String,
    pub variables: Map<String, Value>,
}

#[derive(Debug, Clone, PartialEq, Deserialize, Default)]
pub struct GraphQlResponse {
    #[serde(default)]
    pub data: Option<Value>,
    #[serde(default)]
    pub errors: Vec<GraphQlError>,
}

impl GraphQlResponse {
    /// The first error not attributable to a single alias; it fails the whole request.
    pub fn request_error(&self) -> Option<UpstreamError> {
        self.errors
            .iter()
            .find(|e| e.alias().is_none())
            .map(GraphQlError::classify)
    }

    pub fn alias_error(&self, alias: &str) -> Option<&GraphQlError> {
        self.errors.iter().find(|e| e.alias() == Some(alias))
    }

    /// Value under a top-level alias. Missing data reads as `null`.
    pub fn field(&self, alias: &str) -> &Value {
        self.data
            .as_ref()
            .and_then(|d| d.get(alias))
            .unwrap_or(&Value::Null)
    }
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct GraphQlError {
    pub message: String,
    #[serde(default)]
    pub path: Option<Vec<Value>>,
    #[serde(default)]
    pub extensions: Option<Map<String, Value>>,
}

impl GraphQlError {
    /// The top-level alias this error belongs to, from `path[0]`.
    pub fn alias(&self) -> Option<&str> {
        self.path.as_ref()?.first()?.as_str()
    }

    pub fn code(&self) -> Option<&str> {
        self.extensions.as_ref()?.get("code")?.as_str()
    }

    fn retry_after(&self) -> Option<Duration> {
        let secs = self.extensions.as_ref()?.get("retryAfter")?.as_f64()?;
        (secs.is_finite() && secs >= 0.0).then(|| Duration::from_secs_f64(secs))
    }

    pub fn classify(&self) -> UpstreamError {
        classify_graphql_code(self.code(), self.retry_after(), &self.message)
    }
}

pub fn classify_graphql_code(
    code: Option<&str>,
    retry_after: Option<Duration>,
    message: &str,
) -> UpstreamError {
    match code.map(str::to_ascii_uppercase).as_deref() {
        Some("RATE_LIMITED" | "THROTTLED" | "TOO_MANY_REQUESTS") => {
            UpstreamError::RateLimited { retry_after }
        }
        Some("INTERNAL_SERVER_ERROR" | "SERVICE_UNAVAILABLE" | "TIMEOUT" | "UPSTREAM_TIMEOUT") => {
            UpstreamError::Transient(message.to_string())
        }
        Some(code) => UpstreamError::Permanent(format!("{code}: {message}")),
        None => UpstreamError::Permanent(message.to_string()),
    }
}

pub fn classify_status(status: StatusCode, retry_after: Option<Duration>) -> UpstreamError {
    if status == StatusCode::TOO_MANY_REQUESTS {
        UpstreamError::RateLimited { retry_after }
    } else if status.is_server_error() || status == StatusCode::REQUEST_TIMEOUT {
        UpstreamError::Transient(format!("http status {status}"))
    } else {
        UpstreamError::Permanent(format!("http status {status}"))
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> UpstreamError {
    if err.is_timeout() || err.is_connect() || err.is_request() {
        UpstreamError::Transient(err.to_string())
    } else {
        UpstreamError::Permanent(err.to_string())
    }
}

fn parse_retry_after(headers: &HeaderMap) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?;
    value.trim().parse::<u64>().ok().map(Duration::from_secs)
}

/// Exponential, capped backoff between transient retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }

    pub fn allows_retry(&self, attempts_so_far: usize) -> bool {
        attempts_so_far < self.max_retries
    }
}

/// Anything that can answer a GraphQL POST. The HTTP client in production, scripted fakes in tests.
#[async_trait]
pub trait GraphQlTransport: Send + Sync {
    async fn execute(&self, request: &GraphQlRequest) -> Result<GraphQlResponse, UpstreamError>;
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub endpoint: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

/// Single-attempt GraphQL client over reqwest. Retrying and pacing belong to the caller.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpTransport {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            endpoint: config.endpoint,
        })
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }
}

#[async_trait]
impl GraphQlTransport for HttpTransport {
    async fn execute(&self, request: &GraphQlRequest) -> Result<GraphQlResponse, UpstreamError> {
        let span = info_span!(
            "graphql_request",
            operation = %request.operation_name,
            endpoint = %self.endpoint
        );
        async {
            let resp = self
                .client
                .post(&self.endpoint)
                .json(request)
                .send()
                .await
                .map_err(|err| classify_reqwest_error(&err))?;

            let status = resp.status();
            if !status.is_success() {
                let err = classify_status(status, parse_retry_after(resp.headers()));
                warn!(%status, error = %err, "upstream rejected request");
                return Err(err);
            }

            let body = resp.json::<GraphQlResponse>().await.map_err(|err| {
                if err.is_timeout() {
                    UpstreamError::Transient(err.to_string())
                } else {
                    UpstreamError::Permanent(format!("undecodable graphql response: {err}"))
                }
            })?;
            debug!(errors = body.errors.len(), "graphql response received");
            Ok(body)
        }
        .instrument(span)
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn error(value: Value) -> GraphQlError {
        serde_json::from_value(value).expect("graphql error")
    }

    #[test]
    fn backoff_logic_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(40), Duration::from_millis(350));
        assert!(policy.allows_retry(4));
        assert!(!policy.allows_retry(5));
    }

    #[test]
    fn http_statuses_map_onto_the_taxonomy() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS, Some(Duration::from_secs(3))),
            UpstreamError::RateLimited {
                retry_after: Some(Duration::from_secs(3))
            }
        );
        assert!(classify_status(StatusCode::BAD_GATEWAY, None).is_transient());
        assert!(matches!(
            classify_status(StatusCode::BAD_REQUEST, None),
            UpstreamError::Permanent(_)
        ));
    }

    #[test]
    fn graphql_codes_map_onto_the_taxonomy() {
        let throttled = error(json!({
            "message": "slow down",
            "extensions": {"code": "RATE_LIMITED", "retryAfter": 2}
        }));
        assert_eq!(
            throttled.classify(),
            UpstreamError::RateLimited {
                retry_after: Some(Duration::from_secs(2))
            }
        );

        let internal = error(json!({"message": "boom", "extensions": {"code": "INTERNAL_SERVER_ERROR"}}));
        assert!(internal.classify().is_transient());

        let schema = error(json!({"message": "Cannot query field \"x\"", "extensions": {"code": "GRAPHQL_VALIDATION_FAILED"}}));
        assert!(matches!(schema.classify(), UpstreamError::Permanent(_)));
    }

    #[test]
    fn errors_with_an_alias_path_stay_scoped_to_that_alias() {
        let response: GraphQlResponse = serde_json::from_value(json!({
            "data": {"p0": {"title": "a"}, "p1": null},
            "errors": [{"message": "not permitted", "path": ["p1", "source"]}]
        }))
        .expect("response");

        assert!(response.request_error().is_none());
        assert!(response.alias_error("p1").is_some());
        assert!(response.alias_error("p0").is_none());
        assert!(response.field("p1").is_null());
        assert_eq!(response.field("p0")["title"], "a");
    }

    #[test]
    fn pathless_errors_fail_the_whole_request() {
        let response: GraphQlResponse = serde_json::from_value(json!({
            "data": null,
            "errors": [{"message": "syntax error", "extensions": {"code": "GRAPHQL_PARSE_FAILED"}}]
        }))
        .expect("response");
        assert!(matches!(
            response.request_error(),
            Some(UpstreamError::Permanent(_))
        ));
    }
}
