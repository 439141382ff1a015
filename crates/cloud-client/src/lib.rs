use std::cmp::min;
use std::time::Duration;

use serde_json::{Map, Value};
use thiserror::Error;
use tokio::time::{sleep, timeout};
use tracing::{debug, warn};

mod endpoint;
mod transport;

pub use endpoint::{
    default_endpoints, EndpointVariant, HttpMethod, ParamMode, TokenPlacement, TOKEN_KEY,
};
pub use transport::{ApiRequest, ApiResponse, HttpTransport, Params, Transport, TransportError};

/// Options for talking to the SolaX cloud.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Endpoint variants tried in order for every fetch.
    pub endpoints: Vec<EndpointVariant>,
    /// Per-request timeout in milliseconds.
    pub timeout_ms: u64,
    /// Number of retries per endpoint after the initial attempt.
    pub retry_count: usize,
    /// Delay before the first retry; each further retry waits one more step.
    pub retry_backoff_ms: u64,
    /// Upper bound for the retry delay in milliseconds.
    pub retry_max_backoff_ms: u64,
    /// API failure messages (case-insensitive substrings) that move on to the next endpoint.
    pub retryable_messages: Vec<String>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            endpoints: default_endpoints(),
            timeout_ms: 20_000,
            retry_count: 0,
            retry_backoff_ms: 500,
            retry_max_backoff_ms: 5_000,
            retryable_messages: vec![
                "param invalid".to_string(),
                "parameter".to_string(),
                "format".to_string(),
            ],
        }
    }
}

impl ClientConfig {
    /// Delay before retry number `attempt + 1`: linear steps capped at the maximum.
    pub fn retry_delay_ms(&self, attempt: usize) -> u64 {
        let base = self.retry_backoff_ms.max(1);
        let step = u64::try_from(attempt).unwrap_or(u64::MAX).saturating_add(1);
        let max = self.retry_max_backoff_ms.max(base);
        min(base.saturating_mul(step), max)
    }

    /// Longest a fetch can run when every attempt on every endpoint times out.
    pub fn worst_case_fetch(&self) -> Duration {
        let attempts = u64::try_from(self.retry_count)
            .unwrap_or(u64::MAX)
            .saturating_add(1);
        let backoff_ms = (0..self.retry_count)
            .map(|attempt| self.retry_delay_ms(attempt))
            .fold(0u64, u64::saturating_add);
        let per_endpoint_ms = self
            .timeout_ms
            .saturating_mul(attempts)
            .saturating_add(backoff_ms);
        let endpoints = u64::try_from(self.endpoints.len()).unwrap_or(u64::MAX);
        Duration::from_millis(per_endpoint_ms.saturating_mul(endpoints))
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("request timed out after {timeout_ms}ms")]
    Timeout { timeout_ms: u64 },
    #[error("unexpected http status {status}")]
    Status { status: u16 },
    #[error("malformed response body: {0}")]
    MalformedBody(String),
    #[error("api rejected request parameters: {message}")]
    RetryableApi { message: String },
    #[error("api error: {message}")]
    ApiError { message: String, code: Option<i64> },
    #[error("no endpoint produced a valid response")]
    NoValidResponse,
}

impl FetchError {
    /// Errors that end the fetch without trying further endpoints.
    pub fn is_fatal(&self) -> bool {
        matches!(self, FetchError::ApiError { .. })
    }

    /// Connection-level failures, as opposed to the API answering badly.
    pub fn is_network(&self) -> bool {
        matches!(self, FetchError::Transport(_) | FetchError::Timeout { .. })
    }

    fn is_retryable_in_place(&self) -> bool {
        matches!(
            self,
            FetchError::Transport(_)
                | FetchError::Timeout { .. }
                | FetchError::Status { .. }
                | FetchError::MalformedBody(_)
        )
    }
}

/// Successful cloud payload for one device, before normalization.
#[derive(Debug, Clone, PartialEq)]
pub struct RawTelemetry {
    /// The `result` (or `data`) object.
    pub body: Map<String, Value>,
    /// Remaining top-level keys of the response.
    pub envelope: Map<String, Value>,
    /// Name of the endpoint variant that answered.
    pub endpoint: String,
}

/// Fetches telemetry for single devices over a shared transport.
#[derive(Debug)]
pub struct Fetcher<T> {
    transport: T,
    config: ClientConfig,
}

impl<T: Transport> Fetcher<T> {
    pub fn new(transport: T, config: ClientConfig) -> Self {
        Self { transport, config }
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Tries each endpoint variant in order until one answers successfully.
    pub async fn fetch(&self, token: &str, serial: &str) -> Result<RawTelemetry, FetchError> {
        let mut last_error = None;

        for variant in &self.config.endpoints {
            match self.fetch_variant(variant, token, serial).await {
                Ok(raw) => {
                    debug!(serial, endpoint = %variant.name, "telemetry fetched");
                    return Ok(raw);
                }
                Err(err) if err.is_fatal() => {
                    warn!(serial, endpoint = %variant.name, error = %err, "api refused request");
                    return Err(err);
                }
                Err(err) => {
                    warn!(serial, endpoint = %variant.name, error = %err, "endpoint failed, trying next");
                    last_error = Some(err);
                }
            }
        }

        Err(last_error.unwrap_or(FetchError::NoValidResponse))
    }

    async fn fetch_variant(
        &self,
        variant: &EndpointVariant,
        token: &str,
        serial: &str,
    ) -> Result<RawTelemetry, FetchError> {
        let mut attempts = 0usize;

        loop {
            let request = variant.build_request(token, serial);
            let result = match timeout(
                Duration::from_millis(self.config.timeout_ms),
                self.transport.send(request),
            )
            .await
            {
                Ok(Ok(response)) => classify_response(&response, &self.config.retryable_messages),
                Ok(Err(TransportError::Timeout)) | Err(_) => Err(FetchError::Timeout {
                    timeout_ms: self.config.timeout_ms,
                }),
                Ok(Err(err)) => Err(FetchError::Transport(err)),
            };

            let err = match result {
                Ok(mut raw) => {
                    raw.endpoint = variant.name.clone();
                    return Ok(raw);
                }
                Err(err) => err,
            };

            if !err.is_retryable_in_place() || attempts >= self.config.retry_count {
                return Err(err);
            }

            let delay_ms = self.config.retry_delay_ms(attempts);
            attempts += 1;
            debug!(serial, endpoint = %variant.name, attempt = attempts, delay_ms, error = %err, "retrying request");
            sleep(Duration::from_millis(delay_ms)).await;
        }
    }
}

/// Interprets a cloud response. The body must be a JSON object whose
/// `success` flag is true or absent and which carries `result` or `data`.
pub fn classify_response(
    response: &ApiResponse,
    retryable_messages: &[String],
) -> Result<RawTelemetry, FetchError> {
    if !(200..300).contains(&response.status) {
        return Err(FetchError::Status {
            status: response.status,
        });
    }

    let value: Value = serde_json::from_slice(&response.body)
        .map_err(|err| FetchError::MalformedBody(err.to_string()))?;
    let Value::Object(mut envelope) = value else {
        return Err(FetchError::MalformedBody(
            "response is not a json object".to_string(),
        ));
    };

    if !success_flag(envelope.get("success")) {
        let message = failure_message(&envelope);
        if is_retryable_message(&message, retryable_messages) {
            return Err(FetchError::RetryableApi { message });
        }
        let code = envelope.get("code").and_then(Value::as_i64);
        return Err(FetchError::ApiError { message, code });
    }

    let payload = match envelope.remove("result") {
        Some(payload) => payload,
        None => envelope.remove("data").ok_or_else(|| {
            FetchError::MalformedBody("response carries neither result nor data".to_string())
        })?,
    };
    let body = match payload {
        Value::Object(body) => body,
        Value::Null => Map::new(),
        other => {
            return Err(FetchError::MalformedBody(format!(
                "result is not an object: {other}"
            )))
        }
    };
    envelope.remove("success");

    Ok(RawTelemetry {
        body,
        envelope,
        endpoint: String::new(),
    })
}

fn success_flag(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => true,
        Some(Value::Bool(flag)) => *flag,
        Some(Value::Number(number)) => number.as_f64().map(|v| v != 0.0).unwrap_or(false),
        Some(Value::String(text)) => text.trim().eq_ignore_ascii_case("true"),
        Some(_) => false,
    }
}

fn failure_message(envelope: &Map<String, Value>) -> String {
    ["exception", "message", "msg"]
        .iter()
        .find_map(|key| envelope.get(*key).and_then(Value::as_str))
        .map(str::to_string)
        .unwrap_or_else(|| "unknown api error".to_string())
}

fn is_retryable_message(message: &str, patterns: &[String]) -> bool {
    let message = message.to_lowercase();
    patterns
        .iter()
        .filter(|pattern| !pattern.is_empty())
        .any(|pattern| message.contains(&pattern.to_lowercase()))
}
