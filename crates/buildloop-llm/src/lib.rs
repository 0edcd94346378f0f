use anyhow::anyhow;
use buildloop_core::{
    BuildError, DEEPSEEK_ENDPOINT, LlmConfig, Message, OPENAI_ENDPOINT, Result, Role,
};
use chrono::{DateTime, NaiveDateTime, Utc};
use reqwest::StatusCode;
use reqwest::blocking::Client;
use reqwest::header::RETRY_AFTER;
use serde_json::{Value, json};
use std::thread;
use std::time::Duration;

/// Floor for computed backoff delays.
const MIN_RETRY_DELAY_MS: u64 = 100;

/// Distinguishes a generation call from a verification call; the two may be
/// routed to different models.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Purpose {
    Generate,
    Verify,
}

/// Why a single backend call failed. Transient failures are retried by the
/// gateway; fatal ones surface immediately.
#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("{detail}")]
    Transient {
        detail: String,
        retry_after_seconds: Option<u64>,
    },
    #[error("{0}")]
    Fatal(String),
}

/// One implementation per provider, selected once at configuration time.
pub trait ModelBackend {
    fn call(
        &self,
        messages: &[Message],
        model: &str,
        purpose: Purpose,
    ) -> std::result::Result<String, BackendError>;
}

/// Pick the configured provider backend.
pub fn select_backend(cfg: &LlmConfig) -> Result<Box<dyn ModelBackend>> {
    match cfg.provider.as_str() {
        "deepseek" => Ok(Box::new(HttpBackend::deepseek(cfg)?)),
        "openai" => Ok(Box::new(HttpBackend::openai(cfg)?)),
        other => Err(anyhow!(
            "unknown llm provider `{other}` (expected `deepseek` or `openai`)"
        )),
    }
}

/// OpenAI-compatible chat-completions backend over blocking HTTP.
pub struct HttpBackend {
    provider: &'static str,
    endpoint: String,
    api_key: String,
    key_env: String,
    client: Client,
}

impl HttpBackend {
    pub fn deepseek(cfg: &LlmConfig) -> Result<Self> {
        Self::new("deepseek", cfg, DEEPSEEK_ENDPOINT, "DEEPSEEK_API_KEY")
    }

    pub fn openai(cfg: &LlmConfig) -> Result<Self> {
        Self::new("openai", cfg, OPENAI_ENDPOINT, "OPENAI_API_KEY")
    }

    fn new(
        provider: &'static str,
        cfg: &LlmConfig,
        default_endpoint: &str,
        default_key_env: &str,
    ) -> Result<Self> {
        let endpoint = if cfg.endpoint.is_empty() {
            default_endpoint.to_string()
        } else {
            cfg.endpoint.clone()
        };
        let key_env = if cfg.api_key_env.is_empty() {
            default_key_env.to_string()
        } else {
            cfg.api_key_env.clone()
        };
        let api_key = match &cfg.api_key {
            Some(key) if !key.is_empty() => key.clone(),
            _ => std::env::var(&key_env).map_err(|_| {
                anyhow!("missing API key: set {key_env} or llm.api_key in settings")
            })?,
        };
        let client = Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_seconds))
            .build()?;
        Ok(Self {
            provider,
            endpoint,
            api_key,
            key_env,
            client,
        })
    }
}

impl ModelBackend for HttpBackend {
    fn call(
        &self,
        messages: &[Message],
        model: &str,
        _purpose: Purpose,
    ) -> std::result::Result<String, BackendError> {
        let payload = build_payload(messages, model);
        let response = self
            .client
            .post(&self.endpoint)
            .bearer_auth(&self.api_key)
            .json(&payload)
            .send();

        match response {
            Ok(resp) => {
                let status = resp.status();
                let retry_after = parse_retry_after_seconds(resp.headers().get(RETRY_AFTER));
                let body = resp.text().map_err(|e| BackendError::Transient {
                    detail: format!("failed reading response body: {e}"),
                    retry_after_seconds: None,
                })?;
                if status.is_success() {
                    return parse_completion_payload(&body);
                }
                let detail = format_api_error(self.provider, &self.key_env, status, &body);
                if should_retry_status(status) {
                    Err(BackendError::Transient {
                        detail,
                        retry_after_seconds: retry_after,
                    })
                } else {
                    Err(BackendError::Fatal(detail))
                }
            }
            Err(e) => {
                let detail = format_transport_error(&e);
                if should_retry_transport_error(&e) {
                    Err(BackendError::Transient {
                        detail,
                        retry_after_seconds: None,
                    })
                } else {
                    Err(BackendError::Fatal(detail))
                }
            }
        }
    }
}

fn build_payload(messages: &[Message], model: &str) -> Value {
    let wire: Vec<Value> = messages
        .iter()
        .map(|m| json!({"role": m.role.as_str(), "content": m.content}))
        .collect();
    json!({"model": model, "messages": wire})
}

fn parse_completion_payload(body: &str) -> std::result::Result<String, BackendError> {
    let value: Value = serde_json::from_str(body)
        .map_err(|e| BackendError::Fatal(format!("unparseable completion payload: {e}")))?;
    let content = value
        .get("choices")
        .and_then(|v| v.as_array())
        .and_then(|arr| arr.first())
        .and_then(|choice| choice.get("message"))
        .and_then(|message| message.get("content"))
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if content.trim().is_empty() {
        return Err(BackendError::Fatal(
            "completion payload carried no message content".to_string(),
        ));
    }
    Ok(content.to_string())
}

fn format_api_error(provider: &str, key_env: &str, status: StatusCode, body: &str) -> String {
    let detail = serde_json::from_str::<Value>(body)
        .ok()
        .and_then(|v| {
            v.get("error")
                .and_then(|e| e.get("message").or(Some(e)))
                .and_then(|m| m.as_str().map(ToString::to_string))
        })
        .unwrap_or_else(|| body.chars().take(200).collect());

    match status {
        StatusCode::UNAUTHORIZED => format!(
            "invalid or missing API key (HTTP 401): set {key_env} or llm.api_key in settings"
        ),
        StatusCode::TOO_MANY_REQUESTS => {
            format!("{provider} rate limited (HTTP 429): {detail}")
        }
        StatusCode::INTERNAL_SERVER_ERROR | StatusCode::SERVICE_UNAVAILABLE => format!(
            "{provider} server error (HTTP {}): {detail}",
            status.as_u16()
        ),
        _ => format!("{provider} API error (HTTP {}): {detail}", status.as_u16()),
    }
}

fn format_transport_error(err: &reqwest::Error) -> String {
    if err.is_timeout() {
        "request timed out before the provider responded".to_string()
    } else if err.is_connect() {
        "connection failed: could not reach the provider endpoint".to_string()
    } else {
        format!("network error: {err}")
    }
}

fn should_retry_status(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::TOO_MANY_REQUESTS
            | StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::SERVICE_UNAVAILABLE
    )
}

fn should_retry_transport_error(err: &reqwest::Error) -> bool {
    err.is_timeout() || err.is_connect() || err.is_request()
}

fn parse_retry_after_seconds(header: Option<&reqwest::header::HeaderValue>) -> Option<u64> {
    let value = header?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(seconds);
    }
    parse_retry_after_http_date(value)
}

fn parse_retry_after_http_date(value: &str) -> Option<u64> {
    let retry_at = DateTime::parse_from_rfc2822(value)
        .map(|dt| dt.with_timezone(&Utc))
        .or_else(|_| {
            NaiveDateTime::parse_from_str(value, "%a, %d %b %Y %H:%M:%S GMT")
                .map(|naive| DateTime::<Utc>::from_naive_utc_and_offset(naive, Utc))
        })
        .ok()?;
    let delta = retry_at.signed_duration_since(Utc::now()).num_seconds();
    Some(delta.max(0) as u64)
}

/// Backoff delay for the given attempt. A server-provided Retry-After wins;
/// otherwise exponential from the base, capped at the configured maximum.
fn retry_delay(
    base_ms: u64,
    max_ms: u64,
    attempt: u32,
    retry_after_seconds: Option<u64>,
) -> Duration {
    if let Some(seconds) = retry_after_seconds {
        return Duration::from_millis(seconds.saturating_mul(1000));
    }
    let exponential = base_ms.saturating_mul(2_u64.saturating_pow(attempt));
    let capped = exponential.min(max_ms.max(base_ms));
    Duration::from_millis(capped.max(MIN_RETRY_DELAY_MS))
}

/// Uniform entry point to the configured backend, with bounded
/// retry-with-backoff around transient failures. Holds no conversation
/// state and never touches the store.
pub struct ModelGateway {
    backend: Box<dyn ModelBackend>,
    generate_model: String,
    verify_model: String,
    max_retries: u32,
    retry_base_ms: u64,
    retry_max_ms: u64,
}

impl ModelGateway {
    pub fn new(backend: Box<dyn ModelBackend>, cfg: &LlmConfig) -> Self {
        Self {
            backend,
            generate_model: cfg.generate_model.clone(),
            verify_model: cfg.verify_model.clone(),
            max_retries: cfg.max_retries,
            retry_base_ms: cfg.retry_base_ms,
            retry_max_ms: cfg.retry_max_ms,
        }
    }

    pub fn from_config(cfg: &LlmConfig) -> Result<Self> {
        Ok(Self::new(select_backend(cfg)?, cfg))
    }

    /// Issue one model call for the given branch transcript.
    ///
    /// The transcript must be non-empty and end in a user message. Transient
    /// backend failures are retried with exponential backoff; once retries
    /// are exhausted the call fails with `BuildError::ModelUnavailable`,
    /// which the caller must treat as fatal for the task.
    pub fn generate(&self, branch: &[Message], purpose: Purpose) -> Result<String> {
        self.generate_with_sleep(branch, purpose, thread::sleep)
    }

    /// Same as `generate`, with the backoff sleep injected so tests can
    /// observe delays without waiting them out.
    pub fn generate_with_sleep(
        &self,
        branch: &[Message],
        purpose: Purpose,
        mut sleep: impl FnMut(Duration),
    ) -> Result<String> {
        let last = branch
            .last()
            .ok_or_else(|| anyhow!("cannot call the model with an empty transcript"))?;
        if last.role != Role::User {
            return Err(anyhow!(
                "transcript must end in a user message, found {}",
                last.role.as_str()
            ));
        }

        let model = match purpose {
            Purpose::Generate => &self.generate_model,
            Purpose::Verify => &self.verify_model,
        };

        let mut attempt: u32 = 0;
        loop {
            match self.backend.call(branch, model, purpose) {
                Ok(text) => return Ok(text),
                Err(BackendError::Fatal(detail)) => {
                    return Err(anyhow!("model call failed: {detail}"));
                }
                Err(BackendError::Transient {
                    detail,
                    retry_after_seconds,
                }) => {
                    if attempt >= self.max_retries {
                        return Err(BuildError::ModelUnavailable {
                            attempts: attempt + 1,
                            detail,
                        }
                        .into());
                    }
                    sleep(retry_delay(
                        self.retry_base_ms,
                        self.retry_max_ms,
                        attempt,
                        retry_after_seconds,
                    ));
                    attempt += 1;
                }
            }
        }
    }
}
