use std::sync::Arc;
use std::time::{Duration, Instant};

use reqwest::RequestBuilder;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::sync::Mutex;
use tokio::time::sleep;
use tracing::warn;

use crate::error::{EngineError, Result};

/// Seconds to wait on a 429 without a usable `Retry-After`.
const DEFAULT_RETRY_AFTER: u64 = 60;

/// HTTP client that spaces requests at least `min_interval` apart, waits out
/// 429 responses and retries transport errors with exponential backoff.
pub struct RateLimitedClient {
    client: reqwest::Client,
    headers: HeaderMap,
    min_interval: Duration,
    last_request: Arc<Mutex<Option<Instant>>>,
    max_retries: u32,
}

impl RateLimitedClient {
    pub fn new(min_interval: Duration, max_retries: u32, user_agent: &str) -> Result<Self> {
        let client = reqwest::Client::builder()
            .user_agent(user_agent)
            .gzip(true)
            .build()?;
        Ok(Self {
            client,
            headers: HeaderMap::new(),
            min_interval,
            last_request: Arc::new(Mutex::new(None)),
            max_retries,
        })
    }

    /// Interval matching a requests-per-second budget; zero or less disables spacing.
    pub fn interval_for(requests_per_second: f64) -> Duration {
        if requests_per_second > 0.0 {
            Duration::from_secs_f64(1.0 / requests_per_second)
        } else {
            Duration::ZERO
        }
    }

    /// Send `value` as header `name` with every request.
    pub fn with_header(mut self, name: &str, value: &str) -> Result<Self> {
        let invalid = |e: &dyn std::fmt::Display| EngineError::InvalidOption(name.to_string(), e.to_string());
        let header = HeaderName::from_bytes(name.as_bytes()).map_err(|e| invalid(&e))?;
        let value = HeaderValue::from_str(value).map_err(|e| invalid(&e))?;
        self.headers.insert(header, value);
        Ok(self)
    }

    async fn wait_for_rate_limit(&self) {
        let mut last = self.last_request.lock().await;
        if let Some(t) = *last {
            let elapsed = t.elapsed();
            if elapsed < self.min_interval {
                sleep(self.min_interval - elapsed).await;
            }
        }
        *last = Some(Instant::now());
    }

    pub async fn get_query(&self, url: &str, query: &[(&str, String)]) -> Result<String> {
        self.send(|| self.client.get(url).query(query)).await
    }

    pub async fn get_json<T: DeserializeOwned>(&self, url: &str, query: &[(&str, String)]) -> Result<T> {
        let text = self.get_query(url, query).await?;
        serde_json::from_str(&text).map_err(|e| EngineError::Parse(e.to_string()))
    }

    pub async fn post_form<T: DeserializeOwned>(&self, url: &str, form: &[(&str, String)]) -> Result<T> {
        let text = self.send(|| self.client.post(url).form(form)).await?;
        serde_json::from_str(&text).map_err(|e| EngineError::Parse(e.to_string()))
    }

    async fn send<F>(&self, build: F) -> Result<String>
    where
        F: Fn() -> RequestBuilder,
    {
        let mut attempt = 0u32;
        loop {
            self.wait_for_rate_limit().await;
            let resp = build().headers(self.headers.clone()).send().await;
            match resp {
                Ok(r) if r.status() == 429 => {
                    let wait = r
                        .headers()
                        .get(RETRY_AFTER)
                        .and_then(|v| v.to_str().ok())
                        .and_then(|s| s.parse::<u64>().ok())
                        .unwrap_or(DEFAULT_RETRY_AFTER);
                    if attempt >= self.max_retries {
                        return Err(EngineError::RateLimit(wait));
                    }
                    warn!(wait, attempt, "rate limited by CRM");
                    sleep(Duration::from_secs(wait)).await;
                    attempt += 1;
                }
                Ok(r) if !r.status().is_success() => {
                    let status = r.status().as_u16();
                    let body = r.text().await.unwrap_or_default();
                    return Err(EngineError::Api {
                        status,
                        message: error_message(&body),
                    });
                }
                Ok(r) => return r.text().await.map_err(EngineError::Http),
                Err(e) => {
                    if attempt >= self.max_retries {
                        return Err(EngineError::Http(e));
                    }
                    let backoff = 2u64.pow(attempt);
                    warn!(error = %e, backoff, "request failed, retrying");
                    sleep(Duration::from_secs(backoff)).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// `errorMsg` of a CRM error body plus any field errors; the raw body when it
/// is not JSON.
pub fn error_message(body: &str) -> String {
    let Ok(json) = serde_json::from_str::<Value>(body) else {
        return body.to_string();
    };
    let mut message = json
        .get("errorMsg")
        .and_then(Value::as_str)
        .unwrap_or("unknown error")
        .to_string();
    let details: Vec<String> = match json.get("errors") {
        Some(Value::Object(errors)) => errors
            .iter()
            .map(|(field, error)| format!("{field}: {}", error.as_str().unwrap_or_default()))
            .collect(),
        Some(Value::Array(errors)) => errors
            .iter()
            .filter_map(Value::as_str)
            .map(str::to_string)
            .collect(),
        _ => Vec::new(),
    };
    if !details.is_empty() {
        message = format!("{message} ({})", details.join("; "));
    }
    message
}
