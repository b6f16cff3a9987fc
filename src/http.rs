use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rand::{rngs::StdRng, Rng, SeedableRng};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, RETRY_AFTER};
use reqwest::StatusCode;
use secrecy::{ExposeSecret, SecretString};
use serde_json::Value;
use tokio::time::sleep;
use tracing::{error, warn};

use crate::config::HttpSettings;
use crate::errors::{AppError, AppResult};

const RETRYABLE_STATUSES: [u16; 5] = [429, 500, 502, 503, 504];

/// JSON-over-HTTP with bounded retries and jittered exponential backoff.
#[derive(Clone)]
pub struct HttpClient {
    http: reqwest::Client,
    api_key: SecretString,
    settings: HttpSettings,
    jitter_rng: Arc<Mutex<StdRng>>,
}

impl HttpClient {
    pub fn new(api_key: SecretString, settings: HttpSettings) -> AppResult<Self> {
        Self::with_rng(api_key, settings, StdRng::from_entropy())
    }

    pub fn with_rng(api_key: SecretString, settings: HttpSettings, rng: StdRng) -> AppResult<Self> {
        let http = reqwest::Client::builder()
            .timeout(settings.timeout)
            .user_agent(concat!("hub-harvest/", env!("CARGO_PKG_VERSION")))
            .build()?;
        Ok(Self {
            http,
            api_key,
            settings,
            jitter_rng: Arc::new(Mutex::new(rng)),
        })
    }

    pub async fn post_json(
        &self,
        url: &str,
        body: &Value,
        field_mask: &str,
        extra_headers: Option<&[(&str, &str)]>,
    ) -> AppResult<Value> {
        let headers = self.build_headers(field_mask, extra_headers)?;
        let max_attempts = self.settings.retry_max.max(1);
        let mut attempt = 0;
        loop {
            attempt += 1;
            let response = match self
                .http
                .post(url)
                .headers(headers.clone())
                .json(body)
                .send()
                .await
            {
                Ok(response) => response,
                Err(err) if attempt < max_attempts => {
                    let delay = self.backoff_delay(attempt);
                    warn!(?err, attempt, url, "request failed; retrying after {:?}", delay);
                    sleep(delay).await;
                    continue;
                }
                Err(err) => return Err(AppError::Transport(err)),
            };

            let status = response.status();
            if status.is_success() {
                let text = response.text().await?;
                return serde_json::from_str(&text).map_err(|err| {
                    error!(url, "non-JSON response body");
                    AppError::MalformedResponse {
                        url: url.to_string(),
                        message: err.to_string(),
                    }
                });
            }

            if is_retryable(status) {
                warn!(status = status.as_u16(), attempt, url, "retryable HTTP status");
                if attempt >= max_attempts {
                    return Err(status_error(status, url));
                }
                let delay = self
                    .retry_after_delay(response.headers())
                    .unwrap_or_else(|| self.backoff_delay(attempt));
                sleep(delay).await;
                continue;
            }

            error!(status = status.as_u16(), url, "non-retryable HTTP status");
            return Err(status_error(status, url));
        }
    }

    fn build_headers(
        &self,
        field_mask: &str,
        extra_headers: Option<&[(&str, &str)]>,
    ) -> AppResult<HeaderMap> {
        let mut headers = HeaderMap::new();
        headers.insert("x-goog-api-key", header_value(self.api_key.expose_secret())?);
        headers.insert("x-goog-fieldmask", header_value(field_mask)?);
        for (name, value) in extra_headers.unwrap_or_default() {
            let name = HeaderName::from_bytes(name.as_bytes())
                .map_err(|err| AppError::config(format!("invalid header name {name}: {err}")))?;
            headers.insert(name, header_value(value)?);
        }
        Ok(headers)
    }

    /// `base·2^(attempt−1)` capped at the maximum, plus jitter in `[0, base)`.
    fn backoff_delay(&self, attempt: u32) -> Duration {
        let base_ms = self.settings.backoff_base.as_millis() as u64;
        let exponent = attempt.saturating_sub(1).min(16);
        let scaled = Duration::from_millis(base_ms.saturating_mul(1 << exponent));
        let capped = scaled.min(self.settings.backoff_max);
        let jitter = if base_ms == 0 {
            Duration::ZERO
        } else {
            let mut rng = self.jitter_rng.lock();
            Duration::from_millis(rng.gen_range(0..base_ms))
        };
        capped + jitter
    }

    fn retry_after_delay(&self, headers: &HeaderMap) -> Option<Duration> {
        let seconds: f64 = headers.get(RETRY_AFTER)?.to_str().ok()?.trim().parse().ok()?;
        if !seconds.is_finite() {
            return None;
        }
        let clamped = seconds.clamp(0.0, self.settings.backoff_max.as_secs_f64());
        Some(Duration::from_secs_f64(clamped))
    }
}

fn header_value(value: &str) -> AppResult<HeaderValue> {
    HeaderValue::from_str(value).map_err(|err| AppError::config(format!("invalid header value: {err}")))
}

fn is_retryable(status: StatusCode) -> bool {
    RETRYABLE_STATUSES.contains(&status.as_u16())
}

fn status_error(status: StatusCode, url: &str) -> AppError {
    AppError::HttpStatus {
        status: status.as_u16(),
        url: url.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(base_ms: u64, max_ms: u64) -> HttpClient {
        HttpClient::with_rng(
            SecretString::from("key".to_string()),
            HttpSettings {
                timeout: Duration::from_secs(1),
                retry_max: 3,
                backoff_base: Duration::from_millis(base_ms),
                backoff_max: Duration::from_millis(max_ms),
            },
            StdRng::seed_from_u64(7),
        )
        .unwrap()
    }

    #[test]
    fn backoff_grows_and_caps() {
        let client = client(100, 350);
        let first = client.backoff_delay(1);
        assert!(first >= Duration::from_millis(100) && first < Duration::from_millis(200));
        let second = client.backoff_delay(2);
        assert!(second >= Duration::from_millis(200) && second < Duration::from_millis(300));
        let capped = client.backoff_delay(6);
        assert!(capped >= Duration::from_millis(350) && capped < Duration::from_millis(450));
    }

    #[test]
    fn retry_after_is_clamped() {
        let client = client(100, 2_000);
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("30"));
        assert_eq!(
            client.retry_after_delay(&headers),
            Some(Duration::from_millis(2_000))
        );
        headers.insert(RETRY_AFTER, HeaderValue::from_static("1"));
        assert_eq!(client.retry_after_delay(&headers), Some(Duration::from_secs(1)));
        headers.insert(RETRY_AFTER, HeaderValue::from_static("soon"));
        assert_eq!(client.retry_after_delay(&headers), None);
    }

    #[test]
    fn only_transient_statuses_retry() {
        assert!(is_retryable(StatusCode::TOO_MANY_REQUESTS));
        assert!(is_retryable(StatusCode::SERVICE_UNAVAILABLE));
        assert!(!is_retryable(StatusCode::BAD_REQUEST));
        assert!(!is_retryable(StatusCode::NOT_IMPLEMENTED));
    }

    #[test]
    fn extra_headers_are_merged() {
        let client = client(1, 1);
        let headers = client
            .build_headers("places.id", Some(&[("X-Trace", "abc")][..]))
            .unwrap();
        assert_eq!(headers.get("x-goog-fieldmask").unwrap(), "places.id");
        assert_eq!(headers.get("x-trace").unwrap(), "abc");
        assert!(client.build_headers("m", Some(&[("bad header", "v")][..])).is_err());
    }
}
