use std::time::Duration;

use serde_json::Value;

/// An upstream or gateway failure carrying the HTTP status to propagate.
#[derive(Debug, Clone, thiserror::Error)]
#[error("status {code}: {message}")]
pub struct StatusError {
    pub code: u16,
    pub message: String,
    /// Structured retry hint parsed from the body, when present.
    pub retry_after: Option<Duration>,
}

impl StatusError {
    pub fn new(code: u16, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn with_retry_after(mut self, retry_after: Option<Duration>) -> Self {
        self.retry_after = retry_after;
        self
    }

    pub fn unauthorized(message: impl Into<String>) -> Self {
        Self::new(401, message)
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(400, message)
    }

    pub fn service_unavailable(message: impl Into<String>) -> Self {
        Self::new(503, message)
    }

    /// A 429 without structured retry info is a transient rate limit and is
    /// retried internally, never surfaced.
    pub fn is_bare_429(&self) -> bool {
        self.code == 429 && self.retry_after.is_none()
    }

    /// Quota exhaustion: a non-bare 429, or a 403 whose body carries quota
    /// markers.
    pub fn is_quota_exhausted(&self) -> bool {
        if self.code == 429 {
            return !self.is_bare_429();
        }
        if self.code == 403 {
            let lower = self.message.to_ascii_lowercase();
            return lower.contains("quota") || lower.contains("resource_exhausted");
        }
        false
    }

    /// The OpenAI-shaped error body every client dialect receives.
    pub fn to_error_body(&self) -> Value {
        let kind = match self.code {
            400 => "invalid_request_error",
            401 | 403 => "authentication_error",
            429 => "rate_limit_error",
            500..=599 => "api_error",
            _ => "api_error",
        };
        serde_json::json!({
            "error": {
                "message": self.message,
                "type": kind,
                "code": self.code,
            }
        })
    }
}

/// Extracts a structured retry delay from an upstream error body.
///
/// Google-style bodies carry `retryDelay: "3.5s"` inside
/// `error.details[]`; other providers use `retry_after` seconds. The body
/// is walked recursively so envelope differences don't matter.
pub fn parse_retry_delay(body: &[u8]) -> Option<Duration> {
    let value: Value = serde_json::from_slice(body).ok()?;
    find_retry_delay(&value)
}

fn find_retry_delay(value: &Value) -> Option<Duration> {
    match value {
        Value::Object(map) => {
            for (key, item) in map {
                if key == "retryDelay" || key == "retry_after" || key == "retryAfter" {
                    if let Some(delay) = parse_delay_value(item) {
                        return Some(delay);
                    }
                }
                if let Some(delay) = find_retry_delay(item) {
                    return Some(delay);
                }
            }
            None
        }
        Value::Array(items) => items.iter().find_map(find_retry_delay),
        _ => None,
    }
}

fn parse_delay_value(value: &Value) -> Option<Duration> {
    match value {
        Value::String(text) => {
            let text = text.trim();
            let text = text.strip_suffix('s').unwrap_or(text);
            let secs: f64 = text.parse().ok()?;
            if secs < 0.0 {
                return None;
            }
            Some(Duration::from_secs_f64(secs))
        }
        Value::Number(num) => {
            let secs = num.as_f64()?;
            if secs < 0.0 {
                return None;
            }
            Some(Duration::from_secs_f64(secs))
        }
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bare_429_has_no_retry_info() {
        let err = StatusError::new(429, "{}");
        assert!(err.is_bare_429());
        let err = err.with_retry_after(Some(Duration::from_secs(30)));
        assert!(!err.is_bare_429());
        assert!(err.is_quota_exhausted());
    }

    #[test]
    fn parses_google_retry_delay() {
        let body = br#"{"error":{"code":429,"details":[{"@type":"type.googleapis.com/google.rpc.RetryInfo","retryDelay":"3.5s"}]}}"#;
        assert_eq!(
            parse_retry_delay(body),
            Some(Duration::from_secs_f64(3.5))
        );
    }

    #[test]
    fn parses_numeric_retry_after() {
        let body = br#"{"error":{"message":"slow down","retry_after":12}}"#;
        assert_eq!(parse_retry_delay(body), Some(Duration::from_secs(12)));
        assert_eq!(parse_retry_delay(b"{}"), None);
        assert_eq!(parse_retry_delay(b"not json"), None);
    }

    #[test]
    fn error_body_shape() {
        let err = StatusError::new(429, "rate limited");
        let body = err.to_error_body();
        assert_eq!(body["error"]["type"], "rate_limit_error");
        assert_eq!(body["error"]["code"], 429);
    }
}
