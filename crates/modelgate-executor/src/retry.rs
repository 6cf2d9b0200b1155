use std::time::Duration;

/// Retry delay for empty streams, bare 429s, and no-capacity errors:
/// 250 ms × (attempt + 1), capped at 2 s.
pub fn retry_delay(attempt: u32) -> Duration {
    let delay = Duration::from_millis(250) * (attempt + 1);
    delay.min(Duration::from_secs(2))
}

/// Total attempts for one logical request: 1 + configured retries.
pub fn attempts(request_retry: u32) -> u32 {
    request_retry.saturating_add(1).max(1)
}

/// A 503 whose body names capacity exhaustion falls through to the next
/// base URL instead of surfacing.
pub fn is_no_capacity(status: u16, body: &[u8]) -> bool {
    if status != 503 || body.is_empty() {
        return false;
    }
    let lower = String::from_utf8_lossy(body).to_ascii_lowercase();
    lower.contains("no capacity available")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_ramps_and_caps() {
        assert_eq!(retry_delay(0), Duration::from_millis(250));
        assert_eq!(retry_delay(3), Duration::from_millis(1000));
        assert_eq!(retry_delay(10), Duration::from_secs(2));
    }

    #[test]
    fn attempts_floor_at_one() {
        assert_eq!(attempts(0), 1);
        assert_eq!(attempts(2), 3);
    }

    #[test]
    fn no_capacity_detection() {
        assert!(is_no_capacity(503, b"No capacity available for model"));
        assert!(!is_no_capacity(503, b""));
        assert!(!is_no_capacity(429, b"no capacity available"));
    }
}
