//! Usage accounting with a one-shot publish latch.
//!
//! Every exchange publishes exactly one usage record, success or failure,
//! no matter how many interim usage chunks the stream carried.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};

use serde_json::Value;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct UsageTokens {
    pub prompt: i64,
    pub completion: i64,
    pub total: i64,
}

#[derive(Debug, Clone)]
pub struct UsageRecord {
    pub provider: String,
    pub model: String,
    pub auth_id: String,
    pub tokens: UsageTokens,
    pub success: bool,
}

pub trait UsageSink: Send + Sync {
    fn record(&self, record: UsageRecord);
}

/// Default sink: structured log lines.
#[derive(Debug, Default)]
pub struct LogUsageSink;

impl UsageSink for LogUsageSink {
    fn record(&self, record: UsageRecord) {
        tracing::debug!(
            provider = %record.provider,
            model = %record.model,
            auth_id = %record.auth_id,
            prompt = record.tokens.prompt,
            completion = record.tokens.completion,
            total = record.tokens.total,
            success = record.success,
            "usage"
        );
    }
}

pub struct UsageReporter {
    sink: Arc<dyn UsageSink>,
    provider: String,
    model: String,
    auth_id: String,
    latest: Mutex<UsageTokens>,
    published: AtomicBool,
}

impl UsageReporter {
    pub fn new(
        sink: Arc<dyn UsageSink>,
        provider: impl Into<String>,
        model: impl Into<String>,
        auth_id: impl Into<String>,
    ) -> Self {
        Self {
            sink,
            provider: provider.into(),
            model: model.into(),
            auth_id: auth_id.into(),
            latest: Mutex::new(UsageTokens::default()),
            published: AtomicBool::new(false),
        }
    }

    /// Remembers the latest usage numbers seen on the wire. Interim chunks
    /// overwrite earlier ones; only the final state is published.
    pub fn observe(&self, tokens: UsageTokens) {
        if tokens.total == 0 && tokens.prompt == 0 && tokens.completion == 0 {
            return;
        }
        if let Ok(mut guard) = self.latest.lock() {
            *guard = tokens;
        }
    }

    pub fn ensure_published(&self) {
        self.publish(true);
    }

    pub fn publish_failure(&self) {
        self.publish(false);
    }

    fn publish(&self, success: bool) {
        if self.published.swap(true, Ordering::SeqCst) {
            return;
        }
        let tokens = self
            .latest
            .lock()
            .map(|guard| guard.clone())
            .unwrap_or_default();
        self.sink.record(UsageRecord {
            provider: self.provider.clone(),
            model: self.model.clone(),
            auth_id: self.auth_id.clone(),
            tokens,
            success,
        });
    }
}

/// Usage from an OpenAI-shaped body (`usage.prompt_tokens`, ...).
pub fn openai_usage(value: &Value) -> Option<UsageTokens> {
    let usage = value.get("usage").filter(|u| u.is_object())?;
    let prompt = usage.get("prompt_tokens").and_then(Value::as_i64).unwrap_or(0);
    let completion = usage
        .get("completion_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let total = usage
        .get("total_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(prompt + completion);
    (total > 0).then_some(UsageTokens {
        prompt,
        completion,
        total,
    })
}

/// Usage from a Claude-shaped body (`usage.input_tokens`, ...), including
/// `message_start`/`message_delta` stream events.
pub fn claude_usage(value: &Value) -> Option<UsageTokens> {
    let usage = value
        .get("usage")
        .or_else(|| value.pointer("/message/usage"))
        .filter(|u| u.is_object())?;
    let prompt = usage.get("input_tokens").and_then(Value::as_i64).unwrap_or(0);
    let completion = usage
        .get("output_tokens")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let total = prompt + completion;
    (total > 0).then_some(UsageTokens {
        prompt,
        completion,
        total,
    })
}

/// Usage from a Gemini-shaped body, wrapped or not.
pub fn gemini_usage(value: &Value) -> Option<UsageTokens> {
    let usage = value
        .get("usageMetadata")
        .or_else(|| value.pointer("/response/usageMetadata"))
        .filter(|u| u.is_object())?;
    let prompt = usage
        .get("promptTokenCount")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let candidates = usage
        .get("candidatesTokenCount")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let thoughts = usage
        .get("thoughtsTokenCount")
        .and_then(Value::as_i64)
        .unwrap_or(0);
    let total = usage
        .get("totalTokenCount")
        .and_then(Value::as_i64)
        .unwrap_or(prompt + candidates + thoughts);
    (total > 0).then_some(UsageTokens {
        prompt,
        completion: candidates + thoughts,
        total,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::Mutex as StdMutex;

    #[derive(Default)]
    struct CaptureSink {
        records: StdMutex<Vec<UsageRecord>>,
    }

    impl UsageSink for CaptureSink {
        fn record(&self, record: UsageRecord) {
            self.records.lock().unwrap().push(record);
        }
    }

    #[test]
    fn publishes_exactly_once() {
        let sink = Arc::new(CaptureSink::default());
        let reporter = UsageReporter::new(sink.clone(), "gemini", "m", "a-1");
        reporter.observe(UsageTokens {
            prompt: 1,
            completion: 2,
            total: 3,
        });
        reporter.ensure_published();
        reporter.ensure_published();
        reporter.publish_failure();

        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(records[0].success);
        assert_eq!(records[0].tokens.total, 3);
    }

    #[test]
    fn failure_publishes_once_when_nothing_observed() {
        let sink = Arc::new(CaptureSink::default());
        let reporter = UsageReporter::new(sink.clone(), "codex", "m", "a-1");
        reporter.publish_failure();
        reporter.ensure_published();
        let records = sink.records.lock().unwrap();
        assert_eq!(records.len(), 1);
        assert!(!records[0].success);
    }

    #[test]
    fn parses_all_three_shapes() {
        let openai = json!({"usage": {"prompt_tokens": 1, "completion_tokens": 2}});
        assert_eq!(openai_usage(&openai).unwrap().total, 3);

        let claude = json!({"usage": {"input_tokens": 4, "output_tokens": 5}});
        assert_eq!(claude_usage(&claude).unwrap().total, 9);

        let gemini = json!({"response": {"usageMetadata": {
            "promptTokenCount": 1, "candidatesTokenCount": 2, "thoughtsTokenCount": 3,
        }}});
        let tokens = gemini_usage(&gemini).unwrap();
        assert_eq!(tokens.completion, 5);
        assert_eq!(tokens.total, 6);

        assert!(openai_usage(&json!({})).is_none());
    }
}
