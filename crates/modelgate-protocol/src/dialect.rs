use serde::{Deserialize, Serialize};

/// A wire format spoken on one side of the gateway.
///
/// A closed enum so that adding a dialect forces every dispatch site to
/// decide how to handle it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Dialect {
    #[serde(rename = "openai")]
    OpenAi,
    #[serde(rename = "openai-responses")]
    OpenAiResponses,
    #[serde(rename = "claude")]
    Claude,
    #[serde(rename = "gemini")]
    Gemini,
    #[serde(rename = "gemini-cli")]
    GeminiCli,
    #[serde(rename = "codex")]
    Codex,
    #[serde(rename = "antigravity")]
    Antigravity,
}

impl Dialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Dialect::OpenAi => "openai",
            Dialect::OpenAiResponses => "openai-responses",
            Dialect::Claude => "claude",
            Dialect::Gemini => "gemini",
            Dialect::GeminiCli => "gemini-cli",
            Dialect::Codex => "codex",
            Dialect::Antigravity => "antigravity",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "openai" => Some(Dialect::OpenAi),
            "openai-responses" | "openai_responses" => Some(Dialect::OpenAiResponses),
            "claude" | "anthropic" => Some(Dialect::Claude),
            "gemini" => Some(Dialect::Gemini),
            "gemini-cli" | "gemini_cli" => Some(Dialect::GeminiCli),
            "codex" => Some(Dialect::Codex),
            "antigravity" => Some(Dialect::Antigravity),
            _ => None,
        }
    }

    /// How streaming responses are framed in this dialect.
    pub fn stream_framing(&self) -> StreamFraming {
        match self {
            Dialect::Claude => StreamFraming::SseNamedEvent,
            Dialect::OpenAiResponses | Dialect::Codex => StreamFraming::SseNamedEvent,
            Dialect::OpenAi => StreamFraming::SseDataOnly,
            Dialect::Gemini | Dialect::GeminiCli | Dialect::Antigravity => {
                StreamFraming::SseDataOnly
            }
        }
    }
}

impl std::fmt::Display for Dialect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamFraming {
    /// `event: name` line followed by `data:` (Claude, OpenAI responses).
    SseNamedEvent,
    /// `data:` lines only (OpenAI chat completions, Gemini alt=sse).
    SseDataOnly,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_round_trips() {
        for d in [
            Dialect::OpenAi,
            Dialect::OpenAiResponses,
            Dialect::Claude,
            Dialect::Gemini,
            Dialect::GeminiCli,
            Dialect::Codex,
            Dialect::Antigravity,
        ] {
            assert_eq!(Dialect::parse(d.as_str()), Some(d));
        }
        assert_eq!(Dialect::parse("unknown"), None);
    }

    #[test]
    fn framing_per_dialect() {
        assert_eq!(
            Dialect::Claude.stream_framing(),
            StreamFraming::SseNamedEvent
        );
        assert_eq!(Dialect::Codex.stream_framing(), StreamFraming::SseNamedEvent);
        assert_eq!(Dialect::OpenAi.stream_framing(), StreamFraming::SseDataOnly);
        assert_eq!(Dialect::Gemini.stream_framing(), StreamFraming::SseDataOnly);
    }
}
