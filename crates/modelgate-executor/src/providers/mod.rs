pub mod antigravity;
pub mod claude;
pub mod codex;
pub mod common;
pub mod copilot;
pub mod gemini;
pub mod openai_compat;

pub use antigravity::AntigravityExecutor;
pub use claude::ClaudeExecutor;
pub use codex::CodexExecutor;
pub use copilot::CopilotExecutor;
pub use gemini::GeminiExecutor;
pub use openai_compat::OpenAiCompatExecutor;
