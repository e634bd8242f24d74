use serde::{Deserialize, Serialize};
use std::collections::HashMap;

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// LLM provider + model catalog
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LlmConfig {
    /// OpenAI-compatible completions endpoint base URL.
    #[serde(default = "d_base_url")]
    pub base_url: String,
    /// Environment variable holding the API key.
    #[serde(default = "d_api_key_env")]
    pub api_key_env: String,
    #[serde(default = "d_default_model")]
    pub default_model: String,
    /// Model used for context summarization. Falls back to `default_model`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub summarizer_model: Option<String>,
    /// Per-turn LLM call cap.
    #[serde(default = "d_call_timeout")]
    pub call_timeout_seconds: u64,
    /// In-turn retries for transient provider failures.
    #[serde(default = "d_error_retries")]
    pub error_retry_count: u32,
    /// Known models: context window and pricing.
    #[serde(default = "default_models")]
    pub models: HashMap<String, ModelInfo>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelInfo {
    pub context_window: u64,
    /// USD per million input tokens.
    #[serde(default)]
    pub input_cost_per_mtok: f64,
    /// USD per million output tokens.
    #[serde(default)]
    pub output_cost_per_mtok: f64,
    /// Characters-per-token ratio for the deterministic counter.
    #[serde(default = "d_chars_per_token")]
    pub chars_per_token: f64,
}

impl ModelInfo {
    pub fn estimate_cost(&self, prompt_tokens: u32, completion_tokens: u32) -> f64 {
        (prompt_tokens as f64 / 1_000_000.0) * self.input_cost_per_mtok
            + (completion_tokens as f64 / 1_000_000.0) * self.output_cost_per_mtok
    }
}

fn d_base_url() -> String {
    "https://api.openai.com/v1".into()
}
fn d_api_key_env() -> String {
    "FD_LLM_API_KEY".into()
}
fn d_default_model() -> String {
    "gpt-4o".into()
}
fn d_call_timeout() -> u64 {
    300
}
fn d_error_retries() -> u32 {
    3
}
fn d_chars_per_token() -> f64 {
    4.0
}

fn default_models() -> HashMap<String, ModelInfo> {
    let mut m = HashMap::new();
    m.insert(
        "gpt-4o".into(),
        ModelInfo {
            context_window: 128_000,
            input_cost_per_mtok: 2.5,
            output_cost_per_mtok: 10.0,
            chars_per_token: d_chars_per_token(),
        },
    );
    m.insert(
        "gpt-4o-mini".into(),
        ModelInfo {
            context_window: 128_000,
            input_cost_per_mtok: 0.15,
            output_cost_per_mtok: 0.6,
            chars_per_token: d_chars_per_token(),
        },
    );
    m.insert(
        "claude-sonnet".into(),
        ModelInfo {
            context_window: 200_000,
            input_cost_per_mtok: 3.0,
            output_cost_per_mtok: 15.0,
            chars_per_token: d_chars_per_token(),
        },
    );
    m
}

impl LlmConfig {
    /// Context window for a model; unknown models get a conservative 128k.
    pub fn context_window(&self, model: &str) -> u64 {
        self.models
            .get(model)
            .map(|m| m.context_window)
            .unwrap_or(128_000)
    }

    pub fn model_info(&self, model: &str) -> Option<&ModelInfo> {
        self.models.get(model)
    }
}

impl Default for LlmConfig {
    fn default() -> Self {
        Self {
            base_url: d_base_url(),
            api_key_env: d_api_key_env(),
            default_model: d_default_model(),
            summarizer_model: None,
            call_timeout_seconds: d_call_timeout(),
            error_retry_count: d_error_retries(),
            models: default_models(),
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Context compression
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompressionConfig {
    /// Recent messages preserved verbatim when summarizing.
    #[serde(default = "d_keep_recent")]
    pub keep_recent_messages: usize,
    /// Cap on the summary the summarizer may produce.
    #[serde(default = "d_summary_max_tokens")]
    pub summary_max_tokens: u32,
}

fn d_keep_recent() -> usize {
    10
}
fn d_summary_max_tokens() -> u32 {
    2000
}

impl Default for CompressionConfig {
    fn default() -> Self {
        Self {
            keep_recent_messages: d_keep_recent(),
            summary_max_tokens: d_summary_max_tokens(),
        }
    }
}
