//! User-visible error mapping.
//!
//! Internal failures carry loose, provider-dependent wording. A single
//! ordered table of `(regex, code)` pairs converts them into stable
//! user-facing records; first match wins. The table is intentionally
//! best-effort — operators extend it as providers change their wording.

use regex::Regex;
use serde::{Deserialize, Serialize};

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Error codes
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ErrorCode {
    RateLimit,
    CreditExhausted,
    ConcurrentLimit,
    ModelAccessDenied,
    SandboxUnavailable,
    LlmOverloaded,
    LlmTimeout,
    ContextTooLong,
    McpConnectionFailed,
    ToolExecutionFailed,
    AuthenticationExpired,
    NetworkError,
    InternalError,
    BillingError,
    ProjectNotFound,
    ThreadNotFound,
}

impl ErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::RateLimit => "RATE_LIMIT",
            Self::CreditExhausted => "CREDIT_EXHAUSTED",
            Self::ConcurrentLimit => "CONCURRENT_LIMIT",
            Self::ModelAccessDenied => "MODEL_ACCESS_DENIED",
            Self::SandboxUnavailable => "SANDBOX_UNAVAILABLE",
            Self::LlmOverloaded => "LLM_OVERLOADED",
            Self::LlmTimeout => "LLM_TIMEOUT",
            Self::ContextTooLong => "CONTEXT_TOO_LONG",
            Self::McpConnectionFailed => "MCP_CONNECTION_FAILED",
            Self::ToolExecutionFailed => "TOOL_EXECUTION_FAILED",
            Self::AuthenticationExpired => "AUTHENTICATION_EXPIRED",
            Self::NetworkError => "NETWORK_ERROR",
            Self::InternalError => "INTERNAL_ERROR",
            Self::BillingError => "BILLING_ERROR",
            Self::ProjectNotFound => "PROJECT_NOT_FOUND",
            Self::ThreadNotFound => "THREAD_NOT_FOUND",
        }
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// User-facing record
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// An action offered to the user alongside an error.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UserAction {
    #[serde(rename = "type")]
    pub kind: String,
    pub label: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub delay_seconds: Option<u32>,
}

impl UserAction {
    pub fn link(label: &str, url: &str) -> Self {
        Self {
            kind: "link".into(),
            label: label.into(),
            url: Some(url.into()),
            delay_seconds: None,
        }
    }

    pub fn retry(label: &str, delay_seconds: Option<u32>) -> Self {
        Self {
            kind: "retry".into(),
            label: label.into(),
            url: None,
            delay_seconds,
        }
    }

    pub fn other(kind: &str, label: &str) -> Self {
        Self {
            kind: kind.into(),
            label: label.into(),
            url: None,
            delay_seconds: None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct UserFriendlyError {
    pub message: String,
    pub error_code: ErrorCode,
    pub recoverable: bool,
    pub actions: Vec<UserAction>,
}

fn catalog(code: ErrorCode) -> UserFriendlyError {
    use ErrorCode::*;
    let (message, recoverable, actions): (&str, bool, Vec<UserAction>) = match code {
        RateLimit => (
            "We're experiencing high demand. Your request will be processed shortly.",
            true,
            vec![UserAction::retry("Try again", Some(5))],
        ),
        CreditExhausted => (
            "You've used all your credits for this billing period.",
            false,
            vec![
                UserAction::link("Upgrade plan", "/settings/billing"),
                UserAction::link("View usage", "/settings/usage"),
            ],
        ),
        ConcurrentLimit => (
            "You have too many tasks running. Please wait for one to complete.",
            true,
            vec![UserAction::retry("Try again", Some(10))],
        ),
        ModelAccessDenied => (
            "Your plan doesn't include access to this AI model.",
            false,
            vec![
                UserAction::link("Upgrade plan", "/settings/billing"),
                UserAction::other("switch_model", "Use default model"),
            ],
        ),
        SandboxUnavailable => (
            "The development environment is temporarily unavailable. We're working on it.",
            true,
            vec![UserAction::retry("Try again", Some(30))],
        ),
        LlmOverloaded => (
            "The AI service is experiencing high load. Retrying automatically.",
            true,
            vec![UserAction::retry("Try again", Some(5))],
        ),
        LlmTimeout => (
            "The AI took too long to respond. This can happen with complex requests.",
            true,
            vec![
                UserAction::retry("Try again", None),
                UserAction::other("simplify", "Try a simpler request"),
            ],
        ),
        ContextTooLong => (
            "The conversation is too long for the AI to process. Try starting a new thread.",
            false,
            vec![
                UserAction::other("new_thread", "Start new conversation"),
                UserAction::link("Learn more", "/docs/context-limits"),
            ],
        ),
        McpConnectionFailed => (
            "Couldn't connect to one of your integrations. The task will continue without it.",
            true,
            vec![UserAction::link("Check integrations", "/settings/integrations")],
        ),
        ToolExecutionFailed => (
            "A tool encountered an error. The AI will try an alternative approach.",
            true,
            vec![],
        ),
        AuthenticationExpired => (
            "Your session has expired. Please sign in again.",
            false,
            vec![UserAction::link("Sign in", "/login")],
        ),
        NetworkError => (
            "Connection issue detected. Please check your internet connection.",
            true,
            vec![UserAction::retry("Try again", None)],
        ),
        InternalError => (
            "Something went wrong on our end. Our team has been notified.",
            true,
            vec![
                UserAction::retry("Try again", Some(5)),
                UserAction::link("Check status", "/status"),
            ],
        ),
        BillingError => (
            "There's an issue with your billing. Please update your payment method.",
            false,
            vec![UserAction::link("Update payment", "/settings/billing")],
        ),
        ProjectNotFound => (
            "This project no longer exists or you don't have access to it.",
            false,
            vec![UserAction::link("Go to projects", "/projects")],
        ),
        ThreadNotFound => (
            "This conversation no longer exists.",
            false,
            vec![UserAction::other("new_thread", "Start new conversation")],
        ),
    };
    UserFriendlyError {
        message: message.into(),
        error_code: code,
        recoverable,
        actions,
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Mapper
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

pub struct ErrorMapper {
    patterns: Vec<(Regex, ErrorCode)>,
}

impl ErrorMapper {
    pub fn new() -> Self {
        use ErrorCode::*;
        // Order matters: first match wins.
        let table: &[(&str, ErrorCode)] = &[
            (r"rate.?limit", RateLimit),
            (r"429", RateLimit),
            (r"insufficient_credits", CreditExhausted),
            (r"credit", CreditExhausted),
            (r"concurrent", ConcurrentLimit),
            (r"too many", ConcurrentLimit),
            (r"model access", ModelAccessDenied),
            (r"not allowed", ModelAccessDenied),
            (r"sandbox", SandboxUnavailable),
            (r"workspace", SandboxUnavailable),
            (r"overloaded", LlmOverloaded),
            (r"capacity", LlmOverloaded),
            (r"context length", ContextTooLong),
            (r"token limit", ContextTooLong),
            (r"max.*token", ContextTooLong),
            (r"timeout", LlmTimeout),
            (r"timed out", LlmTimeout),
            (r"mcp", McpConnectionFailed),
            (r"integration", McpConnectionFailed),
            (r"tool.*fail", ToolExecutionFailed),
            (r"tool.*error", ToolExecutionFailed),
            (r"unauthorized", AuthenticationExpired),
            (r"401", AuthenticationExpired),
            (r"auth", AuthenticationExpired),
            (r"network", NetworkError),
            (r"connection", NetworkError),
            (r"billing", BillingError),
            (r"payment", BillingError),
            (r"project.*not found", ProjectNotFound),
            (r"thread.*not found", ThreadNotFound),
        ];
        let patterns = table
            .iter()
            .map(|(p, c)| (Regex::new(p).expect("static pattern"), *c))
            .collect();
        Self { patterns }
    }

    /// Map a raw error message (plus optional known code) to the
    /// user-facing record. Falls back to `INTERNAL_ERROR`.
    pub fn map_message(&self, message: &str, code: Option<ErrorCode>) -> UserFriendlyError {
        if let Some(code) = code {
            return catalog(code);
        }
        let lower = message.to_ascii_lowercase();
        for (re, code) in &self.patterns {
            if re.is_match(&lower) {
                return catalog(*code);
            }
        }
        catalog(ErrorCode::InternalError)
    }

    pub fn map_code(&self, code: ErrorCode) -> UserFriendlyError {
        catalog(code)
    }

    /// Precheck error codes use internal spellings; translate them to
    /// the client-facing catalog.
    pub fn map_precheck_code(&self, code: &str) -> UserFriendlyError {
        match code {
            "INSUFFICIENT_CREDITS" => catalog(ErrorCode::CreditExhausted),
            "AGENT_RUN_LIMIT_EXCEEDED" => catalog(ErrorCode::ConcurrentLimit),
            "MODEL_ACCESS_DENIED" => catalog(ErrorCode::ModelAccessDenied),
            "BILLING_ERROR" => catalog(ErrorCode::BillingError),
            _ => catalog(ErrorCode::InternalError),
        }
    }
}

impl Default for ErrorMapper {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn first_match_wins() {
        let mapper = ErrorMapper::new();
        // "rate limit" appears before "timeout" in the table.
        let mapped = mapper.map_message("Rate limit hit after timeout", None);
        assert_eq!(mapped.error_code, ErrorCode::RateLimit);
    }

    #[test]
    fn explicit_code_short_circuits() {
        let mapper = ErrorMapper::new();
        let mapped = mapper.map_message("anything at all", Some(ErrorCode::ContextTooLong));
        assert_eq!(mapped.error_code, ErrorCode::ContextTooLong);
        assert!(!mapped.recoverable);
    }

    #[test]
    fn keyword_matches() {
        let mapper = ErrorMapper::new();
        for (msg, expected) in [
            ("upstream returned 429", ErrorCode::RateLimit),
            ("insufficient_credits for account", ErrorCode::CreditExhausted),
            ("model access denied by policy", ErrorCode::ModelAccessDenied),
            ("server is overloaded", ErrorCode::LlmOverloaded),
            ("request timed out", ErrorCode::LlmTimeout),
            ("maximum context length exceeded", ErrorCode::ContextTooLong),
            ("mcp server unreachable", ErrorCode::McpConnectionFailed),
            ("tool invocation failed", ErrorCode::ToolExecutionFailed),
            ("401 unauthorized", ErrorCode::AuthenticationExpired),
            ("network unreachable", ErrorCode::NetworkError),
            ("payment declined", ErrorCode::BillingError),
            ("project p1 not found", ErrorCode::ProjectNotFound),
            ("thread t1 not found", ErrorCode::ThreadNotFound),
        ] {
            let mapped = mapper.map_message(msg, None);
            assert_eq!(mapped.error_code, expected, "for message: {msg}");
        }
    }

    #[test]
    fn unknown_falls_back_to_internal() {
        let mapper = ErrorMapper::new();
        let mapped = mapper.map_message("segfault in the matrix", None);
        assert_eq!(mapped.error_code, ErrorCode::InternalError);
    }

    #[test]
    fn precheck_codes_translate() {
        let mapper = ErrorMapper::new();
        assert_eq!(
            mapper.map_precheck_code("INSUFFICIENT_CREDITS").error_code,
            ErrorCode::CreditExhausted
        );
        assert_eq!(
            mapper
                .map_precheck_code("AGENT_RUN_LIMIT_EXCEEDED")
                .error_code,
            ErrorCode::ConcurrentLimit
        );
        assert_eq!(
            mapper.map_precheck_code("PREP_ERROR").error_code,
            ErrorCode::InternalError
        );
    }

    #[test]
    fn code_serializes_screaming_snake() {
        assert_eq!(
            serde_json::to_string(&ErrorCode::CreditExhausted).unwrap(),
            "\"CREDIT_EXHAUSTED\""
        );
        assert_eq!(ErrorCode::McpConnectionFailed.as_str(), "MCP_CONNECTION_FAILED");
    }
}
