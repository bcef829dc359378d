//! Shared error taxonomy used across providers, streams, and the dispatcher.
//!
//! Every failure in the crate is classified into an [`ErrorKind`] with a
//! recoverability flag and carried as an [`ErrorRecord`] value. Synchronous calls
//! return records as `Err`; streaming calls deliver them in-band as the terminal
//! stream item, because the consumer of a channel has no call frame to catch
//! against.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use crate::types::ContextMap;

/// Classified failure kind shared by all providers.
///
/// The recoverable flag of each kind encodes whether a retry has a reasonable
/// chance of succeeding; unknown provider failures default to non-recoverable
/// so that silent infinite retries cannot occur.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ErrorKind {
    // client/config failures, never retried
    InvalidRequest,
    InvalidConfig,
    AuthenticationError,
    AuthorizationError,
    ProviderNotFound,
    ModelNotFound,
    UnsupportedFeature,
    QuotaExceeded,
    // provider/network failures, transient
    RateLimit,
    Timeout,
    ConnectionError,
    ServerError,
    /// Generic provider failure; recoverability decided per record.
    ProviderError,
    // response failures
    InvalidResponse,
    StreamingError,
    ContentFilter,
    // system failures
    InternalError,
    /// Pool or queue saturation inside the dispatcher.
    ResourceExhausted,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::InvalidRequest => "invalid-request",
            ErrorKind::InvalidConfig => "invalid-config",
            ErrorKind::AuthenticationError => "authentication-error",
            ErrorKind::AuthorizationError => "authorization-error",
            ErrorKind::ProviderNotFound => "provider-not-found",
            ErrorKind::ModelNotFound => "model-not-found",
            ErrorKind::UnsupportedFeature => "unsupported-feature",
            ErrorKind::QuotaExceeded => "quota-exceeded",
            ErrorKind::RateLimit => "rate-limit",
            ErrorKind::Timeout => "timeout",
            ErrorKind::ConnectionError => "connection-error",
            ErrorKind::ServerError => "server-error",
            ErrorKind::ProviderError => "provider-error",
            ErrorKind::InvalidResponse => "invalid-response",
            ErrorKind::StreamingError => "streaming-error",
            ErrorKind::ContentFilter => "content-filter",
            ErrorKind::InternalError => "internal-error",
            ErrorKind::ResourceExhausted => "resource-exhausted",
        }
    }

    /// Default recoverability of this kind before per-record overrides.
    pub fn default_recoverable(&self) -> bool {
        matches!(
            self,
            ErrorKind::RateLimit
                | ErrorKind::Timeout
                | ErrorKind::ConnectionError
                | ErrorKind::ServerError
                | ErrorKind::StreamingError
                | ErrorKind::ResourceExhausted
        )
    }
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Structured, classified representation of any failure in the crate.
///
/// The `Display` implementation renders the one-line human summary: kind,
/// provider, HTTP status when known, recoverable flag, and retry-after hint.
///
/// # Examples
///
/// ```
/// use tsumugi::error::{ErrorKind, ErrorRecord};
///
/// let record = ErrorRecord::new(ErrorKind::RateLimit, "openai", "Too many requests")
///     .with_http_status(429)
///     .with_retry_after(60);
/// assert!(record.recoverable);
/// assert!(record.to_string().contains("retry after 60s"));
/// ```
#[derive(Debug, Clone, PartialEq, Error, Serialize)]
#[error("{}", render_summary(.kind, .provider, .message, .http_status, .recoverable, .retry_after))]
pub struct ErrorRecord {
    /// Classified failure kind.
    pub kind: ErrorKind,
    /// Human-readable message, kept verbatim from the provider when possible.
    pub message: String,
    /// Provider name such as `anthropic`, or `transport` for pre-dispatch failures.
    pub provider: &'static str,
    /// HTTP status returned by the provider, when the failure came from a response.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub http_status: Option<u16>,
    /// Provider-specific error code extracted from the payload.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider_code: Option<String>,
    /// Wait hint in seconds supplied by the provider before retrying.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub retry_after: Option<u64>,
    /// Whether a retry has a reasonable chance of succeeding.
    pub recoverable: bool,
    /// Upstream request identifier, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    /// Additional structured context forwarded to callers.
    #[serde(default, skip_serializing_if = "HashMap::is_empty")]
    pub context: ContextMap,
}

fn render_summary(
    kind: impl std::fmt::Display,
    provider: impl std::fmt::Display,
    message: impl std::fmt::Display,
    http_status: &Option<u16>,
    recoverable: &bool,
    retry_after: &Option<u64>,
) -> String {
    let mut line = format!("{kind} from {provider}");
    if let Some(status) = http_status {
        line.push_str(&format!(" (HTTP {status})"));
    }
    line.push_str(if *recoverable {
        ", recoverable"
    } else {
        ", not recoverable"
    });
    if let Some(seconds) = retry_after {
        line.push_str(&format!(", retry after {seconds}s"));
    }
    line.push_str(&format!(": {message}"));
    line
}

impl ErrorRecord {
    /// Creates a record with the kind's default recoverability.
    pub fn new(kind: ErrorKind, provider: &'static str, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            provider,
            http_status: None,
            provider_code: None,
            retry_after: None,
            recoverable: kind.default_recoverable(),
            request_id: None,
            context: HashMap::new(),
        }
    }

    pub fn with_http_status(mut self, status: u16) -> Self {
        self.http_status = Some(status);
        self
    }

    pub fn with_provider_code(mut self, code: impl Into<String>) -> Self {
        self.provider_code = Some(code.into());
        self
    }

    pub fn with_retry_after(mut self, seconds: u64) -> Self {
        self.retry_after = Some(seconds);
        self
    }

    pub fn with_request_id(mut self, id: impl Into<String>) -> Self {
        self.request_id = Some(id.into());
        self
    }

    pub fn with_recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = recoverable;
        self
    }

    pub fn with_context(mut self, key: impl Into<String>, value: Value) -> Self {
        self.context.insert(key.into(), value);
        self
    }

    /// Re-stamps the provider name, used when a transport-level record crosses
    /// the dispatch boundary and the originating provider becomes known.
    pub fn for_provider(mut self, provider: &'static str) -> Self {
        self.provider = provider;
        self
    }

    /// Shorthand for transport connection failures.
    pub fn connection(message: impl Into<String>) -> Self {
        Self::new(ErrorKind::ConnectionError, "transport", message)
    }

    /// Shorthand for dispatch-boundary timeouts.
    pub fn timeout(provider: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::Timeout, provider, message)
    }

    /// Shorthand for malformed provider payloads.
    pub fn invalid_response(provider: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidResponse, provider, message)
    }

    /// Shorthand for local request validation failures.
    pub fn invalid_request(provider: &'static str, message: impl Into<String>) -> Self {
        Self::new(ErrorKind::InvalidRequest, provider, message)
    }

    /// Shorthand for capability gate rejections.
    pub fn unsupported(provider: &'static str, feature: &str) -> Self {
        Self::new(
            ErrorKind::UnsupportedFeature,
            provider,
            format!("feature not supported by this provider: {feature}"),
        )
    }
}

/// Returns `true` when an error code or message suggests a quota exhaustion
/// rather than a transient rate limit.
pub(crate) fn looks_like_quota_error(code_hint: Option<&str>, message: &str) -> bool {
    if let Some(code) = code_hint {
        let lower = code.to_ascii_lowercase();
        if lower.contains("quota") || lower == "insufficient_quota" || lower == "billing" {
            return true;
        }
    }
    let lower_message = message.to_ascii_lowercase();
    const HINTS: [&str; 4] = [
        "quota",
        "billing",
        "insufficient credit",
        "exceeded your current",
    ];
    HINTS.iter().any(|needle| lower_message.contains(needle))
}

/// Attempts to extract a model identifier quoted inside an error payload.
pub(crate) fn extract_model_identifier(message: &str) -> Option<String> {
    for delimiter in ['`', '"', '\''] {
        if let Some(value) = between_delimiters(message, delimiter) {
            if !value.trim().is_empty() {
                return Some(value.trim().to_string());
            }
        }
    }
    None
}

fn between_delimiters(message: &str, delimiter: char) -> Option<String> {
    let start = message.find(delimiter)?;
    let start_idx = start + delimiter.len_utf8();
    let rel_end = message.get(start_idx..)?.find(delimiter)?;
    Some(message[start_idx..start_idx + rel_end].to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_default_recoverability_follows_taxonomy() {
        assert!(ErrorKind::RateLimit.default_recoverable());
        assert!(ErrorKind::Timeout.default_recoverable());
        assert!(ErrorKind::ConnectionError.default_recoverable());
        assert!(ErrorKind::ServerError.default_recoverable());
        assert!(ErrorKind::ResourceExhausted.default_recoverable());

        assert!(!ErrorKind::InvalidRequest.default_recoverable());
        assert!(!ErrorKind::AuthenticationError.default_recoverable());
        assert!(!ErrorKind::QuotaExceeded.default_recoverable());
        assert!(!ErrorKind::ContentFilter.default_recoverable());
        assert!(!ErrorKind::ProviderError.default_recoverable());
        assert!(!ErrorKind::InternalError.default_recoverable());
    }

    #[test]
    fn summary_renders_one_line_with_optional_fields() {
        let record = ErrorRecord::new(ErrorKind::RateLimit, "openai", "Too many requests")
            .with_http_status(429)
            .with_retry_after(60);
        let line = record.to_string();
        assert!(line.contains("rate-limit from openai"), "got: {line}");
        assert!(line.contains("HTTP 429"), "got: {line}");
        assert!(line.contains("recoverable"), "got: {line}");
        assert!(line.contains("retry after 60s"), "got: {line}");
        assert!(!line.contains('\n'));

        let bare = ErrorRecord::new(ErrorKind::InvalidRequest, "gemini", "bad payload");
        let line = bare.to_string();
        assert!(line.contains("not recoverable"), "got: {line}");
        assert!(!line.contains("HTTP"), "got: {line}");
    }

    #[test]
    fn quota_detection_reads_code_and_message() {
        assert!(looks_like_quota_error(Some("insufficient_quota"), "whatever"));
        assert!(looks_like_quota_error(
            None,
            "You exceeded your current quota, please check your plan"
        ));
        assert!(!looks_like_quota_error(None, "Too many requests"));
    }

    #[test]
    fn model_identifier_extraction_handles_delimiters() {
        assert_eq!(
            extract_model_identifier("The model `gpt-x` was not found").as_deref(),
            Some("gpt-x")
        );
        assert_eq!(
            extract_model_identifier("model \"claude-z\" does not exist").as_deref(),
            Some("claude-z")
        );
        assert_eq!(extract_model_identifier("no quotes here"), None);
    }
}
