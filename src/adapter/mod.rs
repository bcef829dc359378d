//! Provider capability interface and the static dispatch table over it.
//!
//! Each backend implements [`ProviderAdapter`] as one concrete type selected via
//! [`ProviderKind::adapter`]; there is no runtime registration. Adapters are pure
//! transformation layers: request in, wire body out, wire payload in, canonical
//! value out. They never perform I/O and never retry; classification of failures
//! and the retry policy live at the dispatch boundary.

use serde_json::Value;

use crate::config::ProviderConfig;
use crate::error::{ErrorKind, ErrorRecord};
use crate::http::HttpRequest;
use crate::sse::StreamFraming;
use crate::types::{
    AdapterCapabilities, CompletionRequest, CostRates, Delta, EmbeddingsRequest,
    EmbeddingsResponse, Response, Role,
};

pub mod anthropic;
pub mod azure;
pub mod bedrock;
pub mod gemini;
pub mod mistral;
pub mod ollama;
pub mod openai;
pub mod openrouter;

mod sealed {
    /// Adapters are a closed set; downstream crates select one via [`super::ProviderKind`].
    pub trait Sealed {}
}

pub(crate) use sealed::Sealed;

/// Supported provider backends.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderKind {
    OpenAi,
    Anthropic,
    Gemini,
    Mistral,
    Bedrock,
    Azure,
    Ollama,
    OpenRouter,
}

impl ProviderKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderKind::OpenAi => "openai",
            ProviderKind::Anthropic => "anthropic",
            ProviderKind::Gemini => "gemini",
            ProviderKind::Mistral => "mistral",
            ProviderKind::Bedrock => "bedrock",
            ProviderKind::Azure => "azure",
            ProviderKind::Ollama => "ollama",
            ProviderKind::OpenRouter => "openrouter",
        }
    }

    /// Static dispatch table: one concrete adapter per provider kind.
    pub fn adapter(&self) -> &'static dyn ProviderAdapter {
        match self {
            ProviderKind::OpenAi => &openai::OpenAiAdapter,
            ProviderKind::Anthropic => &anthropic::AnthropicAdapter,
            ProviderKind::Gemini => &gemini::GeminiAdapter,
            ProviderKind::Mistral => &mistral::MistralAdapter,
            ProviderKind::Bedrock => &bedrock::BedrockAdapter,
            ProviderKind::Azure => &azure::AzureAdapter,
            ProviderKind::Ollama => &ollama::OllamaAdapter,
            ProviderKind::OpenRouter => &openrouter::OpenRouterAdapter,
        }
    }

    /// Resolves a provider tag such as `openai` into a kind.
    pub fn from_str_tag(tag: &str) -> Result<Self, ErrorRecord> {
        match tag {
            "openai" => Ok(ProviderKind::OpenAi),
            "anthropic" => Ok(ProviderKind::Anthropic),
            "gemini" => Ok(ProviderKind::Gemini),
            "mistral" => Ok(ProviderKind::Mistral),
            "bedrock" => Ok(ProviderKind::Bedrock),
            "azure" => Ok(ProviderKind::Azure),
            "ollama" => Ok(ProviderKind::Ollama),
            "openrouter" => Ok(ProviderKind::OpenRouter),
            other => Err(ErrorRecord::new(
                ErrorKind::ProviderNotFound,
                "tsumugi",
                format!("unknown provider: {other}"),
            )),
        }
    }
}

impl std::fmt::Display for ProviderKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Contract implemented by every provider backend.
///
/// All methods are pure and synchronous; the transformation of a well-formed
/// [`CompletionRequest`] must be total. The dispatcher owns the network calls
/// and feeds wire payloads back through `transform_response` /
/// `transform_chunk` / `classify_error`.
pub trait ProviderAdapter: Sealed + Send + Sync {
    /// Stable provider tag stamped onto error records and logs.
    fn name(&self) -> &'static str;

    /// Feature surface of this backend.
    fn capabilities(&self) -> AdapterCapabilities;

    /// Whether the given model accepts reasoning/thinking configuration.
    fn supports_reasoning(&self, model: &str) -> bool;

    /// Per-token USD pricing; zero for unknown models, never an error.
    fn cost_per_token(&self, model: &str) -> CostRates;

    /// Streaming body framing used by this backend.
    fn framing(&self) -> StreamFraming {
        StreamFraming::Sse
    }

    /// Local, synchronous, fail-fast capability gate run before any network call.
    fn validate_request(&self, request: &CompletionRequest) -> Result<(), ErrorRecord> {
        validate_common(self.name(), self.capabilities(), request)?;
        if (request.reasoning_effort.is_some() || request.thinking.is_some())
            && !request.model.is_empty()
            && !self.supports_reasoning(&request.model)
        {
            return Err(ErrorRecord::unsupported(self.name(), "reasoning").with_context(
                "model",
                Value::String(request.model.clone()),
            ));
        }
        Ok(())
    }

    /// Builds the provider wire body for this request.
    fn transform_request(
        &self,
        request: &CompletionRequest,
        config: &ProviderConfig,
        stream: bool,
    ) -> Result<Value, ErrorRecord>;

    /// Builds the complete transport request: method, URL, headers, body.
    fn request_parts(
        &self,
        request: &CompletionRequest,
        config: &ProviderConfig,
        stream: bool,
    ) -> Result<HttpRequest, ErrorRecord>;

    /// Maps a successful wire response body to the canonical [`Response`],
    /// zero-filling usage when the provider omitted it.
    fn transform_response(&self, body: &str) -> Result<Response, ErrorRecord>;

    /// Maps one streaming frame to a canonical [`Delta`].
    ///
    /// Returns `Ok(None)` for frames carrying no user-visible content, which the
    /// streaming engine silently drops.
    fn transform_chunk(&self, frame: &str) -> Result<Option<Delta>, ErrorRecord>;

    /// Maps a provider failure (HTTP status + body) into the shared taxonomy.
    fn classify_error(&self, status: u16, body: &str, retry_after: Option<u64>) -> ErrorRecord;

    /// Builds the transport request for an embeddings call.
    fn embeddings_parts(
        &self,
        _request: &EmbeddingsRequest,
        _config: &ProviderConfig,
    ) -> Result<HttpRequest, ErrorRecord> {
        Err(ErrorRecord::unsupported(self.name(), "embeddings"))
    }

    /// Maps an embeddings wire response to the canonical shape.
    fn transform_embeddings_response(&self, _body: &str) -> Result<EmbeddingsResponse, ErrorRecord> {
        Err(ErrorRecord::unsupported(self.name(), "embeddings"))
    }

    /// Builds the liveness probe issued by the dispatcher's health pool.
    ///
    /// The default probes the configured base URL; any HTTP answer counts as
    /// alive. Returns `None` when no probe target is known.
    fn health_request(&self, config: &ProviderConfig) -> Option<HttpRequest> {
        config
            .base_url
            .as_ref()
            .map(|base| HttpRequest::get(base.clone()))
    }
}

/// 与 provider 无关的本地校验 所有 adapter 默认复用
pub(crate) fn validate_common(
    provider: &'static str,
    caps: AdapterCapabilities,
    request: &CompletionRequest,
) -> Result<(), ErrorRecord> {
    if request.messages.is_empty() {
        return Err(ErrorRecord::invalid_request(
            provider,
            "request requires at least one message",
        ));
    }

    if request.stream && !caps.supports_streaming {
        return Err(ErrorRecord::unsupported(provider, "streaming"));
    }

    if !request.tools.is_empty() && !caps.supports_tools {
        return Err(ErrorRecord::unsupported(provider, "tool-calling"));
    }

    for (position, message) in request.messages.iter().enumerate() {
        if message.role == Role::Tool && message.tool_call_id.is_none() {
            return Err(ErrorRecord::invalid_request(
                provider,
                format!("tool message at position {position} is missing tool_call_id"),
            ));
        }

        // 同一条消息内的 tool_call id 必须唯一
        if let Some(calls) = &message.tool_calls {
            let mut seen = std::collections::HashSet::new();
            for call in calls {
                if !seen.insert(call.id.as_str()) {
                    return Err(ErrorRecord::invalid_request(
                        provider,
                        format!(
                            "duplicate tool_call id `{}` in message at position {position}",
                            call.id
                        ),
                    ));
                }
            }
        }
    }

    Ok(())
}

/// Parses a canonical tool-call arguments string back into JSON for providers
/// that expect a native object on the wire.
pub(crate) fn arguments_to_value(
    provider: &'static str,
    arguments: &str,
) -> Result<Value, ErrorRecord> {
    if arguments.trim().is_empty() {
        return Ok(Value::Object(serde_json::Map::new()));
    }
    serde_json::from_str(arguments).map_err(|err| {
        ErrorRecord::invalid_request(
            provider,
            format!("tool call arguments are not valid JSON: {err}"),
        )
    })
}

/// Normalizes provider-side tool arguments into the canonical JSON string.
///
/// Providers that already send a string keep it verbatim; native objects are
/// re-serialized so callers always receive a JSON-encoded string.
pub(crate) fn value_to_arguments(value: &Value) -> String {
    match value {
        Value::String(text) => text.clone(),
        other => other.to_string(),
    }
}
