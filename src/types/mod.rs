//! Canonical data model shared by every provider adapter.
//!
//! These types normalize the request, response, and streaming-delta shapes of all
//! supported backends so the rest of the crate can stay agnostic of individual
//! wire-format differences. Values are constructed once at the system boundary and
//! treated as immutable afterwards.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::ErrorRecord;

/// Chat role understood by every provider after adapter translation.
///
/// The set is closed on purpose: adapters translate provider-specific vocabulary
/// (for example Gemini's `model`) to and from these four roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Role {
    System,
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }
}

impl std::fmt::Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One block of provider-surfaced thinking output.
///
/// Anthropic and Bedrock return signed thinking blocks that must be replayed
/// verbatim on the next turn; the signature is therefore carried alongside the
/// text instead of being discarded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingBlock {
    /// Block discriminator as reported by the provider, e.g. `thinking`.
    pub kind: String,
    /// Thinking text.
    pub text: String,
    /// Provider signature over the block, when one was supplied.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signature: Option<String>,
}

/// Normalized chat message shared across providers.
///
/// # Examples
///
/// ```
/// # use tsumugi::types::{Message, Role};
/// let msg = Message::user("Summarize Rust traits.");
/// assert_eq!(msg.role, Role::User);
/// assert_eq!(msg.content.as_deref(), Some("Summarize Rust traits."));
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    /// Role associated with this message.
    pub role: Role,
    /// Text content; absent for pure tool-call turns.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Tool invocations requested by the assistant, in emission order.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCall>>,
    /// Correlates a tool-role message with the call it answers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Reasoning text surfaced by OpenAI-style backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    /// Signed thinking blocks surfaced by Anthropic-style backends.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking_blocks: Option<Vec<ThinkingBlock>>,
}

impl Message {
    /// Creates a system message with plain text content.
    pub fn system(text: impl Into<String>) -> Self {
        Self::text(Role::System, text)
    }

    /// Creates a user message with plain text content.
    pub fn user(text: impl Into<String>) -> Self {
        Self::text(Role::User, text)
    }

    /// Creates an assistant message with plain text content.
    pub fn assistant(text: impl Into<String>) -> Self {
        Self::text(Role::Assistant, text)
    }

    /// Creates a tool-result message answering the call identified by `tool_call_id`.
    pub fn tool_result(tool_call_id: impl Into<String>, output: impl Into<String>) -> Self {
        Self {
            role: Role::Tool,
            content: Some(output.into()),
            tool_calls: None,
            tool_call_id: Some(tool_call_id.into()),
            reasoning_content: None,
            thinking_blocks: None,
        }
    }

    fn text(role: Role, text: impl Into<String>) -> Self {
        Self {
            role,
            content: Some(text.into()),
            tool_calls: None,
            tool_call_id: None,
            reasoning_content: None,
            thinking_blocks: None,
        }
    }
}

/// Declarative definition of a tool available to the assistant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSpec {
    /// Unique name exposed to the model.
    pub name: String,
    /// Natural-language description of the tool purpose.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// JSON Schema describing the input payload.
    pub parameters: Value,
}

/// Tool invocation emitted inside a response.
///
/// `function.arguments` is always a JSON-encoded *string*, even when the
/// provider returned a native object; adapters re-serialize objects so callers
/// see one consistent encoding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCall {
    /// Identifier unique within the owning message.
    pub id: String,
    /// Call discriminator; currently always `function`.
    #[serde(rename = "type", default = "function_kind")]
    pub kind: String,
    /// Invoked function and its serialized arguments.
    pub function: FunctionCall,
}

fn function_kind() -> String {
    "function".to_string()
}

impl ToolCall {
    /// Creates a function call with pre-serialized JSON arguments.
    pub fn function(
        id: impl Into<String>,
        name: impl Into<String>,
        arguments: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            kind: "function".to_string(),
            function: FunctionCall {
                name: name.into(),
                arguments: arguments.into(),
            },
        }
    }
}

/// Function name plus JSON-string-encoded arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCall {
    pub name: String,
    pub arguments: String,
}

/// Strategy describing how tools may be invoked.
///
/// Some ecosystems spell the force-a-tool-call mode `required`, others `any`;
/// both deserialize to [`ToolChoice::Required`] and each adapter emits its own
/// provider vocabulary on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ToolChoice {
    /// Provider decides when to call tools.
    Auto,
    /// Tools are disabled for this request.
    None,
    /// Provider must invoke at least one tool.
    #[serde(alias = "any")]
    Required,
    /// Force a specific tool by name.
    Tool { name: String },
}

/// Reasoning effort presets accepted by reasoning-capable models.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasoningEffort {
    Low,
    Medium,
    High,
}

impl ReasoningEffort {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReasoningEffort::Low => "low",
            ReasoningEffort::Medium => "medium",
            ReasoningEffort::High => "high",
        }
    }
}

/// Explicit thinking budget for providers that expose one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ThinkingConfig {
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub budget_tokens: Option<u32>,
}

/// Chat completion request shared across all providers.
///
/// A request is created by the caller and consumed exactly once by one adapter
/// call; adapters never mutate it.
///
/// # Examples
///
/// ```
/// # use tsumugi::types::{CompletionRequest, Message};
/// let request = CompletionRequest {
///     model: "gpt-4o-mini".to_string(),
///     messages: vec![Message::system("You are concise."), Message::user("Hi")],
///     temperature: Some(0.3),
///     ..CompletionRequest::default()
/// };
/// assert_eq!(request.messages.len(), 2);
/// ```
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CompletionRequest {
    /// Model identifier; may be empty when the provider config supplies a default.
    #[serde(default)]
    pub model: String,
    /// Ordered list of messages to send.
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    /// Stop sequences forwarded to the provider.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub stop: Vec<String>,
    /// Tool definitions available to the assistant.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<ToolSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<ToolChoice>,
    /// Whether the caller intends to consume this request as a stream.
    #[serde(default)]
    pub stream: bool,
    /// Effort preset for reasoning-capable models.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_effort: Option<ReasoningEffort>,
    /// Token-budget style thinking configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thinking: Option<ThinkingConfig>,
}

/// Why a response stopped generating content.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FinishReason {
    Stop,
    Length,
    ToolCalls,
    ContentFilter,
    /// Provider-specific reason passed through verbatim.
    Other(String),
}

/// Token usage accounting.
///
/// Always present on a transformed [`Response`]; adapters zero-fill the fields
/// when the provider omits them.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn new(prompt_tokens: u64, completion_tokens: u64) -> Self {
        Self {
            prompt_tokens,
            completion_tokens,
            total_tokens: prompt_tokens + completion_tokens,
        }
    }
}

/// One alternative completion within a [`Response`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Choice {
    /// Position within the response; streaming deltas carry the same index.
    pub index: usize,
    pub message: Message,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
}

/// Aggregated chat response returned by a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Response {
    /// Upstream response identifier, when reported.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    /// Effective model identifier reported by the provider.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
    /// Ordered alternatives; index 0 is the primary completion.
    pub choices: Vec<Choice>,
    /// Token accounting, zero-filled when the provider omitted it.
    pub usage: Usage,
}

impl Response {
    /// Convenience accessor for the primary completion's text content.
    pub fn content(&self) -> Option<&str> {
        self.choices.first().and_then(|c| c.message.content.as_deref())
    }

    /// Convenience accessor for the primary completion's tool calls.
    pub fn tool_calls(&self) -> &[ToolCall] {
        self.choices
            .first()
            .and_then(|c| c.message.tool_calls.as_deref())
            .unwrap_or(&[])
    }
}

/// Incremental tool-call fragment carried by a [`Delta`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ToolCallDelta {
    /// Tool-call slot within the message being assembled.
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Fragment appended to the JSON arguments string.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments_fragment: Option<String>,
}

/// One incremental fragment of a streaming response.
///
/// Concatenating the `content` fields of every delta for a choice index yields
/// exactly the `content` of the equivalent non-streaming [`Response`].
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Delta {
    /// Choice index this fragment belongs to.
    #[serde(default)]
    pub index: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<Role>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallDelta>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<FinishReason>,
    /// Usage snapshot, typically attached to the final fragment.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl Delta {
    /// Text-only fragment for the given choice index.
    pub fn content_fragment(index: usize, text: impl Into<String>) -> Self {
        Self {
            index,
            content: Some(text.into()),
            ..Self::default()
        }
    }
}

/// Item delivered on a streaming channel.
///
/// Failures after the stream opened are delivered in-band as the terminal
/// [`StreamItem::Error`]; the channel closing is the end-of-stream sentinel.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamItem {
    Delta(Delta),
    Error(ErrorRecord),
}

impl StreamItem {
    /// Returns the delta when this item carries one.
    pub fn delta(&self) -> Option<&Delta> {
        match self {
            StreamItem::Delta(delta) => Some(delta),
            StreamItem::Error(_) => None,
        }
    }
}

/// Embeddings request following the same request→wire-body pattern as chat.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EmbeddingsRequest {
    #[serde(default)]
    pub model: String,
    /// Input texts embedded in order.
    pub input: Vec<String>,
}

/// Single embedding vector paired with its input index.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Embedding {
    pub embedding: Vec<f32>,
    pub index: usize,
}

/// Reduced response shape for embeddings endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmbeddingsResponse {
    pub data: Vec<Embedding>,
    pub usage: Usage,
}

/// Per-token pricing reported by [`crate::adapter::ProviderAdapter::cost_per_token`].
///
/// Unknown models report zero cost instead of failing.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct CostRates {
    /// USD per input token.
    pub input: f64,
    /// USD per output token.
    pub output: f64,
}

/// Capability descriptor reported by each adapter.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct AdapterCapabilities {
    pub supports_streaming: bool,
    pub supports_tools: bool,
    pub supports_embeddings: bool,
}

/// Map alias used for pass-through context on error records.
pub type ContextMap = HashMap<String, Value>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tool_choice_accepts_any_as_required_alias() {
        let required: ToolChoice = serde_json::from_str("\"required\"").expect("required");
        let any: ToolChoice = serde_json::from_str("\"any\"").expect("any");
        assert_eq!(required, ToolChoice::Required);
        assert_eq!(any, ToolChoice::Required);
    }

    #[test]
    fn message_constructors_fill_expected_fields() {
        let tool = Message::tool_result("call_1", "{\"ok\":true}");
        assert_eq!(tool.role, Role::Tool);
        assert_eq!(tool.tool_call_id.as_deref(), Some("call_1"));
        assert_eq!(tool.content.as_deref(), Some("{\"ok\":true}"));

        let user = Message::user("hi");
        assert!(user.tool_call_id.is_none());
        assert!(user.tool_calls.is_none());
    }

    #[test]
    fn usage_new_sums_totals() {
        let usage = Usage::new(12, 30);
        assert_eq!(usage.total_tokens, 42);
    }

    #[test]
    fn response_accessors_read_primary_choice() {
        let response = Response {
            id: Some("resp_1".to_string()),
            model: Some("test-model".to_string()),
            choices: vec![Choice {
                index: 0,
                message: Message {
                    role: Role::Assistant,
                    content: Some("hello".to_string()),
                    tool_calls: Some(vec![ToolCall::function("c1", "lookup", "{}")]),
                    tool_call_id: None,
                    reasoning_content: None,
                    thinking_blocks: None,
                },
                finish_reason: Some(FinishReason::Stop),
            }],
            usage: Usage::default(),
        };

        assert_eq!(response.content(), Some("hello"));
        assert_eq!(response.tool_calls().len(), 1);
        assert_eq!(response.tool_calls()[0].function.name, "lookup");
    }

    #[test]
    fn tool_call_serializes_type_tag() {
        let call = ToolCall::function("c1", "get_weather", "{\"location\":\"Paris\"}");
        let value = serde_json::to_value(&call).expect("serialize");
        assert_eq!(value["type"], "function");
        assert_eq!(value["function"]["arguments"], "{\"location\":\"Paris\"}");
    }
}
