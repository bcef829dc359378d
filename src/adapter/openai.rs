//! OpenAI chat-completions adapter.
//!
//! Also hosts the shared wire mapping reused by the OpenAI-compatible family
//! (Mistral, Azure, OpenRouter): those adapters call into the builders and
//! parsers here and only override vendor deviations.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::adapter::{ProviderAdapter, Sealed, value_to_arguments};
use crate::config::ProviderConfig;
use crate::error::{
    ErrorKind, ErrorRecord, extract_model_identifier, looks_like_quota_error,
};
use crate::http::HttpRequest;
use crate::types::{
    AdapterCapabilities, Choice, CompletionRequest, CostRates, Delta, Embedding,
    EmbeddingsRequest, EmbeddingsResponse, FinishReason, Message, Response, Role, ToolCall,
    ToolCallDelta, ToolChoice, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.openai.com/v1";

/// OpenAI Chat Completions API（/v1/chat/completions）
pub struct OpenAiAdapter;

impl Sealed for OpenAiAdapter {}

impl ProviderAdapter for OpenAiAdapter {
    fn name(&self) -> &'static str {
        "openai"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_streaming: true,
            supports_tools: true,
            supports_embeddings: true,
        }
    }

    fn supports_reasoning(&self, model: &str) -> bool {
        model.starts_with("o1")
            || model.starts_with("o3")
            || model.starts_with("o4")
            || model.starts_with("gpt-5")
    }

    fn cost_per_token(&self, model: &str) -> CostRates {
        match model {
            "gpt-4o" => CostRates { input: 2.5e-6, output: 10.0e-6 },
            "gpt-4o-mini" => CostRates { input: 0.15e-6, output: 0.6e-6 },
            "gpt-4.1" => CostRates { input: 2.0e-6, output: 8.0e-6 },
            "gpt-4.1-mini" => CostRates { input: 0.4e-6, output: 1.6e-6 },
            "o3" => CostRates { input: 2.0e-6, output: 8.0e-6 },
            "o4-mini" => CostRates { input: 1.1e-6, output: 4.4e-6 },
            _ => CostRates::default(),
        }
    }

    fn transform_request(
        &self,
        request: &CompletionRequest,
        config: &ProviderConfig,
        stream: bool,
    ) -> Result<Value, ErrorRecord> {
        let model = config.resolve_model(&request.model)?;
        build_chat_body(self.name(), request, model, stream, "max_completion_tokens")
    }

    fn request_parts(
        &self,
        request: &CompletionRequest,
        config: &ProviderConfig,
        stream: bool,
    ) -> Result<HttpRequest, ErrorRecord> {
        let body = self.transform_request(request, config, stream)?;
        let url = format!("{}/chat/completions", config.base_url_or(DEFAULT_BASE_URL));
        build_bearer_request(self.name(), config, url, &body)
    }

    fn transform_response(&self, body: &str) -> Result<Response, ErrorRecord> {
        parse_chat_response(self.name(), body)
    }

    fn transform_chunk(&self, frame: &str) -> Result<Option<Delta>, ErrorRecord> {
        parse_chat_chunk(self.name(), frame)
    }

    fn classify_error(&self, status: u16, body: &str, retry_after: Option<u64>) -> ErrorRecord {
        classify_openai_error(self.name(), status, body, retry_after)
    }

    fn embeddings_parts(
        &self,
        request: &EmbeddingsRequest,
        config: &ProviderConfig,
    ) -> Result<HttpRequest, ErrorRecord> {
        let model = config.resolve_model(&request.model)?;
        let body = build_embeddings_body(request, model);
        let url = format!("{}/embeddings", config.base_url_or(DEFAULT_BASE_URL));
        build_bearer_request(self.name(), config, url, &body)
    }

    fn transform_embeddings_response(&self, body: &str) -> Result<EmbeddingsResponse, ErrorRecord> {
        parse_embeddings_response(self.name(), body)
    }
}

/// 带 Bearer 鉴权的 JSON POST 请求 openai 家族共用
pub(crate) fn build_bearer_request(
    provider: &'static str,
    config: &ProviderConfig,
    url: String,
    body: &Value,
) -> Result<HttpRequest, ErrorRecord> {
    let api_key = config.api_key().map_err(|err| err.for_provider(provider))?;
    let payload = serde_json::to_vec(body).map_err(|err| {
        ErrorRecord::invalid_request(provider, format!("failed to serialize request: {err}"))
    })?;
    let mut request = HttpRequest::post_json(url, payload)
        .with_header("Authorization", format!("Bearer {api_key}"))
        .with_header("Accept", "application/json");
    // 组织/项目头按需透传
    if let Some(org) = config.extra_str("organization") {
        request = request.with_header("OpenAI-Organization", org);
    }
    if let Some(project) = config.extra_str("project") {
        request = request.with_header("OpenAI-Project", project);
    }
    Ok(request)
}

/// 构建 chat/completions 请求体 兼容家族通过 max_tokens_field 控制字段名差异
pub(crate) fn build_chat_body(
    provider: &'static str,
    request: &CompletionRequest,
    model: &str,
    stream: bool,
    max_tokens_field: &str,
) -> Result<Value, ErrorRecord> {
    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(model.to_string()));
    body.insert(
        "messages".to_string(),
        Value::Array(convert_messages(provider, &request.messages)?),
    );

    if let Some(temperature) = request.temperature {
        body.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = request.top_p {
        body.insert("top_p".to_string(), Value::from(top_p));
    }
    if let Some(max_tokens) = request.max_tokens {
        body.insert(max_tokens_field.to_string(), Value::from(max_tokens));
    }
    if !request.stop.is_empty() {
        body.insert("stop".to_string(), json!(request.stop));
    }

    if let Some(effort) = request.reasoning_effort {
        body.insert(
            "reasoning_effort".to_string(),
            Value::String(effort.as_str().to_string()),
        );
    }
    // thinking 的 token 预算是 Anthropic 式概念 OpenAI 协议没有对应字段 这里不透传

    if !request.tools.is_empty() {
        let tools = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "type": "function",
                    "function": {
                        "name": tool.name,
                        "description": tool.description,
                        "parameters": tool.parameters,
                    }
                })
            })
            .collect::<Vec<_>>();
        body.insert("tools".to_string(), Value::Array(tools));
    }
    if let Some(choice) = &request.tool_choice {
        body.insert("tool_choice".to_string(), convert_tool_choice(choice));
    }

    body.insert("stream".to_string(), Value::Bool(stream));
    if stream {
        // 让终帧携带 usage 以维持 usage 永不缺省的约定
        body.insert("stream_options".to_string(), json!({ "include_usage": true }));
    }

    Ok(Value::Object(body))
}

fn convert_messages(
    provider: &'static str,
    messages: &[Message],
) -> Result<Vec<Value>, ErrorRecord> {
    messages
        .iter()
        .map(|message| convert_message(provider, message))
        .collect()
}

fn convert_message(provider: &'static str, message: &Message) -> Result<Value, ErrorRecord> {
    let mut obj = Map::new();
    obj.insert(
        "role".to_string(),
        Value::String(message.role.as_str().to_string()),
    );

    if message.role == Role::Tool {
        let call_id = message.tool_call_id.as_ref().ok_or_else(|| {
            ErrorRecord::invalid_request(provider, "tool message missing tool_call_id")
        })?;
        obj.insert("tool_call_id".to_string(), Value::String(call_id.clone()));
        obj.insert(
            "content".to_string(),
            Value::String(message.content.clone().unwrap_or_default()),
        );
        return Ok(Value::Object(obj));
    }

    obj.insert(
        "content".to_string(),
        match &message.content {
            Some(text) => Value::String(text.clone()),
            None => Value::Null,
        },
    );

    if let Some(calls) = &message.tool_calls {
        let wire_calls = calls
            .iter()
            .map(|call| {
                json!({
                    "id": call.id,
                    "type": "function",
                    "function": {
                        "name": call.function.name,
                        "arguments": call.function.arguments,
                    }
                })
            })
            .collect::<Vec<_>>();
        obj.insert("tool_calls".to_string(), Value::Array(wire_calls));
    }

    Ok(Value::Object(obj))
}

pub(crate) fn convert_tool_choice(choice: &ToolChoice) -> Value {
    match choice {
        ToolChoice::Auto => Value::String("auto".to_string()),
        ToolChoice::None => Value::String("none".to_string()),
        // required 与 any 同义 这里统一输出 required
        ToolChoice::Required => Value::String("required".to_string()),
        ToolChoice::Tool { name } => json!({
            "type": "function",
            "function": { "name": name }
        }),
    }
}

pub(crate) fn convert_finish_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        "tool_calls" | "function_call" => FinishReason::ToolCalls,
        "content_filter" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// 响应与流式 chunk 的 wire 结构
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub(crate) struct WireChatResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    choices: Vec<WireChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireChoice {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessage {
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    content: Option<String>,
    /// DeepSeek/OpenRouter 风格的推理输出
    #[serde(default)]
    reasoning_content: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    function: Option<WireFunction>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireFunction {
    #[serde(default)]
    name: Option<String>,
    /// 兼容层偶见返回原生对象 统一转回 JSON 字符串
    #[serde(default)]
    arguments: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireUsage {
    #[serde(default)]
    prompt_tokens: Option<u64>,
    #[serde(default)]
    completion_tokens: Option<u64>,
    #[serde(default)]
    total_tokens: Option<u64>,
}

impl WireUsage {
    fn into_usage(self) -> Usage {
        let prompt = self.prompt_tokens.unwrap_or(0);
        let completion = self.completion_tokens.unwrap_or(0);
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: self.total_tokens.unwrap_or(prompt + completion),
        }
    }
}

pub(crate) fn parse_chat_response(
    provider: &'static str,
    body: &str,
) -> Result<Response, ErrorRecord> {
    let wire: WireChatResponse = serde_json::from_str(body).map_err(|err| {
        ErrorRecord::invalid_response(provider, format!("failed to parse response: {err}"))
    })?;

    let mut choices = Vec::new();
    for (position, choice) in wire.choices.into_iter().enumerate() {
        let message = choice.message.unwrap_or(WireMessage {
            role: None,
            content: None,
            reasoning_content: None,
            tool_calls: None,
        });
        let tool_calls = convert_wire_tool_calls(message.tool_calls);
        choices.push(Choice {
            index: choice.index.unwrap_or(position),
            message: Message {
                role: Role::Assistant,
                content: message.content,
                tool_calls,
                tool_call_id: None,
                reasoning_content: message.reasoning_content,
                thinking_blocks: None,
            },
            finish_reason: choice.finish_reason.as_deref().map(convert_finish_reason),
        });
    }

    Ok(Response {
        id: wire.id,
        model: wire.model,
        choices,
        usage: wire.usage.map(WireUsage::into_usage).unwrap_or_default(),
    })
}

fn convert_wire_tool_calls(calls: Option<Vec<WireToolCall>>) -> Option<Vec<ToolCall>> {
    let calls = calls?;
    if calls.is_empty() {
        return None;
    }
    let converted = calls
        .into_iter()
        .map(|call| {
            let function = call.function.unwrap_or(WireFunction {
                name: None,
                arguments: None,
            });
            ToolCall::function(
                call.id.unwrap_or_default(),
                function.name.unwrap_or_default(),
                function
                    .arguments
                    .as_ref()
                    .map(value_to_arguments)
                    .unwrap_or_else(|| "{}".to_string()),
            )
        })
        .collect();
    Some(converted)
}

#[derive(Debug, Deserialize)]
struct WireChunk {
    #[serde(default)]
    choices: Vec<WireChunkChoice>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireChunkChoice {
    #[serde(default)]
    index: Option<usize>,
    #[serde(default)]
    delta: Option<WireMessage>,
    #[serde(default)]
    finish_reason: Option<String>,
}

pub(crate) fn parse_chat_chunk(
    provider: &'static str,
    frame: &str,
) -> Result<Option<Delta>, ErrorRecord> {
    let wire: WireChunk = serde_json::from_str(frame).map_err(|err| {
        ErrorRecord::new(
            ErrorKind::StreamingError,
            provider,
            format!("failed to parse stream chunk: {err}"),
        )
    })?;

    let usage = wire.usage.map(WireUsage::into_usage);

    let Some(choice) = wire.choices.into_iter().next() else {
        // usage-only 终帧仍需向下游转发 其余空帧直接丢弃
        return Ok(usage.map(|usage| Delta {
            usage: Some(usage),
            ..Delta::default()
        }));
    };

    let delta = choice.delta.unwrap_or(WireMessage {
        role: None,
        content: None,
        reasoning_content: None,
        tool_calls: None,
    });

    let tool_calls = delta
        .tool_calls
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(position, call)| {
            let function = call.function.unwrap_or(WireFunction {
                name: None,
                arguments: None,
            });
            ToolCallDelta {
                index: call.index.unwrap_or(position),
                id: call.id,
                name: function.name,
                arguments_fragment: function.arguments.as_ref().map(value_to_arguments),
            }
        })
        .collect::<Vec<_>>();

    let role = delta.role.as_deref().and_then(|role| match role {
        "assistant" => Some(Role::Assistant),
        _ => None,
    });

    Ok(Some(Delta {
        index: choice.index.unwrap_or(0),
        role,
        content: delta.content,
        reasoning_content: delta.reasoning_content,
        tool_calls,
        finish_reason: choice.finish_reason.as_deref().map(convert_finish_reason),
        usage,
    }))
}

// ---------------------------------------------------------------------------
// 错误分类
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    #[serde(default)]
    error: Option<WireErrorDetail>,
}

#[derive(Debug, Deserialize)]
struct WireErrorDetail {
    #[serde(default)]
    message: Option<String>,
    #[serde(default)]
    r#type: Option<String>,
    #[serde(default)]
    code: Option<Value>,
}

pub(crate) fn classify_openai_error(
    provider: &'static str,
    status: u16,
    body: &str,
    retry_after: Option<u64>,
) -> ErrorRecord {
    let (message, code) = match serde_json::from_str::<WireErrorBody>(body) {
        Ok(WireErrorBody { error: Some(detail) }) => {
            let code = detail
                .code
                .as_ref()
                .and_then(|value| value.as_str().map(str::to_string))
                .or(detail.r#type);
            (
                detail.message.unwrap_or_else(|| "unknown error".to_string()),
                code,
            )
        }
        _ => (format!("status {status}: {body}"), None),
    };
    let code_hint = code.as_deref();

    let kind = match status {
        400 | 422 => {
            if matches!(code_hint, Some(code) if code.contains("content_policy") || code.contains("content_filter"))
            {
                ErrorKind::ContentFilter
            } else {
                ErrorKind::InvalidRequest
            }
        }
        401 => ErrorKind::AuthenticationError,
        403 => ErrorKind::AuthorizationError,
        404 => ErrorKind::ModelNotFound,
        408 => ErrorKind::Timeout,
        429 => {
            if looks_like_quota_error(code_hint, &message) {
                ErrorKind::QuotaExceeded
            } else {
                ErrorKind::RateLimit
            }
        }
        code if (500..600).contains(&code) => ErrorKind::ServerError,
        _ => ErrorKind::ProviderError,
    };

    let mut record = ErrorRecord::new(kind, provider, message.clone()).with_http_status(status);
    if let Some(code) = code {
        record = record.with_provider_code(code);
    }
    if let Some(seconds) = retry_after {
        record = record.with_retry_after(seconds);
    }
    if kind == ErrorKind::ModelNotFound {
        if let Some(model) = extract_model_identifier(&message) {
            record = record.with_context("model", Value::String(model));
        }
    }
    record
}

// ---------------------------------------------------------------------------
// embeddings
// ---------------------------------------------------------------------------

pub(crate) fn build_embeddings_body(request: &EmbeddingsRequest, model: &str) -> Value {
    json!({
        "model": model,
        "input": request.input,
    })
}

#[derive(Debug, Deserialize)]
struct WireEmbeddingsResponse {
    #[serde(default)]
    data: Vec<WireEmbedding>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireEmbedding {
    embedding: Vec<f32>,
    #[serde(default)]
    index: Option<usize>,
}

pub(crate) fn parse_embeddings_response(
    provider: &'static str,
    body: &str,
) -> Result<EmbeddingsResponse, ErrorRecord> {
    let wire: WireEmbeddingsResponse = serde_json::from_str(body).map_err(|err| {
        ErrorRecord::invalid_response(
            provider,
            format!("failed to parse embeddings response: {err}"),
        )
    })?;

    let data = wire
        .data
        .into_iter()
        .enumerate()
        .map(|(position, item)| Embedding {
            embedding: item.embedding,
            index: item.index.unwrap_or(position),
        })
        .collect();

    Ok(EmbeddingsResponse {
        data,
        usage: wire.usage.map(WireUsage::into_usage).unwrap_or_default(),
    })
}
