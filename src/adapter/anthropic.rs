//! Anthropic Messages adapter.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};

use crate::adapter::{ProviderAdapter, Sealed, arguments_to_value, value_to_arguments};
use crate::config::ProviderConfig;
use crate::error::{ErrorKind, ErrorRecord, extract_model_identifier};
use crate::http::HttpRequest;
use crate::types::{
    AdapterCapabilities, Choice, CompletionRequest, CostRates, Delta, FinishReason, Message,
    ReasoningEffort, Response, Role, ThinkingBlock, ToolCall, ToolCallDelta, ToolChoice, Usage,
};

const DEFAULT_BASE_URL: &str = "https://api.anthropic.com";
const DEFAULT_VERSION: &str = "2023-06-01";
/// Messages API 要求显式 max_tokens 请求未给出时的兜底值
const DEFAULT_MAX_TOKENS: u32 = 4096;

/// Anthropic Messages API（/v1/messages）
pub struct AnthropicAdapter;

impl Sealed for AnthropicAdapter {}

impl ProviderAdapter for AnthropicAdapter {
    fn name(&self) -> &'static str {
        "anthropic"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_streaming: true,
            supports_tools: true,
            supports_embeddings: false,
        }
    }

    fn supports_reasoning(&self, model: &str) -> bool {
        model.contains("3-7") || model.contains("-4")
    }

    fn cost_per_token(&self, model: &str) -> CostRates {
        if model.contains("opus") {
            CostRates { input: 15.0e-6, output: 75.0e-6 }
        } else if model.contains("sonnet") {
            CostRates { input: 3.0e-6, output: 15.0e-6 }
        } else if model.contains("haiku") {
            CostRates { input: 0.8e-6, output: 4.0e-6 }
        } else {
            CostRates::default()
        }
    }

    fn transform_request(
        &self,
        request: &CompletionRequest,
        config: &ProviderConfig,
        stream: bool,
    ) -> Result<Value, ErrorRecord> {
        let model = config.resolve_model(&request.model)?;
        build_messages_body(request, model, stream)
    }

    fn request_parts(
        &self,
        request: &CompletionRequest,
        config: &ProviderConfig,
        stream: bool,
    ) -> Result<HttpRequest, ErrorRecord> {
        let body = self.transform_request(request, config, stream)?;
        let payload = serde_json::to_vec(&body).map_err(|err| {
            ErrorRecord::invalid_request(self.name(), format!("failed to serialize request: {err}"))
        })?;
        let api_key = config.api_key()?;
        let url = endpoint(config);

        let mut parts = HttpRequest::post_json(url, payload)
            .with_header("x-api-key", api_key)
            .with_header("Accept", "application/json")
            .with_header(
                "anthropic-version",
                config.extra_str("version").unwrap_or(DEFAULT_VERSION),
            );
        if let Some(beta) = config.extra_str("beta") {
            parts = parts.with_header("anthropic-beta", beta);
        }
        Ok(parts)
    }

    fn transform_response(&self, body: &str) -> Result<Response, ErrorRecord> {
        let wire: WireMessageResponse = serde_json::from_str(body).map_err(|err| {
            ErrorRecord::invalid_response(self.name(), format!("failed to parse response: {err}"))
        })?;
        map_response(wire)
    }

    fn transform_chunk(&self, frame: &str) -> Result<Option<Delta>, ErrorRecord> {
        parse_stream_event(self.name(), frame)
    }

    fn classify_error(&self, status: u16, body: &str, retry_after: Option<u64>) -> ErrorRecord {
        classify_anthropic_error(self.name(), status, body, retry_after)
    }
}

fn endpoint(config: &ProviderConfig) -> String {
    let base = config.base_url_or(DEFAULT_BASE_URL);
    if base.ends_with("/v1") {
        format!("{base}/messages")
    } else {
        format!("{base}/v1/messages")
    }
}

/// 构建 Messages 请求体
fn build_messages_body(
    request: &CompletionRequest,
    model: &str,
    stream: bool,
) -> Result<Value, ErrorRecord> {
    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(model.to_string()));

    // 1. system 消息折叠为顶层 system 字段 其余进入 messages
    let mut system_texts = Vec::new();
    let mut messages = Vec::new();
    for message in &request.messages {
        match message.role {
            Role::System => {
                if let Some(text) = &message.content {
                    system_texts.push(text.clone());
                }
            }
            Role::Tool => messages.push(convert_tool_result(message)?),
            Role::User | Role::Assistant => messages.push(convert_message(message)?),
        }
    }

    if messages.is_empty() {
        return Err(ErrorRecord::invalid_request(
            "anthropic",
            "request requires at least one user or assistant message",
        ));
    }
    body.insert("messages".to_string(), Value::Array(messages));

    if !system_texts.is_empty() {
        body.insert(
            "system".to_string(),
            Value::String(system_texts.join("\n\n")),
        );
    }

    // 2. 采样与生成控制参数
    body.insert(
        "max_tokens".to_string(),
        Value::from(request.max_tokens.unwrap_or(DEFAULT_MAX_TOKENS)),
    );
    if let Some(temperature) = request.temperature {
        body.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = request.top_p {
        body.insert("top_p".to_string(), Value::from(top_p));
    }
    if !request.stop.is_empty() {
        body.insert("stop_sequences".to_string(), json!(request.stop));
    }

    // 3. thinking 配置 effort 预设换算为 token 预算
    if let Some(thinking) = build_thinking(request) {
        body.insert("thinking".to_string(), thinking);
    }

    // 4. tools 与 tool_choice
    if !request.tools.is_empty() {
        let tools = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "name": tool.name,
                    "description": tool.description,
                    "input_schema": tool.parameters,
                })
            })
            .collect::<Vec<_>>();
        body.insert("tools".to_string(), Value::Array(tools));
    }
    if let Some(choice) = &request.tool_choice {
        if let Some(value) = convert_tool_choice(choice) {
            body.insert("tool_choice".to_string(), value);
        }
    }

    body.insert("stream".to_string(), Value::Bool(stream));
    Ok(Value::Object(body))
}

fn build_thinking(request: &CompletionRequest) -> Option<Value> {
    if let Some(thinking) = &request.thinking {
        if !thinking.enabled {
            return None;
        }
        return Some(json!({
            "type": "enabled",
            "budget_tokens": thinking.budget_tokens.unwrap_or(2048),
        }));
    }
    // effort 预设没有官方字段 按惯例折算预算
    request.reasoning_effort.map(|effort| {
        let budget = match effort {
            ReasoningEffort::Low => 1024,
            ReasoningEffort::Medium => 2048,
            ReasoningEffort::High => 4096,
        };
        json!({ "type": "enabled", "budget_tokens": budget })
    })
}

fn convert_message(message: &Message) -> Result<Value, ErrorRecord> {
    let mut blocks = Vec::new();

    // 已签名的 thinking 块必须原样回放在其它内容之前
    if let Some(thinking_blocks) = &message.thinking_blocks {
        for block in thinking_blocks {
            blocks.push(json!({
                "type": "thinking",
                "thinking": block.text,
                "signature": block.signature,
            }));
        }
    }

    if let Some(text) = &message.content {
        if !text.is_empty() {
            blocks.push(json!({ "type": "text", "text": text }));
        }
    }

    if let Some(calls) = &message.tool_calls {
        for call in calls {
            blocks.push(json!({
                "type": "tool_use",
                "id": call.id,
                "name": call.function.name,
                "input": arguments_to_value("anthropic", &call.function.arguments)?,
            }));
        }
    }

    if blocks.is_empty() {
        return Err(ErrorRecord::invalid_request(
            "anthropic",
            "message must carry content, tool calls, or thinking blocks",
        ));
    }

    Ok(json!({
        "role": message.role.as_str(),
        "content": blocks,
    }))
}

/// tool 角色消息转换为携带 tool_result 块的 user 消息
fn convert_tool_result(message: &Message) -> Result<Value, ErrorRecord> {
    let call_id = message.tool_call_id.as_ref().ok_or_else(|| {
        ErrorRecord::invalid_request("anthropic", "tool message missing tool_call_id")
    })?;
    Ok(json!({
        "role": "user",
        "content": [{
            "type": "tool_result",
            "tool_use_id": call_id,
            "content": message.content.clone().unwrap_or_default(),
        }],
    }))
}

fn convert_tool_choice(choice: &ToolChoice) -> Option<Value> {
    match choice {
        ToolChoice::Auto => Some(json!({ "type": "auto" })),
        // required 与 any 同义 Messages API 的词汇是 any
        ToolChoice::Required => Some(json!({ "type": "any" })),
        ToolChoice::Tool { name } => Some(json!({ "type": "tool", "name": name })),
        // Messages API 没有显式 none 不设置 tool_choice 即可
        ToolChoice::None => None,
    }
}

fn convert_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "refusal" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// wire 结构
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireMessageResponse {
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    content: Vec<WireContentBlock>,
    #[serde(default)]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireContentBlock {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    signature: Option<String>,
    #[serde(default)]
    id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireUsage {
    #[serde(default)]
    input_tokens: Option<u64>,
    #[serde(default)]
    output_tokens: Option<u64>,
}

impl WireUsage {
    fn into_usage(self) -> Usage {
        Usage::new(
            self.input_tokens.unwrap_or(0),
            self.output_tokens.unwrap_or(0),
        )
    }
}

fn map_response(wire: WireMessageResponse) -> Result<Response, ErrorRecord> {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut thinking_blocks = Vec::new();

    for block in &wire.content {
        match block.kind.as_str() {
            "text" => {
                if let Some(fragment) = &block.text {
                    text.push_str(fragment);
                }
            }
            "tool_use" => {
                tool_calls.push(ToolCall::function(
                    block.id.clone().unwrap_or_default(),
                    block.name.clone().unwrap_or_default(),
                    block
                        .input
                        .as_ref()
                        .map(value_to_arguments)
                        .unwrap_or_else(|| "{}".to_string()),
                ));
            }
            "thinking" | "redacted_thinking" => {
                thinking_blocks.push(ThinkingBlock {
                    kind: block.kind.clone(),
                    text: block.thinking.clone().unwrap_or_default(),
                    signature: block.signature.clone(),
                });
            }
            // 其余块类型（文档等）没有对应的规范字段 忽略
            _ => {}
        }
    }

    let message = Message {
        role: Role::Assistant,
        content: if text.is_empty() { None } else { Some(text) },
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
        tool_call_id: None,
        reasoning_content: None,
        thinking_blocks: if thinking_blocks.is_empty() {
            None
        } else {
            Some(thinking_blocks)
        },
    };

    Ok(Response {
        id: wire.id,
        model: wire.model,
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason: wire.stop_reason.as_deref().map(convert_stop_reason),
        }],
        usage: wire.usage.map(WireUsage::into_usage).unwrap_or_default(),
    })
}

// ---------------------------------------------------------------------------
// 流式事件
// ---------------------------------------------------------------------------

fn parse_stream_event(
    provider: &'static str,
    frame: &str,
) -> Result<Option<Delta>, ErrorRecord> {
    let event: Value = serde_json::from_str(frame).map_err(|err| {
        ErrorRecord::new(
            ErrorKind::StreamingError,
            provider,
            format!("failed to parse stream event: {err}"),
        )
    })?;

    let kind = event.get("type").and_then(Value::as_str).unwrap_or_default();
    match kind {
        "message_start" => {
            let usage = event
                .pointer("/message/usage")
                .and_then(|value| serde_json::from_value::<WireUsage>(value.clone()).ok())
                .map(WireUsage::into_usage);
            Ok(Some(Delta {
                role: Some(Role::Assistant),
                usage,
                ..Delta::default()
            }))
        }
        "content_block_start" => {
            let index = block_index(&event);
            match event.pointer("/content_block/type").and_then(Value::as_str) {
                Some("tool_use") => Ok(Some(Delta {
                    tool_calls: vec![ToolCallDelta {
                        index,
                        id: event
                            .pointer("/content_block/id")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        name: event
                            .pointer("/content_block/name")
                            .and_then(Value::as_str)
                            .map(str::to_string),
                        arguments_fragment: None,
                    }],
                    ..Delta::default()
                })),
                // text/thinking 块的开头不携带内容
                _ => Ok(None),
            }
        }
        "content_block_delta" => {
            let index = block_index(&event);
            match event.pointer("/delta/type").and_then(Value::as_str) {
                Some("text_delta") => Ok(event
                    .pointer("/delta/text")
                    .and_then(Value::as_str)
                    .map(|text| Delta::content_fragment(0, text))),
                Some("thinking_delta") => Ok(event
                    .pointer("/delta/thinking")
                    .and_then(Value::as_str)
                    .map(|text| Delta {
                        reasoning_content: Some(text.to_string()),
                        ..Delta::default()
                    })),
                Some("input_json_delta") => Ok(event
                    .pointer("/delta/partial_json")
                    .and_then(Value::as_str)
                    .map(|fragment| Delta {
                        tool_calls: vec![ToolCallDelta {
                            index,
                            id: None,
                            name: None,
                            arguments_fragment: Some(fragment.to_string()),
                        }],
                        ..Delta::default()
                    })),
                // signature_delta 等对调用方不可见
                _ => Ok(None),
            }
        }
        "message_delta" => {
            let finish_reason = event
                .pointer("/delta/stop_reason")
                .and_then(Value::as_str)
                .map(convert_stop_reason);
            let usage = event
                .get("usage")
                .and_then(|value| serde_json::from_value::<WireUsage>(value.clone()).ok())
                .map(WireUsage::into_usage);
            if finish_reason.is_none() && usage.is_none() {
                return Ok(None);
            }
            Ok(Some(Delta {
                finish_reason,
                usage,
                ..Delta::default()
            }))
        }
        // ping/content_block_stop/message_stop 均为纯元数据帧
        _ => Ok(None),
    }
}

/// content block 序号直接作为工具调用槽位 同一块的 start 与 delta 序号一致
fn block_index(event: &Value) -> usize {
    event
        .get("index")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize
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
    r#type: Option<String>,
    #[serde(default)]
    message: Option<String>,
}

fn classify_anthropic_error(
    provider: &'static str,
    status: u16,
    body: &str,
    retry_after: Option<u64>,
) -> ErrorRecord {
    let (message, code) = match serde_json::from_str::<WireErrorBody>(body) {
        Ok(WireErrorBody { error: Some(detail) }) => (
            detail.message.unwrap_or_else(|| "unknown error".to_string()),
            detail.r#type,
        ),
        _ => (format!("status {status}: {body}"), None),
    };

    let kind = match code.as_deref() {
        Some("authentication_error") => ErrorKind::AuthenticationError,
        Some("permission_error") => ErrorKind::AuthorizationError,
        Some("not_found_error") => ErrorKind::ModelNotFound,
        Some("rate_limit_error") => ErrorKind::RateLimit,
        Some("overloaded_error") => ErrorKind::ServerError,
        Some("invalid_request_error") => ErrorKind::InvalidRequest,
        Some("api_error") => ErrorKind::ServerError,
        _ => match status {
            400 => ErrorKind::InvalidRequest,
            401 => ErrorKind::AuthenticationError,
            403 => ErrorKind::AuthorizationError,
            404 => ErrorKind::ModelNotFound,
            429 => ErrorKind::RateLimit,
            code if (500..600).contains(&code) => ErrorKind::ServerError,
            _ => ErrorKind::ProviderError,
        },
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ProviderKind;
    use crate::config::Credential;
    use crate::types::{ThinkingConfig, ToolSpec};

    fn config() -> ProviderConfig {
        ProviderConfig::new(
            ProviderKind::Anthropic,
            Credential::ApiKey {
                key: "sk-ant".to_string(),
            },
        )
        .with_model("claude-sonnet-4-20250514")
    }

    /// system 消息折叠为顶层 system 字段
    #[test]
    fn system_message_is_hoisted_out_of_message_list() {
        let request = CompletionRequest {
            messages: vec![Message::system("X"), Message::user("Y")],
            ..CompletionRequest::default()
        };
        let body = AnthropicAdapter
            .transform_request(&request, &config(), false)
            .expect("body builds");

        assert_eq!(body["system"], json!("X"));
        let messages = body["messages"].as_array().expect("messages array");
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0]["role"], json!("user"));
        assert_eq!(messages[0]["content"][0]["text"], json!("Y"));
    }

    /// tool 角色消息转换为 user + tool_result 块
    #[test]
    fn tool_result_becomes_user_message_with_block() {
        let request = CompletionRequest {
            messages: vec![
                Message::user("weather?"),
                Message::tool_result("toolu_1", "{\"temp\":21}"),
            ],
            ..CompletionRequest::default()
        };
        let body = AnthropicAdapter
            .transform_request(&request, &config(), false)
            .expect("body builds");
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages[1]["role"], json!("user"));
        assert_eq!(messages[1]["content"][0]["type"], json!("tool_result"));
        assert_eq!(messages[1]["content"][0]["tool_use_id"], json!("toolu_1"));
    }

    /// 助手 tool_calls 序列化为 tool_use 块 参数转回对象
    #[test]
    fn assistant_tool_calls_map_to_tool_use_blocks() {
        let mut assistant = Message::assistant("");
        assistant.content = None;
        assistant.tool_calls = Some(vec![ToolCall::function(
            "toolu_1",
            "get_weather",
            "{\"location\":\"Paris\"}",
        )]);
        let request = CompletionRequest {
            messages: vec![Message::user("weather?"), assistant],
            ..CompletionRequest::default()
        };
        let body = AnthropicAdapter
            .transform_request(&request, &config(), false)
            .expect("body builds");
        let block = &body["messages"][1]["content"][0];
        assert_eq!(block["type"], json!("tool_use"));
        assert_eq!(block["input"], json!({"location": "Paris"}));
    }

    #[test]
    fn max_tokens_defaults_and_tool_choice_uses_any_vocabulary() {
        let request = CompletionRequest {
            messages: vec![Message::user("hi")],
            tools: vec![ToolSpec {
                name: "t".to_string(),
                description: None,
                parameters: json!({"type": "object"}),
            }],
            tool_choice: Some(ToolChoice::Required),
            ..CompletionRequest::default()
        };
        let body = AnthropicAdapter
            .transform_request(&request, &config(), false)
            .expect("body builds");
        assert_eq!(body["max_tokens"], json!(DEFAULT_MAX_TOKENS));
        assert_eq!(body["tool_choice"]["type"], json!("any"));
    }

    #[test]
    fn thinking_config_and_effort_both_produce_budgets() {
        let explicit = CompletionRequest {
            messages: vec![Message::user("hi")],
            thinking: Some(ThinkingConfig {
                enabled: true,
                budget_tokens: Some(9000),
            }),
            ..CompletionRequest::default()
        };
        let body = AnthropicAdapter
            .transform_request(&explicit, &config(), false)
            .expect("body builds");
        assert_eq!(body["thinking"]["budget_tokens"], json!(9000));

        let preset = CompletionRequest {
            messages: vec![Message::user("hi")],
            reasoning_effort: Some(ReasoningEffort::High),
            ..CompletionRequest::default()
        };
        let body = AnthropicAdapter
            .transform_request(&preset, &config(), false)
            .expect("body builds");
        assert_eq!(body["thinking"]["budget_tokens"], json!(4096));
    }

    #[test]
    fn response_maps_blocks_and_stop_reason() {
        let body = r#"{
            "id": "msg_1",
            "model": "claude-sonnet-4-20250514",
            "content": [
                {"type": "thinking", "thinking": "let me see", "signature": "sig"},
                {"type": "text", "text": "It is sunny."},
                {"type": "tool_use", "id": "toolu_1", "name": "get_weather", "input": {"location": "Paris"}}
            ],
            "stop_reason": "tool_use",
            "usage": {"input_tokens": 12, "output_tokens": 30}
        }"#;
        let response = AnthropicAdapter.transform_response(body).expect("parse");

        let choice = &response.choices[0];
        assert_eq!(choice.message.content.as_deref(), Some("It is sunny."));
        assert_eq!(choice.finish_reason, Some(FinishReason::ToolCalls));
        assert_eq!(
            choice.message.tool_calls.as_ref().unwrap()[0]
                .function
                .arguments,
            "{\"location\":\"Paris\"}"
        );
        let thinking = choice.message.thinking_blocks.as_ref().unwrap();
        assert_eq!(thinking[0].text, "let me see");
        assert_eq!(thinking[0].signature.as_deref(), Some("sig"));
        assert_eq!(response.usage.total_tokens, 42);
    }

    #[test]
    fn max_tokens_stop_reason_maps_to_length() {
        let body = r#"{"content":[{"type":"text","text":"truncated"}],"stop_reason":"max_tokens"}"#;
        let response = AnthropicAdapter.transform_response(body).expect("parse");
        assert_eq!(response.choices[0].finish_reason, Some(FinishReason::Length));
        assert_eq!(response.usage, Usage::default());
    }

    #[test]
    fn stream_events_map_to_deltas() {
        let text = AnthropicAdapter
            .transform_chunk(
                r#"{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Once"}}"#,
            )
            .expect("parse")
            .expect("delta");
        assert_eq!(text.content.as_deref(), Some("Once"));

        let tool_start = AnthropicAdapter
            .transform_chunk(
                r#"{"type":"content_block_start","index":1,"content_block":{"type":"tool_use","id":"toolu_1","name":"get_weather"}}"#,
            )
            .expect("parse")
            .expect("delta");
        assert_eq!(tool_start.tool_calls[0].id.as_deref(), Some("toolu_1"));
        assert_eq!(tool_start.tool_calls[0].index, 1);

        let arguments = AnthropicAdapter
            .transform_chunk(
                r#"{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{\"loc"}}"#,
            )
            .expect("parse")
            .expect("delta");
        assert_eq!(
            arguments.tool_calls[0].arguments_fragment.as_deref(),
            Some("{\"loc")
        );

        let finish = AnthropicAdapter
            .transform_chunk(
                r#"{"type":"message_delta","delta":{"stop_reason":"end_turn"},"usage":{"output_tokens":9}}"#,
            )
            .expect("parse")
            .expect("delta");
        assert_eq!(finish.finish_reason, Some(FinishReason::Stop));
        assert_eq!(finish.usage.unwrap().completion_tokens, 9);
    }

    #[test]
    fn metadata_events_are_dropped() {
        for frame in [
            r#"{"type":"ping"}"#,
            r#"{"type":"content_block_stop","index":0}"#,
            r#"{"type":"message_stop"}"#,
        ] {
            assert!(
                AnthropicAdapter.transform_chunk(frame).expect("parse").is_none(),
                "frame should be dropped: {frame}"
            );
        }
    }

    /// 错误分类表
    #[test]
    fn error_classification_covers_documented_statuses() {
        let auth = AnthropicAdapter.classify_error(
            401,
            r#"{"type":"error","error":{"type":"authentication_error","message":"invalid x-api-key"}}"#,
            None,
        );
        assert_eq!(auth.kind, ErrorKind::AuthenticationError);

        let forbidden = AnthropicAdapter.classify_error(
            403,
            r#"{"type":"error","error":{"type":"permission_error","message":"forbidden"}}"#,
            None,
        );
        assert_eq!(forbidden.kind, ErrorKind::AuthorizationError);

        let missing = AnthropicAdapter.classify_error(
            404,
            r#"{"type":"error","error":{"type":"not_found_error","message":"model `claude-bogus` not found"}}"#,
            None,
        );
        assert_eq!(missing.kind, ErrorKind::ModelNotFound);
        assert_eq!(missing.context["model"], json!("claude-bogus"));

        let limited = AnthropicAdapter.classify_error(
            429,
            r#"{"type":"error","error":{"type":"rate_limit_error","message":"slow down"}}"#,
            Some(60),
        );
        assert_eq!(limited.kind, ErrorKind::RateLimit);
        assert_eq!(limited.retry_after, Some(60));

        // overloaded_error 是可重试的服务端错误
        let overloaded = AnthropicAdapter.classify_error(
            529,
            r#"{"type":"error","error":{"type":"overloaded_error","message":"overloaded"}}"#,
            None,
        );
        assert_eq!(overloaded.kind, ErrorKind::ServerError);
        assert!(overloaded.recoverable);

        for status in [500u16, 502, 503, 504] {
            let err = AnthropicAdapter.classify_error(status, "boom", None);
            assert_eq!(err.kind, ErrorKind::ServerError, "status {status}");
        }
    }

    #[test]
    fn embeddings_are_gated_off() {
        let err = AnthropicAdapter
            .embeddings_parts(&crate::types::EmbeddingsRequest::default(), &config())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedFeature);
    }
}
