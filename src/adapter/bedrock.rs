//! AWS Bedrock Converse adapter.
//!
//! Speaks the Converse REST surface (`/model/{id}/converse` and
//! `/converse-stream`). The injected transport is expected to surface stream
//! events as one JSON object per frame; AWS event-stream unwrapping is a
//! transport concern, not a mapping concern.

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::adapter::{ProviderAdapter, Sealed, arguments_to_value, value_to_arguments};
use crate::config::ProviderConfig;
use crate::error::{ErrorKind, ErrorRecord};
use crate::http::HttpRequest;
use crate::types::{
    AdapterCapabilities, Choice, CompletionRequest, CostRates, Delta, FinishReason, Message,
    Response, Role, ThinkingBlock, ToolCall, ToolCallDelta, ToolChoice, Usage,
};

const DEFAULT_REGION: &str = "us-east-1";

/// AWS Bedrock Converse API
pub struct BedrockAdapter;

impl Sealed for BedrockAdapter {}

impl ProviderAdapter for BedrockAdapter {
    fn name(&self) -> &'static str {
        "bedrock"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_streaming: true,
            supports_tools: true,
            supports_embeddings: false,
        }
    }

    fn supports_reasoning(&self, model: &str) -> bool {
        (model.contains("claude") && (model.contains("3-7") || model.contains("-4")))
            || model.contains("deepseek")
    }

    fn cost_per_token(&self, model: &str) -> CostRates {
        if model.contains("claude") && model.contains("opus") {
            CostRates { input: 15.0e-6, output: 75.0e-6 }
        } else if model.contains("claude") && model.contains("sonnet") {
            CostRates { input: 3.0e-6, output: 15.0e-6 }
        } else if model.contains("claude") && model.contains("haiku") {
            CostRates { input: 0.8e-6, output: 4.0e-6 }
        } else if model.contains("nova-micro") {
            CostRates { input: 0.035e-6, output: 0.14e-6 }
        } else if model.contains("nova-lite") {
            CostRates { input: 0.06e-6, output: 0.24e-6 }
        } else if model.contains("nova-pro") {
            CostRates { input: 0.8e-6, output: 3.2e-6 }
        } else {
            CostRates::default()
        }
    }

    fn transform_request(
        &self,
        request: &CompletionRequest,
        config: &ProviderConfig,
        _stream: bool,
    ) -> Result<Value, ErrorRecord> {
        // 模型 id 走 URL 路径 stream 由端点区分 body 本身无差异
        config.resolve_model(&request.model)?;
        build_converse_body(request)
    }

    fn request_parts(
        &self,
        request: &CompletionRequest,
        config: &ProviderConfig,
        stream: bool,
    ) -> Result<HttpRequest, ErrorRecord> {
        let model = config.resolve_model(&request.model)?.to_string();
        let body = self.transform_request(request, config, stream)?;
        let payload = serde_json::to_vec(&body).map_err(|err| {
            ErrorRecord::invalid_request(self.name(), format!("failed to serialize request: {err}"))
        })?;
        let api_key = config.api_key()?;

        let region = config.extra_str("region").unwrap_or(DEFAULT_REGION);
        let default_base = format!("https://bedrock-runtime.{region}.amazonaws.com");
        let base = config.base_url_or(&default_base).to_string();
        let action = if stream { "converse-stream" } else { "converse" };
        let url = format!("{base}/model/{model}/{action}");

        Ok(HttpRequest::post_json(url, payload)
            .with_header("Authorization", format!("Bearer {api_key}"))
            .with_header("Accept", "application/json"))
    }

    fn transform_response(&self, body: &str) -> Result<Response, ErrorRecord> {
        let wire: WireConverseResponse = serde_json::from_str(body).map_err(|err| {
            ErrorRecord::invalid_response(self.name(), format!("failed to parse response: {err}"))
        })?;
        Ok(map_response(wire))
    }

    fn transform_chunk(&self, frame: &str) -> Result<Option<Delta>, ErrorRecord> {
        parse_stream_event(self.name(), frame)
    }

    fn classify_error(&self, status: u16, body: &str, retry_after: Option<u64>) -> ErrorRecord {
        classify_bedrock_error(self.name(), status, body, retry_after)
    }
}

/// 构建 Converse 请求体
fn build_converse_body(request: &CompletionRequest) -> Result<Value, ErrorRecord> {
    let mut body = Map::new();

    // 1. system 消息折叠为顶层 system 数组 其余进入 messages
    let mut system_blocks = Vec::new();
    let mut messages = Vec::new();
    for message in &request.messages {
        match message.role {
            Role::System => {
                if let Some(text) = &message.content {
                    system_blocks.push(json!({ "text": text }));
                }
            }
            Role::Tool => messages.push(convert_tool_result(message)?),
            Role::User | Role::Assistant => messages.push(convert_message(message)?),
        }
    }

    if messages.is_empty() {
        return Err(ErrorRecord::invalid_request(
            "bedrock",
            "request requires at least one user or assistant message",
        ));
    }
    body.insert("messages".to_string(), Value::Array(messages));
    if !system_blocks.is_empty() {
        body.insert("system".to_string(), Value::Array(system_blocks));
    }

    // 2. 采样参数 -> inferenceConfig
    let mut inference = Map::new();
    if let Some(max_tokens) = request.max_tokens {
        inference.insert("maxTokens".to_string(), Value::from(max_tokens));
    }
    if let Some(temperature) = request.temperature {
        inference.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = request.top_p {
        inference.insert("topP".to_string(), Value::from(top_p));
    }
    if !request.stop.is_empty() {
        inference.insert("stopSequences".to_string(), json!(request.stop));
    }
    if !inference.is_empty() {
        body.insert("inferenceConfig".to_string(), Value::Object(inference));
    }

    // 3. 工具配置
    if !request.tools.is_empty() {
        let tools = request
            .tools
            .iter()
            .map(|tool| {
                json!({
                    "toolSpec": {
                        "name": tool.name,
                        "description": tool.description,
                        "inputSchema": { "json": tool.parameters },
                    }
                })
            })
            .collect::<Vec<_>>();
        let mut tool_config = Map::new();
        tool_config.insert("tools".to_string(), Value::Array(tools));
        if let Some(choice) = &request.tool_choice {
            if let Some(value) = convert_tool_choice(choice) {
                tool_config.insert("toolChoice".to_string(), value);
            }
        }
        body.insert("toolConfig".to_string(), Value::Object(tool_config));
    }

    // 4. thinking 通过 additionalModelRequestFields 透传给 Claude 系模型
    if let Some(thinking) = &request.thinking {
        if thinking.enabled {
            body.insert(
                "additionalModelRequestFields".to_string(),
                json!({
                    "thinking": {
                        "type": "enabled",
                        "budget_tokens": thinking.budget_tokens.unwrap_or(2048),
                    }
                }),
            );
        }
    }

    Ok(Value::Object(body))
}

fn convert_message(message: &Message) -> Result<Value, ErrorRecord> {
    let mut blocks = Vec::new();

    if let Some(thinking_blocks) = &message.thinking_blocks {
        for block in thinking_blocks {
            blocks.push(json!({
                "reasoningContent": {
                    "reasoningText": {
                        "text": block.text,
                        "signature": block.signature,
                    }
                }
            }));
        }
    }

    if let Some(text) = &message.content {
        if !text.is_empty() {
            blocks.push(json!({ "text": text }));
        }
    }

    if let Some(calls) = &message.tool_calls {
        for call in calls {
            blocks.push(json!({
                "toolUse": {
                    "toolUseId": call.id,
                    "name": call.function.name,
                    "input": arguments_to_value("bedrock", &call.function.arguments)?,
                }
            }));
        }
    }

    if blocks.is_empty() {
        return Err(ErrorRecord::invalid_request(
            "bedrock",
            "message must carry content, tool calls, or thinking blocks",
        ));
    }

    Ok(json!({
        "role": message.role.as_str(),
        "content": blocks,
    }))
}

/// tool 角色消息转换为携带 toolResult 块的 user 消息
fn convert_tool_result(message: &Message) -> Result<Value, ErrorRecord> {
    let call_id = message.tool_call_id.as_ref().ok_or_else(|| {
        ErrorRecord::invalid_request("bedrock", "tool message missing tool_call_id")
    })?;
    let output = message.content.clone().unwrap_or_default();
    // JSON 输出走 json 块 纯文本走 text 块
    let content = match serde_json::from_str::<Value>(&output) {
        Ok(value) if value.is_object() || value.is_array() => json!([{ "json": value }]),
        _ => json!([{ "text": output }]),
    };
    Ok(json!({
        "role": "user",
        "content": [{
            "toolResult": {
                "toolUseId": call_id,
                "content": content,
            }
        }],
    }))
}

fn convert_tool_choice(choice: &ToolChoice) -> Option<Value> {
    match choice {
        ToolChoice::Auto => Some(json!({ "auto": {} })),
        // required 与 any 同义 Converse 的词汇是 any
        ToolChoice::Required => Some(json!({ "any": {} })),
        ToolChoice::Tool { name } => Some(json!({ "tool": { "name": name } })),
        // Converse 没有显式禁用词汇 不设置即可
        ToolChoice::None => None,
    }
}

fn convert_stop_reason(reason: &str) -> FinishReason {
    match reason {
        "end_turn" | "stop_sequence" => FinishReason::Stop,
        "max_tokens" => FinishReason::Length,
        "tool_use" => FinishReason::ToolCalls,
        "content_filtered" | "guardrail_intervened" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// wire 结构
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireConverseResponse {
    #[serde(default)]
    output: Option<WireOutput>,
    #[serde(default, rename = "stopReason")]
    stop_reason: Option<String>,
    #[serde(default)]
    usage: Option<WireUsage>,
}

#[derive(Debug, Deserialize)]
struct WireOutput {
    #[serde(default)]
    message: Option<WireMessage>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Vec<WireContentBlock>,
}

#[derive(Debug, Deserialize)]
struct WireContentBlock {
    #[serde(default)]
    text: Option<String>,
    #[serde(default, rename = "toolUse")]
    tool_use: Option<WireToolUse>,
    #[serde(default, rename = "reasoningContent")]
    reasoning_content: Option<WireReasoningContent>,
}

#[derive(Debug, Deserialize)]
struct WireToolUse {
    #[serde(default, rename = "toolUseId")]
    tool_use_id: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    input: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireReasoningContent {
    #[serde(default, rename = "reasoningText")]
    reasoning_text: Option<WireReasoningText>,
}

#[derive(Debug, Deserialize)]
struct WireReasoningText {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    signature: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireUsage {
    #[serde(default, rename = "inputTokens")]
    input_tokens: Option<u64>,
    #[serde(default, rename = "outputTokens")]
    output_tokens: Option<u64>,
    #[serde(default, rename = "totalTokens")]
    total_tokens: Option<u64>,
}

impl WireUsage {
    fn into_usage(self) -> Usage {
        let prompt = self.input_tokens.unwrap_or(0);
        let completion = self.output_tokens.unwrap_or(0);
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: self.total_tokens.unwrap_or(prompt + completion),
        }
    }
}

fn map_response(wire: WireConverseResponse) -> Response {
    let mut text = String::new();
    let mut tool_calls = Vec::new();
    let mut thinking_blocks = Vec::new();

    let blocks = wire
        .output
        .and_then(|output| output.message)
        .map(|message| message.content)
        .unwrap_or_default();
    for block in blocks {
        if let Some(fragment) = block.text {
            text.push_str(&fragment);
        }
        if let Some(tool_use) = block.tool_use {
            tool_calls.push(ToolCall::function(
                tool_use.tool_use_id.unwrap_or_default(),
                tool_use.name.unwrap_or_default(),
                tool_use
                    .input
                    .as_ref()
                    .map(value_to_arguments)
                    .unwrap_or_else(|| "{}".to_string()),
            ));
        }
        if let Some(reasoning) = block.reasoning_content {
            if let Some(reasoning_text) = reasoning.reasoning_text {
                thinking_blocks.push(ThinkingBlock {
                    kind: "thinking".to_string(),
                    text: reasoning_text.text.unwrap_or_default(),
                    signature: reasoning_text.signature,
                });
            }
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

    Response {
        id: None,
        model: None,
        choices: vec![Choice {
            index: 0,
            message,
            finish_reason: wire.stop_reason.as_deref().map(convert_stop_reason),
        }],
        usage: wire.usage.map(WireUsage::into_usage).unwrap_or_default(),
    }
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

    if event.get("messageStart").is_some() {
        return Ok(Some(Delta {
            role: Some(Role::Assistant),
            ..Delta::default()
        }));
    }

    if let Some(start) = event.get("contentBlockStart") {
        let index = content_block_index(start);
        if let Some(tool_use) = start.pointer("/start/toolUse") {
            return Ok(Some(Delta {
                tool_calls: vec![ToolCallDelta {
                    index,
                    id: tool_use
                        .get("toolUseId")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    name: tool_use
                        .get("name")
                        .and_then(Value::as_str)
                        .map(str::to_string),
                    arguments_fragment: None,
                }],
                ..Delta::default()
            }));
        }
        return Ok(None);
    }

    if let Some(block_delta) = event.get("contentBlockDelta") {
        let index = content_block_index(block_delta);
        if let Some(text) = block_delta.pointer("/delta/text").and_then(Value::as_str) {
            return Ok(Some(Delta::content_fragment(0, text)));
        }
        if let Some(fragment) = block_delta
            .pointer("/delta/toolUse/input")
            .and_then(Value::as_str)
        {
            return Ok(Some(Delta {
                tool_calls: vec![ToolCallDelta {
                    index,
                    id: None,
                    name: None,
                    arguments_fragment: Some(fragment.to_string()),
                }],
                ..Delta::default()
            }));
        }
        if let Some(reasoning) = block_delta
            .pointer("/delta/reasoningContent/text")
            .and_then(Value::as_str)
        {
            return Ok(Some(Delta {
                reasoning_content: Some(reasoning.to_string()),
                ..Delta::default()
            }));
        }
        return Ok(None);
    }

    if let Some(stop) = event.get("messageStop") {
        return Ok(stop
            .get("stopReason")
            .and_then(Value::as_str)
            .map(|reason| Delta {
                finish_reason: Some(convert_stop_reason(reason)),
                ..Delta::default()
            }));
    }

    if let Some(metadata) = event.get("metadata") {
        let usage = metadata
            .get("usage")
            .and_then(|value| serde_json::from_value::<WireUsage>(value.clone()).ok())
            .map(WireUsage::into_usage);
        return Ok(usage.map(|usage| Delta {
            usage: Some(usage),
            ..Delta::default()
        }));
    }

    // contentBlockStop 等纯元数据帧
    Ok(None)
}

fn content_block_index(event: &Value) -> usize {
    event
        .get("contentBlockIndex")
        .and_then(Value::as_u64)
        .unwrap_or(0) as usize
}

// ---------------------------------------------------------------------------
// 错误分类
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireErrorBody {
    #[serde(default)]
    message: Option<String>,
    #[serde(default, rename = "__type")]
    error_type: Option<String>,
}

fn classify_bedrock_error(
    provider: &'static str,
    status: u16,
    body: &str,
    retry_after: Option<u64>,
) -> ErrorRecord {
    let (message, error_type) = match serde_json::from_str::<WireErrorBody>(body) {
        Ok(parsed) => (
            parsed
                .message
                .unwrap_or_else(|| format!("status {status}: {body}")),
            parsed.error_type,
        ),
        Err(_) => (format!("status {status}: {body}"), None),
    };

    // __type 形如 "com.amazon...#ThrottlingException" 截取短名
    let short_type = error_type
        .as_deref()
        .map(|value| value.rsplit('#').next().unwrap_or(value).to_string());

    let kind = match short_type.as_deref() {
        Some("ThrottlingException") => ErrorKind::RateLimit,
        Some("ValidationException") => ErrorKind::InvalidRequest,
        Some("AccessDeniedException") => ErrorKind::AuthorizationError,
        Some("UnauthorizedException") => ErrorKind::AuthenticationError,
        Some("ResourceNotFoundException") => ErrorKind::ModelNotFound,
        Some("ModelTimeoutException") => ErrorKind::Timeout,
        Some("ModelNotReadyException") | Some("ServiceUnavailableException") => {
            ErrorKind::ServerError
        }
        Some("InternalServerException") => ErrorKind::ServerError,
        _ => match status {
            400 => ErrorKind::InvalidRequest,
            401 => ErrorKind::AuthenticationError,
            403 => ErrorKind::AuthorizationError,
            404 => ErrorKind::ModelNotFound,
            408 => ErrorKind::Timeout,
            424 => ErrorKind::ProviderError,
            429 => ErrorKind::RateLimit,
            code if (500..600).contains(&code) => ErrorKind::ServerError,
            _ => ErrorKind::ProviderError,
        },
    };

    let mut record = ErrorRecord::new(kind, provider, message).with_http_status(status);
    if let Some(code) = short_type {
        record = record.with_provider_code(code);
    }
    if let Some(seconds) = retry_after {
        record = record.with_retry_after(seconds);
    }
    record
}
