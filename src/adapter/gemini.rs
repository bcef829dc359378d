//! Google Gemini generateContent adapter.

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::adapter::{ProviderAdapter, Sealed, arguments_to_value, value_to_arguments};
use crate::config::ProviderConfig;
use crate::error::{ErrorKind, ErrorRecord};
use crate::http::HttpRequest;
use crate::types::{
    AdapterCapabilities, Choice, CompletionRequest, CostRates, Delta, Embedding,
    EmbeddingsRequest, EmbeddingsResponse, FinishReason, Message, Response, Role, ToolCall,
    ToolCallDelta, ToolChoice, Usage,
};

const DEFAULT_BASE_URL: &str = "https://generativelanguage.googleapis.com/v1beta";

/// Google Gemini GenerateContent API
///
/// 与 OpenAI 家族不同 模型名与 API Key 均通过 URL 携带：
/// `POST /v1beta/models/{model}:generateContent?key=...`。
pub struct GeminiAdapter;

impl Sealed for GeminiAdapter {}

impl ProviderAdapter for GeminiAdapter {
    fn name(&self) -> &'static str {
        "gemini"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_streaming: true,
            supports_tools: true,
            supports_embeddings: true,
        }
    }

    fn supports_reasoning(&self, model: &str) -> bool {
        model.contains("2.5") || model.contains("thinking")
    }

    fn cost_per_token(&self, model: &str) -> CostRates {
        if model.contains("2.5-pro") {
            CostRates { input: 1.25e-6, output: 10.0e-6 }
        } else if model.contains("2.5-flash") {
            CostRates { input: 0.3e-6, output: 2.5e-6 }
        } else if model.contains("2.0-flash") {
            CostRates { input: 0.1e-6, output: 0.4e-6 }
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
        // 模型名只用于拼 URL 不出现在 body 中
        config.resolve_model(&request.model)?;
        build_generate_body(request)
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
        let base = config.base_url_or(DEFAULT_BASE_URL);
        let url = if stream {
            format!("{base}/models/{model}:streamGenerateContent?alt=sse&key={api_key}")
        } else {
            format!("{base}/models/{model}:generateContent?key={api_key}")
        };
        Ok(HttpRequest::post_json(url, payload))
    }

    fn transform_response(&self, body: &str) -> Result<Response, ErrorRecord> {
        let wire: WireGenerateResponse = serde_json::from_str(body).map_err(|err| {
            ErrorRecord::invalid_response(self.name(), format!("failed to parse response: {err}"))
        })?;
        Ok(map_response(wire))
    }

    fn transform_chunk(&self, frame: &str) -> Result<Option<Delta>, ErrorRecord> {
        parse_stream_chunk(self.name(), frame)
    }

    fn classify_error(&self, status: u16, body: &str, retry_after: Option<u64>) -> ErrorRecord {
        classify_gemini_error(self.name(), status, body, retry_after)
    }

    fn embeddings_parts(
        &self,
        request: &EmbeddingsRequest,
        config: &ProviderConfig,
    ) -> Result<HttpRequest, ErrorRecord> {
        let model = config.resolve_model(&request.model)?.to_string();
        let requests = request
            .input
            .iter()
            .map(|text| {
                json!({
                    "model": format!("models/{model}"),
                    "content": { "parts": [{ "text": text }] },
                })
            })
            .collect::<Vec<_>>();
        let body = json!({ "requests": requests });
        let payload = serde_json::to_vec(&body).map_err(|err| {
            ErrorRecord::invalid_request(self.name(), format!("failed to serialize request: {err}"))
        })?;
        let api_key = config.api_key()?;
        let base = config.base_url_or(DEFAULT_BASE_URL);
        let url = format!("{base}/models/{model}:batchEmbedContents?key={api_key}");
        Ok(HttpRequest::post_json(url, payload))
    }

    fn transform_embeddings_response(&self, body: &str) -> Result<EmbeddingsResponse, ErrorRecord> {
        #[derive(Deserialize)]
        struct WireBatch {
            #[serde(default)]
            embeddings: Vec<WireValues>,
        }
        #[derive(Deserialize)]
        struct WireValues {
            #[serde(default)]
            values: Vec<f32>,
        }

        let wire: WireBatch = serde_json::from_str(body).map_err(|err| {
            ErrorRecord::invalid_response(
                self.name(),
                format!("failed to parse embeddings response: {err}"),
            )
        })?;
        let data = wire
            .embeddings
            .into_iter()
            .enumerate()
            .map(|(index, item)| Embedding {
                embedding: item.values,
                index,
            })
            .collect();
        // batchEmbedContents 不返回 usage 统一补零
        Ok(EmbeddingsResponse {
            data,
            usage: Usage::default(),
        })
    }
}

/// 构建 GenerateContent 请求体
fn build_generate_body(request: &CompletionRequest) -> Result<Value, ErrorRecord> {
    let mut body = Map::new();

    // 1. system 消息折叠为 system_instruction 其余进入 contents
    let mut system_texts = Vec::new();
    let mut contents = Vec::new();
    for (position, message) in request.messages.iter().enumerate() {
        match message.role {
            Role::System => {
                if let Some(text) = &message.content {
                    system_texts.push(text.clone());
                }
            }
            Role::Tool => {
                contents.push(convert_tool_result(request, position, message)?);
            }
            Role::User | Role::Assistant => {
                contents.push(convert_message(message)?);
            }
        }
    }

    if contents.is_empty() {
        return Err(ErrorRecord::invalid_request(
            "gemini",
            "request requires at least one user or assistant message",
        ));
    }
    body.insert("contents".to_string(), Value::Array(contents));

    if !system_texts.is_empty() {
        body.insert(
            "system_instruction".to_string(),
            json!({ "parts": [{ "text": system_texts.join("\n\n") }] }),
        );
    }

    // 2. 采样配置 -> generationConfig
    if let Some(config) = build_generation_config(request) {
        body.insert("generationConfig".to_string(), config);
    }

    // 3. 工具与 toolConfig
    if !request.tools.is_empty() {
        let declarations = request
            .tools
            .iter()
            .map(|tool| {
                let mut decl = Map::new();
                decl.insert("name".to_string(), Value::String(tool.name.clone()));
                if let Some(description) = &tool.description {
                    decl.insert(
                        "description".to_string(),
                        Value::String(description.clone()),
                    );
                }
                decl.insert("parameters".to_string(), tool.parameters.clone());
                Value::Object(decl)
            })
            .collect::<Vec<_>>();
        body.insert(
            "tools".to_string(),
            json!([{ "functionDeclarations": declarations }]),
        );
    }
    if let Some(choice) = &request.tool_choice {
        if let Some(config) = convert_tool_choice(choice) {
            body.insert("toolConfig".to_string(), config);
        }
    }

    Ok(Value::Object(body))
}

/// assistant 统一映射为 Gemini 的 model 角色
fn convert_message(message: &Message) -> Result<Value, ErrorRecord> {
    let role = match message.role {
        Role::Assistant => "model",
        _ => "user",
    };

    let mut parts = Vec::new();
    if let Some(text) = &message.content {
        if !text.is_empty() {
            parts.push(json!({ "text": text }));
        }
    }
    if let Some(calls) = &message.tool_calls {
        for call in calls {
            parts.push(json!({
                "functionCall": {
                    "name": call.function.name,
                    "args": arguments_to_value("gemini", &call.function.arguments)?,
                }
            }));
        }
    }

    if parts.is_empty() {
        return Err(ErrorRecord::invalid_request(
            "gemini",
            "message must carry content or tool calls",
        ));
    }

    Ok(json!({ "role": role, "parts": parts }))
}

/// tool 角色消息转换为携带 functionResponse 的 user content
///
/// functionResponse 需要函数名而规范的 tool 消息只带 call id
/// 这里回溯之前 assistant 消息中的 tool_calls 以解析名称。
fn convert_tool_result(
    request: &CompletionRequest,
    position: usize,
    message: &Message,
) -> Result<Value, ErrorRecord> {
    let call_id = message.tool_call_id.as_ref().ok_or_else(|| {
        ErrorRecord::invalid_request("gemini", "tool message missing tool_call_id")
    })?;

    let name = request.messages[..position]
        .iter()
        .rev()
        .filter_map(|earlier| earlier.tool_calls.as_ref())
        .flatten()
        .find(|call| &call.id == call_id)
        .map(|call| call.function.name.clone())
        .ok_or_else(|| {
            ErrorRecord::invalid_request(
                "gemini",
                format!("no preceding tool call matches tool_call_id `{call_id}`"),
            )
        })?;

    let output = message.content.clone().unwrap_or_default();
    // functionResponse.response 要求对象 纯文本包一层
    let response = serde_json::from_str::<Value>(&output)
        .ok()
        .filter(Value::is_object)
        .unwrap_or_else(|| json!({ "result": output }));

    Ok(json!({
        "role": "user",
        "parts": [{
            "functionResponse": { "name": name, "response": response }
        }],
    }))
}

fn build_generation_config(request: &CompletionRequest) -> Option<Value> {
    let mut config = Map::new();
    if let Some(temperature) = request.temperature {
        config.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = request.top_p {
        config.insert("topP".to_string(), Value::from(top_p));
    }
    if let Some(max_tokens) = request.max_tokens {
        config.insert("maxOutputTokens".to_string(), Value::from(max_tokens));
    }
    if !request.stop.is_empty() {
        config.insert("stopSequences".to_string(), json!(request.stop));
    }
    if let Some(budget) = thinking_budget(request) {
        config.insert(
            "thinkingConfig".to_string(),
            json!({ "thinkingBudget": budget }),
        );
    }
    if config.is_empty() {
        None
    } else {
        Some(Value::Object(config))
    }
}

/// 显式 thinking 预算优先 effort 预设按惯例折算
fn thinking_budget(request: &CompletionRequest) -> Option<u32> {
    if let Some(thinking) = &request.thinking {
        if !thinking.enabled {
            return None;
        }
        return thinking.budget_tokens.or(Some(2048));
    }
    request.reasoning_effort.map(|effort| match effort {
        crate::types::ReasoningEffort::Low => 1024,
        crate::types::ReasoningEffort::Medium => 2048,
        crate::types::ReasoningEffort::High => 4096,
    })
}

fn convert_tool_choice(choice: &ToolChoice) -> Option<Value> {
    match choice {
        ToolChoice::Auto => None,
        // required 与 any 同义 Gemini 的词汇是 mode ANY
        ToolChoice::Required => Some(json!({
            "functionCallingConfig": { "mode": "ANY" }
        })),
        ToolChoice::None => Some(json!({
            "functionCallingConfig": { "mode": "NONE" }
        })),
        ToolChoice::Tool { name } => Some(json!({
            "functionCallingConfig": {
                "mode": "ANY",
                "allowedFunctionNames": [name]
            }
        })),
    }
}

fn convert_finish_reason(reason: &str, has_tool_calls: bool) -> FinishReason {
    match reason {
        // Gemini 对工具调用同样报 STOP 以内容为准修正
        "STOP" if has_tool_calls => FinishReason::ToolCalls,
        "STOP" => FinishReason::Stop,
        "MAX_TOKENS" => FinishReason::Length,
        "SAFETY" | "PROHIBITED_CONTENT" | "BLOCKLIST" => FinishReason::ContentFilter,
        other => FinishReason::Other(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// wire 结构
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireGenerateResponse {
    #[serde(default)]
    candidates: Vec<WireCandidate>,
    #[serde(default, rename = "usageMetadata")]
    usage_metadata: Option<WireUsageMetadata>,
    #[serde(default, rename = "modelVersion")]
    model_version: Option<String>,
    #[serde(default, rename = "responseId")]
    response_id: Option<String>,
}

#[derive(Debug, Deserialize)]
struct WireCandidate {
    #[serde(default)]
    content: Option<WireContent>,
    #[serde(default, rename = "finishReason")]
    finish_reason: Option<String>,
    #[serde(default)]
    index: Option<usize>,
}

#[derive(Debug, Deserialize)]
struct WireContent {
    #[serde(default)]
    parts: Vec<WirePart>,
}

#[derive(Debug, Deserialize)]
struct WirePart {
    #[serde(default)]
    text: Option<String>,
    #[serde(default)]
    thought: Option<bool>,
    #[serde(default, rename = "functionCall")]
    function_call: Option<WireFunctionCall>,
}

#[derive(Debug, Deserialize)]
struct WireFunctionCall {
    name: String,
    #[serde(default)]
    args: Option<Value>,
}

#[derive(Debug, Deserialize)]
struct WireUsageMetadata {
    #[serde(default, rename = "promptTokenCount")]
    prompt_token_count: Option<u64>,
    #[serde(default, rename = "candidatesTokenCount")]
    candidates_token_count: Option<u64>,
    #[serde(default, rename = "totalTokenCount")]
    total_token_count: Option<u64>,
}

impl WireUsageMetadata {
    fn into_usage(self) -> Usage {
        let prompt = self.prompt_token_count.unwrap_or(0);
        let completion = self.candidates_token_count.unwrap_or(0);
        Usage {
            prompt_tokens: prompt,
            completion_tokens: completion,
            total_tokens: self.total_token_count.unwrap_or(prompt + completion),
        }
    }
}

fn map_response(wire: WireGenerateResponse) -> Response {
    let mut choices = Vec::new();
    for (position, candidate) in wire.candidates.into_iter().enumerate() {
        let index = candidate.index.unwrap_or(position);
        let (message, has_tool_calls) = convert_candidate_content(candidate.content);
        choices.push(Choice {
            index,
            message,
            finish_reason: candidate
                .finish_reason
                .as_deref()
                .map(|reason| convert_finish_reason(reason, has_tool_calls)),
        });
    }

    Response {
        id: wire.response_id,
        model: wire.model_version,
        choices,
        usage: wire
            .usage_metadata
            .map(WireUsageMetadata::into_usage)
            .unwrap_or_default(),
    }
}

fn convert_candidate_content(content: Option<WireContent>) -> (Message, bool) {
    let mut text = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for part in content.map(|content| content.parts).unwrap_or_default() {
        if let Some(call) = part.function_call {
            // Gemini 不返回调用 id 以槽位合成稳定 id
            let id = format!("call_{}", tool_calls.len());
            let args = call.args.unwrap_or_else(|| json!({}));
            tool_calls.push(ToolCall::function(id, call.name, value_to_arguments(&args)));
        } else if let Some(fragment) = part.text {
            if part.thought.unwrap_or(false) {
                reasoning.push_str(&fragment);
            } else {
                text.push_str(&fragment);
            }
        }
    }

    let has_tool_calls = !tool_calls.is_empty();
    let message = Message {
        role: Role::Assistant,
        content: if text.is_empty() { None } else { Some(text) },
        tool_calls: if tool_calls.is_empty() {
            None
        } else {
            Some(tool_calls)
        },
        tool_call_id: None,
        reasoning_content: if reasoning.is_empty() {
            None
        } else {
            Some(reasoning)
        },
        thinking_blocks: None,
    };
    (message, has_tool_calls)
}

fn parse_stream_chunk(
    provider: &'static str,
    frame: &str,
) -> Result<Option<Delta>, ErrorRecord> {
    let wire: WireGenerateResponse = serde_json::from_str(frame).map_err(|err| {
        ErrorRecord::new(
            ErrorKind::StreamingError,
            provider,
            format!("failed to parse stream chunk: {err}"),
        )
    })?;

    let usage = wire.usage_metadata.map(WireUsageMetadata::into_usage);
    let Some(candidate) = wire.candidates.into_iter().next() else {
        return Ok(usage.map(|usage| Delta {
            usage: Some(usage),
            ..Delta::default()
        }));
    };

    let index = candidate.index.unwrap_or(0);
    let mut content = String::new();
    let mut reasoning = String::new();
    let mut tool_calls = Vec::new();

    for part in candidate
        .content
        .map(|content| content.parts)
        .unwrap_or_default()
    {
        if let Some(call) = part.function_call {
            let slot = tool_calls.len();
            let args = call.args.unwrap_or_else(|| json!({}));
            tool_calls.push(ToolCallDelta {
                index: slot,
                id: Some(format!("call_{slot}")),
                name: Some(call.name),
                arguments_fragment: Some(value_to_arguments(&args)),
            });
        } else if let Some(fragment) = part.text {
            if part.thought.unwrap_or(false) {
                reasoning.push_str(&fragment);
            } else {
                content.push_str(&fragment);
            }
        }
    }

    let has_tool_calls = !tool_calls.is_empty();
    let finish_reason = candidate
        .finish_reason
        .as_deref()
        .map(|reason| convert_finish_reason(reason, has_tool_calls));

    if content.is_empty()
        && reasoning.is_empty()
        && tool_calls.is_empty()
        && finish_reason.is_none()
        && usage.is_none()
    {
        return Ok(None);
    }

    Ok(Some(Delta {
        index,
        role: None,
        content: if content.is_empty() { None } else { Some(content) },
        reasoning_content: if reasoning.is_empty() {
            None
        } else {
            Some(reasoning)
        },
        tool_calls,
        finish_reason,
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
    status: Option<String>,
}

fn classify_gemini_error(
    provider: &'static str,
    status: u16,
    body: &str,
    retry_after: Option<u64>,
) -> ErrorRecord {
    let (message, grpc_status) = match serde_json::from_str::<WireErrorBody>(body) {
        Ok(WireErrorBody { error: Some(detail) }) => (
            detail.message.unwrap_or_else(|| "unknown error".to_string()),
            detail.status,
        ),
        _ => (format!("status {status}: {body}"), None),
    };

    let kind = match grpc_status.as_deref() {
        Some("UNAUTHENTICATED") => ErrorKind::AuthenticationError,
        Some("PERMISSION_DENIED") => ErrorKind::AuthorizationError,
        Some("NOT_FOUND") => ErrorKind::ModelNotFound,
        Some("INVALID_ARGUMENT") | Some("FAILED_PRECONDITION") => ErrorKind::InvalidRequest,
        Some("RESOURCE_EXHAUSTED") => {
            if crate::error::looks_like_quota_error(None, &message) {
                ErrorKind::QuotaExceeded
            } else {
                ErrorKind::RateLimit
            }
        }
        Some("DEADLINE_EXCEEDED") => ErrorKind::Timeout,
        Some("UNAVAILABLE") | Some("INTERNAL") => ErrorKind::ServerError,
        _ => match status {
            400 => ErrorKind::InvalidRequest,
            401 => ErrorKind::AuthenticationError,
            403 => ErrorKind::AuthorizationError,
            404 => ErrorKind::ModelNotFound,
            408 => ErrorKind::Timeout,
            429 => ErrorKind::RateLimit,
            code if (500..600).contains(&code) => ErrorKind::ServerError,
            _ => ErrorKind::ProviderError,
        },
    };

    let mut record = ErrorRecord::new(kind, provider, message).with_http_status(status);
    if let Some(code) = grpc_status {
        record = record.with_provider_code(code);
    }
    if let Some(seconds) = retry_after {
        record = record.with_retry_after(seconds);
    }
    record
}
