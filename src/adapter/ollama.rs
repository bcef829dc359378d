//! Ollama adapter.
//!
//! 本地推理服务 走原生 /api/chat 协议：请求不需要鉴权 流式响应是裸 JSON
//! 行而非 SSE 用量字段叫 prompt_eval_count / eval_count。

use serde::Deserialize;
use serde_json::{Map, Value, json};

use crate::adapter::{ProviderAdapter, Sealed, arguments_to_value, value_to_arguments};
use crate::config::ProviderConfig;
use crate::error::{ErrorKind, ErrorRecord};
use crate::http::HttpRequest;
use crate::sse::StreamFraming;
use crate::types::{
    AdapterCapabilities, Choice, CompletionRequest, CostRates, Delta, Embedding,
    EmbeddingsRequest, EmbeddingsResponse, FinishReason, Message, Response, Role, ToolCall,
    Usage,
};

const DEFAULT_BASE_URL: &str = "http://localhost:11434";

/// Ollama 本地服务（/api/chat）
pub struct OllamaAdapter;

impl Sealed for OllamaAdapter {}

impl ProviderAdapter for OllamaAdapter {
    fn name(&self) -> &'static str {
        "ollama"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_streaming: true,
            supports_tools: true,
            supports_embeddings: true,
        }
    }

    fn supports_reasoning(&self, model: &str) -> bool {
        model.contains("deepseek-r1") || model.contains("qwq") || model.contains("qwen3")
    }

    fn cost_per_token(&self, _model: &str) -> CostRates {
        // 本地推理没有按 token 计费
        CostRates::default()
    }

    fn framing(&self) -> StreamFraming {
        StreamFraming::JsonLines
    }

    fn transform_request(
        &self,
        request: &CompletionRequest,
        config: &ProviderConfig,
        stream: bool,
    ) -> Result<Value, ErrorRecord> {
        let model = config.resolve_model(&request.model)?;
        build_chat_body(request, model, stream)
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
        let url = format!("{}/api/chat", config.base_url_or(DEFAULT_BASE_URL));
        Ok(HttpRequest::post_json(url, payload))
    }

    fn transform_response(&self, body: &str) -> Result<Response, ErrorRecord> {
        let wire: WireChatResponse = serde_json::from_str(body).map_err(|err| {
            ErrorRecord::invalid_response(self.name(), format!("failed to parse response: {err}"))
        })?;
        Ok(map_response(wire))
    }

    fn transform_chunk(&self, frame: &str) -> Result<Option<Delta>, ErrorRecord> {
        parse_stream_line(self.name(), frame)
    }

    fn classify_error(&self, status: u16, body: &str, retry_after: Option<u64>) -> ErrorRecord {
        classify_ollama_error(self.name(), status, body, retry_after)
    }

    fn health_request(&self, config: &ProviderConfig) -> Option<HttpRequest> {
        // 本地服务有默认地址 /api/tags 是惯用的探活端点
        Some(HttpRequest::get(format!(
            "{}/api/tags",
            config.base_url_or(DEFAULT_BASE_URL)
        )))
    }

    fn embeddings_parts(
        &self,
        request: &EmbeddingsRequest,
        config: &ProviderConfig,
    ) -> Result<HttpRequest, ErrorRecord> {
        let model = config.resolve_model(&request.model)?;
        let body = json!({ "model": model, "input": request.input });
        let payload = serde_json::to_vec(&body).map_err(|err| {
            ErrorRecord::invalid_request(self.name(), format!("failed to serialize request: {err}"))
        })?;
        let url = format!("{}/api/embed", config.base_url_or(DEFAULT_BASE_URL));
        Ok(HttpRequest::post_json(url, payload))
    }

    fn transform_embeddings_response(&self, body: &str) -> Result<EmbeddingsResponse, ErrorRecord> {
        #[derive(Deserialize)]
        struct WireEmbed {
            #[serde(default)]
            embeddings: Vec<Vec<f32>>,
            #[serde(default)]
            prompt_eval_count: Option<u64>,
        }

        let wire: WireEmbed = serde_json::from_str(body).map_err(|err| {
            ErrorRecord::invalid_response(
                self.name(),
                format!("failed to parse embeddings response: {err}"),
            )
        })?;
        let data = wire
            .embeddings
            .into_iter()
            .enumerate()
            .map(|(index, embedding)| Embedding { embedding, index })
            .collect();
        Ok(EmbeddingsResponse {
            data,
            usage: Usage {
                prompt_tokens: wire.prompt_eval_count.unwrap_or(0),
                completion_tokens: 0,
                total_tokens: wire.prompt_eval_count.unwrap_or(0),
            },
        })
    }
}

/// 构建 /api/chat 请求体
fn build_chat_body(
    request: &CompletionRequest,
    model: &str,
    stream: bool,
) -> Result<Value, ErrorRecord> {
    let mut body = Map::new();
    body.insert("model".to_string(), Value::String(model.to_string()));

    let messages = request
        .messages
        .iter()
        .map(convert_message)
        .collect::<Result<Vec<_>, _>>()?;
    body.insert("messages".to_string(), Value::Array(messages));
    body.insert("stream".to_string(), Value::Bool(stream));

    // 采样参数集中在 options 对象
    let mut options = Map::new();
    if let Some(temperature) = request.temperature {
        options.insert("temperature".to_string(), Value::from(temperature));
    }
    if let Some(top_p) = request.top_p {
        options.insert("top_p".to_string(), Value::from(top_p));
    }
    if let Some(max_tokens) = request.max_tokens {
        options.insert("num_predict".to_string(), Value::from(max_tokens));
    }
    if !request.stop.is_empty() {
        options.insert("stop".to_string(), json!(request.stop));
    }
    if !options.is_empty() {
        body.insert("options".to_string(), Value::Object(options));
    }

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
    // tool_choice 不在 /api/chat 协议中 忽略

    if request.thinking.as_ref().is_some_and(|t| t.enabled)
        || request.reasoning_effort.is_some()
    {
        body.insert("think".to_string(), Value::Bool(true));
    }

    Ok(Value::Object(body))
}

fn convert_message(message: &Message) -> Result<Value, ErrorRecord> {
    let mut obj = Map::new();
    obj.insert(
        "role".to_string(),
        Value::String(message.role.as_str().to_string()),
    );
    obj.insert(
        "content".to_string(),
        Value::String(message.content.clone().unwrap_or_default()),
    );

    if let Some(calls) = &message.tool_calls {
        let wire_calls = calls
            .iter()
            .map(|call| {
                Ok(json!({
                    "function": {
                        "name": call.function.name,
                        // /api/chat 期望对象参数
                        "arguments": arguments_to_value("ollama", &call.function.arguments)?,
                    }
                }))
            })
            .collect::<Result<Vec<_>, ErrorRecord>>()?;
        obj.insert("tool_calls".to_string(), Value::Array(wire_calls));
    }

    Ok(Value::Object(obj))
}

fn convert_done_reason(reason: &str) -> FinishReason {
    match reason {
        "stop" => FinishReason::Stop,
        "length" => FinishReason::Length,
        other => FinishReason::Other(other.to_string()),
    }
}

// ---------------------------------------------------------------------------
// wire 结构
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct WireChatResponse {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    message: Option<WireMessage>,
    #[serde(default)]
    done: bool,
    #[serde(default)]
    done_reason: Option<String>,
    #[serde(default)]
    prompt_eval_count: Option<u64>,
    #[serde(default)]
    eval_count: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct WireMessage {
    #[serde(default)]
    content: Option<String>,
    #[serde(default)]
    thinking: Option<String>,
    #[serde(default)]
    tool_calls: Option<Vec<WireToolCall>>,
}

#[derive(Debug, Deserialize)]
struct WireToolCall {
    #[serde(default)]
    function: Option<WireFunction>,
}

#[derive(Debug, Deserialize)]
struct WireFunction {
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    arguments: Option<Value>,
}

fn wire_usage(prompt: Option<u64>, completion: Option<u64>) -> Usage {
    Usage::new(prompt.unwrap_or(0), completion.unwrap_or(0))
}

fn convert_tool_calls(calls: Option<Vec<WireToolCall>>) -> Option<Vec<ToolCall>> {
    let calls = calls?;
    if calls.is_empty() {
        return None;
    }
    let converted = calls
        .into_iter()
        .enumerate()
        .map(|(slot, call)| {
            let function = call.function.unwrap_or(WireFunction {
                name: None,
                arguments: None,
            });
            // Ollama 不返回调用 id 以槽位合成稳定 id
            ToolCall::function(
                format!("call_{slot}"),
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

fn map_response(wire: WireChatResponse) -> Response {
    let message = wire.message.unwrap_or(WireMessage {
        content: None,
        thinking: None,
        tool_calls: None,
    });
    let tool_calls = convert_tool_calls(message.tool_calls);
    let finish_reason = if tool_calls.is_some() {
        Some(FinishReason::ToolCalls)
    } else {
        wire.done_reason.as_deref().map(convert_done_reason)
    };

    Response {
        id: None,
        model: wire.model,
        choices: vec![Choice {
            index: 0,
            message: Message {
                role: Role::Assistant,
                content: message.content.filter(|text| !text.is_empty()),
                tool_calls,
                tool_call_id: None,
                reasoning_content: message.thinking,
                thinking_blocks: None,
            },
            finish_reason,
        }],
        usage: wire_usage(wire.prompt_eval_count, wire.eval_count),
    }
}

fn parse_stream_line(
    provider: &'static str,
    frame: &str,
) -> Result<Option<Delta>, ErrorRecord> {
    // 流中段的错误行转为流错误
    #[derive(Deserialize)]
    struct WireErrorLine {
        error: String,
    }
    if let Ok(error_line) = serde_json::from_str::<WireErrorLine>(frame) {
        return Err(ErrorRecord::new(
            ErrorKind::StreamingError,
            provider,
            error_line.error,
        ));
    }

    let wire: WireChatResponse = serde_json::from_str(frame).map_err(|err| {
        ErrorRecord::new(
            ErrorKind::StreamingError,
            provider,
            format!("failed to parse stream line: {err}"),
        )
    })?;

    let message = wire.message.unwrap_or(WireMessage {
        content: None,
        thinking: None,
        tool_calls: None,
    });

    let tool_calls = convert_tool_calls(message.tool_calls)
        .unwrap_or_default()
        .into_iter()
        .enumerate()
        .map(|(slot, call)| crate::types::ToolCallDelta {
            index: slot,
            id: Some(call.id),
            name: Some(call.function.name),
            arguments_fragment: Some(call.function.arguments),
        })
        .collect::<Vec<_>>();

    let content = message.content.filter(|text| !text.is_empty());
    let reasoning = message.thinking.filter(|text| !text.is_empty());

    if !wire.done && content.is_none() && reasoning.is_none() && tool_calls.is_empty() {
        return Ok(None);
    }

    let finish_reason = if wire.done {
        Some(
            wire.done_reason
                .as_deref()
                .map(convert_done_reason)
                .unwrap_or(FinishReason::Stop),
        )
    } else {
        None
    };

    Ok(Some(Delta {
        index: 0,
        role: None,
        content,
        reasoning_content: reasoning,
        tool_calls,
        finish_reason,
        usage: if wire.done {
            Some(wire_usage(wire.prompt_eval_count, wire.eval_count))
        } else {
            None
        },
    }))
}

// ---------------------------------------------------------------------------
// 错误分类
// ---------------------------------------------------------------------------

fn classify_ollama_error(
    provider: &'static str,
    status: u16,
    body: &str,
    retry_after: Option<u64>,
) -> ErrorRecord {
    #[derive(Deserialize)]
    struct WireErrorBody {
        error: String,
    }

    let message = serde_json::from_str::<WireErrorBody>(body)
        .map(|parsed| parsed.error)
        .unwrap_or_else(|_| format!("status {status}: {body}"));

    let kind = match status {
        400 => ErrorKind::InvalidRequest,
        401 => ErrorKind::AuthenticationError,
        403 => ErrorKind::AuthorizationError,
        404 if message.contains("model") => ErrorKind::ModelNotFound,
        404 => ErrorKind::InvalidRequest,
        408 => ErrorKind::Timeout,
        429 => ErrorKind::RateLimit,
        code if (500..600).contains(&code) => ErrorKind::ServerError,
        _ => ErrorKind::ProviderError,
    };

    let mut record = ErrorRecord::new(kind, provider, message).with_http_status(status);
    if let Some(seconds) = retry_after {
        record = record.with_retry_after(seconds);
    }
    record
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ProviderKind;
    use crate::config::Credential;

    fn config() -> ProviderConfig {
        ProviderConfig::new(ProviderKind::Ollama, Credential::None).with_model("llama3.2")
    }

    #[test]
    fn body_maps_options_and_keeps_system_in_messages() {
        let request = CompletionRequest {
            messages: vec![Message::system("be terse"), Message::user("hi")],
            temperature: Some(0.1),
            max_tokens: Some(64),
            stop: vec!["END".to_string()],
            ..CompletionRequest::default()
        };
        let body = OllamaAdapter
            .transform_request(&request, &config(), false)
            .expect("body builds");
        // Ollama 原生支持 system 角色 不做抽取
        assert_eq!(body["messages"][0]["role"], json!("system"));
        assert_eq!(body["options"]["num_predict"], json!(64));
        assert_eq!(body["options"]["stop"], json!(["END"]));
        assert_eq!(body["stream"], json!(false));
    }

    #[test]
    fn thinking_request_sets_think_flag() {
        let request = CompletionRequest {
            messages: vec![Message::user("hi")],
            model: "deepseek-r1".to_string(),
            thinking: Some(crate::types::ThinkingConfig {
                enabled: true,
                budget_tokens: None,
            }),
            ..CompletionRequest::default()
        };
        let body = OllamaAdapter
            .transform_request(&request, &config(), false)
            .expect("body builds");
        assert_eq!(body["think"], json!(true));
    }

    #[test]
    fn request_parts_need_no_credential() {
        let request = CompletionRequest {
            messages: vec![Message::user("hi")],
            ..CompletionRequest::default()
        };
        let parts = OllamaAdapter
            .request_parts(&request, &config(), true)
            .expect("parts");
        assert_eq!(parts.url, "http://localhost:11434/api/chat");
        assert!(parts.headers.get("Authorization").is_none());
    }

    #[test]
    fn response_maps_eval_counts_and_tool_calls() {
        let body = r#"{
            "model": "llama3.2",
            "message": {
                "role": "assistant",
                "content": "",
                "tool_calls": [{"function": {"name": "get_weather", "arguments": {"location": "Paris"}}}]
            },
            "done": true,
            "done_reason": "stop",
            "prompt_eval_count": 11,
            "eval_count": 9
        }"#;
        let response = OllamaAdapter.transform_response(body).expect("parse");
        assert_eq!(response.usage.prompt_tokens, 11);
        assert_eq!(response.usage.total_tokens, 20);
        let calls = response.tool_calls();
        assert_eq!(calls[0].id, "call_0");
        assert_eq!(calls[0].function.arguments, "{\"location\":\"Paris\"}");
        // 有工具调用时 finish_reason 修正为 tool_calls
        assert_eq!(
            response.choices[0].finish_reason,
            Some(FinishReason::ToolCalls)
        );
    }

    #[test]
    fn stream_lines_map_content_and_terminal_usage() {
        let delta = OllamaAdapter
            .transform_chunk(r#"{"message":{"role":"assistant","content":"Hel"},"done":false}"#)
            .expect("parse")
            .expect("delta");
        assert_eq!(delta.content.as_deref(), Some("Hel"));
        assert!(delta.finish_reason.is_none());

        let done = OllamaAdapter
            .transform_chunk(
                r#"{"message":{"role":"assistant","content":""},"done":true,"done_reason":"stop","prompt_eval_count":4,"eval_count":6}"#,
            )
            .expect("parse")
            .expect("delta");
        assert_eq!(done.finish_reason, Some(FinishReason::Stop));
        assert_eq!(done.usage.unwrap().total_tokens, 10);

        // 空的中间帧丢弃
        assert!(OllamaAdapter
            .transform_chunk(r#"{"message":{"role":"assistant","content":""},"done":false}"#)
            .expect("parse")
            .is_none());
    }

    #[test]
    fn error_line_in_stream_surfaces_as_streaming_error() {
        let err = OllamaAdapter
            .transform_chunk(r#"{"error":"model runner has unexpectedly stopped"}"#)
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::StreamingError);
    }

    #[test]
    fn error_classification_reads_flat_error_string() {
        let missing = OllamaAdapter.classify_error(
            404,
            r#"{"error":"model \"nope\" not found, try pulling it first"}"#,
            None,
        );
        assert_eq!(missing.kind, ErrorKind::ModelNotFound);

        let invalid = OllamaAdapter.classify_error(400, r#"{"error":"invalid options"}"#, None);
        assert_eq!(invalid.kind, ErrorKind::InvalidRequest);

        let server = OllamaAdapter.classify_error(500, "boom", None);
        assert_eq!(server.kind, ErrorKind::ServerError);
        assert!(server.recoverable);
    }

    #[test]
    fn embeddings_round_trip() {
        let request = EmbeddingsRequest {
            model: String::new(),
            input: vec!["hello".to_string()],
        };
        let parts = OllamaAdapter
            .embeddings_parts(&request, &config())
            .expect("parts");
        assert!(parts.url.ends_with("/api/embed"));

        let response = OllamaAdapter
            .transform_embeddings_response(r#"{"embeddings":[[0.25,0.5]],"prompt_eval_count":3}"#)
            .expect("parse");
        assert_eq!(response.data[0].embedding, vec![0.25, 0.5]);
        assert_eq!(response.usage.prompt_tokens, 3);
    }
}
