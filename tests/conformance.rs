//! Cross-provider conformance suite: every adapter must satisfy the same
//! canonical-model laws regardless of its wire protocol.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::stream;
use tsumugi::adapter::ProviderKind;
use tsumugi::config::{Credential, ProviderConfig};
use tsumugi::dispatcher::{Dispatcher, DispatcherConfig};
use tsumugi::error::{ErrorKind, ErrorRecord};
use tsumugi::http::{
    HttpBodyStream, HttpRequest, HttpResponse, HttpStreamResponse, HttpTransport,
};
use tsumugi::retry::RetryPolicy;
use tsumugi::types::{CompletionRequest, FinishReason, Message, StreamItem};

/// 同一段内容的完整响应与分帧流 供拼接律测试使用
struct PairedTransport {
    sync_body: &'static str,
    stream_frames: Vec<Vec<u8>>,
}

#[async_trait]
impl HttpTransport for PairedTransport {
    async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, ErrorRecord> {
        Ok(HttpResponse {
            status: 200,
            headers: HashMap::new(),
            body: self.sync_body.as_bytes().to_vec(),
        })
    }

    async fn send_stream(
        &self,
        _request: HttpRequest,
    ) -> Result<HttpStreamResponse, ErrorRecord> {
        let frames = self
            .stream_frames
            .clone()
            .into_iter()
            .map(Ok::<_, ErrorRecord>)
            .collect::<Vec<_>>();
        let body: HttpBodyStream = Box::pin(stream::iter(frames));
        Ok(HttpStreamResponse {
            status: 200,
            headers: HashMap::new(),
            body,
        })
    }
}

fn dispatcher(transport: Arc<dyn HttpTransport>) -> Dispatcher {
    Dispatcher::new(
        transport,
        DispatcherConfig {
            retry: RetryPolicy::disabled(),
            shutdown_timeout: Duration::from_millis(200),
            ..DispatcherConfig::default()
        },
    )
}

fn config_for(kind: ProviderKind) -> ProviderConfig {
    let credential = match kind {
        ProviderKind::Ollama => Credential::None,
        _ => Credential::ApiKey {
            key: "test-key".to_string(),
        },
    };
    let mut config = ProviderConfig::new(kind, credential).with_model("test-model");
    if kind == ProviderKind::Azure {
        config = config.with_base_url("https://acme.openai.azure.com");
    }
    config
}

fn simple_request() -> CompletionRequest {
    CompletionRequest {
        messages: vec![Message::user("weather in Paris?")],
        ..CompletionRequest::default()
    }
}

async fn collect_stream_content(
    dispatcher: &Dispatcher,
    config: ProviderConfig,
) -> (String, Option<FinishReason>) {
    let mut stream = dispatcher
        .dispatch_stream(simple_request(), config)
        .expect("stream opens");
    let mut content = String::new();
    let mut finish = None;
    while let Some(item) = stream.recv().await {
        match item {
            StreamItem::Delta(delta) => {
                if delta.index == 0 {
                    if let Some(text) = &delta.content {
                        content.push_str(text);
                    }
                }
                if delta.finish_reason.is_some() {
                    finish = delta.finish_reason;
                }
            }
            StreamItem::Error(record) => panic!("stream failed: {record}"),
        }
    }
    (content, finish)
}

/// 流式拼接律：index 0 全部 content 增量拼接 == 非流式响应的 content
async fn assert_concatenation_law(
    kind: ProviderKind,
    sync_body: &'static str,
    stream_frames: Vec<Vec<u8>>,
) {
    let transport = Arc::new(PairedTransport {
        sync_body,
        stream_frames,
    });
    let dispatcher = dispatcher(transport);

    let response = dispatcher
        .dispatch(simple_request(), config_for(kind))
        .await
        .expect("sync response");
    let expected = response.content().expect("content").to_string();

    let (streamed, finish) = collect_stream_content(&dispatcher, config_for(kind)).await;
    assert_eq!(streamed, expected, "provider {kind}");
    assert_eq!(finish, Some(FinishReason::Stop), "provider {kind}");

    dispatcher.shutdown().await;
}

#[tokio::test]
async fn streaming_concatenation_law_holds_for_openai() {
    assert_concatenation_law(
        ProviderKind::OpenAi,
        r#"{"id":"r1","model":"test-model","choices":[{"index":0,"message":{"role":"assistant","content":"It is sunny in Paris."},"finish_reason":"stop"}],"usage":{"prompt_tokens":5,"completion_tokens":6,"total_tokens":11}}"#,
        vec![
            b"data: {\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"It is \"}}]}\n\n".to_vec(),
            b"data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"sunny in \"}}]}\n\n".to_vec(),
            b"data: {\"choices\":[{\"index\":0,\"delta\":{\"content\":\"Paris.\"},\"finish_reason\":\"stop\"}]}\n\n".to_vec(),
            b"data: [DONE]\n\n".to_vec(),
        ],
    )
    .await;
}

#[tokio::test]
async fn streaming_concatenation_law_holds_for_anthropic() {
    assert_concatenation_law(
        ProviderKind::Anthropic,
        r#"{"id":"msg_1","model":"test-model","content":[{"type":"text","text":"It is sunny in Paris."}],"stop_reason":"end_turn","usage":{"input_tokens":5,"output_tokens":6}}"#,
        vec![
            b"data: {\"type\":\"message_start\",\"message\":{\"usage\":{\"input_tokens\":5}}}\n\n".to_vec(),
            b"data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"It is \"}}\n\n".to_vec(),
            b"data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"sunny in \"}}\n\n".to_vec(),
            b"data: {\"type\":\"content_block_delta\",\"index\":0,\"delta\":{\"type\":\"text_delta\",\"text\":\"Paris.\"}}\n\n".to_vec(),
            b"data: {\"type\":\"message_delta\",\"delta\":{\"stop_reason\":\"end_turn\"},\"usage\":{\"output_tokens\":6}}\n\n".to_vec(),
            b"data: {\"type\":\"message_stop\"}\n\n".to_vec(),
        ],
    )
    .await;
}

#[tokio::test]
async fn streaming_concatenation_law_holds_for_gemini() {
    assert_concatenation_law(
        ProviderKind::Gemini,
        r#"{"candidates":[{"content":{"role":"model","parts":[{"text":"It is sunny in Paris."}]},"finishReason":"STOP","index":0}],"usageMetadata":{"promptTokenCount":5,"candidatesTokenCount":6,"totalTokenCount":11}}"#,
        vec![
            b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"It is \"}]},\"index\":0}]}\n\n".to_vec(),
            b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"sunny in \"}]},\"index\":0}]}\n\n".to_vec(),
            b"data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"Paris.\"}]},\"finishReason\":\"STOP\",\"index\":0}]}\n\n".to_vec(),
        ],
    )
    .await;
}

#[tokio::test]
async fn streaming_concatenation_law_holds_for_bedrock() {
    assert_concatenation_law(
        ProviderKind::Bedrock,
        r#"{"output":{"message":{"role":"assistant","content":[{"text":"It is sunny in Paris."}]}},"stopReason":"end_turn","usage":{"inputTokens":5,"outputTokens":6,"totalTokens":11}}"#,
        vec![
            b"data: {\"messageStart\":{\"role\":\"assistant\"}}\n\n".to_vec(),
            b"data: {\"contentBlockDelta\":{\"contentBlockIndex\":0,\"delta\":{\"text\":\"It is \"}}}\n\n".to_vec(),
            b"data: {\"contentBlockDelta\":{\"contentBlockIndex\":0,\"delta\":{\"text\":\"sunny in \"}}}\n\n".to_vec(),
            b"data: {\"contentBlockDelta\":{\"contentBlockIndex\":0,\"delta\":{\"text\":\"Paris.\"}}}\n\n".to_vec(),
            b"data: {\"messageStop\":{\"stopReason\":\"end_turn\"}}\n\n".to_vec(),
            b"data: {\"metadata\":{\"usage\":{\"inputTokens\":5,\"outputTokens\":6,\"totalTokens\":11}}}\n\n".to_vec(),
        ],
    )
    .await;
}

#[tokio::test]
async fn streaming_concatenation_law_holds_for_ollama() {
    assert_concatenation_law(
        ProviderKind::Ollama,
        r#"{"model":"test-model","message":{"role":"assistant","content":"It is sunny in Paris."},"done":true,"done_reason":"stop","prompt_eval_count":5,"eval_count":6}"#,
        vec![
            b"{\"message\":{\"role\":\"assistant\",\"content\":\"It is \"},\"done\":false}\n".to_vec(),
            b"{\"message\":{\"role\":\"assistant\",\"content\":\"sunny in \"},\"done\":false}\n".to_vec(),
            b"{\"message\":{\"role\":\"assistant\",\"content\":\"Paris.\"},\"done\":false}\n".to_vec(),
            b"{\"message\":{\"role\":\"assistant\",\"content\":\"\"},\"done\":true,\"done_reason\":\"stop\",\"prompt_eval_count\":5,\"eval_count\":6}\n".to_vec(),
        ],
    )
    .await;
}

/// system 抽取：Anthropic/Gemini/Bedrock 的消息列表只剩 user 轮 X 被搬到 system 域
#[test]
fn system_extraction_relocates_system_content() {
    let request = CompletionRequest {
        messages: vec![Message::system("X"), Message::user("Y")],
        ..CompletionRequest::default()
    };

    let anthropic = ProviderKind::Anthropic
        .adapter()
        .transform_request(&request, &config_for(ProviderKind::Anthropic), false)
        .expect("anthropic body");
    assert_eq!(anthropic["system"], serde_json::json!("X"));
    assert_eq!(anthropic["messages"].as_array().unwrap().len(), 1);

    let gemini = ProviderKind::Gemini
        .adapter()
        .transform_request(&request, &config_for(ProviderKind::Gemini), false)
        .expect("gemini body");
    assert_eq!(
        gemini["system_instruction"]["parts"][0]["text"],
        serde_json::json!("X")
    );
    assert_eq!(gemini["contents"].as_array().unwrap().len(), 1);

    let bedrock = ProviderKind::Bedrock
        .adapter()
        .transform_request(&request, &config_for(ProviderKind::Bedrock), false)
        .expect("bedrock body");
    assert_eq!(bedrock["system"][0]["text"], serde_json::json!("X"));
    assert_eq!(bedrock["messages"].as_array().unwrap().len(), 1);
}

/// 工具调用参数编码律：提供方原生 payload 的参数变换后必须是字面 JSON 字符串
#[test]
fn tool_call_arguments_are_literal_json_strings() {
    let expected = "{\"location\":\"Paris\"}";

    let cases: Vec<(ProviderKind, &str)> = vec![
        (
            ProviderKind::OpenAi,
            r#"{"choices":[{"index":0,"message":{"role":"assistant","tool_calls":[{"id":"c1","type":"function","function":{"name":"get_weather","arguments":"{\"location\":\"Paris\"}"}}]},"finish_reason":"tool_calls"}]}"#,
        ),
        (
            ProviderKind::Anthropic,
            r#"{"content":[{"type":"tool_use","id":"c1","name":"get_weather","input":{"location":"Paris"}}],"stop_reason":"tool_use"}"#,
        ),
        (
            ProviderKind::Gemini,
            r#"{"candidates":[{"content":{"parts":[{"functionCall":{"name":"get_weather","args":{"location":"Paris"}}}]},"finishReason":"STOP"}]}"#,
        ),
        (
            ProviderKind::Bedrock,
            r#"{"output":{"message":{"content":[{"toolUse":{"toolUseId":"c1","name":"get_weather","input":{"location":"Paris"}}}]}},"stopReason":"tool_use"}"#,
        ),
        (
            ProviderKind::Ollama,
            r#"{"message":{"role":"assistant","content":"","tool_calls":[{"function":{"name":"get_weather","arguments":{"location":"Paris"}}}]},"done":true,"done_reason":"stop"}"#,
        ),
    ];

    for (kind, body) in cases {
        let response = kind
            .adapter()
            .transform_response(body)
            .unwrap_or_else(|err| panic!("{kind}: {err}"));
        let calls = response.tool_calls();
        assert_eq!(calls.len(), 1, "provider {kind}");
        assert_eq!(calls[0].function.arguments, expected, "provider {kind}");
        assert_eq!(
            response.choices[0].finish_reason,
            Some(FinishReason::ToolCalls),
            "provider {kind}"
        );
    }
}

/// 每家 adapter 对记录在案的状态码给出约定的 kind 与 recoverable 标志
#[test]
fn error_classification_table_is_uniform_across_providers() {
    let kinds = [
        ProviderKind::OpenAi,
        ProviderKind::Anthropic,
        ProviderKind::Gemini,
        ProviderKind::Mistral,
        ProviderKind::Bedrock,
        ProviderKind::Azure,
        ProviderKind::Ollama,
        ProviderKind::OpenRouter,
    ];

    for kind in kinds {
        let adapter = kind.adapter();

        let auth = adapter.classify_error(401, "{}", None);
        assert_eq!(auth.kind, ErrorKind::AuthenticationError, "{kind} 401");
        assert!(!auth.recoverable, "{kind} 401");

        let forbidden = adapter.classify_error(403, "{}", None);
        assert_eq!(forbidden.kind, ErrorKind::AuthorizationError, "{kind} 403");
        assert!(!forbidden.recoverable, "{kind} 403");

        // Ollama 的 404 语义依赖 body 其余供应商一律 model-not-found
        if kind != ProviderKind::Ollama {
            let missing = adapter.classify_error(404, "{}", None);
            assert_eq!(missing.kind, ErrorKind::ModelNotFound, "{kind} 404");
            assert!(!missing.recoverable, "{kind} 404");
        }

        let limited = adapter.classify_error(429, "{}", Some(60));
        assert_eq!(limited.kind, ErrorKind::RateLimit, "{kind} 429");
        assert!(limited.recoverable, "{kind} 429");
        assert_eq!(limited.retry_after, Some(60), "{kind} 429");

        for status in [500u16, 501, 502, 503, 504] {
            let server = adapter.classify_error(status, "{}", None);
            assert_eq!(server.kind, ErrorKind::ServerError, "{kind} {status}");
            assert!(server.recoverable, "{kind} {status}");
        }
    }
}

/// 取消界限：丢弃流通道后 引擎必须在限定时间内释放底层连接
#[tokio::test]
async fn dropping_a_stream_releases_the_connection_within_one_second() {
    /// 挂起的流 永不产出任何字节
    struct HangingStreamTransport;

    #[async_trait]
    impl HttpTransport for HangingStreamTransport {
        async fn send(&self, _request: HttpRequest) -> Result<HttpResponse, ErrorRecord> {
            panic!("send not used");
        }
        async fn send_stream(
            &self,
            _request: HttpRequest,
        ) -> Result<HttpStreamResponse, ErrorRecord> {
            let body: HttpBodyStream = Box::pin(stream::pending());
            Ok(HttpStreamResponse {
                status: 200,
                headers: HashMap::new(),
                body,
            })
        }
    }

    let dispatcher = dispatcher(Arc::new(HangingStreamTransport));
    let stream = dispatcher
        .dispatch_stream(simple_request(), config_for(ProviderKind::OpenAi))
        .expect("stream opens");

    // 等引擎启动后丢弃消费端
    tokio::time::sleep(Duration::from_millis(20)).await;
    drop(stream);

    // 引擎退出后 shutdown 应当立即完成 整体必须在 1 秒内结束
    tokio::time::timeout(Duration::from_secs(1), dispatcher.shutdown())
        .await
        .expect("engine must release the connection promptly");
}

/// retry_after 的精确性与退避单调性跨供应商成立
#[test]
fn retry_policy_laws_hold_for_classified_records() {
    let policy = RetryPolicy {
        max_attempts: 6,
        base_delay: Duration::from_millis(200),
        max_delay: Duration::from_secs(8),
    };

    // provider 提供 retry_after 时任何 attempt 都精确等于该值
    let hinted = ProviderKind::OpenAi
        .adapter()
        .classify_error(429, "{}", Some(60));
    for attempt in 0..5 {
        assert_eq!(policy.delay(attempt, &hinted), Duration::from_secs(60));
    }

    // 没有 retry_after 时退避单调不减且不超过上限
    let unhinted = ProviderKind::Gemini.adapter().classify_error(503, "{}", None);
    let mut previous = Duration::ZERO;
    for attempt in 0..8 {
        let delay = policy.delay(attempt, &unhinted);
        assert!(delay >= previous);
        assert!(delay <= policy.max_delay);
        previous = delay;
    }
}
