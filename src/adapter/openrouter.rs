//! OpenRouter adapter.
//!
//! OpenAI 兼容的聚合网关 推理内容以 reasoning 字段透传 额外支持
//! HTTP-Referer / X-Title 归因头。

use serde_json::{Value, json};

use crate::adapter::openai::{
    build_bearer_request, build_chat_body, classify_openai_error, parse_chat_chunk,
    parse_chat_response,
};
use crate::adapter::{ProviderAdapter, Sealed};
use crate::config::ProviderConfig;
use crate::error::{ErrorKind, ErrorRecord};
use crate::http::HttpRequest;
use crate::types::{AdapterCapabilities, CompletionRequest, CostRates, Delta, Response};

const DEFAULT_BASE_URL: &str = "https://openrouter.ai/api/v1";

/// OpenRouter 聚合网关
pub struct OpenRouterAdapter;

impl Sealed for OpenRouterAdapter {}

impl ProviderAdapter for OpenRouterAdapter {
    fn name(&self) -> &'static str {
        "openrouter"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_streaming: true,
            supports_tools: true,
            supports_embeddings: false,
        }
    }

    fn supports_reasoning(&self, _model: &str) -> bool {
        // 网关把 reasoning 配置透传给底层模型 由上游决定是否生效
        true
    }

    fn cost_per_token(&self, _model: &str) -> CostRates {
        // 路由到的底层模型价格各异 不在本地维护价目表
        CostRates::default()
    }

    fn transform_request(
        &self,
        request: &CompletionRequest,
        config: &ProviderConfig,
        stream: bool,
    ) -> Result<Value, ErrorRecord> {
        let model = config.resolve_model(&request.model)?;
        let mut body = build_chat_body(self.name(), request, model, stream, "max_tokens")?;
        if let Some(object) = body.as_object_mut() {
            // OpenRouter 的 reasoning 配置是嵌套对象
            object.remove("reasoning_effort");
            if let Some(effort) = request.reasoning_effort {
                object.insert(
                    "reasoning".to_string(),
                    json!({ "effort": effort.as_str() }),
                );
            } else if let Some(thinking) = &request.thinking {
                if thinking.enabled {
                    object.insert(
                        "reasoning".to_string(),
                        json!({ "max_tokens": thinking.budget_tokens }),
                    );
                }
            }
        }
        Ok(body)
    }

    fn request_parts(
        &self,
        request: &CompletionRequest,
        config: &ProviderConfig,
        stream: bool,
    ) -> Result<HttpRequest, ErrorRecord> {
        let body = self.transform_request(request, config, stream)?;
        let url = format!("{}/chat/completions", config.base_url_or(DEFAULT_BASE_URL));
        let mut parts = build_bearer_request(self.name(), config, url, &body)?;
        // 归因头用于 openrouter.ai 的应用排行 可选
        if let Some(referer) = config.extra_str("referer") {
            parts = parts.with_header("HTTP-Referer", referer);
        }
        if let Some(title) = config.extra_str("title") {
            parts = parts.with_header("X-Title", title);
        }
        Ok(parts)
    }

    fn transform_response(&self, body: &str) -> Result<Response, ErrorRecord> {
        parse_chat_response(self.name(), body)
    }

    fn transform_chunk(&self, frame: &str) -> Result<Option<Delta>, ErrorRecord> {
        parse_chat_chunk(self.name(), frame)
    }

    fn classify_error(&self, status: u16, body: &str, retry_after: Option<u64>) -> ErrorRecord {
        // 402 表示账户额度耗尽 其余沿用 openai 分类表
        if status == 402 {
            let mut record = classify_openai_error(self.name(), status, body, retry_after);
            record.kind = ErrorKind::QuotaExceeded;
            record.recoverable = false;
            return record;
        }
        classify_openai_error(self.name(), status, body, retry_after)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adapter::ProviderKind;
    use crate::config::Credential;
    use crate::types::{Message, ReasoningEffort};

    fn config() -> ProviderConfig {
        ProviderConfig::new(
            ProviderKind::OpenRouter,
            Credential::Bearer {
                token: "or-key".to_string(),
            },
        )
        .with_model("anthropic/claude-sonnet-4")
        .with_extra("referer", json!("https://example.app"))
        .with_extra("title", json!("Example App"))
    }

    #[test]
    fn attribution_headers_are_forwarded() {
        let request = CompletionRequest {
            messages: vec![Message::user("hi")],
            ..CompletionRequest::default()
        };
        let parts = OpenRouterAdapter
            .request_parts(&request, &config(), false)
            .expect("parts");
        assert_eq!(parts.url, "https://openrouter.ai/api/v1/chat/completions");
        assert_eq!(
            parts.headers.get("HTTP-Referer").map(String::as_str),
            Some("https://example.app")
        );
        assert_eq!(
            parts.headers.get("X-Title").map(String::as_str),
            Some("Example App")
        );
    }

    #[test]
    fn reasoning_effort_becomes_nested_reasoning_object() {
        let request = CompletionRequest {
            messages: vec![Message::user("hi")],
            reasoning_effort: Some(ReasoningEffort::High),
            ..CompletionRequest::default()
        };
        let body = OpenRouterAdapter
            .transform_request(&request, &config(), false)
            .expect("body builds");
        assert_eq!(body["reasoning"]["effort"], json!("high"));
        assert!(body.get("reasoning_effort").is_none());
    }

    #[test]
    fn reasoning_content_is_surfaced_from_responses() {
        let response = OpenRouterAdapter
            .transform_response(
                r#"{"choices":[{"index":0,"message":{"role":"assistant","content":"42","reasoning_content":"thought about it"},"finish_reason":"stop"}]}"#,
            )
            .expect("parse");
        assert_eq!(
            response.choices[0].message.reasoning_content.as_deref(),
            Some("thought about it")
        );
    }

    #[test]
    fn status_402_maps_to_quota_exceeded() {
        let err = OpenRouterAdapter.classify_error(
            402,
            r#"{"error":{"message":"Insufficient credits","code":402}}"#,
            None,
        );
        assert_eq!(err.kind, ErrorKind::QuotaExceeded);
        assert!(!err.recoverable);

        let limited = OpenRouterAdapter.classify_error(429, "{}", Some(3));
        assert_eq!(limited.kind, ErrorKind::RateLimit);
    }

    #[test]
    fn embeddings_are_gated_off() {
        let err = OpenRouterAdapter
            .embeddings_parts(&crate::types::EmbeddingsRequest::default(), &config())
            .unwrap_err();
        assert_eq!(err.kind, ErrorKind::UnsupportedFeature);
    }
}
