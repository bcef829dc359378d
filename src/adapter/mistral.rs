//! Mistral adapter.
//!
//! La Plateforme 的协议与 OpenAI chat/completions 高度兼容 复用 openai 模块的
//! 构建与解析 仅覆盖字段名与词汇差异。

use serde_json::{Value, json};

use crate::adapter::openai::{
    build_bearer_request, build_chat_body, build_embeddings_body, classify_openai_error,
    parse_chat_chunk, parse_chat_response, parse_embeddings_response,
};
use crate::adapter::{ProviderAdapter, Sealed};
use crate::config::ProviderConfig;
use crate::error::ErrorRecord;
use crate::http::HttpRequest;
use crate::types::{
    AdapterCapabilities, CompletionRequest, CostRates, Delta, EmbeddingsRequest,
    EmbeddingsResponse, Response, ToolChoice,
};

const DEFAULT_BASE_URL: &str = "https://api.mistral.ai/v1";

/// Mistral La Plateforme（OpenAI 兼容端点）
pub struct MistralAdapter;

impl Sealed for MistralAdapter {}

impl ProviderAdapter for MistralAdapter {
    fn name(&self) -> &'static str {
        "mistral"
    }

    fn capabilities(&self) -> AdapterCapabilities {
        AdapterCapabilities {
            supports_streaming: true,
            supports_tools: true,
            supports_embeddings: true,
        }
    }

    fn supports_reasoning(&self, model: &str) -> bool {
        model.contains("magistral")
    }

    fn cost_per_token(&self, model: &str) -> CostRates {
        if model.contains("mistral-large") {
            CostRates { input: 2.0e-6, output: 6.0e-6 }
        } else if model.contains("magistral") {
            CostRates { input: 2.0e-6, output: 5.0e-6 }
        } else if model.contains("mistral-small") {
            CostRates { input: 0.1e-6, output: 0.3e-6 }
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
        // Mistral 仍使用 max_tokens 字段名
        let mut body = build_chat_body(self.name(), request, model, stream, "max_tokens")?;
        if let Some(object) = body.as_object_mut() {
            // 强制工具调用的词汇是 any 且不支持 stream_options
            if matches!(request.tool_choice, Some(ToolChoice::Required)) {
                object.insert("tool_choice".to_string(), json!("any"));
            }
            object.remove("stream_options");
            object.remove("reasoning_effort");
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
