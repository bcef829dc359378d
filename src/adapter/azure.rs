//! Azure-hosted OpenAI adapter.
//!
//! 协议与 OpenAI 相同 差异集中在寻址与鉴权：deployment 作为 URL 路径、
//! api-version 作为查询参数、api-key 请求头。

use serde_json::Value;

use crate::adapter::openai::{
    build_chat_body, build_embeddings_body, classify_openai_error, parse_chat_chunk,
    parse_chat_response, parse_embeddings_response,
};
use crate::adapter::{ProviderAdapter, Sealed};
use crate::config::ProviderConfig;
use crate::error::{ErrorKind, ErrorRecord};
use crate::http::HttpRequest;
use crate::types::{
    AdapterCapabilities, CompletionRequest, CostRates, Delta, EmbeddingsRequest,
    EmbeddingsResponse, Response,
};

const DEFAULT_API_VERSION: &str = "2024-10-21";

/// Azure OpenAI Service（deployment 寻址）
pub struct AzureAdapter;

impl Sealed for AzureAdapter {}

impl AzureAdapter {
    /// Azure 的资源地址无法推断 base_url 必填
    fn resource_base<'a>(&self, config: &'a ProviderConfig) -> Result<&'a str, ErrorRecord> {
        config
            .base_url
            .as_deref()
            .map(|base| base.trim_end_matches('/'))
            .ok_or_else(|| {
                ErrorRecord::new(
                    ErrorKind::InvalidConfig,
                    self.name(),
                    "azure requires base_url, e.g. https://<resource>.openai.azure.com",
                )
            })
    }

    /// deployment 优先取 extra 配置 缺省回退为模型名
    fn deployment_url(
        &self,
        config: &ProviderConfig,
        model: &str,
        operation: &str,
    ) -> Result<String, ErrorRecord> {
        let base = self.resource_base(config)?;
        let deployment = config.extra_str("deployment").unwrap_or(model);
        let api_version = config
            .extra_str("api_version")
            .unwrap_or(DEFAULT_API_VERSION);
        Ok(format!(
            "{base}/openai/deployments/{deployment}/{operation}?api-version={api_version}"
        ))
    }

    fn keyed_request(
        &self,
        config: &ProviderConfig,
        url: String,
        body: &Value,
    ) -> Result<HttpRequest, ErrorRecord> {
        let api_key = config.api_key()?;
        let payload = serde_json::to_vec(body).map_err(|err| {
            ErrorRecord::invalid_request(self.name(), format!("failed to serialize request: {err}"))
        })?;
        Ok(HttpRequest::post_json(url, payload)
            .with_header("api-key", api_key)
            .with_header("Accept", "application/json"))
    }
}

impl ProviderAdapter for AzureAdapter {
    fn name(&self) -> &'static str {
        "azure"
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

    fn cost_per_token(&self, _model: &str) -> CostRates {
        // Azure 定价按订阅协商 deployment 名也不等于模型名 统一报零
        CostRates::default()
    }

    fn transform_request(
        &self,
        request: &CompletionRequest,
        config: &ProviderConfig,
        stream: bool,
    ) -> Result<Value, ErrorRecord> {
        let model = config.resolve_model(&request.model)?;
        let mut body = build_chat_body(self.name(), request, model, stream, "max_completion_tokens")?;
        // deployment 已编码在 URL 中 body 不需要 model 字段
        if let Some(object) = body.as_object_mut() {
            object.remove("model");
        }
        Ok(body)
    }

    fn request_parts(
        &self,
        request: &CompletionRequest,
        config: &ProviderConfig,
        stream: bool,
    ) -> Result<HttpRequest, ErrorRecord> {
        let model = config.resolve_model(&request.model)?.to_string();
        let body = self.transform_request(request, config, stream)?;
        let url = self.deployment_url(config, &model, "chat/completions")?;
        self.keyed_request(config, url, &body)
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
        let model = config.resolve_model(&request.model)?.to_string();
        let mut body = build_embeddings_body(request, &model);
        if let Some(object) = body.as_object_mut() {
            object.remove("model");
        }
        let url = self.deployment_url(config, &model, "embeddings")?;
        self.keyed_request(config, url, &body)
    }

    fn transform_embeddings_response(&self, body: &str) -> Result<EmbeddingsResponse, ErrorRecord> {
        parse_embeddings_response(self.name(), body)
    }
}
