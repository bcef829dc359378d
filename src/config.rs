use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::adapter::ProviderKind;
use crate::error::{ErrorKind, ErrorRecord};

/// 已解析的调用目标 由外部配置层（静态配置/动态路由等）给出
///
/// 本 crate 不关心配置如何被选中，只消费最终的 provider/model/credential/base_url。
/// 配置在并发调用间只读共享，无需加锁。
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProviderConfig {
    pub provider: ProviderKind,
    /// 默认模型 当请求未携带 model 时回退使用
    pub model: Option<String>,
    pub credential: Credential,
    /// 自定义 base_url，便于接入代理或兼容层
    pub base_url: Option<String>,
    /// 附加设置 例如 azure 的 deployment/api_version 或 anthropic 的 beta 头
    #[serde(default)]
    pub extra: HashMap<String, Value>,
}

impl ProviderConfig {
    /// 使用默认 base_url 与空 extra 创建配置
    pub fn new(provider: ProviderKind, credential: Credential) -> Self {
        Self {
            provider,
            model: None,
            credential,
            base_url: None,
            extra: HashMap::new(),
        }
    }

    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn with_extra(mut self, key: impl Into<String>, value: Value) -> Self {
        self.extra.insert(key.into(), value);
        self
    }

    /// 取出 API Key 类凭证 Bearer token 也按 key 处理
    pub(crate) fn api_key(&self) -> Result<&str, ErrorRecord> {
        match &self.credential {
            Credential::ApiKey { key } => Ok(key),
            Credential::Bearer { token } => Ok(token),
            Credential::None => Err(ErrorRecord::new(
                ErrorKind::InvalidConfig,
                self.provider.as_str(),
                "provider requires a credential but none was configured",
            )),
        }
    }

    /// base_url 兜底到各 provider 默认值 并移除末尾斜杠
    pub(crate) fn base_url_or<'a>(&'a self, default: &'a str) -> &'a str {
        self.base_url
            .as_deref()
            .unwrap_or(default)
            .trim_end_matches('/')
    }

    /// 读取 extra 中的字符串配置
    pub(crate) fn extra_str(&self, key: &str) -> Option<&str> {
        self.extra.get(key).and_then(Value::as_str)
    }

    /// 解析本次调用的模型名 请求优先 配置兜底
    pub(crate) fn resolve_model<'a>(&'a self, requested: &'a str) -> Result<&'a str, ErrorRecord> {
        if !requested.is_empty() {
            return Ok(requested);
        }
        self.model.as_deref().ok_or_else(|| {
            ErrorRecord::new(
                ErrorKind::InvalidConfig,
                self.provider.as_str(),
                "no model in request and no default model configured",
            )
        })
    }
}

/// 鉴权信息
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// 简单 API Key
    ApiKey { key: String },
    /// Bearer Token
    Bearer { token: String },
    /// 无需鉴权的本地 provider 例如 Ollama
    None,
}
