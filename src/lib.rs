//! 多供应商 LLM 统一调用库
//!
//! 一套规范的请求/响应/流式增量模型 覆盖 OpenAI、Anthropic、Gemini、Mistral、
//! Bedrock、Azure、Ollama、OpenRouter 八家后端。传输层通过 [`http::HttpTransport`]
//! 注入 调度通过 [`dispatcher::Dispatcher`] 的有界工作池执行。

pub mod adapter;
pub mod config;
pub mod dispatcher;
pub mod engine;
pub mod error;
pub mod http;
pub mod retry;
pub mod sse;
pub mod types;

pub use adapter::{ProviderAdapter, ProviderKind};
pub use config::{Credential, ProviderConfig};
pub use dispatcher::{DispatchFuture, Dispatcher, DispatcherConfig, ProviderHealth};
pub use engine::DeltaStream;
pub use error::{ErrorKind, ErrorRecord};
pub use retry::RetryPolicy;
pub use types::*;
