//! Injected transport boundary.
//!
//! The core never opens sockets or negotiates TLS: adapters produce a plain
//! `{method, url, headers, body}` request and the dispatcher hands it to an
//! [`HttpTransport`] implementation, receiving either a buffered response or an
//! incremental byte stream back. Tests inject in-memory transports; production
//! code typically uses [`reqwest::ReqwestTransport`].

use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_core::Stream;

use crate::error::ErrorRecord;
use crate::retry::retry_after_from_headers;

/// Enumerates HTTP methods understood by the lightweight transport abstraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// Minimal HTTP request representation shared across providers.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    pub headers: HashMap<String, String>,
    pub body: Option<Vec<u8>>,
    pub timeout: Option<Duration>,
}

impl HttpRequest {
    /// Builds a POST request with a JSON request body.
    ///
    /// # Examples
    ///
    /// ```
    /// use tsumugi::http::{HttpMethod, HttpRequest};
    ///
    /// let request = HttpRequest::post_json("https://example.com", br"{}".to_vec());
    /// assert_eq!(request.method, HttpMethod::Post);
    /// assert_eq!(request.headers.get("Content-Type"), Some(&"application/json".to_string()));
    /// ```
    pub fn post_json(url: impl Into<String>, body: Vec<u8>) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: HashMap::from([("Content-Type".to_string(), "application/json".to_string())]),
            body: Some(body),
            timeout: None,
        }
    }

    /// Builds a bodyless GET request, used by health probes.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: HashMap::new(),
            body: None,
            timeout: None,
        }
    }

    /// Inserts or replaces a single header.
    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.insert(name.into(), value.into());
        self
    }
}

/// Minimal HTTP response representation.
#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: Vec<u8>,
}

impl HttpResponse {
    /// Converts the body into a UTF-8 string.
    ///
    /// # Errors
    ///
    /// Returns a connection-kind [`ErrorRecord`] when the body is not valid UTF-8.
    pub fn into_string(self) -> Result<String, ErrorRecord> {
        String::from_utf8(self.body)
            .map_err(|err| ErrorRecord::connection(format!("response body is not UTF-8: {err}")))
    }

    /// Numeric `Retry-After` hint carried by this response, in seconds.
    pub fn retry_after(&self) -> Option<u64> {
        retry_after_from_headers(&self.headers)
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }
}

/// HTTP response that carries a streaming body.
pub struct HttpStreamResponse {
    pub status: u16,
    pub headers: HashMap<String, String>,
    pub body: HttpBodyStream,
}

impl HttpStreamResponse {
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Numeric `Retry-After` hint carried by this response, in seconds.
    pub fn retry_after(&self) -> Option<u64> {
        retry_after_from_headers(&self.headers)
    }
}

/// Alias for the body stream returned by [`HttpTransport::send_stream`].
pub type HttpBodyStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>, ErrorRecord>> + Send>>;

/// Transport abstraction used to decouple the core from the concrete HTTP client.
///
/// Implementations should map network failures to connection/timeout-kind
/// [`ErrorRecord`]s and must not interpret response bodies; classification is
/// the adapters' job.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    /// Sends a request and resolves when the full response is available.
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, ErrorRecord>;

    /// Sends a request and returns a streaming body.
    async fn send_stream(&self, request: HttpRequest) -> Result<HttpStreamResponse, ErrorRecord>;
}

/// Thread-safe handle to a transport implementation.
pub type DynHttpTransport = Arc<dyn HttpTransport>;

pub mod reqwest;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn post_json_sets_content_type_and_body() {
        let request = HttpRequest::post_json("https://example.com/v1", br#"{"a":1}"#.to_vec())
            .with_header("Authorization", "Bearer test");
        assert_eq!(request.method, HttpMethod::Post);
        assert_eq!(request.body.as_deref(), Some(br#"{"a":1}"#.as_slice()));
        assert_eq!(
            request.headers.get("Authorization").map(String::as_str),
            Some("Bearer test")
        );
    }

    #[test]
    fn response_retry_after_reads_header() {
        let response = HttpResponse {
            status: 429,
            headers: HashMap::from([("Retry-After".to_string(), "7".to_string())]),
            body: Vec::new(),
        };
        assert_eq!(response.retry_after(), Some(7));
        assert!(!response.is_success());
    }

    #[test]
    fn into_string_surfaces_invalid_utf8_as_connection_error() {
        let response = HttpResponse {
            status: 200,
            headers: HashMap::new(),
            body: vec![0xff, 0xfe],
        };
        let err = response.into_string().unwrap_err();
        assert_eq!(err.kind, crate::error::ErrorKind::ConnectionError);
    }
}
