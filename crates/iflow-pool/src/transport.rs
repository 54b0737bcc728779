//! Outbound HTTP transport
//!
//! The dispatcher sends every attempt through `Transport`, which keeps retry
//! logic testable against a scripted in-memory implementation.
//! `ReqwestTransport` is the production implementation; it buffers the
//! whole response body and applies a per-attempt timeout.

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use bytes::Bytes;
use reqwest::Method;
use reqwest::header::HeaderMap;
use tracing::debug;

/// A fully built upstream request for one attempt.
#[derive(Debug, Clone)]
pub struct PreparedRequest {
    pub method: Method,
    pub url: String,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// A buffered upstream response.
#[derive(Debug, Clone)]
pub struct UpstreamResponse {
    pub status: u16,
    pub headers: HeaderMap,
    pub body: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Other,
}

/// Failure before any response status was received.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl From<reqwest::Error> for TransportError {
    fn from(e: reqwest::Error) -> Self {
        let kind = if e.is_timeout() {
            TransportErrorKind::Timeout
        } else if e.is_connect() {
            TransportErrorKind::Connect
        } else {
            TransportErrorKind::Other
        };
        // reqwest's top-level message hides the cause; keep the whole chain
        let mut message = e.to_string();
        let mut source = std::error::Error::source(&e);
        while let Some(cause) = source {
            message.push_str(": ");
            message.push_str(&cause.to_string());
            source = cause.source();
        }
        Self { kind, message }
    }
}

/// Sends one prepared request and returns the buffered response.
///
/// Uses `Pin<Box<dyn Future>>` return types for dyn-compatibility
/// (`Arc<dyn Transport>`).
pub trait Transport: Send + Sync {
    fn send(
        &self,
        request: PreparedRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + '_>>;
}

/// `Transport` over a shared reqwest client.
pub struct ReqwestTransport {
    client: reqwest::Client,
    timeout: Duration,
}

impl ReqwestTransport {
    pub fn new(client: reqwest::Client, timeout: Duration) -> Self {
        Self { client, timeout }
    }

    async fn execute(&self, request: PreparedRequest) -> Result<UpstreamResponse, TransportError> {
        debug!(method = %request.method, url = %request.url, "sending upstream request");
        let response = self
            .client
            .request(request.method, &request.url)
            .headers(request.headers)
            .body(request.body)
            .timeout(self.timeout)
            .send()
            .await?;

        let status = response.status().as_u16();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        Ok(UpstreamResponse {
            status,
            headers,
            body,
        })
    }
}

impl Transport for ReqwestTransport {
    fn send(
        &self,
        request: PreparedRequest,
    ) -> Pin<Box<dyn Future<Output = Result<UpstreamResponse, TransportError>> + Send + '_>> {
        Box::pin(self.execute(request))
    }
}
