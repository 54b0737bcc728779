//! HTTP proxy logic
//!
//! Receives inbound requests, strips hop-by-hop headers, parses the JSON
//! body, and hands the request to the dispatcher, which attaches an
//! account's credential and handles failover. The upstream response is
//! returned verbatim (including terminal error statuses from upstream).

use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Instant;

use axum::body::Body;
use axum::http::header::{CONTENT_LENGTH, CONTENT_TYPE, HOST};
use axum::http::{HeaderMap, Request, StatusCode};
use axum::response::{IntoResponse, Response};
use iflow_pool::{Budget, Dispatcher, OutboundRequest, UpstreamResponse};
use tracing::{error, instrument, warn};

use crate::metrics::{self, ServiceMetrics};

/// Headers to strip before forwarding (hop-by-hop per RFC 2616 Section 13.5.1)
const HOP_BY_HOP_HEADERS: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Largest inbound body accepted.
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Shared state passed to the proxy handler
#[derive(Clone)]
pub struct ProxyState {
    pub dispatcher: Arc<Dispatcher>,
    pub upstream_url: String,
    pub metrics: ServiceMetrics,
}

/// Why a request did not produce an upstream response.
enum Failure {
    InvalidBody(String),
    Dispatch(iflow_pool::Error),
}

/// JSON error response: {"error":{"type":"...","message":"...","request_id":"req_..."}}
fn error_response(status: StatusCode, error_type: &str, message: &str, request_id: &str) -> Response {
    let body = serde_json::json!({
        "error": {
            "type": error_type,
            "message": message,
            "request_id": request_id,
        }
    });
    (status, [(CONTENT_TYPE, "application/json")], body.to_string()).into_response()
}

/// Gateway status for a dispatch error that has no upstream response.
pub fn dispatch_error_status(err: &iflow_pool::Error) -> StatusCode {
    use iflow_pool::Error;
    match err {
        Error::NoAccounts | Error::NoHealthyAccount => StatusCode::SERVICE_UNAVAILABLE,
        Error::BudgetExceeded(Budget::Iterations(_)) => StatusCode::SERVICE_UNAVAILABLE,
        Error::BudgetExceeded(Budget::Time(_)) => StatusCode::GATEWAY_TIMEOUT,
        Error::Network(_) | Error::TokenRefreshFailed(_) => StatusCode::BAD_GATEWAY,
        Error::Upstream { status, .. } => {
            StatusCode::from_u16(*status).unwrap_or(StatusCode::BAD_GATEWAY)
        }
        Error::Persistence(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

/// Forward one inbound request through the dispatcher.
#[instrument(skip_all, fields(request_id = %request_id, method = %request.method(), path = %request.uri().path()))]
pub async fn proxy_request(state: &ProxyState, request: Request<Body>, request_id: String) -> Response {
    let started = Instant::now();
    state.metrics.requests_total.fetch_add(1, Ordering::Relaxed);
    let method = request.method().to_string();

    let response = match forward(state, request).await {
        Ok(upstream) => upstream_response(upstream, &request_id),
        Err(failure) => {
            state.metrics.errors_total.fetch_add(1, Ordering::Relaxed);
            failure_response(failure, &request_id)
        }
    };

    metrics::record_request(
        response.status().as_u16(),
        &method,
        started.elapsed().as_secs_f64(),
    );
    response
}

async fn forward(state: &ProxyState, request: Request<Body>) -> Result<UpstreamResponse, Failure> {
    let (parts, body) = request.into_parts();

    let url = match parts.uri.path_and_query() {
        Some(pq) => format!("{}{}", state.upstream_url.trim_end_matches('/'), pq),
        None => state.upstream_url.clone(),
    };

    let mut headers = HeaderMap::new();
    for (name, value) in &parts.headers {
        if !is_hop_by_hop(name.as_str()) && name != HOST {
            headers.append(name.clone(), value.clone());
        }
    }

    let bytes = axum::body::to_bytes(body, MAX_BODY_BYTES)
        .await
        .map_err(|e| Failure::InvalidBody(format!("failed to read request body: {e}")))?;
    let body = if bytes.is_empty() {
        None
    } else {
        let value = serde_json::from_slice(&bytes)
            .map_err(|e| Failure::InvalidBody(format!("request body is not valid JSON: {e}")))?;
        Some(value)
    };

    state
        .dispatcher
        .fetch(OutboundRequest {
            method: parts.method,
            url,
            headers,
            body,
        })
        .await
        .map_err(Failure::Dispatch)
}

fn upstream_response(upstream: UpstreamResponse, request_id: &str) -> Response {
    let status = StatusCode::from_u16(upstream.status).unwrap_or(StatusCode::BAD_GATEWAY);
    let mut response = Response::builder().status(status);
    for (name, value) in &upstream.headers {
        if !is_hop_by_hop(name.as_str()) {
            response = response.header(name, value);
        }
    }
    response
        .body(Body::from(upstream.body))
        .unwrap_or_else(|e| {
            error_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "proxy_error",
                &format!("response build error: {e}"),
                request_id,
            )
        })
}

fn failure_response(failure: Failure, request_id: &str) -> Response {
    match failure {
        Failure::InvalidBody(message) => {
            warn!(error = %message, "rejecting request");
            error_response(StatusCode::BAD_REQUEST, "invalid_request", &message, request_id)
        }
        Failure::Dispatch(err) => {
            metrics::record_dispatch_error(err.kind());
            let status = dispatch_error_status(&err);
            match err {
                iflow_pool::Error::Upstream {
                    status,
                    mut headers,
                    body,
                } => {
                    warn!(status, "upstream rejected request");
                    // The body was decoded lossily; let the server recompute its length.
                    headers.remove(CONTENT_LENGTH);
                    upstream_response(
                        UpstreamResponse {
                            status,
                            headers,
                            body: body.into(),
                        },
                        request_id,
                    )
                }
                err => {
                    error!(error = %err, status = status.as_u16(), "dispatch failed");
                    error_response(status, err.kind(), &err.to_string(), request_id)
                }
            }
        }
    }
}

/// Check if a header is hop-by-hop (should be stripped before forwarding)
pub fn is_hop_by_hop(name: &str) -> bool {
    HOP_BY_HOP_HEADERS
        .iter()
        .any(|h| h.eq_ignore_ascii_case(name))
}
