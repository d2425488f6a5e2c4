use axum::{
    body::HttpBody,
    extract::{ConnectInfo, MatchedPath, Request, State},
    http::header::CONTENT_LENGTH,
    middleware::Next,
    response::{IntoResponse, Response},
};
use chrono::Utc;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;
use tracing::debug;

use crate::admission::{AdmissionPipeline, AdmissionRequest, RateLimitHeaders};
use crate::telemetry::UsageEvent;

/// State for the admission middleware. One per protected product router.
#[derive(Clone)]
pub struct AdmissionLayerState {
    pub pipeline: AdmissionPipeline,
    /// Product the wrapped routes belong to, for per-product usage counters
    pub product_id: Option<String>,
}

/// Admission middleware for `axum::middleware::from_fn_with_state`.
///
/// Rejected requests never reach the inner service. Admitted requests carry
/// a [`KeyContext`](crate::admission::KeyContext) extension, get rate limit
/// headers on the response and produce one usage event.
pub async fn admission_layer(
    State(state): State<Arc<AdmissionLayerState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let started = Instant::now();

    // Owned copies; the request body is not Sync so it cannot be borrowed across awaits
    let headers = request.headers().clone();
    let method = request.method().as_str().to_string();
    let path = request
        .extensions()
        .get::<MatchedPath>()
        .map(|p| p.as_str().to_string())
        .unwrap_or_else(|| request.uri().path().to_string());
    let query = request.uri().query().map(str::to_string);
    let remote_addr = request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.ip());

    let admission = state
        .pipeline
        .admit(AdmissionRequest {
            headers: &headers,
            query: query.as_deref(),
            remote_addr,
            method: &method,
            path: &path,
        })
        .await;

    let admitted = match admission {
        Ok(admitted) => admitted,
        Err(rejection) => {
            debug!(
                code = rejection.error.code(),
                method = %method,
                path = %path,
                "Request rejected"
            );
            return rejection.into_response();
        }
    };

    let key_id = admitted.context.record.id.clone();
    request.extensions_mut().insert(admitted.context);
    let bytes_in = content_length(&headers);

    let mut response = next.run(request).await;
    if let Some(decision) = &admitted.rate {
        RateLimitHeaders::apply(response.headers_mut(), decision);
    }

    let bytes_out = response
        .headers()
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .or_else(|| response.body().size_hint().exact())
        .unwrap_or(0);

    let mut event = UsageEvent::new(
        &key_id,
        &format!("{} {}", method, path),
        response.status().as_u16(),
        Utc::now(),
    );
    event.product_id = state.product_id.clone();
    event.latency_ms = started.elapsed().as_millis() as u64;
    event.bytes_in = bytes_in;
    event.bytes_out = bytes_out;
    state.pipeline.record_completion(event);

    response
}

fn content_length(headers: &axum::http::HeaderMap) -> u64 {
    headers
        .get(CONTENT_LENGTH)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.parse().ok())
        .unwrap_or(0)
}
