//! The forwarding engine: candidate ordering, header hygiene, body rewrite,
//! the attempt loop, and streaming-vs-unary dispatch. This is the core of
//! the gateway; everything else (config, health, trace, auth) exists to
//! support it. Grounded on the teacher crate's `router.rs` attempt loop
//! (`AppState` + `TryRequestError` + tier fallthrough) generalized from
//! latency-tiered fallback to the health-weighted candidate order below.

use crate::app::AppState;
use crate::auth::AuthenticatedKey;
use crate::config::{Protocol, Provider};
use crate::error::GatewayError;
use crate::trace::{self, Attempt, CapturedRequest, RoutingDecision, Trace};
use axum::body::Bytes;
use axum::extract::{Extension, State};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::Value;
use std::sync::Arc;
use std::time::{Duration, Instant};

const DEFAULT_ATTEMPT_TIMEOUT_MS: u64 = 60_000;

const REQUEST_HOP_BY_HOP: &[&str] = &["host", "content-length", "connection", "transfer-encoding"];
const REQUEST_STRIPPED_CREDENTIALS: &[&str] = &["authorization", "x-api-key", "anthropic-version"];
const RESPONSE_HOP_BY_HOP: &[&str] = &[
    "connection",
    "transfer-encoding",
    "content-length",
    "keep-alive",
    "access-control-allow-origin",
    "access-control-allow-methods",
    "access-control-allow-headers",
];

pub async fn chat_completions(
    State(state): State<Arc<AppState>>,
    Extension(key): Extension<AuthenticatedKey>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    forward(state, Protocol::O, key, headers, body).await
}

pub async fn messages(
    State(state): State<Arc<AppState>>,
    Extension(key): Extension<AuthenticatedKey>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    forward(state, Protocol::A, key, headers, body).await
}

/// One ordered routing candidate: a provider plus the effective weight it
/// was selected with, kept together so the winning weight can be recorded
/// on the trace without a second lookup.
struct Candidate {
    provider: Provider,
    weight: f64,
}

fn order_candidates(state: &AppState, group_providers: &[String]) -> Vec<Candidate> {
    let mut candidates: Vec<Candidate> = group_providers
        .iter()
        .enumerate()
        .filter_map(|(i, name)| {
            let provider = state.config.get_provider(name)?;
            let base = 1000.0 - 100.0 * i as f64;
            let weight = state.health.weight(name, base);
            Some(Candidate { provider, weight })
        })
        .collect();
    candidates.sort_by(|a, b| b.weight.partial_cmp(&a.weight).unwrap_or(std::cmp::Ordering::Equal));
    candidates
}

/// Builds the outgoing URL, headers, and JSON body for one attempt.
fn build_outgoing(provider: &Provider, protocol: Protocol, inbound: &HeaderMap, body: &Value) -> (HeaderMap, Vec<u8>) {
    let mut out = HeaderMap::new();
    for (name, value) in inbound.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if REQUEST_HOP_BY_HOP.contains(&lower.as_str()) || REQUEST_STRIPPED_CREDENTIALS.contains(&lower.as_str()) {
            continue;
        }
        out.insert(name.clone(), value.clone());
    }

    out.insert(axum::http::header::CONTENT_TYPE, HeaderValue::from_static("application/json"));

    match protocol {
        Protocol::O => {
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {}", provider.api_key)) {
                out.insert(axum::http::header::AUTHORIZATION, v);
            }
        }
        Protocol::A => {
            if let Ok(v) = HeaderValue::from_str(&provider.api_key) {
                out.insert(HeaderName::from_static("x-api-key"), v);
            }
            if let Ok(v) = HeaderValue::from_str(&format!("Bearer {}", provider.api_key)) {
                out.insert(axum::http::header::AUTHORIZATION, v);
            }
            out.insert(HeaderName::from_static("anthropic-version"), HeaderValue::from_static("2023-06-01"));
        }
    }

    let mut rewritten = body.clone();
    if let Some(real_model) = &provider.real_model {
        if let Value::Object(map) = &mut rewritten {
            map.insert("model".to_string(), Value::String(real_model.clone()));
        }
    }

    (out, serde_json::to_vec(&rewritten).unwrap_or_default())
}

fn client_for(state: &AppState, provider: &Provider) -> reqwest::Client {
    match &provider.proxy_url {
        Some(url) => reqwest::Proxy::all(url.as_str())
            .and_then(|proxy| reqwest::Client::builder().proxy(proxy).build())
            .unwrap_or_else(|e| {
                tracing::warn!(provider = %provider.name, error = %e, "invalid proxy_url, using default client");
                state.http.clone()
            }),
        None => state.http.clone(),
    }
}

fn passthrough_response_headers(upstream: &reqwest::header::HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in upstream.iter() {
        let lower = name.as_str().to_ascii_lowercase();
        if RESPONSE_HOP_BY_HOP.contains(&lower.as_str()) {
            continue;
        }
        if let (Ok(n), Ok(v)) = (
            HeaderName::from_bytes(name.as_str().as_bytes()),
            HeaderValue::from_bytes(value.as_bytes()),
        ) {
            headers.insert(n, v);
        }
    }
    headers
}

/// Records a trace with an empty attempt list for a request that never
/// reached the attempt loop (unknown model, protocol mismatch), then
/// returns the mapped error response. Every inbound request that reaches
/// `forward` gets exactly one recorded trace, whether or not it ever
/// dispatches to a provider.
async fn finalize_routing_failure(state: &AppState, mut trace: Trace, started: Instant, err: GatewayError) -> Response {
    trace.status = err.status_code().as_u16();
    trace.duration_ms = started.elapsed().as_millis() as u64;
    state.trace.record(trace).await;
    err.into_response()
}

async fn forward(state: Arc<AppState>, protocol: Protocol, key: AuthenticatedKey, headers: HeaderMap, raw_body: Bytes) -> Response {
    let started = Instant::now();
    let trace_id = uuid::Uuid::new_v4().to_string();

    let path = match protocol {
        Protocol::O => "/v1/chat/completions",
        Protocol::A => "/v1/messages",
    };

    let body: Value = match serde_json::from_slice(&raw_body) {
        Ok(v) => v,
        Err(e) => return GatewayError::Internal(format!("invalid JSON body: {e}")).into_response(),
    };

    let mut trace = Trace::new(
        trace_id,
        CapturedRequest {
            method: "POST".to_string(),
            path: path.to_string(),
            headers: header_map_to_value(&headers),
            body: body.clone(),
        },
    );
    trace.key_name = Some(key.0.clone());

    let target_model = body.get("model").and_then(Value::as_str).unwrap_or("").to_string();
    if target_model.is_empty() {
        let err = GatewayError::ModelNotFound(target_model);
        return finalize_routing_failure(&state, trace, started, err).await;
    }

    let group = match state.config.get_group(&target_model) {
        Some(g) => g,
        None => {
            let err = GatewayError::ModelNotFound(target_model);
            return finalize_routing_failure(&state, trace, started, err).await;
        }
    };

    if group.protocol != protocol {
        let err = GatewayError::ProtocolMismatch {
            group: group.name,
            expected: group.protocol.to_string(),
            actual: protocol.to_string(),
        };
        return finalize_routing_failure(&state, trace, started, err).await;
    }

    let candidates = order_candidates(&state, &group.providers);
    trace.routing = Some(RoutingDecision {
        target_model: target_model.clone(),
        matched_group: Some(group.name.clone()),
        candidates: candidates
            .iter()
            .map(|c| trace::Candidate {
                provider: c.provider.name.clone(),
                weight: c.weight,
            })
            .collect(),
    });

    let wants_stream = body.get("stream").and_then(Value::as_bool).unwrap_or(false);
    let mut last_error: Option<String> = None;

    for candidate in candidates {
        let attempt_start = Instant::now();
        let provider = candidate.provider;
        let (out_headers, out_body) = build_outgoing(&provider, protocol, &headers, &body);
        let client = client_for(&state, &provider);
        let timeout = Duration::from_millis(provider.timeout_ms.unwrap_or(DEFAULT_ATTEMPT_TIMEOUT_MS));

        let send = client
            .post(&provider.endpoint)
            .headers(out_headers.clone())
            .body(out_body)
            .send();

        let resp = match tokio::time::timeout(timeout, send).await {
            Ok(Ok(r)) => r,
            Ok(Err(e)) => {
                let message = e.to_string();
                last_error = Some(message.clone());
                record_failed_attempt(&state, &mut trace, &provider, &out_headers, attempt_start, None, message);
                continue;
            }
            Err(_) => {
                let message = format!("attempt timed out after {}ms", timeout.as_millis());
                last_error = Some(message.clone());
                record_failed_attempt(&state, &mut trace, &provider, &out_headers, attempt_start, None, message);
                continue;
            }
        };

        let status = resp.status();
        if !status.is_success() {
            let upstream_headers = resp.headers().clone();
            let bytes = resp.bytes().await.unwrap_or_default();
            state.health.record_error(&provider.name, status.as_u16());
            state.config.record_failure(&provider.name);
            let message = format!("upstream status {}", status.as_u16());
            last_error = Some(message.clone());
            trace.attempts.push(Attempt {
                provider: provider.name.clone(),
                weight: candidate.weight,
                outgoing_headers: header_map_to_value(&out_headers),
                upstream_headers: Some(header_map_to_value(&passthrough_response_headers(&upstream_headers))),
                upstream_status: Some(status.as_u16()),
                response_body: Some(trace::body_bytes_to_value(&bytes)),
                error: Some(message),
                duration_ms: attempt_start.elapsed().as_millis() as u64,
            });
            continue;
        }

        let response_headers = passthrough_response_headers(resp.headers());
        let status_code = StatusCode::from_u16(status.as_u16()).unwrap_or(StatusCode::OK);

        if wants_stream {
            let trace_attempt = Attempt {
                provider: provider.name.clone(),
                weight: candidate.weight,
                outgoing_headers: header_map_to_value(&out_headers),
                upstream_headers: Some(header_map_to_value(&response_headers)),
                upstream_status: Some(status.as_u16()),
                response_body: None,
                error: None,
                duration_ms: attempt_start.elapsed().as_millis() as u64,
            };
            trace.attempts.push(trace_attempt);
            trace.status = status.as_u16();

            let state_for_complete = state.clone();
            let mut final_trace = trace;
            let upstream_stream = resp.bytes_stream();

            let body = crate::stream::tee_stream(upstream_stream, move |bytes, err| async move {
                let elapsed = started.elapsed().as_millis() as u64;
                final_trace.duration_ms = elapsed;
                match err {
                    None => {
                        let value = trace::body_bytes_to_value(&bytes);
                        if let Some(last) = final_trace.attempts.last_mut() {
                            last.response_body = Some(value.clone());
                        }
                        final_trace.final_response = Some(value);
                    }
                    Some(e) => {
                        final_trace.status = StatusCode::INTERNAL_SERVER_ERROR.as_u16();
                        if let Some(last) = final_trace.attempts.last_mut() {
                            last.upstream_status = Some(StatusCode::INTERNAL_SERVER_ERROR.as_u16());
                            last.response_body = Some(trace::body_bytes_to_value(&bytes));
                            last.error = Some(e);
                        }
                    }
                }
                state_for_complete.trace.record(final_trace).await;
            });

            let mut builder = Response::builder().status(status_code);
            for (k, v) in response_headers.iter() {
                builder = builder.header(k, v);
            }
            return builder.body(body).unwrap_or_else(|_| GatewayError::Internal("failed to build streaming response".into()).into_response());
        }

        let bytes = match resp.bytes().await {
            Ok(b) => b,
            Err(e) => {
                let message = e.to_string();
                last_error = Some(message.clone());
                record_failed_attempt(&state, &mut trace, &provider, &out_headers, attempt_start, None, message);
                continue;
            }
        };
        let value = trace::body_bytes_to_value(&bytes);
        trace.attempts.push(Attempt {
            provider: provider.name.clone(),
            weight: candidate.weight,
            outgoing_headers: header_map_to_value(&out_headers),
            upstream_headers: Some(header_map_to_value(&response_headers)),
            upstream_status: Some(status.as_u16()),
            response_body: Some(value.clone()),
            error: None,
            duration_ms: attempt_start.elapsed().as_millis() as u64,
        });
        trace.status = status.as_u16();
        trace.final_response = Some(value);
        trace.duration_ms = started.elapsed().as_millis() as u64;
        state.trace.record(trace).await;

        let mut builder = Response::builder().status(status_code);
        for (k, v) in response_headers.iter() {
            builder = builder.header(k, v);
        }
        return builder
            .body(axum::body::Body::from(bytes))
            .unwrap_or_else(|_| GatewayError::Internal("failed to build response".into()).into_response());
    }

    trace.status = StatusCode::BAD_GATEWAY.as_u16();
    trace.duration_ms = started.elapsed().as_millis() as u64;
    state.trace.record(trace).await;
    GatewayError::AllUpstreamsFailed { last_error }.into_response()
}

#[allow(clippy::too_many_arguments)]
fn record_failed_attempt(
    state: &AppState,
    trace: &mut Trace,
    provider: &Provider,
    out_headers: &HeaderMap,
    attempt_start: Instant,
    status: Option<u16>,
    message: String,
) {
    // Transport failures (connect refused, timeout) carry no HTTP status;
    // 599 is a conventional non-standard code that still falls in the 5xx
    // penalty band so the health tracker treats it like any other upstream
    // failure.
    let synthetic_status = status.unwrap_or(599);
    state.health.record_error(&provider.name, synthetic_status);
    state.config.record_failure(&provider.name);
    trace.attempts.push(Attempt {
        provider: provider.name.clone(),
        weight: 0.0,
        outgoing_headers: header_map_to_value(out_headers),
        upstream_headers: None,
        upstream_status: status,
        response_body: None,
        error: Some(message),
        duration_ms: attempt_start.elapsed().as_millis() as u64,
    });
}

fn header_map_to_value(headers: &HeaderMap) -> Value {
    let mut map = serde_json::Map::new();
    for (name, value) in headers.iter() {
        let v = value.to_str().unwrap_or("[non-utf8 header]").to_string();
        map.insert(name.as_str().to_string(), Value::String(v));
    }
    Value::Object(map)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Protocol as P, Provider as Prov};

    fn provider(name: &str, real_model: Option<&str>) -> Prov {
        Prov {
            name: name.to_string(),
            protocol: P::O,
            endpoint: "https://example.invalid".to_string(),
            api_key: "sk-test".to_string(),
            proxy_url: None,
            real_model: real_model.map(|s| s.to_string()),
            timeout_ms: None,
        }
    }

    #[test]
    fn build_outgoing_strips_hop_by_hop_and_inbound_credentials() {
        let mut inbound = HeaderMap::new();
        inbound.insert("host", HeaderValue::from_static("client.invalid"));
        inbound.insert("authorization", HeaderValue::from_static("Bearer client-token"));
        inbound.insert("accept", HeaderValue::from_static("application/json"));

        let (out, _) = build_outgoing(&provider("p", None), Protocol::O, &inbound, &serde_json::json!({"model": "g"}));

        assert!(!out.contains_key("host"));
        assert!(out.get("authorization").unwrap() == "Bearer sk-test");
        assert!(out.contains_key("accept"));
    }

    #[test]
    fn build_outgoing_rewrites_model_when_real_model_set() {
        let (_, body) = build_outgoing(
            &provider("p", Some("gpt-4-real")),
            Protocol::O,
            &HeaderMap::new(),
            &serde_json::json!({"model": "alias"}),
        );
        let v: Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(v["model"], "gpt-4-real");
    }

    #[test]
    fn build_outgoing_injects_anthropic_headers_for_protocol_a() {
        let (out, _) = build_outgoing(&provider("p", None), Protocol::A, &HeaderMap::new(), &serde_json::json!({}));
        assert_eq!(out.get("x-api-key").unwrap(), "sk-test");
        assert!(out.contains_key("anthropic-version"));
        assert_eq!(out.get("authorization").unwrap(), "Bearer sk-test");
    }

    #[test]
    fn passthrough_drops_response_hop_by_hop_headers() {
        let mut upstream = reqwest::header::HeaderMap::new();
        upstream.insert(reqwest::header::CONNECTION, reqwest::header::HeaderValue::from_static("keep-alive"));
        upstream.insert(reqwest::header::CONTENT_TYPE, reqwest::header::HeaderValue::from_static("application/json"));

        let out = passthrough_response_headers(&upstream);
        assert!(!out.contains_key("connection"));
        assert!(out.contains_key("content-type"));
    }

    #[test]
    fn passthrough_drops_upstream_cors_headers() {
        let mut upstream = reqwest::header::HeaderMap::new();
        upstream.insert(
            reqwest::header::HeaderName::from_static("access-control-allow-origin"),
            reqwest::header::HeaderValue::from_static("*"),
        );
        upstream.insert(
            reqwest::header::HeaderName::from_static("access-control-allow-methods"),
            reqwest::header::HeaderValue::from_static("GET"),
        );
        upstream.insert(
            reqwest::header::HeaderName::from_static("access-control-allow-headers"),
            reqwest::header::HeaderValue::from_static("authorization"),
        );

        let out = passthrough_response_headers(&upstream);
        assert!(!out.contains_key("access-control-allow-origin"));
        assert!(!out.contains_key("access-control-allow-methods"));
        assert!(!out.contains_key("access-control-allow-headers"));
    }
}
