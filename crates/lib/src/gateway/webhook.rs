//! Webhook/KV HTTP server.
//!
//! `GET` on any path returns the current Unix time in milliseconds. `POST /updatekv`
//! writes every key of a JSON object into the KV store; `POST /send` pushes a text
//! message straight onto the output queue. POSTs need `Authorization: <api key>`.

use crate::events::OutboundEvent;
use crate::gateway::protocol::{
    SendRequest, BODY_FORBIDDEN, BODY_INVALID_OPERATION, BODY_MALFORMED,
    BODY_METHOD_NOT_ALLOWED, BODY_RECEIVED, BODY_UPDATED,
};
use crate::kv::KvStore;
use crate::pipeline::OutputQueue;
use anyhow::{Context, Result};
use axum::{
    body::Bytes,
    extract::State,
    http::{header, HeaderMap, Method, StatusCode},
    routing::post,
    Router,
};
use serde::de::DeserializeOwned;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;

type Reply = (StatusCode, String);

/// Shared state for the webhook handlers.
#[derive(Clone)]
pub struct WebhookState {
    pub kv: Arc<KvStore>,
    pub output: OutputQueue,
    pub api_key: Arc<str>,
}

pub fn webhook_router(state: WebhookState) -> Router {
    Router::new()
        .route(
            "/updatekv",
            post(update_kv).get(now_millis).fallback(method_not_allowed),
        )
        .route(
            "/send",
            post(send_message).get(now_millis).fallback(method_not_allowed),
        )
        .fallback(fallback)
        .with_state(state)
}

/// Serve on an already bound listener until `shutdown` completes.
pub async fn serve_webhook<F>(listener: TcpListener, state: WebhookState, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    if let Ok(addr) = listener.local_addr() {
        log::info!("webhook: listening on {}", addr);
    }
    axum::serve(listener, webhook_router(state))
        .with_graceful_shutdown(shutdown)
        .await
        .context("webhook server exited")?;
    log::info!("webhook: stopped");
    Ok(())
}

fn reply(status: StatusCode, body: &str) -> Reply {
    (status, body.to_string())
}

async fn now_millis() -> Reply {
    (StatusCode::OK, chrono::Utc::now().timestamp_millis().to_string())
}

async fn method_not_allowed() -> Reply {
    reply(StatusCode::METHOD_NOT_ALLOWED, BODY_METHOD_NOT_ALLOWED)
}

/// Unknown paths: GET answers the time, POST is authorized then rejected, anything else is 405.
async fn fallback(State(state): State<WebhookState>, method: Method, headers: HeaderMap) -> Reply {
    if method == Method::GET {
        return now_millis().await;
    }
    if method != Method::POST {
        return method_not_allowed().await;
    }
    if !authorized(&state, &headers) {
        return reply(StatusCode::FORBIDDEN, BODY_FORBIDDEN);
    }
    reply(StatusCode::BAD_REQUEST, BODY_INVALID_OPERATION)
}

fn authorized(state: &WebhookState, headers: &HeaderMap) -> bool {
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let ok = !state.api_key.is_empty() && provided == &*state.api_key;
    if !ok {
        log::info!("webhook: blocked request with missing or wrong authorization");
    }
    ok
}

/// Parse the raw body as JSON whatever the Content-Type says (`curl -d` sends form-urlencoded).
fn parse_json<T: DeserializeOwned>(body: &[u8]) -> Option<T> {
    serde_json::from_slice(body).ok()
}

async fn update_kv(State(state): State<WebhookState>, headers: HeaderMap, body: Bytes) -> Reply {
    if !authorized(&state, &headers) {
        return reply(StatusCode::FORBIDDEN, BODY_FORBIDDEN);
    }
    let Some(values) = parse_json::<serde_json::Map<String, serde_json::Value>>(&body)
    else {
        return reply(StatusCode::BAD_REQUEST, BODY_MALFORMED);
    };
    let n = state.kv.merge(values).await;
    log::info!("webhook: updated {} kv key(s)", n);
    reply(StatusCode::OK, BODY_UPDATED)
}

async fn send_message(State(state): State<WebhookState>, headers: HeaderMap, body: Bytes) -> Reply {
    if !authorized(&state, &headers) {
        return reply(StatusCode::FORBIDDEN, BODY_FORBIDDEN);
    }
    let Some(req) = parse_json::<SendRequest>(&body) else {
        return reply(StatusCode::BAD_REQUEST, BODY_MALFORMED);
    };
    let target = req.target_conversation_id.trim();
    if target.is_empty() {
        return reply(StatusCode::BAD_REQUEST, BODY_MALFORMED);
    }
    log::info!("webhook: sending {} message {:?}", target, req.message);
    state.output.enqueue(OutboundEvent::text(target, req.message));
    reply(StatusCode::OK, BODY_RECEIVED)
}
