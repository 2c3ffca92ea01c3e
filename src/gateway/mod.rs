//! WebSocket gateway: upgrade screening, auth handshake, and RPC dispatch.
//!
//! Every upgrade is screened by the connection limiter and the origin guard
//! before a socket exists; failures close with WebSocket status 1008. RPC
//! frames are JSON `{id, method, params}` objects answered with
//! `{id, result}` or `{id, error: {code, message}}`. Approval decisions
//! arrive here (`chat.approval.respond`) and settle tool calls waiting on
//! the coordinator, usually on a different connection than the one that
//! created them.

pub mod origin;
pub mod rate_limit;

use crate::approval::{ApprovalCoordinator, ApprovalDecision};
use crate::config::Config;
use crate::events::EventBus;
use crate::gateway::origin::OriginGuard;
use crate::gateway::rate_limit::{LimitDecision, RateLimiter};
use crate::security::constant_time_eq;
use anyhow::{Context, Result};
use axum::extract::connect_info::ConnectInfo;
use axum::extract::ws::{CloseFrame, Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::http::{header, HeaderMap};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use serde_json::json;
use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// Maximum request body size — prevents memory exhaustion on the HTTP side.
pub const MAX_BODY_SIZE: usize = 65_536;
/// HTTP request timeout; the upgrade response completes well within it.
pub const REQUEST_TIMEOUT_SECS: u64 = 30;
/// WebSocket close code for policy violations (rate limit, origin, auth).
const POLICY_VIOLATION: u16 = 1008;
/// How long a client gets to present its auth frame.
const AUTH_DEADLINE_SECS: u64 = 10;

/// Shared state for the WebSocket handlers.
#[derive(Clone)]
pub struct AppState {
    pub limiter: Arc<RateLimiter>,
    pub origin_guard: Arc<OriginGuard>,
    pub coordinator: Arc<ApprovalCoordinator>,
    pub bus: Arc<EventBus>,
    pub auth_token: Option<Arc<str>>,
}

/// Run the gateway until the process is stopped.
pub async fn run_gateway(config: &Config) -> Result<()> {
    let host = config.gateway.host.clone();
    let port = config.gateway.port;

    if is_public_bind(&host) && !config.gateway.allow_public_bind {
        anyhow::bail!(
            "refusing to bind to {host} — the gateway would be exposed beyond loopback.\n\
             Use host = \"127.0.0.1\" (default) or set allow_public_bind = true in [gateway]."
        );
    }

    let limiter = Arc::new(RateLimiter::new(config.rate_limit.to_runtime()));
    let janitor = limiter.spawn_janitor();

    let bus = Arc::new(EventBus::new());
    let state = AppState {
        limiter,
        origin_guard: Arc::new(OriginGuard::new(config.gateway.allowed_origins.clone())),
        coordinator: Arc::new(ApprovalCoordinator::new(bus.clone())),
        bus,
        auth_token: config.gateway.auth_token.as_deref().map(Arc::from),
    };

    let app = build_router(state);
    let listener = tokio::net::TcpListener::bind((host.as_str(), port))
        .await
        .with_context(|| format!("binding gateway to {host}:{port}"))?;
    tracing::info!(%host, port, "gateway listening");

    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await;
    janitor.abort();
    result.context("gateway server error")
}

/// Router with the WebSocket endpoint and the protective HTTP layers.
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .layer(tower_http::limit::RequestBodyLimitLayer::new(MAX_BODY_SIZE))
        .layer(tower_http::timeout::TimeoutLayer::new(Duration::from_secs(
            REQUEST_TIMEOUT_SECS,
        )))
        .with_state(state)
}

/// True when `host` is anything other than a loopback address.
pub fn is_public_bind(host: &str) -> bool {
    if host.eq_ignore_ascii_case("localhost") {
        return false;
    }
    match host.parse::<IpAddr>() {
        Ok(ip) => !origin::is_loopback(ip),
        Err(_) => true,
    }
}

async fn ws_handler(
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let ip = addr.ip();
    let rejection = screen_upgrade(&state, ip, &headers);

    ws.on_upgrade(move |socket| async move {
        match rejection {
            Some(reason) => close_with_policy(socket, reason).await,
            None => handle_socket(socket, state, ip).await,
        }
    })
}

/// Rate + origin screening, before any frame is exchanged.
fn screen_upgrade(state: &AppState, ip: IpAddr, headers: &HeaderMap) -> Option<String> {
    if let LimitDecision::Denied { retry_after_ms } = state.limiter.check_connection(&ip.to_string())
    {
        tracing::warn!(%ip, retry_after_ms, "connection rate limit exceeded");
        return Some(format!("rate_limited; retry_after_ms={retry_after_ms}"));
    }

    let origin = headers.get(header::ORIGIN).and_then(|v| v.to_str().ok());
    if let origin::OriginDecision::Rejected { reason } = state.origin_guard.check(ip, origin) {
        return Some(reason.to_string());
    }
    None
}

async fn close_with_policy(mut socket: WebSocket, reason: String) {
    let _ = socket
        .send(Message::Close(Some(CloseFrame {
            code: POLICY_VIOLATION,
            reason: reason.into(),
        })))
        .await;
}

async fn handle_socket(socket: WebSocket, state: AppState, ip: IpAddr) {
    let connection_id = Uuid::new_v4().to_string();
    let (sink, mut stream) = socket.split();

    // Single writer task; replies, events, and closes all funnel through it.
    let (tx, rx) = mpsc::unbounded_channel::<Message>();
    let writer = tokio::spawn(write_loop(sink, rx));

    if authenticate(&state, &mut stream, &tx, ip).await {
        rpc_loop(&state, &mut stream, &tx, &connection_id).await;
    }

    state.limiter.remove_connection(&connection_id);
    drop(tx);
    let _ = writer.await;
}

async fn write_loop(mut sink: SplitSink<WebSocket, Message>, mut rx: mpsc::UnboundedReceiver<Message>) {
    while let Some(msg) = rx.recv().await {
        let closing = matches!(msg, Message::Close(_));
        if sink.send(msg).await.is_err() || closing {
            break;
        }
    }
}

/// Challenge the peer for its token when one is configured. Failures feed
/// the auth limiter; success erases the IP's failure record.
async fn authenticate(
    state: &AppState,
    stream: &mut SplitStream<WebSocket>,
    tx: &mpsc::UnboundedSender<Message>,
    ip: IpAddr,
) -> bool {
    let Some(expected) = state.auth_token.as_deref() else {
        return true;
    };
    let ip_key = ip.to_string();

    if let LimitDecision::Denied { retry_after_ms } = state.limiter.check_auth_attempt(&ip_key) {
        tracing::warn!(%ip, retry_after_ms, "auth attempt during lockout");
        send_close(tx, format!("auth_locked; retry_after_ms={retry_after_ms}"));
        return false;
    }

    let frame = tokio::time::timeout(Duration::from_secs(AUTH_DEADLINE_SECS), stream.next()).await;
    let Ok(Some(Ok(Message::Text(text)))) = frame else {
        state.limiter.record_auth_failure(&ip_key);
        send_close(tx, "auth_required".to_string());
        return false;
    };

    let request: RpcRequest = match serde_json::from_str(&text) {
        Ok(r) => r,
        Err(_) => {
            state.limiter.record_auth_failure(&ip_key);
            send_close(tx, "auth_required".to_string());
            return false;
        }
    };

    let presented = request
        .params
        .get("token")
        .and_then(|v| v.as_str())
        .unwrap_or("");
    if request.method != "auth" || !constant_time_eq(presented, expected) {
        tracing::warn!(%ip, token = %describe_token(presented), "auth token rejected");
        state.limiter.record_auth_failure(&ip_key);
        send_close(tx, "auth_failed".to_string());
        return false;
    }

    state.limiter.clear_auth_failures(&ip_key);
    send_text(tx, rpc_ok(&request.id, json!({"ok": true})));
    true
}

async fn rpc_loop(
    state: &AppState,
    stream: &mut SplitStream<WebSocket>,
    tx: &mpsc::UnboundedSender<Message>,
    connection_id: &str,
) {
    let mut listener_id: Option<u64> = None;

    while let Some(Ok(msg)) = stream.next().await {
        let text = match msg {
            Message::Text(t) => t,
            Message::Close(_) => break,
            // Ping/pong handled by axum; binary frames are not part of
            // the protocol.
            _ => continue,
        };

        if let LimitDecision::Denied { retry_after_ms } = state.limiter.check_rpc_call(connection_id)
        {
            tracing::warn!(connection_id, retry_after_ms, "rpc rate limit exceeded");
            send_close(tx, format!("rate_limited; retry_after_ms={retry_after_ms}"));
            break;
        }

        let request: RpcRequest = match serde_json::from_str(&text) {
            Ok(r) => r,
            Err(_) => {
                send_text(
                    tx,
                    rpc_err(&serde_json::Value::Null, "INVALID_REQUEST", "malformed frame"),
                );
                continue;
            }
        };

        match dispatch_rpc(state, request) {
            Dispatch::Reply(reply) => send_text(tx, reply),
            Dispatch::Subscribe { session_key, reply } => {
                if let Some(old) = listener_id.take() {
                    state.bus.unsubscribe(old);
                }
                let forward = tx.clone();
                listener_id = Some(state.bus.subscribe(move |event| {
                    if event.session_key == session_key {
                        if let Ok(json) = serde_json::to_string(event) {
                            let _ = forward.send(Message::Text(json));
                        }
                    }
                }));
                send_text(tx, reply);
            }
        }
    }

    if let Some(id) = listener_id {
        state.bus.unsubscribe(id);
    }
}

// ── RPC frames ──────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcRequest {
    #[serde(default)]
    id: serde_json::Value,
    method: String,
    #[serde(default)]
    params: serde_json::Value,
}

enum Dispatch {
    Reply(serde_json::Value),
    Subscribe {
        session_key: String,
        reply: serde_json::Value,
    },
}

fn rpc_ok(id: &serde_json::Value, result: serde_json::Value) -> serde_json::Value {
    json!({"id": id, "result": result})
}

fn rpc_err(id: &serde_json::Value, code: &str, message: &str) -> serde_json::Value {
    json!({"id": id, "error": {"code": code, "message": message}})
}

fn dispatch_rpc(state: &AppState, request: RpcRequest) -> Dispatch {
    let id = request.id.clone();
    match request.method.as_str() {
        "chat.approval.respond" => Dispatch::Reply(respond_to_approval(state, &id, &request.params)),
        "chat.approval.status" => Dispatch::Reply(approval_status(state, &id, &request.params)),
        "chat.subscribe" => match request.params.get("session_key").and_then(|v| v.as_str()) {
            Some(session_key) => Dispatch::Subscribe {
                session_key: session_key.to_string(),
                reply: rpc_ok(&id, json!({"subscribed": session_key})),
            },
            None => Dispatch::Reply(rpc_err(&id, "INVALID_REQUEST", "session_key is required")),
        },
        other => Dispatch::Reply(rpc_err(
            &id,
            "INVALID_REQUEST",
            &format!("unknown method: {other}"),
        )),
    }
}

fn respond_to_approval(
    state: &AppState,
    id: &serde_json::Value,
    params: &serde_json::Value,
) -> serde_json::Value {
    let Some(request_id) = parse_request_id(params) else {
        return rpc_err(id, "INVALID_REQUEST", "request_id must be a UUID");
    };
    let decision = match params
        .get("decision")
        .and_then(|v| v.as_str())
        .map(ApprovalDecision::parse)
    {
        Some(Ok(decision)) => decision,
        _ => {
            return rpc_err(
                id,
                "INVALID_REQUEST",
                "decision must be one of allow-once, allow-session, allow-always, deny",
            )
        }
    };

    match state.coordinator.resolve(request_id, decision) {
        Ok(()) => rpc_ok(
            id,
            json!({"ok": true, "request_id": request_id, "decision": decision.as_str()}),
        ),
        Err(e) => rpc_err(id, "NOT_FOUND", &e.to_string()),
    }
}

fn approval_status(
    state: &AppState,
    id: &serde_json::Value,
    params: &serde_json::Value,
) -> serde_json::Value {
    let Some(request_id) = parse_request_id(params) else {
        return rpc_err(id, "INVALID_REQUEST", "request_id must be a UUID");
    };
    rpc_ok(
        id,
        json!({"request_id": request_id, "pending": state.coordinator.has_pending(request_id)}),
    )
}

fn parse_request_id(params: &serde_json::Value) -> Option<Uuid> {
    params
        .get("request_id")
        .and_then(|v| v.as_str())
        .and_then(|s| s.parse().ok())
}

/// Rejected tokens never reach the logs, not even a prefix; only the
/// length class is recorded.
fn describe_token(token: &str) -> String {
    if token.is_empty() {
        "<empty>".to_string()
    } else {
        format!("<{} chars>", token.chars().count())
    }
}

fn send_text(tx: &mpsc::UnboundedSender<Message>, value: serde_json::Value) {
    let _ = tx.send(Message::Text(value.to_string()));
}

fn send_close(tx: &mpsc::UnboundedSender<Message>, reason: String) {
    let _ = tx.send(Message::Close(Some(CloseFrame {
        code: POLICY_VIOLATION,
        reason: reason.into(),
    })));
}
