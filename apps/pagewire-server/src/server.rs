//! HTTP front door: the WebSocket endpoint clients connect to and a health
//! probe.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::WebSocketUpgrade;
use axum::extract::{ConnectInfo, State};
use axum::http::{header, HeaderMap};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use serde_json::json;
use tokio::signal;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::client::{serve_connection, ConnectionInfo};
use crate::state::AppState;
use crate::transport::{Connection, WebSocketConnection};

const PRINCIPAL_COOKIE: &str = "pid";

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ws_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
) -> Response {
    let info = connection_info(&headers, remote_addr);
    let queue_depth = state.config.outbound_queue_depth;
    ws.max_message_size(state.config.ws_max_message_size)
        .on_upgrade(move |socket| async move {
            let conn: Arc<dyn Connection> = Arc::new(WebSocketConnection::new(socket, queue_depth));
            serve_connection(state, conn, info).await;
        })
}

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "connectedClients": state.stats.connected(),
    }))
}

fn connection_info(headers: &HeaderMap, remote_addr: SocketAddr) -> ConnectionInfo {
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(str::trim)
        .filter(|v| !v.is_empty());
    let client_ip = match forwarded {
        Some(ip) => ip.to_string(),
        None => remote_addr.ip().to_string(),
    };
    let user_agent = headers
        .get(header::USER_AGENT)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let principal_id = headers
        .get_all(header::COOKIE)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .find_map(|cookies| cookie_value(cookies, PRINCIPAL_COOKIE))
        .map(str::to_string);
    ConnectionInfo {
        client_ip,
        user_agent,
        principal_id,
    }
}

fn cookie_value<'a>(cookies: &'a str, name: &str) -> Option<&'a str> {
    cookies.split(';').find_map(|pair| {
        let (key, value) = pair.trim().split_once('=')?;
        (key == name).then_some(value)
    })
}

/// Resolves on ctrl-c, or once no client has been connected for
/// `shutdown_idle_secs` when that is configured.
pub async fn shutdown_signal(state: AppState) {
    let idle = async {
        match state.config.shutdown_idle_secs {
            Some(secs) => {
                let mut interval = tokio::time::interval(Duration::from_secs(1));
                loop {
                    interval.tick().await;
                    if state.stats.idle_duration_exceeds(secs) {
                        info!(idle_secs = secs, "no clients connected; shutting down");
                        break;
                    }
                }
            }
            None => std::future::pending::<()>().await,
        }
    };
    tokio::select! {
        _ = signal::ctrl_c() => info!("shutdown signal received"),
        _ = idle => {}
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::http::HeaderValue;

    fn addr() -> SocketAddr {
        "10.0.0.7:50000".parse().unwrap()
    }

    #[test]
    fn client_ip_prefers_forwarded_header() {
        let mut headers = HeaderMap::new();
        headers.insert("x-forwarded-for", HeaderValue::from_static("203.0.113.9, 10.0.0.1"));
        assert_eq!(connection_info(&headers, addr()).client_ip, "203.0.113.9");
        assert_eq!(connection_info(&HeaderMap::new(), addr()).client_ip, "10.0.0.7");
    }

    #[test]
    fn principal_comes_from_pid_cookie() {
        let mut headers = HeaderMap::new();
        headers.insert(header::COOKIE, HeaderValue::from_static("theme=dark; pid=abc-123"));
        headers.insert(header::USER_AGENT, HeaderValue::from_static("test-agent"));
        let info = connection_info(&headers, addr());
        assert_eq!(info.principal_id.as_deref(), Some("abc-123"));
        assert_eq!(info.user_agent, "test-agent");
        assert_eq!(cookie_value("pidx=1", PRINCIPAL_COOKIE), None);
    }
}
