//! HTTP surface: the client notification WebSocket and a health probe.
//!
//! Authentication happens upstream; the user id arrives in a trusted header.

use crate::config::ServerConfig;
use crate::error::Error;
use crate::hub::ClientSink;
use crate::service::Mailhub;

use anyhow::Context as _;
use async_trait::async_trait;
use axum::extract::State;
use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::http::{HeaderMap, HeaderName, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use futures::stream::SplitSink;
use futures::{SinkExt as _, StreamExt as _};
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use std::sync::Arc;

#[derive(Clone)]
struct ApiState {
    mailhub: Arc<Mailhub>,
    user_header: HeaderName,
}

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
}

/// Write half of a client WebSocket.
struct WsSink(SplitSink<WebSocket, Message>);

#[async_trait]
impl ClientSink for WsSink {
    async fn send(&mut self, payload: &str) -> anyhow::Result<()> {
        self.0.send(Message::Text(payload.into())).await?;
        Ok(())
    }

    async fn close(&mut self) {
        let _ = self.0.close().await;
    }
}

pub fn router(mailhub: Arc<Mailhub>, user_header: HeaderName) -> Router {
    let state = ApiState {
        mailhub,
        user_header,
    };
    Router::new()
        .route("/health", get(health))
        .route("/ws", get(notifications))
        .with_state(state)
}

/// Bind and serve until `shutdown` fires.
pub async fn serve(
    mailhub: Arc<Mailhub>,
    config: &ServerConfig,
    shutdown: CancellationToken,
) -> anyhow::Result<()> {
    let user_header = HeaderName::from_bytes(config.user_header.as_bytes())
        .with_context(|| format!("invalid user header name '{}'", config.user_header))?;
    let app = router(mailhub, user_header);

    let bind = if config.bind.contains(':') {
        format!("[{}]:{}", config.bind, config.port)
    } else {
        format!("{}:{}", config.bind, config.port)
    };
    let listener = tokio::net::TcpListener::bind(&bind)
        .await
        .with_context(|| format!("failed to bind mailhub server to {bind}"))?;
    tracing::info!(%bind, "mailhub server listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(async move { shutdown.cancelled().await })
        .await
        .context("mailhub server exited with error")
}

async fn health() -> Json<HealthResponse> {
    Json(HealthResponse { status: "ok" })
}

async fn notifications(
    State(state): State<ApiState>,
    headers: HeaderMap,
    upgrade: WebSocketUpgrade,
) -> Response {
    let Some(user) = headers
        .get(&state.user_header)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|user| !user.is_empty())
        .map(str::to_string)
    else {
        return StatusCode::UNAUTHORIZED.into_response();
    };

    match state.mailhub.account(&user).await {
        Ok(_) => {}
        Err(Error::UnknownAccount(_)) => return StatusCode::FORBIDDEN.into_response(),
        Err(error) => {
            tracing::error!(%user, %error, "failed to resolve mail account");
            return StatusCode::INTERNAL_SERVER_ERROR.into_response();
        }
    }

    upgrade.on_upgrade(move |socket| client_session(state.mailhub, user, socket))
}

/// Register the socket with the hub, then read until the client goes away.
/// Inbound frames carry no commands; reading only detects disconnects.
async fn client_session(mailhub: Arc<Mailhub>, user: String, socket: WebSocket) {
    let (sink, mut inbound) = socket.split();
    let client = match mailhub.attach_client(&user, Box::new(WsSink(sink))).await {
        Ok(client) => client,
        Err(error) => {
            tracing::info!(%user, %error, "rejected notification socket");
            return;
        }
    };
    tracing::debug!(%user, client_id = client.id(), "notification socket connected");

    loop {
        tokio::select! {
            _ = client.closed() => break,
            frame = inbound.next() => match frame {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(error)) => {
                    tracing::debug!(%user, %error, "notification socket read failed");
                    break;
                }
            },
        }
    }

    let remaining = mailhub.detach_client(&client).await;
    tracing::debug!(%user, client_id = client.id(), remaining, "notification socket disconnected");
}
