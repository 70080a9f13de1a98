//! Connection entry point: credential check, upgrade and the socket pump.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use base64::{engine::general_purpose::STANDARD as BASE64, Engine as _};
use futures::{SinkExt, StreamExt};
use hmac::{Hmac, Mac};
use serde::Deserialize;
use sha1::Sha1;
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::AuthError;
use crate::protocol::{ClientMessage, ServerMessage};
use crate::state::AppState;

use super::room_loop::{JoinRequest, Outbound, RoomCommand};

type HmacSha1 = Hmac<Sha1>;

/// Credentials arrive as query parameters on the upgrade request.
#[derive(Debug, Deserialize)]
pub struct AuthParams {
    #[serde(default)]
    pub username: String,
    #[serde(default)]
    pub password: String,
}

/// Identity established before the upgrade completes.
#[derive(Debug, Clone)]
struct AuthedUser {
    stable_id: String,
    name: String,
    host: bool,
}

/// Authenticates the request and upgrades it to a websocket. A bad
/// credential never reaches the room: the request fails with 401 here.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<AuthParams>,
    State(state): State<Arc<AppState>>,
) -> Response {
    let user = match authenticate(&state, &params).await {
        Ok(user) => user,
        Err(e) => {
            tracing::warn!(username = %params.username, error = %e, "connection rejected");
            return (StatusCode::UNAUTHORIZED, e.to_string()).into_response();
        }
    };
    ws.on_upgrade(move |socket| handle_socket(socket, state, user))
}

async fn authenticate(state: &AppState, params: &AuthParams) -> Result<AuthedUser, AuthError> {
    if params.username.is_empty() || params.password.is_empty() {
        return Err(AuthError::MissingCredentials);
    }
    let account = state
        .store
        .load_account(&params.username)
        .await?
        .ok_or(AuthError::InvalidCredentials)?;
    if !verify_password(&state.config.auth_secret, &params.password, &account.digest) {
        return Err(AuthError::InvalidCredentials);
    }
    Ok(AuthedUser {
        stable_id: account.id,
        name: account.username,
        host: account.host,
    })
}

/// HMAC-SHA1 digest of a password, base64 encoded. Account records store
/// this instead of the password itself; operators run this when they
/// provision `accounts.json`.
#[allow(dead_code)]
pub fn digest_password(secret: &str, password: &str) -> String {
    let mut mac =
        HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(password.as_bytes());
    BASE64.encode(mac.finalize().into_bytes())
}

fn verify_password(secret: &str, password: &str, digest: &str) -> bool {
    let Ok(expected) = BASE64.decode(digest) else {
        return false;
    };
    let mut mac =
        HmacSha1::new_from_slice(secret.as_bytes()).expect("HMAC can take key of any size");
    mac.update(password.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, user: AuthedUser) {
    let connection_id = Uuid::new_v4();
    let Some(room) = state.room(&state.config.room.id) else {
        tracing::error!(room_id = %state.config.room.id, "room loop not running");
        return;
    };

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    tracing::info!(
        connection_id = %connection_id,
        player_id = %user.stable_id,
        name = %user.name,
        "connection established"
    );
    room.send(RoomCommand::Join(JoinRequest {
        connection_id,
        stable_id: user.stable_id,
        name: user.name,
        host: user.host,
        sender: tx.clone(),
    }));

    // Outbound pump. The room loop pushes messages into the channel; this
    // task owns the sink.
    let send_task = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            match outbound {
                Outbound::Deliver(msg) => {
                    if let Ok(json) = serde_json::to_string(&msg) {
                        if ws_sender.send(Message::Text(json)).await.is_err() {
                            break;
                        }
                    }
                }
                Outbound::Close => {
                    let _ = ws_sender.send(Message::Close(None)).await;
                    break;
                }
            }
        }
    });

    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => match serde_json::from_str::<ClientMessage>(&text) {
                Ok(message) => room.send(RoomCommand::Frame {
                    connection_id,
                    message,
                }),
                Err(e) => {
                    tracing::debug!(connection_id = %connection_id, error = %e, "unparseable frame");
                    let _ = tx.send(Outbound::Deliver(ServerMessage::Error {
                        code: "BAD_MESSAGE".to_string(),
                        message: "could not parse message".to_string(),
                    }));
                }
            },
            Ok(Message::Close(_)) => break,
            Err(_) => break,
            _ => {}
        }
    }

    room.send(RoomCommand::Disconnected { connection_id });
    send_task.abort();
    tracing::info!(connection_id = %connection_id, "connection closed");
}
