use axum::{
    extract::{ws::WebSocketUpgrade, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Deserialize;

use crate::auth::AuthError;
use crate::state::AppState;
use crate::ws::connection;

/// Query parameters for the websocket upgrade: `?token=JWT`
#[derive(Debug, Deserialize)]
pub struct WsAuthQuery {
    pub token: Option<String>,
}

fn rejection_message(err: &AuthError) -> &'static str {
    match err {
        AuthError::Missing => "Token missing",
        AuthError::Expired => "Token expired",
        AuthError::Invalid(_) => "Token invalid",
    }
}

/// GET /ws?token=JWT
///
/// Identity is established before the handshake completes. A missing, invalid
/// or expired token is answered with 401 and the socket is never upgraded.
pub async fn ws_upgrade(
    State(state): State<AppState>,
    Query(params): Query<WsAuthQuery>,
    ws: WebSocketUpgrade,
) -> Response {
    let token = params.token.unwrap_or_default();

    let user_id = match state.identity.authenticate(&token) {
        Ok(user_id) => user_id,
        Err(err) => {
            tracing::warn!(error = %err, "WebSocket auth failed");
            return (
                StatusCode::UNAUTHORIZED,
                Json(serde_json::json!({ "error": rejection_message(&err) })),
            )
                .into_response();
        }
    };

    tracing::info!(user_id = user_id, "WebSocket connection authenticated");
    let settings = state.pump;
    ws.max_message_size(settings.max_message_size)
        .on_upgrade(move |socket| {
            connection::run_connection(socket, user_id, state.hub, state.store, settings)
        })
}
