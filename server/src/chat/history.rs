//! REST read side of the relay: conversation history and contact list.
//! Both read the same `messages` table the websocket path writes.

use axum::{
    extract::{Query, State},
    http::StatusCode,
    Json,
};
use serde::{Deserialize, Serialize};

use crate::auth::middleware::AuthUser;
use crate::db::models::{Contact, Message, UserId};
use crate::state::AppState;
use crate::store::{self, StoreError};

#[derive(Debug, Deserialize)]
pub struct HistoryQuery {
    pub target_id: UserId,
}

/// `{"data": ...}` envelope shared by the chat endpoints.
#[derive(Debug, Serialize)]
pub struct DataResponse<T> {
    pub data: T,
}

fn internal_error(err: StoreError) -> StatusCode {
    tracing::error!(error = %err, "Chat store query failed");
    StatusCode::INTERNAL_SERVER_ERROR
}

/// GET /api/chat/messages?target_id=N
/// Every message between the caller and `target_id`, oldest first.
pub async fn get_history(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
    Query(query): Query<HistoryQuery>,
) -> Result<Json<DataResponse<Vec<Message>>>, StatusCode> {
    let messages = store::load_history(state.store.clone(), user_id, query.target_id)
        .await
        .map_err(internal_error)?;

    Ok(Json(DataResponse { data: messages }))
}

/// GET /api/chat/contacts
/// Everyone the caller has exchanged messages with, most recent first.
pub async fn get_contacts(
    State(state): State<AppState>,
    AuthUser(user_id): AuthUser,
) -> Result<Json<DataResponse<Vec<Contact>>>, StatusCode> {
    let contacts = store::load_contacts(state.store.clone(), user_id)
        .await
        .map_err(internal_error)?;

    Ok(Json(DataResponse { data: contacts }))
}
