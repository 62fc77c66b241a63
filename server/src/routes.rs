use axum::{middleware, routing::get, Router};

use crate::auth::middleware::IdentityExt;
use crate::chat::history;
use crate::state::AppState;
use crate::ws::handler as ws_handler;

/// Inject the identity provider into request extensions so the AuthUser extractor can find it.
async fn inject_identity(
    axum::extract::State(state): axum::extract::State<AppState>,
    mut req: axum::http::Request<axum::body::Body>,
    next: middleware::Next,
) -> axum::response::Response {
    req.extensions_mut()
        .insert(IdentityExt(state.identity.clone()));
    next.run(req).await
}

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    // WebSocket endpoint (auth via query param, checked before upgrade)
    let ws_routes = Router::new().route("/ws", get(ws_handler::ws_upgrade));

    // Authenticated read endpoints (AuthUser extractor validates token)
    let chat_routes = Router::new()
        .route("/api/chat/messages", get(history::get_history))
        .route("/api/chat/contacts", get(history::get_contacts));

    let health = Router::new().route("/health", get(health_check));

    Router::new()
        .merge(ws_routes)
        .merge(chat_routes)
        .merge(health)
        .layer(middleware::from_fn_with_state(
            state.clone(),
            inject_identity,
        ))
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
