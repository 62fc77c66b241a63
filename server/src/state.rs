use crate::auth::SharedIdentity;
use crate::config::PumpSettings;
use crate::store::SharedStore;
use crate::ws::HubHandle;

/// Shared application state passed to all handlers via axum State extractor.
#[derive(Clone)]
pub struct AppState {
    /// Command channel into the connection hub
    pub hub: HubHandle,
    /// Durable message store
    pub store: SharedStore,
    /// Turns a session token into a user id
    pub identity: SharedIdentity,
    /// Queue, frame and deadline settings for new connections
    pub pump: PumpSettings,
}
