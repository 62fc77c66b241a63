use std::fmt::Display;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures_util::{Sink, SinkExt, Stream, StreamExt};
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, timeout_at, Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;

use crate::config::PumpSettings;
use crate::db::models::UserId;
use crate::store::{self, SharedStore};
use crate::ws::hub::{ConnectionHandle, ConnectionId, HubHandle, Outbound};
use crate::ws::protocol::{self, ProtocolError};

/// Where a connection is in its life. Only ever moves forward.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ConnectionState {
    Connecting = 0,
    Active = 1,
    Unregistering = 2,
    Closed = 3,
}

impl ConnectionState {
    fn from_u8(raw: u8) -> Self {
        match raw {
            0 => Self::Connecting,
            1 => Self::Active,
            2 => Self::Unregistering,
            _ => Self::Closed,
        }
    }
}

/// State shared by the two pumps of one connection.
///
/// Whichever pump stops first calls [`Lifecycle::trigger`], which unregisters
/// the connection from the hub exactly once and cancels the other pump.
#[derive(Debug)]
pub struct Lifecycle {
    id: ConnectionId,
    user_id: UserId,
    hub: HubHandle,
    state: AtomicU8,
    cancel: CancellationToken,
}

impl Lifecycle {
    pub fn new(id: ConnectionId, user_id: UserId, hub: HubHandle) -> Arc<Self> {
        Arc::new(Self {
            id,
            user_id,
            hub,
            state: AtomicU8::new(ConnectionState::Connecting as u8),
            cancel: CancellationToken::new(),
        })
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    pub fn user_id(&self) -> UserId {
        self.user_id
    }

    pub fn state(&self) -> ConnectionState {
        ConnectionState::from_u8(self.state.load(Ordering::Acquire))
    }

    fn activate(&self) {
        let _ = self.state.compare_exchange(
            ConnectionState::Connecting as u8,
            ConnectionState::Active as u8,
            Ordering::AcqRel,
            Ordering::Acquire,
        );
    }

    /// Start teardown. Returns true for the call that actually unregistered.
    pub fn trigger(&self, reason: &str) -> bool {
        let fired = self
            .state
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |s| {
                (s < ConnectionState::Unregistering as u8)
                    .then_some(ConnectionState::Unregistering as u8)
            })
            .is_ok();

        if fired {
            tracing::info!(
                user_id = self.user_id,
                connection_id = self.id,
                reason = reason,
                "Connection tearing down"
            );
            if self.hub.unregister(self.id).is_err() {
                tracing::debug!(connection_id = self.id, "Hub already stopped");
            }
        }

        self.cancel.cancel();
        fired
    }

    pub async fn cancelled(&self) {
        self.cancel.cancelled().await
    }

    fn close(&self) {
        self.state
            .store(ConnectionState::Closed as u8, Ordering::Release);
    }
}

/// Run both pumps for an authenticated websocket until the connection is torn down.
pub async fn run_connection(
    socket: WebSocket,
    user_id: UserId,
    hub: HubHandle,
    store: SharedStore,
    settings: PumpSettings,
) {
    let (handle, outbound) = ConnectionHandle::new(user_id, settings.queue_capacity);
    let lifecycle = Lifecycle::new(handle.id, user_id, hub.clone());

    // On failure the handle is dropped, so the send pump finds its queue
    // closed and tears the connection down straight away.
    if hub.register(handle).is_ok() {
        lifecycle.activate();
    } else {
        tracing::warn!(user_id = user_id, "Hub not running, refusing connection");
    }

    tracing::info!(
        user_id = user_id,
        connection_id = lifecycle.id(),
        "WebSocket connection started"
    );

    let (sink, stream) = socket.split();
    let writer = tokio::spawn(write_pump(sink, outbound, lifecycle.clone(), settings));
    let reader = tokio::spawn(read_pump(stream, lifecycle.clone(), hub, store, settings));

    let (read_result, write_result) = tokio::join!(reader, writer);
    if let Err(e) = read_result.and(write_result) {
        // A panicking pump never reached trigger()
        tracing::error!(connection_id = lifecycle.id(), error = %e, "Pump task failed");
        lifecycle.trigger("pump panicked");
    }

    lifecycle.close();
    tracing::info!(
        user_id = user_id,
        connection_id = lifecycle.id(),
        "WebSocket connection closed"
    );
}

/// Receive pump: decode, persist, dispatch. Malformed frames are skipped;
/// transport errors, oversized frames, close frames and a missed pong deadline end the loop.
pub async fn read_pump<R, E>(
    mut reader: R,
    lifecycle: Arc<Lifecycle>,
    hub: HubHandle,
    store: SharedStore,
    settings: PumpSettings,
) where
    R: Stream<Item = Result<WsMessage, E>> + Unpin,
    E: Display,
{
    let user_id = lifecycle.user_id();
    let mut deadline = Instant::now() + settings.pong_wait;

    let reason = loop {
        let next = tokio::select! {
            _ = lifecycle.cancelled() => break "cancelled",
            next = timeout_at(deadline, reader.next()) => next,
        };

        let frame = match next {
            Err(_) => {
                tracing::warn!(user_id = user_id, "Read deadline exceeded, peer unresponsive");
                break "read deadline";
            }
            Ok(None) => break "stream ended",
            Ok(Some(Err(e))) => {
                tracing::warn!(user_id = user_id, error = %e, "WebSocket receive error");
                break "read error";
            }
            Ok(Some(Ok(frame))) => frame,
        };

        let result = match frame {
            WsMessage::Text(text) => {
                handle_frame(text.as_str().as_bytes(), user_id, &hub, &store, &settings).await
            }
            WsMessage::Binary(data) => handle_frame(&data, user_id, &hub, &store, &settings).await,
            WsMessage::Pong(_) => {
                deadline = Instant::now() + settings.pong_wait;
                Ok(())
            }
            // Answered by the websocket layer
            WsMessage::Ping(_) => Ok(()),
            WsMessage::Close(frame) => {
                tracing::info!(user_id = user_id, reason = ?frame, "Client initiated close");
                break "peer closed";
            }
        };

        if let Err(e) = result {
            tracing::warn!(user_id = user_id, error = %e, "Dropping connection");
            break teardown_reason(&e);
        }
    };

    lifecycle.trigger(reason);
}

fn teardown_reason(err: &ProtocolError) -> &'static str {
    match err {
        ProtocolError::TooLarge { .. } => "oversized frame",
        ProtocolError::Malformed(_) => "malformed frame",
    }
}

/// One application frame. Only an oversized frame is reported as an error.
async fn handle_frame(
    data: &[u8],
    user_id: UserId,
    hub: &HubHandle,
    store: &SharedStore,
    settings: &PumpSettings,
) -> Result<(), ProtocolError> {
    protocol::check_size(data, settings.max_message_size)?;

    let frame = match protocol::decode_frame(data) {
        Ok(frame) => frame,
        Err(e) => {
            tracing::warn!(user_id = user_id, error = %e, "Discarding malformed frame");
            return Ok(());
        }
    };

    let message = match store::persist(store.clone(), frame.into_new_message(user_id)).await {
        Ok(message) => message,
        Err(e) => {
            tracing::warn!(user_id = user_id, error = %e, "Failed to persist message, not dispatching");
            return Ok(());
        }
    };

    tracing::debug!(
        user_id = user_id,
        message_id = message.id,
        receiver_id = message.receiver_id,
        "Message persisted"
    );

    if hub.dispatch(message).is_err() {
        tracing::warn!(user_id = user_id, "Hub not running, message not dispatched");
    }
    Ok(())
}

#[derive(Debug, thiserror::Error)]
enum WriteError {
    #[error("write deadline exceeded")]
    Timeout,

    #[error("write failed: {0}")]
    Sink(String),
}

fn text_frame(message: &Outbound) -> Option<WsMessage> {
    match protocol::encode_message(message) {
        Ok(json) => Some(WsMessage::Text(json.into())),
        Err(e) => {
            tracing::error!(message_id = message.id, error = %e, "Failed to encode message");
            None
        }
    }
}

/// Write `first` plus whatever else is already queued, then flush once.
async fn write_batch<W>(
    writer: &mut W,
    first: Outbound,
    outbound: &mut mpsc::Receiver<Outbound>,
    settings: &PumpSettings,
) -> Result<(), WriteError>
where
    W: Sink<WsMessage> + Unpin,
    W::Error: Display,
{
    let batch = async {
        let mut next = Some(first);
        while let Some(message) = next {
            if let Some(frame) = text_frame(&message) {
                writer
                    .feed(frame)
                    .await
                    .map_err(|e| WriteError::Sink(e.to_string()))?;
            }
            next = outbound.try_recv().ok();
        }
        writer.flush().await.map_err(|e| WriteError::Sink(e.to_string()))
    };

    timeout(settings.write_wait, batch)
        .await
        .map_err(|_| WriteError::Timeout)?
}

async fn write_with_deadline<W>(
    writer: &mut W,
    frame: WsMessage,
    settings: &PumpSettings,
) -> Result<(), WriteError>
where
    W: Sink<WsMessage> + Unpin,
    W::Error: Display,
{
    timeout(settings.write_wait, writer.send(frame))
        .await
        .map_err(|_| WriteError::Timeout)?
        .map_err(|e| WriteError::Sink(e.to_string()))
}

/// Send pump: drains the outbound queue onto the wire and pings when idle.
/// Ends with a close frame once the queue is closed or teardown starts.
pub async fn write_pump<W>(
    mut writer: W,
    mut outbound: mpsc::Receiver<Outbound>,
    lifecycle: Arc<Lifecycle>,
    settings: PumpSettings,
) where
    W: Sink<WsMessage> + Unpin,
    W::Error: Display,
{
    let mut heartbeat = interval_at(Instant::now() + settings.ping_period, settings.ping_period);
    heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);

    let reason = loop {
        tokio::select! {
            item = outbound.recv() => match item {
                Some(message) => {
                    if let Err(e) = write_batch(&mut writer, message, &mut outbound, &settings).await {
                        tracing::warn!(user_id = lifecycle.user_id(), error = %e, "WebSocket send failed");
                        break "write failed";
                    }
                    // Traffic counts as activity; next ping is a full period away
                    heartbeat.reset();
                }
                None => {
                    let _ = write_with_deadline(&mut writer, WsMessage::Close(None), &settings).await;
                    break "queue closed";
                }
            },
            _ = heartbeat.tick() => {
                if let Err(e) = write_with_deadline(&mut writer, WsMessage::Ping(Bytes::new()), &settings).await {
                    tracing::warn!(user_id = lifecycle.user_id(), error = %e, "Heartbeat failed");
                    break "heartbeat failed";
                }
            }
            _ = lifecycle.cancelled() => {
                let _ = write_with_deadline(&mut writer, WsMessage::Close(None), &settings).await;
                break "cancelled";
            }
        }
    };

    lifecycle.trigger(reason);
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::models::{Message, MessageKind, NewMessage};
    use crate::db::open_in_memory;
    use crate::store::{MessageStore, SqliteMessageStore, StoreError};
    use crate::ws::hub::Hub;
    use chrono::Utc;
    use futures::channel::mpsc as fmpsc;
    use std::time::Duration;

    fn settings() -> PumpSettings {
        PumpSettings::new(8, 512, Duration::from_millis(200), Duration::from_millis(500))
    }

    fn text(json: &str) -> Result<WsMessage, std::io::Error> {
        Ok(WsMessage::Text(json.to_string().into()))
    }

    fn sqlite_store() -> Arc<SqliteMessageStore> {
        Arc::new(SqliteMessageStore::new(open_in_memory().unwrap()))
    }

    /// Fails any message whose content is "boom".
    struct FlakyStore(SqliteMessageStore);

    impl MessageStore for FlakyStore {
        fn create(&self, message: NewMessage) -> Result<Message, StoreError> {
            if message.content == "boom" {
                return Err(StoreError::LockPoisoned);
            }
            self.0.create(message)
        }

        fn history(&self, user: UserId, peer: UserId) -> Result<Vec<Message>, StoreError> {
            self.0.history(user, peer)
        }

        fn contacts(&self, user: UserId) -> Result<Vec<crate::db::models::Contact>, StoreError> {
            self.0.contacts(user)
        }
    }

    fn persisted(id: u64) -> Outbound {
        let now = Utc::now();
        Arc::new(Message {
            id,
            created_at: now,
            updated_at: now,
            sender_id: 1,
            receiver_id: 2,
            content: format!("m{}", id),
            kind: MessageKind::Text,
            is_read: false,
        })
    }

    #[tokio::test]
    async fn test_read_pump_persists_and_dispatches() {
        let (hub, _task) = Hub::spawn();
        let store = sqlite_store();

        let (me, mut my_queue) = ConnectionHandle::new(1, 8);
        let (peer, mut peer_queue) = ConnectionHandle::new(2, 8);
        let lifecycle = Lifecycle::new(me.id, 1, hub.clone());
        hub.register(me).unwrap();
        hub.register(peer).unwrap();

        let frames = futures::stream::iter(vec![
            text(r#"{"receiver_id": 2, "content": "hi", "type": 1}"#),
            text("definitely not json"),
            text(r#"{"receiver_id": 2, "content": "pic.png", "type": 2}"#),
        ]);

        read_pump(frames, lifecycle.clone(), hub.clone(), store.clone(), settings()).await;
        hub.stats().await.unwrap();

        let first = peer_queue.recv().await.unwrap();
        assert_eq!(first.sender_id, 1);
        assert_eq!(first.receiver_id, 2);
        assert_eq!(first.content, "hi");
        assert_eq!(first.kind, MessageKind::Text);
        let second = peer_queue.recv().await.unwrap();
        assert_eq!(second.kind, MessageKind::Image);

        // Echoes arrive, then the queue closes because the stream ended
        assert_eq!(my_queue.recv().await.unwrap().id, first.id);
        assert_eq!(my_queue.recv().await.unwrap().id, second.id);
        assert!(my_queue.recv().await.is_none());

        assert_eq!(store.history(1, 2).unwrap().len(), 2);
        assert_eq!(lifecycle.state(), ConnectionState::Unregistering);
    }

    #[tokio::test]
    async fn test_persistence_failure_drops_message_but_keeps_reading() {
        let (hub, _task) = Hub::spawn();
        let store = Arc::new(FlakyStore(SqliteMessageStore::new(open_in_memory().unwrap())));

        let (peer, mut peer_queue) = ConnectionHandle::new(2, 8);
        hub.register(peer).unwrap();
        let lifecycle = Lifecycle::new(999, 1, hub.clone());

        let frames = futures::stream::iter(vec![
            text(r#"{"receiver_id": 2, "content": "boom", "type": 1}"#),
            text(r#"{"receiver_id": 2, "content": "after", "type": 1}"#),
        ]);

        read_pump(frames, lifecycle, hub.clone(), store.clone(), settings()).await;
        hub.stats().await.unwrap();

        assert_eq!(peer_queue.try_recv().unwrap().content, "after");
        assert!(peer_queue.try_recv().is_err());
        assert_eq!(store.history(1, 2).unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_oversized_frame_ends_read_pump() {
        let (hub, _task) = Hub::spawn();
        let store = sqlite_store();
        let lifecycle = Lifecycle::new(1000, 1, hub.clone());

        let huge = format!(
            r#"{{"receiver_id": 2, "content": "{}", "type": 1}}"#,
            "x".repeat(600)
        );
        let frames = futures::stream::iter(vec![
            text(&huge),
            text(r#"{"receiver_id": 2, "content": "never read", "type": 1}"#),
        ]);

        read_pump(frames, lifecycle.clone(), hub, store.clone(), settings()).await;

        assert!(store.history(1, 2).unwrap().is_empty());
        assert_eq!(lifecycle.state(), ConnectionState::Unregistering);
    }

    #[tokio::test(start_paused = true)]
    async fn test_pong_extends_read_deadline() {
        let (hub, _task) = Hub::spawn();
        let lifecycle = Lifecycle::new(1001, 1, hub.clone());
        let (pongs, frames) = fmpsc::unbounded::<Result<WsMessage, std::io::Error>>();

        let pump = tokio::spawn(read_pump(
            frames,
            lifecycle.clone(),
            hub,
            sqlite_store(),
            settings(),
        ));

        // Three pongs 300ms apart keep a 500ms deadline alive well past 500ms
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(300)).await;
            pongs.unbounded_send(Ok(WsMessage::Pong(Bytes::new()))).unwrap();
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert!(!pump.is_finished());

        // Silence: deadline expires
        tokio::time::sleep(Duration::from_millis(600)).await;
        pump.await.unwrap();
        assert_eq!(lifecycle.state(), ConnectionState::Unregistering);
        drop(pongs);
    }

    #[tokio::test]
    async fn test_write_pump_writes_json_then_close() {
        let (hub, _task) = Hub::spawn();
        let (handle, queue) = ConnectionHandle::new(1, 8);
        let lifecycle = Lifecycle::new(handle.id, 1, hub.clone());
        let (sink, mut wire) = fmpsc::unbounded::<WsMessage>();

        hub.register(handle).unwrap();
        hub.dispatch((*persisted(1)).clone()).unwrap();
        hub.dispatch((*persisted(2)).clone()).unwrap();

        let pump = tokio::spawn(write_pump(sink, queue, lifecycle.clone(), settings()));

        for expected in [1, 2] {
            match wire.next().await.unwrap() {
                WsMessage::Text(body) => {
                    let value: serde_json::Value = serde_json::from_str(body.as_str()).unwrap();
                    assert_eq!(value["id"], expected);
                    assert_eq!(value["type"], 1);
                    assert_eq!(value["is_read"], false);
                }
                other => panic!("expected text frame, got {:?}", other),
            }
        }

        // Hub-side unregister closes the queue
        hub.unregister(lifecycle.id()).unwrap();
        assert_eq!(wire.next().await.unwrap(), WsMessage::Close(None));
        pump.await.unwrap();
        assert_eq!(lifecycle.state(), ConnectionState::Unregistering);
    }

    #[tokio::test(start_paused = true)]
    async fn test_write_pump_pings_when_idle() {
        let (hub, _task) = Hub::spawn();
        let (handle, queue) = ConnectionHandle::new(1, 8);
        let lifecycle = Lifecycle::new(handle.id, 1, hub.clone());
        hub.register(handle).unwrap();
        let (sink, mut wire) = fmpsc::unbounded::<WsMessage>();

        let _pump = tokio::spawn(write_pump(sink, queue, lifecycle.clone(), settings()));

        // ping_period = 450ms
        let frame = tokio::time::timeout(Duration::from_millis(500), wire.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(frame, WsMessage::Ping(_)));

        lifecycle.trigger("test over");
        assert_eq!(wire.next().await.unwrap(), WsMessage::Close(None));
    }

    #[tokio::test]
    async fn test_write_failure_tears_connection_down() {
        let (hub, _task) = Hub::spawn();
        let (handle, queue) = ConnectionHandle::new(1, 8);
        let id = handle.id;
        let lifecycle = Lifecycle::new(id, 1, hub.clone());
        hub.register(handle).unwrap();

        let (sink, wire) = fmpsc::unbounded::<WsMessage>();
        drop(wire);

        let pump = tokio::spawn(write_pump(sink, queue, lifecycle.clone(), settings()));
        hub.dispatch((*persisted(5)).clone()).unwrap();
        pump.await.unwrap();

        // The failed writer unregistered and cancelled its sibling
        assert_eq!(lifecycle.state(), ConnectionState::Unregistering);
        assert_eq!(hub.lookup(1).await.unwrap(), None);
        tokio::time::timeout(Duration::from_secs(1), lifecycle.cancelled())
            .await
            .unwrap();
    }

    #[test]
    fn test_teardown_reason_per_error() {
        let too_large = ProtocolError::TooLarge { size: 600, limit: 512 };
        assert_eq!(teardown_reason(&too_large), "oversized frame");

        let malformed = protocol::decode_frame(b"nope").unwrap_err();
        assert_eq!(teardown_reason(&malformed), "malformed frame");
    }

    #[tokio::test]
    async fn test_write_pump_survives_zero_pong_wait_config() {
        let (hub, _task) = Hub::spawn();
        let (handle, queue) = ConnectionHandle::new(1, 8);
        let lifecycle = Lifecycle::new(handle.id, 1, hub.clone());
        hub.register(handle).unwrap();
        let (sink, mut wire) = fmpsc::unbounded::<WsMessage>();

        let relay = crate::config::RelayConfig {
            pong_wait_secs: 0,
            write_wait_secs: 0,
            ..Default::default()
        };
        let pump = tokio::spawn(write_pump(sink, queue, lifecycle.clone(), PumpSettings::from(&relay)));

        let frame = tokio::time::timeout(Duration::from_secs(1), wire.next())
            .await
            .unwrap()
            .unwrap();
        assert!(matches!(frame, WsMessage::Ping(_)));

        lifecycle.trigger("done");
        pump.await.unwrap();
        assert_eq!(hub.lookup(1).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_trigger_fires_once() {
        let (hub, _task) = Hub::spawn();
        let (handle, _queue) = ConnectionHandle::new(1, 8);
        let lifecycle = Lifecycle::new(handle.id, 1, hub.clone());
        hub.register(handle).unwrap();
        lifecycle.activate();
        assert_eq!(lifecycle.state(), ConnectionState::Active);

        assert!(lifecycle.trigger("first"));
        assert!(!lifecycle.trigger("second"));
        assert_eq!(hub.stats().await.unwrap().live, 0);

        lifecycle.close();
        assert!(!lifecycle.trigger("after close"));
        assert_eq!(lifecycle.state(), ConnectionState::Closed);
    }
}
