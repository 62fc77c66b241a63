//! Connection registry.
//!
//! A single task owns the set of live connections and the identity index.
//! Everything else talks to it through [`HubHandle`], which only enqueues
//! commands, so no registry state is ever shared or locked. Commands from one
//! handle are applied in the order they were sent.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::error::TrySendError;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::db::models::{Message, UserId};

pub type ConnectionId = u64;

/// Item carried by an outbound queue.
pub type Outbound = Arc<Message>;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Hub-side view of a connection: its identity and the writing end of its outbound queue.
///
/// The hub holds the only sender, so dropping the handle closes the queue and
/// the connection's send pump sees end-of-stream.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub user_id: UserId,
    outbound: mpsc::Sender<Outbound>,
}

impl ConnectionHandle {
    /// Allocate a connection id and a bounded outbound queue.
    pub fn new(user_id: UserId, capacity: usize) -> (Self, mpsc::Receiver<Outbound>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let handle = Self {
            id: NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed),
            user_id,
            outbound: tx,
        };
        (handle, rx)
    }
}

/// Point-in-time sizes of the two registry structures.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct HubStats {
    pub live: usize,
    pub identities: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("hub is not running")]
pub struct HubClosed;

enum Command {
    Register(ConnectionHandle),
    Unregister(ConnectionId),
    Dispatch(Outbound),
    Lookup(UserId, oneshot::Sender<Option<ConnectionId>>),
    Stats(oneshot::Sender<HubStats>),
    Shutdown(oneshot::Sender<()>),
}

/// Cloneable submission side of the hub.
#[derive(Debug, Clone)]
pub struct HubHandle {
    commands: mpsc::UnboundedSender<Command>,
}

impl std::fmt::Debug for Command {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Register(conn) => write!(f, "Register({})", conn.id),
            Self::Unregister(id) => write!(f, "Unregister({})", id),
            Self::Dispatch(msg) => write!(f, "Dispatch({})", msg.id),
            Self::Lookup(user, _) => write!(f, "Lookup({})", user),
            Self::Stats(_) => f.write_str("Stats"),
            Self::Shutdown(_) => f.write_str("Shutdown"),
        }
    }
}

impl HubHandle {
    fn send(&self, cmd: Command) -> Result<(), HubClosed> {
        self.commands.send(cmd).map_err(|_| HubClosed)
    }

    /// Make `conn` the dispatch target for its identity.
    /// If the hub is gone the handle is dropped, which closes the queue.
    pub fn register(&self, conn: ConnectionHandle) -> Result<(), HubClosed> {
        self.send(Command::Register(conn))
    }

    /// Remove a connection and close its queue. Unknown ids are ignored.
    pub fn unregister(&self, id: ConnectionId) -> Result<(), HubClosed> {
        self.send(Command::Unregister(id))
    }

    /// Route a persisted message to its receiver and echo it to its sender. Never blocks.
    pub fn dispatch(&self, message: Message) -> Result<(), HubClosed> {
        self.send(Command::Dispatch(Arc::new(message)))
    }

    /// Connection currently mapped to `user_id`, as seen after all previously sent commands.
    pub async fn lookup(&self, user_id: UserId) -> Result<Option<ConnectionId>, HubClosed> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Lookup(user_id, tx))?;
        rx.await.map_err(|_| HubClosed)
    }

    pub async fn stats(&self) -> Result<HubStats, HubClosed> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Stats(tx))?;
        rx.await.map_err(|_| HubClosed)
    }

    /// Close every live connection's queue and stop the hub loop.
    pub async fn shutdown(&self) -> Result<(), HubClosed> {
        let (tx, rx) = oneshot::channel();
        self.send(Command::Shutdown(tx))?;
        rx.await.map_err(|_| HubClosed)
    }
}

/// The registry itself. Owned by exactly one task; see [`Hub::spawn`].
pub struct Hub {
    commands: mpsc::UnboundedReceiver<Command>,
    /// Live set: every registered connection, keyed by id.
    live: HashMap<ConnectionId, ConnectionHandle>,
    /// Identity index: the current dispatch target per user.
    by_user: HashMap<UserId, ConnectionId>,
}

impl Hub {
    pub fn new() -> (Self, HubHandle) {
        // Unbounded so submitting never blocks a pump; the loop only does O(1) work per command
        let (tx, rx) = mpsc::unbounded_channel();
        let hub = Self {
            commands: rx,
            live: HashMap::new(),
            by_user: HashMap::new(),
        };
        (hub, HubHandle { commands: tx })
    }

    /// Start the hub loop on the runtime.
    pub fn spawn() -> (HubHandle, JoinHandle<()>) {
        let (hub, handle) = Self::new();
        let task = tokio::spawn(hub.run());
        (handle, task)
    }

    /// Process commands until shutdown or until every handle is dropped.
    pub async fn run(mut self) {
        tracing::info!("Connection hub started");

        while let Some(cmd) = self.commands.recv().await {
            match cmd {
                Command::Register(conn) => self.register(conn),
                Command::Unregister(id) => {
                    self.unregister(id, "unregister");
                }
                Command::Dispatch(message) => self.dispatch(message),
                Command::Lookup(user_id, reply) => {
                    let _ = reply.send(self.by_user.get(&user_id).copied());
                }
                Command::Stats(reply) => {
                    let _ = reply.send(HubStats {
                        live: self.live.len(),
                        identities: self.by_user.len(),
                    });
                }
                Command::Shutdown(reply) => {
                    self.close_all();
                    let _ = reply.send(());
                    break;
                }
            }
        }

        self.close_all();
        tracing::info!("Connection hub stopped");
    }

    fn register(&mut self, conn: ConnectionHandle) {
        let (id, user_id) = (conn.id, conn.user_id);

        if let Some(&previous) = self.by_user.get(&user_id) {
            if previous != id {
                tracing::info!(
                    user_id = user_id,
                    connection_id = previous,
                    superseded_by = id,
                    "Closing superseded connection"
                );
                self.unregister(previous, "superseded");
            }
        }

        self.live.insert(id, conn);
        self.by_user.insert(user_id, id);

        tracing::debug!(
            user_id = user_id,
            connection_id = id,
            live = self.live.len(),
            "Connection registered"
        );
    }

    /// Drop the connection's queue sender and forget it. Returns false if it was not live.
    fn unregister(&mut self, id: ConnectionId, reason: &'static str) -> bool {
        let Some(conn) = self.live.remove(&id) else {
            return false;
        };

        if self.by_user.get(&conn.user_id) == Some(&id) {
            self.by_user.remove(&conn.user_id);
        }

        tracing::debug!(
            user_id = conn.user_id,
            connection_id = id,
            reason = reason,
            live = self.live.len(),
            "Connection unregistered"
        );
        // conn dropped here, closing the outbound queue
        true
    }

    fn dispatch(&mut self, message: Outbound) {
        self.deliver(message.receiver_id, &message);

        // Sender gets an echo; a self-addressed message is delivered once
        if message.sender_id != message.receiver_id {
            self.deliver(message.sender_id, &message);
        }
    }

    /// Non-blocking enqueue to the user's current connection, evicting it if the queue can't take the item.
    fn deliver(&mut self, user_id: UserId, message: &Outbound) {
        let Some(&id) = self.by_user.get(&user_id) else {
            return;
        };
        let Some(conn) = self.live.get(&id) else {
            self.by_user.remove(&user_id);
            return;
        };

        match conn.outbound.try_send(Arc::clone(message)) {
            Ok(()) => {
                tracing::trace!(
                    user_id = user_id,
                    connection_id = id,
                    message_id = message.id,
                    "Message enqueued"
                );
            }
            Err(TrySendError::Full(_)) => {
                tracing::warn!(
                    user_id = user_id,
                    connection_id = id,
                    message_id = message.id,
                    "Outbound queue full, evicting connection"
                );
                self.unregister(id, "backpressure");
            }
            Err(TrySendError::Closed(_)) => {
                self.unregister(id, "queue closed");
            }
        }
    }

    fn close_all(&mut self) {
        if !self.live.is_empty() {
            tracing::info!(live = self.live.len(), "Closing all connections");
        }
        self.by_user.clear();
        self.live.clear();
    }
}
