//! Notification Hub: per-user registry of client sockets and event fan-out.
//!
//! Every client owns a bounded outbound queue drained by its own writer task,
//! so a slow or dead socket only ever loses its own events.

use crate::config::HubConfig;
use crate::UserId;

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};

#[derive(Debug, thiserror::Error)]
pub enum HubError {
    #[error("user '{user}' already has {limit} notification connections")]
    TooManyClients { user: String, limit: usize },

    #[error("notification hub is shut down")]
    Closed,
}

/// Payload pushed to client sockets. The UI treats every kind as "refetch this
/// folder's thread list".
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    NewEmail { folder: String },
    SyncError { folder: String, message: String },
    ConnectionStatus { folder: String, connected: bool },
}

impl Event {
    pub fn new_email(folder: impl Into<String>) -> Self {
        Event::NewEmail {
            folder: folder.into(),
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            Event::NewEmail { .. } => "new_email",
            Event::SyncError { .. } => "sync_error",
            Event::ConnectionStatus { .. } => "connection_status",
        }
    }
}

/// Outbound half of a client socket.
#[async_trait]
pub trait ClientSink: Send + 'static {
    async fn send(&mut self, payload: &str) -> anyhow::Result<()>;

    async fn close(&mut self) {}
}

/// A registered client. Its `closed` token fires when the hub stops writing to
/// it, either through `unregister` or after a failed write.
#[derive(Debug)]
pub struct NotificationClient {
    id: u64,
    user: UserId,
    closed: CancellationToken,
}

impl NotificationClient {
    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn user(&self) -> &UserId {
        &self.user
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    pub async fn closed(&self) {
        self.closed.cancelled().await
    }
}

struct Registered {
    client: Arc<NotificationClient>,
    queue: mpsc::Sender<Arc<str>>,
}

pub struct NotificationHub {
    config: HubConfig,
    clients: Mutex<HashMap<UserId, Vec<Registered>>>,
    next_client_id: AtomicU64,
    shutdown: CancellationToken,
}

impl std::fmt::Debug for NotificationHub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NotificationHub")
            .field("config", &self.config)
            .field("closed", &self.shutdown.is_cancelled())
            .finish()
    }
}

impl NotificationHub {
    pub fn new(config: HubConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            clients: Mutex::new(HashMap::new()),
            next_client_id: AtomicU64::new(1),
            shutdown: CancellationToken::new(),
        })
    }

    fn clients(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, Vec<Registered>>> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a socket for `user` and start its writer task. Rejected once the
    /// user is at the per-user cap.
    pub fn register(
        self: &Arc<Self>,
        user: &str,
        sink: Box<dyn ClientSink>,
    ) -> Result<Arc<NotificationClient>, HubError> {
        if self.shutdown.is_cancelled() {
            return Err(HubError::Closed);
        }

        let (queue, outbound) = mpsc::channel(self.config.queue_capacity.max(1));
        let client = {
            let mut clients = self.clients();
            let registered = clients.entry(UserId::from(user)).or_default();
            if registered.len() >= self.config.max_clients_per_user {
                tracing::info!(
                    user,
                    limit = self.config.max_clients_per_user,
                    "rejecting notification client over the per-user limit"
                );
                return Err(HubError::TooManyClients {
                    user: user.to_string(),
                    limit: self.config.max_clients_per_user,
                });
            }

            let client = Arc::new(NotificationClient {
                id: self.next_client_id.fetch_add(1, Ordering::Relaxed),
                user: UserId::from(user),
                closed: self.shutdown.child_token(),
            });
            registered.push(Registered {
                client: client.clone(),
                queue,
            });
            client
        };

        tracing::debug!(user, client = client.id, "notification client registered");
        tokio::spawn(write_loop(
            Arc::downgrade(self),
            client.clone(),
            sink,
            outbound,
            self.config.write_timeout(),
        ));

        Ok(client)
    }

    /// Remove a client and stop its writer. Returns how many clients the user
    /// still has; deciding what to do at zero is up to the caller.
    pub fn unregister(&self, client: &NotificationClient) -> usize {
        client.closed.cancel();
        self.remove(&client.user, client.id)
    }

    fn remove(&self, user: &str, client_id: u64) -> usize {
        let mut clients = self.clients();
        let Some(registered) = clients.get_mut(user) else {
            return 0;
        };
        let before = registered.len();
        registered.retain(|entry| entry.client.id != client_id);
        let remaining = registered.len();
        if remaining == 0 {
            clients.remove(user);
        }
        if remaining < before {
            tracing::debug!(user, client = client_id, remaining, "notification client unregistered");
        }
        remaining
    }

    pub fn active_connections(&self, user: &str) -> usize {
        self.clients().get(user).map(Vec::len).unwrap_or(0)
    }

    /// Queue `event` for every client of `user`. Returns how many clients
    /// accepted it; a full queue drops the event for that client only.
    pub fn broadcast(&self, user: &str, event: &Event) -> usize {
        let payload: Arc<str> = match serde_json::to_string(event) {
            Ok(json) => Arc::from(json),
            Err(error) => {
                tracing::warn!(user, %error, "failed to serialize notification event");
                return 0;
            }
        };

        let clients = self.clients();
        let Some(registered) = clients.get(user) else {
            return 0;
        };

        let mut delivered = 0;
        for entry in registered {
            match entry.queue.try_send(payload.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    tracing::debug!(
                        user,
                        client = entry.client.id,
                        kind = event.kind(),
                        "notification queue full, dropping event"
                    );
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {}
            }
        }
        delivered
    }

    /// Close every client. Later registrations are rejected.
    pub fn close(&self) {
        self.shutdown.cancel();
        let drained: usize = self.clients().drain().map(|(_, entries)| entries.len()).sum();
        tracing::info!(clients = drained, "notification hub closed");
    }
}

async fn write_loop(
    hub: Weak<NotificationHub>,
    client: Arc<NotificationClient>,
    mut sink: Box<dyn ClientSink>,
    mut outbound: mpsc::Receiver<Arc<str>>,
    write_timeout: std::time::Duration,
) {
    loop {
        let payload = tokio::select! {
            _ = client.closed.cancelled() => break,
            payload = outbound.recv() => match payload {
                Some(payload) => payload,
                None => break,
            },
        };

        match tokio::time::timeout(write_timeout, sink.send(&payload)).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::debug!(user = %client.user, client = client.id, %error, "notification write failed");
                break;
            }
            Err(_) => {
                tracing::debug!(user = %client.user, client = client.id, "notification write timed out");
                break;
            }
        }
    }

    client.closed.cancel();
    sink.close().await;
    if let Some(hub) = hub.upgrade() {
        hub.remove(&client.user, client.id);
    }
}
