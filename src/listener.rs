//! Push Listener: one IDLE task per user with connected clients.
//!
//! Each task cycles through connect, select, IDLE, and on a server push runs an
//! incremental sync of the watched folder and broadcasts a `new_email` event.
//! Protocol or network failures back off exponentially and reconnect; the
//! per-user cancellation token interrupts every wait, including IDLE itself.

use crate::config::ListenerConfig;
use crate::error::Result;
use crate::hub::{Event, NotificationHub};
use crate::imap::IdleOutcome;
use crate::model::MailAccount;
use crate::pool::{ConnectionPool, SessionHandle};
use crate::sync::SyncEngine;
use crate::UserId;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

const STOP_TIMEOUT: Duration = Duration::from_secs(5);

struct ListenerEntry {
    id: u64,
    cancel: CancellationToken,
    task: JoinHandle<()>,
}

/// Why a listen attempt ended without an error.
enum Exit {
    Cancelled,
    IdleUnsupported,
}

/// Exponential reconnect delay with a bounded number of consecutive failures.
#[derive(Debug)]
struct Backoff {
    initial: Duration,
    max: Duration,
    current: Duration,
    failures: u32,
    max_retries: u32,
}

impl Backoff {
    fn new(config: &ListenerConfig) -> Self {
        Self {
            initial: config.initial_backoff(),
            max: config.max_backoff(),
            current: config.initial_backoff(),
            failures: 0,
            max_retries: config.max_retries,
        }
    }

    fn reset(&mut self) {
        self.current = self.initial;
        self.failures = 0;
    }

    /// Delay before the next attempt, or `None` once retries are exhausted.
    fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures > self.max_retries {
            return None;
        }
        let delay = self.current;
        self.current = (self.current * 2).min(self.max);
        Some(delay)
    }
}

/// Registry of running listener tasks. A key is present exactly while its task
/// is running or about to run.
pub struct PushListeners {
    pool: Arc<ConnectionPool>,
    engine: SyncEngine,
    hub: Arc<NotificationHub>,
    config: ListenerConfig,
    tasks: Mutex<HashMap<UserId, ListenerEntry>>,
    next_id: AtomicU64,
}

impl std::fmt::Debug for PushListeners {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PushListeners")
            .field("config", &self.config)
            .field("running", &self.tasks().len())
            .finish()
    }
}

impl PushListeners {
    pub fn new(
        pool: Arc<ConnectionPool>,
        engine: SyncEngine,
        hub: Arc<NotificationHub>,
        config: ListenerConfig,
    ) -> Arc<Self> {
        Arc::new(Self {
            pool,
            engine,
            hub,
            config,
            tasks: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        })
    }

    fn tasks(&self) -> std::sync::MutexGuard<'_, HashMap<UserId, ListenerEntry>> {
        self.tasks.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start the user's listener. Returns false when one is already running.
    pub fn start(self: &Arc<Self>, user: &str, account: &MailAccount) -> bool {
        let mut tasks = self.tasks();
        if tasks.contains_key(user) {
            return false;
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let cancel = CancellationToken::new();
        let user = UserId::from(user);
        let task = tokio::spawn(Arc::clone(self).run(
            id,
            user.clone(),
            account.clone(),
            cancel.clone(),
        ));
        tasks.insert(user, ListenerEntry { id, cancel, task });
        true
    }

    /// Cancel the user's listener and wait for it to exit. Returns false when
    /// none was running.
    pub async fn stop(&self, user: &str) -> bool {
        let Some(entry) = self.tasks().remove(user) else {
            return false;
        };
        entry.cancel.cancel();
        if tokio::time::timeout(STOP_TIMEOUT, entry.task).await.is_err() {
            tracing::warn!(user, "push listener did not stop in time");
        }
        true
    }

    pub fn is_running(&self, user: &str) -> bool {
        self.tasks().contains_key(user)
    }

    pub fn running(&self) -> usize {
        self.tasks().len()
    }

    /// Cancel every listener and wait for them to exit.
    pub async fn shutdown(&self) {
        let entries: Vec<(UserId, ListenerEntry)> = self.tasks().drain().collect();
        for (_, entry) in &entries {
            entry.cancel.cancel();
        }
        for (user, entry) in entries {
            if tokio::time::timeout(STOP_TIMEOUT, entry.task).await.is_err() {
                tracing::warn!(user = %user, "push listener did not stop in time");
            }
        }
    }

    async fn run(
        self: Arc<Self>,
        id: u64,
        user: UserId,
        account: MailAccount,
        cancel: CancellationToken,
    ) {
        let folder = self.config.folder.clone();
        let mut backoff = Backoff::new(&self.config);
        let mut session: Option<Arc<SessionHandle>> = None;
        tracing::info!(user = %user, %folder, "push listener started");

        loop {
            let attempt = tokio::select! {
                _ = cancel.cancelled() => Ok(Exit::Cancelled),
                result = self.listen(&user, &account, &cancel, &mut backoff, &mut session) => result,
            };

            match attempt {
                Ok(Exit::Cancelled) => break,
                Ok(Exit::IdleUnsupported) => {
                    tracing::info!(
                        user = %user,
                        "mail server does not support IDLE, relying on the freshness window"
                    );
                    self.report_disconnected(&user, &folder);
                    break;
                }
                Err(error) => {
                    if let Some(handle) = session.take() {
                        self.pool.release_listener(&user, &handle);
                    }
                    let Some(delay) = backoff.next_delay() else {
                        tracing::warn!(
                            user = %user,
                            %error,
                            failures = backoff.failures,
                            "push listener giving up after repeated failures"
                        );
                        self.report_disconnected(&user, &folder);
                        break;
                    };
                    tracing::warn!(
                        user = %user,
                        %error,
                        retry_in_ms = delay.as_millis() as u64,
                        "push listener failed, reconnecting"
                    );
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(delay) => {}
                    }
                }
            }
        }

        if let Some(handle) = session.take() {
            self.pool.release_listener(&user, &handle);
        }
        {
            let mut tasks = self.tasks();
            if tasks.get(&user).is_some_and(|entry| entry.id == id) {
                tasks.remove(&user);
            }
        }
        tracing::info!(user = %user, "push listener stopped");
    }

    /// One connect-select-IDLE cycle. Only returns on cancellation, a missing
    /// IDLE capability or an error.
    async fn listen(
        &self,
        user: &str,
        account: &MailAccount,
        cancel: &CancellationToken,
        backoff: &mut Backoff,
        current: &mut Option<Arc<SessionHandle>>,
    ) -> Result<Exit> {
        let handle = self.pool.listener_session(user, account).await?;
        *current = Some(handle.clone());
        let mut session = handle.lock().await;

        if !session.capabilities().await?.idle() {
            return Ok(Exit::IdleUnsupported);
        }
        session.select_fresh(&self.config.folder).await?;
        tracing::debug!(
            user,
            folder = %self.config.folder,
            session = session.handle().id(),
            "push listener idling"
        );

        loop {
            match session.idle(self.config.idle_refresh(), cancel).await? {
                IdleOutcome::Cancelled => return Ok(Exit::Cancelled),
                IdleOutcome::Timeout => backoff.reset(),
                IdleOutcome::Changed => {
                    backoff.reset();
                    self.resync(user, account).await;
                }
            }
        }
    }

    async fn resync(&self, user: &str, account: &MailAccount) {
        let folder = self.config.folder.as_str();
        let event = match self.engine.sync_folder(user, account, folder).await {
            Ok(report) => {
                tracing::debug!(
                    user,
                    folder,
                    mode = %report.mode,
                    persisted = report.persisted,
                    "push listener resynced folder"
                );
                Event::new_email(folder)
            }
            Err(error) => {
                tracing::warn!(user, folder, %error, "push-triggered sync failed");
                Event::SyncError {
                    folder: folder.to_string(),
                    message: error.to_string(),
                }
            }
        };
        self.hub.broadcast(user, &event);
    }

    fn report_disconnected(&self, user: &str, folder: &str) {
        self.hub.broadcast(
            user,
            &Event::ConnectionStatus {
                folder: folder.to_string(),
                connected: false,
            },
        );
    }
}
