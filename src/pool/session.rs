//! Session Handle: one authenticated connection behind its own exclusive lock.

use crate::imap::{
    Capabilities, FetchedMessage, FlagOp, IdleOutcome, MailConnection, MailboxStatus,
    RemoteFolder, SessionError, ThreadGroup,
};

use tokio::sync::{Mutex, OwnedMutexGuard};
use tokio_util::sync::CancellationToken;

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, PoisonError};
use std::time::{Duration, Instant};

const LOGOUT_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    /// Short request-driven commands; capped per user.
    Worker,
    /// The single long-lived IDLE connection per user.
    Listener,
}

impl std::fmt::Display for Tier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Tier::Worker => f.write_str("worker"),
            Tier::Listener => f.write_str("listener"),
        }
    }
}

struct SessionState {
    connection: Box<dyn MailConnection>,
    selected: Option<(String, MailboxStatus)>,
    capabilities: Option<Capabilities>,
}

pub struct SessionHandle {
    id: u64,
    tier: Tier,
    generation: u64,
    state: Arc<Mutex<SessionState>>,
    broken: AtomicBool,
    /// When the last command finished, or when the connection opened.
    last_activity: std::sync::Mutex<Instant>,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("id", &self.id)
            .field("tier", &self.tier)
            .field("generation", &self.generation)
            .field("broken", &self.is_broken())
            .finish()
    }
}

impl SessionHandle {
    pub(crate) fn new(
        id: u64,
        tier: Tier,
        generation: u64,
        connection: Box<dyn MailConnection>,
    ) -> Arc<Self> {
        Arc::new(Self {
            id,
            tier,
            generation,
            state: Arc::new(Mutex::new(SessionState {
                connection,
                selected: None,
                capabilities: None,
            })),
            broken: AtomicBool::new(false),
            last_activity: std::sync::Mutex::new(Instant::now()),
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn tier(&self) -> Tier {
        self.tier
    }

    pub(crate) fn generation(&self) -> u64 {
        self.generation
    }

    /// A broken handle is never reused; it is closed on release.
    pub fn is_broken(&self) -> bool {
        self.broken.load(Ordering::Acquire)
    }

    pub(crate) fn mark_broken(&self) {
        self.broken.store(true, Ordering::Release);
    }

    /// Time since the last command completed on this connection.
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .elapsed()
    }

    fn touch(&self) {
        *self
            .last_activity
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Instant::now();
    }

    /// Wait for exclusive access. Every command goes through the returned guard.
    pub async fn lock(self: Arc<Self>) -> SessionGuard {
        let state = self.state.clone().lock_owned().await;
        SessionGuard {
            handle: self,
            state,
        }
    }

    /// Log out and drop the connection. Waits for any in-flight holder first.
    pub(crate) async fn close(self: Arc<Self>) {
        self.mark_broken();
        let mut state = self.state.lock().await;
        match tokio::time::timeout(LOGOUT_TIMEOUT, state.connection.logout()).await {
            Ok(Ok(())) => {}
            Ok(Err(error)) => {
                tracing::debug!(session = self.id, tier = %self.tier, %error, "logout failed");
            }
            Err(_) => {
                tracing::debug!(session = self.id, tier = %self.tier, "logout timed out");
            }
        }
        state.selected = None;
        tracing::debug!(session = self.id, tier = %self.tier, "closed mail session");
    }

    /// Close from a synchronous context such as `Drop`.
    pub(crate) fn close_in_background(self: Arc<Self>) {
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(self.close());
            }
            Err(_) => self.mark_broken(),
        }
    }
}

/// Marks the handle broken unless the command completed. A command future
/// dropped mid-flight leaves the protocol stream in an unknown state.
struct InFlight {
    handle: Arc<SessionHandle>,
    completed: bool,
}

impl InFlight {
    fn finish<T>(mut self, result: Result<T, SessionError>) -> Result<T, SessionError> {
        self.completed = true;
        self.handle.touch();
        if let Err(error) = &result
            && error.is_transient()
        {
            self.handle.mark_broken();
        }
        result
    }
}

impl Drop for InFlight {
    fn drop(&mut self) {
        if !self.completed {
            tracing::debug!(session = self.handle.id, "command abandoned mid-flight");
            self.handle.mark_broken();
        }
    }
}

/// Exclusive access to one session. Dropping it releases the lock.
pub struct SessionGuard {
    handle: Arc<SessionHandle>,
    state: OwnedMutexGuard<SessionState>,
}

impl std::fmt::Debug for SessionGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionGuard")
            .field("handle", &self.handle)
            .finish()
    }
}

impl SessionGuard {
    pub fn handle(&self) -> &Arc<SessionHandle> {
        &self.handle
    }

    fn begin(&self) -> InFlight {
        InFlight {
            handle: self.handle.clone(),
            completed: false,
        }
    }

    pub fn selected_folder(&self) -> Option<&str> {
        self.state
            .selected
            .as_ref()
            .map(|(folder, _)| folder.as_str())
    }

    /// Select `folder` unless it is already selected.
    pub async fn select(&mut self, folder: &str) -> Result<MailboxStatus, SessionError> {
        if let Some((selected, status)) = &self.state.selected
            && selected == folder
        {
            return Ok(*status);
        }
        self.select_fresh(folder).await
    }

    /// Always re-select to get the current message count.
    pub async fn select_fresh(&mut self, folder: &str) -> Result<MailboxStatus, SessionError> {
        let flight = self.begin();
        self.state.selected = None;
        let result = flight.finish(self.state.connection.select(folder).await);
        if let Ok(status) = &result {
            self.state.selected = Some((folder.to_string(), *status));
        }
        result
    }

    pub async fn noop(&mut self) -> Result<(), SessionError> {
        let flight = self.begin();
        flight.finish(self.state.connection.noop().await)
    }

    /// Capabilities are fetched once per connection.
    pub async fn capabilities(&mut self) -> Result<Capabilities, SessionError> {
        if let Some(capabilities) = &self.state.capabilities {
            return Ok(capabilities.clone());
        }
        let flight = self.begin();
        let capabilities = flight.finish(self.state.connection.capabilities().await)?;
        self.state.capabilities = Some(capabilities.clone());
        Ok(capabilities)
    }

    pub async fn list_folders(&mut self) -> Result<Vec<RemoteFolder>, SessionError> {
        let flight = self.begin();
        flight.finish(self.state.connection.list_folders().await)
    }

    pub async fn search(&mut self, criteria: &str) -> Result<Vec<u32>, SessionError> {
        let flight = self.begin();
        flight.finish(self.state.connection.search(criteria).await)
    }

    pub async fn fetch_headers(&mut self, seq_set: &str) -> Result<Vec<FetchedMessage>, SessionError> {
        let flight = self.begin();
        flight.finish(self.state.connection.fetch_headers(seq_set).await)
    }

    pub async fn fetch_bodies(&mut self, seq_set: &str) -> Result<Vec<FetchedMessage>, SessionError> {
        let flight = self.begin();
        flight.finish(self.state.connection.fetch_bodies(seq_set).await)
    }

    pub async fn thread_references(&mut self, criteria: &str) -> Result<Vec<ThreadGroup>, SessionError> {
        let flight = self.begin();
        flight.finish(self.state.connection.thread_references(criteria).await)
    }

    pub async fn store_flags(
        &mut self,
        seq_set: &str,
        op: FlagOp,
        flags: &[String],
    ) -> Result<(), SessionError> {
        let flight = self.begin();
        flight.finish(self.state.connection.store_flags(seq_set, op, flags).await)
    }

    pub async fn copy(&mut self, seq_set: &str, destination: &str) -> Result<(), SessionError> {
        let flight = self.begin();
        flight.finish(self.state.connection.copy(seq_set, destination).await)
    }

    pub async fn append(
        &mut self,
        folder: &str,
        flags: &[String],
        content: &[u8],
    ) -> Result<(), SessionError> {
        let flight = self.begin();
        let result = flight.finish(self.state.connection.append(folder, flags, content).await);
        if self.selected_folder() == Some(folder) {
            self.state.selected = None;
        }
        result
    }

    /// IDLE on the selected folder. Cancellation is a normal outcome, not an error.
    pub async fn idle(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<IdleOutcome, SessionError> {
        let flight = self.begin();
        flight.finish(self.state.connection.idle(timeout, cancel).await)
    }
}
