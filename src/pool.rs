//! Connection Pool: per-user worker tier (capped, admission-gated) plus a single
//! listener-tier connection per user for IDLE.

pub mod session;

pub use session::{SessionGuard, SessionHandle, Tier};

use crate::config::PoolConfig;
use crate::error::{Error, Result};
use crate::imap::Connector;
use crate::model::MailAccount;
use crate::UserId;

use futures::future::BoxFuture;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use std::collections::HashMap;
use std::ops::{Deref, DerefMut};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Worker and listener bookkeeping for one user.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolStats {
    pub open_workers: usize,
    pub idle_workers: usize,
    pub has_listener: bool,
}

#[derive(Default)]
struct WorkerSet {
    idle: Vec<Arc<SessionHandle>>,
    /// Idle + leased + reserved-for-creation. Never exceeds the cap.
    open: usize,
    /// Bumped by `remove`; handles from older generations are never reused.
    generation: u64,
    closed: bool,
}

struct UserConnections {
    user: UserId,
    cap: usize,
    gate: Arc<Semaphore>,
    workers: Mutex<WorkerSet>,
    listener: Mutex<Option<Arc<SessionHandle>>>,
}

enum Checkout {
    Idle(Arc<SessionHandle>, Duration),
    Reserved(Reservation),
    Full,
    Closed,
}

impl UserConnections {
    fn new(user: UserId, cap: usize) -> Self {
        Self {
            user,
            cap,
            gate: Arc::new(Semaphore::new(cap)),
            workers: Mutex::new(WorkerSet::default()),
            listener: Mutex::new(None),
        }
    }

    fn workers(&self) -> std::sync::MutexGuard<'_, WorkerSet> {
        self.workers.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn listener_slot(&self) -> std::sync::MutexGuard<'_, Option<Arc<SessionHandle>>> {
        self.listener.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Take the most recently used idle handle, or reserve a creation slot.
    fn checkout(self: &Arc<Self>) -> Checkout {
        let mut workers = self.workers();
        if workers.closed {
            return Checkout::Closed;
        }

        while let Some(handle) = workers.idle.pop() {
            if handle.is_broken() || handle.generation() != workers.generation {
                workers.open = workers.open.saturating_sub(1);
                handle.close_in_background();
                continue;
            }
            let idle_for = handle.idle_for();
            return Checkout::Idle(handle, idle_for);
        }

        if workers.open < self.cap {
            workers.open += 1;
            let generation = workers.generation;
            return Checkout::Reserved(Reservation {
                user: Arc::clone(self),
                generation,
                armed: true,
            });
        }

        Checkout::Full
    }

    /// Return a leased handle, or close it if it must not be reused.
    fn release(&self, handle: &Arc<SessionHandle>) {
        let mut workers = self.workers();
        if workers.closed || handle.is_broken() || handle.generation() != workers.generation {
            workers.open = workers.open.saturating_sub(1);
            drop(workers);
            tracing::debug!(user = %self.user, session = handle.id(), "closing released worker session");
            handle.clone().close_in_background();
            return;
        }

        workers.idle.push(handle.clone());
    }

    /// Drop a handle that failed its health probe.
    fn forget(&self, handle: &Arc<SessionHandle>) {
        handle.mark_broken();
        let mut workers = self.workers();
        workers.open = workers.open.saturating_sub(1);
        drop(workers);
        handle.clone().close_in_background();
    }

    fn evict_workers(&self) -> usize {
        let mut workers = self.workers();
        workers.generation += 1;
        let drained: Vec<Arc<SessionHandle>> = workers.idle.drain(..).collect();
        workers.open = workers.open.saturating_sub(drained.len());
        drop(workers);

        let count = drained.len();
        for handle in drained {
            handle.close_in_background();
        }
        count
    }

    fn sweep(&self, idle_timeout: Duration) -> usize {
        let mut workers = self.workers();
        let (expired, kept): (Vec<Arc<SessionHandle>>, Vec<Arc<SessionHandle>>) = workers
            .idle
            .drain(..)
            .partition(|handle| handle.idle_for() >= idle_timeout);
        workers.idle = kept;
        workers.open = workers.open.saturating_sub(expired.len());
        drop(workers);

        let count = expired.len();
        for handle in expired {
            handle.close_in_background();
        }
        count
    }

    fn shut_down(&self) {
        self.gate.close();
        {
            let mut workers = self.workers();
            workers.closed = true;
        }
        self.evict_workers();
        if let Some(listener) = self.listener_slot().take() {
            listener.close_in_background();
        }
    }

    fn stats(&self) -> PoolStats {
        let workers = self.workers();
        PoolStats {
            open_workers: workers.open,
            idle_workers: workers.idle.len(),
            has_listener: self.listener_slot().is_some(),
        }
    }
}

/// A reserved creation slot. Returned automatically if the creating caller fails
/// or is cancelled before the connection is registered.
struct Reservation {
    user: Arc<UserConnections>,
    generation: u64,
    armed: bool,
}

impl Reservation {
    fn commit(mut self) {
        self.armed = false;
    }
}

impl Drop for Reservation {
    fn drop(&mut self) {
        if self.armed {
            let mut workers = self.user.workers();
            workers.open = workers.open.saturating_sub(1);
        }
    }
}

/// A worker session checked out of the pool. Dropping it is the release.
pub struct WorkerLease {
    guard: SessionGuard,
    user: Arc<UserConnections>,
    _permit: OwnedSemaphorePermit,
}

impl std::fmt::Debug for WorkerLease {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WorkerLease")
            .field("user", &self.user.user)
            .field("session", self.guard.handle())
            .finish()
    }
}

impl WorkerLease {
    /// Return the session to the idle set. Same as dropping the lease.
    pub fn release(self) {}

    /// Release and close instead of returning the session to the idle set.
    pub fn discard(self) {
        self.guard.handle().mark_broken();
    }
}

impl Deref for WorkerLease {
    type Target = SessionGuard;

    fn deref(&self) -> &Self::Target {
        &self.guard
    }
}

impl DerefMut for WorkerLease {
    fn deref_mut(&mut self) -> &mut Self::Target {
        &mut self.guard
    }
}

impl Drop for WorkerLease {
    fn drop(&mut self) {
        self.user.release(self.guard.handle());
    }
}

pub struct ConnectionPool {
    config: PoolConfig,
    connector: Arc<dyn Connector>,
    users: Mutex<HashMap<UserId, Arc<UserConnections>>>,
    closed: AtomicBool,
    next_session_id: AtomicU64,
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("config", &self.config)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

impl ConnectionPool {
    pub fn new(config: PoolConfig, connector: Arc<dyn Connector>) -> Arc<Self> {
        Arc::new(Self {
            config,
            connector,
            users: Mutex::new(HashMap::new()),
            closed: AtomicBool::new(false),
            next_session_id: AtomicU64::new(1),
        })
    }

    fn user_entry(&self, user: &str) -> Result<Arc<UserConnections>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(Error::PoolClosed);
        }
        let mut users = self.users.lock().unwrap_or_else(PoisonError::into_inner);
        let entry = users.entry(UserId::from(user)).or_insert_with(|| {
            Arc::new(UserConnections::new(
                UserId::from(user),
                self.config.max_workers_per_user,
            ))
        });
        Ok(entry.clone())
    }

    fn existing_entry(&self, user: &str) -> Option<Arc<UserConnections>> {
        self.users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(user)
            .cloned()
    }

    fn next_id(&self) -> u64 {
        self.next_session_id.fetch_add(1, Ordering::Relaxed)
    }

    /// Check out a worker session, reusing an idle one when possible.
    ///
    /// Waits up to `acquire_timeout` for a free slot, then fails with
    /// [`Error::PoolExhausted`]. Idle handles past the health threshold get a NOOP
    /// probe first; a failed probe silently replaces the handle.
    pub async fn acquire(&self, user: &str, account: &MailAccount) -> Result<WorkerLease> {
        let entry = self.user_entry(user)?;

        let permit =
            match tokio::time::timeout(self.config.acquire_timeout(), entry.gate.clone().acquire_owned())
                .await
            {
                Ok(Ok(permit)) => permit,
                Ok(Err(_)) => return Err(Error::PoolClosed),
                Err(_) => {
                    tracing::warn!(user, "timed out waiting for a free mail connection");
                    return Err(Error::PoolExhausted {
                        user: user.to_string(),
                    });
                }
            };

        loop {
            match entry.checkout() {
                Checkout::Idle(handle, idle_for) => {
                    let mut guard = handle.clone().lock().await;
                    if idle_for >= self.config.health_check_after()
                        && let Err(error) = guard.noop().await
                    {
                        tracing::debug!(
                            user,
                            session = handle.id(),
                            %error,
                            "idle mail session failed health check, replacing"
                        );
                        drop(guard);
                        entry.forget(&handle);
                        continue;
                    }
                    return Ok(WorkerLease {
                        guard,
                        user: entry,
                        _permit: permit,
                    });
                }
                Checkout::Reserved(reservation) => {
                    let connection = self.connector.connect(account).await.map_err(|error| {
                        tracing::warn!(user, host = %account.host, %error, "failed to open mail connection");
                        error
                    })?;
                    let handle = SessionHandle::new(
                        self.next_id(),
                        Tier::Worker,
                        reservation.generation,
                        connection,
                    );
                    reservation.commit();
                    tracing::debug!(user, session = handle.id(), "opened worker mail session");

                    let guard = handle.lock().await;
                    return Ok(WorkerLease {
                        guard,
                        user: entry,
                        _permit: permit,
                    });
                }
                Checkout::Full => {
                    return Err(Error::PoolExhausted {
                        user: user.to_string(),
                    });
                }
                Checkout::Closed => return Err(Error::PoolClosed),
            }
        }
    }

    /// Evict every worker session for the user. Idle sessions close now, leased
    /// ones close on release; the next `acquire` always gets a fresh connection.
    pub fn remove(&self, user: &str) {
        if let Some(entry) = self.existing_entry(user) {
            let closed = entry.evict_workers();
            tracing::debug!(user, closed, "evicted worker mail sessions");
        }
    }

    /// Run `op` on a worker session; on a transient session error, evict the
    /// user's workers and retry exactly once on a fresh connection.
    pub async fn with_retry<T, F>(&self, user: &str, account: &MailAccount, mut op: F) -> Result<T>
    where
        F: for<'a> FnMut(&'a mut WorkerLease) -> BoxFuture<'a, Result<T>>,
    {
        let mut lease = self.acquire(user, account).await?;
        let first = op(&mut lease).await;

        match first {
            Err(error) if error.is_transient() => {
                tracing::warn!(user, %error, "mail connection failed, retrying on a fresh connection");
                lease.discard();
                self.remove(user);

                let mut lease = self.acquire(user, account).await?;
                op(&mut lease).await
            }
            other => other,
        }
    }

    /// The user's listener-tier session, connecting if none is open or the
    /// current one broke.
    pub async fn listener_session(
        &self,
        user: &str,
        account: &MailAccount,
    ) -> Result<Arc<SessionHandle>> {
        let entry = self.user_entry(user)?;

        {
            let mut slot = entry.listener_slot();
            match slot.as_ref() {
                Some(handle) if !handle.is_broken() => return Ok(handle.clone()),
                Some(_) => {
                    if let Some(stale) = slot.take() {
                        stale.close_in_background();
                    }
                }
                None => {}
            }
        }

        let connection = self.connector.connect(account).await?;
        let handle = SessionHandle::new(self.next_id(), Tier::Listener, 0, connection);

        let mut slot = entry.listener_slot();
        if self.closed.load(Ordering::Acquire) {
            drop(slot);
            handle.close_in_background();
            return Err(Error::PoolClosed);
        }
        if let Some(existing) = slot.as_ref()
            && !existing.is_broken()
        {
            let existing = existing.clone();
            drop(slot);
            handle.close_in_background();
            return Ok(existing);
        }
        *slot = Some(handle.clone());
        tracing::debug!(user, session = handle.id(), "opened listener mail session");

        Ok(handle)
    }

    /// Close the user's listener-tier session, if any.
    pub fn drop_listener(&self, user: &str) {
        let Some(entry) = self.existing_entry(user) else {
            return;
        };
        if let Some(handle) = entry.listener_slot().take() {
            tracing::debug!(user, session = handle.id(), "closing listener mail session");
            handle.close_in_background();
        }
    }

    /// Close `handle` and clear the listener slot if it still holds that handle.
    /// A newer listener session for the same user is left alone.
    pub(crate) fn release_listener(&self, user: &str, handle: &Arc<SessionHandle>) {
        handle.mark_broken();
        if let Some(entry) = self.existing_entry(user) {
            let mut slot = entry.listener_slot();
            if slot.as_ref().is_some_and(|current| Arc::ptr_eq(current, handle)) {
                slot.take();
            }
        }
        handle.clone().close_in_background();
    }

    /// Close worker sessions idle longer than the configured timeout. The
    /// listener tier is exempt.
    pub fn sweep_idle(&self) -> usize {
        let entries: Vec<Arc<UserConnections>> = self
            .users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        let idle_timeout = self.config.idle_timeout();
        entries.iter().map(|entry| entry.sweep(idle_timeout)).sum()
    }

    pub fn spawn_sweeper(self: &Arc<Self>, shutdown: CancellationToken) -> JoinHandle<()> {
        let pool = Arc::downgrade(self);
        let interval = self.config.sweep_interval();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            ticker.tick().await;

            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let Some(pool) = pool.upgrade() else {
                    break;
                };
                let closed = pool.sweep_idle();
                if closed > 0 {
                    tracing::debug!(closed, "closed idle worker mail sessions");
                }
            }
        })
    }

    pub fn stats(&self, user: &str) -> PoolStats {
        self.existing_entry(user)
            .map(|entry| entry.stats())
            .unwrap_or_default()
    }

    /// Shut down every session for every user. Later `acquire` calls fail with
    /// [`Error::PoolClosed`].
    pub fn close(&self) {
        self.closed.store(true, Ordering::Release);
        let entries: Vec<Arc<UserConnections>> = self
            .users
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect();

        for entry in &entries {
            entry.shut_down();
        }
        tracing::info!(users = entries.len(), "connection pool closed");
    }
}

#[cfg(test)]
mod tests {
    use super::ConnectionPool;
    use crate::config::PoolConfig;
    use crate::error::Error;
    use crate::imap::SessionError;
    use crate::testing::{FakeConnector, FakeServer, test_account};

    use std::sync::Arc;
    use std::time::Duration;

    fn pool_config(cap: usize) -> PoolConfig {
        PoolConfig {
            max_workers_per_user: cap,
            acquire_timeout_secs: 1,
            ..PoolConfig::default()
        }
    }

    #[tokio::test]
    async fn released_sessions_are_reused() {
        let server = FakeServer::new();
        let connector = FakeConnector::new(server.clone());
        let pool = ConnectionPool::new(pool_config(3), connector.clone());
        let account = test_account();

        let lease = pool.acquire("u1", &account).await.unwrap();
        let first_id = lease.handle().id();
        lease.release();

        let lease = pool.acquire("u1", &account).await.unwrap();
        assert_eq!(lease.handle().id(), first_id);
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn worker_count_never_exceeds_cap() {
        let server = FakeServer::new();
        server.set_command_delay(Duration::from_millis(5));
        let connector = FakeConnector::new(server.clone());
        connector.set_connect_delay(Duration::from_millis(5));
        let pool = ConnectionPool::new(pool_config(3), connector.clone());

        let mut tasks = Vec::new();
        for _ in 0..12 {
            let pool = Arc::clone(&pool);
            tasks.push(tokio::spawn(async move {
                let mut lease = pool.acquire("u1", &test_account()).await.unwrap();
                assert!(pool.stats("u1").open_workers <= 3);
                lease.noop().await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }

        assert!(connector.connect_count() <= 3);
        assert!(connector.max_live_connections() <= 3);
        assert!(pool.stats("u1").open_workers <= 3);
    }

    #[tokio::test]
    async fn cap_of_one_creates_exactly_one_connection() {
        let server = FakeServer::new();
        let connector = FakeConnector::new(server.clone());
        connector.set_connect_delay(Duration::from_millis(20));
        let pool = ConnectionPool::new(pool_config(1), connector.clone());

        let first = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let lease = pool.acquire("u1", &test_account()).await.unwrap();
                tokio::time::sleep(Duration::from_millis(10)).await;
                lease.handle().id()
            })
        };
        let second = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let lease = pool.acquire("u1", &test_account()).await.unwrap();
                lease.handle().id()
            })
        };

        let (first, second) = (first.await.unwrap(), second.await.unwrap());
        assert_eq!(first, second);
        assert_eq!(connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let connector = FakeConnector::new(FakeServer::new());
        let pool = ConnectionPool::new(pool_config(1), connector);
        let account = test_account();

        let _held = pool.acquire("u1", &account).await.unwrap();
        let error = pool.acquire("u1", &account).await.unwrap_err();
        assert!(matches!(error, Error::PoolExhausted { .. }));
    }

    #[tokio::test]
    async fn failed_health_check_replaces_session() {
        let server = FakeServer::new();
        let connector = FakeConnector::new(server.clone());
        let config = PoolConfig {
            health_check_after_secs: 0,
            ..pool_config(1)
        };
        let pool = ConnectionPool::new(config, connector.clone());
        let account = test_account();

        let first_id = pool.acquire("u1", &account).await.unwrap().handle().id();
        server.fail_next("NOOP", SessionError::Transient("connection reset".into()));

        let lease = pool.acquire("u1", &account).await.unwrap();
        assert_ne!(lease.handle().id(), first_id);
        assert_eq!(connector.connect_count(), 2);
    }

    #[tokio::test]
    async fn remove_forces_fresh_connection() {
        let server = FakeServer::new();
        let connector = FakeConnector::new(server.clone());
        let pool = ConnectionPool::new(pool_config(2), connector.clone());
        let account = test_account();

        let leased = pool.acquire("u1", &account).await.unwrap();
        let leased_id = leased.handle().id();
        pool.remove("u1");
        drop(leased);

        let lease = pool.acquire("u1", &account).await.unwrap();
        assert_ne!(lease.handle().id(), leased_id);
        assert_eq!(pool.stats("u1").open_workers, 1);
    }

    #[tokio::test]
    async fn broken_pipe_is_evicted_and_retried_once() {
        let server = FakeServer::new();
        server.add_folder("Archive");
        let connector = FakeConnector::new(server.clone());
        let pool = ConnectionPool::new(pool_config(2), connector.clone());
        let account = test_account();

        let warm = pool.acquire("u1", &account).await.unwrap();
        let broken_id = warm.handle().id();
        drop(warm);

        server.fail_next("LIST", SessionError::Transient("broken pipe".into()));
        let mut used = Vec::new();
        let folders = pool
            .with_retry("u1", &account, |lease| {
                used.push(lease.handle().id());
                Box::pin(async move { lease.list_folders().await.map_err(Into::into) })
            })
            .await
            .unwrap();

        assert!(folders.iter().any(|folder| folder.name == "Archive"));
        assert_eq!(used.len(), 2);
        assert_eq!(used[0], broken_id);
        assert_ne!(used[1], broken_id);

        let lease = pool.acquire("u1", &account).await.unwrap();
        assert_ne!(lease.handle().id(), broken_id);
    }

    #[tokio::test]
    async fn non_transient_errors_are_not_retried() {
        let server = FakeServer::new();
        let connector = FakeConnector::new(server.clone());
        let pool = ConnectionPool::new(pool_config(2), connector);
        let account = test_account();

        server.fail_next("LIST", SessionError::Rejected("NO denied".into()));
        let mut attempts = 0;
        let result = pool
            .with_retry("u1", &account, |lease| {
                attempts += 1;
                Box::pin(async move { lease.list_folders().await.map_err(Into::into) })
            })
            .await;

        assert!(result.is_err());
        assert_eq!(attempts, 1);
    }

    #[tokio::test]
    async fn sweeper_closes_idle_workers_but_not_listener() {
        let server = FakeServer::new();
        let connector = FakeConnector::new(server.clone());
        let config = PoolConfig {
            idle_timeout_secs: 0,
            ..pool_config(2)
        };
        let pool = ConnectionPool::new(config, connector);
        let account = test_account();

        drop(pool.acquire("u1", &account).await.unwrap());
        pool.listener_session("u1", &account).await.unwrap();

        assert_eq!(pool.sweep_idle(), 1);
        let stats = pool.stats("u1");
        assert_eq!(stats.open_workers, 0);
        assert!(stats.has_listener);
    }

    #[tokio::test]
    async fn listener_session_is_single() {
        let connector = FakeConnector::new(FakeServer::new());
        let pool = ConnectionPool::new(pool_config(2), connector.clone());
        let account = test_account();

        let first = pool.listener_session("u1", &account).await.unwrap();
        let second = pool.listener_session("u1", &account).await.unwrap();
        assert_eq!(first.id(), second.id());
        assert_eq!(connector.connect_count(), 1);

        pool.drop_listener("u1");
        assert!(!pool.stats("u1").has_listener);
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquire() {
        let connector = FakeConnector::new(FakeServer::new());
        let pool = ConnectionPool::new(pool_config(2), connector);
        let account = test_account();

        drop(pool.acquire("u1", &account).await.unwrap());
        pool.close();

        assert!(matches!(
            pool.acquire("u1", &account).await.unwrap_err(),
            Error::PoolClosed
        ));
    }
}
