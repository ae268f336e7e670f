//! The `Mailhub` service object. Built once at startup and shared by reference;
//! it owns every per-user registry, so nothing here is global state.

use crate::config::{AccountConfig, Config};
use crate::error::{Error, Result};
use crate::hub::{ClientSink, NotificationClient, NotificationHub};
use crate::imap::{Connector, FlagOp, RemoteFolder, TlsConnector};
use crate::listener::PushListeners;
use crate::mailbox::MailboxOps;
use crate::model::{Attachment, FolderRole, MailAccount, Message, RemoteKey};
use crate::pool::ConnectionPool;
use crate::search::{SearchEngine, SearchPage};
use crate::store::MailStore;
use crate::sync::{SyncEngine, SyncReport};

use async_trait::async_trait;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

/// Looks up remote-mailbox credentials for an authenticated user.
#[async_trait]
pub trait AccountResolver: Send + Sync {
    async fn resolve(&self, user: &str) -> Result<MailAccount>;
}

/// Accounts listed in the config file.
#[derive(Debug, Default)]
pub struct StaticAccounts {
    accounts: HashMap<String, MailAccount>,
}

impl StaticAccounts {
    pub fn new(accounts: impl IntoIterator<Item = (String, MailAccount)>) -> Self {
        Self {
            accounts: accounts.into_iter().collect(),
        }
    }

    pub fn from_config(accounts: &[AccountConfig]) -> Self {
        Self::new(
            accounts
                .iter()
                .map(|account| (account.user.trim().to_string(), account.to_account())),
        )
    }
}

#[async_trait]
impl AccountResolver for StaticAccounts {
    async fn resolve(&self, user: &str) -> Result<MailAccount> {
        self.accounts
            .get(user)
            .cloned()
            .ok_or_else(|| Error::UnknownAccount(user.to_string()))
    }
}

pub struct Mailhub {
    pool: Arc<ConnectionPool>,
    sync: SyncEngine,
    search: SearchEngine,
    mailbox: MailboxOps,
    listeners: Arc<PushListeners>,
    hub: Arc<NotificationHub>,
    accounts: Arc<dyn AccountResolver>,
    shutdown: CancellationToken,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl std::fmt::Debug for Mailhub {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mailhub")
            .field("pool", &self.pool)
            .field("listeners", &self.listeners)
            .field("hub", &self.hub)
            .finish_non_exhaustive()
    }
}

impl Mailhub {
    pub fn new(
        config: &Config,
        connector: Arc<dyn Connector>,
        store: Arc<dyn MailStore>,
        accounts: Arc<dyn AccountResolver>,
    ) -> Arc<Self> {
        let pool = ConnectionPool::new(config.pool.clone(), connector);
        let sync = SyncEngine::new(pool.clone(), store.clone(), config.sync.clone());
        let search = SearchEngine::new(pool.clone(), store.clone(), config.search.clone());
        let mailbox = MailboxOps::new(pool.clone(), store);
        let hub = NotificationHub::new(config.hub.clone());
        let listeners = PushListeners::new(
            pool.clone(),
            sync.clone(),
            hub.clone(),
            config.listener.clone(),
        );

        Arc::new(Self {
            pool,
            sync,
            search,
            mailbox,
            listeners,
            hub,
            accounts,
            shutdown: CancellationToken::new(),
            sweeper: Mutex::new(None),
        })
    }

    /// Production wiring: TLS connector and the accounts from the config file.
    pub fn from_config(config: &Config, store: Arc<dyn MailStore>) -> Arc<Self> {
        let connector = Arc::new(TlsConnector::new(config.pool.connect_timeout()));
        let accounts = Arc::new(StaticAccounts::from_config(&config.accounts));
        Self::new(config, connector, store, accounts)
    }

    /// Start the idle-connection sweeper. Must run inside the tokio runtime.
    pub fn start(&self) {
        let mut sweeper = self.sweeper.lock().unwrap_or_else(PoisonError::into_inner);
        if sweeper.is_none() {
            *sweeper = Some(self.pool.spawn_sweeper(self.shutdown.child_token()));
        }
    }

    pub fn pool(&self) -> &Arc<ConnectionPool> {
        &self.pool
    }

    pub fn sync_engine(&self) -> &SyncEngine {
        &self.sync
    }

    pub fn hub(&self) -> &Arc<NotificationHub> {
        &self.hub
    }

    pub fn listeners(&self) -> &Arc<PushListeners> {
        &self.listeners
    }

    pub async fn account(&self, user: &str) -> Result<MailAccount> {
        self.accounts.resolve(user).await
    }

    /// Register a client socket and make sure the user's listener runs.
    pub async fn attach_client(
        &self,
        user: &str,
        sink: Box<dyn ClientSink>,
    ) -> Result<Arc<NotificationClient>> {
        let account = self.account(user).await?;
        let client = self.hub.register(user, sink)?;
        if self.listeners.start(user, &account) {
            tracing::debug!(user, "started push listener for first client");
        }
        Ok(client)
    }

    /// Unregister a client; the last one out stops the user's listener.
    /// Returns how many clients the user still has.
    pub async fn detach_client(&self, client: &NotificationClient) -> usize {
        let user = client.user().clone();
        let remaining = self.hub.unregister(client);
        if remaining > 0 {
            return remaining;
        }

        self.listeners.stop(&user).await;

        // A client may have attached while the listener was stopping.
        if self.hub.active_connections(&user) > 0
            && let Ok(account) = self.account(&user).await
        {
            self.listeners.start(&user, &account);
        }
        self.hub.active_connections(&user)
    }

    /// Sync `folder` if its cache is stale. Sync failures are logged, not returned.
    pub async fn refresh_folder(&self, user: &str, folder: &str) -> Result<bool> {
        let account = self.account(user).await?;
        Ok(self.sync.refresh_folder(user, &account, folder).await)
    }

    /// Sync `folder` now regardless of freshness.
    pub async fn sync_folder(&self, user: &str, folder: &str) -> Result<SyncReport> {
        let account = self.account(user).await?;
        self.sync.sync_folder(user, &account, folder).await
    }

    /// A thread's messages with bodies filled in one batch, plus attachments.
    pub async fn thread(
        &self,
        user: &str,
        thread_id: &str,
    ) -> Result<(Vec<Message>, HashMap<RemoteKey, Vec<Attachment>>)> {
        let account = self.account(user).await?;
        self.sync.thread_messages(user, &account, thread_id).await
    }

    pub async fn message(&self, user: &str, key: &RemoteKey) -> Result<Option<Message>> {
        let account = self.account(user).await?;
        self.sync.sync_full_message(user, &account, key).await
    }

    pub async fn search(
        &self,
        user: &str,
        query: &str,
        page: usize,
        limit: Option<usize>,
    ) -> Result<SearchPage> {
        let account = self.account(user).await?;
        self.search.search(user, &account, query, page, limit).await
    }

    pub async fn list_folders(&self, user: &str) -> Result<Vec<RemoteFolder>> {
        let account = self.account(user).await?;
        self.mailbox.list_folders(user, &account).await
    }

    pub async fn folder_roles(&self, user: &str) -> Result<HashMap<FolderRole, String>> {
        let account = self.account(user).await?;
        self.mailbox.folder_roles(user, &account).await
    }

    pub async fn set_flags(
        &self,
        user: &str,
        keys: &[RemoteKey],
        op: FlagOp,
        flags: &[String],
    ) -> Result<usize> {
        let account = self.account(user).await?;
        self.mailbox.set_flags(user, &account, keys, op, flags).await
    }

    pub async fn copy_messages(
        &self,
        user: &str,
        keys: &[RemoteKey],
        destination: &str,
    ) -> Result<usize> {
        let account = self.account(user).await?;
        self.mailbox
            .copy_messages(user, &account, keys, destination)
            .await
    }

    pub async fn append_message(
        &self,
        user: &str,
        folder: &str,
        flags: &[String],
        content: &[u8],
    ) -> Result<()> {
        let account = self.account(user).await?;
        self.mailbox
            .append_message(user, &account, folder, flags, content)
            .await
    }

    /// Stop listeners, close client sockets and every mail session.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        let sweeper = self
            .sweeper
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(sweeper) = sweeper {
            let _ = sweeper.await;
        }
        self.listeners.shutdown().await;
        self.hub.close();
        self.pool.close();
        tracing::info!("mailhub shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::{Mailhub, StaticAccounts};
    use crate::config::{Config, HubConfig};
    use crate::error::Error;
    use crate::hub::ClientSink;
    use crate::store::SqliteStore;
    use crate::testing::{FakeConnector, FakeServer, test_account};

    use async_trait::async_trait;

    use std::sync::Arc;
    use std::time::Duration;

    struct NullSink;

    #[async_trait]
    impl ClientSink for NullSink {
        async fn send(&mut self, _payload: &str) -> anyhow::Result<()> {
            Ok(())
        }
    }

    async fn mailhub(server: &FakeServer) -> Arc<Mailhub> {
        let config = Config {
            hub: HubConfig {
                max_clients_per_user: 2,
                ..HubConfig::default()
            },
            ..Config::default()
        };
        let store = SqliteStore::in_memory().await.unwrap();
        let accounts = StaticAccounts::new([("u1".to_string(), test_account())]);
        Mailhub::new(
            &config,
            FakeConnector::new(server.clone()),
            store,
            Arc::new(accounts),
        )
    }

    #[tokio::test]
    async fn last_client_out_stops_the_listener() {
        let server = FakeServer::new();
        let mailhub = mailhub(&server).await;

        let first = mailhub.attach_client("u1", Box::new(NullSink)).await.unwrap();
        let second = mailhub.attach_client("u1", Box::new(NullSink)).await.unwrap();
        assert!(mailhub.listeners().is_running("u1"));
        server.wait_until_idling(1).await;

        assert_eq!(mailhub.detach_client(&first).await, 1);
        assert!(mailhub.listeners().is_running("u1"));

        assert_eq!(mailhub.detach_client(&second).await, 0);
        assert!(!mailhub.listeners().is_running("u1"));
        assert_eq!(server.idling(), 0);
    }

    #[tokio::test]
    async fn rejected_clients_do_not_count() {
        let server = FakeServer::new();
        let mailhub = mailhub(&server).await;

        mailhub.attach_client("u1", Box::new(NullSink)).await.unwrap();
        mailhub.attach_client("u1", Box::new(NullSink)).await.unwrap();
        let error = mailhub.attach_client("u1", Box::new(NullSink)).await.unwrap_err();
        assert!(matches!(error, Error::Hub(_)));
        assert_eq!(mailhub.hub().active_connections("u1"), 2);

        mailhub.shutdown().await;
    }

    #[tokio::test]
    async fn unknown_users_are_rejected_before_registration() {
        let server = FakeServer::new();
        let mailhub = mailhub(&server).await;

        let error = mailhub
            .attach_client("stranger", Box::new(NullSink))
            .await
            .unwrap_err();
        assert!(matches!(error, Error::UnknownAccount(_)));
        assert_eq!(mailhub.hub().active_connections("stranger"), 0);
        assert!(!mailhub.listeners().is_running("stranger"));
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let server = FakeServer::new();
        server.add_messages("INBOX", 1);
        let mailhub = mailhub(&server).await;
        mailhub.start();

        let client = mailhub.attach_client("u1", Box::new(NullSink)).await.unwrap();
        server.wait_until_idling(1).await;
        assert!(mailhub.refresh_folder("u1", "INBOX").await.unwrap());

        tokio::time::timeout(Duration::from_secs(2), mailhub.shutdown())
            .await
            .unwrap();
        assert!(client.is_closed());
        assert_eq!(mailhub.listeners().running(), 0);
        assert!(matches!(
            mailhub.list_folders("u1").await.unwrap_err(),
            Error::PoolClosed
        ));
    }
}
