//! Folder and message commands issued on behalf of a user: listing, role
//! discovery, flag changes, copy and append. Every command runs through the
//! pool's evict-and-retry-once policy.

use crate::error::{Error, Result};
use crate::imap::{FlagOp, RemoteFolder, sequence_set};
use crate::model::{FolderRole, MailAccount, RemoteKey};
use crate::pool::{ConnectionPool, SessionGuard};
use crate::store::MailStore;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

const SPECIAL_USE: &str = "SPECIAL-USE";

#[derive(Clone)]
pub struct MailboxOps {
    pool: Arc<ConnectionPool>,
    store: Arc<dyn MailStore>,
}

impl std::fmt::Debug for MailboxOps {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailboxOps").finish_non_exhaustive()
    }
}

impl MailboxOps {
    pub fn new(pool: Arc<ConnectionPool>, store: Arc<dyn MailStore>) -> Self {
        Self { pool, store }
    }

    /// Selectable folders, sorted by name.
    pub async fn list_folders(&self, user: &str, account: &MailAccount) -> Result<Vec<RemoteFolder>> {
        let mut folders = self
            .pool
            .with_retry(user, account, |lease| {
                Box::pin(async move { lease.list_folders().await.map_err(Into::into) })
            })
            .await?;
        folders.retain(RemoteFolder::is_selectable);
        folders.sort_by(|left, right| left.name.cmp(&right.name));
        Ok(folders)
    }

    /// Map each role to its folder. Needs the SPECIAL-USE extension; without it
    /// this fails with [`Error::MissingCapability`] instead of guessing by name.
    pub async fn folder_roles(
        &self,
        user: &str,
        account: &MailAccount,
    ) -> Result<HashMap<FolderRole, String>> {
        let folders = self
            .pool
            .with_retry(user, account, |lease| {
                Box::pin(async move { special_use_folders(lease).await })
            })
            .await?;

        let mut roles = HashMap::new();
        for folder in folders.iter().filter(|folder| folder.is_selectable()) {
            if let Some(role) = folder.role() {
                roles.entry(role).or_insert_with(|| folder.name.clone());
            }
        }
        Ok(roles)
    }

    /// Add or remove flags on the given messages and mirror the change into
    /// the cache. Returns how many cached messages were updated.
    pub async fn set_flags(
        &self,
        user: &str,
        account: &MailAccount,
        keys: &[RemoteKey],
        op: FlagOp,
        flags: &[String],
    ) -> Result<usize> {
        if keys.is_empty() || flags.is_empty() {
            return Ok(0);
        }

        let by_folder = group_by_folder(keys);
        let flags_owned = flags.to_vec();
        self.pool
            .with_retry(user, account, move |lease| {
                let by_folder = by_folder.clone();
                let flags = flags_owned.clone();
                Box::pin(async move { store_flags_on(lease, &by_folder, op, &flags).await })
            })
            .await?;

        self.mirror_flags(user, keys, op, flags).await
    }

    async fn mirror_flags(
        &self,
        user: &str,
        keys: &[RemoteKey],
        op: FlagOp,
        flags: &[String],
    ) -> Result<usize> {
        let mut attachments = self.store.get_attachments_for_messages(user, keys).await?;
        let mut updated = 0;

        for key in keys {
            let Some(mut message) = self.store.get_message_by_remote_key(user, key).await? else {
                continue;
            };
            for flag in flags {
                let present = message
                    .flags
                    .iter()
                    .any(|existing| existing.eq_ignore_ascii_case(flag));
                match op {
                    FlagOp::Add if !present => message.flags.push(flag.clone()),
                    FlagOp::Remove => message
                        .flags
                        .retain(|existing| !existing.eq_ignore_ascii_case(flag)),
                    FlagOp::Add => {}
                }
            }

            let kept = attachments.remove(key).unwrap_or_default();
            match self.store.save_message(&message, &kept).await {
                Ok(()) => updated += 1,
                Err(error) => {
                    tracing::warn!(user, folder = %key.folder, seq = key.seq, %error, "failed to mirror flag change");
                }
            }
        }

        Ok(updated)
    }

    /// Copy messages into `destination`. Returns how many were copied.
    pub async fn copy_messages(
        &self,
        user: &str,
        account: &MailAccount,
        keys: &[RemoteKey],
        destination: &str,
    ) -> Result<usize> {
        if keys.is_empty() {
            return Ok(0);
        }

        let by_folder = group_by_folder(keys);
        let destination = destination.to_string();
        let copied = self
            .pool
            .with_retry(user, account, move |lease| {
                let by_folder = by_folder.clone();
                let destination = destination.clone();
                Box::pin(async move { copy_on(lease, &by_folder, &destination).await })
            })
            .await?;

        tracing::debug!(user, copied, "copied messages");
        Ok(copied)
    }

    /// Store a complete RFC 822 message in `folder`, e.g. a sent copy or a draft.
    pub async fn append_message(
        &self,
        user: &str,
        account: &MailAccount,
        folder: &str,
        flags: &[String],
        content: &[u8],
    ) -> Result<()> {
        let folder = folder.to_string();
        let flags = flags.to_vec();
        let content = content.to_vec();
        self.pool
            .with_retry(user, account, move |lease| {
                let folder = folder.clone();
                let flags = flags.clone();
                let content = content.clone();
                Box::pin(async move {
                    lease
                        .append(&folder, &flags, &content)
                        .await
                        .map_err(Into::into)
                })
            })
            .await
    }
}

async fn special_use_folders(session: &mut SessionGuard) -> Result<Vec<RemoteFolder>> {
    if !session.capabilities().await?.special_use() {
        return Err(Error::MissingCapability(SPECIAL_USE.to_string()));
    }
    Ok(session.list_folders().await?)
}

async fn store_flags_on(
    session: &mut SessionGuard,
    by_folder: &BTreeMap<String, Vec<u32>>,
    op: FlagOp,
    flags: &[String],
) -> Result<()> {
    for (folder, seqs) in by_folder {
        session.select(folder).await?;
        session.store_flags(&sequence_set(seqs), op, flags).await?;
    }
    Ok(())
}

async fn copy_on(
    session: &mut SessionGuard,
    by_folder: &BTreeMap<String, Vec<u32>>,
    destination: &str,
) -> Result<usize> {
    let mut copied = 0;
    for (folder, seqs) in by_folder {
        session.select(folder).await?;
        session.copy(&sequence_set(seqs), destination).await?;
        copied += seqs.len();
    }
    Ok(copied)
}

fn group_by_folder(keys: &[RemoteKey]) -> BTreeMap<String, Vec<u32>> {
    let mut grouped: BTreeMap<String, Vec<u32>> = BTreeMap::new();
    for key in keys {
        grouped.entry(key.folder.clone()).or_default().push(key.seq);
    }
    grouped
}

#[cfg(test)]
mod tests {
    use super::MailboxOps;
    use crate::config::PoolConfig;
    use crate::error::Error;
    use crate::imap::FlagOp;
    use crate::model::{FolderRole, RemoteKey};
    use crate::pool::ConnectionPool;
    use crate::store::{MailStore, SqliteStore};
    use crate::testing::{FakeConnector, FakeServer, sample_message, test_account};

    use std::sync::Arc;

    async fn ops_for(server: &FakeServer) -> (MailboxOps, Arc<SqliteStore>) {
        let store = SqliteStore::in_memory().await.unwrap();
        let pool = ConnectionPool::new(PoolConfig::default(), FakeConnector::new(server.clone()));
        (MailboxOps::new(pool, store.clone()), store)
    }

    #[tokio::test]
    async fn noselect_folders_are_hidden() {
        let server = FakeServer::new();
        server.add_folder("Archive");
        server.add_folder_with_attributes("[Gmail]", &["\\Noselect"]);
        let (mailbox, _) = ops_for(&server).await;

        let folders = mailbox.list_folders("u1", &test_account()).await.unwrap();
        let names: Vec<&str> = folders.iter().map(|folder| folder.name.as_str()).collect();
        assert_eq!(names, vec!["Archive", "INBOX"]);
    }

    #[tokio::test]
    async fn folder_roles_need_special_use() {
        let server = FakeServer::new();
        server.add_folder_with_attributes("Sent Items", &["\\Sent"]);
        let (mailbox, _) = ops_for(&server).await;
        let account = test_account();

        let error = mailbox.folder_roles("u1", &account).await.unwrap_err();
        assert!(matches!(error, Error::MissingCapability(ref name) if name == "SPECIAL-USE"));
        assert!(error.is_capability_error());

        // Capabilities are cached per connection, so use a fresh pool.
        server.set_special_use(true);
        let (fresh, _) = ops_for(&server).await;
        let roles = fresh.folder_roles("u1", &account).await.unwrap();
        assert_eq!(roles[&FolderRole::Sent], "Sent Items");
        assert_eq!(roles[&FolderRole::Inbox], "INBOX");
    }

    #[tokio::test]
    async fn flag_changes_reach_server_and_cache() {
        let server = FakeServer::new();
        server.add_messages("INBOX", 2);
        let (mailbox, store) = ops_for(&server).await;
        store
            .save_message(&sample_message("u1", "INBOX", 1, "m1@example.com", "t1"), &[])
            .await
            .unwrap();

        let seen = vec!["\\Seen".to_string()];
        let keys = [RemoteKey::new("INBOX", 1), RemoteKey::new("INBOX", 2)];
        let updated = mailbox
            .set_flags("u1", &test_account(), &keys, FlagOp::Add, &seen)
            .await
            .unwrap();

        assert_eq!(updated, 1);
        assert_eq!(server.flags("INBOX", 1), seen);
        assert_eq!(server.flags("INBOX", 2), seen);
        let cached = store
            .get_message_by_remote_key("u1", &keys[0])
            .await
            .unwrap()
            .unwrap();
        assert!(!cached.is_unread());

        mailbox
            .set_flags("u1", &test_account(), &keys[..1], FlagOp::Remove, &seen)
            .await
            .unwrap();
        assert!(server.flags("INBOX", 1).is_empty());
    }

    #[tokio::test]
    async fn copy_and_append() {
        let server = FakeServer::new();
        server.add_folder("Archive");
        server.add_messages("INBOX", 3);
        let (mailbox, _) = ops_for(&server).await;
        let account = test_account();

        let keys = [RemoteKey::new("INBOX", 1), RemoteKey::new("INBOX", 3)];
        let copied = mailbox
            .copy_messages("u1", &account, &keys, "Archive")
            .await
            .unwrap();
        assert_eq!(copied, 2);
        assert_eq!(server.message_count("Archive"), 2);

        mailbox
            .append_message("u1", &account, "Archive", &["\\Seen".to_string()], b"Subject: x\r\n\r\nbody")
            .await
            .unwrap();
        assert_eq!(server.message_count("Archive"), 3);
        assert_eq!(server.flags("Archive", 3), vec!["\\Seen".to_string()]);
    }
}
