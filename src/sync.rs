//! Sync Engine: keeps the local cache of a folder fresh.
//!
//! Incremental sync fetches only messages above the stored cursor; full sync
//! refetches the folder and rebuilds thread membership. Cursors only move after
//! everything below them is persisted.

pub mod parse;
pub mod threading;

use crate::config::SyncConfig;
use crate::error::{Error, Result};
use crate::imap::{FetchedMessage, SessionError, ThreadGroup, sequence_set};
use crate::model::{Attachment, MailAccount, Message, RemoteKey, SyncCursor, Thread};
use crate::pool::{ConnectionPool, SessionGuard};
use crate::store::MailStore;

use self::parse::ParsedHeaders;

use chrono::Utc;

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncMode {
    Incremental,
    Full,
}

impl std::fmt::Display for SyncMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SyncMode::Incremental => f.write_str("incremental"),
            SyncMode::Full => f.write_str("full"),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SyncReport {
    pub folder: String,
    pub mode: SyncMode,
    /// Messages written to the cache by this sync.
    pub persisted: usize,
    pub cursor: u32,
}

/// What `persist_headers` managed to write.
#[derive(Debug, Default)]
struct Persisted {
    saved: BTreeSet<u32>,
    threads: BTreeSet<String>,
    /// Threads that lost a message because a different one took over its slot.
    displaced: BTreeSet<String>,
}

#[derive(Clone)]
pub struct SyncEngine {
    pool: Arc<ConnectionPool>,
    store: Arc<dyn MailStore>,
    config: SyncConfig,
}

impl std::fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SyncEngine")
            .field("config", &self.config)
            .finish()
    }
}

impl SyncEngine {
    pub fn new(pool: Arc<ConnectionPool>, store: Arc<dyn MailStore>, config: SyncConfig) -> Self {
        Self {
            pool,
            store,
            config,
        }
    }

    pub fn store(&self) -> &Arc<dyn MailStore> {
        &self.store
    }

    /// True when the folder was never synced or its cursor is older than the
    /// freshness window.
    pub async fn should_sync(&self, user: &str, folder: &str) -> Result<bool> {
        let cursor = self.store.get_sync_cursor(user, folder).await?;
        Ok(match cursor {
            None => true,
            Some(cursor) => Utc::now() - cursor.synced_at > self.config.freshness(),
        })
    }

    /// Sync `folder`: incremental when a cursor exists, full otherwise or when
    /// the incremental path fails.
    pub async fn sync_folder(
        &self,
        user: &str,
        account: &MailAccount,
        folder: &str,
    ) -> Result<SyncReport> {
        if let Some(cursor) = self.store.get_sync_cursor(user, folder).await? {
            match self.sync_incremental(user, account, folder, cursor).await {
                Ok(report) => return Ok(report),
                Err(error) => {
                    tracing::warn!(
                        user,
                        folder,
                        cursor = cursor.last_seq,
                        %error,
                        "incremental sync failed, falling back to full sync"
                    );
                }
            }
        }

        self.sync_full(user, account, folder).await
    }

    /// Non-fatal refresh: sync if stale, log failures, report whether a sync
    /// completed. Callers keep serving cached data either way.
    pub async fn refresh_folder(&self, user: &str, account: &MailAccount, folder: &str) -> bool {
        match self.should_sync(user, folder).await {
            Ok(false) => return false,
            Ok(true) => {}
            Err(error) => {
                tracing::warn!(user, folder, %error, "failed to read sync cursor");
                return false;
            }
        }

        match self.sync_folder(user, account, folder).await {
            Ok(report) => {
                tracing::debug!(
                    user,
                    folder,
                    mode = %report.mode,
                    persisted = report.persisted,
                    cursor = report.cursor,
                    "folder synced"
                );
                true
            }
            Err(error) => {
                tracing::warn!(user, folder, %error, "folder sync failed, serving cached data");
                false
            }
        }
    }

    async fn sync_incremental(
        &self,
        user: &str,
        account: &MailAccount,
        folder: &str,
        cursor: SyncCursor,
    ) -> Result<SyncReport> {
        let engine = self.clone();
        let owned_user = user.to_string();
        let owned_folder = folder.to_string();

        self.pool
            .with_retry(user, account, move |lease| {
                let engine = engine.clone();
                let user = owned_user.clone();
                let folder = owned_folder.clone();
                Box::pin(async move { engine.incremental_on(lease, &user, &folder, cursor).await })
            })
            .await
    }

    async fn incremental_on(
        &self,
        session: &mut SessionGuard,
        user: &str,
        folder: &str,
        cursor: SyncCursor,
    ) -> Result<SyncReport> {
        let status = session.select_fresh(folder).await?;

        if status.exists < cursor.last_seq {
            return Err(Error::CursorInvalidated {
                folder: folder.to_string(),
                exists: status.exists,
                cursor: cursor.last_seq,
            });
        }

        if cursor.last_seq > 0 {
            self.confirm_cursor(session, user, folder, cursor.last_seq).await?;
        }

        let mut seqs = if status.exists == cursor.last_seq {
            Vec::new()
        } else {
            session
                .search(&format!("{}:*", cursor.last_seq + 1))
                .await?
        };
        seqs.retain(|seq| *seq > cursor.last_seq);

        if seqs.is_empty() {
            self.store
                .set_sync_cursor(user, folder, SyncCursor {
                    last_seq: cursor.last_seq,
                    synced_at: Utc::now(),
                })
                .await?;
            return Ok(SyncReport {
                folder: folder.to_string(),
                mode: SyncMode::Incremental,
                persisted: 0,
                cursor: cursor.last_seq,
            });
        }

        let fetched = self.fetch_headers(session, &seqs).await?;
        let persisted = self.persist_headers(user, folder, &fetched, None).await?;

        if seqs.iter().any(|seq| !persisted.saved.contains(seq)) {
            return Err(Error::PartialSync {
                folder: folder.to_string(),
                persisted: persisted.saved.len(),
                expected: seqs.len(),
            });
        }

        let advanced = seqs.iter().copied().max().unwrap_or(cursor.last_seq).max(cursor.last_seq);
        self.store
            .set_sync_cursor(user, folder, SyncCursor {
                last_seq: advanced,
                synced_at: Utc::now(),
            })
            .await?;

        tracing::info!(user, folder, new = seqs.len(), cursor = advanced, "incremental sync complete");

        Ok(SyncReport {
            folder: folder.to_string(),
            mode: SyncMode::Incremental,
            persisted: persisted.saved.len(),
            cursor: advanced,
        })
    }

    async fn sync_full(&self, user: &str, account: &MailAccount, folder: &str) -> Result<SyncReport> {
        let engine = self.clone();
        let owned_user = user.to_string();
        let owned_folder = folder.to_string();

        self.pool
            .with_retry(user, account, move |lease| {
                let engine = engine.clone();
                let user = owned_user.clone();
                let folder = owned_folder.clone();
                Box::pin(async move { engine.full_on(lease, &user, &folder).await })
            })
            .await
    }

    async fn full_on(
        &self,
        session: &mut SessionGuard,
        user: &str,
        folder: &str,
    ) -> Result<SyncReport> {
        let status = session.select_fresh(folder).await?;
        let capabilities = session.capabilities().await?;

        let seqs: Vec<u32> = (1..=status.exists).collect();
        let server_threads = if !seqs.is_empty() && capabilities.thread_references() {
            server_threads(session, folder).await?
        } else {
            None
        };

        let fetched = self.fetch_headers(session, &seqs).await?;
        let persisted = self
            .persist_headers(user, folder, &fetched, server_threads.as_deref())
            .await?;

        if persisted.saved.len() < seqs.len() {
            return Err(Error::PartialSync {
                folder: folder.to_string(),
                persisted: persisted.saved.len(),
                expected: seqs.len(),
            });
        }

        let dropped = self
            .store
            .delete_messages_above(user, folder, status.exists)
            .await?;
        for thread_id in &dropped {
            self.refresh_thread_summary(user, thread_id).await?;
        }

        self.store
            .set_sync_cursor(user, folder, SyncCursor {
                last_seq: status.exists,
                synced_at: Utc::now(),
            })
            .await?;

        tracing::info!(
            user,
            folder,
            messages = seqs.len(),
            threads = persisted.threads.len(),
            dropped_threads = dropped.len(),
            server_threading = server_threads.is_some(),
            "full sync complete"
        );

        Ok(SyncReport {
            folder: folder.to_string(),
            mode: SyncMode::Full,
            persisted: persisted.saved.len(),
            cursor: status.exists,
        })
    }

    /// The message cached at `last_seq` must still sit there on the server.
    /// Expunges followed by the same number of new arrivals keep the count
    /// unchanged but shift every sequence number.
    async fn confirm_cursor(
        &self,
        session: &mut SessionGuard,
        user: &str,
        folder: &str,
        last_seq: u32,
    ) -> Result<()> {
        let fetched = session.fetch_headers(&last_seq.to_string()).await?;
        let remote = fetched
            .iter()
            .find(|message| message.seq == last_seq)
            .and_then(|message| parse::parse_headers(&message.raw, folder, message.internal_date).ok())
            .map(|headers| headers.message_id);
        let cached = self
            .store
            .get_message_by_remote_key(user, &RemoteKey::new(folder, last_seq))
            .await?
            .map(|message| message.message_id);

        match (remote, cached) {
            (Some(remote), Some(cached)) if remote == cached => Ok(()),
            _ => Err(Error::CursorMoved {
                folder: folder.to_string(),
                cursor: last_seq,
            }),
        }
    }

    async fn fetch_headers(
        &self,
        session: &mut SessionGuard,
        seqs: &[u32],
    ) -> Result<Vec<FetchedMessage>> {
        let mut fetched = Vec::with_capacity(seqs.len());
        for chunk in seqs.chunks(self.config.header_batch_size) {
            fetched.extend(session.fetch_headers(&sequence_set(chunk)).await?);
        }
        Ok(fetched)
    }

    /// Parse, thread and save fetched headers. Individual parse or save
    /// failures are logged and left out of `saved`; the caller decides what that
    /// means for the cursor.
    async fn persist_headers(
        &self,
        user: &str,
        folder: &str,
        fetched: &[FetchedMessage],
        server_threads: Option<&[ThreadGroup]>,
    ) -> Result<Persisted> {
        let mut parsed: Vec<(&FetchedMessage, ParsedHeaders)> = Vec::with_capacity(fetched.len());
        for message in fetched {
            match parse::parse_headers(&message.raw, folder, message.internal_date) {
                Ok(headers) => parsed.push((message, headers)),
                Err(error) => {
                    tracing::warn!(user, folder, seq = message.seq, %error, "failed to parse message headers");
                }
            }
        }

        let lookup: Vec<String> = parsed
            .iter()
            .flat_map(|(_, headers)| {
                std::iter::once(headers.message_id.clone())
                    .chain(headers.parent_ids().map(str::to_string))
            })
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let known = self.store.find_thread_ids(user, &lookup).await?;

        let input: Vec<(u32, &ParsedHeaders)> = parsed
            .iter()
            .map(|(message, headers)| (message.seq, headers))
            .collect();
        let assigned = match server_threads {
            Some(groups) => threading::group_by_server(groups, &input, &known),
            None => threading::group_by_references(&input, &known),
        };

        let mut persisted = Persisted::default();
        for (fetched, headers) in &parsed {
            let existing = match self
                .store
                .get_message_by_remote_key(user, &RemoteKey::new(folder, fetched.seq))
                .await?
            {
                Some(previous) if previous.message_id == headers.message_id => Some(previous),
                Some(previous) => {
                    persisted.displaced.insert(previous.thread_id);
                    None
                }
                None => None,
            };

            let thread_id = match &existing {
                Some(existing) => existing.thread_id.clone(),
                None => assigned
                    .get(&fetched.seq)
                    .cloned()
                    .unwrap_or_else(|| headers.message_id.clone()),
            };

            let message = Message {
                user_id: user.to_string(),
                folder: folder.to_string(),
                seq: fetched.seq,
                uid: fetched.uid,
                message_id: headers.message_id.clone(),
                thread_id: thread_id.clone(),
                in_reply_to: headers.in_reply_to.clone(),
                references: headers.references.clone(),
                from: headers.from.clone(),
                to: headers.to.clone(),
                cc: headers.cc.clone(),
                subject: headers.subject.clone(),
                sent_at: headers.sent_at,
                flags: fetched.flags.clone(),
                body_text: existing.as_ref().and_then(|m| m.body_text.clone()),
                body_html: existing.as_ref().and_then(|m| m.body_html.clone()),
                body_synced: existing.as_ref().is_some_and(|m| m.body_synced),
            };

            // Re-saving a message with a cached body replaces its attachment rows.
            let attachments = if message.body_synced {
                let key = message.remote_key();
                self.store
                    .get_attachments_for_messages(user, std::slice::from_ref(&key))
                    .await?
                    .remove(&key)
                    .unwrap_or_default()
            } else {
                Vec::new()
            };

            match self.store.save_message(&message, &attachments).await {
                Ok(()) => {
                    persisted.saved.insert(fetched.seq);
                    persisted.threads.insert(thread_id);
                }
                Err(error) => {
                    tracing::warn!(user, folder, seq = fetched.seq, %error, "failed to save message");
                }
            }
        }

        for thread_id in persisted.threads.union(&persisted.displaced) {
            if let Err(error) = self.refresh_thread_summary(user, thread_id).await {
                tracing::warn!(user, thread_id, %error, "failed to update thread summary");
            }
        }

        Ok(persisted)
    }

    /// Recompute subject, count and latest time from the cached messages.
    /// A thread with no cached messages left is removed.
    async fn refresh_thread_summary(&self, user: &str, thread_id: &str) -> Result<()> {
        let messages = self.store.get_messages_for_thread(user, thread_id).await?;
        let Some(first) = messages.first() else {
            return self.store.delete_thread(user, thread_id).await;
        };
        let latest_at = messages
            .iter()
            .map(|message| message.sent_at)
            .max()
            .unwrap_or(first.sent_at);

        self.store
            .save_thread(&Thread {
                id: thread_id.to_string(),
                user_id: user.to_string(),
                subject: first.subject.clone(),
                message_count: messages.len() as u32,
                latest_at,
            })
            .await
    }

    /// Fetch and cache full bodies for a batch of messages. One FETCH per folder
    /// chunk, never one per message. Returns how many bodies were stored.
    pub async fn sync_full_messages(
        &self,
        user: &str,
        account: &MailAccount,
        keys: &[RemoteKey],
    ) -> Result<usize> {
        let mut pending: BTreeMap<String, Vec<u32>> = BTreeMap::new();
        for key in keys {
            let cached = self.store.get_message_by_remote_key(user, key).await?;
            if cached.as_ref().is_some_and(|message| message.body_synced) {
                continue;
            }
            pending.entry(key.folder.clone()).or_default().push(key.seq);
        }

        if pending.is_empty() {
            return Ok(0);
        }

        let engine = self.clone();
        let owned_user = user.to_string();
        self.pool
            .with_retry(user, account, move |lease| {
                let engine = engine.clone();
                let user = owned_user.clone();
                let pending = pending.clone();
                Box::pin(async move { engine.bodies_on(lease, &user, &pending).await })
            })
            .await
    }

    async fn bodies_on(
        &self,
        session: &mut SessionGuard,
        user: &str,
        pending: &BTreeMap<String, Vec<u32>>,
    ) -> Result<usize> {
        let mut stored = 0;
        for (folder, seqs) in pending {
            session.select(folder).await?;
            for chunk in seqs.chunks(self.config.body_batch_size) {
                let fetched = session.fetch_bodies(&sequence_set(chunk)).await?;
                for message in &fetched {
                    match self.store_body(user, folder, message).await {
                        Ok(()) => stored += 1,
                        Err(error) => {
                            tracing::warn!(user, folder, seq = message.seq, %error, "failed to store message body");
                        }
                    }
                }
            }
        }
        Ok(stored)
    }

    async fn store_body(&self, user: &str, folder: &str, fetched: &FetchedMessage) -> Result<()> {
        let body = parse::parse_body(&fetched.raw, self.config.max_body_bytes)?;
        let key = RemoteKey::new(folder, fetched.seq);

        let mut message = match self.store.get_message_by_remote_key(user, &key).await? {
            Some(message) => message,
            None => {
                let headers = parse::parse_headers(&fetched.raw, folder, fetched.internal_date)?;
                let lookup: Vec<String> = std::iter::once(headers.message_id.clone())
                    .chain(headers.parent_ids().map(str::to_string))
                    .collect();
                let known = self.store.find_thread_ids(user, &lookup).await?;
                let thread_id = threading::group_by_references(&[(fetched.seq, &headers)], &known)
                    .remove(&fetched.seq)
                    .unwrap_or_else(|| headers.message_id.clone());
                message_from_headers(user, folder, fetched, headers, thread_id)
            }
        };

        message.flags = fetched.flags.clone();
        message.body_text = body.text;
        message.body_html = body.html;
        message.body_synced = true;

        let attachments: Vec<Attachment> = body
            .attachments
            .into_iter()
            .map(|attachment| Attachment {
                folder: folder.to_string(),
                seq: fetched.seq,
                file_name: attachment.file_name,
                content_type: attachment.content_type,
                size: attachment.size,
                content_id: attachment.content_id,
                inline: attachment.inline,
            })
            .collect();

        self.store.save_message(&message, &attachments).await?;
        self.refresh_thread_summary(user, &message.thread_id).await
    }

    /// Single-message form of [`Self::sync_full_messages`]; returns the cached message.
    pub async fn sync_full_message(
        &self,
        user: &str,
        account: &MailAccount,
        key: &RemoteKey,
    ) -> Result<Option<Message>> {
        self.sync_full_messages(user, account, std::slice::from_ref(key))
            .await?;
        self.store.get_message_by_remote_key(user, key).await
    }

    /// Load a thread for display, filling any missing bodies in one batch.
    pub async fn thread_messages(
        &self,
        user: &str,
        account: &MailAccount,
        thread_id: &str,
    ) -> Result<(Vec<Message>, HashMap<RemoteKey, Vec<Attachment>>)> {
        let messages = self.store.get_messages_for_thread(user, thread_id).await?;
        let missing: Vec<RemoteKey> = messages
            .iter()
            .filter(|message| !message.body_synced)
            .map(Message::remote_key)
            .collect();

        let messages = if missing.is_empty() {
            messages
        } else {
            if let Err(error) = self.sync_full_messages(user, account, &missing).await {
                tracing::warn!(user, thread_id, %error, "failed to fetch message bodies, serving headers only");
            }
            self.store.get_messages_for_thread(user, thread_id).await?
        };

        let keys: Vec<RemoteKey> = messages.iter().map(Message::remote_key).collect();
        let attachments = self.store.get_attachments_for_messages(user, &keys).await?;
        Ok((messages, attachments))
    }
}

/// THREAD=REFERENCES over the folder, or `None` when the connection cannot do it.
async fn server_threads(
    session: &mut SessionGuard,
    folder: &str,
) -> Result<Option<Vec<ThreadGroup>>> {
    match session.thread_references("UTF-8 ALL").await {
        Ok(groups) => Ok(Some(groups)),
        Err(SessionError::Unsupported(extension)) => {
            tracing::debug!(folder, %extension, "server threading unavailable, grouping by references");
            Ok(None)
        }
        Err(error) if error.is_transient() => Err(error.into()),
        Err(error) => {
            tracing::debug!(folder, %error, "THREAD failed, grouping by references");
            Ok(None)
        }
    }
}

fn message_from_headers(
    user: &str,
    folder: &str,
    fetched: &FetchedMessage,
    headers: ParsedHeaders,
    thread_id: String,
) -> Message {
    Message {
        user_id: user.to_string(),
        folder: folder.to_string(),
        seq: fetched.seq,
        uid: fetched.uid,
        message_id: headers.message_id,
        thread_id,
        in_reply_to: headers.in_reply_to,
        references: headers.references,
        from: headers.from,
        to: headers.to,
        cc: headers.cc,
        subject: headers.subject,
        sent_at: headers.sent_at,
        flags: fetched.flags.clone(),
        body_text: None,
        body_html: None,
        body_synced: false,
    }
}
