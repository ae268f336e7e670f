//! SQLite-backed mail cache.

use super::MailStore;
use crate::error::Result;
use crate::model::{Attachment, Message, RemoteKey, SyncCursor, Thread};

use anyhow::Context as _;
use async_trait::async_trait;
use chrono::Utc;
use sqlx::sqlite::{SqlitePool, SqlitePoolOptions, SqliteRow};
use sqlx::Row;

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

pub struct SqliteStore {
    pool: SqlitePool,
}

impl std::fmt::Debug for SqliteStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SqliteStore")
            .field("pool", &"<SqlitePool>")
            .finish()
    }
}

impl SqliteStore {
    /// Open (creating if needed) the database at `url` and apply migrations.
    pub async fn connect(url: &str) -> Result<Arc<Self>> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(url)
            .await
            .with_context(|| format!("failed to open mail cache database {url}"))?;
        Self::from_pool(pool).await
    }

    /// A private in-memory database. The single connection never expires, so
    /// the data lives as long as the store.
    pub async fn in_memory() -> Result<Arc<Self>> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect("sqlite::memory:")
            .await
            .context("failed to open in-memory mail cache")?;
        Self::from_pool(pool).await
    }

    async fn from_pool(pool: SqlitePool) -> Result<Arc<Self>> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .context("failed to run mail cache migrations")?;
        Ok(Arc::new(Self { pool }))
    }
}

#[async_trait]
impl MailStore for SqliteStore {
    async fn get_sync_cursor(&self, user: &str, folder: &str) -> Result<Option<SyncCursor>> {
        let row = sqlx::query(
            "SELECT last_seq, synced_at FROM sync_cursors WHERE user_id = ? AND folder = ?",
        )
        .bind(user)
        .bind(folder)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load sync cursor for folder '{folder}'"))?;

        Ok(row.map(|row| SyncCursor {
            last_seq: row.try_get::<i64, _>("last_seq").unwrap_or(0).max(0) as u32,
            synced_at: row.try_get("synced_at").unwrap_or_else(|_| Utc::now()),
        }))
    }

    async fn set_sync_cursor(&self, user: &str, folder: &str, cursor: SyncCursor) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO sync_cursors (user_id, folder, last_seq, synced_at)
            VALUES (?, ?, ?, ?)
            ON CONFLICT(user_id, folder) DO UPDATE SET
                last_seq = excluded.last_seq,
                synced_at = excluded.synced_at
            "#,
        )
        .bind(user)
        .bind(folder)
        .bind(i64::from(cursor.last_seq))
        .bind(cursor.synced_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save sync cursor for folder '{folder}'"))?;

        Ok(())
    }

    async fn save_thread(&self, thread: &Thread) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO threads (user_id, id, subject, message_count, latest_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(user_id, id) DO UPDATE SET
                subject = excluded.subject,
                message_count = excluded.message_count,
                latest_at = excluded.latest_at
            "#,
        )
        .bind(&thread.user_id)
        .bind(&thread.id)
        .bind(&thread.subject)
        .bind(i64::from(thread.message_count))
        .bind(thread.latest_at)
        .execute(&self.pool)
        .await
        .with_context(|| format!("failed to save thread {}", thread.id))?;

        Ok(())
    }

    async fn get_thread(&self, user: &str, thread_id: &str) -> Result<Option<Thread>> {
        let row = sqlx::query(
            r#"
            SELECT user_id, id, subject, message_count, latest_at
            FROM threads
            WHERE user_id = ? AND id = ?
            "#,
        )
        .bind(user)
        .bind(thread_id)
        .fetch_optional(&self.pool)
        .await
        .with_context(|| format!("failed to load thread {thread_id}"))?;

        Ok(row.map(|row| Thread {
            id: row.try_get("id").unwrap_or_default(),
            user_id: row.try_get("user_id").unwrap_or_default(),
            subject: row.try_get("subject").unwrap_or_default(),
            message_count: row.try_get::<i64, _>("message_count").unwrap_or(0).max(0) as u32,
            latest_at: row.try_get("latest_at").unwrap_or_else(|_| Utc::now()),
        }))
    }

    async fn save_message(&self, message: &Message, attachments: &[Attachment]) -> Result<()> {
        let refs = serde_json::to_string(&message.references)
            .context("failed to encode message references")?;
        let flags = serde_json::to_string(&message.flags).context("failed to encode message flags")?;

        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin message transaction")?;

        // A different message now owns this slot; its attachments are not ours.
        sqlx::query(
            r#"
            DELETE FROM attachments
            WHERE user_id = ? AND folder = ? AND seq = ?
              AND EXISTS (
                  SELECT 1 FROM messages
                  WHERE user_id = ? AND folder = ? AND seq = ? AND message_id <> ?
              )
            "#,
        )
        .bind(&message.user_id)
        .bind(&message.folder)
        .bind(i64::from(message.seq))
        .bind(&message.user_id)
        .bind(&message.folder)
        .bind(i64::from(message.seq))
        .bind(&message.message_id)
        .execute(&mut *tx)
        .await
        .context("failed to clear replaced message attachments")?;

        sqlx::query(
            r#"
            INSERT INTO messages (user_id, folder, seq, uid, message_id, thread_id, in_reply_to,
                                  refs, from_addr, to_addr, cc_addr, subject, sent_at, flags,
                                  body_text, body_html, body_synced)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            ON CONFLICT(user_id, folder, seq) DO UPDATE SET
                uid = excluded.uid,
                message_id = excluded.message_id,
                thread_id = excluded.thread_id,
                in_reply_to = excluded.in_reply_to,
                refs = excluded.refs,
                from_addr = excluded.from_addr,
                to_addr = excluded.to_addr,
                cc_addr = excluded.cc_addr,
                subject = excluded.subject,
                sent_at = excluded.sent_at,
                flags = excluded.flags,
                body_text = excluded.body_text,
                body_html = excluded.body_html,
                body_synced = excluded.body_synced
            "#,
        )
        .bind(&message.user_id)
        .bind(&message.folder)
        .bind(i64::from(message.seq))
        .bind(message.uid.map(i64::from))
        .bind(&message.message_id)
        .bind(&message.thread_id)
        .bind(&message.in_reply_to)
        .bind(refs)
        .bind(&message.from)
        .bind(&message.to)
        .bind(&message.cc)
        .bind(&message.subject)
        .bind(message.sent_at)
        .bind(flags)
        .bind(&message.body_text)
        .bind(&message.body_html)
        .bind(message.body_synced)
        .execute(&mut *tx)
        .await
        .with_context(|| {
            format!(
                "failed to save message {}:{}",
                message.folder, message.seq
            )
        })?;

        if message.body_synced {
            sqlx::query("DELETE FROM attachments WHERE user_id = ? AND folder = ? AND seq = ?")
                .bind(&message.user_id)
                .bind(&message.folder)
                .bind(i64::from(message.seq))
                .execute(&mut *tx)
                .await
                .context("failed to clear message attachments")?;

            for (position, attachment) in attachments.iter().enumerate() {
                sqlx::query(
                    r#"
                    INSERT INTO attachments (user_id, folder, seq, position, file_name,
                                             content_type, size, content_id, inline)
                    VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
                    "#,
                )
                .bind(&message.user_id)
                .bind(&message.folder)
                .bind(i64::from(message.seq))
                .bind(position as i64)
                .bind(&attachment.file_name)
                .bind(&attachment.content_type)
                .bind(attachment.size as i64)
                .bind(&attachment.content_id)
                .bind(attachment.inline)
                .execute(&mut *tx)
                .await
                .with_context(|| format!("failed to save attachment {}", attachment.file_name))?;
            }
        }

        tx.commit()
            .await
            .context("failed to commit message transaction")?;

        Ok(())
    }

    async fn delete_messages_above(&self, user: &str, folder: &str, max_seq: u32) -> Result<Vec<String>> {
        let mut tx = self
            .pool
            .begin()
            .await
            .context("failed to begin message cleanup transaction")?;

        let rows = sqlx::query(
            "SELECT DISTINCT thread_id FROM messages WHERE user_id = ? AND folder = ? AND seq > ?",
        )
        .bind(user)
        .bind(folder)
        .bind(i64::from(max_seq))
        .fetch_all(&mut *tx)
        .await
        .with_context(|| format!("failed to find stale messages in folder '{folder}'"))?;

        sqlx::query("DELETE FROM attachments WHERE user_id = ? AND folder = ? AND seq > ?")
            .bind(user)
            .bind(folder)
            .bind(i64::from(max_seq))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to delete stale attachments in folder '{folder}'"))?;

        sqlx::query("DELETE FROM messages WHERE user_id = ? AND folder = ? AND seq > ?")
            .bind(user)
            .bind(folder)
            .bind(i64::from(max_seq))
            .execute(&mut *tx)
            .await
            .with_context(|| format!("failed to delete stale messages in folder '{folder}'"))?;

        tx.commit()
            .await
            .context("failed to commit message cleanup transaction")?;

        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<String, _>("thread_id").ok())
            .collect())
    }

    async fn delete_thread(&self, user: &str, thread_id: &str) -> Result<()> {
        sqlx::query("DELETE FROM threads WHERE user_id = ? AND id = ?")
            .bind(user)
            .bind(thread_id)
            .execute(&self.pool)
            .await
            .with_context(|| format!("failed to delete thread {thread_id}"))?;

        Ok(())
    }

    async fn get_messages_for_thread(&self, user: &str, thread_id: &str) -> Result<Vec<Message>> {
        let rows = sqlx::query(
            r#"
            SELECT * FROM messages
            WHERE user_id = ? AND thread_id = ?
            ORDER BY sent_at ASC, folder ASC, seq ASC
            "#,
        )
        .bind(user)
        .bind(thread_id)
        .fetch_all(&self.pool)
        .await
        .with_context(|| format!("failed to load messages for thread {thread_id}"))?;

        Ok(rows.iter().map(row_to_message).collect())
    }

    async fn get_message_by_remote_key(&self, user: &str, key: &RemoteKey) -> Result<Option<Message>> {
        let row = sqlx::query("SELECT * FROM messages WHERE user_id = ? AND folder = ? AND seq = ?")
            .bind(user)
            .bind(&key.folder)
            .bind(i64::from(key.seq))
            .fetch_optional(&self.pool)
            .await
            .with_context(|| format!("failed to load message {}:{}", key.folder, key.seq))?;

        Ok(row.as_ref().map(row_to_message))
    }

    async fn get_attachments_for_messages(
        &self,
        user: &str,
        keys: &[RemoteKey],
    ) -> Result<HashMap<RemoteKey, Vec<Attachment>>> {
        let mut by_folder: BTreeMap<&str, Vec<u32>> = BTreeMap::new();
        for key in keys {
            by_folder.entry(key.folder.as_str()).or_default().push(key.seq);
        }

        let mut result: HashMap<RemoteKey, Vec<Attachment>> = HashMap::new();
        for (folder, seqs) in by_folder {
            let placeholders = vec!["?"; seqs.len()].join(", ");
            let sql = format!(
                "SELECT * FROM attachments WHERE user_id = ? AND folder = ? AND seq IN ({placeholders}) \
                 ORDER BY seq ASC, position ASC"
            );

            let mut query = sqlx::query(&sql).bind(user).bind(folder);
            for seq in &seqs {
                query = query.bind(i64::from(*seq));
            }

            let rows = query
                .fetch_all(&self.pool)
                .await
                .with_context(|| format!("failed to load attachments in folder '{folder}'"))?;

            for row in &rows {
                let attachment = row_to_attachment(row);
                result
                    .entry(attachment.remote_key())
                    .or_default()
                    .push(attachment);
            }
        }

        Ok(result)
    }

    async fn find_thread_ids(
        &self,
        user: &str,
        message_ids: &[String],
    ) -> Result<HashMap<String, String>> {
        let mut result = HashMap::new();
        for chunk in message_ids.chunks(200) {
            let placeholders = vec!["?"; chunk.len()].join(", ");
            let sql = format!(
                "SELECT message_id, thread_id FROM messages WHERE user_id = ? AND message_id IN ({placeholders})"
            );

            let mut query = sqlx::query(&sql).bind(user);
            for message_id in chunk {
                query = query.bind(message_id);
            }

            let rows = query
                .fetch_all(&self.pool)
                .await
                .context("failed to resolve existing thread ids")?;

            for row in &rows {
                let message_id: String = row.try_get("message_id").unwrap_or_default();
                let thread_id: String = row.try_get("thread_id").unwrap_or_default();
                if !message_id.is_empty() && !thread_id.is_empty() {
                    result.insert(message_id, thread_id);
                }
            }
        }

        Ok(result)
    }
}

fn row_to_message(row: &SqliteRow) -> Message {
    let refs: String = row.try_get("refs").unwrap_or_default();
    let flags: String = row.try_get("flags").unwrap_or_default();

    Message {
        user_id: row.try_get("user_id").unwrap_or_default(),
        folder: row.try_get("folder").unwrap_or_default(),
        seq: row.try_get::<i64, _>("seq").unwrap_or(0).max(0) as u32,
        uid: row
            .try_get::<Option<i64>, _>("uid")
            .ok()
            .flatten()
            .map(|uid| uid.max(0) as u32),
        message_id: row.try_get("message_id").unwrap_or_default(),
        thread_id: row.try_get("thread_id").unwrap_or_default(),
        in_reply_to: row.try_get("in_reply_to").ok().flatten(),
        references: serde_json::from_str(&refs).unwrap_or_default(),
        from: row.try_get("from_addr").unwrap_or_default(),
        to: row.try_get("to_addr").unwrap_or_default(),
        cc: row.try_get("cc_addr").unwrap_or_default(),
        subject: row.try_get("subject").unwrap_or_default(),
        sent_at: row.try_get("sent_at").unwrap_or_else(|_| Utc::now()),
        flags: serde_json::from_str(&flags).unwrap_or_default(),
        body_text: row.try_get("body_text").ok().flatten(),
        body_html: row.try_get("body_html").ok().flatten(),
        body_synced: row.try_get::<bool, _>("body_synced").unwrap_or(false),
    }
}

fn row_to_attachment(row: &SqliteRow) -> Attachment {
    Attachment {
        folder: row.try_get("folder").unwrap_or_default(),
        seq: row.try_get::<i64, _>("seq").unwrap_or(0).max(0) as u32,
        file_name: row.try_get("file_name").unwrap_or_default(),
        content_type: row.try_get("content_type").unwrap_or_default(),
        size: row.try_get::<i64, _>("size").unwrap_or(0).max(0) as u64,
        content_id: row.try_get("content_id").ok().flatten(),
        inline: row.try_get::<bool, _>("inline").unwrap_or(false),
    }
}
