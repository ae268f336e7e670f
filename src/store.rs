//! Storage interface for cached threads, messages and sync cursors.

pub mod sqlite;

pub use sqlite::SqliteStore;

use crate::error::Result;
use crate::model::{Attachment, Message, RemoteKey, SyncCursor, Thread};

use async_trait::async_trait;

use std::collections::HashMap;

/// The narrow cache interface the sync and search engines consume.
#[async_trait]
pub trait MailStore: Send + Sync {
    async fn get_sync_cursor(&self, user: &str, folder: &str) -> Result<Option<SyncCursor>>;

    async fn set_sync_cursor(&self, user: &str, folder: &str, cursor: SyncCursor) -> Result<()>;

    async fn save_thread(&self, thread: &Thread) -> Result<()>;

    async fn get_thread(&self, user: &str, thread_id: &str) -> Result<Option<Thread>>;

    /// Insert or replace by (user, folder, seq). Attachments replace any previous set.
    async fn save_message(&self, message: &Message, attachments: &[Attachment]) -> Result<()>;

    /// Drop cached messages (and their attachments) of `folder` with a sequence
    /// number above `max_seq`. Returns the thread ids those messages belonged to.
    async fn delete_messages_above(&self, user: &str, folder: &str, max_seq: u32) -> Result<Vec<String>>;

    /// Remove a thread summary. Used once its last message is gone.
    async fn delete_thread(&self, user: &str, thread_id: &str) -> Result<()>;

    /// Messages of a thread, oldest first.
    async fn get_messages_for_thread(&self, user: &str, thread_id: &str) -> Result<Vec<Message>>;

    async fn get_message_by_remote_key(&self, user: &str, key: &RemoteKey) -> Result<Option<Message>>;

    async fn get_attachments_for_messages(
        &self,
        user: &str,
        keys: &[RemoteKey],
    ) -> Result<HashMap<RemoteKey, Vec<Attachment>>>;

    /// Thread ids already assigned to any of the given message identifiers.
    async fn find_thread_ids(
        &self,
        user: &str,
        message_ids: &[String],
    ) -> Result<HashMap<String, String>>;
}
