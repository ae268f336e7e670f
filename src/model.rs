//! Cached mail domain types shared by the sync engine, search and storage.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Already-decrypted remote-mailbox credentials for one user.
#[derive(Clone, PartialEq, Eq)]
pub struct MailAccount {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub password: String,
    pub use_tls: bool,
}

impl std::fmt::Debug for MailAccount {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MailAccount")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("username", &"[REDACTED]")
            .field("password", &"[REDACTED]")
            .field("use_tls", &self.use_tls)
            .finish()
    }
}

/// Addresses a message on the remote server: folder plus sequence number.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RemoteKey {
    pub folder: String,
    pub seq: u32,
}

impl RemoteKey {
    pub fn new(folder: impl Into<String>, seq: u32) -> Self {
        Self {
            folder: folder.into(),
            seq,
        }
    }
}

/// A conversation keyed by its root message identifier. The id never changes
/// once assigned.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Thread {
    pub id: String,
    pub user_id: String,
    pub subject: String,
    pub message_count: u32,
    pub latest_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Message {
    pub user_id: String,
    pub folder: String,
    pub seq: u32,
    pub uid: Option<u32>,
    /// Normalized `Message-ID` without angle brackets, or a synthetic digest.
    pub message_id: String,
    pub thread_id: String,
    pub in_reply_to: Option<String>,
    pub references: Vec<String>,
    pub from: String,
    pub to: String,
    pub cc: String,
    pub subject: String,
    pub sent_at: DateTime<Utc>,
    pub flags: Vec<String>,
    pub body_text: Option<String>,
    pub body_html: Option<String>,
    pub body_synced: bool,
}

impl Message {
    pub fn remote_key(&self) -> RemoteKey {
        RemoteKey::new(self.folder.clone(), self.seq)
    }

    pub fn is_unread(&self) -> bool {
        !self.flags.iter().any(|flag| flag.eq_ignore_ascii_case("\\Seen"))
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub folder: String,
    pub seq: u32,
    pub file_name: String,
    pub content_type: String,
    pub size: u64,
    pub content_id: Option<String>,
    pub inline: bool,
}

impl Attachment {
    pub fn remote_key(&self) -> RemoteKey {
        RemoteKey::new(self.folder.clone(), self.seq)
    }
}

/// Highest observed sequence number for a (user, folder) and when it was recorded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncCursor {
    pub last_seq: u32,
    pub synced_at: DateTime<Utc>,
}

/// Folder classification from the SPECIAL-USE extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FolderRole {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Junk,
    Archive,
    All,
    Flagged,
}

impl FolderRole {
    /// Map a SPECIAL-USE attribute such as `\Sent` to a role.
    pub fn from_attribute(attribute: &str) -> Option<Self> {
        let name = attribute.trim().trim_start_matches('\\').to_ascii_lowercase();
        match name.as_str() {
            "sent" => Some(Self::Sent),
            "drafts" => Some(Self::Drafts),
            "trash" => Some(Self::Trash),
            "junk" => Some(Self::Junk),
            "archive" => Some(Self::Archive),
            "all" => Some(Self::All),
            "flagged" => Some(Self::Flagged),
            _ => None,
        }
    }
}

impl std::fmt::Display for FolderRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Self::Inbox => "inbox",
            Self::Sent => "sent",
            Self::Drafts => "drafts",
            Self::Trash => "trash",
            Self::Junk => "junk",
            Self::Archive => "archive",
            Self::All => "all",
            Self::Flagged => "flagged",
        };
        f.write_str(name)
    }
}

#[cfg(test)]
mod tests {
    use super::{FolderRole, MailAccount};

    #[test]
    fn folder_roles_parse_special_use_attributes() {
        assert_eq!(FolderRole::from_attribute("\\Sent"), Some(FolderRole::Sent));
        assert_eq!(FolderRole::from_attribute("\\Junk"), Some(FolderRole::Junk));
        assert_eq!(FolderRole::from_attribute("\\HasNoChildren"), None);
    }

    #[test]
    fn account_debug_redacts_credentials() {
        let account = MailAccount {
            host: "imap.example.com".into(),
            port: 993,
            username: "alice".into(),
            password: "hunter2".into(),
            use_tls: true,
        };
        let rendered = format!("{account:?}");
        assert!(!rendered.contains("hunter2"));
        assert!(!rendered.contains("alice"));
    }
}
