//! IMAP seam: the narrow command surface the pool, sync engine and listener use,
//! plus the protocol value types and typed failures that cross it.
//!
//! `client` provides the async-imap backed implementation. Tests plug in a
//! scripted fake through the same traits.

pub mod client;

pub use client::TlsConnector;

use crate::model::{FolderRole, MailAccount};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio_util::sync::CancellationToken;

use std::collections::HashSet;
use std::time::Duration;

/// Establishing a connection failed before any command ran.
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConnectError {
    /// Usually a wrong hostname or a firewalled port.
    #[error("timed out connecting to mail server '{host}'")]
    Timeout { host: String },

    #[error("failed to connect to mail server '{host}': {reason}")]
    Failed { host: String, reason: String },

    #[error("mail server '{host}' rejected the login: {reason}")]
    Auth { host: String, reason: String },
}

/// A command on an established session failed.
#[derive(Debug, Clone, thiserror::Error)]
pub enum SessionError {
    /// The transport broke (broken pipe, reset, end of stream). The handle is dead.
    #[error("mail connection lost: {0}")]
    Transient(String),

    /// The server answered NO or BAD.
    #[error("mail server rejected command: {0}")]
    Rejected(String),

    /// The server or the client implementation lacks the named extension.
    #[error("{0} is not supported by this mail connection")]
    Unsupported(String),

    #[error("mail protocol error: {0}")]
    Protocol(String),
}

/// Untyped error text that still means the transport is gone.
const TRANSIENT_MARKERS: &[&str] = &[
    "broken pipe",
    "connection reset",
    "connection aborted",
    "connection lost",
    "connection closed",
    "unexpected eof",
    "unexpected end of file",
    "end of stream",
    "eof",
    "not connected",
];

impl SessionError {
    pub fn is_transient(&self) -> bool {
        matches!(self, SessionError::Transient(_))
    }

    /// Classify an IO failure by kind.
    pub fn from_io(error: &std::io::Error) -> Self {
        use std::io::ErrorKind;

        match error.kind() {
            ErrorKind::BrokenPipe
            | ErrorKind::ConnectionReset
            | ErrorKind::ConnectionAborted
            | ErrorKind::NotConnected
            | ErrorKind::UnexpectedEof
            | ErrorKind::TimedOut => SessionError::Transient(error.to_string()),
            _ => Self::from_message(error.to_string()),
        }
    }

    /// Fallback classification for errors that only carry text.
    pub fn from_message(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_ascii_lowercase();
        if TRANSIENT_MARKERS
            .iter()
            .any(|marker| lowered.contains(marker))
        {
            SessionError::Transient(message)
        } else {
            SessionError::Protocol(message)
        }
    }
}

/// Result of selecting a folder.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct MailboxStatus {
    pub exists: u32,
    pub uid_validity: Option<u32>,
    pub uid_next: Option<u32>,
}

/// Server capability set, compared case-insensitively.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capabilities(HashSet<String>);

impl Capabilities {
    pub fn new<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self(
            names
                .into_iter()
                .map(|name| name.as_ref().trim().to_ascii_uppercase())
                .filter(|name| !name.is_empty())
                .collect(),
        )
    }

    pub fn has(&self, name: &str) -> bool {
        self.0.contains(&name.to_ascii_uppercase())
    }

    pub fn idle(&self) -> bool {
        self.has("IDLE")
    }

    pub fn thread_references(&self) -> bool {
        self.has("THREAD=REFERENCES")
    }

    pub fn special_use(&self) -> bool {
        self.has("SPECIAL-USE")
    }
}

/// One entry of a LIST response.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteFolder {
    pub name: String,
    pub delimiter: Option<String>,
    /// Raw attributes as sent by the server, e.g. `\Noselect` or `\Sent`.
    pub attributes: Vec<String>,
}

impl RemoteFolder {
    pub fn is_selectable(&self) -> bool {
        !self.attributes.iter().any(|attribute| {
            attribute.eq_ignore_ascii_case("\\Noselect")
                || attribute.eq_ignore_ascii_case("\\NonExistent")
        })
    }

    pub fn role(&self) -> Option<FolderRole> {
        if self.name.eq_ignore_ascii_case("INBOX") {
            return Some(FolderRole::Inbox);
        }
        self.attributes
            .iter()
            .find_map(|attribute| FolderRole::from_attribute(attribute))
    }
}

/// One message from a FETCH response. `raw` holds either the header block or the
/// full RFC 822 message depending on the command.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FetchedMessage {
    pub seq: u32,
    pub uid: Option<u32>,
    pub flags: Vec<String>,
    pub internal_date: Option<DateTime<Utc>>,
    pub raw: Vec<u8>,
}

/// Sequence numbers of one server-computed conversation, in tree order.
pub type ThreadGroup = Vec<u32>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlagOp {
    Add,
    Remove,
}

impl FlagOp {
    pub(crate) fn store_item(self) -> &'static str {
        match self {
            FlagOp::Add => "+FLAGS.SILENT",
            FlagOp::Remove => "-FLAGS.SILENT",
        }
    }
}

/// How an IDLE wait ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleOutcome {
    /// The server pushed an untagged update.
    Changed,
    /// The refresh interval elapsed without a push.
    Timeout,
    Cancelled,
}

/// One authenticated IMAP connection. Not safe for concurrent use; callers
/// serialize access through a session handle.
#[async_trait]
pub trait MailConnection: Send {
    async fn select(&mut self, folder: &str) -> Result<MailboxStatus, SessionError>;

    async fn noop(&mut self) -> Result<(), SessionError>;

    async fn capabilities(&mut self) -> Result<Capabilities, SessionError>;

    async fn list_folders(&mut self) -> Result<Vec<RemoteFolder>, SessionError>;

    /// SEARCH in the selected folder; returns sequence numbers.
    async fn search(&mut self, criteria: &str) -> Result<Vec<u32>, SessionError>;

    async fn fetch_headers(&mut self, seq_set: &str) -> Result<Vec<FetchedMessage>, SessionError>;

    async fn fetch_bodies(&mut self, seq_set: &str) -> Result<Vec<FetchedMessage>, SessionError>;

    /// THREAD=REFERENCES over the selected folder.
    async fn thread_references(&mut self, criteria: &str) -> Result<Vec<ThreadGroup>, SessionError> {
        let _ = criteria;
        Err(SessionError::Unsupported("THREAD".to_string()))
    }

    async fn store_flags(
        &mut self,
        seq_set: &str,
        op: FlagOp,
        flags: &[String],
    ) -> Result<(), SessionError>;

    async fn copy(&mut self, seq_set: &str, destination: &str) -> Result<(), SessionError>;

    async fn append(
        &mut self,
        folder: &str,
        flags: &[String],
        content: &[u8],
    ) -> Result<(), SessionError>;

    /// Wait in IDLE on the selected folder until a push, the timeout, or cancellation.
    async fn idle(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<IdleOutcome, SessionError>;

    async fn logout(&mut self) -> Result<(), SessionError>;
}

/// Opens authenticated connections.
#[async_trait]
pub trait Connector: Send + Sync {
    async fn connect(&self, account: &MailAccount) -> Result<Box<dyn MailConnection>, ConnectError>;
}

/// Render sequence numbers as a compact IMAP sequence set, e.g. `1:3,7`.
pub fn sequence_set(seqs: &[u32]) -> String {
    let mut sorted = seqs.to_vec();
    sorted.sort_unstable();
    sorted.dedup();

    let mut parts = Vec::new();
    let mut iter = sorted.into_iter().peekable();
    while let Some(start) = iter.next() {
        let mut end = start;
        while let Some(&next) = iter.peek() {
            if next == end + 1 {
                end = next;
                iter.next();
            } else {
                break;
            }
        }
        if start == end {
            parts.push(start.to_string());
        } else {
            parts.push(format!("{start}:{end}"));
        }
    }
    parts.join(",")
}

/// Quote a value for an IMAP command argument.
pub fn quote(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}
