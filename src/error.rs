//! Crate-wide error type and classification helpers.

use crate::hub::HubError;
use crate::imap::{ConnectError, SessionError};
use crate::search::QueryError;

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Establishing a connection to the remote mail store failed.
    #[error(transparent)]
    Connect(#[from] ConnectError),

    /// A command on an established session failed.
    #[error(transparent)]
    Session(#[from] SessionError),

    /// The remote server lacks an extension this operation requires.
    #[error("mail server does not support the {0} extension")]
    MissingCapability(String),

    /// Malformed client input, e.g. a bad search filter.
    #[error(transparent)]
    Query(#[from] QueryError),

    #[error(transparent)]
    Hub(#[from] HubError),

    /// Every worker slot for the user stayed busy past the admission timeout.
    #[error("all mail connections for user '{user}' are busy")]
    PoolExhausted { user: String },

    #[error("connection pool is shut down")]
    PoolClosed,

    /// No remote-mailbox credentials are known for the user.
    #[error("no mail account configured for user '{0}'")]
    UnknownAccount(String),

    /// The message count shrank below the sync cursor, so sequence numbers were renumbered.
    #[error("sync cursor for folder '{folder}' is ahead of the mailbox ({exists} < {cursor})")]
    CursorInvalidated {
        folder: String,
        exists: u32,
        cursor: u32,
    },

    /// The message at the cursor is no longer the one cached there; messages
    /// were expunged and replaced by new arrivals.
    #[error("message at sync cursor {cursor} in folder '{folder}' changed since the last sync")]
    CursorMoved { folder: String, cursor: u32 },

    /// Some fetched messages could not be persisted; the cursor was left in place.
    #[error("persisted {persisted} of {expected} messages in folder '{folder}'")]
    PartialSync {
        folder: String,
        persisted: usize,
        expected: usize,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl Error {
    /// True for broken-pipe style failures that warrant evicting the handle and retrying once.
    pub fn is_transient(&self) -> bool {
        matches!(self, Error::Session(error) if error.is_transient())
    }

    /// True for faults caused by the caller's input. These are never retried and never
    /// logged as system errors.
    pub fn is_client_error(&self) -> bool {
        matches!(self, Error::Query(_) | Error::UnknownAccount(_))
    }

    /// True when a missing server extension caused the failure.
    pub fn is_capability_error(&self) -> bool {
        matches!(
            self,
            Error::MissingCapability(_) | Error::Session(SessionError::Unsupported(_))
        )
    }
}
