//! async-imap backed `MailConnection` and the TLS `Connector`.

use super::{
    Capabilities, ConnectError, Connector, FetchedMessage, FlagOp, IdleOutcome, MailConnection,
    MailboxStatus, RemoteFolder, SessionError, ThreadGroup,
};
use crate::model::MailAccount;

use async_imap::extensions::idle::IdleResponse;
use async_imap::types::{Fetch, Flag, Name};
use async_trait::async_trait;
use chrono::Utc;
use futures::TryStreamExt as _;
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;

use std::time::Duration;

const HEADER_QUERY: &str = "(UID FLAGS INTERNALDATE BODY.PEEK[HEADER])";
const BODY_QUERY: &str = "(UID FLAGS INTERNALDATE BODY.PEEK[])";

/// Extensions probed after login. async-imap only answers membership queries.
const KNOWN_CAPABILITIES: &[&str] = &[
    "IMAP4rev1",
    "IDLE",
    "THREAD=REFERENCES",
    "THREAD=ORDEREDSUBJECT",
    "SPECIAL-USE",
    "CONDSTORE",
    "UIDPLUS",
    "MOVE",
    "ENABLE",
];

trait ImapStream:
    tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + std::fmt::Debug
{
}

impl<T> ImapStream for T where
    T: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin + Send + std::fmt::Debug
{
}

type BoxedStream = Box<dyn ImapStream>;
type ImapSession = async_imap::Session<BoxedStream>;

/// Opens TLS (or plain TCP for local test servers) IMAP connections.
#[derive(Debug, Clone)]
pub struct TlsConnector {
    connect_timeout: Duration,
}

impl TlsConnector {
    pub fn new(connect_timeout: Duration) -> Self {
        Self { connect_timeout }
    }

    async fn open(&self, account: &MailAccount) -> Result<ImapSession, ConnectError> {
        let host = account.host.clone();
        let failed = |reason: String| ConnectError::Failed {
            host: host.clone(),
            reason,
        };

        let tcp = TcpStream::connect((account.host.as_str(), account.port))
            .await
            .map_err(|error| failed(error.to_string()))?;

        let stream: BoxedStream = if account.use_tls {
            let tls = async_native_tls::TlsConnector::new();
            let tls_stream = tls
                .connect(account.host.as_str(), tcp)
                .await
                .map_err(|error| failed(format!("TLS handshake failed: {error}")))?;
            Box::new(tls_stream)
        } else {
            Box::new(tcp)
        };

        let mut client = async_imap::Client::new(stream);
        let _greeting = client.read_response().await;

        let session = client
            .login(account.username.as_str(), account.password.as_str())
            .await
            .map_err(|(error, _client)| ConnectError::Auth {
                host: account.host.clone(),
                reason: error.to_string(),
            })?;

        Ok(session)
    }
}

#[async_trait]
impl Connector for TlsConnector {
    async fn connect(&self, account: &MailAccount) -> Result<Box<dyn MailConnection>, ConnectError> {
        let session = tokio::time::timeout(self.connect_timeout, self.open(account))
            .await
            .map_err(|_| ConnectError::Timeout {
                host: account.host.clone(),
            })??;

        tracing::debug!(host = %account.host, port = account.port, "opened IMAP connection");

        Ok(Box::new(ImapConnection {
            session: Some(session),
        }))
    }
}

/// The session is taken out while IDLE owns it; if IDLE fails the connection is gone.
pub struct ImapConnection {
    session: Option<ImapSession>,
}

impl ImapConnection {
    fn session(&mut self) -> Result<&mut ImapSession, SessionError> {
        self.session
            .as_mut()
            .ok_or_else(|| SessionError::Transient("connection lost during IDLE".to_string()))
    }

    async fn fetch(&mut self, seq_set: &str, query: &str) -> Result<Vec<FetchedMessage>, SessionError> {
        if seq_set.is_empty() {
            return Ok(Vec::new());
        }

        let session = self.session()?;
        let fetches: Vec<Fetch> = session
            .fetch(seq_set, query)
            .await
            .map_err(session_error)?
            .try_collect()
            .await
            .map_err(session_error)?;

        Ok(fetches.iter().map(fetched_message).collect())
    }
}

#[async_trait]
impl MailConnection for ImapConnection {
    async fn select(&mut self, folder: &str) -> Result<MailboxStatus, SessionError> {
        let mailbox = self.session()?.select(folder).await.map_err(session_error)?;
        Ok(MailboxStatus {
            exists: mailbox.exists,
            uid_validity: mailbox.uid_validity,
            uid_next: mailbox.uid_next,
        })
    }

    async fn noop(&mut self) -> Result<(), SessionError> {
        self.session()?.noop().await.map_err(session_error)
    }

    async fn capabilities(&mut self) -> Result<Capabilities, SessionError> {
        let capabilities = self.session()?.capabilities().await.map_err(session_error)?;
        Ok(Capabilities::new(
            KNOWN_CAPABILITIES
                .iter()
                .filter(|name| capabilities.has_str(**name)),
        ))
    }

    async fn list_folders(&mut self) -> Result<Vec<RemoteFolder>, SessionError> {
        let names: Vec<Name> = self
            .session()?
            .list(Some(""), Some("*"))
            .await
            .map_err(session_error)?
            .try_collect()
            .await
            .map_err(session_error)?;

        Ok(names
            .iter()
            .map(|name| RemoteFolder {
                name: name.name().to_string(),
                delimiter: name.delimiter().map(str::to_string),
                attributes: name.attributes().iter().map(name_attribute).collect(),
            })
            .collect())
    }

    async fn search(&mut self, criteria: &str) -> Result<Vec<u32>, SessionError> {
        let found = self.session()?.search(criteria).await.map_err(session_error)?;
        let mut seqs: Vec<u32> = found.into_iter().collect();
        seqs.sort_unstable();
        Ok(seqs)
    }

    async fn fetch_headers(&mut self, seq_set: &str) -> Result<Vec<FetchedMessage>, SessionError> {
        self.fetch(seq_set, HEADER_QUERY).await
    }

    async fn fetch_bodies(&mut self, seq_set: &str) -> Result<Vec<FetchedMessage>, SessionError> {
        self.fetch(seq_set, BODY_QUERY).await
    }

    async fn thread_references(&mut self, criteria: &str) -> Result<Vec<ThreadGroup>, SessionError> {
        let response = self
            .session()?
            .run_command_and_read_response(format!("THREAD REFERENCES {criteria}"))
            .await
            .map_err(session_error)?;
        parse_thread_response(&response)
    }

    async fn store_flags(
        &mut self,
        seq_set: &str,
        op: FlagOp,
        flags: &[String],
    ) -> Result<(), SessionError> {
        if seq_set.is_empty() || flags.is_empty() {
            return Ok(());
        }

        let query = format!("{} ({})", op.store_item(), flags.join(" "));
        let _updates: Vec<Fetch> = self
            .session()?
            .store(seq_set, query)
            .await
            .map_err(session_error)?
            .try_collect()
            .await
            .map_err(session_error)?;
        Ok(())
    }

    async fn copy(&mut self, seq_set: &str, destination: &str) -> Result<(), SessionError> {
        self.session()?
            .copy(seq_set, destination)
            .await
            .map_err(session_error)
    }

    async fn append(
        &mut self,
        folder: &str,
        flags: &[String],
        content: &[u8],
    ) -> Result<(), SessionError> {
        let flags = (!flags.is_empty()).then(|| format!("({})", flags.join(" ")));
        self.session()?
            .append(folder, flags.as_deref(), None, content)
            .await
            .map_err(session_error)
    }

    async fn idle(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<IdleOutcome, SessionError> {
        let session = self
            .session
            .take()
            .ok_or_else(|| SessionError::Transient("connection lost during IDLE".to_string()))?;

        let mut handle = session.idle();
        handle.init().await.map_err(session_error)?;

        let outcome = {
            let (wait, stop) = handle.wait_with_timeout(timeout);
            tokio::pin!(wait);

            tokio::select! {
                response = &mut wait => response.map(|response| match response {
                    IdleResponse::NewData(_) => IdleOutcome::Changed,
                    IdleResponse::Timeout => IdleOutcome::Timeout,
                    IdleResponse::ManualInterrupt => IdleOutcome::Cancelled,
                }),
                _ = cancel.cancelled() => {
                    drop(stop);
                    wait.await.map(|_| IdleOutcome::Cancelled)
                }
            }
        };

        let outcome = outcome.map_err(session_error)?;
        let session = handle.done().await.map_err(session_error)?;
        self.session = Some(session);

        Ok(outcome)
    }

    async fn logout(&mut self) -> Result<(), SessionError> {
        match self.session.take() {
            Some(mut session) => session.logout().await.map_err(session_error),
            None => Ok(()),
        }
    }
}

fn session_error(error: async_imap::error::Error) -> SessionError {
    use async_imap::error::Error as ImapError;

    match error {
        ImapError::Io(error) => SessionError::from_io(&error),
        ImapError::ConnectionLost => SessionError::Transient("connection lost".to_string()),
        ImapError::No(message) => SessionError::Rejected(format!("NO {message}")),
        ImapError::Bad(message) => SessionError::Rejected(format!("BAD {message}")),
        other => SessionError::from_message(other.to_string()),
    }
}

fn fetched_message(fetch: &Fetch) -> FetchedMessage {
    let raw = fetch
        .body()
        .or_else(|| fetch.header())
        .map(<[u8]>::to_vec)
        .unwrap_or_default();

    FetchedMessage {
        seq: fetch.message,
        uid: fetch.uid,
        flags: fetch.flags().map(|flag| flag_name(&flag)).collect(),
        internal_date: fetch
            .internal_date()
            .map(|date| date.with_timezone(&Utc)),
        raw,
    }
}

fn flag_name(flag: &Flag<'_>) -> String {
    match flag {
        Flag::Seen => "\\Seen".to_string(),
        Flag::Answered => "\\Answered".to_string(),
        Flag::Flagged => "\\Flagged".to_string(),
        Flag::Deleted => "\\Deleted".to_string(),
        Flag::Draft => "\\Draft".to_string(),
        Flag::Recent => "\\Recent".to_string(),
        Flag::MayCreate => "\\*".to_string(),
        Flag::Custom(name) => name.to_string(),
    }
}

/// Flatten the untagged `* THREAD` data into one group per top-level tree.
/// Nested branches keep their depth-first order, e.g.
/// `(3 6 (4 23)(44 7 96))` becomes `[3, 6, 4, 23, 44, 7, 96]`.
fn parse_thread_response(response: &[u8]) -> Result<Vec<ThreadGroup>, SessionError> {
    let text = String::from_utf8_lossy(response);
    let mut groups = Vec::new();

    for line in text.lines() {
        let Some(data) = line.trim_start().strip_prefix("* THREAD") else {
            continue;
        };

        let mut depth = 0usize;
        let mut group = ThreadGroup::new();
        let mut number = String::new();

        for ch in data.chars().chain(std::iter::once(' ')) {
            if ch.is_ascii_digit() {
                number.push(ch);
                continue;
            }
            if !number.is_empty() {
                if depth == 0 {
                    return Err(SessionError::Protocol(format!(
                        "message number outside a THREAD list: {line}"
                    )));
                }
                let seq = number
                    .parse::<u32>()
                    .map_err(|error| SessionError::Protocol(format!("bad THREAD member {number}: {error}")))?;
                group.push(seq);
                number.clear();
            }
            match ch {
                '(' => depth += 1,
                ')' => {
                    depth = depth.checked_sub(1).ok_or_else(|| {
                        SessionError::Protocol(format!("unbalanced THREAD response: {line}"))
                    })?;
                    if depth == 0 && !group.is_empty() {
                        groups.push(std::mem::take(&mut group));
                    }
                }
                ' ' | '\t' | '\r' => {}
                other => {
                    return Err(SessionError::Protocol(format!(
                        "unexpected '{other}' in THREAD response"
                    )));
                }
            }
        }

        if depth != 0 {
            return Err(SessionError::Protocol(format!(
                "unbalanced THREAD response: {line}"
            )));
        }
    }

    Ok(groups)
}

/// Render a LIST attribute the way the server spelled it, e.g. `\Noselect`.
/// The attribute enum differs across imap-proto releases, so go through `Debug`.
fn name_attribute(attribute: &impl std::fmt::Debug) -> String {
    let rendered = format!("{attribute:?}");
    match rendered.split_once('(') {
        Some((_, inner)) => inner
            .trim_end_matches(')')
            .trim_matches('"')
            .replace("\\\\", "\\"),
        None => format!("\\{rendered}"),
    }
}
