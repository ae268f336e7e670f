//! Scripted in-memory IMAP server for unit tests.

use crate::imap::{
    Capabilities, ConnectError, Connector, FetchedMessage, FlagOp, IdleOutcome, MailConnection,
    MailboxStatus, RemoteFolder, SessionError, ThreadGroup,
};
use crate::model::{MailAccount, Message};

use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub(crate) fn test_account() -> MailAccount {
    MailAccount {
        host: "imap.test".into(),
        port: 993,
        username: "alice@example.com".into(),
        password: "secret".into(),
        use_tls: true,
    }
}

/// RFC 822 message with threading headers; `refs` is root first, the last entry
/// doubles as `In-Reply-To`.
pub(crate) fn raw_message(message_id: &str, refs: &[&str], subject: &str, minutes: i64) -> Vec<u8> {
    let base = Utc.with_ymd_and_hms(2025, 7, 1, 10, 0, 0).single().unwrap_or_default();
    let date: DateTime<Utc> = base + ChronoDuration::minutes(minutes);

    let mut raw = format!(
        "Message-ID: <{message_id}>\r\nFrom: Sender <sender@example.com>\r\nTo: alice@example.com\r\nSubject: {subject}\r\nDate: {}\r\n",
        date.to_rfc2822()
    );
    if !refs.is_empty() {
        let references: Vec<String> = refs.iter().map(|id| format!("<{id}>")).collect();
        raw.push_str(&format!("References: {}\r\n", references.join(" ")));
        if let Some(parent) = refs.last() {
            raw.push_str(&format!("In-Reply-To: <{parent}>\r\n"));
        }
    }
    raw.push_str("MIME-Version: 1.0\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n");
    raw.push_str(&format!("Body of {message_id}\r\n"));
    raw.into_bytes()
}

pub(crate) fn sample_message(
    user: &str,
    folder: &str,
    seq: u32,
    message_id: &str,
    thread_id: &str,
) -> Message {
    Message {
        user_id: user.to_string(),
        folder: folder.to_string(),
        seq,
        uid: Some(seq),
        message_id: message_id.to_string(),
        thread_id: thread_id.to_string(),
        in_reply_to: None,
        references: vec!["root@example.com".to_string()],
        from: "sender@example.com".to_string(),
        to: "alice@example.com".to_string(),
        cc: String::new(),
        subject: format!("Subject {seq}"),
        sent_at: Utc::now(),
        flags: Vec::new(),
        body_text: None,
        body_html: None,
        body_synced: false,
    }
}

#[derive(Debug, Clone)]
struct FakeMessage {
    raw: Vec<u8>,
    flags: Vec<String>,
}

#[derive(Debug, Clone, Default)]
struct FakeFolder {
    attributes: Vec<String>,
    messages: Vec<FakeMessage>,
}

#[derive(Default)]
struct ServerState {
    folders: BTreeMap<String, FakeFolder>,
    commands: HashMap<String, usize>,
    failures: HashMap<String, VecDeque<SessionError>>,
    fetched: Vec<(String, u32)>,
    searches: Vec<String>,
    thread_groups: Option<Vec<ThreadGroup>>,
    idle_supported: bool,
    special_use: bool,
    command_delay: Duration,
    next_message: u32,
}

#[derive(Default)]
struct ServerShared {
    state: Mutex<ServerState>,
    push: Notify,
    idling: AtomicUsize,
    max_concurrent: AtomicUsize,
}

/// Shared mailbox state behind every fake connection.
#[derive(Clone)]
pub(crate) struct FakeServer {
    shared: Arc<ServerShared>,
}

impl FakeServer {
    pub(crate) fn new() -> Self {
        let server = Self {
            shared: Arc::new(ServerShared::default()),
        };
        {
            let mut state = server.state();
            state.idle_supported = true;
            state.folders.insert("INBOX".to_string(), FakeFolder::default());
        }
        server
    }

    fn state(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }

    pub(crate) fn connection(&self) -> Box<dyn MailConnection> {
        Box::new(FakeConnection {
            server: self.clone(),
            selected: None,
            active: Arc::new(AtomicUsize::new(0)),
            live: None,
        })
    }

    pub(crate) fn add_folder(&self, name: &str) {
        self.state().folders.entry(name.to_string()).or_default();
    }

    pub(crate) fn add_folder_with_attributes(&self, name: &str, attributes: &[&str]) {
        self.state().folders.insert(
            name.to_string(),
            FakeFolder {
                attributes: attributes.iter().map(|a| a.to_string()).collect(),
                messages: Vec::new(),
            },
        );
    }

    /// Append `count` unrelated messages with unique ids.
    pub(crate) fn add_messages(&self, folder: &str, count: u32) {
        for _ in 0..count {
            let number = {
                let mut state = self.state();
                state.next_message += 1;
                state.next_message
            };
            let raw = raw_message(
                &format!("msg-{number}@example.com"),
                &[],
                &format!("Message {number}"),
                i64::from(number),
            );
            self.append_raw(folder, raw);
        }
    }

    pub(crate) fn append_raw(&self, folder: &str, raw: Vec<u8>) {
        self.state()
            .folders
            .entry(folder.to_string())
            .or_default()
            .messages
            .push(FakeMessage {
                raw,
                flags: Vec::new(),
            });
    }

    /// Remove the first `count` messages; later sequence numbers shift down.
    pub(crate) fn expunge_first(&self, folder: &str, count: usize) {
        if let Some(folder) = self.state().folders.get_mut(folder) {
            let count = count.min(folder.messages.len());
            folder.messages.drain(..count);
        }
    }

    pub(crate) fn flags(&self, folder: &str, seq: u32) -> Vec<String> {
        self.state()
            .folders
            .get(folder)
            .and_then(|folder| folder.messages.get(seq as usize - 1))
            .map(|message| message.flags.clone())
            .unwrap_or_default()
    }

    pub(crate) fn message_count(&self, folder: &str) -> usize {
        self.state()
            .folders
            .get(folder)
            .map(|folder| folder.messages.len())
            .unwrap_or(0)
    }

    pub(crate) fn enable_thread_extension(&self, groups: Vec<ThreadGroup>) {
        self.state().thread_groups = Some(groups);
    }

    pub(crate) fn set_idle_supported(&self, supported: bool) {
        self.state().idle_supported = supported;
    }

    pub(crate) fn set_special_use(&self, supported: bool) {
        self.state().special_use = supported;
    }

    pub(crate) fn set_command_delay(&self, delay: Duration) {
        self.state().command_delay = delay;
    }

    /// Queue a failure for the next command with this name.
    pub(crate) fn fail_next(&self, command: &str, error: SessionError) {
        self.state()
            .failures
            .entry(command.to_string())
            .or_default()
            .push_back(error);
    }

    pub(crate) fn command_count(&self, command: &str) -> usize {
        self.state().commands.get(command).copied().unwrap_or(0)
    }

    pub(crate) fn reset_fetched(&self) {
        self.state().fetched.clear();
    }

    /// Sequence numbers whose headers were fetched from `folder`.
    pub(crate) fn fetched_seqs(&self, folder: &str) -> Vec<u32> {
        self.state()
            .fetched
            .iter()
            .filter(|(name, _)| name == folder)
            .map(|(_, seq)| *seq)
            .collect()
    }

    pub(crate) fn last_search(&self) -> Option<String> {
        self.state().searches.last().cloned()
    }

    /// Highest number of commands ever running at once on a single connection.
    pub(crate) fn max_concurrent_commands(&self) -> usize {
        self.shared.max_concurrent.load(Ordering::SeqCst)
    }

    pub(crate) fn idling(&self) -> usize {
        self.shared.idling.load(Ordering::SeqCst)
    }

    pub(crate) async fn wait_until_idling(&self, count: usize) {
        for _ in 0..500 {
            if self.idling() >= count {
                return;
            }
            tokio::time::sleep(Duration::from_millis(2)).await;
        }
        panic!("no connection entered IDLE");
    }

    /// Wake every connection currently in IDLE with an EXISTS update.
    pub(crate) fn push(&self) {
        self.shared.push.notify_waiters();
    }
}

struct ActiveCommand {
    active: Arc<AtomicUsize>,
}

impl Drop for ActiveCommand {
    fn drop(&mut self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }
}

struct IdleMarker {
    shared: Arc<ServerShared>,
}

impl Drop for IdleMarker {
    fn drop(&mut self) {
        self.shared.idling.fetch_sub(1, Ordering::SeqCst);
    }
}

pub(crate) struct FakeConnection {
    server: FakeServer,
    selected: Option<String>,
    active: Arc<AtomicUsize>,
    live: Option<Arc<AtomicUsize>>,
}

impl Drop for FakeConnection {
    fn drop(&mut self) {
        if let Some(live) = &self.live {
            live.fetch_sub(1, Ordering::SeqCst);
        }
    }
}

impl FakeConnection {
    /// Record the command, enforce single entry, apply delay and injected failures.
    async fn enter(&self, command: &str) -> Result<ActiveCommand, SessionError> {
        let running = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = ActiveCommand {
            active: self.active.clone(),
        };
        self.server
            .shared
            .max_concurrent
            .fetch_max(running, Ordering::SeqCst);
        if running > 1 {
            return Err(SessionError::Protocol(format!(
                "concurrent command {command} on one connection"
            )));
        }

        let (delay, failure) = {
            let mut state = self.server.state();
            *state.commands.entry(command.to_string()).or_default() += 1;
            let failure = state
                .failures
                .get_mut(command)
                .and_then(|queue| queue.pop_front());
            (state.command_delay, failure)
        };

        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }
        match failure {
            Some(error) => Err(error),
            None => Ok(guard),
        }
    }

    fn selected(&self) -> Result<String, SessionError> {
        self.selected
            .clone()
            .ok_or_else(|| SessionError::Rejected("BAD no mailbox selected".into()))
    }

    fn fetch(&self, seq_set: &str, headers_only: bool) -> Result<Vec<FetchedMessage>, SessionError> {
        let folder = self.selected()?;
        let mut state = self.server.state();
        let messages = state
            .folders
            .get(&folder)
            .map(|folder| folder.messages.clone())
            .unwrap_or_default();

        let mut fetched = Vec::new();
        for seq in parse_sequence_set(seq_set, messages.len() as u32) {
            let Some(message) = messages.get(seq as usize - 1) else {
                continue;
            };
            let raw = if headers_only {
                header_block(&message.raw)
            } else {
                message.raw.clone()
            };
            if headers_only {
                state.fetched.push((folder.clone(), seq));
            }
            fetched.push(FetchedMessage {
                seq,
                uid: Some(seq),
                flags: message.flags.clone(),
                internal_date: None,
                raw,
            });
        }
        Ok(fetched)
    }
}

#[async_trait]
impl MailConnection for FakeConnection {
    async fn select(&mut self, folder: &str) -> Result<MailboxStatus, SessionError> {
        let _command = self.enter("SELECT").await?;
        let exists = {
            let state = self.server.state();
            let Some(found) = state.folders.get(folder) else {
                return Err(SessionError::Rejected(format!("NO no such mailbox {folder}")));
            };
            found.messages.len() as u32
        };
        self.selected = Some(folder.to_string());
        Ok(MailboxStatus {
            exists,
            uid_validity: Some(1),
            uid_next: Some(exists + 1),
        })
    }

    async fn noop(&mut self) -> Result<(), SessionError> {
        let _command = self.enter("NOOP").await?;
        Ok(())
    }

    async fn capabilities(&mut self) -> Result<Capabilities, SessionError> {
        let _command = self.enter("CAPABILITY").await?;
        let state = self.server.state();
        let mut names = vec!["IMAP4rev1"];
        if state.idle_supported {
            names.push("IDLE");
        }
        if state.thread_groups.is_some() {
            names.push("THREAD=REFERENCES");
        }
        if state.special_use {
            names.push("SPECIAL-USE");
        }
        Ok(Capabilities::new(names))
    }

    async fn list_folders(&mut self) -> Result<Vec<RemoteFolder>, SessionError> {
        let _command = self.enter("LIST").await?;
        let state = self.server.state();
        Ok(state
            .folders
            .iter()
            .map(|(name, folder)| RemoteFolder {
                name: name.clone(),
                delimiter: Some("/".to_string()),
                attributes: folder.attributes.clone(),
            })
            .collect())
    }

    async fn search(&mut self, criteria: &str) -> Result<Vec<u32>, SessionError> {
        let _command = self.enter("SEARCH").await?;
        let folder = self.selected()?;
        let mut state = self.server.state();
        state.searches.push(criteria.to_string());

        let messages = state
            .folders
            .get(&folder)
            .map(|folder| folder.messages.clone())
            .unwrap_or_default();
        let exists = messages.len() as u32;

        if criteria.starts_with(|c: char| c.is_ascii_digit()) {
            return Ok(parse_sequence_set(criteria, exists));
        }

        let needles: Vec<String> = quoted_values(criteria)
            .into_iter()
            .map(|value| value.to_ascii_lowercase())
            .collect();
        Ok(messages
            .iter()
            .enumerate()
            .filter(|(_, message)| {
                let haystack = String::from_utf8_lossy(&message.raw).to_ascii_lowercase();
                needles.iter().all(|needle| haystack.contains(needle.as_str()))
            })
            .map(|(index, _)| index as u32 + 1)
            .collect())
    }

    async fn fetch_headers(&mut self, seq_set: &str) -> Result<Vec<FetchedMessage>, SessionError> {
        let _command = self.enter("FETCH HEADER").await?;
        self.fetch(seq_set, true)
    }

    async fn fetch_bodies(&mut self, seq_set: &str) -> Result<Vec<FetchedMessage>, SessionError> {
        let _command = self.enter("FETCH BODY").await?;
        self.fetch(seq_set, false)
    }

    async fn thread_references(&mut self, _criteria: &str) -> Result<Vec<ThreadGroup>, SessionError> {
        let _command = self.enter("THREAD").await?;
        self.server
            .state()
            .thread_groups
            .clone()
            .ok_or_else(|| SessionError::Unsupported("THREAD".into()))
    }

    async fn store_flags(
        &mut self,
        seq_set: &str,
        op: FlagOp,
        flags: &[String],
    ) -> Result<(), SessionError> {
        let _command = self.enter("STORE").await?;
        let folder = self.selected()?;
        let mut state = self.server.state();
        let Some(folder) = state.folders.get_mut(&folder) else {
            return Err(SessionError::Rejected("NO no such mailbox".into()));
        };
        let exists = folder.messages.len() as u32;
        for seq in parse_sequence_set(seq_set, exists) {
            let Some(message) = folder.messages.get_mut(seq as usize - 1) else {
                continue;
            };
            for flag in flags {
                match op {
                    FlagOp::Add => {
                        if !message.flags.contains(flag) {
                            message.flags.push(flag.clone());
                        }
                    }
                    FlagOp::Remove => message.flags.retain(|existing| existing != flag),
                }
            }
        }
        Ok(())
    }

    async fn copy(&mut self, seq_set: &str, destination: &str) -> Result<(), SessionError> {
        let _command = self.enter("COPY").await?;
        let source = self.selected()?;
        let mut state = self.server.state();
        if !state.folders.contains_key(destination) {
            return Err(SessionError::Rejected(format!("NO [TRYCREATE] {destination}")));
        }
        let messages = state
            .folders
            .get(&source)
            .map(|folder| folder.messages.clone())
            .unwrap_or_default();
        let copied: Vec<FakeMessage> = parse_sequence_set(seq_set, messages.len() as u32)
            .into_iter()
            .filter_map(|seq| messages.get(seq as usize - 1).cloned())
            .collect();
        if let Some(target) = state.folders.get_mut(destination) {
            target.messages.extend(copied);
        }
        Ok(())
    }

    async fn append(
        &mut self,
        folder: &str,
        flags: &[String],
        content: &[u8],
    ) -> Result<(), SessionError> {
        let _command = self.enter("APPEND").await?;
        let mut state = self.server.state();
        let Some(target) = state.folders.get_mut(folder) else {
            return Err(SessionError::Rejected(format!("NO [TRYCREATE] {folder}")));
        };
        target.messages.push(FakeMessage {
            raw: content.to_vec(),
            flags: flags.to_vec(),
        });
        Ok(())
    }

    async fn idle(
        &mut self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<IdleOutcome, SessionError> {
        let _command = self.enter("IDLE").await?;
        self.selected()?;
        if !self.server.state().idle_supported {
            return Err(SessionError::Rejected("BAD IDLE not supported".into()));
        }

        let shared = self.server.shared.clone();
        let notified = shared.push.notified();
        tokio::pin!(notified);
        notified.as_mut().enable();
        shared.idling.fetch_add(1, Ordering::SeqCst);
        let _marker = IdleMarker {
            shared: shared.clone(),
        };

        tokio::select! {
            _ = &mut notified => Ok(IdleOutcome::Changed),
            _ = tokio::time::sleep(timeout) => Ok(IdleOutcome::Timeout),
            _ = cancel.cancelled() => Ok(IdleOutcome::Cancelled),
        }
    }

    async fn logout(&mut self) -> Result<(), SessionError> {
        let _command = self.enter("LOGOUT").await?;
        Ok(())
    }
}

/// Counts connections and can delay or fail them.
pub(crate) struct FakeConnector {
    server: FakeServer,
    connects: AtomicUsize,
    live: Arc<AtomicUsize>,
    max_live: AtomicUsize,
    delay: Mutex<Duration>,
    failures: Mutex<VecDeque<ConnectError>>,
}

impl FakeConnector {
    pub(crate) fn new(server: FakeServer) -> Arc<Self> {
        Arc::new(Self {
            server,
            connects: AtomicUsize::new(0),
            live: Arc::new(AtomicUsize::new(0)),
            max_live: AtomicUsize::new(0),
            delay: Mutex::new(Duration::ZERO),
            failures: Mutex::new(VecDeque::new()),
        })
    }

    pub(crate) fn connect_count(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    pub(crate) fn max_live_connections(&self) -> usize {
        self.max_live.load(Ordering::SeqCst)
    }

    pub(crate) fn set_connect_delay(&self, delay: Duration) {
        *self
            .delay
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner) = delay;
    }

    pub(crate) fn fail_next(&self, error: ConnectError) {
        self.failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push_back(error);
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, _account: &MailAccount) -> Result<Box<dyn MailConnection>, ConnectError> {
        let delay = *self
            .delay
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        if !delay.is_zero() {
            tokio::time::sleep(delay).await;
        }

        let failure = self
            .failures
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .pop_front();
        if let Some(error) = failure {
            return Err(error);
        }

        self.connects.fetch_add(1, Ordering::SeqCst);
        let live = self.live.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_live.fetch_max(live, Ordering::SeqCst);

        Ok(Box::new(FakeConnection {
            server: self.server.clone(),
            selected: None,
            active: Arc::new(AtomicUsize::new(0)),
            live: Some(self.live.clone()),
        }))
    }
}

fn parse_sequence_set(seq_set: &str, exists: u32) -> Vec<u32> {
    let mut seqs = Vec::new();
    for part in seq_set.split(',') {
        let bound = |value: &str| {
            if value.trim() == "*" {
                Some(exists)
            } else {
                value.trim().parse::<u32>().ok()
            }
        };
        match part.split_once(':') {
            Some((start, end)) => {
                if let (Some(start), Some(end)) = (bound(start), bound(end)) {
                    let (low, high) = (start.min(end), start.max(end));
                    seqs.extend((low..=high).filter(|seq| *seq >= 1 && *seq <= exists));
                }
            }
            None => {
                if let Some(seq) = bound(part)
                    && seq >= 1
                    && seq <= exists
                {
                    seqs.push(seq);
                }
            }
        }
    }
    seqs.sort_unstable();
    seqs.dedup();
    seqs
}

fn quoted_values(criteria: &str) -> Vec<String> {
    let mut values = Vec::new();
    let mut current = String::new();
    let mut in_quotes = false;
    let mut escaped = false;
    for character in criteria.chars() {
        if in_quotes {
            if escaped {
                current.push(character);
                escaped = false;
            } else if character == '\\' {
                escaped = true;
            } else if character == '"' {
                values.push(std::mem::take(&mut current));
                in_quotes = false;
            } else {
                current.push(character);
            }
        } else if character == '"' {
            in_quotes = true;
        }
    }
    values
}

fn header_block(raw: &[u8]) -> Vec<u8> {
    raw.windows(4)
        .position(|window| window == b"\r\n\r\n")
        .map(|end| raw[..end + 4].to_vec())
        .unwrap_or_else(|| raw.to_vec())
}
