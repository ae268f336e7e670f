//! Search Engine: runs a parsed query on the server and groups the matches
//! into threads.

pub mod query;

pub use query::{QueryError, SearchQuery};

use crate::config::SearchConfig;
use crate::error::Result;
use crate::imap::{FetchedMessage, sequence_set};
use crate::model::{MailAccount, RemoteKey};
use crate::pool::{ConnectionPool, SessionGuard};
use crate::store::MailStore;
use crate::sync::parse::{self, ParsedHeaders};
use crate::sync::threading;

use chrono::{DateTime, Utc};
use serde::Serialize;

use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;

/// One matching message.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchHit {
    pub key: RemoteKey,
    pub message_id: String,
    pub from: String,
    pub subject: String,
    pub sent_at: DateTime<Utc>,
    pub unread: bool,
}

/// Matches grouped by conversation, newest hit first.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ThreadMatch {
    pub thread_id: String,
    pub subject: String,
    pub latest_at: DateTime<Utc>,
    /// Cached size of the whole conversation, or the hit count if it is not cached.
    pub message_count: u32,
    pub hits: Vec<SearchHit>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SearchPage {
    pub folder: String,
    /// 1-based.
    pub page: usize,
    pub limit: usize,
    pub total_threads: usize,
    pub threads: Vec<ThreadMatch>,
}

#[derive(Clone)]
pub struct SearchEngine {
    pool: Arc<ConnectionPool>,
    store: Arc<dyn MailStore>,
    config: SearchConfig,
}

impl std::fmt::Debug for SearchEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SearchEngine")
            .field("config", &self.config)
            .finish()
    }
}

impl SearchEngine {
    pub fn new(pool: Arc<ConnectionPool>, store: Arc<dyn MailStore>, config: SearchConfig) -> Self {
        Self {
            pool,
            store,
            config,
        }
    }

    /// Run `input` against the user's mailbox. Malformed queries fail with
    /// [`crate::Error::Query`] before any remote command is sent.
    pub async fn search(
        &self,
        user: &str,
        account: &MailAccount,
        input: &str,
        page: usize,
        limit: Option<usize>,
    ) -> Result<SearchPage> {
        let query = SearchQuery::parse(input)?;
        let folder = query
            .folder
            .clone()
            .unwrap_or_else(|| self.config.default_folder.clone());
        let criteria = query.to_criteria();
        let page = page.max(1);
        let limit = limit
            .unwrap_or(self.config.default_limit)
            .clamp(1, self.config.max_limit.max(1));

        let fetched = {
            let folder = folder.clone();
            let criteria = criteria.clone();
            let max_matches = self.config.max_matches;
            self.pool
                .with_retry(user, account, move |lease| {
                    let folder = folder.clone();
                    let criteria = criteria.clone();
                    Box::pin(async move {
                        matching_headers(lease, &folder, &criteria, max_matches).await
                    })
                })
                .await?
        };

        let mut threads = self.group(user, &folder, &fetched).await?;
        threads.sort_by(|left, right| {
            right
                .latest_at
                .cmp(&left.latest_at)
                .then_with(|| left.thread_id.cmp(&right.thread_id))
        });

        let total_threads = threads.len();
        let threads: Vec<ThreadMatch> = threads
            .into_iter()
            .skip((page - 1).saturating_mul(limit))
            .take(limit)
            .collect();

        tracing::debug!(
            user,
            %folder,
            criteria_len = criteria.len(),
            matches = fetched.len(),
            total_threads,
            page,
            "mailbox search finished"
        );

        Ok(SearchPage {
            folder,
            page,
            limit,
            total_threads,
            threads,
        })
    }

    /// Group fetched headers into threads, preferring thread ids already in the cache.
    async fn group(
        &self,
        user: &str,
        folder: &str,
        fetched: &[FetchedMessage],
    ) -> Result<Vec<ThreadMatch>> {
        let mut parsed: Vec<(&FetchedMessage, ParsedHeaders)> = Vec::with_capacity(fetched.len());
        for message in fetched {
            match parse::parse_headers(&message.raw, folder, message.internal_date) {
                Ok(headers) => parsed.push((message, headers)),
                Err(error) => {
                    tracing::debug!(user, folder, seq = message.seq, %error, "skipping unparsable search hit");
                }
            }
        }

        let mut assigned: HashMap<u32, String> = HashMap::new();
        for (message, headers) in &parsed {
            let cached = self
                .store
                .get_message_by_remote_key(user, &RemoteKey::new(folder, message.seq))
                .await?;
            if let Some(cached) = cached
                && cached.message_id == headers.message_id
            {
                assigned.insert(message.seq, cached.thread_id);
            }
        }

        let uncached: Vec<(u32, &ParsedHeaders)> = parsed
            .iter()
            .filter(|(message, _)| !assigned.contains_key(&message.seq))
            .map(|(message, headers)| (message.seq, headers))
            .collect();
        if !uncached.is_empty() {
            let lookup: Vec<String> = uncached
                .iter()
                .flat_map(|(_, headers)| {
                    std::iter::once(headers.message_id.clone())
                        .chain(headers.parent_ids().map(str::to_string))
                })
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect();
            let known = self.store.find_thread_ids(user, &lookup).await?;
            assigned.extend(threading::group_by_references(&uncached, &known));
        }

        let mut grouped: HashMap<String, Vec<SearchHit>> = HashMap::new();
        for (message, headers) in parsed {
            let thread_id = assigned
                .get(&message.seq)
                .cloned()
                .unwrap_or_else(|| headers.message_id.clone());
            grouped.entry(thread_id).or_default().push(SearchHit {
                key: RemoteKey::new(folder, message.seq),
                message_id: headers.message_id,
                from: headers.from,
                subject: headers.subject,
                sent_at: headers.sent_at,
                unread: !message
                    .flags
                    .iter()
                    .any(|flag| flag.eq_ignore_ascii_case("\\Seen")),
            });
        }

        let mut threads = Vec::with_capacity(grouped.len());
        for (thread_id, mut hits) in grouped {
            hits.sort_by(|left, right| right.sent_at.cmp(&left.sent_at));
            let latest_at = hits.first().map(|hit| hit.sent_at).unwrap_or_default();
            let cached = self.store.get_thread(user, &thread_id).await?;
            let (subject, message_count) = match cached {
                Some(thread) => (thread.subject, thread.message_count.max(hits.len() as u32)),
                None => (
                    hits.last().map(|hit| hit.subject.clone()).unwrap_or_default(),
                    hits.len() as u32,
                ),
            };
            threads.push(ThreadMatch {
                thread_id,
                subject,
                latest_at,
                message_count,
                hits,
            });
        }

        Ok(threads)
    }
}

/// SEARCH the folder and fetch headers for the newest `max_matches` hits.
async fn matching_headers(
    session: &mut SessionGuard,
    folder: &str,
    criteria: &str,
    max_matches: usize,
) -> Result<Vec<FetchedMessage>> {
    session.select(folder).await?;
    let mut seqs = session.search(criteria).await?;
    seqs.sort_unstable_by(|left, right| right.cmp(left));
    seqs.truncate(max_matches);
    if seqs.is_empty() {
        return Ok(Vec::new());
    }
    Ok(session.fetch_headers(&sequence_set(&seqs)).await?)
}
