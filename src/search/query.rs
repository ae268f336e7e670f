//! Search query language.
//!
//! Whitespace-separated tokens, quote-aware. `key:value` tokens with a known key
//! become filters; everything else is free text.
//!
//! ```text
//! from:alice subject:"quarterly report" after:2025-01-01 invoice
//! ```

use crate::imap::quote;

use chrono::NaiveDate;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    #[error("search filter '{0}:' needs a value")]
    EmptyFilter(String),

    #[error("invalid date '{value}' for '{key}:', expected YYYY-MM-DD")]
    InvalidDate { key: String, value: String },

    #[error("'after:{after}' is later than 'before:{before}'")]
    EmptyDateRange { after: NaiveDate, before: NaiveDate },

    #[error("only one folder can be searched at a time ('{first}' and '{second}')")]
    ConflictingFolders { first: String, second: String },
}

/// A parsed query. Repeated header filters are ANDed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SearchQuery {
    pub from: Vec<String>,
    pub to: Vec<String>,
    pub subject: Vec<String>,
    /// Inclusive lower bound on the sent date.
    pub after: Option<NaiveDate>,
    /// Exclusive upper bound on the sent date.
    pub before: Option<NaiveDate>,
    pub folder: Option<String>,
    pub text: Vec<String>,
}

struct Token {
    text: String,
    /// Byte offset of the `:` separating a filter key, if one was seen before any quote.
    key_end: Option<usize>,
}

impl SearchQuery {
    pub fn parse(input: &str) -> Result<Self, QueryError> {
        let mut query = SearchQuery::default();

        for token in tokenize(input) {
            let Some(key_end) = token.key_end else {
                query.text.push(token.text);
                continue;
            };

            let key = token.text[..key_end].to_ascii_lowercase();
            let value = token.text[key_end + 1..].trim().to_string();
            let known = matches!(
                key.as_str(),
                "from" | "to" | "subject" | "after" | "before" | "folder" | "label"
            );
            if !known {
                query.text.push(token.text);
                continue;
            }
            if value.is_empty() {
                return Err(QueryError::EmptyFilter(key));
            }

            match key.as_str() {
                "from" => query.from.push(value),
                "to" => query.to.push(value),
                "subject" => query.subject.push(value),
                "after" => query.after = Some(parse_date(&key, &value)?),
                "before" => query.before = Some(parse_date(&key, &value)?),
                _ => match &query.folder {
                    Some(first) if first != &value => {
                        return Err(QueryError::ConflictingFolders {
                            first: first.clone(),
                            second: value,
                        });
                    }
                    _ => query.folder = Some(value),
                },
            }
        }

        if let (Some(after), Some(before)) = (query.after, query.before)
            && after > before
        {
            return Err(QueryError::EmptyDateRange { after, before });
        }

        Ok(query)
    }

    /// True when the query matches every message of the folder.
    pub fn is_empty(&self) -> bool {
        self.from.is_empty()
            && self.to.is_empty()
            && self.subject.is_empty()
            && self.after.is_none()
            && self.before.is_none()
            && self.text.is_empty()
    }

    /// IMAP SEARCH criteria; free text goes to the server's TEXT search.
    pub fn to_criteria(&self) -> String {
        let mut clauses = Vec::new();

        for (name, values) in [("FROM", &self.from), ("TO", &self.to), ("SUBJECT", &self.subject)] {
            for value in values {
                clauses.push(format!("{name} {}", quote(&sanitize(value))));
            }
        }
        if let Some(after) = self.after {
            clauses.push(format!("SINCE {}", after.format("%d-%b-%Y")));
        }
        if let Some(before) = self.before {
            clauses.push(format!("BEFORE {}", before.format("%d-%b-%Y")));
        }
        for text in &self.text {
            clauses.push(format!("TEXT {}", quote(&sanitize(text))));
        }

        if clauses.is_empty() {
            "ALL".to_string()
        } else {
            clauses.join(" ")
        }
    }
}

fn parse_date(key: &str, value: &str) -> Result<NaiveDate, QueryError> {
    NaiveDate::parse_from_str(value, "%Y-%m-%d").map_err(|_| QueryError::InvalidDate {
        key: key.to_string(),
        value: value.to_string(),
    })
}

fn sanitize(value: &str) -> String {
    value.replace(['\r', '\n'], " ").trim().to_string()
}

/// Split on unquoted whitespace. Quotes group words and are dropped; an
/// unterminated quote runs to the end of the input.
fn tokenize(input: &str) -> Vec<Token> {
    let mut tokens = Vec::new();
    let mut text = String::new();
    let mut key_end = None;
    let mut quoted = false;
    let mut saw_quote = false;

    let mut flush = |text: &mut String, key_end: &mut Option<usize>, saw_quote: &mut bool| {
        let text = std::mem::take(text);
        let key_end = key_end.take();
        *saw_quote = false;
        if !text.trim().is_empty() || key_end.is_some() {
            tokens.push(Token { text, key_end });
        }
    };

    for character in input.chars() {
        match character {
            '"' => {
                quoted = !quoted;
                saw_quote = true;
            }
            c if c.is_whitespace() && !quoted => flush(&mut text, &mut key_end, &mut saw_quote),
            ':' if !quoted && !saw_quote && key_end.is_none() && !text.is_empty() => {
                key_end = Some(text.len());
                text.push(':');
            }
            c => text.push(c),
        }
    }
    flush(&mut text, &mut key_end, &mut saw_quote);

    tokens
}
