//! Header and MIME parsing for fetched messages.

use anyhow::Context as _;
use chrono::{DateTime, Utc};
use mailparse::{DispositionType, MailHeaderMap};
use regex::Regex;
use sha2::{Digest, Sha256};

use std::sync::OnceLock;

/// Header fields needed for the thread list and threading.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedHeaders {
    /// Normalized `Message-ID`, or a deterministic synthetic id when absent.
    pub message_id: String,
    pub in_reply_to: Option<String>,
    /// `References` ids, root first.
    pub references: Vec<String>,
    pub from: String,
    pub to: String,
    pub cc: String,
    pub subject: String,
    pub sent_at: DateTime<Utc>,
}

impl ParsedHeaders {
    /// Identifiers this message points at, nearest parent last.
    pub fn parent_ids(&self) -> impl Iterator<Item = &str> {
        self.references
            .iter()
            .map(String::as_str)
            .chain(self.in_reply_to.as_deref())
    }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParsedBody {
    pub text: Option<String>,
    pub html: Option<String>,
    pub attachments: Vec<ParsedAttachment>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ParsedAttachment {
    pub file_name: String,
    pub content_type: String,
    pub size: u64,
    pub content_id: Option<String>,
    pub inline: bool,
}

/// Parse a header block (or a full message; only its headers are read).
///
/// `folder` and `internal_date` only feed the synthetic id and the date fallback.
pub fn parse_headers(
    raw: &[u8],
    folder: &str,
    internal_date: Option<DateTime<Utc>>,
) -> anyhow::Result<ParsedHeaders> {
    let (headers, _) = mailparse::parse_headers(raw).context("failed to parse message headers")?;
    let headers = headers.as_slice();

    let header = |name: &str| {
        headers
            .get_first_value(name)
            .map(|value| value.trim().to_string())
            .unwrap_or_default()
    };

    let from = header("From");
    let subject = header("Subject");
    let date = header("Date");

    let sent_at = mailparse::dateparse(&date)
        .ok()
        .and_then(|timestamp| DateTime::from_timestamp(timestamp, 0))
        .or(internal_date)
        .unwrap_or(DateTime::<Utc>::UNIX_EPOCH);

    let message_id = headers
        .get_first_value("Message-ID")
        .and_then(|value| extract_message_ids(&value).into_iter().next())
        .unwrap_or_else(|| synthetic_message_id(folder, &date, &from, &subject));

    let in_reply_to = headers
        .get_first_value("In-Reply-To")
        .and_then(|value| extract_message_ids(&value).into_iter().next());

    let mut references = headers
        .get_first_value("References")
        .map(|value| extract_message_ids(&value))
        .unwrap_or_default();
    references.retain(|id| id != &message_id);

    Ok(ParsedHeaders {
        message_id,
        in_reply_to,
        references,
        from,
        to: header("To"),
        cc: header("Cc"),
        subject,
        sent_at,
    })
}

/// Parse a full RFC 822 message into text, HTML and attachment metadata.
pub fn parse_body(raw: &[u8], max_body_bytes: usize) -> anyhow::Result<ParsedBody> {
    let parsed = mailparse::parse_mail(raw).context("failed to parse MIME message")?;

    let mut plain_text_parts = Vec::new();
    let mut html_parts = Vec::new();
    let mut attachments = Vec::new();
    collect_parts(&parsed, &mut plain_text_parts, &mut html_parts, &mut attachments);

    let html = (!html_parts.is_empty()).then(|| html_parts.join("\n"));

    let text = if !plain_text_parts.is_empty() {
        Some(plain_text_parts.join("\n\n"))
    } else if let Some(html) = &html {
        Some(html_to_text(html))
    } else if parsed.subparts.is_empty() && attachments.is_empty() {
        parsed.get_body().ok()
    } else {
        None
    };

    let text = text
        .map(|text| text.replace("\r\n", "\n").trim().to_string())
        .filter(|text| !text.is_empty())
        .map(|text| truncate_body(text, max_body_bytes));
    let html = html.map(|html| truncate_body(html, max_body_bytes));

    Ok(ParsedBody {
        text,
        html,
        attachments,
    })
}

fn collect_parts(
    part: &mailparse::ParsedMail<'_>,
    plain_text_parts: &mut Vec<String>,
    html_parts: &mut Vec<String>,
    attachments: &mut Vec<ParsedAttachment>,
) {
    if !part.subparts.is_empty() {
        for subpart in &part.subparts {
            collect_parts(subpart, plain_text_parts, html_parts, attachments);
        }
        return;
    }

    let disposition = part.get_content_disposition();
    let filename = disposition
        .params
        .get("filename")
        .cloned()
        .or_else(|| part.ctype.params.get("name").cloned());
    let content_id = part
        .headers
        .get_first_value("Content-ID")
        .map(|value| normalize_message_id(&value))
        .filter(|value| !value.is_empty());
    let is_attachment =
        matches!(disposition.disposition, DispositionType::Attachment) || filename.is_some();

    if is_attachment {
        let size = part
            .get_body_raw()
            .map(|body| body.len() as u64)
            .unwrap_or(0);
        attachments.push(ParsedAttachment {
            file_name: filename.unwrap_or_else(|| "attachment".to_string()),
            content_type: part.ctype.mimetype.to_ascii_lowercase(),
            size,
            inline: matches!(disposition.disposition, DispositionType::Inline)
                && content_id.is_some(),
            content_id,
        });
        return;
    }

    let mime_type = part.ctype.mimetype.to_ascii_lowercase();
    if mime_type.starts_with("text/plain") {
        if let Ok(body) = part.get_body()
            && !body.trim().is_empty()
        {
            plain_text_parts.push(body);
        }
    } else if mime_type.starts_with("text/html")
        && let Ok(body) = part.get_body()
        && !body.trim().is_empty()
    {
        html_parts.push(body);
    }
}

pub fn html_to_text(html: &str) -> String {
    let without_tags = html_tag_regex().replace_all(html, " ");
    let decoded = without_tags
        .replace("&nbsp;", " ")
        .replace("&lt;", "<")
        .replace("&gt;", ">")
        .replace("&quot;", "\"")
        .replace("&#39;", "'")
        .replace("&amp;", "&");

    decoded.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn html_tag_regex() -> &'static Regex {
    static REGEX: OnceLock<Regex> = OnceLock::new();
    REGEX.get_or_init(|| {
        Regex::new(r"(?is)<(script|style)[^>]*>.*?</(script|style)>|<[^>]+>")
            .expect("valid HTML tag regex")
    })
}

pub fn extract_message_ids(value: &str) -> Vec<String> {
    mailparse::msgidparse(value)
        .map(|ids| {
            ids.iter()
                .map(|id| normalize_message_id(id.as_str()))
                .filter(|id| !id.is_empty())
                .collect::<Vec<String>>()
        })
        .unwrap_or_default()
}

pub fn normalize_message_id(value: &str) -> String {
    value
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim()
        .to_string()
}

/// Stable id for messages without a `Message-ID`, so repeated syncs agree.
fn synthetic_message_id(folder: &str, date: &str, from: &str, subject: &str) -> String {
    let mut hasher = Sha256::new();
    for field in [folder, date, from, subject] {
        hasher.update(field.trim().as_bytes());
        hasher.update([0u8]);
    }
    let digest = hex::encode(hasher.finalize());
    format!("{}@synthetic.mailhub", &digest[..32])
}

fn truncate_body(value: String, max_bytes: usize) -> String {
    if value.len() <= max_bytes {
        return value;
    }

    let mut cutoff = max_bytes;
    while cutoff > 0 && !value.is_char_boundary(cutoff) {
        cutoff -= 1;
    }
    format!("{}\n\n[Message truncated due to size limit]", &value[..cutoff])
}
