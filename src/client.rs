//! Gmail access layer with quota-aware rate limiting and retry logic.
//!
//! [`MailStore`] is the seam everything above this module talks through:
//! the aggregator, the unsubscribe resolver and executor, and the workflow
//! all take a `MailStore` rather than a Gmail hub. [`GmailMailStore`] is the
//! production implementation, backed by the Gmail API for mailbox access and
//! a plain HTTPS client for unsubscribe POST endpoints.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use chrono::{DateTime, Utc};
use google_gmail1::api::{
    BatchModifyMessagesRequest, Filter, FilterAction, FilterCriteria, Message, MessagePart,
};
use google_gmail1::{hyper_rustls, hyper_util};
use http_body_util::Empty;
use hyper::body::Bytes;
use once_cell::sync::Lazy;
use regex::Regex;
use std::io::Cursor;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Semaphore;
use tracing::{debug, warn};

use crate::auth::GmailHub;
use crate::error::{parse_retry_after_header, Result, UnsubscribeError};
use crate::models::MessageSummary;
use crate::rate_limiter::{QuotaCost, QuotaRateLimiter};

const SCOPE_MODIFY: &str = "https://www.googleapis.com/auth/gmail.modify";
const SCOPE_SEND: &str = "https://www.googleapis.com/auth/gmail.send";
const SCOPE_SETTINGS: &str = "https://www.googleapis.com/auth/gmail.settings.basic";

const USER_AGENT: &str = concat!("gmail-unsubscriber/", env!("CARGO_PKG_VERSION"));

type HttpsClient = hyper_util::client::legacy::Client<
    hyper_rustls::HttpsConnector<hyper_util::client::legacy::connect::HttpConnector>,
    Empty<Bytes>,
>;

/// Trait defining mailbox operations for easier testing
#[async_trait]
pub trait MailStore: Send + Sync {
    /// List message IDs matching a Gmail search query, up to `max_messages`
    async fn list_message_ids(&self, query: &str, max_messages: usize) -> Result<Vec<String>>;

    /// Fetch the From and Date headers of a single message
    async fn get_message_summary(&self, message_id: &str) -> Result<MessageSummary>;

    /// Return the raw `List-Unsubscribe` header of a message, if present
    async fn get_unsubscribe_header(&self, message_id: &str) -> Result<Option<String>>;

    /// Fetch the decoded message body, preferring HTML parts
    async fn get_message_body(&self, message_id: &str) -> Result<String>;

    /// Send a plain-text mail from the authenticated account
    async fn send_mail(&self, to: &str, subject: &str, body: &str) -> Result<()>;

    /// POST an empty body to an unsubscribe endpoint; success is any 2xx
    async fn post_to(&self, url: &str) -> Result<()>;

    /// Move every message from the given senders to the trash.
    /// Returns the number of messages trashed.
    async fn trash_messages(&self, sender_emails: &[String]) -> Result<u64>;

    /// Create a filter that routes future mail from the sender to the trash.
    /// Returns the ID of the created filter.
    async fn create_block_filter(&self, sender_email: &str) -> Result<String>;
}

/// Production mail store with rate limiting and retry logic
///
/// Every Gmail call draws from a shared quota token bucket sized to the
/// API's per-user budget, runs under a concurrency semaphore, and retries
/// transient failures with exponential backoff.
pub struct GmailMailStore {
    hub: GmailHub,
    poster: UnsubscribePoster,
    quota: QuotaRateLimiter,
    semaphore: Arc<Semaphore>,
    max_retries: u32,
}

impl GmailMailStore {
    /// Create a new mail store
    ///
    /// # Arguments
    /// * `hub` - Authenticated Gmail API hub
    /// * `max_concurrent` - Maximum concurrent API requests
    /// * `max_retries` - Retry budget for transient failures
    pub fn new(hub: GmailHub, max_concurrent: usize, max_retries: u32) -> Result<Self> {
        Ok(Self {
            hub,
            poster: UnsubscribePoster::new()?,
            quota: QuotaRateLimiter::new(),
            semaphore: Arc::new(Semaphore::new(max_concurrent)),
            max_retries,
        })
    }

    async fn acquire_slot(&self) -> Result<tokio::sync::SemaphorePermit<'_>> {
        self.semaphore
            .acquire()
            .await
            .map_err(|e| UnsubscribeError::Unknown(format!("Failed to acquire request slot: {}", e)))
    }

    /// Execute an async operation with exponential backoff retry
    ///
    /// Transient errors are retried with a doubling delay (1s start, 30s
    /// cap) until the retry budget runs out, at which point the failure is
    /// reported as `RetriesExhausted`. A 429 carries the server's own wait
    /// in its Retry-After header, so that value is honored instead of the
    /// computed delay. Permanent errors return immediately.
    async fn with_retry<T, F, Fut>(
        operation_name: &str,
        max_retries: u32,
        mut operation: F,
    ) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        let mut delay = Duration::from_secs(1);
        let mut attempts = 0;

        loop {
            attempts += 1;
            match operation().await {
                Ok(result) => return Ok(result),
                Err(e) if e.is_transient() && attempts <= max_retries => {
                    let wait = match &e {
                        UnsubscribeError::RateLimitExceeded { retry_after } => {
                            Duration::from_secs(*retry_after)
                        }
                        _ => delay,
                    };
                    warn!(
                        "{} failed (attempt {}/{}): {}. Retrying in {:?}...",
                        operation_name,
                        attempts,
                        max_retries + 1,
                        e,
                        wait
                    );
                    tokio::time::sleep(wait).await;
                    delay = std::cmp::min(delay * 2, Duration::from_secs(30));
                }
                Err(e) if e.is_transient() => {
                    warn!("{} still failing after {} attempts: {}", operation_name, attempts, e);
                    return Err(UnsubscribeError::RetriesExhausted {
                        operation: operation_name.to_string(),
                        attempts,
                    });
                }
                Err(e) => return Err(e),
            }
        }
    }
}

#[async_trait]
impl MailStore for GmailMailStore {
    async fn list_message_ids(&self, query: &str, max_messages: usize) -> Result<Vec<String>> {
        let mut all_ids: Vec<String> = Vec::new();
        let mut page_token: Option<String> = None;

        loop {
            let _permit = self.acquire_slot().await?;
            let page_size = std::cmp::min(500, max_messages - all_ids.len()) as u32;

            let response = Self::with_retry("list_message_ids", self.max_retries, || async {
                self.quota.acquire(QuotaCost::Read).await;

                let mut call = self
                    .hub
                    .users()
                    .messages_list("me")
                    .q(query)
                    .max_results(page_size);

                if let Some(token) = page_token.as_ref() {
                    call = call.page_token(token);
                }

                let (_, response) = call.add_scope(SCOPE_MODIFY).doit().await?;
                Ok(response)
            })
            .await?;

            if let Some(messages) = response.messages {
                for msg_ref in messages {
                    if let Some(id) = msg_ref.id {
                        all_ids.push(id);
                    }
                }
            }

            if all_ids.len() >= max_messages {
                all_ids.truncate(max_messages);
                break;
            }

            page_token = response.next_page_token;
            if page_token.is_none() {
                break;
            }
        }

        debug!("Query '{}' matched {} messages", query, all_ids.len());
        Ok(all_ids)
    }

    async fn get_message_summary(&self, message_id: &str) -> Result<MessageSummary> {
        let _permit = self.acquire_slot().await?;

        Self::with_retry("get_message_summary", self.max_retries, || async {
            self.quota.acquire(QuotaCost::Read).await;

            let (_, message) = self
                .hub
                .users()
                .messages_get("me", message_id)
                .format("metadata")
                .add_metadata_headers("From")
                .add_metadata_headers("Date")
                .add_scope(SCOPE_MODIFY)
                .doit()
                .await?;

            parse_message_summary(message)
        })
        .await
    }

    async fn get_unsubscribe_header(&self, message_id: &str) -> Result<Option<String>> {
        let _permit = self.acquire_slot().await?;

        Self::with_retry("get_unsubscribe_header", self.max_retries, || async {
            self.quota.acquire(QuotaCost::Read).await;

            let (_, message) = self
                .hub
                .users()
                .messages_get("me", message_id)
                .format("metadata")
                .add_metadata_headers("List-Unsubscribe")
                .add_scope(SCOPE_MODIFY)
                .doit()
                .await?;

            Ok(header_value(&message, "list-unsubscribe"))
        })
        .await
    }

    async fn get_message_body(&self, message_id: &str) -> Result<String> {
        let _permit = self.acquire_slot().await?;

        Self::with_retry("get_message_body", self.max_retries, || async {
            self.quota.acquire(QuotaCost::Read).await;

            let (_, message) = self
                .hub
                .users()
                .messages_get("me", message_id)
                .format("full")
                .add_scope(SCOPE_MODIFY)
                .doit()
                .await?;

            let payload = message.payload.ok_or_else(|| {
                UnsubscribeError::InvalidMessageFormat(format!(
                    "Message {} has no payload",
                    message_id
                ))
            })?;

            extract_body_text(&payload).ok_or_else(|| {
                UnsubscribeError::InvalidMessageFormat(format!(
                    "Message {} has no readable body",
                    message_id
                ))
            })
        })
        .await
    }

    async fn send_mail(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        let _permit = self.acquire_slot().await?;
        let raw = build_rfc2822(to, subject, body);

        Self::with_retry("send_mail", self.max_retries, || async {
            self.quota.acquire(QuotaCost::Send).await;

            let (_, sent) = self
                .hub
                .users()
                .messages_send(Message::default(), "me")
                .add_scope(SCOPE_SEND)
                .upload(
                    Cursor::new(raw.clone().into_bytes()),
                    "message/rfc822".parse().unwrap(),
                )
                .await?;

            debug!("Sent unsubscribe mail to {} (message {:?})", to, sent.id);
            Ok(())
        })
        .await
    }

    async fn post_to(&self, url: &str) -> Result<()> {
        let _permit = self.acquire_slot().await?;

        Self::with_retry("post_to", self.max_retries, || async {
            self.poster.post(url).await
        })
        .await
    }

    async fn trash_messages(&self, sender_emails: &[String]) -> Result<u64> {
        // Gmail API allows up to 1000 messages per batch request
        const BATCH_SIZE: usize = 1000;
        let mut total: u64 = 0;

        for email in sender_emails {
            let query = format!("from:{}", email);
            let ids = self.list_message_ids(&query, usize::MAX).await?;

            if ids.is_empty() {
                debug!("No messages left to trash for {}", email);
                continue;
            }

            for chunk in ids.chunks(BATCH_SIZE) {
                let chunk_vec = chunk.to_vec();
                let _permit = self.acquire_slot().await?;

                Self::with_retry("trash_messages", self.max_retries, || async {
                    self.quota.acquire(QuotaCost::Trash).await;

                    let request = BatchModifyMessagesRequest {
                        ids: Some(chunk_vec.clone()),
                        add_label_ids: Some(vec!["TRASH".to_string()]),
                        remove_label_ids: Some(vec!["INBOX".to_string()]),
                    };

                    self.hub
                        .users()
                        .messages_batch_modify(request, "me")
                        .add_scope(SCOPE_MODIFY)
                        .doit()
                        .await?;

                    Ok(())
                })
                .await?;

                total += chunk.len() as u64;
            }

            debug!("Trashed {} messages from {}", ids.len(), email);
        }

        Ok(total)
    }

    async fn create_block_filter(&self, sender_email: &str) -> Result<String> {
        let _permit = self.acquire_slot().await?;

        Self::with_retry("create_block_filter", self.max_retries, || async {
            self.quota.acquire(QuotaCost::Filter).await;

            let filter = Filter {
                criteria: Some(FilterCriteria {
                    from: Some(sender_email.to_string()),
                    ..Default::default()
                }),
                action: Some(FilterAction {
                    add_label_ids: Some(vec!["TRASH".to_string()]),
                    remove_label_ids: Some(vec!["INBOX".to_string()]),
                    ..Default::default()
                }),
                ..Default::default()
            };

            let (_, created) = self
                .hub
                .users()
                .settings_filters_create(filter, "me")
                .add_scope(SCOPE_SETTINGS)
                .doit()
                .await?;

            created
                .id
                .ok_or_else(|| UnsubscribeError::FilterError("Created filter has no ID".to_string()))
        })
        .await
    }
}

// Delegate through Arc so a shared store can be handed to the aggregator
// and the workflow at the same time.
#[async_trait]
impl<T: MailStore + ?Sized> MailStore for Arc<T> {
    async fn list_message_ids(&self, query: &str, max_messages: usize) -> Result<Vec<String>> {
        self.as_ref().list_message_ids(query, max_messages).await
    }

    async fn get_message_summary(&self, message_id: &str) -> Result<MessageSummary> {
        self.as_ref().get_message_summary(message_id).await
    }

    async fn get_unsubscribe_header(&self, message_id: &str) -> Result<Option<String>> {
        self.as_ref().get_unsubscribe_header(message_id).await
    }

    async fn get_message_body(&self, message_id: &str) -> Result<String> {
        self.as_ref().get_message_body(message_id).await
    }

    async fn send_mail(&self, to: &str, subject: &str, body: &str) -> Result<()> {
        self.as_ref().send_mail(to, subject, body).await
    }

    async fn post_to(&self, url: &str) -> Result<()> {
        self.as_ref().post_to(url).await
    }

    async fn trash_messages(&self, sender_emails: &[String]) -> Result<u64> {
        self.as_ref().trash_messages(sender_emails).await
    }

    async fn create_block_filter(&self, sender_email: &str) -> Result<String> {
        self.as_ref().create_block_filter(sender_email).await
    }
}

/// HTTPS client for unsubscribe POST endpoints
///
/// Separate from the Gmail hub so requests to third-party list servers
/// never carry OAuth credentials. Redirects are not followed: an endpoint
/// answering 3xx wants a browser, which counts as failure here.
pub struct UnsubscribePoster {
    http: HttpsClient,
}

impl UnsubscribePoster {
    pub fn new() -> Result<Self> {
        let connector = hyper_rustls::HttpsConnectorBuilder::new()
            .with_native_roots()
            .map_err(|e| {
                UnsubscribeError::NetworkError(format!("Failed to load TLS roots: {}", e))
            })?
            .https_or_http()
            .enable_http1()
            .build();

        let http = hyper_util::client::legacy::Client::builder(hyper_util::rt::TokioExecutor::new())
            .build(connector);

        Ok(Self { http })
    }

    /// Issue one POST with an empty body. Any 2xx counts as success;
    /// 429 and 5xx map to transient errors so callers can retry.
    pub async fn post(&self, url: &str) -> Result<()> {
        let uri: hyper::Uri = url.parse().map_err(|e| {
            UnsubscribeError::BadRequest(format!("Invalid unsubscribe URL {}: {}", url, e))
        })?;

        let request = hyper::Request::post(uri)
            .header(hyper::header::USER_AGENT, USER_AGENT)
            .header(hyper::header::CONTENT_LENGTH, 0)
            .body(Empty::<Bytes>::new())
            .map_err(|e| {
                UnsubscribeError::BadRequest(format!("Could not build POST request: {}", e))
            })?;

        let response = self
            .http
            .request(request)
            .await
            .map_err(|e| UnsubscribeError::NetworkError(format!("POST {} failed: {}", url, e)))?;

        let status = response.status();
        if status.is_success() {
            debug!("POST {} returned {}", url, status);
            return Ok(());
        }

        match status.as_u16() {
            429 => Err(UnsubscribeError::RateLimitExceeded {
                retry_after: parse_retry_after_header(&response),
            }),
            code @ 500..=599 => Err(UnsubscribeError::ServerError {
                status: code,
                message: format!("POST {}", url),
            }),
            code => Err(UnsubscribeError::SendError(format!(
                "POST {} rejected with HTTP {}",
                url, code
            ))),
        }
    }
}

static EMAIL_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r"<?([a-zA-Z0-9._%+-]+@[a-zA-Z0-9.-]+\.[a-zA-Z]{2,})>?")
        .expect("email regex is valid")
});

/// Parse Gmail API Message metadata into a MessageSummary
fn parse_message_summary(message: Message) -> Result<MessageSummary> {
    let id = message
        .id
        .ok_or_else(|| UnsubscribeError::InvalidMessageFormat("Missing message ID".to_string()))?;

    let mut from_header: Option<String> = None;
    let mut date_header: Option<String> = None;

    if let Some(headers) = message.payload.as_ref().and_then(|p| p.headers.as_ref()) {
        for header in headers {
            if let (Some(name), Some(value)) = (&header.name, &header.value) {
                match name.to_lowercase().as_str() {
                    "from" => from_header = Some(value.clone()),
                    "date" => date_header = Some(value.clone()),
                    _ => {}
                }
            }
        }
    }

    let from = from_header.ok_or_else(|| {
        UnsubscribeError::InvalidMessageFormat(format!("Message {} has no From header", id))
    })?;

    let (sender_name, sender_email) = parse_from_header(&from);
    let sender_email = sender_email.ok_or_else(|| {
        UnsubscribeError::InvalidMessageFormat(format!("Unparseable From header: {}", from))
    })?;

    let date_received = date_header.as_deref().and_then(parse_mail_date);

    Ok(MessageSummary {
        id,
        sender_email,
        sender_name,
        date_received,
    })
}

/// Split a From header into display name and address
///
/// Handles `"Name" <a@b.com>`, `Name <a@b.com>`, and bare `a@b.com`.
/// Addresses are lowercased so aggregation keys stay consistent.
fn parse_from_header(value: &str) -> (Option<String>, Option<String>) {
    let email = EMAIL_RE
        .captures(value)
        .and_then(|c| c.get(1))
        .map(|m| m.as_str().to_lowercase());

    let name = match value.find('<') {
        Some(pos) => {
            let candidate = value[..pos].trim().trim_matches('"').trim();
            if candidate.is_empty() {
                None
            } else {
                Some(candidate.to_string())
            }
        }
        None => None,
    };

    (name, email)
}

/// Parse an RFC 2822 date header, falling back to RFC 3339
fn parse_mail_date(value: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc2822(value)
        .or_else(|_| DateTime::parse_from_rfc3339(value))
        .map(|dt| dt.with_timezone(&Utc))
        .ok()
}

/// Find a header on the message payload by case-insensitive name
fn header_value(message: &Message, name: &str) -> Option<String> {
    message
        .payload
        .as_ref()?
        .headers
        .as_ref()?
        .iter()
        .find(|h| {
            h.name
                .as_deref()
                .map(|n| n.eq_ignore_ascii_case(name))
                .unwrap_or(false)
        })?
        .value
        .clone()
}

/// Pull displayable text out of a message payload.
///
/// HTML parts win over plain text because unsubscribe links live in
/// anchors; multipart containers are walked depth-first.
fn extract_body_text(payload: &MessagePart) -> Option<String> {
    if let Some(html) = find_part_data(payload, "text/html") {
        return Some(html);
    }
    if let Some(plain) = find_part_data(payload, "text/plain") {
        return Some(plain);
    }
    part_data(payload)
}

fn find_part_data(part: &MessagePart, mime_type: &str) -> Option<String> {
    if part.mime_type.as_deref() == Some(mime_type) {
        if let Some(text) = part_data(part) {
            return Some(text);
        }
    }
    for child in part.parts.as_deref().unwrap_or_default() {
        if let Some(text) = find_part_data(child, mime_type) {
            return Some(text);
        }
    }
    None
}

fn part_data(part: &MessagePart) -> Option<String> {
    let data = part.body.as_ref()?.data.as_ref()?;
    if data.is_empty() {
        return None;
    }
    Some(String::from_utf8_lossy(data).into_owned())
}

/// Assemble a minimal RFC 2822 mail. Gmail fills in the From header
/// for the authenticated user.
fn build_rfc2822(to: &str, subject: &str, body: &str) -> String {
    format!(
        "To: {}\r\nSubject: {}\r\nContent-Type: text/plain; charset=utf-8\r\n\r\n{}",
        to,
        encode_header_word(subject),
        body
    )
}

/// RFC 2047 B-encode a header value when it leaves printable ASCII
fn encode_header_word(text: &str) -> String {
    if text.chars().all(|c| c.is_ascii() && c != '=' && c != '?') {
        return text.to_string();
    }
    format!("=?utf-8?B?{}?=", BASE64_STANDARD.encode(text.as_bytes()))
}
