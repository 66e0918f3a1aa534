//! Unsubscribe method resolution.
//!
//! For each sender the resolver probes the newest message and decides how
//! that sender can be unsubscribed from: a `mailto:` target from the
//! `List-Unsubscribe` header, a link in the body the user must click, a
//! bare POST endpoint from the header, or nothing at all. Exactly one
//! method comes back per sender, ranked Mailto > ClickLink > Post > None.

use once_cell::sync::Lazy;
use regex::Regex;
use tracing::{debug, warn};

use crate::client::MailStore;
use crate::error::Result;
use crate::models::{Sender, UnsubscribeMethod};

/// Resolves the unsubscribe method for senders by inspecting their
/// newest message. Read-only: resolution never mutates the mailbox,
/// so resolving the same sender twice yields the same method.
pub struct UnsubscribeMethodResolver<S> {
    store: S,
}

impl<S: MailStore> UnsubscribeMethodResolver<S> {
    pub fn new(store: S) -> Self {
        Self { store }
    }

    /// Decide the unsubscribe method for one sender.
    ///
    /// Fatal store errors (credentials, cancellation) propagate; any
    /// other failure demotes this sender to `None` with a warning so
    /// the rest of the batch keeps going.
    pub async fn resolve(&self, sender: &Sender) -> Result<UnsubscribeMethod> {
        let message_id = match sender.latest_message_id.as_deref() {
            Some(id) => id,
            None => {
                warn!("{} has no message to probe for unsubscribe data", sender.email);
                return Ok(UnsubscribeMethod::None);
            }
        };

        let header = match self.store.get_unsubscribe_header(message_id).await {
            Ok(value) => value,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Could not read List-Unsubscribe for {}: {}", sender.email, e);
                None
            }
        };

        let candidates = header
            .as_deref()
            .map(parse_header_entries)
            .unwrap_or_default();

        if let Some(address) = candidates.mailto {
            debug!("{} resolves to mailto:{}", sender.email, address);
            return Ok(UnsubscribeMethod::Mailto(address));
        }

        if let Some(href) = self.find_body_link(message_id, &sender.email).await? {
            debug!("{} resolves to body link {}", sender.email, href);
            return Ok(UnsubscribeMethod::ClickLink(href));
        }

        if let Some(url) = candidates.post {
            debug!("{} resolves to POST {}", sender.email, url);
            return Ok(UnsubscribeMethod::Post(url));
        }

        debug!("{} has no discoverable unsubscribe method", sender.email);
        Ok(UnsubscribeMethod::None)
    }

    async fn find_body_link(&self, message_id: &str, sender_email: &str) -> Result<Option<String>> {
        match self.store.get_message_body(message_id).await {
            Ok(body) => Ok(find_unsubscribe_anchor(&body)),
            Err(e) if e.is_fatal() => Err(e),
            Err(e) => {
                warn!("Could not read body for {}: {}", sender_email, e);
                Ok(None)
            }
        }
    }
}

/// First mailto and first http(s) entries found in a List-Unsubscribe
/// header. A single header routinely carries both.
#[derive(Debug, Default, PartialEq, Eq)]
struct HeaderCandidates {
    mailto: Option<String>,
    post: Option<String>,
}

/// Parse a `List-Unsubscribe` header value.
///
/// The header is a comma-separated list of angle-bracketed URIs, e.g.
/// `<https://example.com/u?id=1>, <mailto:unsub@example.com>`. Bare
/// entries without brackets show up in the wild and are accepted too;
/// anything with an unrecognized scheme is skipped.
fn parse_header_entries(header: &str) -> HeaderCandidates {
    let mut candidates = HeaderCandidates::default();

    for entry in header.split(',') {
        let entry = entry.trim();
        let entry = if entry.len() >= 2 && entry.starts_with('<') && entry.ends_with('>') {
            entry[1..entry.len() - 1].trim()
        } else {
            entry
        };

        let lower = entry.to_ascii_lowercase();
        if lower.starts_with("mailto:") {
            let address = entry["mailto:".len()..].trim();
            if candidates.mailto.is_none() && !address.is_empty() {
                candidates.mailto = Some(address.to_string());
            }
        } else if lower.starts_with("https://") || lower.starts_with("http://") {
            if candidates.post.is_none() {
                candidates.post = Some(entry.to_string());
            }
        }
    }

    candidates
}

static ANCHOR_RE: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"(?is)<a\s[^>]*href\s*=\s*["']([^"']+)["'][^>]*>(.*?)</a>"#)
        .expect("anchor regex is valid")
});

static TAG_RE: Lazy<Regex> = Lazy::new(|| Regex::new(r"(?s)<[^>]*>").expect("tag regex is valid"));

/// Find the first anchor whose visible text reads exactly "unsubscribe".
///
/// Nested tags inside the anchor are stripped before comparing, the
/// comparison ignores case and surrounding whitespace, and only http(s)
/// targets qualify since the link gets opened in a browser.
fn find_unsubscribe_anchor(body: &str) -> Option<String> {
    for capture in ANCHOR_RE.captures_iter(body) {
        let href = match capture.get(1) {
            Some(m) => m.as_str(),
            None => continue,
        };
        let inner = capture.get(2).map(|m| m.as_str()).unwrap_or("");
        let text = TAG_RE.replace_all(inner, "");
        let text = text.replace("&nbsp;", " ");

        if text.trim().eq_ignore_ascii_case("unsubscribe")
            && (href.starts_with("https://") || href.starts_with("http://"))
        {
            return Some(href.to_string());
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UnsubscribeError;
    use crate::models::MessageSummary;
    use async_trait::async_trait;
    use mockall::mock;
    use mockall::predicate::eq;

    mock! {
        Store {}

        #[async_trait]
        impl MailStore for Store {
            async fn list_message_ids(&self, query: &str, max_messages: usize) -> Result<Vec<String>>;
            async fn get_message_summary(&self, message_id: &str) -> Result<MessageSummary>;
            async fn get_unsubscribe_header(&self, message_id: &str) -> Result<Option<String>>;
            async fn get_message_body(&self, message_id: &str) -> Result<String>;
            async fn send_mail(&self, to: &str, subject: &str, body: &str) -> Result<()>;
            async fn post_to(&self, url: &str) -> Result<()>;
            async fn trash_messages(&self, sender_emails: &[String]) -> Result<u64>;
            async fn create_block_filter(&self, sender_email: &str) -> Result<String>;
        }
    }

    fn sender_with_message(email: &str, message_id: &str) -> Sender {
        let mut sender = Sender::new(email);
        sender.observe(message_id, None, None);
        sender
    }

    #[test]
    fn test_parse_header_both_candidates() {
        let parsed = parse_header_entries(
            "<https://example.com/u?id=1>, <mailto:unsub@example.com>",
        );
        assert_eq!(parsed.post.as_deref(), Some("https://example.com/u?id=1"));
        assert_eq!(parsed.mailto.as_deref(), Some("unsub@example.com"));
    }

    #[test]
    fn test_parse_header_bare_entries() {
        let parsed = parse_header_entries("mailto:leave@example.com, http://example.com/out");
        assert_eq!(parsed.mailto.as_deref(), Some("leave@example.com"));
        assert_eq!(parsed.post.as_deref(), Some("http://example.com/out"));
    }

    #[test]
    fn test_parse_header_first_entry_wins() {
        let parsed = parse_header_entries(
            "<mailto:first@example.com>, <mailto:second@example.com>",
        );
        assert_eq!(parsed.mailto.as_deref(), Some("first@example.com"));
    }

    #[test]
    fn test_parse_header_scheme_case_insensitive() {
        let parsed = parse_header_entries("<MailTo:Unsub@Example.com>, <HTTPS://Example.com/u>");
        assert_eq!(parsed.mailto.as_deref(), Some("Unsub@Example.com"));
        assert_eq!(parsed.post.as_deref(), Some("HTTPS://Example.com/u"));
    }

    #[test]
    fn test_parse_header_skips_malformed_entries() {
        let parsed = parse_header_entries("<mailto:>, <ftp://example.com/u>, garbage, <>");
        assert_eq!(parsed, HeaderCandidates::default());
    }

    #[test]
    fn test_parse_header_keeps_mailto_query() {
        // The query survives parsing; the executor splits it off when sending
        let parsed = parse_header_entries("<mailto:unsub@example.com?subject=remove>");
        assert_eq!(
            parsed.mailto.as_deref(),
            Some("unsub@example.com?subject=remove")
        );
    }

    #[test]
    fn test_find_anchor_simple() {
        let body = r#"<p>Bye</p><a href="https://example.com/u">Unsubscribe</a>"#;
        assert_eq!(
            find_unsubscribe_anchor(body).as_deref(),
            Some("https://example.com/u")
        );
    }

    #[test]
    fn test_find_anchor_nested_tags_and_whitespace() {
        let body = r#"<a href='https://example.com/u'>
            <span style="color:gray"> UNSUBSCRIBE </span>
        </a>"#;
        assert_eq!(
            find_unsubscribe_anchor(body).as_deref(),
            Some("https://example.com/u")
        );
    }

    #[test]
    fn test_find_anchor_requires_exact_text() {
        let body = r#"<a href="https://example.com/u">click here to unsubscribe</a>"#;
        assert_eq!(find_unsubscribe_anchor(body), None);
    }

    #[test]
    fn test_find_anchor_first_match_wins() {
        let body = concat!(
            r#"<a href="https://example.com/promo">Shop now</a>"#,
            r#"<a href="https://example.com/u1">unsubscribe</a>"#,
            r#"<a href="https://example.com/u2">Unsubscribe</a>"#,
        );
        assert_eq!(
            find_unsubscribe_anchor(body).as_deref(),
            Some("https://example.com/u1")
        );
    }

    #[test]
    fn test_find_anchor_ignores_non_http_targets() {
        let body = r#"<a href="mailto:unsub@example.com">unsubscribe</a>"#;
        assert_eq!(find_unsubscribe_anchor(body), None);
    }

    #[test]
    fn test_find_anchor_nbsp_text() {
        let body = r#"<a href="https://example.com/u">&nbsp;Unsubscribe&nbsp;</a>"#;
        assert_eq!(
            find_unsubscribe_anchor(body).as_deref(),
            Some("https://example.com/u")
        );
    }

    #[tokio::test]
    async fn test_resolve_mailto_wins_without_body_fetch() {
        let mut store = MockStore::new();
        store
            .expect_get_unsubscribe_header()
            .with(eq("msg-1"))
            .times(1)
            .returning(|_| {
                Ok(Some(
                    "<https://example.com/u>, <mailto:unsub@example.com>".to_string(),
                ))
            });
        // No body expectation: reaching for the body here would be a bug

        let resolver = UnsubscribeMethodResolver::new(store);
        let sender = sender_with_message("news@example.com", "msg-1");

        let method = resolver.resolve(&sender).await.unwrap();
        assert_eq!(
            method,
            UnsubscribeMethod::Mailto("unsub@example.com".to_string())
        );
    }

    #[tokio::test]
    async fn test_resolve_body_link_beats_post() {
        let mut store = MockStore::new();
        store
            .expect_get_unsubscribe_header()
            .returning(|_| Ok(Some("<https://example.com/post>".to_string())));
        store
            .expect_get_message_body()
            .with(eq("msg-1"))
            .returning(|_| {
                Ok(r#"<a href="https://example.com/page">unsubscribe</a>"#.to_string())
            });

        let resolver = UnsubscribeMethodResolver::new(store);
        let sender = sender_with_message("news@example.com", "msg-1");

        let method = resolver.resolve(&sender).await.unwrap();
        assert_eq!(
            method,
            UnsubscribeMethod::ClickLink("https://example.com/page".to_string())
        );
    }

    #[tokio::test]
    async fn test_resolve_post_when_nothing_better() {
        let mut store = MockStore::new();
        store
            .expect_get_unsubscribe_header()
            .returning(|_| Ok(Some("<https://example.com/post>".to_string())));
        store
            .expect_get_message_body()
            .returning(|_| Ok("<p>no links here</p>".to_string()));

        let resolver = UnsubscribeMethodResolver::new(store);
        let sender = sender_with_message("news@example.com", "msg-1");

        let method = resolver.resolve(&sender).await.unwrap();
        assert_eq!(
            method,
            UnsubscribeMethod::Post("https://example.com/post".to_string())
        );
    }

    #[tokio::test]
    async fn test_resolve_body_link_without_header() {
        let mut store = MockStore::new();
        store
            .expect_get_unsubscribe_header()
            .returning(|_| Ok(None));
        store.expect_get_message_body().returning(|_| {
            Ok(r#"Footer: <a href="http://example.com/out">Unsubscribe</a>"#.to_string())
        });

        let resolver = UnsubscribeMethodResolver::new(store);
        let sender = sender_with_message("news@example.com", "msg-1");

        let method = resolver.resolve(&sender).await.unwrap();
        assert_eq!(
            method,
            UnsubscribeMethod::ClickLink("http://example.com/out".to_string())
        );
    }

    #[tokio::test]
    async fn test_resolve_nothing_found() {
        let mut store = MockStore::new();
        store
            .expect_get_unsubscribe_header()
            .returning(|_| Ok(None));
        store
            .expect_get_message_body()
            .returning(|_| Ok("<p>plain newsletter</p>".to_string()));

        let resolver = UnsubscribeMethodResolver::new(store);
        let sender = sender_with_message("news@example.com", "msg-1");

        let method = resolver.resolve(&sender).await.unwrap();
        assert_eq!(method, UnsubscribeMethod::None);
    }

    #[tokio::test]
    async fn test_resolve_without_message_skips_store() {
        let store = MockStore::new();
        let resolver = UnsubscribeMethodResolver::new(store);
        let sender = Sender::new("empty@example.com");

        let method = resolver.resolve(&sender).await.unwrap();
        assert_eq!(method, UnsubscribeMethod::None);
    }

    #[tokio::test]
    async fn test_resolve_degrades_on_missing_message() {
        let mut store = MockStore::new();
        store
            .expect_get_unsubscribe_header()
            .returning(|_| Err(UnsubscribeError::MessageNotFound("msg-1".to_string())));
        store
            .expect_get_message_body()
            .returning(|_| Err(UnsubscribeError::MessageNotFound("msg-1".to_string())));

        let resolver = UnsubscribeMethodResolver::new(store);
        let sender = sender_with_message("news@example.com", "msg-1");

        let method = resolver.resolve(&sender).await.unwrap();
        assert_eq!(method, UnsubscribeMethod::None);
    }

    #[tokio::test]
    async fn test_resolve_propagates_auth_error() {
        let mut store = MockStore::new();
        store
            .expect_get_unsubscribe_header()
            .returning(|_| Err(UnsubscribeError::AuthError("token expired".to_string())));

        let resolver = UnsubscribeMethodResolver::new(store);
        let sender = sender_with_message("news@example.com", "msg-1");

        let result = resolver.resolve(&sender).await;
        assert!(matches!(result, Err(UnsubscribeError::AuthError(_))));
    }

    #[tokio::test]
    async fn test_resolve_is_repeatable() {
        let mut store = MockStore::new();
        store
            .expect_get_unsubscribe_header()
            .times(2)
            .returning(|_| Ok(Some("<mailto:unsub@example.com>".to_string())));

        let resolver = UnsubscribeMethodResolver::new(store);
        let sender = sender_with_message("news@example.com", "msg-1");

        let first = resolver.resolve(&sender).await.unwrap();
        let second = resolver.resolve(&sender).await.unwrap();
        assert_eq!(first, second);
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Header values arrive straight off the wire, so the parser has
            // to stay total over arbitrary input.
            #[test]
            fn parse_header_never_panics(header in ".*") {
                let parsed = parse_header_entries(&header);
                if let Some(mailto) = parsed.mailto {
                    prop_assert!(!mailto.is_empty());
                    prop_assert_eq!(mailto.trim(), mailto.as_str());
                }
                if let Some(post) = parsed.post {
                    let lower = post.to_ascii_lowercase();
                    prop_assert!(lower.starts_with("https://") || lower.starts_with("http://"));
                }
            }

            #[test]
            fn parse_header_extracts_bracketed_mailto(
                addr in "[a-z]{1,12}@[a-z]{1,12}\\.[a-z]{2,4}",
            ) {
                let parsed = parse_header_entries(&format!("<mailto:{}>", addr));
                prop_assert_eq!(parsed.mailto.as_deref(), Some(addr.as_str()));
            }

            #[test]
            fn parse_header_extracts_both_regardless_of_order(
                addr in "[a-z]{1,12}@[a-z]{1,12}\\.[a-z]{2,4}",
                url in "https://[a-z]{1,12}\\.example\\.com/[a-z0-9]{0,16}",
                mailto_first in proptest::bool::ANY,
            ) {
                let header = if mailto_first {
                    format!("<mailto:{}>, <{}>", addr, url)
                } else {
                    format!("<{}>, <mailto:{}>", url, addr)
                };
                let parsed = parse_header_entries(&header);
                prop_assert_eq!(parsed.mailto.as_deref(), Some(addr.as_str()));
                prop_assert_eq!(parsed.post.as_deref(), Some(url.as_str()));
            }

            #[test]
            fn anchor_scan_never_panics(body in ".*") {
                if let Some(href) = find_unsubscribe_anchor(&body) {
                    prop_assert!(
                        href.starts_with("https://") || href.starts_with("http://")
                    );
                }
            }

            #[test]
            fn anchor_found_in_generated_footer(
                url in "https://[a-z]{1,12}\\.example\\.com/[a-z0-9]{0,16}",
                filler in "[ -~]{0,64}",
            ) {
                // Quotes or angle brackets in the filler would change the
                // markup, so keep it to text content.
                let filler = filler.replace(['<', '>', '"', '\''], " ");
                let body = format!(
                    "<p>{}</p><a href=\"{}\">Unsubscribe</a>",
                    filler, url
                );
                let found = find_unsubscribe_anchor(&body);
                prop_assert_eq!(found.as_deref(), Some(url.as_str()));
            }
        }
    }
}
