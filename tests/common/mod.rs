//! Common test utilities and fixtures

use chrono::{Duration, Utc};
use gmail_unsubscriber::client::MailStore;
use gmail_unsubscriber::error::Result;
use gmail_unsubscriber::models::{MessageSummary, SelectedSender, Sender};
use gmail_unsubscriber::workflow::{BlockGate, LinkGate, WorkflowUi};
use mockall::mock;

/// Create an aggregated sender whose newest message id is derived from the
/// address local part ("alice@shop.example.com" probes "m-alice")
pub fn create_test_sender(email: &str, message_count: u64) -> Sender {
    let local = email.split('@').next().unwrap_or("sender");
    Sender {
        email: email.to_string(),
        names: Vec::new(),
        message_count,
        latest_message_id: Some(format!("m-{}", local)),
        last_seen: Some(Utc::now()),
    }
}

/// Create a sender that also carries a display name
pub fn create_named_sender(email: &str, name: &str, message_count: u64) -> Sender {
    let mut sender = create_test_sender(email, message_count);
    sender.names.push(name.to_string());
    sender
}

/// Create a sender with no probe-able message at all
pub fn create_empty_sender(email: &str) -> Sender {
    Sender::new(email)
}

/// Freeze an aggregation result into selection rows, preserving order
pub fn selection_of(senders: &[Sender]) -> Vec<SelectedSender> {
    senders
        .iter()
        .map(|s| SelectedSender {
            email: s.email.clone(),
            message_count: s.message_count,
        })
        .collect()
}

/// List-Unsubscribe header value carrying only a mailto entry
pub fn mailto_header(address: &str) -> String {
    format!("<mailto:{}>", address)
}

/// List-Unsubscribe header value carrying only an HTTPS entry
pub fn post_header(url: &str) -> String {
    format!("<{}>", url)
}

/// Header carrying both a POST URL and a mailto entry, URL first as most
/// real newsletters send it
pub fn dual_header(url: &str, address: &str) -> String {
    format!("<{}>, <mailto:{}>", url, address)
}

/// Minimal HTML body whose footer carries an unsubscribe anchor
pub fn body_with_link(url: &str) -> String {
    format!(
        "<html><body><p>This week in widgets.</p>\
         <footer><a href=\"{}\">Unsubscribe</a></footer></body></html>",
        url
    )
}

/// HTML body without any unsubscribe affordance
pub fn body_without_link() -> String {
    "<html><body><p>This week in widgets.</p></body></html>".to_string()
}

/// Summary as the metadata scan would produce it
pub fn message_summary(id: &str, email: &str, name: Option<&str>, days_ago: i64) -> MessageSummary {
    MessageSummary {
        id: id.to_string(),
        sender_email: email.to_string(),
        sender_name: name.map(|n| n.to_string()),
        date_received: Some(Utc::now() - Duration::days(days_ago)),
    }
}

// Mock implementation of MailStore for testing
mock! {
    pub MailStore {}

    #[async_trait::async_trait]
    impl MailStore for MailStore {
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

// Mock implementation of the workflow presentation seam
mock! {
    pub WorkflowUi {}

    #[async_trait::async_trait]
    impl WorkflowUi for WorkflowUi {
        async fn open_link(&self, url: &str);
        async fn wait_link_gate(
            &self,
            position: usize,
            total: usize,
            sender: &str,
            url: &str,
        ) -> LinkGate;
        async fn wait_block_gate(&self, position: usize, total: usize, sender: &str) -> BlockGate;
        async fn clear_selection(&self);
        async fn request_refresh(&self);
    }
}

/// UI mock with the end-of-run notifications stubbed out, ready for
/// per-test gate expectations
pub fn quiet_ui() -> MockWorkflowUi {
    let mut ui = MockWorkflowUi::new();
    ui.expect_clear_selection().return_const(());
    ui.expect_request_refresh().return_const(());
    ui
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_create_test_sender() {
        let sender = create_test_sender("alice@shop.example.com", 32);
        assert_eq!(sender.email, "alice@shop.example.com");
        assert_eq!(sender.message_count, 32);
        assert_eq!(sender.latest_message_id.as_deref(), Some("m-alice"));
    }

    #[test]
    fn test_create_named_sender() {
        let sender = create_named_sender("news@example.com", "Example News", 5);
        assert_eq!(sender.display_name(), "Example News");
    }

    #[test]
    fn test_selection_preserves_order() {
        let senders = vec![
            create_test_sender("carol@example.com", 12),
            create_test_sender("alice@example.com", 32),
        ];
        let selection = selection_of(&senders);
        assert_eq!(selection[0].email, "carol@example.com");
        assert_eq!(selection[1].email, "alice@example.com");
        assert_eq!(selection[1].message_count, 32);
    }

    #[test]
    fn test_header_builders() {
        assert_eq!(
            mailto_header("leave@example.com"),
            "<mailto:leave@example.com>"
        );
        assert_eq!(
            dual_header("https://example.com/u", "leave@example.com"),
            "<https://example.com/u>, <mailto:leave@example.com>"
        );
    }

    #[test]
    fn test_body_builders() {
        let body = body_with_link("https://example.com/u/1");
        assert!(body.contains("href=\"https://example.com/u/1\""));
        assert!(body.contains(">Unsubscribe<"));
        assert!(!body_without_link().contains("Unsubscribe"));
    }

    #[test]
    fn test_message_summary_fixture() {
        let summary = message_summary("m1", "news@example.com", Some("News"), 3);
        assert_eq!(summary.id, "m1");
        assert_eq!(summary.sender_name.as_deref(), Some("News"));
        assert!(summary.date_received.unwrap() < Utc::now());
    }
}
