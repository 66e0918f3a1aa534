//! Sender aggregation over the inbox.
//!
//! One aggregation pass lists recent message ids, fetches their metadata
//! concurrently, and folds them into per-sender accumulators: observed
//! display names, message count, and the newest message id (the one the
//! resolver later probes for unsubscribe data). The result replaces any
//! previous pass wholesale.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};

use chrono::{Duration, Utc};
use futures::StreamExt;
use tracing::{info, warn};

use crate::client::MailStore;
use crate::config::ScanConfig;
use crate::error::Result;
use crate::models::{MessageSummary, Sender};

/// Builds the per-sender view of the inbox that selection and the
/// workflow operate on.
pub struct SenderAggregator<S> {
    store: S,
    period_days: u32,
    max_messages: usize,
    concurrent_fetches: usize,
}

impl<S: MailStore> SenderAggregator<S> {
    pub fn new(store: S, config: &ScanConfig) -> Self {
        Self {
            store,
            period_days: config.period_days,
            max_messages: config.max_messages,
            concurrent_fetches: config.max_concurrent_requests.max(1),
        }
    }

    /// Gmail search query for the configured scan window.
    pub fn scan_query(&self) -> String {
        let cutoff = Utc::now() - Duration::days(self.period_days as i64);
        format!("in:inbox after:{}", cutoff.format("%Y/%m/%d"))
    }

    /// Run one aggregation pass.
    ///
    /// `on_progress` is invoked with (fetched, total) as metadata fetches
    /// complete. Messages that fail to fetch are logged and skipped; the
    /// pass keeps going with the rest.
    pub async fn aggregate<F>(&self, on_progress: F) -> Result<Vec<Sender>>
    where
        F: Fn(usize, usize) + Send + Sync,
    {
        let query = self.scan_query();
        info!("Scanning inbox with query '{}'", query);

        let message_ids = self
            .store
            .list_message_ids(&query, self.max_messages)
            .await?;
        let total = message_ids.len();
        info!(
            "Fetching metadata for {} messages with {} concurrent workers",
            total, self.concurrent_fetches
        );

        let store = &self.store;
        let done = AtomicUsize::new(0);
        let summaries: Vec<Option<MessageSummary>> =
            futures::stream::iter(message_ids.into_iter().map(|id| {
                let on_progress = &on_progress;
                let done = &done;
                async move {
                    let summary = match store.get_message_summary(&id).await {
                        Ok(summary) => Some(summary),
                        Err(e) => {
                            warn!("Failed to fetch message {}: {}", id, e);
                            None
                        }
                    };
                    on_progress(done.fetch_add(1, Ordering::SeqCst) + 1, total);
                    summary
                }
            }))
            .buffer_unordered(self.concurrent_fetches)
            .collect()
            .await;

        let fetched = summaries.iter().filter(|s| s.is_some()).count();
        if fetched < total {
            warn!("Skipped {} messages that could not be fetched", total - fetched);
        }

        let senders = fold_into_senders(summaries.into_iter().flatten());
        info!(
            "Aggregation complete: {} senders across {} messages",
            senders.len(),
            fetched
        );
        Ok(senders)
    }
}

/// Fold message summaries into per-sender accumulators, sorted by
/// message count descending with email as the tie-break.
fn fold_into_senders(summaries: impl Iterator<Item = MessageSummary>) -> Vec<Sender> {
    let mut by_email: HashMap<String, Sender> = HashMap::new();

    for summary in summaries {
        if summary.sender_email.is_empty() {
            continue;
        }
        by_email
            .entry(summary.sender_email.clone())
            .or_insert_with(|| Sender::new(summary.sender_email.clone()))
            .observe(
                &summary.id,
                summary.date_received,
                summary.sender_name.as_deref(),
            );
    }

    let mut senders: Vec<Sender> = by_email.into_values().collect();
    senders.sort_by(|a, b| {
        b.message_count
            .cmp(&a.message_count)
            .then_with(|| a.email.cmp(&b.email))
    });
    senders
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::UnsubscribeError;
    use async_trait::async_trait;
    use chrono::TimeZone;
    use mockall::mock;

    mock! {
        Store {}

        #[async_trait]
        impl MailStore for Store {
            async fn list_message_ids(&self, query: &str, max_messages: usize) -> Result<Vec<String>>;
            async fn get_message_summary(&self, id: &str) -> Result<MessageSummary>;
            async fn get_unsubscribe_header(&self, id: &str) -> Result<Option<String>>;
            async fn get_message_body(&self, id: &str) -> Result<String>;
            async fn send_mail(&self, to: &str, subject: &str, body: &str) -> Result<()>;
            async fn post_to(&self, url: &str) -> Result<()>;
            async fn trash_messages(&self, sender_emails: &[String]) -> Result<u64>;
            async fn create_block_filter(&self, sender_email: &str) -> Result<String>;
        }
    }

    fn summary(id: &str, email: &str, name: Option<&str>, day: u32) -> MessageSummary {
        MessageSummary {
            id: id.to_string(),
            sender_email: email.to_string(),
            sender_name: name.map(String::from),
            date_received: Utc.with_ymd_and_hms(2024, 3, day, 12, 0, 0).single(),
        }
    }

    #[test]
    fn test_fold_counts_and_names() {
        let senders = fold_into_senders(
            vec![
                summary("m1", "news@daily.example.com", Some("Daily News"), 1),
                summary("m2", "news@daily.example.com", Some("Daily News Digest"), 3),
                summary("m3", "offers@shop.example.com", None, 2),
            ]
            .into_iter(),
        );

        assert_eq!(senders.len(), 2);
        let news = &senders[0];
        assert_eq!(news.email, "news@daily.example.com");
        assert_eq!(news.message_count, 2);
        assert_eq!(news.names, vec!["Daily News", "Daily News Digest"]);
    }

    #[test]
    fn test_fold_tracks_newest_message() {
        let senders = fold_into_senders(
            vec![
                summary("older", "news@daily.example.com", None, 5),
                summary("newest", "news@daily.example.com", None, 20),
                summary("middle", "news@daily.example.com", None, 10),
            ]
            .into_iter(),
        );

        assert_eq!(senders[0].latest_message_id.as_deref(), Some("newest"));
    }

    #[test]
    fn test_fold_sorts_by_count_then_email() {
        let senders = fold_into_senders(
            vec![
                summary("m1", "b@example.com", None, 1),
                summary("m2", "a@example.com", None, 1),
                summary("m3", "c@example.com", None, 1),
                summary("m4", "c@example.com", None, 2),
            ]
            .into_iter(),
        );

        let emails: Vec<&str> = senders.iter().map(|s| s.email.as_str()).collect();
        assert_eq!(emails, vec!["c@example.com", "a@example.com", "b@example.com"]);
    }

    #[test]
    fn test_fold_skips_empty_sender() {
        let senders = fold_into_senders(vec![summary("m1", "", None, 1)].into_iter());
        assert!(senders.is_empty());
    }

    #[test]
    fn test_scan_query_shape() {
        let aggregator = SenderAggregator::new(MockStore::new(), &ScanConfig::default());
        let query = aggregator.scan_query();
        assert!(query.starts_with("in:inbox after:"));
    }

    #[tokio::test]
    async fn test_aggregate_survives_fetch_failures() {
        let mut store = MockStore::new();
        store
            .expect_list_message_ids()
            .returning(|_, _| Ok(vec!["m1".to_string(), "m2".to_string(), "m3".to_string()]));
        store.expect_get_message_summary().returning(|id| {
            if id == "m2" {
                Err(UnsubscribeError::MessageNotFound("m2".to_string()))
            } else {
                Ok(MessageSummary {
                    id: id.to_string(),
                    sender_email: "news@daily.example.com".to_string(),
                    sender_name: None,
                    date_received: None,
                })
            }
        });

        let aggregator = SenderAggregator::new(store, &ScanConfig::default());
        let progress_calls = AtomicUsize::new(0);
        let senders = aggregator
            .aggregate(|_, _| {
                progress_calls.fetch_add(1, Ordering::SeqCst);
            })
            .await
            .unwrap();

        assert_eq!(senders.len(), 1);
        assert_eq!(senders[0].message_count, 2);
        assert_eq!(progress_calls.load(Ordering::SeqCst), 3);
    }
}
