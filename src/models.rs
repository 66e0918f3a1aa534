use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A sender aggregated from the inbox: the unit of bulk action.
///
/// Built during one aggregation pass and replaced wholesale on the next.
/// `latest_message_id` points at the newest message seen for this sender
/// and is what the resolver probes for unsubscribe data.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    pub email: String,
    /// Display names observed for this address, insertion-ordered, deduplicated
    pub names: Vec<String>,
    pub message_count: u64,
    pub latest_message_id: Option<String>,
    pub last_seen: Option<DateTime<Utc>>,
}

impl Sender {
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            email: email.into(),
            names: Vec::new(),
            message_count: 0,
            latest_message_id: None,
            last_seen: None,
        }
    }

    /// Fold one observed message into the aggregate. Count and names grow
    /// monotonically; the latest-message reference follows the newest date.
    /// Undated messages seed the reference but never displace it.
    pub fn observe(
        &mut self,
        message_id: &str,
        date: Option<DateTime<Utc>>,
        name: Option<&str>,
    ) {
        self.message_count += 1;

        if let Some(name) = name {
            let name = name.trim();
            if !name.is_empty() && !self.names.iter().any(|n| n == name) {
                self.names.push(name.to_string());
            }
        }

        let newer = match (self.last_seen, date) {
            (None, Some(_)) => true,
            (None, None) => self.latest_message_id.is_none(),
            (Some(current), Some(candidate)) => candidate > current,
            (Some(_), None) => false,
        };
        if newer {
            self.latest_message_id = Some(message_id.to_string());
            if date.is_some() {
                self.last_seen = date;
            }
        }
    }

    /// Preferred human-readable name, falling back to the address itself
    pub fn display_name(&self) -> &str {
        self.names.first().map(String::as_str).unwrap_or(&self.email)
    }
}

/// Lightweight per-message record produced by the metadata scan,
/// consumed only by the aggregation fold.
#[derive(Debug, Clone)]
pub struct MessageSummary {
    pub id: String,
    pub sender_email: String,
    pub sender_name: Option<String>,
    pub date_received: Option<DateTime<Utc>>,
}

/// The unsubscribe mechanism resolved for one sender.
///
/// Exactly one variant per sender per resolution. Precedence when several
/// are discoverable: Mailto from the header, then a body click-link, then a
/// bare header POST target, then None.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum UnsubscribeMethod {
    /// Machine POST target from the List-Unsubscribe header
    Post(String),
    /// Machine-actionable address from the header, scheme already stripped
    Mailto(String),
    /// Human-only unsubscribe page from the message body
    ClickLink(String),
    /// No unsubscribe information found
    None,
}

impl UnsubscribeMethod {
    /// True for methods the executor can run without user interaction
    pub fn is_auto(&self) -> bool {
        matches!(self, UnsubscribeMethod::Post(_) | UnsubscribeMethod::Mailto(_))
    }

    /// Short tag used in logs and reports
    pub fn label(&self) -> &'static str {
        match self {
            UnsubscribeMethod::Post(_) => "post",
            UnsubscribeMethod::Mailto(_) => "mailto",
            UnsubscribeMethod::ClickLink(_) => "link",
            UnsubscribeMethod::None => "none",
        }
    }
}

/// One row of a frozen selection, carried through the workflow run
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SelectedSender {
    pub email: String,
    pub message_count: u64,
}

/// The user's current checkbox selection: sender email to message count.
///
/// Iteration preserves insertion order so downstream queues are
/// deterministic. Mutated only by the UI layer; the workflow takes a
/// `snapshot()` once at start and never looks back at the live set.
#[derive(Debug, Clone, Default)]
pub struct SelectionSet {
    order: Vec<String>,
    counts: HashMap<String, u64>,
}

impl SelectionSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or update a sender; first insertion fixes its position
    pub fn insert(&mut self, email: impl Into<String>, message_count: u64) {
        let email = email.into();
        if !self.counts.contains_key(&email) {
            self.order.push(email.clone());
        }
        self.counts.insert(email, message_count);
    }

    /// Flip membership; returns true when the sender is selected afterwards
    pub fn toggle(&mut self, email: &str, message_count: u64) -> bool {
        if self.counts.contains_key(email) {
            self.remove(email);
            false
        } else {
            self.insert(email.to_string(), message_count);
            true
        }
    }

    pub fn remove(&mut self, email: &str) -> bool {
        if self.counts.remove(email).is_some() {
            self.order.retain(|e| e != email);
            true
        } else {
            false
        }
    }

    pub fn clear(&mut self) {
        self.order.clear();
        self.counts.clear();
    }

    pub fn contains(&self, email: &str) -> bool {
        self.counts.contains_key(email)
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    /// Iterate in insertion order
    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.order
            .iter()
            .map(|email| (email.as_str(), self.counts[email]))
    }

    pub fn total_messages(&self) -> u64 {
        self.counts.values().sum()
    }

    /// Freeze the current selection into an owned, ordered copy.
    /// Later mutations of the live set do not affect the snapshot.
    pub fn snapshot(&self) -> Vec<SelectedSender> {
        self.iter()
            .map(|(email, message_count)| SelectedSender {
                email: email.to_string(),
                message_count,
            })
            .collect()
    }
}
