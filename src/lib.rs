//! Gmail Unsubscriber
//!
//! A bulk unsubscribe tool for Gmail that scans the inbox, groups messages
//! by sender, and clears out mailing lists: automatically where the sender
//! supports one-click unsubscribe, guided where a browser visit is needed,
//! and with a block filter as the fallback for senders that offer nothing.
//!
//! # Overview
//!
//! This library provides a complete unsubscribe pipeline:
//! - **Authentication**: OAuth2 authentication with token caching
//! - **Aggregation**: Concurrent inbox scanning grouped by sender address
//! - **Resolution**: RFC 2369 / RFC 8058 header parsing with an HTML body fallback
//! - **Execution**: One-click POST and mailto unsubscribes without user involvement
//! - **Workflow**: A phased state machine that walks manual links and block offers
//! - **Cleanup**: Bulk trash and from: block filters for selected senders
//!
//! # Example Usage
//!
//! ```no_run
//! use gmail_unsubscriber::{auth, client::GmailMailStore, config::Config};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     // Load configuration
//!     let config = Config::load("config.toml".as_ref()).await?;
//!
//!     // Authenticate
//!     let hub = auth::authenticate(
//!         "credentials.json".as_ref(),
//!         ".gmail-unsubscriber/token.json".as_ref()
//!     ).await?;
//!
//!     // Create rate-limited store
//!     let store = Arc::new(GmailMailStore::new(
//!         hub,
//!         config.scan.max_concurrent_requests,
//!         config.unsubscribe.max_retries,
//!     )?);
//!
//!     // Use the store to scan, resolve and unsubscribe
//!     // ...
//!
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`aggregator`] - Inbox scanning and per-sender aggregation
//! - [`auth`] - OAuth2 authentication and Gmail API initialization
//! - [`cli`] - Command-line interface and pipeline orchestration
//! - [`client`] - Rate-limited Gmail API access behind the [`client::MailStore`] trait
//! - [`config`] - Configuration management
//! - [`coordinator`] - Ordered batch iteration with cancellation
//! - [`error`] - Error types and result aliases
//! - [`executor`] - Automatic unsubscribe execution (POST and mailto)
//! - [`interactive`] - Sender selection and raw-mode gate prompts
//! - [`models`] - Core data structures
//! - [`rate_limiter`] - Quota-aware token bucket for Gmail API calls
//! - [`resolver`] - List-Unsubscribe header and body link resolution
//! - [`workflow`] - The unsubscribe run state machine

pub mod aggregator;
pub mod auth;
pub mod cli;
pub mod client;
pub mod config;
pub mod coordinator;
pub mod error;
pub mod executor;
pub mod interactive;
pub mod models;
pub mod rate_limiter;
pub mod resolver;
pub mod workflow;

// Re-export commonly used types for convenience
pub use error::{Result, UnsubscribeError};

// Core data models
pub use models::{MessageSummary, SelectedSender, SelectionSet, Sender, UnsubscribeMethod};

// Gmail access
pub use client::{GmailMailStore, MailStore};

// Config types
pub use config::{ActionsConfig, Config, ScanConfig, UnsubscribeConfig};

// Aggregation and resolution
pub use aggregator::SenderAggregator;
pub use executor::AutoUnsubscribeExecutor;
pub use resolver::UnsubscribeMethodResolver;

// Workflow types
pub use workflow::{
    BlockGate, LinkGate, UnsubscribeWorkflow, WorkflowOptions, WorkflowOutcome, WorkflowPhase,
    WorkflowReport, WorkflowUi,
};

// Batch iteration and cancellation
pub use coordinator::{BatchActionCoordinator, BatchOutcome, CancelHandle, StepSignal};

// CLI types (for binary usage)
pub use cli::{Cli, Commands, ProgressReporter};

// Interactive terminal types
pub use interactive::TerminalUi;
