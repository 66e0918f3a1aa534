//! The unsubscribe workflow state machine.
//!
//! [`UnsubscribeWorkflow`] drives one batch of selected senders end to
//! end: resolve and auto-execute everything that can be automated, walk
//! the senders that need a manual click-through, walk the senders with
//! no unsubscribe path at all (offering a block filter instead), then
//! perform the optional bulk delete and bulk block before finishing.
//! The UI stays behind the [`WorkflowUi`] trait and observes progress
//! through [`WorkflowState`] snapshots, so the machine itself runs the
//! same against a terminal or a test mock.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use serde::{Deserialize, Serialize};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::client::MailStore;
use crate::config::Config;
use crate::coordinator::{BatchActionCoordinator, BatchOutcome, CancelHandle, StepSignal};
use crate::error::{Result, UnsubscribeError};
use crate::executor::AutoUnsubscribeExecutor;
use crate::models::{SelectedSender, Sender, UnsubscribeMethod};
use crate::resolver::UnsubscribeMethodResolver;

/// Phase of the in-progress unsubscribe batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowPhase {
    Idle,
    AutoRunning,
    ManualLinkStep,
    BlockOfferStep,
    Deleting,
    Blocking,
    Success,
    Error,
}

impl fmt::Display for WorkflowPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            WorkflowPhase::Idle => "idle",
            WorkflowPhase::AutoRunning => "auto-running",
            WorkflowPhase::ManualLinkStep => "manual-link-step",
            WorkflowPhase::BlockOfferStep => "block-offer-step",
            WorkflowPhase::Deleting => "deleting",
            WorkflowPhase::Blocking => "blocking",
            WorkflowPhase::Success => "success",
            WorkflowPhase::Error => "error",
        };
        write!(f, "{}", name)
    }
}

/// Per-run toggles, captured before the run starts and immutable during it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkflowOptions {
    pub delete_after: bool,
    pub block_after: bool,
}

impl Default for WorkflowOptions {
    fn default() -> Self {
        Self {
            delete_after: true,
            block_after: false,
        }
    }
}

/// A sender waiting in the manual click-through queue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingLink {
    pub email: String,
    pub url: String,
}

/// Snapshot of the workflow, cloned out to the observer after every
/// transition (including cursor movement within the manual phases).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowState {
    pub phase: WorkflowPhase,
    /// Senders needing a manual click-through, in selection order.
    pub pending_link: Vec<PendingLink>,
    /// Senders with no unsubscribe path, in selection order.
    pub pending_block: Vec<String>,
    /// Position within whichever pending queue is active.
    pub cursor: usize,
    pub auto_succeeded: Vec<String>,
    pub options: WorkflowOptions,
    pub error: Option<String>,
}

impl WorkflowState {
    pub fn new(options: WorkflowOptions) -> Self {
        Self {
            phase: WorkflowPhase::Idle,
            pending_link: Vec::new(),
            pending_block: Vec::new(),
            cursor: 0,
            auto_succeeded: Vec::new(),
            options,
            error: None,
        }
    }
}

/// User decision at a manual click-through step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkGate {
    Continue,
    Cancel,
}

/// User decision at a block-offer step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockGate {
    Block,
    Skip,
    Cancel,
}

/// Presentation seam consumed by the workflow.
///
/// The manual phases wait indefinitely on the gate methods; there is no
/// timeout. `clear_selection` and `request_refresh` run once at the end
/// of a successful batch.
#[async_trait]
pub trait WorkflowUi: Send + Sync {
    /// Fire-and-forget: open `url` for the user (a browser tab in the
    /// terminal implementation).
    async fn open_link(&self, url: &str);

    /// Block until the user has dealt with the currently open link.
    async fn wait_link_gate(
        &self,
        position: usize,
        total: usize,
        sender: &str,
        url: &str,
    ) -> LinkGate;

    /// Block until the user decides whether to block `sender`.
    async fn wait_block_gate(&self, position: usize, total: usize, sender: &str) -> BlockGate;

    /// Drop the live selection after a successful run.
    async fn clear_selection(&self);

    /// Ask the presentation layer to re-aggregate senders.
    async fn request_refresh(&self);
}

/// How a finished run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WorkflowOutcome {
    Completed,
    Cancelled,
}

impl fmt::Display for WorkflowOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            WorkflowOutcome::Completed => write!(f, "completed"),
            WorkflowOutcome::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Summary of one workflow run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub duration_seconds: u64,
    pub outcome: WorkflowOutcome,
    pub selected: usize,
    pub auto_unsubscribed: usize,
    pub links_opened: usize,
    pub blocked: usize,
    pub skipped: usize,
    pub messages_trashed: u64,
    pub filters_created: usize,
}

impl WorkflowReport {
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();

        md.push_str("# Unsubscribe Run Report\n\n");
        md.push_str(&format!(
            "Generated: {}\n\n",
            self.finished_at.format("%Y-%m-%d %H:%M:%S")
        ));

        md.push_str("## Summary\n\n");
        md.push_str(&format!("- **Run ID:** {}\n", self.run_id));
        md.push_str(&format!("- **Outcome:** {}\n", self.outcome));
        md.push_str(&format!("- **Senders selected:** {}\n", self.selected));
        md.push_str(&format!(
            "- **Auto-unsubscribed:** {}\n",
            self.auto_unsubscribed
        ));
        md.push_str(&format!("- **Manual links opened:** {}\n", self.links_opened));
        md.push_str(&format!("- **Blocked at offer:** {}\n", self.blocked));
        md.push_str(&format!("- **Skipped at offer:** {}\n", self.skipped));
        md.push_str(&format!(
            "- **Messages trashed:** {}\n",
            self.messages_trashed
        ));
        md.push_str(&format!(
            "- **Block filters created:** {}\n",
            self.filters_created
        ));
        md.push_str(&format!(
            "- **Processing time:** {} minutes {} seconds\n",
            self.duration_seconds / 60,
            self.duration_seconds % 60
        ));

        md
    }

    /// Save the markdown rendering to disk.
    pub async fn save(&self, path: &Path) -> Result<()> {
        tokio::fs::write(path, self.to_markdown()).await?;
        info!("Run report saved to {:?}", path);
        Ok(())
    }
}

type Observer = Box<dyn Fn(&WorkflowState) + Send + Sync>;

/// The batch unsubscribe state machine.
pub struct UnsubscribeWorkflow<S, U> {
    store: Arc<S>,
    ui: U,
    resolver: UnsubscribeMethodResolver<Arc<S>>,
    executor: AutoUnsubscribeExecutor<Arc<S>>,
    senders: HashMap<String, Sender>,
    resolve_concurrency: usize,
    halt_on_block_failure: bool,
    cancel: CancelHandle,
    observer: Option<Observer>,
    state: WorkflowState,
}

impl<S, U> UnsubscribeWorkflow<S, U>
where
    S: MailStore + 'static,
    U: WorkflowUi,
{
    /// Build a workflow over an aggregation pass.
    ///
    /// `senders` is the aggregated sender index; selected senders are
    /// looked up in it to find the newest message to probe. A selected
    /// sender missing from the index resolves to no method and lands in
    /// the block-offer queue.
    pub fn new(store: Arc<S>, ui: U, senders: Vec<Sender>, config: &Config) -> Self {
        let resolver = UnsubscribeMethodResolver::new(Arc::clone(&store));
        let executor = AutoUnsubscribeExecutor::new(
            Arc::clone(&store),
            config.unsubscribe.mail_subject.clone(),
            config.unsubscribe.mail_body.clone(),
        );
        let senders = senders
            .into_iter()
            .map(|s| (s.email.clone(), s))
            .collect();

        Self {
            store,
            ui,
            resolver,
            executor,
            senders,
            resolve_concurrency: config.unsubscribe.resolve_concurrency.max(1),
            halt_on_block_failure: config.actions.halt_on_block_failure,
            cancel: CancelHandle::new(),
            observer: None,
            state: WorkflowState::new(WorkflowOptions::default()),
        }
    }

    /// Register a callback that receives a state snapshot after every
    /// transition.
    pub fn set_observer<F>(&mut self, observer: F)
    where
        F: Fn(&WorkflowState) + Send + Sync + 'static,
    {
        self.observer = Some(Box::new(observer));
    }

    /// Handle for cancelling the run from outside (e.g. Ctrl-C).
    pub fn cancel_handle(&self) -> CancelHandle {
        self.cancel.clone()
    }

    pub fn state(&self) -> &WorkflowState {
        &self.state
    }

    /// Run the full workflow against a selection snapshot.
    ///
    /// The snapshot is captured by the caller before any async work
    /// begins; later mutations of the live selection do not affect the
    /// run. Returns the run report on completion or cancellation; fatal
    /// store errors leave the machine in [`WorkflowPhase::Error`] and
    /// surface as `Err`.
    pub async fn run(
        &mut self,
        selection: Vec<SelectedSender>,
        options: WorkflowOptions,
    ) -> Result<WorkflowReport> {
        if selection.is_empty() {
            return Err(UnsubscribeError::WorkflowError(
                "cannot start a run with an empty selection".to_string(),
            ));
        }

        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        let clock = Instant::now();

        info!(
            "Starting unsubscribe run {} for {} senders (delete_after={}, block_after={})",
            run_id,
            selection.len(),
            options.delete_after,
            options.block_after
        );

        let mut report = WorkflowReport {
            run_id,
            started_at,
            finished_at: started_at,
            duration_seconds: 0,
            outcome: WorkflowOutcome::Completed,
            selected: selection.len(),
            auto_unsubscribed: 0,
            links_opened: 0,
            blocked: 0,
            skipped: 0,
            messages_trashed: 0,
            filters_created: 0,
        };

        self.state = WorkflowState::new(options);
        self.set_phase(WorkflowPhase::AutoRunning);

        let auto_done = match self.run_auto(&selection).await {
            Ok(done) => done,
            Err(e) => return Err(self.fail(e)),
        };
        report.auto_unsubscribed = self.state.auto_succeeded.len();
        if !auto_done {
            return Ok(self.wind_down_cancelled(report, clock));
        }

        if !self.state.pending_link.is_empty() {
            let (outcome, opened) = self.run_link_phase().await;
            report.links_opened = opened;
            if outcome == BatchOutcome::Cancelled {
                return Ok(self.wind_down_cancelled(report, clock));
            }
        }

        if !self.state.pending_block.is_empty() {
            let (outcome, blocked) = match self.run_block_phase().await {
                Ok(result) => result,
                Err(e) => return Err(self.fail(e)),
            };
            report.blocked = blocked;
            report.skipped = self.state.cursor.saturating_sub(blocked);
            report.filters_created += blocked;
            if outcome == BatchOutcome::Cancelled {
                return Ok(self.wind_down_cancelled(report, clock));
            }
        }

        // Last chance for an external cancel before irreversible bulk work.
        if self.cancel.is_cancelled() {
            return Ok(self.wind_down_cancelled(report, clock));
        }

        if options.delete_after {
            self.set_phase(WorkflowPhase::Deleting);
            let emails: Vec<String> = selection.iter().map(|s| s.email.clone()).collect();
            match self.store.trash_messages(&emails).await {
                Ok(count) => {
                    info!("Trashed {} messages across {} senders", count, emails.len());
                    report.messages_trashed = count;
                }
                Err(e) => return Err(self.fail(e)),
            }
        }

        if options.block_after {
            self.set_phase(WorkflowPhase::Blocking);
            for sender in &selection {
                match self.store.create_block_filter(&sender.email).await {
                    Ok(filter_id) => {
                        debug!("Created block filter {} for {}", filter_id, sender.email);
                        report.filters_created += 1;
                    }
                    Err(e) => return Err(self.fail(e)),
                }
            }
            info!("Created block filters for {} senders", selection.len());
        }

        self.set_phase(WorkflowPhase::Success);
        self.ui.clear_selection().await;
        self.ui.request_refresh().await;
        self.set_phase(WorkflowPhase::Idle);

        report.finished_at = Utc::now();
        report.duration_seconds = clock.elapsed().as_secs();
        info!(
            "Unsubscribe run {} completed in {}s: {} auto, {} links, {} blocked",
            report.run_id,
            report.duration_seconds,
            report.auto_unsubscribed,
            report.links_opened,
            report.blocked
        );
        Ok(report)
    }

    /// Resolve and auto-execute every selected sender.
    ///
    /// Senders are processed through an ordered buffered stream so the
    /// pending queues come out in selection order even though network
    /// probes overlap. Returns `Ok(false)` when an external cancel
    /// stopped the phase early.
    async fn run_auto(&mut self, selection: &[SelectedSender]) -> Result<bool> {
        let resolver = &self.resolver;
        let executor = &self.executor;

        let records: Vec<Sender> = selection
            .iter()
            .map(|s| match self.senders.get(&s.email) {
                Some(record) => record.clone(),
                None => {
                    warn!("{} not present in the aggregation index", s.email);
                    Sender::new(s.email.clone())
                }
            })
            .collect();

        let mut outcomes = futures::stream::iter(records.into_iter().map(|sender| async move {
            let method = resolver.resolve(&sender).await?;
            let auto_ok = if method.is_auto() {
                executor.execute_auto(&sender.email, &method).await
            } else {
                false
            };
            Ok::<(Sender, UnsubscribeMethod, bool), UnsubscribeError>((sender, method, auto_ok))
        }))
        .buffered(self.resolve_concurrency);

        while let Some(step) = outcomes.next().await {
            if self.cancel.is_cancelled() {
                return Ok(false);
            }
            let (sender, method, auto_ok) = step?;
            match method {
                UnsubscribeMethod::ClickLink(url) => {
                    self.state.pending_link.push(PendingLink {
                        email: sender.email,
                        url,
                    });
                }
                UnsubscribeMethod::Mailto(_) | UnsubscribeMethod::Post(_) if auto_ok => {
                    self.state.auto_succeeded.push(sender.email);
                }
                // A failed auto attempt is demoted rather than dropped,
                // same as a sender with nothing to act on.
                _ => {
                    self.state.pending_block.push(sender.email);
                }
            }
        }

        info!(
            "Classification complete: {} auto-succeeded, {} need a link, {} have no method",
            self.state.auto_succeeded.len(),
            self.state.pending_link.len(),
            self.state.pending_block.len()
        );
        Ok(true)
    }

    /// Walk the click-through queue one sender at a time.
    ///
    /// Returns the batch outcome and the number of links opened.
    async fn run_link_phase(&mut self) -> (BatchOutcome, usize) {
        self.state.cursor = 0;
        self.set_phase(WorkflowPhase::ManualLinkStep);

        let queue = self.state.pending_link.clone();
        let total = queue.len();
        let ui = &self.ui;
        let observer = &self.observer;
        let state_base = self.state.clone();
        let opened = AtomicUsize::new(0);

        let mut coordinator = BatchActionCoordinator::with_cancel(queue, self.cancel.clone());
        let outcome = coordinator
            .run(|position, link: PendingLink| {
                let state_base = &state_base;
                let opened = &opened;
                async move {
                    opened.fetch_add(1, Ordering::SeqCst);
                    ui.open_link(&link.url).await;
                    match ui.wait_link_gate(position, total, &link.email, &link.url).await {
                        LinkGate::Continue => {
                            notify_step(observer, state_base, position + 1);
                            StepSignal::Advance
                        }
                        LinkGate::Cancel => StepSignal::Cancel,
                    }
                }
            })
            .await;

        self.state.cursor = coordinator.position();
        (outcome, opened.load(Ordering::SeqCst))
    }

    /// Walk the block-offer queue one sender at a time.
    ///
    /// Returns the batch outcome and how many senders were blocked.
    /// Filter-creation failures log and advance unless
    /// `halt_on_block_failure` is set (or the error is fatal), in which
    /// case the failure aborts the run.
    async fn run_block_phase(&mut self) -> Result<(BatchOutcome, usize)> {
        self.state.cursor = 0;
        self.set_phase(WorkflowPhase::BlockOfferStep);

        let queue = self.state.pending_block.clone();
        let total = queue.len();
        let ui = &self.ui;
        let store = &self.store;
        let observer = &self.observer;
        let state_base = self.state.clone();
        let halt_on_failure = self.halt_on_block_failure;

        let blocked = AtomicUsize::new(0);
        let fatal: Mutex<Option<UnsubscribeError>> = Mutex::new(None);

        let mut coordinator = BatchActionCoordinator::with_cancel(queue, self.cancel.clone());
        let outcome = coordinator
            .run(|position, email: String| {
                let state_base = &state_base;
                let blocked = &blocked;
                let fatal = &fatal;
                async move {
                    match ui.wait_block_gate(position, total, &email).await {
                        BlockGate::Cancel => return StepSignal::Cancel,
                        BlockGate::Skip => {
                            debug!("User skipped blocking {}", email);
                        }
                        BlockGate::Block => match store.create_block_filter(&email).await {
                            Ok(filter_id) => {
                                info!("Created block filter {} for {}", filter_id, email);
                                blocked.fetch_add(1, Ordering::SeqCst);
                            }
                            Err(e) if halt_on_failure || e.is_fatal() => {
                                *fatal.lock().await = Some(e);
                                return StepSignal::Cancel;
                            }
                            Err(e) => {
                                warn!("Could not create block filter for {}: {}", email, e);
                            }
                        },
                    }
                    notify_step(observer, state_base, position + 1);
                    StepSignal::Advance
                }
            })
            .await;

        self.state.cursor = coordinator.position();
        if let Some(e) = fatal.into_inner() {
            return Err(e);
        }
        Ok((outcome, blocked.load(Ordering::SeqCst)))
    }

    /// Discard the pending queues and reset to idle after a cancel.
    ///
    /// Nothing that already executed is undone; nothing further runs.
    fn wind_down_cancelled(&mut self, mut report: WorkflowReport, clock: Instant) -> WorkflowReport {
        self.cancel.cancel();
        self.state.pending_link.clear();
        self.state.pending_block.clear();
        self.state.cursor = 0;
        self.set_phase(WorkflowPhase::Idle);

        report.outcome = WorkflowOutcome::Cancelled;
        report.finished_at = Utc::now();
        report.duration_seconds = clock.elapsed().as_secs();
        info!("Unsubscribe run {} cancelled by user", report.run_id);
        report
    }

    /// Record a fatal error and park the machine in the terminal error
    /// phase. The caller returns the error from `run`.
    fn fail(&mut self, err: UnsubscribeError) -> UnsubscribeError {
        self.state.error = Some(err.to_string());
        self.set_phase(WorkflowPhase::Error);
        err
    }

    fn set_phase(&mut self, phase: WorkflowPhase) {
        self.state.phase = phase;
        info!("Workflow phase changed to {}", phase);
        self.notify();
    }

    fn notify(&self) {
        if let Some(observer) = &self.observer {
            observer(&self.state);
        }
    }
}

/// Emit a cursor-advance snapshot from inside a coordinator handler.
fn notify_step(observer: &Option<Observer>, base: &WorkflowState, cursor: usize) {
    if let Some(cb) = observer {
        let mut snapshot = base.clone();
        snapshot.cursor = cursor;
        cb(&snapshot);
    }
}
