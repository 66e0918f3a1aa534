//! Command-line interface

use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser, Debug)]
#[command(name = "gmail-unsubscriber")]
#[command(version = "0.3.1")]
#[command(about = "Bulk unsubscribe, delete and block for Gmail inboxes", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "config.toml")]
    pub config: PathBuf,

    /// Path to OAuth2 credentials file
    #[arg(long, default_value = "credentials.json")]
    pub credentials: PathBuf,

    /// Path to token cache file
    #[arg(long, default_value = ".gmail-unsubscriber/token.json")]
    pub token_cache: PathBuf,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Authenticate with the Gmail API
    Auth {
        /// Force re-authentication even if a cached token exists
        #[arg(long)]
        force: bool,
    },

    /// Scan the inbox and list senders by message volume
    List {
        /// Maximum number of senders to print
        #[arg(long, default_value_t = 50)]
        top: usize,
    },

    /// Run an interactive unsubscribe batch
    Run {
        /// Resolve unsubscribe methods only, make no changes
        #[arg(long)]
        dry_run: bool,

        /// Write the run report to this file instead of the default location
        #[arg(long)]
        report_file: Option<PathBuf>,
    },

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "config.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::time::Duration;

/// Truncate a string to max_len characters, adding "..." if truncated
fn truncate_string(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        format!(
            "{}...",
            s.chars().take(max_len.saturating_sub(3)).collect::<String>()
        )
    }
}

/// Progress reporter using indicatif
pub struct ProgressReporter {
    multi: MultiProgress,
    spinner_style: ProgressStyle,
    bar_style: ProgressStyle,
}

impl ProgressReporter {
    pub fn new() -> Self {
        Self::with_multi_progress(MultiProgress::new())
    }

    /// Build on an existing MultiProgress so log lines routed through it
    /// print above the bars instead of tearing them
    pub fn with_multi_progress(multi: MultiProgress) -> Self {
        // Use {elapsed} for human-readable format (e.g., "1s", "234ms")
        let spinner_style = ProgressStyle::default_spinner()
            .template("{spinner:.green} [{elapsed:>6}] {msg}")
            .unwrap()
            .tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ ");

        let bar_style = ProgressStyle::default_bar()
            .template("[{elapsed:>6}] {bar:40.cyan/blue} {pos:>7}/{len:7} {msg}")
            .unwrap()
            .progress_chars("##-");

        Self {
            multi,
            spinner_style,
            bar_style,
        }
    }

    pub fn multi_progress(&self) -> &MultiProgress {
        &self.multi
    }

    pub fn add_spinner(&self, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new_spinner());
        pb.set_style(self.spinner_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    pub fn add_progress_bar(&self, len: u64, msg: &str) -> ProgressBar {
        let pb = self.multi.add(ProgressBar::new(len));
        pb.set_style(self.bar_style.clone());
        pb.set_message(msg.to_string());
        pb.enable_steady_tick(Duration::from_millis(100));
        pb
    }

    /// Finish a spinner and clear it from the multi-progress display
    pub fn finish_spinner(&self, pb: &ProgressBar, msg: &str) {
        pb.finish_and_clear();
        println!("  ✓ {}", msg);
    }
}

impl Default for ProgressReporter {
    fn default() -> Self {
        Self::new()
    }
}

/// Per-sender result of a dry-run resolution pass
#[derive(Debug, Clone)]
pub struct MethodPreview {
    pub email: String,
    pub message_count: u64,
    pub method: UnsubscribeMethod,
}

impl MethodPreview {
    /// Target the method would act on, empty for `None`
    pub fn target(&self) -> &str {
        match &self.method {
            UnsubscribeMethod::Post(url) => url,
            UnsubscribeMethod::Mailto(address) => address,
            UnsubscribeMethod::ClickLink(url) => url,
            UnsubscribeMethod::None => "",
        }
    }
}

/// What a real run would do per scanned sender
pub struct DryRunReport {
    pub generated_at: chrono::DateTime<chrono::Utc>,
    pub rows: Vec<MethodPreview>,
}

impl DryRunReport {
    pub fn count(&self, label: &str) -> usize {
        self.rows.iter().filter(|r| r.method.label() == label).count()
    }

    /// Generate Markdown report
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();

        md.push_str("# Unsubscribe Method Report (DRY RUN)\n\n");
        md.push_str("> No changes were made. This report shows how each sender would be handled.\n\n");
        md.push_str(&format!(
            "Generated: {}\n\n",
            self.generated_at.format("%Y-%m-%d %H:%M:%S")
        ));

        md.push_str("## Summary\n\n");
        md.push_str(&format!("- **Senders resolved:** {}\n", self.rows.len()));
        md.push_str(&format!(
            "- **Automatic (mailto):** {}\n",
            self.count("mailto")
        ));
        md.push_str(&format!("- **Automatic (post):** {}\n", self.count("post")));
        md.push_str(&format!("- **Manual link:** {}\n", self.count("link")));
        md.push_str(&format!(
            "- **No method (block offer):** {}\n\n",
            self.count("none")
        ));

        md.push_str("## Senders\n\n");
        md.push_str("| Sender | Messages | Method | Target |\n");
        md.push_str("|--------|----------|--------|--------|\n");
        for row in &self.rows {
            // Escape pipes so long URLs cannot break the table
            let target = row.target().replace('|', "\\|");
            md.push_str(&format!(
                "| {} | {} | {} | {} |\n",
                row.email,
                row.message_count,
                row.method.label(),
                target
            ));
        }
        md.push_str("\n---\n\n");
        md.push_str(
            "_To act on these senders, run the command again without the `--dry-run` flag._\n",
        );

        md
    }

    /// Save report to file
    pub async fn save(&self, path: &std::path::Path) -> Result<()> {
        tokio::fs::write(path, self.to_markdown()).await?;
        Ok(())
    }
}

use crate::aggregator::SenderAggregator;
use crate::auth;
use crate::client::GmailMailStore;
use crate::config::Config;
use crate::error::{Result, UnsubscribeError};
use crate::interactive::{self, TerminalUi};
use crate::models::{Sender, UnsubscribeMethod};
use crate::resolver::UnsubscribeMethodResolver;
use crate::workflow::{UnsubscribeWorkflow, WorkflowOptions, WorkflowOutcome, WorkflowReport};
use chrono::Utc;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Main orchestration function for the unsubscribe command
///
/// This function coordinates all modules to:
/// 1. Scan the inbox and aggregate messages by sender
/// 2. Let the user pick senders and run options
/// 3. Drive the unsubscribe workflow over the frozen selection
/// 4. Save the run report
///
/// A successful run requests a refresh, so the loop scans again with the
/// trashed messages gone; cancelled or empty selections end the loop.
///
/// # Arguments
/// * `cli` - CLI arguments containing configuration paths
/// * `dry_run` - If true, resolve methods only and make no changes
/// * `report_file` - Overrides the default report location
/// * `multi` - Shared MultiProgress also used by the log writer
pub async fn run_pipeline(
    cli: &Cli,
    dry_run: bool,
    report_file: Option<PathBuf>,
    multi: MultiProgress,
) -> Result<()> {
    let reporter = ProgressReporter::with_multi_progress(multi);

    // Step 1: Load configuration
    let config_spinner = reporter.add_spinner("Loading configuration...");
    let config = Config::load(&cli.config).await?;
    reporter.finish_spinner(
        &config_spinner,
        &format!("Configuration loaded from {:?}", cli.config),
    );

    // Step 2: Initialize Gmail API
    let auth_spinner = reporter.add_spinner("Authenticating with Gmail API...");
    let hub = auth::initialize_gmail_hub(&cli.credentials, &cli.token_cache).await?;
    reporter.finish_spinner(&auth_spinner, "Gmail API authenticated");

    // Step 3: Create the store with rate limiting
    let store = Arc::new(GmailMailStore::new(
        hub,
        config.scan.max_concurrent_requests,
        config.unsubscribe.max_retries,
    )?);

    if dry_run {
        return preview_methods(&reporter, store, &config, report_file).await;
    }

    loop {
        // Step 4: Aggregate senders
        let senders = scan_senders(&reporter, &store, &config).await?;
        if senders.is_empty() {
            println!("\nNo senders found in the scan window.");
            return Ok(());
        }

        print_sender_table(&senders, 20);

        // Step 5: Selection and options
        let selection = interactive::select_senders(&senders)?;
        if selection.is_empty() {
            println!("\nNothing selected.");
            return Ok(());
        }

        let defaults = WorkflowOptions {
            delete_after: config.actions.delete_after,
            block_after: config.actions.block_after,
        };
        let options = interactive::prompt_run_options(defaults)?;

        println!(
            "\nStarting unsubscribe run for {} senders ({} messages)...",
            selection.len(),
            selection.total_messages()
        );

        // Step 6: Freeze the selection and drive the workflow
        let snapshot = selection.snapshot();
        let refresh_requested = Arc::new(AtomicBool::new(false));
        let live_selection = Arc::new(tokio::sync::Mutex::new(selection));
        let ui = TerminalUi::new(Arc::clone(&live_selection), Arc::clone(&refresh_requested));

        let mut workflow = UnsubscribeWorkflow::new(Arc::clone(&store), ui, senders, &config);

        // Ctrl-C outside the raw-mode gates cancels at the next phase
        // boundary instead of killing the process mid-mutation
        let cancel = workflow.cancel_handle();
        let ctrl_c = tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                cancel.cancel();
            }
        });

        let run_result = workflow.run(snapshot, options).await;
        ctrl_c.abort();
        let report = run_result?;

        print_run_summary(&report);

        // Step 7: Save the report
        let report_path = report_file.clone().unwrap_or_else(|| {
            cli.token_cache
                .with_file_name(format!("report-{}.md", report.run_id))
        });
        if let Some(parent) = report_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        report.save(&report_path).await?;
        println!("Report saved to: {:?}", report_path);

        if report.outcome == WorkflowOutcome::Cancelled {
            println!("\nRun cancelled. No further changes were made.");
        }

        if !refresh_requested.load(Ordering::SeqCst) {
            return Ok(());
        }

        println!("\nRe-scanning the inbox...\n");
    }
}

/// List senders without touching anything
pub async fn run_list(cli: &Cli, top: usize, multi: MultiProgress) -> Result<()> {
    let reporter = ProgressReporter::with_multi_progress(multi);

    let config_spinner = reporter.add_spinner("Loading configuration...");
    let config = Config::load(&cli.config).await?;
    reporter.finish_spinner(
        &config_spinner,
        &format!("Configuration loaded from {:?}", cli.config),
    );

    let auth_spinner = reporter.add_spinner("Authenticating with Gmail API...");
    let hub = auth::initialize_gmail_hub(&cli.credentials, &cli.token_cache).await?;
    reporter.finish_spinner(&auth_spinner, "Gmail API authenticated");

    let store = Arc::new(GmailMailStore::new(
        hub,
        config.scan.max_concurrent_requests,
        config.unsubscribe.max_retries,
    )?);

    let senders = scan_senders(&reporter, &store, &config).await?;
    if senders.is_empty() {
        println!("\nNo senders found in the scan window.");
        return Ok(());
    }

    print_sender_table(&senders, top);
    println!(
        "\n{} senders, {} messages in total",
        senders.len(),
        senders.iter().map(|s| s.message_count).sum::<u64>()
    );

    Ok(())
}

/// Aggregate the inbox into a sender list with a progress bar.
/// The bar length is only known once the message listing finishes, so it
/// starts at zero and is stretched on the first progress callback.
async fn scan_senders(
    reporter: &ProgressReporter,
    store: &Arc<GmailMailStore>,
    config: &Config,
) -> Result<Vec<Sender>> {
    let aggregator = SenderAggregator::new(Arc::clone(store), &config.scan);

    let fetch_bar = reporter.add_progress_bar(0, "Scanning inbox...");
    let bar = fetch_bar.clone();
    let senders = aggregator
        .aggregate(move |fetched, total| {
            if bar.length() != Some(total as u64) {
                bar.set_length(total as u64);
            }
            bar.set_position(fetched as u64);
        })
        .await?;
    fetch_bar.finish_with_message(format!("Aggregated {} senders", senders.len()));

    Ok(senders)
}

/// Dry run: resolve the unsubscribe method for every scanned sender and
/// report the classification, touching nothing
async fn preview_methods(
    reporter: &ProgressReporter,
    store: Arc<GmailMailStore>,
    config: &Config,
    report_file: Option<PathBuf>,
) -> Result<()> {
    let senders = scan_senders(reporter, &store, config).await?;
    if senders.is_empty() {
        println!("\nNo senders found in the scan window.");
        return Ok(());
    }

    let resolver = UnsubscribeMethodResolver::new(Arc::clone(&store));
    let resolve_bar =
        reporter.add_progress_bar(senders.len() as u64, "Resolving unsubscribe methods...");

    // buffered (not buffer_unordered) keeps rows aligned with the table
    let mut rows = Vec::with_capacity(senders.len());
    {
        let resolver = &resolver;
        let mut stream = futures::stream::iter(senders.iter().map(|sender| async move {
            let method = resolver.resolve(sender).await?;
            Ok::<MethodPreview, UnsubscribeError>(MethodPreview {
                email: sender.email.clone(),
                message_count: sender.message_count,
                method,
            })
        }))
        .buffered(config.unsubscribe.resolve_concurrency.max(1));

        while let Some(row) = stream.next().await {
            rows.push(row?);
            resolve_bar.inc(1);
        }
    }
    resolve_bar.finish_with_message(format!("Resolved {} senders", rows.len()));

    let report = DryRunReport {
        generated_at: Utc::now(),
        rows,
    };

    print_method_table(&report.rows);
    println!(
        "\n{} mailto, {} post, {} link, {} none",
        report.count("mailto"),
        report.count("post"),
        report.count("link"),
        report.count("none")
    );

    if let Some(path) = report_file {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        report.save(&path).await?;
        println!("Dry-run report saved to: {:?}", path);
    }

    println!("\nDry run complete. No changes were made.");
    Ok(())
}

fn print_sender_table(senders: &[Sender], limit: usize) {
    println!("\n{:<44} {:>7}  NAME", "SENDER", "MSGS");
    for sender in senders.iter().take(limit) {
        let name = if sender.display_name() == sender.email {
            ""
        } else {
            sender.display_name()
        };
        println!(
            "{:<44} {:>7}  {}",
            truncate_string(&sender.email, 44),
            sender.message_count,
            truncate_string(name, 30)
        );
    }
    if senders.len() > limit {
        println!("... and {} more", senders.len() - limit);
    }
}

fn print_method_table(rows: &[MethodPreview]) {
    println!("\n{:<44} {:>7}  {:<7} TARGET", "SENDER", "MSGS", "METHOD");
    for row in rows {
        println!(
            "{:<44} {:>7}  {:<7} {}",
            truncate_string(&row.email, 44),
            row.message_count,
            row.method.label(),
            truncate_string(row.target(), 50)
        );
    }
}

fn print_run_summary(report: &WorkflowReport) {
    println!("\n========================================");
    println!("Unsubscribe Run Summary");
    println!("========================================");
    println!("Run ID: {}", report.run_id);
    println!("Outcome: {}", report.outcome);
    println!("Duration: {} seconds", report.duration_seconds);
    println!("Senders selected: {}", report.selected);
    println!("Auto-unsubscribed: {}", report.auto_unsubscribed);
    println!("Links opened: {}", report.links_opened);
    println!("Senders blocked: {}", report.blocked);
    println!("Senders skipped: {}", report.skipped);
    println!("Messages trashed: {}", report.messages_trashed);
    println!("Block filters created: {}", report.filters_created);
    println!("========================================");
}
