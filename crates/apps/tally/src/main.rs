//! Tally - Incremental report ingestion from an operations platform
//!
//! Triggers exports for each report category, saves files captured during
//! the trigger, and polls the reports mailbox for the exports delivered by
//! email.

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use ingest::storage::WatermarkStore;
use ingest::{
    Category, Collaborators, CommandTriggerDriver, CsvSaveHandler, GmailAuth, GmailClient,
    GmailInboxPoller, MailboxCredentials, Orchestrator, RunError, RunResult, Settings,
    SqliteStore, SystemClock,
};
use log::{error, info, warn};
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;

#[derive(Parser)]
#[command(name = "tally", version, about = "Incremental report ingestion")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand)]
enum Command {
    /// Trigger exports and ingest every delivered report (default)
    Run {
        /// Categories to ingest; all when omitted
        #[arg(short, long = "category", value_name = "CATEGORY")]
        categories: Vec<Category>,

        /// Override the inbox poll timeout
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// Authorize mailbox access
    Auth {
        /// Forget the stored mailbox token instead
        #[arg(long)]
        logout: bool,
    },
    /// Show the stored watermark of each category
    Watermarks {
        /// Forget one category's watermark so the next run backfills it
        #[arg(long, value_name = "CATEGORY")]
        reset: Option<Category>,
    },
}

fn main() -> ExitCode {
    // Initialize logging
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"))
        .format_timestamp_millis()
        .init();

    // Bootstrap config and data directories
    if let Err(e) = config::init() {
        error!("Failed to initialize config directory: {}", e);
    }

    let cli = Cli::parse();
    let command = cli.command.unwrap_or(Command::Run {
        categories: Vec::new(),
        timeout_secs: None,
    });

    let outcome = match command {
        Command::Run {
            categories,
            timeout_secs,
        } => run(categories, timeout_secs),
        Command::Auth { logout } => auth(logout),
        Command::Watermarks { reset } => watermarks(reset),
    };

    match outcome {
        Ok(code) => code,
        Err(e) => {
            error!("{:#}", e);
            ExitCode::FAILURE
        }
    }
}

fn run(categories: Vec<Category>, timeout_secs: Option<u64>) -> Result<ExitCode> {
    let settings = Settings::load().context("Failed to load settings")?;
    let mut options = settings.run_options();
    if let Some(secs) = timeout_secs {
        options.poll_timeout = Duration::from_secs(secs);
    }

    let download_dir = settings.download_dir()?;
    std::fs::create_dir_all(&download_dir)
        .with_context(|| format!("Failed to create {}", download_dir.display()))?;

    let store = Arc::new(SqliteStore::new(settings.database_path()?)?);
    let trigger = CommandTriggerDriver::new(&settings.platform.trigger_command, &download_dir)
        .context("No trigger command configured")?;
    let client = GmailClient::new(GmailAuth::new(mailbox_credentials()?)?);
    let inbox = GmailInboxPoller::new(
        client,
        &settings.mailbox.address,
        &settings.mailbox.search_query,
        &download_dir,
    );

    let orchestrator = Orchestrator::new(
        Collaborators {
            trigger: Arc::new(trigger),
            inbox: Arc::new(inbox),
            watermarks: store.clone(),
            saver: Arc::new(CsvSaveHandler::new(store.clone(), store)),
            clock: Arc::new(SystemClock),
        },
        options,
    );

    // Progress goes to the log; the thread ends when the orchestrator drops
    let events = orchestrator.subscribe();
    let progress = std::thread::spawn(move || {
        for event in events {
            info!("[{:>3}%] {}", event.percent, event.message);
        }
    });

    let categories = if categories.is_empty() {
        Category::ALL.to_vec()
    } else {
        categories
    };
    let outcome = orchestrator.run(&settings.platform_credentials(), &categories);
    drop(orchestrator);
    let _ = progress.join();

    match outcome {
        Ok(result) => {
            print_summary(&result);
            Ok(ExitCode::SUCCESS)
        }
        Err(RunError::NothingSaved(result)) => {
            print_summary(&result);
            error!("No category was saved");
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}

fn auth(logout: bool) -> Result<ExitCode> {
    let client = GmailClient::new(GmailAuth::new(mailbox_credentials()?)?);
    if logout {
        client.logout()?;
        println!("Mailbox token removed");
    } else {
        client.authenticate()?;
        println!("Mailbox access authorized");
    }
    Ok(ExitCode::SUCCESS)
}

fn watermarks(reset: Option<Category>) -> Result<ExitCode> {
    let settings = Settings::load().context("Failed to load settings")?;
    let store = SqliteStore::new(settings.database_path()?)?;
    if let Some(category) = reset {
        store.reset(category)?;
        info!("{}: watermark cleared", category);
    }
    let stored = store.list()?;

    for category in Category::ALL {
        match stored.iter().find(|wm| wm.category == category) {
            Some(wm) => println!(
                "{:<24} {}  ({} rows, updated {})",
                category.display_name(),
                wm.high_water_mark.format("%Y-%m-%d %H:%M:%S"),
                wm.record_count,
                wm.updated_at.format("%Y-%m-%d %H:%M")
            ),
            None => println!("{:<24} never ingested", category.display_name()),
        }
    }
    Ok(ExitCode::SUCCESS)
}

fn mailbox_credentials() -> Result<MailboxCredentials> {
    MailboxCredentials::load().inspect_err(|_| {
        if let Some(path) = MailboxCredentials::default_credentials_path() {
            warn!(
                "To configure mailbox access, either:\n\
                 1. Place your Google OAuth credentials at: {}\n\
                 2. Or set environment variables: GMAIL_CLIENT_ID and GMAIL_CLIENT_SECRET",
                path.display()
            );
        }
    })
}

fn print_summary(result: &RunResult) {
    println!(
        "Run {} in {:.1}s",
        if result.success { "succeeded" } else { "failed" },
        result.duration_ms as f64 / 1000.0
    );
    for (category, count) in &result.saved_categories {
        println!("  saved    {:<24} {} rows", category.as_str(), count);
    }
    for category in &result.missing_categories {
        let state = result
            .final_states
            .get(category)
            .map(|s| s.label())
            .unwrap_or("unknown");
        println!("  missing  {:<24} {}", category.as_str(), state);
    }
    for warning in &result.warnings {
        println!("  warning  {}", warning);
    }
    let stats = &result.poll_stats;
    println!(
        "  inbox    {} polls, {} messages, {} discarded, {} unclassified",
        stats.polls, stats.messages_seen, stats.messages_discarded, stats.unclassified
    );
}
