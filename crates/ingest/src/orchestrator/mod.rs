//! Report ingestion run
//!
//! One run goes through:
//! 1. Date windows from stored watermarks
//! 2. Trigger phase: one export request per category
//! 3. Concurrent phase: direct captures are saved in parallel while a
//!    single poll loop waits for emailed exports
//! 4. Finalizing: the saved files and per-category outcome are returned
//!
//! Category-scoped failures never escape `run`; they end up as `Failed`
//! states and warnings. Only misconfiguration and total failure are errors.

mod clock;
mod poll;
mod progress;

use chrono::{DateTime, NaiveDate, Utc};
use log::{debug, error, info, warn};
use rayon::prelude::*;
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::Receiver;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use thiserror::Error;

use crate::inbox::InboxPoller;
use crate::models::{
    Category, CategoryState, DateRange, DeliveryMethod, TriggerFailure, TriggerOutcome,
};
use crate::save::SaveHandler;
use crate::settings::default_backfill_floor;
use crate::storage::WatermarkStore;
use crate::tracker::{CategoryTracker, Delivery, ReportFiles, StateError};
use crate::trigger::{PlatformCredentials, TriggerDriver};
use crate::window::window_for;

pub use clock::{Clock, ManualClock, SystemClock};
use clock::{saturating_add, saturating_sub};
pub use progress::{ProgressEvent, RunPhase};

use progress::ProgressPublisher;

/// Everything a run talks to
#[derive(Clone)]
pub struct Collaborators {
    pub trigger: Arc<dyn TriggerDriver>,
    pub inbox: Arc<dyn InboxPoller>,
    pub watermarks: Arc<dyn WatermarkStore>,
    pub saver: Arc<dyn SaveHandler>,
    pub clock: Arc<dyn Clock>,
}

/// Run configuration
#[derive(Debug, Clone)]
pub struct RunOptions {
    /// Address exports are emailed to; required
    pub mailbox: String,
    /// Hard bound on the poll loop, measured from the start of polling
    pub poll_timeout: Duration,
    /// Pause between inbox searches
    pub poll_interval: Duration,
    /// Inbox searches start this long before the trigger phase began
    pub safety_margin: Duration,
    /// Window start for categories without a watermark
    pub backfill_floor: NaiveDate,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            mailbox: String::new(),
            poll_timeout: Duration::from_secs(45 * 60),
            poll_interval: Duration::from_secs(30),
            safety_margin: Duration::from_secs(5 * 60),
            backfill_floor: default_backfill_floor(),
        }
    }
}

/// Poll loop counters
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct PollStats {
    /// Inbox searches performed
    pub polls: usize,
    /// Distinct new messages examined
    pub messages_seen: usize,
    /// Deliveries ignored because their category was already done
    pub messages_discarded: usize,
    /// Attachments that matched no category
    pub unclassified: usize,
    /// Attachment downloads that failed and were retried on a later poll
    pub download_failures: usize,
}

/// Outcome of a run
#[derive(Debug, Clone, Serialize)]
pub struct RunResult {
    /// At least one category was saved
    pub success: bool,
    pub saved_categories: BTreeMap<Category, usize>,
    /// Requested categories that were not saved, in category order
    pub missing_categories: Vec<Category>,
    pub warnings: Vec<String>,
    pub duration_ms: u64,
    /// The file that satisfied each saved category
    pub report_files: BTreeMap<Category, PathBuf>,
    pub final_states: BTreeMap<Category, CategoryState>,
    pub poll_stats: PollStats,
}

/// Run-level failures
#[derive(Debug, Error)]
pub enum RunError {
    #[error("platform credentials are not configured")]
    MissingCredentials,

    #[error("mailbox address is not configured")]
    MissingMailbox,

    #[error("trigger phase produced no direct or pending deliveries ({} categories failed)", failures.len())]
    NothingTriggered { failures: Vec<TriggerFailure> },

    #[error("no category was saved")]
    NothingSaved(Box<RunResult>),

    #[error("failed to read watermarks: {0:#}")]
    Storage(anyhow::Error),

    #[error("trigger driver failed: {0:#}")]
    Trigger(anyhow::Error),
}

/// How one offered file was handled
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum DeliveryResult {
    Saved,
    Failed,
    Discarded,
}

/// Shared per-run state
struct RunContext {
    tracker: CategoryTracker,
    files: ReportFiles,
    windows: BTreeMap<Category, DateRange>,
    warnings: Mutex<Vec<String>>,
}

impl RunContext {
    fn mark(&self, category: Category, state: CategoryState) {
        if let Err(e) = self.tracker.set(category, state) {
            debug!("State change ignored: {}", e);
        }
    }

    fn warn(&self, warning: String) {
        self.warnings
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(warning);
    }
}

/// Caller-owned ingestion orchestrator
pub struct Orchestrator {
    collaborators: Collaborators,
    options: RunOptions,
    progress: ProgressPublisher,
    cancelled: Arc<AtomicBool>,
}

impl Orchestrator {
    pub fn new(collaborators: Collaborators, options: RunOptions) -> Self {
        Self {
            collaborators,
            options,
            progress: ProgressPublisher::default(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Receive progress events for every subsequent run
    pub fn subscribe(&self) -> Receiver<ProgressEvent> {
        self.progress.subscribe()
    }

    /// Setting the flag stops the poll loop at its next check
    ///
    /// The flag is never cleared by the orchestrator.
    pub fn cancel_handle(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.cancelled)
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }

    fn clock(&self) -> &dyn Clock {
        self.collaborators.clock.as_ref()
    }

    /// Ingest the given categories
    ///
    /// Returns `Ok` when at least one category was saved, with every other
    /// requested category listed in `missing_categories`.
    pub fn run(
        &self,
        credentials: &PlatformCredentials,
        categories: &[Category],
    ) -> Result<RunResult, RunError> {
        if !credentials.is_complete() {
            return Err(RunError::MissingCredentials);
        }
        if self.options.mailbox.trim().is_empty() {
            return Err(RunError::MissingMailbox);
        }

        let started = self.clock().now();
        let categories: Vec<Category> = categories
            .iter()
            .copied()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();

        let tracker = CategoryTracker::new(&categories);
        self.progress.reset();
        self.progress.publish(
            RunPhase::NotStarted,
            format!("Starting run for {} categories", categories.len()),
            &tracker,
        );

        let windows = self.compute_windows(&categories, started)?;
        let ctx = RunContext {
            tracker,
            files: ReportFiles::new(),
            windows,
            warnings: Mutex::new(Vec::new()),
        };

        // Trigger phase
        for &category in &categories {
            ctx.mark(category, CategoryState::Triggering);
        }
        self.progress
            .publish(RunPhase::Triggering, "Requesting exports", &ctx.tracker);

        let trigger_started = self.clock().now();
        let report = match self.collaborators.trigger.trigger(credentials, &ctx.windows) {
            Ok(report) => report,
            Err(e) => {
                error!("Trigger driver failed: {:#}", e);
                for &category in &categories {
                    ctx.mark(
                        category,
                        CategoryState::Failed {
                            error: format!("trigger driver failed: {:#}", e),
                            delivery: None,
                        },
                    );
                }
                self.progress
                    .publish(RunPhase::Done, "Trigger driver failed", &ctx.tracker);
                return Err(RunError::Trigger(e));
            }
        };

        let (outcomes, irregularities) = report.outcomes_for(&categories);
        for irregularity in irregularities {
            warn!("{}", irregularity);
            ctx.warn(irregularity);
        }

        let mut direct = Vec::new();
        let mut pending = BTreeSet::new();
        let mut failures = Vec::new();
        for (category, outcome) in outcomes {
            match outcome {
                TriggerOutcome::DirectFile(path) => {
                    ctx.mark(category, CategoryState::Downloading);
                    direct.push((category, path));
                }
                TriggerOutcome::Pending => {
                    ctx.mark(category, CategoryState::AwaitingMessage);
                    pending.insert(category);
                }
                TriggerOutcome::Failed(reason) => {
                    warn!("{}: trigger failed: {}", category, reason);
                    ctx.warn(format!("{}: trigger failed: {}", category, reason));
                    ctx.mark(
                        category,
                        CategoryState::Failed {
                            error: reason.clone(),
                            delivery: None,
                        },
                    );
                    failures.push(TriggerFailure { category, reason });
                }
            }
        }

        info!(
            "Trigger phase done: {} direct, {} pending, {} failed",
            direct.len(),
            pending.len(),
            failures.len()
        );

        if direct.is_empty() && pending.is_empty() {
            self.progress
                .publish(RunPhase::Done, "Nothing was triggered", &ctx.tracker);
            return Err(RunError::NothingTriggered { failures });
        }

        // Concurrent phase
        let anchor = saturating_sub(trigger_started, self.options.safety_margin);
        let deadline = saturating_add(self.clock().now(), self.options.poll_timeout);
        self.progress.publish(
            RunPhase::Concurrent,
            format!(
                "Saving {} direct files, waiting on {} emailed exports",
                direct.len(),
                pending.len()
            ),
            &ctx.tracker,
        );

        let poll_stats = std::thread::scope(|s| {
            s.spawn(|| self.save_direct(&ctx, &direct));
            self.poll_loop(&ctx, &pending, anchor, deadline)
        });

        self.progress
            .publish(RunPhase::Finalizing, "Finalizing run", &ctx.tracker);
        let result = self.finish(&ctx, &categories, &pending, poll_stats, started);

        let summary = format!(
            "Run finished: {} saved, {} missing",
            result.saved_categories.len(),
            result.missing_categories.len()
        );
        info!("{}", summary);
        self.progress.publish(RunPhase::Done, summary, &ctx.tracker);

        if result.success {
            Ok(result)
        } else {
            Err(RunError::NothingSaved(Box::new(result)))
        }
    }

    fn compute_windows(
        &self,
        categories: &[Category],
        now: DateTime<Utc>,
    ) -> Result<BTreeMap<Category, DateRange>, RunError> {
        let mut windows = BTreeMap::new();
        for &category in categories {
            let watermark = self
                .collaborators
                .watermarks
                .get(category)
                .map_err(RunError::Storage)?;
            let window = window_for(watermark.as_ref(), now, self.options.backfill_floor);
            match &watermark {
                Some(wm) => info!(
                    "{}: window {} to {} ({} days, watermark {})",
                    category,
                    window.start,
                    window.end,
                    window.days(),
                    wm.high_water_mark
                ),
                None => info!(
                    "{}: window {} to {} ({} days, full backfill)",
                    category,
                    window.start,
                    window.end,
                    window.days()
                ),
            }
            windows.insert(category, window);
        }
        Ok(windows)
    }

    /// Save every directly captured file, in parallel
    fn save_direct(&self, ctx: &RunContext, direct: &[(Category, PathBuf)]) {
        direct.par_iter().for_each(|(category, path)| {
            self.deliver(ctx, *category, path, DeliveryMethod::Direct);
        });
    }

    /// Offer one file for a category; the first successful save wins
    fn deliver(
        &self,
        ctx: &RunContext,
        category: Category,
        path: &Path,
        method: DeliveryMethod,
    ) -> DeliveryResult {
        let Some(window) = ctx.windows.get(&category).copied() else {
            return DeliveryResult::Discarded;
        };

        let delivery = ctx.files.satisfy_with(category, path, || {
            ctx.tracker
                .set(category, CategoryState::Parsing { delivery: method })?;
            self.progress.publish(
                RunPhase::Concurrent,
                format!("Parsing {} ({})", category, method),
                &ctx.tracker,
            );
            self.collaborators.saver.save(category, path, &window)
        });

        match delivery {
            Delivery::Saved(outcome) => {
                ctx.mark(
                    category,
                    CategoryState::Saved {
                        record_count: outcome.record_count,
                        delivery: method,
                    },
                );
                for warning in outcome.warnings {
                    ctx.warn(warning);
                }
                self.progress.publish(
                    RunPhase::Concurrent,
                    format!("Saved {} {} rows ({})", outcome.record_count, category, method),
                    &ctx.tracker,
                );
                DeliveryResult::Saved
            }
            Delivery::Failed(e) if e.downcast_ref::<StateError>().is_some() => {
                info!("{}: discarding {} delivery {}: {}", category, method, path.display(), e);
                DeliveryResult::Discarded
            }
            Delivery::Failed(e) => {
                let error = format!("{:#}", e);
                warn!("{}: {} delivery failed: {}", category, method, error);
                ctx.warn(format!("{}: {} delivery failed: {}", category, method, error));
                ctx.mark(
                    category,
                    CategoryState::Failed {
                        error,
                        delivery: Some(method),
                    },
                );
                self.progress.publish(
                    RunPhase::Concurrent,
                    format!("Failed to save {}", category),
                    &ctx.tracker,
                );
                DeliveryResult::Failed
            }
            Delivery::AlreadySatisfied(existing) => {
                info!(
                    "{}: discarding {} delivery {}, already saved from {}",
                    category,
                    method,
                    path.display(),
                    existing.display()
                );
                DeliveryResult::Discarded
            }
        }
    }

    fn finish(
        &self,
        ctx: &RunContext,
        categories: &[Category],
        pending: &BTreeSet<Category>,
        poll_stats: PollStats,
        started: DateTime<Utc>,
    ) -> RunResult {
        let reason = if self.is_cancelled() {
            "run cancelled"
        } else {
            "no delivery before the poll deadline"
        };
        for category in ctx.tracker.remaining_incomplete(pending) {
            warn!("{}: {}", category, reason);
            ctx.warn(format!("{}: {}", category, reason));
        }

        let final_states = ctx.tracker.snapshot();
        let saved_categories: BTreeMap<Category, usize> = final_states
            .iter()
            .filter_map(|(&category, state)| match state {
                CategoryState::Saved { record_count, .. } => Some((category, *record_count)),
                _ => None,
            })
            .collect();
        let missing_categories = categories
            .iter()
            .copied()
            .filter(|c| !saved_categories.contains_key(c))
            .collect();

        let duration_ms = (self.clock().now() - started).num_milliseconds().max(0) as u64;

        RunResult {
            success: !saved_categories.is_empty(),
            saved_categories,
            missing_categories,
            warnings: ctx
                .warnings
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .clone(),
            duration_ms,
            report_files: ctx.files.to_map(),
            final_states,
            poll_stats,
        }
    }
}
