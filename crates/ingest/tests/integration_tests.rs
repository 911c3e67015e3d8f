//! Integration tests for the ingest crate
//!
//! These tests drive full orchestrator runs against a scripted trigger
//! driver and inbox, real CSV files, and a simulated clock.

use anyhow::{Result, bail};
use chrono::{DateTime, NaiveDate, TimeZone, Utc};
use ingest::models::{
    Attachment, AttachmentKey, Category, CategoryState, DateRange, DeliveryMethod, DirectCapture,
    InboxMessage, MessageId, TriggerFailure, TriggerReport,
};
use ingest::storage::{InMemoryStore, ReportStore, SqliteStore, WatermarkStore};
use ingest::{
    Clock, Collaborators, CsvSaveHandler, InboxPoller, ManualClock, Orchestrator, PlatformCredentials,
    RunError, RunOptions, RunPhase, TriggerDriver,
};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tempfile::TempDir;

const ORDERS_CSV: &str = "Order ID,Sale Date,Total\no-1,2024-05-03,10.00\no-2,2024-05-20,12.50\n";
const CUSTOMERS_CSV: &str = "Client ID,Creation Date\nc-1,2024-05-10\n";

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 6, 1, 9, 0, 0).unwrap()
}

fn credentials() -> PlatformCredentials {
    PlatformCredentials::new("ops@example.com", "secret")
}

fn options() -> RunOptions {
    RunOptions {
        mailbox: "reports@example.com".to_string(),
        ..RunOptions::default()
    }
}

fn write(dir: &TempDir, name: &str, content: &str) -> PathBuf {
    let path = dir.path().join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// Trigger driver returning a fixed report and recording requested windows
struct FakeTrigger {
    report: Result<TriggerReport, String>,
    calls: Mutex<Vec<BTreeMap<Category, DateRange>>>,
}

impl FakeTrigger {
    fn new(report: TriggerReport) -> Self {
        Self {
            report: Ok(report),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn failing(reason: &str) -> Self {
        Self {
            report: Err(reason.to_string()),
            calls: Mutex::new(Vec::new()),
        }
    }

    fn windows(&self, call: usize) -> BTreeMap<Category, DateRange> {
        self.calls.lock().unwrap()[call].clone()
    }
}

impl TriggerDriver for FakeTrigger {
    fn trigger(
        &self,
        _credentials: &PlatformCredentials,
        windows: &BTreeMap<Category, DateRange>,
    ) -> Result<TriggerReport> {
        self.calls.lock().unwrap().push(windows.clone());
        match &self.report {
            Ok(report) => Ok(report.clone()),
            Err(reason) => bail!("{}", reason),
        }
    }
}

/// A message that shows up in search results from a given poll onward
struct Scheduled {
    visible_from_poll: usize,
    message: InboxMessage,
    files: BTreeMap<AttachmentKey, PathBuf>,
}

type Gate = Box<dyn Fn() -> bool + Send + Sync>;

/// Scripted inbox counting every search
#[derive(Default)]
struct FakeInbox {
    scheduled: Vec<Scheduled>,
    polls: AtomicUsize,
    download_failures: Mutex<HashMap<MessageId, usize>>,
    /// Searches block (in real time) until this returns true
    gate: Option<Gate>,
    /// Raised after the given number of searches
    cancel_after: Mutex<Option<(usize, Arc<AtomicBool>)>>,
}

impl FakeInbox {
    fn deliver(mut self, poll: usize, id: &str, subject: &str, files: &[(&str, &PathBuf)]) -> Self {
        let mut message = InboxMessage::new(id, subject, now());
        let mut map = BTreeMap::new();
        for (name, path) in files {
            message = message.with_attachment(Attachment::new(*name, "text/csv", 64, *name));
            map.insert(name.to_string(), path.to_path_buf());
        }
        self.scheduled.push(Scheduled {
            visible_from_poll: poll,
            message,
            files: map,
        });
        self
    }

    fn fail_downloads(self, id: &str, times: usize) -> Self {
        self.download_failures
            .lock()
            .unwrap()
            .insert(MessageId::new(id), times);
        self
    }

    fn cancel_on_poll(&self, polls: usize, flag: Arc<AtomicBool>) {
        *self.cancel_after.lock().unwrap() = Some((polls, flag));
    }

    fn polls(&self) -> usize {
        self.polls.load(Ordering::SeqCst)
    }
}

impl InboxPoller for FakeInbox {
    fn find_messages_since(&self, _since: DateTime<Utc>) -> Result<Vec<InboxMessage>> {
        if let Some(gate) = &self.gate {
            let started = Instant::now();
            while !gate() && started.elapsed() < Duration::from_secs(5) {
                std::thread::sleep(Duration::from_millis(5));
            }
        }

        let poll = self.polls.fetch_add(1, Ordering::SeqCst) + 1;
        if let Some((after, flag)) = self.cancel_after.lock().unwrap().as_ref()
            && poll >= *after
        {
            flag.store(true, Ordering::SeqCst);
        }

        Ok(self
            .scheduled
            .iter()
            .filter(|s| s.visible_from_poll <= poll)
            .map(|s| s.message.clone())
            .collect())
    }

    fn download_attachments(
        &self,
        message: &InboxMessage,
    ) -> Result<BTreeMap<AttachmentKey, PathBuf>> {
        if let Some(remaining) = self.download_failures.lock().unwrap().get_mut(&message.id)
            && *remaining > 0
        {
            *remaining -= 1;
            bail!("connection reset");
        }

        self.scheduled
            .iter()
            .find(|s| s.message.id == message.id)
            .map(|s| s.files.clone())
            .ok_or_else(|| anyhow::anyhow!("unknown message"))
    }
}

struct Harness {
    dir: TempDir,
    store: Arc<InMemoryStore>,
    clock: Arc<ManualClock>,
}

impl Harness {
    fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
            store: Arc::new(InMemoryStore::new()),
            clock: Arc::new(ManualClock::new(now())),
        }
    }

    fn file(&self, name: &str, content: &str) -> PathBuf {
        write(&self.dir, name, content)
    }

    fn orchestrator(
        &self,
        trigger: Arc<FakeTrigger>,
        inbox: Arc<FakeInbox>,
        options: RunOptions,
    ) -> Orchestrator {
        let saver = CsvSaveHandler::new(self.store.clone(), self.store.clone());
        Orchestrator::new(
            Collaborators {
                trigger,
                inbox,
                watermarks: self.store.clone(),
                saver: Arc::new(saver),
                clock: self.clock.clone(),
            },
            options,
        )
    }
}

fn direct(category: Category, path: &Path) -> DirectCapture {
    DirectCapture {
        category,
        path: path.to_path_buf(),
    }
}

fn failed(category: Category) -> TriggerFailure {
    TriggerFailure {
        category,
        reason: "export button missing".to_string(),
    }
}

#[test]
fn test_end_to_end_direct_and_emailed() {
    let h = Harness::new();
    let orders = h.file("orders.csv", ORDERS_CSV);
    let customers = h.file("customers.csv", CUSTOMERS_CSV);

    let trigger = Arc::new(FakeTrigger::new(TriggerReport {
        direct: vec![direct(Category::Orders, &orders)],
        pending: vec![Category::NewCustomers],
        failed: vec![],
    }));
    // Arrives on the third search, after two empty polls
    let inbox = Arc::new(FakeInbox::default().deliver(
        3,
        "m-1",
        "New Customer Export",
        &[("customers.csv", &customers)],
    ));
    let orchestrator = h.orchestrator(trigger, inbox.clone(), options());

    let result = orchestrator
        .run(&credentials(), &[Category::Orders, Category::NewCustomers])
        .unwrap();

    assert!(result.success);
    assert!(result.missing_categories.is_empty());
    assert_eq!(result.saved_categories[&Category::Orders], 2);
    assert_eq!(result.saved_categories[&Category::NewCustomers], 1);
    assert_eq!(
        result.final_states[&Category::Orders],
        CategoryState::Saved {
            record_count: 2,
            delivery: DeliveryMethod::Direct
        }
    );
    assert_eq!(
        result.final_states[&Category::NewCustomers],
        CategoryState::Saved {
            record_count: 1,
            delivery: DeliveryMethod::Email
        }
    );
    assert_eq!(result.report_files[&Category::NewCustomers], customers);
    assert_eq!(result.poll_stats.polls, 3);
    assert_eq!(inbox.polls(), 3);
    assert_eq!(result.duration_ms, 60_000);

    let wm = WatermarkStore::get(h.store.as_ref(), Category::NewCustomers)
        .unwrap()
        .unwrap();
    assert_eq!(wm.high_water_mark, Utc.with_ymd_and_hms(2024, 5, 10, 0, 0, 0).unwrap());
}

#[test]
fn test_poll_loop_exits_early_without_further_polls() {
    let h = Harness::new();
    let customers = h.file("customers.csv", CUSTOMERS_CSV);
    let active = h.file("active.csv", "Subscription ID,Start Date\ns-1,2024-05-01\n");
    let paused = h.file("paused.csv", "Subscription ID,Pause Date\ns-2,2024-05-02\n");

    let trigger = Arc::new(FakeTrigger::new(TriggerReport {
        pending: vec![
            Category::NewCustomers,
            Category::ActiveSubscriptions,
            Category::PausedSubscriptions,
        ],
        ..TriggerReport::default()
    }));
    let inbox = Arc::new(
        FakeInbox::default()
            .deliver(1, "m-1", "New Customer Export", &[("customers.csv", &customers)])
            .deliver(1, "m-2", "Active Subscriptions", &[("active.csv", &active)])
            .deliver(1, "m-3", "Paused Subscriptions", &[("paused.csv", &paused)]),
    );
    let orchestrator = h.orchestrator(trigger, inbox.clone(), options());

    let result = orchestrator
        .run(
            &credentials(),
            &[
                Category::NewCustomers,
                Category::ActiveSubscriptions,
                Category::PausedSubscriptions,
            ],
        )
        .unwrap();

    assert_eq!(result.saved_categories.len(), 3);
    assert_eq!(inbox.polls(), 1);
    // Never slept toward the 45 minute deadline
    assert_eq!(h.clock.now(), now());
}

#[test]
fn test_deadline_stops_polling() {
    let h = Harness::new();
    let orders = h.file("orders.csv", ORDERS_CSV);

    let trigger = Arc::new(FakeTrigger::new(TriggerReport {
        direct: vec![direct(Category::Orders, &orders)],
        pending: vec![Category::NewCustomers],
        failed: vec![],
    }));
    let inbox = Arc::new(FakeInbox::default());
    let orchestrator = h.orchestrator(
        trigger,
        inbox.clone(),
        RunOptions {
            poll_timeout: Duration::from_secs(120),
            ..options()
        },
    );

    let result = orchestrator
        .run(&credentials(), &[Category::Orders, Category::NewCustomers])
        .unwrap();

    // Searches at 0s, 30s, 60s and 90s; the deadline is hit at 120s
    assert_eq!(inbox.polls(), 4);
    assert_eq!(h.clock.now(), now() + chrono::Duration::seconds(120));
    assert!(result.success);
    assert_eq!(result.missing_categories, vec![Category::NewCustomers]);
    assert_eq!(
        result.final_states[&Category::NewCustomers],
        CategoryState::AwaitingMessage
    );
    assert!(
        result
            .warnings
            .iter()
            .any(|w| w == "new_customers: no delivery before the poll deadline")
    );
}

#[test]
fn test_huge_timeout_and_margin_still_poll() {
    for timeout in [Duration::from_secs(u64::MAX), Duration::from_secs(100_000_000_000_000)] {
        let h = Harness::new();
        let customers = h.file("customers.csv", CUSTOMERS_CSV);

        let trigger = Arc::new(FakeTrigger::new(TriggerReport {
            pending: vec![Category::NewCustomers],
            ..TriggerReport::default()
        }));
        let inbox = Arc::new(FakeInbox::default().deliver(
            2,
            "m-1",
            "New Customer Export",
            &[("customers.csv", &customers)],
        ));
        let orchestrator = h.orchestrator(
            trigger,
            inbox.clone(),
            RunOptions {
                poll_timeout: timeout,
                safety_margin: Duration::from_secs(u64::MAX),
                ..options()
            },
        );

        let result = orchestrator
            .run(&credentials(), &[Category::NewCustomers])
            .unwrap();

        assert_eq!(result.saved_categories[&Category::NewCustomers], 1);
        assert_eq!(inbox.polls(), 2);
        assert_eq!(h.clock.now(), now() + chrono::Duration::seconds(30));
    }
}

#[test]
fn test_partial_failure_tolerance() {
    let h = Harness::new();
    let orders = h.file("orders.csv", ORDERS_CSV);
    let customers = h.file("customers.csv", CUSTOMERS_CSV);
    let active = h.file("active.csv", "Subscription ID,Start Date\ns-1,2024-05-01\n");
    let paused = h.file("paused.csv", "Subscription ID,Pause Date\ns-2,2024-05-02\n");
    let trialing = h.file("trialing.csv", "Subscription ID,Trial Start Date\ns-3,2024-05-03\n");
    let new_subs = h.file("new_subs.csv", "Subscription ID,Start Date\ns-4,2024-05-04\n");
    let revenue = h.file("revenue.csv", "Revenue Category,Amount\nRetail,300\n");

    let trigger = Arc::new(FakeTrigger::new(TriggerReport {
        direct: vec![direct(Category::Orders, &orders)],
        pending: vec![
            Category::NewCustomers,
            Category::ActiveSubscriptions,
            Category::PausedSubscriptions,
            Category::TrialingSubscriptions,
            Category::NewSubscriptions,
            Category::CanceledSubscriptions,
            Category::RevenueCategories,
        ],
        failed: vec![failed(Category::FirstVisits), failed(Category::FullRegistrations)],
    }));
    // Canceled subscriptions never arrive
    let inbox = Arc::new(
        FakeInbox::default()
            .deliver(1, "m-1", "New Customer Export", &[("customers.csv", &customers)])
            .deliver(1, "m-2", "Active Subscriptions", &[("active.csv", &active)])
            .deliver(2, "m-3", "Paused Subscriptions", &[("paused.csv", &paused)])
            .deliver(2, "m-4", "Trialing Subscriptions", &[("trialing.csv", &trialing)])
            .deliver(3, "m-5", "New Subscriptions", &[("new_subs.csv", &new_subs)])
            .deliver(3, "m-6", "Revenue by Category", &[("revenue.csv", &revenue)]),
    );
    let orchestrator = h.orchestrator(
        trigger,
        inbox,
        RunOptions {
            poll_timeout: Duration::from_secs(300),
            ..options()
        },
    );

    let result = orchestrator.run(&credentials(), &Category::ALL).unwrap();

    assert!(result.success);
    assert_eq!(result.saved_categories.len(), 7);
    assert_eq!(
        result.missing_categories,
        vec![
            Category::FirstVisits,
            Category::CanceledSubscriptions,
            Category::FullRegistrations,
        ]
    );
    assert!(matches!(
        result.final_states[&Category::FirstVisits],
        CategoryState::Failed { delivery: None, .. }
    ));
    assert!(
        result
            .warnings
            .iter()
            .any(|w| w.contains("first_visits: trigger failed"))
    );
}

#[test]
fn test_direct_save_wins_over_later_email() {
    let h = Harness::new();
    let orders = h.file("orders.csv", ORDERS_CSV);
    let late_orders = h.file(
        "orders_late.csv",
        "Order ID,Sale Date\no-7,2024-05-28\no-8,2024-05-29\no-9,2024-05-30\n",
    );
    let customers = h.file("customers.csv", CUSTOMERS_CSV);

    let trigger = Arc::new(FakeTrigger::new(TriggerReport {
        direct: vec![direct(Category::Orders, &orders)],
        pending: vec![Category::NewCustomers],
        failed: vec![],
    }));

    // Hold searches until the direct save has written its rows
    let store = h.store.clone();
    let mut inbox = FakeInbox::default()
        .deliver(1, "m-1", "Orders Export", &[("orders_late.csv", &late_orders)])
        .deliver(2, "m-2", "New Customer Export", &[("customers.csv", &customers)]);
    inbox.gate = Some(Box::new(move || {
        store.count_rows(Category::Orders).unwrap_or(0) >= 2
    }));
    let orchestrator = h.orchestrator(trigger, Arc::new(inbox), options());

    let result = orchestrator
        .run(&credentials(), &[Category::Orders, Category::NewCustomers])
        .unwrap();

    assert_eq!(result.saved_categories[&Category::Orders], 2);
    assert_eq!(result.report_files[&Category::Orders], orders);
    assert_eq!(result.poll_stats.messages_discarded, 1);
    assert_eq!(h.store.count_rows(Category::Orders).unwrap(), 2);
    assert!(h.store.get_row(Category::Orders, "o-7").unwrap().is_none());

    let wm = WatermarkStore::get(h.store.as_ref(), Category::Orders)
        .unwrap()
        .unwrap();
    assert_eq!(wm.high_water_mark, Utc.with_ymd_and_hms(2024, 5, 20, 0, 0, 0).unwrap());
}

#[test]
fn test_first_email_wins_over_duplicate() {
    let h = Harness::new();
    let first = h.file("customers.csv", CUSTOMERS_CSV);
    let second = h.file(
        "customers_resend.csv",
        "Client ID,Creation Date\nc-1,2024-05-10\nc-2,2024-05-11\n",
    );
    let orders = h.file("orders.csv", ORDERS_CSV);

    let trigger = Arc::new(FakeTrigger::new(TriggerReport {
        pending: vec![Category::NewCustomers, Category::Orders],
        ..TriggerReport::default()
    }));
    let inbox = Arc::new(
        FakeInbox::default()
            .deliver(1, "m-1", "New Customer Export", &[("customers.csv", &first)])
            .deliver(2, "m-2", "New Customer Export", &[("customers_resend.csv", &second)])
            .deliver(3, "m-3", "Orders Export", &[("orders.csv", &orders)]),
    );
    let orchestrator = h.orchestrator(trigger, inbox, options());

    let result = orchestrator
        .run(&credentials(), &[Category::NewCustomers, Category::Orders])
        .unwrap();

    assert_eq!(result.saved_categories[&Category::NewCustomers], 1);
    assert_eq!(result.report_files[&Category::NewCustomers], first);
    assert_eq!(result.poll_stats.messages_discarded, 1);
    assert_eq!(result.poll_stats.messages_seen, 3);
    assert_eq!(h.store.count_rows(Category::NewCustomers).unwrap(), 1);
}

#[test]
fn test_watermark_drives_next_window() {
    let h = Harness::new();
    let orders = h.file("orders.csv", ORDERS_CSV);

    let trigger = Arc::new(FakeTrigger::new(TriggerReport {
        direct: vec![direct(Category::Orders, &orders)],
        ..TriggerReport::default()
    }));
    let orchestrator = h.orchestrator(trigger.clone(), Arc::new(FakeInbox::default()), options());

    orchestrator.run(&credentials(), &[Category::Orders]).unwrap();
    let wm = WatermarkStore::get(h.store.as_ref(), Category::Orders)
        .unwrap()
        .unwrap();
    assert_eq!(wm.high_water_mark, Utc.with_ymd_and_hms(2024, 5, 20, 0, 0, 0).unwrap());

    // Same data again: nothing newer, so the watermark holds
    orchestrator.run(&credentials(), &[Category::Orders]).unwrap();
    let after = WatermarkStore::get(h.store.as_ref(), Category::Orders)
        .unwrap()
        .unwrap();
    assert_eq!(after.high_water_mark, wm.high_water_mark);

    let first = trigger.windows(0)[&Category::Orders];
    let second = trigger.windows(1)[&Category::Orders];
    let today = NaiveDate::from_ymd_opt(2024, 6, 1).unwrap();
    assert_eq!(first.start, NaiveDate::from_ymd_opt(2020, 1, 1).unwrap());
    assert_eq!(first.end, today);
    assert_eq!(second.start, NaiveDate::from_ymd_opt(2024, 5, 21).unwrap());
    assert_eq!(second.end, today);
}

#[test]
fn test_nothing_triggered_is_an_error() {
    let h = Harness::new();
    let trigger = Arc::new(FakeTrigger::new(TriggerReport {
        failed: vec![failed(Category::Orders), failed(Category::NewCustomers)],
        ..TriggerReport::default()
    }));
    let inbox = Arc::new(FakeInbox::default());
    let orchestrator = h.orchestrator(trigger, inbox.clone(), options());

    let err = orchestrator
        .run(&credentials(), &[Category::Orders, Category::NewCustomers])
        .unwrap_err();

    match err {
        RunError::NothingTriggered { failures } => assert_eq!(failures.len(), 2),
        other => panic!("unexpected error: {}", other),
    }
    assert_eq!(inbox.polls(), 0);
}

#[test]
fn test_trigger_driver_crash_is_an_error() {
    let h = Harness::new();
    let trigger = Arc::new(FakeTrigger::failing("login rejected"));
    let orchestrator = h.orchestrator(trigger, Arc::new(FakeInbox::default()), options());

    let err = orchestrator.run(&credentials(), &[Category::Orders]).unwrap_err();

    assert!(matches!(err, RunError::Trigger(_)));
    assert!(err.to_string().contains("login rejected"));
}

#[test]
fn test_nothing_saved_is_an_error_with_details() {
    let h = Harness::new();
    let broken = h.file("orders.csv", "Something,Else\n1,2\n");
    let trigger = Arc::new(FakeTrigger::new(TriggerReport {
        direct: vec![direct(Category::Orders, &broken)],
        ..TriggerReport::default()
    }));
    let orchestrator = h.orchestrator(trigger, Arc::new(FakeInbox::default()), options());

    let err = orchestrator.run(&credentials(), &[Category::Orders]).unwrap_err();

    let RunError::NothingSaved(result) = err else {
        panic!("expected NothingSaved");
    };
    assert!(!result.success);
    assert_eq!(result.missing_categories, vec![Category::Orders]);
    assert!(matches!(
        result.final_states[&Category::Orders],
        CategoryState::Failed {
            delivery: Some(DeliveryMethod::Direct),
            ..
        }
    ));
    assert!(WatermarkStore::get(h.store.as_ref(), Category::Orders).unwrap().is_none());
}

#[test]
fn test_unclassifiable_messages_are_dropped() {
    let h = Harness::new();
    let flyer = h.file("flyer.pdf", "%PDF-1.4");
    let customers = h.file("customers.csv", CUSTOMERS_CSV);

    let trigger = Arc::new(FakeTrigger::new(TriggerReport {
        pending: vec![Category::NewCustomers],
        ..TriggerReport::default()
    }));
    let inbox = Arc::new(
        FakeInbox::default()
            .deliver(1, "m-1", "Weekly newsletter", &[("flyer.pdf", &flyer)])
            .deliver(2, "m-2", "Your export is ready", &[("customers.csv", &customers)]),
    );
    let orchestrator = h.orchestrator(trigger, inbox, options());

    let result = orchestrator
        .run(&credentials(), &[Category::NewCustomers])
        .unwrap();

    assert!(result.success);
    assert_eq!(result.poll_stats.unclassified, 1);
    assert_eq!(result.poll_stats.polls, 2);
}

#[test]
fn test_failed_download_is_retried_next_poll() {
    let h = Harness::new();
    let customers = h.file("customers.csv", CUSTOMERS_CSV);

    let trigger = Arc::new(FakeTrigger::new(TriggerReport {
        pending: vec![Category::NewCustomers],
        ..TriggerReport::default()
    }));
    let inbox = Arc::new(
        FakeInbox::default()
            .deliver(1, "m-1", "New Customer Export", &[("customers.csv", &customers)])
            .fail_downloads("m-1", 1),
    );
    let orchestrator = h.orchestrator(trigger, inbox, options());

    let result = orchestrator
        .run(&credentials(), &[Category::NewCustomers])
        .unwrap();

    assert_eq!(result.saved_categories[&Category::NewCustomers], 1);
    assert_eq!(result.poll_stats.download_failures, 1);
    assert_eq!(result.poll_stats.polls, 2);
    assert_eq!(result.poll_stats.messages_seen, 1);
}

#[test]
fn test_cancellation_stops_polling() {
    let h = Harness::new();
    let orders = h.file("orders.csv", ORDERS_CSV);

    let trigger = Arc::new(FakeTrigger::new(TriggerReport {
        direct: vec![direct(Category::Orders, &orders)],
        pending: vec![Category::NewCustomers],
        failed: vec![],
    }));

    let inbox = Arc::new(FakeInbox::default());
    let orchestrator = h.orchestrator(trigger, inbox.clone(), options());
    inbox.cancel_on_poll(2, orchestrator.cancel_handle());

    let result = orchestrator
        .run(&credentials(), &[Category::Orders, Category::NewCustomers])
        .unwrap();

    assert_eq!(inbox.polls(), 2);
    assert_eq!(result.missing_categories, vec![Category::NewCustomers]);
    assert!(result.warnings.iter().any(|w| w == "new_customers: run cancelled"));
}

#[test]
fn test_misconfiguration_is_rejected() {
    let h = Harness::new();
    let trigger = Arc::new(FakeTrigger::new(TriggerReport::default()));
    let inbox = Arc::new(FakeInbox::default());

    let orchestrator = h.orchestrator(trigger.clone(), inbox.clone(), options());
    let err = orchestrator
        .run(&PlatformCredentials::new("ops", ""), &[Category::Orders])
        .unwrap_err();
    assert!(matches!(err, RunError::MissingCredentials));

    let orchestrator = h.orchestrator(trigger.clone(), inbox, RunOptions::default());
    let err = orchestrator.run(&credentials(), &[Category::Orders]).unwrap_err();
    assert!(matches!(err, RunError::MissingMailbox));

    assert!(trigger.calls.lock().unwrap().is_empty());
}

#[test]
fn test_progress_events_are_ordered_and_monotonic() {
    let h = Harness::new();
    let orders = h.file("orders.csv", ORDERS_CSV);
    let customers = h.file("customers.csv", CUSTOMERS_CSV);

    let trigger = Arc::new(FakeTrigger::new(TriggerReport {
        direct: vec![direct(Category::Orders, &orders)],
        pending: vec![Category::NewCustomers],
        failed: vec![],
    }));
    let inbox = Arc::new(FakeInbox::default().deliver(
        2,
        "m-1",
        "New Customer Export",
        &[("customers.csv", &customers)],
    ));
    let orchestrator = h.orchestrator(trigger, inbox, options());
    let events = orchestrator.subscribe();

    orchestrator
        .run(&credentials(), &[Category::Orders, Category::NewCustomers])
        .unwrap();

    let events: Vec<_> = events.try_iter().collect();
    assert_eq!(events.first().unwrap().phase, RunPhase::NotStarted);
    let last = events.last().unwrap();
    assert_eq!(last.phase, RunPhase::Done);
    assert_eq!(last.percent, 100);
    assert!(last.snapshot.values().all(|s| s.is_saved()));

    for pair in events.windows(2) {
        assert!(pair[0].percent <= pair[1].percent);
    }
    for phase in [RunPhase::Triggering, RunPhase::Concurrent, RunPhase::Finalizing] {
        assert!(events.iter().any(|e| e.phase == phase));
    }
}

#[test]
fn test_sqlite_backed_run() {
    let h = Harness::new();
    let orders = h.file("orders.csv", ORDERS_CSV);
    let store = Arc::new(SqliteStore::new(h.dir.path().join("tally.db")).unwrap());

    let trigger = Arc::new(FakeTrigger::new(TriggerReport {
        direct: vec![direct(Category::Orders, &orders)],
        ..TriggerReport::default()
    }));
    let orchestrator = Orchestrator::new(
        Collaborators {
            trigger,
            inbox: Arc::new(FakeInbox::default()),
            watermarks: store.clone(),
            saver: Arc::new(CsvSaveHandler::new(store.clone(), store.clone())),
            clock: h.clock.clone(),
        },
        options(),
    );

    let result = orchestrator.run(&credentials(), &[Category::Orders]).unwrap();

    assert_eq!(result.saved_categories[&Category::Orders], 2);
    assert_eq!(store.count_rows(Category::Orders).unwrap(), 2);
    let row = store.get_row(Category::Orders, "o-2").unwrap().unwrap();
    assert_eq!(row.field("Total"), Some("12.50"));
    assert_eq!(WatermarkStore::list(store.as_ref()).unwrap().len(), 1);
}
