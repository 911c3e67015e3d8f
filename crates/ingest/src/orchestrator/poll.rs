//! Inbox poll loop for emailed exports

use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::collections::{BTreeSet, HashSet};
use std::time::Duration;

use super::{DeliveryResult, Orchestrator, PollStats, RunContext, RunPhase};
use crate::classify::classify;
use crate::models::{Category, DeliveryMethod, InboxMessage, MessageId};

/// Zero would spin without ever reaching the deadline on a simulated clock
const MIN_POLL_INTERVAL: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum StopReason {
    Cancelled,
    AllDelivered,
    Deadline,
}

impl Orchestrator {
    /// Poll until every pending category is terminal, the deadline passes,
    /// or the run is cancelled
    ///
    /// Searches always start from `anchor` (trigger time minus the safety
    /// margin) and rely on message ids for de-duplication.
    pub(super) fn poll_loop(
        &self,
        ctx: &RunContext,
        pending: &BTreeSet<Category>,
        anchor: DateTime<Utc>,
        deadline: DateTime<Utc>,
    ) -> PollStats {
        let mut stats = PollStats::default();
        if pending.is_empty() {
            debug!("No emailed exports expected, skipping inbox polling");
            return stats;
        }

        info!(
            "Polling {} for {} categories (messages since {}, until {})",
            self.options.mailbox,
            pending.len(),
            anchor,
            deadline
        );

        let interval = self.options.poll_interval.max(MIN_POLL_INTERVAL);
        let mut processed: HashSet<MessageId> = HashSet::new();
        let mut seen: HashSet<MessageId> = HashSet::new();

        loop {
            if let Some(reason) = self.stop_reason(ctx, pending, deadline) {
                self.log_stop(reason, &stats);
                break;
            }

            stats.polls += 1;
            match self.collaborators.inbox.find_messages_since(anchor) {
                Ok(messages) => {
                    for message in messages {
                        if processed.contains(&message.id) || self.is_cancelled() {
                            continue;
                        }
                        if seen.insert(message.id.clone()) {
                            stats.messages_seen += 1;
                        }
                        if self.handle_message(ctx, &message, &mut stats) {
                            processed.insert(message.id);
                        }
                    }
                }
                Err(e) => warn!("Inbox search failed on poll {}: {:#}", stats.polls, e),
            }

            let remaining = ctx.tracker.remaining_incomplete(pending);
            self.progress.publish(
                RunPhase::Concurrent,
                format!(
                    "Poll {}: waiting on {} emailed exports",
                    stats.polls,
                    remaining.len()
                ),
                &ctx.tracker,
            );

            if let Some(reason) = self.stop_reason(ctx, pending, deadline) {
                self.log_stop(reason, &stats);
                break;
            }

            let until_deadline = (deadline - self.clock().now())
                .to_std()
                .unwrap_or_default();
            self.clock().sleep(interval.min(until_deadline));
        }

        stats
    }

    fn stop_reason(
        &self,
        ctx: &RunContext,
        pending: &BTreeSet<Category>,
        deadline: DateTime<Utc>,
    ) -> Option<StopReason> {
        if self.is_cancelled() {
            Some(StopReason::Cancelled)
        } else if ctx.tracker.remaining_incomplete(pending).is_empty() {
            Some(StopReason::AllDelivered)
        } else if self.clock().now() >= deadline {
            Some(StopReason::Deadline)
        } else {
            None
        }
    }

    fn log_stop(&self, reason: StopReason, stats: &PollStats) {
        match reason {
            StopReason::Cancelled => warn!("Polling cancelled after {} polls", stats.polls),
            StopReason::AllDelivered => {
                info!("All emailed exports handled after {} polls", stats.polls)
            }
            StopReason::Deadline => warn!("Poll deadline reached after {} polls", stats.polls),
        }
    }

    /// Download, classify and save one message's files
    ///
    /// Returns whether the message is done with. A download failure leaves
    /// it unprocessed so the next poll retries it.
    fn handle_message(
        &self,
        ctx: &RunContext,
        message: &InboxMessage,
        stats: &mut PollStats,
    ) -> bool {
        let files = match self.collaborators.inbox.download_attachments(message) {
            Ok(files) => files,
            Err(e) => {
                stats.download_failures += 1;
                warn!(
                    "Failed to download attachments of message {} ({:?}), will retry: {:#}",
                    message.id.as_str(),
                    message.subject,
                    e
                );
                return false;
            }
        };

        if files.is_empty() {
            stats.unclassified += 1;
            debug!(
                "Message {} ({:?}) has no attachments",
                message.id.as_str(),
                message.subject
            );
            return true;
        }

        for (key, path) in &files {
            let Some(category) = classify(&message.subject, key) else {
                stats.unclassified += 1;
                warn!(
                    "Dropping unclassifiable attachment {} (subject {:?})",
                    key, message.subject
                );
                continue;
            };

            let Some(state) = ctx.tracker.get(category) else {
                stats.messages_discarded += 1;
                info!("{}: not requested in this run, ignoring {}", category, key);
                continue;
            };

            if ctx.files.is_satisfied(category) || state.is_terminal() {
                stats.messages_discarded += 1;
                info!(
                    "{}: already {}, discarding late delivery {}",
                    category,
                    state.label(),
                    key
                );
                continue;
            }

            debug!("{}: matched {} in message {}", category, key, message.id.as_str());
            if self.deliver(ctx, category, path, DeliveryMethod::Email) == DeliveryResult::Discarded {
                stats.messages_discarded += 1;
            }
        }

        true
    }
}
