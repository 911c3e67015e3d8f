//! Per-category trigger outcomes and run states

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use super::Category;

/// How a category's report file reached us
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryMethod {
    /// Captured synchronously by the triggering session
    Direct,
    /// Arrived later as an attachment in the monitored inbox
    Email,
}

impl fmt::Display for DeliveryMethod {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DeliveryMethod::Direct => f.write_str("direct"),
            DeliveryMethod::Email => f.write_str("email"),
        }
    }
}

/// Progress of one category within a run
///
/// `Saved` and `Failed` are terminal. `delivery` on `Failed` is `None` when
/// the category failed before any file was delivered (trigger failure).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum CategoryState {
    Pending,
    Triggering,
    Downloading,
    AwaitingMessage,
    Parsing { delivery: DeliveryMethod },
    Saved { record_count: usize, delivery: DeliveryMethod },
    Failed { error: String, delivery: Option<DeliveryMethod> },
}

impl CategoryState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, CategoryState::Saved { .. } | CategoryState::Failed { .. })
    }

    pub fn is_saved(&self) -> bool {
        matches!(self, CategoryState::Saved { .. })
    }

    /// Short label for progress output
    pub fn label(&self) -> &'static str {
        match self {
            CategoryState::Pending => "pending",
            CategoryState::Triggering => "triggering",
            CategoryState::Downloading => "downloading",
            CategoryState::AwaitingMessage => "awaiting message",
            CategoryState::Parsing { .. } => "parsing",
            CategoryState::Saved { .. } => "saved",
            CategoryState::Failed { .. } => "failed",
        }
    }
}

/// What the trigger phase produced for one category
#[derive(Debug, Clone, PartialEq)]
pub enum TriggerOutcome {
    DirectFile(PathBuf),
    Pending,
    Failed(String),
}

/// A file captured directly by the triggering session
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DirectCapture {
    pub category: Category,
    pub path: PathBuf,
}

/// A category the platform refused or the driver could not request
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TriggerFailure {
    pub category: Category,
    pub reason: String,
}

/// Everything a trigger driver reports for one run
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TriggerReport {
    #[serde(default)]
    pub direct: Vec<DirectCapture>,
    #[serde(default)]
    pub pending: Vec<Category>,
    #[serde(default)]
    pub failed: Vec<TriggerFailure>,
}

impl TriggerReport {
    /// Resolve exactly one outcome per requested category
    ///
    /// The first outcome reported for a category wins. Requested categories
    /// the driver never mentioned are failed; unrequested ones are dropped.
    /// Returns the outcomes plus a warning for every irregularity.
    pub fn outcomes_for(
        &self,
        requested: &[Category],
    ) -> (BTreeMap<Category, TriggerOutcome>, Vec<String>) {
        let mut outcomes = BTreeMap::new();
        let mut warnings = Vec::new();

        let reported = self
            .direct
            .iter()
            .map(|d| (d.category, TriggerOutcome::DirectFile(d.path.clone())))
            .chain(self.pending.iter().map(|&c| (c, TriggerOutcome::Pending)))
            .chain(
                self.failed
                    .iter()
                    .map(|f| (f.category, TriggerOutcome::Failed(f.reason.clone()))),
            );

        for (category, outcome) in reported {
            if !requested.contains(&category) {
                warnings.push(format!("{}: trigger reported an unrequested category", category));
                continue;
            }
            if outcomes.contains_key(&category) {
                warnings.push(format!("{}: duplicate trigger outcome ignored", category));
                continue;
            }
            outcomes.insert(category, outcome);
        }

        for &category in requested {
            outcomes.entry(category).or_insert_with(|| {
                warnings.push(format!("{}: no trigger outcome reported", category));
                TriggerOutcome::Failed("no trigger outcome reported".to_string())
            });
        }

        (outcomes, warnings)
    }
}
