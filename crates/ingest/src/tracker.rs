//! Per-run category progress and delivered-file bookkeeping
//!
//! Both structures keep one lock per category so that writers working on
//! different categories never contend, and a snapshot never observes a
//! half-written state.

use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError, RwLock};

use thiserror::Error;

use crate::models::{Category, CategoryState};

/// Errors from mutating tracked state
#[derive(Debug, Error, PartialEq)]
pub enum StateError {
    #[error("{0} is not tracked in this run")]
    Untracked(Category),

    #[error("{category} is already {state} and cannot change")]
    AlreadyTerminal { category: Category, state: &'static str },
}

/// Single source of truth for category progress within one run
pub struct CategoryTracker {
    slots: [Option<RwLock<CategoryState>>; Category::COUNT],
}

impl CategoryTracker {
    /// Track the given categories, each starting in `Pending`
    pub fn new(categories: &[Category]) -> Self {
        Self {
            slots: std::array::from_fn(|i| {
                categories
                    .contains(&Category::ALL[i])
                    .then(|| RwLock::new(CategoryState::Pending))
            }),
        }
    }

    /// Move a category to a new state.
    ///
    /// Fails without writing if the category is untracked or already terminal.
    pub fn set(&self, category: Category, state: CategoryState) -> Result<(), StateError> {
        let slot = self.slot(category)?;
        let mut current = slot.write().unwrap_or_else(PoisonError::into_inner);
        if current.is_terminal() {
            return Err(StateError::AlreadyTerminal {
                category,
                state: current.label(),
            });
        }
        *current = state;
        Ok(())
    }

    /// Current state of a category, `None` if untracked
    pub fn get(&self, category: Category) -> Option<CategoryState> {
        self.slot(category)
            .ok()
            .map(|slot| slot.read().unwrap_or_else(PoisonError::into_inner).clone())
    }

    pub fn is_terminal(&self, category: Category) -> bool {
        self.get(category).is_some_and(|s| s.is_terminal())
    }

    /// Categories from `of` that have not reached a terminal state
    pub fn remaining_incomplete(&self, of: &BTreeSet<Category>) -> BTreeSet<Category> {
        of.iter()
            .copied()
            .filter(|&c| self.get(c).is_some_and(|s| !s.is_terminal()))
            .collect()
    }

    /// Consistent per-category copy of all tracked states
    pub fn snapshot(&self) -> BTreeMap<Category, CategoryState> {
        self.tracked()
            .filter_map(|c| self.get(c).map(|s| (c, s)))
            .collect()
    }

    pub fn total(&self) -> usize {
        self.tracked().count()
    }

    pub fn terminal_count(&self) -> usize {
        self.tracked().filter(|&c| self.is_terminal(c)).count()
    }

    /// Tracked categories in canonical order
    pub fn tracked(&self) -> impl Iterator<Item = Category> + '_ {
        Category::ALL
            .into_iter()
            .filter(|c| self.slots[c.index()].is_some())
    }

    fn slot(&self, category: Category) -> Result<&RwLock<CategoryState>, StateError> {
        self.slots[category.index()]
            .as_ref()
            .ok_or(StateError::Untracked(category))
    }
}

/// Result of offering a delivered file to [`ReportFiles::satisfy_with`]
#[derive(Debug)]
pub enum Delivery<T> {
    /// The save ran and succeeded; the category now holds this file
    Saved(T),
    /// The save ran and failed; the category remains unsatisfied
    Failed(anyhow::Error),
    /// Another delivery already satisfied the category; nothing ran
    AlreadySatisfied(PathBuf),
}

/// The file that satisfied each category, absent until a save succeeds
#[derive(Default)]
pub struct ReportFiles {
    slots: [Mutex<Option<PathBuf>>; Category::COUNT],
}

impl ReportFiles {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `save` for `path` unless the category is already satisfied.
    ///
    /// The category's slot stays locked while `save` runs, so concurrent
    /// deliveries for the same category serialize and only the first
    /// successful one is kept. Other categories are unaffected.
    pub fn satisfy_with<T, F>(&self, category: Category, path: &Path, save: F) -> Delivery<T>
    where
        F: FnOnce() -> anyhow::Result<T>,
    {
        let mut slot = self.slots[category.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = slot.as_ref() {
            return Delivery::AlreadySatisfied(existing.clone());
        }

        match save() {
            Ok(value) => {
                *slot = Some(path.to_path_buf());
                Delivery::Saved(value)
            }
            Err(e) => Delivery::Failed(e),
        }
    }

    pub fn get(&self, category: Category) -> Option<PathBuf> {
        self.slots[category.index()]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    pub fn is_satisfied(&self, category: Category) -> bool {
        self.get(category).is_some()
    }

    /// Every satisfied category and its file
    pub fn to_map(&self) -> BTreeMap<Category, PathBuf> {
        Category::ALL
            .into_iter()
            .filter_map(|c| self.get(c).map(|p| (c, p)))
            .collect()
    }
}
