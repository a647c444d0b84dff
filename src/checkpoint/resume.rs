//! Resume Coordinator: what a previous run already persisted.

use std::collections::BTreeSet;

use tracing::{info, instrument};

use super::signature::QuerySignature;
use super::store::{CheckpointError, CheckpointStore};

/// Completed pages and holes for one query signature.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResumeState {
    /// Every persisted page index.
    pub completed_pages: BTreeSet<u64>,
    /// Largest `N` such that pages `0..=N` are all persisted; `None` when
    /// page 0 is missing.
    pub highest_contiguous: Option<u64>,
    /// Missing indices that must be fetched: below the terminal page when
    /// one is known, below the highest persisted page otherwise.
    pub gaps: BTreeSet<u64>,
    /// A persisted page was terminal.
    pub is_terminal_reached: bool,
    /// Lowest terminal page index seen.
    pub terminal_page: Option<u64>,
}

impl ResumeState {
    /// Derives the state from a set of persisted pages and the terminal
    /// pages among them.
    #[must_use]
    pub fn from_pages(completed_pages: BTreeSet<u64>, terminal_pages: &BTreeSet<u64>) -> Self {
        let terminal_page = terminal_pages.first().copied();

        let mut highest_contiguous = None;
        for (expected, &page) in (0u64..).zip(completed_pages.iter()) {
            if page != expected {
                break;
            }
            highest_contiguous = Some(page);
        }

        let bound = terminal_page.or_else(|| completed_pages.last().copied());
        let gaps = bound.map_or_else(BTreeSet::new, |bound| {
            (0..bound)
                .filter(|index| !completed_pages.contains(index))
                .collect()
        });

        Self {
            completed_pages,
            highest_contiguous,
            gaps,
            is_terminal_reached: terminal_page.is_some(),
            terminal_page,
        }
    }

    /// Highest persisted page index.
    #[must_use]
    pub fn highest_observed(&self) -> Option<u64> {
        self.completed_pages.last().copied()
    }

    /// First index never attempted by a previous run.
    #[must_use]
    pub fn next_new_page(&self) -> u64 {
        self.highest_observed().map_or(0, |highest| highest + 1)
    }

    /// Nothing left to fetch: the end is known and nothing below it is missing.
    #[must_use]
    pub fn is_complete(&self) -> bool {
        self.is_terminal_reached && self.gaps.is_empty()
    }
}

/// Inspects `store` for pages persisted under `signature`.
///
/// A missing or empty store yields the fresh-run state.
///
/// # Errors
///
/// Returns [`CheckpointError::Io`] if the store exists but cannot be listed.
#[instrument(skip(store), fields(signature = %signature, root = %store.root().display()))]
pub fn scan(store: &CheckpointStore, signature: &QuerySignature) -> Result<ResumeState, CheckpointError> {
    let units = store.units(signature)?;
    let completed = units.iter().map(|unit| unit.page_index).collect();
    let terminal = units
        .iter()
        .filter(|unit| unit.is_terminal)
        .map(|unit| unit.page_index)
        .collect();

    let state = ResumeState::from_pages(completed, &terminal);
    if !state.completed_pages.is_empty() {
        info!(
            pages = state.completed_pages.len(),
            highest_contiguous = ?state.highest_contiguous,
            gaps = state.gaps.len(),
            terminal = ?state.terminal_page,
            "resuming from checkpoints"
        );
    }
    Ok(state)
}
