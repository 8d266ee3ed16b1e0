//! A concurrent tournament manager for UCI chess engines: spawns engine
//! processes, plays paired games under configurable time controls and opening
//! books, adjudicates early endings, and aggregates results into pentanomial
//! statistics with an optional SPRT stopping rule.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

pub mod cli;
pub mod common;
pub mod engine;
pub mod pgn;
pub mod play;
pub mod report;
pub mod score;
pub mod tournament;

/// Cooperative cancellation shared by the scheduler, every game runner and
/// the signal handler. Whoever cancels also wakes the blocked engine reads
/// (via the process registry) so in-flight games notice immediately.
#[derive(Debug, Clone, Default)]
#[must_use]
pub struct CancelToken {
    cancelled: Arc<AtomicBool>,
}

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}
