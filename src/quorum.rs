//! Quorum agreement over page-server saved LSAs.
//!
//! The consensus LSA is the highest log address that a majority
//! (`N/2 + 1`) of the configured page servers report as durably saved.
//! Log-flush callers park on the [`PsFlushTracker`] until the consensus
//! catches up with their target.

use {
    crate::lsa::{Lsa, NULL_LSA},
    log::debug,
    parking_lot::{Condvar, Mutex},
    std::sync::atomic::{AtomicBool, Ordering},
};

/// Compute the consensus LSA over the saved LSAs of the currently
/// connected page servers.
///
/// `total_node_count` is the number of configured page servers, connected
/// or not; the quorum is the majority of that.  Returns [`NULL_LSA`] when
/// fewer than a quorum of values was collected.
///
/// With the collected values sorted ascending, the element at index
/// `len - quorum` is the greatest LSA that at least a quorum of page
/// servers have saved.
pub fn consensus_lsa(mut collected: Vec<Lsa>, total_node_count: usize, verbose: bool) -> Lsa {
    let quorum = total_node_count / 2 + 1;
    let current = collected.len();
    let quorum_met = current >= quorum;

    let consensus = if quorum_met {
        collected.sort_unstable();
        collected[current - quorum]
    } else {
        if verbose {
            // Sorting is only worth it when we are about to print the list.
            collected.sort_unstable();
        }
        NULL_LSA
    };

    if verbose {
        let list = collected
            .iter()
            .map(Lsa::to_string)
            .collect::<Vec<_>>()
            .join(" ");
        debug!(
            "quorum {}satisfied: total = {total_node_count}, current = {current}, \
             quorum = {quorum}, consensus LSA = {consensus}, collected = [ {list} ]",
            if quorum_met { "" } else { "un" },
        );
    }

    consensus
}

/// Waiter state for the consensus flushed LSA.
///
/// Whoever first notices the value is out of date recomputes it; everyone
/// else waits on the condvar.  [`wakeup_waiters`](Self::wakeup_waiters) is
/// called whenever any page server advances its saved LSA.
pub struct PsFlushTracker {
    flushed: Mutex<Lsa>,
    flushed_cv: Condvar,
    up_to_date: AtomicBool,
}

impl PsFlushTracker {
    pub fn new() -> Self {
        Self {
            flushed: Mutex::new(NULL_LSA),
            flushed_cv: Condvar::new(),
            up_to_date: AtomicBool::new(false),
        }
    }

    /// Mark the consensus stale and wake every waiter.
    pub fn wakeup_waiters(&self) {
        self.up_to_date.store(false, Ordering::SeqCst);
        let _flushed = self.flushed.lock();
        self.flushed_cv.notify_all();
    }

    /// Block until the consensus flushed LSA reaches `target`.
    ///
    /// `compute` produces a fresh consensus value; it is invoked by the one
    /// thread that wins the race to refresh.  A [`NULL_LSA`] result means
    /// the quorum is unmet and the refresher loops without sleeping so it
    /// can retry as soon as the staleness flag flips again.
    pub fn wait_for_flushed_lsa(&self, target: Lsa, compute: impl Fn() -> Lsa) {
        let mut flushed = self.flushed.lock();
        while *flushed < target {
            if !self.up_to_date.swap(true, Ordering::SeqCst) {
                let consensus = compute();
                if consensus.is_null() {
                    continue;
                }
                debug_assert!(*flushed <= consensus, "consensus LSA regressed");
                if consensus > *flushed {
                    *flushed = consensus;
                }
            } else {
                self.flushed_cv.wait(&mut flushed);
            }
        }
        debug!("quorum satisfied: page server flushed LSA = {}", *flushed);
    }

    /// Current consensus flushed LSA.
    pub fn consensus_flushed_lsa(&self) -> Lsa {
        *self.flushed.lock()
    }
}

impl Default for PsFlushTracker {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
