//! Active transaction server variant.
//!
//! The active transaction server (ATS) is the single writer of the system:
//! it appends to the write-ahead log and streams every appended batch to
//! its page servers through the prior sender.  On top of the base
//! [`TranServer`] it tracks each page server's saved LSA, computes the
//! quorum consensus LSA over them and gates freshly connected page servers
//! behind the catchup handshake.

use {
    crate::{
        config::TranServerConfig,
        lsa::Lsa,
        message::{decode_mvccid, MvccId, TranToPageRequest, MVCCID_ALL_VISIBLE, MVCCID_FIRST,
                  MVCCID_NULL},
        prior::PriorSender,
        quorum::{consensus_lsa, PsFlushTracker},
        server::{ActiveContext, ConnType, TranServer},
    },
    std::{ops::Deref, sync::Arc},
};

/// Active transaction server: the base connection layer plus saved-LSA
/// tracking, consensus computation and the catchup handshake.
pub struct ActiveTranServer {
    server: TranServer,
    prior_sender: Arc<PriorSender>,
    flush_tracker: Arc<PsFlushTracker>,
}

impl ActiveTranServer {
    pub fn new(config: TranServerConfig) -> Self {
        let prior_sender = Arc::new(PriorSender::new());
        let flush_tracker = Arc::new(PsFlushTracker::new());
        let context = ActiveContext {
            prior_sender: Arc::clone(&prior_sender),
            flush_tracker: Arc::clone(&flush_tracker),
        };
        Self {
            server: TranServer::with_active(config, ConnType::Active, Some(context)),
            prior_sender,
            flush_tracker,
        }
    }

    /// The prior sender feeding appended log records to every connected
    /// page server.  The log-append layer broadcasts through it and
    /// advances its unsent LSA.
    pub fn prior_sender(&self) -> &Arc<PriorSender> {
        &self.prior_sender
    }

    /// Compute the consensus LSA over the connected page servers.
    ///
    /// Per-handler saved LSAs are read atomically, but the set is not a
    /// snapshot; a handler may connect or drop while collecting.  That is
    /// acceptable: the result is a lower bound either way.
    pub fn compute_consensus_lsa(&self) -> Lsa {
        let handlers = self.server.connection_handlers();
        let total_node_count = handlers.len();
        let collected: Vec<Lsa> = handlers
            .iter()
            .filter(|handler| handler.is_connected())
            .map(|handler| handler.saved_lsa())
            .collect();
        consensus_lsa(
            collected,
            total_node_count,
            self.server.inner.config.log_quorum_consensus,
        )
    }

    /// Block until a quorum of page servers has saved at least `target`.
    pub fn wait_for_ps_flushed_lsa(&self, target: Lsa) {
        self.flush_tracker
            .wait_for_flushed_lsa(target, || self.compute_consensus_lsa());
    }

    /// Last consensus value published to flush waiters.
    pub fn consensus_flushed_lsa(&self) -> Lsa {
        self.flush_tracker.consensus_flushed_lsa()
    }

    /// Ask the main page server for the oldest MVCCID any active
    /// transaction can still see.  Returns [`MVCCID_NULL`] when no page
    /// server could be reached.
    pub fn get_oldest_active_mvccid(&self) -> MvccId {
        let response = match self
            .server
            .send_receive(TranToPageRequest::GetOldestActiveMvccid, Vec::new())
        {
            Ok(response) => response,
            Err(_) => return MVCCID_NULL,
        };
        match decode_mvccid(&response) {
            Ok(oldest) => {
                // ALL_VISIBLE means the page server still waits for a
                // passive transaction server to report its own value.
                debug_assert!(oldest >= MVCCID_FIRST || oldest == MVCCID_ALL_VISIBLE);
                oldest
            }
            Err(_) => MVCCID_NULL,
        }
    }
}

impl Deref for ActiveTranServer {
    type Target = TranServer;

    fn deref(&self) -> &TranServer {
        &self.server
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
