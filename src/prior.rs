//! Log prior-list fan-out.
//!
//! The log-append layer hands every batch of newly appended log records to
//! the [`PriorSender`], which forwards it to all registered sinks.  Each
//! sink typically pushes the batch to one page server.  `add_sink` also
//! reports the first LSA the sender has not yet streamed, which becomes the
//! catchup target for a freshly connected page server.

use {
    crate::lsa::{Lsa, NULL_LSA},
    parking_lot::Mutex,
    std::sync::Arc,
};

/// A registered sink callback.
pub type SinkFn = Arc<dyn Fn(Vec<u8>) + Send + Sync + 'static>;

/// Registration token returned by [`PriorSender::add_sink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SinkId(u64);

struct PriorSenderInner {
    sinks: Vec<(SinkId, SinkFn)>,
    next_id: u64,
    unsent_lsa: Lsa,
}

/// Fan-out of appended log messages to every registered sink.
pub struct PriorSender {
    inner: Mutex<PriorSenderInner>,
}

impl PriorSender {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(PriorSenderInner {
                sinks: Vec::new(),
                next_id: 0,
                unsent_lsa: NULL_LSA,
            }),
        }
    }

    /// Register a sink.  Returns its token and the first LSA not yet sent,
    /// observed atomically with the registration.
    pub fn add_sink(&self, sink: SinkFn) -> (SinkId, Lsa) {
        let mut inner = self.inner.lock();
        let id = SinkId(inner.next_id);
        inner.next_id += 1;
        inner.sinks.push((id, sink));
        (id, inner.unsent_lsa)
    }

    /// Remove a previously registered sink.  Unknown tokens are ignored.
    pub fn remove_sink(&self, id: SinkId) {
        self.inner.lock().sinks.retain(|(sid, _)| *sid != id);
    }

    pub fn sink_count(&self) -> usize {
        self.inner.lock().sinks.len()
    }

    /// Forward one message to every sink.  Callbacks run outside the
    /// registry lock.
    pub fn send(&self, message: Vec<u8>) {
        let sinks: Vec<SinkFn> = self
            .inner
            .lock()
            .sinks
            .iter()
            .map(|(_, sink)| Arc::clone(sink))
            .collect();
        for sink in sinks {
            sink(message.clone());
        }
    }

    /// Advance the first-unsent LSA; called by the log-append layer.
    pub fn set_unsent_lsa(&self, lsa: Lsa) {
        self.inner.lock().unsent_lsa = lsa;
    }

    pub fn unsent_lsa(&self) -> Lsa {
        self.inner.lock().unsent_lsa
    }
}

impl Default for PriorSender {
    fn default() -> Self {
        Self::new()
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
