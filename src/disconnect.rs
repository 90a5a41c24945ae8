//! Background destruction of drained connection handlers.
//!
//! Destroying a connection handler is slow: it joins the teardown thread,
//! which in turn joins the connection's I/O threads.  That must never run
//! on a request path or on the reconnect daemon, so handlers due for
//! destruction are queued here and dropped on a dedicated worker thread.
//!
//! One worker exists per handler class.

use {
    log::debug,
    parking_lot::{Condvar, Mutex},
    std::{
        mem,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{self, JoinHandle},
        time::Duration,
    },
};

struct WorkerShared<H> {
    queue: Mutex<Vec<H>>,
    queued: Condvar,
    terminate: AtomicBool,
}

/// Queue of handlers awaiting destruction, drained by one background
/// thread.  Dropping the dequeued entry is the heavy operation.
pub struct AsyncDisconnectWorker<H: Send + 'static> {
    shared: Arc<WorkerShared<H>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl<H: Send + 'static> AsyncDisconnectWorker<H> {
    pub fn new(thread_name: &str) -> Self {
        let shared = Arc::new(WorkerShared {
            queue: Mutex::new(Vec::new()),
            queued: Condvar::new(),
            terminate: AtomicBool::new(false),
        });
        let loop_shared = Arc::clone(&shared);
        let handle = thread::Builder::new()
            .name(thread_name.to_string())
            .spawn(move || disconnect_loop(loop_shared))
            .expect("failed to spawn async disconnect worker");
        Self {
            shared,
            thread: Mutex::new(Some(handle)),
        }
    }

    /// Enqueue a handler for destruction.
    ///
    /// # Panics
    ///
    /// Panics if the worker has already been terminated; nothing may ask
    /// for disconnection after shutdown.
    pub fn disconnect(&self, handler: H) {
        assert!(
            !self.shared.terminate.load(Ordering::SeqCst),
            "disconnect requested after worker termination"
        );
        let mut queue = self.shared.queue.lock();
        queue.push(handler);
        drop(queue);
        self.shared.queued.notify_one();
    }

    /// Stop the worker and join it.  The queue is drained to empty before
    /// the join returns.  Idempotent.
    pub fn terminate(&self) {
        if self.shared.terminate.swap(true, Ordering::SeqCst) {
            return;
        }
        self.shared.queued.notify_one();
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        debug_assert!(self.shared.queue.lock().is_empty());
        debug!("async disconnect worker terminated");
    }

    pub fn is_terminated(&self) -> bool {
        self.shared.terminate.load(Ordering::SeqCst)
    }
}

impl<H: Send + 'static> Drop for AsyncDisconnectWorker<H> {
    fn drop(&mut self) {
        self.terminate();
    }
}

fn disconnect_loop<H: Send + 'static>(shared: Arc<WorkerShared<H>>) {
    let wait_slice = Duration::from_secs(1);
    let mut work: Vec<H> = Vec::new();

    loop {
        {
            let mut queue = shared.queue.lock();
            if queue.is_empty() && !shared.terminate.load(Ordering::SeqCst) {
                let _ = shared.queued.wait_for(&mut queue, wait_slice);
            }
            mem::swap(&mut *queue, &mut work);
        }

        // Destructors run with the queue lock released.
        for handler in work.drain(..) {
            drop(handler);
        }

        if shared.terminate.load(Ordering::SeqCst) && shared.queue.lock().is_empty() {
            break;
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
