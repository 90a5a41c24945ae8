//! Transaction server core: boot, request routing and reconnection.
//!
//! The [`TranServer`] owns one [`ConnectionHandler`] per configured page
//! server.  Outbound requests go through the *main* connection, selected as
//! the first `CONNECTED` handler in registration order; on delivery failure
//! the caller rotates it under the exclusive main-connection lock and
//! retries.  A periodic daemon ([`PsConnector`]) redials idle endpoints in
//! the background.
//!
//! Lock order across the layer is `main_conn` before a handler's `state`
//! before its `conn`; nothing acquires upwards.

use {
    crate::{
        config::TranServerConfig,
        disconnect::AsyncDisconnectWorker,
        error::{Result, TranServerError},
        handler::ConnectionHandler,
        message::{decode_boot_info, TranToPageRequest, VOLID_MAX},
        node::parse_host_list,
        prior::PriorSender,
        quorum::PsFlushTracker,
    },
    crossbeam_channel::{RecvTimeoutError, Sender},
    log::{debug, info},
    parking_lot::{Mutex, RwLock},
    std::{
        mem,
        sync::{
            atomic::{AtomicBool, Ordering},
            Arc,
        },
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    },
};

/// Connection type exchanged in the type-echo handshake.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnType {
    /// Active transaction server.
    Active = 0,
    /// Passive (read-only) transaction server.
    Passive = 1,
}

/// Collaborators only the active variant carries.
pub(crate) struct ActiveContext {
    pub(crate) prior_sender: Arc<PriorSender>,
    pub(crate) flush_tracker: Arc<PsFlushTracker>,
}

/// State shared between the server facade, its handlers and the daemon.
pub(crate) struct ServerInner {
    server_name: RwLock<String>,
    conn_type: ConnType,
    pub(crate) config: TranServerConfig,
    handlers: RwLock<Vec<Arc<ConnectionHandler>>>,
    main_conn: RwLock<Option<Arc<ConnectionHandler>>>,
    active: Option<ActiveContext>,
}

impl ServerInner {
    pub(crate) fn conn_type_wire(&self) -> i32 {
        self.conn_type as i32
    }

    pub(crate) fn active_context(&self) -> Option<&ActiveContext> {
        self.active.as_ref()
    }

    /// Host and port of the current main connection.
    pub(crate) fn main_connection_info(&self) -> Option<(String, i32)> {
        self.main_conn
            .read()
            .as_ref()
            .map(|handler| {
                (
                    handler.node().host().to_string(),
                    i32::from(handler.node().port()),
                )
            })
    }

    /// Re-select the main connection.
    ///
    /// Priority is fixed registration order, so rotation is deterministic.
    /// When no handler is connected the slot is cleared and
    /// [`TranServerError::NoPageServerAvailable`] is returned.
    pub(crate) fn reset_main_connection(&self) -> Result<()> {
        let mut main_conn = self.main_conn.write();

        let candidate = self
            .handlers
            .read()
            .iter()
            .find(|handler| handler.is_connected())
            .cloned();

        let Some(candidate) = candidate else {
            *main_conn = None;
            return Err(TranServerError::NoPageServerAvailable);
        };

        let changed = main_conn
            .as_ref()
            .map_or(true, |current| !Arc::ptr_eq(current, &candidate));
        if changed {
            info!("main connection set to {}", candidate.channel_id());
            *main_conn = Some(candidate);
        }
        Ok(())
    }

    fn handlers_snapshot(&self) -> Vec<Arc<ConnectionHandler>> {
        self.handlers.read().clone()
    }
}

enum Attempt<T> {
    Done(T),
    Rotate,
}

/// Transaction-server side of the page-server pool.
pub struct TranServer {
    pub(crate) inner: Arc<ServerInner>,
    connector: PsConnector,
    disconnect_worker: AsyncDisconnectWorker<Arc<ConnectionHandler>>,
    shut_down: AtomicBool,
}

impl TranServer {
    /// Base-variant server.  It never reports remote storage; build an
    /// [`ActiveTranServer`](crate::active::ActiveTranServer) for the
    /// consensus and catchup machinery.
    pub fn new(config: TranServerConfig, conn_type: ConnType) -> Self {
        Self::with_active(config, conn_type, None)
    }

    pub(crate) fn with_active(
        config: TranServerConfig,
        conn_type: ConnType,
        active: Option<ActiveContext>,
    ) -> Self {
        let inner = Arc::new(ServerInner {
            server_name: RwLock::new(String::new()),
            conn_type,
            config,
            handlers: RwLock::new(Vec::new()),
            main_conn: RwLock::new(None),
            active,
        });
        Self {
            inner,
            connector: PsConnector::new(),
            disconnect_worker: AsyncDisconnectWorker::new("psHandlerDrop"),
            shut_down: AtomicBool::new(false),
        }
    }

    /// Boot the connection layer for database `db_name`.
    ///
    /// Parses the hosts configuration, dials every endpoint once, waits for
    /// the first main connection and starts the reconnect daemon.  With
    /// remote storage the boot-info round trip is verified as well.
    pub fn boot(&self, db_name: &str) -> Result<()> {
        *self.inner.server_name.write() = db_name.to_string();

        self.init_page_server_hosts()?;
        self.prepare_connections()?;

        if !self.inner.handlers.read().is_empty() {
            // The main connection may take a moment: the active variant
            // keeps a handler in CONNECTING until its catchup completes.
            let started = Instant::now();
            let timeout = Duration::from_millis(self.inner.config.boot_timeout_ms);
            let retry = Duration::from_millis(self.inner.config.boot_retry_interval_ms);
            loop {
                match self.inner.reset_main_connection() {
                    Ok(()) => break,
                    Err(err) => {
                        if started.elapsed() >= timeout {
                            return Err(err);
                        }
                        thread::sleep(retry);
                    }
                }
            }

            self.connector.start(Arc::clone(&self.inner));
        }

        if self.uses_remote_storage() {
            self.get_boot_info_from_page_server()?;
        }

        Ok(())
    }

    /// Parse the hosts configuration, register handlers and dial each one.
    fn init_page_server_hosts(&self) -> Result<()> {
        debug_assert!(self.inner.handlers.read().is_empty());

        let hosts = self.inner.config.page_server_hosts.clone();
        let remote_storage = self.get_remote_storage_config();

        if hosts.is_empty() {
            if remote_storage {
                return Err(TranServerError::EmptyPageServerHostsConfig);
            }
            // No page servers, local storage only.
            return Ok(());
        }

        let (nodes, parse_error) = parse_host_list(&hosts);
        {
            let mut handlers = self.inner.handlers.write();
            for node in nodes {
                handlers.push(ConnectionHandler::new(
                    node,
                    Arc::downgrade(&self.inner),
                    self.inner.active.is_some(),
                ));
            }
        }

        let handlers = self.inner.handlers_snapshot();
        if handlers.is_empty() {
            return Err(parse_error.unwrap_or(TranServerError::HostPortParameter(hosts)));
        }
        // At least one host validated; errors from the bad tokens are
        // dropped here.

        let mut connected = 0usize;
        for handler in &handlers {
            if handler.connect().is_ok() {
                connected += 1;
            }
        }

        if connected == 0 && remote_storage {
            return Err(TranServerError::NoPageServerConnection);
        }
        // Partial connect failures are cleared as long as one endpoint
        // accepted; the reconnect daemon keeps retrying the rest.

        debug!(
            "transaction server runs on {} storage",
            if remote_storage { "remote" } else { "local" }
        );
        Ok(())
    }

    /// Variant hook between host registration and main-connection wait.
    fn prepare_connections(&self) -> Result<()> {
        // TODO: collect the saved LSA of every page server here and derive
        // the boot-time catchup target from the quorum instead of sending
        // each one the unsent LSA of the moment it connected.
        Ok(())
    }

    /// Whether this server requires remote page-server storage.  The base
    /// variant never does; the active variant answers from configuration.
    pub fn uses_remote_storage(&self) -> bool {
        self.get_remote_storage_config()
    }

    fn get_remote_storage_config(&self) -> bool {
        self.inner.active.is_some() && self.inner.config.remote_storage
    }

    fn get_boot_info_from_page_server(&self) -> Result<()> {
        let response = self.send_receive(TranToPageRequest::GetBootInfo, Vec::new())?;
        let nvols_permanent = decode_boot_info(&response)?;
        // The sentinel only proves the round trip reached the right
        // responder; the count itself is unused on this side.
        debug_assert_eq!(nvols_permanent, VOLID_MAX);
        Ok(())
    }

    // ── Request paths ───────────────────────────────────────────────────

    /// Queue a fire-and-forget request on the main connection.
    ///
    /// On delivery failure against a dead main connection the slot is
    /// rotated and the push retried; when no page server is reachable at
    /// all the request is dropped silently.
    pub fn push_request(&self, req: TranToPageRequest, payload: Vec<u8>) {
        loop {
            let main_conn = self.inner.main_conn.read();
            let attempt = match main_conn.as_ref() {
                None => Attempt::Rotate,
                Some(main) => match main.push_request(req, payload.clone()) {
                    Ok(()) => Attempt::Done(()),
                    Err(_) if !main.is_connected() => Attempt::Rotate,
                    // The connection still looks alive; don't spin on it.
                    Err(_) => Attempt::Done(()),
                },
            };
            drop(main_conn);

            match attempt {
                Attempt::Done(()) => return,
                Attempt::Rotate => {
                    if self.inner.reset_main_connection().is_err() {
                        // Nothing reachable; push semantics are best effort.
                        return;
                    }
                }
            }
        }
    }

    /// Round-trip a request over the main connection.
    ///
    /// Rotates and retries like [`push_request`](Self::push_request), but
    /// surfaces [`TranServerError::NoPageServerAvailable`] to the caller
    /// when every page server is gone.
    pub fn send_receive(&self, req: TranToPageRequest, payload: Vec<u8>) -> Result<Vec<u8>> {
        loop {
            let main_conn = self.inner.main_conn.read();
            let attempt = match main_conn.as_ref() {
                None => Attempt::Rotate,
                Some(main) => match main.send_receive(req, payload.clone()) {
                    Ok(response) => Attempt::Done(Ok(response)),
                    Err(err) if !main.is_connected() => {
                        debug!("send_receive failed on dead main connection: {err}");
                        Attempt::Rotate
                    }
                    Err(err) => Attempt::Done(Err(err)),
                },
            };
            drop(main_conn);

            match attempt {
                Attempt::Done(result) => return result,
                Attempt::Rotate => self.inner.reset_main_connection()?,
            }
        }
    }

    // ── Introspection ───────────────────────────────────────────────────

    /// Handlers in registration order.
    pub fn connection_handlers(&self) -> Vec<Arc<ConnectionHandler>> {
        self.inner.handlers_snapshot()
    }

    /// Whether any page server is currently connected.
    pub fn is_page_server_connected(&self) -> bool {
        self.inner
            .handlers
            .read()
            .iter()
            .any(|handler| handler.is_connected())
    }

    /// Host and port of the current main connection.
    pub fn main_connection_info(&self) -> Option<(String, i32)> {
        self.inner.main_connection_info()
    }

    // ── Shutdown ────────────────────────────────────────────────────────

    /// Disconnect every page server: stop the reconnect daemon, initiate
    /// teardown on each handler, then wait for all of them.
    pub fn disconnect_all_page_servers(&self) {
        self.connector.terminate();

        let handlers = self.inner.handlers_snapshot();
        for handler in &handlers {
            handler.disconnect_async(true);
        }
        for handler in &handlers {
            handler.wait_async_disconnection();
        }
        debug!("transaction server disconnected from all page servers");
    }

    /// Full shutdown; also runs on drop.  Final handler destruction is
    /// routed through the async-disconnect worker.
    pub fn shutdown(&self) {
        if self.shut_down.swap(true, Ordering::SeqCst) {
            return;
        }
        self.connector.terminate();
        if !self.inner.handlers.read().is_empty() {
            self.disconnect_all_page_servers();
        }
        *self.inner.main_conn.write() = None;

        let drained = mem::take(&mut *self.inner.handlers.write());
        for handler in drained {
            self.disconnect_worker.disconnect(handler);
        }
        self.disconnect_worker.terminate();
    }
}

impl Drop for TranServer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

// ── Reconnect daemon ────────────────────────────────────────────────────────

/// Periodic daemon that redials every `IDLE` handler and refreshes the
/// main connection when one of them comes back.
pub(crate) struct PsConnector {
    terminate: Arc<AtomicBool>,
    shutdown_tx: Mutex<Option<Sender<()>>>,
    thread: Mutex<Option<JoinHandle<()>>>,
}

impl PsConnector {
    fn new() -> Self {
        Self {
            // Not running until started.
            terminate: Arc::new(AtomicBool::new(true)),
            shutdown_tx: Mutex::new(None),
            thread: Mutex::new(None),
        }
    }

    pub(crate) fn start(&self, inner: Arc<ServerInner>) {
        assert!(
            self.terminate.load(Ordering::SeqCst),
            "page-server connector started twice"
        );
        self.terminate.store(false, Ordering::SeqCst);

        let (shutdown_tx, shutdown_rx) = crossbeam_channel::bounded::<()>(1);
        *self.shutdown_tx.lock() = Some(shutdown_tx);

        let terminate = Arc::clone(&self.terminate);
        let period = Duration::from_millis(inner.config.connector_period_ms);
        let handle = thread::Builder::new()
            .name("psConnector".to_string())
            .spawn(move || loop {
                match shutdown_rx.recv_timeout(period) {
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    Err(RecvTimeoutError::Timeout) => {}
                }
                if terminate.load(Ordering::SeqCst) {
                    break;
                }
                Self::try_connect_to_all_ps(&inner, &terminate);
            })
            .expect("failed to spawn page-server connector thread");
        *self.thread.lock() = Some(handle);
    }

    fn try_connect_to_all_ps(inner: &Arc<ServerInner>, terminate: &AtomicBool) {
        let mut newly_connected = false;
        for handler in inner.handlers_snapshot() {
            if handler.is_idle() {
                // Still noisy when a page server stays down: every period
                // logs another failed dial.
                if handler.connect().is_ok() {
                    newly_connected = true;
                }
            }
            if terminate.load(Ordering::SeqCst) {
                return;
            }
        }

        if newly_connected {
            // The fresh handler may still be CONNECTING (catchup pending),
            // in which case there may be nothing to select yet.
            if let Err(err) = inner.reset_main_connection() {
                debug!("main connection not reset after reconnect: {err}");
            }
        }
    }

    /// Stop the daemon.  Idempotent; safe to call before `start`.
    pub(crate) fn terminate(&self) {
        if self.terminate.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(shutdown_tx) = self.shutdown_tx.lock().take() {
            let _ = shutdown_tx.send(());
        }
        let handle = self.thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }
}

impl Drop for PsConnector {
    fn drop(&mut self) {
        self.terminate();
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
