//! Per-endpoint connection lifecycle.
//!
//! One [`ConnectionHandler`] is bound to each configured page server and
//! drives it through the connection state machine:
//!
//! ```text
//! IDLE          -> CONNECTING     connect() begins
//! CONNECTING    -> IDLE           connect() failure
//! CONNECTING    -> CONNECTED      catchup complete (active variant) or
//!                                 immediately after connect() (base)
//! CONNECTING    -> DISCONNECTING  external disconnect before catchup
//! CONNECTED     -> DISCONNECTING  any disconnect trigger
//! DISCONNECTING -> IDLE           async teardown finished
//! ```
//!
//! Disconnection is initiated synchronously (the state flips under the
//! exclusive state lock) and completed on a dedicated teardown thread, so
//! a request path never blocks on socket teardown.  Lock order within a
//! handler is `state` before `conn`; `send_recv` drops the state lock
//! before blocking so teardown can proceed and wake it.

use {
    crate::{
        channel::{Channel, ConnectCommand},
        conn::{Conn, RequestHandlers, SendErrorHandler, RecvErrorHandler},
        error::{CommError, Result, TranServerError},
        lsa::{Lsa, NULL_LSA},
        message::{decode_lsa, CatchUpRequest, PageToTranRequest, TranToPageRequest},
        node::PsNode,
        prior::{SinkFn, SinkId},
        server::ServerInner,
    },
    crossbeam_utils::atomic::AtomicCell,
    log::{debug, warn},
    parking_lot::{Mutex, RwLock},
    std::{
        collections::HashMap,
        fmt, io,
        sync::{
            atomic::{AtomicU64, Ordering},
            Arc, Weak,
        },
        thread::{self, JoinHandle},
        time::Duration,
    },
};

/// Channel name shared by every TS→PS connection.
const CHANNEL_NAME: &str = "TS_PS_comm";

/// Connection over which the transaction server talks to one page server.
pub(crate) type PageServerConn = Conn<TranToPageRequest, PageToTranRequest>;

/// Lifecycle state of one TS↔PS endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnState {
    Idle,
    Connecting,
    Connected,
    Disconnecting,
}

impl fmt::Display for ConnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Idle => "IDLE",
            Self::Connecting => "CONNECTING",
            Self::Connected => "CONNECTED",
            Self::Disconnecting => "DISCONNECTING",
        };
        f.write_str(name)
    }
}

/// Active-variant bookkeeping attached to a handler.
pub(crate) struct ActiveState {
    /// Highest LSA this page server reported as durably saved.
    saved_lsa: AtomicCell<Lsa>,
    /// Registration with the global prior sender while traffic flows.
    prior_sink: Mutex<Option<SinkId>>,
}

impl ActiveState {
    fn new() -> Self {
        Self {
            saved_lsa: AtomicCell::new(NULL_LSA),
            prior_sink: Mutex::new(None),
        }
    }
}

/// Owns one TS↔PS endpoint: its state machine, the live connection and the
/// asynchronous teardown.
pub struct ConnectionHandler {
    node: PsNode,
    server: Weak<ServerInner>,
    state: RwLock<ConnState>,
    conn: RwLock<Option<PageServerConn>>,
    // Bumped on every install; the I/O error callbacks carry the value of
    // their own connection so a stale one cannot touch a successor.
    conn_generation: AtomicU64,
    disconnect_join: Mutex<Option<JoinHandle<()>>>,
    active: Option<ActiveState>,
}

impl ConnectionHandler {
    pub(crate) fn new(node: PsNode, server: Weak<ServerInner>, active: bool) -> Arc<Self> {
        Arc::new(Self {
            node,
            server,
            state: RwLock::new(ConnState::Idle),
            conn: RwLock::new(None),
            conn_generation: AtomicU64::new(0),
            disconnect_join: Mutex::new(None),
            active: active.then(ActiveState::new),
        })
    }

    /// The endpoint this handler is bound to.
    pub fn node(&self) -> &PsNode {
        &self.node
    }

    /// Current state snapshot.
    pub fn state(&self) -> ConnState {
        *self.state.read()
    }

    pub fn is_connected(&self) -> bool {
        *self.state.read() == ConnState::Connected
    }

    pub fn is_idle(&self) -> bool {
        *self.state.read() == ConnState::Idle
    }

    /// Identifier of the live channel, or the endpoint when none exists.
    pub fn channel_id(&self) -> String {
        self.conn
            .read()
            .as_ref()
            .map(|conn| conn.channel_id().to_string())
            .unwrap_or_else(|| self.node.to_string())
    }

    /// Highest saved LSA this page server has reported.  Always
    /// [`NULL_LSA`] on the base variant.
    pub fn saved_lsa(&self) -> Lsa {
        self.active
            .as_ref()
            .map(|active| active.saved_lsa.load())
            .unwrap_or(NULL_LSA)
    }

    // ── Connecting ──────────────────────────────────────────────────────

    /// Dial the page server and run the type-echo handshake.
    ///
    /// Holds the state lock exclusively for the whole handshake; the
    /// handler is `IDLE` to everyone else meanwhile.  On success the base
    /// variant is `CONNECTED` when this returns, the active variant stays
    /// `CONNECTING` until the page server confirms catchup.
    pub fn connect(self: &Arc<Self>) -> Result<()> {
        let server = match self.server.upgrade() {
            Some(server) => server,
            None => return Err(TranServerError::PageServerCannotBeReached),
        };

        {
            let mut state = self.state.write();
            if *state != ConnState::Idle {
                // Someone else owns this endpoint already.
                return Ok(());
            }
            *state = ConnState::Connecting;

            if let Err(err) = self.open_channel(&server) {
                *state = ConnState::Idle;
                warn!("failed to connect to page server {}: {err}", self.node);
                return Err(TranServerError::NetPageServerConnection(
                    self.node.to_string(),
                ));
            }
        }

        self.transition_to_connected(&server);
        Ok(())
    }

    fn open_channel(self: &Arc<Self>, server: &Arc<ServerInner>) -> io::Result<()> {
        let poll_timeout = Duration::from_millis(server.config.channel_poll_timeout_ms);
        let mut channel = Channel::connect(
            self.node.host(),
            self.node.port(),
            ConnectCommand::ServerServerConnect,
            poll_timeout,
        )?;
        channel.set_channel_name(CHANNEL_NAME);

        channel.send_int(server.conn_type_wire())?;
        let echoed = channel.recv_int()?;
        if echoed != server.conn_type_wire() {
            return Err(io::Error::new(
                io::ErrorKind::InvalidData,
                "connection type echo mismatch",
            ));
        }

        self.install_conn(channel)
    }

    /// Wrap the handshaken channel into a running [`Conn`].
    fn install_conn(self: &Arc<Self>, channel: Channel) -> io::Result<()> {
        let channel_id = channel.channel_id();
        let generation = self.conn_generation.fetch_add(1, Ordering::SeqCst) + 1;

        let send_error: SendErrorHandler = {
            let weak = Arc::downgrade(self);
            let channel_id = channel_id.clone();
            Box::new(move |err, abort| {
                *abort = false;
                let Some(handler) = weak.upgrade() else { return };
                if handler.conn_generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                if err == CommError::ConnectionClosed {
                    // The socket died under us; tear the handler down.
                    *abort = true;
                    debug!("send error: abnormal disconnection detected. channel id: {channel_id}");
                    handler.disconnect_async(false);
                } else {
                    debug!("send error: {err}. channel id: {channel_id}");
                }
            })
        };
        let recv_error: RecvErrorHandler = {
            let weak = Arc::downgrade(self);
            let channel_id = channel_id.clone();
            Box::new(move |err| {
                let Some(handler) = weak.upgrade() else { return };
                if handler.conn_generation.load(Ordering::SeqCst) != generation {
                    return;
                }
                debug!(
                    "recv error: abnormal disconnection detected ({err}). channel id: {channel_id}"
                );
                handler.disconnect_async(false);
            })
        };

        let mut conn = Conn::new(
            channel,
            self.request_handlers(),
            TranToPageRequest::Respond,
            PageToTranRequest::Respond,
            RESPONSE_PARTITIONING_SIZE,
            send_error,
            recv_error,
        )?;
        conn.start();

        let mut slot = self.conn.write();
        debug_assert!(slot.is_none());
        *slot = Some(conn);
        drop(slot);

        debug!("transaction server connected to page server. channel id: {channel_id}");
        Ok(())
    }

    /// Inbound dispatch table for this endpoint.
    fn request_handlers(self: &Arc<Self>) -> RequestHandlers<PageToTranRequest> {
        let mut handlers: RequestHandlers<PageToTranRequest> = HashMap::new();

        let weak = Arc::downgrade(self);
        handlers.insert(
            PageToTranRequest::SendDisconnectRequestMsg,
            Box::new(move |_| {
                if let Some(handler) = weak.upgrade() {
                    handler.receive_disconnect_request();
                }
            }),
        );

        if self.active.is_some() {
            let weak = Arc::downgrade(self);
            handlers.insert(
                PageToTranRequest::SendSavedLsa,
                Box::new(move |sp| {
                    if let Some(handler) = weak.upgrade() {
                        handler.receive_saved_lsa(&sp.payload);
                    }
                }),
            );
            let weak = Arc::downgrade(self);
            handlers.insert(
                PageToTranRequest::SendCatchupComplete,
                Box::new(move |_| {
                    if let Some(handler) = weak.upgrade() {
                        handler.receive_catchup_complete();
                    }
                }),
            );
        }

        handlers
    }

    /// Variant-specific tail of `connect()`.
    fn transition_to_connected(self: &Arc<Self>, server: &Arc<ServerInner>) {
        match &self.active {
            None => {
                let mut state = self.state.write();
                if *state == ConnState::Connecting {
                    *state = ConnState::Connected;
                }
            }
            Some(active) => {
                let Some(ctx) = server.active_context() else {
                    return;
                };

                let sink: SinkFn = {
                    let weak = Arc::downgrade(self);
                    Arc::new(move |message: Vec<u8>| {
                        if let Some(handler) = weak.upgrade() {
                            handler.push_request_regardless_of_state(
                                TranToPageRequest::SendLogPriorList,
                                message,
                            );
                        }
                    })
                };
                let (sink_id, unsent_lsa) = ctx.prior_sender.add_sink(sink);
                {
                    let mut slot = active.prior_sink.lock();
                    if let Some(old) = slot.replace(sink_id) {
                        ctx.prior_sender.remove_sink(old);
                    }
                }

                // Before the first main connection exists there is nothing
                // to catch up from; the page server starts from scratch.
                let (host, port) = if unsent_lsa.is_null() {
                    ("N/A".to_string(), -1)
                } else {
                    server
                        .main_connection_info()
                        .unwrap_or_else(|| ("N/A".to_string(), -1))
                };
                self.send_start_catch_up_request(host, port, unsent_lsa);
                // State stays CONNECTING until SEND_CATCHUP_COMPLETE.
            }
        }
    }

    fn send_start_catch_up_request(&self, host: String, port: i32, catchup_lsa: Lsa) {
        let request = CatchUpRequest {
            host,
            port,
            catchup_lsa,
        };
        match request.to_bytes() {
            Ok(payload) => {
                self.push_request_regardless_of_state(TranToPageRequest::SendStartCatchUp, payload);
            }
            Err(err) => warn!("could not encode catchup request for {}: {err}", self.node),
        }
    }

    // ── Disconnecting ───────────────────────────────────────────────────

    /// Flip the handler to `DISCONNECTING` and finish teardown on a
    /// background thread.  Idempotent: calls while `IDLE` or already
    /// `DISCONNECTING` are no-ops.
    ///
    /// With `with_disc_msg` the teardown pushes one final
    /// `SEND_DISCONNECT_MSG`; after that the page server may free all state
    /// bound to this connection, so nothing else is sent.
    pub fn disconnect_async(self: &Arc<Self>, with_disc_msg: bool) {
        let mut state = self.state.write();
        match *state {
            ConnState::Idle | ConnState::Disconnecting => return,
            ConnState::Connecting | ConnState::Connected => {}
        }
        *state = ConnState::Disconnecting;

        // A finished teardown from a previous connect cycle may still hold
        // its join handle.
        let previous = self.disconnect_join.lock().take();
        if let Some(previous) = previous {
            let _ = previous.join();
        }

        let this = Arc::clone(self);
        let handle = thread::Builder::new()
            .name("psTeardown".to_string())
            .spawn(move || this.teardown(with_disc_msg))
            .expect("failed to spawn teardown thread");
        *self.disconnect_join.lock() = Some(handle);
    }

    fn teardown(self: Arc<Self>, with_disc_msg: bool) {
        let server = self.server.upgrade();

        self.on_disconnecting(server.as_ref());

        // Stop incoming traffic and wake threads waiting for a response,
        // informing them it will not be served.  This must happen outside
        // the exclusive conn lock: the waiters hold it shared.
        {
            let conn = self.conn.read();
            if let Some(conn) = conn.as_ref() {
                conn.stop_incoming_communication_thread();
            }
        }

        let drained = {
            let mut state = self.state.write();
            let mut conn = self.conn.write();
            debug_assert_eq!(*state, ConnState::Disconnecting);

            if with_disc_msg {
                if let (Some(conn), Some(server)) = (conn.as_ref(), server.as_ref()) {
                    let payload = server.conn_type_wire().to_le_bytes().to_vec();
                    let _ = conn.push(TranToPageRequest::SendDisconnectMsg, payload);
                }
            }

            let drained = conn.take();
            *state = ConnState::Idle;
            drained
        };

        // Dropping the connection joins its I/O threads; that must not run
        // under the handler locks, or a callback blocking on them would
        // deadlock the join.
        if let Some(drained) = drained {
            let channel_id = drained.channel_id().to_string();
            drop(drained);
            debug!("transaction server disconnected from page server. channel id: {channel_id}");
        }
    }

    /// Variant-specific head of teardown.
    fn on_disconnecting(&self, server: Option<&Arc<ServerInner>>) {
        let (Some(active), Some(server)) = (self.active.as_ref(), server) else {
            return;
        };
        let Some(ctx) = server.active_context() else {
            return;
        };
        if let Some(sink_id) = active.prior_sink.lock().take() {
            ctx.prior_sender.remove_sink(sink_id);
        }
    }

    /// Join the outstanding teardown, if any.  The handler is `IDLE`
    /// afterwards.
    pub fn wait_async_disconnection(&self) {
        let handle = self.disconnect_join.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        debug_assert_eq!(*self.state.read(), ConnState::Idle);
    }

    // ── Request paths ───────────────────────────────────────────────────

    /// Queue a fire-and-forget request on this endpoint.
    pub fn push_request(&self, req: TranToPageRequest, payload: Vec<u8>) -> Result<()> {
        let state = self.state.read();
        if *state != ConnState::Connected {
            return Err(TranServerError::PageServerCannotBeReached);
        }

        // CONNECTED guarantees the conn exists; the state lock is released
        // before queueing so teardown is never held up by a slow caller.
        let conn = self.conn.read();
        drop(state);
        match conn.as_ref() {
            Some(conn) => {
                let _ = conn.push(req, payload);
                Ok(())
            }
            None => Err(TranServerError::PageServerCannotBeReached),
        }
    }

    /// Queue a request without the `CONNECTED` check.  Used for catchup and
    /// prior-list traffic while the handler is still `CONNECTING`.
    pub fn push_request_regardless_of_state(&self, req: TranToPageRequest, payload: Vec<u8>) {
        let conn = self.conn.read();
        if let Some(conn) = conn.as_ref() {
            let _ = conn.push(req, payload);
        }
    }

    /// Send a request and block for the response.
    ///
    /// The state lock is dropped before the blocking round trip so a
    /// concurrent disconnect can proceed; the disconnect then forces this
    /// call to fail promptly.
    pub fn send_receive(&self, req: TranToPageRequest, payload: Vec<u8>) -> Result<Vec<u8>> {
        let state = self.state.read();
        if *state != ConnState::Connected {
            return Err(TranServerError::PageServerCannotBeReached);
        }

        let conn = self.conn.read();
        drop(state);
        let Some(conn) = conn.as_ref() else {
            return Err(TranServerError::PageServerCannotBeReached);
        };
        conn.send_recv(req, payload)
            .map_err(|_| TranServerError::PageServerCannotBeReached)
    }

    // ── Inbound requests ────────────────────────────────────────────────

    fn receive_disconnect_request(self: &Arc<Self>) {
        self.disconnect_async(true);
    }

    /// Handle `SEND_SAVED_LSA`.  The page server may repeat the current
    /// value; a regressed value is a protocol violation and is dropped.
    pub(crate) fn receive_saved_lsa(&self, payload: &[u8]) {
        let Some(active) = self.active.as_ref() else {
            return;
        };
        let saved_lsa = match decode_lsa(payload) {
            Ok(lsa) => lsa,
            Err(err) => {
                warn!("malformed saved-LSA payload from {}: {err}", self.node);
                return;
            }
        };

        let current = active.saved_lsa.load();
        debug_assert!(
            saved_lsa >= current,
            "saved LSA regressed on {}: {saved_lsa} < {current}",
            self.node
        );
        if saved_lsa < current {
            warn!(
                "ignoring regressed saved LSA {saved_lsa} from {} (current {current})",
                self.channel_id()
            );
            return;
        }

        let server = self.server.upgrade();
        if let Some(server) = server.as_ref() {
            if server.config.log_quorum_consensus {
                debug!("received saved LSA {saved_lsa} from {}", self.channel_id());
            }
        }

        if saved_lsa > current {
            active.saved_lsa.store(saved_lsa);
            if let Some(server) = server {
                if let Some(ctx) = server.active_context() {
                    ctx.flush_tracker.wakeup_waiters();
                }
            }
        }
    }

    /// Handle `SEND_CATCHUP_COMPLETE`: the gate from `CONNECTING` to
    /// `CONNECTED` on the active variant.
    pub(crate) fn receive_catchup_complete(&self) {
        let mut state = self.state.write();
        match *state {
            ConnState::Connecting => {
                *state = ConnState::Connected;
                drop(state);
                debug!("catchup completed. channel id: {}", self.channel_id());
            }
            // A disconnect won the race; the completion is moot.
            ConnState::Disconnecting => {}
            other => {
                debug_assert!(false, "catchup complete in state {other}");
            }
        }
    }
}

/// Number of response-waiter partitions per connection.
// TODO: size this from the configured client cap (`max_clients + 1`) once
// the response path is measured under contention.
const RESPONSE_PARTITIONING_SIZE: usize = 24;

impl Drop for ConnectionHandler {
    fn drop(&mut self) {
        self.wait_async_disconnection();
    }
}

impl fmt::Debug for ConnectionHandler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionHandler")
            .field("node", &self.node)
            .field("state", &*self.state.read())
            .finish()
    }
}
