//! A mock page server speaking the TS↔PS wire protocol in reverse.
//!
//! Accepts real TCP connections, performs the connect-command and type-echo
//! handshake, then runs a mirrored [`Conn`] whose handlers answer boot-info
//! and MVCCID round trips, acknowledge catchup requests and record
//! everything the transaction server pushes.

#![allow(dead_code)]

use {
    pagelink::{
        channel::Channel,
        conn::{Conn, ConnSender, RequestHandlers},
        lsa::Lsa,
        message::{
            encode_boot_info, encode_lsa, encode_mvccid, CatchUpRequest, PageToTranRequest,
            TranToPageRequest, MVCCID_FIRST,
        },
    },
    std::{
        collections::HashMap,
        io,
        net::{TcpListener, TcpStream},
        sync::{
            atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering},
            Arc, Mutex, OnceLock,
        },
        thread::{self, JoinHandle},
        time::{Duration, Instant},
    },
};

const POLL: Duration = Duration::from_millis(1000);

/// Mirror-direction connection: the mock sends page→tran requests and
/// answers tran→page ones.
type MockConn = Conn<PageToTranRequest, TranToPageRequest>;

pub struct MockSession {
    // Dropped before `conn` so the send thread sees its queue close.
    pub sender: ConnSender<PageToTranRequest>,
    pub conn: MockConn,
    pub conn_type: i32,
}

#[derive(Default)]
struct Recorded {
    catchups: Mutex<Vec<CatchUpRequest>>,
    prior_lists: Mutex<Vec<Vec<u8>>>,
    disconnect_msgs: AtomicUsize,
}

pub struct MockPageServer {
    port: u16,
    accepting: Arc<AtomicBool>,
    auto_catchup: Arc<AtomicBool>,
    respond_boot_info: Arc<AtomicBool>,
    echo_delta: Arc<AtomicI32>,
    oldest_mvccid: Arc<AtomicUsize>,
    recorded: Arc<Recorded>,
    sessions: Arc<Mutex<Vec<MockSession>>>,
    shutdown: Arc<AtomicBool>,
    accept_thread: Option<JoinHandle<()>>,
}

impl MockPageServer {
    pub fn start() -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").expect("bind mock page server");
        let port = listener.local_addr().unwrap().port();
        listener.set_nonblocking(true).unwrap();

        let accepting = Arc::new(AtomicBool::new(true));
        let auto_catchup = Arc::new(AtomicBool::new(true));
        let respond_boot_info = Arc::new(AtomicBool::new(true));
        let echo_delta = Arc::new(AtomicI32::new(0));
        let oldest_mvccid = Arc::new(AtomicUsize::new(MVCCID_FIRST as usize));
        let recorded = Arc::new(Recorded::default());
        let sessions = Arc::new(Mutex::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_thread = {
            let accepting = Arc::clone(&accepting);
            let auto_catchup = Arc::clone(&auto_catchup);
            let respond_boot_info = Arc::clone(&respond_boot_info);
            let echo_delta = Arc::clone(&echo_delta);
            let oldest_mvccid = Arc::clone(&oldest_mvccid);
            let recorded = Arc::clone(&recorded);
            let sessions = Arc::clone(&sessions);
            let shutdown = Arc::clone(&shutdown);
            thread::spawn(move || {
                while !shutdown.load(Ordering::SeqCst) {
                    match listener.accept() {
                        Ok((stream, _)) => {
                            if !accepting.load(Ordering::SeqCst) {
                                drop(stream);
                                continue;
                            }
                            let attached = attach_session(
                                stream,
                                &auto_catchup,
                                &respond_boot_info,
                                &echo_delta,
                                &oldest_mvccid,
                                &recorded,
                            );
                            match attached {
                                Ok(session) => sessions.lock().unwrap().push(session),
                                Err(err) => eprintln!("mock page server handshake failed: {err}"),
                            }
                        }
                        Err(err) if err.kind() == io::ErrorKind::WouldBlock => {
                            thread::sleep(Duration::from_millis(10));
                        }
                        Err(_) => break,
                    }
                }
            })
        };

        Self {
            port,
            accepting,
            auto_catchup,
            respond_boot_info,
            echo_delta,
            oldest_mvccid,
            recorded,
            sessions,
            shutdown,
            accept_thread: Some(accept_thread),
        }
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// This server's `host:port` token for the hosts configuration.
    pub fn hosts_entry(&self) -> String {
        format!("127.0.0.1:{}", self.port)
    }

    /// Accept or refuse new connections.  Refused connections are accepted
    /// at the TCP level and dropped before the handshake.
    pub fn set_accepting(&self, accepting: bool) {
        self.accepting.store(accepting, Ordering::SeqCst);
    }

    /// Whether catchup requests are acknowledged immediately.
    pub fn set_auto_catchup(&self, auto: bool) {
        self.auto_catchup.store(auto, Ordering::SeqCst);
    }

    /// Whether boot-info requests are answered at all.
    pub fn set_respond_boot_info(&self, respond: bool) {
        self.respond_boot_info.store(respond, Ordering::SeqCst);
    }

    /// Corrupt the type-echo handshake by this delta.
    pub fn set_echo_delta(&self, delta: i32) {
        self.echo_delta.store(delta, Ordering::SeqCst);
    }

    pub fn session_count(&self) -> usize {
        self.sessions.lock().unwrap().len()
    }

    /// Close every live session, as a crashing page server would.
    pub fn drop_sessions(&self) {
        self.sessions.lock().unwrap().clear();
    }

    /// Push `SEND_SAVED_LSA` on every live session.
    pub fn send_saved_lsa(&self, lsa: Lsa) {
        let payload = encode_lsa(&lsa).unwrap();
        for session in self.sessions.lock().unwrap().iter() {
            let _ = session
                .sender
                .push(PageToTranRequest::SendSavedLsa, payload.clone());
        }
    }

    /// Push `SEND_CATCHUP_COMPLETE` on every live session.
    pub fn complete_catchup(&self) {
        for session in self.sessions.lock().unwrap().iter() {
            let _ = session
                .sender
                .push(PageToTranRequest::SendCatchupComplete, Vec::new());
        }
    }

    /// Ask the transaction server to disconnect from us.
    pub fn request_disconnect(&self) {
        for session in self.sessions.lock().unwrap().iter() {
            let _ = session
                .sender
                .push(PageToTranRequest::SendDisconnectRequestMsg, Vec::new());
        }
    }

    pub fn catchup_requests(&self) -> Vec<CatchUpRequest> {
        self.recorded.catchups.lock().unwrap().clone()
    }

    pub fn prior_lists(&self) -> Vec<Vec<u8>> {
        self.recorded.prior_lists.lock().unwrap().clone()
    }

    pub fn disconnect_msg_count(&self) -> usize {
        self.recorded.disconnect_msgs.load(Ordering::SeqCst)
    }
}

impl Drop for MockPageServer {
    fn drop(&mut self) {
        self.shutdown.store(true, Ordering::SeqCst);
        if let Some(handle) = self.accept_thread.take() {
            let _ = handle.join();
        }
        self.drop_sessions();
    }
}

fn attach_session(
    stream: TcpStream,
    auto_catchup: &Arc<AtomicBool>,
    respond_boot_info: &Arc<AtomicBool>,
    echo_delta: &Arc<AtomicI32>,
    oldest_mvccid: &Arc<AtomicUsize>,
    recorded: &Arc<Recorded>,
) -> io::Result<MockSession> {
    let mut channel = Channel::from_stream(stream, POLL)?;
    let _command = channel.recv_int()?;
    let conn_type = channel.recv_int()?;
    channel.send_int(conn_type + echo_delta.load(Ordering::SeqCst))?;

    let sender_cell: Arc<OnceLock<ConnSender<PageToTranRequest>>> = Arc::new(OnceLock::new());
    let mut handlers: RequestHandlers<TranToPageRequest> = HashMap::new();

    {
        let sender_cell = Arc::clone(&sender_cell);
        let respond_boot_info = Arc::clone(respond_boot_info);
        handlers.insert(
            TranToPageRequest::GetBootInfo,
            Box::new(move |sp| {
                if !respond_boot_info.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(sender) = sender_cell.get() {
                    let _ = sender.respond(sp.eid, encode_boot_info());
                }
            }),
        );
    }
    {
        let sender_cell = Arc::clone(&sender_cell);
        let oldest_mvccid = Arc::clone(oldest_mvccid);
        handlers.insert(
            TranToPageRequest::GetOldestActiveMvccid,
            Box::new(move |sp| {
                if let Some(sender) = sender_cell.get() {
                    let oldest = oldest_mvccid.load(Ordering::SeqCst) as u64;
                    let _ = sender.respond(sp.eid, encode_mvccid(oldest));
                }
            }),
        );
    }
    {
        let sender_cell = Arc::clone(&sender_cell);
        let auto_catchup = Arc::clone(auto_catchup);
        let recorded = Arc::clone(recorded);
        handlers.insert(
            TranToPageRequest::SendStartCatchUp,
            Box::new(move |sp| {
                if let Ok(request) = CatchUpRequest::from_bytes(&sp.payload) {
                    recorded.catchups.lock().unwrap().push(request);
                }
                if auto_catchup.load(Ordering::SeqCst) {
                    if let Some(sender) = sender_cell.get() {
                        let _ = sender.push(PageToTranRequest::SendCatchupComplete, Vec::new());
                    }
                }
            }),
        );
    }
    {
        let recorded = Arc::clone(recorded);
        handlers.insert(
            TranToPageRequest::SendLogPriorList,
            Box::new(move |sp| {
                recorded.prior_lists.lock().unwrap().push(sp.payload);
            }),
        );
    }
    {
        let recorded = Arc::clone(recorded);
        handlers.insert(
            TranToPageRequest::SendDisconnectMsg,
            Box::new(move |_| {
                recorded.disconnect_msgs.fetch_add(1, Ordering::SeqCst);
            }),
        );
    }

    let mut conn = Conn::new(
        channel,
        handlers,
        PageToTranRequest::Respond,
        TranToPageRequest::Respond,
        4,
        Box::new(|_, abort| *abort = true),
        Box::new(|_| {}),
    )?;
    let sender = conn.sender();
    let _ = sender_cell.set(sender.clone());
    conn.start();

    Ok(MockSession {
        sender,
        conn,
        conn_type,
    })
}

// ── Test utilities ──────────────────────────────────────────────────────────

/// Poll `predicate` until it holds or `timeout` passes.
pub fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + timeout;
    loop {
        if predicate() {
            return true;
        }
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(10));
    }
}

pub fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}
