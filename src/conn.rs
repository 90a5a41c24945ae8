//! Duplex request/response multiplexer over a [`Channel`].
//!
//! A [`Conn`] owns one send thread and one recv thread.  Outbound frames are
//! queued and written in submission order; inbound frames are either routed
//! to a blocked [`send_recv`](Conn::send_recv) caller (RESPOND frames,
//! matched by exchange id) or dispatched to the registered request handler
//! for their code.
//!
//! ## Wire format
//!
//! Every frame is length-prefixed:
//!
//! ```text
//! [4 bytes: frame length (u32-le)] [4 bytes: code (i32-le)]
//! [4 bytes: exchange id (u32-le)]  [N bytes: payload]
//! ```
//!
//! Exchange id 0 marks fire-and-forget pushes; `send_recv` allocates
//! non-zero ids and parks the caller in one of a fixed number of response
//! partitions until the matching RESPOND frame arrives or incoming
//! communication is stopped.

use {
    crate::{
        channel::Channel,
        error::CommError,
        message::RequestCode,
    },
    crossbeam_channel::{Receiver, RecvTimeoutError, Sender},
    log::warn,
    parking_lot::{Condvar, Mutex},
    std::{
        collections::HashMap,
        io::{self, Read},
        net::{Shutdown, TcpStream},
        sync::{
            atomic::{AtomicBool, AtomicU32, Ordering},
            Arc,
        },
        thread::{self, JoinHandle},
    },
};

/// Upper bound on a single frame; anything larger is a protocol error.
const MAX_FRAME_SIZE: usize = 64 * 1024 * 1024;

/// How often the send thread re-checks the close flag while idle.
const SEND_QUEUE_POLL: std::time::Duration = std::time::Duration::from_millis(100);

/// An inbound request payload together with its exchange id, so handlers
/// that answer can address the response.
#[derive(Debug)]
pub struct SequencedPayload {
    pub eid: u32,
    pub payload: Vec<u8>,
}

/// Callback invoked for an inbound request.
pub type RequestHandler = Box<dyn Fn(SequencedPayload) + Send + Sync + 'static>;

/// Inbound dispatch table, one handler per request code.
pub type RequestHandlers<In> = HashMap<In, RequestHandler>;

/// Callback invoked when a frame write fails.  Setting the flag aborts
/// further sending on this connection.
pub type SendErrorHandler = Box<dyn Fn(CommError, &mut bool) + Send + Sync + 'static>;

/// Callback invoked when the recv thread dies on a socket error.
pub type RecvErrorHandler = Box<dyn Fn(CommError) + Send + Sync + 'static>;

struct Frame {
    code: i32,
    eid: u32,
    payload: Vec<u8>,
}

/// Cloneable handle for queueing outbound frames; inbound request handlers
/// use it to push responses.
pub struct ConnSender<Out: RequestCode> {
    tx: Sender<Frame>,
    respond_code: Out,
}

impl<Out: RequestCode> Clone for ConnSender<Out> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
            respond_code: self.respond_code,
        }
    }
}

impl<Out: RequestCode> ConnSender<Out> {
    /// Queue a fire-and-forget request.
    pub fn push(&self, req: Out, payload: Vec<u8>) -> Result<(), CommError> {
        self.send_frame(req.to_wire(), 0, payload)
    }

    /// Queue a response to the request identified by `eid`.
    pub fn respond(&self, eid: u32, payload: Vec<u8>) -> Result<(), CommError> {
        self.send_frame(self.respond_code.to_wire(), eid, payload)
    }

    fn send_frame(&self, code: i32, eid: u32, payload: Vec<u8>) -> Result<(), CommError> {
        self.tx
            .send(Frame { code, eid, payload })
            .map_err(|_| CommError::Aborted)
    }
}

// ── Response waiters ────────────────────────────────────────────────────────

struct Partition {
    // eid -> None while waiting, Some(payload) once delivered
    slots: Mutex<HashMap<u32, Option<Vec<u8>>>>,
    delivered: Condvar,
}

struct Waiters {
    partitions: Vec<Partition>,
    stopped: AtomicBool,
}

impl Waiters {
    fn new(partition_count: usize) -> Self {
        let partitions = (0..partition_count)
            .map(|_| Partition {
                slots: Mutex::new(HashMap::new()),
                delivered: Condvar::new(),
            })
            .collect();
        Self {
            partitions,
            stopped: AtomicBool::new(false),
        }
    }

    fn partition(&self, eid: u32) -> &Partition {
        &self.partitions[eid as usize % self.partitions.len()]
    }

    fn deliver(&self, eid: u32, payload: Vec<u8>) -> bool {
        let partition = self.partition(eid);
        let mut slots = partition.slots.lock();
        match slots.get_mut(&eid) {
            Some(slot) => {
                *slot = Some(payload);
                partition.delivered.notify_all();
                true
            }
            None => false,
        }
    }

    fn abort_waiters(&self) {
        self.stopped.store(true, Ordering::SeqCst);
        for partition in &self.partitions {
            // Take the lock so a waiter between its check and its wait
            // cannot miss the notification.
            let _slots = partition.slots.lock();
            partition.delivered.notify_all();
        }
    }
}

// ── The connection ──────────────────────────────────────────────────────────

/// A duplex request/response connection over one [`Channel`].
///
/// Created idle; [`start`](Conn::start) spawns the I/O threads.  Dropping
/// the connection stops incoming traffic, drains the outbound queue and
/// joins both threads.
pub struct Conn<Out: RequestCode, In: RequestCode> {
    channel_id: String,
    sender: Option<ConnSender<Out>>,
    channel: Option<Channel>,
    reader: Option<TcpStream>,
    shutdown_stream: TcpStream,
    handlers: Option<RequestHandlers<In>>,
    rx: Option<Receiver<Frame>>,
    send_closed: Arc<AtomicBool>,
    waiters: Arc<Waiters>,
    next_eid: AtomicU32,
    respond_in: In,
    send_error: Option<SendErrorHandler>,
    recv_error: Option<RecvErrorHandler>,
    send_thread: Mutex<Option<JoinHandle<()>>>,
    recv_thread: Mutex<Option<JoinHandle<()>>>,
}

impl<Out: RequestCode, In: RequestCode> Conn<Out, In> {
    /// Build a connection over `channel`.
    ///
    /// `handlers` dispatches inbound requests, `respond_out`/`respond_in`
    /// are the RESPOND codes of the two directions and `partitions` sizes
    /// the response-waiter table.  The error callbacks run on the I/O
    /// threads.
    pub fn new(
        channel: Channel,
        handlers: RequestHandlers<In>,
        respond_out: Out,
        respond_in: In,
        partitions: usize,
        send_error: SendErrorHandler,
        recv_error: RecvErrorHandler,
    ) -> io::Result<Self> {
        let reader = channel.try_clone_stream()?;
        let shutdown_stream = channel.try_clone_stream()?;
        let (tx, rx) = crossbeam_channel::unbounded();

        Ok(Self {
            channel_id: channel.channel_id(),
            sender: Some(ConnSender {
                tx,
                respond_code: respond_out,
            }),
            channel: Some(channel),
            reader: Some(reader),
            shutdown_stream,
            handlers: Some(handlers),
            rx: Some(rx),
            send_closed: Arc::new(AtomicBool::new(false)),
            waiters: Arc::new(Waiters::new(partitions.max(1))),
            next_eid: AtomicU32::new(1),
            respond_in,
            send_error: Some(send_error),
            recv_error: Some(recv_error),
            send_thread: Mutex::new(None),
            recv_thread: Mutex::new(None),
        })
    }

    /// Spawn the send and recv threads.  Calling more than once is a no-op.
    pub fn start(&mut self) {
        let (Some(channel), Some(rx), Some(send_error)) =
            (self.channel.take(), self.rx.take(), self.send_error.take())
        else {
            return;
        };
        let send_closed = Arc::clone(&self.send_closed);
        let send_handle = thread::Builder::new()
            .name("psConnSend".to_string())
            .spawn(move || send_loop(channel, rx, send_closed, send_error))
            .expect("failed to spawn connection send thread");
        *self.send_thread.lock() = Some(send_handle);

        let (Some(reader), Some(handlers), Some(recv_error)) =
            (self.reader.take(), self.handlers.take(), self.recv_error.take())
        else {
            return;
        };
        let waiters = Arc::clone(&self.waiters);
        let respond_in_wire = self.respond_in.to_wire();
        let channel_id = self.channel_id.clone();
        let recv_handle = thread::Builder::new()
            .name("psConnRecv".to_string())
            .spawn(move || recv_loop(reader, waiters, handlers, respond_in_wire, recv_error, channel_id))
            .expect("failed to spawn connection recv thread");
        *self.recv_thread.lock() = Some(recv_handle);
    }

    /// Handle for queueing outbound frames from inbound handlers.
    pub fn sender(&self) -> ConnSender<Out> {
        self.sender
            .as_ref()
            .cloned()
            .expect("sender taken only on drop")
    }

    /// Queue a fire-and-forget request.
    pub fn push(&self, req: Out, payload: Vec<u8>) -> Result<(), CommError> {
        match &self.sender {
            Some(sender) => sender.push(req, payload),
            None => Err(CommError::Aborted),
        }
    }

    /// Send a request and block until the matching response arrives.
    ///
    /// Returns [`CommError::Aborted`] when incoming communication is
    /// stopped while waiting; the caller is then expected to treat the
    /// page server as unreachable.
    pub fn send_recv(&self, req: Out, payload: Vec<u8>) -> Result<Vec<u8>, CommError> {
        if self.waiters.stopped.load(Ordering::SeqCst) {
            return Err(CommError::Aborted);
        }
        let sender = match &self.sender {
            Some(sender) => sender,
            None => return Err(CommError::Aborted),
        };

        let eid = self.alloc_eid();
        let partition = self.waiters.partition(eid);
        partition.slots.lock().insert(eid, None);

        if let Err(err) = sender.send_frame(req.to_wire(), eid, payload) {
            partition.slots.lock().remove(&eid);
            return Err(err);
        }

        let mut slots = partition.slots.lock();
        loop {
            match slots.get_mut(&eid) {
                Some(slot) => {
                    if let Some(payload) = slot.take() {
                        slots.remove(&eid);
                        return Ok(payload);
                    }
                }
                None => return Err(CommError::Aborted),
            }
            if self.waiters.stopped.load(Ordering::SeqCst) {
                slots.remove(&eid);
                return Err(CommError::Aborted);
            }
            partition.delivered.wait(&mut slots);
        }
    }

    /// Stop the recv thread and wake every blocked `send_recv` caller.
    ///
    /// Outbound traffic is unaffected; a final message can still be pushed
    /// after this returns.
    pub fn stop_incoming_communication_thread(&self) {
        self.waiters.abort_waiters();
        let _ = self.shutdown_stream.shutdown(Shutdown::Read);
        let handle = self.recv_thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
    }

    /// Identifier of the underlying channel.
    pub fn channel_id(&self) -> &str {
        &self.channel_id
    }

    fn alloc_eid(&self) -> u32 {
        loop {
            let eid = self.next_eid.fetch_add(1, Ordering::Relaxed);
            if eid != 0 {
                return eid;
            }
        }
    }
}

impl<Out: RequestCode, In: RequestCode> Drop for Conn<Out, In> {
    fn drop(&mut self) {
        self.stop_incoming_communication_thread();
        // Closing our queue handle lets the send thread drain what is
        // already queued and exit; the flag covers stray sender clones.
        self.sender = None;
        self.send_closed.store(true, Ordering::SeqCst);
        let handle = self.send_thread.lock().take();
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        let _ = self.shutdown_stream.shutdown(Shutdown::Both);
    }
}

// ── I/O threads ─────────────────────────────────────────────────────────────

fn send_loop(
    mut channel: Channel,
    rx: Receiver<Frame>,
    closed: Arc<AtomicBool>,
    send_error: SendErrorHandler,
) {
    loop {
        let frame = match rx.recv_timeout(SEND_QUEUE_POLL) {
            Ok(frame) => frame,
            Err(RecvTimeoutError::Timeout) => {
                if closed.load(Ordering::SeqCst) {
                    while let Ok(frame) = rx.try_recv() {
                        let _ = write_frame(&mut channel, &frame);
                    }
                    break;
                }
                continue;
            }
            Err(RecvTimeoutError::Disconnected) => break,
        };

        if let Err(err) = write_frame(&mut channel, &frame) {
            if closed.load(Ordering::SeqCst) {
                break;
            }
            let mut abort = false;
            send_error(classify_write_error(&err), &mut abort);
            if abort {
                break;
            }
        }
    }
}

fn recv_loop<In: RequestCode>(
    mut reader: TcpStream,
    waiters: Arc<Waiters>,
    handlers: RequestHandlers<In>,
    respond_in_wire: i32,
    recv_error: RecvErrorHandler,
    channel_id: String,
) {
    loop {
        if waiters.stopped.load(Ordering::SeqCst) {
            break;
        }
        let frame = match read_frame(&mut reader, &waiters.stopped) {
            Ok(Some(frame)) => frame,
            Ok(None) => continue,
            Err(err) => {
                if !waiters.stopped.load(Ordering::SeqCst) {
                    recv_error(classify_read_error(&err));
                }
                break;
            }
        };

        if frame.code == respond_in_wire {
            if !waiters.deliver(frame.eid, frame.payload) {
                warn!(
                    "unsolicited response (eid {}) on channel {channel_id}",
                    frame.eid
                );
            }
        } else if let Some(req) = In::from_wire(frame.code) {
            match handlers.get(&req) {
                Some(handler) => handler(SequencedPayload {
                    eid: frame.eid,
                    payload: frame.payload,
                }),
                None => warn!("no handler registered for {req:?} on channel {channel_id}"),
            }
        } else {
            warn!(
                "unknown request code {} on channel {channel_id}",
                frame.code
            );
        }
    }
    // Whatever killed the loop, nobody may stay parked.
    waiters.abort_waiters();
}

fn write_frame(channel: &mut Channel, frame: &Frame) -> io::Result<()> {
    let body_len = 8usize + frame.payload.len();
    let mut buf = Vec::with_capacity(4 + body_len);
    buf.extend_from_slice(&(body_len as u32).to_le_bytes());
    buf.extend_from_slice(&frame.code.to_le_bytes());
    buf.extend_from_slice(&frame.eid.to_le_bytes());
    buf.extend_from_slice(&frame.payload);
    channel.send_bytes(&buf)
}

/// Read one frame.  `Ok(None)` means the poll timed out with no data.
fn read_frame(reader: &mut TcpStream, stopped: &AtomicBool) -> io::Result<Option<Frame>> {
    let mut header = [0u8; 4];
    if !read_full(reader, &mut header, stopped)? {
        return Ok(None);
    }
    let body_len = u32::from_le_bytes(header) as usize;
    if !(8..=MAX_FRAME_SIZE).contains(&body_len) {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("bad frame length {body_len}"),
        ));
    }

    let mut body = vec![0u8; body_len];
    if !read_full(reader, &mut body, stopped)? {
        // A header without a body within the poll window is a dead peer.
        return Err(io::Error::from(io::ErrorKind::UnexpectedEof));
    }

    let code = i32::from_le_bytes(body[0..4].try_into().expect("sized slice"));
    let eid = u32::from_le_bytes(body[4..8].try_into().expect("sized slice"));
    body.drain(0..8);
    Ok(Some(Frame {
        code,
        eid,
        payload: body,
    }))
}

/// Fill `buf`, polling through read timeouts.  Returns `Ok(false)` only if
/// the first poll window passed without a single byte.
fn read_full(reader: &mut TcpStream, buf: &mut [u8], stopped: &AtomicBool) -> io::Result<bool> {
    let mut filled = 0usize;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => return Err(io::Error::from(io::ErrorKind::UnexpectedEof)),
            Ok(n) => filled += n,
            Err(err) if is_poll_timeout(&err) => {
                if filled == 0 {
                    return Ok(false);
                }
                if stopped.load(Ordering::SeqCst) {
                    return Err(io::Error::from(io::ErrorKind::ConnectionAborted));
                }
            }
            Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
            Err(err) => return Err(err),
        }
    }
    Ok(true)
}

fn is_poll_timeout(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut
    )
}

fn classify_write_error(err: &io::Error) -> CommError {
    match err.kind() {
        io::ErrorKind::BrokenPipe
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted
        | io::ErrorKind::NotConnected
        | io::ErrorKind::UnexpectedEof => CommError::ConnectionClosed,
        _ => CommError::WriteFailed,
    }
}

fn classify_read_error(err: &io::Error) -> CommError {
    match err.kind() {
        io::ErrorKind::UnexpectedEof
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionAborted => CommError::ConnectionClosed,
        _ => CommError::ReadFailed,
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::message::{PageToTranRequest, TranToPageRequest},
        std::{
            net::TcpListener,
            sync::{mpsc, OnceLock},
            time::Duration,
        },
    };

    const POLL: Duration = Duration::from_millis(200);

    type TsConn = Conn<TranToPageRequest, PageToTranRequest>;
    type PsConn = Conn<PageToTranRequest, TranToPageRequest>;

    fn noop_send_error() -> SendErrorHandler {
        Box::new(|_, abort| *abort = true)
    }

    fn noop_recv_error() -> RecvErrorHandler {
        Box::new(|_| {})
    }

    /// Connect two channels over loopback and wrap them in mirrored conns.
    fn conn_pair(
        ts_handlers: RequestHandlers<PageToTranRequest>,
        ps_handlers: RequestHandlers<TranToPageRequest>,
    ) -> (TsConn, PsConn) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let ts_channel = Channel::from_stream(client, POLL).unwrap();
        let ps_channel = Channel::from_stream(server, POLL).unwrap();

        let mut ts_conn = Conn::new(
            ts_channel,
            ts_handlers,
            TranToPageRequest::Respond,
            PageToTranRequest::Respond,
            4,
            noop_send_error(),
            noop_recv_error(),
        )
        .unwrap();
        let mut ps_conn = Conn::new(
            ps_channel,
            ps_handlers,
            PageToTranRequest::Respond,
            TranToPageRequest::Respond,
            4,
            noop_send_error(),
            noop_recv_error(),
        )
        .unwrap();
        ts_conn.start();
        ps_conn.start();
        (ts_conn, ps_conn)
    }

    #[test]
    fn test_push_dispatches_to_handler() {
        let (payload_tx, payload_rx) = mpsc::channel::<Vec<u8>>();
        let mut ps_handlers: RequestHandlers<TranToPageRequest> = HashMap::new();
        ps_handlers.insert(
            TranToPageRequest::SendLogPriorList,
            Box::new(move |sp| {
                payload_tx.send(sp.payload).unwrap();
            }),
        );

        let (ts_conn, _ps_conn) = conn_pair(HashMap::new(), ps_handlers);
        ts_conn
            .push(TranToPageRequest::SendLogPriorList, b"records".to_vec())
            .unwrap();

        let received = payload_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(received, b"records");
    }

    #[test]
    fn test_send_recv_roundtrip() {
        // The page-server side echoes boot-info requests back under the
        // request's eid, proving the correlation works.
        let sender_cell: Arc<OnceLock<ConnSender<PageToTranRequest>>> = Arc::new(OnceLock::new());
        let mut ps_handlers: RequestHandlers<TranToPageRequest> = HashMap::new();
        {
            let sender_cell = Arc::clone(&sender_cell);
            ps_handlers.insert(
                TranToPageRequest::GetBootInfo,
                Box::new(move |sp| {
                    if let Some(sender) = sender_cell.get() {
                        sender.respond(sp.eid, sp.payload).unwrap();
                    }
                }),
            );
        }

        let (ts_conn, ps_conn) = conn_pair(HashMap::new(), ps_handlers);
        let _ = sender_cell.set(ps_conn.sender());

        let out = ts_conn
            .send_recv(TranToPageRequest::GetBootInfo, b"ping".to_vec())
            .unwrap();
        assert_eq!(out, b"ping");

        let out = ts_conn
            .send_recv(TranToPageRequest::GetBootInfo, b"pong".to_vec())
            .unwrap();
        assert_eq!(out, b"pong");
    }

    #[test]
    fn test_stop_incoming_unblocks_waiters() {
        // No responder on the other side, so send_recv parks forever until
        // incoming communication is stopped.
        let (ts_conn, _ps_conn) = conn_pair(HashMap::new(), HashMap::new());
        let ts_conn = Arc::new(ts_conn);

        let waiter = {
            let ts_conn = Arc::clone(&ts_conn);
            thread::spawn(move || ts_conn.send_recv(TranToPageRequest::GetBootInfo, Vec::new()))
        };

        thread::sleep(Duration::from_millis(100));
        ts_conn.stop_incoming_communication_thread();

        let result = waiter.join().unwrap();
        assert_eq!(result, Err(CommError::Aborted));
    }

    #[test]
    fn test_send_recv_after_stop_fails_fast() {
        let (ts_conn, _ps_conn) = conn_pair(HashMap::new(), HashMap::new());
        ts_conn.stop_incoming_communication_thread();
        assert_eq!(
            ts_conn.send_recv(TranToPageRequest::GetBootInfo, Vec::new()),
            Err(CommError::Aborted)
        );
    }

    #[test]
    fn test_peer_drop_triggers_recv_error() {
        let (error_tx, error_rx) = mpsc::channel::<CommError>();
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        let (server, _) = listener.accept().unwrap();

        let mut ts_conn: TsConn = Conn::new(
            Channel::from_stream(client, POLL).unwrap(),
            HashMap::new(),
            TranToPageRequest::Respond,
            PageToTranRequest::Respond,
            4,
            noop_send_error(),
            Box::new(move |err| {
                let _ = error_tx.send(err);
            }),
        )
        .unwrap();
        ts_conn.start();

        drop(server);
        let err = error_rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_eq!(err, CommError::ConnectionClosed);
    }
}
