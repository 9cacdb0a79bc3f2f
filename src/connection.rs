//! Per-connection state machine
//!
//! Every accepted socket becomes a [`Connection`]: a long-lived record that
//! interleaves request parsing, response-header staging and body transfer.
//! Progress happens only while a worker executes [`step`]; between steps
//! the record is parked in the reactor's poll, armed for exactly the
//! readiness it needs next.
//!
//! Exclusivity protocol: the reactor flips `state` to `Processing` before
//! enqueueing and skips records already in flight, so at most one worker
//! ever advances a given record. A step never touches the poll itself: it
//! leaves the record's state describing what it needs next and pushes the
//! token onto the completion channel, and the reactor re-arms on its own
//! thread once the worker is fully out of the record. Re-arming after the
//! step is what makes skipped mid-step readiness safe: the reregister
//! re-delivers any readiness that still holds.

use std::fs::File;
use std::io::{self, ErrorKind, Read, Write};
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use crossbeam_channel::Sender;
use log::{debug, error, warn};
use mio::net::TcpStream;
use mio::{Interest, Registry, Token, Waker};

use crate::config::ServerConfig;
use crate::http::request::{self, ParseStatus, Request};
use crate::http::{response, Status};
use crate::router::{self, Route};
use crate::sessions::SessionTable;
use crate::store::Store;
use crate::{api, auth, static_files, streaming};

/// Size of the header buffer. Requests whose head does not fit are refused.
pub const BUFFER_SIZE: usize = 4096;

/// Byte budget one step may push before cooperatively yielding, so a
/// single large transfer cannot pin a worker while other clients wait.
pub const MAX_TURN_BYTES: u64 = 8 * 1024 * 1024;

/// Shared handle to a connection record.
pub type Conn = Arc<Mutex<Connection>>;

/// Services a state-machine step needs. Built once at startup and shared
/// by every worker; nothing in here is global.
#[derive(Debug)]
pub struct StepContext {
    /// Tokens of records whose step finished, drained by the reactor.
    pub completed: Sender<Token>,
    /// Wakes the reactor after a token is pushed onto `completed`.
    pub waker: Arc<Waker>,
    /// Session table consulted for protected resources.
    pub sessions: SessionTable,
    /// Relational store behind the auth and history endpoints.
    pub store: Store,
    /// Server configuration.
    pub config: ServerConfig,
}

#[cfg(test)]
impl StepContext {
    /// A context wired to throwaway services, for unit tests.
    pub(crate) fn stub() -> Self {
        let poll = mio::Poll::new().unwrap();
        let waker = Arc::new(Waker::new(poll.registry(), Token(usize::MAX - 1)).unwrap());
        let (completed, rx) = crossbeam_channel::unbounded();
        // The poll and drain side stay alive for the context's lifetime.
        std::mem::forget((poll, rx));
        Self {
            completed,
            waker,
            sessions: SessionTable::new(),
            store: Store::open_in_memory().unwrap(),
            config: ServerConfig::default(),
        }
    }
}

/// Lifecycle phase of a connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum State {
    /// Waiting for (more of) a request head.
    Receiving,
    /// Dispatched: a worker owns the record until its step completes.
    Processing(Resume),
    /// Flushing the staged response header.
    SendingHeader,
    /// Transferring the response body.
    SendingBody,
    /// Terminal; the record is awaiting removal.
    Closed,
}

impl State {
    /// The poll interest a parked record in this state needs.
    pub fn interest(self) -> Option<Interest> {
        match self {
            State::Receiving => Some(Interest::READABLE),
            State::SendingHeader | State::SendingBody => Some(Interest::WRITABLE),
            State::Processing(_) | State::Closed => None,
        }
    }
}

/// Which phase a dispatched step resumes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resume {
    /// Read and, when complete, parse and route the request.
    Request,
    /// Continue flushing the response header.
    Header,
    /// Continue transferring the response body.
    Body,
}

/// Source of the bytes for the response body.
///
/// Bodies never pass through the header buffer: files move by `sendfile`,
/// JSON replies are heap-owned and freed when the transfer completes.
#[derive(Debug)]
pub enum Body {
    /// No body (between responses).
    None,
    /// File streamed with zero-copy transfer.
    File(File),
    /// Heap-owned reply bytes with a send cursor.
    Bytes {
        /// The reply body.
        data: Vec<u8>,
        /// Bytes already written to the socket.
        sent: usize,
    },
}

/// Reasons a step could not complete normally.
#[derive(Debug)]
pub enum StepError {
    /// Refuse the request with a status; the connection closes.
    Http(Status),
    /// The peer vanished mid-exchange. Normal during media seeking;
    /// destroyed silently.
    PeerGone,
    /// An unexpected I/O failure; answered with a best-effort 500.
    Io(io::Error),
}

impl From<io::Error> for StepError {
    fn from(value: io::Error) -> Self {
        StepError::Io(value)
    }
}

/// Per-client state: the socket, the reusable header buffer and the
/// transfer cursors.
#[derive(Debug)]
pub struct Connection {
    stream: TcpStream,
    token: Token,
    peer: SocketAddr,
    /// Wall time of the last forward progress; read by the idle sweep.
    pub last_active: Instant,
    /// Current lifecycle phase. The reactor writes it only at dispatch;
    /// the owning worker writes it as the step progresses.
    pub state: State,
    // One reusable buffer for request heads and response headers. Holds
    // either inbound or staged outbound bytes, never both.
    buf: [u8; BUFFER_SIZE],
    buf_len: usize,
    buf_sent: usize,
    request: Option<Request>,
    body: Body,
    file_offset: u64,
    bytes_remaining: u64,
    // Once a body byte is on the wire no error header may follow it.
    body_started: bool,
}

impl Connection {
    /// Creates a record for a freshly accepted stream.
    pub fn new(stream: TcpStream, token: Token, peer: SocketAddr) -> Self {
        Self {
            stream,
            token,
            peer,
            last_active: Instant::now(),
            state: State::Receiving,
            buf: [0; BUFFER_SIZE],
            buf_len: 0,
            buf_sent: 0,
            request: None,
            body: Body::None,
            file_offset: 0,
            bytes_remaining: 0,
            body_started: false,
        }
    }

    /// The record's poll token.
    pub fn token(&self) -> Token {
        self.token
    }

    /// Peer address, for diagnostics.
    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    /// Registers the record with the reactor's poll for its first read.
    pub fn register(&mut self, registry: &Registry) -> io::Result<()> {
        registry.register(&mut self.stream, self.token, Interest::READABLE)
    }

    /// Re-arms the poll for the readiness the record's state calls for.
    /// Reactor-side only, strictly after the owning step completed.
    pub(crate) fn rearm(&mut self, registry: &Registry, interest: Interest) -> io::Result<()> {
        registry.reregister(&mut self.stream, self.token, interest)
    }

    /// Removes the record's interest from the poll, just before removal.
    pub(crate) fn deregister(&mut self, registry: &Registry) -> io::Result<()> {
        registry.deregister(&mut self.stream)
    }

    /// The resume point for the record's current phase, or `None` when it
    /// must not be dispatched (already in flight, or closed).
    pub fn dispatch_resume(&self) -> Option<Resume> {
        match self.state {
            State::Receiving => Some(Resume::Request),
            State::SendingHeader => Some(Resume::Header),
            State::SendingBody => Some(Resume::Body),
            State::Processing(_) | State::Closed => None,
        }
    }

    /// Best-effort error response: one non-blocking write, no waiting.
    /// Refused outright once body bytes are on the wire, because a 5xx
    /// header spliced into a 2xx body would corrupt the stream.
    pub(crate) fn send_error(&mut self, status: Status) {
        if self.body_started {
            return;
        }
        let mut header = [0u8; 256];
        if let Ok(len) = response::error_header(&mut header, status) {
            let _ = self.stream.write(&header[..len]);
        }
    }

    /// Marks the record terminal and releases its body source. The reactor
    /// deregisters and drops the record when the completion notification
    /// reaches it; the drop closes the socket and any open file exactly
    /// once. Idempotent.
    pub(crate) fn destroy(&mut self) {
        self.state = State::Closed;
        self.body = Body::None;
    }

    // ---- receive path ----------------------------------------------------

    fn on_request(&mut self, ctx: &StepContext) -> Result<(), StepError> {
        self.state = State::Receiving;

        match self.stream.read(&mut self.buf[self.buf_len..]) {
            // Orderly close from the peer.
            Ok(0) => Err(StepError::PeerGone),
            Ok(n) => {
                self.buf_len += n;
                self.last_active = Instant::now();
                match request::parse(&self.buf[..self.buf_len]) {
                    Ok(ParseStatus::Complete(req)) => {
                        self.request = Some(req);
                        self.dispatch(ctx)
                    }
                    Ok(ParseStatus::Partial) => {
                        if self.buf_len == BUFFER_SIZE {
                            // The head cannot fit; it never will.
                            return Err(StepError::Http(Status::BadRequest));
                        }
                        Ok(())
                    }
                    Err(e) => {
                        debug!("{}: bad request: {e}", self.peer);
                        Err(StepError::Http(Status::BadRequest))
                    }
                }
            }
            Err(e) if e.kind() == ErrorKind::WouldBlock => Ok(()),
            Err(e) if e.kind() == ErrorKind::Interrupted => Ok(()),
            Err(e) if is_peer_gone(&e) => Err(StepError::PeerGone),
            Err(e) => Err(StepError::Io(e)),
        }
    }

    fn dispatch(&mut self, ctx: &StepContext) -> Result<(), StepError> {
        let req = self
            .request
            .take()
            .ok_or_else(|| StepError::Io(io::Error::other("dispatch without a parsed request")))?;
        debug!("{} {} from {}", req.method, req.target, self.peer);

        let user = req
            .session_id
            .as_deref()
            .and_then(|id| ctx.sessions.lookup(id));

        match router::route(req.method, &req.target) {
            Route::Forbidden => Err(StepError::Http(Status::Forbidden)),
            Route::NotFound => Err(StepError::Http(Status::NotFound)),
            Route::MethodNotAllowed => Err(StepError::Http(Status::MethodNotAllowed)),
            Route::Login => auth::login(self, &req, ctx),
            Route::Logout => auth::logout(self, &req, ctx),
            Route::Register => auth::register(self, &req, ctx),
            Route::History => api::update_history(self, &req, user, ctx),
            Route::VideoList => api::video_list(self, user, ctx),
            Route::Stream(path) => {
                if user.is_none() {
                    return Err(StepError::Http(Status::Unauthorized));
                }
                streaming::start(self, &req, &path, ctx)
            }
            Route::Static(path) => static_files::start(self, &path, ctx),
        }
    }

    /// The request body as text, for form decoding.
    pub(crate) fn form_body(&self, req: &Request) -> &str {
        std::str::from_utf8(&self.buf[req.body.clone()]).unwrap_or("")
    }

    // ---- send path -------------------------------------------------------

    /// Stages a response: renders the header into the buffer, installs the
    /// body source and cursors, then immediately attempts the transfer
    /// within the current step.
    pub(crate) fn stage_response<H>(
        &mut self,
        header: H,
        body: Body,
        length: u64,
        offset: u64,
        ctx: &StepContext,
    ) -> Result<(), StepError>
    where
        H: FnOnce(&mut [u8]) -> io::Result<usize>,
    {
        let len = header(&mut self.buf)?;
        self.buf_len = len;
        self.buf_sent = 0;
        self.body = body;
        self.bytes_remaining = length;
        self.file_offset = offset;
        self.body_started = false;
        self.state = State::SendingHeader;

        self.on_header(ctx)
    }

    /// Stages a JSON reply.
    pub(crate) fn stage_json(
        &mut self,
        status: Status,
        body: &str,
        set_cookie: Option<&str>,
        ctx: &StepContext,
    ) -> Result<(), StepError> {
        let data = body.as_bytes().to_vec();
        let length = data.len();
        self.stage_response(
            |buf| response::json_header(buf, status, length, set_cookie),
            Body::Bytes { data, sent: 0 },
            length as u64,
            0,
            ctx,
        )
    }

    fn on_header(&mut self, ctx: &StepContext) -> Result<(), StepError> {
        while self.buf_sent < self.buf_len {
            match self.stream.write(&self.buf[self.buf_sent..self.buf_len]) {
                Ok(0) => return Err(StepError::PeerGone),
                Ok(n) => {
                    self.buf_sent += n;
                    self.last_active = Instant::now();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    // Partial header: the staged bytes stay untouched until
                    // buf_sent catches up with buf_len.
                    self.state = State::SendingHeader;
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_peer_gone(&e) => return Err(StepError::PeerGone),
                Err(e) => return Err(StepError::Io(e)),
            }
        }

        self.state = State::SendingBody;
        self.on_body(ctx)
    }

    fn on_body(&mut self, ctx: &StepContext) -> Result<(), StepError> {
        let mut sent_this_turn: u64 = 0;

        while self.bytes_remaining > 0 {
            if sent_this_turn >= MAX_TURN_BYTES {
                // Fairness cap reached: yield the worker even though the
                // socket may still be writable.
                self.state = State::SendingBody;
                return Ok(());
            }
            let budget = (MAX_TURN_BYTES - sent_this_turn).min(self.bytes_remaining);

            let sent = match &mut self.body {
                Body::File(file) => {
                    streaming::send_file_chunk(&self.stream, file, &mut self.file_offset, budget)
                }
                Body::Bytes { data, sent } => {
                    let end = (*sent as u64 + budget).min(data.len() as u64) as usize;
                    match self.stream.write(&data[*sent..end]) {
                        Ok(n) => {
                            *sent += n;
                            Ok(n as u64)
                        }
                        Err(e) => Err(e),
                    }
                }
                Body::None => {
                    warn!("{}: body bytes owed with no body source", self.peer);
                    return Err(StepError::Http(Status::InternalServerError));
                }
            };

            match sent {
                // The source ran dry while bytes were still owed.
                Ok(0) => return Err(StepError::Http(Status::InternalServerError)),
                Ok(n) => {
                    self.bytes_remaining -= n;
                    sent_this_turn += n;
                    self.body_started = true;
                    self.last_active = Instant::now();
                }
                Err(e) if e.kind() == ErrorKind::WouldBlock => {
                    self.state = State::SendingBody;
                    return Ok(());
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) if is_peer_gone(&e) => return Err(StepError::PeerGone),
                Err(e) => return Err(StepError::Io(e)),
            }
        }

        self.finish_response();
        Ok(())
    }

    // Response complete: release the body source (closing any file), reset
    // the buffer cursors and go back to waiting for the next request.
    fn finish_response(&mut self) {
        self.body = Body::None;
        self.buf_len = 0;
        self.buf_sent = 0;
        self.file_offset = 0;
        self.bytes_remaining = 0;
        self.body_started = false;
        self.state = State::Receiving;
    }

    fn advance(&mut self, resume: Resume, ctx: &StepContext) -> Result<(), StepError> {
        match resume {
            Resume::Request => self.on_request(ctx),
            Resume::Header => self.on_header(ctx),
            Resume::Body => self.on_body(ctx),
        }
    }

    fn fail(&mut self, err: StepError) {
        match err {
            StepError::Http(status) => {
                debug!("{}: {} {}", self.peer, status, status.reason());
                self.send_error(status);
            }
            StepError::PeerGone => {
                debug!("{}: peer went away", self.peer);
            }
            StepError::Io(e) => {
                error!("{}: i/o failure: {e}", self.peer);
                self.send_error(Status::InternalServerError);
            }
        }
        self.destroy();
    }
}

/// Advances `conn`'s state machine by one step, then notifies the reactor
/// exactly once. The single entry point executed by workers.
pub fn step(conn: &Conn, ctx: &StepContext) {
    let token = {
        let mut record = conn.lock().unwrap_or_else(|p| p.into_inner());

        let resume = match record.state {
            State::Processing(resume) => resume,
            // Defensive: the reactor only enqueues after flipping the state.
            _ => return,
        };

        if let Err(err) = record.advance(resume, ctx) {
            record.fail(err);
        }
        record.token()
    };

    // Strictly after the lock is released, so the reactor's completion
    // handler can always take the record when it services this message.
    notify_completion(token, ctx);
}

/// Tells the reactor a record's step is over and the record needs
/// attention: a re-arm, or removal if it is closed.
pub(crate) fn notify_completion(token: Token, ctx: &StepContext) {
    if ctx.completed.send(token).is_ok() {
        let _ = ctx.waker.wake();
    }
}

fn is_peer_gone(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        ErrorKind::BrokenPipe | ErrorKind::ConnectionReset | ErrorKind::ConnectionAborted
    )
}

#[cfg(test)]
mod test {
    use std::io::Read;
    use std::io::Write;
    use std::net::{TcpListener, TcpStream};
    use std::sync::{Arc, Mutex};
    use std::thread;
    use std::time::Duration;

    use mio::Token;

    use super::{step, Conn, Connection, Resume, State, StepContext};

    fn socket_pair() -> (mio::net::TcpStream, TcpStream) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let client = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let (server, _) = listener.accept().unwrap();
        server.set_nonblocking(true).unwrap();
        (mio::net::TcpStream::from_std(server), client)
    }

    fn record(stream: mio::net::TcpStream) -> Conn {
        let peer = "127.0.0.1:1".parse().unwrap();
        Arc::new(Mutex::new(Connection::new(stream, Token(3), peer)))
    }

    // Lets loopback bytes land in the server-side socket buffer.
    fn settle() {
        thread::sleep(Duration::from_millis(50));
    }

    fn run_step(conn: &Conn, ctx: &StepContext) {
        conn.lock().unwrap().state = State::Processing(Resume::Request);
        step(conn, ctx);
    }

    // Reads one full response: head, then as many body bytes as its
    // Content-Length promises.
    fn read_reply(client: &mut TcpStream) -> String {
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let mut buf = Vec::new();
        let mut chunk = [0u8; 1024];

        loop {
            match client.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    buf.extend_from_slice(&chunk[..n]);
                    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
                        let head = String::from_utf8_lossy(&buf[..pos]).to_ascii_lowercase();
                        let need: usize = head
                            .lines()
                            .find_map(|l| l.strip_prefix("content-length:"))
                            .map(|v| v.trim().parse().unwrap())
                            .unwrap_or(0);
                        if buf.len() >= pos + 4 + need {
                            break;
                        }
                    }
                }
            }
        }

        String::from_utf8_lossy(&buf).into_owned()
    }

    #[test]
    fn partial_heads_leave_the_record_receiving() {
        let ctx = StepContext::stub();
        let (server, mut client) = socket_pair();
        let conn = record(server);

        client.write_all(b"GET / HTTP/1.1\r\nHost:").unwrap();
        settle();
        run_step(&conn, &ctx);

        assert_eq!(State::Receiving, conn.lock().unwrap().state);
    }

    #[test]
    fn orderly_peer_close_marks_the_record_closed() {
        let ctx = StepContext::stub();
        let (server, client) = socket_pair();
        let conn = record(server);

        drop(client);
        settle();
        run_step(&conn, &ctx);

        assert_eq!(State::Closed, conn.lock().unwrap().state);
    }

    #[test]
    fn traversal_target_is_refused_and_closed() {
        let ctx = StepContext::stub();
        let (server, mut client) = socket_pair();
        let conn = record(server);

        client
            .write_all(b"GET /../etc/passwd HTTP/1.1\r\nHost: t\r\n\r\n")
            .unwrap();
        settle();
        run_step(&conn, &ctx);

        assert_eq!(State::Closed, conn.lock().unwrap().state);
        let reply = read_reply(&mut client);
        assert!(reply.starts_with("HTTP/1.1 403 Forbidden\r\n"), "{reply}");
        assert!(reply.contains("Connection: close\r\n"));
    }

    #[test]
    fn login_round_trip_completes_within_one_step() {
        let ctx = StepContext::stub();
        let (server, mut client) = socket_pair();
        let conn = record(server);

        let body = "username=user1&password=1234";
        let raw = format!(
            "POST /login HTTP/1.1\r\nHost: t\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        client.write_all(raw.as_bytes()).unwrap();
        settle();
        run_step(&conn, &ctx);

        // The small reply fits the socket buffer, so the step runs all the
        // way back to keep-alive.
        assert_eq!(State::Receiving, conn.lock().unwrap().state);
        assert_eq!(1, ctx.sessions.len());

        let reply = read_reply(&mut client);
        assert!(reply.starts_with("HTTP/1.1 200 OK\r\n"), "{reply}");
        assert!(reply.contains("Set-Cookie: session_id="));
        assert!(reply.ends_with(r#"{"success": true}"#));
    }

    #[test]
    fn bad_credentials_do_not_create_a_session() {
        let ctx = StepContext::stub();
        let (server, mut client) = socket_pair();
        let conn = record(server);

        let body = "username=user1&password=wrong";
        let raw = format!(
            "POST /login HTTP/1.1\r\nHost: t\r\nContent-Length: {}\r\n\r\n{body}",
            body.len()
        );
        client.write_all(raw.as_bytes()).unwrap();
        settle();
        run_step(&conn, &ctx);

        assert_eq!(0, ctx.sessions.len());
        let reply = read_reply(&mut client);
        assert!(reply.starts_with("HTTP/1.1 401 Unauthorized\r\n"), "{reply}");
    }

    #[test]
    fn oversized_heads_are_rejected_once_the_buffer_fills() {
        let ctx = StepContext::stub();
        let (server, mut client) = socket_pair();
        let conn = record(server);

        // A head that can never fit: no terminator within BUFFER_SIZE.
        let huge = format!("GET / HTTP/1.1\r\nX-Filler: {}\r\n", "a".repeat(8192));
        client.write_all(huge.as_bytes()).unwrap();
        settle();

        // Reads are one per step; drive until the buffer fills.
        for _ in 0..8 {
            if conn.lock().unwrap().state == State::Closed {
                break;
            }
            run_step(&conn, &ctx);
        }

        assert_eq!(State::Closed, conn.lock().unwrap().state);
        let reply = read_reply(&mut client);
        assert!(reply.starts_with("HTTP/1.1 400 Bad Request\r\n"), "{reply}");
    }
}
