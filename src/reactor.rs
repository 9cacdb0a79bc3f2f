//! The reactor: acceptor, readiness dispatcher and re-armer
//!
//! One thread owns the poll. It accepts connections, watches their
//! readiness, and hands ready records to the worker pool through the
//! bounded queue, never touching client sockets itself beyond the
//! best-effort refusal path. Workers signal step completion over a
//! channel and the waker; the reactor then re-arms (or removes) the
//! record, so poll interest is only ever modified on this thread and
//! strictly after the owning step has finished. It blocks only in
//! `poll`, with a short tick so the shutdown flag and the idle sweep
//! get serviced.

use std::io::{self, ErrorKind};
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, TryLockError};
use std::time::{Duration, Instant};

use crossbeam_channel::Receiver;
use log::{debug, error, info, warn};
use mio::net::TcpListener;
use mio::{Events, Interest, Poll, Token, Waker};
use slab::Slab;
use socket2::{Domain, Protocol, Socket, Type};

use crate::config::ServerConfig;
use crate::connection::{Conn, Connection, State};
use crate::http::Status;
use crate::queue::{EnqueueError, TaskQueue};

const LISTEN_TOKEN: Token = Token(usize::MAX);
const WAKE_TOKEN: Token = Token(usize::MAX - 1);

// Upper bound on how stale the shutdown flag or the idle sweep can get.
const TICK: Duration = Duration::from_secs(1);

/// The event loop at the center of the server.
#[derive(Debug)]
pub struct Reactor {
    poll: Poll,
    listener: TcpListener,
    local_addr: SocketAddr,
    connections: Slab<Conn>,
    queue: Arc<TaskQueue<Conn>>,
    completed: Receiver<Token>,
    waker: Arc<Waker>,
    timeout: Duration,
}

impl Reactor {
    /// Binds the listener described by `config` and prepares the poll.
    ///
    /// The listener socket gets address reuse, non-blocking mode and a
    /// backlog of `max_clients`; every candidate address for the host is
    /// tried in order, as resolvers hand them out.
    pub fn new(
        config: &ServerConfig,
        queue: Arc<TaskQueue<Conn>>,
        completed: Receiver<Token>,
    ) -> io::Result<Self> {
        let mut listener = bind_listener(&config.host, config.port, config.max_clients)?;
        let local_addr = listener.local_addr()?;

        let poll = Poll::new()?;
        poll.registry()
            .register(&mut listener, LISTEN_TOKEN, Interest::READABLE)?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKE_TOKEN)?);

        info!("listening on {local_addr}");

        Ok(Self {
            poll,
            listener,
            local_addr,
            connections: Slab::new(),
            queue,
            completed,
            waker,
            timeout: Duration::from_secs(config.timeout_sec),
        })
    }

    /// The waker workers ring after pushing onto the completion channel.
    pub fn waker(&self) -> Arc<Waker> {
        Arc::clone(&self.waker)
    }

    /// Address the listener actually bound (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Runs the event loop until `shutdown` flips.
    ///
    /// Per round: accept every pending connection, dispatch every ready
    /// record to the pool, service completed steps, and on each tick
    /// destroy records idle past the configured timeout.
    pub fn run(&mut self, shutdown: &AtomicBool) -> io::Result<()> {
        let mut events = Events::with_capacity(1024);
        let mut last_sweep = Instant::now();

        while !shutdown.load(Ordering::Acquire) {
            if let Err(e) = self.poll.poll(&mut events, Some(TICK)) {
                // A signal landing mid-poll is the expected shutdown path.
                if e.kind() == ErrorKind::Interrupted {
                    continue;
                }
                return Err(e);
            }

            for event in events.iter() {
                match event.token() {
                    LISTEN_TOKEN => self.accept(),
                    WAKE_TOKEN => self.service_completions(),
                    token => self.dispatch(token),
                }
            }

            if last_sweep.elapsed() >= TICK {
                self.sweep();
                last_sweep = Instant::now();
            }
        }

        info!("reactor stopping");
        Ok(())
    }

    // Accept until the kernel has nothing more for us. mio's accept hands
    // back streams that are already non-blocking and close-on-exec.
    fn accept(&mut self) {
        loop {
            match self.listener.accept() {
                Ok((stream, peer)) => {
                    let entry = self.connections.vacant_entry();
                    let token = Token(entry.key());
                    let mut connection = Connection::new(stream, token, peer);

                    match connection.register(self.poll.registry()) {
                        Ok(()) => {
                            debug!("accepted {peer} as {token:?}");
                            entry.insert(Arc::new(Mutex::new(connection)));
                        }
                        // Dropping the unregistered record closes the socket.
                        Err(e) => warn!("could not register {peer}: {e}"),
                    }
                }
                Err(ref e) if e.kind() == ErrorKind::WouldBlock => return,
                Err(ref e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    error!("accept failed: {e}");
                    return;
                }
            }
        }
    }

    // Hands one ready record to the pool, flipping it to `Processing`
    // first so no second dispatch can race this one.
    fn dispatch(&mut self, token: Token) {
        let Some(conn) = self.connections.get(token.0) else {
            // Stale readiness for a record that was already removed.
            return;
        };
        let conn = Arc::clone(conn);

        {
            let mut record = match conn.try_lock() {
                Ok(record) => record,
                Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
                // A worker is mid-step. Skipping is safe: the step's
                // completion re-arm re-delivers readiness that still holds.
                Err(TryLockError::WouldBlock) => return,
            };

            let Some(resume) = record.dispatch_resume() else {
                return;
            };
            record.state = State::Processing(resume);
            record.last_active = Instant::now();
        }

        match self.queue.try_enqueue(Arc::clone(&conn)) {
            Ok(()) => {}
            Err(EnqueueError::Full) => {
                warn!("task queue full, refusing {token:?}");
                self.refuse(token);
            }
            Err(EnqueueError::Closed) => self.remove(token),
        }
    }

    // A worker finished a step: re-arm the record for what it needs next,
    // or drop it if the step closed it.
    fn service_completions(&mut self) {
        while let Ok(token) = self.completed.try_recv() {
            self.complete(token);
        }
    }

    fn complete(&mut self, token: Token) {
        let Some(conn) = self.connections.get(token.0) else {
            return;
        };
        let conn = Arc::clone(conn);

        let mut record = match conn.try_lock() {
            Ok(record) => record,
            Err(TryLockError::Poisoned(poisoned)) => poisoned.into_inner(),
            // Only possible if the slot was already reused and is mid-step;
            // that record's own completion will handle it.
            Err(TryLockError::WouldBlock) => return,
        };

        match record.state.interest() {
            Some(interest) => {
                if let Err(e) = record.rearm(self.poll.registry(), interest) {
                    // Without a re-arm the record can never progress.
                    warn!("re-arm failed for {}: {e}", record.peer());
                    record.destroy();
                    let _ = record.deregister(self.poll.registry());
                    drop(record);
                    self.remove(token);
                }
            }
            None => {
                if record.state == State::Closed {
                    let _ = record.deregister(self.poll.registry());
                    drop(record);
                    self.remove(token);
                }
                // Processing: a stale completion for a redispatched record.
            }
        }
    }

    // Admission-control backpressure: tell the client we are overloaded
    // and drop the record. One non-blocking write, no waiting.
    fn refuse(&mut self, token: Token) {
        if let Some(conn) = self.connections.try_remove(token.0) {
            let mut record = conn.lock().unwrap_or_else(|p| p.into_inner());
            record.send_error(Status::ServiceUnavailable);
            record.destroy();
            let _ = record.deregister(self.poll.registry());
        }
    }

    fn remove(&mut self, token: Token) {
        if self.connections.contains(token.0) {
            self.connections.remove(token.0);
            debug!("removed {token:?}");
        }
    }

    // Destroys records with no forward progress inside the timeout.
    // In-flight records are skipped; their workers keep `last_active`
    // fresh while they make progress.
    fn sweep(&mut self) {
        let now = Instant::now();
        let mut stale = Vec::new();

        for (key, conn) in self.connections.iter() {
            let record = match conn.try_lock() {
                Ok(record) => record,
                Err(_) => continue,
            };
            match record.state {
                State::Closed => stale.push(key),
                State::Processing(_) => {}
                _ if now.duration_since(record.last_active) > self.timeout => stale.push(key),
                _ => {}
            }
        }

        for key in stale {
            let conn = self.connections.remove(key);
            let mut record = conn.lock().unwrap_or_else(|p| p.into_inner());
            if record.state != State::Closed {
                debug!("idle sweep closing {}", record.peer());
                record.destroy();
            }
            let _ = record.deregister(self.poll.registry());
        }
    }

    /// Destroys every remaining record. Called after the workers have
    /// been joined, so nothing else holds the records.
    pub fn drain(&mut self) {
        let live = self.connections.len();
        if live > 0 {
            info!("closing {live} remaining connections");
        }
        self.connections.clear();
    }
}

// The host may resolve to several candidates; bind the first that works,
// the way getaddrinfo walks are usually written.
fn bind_listener(host: &str, port: u16, backlog: usize) -> io::Result<TcpListener> {
    let mut last_err = None;

    for addr in (host, port).to_socket_addrs()? {
        match bind_addr(addr, backlog) {
            Ok(listener) => return Ok(listener),
            Err(e) => {
                debug!("bind {addr} failed: {e}");
                last_err = Some(e);
            }
        }
    }

    Err(last_err.unwrap_or_else(|| {
        io::Error::new(ErrorKind::AddrNotAvailable, "host resolved to no usable address")
    }))
}

fn bind_addr(addr: SocketAddr, backlog: usize) -> io::Result<TcpListener> {
    let socket = Socket::new(Domain::for_address(addr), Type::STREAM, Some(Protocol::TCP))?;
    socket.set_reuse_address(true)?;
    socket.bind(&addr.into())?;
    socket.listen(backlog.min(i32::MAX as usize) as i32)?;
    socket.set_nonblocking(true)?;
    Ok(TcpListener::from_std(socket.into()))
}

#[cfg(test)]
mod test {
    use std::sync::Arc;

    use super::Reactor;
    use crate::config::ServerConfig;
    use crate::queue::TaskQueue;

    #[test]
    fn reactor_binds_an_ephemeral_port() {
        let config = ServerConfig {
            host: "127.0.0.1".to_string(),
            port: 0,
            ..ServerConfig::default()
        };
        let queue = Arc::new(TaskQueue::bounded(4));
        let (_tx, rx) = crossbeam_channel::unbounded();

        let reactor = Reactor::new(&config, queue, rx).unwrap();
        assert_ne!(0, reactor.local_addr().port());
    }

    #[test]
    fn bind_fails_for_an_unresolvable_host() {
        let config = ServerConfig {
            host: "definitely.not.a.real.host.invalid".to_string(),
            port: 0,
            ..ServerConfig::default()
        };
        let queue = Arc::new(TaskQueue::bounded(4));
        let (_tx, rx) = crossbeam_channel::unbounded();

        assert!(Reactor::new(&config, queue, rx).is_err());
    }
}
