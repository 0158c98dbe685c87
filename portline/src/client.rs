//! One asynchronous TCP client session.
//!
//! A [`Client`] owns a socket, a receive buffer, a send buffer and the list
//! of address candidates it is connecting to. Its lifecycle only moves
//! forward:
//!
//! ```text
//! Idle --create--> Created --first receive posted--> Connected
//!   \                  \                                  \
//!    +------------------+------------ close --------------+--> Closed
//! ```
//!
//! Operations are posted to the driver's [`CompletionPort`] and finish on
//! completion worker threads, which call back into the `complete_*`
//! functions here. The client never destroys itself: every failure ends in a
//! removal request to the registry.

use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use tracing::{debug, error, info, trace, warn};

use crate::buffer::IoBuf;
use crate::completion::UserData;
use crate::context::{ContextHandle, OpContext};
use crate::driver::Driver;
use crate::error::Error;
use crate::handler::ClientHandler;
use crate::metrics;
use crate::port::{CompletionPort, IoAssociation, Submitted};
use crate::registry::ClientId;
use crate::socket::{self, INVALID_SOCKET, SocketAddress};

/// Lifecycle state of a [`Client`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ClientState {
    /// Registered, no socket yet.
    Idle = 0,
    /// Socket created and bound; connecting is allowed.
    Created = 1,
    /// Session established; sending is allowed.
    Connected = 2,
    /// Socket closed. Terminal.
    Closed = 3,
}

impl ClientState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => ClientState::Idle,
            1 => ClientState::Created,
            2 => ClientState::Connected,
            _ => ClientState::Closed,
        }
    }
}

/// Result of handing one operation to the backend.
enum Posted {
    /// A completion will be dispatched for it.
    Pending,
    /// Finished synchronously; no completion will follow.
    Completed(ContextHandle),
    /// Rejected; no completion will follow.
    Failed(ContextHandle, io::Error),
}

pub struct Client {
    id: ClientId,
    driver: Arc<Driver>,
    handler: Arc<dyn ClientHandler>,
    state: AtomicU8,
    /// Held shared while an operation is being submitted and exclusively by
    /// `close`, so a descriptor number is never used after it was closed.
    socket: RwLock<RawFd>,
    io: IoAssociation,
    /// Address candidates of the connect in progress. Pending connects point
    /// into this list, so it is only dropped once the client is drained.
    candidates: Mutex<Option<Box<[SocketAddress]>>>,
    cursor: AtomicUsize,
    recv_buf: IoBuf,
    send_buf: IoBuf,
    recv_in_flight: AtomicBool,
    send_in_flight: AtomicBool,
}

impl Client {
    pub(crate) fn new(id: ClientId, driver: Arc<Driver>, handler: Arc<dyn ClientHandler>) -> Self {
        let config = driver.config();
        let recv_buf = IoBuf::new(config.recv_buffer_size);
        let send_buf = IoBuf::new(config.send_buffer_size);
        Client {
            id,
            driver,
            handler,
            state: AtomicU8::new(ClientState::Idle as u8),
            socket: RwLock::new(INVALID_SOCKET),
            io: IoAssociation::new(),
            candidates: Mutex::new(None),
            cursor: AtomicUsize::new(0),
            recv_buf,
            send_buf,
            recv_in_flight: AtomicBool::new(false),
            send_in_flight: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    pub fn state(&self) -> ClientState {
        ClientState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Number of posted operations whose completion has not been handled.
    pub fn pending_operations(&self) -> usize {
        self.io.pending()
    }

    /// Index of the address candidate the current or last connect attempt
    /// used.
    pub fn connect_attempt(&self) -> usize {
        self.cursor.load(Ordering::Acquire)
    }

    pub(crate) fn io(&self) -> &IoAssociation {
        &self.io
    }

    /// Create the socket and bind it to the configured local address and
    /// `port` (0 for an ephemeral port). `Idle -> Created`.
    pub fn create(&self, port: u16) -> Result<(), Error> {
        self.expect_state(ClientState::Idle)?;
        let config = self.driver.config();
        let bind = SocketAddr::new(config.bind_ip, port);

        let mut socket = self.socket.write().unwrap_or_else(PoisonError::into_inner);
        if *socket != INVALID_SOCKET {
            return Err(Error::InvalidState {
                expected: ClientState::Idle,
                actual: ClientState::Created,
            });
        }
        let fd = socket::create_socket(bind, config.reuse_addr).map_err(|err| {
            error!(client = %self.id, %bind, ?err, "socket setup failed");
            Error::Setup(err)
        })?;
        if let Err(actual) = self.transition(ClientState::Idle, ClientState::Created) {
            // Closed concurrently.
            socket::close_socket(fd);
            return Err(Error::InvalidState {
                expected: ClientState::Idle,
                actual,
            });
        }
        *socket = fd;
        debug!(client = %self.id, fd, %bind, "socket created");
        Ok(())
    }

    /// Resolve `host:port` and start connecting to the resolved addresses in
    /// order.
    ///
    /// `Ok` means one attempt is pending or the connect already succeeded;
    /// the outcome of a pending attempt arrives through the handler (or a
    /// removal, once every candidate has failed).
    pub fn post_connect(&self, host: &str, port: u16) -> Result<(), Error> {
        self.expect_state(ClientState::Created)?;
        let addrs = socket::resolve(host, port).map_err(|err| {
            error!(client = %self.id, host, port, ?err, "name resolution failed");
            Error::Resolution(format!("{host}:{port}"))
        })?;
        if addrs.is_empty() {
            error!(client = %self.id, host, port, "name resolution returned no addresses");
            return Err(Error::Resolution(format!("{host}:{port}")));
        }
        self.post_connect_to(&addrs)
    }

    /// Start connecting to `addrs`, trying each in order until one accepts.
    pub fn post_connect_to(&self, addrs: &[SocketAddr]) -> Result<(), Error> {
        self.expect_state(ClientState::Created)?;
        if addrs.is_empty() {
            return Err(Error::Resolution("empty address list".to_string()));
        }
        {
            let mut candidates = self.candidates.lock().unwrap_or_else(PoisonError::into_inner);
            if candidates.is_some() {
                return Err(Error::ConnectInProgress);
            }
            *candidates = Some(addrs.iter().copied().map(SocketAddress::new).collect());
        }

        let pool = self.driver.pool();
        let Some(mut ctx) = pool.acquire(OpContext::Connect {
            owner: self.id,
            attempt: 0,
        }) else {
            self.clear_candidates();
            return Err(Error::ContextPoolExhausted);
        };

        let mut last_err = None;
        for attempt in 0..addrs.len() {
            self.cursor.store(attempt, Ordering::Release);
            pool.update(
                &ctx,
                OpContext::Connect {
                    owner: self.id,
                    attempt: attempt as u32,
                },
            );
            match self.submit_connect(ctx, attempt) {
                Posted::Pending => return Ok(()),
                Posted::Completed(done) => {
                    pool.release(done);
                    self.complete_connect();
                    return Ok(());
                }
                Posted::Failed(back, err) => {
                    metrics::CONNECT_FAILURES.increment();
                    warn!(client = %self.id, attempt, addr = %addrs[attempt], ?err, "connect attempt failed");
                    last_err = Some(err);
                    ctx = back;
                }
            }
        }

        pool.release(ctx);
        // Nothing is pending, so the list can go and a later call may retry.
        self.clear_candidates();
        error!(client = %self.id, candidates = addrs.len(), "every address candidate failed");
        Err(Error::Connect(
            last_err.unwrap_or_else(|| io::Error::other("no address candidates")),
        ))
    }

    /// Post a receive into the client's buffer.
    ///
    /// The first successful post promotes `Created -> Connected` and fires
    /// [`ClientHandler::on_connect`]. Failures are reported through a removal
    /// request. Only one receive is ever outstanding; the session re-posts
    /// it after each delivery, so a call while one is pending does nothing.
    pub fn post_receive(&self) {
        let registry = self.driver.registry();
        if self.state() == ClientState::Closed {
            registry.request_removal(self.id);
            return;
        }
        if self.recv_in_flight.swap(true, Ordering::AcqRel) {
            debug!(client = %self.id, "receive already outstanding");
            return;
        }

        let pool = self.driver.pool();
        let Some(ctx) = pool.acquire(OpContext::Recv { owner: self.id }) else {
            self.end_recv();
            error!(client = %self.id, "no operation context for receive");
            registry.request_removal(self.id);
            return;
        };

        let buf = self.recv_buf.as_mut_ptr();
        let len = self.recv_buf.capacity();
        // Safety: `recv_in_flight` keeps this the only receive outstanding
        // and the buffer lives until `destroy` has drained every completion.
        let posted = self.post_op(ctx, |port, fd, token| unsafe { port.recv(fd, buf, len, token) });
        match posted {
            Posted::Pending => {
                if self
                    .transition(ClientState::Created, ClientState::Connected)
                    .is_ok()
                {
                    metrics::SESSIONS_ESTABLISHED.increment();
                    self.log_connection();
                    self.handler.on_connect(self);
                }
            }
            Posted::Completed(ctx) => {
                pool.release(ctx);
                self.end_recv();
                error!(client = %self.id, "receive finished without a completion");
                registry.request_removal(self.id);
            }
            Posted::Failed(ctx, err) => {
                pool.release(ctx);
                self.end_recv();
                if self.state() == ClientState::Created {
                    error!(client = %self.id, ?err, "peer did not accept the connection");
                } else {
                    error!(client = %self.id, ?err, "failed to post receive");
                }
                registry.request_removal(self.id);
            }
        }
    }

    /// Send `data` as one operation. Legal only while connected.
    ///
    /// At most one send may be in flight; the payload is copied into the
    /// client's send buffer, so `data` can be reused as soon as this returns.
    /// A short write is continued internally and
    /// [`ClientHandler::on_send`] fires once the whole payload is out.
    pub fn post_send(&self, data: &[u8]) -> Result<(), Error> {
        if self.state() != ClientState::Connected {
            return Err(Error::NotConnected);
        }
        let capacity = self.send_buf.capacity();
        if data.len() > capacity {
            return Err(Error::SendTooLarge {
                len: data.len(),
                capacity,
            });
        }
        if self.send_in_flight.swap(true, Ordering::AcqRel) {
            return Err(Error::SendInFlight);
        }

        // Safety: the in-flight flag gives this call exclusive use of the
        // send buffer.
        unsafe { self.send_buf.fill(data) };

        let pool = self.driver.pool();
        let Some(ctx) = pool.acquire(OpContext::Send {
            owner: self.id,
            offset: 0,
            len: data.len() as u32,
        }) else {
            self.send_in_flight.store(false, Ordering::Release);
            return Err(Error::ContextPoolExhausted);
        };

        match self.submit_send(ctx, 0, data.len()) {
            Posted::Pending => {
                trace!(client = %self.id, len = data.len(), "send posted");
                Ok(())
            }
            Posted::Completed(ctx) => {
                pool.release(ctx);
                self.send_in_flight.store(false, Ordering::Release);
                error!(client = %self.id, "send finished without a completion");
                self.driver.registry().request_removal(self.id);
                Err(Error::Transport(io::Error::other(
                    "send finished without a completion",
                )))
            }
            Posted::Failed(ctx, err) => {
                pool.release(ctx);
                self.send_in_flight.store(false, Ordering::Release);
                error!(client = %self.id, ?err, "failed to post send");
                self.driver.registry().request_removal(self.id);
                Err(Error::Transport(err))
            }
        }
    }

    /// Half-close: no more sends. Receives continue until the peer closes.
    pub fn shutdown(&self) -> Result<(), Error> {
        if self.state() != ClientState::Connected {
            return Err(Error::NotConnected);
        }
        let socket = self.socket.read().unwrap_or_else(PoisonError::into_inner);
        socket::shutdown_write(*socket).map_err(|err| {
            error!(client = %self.id, ?err, "shutdown failed");
            Error::Transport(err)
        })?;
        debug!(client = %self.id, "write side shut down");
        Ok(())
    }

    /// Abort outstanding operations and close the socket. Idempotent.
    ///
    /// Completions for the aborted operations are still dispatched; the
    /// client stays usable as a target for them until it is removed.
    pub fn close(&self) {
        let prev = self.state.swap(ClientState::Closed as u8, Ordering::AcqRel);
        if prev == ClientState::Closed as u8 {
            return;
        }
        let fd = {
            let mut socket = self.socket.write().unwrap_or_else(PoisonError::into_inner);
            std::mem::replace(&mut *socket, INVALID_SOCKET)
        };
        if fd != INVALID_SOCKET {
            self.driver.port().cancel(fd);
            socket::close_socket(fd);
        }
        debug!(client = %self.id, fd, "closed");
    }

    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        let socket = self.socket.read().unwrap_or_else(PoisonError::into_inner);
        socket::local_addr(*socket)
    }

    pub fn peer_addr(&self) -> io::Result<SocketAddr> {
        let socket = self.socket.read().unwrap_or_else(PoisonError::into_inner);
        socket::peer_addr(*socket)
    }

    // ── Completion side ──────────────────────────────────────────────

    /// Close the client and block until every posted operation's completion
    /// has been handled. Called by the registry during removal.
    pub(crate) fn destroy(&self) {
        self.close();
        self.io.wait_idle();
        self.clear_candidates();
        debug!(client = %self.id, "destroyed");
    }

    /// A connect attempt succeeded: finish the socket setup and start
    /// receiving, which establishes the session.
    pub(crate) fn complete_connect(&self) {
        let attempt = self.cursor.load(Ordering::Acquire);
        debug!(client = %self.id, attempt, "connect completed");
        if self.driver.config().tcp_nodelay {
            let socket = self.socket.read().unwrap_or_else(PoisonError::into_inner);
            if *socket != INVALID_SOCKET
                && let Err(err) = socket::set_nodelay(*socket)
            {
                error!(client = %self.id, ?err, "failed to configure connected socket");
                self.driver.registry().request_removal(self.id);
                return;
            }
        }
        self.post_receive();
    }

    /// A connect attempt failed: try the next candidate with the same
    /// context.
    ///
    /// Returns the context when it is no longer needed, `None` when it has
    /// been posted again or already released.
    pub(crate) fn retry_connect(&self, ctx: ContextHandle, err: &io::Error) -> Option<ContextHandle> {
        metrics::CONNECT_FAILURES.increment();
        let failed = self.cursor.load(Ordering::Acquire);
        warn!(client = %self.id, attempt = failed, ?err, "connect attempt failed");

        let total = self.candidate_count();
        let next = failed + 1;
        if next >= total {
            error!(client = %self.id, candidates = total, "every address candidate failed");
            self.driver.registry().request_removal(self.id);
            return Some(ctx);
        }

        self.cursor.store(next, Ordering::Release);
        self.driver.pool().update(
            &ctx,
            OpContext::Connect {
                owner: self.id,
                attempt: next as u32,
            },
        );
        match self.submit_connect(ctx, next) {
            Posted::Pending => None,
            Posted::Completed(ctx) => {
                self.driver.pool().release(ctx);
                self.complete_connect();
                None
            }
            Posted::Failed(ctx, err) => {
                metrics::CONNECT_FAILURES.increment();
                error!(client = %self.id, attempt = next, ?err, "failed to post connect retry");
                self.driver.registry().request_removal(self.id);
                Some(ctx)
            }
        }
    }

    /// `bytes` (non-zero) arrived in the receive buffer.
    pub(crate) fn complete_recv(&self, bytes: usize) {
        let bytes = bytes.min(self.recv_buf.capacity());
        metrics::BYTES_RECEIVED.add(bytes as u64);
        trace!(client = %self.id, bytes, "received");
        // Safety: the receive that filled the buffer has completed and
        // `recv_in_flight` stays set until the handler returns, so no other
        // receive is posted into it meanwhile.
        let data = unsafe { self.recv_buf.slice(bytes) };
        self.handler.on_recv(self, data);
        self.end_recv();
        self.post_receive();
    }

    /// A receive completed with zero bytes: the peer closed, or the client
    /// was closed locally.
    pub(crate) fn complete_close(&self) {
        let by_peer = self.state() != ClientState::Closed;
        if by_peer {
            metrics::SESSIONS_PEER_CLOSED.increment();
        }
        self.close();
        info!(client = %self.id, by_peer, "connection closed");
        self.handler.on_close(self);
    }

    /// A send wrote `bytes`. Continues a short write with the same context.
    ///
    /// [`ClientHandler::on_send`] fires only once the whole payload is out.
    /// A send that stops short (zero-byte write, client closed) ends the
    /// session like a transport failure.
    ///
    /// Returns the context once the send is finished, `None` when the
    /// remainder has been posted.
    pub(crate) fn complete_send(&self, ctx: ContextHandle, bytes: usize) -> Option<ContextHandle> {
        let pool = self.driver.pool();
        let OpContext::Send { owner, offset, len } = pool.context(&ctx) else {
            return Some(ctx);
        };
        metrics::BYTES_SENT.add(bytes as u64);
        let sent = (offset as usize + bytes).min(len as usize);

        if bytes > 0 && sent < len as usize && self.state() == ClientState::Connected {
            trace!(client = %self.id, sent, len, "short send, continuing");
            pool.update(
                &ctx,
                OpContext::Send {
                    owner,
                    offset: sent as u32,
                    len,
                },
            );
            return match self.submit_send(ctx, sent, len as usize) {
                Posted::Pending => None,
                Posted::Completed(ctx) | Posted::Failed(ctx, _) => {
                    error!(client = %self.id, sent, len, "failed to continue send");
                    self.abort_send();
                    self.driver.registry().request_removal(self.id);
                    Some(ctx)
                }
            };
        }

        self.abort_send();
        if sent < len as usize {
            error!(client = %self.id, sent, len, state = ?self.state(), "send truncated");
            self.driver.registry().request_removal(self.id);
            return Some(ctx);
        }
        trace!(client = %self.id, bytes = sent, "send complete");
        self.handler.on_send(self, sent);
        Some(ctx)
    }

    /// The send in flight is over; allow the next one.
    pub(crate) fn abort_send(&self) {
        self.send_in_flight.store(false, Ordering::Release);
    }

    /// The receive in flight has completed; allow the next one.
    pub(crate) fn end_recv(&self) {
        self.recv_in_flight.store(false, Ordering::Release);
    }

    // ── Internals ────────────────────────────────────────────────────

    fn expect_state(&self, expected: ClientState) -> Result<(), Error> {
        let actual = self.state();
        if actual != expected {
            return Err(Error::InvalidState { expected, actual });
        }
        Ok(())
    }

    fn transition(&self, from: ClientState, to: ClientState) -> Result<(), ClientState> {
        self.state
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .map(|_| ())
            .map_err(ClientState::from_u8)
    }

    fn candidate_count(&self) -> usize {
        self.candidates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map_or(0, |c| c.len())
    }

    fn clear_candidates(&self) {
        let candidates = self
            .candidates
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        drop(candidates);
    }

    fn submit_connect(&self, ctx: ContextHandle, attempt: usize) -> Posted {
        let candidates = self.candidates.lock().unwrap_or_else(PoisonError::into_inner);
        let Some(addr) = candidates.as_deref().and_then(|c| c.get(attempt)) else {
            return Posted::Failed(
                ctx,
                io::Error::new(io::ErrorKind::InvalidInput, "no such address candidate"),
            );
        };
        debug!(client = %self.id, attempt, addr = %addr.addr(), "connecting");
        // Safety: the candidate list is only dropped after the client has
        // drained (or when nothing is pending).
        let posted = self.post_op(ctx, |port, fd, token| unsafe { port.connect(fd, addr, token) });
        if !matches!(posted, Posted::Failed(..)) {
            metrics::CONNECT_ATTEMPTS.increment();
        }
        posted
    }

    fn submit_send(&self, ctx: ContextHandle, offset: usize, len: usize) -> Posted {
        let buf = self.send_buf.as_mut_ptr().wrapping_add(offset) as *const u8;
        let remaining = len - offset;
        // Safety: the send buffer is untouched until this send completes,
        // guarded by `send_in_flight`.
        self.post_op(ctx, |port, fd, token| unsafe {
            port.send(fd, buf, remaining, token)
        })
    }

    /// Detach `ctx`, account for the operation and submit it.
    ///
    /// The socket stays read-locked across the submission so `close` cannot
    /// swap the descriptor out from under it.
    fn post_op<F>(&self, ctx: ContextHandle, submit: F) -> Posted
    where
        F: FnOnce(&dyn CompletionPort, RawFd, UserData) -> io::Result<Submitted>,
    {
        let socket = self.socket.read().unwrap_or_else(PoisonError::into_inner);
        if *socket == INVALID_SOCKET {
            return Posted::Failed(ctx, io::Error::from_raw_os_error(libc::EBADF));
        }

        self.io.begin();
        let token = self.driver.pool().detach(ctx);
        let result = submit(self.driver.port(), *socket, token);
        drop(socket);

        match result {
            Ok(Submitted::Pending) => Posted::Pending,
            Ok(Submitted::Completed) => {
                self.io.abandon();
                self.take_back(token).map_or(Posted::Pending, Posted::Completed)
            }
            Err(err) => {
                self.io.abandon();
                match self.take_back(token) {
                    Some(ctx) => Posted::Failed(ctx, err),
                    None => Posted::Pending,
                }
            }
        }
    }

    /// Reclaim the context of an operation the backend did not start.
    fn take_back(&self, token: UserData) -> Option<ContextHandle> {
        let ctx = self.driver.pool().reclaim(token);
        if ctx.is_none() {
            error!(client = %self.id, ?token, "backend reported a completion for an operation it rejected");
        }
        ctx
    }

    fn log_connection(&self) {
        match (self.local_addr(), self.peer_addr()) {
            (Ok(local), Ok(peer)) => {
                info!(client = %self.id, %local, %peer, "connection established")
            }
            _ => info!(client = %self.id, "connection established"),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        let fd = *self.socket.get_mut().unwrap_or_else(PoisonError::into_inner);
        if fd != INVALID_SOCKET {
            socket::close_socket(fd);
        }
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("pending", &self.io.pending())
            .finish()
    }
}
