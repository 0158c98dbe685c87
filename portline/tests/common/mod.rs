//! Scripted completion backend and helpers shared by the integration tests.
//!
//! `ScriptedPort` never touches the network. Every post is recorded and
//! answered from a per-kind script (pending by default); the test then
//! plays the completions back through a `Dispatcher` by hand, in whatever
//! order and on whatever thread it wants.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::Sender;
use tracing_subscriber::EnvFilter;
use portline::socket::SocketAddress;
use portline::{
    Client, ClientHandler, CompletionEvent, CompletionPort, Config, ConfigBuilder, Dispatcher,
    Driver, OpTag, Submitted, UserData,
};

// ── Scripted port ───────────────────────────────────────────────────

/// How the port answers the next post of a given kind.
#[derive(Debug, Clone, Copy)]
pub enum Outcome {
    Pending,
    Completed,
    Fail(i32),
}

/// One recorded post.
#[derive(Debug, Clone)]
pub struct Submission {
    pub kind: OpTag,
    pub fd: RawFd,
    pub token: UserData,
    pub addr: Option<SocketAddr>,
    pub buf: usize,
    pub len: usize,
}

#[derive(Default)]
pub struct ScriptedPort {
    connect: Mutex<VecDeque<Outcome>>,
    recv: Mutex<VecDeque<Outcome>>,
    send: Mutex<VecDeque<Outcome>>,
    submissions: Mutex<Vec<Submission>>,
    cancelled: Mutex<Vec<RawFd>>,
    /// Set when running under an engine: completions go through this
    /// channel instead of a hand-held dispatcher.
    events: Mutex<Option<Sender<CompletionEvent>>>,
    outstanding: Mutex<Vec<Submission>>,
}

impl ScriptedPort {
    pub fn script(&self, kind: OpTag, outcomes: &[Outcome]) {
        let queue = match kind {
            OpTag::Connect => &self.connect,
            OpTag::Recv => &self.recv,
            OpTag::Send => &self.send,
            OpTag::Wake => panic!("wake is not scriptable"),
        };
        queue.lock().unwrap().extend(outcomes.iter().copied());
    }

    pub fn submissions(&self) -> Vec<Submission> {
        self.submissions.lock().unwrap().clone()
    }

    pub fn submissions_of(&self, kind: OpTag) -> Vec<Submission> {
        self.submissions()
            .into_iter()
            .filter(|s| s.kind == kind)
            .collect()
    }

    pub fn last(&self, kind: OpTag) -> Submission {
        self.submissions_of(kind)
            .pop()
            .unwrap_or_else(|| panic!("no {kind:?} submission recorded"))
    }

    pub fn cancelled(&self) -> Vec<RawFd> {
        self.cancelled.lock().unwrap().clone()
    }

    /// Report completions through `events`, the way a real backend does.
    /// `cancel` then completes every outstanding operation on the
    /// descriptor with `ECANCELED`.
    pub fn attach(&self, events: Sender<CompletionEvent>) {
        *self.events.lock().unwrap() = Some(events);
    }

    /// Complete an outstanding operation through the attached channel.
    pub fn complete(&self, token: UserData, result: io::Result<usize>) {
        {
            let mut outstanding = self.outstanding.lock().unwrap();
            let idx = outstanding
                .iter()
                .position(|s| s.token == token)
                .expect("no such outstanding operation");
            outstanding.remove(idx);
        }
        let events = self.events.lock().unwrap().clone().expect("port not attached");
        events.send(CompletionEvent::new(token, result)).unwrap();
    }

    /// Write `data` into a pending receive's buffer and complete it through
    /// the attached channel.
    pub fn complete_recv(&self, sub: &Submission, data: &[u8]) {
        assert!(data.len() <= sub.len);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), sub.buf as *mut u8, data.len());
        }
        self.complete(sub.token, Ok(data.len()));
    }

    fn answer(&self, queue: &Mutex<VecDeque<Outcome>>, sub: Submission) -> io::Result<Submitted> {
        let outcome = queue.lock().unwrap().pop_front().unwrap_or(Outcome::Pending);
        if matches!(outcome, Outcome::Pending) {
            self.outstanding.lock().unwrap().push(sub.clone());
        }
        self.submissions.lock().unwrap().push(sub);
        match outcome {
            Outcome::Pending => Ok(Submitted::Pending),
            Outcome::Completed => Ok(Submitted::Completed),
            Outcome::Fail(errno) => Err(io::Error::from_raw_os_error(errno)),
        }
    }
}

impl CompletionPort for ScriptedPort {
    unsafe fn connect(
        &self,
        fd: RawFd,
        addr: &SocketAddress,
        token: UserData,
    ) -> io::Result<Submitted> {
        let sub = Submission {
            kind: OpTag::Connect,
            fd,
            token,
            addr: Some(addr.addr()),
            buf: 0,
            len: 0,
        };
        self.answer(&self.connect, sub)
    }

    unsafe fn recv(
        &self,
        fd: RawFd,
        buf: *mut u8,
        len: usize,
        token: UserData,
    ) -> io::Result<Submitted> {
        let sub = Submission {
            kind: OpTag::Recv,
            fd,
            token,
            addr: None,
            buf: buf as usize,
            len,
        };
        self.answer(&self.recv, sub)
    }

    unsafe fn send(
        &self,
        fd: RawFd,
        buf: *const u8,
        len: usize,
        token: UserData,
    ) -> io::Result<Submitted> {
        let sub = Submission {
            kind: OpTag::Send,
            fd,
            token,
            addr: None,
            buf: buf as usize,
            len,
        };
        self.answer(&self.send, sub)
    }

    fn cancel(&self, fd: RawFd) {
        self.cancelled.lock().unwrap().push(fd);
        let Some(events) = self.events.lock().unwrap().clone() else {
            return;
        };
        let aborted: Vec<Submission> = {
            let mut outstanding = self.outstanding.lock().unwrap();
            let (aborted, kept): (Vec<_>, Vec<_>) =
                outstanding.drain(..).partition(|s| s.fd == fd);
            *outstanding = kept;
            aborted
        };
        for sub in aborted {
            let result = Err(io::Error::from_raw_os_error(libc::ECANCELED));
            let _ = events.send(CompletionEvent::new(sub.token, result));
        }
    }
}

// ── Recording handler ───────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    Connect,
    Recv(Vec<u8>),
    Send(usize),
    Close,
}

#[derive(Default)]
pub struct Recorder {
    events: Mutex<Vec<Event>>,
}

impl Recorder {
    pub fn events(&self) -> Vec<Event> {
        self.events.lock().unwrap().clone()
    }

    pub fn count(&self, event: &Event) -> usize {
        self.events().iter().filter(|e| *e == event).count()
    }
}

impl ClientHandler for Recorder {
    fn on_connect(&self, _client: &Client) {
        self.events.lock().unwrap().push(Event::Connect);
    }

    fn on_recv(&self, _client: &Client, data: &[u8]) {
        self.events.lock().unwrap().push(Event::Recv(data.to_vec()));
    }

    fn on_send(&self, _client: &Client, bytes: usize) {
        self.events.lock().unwrap().push(Event::Send(bytes));
    }

    fn on_close(&self, _client: &Client) {
        self.events.lock().unwrap().push(Event::Close);
    }
}

// ── Harness ─────────────────────────────────────────────────────────

pub const RECV_BUFFER: usize = 64;
pub const SEND_BUFFER: usize = 32;

pub fn test_config() -> Config {
    ConfigBuilder::default()
        .buffers(RECV_BUFFER, SEND_BUFFER)
        .context_pool(16)
        .bind_ip("127.0.0.1".parse().unwrap())
        .build()
        .unwrap()
}

pub struct Harness {
    pub port: Arc<ScriptedPort>,
    pub driver: Arc<Driver>,
    pub dispatcher: Dispatcher,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(test_config())
    }

    pub fn with_config(config: Config) -> Self {
        init_tracing();
        let port = Arc::new(ScriptedPort::default());
        let driver = Driver::new(config, port.clone()).unwrap();
        let dispatcher = Dispatcher::new(driver.clone());
        Harness {
            port,
            driver,
            dispatcher,
        }
    }

    /// A client with a bound socket, ready to connect.
    pub fn created_client(&self, handler: Arc<dyn ClientHandler>) -> Arc<Client> {
        let client = self.driver.new_client(handler);
        client.create(0).unwrap();
        client
    }

    /// A client whose connect completed synchronously; its first receive is
    /// posted and pending.
    pub fn connected_client(&self, handler: Arc<dyn ClientHandler>) -> Arc<Client> {
        let client = self.created_client(handler);
        self.port.script(OpTag::Connect, &[Outcome::Completed]);
        client.post_connect_to(&[addr(1)]).unwrap();
        client
    }

    pub fn deliver(&self, token: UserData, result: io::Result<usize>) {
        self.dispatcher.dispatch(CompletionEvent::new(token, result));
    }

    pub fn fail(&self, token: UserData, errno: i32) {
        self.deliver(token, Err(io::Error::from_raw_os_error(errno)));
    }

    /// Write `data` into the buffer of a pending receive and complete it.
    pub fn receive(&self, sub: &Submission, data: &[u8]) {
        assert_eq!(sub.kind, OpTag::Recv);
        assert!(data.len() <= sub.len);
        unsafe {
            std::ptr::copy_nonoverlapping(data.as_ptr(), sub.buf as *mut u8, data.len());
        }
        self.deliver(sub.token, Ok(data.len()));
    }

    /// Bytes a pending send points at.
    pub fn sent_bytes(&self, sub: &Submission) -> Vec<u8> {
        assert_eq!(sub.kind, OpTag::Send);
        unsafe { std::slice::from_raw_parts(sub.buf as *const u8, sub.len).to_vec() }
    }

    pub fn removals_pending(&self) -> usize {
        self.driver.registry().removals().len()
    }
}

/// Log to the test output; `RUST_LOG=portline=trace` to see dispatch.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Documentation-range address `192.0.2.<n>:7000`; never contacted.
pub fn addr(n: u8) -> SocketAddr {
    SocketAddr::from(([192, 0, 2, n], 7000))
}

/// Spin until `cond` holds or a few seconds pass.
pub fn wait_for(mut cond: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        thread::sleep(Duration::from_millis(1));
    }
    cond()
}
