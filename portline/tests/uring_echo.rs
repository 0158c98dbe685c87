//! End-to-end tests against real TCP sockets using the io_uring backend.
//!
//! Each test skips itself when the kernel refuses to set up io_uring (old
//! kernels, seccomp-restricted containers).

#![cfg(target_os = "linux")]

use std::io::{Read, Write};
use std::net::{SocketAddr, TcpListener};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{Receiver, Sender};
use portline::{Client, ClientHandler, ClientState, ConfigBuilder, Engine, EngineBuilder, Error};

// ── Helpers ─────────────────────────────────────────────────────────

fn launch_engine() -> Option<Engine> {
    let config = ConfigBuilder::default()
        .workers(2)
        .bind_ip("127.0.0.1".parse().unwrap())
        .sq_entries(64)
        .build()
        .unwrap();
    match EngineBuilder::new(config).launch() {
        Ok(engine) => Some(engine),
        Err(Error::Setup(err)) => {
            eprintln!("skipping: io_uring unavailable: {err}");
            None
        }
        Err(err) => panic!("engine launch failed: {err}"),
    }
}

/// Echo server on an ephemeral port; one thread per connection.
fn echo_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            thread::spawn(move || {
                let mut buf = [0u8; 1024];
                loop {
                    match stream.read(&mut buf) {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            if stream.write_all(&buf[..n]).is_err() {
                                break;
                            }
                        }
                    }
                }
            });
        }
    });
    addr
}

/// Server that accepts and immediately closes every connection.
fn closing_server() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();
    thread::spawn(move || {
        for stream in listener.incoming() {
            drop(stream);
        }
    });
    addr
}

/// An address nothing listens on.
fn refused_addr() -> SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap()
}

/// Sends a greeting (if any) once connected and forwards everything it receives.
struct Greeter {
    greeting: &'static [u8],
    received: Sender<Vec<u8>>,
    closed: Sender<()>,
}

impl ClientHandler for Greeter {
    fn on_connect(&self, client: &Client) {
        if !self.greeting.is_empty() {
            client.post_send(self.greeting).unwrap();
        }
    }

    fn on_recv(&self, _client: &Client, data: &[u8]) {
        let _ = self.received.send(data.to_vec());
    }

    fn on_close(&self, _client: &Client) {
        let _ = self.closed.send(());
    }
}

fn greeter(greeting: &'static [u8]) -> (Arc<Greeter>, Receiver<Vec<u8>>, Receiver<()>) {
    let (received_tx, received_rx) = crossbeam_channel::unbounded();
    let (closed_tx, closed_rx) = crossbeam_channel::unbounded();
    let handler = Arc::new(Greeter {
        greeting,
        received: received_tx,
        closed: closed_tx,
    });
    (handler, received_rx, closed_rx)
}

/// Collect received chunks until `len` bytes have arrived.
fn collect(rx: &Receiver<Vec<u8>>, len: usize) -> Vec<u8> {
    let deadline = Instant::now() + Duration::from_secs(5);
    let mut out = Vec::new();
    while out.len() < len {
        let remaining = deadline.saturating_duration_since(Instant::now());
        match rx.recv_timeout(remaining) {
            Ok(chunk) => out.extend_from_slice(&chunk),
            Err(_) => panic!("timed out after {} of {len} bytes", out.len()),
        }
    }
    out
}

// ── Tests ───────────────────────────────────────────────────────────

#[test]
fn echo_round_trip() {
    let Some(engine) = launch_engine() else {
        return;
    };
    let server = echo_server();
    let (handler, received, _closed) = greeter(b"hello portline");

    let client = engine.client(handler);
    client.create(0).unwrap();
    client.post_connect("127.0.0.1", server.port()).unwrap();

    assert_eq!(collect(&received, 14), b"hello portline");
    assert_eq!(client.state(), ClientState::Connected);
    assert_eq!(client.peer_addr().unwrap(), server);

    engine.shutdown();
    assert_eq!(client.state(), ClientState::Closed);
}

#[test]
fn refused_candidate_is_skipped() {
    let Some(engine) = launch_engine() else {
        return;
    };
    let refused = refused_addr();
    let server = echo_server();
    let (handler, received, _closed) = greeter(b"second");

    let client = engine.client(handler);
    client.create(0).unwrap();
    client.post_connect_to(&[refused, server]).unwrap();

    assert_eq!(collect(&received, 6), b"second");
    assert_eq!(client.connect_attempt(), 1);

    engine.shutdown();
}

#[test]
fn peer_close_removes_client() {
    let Some(engine) = launch_engine() else {
        return;
    };
    let server = closing_server();
    let (handler, _received, closed) = greeter(b"");

    let client = engine.client(handler);
    let id = client.id();
    client.create(0).unwrap();
    client.post_connect_to(&[server]).unwrap();

    closed.recv_timeout(Duration::from_secs(5)).unwrap();

    let registry = engine.driver().registry();
    let deadline = Instant::now() + Duration::from_secs(5);
    while registry.client(id).is_some() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(registry.client(id).is_none());
    assert_eq!(client.state(), ClientState::Closed);

    engine.shutdown();
}

#[test]
fn unreachable_host_exhausts_candidates() {
    let Some(engine) = launch_engine() else {
        return;
    };
    let (handler, _received, _closed) = greeter(b"");

    let client = engine.client(handler);
    let id = client.id();
    client.create(0).unwrap();
    client
        .post_connect_to(&[refused_addr(), refused_addr()])
        .unwrap();

    let registry = engine.driver().registry();
    let deadline = Instant::now() + Duration::from_secs(5);
    while registry.client(id).is_some() && Instant::now() < deadline {
        thread::sleep(Duration::from_millis(5));
    }
    assert!(registry.client(id).is_none());
    assert_eq!(client.connect_attempt(), 1);

    engine.shutdown();
}
