//! Line-oriented client: sends each stdin line to `host:port` and prints
//! whatever comes back.
//!
//! ```text
//! cargo run --example echo_client -- localhost 7878
//! RUST_LOG=portline=debug cargo run --example echo_client -- localhost 7878
//! ```

use std::io::{self, BufRead};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use portline::{Client, ClientHandler, Config, EngineBuilder, Error};
use tracing_subscriber::EnvFilter;

enum Notice {
    Connected,
    Data(Vec<u8>),
    Closed,
}

struct Forward {
    tx: Sender<Notice>,
}

impl ClientHandler for Forward {
    fn on_connect(&self, _client: &Client) {
        let _ = self.tx.send(Notice::Connected);
    }

    fn on_recv(&self, _client: &Client, data: &[u8]) {
        let _ = self.tx.send(Notice::Data(data.to_vec()));
    }

    fn on_close(&self, _client: &Client) {
        let _ = self.tx.send(Notice::Closed);
    }
}

fn wait(rx: &Receiver<Notice>) -> Option<Notice> {
    rx.recv_timeout(Duration::from_secs(5)).ok()
}

/// The previous send's completion may still be in a worker's queue.
fn send(client: &Client, data: &[u8]) -> Result<(), Error> {
    loop {
        match client.post_send(data) {
            Err(Error::SendInFlight) => thread::sleep(Duration::from_millis(1)),
            other => return other,
        }
    }
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .with_writer(io::stderr)
        .init();

    let mut args = std::env::args().skip(1);
    let host = args.next().unwrap_or_else(|| "127.0.0.1".to_string());
    let port: u16 = args.next().map_or(Ok(7878), |p| p.parse())?;

    let engine = EngineBuilder::new(Config::default()).launch()?;
    let (tx, rx) = crossbeam_channel::unbounded();
    let client = engine.client(Arc::new(Forward { tx }));
    client.create(0)?;
    client.post_connect(&host, port)?;

    match wait(&rx) {
        Some(Notice::Connected) => eprintln!("connected to {host}:{port}"),
        _ => {
            eprintln!("could not connect to {host}:{port}");
            return Ok(());
        }
    }

    for line in io::stdin().lock().lines() {
        let mut line = line?;
        line.push('\n');
        send(&client, line.as_bytes())?;

        let mut echoed = Vec::new();
        while echoed.len() < line.len() {
            match wait(&rx) {
                Some(Notice::Data(data)) => echoed.extend_from_slice(&data),
                Some(Notice::Connected) => {}
                Some(Notice::Closed) | None => {
                    eprintln!("connection closed");
                    engine.shutdown();
                    return Ok(());
                }
            }
        }
        print!("{}", String::from_utf8_lossy(&echoed));
    }

    engine.shutdown();
    Ok(())
}
