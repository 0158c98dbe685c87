//! portline: completion-based asynchronous TCP client engine.
//!
//! Clients post connect, receive and send operations to a
//! [`CompletionPort`]; a pool of worker threads takes the completions and
//! dispatches them back to their clients. Each client is a small state
//! machine (`Idle -> Created -> Connected -> Closed`) that connects to
//! the first reachable address of a resolved host, then keeps exactly one
//! receive outstanding for the life of the session.
//!
//! The [`ClientRegistry`] decides which clients are alive. A completion
//! for a client whose removal has started only releases its operation
//! context, and clients are only ever destroyed through deferred removal,
//! never from inside a completion handler.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use portline::{Client, ClientHandler, Config, EngineBuilder};
//!
//! struct Hello;
//!
//! impl ClientHandler for Hello {
//!     fn on_connect(&self, client: &Client) {
//!         client.post_send(b"hello\n").ok();
//!     }
//!     fn on_recv(&self, _client: &Client, data: &[u8]) {
//!         println!("{}", String::from_utf8_lossy(data));
//!     }
//! }
//!
//! fn main() -> Result<(), portline::Error> {
//!     let engine = EngineBuilder::new(Config::default()).launch()?;
//!     let client = engine.client(Arc::new(Hello));
//!     client.create(0)?;
//!     client.post_connect("localhost", 7878)?;
//!     std::thread::sleep(std::time::Duration::from_secs(1));
//!     engine.shutdown();
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! The bundled [`UringPort`] backend needs Linux with io_uring. Other
//! backends can be plugged in through [`EngineBuilder::launch_with`].

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod buffer;
pub(crate) mod metrics;
pub(crate) mod worker;

// ── Public modules ──────────────────────────────────────────────────────
pub mod client;
pub mod completion;
pub mod config;
pub mod context;
pub mod dispatch;
pub mod driver;
pub mod error;
pub mod handler;
pub mod port;
pub mod registry;
pub mod socket;

// ── Re-exports: Client API ──────────────────────────────────────────────

pub use client::{Client, ClientState};
pub use handler::{ClientHandler, NoopHandler};
pub use registry::{ClientId, ClientRegistry};

// ── Re-exports: Engine ──────────────────────────────────────────────────

pub use dispatch::Dispatcher;
pub use driver::Driver;
pub use worker::{Engine, EngineBuilder};

// ── Re-exports: Backend ─────────────────────────────────────────────────

pub use completion::{CompletionEvent, OpTag, UserData};
pub use context::{ContextHandle, ContextPool, OpContext};
#[cfg(target_os = "linux")]
pub use port::UringPort;
pub use port::{CompletionPort, IoAssociation, Submitted};

// ── Re-exports: Config & errors ─────────────────────────────────────────

pub use config::{Config, ConfigBuilder, WorkerConfig};
pub use error::Error;
