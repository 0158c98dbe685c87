use std::io;

use thiserror::Error;

use crate::client::ClientState;

/// Errors returned by portline client operations.
///
/// Only the synchronous entry points (`create`, `post_connect`, `post_send`,
/// `shutdown`) return these. Failures discovered while dispatching a
/// completion are logged and turned into a removal request instead.
#[derive(Debug, Error)]
pub enum Error {
    /// Socket creation, address binding or I/O association setup failed.
    #[error("socket setup: {0}")]
    Setup(#[source] io::Error),
    /// Name resolution produced no address candidates.
    #[error("no addresses resolved for {0}")]
    Resolution(String),
    /// Every address candidate failed to connect.
    #[error("connect failed: {0}")]
    Connect(#[source] io::Error),
    /// A connect is already outstanding on this client.
    #[error("connect already in progress")]
    ConnectInProgress,
    /// A receive, send or shutdown could not be issued.
    #[error("transport: {0}")]
    Transport(#[source] io::Error),
    /// The operation is not legal in the client's current state.
    #[error("invalid state: expected {expected:?}, found {actual:?}")]
    InvalidState {
        expected: ClientState,
        actual: ClientState,
    },
    /// A send was requested before the session was established.
    #[error("client is not connected")]
    NotConnected,
    /// The payload does not fit into the client's send buffer.
    #[error("send of {len} bytes exceeds buffer capacity {capacity}")]
    SendTooLarge { len: usize, capacity: usize },
    /// A previous send on this client has not completed yet.
    #[error("send already in flight")]
    SendInFlight,
    /// No free operation context slots.
    #[error("operation context pool exhausted")]
    ContextPoolExhausted,
    /// Invalid configuration value.
    #[error("config: {0}")]
    Config(String),
    /// Backend or thread setup failed.
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
