use crate::client::Client;

/// Application callbacks for one client.
///
/// Invoked from completion worker threads. Callbacks for the same client
/// never overlap for receives; a send completion may run concurrently with a
/// receive completion. Implementations must not block.
///
/// Asynchronous failures are not reported here: a failed receive or send
/// ends the session, and the client is then removed from its registry.
pub trait ClientHandler: Send + Sync + 'static {
    /// The session is established: the connect succeeded and the first
    /// receive has been posted. Sending is legal from here on.
    fn on_connect(&self, _client: &Client) {}

    /// Bytes arrived. The slice is only valid for the duration of the call;
    /// the next receive is posted right after this returns.
    fn on_recv(&self, _client: &Client, _data: &[u8]) {}

    /// A send finished; `bytes` is the full payload length.
    fn on_send(&self, _client: &Client, _bytes: usize) {}

    /// The peer closed the connection or the client was closed locally
    /// while a receive was pending.
    fn on_close(&self, _client: &Client) {}
}

/// Handler that ignores every event.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopHandler;

impl ClientHandler for NoopHandler {}
