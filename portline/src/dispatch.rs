use std::io;
use std::sync::Arc;

use tracing::{error, trace, warn};

use crate::client::{Client, ClientState};
use crate::completion::CompletionEvent;
use crate::context::{ContextHandle, OpContext};
use crate::driver::Driver;
use crate::metrics;

/// Routes completion events back to the clients that posted them.
///
/// `dispatch` is the only entry point and may run on any number of threads
/// at once, for the same client as well. It never fails: every event either
/// re-arms an operation or ends with its context released, and errors turn
/// into removal requests.
#[derive(Clone)]
pub struct Dispatcher {
    driver: Arc<Driver>,
}

impl Dispatcher {
    pub fn new(driver: Arc<Driver>) -> Self {
        Dispatcher { driver }
    }

    pub fn driver(&self) -> &Arc<Driver> {
        &self.driver
    }

    /// Handle one completion.
    pub fn dispatch(&self, event: CompletionEvent) {
        let pool = self.driver.pool();
        let Some(ctx) = pool.reclaim(event.token) else {
            metrics::COMPLETIONS_STALE.increment();
            warn!(token = ?event.token, "completion for an unknown or stale context");
            return;
        };
        metrics::COMPLETIONS_DISPATCHED.increment();

        let op = pool.context(&ctx);
        let owner = op.owner();
        let registry = self.driver.registry();
        let Some(client) = registry.client(owner) else {
            metrics::COMPLETIONS_ORPHANED.increment();
            warn!(client = %owner, kind = ?op.kind(), "completion for a removed client");
            pool.release(ctx);
            return;
        };
        // Ends this operation for the client's drain once everything below,
        // including the context release, is done.
        let _done = client.io().guard();

        if !registry.is_alive(owner) {
            metrics::COMPLETIONS_ORPHANED.increment();
            trace!(client = %owner, kind = ?op.kind(), "completion for a client being removed");
            pool.release(ctx);
            return;
        }

        if let Some(ctx) = self.handle(&client, ctx, op, event.result) {
            pool.release(ctx);
        }
    }

    /// Returns the context unless it has been posted again.
    fn handle(
        &self,
        client: &Client,
        ctx: ContextHandle,
        op: OpContext,
        result: io::Result<usize>,
    ) -> Option<ContextHandle> {
        let pool = self.driver.pool();
        let registry = self.driver.registry();
        match (op, result) {
            (OpContext::Connect { .. }, Ok(_)) => {
                pool.release(ctx);
                client.complete_connect();
                None
            }
            (OpContext::Connect { .. }, Err(err)) => client.retry_connect(ctx, &err),
            (OpContext::Recv { .. }, Ok(bytes))
                if bytes > 0 && client.state() != ClientState::Closed =>
            {
                // Released first so the next receive never coexists with
                // this one.
                pool.release(ctx);
                client.complete_recv(bytes);
                None
            }
            (OpContext::Recv { .. }, Ok(_)) => {
                pool.release(ctx);
                client.end_recv();
                client.complete_close();
                registry.request_removal(client.id());
                None
            }
            (OpContext::Send { .. }, Ok(bytes)) => client.complete_send(ctx, bytes),
            (op, Err(err)) => {
                error!(client = %client.id(), kind = ?op.kind(), ?err, "operation failed");
                match op {
                    OpContext::Send { .. } => client.abort_send(),
                    OpContext::Recv { .. } => client.end_recv(),
                    OpContext::Connect { .. } => {}
                }
                registry.request_removal(client.id());
                Some(ctx)
            }
        }
    }
}
