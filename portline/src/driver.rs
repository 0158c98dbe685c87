use std::sync::Arc;

use tracing::debug;

use crate::client::Client;
use crate::config::Config;
use crate::context::ContextPool;
use crate::error::Error;
use crate::handler::ClientHandler;
use crate::port::CompletionPort;
use crate::registry::ClientRegistry;

/// State shared by every client of one engine: the completion port clients
/// post to, the operation context pool, and the client registry.
pub struct Driver {
    config: Config,
    port: Arc<dyn CompletionPort>,
    pool: ContextPool,
    registry: ClientRegistry,
}

impl Driver {
    /// Validate `config` and build a driver around `port`.
    pub fn new(config: Config, port: Arc<dyn CompletionPort>) -> Result<Arc<Self>, Error> {
        config.validate()?;
        let pool = ContextPool::new(config.context_pool_capacity);
        debug!(
            contexts = config.context_pool_capacity,
            recv_buffer = config.recv_buffer_size,
            send_buffer = config.send_buffer_size,
            "driver created"
        );
        Ok(Arc::new(Driver {
            config,
            port,
            pool,
            registry: ClientRegistry::new(),
        }))
    }

    /// Register a new client in the `Idle` state.
    pub fn new_client(self: &Arc<Self>, handler: Arc<dyn ClientHandler>) -> Arc<Client> {
        self.registry
            .register(|id| Client::new(id, self.clone(), handler))
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn port(&self) -> &dyn CompletionPort {
        &*self.port
    }

    pub fn pool(&self) -> &ContextPool {
        &self.pool
    }

    pub fn registry(&self) -> &ClientRegistry {
        &self.registry
    }
}
