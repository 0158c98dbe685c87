use std::net::{IpAddr, Ipv4Addr};

use crate::error::Error;

/// Configuration for the client engine.
#[derive(Debug, Clone)]
pub struct Config {
    /// Capacity of each client's receive buffer. One receive never delivers
    /// more than this many bytes.
    pub recv_buffer_size: usize,
    /// Capacity of each client's send buffer. Larger payloads are rejected.
    pub send_buffer_size: usize,
    /// Number of operation context slots shared by all clients. Each
    /// outstanding connect, receive or send holds one slot until its
    /// completion has been dispatched.
    pub context_pool_capacity: u32,
    /// Local address client sockets bind to. The port comes from
    /// [`Client::create`](crate::Client::create).
    pub bind_ip: IpAddr,
    /// Set SO_REUSEADDR on client sockets so the same local port can be
    /// reused immediately after a restart.
    pub reuse_addr: bool,
    /// Enable TCP_NODELAY once a connect succeeds.
    pub tcp_nodelay: bool,
    /// Number of io_uring SQ entries. CQ will be 4x this.
    pub sq_entries: u32,
    /// Completion worker configuration.
    pub worker: WorkerConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            recv_buffer_size: 4096,
            send_buffer_size: 4096,
            context_pool_capacity: 4096,
            bind_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            reuse_addr: true,
            tcp_nodelay: true,
            sq_entries: 256,
            worker: WorkerConfig::default(),
        }
    }
}

impl Config {
    /// Validate configuration values. Returns an error if any value is out of range.
    pub fn validate(&self) -> Result<(), Error> {
        if self.recv_buffer_size == 0 || self.recv_buffer_size > u32::MAX as usize {
            return Err(Error::Config(
                "recv_buffer_size must be > 0 and fit in u32".into(),
            ));
        }
        if self.send_buffer_size == 0 || self.send_buffer_size > u32::MAX as usize {
            return Err(Error::Config(
                "send_buffer_size must be > 0 and fit in u32".into(),
            ));
        }
        if self.context_pool_capacity == 0 || self.context_pool_capacity >= (1 << 24) {
            return Err(Error::Config(
                "context_pool_capacity must be > 0 and < 2^24".into(),
            ));
        }
        if self.sq_entries == 0 || !self.sq_entries.is_power_of_two() {
            return Err(Error::Config(
                "sq_entries must be > 0 and a power of two".into(),
            ));
        }
        Ok(())
    }
}

/// Configuration for the completion worker pool.
#[derive(Debug, Clone, Default)]
pub struct WorkerConfig {
    /// Number of threads dispatching completions. 0 = number of CPUs.
    pub threads: usize,
}

/// Builder for [`Config`] with discoverable methods and `build()` validation.
///
/// # Example
///
/// ```rust
/// use portline::ConfigBuilder;
///
/// let config = ConfigBuilder::default()
///     .workers(4)
///     .buffers(8192, 8192)
///     .context_pool(1024)
///     .tcp_nodelay(true)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Set the number of completion worker threads (0 = number of CPUs).
    pub fn workers(mut self, threads: usize) -> Self {
        self.config.worker.threads = threads;
        self
    }

    /// Set the per-client receive and send buffer capacities.
    pub fn buffers(mut self, recv: usize, send: usize) -> Self {
        self.config.recv_buffer_size = recv;
        self.config.send_buffer_size = send;
        self
    }

    /// Set the number of operation context slots.
    pub fn context_pool(mut self, capacity: u32) -> Self {
        self.config.context_pool_capacity = capacity;
        self
    }

    /// Set the local address client sockets bind to.
    pub fn bind_ip(mut self, ip: IpAddr) -> Self {
        self.config.bind_ip = ip;
        self
    }

    /// Enable or disable SO_REUSEADDR on client sockets.
    pub fn reuse_addr(mut self, enabled: bool) -> Self {
        self.config.reuse_addr = enabled;
        self
    }

    /// Enable or disable TCP_NODELAY on connected sockets.
    pub fn tcp_nodelay(mut self, enabled: bool) -> Self {
        self.config.tcp_nodelay = enabled;
        self
    }

    /// Set the number of io_uring SQ entries (must be a power of two).
    pub fn sq_entries(mut self, entries: u32) -> Self {
        self.config.sq_entries = entries;
        self
    }

    /// Validate and return the config.
    pub fn build(self) -> Result<Config, Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}
