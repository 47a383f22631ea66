/// TLS server configuration. Pass a pre-built rustls ServerConfig; the
/// caller loads certs and keys and sets ALPN.
#[derive(Clone)]
pub struct TlsConfig {
    pub server_config: std::sync::Arc<rustls::ServerConfig>,
}

/// TLS client configuration for outbound connections.
#[derive(Clone)]
pub struct TlsClientConfig {
    /// Pre-built rustls ClientConfig with root certs, ALPN, etc.
    pub client_config: std::sync::Arc<rustls::ClientConfig>,
}

/// Configuration for the server engine.
#[derive(Clone)]
pub struct Config {
    /// Number of SQ entries. CQ is sized 4x this.
    pub sq_entries: u32,
    /// Recv buffer configuration (provided buffer ring).
    pub recv_buffer: RecvBufferConfig,
    /// Worker/thread configuration.
    pub worker: WorkerConfig,
    /// TCP listen backlog.
    pub backlog: i32,
    /// Maximum number of connections per worker; also sizes the fixed
    /// file table.
    pub max_connections: u32,
    /// Initial capacity for per-connection recv accumulators.
    pub recv_accumulator_capacity: usize,
    /// Number of copy-send pool slots. Every in-flight send chunk holds
    /// one slot until its completion lands; exhaustion surfaces as an
    /// error to the handler. Memory cost is `count * slot_size`.
    pub send_copy_count: u16,
    /// Size of each copy-send pool slot in bytes. Larger sends are split
    /// into slot-sized chunks and serialized per connection.
    pub send_copy_slot_size: u32,
    /// Deadline-based flush interval in microseconds during CQE
    /// processing. If this much time passes mid-batch, pending SQEs are
    /// flushed early. 0 disables.
    pub flush_interval_us: u64,
    /// Maximum time in microseconds `submit_and_wait` blocks before the
    /// loop runs `on_tick` anyway. 0 blocks until a CQE arrives.
    pub tick_timeout_us: u64,
    /// When set, all accepted connections speak TLS.
    pub tls: Option<TlsConfig>,
    /// When set, outbound `connect_tls()` is available.
    pub tls_client: Option<TlsClientConfig>,
    /// Set TCP_NODELAY on accepted and outbound connections.
    pub tcp_nodelay: bool,
    /// Maximum standalone tasks (not bound to a connection) per worker,
    /// for [`spawn()`](crate::spawn).
    pub standalone_task_capacity: u32,
    /// Maximum concurrent timer slots per worker, for
    /// [`sleep()`](crate::sleep) and [`timeout()`](crate::timeout).
    pub timer_slots: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            sq_entries: 256,
            recv_buffer: RecvBufferConfig::default(),
            worker: WorkerConfig::default(),
            backlog: 1024,
            max_connections: 16000,
            recv_accumulator_capacity: 4096,
            send_copy_count: 1024,
            send_copy_slot_size: 16384,
            flush_interval_us: 100,
            tick_timeout_us: 1000,
            tls: None,
            tls_client: None,
            tcp_nodelay: true,
            standalone_task_capacity: 256,
            timer_slots: 256,
        }
    }
}

impl Config {
    /// Validate configuration values.
    pub fn validate(&self) -> Result<(), crate::error::Error> {
        let checks = [
            (
                self.recv_buffer.ring_size.is_power_of_two(),
                "recv_buffer.ring_size must be a power of two",
            ),
            (
                self.max_connections > 0 && self.max_connections < (1 << 24),
                "max_connections must be > 0 and < 2^24",
            ),
            (self.timer_slots <= 65535, "timer_slots must be <= 65535"),
            (self.send_copy_slot_size > 0, "send_copy_slot_size must be > 0"),
            (self.send_copy_count > 0, "send_copy_count must be > 0"),
            (
                self.sq_entries > 0 && self.sq_entries.is_power_of_two(),
                "sq_entries must be > 0 and a power of two",
            ),
            (
                self.standalone_task_capacity < (1 << 31),
                "standalone_task_capacity must be < 2^31",
            ),
        ];
        for (ok, msg) in checks {
            if !ok {
                return Err(crate::error::Error::RingSetup(msg.into()));
            }
        }
        Ok(())
    }
}

/// Configuration for the provided buffer ring backing multishot recv.
#[derive(Clone)]
pub struct RecvBufferConfig {
    /// Number of buffers in the ring; must be a power of two.
    pub ring_size: u16,
    /// Size of each buffer in bytes.
    pub buffer_size: u32,
    /// Buffer group id.
    pub bgid: u16,
}

impl Default for RecvBufferConfig {
    fn default() -> Self {
        Self {
            ring_size: 256,
            buffer_size: 16384,
            bgid: 0,
        }
    }
}

/// Thread-per-core worker settings.
#[derive(Clone)]
pub struct WorkerConfig {
    /// Number of worker threads. 0 = number of CPUs.
    pub threads: usize,
    /// Pin each worker to a CPU core.
    pub pin_to_core: bool,
    /// Starting CPU core index for pinning.
    pub core_offset: usize,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            threads: 0,
            pin_to_core: true,
            core_offset: 0,
        }
    }
}

/// Builder for [`Config`] with discoverable methods and `build()`
/// validation.
///
/// # Example
///
/// ```rust
/// use shoreline::ConfigBuilder;
///
/// let config = ConfigBuilder::default()
///     .workers(4)
///     .max_connections(8000)
///     .sq_entries(512)
///     .tcp_nodelay(true)
///     .recv_buffer(256, 4096)
///     .send_pool(512, 8192)
///     .timer_slots(1024)
///     .build()
///     .expect("invalid config");
/// ```
#[derive(Default)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    fn with(mut self, f: impl FnOnce(&mut Config)) -> Self {
        f(&mut self.config);
        self
    }

    /// Number of worker threads. 0 = number of CPUs.
    pub fn workers(self, n: usize) -> Self {
        self.with(|c| c.worker.threads = n)
    }

    pub fn pin_to_core(self, enable: bool) -> Self {
        self.with(|c| c.worker.pin_to_core = enable)
    }

    pub fn core_offset(self, offset: usize) -> Self {
        self.with(|c| c.worker.core_offset = offset)
    }

    pub fn max_connections(self, n: u32) -> Self {
        self.with(|c| c.max_connections = n)
    }

    pub fn backlog(self, n: i32) -> Self {
        self.with(|c| c.backlog = n)
    }

    pub fn tcp_nodelay(self, enable: bool) -> Self {
        self.with(|c| c.tcp_nodelay = enable)
    }

    /// Number of SQ entries. CQ is 4x this. Must be a power of two.
    pub fn sq_entries(self, n: u32) -> Self {
        self.with(|c| c.sq_entries = n)
    }

    pub fn recv_buffer(self, ring_size: u16, buffer_size: u32) -> Self {
        self.with(|c| {
            c.recv_buffer.ring_size = ring_size;
            c.recv_buffer.buffer_size = buffer_size;
        })
    }

    pub fn recv_accumulator_capacity(self, n: usize) -> Self {
        self.with(|c| c.recv_accumulator_capacity = n)
    }

    /// Number and size of copy-send pool slots.
    pub fn send_pool(self, count: u16, slot_size: u32) -> Self {
        self.with(|c| {
            c.send_copy_count = count;
            c.send_copy_slot_size = slot_size;
        })
    }

    pub fn standalone_task_capacity(self, n: u32) -> Self {
        self.with(|c| c.standalone_task_capacity = n)
    }

    pub fn timer_slots(self, n: u32) -> Self {
        self.with(|c| c.timer_slots = n)
    }

    /// Tick timeout in microseconds. 0 blocks indefinitely.
    pub fn tick_timeout_us(self, us: u64) -> Self {
        self.with(|c| c.tick_timeout_us = us)
    }

    /// Deadline-based flush interval in microseconds. 0 disables.
    pub fn flush_interval_us(self, us: u64) -> Self {
        self.with(|c| c.flush_interval_us = us)
    }

    /// TLS server configuration; accepted connections speak TLS.
    pub fn tls(self, config: TlsConfig) -> Self {
        self.with(|c| c.tls = Some(config))
    }

    /// TLS client configuration for outbound connections.
    pub fn tls_client(self, config: TlsClientConfig) -> Self {
        self.with(|c| c.tls_client = Some(config))
    }

    /// Mutable access to fields not covered by builder methods.
    pub fn config_mut(&mut self) -> &mut Config {
        &mut self.config
    }

    /// Validate and build the final [`Config`].
    pub fn build(self) -> Result<Config, crate::error::Error> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_validates() {
        assert!(Config::default().validate().is_ok());
    }

    #[test]
    fn rejects_non_power_of_two_ring_size() {
        let mut config = Config::default();
        config.recv_buffer.ring_size = 100;
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_zero_connections() {
        let mut config = Config::default();
        config.max_connections = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn builder_round_trip() {
        let config = ConfigBuilder::new()
            .workers(2)
            .max_connections(1024)
            .sq_entries(128)
            .recv_buffer(64, 4096)
            .send_pool(128, 8192)
            .build()
            .unwrap();
        assert_eq!(config.worker.threads, 2);
        assert_eq!(config.max_connections, 1024);
        assert_eq!(config.sq_entries, 128);
        assert_eq!(config.recv_buffer.ring_size, 64);
        assert_eq!(config.send_copy_count, 128);
    }
}
