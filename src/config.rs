//! Configuration types for udrpc.

/// Maximum number of physical ports an endpoint may bind to.
pub const MAX_PHY_PORTS: u8 = 16;

/// Per-endpoint configuration.
///
/// Controls the session-management timeout, allocator sizing, and the
/// threading model of one `Rpc` endpoint.
#[derive(Debug, Clone)]
pub struct RpcConfig {
    /// Zero-based physical port index, below `MAX_PHY_PORTS`.
    /// Default: 0
    pub phy_port: u8,
    /// NUMA node hint for the buffer allocator.
    /// Default: 0
    pub numa_node: usize,
    /// Whether background threads may touch this endpoint's allocator and
    /// buffer operations.
    /// Default: false
    pub multi_threaded: bool,
    /// Timeout for in-flight session-management requests, in milliseconds.
    /// A connect or disconnect request is re-sent each time this expires,
    /// with no bound on attempts.
    /// Default: 50
    pub sm_timeout_ms: u64,
    /// Capacity cap of the per-endpoint buffer allocator, in bytes.
    /// Default: 16 MiB
    pub alloc_capacity: usize,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            phy_port: 0,
            numa_node: 0,
            multi_threaded: false,
            sm_timeout_ms: 50,
            alloc_capacity: 16 * 1024 * 1024,
        }
    }
}

impl RpcConfig {
    /// Create a new configuration with default values.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the physical port index.
    pub fn with_phy_port(mut self, phy_port: u8) -> Self {
        self.phy_port = phy_port;
        self
    }

    /// Set the NUMA node hint.
    pub fn with_numa_node(mut self, numa_node: usize) -> Self {
        self.numa_node = numa_node;
        self
    }

    /// Enable or disable background-thread access.
    pub fn with_multi_threaded(mut self, multi_threaded: bool) -> Self {
        self.multi_threaded = multi_threaded;
        self
    }

    /// Set the session-management retry timeout.
    pub fn with_sm_timeout_ms(mut self, sm_timeout_ms: u64) -> Self {
        self.sm_timeout_ms = sm_timeout_ms;
        self
    }

    /// Set the allocator capacity cap.
    pub fn with_alloc_capacity(mut self, alloc_capacity: usize) -> Self {
        self.alloc_capacity = alloc_capacity;
        self
    }
}

/// Process-wide multiplexer configuration.
#[derive(Debug, Clone)]
pub struct NexusConfig {
    /// Hostname under which this process is reachable by remote peers.
    pub hostname: String,
    /// UDP port of the session-management plane. All peer processes must
    /// use the same port. 0 binds an ephemeral port, which is only useful
    /// for single-process setups and tests.
    /// Default: 31850
    pub sm_udp_port: u16,
    /// NUMA node of the process.
    /// Default: 0
    pub numa_node: usize,
    /// Whether to spawn the background session-management thread. When
    /// false, `Nexus::process_sm_tx` and `Nexus::process_sm_rx` must be
    /// driven by the embedding application.
    /// Default: true
    pub spawn_sm_thread: bool,
}

impl NexusConfig {
    /// Create a configuration for the given local hostname.
    pub fn new(hostname: &str) -> Self {
        Self {
            hostname: hostname.to_owned(),
            sm_udp_port: 31850,
            numa_node: 0,
            spawn_sm_thread: true,
        }
    }

    /// Set the session-management UDP port.
    pub fn with_sm_udp_port(mut self, sm_udp_port: u16) -> Self {
        self.sm_udp_port = sm_udp_port;
        self
    }

    /// Set the NUMA node.
    pub fn with_numa_node(mut self, numa_node: usize) -> Self {
        self.numa_node = numa_node;
        self
    }

    /// Enable or disable the background session-management thread.
    pub fn with_sm_thread(mut self, spawn_sm_thread: bool) -> Self {
        self.spawn_sm_thread = spawn_sm_thread;
        self
    }
}
