//! Boot-time configuration for the transaction-server connection layer.

/// Configuration read once at boot.
///
/// Controls the page-server pool, storage mode and the timing of the
/// connect/reconnect machinery.
#[derive(Debug, Clone)]
pub struct TranServerConfig {
    /// Comma-separated `host:port` list of page servers.
    /// Empty means local storage only.
    pub page_server_hosts: String,

    /// Whether the database lives on the page servers.  If true, boot
    /// requires at least one successful page-server connection.
    /// Only the active server variant honors this flag.
    pub remote_storage: bool,

    /// Verbose logging of every consensus-LSA computation.
    pub log_quorum_consensus: bool,

    /// Upper bound on concurrently active clients; a sizing hint for the
    /// per-connection response partitioning.
    pub max_clients: usize,

    /// Poll timeout of a page-server channel (ms).  Bounds the TCP connect,
    /// the handshake reads and each recv poll.
    pub channel_poll_timeout_ms: u64,

    /// Period of the background reconnect daemon (ms).
    pub connector_period_ms: u64,

    /// Sleep between main-connection attempts while booting (ms).
    pub boot_retry_interval_ms: u64,

    /// How long boot waits for the first main connection (ms).
    pub boot_timeout_ms: u64,
}

impl Default for TranServerConfig {
    fn default() -> Self {
        Self {
            page_server_hosts: String::new(),
            remote_storage: false,
            log_quorum_consensus: false,
            max_clients: 100,
            channel_poll_timeout_ms: 1_000,
            connector_period_ms: 5_000,
            boot_retry_interval_ms: 30,
            boot_timeout_ms: 30_000,
        }
    }
}

impl TranServerConfig {
    /// Config for local testing: production semantics, short timeouts.
    pub fn dev_default() -> Self {
        Self {
            page_server_hosts: String::new(),
            remote_storage: false,
            log_quorum_consensus: true,
            max_clients: 10,
            channel_poll_timeout_ms: 1_000,
            connector_period_ms: 150,
            boot_retry_interval_ms: 10,
            boot_timeout_ms: 5_000,
        }
    }
}

// ── Tests ───────────────────────────────────────────────────────────────────
