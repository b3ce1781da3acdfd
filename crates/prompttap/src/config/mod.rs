use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::error::{Result, TapError};

/// Main configuration structure for prompttap
#[derive(Debug, Clone, Deserialize, Default)]
pub struct Config {
    /// TLS-terminating proxy configuration
    #[serde(default)]
    pub proxy: ProxyConfig,
    /// Passive loopback capture configuration
    #[serde(default)]
    pub loopback: LoopbackConfig,
    /// Stream reassembly limits and timeouts
    #[serde(default)]
    pub reassembly: ReassemblyConfig,
    /// Classification and extraction settings
    #[serde(default)]
    pub extract: ExtractConfig,
    /// Duplicate suppression settings
    #[serde(default)]
    pub dedup: DedupConfig,
    /// Primary and fallback sink configuration
    #[serde(default)]
    pub storage: StorageConfig,
    /// Queue sizes and shutdown behaviour
    #[serde(default)]
    pub pipeline: PipelineConfig,
    /// Status endpoint configuration
    #[serde(default)]
    pub status: StatusConfig,
}

impl Config {
    /// Parse a config file, then apply environment overrides
    pub fn from_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            TapError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let mut config: Config = toml::from_str(&content)
            .map_err(|e| TapError::Config(format!("Failed to parse config: {e}")))?;
        config.apply_env_overrides();
        Ok(config)
    }

    /// Load from an explicit path, or from the first default location that exists.
    ///
    /// Search order: `~/.prompttap/config.toml`, `<config dir>/prompttap/config.toml`,
    /// `./config.toml`. Falls back to defaults when none exist.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        if let Some(path) = config_path {
            tracing::info!("Loading config from: {}", path.display());
            return Self::from_file(path);
        }

        let default_paths = [
            dirs::home_dir().map(|h| h.join(".prompttap").join("config.toml")),
            dirs::config_dir().map(|c| c.join("prompttap").join("config.toml")),
            Some(PathBuf::from("config.toml")),
        ];

        for path in default_paths.iter().flatten() {
            if path.exists() {
                tracing::info!("Loading config from: {}", path.display());
                return Self::from_file(path);
            }
        }

        tracing::info!("No config file found, using defaults");
        let mut config = Config::default();
        config.apply_env_overrides();
        Ok(config)
    }

    /// `MONGO_URI` and `PROXY_PORT` take precedence over the file
    pub fn apply_env_overrides(&mut self) {
        if let Ok(uri) = std::env::var("MONGO_URI") {
            if !uri.trim().is_empty() {
                self.storage.mongo_uri = uri;
            }
        }

        if let Ok(port) = std::env::var("PROXY_PORT") {
            match port.parse::<u16>() {
                Ok(port) => self.proxy.set_port(port),
                Err(_) => tracing::warn!("Ignoring invalid PROXY_PORT value: {port}"),
            }
        }
    }
}

/// TLS-terminating proxy configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ProxyConfig {
    /// Enable the MITM proxy listener
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Address to listen on (e.g., "127.0.0.1:8080")
    #[serde(default = "default_proxy_listen_addr")]
    pub listen_addr: String,
    /// Hosts whose TLS sessions are terminated and captured.
    /// Supports exact names and `*.suffix` wildcards.
    #[serde(default = "default_intercept_hosts")]
    pub intercept_hosts: Vec<String>,
    /// Hosts that are tunnelled untouched but logged at debug level
    #[serde(default = "default_log_only_hosts")]
    pub log_only_hosts: Vec<String>,
    /// PEM file holding the CA certificate
    #[serde(default = "default_ca_cert_path")]
    pub ca_cert_path: PathBuf,
    /// PEM file holding the CA private key
    #[serde(default = "default_ca_key_path")]
    pub ca_key_path: PathBuf,
    /// Number of per-host leaf certificates kept in memory
    #[serde(default = "default_leaf_cache_size")]
    pub leaf_cache_size: usize,
    /// Upstream connect and handshake timeout in seconds
    #[serde(default = "default_upstream_timeout_secs")]
    pub upstream_timeout_secs: u64,
    /// How long a relay may wait to enqueue a captured chunk before capture detaches
    #[serde(default = "default_capture_timeout_ms")]
    pub capture_timeout_ms: u64,
}

impl ProxyConfig {
    /// Port component of `listen_addr`, if it parses
    pub fn port(&self) -> Option<u16> {
        self.listen_addr
            .rsplit_once(':')
            .and_then(|(_, port)| port.parse().ok())
    }

    fn set_port(&mut self, port: u16) {
        let host = self
            .listen_addr
            .rsplit_once(':')
            .map(|(host, _)| host.to_string())
            .unwrap_or_else(|| "127.0.0.1".to_string());
        self.listen_addr = format!("{host}:{port}");
    }
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_proxy_listen_addr(),
            intercept_hosts: default_intercept_hosts(),
            log_only_hosts: default_log_only_hosts(),
            ca_cert_path: default_ca_cert_path(),
            ca_key_path: default_ca_key_path(),
            leaf_cache_size: default_leaf_cache_size(),
            upstream_timeout_secs: default_upstream_timeout_secs(),
            capture_timeout_ms: default_capture_timeout_ms(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_proxy_listen_addr() -> String {
    "127.0.0.1:8080".to_string()
}

fn default_intercept_hosts() -> Vec<String> {
    [
        "api.openai.com",
        "api.anthropic.com",
        "api.codeium.com",
        "server.codeium.com",
        "copilot-proxy.githubusercontent.com",
        "api.github.com",
        "generativelanguage.googleapis.com",
        "api.groq.com",
        "api.mistral.ai",
        "api.cohere.com",
        "api.together.xyz",
        "api.windsurf.ai",
        "server.windsurf.ai",
    ]
    .iter()
    .map(|h| h.to_string())
    .collect()
}

fn default_log_only_hosts() -> Vec<String> {
    ["unleash.codeium.com", "app.codeium.com", "codeium.com"]
        .iter()
        .map(|h| h.to_string())
        .collect()
}

fn default_data_dir() -> PathBuf {
    dirs::home_dir()
        .map(|h| h.join(".prompttap"))
        .unwrap_or_else(|| PathBuf::from(".prompttap"))
}

fn default_ca_cert_path() -> PathBuf {
    default_data_dir().join("ca-cert.pem")
}

fn default_ca_key_path() -> PathBuf {
    default_data_dir().join("ca-key.pem")
}

fn default_leaf_cache_size() -> usize {
    256
}

fn default_upstream_timeout_secs() -> u64 {
    30
}

fn default_capture_timeout_ms() -> u64 {
    250
}

/// Passive loopback capture configuration
#[derive(Debug, Clone, Deserialize)]
pub struct LoopbackConfig {
    /// Enable the loopback sniffer
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Loopback interface name
    #[serde(default = "default_interface")]
    pub interface: String,
    /// Capture program; must write pcap to stdout with `-w -`
    #[serde(default = "default_capture_command")]
    pub capture_command: String,
    /// Lowest port of the language-server RPC range
    #[serde(default = "default_port_range_start")]
    pub port_range_start: u16,
    /// Highest port of the language-server RPC range
    #[serde(default = "default_port_range_end")]
    pub port_range_end: u16,
    /// Ports never captured (the proxy and status ports are added automatically)
    #[serde(default = "default_excluded_ports")]
    pub excluded_ports: Vec<u16>,
    /// Streams with no packets for this long are closed
    #[serde(default = "default_stream_idle_secs")]
    pub stream_idle_secs: u64,
    /// The capture process must survive this long at startup
    #[serde(default = "default_startup_check_ms")]
    pub startup_check_ms: u64,
}

impl Default for LoopbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            interface: default_interface(),
            capture_command: default_capture_command(),
            port_range_start: default_port_range_start(),
            port_range_end: default_port_range_end(),
            excluded_ports: default_excluded_ports(),
            stream_idle_secs: default_stream_idle_secs(),
            startup_check_ms: default_startup_check_ms(),
        }
    }
}

fn default_interface() -> String {
    if cfg!(target_os = "macos") {
        "lo0".to_string()
    } else {
        "lo".to_string()
    }
}

fn default_capture_command() -> String {
    "tcpdump".to_string()
}

fn default_port_range_start() -> u16 {
    1024
}

fn default_port_range_end() -> u16 {
    65535
}

fn default_excluded_ports() -> Vec<u16> {
    vec![27017]
}

fn default_stream_idle_secs() -> u64 {
    300
}

fn default_startup_check_ms() -> u64 {
    500
}

/// Stream reassembly limits and timeouts
#[derive(Debug, Clone, Deserialize)]
pub struct ReassemblyConfig {
    /// Silence after which a streaming body is considered complete
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
    /// Largest accepted message head
    #[serde(default = "default_max_head_bytes")]
    pub max_head_bytes: usize,
    /// Largest accepted message body
    #[serde(default = "default_max_message_bytes")]
    pub max_message_bytes: usize,
    /// Interval at which workers check idle timeouts
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
}

impl Default for ReassemblyConfig {
    fn default() -> Self {
        Self {
            idle_timeout_secs: default_idle_timeout_secs(),
            max_head_bytes: default_max_head_bytes(),
            max_message_bytes: default_max_message_bytes(),
            tick_ms: default_tick_ms(),
        }
    }
}

fn default_idle_timeout_secs() -> u64 {
    10
}

fn default_max_head_bytes() -> usize {
    64 * 1024
}

fn default_max_message_bytes() -> usize {
    8 * 1024 * 1024
}

fn default_tick_ms() -> u64 {
    500
}

/// Classification and extraction settings
#[derive(Debug, Clone, Deserialize)]
pub struct ExtractConfig {
    /// Loopback RPC method names that carry prompts
    #[serde(default = "default_rpc_methods")]
    pub rpc_methods: Vec<String>,
    /// A request waits this long for its response before it is emitted alone
    #[serde(default = "default_pair_timeout_secs")]
    pub pair_timeout_secs: u64,
    /// Width of the fingerprint time bucket
    #[serde(default = "default_fingerprint_bucket_secs")]
    pub fingerprint_bucket_secs: u64,
}

impl Default for ExtractConfig {
    fn default() -> Self {
        Self {
            rpc_methods: default_rpc_methods(),
            pair_timeout_secs: default_pair_timeout_secs(),
            fingerprint_bucket_secs: default_fingerprint_bucket_secs(),
        }
    }
}

fn default_rpc_methods() -> Vec<String> {
    vec!["SendUserCascadeMessage".to_string()]
}

fn default_pair_timeout_secs() -> u64 {
    120
}

fn default_fingerprint_bucket_secs() -> u64 {
    30
}

/// Duplicate suppression settings
#[derive(Debug, Clone, Deserialize)]
pub struct DedupConfig {
    /// Events with the same fingerprint inside this window are suppressed
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
    /// How often expired fingerprints are swept
    #[serde(default = "default_sweep_interval_secs")]
    pub sweep_interval_secs: u64,
}

impl Default for DedupConfig {
    fn default() -> Self {
        Self {
            window_secs: default_window_secs(),
            sweep_interval_secs: default_sweep_interval_secs(),
        }
    }
}

fn default_window_secs() -> u64 {
    120
}

fn default_sweep_interval_secs() -> u64 {
    30
}

/// Primary and fallback sink configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StorageConfig {
    /// Use MongoDB as the primary sink
    #[serde(default = "default_true")]
    pub mongo_enabled: bool,
    /// MongoDB connection string (`MONGO_URI` overrides)
    #[serde(default = "default_mongo_uri")]
    pub mongo_uri: String,
    /// Database name
    #[serde(default = "default_database")]
    pub database: String,
    /// Collection name
    #[serde(default = "default_collection")]
    pub collection: String,
    /// Server selection timeout in seconds
    #[serde(default = "default_server_selection_timeout_secs")]
    pub server_selection_timeout_secs: u64,
    /// Upper bound on a single primary write
    #[serde(default = "default_write_timeout_secs")]
    pub write_timeout_secs: u64,
    /// While degraded, the primary is retried at most this often
    #[serde(default = "default_retry_primary_secs")]
    pub retry_primary_secs: u64,
    /// Directory for daily `prompts_YYYY-MM-DD.jsonl` files
    #[serde(default = "default_fallback_dir")]
    pub fallback_dir: PathBuf,
    /// Identity recorded in the `user` field
    #[serde(default = "default_user")]
    pub user: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            mongo_enabled: true,
            mongo_uri: default_mongo_uri(),
            database: default_database(),
            collection: default_collection(),
            server_selection_timeout_secs: default_server_selection_timeout_secs(),
            write_timeout_secs: default_write_timeout_secs(),
            retry_primary_secs: default_retry_primary_secs(),
            fallback_dir: default_fallback_dir(),
            user: default_user(),
        }
    }
}

fn default_mongo_uri() -> String {
    "mongodb://localhost:27017".to_string()
}

fn default_database() -> String {
    "windsurf_prompts".to_string()
}

fn default_collection() -> String {
    "prompts".to_string()
}

fn default_server_selection_timeout_secs() -> u64 {
    3
}

fn default_write_timeout_secs() -> u64 {
    5
}

fn default_retry_primary_secs() -> u64 {
    30
}

fn default_fallback_dir() -> PathBuf {
    default_data_dir().join("logs")
}

fn default_user() -> String {
    std::env::var("USER")
        .or_else(|_| std::env::var("USERNAME"))
        .unwrap_or_else(|_| "unknown".to_string())
}

/// Queue sizes and shutdown behaviour
#[derive(Debug, Clone, Deserialize)]
pub struct PipelineConfig {
    /// Capacity of each per-connection event queue
    #[serde(default = "default_connection_queue")]
    pub connection_queue: usize,
    /// Capacity of the shared persistence queue
    #[serde(default = "default_persist_queue")]
    pub persist_queue: usize,
    /// Time allowed for in-flight work to drain on shutdown
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            connection_queue: default_connection_queue(),
            persist_queue: default_persist_queue(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

fn default_connection_queue() -> usize {
    256
}

fn default_persist_queue() -> usize {
    1024
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

/// Status endpoint configuration
#[derive(Debug, Clone, Deserialize)]
pub struct StatusConfig {
    /// Serve `/health` and `/stats`
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Address to listen on
    #[serde(default = "default_status_listen_addr")]
    pub listen_addr: String,
}

impl Default for StatusConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            listen_addr: default_status_listen_addr(),
        }
    }
}

fn default_status_listen_addr() -> String {
    "127.0.0.1:8099".to_string()
}
