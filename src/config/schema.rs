use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub server: ServerConfig,
    pub topology: TopologyConfig,
    #[serde(default)]
    pub users: Vec<UserConfig>,
    #[serde(default)]
    pub prepare: PrepareConfig,
    #[serde(default)]
    pub pool: PoolConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    pub listen_addr: String,
    #[serde(default = "default_listen_port")]
    pub listen_port: u16,
}

fn default_listen_port() -> u16 {
    3307
}

#[derive(Debug, Clone, Deserialize)]
pub struct BackendConfig {
    pub host: String,
    pub port: u16,
}

impl BackendConfig {
    pub fn addr(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Primary/replica layout used for read/write splitting
#[derive(Debug, Clone, Deserialize)]
pub struct TopologyConfig {
    pub primary: BackendConfig,
    #[serde(default)]
    pub replicas: Vec<BackendConfig>,
    /// Route reads outside transactions to replicas
    #[serde(default = "default_rw_split")]
    pub rw_split: bool,
}

fn default_rw_split() -> bool {
    true
}

/// A proxy account. Clients authenticate against these, and the same
/// credentials are replayed on backend handshakes.
#[derive(Debug, Clone, Deserialize)]
pub struct UserConfig {
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub require: RequireConfig,
}

/// Connection requirements enforced for a user when
/// `prepare.router_require_enforce` is on
#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequireConfig {
    #[serde(default)]
    pub ssl: bool,
    #[serde(default)]
    pub x509: bool,
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub subject: Option<String>,
}

/// Knobs for lazy backend preparation
#[derive(Debug, Clone, Deserialize)]
pub struct PrepareConfig {
    /// Wall-clock budget for retrying transient connect errors
    #[serde(default = "default_connect_retry_timeout_ms")]
    pub connect_retry_timeout_ms: u64,
    /// Allow backends to be returned to the shared pool between commands
    #[serde(default)]
    pub connection_sharing: bool,
    /// Enforce per-user connection requirements during preparation
    #[serde(default)]
    pub router_require_enforce: bool,
    /// Before reading from a replica, wait until the client's own writes
    /// are visible there
    #[serde(default)]
    pub wait_for_my_writes: bool,
    /// Server-side timeout for that wait; 0 checks without waiting
    #[serde(default = "default_wait_for_my_writes_timeout_secs")]
    pub wait_for_my_writes_timeout_secs: u64,
}

fn default_connect_retry_timeout_ms() -> u64 {
    7000
}

fn default_wait_for_my_writes_timeout_secs() -> u64 {
    2
}

impl Default for PrepareConfig {
    fn default() -> Self {
        Self {
            connect_retry_timeout_ms: default_connect_retry_timeout_ms(),
            connection_sharing: false,
            router_require_enforce: false,
            wait_for_my_writes: false,
            wait_for_my_writes_timeout_secs: default_wait_for_my_writes_timeout_secs(),
        }
    }
}

/// Backend pool limits
#[derive(Debug, Clone, Deserialize)]
pub struct PoolConfig {
    #[serde(default = "default_max_idle")]
    pub max_idle: usize,
    #[serde(default = "default_max_age_secs")]
    pub max_age_secs: u64,
    #[serde(default = "default_max_idle_time_secs")]
    pub max_idle_time_secs: u64,
}

fn default_max_idle() -> usize {
    16
}

fn default_max_age_secs() -> u64 {
    3600
}

fn default_max_idle_time_secs() -> u64 {
    300
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            max_idle: default_max_idle(),
            max_age_secs: default_max_age_secs(),
            max_idle_time_secs: default_max_idle_time_secs(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            server: ServerConfig {
                listen_addr: "127.0.0.1".to_string(),
                listen_port: 3307,
            },
            topology: TopologyConfig {
                primary: BackendConfig {
                    host: "127.0.0.1".to_string(),
                    port: 3306,
                },
                replicas: Vec::new(),
                rw_split: default_rw_split(),
            },
            users: Vec::new(),
            prepare: PrepareConfig::default(),
            pool: PoolConfig::default(),
        }
    }
}
