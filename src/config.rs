use serde::Deserialize;
use std::collections::HashMap;
use std::net::IpAddr;
use std::path::Path;
use std::time::Duration;

/// Global configuration for the gateway
#[derive(Debug, Deserialize, Clone, Default)]
pub struct Config {
    /// Listener and proxy configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Where application configuration files are discovered
    #[serde(default)]
    pub discovery: DiscoveryConfig,

    /// Range that backend ports are allocated from
    #[serde(default)]
    pub ports: PortRangeConfig,

    /// How backends are launched
    #[serde(default)]
    pub supervisor: SupervisorConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct ServerConfig {
    /// Bind address (default: 127.0.0.1)
    #[serde(default = "default_bind_address")]
    pub bind: String,

    /// Gateway port (default: 3000)
    #[serde(default = "default_listen_port")]
    pub port: u16,

    /// Serve /health and /health/{name} to clients (default: false)
    #[serde(default)]
    pub expose_health_checks: bool,

    /// Where requests for unavailable backends are redirected
    #[serde(default = "default_error_path")]
    pub error_path: String,

    /// Bearer token required by /register-app when set
    pub registration_token: Option<String>,

    /// Upstream request timeout in seconds (default: 30)
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,

    /// Maximum idle connections per backend (default: 10)
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,

    /// Idle connection timeout in seconds (default: 90)
    #[serde(default = "default_pool_idle_timeout")]
    pub pool_idle_timeout_secs: u64,

    /// How long a process status is reused, in milliseconds; 0 disables
    #[serde(default = "default_status_cache_ttl")]
    pub status_cache_ttl_ms: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind: default_bind_address(),
            port: default_listen_port(),
            expose_health_checks: false,
            error_path: default_error_path(),
            registration_token: None,
            request_timeout_secs: default_request_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout(),
            status_cache_ttl_ms: default_status_cache_ttl(),
        }
    }
}

impl ServerConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn status_cache_ttl(&self) -> Duration {
        Duration::from_millis(self.status_cache_ttl_ms)
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct DiscoveryConfig {
    /// Directory scanned recursively for application configs
    #[serde(default = "default_root_dir")]
    pub root_dir: String,

    /// File name recognized as an application config
    #[serde(default = "default_config_file")]
    pub config_file: String,

    /// Scope used in composite names
    #[serde(default = "default_scope")]
    pub scope: String,
}

impl Default for DiscoveryConfig {
    fn default() -> Self {
        Self {
            root_dir: default_root_dir(),
            config_file: default_config_file(),
            scope: default_scope(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PortRangeConfig {
    /// Address probed when checking whether a port is free
    #[serde(default = "default_port_host")]
    pub host: IpAddr,

    #[serde(default = "default_port_start")]
    pub start: u16,

    #[serde(default = "default_port_end")]
    pub end: u16,
}

impl Default for PortRangeConfig {
    fn default() -> Self {
        Self {
            host: default_port_host(),
            start: default_port_start(),
            end: default_port_end(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct SupervisorConfig {
    /// Program that runs each script, e.g. "node"; scripts run directly when unset
    pub interpreter: Option<String>,

    /// Environment variable carrying the assigned port
    #[serde(default = "default_port_env")]
    pub port_env: String,

    /// Seconds between SIGTERM and SIGKILL (default: 10)
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,

    /// Extra environment for every backend
    #[serde(default)]
    pub env: HashMap<String, String>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            interpreter: None,
            port_env: default_port_env(),
            shutdown_grace_period_secs: default_shutdown_grace_period(),
            env: HashMap::new(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1".to_string()
}

fn default_listen_port() -> u16 {
    3000
}

fn default_error_path() -> String {
    "/error".to_string()
}

fn default_request_timeout() -> u64 {
    30
}

fn default_pool_max_idle_per_host() -> usize {
    10
}

fn default_pool_idle_timeout() -> u64 {
    90
}

fn default_status_cache_ttl() -> u64 {
    250
}

fn default_root_dir() -> String {
    "./assets".to_string()
}

fn default_config_file() -> String {
    crate::discovery::DEFAULT_CONFIG_FILE.to_string()
}

fn default_scope() -> String {
    "ck".to_string()
}

fn default_port_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_port_start() -> u16 {
    7000
}

fn default_port_end() -> u16 {
    7100
}

fn default_port_env() -> String {
    "PORT".to_string()
}

fn default_shutdown_grace_period() -> u64 {
    10
}

impl Config {
    pub fn load<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let content = std::fs::read_to_string(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Load `path` if it exists, otherwise start from defaults
    pub fn load_or_default<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        if path.as_ref().exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }

    /// Apply overrides from the process environment
    pub fn apply_env_overrides(&mut self) -> anyhow::Result<()> {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    pub fn apply_overrides<F>(&mut self, lookup: F) -> anyhow::Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(value) = lookup("EXPOSE_HEALTHCHECK") {
            self.server.expose_health_checks =
                matches!(value.trim().to_ascii_lowercase().as_str(), "true" | "1" | "yes");
        }
        if let Some(value) = lookup("APPGATE_PORT_RANGE_START") {
            self.ports.start = value
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("APPGATE_PORT_RANGE_START={}: {}", value, e))?;
        }
        if let Some(value) = lookup("APPGATE_PORT_RANGE_END") {
            self.ports.end = value
                .trim()
                .parse()
                .map_err(|e| anyhow::anyhow!("APPGATE_PORT_RANGE_END={}: {}", value, e))?;
        }
        if let Some(value) = lookup("APPGATE_APPS_DIR") {
            self.discovery.root_dir = value;
        }
        self.validate()
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        let mut errors = Vec::new();

        if self.ports.start > self.ports.end {
            errors.push(format!(
                "ports: start ({}) must not exceed end ({})",
                self.ports.start, self.ports.end
            ));
        }

        if self.supervisor.port_env.trim().is_empty() {
            errors.push("supervisor: 'port_env' must not be empty".to_string());
        }

        if !self.server.error_path.starts_with('/') {
            errors.push(format!(
                "server: 'error_path' must start with '/', got '{}'",
                self.server.error_path
            ));
        }

        if self.discovery.config_file.trim().is_empty() {
            errors.push("discovery: 'config_file' must not be empty".to_string());
        }

        if !errors.is_empty() {
            anyhow::bail!("Configuration errors:\n  - {}", errors.join("\n  - "));
        }

        Ok(())
    }
}
