//! Reservas Configuration
//!
//! Configuration structures for a coordinator node. Values come from a TOML
//! file and can be overridden from the environment, which is how the
//! services are usually deployed (`NODE_ID`, `SELF_URL`, `NODES`, ...).

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

use crate::cluster::NodeSpec;
use crate::error::{Error, Result};

/// Main coordinator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CoordinatorConfig {
    /// Node-specific configuration
    pub node: NodeConfig,

    /// Cluster membership and election timing
    #[serde(default)]
    pub cluster: ClusterConfig,

    /// Critical-section lock settings
    #[serde(default)]
    pub lock: LockConfig,

    /// External collaborator endpoints
    #[serde(default)]
    pub services: ServicesConfig,

    /// API configuration
    #[serde(default)]
    pub api: ApiConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Node-specific configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Numeric identifier, also the election rank (higher wins)
    pub id: u64,

    /// URL peers use to reach this node
    pub url: String,

    /// Address the HTTP server binds to
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

/// Cluster configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClusterConfig {
    /// Fixed membership as `id|url` entries (may include this node)
    #[serde(default)]
    pub peers: Vec<String>,

    /// Leader polling interval in milliseconds
    #[serde(default = "default_heartbeat_interval_ms")]
    pub heartbeat_interval_ms: u64,

    /// Timeout for a single heartbeat probe in milliseconds
    #[serde(default = "default_heartbeat_timeout_ms")]
    pub heartbeat_timeout_ms: u64,

    /// Timeout for election, coordinator and forwarded calls in milliseconds
    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    /// How long an election waits for a higher node to announce itself
    #[serde(default = "default_election_timeout_ms")]
    pub election_timeout_ms: u64,

    /// Rounds an election retries before giving up
    #[serde(default = "default_max_election_attempts")]
    pub max_election_attempts: u32,

    /// Run an election as soon as the node starts
    #[serde(default = "default_true")]
    pub elect_on_start: bool,
}

/// Lock configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LockConfig {
    /// Name of the booking critical section
    #[serde(default = "default_lock_resource")]
    pub resource: String,

    /// Maximum wait for a queued acquire in milliseconds (0 = unbounded)
    #[serde(default = "default_acquire_timeout_ms")]
    pub acquire_timeout_ms: u64,

    /// Bookings take the lock when remaining tables are at or below this
    #[serde(default = "default_low_capacity_threshold")]
    pub low_capacity_threshold: u32,
}

/// External collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ServicesConfig {
    /// Customer service base URL
    #[serde(default)]
    pub clientes_url: Option<String>,

    /// Restaurant service base URL
    #[serde(default)]
    pub restaurantes_url: Option<String>,

    /// Replication service base URL (notifications disabled when unset)
    #[serde(default)]
    pub replicacao_url: Option<String>,

    /// Name service used to resolve the URLs above when they are unset
    #[serde(default)]
    pub name_service_url: Option<String>,
}

/// API configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ApiConfig {
    /// Enable permissive CORS
    #[serde(default)]
    pub cors_enabled: bool,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub level: String,
}

// Default value functions
fn default_bind_address() -> String {
    "0.0.0.0:3001".to_string()
}

fn default_heartbeat_interval_ms() -> u64 {
    5000
}

fn default_heartbeat_timeout_ms() -> u64 {
    2000
}

fn default_request_timeout_ms() -> u64 {
    5000
}

fn default_election_timeout_ms() -> u64 {
    3000
}

fn default_max_election_attempts() -> u32 {
    3
}

fn default_true() -> bool {
    true
}

fn default_lock_resource() -> String {
    "reserva".to_string()
}

fn default_acquire_timeout_ms() -> u64 {
    10_000
}

fn default_low_capacity_threshold() -> u32 {
    3
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ClusterConfig {
    fn default() -> Self {
        Self {
            peers: Vec::new(),
            heartbeat_interval_ms: default_heartbeat_interval_ms(),
            heartbeat_timeout_ms: default_heartbeat_timeout_ms(),
            request_timeout_ms: default_request_timeout_ms(),
            election_timeout_ms: default_election_timeout_ms(),
            max_election_attempts: default_max_election_attempts(),
            elect_on_start: true,
        }
    }
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            resource: default_lock_resource(),
            acquire_timeout_ms: default_acquire_timeout_ms(),
            low_capacity_threshold: default_low_capacity_threshold(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl CoordinatorConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &std::path::Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_str(&content)
    }

    /// Load configuration from a TOML string
    pub fn from_str(content: &str) -> Result<Self> {
        let config: CoordinatorConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from the process environment alone
    pub fn from_env() -> Result<Self> {
        Self::from_overrides(std::env::vars())
    }

    /// Build a configuration from defaults plus `KEY=value` overrides.
    /// `NODE_ID` and `SELF_URL` are required.
    pub fn from_overrides<I, K, V>(vars: I) -> Result<Self>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        let mut config = CoordinatorConfig {
            node: NodeConfig {
                id: 0,
                url: String::new(),
                bind_address: default_bind_address(),
            },
            cluster: ClusterConfig::default(),
            lock: LockConfig::default(),
            services: ServicesConfig::default(),
            api: ApiConfig::default(),
            logging: LoggingConfig::default(),
        };
        let vars: Vec<(K, V)> = vars.into_iter().collect();
        if !vars.iter().any(|(key, _)| key.as_ref() == "NODE_ID") {
            return Err(Error::Config("NODE_ID is required".into()));
        }
        config.apply_overrides(vars)?;
        Ok(config)
    }

    /// Apply overrides from the process environment, then re-validate
    pub fn apply_env(&mut self) -> Result<()> {
        self.apply_overrides(std::env::vars())
    }

    /// Apply `KEY=value` overrides using the environment variable names
    pub fn apply_overrides<I, K, V>(&mut self, vars: I) -> Result<()>
    where
        I: IntoIterator<Item = (K, V)>,
        K: AsRef<str>,
        V: Into<String>,
    {
        for (key, value) in vars {
            let value: String = value.into();
            match key.as_ref() {
                "NODE_ID" => {
                    self.node.id = value.trim().parse().map_err(|_| {
                        Error::Config(format!("NODE_ID must be numeric, got '{}'", value))
                    })?;
                }
                "SELF_URL" => self.node.url = value,
                "BIND_ADDRESS" => self.node.bind_address = value,
                "NODES" => {
                    self.cluster.peers = value
                        .split(',')
                        .map(str::trim)
                        .filter(|s| !s.is_empty())
                        .map(str::to_string)
                        .collect();
                }
                "POLL_INTERVAL_MS" => {
                    self.cluster.heartbeat_interval_ms = value.trim().parse().map_err(|_| {
                        Error::Config(format!("POLL_INTERVAL_MS must be numeric, got '{}'", value))
                    })?;
                }
                "CLIENTES_URL" => self.services.clientes_url = Some(value),
                "RESTAURANTES_URL" => self.services.restaurantes_url = Some(value),
                "REPLICACAO_URL" => self.services.replicacao_url = Some(value),
                "NAME_SERVICE_URL" => self.services.name_service_url = Some(value),
                _ => {}
            }
        }
        self.validate()
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        if self.node.url.is_empty() {
            return Err(Error::Config("node.url cannot be empty".into()));
        }

        if self.node.bind_address.is_empty() {
            return Err(Error::Config("node.bind_address cannot be empty".into()));
        }

        if self.cluster.heartbeat_interval_ms == 0 {
            return Err(Error::Config("cluster.heartbeat_interval_ms must be positive".into()));
        }

        if self.lock.resource.is_empty() {
            return Err(Error::Config("lock.resource cannot be empty".into()));
        }

        let mut seen = HashSet::new();
        for peer in self.peer_specs()? {
            if !seen.insert(peer.id) {
                return Err(Error::Config(format!("duplicate node id {} in cluster.peers", peer.id)));
            }
            if peer.id == self.node.id && peer.url != self.node.url.trim().trim_end_matches('/') {
                return Err(Error::Config(format!(
                    "cluster.peers lists node {} at {} but node.url is {}",
                    peer.id, peer.url, self.node.url
                )));
            }
        }

        Ok(())
    }

    /// This node as a cluster member
    pub fn self_spec(&self) -> NodeSpec {
        NodeSpec::new(self.node.id, self.node.url.trim().trim_end_matches('/'))
    }

    /// Parse every configured peer entry
    pub fn peer_specs(&self) -> Result<Vec<NodeSpec>> {
        self.cluster.peers.iter().map(|p| p.parse()).collect()
    }

    /// Get heartbeat interval as Duration
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_interval_ms)
    }

    /// Get heartbeat probe timeout as Duration
    pub fn heartbeat_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.heartbeat_timeout_ms)
    }

    /// Get peer request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.request_timeout_ms)
    }

    /// Get election wait as Duration
    pub fn election_timeout(&self) -> Duration {
        Duration::from_millis(self.cluster.election_timeout_ms)
    }

    /// Get lock acquire timeout (None = wait forever)
    pub fn acquire_timeout(&self) -> Option<Duration> {
        match self.lock.acquire_timeout_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    /// Sample configuration written by `reservas init`
    pub fn sample(node_id: u64) -> String {
        format!(
            r#"[node]
id = {id}
url = "http://127.0.0.1:{port}"
bind_address = "0.0.0.0:{port}"

[cluster]
peers = ["1|http://127.0.0.1:3001", "2|http://127.0.0.1:3002", "3|http://127.0.0.1:3003"]
heartbeat_interval_ms = 5000
heartbeat_timeout_ms = 2000
request_timeout_ms = 5000
election_timeout_ms = 3000

[lock]
resource = "reserva"
acquire_timeout_ms = 10000
low_capacity_threshold = 3

[services]
clientes_url = "http://127.0.0.1:3100"
restaurantes_url = "http://127.0.0.1:3200"
# replicacao_url = "http://127.0.0.1:3300"
# name_service_url = "http://127.0.0.1:4000"

[logging]
level = "info"
"#,
            id = node_id,
            port = 3000 + node_id,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = r#"
[node]
id = 2
url = "http://node-2:3001"

[cluster]
peers = ["1|http://node-1:3001", "2|http://node-2:3001", "3|http://node-3:3001"]
heartbeat_interval_ms = 1000

[lock]
low_capacity_threshold = 5
"#;

    #[test]
    fn test_parse_config() {
        let config = CoordinatorConfig::from_str(BASE).unwrap();
        assert_eq!(config.node.id, 2);
        assert_eq!(config.peer_specs().unwrap().len(), 3);
        assert_eq!(config.heartbeat_interval(), Duration::from_secs(1));
        assert_eq!(config.heartbeat_timeout(), Duration::from_secs(2));
        assert_eq!(config.lock.resource, "reserva");
        assert_eq!(config.lock.low_capacity_threshold, 5);
        assert_eq!(config.acquire_timeout(), Some(Duration::from_secs(10)));
    }

    #[test]
    fn test_duplicate_ids_rejected() {
        let toml = BASE.replace("3|http://node-3:3001", "1|http://node-9:3001");
        assert!(matches!(CoordinatorConfig::from_str(&toml), Err(Error::Config(_))));
    }

    #[test]
    fn test_self_url_mismatch_rejected() {
        let toml = BASE.replace("2|http://node-2:3001", "2|http://elsewhere:3001");
        assert!(CoordinatorConfig::from_str(&toml).is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = CoordinatorConfig::from_str(BASE).unwrap();
        config
            .apply_overrides([
                ("NODE_ID", "7"),
                ("SELF_URL", "http://node-7:3001"),
                ("NODES", "5|http://node-5:3001, 7|http://node-7:3001"),
                ("POLL_INTERVAL_MS", "250"),
                ("CLIENTES_URL", "http://clientes:3000"),
                ("UNRELATED", "ignored"),
            ])
            .unwrap();

        assert_eq!(config.node.id, 7);
        assert_eq!(config.peer_specs().unwrap().len(), 2);
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(250));
        assert_eq!(config.services.clientes_url.as_deref(), Some("http://clientes:3000"));
    }

    #[test]
    fn test_config_from_environment_only() {
        let config = CoordinatorConfig::from_overrides([
            ("NODE_ID", "1"),
            ("SELF_URL", "http://node-1:3001"),
            ("NODES", "1|http://node-1:3001,2|http://node-2:3001"),
        ])
        .unwrap();
        assert_eq!(config.node.id, 1);
        assert_eq!(config.node.bind_address, "0.0.0.0:3001");
        assert_eq!(config.lock.low_capacity_threshold, 3);

        // SELF_URL is required
        let missing: [(&str, &str); 1] = [("NODE_ID", "1")];
        assert!(CoordinatorConfig::from_overrides(missing).is_err());

        // NODE_ID is required
        let missing_id = CoordinatorConfig::from_overrides([
            ("SELF_URL", "http://node-1:3001"),
            ("NODES", "1|http://node-1:3001,2|http://node-2:3001"),
        ]);
        assert!(matches!(missing_id, Err(Error::Config(msg)) if msg.contains("NODE_ID")));
    }

    #[test]
    fn test_trailing_slash_on_self_url_accepted() {
        let config = CoordinatorConfig::from_overrides([
            ("NODE_ID", "1"),
            ("SELF_URL", "http://n1:3001/"),
            ("NODES", "1|http://n1:3001/,2|http://n2:3001"),
        ])
        .unwrap();
        assert_eq!(config.self_spec().url, "http://n1:3001");
    }

    #[test]
    fn test_bad_node_id_override() {
        let mut config = CoordinatorConfig::from_str(BASE).unwrap();
        assert!(config.apply_overrides([("NODE_ID", "abc")]).is_err());
    }

    #[test]
    fn test_from_file_and_sample() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("reservas.toml");
        std::fs::write(&path, CoordinatorConfig::sample(3)).unwrap();

        let config = CoordinatorConfig::from_file(&path).unwrap();
        assert_eq!(config.node.id, 3);
        assert_eq!(config.node.url, "http://127.0.0.1:3003");
        assert!(config.cluster.elect_on_start);
    }
}
