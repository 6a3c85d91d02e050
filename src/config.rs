use crate::backend::BackendKind;
use std::collections::HashSet;
use std::fmt;
use std::time::Duration;

/// Configuration for the sync engine
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Ordered server descriptors (lower priority value = preferred)
    pub servers: Vec<ServerConfig>,
    /// Health monitoring settings
    pub health: HealthConfig,
    /// Offline replay settings
    pub replay: ReplayConfig,
    /// Connection settings for backends that dial out
    pub connection: ConnectionConfig,
    /// Timeout for a single mutation round-trip
    pub mutation_timeout: Duration,
    /// Capacity of the broadcast channels carrying engine events
    pub event_buffer: usize,
}

impl EngineConfig {
    /// Create a new builder for configuration
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::default()
    }
}

/// Builder for EngineConfig
#[derive(Debug, Clone)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self {
            config: EngineConfig {
                servers: Vec::new(),
                health: HealthConfig::default(),
                replay: ReplayConfig::default(),
                connection: ConnectionConfig::default(),
                mutation_timeout: Duration::from_secs(10),
                event_buffer: 256,
            },
        }
    }
}

impl EngineConfigBuilder {
    /// Add a server descriptor
    pub fn server(mut self, server: ServerConfig) -> Self {
        self.config.servers.push(server);
        self
    }

    /// Replace the full descriptor list
    pub fn servers(mut self, servers: Vec<ServerConfig>) -> Self {
        self.config.servers = servers;
        self
    }

    /// Set health monitoring configuration
    pub fn health(mut self, config: HealthConfig) -> Self {
        self.config.health = config;
        self
    }

    /// Set offline replay configuration
    pub fn replay(mut self, config: ReplayConfig) -> Self {
        self.config.replay = config;
        self
    }

    /// Set connection configuration
    pub fn connection(mut self, config: ConnectionConfig) -> Self {
        self.config.connection = config;
        self
    }

    /// Set the per-mutation timeout
    pub fn mutation_timeout(mut self, timeout: Duration) -> Self {
        self.config.mutation_timeout = timeout;
        self
    }

    /// Set the event channel capacity
    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.config.event_buffer = capacity;
        self
    }

    /// Build the configuration with validation.
    ///
    /// Returns an error for invalid configurations (e.g. no servers,
    /// duplicate server ids, zero intervals).
    pub fn build(self) -> Result<EngineConfig, ConfigError> {
        // Validate server list
        if self.config.servers.is_empty() {
            return Err(ConfigError::NoServers);
        }

        let mut ids = HashSet::new();
        for server in &self.config.servers {
            if !ids.insert(server.id.as_str()) {
                return Err(ConfigError::DuplicateServerId(server.id.clone()));
            }
        }

        // Validate health config
        if self.config.health.interval.is_zero() || self.config.health.probe_timeout.is_zero() {
            return Err(ConfigError::InvalidHealth(
                "interval and probe_timeout must be nonzero".to_string(),
            ));
        }

        if self.config.health.probe_timeout > self.config.health.interval {
            return Err(ConfigError::InvalidHealth(
                "probe_timeout should be <= interval".to_string(),
            ));
        }

        if self.config.health.offline_after_rounds == 0 {
            return Err(ConfigError::InvalidHealth(
                "offline_after_rounds cannot be 0".to_string(),
            ));
        }

        // Validate replay config
        if self.config.replay.max_attempts == 0 {
            return Err(ConfigError::InvalidReplay(
                "max_attempts cannot be 0".to_string(),
            ));
        }

        // Validate backoff configs
        for backoff in [&self.config.replay.backoff, &self.config.connection.backoff] {
            if backoff.max_delay < backoff.initial_delay {
                return Err(ConfigError::InvalidBackoff(
                    "max_delay must be >= initial_delay".to_string(),
                ));
            }

            if backoff.multiplier <= 0.0 {
                return Err(ConfigError::InvalidBackoff(
                    "multiplier must be > 0".to_string(),
                ));
            }
        }

        if self.config.mutation_timeout.is_zero() {
            return Err(ConfigError::InvalidTimeout(
                "mutation_timeout cannot be 0".to_string(),
            ));
        }

        if self.config.event_buffer == 0 {
            return Err(ConfigError::InvalidEventBuffer(
                "event_buffer cannot be 0".to_string(),
            ));
        }

        Ok(self.config)
    }
}

/// Configuration validation errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ConfigError {
    /// No server descriptors were provided
    #[error("at least one server descriptor is required")]
    NoServers,
    /// Two descriptors share an id
    #[error("duplicate server id: {0}")]
    DuplicateServerId(String),
    /// Invalid health configuration
    #[error("Invalid health configuration: {0}")]
    InvalidHealth(String),
    /// Invalid replay configuration
    #[error("Invalid replay configuration: {0}")]
    InvalidReplay(String),
    /// Invalid backoff configuration
    #[error("Invalid backoff configuration: {0}")]
    InvalidBackoff(String),
    /// Invalid timeout configuration
    #[error("Invalid timeout configuration: {0}")]
    InvalidTimeout(String),
    /// Invalid event buffer configuration
    #[error("Invalid event buffer configuration: {0}")]
    InvalidEventBuffer(String),
    /// The backend list does not line up with the descriptor list
    #[error("backend count mismatch: {provided} backends for {expected} servers")]
    BackendMismatch {
        /// Number of configured servers
        expected: usize,
        /// Number of backends provided
        provided: usize,
    },
}

/// A single server descriptor.
///
/// Descriptors are ordered by `priority`: the lowest value is the preferred
/// primary, higher values are backups in failover order.
#[derive(Clone)]
pub struct ServerConfig {
    /// Unique identifier for this server
    pub id: String,
    /// Endpoint URL (e.g. wss://sync.example.com/socket)
    pub endpoint: String,
    /// Optional bearer credential presented on connect
    pub credential: Option<String>,
    /// Failover priority (lower value = preferred)
    pub priority: u32,
    /// Which backend implementation serves this descriptor
    pub kind: BackendKind,
}

impl ServerConfig {
    /// Create a descriptor with no credential, served by the gateway transport
    pub fn new(id: impl Into<String>, endpoint: impl Into<String>, priority: u32) -> Self {
        Self {
            id: id.into(),
            endpoint: endpoint.into(),
            credential: None,
            priority,
            kind: BackendKind::Gateway,
        }
    }

    /// Attach a credential
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// Override the backend kind
    pub fn with_kind(mut self, kind: BackendKind) -> Self {
        self.kind = kind;
        self
    }
}

// Credentials must never reach logs or debug output.
impl fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerConfig")
            .field("id", &self.id)
            .field("endpoint", &self.endpoint)
            .field("credential", &self.credential.as_ref().map(|_| "***"))
            .field("priority", &self.priority)
            .field("kind", &self.kind)
            .finish()
    }
}

/// Health monitoring configuration
#[derive(Debug, Clone)]
pub struct HealthConfig {
    /// Interval between probe rounds
    pub interval: Duration,
    /// Timeout for a single server probe
    pub probe_timeout: Duration,
    /// Consecutive all-failed probe rounds before reporting offline
    /// while the platform hint still says the network is up
    pub offline_after_rounds: u32,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(5),
            probe_timeout: Duration::from_secs(2),
            offline_after_rounds: 2,
        }
    }
}

/// Offline replay configuration
#[derive(Debug, Clone)]
pub struct ReplayConfig {
    /// Total delivery attempts per queued operation before dropping it
    pub max_attempts: u32,
    /// Backoff between retries of a rejected operation
    pub backoff: BackoffConfig,
}

impl Default for ReplayConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff: BackoffConfig {
                initial_delay: Duration::from_millis(500),
                max_delay: Duration::from_secs(5),
                multiplier: 2.0,
                jitter: true,
            },
        }
    }
}

/// Connection configuration for backends that dial out
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// Timeout for establishing a connection
    pub connect_timeout: Duration,
    /// Maximum reconnection attempts before a backend gives up
    pub max_reconnect_attempts: u32,
    /// Backoff settings for reconnection
    pub backoff: BackoffConfig,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            max_reconnect_attempts: 10,
            backoff: BackoffConfig::default(),
        }
    }
}

/// Backoff configuration for retries and reconnection
#[derive(Debug, Clone)]
pub struct BackoffConfig {
    /// Initial delay before the first retry
    pub initial_delay: Duration,
    /// Maximum delay between retries
    pub max_delay: Duration,
    /// Multiplier for exponential backoff (typically 2.0)
    pub multiplier: f64,
    /// Whether to add random jitter to delays
    pub jitter: bool,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            multiplier: 2.0,
            jitter: true,
        }
    }
}

impl BackoffConfig {
    /// Calculate the delay for a given attempt number (0-indexed)
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let base_delay = self.initial_delay.as_millis() as f64
            * self.multiplier.powi(attempt as i32);
        let capped_delay = base_delay.min(self.max_delay.as_millis() as f64);

        if self.jitter {
            // Full jitter: random value between 0 and capped_delay
            let jittered = rand::random::<f64>() * capped_delay;
            Duration::from_millis(jittered as u64)
        } else {
            Duration::from_millis(capped_delay as u64)
        }
    }
}
