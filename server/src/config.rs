use std::time::Duration;

use clap::Parser;
use figment::{
    providers::{Env, Format, Serialized, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

/// Bazaar real-time message relay
#[derive(Parser, Serialize, Deserialize, Clone, Debug)]
#[command(name = "bazaar-relay", version, about = "Bazaar real-time message relay")]
pub struct Config {
    /// Port to listen on
    #[arg(long, env = "BAZAAR_PORT", default_value = "8080")]
    pub port: u16,

    /// Bind address
    #[arg(long, env = "BAZAAR_BIND_ADDRESS", default_value = "0.0.0.0")]
    pub bind_address: String,

    /// Path to TOML config file
    #[arg(long, default_value = "./bazaar.toml")]
    pub config: String,

    /// Enable structured JSON logging (for Docker/production)
    #[arg(long, env = "BAZAAR_JSON_LOGS")]
    pub json_logs: bool,

    /// Output a commented TOML config template and exit
    #[arg(long)]
    pub generate_config: bool,

    /// Data directory for persistent state (DB, keys)
    #[arg(long, env = "BAZAAR_DATA_DIR", default_value = "./data")]
    pub data_dir: String,

    /// Shared JWT secret used by the account service. Generated into data_dir when unset.
    #[arg(long, env = "BAZAAR_JWT_SECRET")]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub jwt_secret: Option<String>,

    /// Relay tuning (loaded from [relay] section in TOML)
    #[arg(skip)]
    #[serde(default, skip_serializing)]
    pub relay: RelayConfig,
}

/// Per-connection queue, frame and deadline settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Outbound queue capacity per connection (default: 256)
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Largest inbound frame accepted, in bytes (default: 512)
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Deadline for a single write, in seconds (default: 10)
    #[serde(default = "default_write_wait")]
    pub write_wait_secs: u64,

    /// How long to wait for a pong before dropping the peer, in seconds (default: 60)
    #[serde(default = "default_pong_wait")]
    pub pong_wait_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 256,
            max_message_size: 512,
            write_wait_secs: 10,
            pong_wait_secs: 60,
        }
    }
}

fn default_queue_capacity() -> usize {
    256
}

fn default_max_message_size() -> usize {
    512
}

fn default_write_wait() -> u64 {
    10
}

fn default_pong_wait() -> u64 {
    60
}

impl RelayConfig {
    /// Zero deadlines would make every connection time out or spin, so refuse them at startup.
    pub fn validate(&self) -> Result<(), String> {
        if self.pong_wait_secs == 0 {
            return Err("relay.pong_wait_secs must be greater than zero".to_string());
        }
        if self.write_wait_secs == 0 {
            return Err("relay.write_wait_secs must be greater than zero".to_string());
        }
        Ok(())
    }
}

/// Smallest deadline a [`PumpSettings`] will carry.
const MIN_DEADLINE: Duration = Duration::from_millis(10);

/// Runtime form of [`RelayConfig`] consumed by the connection pumps.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PumpSettings {
    pub queue_capacity: usize,
    pub max_message_size: usize,
    pub write_wait: Duration,
    pub pong_wait: Duration,
    /// Must be shorter than pong_wait so the peer has time to answer.
    pub ping_period: Duration,
}

impl PumpSettings {
    /// Derive the ping period as 9/10 of the pong wait.
    /// Capacity and deadlines are clamped so the pumps never see zero.
    pub fn new(
        queue_capacity: usize,
        max_message_size: usize,
        write_wait: Duration,
        pong_wait: Duration,
    ) -> Self {
        let write_wait = write_wait.max(MIN_DEADLINE);
        let pong_wait = pong_wait.max(MIN_DEADLINE);
        Self {
            queue_capacity: queue_capacity.max(1),
            max_message_size,
            write_wait,
            pong_wait,
            ping_period: pong_wait * 9 / 10,
        }
    }
}

impl From<&RelayConfig> for PumpSettings {
    fn from(cfg: &RelayConfig) -> Self {
        Self::new(
            cfg.queue_capacity,
            cfg.max_message_size,
            Duration::from_secs(cfg.write_wait_secs),
            Duration::from_secs(cfg.pong_wait_secs),
        )
    }
}

impl Default for PumpSettings {
    fn default() -> Self {
        Self::from(&RelayConfig::default())
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            bind_address: "0.0.0.0".to_string(),
            config: "./bazaar.toml".to_string(),
            json_logs: false,
            generate_config: false,
            data_dir: "./data".to_string(),
            jwt_secret: None,
            relay: RelayConfig::default(),
        }
    }
}

impl Config {
    /// Load config with layered precedence:
    /// built-in defaults < TOML file < env vars (BAZAAR_*) < CLI args
    pub fn load() -> Result<Self, figment::Error> {
        let cli = Config::parse();
        Self::from_figment(Self::figment(cli))
    }

    fn from_figment(figment: Figment) -> Result<Self, figment::Error> {
        let config: Config = figment.extract()?;
        config.relay.validate().map_err(figment::Error::from)?;
        Ok(config)
    }

    fn figment(cli: Config) -> Figment {
        let config_path = cli.config.clone();

        Figment::new()
            .merge(Serialized::defaults(Config::default()))
            .merge(Toml::file(&config_path))
            .merge(Env::prefixed("BAZAAR_").split("__"))
            .merge(Serialized::defaults(cli))
    }
}

/// Generate a commented TOML config template
pub fn generate_config_template() -> String {
    r#"# Bazaar Relay Configuration
# Place this file at ./bazaar.toml or specify with --config <path>
# All settings can be overridden via environment variables (BAZAAR_PORT, etc.)
# or CLI flags (--port, etc.)

# Server port (default: 8080)
# port = 8080

# Bind address (default: 0.0.0.0, all interfaces)
# bind_address = "0.0.0.0"

# Enable structured JSON logging for Docker/production
# json_logs = false

# Data directory for the SQLite database and generated JWT signing key
# data_dir = "./data"

# Shared secret used to verify session tokens issued by the account service.
# Leave unset to generate a random key into data_dir/jwt_secret.
# jwt_secret = ""

# ---- Relay ----
# [relay]

# Outbound frames buffered per connection before the connection is evicted
# queue_capacity = 256

# Largest inbound frame in bytes; larger frames close the connection
# max_message_size = 512

# Seconds allowed for a single websocket write
# write_wait_secs = 10

# Seconds without a pong before a peer is considered gone.
# Pings are sent every 9/10 of this interval.
# pong_wait_secs = 60
"#
    .to_string()
}
