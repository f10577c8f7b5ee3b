//! Server configuration parsed from `REPKV_*` environment variables.
//!
//! Every field has a default except `REPKV_SERVER_ID`, so a single-node
//! server starts with nothing but an id. Parse failures name the offending
//! variable.

use std::env;
use std::net::SocketAddr;
use std::str::FromStr;

use thiserror::Error;

use crate::engine::EngineConfig;

/// Configuration errors with the variable name in the message.
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingEnvVar(String),

    #[error("invalid value for {var}: {message}")]
    InvalidValue { var: String, message: String },

    #[error("invalid address for {var}: \"{addr}\" is not host:port")]
    InvalidAddress { var: String, addr: String },

    #[error("server_id must be >= 1 (0 is reserved), got {0}")]
    ReservedServerId(i32),

    #[error("election timeout bounds are inverted: lower {lower} >= upper {upper}")]
    InvertedElectionTimeouts { lower: u64, upper: u64 },
}

/// How `append_log` hands back its result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReturnMethod {
    /// The caller's task awaits the commit before continuing.
    Blocking,
    /// A one-shot callback fires on commit; the caller must not block in it.
    AsyncCallback,
}

impl FromStr for ReturnMethod {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "blocking" => Ok(ReturnMethod::Blocking),
            "async_callback" => Ok(ReturnMethod::AsyncCallback),
            _ => Err(format!(
                "invalid return method: '{s}'. Use 'blocking' or 'async_callback'."
            )),
        }
    }
}

/// Read-routing strategies offered by the client driver.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadAlgorithm {
    RoundRobin,
    Hash,
    RandomToken,
    RandomUniform,
    Fixed,
}

impl FromStr for ReadAlgorithm {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "round_robin" => Ok(ReadAlgorithm::RoundRobin),
            "hash" => Ok(ReadAlgorithm::Hash),
            "random_token" => Ok(ReadAlgorithm::RandomToken),
            "random_uniform" => Ok(ReadAlgorithm::RandomUniform),
            "fixed" => Ok(ReadAlgorithm::Fixed),
            _ => Err(format!(
                "invalid read algorithm: '{s}'. Use 'round_robin', 'hash', \
                 'random_token', 'random_uniform', or 'fixed'."
            )),
        }
    }
}

/// Full configuration for one replica process.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Stable peer identity, >= 1. 0 is reserved.
    pub server_id: i32,

    /// Raft peer-to-peer listener.
    pub raft_addr: String,
    /// Client RPC listener.
    pub client_addr: String,
    /// Cluster-join RPC listener.
    pub join_addr: String,
    /// Client endpoint advertised to drivers; defaults to `client_addr`.
    pub advertise_client_addr: String,

    pub heartbeat_interval_ms: u64,
    pub election_timeout_lower_ms: u64,
    pub election_timeout_upper_ms: u64,
    pub client_req_timeout_ms: u64,
    /// Log entries preserved ahead of the last snapshot.
    pub reserved_log_items: u64,
    /// Committed entries between snapshots; 0 disables snapshotting.
    pub snapshot_distance: u64,
    pub return_method: ReturnMethod,

    /// Completion-queue worker tasks.
    pub dispatch_workers: usize,

    pub engine: EngineConfig,

    /// Join port of an existing peer. When set, this replica starts empty
    /// and asks the seed to add it; when absent, it bootstraps a fresh
    /// single-member cluster.
    pub join_seed: Option<String>,

    /// tracing env-filter expression, e.g. `info` or `replicated_kv=debug`.
    pub log_filter: String,
    pub log_json: bool,
    /// Append logs to this file instead of stderr.
    pub log_file: Option<String>,
}

fn env_required(name: &str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingEnvVar(name.into()))
}

fn env_or(name: &str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn env_parse_or<T: FromStr>(name: &str, default: T) -> Result<T, ConfigError>
where
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Err(_) => Ok(default),
        Ok(raw) => raw.parse().map_err(|e: T::Err| ConfigError::InvalidValue {
            var: name.into(),
            message: e.to_string(),
        }),
    }
}

fn check_addr(var: &str, addr: &str) -> Result<(), ConfigError> {
    addr.parse::<SocketAddr>()
        .map(|_| ())
        .map_err(|_| ConfigError::InvalidAddress {
            var: var.into(),
            addr: addr.into(),
        })
}

impl ServerConfig {
    /// Parse the full configuration from `REPKV_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let server_id: i32 = env_required("REPKV_SERVER_ID")?
            .parse()
            .map_err(|e: std::num::ParseIntError| ConfigError::InvalidValue {
                var: "REPKV_SERVER_ID".into(),
                message: e.to_string(),
            })?;

        let raft_addr = env_or("REPKV_RAFT_ADDR", "127.0.0.1:9000");
        let client_addr = env_or("REPKV_CLIENT_ADDR", "127.0.0.1:9001");
        let join_addr = env_or("REPKV_JOIN_ADDR", "127.0.0.1:9002");
        let advertise_client_addr = env_or("REPKV_ADVERTISE_CLIENT_ADDR", &client_addr);

        let engine = EngineConfig {
            path: env_or("REPKV_ENGINE_PATH", &format!("./repkv-{server_id}-db")),
            cache_size: env_parse_or("REPKV_ENGINE_CACHE_SIZE", 64 * 1024 * 1024)?,
            max_key_size: env_parse_or("REPKV_ENGINE_MAX_KEY_SIZE", 1024)?,
            disk_size: env_parse_or("REPKV_ENGINE_DISK_SIZE", 0)?,
        };

        let return_method = env_or("REPKV_RETURN_METHOD", "blocking")
            .parse()
            .map_err(|e: String| ConfigError::InvalidValue {
                var: "REPKV_RETURN_METHOD".into(),
                message: e,
            })?;

        let config = Self {
            server_id,
            raft_addr,
            client_addr,
            join_addr,
            advertise_client_addr,
            heartbeat_interval_ms: env_parse_or("REPKV_HEARTBEAT_INTERVAL_MS", 100)?,
            election_timeout_lower_ms: env_parse_or("REPKV_ELECTION_TIMEOUT_LOWER_MS", 200)?,
            election_timeout_upper_ms: env_parse_or("REPKV_ELECTION_TIMEOUT_UPPER_MS", 400)?,
            client_req_timeout_ms: env_parse_or("REPKV_CLIENT_REQ_TIMEOUT_MS", 3000)?,
            reserved_log_items: env_parse_or("REPKV_RESERVED_LOG_ITEMS", 1_000_000)?,
            snapshot_distance: env_parse_or("REPKV_SNAPSHOT_DISTANCE", 0)?,
            return_method,
            dispatch_workers: env_parse_or("REPKV_DISPATCH_WORKERS", 4)?,
            engine,
            join_seed: env::var("REPKV_JOIN_SEED").ok().filter(|s| !s.is_empty()),
            log_filter: env_or("REPKV_LOG_FILTER", "info"),
            log_json: env_parse_or("REPKV_LOG_JSON", false)?,
            log_file: env::var("REPKV_LOG_FILE").ok().filter(|s| !s.is_empty()),
        };

        config.validate()?;
        Ok(config)
    }

    /// A configuration with defaults for everything but identity, addresses,
    /// and the engine path. Used by tests and embedding callers.
    pub fn new(
        server_id: i32,
        raft_addr: impl Into<String>,
        client_addr: impl Into<String>,
        join_addr: impl Into<String>,
        engine_path: impl Into<String>,
    ) -> Self {
        let client_addr = client_addr.into();
        Self {
            server_id,
            raft_addr: raft_addr.into(),
            advertise_client_addr: client_addr.clone(),
            client_addr,
            join_addr: join_addr.into(),
            heartbeat_interval_ms: 100,
            election_timeout_lower_ms: 200,
            election_timeout_upper_ms: 400,
            client_req_timeout_ms: 3000,
            reserved_log_items: 1_000_000,
            snapshot_distance: 0,
            return_method: ReturnMethod::Blocking,
            dispatch_workers: 4,
            engine: EngineConfig {
                path: engine_path.into(),
                cache_size: 16 * 1024 * 1024,
                max_key_size: 1024,
                disk_size: 0,
            },
            join_seed: None,
            log_filter: "info".into(),
            log_json: false,
            log_file: None,
        }
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server_id < 1 {
            return Err(ConfigError::ReservedServerId(self.server_id));
        }
        check_addr("REPKV_RAFT_ADDR", &self.raft_addr)?;
        check_addr("REPKV_CLIENT_ADDR", &self.client_addr)?;
        check_addr("REPKV_JOIN_ADDR", &self.join_addr)?;
        if self.election_timeout_lower_ms >= self.election_timeout_upper_ms {
            return Err(ConfigError::InvertedElectionTimeouts {
                lower: self.election_timeout_lower_ms,
                upper: self.election_timeout_upper_ms,
            });
        }
        Ok(())
    }
}

// ── Tests ─────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn clear_repkv_env() {
        for (key, _) in env::vars() {
            if key.starts_with("REPKV_") {
                env::remove_var(key);
            }
        }
    }

    #[test]
    #[serial]
    fn server_id_is_required() {
        clear_repkv_env();
        let err = ServerConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::MissingEnvVar(v) if v == "REPKV_SERVER_ID"));
    }

    #[test]
    #[serial]
    fn defaults_fill_in() {
        clear_repkv_env();
        env::set_var("REPKV_SERVER_ID", "1");
        let config = ServerConfig::from_env().unwrap();
        assert_eq!(config.server_id, 1);
        assert_eq!(config.client_addr, "127.0.0.1:9001");
        assert_eq!(config.advertise_client_addr, config.client_addr);
        assert_eq!(config.heartbeat_interval_ms, 100);
        assert_eq!(config.snapshot_distance, 0);
        assert_eq!(config.return_method, ReturnMethod::Blocking);
        assert_eq!(config.engine.path, "./repkv-1-db");
        assert!(config.join_seed.is_none());
        clear_repkv_env();
    }

    #[test]
    #[serial]
    fn zero_server_id_is_reserved() {
        clear_repkv_env();
        env::set_var("REPKV_SERVER_ID", "0");
        let err = ServerConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::ReservedServerId(0)));
        clear_repkv_env();
    }

    #[test]
    #[serial]
    fn bad_address_is_rejected() {
        clear_repkv_env();
        env::set_var("REPKV_SERVER_ID", "1");
        env::set_var("REPKV_CLIENT_ADDR", "not-an-address");
        let err = ServerConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvalidAddress { var, .. } if var == "REPKV_CLIENT_ADDR"));
        clear_repkv_env();
    }

    #[test]
    #[serial]
    fn inverted_election_timeouts_are_rejected() {
        clear_repkv_env();
        env::set_var("REPKV_SERVER_ID", "1");
        env::set_var("REPKV_ELECTION_TIMEOUT_LOWER_MS", "500");
        env::set_var("REPKV_ELECTION_TIMEOUT_UPPER_MS", "400");
        let err = ServerConfig::from_env().unwrap_err();
        assert!(matches!(err, ConfigError::InvertedElectionTimeouts { .. }));
        clear_repkv_env();
    }

    #[test]
    fn return_method_parses() {
        assert_eq!(
            "blocking".parse::<ReturnMethod>().unwrap(),
            ReturnMethod::Blocking
        );
        assert_eq!(
            "ASYNC_CALLBACK".parse::<ReturnMethod>().unwrap(),
            ReturnMethod::AsyncCallback
        );
        assert!("sync".parse::<ReturnMethod>().is_err());
    }

    #[test]
    fn read_algorithm_parses_the_full_set() {
        for (raw, expected) in [
            ("round_robin", ReadAlgorithm::RoundRobin),
            ("hash", ReadAlgorithm::Hash),
            ("random_token", ReadAlgorithm::RandomToken),
            ("random_uniform", ReadAlgorithm::RandomUniform),
            ("fixed", ReadAlgorithm::Fixed),
        ] {
            assert_eq!(raw.parse::<ReadAlgorithm>().unwrap(), expected);
        }
        assert!("latency".parse::<ReadAlgorithm>().is_err());
    }
}
