//! Layered configuration for both binaries.
//!
//! Every field can be sourced from a JSON config file, an environment
//! variable, or a command-line flag; later sources win in that order.
//! The flag layer is handed in by the binaries as an override set so the
//! merge logic stays in one place.

use crate::error::{Result, VitalsError};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::warn;

/// How the agent ships reports to the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryProtocol {
    Http,
    Grpc,
}

impl FromStr for DeliveryProtocol {
    type Err = VitalsError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "http" => Ok(Self::Http),
            "grpc" => Ok(Self::Grpc),
            other => Err(VitalsError::InvalidConfig {
                reason: format!("unknown delivery protocol: {other}"),
            }),
        }
    }
}

fn lookup_env(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.is_empty())
}

fn parse_env<T: FromStr>(raw: &str, name: &str) -> Result<T> {
    raw.parse::<T>().map_err(|_| VitalsError::InvalidConfig {
        reason: format!("invalid value for {name}: {raw}"),
    })
}

/// Ensure an agent-side server address carries an http scheme.
pub fn normalize_address(addr: &str) -> String {
    if addr.starts_with("http://") || addr.starts_with("https://") {
        addr.to_string()
    } else {
        format!("http://{addr}")
    }
}

// ========================
// Server configuration
// ========================

/// Optional per-source override set for [`ServerConfig`]. Also the shape of
/// the JSON config file.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct ServerOverrides {
    pub address: Option<String>,
    pub rpc_address: Option<String>,
    pub database_dsn: Option<String>,
    pub mode: Option<String>,
    pub key: Option<String>,
    pub crypto_key: Option<String>,
    pub store_file: Option<String>,
    pub store_interval: Option<u64>,
    pub restore: Option<bool>,
    pub trusted_subnet: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Listen address for the HTTP surface.
    pub address: String,
    /// Listen address for the gRPC mirror; the mirror is served only when
    /// this is set.
    pub rpc_address: Option<String>,
    /// Postgres DSN; empty means the in-memory backend.
    pub database_dsn: Option<String>,
    /// `dev` (console logs) or `prod` (JSON logs).
    pub mode: String,
    /// Shared HMAC key; enables signature checking and response signing.
    pub key: Option<String>,
    /// Path to the PEM private key; enables envelope decryption.
    pub crypto_key: Option<PathBuf>,
    /// Snapshot file path.
    pub store_file: PathBuf,
    /// Snapshot interval in seconds.
    pub store_interval: u64,
    /// Restore from the snapshot file on startup.
    pub restore: bool,
    /// CIDR of admitted callers, checked against `X-Real-IP`.
    pub trusted_subnet: Option<String>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            address: "localhost:8080".to_string(),
            rpc_address: None,
            database_dsn: None,
            mode: "dev".to_string(),
            key: None,
            crypto_key: None,
            store_file: PathBuf::from("./backup.json"),
            store_interval: 300,
            restore: false,
            trusted_subnet: None,
        }
    }
}

impl ServerConfig {
    pub fn apply(&mut self, overrides: ServerOverrides) {
        if let Some(v) = overrides.address {
            self.address = v;
        }
        if let Some(v) = overrides.rpc_address {
            self.rpc_address = Some(v);
        }
        if let Some(v) = overrides.database_dsn {
            self.database_dsn = Some(v);
        }
        if let Some(v) = overrides.mode {
            self.mode = v;
        }
        if let Some(v) = overrides.key {
            self.key = Some(v);
        }
        if let Some(v) = overrides.crypto_key {
            self.crypto_key = Some(PathBuf::from(v));
        }
        if let Some(v) = overrides.store_file {
            self.store_file = PathBuf::from(v);
        }
        if let Some(v) = overrides.store_interval {
            self.store_interval = v;
        }
        if let Some(v) = overrides.restore {
            self.restore = v;
        }
        if let Some(v) = overrides.trusted_subnet {
            self.trusted_subnet = Some(v);
        }
    }

    pub fn overrides_from_env(lookup: impl Fn(&str) -> Option<String>) -> Result<ServerOverrides> {
        Ok(ServerOverrides {
            address: lookup("ADDRESS"),
            rpc_address: lookup("RPC_ADDRESS"),
            database_dsn: lookup("DATABASE_DSN"),
            mode: lookup("MODE"),
            key: lookup("KEY"),
            crypto_key: lookup("CRYPTO_KEY"),
            store_file: lookup("FILE_STORAGE_PATH"),
            store_interval: lookup("STORE_INTERVAL")
                .map(|v| parse_env(&v, "STORE_INTERVAL"))
                .transpose()?,
            restore: lookup("RESTORE").map(|v| parse_env(&v, "RESTORE")).transpose()?,
            trusted_subnet: lookup("TRUSTED_SUBNET"),
        })
    }

    /// Build the effective configuration: defaults, then the JSON file,
    /// then the environment, then the flag overrides.
    pub fn load(config_path: Option<&Path>, flags: ServerOverrides) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(file) = read_config_file(config_path)? {
            cfg.apply(file);
        }
        cfg.apply(Self::overrides_from_env(lookup_env)?);
        cfg.apply(flags);
        Ok(cfg)
    }
}

// ========================
// Agent configuration
// ========================

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct AgentOverrides {
    pub address: Option<String>,
    pub key: Option<String>,
    pub crypto_key: Option<String>,
    pub rate_limit: Option<u32>,
    pub report_interval: Option<u64>,
    pub poll_interval: Option<u64>,
    pub protocol: Option<String>,
}

#[derive(Debug, Clone)]
pub struct AgentConfig {
    /// Server base address, scheme included.
    pub address: String,
    /// Shared HMAC key for request signing.
    pub key: Option<String>,
    /// Path to the PEM public key; enables envelope encryption.
    pub crypto_key: Option<PathBuf>,
    /// Number of delivery workers.
    pub rate_limit: u32,
    /// Seconds between report dispatches.
    pub report_interval: u64,
    /// Seconds between metric samples.
    pub poll_interval: u64,
    pub protocol: DeliveryProtocol,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            address: "http://localhost:8080".to_string(),
            key: None,
            crypto_key: None,
            rate_limit: 3,
            report_interval: 10,
            poll_interval: 2,
            protocol: DeliveryProtocol::Http,
        }
    }
}

impl AgentConfig {
    pub fn apply(&mut self, overrides: AgentOverrides) -> Result<()> {
        if let Some(v) = overrides.address {
            self.address = normalize_address(&v);
        }
        if let Some(v) = overrides.key {
            self.key = Some(v);
        }
        if let Some(v) = overrides.crypto_key {
            self.crypto_key = Some(PathBuf::from(v));
        }
        if let Some(v) = overrides.rate_limit {
            self.rate_limit = v;
        }
        if let Some(v) = overrides.report_interval {
            self.report_interval = v;
        }
        if let Some(v) = overrides.poll_interval {
            self.poll_interval = v;
        }
        if let Some(v) = overrides.protocol {
            self.protocol = v.parse()?;
        }
        Ok(())
    }

    pub fn overrides_from_env(lookup: impl Fn(&str) -> Option<String>) -> Result<AgentOverrides> {
        Ok(AgentOverrides {
            address: lookup("ADDRESS"),
            key: lookup("KEY"),
            crypto_key: lookup("CRYPTO_KEY"),
            rate_limit: lookup("RATE_LIMIT").map(|v| parse_env(&v, "RATE_LIMIT")).transpose()?,
            report_interval: lookup("REPORT_INTERVAL")
                .map(|v| parse_env(&v, "REPORT_INTERVAL"))
                .transpose()?,
            poll_interval: lookup("POLL_INTERVAL")
                .map(|v| parse_env(&v, "POLL_INTERVAL"))
                .transpose()?,
            protocol: lookup("PROTOCOL"),
        })
    }

    pub fn load(config_path: Option<&Path>, flags: AgentOverrides) -> Result<Self> {
        let mut cfg = Self::default();
        if let Some(file) = read_config_file(config_path)? {
            cfg.apply(file)?;
        }
        cfg.apply(Self::overrides_from_env(lookup_env)?)?;
        cfg.apply(flags)?;
        if cfg.rate_limit == 0 {
            return Err(VitalsError::InvalidConfig {
                reason: "rate_limit must be at least 1".to_string(),
            });
        }
        Ok(cfg)
    }
}

fn read_config_file<T: serde::de::DeserializeOwned>(path: Option<&Path>) -> Result<Option<T>> {
    let Some(path) = path else { return Ok(None) };
    if !path.exists() {
        warn!(path = %path.display(), "config file not found, skipping");
        return Ok(None);
    }
    let content = std::fs::read_to_string(path)
        .map_err(|source| VitalsError::Io { path: path.to_path_buf(), source })?;
    serde_json::from_str(&content)
        .map(Some)
        .map_err(|e| VitalsError::InvalidConfig { reason: format!("failed to parse config: {e}") })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use std::io::Write;

    #[test]
    fn server_defaults_hold_without_overrides() {
        let cfg = ServerConfig::default();
        assert_eq!(cfg.address, "localhost:8080");
        assert_eq!(cfg.store_interval, 300);
        assert!(!cfg.restore);
        assert!(cfg.database_dsn.is_none());
    }

    #[test]
    fn env_layer_beats_file_and_flags_beat_env() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(
            file,
            r#"{{"address": "file:1111", "store_interval": 60, "restore": true}}"#
        )
        .unwrap();

        let env: HashMap<&str, &str> =
            HashMap::from([("ADDRESS", "env:2222"), ("STORE_INTERVAL", "30")]);
        let env_overrides = ServerConfig::overrides_from_env(|name| {
            env.get(name).map(|v| v.to_string())
        })
        .unwrap();

        let mut cfg = ServerConfig::default();
        cfg.apply(read_config_file(Some(file.path())).unwrap().unwrap());
        cfg.apply(env_overrides);
        cfg.apply(ServerOverrides { address: Some("flag:3333".to_string()), ..Default::default() });

        assert_eq!(cfg.address, "flag:3333");
        assert_eq!(cfg.store_interval, 30);
        assert!(cfg.restore);
    }

    #[test]
    fn bad_env_integer_is_a_config_error() {
        let res = ServerConfig::overrides_from_env(|name| {
            (name == "STORE_INTERVAL").then(|| "not-a-number".to_string())
        });
        assert!(res.is_err());
    }

    #[test]
    fn agent_address_is_normalized() {
        let mut cfg = AgentConfig::default();
        cfg.apply(AgentOverrides {
            address: Some("localhost:9090".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(cfg.address, "http://localhost:9090");

        cfg.apply(AgentOverrides {
            address: Some("https://example.com:443".to_string()),
            ..Default::default()
        })
        .unwrap();
        assert_eq!(cfg.address, "https://example.com:443");
    }

    #[test]
    fn agent_protocol_parses_closed_set() {
        let mut cfg = AgentConfig::default();
        cfg.apply(AgentOverrides { protocol: Some("grpc".to_string()), ..Default::default() })
            .unwrap();
        assert_eq!(cfg.protocol, DeliveryProtocol::Grpc);

        let err = cfg
            .apply(AgentOverrides { protocol: Some("carrier-pigeon".to_string()), ..Default::default() });
        assert!(err.is_err());
    }
}
