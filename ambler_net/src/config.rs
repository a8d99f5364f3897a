// Server and client configuration.
//
// `ServerConfig` and `ClientConfig` are plain serde structs with `Default`
// impls, loaded from JSON. Every field has a default (`#[serde(default)]` on
// each struct), so a config file only needs the keys it changes. The binaries
// layer CLI flags on top of whatever the file provides.
//
// `MobilityConfig` parameterizes the reference random-waypoint model in
// `mobility.rs`. All distances are millimetres and all durations
// milliseconds, matching the wire units, so the model never converts.
//
// Loading validates cross-field constraints (min <= max, non-zero speeds and
// request sizes) and reports them as `ConfigError::Invalid`.

use std::fs;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use ambler_protocol::{ProtocolFamily, SessionLimits, Time, VariantFlags, VersionSet};
use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("cannot read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("invalid JSON: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    Invalid(String),
}

/// The two optional protocol capabilities as they appear in config files.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VariantOptions {
    pub three_dimensions: bool,
    pub add_remove: bool,
}

impl VariantOptions {
    pub fn flags(self) -> VariantFlags {
        VariantFlags::from_options(self.three_dimensions, self.add_remove)
    }
}

// ---------------------------------------------------------------------------
// Mobility
// ---------------------------------------------------------------------------

/// Parameters of the reference random-waypoint model.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MobilityConfig {
    /// Extent of the walkable area along x.
    pub area_width_mm: u32,
    /// Extent of the walkable area along y.
    pub area_depth_mm: u32,
    /// Extent along z. Only used when `THREE_DIMENSIONS` is negotiated.
    pub area_height_mm: u32,
    pub min_speed_mm_per_s: u32,
    pub max_speed_mm_per_s: u32,
    pub min_pause_ms: u32,
    pub max_pause_ms: u32,
    /// Chance, per arrival, that the agent leaves the area. Only used when
    /// `ADD_REMOVE` is negotiated.
    pub absence_per_mille: u32,
    pub min_absence_ms: u32,
    pub max_absence_ms: u32,
}

impl Default for MobilityConfig {
    fn default() -> Self {
        Self {
            area_width_mm: 200_000,
            area_depth_mm: 200_000,
            area_height_mm: 10_000,
            min_speed_mm_per_s: 800,
            max_speed_mm_per_s: 1_600,
            min_pause_ms: 0,
            max_pause_ms: 30_000,
            absence_per_mille: 0,
            min_absence_ms: 5_000,
            max_absence_ms: 120_000,
        }
    }
}

impl MobilityConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.min_speed_mm_per_s == 0 {
            return Err(ConfigError::Invalid("min_speed_mm_per_s must be positive".into()));
        }
        check_range("speed", self.min_speed_mm_per_s, self.max_speed_mm_per_s)?;
        check_range("pause", self.min_pause_ms, self.max_pause_ms)?;
        check_range("absence", self.min_absence_ms, self.max_absence_ms)?;
        if self.min_absence_ms == 0 {
            return Err(ConfigError::Invalid("min_absence_ms must be positive".into()));
        }
        Ok(())
    }
}

fn check_range(what: &str, min: u32, max: u32) -> Result<(), ConfigError> {
    if min > max {
        return Err(ConfigError::Invalid(format!(
            "{what} range is empty: min {min} > max {max}"
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub bind_addr: String,
    /// 0 lets the OS pick a free port.
    pub port: u16,
    pub family: ProtocolFamily,
    /// Variants the server enables. Clients must support all of them.
    pub variants: VariantOptions,
    pub max_agents: u32,
    pub max_time_limit_ms: u32,
    /// Most agent IDs (or state events) accepted in one client message.
    pub max_requests_per_message: u32,
    /// Read/write timeout on client sockets. 0 disables it.
    pub io_timeout_ms: u64,
    pub mobility: MobilityConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_addr: "127.0.0.1".into(),
            port: 7411,
            family: ProtocolFamily::Uamp,
            variants: VariantOptions::default(),
            max_agents: 10_000,
            max_time_limit_ms: 86_400_000,
            max_requests_per_message: 4_096,
            io_timeout_ms: 30_000,
            mobility: MobilityConfig::default(),
        }
    }
}

impl ServerConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ServerConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json(&read_file(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_requests_per_message == 0 {
            return Err(ConfigError::Invalid(
                "max_requests_per_message must be positive".into(),
            ));
        }
        self.listen_addr()?;
        self.mobility.validate()
    }

    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        format!("{}:{}", self.bind_addr, self.port)
            .parse()
            .map_err(|e| ConfigError::Invalid(format!("bind address {:?}: {e}", self.bind_addr)))
    }

    pub fn limits(&self) -> SessionLimits {
        SessionLimits {
            max_agents: self.max_agents,
            max_time_limit: Time(self.max_time_limit_ms),
        }
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        timeout_from_ms(self.io_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub family: ProtocolFamily,
    /// Protocol versions offered in the Hello.
    pub versions: VersionSet,
    /// Variants the client supports.
    pub variants: VariantOptions,
    /// Waypoints requested per agent whenever a queue runs dry.
    pub prefetch_depth: u32,
    /// Most agent IDs sent in one LocationRequest. Longer requests are
    /// split. Must not exceed the server's `max_requests_per_message`.
    pub max_request_entries: u32,
    /// State events queued before an automatic flush (MVISP).
    pub state_batch_capacity: usize,
    /// Read/write timeout on the socket. 0 disables it.
    pub io_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            family: ProtocolFamily::Uamp,
            versions: VersionSet::SUPPORTED,
            variants: VariantOptions {
                three_dimensions: true,
                add_remove: true,
            },
            prefetch_depth: 4,
            max_request_entries: 4_096,
            state_batch_capacity: 32,
            io_timeout_ms: 30_000,
        }
    }
}

impl ClientConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: ClientConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: &Path) -> Result<Self, ConfigError> {
        Self::from_json(&read_file(path)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.prefetch_depth == 0 {
            return Err(ConfigError::Invalid("prefetch_depth must be positive".into()));
        }
        if self.max_request_entries == 0 {
            return Err(ConfigError::Invalid(
                "max_request_entries must be positive".into(),
            ));
        }
        if self.state_batch_capacity == 0 {
            return Err(ConfigError::Invalid(
                "state_batch_capacity must be positive".into(),
            ));
        }
        Ok(())
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        timeout_from_ms(self.io_timeout_ms)
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.to_path_buf(),
        source,
    })
}

fn timeout_from_ms(ms: u64) -> Option<Duration> {
    (ms > 0).then(|| Duration::from_millis(ms))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_object_gives_defaults() {
        assert_eq!(ServerConfig::from_json("{}").unwrap(), ServerConfig::default());
        assert_eq!(ClientConfig::from_json("{}").unwrap(), ClientConfig::default());
    }

    #[test]
    fn partial_server_config() {
        let config = ServerConfig::from_json(
            r#"{"port": 0, "family": "mvisp", "variants": {"add_remove": true},
                "mobility": {"max_pause_ms": 0}}"#,
        )
        .unwrap();
        assert_eq!(config.port, 0);
        assert_eq!(config.family, ProtocolFamily::Mvisp);
        assert_eq!(config.variants.flags(), VariantFlags::ADD_REMOVE);
        assert_eq!(config.mobility.max_pause_ms, 0);
        assert_eq!(config.mobility.min_speed_mm_per_s, 800);
    }

    #[test]
    fn client_versions_are_a_raw_byte() {
        let config = ClientConfig::from_json(r#"{"versions": 192}"#).unwrap();
        assert_eq!(config.versions, VersionSet(0xC0));
    }

    #[test]
    fn inverted_ranges_are_rejected() {
        let err = ServerConfig::from_json(
            r#"{"mobility": {"min_pause_ms": 10, "max_pause_ms": 5}}"#,
        )
        .unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn bad_bind_address_is_rejected() {
        let err = ServerConfig::from_json(r#"{"bind_addr": "not an ip"}"#).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid(_)));
    }

    #[test]
    fn malformed_json_is_parse_error() {
        assert!(matches!(
            ClientConfig::from_json("{prefetch_depth"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[test]
    fn zero_prefetch_is_rejected() {
        assert!(ClientConfig::from_json(r#"{"prefetch_depth": 0}"#).is_err());
    }

    #[test]
    fn request_entries_match_server_limit() {
        assert_eq!(
            ClientConfig::default().max_request_entries,
            ServerConfig::default().max_requests_per_message
        );
        assert!(ClientConfig::from_json(r#"{"max_request_entries": 0}"#).is_err());
    }

    #[test]
    fn missing_file_reports_path() {
        let err = ServerConfig::from_json_file(Path::new("/nonexistent/ambler.json")).unwrap_err();
        assert!(err.to_string().contains("/nonexistent/ambler.json"));
    }

    #[test]
    fn zero_timeout_disables_it() {
        let config = ClientConfig {
            io_timeout_ms: 0,
            ..ClientConfig::default()
        };
        assert_eq!(config.io_timeout(), None);
        assert_eq!(
            ServerConfig::default().io_timeout(),
            Some(Duration::from_secs(30))
        );
    }

    #[test]
    fn limits_follow_config() {
        let config = ServerConfig {
            max_agents: 5,
            max_time_limit_ms: 1000,
            ..ServerConfig::default()
        };
        assert_eq!(config.limits().max_agents, 5);
        assert_eq!(config.limits().max_time_limit, Time(1000));
    }
}
