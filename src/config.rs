//! Device configuration: a TOML file merged with CLI and environment
//! overrides, highest precedence last.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;

use crate::event::Location;
use crate::geo::{Geofence, RoutePoint};

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {}: {source}", path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to parse config file {}: {source}", path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },
}

/// Provisioning service settings and the TLS material used for both the
/// provisioning and hub sessions.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct ProvisioningConfig {
    pub id_scope: String,
    /// Device registration id, typically the IMEI.
    pub registration_id: String,
    #[serde(default = "default_provisioning_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    pub trust_anchor_path: PathBuf,
    #[serde(default = "default_true")]
    pub verify_server: bool,
    #[serde(default = "default_provisioning_timeout_secs")]
    pub timeout_secs: u64,
}

impl ProvisioningConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout_secs)
    }
}

/// Legacy direct-to-hub settings with a symmetric device key.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct LegacyConfig {
    pub hub_host: String,
    pub device_id: String,
    pub device_key_base64: String,
    #[serde(default = "default_token_expiry_secs")]
    pub token_expiry_secs: u64,
}

#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct SimulationConfig {
    /// Fallback device identity until provisioning assigns one.
    #[serde(default = "default_device_id")]
    pub device_id: String,
    #[serde(default = "default_start_location")]
    pub start_location: Location,
    #[serde(default = "default_speed_limit")]
    pub speed_limit_kph: f64,
    #[serde(default = "default_heartbeat_stationary_secs")]
    pub heartbeat_stationary_secs: u64,
    #[serde(default = "default_heartbeat_moving_secs")]
    pub heartbeat_moving_secs: u64,
    /// Seed for the random source; omit for system randomness.
    #[serde(default)]
    pub seed: Option<u64>,
}

impl Default for SimulationConfig {
    fn default() -> Self {
        Self {
            device_id: default_device_id(),
            start_location: default_start_location(),
            speed_limit_kph: default_speed_limit(),
            heartbeat_stationary_secs: default_heartbeat_stationary_secs(),
            heartbeat_moving_secs: default_heartbeat_moving_secs(),
            seed: None,
        }
    }
}

/// Where the twin adapter persists applied configuration and diagnostics.
#[derive(Clone, Debug, Deserialize, Serialize)]
pub struct TwinConfig {
    #[serde(default = "default_twin_config_path")]
    pub config_path: PathBuf,
    #[serde(default = "default_twin_error_path")]
    pub error_path: PathBuf,
}

impl Default for TwinConfig {
    fn default() -> Self {
        Self {
            config_path: default_twin_config_path(),
            error_path: default_twin_error_path(),
        }
    }
}

#[derive(Clone, Debug, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub provisioning: Option<ProvisioningConfig>,
    #[serde(default)]
    pub legacy: Option<LegacyConfig>,
    #[serde(default)]
    pub simulation: SimulationConfig,
    #[serde(default)]
    pub twin: TwinConfig,
    #[serde(default)]
    pub route: Vec<RoutePoint>,
    #[serde(default, rename = "geofence")]
    pub geofences: Vec<Geofence>,
}

impl Config {
    /// Loads the TOML file if given, then applies overrides.
    pub fn load(path: Option<&Path>, overrides: &Overrides) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                debug!("loading config from {}", path.display());
                let contents = fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
                toml::from_str::<Config>(&contents).map_err(|source| ConfigError::Parse {
                    path: path.to_path_buf(),
                    source,
                })?
            }
            None => Config::default(),
        };

        if let Some(device_id) = &overrides.device_id {
            config.simulation.device_id = device_id.clone();
        }
        if let Some(seed) = overrides.seed {
            config.simulation.seed = Some(seed);
        }
        if let Some(limit) = overrides.speed_limit_kph {
            config.simulation.speed_limit_kph = limit;
        }
        if let Some(secs) = overrides.heartbeat_secs {
            config.simulation.heartbeat_stationary_secs = secs;
        }

        Ok(config)
    }
}

/// CLI/environment values that take precedence over the file.
#[derive(Clone, Debug, Default)]
pub struct Overrides {
    pub device_id: Option<String>,
    pub seed: Option<u64>,
    pub speed_limit_kph: Option<f64>,
    pub heartbeat_secs: Option<u64>,
}

fn default_provisioning_endpoint() -> String {
    "global.azure-devices-provisioning.net".to_string()
}

fn default_port() -> u16 {
    8883
}

fn default_true() -> bool {
    true
}

fn default_provisioning_timeout_secs() -> u64 {
    120
}

fn default_token_expiry_secs() -> u64 {
    3600
}

fn default_device_id() -> String {
    "SIM-001".to_string()
}

fn default_start_location() -> Location {
    Location {
        lat: -26.2041,
        lon: 28.0473,
        alt: 1720.0,
        accuracy: 12.5,
    }
}

fn default_speed_limit() -> f64 {
    90.0
}

fn default_heartbeat_stationary_secs() -> u64 {
    60
}

fn default_heartbeat_moving_secs() -> u64 {
    20
}

fn default_twin_config_path() -> PathBuf {
    PathBuf::from("waymark-twin-config.json")
}

fn default_twin_error_path() -> PathBuf {
    PathBuf::from("waymark-twin-error.json")
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn parses_a_full_config_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waymark.toml");
        fs::write(
            &path,
            r#"
[provisioning]
id_scope = "0ne001"
registration_id = "356938035643809"
cert_path = "certs/device.cert.pem"
key_path = "certs/device.key.pem"
trust_anchor_path = "certs/root-ca.pem"

[simulation]
device_id = "TRUCK-42"
speed_limit_kph = 80.0
seed = 7

[[route]]
lat = -26.2041
lon = 28.0473

[[route]]
lat = -26.1076
lon = 28.0567

[[geofence]]
id = "depot"
lat = -26.2041
lon = 28.0473
radius_meters = 250.0
"#,
        )
        .unwrap();

        let config = Config::load(Some(&path), &Overrides::default()).unwrap();

        let provisioning = config.provisioning.unwrap();
        assert_eq!(provisioning.id_scope, "0ne001");
        assert_eq!(
            provisioning.endpoint,
            "global.azure-devices-provisioning.net"
        );
        assert_eq!(provisioning.port, 8883);
        assert!(provisioning.verify_server);
        assert_eq!(provisioning.timeout(), Duration::from_secs(120));

        assert_eq!(config.simulation.device_id, "TRUCK-42");
        assert_eq!(config.simulation.speed_limit_kph, 80.0);
        assert_eq!(config.simulation.seed, Some(7));
        assert_eq!(config.route.len(), 2);
        assert_eq!(config.geofences.len(), 1);
        assert_eq!(config.geofences[0].id, "depot");
        assert!(config.legacy.is_none());
    }

    #[test]
    fn overrides_take_precedence_over_the_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("waymark.toml");
        fs::write(&path, "[simulation]\ndevice_id = \"from-file\"\n").unwrap();

        let overrides = Overrides {
            device_id: Some("from-cli".into()),
            seed: Some(99),
            ..Default::default()
        };
        let config = Config::load(Some(&path), &overrides).unwrap();
        assert_eq!(config.simulation.device_id, "from-cli");
        assert_eq!(config.simulation.seed, Some(99));
    }

    #[test]
    fn defaults_apply_without_a_file() {
        let config = Config::load(None, &Overrides::default()).unwrap();
        assert_eq!(config.simulation.device_id, "SIM-001");
        assert_eq!(config.simulation.heartbeat_stationary_secs, 60);
        assert_eq!(config.simulation.heartbeat_moving_secs, 20);
        assert!(config.provisioning.is_none());
        assert!(config.route.is_empty());
    }

    #[test]
    fn rejects_malformed_toml() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.toml");
        fs::write(&path, "[simulation\n").unwrap();
        assert!(matches!(
            Config::load(Some(&path), &Overrides::default()),
            Err(ConfigError::Parse { .. })
        ));
    }
}
