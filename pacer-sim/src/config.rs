//! Simulator configuration.
//!
//! Configuration is loaded in the following order (later overrides earlier):
//! 1. Default values
//! 2. YAML config file (if specified via PACER_SIM_CONFIG or --config)
//! 3. Environment variables

use pacer_core::DEFAULT_QUEUE_CAPACITY;
use pacer_protocol::DEFAULT_PORT;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Simulator configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Network configuration.
    pub network: NetworkConfig,
    /// Controller identity and timing.
    pub firmware: FirmwareConfig,
    /// Devices attached to the controller.
    pub devices: DeviceConfig,
}

impl Config {
    /// Loads configuration from file, then applies environment variable overrides.
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::default();

        if let Ok(path) = std::env::var("PACER_SIM_CONFIG") {
            config = Self::from_file(&path)?;
        }

        config.apply_env_overrides();
        config.validate()?;

        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: Config = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    /// Loads configuration from environment variables only.
    pub fn from_env() -> Self {
        let mut config = Self::default();
        config.apply_env_overrides();
        config
    }

    fn apply_env_overrides(&mut self) {
        self.network.apply_env_overrides();
        self.firmware.apply_env_overrides();
    }

    /// Checks cross-references between devices.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let inputs = self.devices.inputs.len();
        for stepper in &self.devices.steppers {
            if let Some(endstop) = stepper.endstop {
                if endstop as usize >= inputs {
                    return Err(ConfigError::ValidationError(format!(
                        "stepper '{}' uses endstop input {} but only {} inputs exist",
                        stepper.name, endstop, inputs
                    )));
                }
            }
        }

        let sensors = self.devices.sensors.len();
        for heater in &self.devices.heaters {
            if let Some(sensor) = heater.sensor {
                if sensor as usize >= sensors {
                    return Err(ConfigError::ValidationError(format!(
                        "heater '{}' uses sensor {} but only {} sensors exist",
                        heater.name, sensor, sensors
                    )));
                }
            }
        }

        if self.firmware.queue_capacity == 0 || self.firmware.queue_capacity > u16::MAX as usize {
            return Err(ConfigError::ValidationError(
                "queue_capacity must be between 1 and 65535".to_string(),
            ));
        }
        if self.firmware.step_rate_hz == 0 {
            return Err(ConfigError::ValidationError(
                "step_rate_hz must be positive".to_string(),
            ));
        }

        Ok(())
    }

    /// Saves configuration to a YAML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<(), ConfigError> {
        let path = path.as_ref();
        let content = serde_yaml::to_string(self)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        std::fs::write(path, content).map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        Ok(())
    }
}

/// Network configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkConfig {
    /// Address to bind to.
    #[serde(with = "socket_addr_serde")]
    pub bind_addr: SocketAddr,
    /// Maximum concurrent links; a real board has one.
    pub max_connections: usize,
}

impl Default for NetworkConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::new(IpAddr::V4(Ipv4Addr::LOCALHOST), DEFAULT_PORT),
            max_connections: 1,
        }
    }
}

impl NetworkConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(addr) = std::env::var("PACER_SIM_BIND") {
            if let Ok(parsed) = addr.parse() {
                self.bind_addr = parsed;
            }
        }
    }
}

/// Controller identity and timing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirmwareConfig {
    pub name: String,
    pub board_name: String,
    pub board_serial: String,
    pub given_name: String,
    /// Slots the command queue holds.
    pub queue_capacity: usize,
    /// Step rate at full nominal speed.
    pub step_rate_hz: u32,
    /// Interval between thermal model updates in milliseconds.
    pub thermal_tick_ms: u64,
    /// Time constant of the heating curve in seconds.
    pub thermal_time_constant_secs: f64,
    pub ambient_temperature: f64,
    /// Highest heater target accepted.
    pub max_temperature: f64,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            name: "pacer-sim".to_string(),
            board_name: "simulated board".to_string(),
            board_serial: "SIM-0001".to_string(),
            given_name: String::new(),
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            step_rate_hz: 20_000,
            thermal_tick_ms: 100,
            thermal_time_constant_secs: 2.0,
            ambient_temperature: 21.5,
            max_temperature: 300.0,
        }
    }
}

impl FirmwareConfig {
    fn apply_env_overrides(&mut self) {
        if let Ok(capacity) = std::env::var("PACER_SIM_QUEUE_CAPACITY") {
            if let Ok(n) = capacity.parse() {
                self.queue_capacity = n;
            }
        }

        if let Ok(rate) = std::env::var("PACER_SIM_STEP_RATE") {
            if let Ok(hz) = rate.parse() {
                self.step_rate_hz = hz;
            }
        }
    }

    /// Returns the thermal tick as Duration.
    pub fn thermal_tick(&self) -> Duration {
        Duration::from_millis(self.thermal_tick_ms.max(1))
    }
}

/// Devices attached to the simulated controller, numbered by list position.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    pub inputs: Vec<NamedDevice>,
    pub outputs: Vec<NamedDevice>,
    pub pwm: Vec<NamedDevice>,
    pub buzzers: Vec<NamedDevice>,
    pub steppers: Vec<StepperConfig>,
    pub heaters: Vec<HeaterConfig>,
    pub sensors: Vec<NamedDevice>,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        let named = |names: &[&str]| {
            names
                .iter()
                .map(|n| NamedDevice {
                    name: n.to_string(),
                })
                .collect()
        };
        let stepper = |name: &str, endstop: Option<u8>| StepperConfig {
            name: name.to_string(),
            endstop,
        };
        let heater = |name: &str, sensor: u8| HeaterConfig {
            name: name.to_string(),
            sensor: Some(sensor),
        };

        Self {
            inputs: named(&["x_min", "y_min", "z_min", "filament"]),
            outputs: named(&["fan", "light"]),
            pwm: named(&["part_fan"]),
            buzzers: named(&["beeper"]),
            steppers: vec![
                stepper("x", Some(0)),
                stepper("y", Some(1)),
                stepper("z", Some(2)),
                stepper("e", None),
            ],
            heaters: vec![heater("hotend", 0), heater("bed", 1)],
            sensors: named(&["hotend", "bed"]),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NamedDevice {
    pub name: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepperConfig {
    pub name: String,
    /// Input that reads triggered once this stepper has homed.
    #[serde(default)]
    pub endstop: Option<u8>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HeaterConfig {
    pub name: String,
    /// Sensor the heater drives.
    #[serde(default)]
    pub sensor: Option<u8>,
}

/// Configuration error.
#[derive(Debug)]
pub enum ConfigError {
    IoError(PathBuf, std::io::Error),
    ParseError(PathBuf, String),
    ValidationError(String),
}

impl std::fmt::Display for ConfigError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigError::IoError(path, e) => {
                write!(f, "failed to read config file '{}': {}", path.display(), e)
            }
            ConfigError::ParseError(path, e) => {
                write!(f, "failed to parse config file '{}': {}", path.display(), e)
            }
            ConfigError::ValidationError(msg) => {
                write!(f, "configuration validation failed: {}", msg)
            }
        }
    }
}

impl std::error::Error for ConfigError {}

/// Custom serde module for SocketAddr (to handle as string in YAML).
mod socket_addr_serde {
    use serde::{Deserialize, Deserializer, Serializer};
    use std::net::SocketAddr;

    pub fn serialize<S>(addr: &SocketAddr, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&addr.to_string())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<SocketAddr, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.network.bind_addr.port(), DEFAULT_PORT);
        assert_eq!(config.firmware.queue_capacity, 500);
        assert_eq!(config.devices.steppers.len(), 4);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_yaml_roundtrip() {
        let config = Config::default();
        let yaml = serde_yaml::to_string(&config).unwrap();
        let parsed: Config = serde_yaml::from_str(&yaml).unwrap();
        assert_eq!(parsed.network.bind_addr, config.network.bind_addr);
        assert_eq!(parsed.devices.heaters.len(), 2);
    }

    #[test]
    fn test_from_file_partial() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(
            file,
            "firmware:\n  name: bench-board\n  step_rate_hz: 1000000\nnetwork:\n  bind_addr: \"0.0.0.0:9000\""
        )
        .unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.firmware.name, "bench-board");
        assert_eq!(config.firmware.step_rate_hz, 1_000_000);
        assert_eq!(config.firmware.queue_capacity, 500);
        assert_eq!(config.network.bind_addr.port(), 9000);
    }

    #[test]
    fn test_validation_rejects_missing_endstop() {
        let mut config = Config::default();
        config.devices.steppers[0].endstop = Some(42);
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("endstop input 42"));
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sim.yaml");
        let mut config = Config::default();
        config.firmware.given_name = "left".to_string();
        config.save(&path).unwrap();

        let loaded = Config::from_file(&path).unwrap();
        assert_eq!(loaded.firmware.given_name, "left");
    }
}
