//! Machine configuration.
//!
//! Loaded from YAML (path from `--config` or PACER_MACHINE_CONFIG) on top of
//! defaults describing a single-controller cartesian printer.

use crate::axis::Axis;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Machine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MachineConfig {
    /// Controller addresses; the list position is the controller index.
    pub controllers: Vec<ControllerConfig>,
    pub axes: BTreeMap<Axis, AxisConfig>,
    /// Named heaters, each mapped to its own controller, heater and sensor.
    pub heaters: BTreeMap<String, HeaterConfig>,
    pub motion: MotionConfig,
}

impl Default for MachineConfig {
    fn default() -> Self {
        let axis = |stepper: u8, steps_per_mm: f64, accel: f64, feed: f64, travel: f64, switch: Option<u8>| {
            AxisConfig {
                steppers: vec![StepperMapping {
                    controller: 0,
                    stepper,
                    direction_inverted: false,
                    max_acceleration: None,
                }],
                steps_per_mm,
                max_acceleration: accel,
                max_feedrate: feed,
                travel,
                min_switch: switch.map(|input| SwitchConfig {
                    controller: 0,
                    input,
                    inverted: false,
                }),
                max_switch: None,
            }
        };

        let mut axes = BTreeMap::new();
        axes.insert(Axis::X, axis(0, 80.0, 1000.0, 200.0, 200.0, Some(0)));
        axes.insert(Axis::Y, axis(1, 80.0, 1000.0, 200.0, 200.0, Some(1)));
        axes.insert(Axis::Z, axis(2, 400.0, 100.0, 10.0, 180.0, Some(2)));
        axes.insert(Axis::E, axis(3, 93.0, 5000.0, 50.0, 0.0, None));

        let mut heaters = BTreeMap::new();
        heaters.insert(
            "hotend".to_string(),
            HeaterConfig {
                controller: 0,
                heater: 0,
                sensor: 0,
            },
        );
        heaters.insert(
            "bed".to_string(),
            HeaterConfig {
                controller: 0,
                heater: 1,
                sensor: 1,
            },
        );

        Self {
            controllers: vec![ControllerConfig {
                address: format!("127.0.0.1:{}", pacer_protocol::DEFAULT_PORT),
                max_step_rate: DEFAULT_MAX_STEP_RATE,
            }],
            axes,
            heaters,
            motion: MotionConfig::default(),
        }
    }
}

impl MachineConfig {
    /// Loads from PACER_MACHINE_CONFIG if set, else defaults.
    pub fn load() -> Result<Self, ConfigError> {
        let config = match std::env::var("PACER_MACHINE_CONFIG") {
            Ok(path) => Self::from_file(path)?,
            Err(_) => Self::default(),
        };
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from a YAML file.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| ConfigError::IoError(path.to_path_buf(), e))?;
        let config: MachineConfig = serde_yaml::from_str(&content)
            .map_err(|e| ConfigError::ParseError(path.to_path_buf(), e.to_string()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        for (index, controller) in self.controllers.iter().enumerate() {
            if !(controller.max_step_rate > 0.0 && controller.max_step_rate.is_finite()) {
                return Err(ConfigError::ValidationError(format!(
                    "controller {} max_step_rate must be positive",
                    index
                )));
            }
        }

        for (axis, cfg) in &self.axes {
            if cfg.steppers.is_empty() || cfg.steppers.len() > 2 {
                return Err(ConfigError::ValidationError(format!(
                    "axis {} needs one or two steppers, got {}",
                    axis,
                    cfg.steppers.len()
                )));
            }
            if !(cfg.steps_per_mm > 0.0 && cfg.steps_per_mm.is_finite()) {
                return Err(ConfigError::ValidationError(format!(
                    "axis {} steps_per_mm must be positive",
                    axis
                )));
            }
            if cfg.max_acceleration <= 0.0 || cfg.max_feedrate <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "axis {} acceleration and feedrate must be positive",
                    axis
                )));
            }
            if cfg.min_switch.is_some() && cfg.travel <= 0.0 {
                return Err(ConfigError::ValidationError(format!(
                    "axis {} has a homing switch but no travel",
                    axis
                )));
            }
        }

        if !(0.0..=1.0).contains(&self.motion.cornering_factor) {
            return Err(ConfigError::ValidationError(
                "cornering_factor must be between 0 and 1".to_string(),
            ));
        }

        Ok(())
    }

    /// Looks up a heater by name.
    pub fn heater(&self, name: &str) -> Option<&HeaterConfig> {
        self.heaters.get(name)
    }

    /// Step rate a speed byte of 255 stands for on `controller`.
    pub fn max_step_rate(&self, controller: usize) -> f64 {
        self.controllers
            .get(controller)
            .map_or(DEFAULT_MAX_STEP_RATE, |c| c.max_step_rate)
    }
}

/// Steps per second at full speed when a controller does not say otherwise.
pub const DEFAULT_MAX_STEP_RATE: f64 = 20_000.0;

fn default_max_step_rate() -> f64 {
    DEFAULT_MAX_STEP_RATE
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ControllerConfig {
    /// `host:port` of the controller link.
    pub address: String,
    /// Steps per second of the fastest motor at speed byte 255.
    #[serde(default = "default_max_step_rate")]
    pub max_step_rate: f64,
}

/// One logical axis.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AxisConfig {
    /// Primary stepper first, optional second motor after it.
    pub steppers: Vec<StepperMapping>,
    pub steps_per_mm: f64,
    /// mm/s²
    pub max_acceleration: f64,
    /// mm/s
    pub max_feedrate: f64,
    /// Length of travel in mm, used to size homing moves.
    #[serde(default)]
    pub travel: f64,
    #[serde(default)]
    pub min_switch: Option<SwitchConfig>,
    #[serde(default)]
    pub max_switch: Option<SwitchConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepperMapping {
    pub controller: usize,
    pub stepper: u8,
    #[serde(default)]
    pub direction_inverted: bool,
    /// Overrides the axis acceleration for this motor.
    #[serde(default)]
    pub max_acceleration: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwitchConfig {
    pub controller: usize,
    pub input: u8,
    /// Triggered reads low instead of high.
    #[serde(default)]
    pub inverted: bool,
}

impl SwitchConfig {
    pub fn is_triggered(&self, high: bool) -> bool {
        high != self.inverted
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaterConfig {
    pub controller: usize,
    pub heater: u8,
    pub sensor: u8,
}

/// Planner tuning.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MotionConfig {
    /// mm/s when a move names no feedrate.
    pub default_feedrate: f64,
    /// mm/s for homing moves.
    pub homing_feedrate: f64,
    /// Scales the corner speed between consecutive moves, 0 stops at every corner.
    pub cornering_factor: f64,
    pub switch_poll_interval_ms: u64,
    pub homing_timeout_ms: u64,
    /// Band in °C for set-and-wait heater commands.
    pub temperature_tolerance: f64,
    pub temperature_timeout_secs: u64,
}

impl Default for MotionConfig {
    fn default() -> Self {
        Self {
            default_feedrate: 50.0,
            homing_feedrate: 25.0,
            cornering_factor: 1.0,
            switch_poll_interval_ms: 20,
            homing_timeout_ms: 30_000,
            temperature_tolerance: 2.0,
            temperature_timeout_secs: 600,
        }
    }
}

impl MotionConfig {
    pub fn switch_poll_interval(&self) -> Duration {
        Duration::from_millis(self.switch_poll_interval_ms.max(1))
    }

    pub fn homing_timeout(&self) -> Duration {
        Duration::from_millis(self.homing_timeout_ms)
    }

    pub fn temperature_timeout(&self) -> Duration {
        Duration::from_secs(self.temperature_timeout_secs)
    }
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
