//! Simulated devices attached to the controller.

use crate::config::{DeviceConfig, FirmwareConfig};
use crate::error::SimError;
use pacer_protocol::DeviceType;

/// Output drive state as carried by `SetOutput`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputDrive {
    Low,
    High,
    Disabled,
}

impl TryFrom<u8> for OutputDrive {
    type Error = SimError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(OutputDrive::Low),
            1 => Ok(OutputDrive::High),
            2 => Ok(OutputDrive::Disabled),
            _ => Err(SimError::BadParameterValue("output state")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct Input {
    pub name: String,
    pub high: bool,
}

#[derive(Debug, Clone)]
pub struct Output {
    pub name: String,
    pub drive: OutputDrive,
}

#[derive(Debug, Clone)]
pub struct PwmChannel {
    pub name: String,
    pub duty: u16,
}

#[derive(Debug, Clone)]
pub struct Stepper {
    pub name: String,
    pub enabled: bool,
    /// Absolute position in steps since the last homing.
    pub position: i64,
    pub endstop: Option<u8>,
}

#[derive(Debug, Clone)]
pub struct Heater {
    pub name: String,
    pub sensor: Option<u8>,
    /// Target in degrees Celsius; `None` when switched off.
    pub target: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct Sensor {
    pub name: String,
    pub celsius: f64,
}

/// Every device on the board, indexed by device number.
#[derive(Debug, Clone)]
pub struct Devices {
    pub inputs: Vec<Input>,
    pub outputs: Vec<Output>,
    pub pwm: Vec<PwmChannel>,
    pub buzzers: Vec<PwmChannel>,
    pub steppers: Vec<Stepper>,
    pub heaters: Vec<Heater>,
    pub sensors: Vec<Sensor>,
    /// Set by `ActivateStepperControl`; moves are refused without it.
    pub stepper_control: bool,
    pub active_toolhead: u8,
}

impl Devices {
    /// Builds the power-on device state.
    pub fn new(devices: &DeviceConfig, firmware: &FirmwareConfig) -> Self {
        let pwm = |list: &[crate::config::NamedDevice]| {
            list.iter()
                .map(|d| PwmChannel {
                    name: d.name.clone(),
                    duty: 0,
                })
                .collect()
        };

        Self {
            inputs: devices
                .inputs
                .iter()
                .map(|d| Input {
                    name: d.name.clone(),
                    high: false,
                })
                .collect(),
            outputs: devices
                .outputs
                .iter()
                .map(|d| Output {
                    name: d.name.clone(),
                    drive: OutputDrive::Disabled,
                })
                .collect(),
            pwm: pwm(&devices.pwm),
            buzzers: pwm(&devices.buzzers),
            steppers: devices
                .steppers
                .iter()
                .map(|s| Stepper {
                    name: s.name.clone(),
                    enabled: false,
                    position: 0,
                    endstop: s.endstop,
                })
                .collect(),
            heaters: devices
                .heaters
                .iter()
                .map(|h| Heater {
                    name: h.name.clone(),
                    sensor: h.sensor,
                    target: None,
                })
                .collect(),
            sensors: devices
                .sensors
                .iter()
                .map(|s| Sensor {
                    name: s.name.clone(),
                    celsius: firmware.ambient_temperature,
                })
                .collect(),
            stepper_control: false,
            active_toolhead: 0,
        }
    }

    /// Number of devices of one type.
    pub fn count(&self, device: DeviceType) -> usize {
        match device {
            DeviceType::Input => self.inputs.len(),
            DeviceType::Output => self.outputs.len(),
            DeviceType::Pwm => self.pwm.len(),
            DeviceType::Stepper => self.steppers.len(),
            DeviceType::Heater => self.heaters.len(),
            DeviceType::TemperatureSensor => self.sensors.len(),
            DeviceType::Buzzer => self.buzzers.len(),
        }
    }

    /// Fails unless `number` addresses an existing device.
    pub fn check(&self, device: DeviceType, number: u8) -> Result<usize, SimError> {
        let index = number as usize;
        if index < self.count(device) {
            Ok(index)
        } else {
            Err(SimError::InvalidDeviceNumber { device, number })
        }
    }

    pub fn name(&self, device: DeviceType, number: u8) -> Result<&str, SimError> {
        let index = self.check(device, number)?;
        let name = match device {
            DeviceType::Input => &self.inputs[index].name,
            DeviceType::Output => &self.outputs[index].name,
            DeviceType::Pwm => &self.pwm[index].name,
            DeviceType::Stepper => &self.steppers[index].name,
            DeviceType::Heater => &self.heaters[index].name,
            DeviceType::TemperatureSensor => &self.sensors[index].name,
            DeviceType::Buzzer => &self.buzzers[index].name,
        };
        Ok(name)
    }

    /// Reading of a heater's sensor or a standalone sensor.
    pub fn temperature(&self, device: DeviceType, number: u8) -> Result<Option<f64>, SimError> {
        match device {
            DeviceType::Heater => {
                let index = self.check(device, number)?;
                Ok(self.heaters[index]
                    .sensor
                    .and_then(|s| self.sensors.get(s as usize))
                    .map(|s| s.celsius))
            }
            DeviceType::TemperatureSensor => {
                let index = self.check(device, number)?;
                Ok(Some(self.sensors[index].celsius))
            }
            other => Err(SimError::InvalidDeviceType(other as u8)),
        }
    }

    /// Switches every actuator off; positions and readings survive.
    pub fn make_safe(&mut self) {
        for output in &mut self.outputs {
            output.drive = OutputDrive::Disabled;
        }
        for channel in self.pwm.iter_mut().chain(self.buzzers.iter_mut()) {
            channel.duty = 0;
        }
        for stepper in &mut self.steppers {
            stepper.enabled = false;
        }
        for heater in &mut self.heaters {
            heater.target = None;
        }
        self.stepper_control = false;
    }

    /// Advances the thermal model by `dt` seconds.
    ///
    /// Driven sensors approach their heater target, the rest drift to ambient.
    pub fn thermal_step(&mut self, dt: f64, time_constant: f64, ambient: f64) {
        let alpha = 1.0 - (-dt / time_constant.max(f64::EPSILON)).exp();
        let mut goals = vec![ambient; self.sensors.len()];
        for heater in &self.heaters {
            if let (Some(sensor), Some(target)) = (heater.sensor, heater.target) {
                if let Some(goal) = goals.get_mut(sensor as usize) {
                    *goal = target;
                }
            }
        }
        for (sensor, goal) in self.sensors.iter_mut().zip(goals) {
            sensor.celsius += (goal - sensor.celsius) * alpha;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;

    fn devices() -> Devices {
        let config = Config::default();
        Devices::new(&config.devices, &config.firmware)
    }

    #[test]
    fn test_counts_and_names() {
        let devices = devices();
        assert_eq!(devices.count(DeviceType::Stepper), 4);
        assert_eq!(devices.name(DeviceType::Heater, 1).unwrap(), "bed");
        assert!(matches!(
            devices.name(DeviceType::Heater, 2),
            Err(SimError::InvalidDeviceNumber { number: 2, .. })
        ));
    }

    #[test]
    fn test_heater_reads_its_sensor() {
        let mut devices = devices();
        devices.sensors[0].celsius = 180.0;
        assert_eq!(
            devices.temperature(DeviceType::Heater, 0).unwrap(),
            Some(180.0)
        );
        devices.heaters[0].sensor = None;
        assert_eq!(devices.temperature(DeviceType::Heater, 0).unwrap(), None);
        assert!(matches!(
            devices.temperature(DeviceType::Output, 0),
            Err(SimError::InvalidDeviceType(0x02))
        ));
    }

    #[test]
    fn test_thermal_step_approaches_target() {
        let mut devices = devices();
        devices.heaters[0].target = Some(200.0);
        for _ in 0..200 {
            devices.thermal_step(0.1, 2.0, 20.0);
        }
        assert!((devices.sensors[0].celsius - 200.0).abs() < 0.1);
        assert!((devices.sensors[1].celsius - 20.0).abs() < 0.1);
    }

    #[test]
    fn test_make_safe() {
        let mut devices = devices();
        devices.steppers[0].enabled = true;
        devices.steppers[0].position = 40;
        devices.heaters[1].target = Some(60.0);
        devices.stepper_control = true;

        devices.make_safe();
        assert!(!devices.steppers[0].enabled);
        assert_eq!(devices.steppers[0].position, 40);
        assert_eq!(devices.heaters[1].target, None);
        assert!(!devices.stepper_control);
    }
}
