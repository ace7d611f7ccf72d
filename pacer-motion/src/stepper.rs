//! Axis-to-motor mapping and step conversion.
//!
//! Each motor keeps the fractional step left over from the previous move so
//! the sum of emitted steps never drifts from the commanded distance.

use crate::axis::Axis;
use crate::config::{AxisConfig, StepperMapping};
use tracing::warn;

/// Guards `floor` against results like 1234.9999999 for exact step counts.
const ROUNDING_EPSILON: f64 = 1e-9;

/// Stepper and input counts reported by a controller.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ControllerAbilities {
    pub steppers: u8,
    pub inputs: u8,
}

/// One physical motor driving an axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Motor {
    pub controller: usize,
    pub stepper: u8,
    pub direction_inverted: bool,
    /// mm/s²
    pub max_acceleration: f64,
    carry: f64,
}

impl Motor {
    pub fn new(mapping: &StepperMapping, axis_acceleration: f64) -> Self {
        Self {
            controller: mapping.controller,
            stepper: mapping.stepper,
            direction_inverted: mapping.direction_inverted,
            max_acceleration: mapping.max_acceleration.unwrap_or(axis_acceleration),
            carry: 0.0,
        }
    }

    /// Converts a signed distance to whole steps, carrying the remainder.
    pub fn take_steps(&mut self, distance_mm: f64, steps_per_mm: f64) -> i64 {
        let exact = distance_mm * steps_per_mm + self.carry;
        let whole = (exact + ROUNDING_EPSILON).floor();
        self.carry = exact - whole;
        let steps = whole as i64;
        if self.direction_inverted {
            -steps
        } else {
            steps
        }
    }

    /// Fractional step not yet emitted.
    pub fn carry(&self) -> f64 {
        self.carry
    }

    pub fn reset_carry(&mut self) {
        self.carry = 0.0;
    }
}

/// The motors behind one logical axis.
#[derive(Debug, Clone, PartialEq)]
pub struct Stepper {
    pub axis: Axis,
    pub steps_per_mm: f64,
    /// mm/s
    pub max_feedrate: f64,
    pub motors: Vec<Motor>,
}

impl Stepper {
    /// Builds the axis from configuration, dropping motors the controllers lack.
    ///
    /// Returns `None` when no configured motor exists.
    pub fn from_config(
        axis: Axis,
        config: &AxisConfig,
        abilities: &[ControllerAbilities],
    ) -> Option<Self> {
        let motors: Vec<Motor> = config
            .steppers
            .iter()
            .filter(|mapping| {
                let present = abilities
                    .get(mapping.controller)
                    .is_some_and(|a| mapping.stepper < a.steppers);
                if !present {
                    warn!(
                        axis = %axis,
                        controller = mapping.controller,
                        stepper = mapping.stepper,
                        "Configured stepper not reported by controller"
                    );
                }
                present
            })
            .map(|mapping| Motor::new(mapping, config.max_acceleration))
            .collect();

        if motors.is_empty() {
            return None;
        }

        Some(Self {
            axis,
            steps_per_mm: config.steps_per_mm,
            max_feedrate: config.max_feedrate,
            motors,
        })
    }

    /// Lowest acceleration among the axis motors.
    pub fn max_acceleration(&self) -> f64 {
        self.motors
            .iter()
            .map(|m| m.max_acceleration)
            .fold(f64::INFINITY, f64::min)
    }

    pub fn reset_carry(&mut self) {
        for motor in &mut self.motors {
            motor.reset_carry();
        }
    }
}
