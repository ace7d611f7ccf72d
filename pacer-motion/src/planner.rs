//! Motion planner.
//!
//! Turns relative moves in millimetres into per-controller linear move slots:
//!
//! - steps come from each motor's carry-preserving conversion
//! - acceleration is capped by the ceiling of the axis combination in use
//! - the end speed of a move depends on the move queued after it
//! - moves longer than one slot can carry are split into ordered parts
//!
//! One move is held back so its successor is known before it is converted.

use crate::axis::{Axis, AxisArray, AXIS_COUNT};
use crate::config::{MachineConfig, SwitchConfig};
use crate::error::MotionError;
use crate::stepper::{ControllerAbilities, Stepper};
use pacer_client::{Client, ClientError};
use pacer_core::{BasicLinearMove, Slot, MAX_SLOT_STEPS};
use pacer_protocol::DeviceType;
use std::collections::{BTreeMap, VecDeque};
use std::sync::Arc;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Moves held back before conversion.
const LOOKAHEAD: usize = 1;

/// Moves shorter than this are treated as no motion.
const MIN_DISTANCE: f64 = 1e-9;

/// Homing moves cover this multiple of the axis travel.
const HOMING_TRAVEL_FACTOR: f64 = 1.5;

/// A move in millimetres relative to the current position.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelativeMove {
    pub deltas: AxisArray<f64>,
    /// mm/s; the configured default applies when unset.
    pub feedrate: Option<f64>,
}

impl RelativeMove {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, axis: Axis, distance: f64) -> Self {
        self.deltas[axis.index()] = distance;
        self
    }

    pub fn with_feedrate(mut self, feedrate: f64) -> Self {
        self.feedrate = Some(feedrate);
        self
    }

    /// Axes with a non-zero distance, in axis order.
    pub fn active_axes(&self) -> Vec<Axis> {
        Axis::ALL
            .into_iter()
            .filter(|a| self.deltas[a.index()].abs() > MIN_DISTANCE)
            .collect()
    }

    pub fn is_empty(&self) -> bool {
        self.active_axes().is_empty()
    }

    fn cartesian_length(&self) -> f64 {
        Axis::ALL
            .into_iter()
            .filter(|a| a.is_cartesian())
            .map(|a| self.deltas[a.index()].powi(2))
            .sum::<f64>()
            .sqrt()
    }

    /// Path length: the XYZ distance, or the distance over every axis for
    /// moves without XYZ motion.
    pub fn length(&self) -> f64 {
        let cartesian = self.cartesian_length();
        if cartesian > MIN_DISTANCE {
            return cartesian;
        }
        self.deltas.iter().map(|d| d * d).sum::<f64>().sqrt()
    }

    /// Unit direction over XYZ, if the move has XYZ motion.
    fn cartesian_unit(&self) -> Option<[f64; 3]> {
        let length = self.cartesian_length();
        (length > MIN_DISTANCE).then(|| {
            [
                self.deltas[Axis::X.index()] / length,
                self.deltas[Axis::Y.index()] / length,
                self.deltas[Axis::Z.index()] / length,
            ]
        })
    }
}

/// Acceleration ceilings in mm/s² for the axis combinations moves use.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct AccelerationCeilings {
    per_axis: AxisArray<f64>,
    pub x: f64,
    pub y: f64,
    pub z: f64,
    pub xy: f64,
    pub xyz: f64,
}

impl AccelerationCeilings {
    fn new(steppers: &AxisArray<Option<Stepper>>) -> Self {
        let mut per_axis = [f64::INFINITY; AXIS_COUNT];
        for (slot, stepper) in per_axis.iter_mut().zip(steppers) {
            if let Some(stepper) = stepper {
                *slot = stepper.max_acceleration();
            }
        }

        let x = per_axis[Axis::X.index()];
        let y = per_axis[Axis::Y.index()];
        let z = per_axis[Axis::Z.index()];
        Self {
            per_axis,
            x,
            y,
            z,
            xy: x.min(y),
            xyz: x.min(y).min(z),
        }
    }

    /// Ceiling for a move over `active`.
    pub fn for_axes(&self, active: &[Axis]) -> f64 {
        let has = |axis| active.contains(&axis);
        let cartesian = match (has(Axis::X), has(Axis::Y), has(Axis::Z)) {
            (false, false, false) => f64::INFINITY,
            (true, false, false) => self.x,
            (false, true, false) => self.y,
            (false, false, true) => self.z,
            (true, true, false) => self.xy,
            _ => self.xyz,
        };
        active
            .iter()
            .filter(|a| !a.is_cartesian())
            .fold(cartesian, |ceiling, a| ceiling.min(self.per_axis[a.index()]))
    }
}

/// A slot bound for one controller.
#[derive(Debug, Clone, PartialEq)]
pub struct PlannedSlot {
    pub controller: usize,
    /// Index of this piece within a split move.
    pub part: u32,
    pub slot: Slot,
}

/// Queries how many steppers and inputs a controller has.
pub async fn query_abilities(client: &Client) -> Result<ControllerAbilities, ClientError> {
    Ok(ControllerAbilities {
        steppers: client.device_count(DeviceType::Stepper).await?,
        inputs: client.device_count(DeviceType::Input).await?,
    })
}

/// Host-side motion planner over one or more controllers.
pub struct Planner {
    config: MachineConfig,
    controllers: Vec<Arc<Client>>,
    steppers: AxisArray<Option<Stepper>>,
    ceilings: AccelerationCeilings,
    pending: VecDeque<RelativeMove>,
    position: AxisArray<f64>,
    entry_speed: f64,
    homing: AxisArray<bool>,
    last_error: Option<String>,
}

impl Planner {
    /// Registers the configured motors the controllers report, without links.
    pub fn configure(config: MachineConfig, abilities: &[ControllerAbilities]) -> Self {
        let mut steppers: AxisArray<Option<Stepper>> = Default::default();
        for (axis, axis_config) in &config.axes {
            match Stepper::from_config(*axis, axis_config, abilities) {
                Some(stepper) => steppers[axis.index()] = Some(stepper),
                None => warn!(axis = %axis, "Axis has no usable motors"),
            }
        }
        let ceilings = AccelerationCeilings::new(&steppers);

        debug!(
            x = ceilings.x,
            y = ceilings.y,
            z = ceilings.z,
            xy = ceilings.xy,
            xyz = ceilings.xyz,
            "Acceleration ceilings"
        );

        Self {
            config,
            controllers: Vec::new(),
            steppers,
            ceilings,
            pending: VecDeque::new(),
            position: [0.0; AXIS_COUNT],
            entry_speed: 0.0,
            homing: [false; AXIS_COUNT],
            last_error: None,
        }
    }

    /// Queries each controller, configures, then hands motors to the planner.
    ///
    /// `controllers[i]` is controller index `i` in the machine configuration.
    pub async fn connect(
        config: MachineConfig,
        controllers: Vec<Arc<Client>>,
    ) -> Result<Self, MotionError> {
        let mut abilities = Vec::with_capacity(controllers.len());
        for client in &controllers {
            abilities.push(query_abilities(client).await?);
        }

        let mut planner = Self::configure(config, &abilities);
        planner.controllers = controllers;
        planner.enable_motors(true).await?;

        info!(
            controllers = planner.controllers.len(),
            axes = planner.steppers.iter().flatten().count(),
            "Planner configured"
        );
        Ok(planner)
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn ceilings(&self) -> &AccelerationCeilings {
        &self.ceilings
    }

    pub fn stepper(&self, axis: Axis) -> Option<&Stepper> {
        self.steppers[axis.index()].as_ref()
    }

    pub fn controller(&self, index: usize) -> Option<&Arc<Client>> {
        self.controllers.get(index)
    }

    pub fn controllers(&self) -> &[Arc<Client>] {
        &self.controllers
    }

    /// Position in mm including moves not yet sent.
    pub fn position(&self) -> AxisArray<f64> {
        self.position
    }

    /// Redefines the current position of `axis` without moving.
    pub fn set_position(&mut self, axis: Axis, value: f64) {
        self.position[axis.index()] = value;
    }

    pub fn pending_moves(&self) -> usize {
        self.pending.len()
    }

    /// Display string of the most recent failed operation.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Drops moves not yet sent, after the controllers cleared their queues.
    ///
    /// The position is wound back by the dropped moves.
    pub fn discard_pending(&mut self) {
        if !self.pending.is_empty() {
            warn!(moves = self.pending.len(), "Discarding unsent moves");
        }
        for mv in self.pending.drain(..) {
            for axis in mv.active_axes() {
                self.position[axis.index()] -= mv.deltas[axis.index()];
            }
        }
        self.entry_speed = 0.0;
    }

    /// Enables or disables every registered motor.
    ///
    /// Enabling also hands stepper control to the queue.
    pub async fn enable_motors(&mut self, enable: bool) -> Result<(), MotionError> {
        let result = self.set_motors(enable).await;
        self.record(result)
    }

    async fn set_motors(&mut self, enable: bool) -> Result<(), MotionError> {
        self.flush_pending().await?;

        let mut per_controller: BTreeMap<usize, Vec<(u8, bool)>> = BTreeMap::new();
        for motor in self.steppers.iter().flatten().flat_map(|s| &s.motors) {
            per_controller
                .entry(motor.controller)
                .or_default()
                .push((motor.stepper, enable));
        }

        for (controller, motors) in per_controller {
            let client = self.client(controller)?;
            if enable {
                client.activate_stepper_control(true).await?;
            }
            client.enable_steppers(&motors).await?;
        }
        Ok(())
    }

    /// Queues a move, sending the one before it once its successor is known.
    pub async fn submit_relative_move(&mut self, mv: RelativeMove) -> Result<(), MotionError> {
        let result = self.submit(mv).await;
        self.record(result)
    }

    async fn submit(&mut self, mv: RelativeMove) -> Result<(), MotionError> {
        self.check_move(&mv)?;
        if mv.is_empty() {
            return Ok(());
        }

        // A failed send leaves `mv` unqueued and the earlier move pending.
        while self.pending.len() >= LOOKAHEAD {
            let Some(current) = self.pending.front().cloned() else {
                break;
            };
            let next = self.pending.get(1).cloned().unwrap_or_else(|| mv.clone());
            self.convert(&current, Some(&next)).await?;
            self.pending.pop_front();
        }

        for axis in mv.active_axes() {
            self.position[axis.index()] += mv.deltas[axis.index()];
        }
        self.pending.push_back(mv);
        Ok(())
    }

    /// Sends every held move, the last one ending at rest.
    pub async fn flush(&mut self) -> Result<(), MotionError> {
        let result = self.flush_pending().await;
        self.record(result)
    }

    async fn flush_pending(&mut self) -> Result<(), MotionError> {
        while let Some(current) = self.pending.front().cloned() {
            let next = self.pending.get(1).cloned();
            self.convert(&current, next.as_ref()).await?;
            self.pending.pop_front();
        }
        self.entry_speed = 0.0;
        Ok(())
    }

    /// Plans and sends one move.
    ///
    /// On failure the step carries and entry speed are restored, so the move
    /// can be planned again from the same state.
    async fn convert(
        &mut self,
        mv: &RelativeMove,
        next: Option<&RelativeMove>,
    ) -> Result<(), MotionError> {
        let steppers = self.steppers.clone();
        let entry_speed = self.entry_speed;

        let result = match self.plan_move(mv, next) {
            Ok(slots) => self.send(slots).await,
            Err(e) => Err(e),
        };
        if result.is_err() {
            self.steppers = steppers;
            self.entry_speed = entry_speed;
        }
        result
    }

    /// Homes `axes` toward their minimum switches; empty means every axis
    /// that has one.
    pub async fn home(&mut self, axes: &[Axis]) -> Result<(), MotionError> {
        let result = self.home_axes(axes).await;
        self.record(result)
    }

    async fn home_axes(&mut self, axes: &[Axis]) -> Result<(), MotionError> {
        self.flush_pending().await?;

        let mut axes: Vec<Axis> = if axes.is_empty() {
            Axis::ALL
                .into_iter()
                .filter(|a| self.steppers[a.index()].is_some() && self.min_switch(*a).is_some())
                .collect()
        } else {
            axes.to_vec()
        };
        axes.sort();
        axes.dedup();
        if axes.is_empty() {
            return Ok(());
        }

        let mut mv = RelativeMove::new().with_feedrate(self.config.motion.homing_feedrate);
        for &axis in &axes {
            if self.steppers[axis.index()].is_none() {
                return Err(MotionError::NotConfigured(axis));
            }
            let travel = self.config.axes.get(&axis).map_or(0.0, |c| c.travel);
            if self.min_switch(axis).is_none() || travel <= 0.0 {
                return Err(MotionError::NoHomingSwitch(axis));
            }
            mv.deltas[axis.index()] = -HOMING_TRAVEL_FACTOR * travel;
        }

        info!(axes = ?axes, "Homing");
        for &axis in &axes {
            self.homing[axis.index()] = true;
            self.reset_carry(axis);
        }

        let result = self.run_homing(&mv, &axes).await;

        for &axis in &axes {
            self.homing[axis.index()] = false;
            self.reset_carry(axis);
        }
        result?;

        for &axis in &axes {
            self.position[axis.index()] = 0.0;
        }
        info!(axes = ?axes, "Homing complete");
        Ok(())
    }

    async fn run_homing(&mut self, mv: &RelativeMove, axes: &[Axis]) -> Result<(), MotionError> {
        let slots = self.plan_move(mv, None)?;
        self.entry_speed = 0.0;
        self.send(slots).await?;

        let poll = self.config.motion.switch_poll_interval();
        let deadline = Instant::now() + self.config.motion.homing_timeout();

        for &axis in axes {
            let switch = self
                .min_switch(axis)
                .ok_or(MotionError::NoHomingSwitch(axis))?;
            let client = self.client(switch.controller)?;
            loop {
                let levels = client.read_inputs(&[switch.input]).await?;
                if levels.first().is_some_and(|high| switch.is_triggered(*high)) {
                    debug!(axis = %axis, "Switch triggered");
                    break;
                }
                if Instant::now() >= deadline {
                    return Err(MotionError::HomingTimeout(axis));
                }
                tokio::time::sleep(poll).await;
            }
        }
        Ok(())
    }

    /// Converts one move into slots ordered by controller, then part.
    ///
    /// `next` is the move queued after this one, if any; without it the move
    /// ends at rest.
    pub fn plan_move(
        &mut self,
        mv: &RelativeMove,
        next: Option<&RelativeMove>,
    ) -> Result<Vec<PlannedSlot>, MotionError> {
        self.check_move(mv)?;
        let active = mv.active_axes();
        if active.is_empty() {
            return Ok(Vec::new());
        }

        let length = mv.length();
        let acceleration = self.ceilings.for_axes(&active);
        let max_speed = self.max_speed(mv);
        let feedrate = self.feedrate(mv).min(max_speed);
        let start = self.entry_speed.min(feedrate);
        let end = match next {
            Some(next) => self
                .junction_speed(mv, feedrate, next)
                .min((start * start + 2.0 * acceleration * length).sqrt()),
            None => 0.0,
        };
        let (accel_mm, decel_mm) = ramp_distances(start, feedrate, end, acceleration, length);
        self.entry_speed = end;

        let homing = active.iter().any(|a| self.homing[a.index()]);

        let mut per_controller: BTreeMap<usize, Vec<(u8, i64)>> = BTreeMap::new();
        for &axis in &active {
            let distance = mv.deltas[axis.index()];
            let stepper = self.steppers[axis.index()]
                .as_mut()
                .ok_or(MotionError::NotConfigured(axis))?;
            let steps_per_mm = stepper.steps_per_mm;
            for motor in &mut stepper.motors {
                let steps = motor.take_steps(distance, steps_per_mm);
                if steps != 0 {
                    per_controller
                        .entry(motor.controller)
                        .or_default()
                        .push((motor.stepper, steps));
                }
            }
        }

        let mut planned = Vec::new();
        for (controller, axes) in per_controller {
            let Some(&(primary, primary_steps)) =
                axes.iter().max_by_key(|(stepper, steps)| (steps.unsigned_abs(), u8::MAX - stepper))
            else {
                continue;
            };
            let steps_per_mm = primary_steps.unsigned_abs() as f64 / length;
            let max_step_rate = self.config.max_step_rate(controller);
            let nominal = speed_fraction(feedrate * steps_per_mm, max_step_rate).max(1);
            let ramps = Ramps {
                nominal,
                end: speed_fraction(end * steps_per_mm, max_step_rate).min(nominal),
                acceleration: (accel_mm * steps_per_mm).round() as u64,
                deceleration: (decel_mm * steps_per_mm).round() as u64,
                homing,
            };
            planned.extend(split_move(controller, &axes, primary, &ramps)?);
        }

        Ok(planned)
    }

    fn check_move(&self, mv: &RelativeMove) -> Result<(), MotionError> {
        if mv.deltas.iter().any(|d| !d.is_finite()) {
            return Err(MotionError::InvalidMove("distance is not finite"));
        }
        if let Some(feedrate) = mv.feedrate {
            if !(feedrate > 0.0 && feedrate.is_finite()) {
                return Err(MotionError::InvalidMove("feedrate must be positive"));
            }
        }
        match mv
            .active_axes()
            .into_iter()
            .find(|a| self.steppers[a.index()].is_none())
        {
            Some(axis) => Err(MotionError::NotConfigured(axis)),
            None => Ok(()),
        }
    }

    fn feedrate(&self, mv: &RelativeMove) -> f64 {
        mv.feedrate.unwrap_or(self.config.motion.default_feedrate)
    }

    /// Fastest path speed at which no axis exceeds its own feedrate limit
    /// and no motor steps faster than its controller's ceiling.
    fn max_speed(&self, mv: &RelativeMove) -> f64 {
        let length = mv.length();
        mv.active_axes()
            .into_iter()
            .filter_map(|axis| self.steppers[axis.index()].as_ref().map(|s| (axis, s)))
            .flat_map(|(axis, stepper)| {
                let share = mv.deltas[axis.index()].abs() / length;
                let steps_per_path_mm = share * stepper.steps_per_mm;
                std::iter::once(stepper.max_feedrate / share).chain(
                    stepper.motors.iter().map(move |motor| {
                        self.config.max_step_rate(motor.controller) / steps_per_path_mm
                    }),
                )
            })
            .fold(f64::INFINITY, f64::min)
    }

    /// Speed to carry from `current` into `next`.
    ///
    /// Follows the cosine of the XYZ angle between the moves. Moves without
    /// XYZ motion meet at rest, and `next` must be able to stop within its
    /// own length.
    fn junction_speed(&self, current: &RelativeMove, feedrate: f64, next: &RelativeMove) -> f64 {
        let (Some(u), Some(w)) = (current.cartesian_unit(), next.cartesian_unit()) else {
            return 0.0;
        };
        let cos = (u[0] * w[0] + u[1] * w[1] + u[2] * w[2]).max(0.0);
        let next_feedrate = self.feedrate(next).min(self.max_speed(next));
        let next_acceleration = self.ceilings.for_axes(&next.active_axes());

        let speed = feedrate.min(next_feedrate) * cos * self.config.motion.cornering_factor;
        speed.min((2.0 * next_acceleration * next.length()).sqrt())
    }

    fn min_switch(&self, axis: Axis) -> Option<SwitchConfig> {
        self.config.axes.get(&axis).and_then(|c| c.min_switch)
    }

    fn reset_carry(&mut self, axis: Axis) {
        if let Some(stepper) = self.steppers[axis.index()].as_mut() {
            stepper.reset_carry();
        }
    }

    fn client(&self, controller: usize) -> Result<Arc<Client>, MotionError> {
        self.controllers
            .get(controller)
            .cloned()
            .ok_or(MotionError::NoController(controller))
    }

    async fn send(&mut self, planned: Vec<PlannedSlot>) -> Result<(), MotionError> {
        let mut per_controller: BTreeMap<usize, Vec<Slot>> = BTreeMap::new();
        for p in planned {
            per_controller.entry(p.controller).or_default().push(p.slot);
        }

        for (controller, slots) in per_controller {
            let client = self.client(controller)?;
            let status = client.queue_slots(&slots).await?;
            debug!(
                controller,
                slots = slots.len(),
                used = status.used,
                available = status.available,
                "Queued move"
            );
        }
        Ok(())
    }

    fn record<T>(&mut self, result: Result<T, MotionError>) -> Result<T, MotionError> {
        if let Err(ref e) = result {
            warn!("Motion failed: {}", e);
            self.last_error = Some(e.to_string());
        }
        result
    }
}

/// Speed profile shared by the parts of one move, in slot units.
struct Ramps {
    nominal: u8,
    end: u8,
    acceleration: u64,
    deceleration: u64,
    homing: bool,
}

/// Acceleration and deceleration distances in mm, shortened to a triangle
/// profile when the move is too short to reach `feedrate`.
fn ramp_distances(start: f64, feedrate: f64, end: f64, acceleration: f64, length: f64) -> (f64, f64) {
    if !(acceleration > 0.0 && acceleration.is_finite()) {
        return (0.0, 0.0);
    }
    let accel = ((feedrate * feedrate - start * start) / (2.0 * acceleration)).max(0.0);
    let decel = ((feedrate * feedrate - end * end) / (2.0 * acceleration)).max(0.0);
    if accel + decel <= length {
        return (accel, decel);
    }

    let accel = ((length + (end * end - start * start) / (2.0 * acceleration)) / 2.0).clamp(0.0, length);
    (accel, length - accel)
}

/// Step rate of the primary motor as a fraction of the controller's
/// ceiling, scaled to 0..=255.
///
/// The same mm/s on the same motor always encodes the same byte.
fn speed_fraction(step_rate: f64, max_step_rate: f64) -> u8 {
    if !(max_step_rate > 0.0 && max_step_rate.is_finite()) {
        return u8::MAX;
    }
    (step_rate / max_step_rate * u8::MAX as f64)
        .round()
        .clamp(0.0, u8::MAX as f64) as u8
}

/// Splits one controller's share of a move into slots of at most
/// [`MAX_SLOT_STEPS`] per axis.
///
/// Remainder steps go to the earliest parts. Acceleration happens in the
/// first part and deceleration in the last.
fn split_move(
    controller: usize,
    axes: &[(u8, i64)],
    primary: u8,
    ramps: &Ramps,
) -> Result<Vec<PlannedSlot>, MotionError> {
    let max_steps = axes.iter().map(|(_, s)| s.unsigned_abs()).max().unwrap_or(0);
    let parts = max_steps / MAX_SLOT_STEPS as u64 + 1;

    let mut planned = Vec::with_capacity(parts as usize);
    for part in 0..parts {
        let last = part + 1 == parts;
        let mut linear = BasicLinearMove::new(primary);
        linear.homing = ramps.homing;
        linear.nominal_speed = ramps.nominal;
        linear.end_speed = if last { ramps.end } else { ramps.nominal };

        for &(axis, steps) in axes {
            let total = steps.unsigned_abs();
            let share = total / parts + u64::from(part < total % parts);
            let share = share as i32;
            linear.set_axis(axis, if steps < 0 { -share } else { share })?;
        }

        let primary_steps = linear.steps(primary).map_or(0, |s| s.unsigned_abs() as u64);
        let acceleration = if part == 0 {
            ramps.acceleration.min(primary_steps)
        } else {
            0
        };
        let deceleration = if last {
            ramps.deceleration.min(primary_steps - acceleration)
        } else {
            0
        };
        linear.acceleration_steps = acceleration.min(u16::MAX as u64) as u16;
        linear.deceleration_steps = deceleration.min(u16::MAX as u64) as u16;

        planned.push(PlannedSlot {
            controller,
            part: part as u32,
            slot: Slot::BasicLinearMove(linear),
        });
    }

    Ok(planned)
}
