//! G-code command dispatcher.
//!
//! Maps one text line to planner and controller calls and renders one
//! response line: `ok`, `ok <data>` or `Error: <message>`.

use crate::gcode::{self, Line, ParseError};
use pacer_client::ClientError;
use pacer_core::Slot;
use pacer_motion::{Axis, MotionError, Planner, RelativeMove};
use pacer_protocol::{DeviceType, ResumeFlags};
use std::collections::{BTreeMap, BTreeSet};
use thiserror::Error;
use tracing::{debug, info, warn};

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("{0}")]
    Parse(#[from] ParseError),

    #[error("{0}")]
    Motion(#[from] MotionError),

    #[error("{0}")]
    Client(#[from] ClientError),

    #[error("unsupported command {0}{1}")]
    Unsupported(char, u32),

    #[error("missing parameter {0}")]
    MissingParameter(char),

    #[error("no heater named '{0}'")]
    UnknownHeater(String),
}

/// Heater used by M104/M109.
pub const TOOL_HEATER: &str = "hotend";
/// Heater used by M140/M190.
pub const BED_HEATER: &str = "bed";

pub struct Dispatcher {
    planner: Planner,
    absolute: bool,
    /// Modal feedrate in mm/s.
    feedrate: Option<f64>,
    targets: BTreeMap<String, f64>,
    configured_heaters: BTreeSet<String>,
}

impl Dispatcher {
    pub fn new(planner: Planner) -> Self {
        Self {
            planner,
            absolute: true,
            feedrate: None,
            targets: BTreeMap::new(),
            configured_heaters: BTreeSet::new(),
        }
    }

    pub fn planner(&self) -> &Planner {
        &self.planner
    }

    /// Sends moves still held by the planner.
    pub async fn flush(&mut self) -> Result<(), DispatchError> {
        self.planner.flush().await?;
        Ok(())
    }

    /// Handles one request line and returns its response line.
    pub async fn handle_line(&mut self, text: &str) -> String {
        match self.dispatch(text).await {
            Ok(None) => "ok".to_string(),
            Ok(Some(data)) => format!("ok {}", data),
            Err(e) => {
                warn!(line = text, "Command failed: {}", e);
                format!("Error: {}", e)
            }
        }
    }

    async fn dispatch(&mut self, text: &str) -> Result<Option<String>, DispatchError> {
        let Some(line) = gcode::parse_line(text)? else {
            return Ok(None);
        };
        debug!(line = text, "Dispatching");

        match line.code() {
            ('G', 0) | ('G', 1) => self.linear_move(&line).await?,
            ('G', 4) => self.dwell(&line).await?,
            ('G', 28) => self.home(&line).await?,
            ('G', 90) => self.absolute = true,
            ('G', 91) => self.absolute = false,
            ('G', 92) => self.set_position(&line),
            ('M', 17) => self.planner.enable_motors(true).await?,
            ('M', 18) | ('M', 84) => self.planner.enable_motors(false).await?,
            ('M', 104) => self.set_heater(TOOL_HEATER, &line, false).await?,
            ('M', 109) => self.set_heater(TOOL_HEATER, &line, true).await?,
            ('M', 140) => self.set_heater(BED_HEATER, &line, false).await?,
            ('M', 190) => self.set_heater(BED_HEATER, &line, true).await?,
            ('M', 105) => return self.report_temperatures().await.map(Some),
            ('M', 112) => self.emergency_stop().await?,
            ('M', 114) => return Ok(Some(self.report_position())),
            ('M', 999) => self.resume().await?,
            ('T', index) => self.select_tool(index).await?,
            (letter, code) => return Err(DispatchError::Unsupported(letter, code)),
        }
        Ok(None)
    }

    async fn linear_move(&mut self, line: &Line) -> Result<(), DispatchError> {
        if let Some(f) = line.arg('F') {
            self.feedrate = Some(f / 60.0);
        }

        let position = self.planner.position();
        let mut mv = RelativeMove::new();
        mv.feedrate = self.feedrate;
        for axis in Axis::ALL {
            if let Some(value) = line.arg(axis.letter()) {
                mv.deltas[axis.index()] = if self.absolute {
                    value - position[axis.index()]
                } else {
                    value
                };
            }
        }
        self.planner.submit_relative_move(mv).await?;
        Ok(())
    }

    async fn dwell(&mut self, line: &Line) -> Result<(), DispatchError> {
        let millis = match (line.arg('P'), line.arg('S')) {
            (Some(p), _) => p,
            (None, Some(s)) => s * 1000.0,
            (None, None) => return Err(DispatchError::MissingParameter('P')),
        };
        let micros = (millis.max(0.0) * 1000.0).min(u32::MAX as f64) as u32;
        self.planner.flush().await?;
        self.queue_everywhere(Slot::Delay { micros }).await
    }

    async fn home(&mut self, line: &Line) -> Result<(), DispatchError> {
        let axes: Vec<Axis> = Axis::ALL
            .into_iter()
            .filter(|axis| line.has(axis.letter()))
            .collect();
        self.planner.home(&axes).await?;
        Ok(())
    }

    fn set_position(&mut self, line: &Line) {
        let mut any = false;
        for axis in Axis::ALL {
            if let Some(value) = line.arg(axis.letter()) {
                self.planner.set_position(axis, value);
                any = true;
            }
        }
        if !any {
            for axis in Axis::ALL {
                self.planner.set_position(axis, 0.0);
            }
        }
    }

    async fn set_heater(&mut self, name: &str, line: &Line, wait: bool) -> Result<(), DispatchError> {
        let target = line.arg('S').ok_or(DispatchError::MissingParameter('S'))?;
        let heater = *self
            .planner
            .config()
            .heater(name)
            .ok_or_else(|| DispatchError::UnknownHeater(name.to_string()))?;
        let client = self
            .planner
            .controller(heater.controller)
            .cloned()
            .ok_or(MotionError::NoController(heater.controller))?;

        if !self.configured_heaters.contains(name) {
            client.configure_heater(heater.heater, heater.sensor).await?;
            self.configured_heaters.insert(name.to_string());
        }
        client.set_heater_target(heater.heater, target).await?;
        self.targets.insert(name.to_string(), target);
        info!(heater = name, target, "Heater target set");

        if wait && target > 0.0 {
            let motion = &self.planner.config().motion;
            let reading = client
                .wait_for_temperature(
                    (DeviceType::TemperatureSensor, heater.sensor),
                    target,
                    motion.temperature_tolerance,
                    motion.temperature_timeout(),
                )
                .await?;
            info!(heater = name, reading, "Heater reached target");
        }
        Ok(())
    }

    async fn report_temperatures(&self) -> Result<String, DispatchError> {
        let mut parts = Vec::new();
        for (name, heater) in &self.planner.config().heaters {
            let client = self
                .planner
                .controller(heater.controller)
                .ok_or(MotionError::NoController(heater.controller))?;
            let reading = client
                .temperatures(&[(DeviceType::TemperatureSensor, heater.sensor)])
                .await?
                .first()
                .copied()
                .flatten();
            let target = self.targets.get(name).copied().unwrap_or(0.0);
            match reading {
                Some(celsius) => parts.push(format!("{}:{:.1} /{:.1}", name, celsius, target)),
                None => parts.push(format!("{}:-- /{:.1}", name, target)),
            }
        }
        Ok(parts.join(" "))
    }

    fn report_position(&self) -> String {
        let position = self.planner.position();
        Axis::ALL
            .into_iter()
            .filter(|axis| self.planner.stepper(*axis).is_some())
            .map(|axis| format!("{}:{:.3}", axis, position[axis.index()]))
            .collect::<Vec<_>>()
            .join(" ")
    }

    async fn emergency_stop(&mut self) -> Result<(), DispatchError> {
        self.planner.discard_pending();
        let mut first_error = None;
        for client in self.planner.controllers() {
            if let Err(e) = client.emergency_stop().await {
                warn!("Emergency stop failed: {}", e);
                first_error.get_or_insert(e);
            }
        }
        self.forget_heaters();
        match first_error {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }

    async fn resume(&mut self) -> Result<(), DispatchError> {
        self.planner.discard_pending();
        for client in self.planner.controllers() {
            client.resume(ResumeFlags::clear()).await?;
        }
        self.forget_heaters();
        self.planner.enable_motors(true).await?;
        Ok(())
    }

    async fn select_tool(&mut self, index: u32) -> Result<(), DispatchError> {
        let index = u8::try_from(index).map_err(|_| DispatchError::Unsupported('T', index))?;
        self.planner.flush().await?;
        self.queue_everywhere(Slot::ActiveToolhead { index }).await
    }

    async fn queue_everywhere(&self, slot: Slot) -> Result<(), DispatchError> {
        for client in self.planner.controllers() {
            client.queue_slots(std::slice::from_ref(&slot)).await?;
        }
        Ok(())
    }

    /// Entering the stopped state drops heater targets on the controller.
    fn forget_heaters(&mut self) {
        self.targets.clear();
        self.configured_heaters.clear();
    }
}
