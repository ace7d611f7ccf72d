//! Order handlers.
//!
//! `OrderHandler` owns the simulated firmware state: devices, the command
//! queue and the stopped-state machine. Every order from every link passes
//! through [`OrderHandler::handle`].

use crate::config::Config;
use crate::device::{Devices, OutputDrive};
use crate::error::SimError;
use bytes::{BufMut, Bytes, BytesMut};
use pacer_core::CommandQueue;
use pacer_protocol::{
    DeviceType, InfoKind, Order, QueueErrorCode, QueueStatus, ReplyCode, ResumeFlags, StopCause,
    StopRecovery, StoppedInfo, PROTOCOL_VERSION,
};
use parking_lot::{Mutex, MutexGuard};
use tokio::sync::Notify;
use tracing::{debug, info, warn};

/// Raw temperature sent when a heater has no sensor.
const TEMPERATURE_UNAVAILABLE: i16 = 0x7FFF;

/// Reply produced for one order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: ReplyCode,
    pub params: Bytes,
    /// Set on the first reply reporting a stop the host did not cause.
    pub event: bool,
}

impl Response {
    fn ok(params: Bytes) -> Self {
        Self {
            code: ReplyCode::Ok,
            params,
            event: false,
        }
    }
}

#[derive(Debug)]
struct StopState {
    stopped: bool,
    acknowledged: bool,
    cause: StopCause,
    recovery: StopRecovery,
    reported: bool,
}

impl StopState {
    fn info(&self) -> StoppedInfo {
        StoppedInfo {
            acknowledged: self.acknowledged,
            recovery: self.recovery,
            cause: self.cause,
        }
    }
}

/// Order handler and firmware state.
pub struct OrderHandler {
    config: Config,
    devices: Mutex<Devices>,
    queue: CommandQueue,
    stop: Mutex<StopState>,
    work: Notify,
}

impl OrderHandler {
    /// Creates a handler in the power-on state: stopped by reset.
    pub fn new(config: Config) -> Self {
        let devices = Devices::new(&config.devices, &config.firmware);
        let queue = CommandQueue::new(config.firmware.queue_capacity);
        Self {
            config,
            devices: Mutex::new(devices),
            queue,
            stop: Mutex::new(StopState {
                stopped: true,
                acknowledged: false,
                cause: StopCause::Reset,
                recovery: StopRecovery::Recoverable,
                reported: false,
            }),
            work: Notify::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn queue(&self) -> &CommandQueue {
        &self.queue
    }

    /// Locks the device table.
    pub fn devices(&self) -> MutexGuard<'_, Devices> {
        self.devices.lock()
    }

    /// Signalled whenever slots are appended.
    pub(crate) fn work(&self) -> &Notify {
        &self.work
    }

    pub fn is_stopped(&self) -> bool {
        self.stop.lock().stopped
    }

    /// Current stop details, `None` while running.
    pub fn stopped_info(&self) -> Option<StoppedInfo> {
        let stop = self.stop.lock();
        stop.stopped.then(|| stop.info())
    }

    /// Simulates a board reboot when a new link comes up.
    pub fn boot(&self) {
        self.enter_stopped(StopCause::Reset, StopRecovery::Recoverable, false);
    }

    /// Enters the stopped state, clearing the queue and idling actuators.
    ///
    /// `reported` is false for stops the host did not request, so the next
    /// reply carries the event flag.
    pub fn enter_stopped(&self, cause: StopCause, recovery: StopRecovery, reported: bool) {
        {
            let mut stop = self.stop.lock();
            *stop = StopState {
                stopped: true,
                acknowledged: false,
                cause,
                recovery,
                reported,
            };
        }
        self.devices.lock().make_safe();
        let discarded = self.queue.clear();
        warn!(cause = %cause, discarded, "Controller stopped");
    }

    /// Handles one order and produces its reply.
    pub fn handle(&self, order_code: u8, params: &[u8]) -> Response {
        {
            let mut stop = self.stop.lock();
            if stop.stopped {
                if order_code == Order::Resume as u8 {
                    let flags = ResumeFlags::from_bits(params.first().copied().unwrap_or(0));
                    if flags.is_clear() {
                        *stop = StopState {
                            stopped: false,
                            acknowledged: true,
                            ..*stop
                        };
                        info!(cause = %stop.cause, "Stop cleared");
                        return Response::ok(Bytes::new());
                    }
                    if flags.is_acknowledge() {
                        stop.acknowledged = true;
                    }
                }

                let event = !stop.reported;
                stop.reported = true;
                return Response {
                    code: ReplyCode::Stopped,
                    params: Bytes::copy_from_slice(&stop.info().encode()),
                    event,
                };
            }
        }

        let result = Order::try_from(order_code)
            .map_err(|_| SimError::UnknownOrder(order_code))
            .and_then(|order| self.execute(order, params));

        match result {
            Ok(params) => Response::ok(params),
            Err(SimError::QueueRejected {
                code,
                accepted,
                status,
            }) => {
                let mut buf = BytesMut::with_capacity(3 + QueueStatus::ENCODED_LEN);
                buf.put_u8(code as u8);
                buf.put_u16(accepted);
                status.encode(&mut buf);
                Response {
                    code: ReplyCode::OrderSpecificError,
                    params: buf.freeze(),
                    event: false,
                }
            }
            Err(e) => {
                debug!(order = order_code, "Order failed: {}", e);
                Response {
                    code: ReplyCode::ApplicationError,
                    params: Bytes::copy_from_slice(&[e.error_code() as u8]),
                    event: false,
                }
            }
        }
    }

    /// Executes an order against the running firmware.
    pub fn execute(&self, order: Order, params: &[u8]) -> Result<Bytes, SimError> {
        match order {
            Order::Resume => Ok(Bytes::new()),
            Order::RequestInformation => self.handle_request_information(params),
            Order::RequestDeviceName => self.handle_request_device_name(params),
            Order::RequestTemperature => self.handle_request_temperature(params),
            Order::ConfigureHeater => self.handle_configure_heater(params),
            Order::SetHeaterTarget => self.handle_set_heater_target(params),
            Order::RequestInput => self.handle_request_input(params),
            Order::SetOutput => self.handle_set_output(params),
            Order::SetPwmOutput => self.handle_set_pwm_output(params),
            Order::EmergencyStop => {
                self.enter_stopped(StopCause::EmergencyStop, StopRecovery::Recoverable, true);
                Ok(Bytes::new())
            }
            Order::ActivateStepperControl => self.handle_activate_stepper_control(params),
            Order::EnableDisableSteppers => self.handle_enable_disable_steppers(params),
            Order::ClearCommandBlockQueue => {
                let discarded = self.queue.clear();
                debug!(discarded, "Command queue cleared");
                Ok(self.queue.status().to_bytes())
            }
            Order::RequestDeviceCount => self.handle_request_device_count(params),
            Order::QueueCommandBlocks => self.handle_queue_command_blocks(params),
            Order::Reset => {
                self.enter_stopped(StopCause::Reset, StopRecovery::Recoverable, false);
                Ok(Bytes::new())
            }
        }
    }

    // =========================================================================
    // Information
    // =========================================================================

    fn handle_request_information(&self, params: &[u8]) -> Result<Bytes, SimError> {
        let [kind] = params else {
            return Err(SimError::BadParameterFormat("expected one information kind"));
        };
        let kind = InfoKind::try_from(*kind)
            .map_err(|_| SimError::BadParameterValue("unknown information kind"))?;

        let firmware = &self.config.firmware;
        let value = match kind {
            InfoKind::FirmwareName => Bytes::copy_from_slice(firmware.name.as_bytes()),
            InfoKind::BoardSerial => Bytes::copy_from_slice(firmware.board_serial.as_bytes()),
            InfoKind::BoardName => Bytes::copy_from_slice(firmware.board_name.as_bytes()),
            InfoKind::GivenName => Bytes::copy_from_slice(firmware.given_name.as_bytes()),
            InfoKind::ProtocolVersionMajor => Bytes::copy_from_slice(&[PROTOCOL_VERSION.0]),
            InfoKind::ProtocolVersionMinor => Bytes::copy_from_slice(&[PROTOCOL_VERSION.1]),
            InfoKind::SupportedExtensions => Bytes::new(),
            InfoKind::QueueCapacity => {
                Bytes::copy_from_slice(&(self.queue.capacity() as u16).to_be_bytes())
            }
        };
        Ok(value)
    }

    fn handle_request_device_name(&self, params: &[u8]) -> Result<Bytes, SimError> {
        let [device, number] = params else {
            return Err(SimError::BadParameterFormat("expected device type and number"));
        };
        let device = device_type(*device)?;
        let devices = self.devices.lock();
        Ok(Bytes::copy_from_slice(devices.name(device, *number)?.as_bytes()))
    }

    fn handle_request_device_count(&self, params: &[u8]) -> Result<Bytes, SimError> {
        let [device] = params else {
            return Err(SimError::BadParameterFormat("expected one device type"));
        };
        let device = device_type(*device)?;
        let count = self.devices.lock().count(device);
        Ok(Bytes::copy_from_slice(&[count.min(u8::MAX as usize) as u8]))
    }

    // =========================================================================
    // Temperatures
    // =========================================================================

    fn handle_request_temperature(&self, params: &[u8]) -> Result<Bytes, SimError> {
        let devices = self.devices.lock();
        let mut buf = BytesMut::with_capacity(params.len());
        for pair in records(params, 2)? {
            let device = device_type(pair[0])?;
            let raw = match devices.temperature(device, pair[1])? {
                Some(celsius) => (celsius * 10.0)
                    .round()
                    .clamp(i16::MIN as f64, (TEMPERATURE_UNAVAILABLE - 1) as f64)
                    as i16,
                None => TEMPERATURE_UNAVAILABLE,
            };
            buf.put_i16(raw);
        }
        Ok(buf.freeze())
    }

    fn handle_configure_heater(&self, params: &[u8]) -> Result<Bytes, SimError> {
        let [heater, sensor] = params else {
            return Err(SimError::BadParameterFormat("expected heater and sensor"));
        };
        let mut devices = self.devices.lock();
        let heater = devices.check(DeviceType::Heater, *heater)?;
        devices.check(DeviceType::TemperatureSensor, *sensor)?;
        devices.heaters[heater].sensor = Some(*sensor);
        Ok(Bytes::new())
    }

    fn handle_set_heater_target(&self, params: &[u8]) -> Result<Bytes, SimError> {
        let mut devices = self.devices.lock();
        let mut targets = Vec::new();
        for record in records(params, 3)? {
            let heater = devices.check(DeviceType::Heater, record[0])?;
            let tenths = i16::from_be_bytes([record[1], record[2]]);
            let target = (tenths > 0).then(|| tenths as f64 / 10.0);
            if target.is_some_and(|t| t > self.config.firmware.max_temperature) {
                return Err(SimError::BadParameterValue("heater target above maximum"));
            }
            targets.push((heater, target));
        }
        for (heater, target) in targets {
            debug!(heater, ?target, "Heater target set");
            devices.heaters[heater].target = target;
        }
        Ok(Bytes::new())
    }

    // =========================================================================
    // Inputs and outputs
    // =========================================================================

    fn handle_request_input(&self, params: &[u8]) -> Result<Bytes, SimError> {
        let devices = self.devices.lock();
        let mut levels = BytesMut::with_capacity(params.len() / 2);
        for pair in records(params, 2)? {
            if device_type(pair[0])? != DeviceType::Input {
                return Err(SimError::InvalidDeviceType(pair[0]));
            }
            let input = devices.check(DeviceType::Input, pair[1])?;
            levels.put_u8(u8::from(devices.inputs[input].high));
        }
        Ok(levels.freeze())
    }

    fn handle_set_output(&self, params: &[u8]) -> Result<Bytes, SimError> {
        let mut devices = self.devices.lock();
        let mut updates = Vec::new();
        for pair in records(params, 2)? {
            let output = devices.check(DeviceType::Output, pair[0])?;
            updates.push((output, OutputDrive::try_from(pair[1])?));
        }
        for (output, drive) in updates {
            devices.outputs[output].drive = drive;
        }
        Ok(Bytes::new())
    }

    fn handle_set_pwm_output(&self, params: &[u8]) -> Result<Bytes, SimError> {
        let mut devices = self.devices.lock();
        let mut updates = Vec::new();
        for record in records(params, 4)? {
            let device = device_type(record[0])?;
            if !matches!(device, DeviceType::Pwm | DeviceType::Buzzer) {
                return Err(SimError::InvalidDeviceType(record[0]));
            }
            let index = devices.check(device, record[1])?;
            updates.push((device, index, u16::from_be_bytes([record[2], record[3]])));
        }
        for (device, index, duty) in updates {
            let channel = match device {
                DeviceType::Buzzer => &mut devices.buzzers[index],
                _ => &mut devices.pwm[index],
            };
            channel.duty = duty;
        }
        Ok(Bytes::new())
    }

    // =========================================================================
    // Steppers and the command queue
    // =========================================================================

    fn handle_activate_stepper_control(&self, params: &[u8]) -> Result<Bytes, SimError> {
        let active = match params {
            [0] => false,
            [1] => true,
            [_] => return Err(SimError::BadParameterValue("stepper control flag")),
            _ => return Err(SimError::BadParameterFormat("expected one flag byte")),
        };
        self.devices.lock().stepper_control = active;
        info!(active, "Stepper control changed");
        Ok(Bytes::new())
    }

    fn handle_enable_disable_steppers(&self, params: &[u8]) -> Result<Bytes, SimError> {
        let mut devices = self.devices.lock();
        if params.is_empty() {
            for stepper in &mut devices.steppers {
                stepper.enabled = true;
            }
            return Ok(Bytes::new());
        }

        let mut updates = Vec::new();
        for pair in records(params, 2)? {
            let stepper = devices.check(DeviceType::Stepper, pair[0])?;
            let enabled = match pair[1] {
                0 => false,
                1 => true,
                _ => return Err(SimError::BadParameterValue("stepper enable flag")),
            };
            updates.push((stepper, enabled));
        }
        for (stepper, enabled) in updates {
            devices.steppers[stepper].enabled = enabled;
        }
        Ok(Bytes::new())
    }

    fn handle_queue_command_blocks(&self, params: &[u8]) -> Result<Bytes, SimError> {
        if params.is_empty() {
            return Ok(self.queue.status().to_bytes());
        }
        if !self.devices.lock().stepper_control {
            return Err(SimError::QueueRejected {
                code: QueueErrorCode::IncorrectMode,
                accepted: 0,
                status: self.queue.status(),
            });
        }

        let outcome = self.queue.enqueue(params);
        if outcome.accepted > 0 {
            self.work.notify_one();
        }

        match outcome.error {
            None => Ok(self.queue.status().to_bytes()),
            Some(e) => {
                debug!(accepted = outcome.accepted, "Enqueue stopped early: {}", e);
                Err(SimError::QueueRejected {
                    code: e.queue_error_code(),
                    accepted: outcome.accepted as u16,
                    status: self.queue.status(),
                })
            }
        }
    }
}

fn device_type(raw: u8) -> Result<DeviceType, SimError> {
    DeviceType::try_from(raw).map_err(|_| SimError::InvalidDeviceType(raw))
}

/// Splits a non-empty parameter list into fixed-width records.
fn records(params: &[u8], width: usize) -> Result<std::slice::ChunksExact<'_, u8>, SimError> {
    if params.is_empty() || params.len() % width != 0 {
        return Err(SimError::BadParameterFormat("parameter length"));
    }
    Ok(params.chunks_exact(width))
}

#[cfg(test)]
mod tests {
    use super::*;
    use pacer_core::Slot;
    use pacer_protocol::ErrorCode;

    fn running_handler() -> OrderHandler {
        let handler = OrderHandler::new(Config::default());
        let response = handler.handle(Order::Resume as u8, &[ResumeFlags::clear().bits()]);
        assert_eq!(response.code, ReplyCode::Ok);
        handler
    }

    fn application_error(response: &Response) -> ErrorCode {
        assert_eq!(response.code, ReplyCode::ApplicationError);
        ErrorCode::try_from(response.params[0]).unwrap()
    }

    #[test]
    fn test_boots_stopped_and_flags_event_once() {
        let handler = OrderHandler::new(Config::default());

        let first = handler.handle(Order::RequestInformation as u8, &[0]);
        assert_eq!(first.code, ReplyCode::Stopped);
        assert!(first.event);
        let info = StoppedInfo::decode(&first.params).unwrap();
        assert_eq!(info.cause, StopCause::Reset);
        assert!(!info.acknowledged);

        let second = handler.handle(Order::SetOutput as u8, &[0, 1]);
        assert_eq!(second.code, ReplyCode::Stopped);
        assert!(!second.event);
    }

    #[test]
    fn test_acknowledge_keeps_stopped() {
        let handler = OrderHandler::new(Config::default());
        let response = handler.handle(Order::Resume as u8, &[ResumeFlags::acknowledge().bits()]);
        assert_eq!(response.code, ReplyCode::Stopped);
        assert!(StoppedInfo::decode(&response.params).unwrap().acknowledged);

        let response = handler.handle(Order::Resume as u8, &[ResumeFlags::clear().bits()]);
        assert_eq!(response.code, ReplyCode::Ok);
        assert!(!handler.is_stopped());

        let response = handler.handle(Order::RequestInformation as u8, &[0]);
        assert_eq!(response.code, ReplyCode::Ok);
        assert_eq!(&response.params[..], b"pacer-sim");
    }

    #[test]
    fn test_emergency_stop_clears_queue() {
        let handler = running_handler();
        handler.handle(Order::ActivateStepperControl as u8, &[1]);
        let block = Slot::Delay { micros: 10 }.to_bytes().unwrap();
        let response = handler.handle(Order::QueueCommandBlocks as u8, &block);
        assert_eq!(response.code, ReplyCode::Ok);
        assert_eq!(handler.queue().len(), 1);

        let response = handler.handle(Order::EmergencyStop as u8, &[]);
        assert_eq!(response.code, ReplyCode::Ok);
        assert!(handler.queue().is_empty());

        let response = handler.handle(Order::RequestInformation as u8, &[0]);
        assert_eq!(response.code, ReplyCode::Stopped);
        assert!(!response.event);
        assert_eq!(
            StoppedInfo::decode(&response.params).unwrap().cause,
            StopCause::EmergencyStop
        );
    }

    #[test]
    fn test_unknown_order_and_bad_params() {
        let handler = running_handler();
        assert_eq!(
            application_error(&handler.handle(0x55, &[])),
            ErrorCode::UnknownOrder
        );
        assert_eq!(
            application_error(&handler.handle(Order::SetOutput as u8, &[0])),
            ErrorCode::BadParameterFormat
        );
        assert_eq!(
            application_error(&handler.handle(Order::SetOutput as u8, &[0, 7])),
            ErrorCode::BadParameterValue
        );
        assert_eq!(
            application_error(&handler.handle(Order::SetOutput as u8, &[9, 1])),
            ErrorCode::InvalidDeviceNumber
        );
        assert_eq!(
            application_error(&handler.handle(Order::RequestTemperature as u8, &[0x02, 0])),
            ErrorCode::InvalidDeviceType
        );
    }

    #[test]
    fn test_temperatures_and_heaters() {
        let handler = running_handler();
        let response = handler.handle(Order::RequestTemperature as u8, &[0x06, 0, 0x05, 1]);
        assert_eq!(response.code, ReplyCode::Ok);
        assert_eq!(&response.params[..], &[0x00, 0xD7, 0x00, 0xD7]);

        let response = handler.handle(Order::SetHeaterTarget as u8, &[0, 0x07, 0xD0]);
        assert_eq!(response.code, ReplyCode::Ok);
        assert_eq!(handler.devices().heaters[0].target, Some(200.0));

        let response = handler.handle(Order::SetHeaterTarget as u8, &[0, 0x0F, 0xA0]);
        assert_eq!(application_error(&response), ErrorCode::BadParameterValue);
    }

    #[test]
    fn test_queue_requires_stepper_control() {
        let handler = running_handler();
        let block = Slot::Delay { micros: 10 }.to_bytes().unwrap();
        let response = handler.handle(Order::QueueCommandBlocks as u8, &block);
        assert_eq!(response.code, ReplyCode::OrderSpecificError);
        assert_eq!(response.params[0], QueueErrorCode::IncorrectMode as u8);
        assert_eq!(&response.params[1..3], &[0, 0]);

        let status = handler.handle(Order::QueueCommandBlocks as u8, &[]);
        assert_eq!(status.code, ReplyCode::Ok);
        let status = QueueStatus::decode(&status.params).unwrap();
        assert_eq!(status.available, 500);
    }

    #[test]
    fn test_queue_partial_accept_reply() {
        let handler = running_handler();
        handler.handle(Order::ActivateStepperControl as u8, &[1]);

        let mut raw = BytesMut::new();
        Slot::Delay { micros: 1 }.encode(&mut raw).unwrap();
        Slot::Delay { micros: 2 }.encode(&mut raw).unwrap();
        raw.extend_from_slice(&[0x00]);

        let response = handler.handle(Order::QueueCommandBlocks as u8, &raw);
        assert_eq!(response.code, ReplyCode::OrderSpecificError);
        assert_eq!(response.params[0], QueueErrorCode::MalformedBlock as u8);
        assert_eq!(&response.params[1..3], &[0, 2]);
        let status = QueueStatus::decode(&response.params[3..]).unwrap();
        assert_eq!(status.used, 2);
        assert_eq!(status.available, 498);
    }

    #[test]
    fn test_device_queries() {
        let handler = running_handler();
        let response = handler.handle(Order::RequestDeviceCount as u8, &[0x04]);
        assert_eq!(&response.params[..], &[4]);
        let response = handler.handle(Order::RequestDeviceName as u8, &[0x04, 2]);
        assert_eq!(&response.params[..], b"z");
        let response = handler.handle(Order::RequestInformation as u8, &[0x07]);
        assert_eq!(&response.params[..], &[0x01, 0xF4]);
        assert_eq!(
            application_error(&handler.handle(Order::RequestDeviceCount as u8, &[0x09])),
            ErrorCode::InvalidDeviceType
        );
    }

    #[test]
    fn test_reset_reports_event() {
        let handler = running_handler();
        let response = handler.handle(Order::Reset as u8, &[]);
        assert_eq!(response.code, ReplyCode::Ok);

        let response = handler.handle(Order::RequestInformation as u8, &[0]);
        assert_eq!(response.code, ReplyCode::Stopped);
        assert!(response.event);
    }
}
