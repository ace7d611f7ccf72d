//! Order, reply and device vocabularies.

use crate::error::{ErrorCode, ProtocolError};
use crate::frame::{Control, Direction, Frame};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::fmt;

/// Orders sent from host to client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Order {
    Resume = 0x00,
    RequestInformation = 0x01,
    RequestDeviceName = 0x02,
    RequestTemperature = 0x03,
    ConfigureHeater = 0x05,
    SetHeaterTarget = 0x06,
    RequestInput = 0x07,
    SetOutput = 0x08,
    SetPwmOutput = 0x09,
    EmergencyStop = 0x0C,
    ActivateStepperControl = 0x0D,
    EnableDisableSteppers = 0x0E,
    ClearCommandBlockQueue = 0x16,
    RequestDeviceCount = 0x17,
    QueueCommandBlocks = 0x18,
    Reset = 0x7F,
}

impl Order {
    /// Returns the string name used in logs.
    pub fn name(&self) -> &'static str {
        match self {
            Order::Resume => "RESUME",
            Order::RequestInformation => "REQUEST_INFORMATION",
            Order::RequestDeviceName => "REQUEST_DEVICE_NAME",
            Order::RequestTemperature => "REQUEST_TEMPERATURE",
            Order::ConfigureHeater => "CONFIGURE_HEATER",
            Order::SetHeaterTarget => "SET_HEATER_TARGET",
            Order::RequestInput => "REQUEST_INPUT",
            Order::SetOutput => "SET_OUTPUT",
            Order::SetPwmOutput => "SET_PWM_OUTPUT",
            Order::EmergencyStop => "EMERGENCY_STOP",
            Order::ActivateStepperControl => "ACTIVATE_STEPPER_CONTROL",
            Order::EnableDisableSteppers => "ENABLE_DISABLE_STEPPERS",
            Order::ClearCommandBlockQueue => "CLEAR_COMMAND_BLOCK_QUEUE",
            Order::RequestDeviceCount => "REQUEST_DEVICE_COUNT",
            Order::QueueCommandBlocks => "QUEUE_COMMAND_BLOCKS",
            Order::Reset => "RESET",
        }
    }
}

impl TryFrom<u8> for Order {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(Order::Resume),
            0x01 => Ok(Order::RequestInformation),
            0x02 => Ok(Order::RequestDeviceName),
            0x03 => Ok(Order::RequestTemperature),
            0x05 => Ok(Order::ConfigureHeater),
            0x06 => Ok(Order::SetHeaterTarget),
            0x07 => Ok(Order::RequestInput),
            0x08 => Ok(Order::SetOutput),
            0x09 => Ok(Order::SetPwmOutput),
            0x0C => Ok(Order::EmergencyStop),
            0x0D => Ok(Order::ActivateStepperControl),
            0x0E => Ok(Order::EnableDisableSteppers),
            0x16 => Ok(Order::ClearCommandBlockQueue),
            0x17 => Ok(Order::RequestDeviceCount),
            0x18 => Ok(Order::QueueCommandBlocks),
            0x7F => Ok(Order::Reset),
            other => Err(ProtocolError::UnknownOrder(other)),
        }
    }
}

impl fmt::Display for Order {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Reply codes sent from client to host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum ReplyCode {
    Ok = 0x10,
    ApplicationError = 0x11,
    Stopped = 0x12,
    OrderSpecificError = 0x13,
    FrameReceiptError = 0x14,
}

impl TryFrom<u8> for ReplyCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x10 => Ok(ReplyCode::Ok),
            0x11 => Ok(ReplyCode::ApplicationError),
            0x12 => Ok(ReplyCode::Stopped),
            0x13 => Ok(ReplyCode::OrderSpecificError),
            0x14 => Ok(ReplyCode::FrameReceiptError),
            other => Err(ProtocolError::UnknownReplyCode(other)),
        }
    }
}

/// Sub-code of a `FrameReceiptError` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameReceiptCode {
    BadCrc = 0x01,
    BadLength = 0x02,
}

/// Device classes addressed by orders.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[repr(u8)]
pub enum DeviceType {
    Input = 0x01,
    Output = 0x02,
    Pwm = 0x03,
    Stepper = 0x04,
    Heater = 0x05,
    TemperatureSensor = 0x06,
    Buzzer = 0x07,
}

impl TryFrom<u8> for DeviceType {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(DeviceType::Input),
            0x02 => Ok(DeviceType::Output),
            0x03 => Ok(DeviceType::Pwm),
            0x04 => Ok(DeviceType::Stepper),
            0x05 => Ok(DeviceType::Heater),
            0x06 => Ok(DeviceType::TemperatureSensor),
            0x07 => Ok(DeviceType::Buzzer),
            other => Err(ProtocolError::UnknownDeviceType(other)),
        }
    }
}

impl fmt::Display for DeviceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            DeviceType::Input => "input",
            DeviceType::Output => "output",
            DeviceType::Pwm => "pwm",
            DeviceType::Stepper => "stepper",
            DeviceType::Heater => "heater",
            DeviceType::TemperatureSensor => "temperature sensor",
            DeviceType::Buzzer => "buzzer",
        };
        f.write_str(name)
    }
}

/// Information kinds for `RequestInformation`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum InfoKind {
    FirmwareName = 0x00,
    BoardSerial = 0x01,
    BoardName = 0x02,
    GivenName = 0x03,
    ProtocolVersionMajor = 0x04,
    ProtocolVersionMinor = 0x05,
    SupportedExtensions = 0x06,
    QueueCapacity = 0x07,
}

impl TryFrom<u8> for InfoKind {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x00 => Ok(InfoKind::FirmwareName),
            0x01 => Ok(InfoKind::BoardSerial),
            0x02 => Ok(InfoKind::BoardName),
            0x03 => Ok(InfoKind::GivenName),
            0x04 => Ok(InfoKind::ProtocolVersionMajor),
            0x05 => Ok(InfoKind::ProtocolVersionMinor),
            0x06 => Ok(InfoKind::SupportedExtensions),
            0x07 => Ok(InfoKind::QueueCapacity),
            _ => Err(ProtocolError::MalformedPayload("unknown information kind")),
        }
    }
}

/// Parameter flags of the `Resume` order.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ResumeFlags(u8);

impl ResumeFlags {
    pub const ACKNOWLEDGE: u8 = 0x01;
    pub const CLEAR: u8 = 0x02;

    pub fn acknowledge() -> Self {
        Self(Self::ACKNOWLEDGE)
    }

    pub fn clear() -> Self {
        Self(Self::ACKNOWLEDGE | Self::CLEAR)
    }

    pub fn is_acknowledge(&self) -> bool {
        self.0 & Self::ACKNOWLEDGE != 0
    }

    pub fn is_clear(&self) -> bool {
        self.0 & Self::CLEAR != 0
    }

    pub fn bits(&self) -> u8 {
        self.0
    }

    pub fn from_bits(bits: u8) -> Self {
        Self(bits)
    }
}

/// Why a controller entered the stopped state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StopCause {
    Reset = 0x01,
    EndstopHit = 0x02,
    MovementError = 0x03,
    ThermalFault = 0x04,
    DeviceFault = 0x05,
    EmergencyStop = 0x06,
}

impl TryFrom<u8> for StopCause {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(StopCause::Reset),
            0x02 => Ok(StopCause::EndstopHit),
            0x03 => Ok(StopCause::MovementError),
            0x04 => Ok(StopCause::ThermalFault),
            0x05 => Ok(StopCause::DeviceFault),
            0x06 => Ok(StopCause::EmergencyStop),
            _ => Err(ProtocolError::MalformedPayload("unknown stop cause")),
        }
    }
}

impl fmt::Display for StopCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StopCause::Reset => "reset",
            StopCause::EndstopHit => "endstop hit",
            StopCause::MovementError => "movement error",
            StopCause::ThermalFault => "thermal fault",
            StopCause::DeviceFault => "device fault",
            StopCause::EmergencyStop => "emergency stop",
        };
        f.write_str(name)
    }
}

/// Whether a stop can be cleared without restarting the controller.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum StopRecovery {
    Recoverable = 0x00,
    RestartRequired = 0x01,
}

/// Payload of a `Stopped` reply.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StoppedInfo {
    pub acknowledged: bool,
    pub recovery: StopRecovery,
    pub cause: StopCause,
}

impl StoppedInfo {
    pub fn encode(&self) -> [u8; 3] {
        [
            u8::from(self.acknowledged),
            self.recovery as u8,
            self.cause as u8,
        ]
    }

    pub fn decode(params: &[u8]) -> Result<Self, ProtocolError> {
        if params.len() < 3 {
            return Err(ProtocolError::MalformedPayload("stopped reply too short"));
        }
        let recovery = match params[1] {
            0x00 => StopRecovery::Recoverable,
            0x01 => StopRecovery::RestartRequired,
            _ => return Err(ProtocolError::MalformedPayload("unknown recovery status")),
        };
        Ok(Self {
            acknowledged: params[0] != 0,
            recovery,
            cause: StopCause::try_from(params[2])?,
        })
    }
}

impl fmt::Display for StoppedInfo {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "stopped ({}, {})",
            self.cause,
            if self.acknowledged {
                "acknowledged"
            } else {
                "unacknowledged"
            }
        )
    }
}

/// Command queue counters reported after enqueue and clear.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStatus {
    pub available: u16,
    pub used: u16,
    pub executed: u16,
}

impl QueueStatus {
    pub const ENCODED_LEN: usize = 6;

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u16(self.available);
        buf.put_u16(self.used);
        buf.put_u16(self.executed);
    }

    pub fn to_bytes(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(Self::ENCODED_LEN);
        self.encode(&mut buf);
        buf.freeze()
    }

    pub fn decode(mut params: &[u8]) -> Result<Self, ProtocolError> {
        if params.len() < Self::ENCODED_LEN {
            return Err(ProtocolError::MalformedPayload("queue status too short"));
        }
        Ok(Self {
            available: params.get_u16(),
            used: params.get_u16(),
            executed: params.get_u16(),
        })
    }
}

/// Sub-codes of an `OrderSpecificError` reply to `QueueCommandBlocks`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum QueueErrorCode {
    QueueFull = 0x01,
    MalformedBlock = 0x02,
    IncorrectMode = 0x03,
}

impl TryFrom<u8> for QueueErrorCode {
    type Error = ProtocolError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0x01 => Ok(QueueErrorCode::QueueFull),
            0x02 => Ok(QueueErrorCode::MalformedBlock),
            0x03 => Ok(QueueErrorCode::IncorrectMode),
            _ => Err(ProtocolError::MalformedPayload("unknown queue error code")),
        }
    }
}

/// A decoded client-to-host reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Reply {
    pub control: Control,
    pub code: ReplyCode,
    pub params: Bytes,
}

impl Reply {
    pub fn from_frame(frame: Frame) -> Result<Self, ProtocolError> {
        if frame.direction != Direction::ClientToHost {
            return Err(ProtocolError::MalformedPayload("not a reply frame"));
        }
        Ok(Self {
            control: frame.control,
            code: ReplyCode::try_from(frame.code)?,
            params: frame.params,
        })
    }

    pub fn is_ok(&self) -> bool {
        self.code == ReplyCode::Ok
    }

    /// Application error sub-code, for `ApplicationError` replies.
    pub fn error_code(&self) -> Option<ErrorCode> {
        if self.code != ReplyCode::ApplicationError {
            return None;
        }
        self.params
            .first()
            .and_then(|&b| ErrorCode::try_from(b).ok())
    }

    /// Stop details, for `Stopped` replies.
    pub fn stopped_info(&self) -> Option<StoppedInfo> {
        if self.code != ReplyCode::Stopped {
            return None;
        }
        StoppedInfo::decode(&self.params).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_order_codes_roundtrip() {
        for code in 0u8..=0xFF {
            if let Ok(order) = Order::try_from(code) {
                assert_eq!(order as u8, code);
            }
        }
        assert!(matches!(
            Order::try_from(0x55),
            Err(ProtocolError::UnknownOrder(0x55))
        ));
    }

    #[test]
    fn test_order_display() {
        assert_eq!(Order::QueueCommandBlocks.to_string(), "QUEUE_COMMAND_BLOCKS");
        assert_eq!(Order::Resume.to_string(), "RESUME");
    }

    #[test]
    fn test_stopped_info() {
        let info = StoppedInfo {
            acknowledged: true,
            recovery: StopRecovery::Recoverable,
            cause: StopCause::EmergencyStop,
        };
        let bytes = info.encode();
        assert_eq!(bytes, [1, 0, 6]);
        assert_eq!(StoppedInfo::decode(&bytes).unwrap(), info);
        assert!(StoppedInfo::decode(&bytes[..2]).is_err());
        assert!(info.to_string().contains("emergency stop"));
    }

    #[test]
    fn test_queue_status_big_endian() {
        let status = QueueStatus {
            available: 500,
            used: 0x0102,
            executed: 7,
        };
        let bytes = status.to_bytes();
        assert_eq!(&bytes[..], &[0x01, 0xF4, 0x01, 0x02, 0x00, 0x07]);
        assert_eq!(QueueStatus::decode(&bytes).unwrap(), status);
    }

    #[test]
    fn test_resume_flags() {
        let clear = ResumeFlags::clear();
        assert!(clear.is_clear());
        assert!(clear.is_acknowledge());

        let ack = ResumeFlags::acknowledge();
        assert!(!ack.is_clear());
        assert_eq!(ResumeFlags::from_bits(0x02).bits(), 0x02);
    }

    #[test]
    fn test_reply_helpers() {
        let frame = Frame::reply(Control::new(2), ReplyCode::ApplicationError, vec![0x05]);
        let reply = Reply::from_frame(frame).unwrap();
        assert!(!reply.is_ok());
        assert_eq!(reply.error_code(), Some(ErrorCode::InvalidDeviceNumber));
        assert_eq!(reply.stopped_info(), None);

        let frame = Frame::request(Control::new(2), Order::Reset, Bytes::new());
        assert!(Reply::from_frame(frame).is_err());
    }

    #[test]
    fn test_device_type_codes() {
        assert_eq!(DeviceType::try_from(0x04).unwrap(), DeviceType::Stepper);
        assert!(DeviceType::try_from(0x00).is_err());
        assert_eq!(DeviceType::TemperatureSensor.to_string(), "temperature sensor");
    }
}
