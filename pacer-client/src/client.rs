//! High-level controller API.

use crate::connection::{Connection, ConnectionConfig};
use crate::error::ClientError;
use bytes::{Buf, Bytes, BytesMut};
use pacer_core::{CoreError, Slot};
use pacer_protocol::{
    DeviceType, InfoKind, Order, QueueErrorCode, QueueStatus, ReplyCode, ResumeFlags, StoppedInfo,
    MAX_PARAMS_LEN,
};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, info};

/// Raw temperature value meaning "no reading".
pub const TEMPERATURE_UNAVAILABLE: i16 = 0x7FFF;

/// Drive state of a digital output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OutputState {
    Low = 0,
    High = 1,
    Disabled = 2,
}

/// High-level client for one controller.
pub struct Client {
    conn: Arc<Connection>,
    poll_interval: Duration,
    last_error: Mutex<Option<String>>,
}

impl Client {
    /// Wraps an established connection.
    pub fn new(conn: Connection) -> Self {
        Self {
            conn: Arc::new(conn),
            poll_interval: Duration::from_millis(20),
            last_error: Mutex::new(None),
        }
    }

    /// Connects over TCP and performs the handshake.
    pub async fn connect(addr: SocketAddr, config: ConnectionConfig) -> Result<Self, ClientError> {
        let client = Self::new(Connection::connect(addr, config).await?);
        client.handshake().await?;
        Ok(client)
    }

    /// Sets how often backpressure and temperature waits poll the controller.
    pub fn with_poll_interval(mut self, interval: Duration) -> Self {
        self.poll_interval = interval;
        self
    }

    /// Brings the controller out of its boot stop and returns its firmware name.
    pub async fn handshake(&self) -> Result<String, ClientError> {
        let name = match self.firmware_name().await {
            Ok(name) => name,
            Err(ClientError::Stopped(info)) => {
                info!("Controller is {}, clearing", info);
                self.resume(ResumeFlags::clear()).await?;
                self.firmware_name().await?
            }
            Err(e) => return Err(e),
        };
        info!(firmware = %name, "Controller ready");
        Ok(name)
    }

    /// Returns whether the link is usable.
    pub fn is_connected(&self) -> bool {
        self.conn.is_connected()
    }

    /// Closes the connection.
    pub async fn close(&self) -> Result<(), ClientError> {
        self.conn.close().await
    }

    pub fn connection(&self) -> Arc<Connection> {
        self.conn.clone()
    }

    /// Display string of the last operation's failure.
    ///
    /// Cleared by the next successful request.
    pub fn last_error(&self) -> Option<String> {
        self.last_error.lock().clone()
    }

    // =========================================================================
    // Helper methods
    // =========================================================================

    async fn call(&self, order: Order, params: &[u8]) -> Result<Bytes, ClientError> {
        let result = self.exchange(order, params).await;
        match &result {
            Ok(_) => *self.last_error.lock() = None,
            Err(e) => {
                debug!(order = %order, "Request failed: {}", e);
                *self.last_error.lock() = Some(e.to_string());
            }
        }
        result
    }

    async fn exchange(&self, order: Order, params: &[u8]) -> Result<Bytes, ClientError> {
        let reply = self.conn.request(order, params).await?;

        match reply.code {
            ReplyCode::Ok => Ok(reply.params),
            ReplyCode::ApplicationError => {
                let code = reply
                    .error_code()
                    .ok_or(ClientError::UnexpectedReply("application error without sub-code"))?;
                Err(ClientError::Application { order, code })
            }
            ReplyCode::Stopped => Err(ClientError::Stopped(StoppedInfo::decode(&reply.params)?)),
            ReplyCode::OrderSpecificError => {
                if order == Order::QueueCommandBlocks && reply.params.len() >= 9 {
                    let mut params = reply.params.clone();
                    let code = QueueErrorCode::try_from(params.get_u8())?;
                    let accepted = params.get_u16();
                    let status = QueueStatus::decode(&params)?;
                    return Err(ClientError::QueueRejected {
                        code,
                        accepted,
                        status,
                    });
                }
                Err(ClientError::OrderSpecific {
                    order,
                    params: reply.params.to_vec(),
                })
            }
            ReplyCode::FrameReceiptError => {
                Err(ClientError::UnexpectedReply("frame receipt error"))
            }
        }
    }

    // =========================================================================
    // Information
    // =========================================================================

    pub async fn request_information(&self, kind: InfoKind) -> Result<Bytes, ClientError> {
        self.call(Order::RequestInformation, &[kind as u8]).await
    }

    pub async fn firmware_name(&self) -> Result<String, ClientError> {
        let bytes = self.request_information(InfoKind::FirmwareName).await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Slot capacity of the controller's command queue.
    pub async fn queue_capacity(&self) -> Result<u16, ClientError> {
        let mut bytes = self.request_information(InfoKind::QueueCapacity).await?;
        if bytes.len() < 2 {
            return Err(ClientError::UnexpectedReply("queue capacity too short"));
        }
        Ok(bytes.get_u16())
    }

    pub async fn device_count(&self, device: DeviceType) -> Result<u8, ClientError> {
        let bytes = self.call(Order::RequestDeviceCount, &[device as u8]).await?;
        bytes
            .first()
            .copied()
            .ok_or(ClientError::UnexpectedReply("empty device count"))
    }

    pub async fn device_name(&self, device: DeviceType, number: u8) -> Result<String, ClientError> {
        let bytes = self
            .call(Order::RequestDeviceName, &[device as u8, number])
            .await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    // =========================================================================
    // Temperatures
    // =========================================================================

    /// Reads temperatures in degrees Celsius; `None` where no reading exists.
    pub async fn temperatures(
        &self,
        devices: &[(DeviceType, u8)],
    ) -> Result<Vec<Option<f64>>, ClientError> {
        let params: Vec<u8> = devices.iter().flat_map(|(t, n)| [*t as u8, *n]).collect();
        let mut bytes = self.call(Order::RequestTemperature, &params).await?;
        if bytes.len() != devices.len() * 2 {
            return Err(ClientError::UnexpectedReply("temperature count mismatch"));
        }

        let mut readings = Vec::with_capacity(devices.len());
        while bytes.has_remaining() {
            let raw = bytes.get_i16();
            readings.push((raw != TEMPERATURE_UNAVAILABLE).then(|| raw as f64 / 10.0));
        }
        Ok(readings)
    }

    pub async fn configure_heater(&self, heater: u8, sensor: u8) -> Result<(), ClientError> {
        self.call(Order::ConfigureHeater, &[heater, sensor]).await?;
        Ok(())
    }

    /// Sets a heater target in degrees Celsius; zero or below switches it off.
    pub async fn set_heater_target(&self, heater: u8, celsius: f64) -> Result<(), ClientError> {
        let tenths = (celsius * 10.0).round().clamp(i16::MIN as f64, 0x7FFE as f64) as i16;
        let [hi, lo] = tenths.to_be_bytes();
        self.call(Order::SetHeaterTarget, &[heater, hi, lo]).await?;
        Ok(())
    }

    /// Polls `sensor` until it reads within `tolerance` of `target`.
    ///
    /// Fails with the link error if the connection drops while waiting.
    pub async fn wait_for_temperature(
        &self,
        sensor: (DeviceType, u8),
        target: f64,
        tolerance: f64,
        timeout: Duration,
    ) -> Result<f64, ClientError> {
        let deadline = Instant::now() + timeout;
        loop {
            if let Some(Some(reading)) = self.temperatures(&[sensor]).await?.first().copied() {
                if (reading - target).abs() <= tolerance {
                    return Ok(reading);
                }
                debug!(reading, target, "Waiting for temperature");
            }
            if Instant::now() >= deadline {
                *self.last_error.lock() = Some(ClientError::Timeout.to_string());
                return Err(ClientError::Timeout);
            }
            tokio::time::sleep(self.poll_interval).await;
        }
    }

    // =========================================================================
    // Inputs and outputs
    // =========================================================================

    /// Reads digital inputs; `true` means the input is high.
    pub async fn read_inputs(&self, inputs: &[u8]) -> Result<Vec<bool>, ClientError> {
        let params: Vec<u8> = inputs
            .iter()
            .flat_map(|n| [DeviceType::Input as u8, *n])
            .collect();
        let bytes = self.call(Order::RequestInput, &params).await?;
        if bytes.len() != inputs.len() {
            return Err(ClientError::UnexpectedReply("input count mismatch"));
        }
        Ok(bytes.iter().map(|level| *level != 0).collect())
    }

    pub async fn set_outputs(&self, outputs: &[(u8, OutputState)]) -> Result<(), ClientError> {
        let params: Vec<u8> = outputs.iter().flat_map(|(n, s)| [*n, *s as u8]).collect();
        self.call(Order::SetOutput, &params).await?;
        Ok(())
    }

    pub async fn set_pwm(&self, device: DeviceType, number: u8, duty: u16) -> Result<(), ClientError> {
        let [hi, lo] = duty.to_be_bytes();
        self.call(Order::SetPwmOutput, &[device as u8, number, hi, lo])
            .await?;
        Ok(())
    }

    // =========================================================================
    // Steppers and the command queue
    // =========================================================================

    pub async fn activate_stepper_control(&self, active: bool) -> Result<(), ClientError> {
        self.call(Order::ActivateStepperControl, &[u8::from(active)])
            .await?;
        Ok(())
    }

    /// Enables or disables steppers; an empty list enables all of them.
    pub async fn enable_steppers(&self, steppers: &[(u8, bool)]) -> Result<(), ClientError> {
        let params: Vec<u8> = steppers
            .iter()
            .flat_map(|(n, on)| [*n, u8::from(*on)])
            .collect();
        self.call(Order::EnableDisableSteppers, &params).await?;
        Ok(())
    }

    /// Polls queue counters with an empty enqueue.
    pub async fn queue_status(&self) -> Result<QueueStatus, ClientError> {
        let bytes = self.call(Order::QueueCommandBlocks, &[]).await?;
        Ok(QueueStatus::decode(&bytes)?)
    }

    pub async fn clear_queue(&self) -> Result<QueueStatus, ClientError> {
        let bytes = self.call(Order::ClearCommandBlockQueue, &[]).await?;
        Ok(QueueStatus::decode(&bytes)?)
    }

    /// Queues slots in order, packing as many per frame as fit and waiting
    /// for free queue space when the controller is full.
    pub async fn queue_slots(&self, slots: &[Slot]) -> Result<QueueStatus, ClientError> {
        let mut pending = slots
            .iter()
            .map(|slot| {
                let block = slot.to_bytes()?;
                if block.len() > MAX_PARAMS_LEN {
                    return Err(CoreError::SlotTooLarge { size: block.len() });
                }
                Ok(block)
            })
            .collect::<Result<VecDeque<Bytes>, CoreError>>()?;

        let mut status = self.queue_status().await?;
        while !pending.is_empty() {
            if status.available == 0 {
                tokio::time::sleep(self.poll_interval).await;
                status = self.queue_status().await?;
                continue;
            }

            let mut batch = Vec::new();
            let mut frame = BytesMut::new();
            while let Some(block) = pending.front() {
                if batch.len() >= status.available as usize
                    || frame.len() + block.len() > MAX_PARAMS_LEN
                {
                    break;
                }
                frame.extend_from_slice(block);
                if let Some(block) = pending.pop_front() {
                    batch.push(block);
                }
            }

            match self.call(Order::QueueCommandBlocks, &frame).await {
                Ok(bytes) => status = QueueStatus::decode(&bytes)?,
                Err(ClientError::QueueRejected {
                    code: QueueErrorCode::QueueFull,
                    accepted,
                    status: reported,
                }) => {
                    debug!(accepted, "Controller queue filled mid-batch");
                    for block in batch.into_iter().skip(accepted as usize).rev() {
                        pending.push_front(block);
                    }
                    status = reported;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(status)
    }

    // =========================================================================
    // Stop handling
    // =========================================================================

    pub async fn resume(&self, flags: ResumeFlags) -> Result<(), ClientError> {
        self.call(Order::Resume, &[flags.bits()]).await?;
        Ok(())
    }

    pub async fn reset(&self) -> Result<(), ClientError> {
        self.call(Order::Reset, &[]).await?;
        Ok(())
    }

    pub async fn emergency_stop(&self) -> Result<(), ClientError> {
        self.call(Order::EmergencyStop, &[]).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stream::ClientStream;
    use pacer_protocol::{Control, Encoder, ErrorCode, StopCause, StopRecovery};
    use tokio_test::io::Builder;

    fn request(control: Control, order: Order, params: &[u8]) -> Vec<u8> {
        Encoder::encode_request(control, order, params)
            .unwrap()
            .to_vec()
    }

    fn reply(sequence: u8, code: ReplyCode, params: &[u8]) -> Vec<u8> {
        Encoder::encode_reply(Control::new(sequence), code, params)
            .unwrap()
            .to_vec()
    }

    fn client(mock: tokio_test::io::Mock) -> Client {
        Client::new(Connection::from_stream(
            ClientStream::boxed(mock),
            ConnectionConfig::new(),
        ))
    }

    #[tokio::test]
    async fn test_handshake_clears_boot_stop() {
        let stopped = StoppedInfo {
            acknowledged: false,
            recovery: StopRecovery::Recoverable,
            cause: StopCause::Reset,
        };
        let mock = Builder::new()
            .write(&request(
                Control::new(0).with_resync(),
                Order::RequestInformation,
                &[0],
            ))
            .read(&reply(0, ReplyCode::Stopped, &stopped.encode()))
            .write(&request(Control::new(1), Order::Resume, &[0x03]))
            .read(&reply(1, ReplyCode::Ok, &[]))
            .write(&request(Control::new(2), Order::RequestInformation, &[0]))
            .read(&reply(2, ReplyCode::Ok, b"pacer-sim"))
            .build();

        let client = client(mock);
        assert_eq!(client.handshake().await.unwrap(), "pacer-sim");
        assert_eq!(client.last_error(), None);
    }

    #[tokio::test]
    async fn test_success_clears_last_error() {
        let mock = Builder::new()
            .write(&request(
                Control::new(0).with_resync(),
                Order::RequestDeviceName,
                &[4, 9],
            ))
            .read(&reply(
                0,
                ReplyCode::ApplicationError,
                &[ErrorCode::InvalidDeviceNumber as u8],
            ))
            .write(&request(Control::new(1), Order::RequestInformation, &[0]))
            .read(&reply(1, ReplyCode::Ok, b"pacer-sim"))
            .build();

        let client = client(mock);
        assert!(client.device_name(DeviceType::Stepper, 9).await.is_err());
        assert!(client.last_error().unwrap().contains("INVALID_DEVICE_NUMBER"));

        assert_eq!(client.firmware_name().await.unwrap(), "pacer-sim");
        assert_eq!(client.last_error(), None);
    }

    #[tokio::test]
    async fn test_application_error_mapping() {
        let mock = Builder::new()
            .write(&request(
                Control::new(0).with_resync(),
                Order::RequestDeviceName,
                &[4, 9],
            ))
            .read(&reply(
                0,
                ReplyCode::ApplicationError,
                &[ErrorCode::InvalidDeviceNumber as u8],
            ))
            .build();

        let client = client(mock);
        let err = client.device_name(DeviceType::Stepper, 9).await.unwrap_err();
        assert!(matches!(
            err,
            ClientError::Application {
                code: ErrorCode::InvalidDeviceNumber,
                ..
            }
        ));
        assert_eq!(
            client.last_error().as_deref(),
            Some("REQUEST_DEVICE_NAME failed: INVALID_DEVICE_NUMBER")
        );
    }

    #[tokio::test]
    async fn test_temperatures_decode() {
        let mock = Builder::new()
            .write(&request(
                Control::new(0).with_resync(),
                Order::RequestTemperature,
                &[6, 0, 6, 1],
            ))
            .read(&reply(0, ReplyCode::Ok, &[0x00, 0xD7, 0x7F, 0xFF]))
            .build();

        let client = client(mock);
        let readings = client
            .temperatures(&[
                (DeviceType::TemperatureSensor, 0),
                (DeviceType::TemperatureSensor, 1),
            ])
            .await
            .unwrap();
        assert_eq!(readings, vec![Some(21.5), None]);
    }

    #[tokio::test]
    async fn test_queue_slots_resends_after_queue_full() {
        let first = Slot::Delay { micros: 1 }.to_bytes().unwrap();
        let second = Slot::Delay { micros: 2 }.to_bytes().unwrap();
        let mut both = first.to_vec();
        both.extend_from_slice(&second);

        let status = |available: u16, used: u16| {
            QueueStatus {
                available,
                used,
                executed: 0,
            }
            .to_bytes()
            .to_vec()
        };
        let mut rejected = vec![QueueErrorCode::QueueFull as u8, 0x00, 0x01];
        rejected.extend(status(0, 2));

        let mock = Builder::new()
            .write(&request(
                Control::new(0).with_resync(),
                Order::QueueCommandBlocks,
                &[],
            ))
            .read(&reply(0, ReplyCode::Ok, &status(2, 0)))
            .write(&request(Control::new(1), Order::QueueCommandBlocks, &both))
            .read(&reply(1, ReplyCode::OrderSpecificError, &rejected))
            .write(&request(Control::new(2), Order::QueueCommandBlocks, &[]))
            .read(&reply(2, ReplyCode::Ok, &status(1, 1)))
            .write(&request(Control::new(3), Order::QueueCommandBlocks, &second))
            .read(&reply(3, ReplyCode::Ok, &status(0, 2)))
            .build();

        let client = client(mock).with_poll_interval(Duration::from_millis(1));
        let final_status = client
            .queue_slots(&[Slot::Delay { micros: 1 }, Slot::Delay { micros: 2 }])
            .await
            .unwrap();
        assert_eq!(final_status.used, 2);
    }

    #[tokio::test]
    async fn test_wait_for_temperature_reaches_band() {
        let mock = Builder::new()
            .write(&request(
                Control::new(0).with_resync(),
                Order::RequestTemperature,
                &[6, 0],
            ))
            .read(&reply(0, ReplyCode::Ok, &[0x00, 0xC8]))
            .write(&request(Control::new(1), Order::RequestTemperature, &[6, 0]))
            .read(&reply(1, ReplyCode::Ok, &[0x07, 0xD0]))
            .build();

        let client = client(mock).with_poll_interval(Duration::from_millis(1));
        let reading = client
            .wait_for_temperature(
                (DeviceType::TemperatureSensor, 0),
                200.0,
                2.0,
                Duration::from_secs(5),
            )
            .await
            .unwrap();
        assert_eq!(reading, 200.0);
    }
}
