//! Background tasks driving the simulated hardware.
//!
//! `SlotExecutor` pops slots off the command queue and plays them out in
//! simulated time. `ThermalModel` moves sensor readings toward heater targets.

use crate::handler::OrderHandler;
use pacer_core::{BasicLinearMove, Slot};
use pacer_protocol::{Order, StopCause, StopRecovery};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;

/// Executes queued slots one at a time.
pub struct SlotExecutor {
    handler: Arc<OrderHandler>,
    step_rate_hz: f64,
    slots_executed: AtomicU64,
    shutdown: AtomicBool,
    notify: Notify,
}

impl SlotExecutor {
    pub fn new(handler: Arc<OrderHandler>) -> Self {
        let step_rate_hz = handler.config().firmware.step_rate_hz.max(1) as f64;
        Self {
            handler,
            step_rate_hz,
            slots_executed: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Runs the execution loop (call from a background task).
    pub async fn run(&self) {
        tracing::info!(
            "Slot executor started ({} steps/s at full speed)",
            self.step_rate_hz
        );

        loop {
            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            let Some(slot) = self.handler.queue().dequeue() else {
                tokio::select! {
                    _ = self.handler.work().notified() => {}
                    _ = self.notify.notified() => {}
                }
                continue;
            };

            let duration = self.execute(slot);
            if !duration.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(duration) => {}
                    _ = self.notify.notified() => {}
                }
            }

            // A stop raised mid-slot aborts it.
            if !self.handler.is_stopped() {
                self.handler.queue().mark_executed();
                self.slots_executed.fetch_add(1, Ordering::Relaxed);
            }
        }

        tracing::info!("Slot executor stopped");
    }

    /// Applies a slot's effects and returns how long it takes to play out.
    pub fn execute(&self, slot: Slot) -> Duration {
        match slot {
            Slot::Command { order, params } => {
                let result = Order::try_from(order)
                    .map_err(|e| e.to_string())
                    .and_then(|order| {
                        self.handler
                            .execute(order, &params)
                            .map_err(|e| e.to_string())
                    });
                if let Err(e) = result {
                    tracing::warn!(order, "Queued command failed: {}", e);
                    self.fault(StopCause::DeviceFault);
                }
                Duration::ZERO
            }
            Slot::Delay { micros } => Duration::from_micros(micros as u64),
            Slot::ActiveToolhead { index } => {
                self.handler.devices().active_toolhead = index;
                Duration::ZERO
            }
            Slot::BasicLinearMove(linear) => self.execute_move(&linear),
        }
    }

    fn execute_move(&self, linear: &BasicLinearMove) -> Duration {
        let mut devices = self.handler.devices();
        if !devices.stepper_control {
            drop(devices);
            tracing::warn!("Move executed without stepper control");
            self.fault(StopCause::MovementError);
            return Duration::ZERO;
        }

        for (axis, _) in linear.axes() {
            let ready = devices
                .steppers
                .get(axis as usize)
                .is_some_and(|s| s.enabled);
            if !ready {
                drop(devices);
                tracing::warn!(axis, "Move addresses a missing or disabled stepper");
                self.fault(StopCause::MovementError);
                return Duration::ZERO;
            }
        }

        for (axis, steps) in linear.axes() {
            let stepper = &mut devices.steppers[axis as usize];
            let endstop = stepper.endstop;
            let triggered = if linear.homing {
                stepper.position = 0;
                Some(true)
            } else {
                stepper.position += steps as i64;
                (steps > 0).then_some(false)
            };
            if let (Some(input), Some(level)) = (endstop, triggered) {
                if let Some(input) = devices.inputs.get_mut(input as usize) {
                    input.high = level;
                }
            }
        }

        let speed = linear.nominal_speed.max(1) as f64 / u8::MAX as f64;
        Duration::from_secs_f64(linear.max_steps() as f64 / (self.step_rate_hz * speed))
    }

    fn fault(&self, cause: StopCause) {
        self.handler
            .enter_stopped(cause, StopRecovery::Recoverable, false);
    }

    /// Signals the executor to shut down.
    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }

    pub fn slots_executed(&self) -> u64 {
        self.slots_executed.load(Ordering::Relaxed)
    }
}

/// Exponential heating and cooling of every sensor.
pub struct ThermalModel {
    handler: Arc<OrderHandler>,
    shutdown: AtomicBool,
    notify: Notify,
}

impl ThermalModel {
    pub fn new(handler: Arc<OrderHandler>) -> Self {
        Self {
            handler,
            shutdown: AtomicBool::new(false),
            notify: Notify::new(),
        }
    }

    /// Runs the thermal loop (call from a background task).
    pub async fn run(&self) {
        let firmware = self.handler.config().firmware.clone();
        let tick = firmware.thermal_tick();
        let mut interval = tokio::time::interval(tick);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = interval.tick() => {}
                _ = self.notify.notified() => {}
            }

            if self.shutdown.load(Ordering::Relaxed) {
                break;
            }

            self.handler.devices().thermal_step(
                tick.as_secs_f64(),
                firmware.thermal_time_constant_secs,
                firmware.ambient_temperature,
            );
        }

        tracing::debug!("Thermal model stopped");
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
        self.notify.notify_one();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use pacer_protocol::{ReplyCode, ResumeFlags};

    fn running() -> Arc<OrderHandler> {
        let mut config = Config::default();
        config.firmware.step_rate_hz = 1_000_000;
        let handler = Arc::new(OrderHandler::new(config));
        handler.handle(Order::Resume as u8, &[ResumeFlags::clear().bits()]);
        handler.handle(Order::ActivateStepperControl as u8, &[1]);
        handler.handle(Order::EnableDisableSteppers as u8, &[]);
        handler
    }

    #[test]
    fn test_move_updates_positions() {
        let handler = running();
        let executor = SlotExecutor::new(handler.clone());

        let mut linear = BasicLinearMove::new(0)
            .with_axis(0, 1000)
            .unwrap()
            .with_axis(1, -250)
            .unwrap();
        linear.nominal_speed = 255;
        let duration = executor.execute(Slot::BasicLinearMove(linear));

        assert!((duration.as_secs_f64() - 0.001).abs() < 1e-9);
        let devices = handler.devices();
        assert_eq!(devices.steppers[0].position, 1000);
        assert_eq!(devices.steppers[1].position, -250);
    }

    #[test]
    fn test_homing_triggers_endstop() {
        let handler = running();
        let executor = SlotExecutor::new(handler.clone());
        handler.devices().steppers[2].position = 500;

        let mut linear = BasicLinearMove::new(2).with_axis(2, -900).unwrap();
        linear.homing = true;
        executor.execute(Slot::BasicLinearMove(linear));

        let devices = handler.devices();
        assert_eq!(devices.steppers[2].position, 0);
        assert!(devices.inputs[2].high);
        assert!(!devices.inputs[0].high);
    }

    #[test]
    fn test_disabled_stepper_faults() {
        let handler = running();
        handler.handle(Order::EnableDisableSteppers as u8, &[1, 0]);
        let executor = SlotExecutor::new(handler.clone());

        let linear = BasicLinearMove::new(1).with_axis(1, 10).unwrap();
        executor.execute(Slot::BasicLinearMove(linear));

        let response = handler.handle(Order::RequestInformation as u8, &[0]);
        assert_eq!(response.code, ReplyCode::Stopped);
        assert!(response.event);
    }

    #[test]
    fn test_queued_command_runs() {
        let handler = running();
        let executor = SlotExecutor::new(handler.clone());

        executor.execute(Slot::Command {
            order: Order::SetOutput as u8,
            params: bytes::Bytes::from_static(&[1, 1]),
        });
        assert_eq!(
            handler.devices().outputs[1].drive,
            crate::device::OutputDrive::High
        );
        assert_eq!(
            executor.execute(Slot::Delay { micros: 1500 }),
            Duration::from_micros(1500)
        );
    }

    #[tokio::test]
    async fn test_run_drains_queue() {
        let handler = running();
        let executor = Arc::new(SlotExecutor::new(handler.clone()));
        let task = {
            let executor = executor.clone();
            tokio::spawn(async move { executor.run().await })
        };

        let mut raw = bytes::BytesMut::new();
        for micros in [100, 200, 300] {
            Slot::Delay { micros }.encode(&mut raw).unwrap();
        }
        let response = handler.handle(Order::QueueCommandBlocks as u8, &raw);
        assert_eq!(response.code, ReplyCode::Ok);

        for _ in 0..100 {
            if handler.queue().executed() == 3 {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(handler.queue().executed(), 3);
        assert_eq!(executor.slots_executed(), 3);

        executor.shutdown();
        task.await.unwrap();
    }
}
