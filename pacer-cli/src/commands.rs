//! One-shot controller queries.

use colored::Colorize;
use pacer_client::Client;
use pacer_motion::MachineConfig;
use pacer_protocol::{DeviceType, InfoKind};
use serde_json::{json, Value};
use std::sync::Arc;

const DEVICE_TYPES: [DeviceType; 7] = [
    DeviceType::Input,
    DeviceType::Output,
    DeviceType::Pwm,
    DeviceType::Stepper,
    DeviceType::Heater,
    DeviceType::TemperatureSensor,
    DeviceType::Buzzer,
];

/// Describes each controller: identity, protocol version, queue and devices.
pub async fn info(clients: &[Arc<Client>]) -> Result<String, Box<dyn std::error::Error>> {
    let mut output = String::new();

    for (index, client) in clients.iter().enumerate() {
        let firmware = client.firmware_name().await?;
        let board = text(&client.request_information(InfoKind::BoardName).await?);
        let serial = text(&client.request_information(InfoKind::BoardSerial).await?);
        let major = client.request_information(InfoKind::ProtocolVersionMajor).await?;
        let minor = client.request_information(InfoKind::ProtocolVersionMinor).await?;
        let capacity = client.queue_capacity().await?;

        output.push_str(&format!(
            "{}\n  Firmware: {}\n  Board: {} ({})\n  Protocol: {}.{}\n  Queue capacity: {}\n",
            format!("Controller {}", index).bold(),
            firmware.cyan(),
            board,
            serial,
            major.first().copied().unwrap_or(0),
            minor.first().copied().unwrap_or(0),
            capacity
        ));

        for device in DEVICE_TYPES {
            let count = client.device_count(device).await?;
            if count == 0 {
                continue;
            }
            let mut names = Vec::with_capacity(count as usize);
            for number in 0..count {
                names.push(client.device_name(device, number).await?);
            }
            output.push_str(&format!(
                "  {} x{}: {}\n",
                device.to_string().yellow(),
                count,
                names.join(", ")
            ));
        }
    }

    Ok(output.trim_end().to_string())
}

/// Queue counters per controller and heater readings, as JSON.
pub async fn status(
    clients: &[Arc<Client>],
    config: &MachineConfig,
) -> Result<String, Box<dyn std::error::Error>> {
    let mut controllers = Vec::new();
    for (index, client) in clients.iter().enumerate() {
        let entry = match client.queue_status().await {
            Ok(status) => json!({
                "index": index,
                "queue": {
                    "available": status.available,
                    "used": status.used,
                    "executed": status.executed,
                },
            }),
            Err(e) => json!({ "index": index, "error": e.to_string() }),
        };
        controllers.push(entry);
    }

    let mut heaters = serde_json::Map::new();
    for (name, heater) in &config.heaters {
        let value = match clients.get(heater.controller) {
            Some(client) => match client
                .temperatures(&[(DeviceType::TemperatureSensor, heater.sensor)])
                .await
            {
                Ok(readings) => json!({ "celsius": readings.first().copied().flatten() }),
                Err(e) => json!({ "error": e.to_string() }),
            },
            None => json!({ "error": format!("no controller {}", heater.controller) }),
        };
        heaters.insert(name.clone(), value);
    }

    Ok(format_json(&json!({
        "controllers": controllers,
        "heaters": heaters,
    })))
}

fn text(bytes: &[u8]) -> String {
    String::from_utf8_lossy(bytes).into_owned()
}

/// Formats JSON for display.
fn format_json(value: &Value) -> String {
    serde_json::to_string_pretty(value).unwrap_or_else(|_| value.to_string())
}
