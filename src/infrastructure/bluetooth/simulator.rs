//! Simulated Device
//!
//! An in-process [`Transport`] that behaves like the device firmware: it
//! echoes commands, applies the off-by-one re-add on stroke/depth/sensation,
//! enforces page transitions and pushes status notifications. Used by the
//! demo binary and the test suites; it also records every write and can
//! inject failures.

use crate::domain::models::{DeviceState, Field, Page};
use crate::domain::navigation::{shortest_path, NAVIGATION_GRAPH};
use crate::error::{ClientError, Result};
use crate::infrastructure::bluetooth::protocol::{self, FAIL_PREFIX};
use crate::infrastructure::bluetooth::transport::{
    Characteristic, DisconnectHandler, NotifyHandler, Transport,
};
use crate::infrastructure::lock;
use async_trait::async_trait;
use serde_json::json;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tracing::{debug, info};
use uuid::Uuid;

/// Patterns advertised by the simulator: (name, description)
const PATTERNS: &[(&str, &str)] = &[
    ("Simple Stroke", "Acceleration, coasting, deceleration equally split"),
    ("Teasing Pounding", "Speed shifts with sensation"),
    ("Robo Stroke", "Sensation varies acceleration"),
    ("Half'n'Half", "Full and half depth strokes alternate"),
    ("Deeper", "Stroke depth increases per cycle"),
    ("Stop'n'Go", "Pauses between strokes"),
    ("Insist", "Sensation modifies stroke length"),
];

/// Fault injected into the next command exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandFault {
    /// Reply `fail:<command>`
    Reject,
    /// Reply with unrelated text
    Garble(String),
    /// Do not answer for this long before echoing
    Stall(Duration),
}

struct SimState {
    connected: bool,
    state: DeviceState,
    speed_knob_limit: bool,
    command_echo: String,
    description_index: Option<u32>,
    command_log: Vec<String>,
    connect_failures: u32,
    connect_attempts: u32,
    fault: Option<CommandFault>,
    transitional_echo: bool,
    knob_readback: Option<String>,
}

pub struct SimulatedDevice {
    sim: Mutex<SimState>,
    status_handler: Mutex<Option<NotifyHandler>>,
    disconnect_handler: Mutex<Option<DisconnectHandler>>,
    service: Uuid,
    command: Uuid,
    speed_knob: Uuid,
    status: Uuid,
    pattern_list: Uuid,
    pattern_description: Uuid,
}

fn known_uuid(s: &str) -> Uuid {
    Uuid::parse_str(s).unwrap_or_default()
}

impl Default for SimulatedDevice {
    fn default() -> Self {
        Self::new()
    }
}

impl SimulatedDevice {
    /// A device sitting on the menu page with everything at zero
    pub fn new() -> Self {
        Self {
            sim: Mutex::new(SimState {
                connected: false,
                state: DeviceState {
                    status: "menu.idle".to_string(),
                    ..Default::default()
                },
                speed_knob_limit: true,
                command_echo: String::new(),
                description_index: None,
                command_log: Vec::new(),
                connect_failures: 0,
                connect_attempts: 0,
                fault: None,
                transitional_echo: false,
                knob_readback: None,
            }),
            status_handler: Mutex::new(None),
            disconnect_handler: Mutex::new(None),
            service: known_uuid(protocol::SERVICE_UUID),
            command: known_uuid(protocol::COMMAND_CHAR_UUID),
            speed_knob: known_uuid(protocol::SPEED_KNOB_CHAR_UUID),
            status: known_uuid(protocol::STATUS_CHAR_UUID),
            pattern_list: known_uuid(protocol::PATTERN_LIST_CHAR_UUID),
            pattern_description: known_uuid(protocol::PATTERN_DESCRIPTION_CHAR_UUID),
        }
    }

    /// Current device-side state
    pub fn device_state(&self) -> DeviceState {
        lock(&self.sim).state.clone()
    }

    /// Every text written to the command characteristic, in order
    pub fn command_log(&self) -> Vec<String> {
        lock(&self.sim).command_log.clone()
    }

    pub fn clear_command_log(&self) {
        lock(&self.sim).command_log.clear();
    }

    pub fn connect_attempts(&self) -> u32 {
        lock(&self.sim).connect_attempts
    }

    pub fn speed_knob_limit(&self) -> bool {
        lock(&self.sim).speed_knob_limit
    }

    /// Fail the next `count` connect attempts
    pub fn fail_next_connects(&self, count: u32) {
        lock(&self.sim).connect_failures = count;
    }

    pub fn inject_fault(&self, fault: CommandFault) {
        lock(&self.sim).fault = Some(fault);
    }

    /// Push an intermediate `value - 1` status before every settled one
    pub fn set_transitional_echo(&self, enabled: bool) {
        lock(&self.sim).transitional_echo = enabled;
    }

    /// Make the speed knob characteristic read back this text
    pub fn override_knob_readback(&self, text: &str) {
        lock(&self.sim).knob_readback = Some(text.to_string());
    }

    /// Change state as if from the device's own controls, and notify
    pub fn external_change(&self, change: impl FnOnce(&mut DeviceState)) {
        let snapshot = {
            let mut sim = lock(&self.sim);
            change(&mut sim.state);
            sim.state.clone()
        };
        self.notify(&snapshot);
    }

    /// Send the current state on the status characteristic
    pub fn push_status(&self) {
        let snapshot = self.device_state();
        self.notify(&snapshot);
    }

    /// Push the current state periodically, like the firmware's heartbeat
    pub fn start_heartbeat(self: &std::sync::Arc<Self>, period: Duration) -> JoinHandle<()> {
        let device = std::sync::Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                let Some(device) = device.upgrade() else {
                    return;
                };
                if lock(&device.sim).connected {
                    device.push_status();
                }
            }
        })
    }

    /// Drop the link without the client asking for it
    pub fn simulate_link_loss(&self) {
        info!("Simulated device: link lost");
        lock(&self.sim).connected = false;
        let handler = lock(&self.disconnect_handler).clone();
        if let Some(handler) = handler {
            handler();
        }
    }

    fn notify(&self, state: &DeviceState) {
        if !lock(&self.sim).connected {
            return;
        }
        let payload = json!({
            "state": state.status,
            "speed": state.speed,
            "stroke": state.stroke,
            "depth": state.depth,
            "sensation": state.sensation,
            "pattern": state.pattern,
        });
        let handler = lock(&self.status_handler).clone();
        if let Some(handler) = handler {
            handler(payload.to_string().into_bytes());
        }
    }

    fn ensure_connected(&self) -> Result<()> {
        if lock(&self.sim).connected {
            Ok(())
        } else {
            Err(ClientError::Transport("not connected".to_string()))
        }
    }

    /// Apply a command; returns the states to notify, in order
    fn apply_command(sim: &mut SimState, text: &str) -> std::result::Result<Vec<DeviceState>, ()> {
        let parts: Vec<&str> = text.split(':').collect();
        match parts.as_slice() {
            ["go", page] => {
                let target = Page::from_wire(page).ok_or(())?;
                let current = sim.state.page().ok_or(())?;
                // Only direct transitions are accepted
                match shortest_path(NAVIGATION_GRAPH, current, target) {
                    Some(path) if path.len() <= 1 => {}
                    _ => return Err(()),
                }
                sim.state.status = format!("{}.idle", target.wire_name());
                Ok(vec![sim.state.clone()])
            }
            ["set", field, value] => {
                let field = Field::ALL
                    .into_iter()
                    .find(|f| f.wire_name() == *field)
                    .ok_or(())?;
                let received: u32 = value.parse().map_err(|_| ())?;
                let stored = match field {
                    Field::Pattern => {
                        if received as usize >= PATTERNS.len() {
                            return Err(());
                        }
                        received
                    }
                    Field::Speed => received.min(100),
                    // Firmware re-adds what the client took off
                    _ => match received {
                        0 | 100 => received,
                        r if r < 100 => r + 1,
                        _ => return Err(()),
                    },
                };

                let mut pushes = Vec::new();
                if sim.transitional_echo && field.is_percent() && stored > 0 {
                    let mut intermediate = sim.state.clone();
                    set_field(&mut intermediate, field, stored - 1);
                    pushes.push(intermediate);
                }
                set_field(&mut sim.state, field, stored);
                pushes.push(sim.state.clone());
                Ok(pushes)
            }
            _ => Err(()),
        }
    }
}

fn set_field(state: &mut DeviceState, field: Field, value: u32) {
    match field {
        Field::Speed => state.speed = value as u8,
        Field::Stroke => state.stroke = value as u8,
        Field::Depth => state.depth = value as u8,
        Field::Sensation => state.sensation = value as u8,
        Field::Pattern => state.pattern = value,
    }
}

#[async_trait]
impl Transport for SimulatedDevice {
    async fn connect(&self) -> Result<()> {
        let mut sim = lock(&self.sim);
        sim.connect_attempts += 1;
        if sim.connect_failures > 0 {
            sim.connect_failures -= 1;
            return Err(ClientError::Transport("device not in range".to_string()));
        }
        sim.connected = true;
        Ok(())
    }

    async fn disconnect(&self) -> Result<()> {
        lock(&self.sim).connected = false;
        Ok(())
    }

    async fn get_characteristic(&self, service: Uuid, characteristic: Uuid) -> Result<Characteristic> {
        self.ensure_connected()?;
        let known = [
            self.command,
            self.speed_knob,
            self.status,
            self.pattern_list,
            self.pattern_description,
        ];
        if service != self.service || !known.contains(&characteristic) {
            return Err(ClientError::Transport(format!(
                "characteristic {} not found",
                characteristic
            )));
        }
        Ok(Characteristic {
            service,
            uuid: characteristic,
        })
    }

    async fn write_value(&self, characteristic: &Characteristic, bytes: &[u8]) -> Result<()> {
        self.ensure_connected()?;
        let text = String::from_utf8_lossy(bytes).to_string();

        if characteristic.uuid == self.command {
            let (pushes, stall) = {
                let mut sim = lock(&self.sim);
                sim.command_log.push(text.clone());
                let fault = sim.fault.take();
                let stall = match &fault {
                    Some(CommandFault::Stall(d)) => Some(*d),
                    _ => None,
                };
                let (echo, pushes) = match fault {
                    Some(CommandFault::Reject) => (format!("{}{}", FAIL_PREFIX, text), Vec::new()),
                    Some(CommandFault::Garble(garbage)) => (garbage, Vec::new()),
                    _ => match Self::apply_command(&mut sim, &text) {
                        Ok(pushes) => (text.clone(), pushes),
                        Err(()) => (format!("{}{}", FAIL_PREFIX, text), Vec::new()),
                    },
                };
                sim.command_echo = echo;
                (pushes, stall)
            };
            debug!("Simulated device <- {}", text);
            if let Some(stall) = stall {
                tokio::time::sleep(stall).await;
            }
            for state in pushes {
                self.notify(&state);
            }
        } else if characteristic.uuid == self.speed_knob {
            let value = protocol::parse_bool_text(&text)?;
            lock(&self.sim).speed_knob_limit = value;
        } else if characteristic.uuid == self.pattern_description {
            let index = text
                .trim()
                .parse()
                .map_err(|_| ClientError::Transport(format!("bad pattern index '{}'", text)))?;
            lock(&self.sim).description_index = Some(index);
        } else {
            return Err(ClientError::Transport(format!(
                "characteristic {} is not writable",
                characteristic.uuid
            )));
        }
        Ok(())
    }

    async fn read_value(&self, characteristic: &Characteristic) -> Result<Vec<u8>> {
        self.ensure_connected()?;
        let sim = lock(&self.sim);

        let text = if characteristic.uuid == self.command {
            sim.command_echo.clone()
        } else if characteristic.uuid == self.speed_knob {
            sim.knob_readback
                .clone()
                .unwrap_or_else(|| protocol::bool_text(sim.speed_knob_limit).to_string())
        } else if characteristic.uuid == self.pattern_list {
            let list: Vec<_> = PATTERNS
                .iter()
                .enumerate()
                .map(|(idx, (name, _))| json!({ "name": name, "idx": idx }))
                .collect();
            serde_json::Value::Array(list).to_string()
        } else if characteristic.uuid == self.pattern_description {
            sim.description_index
                .and_then(|i| PATTERNS.get(i as usize))
                .map(|(_, description)| description.to_string())
                .unwrap_or_default()
        } else {
            return Err(ClientError::Transport(format!(
                "characteristic {} is not readable",
                characteristic.uuid
            )));
        };
        Ok(text.into_bytes())
    }

    async fn subscribe(&self, characteristic: &Characteristic, on_notify: NotifyHandler) -> Result<()> {
        self.ensure_connected()?;
        if characteristic.uuid != self.status {
            return Err(ClientError::Transport(format!(
                "characteristic {} does not notify",
                characteristic.uuid
            )));
        }
        *lock(&self.status_handler) = Some(on_notify);
        Ok(())
    }

    fn on_unsolicited_disconnect(&self, callback: DisconnectHandler) {
        *lock(&self.disconnect_handler) = Some(callback);
    }
}
