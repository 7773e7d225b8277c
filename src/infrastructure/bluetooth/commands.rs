//! Command exchanges
//!
//! Every write/read-back pair goes through the task queue as one unit, so a
//! read can only ever see the echo of its own write.

use crate::domain::models::{Field, PatternDescriptor};
use crate::error::{ClientError, Result};
use crate::infrastructure::bluetooth::protocol::{self, Command};
use crate::infrastructure::bluetooth::queue::CancelSignal;
use crate::infrastructure::bluetooth::service::{ClientInner, DeviceClient};
use crate::infrastructure::bluetooth::transport::{Characteristic, Transport};
use crate::infrastructure::lock;
use std::time::Duration;
use tracing::{debug, info};

/// Check a setter argument and narrow it to the wire range
pub(crate) fn validate_field(field: Field, value: i64) -> Result<u32> {
    let valid = if field.is_percent() {
        (0..=100).contains(&value)
    } else {
        value >= 0 && value <= u32::MAX as i64
    };
    if !valid {
        let expected = if field.is_percent() {
            "an integer in 0..=100"
        } else {
            "a non-negative pattern index"
        };
        return Err(ClientError::InvalidInput(format!(
            "{} must be {}, got {}",
            field, expected, value
        )));
    }
    Ok(value as u32)
}

/// One command exchange on an already running unit: write, then unless
/// `speedup` wait `settle` and check the echo
pub(crate) async fn exchange(
    transport: &dyn Transport,
    command: &Characteristic,
    text: &str,
    speedup: bool,
    settle: Duration,
    signal: &CancelSignal,
) -> Result<()> {
    transport.write_value(command, text.as_bytes()).await?;
    if speedup {
        return Ok(());
    }
    signal.sleep(settle).await?;
    let echo = transport.read_value(command).await?;
    protocol::classify_echo(text, &String::from_utf8(echo)?)
}

impl ClientInner {
    /// Write `text` to the command characteristic and, unless `speedup`,
    /// verify the echo after the settle delay
    pub(crate) async fn send_command(&self, text: String, speedup: bool) -> Result<()> {
        let characteristics = self.characteristics()?;
        let transport = self.transport.clone();
        let settle = self.settings.command_settle();
        debug!("-> {}{}", text, if speedup { " (no read-back)" } else { "" });

        self.queue
            .enqueue_with_timeout(
                move |signal| async move {
                    exchange(
                        transport.as_ref(),
                        &characteristics.command,
                        &text,
                        speedup,
                        settle,
                        &signal,
                    )
                    .await
                },
                self.settings.command_timeout(),
            )
            .await
    }

    /// Send `set:<field>:<value>` with `value` pending until the device reports it
    pub(crate) async fn write_field(&self, field: Field, value: u32) -> Result<()> {
        let _guard = self.register_targets(&[(field, value)]);
        self.send_field(field, value).await
    }

    /// Verified `set:` without touching pending targets; the caller owns them
    pub(crate) async fn send_field(&self, field: Field, value: u32) -> Result<()> {
        self.send_command(Command::Set { field, value }.text(), false)
            .await
    }

    pub(crate) async fn set_field(&self, field: Field, value: i64) -> Result<()> {
        let value = validate_field(field, value)?;
        self.ensure_ready()?;
        if field == Field::Pattern {
            self.ensure_pattern_known(value).await?;
        }
        if self.cached_value(field) == Some(value) {
            debug!("{} already at {}", field, value);
            return Ok(());
        }
        self.write_field(field, value).await
    }

    pub(crate) async fn ensure_pattern_known(&self, index: u32) -> Result<()> {
        let patterns = self.pattern_list(false).await?;
        if patterns.iter().any(|p| p.index == index) {
            Ok(())
        } else {
            Err(ClientError::InvalidInput(format!(
                "pattern {} is not offered by the device ({} known)",
                index,
                patterns.len()
            )))
        }
    }

    pub(crate) async fn pattern_list(&self, refresh: bool) -> Result<Vec<PatternDescriptor>> {
        if !refresh {
            if let Some(patterns) = lock(&self.patterns).clone() {
                return Ok(patterns);
            }
        }
        self.fetch_pattern_list().await
    }

    async fn fetch_pattern_list(&self) -> Result<Vec<PatternDescriptor>> {
        let characteristics = self.characteristics()?;
        let transport = self.transport.clone();
        let bytes = self
            .queue
            .enqueue_with_timeout(
                move |_signal| async move { transport.read_value(&characteristics.pattern_list).await },
                self.settings.command_timeout(),
            )
            .await?;

        let entries = protocol::parse_pattern_list(&bytes)?;
        let mut patterns = Vec::with_capacity(entries.len());
        for (name, index) in entries {
            let description = self.fetch_pattern_description(index).await?;
            patterns.push(PatternDescriptor {
                name,
                index,
                description,
            });
        }
        debug!("Fetched {} patterns", patterns.len());

        *lock(&self.patterns) = Some(patterns.clone());
        Ok(patterns)
    }

    pub(crate) async fn fetch_pattern_description(&self, index: u32) -> Result<String> {
        let characteristics = self.characteristics()?;
        let transport = self.transport.clone();
        let settle = self.settings.command_settle();
        self.queue
            .enqueue_with_timeout(
                move |signal| async move {
                    transport
                        .write_value(
                            &characteristics.pattern_description,
                            index.to_string().as_bytes(),
                        )
                        .await?;
                    signal.sleep(settle).await?;
                    let bytes = transport
                        .read_value(&characteristics.pattern_description)
                        .await?;
                    Ok(String::from_utf8(bytes)?)
                },
                self.settings.command_timeout(),
            )
            .await
    }

    async fn set_speed_knob_config(&self, limit: bool) -> Result<()> {
        let characteristics = self.characteristics()?;
        let transport = self.transport.clone();
        let settle = self.settings.command_settle();
        info!("Setting speed knob limit to {}", limit);

        let confirmed = self
            .queue
            .enqueue_with_timeout(
                move |signal| async move {
                    transport
                        .write_value(
                            &characteristics.speed_knob,
                            protocol::bool_text(limit).as_bytes(),
                        )
                        .await?;
                    signal.sleep(settle).await?;
                    let bytes = transport.read_value(&characteristics.speed_knob).await?;
                    protocol::parse_bool_text(&String::from_utf8(bytes)?)
                },
                self.settings.command_timeout(),
            )
            .await?;

        if confirmed != limit {
            return Err(ClientError::DataError(format!(
                "speed knob limit reads back {} after writing {}",
                confirmed, limit
            )));
        }
        Ok(())
    }

    async fn get_speed_knob_config(&self) -> Result<bool> {
        let characteristics = self.characteristics()?;
        let transport = self.transport.clone();
        let bytes = self
            .queue
            .enqueue_with_timeout(
                move |_signal| async move { transport.read_value(&characteristics.speed_knob).await },
                self.settings.command_timeout(),
            )
            .await?;
        protocol::parse_bool_text(&String::from_utf8(bytes)?)
    }
}

impl DeviceClient {
    /// Raw command access. With `speedup` the echo is not checked; only use
    /// it for streaming motion updates.
    pub async fn send_command(&self, text: &str, speedup: bool) -> Result<()> {
        self.inner.send_command(text.to_string(), speedup).await
    }

    pub async fn set_speed(&self, value: i64) -> Result<()> {
        self.inner.set_field(Field::Speed, value).await
    }

    pub async fn set_stroke(&self, value: i64) -> Result<()> {
        self.inner.set_field(Field::Stroke, value).await
    }

    pub async fn set_depth(&self, value: i64) -> Result<()> {
        self.inner.set_field(Field::Depth, value).await
    }

    pub async fn set_sensation(&self, value: i64) -> Result<()> {
        self.inner.set_field(Field::Sensation, value).await
    }

    /// Select a pattern by device index; the index must be in the pattern list
    pub async fn set_pattern(&self, index: i64) -> Result<()> {
        self.inner.set_field(Field::Pattern, index).await
    }

    /// Patterns offered by the device, fetched once and cached
    pub async fn get_pattern_list(&self) -> Result<Vec<PatternDescriptor>> {
        self.inner.pattern_list(false).await
    }

    pub async fn refresh_pattern_list(&self) -> Result<Vec<PatternDescriptor>> {
        self.inner.pattern_list(true).await
    }

    pub async fn get_pattern_description(&self, index: u32) -> Result<String> {
        self.inner.fetch_pattern_description(index).await
    }

    /// Limit the physical speed knob to the configured speed
    pub async fn set_speed_knob_config(&self, limit: bool) -> Result<()> {
        self.inner.set_speed_knob_config(limit).await
    }

    pub async fn get_speed_knob_config(&self) -> Result<bool> {
        self.inner.get_speed_knob_config().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{DeviceEvent, EventKind};
    use crate::infrastructure::bluetooth::service::tests::{fast_settings, ready_client};
    use crate::infrastructure::bluetooth::simulator::{CommandFault, SimulatedDevice};
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex};
    use std::time::Duration;

    fn log(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn test_validate_field_ranges() {
        assert_eq!(validate_field(Field::Speed, 0), Ok(0));
        assert_eq!(validate_field(Field::Depth, 100), Ok(100));
        assert_eq!(validate_field(Field::Pattern, 250), Ok(250));
        for (field, value) in [
            (Field::Speed, 101),
            (Field::Stroke, -1),
            (Field::Sensation, 1000),
            (Field::Pattern, -3),
        ] {
            assert!(matches!(
                validate_field(field, value),
                Err(ClientError::InvalidInput(_))
            ));
        }
    }

    #[tokio::test]
    async fn test_invalid_input_rejected_before_io() {
        let (client, device) = ready_client(fast_settings()).await;
        assert!(matches!(
            client.set_speed(101).await,
            Err(ClientError::InvalidInput(_))
        ));
        assert!(matches!(
            client.set_depth(-5).await,
            Err(ClientError::InvalidInput(_))
        ));
        assert!(device.command_log().is_empty());
    }

    #[tokio::test]
    async fn test_every_speed_in_range_accepted() {
        let (client, device) = ready_client(fast_settings()).await;
        for v in 0..=100 {
            assert_eq!(client.set_speed(v).await, Ok(()), "speed {}", v);
            assert_eq!(client.state().unwrap().speed as i64, v);
        }
        // 0 was already cached, so only 1..=100 reached the wire
        assert_eq!(device.command_log().len(), 100);
        assert_eq!(device.device_state().speed, 100);
    }

    #[tokio::test]
    async fn test_setter_requires_ready() {
        let device = Arc::new(SimulatedDevice::new());
        let client = DeviceClient::new(device.clone(), fast_settings());
        assert_eq!(client.set_speed(10).await, Err(ClientError::NotReady));
        assert!(matches!(
            client.set_speed(200).await,
            Err(ClientError::InvalidInput(_))
        ));
    }

    #[tokio::test]
    async fn test_compensated_payloads() {
        let (client, device) = ready_client(fast_settings()).await;
        client.set_depth(50).await.unwrap();
        client.set_stroke(100).await.unwrap();
        client.set_sensation(99).await.unwrap();
        client.set_speed(30).await.unwrap();

        assert_eq!(
            device.command_log(),
            log(&[
                "set:depth:49",
                "set:stroke:100",
                "set:sensation:98",
                "set:speed:30",
            ])
        );
        let state = client.state().unwrap();
        assert_eq!(
            (state.depth, state.stroke, state.sensation, state.speed),
            (50, 100, 99, 30)
        );
    }

    #[tokio::test]
    async fn test_setter_skips_value_already_cached() {
        let (client, device) = ready_client(fast_settings()).await;
        client.set_speed(0).await.unwrap();
        client.set_depth(40).await.unwrap();
        client.set_depth(40).await.unwrap();
        assert_eq!(device.command_log(), log(&["set:depth:39"]));
    }

    #[tokio::test]
    async fn test_transitional_echo_publishes_once() {
        let (client, device) = ready_client(fast_settings()).await;
        device.set_transitional_echo(true);

        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        client.add_event_listener(EventKind::StateChanged, move |e| {
            sink.lock().unwrap().push(e);
        });

        client.set_depth(60).await.unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        let events = events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        match &events[0] {
            DeviceEvent::StateChanged(state) => assert_eq!(state.depth, 60),
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_rejected_command() {
        let (client, device) = ready_client(fast_settings()).await;
        device.inject_fault(CommandFault::Reject);
        assert_eq!(
            client.set_speed(10).await,
            Err(ClientError::OperationFailed("set:speed:10".to_string()))
        );
        // Pending target released, the next setter works normally
        client.set_speed(10).await.unwrap();
        assert_eq!(client.state().unwrap().speed, 10);
    }

    #[tokio::test]
    async fn test_garbled_echo() {
        let (client, device) = ready_client(fast_settings()).await;
        device.inject_fault(CommandFault::Garble("set:depth:3".to_string()));
        assert_eq!(
            client.set_speed(10).await,
            Err(ClientError::UnexpectedResponse {
                command: "set:speed:10".to_string(),
                response: "set:depth:3".to_string(),
            })
        );
    }

    #[tokio::test]
    async fn test_speedup_skips_read_back() {
        let (client, device) = ready_client(fast_settings()).await;
        device.inject_fault(CommandFault::Garble("noise".to_string()));
        client.send_command("set:speed:5", true).await.unwrap();
        assert_eq!(device.command_log(), log(&["set:speed:5"]));
    }

    #[tokio::test]
    async fn test_stalled_exchange_times_out() {
        let (client, device) = ready_client(fast_settings()).await;
        device.inject_fault(CommandFault::Stall(Duration::from_secs(5)));
        assert!(matches!(
            client.set_speed(20).await,
            Err(ClientError::Timeout(_))
        ));
    }

    #[tokio::test]
    async fn test_pattern_list_with_descriptions() {
        let (client, _device) = ready_client(fast_settings()).await;
        let patterns = client.get_pattern_list().await.unwrap();
        assert_eq!(patterns.len(), 7);
        assert_eq!(patterns[1].name, "Teasing Pounding");
        assert_eq!(patterns[1].index, 1);
        assert_eq!(patterns[1].description, "Speed shifts with sensation");

        assert_eq!(
            client.get_pattern_description(3).await.unwrap(),
            "Full and half depth strokes alternate"
        );
    }

    #[tokio::test]
    async fn test_set_pattern_checks_membership() {
        let (client, device) = ready_client(fast_settings()).await;
        assert!(matches!(
            client.set_pattern(42).await,
            Err(ClientError::InvalidInput(_))
        ));
        assert!(matches!(
            client.set_pattern(-1).await,
            Err(ClientError::InvalidInput(_))
        ));
        client.set_pattern(3).await.unwrap();
        assert_eq!(device.command_log(), log(&["set:pattern:3"]));
        assert_eq!(client.state().unwrap().pattern, 3);
    }

    #[tokio::test]
    async fn test_speed_knob_round_trip() {
        let (client, device) = ready_client(fast_settings()).await;
        assert!(client.get_speed_knob_config().await.unwrap());
        client.set_speed_knob_config(false).await.unwrap();
        assert!(!device.speed_knob_limit());
        assert!(!client.get_speed_knob_config().await.unwrap());
    }

    #[tokio::test]
    async fn test_speed_knob_mismatch() {
        let (client, device) = ready_client(fast_settings()).await;
        device.override_knob_readback("true");
        assert!(matches!(
            client.set_speed_knob_config(false).await,
            Err(ClientError::DataError(_))
        ));

        device.override_knob_readback("maybe");
        assert!(matches!(
            client.get_speed_knob_config().await,
            Err(ClientError::DataError(_))
        ));
    }
}
