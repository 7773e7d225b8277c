//! Page navigation and motion sequencing on top of the command exchanges.

use crate::domain::models::{Field, Page};
use crate::domain::motion::{choose_ordering, plan_writes, PatternRequest};
use crate::domain::navigation::{shortest_path, NAVIGATION_GRAPH};
use crate::error::{ClientError, Result};
use crate::infrastructure::bluetooth::commands::validate_field;
use crate::infrastructure::bluetooth::protocol::Command;
use crate::infrastructure::bluetooth::service::{ClientInner, DeviceClient};
use crate::infrastructure::lock;
use std::collections::HashSet;
use tracing::{debug, info};

/// How `move_to_position` reaches the new depth
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum PositionStrategy {
    /// Load the hold pattern and its parameters at standstill
    Prime,
    /// Hold pattern loaded and the device is where we left it
    Direct,
    /// Something moved the device since the last call
    StopAndMove,
}

fn choose_position_strategy(primed: bool, last: Option<u32>, cached_depth: u32) -> PositionStrategy {
    if !primed {
        PositionStrategy::Prime
    } else if last == Some(cached_depth) {
        PositionStrategy::Direct
    } else {
        PositionStrategy::StopAndMove
    }
}

impl ClientInner {
    async fn navigate_to(&self, target: Page) -> Result<()> {
        self.ensure_ready()?;
        let current = self.current_page().ok_or_else(|| {
            ClientError::InvalidState("current page is not known yet".to_string())
        })?;
        if current == target {
            return Ok(());
        }

        let path = shortest_path(NAVIGATION_GRAPH, current, target).ok_or_else(|| {
            ClientError::Unreachable {
                from: current.to_string(),
                to: target.to_string(),
            }
        })?;
        info!("Navigating {} -> {} via {:?}", current, target, path);

        for hop in path {
            self.send_command(Command::Go(hop).text(), false).await?;
            self.poll_until(
                Some(self.settings.navigation_timeout()),
                hop.wire_name(),
                || (self.current_page() == Some(hop)).then_some(()),
            )
            .await?;
        }
        Ok(())
    }

    /// Write fields in order with every changed field pending for the whole
    /// sequence. Stops with `Aborted` if the queue is cleared in between.
    async fn apply_writes(&self, writes: &[(Field, u32)]) -> Result<()> {
        let generation = self.queue.generation();
        let changed: Vec<(Field, u32)> = writes
            .iter()
            .copied()
            .filter(|(field, value)| self.cached_value(*field) != Some(*value))
            .collect();
        if changed.is_empty() {
            return Ok(());
        }

        let _guard = self.register_targets(&changed);
        for (field, value) in changed {
            if self.queue.generation() != generation {
                return Err(ClientError::Aborted(
                    "write sequence interrupted by a queue clear".to_string(),
                ));
            }
            self.send_field(field, value).await?;
        }
        Ok(())
    }

    async fn batch_set(&self, writes: &[(Field, i64)]) -> Result<()> {
        let mut seen = HashSet::new();
        let mut validated = Vec::with_capacity(writes.len());
        for &(field, value) in writes {
            if !seen.insert(field) {
                return Err(ClientError::InvalidInput(format!(
                    "{} appears more than once in the batch",
                    field
                )));
            }
            validated.push((field, validate_field(field, value)?));
        }

        self.ensure_ready()?;
        for &(field, value) in &validated {
            if field == Field::Pattern {
                self.ensure_pattern_known(value).await?;
            }
        }
        self.apply_writes(&validated).await
    }

    async fn run_pattern(&self, request: PatternRequest) -> Result<()> {
        request.validate()?;
        self.ensure_ready()?;

        let current = self
            .cached_state()
            .ok_or_else(|| ClientError::InvalidState("no status received yet".to_string()))?;
        if !current.page().is_some_and(|p| p.supports_motion()) {
            return Err(ClientError::InvalidState(format!(
                "patterns run on the {} page, device is in '{}'",
                Page::StrokeEngine,
                current.status
            )));
        }
        self.ensure_pattern_known(request.pattern).await?;

        let targets = request.targets();
        let writes = plan_writes(&current, &targets);
        info!(
            "Running pattern {} ({:?}, {} write(s))",
            request.pattern,
            choose_ordering(&current, &targets),
            writes.len()
        );
        self.apply_writes(&writes).await
    }

    async fn move_to_position(&self, position: i64, speed: i64) -> Result<()> {
        let position = validate_field(Field::Depth, position)?;
        let speed = validate_field(Field::Speed, speed)?;
        self.ensure_ready()?;

        let current = self
            .cached_state()
            .ok_or_else(|| ClientError::InvalidState("no status received yet".to_string()))?;
        if current.page() != Some(Page::StrokeEngine) {
            return Err(ClientError::InvalidState(format!(
                "position control runs on the {} page, device is in '{}'",
                Page::StrokeEngine,
                current.status
            )));
        }

        let hold = self.settings.hold_pattern;
        let primed = current.pattern == hold && current.stroke == 0 && current.sensation == 50;
        let last = *lock(&self.last_position);
        let strategy = choose_position_strategy(primed, last, current.depth as u32);
        debug!("Moving to {} at speed {} ({:?})", position, speed, strategy);

        match strategy {
            PositionStrategy::Prime => {
                self.ensure_pattern_known(hold).await?;
                if current.speed != 0 {
                    self.write_field(Field::Speed, 0).await?;
                }
                self.apply_writes(&[
                    (Field::Pattern, hold),
                    (Field::Stroke, 0),
                    (Field::Sensation, 50),
                    (Field::Depth, position),
                ])
                .await?;
                if speed != 0 {
                    self.write_field(Field::Speed, speed).await?;
                }
            }
            PositionStrategy::Direct => {
                let speed_cmd = Command::Set {
                    field: Field::Speed,
                    value: speed,
                };
                let depth_cmd = Command::Set {
                    field: Field::Depth,
                    value: position,
                };
                self.send_command(speed_cmd.text(), true).await?;
                self.send_command(depth_cmd.text(), true).await?;
            }
            PositionStrategy::StopAndMove => {
                self.write_field(Field::Speed, 0).await?;
                self.write_field(Field::Depth, position).await?;
                self.write_field(Field::Speed, speed).await?;
            }
        }

        *lock(&self.last_position) = Some(position);
        Ok(())
    }
}

impl DeviceClient {
    /// Switch page, walking through intermediate pages when there is no
    /// direct transition
    pub async fn navigate_to(&self, page: Page) -> Result<()> {
        self.inner.navigate_to(page).await
    }

    /// Apply several fields in the given order, each at most once
    pub async fn batch_set(&self, writes: &[(Field, i64)]) -> Result<()> {
        self.inner.batch_set(writes).await
    }

    /// Apply a pattern with its parameters, ordering writes so the actuator
    /// never speeds up into a wider range
    pub async fn run_pattern(&self, request: PatternRequest) -> Result<()> {
        self.inner.run_pattern(request).await
    }

    /// Drive to an absolute depth using the configured hold pattern
    pub async fn move_to_position(&self, position: i64, speed: i64) -> Result<()> {
        self.inner.move_to_position(position, speed).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::models::{DeviceEvent, EventKind};
    use crate::infrastructure::bluetooth::service::tests::{
        fast_settings, ready_client, HookedTransport, WAIT,
    };
    use crate::infrastructure::bluetooth::simulator::SimulatedDevice;
    use crate::infrastructure::lock;
    use pretty_assertions::assert_eq;
    use std::sync::{Arc, Mutex, Weak};
    use std::time::Duration;

    fn log(entries: &[&str]) -> Vec<String> {
        entries.iter().map(|s| s.to_string()).collect()
    }

    async fn on_stroke_engine() -> (DeviceClient, Arc<SimulatedDevice>) {
        let (client, device) = ready_client(fast_settings()).await;
        client.navigate_to(Page::StrokeEngine).await.unwrap();
        device.clear_command_log();
        (client, device)
    }

    fn pattern(speed: u8, min_depth: u8, max_depth: u8) -> PatternRequest {
        PatternRequest {
            pattern: 0,
            speed,
            min_depth,
            max_depth,
            intensity: 40,
            invert: None,
        }
    }

    #[test]
    fn test_position_strategy() {
        assert_eq!(choose_position_strategy(false, Some(40), 40), PositionStrategy::Prime);
        assert_eq!(choose_position_strategy(true, Some(40), 40), PositionStrategy::Direct);
        assert_eq!(choose_position_strategy(true, Some(40), 10), PositionStrategy::StopAndMove);
        assert_eq!(choose_position_strategy(true, None, 0), PositionStrategy::StopAndMove);
    }

    #[tokio::test]
    async fn test_navigate_direct_edge() {
        let (client, device) = ready_client(fast_settings()).await;
        client.navigate_to(Page::StrokeEngine).await.unwrap();
        assert_eq!(device.command_log(), log(&["go:strokeEngine"]));
        assert_eq!(client.current_page(), Some(Page::StrokeEngine));
    }

    #[tokio::test]
    async fn test_navigate_through_menu() {
        let (client, device) = ready_client(fast_settings()).await;
        device.external_change(|s| s.status = "simplePenetration.idle".to_string());
        client
            .wait_for_status("simplePenetration", WAIT)
            .await
            .unwrap();

        client.navigate_to(Page::StrokeEngine).await.unwrap();
        assert_eq!(device.command_log(), log(&["go:menu", "go:strokeEngine"]));
        assert_eq!(client.current_page(), Some(Page::StrokeEngine));
    }

    #[tokio::test]
    async fn test_navigate_to_current_page_is_noop() {
        let (client, device) = ready_client(fast_settings()).await;
        client.navigate_to(Page::Menu).await.unwrap();
        assert!(device.command_log().is_empty());
    }

    #[tokio::test]
    async fn test_navigate_with_unknown_page() {
        let (client, device) = ready_client(fast_settings()).await;
        device.external_change(|s| s.status = "calibration.running".to_string());
        client.wait_for_status("calibration", WAIT).await.unwrap();
        assert!(matches!(
            client.navigate_to(Page::StrokeEngine).await,
            Err(ClientError::InvalidState(_))
        ));
    }

    #[tokio::test]
    async fn test_run_pattern_requires_stroke_engine() {
        let (client, device) = ready_client(fast_settings()).await;
        assert!(matches!(
            client.run_pattern(pattern(30, 10, 70)).await,
            Err(ClientError::InvalidState(_))
        ));
        assert!(device.command_log().is_empty());
    }

    #[tokio::test]
    async fn test_run_pattern_rejects_bad_range() {
        let (client, device) = on_stroke_engine().await;
        assert!(matches!(
            client.run_pattern(pattern(30, 80, 20)).await,
            Err(ClientError::InvalidInput(_))
        ));
        assert!(device.command_log().is_empty());
    }

    #[tokio::test]
    async fn test_run_pattern_slowing_down_writes_speed_first() {
        let (client, device) = on_stroke_engine().await;
        device.external_change(|s| {
            s.speed = 80;
            s.depth = 50;
            s.stroke = 20;
        });

        client.run_pattern(pattern(30, 10, 70)).await.unwrap();
        assert_eq!(
            device.command_log(),
            log(&[
                "set:speed:30",
                "set:depth:69",
                "set:stroke:59",
                "set:sensation:39",
            ])
        );
    }

    #[tokio::test]
    async fn test_run_pattern_widening_raises_speed_last() {
        let (client, device) = on_stroke_engine().await;
        device.external_change(|s| {
            s.speed = 30;
            s.depth = 50;
            s.stroke = 20;
        });

        client.run_pattern(pattern(80, 10, 50)).await.unwrap();
        assert_eq!(
            device.command_log(),
            log(&["set:stroke:39", "set:sensation:39", "set:speed:80"])
        );
        let state = client.state().unwrap();
        assert_eq!((state.speed, state.depth, state.stroke), (80, 50, 40));
    }

    #[tokio::test]
    async fn test_run_pattern_neutral_writes_pattern_first() {
        let (client, device) = on_stroke_engine().await;
        device.external_change(|s| {
            s.speed = 10;
            s.depth = 60;
            s.stroke = 60;
        });
        let request = PatternRequest {
            pattern: 2,
            invert: Some(true),
            ..pattern(20, 0, 60)
        };
        client.run_pattern(request).await.unwrap();

        assert_eq!(
            device.command_log(),
            log(&["set:pattern:2", "set:speed:20", "set:sensation:29"])
        );
        assert_eq!(client.state().unwrap().sensation, 30);
    }

    #[tokio::test]
    async fn test_batch_set_rejects_duplicates() {
        let (client, device) = ready_client(fast_settings()).await;
        let result = client
            .batch_set(&[(Field::Speed, 10), (Field::Depth, 20), (Field::Speed, 30)])
            .await;
        assert!(matches!(result, Err(ClientError::InvalidInput(_))));
        assert!(device.command_log().is_empty());
    }

    #[tokio::test]
    async fn test_batch_set_publishes_once() {
        let (client, device) = ready_client(fast_settings()).await;
        let events = Arc::new(Mutex::new(Vec::new()));
        let sink = events.clone();
        client.add_event_listener(EventKind::StateChanged, move |e| {
            sink.lock().unwrap().push(e);
        });

        client
            .batch_set(&[(Field::Depth, 30), (Field::Speed, 10)])
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(device.command_log(), log(&["set:depth:29", "set:speed:10"]));
        let events = events.lock().unwrap().clone();
        assert_eq!(events.len(), 1);
        match &events[0] {
            DeviceEvent::StateChanged(state) => {
                assert_eq!((state.depth, state.speed), (30, 10))
            }
            other => panic!("unexpected event {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_move_to_position_strategies() {
        let (client, device) = on_stroke_engine().await;

        // Not primed: hold parameters first, speed last
        client.move_to_position(40, 20).await.unwrap();
        assert_eq!(
            device.command_log(),
            log(&["set:sensation:49", "set:depth:39", "set:speed:20"])
        );

        // Primed and unmoved: fire-and-forget speed and depth
        device.clear_command_log();
        client.move_to_position(60, 30).await.unwrap();
        assert_eq!(device.command_log(), log(&["set:speed:30", "set:depth:59"]));

        // Moved externally: stop, reposition, resume
        device.clear_command_log();
        device.external_change(|s| s.depth = 10);
        client.move_to_position(70, 30).await.unwrap();
        assert_eq!(
            device.command_log(),
            log(&["set:speed:0", "set:depth:69", "set:speed:30"])
        );
        assert_eq!(device.device_state().depth, 70);
    }

    #[tokio::test]
    async fn test_batch_targets_registered_once() {
        let device = Arc::new(SimulatedDevice::new());
        let transport = Arc::new(HookedTransport::new(device.clone()));
        let client = DeviceClient::new(transport.clone(), fast_settings());
        client.begin();
        client.wait_for_ready(WAIT).await.unwrap();
        device.push_status();
        client.get_state(WAIT).await.unwrap();

        // Without pushes the targets are only released by the batch itself
        transport.mute(true);
        let seen: Arc<Mutex<Vec<Vec<Field>>>> = Arc::new(Mutex::new(Vec::new()));
        let inner: Weak<_> = Arc::downgrade(&client.inner);
        let record = seen.clone();
        transport.on_write(move |text| {
            if !text.starts_with("set:") {
                return;
            }
            if let Some(inner) = inner.upgrade() {
                let fields = lock(&inner.reconciler).pending().fields();
                record.lock().unwrap().push(fields);
            }
        });

        client
            .batch_set(&[(Field::Depth, 30), (Field::Speed, 10)])
            .await
            .unwrap();
        assert_eq!(
            *seen.lock().unwrap(),
            vec![vec![Field::Speed, Field::Depth], vec![Field::Speed, Field::Depth]]
        );
        assert!(lock(&client.inner.reconciler).pending().is_empty());
        assert_eq!(
            device.command_log(),
            log(&["set:depth:29", "set:speed:9"])
        );
    }

    #[tokio::test]
    async fn test_move_to_position_validation() {
        let (client, device) = ready_client(fast_settings()).await;
        assert!(matches!(
            client.move_to_position(50, 10).await,
            Err(ClientError::InvalidState(_))
        ));
        assert!(matches!(
            client.move_to_position(101, 10).await,
            Err(ClientError::InvalidInput(_))
        ));
        assert!(device.command_log().is_empty());
    }
}
