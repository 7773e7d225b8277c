use anyhow::Context;
use std::sync::Arc;
use std::time::Duration;
use stroke_engine_client::infrastructure::logging::init_logger;
use stroke_engine_client::{
    DeviceClient, DeviceEvent, EventKind, Page, PatternRequest, SettingsService, SimulatedDevice,
};
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let settings = SettingsService::new()?;
    let _log_guard = init_logger(&settings.get().log_settings)?;
    info!(
        "Starting StrokeEngine client demo (settings: {})",
        settings.path().display()
    );

    let device = Arc::new(SimulatedDevice::new());
    let _heartbeat = device.start_heartbeat(Duration::from_secs(1));

    let client = DeviceClient::new(device.clone(), settings.get().client.clone());
    client.add_event_listener(EventKind::StateChanged, |event| {
        if let DeviceEvent::StateChanged(state) = event {
            info!(
                "{}: speed {} depth {} stroke {} sensation {} pattern {}",
                state.status, state.speed, state.depth, state.stroke, state.sensation, state.pattern
            );
        }
    });
    client.add_event_listener(EventKind::Disconnected, |_| warn!("Device disconnected"));

    client.begin();
    client
        .wait_for_ready(Some(Duration::from_secs(10)))
        .await
        .context("Device did not become ready")?;
    client.get_state(Some(Duration::from_secs(5))).await?;

    for pattern in client.get_pattern_list().await? {
        info!("Pattern {}: {} - {}", pattern.index, pattern.name, pattern.description);
    }

    client.navigate_to(Page::StrokeEngine).await?;
    client
        .run_pattern(PatternRequest {
            pattern: 1,
            speed: 30,
            min_depth: 20,
            max_depth: 60,
            intensity: 40,
            invert: Some(false),
        })
        .await?;
    tokio::time::sleep(Duration::from_secs(2)).await;

    client
        .run_pattern(PatternRequest {
            pattern: 1,
            speed: 60,
            min_depth: 10,
            max_depth: 80,
            intensity: 40,
            invert: Some(false),
        })
        .await?;
    tokio::time::sleep(Duration::from_secs(2)).await;

    client.stop().await?;
    for position in [20, 50, 80] {
        client.move_to_position(position, 25).await?;
        tokio::time::sleep(Duration::from_millis(500)).await;
    }

    client.end().await?;
    info!("Session ended");
    Ok(())
}
