//! BLE Connection Module
//!
//! Opens the link and resolves the characteristics the client talks to.

use crate::domain::settings::ClientSettings;
use crate::error::Result;
use crate::infrastructure::bluetooth::protocol;
use crate::infrastructure::bluetooth::queue::CancelSignal;
use crate::infrastructure::bluetooth::transport::{Characteristic, NotifyHandler, Transport};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// GATT layout and timing for opening a link
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    pub service_uuid: String,
    pub command_char_uuid: String,
    pub speed_knob_char_uuid: String,
    pub status_char_uuid: String,
    pub pattern_list_char_uuid: String,
    pub pattern_description_char_uuid: String,
    /// Pause between link-up and discovery
    pub connect_settle: Duration,
}

impl From<&ClientSettings> for ConnectionConfig {
    fn from(s: &ClientSettings) -> Self {
        Self {
            service_uuid: s.service_uuid.clone(),
            command_char_uuid: s.command_char_uuid.clone(),
            speed_knob_char_uuid: s.speed_knob_char_uuid.clone(),
            status_char_uuid: s.status_char_uuid.clone(),
            pattern_list_char_uuid: s.pattern_list_char_uuid.clone(),
            pattern_description_char_uuid: s.pattern_description_char_uuid.clone(),
            connect_settle: s.connect_settle(),
        }
    }
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self::from(&ClientSettings::default())
    }
}

/// Characteristics resolved during a successful connect
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeviceCharacteristics {
    pub command: Characteristic,
    pub speed_knob: Characteristic,
    pub status: Characteristic,
    pub pattern_list: Characteristic,
    pub pattern_description: Characteristic,
}

pub struct BleConnection {
    transport: Arc<dyn Transport>,
    config: ConnectionConfig,
}

impl BleConnection {
    pub fn new(transport: Arc<dyn Transport>, config: ConnectionConfig) -> Self {
        Self { transport, config }
    }

    /// Bring the link up, discover characteristics and subscribe to status
    pub async fn open(
        &self,
        signal: &CancelSignal,
        on_status: NotifyHandler,
    ) -> Result<DeviceCharacteristics> {
        info!("Opening link to device");

        // Step 1: Link up
        self.transport.connect().await?;

        // Step 2: The firmware can drop the link if discovery starts too early
        signal.sleep(self.config.connect_settle).await?;

        // Step 3: Resolve characteristics
        let characteristics = self.get_characteristics().await?;

        // Step 4: Status notifications
        self.transport
            .subscribe(&characteristics.status, on_status)
            .await?;
        info!("Subscribed to status notifications");

        Ok(characteristics)
    }

    async fn get_characteristics(&self) -> Result<DeviceCharacteristics> {
        let service = protocol::parse_uuid(&self.config.service_uuid)?;

        let resolve = |uuid: &str| {
            let uuid = protocol::parse_uuid(uuid);
            async move {
                let uuid = uuid?;
                let characteristic = self.transport.get_characteristic(service, uuid).await?;
                debug!("Found characteristic {}", uuid);
                Ok::<_, crate::error::ClientError>(characteristic)
            }
        };

        Ok(DeviceCharacteristics {
            command: resolve(&self.config.command_char_uuid).await?,
            speed_knob: resolve(&self.config.speed_knob_char_uuid).await?,
            status: resolve(&self.config.status_char_uuid).await?,
            pattern_list: resolve(&self.config.pattern_list_char_uuid).await?,
            pattern_description: resolve(&self.config.pattern_description_char_uuid).await?,
        })
    }
}
