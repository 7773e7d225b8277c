//! Transport Adapter
//!
//! The narrow interface the client needs from the host BLE stack. Device
//! discovery, pairing prompts and the GATT implementation itself live behind
//! it.

use crate::error::Result;
use async_trait::async_trait;
use std::sync::Arc;
use uuid::Uuid;

/// Resolved characteristic within a service
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Characteristic {
    pub service: Uuid,
    pub uuid: Uuid,
}

/// Called with the raw value of every notification
pub type NotifyHandler = Arc<dyn Fn(Vec<u8>) + Send + Sync>;

/// Called when the link drops without the client asking for it
pub type DisconnectHandler = Arc<dyn Fn() + Send + Sync>;

#[async_trait]
pub trait Transport: Send + Sync {
    async fn connect(&self) -> Result<()>;

    async fn disconnect(&self) -> Result<()>;

    async fn get_characteristic(&self, service: Uuid, characteristic: Uuid)
        -> Result<Characteristic>;

    async fn write_value(&self, characteristic: &Characteristic, bytes: &[u8]) -> Result<()>;

    async fn read_value(&self, characteristic: &Characteristic) -> Result<Vec<u8>>;

    async fn subscribe(&self, characteristic: &Characteristic, on_notify: NotifyHandler)
        -> Result<()>;

    /// Register the callback for unsolicited disconnects; replaces any earlier one
    fn on_unsolicited_disconnect(&self, callback: DisconnectHandler);
}
