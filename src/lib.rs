//! BLE client for the StrokeEngine motion controller.
//!
//! [`DeviceClient`] serializes every GATT exchange through a single task
//! queue, keeps a reconciled copy of the device status and reconnects on its
//! own, stopping the actuator if it went unobserved for too long.

pub mod domain;
pub mod error;
pub mod infrastructure;

pub use domain::models::{
    DeviceEvent, DeviceState, EventKind, Field, LinkState, Page, PatternDescriptor,
};
pub use domain::motion::PatternRequest;
pub use domain::settings::{ClientSettings, LogSettings, Settings, SettingsService};
pub use error::{ClientError, Result};
pub use infrastructure::bluetooth::simulator::SimulatedDevice;
pub use infrastructure::bluetooth::transport::Transport;
pub use infrastructure::bluetooth::DeviceClient;
pub use infrastructure::events::ListenerId;
