//! Bluetooth Module
//!
//! Provides the BLE client for the stroke engine.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────┐
//! │                      DeviceClient                        │
//! │  (Session coordinator - public API for the application)  │
//! └──────────┬──────────────────┬──────────────────┬────────┘
//!            │                  │                  │
//!            ▼                  ▼                  ▼
//! ┌────────────────┐  ┌──────────────────┐  ┌──────────────┐
//! │    Control     │  │     Commands     │  │  Connection  │
//! │ - Navigation   │─▶│ - Setters        │  │ - Link up    │
//! │ - Motion order │  │ - Echo checks    │  │ - GATT       │
//! │ - Positioning  │  │ - Patterns/knob  │  │   discovery  │
//! └────────────────┘  └────────┬─────────┘  └──────┬───────┘
//!                              ▼                   │
//!                     ┌──────────────────┐         │
//!                     │ SerialTaskQueue  │◀────────┘
//!                     └────────┬─────────┘
//!                              ▼
//!                     ┌──────────────────┐
//!                     │    Transport     │  (host BLE stack or simulator)
//!                     └──────────────────┘
//! ```
//!
//! ## Modules
//!
//! - [`protocol`] - UUIDs, command text, status and pattern payload parsing
//! - [`transport`] - Interface to the host BLE stack
//! - [`queue`] - Serial task queue with generation-based clearing
//! - [`connection`] - Link establishment and characteristic discovery
//! - [`service`] - Session lifecycle, status handling and events
//! - [`commands`] - Command exchanges and raw setters
//! - [`control`] - Navigation, pattern runs and position control
//! - [`simulator`] - In-process device for demos and tests

pub mod commands;
pub mod connection;
pub mod control;
pub mod protocol;
pub mod queue;
pub mod service;
pub mod simulator;
pub mod transport;

pub use service::DeviceClient;
