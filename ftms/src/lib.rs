//! FTMS gateway: exposes a treadmill to fitness apps over Bluetooth LE.
//!
//! The [`gateway::Gateway`] sits between a [`telemetry::Treadmill`] and a
//! [`transport::GattTransport`]. Transports report client activity by
//! calling the gateway's `on_*` methods; the gateway answers through the
//! transport trait.

pub mod advertising;
pub mod ble_transport;
pub mod config;
pub mod control;
pub mod debug_server;
pub mod error;
pub mod gateway;
pub mod gatt;
pub mod notifier;
pub mod protocol;
pub mod session;
pub mod telemetry;
pub mod transport;
pub mod treadmill;
