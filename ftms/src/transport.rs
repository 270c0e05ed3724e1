//! The GATT transport the gateway drives.
//!
//! Outbound primitives live on [`GattTransport`] and are fire-and-forget:
//! each call queues work and returns immediately. Inbound traffic (connects,
//! reads, writes, subscriptions, registration and advertising results) is
//! delivered by the transport calling the matching `Gateway::on_*` method.

use crate::gatt::{CharacteristicId, ClientId, ServiceId};

pub trait GattTransport: Send + Sync {
    /// Register one service. The transport answers with
    /// `Gateway::on_service_added`.
    fn register_service(&self, service: ServiceId);

    /// Begin advertising under `device_name`. The transport answers with
    /// `Gateway::on_advertising_result`.
    fn start_advertising(&self, device_name: &str);

    fn stop_advertising(&self);

    /// Push a value to one client. `indicate` asks for an acknowledged push.
    fn notify(&self, client: &ClientId, characteristic: CharacteristicId, value: &[u8], indicate: bool);

    /// Drop a client's link.
    fn disconnect(&self, client: &ClientId);
}

/// Answer to a characteristic read.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReadOutcome {
    Value(Vec<u8>),
    NotPermitted,
}

/// Answer to a characteristic write.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOutcome {
    /// Write accepted; any control-point result travels in the indication.
    Accepted,
    /// Zero-length control point write.
    InvalidLength,
    NotPermitted,
}
