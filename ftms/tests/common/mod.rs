#![allow(dead_code)]
//! Fakes shared by the gateway tests: a transport that records every call
//! and a treadmill whose snapshot the test controls.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use ftms_gateway::config::GatewayConfig;
use ftms_gateway::gateway::Gateway;
use ftms_gateway::gatt::{CharacteristicId, ClientId, ServiceId};
use ftms_gateway::telemetry::{SimulationParameters, TelemetrySnapshot, Treadmill};
use ftms_gateway::transport::GattTransport;
use parking_lot::Mutex;

#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    Register(ServiceId),
    StartAdvertising(String),
    StopAdvertising,
    Notify {
        client: ClientId,
        characteristic: CharacteristicId,
        value: Vec<u8>,
        indicate: bool,
    },
    Disconnect(ClientId),
}

#[derive(Default)]
pub struct RecordingTransport {
    events: Mutex<Vec<Event>>,
}

impl RecordingTransport {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn events(&self) -> Vec<Event> {
        self.events.lock().clone()
    }

    /// Return and clear everything recorded so far.
    pub fn take(&self) -> Vec<Event> {
        std::mem::take(&mut *self.events.lock())
    }

    /// Frames sent to `client`, in order.
    pub fn frames_for(&self, client: &ClientId) -> Vec<(CharacteristicId, Vec<u8>, bool)> {
        self.events
            .lock()
            .iter()
            .filter_map(|e| match e {
                Event::Notify { client: c, characteristic, value, indicate } if c == client => {
                    Some((*characteristic, value.clone(), *indicate))
                }
                _ => None,
            })
            .collect()
    }

    pub fn count_notifications(&self, characteristic: CharacteristicId) -> usize {
        self.events
            .lock()
            .iter()
            .filter(|e| matches!(e, Event::Notify { characteristic: c, .. } if *c == characteristic))
            .count()
    }
}

impl GattTransport for RecordingTransport {
    fn register_service(&self, service: ServiceId) {
        self.events.lock().push(Event::Register(service));
    }

    fn start_advertising(&self, device_name: &str) {
        self.events.lock().push(Event::StartAdvertising(device_name.to_string()));
    }

    fn stop_advertising(&self) {
        self.events.lock().push(Event::StopAdvertising);
    }

    fn notify(&self, client: &ClientId, characteristic: CharacteristicId, value: &[u8], indicate: bool) {
        self.events.lock().push(Event::Notify {
            client: client.clone(),
            characteristic,
            value: value.to_vec(),
            indicate,
        });
    }

    fn disconnect(&self, client: &ClientId) {
        self.events.lock().push(Event::Disconnect(client.clone()));
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    Speed(f64),
    Incline(f64),
    Start,
    StopPause(bool),
    Simulation(SimulationParameters),
}

pub struct FakeTreadmill {
    pub snapshot: Mutex<TelemetrySnapshot>,
    pub calls: Mutex<Vec<Call>>,
    pub allow_control: AtomicBool,
}

impl FakeTreadmill {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            snapshot: Mutex::new(TelemetrySnapshot::default()),
            calls: Mutex::new(Vec::new()),
            allow_control: AtomicBool::new(true),
        })
    }

    pub fn set(&self, snapshot: TelemetrySnapshot) {
        *self.snapshot.lock() = snapshot;
    }

    pub fn calls(&self) -> Vec<Call> {
        self.calls.lock().clone()
    }
}

impl Treadmill for FakeTreadmill {
    fn snapshot(&self) -> TelemetrySnapshot {
        self.snapshot.lock().clone()
    }

    fn on_control_requested(&self) -> bool {
        self.allow_control.load(Ordering::SeqCst)
    }

    fn on_set_target_speed(&self, kph: f64) {
        self.calls.lock().push(Call::Speed(kph));
    }

    fn on_set_target_incline(&self, percent: f64) {
        self.calls.lock().push(Call::Incline(percent));
    }

    fn on_start_resume(&self) {
        self.calls.lock().push(Call::Start);
    }

    fn on_stop_pause(&self, stop: bool) {
        self.calls.lock().push(Call::StopPause(stop));
    }

    fn on_simulation_parameters(&self, params: SimulationParameters) {
        self.calls.lock().push(Call::Simulation(params));
    }
}

pub struct Harness {
    pub gateway: Arc<Gateway>,
    pub transport: Arc<RecordingTransport>,
    pub treadmill: Arc<FakeTreadmill>,
}

impl Harness {
    pub fn new() -> Self {
        Self::with_config(GatewayConfig::default())
    }

    pub fn with_config(config: GatewayConfig) -> Self {
        let transport = RecordingTransport::new();
        let treadmill = FakeTreadmill::new();
        let gateway = Gateway::new(config, transport.clone(), treadmill.clone());
        Self { gateway, transport, treadmill }
    }

    pub fn connect(&self, id: &str) -> ClientId {
        let client = ClientId::from(id);
        self.gateway.on_connect(&client);
        client
    }

    /// Start the gateway and confirm every service registration.
    pub fn start_registered(&self) {
        self.gateway.start();
        for service in ServiceId::ALL {
            self.gateway.on_service_added(service, Ok(()));
        }
    }

    pub fn write_cp(&self, client: &ClientId, bytes: &[u8]) -> ftms_gateway::transport::WriteOutcome {
        self.gateway.on_write(client, CharacteristicId::ControlPoint, bytes)
    }

    /// Control point indications sent to `client`.
    pub fn responses(&self, client: &ClientId) -> Vec<Vec<u8>> {
        self.transport
            .frames_for(client)
            .into_iter()
            .filter(|(c, _, indicate)| *c == CharacteristicId::ControlPoint && *indicate)
            .map(|(_, v, _)| v)
            .collect()
    }
}
