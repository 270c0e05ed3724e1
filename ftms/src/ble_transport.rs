//! BLE transport on BlueZ via bluer.
//!
//! Each service is served as its own GATT application so registration can
//! be confirmed one service at a time. Reads are answered straight from the
//! gateway. Everything that carries per-client traffic (notify sessions and
//! control point writes) uses IO mode, which is the only bluer mode that
//! tells us which device is on the other end. Connects and disconnects come
//! from the `Connected` property of BlueZ's device objects; opening a
//! session also marks its device connected in case that signal lags.

use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use bluer::{
    adv::{Advertisement, AdvertisementHandle},
    Adapter, AdapterEvent, Address, DeviceEvent, DeviceProperty,
    gatt::local::{
        characteristic_control, Application, ApplicationHandle, Characteristic,
        CharacteristicControl, CharacteristicControlEvent, CharacteristicNotify,
        CharacteristicNotifyMethod, CharacteristicRead, CharacteristicWrite,
        CharacteristicWriteMethod, ReqError, Service,
    },
    gatt::{CharacteristicReader, CharacteristicWriter},
};
use dashmap::DashMap;
use futures::{pin_mut, FutureExt, StreamExt};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::sync::mpsc;

use crate::error::{AdvertiseError, RegistrationError};
use crate::gateway::Gateway;
use crate::gatt::{CharacteristicId, ClientId, ServiceId};
use crate::protocol::FTMS_SERVICE_UUID;
use crate::transport::{GattTransport, ReadOutcome, WriteOutcome};

/// FTMS service data: Flags (bit 0 = machine available) + Fitness Machine
/// Type (bit 0 = treadmill supported).
pub const FTMS_SERVICE_DATA: [u8; 2] = [0x01, 0x01];

#[derive(Debug)]
enum BleCommand {
    Register(ServiceId),
    Advertise(String),
    StopAdvertising,
    Disconnect(ClientId),
}

struct NotifySession {
    id: u64,
    frames: mpsc::UnboundedSender<Vec<u8>>,
}

/// Outbound half. Radio operations are queued for [`run`]; frames go
/// straight to the per-(client, characteristic) session task.
pub struct BleTransport {
    commands: mpsc::UnboundedSender<BleCommand>,
    sessions: DashMap<(ClientId, CharacteristicId), NotifySession>,
    next_session: AtomicU64,
}

pub struct BleInbound {
    transport: Arc<BleTransport>,
    commands: mpsc::UnboundedReceiver<BleCommand>,
}

impl BleTransport {
    pub fn new() -> (Arc<Self>, BleInbound) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            commands: tx,
            sessions: DashMap::new(),
            next_session: AtomicU64::new(0),
        });
        let inbound = BleInbound {
            transport: transport.clone(),
            commands: rx,
        };
        (transport, inbound)
    }

    fn queue(&self, cmd: BleCommand) {
        if self.commands.send(cmd).is_err() {
            warn!("BLE transport stopped, command dropped");
        }
    }

    /// Track a new notify session, replacing any previous one for the same
    /// pair. Returns the session id and its frame queue.
    fn open_session(&self, client: &ClientId, characteristic: CharacteristicId) -> (u64, mpsc::UnboundedReceiver<Vec<u8>>) {
        let id = self.next_session.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = mpsc::unbounded_channel();
        self.sessions
            .insert((client.clone(), characteristic), NotifySession { id, frames: tx });
        (id, rx)
    }

    /// Forget a session unless a newer one replaced it. Returns whether it
    /// was still the current one.
    fn close_session(&self, client: &ClientId, characteristic: CharacteristicId, id: u64) -> bool {
        self.sessions
            .remove_if(&(client.clone(), characteristic), |_, s| s.id == id)
            .is_some()
    }
}

impl GattTransport for BleTransport {
    fn register_service(&self, service: ServiceId) {
        self.queue(BleCommand::Register(service));
    }

    fn start_advertising(&self, device_name: &str) {
        self.queue(BleCommand::Advertise(device_name.to_string()));
    }

    fn stop_advertising(&self) {
        self.queue(BleCommand::StopAdvertising);
    }

    fn notify(&self, client: &ClientId, characteristic: CharacteristicId, value: &[u8], _indicate: bool) {
        // The session was opened with the characteristic's own notify or
        // indicate flag, so BlueZ already knows which one to use.
        match self.sessions.get(&(client.clone(), characteristic)) {
            Some(session) => {
                let _ = session.frames.send(value.to_vec());
            }
            None => debug!("No {:?} session for {}, frame dropped", characteristic, client),
        }
    }

    fn disconnect(&self, client: &ClientId) {
        // Dropping the senders ends the session tasks
        self.sessions.retain(|(c, _), _| c != client);
        self.queue(BleCommand::Disconnect(client.clone()));
    }
}

/// Shared by every characteristic task and the device watchers.
struct BleContext {
    gateway: Arc<Gateway>,
    transport: Arc<BleTransport>,
    connected: Mutex<HashSet<ClientId>>,
    watched: Mutex<HashSet<Address>>,
}

impl BleContext {
    fn new(gateway: Arc<Gateway>, transport: Arc<BleTransport>) -> Self {
        Self {
            gateway,
            transport,
            connected: Mutex::new(HashSet::new()),
            watched: Mutex::new(HashSet::new()),
        }
    }

    /// Forward connection changes to the gateway, once per transition.
    fn set_connected(&self, client: &ClientId, connected: bool) {
        let changed = {
            let mut set = self.connected.lock();
            if connected {
                set.insert(client.clone())
            } else {
                set.remove(client)
            }
        };
        if !changed {
            return;
        }
        if connected {
            self.gateway.on_connect(client);
        } else {
            self.gateway.on_disconnect(client);
        }
    }

    /// Follow one device's `Connected` property until BlueZ drops the object.
    fn watch_device(self: &Arc<Self>, adapter: &Adapter, address: Address) {
        if !self.watched.lock().insert(address) {
            return;
        }
        let device = match adapter.device(address) {
            Ok(device) => device,
            Err(e) => {
                debug!("Cannot watch {}: {}", address, e);
                self.watched.lock().remove(&address);
                return;
            }
        };

        let ctx = Arc::clone(self);
        tokio::spawn(async move {
            let client = ClientId::new(address.to_string());
            let events = match device.events().await {
                Ok(events) => events,
                Err(e) => {
                    warn!("Cannot follow {}: {}", client, e);
                    ctx.watched.lock().remove(&address);
                    return;
                }
            };
            pin_mut!(events);

            if device.is_connected().await.unwrap_or(false) {
                ctx.set_connected(&client, true);
            }
            while let Some(event) = events.next().await {
                if let DeviceEvent::PropertyChanged(DeviceProperty::Connected(connected)) = event {
                    ctx.set_connected(&client, connected);
                }
            }

            ctx.watched.lock().remove(&address);
            ctx.set_connected(&client, false);
        });
    }

    async fn run_notify_session(&self, client: ClientId, characteristic: CharacteristicId, mut writer: CharacteristicWriter) {
        self.set_connected(&client, true);
        let (id, mut frames) = self.transport.open_session(&client, characteristic);
        self.gateway.on_subscription(&client, characteristic, true);

        loop {
            tokio::select! {
                frame = frames.recv() => {
                    let Some(frame) = frame else { break };
                    // Datagram socket: one write is one notification
                    if let Err(e) = writer.write(&frame).await {
                        warn!("{:?} notification to {} failed: {}", characteristic, client, e);
                        break;
                    }
                }
                _ = writer.closed() => break,
            }
        }

        if self.transport.close_session(&client, characteristic, id) {
            self.gateway.on_subscription(&client, characteristic, false);
        }
        info!("{:?} notify session from {} ended", characteristic, client);
    }

    async fn run_write_session(&self, client: ClientId, characteristic: CharacteristicId, mut reader: CharacteristicReader, mtu: usize) {
        self.set_connected(&client, true);
        let mut buf = vec![0u8; mtu.max(1)];

        loop {
            match reader.read(&mut buf).await {
                Ok(0) => break,
                Ok(n) => match self.gateway.on_write(&client, characteristic, &buf[..n]) {
                    WriteOutcome::Accepted => {}
                    other => debug!("{:?} write from {} rejected: {:?}", characteristic, client, other),
                },
                Err(e) => {
                    warn!("{:?} write session from {} failed: {}", characteristic, client, e);
                    break;
                }
            }
        }

        info!("{:?} write session from {} ended", characteristic, client);
    }
}

/// Run the radio side: registers services and advertises on request, and
/// feeds client sessions into the gateway. Runs until the transport is
/// dropped or BlueZ fails.
pub async fn run(gateway: Arc<Gateway>, inbound: BleInbound) -> bluer::Result<()> {
    let BleInbound { transport, mut commands } = inbound;

    let session = bluer::Session::new().await?;
    let adapter = session.default_adapter().await?;
    adapter.set_powered(true).await?;

    info!(
        "BLE using adapter {} ({})",
        adapter.name(),
        adapter.address().await?
    );

    let ctx = Arc::new(BleContext::new(gateway.clone(), transport));

    let adapter_events = adapter.events().await?;
    pin_mut!(adapter_events);
    let mut adapter_events_open = true;
    for address in adapter.device_addresses().await? {
        ctx.watch_device(&adapter, address);
    }

    let mut applications: Vec<ApplicationHandle> = Vec::new();
    let mut advertisement: Option<AdvertisementHandle> = None;

    loop {
        let cmd = tokio::select! {
            cmd = commands.recv() => match cmd {
                Some(cmd) => cmd,
                None => break,
            },
            event = adapter_events.next(), if adapter_events_open => {
                match event {
                    Some(AdapterEvent::DeviceAdded(address)) => ctx.watch_device(&adapter, address),
                    Some(AdapterEvent::DeviceRemoved(address)) => {
                        ctx.set_connected(&ClientId::new(address.to_string()), false);
                    }
                    Some(_) => {}
                    None => {
                        warn!("BlueZ adapter event stream ended");
                        adapter_events_open = false;
                    }
                }
                continue;
            }
        };
        match cmd {
            BleCommand::Register(service) => {
                let app = build_application(service, &ctx);
                match adapter.serve_gatt_application(app).await {
                    Ok(handle) => {
                        applications.push(handle);
                        gateway.on_service_added(service, Ok(()));
                    }
                    Err(e) => gateway.on_service_added(service, Err(RegistrationError(e.to_string()))),
                }
            }
            BleCommand::Advertise(name) => {
                // Replacing the handle unregisters the old advertisement
                advertisement = None;
                match adapter.advertise(build_advertisement(&name)).await {
                    Ok(handle) => {
                        advertisement = Some(handle);
                        gateway.on_advertising_result(Ok(()));
                    }
                    Err(e) => gateway.on_advertising_result(Err(advertise_error(e))),
                }
            }
            BleCommand::StopAdvertising => {
                if advertisement.take().is_some() {
                    info!("Advertising stopped");
                    gateway.on_advertising_stopped();
                }
            }
            BleCommand::Disconnect(client) => {
                let Ok(address) = client.as_str().parse::<bluer::Address>() else {
                    continue;
                };
                match adapter.device(address) {
                    Ok(device) => {
                        if let Err(e) = device.disconnect().await {
                            debug!("Disconnecting {} failed: {}", client, e);
                        }
                    }
                    Err(e) => debug!("Unknown device {}: {}", client, e),
                }
            }
        }
    }

    info!("BLE transport stopped");
    Ok(())
}

fn build_advertisement(device_name: &str) -> Advertisement {
    Advertisement {
        advertisement_type: bluer::adv::Type::Peripheral,
        service_uuids: vec![FTMS_SERVICE_UUID].into_iter().collect(),
        service_data: [(FTMS_SERVICE_UUID, FTMS_SERVICE_DATA.to_vec())].into_iter().collect(),
        local_name: Some(device_name.to_string()),
        discoverable: Some(true),
        ..Default::default()
    }
}

/// An adapter that cannot advertise at all will not start on retry.
fn advertise_error(e: bluer::Error) -> AdvertiseError {
    match e.kind {
        bluer::ErrorKind::NotSupported => AdvertiseError::Unsupported,
        _ => AdvertiseError::Transient(e.to_string()),
    }
}

fn build_application(service: ServiceId, ctx: &Arc<BleContext>) -> Application {
    let characteristics = service
        .characteristics()
        .iter()
        .map(|&ch| build_characteristic(ch, ctx))
        .collect();
    Application {
        services: vec![Service {
            uuid: service.uuid(),
            primary: true,
            characteristics,
            ..Default::default()
        }],
        ..Default::default()
    }
}

fn build_characteristic(characteristic: CharacteristicId, ctx: &Arc<BleContext>) -> Characteristic {
    let access = characteristic.access();
    let mut out = Characteristic {
        uuid: characteristic.uuid(),
        ..Default::default()
    };

    if access.read {
        let gateway = ctx.gateway.clone();
        out.read = Some(CharacteristicRead {
            read: true,
            fun: Box::new(move |req| {
                let gateway = gateway.clone();
                async move {
                    let client = ClientId::new(req.device_address.to_string());
                    match gateway.on_read(&client, characteristic) {
                        ReadOutcome::Value(value) => Ok(value),
                        ReadOutcome::NotPermitted => Err(ReqError::NotPermitted),
                    }
                }
                .boxed()
            }),
            ..Default::default()
        });
    }

    if access.write {
        out.write = Some(CharacteristicWrite {
            write: true,
            method: CharacteristicWriteMethod::Io,
            ..Default::default()
        });
    }

    if access.notify || access.indicate {
        out.notify = Some(CharacteristicNotify {
            notify: access.notify,
            indicate: access.indicate,
            method: CharacteristicNotifyMethod::Io,
            ..Default::default()
        });
    }

    if access.write || access.notify || access.indicate {
        let (control, handle) = characteristic_control();
        out.control_handle = handle;
        tokio::spawn(drive_characteristic(characteristic, control, ctx.clone()));
    }

    out
}

/// Accept the sessions BlueZ opens on one characteristic. Ends when the
/// application is unregistered.
async fn drive_characteristic(characteristic: CharacteristicId, control: CharacteristicControl, ctx: Arc<BleContext>) {
    pin_mut!(control);

    while let Some(evt) = control.next().await {
        match evt {
            CharacteristicControlEvent::Notify(writer) => {
                let client = ClientId::new(writer.device_address().to_string());
                info!(
                    "{:?} notify session from {} (MTU {})",
                    characteristic, client, writer.mtu()
                );
                let ctx = ctx.clone();
                tokio::spawn(async move {
                    ctx.run_notify_session(client, characteristic, writer).await;
                });
            }
            CharacteristicControlEvent::Write(req) => {
                let client = ClientId::new(req.device_address().to_string());
                let mtu = req.mtu();
                info!("{:?} write session from {} (MTU {})", characteristic, client, mtu);
                match req.accept() {
                    Ok(reader) => {
                        let ctx = ctx.clone();
                        tokio::spawn(async move {
                            ctx.run_write_session(client, characteristic, reader, mtu).await;
                        });
                    }
                    Err(e) => error!("Failed to accept {:?} write from {}: {}", characteristic, client, e),
                }
            }
        }
    }
    debug!("{:?} control stream ended", characteristic);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_advertise_error_mapping() {
        let unsupported = bluer::Error {
            kind: bluer::ErrorKind::NotSupported,
            message: "no LE advertising".to_string(),
        };
        assert_eq!(advertise_error(unsupported), AdvertiseError::Unsupported);

        let busy = bluer::Error {
            kind: bluer::ErrorKind::Failed,
            message: "busy".to_string(),
        };
        assert!(matches!(advertise_error(busy), AdvertiseError::Transient(_)));
    }

    #[test]
    fn test_advertisement_carries_ftms_service_data() {
        let adv = build_advertisement("Precor 9.31");
        assert_eq!(adv.local_name.as_deref(), Some("Precor 9.31"));
        assert!(adv.service_uuids.contains(&FTMS_SERVICE_UUID));
        assert_eq!(adv.service_data.get(&FTMS_SERVICE_UUID), Some(&vec![0x01, 0x01]));
    }

    #[tokio::test]
    async fn test_notify_routes_to_session() {
        let (transport, mut inbound) = BleTransport::new();
        let a = ClientId::from("AA:BB:CC:DD:EE:01");
        let (_, mut td) = transport.open_session(&a, CharacteristicId::TreadmillData);

        transport.notify(&a, CharacteristicId::TreadmillData, &[1, 2, 3], false);
        // No HR session: dropped
        transport.notify(&a, CharacteristicId::HeartRateMeasurement, &[0, 60], false);
        assert_eq!(td.recv().await, Some(vec![1, 2, 3]));

        transport.disconnect(&a);
        assert_eq!(td.recv().await, None);
        assert!(matches!(inbound.commands.recv().await, Some(BleCommand::Disconnect(c)) if c == a));
    }

    #[tokio::test]
    async fn test_connection_changes_reach_gateway_once() {
        let (transport, _inbound) = BleTransport::new();
        let (treadmill, _commands) = crate::treadmill::TreadmillIo::new();
        let gateway = Gateway::new(
            crate::config::GatewayConfig::default(),
            transport.clone(),
            treadmill,
        );
        let ctx = BleContext::new(gateway.clone(), transport);
        let a = ClientId::from("AA:BB:CC:DD:EE:01");

        // Device property and a session both report the same connection
        ctx.set_connected(&a, true);
        ctx.set_connected(&a, true);
        assert!(gateway.sessions().contains(&a));
        assert_eq!(gateway.sessions().len(), 1);

        gateway.sessions().request_control(&a).unwrap();
        ctx.set_connected(&a, false);
        assert!(gateway.sessions().is_empty());
        assert_eq!(gateway.sessions().arbiter().current(), None);

        // Watcher teardown after the property already went false
        ctx.set_connected(&a, false);
        assert!(gateway.sessions().is_empty());
    }

    #[test]
    fn test_replaced_session_is_not_closed_by_old_task() {
        let (transport, _inbound) = BleTransport::new();
        let a = ClientId::from("AA:BB:CC:DD:EE:01");
        let (old, _rx_old) = transport.open_session(&a, CharacteristicId::ControlPoint);
        let (new, _rx_new) = transport.open_session(&a, CharacteristicId::ControlPoint);

        assert!(!transport.close_session(&a, CharacteristicId::ControlPoint, old));
        assert!(transport.close_session(&a, CharacteristicId::ControlPoint, new));
    }
}
