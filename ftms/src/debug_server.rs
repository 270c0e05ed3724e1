//! TCP debug transport for driving the gateway without BLE hardware.
//!
//! Listens on a TCP port (default 8826). Every connection is a client of its
//! own (`tcp/<addr>`) and talks to the gateway exactly as a GATT client
//! would: reads, subscriptions and control point writes, with hex payloads
//! and notifications streamed back as text lines.
//!
//! Usage from dev machine:
//!   nc rpi 8826
//!
//! Output lines:
//!   value <char> <hex>      answer to `read`
//!   notify <char> <hex>     notification
//!   indicate <char> <hex>   indication (control point responses)

use std::net::SocketAddr;
use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::mpsc;

use crate::gateway::Gateway;
use crate::gatt::{CharacteristicId, ClientId, ServiceId};
use crate::transport::{GattTransport, ReadOutcome, WriteOutcome};

pub const DEFAULT_DEBUG_PORT: u16 = 8826;
pub const CLIENT_PREFIX: &str = "tcp/";

type DebugResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Radio operations, answered locally when there is no real radio.
#[derive(Debug)]
enum RadioEvent {
    ServiceAdded(ServiceId),
    AdvertisingStarted,
}

/// Outbound half: turns gateway pushes into text lines for the connection
/// that owns each client.
pub struct DebugTransport {
    clients: DashMap<ClientId, mpsc::UnboundedSender<String>>,
    radio: mpsc::UnboundedSender<RadioEvent>,
}

/// Inbound half, consumed by [`run`] or [`serve`].
pub struct DebugInbound {
    transport: Arc<DebugTransport>,
    radio: mpsc::UnboundedReceiver<RadioEvent>,
}

impl DebugTransport {
    pub fn new() -> (Arc<Self>, DebugInbound) {
        let (tx, rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            clients: DashMap::new(),
            radio: tx,
        });
        let inbound = DebugInbound {
            transport: transport.clone(),
            radio: rx,
        };
        (transport, inbound)
    }

    /// Whether `client` is one of ours.
    pub fn owns(client: &ClientId) -> bool {
        client.as_str().starts_with(CLIENT_PREFIX)
    }

    fn attach(&self, client: &ClientId) -> mpsc::UnboundedReceiver<String> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.clients.insert(client.clone(), tx);
        rx
    }

    fn detach(&self, client: &ClientId) {
        self.clients.remove(client);
    }
}

impl GattTransport for DebugTransport {
    fn register_service(&self, service: ServiceId) {
        let _ = self.radio.send(RadioEvent::ServiceAdded(service));
    }

    fn start_advertising(&self, device_name: &str) {
        debug!("Debug transport 'advertising' as {}", device_name);
        let _ = self.radio.send(RadioEvent::AdvertisingStarted);
    }

    fn stop_advertising(&self) {}

    fn notify(&self, client: &ClientId, characteristic: CharacteristicId, value: &[u8], indicate: bool) {
        let Some(tx) = self.clients.get(client) else {
            debug!("Dropping frame for unknown debug client {}", client);
            return;
        };
        let kind = if indicate { "indicate" } else { "notify" };
        let _ = tx.send(format!("{} {} {}", kind, characteristic.short_name(), hex_encode(value)));
    }

    fn disconnect(&self, client: &ClientId) {
        // Dropping the sender ends the connection's loop
        self.clients.remove(client);
    }
}

/// Radio traffic goes to `radio`; clients are routed by id, so BLE centrals
/// and debug connections can share one gateway.
pub struct Routed {
    radio: Arc<dyn GattTransport>,
    debug: Arc<DebugTransport>,
}

impl Routed {
    pub fn new(radio: Arc<dyn GattTransport>, debug: Arc<DebugTransport>) -> Self {
        Self { radio, debug }
    }

    fn route(&self, client: &ClientId) -> &dyn GattTransport {
        if DebugTransport::owns(client) {
            &*self.debug
        } else {
            &*self.radio
        }
    }
}

impl GattTransport for Routed {
    fn register_service(&self, service: ServiceId) {
        self.radio.register_service(service);
    }

    fn start_advertising(&self, device_name: &str) {
        self.radio.start_advertising(device_name);
    }

    fn stop_advertising(&self) {
        self.radio.stop_advertising();
    }

    fn notify(&self, client: &ClientId, characteristic: CharacteristicId, value: &[u8], indicate: bool) {
        self.route(client).notify(client, characteristic, value, indicate);
    }

    fn disconnect(&self, client: &ClientId) {
        self.route(client).disconnect(client);
    }
}

/// Bind the debug port and serve until the listener fails.
pub async fn run(gateway: Arc<Gateway>, inbound: DebugInbound, port: u16) -> DebugResult<()> {
    let listener = TcpListener::bind(("0.0.0.0", port)).await?;
    info!("Debug server listening on port {}", port);
    serve(gateway, inbound, listener).await
}

pub async fn serve(gateway: Arc<Gateway>, inbound: DebugInbound, listener: TcpListener) -> DebugResult<()> {
    let DebugInbound { transport, mut radio } = inbound;
    let mut radio_open = true;

    loop {
        tokio::select! {
            accepted = listener.accept() => {
                let (stream, addr) = accepted?;
                let gateway = gateway.clone();
                let transport = transport.clone();
                tokio::spawn(async move {
                    handle_client(stream, addr, gateway, transport).await;
                });
            }
            event = radio.recv(), if radio_open => match event {
                Some(RadioEvent::ServiceAdded(service)) => gateway.on_service_added(service, Ok(())),
                Some(RadioEvent::AdvertisingStarted) => gateway.on_advertising_result(Ok(())),
                None => radio_open = false,
            },
        }
    }
}

async fn handle_client(stream: TcpStream, addr: SocketAddr, gateway: Arc<Gateway>, transport: Arc<DebugTransport>) {
    let client = ClientId::new(format!("{}{}", CLIENT_PREFIX, addr));
    info!("Debug client connected: {}", client);

    let outbound = transport.attach(&client);
    gateway.on_connect(&client);

    if let Err(e) = client_loop(stream, &client, &gateway, outbound).await {
        info!("Debug client {} error: {}", client, e);
    }

    transport.detach(&client);
    gateway.on_disconnect(&client);
    info!("Debug client disconnected: {}", client);
}

async fn client_loop(
    stream: TcpStream,
    client: &ClientId,
    gateway: &Gateway,
    mut outbound: mpsc::UnboundedReceiver<String>,
) -> DebugResult<()> {
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    writer
        .write_all(format!("ftms-debug> connected as {}. type 'help' for commands.\n", client).as_bytes())
        .await?;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    return Ok(());
                };
                let line = line.trim().to_lowercase();
                if line.is_empty() {
                    continue;
                }

                let reply = handle_command(gateway, client, &line);

                // Frames caused by the command go out ahead of its reply
                while let Ok(frame) = outbound.try_recv() {
                    writer.write_all(frame.as_bytes()).await?;
                    writer.write_all(b"\n").await?;
                }

                match reply {
                    Some(msg) => {
                        writer.write_all(msg.as_bytes()).await?;
                        writer.write_all(b"\n").await?;
                    }
                    None => return Ok(()),
                }
            }
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    writer.write_all(b"disconnected by gateway\n").await?;
                    return Ok(());
                };
                writer.write_all(frame.as_bytes()).await?;
                writer.write_all(b"\n").await?;
            }
        }
    }
}

/// Returns the reply line(s), or `None` when the client asked to leave.
fn handle_command(gateway: &Gateway, client: &ClientId, line: &str) -> Option<String> {
    let (cmd, arg) = match line.split_once(' ') {
        Some((cmd, arg)) => (cmd, arg.trim()),
        None => (line, ""),
    };

    let reply = match cmd {
        "help" => HELP_TEXT.to_string(),
        "state" => describe_state(gateway),
        "read" => match parse_characteristic(arg) {
            Ok(ch) => match gateway.on_read(client, ch) {
                ReadOutcome::Value(v) => format!("value {} {}", ch.short_name(), hex_encode(&v)),
                ReadOutcome::NotPermitted => format!("error: {} is not readable", ch.short_name()),
            },
            Err(e) => e,
        },
        "sub" | "unsub" => match parse_characteristic(arg) {
            Ok(ch) => {
                let access = ch.access();
                if access.notify || access.indicate {
                    gateway.on_subscription(client, ch, cmd == "sub");
                    "ok".to_string()
                } else {
                    format!("error: {} does not notify", ch.short_name())
                }
            }
            Err(e) => e,
        },
        "cp" => match hex_decode(arg) {
            Ok(bytes) => match gateway.on_write(client, CharacteristicId::ControlPoint, &bytes) {
                WriteOutcome::Accepted => "ok".to_string(),
                WriteOutcome::InvalidLength => "error: invalid length".to_string(),
                WriteOutcome::NotPermitted => "error: write not permitted".to_string(),
            },
            Err(e) => format!("error: {}", e),
        },
        "quit" | "exit" => return None,
        _ => {
            warn!("Debug client {} sent unknown command '{}'", client, line);
            format!("unknown command: '{}'. type 'help'.", line)
        }
    };
    Some(reply)
}

fn parse_characteristic(name: &str) -> Result<CharacteristicId, String> {
    CharacteristicId::from_short_name(name)
        .ok_or_else(|| format!("unknown characteristic '{}'. type 'help'.", name))
}

fn describe_state(gateway: &Gateway) -> String {
    let s = gateway.treadmill().snapshot();
    let controller = gateway
        .sessions()
        .arbiter()
        .current()
        .map(|c| c.to_string())
        .unwrap_or_else(|| "none".to_string());
    format!(
        "speed:       {:.2} km/h\n\
         incline:     {:.1}%\n\
         distance:    {:.0} m\n\
         elevation:   +{:.1} m / -{:.1} m\n\
         elapsed:     {}s ({}:{:02})\n\
         heart rate:  {}\n\
         running:     {}\n\
         clients:     {}\n\
         control:     {}\n\
         advertising: {:?}",
        s.speed_kph,
        s.incline_percent,
        s.distance_m,
        s.elevation_gain_m,
        s.elevation_loss_m,
        s.elapsed_secs,
        s.elapsed_secs / 60,
        s.elapsed_secs % 60,
        s.heart_rate,
        s.running,
        gateway.sessions().len(),
        controller,
        gateway.advertising().state(),
    )
}

pub(crate) fn hex_encode(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{:02x}", b)).collect()
}

pub(crate) fn hex_decode(hex: &str) -> DebugResult<Vec<u8>> {
    let hex = hex.replace(' ', "");
    if hex.len() % 2 != 0 {
        return Err("hex string must have even length".into());
    }
    (0..hex.len())
        .step_by(2)
        .map(|i| {
            hex.get(i..i + 2)
                .ok_or_else(|| -> Box<dyn std::error::Error + Send + Sync> { "invalid hex".into() })
                .and_then(|pair| u8::from_str_radix(pair, 16).map_err(|e| e.into()))
        })
        .collect()
}

const HELP_TEXT: &str = "\
commands:
  read <char>     read a characteristic, e.g. read feat
  sub <char>      subscribe to notifications, e.g. sub td
  unsub <char>    unsubscribe
  cp <hex>        write to control point (0x2AD9), response arrives as 'indicate cp'
  state           show gateway and treadmill state
  help            this message
  quit            disconnect

characteristics:
  feat td sr ir ts cp ms      fitness machine service
  hr                          heart rate
  rsc rscf                    running speed and cadence
  pwr pwrf                    cycling power

control point examples:
  cp 00           Request Control
  cp 01           Reset
  cp 02 f401      Set Target Speed 5.00 km/h (500 = 0x01f4 LE)
  cp 03 1e00      Set Target Incline 3.0% (30 = 0x001e LE)
  cp 07           Start or Resume
  cp 08 01        Stop
  cp 08 02        Pause

all values are little-endian hex, matching raw BLE GATT writes.";

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hex_round_trip() {
        assert_eq!(hex_encode(&[0x80, 0x02, 0x01]), "800201");
        assert_eq!(hex_decode("02 f401").unwrap(), vec![0x02, 0xf4, 0x01]);
        assert_eq!(hex_decode("").unwrap(), Vec::<u8>::new());
    }

    #[test]
    fn test_hex_decode_rejects_garbage() {
        assert!(hex_decode("0").is_err());
        assert!(hex_decode("zz").is_err());
        // Multi-byte chars must not panic on slicing
        assert!(hex_decode("é00").is_err());
    }

    #[test]
    fn test_owns_only_tcp_clients() {
        assert!(DebugTransport::owns(&ClientId::from("tcp/127.0.0.1:4000")));
        assert!(!DebugTransport::owns(&ClientId::from("AA:BB:CC:DD:EE:FF")));
    }

    #[tokio::test]
    async fn test_notify_formats_lines_for_attached_client() {
        let (transport, _inbound) = DebugTransport::new();
        let client = ClientId::from("tcp/1.2.3.4:5");
        let mut rx = transport.attach(&client);

        transport.notify(&client, CharacteristicId::ControlPoint, &[0x80, 0x00, 0x01], true);
        transport.notify(&client, CharacteristicId::HeartRateMeasurement, &[0x00, 0x8c], false);
        transport.notify(&ClientId::from("tcp/other"), CharacteristicId::TreadmillData, &[1], false);

        assert_eq!(rx.recv().await.unwrap(), "indicate cp 800001");
        assert_eq!(rx.recv().await.unwrap(), "notify hr 008c");

        transport.disconnect(&client);
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn test_radio_ops_are_echoed_as_events() {
        let (transport, mut inbound) = DebugTransport::new();
        transport.register_service(ServiceId::HeartRate);
        transport.start_advertising("x");
        assert!(matches!(
            inbound.radio.recv().await,
            Some(RadioEvent::ServiceAdded(ServiceId::HeartRate))
        ));
        assert!(matches!(inbound.radio.recv().await, Some(RadioEvent::AdvertisingStarted)));
    }
}
