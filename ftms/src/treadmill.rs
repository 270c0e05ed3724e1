//! Treadmill collaborator backed by the treadmill_io C binary.
//!
//! treadmill_io streams JSON status lines over a Unix domain socket. The
//! reader loop folds them into a shared [`TreadmillState`], integrating
//! distance and elevation between updates. Commands from the gateway are
//! queued on a channel and sent as one-shot JSON writes, so the gateway
//! never waits on the belt. Heart rate optionally comes from the HRM
//! daemon's socket.

use std::sync::Arc;
use std::time::Instant;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::Deserialize;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::net::UnixStream;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};

use crate::protocol;
use crate::telemetry::{SimulationParameters, TelemetrySnapshot, Treadmill};

pub const DEFAULT_SOCKET: &str = "/tmp/treadmill_io.sock";
pub const DEFAULT_HRM_SOCKET: &str = "/tmp/hrm.sock";

pub const MAX_SPEED_MPH: f64 = 12.0;
pub const MAX_INCLINE_PERCENT: i16 = 15;

const METERS_PER_MILE: f64 = 1609.344;
const MAX_BACKOFF: Duration = Duration::from_secs(10);

type IoResult<T> = Result<T, Box<dyn std::error::Error + Send + Sync>>;

/// Latest known treadmill state.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TreadmillState {
    /// Belt speed in tenths of mph (e.g. 35 = 3.5 mph)
    pub speed_tenths_mph: u16,
    /// Incline in percent grade
    pub incline_percent: i16,
    /// Seconds since the belt first started moving
    pub elapsed_secs: u32,
    pub distance_m: f64,
    pub elevation_gain_m: f64,
    pub elevation_loss_m: f64,
    pub heart_rate: u16,
    /// Whether we have an active connection to treadmill_io
    pub connected: bool,
}

impl TreadmillState {
    /// Fold a status update in. Distance and climb accrue at the previous
    /// speed and incline over `dt`.
    pub fn apply_status(&mut self, speed_tenths_mph: u16, incline_percent: i16, dt: Duration) {
        let mph = self.speed_tenths_mph as f64 / 10.0;
        let meters = mph * METERS_PER_MILE * dt.as_secs_f64() / 3600.0;
        self.distance_m += meters;

        let climb = meters * self.incline_percent as f64 / 100.0;
        if climb > 0.0 {
            self.elevation_gain_m += climb;
        } else {
            self.elevation_loss_m -= climb;
        }

        self.speed_tenths_mph = speed_tenths_mph;
        self.incline_percent = incline_percent;
    }

    pub fn is_running(&self) -> bool {
        self.speed_tenths_mph > 0
    }

    pub fn to_snapshot(&self) -> TelemetrySnapshot {
        let kmh_hundredths = protocol::mph_tenths_to_kmh_hundredths(self.speed_tenths_mph);
        TelemetrySnapshot {
            speed_kph: kmh_hundredths as f64 / 100.0,
            incline_percent: self.incline_percent as f64,
            distance_m: self.distance_m,
            elevation_gain_m: self.elevation_gain_m,
            elevation_loss_m: self.elevation_loss_m,
            heart_rate: self.heart_rate,
            elapsed_secs: self.elapsed_secs,
            running: self.is_running(),
            ..Default::default()
        }
    }
}

/// A command for treadmill_io, already clamped to the safe range.
#[derive(Debug, Clone, PartialEq)]
pub enum TreadmillCommand {
    Speed { mph: f64 },
    Incline { percent: i16 },
    Start,
    Pause,
    Stop,
}

impl TreadmillCommand {
    pub fn speed_kph(kph: f64) -> Self {
        let kmh_hundredths = (kph * 100.0).round().clamp(0.0, u16::MAX as f64) as u16;
        let tenths = protocol::kmh_hundredths_to_mph_tenths(kmh_hundredths);
        TreadmillCommand::Speed { mph: (tenths as f64 / 10.0).min(MAX_SPEED_MPH) }
    }

    pub fn incline(percent: f64) -> Self {
        let percent = percent.round().clamp(0.0, MAX_INCLINE_PERCENT as f64) as i16;
        TreadmillCommand::Incline { percent }
    }

    /// The JSON lines sent for this command, one connection each.
    pub fn to_lines(&self) -> Vec<String> {
        let speed = |mph: f64| serde_json::json!({ "cmd": "speed", "value": mph }).to_string();
        let incline = |p: i16| serde_json::json!({ "cmd": "incline", "value": p }).to_string();
        match self {
            TreadmillCommand::Speed { mph } => vec![speed(*mph)],
            TreadmillCommand::Incline { percent } => vec![incline(*percent)],
            TreadmillCommand::Start => {
                vec![serde_json::json!({ "cmd": "emulate", "enabled": true }).to_string()]
            }
            TreadmillCommand::Pause => vec![speed(0.0)],
            // Speed first, then incline
            TreadmillCommand::Stop => vec![speed(0.0), incline(0)],
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
enum IoEvent {
    Status {
        #[serde(default)]
        emu_speed: u16,
        #[serde(default)]
        emu_incline: i16,
    },
    Kv,
    #[serde(other)]
    Other,
}

#[derive(Debug, Deserialize)]
struct HrmEvent {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    bpm: u16,
    #[serde(default = "default_true")]
    connected: bool,
}

fn default_true() -> bool {
    true
}

pub struct TreadmillIo {
    state: Mutex<TreadmillState>,
    commands: mpsc::UnboundedSender<TreadmillCommand>,
}

impl TreadmillIo {
    /// Returns the collaborator and the receiving end of its command queue,
    /// to be drained by [`run_commands`].
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<TreadmillCommand>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let io = Arc::new(Self {
            state: Mutex::new(TreadmillState::default()),
            commands: tx,
        });
        (io, rx)
    }

    pub fn state(&self) -> TreadmillState {
        self.state.lock().clone()
    }

    fn send(&self, cmd: TreadmillCommand) {
        if self.commands.send(cmd).is_err() {
            warn!("Treadmill command queue closed, command dropped");
        }
    }
}

impl Treadmill for TreadmillIo {
    fn snapshot(&self) -> TelemetrySnapshot {
        self.state.lock().to_snapshot()
    }

    fn on_set_target_speed(&self, kph: f64) {
        self.send(TreadmillCommand::speed_kph(kph));
    }

    fn on_set_target_incline(&self, percent: f64) {
        self.send(TreadmillCommand::incline(percent));
    }

    fn on_start_resume(&self) {
        self.send(TreadmillCommand::Start);
    }

    fn on_stop_pause(&self, stop: bool) {
        self.send(if stop { TreadmillCommand::Stop } else { TreadmillCommand::Pause });
    }

    fn on_simulation_parameters(&self, params: SimulationParameters) {
        self.send(TreadmillCommand::incline(params.grade));
    }
}

/// Run the treadmill socket client. Connects, reads state, auto-reconnects.
/// Runs until cancelled.
pub async fn run(io: Arc<TreadmillIo>, socket_path: &str) -> IoResult<()> {
    let mut backoff = Duration::from_secs(1);

    loop {
        match connect_and_run(&io, socket_path, &mut backoff).await {
            Ok(()) => info!("Treadmill connection closed cleanly"),
            Err(e) => warn!("Treadmill connection error: {}", e),
        }

        io.state.lock().connected = false;

        info!("Reconnecting to treadmill_io in {:?}...", backoff);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn connect_and_run(io: &TreadmillIo, socket_path: &str, backoff: &mut Duration) -> IoResult<()> {
    let stream = UnixStream::connect(socket_path).await?;
    let (reader, mut writer) = stream.into_split();
    let mut lines = BufReader::new(reader).lines();

    // Request initial status dump
    writer.write_all(b"{\"cmd\":\"status\"}\n").await?;

    info!("Connected to treadmill_io at {}", socket_path);
    *backoff = Duration::from_secs(1);
    io.state.lock().connected = true;

    let mut last_update = Instant::now();
    let mut workout_start: Option<Instant> = None;

    let mut heartbeat = interval(Duration::from_secs(1));
    // First tick fires immediately; we just sent status
    heartbeat.tick().await;

    loop {
        tokio::select! {
            line = lines.next_line() => {
                let Some(line) = line? else {
                    info!("Socket EOF");
                    return Ok(());
                };
                let now = Instant::now();
                let dt = now.duration_since(last_update);
                last_update = now;

                match serde_json::from_str::<IoEvent>(&line) {
                    Ok(IoEvent::Status { emu_speed, emu_incline }) => {
                        if emu_speed > 0 && workout_start.is_none() {
                            workout_start = Some(now);
                        }
                        let mut s = io.state.lock();
                        s.apply_status(emu_speed, emu_incline, dt);
                        if let Some(start) = workout_start {
                            s.elapsed_secs = now.duration_since(start).as_secs() as u32;
                        }
                        debug!(
                            "Status: speed={:.1} mph, incline={}%",
                            emu_speed as f64 / 10.0,
                            emu_incline
                        );
                    }
                    // Bus traffic; emu_speed from status is authoritative
                    Ok(IoEvent::Kv) => {}
                    Ok(IoEvent::Other) => debug!("Unhandled treadmill_io line: {}", line),
                    Err(e) => debug!("Unparseable treadmill_io line ({}): {}", e, line),
                }
            }
            _ = heartbeat.tick() => {
                writer.write_all(b"{\"cmd\":\"heartbeat\"}\n").await?;
            }
        }
    }
}

/// Drain the command queue, one short-lived connection per line.
pub async fn run_commands(
    socket_path: &str,
    mut commands: mpsc::UnboundedReceiver<TreadmillCommand>,
) -> IoResult<()> {
    while let Some(cmd) = commands.recv().await {
        info!("Treadmill command: {:?}", cmd);
        for line in cmd.to_lines() {
            if let Err(e) = send_oneshot(socket_path, &line).await {
                error!("Failed to send {:?} to treadmill_io: {}", cmd, e);
                break;
            }
        }
    }
    Ok(())
}

async fn send_oneshot(socket_path: &str, line: &str) -> IoResult<()> {
    let mut stream = UnixStream::connect(socket_path).await?;
    stream.write_all(line.as_bytes()).await?;
    stream.write_all(b"\n").await?;
    stream.shutdown().await?;
    Ok(())
}

/// Follow the HRM daemon's broadcast and mirror its heart rate. Heart rate
/// reads 0 whenever the daemon or its strap is gone.
pub async fn run_hrm(io: Arc<TreadmillIo>, socket_path: &str) -> IoResult<()> {
    let mut backoff = Duration::from_secs(1);
    loop {
        match follow_hrm(&io, socket_path, &mut backoff).await {
            Ok(()) => info!("HRM connection closed"),
            Err(e) => debug!("HRM connection error: {}", e),
        }
        io.state.lock().heart_rate = 0;
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(MAX_BACKOFF);
    }
}

async fn follow_hrm(io: &TreadmillIo, socket_path: &str, backoff: &mut Duration) -> IoResult<()> {
    let stream = UnixStream::connect(socket_path).await?;
    info!("Connected to HRM daemon at {}", socket_path);
    *backoff = Duration::from_secs(1);

    let mut lines = BufReader::new(stream).lines();
    while let Some(line) = lines.next_line().await? {
        match serde_json::from_str::<HrmEvent>(&line) {
            Ok(ev) if ev.kind == "hr" => {
                io.state.lock().heart_rate = if ev.connected { ev.bpm } else { 0 };
            }
            Ok(_) => {}
            Err(e) => debug!("Unparseable HRM line ({}): {}", e, line),
        }
    }
    Ok(())
}
