//! The gateway facade: the only piece that talks to the transport and to
//! the treadmill.
//!
//! Transports call the `on_*` methods from their own tasks, possibly
//! concurrently for different clients. Each method runs to completion
//! without awaiting, so a single client's writes are handled in the order
//! its transport delivers them.

use std::collections::VecDeque;
use std::sync::Arc;

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::advertising::AdvertisingSupervisor;
use crate::config::GatewayConfig;
use crate::control::ControlArbiter;
use crate::error::{AdvertiseError, DecodeError, RegistrationError};
use crate::gatt::{CharacteristicId, ClientId, ServiceId};
use crate::notifier::NotificationScheduler;
use crate::protocol::{self, ControlCommand, MachineStatus, ResultCode};
use crate::session::SessionRegistry;
use crate::telemetry::Treadmill;
use crate::transport::{GattTransport, ReadOutcome, WriteOutcome};

pub struct Gateway {
    config: GatewayConfig,
    transport: Arc<dyn GattTransport>,
    treadmill: Arc<dyn Treadmill>,
    sessions: Arc<SessionRegistry>,
    advertising: Arc<AdvertisingSupervisor>,
    /// Services still waiting for their service-added confirmation; the
    /// front entry is the one currently registering.
    pending_services: Mutex<VecDeque<ServiceId>>,
    notifier: Mutex<Option<JoinHandle<()>>>,
    cancel: CancellationToken,
}

impl Gateway {
    pub fn new(
        config: GatewayConfig,
        transport: Arc<dyn GattTransport>,
        treadmill: Arc<dyn Treadmill>,
    ) -> Arc<Self> {
        let cancel = CancellationToken::new();
        let arbiter = Arc::new(ControlArbiter::new(config.control_allowed));
        let sessions = Arc::new(SessionRegistry::new(arbiter));
        let advertising = Arc::new(AdvertisingSupervisor::new(
            transport.clone(),
            config.device_name.clone(),
            config.advertise_retry(),
            cancel.child_token(),
        ));
        Arc::new(Self {
            config,
            transport,
            treadmill,
            sessions,
            advertising,
            pending_services: Mutex::new(VecDeque::new()),
            notifier: Mutex::new(None),
            cancel,
        })
    }

    pub fn config(&self) -> &GatewayConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionRegistry> {
        &self.sessions
    }

    pub fn advertising(&self) -> &Arc<AdvertisingSupervisor> {
        &self.advertising
    }

    pub fn treadmill(&self) -> &Arc<dyn Treadmill> {
        &self.treadmill
    }

    /// Register services one at a time (advertising follows the last
    /// confirmation) and start the notification scheduler.
    pub fn start(&self) {
        let first = {
            let mut pending = self.pending_services.lock();
            pending.clear();
            pending.extend(ServiceId::ALL);
            pending.front().copied()
        };
        if let Some(service) = first {
            info!("Registering {:?} service", service);
            self.transport.register_service(service);
        }

        let scheduler = NotificationScheduler::new(
            self.sessions.clone(),
            self.treadmill.clone(),
            self.transport.clone(),
            self.config.notify_interval(),
        );
        let handle = scheduler.spawn(self.cancel.child_token());
        if let Some(old) = self.notifier.lock().replace(handle) {
            old.abort();
        }
    }

    /// Stop notifying, stop advertising (including pending retries) and
    /// disconnect every client.
    pub fn stop(&self) {
        info!("Stopping gateway");
        self.cancel.cancel();
        self.pending_services.lock().clear();
        self.advertising.stop();
        for client in self.sessions.drain() {
            self.transport.disconnect(&client);
        }
        self.notifier.lock().take();
    }

    pub fn on_service_added(&self, service: ServiceId, result: Result<(), RegistrationError>) {
        match &result {
            Ok(()) => info!("{:?} service registered", service),
            Err(e) => error!("{:?} service: {}", service, e),
        }

        let next = {
            let mut pending = self.pending_services.lock();
            if pending.front() != Some(&service) {
                warn!("Unexpected service-added confirmation for {:?}", service);
                return;
            }
            pending.pop_front();
            pending.front().copied()
        };

        match next {
            Some(service) => {
                info!("Registering {:?} service", service);
                self.transport.register_service(service);
            }
            None => {
                info!("All services registered");
                self.advertising.start();
            }
        }
    }

    pub fn on_advertising_result(&self, result: Result<(), AdvertiseError>) {
        self.advertising.on_result(result);
    }

    pub fn on_advertising_stopped(&self) {
        self.advertising.on_stopped();
    }

    pub fn on_connect(&self, client: &ClientId) {
        self.sessions.on_connect(client);
    }

    pub fn on_disconnect(&self, client: &ClientId) {
        self.sessions.on_disconnect(client);
        if self.sessions.is_empty() && !self.cancel.is_cancelled() {
            self.advertising.restart_if_idle();
        }
    }

    pub fn on_subscription(&self, client: &ClientId, characteristic: CharacteristicId, enabled: bool) {
        let access = characteristic.access();
        if !(access.notify || access.indicate) {
            warn!("{} tried to subscribe to non-notifying {:?}", client, characteristic);
            return;
        }
        if !self.sessions.set_subscribed(client, characteristic, enabled) {
            debug!("Subscription from unknown client {} ignored", client);
            return;
        }
        if enabled && characteristic == CharacteristicId::TrainingStatus {
            let status = protocol::encode_training_status(self.treadmill.snapshot().running);
            self.transport.notify(client, characteristic, &status, false);
        }
    }

    pub fn on_read(&self, client: &ClientId, characteristic: CharacteristicId) -> ReadOutcome {
        debug!("{} read {:?}", client, characteristic);
        let value = match characteristic {
            CharacteristicId::FitnessMachineFeature => protocol::encode_feature().to_vec(),
            CharacteristicId::SupportedSpeedRange => {
                protocol::encode_speed_range(&self.config.speed_range).to_vec()
            }
            CharacteristicId::SupportedInclinationRange => {
                protocol::encode_incline_range(&self.config.incline_range).to_vec()
            }
            CharacteristicId::TrainingStatus => {
                protocol::encode_training_status(self.treadmill.snapshot().running).to_vec()
            }
            CharacteristicId::RscFeature => protocol::encode_rsc_feature().to_vec(),
            CharacteristicId::CyclingPowerFeature => {
                protocol::encode_cycling_power_feature().to_vec()
            }
            _ => return ReadOutcome::NotPermitted,
        };
        ReadOutcome::Value(value)
    }

    /// Handle a characteristic write. Control point writes are always
    /// answered with a response indication, except an empty write which has
    /// no opcode to echo.
    pub fn on_write(&self, client: &ClientId, characteristic: CharacteristicId, value: &[u8]) -> WriteOutcome {
        if characteristic != CharacteristicId::ControlPoint {
            warn!("{} tried to write read-only {:?}", client, characteristic);
            return WriteOutcome::NotPermitted;
        }
        debug!("Control Point write from {}: {:02x?}", client, value);

        let (opcode, result, command) = match protocol::decode_control_point(value) {
            Ok(cmd) => (cmd.opcode(), self.execute(client, &cmd), Some(cmd)),
            Err(DecodeError::Empty) => {
                warn!("Empty Control Point write from {}", client);
                return WriteOutcome::InvalidLength;
            }
            Err(e @ DecodeError::Truncated { opcode, .. }) => {
                warn!("Malformed Control Point write from {}: {}", client, e);
                (opcode, ResultCode::InvalidParameter, None)
            }
        };

        let response = protocol::encode_control_response(opcode, result);
        self.transport.notify(client, CharacteristicId::ControlPoint, &response, true);

        if let (ResultCode::Success, Some(cmd)) = (result, command) {
            self.announce(&cmd);
        }
        WriteOutcome::Accepted
    }

    /// Carry out a decoded command. Only Request Control consults the
    /// arbiter; everything else is forwarded whoever holds control.
    fn execute(&self, client: &ClientId, cmd: &ControlCommand) -> ResultCode {
        match cmd {
            ControlCommand::RequestControl => {
                if self.sessions.arbiter().is_enabled()
                    && !self.sessions.holds_control(client)
                    && !self.treadmill.on_control_requested()
                {
                    info!("{} denied control by treadmill policy", client);
                    return ResultCode::ControlNotPermitted;
                }
                match self.sessions.request_control(client) {
                    Ok(()) => ResultCode::Success,
                    Err(e) => {
                        info!("{} denied control: {}", client, e);
                        ResultCode::ControlNotPermitted
                    }
                }
            }
            ControlCommand::Reset => {
                if let Some(prev) = self.sessions.reset_control() {
                    if prev != *client
                        && self.sessions.is_subscribed(&prev, CharacteristicId::MachineStatus)
                    {
                        let lost = protocol::encode_machine_status(&MachineStatus::ControlPermissionLost);
                        self.transport.notify(&prev, CharacteristicId::MachineStatus, &lost, false);
                    }
                }
                ResultCode::Success
            }
            ControlCommand::SetTargetSpeed(kph) => {
                info!("FTMS: {} set speed to {:.2} km/h", client, kph);
                self.treadmill.on_set_target_speed(*kph);
                ResultCode::Success
            }
            ControlCommand::SetTargetIncline(percent) => {
                info!("FTMS: {} set incline to {:.1}%", client, percent);
                self.treadmill.on_set_target_incline(*percent);
                ResultCode::Success
            }
            ControlCommand::StartResume => {
                info!("FTMS: {} start/resume", client);
                self.treadmill.on_start_resume();
                ResultCode::Success
            }
            ControlCommand::StopPause { stop } => {
                info!("FTMS: {} {}", client, if *stop { "stop" } else { "pause" });
                self.treadmill.on_stop_pause(*stop);
                ResultCode::Success
            }
            ControlCommand::SetSimulationParameters(params) => {
                debug!("FTMS: {} simulation {:?}", client, params);
                self.treadmill.on_simulation_parameters(*params);
                ResultCode::Success
            }
            ControlCommand::SetTargetResistance(_)
            | ControlCommand::SetTargetPower(_)
            | ControlCommand::Unknown { .. } => {
                info!("FTMS: unsupported opcode 0x{:02x} from {}", cmd.opcode(), client);
                ResultCode::NotSupported
            }
        }
    }

    /// Machine Status and Training Status notifications that follow a
    /// successful command.
    fn announce(&self, cmd: &ControlCommand) {
        let status = match cmd {
            ControlCommand::Reset => Some(MachineStatus::Reset),
            ControlCommand::SetTargetSpeed(kph) => Some(MachineStatus::TargetSpeedChanged(*kph)),
            ControlCommand::SetTargetIncline(p) => Some(MachineStatus::TargetInclineChanged(*p)),
            ControlCommand::StartResume => Some(MachineStatus::StartedOrResumed),
            ControlCommand::StopPause { stop } => Some(MachineStatus::StoppedOrPaused { stop: *stop }),
            ControlCommand::SetSimulationParameters(p) => {
                Some(MachineStatus::SimulationParametersChanged(*p))
            }
            _ => None,
        };
        if let Some(status) = status {
            self.broadcast(CharacteristicId::MachineStatus, &protocol::encode_machine_status(&status));
        }

        let running = match cmd {
            ControlCommand::StartResume => Some(true),
            ControlCommand::StopPause { .. } => Some(false),
            _ => None,
        };
        if let Some(running) = running {
            self.broadcast(CharacteristicId::TrainingStatus, &protocol::encode_training_status(running));
        }
    }

    fn broadcast(&self, characteristic: CharacteristicId, value: &[u8]) {
        for client in self.sessions.subscribers_of(characteristic) {
            self.transport.notify(&client, characteristic, value, false);
        }
    }
}
