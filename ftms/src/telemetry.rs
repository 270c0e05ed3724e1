//! Treadmill-side collaborator: where telemetry comes from and where
//! decoded commands go.

/// One reading of the treadmill, taken fresh on every notification tick.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct TelemetrySnapshot {
    /// Belt speed in km/h
    pub speed_kph: f64,
    /// Incline in percent grade, may be negative
    pub incline_percent: f64,
    /// Cumulative distance in meters
    pub distance_m: f64,
    pub elevation_gain_m: f64,
    pub elevation_loss_m: f64,
    /// Total energy in kcal
    pub energy_kcal: f64,
    /// Energy rate in kcal/h
    pub energy_rate_kcal_h: f64,
    /// Heart rate in bpm, 0 when no monitor is connected
    pub heart_rate: u16,
    pub elapsed_secs: u32,
    pub running: bool,
    /// Latest reading from an external foot pod, re-broadcast as RSC and
    /// cycling power when present.
    pub foot_pod: Option<FootPodReading>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FootPodReading {
    pub speed_mps: f64,
    /// Strides per minute
    pub cadence_spm: f64,
    pub stride_length_m: Option<f64>,
    pub power_watts: Option<f64>,
}

/// Indoor Bike Simulation parameters, already scaled to SI units.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct SimulationParameters {
    /// m/s
    pub wind_speed: f64,
    /// percent
    pub grade: f64,
    /// rolling resistance coefficient
    pub crr: f64,
    /// wind resistance coefficient, kg/m
    pub cw: f64,
}

/// The treadmill behind the gateway.
///
/// Command hooks are fire-and-forget: the gateway answers the client as soon
/// as a command is handed over and never waits on the belt.
pub trait Treadmill: Send + Sync {
    fn snapshot(&self) -> TelemetrySnapshot;

    /// Policy hook consulted before a client is granted control.
    fn on_control_requested(&self) -> bool {
        true
    }

    fn on_set_target_speed(&self, kph: f64);

    fn on_set_target_incline(&self, percent: f64);

    fn on_start_resume(&self);

    fn on_stop_pause(&self, stop: bool);

    fn on_simulation_parameters(&self, params: SimulationParameters);
}
