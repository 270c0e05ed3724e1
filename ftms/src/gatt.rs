//! GATT table: which services the gateway exposes, their characteristics,
//! and how each characteristic may be accessed.

use std::fmt;

use uuid::Uuid;

use crate::protocol::{
    CONTROL_POINT_UUID, CP_FEATURE_UUID, CP_MEASUREMENT_UUID, CYCLING_POWER_SERVICE_UUID,
    FEATURE_UUID, FTMS_SERVICE_UUID, HR_MEASUREMENT_UUID, HR_SERVICE_UUID, INCLINE_RANGE_UUID,
    MACHINE_STATUS_UUID, RSC_FEATURE_UUID, RSC_MEASUREMENT_UUID, RSC_SERVICE_UUID,
    SPEED_RANGE_UUID, TRAINING_STATUS_UUID, TREADMILL_DATA_UUID,
};

/// Transport-assigned identity of a connected client (a BLE address for
/// the bluer transport, `tcp/<peer>` for the debug server).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ClientId(String);

impl ClientId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ClientId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ClientId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Services in registration order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServiceId {
    FitnessMachine,
    HeartRate,
    RunningSpeedCadence,
    CyclingPower,
}

impl ServiceId {
    pub const ALL: [ServiceId; 4] = [
        ServiceId::FitnessMachine,
        ServiceId::HeartRate,
        ServiceId::RunningSpeedCadence,
        ServiceId::CyclingPower,
    ];

    pub fn uuid(self) -> Uuid {
        match self {
            Self::FitnessMachine => FTMS_SERVICE_UUID,
            Self::HeartRate => HR_SERVICE_UUID,
            Self::RunningSpeedCadence => RSC_SERVICE_UUID,
            Self::CyclingPower => CYCLING_POWER_SERVICE_UUID,
        }
    }

    pub fn characteristics(self) -> &'static [CharacteristicId] {
        use CharacteristicId::*;
        match self {
            Self::FitnessMachine => &[
                FitnessMachineFeature,
                TreadmillData,
                SupportedSpeedRange,
                SupportedInclinationRange,
                TrainingStatus,
                ControlPoint,
                MachineStatus,
            ],
            Self::HeartRate => &[HeartRateMeasurement],
            Self::RunningSpeedCadence => &[RscMeasurement, RscFeature],
            Self::CyclingPower => &[CyclingPowerMeasurement, CyclingPowerFeature],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CharacteristicId {
    FitnessMachineFeature,
    TreadmillData,
    SupportedSpeedRange,
    SupportedInclinationRange,
    TrainingStatus,
    ControlPoint,
    MachineStatus,
    HeartRateMeasurement,
    RscMeasurement,
    RscFeature,
    CyclingPowerMeasurement,
    CyclingPowerFeature,
}

/// How a client pushes or pulls a characteristic's value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Access {
    pub read: bool,
    pub write: bool,
    pub notify: bool,
    pub indicate: bool,
}

impl CharacteristicId {
    pub const ALL: [CharacteristicId; 12] = [
        Self::FitnessMachineFeature,
        Self::TreadmillData,
        Self::SupportedSpeedRange,
        Self::SupportedInclinationRange,
        Self::TrainingStatus,
        Self::ControlPoint,
        Self::MachineStatus,
        Self::HeartRateMeasurement,
        Self::RscMeasurement,
        Self::RscFeature,
        Self::CyclingPowerMeasurement,
        Self::CyclingPowerFeature,
    ];

    pub fn uuid(self) -> Uuid {
        match self {
            Self::FitnessMachineFeature => FEATURE_UUID,
            Self::TreadmillData => TREADMILL_DATA_UUID,
            Self::SupportedSpeedRange => SPEED_RANGE_UUID,
            Self::SupportedInclinationRange => INCLINE_RANGE_UUID,
            Self::TrainingStatus => TRAINING_STATUS_UUID,
            Self::ControlPoint => CONTROL_POINT_UUID,
            Self::MachineStatus => MACHINE_STATUS_UUID,
            Self::HeartRateMeasurement => HR_MEASUREMENT_UUID,
            Self::RscMeasurement => RSC_MEASUREMENT_UUID,
            Self::RscFeature => RSC_FEATURE_UUID,
            Self::CyclingPowerMeasurement => CP_MEASUREMENT_UUID,
            Self::CyclingPowerFeature => CP_FEATURE_UUID,
        }
    }

    pub fn access(self) -> Access {
        let read = Access { read: true, ..Access::default() };
        let notify = Access { notify: true, ..Access::default() };
        match self {
            Self::FitnessMachineFeature
            | Self::SupportedSpeedRange
            | Self::SupportedInclinationRange
            | Self::RscFeature
            | Self::CyclingPowerFeature => read,
            Self::TreadmillData
            | Self::MachineStatus
            | Self::HeartRateMeasurement
            | Self::RscMeasurement
            | Self::CyclingPowerMeasurement => notify,
            Self::TrainingStatus => Access { read: true, notify: true, ..Access::default() },
            Self::ControlPoint => Access { write: true, indicate: true, ..Access::default() },
        }
    }

    /// Short name used by the debug server (`td`, `cp`, ...).
    pub fn short_name(self) -> &'static str {
        match self {
            Self::FitnessMachineFeature => "feat",
            Self::TreadmillData => "td",
            Self::SupportedSpeedRange => "sr",
            Self::SupportedInclinationRange => "ir",
            Self::TrainingStatus => "ts",
            Self::ControlPoint => "cp",
            Self::MachineStatus => "ms",
            Self::HeartRateMeasurement => "hr",
            Self::RscMeasurement => "rsc",
            Self::RscFeature => "rscf",
            Self::CyclingPowerMeasurement => "pwr",
            Self::CyclingPowerFeature => "pwrf",
        }
    }

    pub fn from_short_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.short_name() == name)
    }

    pub fn from_uuid(uuid: Uuid) -> Option<Self> {
        Self::ALL.into_iter().find(|c| c.uuid() == uuid)
    }
}
