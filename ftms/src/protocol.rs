/// FTMS (Fitness Machine Service) binary frame encoding/decoding, plus the
/// Heart Rate, Running Speed and Cadence, and Cycling Power measurements the
/// gateway re-broadcasts.
///
/// All multi-byte values are little-endian per the Bluetooth GATT specification.
/// Everything here is a pure function of its arguments.

use uuid::Uuid;

use crate::config::ValueRange;
use crate::error::DecodeError;
use crate::telemetry::{SimulationParameters, TelemetrySnapshot};

// Bluetooth SIG base UUID: 0000XXXX-0000-1000-8000-00805f9b34fb
pub const fn ble_uuid(short: u16) -> Uuid {
    Uuid::from_u128(
        ((short as u128) << 96) | 0x0000_0000_0000_1000_8000_00805f9b34fb_u128,
    )
}

// FTMS service and characteristic UUIDs
pub const FTMS_SERVICE_UUID: Uuid = ble_uuid(0x1826);
pub const FEATURE_UUID: Uuid = ble_uuid(0x2ACC);
pub const TREADMILL_DATA_UUID: Uuid = ble_uuid(0x2ACD);
pub const TRAINING_STATUS_UUID: Uuid = ble_uuid(0x2AD3);
pub const SPEED_RANGE_UUID: Uuid = ble_uuid(0x2AD4);
pub const INCLINE_RANGE_UUID: Uuid = ble_uuid(0x2AD5);
pub const CONTROL_POINT_UUID: Uuid = ble_uuid(0x2AD9);
pub const MACHINE_STATUS_UUID: Uuid = ble_uuid(0x2ADA);

// Re-broadcast sensor services
pub const HR_SERVICE_UUID: Uuid = ble_uuid(0x180D);
pub const HR_MEASUREMENT_UUID: Uuid = ble_uuid(0x2A37);
pub const RSC_SERVICE_UUID: Uuid = ble_uuid(0x1814);
pub const RSC_MEASUREMENT_UUID: Uuid = ble_uuid(0x2A53);
pub const RSC_FEATURE_UUID: Uuid = ble_uuid(0x2A54);
pub const CYCLING_POWER_SERVICE_UUID: Uuid = ble_uuid(0x1818);
pub const CP_MEASUREMENT_UUID: Uuid = ble_uuid(0x2A63);
pub const CP_FEATURE_UUID: Uuid = ble_uuid(0x2A65);

// Treadmill Data flag bits
pub const FLAG_TOTAL_DISTANCE: u16 = 1 << 2;
pub const FLAG_INCLINATION: u16 = 1 << 3;
pub const FLAG_HEART_RATE: u16 = 1 << 8;
pub const FLAG_ELAPSED_TIME: u16 = 1 << 10;

const UINT24_MAX: u32 = 0x00FF_FFFF;

// Control Point opcodes
pub const OP_REQUEST_CONTROL: u8 = 0x00;
pub const OP_RESET: u8 = 0x01;
pub const OP_SET_TARGET_SPEED: u8 = 0x02;
pub const OP_SET_TARGET_INCLINATION: u8 = 0x03;
pub const OP_SET_TARGET_RESISTANCE: u8 = 0x04;
pub const OP_SET_TARGET_POWER: u8 = 0x05;
pub const OP_START_RESUME: u8 = 0x07;
pub const OP_STOP_PAUSE: u8 = 0x08;
pub const OP_SET_SIMULATION: u8 = 0x11;
pub const RESPONSE_CODE: u8 = 0x80;

// Stop or Pause parameter
const STOP: u8 = 0x01;
const PAUSE: u8 = 0x02;

// Training Status values
pub const TRAINING_IDLE: u8 = 0x01;
pub const TRAINING_MANUAL_MODE: u8 = 0x0D;

/// A decoded Control Point write.
#[derive(Debug, Clone, PartialEq)]
pub enum ControlCommand {
    RequestControl,
    Reset,
    /// km/h
    SetTargetSpeed(f64),
    /// percent
    SetTargetIncline(f64),
    /// unitless, 0.1 resolution; decoded but not actionable
    SetTargetResistance(f64),
    /// watts; decoded but not actionable
    SetTargetPower(u16),
    StartResume,
    /// `stop = false` means pause
    StopPause { stop: bool },
    SetSimulationParameters(SimulationParameters),
    Unknown { opcode: u8, payload: Vec<u8> },
}

impl ControlCommand {
    pub fn opcode(&self) -> u8 {
        match self {
            Self::RequestControl => OP_REQUEST_CONTROL,
            Self::Reset => OP_RESET,
            Self::SetTargetSpeed(_) => OP_SET_TARGET_SPEED,
            Self::SetTargetIncline(_) => OP_SET_TARGET_INCLINATION,
            Self::SetTargetResistance(_) => OP_SET_TARGET_RESISTANCE,
            Self::SetTargetPower(_) => OP_SET_TARGET_POWER,
            Self::StartResume => OP_START_RESUME,
            Self::StopPause { .. } => OP_STOP_PAUSE,
            Self::SetSimulationParameters(_) => OP_SET_SIMULATION,
            Self::Unknown { opcode, .. } => *opcode,
        }
    }

    /// Encode the command the way a client would write it.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut buf = vec![self.opcode()];
        match self {
            Self::RequestControl | Self::Reset | Self::StartResume => {}
            Self::SetTargetSpeed(kph) => {
                buf.extend_from_slice(&to_u16(kph * 100.0).to_le_bytes())
            }
            Self::SetTargetIncline(percent) => {
                buf.extend_from_slice(&to_i16(percent * 10.0).to_le_bytes())
            }
            Self::SetTargetResistance(level) => buf.push(to_u8(level * 10.0)),
            Self::SetTargetPower(watts) => buf.extend_from_slice(&watts.to_le_bytes()),
            Self::StopPause { stop } => buf.push(if *stop { STOP } else { PAUSE }),
            Self::SetSimulationParameters(p) => {
                buf.extend_from_slice(&to_i16(p.wind_speed * 1000.0).to_le_bytes());
                buf.extend_from_slice(&to_i16(p.grade * 100.0).to_le_bytes());
                buf.push(to_u8(p.crr * 10000.0));
                buf.push(to_u8(p.cw * 100.0));
            }
            Self::Unknown { payload, .. } => buf.extend_from_slice(payload),
        }
        buf
    }
}

/// Control Point result codes (FTMS spec Table 4.24)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum ResultCode {
    Success = 0x01,
    NotSupported = 0x02,
    InvalidParameter = 0x03,
    OperationFailed = 0x04,
    ControlNotPermitted = 0x05,
}

/// Fitness Machine Status events (FTMS spec Table 4.16).
#[derive(Debug, Clone, PartialEq)]
pub enum MachineStatus {
    Reset,
    StoppedOrPaused { stop: bool },
    StartedOrResumed,
    TargetSpeedChanged(f64),
    TargetInclineChanged(f64),
    SimulationParametersChanged(SimulationParameters),
    ControlPermissionLost,
}

fn to_u16(v: f64) -> u16 {
    v.round().clamp(0.0, u16::MAX as f64) as u16
}

fn to_i16(v: f64) -> i16 {
    v.round().clamp(i16::MIN as f64, i16::MAX as f64) as i16
}

fn to_u8(v: f64) -> u8 {
    v.round().clamp(0.0, u8::MAX as f64) as u8
}

/// Ramp angle in 0.1 degree units for an incline given in percent grade.
pub fn ramp_angle_tenths(incline_percent: f64) -> i16 {
    to_i16((incline_percent / 100.0).atan().to_degrees() * 10.0)
}

/// Encode FTMS Treadmill Data characteristic (0x2ACD).
///
/// Flags (uint16 LE):
///   - Bit 0 = 0: Instantaneous Speed present
///   - Bit 2 = 1: Total Distance present
///   - Bit 3 = 1: Inclination and Ramp Angle present
///   - Bit 8:     Heart Rate present, only when heart rate > 0
///   - Bit 10 = 1: Elapsed Time present
///
/// Layout: flags(2) + speed(2) + distance(3) + inclination(2) + ramp_angle(2)
///         + [heart_rate(1)] + elapsed(2) = 13 or 14 bytes
///
/// Elevation and energy fields are left out on purpose; several apps only
/// parse this narrower shape.
pub fn encode_treadmill_data(s: &TelemetrySnapshot) -> Vec<u8> {
    let has_hr = s.heart_rate > 0;
    let mut flags = FLAG_TOTAL_DISTANCE | FLAG_INCLINATION | FLAG_ELAPSED_TIME;
    if has_hr {
        flags |= FLAG_HEART_RATE;
    }

    let mut buf = Vec::with_capacity(if has_hr { 14 } else { 13 });
    buf.extend_from_slice(&flags.to_le_bytes());

    // Instantaneous Speed (uint16, km/h with 0.01 resolution)
    buf.extend_from_slice(&to_u16(s.speed_kph * 100.0).to_le_bytes());

    // Total Distance (uint24, meters)
    let distance = s.distance_m.clamp(0.0, UINT24_MAX as f64) as u32;
    buf.extend_from_slice(&distance.to_le_bytes()[..3]);

    // Inclination (sint16, percent with 0.1 resolution) + Ramp Angle (sint16, 0.1 degree)
    buf.extend_from_slice(&to_i16(s.incline_percent * 10.0).to_le_bytes());
    buf.extend_from_slice(&ramp_angle_tenths(s.incline_percent).to_le_bytes());

    if has_hr {
        buf.push(s.heart_rate.min(u8::MAX as u16) as u8);
    }

    // Elapsed Time (uint16, seconds)
    let elapsed = s.elapsed_secs.min(u16::MAX as u32) as u16;
    buf.extend_from_slice(&elapsed.to_le_bytes());

    buf
}

/// Parse FTMS Control Point writes (0x2AD9).
///
/// Unknown opcodes are not an error; they come back as
/// [`ControlCommand::Unknown`] so the caller can answer "not supported".
pub fn decode_control_point(bytes: &[u8]) -> Result<ControlCommand, DecodeError> {
    let (&opcode, payload) = bytes.split_first().ok_or(DecodeError::Empty)?;
    let need = |needed: usize| {
        if payload.len() < needed {
            Err(DecodeError::Truncated { opcode, needed, got: payload.len() })
        } else {
            Ok(())
        }
    };
    let u16_at = |i: usize| u16::from_le_bytes([payload[i], payload[i + 1]]);
    let i16_at = |i: usize| i16::from_le_bytes([payload[i], payload[i + 1]]);

    let cmd = match opcode {
        OP_REQUEST_CONTROL => ControlCommand::RequestControl,
        OP_RESET => ControlCommand::Reset,
        OP_SET_TARGET_SPEED => {
            need(2)?;
            ControlCommand::SetTargetSpeed(u16_at(0) as f64 / 100.0)
        }
        OP_SET_TARGET_INCLINATION => {
            need(2)?;
            ControlCommand::SetTargetIncline(i16_at(0) as f64 / 10.0)
        }
        OP_SET_TARGET_RESISTANCE => {
            need(1)?;
            ControlCommand::SetTargetResistance(payload[0] as f64 / 10.0)
        }
        OP_SET_TARGET_POWER => {
            need(2)?;
            ControlCommand::SetTargetPower(u16_at(0))
        }
        OP_START_RESUME => ControlCommand::StartResume,
        OP_STOP_PAUSE => ControlCommand::StopPause {
            // The parameter is optional; a bare opcode means stop.
            stop: payload.first().map_or(true, |&p| p == STOP),
        },
        OP_SET_SIMULATION => {
            need(6)?;
            ControlCommand::SetSimulationParameters(SimulationParameters {
                wind_speed: i16_at(0) as f64 / 1000.0,
                grade: i16_at(2) as f64 / 100.0,
                crr: payload[4] as f64 / 10000.0,
                cw: payload[5] as f64 / 100.0,
            })
        }
        _ => ControlCommand::Unknown { opcode, payload: payload.to_vec() },
    };
    Ok(cmd)
}

/// Encode a Control Point response indication.
///
/// Format: `[0x80, request_opcode, result_code]`
pub fn encode_control_response(request_opcode: u8, result: ResultCode) -> [u8; 3] {
    [RESPONSE_CODE, request_opcode, result as u8]
}

/// Encode FTMS Feature characteristic (0x2ACC).
///
/// Fitness Machine Features (uint32 LE):
///   - Bit 2: Total Distance Supported
///   - Bit 3: Inclination Supported
///   - Bit 10: Heart Rate Measurement Supported
///   - Bit 12: Elapsed Time Supported
///   = 0x0000_140C
///
/// Target Setting Features (uint32 LE):
///   - Bit 0: Speed Target Supported
///   - Bit 1: Inclination Target Supported
///   = 0x0000_0003
pub fn encode_feature() -> [u8; 8] {
    let machine_features: u32 = 0x0000_140C;
    let target_features: u32 = 0x0000_0003;
    let mut buf = [0u8; 8];
    buf[0..4].copy_from_slice(&machine_features.to_le_bytes());
    buf[4..8].copy_from_slice(&target_features.to_le_bytes());
    buf
}

/// Encode Supported Speed Range characteristic (0x2AD4).
///
/// 3x 16-bit LE: minimum, maximum, step (all in km/h * 100).
pub fn encode_speed_range(range: &ValueRange) -> [u8; 6] {
    encode_range(range, 100.0)
}

/// Encode Supported Inclination Range characteristic (0x2AD5).
///
/// 3x sint16 LE: minimum, maximum, step (all in percent * 10).
pub fn encode_incline_range(range: &ValueRange) -> [u8; 6] {
    encode_range(range, 10.0)
}

fn encode_range(range: &ValueRange, scale: f64) -> [u8; 6] {
    let mut buf = [0u8; 6];
    buf[0..2].copy_from_slice(&to_i16(range.min * scale).to_le_bytes());
    buf[2..4].copy_from_slice(&to_i16(range.max * scale).to_le_bytes());
    buf[4..6].copy_from_slice(&to_i16(range.step * scale).to_le_bytes());
    buf
}

/// Encode Training Status (0x2AD3): flags 0x00 (no string), then
/// 0x0D Manual Mode while the belt runs, 0x01 Idle otherwise.
pub fn encode_training_status(running: bool) -> [u8; 2] {
    [0x00, if running { TRAINING_MANUAL_MODE } else { TRAINING_IDLE }]
}

/// Encode a Fitness Machine Status notification (0x2ADA).
pub fn encode_machine_status(status: &MachineStatus) -> Vec<u8> {
    match status {
        MachineStatus::Reset => vec![0x01],
        MachineStatus::StoppedOrPaused { stop } => vec![0x02, if *stop { STOP } else { PAUSE }],
        MachineStatus::StartedOrResumed => vec![0x04],
        MachineStatus::TargetSpeedChanged(kph) => {
            let mut buf = vec![0x05];
            buf.extend_from_slice(&to_u16(kph * 100.0).to_le_bytes());
            buf
        }
        MachineStatus::TargetInclineChanged(percent) => {
            let mut buf = vec![0x06];
            buf.extend_from_slice(&to_i16(percent * 10.0).to_le_bytes());
            buf
        }
        MachineStatus::SimulationParametersChanged(p) => {
            let mut buf = ControlCommand::SetSimulationParameters(*p).to_bytes();
            buf[0] = 0x12;
            buf
        }
        MachineStatus::ControlPermissionLost => vec![0xFF],
    }
}

/// Encode Heart Rate Measurement (0x2A37): flags 0x00 (uint8 format), bpm.
pub fn encode_heart_rate(bpm: u16) -> [u8; 2] {
    [0x00, bpm.min(u8::MAX as u16) as u8]
}

/// Encode RSC Measurement (0x2A53).
///
/// Layout: flags(1) + speed(2, 1/256 m/s) + cadence(1, strides/min)
///         + [stride_length(2, 1/100 m)]
/// Flag bit 0 marks the stride length as present.
pub fn encode_rsc_measurement(
    speed_mps: f64,
    cadence_spm: f64,
    stride_length_m: Option<f64>,
) -> Vec<u8> {
    let flags: u8 = if stride_length_m.is_some() { 0x01 } else { 0x00 };
    let mut buf = Vec::with_capacity(6);
    buf.push(flags);
    buf.extend_from_slice(&to_u16(speed_mps * 256.0).to_le_bytes());
    buf.push(to_u8(cadence_spm));
    if let Some(stride) = stride_length_m {
        buf.extend_from_slice(&to_u16(stride * 100.0).to_le_bytes());
    }
    buf
}

/// Encode RSC Feature (0x2A54): bit 0 = stride length supported.
pub fn encode_rsc_feature() -> [u8; 2] {
    0x0001u16.to_le_bytes()
}

/// Encode Cycling Power Measurement (0x2A63): flags(2) = 0, power(sint16, W).
pub fn encode_cycling_power(watts: f64) -> [u8; 4] {
    let mut buf = [0u8; 4];
    buf[2..4].copy_from_slice(&to_i16(watts).to_le_bytes());
    buf
}

/// Encode Cycling Power Feature (0x2A65): no optional features.
pub fn encode_cycling_power_feature() -> [u8; 4] {
    0u32.to_le_bytes()
}

/// Convert treadmill-native speed (mph * 10) to FTMS speed (km/h * 100).
///
/// 1 mph = 1.60934 km/h
/// mph_tenths * 0.1 mph * 1.60934 * 100 = mph_tenths * 16.0934
pub fn mph_tenths_to_kmh_hundredths(mph_tenths: u16) -> u16 {
    ((mph_tenths as u32) * 1609 / 100) as u16
}

/// Convert FTMS speed (km/h * 100) to treadmill-native speed (mph * 10).
pub fn kmh_hundredths_to_mph_tenths(kmh_hundredths: u16) -> u16 {
    ((kmh_hundredths as u32) * 100 / 1609) as u16
}
