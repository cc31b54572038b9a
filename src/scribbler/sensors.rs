// Sensor decoding: raw reply bytes -> typed readings
//
// All decoders are pure and length-checked; a short buffer is a protocol error.

use serde::Serialize;

use super::error::{Result, ScribblerError};
use super::protocol::Opcode;
use crate::config::{BATTERY_SCALE, SENSOR_PAYLOAD_LEN};

/// Readings carried by every generic command reply
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct SensorSnapshot {
    pub light: [u16; 3],
    pub ir: [u8; 2],
    pub line: [u8; 2],
    pub stall: u8,
    /// Present only when a dongle is attached
    #[serde(flatten)]
    pub extended: Option<ExtendedSensors>,
}

/// Dongle readings appended to the all-sensor snapshot, in this order
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ExtendedSensors {
    pub obstacle: [u16; 3],
    pub bright: [u32; 3],
    pub blob: Blob,
    pub battery: f64,
}

/// Largest matching colour region seen by the camera
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
pub struct Blob {
    pub pixels: u16,
    pub x: u8,
    pub y: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct MotorStats {
    pub idler_speed: u8,
    pub moving: bool,
    pub idler_timer: u8,
    pub right_velocity: i8,
    pub left_velocity: i8,
    pub ready: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Encoders {
    pub left: i32,
    pub right: i32,
}

fn require(raw: &[u8], len: usize, opcode: Opcode) -> Result<()> {
    if raw.len() < len {
        return Err(ScribblerError::invalid(
            opcode.into(),
            format!("expected {} bytes, got {}", len, raw.len()),
        ));
    }
    Ok(())
}

/// Decode the 11-byte all-sensor payload
pub fn decode_all(raw: &[u8]) -> Result<SensorSnapshot> {
    require(raw, SENSOR_PAYLOAD_LEN, Opcode::GetAll)?;
    let word = |i: usize| u16::from_be_bytes([raw[i], raw[i + 1]]);
    Ok(SensorSnapshot {
        light: [word(2), word(4), word(6)],
        ir: [raw[0], raw[1]],
        line: [raw[8], raw[9]],
        stall: raw[10],
        extended: None,
    })
}

/// Upper six bits of byte 0 are the idler speed, the low two the moving flag.
pub fn decode_motor_stats(raw: &[u8]) -> Result<MotorStats> {
    require(raw, 5, Opcode::GetMotorStats)?;
    Ok(MotorStats {
        idler_speed: raw[0] >> 2,
        moving: raw[0] & 0x03 != 0,
        idler_timer: raw[1],
        right_velocity: i8::from_be_bytes([raw[2]]),
        left_velocity: i8::from_be_bytes([raw[3]]),
        ready: raw[4] != 0,
    })
}

pub fn decode_encoders(raw: &[u8]) -> Result<Encoders> {
    require(raw, 8, Opcode::GetEncoders)?;
    Ok(Encoders {
        left: i32::from_be_bytes([raw[0], raw[1], raw[2], raw[3]]),
        right: i32::from_be_bytes([raw[4], raw[5], raw[6], raw[7]]),
    })
}

/// Battery volts from the 2-byte raw reading
pub fn decode_battery(raw: &[u8]) -> Result<f64> {
    require(raw, 2, Opcode::GetBattery)?;
    Ok(f64::from(u16::from_be_bytes([raw[0], raw[1]])) / BATTERY_SCALE)
}

/// One dongle IR obstacle channel (2 bytes)
pub fn decode_obstacle(raw: &[u8]) -> Result<u16> {
    require(raw, 2, Opcode::GetDongleLeftIr)?;
    Ok(u16::from_be_bytes([raw[0], raw[1]]))
}

/// One brightness window (3-byte big-endian sum)
pub fn decode_bright(raw: &[u8]) -> Result<u32> {
    require(raw, 3, Opcode::GetWindowLight)?;
    Ok(u32::from_be_bytes([0, raw[0], raw[1], raw[2]]))
}

pub fn decode_blob(raw: &[u8]) -> Result<Blob> {
    require(raw, 4, Opcode::GetBlob)?;
    Ok(Blob {
        pixels: u16::from_be_bytes([raw[0], raw[1]]),
        x: raw[2],
        y: raw[3],
    })
}

/// Name and password halves: keep '0'..='z', then trim
pub fn decode_label(raw: &[u8]) -> String {
    raw.iter()
        .copied()
        .filter(|b| (b'0'..=b'z').contains(b))
        .map(char::from)
        .collect::<String>()
        .trim()
        .to_string()
}
