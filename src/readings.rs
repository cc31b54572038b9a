// Serializable values returned by robot queries

use std::collections::BTreeMap;

use serde::Serialize;

use crate::scribbler::capability::CapabilityProfile;
use crate::scribbler::dispatch::Forwardness;
use crate::scribbler::sensors::{Blob, Encoders, MotorStats, SensorSnapshot};

/// Result of a symbolic query; serializes as the bare value
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum Reading {
    Sensors(SensorSnapshot),
    Byte(u8),
    Bytes(Vec<u8>),
    Word(u16),
    Words(Vec<u16>),
    /// Brightness window sums
    Sum(u32),
    Sums(Vec<u32>),
    Long(i32),
    Longs(Vec<i32>),
    Volts(f64),
    Switch(bool),
    Text(String),
    Map(BTreeMap<String, String>),
    Counts(BTreeMap<&'static str, u8>),
    Forwardness(Forwardness),
    Blob(Blob),
    MotorStats(MotorStats),
    Encoders(Encoders),
}

/// What `scribbler info` prints
#[derive(Debug, Clone, Serialize)]
pub struct RobotSummary {
    pub port: String,
    pub name: Option<String>,
    pub profile: CapabilityProfile,
    pub fudge: [f32; 4],
}
