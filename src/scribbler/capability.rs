// Capability negotiation: handshake parsing and the wake/quiet recovery loop
//
// The identify reply is a line of comma-separated key:value pairs, e.g.
//   Robot:Scribbler2,Robot-Version:1.1.2,Mode:Serial,Fluke:2.8.1
// An empty or unparseable reply yields an empty profile; older chassis report nothing.

use std::collections::BTreeMap;
use std::fmt;
use std::time::Duration;

use serde::Serialize;
use tracing::{debug, info, warn};

use super::engine::Engine;
use super::error::{Result, ScribblerError};
use super::protocol::{Opcode, Reply, Transaction};
use crate::config::LinkConfig;

/// Chassis identity reported by second-generation robots
pub const SCRIBBLER2: &str = "Scribbler2";

/// Dongle firmware from which the high-resolution camera is present
pub const HIGH_RES_FIRMWARE: [u32; 3] = [3, 0, 0];

/// Dongle firmware from which IR messaging is available
pub const IR_MESSAGING_FIRMWARE: [u32; 3] = [2, 8, 1];

// Pause between the two identify requests
const IDENTIFY_GAP: Duration = Duration::from_millis(100);

/// Dotted firmware version, ordered component-wise
#[derive(Debug, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub struct FirmwareVersion(pub Vec<u32>);

impl FirmwareVersion {
    /// Parse "2.8.1"; any non-numeric component rejects the whole string
    pub fn parse(text: &str) -> Option<Self> {
        text.trim()
            .split('.')
            .map(|part| part.trim().parse::<u32>().ok())
            .collect::<Option<Vec<_>>>()
            .map(FirmwareVersion)
    }

    pub fn at_least(&self, minimum: &[u32]) -> bool {
        self.0.as_slice() >= minimum
    }
}

impl fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(u32::to_string).collect();
        write!(f, "{}", parts.join("."))
    }
}

/// Camera image size, fixed by dongle generation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImageResolution {
    pub width: u32,
    pub height: u32,
}

pub const LOW_RES_IMAGE: ImageResolution = ImageResolution {
    width: 256,
    height: 192,
};
pub const HIGH_RES_IMAGE: ImageResolution = ImageResolution {
    width: 1280,
    height: 800,
};

/// What the connected hardware supports. Immutable once negotiated.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CapabilityProfile {
    /// Raw handshake pairs, keys lowercased
    pub handshake: BTreeMap<String, String>,
    /// Dongle firmware, if a dongle is attached
    pub dongle: Option<FirmwareVersion>,
    /// Chassis identity ("Scribbler2")
    pub chassis: Option<String>,
    pub image: Option<ImageResolution>,
}

impl CapabilityProfile {
    pub fn from_handshake(text: &str) -> Self {
        let handshake = parse_handshake(text);

        let dongle = handshake
            .get("fluke")
            .or_else(|| handshake.get("dongle"))
            .map(|raw| {
                FirmwareVersion::parse(raw).unwrap_or_else(|| {
                    warn!("Unparseable dongle version '{}'", raw);
                    FirmwareVersion::default()
                })
            });
        let image = dongle.as_ref().map(|version| {
            if version.at_least(&HIGH_RES_FIRMWARE) {
                HIGH_RES_IMAGE
            } else {
                LOW_RES_IMAGE
            }
        });
        let chassis = handshake.get("robot").cloned();

        Self {
            handshake,
            dongle,
            chassis,
            image,
        }
    }

    pub fn has_dongle(&self) -> bool {
        self.dongle.is_some()
    }

    pub fn has_chassis(&self) -> bool {
        self.chassis.is_some()
    }

    pub fn is_scribbler2(&self) -> bool {
        self.chassis.as_deref() == Some(SCRIBBLER2)
    }

    /// Chassis firmware as reported ("robot-version", falling back to "api")
    pub fn chassis_firmware(&self) -> Option<&str> {
        self.handshake
            .get("robot-version")
            .or_else(|| self.handshake.get("api"))
            .map(String::as_str)
    }

    pub fn dongle_at_least(&self, minimum: &[u32]) -> bool {
        self.dongle.as_ref().is_some_and(|v| v.at_least(minimum))
    }

    pub fn require_dongle(&self, feature: &'static str) -> Result<()> {
        if self.has_dongle() {
            Ok(())
        } else {
            Err(ScribblerError::UnsupportedOnChassis { feature })
        }
    }

    pub fn require_scribbler2(&self, feature: &'static str) -> Result<()> {
        if self.is_scribbler2() {
            Ok(())
        } else {
            Err(ScribblerError::UnsupportedOnChassis { feature })
        }
    }

    pub fn require_dongle_version(&self, minimum: &[u32], feature: &'static str) -> Result<()> {
        if self.dongle_at_least(minimum) {
            Ok(())
        } else {
            Err(ScribblerError::UnsupportedOnChassis { feature })
        }
    }

    /// Number of readings per sensor kind on this hardware
    pub fn sensor_counts(&self) -> BTreeMap<&'static str, u8> {
        let mut counts = BTreeMap::from([("ir", 2), ("line", 2), ("stall", 1), ("light", 3)]);
        if self.has_dongle() {
            counts.extend([("battery", 1), ("obstacle", 3), ("bright", 3)]);
        }
        counts
    }
}

/// Split handshake text into a lowercase-keyed map with trimmed values
pub fn parse_handshake(text: &str) -> BTreeMap<String, String> {
    text.split(',')
        .filter_map(|pair| pair.split_once(':'))
        .map(|(key, value)| {
            (
                key.trim().to_lowercase(),
                value.trim().trim_end_matches('\0').to_string(),
            )
        })
        .filter(|(key, _)| !key.is_empty())
        .collect()
}

/// Ask the robot who it is and build its profile
pub fn negotiate(engine: &Engine, config: &LinkConfig) -> Result<CapabilityProfile> {
    let text = identify(engine, config)?;
    let profile = CapabilityProfile::from_handshake(&text);
    if let Some(version) = &profile.dongle {
        info!("You are using fluke firmware {}", version);
    }
    if let Some(firmware) = profile.chassis_firmware() {
        info!("You are using scribbler firmware {}", firmware);
    }
    Ok(profile)
}

/// Raw handshake text; empty if the robot stays silent
pub fn identify(engine: &Engine, config: &LinkConfig) -> Result<String> {
    engine.with_link(|link| link.drain(config.drain_timeout))?;
    let request = Transaction::query(Opcode::GetInfo, Reply::Line);

    // the first reply often carries a garbled echo; ask twice
    match engine.text(&request, config.identify_timeout) {
        Ok(text) => debug!("Discarded first identify reply: {:?}", text),
        Err(ScribblerError::UserCancelled) => return Err(ScribblerError::UserCancelled),
        Err(e) => debug!("First identify failed: {}", e),
    }
    engine.pause(IDENTIFY_GAP)?;

    match engine.text(&request, config.identify_timeout) {
        Ok(text) => Ok(text),
        Err(e) if e.is_timeout() => {
            warn!("Robot did not identify itself; continuing with reduced features");
            Ok(String::new())
        }
        Err(e) => Err(e),
    }
}

/// Silence the robot's broadcast chatter.
///
/// Sends the quiet (echo off) command and repeats it until the input buffer stays empty for a
/// full `wake_window`. Returns the number of extra rounds needed.
pub fn wake(engine: &Engine, config: &LinkConfig) -> Result<u32> {
    engine.with_link(|link| link.drain(config.drain_timeout))?;
    quiet(engine, config)?;

    let mut rounds = 0;
    loop {
        engine.with_link(|link| link.clear_buffers())?;
        engine.pause(config.wake_window)?;
        if engine.with_link(|link| link.bytes_to_read())? == 0 {
            break;
        }
        rounds += 1;
        info!("Waking robot from sleep...");
        quiet(engine, config)?;
    }
    engine.with_link(|link| link.clear_buffers())?;
    Ok(rounds)
}

/// Switch echo mode, settle, then flush both directions
pub fn set_echo_mode(engine: &Engine, config: &LinkConfig, on: bool) -> Result<()> {
    engine.command(&Transaction::command(Opcode::SetEchoMode).with_payload(&[u8::from(on)]))?;
    engine.pause(config.echo_settle)?;
    engine.with_link(|link| link.clear_buffers())
}

fn quiet(engine: &Engine, config: &LinkConfig) -> Result<()> {
    match set_echo_mode(engine, config, false) {
        Err(e) if e.is_timeout() => {
            // a broadcasting robot may not answer; the flush below still applies
            debug!("Quiet command unanswered: {}", e);
            engine.with_link(|link| link.clear_buffers())
        }
        other => other,
    }
}
