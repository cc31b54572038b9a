// Timeouts, protocol constants, link configuration
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::scribbler::{Result, ScribblerError};

// Serial defaults for the Scribbler
pub const DEFAULT_BAUDRATE: u32 = 38_400;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

// Every command frame on the wire is exactly this long (opcode + 8 payload bytes)
pub const PACKET_LENGTH: usize = 9;
pub const MAX_PAYLOAD: usize = PACKET_LENGTH - 1;

// Sensor bytes piggybacked on every generic command reply
pub const SENSOR_PAYLOAD_LEN: usize = 11;

// Discovery: candidate port numbers and the broadcast marker
pub const DISCOVERY_PORTS: std::ops::RangeInclusive<u32> = 1..=20;
pub const DISCOVERY_MARKER: &[u8; 4] = b"IPRE";
pub const DISCOVERY_NAME_LEN: usize = 5;

// Manual drain gives up after this many bytes
pub const DRAIN_LIMIT: usize = 50_000;

// Raw battery reading -> volts
pub const BATTERY_SCALE: f64 = 20.9813;

// Environment override for the connection target
pub const TARGET_ENV: &str = "SCRIBBLER_PORT";

/// Link configuration for a Scribbler robot.
///
/// Every delay the protocol depends on lives here so tests (and slow USB
/// adapters) can tune them without touching the engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LinkConfig {
    /// Port identifier ("COM5", "5", "/dev/ttyUSB0") or robot name to search for.
    pub target: Option<String>,
    pub baud_rate: u32,
    #[serde(with = "millis")]
    pub timeout: Duration,
    /// Pause between failed open attempts.
    #[serde(with = "millis")]
    pub retry_backoff: Duration,
    /// How long a candidate port is given to emit its broadcast during discovery.
    #[serde(with = "millis")]
    pub discovery_settle: Duration,
    /// Window the input buffer must stay silent for the wake loop to finish.
    #[serde(with = "millis")]
    pub wake_window: Duration,
    /// Settle after toggling echo mode.
    #[serde(with = "millis")]
    pub echo_settle: Duration,
    #[serde(with = "millis")]
    pub drain_timeout: Duration,
    #[serde(with = "millis")]
    pub identify_timeout: Duration,
    /// Wait between the final hard stop and closing the port.
    #[serde(with = "millis")]
    pub teardown_delay: Duration,
    /// Interval between motor-stats polls while a Scribbler 2 path move runs.
    #[serde(with = "millis")]
    pub transit_poll: Duration,
    /// Pause before each framed write when no dongle is attached.
    #[serde(with = "millis")]
    pub pacing: Duration,
    /// Play the five-note greeting after waking the robot.
    pub startup_chirp: bool,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            target: None,
            baud_rate: DEFAULT_BAUDRATE,
            timeout: DEFAULT_TIMEOUT,
            retry_backoff: Duration::from_secs(1),
            discovery_settle: Duration::from_secs(1),
            wake_window: Duration::from_millis(1200),
            echo_settle: Duration::from_millis(250),
            drain_timeout: Duration::from_millis(500),
            identify_timeout: Duration::from_secs(4),
            teardown_delay: Duration::from_millis(500),
            transit_poll: Duration::from_secs(1),
            pacing: Duration::from_millis(10),
            startup_chirp: true,
        }
    }
}

impl LinkConfig {
    /// Creates a configuration for the given port or robot name with default timing.
    #[must_use]
    pub fn new(target: impl Into<String>) -> Self {
        Self {
            target: Some(target.into()),
            ..Self::default()
        }
    }

    /// Loads a configuration from a JSON file. Missing fields keep their defaults.
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path)?;
        serde_json::from_str(&text).map_err(|e| ScribblerError::Config(e.to_string()))
    }

    /// Applies the `SCRIBBLER_PORT` override, if set.
    #[must_use]
    pub fn with_env_override(mut self) -> Self {
        if let Ok(target) = std::env::var(TARGET_ENV) {
            if !target.trim().is_empty() {
                self.target = Some(target.trim().to_string());
            }
        }
        self
    }

    #[must_use]
    pub fn baud_rate(mut self, rate: u32) -> Self {
        self.baud_rate = rate;
        self
    }

    #[must_use]
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    #[must_use]
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.retry_backoff = backoff;
        self
    }

    #[must_use]
    pub fn discovery_settle(mut self, settle: Duration) -> Self {
        self.discovery_settle = settle;
        self
    }

    #[must_use]
    pub fn startup_chirp(mut self, enabled: bool) -> Self {
        self.startup_chirp = enabled;
        self
    }

    /// Shrinks every protocol delay to `delay`. Used against simulated devices.
    #[must_use]
    pub fn with_uniform_delays(mut self, delay: Duration) -> Self {
        self.retry_backoff = delay;
        self.discovery_settle = delay;
        self.wake_window = delay;
        self.echo_settle = delay;
        self.drain_timeout = delay;
        self.teardown_delay = delay;
        self.transit_poll = delay;
        self.pacing = Duration::ZERO;
        self
    }
}

// Durations are written as integer milliseconds in config files
mod millis {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(u64::try_from(value.as_millis()).unwrap_or(u64::MAX))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        u64::deserialize(deserializer).map(Duration::from_millis)
    }
}
