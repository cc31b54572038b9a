// Scribbler serial protocol core
//
// Provides:
// - Link discovery, opening and retry (link)
// - Framed, serialized request/response exchange (engine)
// - Handshake parsing and the wake loop (capability)
// - Sensor frame decoding (sensors)
// - Wheel power mapping and fudge factors; Scribbler 2 path commands (kinematics)
// - Symbolic get/set resolution (dispatch)
// - High-level robot handle (driver)

pub mod cancel;
pub mod capability;
pub mod dispatch;
mod driver;
pub mod engine;
mod error;
pub mod kinematics;
pub mod link;
#[cfg(test)]
pub(crate) mod mock;
pub mod protocol;
pub mod sensors;

pub use cancel::CancelToken;
pub use capability::{CapabilityProfile, FirmwareVersion, ImageResolution};
pub use dispatch::{EmitterSide, Forwardness, Led, Position, Query, Setting};
pub use driver::{STARTUP_CHIRP, Scribbler};
pub use error::{Result, ScribblerError};
pub use kinematics::{AngleUnit, Calibration, PathCommand, Reference, WheelPower, to_wheel_power};
pub use link::{Connector, Link, Target, list_ports};
pub use sensors::{Blob, Encoders, ExtendedSensors, MotorStats, SensorSnapshot};
