//! Serial protocol engine for the Parallax Scribbler robot.
//!
//! The robot speaks a fixed opcode protocol: 9-byte command frames, each echoed
//! back before its reply. This crate opens and recovers the link, serializes
//! transactions, negotiates what the attached hardware supports, decodes sensor
//! frames and maps motion commands to wheel powers.
//!
//! ```no_run
//! use scribbler_link::config::LinkConfig;
//! use scribbler_link::scribbler::Scribbler;
//!
//! let robot = Scribbler::connect(LinkConfig::new("COM5"))?;
//! robot.drive(0.5, 0.0)?;
//! println!("{:?}", robot.sensors()?);
//! robot.stop()?;
//! # Ok::<(), scribbler_link::scribbler::ScribblerError>(())
//! ```

pub mod config;
pub mod readings;
pub mod runtime;
pub mod scribbler;
