// Command dispatch: symbolic get/set requests -> transaction shapes
//
// Requests are closed enums; string forms ("led", "middle", "on") are parsed once at
// the edge and everything after that is an exhaustive match.

use std::fmt;
use std::str::FromStr;

use serde::Serialize;

use super::capability::CapabilityProfile;
use super::error::{Result, ScribblerError};
use super::protocol::{Opcode, Transaction};

/// Bytes per name/password half
pub const LABEL_HALF: usize = 8;

// (on, off) opcodes for the chassis LEDs, indexed by `Led::index`
const CHASSIS_LEDS: [(Opcode, Opcode); 4] = [
    (Opcode::SetLedLeftOn, Opcode::SetLedLeftOff),
    (Opcode::SetLedCenterOn, Opcode::SetLedCenterOff),
    (Opcode::SetLedRightOn, Opcode::SetLedRightOff),
    (Opcode::SetLedAllOn, Opcode::SetLedAllOff),
];

// Back LED dimmer range for levels strictly between 0 and 1
const DIMMER_FLOOR: f32 = 170.0;
const DIMMER_CEIL: f32 = 255.0;

fn unsupported(what: &str, name: &str) -> ScribblerError {
    ScribblerError::UnsupportedOperation(format!("no such {what}: '{name}'"))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Led {
    Left,
    Center,
    Right,
    All,
    /// Dongle front LED
    Front,
    /// Dongle back LED (dimmable)
    Back,
}

impl Led {
    fn index(self) -> Option<usize> {
        match self {
            Led::Left => Some(0),
            Led::Center => Some(1),
            Led::Right => Some(2),
            Led::All => Some(3),
            Led::Front | Led::Back => None,
        }
    }
}

impl FromStr for Led {
    type Err = ScribblerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "0" | "left" => Ok(Led::Left),
            "1" | "center" | "middle" => Ok(Led::Center),
            "2" | "right" => Ok(Led::Right),
            "all" => Ok(Led::All),
            "front" => Ok(Led::Front),
            "back" => Ok(Led::Back),
            other => Err(unsupported("LED", other)),
        }
    }
}

/// Sensor channel selector
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Position {
    Left,
    Center,
    Right,
}

impl Position {
    pub fn index(self) -> usize {
        match self {
            Position::Left => 0,
            Position::Center => 1,
            Position::Right => 2,
        }
    }
}

impl FromStr for Position {
    type Err = ScribblerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "0" | "left" => Ok(Position::Left),
            "1" | "center" | "middle" => Ok(Position::Center),
            "2" | "right" => Ok(Position::Right),
            other => Err(unsupported("position", other)),
        }
    }
}

/// Two-channel sensors (IR, line) number left=0, right=1
fn pair_position(s: &str) -> Result<Position> {
    match s.trim().to_lowercase().as_str() {
        "0" | "left" => Ok(Position::Left),
        "1" | "right" => Ok(Position::Right),
        other => Err(unsupported("position", other)),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EmitterSide {
    Left,
    Center,
    Right,
    All,
}

impl EmitterSide {
    pub fn mask(self) -> u8 {
        match self {
            EmitterSide::Left => 0x04,
            EmitterSide::Center => 0x02,
            EmitterSide::Right => 0x01,
            EmitterSide::All => 0x07,
        }
    }

    /// New emitter bitmask after switching this side on or off
    pub fn apply(self, current: u8, on: bool) -> u8 {
        if on {
            current | self.mask()
        } else {
            current & !self.mask()
        }
    }
}

impl FromStr for EmitterSide {
    type Err = ScribblerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "left" => Ok(EmitterSide::Left),
            "center" | "middle" => Ok(EmitterSide::Center),
            "right" => Ok(EmitterSide::Right),
            "all" => Ok(EmitterSide::All),
            other => Err(unsupported("emitter", other)),
        }
    }
}

/// Which end of the robot counts as the front
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Forwardness {
    #[serde(rename = "fluke-forward")]
    FlukeForward,
    #[serde(rename = "scribbler-forward")]
    ScribblerForward,
}

/// Memory byte at page 0 offset 0 when the robot is scribbler-forward
pub const SCRIBBLER_FORWARD_MARK: u8 = 0xDF;

impl Forwardness {
    pub fn from_memory(byte: u8) -> Self {
        if byte == SCRIBBLER_FORWARD_MARK {
            Forwardness::ScribblerForward
        } else {
            Forwardness::FlukeForward
        }
    }

    fn wire(self) -> u8 {
        match self {
            Forwardness::FlukeForward => 1,
            Forwardness::ScribblerForward => 0,
        }
    }
}

impl FromStr for Forwardness {
    type Err = ScribblerError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "1" | "fluke-forward" => Ok(Forwardness::FlukeForward),
            "0" | "scribbler-forward" => Ok(Forwardness::ScribblerForward),
            other => Err(unsupported("direction", other)),
        }
    }
}

impl fmt::Display for Forwardness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Forwardness::FlukeForward => write!(f, "fluke-forward"),
            Forwardness::ScribblerForward => write!(f, "scribbler-forward"),
        }
    }
}

/// Truthiness of a textual switch value
pub fn parse_switch(value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "on" | "true" | "yes" => Ok(true),
        "0" | "off" | "false" | "no" => Ok(false),
        other => Err(unsupported("switch value", other)),
    }
}

/// LED level: a switch word or a number (0..1 for the dimmable back LED)
fn parse_level(value: &str) -> Result<f32> {
    if let Ok(level) = value.trim().parse::<f32>() {
        return Ok(level);
    }
    parse_switch(value).map(|on| if on { 1.0 } else { 0.0 })
}

fn parse_byte(value: &str) -> Result<u8> {
    value
        .trim()
        .parse::<u8>()
        .map_err(|_| unsupported("byte value", value))
}

/// Everything the robot can be told to change
#[derive(Debug, Clone, PartialEq)]
pub enum Setting {
    Led { led: Led, level: f32 },
    Name(String),
    Password(String),
    Forwardness(Forwardness),
    /// Loud (true) or quiet
    Volume(bool),
    EchoMode(bool),
    Emitters { side: EmitterSide, on: bool },
    /// One byte of user data memory
    Data { slot: u8, value: u8 },
    IrPower(u8),
    WhiteBalance(bool),
    /// Scribbler 2 speaker volume, percent
    S2Volume(u8),
}

impl Setting {
    /// Parse a symbolic (subject, position, value) request
    pub fn parse(subject: &str, position: &str, value: Option<&str>) -> Result<Self> {
        let value_of = || value.ok_or_else(|| unsupported("value for", subject));
        match subject.trim().to_lowercase().as_str() {
            "led" => Ok(Setting::Led {
                led: position.parse()?,
                level: parse_level(value_of()?)?,
            }),
            "name" => Ok(Setting::Name(position.to_string())),
            "password" => Ok(Setting::Password(position.to_string())),
            "forwardness" => Ok(Setting::Forwardness(position.parse()?)),
            "volume" => Ok(Setting::Volume(parse_switch(position)?)),
            "echomode" => Ok(Setting::EchoMode(parse_switch(position)?)),
            "emitters" | "communicate" => Ok(Setting::Emitters {
                side: position.parse()?,
                on: parse_switch(value.unwrap_or("on"))?,
            }),
            "data" => Ok(Setting::Data {
                slot: parse_byte(position)?,
                value: parse_byte(value_of()?)?,
            }),
            "irpower" => Ok(Setting::IrPower(parse_byte(position)?)),
            "whitebalance" => Ok(Setting::WhiteBalance(parse_switch(position)?)),
            "s2volume" => Ok(Setting::S2Volume(parse_byte(position)?.min(100))),
            other => Err(unsupported("setting", other)),
        }
    }
}

/// Transactions implementing one setting, in order
#[derive(Debug, Clone, PartialEq)]
pub struct Plan {
    pub steps: Vec<Transaction>,
    /// Wait for the echo settle time and flush both directions afterwards
    pub settle_and_flush: bool,
    /// Emitter bitmask to record once the steps succeed
    pub emitters: Option<u8>,
}

impl Plan {
    fn single(tx: Transaction) -> Self {
        Self {
            steps: vec![tx],
            settle_and_flush: false,
            emitters: None,
        }
    }
}

/// Split a label into two space-padded 8-byte halves
pub fn label_halves(label: &str) -> [[u8; LABEL_HALF]; 2] {
    let mut padded = [b' '; LABEL_HALF * 2];
    for (slot, byte) in padded.iter_mut().zip(label.bytes()) {
        *slot = byte;
    }
    let mut halves = [[b' '; LABEL_HALF]; 2];
    halves[0].copy_from_slice(&padded[..LABEL_HALF]);
    halves[1].copy_from_slice(&padded[LABEL_HALF..]);
    halves
}

/// Back LED level -> dimmer byte
pub fn dimmer_level(level: f32) -> u8 {
    if level >= 1.0 {
        DIMMER_CEIL as u8
    } else if level <= 0.0 {
        0
    } else {
        (level * (DIMMER_CEIL - DIMMER_FLOOR) + DIMMER_FLOOR) as u8
    }
}

/// Resolve a setting to its transactions, checking the profile first
pub fn plan(setting: &Setting, profile: &CapabilityProfile, emitters: u8) -> Result<Plan> {
    let plan = match setting {
        Setting::Led { led, level } => match (led.index(), led) {
            (Some(i), _) => {
                let (on, off) = CHASSIS_LEDS[i];
                Plan::single(Transaction::command(if *level > 0.0 { on } else { off }))
            }
            (None, Led::Front) => {
                profile.require_dongle("front LED")?;
                let op = if *level > 0.0 {
                    Opcode::SetDongleLedOn
                } else {
                    Opcode::SetDongleLedOff
                };
                Plan::single(Transaction::command(op))
            }
            (None, _) => {
                profile.require_dongle("back LED")?;
                Plan::single(
                    Transaction::command(Opcode::SetDimmerLed).with_payload(&[dimmer_level(*level)]),
                )
            }
        },
        Setting::Name(name) => label_plan(name, Opcode::SetName1, Opcode::SetName2),
        Setting::Password(password) => label_plan(password, Opcode::SetPass1, Opcode::SetPass2),
        Setting::Forwardness(direction) => {
            profile.require_dongle("forwardness")?;
            Plan::single(Transaction::command(Opcode::SetForwardness).with_payload(&[direction.wire()]))
        }
        Setting::Volume(loud) => Plan::single(Transaction::command(if *loud {
            Opcode::SetLoud
        } else {
            Opcode::SetQuiet
        })),
        Setting::EchoMode(on) => Plan {
            settle_and_flush: true,
            ..Plan::single(Transaction::command(Opcode::SetEchoMode).with_payload(&[u8::from(*on)]))
        },
        Setting::Emitters { side, on } => {
            profile.require_dongle("IR emitters")?;
            let mask = side.apply(emitters, *on);
            Plan {
                emitters: Some(mask),
                ..Plan::single(Transaction::command(Opcode::SetIrEmitters).with_payload(&[mask]))
            }
        }
        Setting::Data { slot, value } => {
            Plan::single(Transaction::command(Opcode::SetSingleData).with_payload(&[*slot, *value]))
        }
        Setting::IrPower(power) => {
            profile.require_dongle("IR power")?;
            Plan::single(Transaction::command(Opcode::SetDongleIr).with_payload(&[*power]))
        }
        Setting::WhiteBalance(on) => {
            profile.require_dongle("white balance")?;
            Plan::single(Transaction::command(if *on {
                Opcode::SetWhiteBalance
            } else {
                Opcode::SetNoWhiteBalance
            }))
        }
        Setting::S2Volume(percent) => {
            profile.require_scribbler2("speaker volume")?;
            Plan::single(Transaction::command(Opcode::SetVolume).with_payload(&[(*percent).min(100)]))
        }
    };
    Ok(plan)
}

fn label_plan(label: &str, first: Opcode, second: Opcode) -> Plan {
    let [head, tail] = label_halves(label);
    Plan {
        steps: vec![
            Transaction::command(first).with_payload(&head),
            Transaction::command(second).with_payload(&tail),
        ],
        settle_and_flush: false,
        emitters: None,
    }
}

/// Everything the robot can be asked for
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Query {
    /// All-sensor snapshot (extended when a dongle is attached)
    All,
    Light(Option<Position>),
    Ir(Option<Position>),
    Line(Option<Position>),
    Stall,
    Obstacle(Option<Position>),
    Bright(Option<Position>),
    Blob,
    Battery,
    Name,
    Password,
    Data,
    Info,
    /// Sensor counts for this hardware
    Config,
    Forwardness,
    Volume,
    Distance,
    MotorStats,
    Encoders,
    Location,
    Angle,
    MicEnvelope,
}

impl Query {
    /// Parse a symbolic (subject, position) request
    pub fn parse(subject: &str, position: Option<&str>) -> Result<Self> {
        let subject = subject.trim().to_lowercase();
        let all = |p: Option<&str>| p.is_none_or(|p| p.trim().eq_ignore_ascii_case("all"));
        let three = |p: Option<&str>| -> Result<Option<Position>> {
            if all(p) { Ok(None) } else { p.unwrap_or_default().parse().map(Some) }
        };
        let two = |p: Option<&str>| -> Result<Option<Position>> {
            if all(p) { Ok(None) } else { pair_position(p.unwrap_or_default()).map(Some) }
        };
        match subject.as_str() {
            "all" => Ok(Query::All),
            "light" => Ok(Query::Light(three(position)?)),
            "ir" => Ok(Query::Ir(two(position)?)),
            "line" => Ok(Query::Line(two(position)?)),
            "stall" => Ok(Query::Stall),
            "obstacle" => Ok(Query::Obstacle(three(position)?)),
            "bright" => Ok(Query::Bright(three(position)?)),
            "blob" => Ok(Query::Blob),
            "battery" => Ok(Query::Battery),
            "name" => Ok(Query::Name),
            "password" => Ok(Query::Password),
            "data" => Ok(Query::Data),
            "info" => Ok(Query::Info),
            "config" => Ok(Query::Config),
            "forwardness" => Ok(Query::Forwardness),
            "volume" => Ok(Query::Volume),
            "distance" => Ok(Query::Distance),
            "motorstats" => Ok(Query::MotorStats),
            "encoders" => Ok(Query::Encoders),
            "position" | "location" => Ok(Query::Location),
            "angle" => Ok(Query::Angle),
            "micenvelope" => Ok(Query::MicEnvelope),
            other => Err(unsupported("sensor", other)),
        }
    }
}
