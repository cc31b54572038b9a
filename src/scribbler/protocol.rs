// Scribbler serial protocol: opcodes, frames, transaction shapes
//
// Frame format: [opcode, payload..., 0x00 padding] - always PACKET_LENGTH bytes.
// The robot echoes each frame verbatim before its reply. Commands handled by
// the dongle itself are written unframed and are not echoed.

use crate::config::{MAX_PAYLOAD, PACKET_LENGTH, SENSOR_PAYLOAD_LEN};

/// Opcode set (subset of the firmware command table used by this crate)
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Opcode {
    GetPass1 = 50,
    GetPass2 = 51,
    SetPass1 = 55,
    SetPass2 = 56,
    GetName2 = 64,
    GetAll = 65,
    GetLightAll = 70,
    GetIrAll = 73,
    GetLineAll = 76,
    GetName1 = 78,
    GetInfo = 80,
    GetData = 81,

    // Dongle sensors
    GetDongleLeftIr = 85,
    GetDongleCenterIr = 86,
    GetDongleRightIr = 87,
    GetWindowLight = 88,
    GetBattery = 89,
    GetSerialMem = 90,
    GetBlob = 95,

    SetSingleData = 96,
    SetEchoMode = 98,
    SetLedLeftOn = 99,
    SetLedLeftOff = 100,
    SetLedCenterOn = 101,
    SetLedCenterOff = 102,
    SetLedRightOn = 103,
    SetLedRightOff = 104,
    SetLedAllOn = 105,
    SetLedAllOff = 106,
    SetMotorsOff = 108,
    SetMotors = 109,
    SetName1 = 110,
    SetLoud = 111,
    SetQuiet = 112,
    SetSpeaker = 113,
    SetSpeaker2 = 114,

    // Dongle actuators
    SetDongleLedOn = 116,
    SetDongleLedOff = 117,
    SetName2 = 119,
    SetDongleIr = 120,
    SetSerialMem = 121,
    SetResetScribbler = 124,
    SetSerialErase = 125,
    SetDimmerLed = 126,
    SetForwardness = 128,
    SetWhiteBalance = 129,
    SetNoWhiteBalance = 130,
    GetIrMessage = 150,
    SendIrMessage = 151,
    SetIrEmitters = 152,

    // Scribbler 2 only
    SetVolume = 160,
    SetPath = 161,
    SetMove = 162,
    SetArc = 163,
    SetTurn = 164,
    GetPosition = 165,
    SetPosition = 166,
    GetAngle = 167,
    SetAngle = 168,
    GetMicEnvelope = 169,
    GetMotorStats = 170,
    GetEncoders = 171,
    GetDistance = 175,
}

impl Opcode {
    /// Commands the dongle answers itself: unframed, no echo, no sensor trailer.
    pub fn is_dongle(self) -> bool {
        matches!(
            self,
            Opcode::GetDongleLeftIr
                | Opcode::GetDongleCenterIr
                | Opcode::GetDongleRightIr
                | Opcode::GetWindowLight
                | Opcode::GetBattery
                | Opcode::GetSerialMem
                | Opcode::SetSerialMem
                | Opcode::SetSerialErase
                | Opcode::SetResetScribbler
                | Opcode::GetBlob
                | Opcode::SetDongleLedOn
                | Opcode::SetDongleLedOff
                | Opcode::SetDongleIr
                | Opcode::SetDimmerLed
                | Opcode::SetForwardness
                | Opcode::SetWhiteBalance
                | Opcode::SetNoWhiteBalance
                | Opcode::GetIrMessage
                | Opcode::SendIrMessage
                | Opcode::SetIrEmitters
        )
    }
}

impl From<Opcode> for u8 {
    fn from(op: Opcode) -> Self {
        op as u8
    }
}

/// How a transaction reaches the wire
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Framing {
    /// Zero-padded 9-byte frame, echoed by the robot
    Framed,
    /// Opcode and arguments as-is, no echo
    Raw,
}

/// Expected reply shape for a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reply {
    /// The 11-byte sensor payload; refreshes the cached snapshot
    Sensors,
    /// `n` raw bytes
    Bytes(usize),
    /// `n` big-endian 16-bit words
    Words(usize),
    /// `n` big-endian signed 32-bit words
    Longs(usize),
    /// Newline-terminated text
    Line,
    /// 2-byte big-endian length followed by that many bytes
    LengthPrefixed,
    /// Nothing follows (raw commands only)
    Nothing,
}

impl Reply {
    /// Fixed byte length of the reply, if it has one
    pub fn byte_len(self) -> Option<usize> {
        match self {
            Reply::Sensors => Some(SENSOR_PAYLOAD_LEN),
            Reply::Bytes(n) => Some(n),
            Reply::Words(n) => Some(n * 2),
            Reply::Longs(n) => Some(n * 4),
            Reply::Nothing => Some(0),
            Reply::Line | Reply::LengthPrefixed => None,
        }
    }
}

/// One request/response exchange
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transaction {
    pub opcode: Opcode,
    pub payload: Vec<u8>,
    pub reply: Reply,
}

impl Transaction {
    /// Generic command: the robot answers with the sensor payload.
    /// Raw dongle commands answer nothing.
    pub fn command(opcode: Opcode) -> Self {
        let reply = if opcode.is_dongle() {
            Reply::Nothing
        } else {
            Reply::Sensors
        };
        Self {
            opcode,
            payload: Vec::new(),
            reply,
        }
    }

    pub fn query(opcode: Opcode, reply: Reply) -> Self {
        Self {
            opcode,
            payload: Vec::new(),
            reply,
        }
    }

    /// Attach payload bytes.
    ///
    /// # Panics
    /// Panics if a framed payload exceeds 8 bytes; that is a caller bug, not a wire condition.
    pub fn with_payload(mut self, payload: &[u8]) -> Self {
        if self.framing() == Framing::Framed {
            assert!(
                payload.len() <= MAX_PAYLOAD,
                "framed payload of {} bytes exceeds {MAX_PAYLOAD}",
                payload.len()
            );
        }
        self.payload = payload.to_vec();
        self
    }

    pub fn framing(&self) -> Framing {
        if self.opcode.is_dongle() {
            Framing::Raw
        } else {
            Framing::Framed
        }
    }

    /// Bytes written for this transaction
    pub fn wire_bytes(&self) -> Vec<u8> {
        match self.framing() {
            Framing::Framed => encode_frame(self.opcode.into(), &self.payload).to_vec(),
            Framing::Raw => {
                let mut bytes = Vec::with_capacity(1 + self.payload.len());
                bytes.push(self.opcode.into());
                bytes.extend_from_slice(&self.payload);
                bytes
            }
        }
    }
}

/// Build a 9-byte frame: opcode followed by payload, zero-padded
///
/// # Panics
/// Panics if the payload is longer than 8 bytes.
pub fn encode_frame(opcode: u8, payload: &[u8]) -> [u8; PACKET_LENGTH] {
    assert!(
        payload.len() <= MAX_PAYLOAD,
        "payload exceeds frame capacity"
    );
    let mut frame = [0u8; PACKET_LENGTH];
    frame[0] = opcode;
    frame[1..=payload.len()].copy_from_slice(payload);
    frame
}

/// Decoded reply
#[derive(Debug, Clone, PartialEq)]
pub enum Decoded {
    Bytes(Vec<u8>),
    Words(Vec<u16>),
    Longs(Vec<i32>),
    Text(String),
    Nothing,
}

/// Split raw bytes into big-endian 16-bit words
pub fn decode_words(raw: &[u8]) -> Vec<u16> {
    raw.chunks_exact(2)
        .map(|pair| u16::from_be_bytes([pair[0], pair[1]]))
        .collect()
}

/// Split raw bytes into big-endian signed 32-bit words
pub fn decode_longs(raw: &[u8]) -> Vec<i32> {
    raw.chunks_exact(4)
        .map(|quad| i32::from_be_bytes([quad[0], quad[1], quad[2], quad[3]]))
        .collect()
}

/// Remove up to two leading prompt-echo characters and the line terminator
pub fn strip_prompt_echo(line: &str) -> &str {
    let mut text = line.trim_end_matches(['\r', '\n']);
    for _ in 0..2 {
        match text.strip_prefix(['P', 'p']) {
            Some(rest) => text = rest,
            None => break,
        }
    }
    text
}

/// Encode a signed 32-bit value as four big-endian payload bytes
pub fn long_bytes(value: i32) -> [u8; 4] {
    value.to_be_bytes()
}

/// Encode a 16-bit value as two big-endian payload bytes
pub fn word_bytes(value: u16) -> [u8; 2] {
    value.to_be_bytes()
}
