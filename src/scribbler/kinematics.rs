// Differential-drive mapping for the Scribbler base
// Converts logical (translate, rotate) into the two wheel power bytes the firmware expects,
// and tracks the per-wheel fudge factors persisted in device memory.
// Also builds the Scribbler 2 path commands (turn, move, arc).

use super::error::{Result, ScribblerError};
use super::protocol::Opcode;

/// Wheel power byte meaning "stopped"
pub const NEUTRAL_POWER: u8 = 100;

/// Fudge byte meaning 1.0 (no correction)
pub const NEUTRAL_FUDGE_BYTE: u8 = 127;
const FUDGE_SCALE: f32 = 127.0;
const MAX_FUDGE: f32 = 2.0;

/// Raw wheel power commands, 0 (full reverse) ..= 200 (full forward)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WheelPower {
    pub left: u8,
    pub right: u8,
}

impl WheelPower {
    pub fn stopped() -> Self {
        Self {
            left: NEUTRAL_POWER,
            right: NEUTRAL_POWER,
        }
    }

    /// Payload order on the wire: [right, left]
    pub fn as_payload(&self) -> [u8; 2] {
        [self.right, self.left]
    }
}

/// Convert one wheel speed in [-1, 1] to a power byte
fn power(speed: f32) -> u8 {
    // (x + 1) * 100 is within [0, 200] after the clamp
    ((speed.clamp(-1.0, 1.0) + 1.0) * 100.0).round() as u8
}

/// Convert translate/rotate, each in [-1, 1], to wheel powers
///
/// # Arguments
/// * `translate` - Forward speed (positive = forward)
/// * `rotate` - Turn speed (positive = counter-clockwise)
pub fn to_wheel_power(translate: f32, rotate: f32) -> WheelPower {
    let left = (translate - rotate).clamp(-1.0, 1.0);
    let right = (translate + rotate).clamp(-1.0, 1.0);
    WheelPower {
        left: power(left),
        right: power(right),
    }
}

/// Inverse of `to_wheel_power` for inputs that were not clamped
pub fn from_wheel_power(wheels: WheelPower) -> (f32, f32) {
    let left = f32::from(wheels.left) / 100.0 - 1.0;
    let right = f32::from(wheels.right) / 100.0 - 1.0;
    ((left + right) / 2.0, (right - left) / 2.0)
}

/// Fudge factor -> persisted byte (truncating, like the firmware's own conversion)
pub fn fudge_to_byte(factor: f32) -> u8 {
    (factor.clamp(0.0, MAX_FUDGE) * FUDGE_SCALE) as u8
}

/// Persisted byte -> fudge factor; an erased slot (0) reads as neutral
pub fn fudge_from_byte(byte: u8) -> f32 {
    let byte = if byte == 0 { NEUTRAL_FUDGE_BYTE } else { byte };
    f32::from(byte) / FUDGE_SCALE
}

/// Validate requested factors and clamp them into [0, 2]
pub fn normalize_fudge(factors: [f32; 4]) -> Result<[f32; 4]> {
    if factors.iter().any(|f| f.is_nan()) {
        return Err(ScribblerError::InvalidArgument(format!(
            "fudge factors must be numbers, got {factors:?}"
        )));
    }
    Ok(factors.map(|f| f.clamp(0.0, MAX_FUDGE)))
}

/// One pending fudge write: factor `index` goes to data `slot` as `byte`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FudgeWrite {
    pub index: usize,
    pub slot: u8,
    pub byte: u8,
}

/// Per-wheel motor calibration held in memory and mirrored to device data slots 0..4
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Calibration {
    fudge: [f32; 4],
    written: [f32; 4],
}

impl Default for Calibration {
    fn default() -> Self {
        Self {
            fudge: [1.0; 4],
            written: [1.0; 4],
        }
    }
}

impl Calibration {
    /// Build from the first four user-data bytes.
    /// With a dongle attached the slots are stored in reverse order.
    pub fn load(data: &[u8], dongle: bool) -> Self {
        let mut fudge = [1.0; 4];
        for (slot, factor) in fudge.iter_mut().enumerate() {
            *factor = fudge_from_byte(data.get(slot).copied().unwrap_or(0));
        }
        if dongle {
            fudge.reverse();
        }
        Self {
            fudge,
            written: fudge,
        }
    }

    pub fn factors(&self) -> [f32; 4] {
        self.fudge
    }

    /// Device writes needed to persist `factors`, one per changed factor
    pub fn changes(&self, factors: [f32; 4], dongle: bool) -> Vec<FudgeWrite> {
        factors
            .iter()
            .zip(self.written.iter())
            .enumerate()
            .filter(|(_, (new, old))| new != old)
            .map(|(index, (new, _))| FudgeWrite {
                index,
                slot: (if dongle { 3 - index } else { index }) as u8,
                byte: fudge_to_byte(*new),
            })
            .collect()
    }

    /// Record one factor as persisted
    pub fn commit(&mut self, index: usize, factor: f32) {
        let factor = factor.clamp(0.0, MAX_FUDGE);
        if let (Some(fudge), Some(written)) =
            (self.fudge.get_mut(index), self.written.get_mut(index))
        {
            *fudge = factor;
            *written = factor;
        }
    }
}

// Speeds accepted by the path planner
const MIN_PATH_SPEED: u8 = 1;
const MAX_PATH_SPEED: u8 = 15;
const END_PATH_SPEED: u8 = 7;

/// Absolute target or offset from the current pose
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reference {
    To,
    By,
}

/// Units of a turn angle
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AngleUnit {
    /// The robot's own angle units
    Native,
    Degrees,
}

/// Scribbler 2 path-planner command
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PathCommand {
    /// Start recording a path; speed is clamped to 1..=15
    Begin { speed: u8 },
    End,
    Turn {
        reference: Reference,
        unit: AngleUnit,
        angle: i16,
    },
    Move {
        reference: Reference,
        x: i16,
        y: i16,
    },
    Arc {
        reference: Reference,
        x: i16,
        y: i16,
        radius: i16,
    },
}

impl PathCommand {
    pub fn opcode(&self) -> Opcode {
        match self {
            PathCommand::Begin { .. } | PathCommand::End => Opcode::SetPath,
            PathCommand::Turn { .. } => Opcode::SetTurn,
            PathCommand::Move { .. } => Opcode::SetMove,
            PathCommand::Arc { .. } => Opcode::SetArc,
        }
    }

    /// Frame payload; coordinates are big-endian 16-bit two's complement
    pub fn payload(&self) -> Vec<u8> {
        let signed = |v: i16| v.to_be_bytes();
        match *self {
            PathCommand::Begin { speed } => {
                vec![0, 0, speed.clamp(MIN_PATH_SPEED, MAX_PATH_SPEED)]
            }
            PathCommand::End => vec![1, 0, END_PATH_SPEED],
            PathCommand::Turn {
                reference,
                unit,
                angle,
            } => {
                let kind = reference_code(reference) + u8::from(unit == AngleUnit::Degrees);
                let mut payload = vec![kind];
                payload.extend_from_slice(&signed(angle));
                payload
            }
            PathCommand::Move { reference, x, y } => {
                let mut payload = vec![reference_code(reference)];
                payload.extend_from_slice(&signed(x));
                payload.extend_from_slice(&signed(y));
                payload
            }
            PathCommand::Arc {
                reference,
                x,
                y,
                radius,
            } => {
                let mut payload = vec![reference_code(reference)];
                payload.extend_from_slice(&signed(x));
                payload.extend_from_slice(&signed(y));
                payload.extend_from_slice(&signed(radius));
                payload
            }
        }
    }

    /// Whether the robot executes this immediately (and is busy until done)
    pub fn moves(&self) -> bool {
        !matches!(self, PathCommand::Begin { .. } | PathCommand::End)
    }
}

fn reference_code(reference: Reference) -> u8 {
    match reference {
        Reference::To => 2,
        Reference::By => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stop_is_neutral() {
        assert_eq!(to_wheel_power(0.0, 0.0), WheelPower::stopped());
    }

    #[test]
    fn test_payload_order_is_right_then_left() {
        let wheels = to_wheel_power(0.0, 0.5);
        assert_eq!(wheels.left, 50);
        assert_eq!(wheels.right, 150);
        assert_eq!(wheels.as_payload(), [150, 50]);
    }

    #[test]
    fn test_powers_stay_in_range_and_invert() {
        let steps: Vec<f32> = (-10..=10).map(|i| i as f32 / 10.0).collect();
        for &t in &steps {
            for &r in &steps {
                let wheels = to_wheel_power(t, r);
                assert!(wheels.left <= 200 && wheels.right <= 200);

                let unclamped = (t - r).abs() <= 1.0 && (t + r).abs() <= 1.0;
                if unclamped {
                    let (t2, r2) = from_wheel_power(wheels);
                    assert!((t2 - t).abs() <= 0.01, "translate {t} -> {t2}");
                    assert!((r2 - r).abs() <= 0.01, "rotate {r} -> {r2}");
                }
            }
        }
    }

    #[test]
    fn test_saturation() {
        assert_eq!(to_wheel_power(1.0, 1.0), WheelPower { left: 100, right: 200 });
        assert_eq!(to_wheel_power(-5.0, 0.0), WheelPower { left: 0, right: 0 });
    }

    #[test]
    fn test_fudge_bytes() {
        assert_eq!(fudge_to_byte(1.0), 127);
        assert_eq!(fudge_to_byte(0.5), 63);
        assert_eq!(fudge_to_byte(3.0), 254);
        assert_eq!(fudge_from_byte(0), 1.0);
        assert_eq!(fudge_from_byte(127), 1.0);
    }

    #[test]
    fn test_normalize_fudge() {
        assert_eq!(
            normalize_fudge([3.0, -1.0, 1.0, f32::INFINITY]).unwrap(),
            [2.0, 0.0, 1.0, 2.0]
        );
        assert!(matches!(
            normalize_fudge([f32::NAN, 1.0, 1.0, 1.0]),
            Err(ScribblerError::InvalidArgument(_))
        ));

        let mut calibration = Calibration::default();
        calibration.commit(0, 5.0);
        assert_eq!(calibration.factors()[0], 2.0);
    }

    #[test]
    fn test_path_payloads() {
        assert_eq!(PathCommand::Begin { speed: 40 }.payload(), vec![0, 0, 15]);
        assert_eq!(PathCommand::End.payload(), vec![1, 0, 7]);
        let turn = PathCommand::Turn {
            reference: Reference::By,
            unit: AngleUnit::Degrees,
            angle: -90,
        };
        assert_eq!(turn.opcode(), Opcode::SetTurn);
        assert_eq!(turn.payload(), vec![5, 0xFF, 0xA6]);
        let arc = PathCommand::Arc {
            reference: Reference::To,
            x: 300,
            y: -1,
            radius: 50,
        };
        assert_eq!(arc.payload(), vec![2, 0x01, 0x2C, 0xFF, 0xFF, 0x00, 0x32]);
        assert!(arc.moves());
        assert!(!PathCommand::End.moves());
    }

    #[test]
    fn test_load_reverses_with_dongle() {
        let data = [127, 0, 254, 63];
        let plain = Calibration::load(&data, false);
        assert_eq!(plain.factors()[2], 2.0);
        let reversed = Calibration::load(&data, true);
        assert_eq!(reversed.factors()[1], 2.0);
        assert_eq!(reversed.factors()[0], 63.0 / 127.0);
    }

    #[test]
    fn test_only_changed_factors_are_written() {
        let mut calibration = Calibration::default();
        let target = [1.0, 1.2, 1.0, 0.8];

        let writes = calibration.changes(target, false);
        let slots: Vec<(u8, u8)> = writes.iter().map(|w| (w.slot, w.byte)).collect();
        assert_eq!(slots, vec![(1, 152), (3, 101)]);
        for write in &writes {
            calibration.commit(write.index, target[write.index]);
        }
        assert!(calibration.changes(target, false).is_empty());
        assert_eq!(calibration.factors(), target);

        // dongle remaps slot i -> 3 - i
        assert_eq!(
            calibration.changes([0.5, 1.2, 1.0, 0.8], true),
            vec![FudgeWrite { index: 0, slot: 3, byte: 63 }]
        );
    }
}
