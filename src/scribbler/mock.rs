// In-memory serial port and simulated robot for tests

use std::collections::{HashMap, VecDeque};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use super::error::{Result, ScribblerError};
use super::link::{Port, PortOpener};
use super::protocol::Opcode;

const GET_PASS1: u8 = Opcode::GetPass1 as u8;
const GET_PASS2: u8 = Opcode::GetPass2 as u8;
const SET_PASS1: u8 = Opcode::SetPass1 as u8;
const SET_PASS2: u8 = Opcode::SetPass2 as u8;
const GET_NAME1: u8 = Opcode::GetName1 as u8;
const GET_NAME2: u8 = Opcode::GetName2 as u8;
const SET_NAME1: u8 = Opcode::SetName1 as u8;
const SET_NAME2: u8 = Opcode::SetName2 as u8;
const GET_ALL: u8 = Opcode::GetAll as u8;
const GET_LIGHT_ALL: u8 = Opcode::GetLightAll as u8;
const GET_IR_ALL: u8 = Opcode::GetIrAll as u8;
const GET_LINE_ALL: u8 = Opcode::GetLineAll as u8;
const GET_INFO: u8 = Opcode::GetInfo as u8;
const GET_DATA: u8 = Opcode::GetData as u8;
const SET_SINGLE_DATA: u8 = Opcode::SetSingleData as u8;
const GET_L_IR: u8 = Opcode::GetDongleLeftIr as u8;
const GET_C_IR: u8 = Opcode::GetDongleCenterIr as u8;
const GET_R_IR: u8 = Opcode::GetDongleRightIr as u8;
const GET_WINDOW_LIGHT: u8 = Opcode::GetWindowLight as u8;
const GET_BATTERY: u8 = Opcode::GetBattery as u8;
const GET_SERIAL_MEM: u8 = Opcode::GetSerialMem as u8;
const SET_SERIAL_MEM: u8 = Opcode::SetSerialMem as u8;
const SET_SERIAL_ERASE: u8 = Opcode::SetSerialErase as u8;
const GET_BLOB: u8 = Opcode::GetBlob as u8;
const GET_IR_MESSAGE: u8 = Opcode::GetIrMessage as u8;
const GET_POSITION: u8 = Opcode::GetPosition as u8;
const GET_ANGLE: u8 = Opcode::GetAngle as u8;
const GET_MIC_ENVELOPE: u8 = Opcode::GetMicEnvelope as u8;
const GET_MOTOR_STATS: u8 = Opcode::GetMotorStats as u8;
const GET_ENCODERS: u8 = Opcode::GetEncoders as u8;
const GET_DISTANCE: u8 = Opcode::GetDistance as u8;

/// Simulated robot firmware: echoes frames and answers per opcode
#[derive(Debug, Clone)]
pub(crate) struct FakeScribbler {
    pub info: String,
    pub sensors: [u8; 11],
    pub data: [u8; 8],
    pub name: [u8; 16],
    pub password: [u8; 16],
    /// Dongle flash, by (page, offset); unwritten bytes read as 0xFF
    pub memory: HashMap<(u16, u16), u8>,
    pub light: [u8; 6],
    pub ir: [u8; 2],
    pub line: [u8; 2],
    pub obstacle: [[u8; 2]; 3],
    pub bright: [u8; 3],
    pub blob: [u8; 4],
    pub battery: [u8; 2],
    pub motor_stats: [u8; 5],
    pub encoders: [u8; 8],
    pub position: [u8; 8],
    pub angle: [u8; 4],
    pub distance: u8,
    pub ir_message: Vec<u8>,
    /// Motor-stats polls that still report the robot busy with a path move
    pub busy_polls: usize,
    /// Answer the first identify with junk, like a robot still echoing its prompt
    pub garble_first_info: bool,
    info_requests: usize,
}

impl Default for FakeScribbler {
    fn default() -> Self {
        let mut name = [0u8; 16];
        name[..7].copy_from_slice(b"Scribby");
        Self {
            info: "Robot:Scribbler2,Robot-Version:1.1.2,Mode:Serial,Fluke:2.8.1".into(),
            sensors: [0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10],
            data: [127, 127, 127, 127, 0, 0, 0, 0],
            name,
            password: [b' '; 16],
            memory: HashMap::from([((0, 0), 0xDF)]),
            light: [0, 10, 0, 20, 0, 30],
            ir: [1, 0],
            line: [0, 1],
            obstacle: [[0, 100], [1, 0], [0, 7]],
            bright: [0x01, 0x02, 0x03],
            blob: [0x01, 0x00, 40, 50],
            battery: [0, 168],
            motor_stats: [0b1010_0101, 12, 0xFE, 0x03, 1],
            encoders: [0, 0, 0, 10, 0xFF, 0xFF, 0xFF, 0xF6],
            position: [0, 0, 1, 0, 0xFF, 0xFF, 0xFF, 0x9C],
            angle: [0, 0, 0, 90],
            distance: 42,
            ir_message: b"hi".to_vec(),
            busy_polls: 0,
            garble_first_info: false,
            info_requests: 0,
        }
    }
}

impl FakeScribbler {
    /// A robot whose identify reply is `info`
    pub fn with_info(info: &str) -> Self {
        Self {
            info: info.into(),
            ..Self::default()
        }
    }

    /// A robot whose first identify reply is junk
    pub fn garbling_first_info(mut self) -> Self {
        self.garble_first_info = true;
        self
    }

    /// Bytes the robot sends back for one write from the host
    pub fn respond(&mut self, bytes: &[u8]) -> Vec<u8> {
        let Some(&op) = bytes.first() else {
            return Vec::new();
        };
        let arg = |i: usize| bytes.get(i).copied().unwrap_or(0);
        let word = |i: usize| u16::from_be_bytes([arg(i), arg(i + 1)]);

        // Dongle commands: no echo
        let raw: Option<Vec<u8>> = match op {
            GET_L_IR => Some(self.obstacle[0].to_vec()),
            GET_C_IR => Some(self.obstacle[1].to_vec()),
            GET_R_IR => Some(self.obstacle[2].to_vec()),
            GET_WINDOW_LIGHT => Some(self.bright.to_vec()),
            GET_BATTERY => Some(self.battery.to_vec()),
            GET_SERIAL_MEM => Some(vec![
                self.memory.get(&(word(1), word(3))).copied().unwrap_or(0xFF),
            ]),
            SET_SERIAL_MEM => {
                self.memory.insert((word(1), word(3)), arg(5));
                Some(Vec::new())
            }
            SET_SERIAL_ERASE => {
                let page = word(1);
                self.memory.retain(|&(p, _), _| p != page);
                Some(Vec::new())
            }
            GET_BLOB => Some(self.blob.to_vec()),
            GET_IR_MESSAGE => {
                let len = u16::try_from(self.ir_message.len()).unwrap_or(u16::MAX);
                let mut reply = len.to_be_bytes().to_vec();
                reply.extend_from_slice(&self.ir_message);
                Some(reply)
            }
            op if op_is_dongle(op) => Some(Vec::new()),
            _ => None,
        };
        if let Some(reply) = raw {
            return reply;
        }

        let mut reply = bytes.to_vec();
        match op {
            GET_ALL => reply.extend_from_slice(&self.sensors),
            GET_LIGHT_ALL => reply.extend_from_slice(&self.light),
            GET_IR_ALL => reply.extend_from_slice(&self.ir),
            GET_LINE_ALL => reply.extend_from_slice(&self.line),
            GET_NAME1 => reply.extend_from_slice(&self.name[..8]),
            GET_NAME2 => reply.extend_from_slice(&self.name[8..]),
            GET_PASS1 => reply.extend_from_slice(&self.password[..8]),
            GET_PASS2 => reply.extend_from_slice(&self.password[8..]),
            GET_DATA => reply.extend_from_slice(&self.data),
            GET_MOTOR_STATS => {
                let mut stats = self.motor_stats;
                if self.busy_polls > 0 {
                    self.busy_polls -= 1;
                    stats[4] = 0;
                }
                reply.extend_from_slice(&stats);
            }
            GET_ENCODERS => reply.extend_from_slice(&self.encoders),
            GET_POSITION => reply.extend_from_slice(&self.position),
            GET_ANGLE | GET_MIC_ENVELOPE => reply.extend_from_slice(&self.angle),
            GET_DISTANCE => reply.push(self.distance),
            GET_INFO => {
                self.info_requests += 1;
                if self.garble_first_info && self.info_requests == 1 {
                    reply.extend_from_slice(b"\x7f\x00junk\n");
                } else {
                    reply.extend_from_slice(b"PP");
                    reply.extend_from_slice(self.info.as_bytes());
                    reply.push(b'\n');
                }
            }
            SET_SINGLE_DATA => {
                if let Some(slot) = self.data.get_mut(usize::from(arg(1))) {
                    *slot = arg(2);
                }
                reply.extend_from_slice(&self.sensors);
            }
            SET_NAME1 => {
                self.name[..8].copy_from_slice(&bytes[1..9]);
                reply.extend_from_slice(&self.sensors);
            }
            SET_NAME2 => {
                self.name[8..].copy_from_slice(&bytes[1..9]);
                reply.extend_from_slice(&self.sensors);
            }
            SET_PASS1 => {
                self.password[..8].copy_from_slice(&bytes[1..9]);
                reply.extend_from_slice(&self.sensors);
            }
            SET_PASS2 => {
                self.password[8..].copy_from_slice(&bytes[1..9]);
                reply.extend_from_slice(&self.sensors);
            }
            _ => reply.extend_from_slice(&self.sensors),
        }
        reply
    }
}

fn op_is_dongle(op: u8) -> bool {
    [
        Opcode::SetDongleLedOn,
        Opcode::SetDongleLedOff,
        Opcode::SetDongleIr,
        Opcode::SetDimmerLed,
        Opcode::SetForwardness,
        Opcode::SetWhiteBalance,
        Opcode::SetNoWhiteBalance,
        Opcode::SendIrMessage,
        Opcode::SetIrEmitters,
        Opcode::SetResetScribbler,
    ]
    .iter()
    .any(|&o| o as u8 == op)
}

#[derive(Debug, Default)]
pub(crate) struct MockState {
    pub rx: VecDeque<u8>,
    pub writes: Vec<Vec<u8>>,
    pub timeout: Duration,
    pub dtr: Option<bool>,
    pub device: Option<FakeScribbler>,
    /// Writes that arrived while a previous reply was still unread
    pub overlaps: usize,
    /// Bytes that only become readable after the port has been open this long
    pub delayed_chatter: Option<(Duration, Vec<u8>)>,
    /// Quiet commands the robot needs before it stops broadcasting after an input flush
    pub wake_bursts: usize,
    pub input_clears: usize,
    /// Hand out at most this many bytes per read call (0 = unlimited)
    pub read_chunk: usize,
}

/// Cloneable handle to one simulated port; clones share state
#[derive(Debug, Clone)]
pub(crate) struct MockPort {
    state: Arc<Mutex<MockState>>,
    opened_at: Instant,
}

impl MockPort {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockState::default())),
            opened_at: Instant::now(),
        }
    }

    pub fn with_device(device: FakeScribbler) -> Self {
        let port = Self::new();
        port.state().device = Some(device);
        port
    }

    pub fn state(&self) -> MutexGuard<'_, MockState> {
        self.state.lock().unwrap()
    }

    /// Every write call the host made, in order
    pub fn writes(&self) -> Vec<Vec<u8>> {
        self.state().writes.clone()
    }

    /// Write calls whose first byte is `opcode`
    pub fn writes_of(&self, opcode: Opcode) -> Vec<Vec<u8>> {
        self.writes()
            .into_iter()
            .filter(|w| w.first() == Some(&(opcode as u8)))
            .collect()
    }

    fn reopened(&self) -> Self {
        Self {
            state: Arc::clone(&self.state),
            opened_at: Instant::now(),
        }
    }

    fn promote_chatter(&self, state: &mut MockState) {
        if let Some((delay, _)) = &state.delayed_chatter {
            if self.opened_at.elapsed() >= *delay {
                if let Some((_, bytes)) = state.delayed_chatter.take() {
                    state.rx.extend(bytes);
                }
            }
        }
    }
}

impl Read for MockPort {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = {
            let mut state = self.state.lock().unwrap();
            self.promote_chatter(&mut state);
            if state.rx.is_empty() {
                return Err(io::Error::new(io::ErrorKind::TimedOut, "mock timeout"));
            }
            let mut n = buf.len().min(state.rx.len());
            if state.read_chunk > 0 {
                n = n.min(state.read_chunk);
            }
            for slot in buf.iter_mut().take(n) {
                *slot = state.rx.pop_front().unwrap_or(0);
            }
            n
        };
        // widen the window for any interleaving to show up
        thread::yield_now();
        Ok(n)
    }
}

impl Write for MockPort {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut state = self.state.lock().unwrap();
        if !state.rx.is_empty() && state.device.is_some() {
            state.overlaps += 1;
        }
        state.writes.push(buf.to_vec());
        if buf.first() == Some(&(Opcode::SetEchoMode as u8)) && state.wake_bursts > 0 {
            state.wake_bursts -= 1;
        }
        let reply = state.device.as_mut().map(|d| d.respond(buf));
        if let Some(reply) = reply {
            state.rx.extend(reply);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for MockPort {
    fn timeout(&self) -> Duration {
        self.state().timeout
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        self.state().timeout = timeout;
        Ok(())
    }

    fn bytes_to_read(&self) -> Result<u32> {
        let mut state = self.state.lock().unwrap();
        self.promote_chatter(&mut state);
        Ok(u32::try_from(state.rx.len()).unwrap_or(u32::MAX))
    }

    fn clear_input(&self) -> Result<()> {
        let mut state = self.state();
        state.rx.clear();
        state.input_clears += 1;
        if state.wake_bursts > 0 {
            state.rx.extend(b"IPREScribby");
        }
        Ok(())
    }

    fn clear_output(&self) -> Result<()> {
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        self.state().dtr = Some(level);
        Ok(())
    }
}

/// Opener over a fixed set of simulated ports
#[derive(Debug, Default)]
pub(crate) struct MockOpener {
    ports: Mutex<HashMap<String, MockPort>>,
    attempts: Mutex<Vec<String>>,
    /// Fail this many opens with a transient error before succeeding
    pub failures: AtomicUsize,
}

impl MockOpener {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_port(self, path: &str, port: MockPort) -> Self {
        self.ports.lock().unwrap().insert(path.to_string(), port);
        self
    }

    /// Paths in the order they were opened (including failed attempts)
    pub fn attempts(&self) -> Vec<String> {
        self.attempts.lock().unwrap().clone()
    }
}

impl PortOpener for MockOpener {
    fn open(&self, path: &str, _baud_rate: u32, timeout: Duration) -> Result<Box<dyn Port>> {
        self.attempts.lock().unwrap().push(path.to_string());
        let pending = self.failures.load(Ordering::SeqCst);
        if pending > 0 {
            self.failures.store(pending - 1, Ordering::SeqCst);
            return Err(ScribblerError::Serial(serialport::Error::new(
                serialport::ErrorKind::Io(io::ErrorKind::PermissionDenied),
                "port busy",
            )));
        }
        let ports = self.ports.lock().unwrap();
        let port = ports.get(path).ok_or_else(|| {
            ScribblerError::Serial(serialport::Error::new(
                serialport::ErrorKind::NoDevice,
                format!("no such port {path}"),
            ))
        })?;
        let mut port = port.reopened();
        port.set_timeout(timeout)?;
        Ok(Box::new(port))
    }
}
