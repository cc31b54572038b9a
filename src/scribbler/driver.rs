// High-level handle for one connected Scribbler
//
// Ties the link, the negotiated profile, and the calibration together. Every
// operation funnels through the transaction engine; nothing here talks to the
// port directly.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use super::cancel::CancelToken;
use super::capability::{self, CapabilityProfile, IR_MESSAGING_FIRMWARE};
use super::dispatch::{self, EmitterSide, Forwardness, Position, Query, Setting};
use super::engine::{Engine, RawSensors};
use super::error::{Result, ScribblerError};
use super::kinematics::{
    AngleUnit, Calibration, PathCommand, Reference, WheelPower, normalize_fudge, to_wheel_power,
};
use super::link::{Connector, Link};
use super::protocol::{Opcode, Reply, Transaction, long_bytes, word_bytes};
use super::sensors::{self, Blob, Encoders, ExtendedSensors, MotorStats, SensorSnapshot};
use crate::config::LinkConfig;
use crate::readings::{Reading, RobotSummary};

/// (frequency Hz, duration) of the greeting played after waking
pub const STARTUP_CHIRP: [(u16, Duration); 5] = [
    (784, Duration::from_millis(30)),
    (880, Duration::from_millis(30)),
    (698, Duration::from_millis(30)),
    (349, Duration::from_millis(30)),
    (523, Duration::from_millis(30)),
];

// Extra read time granted to a tone beyond its own duration
const TONE_MARGIN: Duration = Duration::from_secs(2);

// All three IR emitters on
const DEFAULT_EMITTERS: u8 = 0x07;

/// A connected robot
pub struct Scribbler {
    engine: Engine,
    profile: CapabilityProfile,
    config: LinkConfig,
    calibration: Mutex<Calibration>,
    emitters: Mutex<u8>,
    loud: AtomicBool,
}

impl Scribbler {
    /// Connect to the robot named by `config` (or the `SCRIBBLER_PORT` override)
    pub fn connect(config: LinkConfig) -> Result<Self> {
        let mut connector = Connector::system(config.with_env_override(), CancelToken::new());
        Self::connect_with(&mut connector)
    }

    /// Connect through an existing connector, reusing its discovery results
    pub fn connect_with(connector: &mut Connector) -> Result<Self> {
        let link = connector.connect()?;
        Self::from_link(link, connector.config().clone(), connector.cancel_token())
    }

    /// Negotiate capabilities over an open link and, if a chassis answered, wake it up
    pub fn from_link(link: Link, config: LinkConfig, cancel: CancelToken) -> Result<Self> {
        let engine = Engine::new(link, cancel);
        engine.set_pacing(config.pacing);

        let profile = capability::negotiate(&engine, &config)?;
        if profile.has_dongle() {
            engine.set_pacing(Duration::ZERO);
        }

        let robot = Self {
            engine,
            profile,
            config,
            calibration: Mutex::new(Calibration::default()),
            emitters: Mutex::new(DEFAULT_EMITTERS),
            loud: AtomicBool::new(false),
        };
        if robot.profile.has_chassis() {
            robot.startup()?;
        }
        Ok(robot)
    }

    /// Silence broadcast chatter, reset outputs, greet, and load calibration
    fn startup(&self) -> Result<()> {
        let rounds = capability::wake(&self.engine, &self.config)?;
        if rounds > 0 {
            debug!("Robot needed {} extra wake rounds", rounds);
        }
        self.stop()?;
        self.set(&Setting::Led {
            led: dispatch::Led::All,
            level: 0.0,
        })?;
        if self.config.startup_chirp {
            for (frequency, duration) in STARTUP_CHIRP {
                self.beep(duration, frequency, None)?;
            }
        }
        let name = self.name()?;
        info!("Hello, I'm {}!", name);
        self.load_fudge()?;
        Ok(())
    }

    pub fn profile(&self) -> &CapabilityProfile {
        &self.profile
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn port(&self) -> Result<String> {
        self.engine.with_link(|link| Ok(link.path().to_string()))
    }

    fn calibration(&self) -> MutexGuard<'_, Calibration> {
        self.calibration.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn emitter_mask(&self) -> MutexGuard<'_, u8> {
        self.emitters.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // ---- motion ----

    /// Drive with logical translate/rotate in [-1, 1]
    pub fn drive(&self, translate: f32, rotate: f32) -> Result<WheelPower> {
        let wheels = to_wheel_power(translate, rotate);
        debug!(
            "Setting wheel power: left={}, right={}",
            wheels.left, wheels.right
        );
        self.engine
            .command(&Transaction::command(Opcode::SetMotors).with_payload(&wheels.as_payload()))?;
        Ok(wheels)
    }

    pub fn stop(&self) -> Result<()> {
        self.engine.command(&Transaction::command(Opcode::SetMotorsOff))
    }

    /// Motors off without honouring a pending stop request
    pub fn hard_stop(&self) -> Result<()> {
        self.engine.hard_stop()
    }

    /// Wait inside the session; a stop request during the wait halts the motors
    pub fn pause(&self, duration: Duration) -> Result<()> {
        self.engine.pause(duration)
    }

    /// Play one or two tones. The read timeout covers the tone plus a margin.
    pub fn beep(&self, duration: Duration, frequency: u16, frequency2: Option<u16>) -> Result<()> {
        let millis = u16::try_from(duration.as_millis()).unwrap_or(u16::MAX);
        let mut payload = word_bytes(millis).to_vec();
        payload.extend_from_slice(&word_bytes(frequency));
        let opcode = match frequency2 {
            Some(second) => {
                payload.extend_from_slice(&word_bytes(second));
                Opcode::SetSpeaker2
            }
            None => Opcode::SetSpeaker,
        };
        self.engine.execute_with_timeout(
            &Transaction::command(opcode).with_payload(&payload),
            duration + TONE_MARGIN,
        )?;
        Ok(())
    }

    // ---- calibration ----

    pub fn fudge(&self) -> [f32; 4] {
        self.calibration().factors()
    }

    /// Reload fudge factors from device memory
    pub fn load_fudge(&self) -> Result<[f32; 4]> {
        let data = self.data()?;
        let loaded = Calibration::load(&data, self.profile.has_dongle());
        *self.calibration() = loaded;
        Ok(loaded.factors())
    }

    /// Persist fudge factors, writing only those that changed. Returns the number of writes.
    /// Factors are clamped to [0, 2]; NaN is rejected.
    pub fn set_fudge(&self, factors: [f32; 4]) -> Result<usize> {
        let factors = normalize_fudge(factors)?;
        let mut calibration = self.calibration();
        let writes = calibration.changes(factors, self.profile.has_dongle());
        for write in &writes {
            self.engine.command(
                &Transaction::command(Opcode::SetSingleData).with_payload(&[write.slot, write.byte]),
            )?;
            calibration.commit(write.index, factors[write.index]);
        }
        if !writes.is_empty() {
            info!("Saved {} fudge factor(s)", writes.len());
        }
        Ok(writes.len())
    }

    // ---- sensors ----

    /// Fresh all-sensor snapshot; extended with dongle readings when one is attached
    pub fn sensors(&self) -> Result<SensorSnapshot> {
        let raw = self.engine.bytes(&Transaction::query(Opcode::GetAll, Reply::Sensors))?;
        let mut snapshot = sensors::decode_all(&raw)?;
        if self.profile.has_dongle() {
            snapshot.extended = Some(ExtendedSensors {
                obstacle: self.obstacles()?,
                bright: self.brightness()?,
                blob: self.blob()?,
                battery: self.battery()?,
            });
        }
        Ok(snapshot)
    }

    /// Snapshot piggybacked on the most recent reply, without touching the wire
    pub fn last_sensors(&self) -> Option<SensorSnapshot> {
        self.engine
            .last_sensors()
            .and_then(|raw: RawSensors| sensors::decode_all(&raw).ok())
    }

    pub fn light(&self) -> Result<[u16; 3]> {
        let words = self
            .engine
            .words(&Transaction::query(Opcode::GetLightAll, Reply::Words(3)))?;
        <[u16; 3]>::try_from(words.as_slice())
            .map_err(|_| ScribblerError::invalid(Opcode::GetLightAll.into(), "short light reply"))
    }

    pub fn ir(&self) -> Result<[u8; 2]> {
        self.pair(Opcode::GetIrAll)
    }

    pub fn line(&self) -> Result<[u8; 2]> {
        self.pair(Opcode::GetLineAll)
    }

    fn pair(&self, opcode: Opcode) -> Result<[u8; 2]> {
        let bytes = self.engine.bytes(&Transaction::query(opcode, Reply::Bytes(2)))?;
        <[u8; 2]>::try_from(bytes.as_slice())
            .map_err(|_| ScribblerError::invalid(opcode.into(), "short reply"))
    }

    pub fn stall(&self) -> Result<u8> {
        Ok(self.sensors_basic()?.stall)
    }

    fn sensors_basic(&self) -> Result<SensorSnapshot> {
        let raw = self.engine.bytes(&Transaction::query(Opcode::GetAll, Reply::Sensors))?;
        sensors::decode_all(&raw)
    }

    pub fn obstacle(&self, position: Position) -> Result<u16> {
        self.profile.require_dongle("obstacle sensors")?;
        let opcode = match position {
            Position::Left => Opcode::GetDongleLeftIr,
            Position::Center => Opcode::GetDongleCenterIr,
            Position::Right => Opcode::GetDongleRightIr,
        };
        sensors::decode_obstacle(&self.engine.bytes(&Transaction::query(opcode, Reply::Bytes(2)))?)
    }

    pub fn obstacles(&self) -> Result<[u16; 3]> {
        Ok([
            self.obstacle(Position::Left)?,
            self.obstacle(Position::Center)?,
            self.obstacle(Position::Right)?,
        ])
    }

    /// Brightness sum over one camera window
    pub fn bright(&self, window: Position) -> Result<u32> {
        self.profile.require_dongle("brightness")?;
        let tx = Transaction::query(Opcode::GetWindowLight, Reply::Bytes(3))
            .with_payload(&[window.index() as u8]);
        sensors::decode_bright(&self.engine.bytes(&tx)?)
    }

    pub fn brightness(&self) -> Result<[u32; 3]> {
        Ok([
            self.bright(Position::Left)?,
            self.bright(Position::Center)?,
            self.bright(Position::Right)?,
        ])
    }

    pub fn blob(&self) -> Result<Blob> {
        self.profile.require_dongle("blob tracking")?;
        sensors::decode_blob(&self.engine.bytes(&Transaction::query(Opcode::GetBlob, Reply::Bytes(4)))?)
    }

    /// Battery voltage
    pub fn battery(&self) -> Result<f64> {
        self.profile.require_dongle("battery")?;
        sensors::decode_battery(
            &self.engine.bytes(&Transaction::query(Opcode::GetBattery, Reply::Bytes(2)))?,
        )
    }

    // ---- device memory and identity ----

    /// Single byte of device memory at (page, offset)
    pub fn read_memory(&self, page: u16, offset: u16) -> Result<u8> {
        self.profile.require_dongle("memory access")?;
        let mut payload = word_bytes(page).to_vec();
        payload.extend_from_slice(&word_bytes(offset));
        let tx = Transaction::query(Opcode::GetSerialMem, Reply::Bytes(1)).with_payload(&payload);
        self.engine
            .bytes(&tx)?
            .first()
            .copied()
            .ok_or_else(|| ScribblerError::invalid(Opcode::GetSerialMem.into(), "empty reply"))
    }

    /// Write one byte of device memory at (page, offset)
    pub fn write_memory(&self, page: u16, offset: u16, byte: u8) -> Result<()> {
        self.profile.require_dongle("memory access")?;
        let mut payload = word_bytes(page).to_vec();
        payload.extend_from_slice(&word_bytes(offset));
        payload.push(byte);
        self.engine
            .command(&Transaction::command(Opcode::SetSerialMem).with_payload(&payload))
    }

    /// Erase one page of device memory
    pub fn erase_memory(&self, page: u16) -> Result<()> {
        self.profile.require_dongle("memory access")?;
        self.engine
            .command(&Transaction::command(Opcode::SetSerialErase).with_payload(&word_bytes(page)))
    }

    /// Hard-reset the robot. The link stays open; the robot comes back broadcasting.
    pub fn reboot(&self) -> Result<()> {
        self.profile.require_dongle("reboot")?;
        info!("Rebooting robot");
        self.engine
            .command(&Transaction::command(Opcode::SetResetScribbler))
    }

    pub fn forwardness(&self) -> Result<Forwardness> {
        self.read_memory(0, 0).map(Forwardness::from_memory)
    }

    pub fn name(&self) -> Result<String> {
        self.label(Opcode::GetName1, Opcode::GetName2)
    }

    pub fn password(&self) -> Result<String> {
        self.label(Opcode::GetPass1, Opcode::GetPass2)
    }

    fn label(&self, first: Opcode, second: Opcode) -> Result<String> {
        let mut raw = self
            .engine
            .bytes(&Transaction::query(first, Reply::Bytes(dispatch::LABEL_HALF)))?;
        raw.extend(
            self.engine
                .bytes(&Transaction::query(second, Reply::Bytes(dispatch::LABEL_HALF)))?,
        );
        Ok(sensors::decode_label(&raw))
    }

    /// The eight user-data bytes
    pub fn data(&self) -> Result<Vec<u8>> {
        self.engine
            .bytes(&Transaction::query(Opcode::GetData, Reply::Bytes(8)))
    }

    /// Fresh handshake map (re-runs the identify exchange)
    pub fn info(&self) -> Result<std::collections::BTreeMap<String, String>> {
        capability::identify(&self.engine, &self.config).map(|text| capability::parse_handshake(&text))
    }

    /// Loud (true) or quiet, as last set through this handle
    pub fn volume(&self) -> bool {
        self.loud.load(Ordering::SeqCst)
    }

    pub fn summary(&self) -> Result<RobotSummary> {
        let name = if self.profile.has_chassis() {
            Some(self.name()?)
        } else {
            None
        };
        Ok(RobotSummary {
            port: self.port()?,
            name,
            profile: self.profile.clone(),
            fudge: self.fudge(),
        })
    }

    // ---- Scribbler 2 telemetry ----

    /// Obstacle distance on one side (left = 0, right = 1)
    pub fn distance(&self, side: Position) -> Result<u8> {
        self.profile.require_scribbler2("distance sensors")?;
        let selector = u8::from(side == Position::Right);
        let tx = Transaction::query(Opcode::GetDistance, Reply::Bytes(1)).with_payload(&[selector]);
        self.engine
            .bytes(&tx)?
            .first()
            .copied()
            .ok_or_else(|| ScribblerError::invalid(Opcode::GetDistance.into(), "empty reply"))
    }

    pub fn motor_stats(&self) -> Result<MotorStats> {
        self.profile.require_scribbler2("motor stats")?;
        sensors::decode_motor_stats(
            &self
                .engine
                .bytes(&Transaction::query(Opcode::GetMotorStats, Reply::Bytes(5)))?,
        )
    }

    /// Wheel encoder counts, optionally zeroing them after the read
    pub fn encoders(&self, zero: bool) -> Result<Encoders> {
        self.profile.require_scribbler2("encoders")?;
        let selector = if zero { 0x00 } else { 0x01 };
        let tx = Transaction::query(Opcode::GetEncoders, Reply::Bytes(8)).with_payload(&[selector]);
        sensors::decode_encoders(&self.engine.bytes(&tx)?)
    }

    /// Dead-reckoned (x, y)
    pub fn position(&self) -> Result<(i32, i32)> {
        self.profile.require_scribbler2("position")?;
        match self
            .engine
            .longs(&Transaction::query(Opcode::GetPosition, Reply::Longs(2)))?
            .as_slice()
        {
            [x, y] => Ok((*x, *y)),
            _ => Err(ScribblerError::invalid(Opcode::GetPosition.into(), "short position reply")),
        }
    }

    pub fn set_position(&self, x: i32, y: i32) -> Result<()> {
        self.profile.require_scribbler2("position")?;
        let mut payload = long_bytes(x).to_vec();
        payload.extend_from_slice(&long_bytes(y));
        self.engine
            .command(&Transaction::command(Opcode::SetPosition).with_payload(&payload))
    }

    pub fn angle(&self) -> Result<i32> {
        self.profile.require_scribbler2("angle")?;
        self.single_long(Opcode::GetAngle)
    }

    pub fn set_angle(&self, angle: i32) -> Result<()> {
        self.profile.require_scribbler2("angle")?;
        self.engine
            .command(&Transaction::command(Opcode::SetAngle).with_payload(&long_bytes(angle)))
    }

    pub fn mic_envelope(&self) -> Result<i32> {
        self.profile.require_scribbler2("microphone")?;
        self.single_long(Opcode::GetMicEnvelope)
    }

    fn single_long(&self, opcode: Opcode) -> Result<i32> {
        self.engine
            .longs(&Transaction::query(opcode, Reply::Longs(1)))?
            .first()
            .copied()
            .ok_or_else(|| ScribblerError::invalid(opcode.into(), "empty reply"))
    }

    // ---- Scribbler 2 path motion ----

    /// Start a recorded path at `speed` (1..=15)
    pub fn begin_path(&self, speed: u8) -> Result<()> {
        self.path(PathCommand::Begin { speed })
    }

    pub fn end_path(&self) -> Result<()> {
        self.path(PathCommand::End)
    }

    /// Turn to (or by) `angle`, returning once the robot has settled
    pub fn turn(&self, reference: Reference, unit: AngleUnit, angle: i16) -> Result<()> {
        self.path(PathCommand::Turn {
            reference,
            unit,
            angle,
        })
    }

    /// Move to (or by) (x, y), returning once the robot has settled
    pub fn travel(&self, reference: Reference, x: i16, y: i16) -> Result<()> {
        self.path(PathCommand::Move { reference, x, y })
    }

    /// Arc to (or by) (x, y) with `radius`, returning once the robot has settled
    pub fn arc(&self, reference: Reference, x: i16, y: i16, radius: i16) -> Result<()> {
        self.path(PathCommand::Arc {
            reference,
            x,
            y,
            radius,
        })
    }

    fn path(&self, command: PathCommand) -> Result<()> {
        self.profile.require_scribbler2("path motion")?;
        debug!("Path command {:?}", command);
        self.engine
            .command(&Transaction::command(command.opcode()).with_payload(&command.payload()))?;
        if command.moves() {
            self.wait_until_ready()?;
        }
        Ok(())
    }

    // Poll motor stats until the robot reports ready for the next command
    fn wait_until_ready(&self) -> Result<()> {
        while !self.motor_stats()?.ready {
            self.engine.pause(self.config.transit_poll)?;
        }
        Ok(())
    }

    // ---- IR messaging ----

    pub fn send_ir_message(&self, message: &[u8]) -> Result<()> {
        self.profile
            .require_dongle_version(&IR_MESSAGING_FIRMWARE, "IR messaging")?;
        let len = u8::try_from(message.len())
            .map_err(|_| ScribblerError::UnsupportedOperation("IR message longer than 255 bytes".into()))?;
        let mut payload = vec![len];
        payload.extend_from_slice(message);
        self.engine
            .command(&Transaction::command(Opcode::SendIrMessage).with_payload(&payload))
    }

    pub fn ir_message(&self) -> Result<Vec<u8>> {
        self.profile
            .require_dongle_version(&IR_MESSAGING_FIRMWARE, "IR messaging")?;
        self.engine
            .bytes(&Transaction::query(Opcode::GetIrMessage, Reply::LengthPrefixed))
    }

    // ---- symbolic get/set ----

    pub fn get(&self, query: Query) -> Result<Reading> {
        let pick = |position: Option<Position>| position.map(Position::index);
        let reading = match query {
            Query::All => Reading::Sensors(self.sensors()?),
            Query::Light(None) => Reading::Words(self.light()?.to_vec()),
            Query::Light(Some(p)) => Reading::Word(self.light()?[p.index()]),
            Query::Ir(position) => pair_reading(self.ir()?, pick(position)),
            Query::Line(position) => pair_reading(self.line()?, pick(position)),
            Query::Stall => Reading::Byte(self.stall()?),
            Query::Obstacle(None) => Reading::Words(self.obstacles()?.to_vec()),
            Query::Obstacle(Some(p)) => Reading::Word(self.obstacle(p)?),
            Query::Bright(None) => Reading::Sums(self.brightness()?.to_vec()),
            Query::Bright(Some(p)) => Reading::Sum(self.bright(p)?),
            Query::Blob => Reading::Blob(self.blob()?),
            Query::Battery => Reading::Volts(self.battery()?),
            Query::Name => Reading::Text(self.name()?),
            Query::Password => Reading::Text(self.password()?),
            Query::Data => Reading::Bytes(self.data()?),
            Query::Info => Reading::Map(self.info()?),
            Query::Config => Reading::Counts(self.profile.sensor_counts()),
            Query::Forwardness => Reading::Forwardness(self.forwardness()?),
            Query::Volume => Reading::Switch(self.volume()),
            Query::Distance => Reading::Bytes(vec![
                self.distance(Position::Left)?,
                self.distance(Position::Right)?,
            ]),
            Query::MotorStats => Reading::MotorStats(self.motor_stats()?),
            Query::Encoders => Reading::Encoders(self.encoders(false)?),
            Query::Location => {
                let (x, y) = self.position()?;
                Reading::Longs(vec![x, y])
            }
            Query::Angle => Reading::Long(self.angle()?),
            Query::MicEnvelope => Reading::Long(self.mic_envelope()?),
        };
        Ok(reading)
    }

    pub fn set(&self, setting: &Setting) -> Result<()> {
        // held until the new mask is recorded so concurrent emitter changes compose
        let mut emitters = self.emitter_mask();
        let plan = dispatch::plan(setting, &self.profile, *emitters)?;
        for step in &plan.steps {
            self.engine.command(step)?;
        }
        if plan.settle_and_flush {
            self.engine.pause(self.config.echo_settle)?;
            self.engine.with_link(|link| link.clear_buffers())?;
        }
        if let Some(mask) = plan.emitters {
            *emitters = mask;
        }
        if let Setting::Volume(loud) = setting {
            self.loud.store(*loud, Ordering::SeqCst);
        }
        Ok(())
    }

    /// Switch one side of the IR emitters
    pub fn set_emitters(&self, side: EmitterSide, on: bool) -> Result<()> {
        self.set(&Setting::Emitters { side, on })
    }

    /// Emitter bitmask as last sent
    pub fn emitters(&self) -> u8 {
        *self.emitter_mask()
    }

    // ---- lifecycle ----

    /// Ask the in-flight operation to halt at its next transaction boundary
    pub fn request_stop(&self) {
        self.engine.request_stop();
    }

    /// Token a signal handler can trip from another thread
    pub fn stop_handle(&self) -> CancelToken {
        self.engine.cancel_token()
    }

    pub fn is_open(&self) -> bool {
        self.engine.is_open()
    }

    /// Best-effort teardown: hard stop, brief wait, close. Safe to call twice.
    pub fn shutdown(&self) {
        if !self.engine.is_open() {
            return;
        }
        if let Err(e) = self.engine.hard_stop() {
            warn!("Failed to stop motors during shutdown: {}", e);
        }
        thread::sleep(self.config.teardown_delay);
        self.engine.close();
    }
}

fn pair_reading(values: [u8; 2], index: Option<usize>) -> Reading {
    match index {
        Some(i) => Reading::Byte(values[i.min(1)]),
        None => Reading::Bytes(values.to_vec()),
    }
}

impl Drop for Scribbler {
    fn drop(&mut self) {
        // Try to stop motors and release the port when the handle goes away
        self.shutdown();
    }
}
