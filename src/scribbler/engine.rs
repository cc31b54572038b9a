// Transaction engine: one exclusive request/response exchange at a time
//
// write frame -> read 9-byte echo -> read reply -> refresh cached sensors.
// The whole sequence runs under a single lock; the stop flag is polled only
// after the lock is released, so a frame is never abandoned half-read.

use std::sync::{Mutex, MutexGuard, PoisonError};
use std::thread;
use std::time::Duration;

use tracing::{debug, trace, warn};

use super::cancel::CancelToken;
use super::error::{Result, ScribblerError};
use super::link::Link;
use super::protocol::{
    Decoded, Framing, Opcode, Reply, Transaction, decode_longs, decode_words, strip_prompt_echo,
};
use crate::config::{PACKET_LENGTH, SENSOR_PAYLOAD_LEN};

/// Raw sensor payload as piggybacked on command replies
pub type RawSensors = [u8; SENSOR_PAYLOAD_LEN];

struct EngineState {
    link: Link,
    last_sensors: Option<RawSensors>,
    pacing: Duration,
}

impl EngineState {
    fn transact(&mut self, tx: &Transaction) -> Result<Decoded> {
        let bytes = tx.wire_bytes();
        match tx.framing() {
            Framing::Framed => {
                if !self.pacing.is_zero() {
                    thread::sleep(self.pacing);
                }
                self.link.write_all(&bytes)?;
                let echo = self.link.read_exact(PACKET_LENGTH)?;
                if echo != bytes {
                    debug!("Echo mismatch for {:?}: {:02X?}", tx.opcode, echo);
                }
            }
            Framing::Raw => self.link.write_all(&bytes)?,
        }
        trace!("Sent {:?} ({} bytes)", tx.opcode, bytes.len());

        let decoded = match tx.reply {
            Reply::Sensors => {
                let raw = self.link.read_exact(SENSOR_PAYLOAD_LEN)?;
                let mut snapshot = [0u8; SENSOR_PAYLOAD_LEN];
                snapshot.copy_from_slice(&raw);
                self.last_sensors = Some(snapshot);
                Decoded::Bytes(raw)
            }
            Reply::Bytes(n) => Decoded::Bytes(self.link.read_exact(n)?),
            Reply::Words(n) => Decoded::Words(decode_words(&self.link.read_exact(n * 2)?)),
            Reply::Longs(n) => Decoded::Longs(decode_longs(&self.link.read_exact(n * 4)?)),
            Reply::Line => {
                let line = self.link.read_line()?;
                Decoded::Text(strip_prompt_echo(&line).to_string())
            }
            Reply::LengthPrefixed => {
                let header = self.link.read_exact(2)?;
                let len = usize::from(u16::from_be_bytes([header[0], header[1]]));
                Decoded::Bytes(self.link.read_exact(len)?)
            }
            Reply::Nothing => Decoded::Nothing,
        };
        Ok(decoded)
    }
}

/// Serializes all traffic on one link
pub struct Engine {
    state: Mutex<EngineState>,
    cancel: CancelToken,
}

impl Engine {
    pub fn new(link: Link, cancel: CancelToken) -> Self {
        Self {
            state: Mutex::new(EngineState {
                link,
                last_sensors: None,
                pacing: Duration::ZERO,
            }),
            cancel,
        }
    }

    // A panic in another caller leaves the link usable; the next frame resynchronizes.
    fn lock(&self) -> MutexGuard<'_, EngineState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Pause inserted before each framed write
    pub fn set_pacing(&self, pacing: Duration) {
        self.lock().pacing = pacing;
    }

    /// Run one transaction, then honour any pending stop request
    pub fn execute(&self, tx: &Transaction) -> Result<Decoded> {
        let decoded = self.lock().transact(tx).inspect_err(|e| {
            debug!("{:?} failed: {}", tx.opcode, e);
        })?;
        self.poll_cancel()?;
        Ok(decoded)
    }

    /// Run one transaction with a temporarily widened read timeout.
    /// The previous timeout is restored on every path.
    pub fn execute_with_timeout(&self, tx: &Transaction, timeout: Duration) -> Result<Decoded> {
        let decoded = {
            let mut state = self.lock();
            let previous = state.link.set_timeout(timeout)?;
            let result = state.transact(tx);
            let restored = state.link.set_timeout(previous);
            let decoded = result?;
            restored?;
            decoded
        };
        self.poll_cancel()?;
        Ok(decoded)
    }

    /// Wait out `duration` inside the session. A stop request cuts it short and is
    /// handled like one seen after a transaction: hard stop, clear, `UserCancelled`.
    pub fn pause(&self, duration: Duration) -> Result<()> {
        self.cancel.wait(duration);
        self.poll_cancel()
    }

    fn poll_cancel(&self) -> Result<()> {
        if !self.cancel.take() {
            return Ok(());
        }
        warn!("Stop requested, halting motors");
        if let Err(e) = self.hard_stop() {
            warn!("Hard stop after cancellation failed: {}", e);
        }
        Err(ScribblerError::UserCancelled)
    }

    /// Motors off, bypassing the stop-request poll
    pub fn hard_stop(&self) -> Result<()> {
        self.lock()
            .transact(&Transaction::command(Opcode::SetMotorsOff))
            .map(|_| ())
    }

    pub fn command(&self, tx: &Transaction) -> Result<()> {
        self.execute(tx).map(|_| ())
    }

    pub fn bytes(&self, tx: &Transaction) -> Result<Vec<u8>> {
        match self.execute(tx)? {
            Decoded::Bytes(bytes) => Ok(bytes),
            other => Err(shape_mismatch(tx, &other)),
        }
    }

    pub fn words(&self, tx: &Transaction) -> Result<Vec<u16>> {
        match self.execute(tx)? {
            Decoded::Words(words) => Ok(words),
            other => Err(shape_mismatch(tx, &other)),
        }
    }

    pub fn longs(&self, tx: &Transaction) -> Result<Vec<i32>> {
        match self.execute(tx)? {
            Decoded::Longs(longs) => Ok(longs),
            other => Err(shape_mismatch(tx, &other)),
        }
    }

    pub fn text(&self, tx: &Transaction, timeout: Duration) -> Result<String> {
        match self.execute_with_timeout(tx, timeout)? {
            Decoded::Text(text) => Ok(text),
            other => Err(shape_mismatch(tx, &other)),
        }
    }

    /// Sensor payload from the most recent command reply
    pub fn last_sensors(&self) -> Option<RawSensors> {
        self.lock().last_sensors
    }

    /// Run `f` against the link while holding the transaction lock
    pub fn with_link<R>(&self, f: impl FnOnce(&mut Link) -> Result<R>) -> Result<R> {
        f(&mut self.lock().link)
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    pub fn request_stop(&self) {
        self.cancel.cancel();
    }

    pub fn is_open(&self) -> bool {
        self.lock().link.is_open()
    }

    pub fn close(&self) {
        self.lock().link.close();
    }
}

fn shape_mismatch(tx: &Transaction, got: &Decoded) -> ScribblerError {
    ScribblerError::invalid(
        tx.opcode.into(),
        format!("expected {:?} reply, decoded {got:?}", tx.reply),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::scribbler::mock::{FakeScribbler, MockPort};
    use std::sync::Arc;

    fn engine_with(device: FakeScribbler) -> (Engine, MockPort) {
        let port = MockPort::with_device(device);
        let link = Link::new(Box::new(port.clone()), "COM3", 38_400);
        (Engine::new(link, CancelToken::new()), port)
    }

    #[test]
    fn test_echo_is_discarded_before_reply() {
        let (engine, port) = engine_with(FakeScribbler::default());
        let light = engine
            .words(&Transaction::query(Opcode::GetLightAll, Reply::Words(3)))
            .unwrap();
        assert_eq!(light, vec![10, 20, 30]);
        assert_eq!(port.writes(), vec![vec![70, 0, 0, 0, 0, 0, 0, 0, 0]]);
        assert!(port.state().rx.is_empty());
    }

    #[test]
    fn test_command_refreshes_cached_sensors() {
        let (engine, _port) = engine_with(FakeScribbler::default());
        assert!(engine.last_sensors().is_none());
        engine
            .command(&Transaction::command(Opcode::SetLedAllOn))
            .unwrap();
        assert_eq!(
            engine.last_sensors(),
            Some([0, 1, 2, 3, 4, 5, 6, 7, 8, 9, 10])
        );
    }

    #[test]
    fn test_raw_transaction_reads_no_echo() {
        let (engine, port) = engine_with(FakeScribbler::default());
        let battery = engine
            .bytes(&Transaction::query(Opcode::GetBattery, Reply::Bytes(2)))
            .unwrap();
        assert_eq!(battery, vec![0, 168]);
        assert_eq!(port.writes(), vec![vec![89]]);
    }

    #[test]
    fn test_length_prefixed_reply() {
        let (engine, _port) = engine_with(FakeScribbler::default());
        let message = engine
            .bytes(&Transaction::query(Opcode::GetIrMessage, Reply::LengthPrefixed))
            .unwrap();
        assert_eq!(message, b"hi".to_vec());
    }

    #[test]
    fn test_text_reply_strips_prompt_echo() {
        let (engine, _port) = engine_with(FakeScribbler::with_info("Robot:Scribbler"));
        let text = engine
            .text(
                &Transaction::query(Opcode::GetInfo, Reply::Line),
                Duration::from_secs(4),
            )
            .unwrap();
        assert_eq!(text, "Robot:Scribbler");
    }

    #[test]
    fn test_timeout_when_device_is_silent() {
        let port = MockPort::new();
        let engine = Engine::new(
            Link::new(Box::new(port), "COM3", 38_400),
            CancelToken::new(),
        );
        let err = engine
            .command(&Transaction::command(Opcode::SetMotorsOff))
            .unwrap_err();
        assert!(err.is_timeout());
        // lock was released: the next call runs (and times out) instead of deadlocking
        assert!(
            engine
                .command(&Transaction::command(Opcode::SetMotorsOff))
                .unwrap_err()
                .is_timeout()
        );
    }

    #[test]
    fn test_timeout_override_is_restored_after_failure() {
        let port = MockPort::new();
        port.state().timeout = Duration::from_secs(10);
        let engine = Engine::new(
            Link::new(Box::new(port.clone()), "COM3", 38_400),
            CancelToken::new(),
        );
        let tx = Transaction::command(Opcode::SetSpeaker).with_payload(&[0, 100, 3, 0x10]);
        assert!(
            engine
                .execute_with_timeout(&tx, Duration::from_millis(2100))
                .unwrap_err()
                .is_timeout()
        );
        assert_eq!(port.state().timeout, Duration::from_secs(10));
    }

    #[test]
    fn test_stop_request_is_honoured_after_transaction() {
        let (engine, port) = engine_with(FakeScribbler::default());
        engine.request_stop();

        let err = engine
            .command(&Transaction::command(Opcode::SetMotors).with_payload(&[200, 200]))
            .unwrap_err();
        assert!(matches!(err, ScribblerError::UserCancelled));

        // the motion command completed, then motors were stopped
        let ops: Vec<u8> = port.writes().iter().map(|w| w[0]).collect();
        assert_eq!(ops, vec![109, 108]);

        // flag was cleared
        engine
            .command(&Transaction::command(Opcode::SetLedAllOff))
            .unwrap();
    }

    #[test]
    fn test_stop_during_pause_halts_motors() {
        let (engine, port) = engine_with(FakeScribbler::default());
        engine
            .command(&Transaction::command(Opcode::SetMotors).with_payload(&[200, 200]))
            .unwrap();

        let remote = engine.cancel_token();
        let trip = thread::spawn(move || {
            thread::sleep(Duration::from_millis(20));
            remote.cancel();
        });
        let err = engine.pause(Duration::from_secs(5)).unwrap_err();
        trip.join().unwrap();

        assert!(matches!(err, ScribblerError::UserCancelled));
        let ops: Vec<u8> = port.writes().iter().map(|w| w[0]).collect();
        assert_eq!(ops, vec![109, 108]);
        assert!(!engine.cancel_token().is_cancelled());
        engine.pause(Duration::from_millis(1)).unwrap();
    }

    #[test]
    fn test_concurrent_callers_never_interleave() {
        let (engine, port) = engine_with(FakeScribbler::default());
        port.state().read_chunk = 3;
        let engine = Arc::new(engine);

        let light = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for _ in 0..200 {
                    let words = engine
                        .words(&Transaction::query(Opcode::GetLightAll, Reply::Words(3)))
                        .unwrap();
                    assert_eq!(words, vec![10, 20, 30]);
                }
            })
        };
        let ir = {
            let engine = Arc::clone(&engine);
            thread::spawn(move || {
                for _ in 0..200 {
                    let bytes = engine
                        .bytes(&Transaction::query(Opcode::GetIrAll, Reply::Bytes(2)))
                        .unwrap();
                    assert_eq!(bytes, vec![1, 0]);
                }
            })
        };
        light.join().unwrap();
        ir.join().unwrap();

        let state = port.state();
        assert_eq!(state.overlaps, 0);
        assert_eq!(state.writes.len(), 400);
        assert!(state.writes.iter().all(|w| w.len() == PACKET_LENGTH));
        assert!(state.rx.is_empty());
    }

    #[test]
    fn test_closed_link_reports_closed() {
        let (engine, _port) = engine_with(FakeScribbler::default());
        engine.close();
        engine.close();
        assert!(!engine.is_open());
        assert!(matches!(
            engine.hard_stop(),
            Err(ScribblerError::LinkClosed)
        ));
    }
}
