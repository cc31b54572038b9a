// Connection management: opening, discovering and recovering the serial link
//
// A target is either an explicit port ("COM12", "7", "/dev/ttyUSB0") or a
// robot name. Names are resolved by scanning candidate ports for the robot's
// startup broadcast: "IPRE" followed by a 5-byte name field.

use std::io::{self, Read, Write};
use std::sync::Arc;
use std::time::Duration;

use serialport::{ClearBuffer, SerialPort};
use tracing::{debug, info, warn};

use super::cancel::CancelToken;
use super::error::{Result, ScribblerError};
use crate::config::{
    DISCOVERY_MARKER, DISCOVERY_NAME_LEN, DISCOVERY_PORTS, DRAIN_LIMIT, LinkConfig,
};

/// Byte-level operations the engine needs from a serial port
pub trait Port: Read + Write + Send {
    fn timeout(&self) -> Duration;
    fn set_timeout(&mut self, timeout: Duration) -> Result<()>;
    fn bytes_to_read(&self) -> Result<u32>;
    fn clear_input(&self) -> Result<()>;
    fn clear_output(&self) -> Result<()>;
    fn set_dtr(&mut self, level: bool) -> Result<()>;
}

impl Port for Box<dyn SerialPort> {
    fn timeout(&self) -> Duration {
        (**self).timeout()
    }

    fn set_timeout(&mut self, timeout: Duration) -> Result<()> {
        Ok((**self).set_timeout(timeout)?)
    }

    fn bytes_to_read(&self) -> Result<u32> {
        Ok((**self).bytes_to_read()?)
    }

    fn clear_input(&self) -> Result<()> {
        Ok((**self).clear(ClearBuffer::Input)?)
    }

    fn clear_output(&self) -> Result<()> {
        Ok((**self).clear(ClearBuffer::Output)?)
    }

    fn set_dtr(&mut self, level: bool) -> Result<()> {
        Ok((**self).write_data_terminal_ready(level)?)
    }
}

/// Something that can open a port by path
pub trait PortOpener: Send + Sync {
    fn open(&self, path: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn Port>>;
}

/// Opens real serial devices through `serialport`
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemPorts;

impl PortOpener for SystemPorts {
    fn open(&self, path: &str, baud_rate: u32, timeout: Duration) -> Result<Box<dyn Port>> {
        let port = serialport::new(path, baud_rate).timeout(timeout).open()?;
        Ok(Box::new(port))
    }
}

/// Lists serial ports visible to the OS
pub fn list_ports() -> Result<Vec<String>> {
    let ports = serialport::available_ports()?;
    Ok(ports.into_iter().map(|p| p.port_name).collect())
}

/// What to connect to
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Target {
    /// An explicit port path, already in platform form
    Port(String),
    /// A robot name to find by discovery
    Name(String),
    /// Unspecified: take the first robot that announces itself
    Discover,
}

impl Target {
    /// Classify a user-supplied identifier
    pub fn parse(identifier: &str) -> Self {
        let id = identifier.trim();
        if id.is_empty() {
            return Target::Discover;
        }
        if let Ok(number) = id.parse::<u32>() {
            return Target::Port(com_port_path(number));
        }
        let lower = id.to_ascii_lowercase();
        if let Some(digits) = lower.strip_prefix("com") {
            if let Ok(number) = digits.parse::<u32>() {
                return Target::Port(com_port_path(number));
            }
        }
        if id.starts_with("/dev/") || id.starts_with(r"\\.\") {
            return Target::Port(id.to_string());
        }
        Target::Name(id.to_string())
    }

    pub fn from_config(config: &LinkConfig) -> Self {
        config
            .target
            .as_deref()
            .map_or(Target::Discover, Target::parse)
    }
}

/// Port path for COM port `number`; numbers of 10 and above need the extended form
pub fn com_port_path(number: u32) -> String {
    if number >= 10 {
        format!(r"\\.\COM{number}")
    } else {
        format!("COM{number}")
    }
}

/// Human form of a port path ("\\.\COM12" -> "COM12")
pub fn pretty_port(path: &str) -> &str {
    path.strip_prefix(r"\\.\").unwrap_or(path)
}

/// Find the discovery marker and extract the advertised robot name
pub fn advertised_name(chatter: &[u8]) -> Option<String> {
    let start = chatter
        .windows(DISCOVERY_MARKER.len())
        .position(|w| w == DISCOVERY_MARKER)?
        + DISCOVERY_MARKER.len();
    let end = (start + DISCOVERY_NAME_LEN).min(chatter.len());
    let name: String = chatter[start..end]
        .iter()
        .filter(|b| b.is_ascii_graphic() || **b == b' ')
        .map(|&b| char::from(b))
        .collect();
    Some(name.trim().to_string())
}

/// An open (or closed) serial link to the robot
pub struct Link {
    port: Option<Box<dyn Port>>,
    path: String,
    baud_rate: u32,
}

impl Link {
    pub fn new(port: Box<dyn Port>, path: impl Into<String>, baud_rate: u32) -> Self {
        Self {
            port: Some(port),
            path: path.into(),
            baud_rate,
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn baud_rate(&self) -> u32 {
        self.baud_rate
    }

    pub fn is_open(&self) -> bool {
        self.port.is_some()
    }

    fn port(&mut self) -> Result<&mut Box<dyn Port>> {
        self.port.as_mut().ok_or(ScribblerError::LinkClosed)
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<()> {
        let port = self.port()?;
        port.write_all(bytes)?;
        port.flush()?;
        Ok(())
    }

    /// Read exactly `n` bytes or fail with `ProtocolTimeout`
    pub fn read_exact(&mut self, n: usize) -> Result<Vec<u8>> {
        let port = self.port()?;
        let mut buf = vec![0u8; n];
        let mut filled = 0;
        while filled < n {
            match port.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(k) => filled += k,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }
        if filled < n {
            return Err(ScribblerError::ProtocolTimeout {
                expected: n,
                received: filled,
            });
        }
        Ok(buf)
    }

    /// Read up to and including '\n'. A timeout after some text returns the partial line.
    pub fn read_line(&mut self) -> Result<String> {
        let port = self.port()?;
        let mut line = String::new();
        let mut byte = [0u8; 1];
        loop {
            match port.read(&mut byte) {
                Ok(0) => break,
                Ok(_) => {
                    line.push(char::from(byte[0]));
                    if byte[0] == b'\n' {
                        return Ok(line);
                    }
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }
        if line.is_empty() {
            Err(ScribblerError::ProtocolTimeout {
                expected: 1,
                received: 0,
            })
        } else {
            Ok(line)
        }
    }

    /// Everything currently buffered, without waiting
    pub fn read_available(&mut self) -> Result<Vec<u8>> {
        let waiting = self.bytes_to_read()? as usize;
        if waiting == 0 {
            return Ok(Vec::new());
        }
        self.read_exact(waiting)
    }

    pub fn bytes_to_read(&mut self) -> Result<u32> {
        self.port()?.bytes_to_read()
    }

    pub fn clear_buffers(&mut self) -> Result<()> {
        let port = self.port()?;
        port.clear_input()?;
        port.clear_output()
    }

    pub fn timeout(&mut self) -> Result<Duration> {
        Ok(self.port()?.timeout())
    }

    /// Set the read timeout, returning the previous one
    pub fn set_timeout(&mut self, timeout: Duration) -> Result<Duration> {
        let port = self.port()?;
        let previous = port.timeout();
        port.set_timeout(timeout)?;
        Ok(previous)
    }

    /// Read and discard input until the line goes quiet for `quiet` (or DRAIN_LIMIT bytes)
    pub fn drain(&mut self, quiet: Duration) -> Result<usize> {
        let previous = self.set_timeout(quiet)?;
        let result = self.drain_inner();
        self.set_timeout(previous)?;
        let drained = result?;
        if drained > 0 {
            debug!("Drained {} stale bytes from {}", drained, self.path);
        }
        Ok(drained)
    }

    fn drain_inner(&mut self) -> Result<usize> {
        let port = self.port()?;
        let mut buf = [0u8; 64];
        let mut count = 0;
        while count < DRAIN_LIMIT {
            match port.read(&mut buf) {
                Ok(0) => break,
                Ok(n) => count += n,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                Err(e) if e.kind() == io::ErrorKind::TimedOut => break,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(count)
    }

    /// Release the port. Closing a closed link is a no-op.
    pub fn close(&mut self) {
        if self.port.take().is_some() {
            info!("Closed serial port {}", pretty_port(&self.path));
        }
    }
}

impl std::fmt::Debug for Link {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Link")
            .field("path", &self.path)
            .field("baud_rate", &self.baud_rate)
            .field("open", &self.is_open())
            .finish()
    }
}

/// Opens links, retrying transient failures and resolving robot names
pub struct Connector {
    opener: Arc<dyn PortOpener>,
    config: LinkConfig,
    cancel: CancelToken,
    // (advertised name, port path) from the last successful discovery
    resolved: Option<(String, String)>,
}

impl Connector {
    pub fn new(opener: Arc<dyn PortOpener>, config: LinkConfig, cancel: CancelToken) -> Self {
        Self {
            opener,
            config,
            cancel,
            resolved: None,
        }
    }

    /// Connector for real serial devices
    pub fn system(config: LinkConfig, cancel: CancelToken) -> Self {
        Self::new(Arc::new(SystemPorts), config, cancel)
    }

    pub fn config(&self) -> &LinkConfig {
        &self.config
    }

    pub fn cancel_token(&self) -> CancelToken {
        self.cancel.clone()
    }

    /// Port found by the last discovery for `name`
    pub fn resolved_port(&self, name: Option<&str>) -> Option<&str> {
        match (&self.resolved, name) {
            (Some((found, path)), Some(wanted)) if found == wanted => Some(path),
            (Some((_, path)), None) => Some(path),
            _ => None,
        }
    }

    /// Open the configured target
    pub fn connect(&mut self) -> Result<Link> {
        let target = Target::from_config(&self.config);
        self.open(&target)
    }

    pub fn open(&mut self, target: &Target) -> Result<Link> {
        match target {
            Target::Port(path) => self.open_port(path),
            Target::Name(name) => match self.resolved_port(Some(name.as_str())).map(str::to_owned) {
                Some(path) => self.open_port(&path),
                None => self.search(Some(name.as_str())),
            },
            Target::Discover => match self.resolved_port(None).map(str::to_owned) {
                Some(path) => self.open_port(&path),
                None => self.search(None),
            },
        }
    }

    /// Open `path`, retrying every `retry_backoff` until it succeeds or the caller cancels
    pub fn open_port(&self, path: &str) -> Result<Link> {
        let mut attempt: u64 = 0;
        loop {
            self.cancel.check()?;
            attempt += 1;
            match self
                .opener
                .open(path, self.config.baud_rate, self.config.timeout)
            {
                Ok(mut port) => {
                    // directly connected Scribbler 2s reset on DTR
                    if let Err(e) = port.set_dtr(false) {
                        warn!("Failed to clear DTR on {}: {}", pretty_port(path), e);
                    }
                    info!(
                        "Opened {} at {} baud",
                        pretty_port(path),
                        self.config.baud_rate
                    );
                    return Ok(Link::new(port, path, self.config.baud_rate));
                }
                Err(ScribblerError::UserCancelled) => return Err(ScribblerError::UserCancelled),
                Err(e) => {
                    let transient = ScribblerError::TransientLink {
                        port: pretty_port(path).to_string(),
                        reason: e.to_string(),
                    };
                    warn!("Waiting on port (attempt {}): {}", attempt, transient);
                    self.cancel.sleep(self.config.retry_backoff)?;
                }
            }
        }
    }

    /// Scan candidate ports for a robot announcing `name` (any robot if `None`)
    pub fn search(&mut self, name: Option<&str>) -> Result<Link> {
        let wanted = name.unwrap_or("*");
        for number in DISCOVERY_PORTS {
            self.cancel.check()?;
            let path = com_port_path(number);
            info!(
                "Searching on port {} for robot named '{}'...",
                pretty_port(&path),
                wanted
            );

            let port = match self
                .opener
                .open(&path, self.config.baud_rate, self.config.timeout)
            {
                Ok(port) => port,
                Err(ScribblerError::UserCancelled) => return Err(ScribblerError::UserCancelled),
                Err(e) => {
                    debug!("Serial element not found on {}: {}", pretty_port(&path), e);
                    continue;
                }
            };
            let mut link = Link::new(port, path.clone(), self.config.baud_rate);

            // the robot broadcasts its name for a while after reset
            self.cancel.sleep(self.config.discovery_settle)?;
            let chatter = match link.read_available() {
                Ok(bytes) => bytes,
                Err(e) => {
                    warn!("Failed to read from {}: {}", pretty_port(&path), e);
                    continue;
                }
            };

            if let Some(found) = advertised_name(&chatter) {
                info!("Found robot named '{}' on port {}", found, pretty_port(&path));
                if name.is_none_or(|n| n == found) {
                    self.resolved = Some((found, path));
                    return Ok(link);
                }
            }
            link.close();
        }

        Err(ScribblerError::ConnectionNotFound {
            name: wanted.to_string(),
            first: *DISCOVERY_PORTS.start(),
            last: *DISCOVERY_PORTS.end(),
        })
    }
}
