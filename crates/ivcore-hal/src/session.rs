//! SCPI wire sessions.
//!
//! A [`ScpiSession`] is a line-oriented command channel to one physical
//! instrument.  Drivers never open sockets themselves: they ask a
//! [`Connector`] for a session, wrap it in a [`SharedSession`] and, for
//! dual-channel instruments, hand a clone of that handle to the sibling
//! channel's driver.
//!
//! # Resource strings
//!
//! [`TcpConnector`] understands the raw-socket subset of VISA resource names:
//!
//! | Resource | Port |
//! |---|---|
//! | `TCPIP0::192.168.1.20::5025::SOCKET` | as given |
//! | `TCPIP0::192.168.1.20::INSTR` | 5025 |
//! | `TCPIP0::192.168.1.20::inst0::INSTR` | 5025 |
//! | `192.168.1.20:5025` | as given |
//!
//! USB, GPIB and serial resources need a vendor VISA library and are
//! rejected with [`IvError::Communication`].

use std::io::{BufRead, BufReader, ErrorKind, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::Duration;

use ivcore_types::IvError;
use parking_lot::Mutex;
use tracing::{debug, trace};

/// Default raw-socket SCPI port used by LXI instruments.
pub const DEFAULT_SCPI_PORT: u16 = 5025;

/// A line-oriented SCPI command channel.
pub trait ScpiSession: Send {
    /// Resource string this session was opened for.
    fn resource(&self) -> &str;

    /// Send one command without waiting for a response.
    ///
    /// # Errors
    ///
    /// Returns [`IvError::Communication`] on any transport failure.
    fn write(&mut self, command: &str) -> Result<(), IvError>;

    /// Send one command and return the trimmed response line.
    ///
    /// # Errors
    ///
    /// Returns [`IvError::Communication`] on transport failure or timeout.
    fn query(&mut self, command: &str) -> Result<String, IvError>;

    /// Discard any pending input so the next query starts clean.
    fn clear(&mut self) -> Result<(), IvError>;

    /// Release the underlying transport.
    fn close(&mut self) -> Result<(), IvError>;
}

/// A session handle that two logical channels of one instrument can hold at
/// the same time.
pub type SharedSession = Arc<Mutex<Box<dyn ScpiSession>>>;

/// Wrap an owned session into a [`SharedSession`].
pub fn share(session: Box<dyn ScpiSession>) -> SharedSession {
    Arc::new(Mutex::new(session))
}

/// Opens sessions for instrument addresses.
pub trait Connector: Send + Sync {
    /// # Errors
    ///
    /// Returns [`IvError::Communication`] if the address is unsupported or
    /// the instrument cannot be reached.
    fn open(&self, address: &str) -> Result<Box<dyn ScpiSession>, IvError>;
}

// ────────────────────────────────────────────────────────────────────────────
// Resource parsing
// ────────────────────────────────────────────────────────────────────────────

/// Split a resource string into `(host, port)`.
///
/// # Errors
///
/// Returns [`IvError::Communication`] for resource classes that are not
/// reachable over a plain TCP socket, and [`IvError::InvalidArgument`] for
/// malformed strings.
pub fn parse_resource(address: &str) -> Result<(String, u16), IvError> {
    let address = address.trim();
    let parts: Vec<&str> = address.split("::").collect();
    let class = parts[0].to_ascii_uppercase();

    if class.starts_with("TCPIP") {
        let host = parts
            .get(1)
            .filter(|h| !h.is_empty())
            .ok_or_else(|| IvError::InvalidArgument(format!("missing host in '{address}'")))?;
        let suffix = parts.last().map(|s| s.to_ascii_uppercase()).unwrap_or_default();
        return match (suffix.as_str(), parts.len()) {
            ("SOCKET", 4) => {
                let port = parts[2].parse::<u16>().map_err(|_| {
                    IvError::InvalidArgument(format!("invalid port '{}' in '{address}'", parts[2]))
                })?;
                Ok((host.to_string(), port))
            }
            ("INSTR", 3) | ("INSTR", 4) => Ok((host.to_string(), DEFAULT_SCPI_PORT)),
            _ => Err(IvError::InvalidArgument(format!(
                "unrecognised TCPIP resource '{address}'"
            ))),
        };
    }

    for unsupported in ["USB", "GPIB", "ASRL", "VXI", "PXI"] {
        if class.starts_with(unsupported) {
            return Err(IvError::communication(
                address,
                format!("{unsupported} resources are not supported; use a TCPIP socket address"),
            ));
        }
    }

    match address.rsplit_once(':') {
        Some((host, port)) if !host.is_empty() => {
            let port = port.parse::<u16>().map_err(|_| {
                IvError::InvalidArgument(format!("invalid port '{port}' in '{address}'"))
            })?;
            Ok((host.to_string(), port))
        }
        _ => Err(IvError::InvalidArgument(format!(
            "unrecognised instrument address '{address}'"
        ))),
    }
}

// ────────────────────────────────────────────────────────────────────────────
// TCP transport
// ────────────────────────────────────────────────────────────────────────────

/// Opens raw-socket SCPI sessions.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    io_timeout: Duration,
}

impl TcpConnector {
    pub fn new(connect_timeout: Duration, io_timeout: Duration) -> Self {
        Self {
            connect_timeout,
            io_timeout,
        }
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), Duration::from_secs(20))
    }
}

impl Connector for TcpConnector {
    fn open(&self, address: &str) -> Result<Box<dyn ScpiSession>, IvError> {
        let (host, port) = parse_resource(address)?;
        let addr = (host.as_str(), port)
            .to_socket_addrs()
            .map_err(|e| IvError::communication(address, e))?
            .next()
            .ok_or_else(|| IvError::communication(address, "address did not resolve"))?;

        let stream = TcpStream::connect_timeout(&addr, self.connect_timeout)
            .map_err(|e| IvError::communication(address, e))?;
        stream
            .set_read_timeout(Some(self.io_timeout))
            .and_then(|_| stream.set_write_timeout(Some(self.io_timeout)))
            .and_then(|_| stream.set_nodelay(true))
            .map_err(|e| IvError::communication(address, e))?;
        let reader = stream
            .try_clone()
            .map(BufReader::new)
            .map_err(|e| IvError::communication(address, e))?;

        debug!(resource = address, %addr, "opened SCPI socket");
        Ok(Box::new(TcpSession {
            resource: address.to_string(),
            stream,
            reader,
            io_timeout: self.io_timeout,
        }))
    }
}

/// Newline-terminated SCPI over a TCP socket.
pub struct TcpSession {
    resource: String,
    stream: TcpStream,
    reader: BufReader<TcpStream>,
    io_timeout: Duration,
}

impl TcpSession {
    fn io_err(&self, err: impl std::fmt::Display) -> IvError {
        IvError::communication(self.resource.clone(), err)
    }
}

impl ScpiSession for TcpSession {
    fn resource(&self) -> &str {
        &self.resource
    }

    fn write(&mut self, command: &str) -> Result<(), IvError> {
        trace!(resource = %self.resource, command, "scpi write");
        let mut line = String::with_capacity(command.len() + 1);
        line.push_str(command);
        line.push('\n');
        self.stream
            .write_all(line.as_bytes())
            .and_then(|_| self.stream.flush())
            .map_err(|e| self.io_err(e))
    }

    fn query(&mut self, command: &str) -> Result<String, IvError> {
        self.write(command)?;
        let mut response = String::new();
        let read = self
            .reader
            .read_line(&mut response)
            .map_err(|e| self.io_err(e))?;
        if read == 0 {
            return Err(self.io_err("connection closed by instrument"));
        }
        let response = response.trim().to_string();
        trace!(resource = %self.resource, command, response, "scpi query");
        Ok(response)
    }

    fn clear(&mut self) -> Result<(), IvError> {
        let buffered = self.reader.buffer().len();
        self.reader.consume(buffered);

        self.stream
            .set_read_timeout(Some(Duration::from_millis(20)))
            .map_err(|e| self.io_err(e))?;
        let mut scratch = [0u8; 512];
        loop {
            match self.reader.get_mut().read(&mut scratch) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => break,
                Err(e) => return Err(self.io_err(e)),
            }
        }
        self.stream
            .set_read_timeout(Some(self.io_timeout))
            .map_err(|e| self.io_err(e))
    }

    fn close(&mut self) -> Result<(), IvError> {
        match self.stream.shutdown(Shutdown::Both) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotConnected => Ok(()),
            Err(e) => Err(self.io_err(e)),
        }
    }
}
