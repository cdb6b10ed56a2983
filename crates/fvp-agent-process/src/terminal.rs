//! Telnet terminal channel.
//!
//! A simulated UART is exposed by the model as a raw TCP socket. Reads are
//! byte-at-a-time so the caller can stop exactly on a delimiter, and writes
//! are paced because the simulated UART drops bytes that arrive faster than
//! it drains them.

use std::io::{self, Read, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::thread;
use std::time::Duration;

use tracing::{debug, info, warn};

use fvp_agent_core::{Error, Result, TerminalSettings};

/// Byte-stream session with one telnet terminal of a simulator.
#[derive(Debug)]
pub struct TerminalChannel {
    stream: Option<TcpStream>,
    port: Option<u16>,
    read_timeout: Duration,
    connect_timeout: Duration,
    connect_attempts: u32,
    settle_delay: Duration,
    write_pace: Duration,
    log_tx: bool,
    last_error: Option<String>,
}

struct ReadOutcome {
    data: Vec<u8>,
    closed: bool,
}

impl TerminalChannel {
    /// Create an unconnected channel.
    pub fn new(settings: &TerminalSettings) -> Self {
        Self {
            stream: None,
            port: None,
            read_timeout: Duration::from_millis(settings.read_timeout_ms),
            connect_timeout: Duration::from_millis(settings.connect_timeout_ms),
            connect_attempts: settings.connect_attempts.max(1),
            settle_delay: Duration::from_millis(settings.settle_delay_ms),
            write_pace: Duration::from_millis(settings.write_pace_ms),
            log_tx: false,
            last_error: None,
        }
    }

    /// Log every written payload at info level.
    pub fn with_tx_logging(mut self, enabled: bool) -> Self {
        self.log_tx = enabled;
        self
    }

    /// Connect to a terminal port, retrying with the settle delay between
    /// attempts. Any previous session is closed first.
    ///
    /// On failure the error is also kept in [`last_error`](Self::last_error)
    /// and the channel stays unconnected.
    pub fn connect(&mut self, host: &str, port: u16) -> Result<()> {
        self.disconnect();

        let mut failure = String::new();
        for attempt in 1..=self.connect_attempts {
            if attempt > 1 {
                thread::sleep(self.settle_delay);
            }
            match self.try_connect(host, port) {
                Ok(stream) => {
                    info!(host, port, attempt, "Terminal connected");
                    self.stream = Some(stream);
                    self.port = Some(port);
                    self.last_error = None;
                    return Ok(());
                }
                Err(e) => {
                    debug!(host, port, attempt, error = %e, "Terminal connect attempt failed");
                    failure = e.to_string();
                }
            }
        }

        let message = format!(
            "failed to connect to terminal {host}:{port} after {} attempts: {failure}",
            self.connect_attempts
        );
        warn!("{}", message);
        self.last_error = Some(message.clone());
        Err(Error::Connection(message))
    }

    fn try_connect(&self, host: &str, port: u16) -> io::Result<TcpStream> {
        let mut last = io::Error::new(io::ErrorKind::NotFound, "host resolved to no address");
        for addr in (host, port).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_read_timeout(Some(self.read_timeout))?;
                    stream.set_nodelay(true)?;
                    return Ok(stream);
                }
                Err(e) => last = e,
            }
        }
        Err(last)
    }

    /// Whether a session is open.
    pub fn is_connected(&self) -> bool {
        self.stream.is_some()
    }

    /// Port of the open session.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    /// Most recent connection or I/O failure.
    pub fn last_error(&self) -> Option<&str> {
        self.last_error.as_deref()
    }

    /// Read until the data ends with `delimiter`, `max_bytes` bytes have been
    /// read, or the read timeout elapses.
    ///
    /// A timeout is not an error: whatever arrived so far is returned,
    /// possibly nothing. A socket error closes the session.
    pub fn read(&mut self, delimiter: Option<&[u8]>, max_bytes: Option<usize>) -> Result<Vec<u8>> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        let delimiter = delimiter.filter(|d| !d.is_empty());

        match read_bounded(stream, delimiter, max_bytes) {
            Ok(ReadOutcome { data, closed: false }) => Ok(data),
            Ok(ReadOutcome { data, closed: true }) => {
                self.invalidate("terminal closed by simulator".to_string());
                if data.is_empty() {
                    Err(Error::Connection("terminal closed by simulator".to_string()))
                } else {
                    Ok(data)
                }
            }
            Err(e) => {
                let message = format!("terminal read failed: {e}");
                self.invalidate(message.clone());
                Err(Error::Connection(message))
            }
        }
    }

    /// Read one line, including its newline if one arrived in time.
    pub fn read_line(&mut self) -> Result<String> {
        let data = self.read(Some(b"\n"), None)?;
        Ok(String::from_utf8_lossy(&data).into_owned())
    }

    /// Write a payload with the configured pace between bytes.
    pub fn write(&mut self, payload: &[u8]) -> Result<()> {
        self.write_with_pace(payload, self.write_pace)
    }

    /// Write a payload one byte at a time, sleeping `pace` after each byte.
    ///
    /// A socket error closes the session; the bytes sent before it stay sent.
    pub fn write_with_pace(&mut self, payload: &[u8], pace: Duration) -> Result<()> {
        let stream = self.stream.as_mut().ok_or(Error::NotConnected)?;
        if self.log_tx {
            info!(port = ?self.port, "TX: {}", String::from_utf8_lossy(payload));
        }

        let mut failure = None;
        for (sent, byte) in payload.iter().enumerate() {
            if let Err(e) = stream.write_all(std::slice::from_ref(byte)) {
                failure = Some(format!(
                    "terminal write failed after {sent} of {} bytes: {e}",
                    payload.len()
                ));
                break;
            }
            if !pace.is_zero() {
                thread::sleep(pace);
            }
        }

        match failure {
            None => Ok(()),
            Some(message) => {
                self.invalidate(message.clone());
                Err(Error::Connection(message))
            }
        }
    }

    /// Close the session. Does nothing when unconnected.
    pub fn disconnect(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(Shutdown::Both);
            debug!(port = ?self.port, "Terminal disconnected");
        }
        self.port = None;
    }

    fn invalidate(&mut self, message: String) {
        warn!(port = ?self.port, "{}", message);
        self.last_error = Some(message);
        self.disconnect();
    }
}

impl Drop for TerminalChannel {
    fn drop(&mut self) {
        self.disconnect();
    }
}

fn read_bounded(
    stream: &mut TcpStream,
    delimiter: Option<&[u8]>,
    max_bytes: Option<usize>,
) -> io::Result<ReadOutcome> {
    let mut data = Vec::new();
    let mut byte = [0u8; 1];

    loop {
        if max_bytes.is_some_and(|max| data.len() >= max) {
            break;
        }
        match stream.read(&mut byte) {
            Ok(0) => return Ok(ReadOutcome { data, closed: true }),
            Ok(_) => {
                data.push(byte[0]);
                if delimiter.is_some_and(|d| data.ends_with(d)) {
                    break;
                }
            }
            Err(e) if matches!(e.kind(), io::ErrorKind::WouldBlock | io::ErrorKind::TimedOut) => {
                break;
            }
            Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
            Err(e) => return Err(e),
        }
    }

    Ok(ReadOutcome {
        data,
        closed: false,
    })
}
