//! Startup banner parsing.
//!
//! A model started with `-p` prints one line per listening port, then a
//! blank line:
//!
//! ```text
//! telnetterminal0: Listening for serial connection on port 5000
//! telnetterminal1: Listening for serial connection on port 5001
//! Iris server started listening to port 7100
//!
//! ```

use std::io::BufRead;

use tracing::debug;

use fvp_agent_core::{Error, Result};

/// Number of telnet terminals tracked per simulator.
pub const TERMINAL_COUNT: usize = 4;

const TERMINAL_PREFIX: &str = "telnetterminal";
const IRIS_PREFIX: &str = "Iris";

/// Ports announced in a startup banner.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BannerPorts {
    /// Debug bridge (Iris) server port
    pub iris_port: Option<u16>,
    /// Telnet terminal ports by terminal index
    pub terminal_ports: [Option<u16>; TERMINAL_COUNT],
}

impl BannerPorts {
    /// Port of a telnet terminal, if announced.
    pub fn terminal_port(&self, index: usize) -> Option<u16> {
        self.terminal_ports.get(index).copied().flatten()
    }

    /// Record whatever port a single banner line announces.
    pub fn record_line(&mut self, line: &str) {
        let mut tokens = line.split_whitespace();
        let Some(first) = tokens.next() else {
            return;
        };
        let Some(port) = tokens.last().and_then(trailing_port) else {
            return;
        };

        if let Some(rest) = first.strip_prefix(TERMINAL_PREFIX) {
            let digits: String = rest.chars().take_while(char::is_ascii_digit).collect();
            match digits.parse::<usize>() {
                Ok(index) if index < TERMINAL_COUNT => {
                    self.terminal_ports[index] = Some(port);
                }
                Ok(index) => {
                    debug!(index, port, "Ignoring terminal beyond tracked count");
                }
                Err(_) => {}
            }
        } else if first.starts_with(IRIS_PREFIX) {
            self.iris_port = Some(port);
        }
    }
}

fn trailing_port(token: &str) -> Option<u16> {
    token
        .trim_matches(|c: char| !c.is_ascii_digit())
        .parse()
        .ok()
}

/// Read banner lines until the first blank line.
///
/// Leaves `reader` positioned just past the blank line so the rest of the
/// output can be drained by the caller. End of output before the blank line
/// is a protocol error.
pub fn parse_banner<R: BufRead>(reader: &mut R) -> Result<BannerPorts> {
    let mut ports = BannerPorts::default();
    let mut raw = Vec::new();

    loop {
        raw.clear();
        if reader.read_until(b'\n', &mut raw)? == 0 {
            return Err(Error::LaunchProtocol(
                "simulator output ended before the end of its startup banner".to_string(),
            ));
        }
        let line = String::from_utf8_lossy(&raw);
        let line = line.trim();
        if line.is_empty() {
            return Ok(ports);
        }
        debug!(line, "Banner");
        ports.record_line(line);
    }
}
