//! Port range type.

use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// A bounded, stepped range of TCP port numbers: `start, start + step, ...`
/// strictly below `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawPortRange")]
pub struct PortRange {
    start: u16,
    end: u16,
    step: u16,
}

#[derive(Deserialize)]
struct RawPortRange {
    start: u16,
    end: u16,
    #[serde(default = "default_step")]
    step: u16,
}

fn default_step() -> u16 {
    1
}

impl TryFrom<RawPortRange> for PortRange {
    type Error = Error;

    fn try_from(raw: RawPortRange) -> Result<Self> {
        PortRange::new(raw.start, raw.end, raw.step)
    }
}

impl PortRange {
    /// Default range for telnet terminal start ports. The step leaves room
    /// for the consecutive ports a model binds for its other terminals.
    pub const DEFAULT_TELNET: PortRange = PortRange {
        start: 5000,
        end: 40000,
        step: 4,
    };

    /// Default range for GDB server ports.
    pub const DEFAULT_GDB: PortRange = PortRange {
        start: 40000,
        end: 45000,
        step: 1,
    };

    /// Create a new range. Requires `step > 0` and `start + step <= end`.
    pub fn new(start: u16, end: u16, step: u16) -> Result<Self> {
        if step == 0 {
            return Err(Error::Config(format!(
                "port range {start}..{end} has a zero step"
            )));
        }
        if u32::from(start) + u32::from(step) > u32::from(end) {
            return Err(Error::Config(format!(
                "port range {start}..{end} step {step} holds no port"
            )));
        }
        Ok(Self { start, end, step })
    }

    /// First port of the range.
    pub fn start(&self) -> u16 {
        self.start
    }

    /// Exclusive upper bound.
    pub fn end(&self) -> u16 {
        self.end
    }

    /// Distance between consecutive slots.
    pub fn step(&self) -> u16 {
        self.step
    }

    /// Number of slots in the range.
    pub fn capacity(&self) -> usize {
        usize::from(self.end - self.start).div_ceil(usize::from(self.step))
    }

    /// Check whether `port` is a slot of this range.
    pub fn contains(&self, port: u16) -> bool {
        port >= self.start && port < self.end && (port - self.start) % self.step == 0
    }

    /// Slot following `port`, or `None` past the end of the range.
    pub fn next_after(&self, port: u16) -> Option<u16> {
        let next = u32::from(port) + u32::from(self.step);
        if next < u32::from(self.end) {
            Some(next as u16)
        } else {
            None
        }
    }

    /// Check whether two ranges share any port number.
    pub fn overlaps(&self, other: &PortRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl std::fmt::Display for PortRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}..{} step {}", self.start, self.end, self.step)
    }
}
