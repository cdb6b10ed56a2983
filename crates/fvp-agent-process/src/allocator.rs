//! Port allocation for simulator telnet terminals and GDB servers.
//!
//! Every range of an allocator sits behind one shared mutex, and handles
//! give their port back when dropped, so short-lived simulator instances
//! never leak slots from a bounded range.

use std::collections::BTreeSet;
use std::sync::{Arc, Mutex};

use lazy_static::lazy_static;
use tracing::{debug, warn};

use fvp_agent_core::{Error, PortRange, PortSettings, Result};

lazy_static! {
    static ref GLOBAL_PORTS: SimulatorPorts = SimulatorPorts::with_ranges(
        PortRange::DEFAULT_TELNET,
        PortRange::DEFAULT_GDB,
    )
    .unwrap_or_else(|e| panic!("default port ranges are invalid: {e}"));
}

/// Identifies one range registered with a [`PortAllocator`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RangeId(usize);

#[derive(Debug)]
struct RangeSlots {
    range: PortRange,
    allocated: BTreeSet<u16>,
    last: Option<u16>,
}

impl RangeSlots {
    fn first_candidate(&self) -> u16 {
        self.last
            .and_then(|last| self.range.next_after(last))
            .unwrap_or(self.range.start())
    }
}

/// Hands out unique ports from one or more disjoint ranges.
///
/// Cloning is cheap and yields a handle to the same allocator.
#[derive(Debug, Clone, Default)]
pub struct PortAllocator {
    slots: Arc<Mutex<Vec<RangeSlots>>>,
}

impl PortAllocator {
    /// Create an allocator with no ranges.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a range. Fails if it overlaps a registered one.
    pub fn add_range(&self, range: PortRange) -> Result<RangeId> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = slots.iter().find(|s| s.range.overlaps(&range)) {
            return Err(Error::Config(format!(
                "port range {} overlaps {}",
                range, existing.range
            )));
        }
        slots.push(RangeSlots {
            range,
            allocated: BTreeSet::new(),
            last: None,
        });
        Ok(RangeId(slots.len() - 1))
    }

    /// Allocate the next free port of a range.
    ///
    /// The scan starts after the most recent allocation and wraps to the
    /// start of the range, so freed ports are reused only after the rest
    /// of the range has been tried.
    pub fn allocate(&self, id: RangeId) -> Result<PortHandle> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let range_slots = slots
            .get_mut(id.0)
            .ok_or_else(|| Error::Other(format!("unknown port range id {}", id.0)))?;

        let range = range_slots.range;
        let mut candidate = range_slots.first_candidate();
        for _ in 0..range.capacity() {
            if range_slots.allocated.insert(candidate) {
                range_slots.last = Some(candidate);
                debug!(port = candidate, range = %range, "Allocated port");
                return Ok(PortHandle {
                    value: candidate,
                    range: id,
                    allocator: self.clone(),
                    freed: false,
                });
            }
            candidate = range.next_after(candidate).unwrap_or(range.start());
        }

        Err(Error::PortsExhausted(range))
    }

    /// Release a handle's port.
    ///
    /// Releasing a handle twice, or a handle from another allocator, is an
    /// error.
    pub fn free(&self, handle: &mut PortHandle) -> Result<()> {
        if handle.freed || !Arc::ptr_eq(&self.slots, &handle.allocator.slots) {
            return Err(Error::PortNotAllocated(handle.value));
        }
        self.release_slot(handle.range, handle.value)?;
        handle.freed = true;
        Ok(())
    }

    fn release_slot(&self, id: RangeId, port: u16) -> Result<()> {
        let mut slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        let removed = slots
            .get_mut(id.0)
            .map(|s| s.allocated.remove(&port))
            .unwrap_or(false);
        if removed {
            debug!(port, "Released port");
            Ok(())
        } else {
            Err(Error::PortNotAllocated(port))
        }
    }

    /// Number of ports currently allocated from a range.
    pub fn allocated_count(&self, id: RangeId) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.get(id.0).map_or(0, |s| s.allocated.len())
    }

    /// Number of free ports left in a range.
    pub fn available_count(&self, id: RangeId) -> usize {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots
            .get(id.0)
            .map_or(0, |s| s.range.capacity() - s.allocated.len())
    }

    /// Check whether a port is held by any range.
    pub fn is_allocated(&self, port: u16) -> bool {
        let slots = self.slots.lock().unwrap_or_else(|e| e.into_inner());
        slots.iter().any(|s| s.allocated.contains(&port))
    }
}

/// One allocated port. Returned to its allocator when dropped unless it
/// was freed explicitly.
#[derive(Debug)]
pub struct PortHandle {
    value: u16,
    range: RangeId,
    allocator: PortAllocator,
    freed: bool,
}

impl PortHandle {
    /// The port number.
    pub fn value(&self) -> u16 {
        self.value
    }

    /// Whether the port has been given back.
    pub fn is_freed(&self) -> bool {
        self.freed
    }

    /// Give the port back now.
    pub fn release(&mut self) -> Result<()> {
        let allocator = self.allocator.clone();
        allocator.free(self)
    }
}

impl Drop for PortHandle {
    fn drop(&mut self) {
        if self.freed {
            return;
        }
        if let Err(e) = self.allocator.release_slot(self.range, self.value) {
            warn!(port = self.value, error = %e, "Failed to release port on drop");
        }
        self.freed = true;
    }
}

/// The telnet and GDB ranges every simulator instance draws from.
#[derive(Debug, Clone)]
pub struct SimulatorPorts {
    allocator: PortAllocator,
    telnet: RangeId,
    gdb: RangeId,
}

impl SimulatorPorts {
    /// Build a fresh allocator from port settings.
    pub fn new(settings: &PortSettings) -> Result<Self> {
        Self::with_ranges(settings.telnet, settings.gdb)
    }

    /// Build a fresh allocator from explicit ranges.
    pub fn with_ranges(telnet: PortRange, gdb: PortRange) -> Result<Self> {
        let allocator = PortAllocator::new();
        let telnet = allocator.add_range(telnet)?;
        let gdb = allocator.add_range(gdb)?;
        Ok(Self {
            allocator,
            telnet,
            gdb,
        })
    }

    /// Process-wide allocator over the default ranges.
    pub fn global() -> Self {
        GLOBAL_PORTS.clone()
    }

    /// Allocate a telnet terminal start port.
    pub fn allocate_telnet(&self) -> Result<PortHandle> {
        self.allocator.allocate(self.telnet)
    }

    /// Allocate a GDB server port.
    pub fn allocate_gdb(&self) -> Result<PortHandle> {
        self.allocator.allocate(self.gdb)
    }

    /// The underlying allocator.
    pub fn allocator(&self) -> &PortAllocator {
        &self.allocator
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocator(start: u16, end: u16, step: u16) -> (PortAllocator, RangeId) {
        let allocator = PortAllocator::new();
        let id = allocator
            .add_range(PortRange::new(start, end, step).unwrap())
            .unwrap();
        (allocator, id)
    }

    #[test]
    fn test_allocate_until_exhausted() {
        let (allocator, id) = allocator(13400, 13403, 1);

        let a = allocator.allocate(id).unwrap();
        let b = allocator.allocate(id).unwrap();
        let c = allocator.allocate(id).unwrap();
        assert_eq!((a.value(), b.value(), c.value()), (13400, 13401, 13402));

        let err = allocator.allocate(id).unwrap_err();
        assert!(matches!(err, Error::PortsExhausted(_)));
    }

    #[test]
    fn test_freed_port_reused_on_wraparound() {
        let (allocator, id) = allocator(13400, 13403, 1);
        let _a = allocator.allocate(id).unwrap();
        let mut b = allocator.allocate(id).unwrap();
        let _c = allocator.allocate(id).unwrap();

        allocator.free(&mut b).unwrap();
        assert_eq!(allocator.allocate(id).unwrap().value(), 13401);
    }

    #[test]
    fn test_forward_progress_after_free() {
        let (allocator, id) = allocator(13400, 13410, 1);
        let mut first = allocator.allocate(id).unwrap();
        allocator.free(&mut first).unwrap();

        let second = allocator.allocate(id).unwrap();
        assert_eq!(second.value(), 13401);
    }

    #[test]
    fn test_step_is_respected() {
        let (allocator, id) = allocator(5000, 5012, 4);
        let handles: Vec<PortHandle> = (0..3).map(|_| allocator.allocate(id).unwrap()).collect();
        let ports: Vec<u16> = handles.iter().map(PortHandle::value).collect();
        assert_eq!(ports, vec![5000, 5004, 5008]);
        assert!(allocator.allocate(id).is_err());
    }

    #[test]
    fn test_double_free_is_error() {
        let (allocator, id) = allocator(13400, 13405, 1);
        let mut handle = allocator.allocate(id).unwrap();
        allocator.free(&mut handle).unwrap();

        let err = allocator.free(&mut handle).unwrap_err();
        assert!(matches!(err, Error::PortNotAllocated(13400)));
        assert!(handle.release().is_err());
    }

    #[test]
    fn test_free_from_other_allocator_is_error() {
        let (first, first_id) = allocator(13400, 13405, 1);
        let (second, _) = allocator(13400, 13405, 1);
        let mut handle = first.allocate(first_id).unwrap();

        assert!(second.free(&mut handle).is_err());
        assert!(!handle.is_freed());
        assert!(first.free(&mut handle).is_ok());
    }

    #[test]
    fn test_drop_releases_port() {
        let (allocator, id) = allocator(13400, 13402, 1);
        {
            let _a = allocator.allocate(id).unwrap();
            let _b = allocator.allocate(id).unwrap();
            assert_eq!(allocator.available_count(id), 0);
        }
        assert_eq!(allocator.allocated_count(id), 0);
        assert_eq!(allocator.available_count(id), 2);
    }

    #[test]
    fn test_overlapping_range_rejected() {
        let (allocator, _) = allocator(5000, 6000, 1);
        assert!(allocator
            .add_range(PortRange::new(5999, 7000, 1).unwrap())
            .is_err());
        assert!(allocator
            .add_range(PortRange::new(6000, 7000, 1).unwrap())
            .is_ok());
    }

    #[test]
    fn test_simulator_ports_use_separate_ranges() {
        let ports = SimulatorPorts::with_ranges(
            PortRange::new(5000, 5008, 4).unwrap(),
            PortRange::new(6000, 6002, 1).unwrap(),
        )
        .unwrap();
        let telnet = ports.allocate_telnet().unwrap();
        let gdb = ports.allocate_gdb().unwrap();
        assert_eq!(telnet.value(), 5000);
        assert_eq!(gdb.value(), 6000);
        assert!(ports.allocator().is_allocated(5000));
        assert!(ports.allocator().is_allocated(6000));
    }

    #[test]
    fn test_concurrent_allocation_unique() {
        let (allocator, id) = allocator(20000, 20400, 1);
        let threads: Vec<_> = (0..8)
            .map(|_| {
                let allocator = allocator.clone();
                std::thread::spawn(move || {
                    (0..50)
                        .map(|_| allocator.allocate(id).unwrap())
                        .collect::<Vec<_>>()
                })
            })
            .collect();

        let mut handles = Vec::new();
        for t in threads {
            handles.extend(t.join().unwrap());
        }
        let unique: BTreeSet<u16> = handles.iter().map(PortHandle::value).collect();
        assert_eq!(unique.len(), 400);
        assert!(allocator.allocate(id).is_err());
    }
}
